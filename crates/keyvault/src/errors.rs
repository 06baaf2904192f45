use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

/// A structured error suitable for printing to a CLI consumer as JSON.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorReport {
    pub code: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub data: Value,
}

impl ErrorReport {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: Value::Null,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VaultError {
    #[error("invalid mnemonic")]
    InvalidMnemonic,

    #[error("derivation index out of range: {0}")]
    IndexOutOfRange(u64),

    #[error("key derivation failed: {0}")]
    DerivationFailed(String),

    #[error("unsupported key type: {0}")]
    UnsupportedKeyType(String),

    #[error("unrecognized input: expected an address or private key")]
    UnrecognizedInput,

    #[error("checksum mismatch, possible typo")]
    ChecksumMismatch,

    #[error("address is already a watch-only wallet")]
    AlreadyWatchOnly,

    #[error("wallet already holds a private key for this address")]
    AlreadyHasCredential,

    #[error("refusing to replace a wallet that holds a private key with a watch-only address")]
    CapabilityDowngradeRefused,

    #[error("wallet is watch-only and holds no private key")]
    NoSigningCapability,

    #[error("encryption failed")]
    EncryptionFailed,

    /// Deliberately generic: callers must not learn whether the key or the data was wrong.
    #[error("failed to decrypt")]
    CorruptOrWrongKey,

    #[error("store constraint violation: {0}")]
    StoreConstraintViolation(String),

    #[error("position out of range: {position} (len {len})")]
    IndexRange { position: usize, len: usize },

    #[error("wallet entry not found: {0}")]
    EntryNotFound(String),

    #[error("vault busy")]
    VaultBusy,

    #[error("identity unavailable: {0}")]
    IdentityUnavailable(String),

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
}

impl VaultError {
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidMnemonic => "invalid_mnemonic",
            Self::IndexOutOfRange(_) => "index_out_of_range",
            Self::DerivationFailed(_) => "derivation_failed",
            Self::UnsupportedKeyType(_) => "unsupported_key_type",
            Self::UnrecognizedInput => "unrecognized_input",
            Self::ChecksumMismatch => "checksum_mismatch",
            Self::AlreadyWatchOnly => "already_watch_only",
            Self::AlreadyHasCredential => "already_has_credential",
            Self::CapabilityDowngradeRefused => "capability_downgrade_refused",
            Self::NoSigningCapability => "no_signing_capability",
            Self::EncryptionFailed => "encryption_failed",
            Self::CorruptOrWrongKey => "corrupt_or_wrong_key",
            Self::StoreConstraintViolation(_) => "store_constraint_violation",
            Self::IndexRange { .. } => "index_range",
            Self::EntryNotFound(_) => "entry_not_found",
            Self::VaultBusy => "vault_busy",
            Self::IdentityUnavailable(_) => "identity_unavailable",
            Self::StoreUnavailable(_) => "store_unavailable",
        }
    }

    /// Everything except a missing/unreachable backing store is an expected decision point.
    pub const fn is_exceptional(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_))
    }
}

impl From<VaultError> for ErrorReport {
    fn from(e: VaultError) -> Self {
        let mut report = Self::new(e.code(), e.to_string());
        if let VaultError::IndexRange { position, len } = e {
            report.data = serde_json::json!({ "position": position, "len": len });
        }
        report
    }
}
