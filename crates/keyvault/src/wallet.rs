use crate::errors::VaultError;
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

/// Chain family tag. Each family has its own address format, checksum rules and HD coin type.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum KeyType {
    Evm,
    Tron,
}

impl KeyType {
    pub const ALL: &'static [Self] = &[Self::Evm, Self::Tron];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Evm => "evm",
            Self::Tron => "tron",
        }
    }

    /// SLIP-44 coin type used at the second (hardened) level of the BIP-44 path.
    pub const fn coin_type(self) -> u32 {
        match self {
            Self::Evm => 60,
            Self::Tron => 195,
        }
    }

    /// Address written over a scrubbed row on soft delete.
    pub const fn burn_address(self) -> &'static str {
        match self {
            Self::Evm => "0x000000000000000000000000000000000000dEaD",
            Self::Tron => "T9yD14Nj9j7xAB4dbGeiX9h8unkKHxuWwb",
        }
    }

    /// Credential written over a scrubbed row on soft delete. Never decrypts.
    pub const fn burn_credential(self) -> &'static str {
        match self {
            Self::Evm => "burned:evm",
            Self::Tron => "burned:tron",
        }
    }
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KeyType {
    type Err = VaultError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "evm" => Ok(Self::Evm),
            "tron" => Ok(Self::Tron),
            other => Err(VaultError::UnsupportedKeyType(other.to_owned())),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EntryOrigin {
    Imported,
    Derived,
    WatchOnly,
}

/// Sealed (encrypted) private key as persisted: base64 of `version || nonce || ciphertext`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct SealedCredential(pub String);

impl SealedCredential {
    pub fn burned(key_type: KeyType) -> Self {
        Self(key_type.burn_credential().to_owned())
    }

    pub fn is_burned(&self) -> bool {
        KeyType::ALL
            .iter()
            .any(|kt| self.0 == kt.burn_credential())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WalletEntry {
    pub id: String,
    pub address: String,
    pub origin: EntryOrigin,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted_credential: Option<SealedCredential>,
    pub key_type: KeyType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub derivation_index: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_index: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_selected: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_deleted: Option<bool>,
    pub created_at: String,
    pub updated_at: String,
}

impl WalletEntry {
    pub fn deleted(&self) -> bool {
        self.is_deleted == Some(true)
    }

    pub fn selected(&self) -> bool {
        self.is_selected == Some(true)
    }

    pub const fn has_credential(&self) -> bool {
        self.encrypted_credential.is_some()
    }

    /// Deleted row whose address or credential was overwritten on delete. It no longer stands
    /// for any real wallet, even though its address is a valid one.
    pub fn is_scrubbed(&self) -> bool {
        self.deleted()
            && (self.address == self.key_type.burn_address()
                || self
                    .encrypted_credential
                    .as_ref()
                    .is_some_and(SealedCredential::is_burned))
    }

    pub fn state(&self) -> EntryState {
        match (self.deleted(), self.origin) {
            (false, EntryOrigin::WatchOnly) => EntryState::WatchOnlyActive,
            (false, EntryOrigin::Imported) => EntryState::ImportedActive,
            (false, EntryOrigin::Derived) => EntryState::DerivedActive,
            (true, EntryOrigin::WatchOnly) => EntryState::DeletedWatchOnly,
            (true, EntryOrigin::Imported) => EntryState::DeletedImported,
            (true, EntryOrigin::Derived) => EntryState::DeletedDerived,
        }
    }
}

/// Lifecycle state of a (key type, canonical address) pair.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EntryState {
    Absent,
    WatchOnlyActive,
    ImportedActive,
    DerivedActive,
    DeletedWatchOnly,
    DeletedImported,
    DeletedDerived,
}

impl EntryState {
    pub const fn is_active(self) -> bool {
        matches!(
            self,
            Self::WatchOnlyActive | Self::ImportedActive | Self::DerivedActive
        )
    }
}

/// Row handed to the store on insert; the store assigns `id` and timestamps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewEntry {
    pub address: String,
    pub origin: EntryOrigin,
    pub encrypted_credential: Option<SealedCredential>,
    pub key_type: KeyType,
    pub derivation_index: Option<u32>,
    pub order_index: Option<i64>,
}

/// Partial update. Outer `None` leaves a field untouched; `Some(None)` clears a nullable field.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntryPatch {
    pub address: Option<String>,
    pub origin: Option<EntryOrigin>,
    pub encrypted_credential: Option<Option<SealedCredential>>,
    pub derivation_index: Option<Option<u32>>,
    pub order_index: Option<Option<i64>>,
    pub is_selected: Option<bool>,
    pub is_deleted: Option<bool>,
}

impl EntryPatch {
    pub const fn is_empty(&self) -> bool {
        self.address.is_none()
            && self.origin.is_none()
            && self.encrypted_credential.is_none()
            && self.derivation_index.is_none()
            && self.order_index.is_none()
            && self.is_selected.is_none()
            && self.is_deleted.is_none()
    }

    pub fn apply_to(&self, e: &mut WalletEntry) {
        if let Some(a) = &self.address {
            a.clone_into(&mut e.address);
        }
        if let Some(o) = self.origin {
            e.origin = o;
        }
        if let Some(c) = &self.encrypted_credential {
            e.encrypted_credential.clone_from(c);
        }
        if let Some(i) = self.derivation_index {
            e.derivation_index = i;
        }
        if let Some(o) = self.order_index {
            e.order_index = o;
        }
        if let Some(s) = self.is_selected {
            e.is_selected = Some(s);
        }
        if let Some(d) = self.is_deleted {
            e.is_deleted = Some(d);
        }
    }
}

/// Next-derivation-index counter for one key type. Only ever increases.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct DerivationCounter {
    pub key_type: KeyType,
    pub next_index: u32,
}
