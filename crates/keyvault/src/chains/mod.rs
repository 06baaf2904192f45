//! Per-family address codecs.
//!
//! Both supported families hash the uncompressed secp256k1 public key with Keccak-256 and keep
//! the last 20 bytes; they differ only in how those bytes are rendered and checksummed.

pub mod evm;
pub mod tron;

use crate::{errors::VaultError, wallet::KeyType};
use alloy::primitives::keccak256;
use k256::elliptic_curve::sec1::ToEncodedPoint as _;

/// Keccak-256 account hash (last 20 bytes) of the public key for `secret`.
///
/// Fails with `UnrecognizedInput` if `secret` is not a valid secp256k1 scalar (zero or >= n).
pub fn account_hash(secret: &[u8; 32]) -> Result<[u8; 20], VaultError> {
    let Ok(sk) = k256::SecretKey::from_slice(secret) else {
        return Err(VaultError::UnrecognizedInput);
    };
    let point = sk.public_key().to_encoded_point(false);
    let Some(xy) = point.as_bytes().get(1..) else {
        return Err(VaultError::UnrecognizedInput);
    };
    let digest = keccak256(xy);
    let mut out = [0_u8; 20];
    let Some(tail) = digest.as_slice().get(12..) else {
        return Err(VaultError::UnrecognizedInput);
    };
    out.copy_from_slice(tail);
    Ok(out)
}

/// Canonical address for `secret` in the given family (checksum already applied).
pub fn address_from_secret(key_type: KeyType, secret: &[u8; 32]) -> Result<String, VaultError> {
    let hash = account_hash(secret)?;
    Ok(match key_type {
        KeyType::Evm => evm::checksum_address(&hash),
        KeyType::Tron => tron::encode_address(&hash),
    })
}

/// Historical spellings of a canonical address that older records may still carry.
pub fn legacy_forms(key_type: KeyType, canonical: &str) -> Vec<String> {
    match key_type {
        KeyType::Evm => {
            let lower = canonical.to_ascii_lowercase();
            if lower == canonical {
                vec![]
            } else {
                vec![lower]
            }
        }
        KeyType::Tron => vec![],
    }
}

pub(crate) fn is_hex(s: &str) -> bool {
    s.bytes().all(|b| b.is_ascii_hexdigit())
}
