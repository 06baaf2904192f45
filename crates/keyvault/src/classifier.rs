//! Classifies pasted text as a private key or an address of a supported family.
//!
//! Checks run in a fixed order, each behind a cheap shape test, and the family is fully decided
//! before any normalization happens.

use crate::{
    chains::{evm, tron},
    derivation::{DerivationEngine, PrivateKey},
    errors::VaultError,
    wallet::KeyType,
};
use std::fmt;

pub enum Classification {
    PrivateKey {
        key_type: KeyType,
        key: PrivateKey,
        address: String,
    },
    Address {
        key_type: KeyType,
        address: String,
    },
    Unrecognized,
}

impl fmt::Debug for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PrivateKey {
                key_type, address, ..
            } => f
                .debug_struct("PrivateKey")
                .field("key_type", key_type)
                .field("address", address)
                .finish_non_exhaustive(),
            Self::Address { key_type, address } => f
                .debug_struct("Address")
                .field("key_type", key_type)
                .field("address", address)
                .finish(),
            Self::Unrecognized => f.write_str("Unrecognized"),
        }
    }
}

fn private_key(
    engine: &DerivationEngine,
    key_type: KeyType,
    key: PrivateKey,
) -> Result<Classification, VaultError> {
    match engine.derive_address(&key, key_type) {
        Ok(address) => Ok(Classification::PrivateKey {
            key_type,
            key,
            address,
        }),
        // Right shape, but not a usable secp256k1 scalar.
        Err(VaultError::UnrecognizedInput) => Ok(Classification::Unrecognized),
        Err(e) => Err(e),
    }
}

/// Classify free-form input. Only a well-formed value with a bad checksum is an error; anything
/// that matches no format is `Unrecognized`.
pub fn classify(engine: &DerivationEngine, raw: &str) -> Result<Classification, VaultError> {
    let s = raw.trim();

    if evm::looks_like_private_key(s) {
        let key = evm::parse_private_key(s)?;
        return private_key(engine, KeyType::Evm, key);
    }

    if evm::looks_like_address(s) {
        let address = evm::parse_address(s)?;
        return Ok(Classification::Address {
            key_type: KeyType::Evm,
            address,
        });
    }

    if tron::looks_like_address(s) {
        match tron::parse_address(s) {
            Ok(address) => {
                return Ok(Classification::Address {
                    key_type: KeyType::Tron,
                    address,
                })
            }
            Err(VaultError::ChecksumMismatch) => return Err(VaultError::ChecksumMismatch),
            Err(_) => {}
        }
    }

    if tron::looks_like_private_key(s) {
        let key = tron::parse_private_key(s)?;
        return private_key(engine, KeyType::Tron, key);
    }

    Ok(Classification::Unrecognized)
}
