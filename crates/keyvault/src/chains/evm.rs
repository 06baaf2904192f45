use super::is_hex;
use crate::errors::VaultError;
use alloy::primitives::Address;
use std::str::FromStr as _;
use zeroize::Zeroizing;

const PREFIX: &str = "0x";
const ADDRESS_HEX_LEN: usize = 40;
const PRIVATE_KEY_HEX_LEN: usize = 64;

/// EIP-55 rendering of a 20-byte account hash.
pub fn checksum_address(hash: &[u8; 20]) -> String {
    Address::from(*hash).to_checksum(None)
}

fn strip_prefix(s: &str) -> Option<&str> {
    s.strip_prefix(PREFIX)
}

pub fn looks_like_address(s: &str) -> bool {
    strip_prefix(s).is_some_and(|h| h.len() == ADDRESS_HEX_LEN && is_hex(h))
}

pub fn looks_like_private_key(s: &str) -> bool {
    strip_prefix(s).is_some_and(|h| h.len() == PRIVATE_KEY_HEX_LEN && is_hex(h))
}

/// Mixed case means the writer applied EIP-55; single-case input carries no checksum.
fn carries_checksum(hex_part: &str) -> bool {
    let has_upper = hex_part.bytes().any(|b| b.is_ascii_uppercase());
    let has_lower = hex_part.bytes().any(|b| b.is_ascii_lowercase());
    has_upper && has_lower
}

/// Parse an `0x`-prefixed address, verifying EIP-55 when present, and return the checksummed form.
pub fn parse_address(s: &str) -> Result<String, VaultError> {
    let Some(hex_part) = strip_prefix(s) else {
        return Err(VaultError::UnrecognizedInput);
    };
    if hex_part.len() != ADDRESS_HEX_LEN || !is_hex(hex_part) {
        return Err(VaultError::UnrecognizedInput);
    }
    let addr = if carries_checksum(hex_part) {
        let Ok(a) = Address::parse_checksummed(s, None) else {
            return Err(VaultError::ChecksumMismatch);
        };
        a
    } else {
        let Ok(a) = Address::from_str(s) else {
            return Err(VaultError::UnrecognizedInput);
        };
        a
    };
    Ok(addr.to_checksum(None))
}

/// Decode an `0x` + 64 hex private key into a zeroizing buffer.
pub fn parse_private_key(s: &str) -> Result<Zeroizing<[u8; 32]>, VaultError> {
    let Some(hex_part) = strip_prefix(s) else {
        return Err(VaultError::UnrecognizedInput);
    };
    decode_key_hex(hex_part)
}

pub(crate) fn decode_key_hex(hex_part: &str) -> Result<Zeroizing<[u8; 32]>, VaultError> {
    let mut out = Zeroizing::new([0_u8; 32]);
    if hex_part.len() != PRIVATE_KEY_HEX_LEN
        || hex::decode_to_slice(hex_part, out.as_mut_slice()).is_err()
    {
        return Err(VaultError::UnrecognizedInput);
    }
    Ok(out)
}
