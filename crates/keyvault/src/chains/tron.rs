use super::is_hex;
use crate::errors::VaultError;
use sha2::{Digest as _, Sha256};
use zeroize::Zeroizing;

/// Mainnet version byte; renders as a leading `T` in base58.
const VERSION: u8 = 0x41;
const ADDRESS_LEN: usize = 34;
const DECODED_LEN: usize = 25;
const PRIVATE_KEY_HEX_LEN: usize = 64;
const BASE58_ALPHABET: &str = "123456789ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz";

fn checksum(payload: &[u8]) -> [u8; 4] {
    let first = Sha256::digest(payload);
    let second = Sha256::digest(first);
    let mut out = [0_u8; 4];
    if let Some(head) = second.get(..4) {
        out.copy_from_slice(head);
    }
    out
}

/// Base58check rendering of a 20-byte account hash.
pub fn encode_address(hash: &[u8; 20]) -> String {
    let mut buf = Vec::with_capacity(DECODED_LEN);
    buf.push(VERSION);
    buf.extend_from_slice(hash);
    let sum = checksum(&buf);
    buf.extend_from_slice(&sum);
    bs58::encode(buf).into_string()
}

pub fn looks_like_address(s: &str) -> bool {
    s.len() == ADDRESS_LEN && s.starts_with('T') && s.chars().all(|c| BASE58_ALPHABET.contains(c))
}

/// Accepts 64 hex chars with an optional `0x` prefix.
pub fn looks_like_private_key(s: &str) -> bool {
    let h = s.strip_prefix("0x").unwrap_or(s);
    h.len() == PRIVATE_KEY_HEX_LEN && is_hex(h)
}

/// Validate a base58check address. A well-formed address whose checksum does not verify is
/// reported as `ChecksumMismatch` so callers can tell a typo from a wrong format.
pub fn parse_address(s: &str) -> Result<String, VaultError> {
    if !looks_like_address(s) {
        return Err(VaultError::UnrecognizedInput);
    }
    let Ok(raw) = bs58::decode(s).into_vec() else {
        return Err(VaultError::UnrecognizedInput);
    };
    if raw.len() != DECODED_LEN || raw.first() != Some(&VERSION) {
        return Err(VaultError::UnrecognizedInput);
    }
    let (payload, sum) = raw.split_at(DECODED_LEN - 4);
    if checksum(payload) != sum {
        return Err(VaultError::ChecksumMismatch);
    }
    Ok(s.to_owned())
}

pub fn parse_private_key(s: &str) -> Result<Zeroizing<[u8; 32]>, VaultError> {
    super::evm::decode_key_hex(s.strip_prefix("0x").unwrap_or(s))
}
