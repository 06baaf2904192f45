//! Credential cipher: AES-256-GCM sealing of private keys under the owner's key, plus the
//! key-derivation helpers the local identity provider uses to obtain that owner key.

use crate::{errors::VaultError, wallet::SealedCredential};
use aes_gcm::{
    aead::{Aead as _, KeyInit as _},
    Aes256Gcm, Nonce,
};
use argon2::{
    password_hash::{PasswordHasher as _, SaltString},
    Algorithm, Argon2, Params, Version,
};
use base64::Engine as _;
use hkdf::Hkdf;
use rand::Rng as _;
use secrecy::{ExposeSecret as _, SecretString};
use sha2::Sha256;
use std::fmt;
use zeroize::Zeroizing;

/// Blob layout version: `version(1) || nonce(12) || ciphertext || tag(16)`.
pub const CREDENTIAL_VERSION: u8 = 1;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// The owner's symmetric key. Opaque to the cipher, wiped on drop, never printed.
pub struct OwnerKey(Zeroizing<[u8; 32]>);

impl OwnerKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(Zeroizing::new(bytes))
    }

    fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for OwnerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("OwnerKey(..)")
    }
}

pub fn fill_random(buf: &mut [u8]) {
    let mut rng = rand::rng();
    rng.fill_bytes(buf);
}

pub fn random_salt16() -> [u8; 16] {
    let mut s = [0_u8; 16];
    fill_random(&mut s);
    s
}

/// Seal `plaintext` under `owner`. A fresh random nonce is drawn for every call.
pub fn seal_credential(owner: &OwnerKey, plaintext: &[u8]) -> Result<SealedCredential, VaultError> {
    let cipher =
        Aes256Gcm::new_from_slice(owner.as_bytes()).map_err(|e| {
            tracing::error!(error = %e, "aes init");
            VaultError::EncryptionFailed
        })?;
    let mut nonce = [0_u8; NONCE_LEN];
    fill_random(&mut nonce);
    let ct = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|e| {
            tracing::error!(error = %e, "aes encrypt");
            VaultError::EncryptionFailed
        })?;

    let mut blob = Vec::with_capacity(1 + NONCE_LEN + ct.len());
    blob.push(CREDENTIAL_VERSION);
    blob.extend_from_slice(&nonce);
    blob.extend_from_slice(&ct);
    Ok(SealedCredential(
        base64::engine::general_purpose::STANDARD.encode(blob),
    ))
}

/// Open a sealed credential. Any failure (bad encoding, truncation, unknown version, tag
/// mismatch, sentinel value) is reported as the same `CorruptOrWrongKey`.
pub fn open_credential(
    owner: &OwnerKey,
    sealed: &SealedCredential,
) -> Result<Zeroizing<Vec<u8>>, VaultError> {
    if sealed.is_burned() {
        return Err(VaultError::CorruptOrWrongKey);
    }
    let Ok(blob) = base64::engine::general_purpose::STANDARD.decode(&sealed.0) else {
        return Err(VaultError::CorruptOrWrongKey);
    };
    if blob.len() < 1 + NONCE_LEN + TAG_LEN || blob.first() != Some(&CREDENTIAL_VERSION) {
        return Err(VaultError::CorruptOrWrongKey);
    }
    let (nonce, ct) = match (blob.get(1..=NONCE_LEN), blob.get(1 + NONCE_LEN..)) {
        (Some(n), Some(c)) => (n, c),
        _ => return Err(VaultError::CorruptOrWrongKey),
    };
    let Ok(cipher) = Aes256Gcm::new_from_slice(owner.as_bytes()) else {
        return Err(VaultError::CorruptOrWrongKey);
    };
    cipher
        .decrypt(Nonce::from_slice(nonce), ct)
        .map(Zeroizing::new)
        .map_err(|e| {
            tracing::debug!(error = %e, "credential rejected");
            VaultError::CorruptOrWrongKey
        })
}

/// Argon2id over a user passphrase. Used when the owner key is passphrase-derived.
pub fn derive_passphrase_key(
    passphrase: &SecretString,
    salt16: &[u8; 16],
) -> eyre::Result<[u8; 32]> {
    // Freeze Argon2id parameters to avoid accidental changes across dependency updates.
    // These match `argon2::Params::DEFAULT` in argon2 0.5.x.
    let params =
        Params::new(19 * 1024, 2, 1, Some(32)).map_err(|e| eyre::eyre!("argon2 params: {e}"))?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
    let salt = SaltString::encode_b64(salt16).map_err(|e| eyre::eyre!("encode salt: {e}"))?;
    let mut out = [0_u8; 32];

    let hash = argon2
        .hash_password(passphrase.expose_secret().as_bytes(), &salt)
        .map_err(|e| eyre::eyre!("argon2 hash: {e}"))?;
    let bytes = hash
        .hash
        .ok_or_else(|| eyre::eyre!("argon2 missing hash"))?;
    let Some(prefix) = bytes.as_bytes().get(..32) else {
        eyre::bail!("argon2 hash too short");
    };
    out.copy_from_slice(prefix);
    Ok(out)
}

/// HKDF-SHA256 subkey bound to a purpose label.
pub fn derive_subkey(master: &[u8; 32], purpose: &str) -> eyre::Result<[u8; 32]> {
    let hk = Hkdf::<Sha256>::new(None, master);
    let info = format!("keyvault:{purpose}");
    let mut out = [0_u8; 32];
    hk.expand(info.as_bytes(), &mut out)
        .map_err(|e| eyre::eyre!("hkdf expand: {e}"))?;
    Ok(out)
}
