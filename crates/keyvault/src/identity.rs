//! Where the vault gets the user's mnemonic and owner key from.

use crate::{
    config::{OwnerKeySource, VaultConfig},
    errors::VaultError,
    fsutil,
    keystore::crypto::{self, OwnerKey},
    paths::VaultPaths,
};
use secrecy::{ExposeSecret as _, SecretString};
use zeroize::Zeroizing;

pub trait IdentityProvider: Send + Sync {
    fn mnemonic(&self) -> Result<SecretString, VaultError>;

    /// Optional BIP-39 passphrase ("25th word"). Empty when unused.
    fn bip39_passphrase(&self) -> Result<SecretString, VaultError>;

    fn owner_key(&self) -> Result<OwnerKey, VaultError>;
}

/// Fixed in-memory identity.
#[cfg(test)]
pub struct StaticIdentity {
    mnemonic: SecretString,
    passphrase: SecretString,
    owner: Zeroizing<[u8; 32]>,
}

#[cfg(test)]
impl StaticIdentity {
    pub fn new(mnemonic: &str, passphrase: &str, owner: [u8; 32]) -> Self {
        Self {
            mnemonic: SecretString::new(mnemonic.to_owned().into()),
            passphrase: SecretString::new(passphrase.to_owned().into()),
            owner: Zeroizing::new(owner),
        }
    }
}

#[cfg(test)]
impl IdentityProvider for StaticIdentity {
    fn mnemonic(&self) -> Result<SecretString, VaultError> {
        Ok(self.mnemonic.clone())
    }

    fn bip39_passphrase(&self) -> Result<SecretString, VaultError> {
        Ok(self.passphrase.clone())
    }

    fn owner_key(&self) -> Result<OwnerKey, VaultError> {
        Ok(OwnerKey::from_bytes(*self.owner))
    }
}

fn unavailable(what: &str, e: &dyn std::fmt::Display) -> VaultError {
    tracing::warn!(error = %e, what, "identity lookup failed");
    VaultError::IdentityUnavailable(format!("{what}: {e}"))
}

fn secret_from_env(var: &str) -> Option<SecretString> {
    std::env::var(var)
        .ok()
        .filter(|s| !s.trim().is_empty())
        .map(|s| SecretString::new(s.into()))
}

fn prompt(label: &str) -> Result<SecretString, VaultError> {
    let s = rpassword::prompt_password(label).map_err(|e| unavailable("prompt", &e))?;
    Ok(SecretString::new(s.into()))
}

/// Identity backed by the local machine: environment variables first, then a hidden prompt.
pub struct LocalIdentity {
    paths: VaultPaths,
    source: OwnerKeySource,
    salt: Option<[u8; 16]>,
}

impl LocalIdentity {
    /// `cfg` must already carry a passphrase salt when the owner key is passphrase-derived.
    pub fn new(paths: VaultPaths, cfg: &VaultConfig) -> eyre::Result<Self> {
        Ok(Self {
            paths,
            source: cfg.owner_key_source,
            salt: cfg.passphrase_salt()?,
        })
    }

    fn machine_secret(&self) -> Result<Zeroizing<[u8; 32]>, VaultError> {
        let p = self.paths.machine_secret_path();
        let read = || -> eyre::Result<Option<Zeroizing<[u8; 32]>>> {
            let Some(buf) = fsutil::read_private(&p)?.map(Zeroizing::new) else {
                return Ok(None);
            };
            let Some(bytes) = buf.get(..32).filter(|_| buf.len() == 32) else {
                eyre::bail!("machine secret wrong length");
            };
            let mut out = Zeroizing::new([0_u8; 32]);
            out.copy_from_slice(bytes);
            Ok(Some(out))
        };

        if let Some(s) = read().map_err(|e| unavailable("machine secret", &e))? {
            return Ok(s);
        }
        let mut fresh = Zeroizing::new([0_u8; 32]);
        crypto::fill_random(fresh.as_mut_slice());
        let created = fsutil::create_new_restrictive(&p, fresh.as_slice(), fsutil::MODE_FILE_PRIVATE)
            .map_err(|e| unavailable("machine secret", &e))?;
        if created {
            tracing::info!(path = %p.display(), "created machine secret");
            return Ok(fresh);
        }
        // Lost a creation race; use the winner's secret.
        read()
            .map_err(|e| unavailable("machine secret", &e))?
            .ok_or_else(|| VaultError::IdentityUnavailable("machine secret vanished".into()))
    }
}

impl IdentityProvider for LocalIdentity {
    fn mnemonic(&self) -> Result<SecretString, VaultError> {
        match secret_from_env("KEYVAULT_MNEMONIC") {
            Some(s) => Ok(s),
            None => prompt("Mnemonic: "),
        }
    }

    fn bip39_passphrase(&self) -> Result<SecretString, VaultError> {
        Ok(secret_from_env("KEYVAULT_BIP39_PASSPHRASE")
            .unwrap_or_else(|| SecretString::new(String::new().into())))
    }

    fn owner_key(&self) -> Result<OwnerKey, VaultError> {
        match self.source {
            OwnerKeySource::Machine => {
                let secret = self.machine_secret()?;
                let key = crypto::derive_subkey(&secret, "owner-key")
                    .map_err(|e| unavailable("owner key", &e))?;
                Ok(OwnerKey::from_bytes(key))
            }
            OwnerKeySource::Passphrase => {
                let Some(salt) = self.salt else {
                    return Err(VaultError::IdentityUnavailable(
                        "passphrase salt not initialized".into(),
                    ));
                };
                let passphrase = match secret_from_env("KEYVAULT_PASSPHRASE") {
                    Some(s) => s,
                    None => prompt("Vault passphrase: ")?,
                };
                if passphrase.expose_secret().is_empty() {
                    return Err(VaultError::IdentityUnavailable("empty passphrase".into()));
                }
                let key = crypto::derive_passphrase_key(&passphrase, &salt)
                    .map_err(|e| unavailable("owner key", &e))?;
                Ok(OwnerKey::from_bytes(key))
            }
        }
    }
}
