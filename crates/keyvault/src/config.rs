use crate::{fsutil, keystore::crypto, paths::VaultPaths, wallet::KeyType};
use base64::Engine as _;
use eyre::Context as _;
use serde::{Deserialize, Serialize};
use std::{fs, path::PathBuf};

/// Where the owner key (the AES key sealing every credential) comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OwnerKeySource {
    /// HKDF subkey of a random 32-byte secret kept in the config dir.
    #[default]
    Machine,
    /// Argon2id over a passphrase the user types (or supplies via `KEYVAULT_PASSPHRASE`).
    Passphrase,
}

impl OwnerKeySource {
    fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "machine" => Some(Self::Machine),
            "passphrase" => Some(Self::Passphrase),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct VaultConfig {
    /// Key families accepted for import and derivation. Anything else fails closed.
    pub enabled_key_types: Vec<KeyType>,

    /// Overwrite address and credential of deleted imported/watch-only rows with burn sentinels.
    ///
    /// Derived rows are never scrubbed: they can be re-derived from the mnemonic anyway.
    pub scrub_on_delete: bool,

    pub owner_key_source: OwnerKeySource,

    /// Base64 salt for Argon2id passphrase derivation. Generated on first use.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passphrase_salt_b64: Option<String>,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            enabled_key_types: KeyType::ALL.to_vec(),
            scrub_on_delete: true,
            owner_key_source: OwnerKeySource::Machine,
            passphrase_salt_b64: None,
        }
    }
}

impl VaultConfig {
    pub fn passphrase_salt(&self) -> eyre::Result<Option<[u8; 16]>> {
        let Some(s) = &self.passphrase_salt_b64 else {
            return Ok(None);
        };
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(s)
            .context("decode passphrase_salt_b64")?;
        let salt: [u8; 16] = bytes.try_into().map_err(|b: Vec<u8>| {
            eyre::eyre!("passphrase_salt_b64 must decode to 16 bytes, got {}", b.len())
        })?;
        Ok(Some(salt))
    }
}

fn is_truthy(v: &str) -> Option<bool> {
    match v.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Apply `KEYVAULT_*` overrides. Unparseable values are ignored with a warning.
fn apply_env_overrides(cfg: &mut VaultConfig, var: impl Fn(&str) -> Option<String>) {
    if let Some(v) = var("KEYVAULT_SCRUB_ON_DELETE") {
        match is_truthy(&v) {
            Some(b) => cfg.scrub_on_delete = b,
            None => tracing::warn!(value = %v, "ignoring KEYVAULT_SCRUB_ON_DELETE"),
        }
    }
    if let Some(v) = var("KEYVAULT_OWNER_KEY_SOURCE") {
        match OwnerKeySource::parse(&v) {
            Some(s) => cfg.owner_key_source = s,
            None => tracing::warn!(value = %v, "ignoring KEYVAULT_OWNER_KEY_SOURCE"),
        }
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn new(paths: &VaultPaths) -> Self {
        Self {
            path: paths.config_file(),
        }
    }

    pub fn load_or_init_default(&self) -> eyre::Result<VaultConfig> {
        let mut cfg = if self.path.exists() {
            let s = fs::read_to_string(&self.path).context("read config.toml")?;
            toml::from_str(&s).context("parse config.toml")?
        } else {
            let cfg = VaultConfig::default();
            self.save(&cfg)?;
            cfg
        };
        apply_env_overrides(&mut cfg, env_var);
        Ok(cfg)
    }

    pub fn save(&self, cfg: &VaultConfig) -> eyre::Result<()> {
        let s = toml::to_string_pretty(cfg).context("serialize config.toml")?;
        fsutil::write_string_atomic_restrictive(&self.path, &s, fsutil::MODE_FILE_PRIVATE)
            .context("write config.toml")?;
        Ok(())
    }

    /// Return the persisted passphrase salt, generating and saving one if missing.
    pub fn ensure_passphrase_salt(&self, cfg: &mut VaultConfig) -> eyre::Result<[u8; 16]> {
        if let Some(salt) = cfg.passphrase_salt()? {
            return Ok(salt);
        }
        let salt = crypto::random_salt16();
        cfg.passphrase_salt_b64 = Some(base64::engine::general_purpose::STANDARD.encode(salt));
        self.save(cfg)?;
        Ok(salt)
    }
}
