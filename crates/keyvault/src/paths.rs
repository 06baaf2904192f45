use directories::ProjectDirs;
use eyre::ContextCompat as _;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct VaultPaths {
    pub config_dir: PathBuf,
    pub data_dir: PathBuf,
    pub log_file: PathBuf,
}

impl VaultPaths {
    pub fn discover() -> eyre::Result<Self> {
        // Test/CI override knobs.
        if let (Ok(data_dir), Ok(config_dir)) = (
            std::env::var("KEYVAULT_DATA_DIR"),
            std::env::var("KEYVAULT_CONFIG_DIR"),
        ) {
            return Ok(Self::at(PathBuf::from(config_dir), PathBuf::from(data_dir)));
        }

        // Default locations:
        // macOS: ~/Library/Application Support/keyvault
        // Linux: ~/.config/keyvault (config), ~/.local/share/keyvault (data)
        // Windows: %APPDATA%\\keyvault
        let proj =
            ProjectDirs::from("", "", "keyvault").context("failed to resolve project dirs")?;
        Ok(Self::at(
            proj.config_dir().to_path_buf(),
            proj.data_dir().to_path_buf(),
        ))
    }

    pub fn at(config_dir: PathBuf, data_dir: PathBuf) -> Self {
        let log_file = data_dir.join("keyvault.log.jsonl");
        Self {
            config_dir,
            data_dir,
            log_file,
        }
    }

    pub fn config_file(&self) -> PathBuf {
        self.config_dir.join("config.toml")
    }

    pub fn machine_secret_path(&self) -> PathBuf {
        self.config_dir.join("machine_secret.bin")
    }

    pub fn vault_file(&self) -> PathBuf {
        self.data_dir.join("vault.json")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.data_dir.join("vault.lock")
    }

    pub fn ensure_private_dirs(&self) -> eyre::Result<()> {
        crate::fsutil::ensure_private_dir(&self.config_dir)?;
        crate::fsutil::ensure_private_dir(&self.data_dir)?;
        Ok(())
    }
}
