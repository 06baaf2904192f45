#![expect(
    clippy::multiple_crate_versions,
    reason = "transitive dependency duplication"
)]

use clap::{Parser, Subcommand, ValueEnum};
use eyre::Context as _;
use serde_json::{json, Value};
use std::{
    io::{IsTerminal as _, Read as _},
    process::ExitCode,
};
use tracing_subscriber::prelude::*;
use zeroize::Zeroizing;

mod chains;
mod classifier;
mod cli_output;
mod config;
mod derivation;
mod errors;
mod fsutil;
mod identity;
mod keystore;
mod ordering;
mod paths;
mod reconciler;
mod store;
mod wallet;

use crate::{
    config::{ConfigStore, OwnerKeySource, VaultConfig},
    derivation::DerivationEngine,
    errors::{ErrorReport, VaultError},
    identity::LocalIdentity,
    keystore::{Vault, VaultSettings},
    paths::VaultPaths,
    store::JsonFileStore,
    wallet::KeyType,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum CliKeyType {
    Evm,
    Tron,
}

impl From<CliKeyType> for KeyType {
    fn from(v: CliKeyType) -> Self {
        match v {
            CliKeyType::Evm => Self::Evm,
            CliKeyType::Tron => Self::Tron,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "keyvault", version)]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Import an address (watch-only) or a private key.
    ///
    /// The value is read from stdin, or from a hidden prompt when stdin is a terminal. It is
    /// never accepted as an argument so it cannot end up in shell history.
    Import,

    /// Derive a wallet from the mnemonic (`KEYVAULT_MNEMONIC` or prompted).
    Derive {
        #[arg(long, value_enum, default_value_t = CliKeyType::Evm)]
        key_type: CliKeyType,

        /// Derive at this index instead of the next unused one.
        #[arg(long)]
        index: Option<u64>,
    },

    /// List wallets in display order.
    List {
        /// Include soft-deleted wallets.
        #[arg(long, default_value_t = false)]
        all: bool,
    },

    /// Soft-delete a wallet.
    Delete { id: String },

    /// Move the wallet at position `from` to position `to` (0-based, active wallets only).
    Reorder { from: usize, to: usize },

    /// Make a wallet the selected one.
    Select { id: String },

    /// Decrypt a wallet's key and check it still matches the stored address.
    Verify { id: String },

    /// Print resolved paths (useful for debugging).
    Paths,
}

fn init_logging(paths: &VaultPaths) -> tracing_appender::non_blocking::WorkerGuard {
    let env_filter = tracing_subscriber::EnvFilter::from_default_env();
    let file_name = paths
        .log_file
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("keyvault.log.jsonl");
    let file_appender = tracing_appender::rolling::never(&paths.data_dir, file_name);
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let stderr_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(std::io::stderr)
        .with_filter(env_filter.clone());
    let file_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(file_writer)
        .with_filter(env_filter);

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .init();

    guard
}

fn read_candidate() -> eyre::Result<Zeroizing<String>> {
    let stdin = std::io::stdin();
    if stdin.is_terminal() {
        let s = rpassword::prompt_password("Address or private key: ")
            .context("read import value")?;
        return Ok(Zeroizing::new(s));
    }
    let mut s = Zeroizing::new(String::new());
    stdin
        .lock()
        .read_to_string(&mut s)
        .context("read import value from stdin")?;
    Ok(s)
}

fn open_vault(paths: &VaultPaths, cfg: &VaultConfig) -> eyre::Result<Vault<JsonFileStore>> {
    let store = JsonFileStore::open(paths)?;
    let identity = LocalIdentity::new(paths.clone(), cfg)?;
    Ok(Vault::new(
        store,
        Box::new(identity),
        DerivationEngine::new(cfg.enabled_key_types.clone()),
        VaultSettings {
            scrub_on_delete: cfg.scrub_on_delete,
        },
    ))
}

/// Runs on a blocking worker: file locks, prompts and KDFs all block.
fn run_vault_command(paths: &VaultPaths, cmd: Command) -> eyre::Result<Value> {
    let cfg_store = ConfigStore::new(paths);
    let mut cfg = cfg_store.load_or_init_default()?;
    if cfg.owner_key_source == OwnerKeySource::Passphrase {
        cfg_store.ensure_passphrase_salt(&mut cfg)?;
    }
    let vault = open_vault(paths, &cfg)?;

    let body = match cmd {
        Command::Import => {
            let raw = read_candidate()?;
            json!({ "wallet": vault.import_candidate(&raw)? })
        }
        Command::Derive { key_type, index } => {
            let outcome = match index {
                Some(i) => vault.derive_at(key_type.into(), i)?,
                None => vault.derive_next(key_type.into())?,
            };
            json!({ "wallet": outcome })
        }
        Command::List { all } => {
            json!({ "wallets": cli_output::wallets_json(&vault.list(all)?) })
        }
        Command::Delete { id } => {
            json!({ "wallet": cli_output::wallet_json(&vault.soft_delete(&id)?) })
        }
        Command::Reorder { from, to } => {
            json!({ "wallets": cli_output::wallets_json(&vault.reorder(from, to)?) })
        }
        Command::Select { id } => {
            json!({ "wallet": cli_output::wallet_json(&vault.select(&id)?) })
        }
        Command::Verify { id } => json!({ "verification": vault.verify_credential(&id)? }),
        Command::Paths => paths_json(paths),
    };
    Ok(body)
}

fn paths_json(paths: &VaultPaths) -> Value {
    json!({
        "config_dir": paths.config_dir,
        "data_dir": paths.data_dir,
        "log_file": paths.log_file,
    })
}

/// User-facing report, and whether the failure is worth an error-level log line.
fn report_for(e: &eyre::Report) -> (ErrorReport, bool) {
    match e.downcast_ref::<VaultError>() {
        Some(v) => (ErrorReport::from(v.clone()), v.is_exceptional()),
        None => (ErrorReport::new("internal", format!("{e:#}")), true),
    }
}

#[tokio::main]
async fn main() -> eyre::Result<ExitCode> {
    color_eyre::install()?;
    let cli = Cli::parse();

    let paths = VaultPaths::discover()?;
    std::fs::create_dir_all(&paths.data_dir).context("create data dir")?;
    let _log_guard = init_logging(&paths);

    let result = match cli.cmd {
        Command::Paths => Ok(paths_json(&paths)),
        cmd => {
            let worker_paths = paths.clone();
            tokio::task::spawn_blocking(move || run_vault_command(&worker_paths, cmd))
                .await
                .context("vault worker failed")?
        }
    };

    match result {
        Ok(body) => {
            cli_output::print_ok(body)?;
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            let (report, exceptional) = report_for(&e);
            if exceptional {
                tracing::error!(error = ?e, code = report.code, "command failed");
            }
            cli_output::print_error(&report)?;
            Ok(ExitCode::FAILURE)
        }
    }
}
