//! Persistence for wallet entries and derivation counters.
//!
//! Rows are never physically removed. Stores enforce uniqueness of active
//! (key type, address) pairs; everything else is the vault's business.

use crate::{
    errors::VaultError,
    fsutil,
    paths::VaultPaths,
    wallet::{DerivationCounter, EntryPatch, KeyType, NewEntry, WalletEntry},
};
use chrono::{SecondsFormat, Utc};
use eyre::Context as _;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fs::File, path::PathBuf};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("constraint violation: {0}")]
    Constraint(String),
    #[error("no entry with id {0}")]
    NotFound(String),
    #[error("{0}")]
    Unavailable(String),
}

impl From<StoreError> for VaultError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Constraint(m) => Self::StoreConstraintViolation(m),
            StoreError::NotFound(id) => Self::EntryNotFound(id),
            StoreError::Unavailable(m) => Self::StoreUnavailable(m),
        }
    }
}

pub trait RecordStore: Send {
    /// Every row, soft-deleted ones included.
    fn entries(&self) -> Result<Vec<WalletEntry>, StoreError>;

    fn insert_entry(&mut self, row: NewEntry) -> Result<WalletEntry, StoreError>;

    fn update_entry(&mut self, id: &str, patch: &EntryPatch) -> Result<WalletEntry, StoreError>;

    fn counter(&self, key_type: KeyType) -> Result<Option<DerivationCounter>, StoreError>;

    fn put_counter(&mut self, counter: DerivationCounter) -> Result<(), StoreError>;

    /// Run `f` against a working copy of the whole store. Its writes land together when it
    /// returns `Ok` and the store accepts them, and not at all otherwise.
    fn transact<T, E>(&mut self, f: impl FnOnce(&mut MemoryStore) -> Result<T, E>) -> Result<T, E>
    where
        E: From<StoreError>;

    fn entry(&self, id: &str) -> Result<WalletEntry, StoreError> {
        self.entries()?
            .into_iter()
            .find(|e| e.id == id)
            .ok_or_else(|| StoreError::NotFound(id.to_owned()))
    }
}

/// Fixed-width UTC timestamp, so string order matches time order.
pub fn timestamp_now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Snapshot {
    #[serde(default)]
    entries: Vec<WalletEntry>,
    #[serde(default)]
    counters: Vec<DerivationCounter>,
}

/// In-memory store. Also the working set behind [`JsonFileStore`].
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    entries: Vec<WalletEntry>,
    counters: BTreeMap<KeyType, DerivationCounter>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn from_snapshot(s: Snapshot) -> Self {
        Self {
            entries: s.entries,
            counters: s.counters.into_iter().map(|c| (c.key_type, c)).collect(),
        }
    }

    fn snapshot(&self) -> Snapshot {
        Snapshot {
            entries: self.entries.clone(),
            counters: self.counters.values().copied().collect(),
        }
    }

    fn ensure_unique(
        &self,
        key_type: KeyType,
        address: &str,
        except: Option<&str>,
    ) -> Result<(), StoreError> {
        let clash = self.entries.iter().any(|e| {
            !e.deleted()
                && e.key_type == key_type
                && e.address == address
                && except != Some(e.id.as_str())
        });
        if clash {
            return Err(StoreError::Constraint(format!(
                "active {key_type} entry already exists for {address}"
            )));
        }
        Ok(())
    }
}

impl RecordStore for MemoryStore {
    fn entries(&self) -> Result<Vec<WalletEntry>, StoreError> {
        Ok(self.entries.clone())
    }

    fn insert_entry(&mut self, row: NewEntry) -> Result<WalletEntry, StoreError> {
        self.ensure_unique(row.key_type, &row.address, None)?;
        let now = timestamp_now();
        let entry = WalletEntry {
            id: Uuid::new_v4().to_string(),
            address: row.address,
            origin: row.origin,
            encrypted_credential: row.encrypted_credential,
            key_type: row.key_type,
            derivation_index: row.derivation_index,
            order_index: row.order_index,
            is_selected: None,
            is_deleted: Some(false),
            created_at: now.clone(),
            updated_at: now,
        };
        self.entries.push(entry.clone());
        Ok(entry)
    }

    fn update_entry(&mut self, id: &str, patch: &EntryPatch) -> Result<WalletEntry, StoreError> {
        let Some(pos) = self.entries.iter().position(|e| e.id == id) else {
            return Err(StoreError::NotFound(id.to_owned()));
        };
        let mut next = self
            .entries
            .get(pos)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_owned()))?;
        patch.apply_to(&mut next);
        if !next.deleted() {
            self.ensure_unique(next.key_type, &next.address, Some(id))?;
        }
        // Never move backwards, even if the wall clock does.
        let now = timestamp_now();
        if now > next.updated_at {
            next.updated_at = now;
        }
        if let Some(slot) = self.entries.get_mut(pos) {
            *slot = next.clone();
        }
        Ok(next)
    }

    fn counter(&self, key_type: KeyType) -> Result<Option<DerivationCounter>, StoreError> {
        Ok(self.counters.get(&key_type).copied())
    }

    fn put_counter(&mut self, counter: DerivationCounter) -> Result<(), StoreError> {
        self.counters.insert(counter.key_type, counter);
        Ok(())
    }

    fn transact<T, E>(&mut self, f: impl FnOnce(&mut MemoryStore) -> Result<T, E>) -> Result<T, E>
    where
        E: From<StoreError>,
    {
        let mut next = self.clone();
        let out = f(&mut next)?;
        *self = next;
        Ok(out)
    }
}

/// JSON file store. Holds an exclusive lock on `vault.lock` for its lifetime, so a second
/// process opening the same data dir fails fast with `VaultBusy`.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    inner: MemoryStore,
    lock: File,
}

impl JsonFileStore {
    pub fn open(paths: &VaultPaths) -> eyre::Result<Self> {
        paths.ensure_private_dirs()?;
        let lock = fsutil::open_lock_file(&paths.lock_path())?;
        match lock.try_lock_exclusive() {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                return Err(VaultError::VaultBusy.into());
            }
            Err(e) => return Err(eyre::Report::new(e).wrap_err("lock exclusive")),
        }

        let path = paths.vault_file();
        let snapshot = match fsutil::read_private(&path)? {
            Some(bytes) => serde_json::from_slice::<Snapshot>(&bytes)
                .with_context(|| format!("parse {}", path.display()))?,
            None => Snapshot::default(),
        };
        tracing::debug!(
            path = %path.display(),
            entries = snapshot.entries.len(),
            "vault store opened"
        );
        Ok(Self {
            path,
            inner: MemoryStore::from_snapshot(snapshot),
            lock,
        })
    }

    fn persist(&self, next: &MemoryStore) -> Result<(), StoreError> {
        let write = || -> eyre::Result<()> {
            let s = serde_json::to_string_pretty(&next.snapshot()).context("serialize vault")?;
            fsutil::write_string_atomic_restrictive(&self.path, &s, fsutil::MODE_FILE_PRIVATE)
        };
        write().map_err(|e| {
            tracing::error!(error = %e, path = %self.path.display(), "vault write failed");
            StoreError::Unavailable(format!("{e:#}"))
        })
    }

    /// Apply `f` to a copy of the working set and commit it only if the file write succeeds.
    fn commit<T, E>(&mut self, f: impl FnOnce(&mut MemoryStore) -> Result<T, E>) -> Result<T, E>
    where
        E: From<StoreError>,
    {
        let mut next = self.inner.clone();
        let out = f(&mut next)?;
        self.persist(&next)?;
        self.inner = next;
        Ok(out)
    }
}

impl Drop for JsonFileStore {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.lock) {
            tracing::warn!(error = %e, "failed to release vault lock");
        }
    }
}

impl RecordStore for JsonFileStore {
    fn entries(&self) -> Result<Vec<WalletEntry>, StoreError> {
        self.inner.entries()
    }

    fn insert_entry(&mut self, row: NewEntry) -> Result<WalletEntry, StoreError> {
        self.commit(|s| s.insert_entry(row))
    }

    fn update_entry(&mut self, id: &str, patch: &EntryPatch) -> Result<WalletEntry, StoreError> {
        self.commit(|s| s.update_entry(id, patch))
    }

    fn counter(&self, key_type: KeyType) -> Result<Option<DerivationCounter>, StoreError> {
        self.inner.counter(key_type)
    }

    fn put_counter(&mut self, counter: DerivationCounter) -> Result<(), StoreError> {
        self.commit(|s| s.put_counter(counter))
    }

    fn transact<T, E>(&mut self, f: impl FnOnce(&mut MemoryStore) -> Result<T, E>) -> Result<T, E>
    where
        E: From<StoreError>,
    {
        self.commit(f)
    }
}
