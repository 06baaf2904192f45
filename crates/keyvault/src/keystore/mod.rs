//! The vault: classification, derivation, sealing and lifecycle reconciliation behind one lock.

pub mod crypto;

use crate::{
    chains,
    classifier::{classify, Classification},
    derivation::{validate_index, DerivationEngine, PrivateKey},
    errors::VaultError,
    identity::IdentityProvider,
    ordering::{self, OrderingLedger},
    reconciler::{reconcile, Decision, Event, Transition},
    store::RecordStore,
    wallet::{EntryOrigin, EntryPatch, EntryState, KeyType, WalletEntry},
};
use crypto::OwnerKey;
use secrecy::SecretString;
use serde::Serialize;
use std::{
    fmt,
    sync::{Mutex, MutexGuard},
};
use zeroize::Zeroizing;

#[derive(Debug, Clone, Copy)]
pub struct VaultSettings {
    pub scrub_on_delete: bool,
}

impl Default for VaultSettings {
    fn default() -> Self {
        Self {
            scrub_on_delete: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ImportOutcome {
    pub id: String,
    pub address: String,
    pub key_type: KeyType,
    pub origin: EntryOrigin,
    pub restored: bool,
    pub previous_state: EntryState,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct DeriveOutcome {
    pub id: String,
    pub key_type: KeyType,
    pub index: u32,
    pub address: String,
    pub already_existed: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct VerifyOutcome {
    pub id: String,
    pub key_type: KeyType,
    pub address: String,
    /// Address re-derived from the decrypted credential.
    pub derived_address: String,
    pub matches: bool,
}

/// Decrypted private key for one wallet. Wiped when dropped.
pub struct SigningKey {
    key_type: KeyType,
    address: String,
    key: PrivateKey,
}

impl SigningKey {
    pub const fn key_type(&self) -> KeyType {
        self.key_type
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn secret(&self) -> &[u8; 32] {
        &self.key
    }
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKey")
            .field("key_type", &self.key_type)
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

/// Material for one derivation, gathered before the store lock is taken.
struct DeriveInputs {
    mnemonic: SecretString,
    passphrase: SecretString,
    owner: OwnerKey,
}

pub struct Vault<S: RecordStore> {
    store: Mutex<S>,
    identity: Box<dyn IdentityProvider>,
    engine: DerivationEngine,
    settings: VaultSettings,
}

/// Row currently bound to (`key_type`, `canonical`): an active row wins, otherwise the most
/// recently updated deleted one. Legacy spellings of the address match too. Scrubbed rows are
/// tombstones and never match, so the burn addresses stay importable.
fn find_current(
    rows: Vec<WalletEntry>,
    key_type: KeyType,
    canonical: &str,
) -> Option<WalletEntry> {
    let legacy = chains::legacy_forms(key_type, canonical);
    rows.into_iter()
        .filter(|e| e.key_type == key_type && !e.is_scrubbed())
        .filter(|e| e.address == canonical || legacy.contains(&e.address))
        .max_by(|a, b| {
            (a.state().is_active(), &a.updated_at).cmp(&(b.state().is_active(), &b.updated_at))
        })
}

/// Perform the write a reconciliation decided on, then do the ordering bookkeeping. Callers run
/// this inside one store transaction so the row and its counter bump land together.
fn apply<S: RecordStore>(
    store: &mut S,
    key_type: KeyType,
    transition: Transition,
) -> Result<WalletEntry, VaultError> {
    let stored_index = transition.decision.stored_derivation_index();
    let next_order = OrderingLedger::new(&mut *store).next_order_index()?;
    let entry = match transition.decision {
        Decision::Insert(mut row) => {
            row.order_index = Some(next_order);
            store.insert_entry(row)?
        }
        Decision::Update {
            id,
            mut patch,
            refresh_order,
            ..
        } => {
            if refresh_order {
                patch.order_index = Some(Some(next_order));
            }
            if patch.is_empty() {
                store.entry(&id)?
            } else {
                store.update_entry(&id, &patch)?
            }
        }
        Decision::Unchanged { id } => store.entry(&id)?,
    };
    if let Some(index) = stored_index {
        OrderingLedger::new(&mut *store).advance_derivation_counter(key_type, index)?;
    }
    Ok(entry)
}

impl<S: RecordStore> Vault<S> {
    pub fn new(
        store: S,
        identity: Box<dyn IdentityProvider>,
        engine: DerivationEngine,
        settings: VaultSettings,
    ) -> Self {
        Self {
            store: Mutex::new(store),
            identity,
            engine,
            settings,
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, S>, VaultError> {
        self.store
            .lock()
            .map_err(|e| VaultError::StoreUnavailable(format!("vault lock poisoned: {e}")))
    }

    /// Import pasted text: a private key (sealed and stored) or an address (watch-only).
    pub fn import_candidate(&self, raw: &str) -> Result<ImportOutcome, VaultError> {
        let (key_type, address, event) = match classify(&self.engine, raw)? {
            Classification::Unrecognized => return Err(VaultError::UnrecognizedInput),
            Classification::Address { key_type, address } => {
                self.engine.ensure_enabled(key_type)?;
                (key_type, address, Event::ImportAddress)
            }
            Classification::PrivateKey {
                key_type,
                key,
                address,
            } => {
                self.engine.ensure_enabled(key_type)?;
                let owner = self.identity.owner_key()?;
                let credential = crypto::seal_credential(&owner, key.as_slice())?;
                (key_type, address, Event::ImportPrivateKey { credential })
            }
        };

        let mut store = self.lock()?;
        let current = find_current(store.entries()?, key_type, &address);
        let transition = match reconcile(key_type, &address, current.as_ref(), event) {
            Ok(t) => t,
            Err(e) => {
                tracing::info!(%key_type, %address, code = e.code(), "import rejected");
                return Err(e);
            }
        };
        let (from, to) = (transition.from, transition.to);
        let restored = matches!(transition.decision, Decision::Update { restored: true, .. });
        let entry = store.transact(|tx| apply(tx, key_type, transition))?;
        tracing::info!(
            %key_type,
            id = %entry.id,
            from = ?from,
            to = ?to,
            restored,
            "wallet imported"
        );
        Ok(ImportOutcome {
            id: entry.id,
            address: entry.address,
            key_type,
            origin: entry.origin,
            restored,
            previous_state: from,
        })
    }

    fn derive_inputs(&self, key_type: KeyType) -> Result<DeriveInputs, VaultError> {
        self.engine.ensure_enabled(key_type)?;
        Ok(DeriveInputs {
            mnemonic: self.identity.mnemonic()?,
            passphrase: self.identity.bip39_passphrase()?,
            owner: self.identity.owner_key()?,
        })
    }

    /// Derive at the key type's next unused index.
    pub fn derive_next(&self, key_type: KeyType) -> Result<DeriveOutcome, VaultError> {
        let inputs = self.derive_inputs(key_type)?;
        let mut store = self.lock()?;
        let index = OrderingLedger::new(&mut *store).next_free_derivation_index(key_type)?;
        self.derive_locked(&mut *store, key_type, index, &inputs)
    }

    pub fn derive_at(&self, key_type: KeyType, index: u64) -> Result<DeriveOutcome, VaultError> {
        let index = validate_index(index)?;
        let inputs = self.derive_inputs(key_type)?;
        let mut store = self.lock()?;
        self.derive_locked(&mut *store, key_type, index, &inputs)
    }

    fn derive_locked(
        &self,
        store: &mut S,
        key_type: KeyType,
        index: u32,
        inputs: &DeriveInputs,
    ) -> Result<DeriveOutcome, VaultError> {
        let key = self.engine.derive(
            &inputs.mnemonic,
            &inputs.passphrase,
            key_type,
            u64::from(index),
        )?;
        let address = self.engine.derive_address(&key, key_type)?;
        let credential = crypto::seal_credential(&inputs.owner, key.as_slice())?;

        let current = find_current(store.entries()?, key_type, &address);
        let transition = reconcile(
            key_type,
            &address,
            current.as_ref(),
            Event::DeriveAt { index, credential },
        )?;
        let from = transition.from;
        let already_existed = from != EntryState::Absent;
        let entry = store.transact(|tx| apply(tx, key_type, transition))?;
        tracing::info!(
            %key_type,
            index,
            id = %entry.id,
            from = ?from,
            already_existed,
            "wallet derived"
        );
        Ok(DeriveOutcome {
            id: entry.id,
            key_type,
            index,
            address: entry.address,
            already_existed,
        })
    }

    /// Mark an entry deleted. Deleting a deleted entry is a no-op.
    pub fn soft_delete(&self, id: &str) -> Result<WalletEntry, VaultError> {
        let mut store = self.lock()?;
        let current = store.entry(id)?;
        let transition = reconcile(
            current.key_type,
            &current.address,
            Some(&current),
            Event::SoftDelete {
                scrub: self.settings.scrub_on_delete,
            },
        )?;
        let (from, to) = (transition.from, transition.to);
        let entry = store.transact(|tx| apply(tx, current.key_type, transition))?;
        tracing::info!(id, from = ?from, to = ?to, "wallet deleted");
        Ok(entry)
    }

    pub fn reorder(&self, from: usize, to: usize) -> Result<Vec<WalletEntry>, VaultError> {
        let mut store = self.lock()?;
        OrderingLedger::new(&mut *store).reorder(from, to)
    }

    /// Active entries in display order, followed by deleted ones when asked for.
    pub fn list(&self, include_deleted: bool) -> Result<Vec<WalletEntry>, VaultError> {
        let rows = self.lock()?.entries()?;
        let (mut active, mut deleted): (Vec<_>, Vec<_>) =
            rows.into_iter().partition(|e| !e.deleted());
        ordering::sort_for_display(&mut active);
        if include_deleted {
            ordering::sort_for_display(&mut deleted);
            active.extend(deleted);
        }
        Ok(active)
    }

    /// Make `id` the only selected entry.
    pub fn select(&self, id: &str) -> Result<WalletEntry, VaultError> {
        let mut store = self.lock()?;
        let target = store.entry(id)?;
        if target.deleted() {
            return Err(VaultError::EntryNotFound(id.to_owned()));
        }
        if target.selected() && !store.entries()?.iter().any(|e| e.selected() && e.id != id) {
            return Ok(target);
        }
        let entry = store.transact(|tx| -> Result<WalletEntry, VaultError> {
            let clear = EntryPatch {
                is_selected: Some(false),
                ..EntryPatch::default()
            };
            for other in tx.entries()? {
                if other.id != id && other.selected() {
                    tx.update_entry(&other.id, &clear)?;
                }
            }
            let patch = EntryPatch {
                is_selected: Some(true),
                ..EntryPatch::default()
            };
            Ok(tx.update_entry(id, &patch)?)
        })?;
        tracing::info!(id, "wallet selected");
        Ok(entry)
    }

    /// Decrypt the credential of an active entry. The returned handle wipes itself on drop.
    pub fn decrypt_for_signing(&self, id: &str) -> Result<SigningKey, VaultError> {
        let owner = self.identity.owner_key()?;
        let entry = {
            let store = self.lock()?;
            store.entry(id)?
        };
        if entry.deleted() {
            return Err(VaultError::EntryNotFound(id.to_owned()));
        }
        let Some(sealed) = &entry.encrypted_credential else {
            return Err(VaultError::NoSigningCapability);
        };
        let plain = crypto::open_credential(&owner, sealed)?;
        let Ok(bytes) = <[u8; 32]>::try_from(plain.as_slice()) else {
            return Err(VaultError::CorruptOrWrongKey);
        };
        tracing::debug!(id, key_type = %entry.key_type, "credential decrypted");
        Ok(SigningKey {
            key_type: entry.key_type,
            address: entry.address,
            key: Zeroizing::new(bytes),
        })
    }

    /// Decrypt, hand the key to `f`, and wipe it as soon as `f` returns.
    pub fn with_signing_key<T>(
        &self,
        id: &str,
        f: impl FnOnce(&SigningKey) -> T,
    ) -> Result<T, VaultError> {
        let key = self.decrypt_for_signing(id)?;
        Ok(f(&key))
    }

    /// Prove the stored credential still opens and belongs to the stored address.
    pub fn verify_credential(&self, id: &str) -> Result<VerifyOutcome, VaultError> {
        let (key_type, address, derived_address) = self.with_signing_key(id, |k| {
            chains::address_from_secret(k.key_type(), k.secret())
                .map(|derived| (k.key_type(), k.address().to_owned(), derived))
        })??;
        let matches = derived_address == address;
        if !matches {
            tracing::warn!(id, %key_type, "stored credential does not match address");
        }
        Ok(VerifyOutcome {
            id: id.to_owned(),
            key_type,
            address,
            derived_address,
            matches,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        identity::StaticIdentity,
        store::{MemoryStore, StoreError},
        wallet::{DerivationCounter, NewEntry},
    };

    const HARDHAT: &str = "test test test test test test test test test test test junk";
    const ABANDON: &str =
        "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";
    const HARDHAT_0: &str = "0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266";
    const HARDHAT_0_KEY: &str = "ac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

    fn vault_with(
        mnemonic: &str,
        store: MemoryStore,
        settings: VaultSettings,
    ) -> Vault<MemoryStore> {
        Vault::new(
            store,
            Box::new(StaticIdentity::new(mnemonic, "", [7_u8; 32])),
            DerivationEngine::default(),
            settings,
        )
    }

    fn vault(mnemonic: &str) -> Vault<MemoryStore> {
        vault_with(mnemonic, MemoryStore::new(), VaultSettings::default())
    }

    fn counter(v: &Vault<MemoryStore>, key_type: KeyType) -> eyre::Result<u32> {
        let mut store = v.lock()?;
        Ok(OrderingLedger::new(&mut *store).next_derivation_index(key_type)?)
    }

    #[test]
    fn derived_addresses_match_known_vectors() -> eyre::Result<()> {
        let v = vault(HARDHAT);
        let first = v.derive_at(KeyType::Evm, 0)?;
        assert_eq!(first.address, HARDHAT_0);
        assert!(!first.already_existed);
        let second = v.derive_at(KeyType::Evm, 1)?;
        assert_eq!(second.address, "0x70997970C51812dc3A010C7d01b50e0d17dc79C8");
        assert_ne!(first.id, second.id);

        let tron = vault(ABANDON).derive_at(KeyType::Tron, 0)?;
        assert_eq!(tron.address, "TUEZSdKsoDHQMeZwihtdoBiN46zxhGWYdH");
        Ok(())
    }

    #[test]
    fn watch_only_upgrades_and_never_downgrades() -> eyre::Result<()> {
        let v = vault(HARDHAT);
        let watch = v.import_candidate(HARDHAT_0)?;
        assert_eq!(watch.origin, EntryOrigin::WatchOnly);

        let upgraded = v.import_candidate(&format!("0x{HARDHAT_0_KEY}"))?;
        assert_eq!(upgraded.id, watch.id);
        assert_eq!(upgraded.origin, EntryOrigin::Imported);
        assert_eq!(upgraded.previous_state, EntryState::WatchOnlyActive);

        assert_eq!(
            v.import_candidate(HARDHAT_0).err(),
            Some(VaultError::CapabilityDowngradeRefused)
        );
        let rows = v.list(true)?;
        assert_eq!(rows.len(), 1);
        assert!(rows.iter().all(WalletEntry::has_credential));
        Ok(())
    }

    #[test]
    fn derived_wallet_refuses_watch_only_import() -> eyre::Result<()> {
        let v = vault(HARDHAT);
        v.derive_at(KeyType::Evm, 0)?;
        assert_eq!(
            v.import_candidate(&HARDHAT_0.to_ascii_lowercase()).err(),
            Some(VaultError::CapabilityDowngradeRefused)
        );
        assert_eq!(
            v.import_candidate(HARDHAT_0_KEY).map(|o| o.key_type),
            Ok(KeyType::Tron),
            "bare hex is read as a tron key"
        );
        Ok(())
    }

    #[test]
    fn rederiving_a_deleted_index_restores_the_same_row() -> eyre::Result<()> {
        let v = vault(ABANDON);
        let first = v.derive_at(KeyType::Evm, 3)?;
        assert_eq!(first.address, "0xF3f50213C1d2e255e4B2bAD430F8A38EEF8D718E");
        let deleted = v.soft_delete(&first.id)?;
        assert!(deleted.deleted());
        assert_eq!(deleted.address, first.address, "derived rows are not scrubbed");

        assert_eq!(counter(&v, KeyType::Evm)?, 4);

        let again = v.derive_at(KeyType::Evm, 3)?;
        assert_eq!(again.id, first.id);
        assert!(again.already_existed);
        assert_eq!(counter(&v, KeyType::Evm)?, 4);
        v.with_signing_key(&again.id, |k| assert_eq!(k.address(), first.address))?;
        assert_eq!(v.list(true)?.len(), 1);
        Ok(())
    }

    #[test]
    fn malformed_input_writes_nothing() -> eyre::Result<()> {
        let v = vault(HARDHAT);
        assert_eq!(
            v.import_candidate("TUEZSdKsoDHQMeZwihtdoBiN46zxhGWYdJ").err(),
            Some(VaultError::ChecksumMismatch)
        );
        assert_eq!(
            v.import_candidate("not-an-address").err(),
            Some(VaultError::UnrecognizedInput)
        );
        assert!(v.list(true)?.is_empty());
        Ok(())
    }

    #[test]
    fn derive_is_idempotent_and_counter_is_monotonic() -> eyre::Result<()> {
        let v = vault(HARDHAT);
        assert_eq!(v.derive_next(KeyType::Evm)?.index, 0);
        assert_eq!(v.derive_next(KeyType::Evm)?.index, 1);

        let a = v.derive_at(KeyType::Evm, 5)?;
        let b = v.derive_at(KeyType::Evm, 5)?;
        assert_eq!(a.id, b.id);
        assert!(b.already_existed);
        assert_eq!(v.derive_next(KeyType::Evm)?.index, 6);

        v.derive_at(KeyType::Evm, 2)?;
        assert_eq!(counter(&v, KeyType::Evm)?, 7);
        assert_eq!(counter(&v, KeyType::Tron)?, 0);
        assert_eq!(v.list(false)?.len(), 5);
        Ok(())
    }

    #[test]
    fn out_of_range_index_is_rejected() {
        let v = vault(HARDHAT);
        assert_eq!(
            v.derive_at(KeyType::Evm, 1 << 31).err(),
            Some(VaultError::IndexOutOfRange(1 << 31))
        );
    }

    #[test]
    fn importing_a_private_key_over_a_derived_row_is_rejected() -> eyre::Result<()> {
        let v = vault(HARDHAT);
        v.derive_at(KeyType::Evm, 0)?;
        assert_eq!(
            v.import_candidate(&format!("0x{HARDHAT_0_KEY}")).err(),
            Some(VaultError::AlreadyHasCredential)
        );
        Ok(())
    }

    #[test]
    fn imported_key_becomes_derived_when_its_index_is_derived() -> eyre::Result<()> {
        let v = vault(HARDHAT);
        let imported = v.import_candidate(&format!("0x{HARDHAT_0_KEY}"))?;
        let derived = v.derive_at(KeyType::Evm, 0)?;
        assert_eq!(derived.id, imported.id);
        assert!(derived.already_existed);
        let row = v.list(false)?;
        assert_eq!(row.first().map(|e| e.origin), Some(EntryOrigin::Derived));
        assert_eq!(counter(&v, KeyType::Evm)?, 1);
        Ok(())
    }

    #[test]
    fn legacy_lowercase_row_is_matched_and_rewritten() -> eyre::Result<()> {
        let mut store = MemoryStore::new();
        let legacy = store.insert_entry(NewEntry {
            address: HARDHAT_0.to_ascii_lowercase(),
            origin: EntryOrigin::WatchOnly,
            encrypted_credential: None,
            key_type: KeyType::Evm,
            derivation_index: None,
            order_index: Some(0),
        })?;
        let v = vault_with(HARDHAT, store, VaultSettings::default());
        let out = v.import_candidate(&format!("0x{HARDHAT_0_KEY}"))?;
        assert_eq!(out.id, legacy.id);
        assert_eq!(out.address, HARDHAT_0);
        Ok(())
    }

    #[test]
    fn scrubbed_watch_only_rows_are_not_resurrected() -> eyre::Result<()> {
        let v = vault(HARDHAT);
        let first = v.import_candidate(HARDHAT_0)?;
        let deleted = v.soft_delete(&first.id)?;
        assert_eq!(deleted.address, KeyType::Evm.burn_address());

        let second = v.import_candidate(HARDHAT_0)?;
        assert_ne!(second.id, first.id);
        assert!(!second.restored);
        // Deleting again is a no-op.
        assert_eq!(v.soft_delete(&first.id)?.updated_at, deleted.updated_at);
        Ok(())
    }

    #[test]
    fn unscrubbed_rows_restore_in_place() -> eyre::Result<()> {
        let v = vault_with(
            HARDHAT,
            MemoryStore::new(),
            VaultSettings {
                scrub_on_delete: false,
            },
        );
        let watch = v.import_candidate(HARDHAT_0)?;
        v.soft_delete(&watch.id)?;
        assert_eq!(
            v.import_candidate(HARDHAT_0).err(),
            Some(VaultError::AlreadyWatchOnly)
        );
        let restored = v.import_candidate(&format!("0x{HARDHAT_0_KEY}"))?;
        assert_eq!(restored.id, watch.id);
        assert!(restored.restored);
        assert_eq!(restored.previous_state, EntryState::DeletedWatchOnly);
        Ok(())
    }

    #[test]
    fn signing_key_round_trips_and_watch_only_cannot_sign() -> eyre::Result<()> {
        let v = vault(HARDHAT);
        let derived = v.derive_at(KeyType::Evm, 0)?;
        let key = v.decrypt_for_signing(&derived.id)?;
        assert_eq!(hex::encode(key.secret()), HARDHAT_0_KEY);
        assert!(!format!("{key:?}").contains(HARDHAT_0_KEY));

        let report = v.verify_credential(&derived.id)?;
        assert!(report.matches);

        let watch = v.import_candidate("TUEZSdKsoDHQMeZwihtdoBiN46zxhGWYdH")?;
        assert_eq!(
            v.decrypt_for_signing(&watch.id).err(),
            Some(VaultError::NoSigningCapability)
        );
        Ok(())
    }

    #[test]
    fn tampered_credential_fails_closed() -> eyre::Result<()> {
        let mut store = MemoryStore::new();
        let row = store.insert_entry(NewEntry {
            address: HARDHAT_0.to_owned(),
            origin: EntryOrigin::Imported,
            encrypted_credential: Some(crypto::seal_credential(
                &OwnerKey::from_bytes([9_u8; 32]),
                &[1_u8; 32],
            )?),
            key_type: KeyType::Evm,
            derivation_index: None,
            order_index: Some(0),
        })?;
        let v = vault_with(HARDHAT, store, VaultSettings::default());
        assert_eq!(
            v.decrypt_for_signing(&row.id).err(),
            Some(VaultError::CorruptOrWrongKey)
        );
        Ok(())
    }

    #[test]
    fn selection_is_exclusive() -> eyre::Result<()> {
        let v = vault(HARDHAT);
        let a = v.derive_next(KeyType::Evm)?;
        let b = v.derive_next(KeyType::Evm)?;
        v.select(&a.id)?;
        v.select(&b.id)?;
        let selected: Vec<String> = v
            .list(false)?
            .into_iter()
            .filter(WalletEntry::selected)
            .map(|e| e.id)
            .collect();
        assert_eq!(selected, vec![b.id]);

        v.soft_delete(&a.id)?;
        assert_eq!(
            v.select(&a.id).err(),
            Some(VaultError::EntryNotFound(a.id.clone()))
        );
        Ok(())
    }

    #[test]
    fn new_and_restored_rows_go_to_the_end() -> eyre::Result<()> {
        let v = vault(HARDHAT);
        let a = v.derive_at(KeyType::Evm, 0)?;
        let b = v.derive_at(KeyType::Evm, 1)?;
        let c = v.derive_at(KeyType::Evm, 2)?;
        let ids = |rows: Vec<WalletEntry>| rows.into_iter().map(|e| e.id).collect::<Vec<_>>();
        assert_eq!(ids(v.list(false)?), vec![a.id.clone(), b.id.clone(), c.id.clone()]);

        assert_eq!(
            ids(v.reorder(2, 0)?),
            vec![c.id.clone(), a.id.clone(), b.id.clone()]
        );
        v.soft_delete(&a.id)?;
        v.derive_at(KeyType::Evm, 0)?;
        assert_eq!(ids(v.list(false)?), vec![c.id, b.id, a.id]);
        Ok(())
    }

    #[test]
    fn disabled_key_types_fail_closed() {
        let v = Vault::new(
            MemoryStore::new(),
            Box::new(StaticIdentity::new(ABANDON, "", [7_u8; 32])),
            DerivationEngine::new(vec![KeyType::Evm]),
            VaultSettings::default(),
        );
        assert_eq!(
            v.derive_next(KeyType::Tron).err(),
            Some(VaultError::UnsupportedKeyType("tron".into()))
        );
        assert_eq!(
            v.import_candidate("TUEZSdKsoDHQMeZwihtdoBiN46zxhGWYdH").err(),
            Some(VaultError::UnsupportedKeyType("tron".into()))
        );
    }

    #[test]
    fn concurrent_derivations_of_one_index_yield_one_row() -> eyre::Result<()> {
        let v = vault(HARDHAT);
        let ids = std::thread::scope(|s| {
            let handles: Vec<_> = (0..4)
                .map(|_| s.spawn(|| v.derive_at(KeyType::Evm, 0)))
                .collect();
            handles
                .into_iter()
                .map(|h| {
                    h.join()
                        .map_err(|_panic| eyre::eyre!("derive thread panicked"))?
                        .map(|o| o.id)
                        .map_err(eyre::Report::from)
                })
                .collect::<eyre::Result<Vec<_>>>()
        })?;
        assert!(ids.windows(2).all(|w| w.first() == w.last()));
        assert_eq!(v.list(true)?.len(), 1);
        Ok(())
    }

    #[test]
    fn deleted_rows_are_listed_only_on_request() -> eyre::Result<()> {
        let v = vault(HARDHAT);
        let a = v.derive_next(KeyType::Evm)?;
        v.derive_next(KeyType::Evm)?;
        v.soft_delete(&a.id)?;
        assert_eq!(v.list(false)?.len(), 1);
        let all = v.list(true)?;
        assert_eq!(all.len(), 2);
        assert_eq!(all.last().map(|e| e.id.as_str()), Some(a.id.as_str()));
        Ok(())
    }

    /// Backend that fails once more than `budget` rows have been written, counting every
    /// changed row of a transaction.
    struct FlakyStore {
        inner: MemoryStore,
        budget: usize,
    }

    impl FlakyStore {
        fn spend(&mut self, rows: usize) -> Result<(), StoreError> {
            let Some(left) = self.budget.checked_sub(rows) else {
                self.budget = 0;
                return Err(StoreError::Unavailable("backend went away".into()));
            };
            self.budget = left;
            Ok(())
        }
    }

    impl RecordStore for FlakyStore {
        fn entries(&self) -> Result<Vec<WalletEntry>, StoreError> {
            self.inner.entries()
        }

        fn insert_entry(&mut self, row: NewEntry) -> Result<WalletEntry, StoreError> {
            self.spend(1)?;
            self.inner.insert_entry(row)
        }

        fn update_entry(
            &mut self,
            id: &str,
            patch: &EntryPatch,
        ) -> Result<WalletEntry, StoreError> {
            self.spend(1)?;
            self.inner.update_entry(id, patch)
        }

        fn counter(&self, key_type: KeyType) -> Result<Option<DerivationCounter>, StoreError> {
            self.inner.counter(key_type)
        }

        fn put_counter(&mut self, counter: DerivationCounter) -> Result<(), StoreError> {
            self.spend(1)?;
            self.inner.put_counter(counter)
        }

        fn transact<T, E>(
            &mut self,
            f: impl FnOnce(&mut MemoryStore) -> Result<T, E>,
        ) -> Result<T, E>
        where
            E: From<StoreError>,
        {
            let mut next = self.inner.clone();
            let out = f(&mut next)?;
            let before = self.inner.entries()?;
            let changed = next.entries()?.iter().filter(|e| !before.contains(e)).count();
            self.spend(changed)?;
            self.inner = next;
            Ok(out)
        }
    }

    #[test]
    fn derive_next_skips_rows_whose_counter_bump_was_lost() -> eyre::Result<()> {
        let mut store = MemoryStore::new();
        store.insert_entry(NewEntry {
            address: HARDHAT_0.into(),
            origin: EntryOrigin::Derived,
            encrypted_credential: None,
            key_type: KeyType::Evm,
            derivation_index: Some(0),
            order_index: Some(0),
        })?;
        let v = vault_with(HARDHAT, store, VaultSettings::default());
        assert_eq!(counter(&v, KeyType::Evm)?, 0);

        let first = v.derive_next(KeyType::Evm)?;
        assert_eq!(first.index, 1);
        assert!(!first.already_existed);
        let second = v.derive_next(KeyType::Evm)?;
        assert_eq!(second.index, 2);
        assert_eq!(counter(&v, KeyType::Evm)?, 3);
        Ok(())
    }

    #[test]
    fn derive_writes_row_and_counter_together() -> eyre::Result<()> {
        let v = vault(HARDHAT);
        v.derive_at(KeyType::Evm, 0)?;
        let seeded = (*v.lock()?).clone();
        let flaky = Vault::new(
            FlakyStore {
                inner: seeded,
                budget: 0,
            },
            Box::new(StaticIdentity::new(HARDHAT, "", [7_u8; 32])),
            DerivationEngine::default(),
            VaultSettings::default(),
        );
        assert!(matches!(
            flaky.derive_next(KeyType::Evm),
            Err(VaultError::StoreUnavailable(_))
        ));
        let store = flaky.lock()?;
        assert_eq!(store.entries()?.len(), 1);
        assert_eq!(
            store.counter(KeyType::Evm)?.map(|c| c.next_index),
            Some(1)
        );
        Ok(())
    }

    #[test]
    fn interrupted_reorder_and_select_leave_rows_untouched() -> eyre::Result<()> {
        let v = vault(HARDHAT);
        for i in 0..3 {
            v.derive_at(KeyType::Evm, i)?;
        }
        let ids: Vec<String> = v.list(false)?.into_iter().map(|e| e.id).collect();
        let (Some(first), Some(last)) = (ids.first(), ids.last()) else {
            eyre::bail!("expected three wallets");
        };
        v.select(first)?;

        let flaky = Vault::new(
            FlakyStore {
                inner: (*v.lock()?).clone(),
                budget: 1,
            },
            Box::new(StaticIdentity::new(HARDHAT, "", [7_u8; 32])),
            DerivationEngine::default(),
            VaultSettings::default(),
        );
        assert!(matches!(
            flaky.reorder(2, 0),
            Err(VaultError::StoreUnavailable(_))
        ));
        assert!(matches!(
            flaky.select(last),
            Err(VaultError::StoreUnavailable(_))
        ));

        let rows = flaky.list(false)?;
        assert_eq!(rows.iter().map(|e| e.id.clone()).collect::<Vec<_>>(), ids);
        assert_eq!(
            rows.iter().map(|e| e.order_index).collect::<Vec<_>>(),
            vec![Some(0), Some(1), Some(2)]
        );
        let selected: Vec<&str> = rows
            .iter()
            .filter(|e| e.selected())
            .map(|e| e.id.as_str())
            .collect();
        assert_eq!(selected, [first.as_str()]);
        Ok(())
    }

    #[test]
    fn burn_addresses_stay_importable_after_scrubbing() -> eyre::Result<()> {
        let v = vault(HARDHAT);
        let watch = v.import_candidate("0x70997970C51812dc3A010C7d01b50e0d17dc79C8")?;
        v.soft_delete(&watch.id)?;
        let key = v.import_candidate(&format!("0x{HARDHAT_0_KEY}"))?;
        let scrubbed = v.soft_delete(&key.id)?;
        assert_eq!(scrubbed.address, KeyType::Evm.burn_address());

        let evm = v.import_candidate(KeyType::Evm.burn_address())?;
        assert_eq!(evm.origin, EntryOrigin::WatchOnly);
        assert_eq!(evm.previous_state, EntryState::Absent);
        assert!(!evm.restored);
        assert!(evm.id != watch.id && evm.id != key.id);

        let tron = v.import_candidate("TUEZSdKsoDHQMeZwihtdoBiN46zxhGWYdH")?;
        v.soft_delete(&tron.id)?;
        let burn = v.import_candidate(KeyType::Tron.burn_address())?;
        assert_eq!(burn.previous_state, EntryState::Absent);
        assert_ne!(burn.id, tron.id);

        assert_eq!(v.list(false)?.len(), 2);
        Ok(())
    }
}
