//! Lifecycle state machine for a (key type, canonical address) pair.
//!
//! `reconcile` is pure: it looks at the current row (if any) and an event, and returns the
//! write the vault must perform. The vault owns lookups, persistence and ordering.

use crate::{
    errors::VaultError,
    wallet::{EntryOrigin, EntryPatch, EntryState, KeyType, NewEntry, SealedCredential, WalletEntry},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    ImportAddress,
    ImportPrivateKey { credential: SealedCredential },
    DeriveAt { index: u32, credential: SealedCredential },
    SoftDelete { scrub: bool },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// New row. The vault assigns `order_index` before writing.
    Insert(NewEntry),
    /// In-place update. `refresh_order` is set whenever the row ends up Active through this
    /// event; `restored` marks a Deleted* → Active transition.
    Update {
        id: String,
        patch: EntryPatch,
        refresh_order: bool,
        restored: bool,
    },
    /// Nothing to write.
    Unchanged { id: String },
}

impl Decision {
    /// Derivation index this write stores, if any. The counter advances only for these.
    pub fn stored_derivation_index(&self) -> Option<u32> {
        match self {
            Self::Insert(row) => row.derivation_index,
            Self::Update { patch, .. } => patch.derivation_index.flatten(),
            Self::Unchanged { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub from: EntryState,
    pub to: EntryState,
    pub decision: Decision,
}

fn state_of(current: Option<&WalletEntry>) -> EntryState {
    current.map_or(EntryState::Absent, WalletEntry::state)
}

fn insert(
    key_type: KeyType,
    address: &str,
    origin: EntryOrigin,
    credential: Option<SealedCredential>,
    derivation_index: Option<u32>,
) -> Decision {
    Decision::Insert(NewEntry {
        address: address.to_owned(),
        origin,
        encrypted_credential: credential,
        key_type,
        derivation_index,
        order_index: None,
    })
}

/// Patch that makes `e` Active with the given capability, rewriting a legacy address spelling.
fn activate(
    e: &WalletEntry,
    address: &str,
    origin: EntryOrigin,
    credential: Option<SealedCredential>,
    derivation_index: Option<u32>,
) -> Decision {
    let restored = e.deleted();
    Decision::Update {
        id: e.id.clone(),
        patch: EntryPatch {
            address: (e.address != address).then(|| address.to_owned()),
            origin: Some(origin),
            encrypted_credential: Some(credential),
            derivation_index: Some(derivation_index),
            is_deleted: restored.then_some(false),
            ..EntryPatch::default()
        },
        refresh_order: true,
        restored,
    }
}

fn soft_delete(e: &WalletEntry, scrub: bool) -> Decision {
    let scrub = scrub && e.origin != EntryOrigin::Derived;
    let mut patch = EntryPatch {
        is_deleted: Some(true),
        is_selected: e.selected().then_some(false),
        ..EntryPatch::default()
    };
    if scrub {
        patch.address = Some(e.key_type.burn_address().to_owned());
        if e.has_credential() {
            patch.encrypted_credential = Some(Some(SealedCredential::burned(e.key_type)));
        }
    }
    Decision::Update {
        id: e.id.clone(),
        patch,
        refresh_order: false,
        restored: false,
    }
}

/// Decide how `event` applies to the row currently stored for (`key_type`, `address`).
///
/// `address` must already be canonical for `key_type`.
pub fn reconcile(
    key_type: KeyType,
    address: &str,
    current: Option<&WalletEntry>,
    event: Event,
) -> Result<Transition, VaultError> {
    use EntryState as S;

    let from = state_of(current);
    let (to, decision) = match (current, event) {
        (None, Event::ImportAddress) => (
            S::WatchOnlyActive,
            insert(key_type, address, EntryOrigin::WatchOnly, None, None),
        ),
        (None, Event::ImportPrivateKey { credential }) => (
            S::ImportedActive,
            insert(key_type, address, EntryOrigin::Imported, Some(credential), None),
        ),
        (None, Event::DeriveAt { index, credential }) => (
            S::DerivedActive,
            insert(
                key_type,
                address,
                EntryOrigin::Derived,
                Some(credential),
                Some(index),
            ),
        ),
        (None, Event::SoftDelete { .. }) => {
            return Err(VaultError::EntryNotFound(address.to_owned()))
        }

        (Some(e), Event::ImportAddress) => match from {
            S::WatchOnlyActive | S::DeletedWatchOnly => return Err(VaultError::AlreadyWatchOnly),
            S::ImportedActive | S::DerivedActive if e.has_credential() => {
                return Err(VaultError::CapabilityDowngradeRefused)
            }
            S::ImportedActive | S::DerivedActive => return Err(VaultError::AlreadyWatchOnly),
            // A deleted key-bearing row comes back as watch-only; its old credential is dropped.
            S::DeletedImported | S::DeletedDerived | S::Absent => (
                S::WatchOnlyActive,
                activate(e, address, EntryOrigin::WatchOnly, None, None),
            ),
        },

        (Some(e), Event::ImportPrivateKey { credential }) => match from {
            S::ImportedActive | S::DerivedActive => {
                return Err(VaultError::AlreadyHasCredential)
            }
            S::WatchOnlyActive | S::DeletedWatchOnly | S::DeletedImported | S::Absent => (
                S::ImportedActive,
                activate(e, address, EntryOrigin::Imported, Some(credential), None),
            ),
            // Same secret as a derived row: keep it derived so it stays re-derivable.
            S::DeletedDerived => (
                S::DerivedActive,
                activate(
                    e,
                    address,
                    EntryOrigin::Derived,
                    Some(credential),
                    e.derivation_index,
                ),
            ),
        },

        (Some(e), Event::DeriveAt { index, credential }) => match from {
            S::DerivedActive if e.address == address => {
                (S::DerivedActive, Decision::Unchanged { id: e.id.clone() })
            }
            S::DerivedActive => (
                S::DerivedActive,
                Decision::Update {
                    id: e.id.clone(),
                    patch: EntryPatch {
                        address: Some(address.to_owned()),
                        ..EntryPatch::default()
                    },
                    refresh_order: false,
                    restored: false,
                },
            ),
            S::Absent
            | S::WatchOnlyActive
            | S::ImportedActive
            | S::DeletedWatchOnly
            | S::DeletedImported
            | S::DeletedDerived => (
                S::DerivedActive,
                activate(
                    e,
                    address,
                    EntryOrigin::Derived,
                    Some(credential),
                    Some(index),
                ),
            ),
        },

        (Some(e), Event::SoftDelete { scrub }) => match from {
            S::WatchOnlyActive => (S::DeletedWatchOnly, soft_delete(e, scrub)),
            S::ImportedActive => (S::DeletedImported, soft_delete(e, scrub)),
            S::DerivedActive => (S::DeletedDerived, soft_delete(e, scrub)),
            S::DeletedWatchOnly | S::DeletedImported | S::DeletedDerived | S::Absent => {
                (from, Decision::Unchanged { id: e.id.clone() })
            }
        },
    };

    Ok(Transition { from, to, decision })
}
