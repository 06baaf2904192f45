//! Display order of wallet entries and per-key-type derivation counters.

use crate::{
    errors::VaultError,
    store::{MemoryStore, RecordStore},
    wallet::{DerivationCounter, EntryPatch, KeyType, WalletEntry},
};
use std::cmp::Ordering;

/// Order index ascending (unset last), then newest first, then id.
pub fn display_cmp(a: &WalletEntry, b: &WalletEntry) -> Ordering {
    let by_index = match (a.order_index, b.order_index) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    };
    by_index
        .then_with(|| b.created_at.cmp(&a.created_at))
        .then_with(|| a.id.cmp(&b.id))
}

pub fn sort_for_display(entries: &mut [WalletEntry]) {
    entries.sort_by(display_cmp);
}

/// One past the highest order index among active rows; 0 for an empty vault.
pub fn next_order_index(entries: &[WalletEntry]) -> i64 {
    entries
        .iter()
        .filter(|e| !e.deleted())
        .filter_map(|e| e.order_index)
        .max()
        .map_or(0, |m| m.saturating_add(1))
}

/// Move the entry at `from` to `to` and return the ids in their new order.
///
/// `entries` must already be in display order. Returns `None` when `from == to`.
pub fn reorder_ids(
    entries: &[WalletEntry],
    from: usize,
    to: usize,
) -> Result<Option<Vec<String>>, VaultError> {
    let len = entries.len();
    for position in [from, to] {
        if position >= len {
            return Err(VaultError::IndexRange { position, len });
        }
    }
    if from == to {
        return Ok(None);
    }
    let mut ids: Vec<String> = entries.iter().map(|e| e.id.clone()).collect();
    let moved = ids.remove(from);
    ids.insert(to, moved);
    Ok(Some(ids))
}

/// Counter and order bookkeeping over a record store. Callers hold the vault lock.
pub struct OrderingLedger<'a, S: RecordStore> {
    store: &'a mut S,
}

impl<'a, S: RecordStore> OrderingLedger<'a, S> {
    pub const fn new(store: &'a mut S) -> Self {
        Self { store }
    }

    pub fn next_derivation_index(&self, key_type: KeyType) -> Result<u32, VaultError> {
        Ok(self
            .store
            .counter(key_type)?
            .map_or(0, |c| c.next_index))
    }

    /// First index that is past the counter and past every derived row of `key_type`, deleted
    /// ones included. Rows written without their counter bump never get handed out twice.
    pub fn next_free_derivation_index(&self, key_type: KeyType) -> Result<u32, VaultError> {
        let counter = self.next_derivation_index(key_type)?;
        let stored = self
            .store
            .entries()?
            .iter()
            .filter(|e| e.key_type == key_type)
            .filter_map(|e| e.derivation_index)
            .max()
            .map_or(0, |i| i.saturating_add(1));
        Ok(counter.max(stored))
    }

    /// Bump the counter past `derived_index`. Never lowers it.
    pub fn advance_derivation_counter(
        &mut self,
        key_type: KeyType,
        derived_index: u32,
    ) -> Result<u32, VaultError> {
        let current = self.next_derivation_index(key_type)?;
        let next = current.max(derived_index.saturating_add(1));
        if next != current {
            self.store.put_counter(DerivationCounter {
                key_type,
                next_index: next,
            })?;
            tracing::debug!(%key_type, next_index = next, "derivation counter advanced");
        }
        Ok(next)
    }

    pub fn next_order_index(&self) -> Result<i64, VaultError> {
        Ok(next_order_index(&self.store.entries()?))
    }

    /// Active rows in display order.
    pub fn active_sorted(&self) -> Result<Vec<WalletEntry>, VaultError> {
        let mut active: Vec<WalletEntry> = self
            .store
            .entries()?
            .into_iter()
            .filter(|e| !e.deleted())
            .collect();
        sort_for_display(&mut active);
        Ok(active)
    }

    /// Move one active row and rewrite every active row's order index to `0..n`.
    pub fn reorder(&mut self, from: usize, to: usize) -> Result<Vec<WalletEntry>, VaultError> {
        let active = self.active_sorted()?;
        let Some(ids) = reorder_ids(&active, from, to)? else {
            return Ok(active);
        };

        let out = self.store.transact(|tx| renumber(tx, &active, ids))?;
        tracing::info!(from, to, len = out.len(), "wallets reordered");
        Ok(out)
    }
}

/// Write positions `0..n` in `ids` order, skipping rows already in place.
fn renumber(
    tx: &mut MemoryStore,
    active: &[WalletEntry],
    ids: Vec<String>,
) -> Result<Vec<WalletEntry>, VaultError> {
    let mut out = Vec::with_capacity(ids.len());
    for (position, id) in (0_i64..).zip(ids) {
        let Some(current) = active.iter().find(|e| e.id == id) else {
            return Err(VaultError::EntryNotFound(id));
        };
        if current.order_index == Some(position) {
            out.push(current.clone());
            continue;
        }
        let patch = EntryPatch {
            order_index: Some(Some(position)),
            ..EntryPatch::default()
        };
        out.push(tx.update_entry(&id, &patch)?);
    }
    Ok(out)
}
