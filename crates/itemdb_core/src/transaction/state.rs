//! Per-transaction bookkeeping.

use crate::item::ItemRef;
use crate::types::{SchemaVersion, StoreId};
use std::collections::BTreeMap;

/// State tracked by one store for the duration of an open transaction.
///
/// The touched map is keyed by store id so flushes and post-commit hooks
/// run in id order. Tables provisioned during the transaction are recorded
/// so a rollback can evict them from the in-memory type maps, and items
/// swapped by upgraders are recorded so a rollback can drop their cache
/// entries.
#[derive(Default)]
pub(crate) struct TxnState {
    /// Items created, mutated, or marked for deletion this transaction.
    pub(crate) touched: BTreeMap<StoreId, ItemRef>,
    /// Per-type tables created during this transaction.
    pub(crate) tables_created: Vec<(String, SchemaVersion)>,
    /// Items replaced in the cache by upgrade steps this transaction.
    pub(crate) upgraded: Vec<StoreId>,
}

impl TxnState {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Registers an item as touched. Re-registration is a no-op that keeps
    /// the first handle.
    pub(crate) fn touch(&mut self, item: &ItemRef) {
        self.touched.entry(item.store_id()).or_insert_with(|| item.clone());
    }

    /// Records a table created during this transaction.
    pub(crate) fn record_table(&mut self, type_name: String, version: SchemaVersion) {
        self.tables_created.push((type_name, version));
    }

    /// Records an item whose cache entry was swapped by an upgrade step.
    pub(crate) fn record_upgraded(&mut self, id: StoreId) {
        self.upgraded.push(id);
    }
}
