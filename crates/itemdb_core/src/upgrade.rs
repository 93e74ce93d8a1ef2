//! The schema-evolution orchestrator.
//!
//! At open, every stored `(type_name, version)` is checked against the
//! registry: unknown names fail the open, older versions get a synthesized
//! legacy placeholder and must have a complete upgrader chain to the
//! current version. Upgrade work then runs one item at a time - either
//! driven by [`Store::upgrade_step`] from the host's scheduler, or
//! synchronously when application code loads an outdated item.

use crate::attribute::{AttributeDescriptor, AttributeKind};
use crate::error::{EngineError, EngineResult};
use crate::item::{ItemRef, ItemState};
use crate::store::{Store, StoreInner};
use crate::types::{SchemaVersion, StoreId, TypeId, TOMBSTONE_TYPE_ID};
use crate::value::Value;
use itemdb_sql::SqlValue;
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

/// One stored type shape that is older than its declared version.
#[derive(Debug, Clone)]
pub(crate) struct PendingUpgrade {
    pub(crate) type_name: String,
    pub(crate) version: SchemaVersion,
}

/// A recorded upgrader failure, keyed by `(type_name, version, store_id)`.
///
/// Failed items are skipped by further upgrade work rather than retried
/// forever.
#[derive(Debug, Clone)]
pub struct UpgradeFailure {
    /// The type whose upgrader failed.
    pub type_name: String,
    /// The version the item was at.
    pub version: SchemaVersion,
    /// The item that failed.
    pub store_id: StoreId,
    /// The upgrader's error, rendered.
    pub message: String,
}

/// Summary of a `run_upgrades_to_completion` pass.
#[derive(Debug, Clone)]
pub struct UpgradeReport {
    /// Items the pass attempted (successful chains plus skipped failures).
    pub steps: u64,
    /// Failures recorded during the pass (and before it).
    pub failures: Vec<UpgradeFailure>,
}

impl StoreInner {
    /// Walks the `types` metadata at open: fills the in-memory type maps,
    /// synthesizes legacy placeholders for outdated shapes, and verifies
    /// that every outdated shape has a full upgrader chain.
    pub(crate) fn validate_stored_types(&self) -> EngineResult<()> {
        let rows = self.conn().fetch(
            &format!(
                "SELECT oid, type_name, version FROM {}types",
                self.prefix()
            ),
            &[],
        )?;
        for row in rows {
            let type_id = TypeId::new(row[0].as_integer().unwrap_or_default());
            let name = row[1]
                .as_text()
                .ok_or_else(|| EngineError::misuse("corrupt types row"))?
                .to_string();
            let version = SchemaVersion::new(row[2].as_integer().unwrap_or_default() as u32);

            self.type_ids
                .borrow_mut()
                .insert((name.clone(), version), type_id);
            self.type_rows
                .borrow_mut()
                .insert(type_id, (name.clone(), version));

            let Some(current) = self.registry().current(&name) else {
                return Err(EngineError::UnknownItemType {
                    type_name: name,
                    version,
                });
            };
            if version == current.version() {
                continue;
            }
            if version > current.version() {
                return Err(EngineError::UnknownItemType {
                    type_name: name,
                    version,
                });
            }

            let attributes = self.read_attribute_metadata(type_id)?;
            self.registry().synthesize_legacy(&name, version, attributes)?;

            if !self
                .registry()
                .has_upgrade_path(&name, version, current.version())
            {
                return Err(EngineError::NoUpgradePath {
                    type_name: name,
                    from: version,
                    to: current.version(),
                });
            }
            // Every intermediate step needs a shape to pass through.
            for step in version.as_u32() + 1..current.version().as_u32() {
                if self
                    .registry()
                    .descriptor(&name, SchemaVersion::new(step))
                    .is_none()
                {
                    return Err(EngineError::NoUpgradePath {
                        type_name: name,
                        from: version,
                        to: current.version(),
                    });
                }
            }

            tracing::info!(
                type_name = name.as_str(),
                from = version.as_u32(),
                to = current.version().as_u32(),
                "stored type needs upgrade"
            );
            self.pending_upgrades.borrow_mut().push(PendingUpgrade {
                type_name: name,
                version,
            });
        }
        Ok(())
    }

    /// Rebuilds an old shape's attribute descriptors from the `attributes`
    /// metadata table.
    fn read_attribute_metadata(
        &self,
        type_id: TypeId,
    ) -> EngineResult<Vec<AttributeDescriptor>> {
        let rows = self.conn().fetch(
            &format!(
                "SELECT attribute_name, value_type, indexed, allow_none, docstring \
                 FROM {}attributes WHERE type_id = ? ORDER BY row_offset",
                self.prefix()
            ),
            &[SqlValue::Integer(type_id.as_i64())],
        )?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let name = row[0]
                .as_text()
                .ok_or_else(|| EngineError::misuse("corrupt attributes row"))?;
            let kind_text = row[1]
                .as_text()
                .ok_or_else(|| EngineError::misuse("corrupt attributes row"))?;
            let kind = AttributeKind::parse(kind_text).ok_or_else(|| {
                EngineError::misuse(format!("unparseable stored attribute kind {kind_text:?}"))
            })?;
            let mut descriptor = AttributeDescriptor::new(name, kind);
            if row[2].as_integer() == Some(1) {
                descriptor = descriptor.indexed();
            }
            if row[3].as_integer() == Some(1) {
                descriptor = descriptor.allow_none();
            }
            if let Some(doc) = row[4].as_text() {
                descriptor = descriptor.doc(doc);
            }
            out.push(descriptor);
        }
        Ok(out)
    }

    /// Runs the full upgrade chain for one stored item, returning the
    /// current-version instance or `None` when an upgrader deleted it.
    ///
    /// Re-entry on the same id (an upgrader loading the item it is
    /// upgrading) is a fatal [`EngineError::UpgraderRecursion`].
    pub(crate) fn upgrade_stored_item(
        &self,
        id: StoreId,
    ) -> EngineResult<Option<ItemRef>> {
        if !self.upgrading.borrow_mut().insert(id) {
            return Err(EngineError::UpgraderRecursion { store_id: id });
        }
        let result = self.run_upgrade_chain(id);
        self.upgrading.borrow_mut().remove(&id);

        if let Err(EngineError::ItemUpgrade {
            type_name,
            from,
            store_id,
            source,
            ..
        }) = &result
        {
            tracing::warn!(
                type_name = type_name.as_str(),
                version = from.as_u32(),
                store_id = store_id.as_i64(),
                error = %source,
                "upgrader failed; item skipped"
            );
            self.upgrade_failures.borrow_mut().push(UpgradeFailure {
                type_name: type_name.clone(),
                version: *from,
                store_id: *store_id,
                message: source.to_string(),
            });
        }
        result
    }

    fn run_upgrade_chain(&self, id: StoreId) -> EngineResult<Option<ItemRef>> {
        loop {
            let type_id = self
                .conn()
                .fetch_one(
                    &format!("SELECT type_id FROM {}objects WHERE oid = ?", self.prefix()),
                    &[SqlValue::Integer(id.as_i64())],
                )?
                .and_then(|row| row[0].as_integer())
                .map(TypeId::new);
            let type_id = match type_id {
                Some(tid) if tid != TOMBSTONE_TYPE_ID => tid,
                _ => return Ok(None),
            };
            let (name, version) = self.type_info(type_id)?;
            let current =
                self.registry()
                    .current(&name)
                    .ok_or_else(|| EngineError::UnknownItemType {
                        type_name: name.clone(),
                        version,
                    })?;
            if version == current.version() {
                // The previous step cached the final instance; hand back
                // the same one.
                match self.cache.get(id) {
                    Ok(Some(cell)) => return Ok(Some(ItemRef::from_state(cell))),
                    Ok(None) | Err(EngineError::CacheFault { .. }) => {
                        return self.load_current(id, &current, type_id).map(Some)
                    }
                    Err(other) => return Err(other),
                }
            }
            if version > current.version() {
                return Err(EngineError::UnknownItemType {
                    type_name: name,
                    version,
                });
            }

            let upgrader = self.registry().upgrader(&name, version).ok_or_else(|| {
                EngineError::NoUpgradePath {
                    type_name: name.clone(),
                    from: version,
                    to: current.version(),
                }
            })?;
            let old_descriptor =
                self.registry()
                    .descriptor(&name, version)
                    .ok_or_else(|| EngineError::NoUpgradePath {
                        type_name: name.clone(),
                        from: version,
                        to: current.version(),
                    })?;

            // The intermediate instance from the previous step is a real,
            // cached item; reuse it rather than building a second live
            // instance for the same id.
            let old_item = match self.cache.get(id) {
                Ok(Some(cell)) => ItemRef::from_state(cell),
                Ok(None) | Err(EngineError::CacheFault { .. }) => {
                    let state = Rc::new(RefCell::new(ItemState {
                        store: self.weak_self.clone(),
                        store_id: id,
                        descriptor: Arc::clone(&old_descriptor),
                        type_id,
                        values: None,
                        dirty: std::collections::BTreeMap::new(),
                        ever_inserted: true,
                        just_created: false,
                        deleting: false,
                        deleting_object: false,
                        detached: false,
                    }));
                    ItemRef::from_state(state)
                }
                Err(other) => return Err(other),
            };

            let handle = Store::from_inner(self.rc());
            match upgrader(&handle, &old_item) {
                Ok(Some(new_item)) => {
                    if new_item.store_id() != id {
                        return Err(EngineError::misuse(
                            "upgrader returned an item with a different id",
                        ));
                    }
                }
                Ok(None) => {
                    let table = self.table_for(&old_descriptor);
                    self.conn().execute(
                        &format!("DELETE FROM {table} WHERE oid = ?"),
                        &[SqlValue::Integer(id.as_i64())],
                    )?;
                    self.conn().execute(
                        &format!(
                            "UPDATE {}objects SET type_id = ? WHERE oid = ?",
                            self.prefix()
                        ),
                        &[
                            SqlValue::Integer(TOMBSTONE_TYPE_ID.as_i64()),
                            SqlValue::Integer(id.as_i64()),
                        ],
                    )?;
                    self.cache_evict(id);
                    return Ok(None);
                }
                Err(err @ EngineError::UpgraderRecursion { .. }) => return Err(err),
                Err(err) => {
                    return Err(EngineError::ItemUpgrade {
                        type_name: name,
                        from: version,
                        to: version.next(),
                        store_id: id,
                        source: Box::new(err),
                    })
                }
            }
        }
    }
}

impl Store {
    /// Replaces an old-shape item with its next-version instance, keeping
    /// the same store id.
    ///
    /// This is the primitive upgraders use: it inserts the new-version
    /// row, repoints the `objects` row, deletes the old row, and swaps the
    /// identity-cache entry. The returned item is a fully ordinary item of
    /// the next version - visible to later upgraders in the chain.
    pub fn upgrade_replace(
        &self,
        old: &ItemRef,
        values: &[(&str, Value)],
    ) -> EngineResult<ItemRef> {
        let inner = &self.inner;
        let (id, old_descriptor) = (old.store_id(), old.descriptor());
        let name = old_descriptor.type_name().to_string();
        let from = old_descriptor.version();
        let to = from.next();

        let current = inner
            .registry()
            .current(&name)
            .ok_or_else(|| EngineError::UnknownItemType {
                type_name: name.clone(),
                version: from,
            })?;
        let target = if to == current.version() {
            current
        } else {
            inner
                .registry()
                .legacy(&name, to)
                .ok_or_else(|| EngineError::NoUpgradePath {
                    type_name: name.clone(),
                    from,
                    to: current.version(),
                })?
        };
        let target_type_id = inner.type_id(&target)?;

        let (in_memory, encoded) = inner.encode_full_row(&target, values)?;
        let mut columns = vec!["oid".to_string()];
        columns.extend(target.attributes().iter().map(|a| a.name().to_string()));
        let mut args = vec![SqlValue::Integer(id.as_i64())];
        args.extend(encoded);
        let placeholders = vec!["?"; columns.len()].join(", ");
        inner.conn().execute(
            &format!(
                "INSERT INTO {} ({}) VALUES ({placeholders})",
                inner.table_for(&target),
                columns.join(", ")
            ),
            &args,
        )?;
        inner.conn().execute(
            &format!(
                "UPDATE {}objects SET type_id = ? WHERE oid = ?",
                inner.prefix()
            ),
            &[
                SqlValue::Integer(target_type_id.as_i64()),
                SqlValue::Integer(id.as_i64()),
            ],
        )?;
        inner.conn().execute(
            &format!(
                "DELETE FROM {} WHERE oid = ?",
                inner.table_for(&old_descriptor)
            ),
            &[SqlValue::Integer(id.as_i64())],
        )?;

        old.state.borrow_mut().detached = true;
        inner.cache_evict(id);

        let state = Rc::new(RefCell::new(ItemState {
            store: Rc::downgrade(inner),
            store_id: id,
            descriptor: Arc::clone(&target),
            type_id: target_type_id,
            values: Some(in_memory),
            dirty: std::collections::BTreeMap::new(),
            ever_inserted: true,
            just_created: false,
            deleting: false,
            deleting_object: false,
            detached: false,
        }));
        inner.cache.insert(id, &state)?;
        if inner.txn_active() {
            if let Some(txn) = inner.txn.borrow_mut().as_mut() {
                txn.record_upgraded(id);
            }
        }
        Ok(ItemRef::from_state(state))
    }

    /// Performs one bounded unit of upgrade work.
    ///
    /// Picks any remaining item of an outdated type and runs its chain in
    /// a transaction. Returns whether more work may remain. An upgrader
    /// failure is recorded and skipped; it does not stop the loop.
    pub fn upgrade_step(&self) -> EngineResult<bool> {
        let inner = &self.inner;
        let pending = inner.pending_upgrades.borrow().clone();
        let mut drained = Vec::new();
        for (index, entry) in pending.iter().enumerate() {
            let table = crate::layout::table_name(inner.prefix(), &entry.type_name, entry.version);
            let failed: Vec<String> = inner
                .upgrade_failures
                .borrow()
                .iter()
                .filter(|f| f.type_name == entry.type_name && f.version == entry.version)
                .map(|f| f.store_id.as_i64().to_string())
                .collect();
            let sql = if failed.is_empty() {
                format!("SELECT oid FROM {table} LIMIT 1")
            } else {
                format!(
                    "SELECT oid FROM {table} WHERE oid NOT IN ({}) LIMIT 1",
                    failed.join(", ")
                )
            };
            let row = inner.conn().fetch_one(&sql, &[])?;
            let Some(row) = row else {
                if failed.is_empty() {
                    drained.push(index);
                }
                continue;
            };
            let id = StoreId::new(row[0].as_integer().unwrap_or_default());
            let result = inner.transact_inner(|| inner.upgrade_stored_item(id));
            match result {
                Ok(_) | Err(EngineError::ItemUpgrade { .. }) => return Ok(true),
                Err(other) => return Err(other),
            }
        }
        if !drained.is_empty() {
            let mut pending = inner.pending_upgrades.borrow_mut();
            for index in drained.into_iter().rev() {
                pending.remove(index);
            }
        }
        Ok(false)
    }

    /// Runs upgrade steps until none remain, then reports what happened.
    ///
    /// After a report with no failures, no row of any outdated version
    /// remains in the store.
    pub fn run_upgrades_to_completion(&self) -> EngineResult<UpgradeReport> {
        let mut steps = 0u64;
        while self.upgrade_step()? {
            steps += 1;
        }
        Ok(UpgradeReport {
            steps,
            failures: self.upgrade_failures(),
        })
    }

    /// Returns the recorded upgrader failures.
    #[must_use]
    pub fn upgrade_failures(&self) -> Vec<UpgradeFailure> {
        self.inner.upgrade_failures.borrow().clone()
    }

    /// Checks whether any stored type still awaits upgrade work.
    #[must_use]
    pub fn needs_upgrade(&self) -> bool {
        !self.inner.pending_upgrades.borrow().is_empty()
    }
}
