//! Items: persistent records and the dirty-write engine.
//!
//! An [`ItemRef`] is a cloneable handle to the single live in-memory
//! instance of a record. Attribute writes go through the declaring
//! attribute's in-filter into a dirty map of pending storage values;
//! a checkpoint turns the dirty map into an INSERT, UPDATE, or DELETE.
//! In autocommit mode every mutation checkpoints immediately; inside a
//! transaction the item joins the touched set and is flushed at commit.

use crate::attribute::{AttributeKind, DeletionPolicy};
use crate::error::{EngineError, EngineResult};
use crate::layout;
use crate::schema::TypeDescriptor;
use crate::store::StoreInner;
use crate::types::{SchemaVersion, StoreId, TypeId, TOMBSTONE_TYPE_ID};
use crate::value::Value;
use itemdb_sql::SqlValue;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::{Rc, Weak};
use std::sync::Arc;

/// The state behind one live item instance.
pub(crate) struct ItemState {
    /// The owning store. Set once at construction; an item never moves
    /// between stores.
    pub(crate) store: Weak<StoreInner>,
    pub(crate) store_id: StoreId,
    pub(crate) descriptor: Arc<TypeDescriptor>,
    pub(crate) type_id: TypeId,
    /// In-memory attribute values, in declaration order. Loaded from the
    /// data row on first access for items that came from disk.
    pub(crate) values: Option<Vec<Value>>,
    /// Pending storage values keyed by attribute position.
    pub(crate) dirty: BTreeMap<usize, SqlValue>,
    pub(crate) ever_inserted: bool,
    pub(crate) just_created: bool,
    pub(crate) deleting: bool,
    pub(crate) deleting_object: bool,
    /// Set when the item has been deleted or its creation rolled back;
    /// all further operations fail.
    pub(crate) detached: bool,
}

pub(crate) type ItemStateCell = Rc<RefCell<ItemState>>;

/// A handle to a persistent record.
///
/// Clones share the same underlying instance; within one store there is at
/// most one live instance per [`StoreId`], so two loads of the same id hand
/// back handles to identical state.
#[derive(Clone)]
pub struct ItemRef {
    pub(crate) state: ItemStateCell,
}

impl ItemRef {
    pub(crate) fn from_state(state: ItemStateCell) -> Self {
        Self { state }
    }

    /// Returns the item's store id.
    #[must_use]
    pub fn store_id(&self) -> StoreId {
        self.state.borrow().store_id
    }

    /// Returns the item's type name.
    #[must_use]
    pub fn type_name(&self) -> String {
        self.state.borrow().descriptor.type_name().to_string()
    }

    /// Returns the item's schema version.
    #[must_use]
    pub fn schema_version(&self) -> SchemaVersion {
        self.state.borrow().descriptor.version()
    }

    /// Returns the item's type descriptor.
    #[must_use]
    pub fn descriptor(&self) -> Arc<TypeDescriptor> {
        Arc::clone(&self.state.borrow().descriptor)
    }

    /// Checks whether this item has been deleted (or its creation rolled
    /// back) and detached from its store.
    #[must_use]
    pub fn is_detached(&self) -> bool {
        self.state.borrow().detached
    }

    /// Checks whether two handles point at the same live instance.
    #[must_use]
    pub fn same_item(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.state, &other.state)
    }

    fn store(&self) -> EngineResult<Rc<StoreInner>> {
        self.state
            .borrow()
            .store
            .upgrade()
            .ok_or_else(|| EngineError::misuse("the item's store has been dropped"))
    }

    /// The store this item belongs to.
    pub(crate) fn owning_store(&self) -> EngineResult<Rc<StoreInner>> {
        self.store()
    }

    fn ensure_usable(&self) -> EngineResult<()> {
        let state = self.state.borrow();
        if state.detached {
            return Err(EngineError::misuse(format!(
                "item {} has been deleted",
                state.store_id
            )));
        }
        Ok(())
    }

    fn attr_index(&self, attribute: &str) -> EngineResult<usize> {
        let state = self.state.borrow();
        state.descriptor.attr_index(attribute).ok_or_else(|| {
            EngineError::schema(format!(
                "{} has no attribute {attribute}",
                state.descriptor.type_name()
            ))
        })
    }

    /// Reads an attribute value.
    ///
    /// The first read of an item that came from disk pulls its full data
    /// row.
    pub fn get(&self, attribute: &str) -> EngineResult<Value> {
        self.ensure_usable()?;
        let index = self.attr_index(attribute)?;
        let store = self.store()?;
        self.ensure_loaded(&store)?;
        let state = self.state.borrow();
        Ok(state.values.as_ref().expect("loaded above")[index].clone())
    }

    /// Writes an attribute value.
    ///
    /// The value is validated and encoded by the attribute's in-filter;
    /// the encoded form lands in the dirty map and the normalized form in
    /// the in-memory values, visible immediately. The write reaches SQL at
    /// the next checkpoint.
    pub fn set(&self, attribute: &str, value: Value) -> EngineResult<()> {
        self.ensure_usable()?;
        let store = self.store()?;
        store.ensure_mutable()?;
        let index = self.attr_index(attribute)?;

        let (encoded, normalized) = {
            let state = self.state.borrow();
            let descriptor = &state.descriptor.attributes()[index];
            let encoded = descriptor.encode(&value)?;
            let normalized = descriptor.decode(&encoded)?;
            (encoded, normalized)
        };

        // A raw reference assignment still has to point at something that
        // exists in this store.
        if let Value::Reference(referent) = normalized {
            if !store.object_exists(referent)? {
                return Err(EngineError::BrokenReference { referent });
            }
        }

        self.ensure_loaded(&store)?;
        {
            let mut state = self.state.borrow_mut();
            state.values.as_mut().expect("loaded above")[index] = normalized;
            state.dirty.insert(index, encoded);
        }
        store.note_mutation(self)
    }

    /// Assigns a reference attribute from another item handle.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NoCrossStoreReferences`] when the referent
    /// lives in a different store.
    pub fn set_reference(&self, attribute: &str, referent: &ItemRef) -> EngineResult<()> {
        let own = self.store()?;
        let other = referent.store()?;
        if !Rc::ptr_eq(&own, &other) {
            return Err(EngineError::NoCrossStoreReferences);
        }
        self.set(attribute, Value::Reference(referent.store_id()))
    }

    /// Resolves a reference attribute to the referent item.
    ///
    /// Returns `None` for a null reference, and also for a gone referent
    /// when the attribute's deletion policy is nullify. A gone referent
    /// under any other policy is a [`EngineError::BrokenReference`].
    pub fn reference(&self, attribute: &str) -> EngineResult<Option<ItemRef>> {
        let index = self.attr_index(attribute)?;
        let policy = {
            let state = self.state.borrow();
            match state.descriptor.attributes()[index].kind() {
                AttributeKind::Reference { policy } => policy,
                _ => {
                    return Err(EngineError::schema(format!(
                        "{attribute} is not a reference attribute"
                    )))
                }
            }
        };
        match self.get(attribute)? {
            Value::Null => Ok(None),
            Value::Reference(referent) => {
                let store = self.store()?;
                match store.load_item(referent) {
                    Ok(item) => Ok(Some(item)),
                    Err(EngineError::ItemNotFound) => {
                        if policy == DeletionPolicy::Nullify {
                            Ok(None)
                        } else {
                            Err(EngineError::BrokenReference { referent })
                        }
                    }
                    Err(other) => Err(other),
                }
            }
            other => Err(EngineError::constraint(
                attribute,
                format!("stored reference has kind {}", other.kind_name()),
            )),
        }
    }

    /// Deletes this item.
    ///
    /// Reference attributes pointing at it are handled per their declared
    /// policy: cascade referrers are deleted in the same transaction,
    /// disallow referrers block the deletion, nullify referrers are left
    /// alone. In autocommit mode the row is removed immediately; inside a
    /// transaction it goes at commit.
    pub fn delete(&self) -> EngineResult<()> {
        self.ensure_usable()?;
        let store = self.store()?;
        store.ensure_mutable()?;
        if self.state.borrow().deleting {
            return Ok(());
        }
        let id = self.store_id();

        // Mark first so reference scans and cascade cycles see this item
        // as already on its way out.
        {
            let mut state = self.state.borrow_mut();
            state.deleting = true;
            state.deleting_object = true;
        }

        let result = self.cascade_referrers(&store, id);
        if let Err(err) = result {
            let mut state = self.state.borrow_mut();
            state.deleting = false;
            state.deleting_object = false;
            return Err(err);
        }

        store.note_mutation(self)
    }

    /// Applies deletion policies for every reference attribute that may
    /// point at `id`.
    fn cascade_referrers(&self, store: &StoreInner, id: StoreId) -> EngineResult<()> {
        for source in store.registry().reference_sources() {
            let Some(_) = store.find_type_id(&source.type_name, source.version)? else {
                // Type never provisioned in this store; nothing can refer.
                continue;
            };
            let table = layout::table_name(store.prefix(), &source.type_name, source.version);
            let sql = format!("SELECT oid FROM {table} WHERE {} = ?", source.attribute);
            let rows = store.conn().fetch(&sql, &[SqlValue::Integer(id.as_i64())])?;
            for row in rows {
                let referrer = StoreId::new(row[0].as_integer().unwrap_or_default());
                match source.policy {
                    DeletionPolicy::Nullify => {}
                    DeletionPolicy::Disallow => {
                        // A referrer already being deleted does not block.
                        if !store.is_deleting(referrer)? {
                            return Err(EngineError::DeletionDisallowed {
                                target: id,
                                referrer,
                                attribute: format!("{}.{}", source.type_name, source.attribute),
                            });
                        }
                    }
                    DeletionPolicy::Cascade => {
                        let item = store.load_item(referrer)?;
                        item.delete()?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Flushes this item's pending state to SQL.
    ///
    /// Delete path: remove the data row, and tombstone the `objects` row
    /// when the whole object is going away. Insert path: first flush writes
    /// the full row. Update path: exactly the dirty columns.
    pub(crate) fn checkpoint(&self, store: &StoreInner) -> EngineResult<()> {
        let (id, descriptor, deleting, deleting_object, ever_inserted) = {
            let state = self.state.borrow();
            (
                state.store_id,
                Arc::clone(&state.descriptor),
                state.deleting,
                state.deleting_object,
                state.ever_inserted,
            )
        };
        let table = store.table_for(&descriptor);

        if deleting {
            if ever_inserted {
                store.conn().execute(
                    &format!("DELETE FROM {table} WHERE oid = ?"),
                    &[SqlValue::Integer(id.as_i64())],
                )?;
            }
            if deleting_object {
                store.conn().execute(
                    &format!(
                        "UPDATE {}objects SET type_id = ? WHERE oid = ?",
                        store.prefix()
                    ),
                    &[
                        SqlValue::Integer(TOMBSTONE_TYPE_ID.as_i64()),
                        SqlValue::Integer(id.as_i64()),
                    ],
                )?;
            }
            self.state.borrow_mut().dirty.clear();
            return Ok(());
        }

        if !ever_inserted {
            let (columns, args) = {
                let state = self.state.borrow();
                let values = state.values.as_ref().ok_or_else(|| {
                    EngineError::misuse("fresh item has no attribute values")
                })?;
                let mut columns = vec!["oid".to_string()];
                let mut args = vec![SqlValue::Integer(id.as_i64())];
                for (index, attribute) in descriptor.attributes().iter().enumerate() {
                    columns.push(attribute.name().to_string());
                    match state.dirty.get(&index) {
                        Some(encoded) => args.push(encoded.clone()),
                        None => args.push(attribute.encode(&values[index])?),
                    }
                }
                (columns, args)
            };
            let placeholders = vec!["?"; columns.len()].join(", ");
            store.conn().execute(
                &format!(
                    "INSERT INTO {table} ({}) VALUES ({placeholders})",
                    columns.join(", ")
                ),
                &args,
            )?;
            let mut state = self.state.borrow_mut();
            state.ever_inserted = true;
            state.dirty.clear();
            return Ok(());
        }

        let (assignments, args) = {
            let state = self.state.borrow();
            if state.dirty.is_empty() {
                return Ok(());
            }
            let mut assignments = Vec::with_capacity(state.dirty.len());
            let mut args = Vec::with_capacity(state.dirty.len() + 1);
            for (index, encoded) in &state.dirty {
                assignments.push(format!("{} = ?", descriptor.attributes()[*index].name()));
                args.push(encoded.clone());
            }
            args.push(SqlValue::Integer(id.as_i64()));
            (assignments, args)
        };
        store.conn().execute(
            &format!(
                "UPDATE {table} SET {} WHERE oid = ?",
                assignments.join(", ")
            ),
            &args,
        )?;
        self.state.borrow_mut().dirty.clear();
        Ok(())
    }

    /// Restores in-memory state after a rollback.
    ///
    /// An item created inside the rolled-back transaction is evicted from
    /// the cache and detached; anything else is re-read from its row with
    /// the load path replayed for every attribute.
    pub(crate) fn revert(&self, store: &StoreInner) -> EngineResult<()> {
        let (id, just_created, had_values) = {
            let state = self.state.borrow();
            (state.store_id, state.just_created, state.values.is_some())
        };
        if just_created {
            store.cache_evict(id);
            let mut state = self.state.borrow_mut();
            state.detached = true;
            state.dirty.clear();
            return Ok(());
        }
        {
            let mut state = self.state.borrow_mut();
            state.dirty.clear();
            state.deleting = false;
            state.deleting_object = false;
            // Drop the loaded values; the next access re-reads the row.
            state.values = None;
        }
        if had_values {
            let s = self.store()?;
            self.ensure_loaded(&s)?;
        }
        Ok(())
    }

    /// Loads the item's data row if it isn't in memory yet.
    ///
    /// TODO: fetch single attributes on demand; today a load always pulls
    /// the full row.
    pub(crate) fn ensure_loaded(&self, store: &StoreInner) -> EngineResult<()> {
        let (id, descriptor, loaded) = {
            let state = self.state.borrow();
            (
                state.store_id,
                Arc::clone(&state.descriptor),
                state.values.is_some(),
            )
        };
        if loaded {
            return Ok(());
        }
        let values = store.fetch_item_row(&descriptor, id)?;
        self.state.borrow_mut().values = Some(values);
        Ok(())
    }

    pub(crate) fn is_deleting(&self) -> bool {
        self.state.borrow().deleting
    }

    /// Returns the post-commit hook for this item's outcome: the deleted
    /// hook when the commit removed it, the committed hook otherwise.
    pub(crate) fn commit_hook(&self) -> Option<crate::schema::ItemHook> {
        let state = self.state.borrow();
        if state.deleting {
            state.descriptor.deleted_hook().cloned()
        } else {
            state.descriptor.committed_hook().cloned()
        }
    }

    /// Final post-commit bookkeeping, run after the hook: deleted items
    /// are uncached and detached, survivors shed their creation flag.
    pub(crate) fn finalize_commit(&self, store: &StoreInner) {
        let (deleting, id) = {
            let state = self.state.borrow();
            (state.deleting, state.store_id)
        };
        let mut state = self.state.borrow_mut();
        if deleting {
            store.cache_evict(id);
            state.detached = true;
            state.deleting = false;
            state.deleting_object = false;
        } else {
            state.just_created = false;
        }
    }
}

impl std::fmt::Debug for ItemRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.borrow();
        f.debug_struct("ItemRef")
            .field("store_id", &state.store_id)
            .field("type_name", &state.descriptor.type_name())
            .field("version", &state.descriptor.version())
            .field("dirty", &state.dirty.len())
            .field("detached", &state.detached)
            .finish()
    }
}
