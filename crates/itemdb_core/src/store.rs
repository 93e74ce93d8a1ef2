//! The store: a database file plus the in-memory machinery around it.
//!
//! A [`Store`] owns one SQLite database (or a region of its parent's, for
//! attached children), the identity cache, the per-store type-id maps, and
//! the transaction state. All item traffic flows through it.

use crate::cache::ItemCache;
use crate::config::Config;
use crate::dir::StoreDir;
use crate::error::{EngineError, EngineResult};
use crate::item::{ItemRef, ItemState};
use crate::layout;
use crate::query::Query;
use crate::schema::{SchemaRegistry, TypeDescriptor};
use crate::transaction::TxnState;
use crate::types::{SchemaVersion, StoreId, TypeId, TOMBSTONE_TYPE_ID};
use crate::upgrade::{PendingUpgrade, UpgradeFailure};
use crate::value::Value;
use itemdb_sql::{SqlConnection, SqlValue};
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::rc::{Rc, Weak};
use std::sync::Arc;

/// Row counts per stored type, as reported by [`Store::type_counts`].
#[derive(Debug, Clone)]
pub struct TypeCount {
    /// The stored type name.
    pub type_name: String,
    /// The stored version.
    pub version: SchemaVersion,
    /// Live rows in the type's data table.
    pub rows: u64,
}

pub(crate) struct StoreInner {
    conn: SqlConnection,
    registry: Arc<SchemaRegistry>,
    config: Config,
    dir: Option<StoreDir>,
    prefix: String,
    pub(crate) cache: ItemCache,
    pub(crate) type_ids: RefCell<HashMap<(String, SchemaVersion), TypeId>>,
    pub(crate) type_rows: RefCell<HashMap<TypeId, (String, SchemaVersion)>>,
    pub(crate) txn: RefCell<Option<TxnState>>,
    pub(crate) in_post_commit: Cell<bool>,
    pub(crate) upgrading: RefCell<HashSet<StoreId>>,
    pub(crate) pending_upgrades: RefCell<Vec<PendingUpgrade>>,
    pub(crate) upgrade_failures: RefCell<Vec<UpgradeFailure>>,
    parent: Option<Rc<StoreInner>>,
    children: RefCell<Vec<Weak<StoreInner>>>,
    /// Weak handle to this store's own allocation, so items can be given
    /// a back-link without keeping the store alive through them.
    pub(crate) weak_self: Weak<StoreInner>,
}

impl StoreInner {
    /// Strong handle to this store. Valid for as long as any method can
    /// run, since methods are only reachable through a live `Rc`.
    pub(crate) fn rc(&self) -> Rc<StoreInner> {
        self.weak_self.upgrade().expect("store allocation is live")
    }

    pub(crate) fn conn(&self) -> &SqlConnection {
        &self.conn
    }

    pub(crate) fn registry(&self) -> &Arc<SchemaRegistry> {
        &self.registry
    }

    pub(crate) fn prefix(&self) -> &str {
        &self.prefix
    }

    pub(crate) fn table_for(&self, descriptor: &TypeDescriptor) -> String {
        layout::table_name(&self.prefix, descriptor.type_name(), descriptor.version())
    }

    pub(crate) fn cache_evict(&self, id: StoreId) {
        self.cache.evict(id);
    }

    /// Walks to the root of the attachment chain; the root owns the
    /// transaction.
    pub(crate) fn root(&self) -> Rc<StoreInner> {
        let mut current = self.rc();
        while let Some(parent) = current.parent.clone() {
            current = parent;
        }
        current
    }

    /// Returns the root plus every live attached descendant.
    pub(crate) fn family(&self) -> Vec<Rc<StoreInner>> {
        let root = self.root();
        let mut out = vec![Rc::clone(&root)];
        let mut frontier = vec![root];
        while let Some(store) = frontier.pop() {
            for child in store.children.borrow().iter().filter_map(Weak::upgrade) {
                out.push(Rc::clone(&child));
                frontier.push(child);
            }
        }
        out
    }

    pub(crate) fn txn_active(&self) -> bool {
        self.root().txn.borrow().is_some()
    }

    /// Rejects mutations issued from inside a post-commit callback.
    pub(crate) fn ensure_mutable(&self) -> EngineResult<()> {
        if self.root().in_post_commit.get() {
            Err(EngineError::ChangeRejected)
        } else {
            Ok(())
        }
    }

    /// Registers a mutated item with the open transaction, or checkpoints
    /// it immediately in autocommit mode.
    pub(crate) fn note_mutation(&self, item: &ItemRef) -> EngineResult<()> {
        if self.txn_active() {
            let mut txn = self.txn.borrow_mut();
            txn.get_or_insert_with(TxnState::new).touch(item);
            return Ok(());
        }
        item.checkpoint(self)?;
        let hook_result = match item.commit_hook() {
            Some(hook) => {
                let root = self.root();
                root.in_post_commit.set(true);
                let result = hook(&Store::from_inner(self.rc()), item);
                root.in_post_commit.set(false);
                result
            }
            None => Ok(()),
        };
        item.finalize_commit(self);
        hook_result
    }

    /// Checkpoints every touched item across the attachment family, in
    /// store-id order per store. Queries call this so SELECTs observe
    /// preceding writes in the same transaction.
    pub(crate) fn flush_touched(&self) -> EngineResult<()> {
        if !self.txn_active() {
            return Ok(());
        }
        for store in self.family() {
            let touched: Vec<ItemRef> = match store.txn.borrow().as_ref() {
                Some(state) => state.touched.values().cloned().collect(),
                None => continue,
            };
            for item in touched {
                item.checkpoint(&store)?;
            }
        }
        Ok(())
    }

    /// Checks whether an `objects` row exists and is not tombstoned.
    pub(crate) fn object_exists(&self, id: StoreId) -> EngineResult<bool> {
        let row = self.conn.fetch_one(
            &format!("SELECT type_id FROM {}objects WHERE oid = ?", self.prefix),
            &[SqlValue::Integer(id.as_i64())],
        )?;
        Ok(matches!(
            row.as_deref(),
            Some([SqlValue::Integer(tid)]) if *tid != TOMBSTONE_TYPE_ID.as_i64()
        ))
    }

    /// Checks whether the live instance for `id` (if any) is marked
    /// deleting.
    pub(crate) fn is_deleting(&self, id: StoreId) -> EngineResult<bool> {
        match self.cache.get(id) {
            Ok(Some(cell)) => Ok(cell.borrow().deleting),
            Ok(None) | Err(EngineError::CacheFault { .. }) => Ok(false),
            Err(other) => Err(other),
        }
    }

    /// Looks up the type id for `(type_name, version)` without
    /// provisioning, consulting the in-memory map and then the metadata.
    pub(crate) fn find_type_id(
        &self,
        type_name: &str,
        version: SchemaVersion,
    ) -> EngineResult<Option<TypeId>> {
        let key = (type_name.to_string(), version);
        if let Some(id) = self.type_ids.borrow().get(&key) {
            return Ok(Some(*id));
        }
        match self.scan_type_row(type_name, version)? {
            Some(id) => {
                self.type_ids.borrow_mut().insert(key, id);
                self.type_rows
                    .borrow_mut()
                    .insert(id, (type_name.to_string(), version));
                Ok(Some(id))
            }
            None => Ok(None),
        }
    }

    fn scan_type_row(
        &self,
        type_name: &str,
        version: SchemaVersion,
    ) -> EngineResult<Option<TypeId>> {
        let row = self.conn.fetch_one(
            &format!(
                "SELECT oid FROM {}types WHERE type_name = ? AND version = ?",
                self.prefix
            ),
            &[
                SqlValue::Text(type_name.to_string()),
                SqlValue::Integer(i64::from(version.as_u32())),
            ],
        )?;
        Ok(row
            .and_then(|r| r[0].as_integer())
            .map(TypeId::new))
    }

    /// Resolves a type id back to `(type_name, version)`.
    pub(crate) fn type_info(&self, type_id: TypeId) -> EngineResult<(String, SchemaVersion)> {
        if let Some(info) = self.type_rows.borrow().get(&type_id) {
            return Ok(info.clone());
        }
        let row = self
            .conn
            .fetch_one(
                &format!(
                    "SELECT type_name, version FROM {}types WHERE oid = ?",
                    self.prefix
                ),
                &[SqlValue::Integer(type_id.as_i64())],
            )?
            .ok_or_else(|| {
                EngineError::misuse(format!("no metadata row for {type_id}"))
            })?;
        let name = row[0]
            .as_text()
            .ok_or_else(|| EngineError::misuse("corrupt types row"))?
            .to_string();
        let version = SchemaVersion::new(row[1].as_integer().unwrap_or_default() as u32);
        self.type_rows
            .borrow_mut()
            .insert(type_id, (name.clone(), version));
        self.type_ids
            .borrow_mut()
            .insert((name.clone(), version), type_id);
        Ok((name, version))
    }

    /// Returns the type id for a descriptor, provisioning the data table
    /// and metadata rows on the first reference in this store.
    pub(crate) fn type_id(&self, descriptor: &Arc<TypeDescriptor>) -> EngineResult<TypeId> {
        let key = (
            descriptor.type_name().to_string(),
            descriptor.version(),
        );
        if let Some(id) = self.type_ids.borrow().get(&key) {
            return Ok(*id);
        }
        if self.txn_active() {
            self.provision_type(descriptor, true)
        } else {
            // A short transaction of its own, so a concurrent creator and
            // we agree on exactly one winner.
            self.conn.execute("BEGIN IMMEDIATE TRANSACTION", &[])?;
            match self.provision_type(descriptor, false) {
                Ok(id) => {
                    self.conn.execute("COMMIT", &[])?;
                    Ok(id)
                }
                Err(err) => {
                    let _ = self.conn.execute("ROLLBACK", &[]);
                    Err(err)
                }
            }
        }
    }

    fn provision_type(
        &self,
        descriptor: &Arc<TypeDescriptor>,
        in_user_txn: bool,
    ) -> EngineResult<TypeId> {
        // Re-scan in case another process provisioned since we last looked.
        if let Some(id) = self.scan_type_row(descriptor.type_name(), descriptor.version())? {
            self.remember_type(descriptor, id);
            return Ok(id);
        }
        match self
            .conn
            .execute(&layout::create_table_sql(&self.prefix, descriptor), &[])
        {
            Ok(_) => {}
            Err(itemdb_sql::SqlError::TableAlreadyExists { .. }) => {
                // Benign race: the other creator also wrote the metadata.
                if let Some(id) =
                    self.scan_type_row(descriptor.type_name(), descriptor.version())?
                {
                    self.remember_type(descriptor, id);
                    return Ok(id);
                }
                return Err(EngineError::misuse(format!(
                    "table for {} {} exists without metadata",
                    descriptor.type_name(),
                    descriptor.version()
                )));
            }
            Err(err) => return Err(err.into()),
        }
        for sql in layout::create_index_sqls(&self.prefix, descriptor) {
            self.conn.execute(&sql, &[])?;
        }
        self.conn.execute(
            &format!(
                "INSERT INTO {}types (type_name, module_name, version) VALUES (?, ?, ?)",
                self.prefix
            ),
            &[
                SqlValue::Text(descriptor.type_name().to_string()),
                SqlValue::Text(descriptor.module_name().to_string()),
                SqlValue::Integer(i64::from(descriptor.version().as_u32())),
            ],
        )?;
        let type_id = TypeId::new(self.conn.last_insert_rowid());
        for (offset, attribute) in descriptor.attributes().iter().enumerate() {
            self.conn.execute(
                &format!(
                    "INSERT INTO {}attributes \
                     (type_id, row_offset, indexed, sql_type, allow_none, \
                      value_type, attribute_name, docstring) \
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
                    self.prefix
                ),
                &[
                    SqlValue::Integer(type_id.as_i64()),
                    SqlValue::Integer(offset as i64),
                    SqlValue::Integer(i64::from(attribute.is_indexed())),
                    SqlValue::Text(attribute.kind().sql_type().to_string()),
                    SqlValue::Integer(i64::from(attribute.allows_none())),
                    SqlValue::Text(attribute.kind().canonical_name()),
                    SqlValue::Text(attribute.name().to_string()),
                    match attribute.docstring() {
                        Some(doc) => SqlValue::Text(doc.to_string()),
                        None => SqlValue::Null,
                    },
                ],
            )?;
        }
        self.remember_type(descriptor, type_id);
        if in_user_txn {
            if let Some(state) = self.txn.borrow_mut().as_mut() {
                state.record_table(descriptor.type_name().to_string(), descriptor.version());
            }
        }
        tracing::debug!(
            type_name = descriptor.type_name(),
            version = descriptor.version().as_u32(),
            "provisioned type table"
        );
        Ok(type_id)
    }

    fn remember_type(&self, descriptor: &TypeDescriptor, id: TypeId) {
        self.type_ids.borrow_mut().insert(
            (descriptor.type_name().to_string(), descriptor.version()),
            id,
        );
        self.type_rows.borrow_mut().insert(
            id,
            (descriptor.type_name().to_string(), descriptor.version()),
        );
    }

    /// Drops `(type_name, version)` entries provisioned in a rolled-back
    /// transaction from the in-memory maps.
    pub(crate) fn forget_tables(&self, tables: &[(String, SchemaVersion)]) {
        for (name, version) in tables {
            let key = (name.clone(), *version);
            if let Some(id) = self.type_ids.borrow_mut().remove(&key) {
                self.type_rows.borrow_mut().remove(&id);
            }
        }
    }

    /// Fetches and decodes an item's full data row.
    pub(crate) fn fetch_item_row(
        &self,
        descriptor: &TypeDescriptor,
        id: StoreId,
    ) -> EngineResult<Vec<Value>> {
        let columns: Vec<&str> = descriptor.attributes().iter().map(|a| a.name()).collect();
        let table = self.table_for(descriptor);
        let row = self
            .conn
            .fetch_one(
                &format!("SELECT {} FROM {table} WHERE oid = ?", columns.join(", ")),
                &[SqlValue::Integer(id.as_i64())],
            )?
            .ok_or_else(|| {
                EngineError::misuse(format!("data row missing for {id} in {table}"))
            })?;
        descriptor
            .attributes()
            .iter()
            .zip(row)
            .map(|(attribute, stored)| attribute.decode(&stored))
            .collect()
    }

    /// Validates and encodes a full attribute row for a type: provided
    /// values where given, declared defaults elsewhere. Returns the
    /// normalized in-memory values and the encoded storage values, both in
    /// declaration order.
    pub(crate) fn encode_full_row(
        &self,
        descriptor: &TypeDescriptor,
        values: &[(&str, Value)],
    ) -> EngineResult<(Vec<Value>, Vec<SqlValue>)> {
        let mut provided: HashMap<&str, &Value> = HashMap::new();
        for (name, value) in values {
            if descriptor.attr_index(name).is_none() {
                return Err(EngineError::schema(format!(
                    "{} has no attribute {name}",
                    descriptor.type_name()
                )));
            }
            provided.insert(name, value);
        }

        let mut in_memory = Vec::with_capacity(descriptor.attributes().len());
        let mut encoded_row = Vec::with_capacity(descriptor.attributes().len());
        for attribute in descriptor.attributes() {
            let value = match provided.get(attribute.name()) {
                Some(value) => (*value).clone(),
                None => attribute.initial_value().ok_or_else(|| {
                    EngineError::constraint(
                        attribute.name(),
                        "no value provided and no default declared",
                    )
                })?,
            };
            let encoded = attribute.encode(&value)?;
            if let SqlValue::Integer(referent) = encoded {
                if matches!(
                    attribute.kind(),
                    crate::attribute::AttributeKind::Reference { .. }
                ) && !self.object_exists(StoreId::new(referent))?
                {
                    return Err(EngineError::BrokenReference {
                        referent: StoreId::new(referent),
                    });
                }
            }
            in_memory.push(attribute.decode(&encoded)?);
            encoded_row.push(encoded);
        }
        Ok((in_memory, encoded_row))
    }

    /// Creates a fresh item of a declared (current) type.
    pub(crate) fn create_item(
        &self,
        type_name: &str,
        values: &[(&str, Value)],
    ) -> EngineResult<ItemRef> {
        self.ensure_mutable()?;
        let descriptor = self
            .registry
            .current(type_name)
            .ok_or_else(|| EngineError::schema(format!("cannot create undeclared type {type_name}")))?;
        let type_id = self.type_id(&descriptor)?;

        let (in_memory, encoded_row) = self.encode_full_row(&descriptor, values)?;
        let dirty: std::collections::BTreeMap<usize, SqlValue> =
            encoded_row.into_iter().enumerate().collect();

        self.conn.execute(
            &format!("INSERT INTO {}objects (type_id) VALUES (?)", self.prefix),
            &[SqlValue::Integer(type_id.as_i64())],
        )?;
        let id = StoreId::new(self.conn.last_insert_rowid());

        let state = Rc::new(RefCell::new(ItemState {
            store: self.weak_self.clone(),
            store_id: id,
            descriptor: Arc::clone(&descriptor),
            type_id,
            values: Some(in_memory),
            dirty,
            ever_inserted: false,
            just_created: true,
            deleting: false,
            deleting_object: false,
            detached: false,
        }));
        self.cache.insert(id, &state)?;
        let item = ItemRef::from_state(state);
        self.note_mutation(&item)?;
        Ok(item)
    }

    /// Loads an item by id, consulting the identity cache first and
    /// running any required upgrade chain synchronously.
    pub(crate) fn load_item(&self, id: StoreId) -> EngineResult<ItemRef> {
        match self.cache.get(id) {
            Ok(Some(cell)) => {
                if cell.borrow().detached {
                    self.cache.evict(id);
                } else {
                    return Ok(ItemRef::from_state(cell));
                }
            }
            Ok(None) => {}
            // The fault already evicted the dead entry; fall through to a
            // fresh load.
            Err(EngineError::CacheFault { .. }) => {}
            Err(other) => return Err(other),
        }

        let type_id = self
            .conn
            .fetch_one(
                &format!("SELECT type_id FROM {}objects WHERE oid = ?", self.prefix),
                &[SqlValue::Integer(id.as_i64())],
            )?
            .and_then(|row| row[0].as_integer())
            .map(TypeId::new);
        let type_id = match type_id {
            Some(tid) if tid != TOMBSTONE_TYPE_ID => tid,
            _ => return Err(EngineError::ItemNotFound),
        };
        let (name, version) = self.type_info(type_id)?;
        let current = self
            .registry
            .current(&name)
            .ok_or_else(|| EngineError::UnknownItemType {
                type_name: name.clone(),
                version,
            })?;
        if version == current.version() {
            return self.load_current(id, &current, type_id);
        }
        if version > current.version() {
            return Err(EngineError::UnknownItemType {
                type_name: name,
                version,
            });
        }
        let upgraded = self.transact_inner(|| self.upgrade_stored_item(id))?;
        upgraded.ok_or(EngineError::ItemNotFound)
    }

    /// Constructs the live instance for a current-version row without
    /// touching its data table (attributes load on first access).
    pub(crate) fn load_current(
        &self,
        id: StoreId,
        descriptor: &Arc<TypeDescriptor>,
        type_id: TypeId,
    ) -> EngineResult<ItemRef> {
        let state = Rc::new(RefCell::new(ItemState {
            store: self.weak_self.clone(),
            store_id: id,
            descriptor: Arc::clone(descriptor),
            type_id,
            values: None,
            dirty: std::collections::BTreeMap::new(),
            ever_inserted: true,
            just_created: false,
            deleting: false,
            deleting_object: false,
            detached: false,
        }));
        if !descriptor.is_legacy() {
            self.cache.insert(id, &state)?;
        }
        Ok(ItemRef::from_state(state))
    }

    /// Turns a fetched row (`oid` followed by attribute columns) into an
    /// item, preferring the live cached instance over the row data.
    pub(crate) fn materialize_row(
        &self,
        descriptor: &Arc<TypeDescriptor>,
        type_id: TypeId,
        row: &[SqlValue],
    ) -> EngineResult<ItemRef> {
        let id = StoreId::new(
            row[0]
                .as_integer()
                .ok_or_else(|| EngineError::misuse("row without an oid"))?,
        );
        match self.cache.get(id) {
            Ok(Some(cell)) => return Ok(ItemRef::from_state(cell)),
            Ok(None) | Err(EngineError::CacheFault { .. }) => {}
            Err(other) => return Err(other),
        }
        let values: Vec<Value> = descriptor
            .attributes()
            .iter()
            .zip(&row[1..])
            .map(|(attribute, stored)| attribute.decode(stored))
            .collect::<EngineResult<_>>()?;
        let state = Rc::new(RefCell::new(ItemState {
            store: self.weak_self.clone(),
            store_id: id,
            descriptor: Arc::clone(descriptor),
            type_id,
            values: Some(values),
            dirty: std::collections::BTreeMap::new(),
            ever_inserted: true,
            just_created: false,
            deleting: false,
            deleting_object: false,
            detached: false,
        }));
        if !descriptor.is_legacy() {
            self.cache.insert(id, &state)?;
        }
        Ok(ItemRef::from_state(state))
    }

    fn ensure_base_tables(&self) -> EngineResult<()> {
        self.conn.execute(&layout::create_types_sql(&self.prefix), &[])?;
        self.conn
            .execute(&layout::create_objects_sql(&self.prefix), &[])?;
        self.conn
            .execute(&layout::create_attributes_sql(&self.prefix), &[])?;
        for sql in layout::create_metadata_index_sqls(&self.prefix) {
            self.conn.execute(&sql, &[])?;
        }
        Ok(())
    }
}

/// The top-level store handle.
///
/// Cloning is cheap and shares the same underlying store.
#[derive(Clone)]
pub struct Store {
    pub(crate) inner: Rc<StoreInner>,
}

impl Store {
    pub(crate) fn from_inner(inner: Rc<StoreInner>) -> Self {
        Self { inner }
    }

    /// Opens (or creates) a file-backed store with default configuration.
    ///
    /// The path names the store directory; the database lives at
    /// `db.sqlite` inside it, next to `files/`, `temp/`, and `run/`.
    pub fn open(path: &Path, registry: Arc<SchemaRegistry>) -> EngineResult<Self> {
        Self::open_with_config(path, registry, Config::default())
    }

    /// Opens (or creates) a file-backed store.
    ///
    /// # Errors
    ///
    /// Fails when the directory or database cannot be opened, and when the
    /// database contains types the registry cannot account for - unknown
    /// names ([`EngineError::UnknownItemType`]) or stored versions without
    /// a complete upgrader chain ([`EngineError::NoUpgradePath`]).
    pub fn open_with_config(
        path: &Path,
        registry: Arc<SchemaRegistry>,
        config: Config,
    ) -> EngineResult<Self> {
        let dir = StoreDir::open(path, config.create_if_missing, config.error_if_exists)?;
        let conn = SqlConnection::open(&dir.db_path(), config.connection_options())?;
        Self::finish_open(conn, registry, config, Some(dir), String::new(), None)
    }

    /// Opens a fresh in-memory store.
    pub fn open_in_memory(registry: Arc<SchemaRegistry>) -> EngineResult<Self> {
        let config = Config::default();
        let conn = SqlConnection::open_in_memory_with(config.connection_options())?;
        Self::finish_open(conn, registry, config, None, String::new(), None)
    }

    fn finish_open(
        conn: SqlConnection,
        registry: Arc<SchemaRegistry>,
        config: Config,
        dir: Option<StoreDir>,
        prefix: String,
        parent: Option<Rc<StoreInner>>,
    ) -> EngineResult<Self> {
        let inner = Rc::new_cyclic(|weak_self| StoreInner {
            conn,
            registry,
            config,
            dir,
            prefix,
            cache: ItemCache::new(),
            type_ids: RefCell::new(HashMap::new()),
            type_rows: RefCell::new(HashMap::new()),
            txn: RefCell::new(None),
            in_post_commit: Cell::new(false),
            upgrading: RefCell::new(HashSet::new()),
            pending_upgrades: RefCell::new(Vec::new()),
            upgrade_failures: RefCell::new(Vec::new()),
            parent,
            children: RefCell::new(Vec::new()),
            weak_self: weak_self.clone(),
        });
        inner.ensure_base_tables()?;
        inner.validate_stored_types()?;
        tracing::info!(
            prefix = inner.prefix.as_str(),
            pending_upgrades = inner.pending_upgrades.borrow().len(),
            "store open"
        );
        Ok(Self { inner })
    }

    /// Attaches a child store sharing this store's connection and
    /// transactional discipline.
    ///
    /// The child keeps its own metadata tables (namespaced by `name`), its
    /// own identity cache, and its own id space. References never cross
    /// between parent and child.
    pub fn attach_child(&self, name: &str) -> EngineResult<Store> {
        if name.is_empty()
            || !name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(EngineError::misuse(format!(
                "invalid child store name {name:?}"
            )));
        }
        let prefix = format!("{}sub_{name}_", self.inner.prefix);
        let child = Self::finish_open(
            self.inner.conn.clone(),
            Arc::clone(&self.inner.registry),
            self.inner.config.clone(),
            None,
            prefix,
            Some(Rc::clone(&self.inner)),
        )?;
        self.inner
            .children
            .borrow_mut()
            .push(Rc::downgrade(&child.inner));
        Ok(child)
    }

    /// Returns the schema registry this store was opened with.
    #[must_use]
    pub fn registry(&self) -> &Arc<SchemaRegistry> {
        self.inner.registry()
    }

    /// Returns the store directory for file-backed stores.
    #[must_use]
    pub fn dir(&self) -> Option<&StoreDir> {
        self.inner.dir.as_ref()
    }

    /// Checks whether two handles point at the same store.
    #[must_use]
    pub fn same_store(&self, other: &Store) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// Checks whether an explicit transaction is open.
    #[must_use]
    pub fn in_transaction(&self) -> bool {
        self.inner.txn_active()
    }

    /// Creates an item of a declared type.
    ///
    /// Attributes not listed fall back to their declared defaults; an
    /// attribute with neither a value nor a default is a constraint error.
    /// In autocommit mode the row is inserted immediately.
    pub fn create(&self, type_name: &str, values: &[(&str, Value)]) -> EngineResult<ItemRef> {
        self.inner.create_item(type_name, values)
    }

    /// Loads an item by id.
    ///
    /// Returns the live cached instance when one exists. A stored version
    /// older than the declared one is upgraded synchronously before the
    /// item is returned.
    ///
    /// # Errors
    ///
    /// [`EngineError::ItemNotFound`] for ids that were never assigned,
    /// were deleted, or whose upgrade deleted them.
    pub fn load(&self, id: StoreId) -> EngineResult<ItemRef> {
        self.inner.load_item(id)
    }

    /// Starts a query over items of a type.
    #[must_use]
    pub fn query(&self, type_name: &str) -> Query {
        Query::new(self.clone(), type_name)
    }

    /// Returns the first item matching the predicate, in id order.
    pub fn find_first(
        &self,
        type_name: &str,
        predicate: Option<crate::query::Predicate>,
    ) -> EngineResult<Option<ItemRef>> {
        let mut query = self.query(type_name).sort(
            crate::query::store_id_column(type_name),
            crate::query::SortDirection::Ascending,
        );
        if let Some(predicate) = predicate {
            query = query.filter(predicate);
        }
        Ok(query.limit(1).fetch()?.into_iter().next())
    }

    /// Returns the single item matching the predicate.
    ///
    /// # Errors
    ///
    /// [`EngineError::ItemNotFound`] when nothing matches and
    /// [`EngineError::DuplicateUniqueItem`] when more than one row does.
    pub fn find_unique(
        &self,
        type_name: &str,
        predicate: crate::query::Predicate,
    ) -> EngineResult<ItemRef> {
        let matches = self.query(type_name).filter(predicate).limit(2).fetch()?;
        match matches.len() {
            0 => Err(EngineError::ItemNotFound),
            1 => Ok(matches.into_iter().next().expect("length checked")),
            _ => Err(EngineError::DuplicateUniqueItem { count: 2 }),
        }
    }

    /// Finds an item whose listed attributes equal the given values, or
    /// creates one with exactly those values.
    pub fn find_or_create(
        &self,
        type_name: &str,
        values: &[(&str, Value)],
    ) -> EngineResult<ItemRef> {
        let mut clauses = Vec::with_capacity(values.len());
        for (name, value) in values {
            let column = crate::query::column(type_name, name);
            clauses.push(match value {
                Value::Null => column.is_null(),
                other => column.eq(other.clone()),
            });
        }
        let found = match clauses.len() {
            0 => self.find_first(type_name, None)?,
            1 => self.find_first(type_name, clauses.pop())?,
            _ => self.find_first(type_name, Some(crate::query::and(clauses)))?,
        };
        match found {
            Some(item) => Ok(item),
            None => self.create(type_name, values),
        }
    }

    /// Counts the items of one type.
    pub fn item_count(&self, type_name: &str) -> EngineResult<u64> {
        self.query(type_name).count()
    }

    /// Deletes every item of a type, applying deletion policies as usual.
    ///
    /// Returns how many items were deleted (not counting cascades).
    pub fn delete_all(&self, type_name: &str) -> EngineResult<u64> {
        self.transact(|s| {
            let items = s.query(type_name).fetch()?;
            let mut deleted = 0u64;
            for item in items {
                if !item.is_deleting() && !item.is_detached() {
                    item.delete()?;
                    deleted += 1;
                }
            }
            Ok(deleted)
        })
    }

    /// Returns live row counts for every type provisioned in this store.
    pub fn type_counts(&self) -> EngineResult<Vec<TypeCount>> {
        let rows = self.inner.conn().fetch(
            &format!(
                "SELECT type_name, version FROM {}types ORDER BY type_name, version",
                self.inner.prefix()
            ),
            &[],
        )?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let type_name = row[0]
                .as_text()
                .ok_or_else(|| EngineError::misuse("corrupt types row"))?
                .to_string();
            let version = SchemaVersion::new(row[1].as_integer().unwrap_or_default() as u32);
            let table = layout::table_name(self.inner.prefix(), &type_name, version);
            let count = self
                .inner
                .conn()
                .fetch_one(&format!("SELECT COUNT(*) FROM {table}"), &[])?
                .and_then(|r| r[0].as_integer())
                .unwrap_or_default();
            out.push(TypeCount {
                type_name,
                version,
                rows: count as u64,
            });
        }
        Ok(out)
    }

    /// Drops dead identity-cache entries, returning how many were removed.
    pub fn sweep_cache(&self) -> usize {
        self.inner.cache.sweep()
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("prefix", &self.inner.prefix)
            .field("in_transaction", &self.in_transaction())
            .field("cached", &self.inner.cache.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attribute::{AttributeDescriptor, AttributeKind};
    use crate::schema::TypeBuilder;

    fn registry() -> Arc<SchemaRegistry> {
        let registry = SchemaRegistry::new();
        registry
            .declare(
                TypeBuilder::new("test.widget", 1)
                    .attribute(AttributeDescriptor::new("name", AttributeKind::text()).indexed())
                    .attribute(
                        AttributeDescriptor::new("weight", AttributeKind::Integer)
                            .default_value(Value::Integer(0)),
                    )
                    .build()
                    .unwrap(),
            )
            .unwrap();
        Arc::new(registry)
    }

    fn store() -> Store {
        Store::open_in_memory(registry()).unwrap()
    }

    #[test]
    fn create_assigns_monotone_ids() {
        let store = store();
        let a = store.create("test.widget", &[("name", Value::from("a"))]).unwrap();
        let b = store.create("test.widget", &[("name", Value::from("b"))]).unwrap();
        assert!(a.store_id() < b.store_id());
    }

    #[test]
    fn create_uses_defaults() {
        let store = store();
        let item = store.create("test.widget", &[("name", Value::from("x"))]).unwrap();
        assert_eq!(item.get("weight").unwrap(), Value::Integer(0));
    }

    #[test]
    fn create_without_value_or_default_fails() {
        let store = store();
        let err = store.create("test.widget", &[]).unwrap_err();
        assert!(matches!(err, EngineError::Constraint { .. }));
    }

    #[test]
    fn create_unknown_type_fails() {
        let store = store();
        assert!(store.create("test.nope", &[]).is_err());
    }

    #[test]
    fn create_unknown_attribute_fails() {
        let store = store();
        let err = store
            .create("test.widget", &[("nope", Value::Integer(1))])
            .unwrap_err();
        assert!(matches!(err, EngineError::Schema { .. }));
    }

    #[test]
    fn load_returns_the_cached_instance() {
        let store = store();
        let item = store.create("test.widget", &[("name", Value::from("x"))]).unwrap();
        let loaded = store.load(item.store_id()).unwrap();
        assert!(item.same_item(&loaded));
    }

    #[test]
    fn load_after_instance_dies_rereads_sql() {
        let store = store();
        let id = {
            let item = store
                .create("test.widget", &[("name", Value::from("persist"))])
                .unwrap();
            item.store_id()
        };
        // The only strong handle is gone; the cache entry is dead.
        let loaded = store.load(id).unwrap();
        assert_eq!(loaded.get("name").unwrap(), Value::from("persist"));
    }

    #[test]
    fn load_unknown_id_fails() {
        let store = store();
        assert!(matches!(
            store.load(StoreId::new(999)),
            Err(EngineError::ItemNotFound)
        ));
    }

    #[test]
    fn set_is_visible_immediately_and_persisted() {
        let store = store();
        let item = store.create("test.widget", &[("name", Value::from("x"))]).unwrap();
        item.set("weight", Value::Integer(42)).unwrap();
        assert_eq!(item.get("weight").unwrap(), Value::Integer(42));

        drop(item);
        let reloaded = store.load(StoreId::new(1)).unwrap();
        assert_eq!(reloaded.get("weight").unwrap(), Value::Integer(42));
    }

    #[test]
    fn delete_tombstones_the_object_row() {
        let store = store();
        let item = store.create("test.widget", &[("name", Value::from("x"))]).unwrap();
        let id = item.store_id();
        item.delete().unwrap();

        assert!(item.is_detached());
        assert!(matches!(store.load(id), Err(EngineError::ItemNotFound)));

        // The oid is still claimed by the tombstone, so the next creation
        // gets a fresh id.
        let next = store.create("test.widget", &[("name", Value::from("y"))]).unwrap();
        assert!(next.store_id() > id);
    }

    #[test]
    fn operations_on_deleted_items_fail() {
        let store = store();
        let item = store.create("test.widget", &[("name", Value::from("x"))]).unwrap();
        item.delete().unwrap();
        assert!(item.get("name").is_err());
        assert!(item.set("name", Value::from("y")).is_err());
    }

    #[test]
    fn find_or_create_round_trip() {
        let store = store();
        let first = store
            .find_or_create("test.widget", &[("name", Value::from("only"))])
            .unwrap();
        let second = store
            .find_or_create("test.widget", &[("name", Value::from("only"))])
            .unwrap();
        assert!(first.same_item(&second));
        assert_eq!(store.query("test.widget").count().unwrap(), 1);
    }

    #[test]
    fn find_unique_errors() {
        let store = store();
        let missing = store.find_unique(
            "test.widget",
            crate::query::column("test.widget", "name").eq(Value::from("none")),
        );
        assert!(matches!(missing, Err(EngineError::ItemNotFound)));

        store.create("test.widget", &[("name", Value::from("dup"))]).unwrap();
        store.create("test.widget", &[("name", Value::from("dup"))]).unwrap();
        let dup = store.find_unique(
            "test.widget",
            crate::query::column("test.widget", "name").eq(Value::from("dup")),
        );
        assert!(matches!(dup, Err(EngineError::DuplicateUniqueItem { .. })));
    }

    #[test]
    fn type_counts_reports_provisioned_types() {
        let store = store();
        store.create("test.widget", &[("name", Value::from("a"))]).unwrap();
        store.create("test.widget", &[("name", Value::from("b"))]).unwrap();
        let counts = store.type_counts().unwrap();
        let widget = counts
            .iter()
            .find(|c| c.type_name == "test.widget")
            .unwrap();
        assert_eq!(widget.rows, 2);
    }

    #[test]
    fn attached_child_is_isolated() {
        let store = store();
        let child = store.attach_child("inbox").unwrap();

        let parent_item = store.create("test.widget", &[("name", Value::from("p"))]).unwrap();
        let child_item = child.create("test.widget", &[("name", Value::from("c"))]).unwrap();

        assert_eq!(store.query("test.widget").count().unwrap(), 1);
        assert_eq!(child.query("test.widget").count().unwrap(), 1);

        // Cross-store references are rejected.
        let err = parent_item.set_reference("name", &child_item).unwrap_err();
        assert!(matches!(err, EngineError::NoCrossStoreReferences));
    }

    #[test]
    fn child_store_name_is_validated() {
        let store = store();
        assert!(store.attach_child("").is_err());
        assert!(store.attach_child("has space").is_err());
        assert!(store.attach_child("ok_name").is_ok());
    }

    #[test]
    fn file_backed_store_reopens() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("store");
        let id = {
            let store = Store::open(&path, registry()).unwrap();
            store
                .create("test.widget", &[("name", Value::from("durable"))])
                .unwrap()
                .store_id()
        };
        let store = Store::open(&path, registry()).unwrap();
        let item = store.load(id).unwrap();
        assert_eq!(item.get("name").unwrap(), Value::from("durable"));
    }

    #[test]
    fn error_if_exists_is_honored() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("store");
        drop(Store::open(&path, registry()).unwrap());
        let config = Config::new().error_if_exists(true);
        assert!(Store::open_with_config(&path, registry(), config).is_err());
    }
}
