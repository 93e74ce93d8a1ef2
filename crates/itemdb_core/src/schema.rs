//! Type descriptors and the process-wide schema registry.
//!
//! Item "classes" are [`TypeDescriptor`] values built at registration time.
//! The registry holds two maps - `type_name -> current` and
//! `(type_name, version) -> legacy` - plus the upgrader table, the reverse
//! reference list used by deletion, and the powerup interface metadata.
//! Everything here is mutated at declaration time and read-only afterward.

use crate::attribute::{AttributeDescriptor, AttributeKind, DeletionPolicy};
use crate::error::{EngineError, EngineResult};
use crate::item::ItemRef;
use crate::store::Store;
use crate::types::SchemaVersion;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

/// Hook invoked on an item after commit or after deletion.
pub type ItemHook = Arc<dyn Fn(&Store, &ItemRef) -> EngineResult<()> + Send + Sync>;

/// One registered version step: consumes the old-shape item and returns the
/// next-version item (via [`Store::upgrade_replace`]) or `None` to delete.
pub type Upgrader = Arc<dyn Fn(&Store, &ItemRef) -> EngineResult<Option<ItemRef>> + Send + Sync>;

/// Resolves a powerup indirection for an interface name.
pub type Indirector = Arc<dyn Fn(&Store, &ItemRef, &str) -> EngineResult<ItemRef> + Send + Sync>;

/// The interface name reserved for indirection itself.
///
/// Powering an item up for this interface is rejected: resolving it would
/// recurse forever.
pub const INDIRECTOR_INTERFACE: &str = "itemdb.indirector";

/// Type name of the built-in powerup link type.
pub const POWERUP_LINK_TYPE: &str = "itemdb.powerup_link";

/// A reference attribute somewhere in the schema, recorded so deletion can
/// find every table that may point at a dying item.
#[derive(Debug, Clone)]
pub struct ReferenceSource {
    /// Type that declares the reference.
    pub type_name: String,
    /// Version of the declaring shape.
    pub version: SchemaVersion,
    /// Name of the referencing attribute.
    pub attribute: String,
    /// Deletion policy declared on the reference.
    pub policy: DeletionPolicy,
}

/// The declared shape of an item type.
///
/// Identity is `(type_name, version)`. Descriptors are immutable once
/// built; there is no derivation mechanism between them, so one type can
/// never extend another.
#[derive(Clone)]
pub struct TypeDescriptor {
    type_name: String,
    module_name: String,
    version: SchemaVersion,
    attributes: Vec<AttributeDescriptor>,
    compound_indexes: Vec<Vec<String>>,
    legacy: bool,
    on_committed: Option<ItemHook>,
    on_deleted: Option<ItemHook>,
}

impl TypeDescriptor {
    /// Returns the stable dotted type name.
    #[must_use]
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// Returns the declaring module name (informational).
    #[must_use]
    pub fn module_name(&self) -> &str {
        &self.module_name
    }

    /// Returns the schema version.
    #[must_use]
    pub fn version(&self) -> SchemaVersion {
        self.version
    }

    /// Returns the attributes in declaration order.
    #[must_use]
    pub fn attributes(&self) -> &[AttributeDescriptor] {
        &self.attributes
    }

    /// Returns the position of an attribute by name.
    #[must_use]
    pub fn attr_index(&self, name: &str) -> Option<usize> {
        self.attributes.iter().position(|a| a.name() == name)
    }

    /// Returns an attribute descriptor by name.
    #[must_use]
    pub fn attribute(&self, name: &str) -> Option<&AttributeDescriptor> {
        self.attributes.iter().find(|a| a.name() == name)
    }

    /// Returns the declared compound index tuples.
    #[must_use]
    pub fn compound_indexes(&self) -> &[Vec<String>] {
        &self.compound_indexes
    }

    /// Whether this descriptor stands in for an old on-disk shape.
    #[must_use]
    pub fn is_legacy(&self) -> bool {
        self.legacy
    }

    /// Returns the post-commit hook, if declared.
    #[must_use]
    pub fn committed_hook(&self) -> Option<&ItemHook> {
        self.on_committed.as_ref()
    }

    /// Returns the post-deletion hook, if declared.
    #[must_use]
    pub fn deleted_hook(&self) -> Option<&ItemHook> {
        self.on_deleted.as_ref()
    }
}

impl fmt::Debug for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeDescriptor")
            .field("type_name", &self.type_name)
            .field("version", &self.version)
            .field("attributes", &self.attributes.len())
            .field("legacy", &self.legacy)
            .finish_non_exhaustive()
    }
}

/// Builder for [`TypeDescriptor`].
pub struct TypeBuilder {
    type_name: String,
    module_name: String,
    version: SchemaVersion,
    attributes: Vec<AttributeDescriptor>,
    compound_indexes: Vec<Vec<String>>,
    legacy: bool,
    on_committed: Option<ItemHook>,
    on_deleted: Option<ItemHook>,
}

impl TypeBuilder {
    /// Starts a declaration for `type_name` at `version`.
    #[must_use]
    pub fn new(type_name: impl Into<String>, version: u32) -> Self {
        Self {
            type_name: type_name.into(),
            module_name: String::new(),
            version: SchemaVersion::new(version),
            attributes: Vec::new(),
            compound_indexes: Vec::new(),
            legacy: false,
            on_committed: None,
            on_deleted: None,
        }
    }

    /// Records the declaring module name.
    #[must_use]
    pub fn module(mut self, module_name: impl Into<String>) -> Self {
        self.module_name = module_name.into();
        self
    }

    /// Appends an attribute.
    #[must_use]
    pub fn attribute(mut self, attribute: AttributeDescriptor) -> Self {
        self.attributes.push(attribute);
        self
    }

    /// Declares a compound index over the named attributes.
    #[must_use]
    pub fn compound_index(mut self, attributes: &[&str]) -> Self {
        self.compound_indexes
            .push(attributes.iter().map(|s| s.to_string()).collect());
        self
    }

    /// Marks the declaration as an old shape (used only during upgrades).
    #[must_use]
    pub fn legacy(mut self) -> Self {
        self.legacy = true;
        self
    }

    /// Registers a hook run after each commit that touched an item of this
    /// type.
    #[must_use]
    pub fn on_committed(
        mut self,
        f: impl Fn(&Store, &ItemRef) -> EngineResult<()> + Send + Sync + 'static,
    ) -> Self {
        self.on_committed = Some(Arc::new(f));
        self
    }

    /// Registers a hook run after an item of this type has been deleted and
    /// the deletion committed.
    #[must_use]
    pub fn on_deleted(
        mut self,
        f: impl Fn(&Store, &ItemRef) -> EngineResult<()> + Send + Sync + 'static,
    ) -> Self {
        self.on_deleted = Some(Arc::new(f));
        self
    }

    /// Validates and builds the descriptor.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Schema`] for a malformed type name, a zero
    /// version, an empty attribute list, duplicate or malformed attribute
    /// names, or a compound index naming an unknown attribute.
    pub fn build(self) -> EngineResult<TypeDescriptor> {
        validate_type_name(&self.type_name)?;
        if self.version.as_u32() == 0 {
            return Err(EngineError::schema(format!(
                "{}: schema version must be positive",
                self.type_name
            )));
        }
        if self.attributes.is_empty() {
            return Err(EngineError::schema(format!(
                "{}: a type needs at least one attribute",
                self.type_name
            )));
        }
        let mut seen = HashSet::new();
        for attribute in &self.attributes {
            validate_attribute_name(&self.type_name, attribute.name())?;
            if !seen.insert(attribute.name().to_string()) {
                return Err(EngineError::schema(format!(
                    "{}: duplicate attribute {}",
                    self.type_name,
                    attribute.name()
                )));
            }
        }
        for index in &self.compound_indexes {
            if index.is_empty() {
                return Err(EngineError::schema(format!(
                    "{}: empty compound index",
                    self.type_name
                )));
            }
            for member in index {
                if !seen.contains(member) {
                    return Err(EngineError::schema(format!(
                        "{}: compound index names unknown attribute {member}",
                        self.type_name
                    )));
                }
            }
        }
        Ok(TypeDescriptor {
            type_name: self.type_name,
            module_name: self.module_name,
            version: self.version,
            attributes: self.attributes,
            compound_indexes: self.compound_indexes,
            legacy: self.legacy,
            on_committed: self.on_committed,
            on_deleted: self.on_deleted,
        })
    }
}

fn validate_type_name(name: &str) -> EngineResult<()> {
    let valid = !name.is_empty()
        && name.is_ascii()
        && !name.starts_with('.')
        && !name.ends_with('.')
        && !name.contains("..")
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.');
    if valid {
        Ok(())
    } else {
        Err(EngineError::schema(format!(
            "invalid type name {name:?}: expected a dotted ASCII identifier"
        )))
    }
}

fn validate_attribute_name(type_name: &str, name: &str) -> EngineResult<()> {
    let mut chars = name.chars();
    let valid = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !valid {
        return Err(EngineError::schema(format!(
            "{type_name}: invalid attribute name {name:?}"
        )));
    }
    if name == "oid" {
        return Err(EngineError::schema(format!(
            "{type_name}: attribute name \"oid\" is reserved"
        )));
    }
    Ok(())
}

#[derive(Default)]
struct RegistryInner {
    currents: HashMap<String, Arc<TypeDescriptor>>,
    legacies: HashMap<(String, SchemaVersion), Arc<TypeDescriptor>>,
    upgraders: HashMap<(String, SchemaVersion), Upgrader>,
    references: Vec<ReferenceSource>,
    aggregate_interfaces: HashSet<String>,
    indirectors: HashMap<String, Indirector>,
}

/// Process-wide registry of declared types, upgraders, and powerup
/// interface metadata.
///
/// A registry is built up front by explicit declaration calls, wrapped in
/// an `Arc`, and threaded into every store that should see those types.
pub struct SchemaRegistry {
    inner: RwLock<RegistryInner>,
}

impl SchemaRegistry {
    /// Creates a registry with the engine's built-in types declared.
    #[must_use]
    pub fn new() -> Self {
        let registry = Self {
            inner: RwLock::new(RegistryInner::default()),
        };
        let link = TypeBuilder::new(POWERUP_LINK_TYPE, 1)
            .module("itemdb_core::powerup")
            .attribute(
                AttributeDescriptor::new(
                    "host",
                    AttributeKind::reference(DeletionPolicy::Cascade),
                )
                .indexed(),
            )
            .attribute(AttributeDescriptor::new("interface", AttributeKind::text()).indexed())
            .attribute(AttributeDescriptor::new(
                "powerup",
                AttributeKind::reference(DeletionPolicy::Cascade),
            ))
            .attribute(
                AttributeDescriptor::new("priority", AttributeKind::Integer)
                    .default_value(crate::value::Value::Integer(0)),
            )
            .compound_index(&["host", "interface"])
            .build()
            .expect("built-in powerup link type is valid");
        registry
            .declare(link)
            .expect("built-in powerup link type registers cleanly");
        registry
    }

    /// Declares a type.
    ///
    /// Non-legacy declarations claim their `type_name`; a second claim is
    /// fatal. Legacy declarations register under `(type_name, version)` and
    /// must sit strictly below the current version when one exists.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Schema`] on any duplicate or ordering
    /// violation.
    pub fn declare(&self, descriptor: TypeDescriptor) -> EngineResult<Arc<TypeDescriptor>> {
        let descriptor = Arc::new(descriptor);
        let mut inner = self.inner.write();
        let name = descriptor.type_name().to_string();
        if descriptor.is_legacy() {
            let key = (name.clone(), descriptor.version());
            if inner.legacies.contains_key(&key) {
                return Err(EngineError::schema(format!(
                    "{name} {} is already declared as a legacy shape",
                    descriptor.version()
                )));
            }
            if let Some(current) = inner.currents.get(&name) {
                if descriptor.version() >= current.version() {
                    return Err(EngineError::schema(format!(
                        "legacy {name} {} does not predate the current {}",
                        descriptor.version(),
                        current.version()
                    )));
                }
            }
            inner.legacies.insert(key, Arc::clone(&descriptor));
        } else {
            if inner.currents.contains_key(&name) {
                return Err(EngineError::schema(format!(
                    "type name {name} is already declared"
                )));
            }
            if inner
                .legacies
                .keys()
                .any(|(n, v)| *n == name && *v >= descriptor.version())
            {
                return Err(EngineError::schema(format!(
                    "{name} has a legacy declaration at or above {}",
                    descriptor.version()
                )));
            }
            inner.currents.insert(name.clone(), Arc::clone(&descriptor));
        }
        for attribute in descriptor.attributes() {
            if let AttributeKind::Reference { policy } = attribute.kind() {
                inner.references.push(ReferenceSource {
                    type_name: name.clone(),
                    version: descriptor.version(),
                    attribute: attribute.name().to_string(),
                    policy,
                });
            }
        }
        Ok(descriptor)
    }

    /// Registers an upgrader for one version step of one type.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Schema`] if a step is registered twice.
    pub fn register_upgrader(
        &self,
        type_name: &str,
        from: u32,
        upgrader: impl Fn(&Store, &ItemRef) -> EngineResult<Option<ItemRef>> + Send + Sync + 'static,
    ) -> EngineResult<()> {
        let key = (type_name.to_string(), SchemaVersion::new(from));
        let mut inner = self.inner.write();
        if inner.upgraders.contains_key(&key) {
            return Err(EngineError::schema(format!(
                "upgrader for {type_name} v{from} is already registered"
            )));
        }
        inner.upgraders.insert(key, Arc::new(upgrader));
        Ok(())
    }

    /// Returns the current descriptor for a type name.
    #[must_use]
    pub fn current(&self, type_name: &str) -> Option<Arc<TypeDescriptor>> {
        self.inner.read().currents.get(type_name).cloned()
    }

    /// Returns a legacy descriptor by name and version.
    #[must_use]
    pub fn legacy(&self, type_name: &str, version: SchemaVersion) -> Option<Arc<TypeDescriptor>> {
        self.inner
            .read()
            .legacies
            .get(&(type_name.to_string(), version))
            .cloned()
    }

    /// Returns the descriptor for `(type_name, version)`: the current one
    /// when the version matches, a legacy one otherwise.
    #[must_use]
    pub fn descriptor(
        &self,
        type_name: &str,
        version: SchemaVersion,
    ) -> Option<Arc<TypeDescriptor>> {
        let inner = self.inner.read();
        if let Some(current) = inner.currents.get(type_name) {
            if current.version() == version {
                return Some(Arc::clone(current));
            }
        }
        inner.legacies.get(&(type_name.to_string(), version)).cloned()
    }

    /// Returns the registered upgrader for one version step.
    #[must_use]
    pub fn upgrader(&self, type_name: &str, from: SchemaVersion) -> Option<Upgrader> {
        self.inner
            .read()
            .upgraders
            .get(&(type_name.to_string(), from))
            .cloned()
    }

    /// Checks whether any upgrader is registered out of `(type_name, from)`.
    #[must_use]
    pub fn has_any_upgrader(&self, type_name: &str, from: SchemaVersion) -> bool {
        self.upgrader(type_name, from).is_some()
    }

    /// Checks that a full chain `from -> from+1 -> … -> to` is registered.
    #[must_use]
    pub fn has_upgrade_path(&self, type_name: &str, from: SchemaVersion, to: SchemaVersion) -> bool {
        let inner = self.inner.read();
        (from.as_u32()..to.as_u32()).all(|v| {
            inner
                .upgraders
                .contains_key(&(type_name.to_string(), SchemaVersion::new(v)))
        })
    }

    /// Registers a synthesized legacy shape observed in a database.
    ///
    /// An explicitly declared legacy shape wins over synthesis; the call
    /// returns whichever descriptor ends up registered.
    pub fn synthesize_legacy(
        &self,
        type_name: &str,
        version: SchemaVersion,
        attributes: Vec<AttributeDescriptor>,
    ) -> EngineResult<Arc<TypeDescriptor>> {
        if let Some(existing) = self.legacy(type_name, version) {
            return Ok(existing);
        }
        let mut builder = TypeBuilder::new(type_name, version.as_u32()).legacy();
        for attribute in attributes {
            builder = builder.attribute(attribute);
        }
        self.declare(builder.build()?)
    }

    /// Returns a snapshot of every declared reference attribute.
    #[must_use]
    pub fn reference_sources(&self) -> Vec<ReferenceSource> {
        self.inner.read().references.clone()
    }

    /// Flags an interface as an aggregate (collection-style) adaptation
    /// target.
    pub fn declare_aggregate_interface(&self, interface: impl Into<String>) {
        self.inner.write().aggregate_interfaces.insert(interface.into());
    }

    /// Checks whether an interface is aggregate-flagged.
    #[must_use]
    pub fn is_aggregate_interface(&self, interface: &str) -> bool {
        self.inner.read().aggregate_interfaces.contains(interface)
    }

    /// Registers an indirector for powerups of the given type.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Schema`] if the type is not declared.
    pub fn register_indirector(
        &self,
        type_name: &str,
        f: impl Fn(&Store, &ItemRef, &str) -> EngineResult<ItemRef> + Send + Sync + 'static,
    ) -> EngineResult<()> {
        let mut inner = self.inner.write();
        if !inner.currents.contains_key(type_name) {
            return Err(EngineError::schema(format!(
                "cannot register indirector for undeclared type {type_name}"
            )));
        }
        inner.indirectors.insert(type_name.to_string(), Arc::new(f));
        Ok(())
    }

    /// Returns the indirector registered for a type, if any.
    #[must_use]
    pub fn indirector(&self, type_name: &str) -> Option<Indirector> {
        self.inner.read().indirectors.get(type_name).cloned()
    }
}

impl Default for SchemaRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SchemaRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("SchemaRegistry")
            .field("currents", &inner.currents.len())
            .field("legacies", &inner.legacies.len())
            .field("upgraders", &inner.upgraders.len())
            .finish_non_exhaustive()
    }
}
