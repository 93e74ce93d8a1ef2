//! Query compilation and result materialization.
//!
//! A [`Query`] assembles `SELECT … FROM … [WHERE …] [ORDER BY …]
//! [LIMIT n [OFFSET m]]` from the comparison algebra, executes it, and
//! streams rows into cached item instances. LIMIT and OFFSET are rendered
//! as literals: the driver rejects them as bound parameters.

mod comparison;
mod paged;

pub use comparison::{and, column, or, store_id_column, AttributeRef, LikeFragment, Predicate};
pub use paged::PagedQuery;

use crate::attribute::AttributeKind;
use crate::error::{EngineError, EngineResult};
use crate::item::ItemRef;
use crate::layout;
use crate::schema::TypeDescriptor;
use crate::store::{Store, StoreInner};
use crate::value::Value;
use comparison::ColumnKind;
use itemdb_sql::SqlValue;
use std::rc::Rc;
use std::sync::Arc;

/// Direction of one ordering term.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    /// Smallest first.
    Ascending,
    /// Largest first.
    Descending,
}

impl SortDirection {
    pub(crate) fn sql(self) -> &'static str {
        match self {
            Self::Ascending => "ASC",
            Self::Descending => "DESC",
        }
    }
}

/// Shared state while rendering a query: the SQL text, the collected
/// arguments, and the involved types (each listed once, in first-seen
/// order, for the FROM clause).
pub(crate) struct CompileContext<'a> {
    store: &'a Rc<StoreInner>,
    pub(crate) sql: String,
    pub(crate) args: Vec<SqlValue>,
    pub(crate) types: Vec<String>,
}

impl<'a> CompileContext<'a> {
    pub(crate) fn new(store: &'a Rc<StoreInner>, target: &str) -> Self {
        Self {
            store,
            sql: String::new(),
            args: Vec::new(),
            types: vec![target.to_string()],
        }
    }

    fn add_type(&mut self, type_name: &str) {
        if !self.types.iter().any(|t| t == type_name) {
            self.types.push(type_name.to_string());
        }
    }

    fn descriptor(&self, type_name: &str) -> EngineResult<Arc<TypeDescriptor>> {
        self.store
            .registry()
            .current(type_name)
            .ok_or_else(|| EngineError::query(format!("unknown type {type_name} in query")))
    }

    /// Resolves an attribute reference to its qualified column, recording
    /// the involved type.
    pub(crate) fn resolve(&mut self, attr: &AttributeRef) -> EngineResult<String> {
        let descriptor = self.descriptor(&attr.type_name)?;
        let table = layout::table_name(
            self.store.prefix(),
            descriptor.type_name(),
            descriptor.version(),
        );
        let column = match &attr.column {
            ColumnKind::StoreId => "oid".to_string(),
            ColumnKind::Attribute(name) => {
                if descriptor.attr_index(name).is_none() {
                    return Err(EngineError::query(format!(
                        "{} has no attribute {name}",
                        attr.type_name
                    )));
                }
                name.clone()
            }
        };
        self.add_type(&attr.type_name);
        Ok(format!("{table}.{column}"))
    }

    /// Returns the attribute kind behind a reference; `None` for the
    /// `storeId` pseudo-column.
    pub(crate) fn kind_of(&self, attr: &AttributeRef) -> EngineResult<Option<AttributeKind>> {
        match &attr.column {
            ColumnKind::StoreId => Ok(None),
            ColumnKind::Attribute(name) => {
                let descriptor = self.descriptor(&attr.type_name)?;
                let attribute = descriptor.attribute(name).ok_or_else(|| {
                    EngineError::query(format!("{} has no attribute {name}", attr.type_name))
                })?;
                Ok(Some(attribute.kind()))
            }
        }
    }

    /// Encodes a literal through the left attribute's in-filter.
    pub(crate) fn encode_for(
        &self,
        attr: &AttributeRef,
        value: &Value,
    ) -> EngineResult<SqlValue> {
        match &attr.column {
            ColumnKind::StoreId => match value {
                Value::Integer(i) => Ok(SqlValue::Integer(*i)),
                Value::Reference(id) => Ok(SqlValue::Integer(id.as_i64())),
                other => Err(EngineError::query(format!(
                    "cannot compare storeId against a {} literal",
                    other.kind_name()
                ))),
            },
            ColumnKind::Attribute(name) => {
                let descriptor = self.descriptor(&attr.type_name)?;
                let attribute = descriptor.attribute(name).ok_or_else(|| {
                    EngineError::query(format!("{} has no attribute {name}", attr.type_name))
                })?;
                attribute.encode(value)
            }
        }
    }
}

/// A query over items of one target type.
///
/// Queries are cheap values; nothing touches SQL until an execution method
/// (`fetch`, `count`, an aggregate, or a page) runs. Inside a transaction
/// the touched set is flushed before every execution so the SELECT sees a
/// consistent view.
#[derive(Clone)]
pub struct Query {
    store: Store,
    type_name: String,
    predicate: Option<Predicate>,
    sort: Vec<(AttributeRef, SortDirection)>,
    limit: Option<u64>,
    offset: Option<u64>,
}

impl Query {
    pub(crate) fn new(store: Store, type_name: &str) -> Self {
        Self {
            store,
            type_name: type_name.to_string(),
            predicate: None,
            sort: Vec::new(),
            limit: None,
            offset: None,
        }
    }

    /// Restricts the query; successive filters AND together.
    #[must_use]
    pub fn filter(mut self, predicate: Predicate) -> Self {
        self.predicate = Some(match self.predicate.take() {
            Some(existing) => existing.and_also(predicate),
            None => predicate,
        });
        self
    }

    /// Appends an ordering term.
    #[must_use]
    pub fn sort(mut self, attribute: AttributeRef, direction: SortDirection) -> Self {
        self.sort.push((attribute, direction));
        self
    }

    /// Caps the number of returned rows.
    #[must_use]
    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Skips the first `offset` rows.
    #[must_use]
    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    pub(crate) fn store_inner(&self) -> &Rc<StoreInner> {
        &self.store.inner
    }

    pub(crate) fn type_name(&self) -> &str {
        &self.type_name
    }

    pub(crate) fn predicate(&self) -> Option<&Predicate> {
        self.predicate.as_ref()
    }

    pub(crate) fn sort_terms(&self) -> &[(AttributeRef, SortDirection)] {
        &self.sort
    }

    fn target(&self) -> EngineResult<Arc<TypeDescriptor>> {
        self.store
            .inner
            .registry()
            .current(&self.type_name)
            .ok_or_else(|| {
                EngineError::query(format!("unknown type {} in query", self.type_name))
            })
    }

    /// Renders the query around the given select list. Returns the SQL,
    /// its arguments, and the target descriptor.
    fn build(
        &self,
        select: &str,
        with_order_and_window: bool,
    ) -> EngineResult<(String, Vec<SqlValue>, Arc<TypeDescriptor>)> {
        let inner = &self.store.inner;
        inner.flush_touched()?;
        let target = self.target()?;

        let mut ctx = CompileContext::new(inner, &self.type_name);
        let mut where_sql = String::new();
        if let Some(predicate) = &self.predicate {
            predicate.compile(&mut ctx)?;
            where_sql = std::mem::take(&mut ctx.sql);
        }

        let mut order_terms = Vec::with_capacity(self.sort.len());
        for (attribute, direction) in &self.sort {
            let col = ctx.resolve(attribute)?;
            order_terms.push(format!("{col} {}", direction.sql()));
        }

        // First reference to a type in this store provisions its table.
        let mut tables = Vec::with_capacity(ctx.types.len());
        for type_name in &ctx.types {
            let descriptor = inner
                .registry()
                .current(type_name)
                .ok_or_else(|| EngineError::query(format!("unknown type {type_name}")))?;
            inner.type_id(&descriptor)?;
            tables.push(inner.table_for(&descriptor));
        }

        let mut sql = format!("SELECT {select} FROM {}", tables.join(", "));
        if !where_sql.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&where_sql);
        }
        if with_order_and_window {
            if !order_terms.is_empty() {
                sql.push_str(" ORDER BY ");
                sql.push_str(&order_terms.join(", "));
            }
            // Literals, not parameters: the driver errors on a bound
            // LIMIT/OFFSET.
            if let Some(limit) = self.limit {
                sql.push_str(&format!(" LIMIT {limit}"));
                if let Some(offset) = self.offset {
                    sql.push_str(&format!(" OFFSET {offset}"));
                }
            } else if let Some(offset) = self.offset {
                sql.push_str(&format!(" LIMIT -1 OFFSET {offset}"));
            }
        }
        Ok((sql, ctx.args, target))
    }

    fn item_select_list(&self, target: &TypeDescriptor) -> String {
        let table = self.store.inner.table_for(target);
        let mut cols = vec![format!("{table}.oid")];
        for attribute in target.attributes() {
            cols.push(format!("{table}.{}", attribute.name()));
        }
        cols.join(", ")
    }

    /// Executes the query and materializes every row.
    pub fn fetch(&self) -> EngineResult<Vec<ItemRef>> {
        let target = self.target()?;
        let select = self.item_select_list(&target);
        let (sql, args, target) = self.build(&select, true)?;
        let inner = &self.store.inner;
        let type_id = inner.type_id(&target)?;
        let rows = inner.conn().fetch(&sql, &args)?;
        let mut items = Vec::with_capacity(rows.len());
        for row in rows {
            items.push(inner.materialize_row(&target, type_id, &row)?);
        }
        Ok(items)
    }

    /// Counts matching rows.
    pub fn count(&self) -> EngineResult<u64> {
        let (sql, args, _) = self.build("COUNT(*)", false)?;
        let row = self.store.inner.conn().fetch_one(&sql, &args)?;
        Ok(row
            .and_then(|r| r[0].as_integer())
            .unwrap_or_default() as u64)
    }

    fn aggregate_column(&self, attribute: &str) -> EngineResult<String> {
        let target = self.target()?;
        if target.attr_index(attribute).is_none() {
            return Err(EngineError::query(format!(
                "{} has no attribute {attribute}",
                self.type_name
            )));
        }
        Ok(format!(
            "{}.{attribute}",
            self.store.inner.table_for(&target)
        ))
    }

    fn decode_aggregate(&self, attribute: &str, stored: &SqlValue) -> EngineResult<Value> {
        let target = self.target()?;
        let descriptor = target
            .attribute(attribute)
            .ok_or_else(|| EngineError::query(format!("no attribute {attribute}")))?;
        descriptor.decode(stored)
    }

    /// Sums an attribute over the matching rows; an empty result sums to
    /// zero.
    pub fn sum(&self, attribute: &str) -> EngineResult<Value> {
        let col = self.aggregate_column(attribute)?;
        let (sql, args, _) = self.build(&format!("COALESCE(SUM({col}), 0)"), false)?;
        let row = self
            .store
            .inner
            .conn()
            .fetch_one(&sql, &args)?
            .ok_or_else(|| EngineError::query("aggregate produced no row"))?;
        self.decode_aggregate(attribute, &row[0])
    }

    fn extremum(&self, function: &str, attribute: &str) -> EngineResult<Option<Value>> {
        let col = self.aggregate_column(attribute)?;
        let (sql, args, _) = self.build(&format!("{function}({col})"), false)?;
        let row = self
            .store
            .inner
            .conn()
            .fetch_one(&sql, &args)?
            .ok_or_else(|| EngineError::query("aggregate produced no row"))?;
        if row[0].is_null() {
            return Ok(None);
        }
        Ok(Some(self.decode_aggregate(attribute, &row[0])?))
    }

    /// Returns the smallest value of an attribute.
    ///
    /// # Errors
    ///
    /// Errors over an empty result; use [`Query::min_or`] to supply a
    /// default instead.
    pub fn min(&self, attribute: &str) -> EngineResult<Value> {
        self.extremum("MIN", attribute)?
            .ok_or_else(|| EngineError::query(format!("min of {attribute} over no rows")))
    }

    /// Returns the smallest value of an attribute, or `default` over an
    /// empty result.
    pub fn min_or(&self, attribute: &str, default: Value) -> EngineResult<Value> {
        Ok(self.extremum("MIN", attribute)?.unwrap_or(default))
    }

    /// Returns the largest value of an attribute.
    ///
    /// # Errors
    ///
    /// Errors over an empty result; use [`Query::max_or`] to supply a
    /// default instead.
    pub fn max(&self, attribute: &str) -> EngineResult<Value> {
        self.extremum("MAX", attribute)?
            .ok_or_else(|| EngineError::query(format!("max of {attribute} over no rows")))
    }

    /// Returns the largest value of an attribute, or `default` over an
    /// empty result.
    pub fn max_or(&self, attribute: &str, default: Value) -> EngineResult<Value> {
        Ok(self.extremum("MAX", attribute)?.unwrap_or(default))
    }

    /// Averages an attribute over the matching rows; `None` over an empty
    /// result.
    pub fn average(&self, attribute: &str) -> EngineResult<Option<f64>> {
        let col = self.aggregate_column(attribute)?;
        let (sql, args, _) = self.build(&format!("AVG({col})"), false)?;
        let row = self
            .store
            .inner
            .conn()
            .fetch_one(&sql, &args)?
            .ok_or_else(|| EngineError::query("aggregate produced no row"))?;
        Ok(match &row[0] {
            SqlValue::Null => None,
            SqlValue::Real(f) => Some(*f),
            SqlValue::Integer(i) => Some(*i as f64),
            other => {
                return Err(EngineError::query(format!(
                    "AVG produced unexpected value {other}"
                )))
            }
        })
    }

    /// Returns the distinct values of an attribute over the matching rows.
    pub fn distinct(&self, attribute: &str) -> EngineResult<Vec<Value>> {
        let col = self.aggregate_column(attribute)?;
        let (sql, args, _) = self.build(&format!("DISTINCT {col}"), true)?;
        let rows = self.store.inner.conn().fetch(&sql, &args)?;
        rows.iter()
            .map(|row| self.decode_aggregate(attribute, &row[0]))
            .collect()
    }

    /// Switches to paged iteration with a stable total order.
    ///
    /// Requires at most one sort term (the store id becomes the final
    /// tie-breaker); compound sorts are rejected for paged iteration.
    /// `limit`/`offset` do not combine with paging.
    pub fn paged(self, page_size: u64) -> EngineResult<PagedQuery> {
        PagedQuery::new(self, page_size)
    }
}

impl std::fmt::Debug for Query {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Query")
            .field("type_name", &self.type_name)
            .field("has_predicate", &self.predicate.is_some())
            .field("sort_terms", &self.sort.len())
            .field("limit", &self.limit)
            .field("offset", &self.offset)
            .finish()
    }
}
