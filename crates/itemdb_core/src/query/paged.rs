//! Paged iteration across transaction boundaries.
//!
//! A paged query remembers the last emitted `(sort value, store id)` pair
//! and fetches the next page with a strict lexicographic bound under the
//! tie-broken ordering, so each page costs the same regardless of table
//! size or how many rows were already yielded.

use crate::error::{EngineError, EngineResult};
use crate::item::ItemRef;
use crate::query::comparison::ColumnKind;
use crate::query::{CompileContext, Query, SortDirection};
use itemdb_sql::SqlValue;

/// Cursor state for one paged iteration.
///
/// Pages may be pulled inside different transactions; the cursor carries
/// everything it needs between them.
pub struct PagedQuery {
    query: Query,
    sort: Option<(String, usize, SortDirection)>,
    /// Direction of the id walk when no sort attribute is present (an
    /// explicit `storeId` sort term sets this).
    id_direction: SortDirection,
    page_size: u64,
    last: Option<(Option<SqlValue>, i64)>,
    exhausted: bool,
}

impl PagedQuery {
    pub(crate) fn new(query: Query, page_size: u64) -> EngineResult<Self> {
        if page_size == 0 {
            return Err(EngineError::query("page size must be positive"));
        }
        let mut id_direction = SortDirection::Ascending;
        let sort = match query.sort_terms() {
            [] => None,
            [(attribute, direction)] => match &attribute.column {
                ColumnKind::Attribute(name) => {
                    if attribute.type_name != query.type_name() {
                        return Err(EngineError::query(
                            "paged iteration sorts on the target type only",
                        ));
                    }
                    let target = query
                        .store_inner()
                        .registry()
                        .current(query.type_name())
                        .ok_or_else(|| {
                            EngineError::query(format!("unknown type {}", query.type_name()))
                        })?;
                    let index = target.attr_index(name).ok_or_else(|| {
                        EngineError::query(format!(
                            "{} has no attribute {name}",
                            query.type_name()
                        ))
                    })?;
                    Some((name.clone(), index, *direction))
                }
                // Sorting by store id is the tie-breaker itself.
                ColumnKind::StoreId => {
                    id_direction = *direction;
                    None
                }
            },
            _ => {
                return Err(EngineError::query(
                    "paged iteration does not support compound sorts",
                ))
            }
        };
        Ok(Self {
            query,
            sort,
            id_direction,
            page_size,
            last: None,
            exhausted: false,
        })
    }

    /// Fetches the next page. An empty page means the iteration is done.
    pub fn next_page(&mut self) -> EngineResult<Vec<ItemRef>> {
        if self.exhausted {
            return Ok(Vec::new());
        }
        let inner = self.query.store_inner().clone();
        inner.flush_touched()?;

        let target = inner
            .registry()
            .current(self.query.type_name())
            .ok_or_else(|| {
                EngineError::query(format!("unknown type {}", self.query.type_name()))
            })?;
        let type_id = inner.type_id(&target)?;
        let table = inner.table_for(&target);

        let mut ctx = CompileContext::new(&inner, self.query.type_name());
        let mut clauses = Vec::new();
        if let Some(predicate) = self.query.predicate() {
            predicate.compile(&mut ctx)?;
            clauses.push(std::mem::take(&mut ctx.sql));
        }

        if let Some((sort_value, oid)) = &self.last {
            match (&self.sort, sort_value) {
                (Some((name, _, direction)), Some(value)) => {
                    let op = match direction {
                        SortDirection::Ascending => ">",
                        SortDirection::Descending => "<",
                    };
                    clauses.push(format!(
                        "({table}.{name} {op} ? OR ({table}.{name} = ? AND {table}.oid {op} ?))"
                    ));
                    ctx.args.push(value.clone());
                    ctx.args.push(value.clone());
                    ctx.args.push(SqlValue::Integer(*oid));
                }
                _ => {
                    let op = match self.id_direction {
                        SortDirection::Ascending => ">",
                        SortDirection::Descending => "<",
                    };
                    clauses.push(format!("({table}.oid {op} ?)"));
                    ctx.args.push(SqlValue::Integer(*oid));
                }
            }
        }

        // Provision every involved table before selecting from it.
        let mut tables = Vec::with_capacity(ctx.types.len());
        for type_name in &ctx.types {
            let descriptor = inner
                .registry()
                .current(type_name)
                .ok_or_else(|| EngineError::query(format!("unknown type {type_name}")))?;
            inner.type_id(&descriptor)?;
            tables.push(inner.table_for(&descriptor));
        }

        let mut select_cols = vec![format!("{table}.oid")];
        for attribute in target.attributes() {
            select_cols.push(format!("{table}.{}", attribute.name()));
        }

        let order = match &self.sort {
            Some((name, _, direction)) => format!(
                "{table}.{name} {dir}, {table}.oid {dir}",
                dir = direction.sql()
            ),
            None => format!("{table}.oid {}", self.id_direction.sql()),
        };

        let mut sql = format!(
            "SELECT {} FROM {}",
            select_cols.join(", "),
            tables.join(", ")
        );
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(&format!(" ORDER BY {order} LIMIT {}", self.page_size));

        let rows = inner.conn().fetch(&sql, &ctx.args)?;
        if rows.is_empty() {
            self.exhausted = true;
            return Ok(Vec::new());
        }

        let last_row = rows.last().expect("non-empty page");
        let last_oid = last_row[0]
            .as_integer()
            .ok_or_else(|| EngineError::misuse("row without an oid"))?;
        let last_sort = self
            .sort
            .as_ref()
            .map(|(_, index, _)| last_row[1 + index].clone());
        self.last = Some((last_sort, last_oid));

        let mut items = Vec::with_capacity(rows.len());
        for row in rows {
            items.push(inner.materialize_row(&target, type_id, &row)?);
        }
        Ok(items)
    }

    /// Drains every remaining page into one vector.
    pub fn collect_all(&mut self) -> EngineResult<Vec<ItemRef>> {
        let mut out = Vec::new();
        loop {
            let page = self.next_page()?;
            if page.is_empty() {
                return Ok(out);
            }
            out.extend(page);
        }
    }
}

impl std::fmt::Debug for PagedQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PagedQuery")
            .field("type_name", &self.query.type_name())
            .field("page_size", &self.page_size)
            .field("exhausted", &self.exhausted)
            .finish_non_exhaustive()
    }
}
