//! The comparison algebra: typed predicates over item attributes.
//!
//! Predicates are plain values built by methods on [`AttributeRef`] and
//! combined with [`and`] / [`or`]. Each node knows how to render its SQL
//! fragment with `?` placeholders, contribute its arguments (passed
//! through the left attribute's in-filter), and report the types it
//! involves so the compiler can build the FROM clause.

use crate::attribute::AttributeKind;
use crate::error::{EngineError, EngineResult};
use crate::query::CompileContext;
use crate::value::Value;
use itemdb_sql::SqlValue;

/// Escapes SQL LIKE wildcards so a fragment matches literally.
fn escape_like(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// A reference to a column of some declared type: either a named attribute
/// or the type's `storeId` (the `oid` column).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeRef {
    pub(crate) type_name: String,
    pub(crate) column: ColumnKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ColumnKind {
    Attribute(String),
    StoreId,
}

/// References a named attribute of a type.
#[must_use]
pub fn column(type_name: &str, attribute: &str) -> AttributeRef {
    AttributeRef {
        type_name: type_name.to_string(),
        column: ColumnKind::Attribute(attribute.to_string()),
    }
}

/// References the `storeId` column of a type.
#[must_use]
pub fn store_id_column(type_name: &str) -> AttributeRef {
    AttributeRef {
        type_name: type_name.to_string(),
        column: ColumnKind::StoreId,
    }
}

/// Binary comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompareOp {
    fn sql(self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) enum Operand {
    Literal(Value),
    Column(AttributeRef),
}

/// A fragment on the right side of a LIKE pattern.
#[derive(Debug, Clone)]
pub enum LikeFragment {
    /// A literal piece of pattern text (wildcards are meaningful).
    Literal(String),
    /// The value of another attribute.
    Attribute(AttributeRef),
}

#[derive(Debug, Clone)]
enum LikePiece {
    Param(String),
    Percent,
    Column(AttributeRef),
}

#[derive(Debug, Clone)]
enum PredicateKind {
    Compare {
        left: AttributeRef,
        op: CompareOp,
        right: Operand,
    },
    OneOf {
        attr: AttributeRef,
        values: Vec<Value>,
        negate: bool,
    },
    Like {
        attr: AttributeRef,
        pieces: Vec<LikePiece>,
        escaped: bool,
        negate: bool,
    },
    Null {
        attr: AttributeRef,
        negate: bool,
    },
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
}

/// A compiled-on-demand query predicate.
///
/// Opaque to callers: it is constructed via the algebra and consumed by
/// query execution.
#[derive(Debug, Clone)]
pub struct Predicate {
    kind: PredicateKind,
}

impl AttributeRef {
    fn compare(self, op: CompareOp, value: Value) -> Predicate {
        // Comparison against null means IS NULL / IS NOT NULL.
        if value.is_null() {
            let negate = op == CompareOp::Ne;
            return Predicate {
                kind: PredicateKind::Null { attr: self, negate },
            };
        }
        Predicate {
            kind: PredicateKind::Compare {
                left: self,
                op,
                right: Operand::Literal(value),
            },
        }
    }

    /// `attribute = value` (null maps to IS NULL).
    #[must_use]
    pub fn eq(self, value: impl Into<Value>) -> Predicate {
        self.compare(CompareOp::Eq, value.into())
    }

    /// `attribute != value` (null maps to IS NOT NULL).
    #[must_use]
    pub fn ne(self, value: impl Into<Value>) -> Predicate {
        self.compare(CompareOp::Ne, value.into())
    }

    /// `attribute < value`.
    #[must_use]
    pub fn lt(self, value: impl Into<Value>) -> Predicate {
        self.compare(CompareOp::Lt, value.into())
    }

    /// `attribute <= value`.
    #[must_use]
    pub fn le(self, value: impl Into<Value>) -> Predicate {
        self.compare(CompareOp::Le, value.into())
    }

    /// `attribute > value`.
    #[must_use]
    pub fn gt(self, value: impl Into<Value>) -> Predicate {
        self.compare(CompareOp::Gt, value.into())
    }

    /// `attribute >= value`.
    #[must_use]
    pub fn ge(self, value: impl Into<Value>) -> Predicate {
        self.compare(CompareOp::Ge, value.into())
    }

    /// `attribute = other-column` - the join form.
    #[must_use]
    pub fn eq_column(self, other: AttributeRef) -> Predicate {
        Predicate {
            kind: PredicateKind::Compare {
                left: self,
                op: CompareOp::Eq,
                right: Operand::Column(other),
            },
        }
    }

    /// `attribute != other-column`.
    #[must_use]
    pub fn ne_column(self, other: AttributeRef) -> Predicate {
        Predicate {
            kind: PredicateKind::Compare {
                left: self,
                op: CompareOp::Ne,
                right: Operand::Column(other),
            },
        }
    }

    /// `attribute IN (values…)`. An empty sequence matches nothing.
    #[must_use]
    pub fn one_of(self, values: Vec<Value>) -> Predicate {
        Predicate {
            kind: PredicateKind::OneOf {
                attr: self,
                values,
                negate: false,
            },
        }
    }

    /// `attribute NOT IN (values…)`. An empty sequence matches everything.
    #[must_use]
    pub fn not_one_of(self, values: Vec<Value>) -> Predicate {
        Predicate {
            kind: PredicateKind::OneOf {
                attr: self,
                values,
                negate: true,
            },
        }
    }

    /// `attribute LIKE pattern` with the pattern taken verbatim.
    #[must_use]
    pub fn like(self, pattern: &str) -> Predicate {
        Predicate {
            kind: PredicateKind::Like {
                attr: self,
                pieces: vec![LikePiece::Param(pattern.to_string())],
                escaped: false,
                negate: false,
            },
        }
    }

    /// `attribute NOT LIKE pattern`.
    #[must_use]
    pub fn not_like(self, pattern: &str) -> Predicate {
        Predicate {
            kind: PredicateKind::Like {
                attr: self,
                pieces: vec![LikePiece::Param(pattern.to_string())],
                escaped: false,
                negate: true,
            },
        }
    }

    /// Matches values starting with the literal `text`.
    #[must_use]
    pub fn starts_with(self, text: &str) -> Predicate {
        Predicate {
            kind: PredicateKind::Like {
                attr: self,
                pieces: vec![LikePiece::Param(escape_like(text)), LikePiece::Percent],
                escaped: true,
                negate: false,
            },
        }
    }

    /// Matches values ending with the literal `text`.
    #[must_use]
    pub fn ends_with(self, text: &str) -> Predicate {
        Predicate {
            kind: PredicateKind::Like {
                attr: self,
                pieces: vec![LikePiece::Percent, LikePiece::Param(escape_like(text))],
                escaped: true,
                negate: false,
            },
        }
    }

    /// LIKE against a concatenation of literal and attribute fragments.
    #[must_use]
    pub fn like_parts(self, fragments: Vec<LikeFragment>) -> Predicate {
        let pieces = fragments
            .into_iter()
            .map(|f| match f {
                LikeFragment::Literal(text) => LikePiece::Param(text),
                LikeFragment::Attribute(attr) => LikePiece::Column(attr),
            })
            .collect();
        Predicate {
            kind: PredicateKind::Like {
                attr: self,
                pieces,
                escaped: false,
                negate: false,
            },
        }
    }

    /// `attribute IS NULL`.
    #[must_use]
    pub fn is_null(self) -> Predicate {
        Predicate {
            kind: PredicateKind::Null {
                attr: self,
                negate: false,
            },
        }
    }

    /// `attribute IS NOT NULL`.
    #[must_use]
    pub fn not_null(self) -> Predicate {
        Predicate {
            kind: PredicateKind::Null {
                attr: self,
                negate: true,
            },
        }
    }
}

/// Conjunction of predicates. An empty conjunction is rejected at
/// compile time.
#[must_use]
pub fn and(predicates: Vec<Predicate>) -> Predicate {
    Predicate {
        kind: PredicateKind::And(predicates),
    }
}

/// Disjunction of predicates. An empty disjunction is rejected at
/// compile time.
#[must_use]
pub fn or(predicates: Vec<Predicate>) -> Predicate {
    Predicate {
        kind: PredicateKind::Or(predicates),
    }
}

impl Predicate {
    /// Appends `a AND b` to an existing predicate.
    #[must_use]
    pub fn and_also(self, other: Predicate) -> Predicate {
        and(vec![self, other])
    }

    /// Renders this predicate into the compile context.
    pub(crate) fn compile(&self, ctx: &mut CompileContext<'_>) -> EngineResult<()> {
        match &self.kind {
            PredicateKind::Compare { left, op, right } => {
                let left_col = ctx.resolve(left)?;
                match right {
                    Operand::Literal(value) => {
                        let arg = ctx.encode_for(left, value)?;
                        ctx.sql.push_str(&format!("({} {} ?)", left_col, op.sql()));
                        ctx.args.push(arg);
                    }
                    Operand::Column(other) => {
                        check_column_compatibility(ctx, left, other)?;
                        let right_col = ctx.resolve(other)?;
                        ctx.sql
                            .push_str(&format!("({left_col} {} {right_col})", op.sql()));
                    }
                }
                Ok(())
            }
            PredicateKind::OneOf {
                attr,
                values,
                negate,
            } => {
                let col = ctx.resolve(attr)?;
                if values.is_empty() {
                    // IN () is not valid SQL; an empty set matches nothing.
                    ctx.sql.push_str(if *negate { "(1 = 1)" } else { "(1 = 0)" });
                    return Ok(());
                }
                let mut args = Vec::with_capacity(values.len());
                for value in values {
                    args.push(ctx.encode_for(attr, value)?);
                }
                let placeholders = vec!["?"; values.len()].join(", ");
                let keyword = if *negate { "NOT IN" } else { "IN" };
                ctx.sql
                    .push_str(&format!("({col} {keyword} ({placeholders}))"));
                ctx.args.extend(args);
                Ok(())
            }
            PredicateKind::Like {
                attr,
                pieces,
                escaped,
                negate,
            } => {
                let col = ctx.resolve(attr)?;
                let mut rendered = Vec::with_capacity(pieces.len());
                for piece in pieces {
                    match piece {
                        LikePiece::Param(text) => {
                            rendered.push("?".to_string());
                            ctx.args.push(SqlValue::Text(text.clone()));
                        }
                        LikePiece::Percent => rendered.push("'%'".to_string()),
                        LikePiece::Column(other) => {
                            rendered.push(ctx.resolve(other)?);
                        }
                    }
                }
                let keyword = if *negate { "NOT LIKE" } else { "LIKE" };
                let escape = if *escaped { " ESCAPE '\\'" } else { "" };
                ctx.sql.push_str(&format!(
                    "({col} {keyword} {}{escape})",
                    rendered.join(" || ")
                ));
                Ok(())
            }
            PredicateKind::Null { attr, negate } => {
                let col = ctx.resolve(attr)?;
                let test = if *negate { "IS NOT NULL" } else { "IS NULL" };
                ctx.sql.push_str(&format!("({col} {test})"));
                Ok(())
            }
            PredicateKind::And(parts) => compile_boolean(ctx, parts, " AND "),
            PredicateKind::Or(parts) => compile_boolean(ctx, parts, " OR "),
        }
    }
}

fn compile_boolean(
    ctx: &mut CompileContext<'_>,
    parts: &[Predicate],
    joiner: &str,
) -> EngineResult<()> {
    if parts.is_empty() {
        return Err(EngineError::query(
            "a boolean aggregate needs at least one predicate",
        ));
    }
    ctx.sql.push('(');
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            ctx.sql.push_str(joiner);
        }
        part.compile(ctx)?;
    }
    ctx.sql.push(')');
    Ok(())
}

/// Mixing fixed-point precisions in one comparison is a declaration
/// mistake, caught at compile time.
fn check_column_compatibility(
    ctx: &CompileContext<'_>,
    left: &AttributeRef,
    right: &AttributeRef,
) -> EngineResult<()> {
    let (Some(left_kind), Some(right_kind)) = (ctx.kind_of(left)?, ctx.kind_of(right)?) else {
        return Ok(());
    };
    if let (AttributeKind::Decimal { places: lp }, AttributeKind::Decimal { places: rp }) =
        (left_kind, right_kind)
    {
        if lp != rp {
            return Err(EngineError::query(format!(
                "cannot compare decimals of different precision ({lp} vs {rp} places)"
            )));
        }
    }
    Ok(())
}
