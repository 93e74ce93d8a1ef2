//! Property-based generators for attribute values.
//!
//! Each generator produces values the corresponding attribute kind's
//! in-filter accepts, so they compose directly into round-trip and
//! persistence properties.

use chrono::DateTime;
use itemdb_core::{AttributeKind, Decimal, Value};
use proptest::prelude::*;

/// Strategy for integer attribute values.
pub fn integers() -> impl Strategy<Value = Value> {
    any::<i64>().prop_map(Value::Integer)
}

/// Strategy for float attribute values (finite only).
pub fn floats() -> impl Strategy<Value = Value> {
    (proptest::num::f64::NORMAL | proptest::num::f64::ZERO).prop_map(Value::Float)
}

/// Strategy for fixed-point decimals at the given precision.
pub fn decimals(places: u32) -> impl Strategy<Value = Value> {
    any::<i32>().prop_map(move |scaled| {
        Value::Decimal(Decimal::from_scaled(i64::from(scaled), places))
    })
}

/// Strategy for boolean attribute values.
pub fn booleans() -> impl Strategy<Value = Value> {
    any::<bool>().prop_map(Value::Boolean)
}

/// Strategy for text without NUL bytes.
pub fn texts() -> impl Strategy<Value = Value> {
    "[^\\x00]{0,64}".prop_map(Value::Text)
}

/// Strategy for byte blobs.
pub fn byte_blobs() -> impl Strategy<Value = Value> {
    proptest::collection::vec(any::<u8>(), 0..256).prop_map(Value::Bytes)
}

/// Strategy for timestamps within a broad, representable range.
pub fn timestamps() -> impl Strategy<Value = Value> {
    // Microseconds from 1970 through roughly 2200.
    (0i64..7_258_118_400_000_000i64).prop_map(|micros| {
        Value::Timestamp(DateTime::from_timestamp_micros(micros).expect("in range"))
    })
}

/// Strategy for store-relative paths with `/` separators.
pub fn paths() -> impl Strategy<Value = Value> {
    proptest::collection::vec("[a-zA-Z0-9][a-zA-Z0-9_.-]{0,8}", 1..4)
        .prop_map(|components| Value::Path(components.join("/")))
}

/// Strategy for text lists free of the encoding separator.
pub fn text_lists() -> impl Strategy<Value = Value> {
    proptest::collection::vec("[^\\x00\\x02]{0,16}", 0..6).prop_map(Value::TextList)
}

/// Strategy for values of a given attribute kind.
///
/// Reference values are excluded: a valid reference needs a live referent
/// in a concrete store, which a pure generator cannot provide.
pub fn values_for(kind: AttributeKind) -> BoxedStrategy<Value> {
    match kind {
        AttributeKind::Integer => integers().boxed(),
        AttributeKind::Float => floats().boxed(),
        AttributeKind::Decimal { places } => decimals(places).boxed(),
        AttributeKind::Boolean => booleans().boxed(),
        AttributeKind::Text { .. } => texts().boxed(),
        AttributeKind::Bytes => byte_blobs().boxed(),
        AttributeKind::Timestamp => timestamps().boxed(),
        AttributeKind::Path => paths().boxed(),
        AttributeKind::TextList => text_lists().boxed(),
        AttributeKind::Reference { .. } => {
            panic!("reference values need a live store; generate ids separately")
        }
    }
}
