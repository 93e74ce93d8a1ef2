//! In-memory attribute values.

use crate::types::StoreId;
use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::fmt;

/// A fixed-point decimal at a declared number of places.
///
/// Stored in SQL as the scaled integer `value * 10^places`, so arithmetic
/// and aggregation over a column are exact. Two decimals compare only when
/// their precisions match; mixing precisions is a declaration error, not a
/// silent coercion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Decimal {
    scaled: i64,
    places: u32,
}

impl Decimal {
    /// Creates a decimal from an already-scaled integer.
    #[must_use]
    pub const fn from_scaled(scaled: i64, places: u32) -> Self {
        Self { scaled, places }
    }

    /// Creates a decimal from a whole number.
    ///
    /// Returns `None` if scaling overflows.
    #[must_use]
    pub fn from_integer(value: i64, places: u32) -> Option<Self> {
        let scaled = value.checked_mul(10i64.checked_pow(places)?)?;
        Some(Self { scaled, places })
    }

    /// Parses a decimal literal such as `"0.10"` or `"-3"`.
    ///
    /// Digits beyond the declared precision are rejected rather than
    /// rounded. Returns `None` for malformed input or overflow.
    #[must_use]
    pub fn parse(text: &str, places: u32) -> Option<Self> {
        let text = text.trim();
        let (negative, digits) = match text.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, text.strip_prefix('+').unwrap_or(text)),
        };
        if digits.is_empty() {
            return None;
        }
        let (whole, frac) = match digits.split_once('.') {
            Some((w, f)) => (w, f),
            None => (digits, ""),
        };
        if frac.len() as u32 > places {
            // Only trailing zeros may exceed the precision.
            let (keep, extra) = frac.split_at(places as usize);
            if extra.bytes().any(|b| b != b'0') {
                return None;
            }
            return Self::assemble(negative, whole, keep, places);
        }
        Self::assemble(negative, whole, frac, places)
    }

    fn assemble(negative: bool, whole: &str, frac: &str, places: u32) -> Option<Self> {
        if !whole.bytes().all(|b| b.is_ascii_digit()) || !frac.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let whole: i64 = if whole.is_empty() { 0 } else { whole.parse().ok()? };
        let mut frac_scaled: i64 = if frac.is_empty() { 0 } else { frac.parse().ok()? };
        frac_scaled = frac_scaled.checked_mul(10i64.checked_pow(places - frac.len() as u32)?)?;
        let scaled = whole
            .checked_mul(10i64.checked_pow(places)?)?
            .checked_add(frac_scaled)?;
        Some(Self {
            scaled: if negative { -scaled } else { scaled },
            places,
        })
    }

    /// Returns the scaled integer representation.
    #[must_use]
    pub const fn scaled(self) -> i64 {
        self.scaled
    }

    /// Returns the declared number of decimal places.
    #[must_use]
    pub const fn places(self) -> u32 {
        self.places
    }

    /// Converts to a float, losing exactness.
    #[must_use]
    pub fn to_f64(self) -> f64 {
        self.scaled as f64 / 10f64.powi(self.places as i32)
    }
}

impl PartialOrd for Decimal {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        if self.places == other.places {
            Some(self.scaled.cmp(&other.scaled))
        } else {
            None
        }
    }
}

impl fmt::Display for Decimal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.places == 0 {
            return write!(f, "{}", self.scaled);
        }
        let divisor = 10i64.pow(self.places);
        let whole = self.scaled / divisor;
        let frac = (self.scaled % divisor).abs();
        let sign = if self.scaled < 0 && whole == 0 { "-" } else { "" };
        write!(f, "{sign}{whole}.{frac:0width$}", width = self.places as usize)
    }
}

/// An in-memory attribute value.
///
/// Each variant corresponds to one attribute kind's native representation;
/// attribute filters convert between these and [`itemdb_sql::SqlValue`]s.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// The absent value, permitted only by nullable attributes.
    Null,
    /// A signed 64-bit integer.
    Integer(i64),
    /// An IEEE-754 double.
    Float(f64),
    /// A fixed-point decimal.
    Decimal(Decimal),
    /// A boolean.
    Boolean(bool),
    /// A text string.
    Text(String),
    /// A byte string.
    Bytes(Vec<u8>),
    /// A point in time, kept at microsecond precision.
    Timestamp(DateTime<Utc>),
    /// A store-relative file path with `/` separators.
    Path(String),
    /// An ordered list of text fragments.
    TextList(Vec<String>),
    /// A reference to another item in the same store.
    Reference(StoreId),
}

impl Value {
    /// Checks whether this is the null value.
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Returns the integer value, if this is an integer.
    #[must_use]
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Self::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// Returns the float value, if this is a float.
    #[must_use]
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Self::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Returns the decimal value, if this is a decimal.
    #[must_use]
    pub fn as_decimal(&self) -> Option<Decimal> {
        match self {
            Self::Decimal(d) => Some(*d),
            _ => None,
        }
    }

    /// Returns the boolean value, if this is a boolean.
    #[must_use]
    pub fn as_boolean(&self) -> Option<bool> {
        match self {
            Self::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    /// Returns the text value, if this is text.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the bytes value, if this is bytes.
    #[must_use]
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Returns the timestamp value, if this is a timestamp.
    #[must_use]
    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Timestamp(t) => Some(*t),
            _ => None,
        }
    }

    /// Returns the relative path, if this is a path.
    #[must_use]
    pub fn as_path(&self) -> Option<&str> {
        match self {
            Self::Path(p) => Some(p),
            _ => None,
        }
    }

    /// Returns the text list, if this is a text list.
    #[must_use]
    pub fn as_text_list(&self) -> Option<&[String]> {
        match self {
            Self::TextList(l) => Some(l),
            _ => None,
        }
    }

    /// Returns the referent id, if this is a reference.
    #[must_use]
    pub fn as_reference(&self) -> Option<StoreId> {
        match self {
            Self::Reference(id) => Some(*id),
            _ => None,
        }
    }

    /// Returns a short name for the variant, for error messages.
    #[must_use]
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Integer(_) => "integer",
            Self::Float(_) => "float",
            Self::Decimal(_) => "decimal",
            Self::Boolean(_) => "boolean",
            Self::Text(_) => "text",
            Self::Bytes(_) => "bytes",
            Self::Timestamp(_) => "timestamp",
            Self::Path(_) => "path",
            Self::TextList(_) => "textlist",
            Self::Reference(_) => "reference",
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Integer(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Boolean(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<Decimal> for Value {
    fn from(v: Decimal) -> Self {
        Self::Decimal(v)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Self::Timestamp(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decimal_parse_basic() {
        let d = Decimal::parse("0.10", 4).unwrap();
        assert_eq!(d.scaled(), 1000);
        assert_eq!(d.places(), 4);
        assert_eq!(d.to_f64(), 0.1);
    }

    #[test]
    fn decimal_parse_negative_and_whole() {
        assert_eq!(Decimal::parse("-3", 2).unwrap().scaled(), -300);
        assert_eq!(Decimal::parse("-0.25", 2).unwrap().scaled(), -25);
        assert_eq!(Decimal::parse("10", 0).unwrap().scaled(), 10);
    }

    #[test]
    fn decimal_parse_excess_precision() {
        // Trailing zeros beyond the precision are fine; real digits are not.
        assert!(Decimal::parse("0.1000", 2).is_some());
        assert!(Decimal::parse("0.123", 2).is_none());
    }

    #[test]
    fn decimal_parse_garbage() {
        assert!(Decimal::parse("", 2).is_none());
        assert!(Decimal::parse("abc", 2).is_none());
        assert!(Decimal::parse("1.2.3", 2).is_none());
    }

    #[test]
    fn decimal_display() {
        assert_eq!(Decimal::parse("0.10", 4).unwrap().to_string(), "0.1000");
        assert_eq!(Decimal::parse("-0.25", 2).unwrap().to_string(), "-0.25");
        assert_eq!(Decimal::from_integer(7, 0).unwrap().to_string(), "7");
    }

    #[test]
    fn decimal_ordering_requires_matching_places() {
        let a = Decimal::parse("1.00", 2).unwrap();
        let b = Decimal::parse("2.00", 2).unwrap();
        let c = Decimal::parse("1.0", 1).unwrap();
        assert!(a < b);
        assert!(a.partial_cmp(&c).is_none());
    }

    #[test]
    fn value_accessors() {
        assert_eq!(Value::Integer(5).as_integer(), Some(5));
        assert_eq!(Value::from("hi").as_text(), Some("hi"));
        assert_eq!(Value::Boolean(true).as_boolean(), Some(true));
        assert!(Value::Null.is_null());
        assert!(Value::Integer(5).as_text().is_none());
        assert_eq!(Value::Reference(StoreId::new(4)).as_reference(), Some(StoreId::new(4)));
    }

    #[test]
    fn value_kind_names() {
        assert_eq!(Value::Null.kind_name(), "null");
        assert_eq!(Value::TextList(vec![]).kind_name(), "textlist");
    }
}
