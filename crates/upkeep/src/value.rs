//! Cell values.

use std::borrow::Cow;
use std::fmt;

use upkeep_sql::Lit;

/// A single cell value.
///
/// Only the distinctions the reconciliation algorithms need are kept. The
/// Postgres backend reads every cell through its text representation, so
/// integer columns come back as `Text` there.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Value {
    Null,
    Int(i64),
    Text(String),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// The value's text representation, or `None` for NULL.
    pub fn as_text(&self) -> Option<Cow<'_, str>> {
        match self {
            Value::Null => None,
            Value::Int(n) => Some(Cow::Owned(n.to_string())),
            Value::Text(s) => Some(Cow::Borrowed(s)),
        }
    }

    /// The value as an integer, parsing text the way a numeric cast would.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Null => None,
            Value::Int(n) => Some(*n),
            Value::Text(s) => s.trim().parse().ok(),
        }
    }

    /// SQL equality under text comparison: NULL never equals anything.
    pub fn sql_eq(&self, other: &Value) -> bool {
        match (self.as_text(), other.as_text()) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }

    /// Filter matching: like [`Value::sql_eq`], except NULL matches NULL
    /// (`IS NULL`).
    pub fn matches(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            _ => self.sql_eq(other),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Int(n) => write!(f, "{n}"),
            Value::Text(s) => write!(f, "{}", Lit(s)),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(v) => v.into(),
            None => Value::Null,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_never_equals() {
        assert!(!Value::Null.sql_eq(&Value::Null));
        assert!(Value::Null.matches(&Value::Null));
        assert!(!Value::Null.matches(&Value::Int(0)));
    }

    #[test]
    fn int_and_text_compare_by_text() {
        assert!(Value::Int(42).sql_eq(&Value::from("42")));
        assert!(!Value::Int(42).sql_eq(&Value::from("042")));
    }

    #[test]
    fn integers_read_from_text() {
        assert_eq!(Value::from("12").as_int(), Some(12));
        assert_eq!(Value::from(" 3 ").as_int(), Some(3));
        assert_eq!(Value::from("de").as_int(), None);
        assert_eq!(Value::from("").as_int(), None);
        assert_eq!(Value::Null.as_int(), None);
    }

    #[test]
    fn display_quotes_text() {
        assert_eq!(Value::from("it's").to_string(), "'it''s'");
        assert_eq!(Value::from(7).to_string(), "7");
        assert_eq!(Value::from(None::<i64>).to_string(), "NULL");
    }
}
