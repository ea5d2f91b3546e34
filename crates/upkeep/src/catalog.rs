//! Schema introspection and data access.
//!
//! [`Introspector`] answers questions about the live schema: which tables
//! exist, which columns they carry, and what collation each one declares.
//! Nothing is cached; every call goes back to the catalog, so a unit always
//! sees the schema as it is right now, even if another unit changed it.
//!
//! [`Database`] adds the handful of data operations the reconciliation
//! algorithms need. Both traits are object-safe so units can take
//! `&dyn Database` and run against Postgres or the in-memory backend.

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use crate::{Result, Row, Value};

/// A boxed, sendable future.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Whether a character column holds short (bounded) or long text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StringKind {
    /// char, varchar, character varying
    Short,
    /// text and its size variants
    Long,
}

/// A string column's declared type.
///
/// Displays back to exactly what was parsed, so a column can be rewritten
/// with a new collation without changing its base type or length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StringType {
    pub kind: StringKind,
    /// Base type name as declared, e.g. `varchar` or `character varying`.
    pub name: String,
    pub length: Option<u32>,
}

impl fmt::Display for StringType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.length {
            Some(len) => write!(f, "{}({})", self.name, len),
            None => write!(f, "{}", self.name),
        }
    }
}

/// A column's declared type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnType {
    String(StringType),
    /// Any non-character type, kept verbatim.
    Other(String),
}

impl ColumnType {
    /// Classify a declared type such as `character varying(255)` or `int`.
    pub fn parse(declared: &str) -> Self {
        let declared = declared.trim();
        let (name, length) = match declared.find('(') {
            Some(open) if declared.ends_with(')') => {
                let len = declared[open + 1..declared.len() - 1].trim().parse::<u32>();
                match len {
                    Ok(len) => (declared[..open].trim_end(), Some(len)),
                    Err(_) => return ColumnType::Other(declared.to_string()),
                }
            }
            Some(_) => return ColumnType::Other(declared.to_string()),
            None => (declared, None),
        };

        let kind = match name.to_ascii_lowercase().as_str() {
            "char" | "character" | "bpchar" | "varchar" | "character varying" => StringKind::Short,
            "text" | "tinytext" | "mediumtext" | "longtext" if length.is_none() => StringKind::Long,
            _ => return ColumnType::Other(declared.to_string()),
        };

        ColumnType::String(StringType {
            kind,
            name: name.to_string(),
            length,
        })
    }

    pub fn as_string(&self) -> Option<&StringType> {
        match self {
            ColumnType::String(s) => Some(s),
            ColumnType::Other(_) => None,
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnType::String(s) => write!(f, "{s}"),
            ColumnType::Other(s) => write!(f, "{s}"),
        }
    }
}

/// A column as the catalog reports it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    pub name: String,
    pub column_type: ColumnType,
    /// `None` for non-character columns.
    pub collation: Option<String>,
}

impl ColumnInfo {
    pub fn is_string(&self) -> bool {
        self.column_type.as_string().is_some()
    }
}

/// A character set and collation that tables and columns should end up with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollationTarget {
    pub charset: String,
    pub collation: String,
}

impl CollationTarget {
    pub fn new(charset: impl Into<String>, collation: impl Into<String>) -> Self {
        Self {
            charset: charset.into(),
            collation: collation.into(),
        }
    }
}

impl Default for CollationTarget {
    fn default() -> Self {
        Self::new("utf8mb4", "utf8mb4_general_ci")
    }
}

impl fmt::Display for CollationTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.charset, self.collation)
    }
}

/// A conjunction of column equalities. A NULL value means `IS NULL`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Filter {
    conditions: Vec<(String, Value)>,
}

impl Filter {
    /// Matches every row.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn eq(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.conditions.push((column.into(), value.into()));
        self
    }

    /// Equalities pairing each key column with the value at the same position.
    pub fn from_key(columns: &[String], values: &[Value]) -> Self {
        Self {
            conditions: columns.iter().cloned().zip(values.iter().cloned()).collect(),
        }
    }

    /// Both filters' conditions.
    pub fn and(mut self, other: &Filter) -> Self {
        self.conditions.extend(other.conditions.iter().cloned());
        self
    }

    pub fn conditions(&self) -> &[(String, Value)] {
        &self.conditions
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    pub fn matches(&self, row: &Row) -> bool {
        self.conditions.iter().all(|(column, expected)| {
            let actual = row.get(column).unwrap_or(&Value::Null);
            actual.matches(expected)
        })
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.conditions.is_empty() {
            return write!(f, "all rows");
        }
        for (i, (column, value)) in self.conditions.iter().enumerate() {
            if i > 0 {
                write!(f, " AND ")?;
            }
            match value {
                Value::Null => write!(f, "{column} IS NULL")?,
                value => write!(f, "{column} = {value}")?,
            }
        }
        Ok(())
    }
}

/// The new value of a column in [`Database::update`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Assignment {
    Value(Value),
    /// Copy another column of the same row, as it was before the update.
    Column(String),
}

impl Assignment {
    pub fn value(value: impl Into<Value>) -> Self {
        Assignment::Value(value.into())
    }

    pub fn column(column: impl Into<String>) -> Self {
        Assignment::Column(column.into())
    }
}

/// Child rows matching `filter` whose `child_key` has no matching
/// `parent_key` in `parent`.
///
/// Both tables and both key columns must exist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AntiJoin {
    pub child: String,
    pub child_key: String,
    pub parent: String,
    pub parent_key: String,
    pub filter: Filter,
}

/// Read-only view of the live schema.
///
/// Absent tables and columns are answered (`false`, `None`, empty), never
/// raised as errors.
pub trait Introspector: Send + Sync {
    /// Base tables in the current schema, sorted by name.
    fn tables(&self) -> BoxFuture<'_, Result<Vec<String>>>;

    fn table_exists<'a>(&'a self, table: &'a str) -> BoxFuture<'a, Result<bool>>;

    fn column_exists<'a>(&'a self, table: &'a str, column: &'a str)
    -> BoxFuture<'a, Result<bool>>;

    /// The table's declared collation, if the backend has table-level collations.
    fn table_collation<'a>(&'a self, table: &'a str) -> BoxFuture<'a, Result<Option<String>>>;

    /// Whether the server knows a collation by this name.
    fn collation_exists<'a>(&'a self, collation: &'a str) -> BoxFuture<'a, Result<bool>>;

    /// Columns in declaration order. Empty for an absent table.
    fn columns<'a>(&'a self, table: &'a str) -> BoxFuture<'a, Result<Vec<ColumnInfo>>>;

    fn column_collation<'a>(
        &'a self,
        table: &'a str,
        column: &'a str,
    ) -> BoxFuture<'a, Result<Option<String>>> {
        Box::pin(async move {
            let columns = self.columns(table).await?;
            Ok(columns
                .into_iter()
                .find(|c| c.name == column)
                .and_then(|c| c.collation))
        })
    }

    /// Columns whose type is short or long text.
    fn string_columns<'a>(&'a self, table: &'a str) -> BoxFuture<'a, Result<Vec<ColumnInfo>>> {
        Box::pin(async move {
            let columns = self.columns(table).await?;
            Ok(columns.into_iter().filter(ColumnInfo::is_string).collect())
        })
    }
}

/// The data operations the reconciliation algorithms are built from.
///
/// Table and column names passed here must have been checked against the
/// [`Introspector`] first; backends quote them but do not validate them.
pub trait Database: Introspector {
    /// Distinct combinations of `columns` among rows matching `filter`.
    fn select_distinct<'a>(
        &'a self,
        table: &'a str,
        columns: &'a [String],
        filter: &'a Filter,
    ) -> BoxFuture<'a, Result<Vec<Vec<Value>>>>;

    /// Rows matching `filter`, in storage order.
    fn select_rows<'a>(&'a self, table: &'a str, filter: &'a Filter)
    -> BoxFuture<'a, Result<Vec<Row>>>;

    fn count<'a>(&'a self, table: &'a str, filter: &'a Filter) -> BoxFuture<'a, Result<u64>>;

    fn delete<'a>(&'a self, table: &'a str, filter: &'a Filter) -> BoxFuture<'a, Result<u64>>;

    fn insert<'a>(&'a self, table: &'a str, row: &'a Row) -> BoxFuture<'a, Result<()>>;

    /// Apply `assignments` to every row matching `filter`, returning how many
    /// rows matched.
    fn update<'a>(
        &'a self,
        table: &'a str,
        filter: &'a Filter,
        assignments: &'a [(String, Assignment)],
    ) -> BoxFuture<'a, Result<u64>>;

    fn count_orphans<'a>(&'a self, join: &'a AntiJoin) -> BoxFuture<'a, Result<u64>>;

    /// Whether at least one orphan exists. Stops at the first one.
    fn has_orphans<'a>(&'a self, join: &'a AntiJoin) -> BoxFuture<'a, Result<bool>>;

    /// Delete every orphan in one statement, returning how many went.
    fn delete_orphans<'a>(&'a self, join: &'a AntiJoin) -> BoxFuture<'a, Result<u64>>;

    /// Values of `key` shared by more than one row, ordered by key.
    fn duplicate_keys<'a>(
        &'a self,
        table: &'a str,
        key: &'a [String],
    ) -> BoxFuture<'a, Result<Vec<Vec<Value>>>>;

    fn begin(&self) -> BoxFuture<'_, Result<()>>;

    fn commit(&self) -> BoxFuture<'_, Result<()>>;

    fn rollback(&self) -> BoxFuture<'_, Result<()>>;

    /// Convert a whole table, and every character column on it, to `target`.
    fn convert_table<'a>(
        &'a self,
        table: &'a str,
        target: &'a CollationTarget,
    ) -> BoxFuture<'a, Result<()>>;

    /// Rewrite one column's collation, keeping its declared type `ty`.
    fn alter_column<'a>(
        &'a self,
        table: &'a str,
        column: &'a str,
        ty: &'a StringType,
        target: &'a CollationTarget,
    ) -> BoxFuture<'a, Result<()>>;
}
