//! Rows, and binding values as Postgres parameters.

use indexmap::IndexMap;
use std::error::Error as StdError;
use tokio_postgres::types::{IsNull, ToSql, Type as PgTypeInfo};

use crate::Value;

/// A row of data as column name → value pairs, in column order.
pub type Row = IndexMap<String, Value>;

/// Build a [`Row`] from `(column, value)` pairs.
///
/// ```
/// use upkeep::{Value, row};
/// let r = row([("uid", Value::from(1)), ("tablenames", Value::from("pages"))]);
/// assert_eq!(r["tablenames"], Value::from("pages"));
/// ```
pub fn row<K: Into<String>>(pairs: impl IntoIterator<Item = (K, Value)>) -> Row {
    pairs.into_iter().map(|(k, v)| (k.into(), v)).collect()
}

/// Wrapper to make our Value usable as a ToSql parameter.
#[derive(Debug)]
pub struct SqlParam<'a>(pub &'a Value);

impl ToSql for SqlParam<'_> {
    fn to_sql(
        &self,
        ty: &PgTypeInfo,
        out: &mut bytes::BytesMut,
    ) -> Result<IsNull, Box<dyn StdError + Sync + Send>> {
        match self.0 {
            Value::Null => Ok(IsNull::Yes),
            Value::Int(v) if <i64 as ToSql>::accepts(ty) => v.to_sql(ty, out),
            Value::Int(v) => v.to_string().to_sql(ty, out),
            Value::Text(v) if <String as ToSql>::accepts(ty) => v.to_sql(ty, out),
            Value::Text(_) => Err(format!("cannot bind a text value to a {ty} parameter").into()),
        }
    }

    fn accepts(ty: &PgTypeInfo) -> bool {
        <i64 as ToSql>::accepts(ty) || <String as ToSql>::accepts(ty)
    }

    tokio_postgres::types::to_sql_checked!();
}
