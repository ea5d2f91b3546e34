//! Statement tracing.
//!
//! Every statement upkeep sends goes through [`TracedConn`], which wraps it
//! in a debug span carrying the SQL text and, once it completes, the number
//! of rows it touched.

use std::ops::Deref;

use tokio_postgres::types::ToSql;
use tokio_postgres::{Error, Row};
use tracing::Instrument;
use tracing::field::Empty;

use crate::catalog::BoxFuture;

/// Bound statement parameters.
pub type Params<'a> = &'a [&'a (dyn ToSql + Sync)];

/// Something that can run Postgres statements.
///
/// Implemented for `tokio_postgres::Client` and `deadpool_postgres::Object`.
pub trait Connection: Send + Sync {
    fn execute<'a>(&'a self, sql: &'a str, params: Params<'a>) -> BoxFuture<'a, Result<u64, Error>>;

    fn query<'a>(&'a self, sql: &'a str, params: Params<'a>)
    -> BoxFuture<'a, Result<Vec<Row>, Error>>;

    fn query_one<'a>(&'a self, sql: &'a str, params: Params<'a>) -> BoxFuture<'a, Result<Row, Error>>;

    /// Run parameterless statements such as `BEGIN`.
    fn batch_execute<'a>(&'a self, sql: &'a str) -> BoxFuture<'a, Result<(), Error>>;
}

/// Logs each statement run through the wrapped connection.
///
/// ```ignore
/// use upkeep::ConnectionExt;
///
/// let conn = pool.get().await?;
/// let removed = conn
///     .traced()
///     .execute("DELETE FROM sys_file_metadata WHERE file = $1", &[&uid])
///     .await?;
/// ```
pub struct TracedConn<'a, C: Connection> {
    conn: &'a C,
}

impl<'a, C: Connection> TracedConn<'a, C> {
    pub fn new(conn: &'a C) -> Self {
        Self { conn }
    }

    /// Returns the number of rows affected.
    pub async fn execute(&self, sql: &str, params: Params<'_>) -> Result<u64, Error> {
        let span = tracing::debug_span!("db.execute", %sql, params = params.len(), affected = Empty);
        let affected = self.conn.execute(sql, params).instrument(span.clone()).await?;
        span.record("affected", affected);
        Ok(affected)
    }

    pub async fn query(&self, sql: &str, params: Params<'_>) -> Result<Vec<Row>, Error> {
        let span = tracing::debug_span!("db.query", %sql, params = params.len(), rows = Empty);
        let rows = self.conn.query(sql, params).instrument(span.clone()).await?;
        span.record("rows", rows.len());
        Ok(rows)
    }

    /// Fails unless the query returns exactly one row.
    pub async fn query_one(&self, sql: &str, params: Params<'_>) -> Result<Row, Error> {
        let span = tracing::debug_span!("db.query", %sql, params = params.len(), rows = 1u64);
        self.conn.query_one(sql, params).instrument(span).await
    }

    pub async fn batch_execute(&self, sql: &str) -> Result<(), Error> {
        let span = tracing::debug_span!("db.batch", %sql);
        self.conn.batch_execute(sql).instrument(span).await
    }
}

pub trait ConnectionExt: Connection + Sized {
    fn traced(&self) -> TracedConn<'_, Self> {
        TracedConn::new(self)
    }
}

impl<C: Connection> ConnectionExt for C {}

impl Connection for tokio_postgres::Client {
    fn execute<'a>(&'a self, sql: &'a str, params: Params<'a>) -> BoxFuture<'a, Result<u64, Error>> {
        Box::pin(tokio_postgres::Client::execute(self, sql, params))
    }

    fn query<'a>(
        &'a self,
        sql: &'a str,
        params: Params<'a>,
    ) -> BoxFuture<'a, Result<Vec<Row>, Error>> {
        Box::pin(tokio_postgres::Client::query(self, sql, params))
    }

    fn query_one<'a>(&'a self, sql: &'a str, params: Params<'a>) -> BoxFuture<'a, Result<Row, Error>> {
        Box::pin(tokio_postgres::Client::query_one(self, sql, params))
    }

    fn batch_execute<'a>(&'a self, sql: &'a str) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(tokio_postgres::Client::batch_execute(self, sql))
    }
}

// Pooled objects forward to the client they deref to.
impl Connection for deadpool_postgres::Object {
    fn execute<'a>(&'a self, sql: &'a str, params: Params<'a>) -> BoxFuture<'a, Result<u64, Error>> {
        Connection::execute(client(self), sql, params)
    }

    fn query<'a>(
        &'a self,
        sql: &'a str,
        params: Params<'a>,
    ) -> BoxFuture<'a, Result<Vec<Row>, Error>> {
        Connection::query(client(self), sql, params)
    }

    fn query_one<'a>(&'a self, sql: &'a str, params: Params<'a>) -> BoxFuture<'a, Result<Row, Error>> {
        Connection::query_one(client(self), sql, params)
    }

    fn batch_execute<'a>(&'a self, sql: &'a str) -> BoxFuture<'a, Result<(), Error>> {
        Connection::batch_execute(client(self), sql)
    }
}

fn client(object: &deadpool_postgres::Object) -> &tokio_postgres::Client {
    object.deref()
}
