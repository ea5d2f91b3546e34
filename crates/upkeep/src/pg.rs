//! PostgreSQL backend.
//!
//! Every statement is built as an AST from `upkeep-sql`, so table and column
//! names are always quoted identifiers and values are always bound
//! parameters. Cells are read through their text representation and written
//! back with a cast to the column's declared type, which keeps any column
//! type intact across a delete and reinsert.
//!
//! Postgres has no table-level collation: [`Introspector::table_collation`]
//! is always `None` here and [`Database::convert_table`] is unsupported.
//! The character set is fixed per database, so only the collation half of
//! a [`CollationTarget`] is used, and it must name a collation the server
//! has in `pg_collation`.

use tokio_postgres::types::ToSql;
use upkeep_sql::{
    AlterTableStmt, DeleteStmt, Expr, FromClause, InsertStmt, OrderBy, Render, RenderedSql,
    SelectColumn, SelectStmt, UpdateStmt, render,
};

use crate::catalog::{
    AntiJoin, Assignment, BoxFuture, CollationTarget, ColumnInfo, ColumnType, Database, Filter, Introspector,
    StringType,
};
use crate::error::QueryContext;
use crate::row::SqlParam;
use crate::traced::{Connection, ConnectionExt};
use crate::{Error, Result, Row, Value};

const CHILD: &str = "c";
const PARENT: &str = "p";

static NULL: Value = Value::Null;

/// A [`Database`] over a Postgres connection.
///
/// All statements go through [`TracedConn`](crate::TracedConn), so they show
/// up as `db.query` / `db.execute` spans.
pub struct PgDatabase<C: Connection> {
    conn: C,
}

impl<C: Connection> PgDatabase<C> {
    pub fn new(conn: C) -> Self {
        Self { conn }
    }

    async fn query(
        &self,
        stmt: &impl Render,
        binder: &Binder,
    ) -> std::result::Result<Vec<tokio_postgres::Row>, tokio_postgres::Error> {
        let rendered = render(stmt);
        let params = binder.params(&rendered);
        let refs: Vec<&(dyn ToSql + Sync)> = params.iter().map(|p| p as &(dyn ToSql + Sync)).collect();
        self.conn.traced().query(&rendered.sql, &refs).await
    }

    async fn execute(
        &self,
        stmt: &impl Render,
        binder: &Binder,
    ) -> std::result::Result<u64, tokio_postgres::Error> {
        let rendered = render(stmt);
        let params = binder.params(&rendered);
        let refs: Vec<&(dyn ToSql + Sync)> = params.iter().map(|p| p as &(dyn ToSql + Sync)).collect();
        self.conn.traced().execute(&rendered.sql, &refs).await
    }
}

/// Collects the values bound into a statement under generated names.
#[derive(Default)]
struct Binder {
    values: Vec<(String, Value)>,
}

impl Binder {
    fn bind(&mut self, value: &Value) -> Expr {
        let name = format!("v{}", self.values.len());
        self.values.push((name.clone(), value.clone()));
        Expr::param(name)
    }

    /// Render a filter against `alias` (or the bare table).
    ///
    /// Values compare against the column's text form, the way
    /// [`Value::matches`] does, so values read back through [`read_cells`]
    /// always match the row they came from.
    fn filter(&mut self, alias: Option<&str>, filter: &Filter) -> Option<Expr> {
        Expr::all(filter.conditions().iter().map(|(column, value)| {
            let column = Expr::column_of(alias, column.as_str());
            match value {
                Value::Null => column.is_null(),
                value => column.cast("text").eq(self.bind(value)),
            }
        }))
    }

    /// Values in the order the rendered statement numbers them.
    fn params(&self, rendered: &RenderedSql) -> Vec<SqlParam<'_>> {
        rendered
            .params
            .iter()
            .map(|name| {
                let value = self
                    .values
                    .iter()
                    .find(|(n, _)| n == name)
                    .map_or(&NULL, |(_, v)| v);
                SqlParam(value)
            })
            .collect()
    }
}

/// Read every column of a row selected as `CAST(.. AS text)`.
fn read_cells(row: &tokio_postgres::Row) -> std::result::Result<Vec<Value>, tokio_postgres::Error> {
    (0..row.len())
        .map(|i| Ok(row.try_get::<_, Option<String>>(i)?.map_or(Value::Null, Value::Text)))
        .collect()
}

fn text_of(column: &str) -> Expr {
    Expr::column(column).cast("text")
}

/// `expr` through text into the declared type of `column`, when known.
fn as_declared(expr: Expr, columns: &[ColumnInfo], column: &str) -> Expr {
    let text = expr.cast("text");
    match columns.iter().find(|c| c.name == column) {
        Some(info) => text.cast(info.column_type.to_string()),
        None => text,
    }
}

fn anti_join_select(join: &AntiJoin) -> SelectStmt {
    SelectStmt::new()
        .column(SelectColumn::expr(Expr::int(1)))
        .from(FromClause::aliased(join.parent.as_str(), PARENT))
        .where_(
            Expr::qualified_column(PARENT, join.parent_key.as_str())
                .eq(Expr::qualified_column(CHILD, join.child_key.as_str())),
        )
}

fn anti_join_where(binder: &mut Binder, join: &AntiJoin) -> Expr {
    let orphaned = Expr::not_exists(anti_join_select(join));
    match binder.filter(Some(CHILD), &join.filter) {
        Some(filter) => filter.and(orphaned),
        None => orphaned,
    }
}

impl<C: Connection> Introspector for PgDatabase<C> {
    fn tables(&self) -> BoxFuture<'_, Result<Vec<String>>> {
        Box::pin(async move {
            let rows = self
                .conn
                .traced()
                .query(
                    "SELECT table_name::text FROM information_schema.tables \
                     WHERE table_schema = current_schema() AND table_type = 'BASE TABLE'",
                    &[],
                )
                .await
                .intent(|| "list tables".to_string())?;
            let mut names = rows
                .iter()
                .map(|row| row.try_get::<_, String>(0))
                .collect::<std::result::Result<Vec<_>, _>>()
                .intent(|| "list tables".to_string())?;
            names.sort();
            Ok(names)
        })
    }

    fn table_exists<'a>(&'a self, table: &'a str) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move {
            let row = self
                .conn
                .traced()
                .query_one(
                    "SELECT EXISTS (SELECT 1 FROM information_schema.tables \
                     WHERE table_schema = current_schema() AND table_type = 'BASE TABLE' \
                     AND table_name::text = $1)",
                    &[&table],
                )
                .await
                .intent(|| format!("check whether table {table} exists"))?;
            row.try_get::<_, bool>(0)
                .intent(|| format!("check whether table {table} exists"))
        })
    }

    fn column_exists<'a>(
        &'a self,
        table: &'a str,
        column: &'a str,
    ) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move {
            let row = self
                .conn
                .traced()
                .query_one(
                    "SELECT EXISTS (SELECT 1 FROM information_schema.columns \
                     WHERE table_schema = current_schema() \
                     AND table_name::text = $1 AND column_name::text = $2)",
                    &[&table, &column],
                )
                .await
                .intent(|| format!("check whether column {table}.{column} exists"))?;
            row.try_get::<_, bool>(0)
                .intent(|| format!("check whether column {table}.{column} exists"))
        })
    }

    fn table_collation<'a>(&'a self, _table: &'a str) -> BoxFuture<'a, Result<Option<String>>> {
        Box::pin(async { Ok(None) })
    }

    fn collation_exists<'a>(&'a self, collation: &'a str) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move {
            let row = self
                .conn
                .traced()
                .query_one(
                    "SELECT EXISTS (SELECT 1 FROM pg_collation WHERE collname::text = $1)",
                    &[&collation],
                )
                .await
                .intent(|| format!("look up collation {collation}"))?;
            row.try_get::<_, bool>(0)
                .intent(|| format!("look up collation {collation}"))
        })
    }

    fn columns<'a>(&'a self, table: &'a str) -> BoxFuture<'a, Result<Vec<ColumnInfo>>> {
        Box::pin(async move {
            // attcollation is 0 for non-collatable types, so the join yields NULL.
            let rows = self
                .conn
                .traced()
                .query(
                    "SELECT a.attname::text, format_type(a.atttypid, a.atttypmod), co.collname::text \
                     FROM pg_attribute a \
                     JOIN pg_class c ON c.oid = a.attrelid \
                     JOIN pg_namespace n ON n.oid = c.relnamespace \
                     LEFT JOIN pg_collation co ON co.oid = a.attcollation \
                     WHERE n.nspname = current_schema() AND c.relname::text = $1 \
                     AND c.relkind IN ('r', 'p') AND a.attnum > 0 AND NOT a.attisdropped \
                     ORDER BY a.attnum",
                    &[&table],
                )
                .await
                .intent(|| format!("list columns of {table}"))?;

            rows.iter()
                .map(|row| {
                    let name: String = row.try_get(0)?;
                    let declared: String = row.try_get(1)?;
                    let collation: Option<String> = row.try_get(2)?;
                    Ok(ColumnInfo {
                        name,
                        column_type: ColumnType::parse(&declared),
                        collation,
                    })
                })
                .collect::<std::result::Result<Vec<_>, tokio_postgres::Error>>()
                .intent(|| format!("list columns of {table}"))
        })
    }
}

impl<C: Connection> Database for PgDatabase<C> {
    fn select_distinct<'a>(
        &'a self,
        table: &'a str,
        columns: &'a [String],
        filter: &'a Filter,
    ) -> BoxFuture<'a, Result<Vec<Vec<Value>>>> {
        Box::pin(async move {
            let mut binder = Binder::default();
            let mut stmt = SelectStmt::new()
                .distinct()
                .columns(columns.iter().map(|c| SelectColumn::expr(text_of(c))))
                .from(FromClause::table(table));
            if let Some(filter) = binder.filter(None, filter) {
                stmt = stmt.where_(filter);
            }

            let intent = || format!("list distinct {} in {table}", columns.join(", "));
            let rows = self.query(&stmt, &binder).await.intent(intent)?;
            rows.iter()
                .map(read_cells)
                .collect::<std::result::Result<Vec<_>, _>>()
                .intent(intent)
        })
    }

    fn select_rows<'a>(
        &'a self,
        table: &'a str,
        filter: &'a Filter,
    ) -> BoxFuture<'a, Result<Vec<Row>>> {
        Box::pin(async move {
            let names: Vec<String> = self.columns(table).await?.into_iter().map(|c| c.name).collect();

            let mut binder = Binder::default();
            let mut stmt = SelectStmt::new()
                .columns(names.iter().map(|c| SelectColumn::expr(text_of(c))))
                .from(FromClause::table(table))
                .order_by(OrderBy::asc(Expr::column("ctid")));
            if let Some(filter) = binder.filter(None, filter) {
                stmt = stmt.where_(filter);
            }

            let intent = || format!("read rows of {table} where {filter}");
            let rows = self.query(&stmt, &binder).await.intent(intent)?;
            rows.iter()
                .map(|row| Ok(names.iter().cloned().zip(read_cells(row)?).collect()))
                .collect::<std::result::Result<Vec<Row>, tokio_postgres::Error>>()
                .intent(intent)
        })
    }

    fn count<'a>(&'a self, table: &'a str, filter: &'a Filter) -> BoxFuture<'a, Result<u64>> {
        Box::pin(async move {
            let mut binder = Binder::default();
            let mut stmt = SelectStmt::new()
                .column(SelectColumn::expr(Expr::CountStar))
                .from(FromClause::table(table));
            if let Some(filter) = binder.filter(None, filter) {
                stmt = stmt.where_(filter);
            }

            let intent = || format!("count rows of {table} where {filter}");
            let rows = self.query(&stmt, &binder).await.intent(intent)?;
            let count = match rows.first() {
                Some(row) => row.try_get::<_, i64>(0).intent(intent)?,
                None => 0,
            };
            Ok(count as u64)
        })
    }

    fn delete<'a>(&'a self, table: &'a str, filter: &'a Filter) -> BoxFuture<'a, Result<u64>> {
        Box::pin(async move {
            let mut binder = Binder::default();
            let mut stmt = DeleteStmt::new(table);
            if let Some(filter) = binder.filter(None, filter) {
                stmt = stmt.where_(filter);
            }
            self.execute(&stmt, &binder)
                .await
                .intent(|| format!("delete rows of {table} where {filter}"))
        })
    }

    fn insert<'a>(&'a self, table: &'a str, row: &'a Row) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let columns = self.columns(table).await?;
            let mut binder = Binder::default();
            let mut stmt = InsertStmt::new(table);
            for (name, value) in row {
                let expr = match value {
                    Value::Null => Expr::Null,
                    value => as_declared(binder.bind(value), &columns, name),
                };
                stmt = stmt.column(name.as_str(), expr);
            }
            self.execute(&stmt, &binder)
                .await
                .intent(|| format!("insert a row into {table}"))?;
            Ok(())
        })
    }

    fn update<'a>(
        &'a self,
        table: &'a str,
        filter: &'a Filter,
        assignments: &'a [(String, Assignment)],
    ) -> BoxFuture<'a, Result<u64>> {
        Box::pin(async move {
            let columns = self.columns(table).await?;
            let mut binder = Binder::default();
            let mut stmt = UpdateStmt::new(table);
            for (name, assignment) in assignments {
                let expr = match assignment {
                    Assignment::Value(Value::Null) => Expr::Null,
                    Assignment::Value(value) => as_declared(binder.bind(value), &columns, name),
                    Assignment::Column(source) => {
                        as_declared(Expr::column(source.as_str()), &columns, name)
                    }
                };
                stmt = stmt.set(name.as_str(), expr);
            }
            if let Some(filter) = binder.filter(None, filter) {
                stmt = stmt.where_(filter);
            }
            self.execute(&stmt, &binder)
                .await
                .intent(|| format!("update rows of {table} where {filter}"))
        })
    }

    fn count_orphans<'a>(&'a self, join: &'a AntiJoin) -> BoxFuture<'a, Result<u64>> {
        Box::pin(async move {
            let mut binder = Binder::default();
            let stmt = SelectStmt::new()
                .column(SelectColumn::expr(Expr::CountStar))
                .from(FromClause::aliased(join.child.as_str(), CHILD))
                .where_(anti_join_where(&mut binder, join));

            let intent = || format!("count orphaned rows of {}", join.child);
            let rows = self.query(&stmt, &binder).await.intent(intent)?;
            let count = match rows.first() {
                Some(row) => row.try_get::<_, i64>(0).intent(intent)?,
                None => 0,
            };
            Ok(count as u64)
        })
    }

    fn has_orphans<'a>(&'a self, join: &'a AntiJoin) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move {
            let mut binder = Binder::default();
            let stmt = SelectStmt::new()
                .column(SelectColumn::expr(Expr::int(1)))
                .from(FromClause::aliased(join.child.as_str(), CHILD))
                .where_(anti_join_where(&mut binder, join))
                .limit(Expr::int(1));

            let rows = self
                .query(&stmt, &binder)
                .await
                .intent(|| format!("look for orphaned rows of {}", join.child))?;
            Ok(!rows.is_empty())
        })
    }

    fn delete_orphans<'a>(&'a self, join: &'a AntiJoin) -> BoxFuture<'a, Result<u64>> {
        Box::pin(async move {
            let mut binder = Binder::default();
            let stmt = DeleteStmt::new(join.child.as_str())
                .alias(CHILD)
                .where_(anti_join_where(&mut binder, join));
            self.execute(&stmt, &binder)
                .await
                .intent(|| format!("delete orphaned rows of {}", join.child))
        })
    }

    fn duplicate_keys<'a>(
        &'a self,
        table: &'a str,
        key: &'a [String],
    ) -> BoxFuture<'a, Result<Vec<Vec<Value>>>> {
        Box::pin(async move {
            let mut stmt = SelectStmt::new()
                .columns(key.iter().map(|c| SelectColumn::expr(text_of(c))))
                .from(FromClause::table(table))
                .group_by(key.iter().map(|c| Expr::column(c.as_str())))
                .having(Expr::CountStar.gt(Expr::int(1)));
            for column in key {
                stmt = stmt.order_by(OrderBy::asc(Expr::column(column.as_str())));
            }

            let intent = || format!("find duplicate ({}) groups in {table}", key.join(", "));
            let rows = self
                .query(&stmt, &Binder::default())
                .await
                .intent(intent)?;
            rows.iter()
                .map(read_cells)
                .collect::<std::result::Result<Vec<_>, _>>()
                .intent(intent)
        })
    }

    fn begin(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.conn
                .traced()
                .batch_execute("BEGIN")
                .await
                .intent(|| "begin a transaction".to_string())
        })
    }

    fn commit(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.conn
                .traced()
                .batch_execute("COMMIT")
                .await
                .intent(|| "commit a transaction".to_string())
        })
    }

    fn rollback(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.conn
                .traced()
                .batch_execute("ROLLBACK")
                .await
                .intent(|| "roll back a transaction".to_string())
        })
    }

    fn convert_table<'a>(
        &'a self,
        table: &'a str,
        target: &'a CollationTarget,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            Err(Error::Unsupported(format!(
                "converting table {table} to {target}"
            )))
        })
    }

    fn alter_column<'a>(
        &'a self,
        table: &'a str,
        column: &'a str,
        ty: &'a StringType,
        target: &'a CollationTarget,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let stmt = AlterTableStmt::alter_column_type(
                table,
                column,
                ty.to_string(),
                Some(target.collation.clone()),
            );
            self.execute(&stmt, &Binder::default())
                .await
                .intent(|| format!("change collation of {table}.{column} to {}", target.collation))?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_binds_values_in_order() {
        let mut binder = Binder::default();
        let filter = Filter::all()
            .eq("tablenames", "pages")
            .eq("uid_local", 3)
            .eq("fieldname", Value::Null);
        let stmt = DeleteStmt::new("sys_category_record_mm")
            .where_(binder.filter(None, &filter).expect("non-empty filter"));

        let rendered = render(&stmt);
        insta::assert_snapshot!(rendered.sql, @r#"
        DELETE FROM "sys_category_record_mm"
        WHERE CAST("tablenames" AS text) = $1 AND CAST("uid_local" AS text) = $2 AND "fieldname" IS NULL
        "#);
        let params = binder.params(&rendered);
        assert_eq!(params.len(), 2);
        assert_eq!(params[0].0, &Value::from("pages"));
        assert_eq!(params[1].0, &Value::Int(3));
    }

    #[test]
    fn update_casts_through_declared_types() {
        let columns = [
            ColumnInfo {
                name: "assets".into(),
                column_type: ColumnType::parse("integer"),
                collation: None,
            },
            ColumnInfo {
                name: "media".into(),
                column_type: ColumnType::parse("integer"),
                collation: None,
            },
        ];
        let mut binder = Binder::default();
        let stmt = UpdateStmt::new("tt_content")
            .set("assets", as_declared(Expr::column("media"), &columns, "assets"))
            .set("media", as_declared(binder.bind(&Value::Int(0)), &columns, "media"))
            .where_(binder.filter(None, &Filter::all().eq("uid", 7)).expect("non-empty filter"));

        let rendered = render(&stmt);
        insta::assert_snapshot!(rendered.sql, @r#"
        UPDATE "tt_content"
        SET "assets" = CAST(CAST("media" AS text) AS integer), "media" = CAST(CAST($1 AS text) AS integer)
        WHERE CAST("uid" AS text) = $2
        "#);
        let params = binder.params(&rendered);
        assert_eq!(params[0].0, &Value::Int(0));
        assert_eq!(params[1].0, &Value::Int(7));
    }

    #[test]
    fn empty_filter_renders_no_where() {
        let mut binder = Binder::default();
        assert!(binder.filter(None, &Filter::all()).is_none());
    }

    #[test]
    fn anti_join_delete_statement() {
        let join = AntiJoin {
            child: "sys_file_reference".into(),
            child_key: "uid_foreign".into(),
            parent: "tt_content".into(),
            parent_key: "uid".into(),
            filter: Filter::all().eq("tablenames", "tt_content"),
        };
        let mut binder = Binder::default();
        let stmt = DeleteStmt::new(join.child.as_str())
            .alias(CHILD)
            .where_(anti_join_where(&mut binder, &join));

        insta::assert_snapshot!(render(&stmt).sql, @r#"
        DELETE FROM "sys_file_reference" "c"
        WHERE CAST("c"."tablenames" AS text) = $1 AND NOT EXISTS (SELECT 1
        FROM "tt_content" "p"
        WHERE "p"."uid" = "c"."uid_foreign")
        "#);
    }

    #[test]
    fn unfiltered_anti_join_is_just_not_exists() {
        let join = AntiJoin {
            child: "sys_file_metadata".into(),
            child_key: "file".into(),
            parent: "sys_file".into(),
            parent_key: "uid".into(),
            filter: Filter::all(),
        };
        let mut binder = Binder::default();
        let stmt = SelectStmt::new()
            .column(SelectColumn::expr(Expr::CountStar))
            .from(FromClause::aliased(join.child.as_str(), CHILD))
            .where_(anti_join_where(&mut binder, &join));

        let rendered = render(&stmt);
        insta::assert_snapshot!(rendered.sql, @r#"
        SELECT COUNT(*)
        FROM "sys_file_metadata" "c"
        WHERE NOT EXISTS (SELECT 1
        FROM "sys_file" "p"
        WHERE "p"."uid" = "c"."file")
        "#);
        assert!(rendered.params.is_empty());
    }
}
