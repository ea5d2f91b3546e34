//! In-memory backend.
//!
//! Models a catalog with both table- and column-level collations (the shape
//! MySQL/MariaDB have), rows kept in insertion order, and a single-level
//! transaction snapshot. Tests use it to exercise the reconciliation
//! algorithms without a server; it is also handy for dry runs.

use std::collections::{BTreeMap, BTreeSet};
use std::future::ready;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::catalog::{
    AntiJoin, Assignment, BoxFuture, CollationTarget, ColumnInfo, ColumnType, Database, Filter, Introspector,
    StringType,
};
use crate::error::{BackendError, QueryContext};
use crate::{Result, Row, Value};

#[derive(Debug, Clone)]
struct Table {
    collation: Option<String>,
    columns: Vec<ColumnInfo>,
    rows: Vec<Row>,
}

#[derive(Debug, Default)]
struct State {
    tables: BTreeMap<String, Table>,
    snapshot: Option<BTreeMap<String, Table>>,
    failing_inserts: BTreeSet<String>,
    /// `None` accepts any collation name.
    known_collations: Option<BTreeSet<String>>,
}

/// A [`Database`] held entirely in memory.
#[derive(Debug, Default)]
pub struct MemoryDatabase {
    state: Mutex<State>,
}

fn fail(message: impl Into<String>) -> BackendError {
    BackendError::Memory(message.into())
}

fn done<'a, T: Send + 'a>(result: Result<T>) -> BoxFuture<'a, Result<T>> {
    Box::pin(ready(result))
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create (or replace) a table.
    ///
    /// `columns` are `(name, declared type)` pairs. When `collation` is given
    /// it becomes the table collation and the collation of every string
    /// column.
    pub fn create_table(&self, name: &str, collation: Option<&str>, columns: &[(&str, &str)]) {
        let columns = columns
            .iter()
            .map(|(column, declared)| {
                let column_type = ColumnType::parse(declared);
                let collation = match column_type {
                    ColumnType::String(_) => collation.map(str::to_string),
                    ColumnType::Other(_) => None,
                };
                ColumnInfo {
                    name: column.to_string(),
                    column_type,
                    collation,
                }
            })
            .collect();
        self.lock().tables.insert(
            name.to_string(),
            Table {
                collation: collation.map(str::to_string),
                columns,
                rows: Vec::new(),
            },
        );
    }

    pub fn drop_table(&self, name: &str) {
        self.lock().tables.remove(name);
    }

    /// Override a single column's collation.
    pub fn set_column_collation(&self, table: &str, column: &str, collation: &str) {
        let mut state = self.lock();
        if let Some(info) = state
            .tables
            .get_mut(table)
            .and_then(|t| t.columns.iter_mut().find(|c| c.name == column))
        {
            info.collation = Some(collation.to_string());
        }
    }

    /// Append rows, bypassing insert failure injection.
    pub fn seed(&self, table: &str, rows: impl IntoIterator<Item = Row>) {
        let mut state = self.lock();
        if let Some(t) = state.tables.get_mut(table) {
            let rows: Vec<Row> = rows.into_iter().map(|row| conform(&t.columns, &row)).collect();
            t.rows.extend(rows);
        }
    }

    /// Rows of a table in storage order. Empty for an absent table.
    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.lock()
            .tables
            .get(table)
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    /// Make every later insert into `table` fail.
    pub fn fail_inserts_into(&self, table: &str) {
        self.lock().failing_inserts.insert(table.to_string());
    }

    /// Only recognise these collations from now on.
    pub fn restrict_collations(&self, collations: &[&str]) {
        self.lock().known_collations = Some(collations.iter().map(|c| c.to_string()).collect());
    }

    pub fn in_transaction(&self) -> bool {
        self.lock().snapshot.is_some()
    }
}

/// Lay a row out in the table's column order, filling absent columns with NULL.
fn conform(columns: &[ColumnInfo], row: &Row) -> Row {
    columns
        .iter()
        .map(|c| (c.name.clone(), row.get(&c.name).cloned().unwrap_or(Value::Null)))
        .collect()
}

fn orphaned(child: &Row, join: &AntiJoin, parent: &Table) -> bool {
    if !join.filter.matches(child) {
        return false;
    }
    let key = child.get(&join.child_key).unwrap_or(&Value::Null);
    !parent
        .rows
        .iter()
        .any(|p| p.get(&join.parent_key).is_some_and(|v| v.sql_eq(key)))
}

impl State {
    fn table(&self, name: &str) -> std::result::Result<&Table, BackendError> {
        self.tables
            .get(name)
            .ok_or_else(|| fail(format!("relation \"{name}\" does not exist")))
    }

    fn table_mut(&mut self, name: &str) -> std::result::Result<&mut Table, BackendError> {
        self.tables
            .get_mut(name)
            .ok_or_else(|| fail(format!("relation \"{name}\" does not exist")))
    }

    fn anti_join(&self, join: &AntiJoin) -> std::result::Result<(&Table, &Table), BackendError> {
        Ok((self.table(&join.child)?, self.table(&join.parent)?))
    }
}

impl Introspector for MemoryDatabase {
    fn tables(&self) -> BoxFuture<'_, Result<Vec<String>>> {
        let names = self.lock().tables.keys().cloned().collect();
        done(Ok(names))
    }

    fn table_exists<'a>(&'a self, table: &'a str) -> BoxFuture<'a, Result<bool>> {
        let exists = self.lock().tables.contains_key(table);
        done(Ok(exists))
    }

    fn column_exists<'a>(
        &'a self,
        table: &'a str,
        column: &'a str,
    ) -> BoxFuture<'a, Result<bool>> {
        let exists = self
            .lock()
            .tables
            .get(table)
            .is_some_and(|t| t.columns.iter().any(|c| c.name == column));
        done(Ok(exists))
    }

    fn table_collation<'a>(&'a self, table: &'a str) -> BoxFuture<'a, Result<Option<String>>> {
        let collation = self
            .lock()
            .tables
            .get(table)
            .and_then(|t| t.collation.clone());
        done(Ok(collation))
    }

    fn collation_exists<'a>(&'a self, collation: &'a str) -> BoxFuture<'a, Result<bool>> {
        let exists = self
            .lock()
            .known_collations
            .as_ref()
            .is_none_or(|known| known.contains(collation));
        done(Ok(exists))
    }

    fn columns<'a>(&'a self, table: &'a str) -> BoxFuture<'a, Result<Vec<ColumnInfo>>> {
        let columns = self
            .lock()
            .tables
            .get(table)
            .map(|t| t.columns.clone())
            .unwrap_or_default();
        done(Ok(columns))
    }
}

impl Database for MemoryDatabase {
    fn select_distinct<'a>(
        &'a self,
        table: &'a str,
        columns: &'a [String],
        filter: &'a Filter,
    ) -> BoxFuture<'a, Result<Vec<Vec<Value>>>> {
        let state = self.lock();
        let result = state.table(table).map(|t| {
            let distinct: BTreeSet<Vec<Value>> = t
                .rows
                .iter()
                .filter(|row| filter.matches(row))
                .map(|row| {
                    columns
                        .iter()
                        .map(|c| row.get(c).cloned().unwrap_or(Value::Null))
                        .collect()
                })
                .collect();
            distinct.into_iter().collect()
        });
        done(
            result.intent(|| format!("list distinct {} in {table}", columns.join(", "))),
        )
    }

    fn select_rows<'a>(
        &'a self,
        table: &'a str,
        filter: &'a Filter,
    ) -> BoxFuture<'a, Result<Vec<Row>>> {
        let state = self.lock();
        let result = state.table(table).map(|t| {
            t.rows
                .iter()
                .filter(|row| filter.matches(row))
                .cloned()
                .collect()
        });
        done(
            result.intent(|| format!("read rows of {table} where {filter}")),
        )
    }

    fn count<'a>(&'a self, table: &'a str, filter: &'a Filter) -> BoxFuture<'a, Result<u64>> {
        let state = self.lock();
        let result = state
            .table(table)
            .map(|t| t.rows.iter().filter(|row| filter.matches(row)).count() as u64);
        done(
            result.intent(|| format!("count rows of {table} where {filter}")),
        )
    }

    fn delete<'a>(&'a self, table: &'a str, filter: &'a Filter) -> BoxFuture<'a, Result<u64>> {
        let mut state = self.lock();
        let result = state.table_mut(table).map(|t| {
            let before = t.rows.len();
            t.rows.retain(|row| !filter.matches(row));
            (before - t.rows.len()) as u64
        });
        done(
            result.intent(|| format!("delete rows of {table} where {filter}")),
        )
    }

    fn insert<'a>(&'a self, table: &'a str, row: &'a Row) -> BoxFuture<'a, Result<()>> {
        let mut state = self.lock();
        let result = if state.failing_inserts.contains(table) {
            Err(fail(format!("insert into \"{table}\" rejected")))
        } else {
            state.table_mut(table).and_then(|t| {
                if let Some(unknown) = row.keys().find(|k| !t.columns.iter().any(|c| &c.name == *k)) {
                    return Err(fail(format!(
                        "column \"{unknown}\" of relation \"{table}\" does not exist"
                    )));
                }
                let row = conform(&t.columns, row);
                t.rows.push(row);
                Ok(())
            })
        };
        done(
            result.intent(|| format!("insert a row into {table}")),
        )
    }

    fn update<'a>(
        &'a self,
        table: &'a str,
        filter: &'a Filter,
        assignments: &'a [(String, Assignment)],
    ) -> BoxFuture<'a, Result<u64>> {
        let mut state = self.lock();
        let result = state.table_mut(table).and_then(|t| {
            for (column, assignment) in assignments {
                let source = match assignment {
                    Assignment::Column(source) => Some(source.as_str()),
                    Assignment::Value(_) => None,
                };
                let unknown = std::iter::once(column.as_str())
                    .chain(source)
                    .find(|name| !t.columns.iter().any(|c| c.name == *name));
                if let Some(unknown) = unknown {
                    return Err(fail(format!(
                        "column \"{unknown}\" of relation \"{table}\" does not exist"
                    )));
                }
            }

            let mut matched = 0;
            for row in t.rows.iter_mut().filter(|row| filter.matches(row)) {
                let before = row.clone();
                for (column, assignment) in assignments {
                    let value = match assignment {
                        Assignment::Value(value) => value.clone(),
                        Assignment::Column(source) => {
                            before.get(source).cloned().unwrap_or(Value::Null)
                        }
                    };
                    row.insert(column.clone(), value);
                }
                matched += 1;
            }
            Ok(matched)
        });
        done(result.intent(|| format!("update rows of {table} where {filter}")))
    }

    fn count_orphans<'a>(&'a self, join: &'a AntiJoin) -> BoxFuture<'a, Result<u64>> {
        let state = self.lock();
        let result = state.anti_join(join).map(|(child, parent)| {
            child
                .rows
                .iter()
                .filter(|row| orphaned(row, join, parent))
                .count() as u64
        });
        done(
            result.intent(|| format!("count orphaned rows of {}", join.child)),
        )
    }

    fn has_orphans<'a>(&'a self, join: &'a AntiJoin) -> BoxFuture<'a, Result<bool>> {
        let state = self.lock();
        let result = state
            .anti_join(join)
            .map(|(child, parent)| child.rows.iter().any(|row| orphaned(row, join, parent)));
        done(
            result.intent(|| format!("look for orphaned rows of {}", join.child)),
        )
    }

    fn delete_orphans<'a>(&'a self, join: &'a AntiJoin) -> BoxFuture<'a, Result<u64>> {
        let mut state = self.lock();
        let result = state.anti_join(join).map(|(child, parent)| {
            child
                .rows
                .iter()
                .map(|row| orphaned(row, join, parent))
                .collect::<Vec<_>>()
        });
        let result = result.and_then(|doomed| {
            let child = state.table_mut(&join.child)?;
            let mut flags = doomed.iter();
            child.rows.retain(|_| !flags.next().copied().unwrap_or(false));
            Ok(doomed.iter().filter(|d| **d).count() as u64)
        });
        done(
            result.intent(|| format!("delete orphaned rows of {}", join.child)),
        )
    }

    fn duplicate_keys<'a>(
        &'a self,
        table: &'a str,
        key: &'a [String],
    ) -> BoxFuture<'a, Result<Vec<Vec<Value>>>> {
        let state = self.lock();
        let result = state.table(table).map(|t| {
            let mut groups: BTreeMap<Vec<Value>, usize> = BTreeMap::new();
            for row in &t.rows {
                let values = key
                    .iter()
                    .map(|c| row.get(c).cloned().unwrap_or(Value::Null))
                    .collect();
                *groups.entry(values).or_default() += 1;
            }
            groups
                .into_iter()
                .filter(|(_, n)| *n > 1)
                .map(|(values, _)| values)
                .collect()
        });
        done(result.intent(|| {
            format!("find duplicate ({}) groups in {table}", key.join(", "))
        }))
    }

    fn begin(&self) -> BoxFuture<'_, Result<()>> {
        let mut state = self.lock();
        let result = if state.snapshot.is_some() {
            Err(fail("a transaction is already in progress"))
        } else {
            state.snapshot = Some(state.tables.clone());
            Ok(())
        };
        done(result.intent(|| "begin a transaction".to_string()))
    }

    fn commit(&self) -> BoxFuture<'_, Result<()>> {
        let mut state = self.lock();
        let result = match state.snapshot.take() {
            Some(_) => Ok(()),
            None => Err(fail("no transaction in progress")),
        };
        done(result.intent(|| "commit a transaction".to_string()))
    }

    fn rollback(&self) -> BoxFuture<'_, Result<()>> {
        let mut state = self.lock();
        let result = match state.snapshot.take() {
            Some(tables) => {
                state.tables = tables;
                Ok(())
            }
            None => Err(fail("no transaction in progress")),
        };
        done(
            result.intent(|| "roll back a transaction".to_string()),
        )
    }

    fn convert_table<'a>(
        &'a self,
        table: &'a str,
        target: &'a CollationTarget,
    ) -> BoxFuture<'a, Result<()>> {
        let mut state = self.lock();
        let result = state.table_mut(table).map(|t| {
            t.collation = Some(target.collation.clone());
            for column in t.columns.iter_mut().filter(|c| c.is_string()) {
                column.collation = Some(target.collation.clone());
            }
        });
        done(
            result.intent(|| format!("convert {table} to {target}")),
        )
    }

    fn alter_column<'a>(
        &'a self,
        table: &'a str,
        column: &'a str,
        ty: &'a StringType,
        target: &'a CollationTarget,
    ) -> BoxFuture<'a, Result<()>> {
        let mut state = self.lock();
        let result = state.table_mut(table).and_then(|t| {
            let info = t
                .columns
                .iter_mut()
                .find(|c| c.name == column)
                .ok_or_else(|| fail(format!("column \"{column}\" of \"{table}\" does not exist")))?;
            info.column_type = ColumnType::String(ty.clone());
            info.collation = Some(target.collation.clone());
            Ok(())
        });
        done(result.intent(|| {
            format!("change collation of {table}.{column} to {}", target.collation)
        }))
    }
}
