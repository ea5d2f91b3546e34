//! Collapsing rows that share a key the schema does not enforce.
//!
//! Rows in a duplicate group are indistinguishable by key, so there is no
//! handle for "delete all but this one". Each group is instead deleted as a
//! whole and the survivor (the first row in storage order) inserted back,
//! inside a transaction.

use tracing::{debug, info, warn};

use crate::catalog::{Database, Filter};
use crate::{Error, Result, Value};

/// The columns that should be unique together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplicateKey {
    columns: Vec<String>,
}

impl DuplicateKey {
    pub fn new<I, S>(columns: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let columns: Vec<String> = columns.into_iter().map(Into::into).collect();
        if columns.is_empty() {
            return Err(Error::Config("a duplicate key needs at least one column".into()));
        }
        Ok(Self { columns })
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }
}

/// Collapses duplicate groups of one table.
#[derive(Debug, Clone)]
pub struct DuplicateCollapser {
    table: String,
    key: DuplicateKey,
}

impl DuplicateCollapser {
    pub fn new(table: impl Into<String>, key: DuplicateKey) -> Self {
        Self {
            table: table.into(),
            key,
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Key values held by more than one row, in key order.
    ///
    /// Empty when the table or one of the key columns does not exist.
    pub async fn groups(&self, db: &dyn Database) -> Result<Vec<Vec<Value>>> {
        if !db.table_exists(&self.table).await? {
            debug!(table = %self.table, "table absent, no duplicates");
            return Ok(Vec::new());
        }
        for column in self.key.columns() {
            if !db.column_exists(&self.table, column).await? {
                debug!(table = %self.table, %column, "key column absent, no duplicates");
                return Ok(Vec::new());
            }
        }
        db.duplicate_keys(&self.table, self.key.columns()).await
    }

    pub async fn necessary(&self, db: &dyn Database) -> Result<bool> {
        Ok(!self.groups(db).await?.is_empty())
    }

    /// Collapse every group, returning how many were collapsed.
    pub async fn apply(&self, db: &dyn Database) -> Result<u64> {
        let mut collapsed = 0;
        for values in self.groups(db).await? {
            let filter = Filter::from_key(self.key.columns(), &values);
            db.begin().await?;
            match self.replace_group(db, &filter).await {
                Ok(removed) => {
                    db.commit().await?;
                    if removed > 0 {
                        debug!(table = %self.table, key = %filter, removed, "collapsed group");
                        collapsed += 1;
                    }
                }
                Err(e) => {
                    if let Err(rollback) = db.rollback().await {
                        warn!(table = %self.table, key = %filter, error = %rollback, "rollback failed");
                    }
                    return Err(e);
                }
            }
        }
        if collapsed > 0 {
            info!(table = %self.table, groups = collapsed, "collapsed duplicate groups");
        }
        Ok(collapsed)
    }

    /// Replace the rows matching `filter` with the first of them. Returns the
    /// number of extra rows removed.
    async fn replace_group(&self, db: &dyn Database, filter: &Filter) -> Result<u64> {
        let mut rows = db.select_rows(&self.table, filter).await?;
        if rows.len() < 2 {
            return Ok(0);
        }
        let survivor = rows.swap_remove(0);
        let deleted = db.delete(&self.table, filter).await?;
        db.insert(&self.table, &survivor)
            .await
            .map_err(|e| match e {
                Error::Query { source, .. } => Error::PartialWrite {
                    table: self.table.clone(),
                    key: filter.to_string(),
                    source,
                },
                other => other,
            })?;
        Ok(deleted.saturating_sub(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MemoryDatabase, row};
    use proptest::prelude::*;
    use std::collections::BTreeMap;

    const MM: &str = "sys_category_record_mm";

    fn mm_table() -> MemoryDatabase {
        let db = MemoryDatabase::new();
        db.create_table(
            MM,
            None,
            &[
                ("uid_local", "integer"),
                ("uid_foreign", "integer"),
                ("tablenames", "varchar(255)"),
                ("fieldname", "varchar(255)"),
                ("sorting", "integer"),
            ],
        );
        db
    }

    fn collapser() -> DuplicateCollapser {
        let key = DuplicateKey::new(["uid_local", "uid_foreign", "tablenames", "fieldname"]).unwrap();
        DuplicateCollapser::new(MM, key)
    }

    fn mm(local: i64, foreign: i64, sorting: i64) -> crate::Row {
        row([
            ("uid_local", Value::from(local)),
            ("uid_foreign", Value::from(foreign)),
            ("tablenames", Value::from("pages")),
            ("fieldname", Value::from("categories")),
            ("sorting", Value::from(sorting)),
        ])
    }

    #[test]
    fn empty_key_is_rejected() {
        assert!(matches!(
            DuplicateKey::new(Vec::<String>::new()),
            Err(Error::Config(_))
        ));
    }

    #[tokio::test]
    async fn three_copies_collapse_to_first() {
        let db = mm_table();
        db.seed(MM, [mm(5, 7, 3), mm(5, 7, 1), mm(5, 7, 2), mm(6, 7, 0)]);
        let c = collapser();

        assert!(c.necessary(&db).await.unwrap());
        assert_eq!(c.apply(&db).await.unwrap(), 1);

        let rows = db.rows(MM);
        assert_eq!(rows.len(), 2);
        let survivor = rows
            .iter()
            .find(|r| r["uid_local"] == Value::from(5))
            .unwrap();
        assert_eq!(survivor["sorting"], Value::from(3));

        assert!(!c.necessary(&db).await.unwrap());
        assert_eq!(c.apply(&db).await.unwrap(), 0);
        assert_eq!(db.rows(MM).len(), 2);
    }

    #[tokio::test]
    async fn null_key_values_form_a_group() {
        let db = mm_table();
        let mut a = mm(1, 2, 0);
        a.insert("fieldname".into(), Value::Null);
        let mut b = a.clone();
        b.insert("sorting".into(), Value::from(9));
        db.seed(MM, [a, b]);

        assert_eq!(collapser().apply(&db).await.unwrap(), 1);
        assert_eq!(db.rows(MM).len(), 1);
    }

    #[tokio::test]
    async fn absent_table_has_no_groups() {
        let db = MemoryDatabase::new();
        assert!(collapser().groups(&db).await.unwrap().is_empty());
        assert!(!collapser().necessary(&db).await.unwrap());
        assert_eq!(collapser().apply(&db).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn absent_key_column_has_no_groups() {
        let db = MemoryDatabase::new();
        db.create_table(MM, None, &[("uid_local", "integer"), ("uid_foreign", "integer")]);
        db.seed(MM, [mm(1, 1, 0), mm(1, 1, 0)]);
        assert!(!collapser().necessary(&db).await.unwrap());
    }

    #[tokio::test]
    async fn failed_reinsert_rolls_back() {
        let db = mm_table();
        db.seed(MM, [mm(5, 7, 1), mm(5, 7, 2)]);
        db.fail_inserts_into(MM);

        let err = collapser().apply(&db).await.unwrap_err();
        match &err {
            Error::PartialWrite { table, key, .. } => {
                assert_eq!(table, MM);
                assert!(key.contains("uid_local = 5"), "{key}");
            }
            other => panic!("expected PartialWrite, got {other:?}"),
        }
        assert!(!db.in_transaction());
        assert_eq!(db.rows(MM).len(), 2);
    }

    proptest! {
        #[test]
        fn every_key_survives_exactly_once(
            rows in prop::collection::vec((0i64..4, 0i64..4, 0i64..100), 0..40)
        ) {
            let db = mm_table();
            db.seed(MM, rows.iter().map(|&(l, f, s)| mm(l, f, s)));

            let mut first: BTreeMap<(i64, i64), i64> = BTreeMap::new();
            for &(l, f, s) in &rows {
                first.entry((l, f)).or_insert(s);
            }

            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            rt.block_on(collapser().apply(&db)).unwrap();

            let after = db.rows(MM);
            prop_assert_eq!(after.len(), first.len());
            for r in &after {
                let key = match (&r["uid_local"], &r["uid_foreign"]) {
                    (Value::Int(l), Value::Int(f)) => (*l, *f),
                    other => panic!("unexpected key {other:?}"),
                };
                prop_assert_eq!(&r["sorting"], &Value::from(first[&key]));
            }
            prop_assert!(!rt.block_on(collapser().necessary(&db)).unwrap());
        }
    }
}
