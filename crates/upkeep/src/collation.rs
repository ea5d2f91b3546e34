//! Bringing every table and string column to one collation.

use tracing::{debug, info};

use crate::catalog::{CollationTarget, ColumnInfo, Database};
use crate::{Error, Result};

/// What [`CollationNormalizer::apply`] changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CollationReport {
    /// Tables converted as a whole.
    pub tables: u64,
    /// Columns rewritten one at a time after their table was handled.
    pub columns: u64,
}

#[derive(Debug, Clone)]
pub struct CollationNormalizer {
    target: CollationTarget,
}

impl CollationNormalizer {
    pub fn new(target: CollationTarget) -> Self {
        Self { target }
    }

    pub fn target(&self) -> &CollationTarget {
        &self.target
    }

    fn table_differs(&self, collation: Option<&str>) -> bool {
        collation.is_some_and(|c| c != self.target.collation)
    }

    fn column_differs(&self, column: &ColumnInfo) -> bool {
        column.collation.as_deref() != Some(self.target.collation.as_str())
    }

    /// Fails with [`Error::Config`] when the server has no such collation.
    async fn check_target(&self, db: &dyn Database) -> Result<()> {
        if db.collation_exists(&self.target.collation).await? {
            return Ok(());
        }
        Err(Error::Config(format!(
            "collation {} does not exist on this database server",
            self.target.collation
        )))
    }

    pub async fn necessary(&self, db: &dyn Database) -> Result<bool> {
        self.check_target(db).await?;
        for table in db.tables().await? {
            let collation = db.table_collation(&table).await?;
            if self.table_differs(collation.as_deref()) {
                debug!(%table, ?collation, target = %self.target, "table collation differs");
                return Ok(true);
            }
            for column in db.string_columns(&table).await? {
                if self.column_differs(&column) {
                    debug!(%table, column = %column.name, collation = ?column.collation, "column collation differs");
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    /// Convert tables first, then whatever string columns still differ.
    ///
    /// Columns are read again after the table conversion, since converting
    /// a table resets its columns to the table default.
    pub async fn apply(&self, db: &dyn Database) -> Result<CollationReport> {
        self.check_target(db).await?;
        let mut report = CollationReport::default();
        for table in db.tables().await? {
            let collation = db.table_collation(&table).await?;
            if self.table_differs(collation.as_deref()) {
                db.convert_table(&table, &self.target).await?;
                info!(%table, target = %self.target, "converted table");
                report.tables += 1;
            }

            for column in db.string_columns(&table).await? {
                if !self.column_differs(&column) {
                    continue;
                }
                let Some(ty) = column.column_type.as_string() else {
                    continue;
                };
                db.alter_column(&table, &column.name, ty, &self.target).await?;
                info!(%table, column = %column.name, %ty, "rewrote column collation");
                report.columns += 1;
            }
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryDatabase;
    use crate::catalog::{ColumnType, Introspector};

    fn target() -> CollationTarget {
        CollationTarget::new("utf8mb4", "utf8mb4_general_ci")
    }

    fn legacy_db() -> MemoryDatabase {
        let db = MemoryDatabase::new();
        db.create_table(
            "tt_content",
            Some("latin1_swedish_ci"),
            &[
                ("uid", "int"),
                ("header", "varchar(255)"),
                ("bodytext", "mediumtext"),
                ("flag", "char(1)"),
            ],
        );
        db.create_table(
            "pages",
            Some("utf8mb4_general_ci"),
            &[("uid", "int"), ("title", "varchar(255)")],
        );
        db.set_column_collation("pages", "title", "utf8mb4_bin");
        db
    }

    #[tokio::test]
    async fn converts_table_and_columns() {
        let db = legacy_db();
        let normalizer = CollationNormalizer::new(target());
        assert!(normalizer.necessary(&db).await.unwrap());

        let report = normalizer.apply(&db).await.unwrap();
        assert_eq!(report, CollationReport { tables: 1, columns: 1 });

        for table in ["tt_content", "pages"] {
            assert_eq!(
                db.table_collation(table).await.unwrap().as_deref(),
                Some("utf8mb4_general_ci")
            );
            for column in db.string_columns(table).await.unwrap() {
                assert_eq!(column.collation.as_deref(), Some("utf8mb4_general_ci"));
            }
        }
        assert!(!normalizer.necessary(&db).await.unwrap());
        assert_eq!(normalizer.apply(&db).await.unwrap(), CollationReport::default());
    }

    #[tokio::test]
    async fn rewrite_keeps_declared_types() {
        let db = legacy_db();
        let before = db.columns("tt_content").await.unwrap();
        db.set_column_collation("tt_content", "header", "latin1_german1_ci");
        CollationNormalizer::new(target()).apply(&db).await.unwrap();
        let after = db.columns("tt_content").await.unwrap();

        let types = |cols: &[crate::catalog::ColumnInfo]| -> Vec<ColumnType> {
            cols.iter().map(|c| c.column_type.clone()).collect()
        };
        assert_eq!(types(&before), types(&after));
        assert_eq!(after[0].collation, None);
    }

    #[tokio::test]
    async fn table_without_collation_only_gets_columns() {
        let db = MemoryDatabase::new();
        db.create_table("sys_log", None, &[("details", "text")]);
        db.set_column_collation("sys_log", "details", "C");

        let report = CollationNormalizer::new(target()).apply(&db).await.unwrap();
        assert_eq!(report, CollationReport { tables: 0, columns: 1 });
        assert_eq!(db.table_collation("sys_log").await.unwrap(), None);
    }

    #[tokio::test]
    async fn unknown_collation_is_a_config_error() {
        let db = legacy_db();
        db.restrict_collations(&["C", "POSIX"]);
        let normalizer = CollationNormalizer::new(target());

        let err = normalizer.necessary(&db).await.unwrap_err();
        assert!(matches!(err, Error::Config(_)), "{err}");
        assert!(err.to_string().contains("utf8mb4_general_ci"), "{err}");

        assert!(matches!(normalizer.apply(&db).await, Err(Error::Config(_))));
        assert_eq!(
            db.table_collation("tt_content").await.unwrap().as_deref(),
            Some("latin1_swedish_ci")
        );
    }

    #[tokio::test]
    async fn empty_database_needs_nothing() {
        let db = MemoryDatabase::new();
        assert!(!CollationNormalizer::new(target()).necessary(&db).await.unwrap());
    }
}
