//! The concrete upgrade units.
//!
//! Each one is a thin wrapper binding an algorithm to the tables it cleans.

use tracing::warn;

use crate::catalog::{Assignment, BoxFuture, Database, Filter};
use crate::collation::CollationNormalizer;
use crate::duplicate::{DuplicateCollapser, DuplicateKey};
use crate::orphan::{OrphanFinder, RelationDescriptor};
use crate::unit::{DATABASE_UPDATED, Outcome, Progress, UnitDef, UpgradeUnit};
use crate::{Config, Error, Result, Value};

const BACKUP_WARNING: &str = "Warning: Only do this if you have created a backup and put all \
                              extensions back into operation after an upgrade.";

/// Removes child rows whose parent is gone.
pub struct OrphanedRowsUnit {
    id: &'static str,
    title: &'static str,
    description: &'static str,
    finder: OrphanFinder,
}

impl OrphanedRowsUnit {
    pub fn new(
        id: &'static str,
        title: &'static str,
        description: &'static str,
        relations: Vec<RelationDescriptor>,
    ) -> Self {
        Self {
            id,
            title,
            description,
            finder: OrphanFinder::new(relations),
        }
    }

    pub fn finder(&self) -> &OrphanFinder {
        &self.finder
    }

    pub fn sys_file_metadata() -> Self {
        Self::new(
            "removeOrphanedSysFileMetadatas",
            "Removes orphaned sys_file_metadata records",
            "Removes orphaned sys_file_metadata records from the database",
            vec![RelationDescriptor::fixed("sys_file_metadata", "file", "sys_file", "uid")],
        )
    }

    pub fn sys_file_reference() -> Self {
        Self::new(
            "removeOrphanedSysFileReferences",
            "Removes orphaned sys_file_references records",
            BACKUP_WARNING,
            vec![
                RelationDescriptor::fixed("sys_file_reference", "uid_local", "sys_file", "uid"),
                RelationDescriptor::polymorphic("sys_file_reference", "uid_foreign", "tablenames", "uid"),
            ],
        )
    }

    pub fn sys_category_record_mm() -> Self {
        Self::new(
            "removeOrphanedSysCategoryMMRecords",
            "Remove orphaned sys_category_record_mm records",
            BACKUP_WARNING,
            vec![
                RelationDescriptor::fixed("sys_category_record_mm", "uid_local", "sys_category", "uid"),
                RelationDescriptor::polymorphic(
                    "sys_category_record_mm",
                    "uid_foreign",
                    "tablenames",
                    "uid",
                )
                .with_field_column("fieldname"),
            ],
        )
    }
}

impl UpgradeUnit for OrphanedRowsUnit {
    fn id(&self) -> &'static str {
        self.id
    }

    fn title(&self) -> &'static str {
        self.title
    }

    fn description(&self) -> &'static str {
        self.description
    }

    fn necessary<'a>(&'a self, db: &'a dyn Database) -> BoxFuture<'a, Result<bool>> {
        Box::pin(self.finder.necessary(db))
    }

    fn apply<'a>(
        &'a self,
        db: &'a dyn Database,
        progress: &'a dyn Progress,
    ) -> BoxFuture<'a, Result<Outcome>> {
        Box::pin(async move {
            let removed = self.finder.apply(db).await?;
            progress.report(&format!("Removed {removed} records."));
            Ok(match removed {
                0 => Outcome::Skipped,
                n => Outcome::Applied { affected: Some(n) },
            })
        })
    }
}

/// Collapses rows sharing a key that should be unique.
pub struct DuplicateRowsUnit {
    id: &'static str,
    title: &'static str,
    collapser: DuplicateCollapser,
}

impl DuplicateRowsUnit {
    pub fn new(id: &'static str, title: &'static str, collapser: DuplicateCollapser) -> Self {
        Self {
            id,
            title,
            collapser,
        }
    }

    pub fn collapser(&self) -> &DuplicateCollapser {
        &self.collapser
    }

    fn keyed(
        id: &'static str,
        title: &'static str,
        table: &str,
        key: &[&str],
    ) -> Result<Self> {
        let key = DuplicateKey::new(key.iter().copied())?;
        Ok(Self::new(id, title, DuplicateCollapser::new(table, key)))
    }

    pub fn sys_category_record_mm() -> Result<Self> {
        Self::keyed(
            "removeDuplicateSysCategoryRecordMms",
            "Removes duplicate sys_category_record_mm records from the database",
            "sys_category_record_mm",
            &["uid_local", "uid_foreign", "tablenames", "fieldname"],
        )
    }

    /// Only does anything while the maps extension's table exists.
    pub fn gomapsext_map_address_mm() -> Result<Self> {
        Self::keyed(
            "removeDuplicateGomapsextMapAddressMms",
            "Removes duplicate tx_gomapsext_map_address_mm records from the database",
            "tx_gomapsext_map_address_mm",
            &["uid_local", "uid_foreign"],
        )
    }
}

impl UpgradeUnit for DuplicateRowsUnit {
    fn id(&self) -> &'static str {
        self.id
    }

    fn title(&self) -> &'static str {
        self.title
    }

    fn description(&self) -> &'static str {
        ""
    }

    fn necessary<'a>(&'a self, db: &'a dyn Database) -> BoxFuture<'a, Result<bool>> {
        Box::pin(self.collapser.necessary(db))
    }

    fn apply<'a>(
        &'a self,
        db: &'a dyn Database,
        progress: &'a dyn Progress,
    ) -> BoxFuture<'a, Result<Outcome>> {
        Box::pin(async move {
            let groups = self.collapser.apply(db).await?;
            if groups == 0 {
                return Ok(Outcome::Skipped);
            }
            progress.report(&format!(
                "Collapsed {groups} duplicate groups in {}.",
                self.collapser.table()
            ));
            Ok(Outcome::Applied {
                affected: Some(groups),
            })
        })
    }
}

/// Brings tables and string columns to the configured collation.
///
/// Does nothing unless a target was configured explicitly; the built-in
/// default is not a reason to rewrite a database.
pub struct CollationUnit {
    normalizer: Option<CollationNormalizer>,
}

impl CollationUnit {
    pub const ID: &'static str = "changeCollationUpdate";

    pub fn new(config: &Config) -> Self {
        Self {
            normalizer: config.collation.clone().map(CollationNormalizer::new),
        }
    }
}

impl UpgradeUnit for CollationUnit {
    fn id(&self) -> &'static str {
        Self::ID
    }

    fn title(&self) -> &'static str {
        "Change database collation to match the configured collation"
    }

    fn description(&self) -> &'static str {
        "This update will change the collation of all tables and fields to match the configured \
         charset and collation."
    }

    fn prerequisites(&self) -> &'static [&'static str] {
        &[DATABASE_UPDATED]
    }

    fn necessary<'a>(&'a self, db: &'a dyn Database) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move {
            match &self.normalizer {
                Some(normalizer) => normalizer.necessary(db).await,
                None => Ok(false),
            }
        })
    }

    fn apply<'a>(
        &'a self,
        db: &'a dyn Database,
        progress: &'a dyn Progress,
    ) -> BoxFuture<'a, Result<Outcome>> {
        Box::pin(async move {
            let Some(normalizer) = &self.normalizer else {
                return Ok(Outcome::Skipped);
            };
            let report = normalizer.apply(db).await?;
            progress.report(&format!(
                "Converted {} tables and {} columns to {}.",
                report.tables,
                report.columns,
                normalizer.target()
            ));
            Ok(Outcome::Applied { affected: None })
        })
    }
}

/// Whether `table` exists with every one of `columns`.
async fn has_columns(db: &dyn Database, table: &str, columns: &[&str]) -> Result<bool> {
    for column in columns {
        if !db.column_exists(table, column).await? {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Fills `sys_language.language_isocode` from the static language record
/// the row points at.
///
/// Only runs while `static_languages` is installed.
pub struct LanguageIsoCodeUnit;

impl LanguageIsoCodeUnit {
    pub const ID: &'static str = "languageIsoCode";

    /// `(uid, iso code)` for every language row that can be filled in.
    async fn pending(&self, db: &dyn Database) -> Result<Vec<(Value, String)>> {
        if !has_columns(db, "sys_language", &["uid", "language_isocode", "static_lang_isocode"])
            .await?
            || !has_columns(db, "static_languages", &["uid", "lg_iso_2"]).await?
        {
            return Ok(Vec::new());
        }

        let unset = Filter::all().eq("language_isocode", "");
        let mut pending = Vec::new();
        for language in db.select_rows("sys_language", &unset).await? {
            let Some(uid) = language.get("uid").filter(|v| !v.is_null()) else {
                continue;
            };
            let Some(static_uid) = language.get("static_lang_isocode").and_then(Value::as_int)
            else {
                continue;
            };
            let records = db
                .select_rows("static_languages", &Filter::all().eq("uid", static_uid))
                .await?;
            let iso = records
                .first()
                .and_then(|record| record.get("lg_iso_2"))
                .and_then(Value::as_text)
                .filter(|iso| !iso.is_empty());
            if let Some(iso) = iso {
                pending.push((uid.clone(), iso.to_lowercase()));
            }
        }
        Ok(pending)
    }
}

impl UpgradeUnit for LanguageIsoCodeUnit {
    fn id(&self) -> &'static str {
        Self::ID
    }

    fn title(&self) -> &'static str {
        "Update sys_language records to use new ISO 639-1 letter-code field"
    }

    fn description(&self) -> &'static str {
        "The sys_language records have a new iso code field which removes the dependency of the \
         TYPO3 CMS Core to the extension \"static_info_tables\". This upgrade wizard migrates the \
         data of the existing \"static_lang_isocode\" field to the new DB field."
    }

    fn prerequisites(&self) -> &'static [&'static str] {
        &[DATABASE_UPDATED]
    }

    fn necessary<'a>(&'a self, db: &'a dyn Database) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move { Ok(!self.pending(db).await?.is_empty()) })
    }

    fn apply<'a>(
        &'a self,
        db: &'a dyn Database,
        progress: &'a dyn Progress,
    ) -> BoxFuture<'a, Result<Outcome>> {
        Box::pin(async move {
            let mut updated = 0;
            for (uid, iso) in self.pending(db).await? {
                let assignment = [("language_isocode".to_string(), Assignment::value(iso))];
                updated += db
                    .update("sys_language", &Filter::all().eq("uid", uid), &assignment)
                    .await?;
            }
            if updated == 0 {
                return Ok(Outcome::Skipped);
            }
            progress.report(&format!("Updated {updated} sys_language records."));
            Ok(Outcome::Applied {
                affected: Some(updated),
            })
        })
    }
}

/// Moves the file references of textmedia content elements from the
/// `media` field to `assets`, along with the reference counter.
pub struct TextMediaAssetsUnit;

impl TextMediaAssetsUnit {
    pub const ID: &'static str = "migrateMediaToAssetsForTextMediaCe";

    /// Textmedia content uids whose `media` counter is still positive.
    async fn pending(&self, db: &dyn Database) -> Result<Vec<Value>> {
        if !has_columns(db, "tt_content", &["uid", "CType", "media", "assets"]).await?
            || !has_columns(db, "sys_file_reference", &["uid_foreign", "tablenames", "fieldname"])
                .await?
        {
            return Ok(Vec::new());
        }

        let columns = ["uid".to_string(), "media".to_string()];
        let textmedia = Filter::all().eq("CType", "textmedia");
        let rows = db.select_distinct("tt_content", &columns, &textmedia).await?;
        Ok(rows
            .into_iter()
            .filter(|row| row.get(1).and_then(Value::as_int).is_some_and(|n| n > 0))
            .filter_map(|row| row.into_iter().next())
            .collect())
    }

    /// Move one element's references and counter. Returns the number of
    /// references moved.
    async fn migrate(&self, db: &dyn Database, uid: &Value) -> Result<u64> {
        let references = Filter::all()
            .eq("tablenames", "tt_content")
            .eq("uid_foreign", uid.clone())
            .eq("fieldname", "media");
        let moved = db
            .update(
                "sys_file_reference",
                &references,
                &[("fieldname".to_string(), Assignment::value("assets"))],
            )
            .await?;

        let counters = [
            ("assets".to_string(), Assignment::column("media")),
            ("media".to_string(), Assignment::value(0)),
        ];
        db.update("tt_content", &Filter::all().eq("uid", uid.clone()), &counters)
            .await?;
        Ok(moved)
    }
}

impl UpgradeUnit for TextMediaAssetsUnit {
    fn id(&self) -> &'static str {
        Self::ID
    }

    fn title(&self) -> &'static str {
        "Migrate CTypes textmedia database field \"media\" to \"assets\""
    }

    fn description(&self) -> &'static str {
        "The extension \"fluid_styled_content\" is using a new database field for mediafile \
         references. This update wizard migrates these old references to use the new database field."
    }

    fn prerequisites(&self) -> &'static [&'static str] {
        &[DATABASE_UPDATED]
    }

    fn necessary<'a>(&'a self, db: &'a dyn Database) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move { Ok(!self.pending(db).await?.is_empty()) })
    }

    /// Each content element moves in its own transaction, so its references
    /// and counter never disagree.
    fn apply<'a>(
        &'a self,
        db: &'a dyn Database,
        progress: &'a dyn Progress,
    ) -> BoxFuture<'a, Result<Outcome>> {
        Box::pin(async move {
            let pending = self.pending(db).await?;
            if pending.is_empty() {
                return Ok(Outcome::Skipped);
            }

            let mut moved = 0;
            for uid in &pending {
                db.begin().await?;
                match self.migrate(db, uid).await {
                    Ok(n) => {
                        db.commit().await?;
                        moved += n;
                    }
                    Err(e) => {
                        if let Err(rollback) = db.rollback().await {
                            warn!(%uid, error = %rollback, "rollback failed");
                        }
                        return Err(e);
                    }
                }
            }
            progress.report(&format!(
                "Moved {moved} file references of {} content elements to assets.",
                pending.len()
            ));
            Ok(Outcome::Applied {
                affected: Some(pending.len() as u64),
            })
        })
    }
}

/// Stands in for a unit whose construction failed, so the failure shows up
/// when the unit runs rather than when the registry is read.
struct Broken {
    id: &'static str,
    reason: String,
}

impl UpgradeUnit for Broken {
    fn id(&self) -> &'static str {
        self.id
    }

    fn title(&self) -> &'static str {
        self.id
    }

    fn description(&self) -> &'static str {
        ""
    }

    fn necessary<'a>(&'a self, _db: &'a dyn Database) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move { Err(Error::Config(self.reason.clone())) })
    }

    fn apply<'a>(
        &'a self,
        _db: &'a dyn Database,
        _progress: &'a dyn Progress,
    ) -> BoxFuture<'a, Result<Outcome>> {
        Box::pin(async move { Err(Error::Config(self.reason.clone())) })
    }
}

fn boxed<U: UpgradeUnit + 'static>(id: &'static str, unit: Result<U>) -> Box<dyn UpgradeUnit> {
    match unit {
        Ok(unit) => Box::new(unit),
        Err(e) => Box::new(Broken {
            id,
            reason: e.to_string(),
        }),
    }
}

inventory::submit!(UnitDef {
    id: "removeOrphanedSysFileMetadatas",
    build: |_| Box::new(OrphanedRowsUnit::sys_file_metadata()),
});

inventory::submit!(UnitDef {
    id: "removeOrphanedSysFileReferences",
    build: |_| Box::new(OrphanedRowsUnit::sys_file_reference()),
});

inventory::submit!(UnitDef {
    id: "removeOrphanedSysCategoryMMRecords",
    build: |_| Box::new(OrphanedRowsUnit::sys_category_record_mm()),
});

inventory::submit!(UnitDef {
    id: "removeDuplicateSysCategoryRecordMms",
    build: |_| {
        boxed(
            "removeDuplicateSysCategoryRecordMms",
            DuplicateRowsUnit::sys_category_record_mm(),
        )
    },
});

inventory::submit!(UnitDef {
    id: "removeDuplicateGomapsextMapAddressMms",
    build: |_| {
        boxed(
            "removeDuplicateGomapsextMapAddressMms",
            DuplicateRowsUnit::gomapsext_map_address_mm(),
        )
    },
});

inventory::submit!(UnitDef {
    id: LanguageIsoCodeUnit::ID,
    build: |_| Box::new(LanguageIsoCodeUnit),
});

inventory::submit!(UnitDef {
    id: TextMediaAssetsUnit::ID,
    build: |_| Box::new(TextMediaAssetsUnit),
});

inventory::submit!(UnitDef {
    id: CollationUnit::ID,
    build: |config| Box::new(CollationUnit::new(config)),
});
