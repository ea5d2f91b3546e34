//! Orphaned-row detection and removal.
//!
//! A child row is orphaned when its foreign key has no matching parent row.
//! The parent is either a fixed table, or it is named per row by a
//! discriminator column (`tablenames`, optionally narrowed by a `fieldname`
//! column). Polymorphic relations are resolved against the live schema one
//! distinct (table, field) pair at a time; when the named table or column no
//! longer exists, every child row pointing at it is orphaned.

use std::borrow::Cow;
use std::fmt;

use tracing::{debug, info};

use crate::catalog::{AntiJoin, Database, Filter};
use crate::{Result, Value};

/// Where a relation's parent rows live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Parent {
    Static {
        table: String,
    },
    /// The parent table is named by `table_column` on each child row. When
    /// `field_column` is set, the column it names must also exist on the
    /// parent table.
    Polymorphic {
        table_column: String,
        field_column: Option<String>,
    },
}

/// A foreign-key relation from a child table to its parent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationDescriptor {
    pub child: String,
    pub child_key: String,
    pub parent: Parent,
    pub parent_key: String,
    /// Restricts which child rows the relation covers.
    pub filter: Filter,
}

impl RelationDescriptor {
    pub fn fixed(
        child: impl Into<String>,
        child_key: impl Into<String>,
        parent: impl Into<String>,
        parent_key: impl Into<String>,
    ) -> Self {
        Self {
            child: child.into(),
            child_key: child_key.into(),
            parent: Parent::Static {
                table: parent.into(),
            },
            parent_key: parent_key.into(),
            filter: Filter::all(),
        }
    }

    pub fn polymorphic(
        child: impl Into<String>,
        child_key: impl Into<String>,
        table_column: impl Into<String>,
        parent_key: impl Into<String>,
    ) -> Self {
        Self {
            child: child.into(),
            child_key: child_key.into(),
            parent: Parent::Polymorphic {
                table_column: table_column.into(),
                field_column: None,
            },
            parent_key: parent_key.into(),
            filter: Filter::all(),
        }
    }

    /// Also require the column named by `column` to exist on the parent.
    /// Has no effect on a static relation.
    pub fn with_field_column(mut self, column: impl Into<String>) -> Self {
        if let Parent::Polymorphic { field_column, .. } = &mut self.parent {
            *field_column = Some(column.into());
        }
        self
    }

    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filter = filter;
        self
    }
}

/// What the live schema says about a resolved relation's parent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParentState {
    Present,
    TableMissing,
    ColumnMissing { column: String },
}

/// A relation with a concrete parent table, resolved against the schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualRelation {
    pub child: String,
    pub child_key: String,
    pub parent_table: String,
    pub parent_key: String,
    pub filter: Filter,
    pub state: ParentState,
}

impl VirtualRelation {
    pub fn anti_join(&self) -> AntiJoin {
        AntiJoin {
            child: self.child.clone(),
            child_key: self.child_key.clone(),
            parent: self.parent_table.clone(),
            parent_key: self.parent_key.clone(),
            filter: self.filter.clone(),
        }
    }

    /// Number of orphaned child rows.
    pub async fn count(&self, db: &dyn Database) -> Result<u64> {
        match self.state {
            ParentState::Present => db.count_orphans(&self.anti_join()).await,
            _ => db.count(&self.child, &self.filter).await,
        }
    }

    pub async fn any(&self, db: &dyn Database) -> Result<bool> {
        match self.state {
            ParentState::Present => db.has_orphans(&self.anti_join()).await,
            _ => Ok(db.count(&self.child, &self.filter).await? > 0),
        }
    }

    /// Delete the orphaned child rows in one statement.
    pub async fn remove(&self, db: &dyn Database) -> Result<u64> {
        match self.state {
            ParentState::Present => db.delete_orphans(&self.anti_join()).await,
            _ => db.delete(&self.child, &self.filter).await,
        }
    }
}

impl fmt::Display for VirtualRelation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{} -> {}.{}",
            self.child, self.child_key, self.parent_table, self.parent_key
        )?;
        if !self.filter.is_empty() {
            write!(f, " where {}", self.filter)?;
        }
        match &self.state {
            ParentState::Present => Ok(()),
            ParentState::TableMissing => write!(f, " (table missing)"),
            ParentState::ColumnMissing { column } => write!(f, " (column {column:?} missing)"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrphanCount {
    pub relation: VirtualRelation,
    pub orphans: u64,
}

/// Orphan counts per resolved relation, in processing order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrphanReport {
    pub relations: Vec<OrphanCount>,
}

impl OrphanReport {
    pub fn total(&self) -> u64 {
        self.relations.iter().map(|r| r.orphans).sum()
    }
}

/// Finds and removes orphaned rows across a set of relations.
#[derive(Debug, Clone)]
pub struct OrphanFinder {
    relations: Vec<RelationDescriptor>,
}

fn name_of(value: Option<&Value>) -> String {
    value
        .and_then(Value::as_text)
        .map(Cow::into_owned)
        .unwrap_or_default()
}

impl OrphanFinder {
    pub fn new(relations: Vec<RelationDescriptor>) -> Self {
        Self { relations }
    }

    /// Resolve every descriptor against the current schema.
    pub async fn resolve(&self, db: &dyn Database) -> Result<Vec<VirtualRelation>> {
        let mut resolved = Vec::new();
        for descriptor in &self.relations {
            resolved.extend(resolve(db, descriptor).await?);
        }
        Ok(resolved)
    }

    pub async fn scan(&self, db: &dyn Database) -> Result<OrphanReport> {
        let mut report = OrphanReport::default();
        for relation in self.resolve(db).await? {
            let orphans = relation.count(db).await?;
            debug!(%relation, orphans, "scanned relation");
            report.relations.push(OrphanCount { relation, orphans });
        }
        Ok(report)
    }

    /// True as soon as one orphan is found.
    pub async fn necessary(&self, db: &dyn Database) -> Result<bool> {
        for descriptor in &self.relations {
            for relation in resolve(db, descriptor).await? {
                if relation.any(db).await? {
                    debug!(%relation, "found orphaned rows");
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    /// Delete every orphan, returning how many rows were removed.
    ///
    /// Each descriptor is resolved only after the previous one was applied.
    pub async fn apply(&self, db: &dyn Database) -> Result<u64> {
        let mut removed = 0;
        for descriptor in &self.relations {
            for relation in resolve(db, descriptor).await? {
                let n = relation.remove(db).await?;
                if n > 0 {
                    info!(%relation, removed = n, "removed orphaned rows");
                }
                removed += n;
            }
        }
        Ok(removed)
    }
}

/// Resolve one descriptor into concrete relations.
///
/// An absent child table or child column means there is nothing to check.
async fn resolve(db: &dyn Database, d: &RelationDescriptor) -> Result<Vec<VirtualRelation>> {
    if !db.table_exists(&d.child).await? || !db.column_exists(&d.child, &d.child_key).await? {
        debug!(table = %d.child, column = %d.child_key, "child relation absent, skipping");
        return Ok(Vec::new());
    }

    let (table_column, field_column) = match &d.parent {
        Parent::Static { table } => {
            let relation = check_parent(db, d, table, None, d.filter.clone()).await?;
            return Ok(vec![relation]);
        }
        Parent::Polymorphic {
            table_column,
            field_column,
        } => (table_column, field_column),
    };

    let mut discriminators = vec![table_column.clone()];
    discriminators.extend(field_column.iter().cloned());
    for column in &discriminators {
        if !db.column_exists(&d.child, column).await? {
            debug!(table = %d.child, %column, "discriminator column absent, skipping");
            return Ok(Vec::new());
        }
    }

    let mut pairs = db
        .select_distinct(&d.child, &discriminators, &d.filter)
        .await?;
    pairs.sort_by_cached_key(|values| (name_of(values.first()), name_of(values.get(1))));

    let mut relations = Vec::new();
    for values in pairs {
        let table = name_of(values.first());
        // An empty table name marks a row that never referenced anything.
        if table.is_empty() {
            continue;
        }
        let field = field_column.as_ref().map(|_| name_of(values.get(1)));
        let filter = d
            .filter
            .clone()
            .and(&Filter::from_key(&discriminators, &values));
        relations.push(check_parent(db, d, &table, field.as_deref(), filter).await?);
    }
    Ok(relations)
}

async fn check_parent(
    db: &dyn Database,
    d: &RelationDescriptor,
    table: &str,
    field: Option<&str>,
    filter: Filter,
) -> Result<VirtualRelation> {
    let state = if !db.table_exists(table).await? {
        ParentState::TableMissing
    } else if let Some(column) = missing_column(db, table, field, &d.parent_key).await? {
        ParentState::ColumnMissing { column }
    } else {
        ParentState::Present
    };

    Ok(VirtualRelation {
        child: d.child.clone(),
        child_key: d.child_key.clone(),
        parent_table: table.to_string(),
        parent_key: d.parent_key.clone(),
        filter,
        state,
    })
}

/// The first of `field` and `key` that is absent from `table`.
async fn missing_column(
    db: &dyn Database,
    table: &str,
    field: Option<&str>,
    key: &str,
) -> Result<Option<String>> {
    if let Some(field) = field {
        if !db.column_exists(table, field).await? {
            return Ok(Some(field.to_string()));
        }
    }
    if !db.column_exists(table, key).await? {
        return Ok(Some(key.to_string()));
    }
    Ok(None)
}
