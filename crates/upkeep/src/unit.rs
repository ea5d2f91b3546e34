//! The upgrade unit contract and its registry.
//!
//! A unit checks for one inconsistency (`necessary`) and fixes it (`apply`).
//! Both must be safe to call repeatedly: `necessary` has no side effects,
//! and `apply` on an already-consistent database changes nothing.
//!
//! Units register themselves with `inventory::submit!` and are instantiated
//! per run from a [`Config`]:
//!
//! ```ignore
//! inventory::submit!(upkeep::UnitDef {
//!     id: "removeStaleThings",
//!     build: |_config| Box::new(RemoveStaleThings),
//! });
//! ```

use tracing::info;

use crate::catalog::{BoxFuture, Database};
use crate::{Config, Error, Result};

/// Prerequisite id meaning "the schema is at its current version".
///
/// No unit provides it; runners treat it as satisfied by whatever brought
/// the schema up to date before the run.
pub const DATABASE_UPDATED: &str = "database-updated";

/// What a successful `apply` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Changes were made. `affected` is a row count where one makes sense.
    Applied { affected: Option<u64> },
    /// There was nothing to do by the time `apply` ran.
    Skipped,
}

/// One-way, human-readable notes from a running unit.
pub trait Progress: Send + Sync {
    fn report(&self, line: &str);
}

/// Sends progress lines to `tracing` at info level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingProgress;

impl Progress for TracingProgress {
    fn report(&self, line: &str) {
        info!("{line}");
    }
}

impl<F: Fn(&str) + Send + Sync> Progress for F {
    fn report(&self, line: &str) {
        self(line)
    }
}

/// An idempotent check-and-fix procedure.
pub trait UpgradeUnit: Send + Sync {
    /// Stable identifier.
    fn id(&self) -> &'static str;

    fn title(&self) -> &'static str;

    fn description(&self) -> &'static str;

    /// Units (or [`DATABASE_UPDATED`]) that must have applied first.
    fn prerequisites(&self) -> &'static [&'static str] {
        &[]
    }

    /// Whether `apply` would change anything. Never writes.
    fn necessary<'a>(&'a self, db: &'a dyn Database) -> BoxFuture<'a, Result<bool>>;

    fn apply<'a>(
        &'a self,
        db: &'a dyn Database,
        progress: &'a dyn Progress,
    ) -> BoxFuture<'a, Result<Outcome>>;
}

/// A registered unit: its id and how to build it.
pub struct UnitDef {
    pub id: &'static str,
    pub build: fn(&Config) -> Box<dyn UpgradeUnit>,
}

inventory::collect!(UnitDef);

/// Every registered unit definition, sorted by id.
pub fn registered() -> Vec<&'static UnitDef> {
    let mut defs: Vec<_> = inventory::iter::<UnitDef>.into_iter().collect();
    defs.sort_by_key(|def| def.id);
    defs
}

/// Build every registered unit, in id order.
pub fn build_all(config: &Config) -> Vec<Box<dyn UpgradeUnit>> {
    registered()
        .into_iter()
        .map(|def| (def.build)(config))
        .collect()
}

/// Build one registered unit by id.
pub fn build(id: &str, config: &Config) -> Result<Box<dyn UpgradeUnit>> {
    inventory::iter::<UnitDef>
        .into_iter()
        .find(|def| def.id == id)
        .map(|def| (def.build)(config))
        .ok_or_else(|| Error::UnknownUnit(id.to_string()))
}
