//! Idempotent data-reconciliation units for relational databases.
//!
//! An upgrade unit looks for one kind of inconsistency left behind by
//! schema changes or uninstalled extensions, and fixes it:
//!
//! - [`OrphanFinder`] removes child rows whose parent is gone, including
//!   rows whose parent table is named by data in the row itself;
//! - [`DuplicateCollapser`] collapses rows sharing a key the schema does not
//!   enforce down to one;
//! - [`CollationNormalizer`] brings every table and string column to one
//!   collation.
//!
//! Units work against [`Database`], implemented for Postgres by
//! [`PgDatabase`] and in memory by [`MemoryDatabase`]. The schema is never
//! cached: every check goes back to the catalog, so units tolerate tables
//! and columns that vanished between versions.
//!
//! ```ignore
//! let config = upkeep::Config::from_env()?;
//! let db = upkeep::PgDatabase::new(client);
//! let runner = upkeep::Runner::new(upkeep::unit::build_all(&config));
//! let plan = runner.plan::<&str>(&[])?;
//! let records = runner
//!     .run(&db, &plan, &upkeep::AlwaysConfirm, &upkeep::TracingProgress)
//!     .await;
//! ```

pub mod catalog;
pub mod collation;
mod config;
pub mod duplicate;
mod error;
mod memory;
pub mod orphan;
mod pg;
mod row;
pub mod runner;
mod traced;
pub mod unit;
pub mod units;
mod value;

pub use catalog::{
    AntiJoin, Assignment, CollationTarget, ColumnInfo, ColumnType, Database, Filter, Introspector,
    StringKind, StringType,
};
pub use collation::{CollationNormalizer, CollationReport};
pub use config::{Config, mask_password};
pub use duplicate::{DuplicateCollapser, DuplicateKey};
pub use error::{BackendError, Error, QueryContext};
pub use memory::MemoryDatabase;
pub use orphan::{OrphanFinder, OrphanReport, Parent, RelationDescriptor};
pub use pg::PgDatabase;
pub use row::{Row, SqlParam, row};
pub use runner::{AlwaysConfirm, Confirm, RunRecord, Runner, Status};
pub use traced::{Connection, ConnectionExt, TracedConn};
pub use unit::{DATABASE_UPDATED, Outcome, Progress, TracingProgress, UnitDef, UpgradeUnit};
pub use value::Value;

// Re-exported so downstream crates can register units.
pub use inventory;

pub type Result<T> = std::result::Result<T, Error>;
