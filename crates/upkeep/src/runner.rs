//! Running units one after another.
//!
//! [`Runner::plan`] picks units by id, pulls in the units they depend on,
//! and orders the result so every prerequisite comes first.
//! [`Runner::run`] then checks, confirms and applies each unit in turn.

use std::collections::BTreeSet;
use std::fmt;

use tracing::{debug, info, warn};

use crate::catalog::Database;
use crate::unit::{Outcome, Progress, UpgradeUnit};
use crate::{Error, Result};

/// Asked before each necessary unit is applied.
pub trait Confirm: Send + Sync {
    fn confirm(&self, unit: &dyn UpgradeUnit) -> bool;
}

impl<F: Fn(&dyn UpgradeUnit) -> bool + Send + Sync> Confirm for F {
    fn confirm(&self, unit: &dyn UpgradeUnit) -> bool {
        self(unit)
    }
}

/// Says yes to everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysConfirm;

impl Confirm for AlwaysConfirm {
    fn confirm(&self, _unit: &dyn UpgradeUnit) -> bool {
        true
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Status {
    NotNecessary,
    Declined,
    Applied(Outcome),
    Failed(String),
    /// Not attempted: an earlier unit failed, or a prerequisite was declined.
    Blocked,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::NotNecessary => write!(f, "no action needed"),
            Status::Declined => write!(f, "declined"),
            Status::Applied(Outcome::Applied {
                affected: Some(n),
            }) => write!(f, "applied ({n} rows)"),
            Status::Applied(Outcome::Applied { affected: None }) => write!(f, "applied"),
            Status::Applied(Outcome::Skipped) => write!(f, "nothing left to do"),
            Status::Failed(reason) => write!(f, "failed: {reason}"),
            Status::Blocked => write!(f, "blocked"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRecord {
    pub id: &'static str,
    pub status: Status,
}

/// Owns the available units and the prerequisites satisfied outside the run.
pub struct Runner {
    units: Vec<Box<dyn UpgradeUnit>>,
    satisfied: BTreeSet<String>,
}

impl Runner {
    pub fn new(units: Vec<Box<dyn UpgradeUnit>>) -> Self {
        Self {
            units,
            satisfied: BTreeSet::new(),
        }
    }

    /// Declare a prerequisite (such as [`DATABASE_UPDATED`]) as already met.
    ///
    /// [`DATABASE_UPDATED`]: crate::unit::DATABASE_UPDATED
    pub fn assume_satisfied(mut self, id: impl Into<String>) -> Self {
        self.satisfied.insert(id.into());
        self
    }

    pub fn units(&self) -> impl Iterator<Item = &dyn UpgradeUnit> {
        self.units.iter().map(|u| u.as_ref())
    }

    fn find(&self, id: &str) -> Option<&dyn UpgradeUnit> {
        self.units().find(|u| u.id() == id)
    }

    /// The first prerequisite of `unit` that no unit provides and that was
    /// not declared satisfied.
    pub fn unmet_prerequisite(&self, unit: &dyn UpgradeUnit) -> Option<&'static str> {
        unit.prerequisites()
            .iter()
            .copied()
            .find(|p| self.find(p).is_none() && !self.satisfied.contains(*p))
    }

    /// Select units by id (all of them when `ids` is empty) and order them so
    /// prerequisites run first. Otherwise the runner's own order is kept.
    pub fn plan<S: AsRef<str>>(&self, ids: &[S]) -> Result<Vec<&dyn UpgradeUnit>> {
        let mut wanted: BTreeSet<&'static str> = BTreeSet::new();
        let mut queue: Vec<&dyn UpgradeUnit> = if ids.is_empty() {
            self.units().collect()
        } else {
            ids.iter()
                .map(|id| {
                    self.find(id.as_ref())
                        .ok_or_else(|| Error::UnknownUnit(id.as_ref().to_string()))
                })
                .collect::<Result<_>>()?
        };

        while let Some(unit) = queue.pop() {
            if !wanted.insert(unit.id()) {
                continue;
            }
            if let Some(missing) = self.unmet_prerequisite(unit) {
                return Err(Error::PreconditionUnmet {
                    unit: unit.id().to_string(),
                    missing: missing.to_string(),
                });
            }
            queue.extend(unit.prerequisites().iter().filter_map(|p| self.find(p)));
        }

        let selected: Vec<&dyn UpgradeUnit> =
            self.units().filter(|u| wanted.contains(u.id())).collect();
        let mut ordered: Vec<&dyn UpgradeUnit> = Vec::with_capacity(selected.len());
        let mut scheduled: BTreeSet<&'static str> = BTreeSet::new();

        while ordered.len() < selected.len() {
            let mut made_progress = false;
            for unit in &selected {
                if scheduled.contains(unit.id()) {
                    continue;
                }
                let ready = unit
                    .prerequisites()
                    .iter()
                    .all(|p| self.satisfied.contains(*p) || scheduled.contains(p));
                if ready {
                    scheduled.insert(unit.id());
                    ordered.push(*unit);
                    made_progress = true;
                }
            }
            if !made_progress {
                let stuck: Vec<&str> = selected
                    .iter()
                    .map(|u| u.id())
                    .filter(|id| !scheduled.contains(id))
                    .collect();
                return Err(Error::PrerequisiteCycle(stuck.join(", ")));
            }
        }

        Ok(ordered)
    }

    /// Check and apply each planned unit in order.
    ///
    /// A failing unit stops the run; every unit after it is recorded as
    /// [`Status::Blocked`].
    pub async fn run(
        &self,
        db: &dyn Database,
        plan: &[&dyn UpgradeUnit],
        confirm: &dyn Confirm,
        progress: &dyn Progress,
    ) -> Vec<RunRecord> {
        let mut records = Vec::with_capacity(plan.len());
        let mut done: BTreeSet<&str> = self.satisfied.iter().map(String::as_str).collect();
        let mut failed = false;

        for unit in plan {
            let id = unit.id();
            let status = if failed {
                Status::Blocked
            } else if let Some(p) = unit.prerequisites().iter().find(|p| !done.contains(**p)) {
                debug!(unit = id, prerequisite = *p, "prerequisite not met, skipping");
                Status::Blocked
            } else {
                self.run_one(db, *unit, confirm, progress).await
            };

            match &status {
                Status::NotNecessary | Status::Applied(_) => {
                    done.insert(id);
                }
                Status::Failed(reason) => {
                    warn!(unit = id, %reason, "unit failed, stopping");
                    failed = true;
                }
                Status::Declined | Status::Blocked => {}
            }
            records.push(RunRecord { id, status });
        }
        records
    }

    async fn run_one(
        &self,
        db: &dyn Database,
        unit: &dyn UpgradeUnit,
        confirm: &dyn Confirm,
        progress: &dyn Progress,
    ) -> Status {
        let id = unit.id();
        match unit.necessary(db).await {
            Ok(false) => {
                debug!(unit = id, "no action needed");
                return Status::NotNecessary;
            }
            Ok(true) => {}
            Err(e) => return Status::Failed(e.to_string()),
        }
        if !confirm.confirm(unit) {
            info!(unit = id, "declined");
            return Status::Declined;
        }
        info!(unit = id, title = unit.title(), "applying");
        match unit.apply(db, progress).await {
            Ok(outcome) => Status::Applied(outcome),
            Err(e) => Status::Failed(e.to_string()),
        }
    }
}
