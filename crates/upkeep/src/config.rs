//! Run configuration.

use std::fmt;

use crate::catalog::CollationTarget;
use crate::{Error, Result};

/// Settings shared by every unit in a run.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Config {
    /// Postgres connection URL.
    pub database_url: Option<String>,
    /// Collation to normalize to. `None` unless configured explicitly.
    pub collation: Option<CollationTarget>,
}

impl Config {
    /// Read `DATABASE_URL`, `UPKEEP_CHARSET` and `UPKEEP_COLLATION` from the
    /// process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    /// Like [`Config::from_env`], reading variables through `lookup`.
    ///
    /// The charset and collation go together: setting only one of them is
    /// an error. Empty values count as unset.
    pub fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let collation = match (var("UPKEEP_CHARSET"), var("UPKEEP_COLLATION")) {
            (Some(charset), Some(collation)) => Some(CollationTarget::new(charset, collation)),
            (None, None) => None,
            (Some(_), None) => {
                return Err(Error::Config(
                    "UPKEEP_CHARSET is set but UPKEEP_COLLATION is not".into(),
                ));
            }
            (None, Some(_)) => {
                return Err(Error::Config(
                    "UPKEEP_COLLATION is set but UPKEEP_CHARSET is not".into(),
                ));
            }
        };

        Ok(Self {
            database_url: var("DATABASE_URL"),
            collation,
        })
    }

    pub fn require_database_url(&self) -> Result<&str> {
        self.database_url
            .as_deref()
            .ok_or_else(|| Error::Config("DATABASE_URL is not set".into()))
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("database_url", &self.database_url.as_deref().map(mask_password))
            .field("collation", &self.collation)
            .finish()
    }
}

/// Mask the password in a database URL for display.
pub fn mask_password(url: &str) -> String {
    let Some(start) = url.find("://").map(|i| i + 3) else {
        return url.to_string();
    };
    let Some(at) = url[start..].rfind('@').map(|i| start + i) else {
        return url.to_string();
    };
    match url[start..at].find(':') {
        Some(colon) => format!("{}:***{}", &url[..start + colon], &url[at..]),
        None => url.to_string(),
    }
}
