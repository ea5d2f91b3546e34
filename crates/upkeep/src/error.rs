use thiserror::Error;

/// What a backend reported when it rejected a statement.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error(transparent)]
    Postgres(#[from] tokio_postgres::Error),

    #[error("{0}")]
    Memory(String),
}

#[derive(Debug, Error)]
pub enum Error {
    /// The backend rejected a statement. `intent` says what the statement was for.
    #[error("failed to {intent}: {source}")]
    Query {
        intent: String,
        #[source]
        source: BackendError,
    },

    /// Rows of a duplicate group were deleted but the survivor could not be
    /// reinserted. The group's transaction was rolled back.
    #[error("removed duplicates of {key} from {table} but could not reinsert the survivor: {source}")]
    PartialWrite {
        table: String,
        key: String,
        #[source]
        source: BackendError,
    },

    #[error("unit {unit} requires {missing}, which has not been applied")]
    PreconditionUnmet { unit: String, missing: String },

    #[error("unknown upgrade unit: {0}")]
    UnknownUnit(String),

    #[error("prerequisite cycle involving {0}")]
    PrerequisiteCycle(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{0} is not supported by this backend")]
    Unsupported(String),
}

/// Attach an intent to a backend failure.
pub trait QueryContext<T> {
    fn intent(self, intent: impl FnOnce() -> String) -> Result<T, Error>;
}

impl<T, E: Into<BackendError>> QueryContext<T> for Result<T, E> {
    fn intent(self, intent: impl FnOnce() -> String) -> Result<T, Error> {
        self.map_err(|e| Error::Query {
            intent: intent(),
            source: e.into(),
        })
    }
}
