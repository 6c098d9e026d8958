/// Errors that can occur in the data layer.
///
/// Variants fall into the categories callers handle differently:
///
/// - programmer errors (`InvalidState`, `InvalidArgument`, `AlreadyActive`,
///   `NoActiveTransaction`, `Disposed`) which correct code never triggers,
/// - absence (`NotFound`),
/// - persistence failures (`Concurrency`, `Constraint`, `Database`), which
///   `Repository::save` folds into a [`SaveResult`](crate::SaveResult),
/// - everything else.
#[derive(Debug)]
pub enum DataError {
    InvalidState(String),
    InvalidArgument(String),
    NotFound(String),
    MultipleResults { entity: &'static str },
    AlreadyActive,
    NoActiveTransaction,
    Disposed,
    Concurrency(String),
    Constraint(String),
    Serialization(serde_json::Error),
    Database(Box<dyn std::error::Error + Send + Sync>),
    Other(String),
}

impl DataError {
    /// Construct a `Database` variant from any error type.
    ///
    /// Used by backend crates (e.g. `keel-data-sqlx`) to wrap driver-specific
    /// errors.
    pub fn database(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        DataError::Database(Box::new(err))
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        DataError::InvalidState(msg.into())
    }

    /// `true` for errors that indicate misuse of the API rather than a
    /// failure of the backing store.
    pub fn is_programmer_error(&self) -> bool {
        matches!(
            self,
            DataError::InvalidState(_)
                | DataError::InvalidArgument(_)
                | DataError::AlreadyActive
                | DataError::NoActiveTransaction
                | DataError::Disposed
        )
    }

    /// `true` for failures raised while writing to the store.
    pub fn is_persistence_failure(&self) -> bool {
        matches!(
            self,
            DataError::Concurrency(_) | DataError::Constraint(_) | DataError::Database(_)
        )
    }
}

impl std::fmt::Display for DataError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DataError::InvalidState(msg) => write!(f, "Invalid state: {msg}"),
            DataError::InvalidArgument(msg) => write!(f, "Invalid argument: {msg}"),
            DataError::NotFound(msg) => write!(f, "Not found: {msg}"),
            DataError::MultipleResults { entity } => {
                write!(f, "Query for {entity} returned more than one result")
            }
            DataError::AlreadyActive => write!(f, "A transaction is already in progress"),
            DataError::NoActiveTransaction => write!(f, "No active transaction"),
            DataError::Disposed => write!(f, "The context has been disposed"),
            DataError::Concurrency(msg) => write!(f, "Concurrency conflict: {msg}"),
            DataError::Constraint(msg) => write!(f, "Constraint violation: {msg}"),
            DataError::Serialization(err) => write!(f, "Serialization error: {err}"),
            DataError::Database(err) => write!(f, "Database error: {err}"),
            DataError::Other(msg) => write!(f, "Data error: {msg}"),
        }
    }
}

impl std::error::Error for DataError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DataError::Database(err) => Some(err.as_ref()),
            DataError::Serialization(err) => Some(err),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for DataError {
    fn from(err: serde_json::Error) -> Self {
        DataError::Serialization(err)
    }
}
