/// Errors surfaced by a [`CacheProvider`](crate::CacheProvider) backend.
#[derive(Debug)]
pub enum CacheError {
    /// The backend could not be reached.
    Unavailable(String),
    /// The backend rejected the operation.
    Backend(Box<dyn std::error::Error + Send + Sync>),
}

impl CacheError {
    /// Wrap a backend-specific error.
    pub fn backend(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        CacheError::Backend(Box::new(err))
    }
}

impl std::fmt::Display for CacheError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheError::Unavailable(msg) => write!(f, "Cache unavailable: {msg}"),
            CacheError::Backend(err) => write!(f, "Cache backend error: {err}"),
        }
    }
}

impl std::error::Error for CacheError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CacheError::Backend(err) => Some(err.as_ref()),
            CacheError::Unavailable(_) => None,
        }
    }
}
