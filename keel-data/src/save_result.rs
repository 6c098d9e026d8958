use std::fmt;

/// Outcome of persisting pending changes.
///
/// Persistence failures (concurrency conflicts, constraint violations,
/// driver errors) end up in `Failed` with one human-readable message each,
/// so callers can inspect them without matching on error types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveResult {
    Succeeded,
    Failed(Vec<String>),
}

impl SaveResult {
    pub fn failed<I, S>(errors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        SaveResult::Failed(errors.into_iter().map(Into::into).collect())
    }

    pub fn succeeded(&self) -> bool {
        matches!(self, SaveResult::Succeeded)
    }

    pub fn errors(&self) -> &[String] {
        match self {
            SaveResult::Succeeded => &[],
            SaveResult::Failed(errors) => errors,
        }
    }
}

impl fmt::Display for SaveResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SaveResult::Succeeded => write!(f, "Succeeded"),
            SaveResult::Failed(errors) => write!(f, "Failed: {}", errors.join(", ")),
        }
    }
}
