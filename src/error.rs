// Error types surfaced by the indexer core.
//
// Propagation policy: `NotFound` is recovered in exactly three places
// (head-on-cold-start, orphan-parent lookup during the ancestor search,
// and the canonical-ancestor probe); every other error unwinds to the
// event loop, which terminates and reports. The core never retries.

use std::fmt;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    /// A store read for a single row returned zero rows.
    NotFound,
    /// A persistence failure from the underlying SQLite store.
    Store(rusqlite::Error),
    /// Subscription, block fetch, or balance fetch failure upstream.
    Adapter(String),
    /// A boundary input was rejected (bad address, bad config value).
    InvalidInput(String),
    /// An ancestor walk exceeded the configured depth bound without
    /// reaching an indexed block.
    ReorgTooDeep { depth: u64 },
}

impl Error {
    pub fn adapter(message: impl Into<String>) -> Self {
        Error::Adapter(message.into())
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Error::InvalidInput(message.into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::NotFound => write!(f, "record not found"),
            Error::Store(err) => write!(f, "store error: {}", err),
            Error::Adapter(message) => write!(f, "chain adapter error: {}", message),
            Error::InvalidInput(message) => write!(f, "invalid input: {}", message),
            Error::ReorgTooDeep { depth } => {
                write!(f, "ancestor walk exceeded {} blocks without reaching an indexed block", depth)
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Store(err) => Some(err),
            _ => None,
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        // A single-row query with no rows is the one store outcome the
        // protocol may recover from; keep it distinguishable.
        match err {
            rusqlite::Error::QueryReturnedNoRows => Error::NotFound,
            other => Error::Store(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_rows_maps_to_not_found() {
        let err: Error = rusqlite::Error::QueryReturnedNoRows.into();
        assert!(err.is_not_found());
    }

    #[test]
    fn display_includes_adapter_context() {
        let err = Error::adapter("subscription closed");
        assert_eq!(err.to_string(), "chain adapter error: subscription closed");
    }
}
