use std::fmt;

/// Result alias used throughout the crate.
pub type CResult<T> = Result<T, Error>;

/// Errors surfaced by the engine.
///
/// `NotFound` and `Conflict` are modelled as recoverable outcomes
/// elsewhere in the API (`Option` and `bool` respectively) rather than
/// as `Err` values -- the variants below exist for internal bookkeeping
/// and for the kinds of failure that are fatal to the writer thread.
#[derive(Debug)]
pub enum Error {
    /// Filesystem, lock, or mmap-backend I/O failure.
    Io(std::io::Error),

    /// A key or value violated a length or leading-byte constraint that
    /// could not be silently rewritten away.
    TooLarge(String),

    /// The mmap backend rejected a write outright (e.g. map size
    /// exceeded). Fatal: the writer thread logs this and exits.
    Backend(String),

    /// An internal invariant failed an assertion (e.g. a refcount
    /// decremented below zero). Fatal.
    Corrupt(String),

    /// Catch-all for internal bookkeeping failures that don't fit the
    /// other variants.
    Internal(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(err) => write!(f, "io error: {}", err),
            Error::TooLarge(msg) => write!(f, "too large: {}", msg),
            Error::Backend(msg) => write!(f, "backend error: {}", msg),
            Error::Corrupt(msg) => write!(f, "corrupt: {}", msg),
            Error::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<heed::Error> for Error {
    fn from(err: heed::Error) -> Self {
        Error::Backend(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_human_readable() {
        let err = Error::Corrupt("refcount below zero for shorthash".to_string());
        assert_eq!(err.to_string(), "corrupt: refcount below zero for shorthash");
    }

    #[test]
    fn io_error_converts() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: Error = io.into();
        assert!(matches!(err, Error::Io(_)));
    }
}
