use std::fmt;

pub type Result<T> = std::result::Result<T, Error>;

/// The error taxonomy a caller is expected to match on.
///
/// Everything that is *not* one of these kinds is absorbed into row-level
/// state transitions (abandon/fail) by the dispatcher rather than
/// propagated; these four are the ones the core ever surfaces to a caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed input: non-positive lease seconds, empty topic, name too
    /// long, etc. Never retried.
    Validation,
    /// Connection/deadlock/timeout while talking to storage. The caller may
    /// retry once; a second failure propagates.
    TransientStorage,
    /// Renewal failed, or a fencing check rejected a stale holder. The
    /// current iteration must abort and roll back.
    LostLease,
    /// Missing discovery registration, duplicate registration, or
    /// mutually exclusive registration modes. Surfaced eagerly at startup.
    Configuration,
    /// Semaphore `tryAcquire` against an undefined semaphore name.
    NotFound,
    /// Wraps anything else (an underlying driver error we don't classify).
    Other,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Validation => "validation",
            ErrorKind::TransientStorage => "transient_storage",
            ErrorKind::LostLease => "lost_lease",
            ErrorKind::Configuration => "configuration",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Other => "other",
        };
        f.write_str(s)
    }
}

#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    inner: anyhow::Error,
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            inner: anyhow::anyhow!(message.into()),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn lost_lease(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::LostLease, message)
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Configuration, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.inner)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.inner.source()
    }
}

impl From<sqlx::Error> for Error {
    fn from(value: sqlx::Error) -> Self {
        let kind = match &value {
            sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => ErrorKind::TransientStorage,
            sqlx::Error::Database(db) if db.code().as_deref() == Some("40001") => {
                ErrorKind::TransientStorage
            }
            _ => ErrorKind::Other,
        };
        Self {
            kind,
            inner: anyhow::Error::from(value),
        }
    }
}

impl From<anyhow::Error> for Error {
    fn from(value: anyhow::Error) -> Self {
        Self {
            kind: ErrorKind::Other,
            inner: value,
        }
    }
}
