//! Error types and Result alias shared by the three vnode runtime components.
//!
//! Modeled as a small result code plus an optional message, the way the
//! storage layer reports failures: a fixed set of causes rather than an
//! open-ended error hierarchy, since callers branch on the cause (see
//! `spec.md` §7's error table) far more often than they print it.

use std::fmt;

/// Cause of a failure, mapped onto `spec.md` §7's error table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Catch-all failure from the query operator or other collaborator.
    Error,
    /// Allocation failure in a response builder or queue item.
    NoMem,
    /// Offset tag `None` escaped to the response boundary, or an
    /// incompatible `with_tbname`/`with_schema` combination.
    Misuse,
    /// `RetrieveTaosxBlock` could not resolve a schema for a batch.
    NotFound,
    /// Output sink has no room; caller should back off and retry.
    Full,
    /// Operator reported `QRY_IN_EXEC`; caller should reset and retry.
    Busy,
    /// B-Tree insert rejected a duplicate key.
    Constraint,
    /// Pager/page I/O failure.
    IoErr,
    /// Page contents failed a structural check.
    Corrupt,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorCode::Error => "error",
            ErrorCode::NoMem => "out of memory",
            ErrorCode::Misuse => "invalid parameter",
            ErrorCode::NotFound => "not found",
            ErrorCode::Full => "queue full",
            ErrorCode::Busy => "busy",
            ErrorCode::Constraint => "constraint violation",
            ErrorCode::IoErr => "i/o error",
            ErrorCode::Corrupt => "corrupt",
        };
        f.write_str(s)
    }
}

/// Crate-wide error: a code plus an optional human-readable message.
#[derive(Debug, Clone)]
pub struct Error {
    code: ErrorCode,
    message: Option<String>,
}

impl Error {
    pub fn new(code: ErrorCode) -> Self {
        Self { code, message: None }
    }

    pub fn with_message(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: Some(message.into()),
        }
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(msg) => write!(f, "{}: {}", self.code, msg),
            None => write!(f, "{}", self.code),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;
