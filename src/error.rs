//! Crate-wide error taxonomy.
//!
//! Every fallible operation in this crate returns [`Result<T>`], an alias for
//! `std::result::Result<T, Error>`. Errors form a cause chain: wrapping an
//! error preserves the original as [`Error::source`], mirroring the
//! thread-local exception-with-cause-chain model this crate is derived from.

use std::fmt;
use std::io;

pub type Result<T> = std::result::Result<T, Error>;

/// The "should never happen" signal. A trusted syscall returned a value its
/// contract forbids (e.g. a negative `read()` count other than `-1`). Logged
/// and fatal for the affected operation, but never aborts the process.
#[derive(Debug, thiserror::Error)]
pub enum InternalKind {
    #[error("unknown internal error")]
    Unknown,
    #[error("incorrect usage: {0}")]
    IncorrectUsage(String),
    #[error("bad input: {0}")]
    BadInput(String),
    #[error("frontend error")]
    FrontendError,
    #[error("backend error: {0}")]
    BackendError(String),
    #[error("backend malfunction: {0}")]
    BackendMalfunction(String),
    #[error("protocol error: {0}")]
    ProtocolError(String),
    #[error("not implemented: {0}")]
    NotImplemented(&'static str),
}

#[derive(Debug, thiserror::Error)]
pub enum NumericConversionKind {
    #[error("empty string")]
    EmptyString,
    #[error("non-numeric characters")]
    NonNumericChars,
    #[error("overflow")]
    Overflow,
}

#[derive(Debug, thiserror::Error)]
pub enum ErrorKind {
    #[error("posix error {0}")]
    Posix(i32),
    #[error("io error")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Internal(#[from] InternalKind),
    #[error(transparent)]
    NumericConversion(#[from] NumericConversionKind),
}

/// A crate error with an optional cause chain.
pub struct Error {
    kind: ErrorKind,
    source: Option<Box<Error>>,
}

impl Error {
    pub fn new(kind: ErrorKind) -> Error {
        Error { kind, source: None }
    }

    pub fn with_cause(kind: ErrorKind, cause: Error) -> Error {
        Error {
            kind,
            source: Some(Box::new(cause)),
        }
    }

    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    pub fn internal(kind: InternalKind) -> Error {
        Error::new(ErrorKind::Internal(kind))
    }

    pub fn backend_malfunction(what: impl Into<String>) -> Error {
        let err = Error::internal(InternalKind::BackendMalfunction(what.into()));
        log::error!("{err}");
        err
    }

    pub fn is_would_block(&self) -> bool {
        matches!(&self.kind, ErrorKind::Io(e) if e.kind() == io::ErrorKind::WouldBlock)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.kind)?;
        if let Some(cause) = &self.source {
            write!(f, "\ncaused by: {cause:?}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_deref().map(|e| e as &(dyn std::error::Error + 'static))
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Error {
        Error::new(ErrorKind::Io(e))
    }
}

impl From<InternalKind> for Error {
    fn from(k: InternalKind) -> Error {
        Error::new(ErrorKind::Internal(k))
    }
}

/// Translates a raw `errno` (as returned by `*_last_os_error`) into an [`Error`].
pub fn posix_error(errno: i32) -> Error {
    Error::new(ErrorKind::Posix(errno))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cause_chain_is_preserved() {
        let root = Error::new(ErrorKind::Io(io::Error::new(io::ErrorKind::Other, "boom")));
        let wrapped = Error::with_cause(ErrorKind::Internal(InternalKind::BackendError("retry failed".into())), root);

        use std::error::Error as _;
        assert!(wrapped.source().is_some());
    }

    #[test]
    fn would_block_detection() {
        let e: Error = io::Error::new(io::ErrorKind::WouldBlock, "would block").into();
        assert!(e.is_would_block());
    }
}
