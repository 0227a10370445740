use std::{cell::Cell, fmt::Display, path::PathBuf};

use crate::{backend::BackendError, object::ObjectKind};

/// Stable integer codes shared with callers that check errors after the fact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(i32)]
pub enum ErrorCode {
    #[default]
    NoError = 0,
    InvalidSlot = 1,
    SourceUnreadable = 2,
    BackendCompileFailure = 3,
    CacheWriteFailure = 4,
    CacheCorrupt = 5,
    LinkFailure = 6,
    NotPrepared = 7,
    InvalidOperation = 8,
    UnresolvedSymbol = 9,
}

impl ErrorCode {
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    pub fn is_error(self) -> bool {
        self != ErrorCode::NoError
    }
}

impl Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?} ({})", self, self.as_i32())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid source slot {slot}, only {max} slots exist")]
    InvalidSlot { slot: usize, max: usize },
    #[error("source slot {slot} already holds {name:?}")]
    SlotOccupied { slot: usize, name: String },
    #[error("no main source registered")]
    NoSource,
    #[error("could not read {path}")]
    SourceUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("compilation failed: {0}")]
    Compile(#[source] BackendError),
    #[error("link failed: {0}")]
    Link(#[source] BackendError),
    #[error("could not write {path}")]
    OutputWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("could not write cache entry {path}")]
    CacheWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cache entry {path} is corrupt: {reason}")]
    CacheCorrupt { path: PathBuf, reason: String },
    #[error("script has not been prepared")]
    NotPrepared,
    #[error("script is already prepared as {kind:?}")]
    AlreadyPrepared { kind: ObjectKind },
    #[error("no cache location recorded for this script")]
    NoCacheLocation,
    #[error("only compiled scripts can be written to the cache")]
    NotCompiled,
    #[error("unresolved symbol {name}")]
    UnresolvedSymbol { name: String },
}

impl Error {
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::InvalidSlot { .. } | Error::SlotOccupied { .. } => ErrorCode::InvalidSlot,
            Error::SourceUnreadable { .. } => ErrorCode::SourceUnreadable,
            Error::Compile(_) => ErrorCode::BackendCompileFailure,
            Error::Link(_) | Error::OutputWrite { .. } => ErrorCode::LinkFailure,
            Error::CacheWrite { .. } => ErrorCode::CacheWriteFailure,
            Error::CacheCorrupt { .. } => ErrorCode::CacheCorrupt,
            Error::NotPrepared => ErrorCode::NotPrepared,
            Error::NoSource
            | Error::AlreadyPrepared { .. }
            | Error::NoCacheLocation
            | Error::NotCompiled => ErrorCode::InvalidOperation,
            Error::UnresolvedSymbol { .. } => ErrorCode::UnresolvedSymbol,
        }
    }
}

/// Holds the first error code raised since the last read.
///
/// Later errors never overwrite a pending one, so a caller that checks after a
/// sequence of calls sees the root cause. Reading clears it.
#[derive(Debug, Default)]
pub struct ErrorAccumulator {
    pending: Cell<ErrorCode>,
}

impl ErrorAccumulator {
    pub fn set_error(&self, code: ErrorCode) {
        if !self.pending.get().is_error() && code.is_error() {
            self.pending.set(code);
        }
    }

    pub fn take_error(&self) -> ErrorCode {
        self.pending.take()
    }

    pub fn record<T>(&self, result: Result<T, Error>) -> Result<T, Error> {
        if let Err(e) = &result {
            self.set_error(e.code());
        }
        result
    }
}
