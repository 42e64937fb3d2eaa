use std::path::PathBuf;

use crate::ledger::Drift;

/// Error type for the datamig crate.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// An operation that needs a live database was attempted against a recording session.
    #[error("{operation} is not supported while recording statements: {sql}")]
    RecordingUnsupported { operation: &'static str, sql: String },
    /// A migration file could not be written.
    #[error("failed to write migration file {file}: {reason}")]
    Write { file: String, reason: String },
    /// The files on disk no longer match the stored manifest.
    #[error("migration directory does not match its manifest:\n{0}")]
    IntegrityMismatch(Drift),
    #[error("manifest {path} not found, but the migration directory contains files")]
    ManifestNotFound { path: PathBuf },
    #[error("invalid manifest at line {line}: {reason}")]
    Manifest { line: usize, reason: String },
    /// A statement of a plan failed. `index` is zero based.
    #[error("statement {index} failed: {source}\n    {sql}")]
    PlanExecution {
        index: usize,
        sql: String,
        #[source]
        source: Box<Error>,
    },
    /// A hook aborted the apply on purpose.
    #[error("hook '{hook}' vetoed the apply: {reason}")]
    HookVeto { hook: String, reason: String },
    #[error("apply cancelled before statement {index}")]
    Cancelled { index: usize },
    /// Wraps an error with the migration file it happened in.
    #[error("migration file {file}: {source}")]
    File {
        file: String,
        #[source]
        source: Box<Error>,
    },
    #[error("invalid migration directory {path}: {reason}")]
    Directory { path: PathBuf, reason: String },
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[cfg(feature = "sqlite")]
    #[error("{0}")]
    Rusqlite(rusqlite::Error),
    #[cfg(feature = "mysql")]
    #[error("{0}")]
    Mysql(String),
    #[cfg(feature = "postgres")]
    #[error("{0}")]
    Postgres(#[from] postgres::Error),
    #[error("{0}")]
    Generic(String),
}

impl Error {
    /// Build a [`Error::HookVeto`].
    pub fn veto(hook: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::HookVeto {
            hook: hook.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn in_file(self, file: impl Into<String>) -> Self {
        Self::File {
            file: file.into(),
            source: Box::new(self),
        }
    }
}

#[cfg(feature = "sqlite")]
impl From<rusqlite::Error> for Error {
    fn from(value: rusqlite::Error) -> Self {
        Self::Rusqlite(value)
    }
}

#[cfg(feature = "mysql")]
impl From<mysql::Error> for Error {
    fn from(value: mysql::Error) -> Self {
        Self::Mysql(value.to_string())
    }
}

impl From<String> for Error {
    fn from(value: String) -> Self {
        Self::Generic(value)
    }
}
