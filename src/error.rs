use std::path::PathBuf;

use thiserror::Error;

use crate::registry::RegistryError;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, ExportError>;

// ─── Unified error type ──────────────────────────────────────────

#[derive(Error, Debug)]
pub enum ExportError {
    /// Invalid or inconsistent configuration, caught at construction time.
    #[error("configuration error: {0}")]
    Config(String),

    #[error("{} already exists and is not a directory", path.display())]
    NotADirectory { path: PathBuf },

    #[error("invalid filter spec '{spec}': {reason}")]
    InvalidFilter { spec: String, reason: String },

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("SQLite error: {0}")]
    Sql(#[from] rusqlite::Error),

    #[error("histogram encoding failed: {0}")]
    HistogramEncoding(String),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// A family was built with a sample variant its type does not allow.
    #[error("invalid metric family '{family}': {reason}")]
    InvalidFamily { family: String, reason: String },

    #[error("runtime error: {0}")]
    Runtime(String),
}

impl ExportError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Configuration-class errors are fatal to a reporter's setup and never retried.
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            Self::Config(_) | Self::NotADirectory { .. } | Self::InvalidFilter { .. }
        )
    }
}
