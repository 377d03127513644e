//! Error type shared by every diversity computation.

use std::path::PathBuf;

/// Errors raised by abundance normalization, similarity backends and
/// diversity measures.
#[derive(Debug, thiserror::Error)]
pub enum DiversityError {
    /// Argument outside the accepted domain of an operation: unsupported
    /// similarity source, empty subset, viewpoint outside `[0, ∞]`.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Operand shapes disagree.
    #[error("shape mismatch in {context}: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        context: &'static str,
        expected: (usize, usize),
        got: (usize, usize),
    },

    /// Degenerate normalization or an undefined power.
    #[error("domain error: {0}")]
    Domain(String),

    /// Unreadable similarity, count or shared-memory source.
    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Malformed delimited input.
    #[error("{}:{line}: {message}", path.display())]
    Parse {
        path: PathBuf,
        line: usize,
        message: String,
    },

    /// A chunk task of the function-computed backend failed; the whole
    /// weighted-similarity computation is discarded.
    #[error("similarity worker failed on species rows {start}..{end}: {message}")]
    WorkerFailed {
        start: usize,
        end: usize,
        message: String,
    },
}

impl DiversityError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io { path: path.into(), source }
    }

    pub(crate) fn parse(path: impl Into<PathBuf>, line: usize, message: impl Into<String>) -> Self {
        Self::Parse { path: path.into(), line, message: message.into() }
    }
}

pub type Result<T> = std::result::Result<T, DiversityError>;
