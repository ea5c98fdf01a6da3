use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors raised by log sources and stage composition
#[derive(Debug, Error)]
pub enum LogSourceError {
    #[error("{} does not exist", .0.display())]
    SourceDoesNotExist(PathBuf),

    #[error("{} cannot be accessed", .path.display())]
    SourceCannotBeAccessed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The caller asked for a column the source doesn't provide
    #[error("no such column: {0}")]
    NoSuchColumn(&'static str),

    /// The caller asked for a property the source doesn't provide
    #[error("no such property: {0}")]
    NoSuchProperty(&'static str),

    #[error("destination holds {available} values but {requested} were requested")]
    BufferTooSmall { requested: usize, available: usize },

    #[error("at most {max} sources can be merged, got {requested}")]
    TooManySources { requested: usize, max: usize },

    #[error("source {duplicate} of the merge is the same stage as source {first}")]
    DuplicateSource { first: usize, duplicate: usize },

    /// Connecting the stages would make a stage listen to itself
    #[error("composing these stages would create a cycle")]
    Cycle,
}

impl LogSourceError {
    /// Classify an I/O error raised while reading `path`
    pub fn from_io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        let path = path.into();
        match source.kind() {
            io::ErrorKind::NotFound => Self::SourceDoesNotExist(path),
            _ => Self::SourceCannotBeAccessed { path, source },
        }
    }
}

pub type Result<T, E = LogSourceError> = std::result::Result<T, E>;

/// Check that a destination buffer can hold `requested` values
pub(crate) fn ensure_capacity(requested: usize, available: usize) -> Result<()> {
    if available < requested {
        return Err(LogSourceError::BufferTooSmall {
            requested,
            available,
        });
    }
    Ok(())
}
