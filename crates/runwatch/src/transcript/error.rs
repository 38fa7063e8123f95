//! Transcript error types.

use std::path::PathBuf;
use thiserror::Error;

/// Result type for transcript operations.
pub type TranscriptResult<T> = Result<T, TranscriptError>;

/// Errors that can occur while persisting the transcript.
#[derive(Debug, Error)]
pub enum TranscriptError {
    /// Reading or writing the transcript file failed.
    #[error("transcript io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
