//! Visualizer error types.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

pub type VisualizerResult<T> = Result<T, VisualizerError>;

#[derive(Debug, Error)]
pub enum VisualizerError {
    #[error("invalid visualizer parameters: {0}")]
    InvalidParams(String),

    #[error("cannot create log directory {path}: {source}")]
    LogDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to start {binary}: {source}")]
    Spawn {
        binary: String,
        #[source]
        source: io::Error,
    },
}
