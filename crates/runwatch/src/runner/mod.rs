//! Supervised execution of the training command.
//!
//! - [`reassembler`]: raw output bytes to display lines
//! - [`ProcessRunner`]: single-flight child process lifecycle

pub mod reassembler;
mod service;
mod types;

pub use reassembler::{LineReassembler, MAX_LINE_BYTES};
pub use service::{ProcessRunner, RunnerError, RunnerOptions};
pub use types::{LineEvent, Run, RunState};
