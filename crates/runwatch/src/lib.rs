//! runwatch library
//!
//! Supervises one long-running command, streams its output and host
//! telemetry to live observers, and proxies a metrics UI running beside it.

pub mod api;
pub mod config;
pub mod process;
pub mod runner;
pub mod telemetry;
pub mod transcript;
pub mod visualizer;
pub mod ws;
