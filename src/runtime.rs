//! Runtime glue that wires configs, fatal error capture, progress tracking,
//! telemetry, and runner orchestration.

pub mod config;
pub mod fatal;
pub mod progress;
pub mod runner;
pub mod telemetry;
