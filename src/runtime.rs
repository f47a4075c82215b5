//! Runtime glue that wires configs, pipeline traits, progress tracking,
//! fatal error handling, telemetry, and runner orchestration.

pub mod config;
pub mod fatal;
pub mod pipeline;
pub mod progress;
pub mod runner;
pub mod telemetry;
