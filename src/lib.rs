//! Dependency-managing service supervisor and init.

#![warn(unused_crate_dependencies)]
// These dependencies are only used in the binary (src/bin/main.rs)
// Test dependencies are only used in test code
use clap as _;
use strum as _;
#[cfg(test)]
use tempfile as _;

/// Constants and defaults.
pub mod constants;

/// Control-socket protocol server.
pub mod control;

/// Circular protocol buffer.
pub mod cpbuffer;

/// Daemon driver.
pub mod daemon;

/// Daemon environment handling.
pub mod env;

/// Errors.
pub mod error;

/// Loader boundary.
pub mod load;

/// Lifecycle logging and the console gate.
pub mod logging;

/// Control protocol wire contract.
pub mod proto;

/// Event reactor.
pub mod reactor;

/// Child-side exec setup.
pub mod run_child;

/// Runtime paths and modes.
pub mod runtime;

/// Service records and the dependency graph.
pub mod service;

/// Resolved service settings.
pub mod settings;
