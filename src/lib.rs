//! Reconciler - continuous deployment from a configuration repository
//!
//! Keeps a cluster converged with the contents of a git repository while
//! watching for new images of running workloads.
//!
//! # Architecture
//!
//! - **daemon**: The event loop, its triggers, timers and drift detection
//! - **config**: YAML configuration and validation
//! - **git**: git2-backed mirror of the configuration repository
//! - **sync**: Sync attempts that apply a revision and move the sync tag
//! - **server**: HTTP control surface (health, metrics, trigger API)
//!
//! Background work is queued through the `jobs` crate.

// Core modules
pub mod config;
pub mod daemon;
pub mod error;
pub mod logging;

// Outer surfaces
pub mod git;
pub mod server;
pub mod sync;

// Re-exports
pub use error::{ReconcilerError, Result};
