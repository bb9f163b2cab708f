//! Git mirror of the configuration repository
//!
//! Handles cloning, fetching, tag moves and signature checks against the
//! watched repository, with authentication support.

mod mirror;

pub use mirror::{GitCredentials, GitMirror};
