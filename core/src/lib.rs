//! regmirror core - shared error and configuration types.
//!
//! Everything here is constructed once at the boundary and treated as
//! read-only by the engine.

pub mod config;
pub mod error;

pub use config::{Platform, PullConfig, DEFAULT_DATA_DIR, DEFAULT_MAX_PULL_PROCS};
pub use error::{MirrorError, Result};

/// regmirror version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
