//! Run configuration.
//!
//! A `PullConfig` is built once at the boundary (CLI flags, library caller)
//! and handed to the engine as an immutable value. Nothing in the engine
//! mutates it after construction.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{MirrorError, Result};

/// Default registry data directory.
pub const DEFAULT_DATA_DIR: &str = "/var/lib/registry";

/// Default number of concurrent image pipelines.
pub const DEFAULT_MAX_PULL_PROCS: usize = 5;

/// Target platform for manifest index selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    pub os: String,
    pub architecture: String,
}

impl Platform {
    /// A linux platform with the given architecture.
    pub fn linux(architecture: impl Into<String>) -> Self {
        Self {
            os: "linux".to_string(),
            architecture: architecture.into(),
        }
    }

    /// Parse an `os/arch` pair (e.g. "linux/arm64").
    pub fn parse(s: &str) -> Result<Self> {
        match s.split_once('/') {
            Some((os, arch)) if !os.is_empty() && !arch.is_empty() => Ok(Self {
                os: os.to_string(),
                architecture: arch.to_string(),
            }),
            _ => Err(MirrorError::Config(format!(
                "Invalid platform '{}': expected os/arch",
                s
            ))),
        }
    }

    /// True when the given manifest platform fields match exactly.
    pub fn matches(&self, os: &str, architecture: &str) -> bool {
        self.os == os && self.architecture == architecture
    }
}

impl Default for Platform {
    fn default() -> Self {
        Self::linux("amd64")
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.os, self.architecture)
    }
}

/// Immutable configuration for one pull run.
#[derive(Debug, Clone)]
pub struct PullConfig {
    /// Platform selected from multi-arch manifest indexes.
    pub platform: Platform,

    /// Root of the local registry storage layout. Must already exist.
    pub data_dir: PathBuf,

    /// Concurrency ceiling for image pipelines.
    pub max_pull_procs: usize,

    /// Send basic auth directly instead of the token-exchange flow.
    pub basic_auth: bool,
}

impl Default for PullConfig {
    fn default() -> Self {
        Self {
            platform: Platform::default(),
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            max_pull_procs: DEFAULT_MAX_PULL_PROCS,
            basic_auth: false,
        }
    }
}

impl PullConfig {
    /// Validate the parts of the configuration that can be checked without
    /// touching the network.
    pub fn validate(&self) -> Result<()> {
        if self.max_pull_procs == 0 {
            return Err(MirrorError::Config(
                "max-pull-procs must be at least 1".to_string(),
            ));
        }
        if !self.data_dir.is_dir() {
            return Err(MirrorError::Config(format!(
                "data dir {} does not exist or is not a directory",
                self.data_dir.display()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_platform_default() {
        let p = Platform::default();
        assert_eq!(p.os, "linux");
        assert_eq!(p.architecture, "amd64");
        assert_eq!(p.to_string(), "linux/amd64");
    }

    #[test]
    fn test_platform_parse() {
        let p = Platform::parse("linux/arm64").unwrap();
        assert_eq!(p.os, "linux");
        assert_eq!(p.architecture, "arm64");
    }

    #[test]
    fn test_platform_parse_invalid() {
        assert!(Platform::parse("amd64").is_err());
        assert!(Platform::parse("/arm64").is_err());
        assert!(Platform::parse("linux/").is_err());
    }

    #[test]
    fn test_platform_matches_exactly() {
        let p = Platform::linux("arm64");
        assert!(p.matches("linux", "arm64"));
        assert!(!p.matches("linux", "amd64"));
        assert!(!p.matches("darwin", "arm64"));
    }

    #[test]
    fn test_pull_config_defaults() {
        let cfg = PullConfig::default();
        assert_eq!(cfg.max_pull_procs, 5);
        assert_eq!(cfg.data_dir, PathBuf::from("/var/lib/registry"));
        assert!(!cfg.basic_auth);
    }

    #[test]
    fn test_validate_rejects_zero_procs() {
        let cfg = PullConfig {
            max_pull_procs: 0,
            data_dir: std::env::temp_dir(),
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_missing_data_dir() {
        let cfg = PullConfig {
            data_dir: PathBuf::from("/definitely/not/a/real/path"),
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }
}
