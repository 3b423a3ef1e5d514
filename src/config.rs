//! TOML configuration for the coordinator.
//!
//! Layered model: compiled-in defaults, overridden by a config file found via
//! the `PROCTOR_CONFIG` environment variable or the conventional project
//! location. Every section has serde defaults so partial files work.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Root configuration for the coordination core.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub storage: StorageConfig,
    pub poller: PollerConfig,
    pub capture: CaptureConfig,
    pub truncation: TruncationConfig,
    pub export: ExportConfig,
}

impl CoordinatorConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded coordinator configuration");
        Ok(config)
    }

    /// Try to load configuration from, in order:
    /// 1. The path in the `PROCTOR_CONFIG` environment variable.
    /// 2. `./proctor.toml` next to the working directory.
    /// 3. Compiled-in defaults.
    pub fn load_or_default() -> Self {
        if let Ok(env_path) = std::env::var("PROCTOR_CONFIG") {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "PROCTOR_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let local_path = Path::new("proctor.toml");
        if local_path.exists() {
            match Self::load(local_path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(error = %e, "proctor.toml exists but could not be loaded, using defaults");
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Self::default()
    }
}

/// Embedded store location and retention.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Path to the coordination database.
    pub db_path: PathBuf,
    /// Console and execution log rows older than this are pruned.
    pub log_retention_days: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("data/coordination.db"),
            log_retention_days: 7,
        }
    }
}

/// Background poller cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollerConfig {
    /// Interval between pending-work checks, in milliseconds.
    pub interval_ms: u64,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self { interval_ms: 1000 }
    }
}

/// Console capture buffer and drain cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Bounded in-memory queue size; oldest entries drop first when full.
    pub capacity: usize,
    /// Interval between dispatch-side drains, in milliseconds.
    pub drain_interval_ms: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            capacity: 1000,
            drain_interval_ms: 500,
        }
    }
}

/// Stack-trace truncation heuristics.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TruncationConfig {
    /// Namespace/prefix patterns classifying a frame as host/runtime
    /// internals rather than user code.
    pub framework_prefixes: Vec<String>,
    /// Patterns that force a line to be kept even if it also matches a
    /// framework prefix (source-tree paths, test-file suffixes).
    pub important_patterns: Vec<String>,
    /// Source-tree markers used to rewrite absolute paths project-relative.
    pub path_markers: Vec<String>,
    /// Emitted lines longer than this are cut.
    pub max_line_length: usize,
    /// At most this many candidate lines are emitted per trace.
    pub max_candidate_lines: usize,
    /// When no candidate line exists, emit this many raw head lines.
    pub fallback_head_lines: usize,
}

impl Default for TruncationConfig {
    fn default() -> Self {
        Self {
            framework_prefixes: vec![
                "System.".to_string(),
                "Engine.".to_string(),
                "Editor.".to_string(),
                "NUnit.".to_string(),
                "TestRunner.".to_string(),
            ],
            important_patterns: vec!["Assets/".to_string(), "Tests/".to_string()],
            path_markers: vec!["Assets/".to_string(), "Packages/".to_string()],
            max_line_length: 200,
            max_candidate_lines: 10,
            fallback_head_lines: 3,
        }
    }
}

/// Result export artifact location.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    /// Directory for run-<id>.xml / .summary.txt / .json artifacts.
    pub results_dir: PathBuf,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            results_dir: PathBuf::from("data/results"),
        }
    }
}
