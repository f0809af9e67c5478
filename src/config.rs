//! Engine Configuration
//!
//! Runtime knobs for the workflow engine. Values come from defaults,
//! an optional YAML file, and finally environment overrides.
//!
//! # Example YAML Format
//!
//! ```yaml
//! max_parallel_branches: 8
//! dead_end_policy: fail
//! admin_role: workflow_admin
//! store_dir: /var/lib/contentflow
//! versioned_fields: [title, body, slug]
//! ```

use std::error::Error;
use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

/// Environment variable overriding the store directory.
pub const HOME_ENV: &str = "CONTENTFLOW_HOME";

/// Environment variable overriding the parallel branch limit.
pub const MAX_PARALLEL_ENV: &str = "CONTENTFLOW_MAX_PARALLEL";

/// Lazily-resolved default directory for the file-backed store.
pub static DEFAULT_STORE_DIR: Lazy<PathBuf> = Lazy::new(|| {
    // Priority 1: explicit environment override
    if let Ok(dir) = std::env::var(HOME_ENV) {
        if !dir.trim().is_empty() {
            info!("Using store directory from {}: {}", HOME_ENV, dir);
            return PathBuf::from(dir);
        }
    }

    // Priority 2: hidden directory in the current working directory
    PathBuf::from(".contentflow")
});

/// What the runner does when a multi-successor step matches no condition.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeadEndPolicy {
    /// Mark the instance failed with reason `DeadEnd`.
    #[default]
    Fail,
    /// Treat the dead end as normal completion.
    Complete,
}

/// Engine-wide configuration.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct EngineConfig {
    /// Upper bound on concurrently running branches of one parallel step
    #[serde(default = "default_max_parallel")]
    pub max_parallel_branches: usize,

    /// Policy applied when no decision condition matches
    #[serde(default)]
    pub dead_end_policy: DeadEndPolicy,

    /// Role allowed to cancel instances it did not start
    #[serde(default = "default_admin_role")]
    pub admin_role: String,

    /// Directory used by the file-backed store
    #[serde(default = "default_store_dir")]
    pub store_dir: PathBuf,

    /// Subject fields whose changes create content versions; empty tracks all
    #[serde(default)]
    pub versioned_fields: Vec<String>,

    /// Deepest chain of subprocess children an instance may start
    #[serde(default = "default_max_subprocess_depth")]
    pub max_subprocess_depth: u32,
}

fn default_max_parallel() -> usize {
    num_cpus::get().max(1)
}

fn default_max_subprocess_depth() -> u32 {
    16
}

fn default_admin_role() -> String {
    "admin".to_string()
}

fn default_store_dir() -> PathBuf {
    DEFAULT_STORE_DIR.clone()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_parallel_branches: default_max_parallel(),
            dead_end_policy: DeadEndPolicy::default(),
            admin_role: default_admin_role(),
            store_dir: default_store_dir(),
            versioned_fields: Vec::new(),
            max_subprocess_depth: default_max_subprocess_depth(),
        }
    }
}

impl EngineConfig {
    /// Loads configuration from a YAML file, then applies environment overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Box<dyn Error>> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            format!("Failed to read config file '{}': {}", path.display(), e)
        })?;

        let mut config: EngineConfig = serde_yaml::from_str(&content)
            .map_err(|e| format!("Failed to parse config '{}': {}", path.display(), e))?;

        config.apply_env();
        debug!("Loaded engine config: {:?}", config);
        Ok(config)
    }

    /// Builds the default configuration with environment overrides applied.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    fn apply_env(&mut self) {
        if let Ok(raw) = std::env::var(MAX_PARALLEL_ENV) {
            match raw.parse::<usize>() {
                Ok(n) if n > 0 => self.max_parallel_branches = n,
                _ => warn!("Ignoring invalid {} value: {}", MAX_PARALLEL_ENV, raw),
            }
        }
    }

    pub fn with_dead_end_policy(mut self, policy: DeadEndPolicy) -> Self {
        self.dead_end_policy = policy;
        self
    }

    pub fn with_max_parallel_branches(mut self, n: usize) -> Self {
        self.max_parallel_branches = n.max(1);
        self
    }

    pub fn with_max_subprocess_depth(mut self, depth: u32) -> Self {
        self.max_subprocess_depth = depth;
        self
    }

    pub fn with_versioned_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.versioned_fields = fields.into_iter().map(Into::into).collect();
        self
    }

    /// Whether a change to `field` is recorded in content versions.
    pub fn is_versioned(&self, field: &str) -> bool {
        self.versioned_fields.is_empty() || self.versioned_fields.iter().any(|f| f == field)
    }
}
