//! Runtime configuration.
//!
//! Plain serde structs with defaults. Configuration is handed to the
//! runtime by the embedding application; nothing here is persisted.

use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::changelog::delta::{ExclusionPolicy, EXCLUDE_FROM_DELTAS};
use crate::{Error, Result};

/// Segments are split before they grow past this size.
pub const MAX_CHANGELOG_FILE_SIZE: u64 = 500 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Poll cadence shared by UX waits and breakpoints.
    pub poll_interval_ms: u64,
    /// Pause between loop iterations.
    pub loop_sleep_ms: u64,
    /// Truncation limit for value reprs in flattened node states.
    pub node_state_max_repr: usize,
    /// Minimum gap between two `nodes_node_state` publishes.
    pub node_state_debounce_ms: u64,
    pub changelog: ChangelogConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 250,
            loop_sleep_ms: 0,
            node_state_max_repr: 255,
            node_state_debounce_ms: 1000,
            changelog: ChangelogConfig::default(),
        }
    }
}

impl RuntimeConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn node_state_debounce(&self) -> Duration {
        Duration::from_millis(self.node_state_debounce_ms)
    }

    pub fn loop_sleep(&self) -> Duration {
        Duration::from_millis(self.loop_sleep_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChangelogConfig {
    pub max_segment_bytes: u64,
    /// Literal delta paths (`root['key']`) excluded together with their children.
    pub exclude_paths: Vec<String>,
    /// Regex patterns searched against rendered delta paths.
    pub exclude_patterns: Vec<String>,
}

impl Default for ChangelogConfig {
    fn default() -> Self {
        Self {
            max_segment_bytes: MAX_CHANGELOG_FILE_SIZE,
            exclude_paths: EXCLUDE_FROM_DELTAS.iter().map(|p| p.to_string()).collect(),
            exclude_patterns: Vec::new(),
        }
    }
}

impl ChangelogConfig {
    /// Compile the exclusion lists into a policy.
    pub fn policy(&self) -> Result<ExclusionPolicy> {
        let patterns = self
            .exclude_patterns
            .iter()
            .map(|p| Regex::new(p).map_err(|e| Error::Graph(format!("invalid exclusion pattern {p:?}: {e}"))))
            .collect::<Result<Vec<_>>>()?;
        Ok(ExclusionPolicy::new(self.exclude_paths.clone(), patterns))
    }
}
