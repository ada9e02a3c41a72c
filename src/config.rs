use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::engine::manifest::CacheBehavior;

/// Name of the host event channel update events are delivered on.
pub const UPDATES_EVENT_NAME: &str = "Exponent.nativeUpdatesEvent";

/// Progress snapshots buffered per in-flight download for attached observers.
pub const PROGRESS_CHANNEL_CAPACITY: usize = 256;

/// Largest manifest document accepted from the origin.
pub const MAX_MANIFEST_BYTES: u64 = 1024 * 1024;

/// Length of a hex-encoded SHA-256 digest.
pub const SHA256_HEX_LEN: usize = 64;

/// When the coordinator checks for an update on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CheckAutomatically {
    /// Check once as part of [`launch`](crate::engine::coordinator::UpdateCoordinator::launch).
    OnLoad,
    /// Only check when the host asks.
    Never,
}

/// Top-level configuration for the update engine.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UpdatesConfig {
    /// URL the manifest is fetched from.
    pub manifest_url: String,
    /// Directory used for the on-disk cache store.
    pub cache_dir: String,
    /// Extra headers sent with every manifest and bundle request.
    pub request_headers: HashMap<String, String>,
    pub check_automatically: CheckAutomatically,
    /// Policy used by the automatic check at launch.
    pub launch_cache_behavior: CacheBehavior,
}

impl Default for UpdatesConfig {
    fn default() -> Self {
        Self {
            manifest_url: String::new(),
            cache_dir: String::new(),
            request_headers: HashMap::new(),
            check_automatically: CheckAutomatically::OnLoad,
            launch_cache_behavior: CacheBehavior::UseCacheThenNetwork,
        }
    }
}

impl UpdatesConfig {
    /// Load a configuration from a JSON file. Missing fields take their defaults.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading updates config {}", path.display()))?;
        Self::from_json_str(&raw)
    }

    pub fn from_json_str(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw).context("parsing updates config")?;
        Ok(config)
    }
}
