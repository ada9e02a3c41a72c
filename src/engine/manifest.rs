// Update manifest model and its JSON wire format.

use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::SHA256_HEX_LEN;
use crate::error::{UpdateError, UpdateResult};

/// Policy controlling where a manifest may be resolved from.
///
/// There is deliberately no `Default`: every resolution names its policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CacheBehavior {
    /// Try the network first and fall back to the cached manifest when offline.
    UseCacheThenNetwork,
    /// Always go to the network; the cache is never consulted.
    NetworkOnly,
    /// Never touch the network.
    CacheOnly,
}

/// Versioned descriptor naming the bundle an application should run.
///
/// Unknown wire fields are ignored so newer origins stay readable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    id: String,
    bundle_url: String,
    bundle_hash: String,
    #[serde(default)]
    metadata: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    published_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sdk_version: Option<String>,
}

impl Manifest {
    /// Build a manifest in code. The same validation as the wire path applies.
    pub fn new(
        id: impl Into<String>,
        bundle_url: impl Into<String>,
        bundle_hash: impl Into<String>,
    ) -> UpdateResult<Self> {
        let manifest = Self {
            id: id.into(),
            bundle_url: bundle_url.into(),
            bundle_hash: bundle_hash.into(),
            metadata: Map::new(),
            published_time: None,
            sdk_version: None,
        };
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Parse and validate a manifest document received from an origin or the cache.
    pub fn from_slice(raw: &[u8]) -> UpdateResult<Self> {
        let manifest: Self = serde_json::from_slice(raw)
            .map_err(|e| UpdateError::InvalidManifest(e.to_string()))?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn to_vec(&self) -> UpdateResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| UpdateError::InvalidManifest(e.to_string()))
    }

    fn validate(&self) -> UpdateResult<()> {
        if self.id.trim().is_empty() {
            return Err(UpdateError::InvalidManifest("empty manifest id".into()));
        }
        Url::parse(&self.bundle_url).map_err(|e| {
            UpdateError::InvalidManifest(format!("bad bundleUrl {:?}: {}", self.bundle_url, e))
        })?;
        let hash_ok = self.bundle_hash.len() == SHA256_HEX_LEN
            && self.bundle_hash.chars().all(|c| c.is_ascii_hexdigit());
        if !hash_ok {
            return Err(UpdateError::InvalidManifest(format!(
                "bundleHash {:?} is not a hex sha-256 digest",
                self.bundle_hash
            )));
        }
        Ok(())
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn bundle_url(&self) -> &str {
        &self.bundle_url
    }

    pub fn bundle_hash(&self) -> &str {
        &self.bundle_hash
    }

    pub fn metadata(&self) -> &Map<String, Value> {
        &self.metadata
    }

    pub fn published_time(&self) -> Option<&str> {
        self.published_time.as_deref()
    }

    pub fn sdk_version(&self) -> Option<&str> {
        self.sdk_version.as_deref()
    }

    /// Whether `digest` (hex) matches the declared bundle hash.
    pub fn matches_hash(&self, digest: &str) -> bool {
        self.bundle_hash.eq_ignore_ascii_case(digest)
    }
}
