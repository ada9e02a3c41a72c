// Manifest resolution under a cache-behavior policy.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, info, warn};

use super::cache::{CacheKey, CacheRecord, CacheStore};
use super::manifest::{CacheBehavior, Manifest};
use crate::config::MAX_MANIFEST_BYTES;
use crate::error::{TransportError, UpdateError, UpdateResult};
use crate::source::traits::{ManifestSource, Transport};

pub struct ManifestFetcher {
    manifest_url: String,
    transport: Arc<dyn Transport>,
    cache: Arc<dyn CacheStore>,
}

impl ManifestFetcher {
    pub fn new(
        manifest_url: impl Into<String>,
        transport: Arc<dyn Transport>,
        cache: Arc<dyn CacheStore>,
    ) -> Self {
        Self {
            manifest_url: manifest_url.into(),
            transport,
            cache,
        }
    }

    /// Resolve the current manifest according to `behavior`.
    ///
    /// `UseCacheThenNetwork` asks the network first so a reachable origin is
    /// never shadowed by a stale cache; only transport failures fall back.
    pub async fn resolve_manifest(&self, behavior: CacheBehavior) -> UpdateResult<Manifest> {
        debug!("resolving manifest behavior={:?}", behavior);
        match behavior {
            CacheBehavior::CacheOnly => self.cached().await?.ok_or(UpdateError::NotAvailable),
            CacheBehavior::NetworkOnly => self.fetch_remote().await,
            CacheBehavior::UseCacheThenNetwork => match self.fetch_remote().await {
                Ok(manifest) => Ok(manifest),
                Err(UpdateError::Network(e)) => {
                    warn!("manifest fetch failed, trying cache: {}", e);
                    match self.cached().await? {
                        Some(manifest) => {
                            info!("serving cached manifest {}", manifest.id());
                            Ok(manifest)
                        }
                        None => Err(UpdateError::NotAvailable),
                    }
                }
                Err(e) => Err(e),
            },
        }
    }

    /// Most recently persisted manifest, if any.
    pub async fn cached(&self) -> UpdateResult<Option<Manifest>> {
        let Some(record) = self.cache.get(&CacheKey::LatestManifest).await? else {
            return Ok(None);
        };
        match Manifest::from_slice(&record.content) {
            Ok(manifest) => Ok(Some(manifest)),
            Err(e) => {
                warn!("cached manifest unreadable, ignoring: {}", e);
                Ok(None)
            }
        }
    }

    async fn fetch_remote(&self) -> UpdateResult<Manifest> {
        let body = match self
            .transport
            .fetch_all(&self.manifest_url, MAX_MANIFEST_BYTES)
            .await
        {
            Ok(body) => body,
            Err(TransportError::TooLarge { limit, .. }) => {
                warn!("manifest from {} is larger than {} bytes", self.manifest_url, limit);
                return Err(UpdateError::InvalidManifest(format!(
                    "document exceeds {} bytes",
                    limit
                )));
            }
            Err(e) => return Err(e.into()),
        };
        let manifest = Manifest::from_slice(&body)?;

        let record = CacheRecord::new(Bytes::from(manifest.to_vec()?), self.manifest_url.as_str());
        self.cache
            .put(&CacheKey::Manifest(manifest.id().to_string()), record.clone())
            .await?;
        self.cache.put(&CacheKey::LatestManifest, record).await?;

        info!(
            "fetched manifest {} bundle={} from {}",
            manifest.id(),
            manifest.bundle_url(),
            self.manifest_url
        );
        Ok(manifest)
    }
}

#[async_trait]
impl ManifestSource for ManifestFetcher {
    async fn request_manifest(&self, behavior: CacheBehavior) -> UpdateResult<Manifest> {
        self.resolve_manifest(behavior).await
    }
}
