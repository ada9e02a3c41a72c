// Bundle download session — one transfer per manifest id, shared by every caller.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use super::cache::{sha256_hex, CacheKey, CacheRecord, CacheStore};
use super::manifest::Manifest;
use crate::config::PROGRESS_CHANNEL_CAPACITY;
use crate::error::{UpdateError, UpdateResult};
use crate::source::traits::{BundleSource, ProgressFn, Transport};

/// Upper bound on the buffer reserved up front from a declared content length.
const MAX_PREALLOC_BYTES: u64 = 64 * 1024 * 1024;

/// Cumulative progress of one bundle download.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadProgress {
    pub bytes_received: u64,
    /// `None` when the origin did not declare a length.
    pub bytes_expected: Option<u64>,
}

/// A verified bundle together with the manifest it was resolved from.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleRecord {
    manifest: Manifest,
    #[serde(skip)]
    content: Bytes,
    content_hash: String,
    downloaded_at: DateTime<Utc>,
}

impl BundleRecord {
    /// Rebuild a record from the cache, re-verifying the stored bytes.
    pub fn from_cache(manifest: Manifest, record: CacheRecord) -> Option<Self> {
        let actual = sha256_hex(&record.content);
        if !manifest.matches_hash(&actual) {
            warn!(
                "cached bundle for {} fails verification (expected {}, got {})",
                manifest.id(),
                manifest.bundle_hash(),
                actual
            );
            return None;
        }
        Some(Self {
            manifest,
            content: record.content,
            content_hash: actual,
            downloaded_at: record.fetched_at,
        })
    }

    fn to_cache_record(&self) -> CacheRecord {
        CacheRecord {
            content: self.content.clone(),
            fetched_at: self.downloaded_at,
            origin: self.manifest.bundle_url().to_string(),
            content_hash: self.content_hash.clone(),
        }
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn manifest_id(&self) -> &str {
        self.manifest.id()
    }

    pub fn content(&self) -> &Bytes {
        &self.content
    }

    pub fn content_hash(&self) -> &str {
        &self.content_hash
    }

    pub fn downloaded_at(&self) -> DateTime<Utc> {
        self.downloaded_at
    }

    pub fn len(&self) -> usize {
        self.content.len()
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }
}

type Outcome = Option<UpdateResult<BundleRecord>>;

/// Write lease for one manifest id. Observers subscribe to both channels.
struct InFlight {
    progress: broadcast::Sender<DownloadProgress>,
    outcome: watch::Sender<Outcome>,
}

type LeaseTable = Arc<Mutex<HashMap<String, Arc<InFlight>>>>;

/// Releases the lease and guarantees observers see a terminal outcome,
/// even if the transfer task unwinds.
struct LeaseRelease {
    leases: LeaseTable,
    manifest_id: String,
    inflight: Arc<InFlight>,
}

impl LeaseRelease {
    fn finish(self, result: UpdateResult<BundleRecord>) {
        self.release();
        self.inflight.outcome.send_replace(Some(result));
    }

    fn release(&self) {
        let mut leases = self.leases.lock();
        if let Some(current) = leases.get(&self.manifest_id) {
            if Arc::ptr_eq(current, &self.inflight) {
                leases.remove(&self.manifest_id);
            }
        }
    }
}

impl Drop for LeaseRelease {
    fn drop(&mut self) {
        self.release();
        self.inflight.outcome.send_if_modified(|outcome| {
            if outcome.is_some() {
                return false;
            }
            *outcome = Some(Err(UpdateError::Storage(
                "download task ended without a result".into(),
            )));
            true
        });
    }
}

pub struct DownloadSession {
    transport: Arc<dyn Transport>,
    cache: Arc<dyn CacheStore>,
    leases: LeaseTable,
}

impl DownloadSession {
    pub fn new(transport: Arc<dyn Transport>, cache: Arc<dyn CacheStore>) -> Self {
        Self {
            transport,
            cache,
            leases: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Whether a transfer for `manifest_id` currently holds the lease.
    pub fn is_in_flight(&self, manifest_id: &str) -> bool {
        self.leases.lock().contains_key(manifest_id)
    }

    /// Download, verify and persist the bundle named by `manifest`.
    ///
    /// A caller arriving while a transfer for the same manifest id is running
    /// attaches to it: progress from that point on and the same terminal result.
    /// The transfer itself runs detached, so dropping this future does not stop it.
    pub async fn download_bundle(
        &self,
        manifest: &Manifest,
        on_progress: &ProgressFn,
    ) -> UpdateResult<BundleRecord> {
        if let Some(record) = cached_bundle(self.cache.as_ref(), manifest).await? {
            debug!("bundle {} already cached", manifest.id());
            return Ok(record);
        }

        let (inflight, owner) = self.acquire_lease(manifest.id());
        let mut progress_rx = inflight.progress.subscribe();
        let mut outcome_rx = inflight.outcome.subscribe();

        if owner {
            info!("download lease acquired for {}", manifest.id());
            let release = LeaseRelease {
                leases: Arc::clone(&self.leases),
                manifest_id: manifest.id().to_string(),
                inflight: Arc::clone(&inflight),
            };
            let transport = Arc::clone(&self.transport);
            let cache = Arc::clone(&self.cache);
            let manifest = manifest.clone();
            tokio::spawn(async move {
                let result = transfer(
                    transport.as_ref(),
                    cache.as_ref(),
                    &manifest,
                    &release.inflight.progress,
                )
                .await;
                release.finish(result);
            });
        } else {
            info!("attaching to in-flight download for {}", manifest.id());
        }

        loop {
            tokio::select! {
                biased;
                received = progress_rx.recv() => match received {
                    Ok(progress) => on_progress(progress),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!("progress observer for {} skipped {} snapshots", manifest.id(), skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = outcome_rx.wait_for(Option::is_some) => break,
            }
        }

        // Deliver whatever progress was queued ahead of the terminal result.
        loop {
            match progress_rx.try_recv() {
                Ok(progress) => on_progress(progress),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }

        let outcome = outcome_rx.borrow().clone();
        outcome.unwrap_or_else(|| {
            Err(UpdateError::Storage(
                "download finished without a result".into(),
            ))
        })
    }

    /// Atomic check-and-insert on the lease table.
    fn acquire_lease(&self, manifest_id: &str) -> (Arc<InFlight>, bool) {
        let mut leases = self.leases.lock();
        if let Some(existing) = leases.get(manifest_id) {
            return (Arc::clone(existing), false);
        }
        let (progress, _) = broadcast::channel(PROGRESS_CHANNEL_CAPACITY);
        let (outcome, _) = watch::channel(None);
        let inflight = Arc::new(InFlight { progress, outcome });
        leases.insert(manifest_id.to_string(), Arc::clone(&inflight));
        (inflight, true)
    }
}

/// Verified bundle for `manifest` from the cache, if one is stored.
async fn cached_bundle(
    cache: &dyn CacheStore,
    manifest: &Manifest,
) -> UpdateResult<Option<BundleRecord>> {
    let key = CacheKey::Bundle(manifest.id().to_string());
    Ok(cache
        .get(&key)
        .await?
        .and_then(|record| BundleRecord::from_cache(manifest.clone(), record)))
}

async fn transfer(
    transport: &dyn Transport,
    cache: &dyn CacheStore,
    manifest: &Manifest,
    progress: &broadcast::Sender<DownloadProgress>,
) -> UpdateResult<BundleRecord> {
    // A previous lease holder may have persisted it between our cache check and acquisition.
    if let Some(record) = cached_bundle(cache, manifest).await? {
        return Ok(record);
    }

    let mut body = transport.fetch(manifest.bundle_url()).await?;
    let expected = body.content_length();
    let mut hasher = Sha256::new();
    let mut buf = BytesMut::with_capacity(expected.unwrap_or(0).min(MAX_PREALLOC_BYTES) as usize);

    while let Some(chunk) = body.next_chunk().await? {
        if chunk.is_empty() {
            continue;
        }
        hasher.update(&chunk);
        buf.extend_from_slice(&chunk);
        // No receivers just means nobody is watching progress.
        let _ = progress.send(DownloadProgress {
            bytes_received: buf.len() as u64,
            bytes_expected: expected,
        });
    }

    let actual = hex::encode(hasher.finalize());
    if !manifest.matches_hash(&actual) {
        warn!(
            "bundle {} integrity mismatch: expected {} got {} ({} bytes discarded)",
            manifest.id(),
            manifest.bundle_hash(),
            actual,
            buf.len()
        );
        return Err(UpdateError::Integrity {
            expected: manifest.bundle_hash().to_string(),
            actual,
        });
    }

    let record = BundleRecord {
        manifest: manifest.clone(),
        content: buf.freeze(),
        content_hash: actual,
        downloaded_at: Utc::now(),
    };
    cache
        .put(
            &CacheKey::Bundle(manifest.id().to_string()),
            record.to_cache_record(),
        )
        .await?;
    info!(
        "bundle {} downloaded ({} bytes)",
        manifest.id(),
        record.len()
    );
    Ok(record)
}

#[async_trait]
impl BundleSource for DownloadSession {
    async fn request_bundle(
        &self,
        manifest: &Manifest,
        on_progress: &ProgressFn,
    ) -> UpdateResult<BundleRecord> {
        self.download_bundle(manifest, on_progress).await
    }
}
