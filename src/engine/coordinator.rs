// Update cycle state machine — check, download, and hand the result to the host.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use super::cache::{CacheKey, CacheRecord, CacheStore};
use super::downloader::{BundleRecord, DownloadProgress, DownloadSession};
use super::events::{EventBroadcaster, Subscription, SubscriptionId, UpdateEvent};
use super::fetcher::ManifestFetcher;
use super::manifest::{CacheBehavior, Manifest};
use super::stats::{StatsCollector, StatsSnapshot};
use crate::config::{CheckAutomatically, UpdatesConfig};
use crate::error::{UpdateError, UpdateResult};
use crate::source::traits::{BundleSource, ManifestSource, Transport, UpdatesHost};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleState {
    Idle = 0,
    Checking = 1,
    NoUpdate = 2,
    Downloading = 3,
    Downloaded = 4,
    DownloadFailed = 5,
    CheckFailed = 6,
}

impl CycleState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Checking,
            2 => Self::NoUpdate,
            3 => Self::Downloading,
            4 => Self::Downloaded,
            5 => Self::DownloadFailed,
            6 => Self::CheckFailed,
            _ => Self::Idle,
        }
    }
}

/// Successful result of [`UpdateCoordinator::check_for_update`].
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOutcome {
    /// Nothing newer than the active or pending bundle.
    NoUpdate,
    /// A new bundle was downloaded and is now pending adoption.
    Downloaded(BundleRecord),
}

/// Owns the cycle for its lifetime and returns the machine to `Idle` on every exit.
struct CycleGuard<'a> {
    state: &'a AtomicU8,
}

impl CycleGuard<'_> {
    fn set(&self, next: CycleState) {
        debug!("update cycle -> {:?}", next);
        self.state.store(next as u8, Ordering::Release);
    }
}

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        self.state.store(CycleState::Idle as u8, Ordering::Release);
    }
}

pub struct UpdateCoordinator {
    config: UpdatesConfig,
    manifests: Arc<dyn ManifestSource>,
    bundles: Arc<dyn BundleSource>,
    cache: Arc<dyn CacheStore>,
    events: Arc<EventBroadcaster>,
    host: Arc<dyn UpdatesHost>,
    state: AtomicU8,
    active: RwLock<Option<BundleRecord>>,
    pending: RwLock<Option<BundleRecord>>,
    stats: StatsCollector,
}

impl std::fmt::Debug for UpdateCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdateCoordinator")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl UpdateCoordinator {
    /// Build a coordinator using the stock manifest fetcher and download session.
    pub fn new(
        config: UpdatesConfig,
        cache: Arc<dyn CacheStore>,
        transport: Arc<dyn Transport>,
        events: Arc<EventBroadcaster>,
        host: Arc<dyn UpdatesHost>,
    ) -> Self {
        let manifests = Arc::new(ManifestFetcher::new(
            config.manifest_url.clone(),
            Arc::clone(&transport),
            Arc::clone(&cache),
        ));
        let bundles = Arc::new(DownloadSession::new(transport, Arc::clone(&cache)));
        Self::with_sources(config, cache, manifests, bundles, events, host)
    }

    /// Build a coordinator with host-supplied manifest and bundle retrieval.
    pub fn with_sources(
        config: UpdatesConfig,
        cache: Arc<dyn CacheStore>,
        manifests: Arc<dyn ManifestSource>,
        bundles: Arc<dyn BundleSource>,
        events: Arc<EventBroadcaster>,
        host: Arc<dyn UpdatesHost>,
    ) -> Self {
        Self {
            config,
            manifests,
            bundles,
            cache,
            events,
            host,
            state: AtomicU8::new(CycleState::Idle as u8),
            active: RwLock::new(None),
            pending: RwLock::new(None),
            stats: StatsCollector::new(),
        }
    }

    pub fn state(&self) -> CycleState {
        CycleState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn events(&self) -> &Arc<EventBroadcaster> {
        &self.events
    }

    pub fn subscribe(&self) -> Subscription {
        self.events.subscribe()
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.events.unsubscribe(id)
    }

    /// Bundle the host is currently running.
    pub fn active_bundle(&self) -> Option<BundleRecord> {
        self.active.read().clone()
    }

    /// Downloaded bundle waiting for the host to adopt it.
    pub fn pending_bundle(&self) -> Option<BundleRecord> {
        self.pending.read().clone()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    fn begin_cycle(&self) -> UpdateResult<CycleGuard<'_>> {
        self.state
            .compare_exchange(
                CycleState::Idle as u8,
                CycleState::Checking as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map_err(|_| UpdateError::Busy)?;
        Ok(CycleGuard { state: &self.state })
    }

    /// Run one update cycle under `behavior`.
    ///
    /// Rejected with `Busy` while another cycle is checking or downloading; the
    /// running cycle and its event stream are left untouched in that case.
    /// The terminal event is published while the cycle still owns the machine,
    /// so no event of a later cycle can reach a subscriber ahead of it.
    pub async fn check_for_update(&self, behavior: CacheBehavior) -> UpdateResult<UpdateOutcome> {
        let cycle = match self.begin_cycle() {
            Ok(cycle) => cycle,
            Err(e) => {
                self.stats.record_busy();
                debug!("update check rejected: cycle in state {:?}", self.state());
                return Err(e);
            }
        };
        let result = self.run_cycle(&cycle, behavior).await;

        match &result {
            Ok(UpdateOutcome::NoUpdate) => self.events.publish(UpdateEvent::NotAvailable),
            Ok(UpdateOutcome::Downloaded(record)) => self
                .events
                .publish(UpdateEvent::DownloadFinished(record.clone())),
            Err(e) => self.events.publish(UpdateEvent::error(e)),
        }
        drop(cycle);
        result
    }

    async fn run_cycle(
        &self,
        cycle: &CycleGuard<'_>,
        behavior: CacheBehavior,
    ) -> UpdateResult<UpdateOutcome> {
        self.stats.record_check();
        info!("update check started behavior={:?}", behavior);

        let manifest = match self.manifests.request_manifest(behavior).await {
            Ok(manifest) => manifest,
            Err(UpdateError::NotAvailable) => return Ok(self.no_update(cycle)),
            Err(e) => {
                cycle.set(CycleState::CheckFailed);
                return Err(self.failed(e));
            }
        };

        if self.is_current(&manifest) {
            debug!("manifest {} is already active or pending", manifest.id());
            return Ok(self.no_update(cycle));
        }

        cycle.set(CycleState::Downloading);
        self.stats.record_download_started();
        self.events.publish(UpdateEvent::DownloadStart);

        let events = Arc::clone(&self.events);
        let on_progress = move |progress: DownloadProgress| {
            events.publish(UpdateEvent::DownloadProgress(progress));
        };

        match self.bundles.request_bundle(&manifest, &on_progress).await {
            Ok(record) => {
                cycle.set(CycleState::Downloaded);
                self.stats.record_download_completed(record.len() as u64);
                *self.pending.write() = Some(record.clone());
                info!(
                    "update {} downloaded, pending adoption ({} bytes)",
                    record.manifest_id(),
                    record.len()
                );
                Ok(UpdateOutcome::Downloaded(record))
            }
            Err(e) => {
                cycle.set(CycleState::DownloadFailed);
                Err(self.failed(e))
            }
        }
    }

    fn is_current(&self, manifest: &Manifest) -> bool {
        let matches = |slot: &RwLock<Option<BundleRecord>>| {
            slot.read()
                .as_ref()
                .is_some_and(|record| record.manifest_id() == manifest.id())
        };
        matches(&self.active) || matches(&self.pending)
    }

    fn no_update(&self, cycle: &CycleGuard<'_>) -> UpdateOutcome {
        cycle.set(CycleState::NoUpdate);
        self.stats.record_no_update();
        UpdateOutcome::NoUpdate
    }

    fn failed(&self, err: UpdateError) -> UpdateError {
        warn!("update cycle failed: {}", err);
        self.stats.record_failure();
        err
    }

    /// Promote the pending bundle to active and remember it across restarts.
    pub async fn adopt_pending(&self) -> UpdateResult<Option<BundleRecord>> {
        let taken = { self.pending.write().take() };
        let Some(record) = taken else {
            return Ok(None);
        };

        let pointer = CacheRecord::new(
            Bytes::from(record.manifest().to_vec()?),
            record.manifest().bundle_url(),
        );
        if let Err(e) = self.cache.put(&CacheKey::ActiveBundle, pointer).await {
            warn!("could not persist active bundle {}: {}", record.manifest_id(), e);
            let mut pending = self.pending.write();
            if pending.is_none() {
                *pending = Some(record);
            }
            return Err(e);
        }

        info!("bundle {} adopted", record.manifest_id());
        *self.active.write() = Some(record.clone());
        Ok(Some(record))
    }

    /// Adopt any pending bundle and ask the host to restart on it.
    pub async fn reload(&self) -> UpdateResult<()> {
        self.adopt_pending().await?;
        self.host.reload();
        Ok(())
    }

    /// Ask the host to restart from the cached bundle without adopting anything.
    pub fn reload_from_cache(&self) {
        self.host.reload_from_cache();
    }

    /// Load the previously adopted bundle from the cache, verifying it.
    pub async fn restore_active(&self) -> UpdateResult<Option<BundleRecord>> {
        let Some(pointer) = self.cache.get(&CacheKey::ActiveBundle).await? else {
            return Ok(None);
        };
        let manifest = match Manifest::from_slice(&pointer.content) {
            Ok(manifest) => manifest,
            Err(e) => {
                warn!("active bundle pointer unreadable: {}", e);
                return Ok(None);
            }
        };
        let Some(stored) = self
            .cache
            .get(&CacheKey::Bundle(manifest.id().to_string()))
            .await?
        else {
            warn!("active bundle {} missing from cache", manifest.id());
            return Ok(None);
        };
        let Some(record) = BundleRecord::from_cache(manifest, stored) else {
            return Ok(None);
        };

        info!("restored active bundle {}", record.manifest_id());
        *self.active.write() = Some(record.clone());
        Ok(Some(record))
    }

    /// Start-up entry point: restore the active bundle, then check if configured to.
    pub async fn launch(&self) -> UpdateResult<Option<UpdateOutcome>> {
        self.restore_active().await?;
        match self.config.check_automatically {
            CheckAutomatically::OnLoad => {
                let behavior = self.config.launch_cache_behavior;
                Ok(Some(self.check_for_update(behavior).await?))
            }
            CheckAutomatically::Never => Ok(None),
        }
    }
}
