// Update cycle counters — checks, downloads, failures and bytes fetched.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

#[derive(Debug, Clone, PartialEq)]
pub struct StatsSnapshot {
    pub checks: u64,
    pub no_update: u64,
    pub downloads_started: u64,
    pub downloads_completed: u64,
    pub failures: u64,
    pub busy_rejections: u64,
    pub bytes_downloaded: u64,
    pub last_check_at: Option<DateTime<Utc>>,
}

pub struct StatsCollector {
    checks: AtomicU64,
    no_update: AtomicU64,
    downloads_started: AtomicU64,
    downloads_completed: AtomicU64,
    failures: AtomicU64,
    busy_rejections: AtomicU64,
    bytes_downloaded: AtomicU64,
    last_check_at: Mutex<Option<DateTime<Utc>>>,
}

impl StatsCollector {
    pub fn new() -> Self {
        Self {
            checks: AtomicU64::new(0),
            no_update: AtomicU64::new(0),
            downloads_started: AtomicU64::new(0),
            downloads_completed: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            busy_rejections: AtomicU64::new(0),
            bytes_downloaded: AtomicU64::new(0),
            last_check_at: Mutex::new(None),
        }
    }

    pub fn record_check(&self) {
        self.checks.fetch_add(1, Ordering::Relaxed);
        *self.last_check_at.lock() = Some(Utc::now());
    }

    pub fn record_no_update(&self) {
        self.no_update.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_download_started(&self) {
        self.downloads_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_download_completed(&self, bytes: u64) {
        self.downloads_completed.fetch_add(1, Ordering::Relaxed);
        self.bytes_downloaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_busy(&self) {
        self.busy_rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            checks: self.checks.load(Ordering::Relaxed),
            no_update: self.no_update.load(Ordering::Relaxed),
            downloads_started: self.downloads_started.load(Ordering::Relaxed),
            downloads_completed: self.downloads_completed.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            busy_rejections: self.busy_rejections.load(Ordering::Relaxed),
            bytes_downloaded: self.bytes_downloaded.load(Ordering::Relaxed),
            last_check_at: *self.last_check_at.lock(),
        }
    }
}

impl Default for StatsCollector {
    fn default() -> Self {
        Self::new()
    }
}
