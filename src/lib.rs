//! Over-the-air update engine.
//!
//! Resolves the application's manifest under a [`CacheBehavior`] policy,
//! downloads and verifies the bundle it names, and reports every step to the
//! host through [`UpdateEvent`]s. Adopting a downloaded bundle (and reloading
//! onto it) stays the host's decision.

pub mod api;
pub mod config;
pub mod engine;
pub mod error;
pub mod source;

pub use config::{CheckAutomatically, UpdatesConfig};
pub use engine::cache::{CacheKey, CacheRecord, CacheStore, DiskCacheStore, MemoryCacheStore};
pub use engine::coordinator::{CycleState, UpdateCoordinator, UpdateOutcome};
pub use engine::downloader::{BundleRecord, DownloadProgress, DownloadSession};
pub use engine::events::{EventBroadcaster, Subscription, SubscriptionId, UpdateEvent};
pub use engine::fetcher::ManifestFetcher;
pub use engine::manifest::{CacheBehavior, Manifest};
pub use error::{ErrorKind, TransportError, UpdateError, UpdateResult};
pub use source::http_transport::HttpTransport;
pub use source::traits::{BodyStream, BundleSource, ManifestSource, Transport, UpdatesHost};
