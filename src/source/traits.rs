use async_trait::async_trait;
use bytes::{Bytes, BytesMut};

use crate::engine::downloader::{BundleRecord, DownloadProgress};
use crate::engine::manifest::{CacheBehavior, Manifest};
use crate::error::{TransportError, UpdateResult};

/// Callback receiving progress snapshots while a bundle streams in.
pub type ProgressFn = dyn Fn(DownloadProgress) + Send + Sync;

/// Incrementally readable response body.
#[async_trait]
pub trait BodyStream: Send {
    /// Total body length if the response declared one.
    fn content_length(&self) -> Option<u64>;

    /// Next chunk of the body, `None` once the body is exhausted.
    async fn next_chunk(&mut self) -> Result<Option<Bytes>, TransportError>;
}

/// Network transport used for manifests and bundles.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Box<dyn BodyStream>, TransportError>;

    /// Drain a whole response into memory, refusing anything over `max_bytes`.
    ///
    /// A declared length above the limit fails before any body is read.
    async fn fetch_all(&self, url: &str, max_bytes: u64) -> Result<Bytes, TransportError> {
        let too_large = || TransportError::TooLarge {
            limit: max_bytes,
            url: url.to_string(),
        };
        let mut body = self.fetch(url).await?;
        let declared = body.content_length();
        if declared.is_some_and(|len| len > max_bytes) {
            return Err(too_large());
        }

        let reserve = usize::try_from(declared.unwrap_or(0)).unwrap_or(0);
        let mut buf = BytesMut::with_capacity(reserve);
        while let Some(chunk) = body.next_chunk().await? {
            if (buf.len() + chunk.len()) as u64 > max_bytes {
                return Err(too_large());
            }
            buf.extend_from_slice(&chunk);
        }
        Ok(buf.freeze())
    }
}

/// Host-side reload capability. The engine never restarts the host on its own.
pub trait UpdatesHost: Send + Sync {
    /// Restart execution, picking up the newly adopted bundle.
    fn reload(&self);

    /// Restart execution from the bundle already in the cache.
    fn reload_from_cache(&self);
}

/// Resolves a manifest under a cache policy.
#[async_trait]
pub trait ManifestSource: Send + Sync {
    async fn request_manifest(&self, behavior: CacheBehavior) -> UpdateResult<Manifest>;
}

/// Produces the verified bundle for a manifest, streaming progress.
#[async_trait]
pub trait BundleSource: Send + Sync {
    async fn request_bundle(
        &self,
        manifest: &Manifest,
        on_progress: &ProgressFn,
    ) -> UpdateResult<BundleRecord>;
}
