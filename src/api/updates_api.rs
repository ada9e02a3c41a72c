use std::path::Path;
use std::sync::{Arc, OnceLock};

use anyhow::{ensure, Result};

use crate::config::UpdatesConfig;
use crate::engine::cache::DiskCacheStore;
use crate::engine::coordinator::UpdateCoordinator;
use crate::engine::events::EventBroadcaster;
use crate::error::{UpdateError, UpdateResult};
use crate::source::http_transport::HttpTransport;
use crate::source::traits::UpdatesHost;

static COORDINATOR: OnceLock<Arc<UpdateCoordinator>> = OnceLock::new();

/// Register the process-wide coordinator. Only the first registration wins;
/// later ones fail with [`UpdateError::AlreadyInstalled`].
pub fn install(coordinator: Arc<UpdateCoordinator>) -> UpdateResult<Arc<UpdateCoordinator>> {
    let mut installed = false;
    let current = COORDINATOR.get_or_init(|| {
        installed = true;
        coordinator
    });
    if installed {
        Ok(Arc::clone(current))
    } else {
        Err(UpdateError::AlreadyInstalled)
    }
}

/// The installed coordinator, if any.
pub fn updates() -> Option<Arc<UpdateCoordinator>> {
    COORDINATOR.get().cloned()
}

/// Build the stock coordinator (disk cache + HTTP transport) from `config` and install it.
pub fn init_updates(
    config: UpdatesConfig,
    host: Arc<dyn UpdatesHost>,
) -> Result<Arc<UpdateCoordinator>> {
    ensure!(!config.manifest_url.is_empty(), "manifestUrl is not configured");
    ensure!(!config.cache_dir.is_empty(), "cacheDir is not configured");

    let cache = Arc::new(DiskCacheStore::open(Path::new(&config.cache_dir))?);
    let transport = Arc::new(HttpTransport::new(config.request_headers.clone()));
    let events = Arc::new(EventBroadcaster::new());
    let coordinator = UpdateCoordinator::new(config, cache, transport, events, host);
    Ok(install(Arc::new(coordinator))?)
}
