mod common;

use std::sync::Arc;

use ota_update_engine::config::MAX_MANIFEST_BYTES;
use ota_update_engine::{
    CacheBehavior, CacheKey, CacheStore, ManifestFetcher, MemoryCacheStore, TransportError,
    UpdateError,
};

use common::{bundle_bytes, manifest_json, ScriptedTransport, MANIFEST_URL};

fn fetcher(transport: &Arc<ScriptedTransport>, cache: &Arc<MemoryCacheStore>) -> ManifestFetcher {
    ManifestFetcher::new(MANIFEST_URL, transport.clone(), cache.clone())
}

#[tokio::test]
async fn test_cache_only_with_empty_cache_is_not_available_without_network() {
    let transport = ScriptedTransport::new();
    transport.serve_manifest(&manifest_json("m1", &bundle_bytes("m1", 64)));
    let cache = Arc::new(MemoryCacheStore::new());

    let result = fetcher(&transport, &cache)
        .resolve_manifest(CacheBehavior::CacheOnly)
        .await;

    assert_eq!(result, Err(UpdateError::NotAvailable));
    assert_eq!(transport.total_calls(), 0);
}

#[tokio::test]
async fn test_network_only_persists_manifest() {
    let transport = ScriptedTransport::new();
    transport.serve_manifest(&manifest_json("m1", &bundle_bytes("m1", 64)));
    let cache = Arc::new(MemoryCacheStore::new());
    let fetcher = fetcher(&transport, &cache);

    let manifest = fetcher
        .resolve_manifest(CacheBehavior::NetworkOnly)
        .await
        .unwrap();
    assert_eq!(manifest.id(), "m1");
    assert_eq!(manifest.metadata()["channel"], "test");
    assert!(cache.has(&CacheKey::LatestManifest).await.unwrap());
    assert!(cache.has(&CacheKey::Manifest("m1".into())).await.unwrap());

    // The persisted copy now satisfies CacheOnly without another request.
    let cached = fetcher
        .resolve_manifest(CacheBehavior::CacheOnly)
        .await
        .unwrap();
    assert_eq!(cached, manifest);
    assert_eq!(transport.calls(MANIFEST_URL), 1);
}

#[tokio::test]
async fn test_network_only_ignores_cache_when_offline() {
    let transport = ScriptedTransport::new();
    transport.serve_manifest(&manifest_json("m1", &bundle_bytes("m1", 64)));
    let cache = Arc::new(MemoryCacheStore::new());
    let fetcher = fetcher(&transport, &cache);
    fetcher
        .resolve_manifest(CacheBehavior::NetworkOnly)
        .await
        .unwrap();

    transport.go_offline(MANIFEST_URL);
    let result = fetcher.resolve_manifest(CacheBehavior::NetworkOnly).await;
    assert!(matches!(result, Err(UpdateError::Network(TransportError::Connect(_)))));
}

#[tokio::test]
async fn test_network_only_rejects_malformed_manifest() {
    let transport = ScriptedTransport::new();
    transport.serve_manifest(r#"{"id": "m1", "bundleUrl": 42}"#);
    let cache = Arc::new(MemoryCacheStore::new());

    let result = fetcher(&transport, &cache)
        .resolve_manifest(CacheBehavior::NetworkOnly)
        .await;

    assert!(matches!(result, Err(UpdateError::InvalidManifest(_))));
    assert!(!cache.has(&CacheKey::LatestManifest).await.unwrap());
}

#[tokio::test]
async fn test_use_cache_then_network_prefers_fresh_manifest() {
    let transport = ScriptedTransport::new();
    transport.serve_manifest(&manifest_json("m1", &bundle_bytes("m1", 64)));
    let cache = Arc::new(MemoryCacheStore::new());
    let fetcher = fetcher(&transport, &cache);
    fetcher
        .resolve_manifest(CacheBehavior::UseCacheThenNetwork)
        .await
        .unwrap();

    transport.serve_manifest(&manifest_json("m2", &bundle_bytes("m2", 64)));
    let manifest = fetcher
        .resolve_manifest(CacheBehavior::UseCacheThenNetwork)
        .await
        .unwrap();
    assert_eq!(manifest.id(), "m2");
    assert_eq!(transport.calls(MANIFEST_URL), 2);
}

#[tokio::test]
async fn test_use_cache_then_network_falls_back_when_offline() {
    let transport = ScriptedTransport::new();
    transport.serve_manifest(&manifest_json("m1", &bundle_bytes("m1", 64)));
    let cache = Arc::new(MemoryCacheStore::new());
    let fetcher = fetcher(&transport, &cache);
    fetcher
        .resolve_manifest(CacheBehavior::NetworkOnly)
        .await
        .unwrap();

    transport.fail(MANIFEST_URL, TransportError::Timeout("30s elapsed".into()));
    let manifest = fetcher
        .resolve_manifest(CacheBehavior::UseCacheThenNetwork)
        .await
        .unwrap();
    assert_eq!(manifest.id(), "m1");
}

#[tokio::test]
async fn test_use_cache_then_network_offline_and_empty() {
    let transport = ScriptedTransport::new();
    transport.go_offline(MANIFEST_URL);
    let cache = Arc::new(MemoryCacheStore::new());

    let result = fetcher(&transport, &cache)
        .resolve_manifest(CacheBehavior::UseCacheThenNetwork)
        .await;
    assert_eq!(result, Err(UpdateError::NotAvailable));
}

#[tokio::test]
async fn test_use_cache_then_network_surfaces_invalid_manifest() {
    let transport = ScriptedTransport::new();
    transport.serve_manifest(&manifest_json("m1", &bundle_bytes("m1", 64)));
    let cache = Arc::new(MemoryCacheStore::new());
    let fetcher = fetcher(&transport, &cache);
    fetcher
        .resolve_manifest(CacheBehavior::NetworkOnly)
        .await
        .unwrap();

    transport.serve_manifest("<html>captive portal</html>");
    let result = fetcher
        .resolve_manifest(CacheBehavior::UseCacheThenNetwork)
        .await;
    assert!(matches!(result, Err(UpdateError::InvalidManifest(_))));
}

#[tokio::test]
async fn test_oversized_declared_length_is_rejected_before_reading() {
    let transport = ScriptedTransport::new();
    transport.serve_declaring(MANIFEST_URL, b"{}", 4096, Some(u64::MAX));
    let cache = Arc::new(MemoryCacheStore::new());

    let result = fetcher(&transport, &cache)
        .resolve_manifest(CacheBehavior::NetworkOnly)
        .await;

    assert!(matches!(result, Err(UpdateError::InvalidManifest(_))));
    assert!(!cache.has(&CacheKey::LatestManifest).await.unwrap());
}

#[tokio::test]
async fn test_oversized_body_without_length_is_rejected() {
    let transport = ScriptedTransport::new();
    let padding = " ".repeat(MAX_MANIFEST_BYTES as usize);
    let manifest = manifest_json("m1", &bundle_bytes("m1", 64));
    let document = format!("{}{}", manifest, padding);
    transport.serve_declaring(MANIFEST_URL, document.as_bytes(), 64 * 1024, None);
    let cache = Arc::new(MemoryCacheStore::new());

    let result = fetcher(&transport, &cache)
        .resolve_manifest(CacheBehavior::UseCacheThenNetwork)
        .await;

    assert!(matches!(result, Err(UpdateError::InvalidManifest(_))));
    assert!(cache.is_empty());
}
