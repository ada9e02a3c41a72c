// Scripted transport and host doubles shared by the integration tests.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::Semaphore;

use ota_update_engine::engine::cache::sha256_hex;
use ota_update_engine::{BodyStream, Manifest, Transport, TransportError, UpdatesHost};

pub const MANIFEST_URL: &str = "https://updates.example.com/manifest";

#[derive(Clone)]
enum Reply {
    Body {
        chunks: Vec<Bytes>,
        declared_len: Option<u64>,
        fail_after: Option<usize>,
        gate: Option<Arc<Semaphore>>,
    },
    Fail(TransportError),
}

/// In-memory transport answering from a per-URL script and counting calls.
#[derive(Default)]
pub struct ScriptedTransport {
    routes: Mutex<HashMap<String, Reply>>,
    calls: Mutex<HashMap<String, usize>>,
}

fn split(body: &[u8], chunk_size: usize) -> Vec<Bytes> {
    body.chunks(chunk_size.max(1))
        .map(Bytes::copy_from_slice)
        .collect()
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn serve(&self, url: &str, body: &[u8], chunk_size: usize) {
        self.routes.lock().insert(
            url.to_string(),
            Reply::Body {
                chunks: split(body, chunk_size),
                declared_len: Some(body.len() as u64),
                fail_after: None,
                gate: None,
            },
        );
    }

    /// Serve without a declared content length.
    pub fn serve_unsized(&self, url: &str, body: &[u8], chunk_size: usize) {
        self.routes.lock().insert(
            url.to_string(),
            Reply::Body {
                chunks: split(body, chunk_size),
                declared_len: None,
                fail_after: None,
                gate: None,
            },
        );
    }

    /// Serve `body` while claiming `declared_len` in the response metadata.
    pub fn serve_declaring(&self, url: &str, body: &[u8], chunk_size: usize, declared_len: Option<u64>) {
        self.routes.lock().insert(
            url.to_string(),
            Reply::Body {
                chunks: split(body, chunk_size),
                declared_len,
                fail_after: None,
                gate: None,
            },
        );
    }

    /// Serve `body`, holding the first chunk until the returned gate gets a permit.
    pub fn serve_gated(&self, url: &str, body: &[u8], chunk_size: usize) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        self.routes.lock().insert(
            url.to_string(),
            Reply::Body {
                chunks: split(body, chunk_size),
                declared_len: Some(body.len() as u64),
                fail_after: None,
                gate: Some(Arc::clone(&gate)),
            },
        );
        gate
    }

    /// Serve the first `after` chunks of `body`, then break the stream.
    pub fn serve_interrupted(&self, url: &str, body: &[u8], chunk_size: usize, after: usize) {
        self.routes.lock().insert(
            url.to_string(),
            Reply::Body {
                chunks: split(body, chunk_size),
                declared_len: Some(body.len() as u64),
                fail_after: Some(after),
                gate: None,
            },
        );
    }

    pub fn fail(&self, url: &str, err: TransportError) {
        self.routes.lock().insert(url.to_string(), Reply::Fail(err));
    }

    pub fn serve_manifest(&self, manifest_json: &str) {
        self.serve(MANIFEST_URL, manifest_json.as_bytes(), 4096);
    }

    pub fn go_offline(&self, url: &str) {
        self.fail(url, TransportError::Connect("network unreachable".into()));
    }

    pub fn calls(&self, url: &str) -> usize {
        self.calls.lock().get(url).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().values().sum()
    }
}

struct ScriptedBody {
    chunks: VecDeque<Bytes>,
    declared_len: Option<u64>,
    fail_after: Option<usize>,
    gate: Option<Arc<Semaphore>>,
    sent: usize,
}

#[async_trait]
impl BodyStream for ScriptedBody {
    fn content_length(&self) -> Option<u64> {
        self.declared_len
    }

    async fn next_chunk(&mut self) -> Result<Option<Bytes>, TransportError> {
        if let Some(gate) = self.gate.take() {
            let _permit = gate
                .acquire()
                .await
                .map_err(|e| TransportError::Body(e.to_string()))?;
        }
        if self.fail_after == Some(self.sent) {
            return Err(TransportError::Body("connection reset".into()));
        }
        self.sent += 1;
        Ok(self.chunks.pop_front())
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn fetch(&self, url: &str) -> Result<Box<dyn BodyStream>, TransportError> {
        *self.calls.lock().entry(url.to_string()).or_insert(0) += 1;
        let reply = self.routes.lock().get(url).cloned();
        match reply {
            Some(Reply::Body {
                chunks,
                declared_len,
                fail_after,
                gate,
            }) => Ok(Box::new(ScriptedBody {
                chunks: chunks.into(),
                declared_len,
                fail_after,
                gate,
                sent: 0,
            })),
            Some(Reply::Fail(err)) => Err(err),
            None => Err(TransportError::Status {
                status: 404,
                url: url.to_string(),
            }),
        }
    }
}

/// Host double counting reload requests.
#[derive(Default)]
pub struct RecordingHost {
    pub reloads: AtomicUsize,
    pub reloads_from_cache: AtomicUsize,
}

impl RecordingHost {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn reload_count(&self) -> usize {
        self.reloads.load(Ordering::SeqCst)
    }

    pub fn reload_from_cache_count(&self) -> usize {
        self.reloads_from_cache.load(Ordering::SeqCst)
    }
}

impl UpdatesHost for RecordingHost {
    fn reload(&self) {
        self.reloads.fetch_add(1, Ordering::SeqCst);
    }

    fn reload_from_cache(&self) {
        self.reloads_from_cache.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn bundle_url(id: &str) -> String {
    format!("https://cdn.example.com/bundles/{}.js", id)
}

/// Deterministic bundle content for a manifest id.
pub fn bundle_bytes(id: &str, len: usize) -> Vec<u8> {
    let seed = id.bytes().fold(7u8, |acc, b| acc.wrapping_mul(31).wrapping_add(b));
    (0..len).map(|i| seed.wrapping_add((i % 251) as u8)).collect()
}

/// Manifest document for `id` declaring the hash of `bundle`.
pub fn manifest_json(id: &str, bundle: &[u8]) -> String {
    format!(
        r#"{{"id":"{}","bundleUrl":"{}","bundleHash":"{}","metadata":{{"channel":"test"}},"futureField":true}}"#,
        id,
        bundle_url(id),
        sha256_hex(bundle)
    )
}

pub fn manifest_for(id: &str, bundle: &[u8]) -> Manifest {
    Manifest::new(id, bundle_url(id), sha256_hex(bundle)).unwrap()
}

/// Poll `cond` until it holds, failing the test after a second.
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}
