// Key-value cache store for manifests and bundles, with atomic on-disk writes.

use std::collections::HashMap;
use std::fmt;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::error::{UpdateError, UpdateResult};

/// Hex-encoded SHA-256 of `data`.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Typed cache keys. `Display` gives the stable string form used on disk.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    /// The most recently resolved manifest.
    LatestManifest,
    Manifest(String),
    /// Verified bundle bytes for a manifest id.
    Bundle(String),
    /// Manifest of the bundle the host has adopted.
    ActiveBundle,
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LatestManifest => write!(f, "manifest/latest"),
            Self::Manifest(id) => write!(f, "manifest/{}", id),
            Self::Bundle(id) => write!(f, "bundle/{}", id),
            Self::ActiveBundle => write!(f, "bundle/active"),
        }
    }
}

/// Stored content plus the metadata recorded when it was fetched.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheRecord {
    pub content: Bytes,
    pub fetched_at: DateTime<Utc>,
    pub origin: String,
    pub content_hash: String,
}

impl CacheRecord {
    /// Record `content` fetched now from `origin`, hashing it.
    pub fn new(content: Bytes, origin: impl Into<String>) -> Self {
        let content_hash = sha256_hex(&content);
        Self {
            content,
            fetched_at: Utc::now(),
            origin: origin.into(),
            content_hash,
        }
    }
}

/// Durable key-value store. Safe for concurrent readers and writers; a reader
/// never observes a partially written record.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &CacheKey) -> UpdateResult<Option<CacheRecord>>;

    /// Store `record`, replacing any existing one (last writer wins).
    async fn put(&self, key: &CacheKey, record: CacheRecord) -> UpdateResult<()>;

    async fn has(&self, key: &CacheKey) -> UpdateResult<bool>;
}

/// Process-local store with no persistence.
#[derive(Default)]
pub struct MemoryCacheStore {
    records: RwLock<HashMap<CacheKey, CacheRecord>>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn get(&self, key: &CacheKey) -> UpdateResult<Option<CacheRecord>> {
        Ok(self.records.read().get(key).cloned())
    }

    async fn put(&self, key: &CacheKey, record: CacheRecord) -> UpdateResult<()> {
        self.records.write().insert(key.clone(), record);
        Ok(())
    }

    async fn has(&self, key: &CacheKey) -> UpdateResult<bool> {
        Ok(self.records.read().contains_key(key))
    }
}

#[derive(Serialize, Deserialize)]
struct RecordHeader {
    key: String,
    fetched_at: DateTime<Utc>,
    origin: String,
    content_hash: String,
    len: u64,
}

fn encode_record(key: &str, record: &CacheRecord) -> UpdateResult<Vec<u8>> {
    let header = RecordHeader {
        key: key.to_string(),
        fetched_at: record.fetched_at,
        origin: record.origin.clone(),
        content_hash: record.content_hash.clone(),
        len: record.content.len() as u64,
    };
    let mut buf = serde_json::to_vec(&header).map_err(|e| UpdateError::storage("encode", e))?;
    buf.push(b'\n');
    buf.extend_from_slice(&record.content);
    Ok(buf)
}

/// Header of a record file, if `line` (without its newline) describes a
/// complete record for `key` with `content_len` content bytes behind it.
fn parse_header(key: &str, line: &[u8], content_len: u64) -> Option<RecordHeader> {
    let header: RecordHeader = serde_json::from_slice(line).ok()?;
    (header.key == key && header.len == content_len).then_some(header)
}

/// Decode a record file. `None` when the file is not a complete record for `key`.
fn decode_record(key: &str, raw: &[u8]) -> Option<CacheRecord> {
    let split = raw.iter().position(|b| *b == b'\n')?;
    let content = &raw[split + 1..];
    let header = parse_header(key, &raw[..split], content.len() as u64)?;
    Some(CacheRecord {
        content: Bytes::copy_from_slice(content),
        fetched_at: header.fetched_at,
        origin: header.origin,
        content_hash: header.content_hash,
    })
}

/// Whether `path` holds a complete record for `key`, reading only its header.
fn record_present(path: &Path, key: &str) -> UpdateResult<bool> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(UpdateError::storage("open record", e)),
    };
    let file_len = file
        .metadata()
        .map_err(|e| UpdateError::storage("stat record", e))?
        .len();
    let mut line = Vec::new();
    BufReader::new(file)
        .read_until(b'\n', &mut line)
        .map_err(|e| UpdateError::storage("read record header", e))?;

    let content_len = file_len.saturating_sub(line.len() as u64);
    Ok(line
        .strip_suffix(b"\n")
        .and_then(|header| parse_header(key, header, content_len))
        .is_some())
}

/// One file per key under `dir`, written via temp file + rename.
///
/// Nothing is kept in memory: the rename is atomic, so a `get` issued after a
/// `put` returned reads the new file, and concurrent readers see either the
/// old record or the new one. No lock is taken around file I/O.
pub struct DiskCacheStore {
    dir: PathBuf,
}

impl DiskCacheStore {
    pub fn open(dir: &Path) -> UpdateResult<Self> {
        fs::create_dir_all(dir).map_err(|e| UpdateError::storage("create cache dir", e))?;
        debug!("disk cache opened at {}", dir.display());
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.rec", sha256_hex(key.as_bytes())))
    }
}

async fn run_blocking<T, F>(f: F) -> UpdateResult<T>
where
    F: FnOnce() -> UpdateResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| UpdateError::storage("cache worker", e))?
}

#[async_trait]
impl CacheStore for DiskCacheStore {
    async fn get(&self, key: &CacheKey) -> UpdateResult<Option<CacheRecord>> {
        let key = key.to_string();
        let path = self.path_for(&key);
        run_blocking(move || {
            let raw = match fs::read(&path) {
                Ok(raw) => raw,
                Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
                Err(e) => return Err(UpdateError::storage("read record", e)),
            };
            let record = decode_record(&key, &raw);
            if record.is_none() {
                warn!("cache record {} at {} is corrupt, ignoring", key, path.display());
            }
            Ok(record)
        })
        .await
    }

    async fn put(&self, key: &CacheKey, record: CacheRecord) -> UpdateResult<()> {
        let key = key.to_string();
        let dir = self.dir.clone();
        let path = self.path_for(&key);
        run_blocking(move || {
            let encoded = encode_record(&key, &record)?;
            let mut tmp =
                NamedTempFile::new_in(&dir).map_err(|e| UpdateError::storage("temp file", e))?;
            tmp.write_all(&encoded)
                .map_err(|e| UpdateError::storage("write record", e))?;
            tmp.as_file()
                .sync_all()
                .map_err(|e| UpdateError::storage("sync record", e))?;
            tmp.persist(&path)
                .map_err(|e| UpdateError::storage("persist record", e.error))?;
            debug!("cache put {} ({} bytes)", key, record.content.len());
            Ok(())
        })
        .await
    }

    async fn has(&self, key: &CacheKey) -> UpdateResult<bool> {
        let key = key.to_string();
        let path = self.path_for(&key);
        run_blocking(move || record_present(&path, &key)).await
    }
}
