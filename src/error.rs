// Error types shared by the cache, fetcher, download session and coordinator.

use serde::Serialize;
use thiserror::Error;

/// Failure raised by a [`Transport`](crate::source::traits::Transport).
///
/// Connectivity and timeout failures are kept apart from HTTP status failures
/// so callers can tell "offline" from "origin said no".
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connect(String),

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("HTTP {status} from {url}")]
    Status { status: u16, url: String },

    #[error("response body interrupted: {0}")]
    Body(String),

    #[error("request failed: {0}")]
    Request(String),

    /// The response declared or delivered more than the caller accepts.
    #[error("response from {url} exceeds {limit} bytes")]
    TooLarge { limit: u64, url: String },
}

impl TransportError {
    /// True for failures caused by missing connectivity rather than by the origin.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Self::Connect(_) | Self::Timeout(_))
    }
}

/// Errors surfaced by every public update operation.
///
/// `Clone` so that a single terminal download result can be handed to every
/// observer attached to the same transfer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UpdateError {
    /// No manifest is cached and the policy forbids (or could not reach) the network.
    #[error("no update manifest available")]
    NotAvailable,

    #[error("network error: {0}")]
    Network(#[from] TransportError),

    #[error("invalid manifest: {0}")]
    InvalidManifest(String),

    /// The downloaded bundle does not hash to the value declared by its manifest.
    #[error("bundle integrity check failed: expected {expected}, got {actual}")]
    Integrity { expected: String, actual: String },

    /// An update cycle is already checking or downloading.
    #[error("an update cycle is already in progress")]
    Busy,

    #[error("cache storage error: {0}")]
    Storage(String),

    #[error("an update coordinator is already installed for this process")]
    AlreadyInstalled,
}

impl UpdateError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotAvailable => ErrorKind::NotAvailable,
            Self::Network(_) => ErrorKind::Network,
            Self::InvalidManifest(_) => ErrorKind::InvalidManifest,
            Self::Integrity { .. } => ErrorKind::Integrity,
            Self::Busy => ErrorKind::Busy,
            Self::Storage(_) => ErrorKind::Storage,
            Self::AlreadyInstalled => ErrorKind::AlreadyInstalled,
        }
    }

    pub(crate) fn storage(context: &str, err: impl std::fmt::Display) -> Self {
        Self::Storage(format!("{}: {}", context, err))
    }
}

/// Flat discriminant of [`UpdateError`], carried in `Error` event payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    NotAvailable,
    Network,
    InvalidManifest,
    Integrity,
    Busy,
    Storage,
    AlreadyInstalled,
}

pub type UpdateResult<T> = Result<T, UpdateError>;
