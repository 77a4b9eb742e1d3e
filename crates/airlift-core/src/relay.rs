//! Relay store boundary — the fallback transport for large payloads.
//!
//! When the route policy picks [`crate::route::Route::Relay`], the payload
//! bytes are parked in a remote blob store and only a [`RelayId`] travels on
//! the direct connection. The receiving side downloads the blob and forwards
//! the downloaded bytes to its consumer as the received payload.
//!
//! Identifiers are single-use: a successful download deletes the object, so
//! a reference can never be resolved twice.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

/// Identifier of an uploaded blob.
pub type RelayId = Uuid;

/// Progress callback, invoked with fractions in 0.0–1.0.
pub type ProgressFn = Arc<dyn Fn(f64) + Send + Sync>;

/// A progress callback that discards every report.
pub fn noop_progress() -> ProgressFn {
    Arc::new(|_| {})
}

/// Errors from the relay store. A failed transfer is abandoned outright; no
/// partial state is retained on either side.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("relay upload failed: {0}")]
    Upload(String),
    #[error("relay download failed: {0}")]
    Download(String),
}

/// The store the engines upload to and download from.
#[cfg_attr(feature = "mocks", mockall::automock)]
#[async_trait]
pub trait RelayStore: Send + Sync {
    /// Uploads `bytes` and returns the identifier to send instead of them.
    async fn upload(&self, bytes: Vec<u8>, progress: ProgressFn) -> Result<RelayId, RelayError>;

    /// Downloads and deletes the blob behind `id`.
    async fn download(&self, id: RelayId, progress: ProgressFn) -> Result<Vec<u8>, RelayError>;
}

/// In-process relay store.
///
/// Stands in for the remote blob service in tests and demos, with the same
/// single-use contract the real backend has.
#[derive(Debug, Default)]
pub struct MemoryRelay {
    blobs: Mutex<HashMap<RelayId, Vec<u8>>>,
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of blobs currently parked.
    pub fn len(&self) -> usize {
        self.blobs.lock().expect("relay lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl RelayStore for MemoryRelay {
    async fn upload(&self, bytes: Vec<u8>, progress: ProgressFn) -> Result<RelayId, RelayError> {
        progress(0.0);
        let id = Uuid::new_v4();
        let len = bytes.len();
        self.blobs
            .lock()
            .map_err(|_| RelayError::Upload("relay store lock poisoned".into()))?
            .insert(id, bytes);
        progress(1.0);
        debug!(%id, len, "parked blob in relay store");
        Ok(id)
    }

    async fn download(&self, id: RelayId, progress: ProgressFn) -> Result<Vec<u8>, RelayError> {
        progress(0.0);
        // remove(), not get(): identifiers are single-use.
        let bytes = self
            .blobs
            .lock()
            .map_err(|_| RelayError::Download("relay store lock poisoned".into()))?
            .remove(&id)
            .ok_or_else(|| {
                RelayError::Download(format!("unknown or already-consumed identifier {id}"))
            })?;
        progress(1.0);
        debug!(%id, len = bytes.len(), "resolved and deleted relay blob");
        Ok(bytes)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
