//! Temporary local resource handles (object-URL style).
//!
//! A handle is only valid until revoked. Each export owns one registry and
//! revokes everything it minted in its cleanup phase.

use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

pub const HANDLE_SCHEME: &str = "blob:";
const HANDLE_PREFIX: &str = "blob:snapframe/";

#[derive(Debug, Clone)]
struct Entry {
    bytes: Arc<[u8]>,
    content_type: String,
}

#[derive(Debug, Default)]
pub struct HandleRegistry {
    next: AtomicU64,
    live: Mutex<HashMap<String, Entry>>,
}

impl HandleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `url` looks like a temporary handle (ours or anyone's).
    pub fn is_handle(url: &str) -> bool {
        url.starts_with(HANDLE_SCHEME)
    }

    /// Bind `bytes` to a fresh handle.
    pub fn create(&self, bytes: Arc<[u8]>, content_type: &str) -> String {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        let digest = Sha256::digest(&bytes);
        let handle = format!("{}{}-{}", HANDLE_PREFIX, &hex::encode(digest)[..12], n);
        self.lock().insert(
            handle.clone(),
            Entry {
                bytes,
                content_type: content_type.to_string(),
            },
        );
        handle
    }

    /// Bytes and content type behind a live handle.
    pub fn resolve(&self, handle: &str) -> Option<(Arc<[u8]>, String)> {
        self.lock()
            .get(handle)
            .map(|e| (e.bytes.clone(), e.content_type.clone()))
    }

    pub fn revoke(&self, handle: &str) -> bool {
        self.lock().remove(handle).is_some()
    }

    /// Revoke every live handle, returning how many there were.
    pub fn revoke_all(&self) -> usize {
        let mut live = self.lock();
        let n = live.len();
        live.clear();
        n
    }

    pub fn live_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Entry>> {
        self.live.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
