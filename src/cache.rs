//! Process-lifetime resource cache keyed by source URL.
//!
//! Entries are `OnceCell`s: the first caller for a key runs the fetch and
//! every concurrent caller for the same key awaits that one result instead of
//! issuing a second request.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::OnceCell;

/// A cached conversion result.
#[derive(Debug, Clone, PartialEq)]
pub enum CachedResource {
    /// Raw payload as delivered by the relay.
    Binary {
        bytes: Arc<[u8]>,
        content_type: String,
    },
    /// The fetch failed earlier; use the neutral placeholder.
    Placeholder,
}

impl CachedResource {
    pub fn binary(bytes: impl Into<Arc<[u8]>>, content_type: &str) -> Self {
        CachedResource::Binary {
            bytes: bytes.into(),
            content_type: content_type.to_string(),
        }
    }

    pub fn is_placeholder(&self) -> bool {
        matches!(self, CachedResource::Placeholder)
    }
}

#[derive(Default)]
pub struct ResourceCache {
    entries: Mutex<HashMap<String, Arc<OnceCell<CachedResource>>>>,
}

impl ResourceCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn cell(&self, key: &str) -> Arc<OnceCell<CachedResource>> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key.to_string())
            .or_default()
            .clone()
    }

    /// Resolved value for `key`, if any. In-flight fetches count as absent.
    pub fn get(&self, key: &str) -> Option<CachedResource> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .and_then(|cell| cell.get().cloned())
    }

    pub fn put(&self, key: &str, value: CachedResource) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), Arc::new(OnceCell::new_with(Some(value))));
    }

    /// Return the cached value or run `fetch` to produce it. At most one
    /// `fetch` per key is in flight; later callers await its result.
    pub async fn get_or_fetch<F, Fut>(&self, key: &str, fetch: F) -> CachedResource
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = CachedResource>,
    {
        let cell = self.cell(key);
        cell.get_or_init(fetch).await.clone()
    }

    pub fn clear(&self) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Number of resolved entries.
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|cell| cell.initialized())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
