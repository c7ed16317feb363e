//! Cross-origin image inlining through the same-origin relay.
//!
//! Every `<img>` whose source is cross-origin, or goes through the host's
//! image-resizing endpoint, is fetched via the relay, cached, and rewritten to
//! a temporary local handle. Failures degrade that one image to the neutral
//! placeholder; they never fail the export.

use crate::cache::{CachedResource, ResourceCache};
use crate::dom::{Document, NodeId};
use crate::fetch::Fetch;
use crate::handles::HandleRegistry;
use futures::future::join_all;
use log::{debug, warn};
use std::sync::{Arc, Mutex, PoisonError};
use url::Url;

/// Neutral grey 80x80 SVG used wherever an image cannot be obtained.
pub const IMAGE_PLACEHOLDER: &str = "data:image/svg+xml;base64,PHN2ZyB3aWR0aD0iODAiIGhlaWdodD0iODAiIHZpZXdCb3g9IjAgMCA4MCA4MCIgZmlsbD0ibm9uZSIgeG1sbnM9Imh0dHA6Ly93d3cudzMub3JnLzIwMDAvc3ZnIj48cmVjdCB3aWR0aD0iODAiIGhlaWdodD0iODAiIGZpbGw9IiNFNUU4RUIiLz48L3N2Zz4=";

/// Attributes of an `<img>` before it was rewritten.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginalImageState {
    pub src: Option<String>,
    pub srcset: Option<String>,
    pub sizes: Option<String>,
    pub loading: Option<String>,
}

impl OriginalImageState {
    fn capture(doc: &Document, img: NodeId) -> Self {
        OriginalImageState {
            src: doc.attr(img, "src"),
            srcset: doc.attr(img, "srcset"),
            sizes: doc.attr(img, "sizes"),
            loading: doc.attr(img, "loading"),
        }
    }

    fn apply(&self, doc: &Document, img: NodeId) {
        doc.restore_attr(img, "src", self.src.as_deref());
        doc.restore_attr(img, "srcset", self.srcset.as_deref());
        doc.restore_attr(img, "sizes", self.sizes.as_deref());
        doc.restore_attr(img, "loading", self.loading.as_deref());
    }
}

/// Originals of rewritten images, shared with whoever must undo them.
///
/// An entry is recorded before its element is touched, so an inlining pass
/// abandoned halfway can still be undone from the log.
#[derive(Debug, Clone, Default)]
pub struct RewriteLog(Arc<Mutex<Vec<(NodeId, OriginalImageState)>>>);

impl RewriteLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, img: NodeId, original: OriginalImageState) {
        self.lock().push((img, original));
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Restore every logged element and empty the log.
    pub fn restore(&self, doc: &Document) {
        let originals = std::mem::take(&mut *self.lock());
        restore_images(doc, &originals);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<(NodeId, OriginalImageState)>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Result of one inlining pass.
#[derive(Debug, Default)]
pub struct InlineReport {
    /// Elements whose source was rewritten.
    pub rewritten: usize,
    /// Handles minted during the pass.
    pub handles: Vec<String>,
    /// Elements that ended up on the placeholder.
    pub degraded: usize,
}

/// Where an `<img>` really comes from, if it needs inlining at all.
///
/// Returns `None` for data URLs, handles, and plain same-origin images.
/// Same-origin images behind `resize_path` are unwrapped to their `param`
/// query value, resolved against the document origin.
pub fn upstream_source(src: &str, origin: &Url, resize_path: &str, param: &str) -> Option<String> {
    let src = src.trim();
    if src.is_empty() || src.starts_with("data:") || HandleRegistry::is_handle(src) {
        return None;
    }
    let resolved = origin.join(src).ok()?;
    if resolved.origin() != origin.origin() {
        return Some(resolved.to_string());
    }
    if resolved.path() == resize_path {
        let inner = resolved
            .query_pairs()
            .find(|(k, _)| k == param)
            .map(|(_, v)| v.into_owned())?;
        return origin.join(&inner).ok().map(|u| u.to_string());
    }
    None
}

pub struct ResourceInliner<'a> {
    doc: &'a Document,
    cache: &'a ResourceCache,
    relay: &'a dyn Fetch,
    handles: &'a HandleRegistry,
    log: RewriteLog,
    resize_path: String,
    resize_param: String,
}

enum Outcome {
    Untouched,
    Inlined(Option<String>),
}

impl<'a> ResourceInliner<'a> {
    pub fn new(
        doc: &'a Document,
        cache: &'a ResourceCache,
        relay: &'a dyn Fetch,
        handles: &'a HandleRegistry,
    ) -> Self {
        ResourceInliner {
            doc,
            cache,
            relay,
            handles,
            log: RewriteLog::new(),
            resize_path: "/_next/image".to_string(),
            resize_param: "url".to_string(),
        }
    }

    /// Record originals into `log` instead of a private one.
    pub fn with_log(mut self, log: RewriteLog) -> Self {
        self.log = log;
        self
    }

    pub fn log(&self) -> &RewriteLog {
        &self.log
    }

    pub fn with_resize_endpoint(mut self, path: &str, param: &str) -> Self {
        self.resize_path = path.to_string();
        self.resize_param = param.to_string();
        self
    }

    /// Inline every qualifying image below `root`, all concurrently.
    pub async fn inline_images(&self, root: NodeId) -> InlineReport {
        let images = self.doc.elements_by_tag(root, "img");
        let outcomes = join_all(images.into_iter().map(|img| self.inline_one(img))).await;

        let mut report = InlineReport::default();
        for outcome in outcomes {
            if let Outcome::Inlined(handle) = outcome {
                match handle {
                    Some(h) => report.handles.push(h),
                    None => report.degraded += 1,
                }
                report.rewritten += 1;
            }
        }
        debug!(
            "inlined {} images ({} degraded, {} handles)",
            report.rewritten,
            report.degraded,
            report.handles.len()
        );
        report
    }

    async fn inline_one(&self, img: NodeId) -> Outcome {
        let Some(src) = self.doc.attr(img, "src") else {
            return Outcome::Untouched;
        };
        let Some(upstream) =
            upstream_source(&src, self.doc.origin(), &self.resize_path, &self.resize_param)
        else {
            return Outcome::Untouched;
        };

        let relay = self.relay;
        let key = upstream.clone();
        let resource = self
            .cache
            .get_or_fetch(&upstream, move || async move {
                match relay.fetch(&key).await {
                    Ok(f) if f.is_image() && !f.bytes.is_empty() => {
                        CachedResource::binary(f.bytes, &f.content_type)
                    }
                    Ok(f) => {
                        warn!(
                            "relay returned {} ({} bytes) for {}; using placeholder",
                            f.content_type,
                            f.bytes.len(),
                            key
                        );
                        CachedResource::Placeholder
                    }
                    Err(e) => {
                        warn!("image conversion failed for {}: {}", key, e);
                        CachedResource::Placeholder
                    }
                }
            })
            .await;

        self.log.record(img, OriginalImageState::capture(self.doc, img));
        let handle = match resource {
            CachedResource::Binary {
                bytes,
                content_type,
            } => {
                let h = self.handles.create(bytes, &content_type);
                self.doc.set_attr(img, "src", &h);
                Some(h)
            }
            CachedResource::Placeholder => {
                self.doc.set_attr(img, "src", IMAGE_PLACEHOLDER);
                None
            }
        };
        // A leftover srcset/sizes would make the image re-resolve away from our source.
        self.doc.remove_attr(img, "srcset");
        self.doc.remove_attr(img, "sizes");
        self.doc.set_attr(img, "loading", "eager");
        Outcome::Inlined(handle)
    }
}

/// Put rewritten images back. Elements that disappeared meanwhile are skipped.
pub fn restore_images(doc: &Document, originals: &[(NodeId, OriginalImageState)]) {
    for (img, original) in originals {
        if !doc.is_element(*img) {
            warn!("image {} vanished before restoration", img);
            continue;
        }
        original.apply(doc, *img);
    }
}
