//! Capture orchestration: normalize layout, substitute live content,
//! rasterize, download, and always put everything back.
//!
//! Every mutation registers a disposer as soon as it is made. The disposer
//! lists run in the cleanup phase on every exit path, and again from `Drop`
//! if the export future is abandoned midway.

use crate::cache::ResourceCache;
use crate::dom::{Document, NodeId};
use crate::fetch::{Fetch, RelayFetcher};
use crate::fonts::FontEmbedder;
use crate::freeze::{freeze_videos, restore_videos};
use crate::handles::HandleRegistry;
use crate::inline::{ResourceInliner, RewriteLog};
use crate::platform::Platform;
use crate::rendering::{ImageLoader, RasterRequest, TieredRasterizer};
use crate::{CaptureConfig, Result};
use futures::future::BoxFuture;
use log::{debug, error, info, warn};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const FAILURE_NOTICE: &str = "Failed to save the image. Please try again.";
pub const CAPTURE_ROOT_MARKER: &str = "data-capture-root";

/// Async hook run against the live document before or after a capture.
pub type CaptureHook = Arc<dyn Fn(Document) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Wrap an async closure as a [`CaptureHook`].
pub fn hook<F, Fut>(f: F) -> CaptureHook
where
    F: Fn(Document) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move |doc| Box::pin(f(doc)))
}

/// Per-call export options.
#[derive(Clone)]
pub struct SaveOptions {
    pub file_name: String,
    pub background_color: Option<String>,
    pub pixel_ratio: Option<f32>,
    pub on_before_capture: Option<CaptureHook>,
    pub on_after_capture: Option<CaptureHook>,
}

impl SaveOptions {
    pub fn new(file_name: &str) -> Self {
        SaveOptions {
            file_name: file_name.to_string(),
            background_color: None,
            pixel_ratio: None,
            on_before_capture: None,
            on_after_capture: None,
        }
    }

    pub fn with_background(mut self, color: &str) -> Self {
        self.background_color = Some(color.to_string());
        self
    }

    pub fn with_pixel_ratio(mut self, ratio: f32) -> Self {
        self.pixel_ratio = Some(ratio);
        self
    }

    pub fn before_capture(mut self, hook: CaptureHook) -> Self {
        self.on_before_capture = Some(hook);
        self
    }

    pub fn after_capture(mut self, hook: CaptureHook) -> Self {
        self.on_after_capture = Some(hook);
        self
    }
}

impl std::fmt::Debug for SaveOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SaveOptions")
            .field("file_name", &self.file_name)
            .field("background_color", &self.background_color)
            .field("pixel_ratio", &self.pixel_ratio)
            .field("on_before_capture", &self.on_before_capture.is_some())
            .field("on_after_capture", &self.on_after_capture.is_some())
            .finish()
    }
}

/// How one export call ended. Failures have already been shown to the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureStatus {
    Saved { file_name: String, bytes: usize },
    /// Another export was still in flight.
    Skipped,
    Failed(String),
}

/// Raster filter used for every export: live video never reaches a strategy.
pub fn exclude_video(doc: &Document, node: NodeId) -> bool {
    !doc.is_tag(node, "video")
}

type Disposer = Box<dyn FnOnce() + Send>;

/// Undo actions, run last-registered first.
#[derive(Default)]
struct Disposers(Vec<Disposer>);

impl Disposers {
    fn defer(&mut self, undo: impl FnOnce() + Send + 'static) {
        self.0.push(Box::new(undo));
    }

    fn run(&mut self) {
        while let Some(undo) = self.0.pop() {
            undo();
        }
    }
}

impl Drop for Disposers {
    fn drop(&mut self) {
        self.run();
    }
}

struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Exports subtrees of one document as images.
pub struct Capturer {
    doc: Document,
    platform: Arc<dyn Platform>,
    fetcher: Arc<dyn Fetch>,
    relay: Arc<dyn Fetch>,
    cache: Arc<ResourceCache>,
    rasterizer: TieredRasterizer,
    config: CaptureConfig,
    busy: AtomicBool,
}

impl Capturer {
    /// Images are relayed through `config.relay_path` on the document's own
    /// origin, using `fetcher` for the actual requests.
    pub fn new(
        doc: Document,
        platform: Arc<dyn Platform>,
        fetcher: Arc<dyn Fetch>,
        config: CaptureConfig,
    ) -> Result<Self> {
        let relay = RelayFetcher::same_origin(doc.origin(), &config.relay_path, fetcher.clone())?;
        Ok(Capturer {
            doc,
            platform,
            fetcher,
            relay: Arc::new(relay),
            cache: Arc::new(ResourceCache::new()),
            rasterizer: TieredRasterizer::new(),
            config,
            busy: AtomicBool::new(false),
        })
    }

    pub fn with_relay(mut self, relay: Arc<dyn Fetch>) -> Self {
        self.relay = relay;
        self
    }

    /// Share a cache with other capturers.
    pub fn with_cache(mut self, cache: Arc<ResourceCache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_rasterizer(mut self, rasterizer: TieredRasterizer) -> Self {
        self.rasterizer = rasterizer;
        self
    }

    pub fn document(&self) -> &Document {
        &self.doc
    }

    pub fn cache(&self) -> &ResourceCache {
        &self.cache
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    pub fn is_saving(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Export `root` and hand the image to the platform as a download.
    ///
    /// A call made while another is in flight does nothing and returns
    /// [`CaptureStatus::Skipped`].
    pub async fn save_as_image(&self, root: NodeId, options: SaveOptions) -> CaptureStatus {
        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("export already in flight, ignoring {}", options.file_name);
            return CaptureStatus::Skipped;
        }
        let _busy = BusyGuard(&self.busy);

        let handles = Arc::new(HandleRegistry::new());
        let mut layout = Disposers::default();
        let mut content = Disposers::default();
        let result = self.export(root, &options, &handles, &mut layout, &mut content).await;

        content.run();
        if let Some(after) = &options.on_after_capture {
            if let Err(e) = after(self.doc.clone()).await {
                warn!("after-capture hook failed: {}", e);
            }
        }
        layout.run();

        match result {
            Ok(bytes) => {
                info!("saved {} ({} bytes)", options.file_name, bytes);
                CaptureStatus::Saved {
                    file_name: options.file_name,
                    bytes,
                }
            }
            Err(e) => {
                error!("export of {} failed: {}", options.file_name, e);
                self.platform.notify_failure(FAILURE_NOTICE);
                CaptureStatus::Failed(e.to_string())
            }
        }
    }

    async fn export(
        &self,
        root: NodeId,
        options: &SaveOptions,
        handles: &Arc<HandleRegistry>,
        layout: &mut Disposers,
        content: &mut Disposers,
    ) -> Result<usize> {
        let doc = &self.doc;

        self.lock_page(layout);

        if let Some(before) = &options.on_before_capture {
            before(doc.clone()).await?;
        }

        self.normalize_root(root, layout);
        self.platform.next_frame().await;
        self.platform.next_frame().await;

        {
            let handles = handles.clone();
            content.defer(move || {
                let revoked = handles.revoke_all();
                debug!("revoked {} temporary handles", revoked);
            });
        }

        let videos = freeze_videos(doc, root);
        {
            let doc = doc.clone();
            content.defer(move || restore_videos(&doc, &videos));
        }

        let rewrites = RewriteLog::new();
        {
            let doc = doc.clone();
            let rewrites = rewrites.clone();
            content.defer(move || rewrites.restore(&doc));
        }
        let report = ResourceInliner::new(doc, &self.cache, self.relay.as_ref(), handles)
            .with_log(rewrites)
            .with_resize_endpoint(&self.config.resize_path, &self.config.resize_param)
            .inline_images(root)
            .await;
        if report.degraded > 0 {
            warn!("{} of {} images fell back to the placeholder", report.degraded, report.rewritten);
        }

        let loader = ImageLoader::new(doc.origin().clone(), handles.clone()).with_fetcher(self.fetcher.clone());
        let image_wait = Duration::from_millis(self.config.image_wait_ms);
        match tokio::time::timeout(image_wait, loader.preload(doc, root)).await {
            Ok(decoded) => debug!("{} images decoded", decoded),
            Err(_) => warn!("images still decoding after {:?}, continuing", image_wait),
        }
        let font_wait = Duration::from_millis(self.config.font_wait_ms);
        if tokio::time::timeout(font_wait, self.platform.fonts_ready()).await.is_err() {
            warn!("fonts not ready after {:?}, continuing", font_wait);
        }

        let font_css = FontEmbedder::new(doc, &self.cache, self.fetcher.as_ref())
            .embed_css(root)
            .await;

        let request = RasterRequest {
            doc,
            root,
            pixel_ratio: options.pixel_ratio.unwrap_or(self.config.pixel_ratio),
            background: options
                .background_color
                .clone()
                .unwrap_or_else(|| self.config.background_color.clone()),
            font_css,
            filter: exclude_video,
            loader: &loader,
            capabilities: self.platform.capabilities(),
        };
        let output = self.rasterizer.rasterize(&request).await?;

        self.platform.download(&options.file_name, &output).await?;
        Ok(output.len())
    }

    /// Scroll to the top, lock scrolling and pin the body in place.
    fn lock_page(&self, layout: &mut Disposers) {
        let doc = &self.doc;
        let body = doc.body();
        let (x, y) = doc.scroll_position();
        let was_locked = doc.is_scroll_locked();
        let saved: Vec<(&'static str, Option<String>)> = ["overflow", "position", "top", "width"]
            .into_iter()
            .map(|p| (p, doc.style(body, p)))
            .collect();

        doc.scroll_to(0.0, 0.0);
        doc.set_scroll_locked(true);
        doc.set_style(body, "overflow", "hidden");
        doc.set_style(body, "position", "fixed");
        doc.set_style(body, "top", "0px");
        doc.set_style(body, "width", "100%");

        let doc = doc.clone();
        layout.defer(move || {
            for (prop, value) in &saved {
                doc.restore_style(body, prop, value.as_deref());
            }
            doc.set_scroll_locked(was_locked);
            doc.scroll_to(x, y);
        });
    }

    /// Mark the root and pin it to the minimum capture width.
    fn normalize_root(&self, root: NodeId, layout: &mut Disposers) {
        let doc = &self.doc;
        let marker = doc.attr(root, CAPTURE_ROOT_MARKER);
        let width = doc.style(root, "width");
        let min_width = doc.style(root, "min-width");

        doc.set_attr(root, CAPTURE_ROOT_MARKER, "true");
        doc.set_style(root, "width", &format!("{}px", self.config.min_capture_width));
        doc.set_style(root, "min-width", &format!("{}px", self.config.min_capture_width));

        let doc = doc.clone();
        layout.defer(move || {
            doc.restore_attr(root, CAPTURE_ROOT_MARKER, marker.as_deref());
            doc.restore_style(root, "width", width.as_deref());
            doc.restore_style(root, "min-width", min_width.as_deref());
        });
    }
}
