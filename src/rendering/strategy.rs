//! Tiered rasterization: a capability-keyed plan of strategies, tried in
//! order until one produces an image.

use super::images::{allows_cache_bust, image_sources, ImageLoader};
use super::layout::layout_subtree;
use super::paint::display_list;
use super::raster::{encode_png, rasterize};
use super::RasterOutput;
use crate::dom::{Document, NodeFilter, NodeId};
use crate::fonts::embedded_families;
use crate::platform::{Capabilities, EngineKind};
use crate::{Error, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use log::{debug, warn};

/// Viewport width used when the root has no pixel width of its own.
pub const DEFAULT_VIEWPORT_WIDTH: u32 = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StrategyKind {
    /// Renders the live subtree with the embedded font CSS applied.
    DomToImage,
    /// Clones the subtree into a scratch document and renders the clone.
    CloneCanvas,
}

/// Ordered strategies to attempt for `caps`. WebKit renders the
/// foreign-object path incorrectly, so it only gets the clone renderer.
pub fn plan(caps: &Capabilities) -> Vec<StrategyKind> {
    if caps.engine == EngineKind::WebKit || !caps.foreign_object {
        vec![StrategyKind::CloneCanvas]
    } else {
        vec![StrategyKind::DomToImage, StrategyKind::CloneCanvas]
    }
}

/// Everything a strategy needs to rasterize one subtree.
pub struct RasterRequest<'a> {
    pub doc: &'a Document,
    pub root: NodeId,
    pub pixel_ratio: f32,
    pub background: String,
    pub font_css: String,
    /// Nodes rejected here are never painted.
    pub filter: NodeFilter,
    pub loader: &'a ImageLoader,
    pub capabilities: Capabilities,
}

#[async_trait]
pub trait RasterStrategy: Send + Sync {
    fn kind(&self) -> StrategyKind;
    async fn rasterize(&self, request: &RasterRequest<'_>) -> Result<RasterOutput>;
}

/// Lay out, paint and encode `root` of `doc`.
fn render_png(doc: &Document, root: NodeId, request: &RasterRequest<'_>, font_css: &str) -> Result<Vec<u8>> {
    let layout = layout_subtree(doc, root, request.filter, DEFAULT_VIEWPORT_WIDTH);
    let commands = display_list(&layout, &request.background, &embedded_families(font_css));
    let canvas = rasterize(
        &commands,
        layout.width,
        layout.height,
        request.pixel_ratio,
        &request.loader.snapshot(),
        request.loader.placeholder(),
    );
    let (width, height) = (canvas.width(), canvas.height());
    let bitmap = canvas.into_bitmap();
    encode_png(width, height, &bitmap.rgba)
}

pub struct DomToImage;

#[async_trait]
impl RasterStrategy for DomToImage {
    fn kind(&self) -> StrategyKind {
        StrategyKind::DomToImage
    }

    async fn rasterize(&self, request: &RasterRequest<'_>) -> Result<RasterOutput> {
        let sources = image_sources(request.doc, request.root);
        let bust = allows_cache_bust(sources.iter().map(String::as_str));
        request.loader.load_all(&sources, bust).await;
        let png = render_png(request.doc, request.root, request, &request.font_css)?;
        Ok(RasterOutput::Blob(png))
    }
}

/// Marker attribute on the font `<style>` injected into clones.
pub const FONT_STYLE_MARKER: &str = "data-embedded-fonts";

pub struct CloneCanvas;

#[async_trait]
impl RasterStrategy for CloneCanvas {
    fn kind(&self) -> StrategyKind {
        StrategyKind::CloneCanvas
    }

    async fn rasterize(&self, request: &RasterRequest<'_>) -> Result<RasterOutput> {
        let (clone, root) = request.doc.clone_subtree(request.root, request.filter)?;
        if !request.font_css.is_empty() {
            let style = clone.create_element("style");
            clone.set_attr(style, FONT_STYLE_MARKER, "true");
            let text = clone.create_text(&request.font_css);
            clone.append_child(style, text)?;
            clone.append_child(clone.head(), style)?;
            clone.add_stylesheet(&request.font_css);
        }
        let sources = image_sources(&clone, root);
        request.loader.load_all(&sources, false).await;
        let font_css = clone.stylesheets().join("\n");
        let png = render_png(&clone, root, request, &font_css)?;
        if request.capabilities.blob_output {
            Ok(RasterOutput::Blob(png))
        } else {
            Ok(RasterOutput::DataUrl(format!("data:image/png;base64,{}", STANDARD.encode(png))))
        }
    }
}

/// Runs the planned strategies in order, falling back on failure.
pub struct TieredRasterizer {
    strategies: Vec<Box<dyn RasterStrategy>>,
}

impl TieredRasterizer {
    pub fn new() -> Self {
        Self::with_strategies(vec![Box::new(DomToImage), Box::new(CloneCanvas)])
    }

    /// Use these implementations for the planned kinds.
    pub fn with_strategies(strategies: Vec<Box<dyn RasterStrategy>>) -> Self {
        TieredRasterizer { strategies }
    }

    pub async fn rasterize(&self, request: &RasterRequest<'_>) -> Result<RasterOutput> {
        let mut failures = Vec::new();
        for kind in plan(&request.capabilities) {
            let Some(strategy) = self.strategies.iter().find(|s| s.kind() == kind) else {
                continue;
            };
            match strategy.rasterize(request).await {
                Ok(output) => {
                    debug!("{:?} produced {} bytes", kind, output.len());
                    return Ok(output);
                }
                Err(e) => {
                    warn!("{:?} rasterization failed: {}", kind, e);
                    failures.push(format!("{:?}: {}", kind, e));
                }
            }
        }
        if failures.is_empty() {
            return Err(Error::RenderError("no raster strategy available".into()));
        }
        Err(Error::RenderError(format!("all raster strategies failed ({})", failures.join("; "))))
    }
}

impl Default for TieredRasterizer {
    fn default() -> Self {
        Self::new()
    }
}
