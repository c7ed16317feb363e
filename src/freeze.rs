//! Replace live `<video>` elements with still frames for the duration of a capture.
//!
//! Rasterizers cannot sample live video, so each video is hidden (never
//! removed) and a still image, or a neutral placeholder block, is spliced in
//! front of it. [`restore_videos`] undoes exactly that.

use crate::dom::{Document, NodeId};
use crate::platform::VideoFrame;
use crate::rendering::raster::encode_png;
use crate::{Error, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use image::imageops::{self, FilterType};
use image::RgbaImage;
use log::{debug, warn};

pub const VIDEO_PLACEHOLDER_COLOR: &str = "#1a1a1a";
pub const PLACEHOLDER_MARKER: &str = "data-video-placeholder";
pub const FRAME_MARKER: &str = "data-video-frame";
const FALLBACK_EDGE: u32 = 80;

/// One hidden video and the node standing in for it.
#[derive(Debug, Clone, PartialEq)]
pub struct VideoReplacement {
    pub video: NodeId,
    pub replacement: NodeId,
    pub parent: NodeId,
    pub previous_display: Option<String>,
    /// `false` when a placeholder block was used instead of a frame.
    pub captured: bool,
}

/// Freeze every video below `root`.
pub fn freeze_videos(doc: &Document, root: NodeId) -> Vec<VideoReplacement> {
    let mut replacements = Vec::new();
    for video in doc.elements_by_tag(root, "video") {
        let Some(parent) = doc.parent(video) else {
            continue;
        };
        let (replacement, captured) = match frame_data_url(doc, video) {
            Ok(Some(data_url)) => (frame_image(doc, video, &data_url), true),
            Ok(None) => (placeholder_block(doc), false),
            Err(e) => {
                warn!("video frame capture failed for {}: {}", video, e);
                (placeholder_block(doc), false)
            }
        };
        if let Err(e) = doc.insert_before(parent, replacement, video) {
            warn!("could not splice replacement for {}: {}", video, e);
            continue;
        }
        let previous_display = doc.style(video, "display");
        doc.set_style(video, "display", "none");
        replacements.push(VideoReplacement {
            video,
            replacement,
            parent,
            previous_display,
            captured,
        });
    }
    debug!(
        "froze {} videos ({} as placeholders)",
        replacements.len(),
        replacements.iter().filter(|r| !r.captured).count()
    );
    replacements
}

/// Un-hide every video, then remove every substituted node.
pub fn restore_videos(doc: &Document, replacements: &[VideoReplacement]) {
    for r in replacements {
        doc.restore_style(r.video, "display", r.previous_display.as_deref());
    }
    for r in replacements {
        if doc.has_child(r.parent, r.replacement) {
            let _ = doc.remove_child(r.parent, r.replacement);
        }
    }
}

/// PNG data URL of the current frame, or `None` while the video has no
/// decodable frame yet.
fn frame_data_url(doc: &Document, video: NodeId) -> Result<Option<String>> {
    let Some(media) = doc.media(video) else {
        return Ok(None);
    };
    if !media.ready_state().has_current_frame() {
        return Ok(None);
    }
    let frame = media.current_frame()?;
    let (width, height) = frame_size(doc, video, media.intrinsic_size());
    let rgba = scale_frame(frame, width, height)?;
    let png = encode_png(width, height, &rgba)?;
    Ok(Some(format!("data:image/png;base64,{}", STANDARD.encode(png))))
}

/// Intrinsic size, else the displayed size, else 80x80.
fn frame_size(doc: &Document, video: NodeId, intrinsic: (u32, u32)) -> (u32, u32) {
    let displayed = |prop: &str| {
        doc.style(video, prop)
            .and_then(|v| v.trim().strip_suffix("px").and_then(|n| n.trim().parse::<f32>().ok()))
            .map(|n| n.round() as u32)
            .filter(|n| *n > 0)
    };
    let width = if intrinsic.0 > 0 { Some(intrinsic.0) } else { displayed("width") };
    let height = if intrinsic.1 > 0 { Some(intrinsic.1) } else { displayed("height") };
    (width.unwrap_or(FALLBACK_EDGE), height.unwrap_or(FALLBACK_EDGE))
}

/// Resample a frame to `(width, height)`.
fn scale_frame(frame: VideoFrame, width: u32, height: u32) -> Result<Vec<u8>> {
    let (fw, fh) = (frame.width, frame.height);
    let img = RgbaImage::from_raw(fw, fh, frame.rgba)
        .ok_or_else(|| Error::MediaError(format!("frame buffer does not match {}x{}", fw, fh)))?;
    if (fw, fh) == (width, height) {
        return Ok(img.into_raw());
    }
    Ok(imageops::resize(&img, width, height, FilterType::Triangle).into_raw())
}

fn frame_image(doc: &Document, video: NodeId, data_url: &str) -> NodeId {
    let img = doc.create_element("img");
    doc.set_attr(img, "src", data_url);
    if let Some(class) = doc.class_name(video) {
        doc.set_attr(img, "class", &class);
    }
    doc.set_attr(img, FRAME_MARKER, "true");
    doc.set_style(img, "width", "100%");
    doc.set_style(img, "height", "100%");
    doc.set_style(img, "object-fit", "cover");
    doc.set_style(img, "border-radius", "inherit");
    img
}

fn placeholder_block(doc: &Document) -> NodeId {
    let block = doc.create_element("div");
    doc.set_attr(block, PLACEHOLDER_MARKER, "true");
    doc.set_style(block, "width", "100%");
    doc.set_style(block, "height", "100%");
    doc.set_style(block, "background-color", VIDEO_PLACEHOLDER_COLOR);
    doc.set_style(block, "border-radius", "inherit");
    block
}
