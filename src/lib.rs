//! Snapframe
//!
//! Snapshot export for live, media-heavy panels, and phase-locked playback
//! for groups of independently loaded videos.
//!
//! # Features
//!
//! - **Snapshot export**: cross-origin images are relayed and inlined, live
//!   video is frozen to still frames, used web fonts are embedded, and the
//!   subtree is rasterized with a fallback strategy. Every DOM mutation is
//!   undone afterwards, whatever happened.
//! - **Phase sync**: a group of videos starts together once all are ready and
//!   visible, and is periodically pulled back onto the first member's clock.
//! - `relay` (default): reqwest-backed HTTP fetching.
//! - `html` (default): build a [`dom::Document`] from markup.
//!
//! # Example
//!
//! ```no_run
//! use snapframe::capture::{Capturer, SaveOptions};
//! use snapframe::fetch::HttpFetcher;
//! use snapframe::platform::HeadlessPlatform;
//! use snapframe::CaptureConfig;
//! use std::sync::Arc;
//!
//! # async fn run() -> snapframe::Result<()> {
//! let config = CaptureConfig::default();
//! let doc = snapframe::dom::html::parse_document(
//!     "<div id=\"recap\" style=\"padding: 8px\">Season recap</div>",
//!     "https://recap.example",
//! )?;
//! let root = doc.query_selector("#recap").expect("panel");
//! let fetcher = Arc::new(HttpFetcher::new(&config)?);
//! let capturer = Capturer::new(doc, Arc::new(HeadlessPlatform::new()), fetcher, config)?;
//! capturer.save_as_image(root, SaveOptions::new("recap.png")).await;
//! # Ok(())
//! # }
//! ```

use serde::{Deserialize, Serialize};

pub mod error;
pub use error::{Error, Result};

pub mod cache;
pub mod capture;
pub mod dom;
pub mod fetch;
pub mod fonts;
pub mod freeze;
pub mod handles;
pub mod inline;
pub mod platform;
pub mod rendering;
pub mod sync;
pub mod tier;

pub use cache::{CachedResource, ResourceCache};
pub use capture::{CaptureStatus, Capturer, SaveOptions};
pub use dom::{Document, NodeId};
pub use sync::{PhaseSynchronizer, SyncPolicy};

/// Configuration for snapshot export
///
/// Defaults match the recap panel the pipeline was built for: exports are
/// laid out at a desktop width and rendered at 3x.
///
/// # Examples
///
/// ```
/// let cfg = snapframe::CaptureConfig::default();
/// assert_eq!(cfg.min_capture_width, 1024);
/// assert_eq!(cfg.relay_path, "/api/image-proxy");
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// User agent string sent with direct requests
    pub user_agent: String,
    /// Timeout for each HTTP request in milliseconds
    pub timeout_ms: u64,
    /// Width the capture root is pinned to while exporting, in CSS pixels
    pub min_capture_width: u32,
    /// Device pixels per CSS pixel when the caller gives none
    pub pixel_ratio: f32,
    /// Fill behind the subtree when the caller gives none
    pub background_color: String,
    /// Longest wait for font faces before rasterizing anyway
    pub font_wait_ms: u64,
    /// Longest wait for image decoding before rasterizing anyway
    pub image_wait_ms: u64,
    /// Same-origin image relay endpoint
    pub relay_path: String,
    /// Same-origin image resizing endpoint whose query wraps the real source
    pub resize_path: String,
    pub resize_param: String,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            user_agent: "Mozilla/5.0 (X11; Linux x86_64) snapframe/0.1".to_string(),
            timeout_ms: 30000,
            min_capture_width: 1024,
            pixel_ratio: 3.0,
            background_color: "#f2f4f6".to_string(),
            font_wait_ms: 3000,
            image_wait_ms: 5000,
            relay_path: "/api/image-proxy".to_string(),
            resize_path: "/_next/image".to_string(),
            resize_param: "url".to_string(),
        }
    }
}

impl CaptureConfig {
    /// Parse a (possibly partial) JSON config; missing fields take defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::ConfigError(format!("invalid capture config: {}", e)))
    }
}
