//! Runtime capability detection for choosing raster strategies

use serde::{Deserialize, Serialize};

/// Rendering engine family behind the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    Chromium,
    Gecko,
    WebKit,
    Headless,
}

/// What the runtime declares it can do.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Capabilities {
    pub engine: EngineKind,
    /// SVG `foreignObject` rendering is trustworthy (the DOM-to-image path needs it).
    pub foreign_object: bool,
    /// Binary blobs can be produced and downloaded without a data URL detour.
    pub blob_output: bool,
    pub touch: bool,
}

impl Capabilities {
    pub fn headless() -> Self {
        Capabilities {
            engine: EngineKind::Headless,
            foreign_object: true,
            blob_output: true,
            touch: false,
        }
    }

    /// Derive capabilities from a user-agent signature.
    ///
    /// Every browser on iOS runs WebKit regardless of branding (`CriOS`,
    /// `FxiOS`, `EdgiOS`), and WebKit renders `foreignObject` snapshots with
    /// missing images and fonts.
    pub fn from_user_agent(ua: &str) -> Self {
        let ios = ua.contains("iPhone") || ua.contains("iPad") || ua.contains("iPod");
        let touch = ios || ua.contains("Android") || ua.contains("Mobile");
        let engine = if ua.contains("HeadlessChrome") || ua.contains("snapframe/") {
            EngineKind::Headless
        } else if ios {
            EngineKind::WebKit
        } else if ua.contains("Firefox/") {
            EngineKind::Gecko
        } else if ua.contains("Chrome/") || ua.contains("Chromium/") || ua.contains("Edg/") {
            EngineKind::Chromium
        } else if ua.contains("AppleWebKit/") && ua.contains("Safari/") {
            EngineKind::WebKit
        } else {
            EngineKind::Headless
        };
        Capabilities {
            engine,
            foreign_object: engine != EngineKind::WebKit,
            blob_output: true,
            touch,
        }
    }
}

impl Default for Capabilities {
    fn default() -> Self {
        Self::headless()
    }
}
