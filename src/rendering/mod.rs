//! Rendering: layout, paint, raster, plus the tiered strategies that turn a
//! document subtree into an encoded image.

pub mod images;
pub mod layout;
pub mod paint;
pub mod raster;
pub mod strategy;

pub use images::ImageLoader;
pub use strategy::{plan, RasterRequest, RasterStrategy, StrategyKind, TieredRasterizer};

use crate::{Error, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};

/// An encoded PNG, as raw bytes or as a data URL.
#[derive(Debug, Clone, PartialEq)]
pub enum RasterOutput {
    Blob(Vec<u8>),
    DataUrl(String),
}

impl RasterOutput {
    /// The encoded image bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        match self {
            RasterOutput::Blob(bytes) => Ok(bytes.clone()),
            RasterOutput::DataUrl(url) => {
                let payload = url
                    .split_once(";base64,")
                    .map(|(_, p)| p)
                    .ok_or_else(|| Error::RenderError("data url is not base64".into()))?;
                STANDARD
                    .decode(payload)
                    .map_err(|e| Error::RenderError(format!("bad data url payload: {}", e)))
            }
        }
    }

    /// Size of the encoded representation.
    pub fn len(&self) -> usize {
        match self {
            RasterOutput::Blob(bytes) => bytes.len(),
            RasterOutput::DataUrl(url) => url.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
