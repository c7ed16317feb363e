//! Platform seams: animation frames, font readiness, downloads, notices,
//! media elements and runtime capabilities.
//!
//! The capture pipeline and the synchronizer only talk to the runtime
//! through these traits, so tests can run them against a deterministic
//! headless implementation.

pub mod device;
pub mod media;

pub use device::{Capabilities, EngineKind};
pub use media::{MediaElement, MediaState, ReadyState, SimulatedVideo, VideoFrame};

use crate::rendering::RasterOutput;
use crate::Result;
use async_trait::async_trait;
use log::{info, warn};
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

/// Runtime services used by the capture pipeline and the synchronizer.
#[async_trait]
pub trait Platform: Send + Sync {
    fn capabilities(&self) -> Capabilities;

    /// Resolve on the next animation frame.
    async fn next_frame(&self);

    /// Resolve once the document's font faces finished loading.
    async fn fonts_ready(&self);

    /// Hand the produced image to the user under `file_name`.
    async fn download(&self, file_name: &str, output: &RasterOutput) -> Result<()>;

    /// Show a single user-visible failure notice.
    fn notify_failure(&self, message: &str);
}

/// A file handed to the user by [`Platform::download`].
#[derive(Debug, Clone)]
pub struct Download {
    pub file_name: String,
    pub bytes: Vec<u8>,
}

/// Headless runtime: timer-driven frames, downloads kept in memory and
/// optionally written to a directory, notices recorded and logged.
pub struct HeadlessPlatform {
    capabilities: Capabilities,
    frame_interval: Duration,
    font_delay: Duration,
    out_dir: Option<PathBuf>,
    downloads: Mutex<Vec<Download>>,
    notices: Mutex<Vec<String>>,
}

impl HeadlessPlatform {
    pub fn new() -> Self {
        HeadlessPlatform {
            capabilities: Capabilities::headless(),
            frame_interval: Duration::from_millis(16),
            font_delay: Duration::ZERO,
            out_dir: None,
            downloads: Mutex::new(Vec::new()),
            notices: Mutex::new(Vec::new()),
        }
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Write every download into `dir` as well as keeping it in memory.
    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.out_dir = Some(dir.into());
        self
    }

    /// Pretend font faces take this long to become ready.
    pub fn with_font_delay(mut self, delay: Duration) -> Self {
        self.font_delay = delay;
        self
    }

    pub fn downloads(&self) -> Vec<Download> {
        self.downloads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn notices(&self) -> Vec<String> {
        self.notices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Default for HeadlessPlatform {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Platform for HeadlessPlatform {
    fn capabilities(&self) -> Capabilities {
        self.capabilities.clone()
    }

    async fn next_frame(&self) {
        tokio::time::sleep(self.frame_interval).await;
    }

    async fn fonts_ready(&self) {
        if !self.font_delay.is_zero() {
            tokio::time::sleep(self.font_delay).await;
        }
    }

    async fn download(&self, file_name: &str, output: &RasterOutput) -> Result<()> {
        let bytes = output.to_bytes()?;
        if let Some(dir) = &self.out_dir {
            std::fs::create_dir_all(dir)?;
            let path = dir.join(file_name);
            std::fs::write(&path, &bytes)?;
            info!("saved {} ({} bytes)", path.display(), bytes.len());
        }
        self.downloads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Download {
                file_name: file_name.to_string(),
                bytes,
            });
        Ok(())
    }

    fn notify_failure(&self, message: &str) {
        warn!("notice: {}", message);
        self.notices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(message.to_string());
    }
}
