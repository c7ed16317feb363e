//! Error types for the capture and sync engine

use thiserror::Error;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while capturing or synchronizing
#[derive(Error, Debug)]
pub enum Error {
    /// Failed to initialize a backend (HTTP client, output directory)
    #[error("Initialization failed: {0}")]
    InitializationError(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    ConfigError(String),

    /// Network error while fetching a resource
    #[error("Network error: {0}")]
    NetworkError(String),

    /// The relay answered, but not with something usable
    #[error("Relay error: {0}")]
    RelayError(String),

    /// Failed to render content
    #[error("Rendering failed: {0}")]
    RenderError(String),

    /// Font embedding could not be produced
    #[error("Font embedding failed: {0}")]
    FontError(String),

    /// Media element misbehaved (not ready, play rejected)
    #[error("Media error: {0}")]
    MediaError(String),

    /// Pixel readout was blocked (tainted canvas)
    #[error("Security error: {0}")]
    SecurityError(String),

    /// Document manipulation on a missing or detached node
    #[error("DOM error: {0}")]
    DomError(String),

    /// Operation timed out
    #[error("Operation timed out after {0}ms")]
    Timeout(u64),

    /// I/O failure (download target, config file)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

#[cfg(feature = "relay")]
impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::NetworkError(err.to_string())
    }
}

impl From<png::EncodingError> for Error {
    fn from(err: png::EncodingError) -> Self {
        Error::RenderError(format!("PNG encoding failed: {}", err))
    }
}

impl From<image::ImageError> for Error {
    fn from(err: image::ImageError) -> Self {
        Error::RenderError(format!("Image decoding failed: {}", err))
    }
}
