//! Error types for the camera client.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CamError {
    /// Device unreachable or answered with a non-success status.
    #[error("Connection: {0}")]
    Connection(String),

    /// Malformed JSON or a missing field in a device payload.
    #[error("Parse: {0}")]
    Parse(String),

    /// A device-reported value is not in its available set.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("HTTP: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Image: {0}")]
    Image(#[from] image::ImageError),

    #[error("URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("Config: {0}")]
    Config(String),
}

impl CamError {
    /// Map a transport failure to `Connection` when the device could not be
    /// reached at all, keeping the original error otherwise.
    pub fn from_send(e: reqwest::Error) -> Self {
        if e.is_connect() || e.is_timeout() {
            Self::Connection(e.to_string())
        } else {
            Self::Http(e)
        }
    }
}

pub type Result<T> = std::result::Result<T, CamError>;
