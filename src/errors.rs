//! Error taxonomy for the whole client.
//!
//! Every failure mode carries a distinct kind so the CLI can map it to a
//! stable process exit code. Per-item failures (a single unreadable file, a
//! single malformed manifest) are never represented here; those are collected
//! locally by the component that hit them and surfaced in its result.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("failed to establish connection to the backend")]
    HttpConnection(#[from] reqwest::Error),

    #[error("unsuccessful {status} response from the backend")]
    HttpUnsuccessful { status: u16, body: Vec<u8> },

    #[error("the requested resource was not found")]
    HttpNotFound,

    #[error("the requested resource is restricted, check API access")]
    HttpNotAllowed,

    #[error("failed to load image {input}: {reason}")]
    ImageLoad { input: String, reason: String },

    #[error("failed to generate sbom: {0}")]
    SbomGeneration(String),

    #[error("failed to generate image layers: {0}")]
    LayersGeneration(String),

    #[error("scan failed: {0}")]
    ScanFailed(String),

    #[error("validation failed: {0}")]
    ValidateFailed(String),

    #[error("timed out during status polling")]
    Timeout,

    #[error("interrupt signal detected during scan")]
    Interrupted,

    #[error("found {count} policy violations")]
    PolicyViolation { count: usize },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Process exit code for a terminal error, mirrored by the CLI.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Config(_) => 2,
            Error::PolicyViolation { .. } => 127,
            _ => 1,
        }
    }
}
