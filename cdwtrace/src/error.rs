// Error types for the cdwtrace library
// The binary wraps these in anyhow with extra context

use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CdwError>;

#[derive(Debug, Error)]
pub enum CdwError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to decode raster {path}: {source}")]
    Tiff {
        path: PathBuf,
        #[source]
        source: tiff::TiffError,
    },
    #[error("unsupported raster {path}: {reason}")]
    UnsupportedRaster { path: PathBuf, reason: String },
    #[error("window {window} lies outside the {width}x{height} raster")]
    WindowOutOfBounds {
        window: cdwtrace_common::Window,
        width: u32,
        height: u32,
    },
    #[error("failed to parse labels {path}: {source}")]
    Labels {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("image error at {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("csv error at {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Config {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("labels are in {labels} but the raster is in {raster}, and no coordinate transform was supplied")]
    CrsMismatch { labels: String, raster: String },
    #[error("reprojection from {from} to {to} failed: {reason}")]
    Reprojection {
        from: String,
        to: String,
        reason: String,
    },
    #[error("segmentation predictor failed: {0}")]
    Predictor(String),
    #[error("malformed dataset at {path}: {reason}")]
    Dataset { path: PathBuf, reason: String },
}

impl CdwError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        CdwError::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        CdwError::InvalidConfig(msg.into())
    }
}
