//! Error types for bandstack

use thiserror::Error;

/// Main error type for bandstack operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unsupported raster format: {0}")]
    Format(String),

    #[error("Shape mismatch: expected {expected:?} (bands, rows, cols), got {actual:?}")]
    ShapeMismatch {
        expected: (usize, usize, usize),
        actual: (usize, usize, usize),
    },

    #[error("Band index {index} out of range for raster with {count} band(s)")]
    BandIndex { index: usize, count: usize },

    #[error("Cyclic layer dependency: {}", .0.join(" -> "))]
    CyclicDependency(Vec<String>),

    #[error("Unknown layer: {0}")]
    UnknownLayer(String),

    #[error("Layer declared twice: {0}")]
    DuplicateLayer(String),

    #[error("Region of interest does not overlap the raster extent")]
    EmptyIntersection,

    #[error("Metadata declares {key} = {declared}, but the data has {actual}")]
    MetadataConsistency {
        key: &'static str,
        declared: usize,
        actual: usize,
    },

    #[error("CRS mismatch: {0} vs {1}")]
    CrsMismatch(String, String),

    #[error("Invalid region of interest: {0}")]
    InvalidRegion(String),

    #[error("Formula error: {0}")]
    Formula(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid parameter: {name} = {value} ({reason})")]
    InvalidParameter {
        name: &'static str,
        value: String,
        reason: String,
    },

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// An I/O error for files that exist but cannot be decoded as a raster
    pub(crate) fn invalid_data(msg: impl Into<String>) -> Self {
        Error::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            msg.into(),
        ))
    }
}

impl From<ndarray::ShapeError> for Error {
    fn from(e: ndarray::ShapeError) -> Self {
        Error::Other(e.to_string())
    }
}

/// Result type alias for bandstack operations
pub type Result<T> = std::result::Result<T, Error>;
