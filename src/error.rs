use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by the extraction and synchronization pipeline.
///
/// `ContainerNotFound` and `NoMatchingStreams` are fatal at startup. The
/// per-record variants are caught by the caller, counted and skipped.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("container not found: {}", .0.display())]
    ContainerNotFound(PathBuf),

    #[error("none of the requested streams {requested:?} exist in the container (declared: {declared:?})")]
    NoMatchingStreams {
        requested: Vec<String>,
        declared: Vec<String>,
    },

    #[error("malformed record: {field} needs {needed} bytes at offset {offset}, {available} available")]
    MalformedRecord {
        field: &'static str,
        offset: usize,
        needed: usize,
        available: usize,
    },

    #[error("malformed record: {0}")]
    InvalidRecord(String),

    #[error("source frame {source_index} maps to timed frame {target_index}, but only {available} timed frames exist")]
    CorrespondenceOutOfRange {
        source_index: u32,
        target_index: u64,
        available: usize,
    },

    #[error("no input file for source frame {0}")]
    MissingSourceFrame(u32),

    #[error("timestamp index: {0}")]
    TimestampIndex(String),

    #[error("correspondence table: {0}")]
    Table(String),

    #[error("unknown stream: {0}")]
    UnknownStream(String),

    #[error("container format: {0}")]
    ContainerFormat(String),

    #[error("calibration {}: {reason}", path.display())]
    Calibration { path: PathBuf, reason: String },

    #[error("invalid rate model: {0}")]
    RateModel(String),

    #[error("video: {0}")]
    Video(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Image(#[from] image::ImageError),

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Toml(#[from] toml::de::Error),
}

impl PipelineError {
    /// Whether the error only affects a single record and the pass can go on.
    pub fn is_per_record(&self) -> bool {
        matches!(
            self,
            PipelineError::MalformedRecord { .. } | PipelineError::InvalidRecord(_)
        )
    }
}

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;
