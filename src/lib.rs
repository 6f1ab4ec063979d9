//! Frame extraction from recorded camera sessions and timestamp
//! correspondence between an untimed stream and a timed one.

pub mod calibration;
pub mod config;
pub mod container;
pub mod correspondence;
pub mod decoder;
pub mod diagnostics;
pub mod error;
pub mod exporter;
pub mod extract;
pub mod materializer;
pub mod table;
pub mod timestamps;
pub mod undistort;
pub mod utils;
pub mod video;

pub use error::{PipelineError, Result};
