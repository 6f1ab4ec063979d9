//! Frame correspondence between an untimed stream and a timed stream.
//!
//! The untimed stream (RGB video) has no usable per-frame capture time. Its
//! frames are mapped onto a timed stream (a grayscale tracking camera) with a
//! two-regime model:
//!
//! * for `i <= threshold` the streams are offset by a constant,
//!   `target = i + offset`;
//! * past the threshold the index advances at the ratio of the nominal frame
//!   rates, `target = floor(base + (i - threshold) * timed_rate / untimed_rate)`,
//!   where `base` is the first regime's value at the threshold.
//!
//! The floor always picks the earlier timed frame.

use crate::error::{PipelineError, Result};
use crate::timestamps::TimestampIndex;
use serde::{Deserialize, Serialize};

/// Calibration of the two-regime mapping for one recording session.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateModel {
    pub threshold: u32,
    pub offset: u32,
    pub timed_rate_hz: f64,
    pub untimed_rate_hz: f64,
}

impl Default for RateModel {
    fn default() -> Self {
        RateModel {
            threshold: 55,
            offset: 105,
            timed_rate_hz: 30.016041,
            untimed_rate_hz: 30_000.0 / 1001.0,
        }
    }
}

impl RateModel {
    pub fn validate(&self) -> Result<()> {
        for (name, rate) in [("timed_rate_hz", self.timed_rate_hz), ("untimed_rate_hz", self.untimed_rate_hz)] {
            if !rate.is_finite() || rate <= 0.0 {
                return Err(PipelineError::RateModel(format!("{} must be positive, got {}", name, rate)));
            }
        }
        Ok(())
    }

    /// Timed frames per untimed frame.
    pub fn slope(&self) -> f64 {
        self.timed_rate_hz / self.untimed_rate_hz
    }

    /// Target index at the regime boundary.
    pub fn base(&self) -> u64 {
        self.threshold as u64 + self.offset as u64
    }

    pub fn target_index(&self, source_index: u32) -> u64 {
        if source_index <= self.threshold {
            source_index as u64 + self.offset as u64
        } else {
            let steps = (source_index - self.threshold) as f64;
            (self.base() as f64 + steps * self.slope()).floor() as u64
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorrespondenceRecord {
    pub source_index: u32,
    pub target_index: u32,
    #[serde(rename = "timestamp_sec")]
    pub target_sec: u32,
    #[serde(rename = "timestamp_nsec")]
    pub target_nsec: u32,
}

/// Maps untimed frame indices to timed frames and their capture times.
///
/// Borrowing the finished [`TimestampIndex`] means the timed stream must be
/// fully materialized before any mapping happens.
pub struct CorrespondenceMapper<'a> {
    model: RateModel,
    oracle: &'a TimestampIndex,
}

impl<'a> CorrespondenceMapper<'a> {
    pub fn new(model: RateModel, oracle: &'a TimestampIndex) -> Result<Self> {
        model.validate()?;
        Ok(CorrespondenceMapper { model, oracle })
    }

    pub fn model(&self) -> &RateModel {
        &self.model
    }

    /// Map and resolve one source frame. A target past the end of the timed
    /// stream is reported as `CorrespondenceOutOfRange`, never clamped.
    pub fn resolve(&self, source_index: u32) -> Result<CorrespondenceRecord> {
        let target_index = self.model.target_index(source_index);
        let out_of_range = || PipelineError::CorrespondenceOutOfRange {
            source_index,
            target_index,
            available: self.oracle.len(),
        };
        let ts = self.oracle.get(target_index).ok_or_else(out_of_range)?;
        Ok(CorrespondenceRecord {
            source_index,
            target_index: u32::try_from(target_index).map_err(|_| out_of_range())?,
            target_sec: ts.sec,
            target_nsec: ts.nsec,
        })
    }
}
