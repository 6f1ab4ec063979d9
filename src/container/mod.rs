//! Access to recorded session containers.
//!
//! A container declares a catalog of streams and yields opaque records per
//! stream in recording order. The outer framing lives in the backends; the
//! rest of the pipeline only sees [`RawRecord`]s.

pub mod segment_log;

#[cfg(test)]
pub(crate) mod fixtures;

#[cfg(feature = "rosbag")]
pub mod rosbag;

use crate::error::{PipelineError, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

/// One record as stored in the container, before any message decoding.
#[derive(Debug, Clone)]
pub struct RawRecord {
    pub stream_id: String,
    /// Container-assigned arrival time in nanoseconds. Not the capture time.
    pub arrival_time: u64,
    pub payload: Bytes,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamInfo {
    pub message_type: Option<String>,
    pub message_count: u64,
}

/// Streams declared by a container, keyed by topic.
pub type StreamCatalog = BTreeMap<String, StreamInfo>;

/// Allow-list of stream identifiers.
#[derive(Debug, Clone, Default)]
pub struct StreamFilter {
    allowed: BTreeSet<String>,
}

impl StreamFilter {
    pub fn new<I, S>(streams: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        StreamFilter { allowed: streams.into_iter().map(Into::into).collect() }
    }

    pub fn allows(&self, stream_id: &str) -> bool {
        self.allowed.contains(stream_id)
    }

    pub fn streams(&self) -> impl Iterator<Item = &str> {
        self.allowed.iter().map(String::as_str)
    }

    /// Allowed streams that the catalog actually declares.
    pub fn matching(&self, catalog: &StreamCatalog) -> Vec<String> {
        catalog.keys().filter(|t| self.allows(t)).cloned().collect()
    }
}

pub type RecordIter<'a> = Box<dyn Iterator<Item = Result<RawRecord>> + 'a>;

/// A readable container backend.
pub trait RecordSource {
    fn catalog(&self) -> &StreamCatalog;

    /// Records whose stream passes `filter`, in container order. Handles are
    /// owned by the returned iterator and released when it is dropped.
    fn records(&self, filter: &StreamFilter) -> Result<RecordIter<'_>>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerFormat {
    #[default]
    Auto,
    SegmentLog,
    Rosbag,
}

impl ContainerFormat {
    fn resolve(self, path: &Path) -> ContainerFormat {
        match self {
            ContainerFormat::Auto => {
                let is_bag = path
                    .extension()
                    .and_then(|e| e.to_str())
                    .map(|e| e.eq_ignore_ascii_case("bag"))
                    .unwrap_or(false);
                if is_bag {
                    ContainerFormat::Rosbag
                } else {
                    ContainerFormat::SegmentLog
                }
            }
            other => other,
        }
    }
}

/// Open a container, failing with `ContainerNotFound` if the path is absent.
pub fn open_container(path: &Path, format: ContainerFormat) -> Result<Box<dyn RecordSource>> {
    if !path.exists() {
        return Err(PipelineError::ContainerNotFound(path.to_path_buf()));
    }
    match format.resolve(path) {
        ContainerFormat::SegmentLog | ContainerFormat::Auto => Ok(Box::new(segment_log::SegmentLog::open(path)?)),
        #[cfg(feature = "rosbag")]
        ContainerFormat::Rosbag => Ok(Box::new(rosbag::BagContainer::open(path)?)),
        #[cfg(not(feature = "rosbag"))]
        ContainerFormat::Rosbag => Err(PipelineError::ContainerFormat(format!(
            "{} looks like a ROS bag, but this build lacks the `rosbag` feature",
            path.display()
        ))),
    }
}

/// Demultiplex `filter`'s streams out of `source`.
///
/// Fails with `NoMatchingStreams` when the allow-list and the catalog are
/// disjoint; otherwise the records are produced lazily.
pub fn demux<'a>(source: &'a dyn RecordSource, filter: &StreamFilter) -> Result<RecordIter<'a>> {
    let matching = filter.matching(source.catalog());
    if matching.is_empty() {
        return Err(PipelineError::NoMatchingStreams {
            requested: filter.streams().map(str::to_string).collect(),
            declared: source.catalog().keys().cloned().collect(),
        });
    }
    for stream in filter.streams() {
        if !source.catalog().contains_key(stream) {
            tracing::warn!(topic = stream, "requested stream not present in container");
        }
    }
    tracing::debug!(?matching, "demultiplexing streams");
    source.records(filter)
}
