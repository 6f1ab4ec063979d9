use crate::error::{PipelineError, Result};
use crate::utils::{list_files_with_ext, FrameName};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameTimestamp {
    pub sec: u32,
    pub nsec: u32,
}

/// Capture time of every materialized frame of one timed stream, indexed by
/// sequence index.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TimestampIndex {
    entries: Vec<FrameTimestamp>,
}

impl TimestampIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the next frame. Indices must arrive in order without gaps.
    pub fn push(&mut self, index: u32, sec: u32, nsec: u32) -> Result<()> {
        if index as usize != self.entries.len() {
            return Err(PipelineError::TimestampIndex(format!(
                "expected frame {}, got {}",
                self.entries.len(),
                index
            )));
        }
        self.entries.push(FrameTimestamp { sec, nsec });
        Ok(())
    }

    pub fn get(&self, index: u64) -> Option<FrameTimestamp> {
        usize::try_from(index).ok().and_then(|i| self.entries.get(i)).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, FrameTimestamp)> + '_ {
        self.entries.iter().enumerate().map(|(i, ts)| (i as u32, *ts))
    }

    /// Rebuild the index from a frame directory, reading each capture time
    /// back out of the `frame_{index}_{sec}_{nsec}` filenames.
    pub fn from_frame_dir(dir: &Path, ext: &str) -> Result<Self> {
        let mut names: Vec<FrameName> = list_files_with_ext(dir, ext)?
            .iter()
            .filter_map(|p| p.file_name().and_then(|n| n.to_str()))
            .filter_map(|n| {
                let parsed = FrameName::parse(n);
                if parsed.is_none() {
                    tracing::debug!(file = n, "not a frame file, ignoring");
                }
                parsed
            })
            .collect();
        names.sort_by_key(|n| n.index);

        let mut index = TimestampIndex::new();
        for name in names {
            index.push(name.index, name.sec, name.nsec).map_err(|e| {
                PipelineError::TimestampIndex(format!("{} in {}", e, dir.display()))
            })?;
        }
        tracing::info!(frames = index.len(), "loaded timestamps from {}", dir.display());
        Ok(index)
    }
}
