use crate::error::Result;
use std::path::{Path, PathBuf};

/// Prefix used for frames materialized from the container.
pub const FRAME_PREFIX: &str = "frame";

/// Convert a topic into a filesystem-safe directory name.
///
/// `/camera_0/image_raw/compressed` becomes `camera_0_image_raw_compressed`.
pub fn sanitize_topic(topic: &str) -> String {
    topic.trim_matches('/').replace('/', "_")
}

/// The parts encoded in a frame filename:
/// `{prefix}_{index:06}_{sec}_{nsec:09}.{ext}`.
///
/// Zero padding keeps lexicographic order equal to sequence order, and the
/// sequence order of a stream is its temporal order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameName {
    pub prefix: String,
    pub index: u32,
    pub sec: u32,
    pub nsec: u32,
    pub ext: String,
}

impl FrameName {
    pub fn new(prefix: &str, index: u32, sec: u32, nsec: u32, ext: &str) -> Self {
        FrameName {
            prefix: prefix.to_string(),
            index,
            sec,
            nsec,
            ext: ext.trim_start_matches('.').to_string(),
        }
    }

    pub fn file_name(&self) -> String {
        format!(
            "{}_{:06}_{}_{:09}.{}",
            self.prefix, self.index, self.sec, self.nsec, self.ext
        )
    }

    /// Parse a name produced by [`FrameName::file_name`].
    ///
    /// Splits the stem on `_`: token 1 is the index, token 2 the seconds and
    /// token 3 the nanoseconds. The prefix itself must not contain `_`.
    pub fn parse(file_name: &str) -> Option<Self> {
        let (stem, ext) = file_name.rsplit_once('.')?;
        let parts: Vec<&str> = stem.split('_').collect();
        if parts.len() != 4 || parts[0].is_empty() {
            return None;
        }
        let index = parts[1].parse().ok()?;
        let sec = parts[2].parse().ok()?;
        let nsec: u32 = parts[3].parse().ok()?;
        if parts[3].len() != 9 || nsec >= 1_000_000_000 {
            return None;
        }
        Some(FrameName {
            prefix: parts[0].to_string(),
            index,
            sec,
            nsec,
            ext: ext.to_string(),
        })
    }
}

/// Pull the frame index out of a loosely named frame file such as
/// `rgb_00012.png` or `frame_000012_17_000000001.png`.
pub fn parse_frame_index(file_name: &str) -> Option<u32> {
    let stem = file_name.rsplit_once('.').map(|(s, _)| s).unwrap_or(file_name);
    stem.split('_').nth(1)?.parse().ok()
}

/// Write a file so that it either exists completely or not at all.
pub async fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let tmp_path = tmp_sibling(path);
    if let Err(e) = tokio::fs::write(&tmp_path, data).await {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(e.into());
    }
    if let Err(e) = tokio::fs::rename(&tmp_path, path).await {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(e.into());
    }
    Ok(())
}

fn tmp_sibling(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{}.tmp", name))
}

/// List regular files in `dir` with the given extension, sorted by name.
pub fn list_files_with_ext(dir: &Path, ext: &str) -> Result<Vec<PathBuf>> {
    let ext = ext.trim_start_matches('.');
    let mut out = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        let hidden = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.starts_with('.'))
            .unwrap_or(true);
        let matches = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.eq_ignore_ascii_case(ext))
            .unwrap_or(false);
        if matches && !hidden {
            out.push(path);
        }
    }
    out.sort();
    Ok(out)
}
