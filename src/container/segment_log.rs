use super::{RawRecord, RecordIter, RecordSource, StreamCatalog, StreamFilter, StreamInfo};
use crate::error::{PipelineError, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};

const RECORD_FRAME_HEADER: u32 = 0xDEADBEEF;
const MAX_META_LEN: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    #[default]
    None,
    Lz4,
    Zstd,
}

impl Compression {
    #[cfg(test)]
    fn compress(self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            Compression::None => Ok(data.to_vec()),
            Compression::Lz4 => Ok(lz4::block::compress(data, None, true)?),
            Compression::Zstd => Ok(zstd::encode_all(data, 3)?),
        }
    }

    fn decompress(self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            Compression::None => Ok(data.to_vec()),
            Compression::Lz4 => Ok(lz4::block::decompress(data, None)?),
            Compression::Zstd => Ok(zstd::decode_all(data)?),
        }
    }
}

/// Per-record metadata and payload framing
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RecordFrame {
    magic: u32,
    timestamp: u64,
    topic: String,
    msg_type: String,
    #[serde(default)]
    compression: Compression,
    /// Length of the payload as stored, after compression.
    payload_len: u32,
    /// CRC32 of the uncompressed payload.
    payload_crc32: u32,
}

impl RecordFrame {
    #[cfg(test)]
    fn to_bytes(&self, stored: &[u8]) -> Result<Vec<u8>> {
        let meta_json = serde_json::to_vec(&self)?;
        let mut buf = Vec::with_capacity(8 + meta_json.len() + stored.len());
        buf.extend_from_slice(&self.magic.to_le_bytes());
        buf.extend_from_slice(&(meta_json.len() as u32).to_le_bytes());
        buf.extend_from_slice(&meta_json);
        buf.extend_from_slice(stored);
        Ok(buf)
    }

    /// Read the next frame header, leaving the reader at the payload.
    /// Returns `Ok(None)` at a clean end of segment.
    fn read_header<R: BufRead>(reader: &mut R) -> Result<Option<RecordFrame>> {
        if reader.fill_buf()?.is_empty() {
            return Ok(None);
        }

        let mut magic_buf = [0u8; 4];
        reader.read_exact(&mut magic_buf)?;
        let magic = u32::from_le_bytes(magic_buf);
        if magic != RECORD_FRAME_HEADER {
            return Err(PipelineError::InvalidRecord(format!("bad frame magic {:#010x}", magic)));
        }

        let mut len_buf = [0u8; 4];
        reader.read_exact(&mut len_buf)?;
        let meta_len = u32::from_le_bytes(len_buf) as usize;
        if meta_len > MAX_META_LEN {
            return Err(PipelineError::InvalidRecord(format!("frame metadata of {} bytes", meta_len)));
        }

        let mut meta_buf = vec![0u8; meta_len];
        reader.read_exact(&mut meta_buf)?;
        let frame: RecordFrame = serde_json::from_slice(&meta_buf)?;
        Ok(Some(frame))
    }

    fn read_stored<R: Read>(&self, reader: &mut R) -> std::io::Result<Vec<u8>> {
        let mut stored = vec![0u8; self.payload_len as usize];
        reader.read_exact(&mut stored)?;
        Ok(stored)
    }

    fn unpack(&self, stored: &[u8]) -> Result<Bytes> {
        let payload = self.compression.decompress(stored).map_err(|e| {
            PipelineError::InvalidRecord(format!("{:?} payload on {}: {}", self.compression, self.topic, e))
        })?;
        let crc = crc32fast::hash(&payload);
        if crc != self.payload_crc32 {
            return Err(PipelineError::InvalidRecord(format!(
                "payload CRC mismatch on {}: expected {}, got {}",
                self.topic, self.payload_crc32, crc
            )));
        }
        Ok(Bytes::from(payload))
    }
}

fn segment_number(path: &Path) -> Option<u64> {
    let name = path.file_name()?.to_str()?;
    name.strip_prefix("segment-")?.strip_suffix(".log")?.parse().ok()
}

/// Segment files under `root`, in numeric order.
pub fn list_segments(root: &Path) -> Result<Vec<PathBuf>> {
    let mut out: Vec<(u64, PathBuf)> = Vec::new();
    for entry in std::fs::read_dir(root)? {
        let p = entry?.path();
        if let Some(n) = segment_number(&p) {
            out.push((n, p));
        }
    }
    out.sort();
    Ok(out.into_iter().map(|(_, p)| p).collect())
}

/// SHA-256 over a container: the file itself, or every segment in order.
pub fn container_checksum(path: &Path) -> Result<String> {
    let files = if path.is_dir() { list_segments(path)? } else { vec![path.to_path_buf()] };
    let mut hasher = Sha256::new();
    for f in files {
        let mut file = File::open(&f)?;
        std::io::copy(&mut file, &mut hasher)?;
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Frame one record the way [`SegmentLog`] reads it back.
#[cfg(test)]
pub(crate) fn encode_frame(
    topic: &str,
    msg_type: &str,
    compression: Compression,
    data: &[u8],
    timestamp: u64,
) -> Result<Vec<u8>> {
    let stored = compression.compress(data)?;
    let frame = RecordFrame {
        magic: RECORD_FRAME_HEADER,
        timestamp,
        topic: topic.to_string(),
        msg_type: msg_type.to_string(),
        compression,
        payload_len: stored.len() as u32,
        payload_crc32: crc32fast::hash(data),
    };
    frame.to_bytes(&stored)
}

/// A segment-log container opened for reading.
pub struct SegmentLog {
    segments: Vec<PathBuf>,
    catalog: StreamCatalog,
}

impl SegmentLog {
    /// Open a segment directory or a single segment file and index its topics.
    pub fn open(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(PipelineError::ContainerNotFound(path.to_path_buf()));
        }
        let segments = if path.is_dir() { list_segments(path)? } else { vec![path.to_path_buf()] };

        let mut catalog = StreamCatalog::new();
        for segment in &segments {
            Self::scan_segment(segment, &mut catalog)?;
        }
        tracing::info!(
            segments = segments.len(),
            streams = catalog.len(),
            "opened segment log {}",
            path.display()
        );
        Ok(SegmentLog { segments, catalog })
    }

    fn scan_segment(path: &Path, catalog: &mut StreamCatalog) -> Result<()> {
        let mut reader = BufReader::new(File::open(path)?);
        loop {
            let frame = match RecordFrame::read_header(&mut reader) {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(segment = %path.display(), error = %e, "stopping scan at corrupt frame");
                    break;
                }
            };
            reader.seek_relative(frame.payload_len as i64)?;
            let info = catalog.entry(frame.topic).or_insert_with(StreamInfo::default);
            info.message_count += 1;
            if info.message_type.is_none() {
                info.message_type = Some(frame.msg_type);
            }
        }
        Ok(())
    }
}

impl RecordSource for SegmentLog {
    fn catalog(&self) -> &StreamCatalog {
        &self.catalog
    }

    fn records(&self, filter: &StreamFilter) -> Result<RecordIter<'_>> {
        Ok(Box::new(SegmentRecords {
            pending: self.segments.iter().cloned().collect(),
            current: None,
            filter: filter.clone(),
        }))
    }
}

/// Lazy record stream over a list of segments. At most one file is open.
struct SegmentRecords {
    pending: VecDeque<PathBuf>,
    current: Option<(PathBuf, BufReader<File>)>,
    filter: StreamFilter,
}

impl Iterator for SegmentRecords {
    type Item = Result<RawRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.current.is_none() {
                let path = self.pending.pop_front()?;
                match File::open(&path) {
                    Ok(f) => self.current = Some((path, BufReader::new(f))),
                    Err(e) => return Some(Err(e.into())),
                }
            }
            let Some((path, reader)) = self.current.as_mut() else { continue };

            let frame = match RecordFrame::read_header(reader) {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    self.current = None;
                    continue;
                }
                Err(e) => {
                    tracing::warn!(segment = %path.display(), error = %e, "abandoning corrupt segment tail");
                    let err = PipelineError::InvalidRecord(format!("corrupt frame header in {}: {}", path.display(), e));
                    self.current = None;
                    return Some(Err(err));
                }
            };

            if !self.filter.allows(&frame.topic) {
                if let Err(e) = reader.seek_relative(frame.payload_len as i64) {
                    self.current = None;
                    return Some(Err(e.into()));
                }
                continue;
            }

            let stored = match frame.read_stored(reader) {
                Ok(stored) => stored,
                Err(e) => {
                    tracing::warn!(segment = %path.display(), topic = %frame.topic, "truncated payload");
                    let err = PipelineError::InvalidRecord(format!("truncated {} payload in {}: {}", frame.topic, path.display(), e));
                    self.current = None;
                    return Some(Err(err));
                }
            };

            return Some(frame.unpack(&stored).map(|payload| RawRecord {
                stream_id: frame.topic,
                arrival_time: frame.timestamp,
                payload,
            }));
        }
    }
}
