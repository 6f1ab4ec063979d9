use crate::decoder::DecodedImageRecord;
use crate::diagnostics::{ExtractionReport, StreamStats};
use crate::error::{PipelineError, Result};
use crate::timestamps::TimestampIndex;
use crate::utils::{sanitize_topic, write_atomic, FrameName, FRAME_PREFIX};
use image::{DynamicImage, ImageFormat};
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::Cursor;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct MaterializeOptions {
    /// Stop saving a stream after this many frames.
    pub max_frames_per_stream: Option<u32>,
    pub image_extension: String,
    /// Store frames as 8-bit grayscale.
    pub grayscale: bool,
}

impl Default for MaterializeOptions {
    fn default() -> Self {
        MaterializeOptions { max_frames_per_stream: None, image_extension: "png".to_string(), grayscale: true }
    }
}

/// A frame written to disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedFrame {
    pub stream_id: String,
    pub sequence_index: u32,
    pub capture_sec: u32,
    pub capture_nsec: u32,
    pub path: PathBuf,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    Undecodable(String),
    WriteFailed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MaterializeOutcome {
    Saved(PersistedFrame),
    Skipped(SkipReason),
    /// The stream already hit its frame cap; the record was not decoded.
    Capped,
}

#[derive(Serialize)]
struct TimestampRow<'a> {
    sequence_index: u32,
    timestamp_sec: u32,
    timestamp_nsec: u32,
    filename: &'a str,
}

struct StreamSink {
    stats: StreamStats,
    index: TimestampIndex,
    file_names: Vec<String>,
}

/// Turns decoded image records into frame files, one directory per stream.
pub struct FrameMaterializer {
    options: MaterializeOptions,
    format: ImageFormat,
    sinks: BTreeMap<String, StreamSink>,
}

impl FrameMaterializer {
    /// Prepare an output directory for every stream, including streams that
    /// will never receive a record.
    pub async fn create<I, S>(output_root: &Path, streams: I, options: MaterializeOptions) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let format = ImageFormat::from_extension(&options.image_extension).ok_or_else(|| {
            PipelineError::ContainerFormat(format!("unsupported image extension {:?}", options.image_extension))
        })?;

        let mut sinks = BTreeMap::new();
        for stream in streams {
            let stream = stream.as_ref();
            let dir = output_root.join(sanitize_topic(stream));
            tokio::fs::create_dir_all(&dir).await?;
            sinks.insert(
                stream.to_string(),
                StreamSink {
                    stats: StreamStats { output_dir: dir, ..StreamStats::default() },
                    index: TimestampIndex::new(),
                    file_names: Vec::new(),
                },
            );
        }
        Ok(FrameMaterializer { options, format, sinks })
    }

    fn sink_mut(&mut self, stream_id: &str) -> Result<&mut StreamSink> {
        self.sinks
            .get_mut(stream_id)
            .ok_or_else(|| PipelineError::UnknownStream(stream_id.to_string()))
    }

    pub fn is_capped(&self, stream_id: &str) -> bool {
        match (self.options.max_frames_per_stream, self.sinks.get(stream_id)) {
            (Some(cap), Some(sink)) => sink.stats.saved >= cap as u64,
            _ => false,
        }
    }

    pub fn stats(&self, stream_id: &str) -> Option<&StreamStats> {
        self.sinks.get(stream_id).map(|s| &s.stats)
    }

    /// Count a record that never reached the materializer because its
    /// message bytes were malformed.
    pub fn record_malformed(&mut self, stream_id: &str) -> Result<()> {
        self.sink_mut(stream_id)?.stats.malformed += 1;
        Ok(())
    }

    /// Count a record dropped because the stream reached its cap.
    pub fn record_capped(&mut self, stream_id: &str) -> Result<()> {
        self.sink_mut(stream_id)?.stats.ignored_over_cap += 1;
        Ok(())
    }

    pub async fn materialize(&mut self, stream_id: &str, record: &DecodedImageRecord) -> Result<MaterializeOutcome> {
        if self.is_capped(stream_id) {
            self.record_capped(stream_id)?;
            return Ok(MaterializeOutcome::Capped);
        }
        let grayscale = self.options.grayscale;
        let format = self.format;
        let ext = self.options.image_extension.clone();
        let sink = self.sink_mut(stream_id)?;

        let raster = match image::load_from_memory(&record.payload) {
            Ok(img) if grayscale => DynamicImage::ImageLuma8(img.to_luma8()),
            Ok(img) => img,
            Err(e) => {
                sink.stats.skipped_decode += 1;
                tracing::warn!(topic = stream_id, encoding = %record.encoding_tag, error = %e, "skipping undecodable frame");
                return Ok(MaterializeOutcome::Skipped(SkipReason::Undecodable(e.to_string())));
            }
        };

        let sequence_index = sink.stats.saved as u32;
        let name = FrameName::new(FRAME_PREFIX, sequence_index, record.capture_sec, record.capture_nsec, &ext);
        let file_name = name.file_name();
        let path = sink.stats.output_dir.join(&file_name);

        let mut encoded = Vec::new();
        let written = match raster.write_to(&mut Cursor::new(&mut encoded), format) {
            Ok(()) => write_atomic(&path, &encoded).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = written {
            sink.stats.skipped_decode += 1;
            tracing::warn!(topic = stream_id, path = %path.display(), error = %e, "failed to write frame");
            return Ok(MaterializeOutcome::Skipped(SkipReason::WriteFailed(e.to_string())));
        }

        sink.index.push(sequence_index, record.capture_sec, record.capture_nsec)?;
        sink.file_names.push(file_name);
        sink.stats.saved += 1;
        tracing::debug!(topic = stream_id, index = sequence_index, "saved {}", path.display());

        Ok(MaterializeOutcome::Saved(PersistedFrame {
            stream_id: stream_id.to_string(),
            sequence_index,
            capture_sec: record.capture_sec,
            capture_nsec: record.capture_nsec,
            path,
            width: raster.width(),
            height: raster.height(),
        }))
    }

    /// Write each stream's `timestamps.csv` and hand back the counters and
    /// the in-memory timestamp index of every stream.
    pub async fn finish(self) -> Result<(ExtractionReport, BTreeMap<String, TimestampIndex>)> {
        let mut report = ExtractionReport::default();
        let mut indices = BTreeMap::new();
        for (stream, sink) in self.sinks {
            let mut wtr = csv::Writer::from_writer(Vec::new());
            for ((sequence_index, ts), filename) in sink.index.iter().zip(&sink.file_names) {
                wtr.serialize(TimestampRow {
                    sequence_index,
                    timestamp_sec: ts.sec,
                    timestamp_nsec: ts.nsec,
                    filename,
                })?;
            }
            let data = wtr.into_inner().map_err(|e| e.into_error())?;
            write_atomic(&sink.stats.output_dir.join("timestamps.csv"), &data).await?;

            report.streams.insert(stream.clone(), sink.stats);
            indices.insert(stream, sink.index);
        }
        Ok((report, indices))
    }
}
