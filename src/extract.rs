use crate::container::{demux, RecordSource, StreamFilter};
use crate::decoder::decode_compressed_image;
use crate::diagnostics::ExtractionReport;
use crate::error::Result;
use crate::materializer::{FrameMaterializer, MaterializeOptions, MaterializeOutcome};
use crate::timestamps::TimestampIndex;
use std::collections::BTreeMap;
use std::path::Path;

/// Drain the allow-listed streams of `source` into frame directories under
/// `output_root`.
///
/// Per-record failures only move counters. Returns the report and the
/// timestamp index of every stream.
pub async fn run_extraction(
    source: &dyn RecordSource,
    topics: &[String],
    output_root: &Path,
    options: MaterializeOptions,
) -> Result<(ExtractionReport, BTreeMap<String, TimestampIndex>)> {
    let filter = StreamFilter::new(topics);
    let records = demux(source, &filter)?;
    let mut materializer = FrameMaterializer::create(output_root, filter.streams(), options).await?;

    tracing::info!("extracting {} stream(s) into {}", topics.len(), output_root.display());
    let mut container_errors = 0u64;
    let mut seen = 0u64;
    for item in records {
        let raw = match item {
            Ok(raw) => raw,
            Err(e) if e.is_per_record() => {
                container_errors += 1;
                tracing::warn!(error = %e, "skipping unreadable container record");
                continue;
            }
            Err(e) => return Err(e),
        };
        seen += 1;

        if materializer.is_capped(&raw.stream_id) {
            materializer.record_capped(&raw.stream_id)?;
            continue;
        }

        let decoded = match decode_compressed_image(&raw.payload) {
            Ok(decoded) => decoded,
            Err(e) => {
                tracing::warn!(topic = %raw.stream_id, arrival = raw.arrival_time, error = %e, "malformed record");
                materializer.record_malformed(&raw.stream_id)?;
                continue;
            }
        };

        if let MaterializeOutcome::Saved(frame) = materializer.materialize(&raw.stream_id, &decoded).await? {
            if frame.sequence_index > 0 && frame.sequence_index % 500 == 0 {
                tracing::info!(topic = %frame.stream_id, "{} frames saved", frame.sequence_index);
            }
        }
    }

    let (mut report, indices) = materializer.finish().await?;
    report.container_errors = container_errors;
    tracing::debug!(records = seen, "container drained");
    report.log_summary();
    Ok((report, indices))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::fixtures::SegmentWriter;
    use crate::container::segment_log::SegmentLog;
    use crate::decoder::{encode_compressed_image, DecodedImageRecord};
    use crate::materializer::tests::png_bytes;
    use bytes::Bytes;
    use tempfile::TempDir;

    const CAM: &str = "/camera_2/image_raw/compressed";
    const IMU: &str = "/imu/data";

    fn image_message(seq: u32, sec: u32, payload: Vec<u8>) -> Vec<u8> {
        let record = DecodedImageRecord {
            capture_sec: sec,
            capture_nsec: seq * 1_000,
            origin_tag: "camera_2".into(),
            encoding_tag: "png".into(),
            payload: Bytes::from(payload),
        };
        encode_compressed_image(seq, &record)
    }

    #[tokio::test]
    async fn counts_every_kind_of_skip() -> anyhow::Result<()> {
        let tmpdir = TempDir::new()?;
        let log_dir = tmpdir.path().join("session");
        let mut writer = SegmentWriter::create(&log_dir)?;
        let msg_type = "sensor_msgs/CompressedImage";
        writer.append(CAM, msg_type, &image_message(0, 10, png_bytes(4, 4, 10)), 1)?;
        writer.append(IMU, "sensor_msgs/Imu", b"not an image", 2)?;
        writer.append(CAM, msg_type, &[1, 2, 3], 3)?;
        writer.append(CAM, msg_type, &image_message(1, 11, b"not a png".to_vec()), 4)?;
        writer.append(CAM, msg_type, &image_message(2, 12, png_bytes(4, 4, 20)), 5)?;
        writer.append(CAM, msg_type, &image_message(3, 13, png_bytes(4, 4, 30)), 6)?;
        drop(writer);

        let source = SegmentLog::open(&log_dir)?;
        let out = tmpdir.path().join("frames");
        let options = MaterializeOptions { max_frames_per_stream: Some(2), ..MaterializeOptions::default() };
        let (report, indices) = run_extraction(&source, &[CAM.to_string()], &out, options).await?;

        let stats = &report.streams[CAM];
        assert_eq!(stats.saved, 2);
        assert_eq!(stats.malformed, 1);
        assert_eq!(stats.skipped_decode, 1);
        assert_eq!(stats.ignored_over_cap, 1);
        assert_eq!(report.container_errors, 0);

        let index = &indices[CAM];
        assert_eq!(index.len(), 2);
        assert_eq!(index.get(1).map(|ts| ts.sec), Some(12));
        Ok(())
    }

    #[tokio::test]
    async fn disjoint_allow_list_is_fatal() -> anyhow::Result<()> {
        let tmpdir = TempDir::new()?;
        let log_dir = tmpdir.path().join("session");
        let mut writer = SegmentWriter::create(&log_dir)?;
        writer.append(IMU, "sensor_msgs/Imu", b"x", 1)?;
        drop(writer);

        let source = SegmentLog::open(&log_dir)?;
        let err = run_extraction(&source, &[CAM.to_string()], tmpdir.path(), MaterializeOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, crate::error::PipelineError::NoMatchingStreams { .. }));
        Ok(())
    }
}
