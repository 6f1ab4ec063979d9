//! Numbered source frames from the untimed camera's video.
//!
//! The decoder lives behind the `video` feature because it links the system
//! FFmpeg libraries. Naming and writing of the frames is always available so
//! frames produced elsewhere can follow the same layout.

use crate::error::{PipelineError, Result};
use crate::utils::write_atomic;
use image::{ImageFormat, RgbImage};
use std::io::Cursor;
use std::path::{Path, PathBuf};

/// File name of untimed frame `index`, e.g. `rgb_00042.png`.
pub fn source_frame_name(index: u32) -> String {
    format!("rgb_{:05}.png", index)
}

/// What a video pass found and wrote.
#[derive(Debug, Clone, PartialEq)]
pub struct VideoSummary {
    /// Average frame rate declared by the stream.
    pub fps: f64,
    /// Frame count declared by the stream; 0 when the container omits it.
    pub reported_frames: u64,
    pub written: u32,
}

/// PNG-encode `frame` into `dir` under its numbered name.
pub async fn write_source_frame(dir: &Path, index: u32, frame: &RgbImage) -> Result<PathBuf> {
    let mut encoded = Vec::new();
    frame.write_to(&mut Cursor::new(&mut encoded), ImageFormat::Png)?;
    let path = dir.join(source_frame_name(index));
    write_atomic(&path, &encoded).await?;
    Ok(path)
}

/// Copy a packed RGB24 plane with `stride` bytes per row into an image.
pub fn pack_rgb_rows(data: &[u8], stride: usize, width: u32, height: u32) -> Result<RgbImage> {
    let row = width as usize * 3;
    if stride < row {
        return Err(PipelineError::Video(format!("stride {} shorter than a {}-pixel row", stride, width)));
    }
    let mut pixels = Vec::with_capacity(row * height as usize);
    for y in 0..height as usize {
        let start = y * stride;
        let line = data
            .get(start..start + row)
            .ok_or_else(|| PipelineError::Video(format!("plane ends before row {} of {}", y, height)))?;
        pixels.extend_from_slice(line);
    }
    RgbImage::from_raw(width, height, pixels)
        .ok_or_else(|| PipelineError::Video(format!("{}x{} frame does not fit its buffer", width, height)))
}

#[cfg(feature = "video")]
fn video_error(e: ffmpeg_next::Error) -> PipelineError {
    PipelineError::Video(e.to_string())
}

/// Decode every frame of `video` into `out_dir` as `rgb_00000.png`,
/// `rgb_00001.png`, ... in presentation order.
#[cfg(feature = "video")]
pub async fn extract_video_frames(video: &Path, out_dir: &Path) -> Result<VideoSummary> {
    use ffmpeg_next as ffmpeg;
    use ffmpeg_next::software::scaling;

    if !video.exists() {
        return Err(PipelineError::Video(format!("video not found: {}", video.display())));
    }
    ffmpeg::init().map_err(video_error)?;
    let mut input = ffmpeg::format::input(&video).map_err(video_error)?;

    let (stream_index, fps, reported_frames, parameters) = {
        let stream = input
            .streams()
            .best(ffmpeg::media::Type::Video)
            .ok_or_else(|| PipelineError::Video(format!("no video stream in {}", video.display())))?;
        let rate = stream.avg_frame_rate();
        let fps = if rate.denominator() > 0 {
            f64::from(rate.numerator()) / f64::from(rate.denominator())
        } else {
            0.0
        };
        (stream.index(), fps, stream.frames().max(0) as u64, stream.parameters())
    };

    let context = ffmpeg::codec::context::Context::from_parameters(parameters).map_err(video_error)?;
    let mut decoder = context.decoder().video().map_err(video_error)?;
    let (width, height) = (decoder.width(), decoder.height());
    tracing::info!(fps, frames = reported_frames, width, height, "opened video {}", video.display());

    let mut scaler = scaling::Context::get(
        decoder.format(),
        width,
        height,
        ffmpeg::format::Pixel::RGB24,
        width,
        height,
        scaling::Flags::BILINEAR,
    )
    .map_err(video_error)?;
    tokio::fs::create_dir_all(out_dir).await?;

    let mut written = 0u32;
    for (stream, packet) in input.packets() {
        if stream.index() != stream_index {
            continue;
        }
        decoder.send_packet(&packet).map_err(video_error)?;
        written = drain_decoder(&mut decoder, &mut scaler, out_dir, written).await?;
    }
    decoder.send_eof().map_err(video_error)?;
    written = drain_decoder(&mut decoder, &mut scaler, out_dir, written).await?;

    if reported_frames > 0 && reported_frames != u64::from(written) {
        tracing::warn!(reported = reported_frames, written, "decoded frame count differs from the stream header");
    }
    tracing::info!(fps, frames = written, "wrote source frames to {}", out_dir.display());
    Ok(VideoSummary { fps, reported_frames, written })
}

#[cfg(feature = "video")]
async fn drain_decoder(
    decoder: &mut ffmpeg_next::decoder::Video,
    scaler: &mut ffmpeg_next::software::scaling::Context,
    out_dir: &Path,
    mut next: u32,
) -> Result<u32> {
    use ffmpeg_next::util::frame::Video as VideoFrame;

    let mut decoded = VideoFrame::empty();
    while decoder.receive_frame(&mut decoded).is_ok() {
        let mut rgb = VideoFrame::empty();
        scaler.run(&decoded, &mut rgb).map_err(video_error)?;
        let image = pack_rgb_rows(rgb.data(0), rgb.stride(0), rgb.width(), rgb.height())?;
        write_source_frame(out_dir, next, &image).await?;
        next += 1;
        if next % 500 == 0 {
            tracing::info!("{} source frames written", next);
        }
    }
    Ok(next)
}
