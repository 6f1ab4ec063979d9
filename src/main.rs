mod cli;

use anyhow::{bail, Context, Result};
use bag_frame_sync::calibration::Calibration;
use bag_frame_sync::config::AppConfig;
use bag_frame_sync::container::segment_log::container_checksum;
use bag_frame_sync::container::open_container;
use bag_frame_sync::correspondence::CorrespondenceMapper;
use bag_frame_sync::diagnostics::ExtractionReport;
use bag_frame_sync::exporter::{export_table, ExportContext};
use bag_frame_sync::extract::run_extraction;
use bag_frame_sync::materializer::MaterializeOptions;
use bag_frame_sync::table::{scan_source_frames, TableBuilder};
use bag_frame_sync::timestamps::TimestampIndex;
use bag_frame_sync::undistort::undistort_dir;
use cli::{Args, Command};
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse_args();
    let mut config = match &args.config {
        Some(path) => AppConfig::load_from(path)?,
        None => AppConfig::load_default()?,
    };

    match args.command {
        Command::Inspect { container } => {
            if let Some(path) = container {
                config.container.path = path;
            }
            inspect(&config)
        }
        Command::Extract { container, max_frames } => {
            apply_overrides(&mut config, container, max_frames, None);
            extract(&config).await.map(|_| ())
        }
        Command::Frames { video, source_dir } => {
            apply_overrides(&mut config, None, None, source_dir);
            let video = video
                .or_else(|| config.correspondence.source_video.clone())
                .context("no video to split; pass --video or set correspondence.source_video")?;
            frames(&video, &config.correspondence.source_dir).await
        }
        Command::Undistort { camera } => undistort(&config, camera.as_deref()).await,
        Command::Sync { source_dir } => {
            apply_overrides(&mut config, None, None, source_dir);
            let oracle = TimestampIndex::from_frame_dir(&config.timed_frames_dir(), &config.extract.image_extension)
                .with_context(|| format!("rebuilding timestamps from {}", config.timed_frames_dir().display()))?;
            info!(frames = oracle.len(), "timestamp index rebuilt from filenames");
            correspond(&config, &oracle, None, None).await
        }
        Command::Run { container, max_frames, source_dir } => {
            apply_overrides(&mut config, container, max_frames, source_dir);
            let (report, mut indices) = extract(&config).await?;
            let checksum = match container_checksum(&config.container.path) {
                Ok(sum) => Some(sum),
                Err(e) => {
                    tracing::warn!(error = %e, "could not checksum container");
                    None
                }
            };
            let timed = &config.correspondence.timed_topic;
            let oracle = match indices.remove(timed) {
                Some(index) => index,
                None => TimestampIndex::from_frame_dir(&config.timed_frames_dir(), &config.extract.image_extension)?,
            };
            correspond(&config, &oracle, checksum, Some(report)).await
        }
    }
}

fn apply_overrides(config: &mut AppConfig, container: Option<PathBuf>, max_frames: Option<u32>, source_dir: Option<PathBuf>) {
    if let Some(path) = container {
        config.container.path = path;
    }
    if max_frames.is_some() {
        config.extract.max_frames_per_stream = max_frames;
    }
    if let Some(dir) = source_dir {
        config.correspondence.source_dir = dir;
    }
}

fn inspect(config: &AppConfig) -> Result<()> {
    let source = open_container(&config.container.path, config.container.format)?;
    println!("{}", config.container.path.display());
    for (topic, info) in source.catalog() {
        let wanted = if config.extract.topics.contains(topic) { "*" } else { " " };
        println!(
            "{} {:<48} {:<36} {:>8}",
            wanted,
            topic,
            info.message_type.as_deref().unwrap_or("?"),
            info.message_count
        );
    }
    Ok(())
}

async fn extract(config: &AppConfig) -> Result<(ExtractionReport, std::collections::BTreeMap<String, TimestampIndex>)> {
    let source = open_container(&config.container.path, config.container.format)
        .with_context(|| format!("opening container {}", config.container.path.display()))?;
    let options = MaterializeOptions {
        max_frames_per_stream: config.extract.max_frames_per_stream,
        image_extension: config.extract.image_extension.clone(),
        grayscale: config.extract.grayscale,
    };
    let (report, indices) =
        run_extraction(source.as_ref(), &config.extract.topics, &config.extract.output_root, options).await?;

    let report_path = config.extract.output_root.join("extraction_report.json");
    report.write_json(&report_path).await?;
    info!(saved = report.total_saved(), "extraction report written to {}", report_path.display());
    Ok((report, indices))
}

#[cfg(feature = "video")]
async fn frames(video: &Path, out_dir: &Path) -> Result<()> {
    let summary = bag_frame_sync::video::extract_video_frames(video, out_dir)
        .await
        .with_context(|| format!("splitting {}", video.display()))?;
    info!(fps = summary.fps, frames = summary.written, "source frames ready in {}", out_dir.display());
    Ok(())
}

#[cfg(not(feature = "video"))]
async fn frames(video: &Path, _out_dir: &Path) -> Result<()> {
    bail!("cannot split {}: this build lacks the `video` feature", video.display())
}

async fn undistort(config: &AppConfig, only: Option<&str>) -> Result<()> {
    let cameras: Vec<_> = config
        .undistort
        .cameras
        .iter()
        .filter(|c| only.map_or(true, |name| c.name == name))
        .collect();
    if cameras.is_empty() {
        bail!("no camera to undistort (requested {:?})", only);
    }
    for camera in cameras {
        let calibration = Calibration::load(&camera.calibration)
            .with_context(|| format!("loading calibration for {}", camera.name))?;
        let written = undistort_dir(
            &calibration,
            camera.new_camera_matrix,
            &camera.input_dir,
            &camera.output_dir,
            &camera.extension,
        )
        .await?;
        info!(camera = %camera.name, frames = written, "camera undistorted");
    }
    Ok(())
}

async fn correspond(
    config: &AppConfig,
    oracle: &TimestampIndex,
    container_sha256: Option<String>,
    extraction: Option<ExtractionReport>,
) -> Result<()> {
    let cfg = &config.correspondence;
    let mapper = CorrespondenceMapper::new(cfg.model, oracle)?;
    let sources = scan_source_frames(&cfg.source_dir, &cfg.source_extension)
        .with_context(|| format!("scanning source frames in {}", cfg.source_dir.display()))?;
    info!(sources = sources.len(), timed_frames = oracle.len(), "building correspondence table");

    let builder = TableBuilder::new(mapper, &cfg.output_dir, &cfg.output_prefix);
    let report = builder.build(&sources, cfg.expected_source_frames).await?;

    let ctx = ExportContext {
        timed_topic: cfg.timed_topic.clone(),
        source_dir: cfg.source_dir.clone(),
        model: cfg.model,
        container_sha256,
        extraction,
    };
    let manifest = export_table(&report, &cfg.table_path, ctx).await?;
    info!(rows = manifest.num_records, failures = manifest.failures.len(), "correspondence export complete");

    let out_of_range = report.out_of_range_count();
    if out_of_range > 0 {
        bail!(
            "{} source frame(s) map past the {} timed frames; see {}",
            out_of_range,
            oracle.len(),
            cfg.table_path.display()
        );
    }
    Ok(())
}
