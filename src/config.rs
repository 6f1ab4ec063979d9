use crate::calibration::NewCameraMatrix;
use crate::container::ContainerFormat;
use crate::correspondence::RateModel;
use crate::utils::sanitize_topic;
use anyhow::{bail, Context};
use serde::Deserialize;
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Clone, Deserialize)]
pub struct ContainerConfig {
    pub path: PathBuf,
    #[serde(default)]
    pub format: ContainerFormat,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExtractConfig {
    pub output_root: PathBuf,
    pub topics: Vec<String>,
    pub max_frames_per_stream: Option<u32>,
    #[serde(default = "default_image_extension")]
    pub image_extension: String,
    #[serde(default = "default_grayscale")]
    pub grayscale: bool,
}

fn default_image_extension() -> String {
    "png".to_string()
}

fn default_grayscale() -> bool {
    true
}

fn default_output_prefix() -> String {
    "rgb".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct CorrespondenceConfig {
    /// Timed stream whose capture times are assigned to the untimed frames.
    pub timed_topic: String,
    /// Frame directory of the timed stream. Defaults to its extraction
    /// directory.
    pub timed_frames_dir: Option<PathBuf>,
    /// Video of the untimed camera, split into frames by `frames`.
    pub source_video: Option<PathBuf>,
    /// Already-materialized untimed frames.
    pub source_dir: PathBuf,
    #[serde(default = "default_image_extension")]
    pub source_extension: String,
    pub expected_source_frames: Option<u32>,
    pub output_dir: PathBuf,
    #[serde(default = "default_output_prefix")]
    pub output_prefix: String,
    pub table_path: PathBuf,
    #[serde(default)]
    pub model: RateModel,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CameraConfig {
    pub name: String,
    pub calibration: PathBuf,
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
    #[serde(default = "default_image_extension")]
    pub extension: String,
    #[serde(default)]
    pub new_camera_matrix: NewCameraMatrix,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UndistortConfig {
    #[serde(default)]
    pub cameras: Vec<CameraConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub container: ContainerConfig,
    pub extract: ExtractConfig,
    pub correspondence: CorrespondenceConfig,
    #[serde(default)]
    pub undistort: UndistortConfig,
}

impl AppConfig {
    pub fn load_default() -> anyhow::Result<Self> {
        let default = include_str!("../config/default.toml");
        let cfg: AppConfig = toml::from_str(default)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn load_from(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let p = path.into();
        let s = fs::read_to_string(&p).with_context(|| format!("reading config {}", p.display()))?;
        let cfg: AppConfig = toml::from_str(&s).with_context(|| format!("parsing config {}", p.display()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.extract.topics.is_empty() {
            bail!("extract.topics must list at least one topic");
        }
        if self.extract.max_frames_per_stream == Some(0) {
            bail!("extract.max_frames_per_stream must be positive when set");
        }
        self.correspondence.model.validate()?;
        let prefix = &self.correspondence.output_prefix;
        if prefix.is_empty() || prefix.contains(['_', '/']) {
            bail!("correspondence.output_prefix {:?} must be non-empty and contain no '_' or '/'", prefix);
        }
        let timed = &self.correspondence.timed_topic;
        if self.correspondence.timed_frames_dir.is_none() && !self.extract.topics.contains(timed) {
            bail!("correspondence.timed_topic {} is neither extracted nor given a timed_frames_dir", timed);
        }
        Ok(())
    }

    /// Where the timed stream's frames live.
    pub fn timed_frames_dir(&self) -> PathBuf {
        self.correspondence
            .timed_frames_dir
            .clone()
            .unwrap_or_else(|| self.extract.output_root.join(sanitize_topic(&self.correspondence.timed_topic)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn default_config_parses() {
        let cfg = AppConfig::load_default().unwrap();
        assert_eq!(cfg.extract.topics.len(), 3);
        assert_eq!(cfg.correspondence.model.threshold, 55);
        assert_eq!(cfg.correspondence.model.offset, 105);
        assert_eq!(cfg.container.format, ContainerFormat::Auto);
        assert!(cfg.timed_frames_dir().ends_with("camera_2_image_raw_compressed"));
        let strategies: Vec<_> = cfg.undistort.cameras.iter().map(|c| (c.name.as_str(), c.new_camera_matrix)).collect();
        assert_eq!(
            strategies,
            vec![("camera_2", NewCameraMatrix::Balance(1.0)), ("rgb", NewCameraMatrix::Keep)]
        );
    }

    #[test]
    fn rejects_unparseable_output_prefix() {
        let mut cfg = AppConfig::load_default().unwrap();
        for bad in ["", "rgb_ts", "out/rgb"] {
            cfg.correspondence.output_prefix = bad.to_string();
            let err = cfg.validate().unwrap_err();
            assert!(err.to_string().contains("output_prefix"), "{bad:?} accepted");
        }
        cfg.correspondence.output_prefix = "rgbts".to_string();
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn rejects_unextracted_timed_topic() -> anyhow::Result<()> {
        let tmpdir = TempDir::new()?;
        let path = tmpdir.path().join("cfg.toml");
        fs::write(
            &path,
            r#"
[container]
path = "session"

[extract]
output_root = "out"
topics = ["/camera_0/image_raw/compressed"]

[correspondence]
timed_topic = "/camera_2/image_raw/compressed"
source_dir = "rgb"
output_dir = "rgb_ts"
table_path = "sync.csv"
"#,
        )?;
        let err = AppConfig::load_from(&path).unwrap_err();
        assert!(err.to_string().contains("timed_topic"));
        Ok(())
    }

    #[test]
    fn model_defaults_when_omitted() -> anyhow::Result<()> {
        let tmpdir = TempDir::new()?;
        let path = tmpdir.path().join("cfg.toml");
        fs::write(
            &path,
            r#"
[container]
path = "session.bag"
format = "rosbag"

[extract]
output_root = "out"
topics = ["/camera_2/image_raw/compressed"]
max_frames_per_stream = 10

[correspondence]
timed_topic = "/camera_2/image_raw/compressed"
source_dir = "rgb"
output_dir = "rgb_ts"
table_path = "sync.csv"
"#,
        )?;
        let cfg = AppConfig::load_from(&path)?;
        assert_eq!(cfg.correspondence.model, RateModel::default());
        assert_eq!(cfg.container.format, ContainerFormat::Rosbag);
        assert!(cfg.undistort.cameras.is_empty());
        assert_eq!(cfg.extract.image_extension, "png");
        Ok(())
    }
}
