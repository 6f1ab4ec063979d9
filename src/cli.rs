use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Config file; the embedded default is used when absent
    #[arg(long, global = true, env = "FRAME_SYNC_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List the streams declared by a container
    Inspect {
        #[arg(long)]
        container: Option<PathBuf>,
    },
    /// Extract image frames of the configured topics
    Extract {
        #[arg(long)]
        container: Option<PathBuf>,
        /// Stop saving a stream after this many frames
        #[arg(long)]
        max_frames: Option<u32>,
    },
    /// Undistort frame directories of the configured cameras
    Undistort {
        /// Only process the named camera
        #[arg(long)]
        camera: Option<String>,
    },
    /// Split the untimed camera's video into numbered frames
    Frames {
        #[arg(long)]
        video: Option<PathBuf>,
        /// Where to write the frames; defaults to correspondence.source_dir
        #[arg(long)]
        source_dir: Option<PathBuf>,
    },
    /// Build the correspondence table from frames already on disk
    Sync {
        #[arg(long)]
        source_dir: Option<PathBuf>,
    },
    /// Extract, then build the correspondence table in one pass
    Run {
        #[arg(long)]
        container: Option<PathBuf>,
        #[arg(long)]
        max_frames: Option<u32>,
        #[arg(long)]
        source_dir: Option<PathBuf>,
    },
}

impl Args {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
