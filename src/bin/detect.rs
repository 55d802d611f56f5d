//! accident-detect - run the accident model over an image or a frame dump.
//!
//! A single image file is analyzed once. A directory of frames (sorted by
//! file name) is treated as a video at `--fps` and either scanned at the
//! configured sample interval or, with `--live`, played through the live
//! loop with temporal filtering.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use accident_vision::vision::{EngineOptions, OrtLoader};
use accident_vision::{
    decode_image, DetectionConfig, DetectionSession, Frame, FrameSequence, ImageLimits,
    StopHandle,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Detect traffic accidents in images and video frames")]
struct Args {
    /// ONNX model file.
    #[arg(long, env = "ACCIDENT_MODEL_PATH", default_value = "best.onnx")]
    model: PathBuf,

    /// JSON detection config; defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Frame rate of a frame directory.
    #[arg(long, default_value_t = 30.0)]
    fps: f64,

    /// Play a frame directory through the live loop instead of scanning it.
    #[arg(long)]
    live: bool,

    /// Skip GPU backends.
    #[arg(long)]
    cpu: bool,

    /// Image file, or directory of frames.
    input: PathBuf,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let config = match &args.config {
        Some(path) => DetectionConfig::from_path(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => DetectionConfig::default(),
    };
    let options = if args.cpu {
        EngineOptions::cpu_only()
    } else {
        EngineOptions::default()
    };

    let mut session = DetectionSession::new(config)?;
    session
        .load(&OrtLoader, &args.model, &options)
        .await
        .with_context(|| format!("failed to load model {}", args.model.display()))?;

    let limits = ImageLimits::default();
    if args.input.is_dir() {
        let frames = read_frames(&args.input, &limits)?;
        info!(frames = frames.len(), fps = args.fps, "loaded frame directory");
        let mut source = FrameSequence::new(frames, args.fps)?;
        let stop = StopHandle::new();
        spawn_ctrl_c(stop.clone());

        if args.live {
            let (tx, mut rx) = mpsc::channel(16);
            let printer = tokio::spawn(async move {
                while let Some(update) = rx.recv().await {
                    match serde_json::to_string(&update) {
                        Ok(line) => println!("{line}"),
                        Err(e) => warn!(error = %e, "failed to encode update"),
                    }
                }
            });
            let summary = session.run_live(&mut source, &tx, &stop).await?;
            drop(tx);
            printer.await?;
            eprintln!("{}", serde_json::to_string_pretty(&summary)?);
        } else {
            let summary = session.scan_video(&mut source, None, &stop).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            eprintln!("{}", summary.status());
        }
    } else {
        let bytes = std::fs::read(&args.input)
            .with_context(|| format!("failed to read {}", args.input.display()))?;
        let frame = decode_image(&bytes, &limits)?;
        let update = session.detect_image(&frame).await?;
        println!("{}", serde_json::to_string_pretty(&update)?);
        eprintln!("{}", update.status);
    }

    Ok(())
}

fn read_frames(dir: &Path, limits: &ImageLimits) -> Result<Vec<Frame>> {
    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)
        .with_context(|| format!("failed to list {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_file())
        .collect();
    paths.sort();

    let mut frames = Vec::with_capacity(paths.len());
    for path in paths {
        let bytes = std::fs::read(&path)?;
        match decode_image(&bytes, limits) {
            Ok(frame) => frames.push(frame),
            Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable frame"),
        }
    }
    if frames.is_empty() {
        bail!("no decodable frames in {}", dir.display());
    }
    Ok(frames)
}

fn spawn_ctrl_c(stop: StopHandle) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupted, stopping");
            stop.stop();
        }
    });
}
