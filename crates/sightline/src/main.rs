use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{bail, Context};
use clap::Parser;
use sightline::{
    analysis::{Gaze, HandGesture},
    config::PipelineConfig,
    nn::{Inferer, TractInferer},
    pipeline::{
        spawn_pipeline, BoxPayload, FrameOutcome, Models, Pipeline, PipelineWorker,
        RotationPayload,
    },
    transport::{topics, Bus, Message, Publisher},
};

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif"];

/// Face, iris and hand landmark tracking on a sequence of frames.
#[derive(Parser)]
#[command(name = "sightline")]
struct Cli {
    /// Directory of frames, processed in file name order.
    frames: Option<PathBuf>,

    /// JSON pipeline configuration. Missing fields use the built-in defaults.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Face detection network (ONNX).
    #[arg(long, requires = "face_landmarks")]
    face_detector: Option<PathBuf>,

    /// Face mesh network (ONNX).
    #[arg(long, requires = "face_detector")]
    face_landmarks: Option<PathBuf>,

    /// Iris network (ONNX). Enables eye, iris and gaze output.
    #[arg(long, requires = "face_detector")]
    iris: Option<PathBuf>,

    /// Palm detection network (ONNX).
    #[arg(long, requires = "hand_landmarks")]
    palm_detector: Option<PathBuf>,

    /// Hand landmark network (ONNX).
    #[arg(long, requires = "palm_detector")]
    hand_landmarks: Option<PathBuf>,

    /// Print the effective configuration as JSON and exit.
    #[arg(long)]
    dump_config: bool,
}

fn main() -> anyhow::Result<()> {
    sightline::init_logger!();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => PipelineConfig::load(path)
            .with_context(|| format!("failed to load configuration '{}'", path.display()))?,
        None => PipelineConfig::default(),
    };

    if cli.dump_config {
        println!("{}", config.to_json()?);
        return Ok(());
    }

    let Some(frames_dir) = &cli.frames else {
        bail!("no frame directory given");
    };
    let frames = list_frames(frames_dir)?;
    log::info!("{} frames in '{}'", frames.len(), frames_dir.display());

    let bus = Bus::new();
    let sub = bus.subscribe([
        topics::FACE_BOX,
        topics::FACE_RESET,
        topics::MOUTH_ASPECT_RATIO,
        topics::EYE_ASPECT_RATIO,
        topics::GAZE,
        topics::ROTATION,
        topics::PALM_BOX,
        topics::HAND_GESTURE,
        topics::PALM_RESET,
    ]);

    let mut workers = Vec::new();
    if let (Some(detector), Some(landmarks)) = (&cli.face_detector, &cli.face_landmarks) {
        let iris = match &cli.iris {
            Some(path) => Some(Arc::new(load(path)?) as Arc<dyn Inferer>),
            None => None,
        };
        let models = Models {
            detector: Box::new(load(detector)?),
            landmarks: Box::new(load(landmarks)?),
            iris,
        };
        let publisher = Publisher::new(bus.clone(), config.transport.clone());
        workers.push(spawn_pipeline(Pipeline::face(&config, models, publisher)?)?);
    }
    if let (Some(detector), Some(landmarks)) = (&cli.palm_detector, &cli.hand_landmarks) {
        let models = Models {
            detector: Box::new(load(detector)?),
            landmarks: Box::new(load(landmarks)?),
            iris: None,
        };
        let publisher = Publisher::new(bus.clone(), config.transport.clone());
        workers.push(spawn_pipeline(Pipeline::palm(&config, models, publisher)?)?);
    }
    if workers.is_empty() {
        bail!("no networks given (see --face-detector and --palm-detector)");
    }

    for path in &frames {
        let frame = image::open(path)
            .with_context(|| format!("failed to decode '{}'", path.display()))?
            .to_rgb8();
        run_frame(&mut workers, Arc::new(frame), path)?;
        while let Some(msg) = sub.try_recv() {
            log_message(&msg)?;
        }
    }

    Ok(())
}

fn load(path: &Path) -> anyhow::Result<TractInferer> {
    TractInferer::load(path).with_context(|| format!("failed to load '{}'", path.display()))
}

fn list_frames(dir: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let mut frames = fs::read_dir(dir)?
        .map(|entry| Ok(entry?.path()))
        .collect::<std::io::Result<Vec<_>>>()?;
    frames.retain(|path| {
        path.extension()
            .and_then(|ext| ext.to_str())
            .map_or(false, |ext| {
                IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str())
            })
    });
    frames.sort();
    Ok(frames)
}

fn run_frame(
    workers: &mut [PipelineWorker],
    frame: Arc<image::RgbImage>,
    path: &Path,
) -> anyhow::Result<()> {
    let handles = workers
        .iter_mut()
        .map(|worker| worker.submit(frame.clone()))
        .collect::<Vec<_>>();
    for handle in handles {
        match handle.block() {
            Ok(Some(FrameOutcome::Tracked(tracked))) => log::debug!(
                "{}: tracked subject, score {:.2}",
                path.display(),
                tracked.detection.score()
            ),
            Ok(Some(FrameOutcome::Reset)) => log::debug!("{}: no subject", path.display()),
            Ok(None) => log::warn!("{}: frame dropped", path.display()),
            Err(_) => bail!("pipeline worker exited"),
        }
    }
    Ok(())
}

fn log_message(msg: &Message) -> anyhow::Result<()> {
    match msg.topic() {
        _ if msg.is_reset() => log::info!("{}", msg.topic()),
        topics::FACE_BOX | topics::PALM_BOX => {
            let b: BoxPayload = msg.decode()?;
            log::info!("{}: score {:.2}, rect {:?}", msg.topic(), b.score, b.rect);
        }
        topics::GAZE => {
            let gaze: Gaze = msg.decode()?;
            log::info!("gaze: {:.1}°", gaze.x_deg);
        }
        topics::MOUTH_ASPECT_RATIO => {
            log::info!("mouth aspect ratio: {:.3}", msg.decode::<f32>()?);
        }
        topics::ROTATION => {
            let pose: RotationPayload = msg.decode()?;
            log::info!(
                "head rotation {:.3?}, translation {:.1?}",
                pose.rotation,
                pose.translation
            );
        }
        topics::HAND_GESTURE => {
            log::info!("hand gesture: {:?}", msg.decode::<HandGesture>()?);
        }
        topics::EYE_ASPECT_RATIO => {
            let [left, right] = msg.decode::<[f32; 2]>()?;
            log::info!("eye aspect ratios: {left:.3} {right:.3}");
        }
        other => log::trace!("{other}: {} bytes", msg.payload().len()),
    }
    Ok(())
}
