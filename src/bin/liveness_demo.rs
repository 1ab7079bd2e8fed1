//! liveness_demo - end-to-end synthetic run of the liveness pipeline
//!
//! Drives the synthetic camera through the full pipeline with stub models
//! (or ONNX models with `--features backend-tract`) and logs overlays to the
//! console. Optionally runs a verification session and switches camera
//! facing midway.

use anyhow::{anyhow, Result};
use clap::{Parser, ValueEnum};
use std::time::{Duration, Instant};

use liveness_kernel::render;
use liveness_kernel::{
    CameraSource, ConsoleSurface, Facing, Pipeline, PipelineConfig, PipelineModels,
    SyntheticCamera, SyntheticCameraConfig,
};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum FacingArg {
    Front,
    Back,
}

impl From<FacingArg> for Facing {
    fn from(value: FacingArg) -> Self {
        match value {
            FacingArg::Front => Facing::Front,
            FacingArg::Back => Facing::Back,
        }
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Run time in seconds.
    #[arg(long, default_value_t = 10)]
    seconds: u64,
    /// Synthetic camera frame rate.
    #[arg(long, default_value_t = 30)]
    fps: u32,
    #[arg(long, default_value_t = 640)]
    width: u32,
    #[arg(long, default_value_t = 480)]
    height: u32,
    /// Camera to open first.
    #[arg(long, value_enum, default_value = "front")]
    facing: FacingArg,
    /// Switch to the other camera after this many seconds.
    #[arg(long)]
    switch_after: Option<u64>,
    /// Run a verification session at startup.
    #[arg(long)]
    session: bool,
    /// ONNX face detector (requires backend-tract).
    #[arg(long, value_name = "PATH")]
    detector_model: Option<std::path::PathBuf>,
    /// Quantized ONNX liveness model (requires backend-tract).
    #[arg(long, value_name = "PATH")]
    liveness_model: Option<std::path::PathBuf>,
    /// ONNX session classifier (requires backend-tract).
    #[arg(long, value_name = "PATH")]
    classifier_model: Option<std::path::PathBuf>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    if args.fps == 0 {
        return Err(anyhow!("fps must be >= 1"));
    }

    // Sampling, tracking and session settings come from LIVENESS_CONFIG
    // and the LIVENESS_* environment.
    let config = PipelineConfig::load()?;
    let models = build_models(&args, &config)?;

    let (sync, display) = render::channel();
    let display_thread = display.spawn(ConsoleSurface::default)?;
    let mut pipeline = Pipeline::start(config, models, sync)?;

    let mut camera = SyntheticCamera::new(SyntheticCameraConfig {
        width: args.width,
        height: args.height,
        fps: args.fps,
        ..SyntheticCameraConfig::default()
    })?;
    let mut facing: Facing = args.facing.into();
    camera.start(facing, pipeline.sink())?;

    let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
    ctrlc::set_handler(move || {
        let _ = stop_tx.try_send(());
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;

    let mut ticket = if args.session {
        Some(pipeline.begin_session()?)
    } else {
        None
    };

    let started = Instant::now();
    let deadline = started + Duration::from_secs(args.seconds);
    let mut switched = false;
    while Instant::now() < deadline {
        if stop_rx.recv_timeout(Duration::from_millis(100)).is_ok() {
            log::info!("shutdown signal received");
            break;
        }
        if let Some(after) = args.switch_after {
            if !switched && started.elapsed() >= Duration::from_secs(after) {
                facing = match facing {
                    Facing::Front => Facing::Back,
                    Facing::Back => Facing::Front,
                };
                log::info!("switching camera to {:?}", facing);
                camera.stop()?;
                camera.start(facing, pipeline.sink())?;
                switched = true;
            }
        }
        if let Some(outcome) = ticket.as_ref().and_then(|t| t.try_outcome()) {
            log::info!("verification result: {}", outcome);
            ticket = None;
        }
    }

    camera.stop()?;
    pipeline.shutdown()?;
    display_thread.join()?;

    let stats = pipeline.stats();
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}

#[cfg(not(feature = "backend-tract"))]
fn build_models(args: &Args, config: &PipelineConfig) -> Result<PipelineModels> {
    if args.detector_model.is_some() || args.liveness_model.is_some() || args.classifier_model.is_some() {
        return Err(anyhow!(
            "model paths require building with --features backend-tract"
        ));
    }
    Ok(PipelineModels::stubs_for(config))
}

/// ONNX providers first, stubs as the last fallback.
#[cfg(feature = "backend-tract")]
fn build_models(args: &Args, config: &PipelineConfig) -> Result<PipelineModels> {
    use liveness_kernel::detect::backends::{TractClassifier, TractDetector, TractLivenessModel};
    use liveness_kernel::detect::{ClassifierModel, DetectorModel, LivenessModel, StubClassifier, StubDetector, StubLivenessModel};
    use liveness_kernel::{ChannelNorm, InputSpec, Normalization, QuantParams, ProviderChain};

    let mut models = PipelineModels::stubs_for(config);
    if let Some(path) = args.detector_model.clone() {
        let spec = InputSpec {
            width: 320,
            height: 240,
            normalization: Normalization::Float(ChannelNorm::IMAGENET),
        };
        models.detector = TractDetector::providers(path, spec).with("stub", || {
            Ok(Box::new(StubDetector::new()) as Box<dyn DetectorModel>)
        });
    }
    if let Some(path) = args.liveness_model.clone() {
        let size = (config.liveness.input_width, config.liveness.input_height);
        models.liveness = TractLivenessModel::providers(
            path,
            size,
            QuantParams::new(1.0 / 255.0, 0),
            QuantParams::new(0.003_906_25, 0),
        )
        .with("stub", || {
            Ok(Box::new(StubLivenessModel::new()) as Box<dyn LivenessModel>)
        });
    }
    if let Some(path) = args.classifier_model.clone() {
        let chain: ProviderChain<Box<dyn ClassifierModel>> =
            TractClassifier::providers(path, config.session.input_spec());
        let input = config.session.input_spec();
        models.classifier = chain.with("stub", move || {
            Ok(Box::new(StubClassifier::with_input(input)) as Box<dyn ClassifierModel>)
        });
    }
    Ok(models)
}
