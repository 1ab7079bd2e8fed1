use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use crossbeam_channel::{unbounded, Receiver, Sender};

use liveness_kernel::detect::{StubDetector, StubLivenessModel};
use liveness_kernel::render::{self, DisplayThread};
use liveness_kernel::{
    CameraFrame, CameraSource, Detection, DetectorModel, DisplaySurface, Facing, FrameConsumer,
    InputSpec, LivenessModel, OverlayFrame, Pipeline, PipelineConfig, PipelineModels, PlanarImage,
    Plane, ProviderChain, QuantParams, SessionOutcome, StageError, StageResult, SyntheticCamera,
    SyntheticCameraConfig, Tensor,
};

fn camera() -> SyntheticCamera {
    SyntheticCamera::new(SyntheticCameraConfig {
        width: 160,
        height: 120,
        fps: 60,
        subject_size: 40,
        subject_speed: 1,
        row_padding: 16,
    })
    .unwrap()
}

fn config() -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.sampling.interval = 1;
    config.render.max_staleness = 0;
    config.liveness.input_width = 32;
    config.liveness.input_height = 32;
    config.session.duration_ms = 300;
    config
}

fn wait_until(mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    false
}

/// Records overlays on the display thread and forwards them to the test.
struct Recording(Sender<OverlayFrame>);

impl DisplaySurface for Recording {
    fn render(&mut self, overlay: &OverlayFrame) {
        let _ = self.0.send(overlay.clone());
    }
}

fn start(
    config: PipelineConfig,
    models: PipelineModels,
) -> Result<(Pipeline, DisplayThread, Receiver<OverlayFrame>)> {
    let (sync, display) = render::channel();
    let (tx, rx) = unbounded();
    let display = display.spawn(move || Recording(tx))?;
    let pipeline = Pipeline::start(config, models, sync)?;
    Ok((pipeline, display, rx))
}

/// Submit frames one at a time, waiting for each to be processed.
fn feed(pipeline: &Pipeline, frames: impl IntoIterator<Item = CameraFrame>) {
    for frame in frames {
        let before = pipeline.stats().frames_processed;
        pipeline.submit(frame);
        assert!(wait_until(|| pipeline.stats().frames_processed > before));
    }
}

#[test]
fn synthetic_subject_is_tracked_and_scored_real() -> Result<()> {
    let cam = camera();
    let (mut pipeline, display, overlays) = start(config(), PipelineModels::stubs())?;

    feed(&pipeline, (0..5).map(|seq| cam.frame_at(seq, Facing::Back)));
    assert!(wait_until(|| pipeline.stats().liveness_completed >= 1));

    let identities = pipeline.identities()?;
    assert_eq!(identities.len(), 1);
    assert_eq!(identities[0].id, 1);
    assert!(identities[0].liveness_score.unwrap() > 0.5);

    // A later overlay carries the real label.
    feed(&pipeline, (5..8).map(|seq| cam.frame_at(seq, Facing::Back)));
    pipeline.shutdown()?;
    display.join()?;
    let labels: Vec<String> = overlays.try_iter().flat_map(|o| o.labels()).collect();
    assert!(labels.iter().any(|l| l.starts_with("Real: ")));
    Ok(())
}

#[test]
fn camera_source_drives_the_pipeline() -> Result<()> {
    let mut cam = camera();
    let (mut pipeline, display, _overlays) = start(config(), PipelineModels::stubs())?;
    cam.start(Facing::Front, pipeline.sink())?;
    assert!(wait_until(|| pipeline.stats().detection_runs >= 3));
    cam.start(Facing::Back, pipeline.sink())?;
    assert!(wait_until(|| pipeline.stats().frames_processed >= 10));
    cam.stop()?;
    pipeline.shutdown()?;
    display.join()?;

    let stats = pipeline.stats();
    assert!(stats.frames_delivered >= stats.frames_processed);
    Ok(())
}

/// Detector that blocks on every call until released.
struct GatedDetector {
    started: Sender<()>,
    release: Receiver<()>,
}

impl DetectorModel for GatedDetector {
    fn name(&self) -> &'static str {
        "gated"
    }

    fn input_spec(&self) -> InputSpec {
        StubDetector::new().input_spec()
    }

    fn detect(&mut self, _input: &Tensor) -> StageResult<Vec<Detection>> {
        let _ = self.started.send(());
        let _ = self.release.recv();
        Ok(Vec::new())
    }
}

#[test]
fn busy_pipeline_keeps_only_the_latest_frame() -> Result<()> {
    let cam = camera();
    let (started_tx, started_rx) = unbounded();
    let (release_tx, release_rx) = unbounded();
    let mut models = PipelineModels::stubs();
    models.detector = ProviderChain::single("gated", move || {
        Ok(Box::new(GatedDetector {
            started: started_tx.clone(),
            release: release_rx.clone(),
        }) as Box<dyn DetectorModel>)
    });
    let (mut pipeline, display, overlays) = start(config(), models)?;

    pipeline.submit(cam.frame_at(0, Facing::Back));
    started_rx.recv_timeout(Duration::from_secs(5))?;
    for seq in 1..=3 {
        pipeline.submit(cam.frame_at(seq, Facing::Back));
    }
    assert_eq!(pipeline.stats().frames_replaced, 2);

    release_tx.send(())?;
    started_rx.recv_timeout(Duration::from_secs(5))?;
    release_tx.send(())?;
    assert!(wait_until(|| pipeline.stats().renders == 2));

    pipeline.shutdown()?;
    display.join()?;
    let stats = pipeline.stats();
    assert_eq!(stats.frames_delivered, 4);
    assert_eq!(stats.frames_processed, 2);
    let last = overlays.try_iter().last().ok_or_else(|| anyhow!("no overlay"))?;
    assert_eq!(last.sequence, 3);
    Ok(())
}

struct FailingDetector;

impl DetectorModel for FailingDetector {
    fn name(&self) -> &'static str {
        "failing"
    }

    fn input_spec(&self) -> InputSpec {
        StubDetector::new().input_spec()
    }

    fn detect(&mut self, _input: &Tensor) -> StageResult<Vec<Detection>> {
        Err(StageError::DetectorUnavailable("inference error".into()))
    }
}

/// Fails after the first call, so identities found once must age.
struct FailAfterFirst {
    inner: StubDetector,
    calls: Arc<Mutex<u32>>,
}

impl DetectorModel for FailAfterFirst {
    fn name(&self) -> &'static str {
        "flaky"
    }

    fn input_spec(&self) -> InputSpec {
        self.inner.input_spec()
    }

    fn detect(&mut self, input: &Tensor) -> StageResult<Vec<Detection>> {
        let mut calls = self.calls.lock().unwrap();
        *calls += 1;
        if *calls == 1 {
            self.inner.detect(input)
        } else {
            Err(StageError::DetectorUnavailable("lost device".into()))
        }
    }
}

#[test]
fn detector_failures_age_identities_instead_of_clearing() -> Result<()> {
    let cam = camera();
    let mut models = PipelineModels::stubs();
    let calls = Arc::new(Mutex::new(0));
    let shared = Arc::clone(&calls);
    models.detector = ProviderChain::single("flaky", move || {
        Ok(Box::new(FailAfterFirst {
            inner: StubDetector::new(),
            calls: Arc::clone(&shared),
        }) as Box<dyn DetectorModel>)
    });
    let (mut pipeline, display, overlays) = start(config(), models)?;

    feed(&pipeline, (0..3).map(|seq| cam.frame_at(seq, Facing::Back)));
    let identities = pipeline.identities()?;
    assert_eq!(identities.len(), 1);
    assert_eq!(identities[0].lost_frames, 2);
    let stats = pipeline.stats();
    assert_eq!(stats.detection_failures, 2);
    assert_eq!(stats.renders, 1);

    pipeline.shutdown()?;
    display.join()?;
    // The overlay from the last good pass is never replaced by a blank one.
    let drawn: Vec<(u64, usize)> = overlays
        .try_iter()
        .map(|o| (o.sequence, o.identities.len()))
        .collect();
    assert_eq!(drawn, vec![(0, 1)]);
    Ok(())
}

#[test]
fn failing_detector_never_stops_the_pipeline() -> Result<()> {
    let cam = camera();
    let mut models = PipelineModels::stubs();
    models.detector = ProviderChain::single("failing", || {
        Ok(Box::new(FailingDetector) as Box<dyn DetectorModel>)
    });
    let (mut pipeline, display, overlays) = start(config(), models)?;

    feed(&pipeline, (0..4).map(|seq| cam.frame_at(seq, Facing::Back)));
    let stats = pipeline.stats();
    assert_eq!(stats.frames_processed, 4);
    assert_eq!(stats.detection_failures, 4);
    assert_eq!(stats.renders, 0);
    assert!(pipeline.identities()?.is_empty());

    pipeline.shutdown()?;
    display.join()?;
    assert_eq!(overlays.try_iter().count(), 0);
    Ok(())
}

#[test]
fn malformed_frame_is_skipped_without_render() -> Result<()> {
    let (mut pipeline, display, _overlays) = start(config(), PipelineModels::stubs())?;
    let broken = CameraFrame::planar(
        0,
        PlanarImage {
            width: 16,
            height: 16,
            y: Plane::new(vec![0; 16 * 16], 16, 1),
            u: Plane::new(vec![128; 4], 16, 2),
            v: Plane::new(vec![128; 4], 16, 2),
        },
    );
    feed(&pipeline, [broken]);
    let stats = pipeline.stats();
    assert_eq!(stats.format_errors, 1);
    assert_eq!(stats.renders, 0);

    pipeline.shutdown()?;
    display.join()
}

#[test]
fn unusable_liveness_model_disables_scoring_only() -> Result<()> {
    struct Broken;
    impl LivenessModel for Broken {
        fn name(&self) -> &'static str {
            "broken"
        }
        fn input_quant(&self) -> QuantParams {
            QuantParams::new(1.0 / 255.0, 0)
        }
        fn output_quant(&self) -> QuantParams {
            QuantParams::new(1.0 / 255.0, 0)
        }
        fn score(&mut self, _input: &Tensor) -> StageResult<u8> {
            Err(StageError::ScorerUnavailable("delegate rejected graph".into()))
        }
    }

    let cam = camera();
    let mut models = PipelineModels::stubs();
    // First provider fails warm-up, so the pool is disabled.
    models.liveness = ProviderChain::single("broken", || Ok(Box::new(Broken) as Box<dyn LivenessModel>));
    let (mut pipeline, display, _overlays) = start(config(), models)?;
    assert_eq!(pipeline.status().liveness, None);

    feed(&pipeline, (0..3).map(|seq| cam.frame_at(seq, Facing::Back)));
    let identities = pipeline.identities()?;
    assert_eq!(identities.len(), 1);
    assert_eq!(identities[0].liveness_score, None);
    assert_eq!(pipeline.stats().liveness_submitted, 0);

    pipeline.shutdown()?;
    display.join()
}

#[test]
fn provider_chain_falls_back_to_next_liveness_model() -> Result<()> {
    let mut models = PipelineModels::stubs();
    models.liveness = ProviderChain::new()
        .with("accelerated", || Err(anyhow!("no accelerator")))
        .with("cpu", || Ok(Box::new(StubLivenessModel::new()) as Box<dyn LivenessModel>));
    let (mut pipeline, display, _overlays) = start(config(), models)?;
    assert_eq!(pipeline.status().liveness.as_deref(), Some("cpu"));
    pipeline.shutdown()?;
    display.join()
}

#[test]
fn session_aggregates_frames_into_a_verdict() -> Result<()> {
    let cam = camera();
    let mut config = config();
    config.session.duration_ms = 1000;
    let (mut pipeline, display, _overlays) = start(config, PipelineModels::stubs())?;

    let ticket = pipeline.begin_session()?;
    assert!(pipeline.session_active());
    feed(&pipeline, (0..3).map(|seq| cam.frame_at(seq, Facing::Back)));
    let outcome = ticket
        .wait(Duration::from_secs(5))
        .ok_or_else(|| anyhow!("session produced no outcome"))?;

    let verdict = outcome.verdict().ok_or_else(|| anyhow!("expected a verdict"))?;
    assert!(verdict.frames >= 3);
    // Mostly dark frames: the stub classifier favours class 0.
    assert_eq!(verdict.class_index, 0);
    assert_eq!(verdict.label, "fake");
    assert!(verdict.confidence > 0.5);

    // Session slot is free again.
    let again = pipeline.begin_session()?;
    assert_eq!(again.wait(Duration::from_secs(5)), Some(SessionOutcome::NoFramesAnalyzed));

    pipeline.shutdown()?;
    display.join()
}

#[test]
fn capture_classifies_a_single_frame() -> Result<()> {
    let cam = camera();
    let (mut pipeline, display, _overlays) = start(config(), PipelineModels::stubs())?;

    let ticket = pipeline.capture()?;
    feed(&pipeline, [cam.frame_at(0, Facing::Back)]);
    let outcome = ticket
        .wait(Duration::from_secs(5))
        .ok_or_else(|| anyhow!("capture produced no outcome"))?;
    assert_eq!(outcome.verdict().map(|v| v.frames), Some(1));

    pipeline.shutdown()?;
    display.join()
}

#[test]
fn shutdown_releases_the_registry() -> Result<()> {
    let cam = camera();
    let (mut pipeline, display, _overlays) = start(config(), PipelineModels::stubs())?;
    feed(&pipeline, (0..3).map(|seq| cam.frame_at(seq, Facing::Back)));
    pipeline.shutdown()?;
    display.join()?;

    assert!(pipeline.identities()?.is_empty());
    assert!(pipeline.begin_session().is_err());
    // Frames after shutdown are refused by the closed slot.
    let before = pipeline.stats();
    pipeline.sink().deliver(cam.frame_at(9, Facing::Back));
    pipeline.sink().deliver(cam.frame_at(10, Facing::Back));
    thread::sleep(Duration::from_millis(50));
    let after = pipeline.stats();
    assert_eq!(after.frames_processed, before.frames_processed);
    assert_eq!(after.frames_delivered, before.frames_delivered + 2);
    assert_eq!(after.frames_replaced, before.frames_replaced);
    Ok(())
}
