//! Pipeline orchestration.
//!
//! Threads:
//! - camera thread: calls `FrameSink::deliver`, which only swaps the frame
//!   into a keep-latest slot and never blocks
//! - `detection` thread: conversion, sampling gate, detection, tracking,
//!   session classification and overlay publication, one frame at a time
//! - `liveness-N` threads: score face crops and merge results into the
//!   tracker (see `liveness::pool`)
//! - display thread: owned by the caller, fed through `RenderSync`
//!
//! The tracker sits behind one mutex shared by the detection thread and the
//! liveness workers. Teardown takes the same mutex before closing it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use crossbeam_channel::{unbounded, Receiver, Sender, TryRecvError};
use serde::Serialize;

use crate::config::PipelineConfig;
use crate::detect::{
    ClassifierModel, Detection, DetectorModel, LivenessModel, ProviderChain, StubClassifier,
    StubDetector, StubLivenessModel,
};
use crate::error::StageResult;
use crate::frame::{CameraFrame, PixelBuffer};
use crate::ingest::{to_rgb, FrameConsumer};
use crate::liveness::fusion::{self, InferenceSession, SessionOutcome};
use crate::liveness::{LivenessJob, LivenessPool, WARM_UP_RUNS};
use crate::mailbox::{LatestSlot, Put, Take};
use crate::render::{OverlayFrame, RenderSync};
use crate::sampling::{GateDecision, SamplingGate};
use crate::stats::{FpsMeter, PipelineStats, StatsSnapshot};
use crate::tensor::Preprocessor;
use crate::track::{IdentityTracker, TrackedIdentity};

/// How often the detection thread wakes without frames, to expire sessions.
const IDLE_POLL: Duration = Duration::from_millis(50);

/// Model providers for each stage. A stage without providers is disabled.
pub struct PipelineModels {
    pub detector: ProviderChain<Box<dyn DetectorModel>>,
    pub liveness: ProviderChain<Box<dyn LivenessModel>>,
    pub classifier: ProviderChain<Box<dyn ClassifierModel>>,
}

impl PipelineModels {
    /// Brightness-based stand-ins for every stage.
    pub fn stubs() -> Self {
        Self::stubs_for(&PipelineConfig::default())
    }

    /// Stub models; the classifier takes its input from `config.session`.
    pub fn stubs_for(config: &PipelineConfig) -> Self {
        let classifier_input = config.session.input_spec();
        Self {
            detector: ProviderChain::single("stub", || {
                Ok(Box::new(StubDetector::new()) as Box<dyn DetectorModel>)
            }),
            liveness: ProviderChain::single("stub", || {
                Ok(Box::new(StubLivenessModel::new()) as Box<dyn LivenessModel>)
            }),
            classifier: ProviderChain::single("stub", move || {
                Ok(Box::new(StubClassifier::with_input(classifier_input)) as Box<dyn ClassifierModel>)
            }),
        }
    }
}

/// Provider chosen for each stage, or `None` if the stage is disabled.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StageStatus {
    pub detector: Option<String>,
    pub liveness: Option<String>,
    pub classifier: Option<String>,
}

/// Handle to a pending session or capture result.
pub struct SessionTicket {
    outcome: Receiver<SessionOutcome>,
}

impl SessionTicket {
    /// Wait for the outcome. `None` on timeout or if the pipeline stopped
    /// before producing one.
    pub fn wait(&self, timeout: Duration) -> Option<SessionOutcome> {
        self.outcome.recv_timeout(timeout).ok()
    }

    pub fn try_outcome(&self) -> Option<SessionOutcome> {
        self.outcome.try_recv().ok()
    }
}

enum Command {
    BeginSession {
        session: InferenceSession,
        reply: Sender<SessionOutcome>,
    },
    Capture {
        reply: Sender<SessionOutcome>,
    },
}

/// Camera-facing side of the pipeline.
pub struct FrameSink {
    inbox: Arc<LatestSlot<CameraFrame>>,
    stats: Arc<PipelineStats>,
}

impl FrameConsumer for FrameSink {
    fn deliver(&self, frame: CameraFrame) {
        self.stats.frame_delivered();
        match self.inbox.put(frame) {
            Put::Replaced(_) => self.stats.frame_replaced(),
            Put::Rejected(frame) => {
                log::debug!("pipeline stopped, dropped frame {}", frame.sequence)
            }
            Put::Stored => {}
        }
    }
}

pub struct Pipeline {
    config: Arc<PipelineConfig>,
    sink: Arc<FrameSink>,
    tracker: Arc<Mutex<IdentityTracker>>,
    stats: Arc<PipelineStats>,
    status: StageStatus,
    commands: Option<Sender<Command>>,
    session_active: Arc<AtomicBool>,
    render: RenderSync,
    worker: Option<JoinHandle<()>>,
}

impl Pipeline {
    /// Resolve and warm up models, then start the detection thread and the
    /// liveness pool. A stage whose models fail to initialize is logged once
    /// and disabled; the rest of the pipeline still runs.
    pub fn start(config: PipelineConfig, models: PipelineModels, render: RenderSync) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let stats = Arc::new(PipelineStats::default());
        let tracker = Arc::new(Mutex::new(IdentityTracker::new(config.tracking.tracker())));
        let mut status = StageStatus::default();

        let detector = match init_detector(&models.detector) {
            Ok((name, model, preprocessor)) => {
                status.detector = Some(name);
                Some((model, preprocessor))
            }
            Err(err) => {
                log::error!("detection disabled: {:#}", err);
                None
            }
        };

        let pool = match LivenessPool::start(
            &models.liveness,
            &config.liveness,
            Arc::clone(&tracker),
            Arc::clone(&stats),
        ) {
            Ok(pool) => {
                status.liveness = Some(pool.provider().to_string());
                Some(pool)
            }
            Err(err) => {
                log::error!("liveness scoring disabled: {:#}", err);
                None
            }
        };

        let classifier = match init_classifier(&models.classifier) {
            Ok((name, model, preprocessor)) => {
                status.classifier = Some(name);
                Some((model, preprocessor))
            }
            Err(err) => {
                log::error!("verification sessions disabled: {:#}", err);
                None
            }
        };

        let inbox = Arc::new(LatestSlot::new());
        let (commands, command_rx) = unbounded();
        let session_active = Arc::new(AtomicBool::new(false));

        let worker = DetectionWorker {
            config: Arc::clone(&config),
            inbox: Arc::clone(&inbox),
            commands: command_rx,
            gate: SamplingGate::new(config.sampling.interval),
            tracker: Arc::clone(&tracker),
            stats: Arc::clone(&stats),
            detector,
            classifier,
            pool,
            render: render.clone(),
            fps: FpsMeter::default(),
            detection_ms: None,
            session: None,
            captures: Vec::new(),
            session_active: Arc::clone(&session_active),
        };
        let handle = thread::Builder::new()
            .name("detection".to_string())
            .spawn(move || worker.run())
            .context("failed to spawn detection thread")?;

        log::info!(
            "pipeline started: detector={:?} liveness={:?} classifier={:?} interval={}",
            status.detector,
            status.liveness,
            status.classifier,
            config.sampling.interval
        );
        Ok(Self {
            config,
            sink: Arc::new(FrameSink { inbox, stats: Arc::clone(&stats) }),
            tracker,
            stats,
            status,
            commands: Some(commands),
            session_active,
            render,
            worker: Some(handle),
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn status(&self) -> &StageStatus {
        &self.status
    }

    /// Consumer to register with a `CameraSource`.
    pub fn sink(&self) -> Arc<dyn FrameConsumer> {
        self.sink.clone()
    }

    /// Deliver a frame directly, with the same keep-latest semantics.
    pub fn submit(&self, frame: CameraFrame) {
        self.sink.deliver(frame);
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Copy of every tracked identity, including lost ones.
    pub fn identities(&self) -> Result<Vec<TrackedIdentity>> {
        let tracker = self
            .tracker
            .lock()
            .map_err(|_| anyhow!("tracker lock poisoned"))?;
        Ok(tracker.snapshot(u32::MAX))
    }

    pub fn session_active(&self) -> bool {
        self.session_active.load(Ordering::SeqCst)
    }

    /// Start a fixed-duration verification session. Frames processed until
    /// it expires are classified and averaged; the outcome arrives on the
    /// returned ticket.
    pub fn begin_session(&self) -> Result<SessionTicket> {
        if self.status.classifier.is_none() {
            return Err(anyhow!("session classifier is unavailable"));
        }
        if self.session_active.swap(true, Ordering::SeqCst) {
            return Err(anyhow!("a verification session is already running"));
        }
        let (reply, outcome) = crossbeam_channel::bounded(1);
        let session = InferenceSession::new(
            self.config.session.duration(),
            self.config.session.class_labels.clone(),
        );
        if let Err(err) = self.send(Command::BeginSession { session, reply }) {
            self.session_active.store(false, Ordering::SeqCst);
            return Err(err);
        }
        log::info!(
            "verification session started ({} ms)",
            self.config.session.duration_ms
        );
        Ok(SessionTicket { outcome })
    }

    /// Classify the next processed frame once.
    pub fn capture(&self) -> Result<SessionTicket> {
        if self.status.classifier.is_none() {
            return Err(anyhow!("session classifier is unavailable"));
        }
        let (reply, outcome) = crossbeam_channel::bounded(1);
        self.send(Command::Capture { reply })?;
        Ok(SessionTicket { outcome })
    }

    fn send(&self, command: Command) -> Result<()> {
        self.commands
            .as_ref()
            .ok_or_else(|| anyhow!("pipeline is shut down"))?
            .send(command)
            .map_err(|_| anyhow!("detection thread has stopped"))
    }

    /// Stop the detection thread and liveness pool, close the tracker and
    /// release the display context. Idempotent.
    pub fn shutdown(&mut self) -> Result<()> {
        self.sink.inbox.close();
        self.commands.take();
        let joined = match self.worker.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| anyhow!("detection thread panicked")),
            None => Ok(()),
        };
        self.render.close();
        joined
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            log::error!("pipeline shutdown failed: {:#}", err);
        }
    }
}

fn init_detector(
    chain: &ProviderChain<Box<dyn DetectorModel>>,
) -> Result<(String, Box<dyn DetectorModel>, Preprocessor)> {
    let (name, mut model) = chain.resolve()?;
    let preprocessor = Preprocessor::new(model.input_spec()).map_err(|e| anyhow!("{}", e))?;
    model
        .warm_up()
        .map_err(|e| anyhow!("detector warm-up failed: {}", e))?;
    Ok((name, model, preprocessor))
}

fn init_classifier(
    chain: &ProviderChain<Box<dyn ClassifierModel>>,
) -> Result<(String, Box<dyn ClassifierModel>, Preprocessor)> {
    if chain.is_empty() {
        return Err(anyhow!("no classifier providers configured"));
    }
    let (name, mut model) = chain.resolve()?;
    let preprocessor = Preprocessor::new(model.input_spec()).map_err(|e| anyhow!("{}", e))?;
    model
        .warm_up()
        .map_err(|e| anyhow!("classifier warm-up failed: {}", e))?;
    let spec = *preprocessor.spec();
    let blank = PixelBuffer::filled(spec.width, spec.height, [128, 128, 128])
        .map_err(|e| anyhow!("{}", e))?;
    for _ in 0..WARM_UP_RUNS {
        let tensor = preprocessor.extract(&blank).map_err(|e| anyhow!("{}", e))?;
        model
            .classify(&tensor)
            .map_err(|e| anyhow!("classifier warm-up failed: {}", e))?;
    }
    Ok((name, model, preprocessor))
}

struct DetectionWorker {
    config: Arc<PipelineConfig>,
    inbox: Arc<LatestSlot<CameraFrame>>,
    commands: Receiver<Command>,
    gate: SamplingGate,
    tracker: Arc<Mutex<IdentityTracker>>,
    stats: Arc<PipelineStats>,
    detector: Option<(Box<dyn DetectorModel>, Preprocessor)>,
    classifier: Option<(Box<dyn ClassifierModel>, Preprocessor)>,
    pool: Option<LivenessPool>,
    render: RenderSync,
    fps: FpsMeter,
    detection_ms: Option<f32>,
    session: Option<(InferenceSession, Sender<SessionOutcome>)>,
    captures: Vec<Sender<SessionOutcome>>,
    session_active: Arc<AtomicBool>,
}

impl DetectionWorker {
    fn run(mut self) {
        loop {
            self.drain_commands();
            self.expire_session(Instant::now());
            match self.inbox.take_timeout(IDLE_POLL) {
                Take::Value(frame) => {
                    // Requests issued before this frame was delivered apply to it.
                    self.drain_commands();
                    if let Err(err) = self.process(frame) {
                        log::error!("detection thread stopping: {:#}", err);
                        break;
                    }
                }
                Take::TimedOut => continue,
                Take::Closed => break,
            }
        }
        self.teardown();
    }

    fn drain_commands(&mut self) {
        loop {
            match self.commands.try_recv() {
                Ok(Command::BeginSession { session, reply }) => {
                    self.session = Some((session, reply));
                }
                Ok(Command::Capture { reply }) => self.captures.push(reply),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
    }

    fn expire_session(&mut self, now: Instant) {
        let expired = self
            .session
            .as_ref()
            .is_some_and(|(session, _)| session.is_expired(now));
        if expired {
            self.finish_session();
        }
    }

    fn finish_session(&mut self) {
        if let Some((mut session, reply)) = self.session.take() {
            let outcome = session.finalize();
            log::info!("verification session finished: {}", outcome);
            self.session_active.store(false, Ordering::SeqCst);
            let _ = reply.send(outcome);
        }
    }

    fn process(&mut self, frame: CameraFrame) -> Result<()> {
        self.stats.frame_processed();
        let fps = self.fps.tick();
        let sequence = frame.sequence;

        let rgb = match to_rgb(frame.data) {
            Ok(rgb) => rgb,
            Err(err) => {
                self.stats.format_error();
                log::warn!("frame {} skipped: {}", sequence, err);
                self.lock_tracker()?.age();
                return Ok(());
            }
        };

        let identities = match self.gate.decide(sequence) {
            GateDecision::RunDetection if self.detector.is_some() => self.detect(&rgb)?,
            _ => {
                let mut tracker = self.lock_tracker()?;
                tracker.age();
                Some(tracker.snapshot(self.config.render.max_staleness))
            }
        };

        if self.session.is_some() || !self.captures.is_empty() {
            self.classify(&rgb);
        }

        // A failed detection pass leaves the last overlay on screen.
        let Some(identities) = identities else {
            return Ok(());
        };

        let overlay = OverlayFrame::new(
            sequence,
            identities,
            self.config.render.max_identities,
            self.config.liveness.threshold,
        )
        .with_timing(fps, self.detection_ms);
        self.render.publish(overlay);
        self.stats.rendered();
        Ok(())
    }

    /// Detection pass: detect, merge into the tracker, queue liveness crops.
    /// Returns identities matched this cycle, or `None` when the detector
    /// failed and the identities were only aged.
    fn detect(&mut self, rgb: &PixelBuffer) -> Result<Option<Vec<TrackedIdentity>>> {
        self.stats.detection_run();
        let started = Instant::now();
        let detections = match self.run_detector(rgb) {
            Ok(detections) => detections,
            Err(err) => {
                self.stats.detection_failed();
                log::warn!("detection failed: {}", err);
                self.lock_tracker()?.age();
                return Ok(None);
            }
        };
        self.detection_ms = Some(started.elapsed().as_secs_f32() * 1000.0);

        let (update, identities) = {
            let mut tracker = self.lock_tracker()?;
            let update = tracker.update(&detections);
            (update, tracker.snapshot(0))
        };

        if let Some(pool) = &self.pool {
            for identity in &update.fresh {
                let region = identity.bbox.to_region(rgb.width(), rgb.height());
                let crop = match rgb.crop(region) {
                    Ok(crop) => crop,
                    Err(err) => {
                        log::debug!("identity {}: {}", identity.id, err);
                        continue;
                    }
                };
                pool.submit(LivenessJob {
                    id: identity.id,
                    cycle: update.cycle,
                    crop,
                });
            }
        }
        Ok(Some(identities))
    }

    fn run_detector(&mut self, rgb: &PixelBuffer) -> StageResult<Vec<Detection>> {
        let Some((model, preprocessor)) = self.detector.as_mut() else {
            return Ok(Vec::new());
        };
        let tensor = preprocessor.extract(rgb)?;
        let min_confidence = self.config.detection.min_confidence;
        let mut detections = model.detect(&tensor)?;
        detections.retain(|d| d.confidence >= min_confidence);
        Ok(detections)
    }

    fn classify(&mut self, rgb: &PixelBuffer) {
        let Some((model, preprocessor)) = self.classifier.as_mut() else {
            return;
        };
        let scores = match preprocessor
            .extract(rgb)
            .and_then(|tensor| model.classify(&tensor))
        {
            Ok(scores) => scores,
            Err(err) => {
                log::warn!("session classification failed: {}", err);
                return;
            }
        };

        let labels = &self.config.session.class_labels;
        for reply in self.captures.drain(..) {
            match fusion::single_verdict(&scores, labels) {
                Ok(outcome) => {
                    let _ = reply.send(outcome);
                }
                Err(err) => log::warn!("capture discarded: {}", err),
            }
        }
        if let Some((session, _)) = self.session.as_mut() {
            if let Err(err) = session.accumulate(&scores) {
                log::warn!("session frame discarded: {}", err);
            }
        }
    }

    fn lock_tracker(&self) -> Result<std::sync::MutexGuard<'_, IdentityTracker>> {
        self.tracker
            .lock()
            .map_err(|_| anyhow!("tracker lock poisoned"))
    }

    fn teardown(&mut self) {
        self.finish_session();
        self.captures.clear();
        if let Some(mut pool) = self.pool.take() {
            pool.shutdown();
        }
        match self.tracker.lock() {
            Ok(mut tracker) => tracker.close(),
            Err(_) => log::error!("tracker lock poisoned during teardown"),
        }
        self.detector.take();
        self.classifier.take();
        log::info!("detection thread stopped");
    }
}
