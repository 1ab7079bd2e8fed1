use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::tensor::{ChannelNorm, InputSpec, Normalization};
use crate::track::TrackerConfig;

const DEFAULT_SAMPLING_INTERVAL: u32 = 15;
const DEFAULT_IOU_THRESHOLD: f32 = 0.3;
const DEFAULT_MAX_LOST_FRAMES: u32 = 50;
const DEFAULT_MIN_CONFIDENCE: f32 = 0.5;
const DEFAULT_LIVENESS_WORKERS: usize = 2;
const DEFAULT_LIVENESS_QUEUE: usize = 4;
const DEFAULT_LIVENESS_THRESHOLD: f32 = 0.5;
const DEFAULT_LIVENESS_INPUT: u32 = 224;
const DEFAULT_SESSION_MS: u64 = 5_000;
const DEFAULT_SESSION_INPUT: u32 = 224;
const DEFAULT_MAX_IDENTITIES: usize = 5;
const MAX_LIVENESS_WORKERS: usize = 8;

#[derive(Debug, Deserialize, Default)]
struct PipelineConfigFile {
    sampling: Option<SamplingConfigFile>,
    tracking: Option<TrackingConfigFile>,
    detection: Option<DetectionConfigFile>,
    liveness: Option<LivenessConfigFile>,
    session: Option<SessionConfigFile>,
    render: Option<RenderConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct SamplingConfigFile {
    interval: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct TrackingConfigFile {
    iou_threshold: Option<f32>,
    max_lost_frames: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectionConfigFile {
    min_confidence: Option<f32>,
}

#[derive(Debug, Deserialize, Default)]
struct LivenessConfigFile {
    workers: Option<usize>,
    queue_capacity: Option<usize>,
    threshold: Option<f32>,
    input_width: Option<u32>,
    input_height: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct SessionConfigFile {
    duration_ms: Option<u64>,
    class_labels: Option<Vec<String>>,
    input_width: Option<u32>,
    input_height: Option<u32>,
    mean: Option<[f32; 3]>,
    std: Option<[f32; 3]>,
}

#[derive(Debug, Deserialize, Default)]
struct RenderConfigFile {
    max_staleness: Option<u32>,
    max_identities: Option<usize>,
}

/// Immutable pipeline settings, passed to `Pipeline::start`.
#[derive(Debug, Clone, PartialEq, Serialize, Default)]
pub struct PipelineConfig {
    pub sampling: SamplingConfig,
    pub tracking: TrackingConfig,
    pub detection: DetectionConfig,
    pub liveness: LivenessConfig,
    pub session: SessionConfig,
    pub render: RenderConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SamplingConfig {
    /// Run detection on every `interval`-th frame.
    pub interval: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrackingConfig {
    pub iou_threshold: f32,
    pub max_lost_frames: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectionConfig {
    /// Detections below this confidence are discarded before tracking.
    pub min_confidence: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LivenessConfig {
    pub workers: usize,
    pub queue_capacity: usize,
    /// Scores strictly above this classify as real.
    pub threshold: f32,
    pub input_width: u32,
    pub input_height: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionConfig {
    pub duration_ms: u64,
    /// One label per classifier output, in output order.
    pub class_labels: Vec<String>,
    pub input_width: u32,
    pub input_height: u32,
    pub mean: [f32; 3],
    pub std: [f32; 3],
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RenderConfig {
    /// Identities lost for longer than this are hidden on reused frames.
    /// Detection frames always show only identities matched that cycle.
    pub max_staleness: u32,
    pub max_identities: usize,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_SAMPLING_INTERVAL,
        }
    }
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            iou_threshold: DEFAULT_IOU_THRESHOLD,
            max_lost_frames: DEFAULT_MAX_LOST_FRAMES,
        }
    }
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            min_confidence: DEFAULT_MIN_CONFIDENCE,
        }
    }
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_LIVENESS_WORKERS,
            queue_capacity: DEFAULT_LIVENESS_QUEUE,
            threshold: DEFAULT_LIVENESS_THRESHOLD,
            input_width: DEFAULT_LIVENESS_INPUT,
            input_height: DEFAULT_LIVENESS_INPUT,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            duration_ms: DEFAULT_SESSION_MS,
            class_labels: vec!["fake".to_string(), "real".to_string()],
            input_width: DEFAULT_SESSION_INPUT,
            input_height: DEFAULT_SESSION_INPUT,
            mean: ChannelNorm::IMAGENET.mean,
            std: ChannelNorm::IMAGENET.std,
        }
    }
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            max_staleness: DEFAULT_SAMPLING_INTERVAL - 1,
            max_identities: DEFAULT_MAX_IDENTITIES,
        }
    }
}

impl TrackingConfig {
    pub fn tracker(&self) -> TrackerConfig {
        TrackerConfig {
            iou_threshold: self.iou_threshold,
            max_lost_frames: self.max_lost_frames,
        }
    }
}

impl SessionConfig {
    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }

    /// Float input spec for a session classifier built from these settings.
    pub fn input_spec(&self) -> InputSpec {
        InputSpec {
            width: self.input_width,
            height: self.input_height,
            normalization: Normalization::Float(ChannelNorm {
                mean: self.mean,
                std: self.std,
            }),
        }
    }
}

impl PipelineConfig {
    /// Defaults, overlaid with the file named by `LIVENESS_CONFIG` (if set)
    /// and `LIVENESS_*` environment variables, then validated.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("LIVENESS_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) if !path.trim().is_empty() => Some(read_config_file(Path::new(path))?),
            _ => None,
        };
        let file_cfg = file_cfg.unwrap_or_default();
        let staleness_set = file_cfg
            .render
            .as_ref()
            .is_some_and(|render| render.max_staleness.is_some());
        let mut cfg = Self::from_file(file_cfg);
        cfg.apply_env()?;
        if !staleness_set {
            cfg.render.max_staleness = cfg.sampling.interval.saturating_sub(1);
        }
        cfg.validate()?;
        Ok(cfg)
    }

    /// Read a config file without consulting the environment.
    pub fn from_path(path: &Path) -> Result<Self> {
        let cfg = Self::from_file(read_config_file(path)?);
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: PipelineConfigFile) -> Self {
        let defaults = PipelineConfig::default();

        let sampling = file.sampling.unwrap_or_default();
        let tracking = file.tracking.unwrap_or_default();
        let detection = file.detection.unwrap_or_default();
        let liveness = file.liveness.unwrap_or_default();
        let session = file.session.unwrap_or_default();
        let render = file.render.unwrap_or_default();

        let interval = sampling.interval.unwrap_or(defaults.sampling.interval);
        Self {
            sampling: SamplingConfig { interval },
            tracking: TrackingConfig {
                iou_threshold: tracking
                    .iou_threshold
                    .unwrap_or(defaults.tracking.iou_threshold),
                max_lost_frames: tracking
                    .max_lost_frames
                    .unwrap_or(defaults.tracking.max_lost_frames),
            },
            detection: DetectionConfig {
                min_confidence: detection
                    .min_confidence
                    .unwrap_or(defaults.detection.min_confidence),
            },
            liveness: LivenessConfig {
                workers: liveness.workers.unwrap_or(defaults.liveness.workers),
                queue_capacity: liveness
                    .queue_capacity
                    .unwrap_or(defaults.liveness.queue_capacity),
                threshold: liveness.threshold.unwrap_or(defaults.liveness.threshold),
                input_width: liveness
                    .input_width
                    .unwrap_or(defaults.liveness.input_width),
                input_height: liveness
                    .input_height
                    .unwrap_or(defaults.liveness.input_height),
            },
            session: SessionConfig {
                duration_ms: session.duration_ms.unwrap_or(defaults.session.duration_ms),
                class_labels: session
                    .class_labels
                    .unwrap_or(defaults.session.class_labels),
                input_width: session.input_width.unwrap_or(defaults.session.input_width),
                input_height: session
                    .input_height
                    .unwrap_or(defaults.session.input_height),
                mean: session.mean.unwrap_or(defaults.session.mean),
                std: session.std.unwrap_or(defaults.session.std),
            },
            render: RenderConfig {
                // Follows the sampling interval unless set explicitly.
                max_staleness: render
                    .max_staleness
                    .unwrap_or_else(|| interval.saturating_sub(1)),
                max_identities: render
                    .max_identities
                    .unwrap_or(defaults.render.max_identities),
            },
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(interval) = env_parse::<u32>("LIVENESS_SAMPLING_INTERVAL")? {
            self.sampling.interval = interval;
        }
        if let Some(threshold) = env_parse::<f32>("LIVENESS_IOU_THRESHOLD")? {
            self.tracking.iou_threshold = threshold;
        }
        if let Some(frames) = env_parse::<u32>("LIVENESS_MAX_LOST_FRAMES")? {
            self.tracking.max_lost_frames = frames;
        }
        if let Some(workers) = env_parse::<usize>("LIVENESS_WORKERS")? {
            self.liveness.workers = workers;
        }
        if let Some(threshold) = env_parse::<f32>("LIVENESS_THRESHOLD")? {
            self.liveness.threshold = threshold;
        }
        if let Some(ms) = env_parse::<u64>("LIVENESS_SESSION_MS")? {
            self.session.duration_ms = ms;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.sampling.interval == 0 {
            return Err(anyhow!("sampling interval must be at least 1"));
        }
        let iou = self.tracking.iou_threshold;
        if !(iou > 0.0 && iou <= 1.0) {
            return Err(anyhow!("iou_threshold must be in (0, 1], got {}", iou));
        }
        if !(0.0..=1.0).contains(&self.detection.min_confidence) {
            return Err(anyhow!(
                "min_confidence must be in [0, 1], got {}",
                self.detection.min_confidence
            ));
        }
        if self.liveness.workers == 0 || self.liveness.workers > MAX_LIVENESS_WORKERS {
            return Err(anyhow!(
                "liveness workers must be between 1 and {}, got {}",
                MAX_LIVENESS_WORKERS,
                self.liveness.workers
            ));
        }
        if self.liveness.queue_capacity == 0 {
            return Err(anyhow!("liveness queue_capacity must be greater than zero"));
        }
        if !self.liveness.threshold.is_finite() {
            return Err(anyhow!("liveness threshold must be finite"));
        }
        if self.liveness.input_width == 0 || self.liveness.input_height == 0 {
            return Err(anyhow!("liveness input size must be non-zero"));
        }
        if self.session.input_width == 0 || self.session.input_height == 0 {
            return Err(anyhow!("session input size must be non-zero"));
        }
        if self.session.std.iter().any(|s| !(s.is_finite() && *s > 0.0)) {
            return Err(anyhow!("session std values must be positive"));
        }
        if self.session.class_labels.is_empty() {
            return Err(anyhow!("session class_labels must not be empty"));
        }
        if self.session.duration_ms == 0 {
            return Err(anyhow!("session duration must be greater than zero"));
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>> {
    match std::env::var(key) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| anyhow!("{} has an invalid value: {}", key, value)),
        _ => Ok(None),
    }
}

fn read_config_file(path: &Path) -> Result<PipelineConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))
    }
}
