//! Liveness Kernel
//!
//! Real-time face liveness pipeline: camera frames are converted, sampled,
//! run through a face detector, associated into tracked identities and scored
//! for liveness by a bounded worker pool. Results are fused per identity and
//! published to a display surface on its own thread.
//!
//! # Architecture
//!
//! The pipeline keeps four properties by construction:
//!
//! 1. **Keep-latest delivery**: the camera never blocks; a frame arriving
//!    while another is pending replaces it.
//! 2. **Single merge point**: detection and liveness results both merge into
//!    the identity tracker under one mutex.
//! 3. **Bounded work**: detection runs on every Nth frame, and liveness
//!    requests beyond the pool's queue are dropped.
//! 4. **Graceful degradation**: stage failures skip a frame or disable a
//!    stage; they never stop the pipeline.
//!
//! # Module Structure
//!
//! - `frame`: pixel containers (CameraFrame, PlanarImage, PixelBuffer)
//! - `ingest`: camera sources and the frame buffer adapter
//! - `tensor`: crop, resize and normalization into model tensors
//! - `sampling`: detection sampling gate
//! - `detect`: model capabilities, provider chains and backends
//! - `track`: identity tracker
//! - `liveness`: liveness scoring, worker pool and temporal fusion
//! - `render`: display marshalling
//! - `pipeline`: orchestration
//! - `similarity`: feature vector storage and comparison

pub mod config;
pub mod detect;
pub mod error;
pub mod frame;
pub mod ingest;
pub mod liveness;
pub mod mailbox;
pub mod pipeline;
pub mod render;
pub mod sampling;
pub mod similarity;
pub mod stats;
pub mod tensor;
pub mod track;

pub use config::PipelineConfig;
pub use detect::{
    BoundingBox, ClassifierModel, Detection, DetectorModel, LivenessModel, ProviderChain,
};
pub use error::{StageError, StageResult};
pub use frame::{CameraFrame, FrameData, PixelBuffer, PixelFormat, PlanarImage, Plane, Region};
pub use ingest::{CameraSource, Facing, FrameConsumer, SyntheticCamera, SyntheticCameraConfig};
pub use liveness::{Classification, InferenceSession, SessionOutcome, Verdict};
pub use pipeline::{Pipeline, PipelineModels, SessionTicket, StageStatus};
pub use render::{ConsoleSurface, DisplayContext, DisplaySurface, OverlayFrame, RenderSync};
pub use similarity::{cosine_similarity, FeatureVector};
pub use stats::{FpsMeter, PipelineStats, StatsSnapshot};
pub use tensor::{ChannelNorm, InputSpec, Normalization, Preprocessor, QuantParams, Tensor};
pub use track::{IdentityTracker, LivenessResult, TrackState, TrackedIdentity, TrackerConfig};
