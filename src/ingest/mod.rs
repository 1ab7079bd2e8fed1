//! Frame ingestion.
//!
//! Camera sources deliver `CameraFrame`s to exactly one registered consumer.
//! Delivery must never block: consumers are expected to keep only the most
//! recent pending frame (see `pipeline::FrameSink`).
//!
//! - `normalize`: frame buffer adapter (planar / semi-planar / packed to RGB)
//! - `synthetic`: deterministic camera for demos and tests

pub mod normalize;
pub mod synthetic;

use std::sync::Arc;

use anyhow::Result;

use crate::frame::CameraFrame;

pub use normalize::to_rgb;
pub use synthetic::{SyntheticCamera, SyntheticCameraConfig};

/// Which physical camera to open.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Facing {
    Front,
    Back,
}

/// Receiver of camera frames. Called on the camera's own thread.
pub trait FrameConsumer: Send + Sync {
    /// Hand over a frame. Must return quickly and never block on inference.
    fn deliver(&self, frame: CameraFrame);
}

/// Source of camera frames.
pub trait CameraSource {
    /// Start streaming to `consumer`. Starting again replaces the previous
    /// consumer (one active consumer at a time).
    fn start(&mut self, facing: Facing, consumer: Arc<dyn FrameConsumer>) -> Result<()>;

    /// Stop streaming. Idempotent.
    fn stop(&mut self) -> Result<()>;
}
