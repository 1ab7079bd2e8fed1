//! Render sync.
//!
//! Worker threads never touch the display surface. They publish immutable
//! `OverlayFrame` snapshots into a keep-latest slot through `RenderSync`; the
//! thread that owns the surface drains the slot through `DisplayContext`.
//! Surfaces need not be `Send`: `DisplayContext::spawn` builds the surface on
//! the display thread from a factory.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::Serialize;

use crate::mailbox::{LatestSlot, Put, Take};
use crate::track::TrackedIdentity;

/// Something that can draw identities. Called only on its owning thread.
pub trait DisplaySurface {
    fn render(&mut self, overlay: &OverlayFrame);
}

/// One frame's worth of overlay state.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct OverlayFrame {
    pub sequence: u64,
    pub identities: Vec<TrackedIdentity>,
    /// Liveness threshold used for labels.
    pub threshold: f32,
    pub fps: f32,
    /// Latency of the most recent detection pass.
    pub detection_ms: Option<f32>,
}

impl OverlayFrame {
    /// Keep at most `max_identities` identities, lowest ids first.
    pub fn new(
        sequence: u64,
        mut identities: Vec<TrackedIdentity>,
        max_identities: usize,
        threshold: f32,
    ) -> Self {
        identities.sort_by_key(|identity| identity.id);
        identities.truncate(max_identities);
        Self {
            sequence,
            identities,
            threshold,
            fps: 0.0,
            detection_ms: None,
        }
    }

    pub fn with_timing(mut self, fps: f32, detection_ms: Option<f32>) -> Self {
        self.fps = fps;
        self.detection_ms = detection_ms;
        self
    }

    /// `"Real: 0.87"` style label per identity.
    pub fn labels(&self) -> Vec<String> {
        self.identities
            .iter()
            .map(|identity| identity.label(self.threshold))
            .collect()
    }

    /// `"FPS: 29.9 | INF: 12 ms"`.
    pub fn status_line(&self) -> String {
        match self.detection_ms {
            Some(ms) => format!("FPS: {:.1} | INF: {:.0} ms", self.fps, ms),
            None => format!("FPS: {:.1}", self.fps),
        }
    }
}

/// Producer side, held by pipeline workers.
#[derive(Clone)]
pub struct RenderSync {
    slot: Arc<LatestSlot<OverlayFrame>>,
}

impl RenderSync {
    /// Hand an overlay to the display context. An overlay that was still
    /// pending is superseded.
    pub fn publish(&self, overlay: OverlayFrame) {
        match self.slot.put(overlay) {
            Put::Replaced(_) => log::trace!("display busy, superseded pending overlay"),
            Put::Rejected(_) => log::trace!("display closed, overlay discarded"),
            Put::Stored => {}
        }
    }

    /// Stop the display loop once the pending overlay is drawn.
    pub fn close(&self) {
        self.slot.close();
    }
}

/// Consumer side, driven by the thread that owns the surface.
pub struct DisplayContext {
    slot: Arc<LatestSlot<OverlayFrame>>,
}

/// Create a connected publisher / display pair.
pub fn channel() -> (RenderSync, DisplayContext) {
    let slot = Arc::new(LatestSlot::new());
    (
        RenderSync {
            slot: Arc::clone(&slot),
        },
        DisplayContext { slot },
    )
}

impl DisplayContext {
    /// Draw the pending overlay, waiting up to `timeout` for one. Returns
    /// false once the publisher has closed. For hosts with their own event
    /// loop.
    pub fn pump(&self, surface: &mut dyn DisplaySurface, timeout: Duration) -> bool {
        match self.slot.take_timeout(timeout) {
            Take::Value(overlay) => {
                surface.render(&overlay);
                true
            }
            Take::TimedOut => true,
            Take::Closed => false,
        }
    }

    /// Draw overlays on the calling thread until the publisher closes.
    pub fn run(&self, surface: &mut dyn DisplaySurface) {
        while let Some(overlay) = self.slot.take() {
            surface.render(&overlay);
        }
    }

    /// Build the surface on a dedicated display thread and draw there.
    pub fn spawn<S, F>(self, factory: F) -> Result<DisplayThread>
    where
        S: DisplaySurface,
        F: FnOnce() -> S + Send + 'static,
    {
        let handle = thread::Builder::new()
            .name("display".to_string())
            .spawn(move || {
                let mut surface = factory();
                self.run(&mut surface);
            })
            .context("failed to spawn display thread")?;
        Ok(DisplayThread { handle })
    }
}

pub struct DisplayThread {
    handle: JoinHandle<()>,
}

impl DisplayThread {
    pub fn join(self) -> Result<()> {
        self.handle
            .join()
            .map_err(|_| anyhow!("display thread panicked"))
    }
}

/// Surface that logs overlays; used by the demo binary.
#[derive(Debug, Default)]
pub struct ConsoleSurface {
    last_labels: Vec<String>,
}

impl DisplaySurface for ConsoleSurface {
    fn render(&mut self, overlay: &OverlayFrame) {
        let labels = overlay.labels();
        if labels != self.last_labels {
            log::info!(
                "frame {} [{}] {}",
                overlay.sequence,
                overlay.status_line(),
                if labels.is_empty() {
                    "no faces".to_string()
                } else {
                    labels.join(", ")
                }
            );
            self.last_labels = labels;
        }
    }
}
