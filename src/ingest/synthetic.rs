//! Synthetic camera source.
//!
//! Produces YUV 4:2:0 frames laid out the way mobile camera HALs deliver them:
//! padded luma rows and chroma planes with a pixel stride of 2. The scene is a
//! bright square sliding across a dark background, which gives the stub
//! detector something to find and the tracker something to follow.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{anyhow, Result};

use super::{CameraSource, Facing, FrameConsumer};
use crate::frame::{CameraFrame, Plane, PlanarImage};

const BACKGROUND_LUMA: u8 = 16;
const SUBJECT_LUMA: u8 = 235;

#[derive(Clone, Debug)]
pub struct SyntheticCameraConfig {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// Side length of the bright square in pixels.
    pub subject_size: u32,
    /// Horizontal movement per frame in pixels.
    pub subject_speed: u32,
    /// Extra bytes appended to every row (hardware row padding).
    pub row_padding: usize,
}

impl Default for SyntheticCameraConfig {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            fps: 30,
            subject_size: 160,
            subject_speed: 2,
            row_padding: 64,
        }
    }
}

/// Statistics for a synthetic camera.
#[derive(Clone, Debug)]
pub struct SyntheticCameraStats {
    pub frames_captured: u64,
    pub facing: Option<Facing>,
}

pub struct SyntheticCamera {
    config: SyntheticCameraConfig,
    running: Arc<AtomicBool>,
    frames_captured: Arc<AtomicU64>,
    facing: Option<Facing>,
    worker: Option<JoinHandle<()>>,
}

impl SyntheticCamera {
    pub fn new(config: SyntheticCameraConfig) -> Result<Self> {
        if config.width < 2 || config.height < 2 {
            return Err(anyhow!("synthetic camera needs at least 2x2 frames"));
        }
        if config.fps == 0 {
            return Err(anyhow!("synthetic camera fps must be >= 1"));
        }
        Ok(Self {
            config,
            running: Arc::new(AtomicBool::new(false)),
            frames_captured: Arc::new(AtomicU64::new(0)),
            facing: None,
            worker: None,
        })
    }

    /// Render frame `sequence` without starting the capture thread.
    pub fn frame_at(&self, sequence: u64, facing: Facing) -> CameraFrame {
        render_frame(&self.config, sequence, facing)
    }

    pub fn stats(&self) -> SyntheticCameraStats {
        SyntheticCameraStats {
            frames_captured: self.frames_captured.load(Ordering::Relaxed),
            facing: self.facing,
        }
    }
}

impl CameraSource for SyntheticCamera {
    fn start(&mut self, facing: Facing, consumer: Arc<dyn FrameConsumer>) -> Result<()> {
        self.stop()?;

        let running = Arc::new(AtomicBool::new(true));
        self.running = running.clone();
        self.facing = Some(facing);
        let frames_captured = self.frames_captured.clone();
        let config = self.config.clone();
        let interval = Duration::from_secs_f64(1.0 / config.fps as f64);

        let worker = std::thread::Builder::new()
            .name("camera".into())
            .spawn(move || {
                let mut sequence = 0u64;
                while running.load(Ordering::SeqCst) {
                    consumer.deliver(render_frame(&config, sequence, facing));
                    frames_captured.fetch_add(1, Ordering::Relaxed);
                    sequence += 1;
                    std::thread::sleep(interval);
                }
            })?;
        self.worker = Some(worker);
        log::info!(
            "SyntheticCamera: streaming {}x{} @ {} fps ({:?})",
            self.config.width,
            self.config.height,
            self.config.fps,
            facing
        );
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            worker
                .join()
                .map_err(|_| anyhow!("camera thread panicked"))?;
            log::info!("SyntheticCamera: stopped");
        }
        Ok(())
    }
}

impl Drop for SyntheticCamera {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            log::warn!("SyntheticCamera: {}", err);
        }
    }
}

/// Left edge of the subject for a given frame, bouncing between the walls.
fn subject_x(config: &SyntheticCameraConfig, sequence: u64) -> u32 {
    let size = config.subject_size.min(config.width);
    let travel = (config.width - size) as u64;
    if travel == 0 {
        return 0;
    }
    let pos = sequence * config.subject_speed as u64 % (travel * 2);
    if pos <= travel {
        pos as u32
    } else {
        (travel * 2 - pos) as u32
    }
}

fn render_frame(config: &SyntheticCameraConfig, sequence: u64, facing: Facing) -> CameraFrame {
    let w = config.width as usize;
    let h = config.height as usize;
    let size = config.subject_size.min(config.width).min(config.height) as usize;
    let mut left = subject_x(config, sequence) as usize;
    if facing == Facing::Front {
        left = w - size - left;
    }
    let top = (h - size) / 2;

    let y_stride = w + config.row_padding;
    let mut y = vec![BACKGROUND_LUMA; y_stride * h];
    for row in top..top + size {
        let start = row * y_stride + left;
        y[start..start + size].fill(SUBJECT_LUMA);
    }

    let chroma_stride = w.div_ceil(2) * 2 + config.row_padding;
    let chroma_len = chroma_stride * h.div_ceil(2);
    CameraFrame::planar(
        sequence,
        PlanarImage {
            width: config.width,
            height: config.height,
            y: Plane::new(y, y_stride, 1),
            u: Plane::new(vec![128; chroma_len], chroma_stride, 2),
            v: Plane::new(vec![128; chroma_len], chroma_stride, 2),
        },
    )
}
