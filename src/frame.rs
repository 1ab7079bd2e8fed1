//! Frame containers.
//!
//! - `CameraFrame`: what a camera source delivers (sequence number + raw layout).
//! - `PlanarImage`: YUV 4:2:0 with independent row and pixel strides per plane.
//! - `PixelBuffer`: canonical packed buffer consumed by tensor extraction.
//!
//! Frames carry face imagery, so pixel storage is zeroized on drop.

use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{StageError, StageResult};

/// Packed pixel layouts accepted by the adapter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PixelFormat {
    /// Interleaved 8-bit R, G, B.
    Rgb24,
    /// Full-resolution Y plane followed by interleaved U/V at quarter resolution.
    Nv12,
    /// Same as `Nv12` with V before U (Android camera default).
    Nv21,
}

impl PixelFormat {
    /// Bytes needed to hold a `width` x `height` image in this layout.
    pub fn expected_len(self, width: u32, height: u32) -> StageResult<usize> {
        let w = width as usize;
        let h = height as usize;
        let luma = w
            .checked_mul(h)
            .ok_or_else(|| StageError::format("frame dimensions overflow"))?;
        match self {
            PixelFormat::Rgb24 => luma
                .checked_mul(3)
                .ok_or_else(|| StageError::format("frame dimensions overflow")),
            PixelFormat::Nv12 | PixelFormat::Nv21 => {
                let chroma = w.div_ceil(2) * h.div_ceil(2) * 2;
                Ok(luma + chroma)
            }
        }
    }
}

/// Pixel rectangle inside a frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Region {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Region {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn full(width: u32, height: u32) -> Self {
        Self::new(0, 0, width, height)
    }

    /// Clamp to a `frame_width` x `frame_height` frame. The result may be empty.
    pub fn clamp_to(self, frame_width: u32, frame_height: u32) -> Self {
        let x = self.x.min(frame_width);
        let y = self.y.min(frame_height);
        Self {
            x,
            y,
            width: self.width.min(frame_width - x),
            height: self.height.min(frame_height - y),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

/// Canonical packed pixel buffer. Immutable once produced.
pub struct PixelBuffer {
    data: Vec<u8>,
    width: u32,
    height: u32,
    format: PixelFormat,
}

impl PixelBuffer {
    /// Wrap packed bytes, validating the length against the layout.
    pub fn new(data: Vec<u8>, width: u32, height: u32, format: PixelFormat) -> StageResult<Self> {
        if width == 0 || height == 0 {
            return Err(StageError::format(format!(
                "frame has zero dimension {}x{}",
                width, height
            )));
        }
        let expected = format.expected_len(width, height)?;
        if data.len() != expected {
            return Err(StageError::format(format!(
                "{:?} frame length mismatch: expected {}, got {}",
                format,
                expected,
                data.len()
            )));
        }
        Ok(Self {
            data,
            width,
            height,
            format,
        })
    }

    /// Solid-colour RGB buffer.
    pub fn filled(width: u32, height: u32, rgb: [u8; 3]) -> StageResult<Self> {
        let pixels = (width as usize) * (height as usize);
        let data = rgb.iter().copied().cycle().take(pixels * 3).collect();
        Self::new(data, width, height, PixelFormat::Rgb24)
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// RGB triple at `(x, y)`. Only meaningful for `Rgb24` buffers.
    pub(crate) fn rgb_at(&self, x: u32, y: u32) -> [u8; 3] {
        let offset = ((y as usize) * (self.width as usize) + x as usize) * 3;
        [
            self.data[offset],
            self.data[offset + 1],
            self.data[offset + 2],
        ]
    }

    /// Copy a sub-rectangle into a new RGB buffer.
    ///
    /// The region is clamped to the frame first; an empty result fails with
    /// `InvalidRegion`.
    pub fn crop(&self, region: Region) -> StageResult<PixelBuffer> {
        if self.format != PixelFormat::Rgb24 {
            return Err(StageError::format(format!(
                "crop requires Rgb24, got {:?}",
                self.format
            )));
        }
        let region = region.clamp_to(self.width, self.height);
        if region.is_empty() {
            return Err(StageError::region(format!(
                "crop {}x{} at ({}, {}) has zero area",
                region.width, region.height, region.x, region.y
            )));
        }
        let stride = self.width as usize * 3;
        let row_len = region.width as usize * 3;
        let mut data = Vec::with_capacity(row_len * region.height as usize);
        for row in region.y..region.y + region.height {
            let start = row as usize * stride + region.x as usize * 3;
            data.extend_from_slice(&self.data[start..start + row_len]);
        }
        PixelBuffer::new(data, region.width, region.height, PixelFormat::Rgb24)
    }
}

impl std::fmt::Debug for PixelBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PixelBuffer")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("format", &self.format)
            .finish_non_exhaustive()
    }
}

impl Drop for PixelBuffer {
    fn drop(&mut self) {
        self.data.zeroize();
    }
}

/// One plane of a planar frame.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Plane {
    pub data: Vec<u8>,
    /// Bytes between the starts of consecutive rows (may exceed the row width).
    pub row_stride: usize,
    /// Bytes between consecutive samples in a row.
    pub pixel_stride: usize,
}

impl Plane {
    pub fn new(data: Vec<u8>, row_stride: usize, pixel_stride: usize) -> Self {
        Self {
            data,
            row_stride,
            pixel_stride,
        }
    }
}

/// YUV 4:2:0 frame with separate luma and chroma planes.
#[derive(Clone)]
pub struct PlanarImage {
    pub width: u32,
    pub height: u32,
    pub y: Plane,
    pub u: Plane,
    pub v: Plane,
}

/// Raw layout of a delivered frame.
pub enum FrameData {
    Planar(PlanarImage),
    Packed(PixelBuffer),
}

/// A frame as delivered by a camera source.
pub struct CameraFrame {
    pub sequence: u64,
    pub data: FrameData,
}

impl CameraFrame {
    pub fn planar(sequence: u64, image: PlanarImage) -> Self {
        Self {
            sequence,
            data: FrameData::Planar(image),
        }
    }

    pub fn packed(sequence: u64, buffer: PixelBuffer) -> Self {
        Self {
            sequence,
            data: FrameData::Packed(buffer),
        }
    }

    pub fn width(&self) -> u32 {
        match &self.data {
            FrameData::Planar(image) => image.width,
            FrameData::Packed(buffer) => buffer.width(),
        }
    }

    pub fn height(&self) -> u32 {
        match &self.data {
            FrameData::Planar(image) => image.height,
            FrameData::Packed(buffer) => buffer.height(),
        }
    }
}
