//! Frame buffer adapter: raw camera layouts to packed RGB.
//!
//! Every plane access is bounds-checked up front, so a malformed layout
//! fails with `StageError::Format` instead of reading out of bounds.

use crate::error::{StageError, StageResult};
use crate::frame::{FrameData, PixelBuffer, PixelFormat, PlanarImage};

/// Convert any delivered frame layout into an `Rgb24` buffer.
///
/// Packed RGB input is passed through after validation; everything else is
/// converted with BT.601 full-range coefficients.
pub fn to_rgb(data: FrameData) -> StageResult<PixelBuffer> {
    match data {
        FrameData::Planar(image) => planar_to_rgb(&image),
        FrameData::Packed(buffer) => match buffer.format() {
            PixelFormat::Rgb24 => Ok(buffer),
            PixelFormat::Nv12 | PixelFormat::Nv21 => semi_planar_to_rgb(&buffer),
        },
    }
}

/// Convert a YUV 4:2:0 frame with arbitrary row and pixel strides.
pub fn planar_to_rgb(image: &PlanarImage) -> StageResult<PixelBuffer> {
    let (width, height) = (image.width, image.height);
    let y = PlaneView::new("Y", &image.y.data, 0, image.y.row_stride, image.y.pixel_stride);
    let u = PlaneView::new("U", &image.u.data, 0, image.u.row_stride, image.u.pixel_stride);
    let v = PlaneView::new("V", &image.v.data, 0, image.v.row_stride, image.v.pixel_stride);
    convert(width, height, y, u, v)
}

fn semi_planar_to_rgb(buffer: &PixelBuffer) -> StageResult<PixelBuffer> {
    let width = buffer.width() as usize;
    let height = buffer.height() as usize;
    let luma = width * height;
    let chroma_stride = width.div_ceil(2) * 2;
    let (u_offset, v_offset) = match buffer.format() {
        PixelFormat::Nv21 => (luma + 1, luma),
        _ => (luma, luma + 1),
    };
    let data = buffer.data();
    let y = PlaneView::new("Y", data, 0, width, 1);
    let u = PlaneView::new("U", data, u_offset, chroma_stride, 2);
    let v = PlaneView::new("V", data, v_offset, chroma_stride, 2);
    convert(buffer.width(), buffer.height(), y, u, v)
}

struct PlaneView<'a> {
    name: &'static str,
    data: &'a [u8],
    offset: usize,
    row_stride: usize,
    pixel_stride: usize,
}

impl<'a> PlaneView<'a> {
    fn new(
        name: &'static str,
        data: &'a [u8],
        offset: usize,
        row_stride: usize,
        pixel_stride: usize,
    ) -> Self {
        Self {
            name,
            data,
            offset,
            row_stride,
            pixel_stride,
        }
    }

    /// Verify that a `cols` x `rows` sample grid fits in the backing slice.
    fn check(&self, cols: usize, rows: usize) -> StageResult<()> {
        if self.pixel_stride == 0 {
            return Err(StageError::format(format!(
                "{} plane pixel stride must be >= 1",
                self.name
            )));
        }
        let row_span = (cols - 1)
            .checked_mul(self.pixel_stride)
            .and_then(|v| v.checked_add(1))
            .ok_or_else(|| StageError::format(format!("{} plane stride overflow", self.name)))?;
        if rows > 1 && self.row_stride < row_span {
            return Err(StageError::format(format!(
                "{} plane row stride {} shorter than row span {}",
                self.name, self.row_stride, row_span
            )));
        }
        let last = (rows - 1)
            .checked_mul(self.row_stride)
            .and_then(|v| v.checked_add(row_span - 1))
            .and_then(|v| v.checked_add(self.offset))
            .ok_or_else(|| StageError::format(format!("{} plane stride overflow", self.name)))?;
        if last >= self.data.len() {
            return Err(StageError::format(format!(
                "{} plane too small: needs index {}, has {} bytes",
                self.name,
                last,
                self.data.len()
            )));
        }
        Ok(())
    }

    #[inline]
    fn sample(&self, col: usize, row: usize) -> u8 {
        self.data[self.offset + row * self.row_stride + col * self.pixel_stride]
    }
}

fn convert(
    width: u32,
    height: u32,
    y: PlaneView<'_>,
    u: PlaneView<'_>,
    v: PlaneView<'_>,
) -> StageResult<PixelBuffer> {
    if width == 0 || height == 0 {
        return Err(StageError::format(format!(
            "frame has zero dimension {}x{}",
            width, height
        )));
    }
    let w = width as usize;
    let h = height as usize;
    let cw = w.div_ceil(2);
    let ch = h.div_ceil(2);
    y.check(w, h)?;
    u.check(cw, ch)?;
    v.check(cw, ch)?;

    let mut rgb = Vec::with_capacity(w * h * 3);
    for j in 0..h {
        for i in 0..w {
            let luma = y.sample(i, j) as f32;
            let cb = u.sample(i / 2, j / 2) as f32 - 128.0;
            let cr = v.sample(i / 2, j / 2) as f32 - 128.0;

            let r = luma + 1.402_f32 * cr;
            let g = luma - 0.344_136_f32 * cb - 0.714_136_f32 * cr;
            let b = luma + 1.772_f32 * cb;

            rgb.push(clamp_to_u8(r));
            rgb.push(clamp_to_u8(g));
            rgb.push(clamp_to_u8(b));
        }
    }

    PixelBuffer::new(rgb, width, height, PixelFormat::Rgb24)
}

fn clamp_to_u8(value: f32) -> u8 {
    value.round().clamp(0.0, 255.0) as u8
}
