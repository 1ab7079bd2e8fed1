//! Tensor preprocessing.
//!
//! Crops a region of an RGB `PixelBuffer`, resizes it bilinearly to a model's
//! input size and normalizes it into either a float tensor or a quantized
//! `u8` tensor. The output layout is NHWC, `[1, H, W, 3]`.
//!
//! Pure computation: no I/O, no shared state, safe to call from any thread.

use serde::{Deserialize, Serialize};

use crate::error::{StageError, StageResult};
use crate::frame::{PixelBuffer, PixelFormat, Region};

pub const CHANNELS: usize = 3;

/// Affine mapping between integer tensor values and real values:
/// `real = (q - zero_point) * scale`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct QuantParams {
    pub scale: f32,
    pub zero_point: i32,
}

impl QuantParams {
    pub fn new(scale: f32, zero_point: i32) -> Self {
        Self { scale, zero_point }
    }

    /// `q = round(real / scale) + zero_point`, clipped to `u8`.
    pub fn quantize(&self, real: f32) -> u8 {
        let q = (real / self.scale).round() as i64 + self.zero_point as i64;
        q.clamp(u8::MIN as i64, u8::MAX as i64) as u8
    }

    pub fn dequantize(&self, q: u8) -> f32 {
        (q as i32 - self.zero_point) as f32 * self.scale
    }

    fn validate(&self) -> StageResult<()> {
        if !(self.scale.is_finite() && self.scale > 0.0) {
            return Err(StageError::format(format!(
                "quantization scale must be positive, got {}",
                self.scale
            )));
        }
        Ok(())
    }
}

/// Per-channel `(value / 255 - mean) / std`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChannelNorm {
    pub mean: [f32; 3],
    pub std: [f32; 3],
}

impl ChannelNorm {
    /// Common pretrained-model statistics.
    pub const IMAGENET: ChannelNorm = ChannelNorm {
        mean: [0.485, 0.456, 0.406],
        std: [0.229, 0.224, 0.225],
    };

    /// Plain `value / 255`.
    pub const UNIT: ChannelNorm = ChannelNorm {
        mean: [0.0; 3],
        std: [1.0; 3],
    };

    #[inline]
    fn apply(&self, channel: usize, value: f32) -> f32 {
        (value / 255.0 - self.mean[channel]) / self.std[channel]
    }

    fn validate(&self) -> StageResult<()> {
        if self.std.iter().any(|s| !(s.is_finite() && *s > 0.0)) {
            return Err(StageError::format(format!(
                "channel std must be positive, got {:?}",
                self.std
            )));
        }
        Ok(())
    }
}

impl Default for ChannelNorm {
    fn default() -> Self {
        Self::IMAGENET
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Normalization {
    Float(ChannelNorm),
    /// Normalize with `norm`, then quantize with `params`.
    Quantized {
        norm: ChannelNorm,
        params: QuantParams,
    },
}

/// Input declaration of a model.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct InputSpec {
    pub width: u32,
    pub height: u32,
    pub normalization: Normalization,
}

#[derive(Clone, Debug, PartialEq)]
pub enum TensorData {
    F32(Vec<f32>),
    U8(Vec<u8>),
}

/// Model-ready NHWC tensor with its normalization attached.
#[derive(Clone, Debug)]
pub struct Tensor {
    shape: [usize; 4],
    data: TensorData,
    normalization: Normalization,
}

impl Tensor {
    /// `[1, H, W, C]`.
    pub fn shape(&self) -> [usize; 4] {
        self.shape
    }

    pub fn data(&self) -> &TensorData {
        &self.data
    }

    pub fn normalization(&self) -> Normalization {
        self.normalization
    }

    pub fn as_f32(&self) -> Option<&[f32]> {
        match &self.data {
            TensorData::F32(values) => Some(values),
            TensorData::U8(_) => None,
        }
    }

    pub fn as_u8(&self) -> Option<&[u8]> {
        match &self.data {
            TensorData::U8(values) => Some(values),
            TensorData::F32(_) => None,
        }
    }

    /// Real-valued view of the tensor (dequantizing `u8` data).
    pub fn to_real(&self) -> Vec<f32> {
        match (&self.data, self.normalization) {
            (TensorData::F32(values), _) => values.clone(),
            (TensorData::U8(values), Normalization::Quantized { params, .. }) => {
                values.iter().map(|&q| params.dequantize(q)).collect()
            }
            (TensorData::U8(values), Normalization::Float(_)) => {
                values.iter().map(|&q| q as f32).collect()
            }
        }
    }

    pub fn len(&self) -> usize {
        match &self.data {
            TensorData::F32(values) => values.len(),
            TensorData::U8(values) => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Resize + normalize to a fixed model input.
#[derive(Clone, Debug)]
pub struct Preprocessor {
    spec: InputSpec,
}

impl Preprocessor {
    pub fn new(spec: InputSpec) -> StageResult<Self> {
        if spec.width == 0 || spec.height == 0 {
            return Err(StageError::region(format!(
                "resize target {}x{} has zero area",
                spec.width, spec.height
            )));
        }
        match spec.normalization {
            Normalization::Float(norm) => norm.validate()?,
            Normalization::Quantized { norm, params } => {
                norm.validate()?;
                params.validate()?;
            }
        }
        Ok(Self { spec })
    }

    pub fn spec(&self) -> &InputSpec {
        &self.spec
    }

    /// Extract the whole frame.
    pub fn extract(&self, buffer: &PixelBuffer) -> StageResult<Tensor> {
        self.extract_region(buffer, Region::full(buffer.width(), buffer.height()))
    }

    /// Extract `region` (clamped to the frame). Zero-area crops fail with
    /// `InvalidRegion`.
    pub fn extract_region(&self, buffer: &PixelBuffer, region: Region) -> StageResult<Tensor> {
        if buffer.format() != PixelFormat::Rgb24 {
            return Err(StageError::format(format!(
                "tensor extraction requires Rgb24, got {:?}",
                buffer.format()
            )));
        }
        let region = region.clamp_to(buffer.width(), buffer.height());
        if region.is_empty() {
            return Err(StageError::region(format!(
                "crop {}x{} at ({}, {}) has zero area",
                region.width, region.height, region.x, region.y
            )));
        }

        let out_w = self.spec.width as usize;
        let out_h = self.spec.height as usize;
        let len = out_w * out_h * CHANNELS;
        let shape = [1, out_h, out_w, CHANNELS];

        let data = match self.spec.normalization {
            Normalization::Float(norm) => {
                let mut values = Vec::with_capacity(len);
                resize_bilinear(buffer, region, out_w, out_h, |c, v| {
                    values.push(norm.apply(c, v))
                });
                TensorData::F32(values)
            }
            Normalization::Quantized { norm, params } => {
                let mut values = Vec::with_capacity(len);
                resize_bilinear(buffer, region, out_w, out_h, |c, v| {
                    values.push(params.quantize(norm.apply(c, v)))
                });
                TensorData::U8(values)
            }
        };

        Ok(Tensor {
            shape,
            data,
            normalization: self.spec.normalization,
        })
    }
}

/// Half-pixel-centre bilinear sampling of `region`, emitting channel values
/// in NHWC order through `emit(channel, value)`.
fn resize_bilinear(
    buffer: &PixelBuffer,
    region: Region,
    out_w: usize,
    out_h: usize,
    mut emit: impl FnMut(usize, f32),
) {
    let rw = region.width as usize;
    let rh = region.height as usize;
    let scale_x = rw as f32 / out_w as f32;
    let scale_y = rh as f32 / out_h as f32;

    for oy in 0..out_h {
        let (y0, y1, fy) = source_coords(oy, scale_y, rh);
        for ox in 0..out_w {
            let (x0, x1, fx) = source_coords(ox, scale_x, rw);
            let p00 = buffer.rgb_at(region.x + x0, region.y + y0);
            let p10 = buffer.rgb_at(region.x + x1, region.y + y0);
            let p01 = buffer.rgb_at(region.x + x0, region.y + y1);
            let p11 = buffer.rgb_at(region.x + x1, region.y + y1);
            for c in 0..CHANNELS {
                let top = p00[c] as f32 * (1.0 - fx) + p10[c] as f32 * fx;
                let bottom = p01[c] as f32 * (1.0 - fx) + p11[c] as f32 * fx;
                emit(c, top * (1.0 - fy) + bottom * fy);
            }
        }
    }
}

fn source_coords(out: usize, scale: f32, extent: usize) -> (u32, u32, f32) {
    let max = (extent - 1) as f32;
    let src = ((out as f32 + 0.5) * scale - 0.5).clamp(0.0, max);
    let lo = src.floor();
    let hi = (lo + 1.0).min(max);
    (lo as u32, hi as u32, src - lo)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn float_spec(width: u32, height: u32) -> InputSpec {
        InputSpec {
            width,
            height,
            normalization: Normalization::Float(ChannelNorm::IMAGENET),
        }
    }

    fn quant_spec(width: u32, height: u32, params: QuantParams) -> InputSpec {
        InputSpec {
            width,
            height,
            normalization: Normalization::Quantized {
                norm: ChannelNorm::UNIT,
                params,
            },
        }
    }

    #[test]
    fn output_shape_ignores_input_dimensions() -> StageResult<()> {
        let pre = Preprocessor::new(float_spec(8, 6))?;
        for (w, h) in [(1, 1), (3, 17), (640, 480), (9, 2)] {
            let buffer = PixelBuffer::filled(w, h, [10, 20, 30])?;
            let tensor = pre.extract(&buffer)?;
            assert_eq!(tensor.shape(), [1, 6, 8, 3]);
            assert_eq!(tensor.len(), 6 * 8 * 3);
        }
        Ok(())
    }

    #[test]
    fn float_normalization_uses_channel_constants() -> StageResult<()> {
        let pre = Preprocessor::new(float_spec(2, 2))?;
        let buffer = PixelBuffer::filled(4, 4, [255, 0, 128])?;
        let tensor = pre.extract(&buffer)?;
        let values = tensor.as_f32().unwrap();
        let expected_r = (1.0 - 0.485) / 0.229;
        let expected_g = (0.0 - 0.456) / 0.224;
        assert!((values[0] - expected_r).abs() < 1e-5);
        assert!((values[1] - expected_g).abs() < 1e-5);
        Ok(())
    }

    #[test]
    fn unit_quantization_passes_pixels_through() -> StageResult<()> {
        let pre = Preprocessor::new(quant_spec(3, 3, QuantParams::new(1.0 / 255.0, 0)))?;
        let buffer = PixelBuffer::filled(5, 5, [0, 77, 255])?;
        let tensor = pre.extract(&buffer)?;
        assert_eq!(&tensor.as_u8().unwrap()[..3], &[0, 77, 255]);
        Ok(())
    }

    #[test]
    fn quantization_clips_to_u8_range() {
        let params = QuantParams::new(0.01, 10);
        assert_eq!(params.quantize(100.0), 255);
        assert_eq!(params.quantize(-100.0), 0);
        assert_eq!(params.quantize(0.0), 10);
    }

    #[test]
    fn quantization_round_trip_within_one_step() {
        let params = QuantParams::new(0.0125, 37);
        let lo = params.dequantize(0);
        let hi = params.dequantize(255);
        let mut v = lo;
        while v <= hi {
            let back = params.dequantize(params.quantize(v));
            assert!(
                (back - v).abs() <= params.scale,
                "v={} back={} step={}",
                v,
                back,
                params.scale
            );
            v += 0.003;
        }
    }

    #[test]
    fn bilinear_interpolates_between_columns() -> StageResult<()> {
        // Two columns: black then white. Downscale to one column samples the middle.
        let data = vec![0, 0, 0, 255, 255, 255];
        let buffer = PixelBuffer::new(data, 2, 1, PixelFormat::Rgb24)?;
        let pre = Preprocessor::new(quant_spec(1, 1, QuantParams::new(1.0 / 255.0, 0)))?;
        let tensor = pre.extract(&buffer)?;
        let v = tensor.as_u8().unwrap()[0];
        assert!((127..=128).contains(&v), "got {}", v);
        Ok(())
    }

    #[test]
    fn crop_is_clamped_before_extraction() -> StageResult<()> {
        let pre = Preprocessor::new(float_spec(4, 4))?;
        let buffer = PixelBuffer::filled(10, 10, [1, 2, 3])?;
        let tensor = pre.extract_region(&buffer, Region::new(8, 8, 50, 50))?;
        assert_eq!(tensor.shape(), [1, 4, 4, 3]);
        Ok(())
    }

    #[test]
    fn zero_area_crop_is_invalid_region() -> StageResult<()> {
        let pre = Preprocessor::new(float_spec(4, 4))?;
        let buffer = PixelBuffer::filled(10, 10, [1, 2, 3])?;
        let err = pre
            .extract_region(&buffer, Region::new(2, 2, 0, 5))
            .unwrap_err();
        assert!(matches!(err, StageError::InvalidRegion(_)));
        Ok(())
    }

    #[test]
    fn zero_size_target_is_rejected() {
        assert!(matches!(
            Preprocessor::new(float_spec(0, 4)),
            Err(StageError::InvalidRegion(_))
        ));
    }

    #[test]
    fn dequantized_view_matches_params() -> StageResult<()> {
        let params = QuantParams::new(0.5, 4);
        let pre = Preprocessor::new(InputSpec {
            width: 1,
            height: 1,
            normalization: Normalization::Quantized {
                norm: ChannelNorm::UNIT,
                params,
            },
        })?;
        let tensor = pre.extract(&PixelBuffer::filled(1, 1, [255, 255, 255])?)?;
        // real 1.0 -> q = 2 + 4 = 6 -> back to 1.0
        assert_eq!(tensor.as_u8().unwrap(), &[6, 6, 6]);
        assert_eq!(tensor.to_real(), vec![1.0, 1.0, 1.0]);
        Ok(())
    }
}
