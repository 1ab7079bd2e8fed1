//! Deterministic backends with no model files.
//!
//! They operate on brightness alone, which is enough for the synthetic camera
//! (bright subject on a dark background) and for tests.

use crate::detect::backend::{ClassifierModel, DetectorModel, LivenessModel};
use crate::detect::result::{BoundingBox, Detection};
use crate::error::{StageError, StageResult};
use crate::tensor::{ChannelNorm, InputSpec, Normalization, QuantParams, Tensor, CHANNELS};

const UNIT_QUANT: QuantParams = QuantParams {
    scale: 1.0 / 255.0,
    zero_point: 0,
};

/// Finds the bounding box of all bright pixels.
pub struct StubDetector {
    width: u32,
    height: u32,
    threshold: u8,
    min_pixels: usize,
}

impl StubDetector {
    pub fn new() -> Self {
        Self {
            width: 160,
            height: 120,
            threshold: 128,
            min_pixels: 4,
        }
    }

    pub fn with_input_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }
}

impl Default for StubDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl DetectorModel for StubDetector {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn input_spec(&self) -> InputSpec {
        InputSpec {
            width: self.width,
            height: self.height,
            normalization: Normalization::Quantized {
                norm: ChannelNorm::UNIT,
                params: UNIT_QUANT,
            },
        }
    }

    fn detect(&mut self, input: &Tensor) -> StageResult<Vec<Detection>> {
        let pixels = input
            .as_u8()
            .ok_or_else(|| StageError::format("stub detector expects a u8 tensor"))?;
        let [_, h, w, _] = input.shape();

        let mut bounds: Option<(usize, usize, usize, usize)> = None;
        let mut bright = 0usize;
        for (i, px) in pixels.chunks_exact(CHANNELS).enumerate() {
            let luma = (px[0] as u32 + px[1] as u32 + px[2] as u32) / 3;
            if luma < self.threshold as u32 {
                continue;
            }
            bright += 1;
            let (x, y) = (i % w, i / w);
            bounds = Some(match bounds {
                None => (x, y, x, y),
                Some((x0, y0, x1, y1)) => (x0.min(x), y0.min(y), x1.max(x), y1.max(y)),
            });
        }

        let Some((x0, y0, x1, y1)) = bounds else {
            return Ok(Vec::new());
        };
        if bright < self.min_pixels {
            return Ok(Vec::new());
        }
        let bbox = BoundingBox::new(
            x0 as f32 / w as f32,
            y0 as f32 / h as f32,
            (x1 + 1) as f32 / w as f32,
            (y1 + 1) as f32 / h as f32,
        )?;
        let filled = bright as f32 / ((x1 - x0 + 1) * (y1 - y0 + 1)) as f32;
        Ok(vec![Detection {
            bbox,
            confidence: filled.min(1.0),
        }])
    }
}

/// Scores a crop by its mean intensity.
pub struct StubLivenessModel {
    output_quant: QuantParams,
}

impl StubLivenessModel {
    pub fn new() -> Self {
        Self {
            output_quant: QuantParams::new(0.003_906_25, 0),
        }
    }
}

impl Default for StubLivenessModel {
    fn default() -> Self {
        Self::new()
    }
}

impl LivenessModel for StubLivenessModel {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn input_quant(&self) -> QuantParams {
        UNIT_QUANT
    }

    fn output_quant(&self) -> QuantParams {
        self.output_quant
    }

    fn score(&mut self, input: &Tensor) -> StageResult<u8> {
        let values = input
            .as_u8()
            .ok_or_else(|| StageError::ScorerUnavailable("stub scorer expects a u8 tensor".into()))?;
        if values.is_empty() {
            return Ok(0);
        }
        let sum: u64 = values.iter().map(|&v| v as u64).sum();
        Ok((sum / values.len() as u64) as u8)
    }
}

/// Two-class classifier: `[dark, bright]` from the mean intensity.
pub struct StubClassifier {
    spec: InputSpec,
}

impl StubClassifier {
    /// 224x224 input with ImageNet statistics.
    pub fn new() -> Self {
        Self::with_input(InputSpec {
            width: 224,
            height: 224,
            normalization: Normalization::Float(ChannelNorm::IMAGENET),
        })
    }

    /// Use the given float input, typically the session settings.
    pub fn with_input(spec: InputSpec) -> Self {
        Self { spec }
    }
}

impl Default for StubClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl ClassifierModel for StubClassifier {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn input_spec(&self) -> InputSpec {
        self.spec
    }

    fn classify(&mut self, input: &Tensor) -> StageResult<Vec<f32>> {
        let values = input
            .as_f32()
            .ok_or_else(|| StageError::ScorerUnavailable("stub classifier expects f32".into()))?;
        let Normalization::Float(norm) = input.normalization() else {
            return Err(StageError::ScorerUnavailable(
                "stub classifier expects float normalization".into(),
            ));
        };
        if values.is_empty() {
            return Ok(vec![0.5, 0.5]);
        }
        let mut sum = 0.0f32;
        for (i, v) in values.iter().enumerate() {
            let c = i % CHANNELS;
            sum += v * norm.std[c] + norm.mean[c];
        }
        let bright = (sum / values.len() as f32).clamp(0.0, 1.0);
        Ok(vec![1.0 - bright, bright])
    }
}
