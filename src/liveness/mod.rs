//! Liveness stage.
//!
//! - `LivenessScorer`: crop -> quantized tensor -> model -> dequantized score
//! - `pool`: bounded worker pool that scores crops off the detection thread
//! - `fusion`: streaming classification and fixed-duration sessions

pub mod fusion;
pub mod pool;

use crate::detect::LivenessModel;
use crate::error::StageResult;
use crate::frame::PixelBuffer;
use crate::tensor::{InputSpec, Normalization, Preprocessor, QuantParams};

pub use fusion::{classify_scores, Classification, InferenceSession, SessionOutcome, Verdict};
pub use pool::{LivenessJob, LivenessPool};

/// Dummy inferences run before a scorer is put into service.
pub const WARM_UP_RUNS: usize = 5;

/// One liveness model plus the preprocessing its quantization requires.
pub struct LivenessScorer {
    model: Box<dyn LivenessModel>,
    preprocessor: Preprocessor,
    output_quant: QuantParams,
}

impl LivenessScorer {
    /// `width` x `height` is the model input size. Quantization parameters
    /// are taken from the model.
    pub fn new(model: Box<dyn LivenessModel>, width: u32, height: u32) -> StageResult<Self> {
        let preprocessor = Preprocessor::new(InputSpec {
            width,
            height,
            normalization: Normalization::Quantized {
                norm: model.input_norm(),
                params: model.input_quant(),
            },
        })?;
        let output_quant = model.output_quant();
        Ok(Self {
            model,
            preprocessor,
            output_quant,
        })
    }

    pub fn name(&self) -> &'static str {
        self.model.name()
    }

    /// Score a face crop: `(raw - output_zero_point) * output_scale`.
    pub fn score(&mut self, crop: &PixelBuffer) -> StageResult<f32> {
        let tensor = self.preprocessor.extract(crop)?;
        let raw = self.model.score(&tensor)?;
        Ok(self.output_quant.dequantize(raw))
    }

    /// Run the model's own warm-up, then `runs` inferences on a gray frame.
    pub fn warm_up(&mut self, runs: usize) -> StageResult<()> {
        self.model.warm_up()?;
        let spec = *self.preprocessor.spec();
        let blank = PixelBuffer::filled(spec.width, spec.height, [128, 128, 128])?;
        for _ in 0..runs {
            self.score(&blank)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::StubLivenessModel;
    use crate::error::StageError;
    use crate::tensor::Tensor;

    struct FixedOutput {
        raw: u8,
        output: QuantParams,
    }

    impl LivenessModel for FixedOutput {
        fn name(&self) -> &'static str {
            "fixed"
        }

        fn input_quant(&self) -> QuantParams {
            QuantParams::new(1.0 / 255.0, 0)
        }

        fn output_quant(&self) -> QuantParams {
            self.output
        }

        fn score(&mut self, input: &Tensor) -> StageResult<u8> {
            assert_eq!(input.shape(), [1, 8, 8, 3]);
            Ok(self.raw)
        }
    }

    struct Broken;

    impl LivenessModel for Broken {
        fn name(&self) -> &'static str {
            "broken"
        }

        fn input_quant(&self) -> QuantParams {
            QuantParams::new(1.0 / 255.0, 0)
        }

        fn output_quant(&self) -> QuantParams {
            QuantParams::new(1.0 / 255.0, 0)
        }

        fn score(&mut self, _input: &Tensor) -> StageResult<u8> {
            Err(StageError::ScorerUnavailable("no device".into()))
        }
    }

    #[test]
    fn raw_output_is_dequantized_with_model_params() -> StageResult<()> {
        let model = FixedOutput {
            raw: 200,
            output: QuantParams::new(0.5, 100),
        };
        let mut scorer = LivenessScorer::new(Box::new(model), 8, 8)?;
        let crop = PixelBuffer::filled(20, 30, [10, 20, 30])?;
        assert_eq!(scorer.score(&crop)?, 50.0);
        Ok(())
    }

    #[test]
    fn bright_crop_scores_high_with_stub() -> StageResult<()> {
        let mut scorer = LivenessScorer::new(Box::new(StubLivenessModel::new()), 16, 16)?;
        let bright = PixelBuffer::filled(10, 10, [250, 250, 250])?;
        let dark = PixelBuffer::filled(10, 10, [5, 5, 5])?;
        assert!(scorer.score(&bright)? > 0.9);
        assert!(scorer.score(&dark)? < 0.1);
        Ok(())
    }

    #[test]
    fn warm_up_surfaces_model_failure() -> StageResult<()> {
        let mut scorer = LivenessScorer::new(Box::new(Broken), 8, 8)?;
        assert!(matches!(
            scorer.warm_up(WARM_UP_RUNS),
            Err(StageError::ScorerUnavailable(_))
        ));
        Ok(())
    }
}
