use crate::detect::result::Detection;
use crate::error::StageResult;
use crate::tensor::{ChannelNorm, InputSpec, QuantParams, Tensor};

/// Face detector capability.
///
/// Implementations receive a tensor built to their `input_spec` from the full
/// frame and return boxes normalized to that frame. They must not retain the
/// tensor beyond the call.
pub trait DetectorModel: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    fn input_spec(&self) -> InputSpec;

    fn detect(&mut self, input: &Tensor) -> StageResult<Vec<Detection>>;

    /// Optional warm-up hook.
    fn warm_up(&mut self) -> StageResult<()> {
        Ok(())
    }
}

/// Quantized liveness scorer.
///
/// Input is a `u8` tensor quantized with `input_quant`; the raw `u8` output is
/// dequantized by the caller with `output_quant`.
pub trait LivenessModel: Send {
    fn name(&self) -> &'static str;

    fn input_quant(&self) -> QuantParams;

    fn output_quant(&self) -> QuantParams;

    /// Normalization applied before quantization. Defaults to `value / 255`.
    fn input_norm(&self) -> ChannelNorm {
        ChannelNorm::UNIT
    }

    fn score(&mut self, input: &Tensor) -> StageResult<u8>;

    fn warm_up(&mut self) -> StageResult<()> {
        Ok(())
    }
}

/// Full-frame classifier used by verification sessions. Returns one score
/// per class.
pub trait ClassifierModel: Send {
    fn name(&self) -> &'static str;

    fn input_spec(&self) -> InputSpec;

    fn classify(&mut self, input: &Tensor) -> StageResult<Vec<f32>>;

    fn warm_up(&mut self) -> StageResult<()> {
        Ok(())
    }
}
