#![cfg(feature = "backend-tract")]

//! Tract-based ONNX backends.
//!
//! Models are loaded from local files only. Each loader is offered as two
//! providers: an optimized plan first, then an unoptimized typed plan for
//! graphs the optimizer rejects.
//!
//! Expected model signatures (NHWC inputs):
//! - detector: `[1, H, W, 3]` input, output rows `[x1, y1, x2, y2, score]`
//!   normalized to the frame
//! - liveness: `[1, H, W, 3]` `u8` input, first output element is the raw
//!   quantized score
//! - classifier: `[1, H, W, 3]` `f32` input, output `[1, classes]`

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tract_onnx::prelude::*;

use crate::detect::backend::{ClassifierModel, DetectorModel, LivenessModel};
use crate::detect::provider::ProviderChain;
use crate::detect::result::{BoundingBox, Detection};
use crate::error::{StageError, StageResult};
use crate::tensor::{InputSpec, QuantParams, Tensor as InputTensor, TensorData};

type Plan = TypedRunnableModel<TypedModel>;

fn load_plan(path: &Path, datum: DatumType, height: u32, width: u32, optimize: bool) -> Result<Plan> {
    let model = tract_onnx::onnx()
        .model_for_path(path)
        .with_context(|| format!("failed to load ONNX model from {}", path.display()))?
        .with_input_fact(
            0,
            InferenceFact::dt_shape(datum, tvec!(1, height as usize, width as usize, 3)),
        )
        .context("failed to set input fact")?;
    let typed = if optimize {
        model
            .into_optimized()
            .context("failed to optimize ONNX model")?
    } else {
        model.into_typed().context("failed to type ONNX model")?
    };
    typed
        .into_runnable()
        .context("failed to build runnable ONNX model")
}

fn to_tract(input: &InputTensor) -> StageResult<Tensor> {
    let [n, h, w, c] = input.shape();
    let tensor = match input.data() {
        TensorData::F32(values) => {
            tract_ndarray::Array4::from_shape_vec((n, h, w, c), values.clone())
                .map_err(|e| StageError::format(e.to_string()))?
                .into_tensor()
        }
        TensorData::U8(values) => {
            tract_ndarray::Array4::from_shape_vec((n, h, w, c), values.clone())
                .map_err(|e| StageError::format(e.to_string()))?
                .into_tensor()
        }
    };
    Ok(tensor)
}

fn run(plan: &Plan, input: &InputTensor) -> Result<TVec<TValue>> {
    let tensor = to_tract(input)?;
    plan.run(tvec!(tensor.into())).context("ONNX inference failed")
}

/// ONNX face detector.
pub struct TractDetector {
    plan: Plan,
    spec: InputSpec,
}

impl TractDetector {
    pub fn load<P: AsRef<Path>>(path: P, spec: InputSpec, optimize: bool) -> Result<Self> {
        let datum = match spec.normalization {
            crate::tensor::Normalization::Float(_) => f32::datum_type(),
            crate::tensor::Normalization::Quantized { .. } => u8::datum_type(),
        };
        let plan = load_plan(path.as_ref(), datum, spec.height, spec.width, optimize)?;
        Ok(Self { plan, spec })
    }

    /// Optimized plan first, plain plan as fallback.
    pub fn providers(path: PathBuf, spec: InputSpec) -> ProviderChain<Box<dyn DetectorModel>> {
        let plain = path.clone();
        ProviderChain::new()
            .with("tract-optimized", move || {
                Ok(Box::new(TractDetector::load(&path, spec, true)?) as Box<dyn DetectorModel>)
            })
            .with("tract-plain", move || {
                Ok(Box::new(TractDetector::load(&plain, spec, false)?) as Box<dyn DetectorModel>)
            })
    }
}

impl DetectorModel for TractDetector {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn input_spec(&self) -> InputSpec {
        self.spec
    }

    fn detect(&mut self, input: &InputTensor) -> StageResult<Vec<Detection>> {
        let outputs = run(&self.plan, input)
            .map_err(|e| StageError::DetectorUnavailable(format!("{:#}", e)))?;
        let output = outputs
            .first()
            .ok_or_else(|| StageError::DetectorUnavailable("model produced no outputs".into()))?;
        let rows = output
            .to_array_view::<f32>()
            .map_err(|e| StageError::DetectorUnavailable(e.to_string()))?;
        let flat: Vec<f32> = rows.iter().copied().collect();
        let mut detections = Vec::new();
        for row in flat.chunks_exact(5) {
            match BoundingBox::new(row[0], row[1], row[2], row[3]) {
                Ok(bbox) => detections.push(Detection {
                    bbox,
                    confidence: row[4],
                }),
                Err(err) => log::debug!("TractDetector: dropping box: {}", err),
            }
        }
        Ok(detections)
    }
}

/// Quantized ONNX liveness scorer.
pub struct TractLivenessModel {
    plan: Plan,
    input_quant: QuantParams,
    output_quant: QuantParams,
}

impl TractLivenessModel {
    pub fn load<P: AsRef<Path>>(
        path: P,
        size: (u32, u32),
        input_quant: QuantParams,
        output_quant: QuantParams,
        optimize: bool,
    ) -> Result<Self> {
        let plan = load_plan(path.as_ref(), u8::datum_type(), size.1, size.0, optimize)?;
        Ok(Self {
            plan,
            input_quant,
            output_quant,
        })
    }

    pub fn providers(
        path: PathBuf,
        size: (u32, u32),
        input_quant: QuantParams,
        output_quant: QuantParams,
    ) -> ProviderChain<Box<dyn LivenessModel>> {
        let plain = path.clone();
        ProviderChain::new()
            .with("tract-optimized", move || {
                let model = TractLivenessModel::load(&path, size, input_quant, output_quant, true)?;
                Ok(Box::new(model) as Box<dyn LivenessModel>)
            })
            .with("tract-plain", move || {
                let model = TractLivenessModel::load(&plain, size, input_quant, output_quant, false)?;
                Ok(Box::new(model) as Box<dyn LivenessModel>)
            })
    }
}

impl LivenessModel for TractLivenessModel {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn input_quant(&self) -> QuantParams {
        self.input_quant
    }

    fn output_quant(&self) -> QuantParams {
        self.output_quant
    }

    fn score(&mut self, input: &InputTensor) -> StageResult<u8> {
        let outputs = run(&self.plan, input)
            .map_err(|e| StageError::ScorerUnavailable(format!("{:#}", e)))?;
        let output = outputs
            .first()
            .ok_or_else(|| StageError::ScorerUnavailable("model produced no outputs".into()))?;
        if let Ok(view) = output.to_array_view::<u8>() {
            return view
                .iter()
                .next()
                .copied()
                .ok_or_else(|| StageError::ScorerUnavailable("empty output".into()));
        }
        // Float graphs: requantize so callers see one contract.
        let view = output
            .to_array_view::<f32>()
            .map_err(|e| StageError::ScorerUnavailable(e.to_string()))?;
        let real = view
            .iter()
            .next()
            .copied()
            .ok_or_else(|| StageError::ScorerUnavailable("empty output".into()))?;
        Ok(self.output_quant.quantize(real))
    }
}

/// Float ONNX classifier for verification sessions.
pub struct TractClassifier {
    plan: Plan,
    spec: InputSpec,
}

impl TractClassifier {
    pub fn load<P: AsRef<Path>>(path: P, spec: InputSpec, optimize: bool) -> Result<Self> {
        let plan = load_plan(path.as_ref(), f32::datum_type(), spec.height, spec.width, optimize)?;
        Ok(Self { plan, spec })
    }

    pub fn providers(path: PathBuf, spec: InputSpec) -> ProviderChain<Box<dyn ClassifierModel>> {
        let plain = path.clone();
        ProviderChain::new()
            .with("tract-optimized", move || {
                Ok(Box::new(TractClassifier::load(&path, spec, true)?) as Box<dyn ClassifierModel>)
            })
            .with("tract-plain", move || {
                Ok(Box::new(TractClassifier::load(&plain, spec, false)?) as Box<dyn ClassifierModel>)
            })
    }
}

impl ClassifierModel for TractClassifier {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn input_spec(&self) -> InputSpec {
        self.spec
    }

    fn classify(&mut self, input: &InputTensor) -> StageResult<Vec<f32>> {
        let outputs = run(&self.plan, input)
            .map_err(|e| StageError::ScorerUnavailable(format!("{:#}", e)))?;
        let output = outputs
            .first()
            .ok_or_else(|| StageError::ScorerUnavailable("model produced no outputs".into()))?;
        let scores = output
            .to_array_view::<f32>()
            .map_err(|e| StageError::ScorerUnavailable(e.to_string()))?;
        let scores: Vec<f32> = scores.iter().copied().collect();
        if scores.is_empty() {
            return Err(StageError::ScorerUnavailable("empty output".into()));
        }
        Ok(scores)
    }
}
