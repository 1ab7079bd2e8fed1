mod backend;
pub mod backends;
mod provider;
mod result;

pub use backend::{ClassifierModel, DetectorModel, LivenessModel};
pub use backends::{StubClassifier, StubDetector, StubLivenessModel};
pub use provider::{Provider, ProviderChain};
pub use result::{BoundingBox, Detection};
