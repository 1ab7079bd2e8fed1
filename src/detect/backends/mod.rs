pub mod stub;

#[cfg(feature = "backend-tract")]
pub mod tract;

pub use stub::{StubClassifier, StubDetector, StubLivenessModel};

#[cfg(feature = "backend-tract")]
pub use tract::{TractClassifier, TractDetector, TractLivenessModel};
