//! Inference backends behind `ObjectDetector`.
//!
//! - `cpu`: bright-blob detector, always available
//! - `stub`: reports nothing, counts calls
//! - `tract`: ONNX models (feature `backend-tract`)

mod cpu;
mod stub;
#[cfg(feature = "backend-tract")]
mod tract;

pub use cpu::CpuBackend;
pub use stub::StubBackend;
#[cfg(feature = "backend-tract")]
pub use tract::TractBackend;
