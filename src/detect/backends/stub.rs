use anyhow::Result;

use crate::detect::backend::{empty_detections, DetectorBackend, ModelInput, RawDetections};

/// Backend that never detects anything. Counts calls for tests.
#[derive(Default)]
pub struct StubBackend {
    calls: u64,
}

impl StubBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> u64 {
        self.calls
    }
}

impl DetectorBackend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn detect_raw(&mut self, _input: &ModelInput<'_>) -> Result<RawDetections> {
        self.calls += 1;
        Ok(empty_detections())
    }
}
