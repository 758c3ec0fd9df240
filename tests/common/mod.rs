//! Common utilities for frame core integration tests.
//!
//! Every test runs on the simulated device so submission order, object
//! lifetimes and hazards can be inspected after the fact.

use std::sync::Arc;
use std::time::Duration;

use gpu_frames::{
    BackendType, Buffer, BufferDescriptor, BufferUsage, DummyBackend, FrameCore, FrameParameters,
    OverflowPolicy, SupportedFeatures,
};

/// Staging bytes per slot used by default in tests.
pub const TEST_STAGING_SIZE: u64 = 4096;

/// A frame core plus a typed handle to the dummy device under it.
pub struct TestContext {
    pub dummy: Arc<DummyBackend>,
    pub core: Arc<FrameCore>,
}

impl TestContext {
    pub fn new() -> Self {
        Self::with_parameters(parameters(TEST_STAGING_SIZE, OverflowPolicy::Grow))
    }

    pub fn with_parameters(params: FrameParameters) -> Self {
        Self::with_features(params, SupportedFeatures::default())
    }

    pub fn with_features(params: FrameParameters, features: SupportedFeatures) -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        let dummy = Arc::new(DummyBackend::with_features(features));
        let core = FrameCore::new(dummy.clone(), params).expect("Failed to create frame core");
        Self {
            dummy,
            core: Arc::new(core),
        }
    }

    /// Record and submit an empty frame.
    pub fn run_frame(&self) {
        self.core.begin_frame().expect("begin_frame failed");
        self.core.end_frame().expect("end_frame failed");
    }

    /// Create a device-local buffer that uploads can target.
    #[allow(dead_code)]
    pub fn create_target_buffer(&self, size: u64) -> Buffer {
        self.core
            .create_buffer(
                &BufferDescriptor::new(size, BufferUsage::STORAGE | BufferUsage::COPY_DST)
                    .with_label("test target"),
            )
            .expect("Failed to create buffer")
    }

    /// Wait for the device and check that it saw no misuse.
    pub fn finish(&self) {
        self.core.wait_idle().expect("wait_idle failed");
        assert_eq!(self.dummy.violations(), vec![]);
    }
}

/// Dummy-backend parameters with a short fence timeout.
pub fn parameters(staging_size: u64, policy: OverflowPolicy) -> FrameParameters {
    FrameParameters::new()
        .with_backend(BackendType::Dummy)
        .with_staging_size(staging_size)
        .with_overflow_policy(policy)
        .with_fence_timeout(Duration::from_millis(20))
        .with_validation(false)
}

/// Deterministic byte pattern.
#[allow(dead_code)]
pub fn generate_test_pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}
