//! Frame core configuration.

use std::time::Duration;

/// Default size of each frame slot's staging region (32 MiB).
pub const DEFAULT_STAGING_SIZE: u64 = 32 * 1024 * 1024;

/// Default time to wait on a frame fence before logging a warning and retrying.
pub const DEFAULT_FENCE_TIMEOUT: Duration = Duration::from_secs(10);

/// Which backend [`crate::backend::create_backend`] should create.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BackendType {
    /// Vulkan when available, otherwise the dummy backend.
    #[default]
    Auto,
    /// Vulkan only; creation fails if it cannot be initialized.
    Vulkan,
    /// Simulated device, for tests and headless runs.
    Dummy,
}

/// What to do when an upload does not fit in the slot's staging region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum OverflowPolicy {
    /// Allocate a dedicated staging buffer that is released with the slot.
    #[default]
    Grow,
    /// Reject the upload with [`crate::FrameError::StagingExhausted`].
    Fail,
}

/// Parameters for creating a backend and a [`crate::FrameCore`].
///
/// # Example
///
/// ```
/// use gpu_frames::{BackendType, FrameParameters, OverflowPolicy};
///
/// let params = FrameParameters::new()
///     .with_backend(BackendType::Dummy)
///     .with_staging_size(4 * 1024 * 1024)
///     .with_overflow_policy(OverflowPolicy::Fail);
/// assert_eq!(params.staging_size, 4 * 1024 * 1024);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameParameters {
    /// Backend selection.
    pub backend: BackendType,
    /// Bytes of staging memory per frame slot.
    pub staging_size: u64,
    /// Behavior when the staging region is full.
    pub overflow_policy: OverflowPolicy,
    /// Fence wait timeout. A timed-out wait is logged and retried.
    pub fence_timeout: Duration,
    /// Whether each frame signals its completion semaphore for presentation.
    pub signal_present_semaphore: bool,
    /// Enable API validation layers when available.
    pub validation: bool,
    /// Extra instance extensions requested by the caller (e.g. surface extensions).
    pub instance_extensions: Vec<String>,
    /// Extra device extensions requested by the caller (e.g. swapchain).
    pub device_extensions: Vec<String>,
}

impl FrameParameters {
    pub fn new() -> Self {
        Self {
            backend: BackendType::default(),
            staging_size: DEFAULT_STAGING_SIZE,
            overflow_policy: OverflowPolicy::default(),
            fence_timeout: DEFAULT_FENCE_TIMEOUT,
            signal_present_semaphore: true,
            validation: cfg!(debug_assertions),
            instance_extensions: Vec::new(),
            device_extensions: Vec::new(),
        }
    }

    pub fn with_backend(mut self, backend: BackendType) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_staging_size(mut self, size: u64) -> Self {
        self.staging_size = size;
        self
    }

    pub fn with_overflow_policy(mut self, policy: OverflowPolicy) -> Self {
        self.overflow_policy = policy;
        self
    }

    pub fn with_fence_timeout(mut self, timeout: Duration) -> Self {
        self.fence_timeout = timeout;
        self
    }

    pub fn with_present_semaphore(mut self, signal: bool) -> Self {
        self.signal_present_semaphore = signal;
        self
    }

    pub fn with_validation(mut self, validation: bool) -> Self {
        self.validation = validation;
        self
    }

    pub fn with_instance_extension(mut self, name: impl Into<String>) -> Self {
        self.instance_extensions.push(name.into());
        self
    }

    pub fn with_device_extension(mut self, name: impl Into<String>) -> Self {
        self.device_extensions.push(name.into());
        self
    }
}

impl Default for FrameParameters {
    fn default() -> Self {
        Self::new()
    }
}
