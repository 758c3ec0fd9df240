//! Error types for the frame core.
//!
//! Two classes of failure exist. [`InitError`] covers one-time device setup
//! (loader, device selection, feature negotiation) and is fatal to startup.
//! [`FrameError`] is returned from per-frame calls; a [`FrameError::GpuCall`]
//! carries the API result code and the source location of the failing call and
//! should be treated as unrecoverable by the application.

use std::panic::Location;

use thiserror::Error;

use crate::backend::ObjectKind;

/// Failures during instance/device creation and feature negotiation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InitError {
    #[error("failed to load the GPU API loader: {0}")]
    LoaderUnavailable(String),
    #[error("no suitable GPU found")]
    NoSuitableDevice,
    #[error("no queue family supports both graphics and compute")]
    NoGraphicsQueue,
    #[error("required device feature not supported: {0}")]
    MissingFeature(&'static str),
    #[error("required extension not supported: {0}")]
    MissingExtension(String),
    #[error("backend not compiled into this build: {0}")]
    BackendUnavailable(&'static str),
}

/// Errors returned by the frame core and its backends.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("initialization failed: {0}")]
    Init(#[from] InitError),
    #[error("{call} failed with result {code} at {location}")]
    GpuCall {
        call: &'static str,
        code: i32,
        location: &'static Location<'static>,
    },
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("staging memory exhausted: requested {requested} bytes, {available} available")]
    StagingExhausted { requested: u64, available: u64 },
    #[error("unknown {kind} handle {raw:#x}")]
    UnknownHandle { kind: ObjectKind, raw: u64 },
    #[error("no frame is being recorded")]
    NotRecording,
    #[error("GPU device lost")]
    DeviceLost,
}

impl FrameError {
    /// Build a [`FrameError::GpuCall`] for the caller's location and log it.
    #[track_caller]
    pub fn gpu_call(call: &'static str, code: i32) -> Self {
        let location = Location::caller();
        log::error!("GPU call {} failed with result {} at {}", call, code, location);
        Self::GpuCall {
            call,
            code,
            location,
        }
    }

    /// Whether the device state can no longer be trusted after this error.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Init(_) | Self::GpuCall { .. } | Self::DeviceLost
        )
    }
}
