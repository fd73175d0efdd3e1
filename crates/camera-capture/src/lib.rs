//! Camera Acquisition Library for Scientific Cameras
//!
//! Drives a uc480-class camera through the [`Device`] capability trait:
//! - ROI and binning/subsampling negotiation against device limits
//! - Ring-buffered continuous capture with frame and transfer-miss counters
//! - Decoding of raw buffers into typed, shaped arrays
//! - Pixel format probing, timing and gain settings

pub mod acquisition;
pub mod camera;
pub mod codec;
pub mod config;
pub mod decoder;
pub mod device;
pub mod geometry;
pub mod pixel_format;
#[cfg(any(test, feature = "mock"))]
pub mod sim;

pub use acquisition::{AcquisitionController, AcquisitionState, Frame, FrameStatus};
pub use camera::{Camera, Gains};
pub use crate::config::{CameraConfig, RoiBinningMode};
pub use decoder::FrameData;
pub use device::{
    Device, DeviceError, DeviceErrorCode, DeviceInfo, FactorMask, FrameMetadata, GainChannel,
};
pub use geometry::{
    AxisFactorSet, AxisLimits, DetectorGeometry, GeometryMode, GeometryNegotiator, Roi, RoiRequest,
};
pub use pixel_format::{PixelFormat, PixelFormatRegistry};
#[cfg(any(test, feature = "mock"))]
pub use sim::SimulatedCamera;

use ring_buffer::PoolError;
use thiserror::Error;

/// Camera error types
#[derive(Error, Debug)]
pub enum CameraError {
    /// Device limits that no ROI can satisfy
    #[error("Unsupported geometry: {0}")]
    UnsupportedGeometry(String),

    #[error("Buffer {slot} allocation failed: {source}")]
    Allocation {
        slot: usize,
        #[source]
        source: DeviceError,
    },

    /// Ring slot not filled yet; the caller may poll again
    #[error("Frame {index} not ready")]
    FrameNotReady { index: u64 },

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Unknown pixel format: {0}")]
    UnknownFormat(String),

    #[error("Buffer too small: expected {expected} bytes, got {actual}")]
    BufferSize { expected: usize, actual: usize },

    #[error("Acquisition not set up")]
    NotArmed,

    #[error("Frame {index} not ready after {waited_ms}ms")]
    Timeout { index: u64, waited_ms: u64 },

    #[error("Device command failed: {0}")]
    DeviceCommand(#[from] DeviceError),

    #[error("Configuration error: {0}")]
    Config(#[from] ::config::ConfigError),
}

impl From<PoolError<DeviceError>> for CameraError {
    fn from(err: PoolError<DeviceError>) -> Self {
        match err {
            PoolError::InvalidLayout {
                buffers,
                frame_bytes,
            } => CameraError::UnsupportedGeometry(format!(
                "ring buffer of {} x {} bytes",
                buffers, frame_bytes
            )),
            PoolError::Allocation { slot, source } => CameraError::Allocation { slot, source },
            PoolError::Sequence(source) => CameraError::DeviceCommand(source),
        }
    }
}
