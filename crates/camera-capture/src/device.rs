//! Device capability contract
//!
//! The vendor SDK sits behind [`Device`]. Everything in this crate talks to
//! hardware only through these calls, so a real binding and the simulated
//! camera are interchangeable.

use std::collections::BTreeMap;

use bitflags::bitflags;
use ring_buffer::{BufferHandle, SequenceMemory};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::geometry::{AxisLimits, GeometryMode};

/// Vendor return codes the driver reacts to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceErrorCode {
    NoSuccess,
    InvalidCameraHandle,
    OutOfMemory,
    TimedOut,
    InvalidParameter,
    CaptureRunning,
    NotSupported,
    InvalidColorFormat,
    Unknown,
}

impl From<i32> for DeviceErrorCode {
    fn from(code: i32) -> Self {
        match code {
            -1 => Self::NoSuccess,
            1 => Self::InvalidCameraHandle,
            2 => Self::OutOfMemory,
            122 => Self::TimedOut,
            125 => Self::InvalidParameter,
            140 => Self::CaptureRunning,
            155 => Self::NotSupported,
            174 => Self::InvalidColorFormat,
            _ => Self::Unknown,
        }
    }
}

impl DeviceErrorCode {
    /// Raw vendor code (`Unknown` has none)
    pub fn raw(self) -> Option<i32> {
        match self {
            Self::NoSuccess => Some(-1),
            Self::InvalidCameraHandle => Some(1),
            Self::OutOfMemory => Some(2),
            Self::TimedOut => Some(122),
            Self::InvalidParameter => Some(125),
            Self::CaptureRunning => Some(140),
            Self::NotSupported => Some(155),
            Self::InvalidColorFormat => Some(174),
            Self::Unknown => None,
        }
    }
}

/// A device command rejected by the hardware
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{command} failed: {kind:?} (code {code})")]
pub struct DeviceError {
    /// Name of the rejected command
    pub command: &'static str,
    /// Raw vendor return code
    pub code: i32,
    /// Decoded return code
    pub kind: DeviceErrorCode,
}

impl DeviceError {
    /// Build an error from a raw vendor code
    pub fn new(command: &'static str, code: i32) -> Self {
        Self {
            command,
            code,
            kind: DeviceErrorCode::from(code),
        }
    }

    /// Build an error from a known code
    pub fn with_kind(command: &'static str, kind: DeviceErrorCode) -> Self {
        Self {
            command,
            code: kind.raw().unwrap_or(i32::MIN),
            kind,
        }
    }
}

bitflags! {
    /// Binning or subsampling capability bits, one per factor and axis
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct FactorMask: u32 {
        const VERTICAL_2X = 0x0001;
        const HORIZONTAL_2X = 0x0002;
        const VERTICAL_4X = 0x0004;
        const HORIZONTAL_4X = 0x0008;
        const VERTICAL_3X = 0x0010;
        const HORIZONTAL_3X = 0x0020;
        const VERTICAL_5X = 0x0040;
        const HORIZONTAL_5X = 0x0080;
        const VERTICAL_6X = 0x0100;
        const HORIZONTAL_6X = 0x0200;
        const VERTICAL_8X = 0x0400;
        const HORIZONTAL_8X = 0x0800;
        const VERTICAL_16X = 0x1000;
        const HORIZONTAL_16X = 0x2000;
    }
}

impl FactorMask {
    /// Horizontal factors the mask layout can express, with their bits
    pub const HORIZONTAL_FACTORS: [(u32, FactorMask); 7] = [
        (2, Self::HORIZONTAL_2X),
        (3, Self::HORIZONTAL_3X),
        (4, Self::HORIZONTAL_4X),
        (5, Self::HORIZONTAL_5X),
        (6, Self::HORIZONTAL_6X),
        (8, Self::HORIZONTAL_8X),
        (16, Self::HORIZONTAL_16X),
    ];

    /// Vertical factors the mask layout can express, with their bits
    pub const VERTICAL_FACTORS: [(u32, FactorMask); 7] = [
        (2, Self::VERTICAL_2X),
        (3, Self::VERTICAL_3X),
        (4, Self::VERTICAL_4X),
        (5, Self::VERTICAL_5X),
        (6, Self::VERTICAL_6X),
        (8, Self::VERTICAL_8X),
        (16, Self::VERTICAL_16X),
    ];

    /// Mask selecting `horizontal` x `vertical`; `None` if a factor has no bit.
    ///
    /// Factor 1 is the absence of a bit.
    pub fn for_factors(horizontal: u32, vertical: u32) -> Option<Self> {
        let h = Self::axis_bit(&Self::HORIZONTAL_FACTORS, horizontal)?;
        let v = Self::axis_bit(&Self::VERTICAL_FACTORS, vertical)?;
        Some(h | v)
    }

    fn axis_bit(table: &[(u32, FactorMask)], factor: u32) -> Option<Self> {
        if factor == 1 {
            return Some(Self::empty());
        }
        table
            .iter()
            .find(|(f, _)| *f == factor)
            .map(|(_, bit)| *bit)
    }
}

/// Capture window in binned sensor units
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SensorRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Geometry applied in one device command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GeometryCommand {
    /// Which subdivision the factors apply to; the other one is reset to 1x1
    pub mode: GeometryMode,
    pub h_factor: u32,
    pub v_factor: u32,
    /// Window in units of the factors above
    pub rect: SensorRect,
}

/// Per-frame information reported for a filled buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameMetadata {
    /// Captured width (pixels)
    pub width: u32,
    /// Captured height (pixels)
    pub height: u32,
    /// Bytes between the starts of two rows
    pub pitch: usize,
    /// Hardware frame number
    pub sequence: u64,
    /// Capture timestamp (nanoseconds)
    pub timestamp_ns: u64,
}

/// Identification reported by the camera and its driver
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Sensor name
    pub model: String,
    pub manufacturer: String,
    pub serial_number: String,
    pub usb_version: String,
    /// Firmware or calibration date as reported
    pub date: String,
    /// Driver library version, `major.minor.build`
    pub dll_version: String,
    /// Vendor camera type code
    pub camera_type: u32,
}

impl DeviceInfo {
    /// Format a packed driver version (`major << 24 | minor << 16 | build`)
    pub fn format_dll_version(packed: u32) -> String {
        format!("{}.{}.{}", packed >> 24, (packed >> 16) & 0xff, packed & 0xffff)
    }
}

/// Gain channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GainChannel {
    Master,
    Red,
    Green,
    Blue,
}

impl GainChannel {
    pub const ALL: [GainChannel; 4] = [Self::Master, Self::Red, Self::Green, Self::Blue];
}

/// Everything the acquisition core needs from a camera.
///
/// Calls are synchronous and may block. Timeouts, if any, are the
/// implementation's business and come back as ordinary [`DeviceError`]s.
pub trait Device: SequenceMemory<Error = DeviceError> {
    /// Model, serial number and driver version
    fn device_info(&self) -> Result<DeviceInfo, DeviceError>;

    /// Full sensor size `(width, height)` in pixels
    fn detector_size(&self) -> Result<(u32, u32), DeviceError>;

    /// Whether the sensor is monochrome
    fn is_monochrome(&self) -> Result<bool, DeviceError>;

    /// ROI constraints `(horizontal, vertical)`
    fn roi_limits(&self) -> Result<(AxisLimits, AxisLimits), DeviceError>;

    /// Supported factors for binning or subsampling
    fn capability_mask(&self, mode: GeometryMode) -> Result<FactorMask, DeviceError>;

    /// Current `(horizontal, vertical)` factors for binning or subsampling
    fn factors(&self, mode: GeometryMode) -> Result<(u32, u32), DeviceError>;

    /// Apply factors and window together; returns the window now active
    fn apply_geometry(&mut self, command: &GeometryCommand) -> Result<SensorRect, DeviceError>;

    /// Current window in binned units
    fn roi(&self) -> Result<SensorRect, DeviceError>;

    /// Active color mode code
    fn color_mode(&self) -> Result<u32, DeviceError>;

    /// Request a color mode; hardware may substitute a different one
    fn set_color_mode(&mut self, code: u32) -> Result<(), DeviceError>;

    fn start_capture(&mut self) -> Result<(), DeviceError>;

    fn stop_capture(&mut self) -> Result<(), DeviceError>;

    /// Zero the status counters
    fn reset_capture_status(&mut self) -> Result<(), DeviceError>;

    /// Whether the hardware is capturing right now
    fn capture_active(&self) -> Result<bool, DeviceError>;

    /// Metadata of the frame in `handle`, `None` while the buffer is unfilled
    fn frame_metadata(&self, handle: &BufferHandle)
        -> Result<Option<FrameMetadata>, DeviceError>;

    /// Copy buffer contents into `dest`
    fn copy_buffer(&self, handle: &BufferHandle, dest: &mut [u8]) -> Result<(), DeviceError>;

    /// Hardware sequence counter of filled buffers
    fn acquired_sequence_count(&self) -> Result<u64, DeviceError>;

    /// Capture status counters by status code
    fn status_counters(&self) -> Result<BTreeMap<u32, u64>, DeviceError>;

    /// Exposure in milliseconds
    fn exposure_ms(&self) -> Result<f64, DeviceError>;

    /// Set exposure; returns the applied value
    fn set_exposure_ms(&mut self, exposure_ms: f64) -> Result<f64, DeviceError>;

    /// Allowed frame period range `(min, max)` in seconds
    fn frame_time_range(&self) -> Result<(f64, f64), DeviceError>;

    fn frame_rate(&self) -> Result<f64, DeviceError>;

    /// Set frame rate (fps); returns the applied value
    fn set_frame_rate(&mut self, fps: f64) -> Result<f64, DeviceError>;

    /// Available pixel clocks in MHz
    fn pixel_clocks_mhz(&self) -> Result<Vec<u32>, DeviceError>;

    fn pixel_clock_mhz(&self) -> Result<u32, DeviceError>;

    fn set_pixel_clock_mhz(&mut self, clock: u32) -> Result<(), DeviceError>;

    /// Pixel clock range `(min, max, step)` in MHz; a step of 0 means only
    /// the listed clocks are valid
    fn pixel_clock_range_mhz(&self) -> Result<(u32, u32, u32), DeviceError>;

    /// Gain in percent (100 = 1x)
    fn gain_factor(&self, channel: GainChannel) -> Result<u32, DeviceError>;

    fn max_gain_factor(&self, channel: GainChannel) -> Result<u32, DeviceError>;

    fn set_gain_factor(&mut self, channel: GainChannel, factor: u32) -> Result<(), DeviceError>;

    /// Whether the sensor has an analog gain boost stage
    fn gain_boost_supported(&self) -> Result<bool, DeviceError>;

    fn gain_boost(&self) -> Result<bool, DeviceError>;

    /// Only valid when [`Device::gain_boost_supported`] is true
    fn set_gain_boost(&mut self, enabled: bool) -> Result<(), DeviceError>;
}
