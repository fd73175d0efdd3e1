//! Camera configuration

use std::path::Path;

use ::config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use crate::CameraError;

/// Which subdivision `set_roi` factors go to after open
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoiBinningMode {
    /// Binning, unless the sensor only bins 1x1
    #[default]
    Auto,
    Bin,
    Subsample,
}

/// Camera configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    /// Geometry mode selected at open
    pub roi_binning_mode: RoiBinningMode,

    /// Ring buffer size used when `setup_acquisition` gets no count
    pub buffer_count: usize,

    /// Switch a monochrome sensor to the first supported of `mono_formats`
    pub auto_mono: bool,

    /// Preferred formats for monochrome sensors, best first
    pub mono_formats: Vec<String>,

    /// Exposure applied at open (milliseconds)
    pub exposure_ms: Option<f64>,

    /// Pixel rate applied at open (Hz)
    pub pixel_rate_hz: Option<f64>,

    /// Sleep between attempts in `wait_for_frame` (milliseconds)
    pub poll_interval_ms: u64,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            roi_binning_mode: RoiBinningMode::Auto,
            buffer_count: 100,
            auto_mono: true,
            mono_formats: vec!["mono16".to_string(), "mono8".to_string()],
            exposure_ms: None,
            pixel_rate_hz: None,
            poll_interval_ms: 5,
        }
    }
}

impl CameraConfig {
    /// Short ring buffer, fast polling
    pub fn low_latency() -> Self {
        Self {
            buffer_count: 10,
            poll_interval_ms: 1,
            ..Default::default()
        }
    }

    /// Deep ring buffer for long unattended runs
    pub fn high_throughput() -> Self {
        Self {
            buffer_count: 500,
            poll_interval_ms: 20,
            ..Default::default()
        }
    }

    /// Load from a TOML file, then apply `CAMERA_*` environment overrides
    pub fn load(path: impl AsRef<Path>) -> Result<Self, CameraError> {
        let settings = Config::builder()
            .add_source(File::from(path.as_ref()))
            .add_source(Environment::with_prefix("CAMERA").try_parsing(true))
            .build()?;

        Ok(settings.try_deserialize()?)
    }
}
