//! Camera session
//!
//! [`Camera`] owns one device for the lifetime of a session. Geometry and
//! pixel format are queried once at open; the acquisition controller owns
//! the ring buffer between setup and teardown.

use std::ops::Range;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::acquisition::{AcquisitionController, AcquisitionState, Frame, FrameStatus};
use crate::config::{CameraConfig, RoiBinningMode};
use crate::device::{Device, DeviceError, DeviceErrorCode, DeviceInfo, GainChannel, GeometryCommand};
use crate::geometry::{
    AxisFactorSet, DetectorGeometry, GeometryMode, GeometryNegotiator, Roi, RoiRequest,
};
use crate::pixel_format::{PixelFormat, PixelFormatRegistry};
use crate::CameraError;

/// Shortest exposure sent to the device; zero would select its default
const MIN_EXPOSURE_S: f64 = 1e-6;

/// Analog gains as factors (1.0 = unity)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Gains {
    pub master: f64,
    pub red: f64,
    pub green: f64,
    pub blue: f64,
}

impl Gains {
    fn from_percent(values: [u32; 4]) -> Self {
        let [master, red, green, blue] = values.map(|v| f64::from(v) / 100.0);
        Self {
            master,
            red,
            green,
            blue,
        }
    }
}

/// One open camera
#[derive(Debug)]
pub struct Camera<D: Device> {
    device: D,
    config: CameraConfig,
    geometry: DetectorGeometry,
    binning_modes: AxisFactorSet,
    subsampling_modes: AxisFactorSet,
    mode: GeometryMode,
    formats: PixelFormatRegistry,
    acquisition: AcquisitionController,
}

impl<D: Device> Camera<D> {
    /// Query the device and apply the startup settings from `config`
    pub fn open(mut device: D, config: CameraConfig) -> Result<Self, CameraError> {
        let (max_width, max_height) = device.detector_size()?;
        let (horizontal, vertical) = device.roi_limits()?;
        let geometry = DetectorGeometry {
            max_width,
            max_height,
            horizontal,
            vertical,
        };

        let binning_modes = AxisFactorSet::from_mask(device.capability_mask(GeometryMode::Binning)?);
        let subsampling_modes =
            AxisFactorSet::from_mask(device.capability_mask(GeometryMode::Subsampling)?);
        let formats = PixelFormatRegistry::probe(&mut device)?;

        let mode = match config.roi_binning_mode {
            RoiBinningMode::Bin => GeometryMode::Binning,
            RoiBinningMode::Subsample => GeometryMode::Subsampling,
            RoiBinningMode::Auto if binning_modes.is_trivial() => GeometryMode::Subsampling,
            RoiBinningMode::Auto => GeometryMode::Binning,
        };

        let mut camera = Self {
            device,
            config,
            geometry,
            binning_modes,
            subsampling_modes,
            mode,
            formats,
            acquisition: AcquisitionController::new(),
        };

        if camera.config.auto_mono && camera.device.is_monochrome()? {
            camera.select_mono_format()?;
        }
        if let Some(exposure_ms) = camera.config.exposure_ms {
            camera.set_exposure(exposure_ms * 1e-3)?;
        }
        if let Some(rate) = camera.config.pixel_rate_hz {
            camera.set_pixel_rate(Some(rate))?;
        }

        info!(
            "Opened camera: {}x{}, {:?} mode, color mode {}",
            max_width,
            max_height,
            mode,
            camera.color_mode()?
        );
        Ok(camera)
    }

    fn select_mono_format(&mut self) -> Result<(), CameraError> {
        let preferred = self
            .config
            .mono_formats
            .iter()
            .find(|name| self.formats.is_supported(name))
            .cloned();

        match preferred {
            Some(name) => {
                self.set_color_mode(&name)?;
            }
            None => warn!(
                "Monochrome sensor supports none of {:?}",
                self.config.mono_formats
            ),
        }
        Ok(())
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    /// Direct device access. Do not touch the capture sequence while armed.
    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    pub fn config(&self) -> &CameraConfig {
        &self.config
    }

    pub fn geometry(&self) -> &DetectorGeometry {
        &self.geometry
    }

    // Geometry

    /// Full sensor size `(width, height)`
    pub fn detector_size(&self) -> (u32, u32) {
        (self.geometry.max_width, self.geometry.max_height)
    }

    /// `(horizontal, vertical)` binning factors the sensor supports
    pub fn supported_binning_modes(&self) -> (Vec<u32>, Vec<u32>) {
        (
            self.binning_modes.horizontal().to_vec(),
            self.binning_modes.vertical().to_vec(),
        )
    }

    /// `(horizontal, vertical)` subsampling factors the sensor supports
    pub fn supported_subsampling_modes(&self) -> (Vec<u32>, Vec<u32>) {
        (
            self.subsampling_modes.horizontal().to_vec(),
            self.subsampling_modes.vertical().to_vec(),
        )
    }

    /// Which subdivision ROI factors currently go to
    pub fn geometry_mode(&self) -> GeometryMode {
        self.mode
    }

    fn factor_set(&self, mode: GeometryMode) -> &AxisFactorSet {
        match mode {
            GeometryMode::Binning => &self.binning_modes,
            GeometryMode::Subsampling => &self.subsampling_modes,
        }
    }

    pub fn binning(&self) -> Result<(u32, u32), CameraError> {
        Ok(self.device.factors(GeometryMode::Binning)?)
    }

    /// Switch to binning, rounding factors down to supported ones.
    ///
    /// Subsampling goes back to 1x1. The current window is kept as far as
    /// the new factors allow.
    pub fn set_binning(&mut self, h_factor: u32, v_factor: u32) -> Result<(u32, u32), CameraError> {
        self.set_factors(GeometryMode::Binning, h_factor, v_factor)
    }

    pub fn subsampling(&self) -> Result<(u32, u32), CameraError> {
        Ok(self.device.factors(GeometryMode::Subsampling)?)
    }

    /// Switch to subsampling; binning goes back to 1x1
    pub fn set_subsampling(
        &mut self,
        h_factor: u32,
        v_factor: u32,
    ) -> Result<(u32, u32), CameraError> {
        self.set_factors(GeometryMode::Subsampling, h_factor, v_factor)
    }

    fn set_factors(
        &mut self,
        mode: GeometryMode,
        h_factor: u32,
        v_factor: u32,
    ) -> Result<(u32, u32), CameraError> {
        let request = RoiRequest::from(self.roi()?).with_factors(h_factor, v_factor);
        let roi = self.apply_roi(mode, &request)?;
        Ok((roi.h_factor, roi.v_factor))
    }

    /// Current ROI in unbinned pixels with the active factors
    pub fn roi(&self) -> Result<Roi, CameraError> {
        let (h_factor, v_factor) = self.device.factors(self.mode)?;
        let rect = self.device.roi()?;
        Ok(Roi::from_sensor_rect(rect, h_factor, v_factor))
    }

    /// Negotiate and apply an ROI; returns what the device accepted
    pub fn set_roi(&mut self, request: &RoiRequest) -> Result<Roi, CameraError> {
        self.apply_roi(self.mode, request)
    }

    fn apply_roi(&mut self, mode: GeometryMode, request: &RoiRequest) -> Result<Roi, CameraError> {
        let roi = GeometryNegotiator::new(&self.geometry, self.factor_set(mode)).negotiate(request)?;
        let command = GeometryCommand {
            mode,
            h_factor: roi.h_factor,
            v_factor: roi.v_factor,
            rect: roi.to_sensor_rect(),
        };
        debug!("Applying {:?} geometry {:?}", mode, command);

        self.reconfigure(|camera| {
            let applied = camera.device.apply_geometry(&command)?;
            camera.mode = mode;
            Ok(Roi::from_sensor_rect(applied, command.h_factor, command.v_factor))
        })
    }

    /// `(min_roi, max_roi)` for the active factor set
    pub fn roi_limits(&self) -> (Roi, Roi) {
        GeometryNegotiator::new(&self.geometry, self.factor_set(self.mode)).limits()
    }

    /// Output frame `(rows, columns)`
    pub fn data_dimensions(&self) -> Result<(u32, u32), CameraError> {
        let roi = self.roi()?;
        Ok((roi.binned_height(), roi.binned_width()))
    }

    // Pixel format

    /// Color modes that passed probing at open
    pub fn all_color_modes(&self) -> Vec<&'static str> {
        self.formats.supported_names()
    }

    /// Active pixel format
    pub fn pixel_format(&self) -> Result<&'static PixelFormat, CameraError> {
        let code = self.device.color_mode()?;
        PixelFormatRegistry::by_code(code)
            .ok_or_else(|| CameraError::UnknownFormat(format!("color mode code {:#x}", code)))
    }

    pub fn color_mode(&self) -> Result<&'static str, CameraError> {
        Ok(self.pixel_format()?.name)
    }

    /// Select a color mode by name; returns the mode now active
    pub fn set_color_mode(&mut self, name: &str) -> Result<&'static str, CameraError> {
        let format = PixelFormatRegistry::by_name(name)
            .ok_or_else(|| CameraError::UnknownFormat(name.to_string()))?;
        if !self.formats.is_supported(name) {
            return Err(CameraError::UnsupportedFormat(format!(
                "{} not supported by this sensor",
                name
            )));
        }

        self.reconfigure(|camera| Ok(camera.device.set_color_mode(format.code)?))?;
        self.color_mode()
    }

    /// Bytes of one frame at the current ROI and pixel format
    pub fn frame_bytes(&self) -> Result<usize, CameraError> {
        let (rows, columns) = self.data_dimensions()?;
        self.pixel_format()?.frame_bytes(columns, rows)
    }

    /// Run a geometry or format change with capture paused.
    ///
    /// An armed ring is reallocated with the same length when the frame size
    /// changed, and a running capture is restarted. If that fails, the
    /// capture stays stopped and the failure is returned.
    fn reconfigure<T>(
        &mut self,
        apply: impl FnOnce(&mut Self) -> Result<T, CameraError>,
    ) -> Result<T, CameraError> {
        let was_running = self.acquisition.in_progress();
        self.acquisition.stop(&mut self.device)?;

        let result = apply(self);

        match (result, self.resume_acquisition(was_running)) {
            (result, Ok(())) => result,
            (Ok(_), Err(err)) => {
                warn!("Settings applied but acquisition could not resume: {}", err);
                Err(err)
            }
            (Err(err), Err(resume_err)) => {
                warn!("Acquisition could not resume after a failed change: {}", resume_err);
                Err(err)
            }
        }
    }

    fn resume_acquisition(&mut self, was_running: bool) -> Result<(), CameraError> {
        if !self.acquisition.state().is_armed() {
            return Ok(());
        }

        let frame_bytes = self.frame_bytes()?;
        if frame_bytes != self.acquisition.frame_bytes() {
            let count = self.acquisition.requested_frames();
            info!("Frame size changed to {} bytes, reallocating ring", frame_bytes);
            self.acquisition.setup(&mut self.device, count, frame_bytes)?;
        }
        if was_running {
            self.acquisition.start(&mut self.device)?;
        }
        Ok(())
    }

    // Acquisition

    /// Allocate the ring buffer; `None` uses the configured length
    pub fn setup_acquisition(&mut self, buffer_count: Option<usize>) -> Result<(), CameraError> {
        let count = buffer_count.unwrap_or(self.config.buffer_count);
        let frame_bytes = self.frame_bytes()?;
        self.acquisition.setup(&mut self.device, count, frame_bytes)
    }

    /// Stop and release the ring buffer
    pub fn clear_acquisition(&mut self) -> Result<(), CameraError> {
        self.acquisition.teardown(&mut self.device)
    }

    /// Start capturing, setting up the default ring first if needed
    pub fn start_acquisition(&mut self) -> Result<(), CameraError> {
        if !self.acquisition.state().is_armed() {
            debug!("Start without setup, arming default ring");
            self.setup_acquisition(None)?;
        }
        self.acquisition.start(&mut self.device)
    }

    pub fn stop_acquisition(&mut self) -> Result<(), CameraError> {
        self.acquisition.stop(&mut self.device)
    }

    pub fn acquisition_state(&self) -> AcquisitionState {
        self.acquisition.state()
    }

    /// `(controller flag, device flag)`; a mismatch means the device stopped
    pub fn acquisition_in_progress(&self) -> Result<(bool, bool), CameraError> {
        self.acquisition.poll_status(&self.device)
    }

    pub fn acquired_frame_status(&mut self) -> Result<FrameStatus, CameraError> {
        self.acquisition.frame_status(&self.device)
    }

    /// Decode frame `index`; fails with `FrameNotReady` if not captured yet
    pub fn read_frame(&self, index: u64) -> Result<Frame, CameraError> {
        let format = self.pixel_format()?;
        self.acquisition.read_frame(&self.device, index, format)
    }

    /// Decode every frame in `range`, stopping at the first failure
    pub fn read_frames(&self, range: Range<u64>) -> Result<Vec<Frame>, CameraError> {
        let format = self.pixel_format()?;
        range
            .map(|index| self.acquisition.read_frame(&self.device, index, format))
            .collect()
    }

    /// Most recently acquired frame, if any
    pub fn read_newest_frame(&mut self) -> Result<Option<Frame>, CameraError> {
        match self.acquired_frame_status()?.acquired {
            0 => Ok(None),
            acquired => self.read_frame(acquired - 1).map(Some),
        }
    }

    /// Poll `read_frame` until the frame is filled or `timeout` elapses
    pub fn wait_for_frame(&self, index: u64, timeout: Duration) -> Result<Frame, CameraError> {
        let started = Instant::now();
        let interval = Duration::from_millis(self.config.poll_interval_ms);

        loop {
            match self.read_frame(index) {
                Err(CameraError::FrameNotReady { .. }) => {
                    let waited = started.elapsed();
                    if waited >= timeout {
                        return Err(CameraError::Timeout {
                            index,
                            waited_ms: waited.as_millis() as u64,
                        });
                    }
                    thread::sleep(interval.min(timeout - waited));
                }
                result => return result,
            }
        }
    }

    // Timing

    /// Exposure (seconds)
    pub fn exposure(&self) -> Result<f64, CameraError> {
        Ok(self.device.exposure_ms()? * 1e-3)
    }

    /// Set exposure (seconds); returns the applied value
    pub fn set_exposure(&mut self, seconds: f64) -> Result<f64, CameraError> {
        let applied = self.device.set_exposure_ms(seconds.max(MIN_EXPOSURE_S) * 1e3)?;
        Ok(applied * 1e-3)
    }

    /// Time between frames (seconds)
    pub fn frame_period(&self) -> Result<f64, CameraError> {
        Ok(1.0 / self.device.frame_rate()?)
    }

    /// Set the frame period, clamped to the device range; returns the applied value
    pub fn set_frame_period(&mut self, seconds: f64) -> Result<f64, CameraError> {
        let (shortest, longest) = self.device.frame_time_range()?;
        let period = seconds.max(shortest).min(longest);
        self.device.set_frame_rate(1.0 / period)?;
        self.frame_period()
    }

    /// `(exposure, frame period)` in seconds
    pub fn frame_timings(&self) -> Result<(f64, f64), CameraError> {
        Ok((self.exposure()?, self.frame_period()?))
    }

    /// Pixel rate (Hz)
    pub fn pixel_rate(&self) -> Result<f64, CameraError> {
        Ok(f64::from(self.device.pixel_clock_mhz()?) * 1e6)
    }

    /// Available pixel rates (Hz), ascending
    pub fn available_pixel_rates(&self) -> Result<Vec<f64>, CameraError> {
        let mut clocks = self.device.pixel_clocks_mhz()?;
        clocks.sort_unstable();
        Ok(clocks.into_iter().map(|mhz| f64::from(mhz) * 1e6).collect())
    }

    /// Pixel rate range `(min, max, step)` in Hz; a step of 0 means only
    /// [`Camera::available_pixel_rates`] are valid
    pub fn pixel_rates_range(&self) -> Result<(f64, f64, f64), CameraError> {
        let (min, max, step) = self.device.pixel_clock_range_mhz()?;
        Ok((f64::from(min) * 1e6, f64::from(max) * 1e6, f64::from(step) * 1e6))
    }

    /// Set the closest available pixel rate; `None` picks the fastest
    pub fn set_pixel_rate(&mut self, rate: Option<f64>) -> Result<f64, CameraError> {
        let rates = self.available_pixel_rates()?;
        let chosen = match rate {
            None => rates.last().copied(),
            Some(target) => rates
                .iter()
                .copied()
                .min_by(|a, b| (a - target).abs().total_cmp(&(b - target).abs())),
        }
        .ok_or_else(|| DeviceError::with_kind("is_PixelClock", DeviceErrorCode::NotSupported))?;

        self.device.set_pixel_clock_mhz((chosen / 1e6).round() as u32)?;
        self.pixel_rate()
    }

    // Gains

    pub fn gains(&self) -> Result<Gains, CameraError> {
        let mut values = [0u32; 4];
        for (value, channel) in values.iter_mut().zip(GainChannel::ALL) {
            *value = self.device.gain_factor(channel)?;
        }
        Ok(Gains::from_percent(values))
    }

    pub fn max_gains(&self) -> Result<Gains, CameraError> {
        let mut values = [0u32; 4];
        for (value, channel) in values.iter_mut().zip(GainChannel::ALL) {
            *value = self.device.max_gain_factor(channel)?;
        }
        Ok(Gains::from_percent(values))
    }

    /// Set gain factors, each clamped to `[1, max]`; `None` leaves a channel alone
    pub fn set_gains(
        &mut self,
        master: Option<f64>,
        red: Option<f64>,
        green: Option<f64>,
        blue: Option<f64>,
    ) -> Result<Gains, CameraError> {
        for (channel, gain) in GainChannel::ALL.into_iter().zip([master, red, green, blue]) {
            if let Some(gain) = gain {
                let max = self.device.max_gain_factor(channel)?;
                let percent = ((gain * 100.0).round() as u32).clamp(100, max.max(100));
                self.device.set_gain_factor(channel, percent)?;
            }
        }
        self.gains()
    }

    /// Whether gain boost is on; always false on sensors without it
    pub fn gain_boost(&self) -> Result<bool, CameraError> {
        Ok(self.device.gain_boost_supported()? && self.device.gain_boost()?)
    }

    /// Enable or disable gain boost; ignored on sensors without it
    pub fn set_gain_boost(&mut self, enabled: bool) -> Result<bool, CameraError> {
        if self.device.gain_boost_supported()? {
            self.device.set_gain_boost(enabled)?;
        } else {
            debug!("Gain boost not supported, ignoring request");
        }
        self.gain_boost()
    }

    // Identification

    pub fn device_info(&self) -> Result<DeviceInfo, CameraError> {
        Ok(self.device.device_info()?)
    }
}

impl<D: Device> Drop for Camera<D> {
    fn drop(&mut self) {
        if let Err(err) = self.acquisition.teardown(&mut self.device) {
            warn!("Failed to release acquisition on close: {}", err);
        }
    }
}
