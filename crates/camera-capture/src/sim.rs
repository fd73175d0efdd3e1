//! In-memory camera for tests and offline development
//!
//! Behaves like a uc480 sensor where it matters to the acquisition core:
//! unsupported color modes are silently substituted, buffers come out of a
//! finite memory budget, and the ring is filled only when the test says so.

use std::collections::{BTreeMap, HashMap};

use ring_buffer::{BufferHandle, SequenceMemory};
use tracing::debug;

use crate::device::{
    Device, DeviceError, DeviceErrorCode, DeviceInfo, FactorMask, FrameMetadata, GainChannel,
    GeometryCommand, SensorRect,
};
use crate::geometry::{AxisLimits, GeometryMode};
use crate::pixel_format::PixelFormatRegistry;

const CODE_JPEG: u32 = 32;
const FORMAT_PLANAR: u32 = 0x2000;

#[derive(Debug)]
struct SimBuffer {
    data: Vec<u8>,
    filled: Option<FrameMetadata>,
}

/// Simulated camera implementing [`Device`]
#[derive(Debug)]
pub struct SimulatedCamera {
    info: DeviceInfo,
    width: u32,
    height: u32,
    monochrome: bool,
    limits: (AxisLimits, AxisLimits),
    binning_mask: FactorMask,
    subsampling_mask: FactorMask,
    binning: (u32, u32),
    subsampling: (u32, u32),
    rect: SensorRect,
    row_padding: usize,

    supported_codes: Vec<u32>,
    color_mode: u32,

    memory_budget: usize,
    memory_used: usize,
    next_id: u32,
    buffers: HashMap<u32, SimBuffer>,
    sequence: Vec<u32>,
    next_slot: usize,

    capturing: bool,
    sequence_count: u64,
    status: BTreeMap<u32, u64>,

    exposure_ms: f64,
    frame_rate: f64,
    frame_time_range: (f64, f64),
    pixel_clocks: Vec<u32>,
    pixel_clock: u32,
    gains: [u32; 4],
    max_gains: [u32; 4],
    gain_boost_supported: bool,
    gain_boost: bool,
}

impl Default for SimulatedCamera {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedCamera {
    /// 1280x1024 monochrome sensor with 2x/4x binning and subsampling
    pub fn new() -> Self {
        let factors = FactorMask::HORIZONTAL_2X
            | FactorMask::HORIZONTAL_4X
            | FactorMask::VERTICAL_2X
            | FactorMask::VERTICAL_4X;
        let mono8 = 6;

        Self {
            info: DeviceInfo {
                model: "SIM1280M".to_string(),
                manufacturer: "Simulated".to_string(),
                serial_number: "4102000000".to_string(),
                usb_version: "V2.0".to_string(),
                date: "01.01.2024".to_string(),
                dll_version: DeviceInfo::format_dll_version(0x0412_0000),
                camera_type: 0x40,
            },
            width: 1280,
            height: 1024,
            monochrome: true,
            limits: (AxisLimits::new(16, 4, 2), AxisLimits::new(16, 4, 2)),
            binning_mask: factors,
            subsampling_mask: factors,
            binning: (1, 1),
            subsampling: (1, 1),
            rect: SensorRect {
                x: 0,
                y: 0,
                width: 1280,
                height: 1024,
            },
            row_padding: 0,
            // mono8, mono16, raw8, bgr8p, rgb8p, bgra8p, rgba8p
            supported_codes: vec![mono8, 28, 11, 1, 0x81, 0, 0x80],
            color_mode: mono8,
            memory_budget: 512 * 1024 * 1024,
            memory_used: 0,
            next_id: 1,
            buffers: HashMap::new(),
            sequence: Vec::new(),
            next_slot: 0,
            capturing: false,
            sequence_count: 0,
            status: BTreeMap::new(),
            exposure_ms: 10.0,
            frame_rate: 25.0,
            frame_time_range: (0.001, 10.0),
            pixel_clocks: vec![5, 10, 20, 30, 43],
            pixel_clock: 30,
            gains: [100; 4],
            max_gains: [400, 200, 200, 200],
            gain_boost_supported: true,
            gain_boost: false,
        }
    }

    /// Sensor size; resets the window to the full frame
    pub fn with_detector(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self.rect = SensorRect {
            x: 0,
            y: 0,
            width,
            height,
        };
        self
    }

    pub fn with_limits(mut self, horizontal: AxisLimits, vertical: AxisLimits) -> Self {
        self.limits = (horizontal, vertical);
        self
    }

    pub fn with_binning_mask(mut self, mask: FactorMask) -> Self {
        self.binning_mask = mask;
        self
    }

    pub fn with_subsampling_mask(mut self, mask: FactorMask) -> Self {
        self.subsampling_mask = mask;
        self
    }

    /// Color sensor
    pub fn with_color(mut self) -> Self {
        self.monochrome = false;
        self
    }

    /// Accepted color codes; the first one is the power-on default
    pub fn with_supported_codes(mut self, codes: Vec<u32>) -> Self {
        if let Some(first) = codes.first() {
            self.color_mode = *first;
        }
        self.supported_codes = codes;
        self
    }

    /// Total device memory for frame buffers (bytes)
    pub fn with_memory_budget(mut self, bytes: usize) -> Self {
        self.memory_budget = bytes;
        self
    }

    pub fn with_device_info(mut self, info: DeviceInfo) -> Self {
        self.info = info;
        self
    }

    /// Sensor without a gain boost stage
    pub fn without_gain_boost(mut self) -> Self {
        self.gain_boost_supported = false;
        self.gain_boost = false;
        self
    }

    /// Extra bytes at the end of each delivered row
    pub fn with_row_padding(mut self, bytes: usize) -> Self {
        self.row_padding = bytes;
        self
    }

    /// Number of allocated buffers
    pub fn live_buffers(&self) -> usize {
        self.buffers.len()
    }

    /// Device memory held by frame buffers (bytes)
    pub fn memory_used(&self) -> usize {
        self.memory_used
    }

    /// Number of buffers in the capture sequence
    pub fn sequence_len(&self) -> usize {
        self.sequence.len()
    }

    /// Fill the next `count` ring slots, as if the sensor had captured them.
    ///
    /// Element `i` of frame `n` holds `n + i`, truncated to the element
    /// width. Returns how many frames were delivered (0 when not capturing).
    /// A frame too large for its slot counts as a transfer miss instead.
    pub fn deliver_frames(&mut self, count: usize) -> usize {
        if !self.capturing || self.sequence.is_empty() {
            return 0;
        }

        let format = PixelFormatRegistry::by_code(self.color_mode);
        let bytes_per_pixel = format
            .and_then(|f| f.bytes_per_pixel().ok())
            .unwrap_or(1);
        let element_bytes = format.and_then(|f| f.element_bytes().ok()).unwrap_or(1);

        let (width, height) = (self.rect.width, self.rect.height);
        let row_bytes = width as usize * bytes_per_pixel;
        let pitch = row_bytes + self.row_padding;
        let frame_period_ns = (1e9 / self.frame_rate) as u64;

        let mut delivered = 0;
        for _ in 0..count {
            let id = self.sequence[self.next_slot % self.sequence.len()];
            self.next_slot += 1;

            let Some(buffer) = self.buffers.get_mut(&id) else {
                continue;
            };
            if buffer.data.len() < pitch * height as usize {
                *self.status.entry(0xa2).or_insert(0) += 1;
                continue;
            }

            let sequence = self.sequence_count;
            for row in 0..height as usize {
                let line = &mut buffer.data[row * pitch..row * pitch + row_bytes];
                for (i, element) in line.chunks_exact_mut(element_bytes).enumerate() {
                    let value = sequence + (row * row_bytes / element_bytes + i) as u64;
                    element.copy_from_slice(&value.to_le_bytes()[..element_bytes]);
                }
            }
            buffer.filled = Some(FrameMetadata {
                width,
                height,
                pitch,
                sequence,
                timestamp_ns: sequence * frame_period_ns,
            });

            self.sequence_count += 1;
            delivered += 1;
        }

        debug!("Delivered {} simulated frames", delivered);
        delivered
    }

    /// Stop capturing without going through `stop_capture`
    pub fn halt_capture(&mut self) {
        self.capturing = false;
    }

    /// Set one capture status bucket
    pub fn set_status_counter(&mut self, code: u32, count: u64) {
        self.status.insert(code, count);
    }

    fn error(command: &'static str, kind: DeviceErrorCode) -> DeviceError {
        DeviceError::with_kind(command, kind)
    }

    fn mask(&self, mode: GeometryMode) -> FactorMask {
        match mode {
            GeometryMode::Binning => self.binning_mask,
            GeometryMode::Subsampling => self.subsampling_mask,
        }
    }

    fn axis_fits(start: u32, size: u32, extent: u32, limits: &AxisLimits) -> bool {
        size >= limits.min_size
            && limits.position_step > 0
            && limits.size_step > 0
            && start % limits.position_step == 0
            && size % limits.size_step == 0
            && start + size <= extent
    }

    fn gain_index(channel: GainChannel) -> usize {
        match channel {
            GainChannel::Master => 0,
            GainChannel::Red => 1,
            GainChannel::Green => 2,
            GainChannel::Blue => 3,
        }
    }
}

impl SequenceMemory for SimulatedCamera {
    type Error = DeviceError;

    fn allocate_buffer(&mut self, len: usize) -> Result<BufferHandle, DeviceError> {
        if self.memory_used + len > self.memory_budget {
            return Err(Self::error("is_AllocImageMem", DeviceErrorCode::OutOfMemory));
        }
        let id = self.next_id;
        self.next_id += 1;
        self.memory_used += len;
        self.buffers.insert(
            id,
            SimBuffer {
                data: vec![0; len],
                filled: None,
            },
        );
        Ok(BufferHandle::new(id, len))
    }

    fn free_buffer(&mut self, handle: BufferHandle) -> Result<(), DeviceError> {
        let buffer = self
            .buffers
            .remove(&handle.id())
            .ok_or_else(|| Self::error("is_FreeImageMem", DeviceErrorCode::InvalidParameter))?;
        self.memory_used -= buffer.data.len();
        Ok(())
    }

    fn add_to_sequence(&mut self, handle: &BufferHandle) -> Result<(), DeviceError> {
        if !self.buffers.contains_key(&handle.id()) {
            return Err(Self::error("is_AddToSequence", DeviceErrorCode::InvalidParameter));
        }
        self.sequence.push(handle.id());
        Ok(())
    }

    fn clear_sequence(&mut self) -> Result<(), DeviceError> {
        self.sequence.clear();
        self.next_slot = 0;
        Ok(())
    }
}

impl Device for SimulatedCamera {
    fn device_info(&self) -> Result<DeviceInfo, DeviceError> {
        Ok(self.info.clone())
    }

    fn detector_size(&self) -> Result<(u32, u32), DeviceError> {
        Ok((self.width, self.height))
    }

    fn is_monochrome(&self) -> Result<bool, DeviceError> {
        Ok(self.monochrome)
    }

    fn roi_limits(&self) -> Result<(AxisLimits, AxisLimits), DeviceError> {
        Ok(self.limits)
    }

    fn capability_mask(&self, mode: GeometryMode) -> Result<FactorMask, DeviceError> {
        Ok(self.mask(mode))
    }

    fn factors(&self, mode: GeometryMode) -> Result<(u32, u32), DeviceError> {
        Ok(match mode {
            GeometryMode::Binning => self.binning,
            GeometryMode::Subsampling => self.subsampling,
        })
    }

    fn apply_geometry(&mut self, command: &GeometryCommand) -> Result<SensorRect, DeviceError> {
        let invalid = || Self::error("is_AOI", DeviceErrorCode::InvalidParameter);

        let bits = FactorMask::for_factors(command.h_factor, command.v_factor).ok_or_else(invalid)?;
        if !self.mask(command.mode).contains(bits) {
            return Err(invalid());
        }

        let rect = command.rect;
        let (horizontal, vertical) = self.limits;
        if !Self::axis_fits(rect.x, rect.width, self.width / command.h_factor, &horizontal)
            || !Self::axis_fits(rect.y, rect.height, self.height / command.v_factor, &vertical)
        {
            return Err(invalid());
        }

        let factors = (command.h_factor, command.v_factor);
        match command.mode {
            GeometryMode::Binning => {
                self.binning = factors;
                self.subsampling = (1, 1);
            }
            GeometryMode::Subsampling => {
                self.subsampling = factors;
                self.binning = (1, 1);
            }
        }
        self.rect = rect;
        Ok(rect)
    }

    fn roi(&self) -> Result<SensorRect, DeviceError> {
        Ok(self.rect)
    }

    fn color_mode(&self) -> Result<u32, DeviceError> {
        Ok(self.color_mode)
    }

    fn set_color_mode(&mut self, code: u32) -> Result<(), DeviceError> {
        if code == CODE_JPEG || code & FORMAT_PLANAR != 0 {
            return Err(Self::error("is_SetColorMode", DeviceErrorCode::InvalidColorFormat));
        }
        if self.supported_codes.contains(&code) {
            self.color_mode = code;
        } else if let Some(fallback) = self.supported_codes.first() {
            self.color_mode = *fallback;
        }
        Ok(())
    }

    fn start_capture(&mut self) -> Result<(), DeviceError> {
        if self.sequence.is_empty() {
            return Err(Self::error("is_CaptureVideo", DeviceErrorCode::NoSuccess));
        }
        for id in &self.sequence {
            if let Some(buffer) = self.buffers.get_mut(id) {
                buffer.filled = None;
            }
        }
        self.next_slot = 0;
        self.capturing = true;
        Ok(())
    }

    fn stop_capture(&mut self) -> Result<(), DeviceError> {
        self.capturing = false;
        Ok(())
    }

    fn reset_capture_status(&mut self) -> Result<(), DeviceError> {
        self.status.clear();
        Ok(())
    }

    fn capture_active(&self) -> Result<bool, DeviceError> {
        Ok(self.capturing)
    }

    fn frame_metadata(&self, handle: &BufferHandle) -> Result<Option<FrameMetadata>, DeviceError> {
        self.buffers
            .get(&handle.id())
            .map(|buffer| buffer.filled)
            .ok_or_else(|| Self::error("is_GetImageInfo", DeviceErrorCode::InvalidParameter))
    }

    fn copy_buffer(&self, handle: &BufferHandle, dest: &mut [u8]) -> Result<(), DeviceError> {
        let buffer = self
            .buffers
            .get(&handle.id())
            .ok_or_else(|| Self::error("is_CopyImageMem", DeviceErrorCode::InvalidParameter))?;
        let target = dest
            .get_mut(..buffer.data.len())
            .ok_or_else(|| Self::error("is_CopyImageMem", DeviceErrorCode::InvalidParameter))?;
        target.copy_from_slice(&buffer.data);
        Ok(())
    }

    fn acquired_sequence_count(&self) -> Result<u64, DeviceError> {
        Ok(self.sequence_count)
    }

    fn status_counters(&self) -> Result<BTreeMap<u32, u64>, DeviceError> {
        Ok(self.status.clone())
    }

    fn exposure_ms(&self) -> Result<f64, DeviceError> {
        Ok(self.exposure_ms)
    }

    fn set_exposure_ms(&mut self, exposure_ms: f64) -> Result<f64, DeviceError> {
        let longest = 1e3 / self.frame_rate;
        self.exposure_ms = exposure_ms.min(longest).max(0.001);
        Ok(self.exposure_ms)
    }

    fn frame_time_range(&self) -> Result<(f64, f64), DeviceError> {
        Ok(self.frame_time_range)
    }

    fn frame_rate(&self) -> Result<f64, DeviceError> {
        Ok(self.frame_rate)
    }

    fn set_frame_rate(&mut self, fps: f64) -> Result<f64, DeviceError> {
        if !(fps.is_finite() && fps > 0.0) {
            return Err(Self::error("is_SetFrameRate", DeviceErrorCode::InvalidParameter));
        }
        self.frame_rate = fps;
        Ok(fps)
    }

    fn pixel_clocks_mhz(&self) -> Result<Vec<u32>, DeviceError> {
        Ok(self.pixel_clocks.clone())
    }

    fn pixel_clock_mhz(&self) -> Result<u32, DeviceError> {
        Ok(self.pixel_clock)
    }

    fn set_pixel_clock_mhz(&mut self, clock: u32) -> Result<(), DeviceError> {
        if !self.pixel_clocks.contains(&clock) {
            return Err(Self::error("is_PixelClock", DeviceErrorCode::InvalidParameter));
        }
        self.pixel_clock = clock;
        Ok(())
    }

    fn pixel_clock_range_mhz(&self) -> Result<(u32, u32, u32), DeviceError> {
        let min = self.pixel_clocks.iter().min();
        let max = self.pixel_clocks.iter().max();
        // Discrete clock list, no fixed step
        match (min, max) {
            (Some(min), Some(max)) => Ok((*min, *max, 0)),
            _ => Err(Self::error("is_PixelClock", DeviceErrorCode::NotSupported)),
        }
    }

    fn gain_factor(&self, channel: GainChannel) -> Result<u32, DeviceError> {
        Ok(self.gains[Self::gain_index(channel)])
    }

    fn max_gain_factor(&self, channel: GainChannel) -> Result<u32, DeviceError> {
        Ok(self.max_gains[Self::gain_index(channel)])
    }

    fn set_gain_factor(&mut self, channel: GainChannel, factor: u32) -> Result<(), DeviceError> {
        let index = Self::gain_index(channel);
        if !(100..=self.max_gains[index]).contains(&factor) {
            return Err(Self::error("is_SetHWGainFactor", DeviceErrorCode::InvalidParameter));
        }
        self.gains[index] = factor;
        Ok(())
    }

    fn gain_boost_supported(&self) -> Result<bool, DeviceError> {
        Ok(self.gain_boost_supported)
    }

    fn gain_boost(&self) -> Result<bool, DeviceError> {
        Ok(self.gain_boost)
    }

    fn set_gain_boost(&mut self, enabled: bool) -> Result<(), DeviceError> {
        if !self.gain_boost_supported {
            return Err(Self::error("is_SetGainBoost", DeviceErrorCode::NotSupported));
        }
        self.gain_boost = enabled;
        Ok(())
    }
}
