//! Acquisition lifecycle
//!
//! `Idle --setup--> Armed --start--> Running --stop--> Stopped --teardown--> Idle`
//!
//! `Stopped` is the armed state of a ring that has already captured: it keeps
//! the ring buffer, so `start` may be called again without a new `setup`.
//! Callers that only care whether a ring is registered should test
//! [`AcquisitionState::is_armed`] rather than compare against `Armed`.
//! Transitions must be serialized by the caller.

use ring_buffer::RingBufferPool;
use tracing::{debug, info, warn};

use crate::decoder::{self, FrameData};
use crate::device::{Device, FrameMetadata};
use crate::pixel_format::PixelFormat;
use crate::CameraError;

/// Status buckets counted as transfer misses (buffer overruns and timeouts)
pub const TRANSFER_MISS_BUCKETS: [u32; 4] = [0xa2, 0xa3, 0xb2, 0xc7];

/// Acquisition state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AcquisitionState {
    /// No ring buffer
    #[default]
    Idle,
    /// Ring buffer registered, capture never started
    Armed,
    /// Device capturing
    Running,
    /// Armed, previously run: capture stopped with the ring buffer still
    /// registered and the frame count of the last run frozen
    Stopped,
}

impl AcquisitionState {
    /// Whether a ring buffer is registered (`Armed`, `Running` or `Stopped`)
    pub fn is_armed(self) -> bool {
        !matches!(self, Self::Idle)
    }
}

/// Frame counters at the moment of the query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameStatus {
    /// Frames filled since `start`
    pub acquired: u64,
    /// Sum of the transfer-miss status buckets
    pub transfer_missed: u64,
}

/// One decoded frame with the device's metadata
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub data: FrameData,
    pub metadata: FrameMetadata,
}

/// Owns the ring buffer and the capture state of one device session
#[derive(Debug, Default)]
pub struct AcquisitionController {
    state: AcquisitionState,
    pool: RingBufferPool,
    requested_frames: usize,
    acquired_frames: u64,
    /// Device sequence counter sampled at `start`
    sequence_origin: u64,
    /// Last transfer-miss snapshot in the current Running interval
    last_missed: Option<u64>,
}

impl AcquisitionController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> AcquisitionState {
        self.state
    }

    /// Controller's own running flag
    pub fn in_progress(&self) -> bool {
        self.state == AcquisitionState::Running
    }

    /// Ring buffer size requested at setup (0 when Idle)
    pub fn requested_frames(&self) -> usize {
        self.requested_frames
    }

    /// Bytes reserved per ring slot (0 when Idle)
    pub fn frame_bytes(&self) -> usize {
        self.pool.frame_bytes()
    }

    /// Allocate a ring of `count` buffers of `frame_bytes` each.
    ///
    /// A running capture is stopped and any existing ring is released first.
    pub fn setup<D: Device>(
        &mut self,
        device: &mut D,
        count: usize,
        frame_bytes: usize,
    ) -> Result<(), CameraError> {
        self.stop(device)?;

        match self.pool.allocate(device, count, frame_bytes) {
            Ok(_) => {
                self.state = AcquisitionState::Armed;
                self.requested_frames = count;
                self.acquired_frames = 0;
                self.last_missed = None;
                info!("Acquisition armed: {} frames of {} bytes", count, frame_bytes);
                Ok(())
            }
            Err(err) => {
                self.state = AcquisitionState::Idle;
                self.requested_frames = 0;
                Err(err.into())
            }
        }
    }

    /// Start capturing into the ring.
    ///
    /// Counters restart from zero. A running capture is stopped first.
    pub fn start<D: Device>(&mut self, device: &mut D) -> Result<(), CameraError> {
        if !self.state.is_armed() {
            return Err(CameraError::NotArmed);
        }
        self.stop(device)?;

        device.reset_capture_status()?;
        self.sequence_origin = device.acquired_sequence_count()?;
        device.start_capture()?;

        self.acquired_frames = 0;
        self.last_missed = None;
        self.state = AcquisitionState::Running;
        debug!("Capture started at sequence {}", self.sequence_origin);
        Ok(())
    }

    /// Stop capturing. Does nothing unless Running.
    ///
    /// The controller leaves Running even if a device command fails; the
    /// first failure is returned.
    pub fn stop<D: Device>(&mut self, device: &mut D) -> Result<(), CameraError> {
        if self.state != AcquisitionState::Running {
            return Ok(());
        }

        let sampled = device.acquired_sequence_count();
        let stopped = device.stop_capture();
        self.state = AcquisitionState::Stopped;
        self.last_missed = None;

        let count = sampled?;
        self.acquired_frames = self.frames_since_start(count);
        stopped?;

        debug!("Capture stopped after {} frames", self.acquired_frames);
        Ok(())
    }

    /// Stop and release the ring buffer. Safe to call when Idle.
    pub fn teardown<D: Device>(&mut self, device: &mut D) -> Result<(), CameraError> {
        let stopped = self.stop(device);
        let released = self.pool.deallocate(device);

        if self.state.is_armed() {
            debug!("Acquisition torn down");
        }
        self.state = AcquisitionState::Idle;
        self.requested_frames = 0;

        stopped?;
        released?;
        Ok(())
    }

    /// `(controller flag, device flag)`.
    ///
    /// The two are reported independently; a device that stopped on its own
    /// is logged but not corrected.
    pub fn poll_status<D: Device>(&self, device: &D) -> Result<(bool, bool), CameraError> {
        let hardware = device.capture_active()?;
        let in_progress = self.in_progress();
        if in_progress && !hardware {
            warn!("Device reports capture inactive while acquisition is running");
        }
        Ok((in_progress, hardware))
    }

    /// Current frame counters.
    ///
    /// `acquired` is live while Running and frozen at the last `stop`
    /// otherwise. `transfer_missed` is always a fresh device snapshot; a
    /// decrease within one Running interval is logged and returned as is.
    pub fn frame_status<D: Device>(&mut self, device: &D) -> Result<FrameStatus, CameraError> {
        if self.in_progress() {
            let count = device.acquired_sequence_count()?;
            let acquired = self.frames_since_start(count);
            if acquired < self.acquired_frames {
                warn!(
                    "Acquired frame counter went backwards: {} -> {}",
                    self.acquired_frames, acquired
                );
            }
            self.acquired_frames = acquired;
        }

        let counters = device.status_counters()?;
        let transfer_missed = TRANSFER_MISS_BUCKETS
            .iter()
            .filter_map(|bucket| counters.get(bucket))
            .sum();

        if self.in_progress() {
            if let Some(previous) = self.last_missed {
                if transfer_missed < previous {
                    warn!(
                        "Transfer-miss counter went backwards: {} -> {}",
                        previous, transfer_missed
                    );
                }
            }
            self.last_missed = Some(transfer_missed);
        }

        Ok(FrameStatus {
            acquired: self.acquired_frames,
            transfer_missed,
        })
    }

    fn frames_since_start(&self, count: u64) -> u64 {
        if count < self.sequence_origin {
            warn!(
                "Device sequence counter {} below start value {}",
                count, self.sequence_origin
            );
        }
        count.saturating_sub(self.sequence_origin)
    }

    /// Read and decode frame `index` from ring slot `index mod N`.
    ///
    /// An unfilled slot fails with `FrameNotReady`; nothing is retried here.
    pub fn read_frame<D: Device>(
        &self,
        device: &D,
        index: u64,
        format: &PixelFormat,
    ) -> Result<Frame, CameraError> {
        let handle = self.pool.slot(index).ok_or(CameraError::NotArmed)?;
        let metadata = device
            .frame_metadata(handle)?
            .ok_or(CameraError::FrameNotReady { index })?;

        let mut raw = vec![0u8; handle.len()];
        device.copy_buffer(handle, &mut raw)?;

        let data = if metadata.pitch == 0 {
            decoder::decode(&raw, metadata.width, metadata.height, format)?
        } else {
            decoder::decode_with_pitch(&raw, metadata.width, metadata.height, metadata.pitch, format)?
        };
        Ok(Frame { data, metadata })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pixel_format::PixelFormatRegistry;
    use crate::sim::SimulatedCamera;

    const FRAME_BYTES: usize = 1280 * 1024;

    fn mono8() -> &'static PixelFormat {
        PixelFormatRegistry::by_name("mono8").unwrap()
    }

    #[test]
    fn test_start_requires_setup() {
        let mut device = SimulatedCamera::new();
        let mut controller = AcquisitionController::new();
        assert!(matches!(controller.start(&mut device), Err(CameraError::NotArmed)));
        assert_eq!(controller.state(), AcquisitionState::Idle);
    }

    #[test]
    fn test_lifecycle() {
        let mut device = SimulatedCamera::new();
        let mut controller = AcquisitionController::new();

        controller.setup(&mut device, 4, FRAME_BYTES).unwrap();
        assert_eq!(controller.state(), AcquisitionState::Armed);
        assert_eq!(device.sequence_len(), 4);

        controller.start(&mut device).unwrap();
        assert_eq!(controller.state(), AcquisitionState::Running);
        assert_eq!(controller.poll_status(&device).unwrap(), (true, true));

        controller.stop(&mut device).unwrap();
        assert_eq!(controller.state(), AcquisitionState::Stopped);
        assert!(controller.state().is_armed());
        assert_eq!(device.sequence_len(), 4);
        assert_eq!(controller.poll_status(&device).unwrap(), (false, false));

        // Restart without a new setup
        controller.start(&mut device).unwrap();
        controller.teardown(&mut device).unwrap();
        assert_eq!(controller.state(), AcquisitionState::Idle);
        assert_eq!(device.live_buffers(), 0);
        assert!(!device.capture_active().unwrap());
    }

    #[test]
    fn test_counters_restart_at_start() {
        let mut device = SimulatedCamera::new();
        let mut controller = AcquisitionController::new();
        controller.setup(&mut device, 4, FRAME_BYTES).unwrap();

        controller.start(&mut device).unwrap();
        device.deliver_frames(6);
        assert_eq!(controller.frame_status(&device).unwrap().acquired, 6);
        controller.stop(&mut device).unwrap();
        assert_eq!(controller.frame_status(&device).unwrap().acquired, 6);

        controller.start(&mut device).unwrap();
        assert_eq!(controller.frame_status(&device).unwrap().acquired, 0);
        device.deliver_frames(2);
        assert_eq!(controller.frame_status(&device).unwrap().acquired, 2);
        controller.teardown(&mut device).unwrap();
    }

    #[test]
    fn test_transfer_miss_sums_buckets() {
        let mut device = SimulatedCamera::new();
        let mut controller = AcquisitionController::new();
        controller.setup(&mut device, 2, FRAME_BYTES).unwrap();
        controller.start(&mut device).unwrap();

        device.set_status_counter(0xa2, 3);
        device.set_status_counter(0xc7, 4);
        device.set_status_counter(0x10, 100);
        assert_eq!(controller.frame_status(&device).unwrap().transfer_missed, 7);

        // Counter reset behind our back is reported, not hidden
        device.set_status_counter(0xa2, 0);
        assert_eq!(controller.frame_status(&device).unwrap().transfer_missed, 4);
        controller.teardown(&mut device).unwrap();
    }

    #[test]
    fn test_read_frame_wraps_ring() {
        let mut device = SimulatedCamera::new().with_detector(32, 16);
        let mut controller = AcquisitionController::new();
        controller.setup(&mut device, 3, 32 * 16).unwrap();
        controller.start(&mut device).unwrap();

        assert!(matches!(
            controller.read_frame(&device, 0, mono8()),
            Err(CameraError::FrameNotReady { index: 0 })
        ));

        device.deliver_frames(4);
        let frame = controller.read_frame(&device, 3, mono8()).unwrap();
        assert_eq!(frame.data.shape(), &[16, 32]);
        assert_eq!(frame.metadata.sequence, 3);
        // Slot 0 now holds frame 3
        assert_eq!(controller.read_frame(&device, 0, mono8()).unwrap().metadata.sequence, 3);
        controller.teardown(&mut device).unwrap();
    }

    #[test]
    fn test_failed_setup_leaves_idle() {
        let mut device = SimulatedCamera::new().with_memory_budget(3 * FRAME_BYTES);
        let mut controller = AcquisitionController::new();

        let err = controller.setup(&mut device, 5, FRAME_BYTES).unwrap_err();
        assert!(matches!(err, CameraError::Allocation { slot: 3, .. }));
        assert_eq!(controller.state(), AcquisitionState::Idle);
        assert_eq!(device.live_buffers(), 0);
        assert_eq!(device.sequence_len(), 0);
    }

    #[test]
    fn test_read_frame_when_idle() {
        let device = SimulatedCamera::new();
        let controller = AcquisitionController::new();
        assert!(matches!(
            controller.read_frame(&device, 0, mono8()),
            Err(CameraError::NotArmed)
        ));
    }

    #[test]
    fn test_divergence_is_reported() {
        let mut device = SimulatedCamera::new();
        let mut controller = AcquisitionController::new();
        controller.setup(&mut device, 2, FRAME_BYTES).unwrap();
        controller.start(&mut device).unwrap();

        device.halt_capture();
        assert_eq!(controller.poll_status(&device).unwrap(), (true, false));
        controller.teardown(&mut device).unwrap();
    }
}
