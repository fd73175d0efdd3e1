//! ROI and binning negotiation
//!
//! Requests are expressed in unbinned sensor pixels. The negotiator truncates
//! them to the nearest configuration the device accepts: factors round down
//! to a supported value that still fits the minimum window, the start and the
//! span round down to the device steps,
//! and windows that end up too small grow (and shift left if needed) to the
//! minimum size.

use serde::{Deserialize, Serialize};

use crate::device::{FactorMask, SensorRect};
use crate::CameraError;

/// ROI constraints along one axis, in binned pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AxisLimits {
    /// Minimal window size
    pub min_size: u32,
    /// Window size increment
    pub size_step: u32,
    /// Window position increment
    pub position_step: u32,
}

impl AxisLimits {
    pub fn new(min_size: u32, size_step: u32, position_step: u32) -> Self {
        Self {
            min_size,
            size_step,
            position_step,
        }
    }
}

/// Sensor extent and ROI constraints, queried once per session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectorGeometry {
    pub max_width: u32,
    pub max_height: u32,
    pub horizontal: AxisLimits,
    pub vertical: AxisLimits,
}

/// Binning or subsampling; only one is active at a time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GeometryMode {
    Binning,
    Subsampling,
}

impl GeometryMode {
    /// The mode that gets reset to 1x1 when this one is applied
    pub fn other(self) -> Self {
        match self {
            Self::Binning => Self::Subsampling,
            Self::Subsampling => Self::Binning,
        }
    }
}

/// Supported factors per axis, sorted ascending and always containing 1
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AxisFactorSet {
    horizontal: Vec<u32>,
    vertical: Vec<u32>,
}

impl Default for AxisFactorSet {
    fn default() -> Self {
        Self {
            horizontal: vec![1],
            vertical: vec![1],
        }
    }
}

impl AxisFactorSet {
    /// Build from explicit factor lists; zeros are dropped and 1 is always added
    pub fn new(
        horizontal: impl IntoIterator<Item = u32>,
        vertical: impl IntoIterator<Item = u32>,
    ) -> Self {
        Self {
            horizontal: Self::normalize(horizontal),
            vertical: Self::normalize(vertical),
        }
    }

    /// Decode a device capability mask
    pub fn from_mask(mask: FactorMask) -> Self {
        let supported = |table: &[(u32, FactorMask)]| -> Vec<u32> {
            table
                .iter()
                .filter(|(_, bit)| mask.contains(*bit))
                .map(|(factor, _)| *factor)
                .collect()
        };
        Self::new(
            supported(&FactorMask::HORIZONTAL_FACTORS),
            supported(&FactorMask::VERTICAL_FACTORS),
        )
    }

    fn normalize(factors: impl IntoIterator<Item = u32>) -> Vec<u32> {
        let mut factors: Vec<u32> = factors.into_iter().filter(|f| *f > 0).collect();
        factors.push(1);
        factors.sort_unstable();
        factors.dedup();
        factors
    }

    pub fn horizontal(&self) -> &[u32] {
        &self.horizontal
    }

    pub fn vertical(&self) -> &[u32] {
        &self.vertical
    }

    /// True when only 1x1 is available
    pub fn is_trivial(&self) -> bool {
        self.horizontal == [1] && self.vertical == [1]
    }

    /// Largest factors on each axis
    pub fn max(&self) -> (u32, u32) {
        (Self::largest(&self.horizontal), Self::largest(&self.vertical))
    }

    /// Round a requested factor down to a supported one
    fn truncate_axis(factors: &[u32], requested: u32) -> u32 {
        let requested = requested.max(1);
        factors
            .iter()
            .rev()
            .find(|f| **f <= requested)
            .or_else(|| factors.first())
            .copied()
            .unwrap_or(1)
    }

    fn largest(factors: &[u32]) -> u32 {
        factors.last().copied().unwrap_or(1)
    }
}

/// Requested ROI in unbinned pixels; `None` ends mean the detector edge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoiRequest {
    pub h_start: u32,
    pub h_end: Option<u32>,
    pub v_start: u32,
    pub v_end: Option<u32>,
    pub h_factor: u32,
    pub v_factor: u32,
}

impl Default for RoiRequest {
    fn default() -> Self {
        Self {
            h_start: 0,
            h_end: None,
            v_start: 0,
            v_end: None,
            h_factor: 1,
            v_factor: 1,
        }
    }
}

impl RoiRequest {
    /// Full detector with the given factors
    pub fn full_frame(h_factor: u32, v_factor: u32) -> Self {
        Self {
            h_factor,
            v_factor,
            ..Default::default()
        }
    }

    /// Explicit window, unbinned
    pub fn window(h_start: u32, h_end: u32, v_start: u32, v_end: u32) -> Self {
        Self {
            h_start,
            h_end: Some(h_end),
            v_start,
            v_end: Some(v_end),
            ..Default::default()
        }
    }

    /// Same request with different factors
    pub fn with_factors(self, h_factor: u32, v_factor: u32) -> Self {
        Self {
            h_factor,
            v_factor,
            ..self
        }
    }
}

/// Accepted ROI. Coordinates are unbinned pixels, ends exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Roi {
    pub h_start: u32,
    pub h_end: u32,
    pub v_start: u32,
    pub v_end: u32,
    pub h_factor: u32,
    pub v_factor: u32,
}

impl Roi {
    /// Convert a device window back to unbinned coordinates
    pub fn from_sensor_rect(rect: SensorRect, h_factor: u32, v_factor: u32) -> Self {
        Self {
            h_start: rect.x * h_factor,
            h_end: (rect.x + rect.width) * h_factor,
            v_start: rect.y * v_factor,
            v_end: (rect.y + rect.height) * v_factor,
            h_factor,
            v_factor,
        }
    }

    /// Window in binned units, as the device takes it
    pub fn to_sensor_rect(&self) -> SensorRect {
        SensorRect {
            x: self.h_start / self.h_factor,
            y: self.v_start / self.v_factor,
            width: self.binned_width(),
            height: self.binned_height(),
        }
    }

    /// Output image width (pixels)
    pub fn binned_width(&self) -> u32 {
        (self.h_end - self.h_start) / self.h_factor
    }

    /// Output image height (pixels)
    pub fn binned_height(&self) -> u32 {
        (self.v_end - self.v_start) / self.v_factor
    }
}

impl From<Roi> for RoiRequest {
    fn from(roi: Roi) -> Self {
        Self {
            h_start: roi.h_start,
            h_end: Some(roi.h_end),
            v_start: roi.v_start,
            v_end: Some(roi.v_end),
            h_factor: roi.h_factor,
            v_factor: roi.v_factor,
        }
    }
}

/// Truncates ROI requests against one device's limits and one factor set
#[derive(Debug, Clone, Copy)]
pub struct GeometryNegotiator<'a> {
    geometry: &'a DetectorGeometry,
    factors: &'a AxisFactorSet,
}

impl<'a> GeometryNegotiator<'a> {
    pub fn new(geometry: &'a DetectorGeometry, factors: &'a AxisFactorSet) -> Self {
        Self { geometry, factors }
    }

    /// Closest valid ROI to `request`.
    ///
    /// Out-of-range requests are clamped, never rejected. The only failure is
    /// a device whose own limits cannot be met (zero steps, or a minimum size
    /// larger than the detector).
    pub fn negotiate(&self, request: &RoiRequest) -> Result<Roi, CameraError> {
        let h_factor = fit_factor(
            "horizontal",
            self.factors.horizontal(),
            request.h_factor,
            self.geometry.max_width,
            &self.geometry.horizontal,
        )?;
        let v_factor = fit_factor(
            "vertical",
            self.factors.vertical(),
            request.v_factor,
            self.geometry.max_height,
            &self.geometry.vertical,
        )?;

        let (h_start, h_end) = negotiate_axis(
            request.h_start,
            request.h_end,
            self.geometry.max_width,
            &self.geometry.horizontal,
            h_factor,
        );
        let (v_start, v_end) = negotiate_axis(
            request.v_start,
            request.v_end,
            self.geometry.max_height,
            &self.geometry.vertical,
            v_factor,
        );

        Ok(Roi {
            h_start,
            h_end,
            v_start,
            v_end,
            h_factor,
            v_factor,
        })
    }

    /// Smallest and largest ROI for this factor set
    pub fn limits(&self) -> (Roi, Roi) {
        let (h_max, v_max) = self.factors.max();
        let h_max = fit_factor(
            "horizontal",
            self.factors.horizontal(),
            h_max,
            self.geometry.max_width,
            &self.geometry.horizontal,
        )
        .unwrap_or(h_max);
        let v_max = fit_factor(
            "vertical",
            self.factors.vertical(),
            v_max,
            self.geometry.max_height,
            &self.geometry.vertical,
        )
        .unwrap_or(v_max);

        let min_roi = Roi {
            h_start: 0,
            h_end: self.geometry.horizontal.min_size,
            v_start: 0,
            v_end: self.geometry.vertical.min_size,
            h_factor: 1,
            v_factor: 1,
        };
        let max_roi = Roi {
            h_start: 0,
            h_end: self.geometry.max_width,
            v_start: 0,
            v_end: self.geometry.max_height,
            h_factor: h_max,
            v_factor: v_max,
        };
        (min_roi, max_roi)
    }
}

/// Minimal span along an axis, in binned pixels
fn min_span(axis: &str, limits: &AxisLimits) -> Result<u32, CameraError> {
    if limits.size_step == 0 || limits.position_step == 0 {
        return Err(CameraError::UnsupportedGeometry(format!(
            "{} axis reports a zero step ({:?})",
            axis, limits
        )));
    }
    Ok(round_up(limits.min_size.max(1), limits.size_step))
}

/// Largest supported factor not above `requested` that still fits the
/// minimal window on the detector
fn fit_factor(
    axis: &str,
    factors: &[u32],
    requested: u32,
    extent: u32,
    limits: &AxisLimits,
) -> Result<u32, CameraError> {
    let min_span = min_span(axis, limits)?;
    let ceiling = AxisFactorSet::truncate_axis(factors, requested);

    factors
        .iter()
        .rev()
        .copied()
        .filter(|factor| *factor <= ceiling)
        .find(|factor| min_span <= extent / factor)
        .ok_or_else(|| {
            CameraError::UnsupportedGeometry(format!(
                "{} axis needs at least {} pixels but the detector has {}",
                axis, min_span, extent
            ))
        })
}

/// Align one axis; returns unbinned `(start, end)`.
///
/// The start lands on the position grid and the span on the size grid. The
/// end is whatever those two give, so an accepted window maps onto itself.
/// `factor` must come from [`fit_factor`].
fn negotiate_axis(
    start: u32,
    end: Option<u32>,
    extent: u32,
    limits: &AxisLimits,
    factor: u32,
) -> (u32, u32) {
    let binned_extent = extent / factor;
    let min_span = round_up(limits.min_size.max(1), limits.size_step);

    let mut start = (start / factor).min(binned_extent);
    start -= start % limits.position_step;
    let end = (end.unwrap_or(extent) / factor).min(binned_extent).max(start);

    let mut span = end - start;
    span -= span % limits.size_step;
    if span < min_span {
        span = min_span;
    }

    if start + span > binned_extent {
        start = binned_extent - span;
        start -= start % limits.position_step;
    }

    (start * factor, (start + span) * factor)
}

fn round_up(value: u32, step: u32) -> u32 {
    match value % step {
        0 => value,
        rem => value + (step - rem),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn scenario_geometry() -> DetectorGeometry {
        DetectorGeometry {
            max_width: 1280,
            max_height: 1024,
            horizontal: AxisLimits::new(16, 4, 2),
            vertical: AxisLimits::new(16, 4, 2),
        }
    }

    #[test]
    fn test_factor_set_from_mask() {
        let mask = FactorMask::HORIZONTAL_2X
            | FactorMask::HORIZONTAL_4X
            | FactorMask::VERTICAL_2X;
        let set = AxisFactorSet::from_mask(mask);
        assert_eq!(set.horizontal(), &[1, 2, 4]);
        assert_eq!(set.vertical(), &[1, 2]);
        assert!(AxisFactorSet::from_mask(FactorMask::empty()).is_trivial());
    }

    #[test]
    fn test_truncate_factors() {
        let set = AxisFactorSet::new([2, 4], [3]);
        let truncate = |h, v| {
            (
                AxisFactorSet::truncate_axis(set.horizontal(), h),
                AxisFactorSet::truncate_axis(set.vertical(), v),
            )
        };
        assert_eq!(truncate(3, 8), (2, 3));
        assert_eq!(truncate(0, 0), (1, 1));
        assert_eq!(truncate(100, 2), (4, 1));

        // Set without 1 on an axis still falls back to the smallest entry
        let sparse = AxisFactorSet {
            horizontal: vec![2, 4],
            vertical: vec![1],
        };
        assert_eq!(AxisFactorSet::truncate_axis(sparse.horizontal(), 1), 2);
    }

    #[test]
    fn test_scenario_clamps_and_aligns() {
        let geometry = scenario_geometry();
        let factors = AxisFactorSet::new([1, 2, 4], [1, 2, 4]);
        let request = RoiRequest {
            h_start: 10,
            h_end: Some(1277),
            v_start: 0,
            v_end: None,
            h_factor: 3,
            v_factor: 1,
        };

        let roi = GeometryNegotiator::new(&geometry, &factors)
            .negotiate(&request)
            .unwrap();

        assert_eq!(roi.h_factor, 2);
        assert_eq!(roi.v_factor, 1);
        assert_eq!(roi.h_start, 8);
        assert_eq!((roi.h_start / 2) % 2, 0);
        assert_eq!(roi.binned_width() % 4, 0);
        assert_eq!(roi.h_end, 1272);
        assert_eq!((roi.v_start, roi.v_end), (0, 1024));
    }

    #[test]
    fn test_small_window_grows_to_min_size() {
        let geometry = scenario_geometry();
        let factors = AxisFactorSet::default();
        let roi = GeometryNegotiator::new(&geometry, &factors)
            .negotiate(&RoiRequest::window(100, 104, 50, 50))
            .unwrap();

        assert_eq!((roi.h_start, roi.h_end), (100, 116));
        assert_eq!((roi.v_start, roi.v_end), (50, 66));
    }

    #[test]
    fn test_window_at_edge_shifts_left() {
        let geometry = scenario_geometry();
        let factors = AxisFactorSet::default();
        let roi = GeometryNegotiator::new(&geometry, &factors)
            .negotiate(&RoiRequest::window(1279, 1280, 2000, 3000))
            .unwrap();

        assert_eq!((roi.h_start, roi.h_end), (1264, 1280));
        assert_eq!((roi.v_start, roi.v_end), (1008, 1024));
    }

    #[test]
    fn test_inverted_window_becomes_min_size() {
        let geometry = scenario_geometry();
        let factors = AxisFactorSet::default();
        let roi = GeometryNegotiator::new(&geometry, &factors)
            .negotiate(&RoiRequest::window(600, 200, 0, 1024))
            .unwrap();

        assert_eq!((roi.h_start, roi.h_end), (600, 616));
    }

    #[test]
    fn test_self_contradictory_limits() {
        let mut geometry = scenario_geometry();
        geometry.horizontal.size_step = 0;
        let factors = AxisFactorSet::default();
        let result = GeometryNegotiator::new(&geometry, &factors).negotiate(&RoiRequest::default());
        assert!(matches!(result, Err(CameraError::UnsupportedGeometry(_))));

        let mut geometry = scenario_geometry();
        geometry.vertical.min_size = 2048;
        let result = GeometryNegotiator::new(&geometry, &factors).negotiate(&RoiRequest::default());
        assert!(matches!(result, Err(CameraError::UnsupportedGeometry(_))));
    }

    #[test]
    fn test_roi_sensor_rect_round_trip() {
        let roi = Roi {
            h_start: 8,
            h_end: 1272,
            v_start: 0,
            v_end: 1024,
            h_factor: 2,
            v_factor: 1,
        };
        let rect = roi.to_sensor_rect();
        assert_eq!(rect, SensorRect { x: 4, y: 0, width: 632, height: 1024 });
        assert_eq!(Roi::from_sensor_rect(rect, 2, 1), roi);
    }

    #[test]
    fn test_limits() {
        let geometry = scenario_geometry();
        let factors = AxisFactorSet::new([1, 2, 4], [1, 2]);
        let (min_roi, max_roi) = GeometryNegotiator::new(&geometry, &factors).limits();
        assert_eq!((min_roi.h_end, min_roi.v_end), (16, 16));
        assert_eq!((max_roi.h_end, max_roi.v_end), (1280, 1024));
        assert_eq!((max_roi.h_factor, max_roi.v_factor), (4, 2));
    }

    #[test]
    fn test_size_step_not_multiple_of_position_step() {
        let geometry = DetectorGeometry {
            max_width: 1280,
            max_height: 1024,
            horizontal: AxisLimits::new(16, 6, 4),
            vertical: AxisLimits::new(16, 4, 2),
        };
        let factors = AxisFactorSet::default();
        let negotiator = GeometryNegotiator::new(&geometry, &factors);

        let once = negotiator.negotiate(&RoiRequest::default()).unwrap();
        assert_eq!((once.h_start, once.h_end), (0, 1278));
        let twice = negotiator.negotiate(&once.into()).unwrap();
        assert_eq!(once, twice);

        let shifted = negotiator
            .negotiate(&RoiRequest::window(1275, 1280, 0, 16))
            .unwrap();
        assert_eq!((shifted.h_start, shifted.h_end), (1260, 1278));
        assert_eq!(negotiator.negotiate(&shifted.into()).unwrap(), shifted);
    }

    #[test]
    fn test_factor_too_large_for_min_size_steps_down() {
        let geometry = DetectorGeometry {
            max_width: 64,
            max_height: 64,
            horizontal: AxisLimits::new(16, 4, 2),
            vertical: AxisLimits::new(16, 4, 2),
        };
        let factors = AxisFactorSet::new([2, 8], [4]);
        let negotiator = GeometryNegotiator::new(&geometry, &factors);

        let roi = negotiator.negotiate(&RoiRequest::full_frame(8, 4)).unwrap();
        assert_eq!((roi.h_factor, roi.v_factor), (2, 4));
        assert_eq!((roi.h_start, roi.h_end), (0, 64));
        assert_eq!(roi.binned_height(), 16);

        let (_, max_roi) = negotiator.limits();
        assert_eq!((max_roi.h_factor, max_roi.v_factor), (2, 4));
    }

    fn axis_limits() -> impl Strategy<Value = AxisLimits> {
        (
            prop::sample::select(vec![1u32, 2, 3, 4, 8]),
            prop::sample::select(vec![1u32, 2, 4, 6, 8, 12, 16]),
            1u32..=32,
        )
            .prop_map(|(position_step, size_step, min_size)| {
                AxisLimits::new(min_size, size_step, position_step)
            })
    }

    fn geometry() -> impl Strategy<Value = DetectorGeometry> {
        (1024u32..4096, 1024u32..4096, axis_limits(), axis_limits()).prop_map(
            |(max_width, max_height, horizontal, vertical)| DetectorGeometry {
                max_width,
                max_height,
                horizontal,
                vertical,
            },
        )
    }

    fn factor_set() -> impl Strategy<Value = AxisFactorSet> {
        (0u32..0x4000).prop_map(|bits| AxisFactorSet::from_mask(FactorMask::from_bits_truncate(bits)))
    }

    fn request() -> impl Strategy<Value = RoiRequest> {
        (
            0u32..5000,
            prop::option::of(0u32..5000),
            0u32..5000,
            prop::option::of(0u32..5000),
            0u32..20,
            0u32..20,
        )
            .prop_map(|(h_start, h_end, v_start, v_end, h_factor, v_factor)| RoiRequest {
                h_start,
                h_end,
                v_start,
                v_end,
                h_factor,
                v_factor,
            })
    }

    fn assert_axis_valid(start: u32, end: u32, factor: u32, extent: u32, limits: &AxisLimits) {
        assert_eq!(start % factor, 0);
        assert_eq!(end % factor, 0);
        let (start, end) = (start / factor, end / factor);
        assert!(start < end);
        assert_eq!(start % limits.position_step, 0);
        assert_eq!((end - start) % limits.size_step, 0);
        assert!(end - start >= limits.min_size);
        assert!(end <= extent / factor);
    }

    proptest! {
        #[test]
        fn prop_negotiated_roi_is_valid(geometry in geometry(), factors in factor_set(), request in request()) {
            let roi = GeometryNegotiator::new(&geometry, &factors).negotiate(&request).unwrap();

            prop_assert!(factors.horizontal().contains(&roi.h_factor));
            prop_assert!(factors.vertical().contains(&roi.v_factor));
            assert_axis_valid(roi.h_start, roi.h_end, roi.h_factor, geometry.max_width, &geometry.horizontal);
            assert_axis_valid(roi.v_start, roi.v_end, roi.v_factor, geometry.max_height, &geometry.vertical);
        }

        #[test]
        fn prop_negotiation_is_idempotent(geometry in geometry(), factors in factor_set(), request in request()) {
            let negotiator = GeometryNegotiator::new(&geometry, &factors);
            let once = negotiator.negotiate(&request).unwrap();
            let twice = negotiator.negotiate(&RoiRequest::from(once)).unwrap();
            prop_assert_eq!(once, twice);
        }
    }
}
