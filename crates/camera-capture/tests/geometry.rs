#![cfg(feature = "mock")]

use camera_capture::{
    AxisLimits, Camera, CameraConfig, CameraError, FactorMask, GeometryMode, RoiRequest,
    SimulatedCamera,
};
use proptest::prelude::*;

fn open(device: SimulatedCamera) -> Camera<SimulatedCamera> {
    Camera::open(device, CameraConfig::default()).unwrap()
}

#[test]
fn test_requested_roi_is_truncated_and_applied() {
    let mut camera = open(SimulatedCamera::new());
    let request = RoiRequest {
        h_start: 10,
        h_end: Some(1277),
        v_start: 0,
        v_end: None,
        h_factor: 3,
        v_factor: 1,
    };

    let roi = camera.set_roi(&request).unwrap();
    assert_eq!(roi.h_factor, 2);
    assert_eq!(roi.v_factor, 1);
    assert_eq!((roi.h_start, roi.h_end), (8, 1272));
    assert_eq!((roi.v_start, roi.v_end), (0, 1024));

    assert_eq!(camera.roi().unwrap(), roi);
    assert_eq!(camera.binning().unwrap(), (2, 1));
    assert_eq!(camera.data_dimensions().unwrap(), (1024, 632));
}

#[test]
fn test_set_roi_of_current_roi_changes_nothing() {
    let mut camera = open(SimulatedCamera::new());
    camera
        .set_roi(&RoiRequest::window(100, 701, 33, 517).with_factors(2, 4))
        .unwrap();

    let current = camera.roi().unwrap();
    assert_eq!(camera.set_roi(&current.into()).unwrap(), current);
    assert_eq!(camera.roi().unwrap(), current);
}

#[test]
fn test_binning_and_subsampling_are_exclusive() {
    let mut camera = open(SimulatedCamera::new());

    assert_eq!(camera.set_subsampling(2, 2).unwrap(), (2, 2));
    assert_eq!(camera.geometry_mode(), GeometryMode::Subsampling);
    assert_eq!(camera.binning().unwrap(), (1, 1));

    assert_eq!(camera.set_binning(4, 2).unwrap(), (4, 2));
    assert_eq!(camera.geometry_mode(), GeometryMode::Binning);
    assert_eq!(camera.subsampling().unwrap(), (1, 1));

    // ROI factors follow the active mode
    assert_eq!(camera.roi().unwrap().h_factor, 4);
}

#[test]
fn test_set_binning_keeps_window() {
    let mut camera = open(SimulatedCamera::new());
    camera.set_roi(&RoiRequest::window(256, 768, 128, 640)).unwrap();

    camera.set_binning(2, 2).unwrap();
    let roi = camera.roi().unwrap();
    assert_eq!((roi.h_start, roi.h_end), (256, 768));
    assert_eq!((roi.v_start, roi.v_end), (128, 640));
    assert_eq!(camera.data_dimensions().unwrap(), (256, 256));
}

#[test]
fn test_unsupported_factors_round_down() {
    let mut camera = open(SimulatedCamera::new());
    assert_eq!(camera.set_binning(3, 16).unwrap(), (2, 4));
    assert_eq!(camera.set_binning(0, 1).unwrap(), (1, 1));
}

#[test]
fn test_supported_modes_and_limits() {
    let camera = open(
        SimulatedCamera::new()
            .with_binning_mask(FactorMask::HORIZONTAL_2X | FactorMask::VERTICAL_3X)
            .with_subsampling_mask(FactorMask::HORIZONTAL_8X),
    );

    assert_eq!(camera.detector_size(), (1280, 1024));
    assert_eq!(camera.supported_binning_modes(), (vec![1, 2], vec![1, 3]));
    assert_eq!(camera.supported_subsampling_modes(), (vec![1, 8], vec![1]));

    let (min_roi, max_roi) = camera.roi_limits();
    assert_eq!((min_roi.h_end, min_roi.v_end), (16, 16));
    assert_eq!((min_roi.h_factor, min_roi.v_factor), (1, 1));
    assert_eq!((max_roi.h_end, max_roi.v_end), (1280, 1024));
    assert_eq!((max_roi.h_factor, max_roi.v_factor), (2, 3));
}

#[test]
fn test_contradictory_device_limits() {
    let mut camera = open(SimulatedCamera::new().with_limits(
        AxisLimits::new(16, 4, 2),
        AxisLimits::new(4096, 4, 2),
    ));
    assert!(matches!(
        camera.set_roi(&RoiRequest::default()),
        Err(CameraError::UnsupportedGeometry(_))
    ));
}

proptest! {
    #[test]
    fn prop_applied_roi_round_trips(
        h_start in 0u32..1400,
        h_end in 0u32..1400,
        v_start in 0u32..1100,
        v_end in 0u32..1100,
        h_factor in 0u32..6,
        v_factor in 0u32..6,
    ) {
        let mut camera = open(SimulatedCamera::new());
        let request = RoiRequest::window(h_start, h_end, v_start, v_end).with_factors(h_factor, v_factor);

        let roi = camera.set_roi(&request).unwrap();
        prop_assert_eq!(camera.roi().unwrap(), roi);
        prop_assert_eq!(camera.set_roi(&roi.into()).unwrap(), roi);
    }
}
