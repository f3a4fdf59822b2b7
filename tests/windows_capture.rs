//! Live tests against the Windows Graphics Capture API.
//!
//! Tests that need an interactive desktop session are ignored, run them with
//! `cargo test -- --ignored`.
#![cfg(windows)]

use std::time::Duration;

use pixel_forge::graphics_capture_api::GraphicsCaptureBackend;
use pixel_forge::{Capture, CaptureTarget, Error, TargetEnumerator, TargetQuery, Window, window};

#[test]
#[ignore = "needs an interactive desktop"]
fn monitors_have_exactly_one_primary() {
    let monitors = pixel_forge::enumerate_monitors().unwrap();
    let primary = pixel_forge::primary_monitor().unwrap();

    assert!(!monitors.is_empty());
    assert_eq!(monitors.iter().filter(|monitor| monitor.device_name() == primary.device_name()).count(), 1);
}

#[test]
#[ignore = "needs an interactive desktop"]
fn primary_monitor_capture_matches_monitor_shape() {
    let capture = Capture::new().unwrap();
    let monitor = pixel_forge::primary_monitor().unwrap();

    capture.start(Some(CaptureTarget::Monitor(monitor.clone())), true).unwrap();
    let frame = capture.next_frame(0, Some(Duration::from_secs(5))).unwrap();
    capture.stop();

    assert_eq!(frame.shape(), (monitor.height() as usize, monitor.width() as usize, 4));
    assert!(!capture.is_active());
}

#[test]
#[ignore = "needs an interactive desktop"]
fn missing_window_is_not_found() {
    let capture = Capture::new().unwrap();

    let result = TargetQuery::Window(String::from("NonexistentTitle12345")).resolve(capture.backend());

    assert!(matches!(result, Err(Error::TargetNotFound(_))));
}

#[test]
fn vanished_window_fails_refresh() {
    let gone = Window::new(0, "Closed long ago");

    assert!(matches!(gone.refresh(), Err(window::Error::Lost)));
    if let Ok(backend) = GraphicsCaptureBackend::new() {
        assert!(!backend.is_window_valid(&gone));
    }
}
