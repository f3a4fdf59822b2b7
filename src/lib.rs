//! # Pixel Forge
//!
//! **Pixel Forge** captures a monitor or a window on Windows through the
//! Graphics Capture API and hands the most recent frame to the caller on
//! demand. Frames are produced by the compositor on a dedicated capture
//! thread at its own pace, the caller pulls whichever frame is newest.
//!
//! ## Features
//!
//! - Latest-frame semantics, a slow reader never stalls the compositor.
//! - Packed BGRA output with shape `(height, width, 4)`, row padding removed.
//! - Explicit errors when the target window closes or the GPU is lost.
//! - Targets resolved by title, monitor index, foreground window or primary monitor.
//!
//! ## Usage
//!
//! ```no_run
//! # #[cfg(windows)]
//! # fn main() -> Result<(), pixel_forge::Error> {
//! use std::time::Duration;
//!
//! use pixel_forge::Capture;
//! use pixel_forge::settings::{CaptureSettings, CursorCaptureSettings};
//!
//! let settings = CaptureSettings::default().with_cursor_capture(CursorCaptureSettings::WithoutCursor);
//! let capture = Capture::with_settings(settings)?;
//!
//! // `None` captures the primary monitor, `true` waits for the first frame.
//! capture.start(None, true)?;
//!
//! let mut seen = 0;
//! for _ in 0..10 {
//!     let frame = capture.next_frame(seen, Some(Duration::from_secs(1)))?;
//!     seen = frame.sequence();
//!     println!("frame {seen}: {:?}", frame.shape());
//! }
//!
//! capture.stop();
//! # Ok(())
//! # }
//! # #[cfg(not(windows))]
//! # fn main() {}
//! ```
//!
//! The session engine is written against [`backend::CaptureBackend`], the
//! Windows implementation lives in [`graphics_capture_api`].
#![warn(clippy::semicolon_if_nothing_returned)]
#![warn(clippy::inconsistent_struct_constructor)]
#![warn(clippy::must_use_candidate)]
#![warn(clippy::ptr_as_ptr)]
#![warn(clippy::borrow_as_ptr)]
#![warn(clippy::nursery)]
#![warn(clippy::cargo)]

pub mod backend;
pub mod capture;
#[cfg(windows)]
mod d3d11;
pub mod frame;
pub mod frame_slot;
#[cfg(windows)]
pub mod graphics_capture_api;
pub mod monitor;
pub mod settings;
pub mod target;
pub mod window;
#[cfg(windows)]
mod winrt;

pub use capture::{Capture, Error, SessionState};
pub use frame::{Frame, FrameBuffer};
pub use monitor::Monitor;
pub use settings::CaptureSettings;
pub use target::{CaptureTarget, TargetEnumerator, TargetQuery};
pub use window::Window;

/// Every top-level window that can currently be captured.
///
/// # Errors
///
/// Returns an `Error` if the OS enumeration fails.
#[cfg(windows)]
#[inline]
pub fn enumerate_windows() -> Result<Vec<Window>, window::Error> {
    Window::enumerate()
}

/// Every active display, in OS order.
///
/// # Errors
///
/// Returns an `Error` if the OS enumeration fails.
#[cfg(windows)]
#[inline]
pub fn enumerate_monitors() -> Result<Vec<Monitor>, monitor::Error> {
    Monitor::enumerate()
}

/// # Errors
///
/// Returns `window::Error::NoForegroundWindow` if there is none.
#[cfg(windows)]
#[inline]
pub fn foreground_window() -> Result<Window, window::Error> {
    Window::foreground()
}

/// # Errors
///
/// Returns `monitor::Error::NoPrimaryMonitor` if no display is flagged as
/// primary.
#[cfg(windows)]
#[inline]
pub fn primary_monitor() -> Result<Monitor, monitor::Error> {
    Monitor::primary()
}
