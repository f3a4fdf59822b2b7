use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use parking_lot::Mutex;

use crate::backend::{CaptureBackend, EndReason, FrameSink, SessionShared, Subscription};
use crate::frame::{self, Frame, FrameBuffer};
use crate::frame_slot;
use crate::monitor;
use crate::settings::CaptureSettings;
use crate::target::CaptureTarget;
use crate::window;

/// Every failure a capture session can report.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Capture target not found: {0}")]
    TargetNotFound(String),
    #[error("Capture target is gone: {0}")]
    TargetLost(String),
    #[error("Capture is not supported: {0}")]
    CaptureUnsupported(String),
    #[error("Capture session is already active")]
    AlreadyActive,
    #[error("Capture session is not active")]
    NotActive,
    #[error("No frame has been captured yet")]
    NoFrameYet,
    #[error("Timed out")]
    Timeout,
    #[error("Capture session ended: {0}")]
    SessionEnded(EndReason),
    #[error("Graphics device was lost")]
    DeviceLost,
    #[error("Failed to enumerate capture targets: {0}")]
    Enumeration(String),
    #[error("Frame error: {0}")]
    FrameError(#[from] frame::Error),
    #[cfg(windows)]
    #[error("Windows API error: {0}")]
    WindowsError(#[from] windows::core::Error),
}

impl From<window::Error> for Error {
    fn from(value: window::Error) -> Self {
        match value {
            window::Error::NotFound(title) => Self::TargetNotFound(format!("window titled '{title}'")),
            window::Error::NoForegroundWindow => Self::TargetNotFound(String::from("foreground window")),
            window::Error::Lost => Self::TargetLost(String::from("window")),
            #[cfg(windows)]
            window::Error::WindowsError(e) => Self::WindowsError(e),
        }
    }
}

impl From<monitor::Error> for Error {
    fn from(value: monitor::Error) -> Self {
        match value {
            monitor::Error::NotFound(index) => Self::TargetNotFound(format!("monitor {index}")),
            monitor::Error::IndexIsLowerThanOne => Self::TargetNotFound(String::from("monitor 0, indices start at 1")),
            monitor::Error::NoPrimaryMonitor => Self::TargetNotFound(String::from("primary monitor")),
            monitor::Error::Lost(device_name) => Self::TargetLost(device_name),
            #[cfg(windows)]
            monitor::Error::WindowsError(e) => Self::WindowsError(e),
            e => Self::Enumeration(e.to_string()),
        }
    }
}

impl From<frame_slot::Error> for Error {
    fn from(value: frame_slot::Error) -> Self {
        match value {
            frame_slot::Error::NoFrameYet => Self::NoFrameYet,
            frame_slot::Error::Timeout => Self::Timeout,
            frame_slot::Error::Closed => Self::NotActive,
        }
    }
}

/// Lifecycle of a capture session.
///
/// `Idle -> Starting -> Active -> Stopping -> Idle`. An asynchronous end
/// (target closed, device lost) moves `Starting` or `Active` straight back to
/// `Idle`.
#[derive(Eq, PartialEq, Clone, Copy, Debug)]
#[repr(u8)]
pub enum SessionState {
    Idle = 0,
    Starting = 1,
    Active = 2,
    Stopping = 3,
}

impl SessionState {
    pub(crate) const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Starting,
            2 => Self::Active,
            3 => Self::Stopping,
            _ => Self::Idle,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Starting => "starting",
            Self::Active => "active",
            Self::Stopping => "stopping",
        };
        f.write_str(name)
    }
}

struct Control<S> {
    subscription: Option<S>,
    sink: Option<FrameSink>,
    target: Option<CaptureTarget>,
}

/// A reusable capture session handing out the latest frame of one target.
///
/// Frames are produced on the backend's thread and published into a single
/// slot, readers always get the newest frame and never block the producer.
/// `start` and `stop` are serialized internally so a `Capture` can be shared
/// between threads.
///
/// # Example
/// ```no_run
/// # #[cfg(windows)]
/// # fn main() -> Result<(), pixel_forge::Error> {
/// use pixel_forge::{Capture, TargetQuery};
///
/// let capture = Capture::new()?;
/// let target = TargetQuery::Window(String::from("Notepad")).resolve(capture.backend())?;
///
/// capture.start(Some(target), true)?;
/// let frame = capture.materialize_frame()?;
/// println!("{:?} after {} frames", frame.shape(), capture.frame_cnt());
/// capture.stop();
/// # Ok(())
/// # }
/// # #[cfg(not(windows))]
/// # fn main() {}
/// ```
pub struct Capture<B: CaptureBackend> {
    backend: B,
    settings: CaptureSettings,
    control: Mutex<Control<B::Subscription>>,
    shared: Arc<SessionShared>,
}

impl<B: CaptureBackend> Capture<B> {
    /// Creates an idle session driven by `backend`.
    #[must_use]
    #[inline]
    pub fn with_backend(backend: B, settings: CaptureSettings) -> Self {
        Self {
            backend,
            settings,
            control: Mutex::new(Control { subscription: None, sink: None, target: None }),
            shared: Arc::new(SessionShared::new()),
        }
    }

    /// Starts capturing `target`, or the primary monitor for `None`.
    ///
    /// The target is re-validated first, a stale snapshot fails with
    /// `Error::TargetLost`. With `await_first_frame` the call additionally
    /// blocks until the first frame arrived or the configured first frame
    /// timeout passed; a timeout is logged and the session stays active.
    ///
    /// # Errors
    ///
    /// Returns `Error::AlreadyActive` unless the session is idle,
    /// `Error::TargetLost`/`Error::TargetNotFound` for unresolvable targets,
    /// whatever the backend refused the subscription with, and
    /// `Error::SessionEnded` if the OS ended the capture before `start`
    /// returned.
    pub fn start(&self, target: Option<CaptureTarget>, await_first_frame: bool) -> Result<(), Error> {
        let mut control = self.control.lock();

        if self.shared.state() != SessionState::Idle {
            return Err(Error::AlreadyActive);
        }

        self.reap(&mut control);

        let target = match target {
            Some(target) => self.backend.revalidate(&target)?,
            None => CaptureTarget::Monitor(self.backend.primary_monitor()?),
        };

        self.shared.reset();
        self.shared.set_state(SessionState::Starting);
        debug!("Subscribing to {target}");

        let sink = FrameSink::new(self.shared.clone());
        let subscription = match self.backend.subscribe(&target, &self.settings, sink.clone()) {
            Ok(subscription) => subscription,
            Err(e) => {
                sink.halt();
                self.shared.set_state(SessionState::Idle);
                warn!("Failed to start capturing {target}: {e}");
                return Err(e);
            }
        };

        control.subscription = Some(subscription);
        control.sink = Some(sink);
        control.target = Some(target);

        if !self.shared.transition(SessionState::Starting, SessionState::Active) {
            return Err(self.ended(&mut control));
        }

        if let Some(target) = &control.target {
            info!("Capture started on {target}");
        }

        if await_first_frame {
            let timeout = self.settings.first_frame_timeout();
            match self.shared.slot.read_blocking(0, Some(timeout)) {
                Ok(frame) => debug!("First frame arrived ({}x{})", frame.width(), frame.height()),
                Err(frame_slot::Error::Closed) => return Err(self.ended(&mut control)),
                Err(_) => warn!("No frame arrived within {timeout:?}, capture stays active"),
            }
        }

        Ok(())
    }

    /// Stops capturing and waits for the OS to release the target.
    ///
    /// Never fails: a teardown that doesn't complete within the configured
    /// stop timeout is logged as a leak and the session is still reusable.
    /// Stopping an idle session is a no-op, stopping a session that ended on
    /// its own clears the latched end reason.
    pub fn stop(&self) {
        let mut control = self.control.lock();

        let state = self.shared.state();
        if matches!(state, SessionState::Starting | SessionState::Active) {
            self.shared.set_state(SessionState::Stopping);
        }

        if let Some(sink) = control.sink.take() {
            sink.halt();
        }

        if let Some(subscription) = control.subscription.take() {
            match subscription.close(self.settings.stop_timeout()) {
                Ok(()) => info!("Capture stopped"),
                Err(e) => error!("Capture subscription was not torn down and is leaked: {e}"),
            }
        }

        self.shared.slot.close();
        self.shared.slot.clear();
        self.shared.take_end_reason();
        self.shared.set_state(SessionState::Idle);
    }

    /// The newest frame of the current start cycle.
    ///
    /// The frame is shared, it stays valid after newer frames replace it.
    ///
    /// # Errors
    ///
    /// Returns `Error::SessionEnded` if the OS ended the capture,
    /// `Error::NotActive` if the session is idle and `Error::NoFrameYet` before
    /// the first frame.
    #[inline]
    pub fn frame(&self) -> Result<Arc<Frame>, Error> {
        self.check_running()?;
        Ok(self.shared.slot.read()?)
    }

    /// Owned copy of [`Self::frame`], safe to keep and modify.
    ///
    /// # Errors
    ///
    /// Same as [`Self::frame`].
    #[inline]
    pub fn materialize_frame(&self) -> Result<FrameBuffer, Error> {
        Ok(self.frame()?.to_buffer())
    }

    /// Blocks until a frame with a sequence number above `after` is published.
    ///
    /// Pass `0` for the first frame of the cycle or the sequence of the last
    /// frame seen to wait for the next one. `None` waits without a deadline.
    ///
    /// # Errors
    ///
    /// Returns `Error::Timeout` when the deadline passes, `Error::SessionEnded`
    /// if the OS ends the capture while waiting and `Error::NotActive` if the
    /// session is or becomes stopped.
    pub fn next_frame(&self, after: u64, timeout: Option<Duration>) -> Result<Arc<Frame>, Error> {
        self.check_running()?;

        match self.shared.slot.read_blocking(after, timeout) {
            Err(frame_slot::Error::Closed) => {
                Err(self.shared.end_reason().map_or(Error::NotActive, Error::SessionEnded))
            }
            result => Ok(result?),
        }
    }

    /// Frames published since the latest `start`.
    #[must_use]
    #[inline]
    pub fn frame_cnt(&self) -> u64 {
        self.shared.frame_cnt()
    }

    /// `true` while starting or active.
    #[must_use]
    #[inline]
    pub fn is_active(&self) -> bool {
        matches!(self.shared.state(), SessionState::Starting | SessionState::Active)
    }

    #[must_use]
    #[inline]
    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    /// Target of the current or latest start cycle.
    ///
    /// A window target that closed while being captured is reported with
    /// [`crate::window::Window::is_valid`] returning `false`.
    #[must_use]
    pub fn target(&self) -> Option<CaptureTarget> {
        let control = self.control.lock();
        let mut target = control.target.clone()?;

        if self.shared.end_reason() == Some(EndReason::TargetClosed) {
            target.invalidate();
        }

        Some(target)
    }

    #[must_use]
    #[inline]
    pub const fn settings(&self) -> &CaptureSettings {
        &self.settings
    }

    /// Backend used to resolve targets and open subscriptions.
    #[must_use]
    #[inline]
    pub const fn backend(&self) -> &B {
        &self.backend
    }

    fn check_running(&self) -> Result<(), Error> {
        if let Some(reason) = self.shared.end_reason() {
            return Err(Error::SessionEnded(reason));
        }

        match self.shared.state() {
            SessionState::Starting | SessionState::Active => Ok(()),
            SessionState::Idle | SessionState::Stopping => Err(Error::NotActive),
        }
    }

    /// Tears down a subscription that ended on its own and reports why.
    fn ended(&self, control: &mut Control<B::Subscription>) -> Error {
        self.reap(control);
        self.shared.end_reason().map_or(Error::NotActive, Error::SessionEnded)
    }

    /// Closes a subscription whose session already went back to idle.
    fn reap(&self, control: &mut Control<B::Subscription>) {
        if let Some(sink) = control.sink.take() {
            sink.halt();
        }

        if let Some(subscription) = control.subscription.take() {
            debug!("Reaping ended capture subscription");
            if let Err(e) = subscription.close(self.settings.stop_timeout()) {
                error!("Ended capture subscription was not torn down and is leaked: {e}");
            }
        }
    }
}

impl<B: CaptureBackend> Drop for Capture<B> {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(windows)]
impl Capture<crate::graphics_capture_api::GraphicsCaptureBackend> {
    /// Creates an idle session on the Windows Graphics Capture API with
    /// default settings.
    ///
    /// # Errors
    ///
    /// Returns `Error::CaptureUnsupported` if the API is not available on this
    /// version of Windows.
    #[inline]
    pub fn new() -> Result<Self, Error> {
        Self::with_settings(CaptureSettings::default())
    }

    /// # Errors
    ///
    /// Returns `Error::CaptureUnsupported` if the API is not available on this
    /// version of Windows.
    #[inline]
    pub fn with_settings(settings: CaptureSettings) -> Result<Self, Error> {
        let backend = crate::graphics_capture_api::GraphicsCaptureBackend::new()?;
        Ok(Self::with_backend(backend, settings))
    }
}
