use std::fmt;
use std::str::FromStr;

use crate::capture::Error;
use crate::monitor::{self, Monitor};
use crate::window::{self, Window};

/// Surface a capture session attaches to.
#[derive(Eq, PartialEq, Clone, Debug)]
pub enum CaptureTarget {
    Window(Window),
    Monitor(Monitor),
}

impl CaptureTarget {
    /// Frame size the target had when the snapshot was taken, `None` for
    /// windows since their size is only known once frames arrive.
    #[must_use]
    #[inline]
    pub const fn size_hint(&self) -> Option<(u32, u32)> {
        match self {
            Self::Window(_) => None,
            Self::Monitor(monitor) => Some((monitor.width(), monitor.height())),
        }
    }

    pub(crate) fn invalidate(&mut self) {
        if let Self::Window(window) = self {
            window.invalidate();
        }
    }
}

impl From<Window> for CaptureTarget {
    #[inline]
    fn from(value: Window) -> Self {
        Self::Window(value)
    }
}

impl From<Monitor> for CaptureTarget {
    #[inline]
    fn from(value: Monitor) -> Self {
        Self::Monitor(value)
    }
}

impl fmt::Display for CaptureTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Window(window) => fmt::Display::fmt(window, f),
            Self::Monitor(monitor) => fmt::Display::fmt(monitor, f),
        }
    }
}

/// Resolves human-level references to concrete capture targets.
///
/// Implementors only provide the raw OS queries; lookups by title or index
/// and re-validation are shared. Nothing is cached, every call asks the OS
/// again.
pub trait TargetEnumerator {
    /// Every top-level window that can currently be captured.
    ///
    /// # Errors
    ///
    /// Returns an `Error` if the OS enumeration fails.
    fn enumerate_windows(&self) -> Result<Vec<Window>, window::Error>;

    /// Every active display.
    ///
    /// # Errors
    ///
    /// Returns an `Error` if the OS enumeration fails.
    fn enumerate_monitors(&self) -> Result<Vec<Monitor>, monitor::Error>;

    /// # Errors
    ///
    /// Returns `window::Error::NoForegroundWindow` if there is none.
    fn foreground_window(&self) -> Result<Window, window::Error>;

    /// Re-resolves a window snapshot by its handle.
    ///
    /// # Errors
    ///
    /// Returns `window::Error::Lost` if the window is gone.
    fn refresh_window(&self, window: &Window) -> Result<Window, window::Error>;

    /// Lazily re-checks a window snapshot against the current desktop.
    ///
    /// `false` for windows that closed, became uncapturable or were seen
    /// closing by a capture session.
    fn is_window_valid(&self, window: &Window) -> bool {
        window.is_valid() && self.refresh_window(window).is_ok()
    }

    /// Re-resolves a monitor snapshot by its device name.
    ///
    /// # Errors
    ///
    /// Returns `monitor::Error::Lost` if the display was disconnected.
    fn refresh_monitor(&self, monitor: &Monitor) -> Result<Monitor, monitor::Error> {
        self.enumerate_monitors()?
            .into_iter()
            .find(|candidate| candidate.device_name() == monitor.device_name())
            .ok_or_else(|| monitor::Error::Lost(monitor.device_name().to_owned()))
    }

    /// # Errors
    ///
    /// Returns `monitor::Error::NoPrimaryMonitor` if no display is flagged as
    /// primary.
    fn primary_monitor(&self) -> Result<Monitor, monitor::Error> {
        self.enumerate_monitors()?.into_iter().find(Monitor::is_primary).ok_or(monitor::Error::NoPrimaryMonitor)
    }

    /// First window titled exactly `title`, otherwise the first whose title
    /// contains it.
    ///
    /// # Errors
    ///
    /// Returns `window::Error::NotFound` if neither lookup matches.
    fn find_window(&self, title: &str) -> Result<Window, window::Error> {
        let mut windows = self.enumerate_windows()?;

        let position = windows
            .iter()
            .position(|window| window.title() == title)
            .or_else(|| windows.iter().position(|window| window.title().contains(title)));

        position.map(|position| windows.swap_remove(position)).ok_or_else(|| window::Error::NotFound(title.to_owned()))
    }

    /// Monitor by 1-based index, or the primary monitor for `None`.
    ///
    /// # Errors
    ///
    /// Returns `monitor::Error::IndexIsLowerThanOne` for `Some(0)` and
    /// `monitor::Error::NotFound` for an index past the last display.
    fn monitor_from_index(&self, index: Option<usize>) -> Result<Monitor, monitor::Error> {
        match index {
            None => self.primary_monitor(),
            Some(0) => Err(monitor::Error::IndexIsLowerThanOne),
            Some(index) => self.enumerate_monitors()?.into_iter().nth(index - 1).ok_or(monitor::Error::NotFound(index)),
        }
    }

    /// Confirms `target` still exists and returns a fresh snapshot of it.
    ///
    /// # Errors
    ///
    /// Returns `Error::TargetLost` if the target vanished since the snapshot
    /// was taken.
    fn revalidate(&self, target: &CaptureTarget) -> Result<CaptureTarget, Error> {
        match target {
            CaptureTarget::Window(window) => match self.refresh_window(window) {
                Ok(window) => Ok(CaptureTarget::Window(window)),
                Err(window::Error::Lost) => Err(Error::TargetLost(target.to_string())),
                Err(e) => Err(e.into()),
            },
            CaptureTarget::Monitor(monitor) => match self.refresh_monitor(monitor) {
                Ok(monitor) => Ok(CaptureTarget::Monitor(monitor)),
                Err(monitor::Error::Lost(_)) => Err(Error::TargetLost(target.to_string())),
                Err(e) => Err(e.into()),
            },
        }
    }
}

/// Human-level reference to a capture target.
///
/// Parses from and renders to the forms `primary`, `monitor:<index>`,
/// `foreground` and `window:<title>`.
///
/// # Example
/// ```
/// use pixel_forge::target::TargetQuery;
///
/// let query: TargetQuery = "window:Untitled - Notepad".parse()?;
/// assert_eq!(query, TargetQuery::Window(String::from("Untitled - Notepad")));
/// assert_eq!("monitor:2".parse::<TargetQuery>()?, TargetQuery::Monitor(2));
/// # Ok::<(), pixel_forge::target::ParseQueryError>(())
/// ```
#[derive(Eq, PartialEq, Clone, Debug)]
pub enum TargetQuery {
    PrimaryMonitor,
    /// 1-based monitor index.
    Monitor(usize),
    ForegroundWindow,
    /// Exact title, falling back to the first title containing it.
    Window(String),
}

impl TargetQuery {
    /// Resolves the query against the displays and windows present right now.
    ///
    /// # Errors
    ///
    /// Returns `Error::TargetNotFound` if nothing matches.
    #[inline]
    pub fn resolve<E: TargetEnumerator + ?Sized>(&self, enumerator: &E) -> Result<CaptureTarget, Error> {
        let target = match self {
            Self::PrimaryMonitor => enumerator.monitor_from_index(None)?.into(),
            Self::Monitor(index) => enumerator.monitor_from_index(Some(*index))?.into(),
            Self::ForegroundWindow => enumerator.foreground_window()?.into(),
            Self::Window(title) => enumerator.find_window(title)?.into(),
        };

        Ok(target)
    }
}

#[derive(thiserror::Error, Eq, PartialEq, Clone, Debug)]
pub enum ParseQueryError {
    #[error("Unknown capture target '{0}', expected primary, foreground, monitor:<index> or window:<title>")]
    UnknownTarget(String),
    #[error("Invalid monitor index '{0}'")]
    InvalidMonitorIndex(String),
    #[error("Window title must not be empty")]
    EmptyWindowTitle,
}

impl FromStr for TargetQuery {
    type Err = ParseQueryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(index) = s.strip_prefix("monitor:") {
            return index
                .trim()
                .parse()
                .map(Self::Monitor)
                .map_err(|_| ParseQueryError::InvalidMonitorIndex(index.to_owned()));
        }

        if let Some(title) = s.strip_prefix("window:") {
            if title.is_empty() {
                return Err(ParseQueryError::EmptyWindowTitle);
            }
            return Ok(Self::Window(title.to_owned()));
        }

        match s.trim() {
            "primary" => Ok(Self::PrimaryMonitor),
            "foreground" => Ok(Self::ForegroundWindow),
            _ => Err(ParseQueryError::UnknownTarget(s.to_owned())),
        }
    }
}

impl fmt::Display for TargetQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PrimaryMonitor => f.write_str("primary"),
            Self::Monitor(index) => write!(f, "monitor:{index}"),
            Self::ForegroundWindow => f.write_str("foreground"),
            Self::Window(title) => write!(f, "window:{title}"),
        }
    }
}
