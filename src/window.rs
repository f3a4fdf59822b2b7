use std::fmt;

#[cfg(windows)]
use std::ffi::c_void;
#[cfg(windows)]
use std::ptr;

#[cfg(windows)]
use log::trace;
#[cfg(windows)]
use windows::Graphics::Capture::GraphicsCaptureItem;
#[cfg(windows)]
use windows::Win32::Foundation::{HWND, LPARAM};
#[cfg(windows)]
use windows::Win32::Graphics::Gdi::{MONITOR_DEFAULTTONULL, MonitorFromWindow};
#[cfg(windows)]
use windows::Win32::System::Threading::GetCurrentProcessId;
#[cfg(windows)]
use windows::Win32::System::WinRT::Graphics::Capture::IGraphicsCaptureItemInterop;
#[cfg(windows)]
use windows::Win32::UI::WindowsAndMessaging::{
    EnumWindows, GWL_EXSTYLE, GWL_STYLE, GetForegroundWindow, GetWindowLongPtrW, GetWindowTextLengthW,
    GetWindowTextW, GetWindowThreadProcessId, IsWindow, IsWindowVisible, WS_CHILD, WS_EX_TOOLWINDOW,
};
#[cfg(windows)]
use windows::core::BOOL;

#[cfg(windows)]
use crate::monitor::{self, Monitor};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Failed to find a window titled '{0}'")]
    NotFound(String),
    #[error("There is no foreground window")]
    NoForegroundWindow,
    #[error("Window no longer exists")]
    Lost,
    #[cfg(windows)]
    #[error("Windows API error: {0}")]
    WindowsError(#[from] windows::core::Error),
}

/// Snapshot of a top-level window.
///
/// The handle is weak: the window may close at any time, after which the
/// handle can even be recycled by the OS for an unrelated window. The title is
/// the one observed when the snapshot was taken.
#[derive(Eq, PartialEq, Clone, Debug)]
pub struct Window {
    handle: isize,
    title: String,
    valid: bool,
}

impl Window {
    /// Creates a snapshot from a raw window handle and its title.
    #[must_use]
    #[inline]
    pub fn new(handle: isize, title: impl Into<String>) -> Self {
        Self { handle, title: title.into(), valid: true }
    }

    /// Raw window handle (HWND) as an integer.
    #[must_use]
    #[inline]
    pub const fn handle(&self) -> isize {
        self.handle
    }

    #[must_use]
    #[inline]
    pub fn title(&self) -> &str {
        &self.title
    }

    /// `false` once a capture session saw the window close.
    ///
    /// The snapshot itself is not tracked, use
    /// [`crate::target::TargetEnumerator::is_window_valid`] to re-check it
    /// against the desktop.
    #[must_use]
    #[inline]
    pub const fn is_valid(&self) -> bool {
        self.valid
    }

    pub(crate) fn invalidate(&mut self) {
        self.valid = false;
    }
}

impl fmt::Display for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "window '{}' ({:#x})", self.title, self.handle)
    }
}

#[cfg(windows)]
impl Window {
    /// Returns the window the user is currently working in.
    ///
    /// # Errors
    ///
    /// Returns `Error::NoForegroundWindow` when the desktop has no foreground
    /// window, for example while the lock screen is shown.
    #[inline]
    pub fn foreground() -> Result<Self, Error> {
        let window = unsafe { GetForegroundWindow() };

        if window.is_invalid() {
            return Err(Error::NoForegroundWindow);
        }

        Ok(Self::from_raw_hwnd(window))
    }

    /// Returns the first capturable window whose title is exactly `title`.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` if no such window exists.
    #[inline]
    pub fn from_name(title: &str) -> Result<Self, Error> {
        Self::enumerate()?
            .into_iter()
            .find(|window| window.title == title)
            .ok_or_else(|| Error::NotFound(String::from(title)))
    }

    /// Returns the first capturable window whose title contains `title`.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` if no such window exists.
    #[inline]
    pub fn from_contains_name(title: &str) -> Result<Self, Error> {
        Self::enumerate()?
            .into_iter()
            .find(|window| window.title.contains(title))
            .ok_or_else(|| Error::NotFound(String::from(title)))
    }

    /// Returns every top-level window that can be captured, in OS z-order.
    ///
    /// A window qualifies when it is visible, owned by another process, is
    /// neither a tool window nor a child window and has a non-empty title.
    ///
    /// # Errors
    ///
    /// Returns an `Error` if the OS enumeration fails.
    #[inline]
    pub fn enumerate() -> Result<Vec<Self>, Error> {
        let mut handles: Vec<HWND> = Vec::new();

        unsafe { EnumWindows(Some(Self::enum_windows_callback), LPARAM(ptr::addr_of_mut!(handles) as isize))? };
        trace!("EnumWindows reported {} capturable windows", handles.len());

        let mut windows = Vec::with_capacity(handles.len());
        for handle in handles {
            let window = Self::from_raw_hwnd(handle);
            if !window.title.is_empty() {
                windows.push(window);
            }
        }

        Ok(windows)
    }

    /// Re-resolves the window behind this snapshot's handle.
    ///
    /// # Errors
    ///
    /// Returns `Error::Lost` if the window no longer exists or stopped being
    /// capturable, for example because it was hidden.
    #[inline]
    pub fn refresh(&self) -> Result<Self, Error> {
        if !self.is_live() {
            return Err(Error::Lost);
        }

        Ok(Self::from_raw_hwnd(self.as_raw_hwnd()))
    }

    /// Returns the monitor showing the largest part of this window.
    ///
    /// # Errors
    ///
    /// Returns an `Error` if the monitors can't be described.
    #[inline]
    pub fn monitor(&self) -> Result<Option<Monitor>, monitor::Error> {
        let monitor = unsafe { MonitorFromWindow(self.as_raw_hwnd(), MONITOR_DEFAULTTONULL) };

        if monitor.is_invalid() {
            return Ok(None);
        }

        Ok(Monitor::enumerate()?.into_iter().find(|candidate| candidate.handle() == monitor.0 as isize))
    }

    #[must_use]
    #[inline]
    pub fn as_raw_hwnd(&self) -> HWND {
        HWND(self.handle as *mut c_void)
    }

    fn from_raw_hwnd(window: HWND) -> Self {
        Self::new(window.0 as isize, Self::read_title(window))
    }

    fn read_title(window: HWND) -> String {
        let len = unsafe { GetWindowTextLengthW(window) };
        if len <= 0 {
            return String::new();
        }

        let mut title = vec![0u16; len as usize + 1];
        let copied = unsafe { GetWindowTextW(window, &mut title) };
        title.truncate(copied.max(0) as usize);

        decode_title(&title)
    }

    fn is_live(&self) -> bool {
        let window = self.as_raw_hwnd();
        unsafe { IsWindow(Some(window)) }.as_bool() && Self::is_capturable(window)
    }

    fn is_capturable(window: HWND) -> bool {
        if !unsafe { IsWindowVisible(window) }.as_bool() {
            return false;
        }

        let mut process_id = 0;
        unsafe { GetWindowThreadProcessId(window, Some(&raw mut process_id)) };
        if process_id == unsafe { GetCurrentProcessId() } {
            return false;
        }

        let styles = unsafe { GetWindowLongPtrW(window, GWL_STYLE) };
        let ex_styles = unsafe { GetWindowLongPtrW(window, GWL_EXSTYLE) };

        ex_styles & WS_EX_TOOLWINDOW.0 as isize == 0 && styles & WS_CHILD.0 as isize == 0
    }

    unsafe extern "system" fn enum_windows_callback(window: HWND, handles: LPARAM) -> BOOL {
        let handles = unsafe { &mut *(handles.0 as *mut Vec<HWND>) };

        if Self::is_capturable(window) {
            handles.push(window);
        }

        true.into()
    }
}

/// Titles may hold unpaired surrogates, those decode to U+FFFD.
#[cfg(any(windows, test))]
fn decode_title(wide: &[u16]) -> String {
    String::from_utf16_lossy(wide)
}

#[cfg(windows)]
impl TryFrom<&Window> for GraphicsCaptureItem {
    type Error = Error;

    #[inline]
    fn try_from(value: &Window) -> Result<Self, Self::Error> {
        let interop = windows::core::factory::<Self, IGraphicsCaptureItemInterop>()?;
        Ok(unsafe { interop.CreateForWindow(value.as_raw_hwnd())? })
    }
}
