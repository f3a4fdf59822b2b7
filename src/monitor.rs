use std::fmt;
use std::string::FromUtf16Error;

#[cfg(windows)]
use std::{ffi::c_void, mem, ptr};

#[cfg(windows)]
use log::trace;
#[cfg(windows)]
use windows::Graphics::Capture::GraphicsCaptureItem;
#[cfg(windows)]
use windows::Win32::Foundation::{LPARAM, RECT};
#[cfg(windows)]
use windows::Win32::Graphics::Gdi::{
    DEVMODEW, DISPLAY_DEVICEW, ENUM_CURRENT_SETTINGS, EnumDisplayDevicesW, EnumDisplayMonitors, EnumDisplaySettingsW,
    GetMonitorInfoW, HDC, HMONITOR, MONITORINFO, MONITORINFOEXW, MONITORINFOF_PRIMARY,
};
#[cfg(windows)]
use windows::Win32::System::WinRT::Graphics::Capture::IGraphicsCaptureItemInterop;
#[cfg(windows)]
use windows::core::{BOOL, PCWSTR};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Failed to find monitor {0}")]
    NotFound(usize),
    #[error("Monitor index is lower than one")]
    IndexIsLowerThanOne,
    #[error("There is no primary monitor")]
    NoPrimaryMonitor,
    #[error("Monitor {0} is no longer connected")]
    Lost(String),
    #[error("Failed to get monitor info")]
    FailedToGetMonitorInfo,
    #[error("Failed to get monitor settings")]
    FailedToGetMonitorSettings,
    #[error("Failed to get monitor name")]
    FailedToGetMonitorName,
    #[error("Failed to convert windows string: {0}")]
    FailedToConvertWindowsString(#[from] FromUtf16Error),
    #[cfg(windows)]
    #[error("Windows API error: {0}")]
    WindowsError(#[from] windows::core::Error),
}

/// Snapshot of an active display.
///
/// Handles are recycled when the display configuration changes, so the
/// device name (`\\.\DISPLAY1`) is what identifies a monitor across
/// refreshes. The 1-based index is only meaningful within the enumeration
/// pass that produced it.
///
/// # Example
/// ```no_run
/// # #[cfg(windows)]
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// use pixel_forge::monitor::Monitor;
///
/// let monitor = Monitor::primary()?;
/// println!("{} is {}x{} @ {}Hz", monitor.device_name(), monitor.width(), monitor.height(), monitor.refresh_rate());
/// # Ok(())
/// # }
/// # #[cfg(not(windows))]
/// # fn main() {}
/// ```
#[derive(Eq, PartialEq, Clone, Debug)]
pub struct Monitor {
    handle: isize,
    index: usize,
    device_name: String,
    device_string: String,
    width: u32,
    height: u32,
    refresh_rate: u32,
    primary: bool,
}

impl Monitor {
    /// Creates a snapshot with the given identity, the remaining fields are
    /// filled in with the `with_*` builders.
    #[must_use]
    #[inline]
    pub fn new(handle: isize, device_name: impl Into<String>) -> Self {
        Self {
            handle,
            index: 1,
            device_name: device_name.into(),
            device_string: String::new(),
            width: 0,
            height: 0,
            refresh_rate: 0,
            primary: false,
        }
    }

    #[must_use]
    #[inline]
    pub const fn with_index(mut self, index: usize) -> Self {
        self.index = index;
        self
    }

    #[must_use]
    #[inline]
    pub fn with_device_string(mut self, device_string: impl Into<String>) -> Self {
        self.device_string = device_string.into();
        self
    }

    #[must_use]
    #[inline]
    pub const fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    #[must_use]
    #[inline]
    pub const fn with_refresh_rate(mut self, refresh_rate: u32) -> Self {
        self.refresh_rate = refresh_rate;
        self
    }

    #[must_use]
    #[inline]
    pub const fn with_primary(mut self, primary: bool) -> Self {
        self.primary = primary;
        self
    }

    /// Raw monitor handle (HMONITOR) as an integer.
    #[must_use]
    #[inline]
    pub const fn handle(&self) -> isize {
        self.handle
    }

    /// 1-based position in the enumeration that produced this snapshot.
    #[must_use]
    #[inline]
    pub const fn index(&self) -> usize {
        self.index
    }

    /// GDI device name, for example `\\.\DISPLAY1`.
    #[must_use]
    #[inline]
    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    /// Adapter description, for example `NVIDIA GeForce RTX 3080`.
    #[must_use]
    #[inline]
    pub fn device_string(&self) -> &str {
        &self.device_string
    }

    /// Width in pixels.
    #[must_use]
    #[inline]
    pub const fn width(&self) -> u32 {
        self.width
    }

    /// Height in pixels.
    #[must_use]
    #[inline]
    pub const fn height(&self) -> u32 {
        self.height
    }

    /// Refresh rate in hertz.
    #[must_use]
    #[inline]
    pub const fn refresh_rate(&self) -> u32 {
        self.refresh_rate
    }

    #[must_use]
    #[inline]
    pub const fn is_primary(&self) -> bool {
        self.primary
    }
}

impl fmt::Display for Monitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "monitor {} ({}, {}x{})", self.index, self.device_name, self.width, self.height)
    }
}

#[cfg(windows)]
impl Monitor {
    /// Returns the primary monitor.
    ///
    /// # Errors
    ///
    /// Returns `Error::NoPrimaryMonitor` if no active display is flagged as
    /// primary.
    #[inline]
    pub fn primary() -> Result<Self, Error> {
        Self::enumerate()?.into_iter().find(Self::is_primary).ok_or(Error::NoPrimaryMonitor)
    }

    /// Returns the monitor at the specified index.
    ///
    /// # Arguments
    ///
    /// * `index` - The index of the monitor to retrieve. The index starts from 1.
    ///
    /// # Errors
    ///
    /// Returns an `Error::IndexIsLowerThanOne` if the index is less than 1.
    /// Returns an `Error::NotFound` if the monitor at the specified index is not found.
    #[inline]
    pub fn from_index(index: usize) -> Result<Self, Error> {
        if index < 1 {
            return Err(Error::IndexIsLowerThanOne);
        }

        Self::enumerate()?.into_iter().nth(index - 1).ok_or(Error::NotFound(index))
    }

    /// Returns every active display in OS order.
    ///
    /// # Errors
    ///
    /// Returns an `Error` if there is an error enumerating or describing the
    /// monitors.
    #[inline]
    pub fn enumerate() -> Result<Vec<Self>, Error> {
        let mut handles: Vec<HMONITOR> = Vec::new();

        unsafe {
            EnumDisplayMonitors(
                None,
                None,
                Some(Self::enum_monitors_callback),
                LPARAM(ptr::addr_of_mut!(handles) as isize),
            )
            .ok()?;
        };
        trace!("EnumDisplayMonitors reported {} monitors", handles.len());

        handles.into_iter().enumerate().map(|(position, handle)| Self::describe(handle, position + 1)).collect()
    }

    /// Re-resolves this monitor by its device name.
    ///
    /// # Errors
    ///
    /// Returns `Error::Lost` if the display was disconnected.
    #[inline]
    pub fn refresh(&self) -> Result<Self, Error> {
        Self::enumerate()?
            .into_iter()
            .find(|monitor| monitor.device_name == self.device_name)
            .ok_or_else(|| Error::Lost(self.device_name.clone()))
    }

    #[must_use]
    #[inline]
    pub fn as_raw_hmonitor(&self) -> HMONITOR {
        HMONITOR(self.handle as *mut c_void)
    }

    fn describe(handle: HMONITOR, index: usize) -> Result<Self, Error> {
        let mut monitor_info = MONITORINFOEXW {
            monitorInfo: MONITORINFO {
                cbSize: mem::size_of::<MONITORINFOEXW>() as u32,
                rcMonitor: RECT::default(),
                rcWork: RECT::default(),
                dwFlags: 0,
            },
            szDevice: [0; 32],
        };
        if !unsafe { GetMonitorInfoW(handle, ptr::addr_of_mut!(monitor_info).cast()) }.as_bool() {
            return Err(Error::FailedToGetMonitorInfo);
        }

        let device_name = wide_to_string(&monitor_info.szDevice)?;
        let primary = monitor_info.monitorInfo.dwFlags & MONITORINFOF_PRIMARY != 0;

        let mut device_mode = DEVMODEW { dmSize: mem::size_of::<DEVMODEW>() as u16, ..DEVMODEW::default() };
        if !unsafe {
            EnumDisplaySettingsW(PCWSTR(monitor_info.szDevice.as_ptr()), ENUM_CURRENT_SETTINGS, &mut device_mode)
        }
        .as_bool()
        {
            return Err(Error::FailedToGetMonitorSettings);
        }

        let mut display_device = DISPLAY_DEVICEW { cb: mem::size_of::<DISPLAY_DEVICEW>() as u32, ..Default::default() };
        if !unsafe { EnumDisplayDevicesW(PCWSTR(monitor_info.szDevice.as_ptr()), 0, &mut display_device, 0) }.as_bool() {
            return Err(Error::FailedToGetMonitorName);
        }

        Ok(Self::new(handle.0 as isize, device_name)
            .with_index(index)
            .with_device_string(wide_to_string(&display_device.DeviceString)?)
            .with_size(device_mode.dmPelsWidth, device_mode.dmPelsHeight)
            .with_refresh_rate(device_mode.dmDisplayFrequency)
            .with_primary(primary))
    }

    unsafe extern "system" fn enum_monitors_callback(
        monitor: HMONITOR,
        _: HDC,
        _: *mut RECT,
        handles: LPARAM,
    ) -> BOOL {
        let handles = unsafe { &mut *(handles.0 as *mut Vec<HMONITOR>) };

        handles.push(monitor);

        true.into()
    }
}

#[cfg(windows)]
impl TryFrom<&Monitor> for GraphicsCaptureItem {
    type Error = Error;

    #[inline]
    fn try_from(value: &Monitor) -> Result<Self, Self::Error> {
        let interop = windows::core::factory::<Self, IGraphicsCaptureItemInterop>()?;
        Ok(unsafe { interop.CreateForMonitor(value.as_raw_hmonitor())? })
    }
}

#[cfg(windows)]
fn wide_to_string(wide: &[u16]) -> Result<String, FromUtf16Error> {
    let len = wide.iter().position(|ch| *ch == 0).unwrap_or(wide.len());
    String::from_utf16(&wide[..len])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builders_fill_in_snapshot() {
        let monitor = Monitor::new(7, r"\\.\DISPLAY2")
            .with_index(2)
            .with_device_string("Generic PnP Monitor")
            .with_size(2560, 1440)
            .with_refresh_rate(144)
            .with_primary(true);

        assert_eq!(monitor.handle(), 7);
        assert_eq!(monitor.index(), 2);
        assert_eq!(monitor.device_name(), r"\\.\DISPLAY2");
        assert_eq!(monitor.device_string(), "Generic PnP Monitor");
        assert_eq!((monitor.width(), monitor.height()), (2560, 1440));
        assert_eq!(monitor.refresh_rate(), 144);
        assert!(monitor.is_primary());
    }

    #[test]
    fn display_names_the_device() {
        let monitor = Monitor::new(1, r"\\.\DISPLAY1").with_size(1920, 1080);

        assert_eq!(monitor.to_string(), r"monitor 1 (\\.\DISPLAY1, 1920x1080)");
    }
}
