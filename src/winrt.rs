use windows::Win32::Foundation::S_FALSE;
use windows::Win32::System::Com::{CO_MTA_USAGE_COOKIE, CoDecrementMTAUsage, CoIncrementMTAUsage};
use windows::Win32::System::WinRT::{RO_INIT_MULTITHREADED, RoInitialize, RoUninitialize};

/// Keeps the process MTA alive while the capture thread runs.
struct MtaUsage {
    cookie: CO_MTA_USAGE_COOKIE,
}

impl MtaUsage {
    fn new() -> Result<Self, windows::core::Error> {
        Ok(Self { cookie: unsafe { CoIncrementMTAUsage()? } })
    }
}

impl Drop for MtaUsage {
    fn drop(&mut self) {
        let _ = unsafe { CoDecrementMTAUsage(self.cookie) };
    }
}

/// WinRT initialization scoped to the current thread.
///
/// Dropping the guard uninitializes WinRT again, so it must be dropped on the
/// thread that created it.
pub struct WinRtGuard {
    _mta: MtaUsage,
}

impl WinRtGuard {
    /// Initializes WinRT on the current thread in the multithreaded apartment.
    ///
    /// # Errors
    ///
    /// Returns an `Error` if the apartment can't be joined, for example
    /// because the thread already lives in a single-threaded one.
    #[inline]
    pub fn new() -> Result<Self, windows::core::Error> {
        let mta = MtaUsage::new()?;

        if let Err(e) = unsafe { RoInitialize(RO_INIT_MULTITHREADED) }
            && e.code() != S_FALSE
        {
            return Err(e);
        }

        Ok(Self { _mta: mta })
    }
}

impl Drop for WinRtGuard {
    fn drop(&mut self) {
        unsafe { RoUninitialize() };
    }
}
