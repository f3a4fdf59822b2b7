//! Windows Graphics Capture backend.
//!
//! Every subscription owns a dedicated thread running a dispatcher queue and
//! a message loop. Frame pool events are delivered on that thread, copied
//! through a staging texture and pushed into the session's frame sink.
//! Closing a subscription posts `WM_QUIT` to the thread and waits for it to
//! release every OS object.
use std::mem;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, error, info, trace, warn};
use parking_lot::Mutex;
use windows::Foundation::Metadata::ApiInformation;
use windows::Foundation::TypedEventHandler;
use windows::Graphics::Capture::{Direct3D11CaptureFramePool, GraphicsCaptureItem, GraphicsCaptureSession};
use windows::Graphics::DirectX::Direct3D11::IDirect3DDevice;
use windows::Graphics::DirectX::DirectXPixelFormat;
use windows::Graphics::SizeInt32;
use windows::Win32::Foundation::{ERROR_INVALID_THREAD_ID, LPARAM, WPARAM};
use windows::Win32::Graphics::Direct3D11::{D3D11_TEXTURE2D_DESC, ID3D11Device, ID3D11DeviceContext, ID3D11Texture2D};
use windows::Win32::Graphics::Dxgi::Common::{DXGI_FORMAT_B8G8R8A8_UNORM, DXGI_FORMAT_R8G8B8A8_UNORM};
use windows::Win32::Graphics::Dxgi::{DXGI_ERROR_DEVICE_REMOVED, DXGI_ERROR_DEVICE_RESET};
use windows::Win32::System::Threading::GetCurrentThreadId;
use windows::Win32::System::WinRT::Direct3D11::IDirect3DDxgiInterfaceAccess;
use windows::Win32::System::WinRT::{
    CreateDispatcherQueueController, DQTAT_COM_NONE, DQTYPE_THREAD_CURRENT, DispatcherQueueOptions,
};
use windows::Win32::UI::WindowsAndMessaging::{
    DispatchMessageW, GetMessageW, MSG, PostQuitMessage, PostThreadMessageW, TranslateMessage, WM_QUIT,
};
use windows::core::{HSTRING, IInspectable, Interface};
use windows_future::AsyncActionCompletedHandler;

use crate::backend::{CaptureBackend, EndReason, FrameSink, Subscription};
use crate::capture;
use crate::d3d11::{self, SendDirectX, StagingTexture, create_d3d_device, create_direct3d_device};
use crate::frame::RawFrame;
use crate::monitor::{self, Monitor};
use crate::settings::{CaptureSettings, ColorFormat, CursorCaptureSettings, DrawBorderSettings};
use crate::target::{CaptureTarget, TargetEnumerator};
use crate::window::{self, Window};
use crate::winrt::WinRtGuard;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Graphics Capture API is not supported")]
    Unsupported,
    #[error("Toggling cursor capture is not supported")]
    CursorConfigUnsupported,
    #[error("Toggling the capture border is not supported")]
    BorderConfigUnsupported,
    #[error("Failed to create a capture item for {target}: {reason}")]
    ItemUnavailable { target: String, reason: String, gone: bool },
    #[error("Capture thread panicked")]
    ThreadPanicked,
    #[error("DirectX error: {0}")]
    DirectXError(#[from] d3d11::Error),
    #[error("Windows API error: {0}")]
    WindowsError(#[from] windows::core::Error),
}

impl From<Error> for capture::Error {
    fn from(value: Error) -> Self {
        match value {
            Error::ItemUnavailable { target, gone: true, .. } => Self::TargetLost(target),
            Error::DirectXError(d3d11::Error::WindowsError(e)) | Error::WindowsError(e) => {
                if is_device_lost(&e) {
                    Self::DeviceLost
                } else {
                    Self::CaptureUnsupported(format!("{} (HRESULT {:#010X})", e.message(), e.code().0))
                }
            }
            Error::ThreadPanicked => Self::SessionEnded(EndReason::Failed(String::from("capture thread panicked"))),
            e => Self::CaptureUnsupported(e.to_string()),
        }
    }
}

fn is_device_lost(error: &windows::core::Error) -> bool {
    error.code() == DXGI_ERROR_DEVICE_REMOVED || error.code() == DXGI_ERROR_DEVICE_RESET
}

/// Backend built on `Windows.Graphics.Capture`.
#[derive(Clone, Copy, Debug)]
pub struct GraphicsCaptureBackend {
    _private: (),
}

impl GraphicsCaptureBackend {
    /// # Errors
    ///
    /// Returns `Error::Unsupported` on Windows versions without the Graphics
    /// Capture API.
    #[inline]
    pub fn new() -> Result<Self, Error> {
        if !Self::is_supported()? {
            return Err(Error::Unsupported);
        }

        Ok(Self { _private: () })
    }

    /// Checks if the Graphics Capture API is available.
    ///
    /// # Errors
    ///
    /// Returns an `Error` if the API metadata can't be queried.
    #[inline]
    pub fn is_supported() -> Result<bool, Error> {
        Ok(ApiInformation::IsApiContractPresentByMajor(&HSTRING::from("Windows.Foundation.UniversalApiContract"), 8)?
            && GraphicsCaptureSession::IsSupported()?)
    }

    /// Checks if cursor capture can be toggled.
    ///
    /// # Errors
    ///
    /// Returns an `Error` if the API metadata can't be queried.
    #[inline]
    pub fn is_cursor_toggle_supported() -> Result<bool, Error> {
        Ok(ApiInformation::IsPropertyPresent(
            &HSTRING::from("Windows.Graphics.Capture.GraphicsCaptureSession"),
            &HSTRING::from("IsCursorCaptureEnabled"),
        )?)
    }

    /// Checks if the capture border can be toggled.
    ///
    /// # Errors
    ///
    /// Returns an `Error` if the API metadata can't be queried.
    #[inline]
    pub fn is_border_toggle_supported() -> Result<bool, Error> {
        Ok(ApiInformation::IsPropertyPresent(
            &HSTRING::from("Windows.Graphics.Capture.GraphicsCaptureSession"),
            &HSTRING::from("IsBorderRequired"),
        )?)
    }
}

impl TargetEnumerator for GraphicsCaptureBackend {
    fn enumerate_windows(&self) -> Result<Vec<Window>, window::Error> {
        Window::enumerate()
    }

    fn enumerate_monitors(&self) -> Result<Vec<Monitor>, monitor::Error> {
        Monitor::enumerate()
    }

    fn foreground_window(&self) -> Result<Window, window::Error> {
        Window::foreground()
    }

    fn refresh_window(&self, window: &Window) -> Result<Window, window::Error> {
        window.refresh()
    }

    fn refresh_monitor(&self, monitor: &Monitor) -> Result<Monitor, monitor::Error> {
        monitor.refresh()
    }
}

impl CaptureBackend for GraphicsCaptureBackend {
    type Subscription = GraphicsCaptureSubscription;

    fn subscribe(
        &self,
        target: &CaptureTarget,
        settings: &CaptureSettings,
        sink: FrameSink,
    ) -> Result<Self::Subscription, capture::Error> {
        let target = target.clone();
        let settings = *settings;
        let (ready_sender, ready_receiver) = mpsc::channel::<Result<u32, Error>>();
        let (done_sender, done_receiver) = mpsc::channel::<()>();

        let thread = thread::Builder::new()
            .name(String::from("pixel-forge-capture"))
            .spawn(move || {
                let mut ready = Some(ready_sender);

                if let Err(e) = run_capture_thread(&target, &settings, &sink, &mut ready) {
                    match ready.take() {
                        Some(ready) => {
                            let _ = ready.send(Err(e));
                        }
                        None => {
                            error!("Capture thread failed: {e}");
                            sink.end(EndReason::Failed(e.to_string()));
                        }
                    }
                }

                let _ = done_sender.send(());
            })
            .map_err(|e| capture::Error::CaptureUnsupported(format!("failed to spawn capture thread: {e}")))?;

        match ready_receiver.recv() {
            Ok(Ok(thread_id)) => {
                debug!("Capture thread {thread_id} is live");
                Ok(GraphicsCaptureSubscription { thread: Some(thread), thread_id, done: done_receiver })
            }
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e.into())
            }
            Err(_) => {
                let _ = thread.join();
                Err(Error::ThreadPanicked.into())
            }
        }
    }
}

/// Live capture thread of a [`GraphicsCaptureBackend`] session.
pub struct GraphicsCaptureSubscription {
    thread: Option<JoinHandle<()>>,
    thread_id: u32,
    done: mpsc::Receiver<()>,
}

impl GraphicsCaptureSubscription {
    fn shutdown(&mut self, timeout: Duration) -> Result<(), capture::Error> {
        let Some(thread) = self.thread.take() else {
            return Ok(());
        };
        let deadline = Instant::now().checked_add(timeout);

        trace!("Posting WM_QUIT to capture thread {}", self.thread_id);
        loop {
            match unsafe { PostThreadMessageW(self.thread_id, WM_QUIT, WPARAM::default(), LPARAM::default()) } {
                Ok(()) => break,
                Err(e) => {
                    if thread.is_finished() {
                        break;
                    }

                    if e.code() != ERROR_INVALID_THREAD_ID.to_hresult() {
                        return Err(e.into());
                    }

                    if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                        return Err(capture::Error::Timeout);
                    }

                    warn!("Capture thread is not in its message loop yet");
                    thread::sleep(Duration::from_millis(1));
                }
            }
        }

        let done = match deadline {
            Some(deadline) => self.done.recv_timeout(deadline.saturating_duration_since(Instant::now())),
            None => self.done.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };

        match done {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                thread.join().map_err(|_| capture::Error::from(Error::ThreadPanicked))?;
                Ok(())
            }
            Err(RecvTimeoutError::Timeout) => Err(capture::Error::Timeout),
        }
    }
}

impl Subscription for GraphicsCaptureSubscription {
    fn close(mut self, timeout: Duration) -> Result<(), capture::Error> {
        self.shutdown(timeout)
    }
}

impl Drop for GraphicsCaptureSubscription {
    fn drop(&mut self) {
        if self.thread.is_some()
            && let Err(e) = self.shutdown(CaptureSettings::DEFAULT_STOP_TIMEOUT)
        {
            error!("Dropped capture subscription was not torn down: {e}");
        }
    }
}

fn run_capture_thread(
    target: &CaptureTarget,
    settings: &CaptureSettings,
    sink: &FrameSink,
    ready: &mut Option<mpsc::Sender<Result<u32, Error>>>,
) -> Result<(), Error> {
    trace!("Initializing WinRT");
    let _winrt = WinRtGuard::new()?;

    trace!("Creating a dispatcher queue for the capture thread");
    let options = DispatcherQueueOptions {
        dwSize: mem::size_of::<DispatcherQueueOptions>() as u32,
        threadType: DQTYPE_THREAD_CURRENT,
        apartmentType: DQTAT_COM_NONE,
    };
    let controller = unsafe { CreateDispatcherQueueController(options)? };

    let thread_id = unsafe { GetCurrentThreadId() };
    debug!("Capture thread id: {thread_id}");

    // A target that vanished since `start` re-validated it is lost, any other
    // refusal means it can't be captured.
    let item = match target {
        CaptureTarget::Window(window) => {
            GraphicsCaptureItem::try_from(window).map_err(|e| (e.to_string(), window.refresh().is_err()))
        }
        CaptureTarget::Monitor(monitor) => {
            GraphicsCaptureItem::try_from(monitor).map_err(|e| (e.to_string(), monitor.refresh().is_err()))
        }
    }
    .map_err(|(reason, gone)| Error::ItemUnavailable { target: target.to_string(), reason, gone })?;

    info!("Starting capture of {target}");
    let mut capture = GraphicsCaptureApi::new(item, settings, sink)?;
    capture.start_capture(settings)?;

    if let Some(ready) = ready.take() {
        let _ = ready.send(Ok(thread_id));
    }

    trace!("Entering message loop");
    pump_messages();

    trace!("Shutting down dispatcher queue");
    let async_action = controller.ShutdownQueueAsync()?;
    async_action.SetCompleted(&AsyncActionCompletedHandler::new(move |_, _| -> Result<(), windows::core::Error> {
        unsafe { PostQuitMessage(0) };
        Ok(())
    }))?;

    trace!("Entering final message loop");
    pump_messages();

    info!("Stopping capture of {target}");
    capture.stop_capture();

    Ok(())
}

fn pump_messages() {
    let mut message = MSG::default();
    unsafe {
        while GetMessageW(&mut message, None, 0, 0).as_bool() {
            let _ = TranslateMessage(&message);
            DispatchMessageW(&message);
        }
    }
}

const fn pixel_format(color_format: ColorFormat) -> DirectXPixelFormat {
    match color_format {
        ColorFormat::Bgra8 => DirectXPixelFormat::B8G8R8A8UIntNormalized,
        ColorFormat::Rgba8 => DirectXPixelFormat::R8G8B8A8UIntNormalized,
    }
}

/// Per-subscription state touched by the frame arrived handler.
struct FrameArrival {
    d3d_device: SendDirectX<ID3D11Device>,
    d3d_device_context: SendDirectX<ID3D11DeviceContext>,
    direct3d_device: SendDirectX<IDirect3DDevice>,
    staging: Option<SendDirectX<StagingTexture>>,
    last_size: SizeInt32,
    color_format: ColorFormat,
}

impl FrameArrival {
    fn on_frame_arrived(&mut self, frame_pool: &Direct3D11CaptureFramePool, sink: &FrameSink) -> Result<(), Error> {
        let frame = frame_pool.TryGetNextFrame()?;
        let content_size = frame.ContentSize()?;

        if content_size.Width != self.last_size.Width || content_size.Height != self.last_size.Height {
            info!(
                "Size changed from {}x{} to {}x{}, recreating frame pool",
                self.last_size.Width, self.last_size.Height, content_size.Width, content_size.Height,
            );
            frame_pool.Recreate(&self.direct3d_device.0, pixel_format(self.color_format), 1, content_size)?;
            self.last_size = content_size;

            return Ok(());
        }

        let surface = frame.Surface()?.cast::<IDirect3DDxgiInterfaceAccess>()?;
        let texture = unsafe { surface.GetInterface::<ID3D11Texture2D>()? };

        let mut desc = D3D11_TEXTURE2D_DESC::default();
        unsafe { texture.GetDesc(&mut desc) };

        let format = match desc.Format {
            DXGI_FORMAT_B8G8R8A8_UNORM => ColorFormat::Bgra8,
            DXGI_FORMAT_R8G8B8A8_UNORM => ColorFormat::Rgba8,
            other => {
                warn!("Skipping frame with unexpected surface format {}", other.0);
                return Ok(());
            }
        };

        if !self.staging.as_ref().is_some_and(|staging| staging.0.fits(&desc)) {
            trace!("Creating {}x{} staging texture", desc.Width, desc.Height);
            let staging = StagingTexture::new(&self.d3d_device.0, desc.Width, desc.Height, desc.Format)?;
            self.staging = Some(SendDirectX::new(staging));
        }

        let Some(staging) = self.staging.as_ref() else {
            return Ok(());
        };

        let pushed = staging.0.read(&self.d3d_device_context.0, &texture, |data, row_pitch| {
            RawFrame::new(data, desc.Width, desc.Height, row_pitch, format).map(|raw| sink.push(&raw))
        })?;

        if let Err(e) = pushed {
            warn!("Skipping malformed frame: {e}");
        }

        Ok(())
    }

    fn device_removed(&self) -> bool {
        unsafe { self.d3d_device.0.GetDeviceRemovedReason() }.is_err()
    }
}

/// OS objects of one capture, alive for the lifetime of the capture thread.
struct GraphicsCaptureApi {
    item: GraphicsCaptureItem,
    frame_pool: Option<Direct3D11CaptureFramePool>,
    session: Option<GraphicsCaptureSession>,
    closed_token: Option<i64>,
    frame_arrived_token: Option<i64>,
}

impl GraphicsCaptureApi {
    fn new(item: GraphicsCaptureItem, settings: &CaptureSettings, sink: &FrameSink) -> Result<Self, Error> {
        trace!("Creating DirectX devices");
        let (d3d_device, d3d_device_context) = create_d3d_device()?;
        let direct3d_device = create_direct3d_device(&d3d_device)?;

        trace!("Creating frame pool");
        let size = item.Size()?;
        let frame_pool =
            Direct3D11CaptureFramePool::Create(&direct3d_device, pixel_format(settings.color_format()), 1, size)?;

        trace!("Creating capture session");
        let session = frame_pool.CreateCaptureSession(&item)?;

        let closed_token = item.Closed(&TypedEventHandler::<GraphicsCaptureItem, IInspectable>::new({
            let sink = sink.clone();

            move |_, _| {
                sink.end(EndReason::TargetClosed);
                unsafe { PostQuitMessage(0) };

                Ok(())
            }
        }))?;

        let frame_arrived_token =
            frame_pool.FrameArrived(&TypedEventHandler::<Direct3D11CaptureFramePool, IInspectable>::new({
                let sink = sink.clone();
                let frame_pool = frame_pool.clone();
                let arrival = Mutex::new(FrameArrival {
                    d3d_device: SendDirectX::new(d3d_device),
                    d3d_device_context: SendDirectX::new(d3d_device_context),
                    direct3d_device: SendDirectX::new(direct3d_device),
                    staging: None,
                    last_size: size,
                    color_format: settings.color_format(),
                });

                move |_, _| {
                    if sink.is_halted() {
                        return Ok(());
                    }

                    let mut arrival = arrival.lock();
                    if let Err(e) = arrival.on_frame_arrived(&frame_pool, &sink) {
                        let reason =
                            if arrival.device_removed() { EndReason::DeviceLost } else { EndReason::Failed(e.to_string()) };
                        sink.end(reason);
                        unsafe { PostQuitMessage(0) };
                    }

                    Ok(())
                }
            }))?;

        Ok(Self {
            item,
            frame_pool: Some(frame_pool),
            session: Some(session),
            closed_token: Some(closed_token),
            frame_arrived_token: Some(frame_arrived_token),
        })
    }

    fn start_capture(&mut self, settings: &CaptureSettings) -> Result<(), Error> {
        let Some(session) = self.session.as_ref() else {
            return Err(Error::Unsupported);
        };

        match settings.cursor_capture() {
            CursorCaptureSettings::Default => (),
            cursor_capture => {
                if !GraphicsCaptureBackend::is_cursor_toggle_supported()? {
                    return Err(Error::CursorConfigUnsupported);
                }
                session.SetIsCursorCaptureEnabled(cursor_capture == CursorCaptureSettings::WithCursor)?;
            }
        }

        match settings.draw_border() {
            DrawBorderSettings::Default => (),
            draw_border => {
                if !GraphicsCaptureBackend::is_border_toggle_supported()? {
                    return Err(Error::BorderConfigUnsupported);
                }
                session.SetIsBorderRequired(draw_border == DrawBorderSettings::WithBorder)?;
            }
        }

        session.StartCapture()?;

        Ok(())
    }

    fn stop_capture(&mut self) {
        if let Some(token) = self.closed_token.take()
            && let Err(e) = self.item.RemoveClosed(token)
        {
            warn!("Failed to remove closed handler: {e}");
        }

        if let Some(frame_pool) = self.frame_pool.take() {
            if let Some(token) = self.frame_arrived_token.take()
                && let Err(e) = frame_pool.RemoveFrameArrived(token)
            {
                warn!("Failed to remove frame arrived handler: {e}");
            }
            if let Err(e) = frame_pool.Close() {
                warn!("Failed to close frame pool: {e}");
            }
        }

        if let Some(session) = self.session.take()
            && let Err(e) = session.Close()
        {
            warn!("Failed to close capture session: {e}");
        }
    }
}

impl Drop for GraphicsCaptureApi {
    fn drop(&mut self) {
        self.stop_capture();
    }
}

#[cfg(test)]
mod tests {
    use windows::Win32::Foundation::{E_ACCESSDENIED, E_INVALIDARG};

    use super::*;

    fn item_unavailable(gone: bool) -> Error {
        Error::ItemUnavailable { target: String::from("window 'Mail' (0x300)"), reason: String::from("refused"), gone }
    }

    #[test]
    fn vanished_item_is_lost() {
        assert!(matches!(capture::Error::from(item_unavailable(true)), capture::Error::TargetLost(_)));
        assert!(matches!(capture::Error::from(item_unavailable(false)), capture::Error::CaptureUnsupported(_)));
    }

    #[test]
    fn refused_subscription_keeps_hresult() {
        let error = capture::Error::from(Error::WindowsError(E_ACCESSDENIED.into()));

        match error {
            capture::Error::CaptureUnsupported(message) => assert!(message.contains("0x80070005")),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn only_removed_devices_are_lost() {
        let removed = Error::DirectXError(d3d11::Error::WindowsError(DXGI_ERROR_DEVICE_REMOVED.into()));
        let reset = Error::WindowsError(DXGI_ERROR_DEVICE_RESET.into());
        let invalid = Error::DirectXError(d3d11::Error::WindowsError(E_INVALIDARG.into()));

        assert!(matches!(capture::Error::from(removed), capture::Error::DeviceLost));
        assert!(matches!(capture::Error::from(reset), capture::Error::DeviceLost));
        assert!(matches!(capture::Error::from(invalid), capture::Error::CaptureUnsupported(_)));
        assert!(matches!(
            capture::Error::from(Error::DirectXError(d3d11::Error::FeatureLevelNotSatisfied)),
            capture::Error::CaptureUnsupported(_)
        ));
    }
}
