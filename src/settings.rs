use std::time::Duration;

/// Pixel layout of a source buffer handed over by the OS.
///
/// Published frames are always [`ColorFormat::Bgra8`]; any other layout is
/// normalized by the materializer before the frame reaches the consumer.
#[derive(Eq, PartialEq, Clone, Copy, Debug, Default)]
pub enum ColorFormat {
    /// 8-bit BGRA, the native desktop format.
    #[default]
    Bgra8,
    /// 8-bit RGBA.
    Rgba8,
}

/// Whether the cursor should be drawn into the captured frames.
#[derive(Eq, PartialEq, Clone, Copy, Debug, Default)]
pub enum CursorCaptureSettings {
    /// Keep the API default.
    #[default]
    Default,
    WithCursor,
    WithoutCursor,
}

/// Whether the OS draws its yellow capture border around the target.
#[derive(Eq, PartialEq, Clone, Copy, Debug, Default)]
pub enum DrawBorderSettings {
    /// Keep the API default.
    #[default]
    Default,
    WithBorder,
    WithoutBorder,
}

/// Capture session configuration.
///
/// # Example
/// ```
/// use std::time::Duration;
///
/// use pixel_forge::settings::{CaptureSettings, ColorFormat, CursorCaptureSettings};
///
/// let settings = CaptureSettings::default()
///     .with_cursor_capture(CursorCaptureSettings::WithoutCursor)
///     .with_color_format(ColorFormat::Rgba8)
///     .with_first_frame_timeout(Duration::from_millis(500));
///
/// assert_eq!(settings.first_frame_timeout(), Duration::from_millis(500));
/// ```
#[derive(Eq, PartialEq, Clone, Copy, Debug)]
pub struct CaptureSettings {
    cursor_capture: CursorCaptureSettings,
    draw_border: DrawBorderSettings,
    color_format: ColorFormat,
    first_frame_timeout: Duration,
    stop_timeout: Duration,
}

impl CaptureSettings {
    /// Default upper bound for `start(.., await_first_frame = true)`.
    pub const DEFAULT_FIRST_FRAME_TIMEOUT: Duration = Duration::from_secs(5);
    /// Default upper bound for waiting on OS teardown during `stop`.
    pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(5);

    #[must_use]
    #[inline]
    pub const fn with_cursor_capture(mut self, cursor_capture: CursorCaptureSettings) -> Self {
        self.cursor_capture = cursor_capture;
        self
    }

    #[must_use]
    #[inline]
    pub const fn with_draw_border(mut self, draw_border: DrawBorderSettings) -> Self {
        self.draw_border = draw_border;
        self
    }

    /// Pixel format requested from the OS frame pool.
    #[must_use]
    #[inline]
    pub const fn with_color_format(mut self, color_format: ColorFormat) -> Self {
        self.color_format = color_format;
        self
    }

    #[must_use]
    #[inline]
    pub const fn with_first_frame_timeout(mut self, timeout: Duration) -> Self {
        self.first_frame_timeout = timeout;
        self
    }

    #[must_use]
    #[inline]
    pub const fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    #[must_use]
    #[inline]
    pub const fn cursor_capture(&self) -> CursorCaptureSettings {
        self.cursor_capture
    }

    #[must_use]
    #[inline]
    pub const fn draw_border(&self) -> DrawBorderSettings {
        self.draw_border
    }

    #[must_use]
    #[inline]
    pub const fn color_format(&self) -> ColorFormat {
        self.color_format
    }

    #[must_use]
    #[inline]
    pub const fn first_frame_timeout(&self) -> Duration {
        self.first_frame_timeout
    }

    #[must_use]
    #[inline]
    pub const fn stop_timeout(&self) -> Duration {
        self.stop_timeout
    }
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            cursor_capture: CursorCaptureSettings::Default,
            draw_border: DrawBorderSettings::Default,
            color_format: ColorFormat::Bgra8,
            first_frame_timeout: Self::DEFAULT_FIRST_FRAME_TIMEOUT,
            stop_timeout: Self::DEFAULT_STOP_TIMEOUT,
        }
    }
}
