//! Scripted in-process capture backend.
//!
//! Produces padded RGBA frames on its own thread, the way a GPU readback
//! would, and lets tests close the target, lose the device or refuse the
//! next subscription.
#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{self, AtomicBool, AtomicUsize};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use pixel_forge::backend::{CaptureBackend, EndReason, FrameSink, Subscription};
use pixel_forge::frame::RawFrame;
use pixel_forge::settings::{CaptureSettings, ColorFormat};
use pixel_forge::{CaptureTarget, Error, Monitor, TargetEnumerator, Window, monitor, window};

/// Extra bytes at the end of every produced row.
pub const ROW_PADDING: usize = 24;

/// Frame size used for window targets.
pub const WINDOW_SIZE: (u32, u32) = (40, 30);

struct Script {
    windows: Vec<Window>,
    monitors: Vec<Monitor>,
    foreground: Option<isize>,
    refuse_next: bool,
    silent: bool,
    close_stall: Option<Duration>,
    sink: Option<FrameSink>,
    subscriptions: usize,
    closes: usize,
}

/// Fake desktop with two monitors and a handful of windows.
#[derive(Clone)]
pub struct MockBackend {
    script: Arc<Mutex<Script>>,
    producers: Arc<AtomicUsize>,
    interval: Duration,
}

impl MockBackend {
    pub fn new() -> Self {
        let monitors = vec![
            Monitor::new(0x10, r"\\.\DISPLAY1")
                .with_index(1)
                .with_device_string("Mock Display Adapter")
                .with_size(64, 36)
                .with_refresh_rate(60)
                .with_primary(true),
            Monitor::new(0x20, r"\\.\DISPLAY2")
                .with_index(2)
                .with_device_string("Mock Display Adapter")
                .with_size(32, 48)
                .with_refresh_rate(144),
        ];
        let windows = vec![
            Window::new(0x100, "Untitled - Notepad"),
            Window::new(0x200, "Calculator"),
            Window::new(0x300, "Inbox - Mail"),
        ];

        Self {
            script: Arc::new(Mutex::new(Script {
                windows,
                monitors,
                foreground: Some(0x200),
                refuse_next: false,
                silent: false,
                close_stall: None,
                sink: None,
                subscriptions: 0,
                closes: 0,
            })),
            producers: Arc::new(AtomicUsize::new(0)),
            interval: Duration::from_millis(5),
        }
    }

    /// Subscriptions accepted but never delivering a frame.
    pub fn silent() -> Self {
        let backend = Self::new();
        backend.script.lock().silent = true;
        backend
    }

    /// Later subscriptions stop delivering frames.
    pub fn go_silent(&self) {
        self.script.lock().silent = true;
    }

    /// Simulates the user closing the window or unplugging the display.
    pub fn close_target(&self) {
        let sink = self.script.lock().sink.clone();
        if let Some(sink) = sink {
            sink.end(EndReason::TargetClosed);
        }
    }

    /// Simulates a driver reset.
    pub fn lose_device(&self) {
        let sink = self.script.lock().sink.clone();
        if let Some(sink) = sink {
            sink.end(EndReason::DeviceLost);
        }
    }

    pub fn refuse_next_subscribe(&self) {
        self.script.lock().refuse_next = true;
    }

    /// Makes the next subscription close slower than `stall`.
    pub fn stall_close(&self, stall: Duration) {
        self.script.lock().close_stall = Some(stall);
    }

    pub fn remove_window(&self, handle: isize) {
        self.script.lock().windows.retain(|window| window.handle() != handle);
    }

    pub fn remove_monitor(&self, device_name: &str) {
        self.script.lock().monitors.retain(|monitor| monitor.device_name() != device_name);
    }

    pub fn subscriptions(&self) -> usize {
        self.script.lock().subscriptions
    }

    /// Subscriptions closed within their timeout.
    pub fn closes(&self) -> usize {
        self.script.lock().closes
    }

    /// Producer threads that haven't returned yet.
    pub fn live_producers(&self) -> usize {
        self.producers.load(atomic::Ordering::Acquire)
    }

    /// `true` once the latest sink handed to the backend stopped accepting
    /// frames.
    pub fn sink_halted(&self) -> bool {
        self.script.lock().sink.as_ref().is_some_and(FrameSink::is_halted)
    }
}

impl TargetEnumerator for MockBackend {
    fn enumerate_windows(&self) -> Result<Vec<Window>, window::Error> {
        Ok(self.script.lock().windows.clone())
    }

    fn enumerate_monitors(&self) -> Result<Vec<Monitor>, monitor::Error> {
        Ok(self.script.lock().monitors.clone())
    }

    fn foreground_window(&self) -> Result<Window, window::Error> {
        let script = self.script.lock();
        script
            .foreground
            .and_then(|handle| script.windows.iter().find(|window| window.handle() == handle).cloned())
            .ok_or(window::Error::NoForegroundWindow)
    }

    fn refresh_window(&self, window: &Window) -> Result<Window, window::Error> {
        self.script
            .lock()
            .windows
            .iter()
            .find(|candidate| candidate.handle() == window.handle())
            .cloned()
            .ok_or(window::Error::Lost)
    }
}

impl CaptureBackend for MockBackend {
    type Subscription = MockSubscription;

    fn subscribe(
        &self,
        target: &CaptureTarget,
        _settings: &CaptureSettings,
        sink: FrameSink,
    ) -> Result<Self::Subscription, Error> {
        let mut script = self.script.lock();

        if script.refuse_next {
            script.refuse_next = false;
            return Err(Error::CaptureUnsupported(format!("{target} refused by script")));
        }

        script.subscriptions += 1;
        script.sink = Some(sink.clone());

        let (width, height) = target.size_hint().unwrap_or(WINDOW_SIZE);
        let running = Arc::new(AtomicBool::new(true));

        let thread = if script.silent {
            None
        } else {
            let running = running.clone();
            let producers = self.producers.clone();
            let interval = self.interval;
            producers.fetch_add(1, atomic::Ordering::AcqRel);
            Some(thread::spawn(move || {
                produce(&sink, &running, width, height, interval);
                producers.fetch_sub(1, atomic::Ordering::AcqRel);
            }))
        };

        Ok(MockSubscription { script: self.script.clone(), running, thread, stall: script.close_stall.take() })
    }
}

/// Pushes RGBA frames with `ROW_PADDING` bytes of garbage after every row.
///
/// Pixel `(x, y)` of frame `n` is `r = x, g = y, b = n`.
fn produce(sink: &FrameSink, running: &AtomicBool, width: u32, height: u32, interval: Duration) {
    let row_pitch = width as usize * 4 + ROW_PADDING;
    let mut data = vec![0xAB; row_pitch * height as usize];
    let mut n: u8 = 0;

    while running.load(atomic::Ordering::Acquire) && !sink.is_halted() {
        n = n.wrapping_add(1);
        for (y, row) in data.chunks_exact_mut(row_pitch).enumerate() {
            for (x, pixel) in row[..width as usize * 4].chunks_exact_mut(4).enumerate() {
                pixel.copy_from_slice(&[x as u8, y as u8, n, 0xFF]);
            }
        }

        let raw = RawFrame::new(&data, width, height, row_pitch, ColorFormat::Rgba8)
            .expect("produced frames are always valid");
        sink.push(&raw);

        thread::sleep(interval);
    }
}

pub struct MockSubscription {
    script: Arc<Mutex<Script>>,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
    stall: Option<Duration>,
}

impl Subscription for MockSubscription {
    fn close(mut self, timeout: Duration) -> Result<(), Error> {
        self.running.store(false, atomic::Ordering::Release);

        if let Some(stall) = self.stall
            && stall > timeout
        {
            thread::sleep(timeout);
            return Err(Error::Timeout);
        }

        if let Some(thread) = self.thread.take() {
            thread.join().expect("producer thread panicked");
        }
        self.script.lock().closes += 1;

        Ok(())
    }
}

impl Drop for MockSubscription {
    fn drop(&mut self) {
        self.running.store(false, atomic::Ordering::Release);
    }
}
