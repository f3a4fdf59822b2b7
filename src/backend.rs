//! Seam between the capture session and the OS capture API.
//!
//! A backend turns a [`CaptureTarget`] into a live subscription whose frames
//! are pushed into a [`FrameSink`] from whatever thread the OS delivers them
//! on.
use std::fmt;
use std::mem;
use std::sync::Arc;
use std::sync::atomic::{self, AtomicU8, AtomicU64};
use std::time::Duration;

use log::{error, warn};
use parking_lot::Mutex;

use crate::capture::{Error, SessionState};
use crate::frame::{Frame, RawFrame};
use crate::frame_slot::FrameSlot;
use crate::settings::CaptureSettings;
use crate::target::{CaptureTarget, TargetEnumerator};

/// Why a session ended without `stop` being called.
#[derive(Eq, PartialEq, Clone, Debug)]
pub enum EndReason {
    /// The window closed or the monitor was disconnected.
    TargetClosed,
    /// The graphics device was removed or reset.
    DeviceLost,
    /// Any other failure reported by the OS.
    Failed(String),
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TargetClosed => f.write_str("capture target was closed"),
            Self::DeviceLost => f.write_str("graphics device was lost"),
            Self::Failed(message) => write!(f, "capture failed: {message}"),
        }
    }
}

/// OS capture API driving a [`crate::capture::Capture`].
pub trait CaptureBackend: TargetEnumerator + Send + Sync + 'static {
    type Subscription: Subscription;

    /// Opens a live capture of `target`.
    ///
    /// Returns once the OS confirmed the subscription. Frames are delivered
    /// through `sink` from then on until the subscription is closed or the
    /// backend calls [`FrameSink::end`].
    ///
    /// # Errors
    ///
    /// Returns `Error::CaptureUnsupported`, `Error::TargetLost` or
    /// `Error::DeviceLost` if the OS refuses the subscription.
    fn subscribe(
        &self,
        target: &CaptureTarget,
        settings: &CaptureSettings,
        sink: FrameSink,
    ) -> Result<Self::Subscription, Error>;
}

/// Handle to a live OS capture.
pub trait Subscription: Send {
    /// Tears the capture down and waits for the OS to confirm it.
    ///
    /// No frame is pushed into the sink after this returns `Ok`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Timeout` if teardown wasn't confirmed within `timeout`,
    /// in which case the OS resources are leaked.
    fn close(self, timeout: Duration) -> Result<(), Error>;
}

/// State shared between a session and the producer feeding it.
pub(crate) struct SessionShared {
    state: AtomicU8,
    pub(crate) slot: FrameSlot,
    frame_cnt: AtomicU64,
    ended: Mutex<Option<EndReason>>,
}

impl SessionShared {
    pub(crate) fn new() -> Self {
        Self {
            state: AtomicU8::new(SessionState::Idle as u8),
            slot: FrameSlot::new(),
            frame_cnt: AtomicU64::new(0),
            ended: Mutex::new(None),
        }
    }

    pub(crate) fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(atomic::Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: SessionState) {
        self.state.store(state as u8, atomic::Ordering::Release);
    }

    /// Moves `from` to `to`, failing if another party changed the state first.
    pub(crate) fn transition(&self, from: SessionState, to: SessionState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, atomic::Ordering::AcqRel, atomic::Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn frame_cnt(&self) -> u64 {
        self.frame_cnt.load(atomic::Ordering::Acquire)
    }

    pub(crate) fn end_reason(&self) -> Option<EndReason> {
        self.ended.lock().clone()
    }

    pub(crate) fn take_end_reason(&self) -> Option<EndReason> {
        self.ended.lock().take()
    }

    /// Prepares for a new start cycle.
    pub(crate) fn reset(&self) {
        self.frame_cnt.store(0, atomic::Ordering::Release);
        *self.ended.lock() = None;
        self.slot.reset();
    }
}

struct Cycle {
    halted: bool,
    spare: Vec<u8>,
}

/// Producer end of a capture session.
///
/// Cloned into the OS frame callbacks. Every clone belongs to a single start
/// cycle, once the session stops or the cycle ends, pushes are dropped.
#[derive(Clone)]
pub struct FrameSink {
    shared: Arc<SessionShared>,
    cycle: Arc<Mutex<Cycle>>,
}

impl FrameSink {
    pub(crate) fn new(shared: Arc<SessionShared>) -> Self {
        Self { shared, cycle: Arc::new(Mutex::new(Cycle { halted: false, spare: Vec::new() })) }
    }

    /// Materializes `raw` into an owned BGRA frame and publishes it.
    ///
    /// Runs on the OS thread. The only lock taken besides the frame slot's is
    /// this cycle's own, which `stop` holds just long enough to halt it.
    pub fn push(&self, raw: &RawFrame<'_>) {
        let mut cycle = self.cycle.lock();
        if cycle.halted {
            return;
        }

        let mut buffer = mem::take(&mut cycle.spare);
        raw.materialize_into(&mut buffer);

        let frame = match Frame::new(buffer, raw.width(), raw.height()) {
            Ok(frame) => frame,
            Err(e) => {
                error!("Dropping captured frame: {e}");
                return;
            }
        };

        self.shared.frame_cnt.fetch_add(1, atomic::Ordering::AcqRel);

        if let Some(previous) = self.shared.slot.publish(frame)
            && let Ok(previous) = Arc::try_unwrap(previous)
        {
            cycle.spare = previous.into_vec();
        }
    }

    /// Ends the session from the producer side.
    ///
    /// The reason is latched and reported by the next consumer call. Has no
    /// effect once the cycle is halted.
    pub fn end(&self, reason: EndReason) {
        let mut cycle = self.cycle.lock();
        if cycle.halted {
            return;
        }
        cycle.halted = true;
        cycle.spare = Vec::new();

        warn!("Capture session ended: {reason}");

        // Latched under the cycle lock, once `halt` returns the reason can't
        // change anymore.
        *self.shared.ended.lock() = Some(reason);
        self.shared.set_state(SessionState::Idle);
        self.shared.slot.close();
    }

    /// `true` once the session stopped listening to this sink.
    #[must_use]
    #[inline]
    pub fn is_halted(&self) -> bool {
        self.cycle.lock().halted
    }

    /// Stops accepting frames. Waits for an in-flight push to finish.
    pub(crate) fn halt(&self) {
        let mut cycle = self.cycle.lock();
        cycle.halted = true;
        cycle.spare = Vec::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::ColorFormat;

    fn sink() -> (Arc<SessionShared>, FrameSink) {
        let shared = Arc::new(SessionShared::new());
        shared.set_state(SessionState::Active);
        let sink = FrameSink::new(shared.clone());
        (shared, sink)
    }

    #[test]
    fn push_publishes_packed_frame() {
        let (shared, sink) = sink();
        let data = [1, 2, 3, 4, 0, 0, 5, 6, 7, 8, 0, 0];
        let raw = RawFrame::new(&data, 1, 2, 6, ColorFormat::Rgba8).unwrap();

        sink.push(&raw);

        let frame = shared.slot.read().unwrap();
        assert_eq!(frame.as_bytes(), &[3, 2, 1, 4, 7, 6, 5, 8]);
        assert_eq!(shared.frame_cnt(), 1);
    }

    #[test]
    fn push_recycles_unreferenced_frames() {
        let (shared, sink) = sink();
        let data = [9; 64];
        let raw = RawFrame::new(&data, 4, 4, 16, ColorFormat::Bgra8).unwrap();

        sink.push(&raw);
        sink.push(&raw);
        assert_eq!(sink.cycle.lock().spare.len(), 64);

        let held = shared.slot.read().unwrap();
        sink.push(&raw);
        assert!(sink.cycle.lock().spare.is_empty());
        assert_eq!(held.sequence(), 2);
        assert_eq!(shared.frame_cnt(), 3);
    }

    #[test]
    fn halted_sink_drops_frames() {
        let (shared, sink) = sink();
        let data = [0; 16];
        let raw = RawFrame::new(&data, 2, 2, 8, ColorFormat::Bgra8).unwrap();

        sink.halt();
        sink.push(&raw);

        assert!(sink.is_halted());
        assert_eq!(shared.frame_cnt(), 0);
        assert!(shared.slot.read().is_err());
    }

    #[test]
    fn end_latches_reason_once() {
        let (shared, sink) = sink();

        sink.end(EndReason::TargetClosed);
        sink.clone().end(EndReason::DeviceLost);

        assert_eq!(shared.state(), SessionState::Idle);
        assert_eq!(shared.end_reason(), Some(EndReason::TargetClosed));
        assert!(shared.slot.is_closed());
    }

    #[test]
    fn end_after_halt_is_ignored() {
        let (shared, sink) = sink();

        sink.halt();
        sink.end(EndReason::Failed(String::from("late")));

        assert_eq!(shared.state(), SessionState::Active);
        assert_eq!(shared.end_reason(), None);
    }

    #[test]
    fn end_racing_halt_never_latches_late() {
        for _ in 0..200 {
            let (shared, sink) = sink();
            let ender = {
                let sink = sink.clone();
                std::thread::spawn(move || sink.end(EndReason::DeviceLost))
            };

            sink.halt();
            let seen = shared.end_reason();
            ender.join().unwrap();

            assert_eq!(shared.end_reason(), seen);
        }
    }

    #[test]
    fn reset_starts_a_fresh_cycle() {
        let (shared, sink) = sink();
        let data = [0; 16];
        let raw = RawFrame::new(&data, 2, 2, 8, ColorFormat::Bgra8).unwrap();
        sink.push(&raw);
        sink.end(EndReason::DeviceLost);

        shared.reset();

        assert_eq!(shared.frame_cnt(), 0);
        assert_eq!(shared.end_reason(), None);
        assert!(!shared.slot.is_closed());
        assert_eq!(shared.slot.sequence(), 1);
    }
}
