//! Single-slot, latest-wins handoff between the capture thread and consumers.
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::frame::Frame;

#[derive(thiserror::Error, Eq, PartialEq, Clone, Copy, Debug)]
pub enum Error {
    #[error("No frame has been published yet")]
    NoFrameYet,
    #[error("Timed out waiting for a new frame")]
    Timeout,
    #[error("Frame slot was closed while waiting")]
    Closed,
}

#[derive(Default)]
struct SlotState {
    frame: Option<Arc<Frame>>,
    sequence: u64,
    closed: bool,
}

/// Holds the most recently published frame.
///
/// Publishing replaces the current frame and never waits for readers, an
/// unread frame is simply dropped. Sequence numbers start at `1` and grow with
/// every publish for the lifetime of the slot, [`FrameSlot::reset`] does not
/// rewind them.
#[derive(Default)]
pub struct FrameSlot {
    state: Mutex<SlotState>,
    published: Condvar,
}

impl FrameSlot {
    #[must_use]
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes `frame` and returns the frame it replaced.
    ///
    /// The returned frame lets the producer recycle its allocation once no
    /// reader holds it anymore.
    pub fn publish(&self, frame: Frame) -> Option<Arc<Frame>> {
        let previous = {
            let mut state = self.state.lock();
            state.sequence += 1;
            let frame = Arc::new(frame.with_sequence(state.sequence));
            state.frame.replace(frame)
        };

        self.published.notify_all();

        previous
    }

    /// Returns the current frame without blocking.
    ///
    /// # Errors
    ///
    /// Returns `Error::NoFrameYet` if the slot is empty.
    #[inline]
    pub fn read(&self) -> Result<Arc<Frame>, Error> {
        self.state.lock().frame.clone().ok_or(Error::NoFrameYet)
    }

    /// Blocks until a frame newer than sequence `after` is available.
    ///
    /// Passing `0` waits for any frame. `None` waits without a deadline.
    ///
    /// # Errors
    ///
    /// Returns `Error::Timeout` when the deadline passes first and
    /// `Error::Closed` when the slot is closed during the wait.
    pub fn read_blocking(&self, after: u64, timeout: Option<Duration>) -> Result<Arc<Frame>, Error> {
        // A deadline past the end of `Instant` means waiting without one.
        let deadline = timeout.and_then(|timeout| Instant::now().checked_add(timeout));
        let mut state = self.state.lock();

        loop {
            if let Some(frame) = state.frame.as_ref().filter(|frame| frame.sequence() > after) {
                return Ok(frame.clone());
            }

            if state.closed {
                return Err(Error::Closed);
            }

            match deadline {
                Some(deadline) => {
                    if self.published.wait_until(&mut state, deadline).timed_out() {
                        return state
                            .frame
                            .as_ref()
                            .filter(|frame| frame.sequence() > after)
                            .cloned()
                            .ok_or(Error::Timeout);
                    }
                }
                None => self.published.wait(&mut state),
            }
        }
    }

    /// Sequence number of the latest publish, `0` before the first one.
    #[must_use]
    #[inline]
    pub fn sequence(&self) -> u64 {
        self.state.lock().sequence
    }

    /// Drops the current frame. Readers already holding it keep their copy.
    pub fn clear(&self) {
        self.state.lock().frame = None;
    }

    /// Drops the current frame and reopens a closed slot.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.frame = None;
        state.closed = false;
    }

    /// Wakes every blocked reader with `Error::Closed`.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.published.notify_all();
    }

    #[must_use]
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    fn frame(value: u8) -> Frame {
        Frame::new(vec![value; 16], 2, 2).unwrap()
    }

    #[test]
    fn read_before_publish_fails() {
        let slot = FrameSlot::new();

        assert_eq!(slot.read().unwrap_err(), Error::NoFrameYet);
        assert_eq!(slot.sequence(), 0);
    }

    #[test]
    fn latest_publish_wins() {
        let slot = FrameSlot::new();

        assert!(slot.publish(frame(1)).is_none());
        let replaced = slot.publish(frame(2)).unwrap();

        assert_eq!(replaced.sequence(), 1);
        let current = slot.read().unwrap();
        assert_eq!(current.sequence(), 2);
        assert_eq!(current.as_bytes()[0], 2);
    }

    #[test]
    fn sequence_survives_reset() {
        let slot = FrameSlot::new();
        slot.publish(frame(1));
        slot.reset();

        assert_eq!(slot.read().unwrap_err(), Error::NoFrameYet);
        assert!(slot.publish(frame(2)).is_none());
        assert_eq!(slot.read().unwrap().sequence(), 2);
    }

    #[test]
    fn blocking_read_returns_newer_frame_immediately() {
        let slot = FrameSlot::new();
        slot.publish(frame(1));

        let frame = slot.read_blocking(0, Some(Duration::ZERO)).unwrap();

        assert_eq!(frame.sequence(), 1);
    }

    #[test]
    fn blocking_read_times_out_on_stale_frame() {
        let slot = FrameSlot::new();
        slot.publish(frame(1));

        let started = Instant::now();
        let err = slot.read_blocking(1, Some(Duration::from_millis(30))).unwrap_err();

        assert_eq!(err, Error::Timeout);
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn blocking_read_wakes_on_publish() {
        let slot = Arc::new(FrameSlot::new());

        let producer = {
            let slot = slot.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                slot.publish(frame(9));
            })
        };

        let frame = slot.read_blocking(0, Some(Duration::from_secs(5))).unwrap();
        producer.join().unwrap();

        assert_eq!(frame.as_bytes()[0], 9);
    }

    #[test]
    fn close_wakes_blocked_reader() {
        let slot = Arc::new(FrameSlot::new());

        let closer = {
            let slot = slot.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                slot.close();
            })
        };

        let err = slot.read_blocking(0, None).unwrap_err();
        closer.join().unwrap();

        assert_eq!(err, Error::Closed);
        slot.clear();
        assert!(slot.is_closed());
        slot.reset();
        assert!(!slot.is_closed());
    }

    #[test]
    fn unbounded_timeout_waits_without_deadline() {
        let slot = Arc::new(FrameSlot::new());

        let closer = {
            let slot = slot.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                slot.publish(frame(3));
                slot.close();
            })
        };

        let frame = slot.read_blocking(0, Some(Duration::MAX)).unwrap();
        assert_eq!(frame.sequence(), 1);

        let err = slot.read_blocking(1, Some(Duration::MAX)).unwrap_err();
        closer.join().unwrap();
        assert_eq!(err, Error::Closed);
    }

    #[test]
    fn readers_never_see_torn_frames() {
        let slot = Arc::new(FrameSlot::new());

        let producer = {
            let slot = slot.clone();
            thread::spawn(move || {
                for value in 0..=200u8 {
                    slot.publish(Frame::new(vec![value; 4096], 32, 32).unwrap());
                }
            })
        };

        let mut last = 0;
        while last < 201 {
            if let Ok(frame) = slot.read() {
                let first = frame.as_bytes()[0];
                assert!(frame.as_bytes().iter().all(|byte| *byte == first));
                assert!(frame.sequence() >= last);
                last = frame.sequence();
            }
        }
        producer.join().unwrap();
    }
}
