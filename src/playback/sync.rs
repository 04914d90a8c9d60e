//! Shared render clock and the low-priority channel that smooths it.
//!
//! The render path reports positions many times per second; the clock itself
//! only needs the latest one. `ClockMessageCenter` keeps at most two pending
//! positions and drops the oldest, so a slow consumer never backs up the
//! render path.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Receiver, Sender, TrySendError};
use parking_lot::Mutex;

/// Pending positions kept before the oldest is dropped
const MESSAGE_CAPACITY: usize = 2;

/// Render position in project seconds, shared between the audio decode
/// thread, the output callback and the controller
#[derive(Debug, Default)]
pub struct ReferenceClock {
    render_pos: Mutex<f64>,
}

impl ReferenceClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn render_pos(&self) -> f64 {
        *self.render_pos.lock()
    }

    pub fn set(&self, pos: f64) {
        *self.render_pos.lock() = pos;
    }
}

/// Forwards render positions to a handler on the `clock-messages` thread
pub struct ClockMessageCenter {
    sender: Option<Sender<f64>>,
    overflow: Receiver<f64>,
    thread: Option<JoinHandle<()>>,
}

impl ClockMessageCenter {
    pub fn new<F>(mut handler: F) -> Self
    where
        F: FnMut(f64) + Send + 'static,
    {
        let (sender, receiver) = channel::bounded::<f64>(MESSAGE_CAPACITY);
        let overflow = receiver.clone();
        let thread = thread::Builder::new()
            .name("clock-messages".into())
            .spawn(move || {
                for pos in receiver.iter() {
                    handler(pos);
                }
                tracing::trace!("clock message thread exiting");
            })
            .map_err(|e| tracing::error!(error = %e, "failed to spawn clock message thread"))
            .ok();
        Self {
            sender: Some(sender),
            overflow,
            thread,
        }
    }

    /// Message center whose handler writes into `clock`
    pub fn for_clock(clock: Arc<ReferenceClock>) -> Self {
        Self::new(move |pos| clock.set(pos))
    }

    /// Queues `pos`, dropping the oldest pending position when full
    pub fn post(&self, mut pos: f64) {
        let Some(sender) = &self.sender else {
            return;
        };
        loop {
            match sender.try_send(pos) {
                Ok(()) => return,
                Err(TrySendError::Full(rejected)) => {
                    if self.overflow.try_recv().is_ok() {
                        tracing::trace!("clock message dropped");
                    }
                    pos = rejected;
                }
                Err(TrySendError::Disconnected(_)) => return,
            }
        }
    }
}

impl Drop for ClockMessageCenter {
    fn drop(&mut self) {
        self.sender = None;
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                tracing::error!("clock message thread panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    #[test]
    fn test_clock_set_and_read() {
        let clock = ReferenceClock::new();
        assert_eq!(clock.render_pos(), 0.0);
        clock.set(3.25);
        assert_eq!(clock.render_pos(), 3.25);
    }

    #[test]
    fn test_messages_reach_clock() {
        let clock = Arc::new(ReferenceClock::new());
        let center = ClockMessageCenter::for_clock(Arc::clone(&clock));
        center.post(1.5);

        let deadline = Instant::now() + Duration::from_secs(2);
        while clock.render_pos() != 1.5 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(clock.render_pos(), 1.5);
    }

    #[test]
    fn test_slow_handler_keeps_newest() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let gate = Arc::new(Mutex::new(()));
        let blocked = gate.lock();
        let center = {
            let seen = Arc::clone(&seen);
            let gate = Arc::clone(&gate);
            ClockMessageCenter::new(move |pos| {
                let _open = gate.lock();
                seen.lock().push(pos);
            })
        };

        for i in 0..50 {
            center.post(i as f64);
        }
        drop(blocked);
        drop(center);

        let seen = seen.lock();
        // The handler may hold one message while blocked, plus two queued
        assert!(seen.len() <= 1 + MESSAGE_CAPACITY, "got {:?}", *seen);
        assert_eq!(seen.last(), Some(&49.0));
    }
}
