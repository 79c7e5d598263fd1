//! Fan-in acknowledgement for one broadcast heartbeat ping (C11/C12, §4.10,
//! §9 "Heartbeat fan-in").
//!
//! Every component a ping reaches owns one [`Handler`]. Releasing it — by
//! `Drop`, or by [`Handler::fan_out`] into children representing the same
//! work pushed one level deeper (each session, each key-session) — decrements
//! a shared outstanding-work counter; the ack fires exactly once, when either
//! the last handler is released or a configured timeout elapses first,
//! whichever comes first.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Receives the final ack for a completed (or timed-out) heartbeat
/// procedure. Implemented by [`crate::application_management_server::ApplicationManagementServer`]
/// to push `ServerEvent::HeartbeatAck` back to the parent.
pub trait HeartbeatAckSink: Send + Sync {
    fn ack(&self, id: u64, success: bool);
}

struct Inner {
    id: u64,
    outstanding: AtomicUsize,
    failed: AtomicBool,
    fired: AtomicBool,
    sink: Arc<dyn HeartbeatAckSink>,
}

impl Inner {
    fn release(&self, by: usize) {
        if by == 0 {
            return;
        }
        let prev = self.outstanding.fetch_sub(by, Ordering::AcqRel);
        if prev == by {
            self.fire();
        }
    }

    fn fire(&self) {
        if !self.fired.swap(true, Ordering::AcqRel) {
            self.sink.ack(self.id, !self.failed.load(Ordering::Acquire));
        }
    }
}

/// One unit of outstanding heartbeat work, held by a component the ping has
/// reached (playback, cdm, control, and anything they fan out to in turn).
pub struct Handler {
    inner: Arc<Inner>,
    released: bool,
}

impl Handler {
    /// Marks the procedure as failed. The ack still only fires once every
    /// outstanding handler — including this one — has been released or the
    /// watchdog times out.
    pub fn mark_failed(&self) {
        self.inner.failed.store(true, Ordering::Release);
    }

    /// Splits this handler into `n` children that together represent the
    /// same outstanding work, for forwarding to `n` sub-components (e.g. one
    /// per attached session). `n == 0` releases this handler immediately.
    #[must_use]
    pub fn fan_out(mut self, n: usize) -> Vec<Handler> {
        if n == 0 {
            return Vec::new();
        }
        self.inner.outstanding.fetch_add(n - 1, Ordering::AcqRel);
        let children = (0..n)
            .map(|_| Handler {
                inner: Arc::clone(&self.inner),
                released: false,
            })
            .collect();
        self.released = true; // work now lives in the children, not this handle
        children
    }
}

impl Drop for Handler {
    fn drop(&mut self) {
        if !self.released {
            self.released = true;
            self.inner.release(1);
        }
    }
}

/// Tracks one broadcast `Ping{id}` end to end.
pub struct HeartbeatProcedure;

impl HeartbeatProcedure {
    /// Hands out one [`Handler`] per top-level participant (playback, cdm,
    /// control per §4.10) and starts a watchdog that forces a failed ack if
    /// `timeout` elapses before every handler (and everything it fans out
    /// to) has been released.
    pub fn start(
        id: u64,
        participant_count: usize,
        timeout: Duration,
        sink: Arc<dyn HeartbeatAckSink>,
    ) -> Vec<Handler> {
        let inner = Arc::new(Inner {
            id,
            outstanding: AtomicUsize::new(participant_count),
            failed: AtomicBool::new(false),
            fired: AtomicBool::new(false),
            sink,
        });

        if participant_count == 0 {
            inner.fire();
            return Vec::new();
        }

        let watchdog = Arc::clone(&inner);
        let spawned = std::thread::Builder::new()
            .name("rialto-heartbeat".into())
            .spawn(move || {
                std::thread::sleep(timeout);
                if !watchdog.fired.load(Ordering::Acquire) {
                    watchdog.failed.store(true, Ordering::Release);
                    watchdog.fire();
                }
            });
        if let Err(e) = spawned {
            tracing::warn!(error = %e, "failed to spawn heartbeat watchdog thread");
        }

        (0..participant_count)
            .map(|_| Handler {
                inner: Arc::clone(&inner),
                released: false,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct RecordingSink {
        acks: Mutex<Vec<(u64, bool)>>,
    }

    impl RecordingSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                acks: Mutex::new(Vec::new()),
            })
        }
    }

    impl HeartbeatAckSink for RecordingSink {
        fn ack(&self, id: u64, success: bool) {
            self.acks.lock().unwrap().push((id, success));
        }
    }

    #[test]
    fn releasing_every_handler_fires_a_successful_ack() {
        let sink = RecordingSink::new();
        let handlers = HeartbeatProcedure::start(1, 3, Duration::from_secs(30), sink.clone());
        assert_eq!(handlers.len(), 3);
        let mut handlers = handlers.into_iter();
        drop(handlers.next());
        drop(handlers.next());
        assert!(sink.acks.lock().unwrap().is_empty());
        drop(handlers.next());
        assert_eq!(*sink.acks.lock().unwrap(), vec![(1, true)]);
    }

    #[test]
    fn mark_failed_still_waits_for_every_release_but_reports_failure() {
        let sink = RecordingSink::new();
        let mut handlers = HeartbeatProcedure::start(7, 2, Duration::from_secs(30), sink.clone());
        handlers[0].mark_failed();
        drop(handlers);
        assert_eq!(*sink.acks.lock().unwrap(), vec![(7, false)]);
    }

    #[test]
    fn fan_out_preserves_total_outstanding_work() {
        let sink = RecordingSink::new();
        let mut handlers = HeartbeatProcedure::start(2, 1, Duration::from_secs(30), sink.clone());
        let root = handlers.remove(0);
        let children = root.fan_out(3);
        assert_eq!(children.len(), 3);
        let mut children = children.into_iter();
        drop(children.next());
        drop(children.next());
        assert!(sink.acks.lock().unwrap().is_empty());
        drop(children.next());
        assert_eq!(*sink.acks.lock().unwrap(), vec![(2, true)]);
    }

    #[test]
    fn zero_participants_fires_immediately() {
        let sink = RecordingSink::new();
        let handlers = HeartbeatProcedure::start(9, 0, Duration::from_secs(30), sink.clone());
        assert!(handlers.is_empty());
        assert_eq!(*sink.acks.lock().unwrap(), vec![(9, true)]);
    }

    #[test]
    fn watchdog_fires_a_failed_ack_if_a_handler_is_never_released() {
        let sink = RecordingSink::new();
        let handlers = HeartbeatProcedure::start(3, 1, Duration::from_millis(30), sink.clone());
        std::mem::forget(handlers); // simulate a component that never acks

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while sink.acks.lock().unwrap().is_empty() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(*sink.acks.lock().unwrap(), vec![(3, false)]);
    }
}
