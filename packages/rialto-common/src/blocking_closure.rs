//! Turns an async RPC completion into a synchronous wait (§3.1 BlockingClosure, §4.2).
//!
//! Two variants exist because a single thread runs each [`Channel`](crate::channel::Channel)'s
//! event loop: that thread must pump the loop itself while waiting (`Poll`),
//! while every other thread can simply block on a semaphore that the loop
//! posts to from inside `process()` (`Semaphore`). The design note in
//! `spec.md` §9 calls the variant choice "the one decision callers must not
//! get wrong", so it's made once, by [`crate::channel::ClosureFactory`],
//! rather than left to call sites.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::channel::Channel;
use crate::error::RialtoResult;

/// A single-shot synchronization object completed by a [`Channel`] when a
/// call's response arrives.
pub trait BlockingClosure: Send + Sync {
    /// Transitions pending → signaled. Called by the `Channel` on response
    /// arrival; idempotent if called more than once.
    fn run(&self);

    /// Blocks the caller until [`run`](Self::run) has been called.
    fn wait(&self);

    /// Returns `true` once `run()` has fired, without blocking.
    fn is_signaled(&self) -> bool;
}

/// Waited on from the thread that owns the channel's event loop: draining
/// the channel itself while waiting, since no other thread will pump it.
pub struct PollClosure {
    channel: Arc<Channel>,
    signaled: AtomicBool,
}

impl PollClosure {
    #[must_use]
    pub fn new(channel: Arc<Channel>) -> Self {
        Self {
            channel,
            signaled: AtomicBool::new(false),
        }
    }
}

impl BlockingClosure for PollClosure {
    fn run(&self) {
        self.signaled.store(true, Ordering::Release);
    }

    fn wait(&self) {
        while !self.signaled.load(Ordering::Acquire) {
            // A channel error here means the connection is gone; every
            // pending closure (including this one) gets `run()` called by
            // `Channel::disconnect`, so the loop will observe `signaled`
            // on its next check rather than spin forever.
            let _: RialtoResult<bool> = self.channel.process();
            if self.signaled.load(Ordering::Acquire) {
                break;
            }
            let _: RialtoResult<bool> = self.channel.wait(50);
        }
    }

    fn is_signaled(&self) -> bool {
        self.signaled.load(Ordering::Acquire)
    }
}

/// Waited on from any thread other than the channel's event-loop thread:
/// blocks on a counting semaphore (modeled with `parking_lot`'s `Mutex` +
/// `Condvar`, since `std` has no semaphore primitive) posted to by `run()`.
pub struct SemaphoreClosure {
    state: Mutex<bool>,
    condvar: Condvar,
}

impl SemaphoreClosure {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(false),
            condvar: Condvar::new(),
        }
    }
}

impl Default for SemaphoreClosure {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockingClosure for SemaphoreClosure {
    fn run(&self) {
        let mut signaled = self.state.lock();
        *signaled = true;
        self.condvar.notify_all();
    }

    fn wait(&self) {
        let mut signaled = self.state.lock();
        while !*signaled {
            self.condvar.wait(&mut signaled);
        }
    }

    fn is_signaled(&self) -> bool {
        *self.state.lock()
    }
}
