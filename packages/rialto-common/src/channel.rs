//! The multiplexed RPC + event transport shared by client and server ends of
//! the Rialto Unix-domain socket (§3.1 Channel, §4.1).
//!
//! `Channel` owns one connected `UnixStream` and multiplexes three kinds of
//! traffic over it: outbound calls awaiting a response, inbound calls this
//! end must answer, and server-pushed events fanned out to subscribers. It
//! is deliberately synchronous/thread-driven rather than `async`: `spec.md`
//! describes a dedicated event-loop thread with an explicit `wait(timeout_ms)`
//! suspension point, which is a blocking-I/O design, not a `Future`-polling
//! one. `process()` performs one non-blocking drain of whatever is currently
//! readable; `wait()` is the `libc::poll`-based suspension point callers use
//! between drains.

use std::collections::VecDeque;
use std::io::{ErrorKind, Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::blocking_closure::BlockingClosure;
use crate::error::{RialtoError, RialtoResult};
use crate::protocol::{RpcRequest, RpcResponse, ServerEvent};
use crate::wire::{self, CallId, Envelope};

/// Discriminant-only view of [`ServerEvent`], used as a subscription key so
/// handlers don't have to pattern-match the full payload to filter on kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventDescriptor {
    NeedMediaData,
    PlaybackStateChanged,
    NetworkStateChanged,
    PositionChanged,
    Qos,
    SourceFlushed,
    PlaybackError,
    SetLogLevels,
    HeartbeatAck,
    ProcessStateChanged,
}

impl ServerEvent {
    #[must_use]
    pub fn descriptor(&self) -> EventDescriptor {
        match self {
            Self::NeedMediaData { .. } => EventDescriptor::NeedMediaData,
            Self::PlaybackStateChanged { .. } => EventDescriptor::PlaybackStateChanged,
            Self::NetworkStateChanged { .. } => EventDescriptor::NetworkStateChanged,
            Self::PositionChanged { .. } => EventDescriptor::PositionChanged,
            Self::Qos { .. } => EventDescriptor::Qos,
            Self::SourceFlushed { .. } => EventDescriptor::SourceFlushed,
            Self::PlaybackError { .. } => EventDescriptor::PlaybackError,
            Self::SetLogLevels { .. } => EventDescriptor::SetLogLevels,
            Self::HeartbeatAck { .. } => EventDescriptor::HeartbeatAck,
            Self::ProcessStateChanged { .. } => EventDescriptor::ProcessStateChanged,
        }
    }
}

/// Opaque handle returned by [`Channel::subscribe`], passed back to
/// [`Channel::unsubscribe`].
pub type SubscriptionId = u64;

/// The result slot + wake mechanism a caller registers for one outbound call.
struct PendingCall {
    slot: Arc<Mutex<Option<RialtoResult<RpcResponse>>>>,
    closure: Arc<dyn BlockingClosure>,
}

struct Subscription {
    descriptor: EventDescriptor,
    handler: Box<dyn Fn(ServerEvent) + Send + Sync>,
}

/// One connected endpoint of the Rialto RPC/event transport.
///
/// Bidirectional by design: the client uses it to call the server and
/// receive events, while the server's per-connection handler uses the same
/// type to receive calls and push events, answering via [`Channel::respond`].
pub struct Channel {
    stream: Mutex<UnixStream>,
    raw_fd: RawFd,
    read_buf: Mutex<Vec<u8>>,
    pending_calls: DashMap<CallId, PendingCall>,
    subscriptions: DashMap<SubscriptionId, Subscription>,
    inbound_calls: Mutex<Option<Box<dyn Fn(CallId, RpcRequest) + Send + Sync>>>,
    next_call_id: AtomicU64,
    next_subscription_id: AtomicU64,
    connected: AtomicBool,
}

impl Channel {
    #[must_use]
    pub fn new(stream: UnixStream) -> RialtoResult<Arc<Self>> {
        stream
            .set_nonblocking(true)
            .map_err(|e| RialtoError::Transport(format!("set_nonblocking failed: {e}")))?;
        let raw_fd = stream.as_raw_fd();
        Ok(Arc::new(Self {
            stream: Mutex::new(stream),
            raw_fd,
            read_buf: Mutex::new(Vec::new()),
            pending_calls: DashMap::new(),
            subscriptions: DashMap::new(),
            inbound_calls: Mutex::new(None),
            next_call_id: AtomicU64::new(1),
            next_subscription_id: AtomicU64::new(1),
            connected: AtomicBool::new(true),
        }))
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn raw_fd(&self) -> RawFd {
        self.raw_fd
    }

    /// Registers the handler invoked for every [`Envelope::Call`] this end
    /// receives (server side only; clients never set this).
    pub fn set_inbound_call_handler<F>(&self, handler: F)
    where
        F: Fn(CallId, RpcRequest) + Send + Sync + 'static,
    {
        *self.inbound_calls.lock() = Some(Box::new(handler));
    }

    /// Sends `request`, registering `slot`/`closure` under a fresh call id so
    /// a later [`Envelope::Response`] can be matched back to this call.
    /// Returns the assigned id immediately; the caller blocks on `closure`
    /// separately.
    pub fn call(
        &self,
        request: RpcRequest,
        slot: Arc<Mutex<Option<RialtoResult<RpcResponse>>>>,
        closure: Arc<dyn BlockingClosure>,
    ) -> RialtoResult<CallId> {
        if !self.is_connected() {
            return Err(RialtoError::Transport("channel is disconnected".into()));
        }
        let call_id = self.next_call_id.fetch_add(1, Ordering::Relaxed);
        self.pending_calls
            .insert(call_id, PendingCall { slot, closure });
        if let Err(e) = self.write_envelope(&Envelope::Call { call_id, request }) {
            self.pending_calls.remove(&call_id);
            return Err(e);
        }
        Ok(call_id)
    }

    /// Answers an inbound call previously surfaced to the
    /// [`set_inbound_call_handler`] callback.
    pub fn respond(&self, call_id: CallId, response: RpcResponse) -> RialtoResult<()> {
        self.write_envelope(&Envelope::Response { call_id, response })
    }

    /// Pushes an event to the peer (server side only).
    pub fn emit(&self, event: ServerEvent) -> RialtoResult<()> {
        self.write_envelope(&Envelope::Event { event })
    }

    pub fn subscribe<F>(&self, descriptor: EventDescriptor, handler: F) -> SubscriptionId
    where
        F: Fn(ServerEvent) + Send + Sync + 'static,
    {
        let id = self.next_subscription_id.fetch_add(1, Ordering::Relaxed);
        self.subscriptions.insert(
            id,
            Subscription {
                descriptor,
                handler: Box::new(handler),
            },
        );
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.subscriptions.remove(&id);
    }

    fn write_envelope(&self, envelope: &Envelope) -> RialtoResult<()> {
        let mut stream = self.stream.lock();
        match wire::write_frame(&mut *stream, envelope) {
            Ok(()) => Ok(()),
            Err(e) => {
                drop(stream);
                self.disconnect();
                Err(e)
            }
        }
    }

    /// Performs one non-blocking drain of whatever is currently readable,
    /// dispatching every complete frame it accumulates. Returns `Ok(true)`
    /// if at least one frame was dispatched, `Ok(false)` if nothing was
    /// available. Never blocks.
    pub fn process(&self) -> RialtoResult<bool> {
        if !self.is_connected() {
            return Ok(false);
        }

        let mut chunk = [0u8; 64 * 1024];
        let read_result = {
            let mut stream = self.stream.lock();
            stream.read(&mut chunk)
        };

        match read_result {
            Ok(0) => {
                self.disconnect();
                return Err(RialtoError::Transport("peer closed connection".into()));
            }
            Ok(n) => {
                self.read_buf.lock().extend_from_slice(&chunk[..n]);
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {}
            Err(e) => {
                self.disconnect();
                return Err(RialtoError::Transport(format!("read failed: {e}")));
            }
        }

        let envelopes = self.drain_complete_frames()?;
        let dispatched = !envelopes.is_empty();
        for envelope in envelopes {
            self.dispatch(envelope);
        }
        Ok(dispatched)
    }

    /// Parses as many complete length-prefixed frames out of the internal
    /// accumulator as are currently available, leaving any trailing partial
    /// frame buffered for the next call.
    fn drain_complete_frames(&self) -> RialtoResult<VecDeque<Envelope>> {
        let mut buf = self.read_buf.lock();
        let mut out = VecDeque::new();
        loop {
            if buf.len() < 4 {
                break;
            }
            let len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
            if len as u32 > wire::MAX_FRAME_BYTES {
                return Err(RialtoError::Protocol(format!(
                    "frame of {len} bytes exceeds max {}",
                    wire::MAX_FRAME_BYTES
                )));
            }
            if buf.len() < 4 + len {
                break;
            }
            let body = &buf[4..4 + len];
            let envelope: Envelope = serde_json::from_slice(body)
                .map_err(|e| RialtoError::Protocol(format!("failed to decode envelope: {e}")))?;
            out.push_back(envelope);
            buf.drain(0..4 + len);
        }
        Ok(out)
    }

    fn dispatch(&self, envelope: Envelope) {
        match envelope {
            Envelope::Response { call_id, response } => {
                if let Some((_, pending)) = self.pending_calls.remove(&call_id) {
                    *pending.slot.lock() = Some(Ok(response));
                    pending.closure.run();
                }
            }
            Envelope::Call { call_id, request } => {
                if let Some(handler) = self.inbound_calls.lock().as_ref() {
                    handler(call_id, request);
                }
            }
            Envelope::Event { event } => {
                let descriptor = event.descriptor();
                for entry in &self.subscriptions {
                    if entry.descriptor == descriptor {
                        (entry.handler)(event.clone());
                    }
                }
            }
        }
    }

    /// Blocks up to `timeout_ms` (or indefinitely if negative) until the
    /// underlying socket is readable, writable, or hung up. Returns
    /// `Ok(true)` if an event occurred, `Ok(false)` on timeout.
    pub fn wait(&self, timeout_ms: i32) -> RialtoResult<bool> {
        let mut pollfd = libc::pollfd {
            fd: self.raw_fd,
            events: libc::POLLIN | libc::POLLOUT,
            revents: 0,
        };
        let rc = unsafe { libc::poll(&mut pollfd, 1, timeout_ms) };
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == ErrorKind::Interrupted {
                return Ok(false);
            }
            return Err(RialtoError::Transport(format!("poll failed: {err}")));
        }
        Ok(rc > 0)
    }

    /// Performs a dedicated synchronous call that also expects the peer to
    /// pass a file descriptor alongside its response (used only for
    /// `GetSharedMemory`, §4.4's fd handoff — see `rialto_common::fd_passing`).
    ///
    /// This bypasses the normal multiplexed `process()`/dispatch path: it
    /// blocks the calling thread directly on `recvmsg` so the ancillary
    /// `SCM_RIGHTS` data isn't silently dropped by a plain `read()`. Callers
    /// must ensure no other thread is racing a plain `process()` drain on
    /// this channel while the exchange is in flight — in practice this
    /// means doing the shared-memory acquisition once at startup, before
    /// steady-state NeedData/HaveData traffic begins.
    #[cfg(unix)]
    pub fn call_with_fd(&self, request: RpcRequest) -> RialtoResult<(RpcResponse, RawFd)> {
        use crate::fd_passing;

        let call_id = self.next_call_id.fetch_add(1, Ordering::Relaxed);
        let mut stream = self.stream.lock();
        wire::write_frame(&mut *stream, &Envelope::Call { call_id, request })?;

        let mut accumulated = Vec::new();
        let mut received_fd = None;
        loop {
            if received_fd.is_none() {
                match fd_passing::recv_fd(self.raw_fd) {
                    Ok(fd) => received_fd = Some(fd),
                    Err(_) => {} // no ancillary data on this read; keep draining
                }
            }
            let mut chunk = [0u8; 4096];
            let n = stream
                .read(&mut chunk)
                .map_err(|e| RialtoError::Transport(format!("read failed: {e}")))?;
            if n == 0 {
                return Err(RialtoError::Transport(
                    "peer closed during fd exchange".into(),
                ));
            }
            accumulated.extend_from_slice(&chunk[..n]);

            if accumulated.len() >= 4 {
                let len = u32::from_le_bytes([
                    accumulated[0],
                    accumulated[1],
                    accumulated[2],
                    accumulated[3],
                ]) as usize;
                if accumulated.len() >= 4 + len {
                    let body = &accumulated[4..4 + len];
                    let envelope: Envelope = serde_json::from_slice(body).map_err(|e| {
                        RialtoError::Protocol(format!("failed to decode envelope: {e}"))
                    })?;
                    let fd = received_fd.ok_or_else(|| {
                        RialtoError::Protocol("peer sent no fd during GetSharedMemory".into())
                    })?;
                    return match envelope {
                        Envelope::Response {
                            call_id: response_call_id,
                            response,
                        } if response_call_id == call_id => Ok((response, fd)),
                        _ => Err(RialtoError::Protocol(
                            "unexpected envelope during fd exchange".into(),
                        )),
                    };
                }
            }
        }
    }

    /// Answers an inbound `GetSharedMemory` call while also handing the peer
    /// a file descriptor via `SCM_RIGHTS`, symmetric to [`Self::call_with_fd`]
    /// on the receiving end: the fd is sent as ancillary data on the socket
    /// before the framed response body, so the peer's blocking `recvmsg`
    /// loop picks it up alongside the `Envelope::Response`.
    #[cfg(unix)]
    pub fn respond_with_fd(
        &self,
        call_id: CallId,
        response: RpcResponse,
        fd: RawFd,
    ) -> RialtoResult<()> {
        use crate::fd_passing;

        let mut stream = self.stream.lock();
        fd_passing::send_fd(self.raw_fd, fd)?;
        match wire::write_frame(&mut *stream, &Envelope::Response { call_id, response }) {
            Ok(()) => Ok(()),
            Err(e) => {
                drop(stream);
                self.disconnect();
                Err(e)
            }
        }
    }

    /// Tears down the connection: marks it disconnected, shuts down the
    /// socket, and fails every still-pending call so its closure's waiter is
    /// woken rather than left blocked forever (§7).
    pub fn disconnect(&self) {
        if !self.connected.swap(false, Ordering::AcqRel) {
            return;
        }
        let _ = self.stream.lock().shutdown(std::net::Shutdown::Both);
        for entry in self.pending_calls.iter() {
            let pending = entry.value();
            *pending.slot.lock() = Some(Err(RialtoError::Transport(
                "channel disconnected before response arrived".into(),
            )));
            pending.closure.run();
        }
        self.pending_calls.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blocking_closure::SemaphoreClosure;
    use std::thread;
    use std::time::Duration;

    fn socketpair() -> (UnixStream, UnixStream) {
        UnixStream::pair().unwrap()
    }

    #[test]
    fn call_and_response_round_trip_wakes_closure() {
        let (client_sock, server_sock) = socketpair();
        let client = Channel::new(client_sock).unwrap();
        let server = Channel::new(server_sock).unwrap();

        server.set_inbound_call_handler({
            let server = Arc::clone(&server);
            move |call_id, request| {
                assert_eq!(request, RpcRequest::GetSharedMemory);
                server
                    .respond(
                        call_id,
                        RpcResponse::SharedMemory {
                            fd_token: 1,
                            size: 4096,
                        },
                    )
                    .unwrap();
            }
        });

        let slot = Arc::new(Mutex::new(None));
        let closure = Arc::new(SemaphoreClosure::new());
        client
            .call(RpcRequest::GetSharedMemory, Arc::clone(&slot), closure.clone())
            .unwrap();

        // Drive both ends until the closure is signaled or we time out.
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while !closure.is_signaled() && std::time::Instant::now() < deadline {
            let _ = server.process();
            let _ = client.process();
            thread::sleep(Duration::from_millis(5));
        }

        closure.wait();
        let response = slot.lock().take().unwrap().unwrap();
        assert_eq!(
            response,
            RpcResponse::SharedMemory {
                fd_token: 1,
                size: 4096
            }
        );
    }

    #[test]
    fn event_dispatch_only_reaches_matching_subscription() {
        let (a, b) = socketpair();
        let receiver = Channel::new(a).unwrap();
        let sender = Channel::new(b).unwrap();

        let received = Arc::new(Mutex::new(Vec::new()));
        let received_clone = Arc::clone(&received);
        receiver.subscribe(EventDescriptor::PositionChanged, move |event| {
            received_clone.lock().push(event);
        });
        receiver.subscribe(EventDescriptor::Qos, |_event| {
            panic!("Qos handler should never fire for a PositionChanged event");
        });

        sender
            .emit(ServerEvent::PositionChanged {
                session_id: 1,
                position_ns: 42,
            })
            .unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while received.lock().is_empty() && std::time::Instant::now() < deadline {
            let _ = receiver.process();
            thread::sleep(Duration::from_millis(5));
        }

        let events = received.lock();
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], ServerEvent::PositionChanged { .. }));
    }

    #[test]
    fn disconnect_fails_pending_calls_and_wakes_their_closures() {
        let (client_sock, server_sock) = socketpair();
        let client = Channel::new(client_sock).unwrap();
        drop(server_sock); // peer gone before any response arrives

        let slot = Arc::new(Mutex::new(None));
        let closure = Arc::new(SemaphoreClosure::new());
        client
            .call(RpcRequest::GetSharedMemory, Arc::clone(&slot), closure.clone())
            .unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while !closure.is_signaled() && std::time::Instant::now() < deadline {
            let _ = client.process();
            thread::sleep(Duration::from_millis(5));
        }

        closure.wait();
        let result = slot.lock().take().unwrap();
        assert!(result.is_err());
        assert!(!client.is_connected());
    }

    #[test]
    fn wait_times_out_when_nothing_is_pending() {
        let (a, _b) = socketpair();
        let channel = Channel::new(a).unwrap();
        // Writable immediately (empty send buffer), so this mostly exercises
        // that wait() returns promptly rather than hanging past the timeout.
        let _ = channel.wait(20);
    }
}
