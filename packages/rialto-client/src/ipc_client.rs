//! `IpcClient` (C3, §4.3): owns one [`Channel`] and its dedicated event-loop thread.
//!
//! Exactly one `IpcClient` is expected per process (§3.1 invariant); nothing
//! here enforces that beyond documenting it, since enforcing a process-wide
//! singleton is the caller's responsibility per §9's "process-scoped service
//! with explicit initialize/teardown, not ambient global state" guidance.

use std::os::unix::io::{FromRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};

use parking_lot::Mutex;

use rialto_common::blocking_closure::{BlockingClosure, PollClosure, SemaphoreClosure};
use rialto_common::channel::{Channel, EventDescriptor, SubscriptionId};
use rialto_common::error::{RialtoError, RialtoResult};
use rialto_common::protocol::{RpcRequest, RpcResponse, ServerEvent};

use crate::config::RialtoClientConfig;

/// Owns the connected [`Channel`] and the thread that pumps it.
pub struct IpcClient {
    channel: Arc<Channel>,
    event_loop_thread_id: ThreadId,
    join_handle: Mutex<Option<JoinHandle<()>>>,
    shutting_down: Arc<AtomicBool>,
}

impl IpcClient {
    /// Resolves configuration, opens the channel, and spawns the
    /// "rialto-ipc" event-loop thread (§4.3 startup steps 1-3).
    pub fn connect(config: RialtoClientConfig) -> RialtoResult<Arc<Self>> {
        let stream = Self::open_stream(config)?;
        let channel = Channel::new(stream)?;
        Self::spawn(channel)
    }

    fn open_stream(config: RialtoClientConfig) -> RialtoResult<UnixStream> {
        match config {
            RialtoClientConfig::PreopenedFd(fd) => Self::stream_from_fd(fd),
            RialtoClientConfig::SocketPath(path) => UnixStream::connect(&path)
                .map_err(|e| RialtoError::Transport(format!("connect {path} failed: {e}"))),
        }
    }

    fn stream_from_fd(fd: RawFd) -> RialtoResult<UnixStream> {
        if fd < 0 {
            return Err(RialtoError::Configuration(format!(
                "RIALTO_SOCKET_FD must be non-negative, got {fd}"
            )));
        }
        // Safety: the fd is preopened and handed to us by the embedding
        // process specifically to be adopted as a connected socket (§3.1,
        // §6); ownership transfers to the returned `UnixStream`.
        Ok(unsafe { UnixStream::from_raw_fd(fd) })
    }

    fn spawn(channel: Arc<Channel>) -> RialtoResult<Arc<Self>> {
        let shutting_down = Arc::new(AtomicBool::new(false));
        let loop_channel = Arc::clone(&channel);
        let loop_shutting_down = Arc::clone(&shutting_down);

        let join_handle = thread::Builder::new()
            .name("rialto-ipc".into())
            .spawn(move || Self::event_loop(&loop_channel, &loop_shutting_down))
            .map_err(|e| RialtoError::Transport(format!("failed to spawn rialto-ipc: {e}")))?;
        let event_loop_thread_id = join_handle.thread().id();

        Ok(Arc::new(Self {
            channel,
            event_loop_thread_id,
            join_handle: Mutex::new(Some(join_handle)),
            shutting_down,
        }))
    }

    /// `loop { process(); wait(-1) } until process() fails` (§4.3 step 3).
    /// On an unexpected disconnect the loop releases the channel and exits
    /// without reaching back into application code (§4.3 "Unexpected
    /// disconnect").
    fn event_loop(channel: &Arc<Channel>, shutting_down: &AtomicBool) {
        loop {
            if shutting_down.load(Ordering::Acquire) {
                return;
            }
            match channel.process() {
                Ok(_) => {}
                Err(_) => return,
            }
            if !channel.is_connected() {
                return;
            }
            let _ = channel.wait(-1);
        }
    }

    /// Returns the `Poll` closure variant when called from the event-loop
    /// thread, `Semaphore` otherwise (§4.2, §9 "thread-local closure
    /// variant" design note) — the one decision callers must not get wrong,
    /// made here rather than at call sites.
    #[must_use]
    pub fn make_closure(&self) -> Arc<dyn BlockingClosure> {
        if thread::current().id() == self.event_loop_thread_id {
            Arc::new(PollClosure::new(Arc::clone(&self.channel)))
        } else {
            Arc::new(SemaphoreClosure::new())
        }
    }

    /// Issues `request` and blocks the caller until the matching response
    /// arrives or the channel fails.
    pub fn call_blocking(&self, request: RpcRequest) -> RialtoResult<RpcResponse> {
        let slot = Arc::new(Mutex::new(None));
        let closure = self.make_closure();
        self.channel
            .call(request, Arc::clone(&slot), Arc::clone(&closure))?;
        closure.wait();
        slot.lock()
            .take()
            .unwrap_or_else(|| Err(RialtoError::Transport("no response recorded".into())))
    }

    pub fn subscribe<F>(&self, descriptor: EventDescriptor, handler: F) -> SubscriptionId
    where
        F: Fn(ServerEvent) + Send + Sync + 'static,
    {
        self.channel.subscribe(descriptor, handler)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.channel.unsubscribe(id);
    }

    #[must_use]
    pub fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }

    /// `disconnect()`; joins the event-loop thread; the Channel is dropped
    /// along with `self` (§4.3 shutdown).
    pub fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::Release);
        self.channel.disconnect();
        if let Some(handle) = self.join_handle.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for IpcClient {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn connects_over_a_preopened_fd_and_exchanges_a_call() {
        let (client_sock, server_sock) = UnixStream::pair().unwrap();
        let client_fd = {
            use std::os::unix::io::IntoRawFd;
            client_sock.into_raw_fd()
        };

        let client = IpcClient::connect(RialtoClientConfig::PreopenedFd(client_fd)).unwrap();

        let server_channel = Channel::new(server_sock).unwrap();
        server_channel.set_inbound_call_handler({
            let server_channel = Arc::clone(&server_channel);
            move |call_id, _request| {
                server_channel.respond(call_id, RpcResponse::Ack).unwrap();
            }
        });
        let server_thread = thread::spawn(move || {
            let deadline = std::time::Instant::now() + Duration::from_secs(2);
            while std::time::Instant::now() < deadline {
                let _ = server_channel.process();
                thread::sleep(Duration::from_millis(5));
            }
        });

        let response = client.call_blocking(RpcRequest::GetSharedMemory).unwrap();
        assert_eq!(response, RpcResponse::Ack);

        client.shutdown();
        let _ = server_thread.join();
    }

    #[test]
    fn make_closure_picks_semaphore_off_the_event_loop_thread() {
        let (client_sock, _server_sock) = UnixStream::pair().unwrap();
        use std::os::unix::io::IntoRawFd;
        let client_fd = client_sock.into_raw_fd();
        let client = IpcClient::connect(RialtoClientConfig::PreopenedFd(client_fd)).unwrap();

        // This test body runs on neither the event-loop thread nor any
        // thread sharing its id, so the factory must hand back Semaphore.
        let closure = client.make_closure();
        closure.run();
        closure.wait(); // must not deadlock
    }
}
