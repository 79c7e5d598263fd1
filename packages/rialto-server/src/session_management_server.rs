//! Client-facing RPC server (C10, §4.9): accepts guest connections, creates
//! and tears down playback sessions, and dispatches the per-session RPC
//! surface to a [`ServerSessionService`].
//!
//! One dedicated accept-loop thread per [`SessionManagementServer`]
//! (`addSocket`+`start`, §4.9), and one dedicated pump thread per accepted
//! connection — each connection's `Channel` is the same synchronous,
//! poll-driven type the client pumps from its own "rialto-ipc" thread
//! (`rialto_client::ipc_client::IpcClient::event_loop`), just answering
//! calls here instead of issuing them. Per-connection cleanup on
//! disconnect uses an RAII guard, grounded on the teacher's
//! `WsConnectionManager`/`ConnectionGuard` (`api/ws_connection.rs`).

use std::io::ErrorKind;
use std::os::unix::io::{FromRawFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;

use rialto_common::channel::Channel;
use rialto_common::error::{RialtoError, RialtoResult};
use rialto_common::protocol::{
    HaveDataStatus, RequestId, RpcRequest, RpcResponse, ServerEvent, SessionId, SourceId,
};
use rialto_common::wire::CallId;

use crate::heartbeat::Handler;
use crate::server_session_service::{PlaybackEventSink, ServerSessionService};
use crate::session_server_manager::{SessionManagementControl, SocketDescriptor};
use crate::shm_backing_store::ShmBackingStore;

/// Creates the server-side session object for a freshly-assigned
/// `session_id`, wired to push its events over `sink`. Implemented by
/// whatever owns the real decoder pipeline; [`NoopSessionServiceFactory`]
/// stands in for wiring and tests.
pub trait SessionServiceFactory: Send + Sync {
    fn create(
        &self,
        session_id: SessionId,
        sink: Arc<dyn PlaybackEventSink>,
    ) -> RialtoResult<Arc<dyn ServerSessionService>>;
}

/// Hands back [`crate::server_session_service::StubSessionService`] for
/// every session, ignoring `sink`. The default for `apps/server` until a
/// real decoder pipeline is wired in, and sufficient to exercise the full
/// RPC dispatch surface in tests.
pub struct NoopSessionServiceFactory;

impl SessionServiceFactory for NoopSessionServiceFactory {
    fn create(
        &self,
        _session_id: SessionId,
        _sink: Arc<dyn PlaybackEventSink>,
    ) -> RialtoResult<Arc<dyn ServerSessionService>> {
        Ok(Arc::new(crate::server_session_service::StubSessionService))
    }
}

/// Pushes a [`ServerSessionService`]'s events over the connection's
/// [`Channel`] as the matching [`ServerEvent`] variant.
struct ChannelEventSink {
    channel: Arc<Channel>,
}

impl PlaybackEventSink for ChannelEventSink {
    fn playback_state_changed(
        &self,
        session_id: SessionId,
        state: rialto_common::PlaybackStateChange,
    ) {
        self.emit(ServerEvent::PlaybackStateChanged { session_id, state });
    }
    fn network_state_changed(
        &self,
        session_id: SessionId,
        state: rialto_common::NetworkStateChange,
    ) {
        self.emit(ServerEvent::NetworkStateChanged { session_id, state });
    }
    fn position_changed(&self, session_id: SessionId, position_ns: i64) {
        self.emit(ServerEvent::PositionChanged {
            session_id,
            position_ns,
        });
    }
    fn need_media_data(
        &self,
        session_id: SessionId,
        source_id: SourceId,
        frame_count: u32,
        request_id: RequestId,
        shm_info: rialto_common::ShmInfo,
    ) {
        self.emit(ServerEvent::NeedMediaData {
            session_id,
            source_id,
            frame_count,
            request_id,
            shm_info,
        });
    }
    fn qos(&self, session_id: SessionId, info: rialto_common::QosInfo) {
        self.emit(ServerEvent::Qos { session_id, info });
    }
    fn source_flushed(&self, session_id: SessionId, source_id: SourceId) {
        self.emit(ServerEvent::SourceFlushed {
            session_id,
            source_id,
        });
    }
    fn playback_error(
        &self,
        session_id: SessionId,
        source_id: SourceId,
        kind: rialto_common::PlaybackErrorKind,
    ) {
        self.emit(ServerEvent::PlaybackError {
            session_id,
            source_id,
            kind,
        });
    }
}

impl ChannelEventSink {
    fn emit(&self, event: ServerEvent) {
        if let Err(e) = self.channel.emit(event) {
            tracing::warn!(error = %e, "failed to emit session event to guest");
        }
    }
}

struct Inner {
    factory: Arc<dyn SessionServiceFactory>,
    shm: ShmBackingStore,
    connections: DashMap<u64, Arc<ConnectionHandler>>,
    next_connection_id: AtomicU64,
    max_playbacks: Mutex<u32>,
}

/// RAII cleanup for one accepted connection's registry entry, grounded on
/// the teacher's `ConnectionGuard` (`api/ws_connection.rs`).
struct ConnectionGuard {
    connection_id: u64,
    inner: Arc<Inner>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.inner.connections.remove(&self.connection_id);
    }
}

struct ConnectionHandler {
    channel: Arc<Channel>,
    sessions: DashMap<SessionId, Arc<dyn ServerSessionService>>,
    next_session_id: AtomicI32,
    next_fd_token: AtomicU32,
    inner: Arc<Inner>,
}

impl ConnectionHandler {
    fn spawn(stream: UnixStream, inner: Arc<Inner>) -> RialtoResult<()> {
        let channel = Channel::new(stream)?;
        let connection_id = inner.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let handler = Arc::new(Self {
            channel: Arc::clone(&channel),
            sessions: DashMap::new(),
            next_session_id: AtomicI32::new(1),
            next_fd_token: AtomicU32::new(1),
            inner: Arc::clone(&inner),
        });
        inner.connections.insert(connection_id, Arc::clone(&handler));

        channel.set_inbound_call_handler({
            let handler = Arc::clone(&handler);
            move |call_id, request| handler.dispatch(call_id, request)
        });

        let guard = ConnectionGuard {
            connection_id,
            inner,
        };
        thread::Builder::new()
            .name(format!("rialto-session-{connection_id}"))
            .spawn(move || {
                let _guard = guard;
                Self::pump(&handler);
            })
            .map_err(|e| RialtoError::Transport(format!("failed to spawn connection thread: {e}")))?;
        Ok(())
    }

    fn pump(handler: &Arc<ConnectionHandler>) {
        loop {
            match handler.channel.process() {
                Ok(_) => {}
                Err(_) => return,
            }
            if !handler.channel.is_connected() {
                return;
            }
            let _ = handler.channel.wait(-1);
        }
    }

    fn dispatch(self: &Arc<Self>, call_id: CallId, request: RpcRequest) {
        if matches!(request, RpcRequest::GetSharedMemory) {
            return self.respond_get_shared_memory(call_id);
        }
        let response = match self.handle(request) {
            Ok(response) => response,
            Err(e) => RpcResponse::Failed {
                reason: e.to_string(),
            },
        };
        if let Err(e) = self.channel.respond(call_id, response) {
            tracing::warn!(error = %e, "failed to respond on the session-management channel");
        }
    }

    fn respond_get_shared_memory(&self, call_id: CallId) {
        match self.inner.shm.dup_fd() {
            Ok(fd) => {
                let fd_token = self.next_fd_token.fetch_add(1, Ordering::Relaxed);
                let response = RpcResponse::SharedMemory {
                    fd_token,
                    size: self.inner.shm.size(),
                };
                if let Err(e) = self.channel.respond_with_fd(call_id, response, fd) {
                    tracing::warn!(error = %e, "failed to hand shared memory fd to guest");
                }
            }
            Err(e) => {
                let _ = self.channel.respond(
                    call_id,
                    RpcResponse::Failed {
                        reason: e.to_string(),
                    },
                );
            }
        }
    }

    fn session(&self, session_id: SessionId) -> RialtoResult<Arc<dyn ServerSessionService>> {
        self.sessions
            .get(&session_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| RialtoError::State(format!("unknown session_id {session_id}")))
    }

    fn handle(self: &Arc<Self>, request: RpcRequest) -> RialtoResult<RpcResponse> {
        match request {
            RpcRequest::GetSharedMemory => unreachable!("handled by dispatch"),
            RpcRequest::CreateSession => {
                let max_playbacks = *self.inner.max_playbacks.lock();
                if self.sessions.len() as u32 >= max_playbacks {
                    return Err(RialtoError::State(format!(
                        "max_playbacks limit ({max_playbacks}) reached on this connection"
                    )));
                }
                let session_id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
                let sink: Arc<dyn PlaybackEventSink> = Arc::new(ChannelEventSink {
                    channel: Arc::clone(&self.channel),
                });
                let service = self.inner.factory.create(session_id, sink)?;
                self.sessions.insert(session_id, service);
                Ok(RpcResponse::SessionCreated { session_id })
            }
            RpcRequest::DestroySession { session_id } => {
                self.sessions.remove(&session_id);
                Ok(RpcResponse::Ack)
            }
            RpcRequest::Load {
                session_id,
                mime_type,
            } => {
                self.session(session_id)?.load(&mime_type)?;
                Ok(RpcResponse::Ack)
            }
            RpcRequest::AttachSource { session_id, source } => {
                let source_id = self.session(session_id)?.attach_source(source)?;
                Ok(RpcResponse::SourceAttached { source_id })
            }
            RpcRequest::RemoveSource {
                session_id,
                source_id,
            } => {
                self.session(session_id)?.remove_source(source_id)?;
                Ok(RpcResponse::Ack)
            }
            RpcRequest::AllSourcesAttached { session_id } => {
                self.session(session_id)?.all_sources_attached()?;
                Ok(RpcResponse::Ack)
            }
            RpcRequest::Play { session_id } => {
                self.session(session_id)?.play()?;
                Ok(RpcResponse::Ack)
            }
            RpcRequest::Pause { session_id } => {
                self.session(session_id)?.pause()?;
                Ok(RpcResponse::Ack)
            }
            RpcRequest::Stop { session_id } => {
                self.session(session_id)?.stop()?;
                Ok(RpcResponse::Ack)
            }
            RpcRequest::SetPosition {
                session_id,
                position_ns,
            } => {
                self.session(session_id)?.set_position(position_ns)?;
                Ok(RpcResponse::Ack)
            }
            RpcRequest::GetPosition { session_id } => {
                let position_ns = self.session(session_id)?.get_position()?;
                Ok(RpcResponse::Position { position_ns })
            }
            RpcRequest::HaveData {
                session_id,
                status,
                num_frames,
                request_id,
            } => {
                self.have_data(session_id, status, num_frames, request_id)
            }
            RpcRequest::SetVideoWindow {
                session_id,
                x,
                y,
                width,
                height,
            } => {
                self.session(session_id)?
                    .set_video_window(x, y, width, height)?;
                Ok(RpcResponse::Ack)
            }
            RpcRequest::SetPlaybackRate { session_id, rate } => {
                self.session(session_id)?.set_playback_rate(rate)?;
                Ok(RpcResponse::Ack)
            }
            RpcRequest::SetVolume { session_id, volume } => {
                self.session(session_id)?.set_volume(volume)?;
                Ok(RpcResponse::Ack)
            }
            RpcRequest::GetVolume { session_id } => {
                let volume = self.session(session_id)?.get_volume()?;
                Ok(RpcResponse::Volume { volume })
            }
            RpcRequest::SetMute {
                session_id,
                source_id,
                mute,
            } => {
                self.session(session_id)?.set_mute(source_id, mute)?;
                Ok(RpcResponse::Ack)
            }
            RpcRequest::GetMute {
                session_id,
                source_id,
            } => {
                let mute = self.session(session_id)?.get_mute(source_id)?;
                Ok(RpcResponse::Mute { mute })
            }
            RpcRequest::GetStats {
                session_id,
                source_id,
            } => {
                let stats = self.session(session_id)?.get_stats(source_id)?;
                Ok(RpcResponse::Stats { stats })
            }
            RpcRequest::Flush {
                session_id,
                source_id,
                reset_time,
            } => {
                self.session(session_id)?.flush(source_id, reset_time)?;
                Ok(RpcResponse::Ack)
            }
            RpcRequest::ProcessAudioGap {
                session_id,
                position_ns,
                duration_ns,
                discontinuity_gap,
                audio_aac,
            } => {
                self.session(session_id)?.process_audio_gap(
                    position_ns,
                    duration_ns,
                    discontinuity_gap,
                    audio_aac,
                )?;
                Ok(RpcResponse::Ack)
            }
            other @ (RpcRequest::SetConfiguration { .. }
            | RpcRequest::SetState { .. }
            | RpcRequest::SetLogLevels { .. }
            | RpcRequest::Ping { .. }) => Err(RialtoError::Protocol(format!(
                "{other:?} belongs on the application-management channel, not the session-management one"
            ))),
        }
    }

    fn have_data(
        &self,
        session_id: SessionId,
        status: HaveDataStatus,
        num_frames: u32,
        request_id: RequestId,
    ) -> RialtoResult<RpcResponse> {
        self.session(session_id)?
            .have_data(status, num_frames, request_id)?;
        Ok(RpcResponse::Ack)
    }

    fn heartbeat(&self, handler: Handler) {
        let sessions: Vec<Arc<dyn ServerSessionService>> = self
            .sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        let children = handler.fan_out(sessions.len());
        for (session, child) in sessions.into_iter().zip(children) {
            session.heartbeat(child);
        }
    }
}

/// The client-facing RPC server (C10).
pub struct SessionManagementServer {
    inner: Arc<Inner>,
    running: Arc<AtomicBool>,
    accept_thread: Mutex<Option<JoinHandle<()>>>,
}

impl SessionManagementServer {
    /// `shm_size` is the size of the single backing region every accepted
    /// connection is hand a `dup`'d fd to via `GetSharedMemory` (§4.4).
    pub fn new(factory: Arc<dyn SessionServiceFactory>, shm_size: u32) -> RialtoResult<Arc<Self>> {
        Ok(Arc::new(Self {
            inner: Arc::new(Inner {
                factory,
                shm: ShmBackingStore::new(shm_size)?,
                connections: DashMap::new(),
                next_connection_id: AtomicU64::new(1),
                max_playbacks: Mutex::new(0),
            }),
            running: Arc::new(AtomicBool::new(false)),
            accept_thread: Mutex::new(None),
        }))
    }

    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.inner.connections.len()
    }

    fn accept_loop(listener: UnixListener, running: Arc<AtomicBool>, inner: Arc<Inner>) {
        loop {
            if !running.load(Ordering::Acquire) {
                return;
            }
            match listener.accept() {
                Ok((stream, _addr)) => {
                    if let Err(e) = ConnectionHandler::spawn(stream, Arc::clone(&inner)) {
                        tracing::warn!(error = %e, "failed to spawn a session-management connection");
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(20));
                }
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed on the session-management socket");
                    thread::sleep(Duration::from_millis(20));
                }
            }
        }
    }
}

impl SessionManagementControl for SessionManagementServer {
    fn start(
        &self,
        socket: SocketDescriptor,
        max_playbacks: u32,
        max_web_audio_players: u32,
    ) -> RialtoResult<()> {
        // Web-audio player accounting beyond the configured ceiling is an
        // `apps/server`-policy decision outside this core's scope (§1);
        // recorded here only so a caller can observe it was accepted.
        let _ = max_web_audio_players;
        *self.inner.max_playbacks.lock() = max_playbacks;

        let listener = match socket {
            SocketDescriptor::Path {
                path,
                permissions,
                owner,
                group,
            } => {
                let _ = std::fs::remove_file(&path);
                let listener = UnixListener::bind(&path)
                    .map_err(|e| RialtoError::Transport(format!("bind {path} failed: {e}")))?;
                apply_socket_permissions(&path, permissions, &owner, &group)?;
                listener
            }
            // Safety: the fd is preopened and connected (already a listening
            // socket) by the embedding process specifically for this use.
            SocketDescriptor::Fd(fd) => unsafe { UnixListener::from_raw_fd(fd) },
        };
        listener
            .set_nonblocking(true)
            .map_err(|e| RialtoError::Transport(format!("set_nonblocking failed: {e}")))?;

        self.running.store(true, Ordering::Release);
        let running = Arc::clone(&self.running);
        let inner = Arc::clone(&self.inner);
        let handle = thread::Builder::new()
            .name("rialto-session-mgmt".into())
            .spawn(move || Self::accept_loop(listener, running, inner))
            .map_err(|e| RialtoError::Transport(format!("failed to spawn accept thread: {e}")))?;
        *self.accept_thread.lock() = Some(handle);
        Ok(())
    }

    fn stop(&self) -> RialtoResult<()> {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.accept_thread.lock().take() {
            let _ = handle.join();
        }
        Ok(())
    }

    fn set_log_levels(&self, levels: &str) -> RialtoResult<()> {
        for entry in self.inner.connections.iter() {
            if let Err(e) = entry
                .value()
                .channel
                .emit(ServerEvent::SetLogLevels {
                    levels: levels.to_string(),
                })
            {
                tracing::warn!(error = %e, connection_id = *entry.key(), "failed to propagate log level change");
            }
        }
        Ok(())
    }

    fn heartbeat(&self, handler: Handler) {
        let connections: Vec<Arc<ConnectionHandler>> = self
            .inner
            .connections
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        let children = handler.fan_out(connections.len());
        for (connection, child) in connections.into_iter().zip(children) {
            connection.heartbeat(child);
        }
    }
}

/// chmod's (and, if both are non-empty, chown's) the bound socket path per
/// §6. `owner`/`group` are resolved by name via `getpwnam`/`getgrnam`
/// (direct `libc`, consistent with the rest of this core's Unix plumbing).
fn apply_socket_permissions(
    path: &str,
    permissions: u32,
    owner: &str,
    group: &str,
) -> RialtoResult<()> {
    let c_path = std::ffi::CString::new(path)
        .map_err(|e| RialtoError::Configuration(format!("socket path has interior NUL: {e}")))?;
    if unsafe { libc::chmod(c_path.as_ptr(), permissions as libc::mode_t) } != 0 {
        return Err(RialtoError::Transport(format!(
            "chmod {path} to {permissions:o} failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    if owner.is_empty() || group.is_empty() {
        return Ok(());
    }
    let uid = resolve_uid(owner)
        .ok_or_else(|| RialtoError::Configuration(format!("unknown socket owner: {owner}")))?;
    let gid = resolve_gid(group)
        .ok_or_else(|| RialtoError::Configuration(format!("unknown socket group: {group}")))?;
    if unsafe { libc::chown(c_path.as_ptr(), uid, gid) } != 0 {
        return Err(RialtoError::Transport(format!(
            "chown {path} to {owner}:{group} failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

fn resolve_uid(name: &str) -> Option<libc::uid_t> {
    let c_name = std::ffi::CString::new(name).ok()?;
    let passwd = unsafe { libc::getpwnam(c_name.as_ptr()) };
    if passwd.is_null() {
        None
    } else {
        Some(unsafe { (*passwd).pw_uid })
    }
}

fn resolve_gid(name: &str) -> Option<libc::gid_t> {
    let c_name = std::ffi::CString::new(name).ok()?;
    let group = unsafe { libc::getgrnam(c_name.as_ptr()) };
    if group.is_null() {
        None
    } else {
        Some(unsafe { (*group).gr_gid })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn create_session_dispatches_through_to_a_stub_service_over_a_real_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rialto-test.sock");

        let server =
            SessionManagementServer::new(Arc::new(NoopSessionServiceFactory), 4096).unwrap();
        server
            .start(
                SocketDescriptor::Path {
                    path: path.to_string_lossy().into_owned(),
                    permissions: 0o666,
                    owner: String::new(),
                    group: String::new(),
                },
                8,
                0,
            )
            .unwrap();

        let stream = loop {
            match UnixStream::connect(&path) {
                Ok(s) => break s,
                Err(_) => thread::sleep(Duration::from_millis(10)),
            }
        };
        let client = Channel::new(stream).unwrap();

        let slot = Arc::new(parking_lot::Mutex::new(None));
        let closure = Arc::new(rialto_common::SemaphoreClosure::new());
        client
            .call(RpcRequest::CreateSession, slot.clone(), closure.clone())
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while !closure.is_signaled() && Instant::now() < deadline {
            let _ = client.process();
            thread::sleep(Duration::from_millis(5));
        }
        closure.wait();
        let response = slot.lock().take().unwrap().unwrap();
        assert_eq!(response, RpcResponse::SessionCreated { session_id: 1 });

        let deadline = Instant::now() + Duration::from_secs(2);
        while server.connection_count() == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(server.connection_count(), 1);

        server.stop().unwrap();
    }

    #[test]
    fn get_shared_memory_hands_back_a_dup_of_the_backing_region() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rialto-shm-test.sock");

        let server =
            SessionManagementServer::new(Arc::new(NoopSessionServiceFactory), 8192).unwrap();
        server
            .start(
                SocketDescriptor::Path {
                    path: path.to_string_lossy().into_owned(),
                    permissions: 0o666,
                    owner: String::new(),
                    group: String::new(),
                },
                8,
                0,
            )
            .unwrap();

        let stream = loop {
            match UnixStream::connect(&path) {
                Ok(s) => break s,
                Err(_) => thread::sleep(Duration::from_millis(10)),
            }
        };
        let client = Channel::new(stream).unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        let (response, fd) = loop {
            match client.call_with_fd(RpcRequest::GetSharedMemory) {
                Ok(result) => break result,
                Err(_) if Instant::now() < deadline => thread::sleep(Duration::from_millis(5)),
                Err(e) => panic!("GetSharedMemory failed: {e}"),
            }
        };
        assert!(fd >= 0);
        assert_eq!(response, RpcResponse::SharedMemory { fd_token: 1, size: 8192 });
        unsafe {
            libc::close(fd);
        }

        server.stop().unwrap();
    }
}
