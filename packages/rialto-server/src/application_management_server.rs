//! Parent-process control channel (C9, §4.9): accepts configuration, state
//! transitions, log levels, and heartbeat pings from the privileged parent
//! that spawned this server process, over the preopened
//! `appManagementSocketFd` (§4.8, §6).
//!
//! Owns the `Channel` to the parent the way `IpcClient` owns its channel to
//! the server (`rialto_client::ipc_client`); [`Self::run`] mirrors that
//! module's `event_loop`, but this end answers inbound calls instead of
//! issuing them, so it's driven on its own dedicated thread rather than the
//! process's main thread (which instead blocks in
//! `SessionServerManager::start_service`, §4.8).

use std::os::unix::net::UnixStream;
use std::sync::Arc;

use rialto_common::channel::Channel;
use rialto_common::error::{RialtoError, RialtoResult};
use rialto_common::protocol::{RpcRequest, RpcResponse, ServerEvent, ServerProcessState};
use rialto_common::wire::CallId;

use crate::heartbeat::HeartbeatAckSink;
use crate::session_server_manager::{
    ServerConfiguration, SessionServerManager, SocketDescriptor, StateBroadcaster,
};

/// How long one heartbeat fan-in is allowed to run before the watchdog
/// forces a failed ack (§4.10 "the design does not fix the timeout — it is
/// a configuration knob").
const DEFAULT_HEARTBEAT_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

pub struct ApplicationManagementServer {
    channel: Arc<Channel>,
}

impl ApplicationManagementServer {
    /// Adopts the preopened, already-connected parent socket. Does not yet
    /// dispatch inbound calls — call [`Self::attach`] once the
    /// [`SessionServerManager`] it drives exists, breaking the
    /// manager↔broadcaster construction cycle the same way §9 resolves
    /// cyclic ownership elsewhere in the core (an owning side plus a
    /// separate, attached-afterward dispatch target).
    pub fn new(parent_stream: UnixStream) -> RialtoResult<Arc<Self>> {
        let channel = Channel::new(parent_stream)?;
        Ok(Arc::new(Self { channel }))
    }

    /// Wires inbound-call dispatch to `manager`. Must be called exactly
    /// once, before [`Self::run`].
    pub fn attach(self: &Arc<Self>, manager: Arc<SessionServerManager>) {
        let channel = Arc::clone(&self.channel);
        self.channel.set_inbound_call_handler(move |call_id, request| {
            Self::dispatch(&channel, &manager, call_id, request);
        });
    }

    fn dispatch(
        channel: &Arc<Channel>,
        manager: &Arc<SessionServerManager>,
        call_id: CallId,
        request: RpcRequest,
    ) {
        let result = match request {
            RpcRequest::SetConfiguration {
                socket_path,
                socket_fd,
                socket_permissions,
                socket_owner,
                socket_group,
                max_playbacks,
                max_web_audio_players,
                client_display_name,
                resource_manager_app_name,
                initial_state,
            } => Self::apply_configuration(
                manager,
                socket_path,
                socket_fd,
                socket_permissions,
                socket_owner,
                socket_group,
                max_playbacks,
                max_web_audio_players,
                client_display_name,
                resource_manager_app_name,
                initial_state,
            ),
            RpcRequest::SetState { state } => manager.set_state(state),
            RpcRequest::SetLogLevels { levels } => manager.set_log_levels(&levels),
            RpcRequest::Ping { id } => {
                manager.handle_ping(id, DEFAULT_HEARTBEAT_TIMEOUT);
                Ok(())
            }
            other => Err(RialtoError::Protocol(format!(
                "unexpected inbound RPC on the application-management channel: {other:?}"
            ))),
        };

        let response = match result {
            Ok(()) => RpcResponse::Ack,
            Err(e) => RpcResponse::Failed {
                reason: e.to_string(),
            },
        };
        if let Err(e) = channel.respond(call_id, response) {
            tracing::warn!(error = %e, "failed to respond on the application-management channel");
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn apply_configuration(
        manager: &Arc<SessionServerManager>,
        socket_path: Option<String>,
        socket_fd: Option<i32>,
        socket_permissions: u32,
        socket_owner: String,
        socket_group: String,
        max_playbacks: u32,
        max_web_audio_players: u32,
        client_display_name: String,
        resource_manager_app_name: String,
        initial_state: ServerProcessState,
    ) -> RialtoResult<()> {
        let socket = match (socket_path, socket_fd) {
            (Some(path), _) => SocketDescriptor::Path {
                path,
                permissions: socket_permissions,
                owner: socket_owner,
                group: socket_group,
            },
            (None, Some(fd)) => SocketDescriptor::Fd(fd),
            (None, None) => {
                return Err(RialtoError::Configuration(
                    "SetConfiguration requires either socket_path or socket_fd".into(),
                ))
            }
        };
        manager.set_configuration(ServerConfiguration {
            socket,
            max_playbacks,
            max_web_audio_players,
            client_display_name,
            resource_manager_app_name,
            initial_state,
        })
    }

    #[must_use]
    pub fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }

    /// Pumps the parent-link channel on the calling thread until it
    /// disconnects. Intended to run on a dedicated thread, leaving the
    /// process's main thread free to block in
    /// `SessionServerManager::start_service` (§4.8).
    pub fn run(&self) {
        loop {
            match self.channel.process() {
                Ok(_) => {}
                Err(_) => return,
            }
            if !self.channel.is_connected() {
                return;
            }
            let _ = self.channel.wait(-1);
        }
    }
}

impl StateBroadcaster for ApplicationManagementServer {
    fn broadcast(&self, state: ServerProcessState) -> RialtoResult<()> {
        self.channel.emit(ServerEvent::ProcessStateChanged { state })
    }
}

impl HeartbeatAckSink for ApplicationManagementServer {
    fn ack(&self, id: u64, success: bool) {
        if let Err(e) = self
            .channel
            .emit(ServerEvent::HeartbeatAck { id, success })
        {
            tracing::warn!(error = %e, id, "failed to deliver heartbeat ack to parent");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session_server_manager::{NoopActivatableService, SessionManagementControl};
    use rialto_common::channel::EventDescriptor;
    use std::sync::Mutex;
    use std::thread;
    use std::time::Duration;

    struct NoopControl;
    impl SessionManagementControl for NoopControl {
        fn start(&self, _: SocketDescriptor, _: u32, _: u32) -> RialtoResult<()> {
            Ok(())
        }
        fn stop(&self) -> RialtoResult<()> {
            Ok(())
        }
        fn set_log_levels(&self, _levels: &str) -> RialtoResult<()> {
            Ok(())
        }
    }

    #[test]
    fn set_state_call_is_acked_and_broadcasts_a_process_state_changed_event() {
        let (parent_sock, server_sock) = UnixStream::pair().unwrap();
        let ams = ApplicationManagementServer::new(server_sock).unwrap();
        let manager = SessionServerManager::new(
            Arc::new(NoopActivatableService),
            Arc::new(NoopActivatableService),
            Arc::new(NoopControl),
            ams.clone(),
            ams.clone(),
        )
        .unwrap();
        ams.attach(manager.clone());

        let ams_for_thread = ams.clone();
        let pump = thread::spawn(move || {
            let deadline = std::time::Instant::now() + Duration::from_secs(2);
            while std::time::Instant::now() < deadline {
                let _ = ams_for_thread.channel.process();
                thread::sleep(Duration::from_millis(5));
            }
        });

        let parent = Channel::new(parent_sock).unwrap();
        let events: Arc<Mutex<Vec<ServerProcessState>>> = Arc::new(Mutex::new(Vec::new()));
        let events_clone = events.clone();
        parent.subscribe(EventDescriptor::ProcessStateChanged, move |event| {
            if let ServerEvent::ProcessStateChanged { state } = event {
                events_clone.lock().unwrap().push(state);
            }
        });

        let slot = Arc::new(parking_lot::Mutex::new(None));
        let closure = Arc::new(rialto_common::SemaphoreClosure::new());
        parent
            .call(
                RpcRequest::SetState {
                    state: ServerProcessState::Inactive,
                },
                slot.clone(),
                closure.clone(),
            )
            .unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while !closure.is_signaled() && std::time::Instant::now() < deadline {
            let _ = parent.process();
            thread::sleep(Duration::from_millis(5));
        }
        closure.wait();
        assert_eq!(slot.lock().take().unwrap().unwrap(), RpcResponse::Ack);

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while events.lock().unwrap().len() < 2 && std::time::Instant::now() < deadline {
            let _ = parent.process();
            thread::sleep(Duration::from_millis(5));
        }
        // UNINITIALIZED is broadcast at manager construction, INACTIVE by
        // this SetState call.
        assert_eq!(
            *events.lock().unwrap(),
            vec![ServerProcessState::Uninitialized, ServerProcessState::Inactive]
        );

        parent.disconnect();
        let _ = pump.join();
    }
}
