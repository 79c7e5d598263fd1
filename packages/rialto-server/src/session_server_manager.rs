//! Server-process lifecycle state machine (C8, §4.8): owns the
//! UNINITIALIZED → INACTIVE ↔ ACTIVE → NOT_RUNNING transitions, and the
//! `setConfiguration` wiring that brings the process up.
//!
//! The two resource-bearing services `playback` and `cdm` are out of scope
//! as designs (§1); only their activation/heartbeat coupling is specified
//! here, so they are held as trait objects rather than concrete types —
//! analogous to the teacher's `Lifecycle`/`EventEmitter` split
//! (`lifecycle.rs`, `events/emitter.rs`): this core depends on the contract,
//! not on GStreamer or the CDM.

use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use rialto_common::error::{RialtoError, RialtoResult};
use rialto_common::protocol::ServerProcessState;

use crate::heartbeat::{HeartbeatAckSink, HeartbeatProcedure};

/// A resource-bearing collaborator whose lifecycle is coupled to the
/// process-wide state machine (§4.8). `playback` and `cdm` are this; the
/// decoder/CDM algorithms behind them are out of scope.
pub trait ActivatableService: Send + Sync {
    fn switch_to_active(&self) -> RialtoResult<()>;
    fn switch_to_inactive(&self) -> RialtoResult<()>;

    /// Heartbeat fan-in entry point (§4.10): propagate `handler` to every
    /// active component owned by this service before releasing it. Default
    /// releases immediately.
    fn heartbeat(&self, handler: crate::heartbeat::Handler) {
        drop(handler);
    }
}

/// Does nothing on activation/deactivation; the default for a process not
/// wiring a real playback/cdm backend (e.g. the `apps/server` binary
/// shipped here, or unit tests of the state machine itself).
pub struct NoopActivatableService;

impl ActivatableService for NoopActivatableService {
    fn switch_to_active(&self) -> RialtoResult<()> {
        Ok(())
    }
    fn switch_to_inactive(&self) -> RialtoResult<()> {
        Ok(())
    }
}

/// Delivers a `ServerProcessState` change to the parent process (§4.8, §4.9).
/// Implemented by [`crate::application_management_server::ApplicationManagementServer`].
pub trait StateBroadcaster: Send + Sync {
    fn broadcast(&self, state: ServerProcessState) -> RialtoResult<()>;
}

/// Where the client-facing socket comes from, mirroring `SetConfiguration`'s
/// two addressing modes (§6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketDescriptor {
    Path {
        path: String,
        /// chmod mode applied after bind; defaults to `0o666` (§6).
        permissions: u32,
        /// chown owner; chown only applied if both this and `group` are
        /// non-empty (§6).
        owner: String,
        group: String,
    },
    Fd(RawFd),
}

/// Controls for the client-facing RPC server (C10), as seen from C8.
/// Implemented by [`crate::session_management_server::SessionManagementServer`].
pub trait SessionManagementControl: Send + Sync {
    /// Binds/adopts the configured socket and starts the dedicated accept
    /// loop thread (§4.9 `addSocket` + `start`).
    fn start(
        &self,
        socket: SocketDescriptor,
        max_playbacks: u32,
        max_web_audio_players: u32,
    ) -> RialtoResult<()>;

    /// Stops the accept loop (§4.9 `stop`).
    fn stop(&self) -> RialtoResult<()>;

    /// Propagates a log-level change to every connected guest client (§4.9).
    fn set_log_levels(&self, levels: &str) -> RialtoResult<()>;

    /// Heartbeat fan-in entry point for the "control" participant (§4.10):
    /// propagate to every connected client, each session. Default releases
    /// immediately.
    fn heartbeat(&self, handler: crate::heartbeat::Handler) {
        drop(handler);
    }
}

/// Configuration applied in one shot by `setConfiguration` (§4.8).
pub struct ServerConfiguration {
    pub socket: SocketDescriptor,
    pub max_playbacks: u32,
    pub max_web_audio_players: u32,
    pub client_display_name: String,
    pub resource_manager_app_name: String,
    pub initial_state: ServerProcessState,
}

/// Owns the process-wide lifecycle state machine, the two activatable
/// services it gates, and the condition variable `startService` blocks the
/// main thread on (§4.8, §5 "service condition").
pub struct SessionServerManager {
    state: Mutex<ServerProcessState>,
    service_running: Mutex<bool>,
    service_cv: Condvar,
    playback: Arc<dyn ActivatableService>,
    cdm: Arc<dyn ActivatableService>,
    session_control: Arc<dyn SessionManagementControl>,
    broadcaster: Arc<dyn StateBroadcaster>,
    ack_sink: Arc<dyn HeartbeatAckSink>,
    client_display_name: Mutex<String>,
    resource_manager_app_name: Mutex<String>,
}

impl SessionServerManager {
    /// Constructs the manager in `UNINITIALIZED` and immediately broadcasts
    /// that state to the parent (§4.8 process entry, §8 scenario 5).
    pub fn new(
        playback: Arc<dyn ActivatableService>,
        cdm: Arc<dyn ActivatableService>,
        session_control: Arc<dyn SessionManagementControl>,
        broadcaster: Arc<dyn StateBroadcaster>,
        ack_sink: Arc<dyn HeartbeatAckSink>,
    ) -> RialtoResult<Arc<Self>> {
        broadcaster.broadcast(ServerProcessState::Uninitialized)?;
        Ok(Arc::new(Self {
            state: Mutex::new(ServerProcessState::Uninitialized),
            service_running: Mutex::new(true),
            service_cv: Condvar::new(),
            playback,
            cdm,
            session_control,
            broadcaster,
            ack_sink,
            client_display_name: Mutex::new(String::new()),
            resource_manager_app_name: Mutex::new(String::new()),
        }))
    }

    #[must_use]
    pub fn current_state(&self) -> ServerProcessState {
        *self.state.lock()
    }

    /// `setConfiguration` (§4.8): wires the client-facing socket, records
    /// the display/resource-manager names, then applies `initial_state` via
    /// [`Self::set_state`]. Any step failing short-circuits the rest.
    pub fn set_configuration(&self, config: ServerConfiguration) -> RialtoResult<()> {
        self.session_control.start(
            config.socket,
            config.max_playbacks,
            config.max_web_audio_players,
        )?;
        *self.client_display_name.lock() = config.client_display_name;
        *self.resource_manager_app_name.lock() = config.resource_manager_app_name;
        self.set_state(config.initial_state)
    }

    /// Drives the transition table in §4.8. Same-state requests are no-ops
    /// that do not broadcast (§8 P8).
    pub fn set_state(&self, requested: ServerProcessState) -> RialtoResult<()> {
        let mut state = self.state.lock();
        if *state == requested {
            return Ok(());
        }
        if *state == ServerProcessState::NotRunning {
            return Err(RialtoError::State(
                "server already NOT_RUNNING; no further transitions accepted".into(),
            ));
        }

        match requested {
            ServerProcessState::Active => self.enter_active(&mut state),
            ServerProcessState::Inactive => self.enter_inactive(&mut state),
            ServerProcessState::NotRunning => self.enter_not_running(&mut state),
            ServerProcessState::Uninitialized | ServerProcessState::Error => {
                *state = ServerProcessState::Error;
                drop(state);
                let _ = self.broadcaster.broadcast(ServerProcessState::Error);
                Err(RialtoError::State(format!(
                    "{requested:?} is not a valid requested transition"
                )))
            }
        }
    }

    fn enter_active(&self, state: &mut ServerProcessState) -> RialtoResult<()> {
        self.playback.switch_to_active()?;
        if let Err(e) = self.cdm.switch_to_active() {
            let _ = self.playback.switch_to_inactive();
            return Err(e);
        }
        match self.broadcaster.broadcast(ServerProcessState::Active) {
            Ok(()) => {
                *state = ServerProcessState::Active;
                Ok(())
            }
            Err(e) => {
                let _ = self.playback.switch_to_inactive();
                let _ = self.cdm.switch_to_inactive();
                Err(e)
            }
        }
    }

    fn enter_inactive(&self, state: &mut ServerProcessState) -> RialtoResult<()> {
        let previous = *state;
        if let Err(e) = self.playback.switch_to_inactive() {
            tracing::warn!(error = %e, "playback.switch_to_inactive failed while entering INACTIVE");
        }
        if let Err(e) = self.cdm.switch_to_inactive() {
            tracing::warn!(error = %e, "cdm.switch_to_inactive failed while entering INACTIVE");
        }
        match self.broadcaster.broadcast(ServerProcessState::Inactive) {
            Ok(()) => {
                *state = ServerProcessState::Inactive;
                Ok(())
            }
            Err(e) => {
                if previous == ServerProcessState::Active {
                    let _ = self.playback.switch_to_active();
                    let _ = self.cdm.switch_to_active();
                }
                Err(e)
            }
        }
    }

    fn enter_not_running(&self, state: &mut ServerProcessState) -> RialtoResult<()> {
        if let Err(e) = self.playback.switch_to_inactive() {
            tracing::warn!(error = %e, "playback.switch_to_inactive failed while entering NOT_RUNNING");
        }
        if let Err(e) = self.cdm.switch_to_inactive() {
            tracing::warn!(error = %e, "cdm.switch_to_inactive failed while entering NOT_RUNNING");
        }
        let broadcast_result = self.broadcaster.broadcast(ServerProcessState::NotRunning);
        *state = ServerProcessState::NotRunning;
        *self.service_running.lock() = false;
        self.service_cv.notify_all();
        broadcast_result
    }

    /// Blocks the calling (main) thread on the service condition until a
    /// `NOT_RUNNING` transition flips it (§4.8, §5 "service condition").
    pub fn start_service(&self) {
        let mut running = self.service_running.lock();
        while *running {
            self.service_cv.wait(&mut running);
        }
    }

    /// Broadcast of `SetLogLevels` to every connected guest, delegated to
    /// the client-facing server (§4.9).
    pub fn set_log_levels(&self, levels: &str) -> RialtoResult<()> {
        self.session_control.set_log_levels(levels)
    }

    /// Runs one heartbeat procedure for `id`, fanning a handler out to
    /// playback, cdm, and the client-facing control server, and delivering
    /// the fan-in ack back to the parent once all three release it (or the
    /// watchdog times out) (§4.10, §4.9).
    pub fn handle_ping(&self, id: u64, timeout: Duration) {
        let mut handlers =
            HeartbeatProcedure::start(id, 3, timeout, Arc::clone(&self.ack_sink));
        let control = handlers.pop().unwrap();
        let cdm = handlers.pop().unwrap();
        let playback = handlers.pop().unwrap();
        self.playback.heartbeat(playback);
        self.cdm.heartbeat(cdm);
        self.session_control.heartbeat(control);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex as StdMutex;

    struct RecordingBroadcaster {
        events: StdMutex<Vec<ServerProcessState>>,
        fail_on: StdMutex<Option<ServerProcessState>>,
    }

    impl RecordingBroadcaster {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                events: StdMutex::new(Vec::new()),
                fail_on: StdMutex::new(None),
            })
        }
    }

    impl StateBroadcaster for RecordingBroadcaster {
        fn broadcast(&self, state: ServerProcessState) -> RialtoResult<()> {
            if *self.fail_on.lock().unwrap() == Some(state) {
                return Err(RialtoError::Transport("broadcast failed".into()));
            }
            self.events.lock().unwrap().push(state);
            Ok(())
        }
    }

    struct NoopAckSink;
    impl HeartbeatAckSink for NoopAckSink {
        fn ack(&self, _id: u64, _success: bool) {}
    }

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

    struct FailingActivation {
        active_fails: AtomicBool,
    }
    impl ActivatableService for FailingActivation {
        fn switch_to_active(&self) -> RialtoResult<()> {
            if self.active_fails.load(Ordering::Acquire) {
                Err(RialtoError::Resource("cdm unavailable".into()))
            } else {
                Ok(())
            }
        }
        fn switch_to_inactive(&self) -> RialtoResult<()> {
            Ok(())
        }
    }

    fn manager_with(broadcaster: Arc<RecordingBroadcaster>) -> Arc<SessionServerManager> {
        SessionServerManager::new(
            Arc::new(NoopActivatableService),
            Arc::new(NoopActivatableService),
            Arc::new(NoopControl),
            broadcaster,
            Arc::new(NoopAckSink),
        )
        .unwrap()
    }

    #[test]
    fn same_state_request_is_a_no_op_and_does_not_broadcast() {
        let broadcaster = RecordingBroadcaster::new();
        let manager = manager_with(broadcaster.clone());
        broadcaster.events.lock().unwrap().clear();

        manager
            .set_state(ServerProcessState::Uninitialized)
            .unwrap();
        assert!(broadcaster.events.lock().unwrap().is_empty());
    }

    #[test]
    fn full_lifecycle_broadcasts_in_order_and_unblocks_start_service() {
        let broadcaster = RecordingBroadcaster::new();
        let manager = manager_with(broadcaster.clone());

        manager.set_state(ServerProcessState::Inactive).unwrap();
        manager.set_state(ServerProcessState::Active).unwrap();
        manager.set_state(ServerProcessState::Inactive).unwrap();
        manager.set_state(ServerProcessState::NotRunning).unwrap();

        manager.start_service(); // must return promptly; NOT_RUNNING already reached

        assert_eq!(
            *broadcaster.events.lock().unwrap(),
            vec![
                ServerProcessState::Uninitialized,
                ServerProcessState::Inactive,
                ServerProcessState::Active,
                ServerProcessState::Inactive,
                ServerProcessState::NotRunning,
            ]
        );
    }

    #[test]
    fn cdm_activation_failure_rolls_back_playback_without_broadcasting_active() {
        let broadcaster = RecordingBroadcaster::new();
        let cdm = Arc::new(FailingActivation {
            active_fails: AtomicBool::new(true),
        });
        let manager = SessionServerManager::new(
            Arc::new(NoopActivatableService),
            cdm,
            Arc::new(NoopControl),
            broadcaster.clone(),
            Arc::new(NoopAckSink),
        )
        .unwrap();
        broadcaster.events.lock().unwrap().clear();

        manager.set_state(ServerProcessState::Inactive).unwrap();
        broadcaster.events.lock().unwrap().clear();

        let result = manager.set_state(ServerProcessState::Active);
        assert!(result.is_err());
        assert!(broadcaster.events.lock().unwrap().is_empty());
        assert_eq!(manager.current_state(), ServerProcessState::Inactive);
    }

    #[test]
    fn broadcast_failure_on_active_entry_rolls_back_both_services() {
        let broadcaster = RecordingBroadcaster::new();
        *broadcaster.fail_on.lock().unwrap() = Some(ServerProcessState::Active);
        let manager = manager_with(broadcaster.clone());
        manager.set_state(ServerProcessState::Inactive).unwrap();

        let result = manager.set_state(ServerProcessState::Active);
        assert!(result.is_err());
        assert_eq!(manager.current_state(), ServerProcessState::Inactive);
    }

    #[test]
    fn invalid_requested_state_broadcasts_error() {
        let broadcaster = RecordingBroadcaster::new();
        let manager = manager_with(broadcaster.clone());
        manager.set_state(ServerProcessState::Inactive).unwrap();
        manager.set_state(ServerProcessState::Active).unwrap();
        broadcaster.events.lock().unwrap().clear();

        let result = manager.set_state(ServerProcessState::Uninitialized);
        assert!(result.is_err());
        assert_eq!(
            *broadcaster.events.lock().unwrap(),
            vec![ServerProcessState::Error]
        );
    }

    #[test]
    fn handle_ping_acks_once_all_three_participants_release() {
        struct RecordingAckSink(StdMutex<Vec<(u64, bool)>>);
        impl HeartbeatAckSink for RecordingAckSink {
            fn ack(&self, id: u64, success: bool) {
                self.0.lock().unwrap().push((id, success));
            }
        }

        let broadcaster = RecordingBroadcaster::new();
        let ack_sink = Arc::new(RecordingAckSink(StdMutex::new(Vec::new())));
        let manager = SessionServerManager::new(
            Arc::new(NoopActivatableService),
            Arc::new(NoopActivatableService),
            Arc::new(NoopControl),
            broadcaster,
            ack_sink.clone(),
        )
        .unwrap();

        manager.handle_ping(42, Duration::from_secs(5));
        // All three participants are `NoopActivatableService`/`NoopControl`,
        // whose default `heartbeat` releases its handler immediately.
        assert_eq!(*ack_sink.0.lock().unwrap(), vec![(42, true)]);
    }
}
