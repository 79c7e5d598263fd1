//! Privileged Rialto server core: process entry configuration, the session
//! data-reader contract, session lifecycle (C7/C8), and the two RPC servers
//! (C9/C10) that sit on either side of it.
//!
//! `apps/server` wires these pieces into a running process; this crate
//! specifies their contracts and provides the no-op/stub implementations
//! that make the wiring testable without a real decoder/CDM stack (§1).

pub mod application_management_server;
pub mod config;
pub mod data_reader;
pub mod heartbeat;
pub mod server_session_service;
pub mod session_management_server;
pub mod session_server_manager;
#[cfg(unix)]
pub mod shm_backing_store;

pub use application_management_server::ApplicationManagementServer;
pub use config::ProcessArgs;
pub use heartbeat::{Handler, HeartbeatAckSink, HeartbeatProcedure};
pub use server_session_service::{
    LoggingPlaybackEventSink, NoopPlaybackEventSink, PlaybackEventSink, ServerSessionService,
    StubSessionService,
};
pub use session_management_server::{
    NoopSessionServiceFactory, SessionManagementServer, SessionServiceFactory,
};
pub use session_server_manager::{
    ActivatableService, NoopActivatableService, ServerConfiguration, SessionManagementControl,
    SessionServerManager, SocketDescriptor, StateBroadcaster,
};
#[cfg(unix)]
pub use shm_backing_store::ShmBackingStore;
