//! Rialto server process entry point (§4.8 "Process entry", §6).
//!
//! Launched by the privileged parent with exactly two positional arguments
//! (an opaque app name and a preopened, connected application-management
//! socket fd, [`rialto_server::ProcessArgs`]). Wires the two RPC servers
//! (C9/C10) to a [`rialto_server::SessionServerManager`] and blocks the main
//! thread on its service condition until the parent requests `NOT_RUNNING`
//! (§4.8, §5).
//!
//! The real decoder/CDM backends this process would drive are out of scope
//! here (§1); [`rialto_server::NoopActivatableService`] and
//! [`rialto_server::NoopSessionServiceFactory`] stand in for them so the
//! control-plane wiring below is itself fully exercised end to end.

use std::os::unix::io::FromRawFd;
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::thread;

use rialto_server::{
    ApplicationManagementServer, NoopActivatableService, NoopSessionServiceFactory, ProcessArgs,
    SessionManagementServer, SessionServerManager,
};

/// Size of the single shared-memory region handed out to every guest
/// connection via `GetSharedMemory` (§4.4). Large enough for a handful of
/// concurrent sources' partitions; real deployments should size this from
/// the configured `max_playbacks` instead of a fixed constant.
const SHM_REGION_BYTES: u32 = 8 * 1024 * 1024;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = match ProcessArgs::parse() {
        Ok(args) => args,
        Err(e) => {
            tracing::error!(error = %e, "failed to parse process arguments");
            std::process::exit(1);
        }
    };
    tracing::info!(app_name = %args.app_name, "rialto-server starting");

    // Safety: the fd is preopened, connected, and handed to us exclusively by
    // the parent process per §4.8/§6.
    let parent_stream = unsafe { UnixStream::from_raw_fd(args.app_management_socket_fd) };

    let ams = match ApplicationManagementServer::new(parent_stream) {
        Ok(ams) => ams,
        Err(e) => {
            tracing::error!(error = %e, "failed to attach to the application-management socket");
            std::process::exit(1);
        }
    };

    let session_server = match SessionManagementServer::new(
        Arc::new(NoopSessionServiceFactory),
        SHM_REGION_BYTES,
    ) {
        Ok(server) => server,
        Err(e) => {
            tracing::error!(error = %e, "failed to allocate the shared-memory backing store");
            std::process::exit(1);
        }
    };

    let manager = match SessionServerManager::new(
        Arc::new(NoopActivatableService),
        Arc::new(NoopActivatableService),
        session_server,
        ams.clone(),
        ams.clone(),
    ) {
        Ok(manager) => manager,
        Err(e) => {
            tracing::error!(error = %e, "failed to construct the session server manager");
            std::process::exit(1);
        }
    };
    ams.attach(manager.clone());

    let ams_thread = ams.clone();
    let pump = thread::Builder::new()
        .name("rialto-app-mgmt".into())
        .spawn(move || ams_thread.run())
        .expect("failed to spawn the application-management pump thread");

    manager.start_service();
    tracing::info!("rialto-server reached NOT_RUNNING, shutting down");

    let _ = pump.join();
}
