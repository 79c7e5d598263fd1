//! Server process entry configuration: the two CLI positional arguments
//! (§4.8 "Process entry", §6).
//!
//! Grounded on the teacher's `apps/server/src/config.rs` env-override split,
//! but simplified to match what §6 actually specifies: no flags, no YAML
//! file, exactly two positional arguments read directly off `std::env::args()`.
//! A flag-parsing crate (`clap`, used by the teacher) would invent surface
//! area the spec doesn't call for, so this is a direct parse instead.

use std::os::unix::io::RawFd;

use rialto_common::error::{RialtoError, RialtoResult};

/// The two positional arguments the server process is launched with
/// (§4.8, §6): an opaque application name and the preopened, connected
/// socket fd it uses to talk to its parent process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessArgs {
    pub app_name: String,
    pub app_management_socket_fd: RawFd,
}

impl ProcessArgs {
    /// Parses `std::env::args()`. Any arity other than "exactly two
    /// positional arguments after the binary name" is a fatal configuration
    /// error, per §4.8/§6 ("any other arity exits non-zero before any side
    /// effects").
    pub fn parse() -> RialtoResult<Self> {
        let args: Vec<String> = std::env::args().collect();
        Self::from_args(&args)
    }

    /// Testable core of [`Self::parse`], taking the full `argv` (including
    /// `argv[0]`) directly.
    fn from_args(args: &[String]) -> RialtoResult<Self> {
        if args.len() != 3 {
            return Err(RialtoError::Configuration(format!(
                "expected exactly 2 arguments (appName, appManagementSocketFd), got {}",
                args.len().saturating_sub(1)
            )));
        }
        let app_name = args[1].clone();
        let fd = args[2].parse::<RawFd>().map_err(|_| {
            RialtoError::Configuration(format!(
                "appManagementSocketFd is not a valid decimal integer: {}",
                args[2]
            ))
        })?;
        Ok(Self { app_name, app_management_socket_fd: fd })
    }
}
