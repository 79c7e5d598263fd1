//! Client-side configuration: resolving how to reach the Rialto server (§4.3, §6).
//!
//! Grounded on the teacher's `ServerConfig::apply_env_overrides` split between
//! defaults and environment overrides (`apps/server/src/config.rs`) — here
//! there is no file layer, only the two environment variables the spec names.

use std::os::unix::io::RawFd;

use rialto_common::error::{RialtoError, RialtoResult};

/// Where to connect the client's [`rialto_common::Channel`] (§3.1 IpcClient, §6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RialtoClientConfig {
    /// A preopened, already-connected socket descriptor (`RIALTO_SOCKET_FD`).
    /// Takes precedence over a path when both are set.
    PreopenedFd(RawFd),
    /// Absolute path to a Unix-domain socket to connect (`RIALTO_SOCKET_PATH`).
    SocketPath(String),
}

impl RialtoClientConfig {
    /// Resolves configuration from `RIALTO_SOCKET_FD` / `RIALTO_SOCKET_PATH`.
    ///
    /// `RIALTO_SOCKET_FD` takes precedence; a value that fails to parse as a
    /// base-10 integer is a fatal configuration error rather than silently
    /// falling back to the path variable. Absence of both is also fatal.
    pub fn from_env() -> RialtoResult<Self> {
        Self::from_vars(
            std::env::var("RIALTO_SOCKET_FD").ok(),
            std::env::var("RIALTO_SOCKET_PATH").ok(),
        )
    }

    /// Testable core of [`Self::from_env`], taking the two variable values
    /// directly instead of reading the process environment.
    fn from_vars(socket_fd: Option<String>, socket_path: Option<String>) -> RialtoResult<Self> {
        if let Some(raw) = socket_fd {
            let fd = raw.parse::<RawFd>().map_err(|_| {
                RialtoError::Configuration(format!("RIALTO_SOCKET_FD is not a valid fd: {raw}"))
            })?;
            return Ok(Self::PreopenedFd(fd));
        }
        if let Some(path) = socket_path {
            return Ok(Self::SocketPath(path));
        }
        Err(RialtoError::Configuration(
            "neither RIALTO_SOCKET_FD nor RIALTO_SOCKET_PATH is set".into(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefers_fd_over_path_when_both_set() {
        let config =
            RialtoClientConfig::from_vars(Some("7".into()), Some("/tmp/rialto.sock".into()))
                .unwrap();
        assert_eq!(config, RialtoClientConfig::PreopenedFd(7));
    }

    #[test]
    fn falls_back_to_path_when_fd_absent() {
        let config = RialtoClientConfig::from_vars(None, Some("/tmp/rialto.sock".into())).unwrap();
        assert_eq!(config, RialtoClientConfig::SocketPath("/tmp/rialto.sock".into()));
    }

    #[test]
    fn malformed_fd_is_a_configuration_error_even_with_valid_path() {
        let err =
            RialtoClientConfig::from_vars(Some("not-a-number".into()), Some("/tmp/x".into()))
                .unwrap_err();
        assert!(matches!(err, RialtoError::Configuration(_)));
    }

    #[test]
    fn neither_set_is_a_configuration_error() {
        let err = RialtoClientConfig::from_vars(None, None).unwrap_err();
        assert!(matches!(err, RialtoError::Configuration(_)));
    }
}
