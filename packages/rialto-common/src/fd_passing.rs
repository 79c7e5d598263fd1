//! Passing a single file descriptor over a Unix-domain socket via `SCM_RIGHTS`.
//!
//! `spec.md` treats "the on-wire RPC framing" as out of scope, but
//! `GetSharedMemory`'s `{fd, size}` response (§4.4) and the server process's
//! preopened `appManagementSocketFd` (§4.8, §6) both require moving a raw fd
//! across the socket, which ordinary `read`/`write` cannot do. Grounded on
//! `examples/imbhargav5-unbound.computer/apps/daemon/crates/daemon-stream/src/unix/mod.rs`'s
//! direct `libc` usage for the analogous shared-memory fd exchange.

use std::mem;
use std::os::unix::io::RawFd;

use crate::error::{RialtoError, RialtoResult};

/// `CMSG_SPACE` for exactly one `RawFd`, computed at compile time so it can
/// size a stack-allocated ancillary-data buffer.
const CMSG_BUF_LEN: usize = cmsg_space(mem::size_of::<RawFd>());

/// Sends `fd` plus a one-byte payload (so the call never degenerates into a
/// zero-length datagram) as ancillary data over `socket_fd`.
pub fn send_fd(socket_fd: RawFd, fd: RawFd) -> RialtoResult<()> {
    let payload = [0u8; 1];
    let iov = libc::iovec {
        iov_base: payload.as_ptr() as *mut libc::c_void,
        iov_len: payload.len(),
    };

    let mut cmsg_buf = [0u8; CMSG_BUF_LEN];
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &iov as *const _ as *mut _;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = cmsg_buf.len() as _;

    unsafe {
        let cmsg = libc::CMSG_FIRSTHDR(&msg);
        (*cmsg).cmsg_level = libc::SOL_SOCKET;
        (*cmsg).cmsg_type = libc::SCM_RIGHTS;
        (*cmsg).cmsg_len = libc::CMSG_LEN(mem::size_of::<RawFd>() as u32) as _;
        std::ptr::write(libc::CMSG_DATA(cmsg) as *mut RawFd, fd);

        let sent = libc::sendmsg(socket_fd, &msg, 0);
        if sent < 0 {
            return Err(RialtoError::Transport(format!(
                "sendmsg failed: {}",
                std::io::Error::last_os_error()
            )));
        }
    }
    Ok(())
}

/// Receives one fd sent by [`send_fd`] over `socket_fd`.
pub fn recv_fd(socket_fd: RawFd) -> RialtoResult<RawFd> {
    let mut payload = [0u8; 1];
    let iov = libc::iovec {
        iov_base: payload.as_mut_ptr() as *mut libc::c_void,
        iov_len: payload.len(),
    };

    let mut cmsg_buf = [0u8; CMSG_BUF_LEN];
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &iov as *const _ as *mut _;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = cmsg_buf.len() as _;

    unsafe {
        let received = libc::recvmsg(socket_fd, &mut msg, 0);
        if received < 0 {
            return Err(RialtoError::Transport(format!(
                "recvmsg failed: {}",
                std::io::Error::last_os_error()
            )));
        }
        if received == 0 {
            return Err(RialtoError::Transport("peer closed before sending fd".into()));
        }

        let cmsg = libc::CMSG_FIRSTHDR(&msg);
        if cmsg.is_null()
            || (*cmsg).cmsg_level != libc::SOL_SOCKET
            || (*cmsg).cmsg_type != libc::SCM_RIGHTS
        {
            return Err(RialtoError::Protocol(
                "expected SCM_RIGHTS ancillary data, got none".into(),
            ));
        }
        let fd = std::ptr::read(libc::CMSG_DATA(cmsg) as *const RawFd);
        Ok(fd)
    }
}

/// `const`-evaluable equivalent of `libc::CMSG_SPACE` for a fixed payload
/// size, usable in an array-length position.
const fn cmsg_space(payload_len: usize) -> usize {
    // CMSG_SPACE = align(sizeof(cmsghdr)) + align(payload_len), both aligned
    // to size_of::<usize>() on every platform libc targets here.
    let align = mem::size_of::<usize>();
    let hdr = (mem::size_of::<libc::cmsghdr>() + align - 1) / align * align;
    let data = (payload_len + align - 1) / align * align;
    hdr + data
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_an_fd_over_a_socketpair() {
        let mut fds = [0 as RawFd; 2];
        let rc = unsafe {
            libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr())
        };
        assert_eq!(rc, 0);
        let (a, b) = (fds[0], fds[1]);

        // Pass stdin's fd (always valid) as the payload; just checking the
        // ancillary-data plumbing, not the referent.
        let sent_fd = 0;
        send_fd(a, sent_fd).unwrap();
        let received = recv_fd(b).unwrap();
        assert!(received >= 0);

        unsafe {
            libc::close(a);
            libc::close(b);
            libc::close(received);
        }
    }
}
