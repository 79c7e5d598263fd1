//! `ShmRegion` (C4, §4.4): client-side mapping of the server's shared-memory buffer.
//!
//! Mapping uses `libc::{mmap, munmap}` directly rather than a RAII `Mmap`
//! wrapper (grounded on `daemon-stream/src/unix/mod.rs`'s direct-`libc`
//! style), because the fd arrives from the peer rather than being opened
//! locally and the required "notify consumers, then unmap" ordering in
//! §4.4 doesn't fit a type that unmaps on `Drop`.

use std::ffi::c_void;
use std::os::unix::io::RawFd;
use std::ptr;
use std::sync::Arc;

use parking_lot::Mutex;

use rialto_common::error::{RialtoError, RialtoResult};
use rialto_common::{RpcRequest, RpcResponse};

use crate::ipc_client::IpcClient;

/// Process-wide, user-visible lifecycle of the guest application, mirrored
/// into the client by the embedding process (glossary: "Application state").
/// Distinct from [`rialto_common::ServerProcessState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplicationState {
    Inactive,
    Running,
    Unknown,
}

/// Registered for synchronous notification before the shm region is
/// unmapped (§4.4 Teardown, §8 P4).
pub trait ShmConsumer: Send + Sync {
    /// Called once, synchronously, before `munmap`. The region's base
    /// pointer has already been cleared by the time this returns —
    /// `sharedMemoryBuffer()` observes `None` during and after this call.
    fn on_teardown(&self);
}

struct MappedState {
    fd: Option<RawFd>,
    base: Option<usize>,
    size: usize,
}

/// Client-side handle to the server-provided shared-memory buffer.
pub struct ShmRegion {
    ipc: Arc<IpcClient>,
    /// Serializes `setApplicationState` end to end (§4.4 "Operations
    /// serialized under one lock").
    op_lock: Mutex<()>,
    /// Guards `(fd, base_ptr, size)` (§5 shared-resource policy).
    state: Mutex<MappedState>,
    /// Guards the consumer set, taken independently of `state` so teardown
    /// can release it before re-taking `state` to unmap (§4.4, §5).
    consumers: Mutex<Vec<Arc<dyn ShmConsumer>>>,
    app_state: Mutex<ApplicationState>,
}

impl ShmRegion {
    #[must_use]
    pub fn new(ipc: Arc<IpcClient>) -> Arc<Self> {
        Arc::new(Self {
            ipc,
            op_lock: Mutex::new(()),
            state: Mutex::new(MappedState {
                fd: None,
                base: None,
                size: 0,
            }),
            consumers: Mutex::new(Vec::new()),
            app_state: Mutex::new(ApplicationState::Unknown),
        })
    }

    /// Registers a consumer for the teardown notification. No-op if already
    /// registered (set semantics, §4.4).
    pub fn register_client(&self, consumer: Arc<dyn ShmConsumer>) {
        let mut consumers = self.consumers.lock();
        if !consumers.iter().any(|c| Arc::ptr_eq(c, &consumer)) {
            consumers.push(consumer);
        }
    }

    pub fn unregister_client(&self, consumer: &Arc<dyn ShmConsumer>) {
        self.consumers
            .lock()
            .retain(|c| !Arc::ptr_eq(c, consumer));
    }

    /// Current mapped base address, or `None` if unmapped (§4.4
    /// `sharedMemoryBuffer()`).
    #[must_use]
    pub fn shared_memory_buffer(&self) -> Option<usize> {
        self.state.lock().base
    }

    #[must_use]
    pub fn mapped_size(&self) -> usize {
        self.state.lock().size
    }

    /// Drives the INACTIVE↔RUNNING transitions described in §4.4. Same-state
    /// requests are no-ops that return success.
    pub fn set_application_state(&self, new_state: ApplicationState) -> RialtoResult<()> {
        let _op_guard = self.op_lock.lock();
        let was_mapped = self.state.lock().base.is_some();

        let result = match new_state {
            ApplicationState::Running if !was_mapped => self.acquire_and_map(),
            ApplicationState::Inactive | ApplicationState::Unknown if was_mapped => {
                self.notify_and_teardown();
                Ok(())
            }
            _ => Ok(()),
        };

        if result.is_ok() {
            *self.app_state.lock() = new_state;
        }
        result
    }

    fn acquire_and_map(&self) -> RialtoResult<()> {
        let (response, fd) = self
            .ipc
            .channel()
            .call_with_fd(RpcRequest::GetSharedMemory)?;
        let size = match response {
            RpcResponse::SharedMemory { size, .. } => size,
            other => {
                return Err(RialtoError::Protocol(format!(
                    "GetSharedMemory returned unexpected response: {other:?}"
                )))
            }
        };

        if fd < 0 || size == 0 {
            if fd >= 0 {
                unsafe {
                    libc::close(fd);
                }
            }
            return Err(RialtoError::Resource(
                "GetSharedMemory returned an invalid fd or zero size".into(),
            ));
        }

        // Safety: `fd` was just handed to us by the server over the control
        // channel and is not otherwise in use by this process.
        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size as usize,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            let err = std::io::Error::last_os_error();
            unsafe {
                libc::close(fd);
            }
            return Err(RialtoError::Resource(format!("mmap failed: {err}")));
        }

        let mut state = self.state.lock();
        state.fd = Some(fd);
        state.base = Some(base as usize);
        state.size = size as usize;
        Ok(())
    }

    /// Test-only seam: lets other modules' tests (e.g. `MediaPipelineSession`)
    /// exercise mapped-state behavior without a real `GetSharedMemory` round
    /// trip.
    #[cfg(test)]
    pub(crate) fn test_force_mapped(&self, base: usize, size: usize) {
        let mut state = self.state.lock();
        state.fd = None;
        state.base = Some(base);
        state.size = size;
    }

    fn notify_and_teardown(&self) {
        let (fd, base, size) = {
            let mut state = self.state.lock();
            let fd = state.fd.take();
            let base = state.base.take();
            let size = state.size;
            state.size = 0;
            (fd, base, size)
        };

        {
            let consumers = self.consumers.lock();
            for consumer in consumers.iter() {
                consumer.on_teardown();
            }
        }

        if let Some(base) = base {
            unsafe {
                libc::munmap(base as *mut c_void, size);
            }
        }
        if let Some(fd) = fd {
            unsafe {
                libc::close(fd);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingConsumer {
        teardown_calls: AtomicUsize,
    }

    impl CountingConsumer {
        fn new() -> Self {
            Self {
                teardown_calls: AtomicUsize::new(0),
            }
        }
    }

    #[test]
    fn no_op_transitions_return_success_without_touching_state() {
        // Constructing an IpcClient requires a live socket; this property
        // only concerns the no-op branches, which never call into it, so a
        // region built with a throwaway client is sufficient to exercise it.
        let (a, _b) = std::os::unix::net::UnixStream::pair().unwrap();
        use std::os::unix::io::IntoRawFd;
        let fd = a.into_raw_fd();
        let ipc =
            IpcClient::connect(crate::config::RialtoClientConfig::PreopenedFd(fd)).unwrap();
        let region = ShmRegion::new(ipc);

        // INACTIVE -> INACTIVE is a no-op.
        assert!(region.set_application_state(ApplicationState::Inactive).is_ok());
        assert!(region.shared_memory_buffer().is_none());
    }

    #[test]
    fn consumer_set_has_no_duplicates() {
        let consumer: Arc<dyn ShmConsumer> = Arc::new(CountingConsumer::new());
        let (a, _b) = std::os::unix::net::UnixStream::pair().unwrap();
        use std::os::unix::io::IntoRawFd;
        let fd = a.into_raw_fd();
        let ipc =
            IpcClient::connect(crate::config::RialtoClientConfig::PreopenedFd(fd)).unwrap();
        let region = ShmRegion::new(ipc);

        region.register_client(Arc::clone(&consumer));
        region.register_client(Arc::clone(&consumer));
        assert_eq!(region.consumers.lock().len(), 1);

        region.unregister_client(&consumer);
        assert_eq!(region.consumers.lock().len(), 0);
    }

    impl ShmConsumer for CountingConsumer {
        fn on_teardown(&self) {
            self.teardown_calls.fetch_add(1, Ordering::SeqCst);
        }
    }
}
