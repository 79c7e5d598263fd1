//! Guest-side Rialto client: connects to the server over a preopened Unix
//! socket or socket path, maps the server's shared-memory buffer, and drives
//! one or more media-playback sessions over it.
//!
//! [`IpcClient`] owns the transport and its event-loop thread; [`ShmRegion`]
//! owns the mapped buffer; [`MediaPipelineSession`] is the per-playback
//! state machine that correlates `NeedData`/`HaveData` against it via
//! [`FrameWriter`].

pub mod config;
pub mod frame_writer;
pub mod ipc_client;
pub mod media_pipeline_session;
pub mod shm_region;

pub use config::RialtoClientConfig;
pub use frame_writer::{FrameWriter, WriteStatus};
pub use ipc_client::IpcClient;
pub use media_pipeline_session::{
    MediaPipelineListener, MediaPipelineSession, NoopMediaPipelineListener, SessionPlaybackState,
};
pub use shm_region::{ApplicationState, ShmConsumer, ShmRegion};
