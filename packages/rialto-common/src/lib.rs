//! Shared wire types, RPC channel transport, and shared-memory frame layout
//! for Rialto's client/server media-playback IPC.
//!
//! This crate is the one both ends of the Unix-domain socket link against:
//! the [`channel`] multiplex and [`blocking_closure`] synchronization are
//! identical in each direction, and the [`protocol`] vocabulary plus
//! [`shm_layout`] frame formats must agree byte-for-byte between writer and
//! reader. `rialto-client` and `rialto-server` each add the half of the
//! system that differs.

pub mod blocking_closure;
pub mod channel;
pub mod error;
#[cfg(unix)]
pub mod fd_passing;
pub mod protocol;
pub mod shm_layout;
pub mod wire;

pub use blocking_closure::{BlockingClosure, PollClosure, SemaphoreClosure};
pub use channel::{Channel, EventDescriptor, SubscriptionId};
pub use error::{ErrorCode, RialtoError, RialtoResult};
pub use protocol::{
    CipherMode, EncryptionInfo, HaveDataStatus, MediaSegment, MediaSource, MediaSourceShape,
    MediaSourceType, NetworkStateChange, PlaybackErrorKind, PlaybackStateChange, PlaybackStats,
    QosInfo, RequestId, RpcRequest, RpcResponse, SegmentAlignment, ServerEvent,
    ServerProcessState, SessionId, ShmInfo, SourceId, StreamFormat, SubSample,
};
pub use shm_layout::{
    FrameMetadataV1, FrameMetadataV2, ShmPartition, ShmVersion, MAX_FRAMES_PER_NEED_DATA,
    MIN_METADATA_REGION_BYTES, V1_FRAME_STRUCT_SIZE, V1_IV_LENGTH, V1_MAX_INLINE_EXTRA_DATA,
};
pub use wire::{CallId, Envelope, MAX_FRAME_BYTES};
