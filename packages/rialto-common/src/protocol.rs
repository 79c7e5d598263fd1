//! Typed schema for the RPC + event plane shared between client and server.
//!
//! `spec.md` treats the concrete wire framing as an external collaborator
//! ("a suitable framed, length-prefixed RPC with a typed schema is assumed")
//! and lists only the minimum verb/event set needed to illustrate the
//! contracts (§4.7, §6). These types are that minimum set, serialized by
//! [`crate::wire`].

use serde::{Deserialize, Serialize};

/// A session-scoped source id, assigned on successful `AttachSource`.
pub type SourceId = i32;
/// A session id, assigned on `CreateSession`.
pub type SessionId = i32;
/// Correlation id for an outstanding NeedData/HaveData handshake.
pub type RequestId = u32;

/// Typed stream kind for a [`MediaSource`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MediaSourceType {
    Audio,
    Video,
    VideoDolbyVision,
    Subtitle,
}

/// Alignment of samples within a segment, as negotiated at attach time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SegmentAlignment {
    Undefined,
    Nal,
    Au,
}

/// Container/stream format of the encoded samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StreamFormat {
    Raw,
    AvcNal,
    AvcByteStream,
    Other,
}

/// Type-specific shape of a [`MediaSource`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MediaSourceShape {
    Audio {
        sample_rate: u32,
        number_of_channels: u32,
    },
    Video {
        width: u32,
        height: u32,
    },
    VideoDolbyVision {
        width: u32,
        height: u32,
        dolby_vision_profile: u32,
    },
    Subtitle {
        text_track_identifier: String,
    },
}

/// A media stream a session attaches before playback can start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaSource {
    pub source_type: MediaSourceType,
    pub mime_type: String,
    pub has_drm: bool,
    pub shape: MediaSourceShape,
    pub alignment: SegmentAlignment,
    pub stream_format: StreamFormat,
    pub codec_data: Option<Vec<u8>>,
}

/// Sub-sample table entry for an encrypted segment (CENC-style).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubSample {
    pub num_clear_bytes: u32,
    pub num_encrypted_bytes: u32,
}

/// Cipher mode for encrypted segments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CipherMode {
    Cenc,
    Cbcs,
}

/// Encryption metadata attached to a segment, when present.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EncryptionInfo {
    pub key_session_id: i32,
    pub key_id: Vec<u8>,
    pub init_vector: Vec<u8>,
    pub init_with_last_15: bool,
    pub sub_samples: Vec<SubSample>,
    pub cipher_mode: Option<CipherMode>,
    pub crypt_byte_block: Option<u8>,
    pub skip_byte_block: Option<u8>,
}

/// One encoded sample, as handed to `MediaPipelineSession::add_segment`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaSegment {
    pub source_id: SourceId,
    pub timestamp_ns: i64,
    pub duration_ns: i64,
    pub extra_data: Option<Vec<u8>>,
    pub segment_alignment: Option<SegmentAlignment>,
    pub encryption: Option<EncryptionInfo>,
    /// Audio/video codec-specific extra fields, carried alongside the
    /// payload rather than duplicated into `MediaSource`.
    pub sample_rate: Option<u32>,
    pub number_of_channels: Option<u32>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub payload: Vec<u8>,
}

/// Playback state as reported by the server (§4.6 table).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PlaybackStateChange {
    Playing,
    Paused,
    Seeking,
    SeekDone,
    Stopped,
    EndOfStream,
    Failure,
}

/// Network/buffering state as reported by the server (§4.6 table).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NetworkStateChange {
    Buffering,
    BufferingProgress,
    Stalled,
    FormatError,
    NetworkError,
    DecodeError,
}

/// QoS sample pushed by the server.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QosInfo {
    pub source_id: SourceId,
    pub frames_dropped: u64,
    pub frames_rendered: u64,
}

/// Kind of playback error forwarded unchanged to the application (§7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PlaybackErrorKind {
    Decryption,
    Decode,
    Other,
}

/// Shared-memory addressing for one `NeedMediaData` batch (§4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShmInfo {
    pub max_metadata_bytes: u32,
    pub metadata_offset: u32,
    pub media_offset: u32,
    pub max_media_bytes: u32,
}

/// Status reported back in `HaveData` (§4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HaveDataStatus {
    Ok,
    Eos,
    Failed,
}

/// Playback statistics returned by `GetStats`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PlaybackStats {
    pub rendered_frames: u64,
    pub dropped_frames: u64,
}

/// Server-to-client events, sharing the same transport as the RPC plane
/// (§4.7, §6).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerEvent {
    NeedMediaData {
        session_id: SessionId,
        source_id: SourceId,
        frame_count: u32,
        request_id: RequestId,
        shm_info: ShmInfo,
    },
    PlaybackStateChanged {
        session_id: SessionId,
        state: PlaybackStateChange,
    },
    NetworkStateChanged {
        session_id: SessionId,
        state: NetworkStateChange,
    },
    PositionChanged {
        session_id: SessionId,
        position_ns: i64,
    },
    Qos {
        session_id: SessionId,
        info: QosInfo,
    },
    SourceFlushed {
        session_id: SessionId,
        source_id: SourceId,
    },
    PlaybackError {
        session_id: SessionId,
        source_id: SourceId,
        kind: PlaybackErrorKind,
    },
    SetLogLevels {
        levels: String,
    },
    /// Fan-in acknowledgement for one outstanding heartbeat ping, delivered
    /// to the parent once every traversed component has released its
    /// refcounted handler (§4.11/§4.12).
    HeartbeatAck {
        id: u64,
        success: bool,
    },
    /// Pushed by `SessionServerManager` to the parent whenever the process's
    /// lifecycle state changes, including rollback outcomes (§4.8).
    ProcessStateChanged {
        state: ServerProcessState,
    },
}

/// Inbound RPC methods, minimum verb set per §4.7/§6.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RpcRequest {
    GetSharedMemory,
    CreateSession,
    DestroySession {
        session_id: SessionId,
    },
    Load {
        session_id: SessionId,
        mime_type: String,
    },
    AttachSource {
        session_id: SessionId,
        source: MediaSource,
    },
    RemoveSource {
        session_id: SessionId,
        source_id: SourceId,
    },
    AllSourcesAttached {
        session_id: SessionId,
    },
    Play {
        session_id: SessionId,
    },
    Pause {
        session_id: SessionId,
    },
    Stop {
        session_id: SessionId,
    },
    SetPosition {
        session_id: SessionId,
        position_ns: i64,
    },
    GetPosition {
        session_id: SessionId,
    },
    HaveData {
        session_id: SessionId,
        status: HaveDataStatus,
        num_frames: u32,
        request_id: RequestId,
    },
    SetVideoWindow {
        session_id: SessionId,
        x: u32,
        y: u32,
        width: u32,
        height: u32,
    },
    SetPlaybackRate {
        session_id: SessionId,
        rate: f64,
    },
    SetVolume {
        session_id: SessionId,
        volume: f64,
    },
    GetVolume {
        session_id: SessionId,
    },
    SetMute {
        session_id: SessionId,
        source_id: SourceId,
        mute: bool,
    },
    GetMute {
        session_id: SessionId,
        source_id: SourceId,
    },
    GetStats {
        session_id: SessionId,
        source_id: SourceId,
    },
    Flush {
        session_id: SessionId,
        source_id: SourceId,
        reset_time: bool,
    },
    ProcessAudioGap {
        session_id: SessionId,
        position_ns: i64,
        duration_ns: i64,
        discontinuity_gap: i32,
        audio_aac: bool,
    },
    // Parent-process control plane (§4.9, ApplicationManagementServer).
    SetConfiguration {
        socket_path: Option<String>,
        socket_fd: Option<i32>,
        /// Permission bits applied with `chmod` after the socket is bound,
        /// when `socket_path` is used (§6). Defaults to `0o666`.
        socket_permissions: u32,
        /// Owning user to `chown` the socket to, if non-empty (§6).
        socket_owner: String,
        /// Owning group to `chown` the socket to, if non-empty (§6).
        socket_group: String,
        max_playbacks: u32,
        max_web_audio_players: u32,
        client_display_name: String,
        resource_manager_app_name: String,
        initial_state: ServerProcessState,
    },
    SetState {
        state: ServerProcessState,
    },
    SetLogLevels {
        levels: String,
    },
    Ping {
        id: u64,
    },
}

/// Response to an `RpcRequest`, correlated by call id at the Channel layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RpcResponse {
    Ack,
    Failed { reason: String },
    SharedMemory { fd_token: u32, size: u32 },
    SessionCreated { session_id: SessionId },
    SourceAttached { source_id: SourceId },
    Position { position_ns: i64 },
    Volume { volume: f64 },
    Mute { mute: bool },
    Stats { stats: PlaybackStats },
}

/// Server-process lifecycle state (§3.1 ServerProcessState, §4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerProcessState {
    Uninitialized,
    Inactive,
    Active,
    NotRunning,
    Error,
}
