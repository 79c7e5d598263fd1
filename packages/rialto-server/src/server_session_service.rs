//! Per-session server-side state/decoder-pipeline contract (C7, §4.7).
//!
//! The media engine itself — decoders, renderers, clocks — is an explicit
//! non-goal (§1); this module specifies only the two interfaces the rest of
//! the core drives it through: the inbound RPC surface a concrete session
//! implementation answers, and the outbound event sink it pushes state
//! changes through. Grounded on the teacher's `EventEmitter` split
//! (`events/emitter.rs`): services depend on a trait, not on how events
//! reach the client.

use rialto_common::error::RialtoResult;
use rialto_common::protocol::{
    HaveDataStatus, MediaSource, NetworkStateChange, PlaybackErrorKind, PlaybackStateChange,
    PlaybackStats, QosInfo, RequestId, SessionId, ShmInfo, SourceId,
};

use crate::heartbeat::Handler;

/// Outbound events a [`ServerSessionService`] pushes for its session,
/// decoupled from how they reach the client (§4.7; mirrors the
/// session-scoped variants of [`rialto_common::ServerEvent`]).
pub trait PlaybackEventSink: Send + Sync {
    fn playback_state_changed(&self, session_id: SessionId, state: PlaybackStateChange);
    fn network_state_changed(&self, session_id: SessionId, state: NetworkStateChange);
    fn position_changed(&self, session_id: SessionId, position_ns: i64);
    #[allow(clippy::too_many_arguments)]
    fn need_media_data(
        &self,
        session_id: SessionId,
        source_id: SourceId,
        frame_count: u32,
        request_id: RequestId,
        shm_info: ShmInfo,
    );
    fn qos(&self, session_id: SessionId, info: QosInfo);
    fn source_flushed(&self, session_id: SessionId, source_id: SourceId);
    fn playback_error(&self, session_id: SessionId, source_id: SourceId, kind: PlaybackErrorKind);
}

/// Discards every event. Used where a session exists only to exercise the
/// RPC contract, mirroring the teacher's `NoopEventEmitter`.
pub struct NoopPlaybackEventSink;

impl PlaybackEventSink for NoopPlaybackEventSink {
    fn playback_state_changed(&self, _session_id: SessionId, _state: PlaybackStateChange) {}
    fn network_state_changed(&self, _session_id: SessionId, _state: NetworkStateChange) {}
    fn position_changed(&self, _session_id: SessionId, _position_ns: i64) {}
    fn need_media_data(
        &self,
        _session_id: SessionId,
        _source_id: SourceId,
        _frame_count: u32,
        _request_id: RequestId,
        _shm_info: ShmInfo,
    ) {
    }
    fn qos(&self, _session_id: SessionId, _info: QosInfo) {}
    fn source_flushed(&self, _session_id: SessionId, _source_id: SourceId) {}
    fn playback_error(
        &self,
        _session_id: SessionId,
        _source_id: SourceId,
        _kind: PlaybackErrorKind,
    ) {
    }
}

/// Logs every event at debug level, mirroring the teacher's
/// `LoggingEventEmitter`. Useful while wiring a concrete session
/// implementation before a real transport is attached.
pub struct LoggingPlaybackEventSink;

impl PlaybackEventSink for LoggingPlaybackEventSink {
    fn playback_state_changed(&self, session_id: SessionId, state: PlaybackStateChange) {
        tracing::debug!(session_id, ?state, "playback_state_changed");
    }
    fn network_state_changed(&self, session_id: SessionId, state: NetworkStateChange) {
        tracing::debug!(session_id, ?state, "network_state_changed");
    }
    fn position_changed(&self, session_id: SessionId, position_ns: i64) {
        tracing::debug!(session_id, position_ns, "position_changed");
    }
    fn need_media_data(
        &self,
        session_id: SessionId,
        source_id: SourceId,
        frame_count: u32,
        request_id: RequestId,
        shm_info: ShmInfo,
    ) {
        tracing::debug!(
            session_id,
            source_id,
            frame_count,
            request_id,
            ?shm_info,
            "need_media_data"
        );
    }
    fn qos(&self, session_id: SessionId, info: QosInfo) {
        tracing::debug!(session_id, ?info, "qos");
    }
    fn source_flushed(&self, session_id: SessionId, source_id: SourceId) {
        tracing::debug!(session_id, source_id, "source_flushed");
    }
    fn playback_error(&self, session_id: SessionId, source_id: SourceId, kind: PlaybackErrorKind) {
        tracing::debug!(session_id, source_id, ?kind, "playback_error");
    }
}

/// Inbound RPC surface one playback session answers (§4.7). A concrete
/// implementation owns the real decoder pipeline; this core specifies only
/// the contract and the session-lifecycle coupling it must honor (heartbeat
/// fan-in, in particular).
pub trait ServerSessionService: Send + Sync {
    fn load(&self, mime_type: &str) -> RialtoResult<()>;
    fn attach_source(&self, source: MediaSource) -> RialtoResult<SourceId>;
    fn remove_source(&self, source_id: SourceId) -> RialtoResult<()>;
    fn all_sources_attached(&self) -> RialtoResult<()>;
    fn play(&self) -> RialtoResult<()>;
    fn pause(&self) -> RialtoResult<()>;
    fn stop(&self) -> RialtoResult<()>;
    fn set_position(&self, position_ns: i64) -> RialtoResult<()>;
    fn get_position(&self) -> RialtoResult<i64>;
    fn have_data(
        &self,
        status: HaveDataStatus,
        num_frames: u32,
        request_id: RequestId,
    ) -> RialtoResult<()>;
    fn set_video_window(&self, x: u32, y: u32, width: u32, height: u32) -> RialtoResult<()>;
    fn set_playback_rate(&self, rate: f64) -> RialtoResult<()>;
    fn set_volume(&self, volume: f64) -> RialtoResult<()>;
    fn get_volume(&self) -> RialtoResult<f64>;
    fn set_mute(&self, source_id: SourceId, mute: bool) -> RialtoResult<()>;
    fn get_mute(&self, source_id: SourceId) -> RialtoResult<bool>;
    fn get_stats(&self, source_id: SourceId) -> RialtoResult<PlaybackStats>;
    fn flush(&self, source_id: SourceId, reset_time: bool) -> RialtoResult<()>;
    fn process_audio_gap(
        &self,
        position_ns: i64,
        duration_ns: i64,
        discontinuity_gap: i32,
        audio_aac: bool,
    ) -> RialtoResult<()>;

    /// Heartbeat fan-in entry point (§4.10, §9): propagate `handler` to
    /// every active sub-component inside this session (e.g. one per
    /// key-session) before it is released. The default releases it
    /// immediately, appropriate for a session with no further components to
    /// fan out to.
    fn heartbeat(&self, handler: Handler) {
        drop(handler);
    }
}

/// Minimal, non-decoding [`ServerSessionService`]: tracks nothing beyond
/// what the RPC contract requires an answer for, and never emits events.
/// Exists so [`crate::session_management_server::SessionManagementServer`]
/// has something to dispatch to while the real codec/renderer stack — out
/// of scope here per §1 — is absent.
pub struct StubSessionService;

impl ServerSessionService for StubSessionService {
    fn load(&self, _mime_type: &str) -> RialtoResult<()> {
        Ok(())
    }
    fn attach_source(&self, _source: MediaSource) -> RialtoResult<SourceId> {
        Ok(1)
    }
    fn remove_source(&self, _source_id: SourceId) -> RialtoResult<()> {
        Ok(())
    }
    fn all_sources_attached(&self) -> RialtoResult<()> {
        Ok(())
    }
    fn play(&self) -> RialtoResult<()> {
        Ok(())
    }
    fn pause(&self) -> RialtoResult<()> {
        Ok(())
    }
    fn stop(&self) -> RialtoResult<()> {
        Ok(())
    }
    fn set_position(&self, _position_ns: i64) -> RialtoResult<()> {
        Ok(())
    }
    fn get_position(&self) -> RialtoResult<i64> {
        Ok(0)
    }
    fn have_data(
        &self,
        _status: HaveDataStatus,
        _num_frames: u32,
        _request_id: RequestId,
    ) -> RialtoResult<()> {
        Ok(())
    }
    fn set_video_window(&self, _x: u32, _y: u32, _width: u32, _height: u32) -> RialtoResult<()> {
        Ok(())
    }
    fn set_playback_rate(&self, _rate: f64) -> RialtoResult<()> {
        Ok(())
    }
    fn set_volume(&self, _volume: f64) -> RialtoResult<()> {
        Ok(())
    }
    fn get_volume(&self) -> RialtoResult<f64> {
        Ok(1.0)
    }
    fn set_mute(&self, _source_id: SourceId, _mute: bool) -> RialtoResult<()> {
        Ok(())
    }
    fn get_mute(&self, _source_id: SourceId) -> RialtoResult<bool> {
        Ok(false)
    }
    fn get_stats(&self, _source_id: SourceId) -> RialtoResult<PlaybackStats> {
        Ok(PlaybackStats::default())
    }
    fn flush(&self, _source_id: SourceId, _reset_time: bool) -> RialtoResult<()> {
        Ok(())
    }
    fn process_audio_gap(
        &self,
        _position_ns: i64,
        _duration_ns: i64,
        _discontinuity_gap: i32,
        _audio_aac: bool,
    ) -> RialtoResult<()> {
        Ok(())
    }
}
