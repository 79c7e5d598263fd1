//! `MediaPipelineSession` (C6, §4.6) — the synchronization pivot of the client.
//!
//! Per §9's "cyclic ownership" design note, the session owns its `IpcClient`
//! reference but the event subscriptions only hold a `Weak` back-reference
//! to the session itself, so the IPC layer never keeps the session alive
//! past the point the application drops it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};

use rialto_common::channel::EventDescriptor;
use rialto_common::error::{RialtoError, RialtoResult};
use rialto_common::protocol::{
    HaveDataStatus, MediaSegment, MediaSource, MediaSourceType, NetworkStateChange,
    PlaybackErrorKind, PlaybackStateChange, PlaybackStats, QosInfo, RequestId, RpcRequest,
    RpcResponse, ServerEvent, SessionId, SourceId,
};
use rialto_common::shm_layout::{ShmPartition, ShmVersion};

use crate::frame_writer::{FrameWriter, WriteStatus};
use crate::ipc_client::IpcClient;
use crate::shm_region::{ApplicationState, ShmRegion};

/// Client-visible playback state, maintained by the table in §4.6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPlaybackState {
    Idle,
    Buffering,
    Playing,
    Seeking,
    Failure,
    EndOfStream,
}

/// Callback target for session notifications, decoupling the session from
/// whatever delivers them to the guest application (grounded on the
/// teacher's `EventEmitter` trait, `events/emitter.rs`).
pub trait MediaPipelineListener: Send + Sync {
    fn notify_need_media_data(&self, source_id: SourceId, request_id: RequestId, frame_count: u32);
    fn notify_playback_state(&self, state: SessionPlaybackState) {
        let _ = state;
    }
    fn notify_position(&self, position_ns: i64) {
        let _ = position_ns;
    }
    fn notify_qos(&self, info: QosInfo) {
        let _ = info;
    }
    fn notify_source_flushed(&self, source_id: SourceId) {
        let _ = source_id;
    }
    fn notify_playback_error(&self, source_id: SourceId, kind: PlaybackErrorKind) {
        let _ = (source_id, kind);
    }
}

/// Discards every notification; useful for tests or headless embedding.
pub struct NoopMediaPipelineListener;
impl MediaPipelineListener for NoopMediaPipelineListener {
    fn notify_need_media_data(&self, _: SourceId, _: RequestId, _: u32) {}
}

struct AttachedSourceEntry {
    source_type: MediaSourceType,
    flushing: AtomicBool,
}

struct NeedDataEntry {
    source_id: SourceId,
    shm_partition: ShmPartition,
    frame_writer: Option<FrameWriter>,
}

/// Per-session state machine correlating NeedData/HaveData with flush, seek,
/// EOS and application-state transitions (§3.1, §4.6).
pub struct MediaPipelineSession {
    session_id: SessionId,
    ipc: Arc<IpcClient>,
    shm: Arc<ShmRegion>,
    listener: Arc<dyn MediaPipelineListener>,
    /// Process-wide, one-writer `key_session_id -> key_id` map filled by the
    /// (out-of-scope) CDM service (§4.6 `addSegment`).
    key_ids: Arc<DashMap<i32, Vec<u8>>>,

    playback_state: Mutex<SessionPlaybackState>,
    app_state: Mutex<ApplicationState>,
    attached_sources: DashMap<SourceId, AttachedSourceEntry>,
    pending_need_data: Mutex<HashMap<RequestId, NeedDataEntry>>,
    attaching_source: Mutex<bool>,
    attaching_source_cv: Condvar,
    flush_lock: Mutex<()>,
    subscriptions: Mutex<Vec<rialto_common::channel::SubscriptionId>>,
}

impl MediaPipelineSession {
    /// Calls `CreateSession`, then wires up event subscriptions for the
    /// returned session id.
    pub fn create(
        ipc: Arc<IpcClient>,
        shm: Arc<ShmRegion>,
        listener: Arc<dyn MediaPipelineListener>,
        key_ids: Arc<DashMap<i32, Vec<u8>>>,
    ) -> RialtoResult<Arc<Self>> {
        let response = ipc.call_blocking(RpcRequest::CreateSession)?;
        let session_id = match response {
            RpcResponse::SessionCreated { session_id } => session_id,
            other => {
                return Err(RialtoError::Protocol(format!(
                    "CreateSession returned unexpected response: {other:?}"
                )))
            }
        };

        let session = Arc::new(Self {
            session_id,
            ipc,
            shm,
            listener,
            key_ids,
            playback_state: Mutex::new(SessionPlaybackState::Idle),
            app_state: Mutex::new(ApplicationState::Unknown),
            attached_sources: DashMap::new(),
            pending_need_data: Mutex::new(HashMap::new()),
            attaching_source: Mutex::new(false),
            attaching_source_cv: Condvar::new(),
            flush_lock: Mutex::new(()),
            subscriptions: Mutex::new(Vec::new()),
        });
        session.subscribe_to_events();
        Ok(session)
    }

    #[must_use]
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    #[must_use]
    pub fn playback_state(&self) -> SessionPlaybackState {
        *self.playback_state.lock()
    }

    fn subscribe_to_events(self: &Arc<Self>) {
        let channel = Arc::clone(self.ipc.channel());
        let mut ids = Vec::new();

        macro_rules! on_event {
            ($descriptor:expr, $method:ident) => {{
                let weak: Weak<Self> = Arc::downgrade(self);
                channel.subscribe($descriptor, move |event| {
                    if let Some(session) = weak.upgrade() {
                        session.$method(event);
                    }
                })
            }};
        }

        ids.push(on_event!(EventDescriptor::NeedMediaData, on_need_media_data));
        ids.push(on_event!(
            EventDescriptor::PlaybackStateChanged,
            on_playback_state_changed
        ));
        ids.push(on_event!(
            EventDescriptor::NetworkStateChanged,
            on_network_state_changed
        ));
        ids.push(on_event!(EventDescriptor::PositionChanged, on_position_changed));
        ids.push(on_event!(EventDescriptor::Qos, on_qos));
        ids.push(on_event!(EventDescriptor::SourceFlushed, on_source_flushed));
        ids.push(on_event!(EventDescriptor::PlaybackError, on_playback_error));

        *self.subscriptions.lock() = ids;
    }

    fn set_state(&self, new_state: SessionPlaybackState) {
        *self.playback_state.lock() = new_state;
        self.listener.notify_playback_state(new_state);
    }

    fn on_network_state_changed(&self, event: ServerEvent) {
        let ServerEvent::NetworkStateChanged { session_id, state } = event else {
            return;
        };
        if session_id != self.session_id {
            return;
        }
        let new_state = match state {
            NetworkStateChange::Buffering
            | NetworkStateChange::BufferingProgress
            | NetworkStateChange::Stalled => SessionPlaybackState::Buffering,
            NetworkStateChange::FormatError
            | NetworkStateChange::NetworkError
            | NetworkStateChange::DecodeError => SessionPlaybackState::Failure,
        };
        self.set_state(new_state);
    }

    fn on_playback_state_changed(&self, event: ServerEvent) {
        let ServerEvent::PlaybackStateChanged { session_id, state } = event else {
            return;
        };
        if session_id != self.session_id {
            return;
        }
        let new_state = match state {
            PlaybackStateChange::Playing | PlaybackStateChange::Paused => {
                SessionPlaybackState::Playing
            }
            PlaybackStateChange::Seeking => SessionPlaybackState::Seeking,
            PlaybackStateChange::SeekDone => SessionPlaybackState::Buffering,
            PlaybackStateChange::Stopped => SessionPlaybackState::Idle,
            PlaybackStateChange::EndOfStream => SessionPlaybackState::EndOfStream,
            PlaybackStateChange::Failure => SessionPlaybackState::Failure,
        };
        self.set_state(new_state);
    }

    fn on_position_changed(&self, event: ServerEvent) {
        if let ServerEvent::PositionChanged { session_id, position_ns } = event {
            if session_id == self.session_id {
                self.listener.notify_position(position_ns);
            }
        }
    }

    fn on_qos(&self, event: ServerEvent) {
        if let ServerEvent::Qos { session_id, info } = event {
            if session_id == self.session_id {
                self.listener.notify_qos(info);
            }
        }
    }

    fn on_playback_error(&self, event: ServerEvent) {
        if let ServerEvent::PlaybackError {
            session_id,
            source_id,
            kind,
        } = event
        {
            if session_id == self.session_id {
                // §7: forwarded unchanged, does not alter the state machine.
                self.listener.notify_playback_error(source_id, kind);
            }
        }
    }

    fn on_source_flushed(&self, event: ServerEvent) {
        let ServerEvent::SourceFlushed { session_id, source_id } = event else {
            return;
        };
        if session_id != self.session_id {
            return;
        }
        {
            let mut state = self.playback_state.lock();
            if *state == SessionPlaybackState::EndOfStream {
                *state = SessionPlaybackState::Buffering;
            }
        }
        if let Some(entry) = self.attached_sources.get(&source_id) {
            entry.flushing.store(false, Ordering::Release);
        }
        self.listener.notify_source_flushed(source_id);
    }

    fn on_need_media_data(&self, event: ServerEvent) {
        let ServerEvent::NeedMediaData {
            session_id,
            source_id,
            frame_count,
            request_id,
            shm_info,
        } = event
        else {
            return;
        };
        if session_id != self.session_id {
            return;
        }

        // 1. Never race with a source being attached.
        {
            let mut attaching = self.attaching_source.lock();
            while *attaching {
                self.attaching_source_cv.wait(&mut attaching);
            }
        }

        // 2. Unknown or flushing source: ignore.
        let flushing = match self.attached_sources.get(&source_id) {
            Some(entry) => entry.flushing.load(Ordering::Acquire),
            None => {
                tracing::debug!(source_id, request_id, "NeedData for unknown source, ignoring");
                return;
            }
        };
        if flushing {
            return;
        }

        // 3. Session state gate.
        match *self.playback_state.lock() {
            SessionPlaybackState::Buffering | SessionPlaybackState::Playing => {}
            SessionPlaybackState::Seeking => return,
            other => {
                tracing::warn!(?other, request_id, "NeedData outside BUFFERING/PLAYING, ignoring");
                return;
            }
        }

        // 4. Application-state gate.
        if *self.app_state.lock() != ApplicationState::Running {
            return;
        }

        // 5. Record and surface to the application.
        self.pending_need_data.lock().insert(
            request_id,
            NeedDataEntry {
                source_id,
                shm_partition: ShmPartition::from(shm_info),
                frame_writer: None,
            },
        );
        self.listener
            .notify_need_media_data(source_id, request_id, frame_count);
    }

    /// §4.6 `addSegment`. Lazily creates the `FrameWriter` on the first
    /// segment of a request, using the request's partition and `version`.
    pub fn add_segment(
        &self,
        request_id: RequestId,
        mut segment: MediaSegment,
        version: ShmVersion,
    ) -> RialtoResult<()> {
        let mut pending = self.pending_need_data.lock();
        let entry = pending
            .get_mut(&request_id)
            .ok_or_else(|| RialtoError::State(format!("no pending NeedData for {request_id}")))?;

        if let Some(source) = self.attached_sources.get(&entry.source_id) {
            if source.flushing.load(Ordering::Acquire) {
                // §4.6: a flushing source's segment is a benign drop, not an error.
                return Ok(());
            }
        }

        if let Some(info) = segment.encryption.as_mut() {
            if info.key_id.is_empty() {
                if let Some(key) = self.key_ids.get(&info.key_session_id) {
                    info.key_id = key.clone();
                }
            }
        }

        if entry.frame_writer.is_none() {
            let base = self
                .shm
                .shared_memory_buffer()
                .ok_or_else(|| RialtoError::Resource("shm region is not mapped".into()))?;
            entry.frame_writer = Some(FrameWriter::new(version, base, entry.shm_partition)?);
        }

        match entry.frame_writer.as_mut().unwrap().write_frame(&segment)? {
            WriteStatus::Ok => Ok(()),
            WriteStatus::NoSpace => Err(RialtoError::Capacity),
        }
    }

    /// §4.6 `haveData`.
    pub fn have_data(&self, request_id: RequestId, status: HaveDataStatus) -> RialtoResult<()> {
        let state = *self.playback_state.lock();
        match state {
            SessionPlaybackState::Buffering | SessionPlaybackState::Playing => {
                let removed = self.pending_need_data.lock().remove(&request_id);
                let Some(entry) = removed else {
                    return Ok(()); // cancelled already; benign
                };
                let num_frames = entry.frame_writer.as_ref().map_or(0, FrameWriter::num_frames);
                self.ipc.call_blocking(RpcRequest::HaveData {
                    session_id: self.session_id,
                    status,
                    num_frames,
                    request_id,
                })?;
                Ok(())
            }
            SessionPlaybackState::Seeking => {
                self.pending_need_data.lock().remove(&request_id);
                Ok(())
            }
            _ => {
                self.pending_need_data.lock().remove(&request_id);
                Err(RialtoError::State(
                    "haveData called outside BUFFERING/PLAYING/SEEKING".into(),
                ))
            }
        }
    }

    /// §4.6 `setPosition`: rejected in IDLE/FAILURE; otherwise invalidates
    /// every pending NeedDataRequest before forwarding the RPC.
    pub fn set_position(&self, position_ns: i64) -> RialtoResult<()> {
        if matches!(
            *self.playback_state.lock(),
            SessionPlaybackState::Idle | SessionPlaybackState::Failure
        ) {
            return Err(RialtoError::State("setPosition rejected in IDLE/FAILURE".into()));
        }
        self.pending_need_data.lock().clear();
        self.ipc.call_blocking(RpcRequest::SetPosition {
            session_id: self.session_id,
            position_ns,
        })?;
        Ok(())
    }

    pub fn get_position(&self) -> RialtoResult<i64> {
        match self
            .ipc
            .call_blocking(RpcRequest::GetPosition { session_id: self.session_id })?
        {
            RpcResponse::Position { position_ns } => Ok(position_ns),
            other => Err(RialtoError::Protocol(format!("unexpected response: {other:?}"))),
        }
    }

    /// §4.6 `flush`.
    pub fn flush(&self, source_id: SourceId, reset_time: bool) -> RialtoResult<()> {
        let _guard = self.flush_lock.lock();
        self.ipc.call_blocking(RpcRequest::Flush {
            session_id: self.session_id,
            source_id,
            reset_time,
        })?;
        if let Some(entry) = self.attached_sources.get(&source_id) {
            entry.flushing.store(true, Ordering::Release);
        }
        self.pending_need_data
            .lock()
            .retain(|_, entry| entry.source_id != source_id);
        Ok(())
    }

    /// §4.6 `notifyApplicationState`: clears the pending-need map immediately
    /// when leaving RUNNING, before shm can be unmapped.
    pub fn notify_application_state(&self, state: ApplicationState) {
        let mut pending = self.pending_need_data.lock();
        if state != ApplicationState::Running {
            pending.clear();
        }
        drop(pending);
        *self.app_state.lock() = state;
    }

    /// §4.6 `attachSource`.
    pub fn attach_source(&self, source: MediaSource) -> RialtoResult<SourceId> {
        *self.attaching_source.lock() = true;
        let outcome = self.attach_source_inner(&source);
        *self.attaching_source.lock() = false;
        self.attaching_source_cv.notify_all();
        outcome
    }

    fn attach_source_inner(&self, source: &MediaSource) -> RialtoResult<SourceId> {
        let response = self.ipc.call_blocking(RpcRequest::AttachSource {
            session_id: self.session_id,
            source: source.clone(),
        })?;
        match response {
            RpcResponse::SourceAttached { source_id } => {
                self.attached_sources.insert(
                    source_id,
                    AttachedSourceEntry {
                        source_type: source.source_type,
                        flushing: AtomicBool::new(false),
                    },
                );
                Ok(source_id)
            }
            other => Err(RialtoError::Protocol(format!(
                "AttachSource returned unexpected response: {other:?}"
            ))),
        }
    }

    pub fn remove_source(&self, source_id: SourceId) -> RialtoResult<()> {
        self.attached_sources.remove(&source_id);
        self.ipc
            .call_blocking(RpcRequest::RemoveSource { session_id: self.session_id, source_id })?;
        Ok(())
    }

    #[must_use]
    pub fn source_type(&self, source_id: SourceId) -> Option<MediaSourceType> {
        self.attached_sources.get(&source_id).map(|e| e.source_type)
    }

    pub fn all_sources_attached(&self) -> RialtoResult<()> {
        self.ipc
            .call_blocking(RpcRequest::AllSourcesAttached { session_id: self.session_id })?;
        Ok(())
    }

    pub fn load(&self, mime_type: impl Into<String>) -> RialtoResult<()> {
        self.ipc.call_blocking(RpcRequest::Load {
            session_id: self.session_id,
            mime_type: mime_type.into(),
        })?;
        Ok(())
    }

    pub fn play(&self) -> RialtoResult<()> {
        self.ipc.call_blocking(RpcRequest::Play { session_id: self.session_id })?;
        Ok(())
    }

    pub fn pause(&self) -> RialtoResult<()> {
        self.ipc.call_blocking(RpcRequest::Pause { session_id: self.session_id })?;
        Ok(())
    }

    /// §4.6 `stop`: any state -> IDLE.
    pub fn stop(&self) -> RialtoResult<()> {
        self.ipc.call_blocking(RpcRequest::Stop { session_id: self.session_id })?;
        self.set_state(SessionPlaybackState::Idle);
        Ok(())
    }

    pub fn set_playback_rate(&self, rate: f64) -> RialtoResult<()> {
        self.ipc
            .call_blocking(RpcRequest::SetPlaybackRate { session_id: self.session_id, rate })?;
        Ok(())
    }

    pub fn set_video_window(&self, x: u32, y: u32, width: u32, height: u32) -> RialtoResult<()> {
        self.ipc.call_blocking(RpcRequest::SetVideoWindow {
            session_id: self.session_id,
            x,
            y,
            width,
            height,
        })?;
        Ok(())
    }

    pub fn set_volume(&self, volume: f64) -> RialtoResult<()> {
        self.ipc
            .call_blocking(RpcRequest::SetVolume { session_id: self.session_id, volume })?;
        Ok(())
    }

    pub fn get_volume(&self) -> RialtoResult<f64> {
        match self.ipc.call_blocking(RpcRequest::GetVolume { session_id: self.session_id })? {
            RpcResponse::Volume { volume } => Ok(volume),
            other => Err(RialtoError::Protocol(format!("unexpected response: {other:?}"))),
        }
    }

    pub fn set_mute(&self, source_id: SourceId, mute: bool) -> RialtoResult<()> {
        self.ipc.call_blocking(RpcRequest::SetMute {
            session_id: self.session_id,
            source_id,
            mute,
        })?;
        Ok(())
    }

    pub fn get_mute(&self, source_id: SourceId) -> RialtoResult<bool> {
        match self
            .ipc
            .call_blocking(RpcRequest::GetMute { session_id: self.session_id, source_id })?
        {
            RpcResponse::Mute { mute } => Ok(mute),
            other => Err(RialtoError::Protocol(format!("unexpected response: {other:?}"))),
        }
    }

    pub fn get_stats(&self, source_id: SourceId) -> RialtoResult<PlaybackStats> {
        match self
            .ipc
            .call_blocking(RpcRequest::GetStats { session_id: self.session_id, source_id })?
        {
            RpcResponse::Stats { stats } => Ok(stats),
            other => Err(RialtoError::Protocol(format!("unexpected response: {other:?}"))),
        }
    }

    pub fn process_audio_gap(
        &self,
        position_ns: i64,
        duration_ns: i64,
        discontinuity_gap: i32,
        audio_aac: bool,
    ) -> RialtoResult<()> {
        self.ipc.call_blocking(RpcRequest::ProcessAudioGap {
            session_id: self.session_id,
            position_ns,
            duration_ns,
            discontinuity_gap,
            audio_aac,
        })?;
        Ok(())
    }

    pub fn destroy(&self) -> RialtoResult<()> {
        self.ipc
            .call_blocking(RpcRequest::DestroySession { session_id: self.session_id })?;
        Ok(())
    }
}

impl Drop for MediaPipelineSession {
    fn drop(&mut self) {
        let channel = self.ipc.channel();
        for id in self.subscriptions.lock().drain(..) {
            channel.unsubscribe(id);
        }
    }
}
