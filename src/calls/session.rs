//! Per-call session orchestration.
//!
//! A session owns one peer connection and sequences every SDP/ICE
//! exchange for it. Two disciplines keep concurrent negotiation safe:
//! a single-flight lock so only one exchange is in flight at a time, and
//! a generation counter bumped by every new attempt and by teardown, so
//! a stale async completion can never mutate a torn-down session.

use super::error::{CallError, NegotiationError};
use super::peer::{MediaTrackKind, PeerConnection, PeerConnectionFactory, PeerEvent};
use super::state::{CallPhase, CallRole, CallTransition};
use crate::config::CallConfig;
use crate::connection::TransportConnection;
use crate::envelope::{
    CallEndReason, Envelope, IceCandidate, RoomId, SessionDescription, SessionId,
};
use crate::events::CallEvent;
use log::{debug, info, warn};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Notify, mpsc};

/// Options for starting a call.
#[derive(Debug, Clone, Copy, Default)]
pub struct CallOptions {
    /// Whether the call starts with a camera track attached.
    pub video: bool,
}

impl CallOptions {
    pub fn audio() -> Self {
        Self::default()
    }

    pub fn video() -> Self {
        Self { video: true }
    }
}

/// A renegotiation in flight: what it is adding or removing, so a failure
/// can be undone.
#[derive(Debug, Clone, Copy)]
struct RenegotiationOp {
    add: Option<MediaTrackKind>,
    remove: Option<MediaTrackKind>,
}

struct SessionInner {
    phase: CallPhase,
    remote_description_set: bool,
    /// ICE candidates received before the remote description; flushed in
    /// arrival order the moment it is applied.
    pending_candidates: Vec<IceCandidate>,
    tracks: HashSet<MediaTrackKind>,
    audio_enabled: bool,
    video_enabled: bool,
    ice_restarts: u8,
    renegotiation: Option<RenegotiationOp>,
    /// Offer that created this responder session, until accepted.
    pending_remote_offer: Option<SessionDescription>,
    end_reason: Option<CallEndReason>,
}

pub struct CallSession {
    id: SessionId,
    room_id: RoomId,
    role: CallRole,
    video_call: bool,
    config: CallConfig,
    connection: Arc<TransportConnection>,
    peer: Arc<dyn PeerConnection>,
    inner: Mutex<SessionInner>,
    /// Current negotiation generation. Bumped by every attempt and by
    /// teardown; completion paths compare before mutating.
    generation: AtomicU64,
    /// Single-flight: one SDP exchange at a time per session.
    negotiation_lock: Mutex<()>,
    ended: AtomicBool,
    ended_at: StdMutex<Option<Instant>>,
    shutdown: Notify,
}

impl CallSession {
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn create(
        id: SessionId,
        room_id: RoomId,
        role: CallRole,
        options: CallOptions,
        config: CallConfig,
        connection: Arc<TransportConnection>,
        peer_factory: &Arc<dyn PeerConnectionFactory>,
        pending_remote_offer: Option<SessionDescription>,
    ) -> Result<Arc<Self>, CallError> {
        let (peer, peer_events) = peer_factory.create_peer().await?;
        let session = Arc::new(Self {
            id,
            room_id,
            role,
            video_call: options.video,
            config,
            connection,
            peer,
            inner: Mutex::new(SessionInner {
                phase: CallPhase::Idle,
                remote_description_set: false,
                pending_candidates: Vec::new(),
                tracks: HashSet::new(),
                audio_enabled: true,
                video_enabled: options.video,
                ice_restarts: 0,
                renegotiation: None,
                pending_remote_offer,
                end_reason: None,
            }),
            generation: AtomicU64::new(0),
            negotiation_lock: Mutex::new(()),
            ended: AtomicBool::new(false),
            ended_at: StdMutex::new(None),
            shutdown: Notify::new(),
        });
        let task = session.clone();
        tokio::spawn(async move { task.peer_event_loop(peer_events).await });
        Ok(session)
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    pub fn role(&self) -> CallRole {
        self.role
    }

    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::Relaxed)
    }

    pub(crate) fn ended_elapsed(&self) -> Option<Duration> {
        self.ended_at
            .lock()
            .expect("ended_at lock poisoned")
            .map(|at| at.elapsed())
    }

    pub async fn phase(&self) -> CallPhase {
        self.inner.lock().await.phase
    }

    pub async fn end_reason(&self) -> Option<CallEndReason> {
        self.inner.lock().await.end_reason
    }

    pub async fn attached_tracks(&self) -> HashSet<MediaTrackKind> {
        self.inner.lock().await.tracks.clone()
    }

    /// The remote offer that created this responder session, to feed into
    /// [`accept_offer`](Self::accept_offer).
    pub async fn remote_offer(&self) -> Option<SessionDescription> {
        self.inner.lock().await.pending_remote_offer.clone()
    }

    fn begin_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    /// Applies a phase transition and publishes the change. Caller holds
    /// the inner lock.
    fn transition_locked(
        &self,
        inner: &mut SessionInner,
        transition: CallTransition,
    ) -> Result<(), CallError> {
        let next = inner.phase.apply(transition)?;
        debug!(
            target: "Calls/Session",
            "[{}] {} -> {}", self.id, inner.phase, next
        );
        inner.phase = next;
        let _ = self.connection.events().call.send(Arc::new(CallEvent::PhaseChanged {
            session_id: self.id.clone(),
            phase: next,
        }));
        Ok(())
    }

    fn emit_warning(&self, message: String) {
        warn!(target: "Calls/Session", "[{}] {message}", self.id);
        let _ = self.connection.events().call.send(Arc::new(CallEvent::Warning {
            session_id: self.id.clone(),
            message,
        }));
    }

    /// Starts the call as initiator: attach initial tracks, create and
    /// send the offer. A negotiation failure here is terminal.
    pub async fn start(&self) -> Result<(), CallError> {
        let _flight = self.negotiation_lock.lock().await;
        let generation = self.begin_generation();
        {
            let mut inner = self.inner.lock().await;
            if inner.phase.is_terminal() {
                return Err(CallError::SessionEnded);
            }
            self.transition_locked(&mut inner, CallTransition::OfferSent)?;
        }

        match self.negotiate_initial_offer(generation).await {
            Ok(offer) => {
                self.connection
                    .send(Envelope::CallOffer {
                        session_id: self.id.clone(),
                        room_id: self.room_id.clone(),
                        sdp: offer,
                    })
                    .await;
                Ok(())
            }
            Err(e) => {
                warn!(target: "Calls/Session", "[{}] Initial offer failed: {e}", self.id);
                self.teardown(CallEndReason::Error, true, true).await;
                Err(CallError::Negotiation(e))
            }
        }
    }

    async fn negotiate_initial_offer(
        &self,
        generation: u64,
    ) -> Result<SessionDescription, NegotiationError> {
        self.attach_initial_tracks().await?;
        let offer = self.create_offer_with_fallback().await?;
        if !self.is_current(generation) {
            return Err(NegotiationError::Peer("session torn down mid-offer".into()));
        }
        self.peer.set_local_description(offer.clone()).await?;
        Ok(offer)
    }

    async fn attach_initial_tracks(&self) -> Result<(), NegotiationError> {
        self.peer.add_track(MediaTrackKind::Audio).await?;
        let mut wanted = vec![MediaTrackKind::Audio];
        if self.video_call {
            self.peer.add_track(MediaTrackKind::Video).await?;
            wanted.push(MediaTrackKind::Video);
        }
        let mut inner = self.inner.lock().await;
        inner.tracks.extend(wanted);
        Ok(())
    }

    /// Accepts an incoming offer as responder: attach tracks, apply the
    /// remote description (flushing any early ICE candidates), answer.
    pub async fn accept_offer(&self, sdp: SessionDescription) -> Result<(), CallError> {
        let _flight = self.negotiation_lock.lock().await;
        let generation = self.begin_generation();
        {
            let mut inner = self.inner.lock().await;
            if inner.phase.is_terminal() {
                return Err(CallError::SessionEnded);
            }
            inner.pending_remote_offer = None;
            self.transition_locked(&mut inner, CallTransition::OfferAccepted)?;
        }

        match self.negotiate_answer(generation, sdp).await {
            Ok(answer) => {
                {
                    let mut inner = self.inner.lock().await;
                    if inner.phase.is_terminal() {
                        return Err(CallError::SessionEnded);
                    }
                    self.transition_locked(&mut inner, CallTransition::AnswerSent)?;
                }
                self.connection
                    .send(Envelope::CallAnswer {
                        session_id: self.id.clone(),
                        sdp: answer,
                    })
                    .await;
                Ok(())
            }
            Err(e) => {
                warn!(target: "Calls/Session", "[{}] Answer failed: {e}", self.id);
                self.teardown(CallEndReason::Error, true, true).await;
                Err(CallError::Negotiation(e))
            }
        }
    }

    async fn negotiate_answer(
        &self,
        generation: u64,
        sdp: SessionDescription,
    ) -> Result<SessionDescription, NegotiationError> {
        self.attach_initial_tracks().await?;
        {
            let mut inner = self.inner.lock().await;
            self.apply_remote_description_locked(&mut inner, sdp).await?;
        }
        let answer = self.peer.create_answer().await?;
        if !self.is_current(generation) {
            return Err(NegotiationError::Peer("session torn down mid-answer".into()));
        }
        self.peer.set_local_description(answer.clone()).await?;
        Ok(answer)
    }

    /// Applies the remote description and flushes the candidate buffer in
    /// arrival order. The inner lock is held across the flush so a
    /// freshly arriving candidate cannot jump the queue.
    async fn apply_remote_description_locked(
        &self,
        inner: &mut SessionInner,
        sdp: SessionDescription,
    ) -> Result<(), NegotiationError> {
        self.peer.set_remote_description(sdp).await?;
        inner.remote_description_set = true;
        let buffered: Vec<IceCandidate> = inner.pending_candidates.drain(..).collect();
        if !buffered.is_empty() {
            debug!(
                target: "Calls/Session",
                "[{}] Flushing {} buffered ICE candidates", self.id, buffered.len()
            );
        }
        for candidate in buffered {
            self.peer.add_ice_candidate(candidate).await?;
        }
        Ok(())
    }

    /// Remote ICE candidate from signaling. Buffered until the remote
    /// description exists, applied immediately afterwards.
    pub async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), CallError> {
        let mut inner = self.inner.lock().await;
        if inner.phase.is_terminal() {
            debug!(target: "Calls/Session", "[{}] Dropping candidate for ended session", self.id);
            return Ok(());
        }
        if !inner.remote_description_set {
            inner.pending_candidates.push(candidate);
            return Ok(());
        }
        self.peer.add_ice_candidate(candidate).await?;
        Ok(())
    }

    /// The remote answer to one of our offers, routed by the registry.
    pub(crate) async fn handle_answer(&self, sdp: SessionDescription) {
        let mut inner = self.inner.lock().await;
        match inner.phase {
            CallPhase::Negotiating => {
                if let Err(e) = self.apply_remote_description_locked(&mut inner, sdp).await {
                    drop(inner);
                    warn!(target: "Calls/Session", "[{}] Applying answer failed: {e}", self.id);
                    self.teardown(CallEndReason::Error, true, true).await;
                    return;
                }
                let _ = self.transition_locked(&mut inner, CallTransition::AnswerReceived);
            }
            CallPhase::Renegotiating => {
                match self.peer.set_remote_description(sdp).await {
                    Ok(()) => {
                        inner.renegotiation = None;
                        let _ = self
                            .transition_locked(&mut inner, CallTransition::RenegotiationCompleted);
                    }
                    Err(e) => {
                        self.rollback_renegotiation_locked(&mut inner).await;
                        let _ =
                            self.transition_locked(&mut inner, CallTransition::RenegotiationFailed);
                        drop(inner);
                        self.emit_warning(format!("renegotiation failed: {e}"));
                    }
                }
            }
            other => {
                debug!(target: "Calls/Session", "[{}] Ignoring answer in phase {other}", self.id);
            }
        }
    }

    /// An offer for this session id: a duplicate of the one that created
    /// us, a remote renegotiation, or glare.
    pub(crate) async fn handle_offer(&self, sdp: SessionDescription) {
        enum Action {
            Ignore(&'static str),
            Answer,
            YieldThenAnswer,
        }

        let action = {
            let mut inner = self.inner.lock().await;
            if inner.phase.is_terminal() {
                Action::Ignore("session ended")
            } else {
                match inner.phase {
                    CallPhase::Idle => {
                        inner.pending_remote_offer = Some(sdp.clone());
                        Action::Ignore("stored as pending offer")
                    }
                    CallPhase::Negotiating | CallPhase::ConnectingIce => {
                        Action::Ignore("negotiation already in progress")
                    }
                    CallPhase::Connected => Action::Answer,
                    CallPhase::Renegotiating => {
                        // Glare: both sides offered. The initiator's
                        // renegotiation wins; the responder abandons its
                        // own attempt and answers.
                        if self.role == CallRole::Initiator {
                            Action::Ignore("glare, local offer wins")
                        } else {
                            self.rollback_renegotiation_locked(&mut inner).await;
                            let _ = self
                                .transition_locked(&mut inner, CallTransition::RenegotiationFailed);
                            Action::YieldThenAnswer
                        }
                    }
                    CallPhase::Ended | CallPhase::Failed => Action::Ignore("session ended"),
                }
            }
        };

        match action {
            Action::Ignore(reason) => {
                debug!(target: "Calls/Session", "[{}] Ignoring offer: {reason}", self.id);
            }
            Action::YieldThenAnswer => {
                self.emit_warning("renegotiation superseded by remote offer".to_string());
                self.answer_renegotiation(sdp).await;
            }
            Action::Answer => {
                self.answer_renegotiation(sdp).await;
            }
        }
    }

    /// Answers a remote mid-call offer (their screen share or video
    /// upgrade). Failures are recoverable: the call stays connected.
    async fn answer_renegotiation(&self, sdp: SessionDescription) {
        let _flight = self.negotiation_lock.lock().await;
        let generation = self.begin_generation();
        {
            let mut inner = self.inner.lock().await;
            if inner.phase.is_terminal() {
                return;
            }
            if self
                .transition_locked(&mut inner, CallTransition::RenegotiationStarted)
                .is_err()
            {
                return;
            }
            if let Err(e) = self.peer.set_remote_description(sdp).await {
                let _ = self.transition_locked(&mut inner, CallTransition::RenegotiationFailed);
                drop(inner);
                self.emit_warning(format!("remote renegotiation failed: {e}"));
                return;
            }
        }

        let answer = match self.peer.create_answer().await {
            Ok(answer) => answer,
            Err(e) => {
                let mut inner = self.inner.lock().await;
                let _ = self.transition_locked(&mut inner, CallTransition::RenegotiationFailed);
                drop(inner);
                self.emit_warning(format!("remote renegotiation failed: {e}"));
                return;
            }
        };
        if !self.is_current(generation) {
            debug!(target: "Calls/Session", "[{}] Stale renegotiation answer discarded", self.id);
            return;
        }
        if let Err(e) = self.peer.set_local_description(answer.clone()).await {
            let mut inner = self.inner.lock().await;
            let _ = self.transition_locked(&mut inner, CallTransition::RenegotiationFailed);
            drop(inner);
            self.emit_warning(format!("remote renegotiation failed: {e}"));
            return;
        }
        self.connection
            .send(Envelope::CallAnswer {
                session_id: self.id.clone(),
                sdp: answer,
            })
            .await;
        let mut inner = self.inner.lock().await;
        let _ = self.transition_locked(&mut inner, CallTransition::RenegotiationCompleted);
    }

    /// Toggles the microphone. No renegotiation, returns the new state.
    pub async fn toggle_audio(&self) -> Result<bool, CallError> {
        let enabled = {
            let mut inner = self.inner.lock().await;
            if inner.phase.is_terminal() {
                return Err(CallError::SessionEnded);
            }
            inner.audio_enabled = !inner.audio_enabled;
            inner.audio_enabled
        };
        self.peer
            .set_track_enabled(MediaTrackKind::Audio, enabled)
            .await;
        Ok(enabled)
    }

    /// Toggles the camera. An audio-only call upgrades to video through
    /// renegotiation on this same session; once a video track exists this
    /// is a plain enable/disable.
    pub async fn toggle_video(&self) -> Result<bool, CallError> {
        let has_video = {
            let inner = self.inner.lock().await;
            if inner.phase.is_terminal() {
                return Err(CallError::SessionEnded);
            }
            inner.tracks.contains(&MediaTrackKind::Video)
        };
        if !has_video {
            self.renegotiate_tracks(Some(MediaTrackKind::Video), None)
                .await?;
            let mut inner = self.inner.lock().await;
            inner.video_enabled = true;
            return Ok(true);
        }
        let enabled = {
            let mut inner = self.inner.lock().await;
            inner.video_enabled = !inner.video_enabled;
            inner.video_enabled
        };
        self.peer
            .set_track_enabled(MediaTrackKind::Video, enabled)
            .await;
        Ok(enabled)
    }

    pub async fn start_screen_share(&self) -> Result<(), CallError> {
        self.renegotiate_tracks(Some(MediaTrackKind::Screen), None)
            .await
    }

    pub async fn stop_screen_share(&self) -> Result<(), CallError> {
        self.renegotiate_tracks(None, Some(MediaTrackKind::Screen))
            .await
    }

    /// Adds and/or removes a track and sends a fresh offer, leaving all
    /// other tracks untouched. On failure the track set is rolled back
    /// and the call stays connected; the error is reported as a warning
    /// event plus the returned `Err`.
    async fn renegotiate_tracks(
        &self,
        add: Option<MediaTrackKind>,
        remove: Option<MediaTrackKind>,
    ) -> Result<(), CallError> {
        let _flight = self.negotiation_lock.lock().await;
        let generation = self.begin_generation();
        {
            let mut inner = self.inner.lock().await;
            if inner.phase.is_terminal() {
                return Err(CallError::SessionEnded);
            }
            // Coalesce: a queued request whose work is already done.
            if let Some(kind) = add {
                if inner.tracks.contains(&kind) {
                    return Ok(());
                }
            }
            if let Some(kind) = remove {
                if !inner.tracks.contains(&kind) {
                    return Ok(());
                }
            }
            self.transition_locked(&mut inner, CallTransition::RenegotiationStarted)?;
            inner.renegotiation = Some(RenegotiationOp { add, remove });
        }

        let result: Result<SessionDescription, NegotiationError> = async {
            if let Some(kind) = add {
                self.peer.add_track(kind).await?;
            }
            if let Some(kind) = remove {
                self.peer.remove_track(kind).await?;
            }
            let offer = self.create_offer_with_fallback().await?;
            self.peer.set_local_description(offer.clone()).await?;
            Ok(offer)
        }
        .await;

        match result {
            Ok(offer) => {
                {
                    let mut inner = self.inner.lock().await;
                    if !self.is_current(generation) || inner.phase.is_terminal() {
                        return Err(CallError::SessionEnded);
                    }
                    if let Some(kind) = add {
                        inner.tracks.insert(kind);
                    }
                    if let Some(kind) = remove {
                        inner.tracks.remove(&kind);
                    }
                }
                self.connection
                    .send(Envelope::CallOffer {
                        session_id: self.id.clone(),
                        room_id: self.room_id.clone(),
                        sdp: offer,
                    })
                    .await;
                Ok(())
            }
            Err(e) => {
                let mut inner = self.inner.lock().await;
                if !self.is_current(generation) || inner.phase.is_terminal() {
                    return Err(CallError::SessionEnded);
                }
                self.rollback_renegotiation_locked(&mut inner).await;
                let _ = self.transition_locked(&mut inner, CallTransition::RenegotiationFailed);
                drop(inner);
                self.emit_warning(format!("renegotiation failed, tracks restored: {e}"));
                Err(CallError::Negotiation(e))
            }
        }
    }

    /// Undoes an in-flight renegotiation's track changes. Caller holds
    /// the inner lock.
    async fn rollback_renegotiation_locked(&self, inner: &mut SessionInner) {
        let Some(op) = inner.renegotiation.take() else {
            return;
        };
        if let Some(kind) = op.add {
            if self.peer.remove_track(kind).await.is_err() {
                debug!(target: "Calls/Session", "[{}] Rollback remove_track({kind:?}) failed", self.id);
            }
            inner.tracks.remove(&kind);
        }
        if let Some(kind) = op.remove {
            if self.peer.add_track(kind).await.is_err() {
                debug!(target: "Calls/Session", "[{}] Rollback add_track({kind:?}) failed", self.id);
            }
            inner.tracks.insert(kind);
        }
    }

    /// Creates an offer with bounded ICE gathering: on timeout, restrict
    /// to relay candidates and try once more.
    async fn create_offer_with_fallback(&self) -> Result<SessionDescription, NegotiationError> {
        let timeout = self.config.ice_gathering_timeout;
        match tokio::time::timeout(timeout, self.peer.create_offer()).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    target: "Calls/Session",
                    "[{}] ICE gathering timed out, retrying relay-only", self.id
                );
                self.peer.set_relay_only().await;
                match tokio::time::timeout(timeout, self.peer.create_offer()).await {
                    Ok(result) => result,
                    Err(_) => Err(NegotiationError::GatheringTimeout),
                }
            }
        }
    }

    /// Ends the call locally and notifies the remote peer.
    pub async fn end(&self, reason: CallEndReason) {
        self.teardown(reason, true, false).await;
    }

    /// The remote peer ended the call.
    pub(crate) async fn handle_remote_end(&self, reason: CallEndReason) {
        info!(target: "Calls/Session", "[{}] Remote ended call: {reason}", self.id);
        self.teardown(reason, false, false).await;
    }

    /// Releases everything this session holds: peer connection, tracks,
    /// the event loop task, buffered candidates. Idempotent; bumps the
    /// generation so pending negotiations become no-ops.
    async fn teardown(&self, reason: CallEndReason, notify_remote: bool, setup_failed: bool) {
        {
            let mut inner = self.inner.lock().await;
            if inner.phase.is_terminal() {
                return;
            }
            self.generation.fetch_add(1, Ordering::SeqCst);
            let transition = if setup_failed {
                CallTransition::SetupFailed
            } else {
                CallTransition::Terminated
            };
            let _ = self.transition_locked(&mut inner, transition);
            inner.end_reason = Some(reason);
            inner.pending_candidates.clear();
            inner.tracks.clear();
            inner.renegotiation = None;
            inner.pending_remote_offer = None;
        }
        self.ended.store(true, Ordering::Relaxed);
        *self.ended_at.lock().expect("ended_at lock poisoned") = Some(Instant::now());
        // notify_one stores a permit, so the event loop sees the shutdown
        // even when teardown ran from inside one of its own handlers.
        self.shutdown.notify_one();
        self.peer.close().await;

        if notify_remote {
            self.connection
                .send(Envelope::CallEnd {
                    session_id: self.id.clone(),
                    reason,
                })
                .await;
        }
        let _ = self.connection.events().call.send(Arc::new(CallEvent::Ended {
            session_id: self.id.clone(),
            reason,
        }));
        info!(target: "Calls/Session", "[{}] Session ended: {}", self.id, reason.description());
    }

    async fn peer_event_loop(self: Arc<Self>, mut events: mpsc::Receiver<PeerEvent>) {
        loop {
            tokio::select! {
                maybe_event = events.recv() => match maybe_event {
                    Some(PeerEvent::LocalCandidate(candidate)) => {
                        self.connection
                            .send(Envelope::CallIce {
                                session_id: self.id.clone(),
                                candidate,
                            })
                            .await;
                    }
                    Some(PeerEvent::IceConnected) => self.handle_ice_connected().await,
                    Some(PeerEvent::IceDisconnected) => {
                        debug!(target: "Calls/Session", "[{}] ICE disconnected, waiting", self.id);
                    }
                    Some(PeerEvent::IceFailed) => self.handle_ice_failed().await,
                    None => return,
                },
                _ = self.shutdown.notified() => {
                    debug!(target: "Calls/Session", "[{}] Peer event loop shut down", self.id);
                    return;
                }
            }
            // Bail straight away when the handler we just ran tore the
            // session down, instead of waiting for the shutdown permit.
            if self.is_ended() {
                debug!(target: "Calls/Session", "[{}] Peer event loop shut down", self.id);
                return;
            }
        }
    }

    async fn handle_ice_connected(&self) {
        let mut inner = self.inner.lock().await;
        inner.ice_restarts = 0;
        if inner.phase == CallPhase::ConnectingIce {
            let _ = self.transition_locked(&mut inner, CallTransition::IceConnected);
        }
    }

    /// One automatic ICE restart; a second consecutive failure ends the
    /// call with a network reason.
    async fn handle_ice_failed(&self) {
        let restart = {
            let mut inner = self.inner.lock().await;
            if inner.phase.is_terminal() {
                return;
            }
            if inner.ice_restarts < self.config.max_ice_restarts {
                inner.ice_restarts += 1;
                true
            } else {
                false
            }
        };
        if restart {
            warn!(target: "Calls/Session", "[{}] ICE failed, attempting restart", self.id);
            if let Err(e) = self.peer.restart_ice().await {
                warn!(target: "Calls/Session", "[{}] ICE restart failed: {e}", self.id);
                self.teardown(CallEndReason::Network, true, false).await;
            }
        } else {
            self.teardown(CallEndReason::Network, true, false).await;
        }
    }
}
