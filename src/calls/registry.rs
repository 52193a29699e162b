//! Tracks live call sessions and routes call signaling to them.

use super::error::CallError;
use super::peer::PeerConnectionFactory;
use super::session::{CallOptions, CallSession};
use super::state::CallRole;
use crate::config::CallConfig;
use crate::connection::TransportConnection;
use crate::envelope::{CallEndReason, Envelope, RoomId, SessionDescription, SessionId};
use crate::error::{AlreadyInCallError, SignalingError};
use crate::events::CallEvent;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Notify, RwLock, broadcast};

pub struct CallSessionRegistry {
    connection: Arc<TransportConnection>,
    peer_factory: Arc<dyn PeerConnectionFactory>,
    config: CallConfig,
    sessions: RwLock<HashMap<SessionId, Arc<CallSession>>>,
    shutdown: Notify,
}

impl CallSessionRegistry {
    pub fn new(
        connection: Arc<TransportConnection>,
        peer_factory: Arc<dyn PeerConnectionFactory>,
        config: CallConfig,
    ) -> Arc<Self> {
        let registry = Arc::new(Self {
            connection,
            peer_factory,
            config,
            sessions: RwLock::new(HashMap::new()),
            shutdown: Notify::new(),
        });
        // Subscribe before spawning so no envelope can slip past between
        // construction and the first poll of the loop.
        let inbound = registry.connection.events().inbound.subscribe();
        let task = registry.clone();
        tokio::spawn(async move { task.run(inbound).await });
        registry
    }

    /// Starts an outgoing call in `room_id`. At most one non-ended
    /// session may exist at a time.
    pub async fn start_call(
        &self,
        room_id: RoomId,
        options: CallOptions,
    ) -> Result<Arc<CallSession>, CallError> {
        let session = {
            let mut sessions = self.sessions.write().await;
            if let Some(active) = sessions.values().find(|s| !s.is_ended()) {
                return Err(AlreadyInCallError(active.room_id().clone()).into());
            }
            let id = SessionId::generate();
            let session = CallSession::create(
                id.clone(),
                room_id,
                CallRole::Initiator,
                options,
                self.config.clone(),
                self.connection.clone(),
                &self.peer_factory,
                None,
            )
            .await?;
            sessions.insert(id, session.clone());
            session
        };
        info!(target: "Calls/Registry", "[{}] Starting call in {}", session.id(), session.room_id());
        session.start().await?;
        Ok(session)
    }

    /// The session currently ringing or connected, if any.
    pub async fn active_session(&self) -> Option<Arc<CallSession>> {
        self.sessions
            .read()
            .await
            .values()
            .find(|s| !s.is_ended())
            .cloned()
    }

    pub async fn session(&self, id: &SessionId) -> Option<Arc<CallSession>> {
        self.sessions.read().await.get(id).cloned()
    }

    async fn run(self: Arc<Self>, mut inbound: broadcast::Receiver<Arc<Envelope>>) {
        let mut sweep = tokio::time::interval(self.config.ended_grace);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                result = inbound.recv() => match result {
                    Ok(envelope) => self.handle_envelope(&envelope).await,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!(target: "Calls/Registry", "Inbound stream lagged by {n} envelopes");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                },
                _ = sweep.tick() => self.sweep_ended().await,
                _ = self.shutdown.notified() => {
                    debug!(target: "Calls/Registry", "Registry loop shut down");
                    return;
                }
            }
        }
    }

    async fn handle_envelope(&self, envelope: &Envelope) {
        match envelope {
            Envelope::CallOffer {
                session_id,
                room_id,
                sdp,
            } => {
                self.handle_offer(session_id, room_id, sdp.clone()).await;
            }
            Envelope::CallAnswer { session_id, sdp } => {
                match self.live_session(session_id).await {
                    Some(session) => session.handle_answer(sdp.clone()).await,
                    None => self.log_unroutable("answer", session_id).await,
                }
            }
            Envelope::CallIce {
                session_id,
                candidate,
            } => match self.live_session(session_id).await {
                Some(session) => {
                    if let Err(e) = session.add_remote_candidate(candidate.clone()).await {
                        warn!(target: "Calls/Registry", "[{session_id}] Candidate rejected: {e}");
                    }
                }
                None => self.log_unroutable("candidate", session_id).await,
            },
            Envelope::CallEnd { session_id, reason } => {
                match self.live_session(session_id).await {
                    Some(session) => session.handle_remote_end(*reason).await,
                    None => self.log_unroutable("end", session_id).await,
                }
            }
            _ => {}
        }
    }

    /// An offer either belongs to an existing session (renegotiation,
    /// duplicate, glare) or creates a fresh ringing one.
    async fn handle_offer(&self, session_id: &SessionId, room_id: &RoomId, sdp: SessionDescription) {
        if let Some(session) = self.session(session_id).await {
            if session.is_ended() {
                debug!(target: "Calls/Registry", "[{session_id}] Offer for ended session ignored");
            } else {
                session.handle_offer(sdp).await;
            }
            return;
        }

        let mut sessions = self.sessions.write().await;
        if let Some(active) = sessions.values().find(|s| !s.is_ended()) {
            // Busy: already in a call, decline the new one outright.
            info!(
                target: "Calls/Registry",
                "[{session_id}] Declining incoming call, already in {}", active.id()
            );
            drop(sessions);
            self.connection
                .send(Envelope::CallEnd {
                    session_id: session_id.clone(),
                    reason: CallEndReason::Declined,
                })
                .await;
            return;
        }
        let session = match CallSession::create(
            session_id.clone(),
            room_id.clone(),
            CallRole::Responder,
            CallOptions::default(),
            self.config.clone(),
            self.connection.clone(),
            &self.peer_factory,
            Some(sdp.clone()),
        )
        .await
        {
            Ok(session) => session,
            Err(e) => {
                warn!(target: "Calls/Registry", "[{session_id}] Creating responder session failed: {e}");
                return;
            }
        };
        sessions.insert(session_id.clone(), session);
        drop(sessions);
        info!(target: "Calls/Registry", "[{session_id}] Incoming call in {room_id}");
        let _ = self.connection.events().call.send(Arc::new(CallEvent::Incoming {
            session_id: session_id.clone(),
            room_id: room_id.clone(),
            sdp,
        }));
    }

    async fn live_session(&self, id: &SessionId) -> Option<Arc<CallSession>> {
        self.sessions
            .read()
            .await
            .get(id)
            .filter(|s| !s.is_ended())
            .cloned()
    }

    /// Unknown or already-ended session: log and drop, never error out.
    async fn log_unroutable(&self, kind: &str, session_id: &SessionId) {
        if self.sessions.read().await.contains_key(session_id) {
            debug!(target: "Calls/Registry", "[{session_id}] Dropping {kind} for ended session");
        } else {
            let err = SignalingError::UnknownSession(session_id.clone());
            debug!(target: "Calls/Registry", "Dropping {kind}: {err}");
        }
    }

    /// Removes ended sessions once their grace period has passed. The
    /// grace window keeps late signaling classifiable as "ended" rather
    /// than "unknown".
    async fn sweep_ended(&self) {
        let grace = self.config.ended_grace;
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, session| {
            !session.is_ended() || session.ended_elapsed().is_none_or(|age| age < grace)
        });
        let removed = before - sessions.len();
        if removed > 0 {
            debug!(target: "Calls/Registry", "Swept {removed} ended sessions");
        }
    }

    pub async fn shutdown(&self) {
        self.shutdown.notify_waiters();
        let sessions: Vec<Arc<CallSession>> =
            self.sessions.write().await.drain().map(|(_, s)| s).collect();
        for session in sessions {
            if !session.is_ended() {
                session.end(CallEndReason::Hangup).await;
            }
        }
    }
}
