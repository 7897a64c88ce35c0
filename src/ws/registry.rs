use chrono::Utc;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::db::{SessionStore, WriteThrough};
use crate::models::*;
use crate::ws::connctx::{ConnCtx, ConnId, ConnectionRegistry};
use crate::ws::docctx::{DocumentSync, DEFAULT_LANGUAGE};
use crate::ws::engine::{EngineCommand, EngineStats};
use crate::ws::lifecycle::{EndReason, LifecycleController, LifecycleState, SessionPolicy};
use crate::ws::observers::ObserverSet;
use crate::ws::presence::PresenceStore;
use crate::ws::rooms::{session_room, video_room, whiteboard_room, Outbox, RoomHub};
use crate::ws::timers::{TimerKind, TimerScheduler};
use crate::ws::video::{VideoPeer, VideoSignaling};
use crate::ws::whiteboard::WhiteboardChannel;

const SUPERSEDED_REASON: &str = "Connected from another location";

/// All live session state of the process.
///
/// Only the engine task touches it, so handlers run to completion one after
/// the other. Store access is queued in order and loads report back as a
/// command.
pub struct SessionRegistry {
    policy: SessionPolicy,
    connections: ConnectionRegistry,
    hub: RoomHub,
    presence: PresenceStore,
    lifecycle: LifecycleController,
    documents: DocumentSync,
    observers: ObserverSet,
    video: VideoSignaling,
    whiteboard: WhiteboardChannel,
    timers: TimerScheduler,
    persistence: WriteThrough,
}

impl SessionRegistry {
    pub fn new(policy: SessionPolicy, store: Arc<dyn SessionStore>, timers: TimerScheduler) -> Self {
        Self {
            lifecycle: LifecycleController::new(policy.clone()),
            video: VideoSignaling::new(policy.stale_peer_ttl),
            policy,
            connections: ConnectionRegistry::new(),
            hub: RoomHub::new(),
            presence: PresenceStore::new(),
            documents: DocumentSync::new(),
            observers: ObserverSet::new(),
            whiteboard: WhiteboardChannel::new(),
            timers,
            persistence: WriteThrough::new(store),
        }
    }

    pub fn handle(&mut self, command: EngineCommand) {
        match command {
            EngineCommand::Connect {
                conn_id,
                client_id,
                user_id,
                outbox,
            } => self.connect(conn_id, client_id, user_id, outbox),
            EngineCommand::Disconnect { conn_id } => self.disconnect(conn_id),
            EngineCommand::Client { conn_id, event } => self.dispatch(conn_id, event),
            EngineCommand::TimerFired {
                session_id,
                kind,
                timer_id,
            } => self.timer_fired(&session_id, kind, timer_id),
            EngineCommand::DocumentLoaded { session_id, document } => self.document_loaded(&session_id, document),
            EngineCommand::Timing { session_id, reply } => {
                let _ = reply.send(self.lifecycle.timing_info(&session_id));
            }
            EngineCommand::Participants { session_id, reply } => {
                let _ = reply.send(ParticipantsUpdate::new(&session_id, self.presence.list(&session_id)));
            }
            EngineCommand::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
        }
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            connections: self.hub.connection_count(),
            active_sessions: self.lifecycle.active_count(),
            ended_sessions: self.lifecycle.ended_count(),
            participants: self.presence.participant_total(),
            observers: self.observers.total(),
            video_peers: self.video.peer_count(),
            documents: self.documents.len(),
        }
    }

    // Connections

    fn connect(&mut self, conn_id: ConnId, client_id: String, user_id: Option<String>, outbox: Outbox) {
        self.hub.attach(conn_id, outbox);
        let ctx = ConnCtx {
            conn_id,
            client_id: client_id.clone(),
            user_id: user_id.clone(),
        };
        if let Some(prior) = self.connections.register(ctx).filter(|prior| *prior != conn_id) {
            info!("Client {} reconnected, closing connection {}", client_id, prior);
            self.hub.emit(
                prior,
                ServerEvent::ForceDisconnect(ForceDisconnectMessage {
                    reason: SUPERSEDED_REASON.to_string(),
                }),
            );
            self.hub.close(prior, SUPERSEDED_REASON);
            self.retire(prior);
        }
        self.hub.emit(
            conn_id,
            ServerEvent::Connected(ConnectedMessage {
                client_id,
                connection_id: conn_id,
                user_id,
            }),
        );
    }

    /// Cut a superseded connection off from rooms, observers and video.
    /// Already queued frames still reach its socket before the close.
    fn retire(&mut self, conn_id: ConnId) {
        self.hub.detach(conn_id);
        self.observers.unwatch_all(conn_id);
        for (session_id, peer) in self.video.withdraw_conn(conn_id) {
            self.broadcast_user_left(&session_id, &peer, None);
        }
    }

    /// Runs for graceful closes and network drops alike, and may follow an
    /// explicit leave.
    fn disconnect(&mut self, conn_id: ConnId) {
        let ctx = self.connections.get(conn_id).cloned();
        self.retire(conn_id);

        let Some(ctx) = ctx else {
            debug!("Disconnect for unknown connection {}", conn_id);
            return;
        };
        if !self.connections.unregister(&ctx.client_id, conn_id) {
            // A newer connection owns the client's presence now
            return;
        }
        for session_id in self.presence.sessions_for(&ctx.client_id) {
            self.remove_participant(&session_id, &ctx.client_id);
        }
        debug!("Connection {} of client {} closed", conn_id, ctx.client_id);
    }

    fn dispatch(&mut self, conn_id: ConnId, event: ClientEvent) {
        let Some(ctx) = self.connections.get(conn_id) else {
            warn!("Dropping event from unregistered connection {}", conn_id);
            return;
        };
        if self.connections.current(&ctx.client_id) != Some(conn_id) {
            debug!("Dropping event from superseded connection {}", conn_id);
            return;
        }
        match event {
            ClientEvent::JoinSession(msg) => self.join_session(conn_id, msg),
            ClientEvent::LeaveSession(msg) => self.leave_session(conn_id, msg),
            ClientEvent::ObserveSession(msg) => self.observe_session(conn_id, &msg.session_id, true),
            ClientEvent::LeaveObserver(msg) => self.observe_session(conn_id, &msg.session_id, false),
            ClientEvent::RequestCode(msg) => self.request_code(conn_id, &msg.session_id),
            ClientEvent::CodeChange(msg) => self.code_change(conn_id, msg),
            ClientEvent::LanguageChange(msg) => self.language_change(conn_id, msg),
            ClientEvent::CursorMove(msg) => self.cursor_move(conn_id, msg),
            ClientEvent::Typing(msg) => self.typing(conn_id, msg),
            ClientEvent::ChatMessage(msg) => self.chat_message(conn_id, msg),
            ClientEvent::GetSessionTime(msg) => self.get_session_time(conn_id, &msg.session_id),
            ClientEvent::ExtendSession(msg) => self.extend_session(conn_id, msg),
            ClientEvent::EndSession(msg) => self.end_session_request(conn_id, msg),
            ClientEvent::JoinVideo(msg) => self.join_video(conn_id, msg),
            ClientEvent::LeaveVideo(msg) => self.leave_video(conn_id, msg),
            ClientEvent::GetVideoParticipants(msg) => self.get_video_participants(conn_id, &msg.session_id),
            ClientEvent::PeerUnavailable(msg) => self.peer_unavailable(conn_id, msg),
            ClientEvent::WhiteboardJoin(msg) => self.whiteboard_join(conn_id, &msg.session_id),
            ClientEvent::WhiteboardDraw(msg) => self.whiteboard_draw(conn_id, msg),
            ClientEvent::WhiteboardUpdate(msg) => self.whiteboard_update(conn_id, msg),
            ClientEvent::WhiteboardClear(msg) => self.whiteboard_clear(conn_id, msg),
        }
    }

    // Validation helpers

    fn require_session<'a>(&self, conn_id: ConnId, session_id: &'a str) -> Option<&'a str> {
        if session_id.is_empty() {
            warn!("Connection {} sent an event without sessionId", conn_id);
            self.hub.emit(conn_id, ServerEvent::session_error(None, "sessionId is required"));
            return None;
        }
        Some(session_id)
    }

    /// The verified user id wins over the one claimed in the payload
    fn resolve_user(&self, conn_id: ConnId, claimed: &str) -> String {
        self.connections
            .get(conn_id)
            .and_then(|ctx| ctx.user_id.clone())
            .filter(|user_id| !user_id.is_empty())
            .unwrap_or_else(|| claimed.to_string())
    }

    fn require_user(&self, conn_id: ConnId, session_id: &str, claimed: &str) -> Option<String> {
        let user_id = self.resolve_user(conn_id, claimed);
        if user_id.is_empty() {
            warn!("Connection {} sent an event for {} without userId", conn_id, session_id);
            self.hub.emit(
                conn_id,
                ServerEvent::session_error(Some(session_id), "sessionId and userId are required"),
            );
            return None;
        }
        Some(user_id)
    }

    /// Shared state is only mutated by current participants
    fn require_participant(&self, conn_id: ConnId, session_id: &str) -> bool {
        let joined = self
            .connections
            .get(conn_id)
            .is_some_and(|ctx| self.presence.contains(session_id, &ctx.client_id));
        if !joined {
            warn!("Connection {} is not a participant of {}", conn_id, session_id);
            self.hub.emit(
                conn_id,
                ServerEvent::session_error(Some(session_id), "Join the session first"),
            );
        }
        joined
    }

    /// Ended sessions accept no further updates
    fn reject_if_ended(&self, conn_id: ConnId, session_id: &str) -> bool {
        if self.lifecycle.state(session_id) == LifecycleState::Ended {
            self.hub.emit(conn_id, ServerEvent::session_error(Some(session_id), "Session has ended"));
            return true;
        }
        false
    }

    fn emit_to_room_and_sender(&self, room: &str, conn_id: ConnId, event: &ServerEvent) {
        self.hub.broadcast(room, event, None);
        if !self.hub.is_member(room, conn_id) {
            self.hub.emit(conn_id, event.clone());
        }
    }

    fn record_activity(&mut self, session_id: &str) {
        self.lifecycle.record_activity(session_id, &mut self.timers);
    }

    // Presence

    fn join_session(&mut self, conn_id: ConnId, msg: JoinSessionMessage) {
        let Some(session_id) = self.require_session(conn_id, &msg.session_id) else {
            return;
        };
        let Some(user_id) = self.require_user(conn_id, session_id, &msg.user_id) else {
            return;
        };
        if self.reject_if_ended(conn_id, session_id) {
            return;
        }
        let Some(client_id) = self.connections.get(conn_id).map(|ctx| ctx.client_id.clone()) else {
            return;
        };

        let info = ParticipantInfo {
            user_id: user_id.clone(),
            username: msg.username,
            photo_url: msg.photo_url,
        };
        let participants = self.presence.join(session_id, &client_id, info);
        self.hub.join(&session_room(session_id), conn_id);
        info!("User {} ({}) joined session {}", user_id, client_id, session_id);

        if let Some(scheduled_end_time) = self.lifecycle.start(session_id, &mut self.timers) {
            self.persistence
                .update_session(session_id, SessionPatch::started(scheduled_end_time));
        }
        self.persistence.increment_metric(&user_id, UsageMetric::SessionsJoined);

        if self.documents.snapshot(session_id).is_none() {
            self.hydrate(session_id, None);
        }
        self.broadcast_presence(session_id, participants);
    }

    fn leave_session(&mut self, conn_id: ConnId, msg: SessionUserRef) {
        let Some(session_id) = self.require_session(conn_id, &msg.session_id) else {
            return;
        };
        let Some(client_id) = self.connections.get(conn_id).map(|ctx| ctx.client_id.clone()) else {
            return;
        };
        self.hub.leave(&session_room(session_id), conn_id);
        self.remove_participant(session_id, &client_id);
    }

    fn remove_participant(&mut self, session_id: &str, client_id: &str) {
        let Some(participants) = self.presence.leave(session_id, client_id) else {
            debug!("Client {} was not in session {}", client_id, session_id);
            return;
        };
        info!("Client {} left session {}", client_id, session_id);
        let empty = participants.is_empty();
        self.broadcast_presence(session_id, participants);
        if empty {
            self.discard_ephemeral(session_id);
        }
    }

    /// Drop document and whiteboard state of an empty session. Lifecycle
    /// timers keep running.
    fn discard_ephemeral(&mut self, session_id: &str) {
        if let Some(doc) = self.documents.take_pending_flush(session_id) {
            self.persistence
                .update_session(session_id, SessionPatch::code(&doc.content, &doc.language));
        }
        self.documents.discard(session_id);
        self.whiteboard.clear(session_id);
        debug!("Discarded ephemeral state of empty session {}", session_id);
    }

    /// Push the participant list to the session room and its observers
    fn broadcast_presence(&self, session_id: &str, participants: Vec<SessionParticipant>) {
        let event = ServerEvent::ParticipantsUpdate(ParticipantsUpdate::new(session_id, participants));
        let mut targets = self.hub.members(&session_room(session_id));
        targets.extend(self.observers.observers(session_id));
        self.hub.emit_all(targets, &event);
    }

    fn observe_session(&mut self, conn_id: ConnId, session_id: &str, watch: bool) {
        let Some(session_id) = self.require_session(conn_id, session_id) else {
            return;
        };
        if watch {
            self.observers.watch(session_id, conn_id);
        } else {
            self.observers.unwatch(session_id, conn_id);
        }
        let update = ParticipantsUpdate::new(session_id, self.presence.list(session_id));
        self.hub.emit(conn_id, ServerEvent::ParticipantsUpdate(update));
    }

    // Shared document

    fn request_code(&mut self, conn_id: ConnId, session_id: &str) {
        let Some(session_id) = self.require_session(conn_id, session_id) else {
            return;
        };
        match self.documents.snapshot(session_id) {
            Some(doc) => {
                self.hub.emit(conn_id, ServerEvent::SessionCode(doc.code_message()));
            }
            None => self.hydrate(session_id, Some(conn_id)),
        }
    }

    /// Load the stored document unless a load is already in flight
    fn hydrate(&mut self, session_id: &str, waiter: Option<ConnId>) {
        if !self.documents.begin_hydration(session_id, waiter) {
            return;
        }
        let commands = self.timers.commands();
        let loaded_id = session_id.to_string();
        self.persistence.load_session(session_id, move |result| {
            let document = match result {
                Ok(Some(record)) => record.code.map(|code| {
                    let language = record.language.unwrap_or_else(|| DEFAULT_LANGUAGE.to_string());
                    (code, language)
                }),
                Ok(None) => None,
                Err(e) => {
                    error!("Failed to load document of session {}: {}", loaded_id, e);
                    None
                }
            };
            let _ = commands.send(EngineCommand::DocumentLoaded {
                session_id: loaded_id,
                document,
            });
        });
    }

    fn document_loaded(&mut self, session_id: &str, document: Option<(String, String)>) {
        let install = self.presence.count(session_id) > 0
            && self.lifecycle.state(session_id) != LifecycleState::Ended;
        let waiters = self.documents.finish_hydration(session_id, document.clone(), install);
        if waiters.is_empty() {
            return;
        }
        let message = match (self.documents.snapshot(session_id), document) {
            (Some(doc), _) => doc.code_message(),
            (None, Some((content, language))) => SessionCodeMessage { content, language },
            (None, None) => SessionCodeMessage {
                content: String::new(),
                language: DEFAULT_LANGUAGE.to_string(),
            },
        };
        self.hub.emit_all(waiters, &ServerEvent::SessionCode(message));
    }

    fn code_change(&mut self, conn_id: ConnId, msg: CodeChangeMessage) {
        let Some(session_id) = self.require_session(conn_id, &msg.session_id) else {
            return;
        };
        if self.reject_if_ended(conn_id, session_id) || !self.require_participant(conn_id, session_id) {
            return;
        }
        let user_id = self.resolve_user(conn_id, &msg.user_id);
        if !self.documents.apply_edit(session_id, &msg.content, &user_id) {
            debug!("Unchanged content for session {}, skipping", session_id);
            return;
        }

        let event = ServerEvent::CodeUpdate(CodeUpdateMessage {
            content: msg.content,
            sender_id: user_id.clone(),
        });
        self.hub.broadcast(&session_room(session_id), &event, Some(conn_id));

        let flush = self.timers.schedule(
            session_id,
            TimerKind::DocumentFlush,
            Instant::now() + self.policy.save_debounce,
        );
        self.documents.schedule_flush(session_id, flush);
        self.persistence.increment_metric(&user_id, UsageMetric::CodeEdits);
        self.record_activity(session_id);
    }

    fn language_change(&mut self, conn_id: ConnId, msg: LanguageChangeMessage) {
        let Some(session_id) = self.require_session(conn_id, &msg.session_id) else {
            return;
        };
        if msg.new_language.is_empty() {
            self.hub.emit(conn_id, ServerEvent::session_error(Some(session_id), "newLanguage is required"));
            return;
        }
        if self.reject_if_ended(conn_id, session_id) || !self.require_participant(conn_id, session_id) {
            return;
        }
        let user_id = self.resolve_user(conn_id, &msg.user_id);
        if !self.documents.change_language(session_id, &msg.new_language, &user_id) {
            return;
        }
        let event = ServerEvent::LanguageChange(LanguageChangedMessage {
            new_language: msg.new_language.clone(),
            user_id,
        });
        self.hub.broadcast(&session_room(session_id), &event, Some(conn_id));
        self.persistence
            .update_session(session_id, SessionPatch::language(&msg.new_language));
        self.record_activity(session_id);
    }

    fn cursor_move(&mut self, conn_id: ConnId, msg: CursorMoveMessage) {
        let Some(session_id) = self.require_session(conn_id, &msg.session_id) else {
            return;
        };
        let event = ServerEvent::CursorUpdate(CursorUpdateMessage {
            user_id: self.resolve_user(conn_id, &msg.user_id),
            username: msg.username,
            position: msg.position,
        });
        self.hub.broadcast(&session_room(session_id), &event, Some(conn_id));
        self.record_activity(session_id);
    }

    fn typing(&mut self, conn_id: ConnId, msg: TypingMessage) {
        let Some(session_id) = self.require_session(conn_id, &msg.session_id) else {
            return;
        };
        let event = ServerEvent::UserTyping(UserTypingMessage {
            user_id: self.resolve_user(conn_id, &msg.user_id),
            username: msg.username,
            is_typing: msg.is_typing,
        });
        self.hub.broadcast(&session_room(session_id), &event, Some(conn_id));
    }

    fn chat_message(&mut self, conn_id: ConnId, msg: ChatMessageIn) {
        let Some(session_id) = self.require_session(conn_id, &msg.session_id) else {
            return;
        };
        let Some(user_id) = self.require_user(conn_id, session_id, &msg.user_id) else {
            return;
        };
        if msg.message.trim().is_empty() {
            self.hub.emit(conn_id, ServerEvent::session_error(Some(session_id), "message is required"));
            return;
        }
        let event = ServerEvent::ChatMessage(ChatMessageOut {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            user_id: user_id.clone(),
            username: msg.username,
            message: msg.message,
            timestamp: Utc::now(),
        });
        self.emit_to_room_and_sender(&session_room(session_id), conn_id, &event);
        self.persistence.increment_metric(&user_id, UsageMetric::MessagesSent);
        self.record_activity(session_id);
    }

    // Lifecycle

    fn get_session_time(&self, conn_id: ConnId, session_id: &str) {
        let Some(session_id) = self.require_session(conn_id, session_id) else {
            return;
        };
        let info = self.lifecycle.timing_info(session_id);
        self.hub.emit(conn_id, ServerEvent::SessionTimeInfo(info));
    }

    fn extend_session(&mut self, conn_id: ConnId, msg: SessionUserRef) {
        let Some(session_id) = self.require_session(conn_id, &msg.session_id) else {
            return;
        };
        let user_id = self.resolve_user(conn_id, &msg.user_id);
        match self.lifecycle.extend(session_id, &mut self.timers) {
            Ok(timing) => {
                self.persistence.update_session(
                    session_id,
                    SessionPatch::extended(timing.scheduled_end_time, timing.extensions_used),
                );
                let event = ServerEvent::SessionExtended(SessionExtendedMessage {
                    timing,
                    extended_by: user_id,
                });
                self.emit_to_room_and_sender(&session_room(session_id), conn_id, &event);
            }
            Err(e) => {
                warn!("Extension of session {} by {} rejected: {}", session_id, user_id, e);
                self.hub.emit(
                    conn_id,
                    ServerEvent::SessionExtensionFailed(ExtensionFailedMessage { reason: e.to_string() }),
                );
            }
        }
    }

    fn end_session_request(&mut self, conn_id: ConnId, msg: SessionUserRef) {
        let Some(session_id) = self.require_session(conn_id, &msg.session_id) else {
            return;
        };
        if self.lifecycle.state(session_id) != LifecycleState::Active {
            self.hub.emit(conn_id, ServerEvent::session_error(Some(session_id), "Session is not active"));
            return;
        }
        let user_id = self.resolve_user(conn_id, &msg.user_id);
        let ended_by = Some(user_id).filter(|u| !u.is_empty());
        self.end_session(session_id, EndReason::Manual, ended_by);
    }

    fn timer_fired(&mut self, session_id: &str, kind: TimerKind, timer_id: u64) {
        if kind == TimerKind::DocumentFlush {
            if let Some(doc) = self.documents.accept_flush(session_id, timer_id) {
                debug!("Writing through document of session {}", session_id);
                self.persistence
                    .update_session(session_id, SessionPatch::code(&doc.content, &doc.language));
            }
            return;
        }
        if !self.lifecycle.accept_timer(session_id, kind, timer_id) {
            return;
        }
        match kind {
            TimerKind::Duration => self.end_session(session_id, EndReason::TimeLimit, None),
            TimerKind::Idle => self.end_session(session_id, EndReason::Inactivity, None),
            TimerKind::Warning => {
                let timing = self.lifecycle.timing_info(session_id);
                info!("Session {} ends in {} ms", session_id, timing.time_left);
                let event = ServerEvent::SessionEndingSoon(SessionEndingSoonMessage {
                    session_id: session_id.to_string(),
                    time_left: timing.time_left,
                    can_extend: timing.can_extend,
                    extensions_remaining: timing.extensions_remaining,
                });
                self.hub.broadcast(&session_room(session_id), &event, None);
            }
            TimerKind::DocumentFlush => {}
        }
    }

    /// ACTIVE -> ENDED: cancel timers, clear presence and ephemeral state,
    /// notify everyone attached to the session and write the ended record.
    fn end_session(&mut self, session_id: &str, reason: EndReason, ended_by: Option<String>) {
        if self.lifecycle.finish(session_id).is_none() {
            return;
        }
        self.discard_ephemeral(session_id);
        self.presence.clear(session_id);

        let ended_at = Utc::now();
        let reason_text = reason.describe(ended_by.as_deref());
        info!("Session {} ended: {}", session_id, reason_text);

        let rooms = [
            session_room(session_id),
            video_room(session_id),
            whiteboard_room(session_id),
        ];
        let mut targets: BTreeSet<ConnId> = rooms.iter().flat_map(|room| self.hub.members(room)).collect();
        let observers = self.observers.observers(session_id);
        targets.extend(observers.iter().copied());

        let event = ServerEvent::SessionEnded(SessionEndedMessage {
            session_id: session_id.to_string(),
            ended_by: ended_by.clone(),
            ended_at,
            reason: reason_text.clone(),
        });
        self.hub.emit_all(targets, &event);
        self.hub.emit_all(
            observers,
            &ServerEvent::ParticipantsUpdate(ParticipantsUpdate::new(session_id, Vec::new())),
        );

        self.persistence
            .update_session(session_id, SessionPatch::ended(ended_at, ended_by, &reason_text));

        for room in &rooms {
            self.hub.close_room(room);
        }
        self.observers.clear_session(session_id);
        self.video.clear_session(session_id);
    }

    // Video signaling

    fn join_video(&mut self, conn_id: ConnId, msg: JoinVideoMessage) {
        let Some(session_id) = self.require_session(conn_id, &msg.session_id) else {
            return;
        };
        if msg.peer_id.is_empty() {
            self.hub.emit(conn_id, ServerEvent::session_error(Some(session_id), "peerId is required"));
            return;
        }
        let Some(user_id) = self.require_user(conn_id, session_id, &msg.user_id) else {
            return;
        };
        let peer = VideoPeer {
            peer_id: msg.peer_id,
            user_id,
            display_name: msg.user_name,
            conn_id,
        };
        let room = video_room(session_id);
        self.hub.join(&room, conn_id);
        let joined = ServerEvent::UserJoined(peer.participant());
        let announcement = self.video.announce(session_id, peer);

        for replaced in &announcement.replaced {
            self.broadcast_user_left(session_id, replaced, Some(conn_id));
        }
        self.hub.emit(
            conn_id,
            ServerEvent::ExistingVideoParticipants(ExistingVideoParticipants {
                participants: announcement.existing,
            }),
        );
        self.hub.broadcast(&room, &joined, Some(conn_id));
    }

    fn leave_video(&mut self, conn_id: ConnId, msg: LeaveVideoMessage) {
        let Some(session_id) = self.require_session(conn_id, &msg.session_id) else {
            return;
        };
        if let Some(peer) = self.video.withdraw(session_id, &msg.peer_id) {
            self.broadcast_user_left(session_id, &peer, Some(conn_id));
        }
        self.hub.leave(&video_room(session_id), conn_id);
    }

    fn broadcast_user_left(&self, session_id: &str, peer: &VideoPeer, except: Option<ConnId>) {
        let event = ServerEvent::UserLeft(VideoUserLeft {
            user_id: peer.user_id.clone(),
            peer_id: peer.peer_id.clone(),
        });
        self.hub.broadcast(&video_room(session_id), &event, except);
    }

    fn get_video_participants(&self, conn_id: ConnId, session_id: &str) {
        let Some(session_id) = self.require_session(conn_id, session_id) else {
            return;
        };
        let participants = self.video.peers(session_id, Some(conn_id));
        self.hub.emit(
            conn_id,
            ServerEvent::ExistingVideoParticipants(ExistingVideoParticipants { participants }),
        );
    }

    fn peer_unavailable(&self, conn_id: ConnId, msg: PeerUnavailableMessage) {
        let Some(session_id) = self.require_session(conn_id, &msg.session_id) else {
            return;
        };
        if !msg.peer_id.is_empty() {
            self.video.mark_stale(session_id, &msg.peer_id);
        }
    }

    // Whiteboard

    fn whiteboard_join(&mut self, conn_id: ConnId, session_id: &str) {
        let Some(session_id) = self.require_session(conn_id, session_id) else {
            return;
        };
        self.hub.join(&whiteboard_room(session_id), conn_id);
        if let Some(snapshot) = self.whiteboard.snapshot(session_id) {
            self.hub.emit(
                conn_id,
                ServerEvent::WhiteboardState(WhiteboardStateMessage {
                    canvas_data: snapshot.clone(),
                }),
            );
        }
    }

    fn whiteboard_draw(&mut self, conn_id: ConnId, msg: WhiteboardDrawMessage) {
        let Some(session_id) = self.require_session(conn_id, &msg.session_id) else {
            return;
        };
        let event = ServerEvent::WhiteboardDraw(WhiteboardDrawBroadcast {
            user_id: self.resolve_user(conn_id, &msg.user_id),
            data: msg.data,
        });
        self.hub.broadcast(&whiteboard_room(session_id), &event, Some(conn_id));
        self.record_activity(session_id);
    }

    fn whiteboard_update(&mut self, conn_id: ConnId, msg: WhiteboardUpdateMessage) {
        let Some(session_id) = self.require_session(conn_id, &msg.session_id) else {
            return;
        };
        if self.reject_if_ended(conn_id, session_id) || !self.require_participant(conn_id, session_id) {
            return;
        }
        self.whiteboard.replace_state(session_id, msg.canvas_data);
        self.record_activity(session_id);
    }

    fn whiteboard_clear(&mut self, conn_id: ConnId, msg: WhiteboardClearMessage) {
        let Some(session_id) = self.require_session(conn_id, &msg.session_id) else {
            return;
        };
        self.whiteboard.clear(session_id);
        let event = ServerEvent::WhiteboardClear(WhiteboardClearBroadcast {
            user_id: self.resolve_user(conn_id, &msg.user_id),
        });
        self.hub.broadcast(&whiteboard_room(session_id), &event, Some(conn_id));
        self.record_activity(session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemorySessionStore;
    use crate::ws::rooms::Outbound;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc::{self, UnboundedReceiver};

    struct Harness {
        registry: SessionRegistry,
        commands: UnboundedReceiver<EngineCommand>,
        store: Arc<MemorySessionStore>,
    }

    impl Harness {
        fn new() -> Self {
            Self::with_policy(SessionPolicy::default())
        }

        fn with_policy(policy: SessionPolicy) -> Self {
            let (tx, rx) = mpsc::unbounded_channel();
            let store = Arc::new(MemorySessionStore::new());
            let registry = SessionRegistry::new(policy, store.clone(), TimerScheduler::new(tx));
            Self {
                registry,
                commands: rx,
                store,
            }
        }

        fn connect(&mut self, conn_id: ConnId, client_id: &str) -> UnboundedReceiver<Outbound> {
            let (tx, rx) = mpsc::unbounded_channel();
            self.registry.handle(EngineCommand::Connect {
                conn_id,
                client_id: client_id.to_string(),
                user_id: None,
                outbox: tx,
            });
            rx
        }

        fn send(&mut self, conn_id: ConnId, event: ClientEvent) {
            self.registry.handle(EngineCommand::Client { conn_id, event });
        }

        fn join(&mut self, conn_id: ConnId, session_id: &str, user_id: &str) {
            self.send(
                conn_id,
                ClientEvent::JoinSession(JoinSessionMessage {
                    session_id: session_id.to_string(),
                    user_id: user_id.to_string(),
                    username: user_id.to_uppercase(),
                    photo_url: None,
                }),
            );
        }

        fn edit(&mut self, conn_id: ConnId, session_id: &str, user_id: &str, content: &str) {
            self.send(
                conn_id,
                ClientEvent::CodeChange(CodeChangeMessage {
                    session_id: session_id.to_string(),
                    content: content.to_string(),
                    user_id: user_id.to_string(),
                }),
            );
        }

        fn extend(&mut self, conn_id: ConnId, session_id: &str, user_id: &str) {
            self.send(
                conn_id,
                ClientEvent::ExtendSession(SessionUserRef {
                    session_id: session_id.to_string(),
                    user_id: user_id.to_string(),
                }),
            );
        }

        /// Let spawned tasks run and feed their commands back in
        async fn settle(&mut self) {
            for _ in 0..10 {
                tokio::task::yield_now().await;
                while let Ok(command) = self.commands.try_recv() {
                    self.registry.handle(command);
                }
            }
        }

        async fn advance(&mut self, duration: Duration) {
            tokio::time::sleep(duration).await;
            self.settle().await;
        }
    }

    fn drain(rx: &mut UnboundedReceiver<Outbound>) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(outbound) = rx.try_recv() {
            if let Outbound::Event(event) = outbound {
                events.push(event);
            }
        }
        events
    }

    fn named<'a>(events: &'a [ServerEvent], name: &str) -> Vec<&'a ServerEvent> {
        events.iter().filter(|e| e.name() == name).collect()
    }

    fn last_count(events: &[ServerEvent]) -> Option<usize> {
        events.iter().rev().find_map(|e| match e {
            ServerEvent::ParticipantsUpdate(update) => Some(update.count),
            _ => None,
        })
    }

    const MINUTE: Duration = Duration::from_secs(60);

    #[tokio::test(start_paused = true)]
    async fn two_joins_report_count_two_to_both() {
        let mut h = Harness::new();
        let mut a = h.connect(1, "tab-a");
        let mut b = h.connect(2, "tab-b");
        h.join(1, "S1", "alice");
        h.join(2, "S1", "bob");

        assert_eq!(last_count(&drain(&mut a)), Some(2));
        assert_eq!(last_count(&drain(&mut b)), Some(2));
        assert_eq!(h.registry.lifecycle.state("S1"), LifecycleState::Active);

        h.settle().await;
        let record = h.store.session("S1").expect("session persisted on start");
        assert_eq!(record.status, Some(SessionStatus::Active));
        assert!(record.scheduled_end_time.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_joins_and_extra_leaves_keep_count_exact() {
        let mut h = Harness::new();
        let mut a = h.connect(1, "tab-a");
        let _b = h.connect(2, "tab-b");

        h.join(1, "S1", "alice");
        h.join(1, "S1", "alice");
        h.join(2, "S1", "bob");
        assert_eq!(last_count(&drain(&mut a)), Some(2));

        let leave = ClientEvent::LeaveSession(SessionUserRef {
            session_id: "S1".into(),
            user_id: "bob".into(),
        });
        h.send(2, leave.clone());
        assert_eq!(last_count(&drain(&mut a)), Some(1));

        // Second leave is silent
        h.send(2, leave);
        assert!(drain(&mut a).is_empty());
        assert_eq!(h.registry.presence.count("S1"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn observers_get_presence_without_joining() {
        let mut h = Harness::new();
        let mut watcher = h.connect(9, "list-view");
        let _a = h.connect(1, "tab-a");

        h.send(9, ClientEvent::ObserveSession(SessionRef { session_id: "S1".into() }));
        assert_eq!(last_count(&drain(&mut watcher)), Some(0));

        h.join(1, "S1", "alice");
        assert_eq!(last_count(&drain(&mut watcher)), Some(1));
        assert_eq!(h.registry.presence.count("S1"), 1);

        h.send(9, ClientEvent::LeaveObserver(SessionRef { session_id: "S1".into() }));
        drain(&mut watcher);
        let _c = h.connect(3, "tab-c");
        h.join(3, "S1", "carol");
        assert!(drain(&mut watcher).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn identical_edit_is_broadcast_and_persisted_once() {
        let mut h = Harness::new();
        let _a = h.connect(1, "tab-a");
        let mut b = h.connect(2, "tab-b");
        h.join(1, "S1", "alice");
        h.join(2, "S1", "bob");
        h.settle().await;
        drain(&mut b);

        h.edit(1, "S1", "alice", "x=1");
        h.edit(1, "S1", "alice", "x=1");

        let updates = drain(&mut b);
        let code_updates = named(&updates, "code-update");
        assert_eq!(code_updates.len(), 1);
        assert_eq!(
            code_updates[0],
            &ServerEvent::CodeUpdate(CodeUpdateMessage {
                content: "x=1".into(),
                sender_id: "alice".into(),
            })
        );

        h.advance(Duration::from_secs(3)).await;
        assert_eq!(h.store.code_writes("S1"), 1);
        assert_eq!(h.store.metric("alice", UsageMetric::CodeEdits), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn write_through_is_debounced() {
        let mut h = Harness::new();
        let _a = h.connect(1, "tab-a");
        h.join(1, "S1", "alice");
        for content in ["a", "ab", "abc"] {
            h.edit(1, "S1", "alice", content);
            h.advance(Duration::from_millis(500)).await;
        }
        assert_eq!(h.store.code_writes("S1"), 0);

        h.advance(Duration::from_secs(2)).await;
        assert_eq!(h.store.code_writes("S1"), 1);
        assert_eq!(h.store.session("S1").unwrap().code.as_deref(), Some("abc"));
    }

    #[tokio::test(start_paused = true)]
    async fn third_extension_is_rejected() {
        let mut h = Harness::new();
        let mut a = h.connect(1, "tab-a");
        h.join(1, "S1", "alice");
        h.extend(1, "S1", "alice");
        h.extend(1, "S1", "alice");
        let events = drain(&mut a);
        let extended = named(&events, "session-extended");
        assert_eq!(extended.len(), 2);
        let ServerEvent::SessionExtended(last) = extended[1] else {
            panic!("expected session-extended");
        };
        assert_eq!(last.timing.extensions_used, 2);
        assert_eq!(last.extended_by, "alice");

        let before = h.registry.lifecycle.timing("S1").unwrap().scheduled_end_time;
        h.extend(1, "S1", "alice");
        let events = drain(&mut a);
        assert_eq!(
            events,
            vec![ServerEvent::SessionExtensionFailed(ExtensionFailedMessage {
                reason: "Maximum extensions (2) already used".into(),
            })]
        );
        assert_eq!(h.registry.lifecycle.timing("S1").unwrap().scheduled_end_time, before);

        h.settle().await;
        assert_eq!(h.store.session("S1").unwrap().extension_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_expiry_ends_session_and_clears_state() {
        let mut h = Harness::new();
        let mut a = h.connect(1, "tab-a");
        h.join(1, "S1", "alice");
        h.send(
            1,
            ClientEvent::WhiteboardUpdate(WhiteboardUpdateMessage {
                session_id: "S1".into(),
                canvas_data: json!({"lines": []}),
            }),
        );
        drain(&mut a);

        h.advance(10 * MINUTE + Duration::from_secs(1)).await;

        let events = drain(&mut a);
        let ended = named(&events, "session-ended");
        assert_eq!(ended.len(), 1);
        let ServerEvent::SessionEnded(ended) = ended[0] else {
            panic!("expected session-ended");
        };
        assert!(ended.reason.contains("inactivity"));
        assert_eq!(ended.ended_by, None);

        assert_eq!(h.registry.presence.count("S1"), 0);
        assert!(h.registry.whiteboard.snapshot("S1").is_none());
        assert_eq!(h.registry.lifecycle.state("S1"), LifecycleState::Ended);
        let record = h.store.session("S1").unwrap();
        assert_eq!(record.status, Some(SessionStatus::Ended));
        assert!(record.ended_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn activity_postpones_idle_expiry() {
        let mut h = Harness::new();
        let mut a = h.connect(1, "tab-a");
        h.join(1, "S1", "alice");

        h.advance(6 * MINUTE).await;
        h.edit(1, "S1", "alice", "still here");
        h.advance(6 * MINUTE).await;
        assert_eq!(h.registry.lifecycle.state("S1"), LifecycleState::Active);
        assert!(named(&drain(&mut a), "session-ended").is_empty());

        h.advance(5 * MINUTE).await;
        assert_eq!(h.registry.lifecycle.state("S1"), LifecycleState::Ended);
    }

    #[tokio::test(start_paused = true)]
    async fn extension_replaces_duration_and_warning_timers() {
        let policy = SessionPolicy {
            idle_timeout: Duration::from_secs(24 * 3600),
            ..SessionPolicy::default()
        };
        let mut h = Harness::with_policy(policy);
        let mut a = h.connect(1, "tab-a");
        h.join(1, "S1", "alice");

        h.advance(26 * MINUTE).await;
        let events = drain(&mut a);
        assert_eq!(named(&events, "session-ending-soon").len(), 1);

        h.extend(1, "S1", "alice");
        let timing = h.registry.lifecycle.timing("S1").unwrap();
        assert_eq!(timing.time_left(), 15 * MINUTE);

        // Original end at 30 minutes passes without effect
        h.advance(5 * MINUTE).await;
        assert_eq!(h.registry.lifecycle.state("S1"), LifecycleState::Active);
        let events = drain(&mut a);
        assert!(named(&events, "session-ended").is_empty());

        // New warning at 36, new end at 41
        h.advance(6 * MINUTE).await;
        let events = drain(&mut a);
        let warnings = named(&events, "session-ending-soon");
        assert_eq!(warnings.len(), 1);
        let ServerEvent::SessionEndingSoon(warning) = warnings[0] else {
            panic!("expected session-ending-soon");
        };
        assert!(warning.can_extend);
        assert_eq!(warning.extensions_remaining, 1);

        h.advance(5 * MINUTE).await;
        let events = drain(&mut a);
        let ended = named(&events, "session-ended");
        assert_eq!(ended.len(), 1);
        let ServerEvent::SessionEnded(ended) = ended[0] else {
            panic!("expected session-ended");
        };
        assert_eq!(ended.reason, "Session time limit reached");
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_closes_old_connection_without_duplicate_participant() {
        let mut h = Harness::new();
        let mut old = h.connect(1, "tab-a");
        let _b = h.connect(2, "tab-b");
        h.join(1, "S1", "alice");
        h.join(2, "S1", "bob");
        drain(&mut old);

        let mut new = h.connect(3, "tab-a");
        let mut closes = 0;
        let mut forced = 0;
        while let Ok(outbound) = old.try_recv() {
            match outbound {
                Outbound::Close(_) => closes += 1,
                Outbound::Event(ServerEvent::ForceDisconnect(_)) => forced += 1,
                _ => {}
            }
        }
        assert_eq!((forced, closes), (1, 1));

        h.join(3, "S1", "alice");
        assert_eq!(last_count(&drain(&mut new)), Some(2));

        // The superseded socket finally drops; presence is owned by the new one
        h.registry.handle(EngineCommand::Disconnect { conn_id: 1 });
        assert_eq!(h.registry.presence.count("S1"), 2);
        assert_eq!(h.registry.stats().connections, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn superseded_connection_can_no_longer_act_or_listen() {
        let mut h = Harness::new();
        let mut old = h.connect(1, "tab-a");
        let mut b = h.connect(2, "tab-b");
        h.join(1, "S1", "alice");
        h.join(2, "S1", "bob");

        let _new = h.connect(3, "tab-a");
        h.join(3, "S1", "alice");
        drain(&mut old);
        drain(&mut b);

        // A late leave from the old tab must not remove the new tab's record
        h.send(
            1,
            ClientEvent::LeaveSession(SessionUserRef {
                session_id: "S1".into(),
                user_id: "alice".into(),
            }),
        );
        h.edit(1, "S1", "alice", "stale");
        assert_eq!(h.registry.presence.count("S1"), 2);
        assert!(drain(&mut b).is_empty());
        assert!(h.registry.documents.snapshot("S1").map_or(true, |doc| doc.content != "stale"));

        // Room traffic no longer reaches the old socket
        h.edit(2, "S1", "bob", "x=1");
        assert!(old.try_recv().is_err());
        assert_eq!(h.registry.hub.members(&session_room("S1")).into_iter().collect::<Vec<_>>(), vec![2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn outsiders_cannot_create_document_or_whiteboard_state() {
        let mut h = Harness::new();
        let mut a = h.connect(1, "tab-a");
        drain(&mut a);

        for i in 0..5 {
            h.edit(1, &format!("S{}", i), "alice", "x=1");
            h.send(
                1,
                ClientEvent::LanguageChange(LanguageChangeMessage {
                    session_id: format!("S{}", i),
                    new_language: "python".into(),
                    user_id: "alice".into(),
                }),
            );
            h.send(
                1,
                ClientEvent::WhiteboardUpdate(WhiteboardUpdateMessage {
                    session_id: format!("W{}", i),
                    canvas_data: json!({"lines": [i]}),
                }),
            );
        }
        let errors = drain(&mut a);
        assert_eq!(errors.len(), 15);
        assert!(errors
            .iter()
            .all(|e| matches!(e, ServerEvent::SessionError(err) if err.message == "Join the session first")));

        h.registry.handle(EngineCommand::Disconnect { conn_id: 1 });
        h.advance(Duration::from_secs(3)).await;
        assert_eq!(h.registry.documents.len(), 0);
        assert!((0..5).all(|i| h.registry.whiteboard.snapshot(&format!("W{}", i)).is_none()));
        assert!(h.store.writes().is_empty());
        assert_eq!(h.registry.stats().active_sessions, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_and_rejoin_restores_prior_count() {
        let mut h = Harness::new();
        let _a = h.connect(1, "tab-a");
        let mut b = h.connect(2, "tab-b");
        h.join(1, "S1", "alice");
        h.join(2, "S1", "bob");
        drain(&mut b);

        h.registry.handle(EngineCommand::Disconnect { conn_id: 1 });
        assert_eq!(last_count(&drain(&mut b)), Some(1));

        h.advance(MINUTE).await;
        let _a = h.connect(3, "tab-a");
        h.join(3, "S1", "alice");
        assert_eq!(last_count(&drain(&mut b)), Some(2));
        assert_eq!(h.registry.presence.count("S1"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn emptied_session_flushes_and_drops_document_but_keeps_timers() {
        let mut h = Harness::new();
        let mut a = h.connect(1, "tab-a");
        h.join(1, "S1", "alice");
        h.settle().await;
        h.edit(1, "S1", "alice", "print(1)");
        h.send(
            1,
            ClientEvent::LeaveSession(SessionUserRef {
                session_id: "S1".into(),
                user_id: "alice".into(),
            }),
        );
        h.settle().await;

        assert!(h.registry.documents.snapshot("S1").is_none());
        assert_eq!(h.store.code_writes("S1"), 1);
        assert_eq!(h.registry.lifecycle.state("S1"), LifecycleState::Active);

        // The code comes back from the store
        drain(&mut a);
        h.send(1, ClientEvent::RequestCode(SessionRef { session_id: "S1".into() }));
        h.settle().await;
        assert_eq!(
            drain(&mut a),
            vec![ServerEvent::SessionCode(SessionCodeMessage {
                content: "print(1)".into(),
                language: DEFAULT_LANGUAGE.into(),
            })]
        );

        // Nobody is left, but the idle timer still ends the session
        h.advance(10 * MINUTE + Duration::from_secs(1)).await;
        assert_eq!(h.registry.lifecycle.state("S1"), LifecycleState::Ended);
        assert_eq!(h.store.session("S1").unwrap().status, Some(SessionStatus::Ended));
    }

    #[tokio::test(start_paused = true)]
    async fn request_code_for_unknown_session_falls_back_to_defaults() {
        let mut h = Harness::new();
        let mut a = h.connect(1, "tab-a");
        drain(&mut a);
        h.send(1, ClientEvent::RequestCode(SessionRef { session_id: "nowhere".into() }));
        h.settle().await;
        assert_eq!(
            drain(&mut a),
            vec![ServerEvent::SessionCode(SessionCodeMessage {
                content: String::new(),
                language: "javascript".into(),
            })]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn stored_document_hydrates_on_join() {
        let mut h = Harness::new();
        let mut record = SessionRecord::new("S1");
        record.code = Some("fn main() {}".into());
        record.language = Some("rust".into());
        h.store.insert(record);

        let mut a = h.connect(1, "tab-a");
        h.join(1, "S1", "alice");
        h.settle().await;
        drain(&mut a);

        h.send(1, ClientEvent::RequestCode(SessionRef { session_id: "S1".into() }));
        assert_eq!(
            drain(&mut a),
            vec![ServerEvent::SessionCode(SessionCodeMessage {
                content: "fn main() {}".into(),
                language: "rust".into(),
            })]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn manual_end_notifies_everyone_and_is_terminal() {
        let mut h = Harness::new();
        let mut a = h.connect(1, "tab-a");
        let mut b = h.connect(2, "tab-b");
        let mut watcher = h.connect(9, "list-view");
        h.join(1, "S1", "alice");
        h.join(2, "S1", "bob");
        h.send(9, ClientEvent::ObserveSession(SessionRef { session_id: "S1".into() }));
        for rx in [&mut a, &mut b, &mut watcher] {
            drain(rx);
        }

        h.send(
            1,
            ClientEvent::EndSession(SessionUserRef {
                session_id: "S1".into(),
                user_id: "alice".into(),
            }),
        );
        for rx in [&mut a, &mut b, &mut watcher] {
            let events = drain(rx);
            let ended = named(&events, "session-ended");
            assert_eq!(ended.len(), 1);
            let ServerEvent::SessionEnded(ended) = ended[0] else {
                panic!("expected session-ended");
            };
            assert_eq!(ended.ended_by.as_deref(), Some("alice"));
            assert_eq!(ended.reason, "Session ended manually by alice");
        }

        h.join(2, "S1", "bob");
        assert_eq!(
            drain(&mut b),
            vec![ServerEvent::session_error(Some("S1"), "Session has ended")]
        );
        h.edit(2, "S1", "bob", "late");
        assert_eq!(named(&drain(&mut b), "session-error").len(), 1);

        h.send(
            2,
            ClientEvent::EndSession(SessionUserRef {
                session_id: "S1".into(),
                user_id: "bob".into(),
            }),
        );
        assert_eq!(
            drain(&mut b),
            vec![ServerEvent::session_error(Some("S1"), "Session is not active")]
        );
        assert_eq!(h.registry.stats().active_sessions, 0);
        assert_eq!(h.registry.stats().ended_sessions, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_ids_are_reported_to_sender_only() {
        let mut h = Harness::new();
        let mut a = h.connect(1, "tab-a");
        let mut b = h.connect(2, "tab-b");
        h.join(2, "S1", "bob");
        drain(&mut a);
        drain(&mut b);

        h.join(1, "", "alice");
        h.join(1, "S1", "");
        assert_eq!(
            drain(&mut a),
            vec![
                ServerEvent::session_error(None, "sessionId is required"),
                ServerEvent::session_error(Some("S1"), "sessionId and userId are required"),
            ]
        );
        assert!(drain(&mut b).is_empty());
        assert_eq!(h.registry.presence.count("S1"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn video_peers_are_exchanged_and_withdrawn_on_disconnect() {
        let mut h = Harness::new();
        let mut a = h.connect(1, "tab-a");
        let mut b = h.connect(2, "tab-b");
        drain(&mut a);
        drain(&mut b);

        let join_video = |session: &str, user: &str, peer: &str| {
            ClientEvent::JoinVideo(JoinVideoMessage {
                session_id: session.into(),
                user_id: user.into(),
                peer_id: peer.into(),
                user_name: user.to_uppercase(),
            })
        };
        h.send(1, join_video("S1", "alice", "peer-a"));
        assert_eq!(
            drain(&mut a),
            vec![ServerEvent::ExistingVideoParticipants(ExistingVideoParticipants {
                participants: vec![],
            })]
        );

        h.send(2, join_video("S1", "bob", "peer-b"));
        let to_b = drain(&mut b);
        let ServerEvent::ExistingVideoParticipants(existing) = &to_b[0] else {
            panic!("expected existing-video-participants");
        };
        assert_eq!(existing.participants.len(), 1);
        assert_eq!(existing.participants[0].peer_id, "peer-a");
        assert_eq!(
            drain(&mut a),
            vec![ServerEvent::UserJoined(VideoParticipant {
                user_id: "bob".into(),
                peer_id: "peer-b".into(),
                name: "BOB".into(),
            })]
        );

        // An unreachable peer is no longer offered
        h.send(
            2,
            ClientEvent::PeerUnavailable(PeerUnavailableMessage {
                session_id: "S1".into(),
                peer_id: "peer-a".into(),
            }),
        );
        h.send(2, ClientEvent::GetVideoParticipants(SessionRef { session_id: "S1".into() }));
        assert_eq!(
            drain(&mut b),
            vec![ServerEvent::ExistingVideoParticipants(ExistingVideoParticipants {
                participants: vec![],
            })]
        );

        h.registry.handle(EngineCommand::Disconnect { conn_id: 2 });
        assert_eq!(
            drain(&mut a),
            vec![ServerEvent::UserLeft(VideoUserLeft {
                user_id: "bob".into(),
                peer_id: "peer-b".into(),
            })]
        );
        assert_eq!(h.registry.stats().video_peers, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn video_join_requires_a_user_id() {
        let mut h = Harness::new();
        let mut a = h.connect(1, "tab-a");
        let mut b = h.connect(2, "tab-b");
        drain(&mut a);
        drain(&mut b);

        for (conn_id, peer) in [(1, "peer-a"), (2, "peer-b")] {
            h.send(
                conn_id,
                ClientEvent::JoinVideo(JoinVideoMessage {
                    session_id: "S1".into(),
                    user_id: String::new(),
                    peer_id: peer.into(),
                    user_name: "Guest".into(),
                }),
            );
        }
        assert_eq!(
            drain(&mut a),
            vec![ServerEvent::session_error(Some("S1"), "sessionId and userId are required")]
        );
        assert_eq!(named(&drain(&mut b), "user-left").len(), 0);
        assert_eq!(h.registry.stats().video_peers, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn whiteboard_snapshot_reaches_late_joiner_and_draws_skip_sender() {
        let mut h = Harness::new();
        let mut a = h.connect(1, "tab-a");
        let mut b = h.connect(2, "tab-b");
        h.join(1, "S1", "alice");
        h.send(1, ClientEvent::WhiteboardJoin(SessionUserRef { session_id: "S1".into(), user_id: "alice".into() }));
        h.send(
            1,
            ClientEvent::WhiteboardUpdate(WhiteboardUpdateMessage {
                session_id: "S1".into(),
                canvas_data: json!({"objects": [1, 2]}),
            }),
        );
        drain(&mut a);
        drain(&mut b);

        h.send(2, ClientEvent::WhiteboardJoin(SessionUserRef { session_id: "S1".into(), user_id: "bob".into() }));
        assert_eq!(
            drain(&mut b),
            vec![ServerEvent::WhiteboardState(WhiteboardStateMessage {
                canvas_data: json!({"objects": [1, 2]}),
            })]
        );

        h.send(
            2,
            ClientEvent::WhiteboardDraw(WhiteboardDrawMessage {
                session_id: "S1".into(),
                user_id: "bob".into(),
                data: json!({"x": 1}),
            }),
        );
        assert!(drain(&mut b).is_empty());
        assert_eq!(named(&drain(&mut a), "whiteboard-draw").len(), 1);

        h.send(
            1,
            ClientEvent::WhiteboardClear(WhiteboardClearMessage {
                session_id: "S1".into(),
                user_id: "alice".into(),
            }),
        );
        assert_eq!(named(&drain(&mut b), "whiteboard-clear").len(), 1);
        assert!(h.registry.whiteboard.snapshot("S1").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn chat_reaches_sender_and_is_metered() {
        let mut h = Harness::new();
        let mut a = h.connect(1, "tab-a");
        let mut b = h.connect(2, "tab-b");
        h.join(1, "S1", "alice");
        h.join(2, "S1", "bob");
        drain(&mut a);
        drain(&mut b);

        h.send(
            1,
            ClientEvent::ChatMessage(ChatMessageIn {
                session_id: "S1".into(),
                user_id: "alice".into(),
                username: "Alice".into(),
                message: "hello".into(),
            }),
        );
        assert_eq!(named(&drain(&mut a), "chat-message").len(), 1);
        assert_eq!(named(&drain(&mut b), "chat-message").len(), 1);
        h.settle().await;
        assert_eq!(h.store.metric("alice", UsageMetric::MessagesSent), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn persistence_failure_does_not_disturb_live_state() {
        let mut h = Harness::new();
        h.store.set_fail_writes(true);
        let _a = h.connect(1, "tab-a");
        let mut b = h.connect(2, "tab-b");
        h.join(1, "S1", "alice");
        h.join(2, "S1", "bob");
        h.edit(1, "S1", "alice", "x=2");
        h.advance(Duration::from_secs(3)).await;

        assert_eq!(named(&drain(&mut b), "code-update").len(), 1);
        assert!(h.store.writes().is_empty());
        assert_eq!(h.registry.documents.snapshot("S1").unwrap().content, "x=2");
    }
}
