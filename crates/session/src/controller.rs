// Collaboration session controller.
//
// Owns one open document's live session: the lifecycle state machine, the
// y-sync exchange with the replication endpoint, presence, seeding, command
// dispatch and comment anchors. It is driven from a single logical thread:
// transport events, UI calls and `tick` all take `&mut self` and a `now`.
// Network I/O happens in the transport, which reports back through
// generation-tagged events.

use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use tandem_common::types::{AnchorError, CommentAnchor, CommentRecord, DocumentContent};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use yrs::encoding::read::Cursor;
use yrs::sync::{Message, MessageReader, SyncMessage};
use yrs::updates::decoder::DecoderV1;
use yrs::updates::encoder::Encode;

use crate::anchors::{CommentAnchorManager, ReplayReport};
use crate::command::{apply_mutations, plan, EditorCommand, Selection};
use crate::config::SessionConfig;
use crate::engine::awareness::{self, CursorRange, ForgottenPeers, PresenceState, PresenceUser};
use crate::engine::LiveDocument;
use crate::presence::{color_seed, PresenceEntry, PresenceProjection};
use crate::sanitize::sanitize_content;
use crate::seed::{SeedDecision, SeedGate, SeedPhase};
use crate::state::{transition, ReconnectPolicy, SessionEvent, SessionState, UiStatus};
use crate::transport::{ReplicationTransport, TransportEvent, TransportEventKind};

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub endpoint_configured: bool,
    pub heartbeat_interval: Duration,
    pub presence_grace: Duration,
    pub presence_timeout: Duration,
    pub seed_timeout: Duration,
    pub reconnect: ReconnectPolicy,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self::from_session_config(&SessionConfig::default())
    }
}

impl ControllerConfig {
    pub fn from_session_config(config: &SessionConfig) -> Self {
        Self {
            endpoint_configured: config.endpoint.is_some(),
            heartbeat_interval: config.heartbeat_interval(),
            presence_grace: config.presence_grace(),
            presence_timeout: config.presence_timeout(),
            seed_timeout: config.seed_timeout(),
            reconnect: config.reconnect_policy(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalUser {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session is not mounted")]
    NotMounted,
    #[error(transparent)]
    Anchor(#[from] AnchorError),
    #[error(transparent)]
    Engine(#[from] anyhow::Error),
}

pub struct SessionController<T: ReplicationTransport> {
    document_id: String,
    config: ControllerConfig,
    transport: T,
    state: SessionState,
    document: LiveDocument,
    local_presence: PresenceState,
    presence: PresenceProjection,
    forgotten: ForgottenPeers,
    seed: SeedGate,
    anchors: CommentAnchorManager,
    generation: u64,
    attempt_in_flight: bool,
    reconnect_at: Option<Instant>,
    next_heartbeat: Option<Instant>,
}

impl<T: ReplicationTransport> SessionController<T> {
    pub fn new(document_id: impl Into<String>, config: ControllerConfig, user: LocalUser, transport: T) -> Self {
        Self::with_document(document_id, config, user, transport, LiveDocument::new())
    }

    pub fn with_document(
        document_id: impl Into<String>,
        config: ControllerConfig,
        user: LocalUser,
        transport: T,
        document: LiveDocument,
    ) -> Self {
        let local_presence = PresenceState {
            user: PresenceUser { color_seed: color_seed(&user.id), id: user.id, name: user.name },
            cursor: None,
        };
        Self {
            document_id: document_id.into(),
            config,
            transport,
            state: SessionState::Disconnected,
            document,
            local_presence,
            presence: PresenceProjection::new(),
            forgotten: ForgottenPeers::default(),
            seed: SeedGate::new(),
            anchors: CommentAnchorManager::new(),
            generation: 0,
            attempt_in_flight: false,
            reconnect_at: None,
            next_heartbeat: None,
        }
    }

    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn status(&self) -> UiStatus {
        self.state.ui_status()
    }

    pub fn document(&self) -> &LiveDocument {
        &self.document
    }

    pub fn content(&self) -> DocumentContent {
        self.document.content()
    }

    pub fn presence(&self) -> Vec<PresenceEntry> {
        self.presence.snapshot()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    pub fn mount(&mut self, now: Instant) -> Result<(), SessionError> {
        if self.state != SessionState::Disconnected {
            return Ok(());
        }
        awareness::set_local_presence(self.document.awareness(), &self.local_presence)?;
        self.step(SessionEvent::Mount { has_endpoint: self.config.endpoint_configured }, now);
        Ok(())
    }

    pub fn unmount(&mut self, now: Instant) {
        if self.state.is_connected() {
            awareness::clear_local_presence(self.document.awareness());
            self.announce_local_presence();
        }
        self.step(SessionEvent::Unmount, now);
    }

    /// Stop using the replication endpoint; editing continues locally.
    pub fn go_local_only(&mut self, now: Instant) {
        self.step(SessionEvent::GoLocalOnly, now);
    }

    /// Try the endpoint again after falling back to local-only.
    pub fn retry(&mut self, now: Instant) {
        self.step(SessionEvent::Retry { has_endpoint: self.config.endpoint_configured }, now);
    }

    fn step(&mut self, event: SessionEvent, now: Instant) {
        let previous = self.state;
        let next = transition(previous, event, &self.config.reconnect);
        if next == previous {
            return;
        }
        self.state = next;
        info!(
            document_id = %self.document_id,
            from = ?previous,
            to = ?next,
            status = next.ui_status().label(),
            "session state changed"
        );
        self.on_enter(previous, now);
    }

    fn on_enter(&mut self, previous: SessionState, now: Instant) {
        match self.state {
            SessionState::Disconnected => {
                self.transport.close();
                self.attempt_in_flight = false;
                self.reconnect_at = None;
                self.next_heartbeat = None;
                self.presence.clear();
                self.seed.clear();
                self.anchors.reset();
            }
            SessionState::Connecting { failures } => {
                self.next_heartbeat = None;
                if previous.is_connected() {
                    self.presence.hold(now, self.config.presence_grace);
                }
                if matches!(previous, SessionState::Disconnected | SessionState::LocalOnly { .. }) {
                    self.start_attempt(now);
                } else {
                    let delay = self.config.reconnect.delay(failures);
                    debug!(document_id = %self.document_id, failures, delay_ms = delay.as_millis() as u64, "scheduling reconnect");
                    self.reconnect_at = Some(now + delay);
                }
            }
            SessionState::ConnectedUnsynced { .. } => {
                self.presence.release_hold(now);
                let step1 = Message::Sync(SyncMessage::SyncStep1(self.document.state_vector()));
                self.send_message(&step1);
                self.announce_local_presence();
                self.next_heartbeat = Some(now + self.config.heartbeat_interval);
            }
            SessionState::ConnectedSynced => {
                let decision = self.seed.settle(self.document.is_empty());
                self.apply_seed(decision);
            }
            SessionState::LocalOnly { reason } => {
                warn!(document_id = %self.document_id, ?reason, "continuing in local-only mode");
                self.transport.close();
                self.attempt_in_flight = false;
                self.reconnect_at = None;
                self.next_heartbeat = None;
                self.presence.clear();
                self.forget_remote_peers();
                let decision = self.seed.settle(self.document.is_empty());
                self.apply_seed(decision);
            }
        }
    }

    fn start_attempt(&mut self, now: Instant) {
        self.generation += 1;
        self.reconnect_at = None;
        match self.transport.connect(self.generation) {
            Ok(()) => {
                self.attempt_in_flight = true;
                debug!(document_id = %self.document_id, generation = self.generation, "connection attempt started");
            }
            Err(error) => {
                warn!(document_id = %self.document_id, ?error, "connection attempt could not start");
                self.attempt_in_flight = false;
                self.step(SessionEvent::ConnectFailed, now);
            }
        }
    }

    // ── Transport events ────────────────────────────────────────────

    pub fn handle_transport(&mut self, event: TransportEvent, now: Instant) {
        let live = matches!(self.state, SessionState::Connecting { .. }) || self.state.is_connected();
        if event.generation != self.generation || !live {
            debug!(generation = event.generation, current = self.generation, "ignoring stale transport event");
            return;
        }

        match event.kind {
            TransportEventKind::Opened => {
                if !self.attempt_in_flight {
                    return;
                }
                self.attempt_in_flight = false;
                self.step(SessionEvent::HandshakeCompleted, now);
            }
            TransportEventKind::Frame(bytes) => {
                if self.state.is_connected() {
                    self.handle_frame(&bytes, now);
                }
            }
            TransportEventKind::Closed { reason } => {
                let event = if self.state.is_connected() {
                    SessionEvent::TransportDropped
                } else {
                    SessionEvent::ConnectFailed
                };
                warn!(document_id = %self.document_id, %reason, "replication transport closed");
                self.attempt_in_flight = false;
                self.transport.close();
                self.step(event, now);
            }
        }
    }

    fn handle_frame(&mut self, bytes: &[u8], now: Instant) {
        let messages = match decode_messages(bytes) {
            Ok(messages) => messages,
            Err(error) => {
                warn!(document_id = %self.document_id, ?error, "dropping undecodable replication frame");
                return;
            }
        };

        for message in messages {
            match message {
                Message::Sync(SyncMessage::SyncStep1(remote)) => {
                    let diff = self.document.encode_diff(&remote);
                    self.send_message(&Message::Sync(SyncMessage::SyncStep2(diff)));
                }
                Message::Sync(SyncMessage::SyncStep2(update)) => {
                    if let Err(error) = self.document.apply_update(&update) {
                        warn!(document_id = %self.document_id, ?error, "failed to merge sync step 2");
                        continue;
                    }
                    self.step(SessionEvent::SyncCompleted, now);
                }
                Message::Sync(SyncMessage::Update(update)) => {
                    if let Err(error) = self.document.apply_update(&update) {
                        warn!(document_id = %self.document_id, ?error, "failed to merge remote update");
                    }
                }
                Message::Awareness(update) => {
                    self.forgotten.heard_from(&update);
                    match awareness::apply_remote_update(self.document.awareness(), update) {
                        Ok(_) => self.refresh_presence(now),
                        Err(error) => warn!(?error, "failed to apply awareness update"),
                    }
                }
                Message::AwarenessQuery => self.announce_local_presence(),
                other => debug!(?other, "ignoring replication message"),
            }
        }
    }

    fn send_message(&mut self, message: &Message) {
        if !self.state.is_connected() {
            return;
        }
        if let Err(error) = self.transport.send(message.encode_v1()) {
            // The transport reports the close separately.
            debug!(?error, "replication send failed");
        }
    }

    /// Local edits made while disconnected stay in the document and reach
    /// the endpoint through the state-vector exchange on reconnect.
    fn send_update(&mut self, update: Vec<u8>) {
        self.send_message(&Message::Sync(SyncMessage::Update(update)));
    }

    fn announce_local_presence(&mut self) {
        let local = self.document.client_id();
        match self.document.awareness().update_with_clients([local]) {
            Ok(update) => self.send_message(&Message::Awareness(update)),
            Err(error) => warn!(?error, "failed to encode local awareness"),
        }
    }

    fn forget_remote_peers(&mut self) {
        let remote = awareness::remote_peers(self.document.awareness());
        self.forgotten.forget(remote.into_iter().map(|peer| peer.client_id));
    }

    fn refresh_presence(&mut self, now: Instant) {
        let peers = self.forgotten.visible(self.document.awareness());
        if self.presence.observe(&peers, now) {
            debug!(document_id = %self.document_id, peers = peers.len(), "presence changed");
        }
    }

    // ── Timers ──────────────────────────────────────────────────────

    /// Run whatever is due at `now`: reconnects, heartbeats, presence expiry
    /// and the seeding deadline.
    pub fn tick(&mut self, now: Instant) {
        if let Some(at) = self.reconnect_at {
            if now >= at && matches!(self.state, SessionState::Connecting { .. }) && !self.attempt_in_flight {
                self.start_attempt(now);
            }
        }

        if let Some(at) = self.next_heartbeat {
            if now >= at && self.state.is_connected() {
                if let Err(error) = awareness::set_local_presence(self.document.awareness(), &self.local_presence) {
                    warn!(?error, "failed to refresh local presence");
                }
                self.announce_local_presence();
                self.next_heartbeat = Some(now + self.config.heartbeat_interval);
            }
        }

        if self.presence.expire_hold(now) {
            self.forget_remote_peers();
            debug!(document_id = %self.document_id, "presence grace window elapsed");
        }

        let expired = self.presence.timed_out(now, self.config.presence_timeout);
        if !expired.is_empty() {
            self.forgotten.forget(expired);
            self.refresh_presence(now);
        }

        let decision = self.seed.expire(now, self.document.is_empty());
        if decision != SeedDecision::Nothing {
            info!(document_id = %self.document_id, "seed deadline reached before sync");
        }
        self.apply_seed(decision);
    }

    /// Earliest instant at which `tick` has work to do.
    pub fn next_deadline(&self) -> Option<Instant> {
        let reconnect = self.reconnect_at.filter(|_| !self.attempt_in_flight);
        [reconnect, self.next_heartbeat, self.presence.hold_deadline(), self.seed.deadline()]
            .into_iter()
            .flatten()
            .min()
    }

    // ── Content ─────────────────────────────────────────────────────

    /// External "set content": sanitized, then seeded per the seeding policy.
    pub fn set_content(&mut self, content: DocumentContent, now: Instant) -> Result<SeedDecision, SessionError> {
        let phase = match self.state {
            SessionState::Disconnected => return Err(SessionError::NotMounted),
            SessionState::ConnectedSynced => SeedPhase::Synced,
            SessionState::LocalOnly { .. } => SeedPhase::LocalOnly,
            SessionState::Connecting { .. } | SessionState::ConnectedUnsynced { .. } => SeedPhase::AwaitingSync,
        };
        let (clean, report) = sanitize_content(&content);
        if !report.is_clean() {
            info!(document_id = %self.document_id, stripped = report.total(), "sanitized external content");
        }
        let decision =
            self.seed
                .request(clean, phase, self.document.is_empty(), now, self.config.seed_timeout);
        Ok(self.apply_seed(decision))
    }

    fn apply_seed(&mut self, decision: SeedDecision) -> SeedDecision {
        match &decision {
            SeedDecision::Apply(content) => {
                let update = self.document.replace_content(content);
                self.send_update(update);
                info!(document_id = %self.document_id, "seeded document from external content");
            }
            SeedDecision::Conflict => {
                debug!(document_id = %self.document_id, "live document already has content; seed ignored");
            }
            SeedDecision::Deferred { .. } | SeedDecision::Nothing => {}
        }
        decision
    }

    /// Single entry point for editor commands. Returns how many mutations
    /// were applied.
    pub fn apply(&mut self, selection: Selection, command: &EditorCommand) -> Result<usize, SessionError> {
        if self.state == SessionState::Disconnected {
            return Err(SessionError::NotMounted);
        }
        let mutations = plan(selection, command);
        for update in apply_mutations(&self.document, &mutations) {
            self.send_update(update);
        }
        Ok(mutations.len())
    }

    pub fn set_cursor(&mut self, cursor: Option<CursorRange>) -> Result<(), SessionError> {
        self.local_presence.cursor = cursor;
        if self.state == SessionState::Disconnected {
            return Ok(());
        }
        awareness::set_local_presence(self.document.awareness(), &self.local_presence)
            .context("failed to publish cursor")?;
        self.announce_local_presence();
        Ok(())
    }

    // ── Comments ────────────────────────────────────────────────────

    pub fn validate_comment_range(&self, start: u32, end: u32) -> Result<(), SessionError> {
        CommentAnchorManager::check_range(&self.document, start, end)?;
        Ok(())
    }

    /// Mark a comment the collaborator has just created. Returns false if the
    /// id was already applied in this session.
    pub fn attach_comment(
        &mut self,
        comment_id: &str,
        start: u32,
        end: u32,
        created_at: DateTime<Utc>,
    ) -> Result<bool, SessionError> {
        if self.state == SessionState::Disconnected {
            return Err(SessionError::NotMounted);
        }
        let anchor = CommentAnchor::new(comment_id, start, end, created_at)?;
        CommentAnchorManager::check_range(&self.document, start, end)?;
        match self.anchors.attach(&self.document, &anchor) {
            Some(update) => {
                self.send_update(update);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn replay_comments(&mut self, records: Vec<CommentRecord>) -> Result<ReplayReport, SessionError> {
        if self.state == SessionState::Disconnected {
            return Err(SessionError::NotMounted);
        }
        let mut report = self.anchors.replay(&self.document, records);
        for update in std::mem::take(&mut report.updates) {
            self.send_update(update);
        }
        for unanchored in &report.unanchored {
            warn!(
                document_id = %self.document_id,
                comment_id = %unanchored.comment_id,
                start = unanchored.start,
                end = unanchored.end,
                "comment range no longer fits the document"
            );
        }
        Ok(report)
    }
}

fn decode_messages(bytes: &[u8]) -> anyhow::Result<Vec<Message>> {
    let mut decoder = DecoderV1::new(Cursor::new(bytes));
    let reader = MessageReader::new(&mut decoder);
    reader.collect::<Result<Vec<_>, _>>().context("failed to decode y-sync message")
}
