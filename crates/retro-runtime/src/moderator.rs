//! Moderator session endpoint
//!
//! Binds the identity derived from the session code and accepts any number
//! of contributor links. The endpoint owns the authoritative
//! [`SessionState`]; remote submissions and presence are the only inputs
//! from the wire, everything else is a local action.

use std::collections::{HashMap, VecDeque};

use retro_board::{Board, BoardSnapshot, IdeaAggregator, PresenceChange, SessionState, Submitted};
use retro_core::{
    Category, Language, NoteCategory, NoteId, Participant, ParticipantId, PeerId, RetroResult,
    SessionCode, Task, TaskId, Timestamp,
};
use retro_store::{keys, SnapshotStore};
use retro_transport::{LinkId, Transport, TransportEvent};
use retro_wire::Message;

use crate::{SessionConfig, TimerHandle, TimerQueue};

/// Maximum queued endpoint events before the oldest are dropped
const MAX_PENDING_EVENTS: usize = 1024;

/// Counters for a moderator endpoint
#[derive(Clone, Debug, Default)]
pub struct ModeratorStats {
    pub links_accepted: u64,
    pub links_closed: u64,
    pub messages_received: u64,
    pub messages_dropped: u64,
    pub notes_received: u64,
    pub tasks_received: u64,
    pub presence_updates: u64,
    pub heartbeats_sent: u64,
    pub send_failures: u64,
    pub participants_evicted: u64,
}

/// Notifications for the rendering collaborator
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ModeratorEvent {
    LinkOpened { link: LinkId, remote: PeerId },
    LinkClosed { link: LinkId },
    NoteAdded(NoteId),
    TaskAdded(TaskId),
    ParticipantJoined(ParticipantId),
    ParticipantUpdated(ParticipantId),
    ParticipantLeft(ParticipantId),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ModeratorTimer {
    Heartbeat(LinkId),
}

#[derive(Debug)]
struct LinkState {
    remote: PeerId,
    open: bool,
    heartbeat: Option<TimerHandle>,
    /// Participant ids announced over this link
    participants: Vec<ParticipantId>,
}

/// The hosting side of a session
pub struct ModeratorEndpoint<T: Transport> {
    code: SessionCode,
    identity: PeerId,
    transport: T,
    config: SessionConfig,
    store: Option<SnapshotStore>,
    state: SessionState,
    aggregator: IdeaAggregator,
    board_cache: Option<(u64, Board)>,
    links: HashMap<LinkId, LinkState>,
    timers: TimerQueue<ModeratorTimer>,
    events: VecDeque<ModeratorEvent>,
    stats: ModeratorStats,
    closed: bool,
}

impl<T: Transport> ModeratorEndpoint<T> {
    /// Bind the moderator identity for `code` and start hosting.
    ///
    /// Fails with `IdentityTaken` when another moderator already holds the
    /// code; the transport is released and no role is entered.
    pub fn open(
        code: SessionCode,
        mut transport: T,
        config: SessionConfig,
        store: Option<SnapshotStore>,
    ) -> RetroResult<Self> {
        let requested = PeerId::moderator(&config.identity_prefix, &code);
        let identity = match transport.bind(Some(requested)) {
            Ok(identity) => identity,
            Err(e) => {
                tracing::warn!(code = %code, error = %e, "failed to open session");
                transport.destroy();
                return Err(e.into());
            }
        };

        let state = match &store {
            Some(store) => restore_state(store, &code),
            None => SessionState::default(),
        };
        if let Some(store) = &store {
            store.set_session_code(&code);
            store.save(keys::BOARD, &state.snapshot());
        }

        tracing::info!(code = %code, peer = %identity, "moderator session opened");

        Ok(ModeratorEndpoint {
            code,
            identity,
            transport,
            config,
            store,
            state,
            aggregator: IdeaAggregator::with_random_seed(),
            board_cache: None,
            links: HashMap::new(),
            timers: TimerQueue::new(),
            events: VecDeque::new(),
            stats: ModeratorStats::default(),
            closed: false,
        })
    }

    /// Use a fixed aggregation seed so group styles are reproducible
    pub fn with_style_seed(mut self, seed: u64) -> Self {
        self.aggregator = IdeaAggregator::new(seed);
        self.board_cache = None;
        self
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn code(&self) -> &SessionCode {
        &self.code
    }

    pub fn identity(&self) -> &PeerId {
        &self.identity
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn participants(&self) -> &[Participant] {
        self.state.roster().as_slice()
    }

    pub fn stats(&self) -> &ModeratorStats {
        &self.stats
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn is_open(&self) -> bool {
        !self.closed
    }

    /// Number of links currently open
    pub fn link_count(&self) -> usize {
        self.links.values().filter(|l| l.open).count()
    }

    /// Earliest pending timer deadline
    pub fn next_deadline(&self) -> Option<Timestamp> {
        self.timers.next_deadline()
    }

    /// Grouped notes for display, recomputed only after the state changed
    pub fn board(&mut self) -> &Board {
        let revision = self.state.revision();
        if self.board_cache.as_ref().map_or(false, |(r, _)| *r != revision) {
            self.board_cache = None;
        }
        let (_, board) = self
            .board_cache
            .get_or_insert_with(|| (revision, self.aggregator.aggregate(self.state.notes())));
        board
    }

    pub fn pop_event(&mut self) -> Option<ModeratorEvent> {
        self.events.pop_front()
    }

    // ------------------------------------------------------------------
    // Event loop
    // ------------------------------------------------------------------

    /// Process pending transport events, then due timers, then the
    /// staleness sweep
    pub fn poll(&mut self, now: Timestamp) {
        if self.closed {
            return;
        }

        while let Some(event) = self.transport.poll_event() {
            self.handle_transport_event(event, now);
        }

        while let Some((_, timer)) = self.timers.pop_due(now) {
            match timer {
                ModeratorTimer::Heartbeat(link) => self.on_heartbeat(link, now),
            }
        }

        self.evict_stale(now);
    }

    fn handle_transport_event(&mut self, event: TransportEvent, now: Timestamp) {
        match event {
            TransportEvent::Incoming { link, remote } => {
                tracing::debug!(%link, peer = %remote, "incoming link");
                self.links.insert(
                    link,
                    LinkState {
                        remote,
                        open: false,
                        heartbeat: None,
                        participants: Vec::new(),
                    },
                );
            }
            TransportEvent::Open { link } => self.on_link_open(link, now),
            TransportEvent::Data { link, payload } => self.on_data(link, &payload, now),
            TransportEvent::Close { link } => self.drop_link(link),
            TransportEvent::Error {
                link: Some(link),
                error,
            } => {
                tracing::info!(%link, error = %error, "link error, closing");
                self.transport.close(link);
                self.drop_link(link);
            }
            TransportEvent::Error { link: None, error } => {
                tracing::warn!(error = %error, "transport error");
            }
        }
    }

    fn on_link_open(&mut self, link: LinkId, now: Timestamp) {
        let Some(state) = self.links.get_mut(&link) else {
            tracing::debug!(%link, "open for unknown link");
            return;
        };
        state.open = true;
        let remote = state.remote.clone();
        self.stats.links_accepted += 1;
        tracing::info!(%link, peer = %remote, "contributor link opened");

        let sync = Message::sync_labels(self.state.labels().clone(), self.state.language());
        if self.send(link, &sync).is_err() {
            self.fail_link(link);
            return;
        }

        let handle = self
            .timers
            .schedule(now + self.config.heartbeat_period(), ModeratorTimer::Heartbeat(link));
        if let Some(state) = self.links.get_mut(&link) {
            state.heartbeat = Some(handle);
        }
        self.push_event(ModeratorEvent::LinkOpened { link, remote });
    }

    fn on_heartbeat(&mut self, link: LinkId, now: Timestamp) {
        let open = self.links.get(&link).map_or(false, |l| l.open);
        if !open {
            return;
        }

        let heartbeat = Message::heartbeat(self.state.labels().clone(), self.state.language());
        if self.send(link, &heartbeat).is_err() {
            self.fail_link(link);
            return;
        }
        self.stats.heartbeats_sent += 1;

        let handle = self
            .timers
            .schedule(now + self.config.heartbeat_period(), ModeratorTimer::Heartbeat(link));
        if let Some(state) = self.links.get_mut(&link) {
            state.heartbeat = Some(handle);
        }
    }

    fn on_data(&mut self, link: LinkId, payload: &[u8], now: Timestamp) {
        self.stats.messages_received += 1;

        let message = match Message::decode(payload) {
            Ok(message) => message,
            Err(e) => {
                self.stats.messages_dropped += 1;
                tracing::debug!(%link, error = %e, "dropping malformed message");
                return;
            }
        };

        match message {
            Message::SubmitNote {
                content,
                category,
                author,
            } => self.on_submit(link, &content, category, &author, now),
            Message::Presence { id, name, is_ready } => {
                self.on_presence(link, id, name, is_ready, now)
            }
            Message::SyncLabels { .. } | Message::Heartbeat { .. } => {
                self.stats.messages_dropped += 1;
                tracing::debug!(%link, "dropping moderator-only message from contributor");
            }
            Message::Unknown => {
                self.stats.messages_dropped += 1;
                tracing::debug!(%link, "dropping unknown message");
            }
        }
    }

    fn on_submit(
        &mut self,
        link: LinkId,
        content: &str,
        category: Category,
        author: &str,
        now: Timestamp,
    ) {
        match self.state.submit(content, category, author, now) {
            Ok(Submitted::Note(id)) => {
                self.stats.notes_received += 1;
                tracing::debug!(%link, note = %id, %category, "note received");
                self.push_event(ModeratorEvent::NoteAdded(id));
            }
            Ok(Submitted::Task(id)) => {
                self.stats.tasks_received += 1;
                tracing::debug!(%link, task = %id, "task received");
                self.push_event(ModeratorEvent::TaskAdded(id));
            }
            Err(e) => {
                self.stats.messages_dropped += 1;
                tracing::debug!(%link, error = %e, "dropping submission");
                return;
            }
        }
        self.persist();
    }

    fn on_presence(
        &mut self,
        link: LinkId,
        id: ParticipantId,
        name: String,
        is_ready: bool,
        now: Timestamp,
    ) {
        let Some(state) = self.links.get_mut(&link) else {
            self.stats.messages_dropped += 1;
            tracing::debug!(%link, "presence on unknown link");
            return;
        };
        if !state.participants.contains(&id) {
            state.participants.push(id.clone());
        }

        self.stats.presence_updates += 1;
        let event = match self.state.roster_mut().upsert(id.clone(), name, is_ready, now) {
            PresenceChange::Joined => {
                tracing::info!(%link, participant = %id, "participant joined");
                ModeratorEvent::ParticipantJoined(id)
            }
            PresenceChange::Updated => ModeratorEvent::ParticipantUpdated(id),
        };
        self.push_event(event);
    }

    /// Remove a link and exactly the participants that belong to it
    fn drop_link(&mut self, link: LinkId) {
        let Some(state) = self.links.remove(&link) else {
            return;
        };
        if let Some(handle) = state.heartbeat {
            self.timers.cancel(handle);
        }
        self.stats.links_closed += 1;
        tracing::info!(%link, peer = %state.remote, "contributor link closed");

        let by_peer = ParticipantId::from(&state.remote);
        let mut owned = state.participants;
        if !owned.contains(&by_peer) {
            owned.push(by_peer);
        }

        for id in owned {
            // another live link may have announced the same id
            let shared = self.links.values().any(|l| l.participants.contains(&id));
            if shared {
                continue;
            }
            if self.state.roster_mut().remove(&id).is_some() {
                tracing::info!(%link, participant = %id, "participant left");
                self.push_event(ModeratorEvent::ParticipantLeft(id));
            }
        }
        self.push_event(ModeratorEvent::LinkClosed { link });
    }

    fn fail_link(&mut self, link: LinkId) {
        self.stats.send_failures += 1;
        self.transport.close(link);
        self.drop_link(link);
    }

    fn evict_stale(&mut self, now: Timestamp) {
        let Some(timeout) = self.config.presence_timeout else {
            return;
        };
        for participant in self.state.roster_mut().evict_stale(now, timeout) {
            self.stats.participants_evicted += 1;
            tracing::info!(participant = %participant.id, "evicting stale participant");
            for link in self.links.values_mut() {
                link.participants.retain(|id| id != &participant.id);
            }
            self.push_event(ModeratorEvent::ParticipantLeft(participant.id));
        }
    }

    fn send(&mut self, link: LinkId, message: &Message) -> RetroResult<()> {
        let payload = message.encode()?;
        self.transport.send(link, payload).map_err(|e| {
            tracing::warn!(%link, kind = message.kind(), error = %e, "send failed");
            e.into()
        })
    }

    fn push_event(&mut self, event: ModeratorEvent) {
        if self.events.len() >= MAX_PENDING_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(event);
    }

    fn persist(&self) {
        if let Some(store) = &self.store {
            store.save(keys::BOARD, &self.state.snapshot());
        }
    }

    // ------------------------------------------------------------------
    // Local moderator actions
    // ------------------------------------------------------------------

    pub fn move_note(&mut self, id: NoteId, to: NoteCategory) -> bool {
        let moved = self.state.move_note(id, to);
        if moved {
            self.persist();
        }
        moved
    }

    /// Move every note of the group seeded by `group`
    pub fn move_group(&mut self, group: NoteId, to: NoteCategory) -> usize {
        let ids = self.group_members(group);
        let moved = self.state.move_notes(&ids, to);
        if moved > 0 {
            self.persist();
        }
        moved
    }

    pub fn edit_note(&mut self, id: NoteId, content: &str) -> RetroResult<bool> {
        let edited = self.state.edit_note(id, content)?;
        if edited {
            self.persist();
        }
        Ok(edited)
    }

    /// Rewrite every note of the group seeded by `group`
    pub fn edit_group(&mut self, group: NoteId, content: &str) -> RetroResult<usize> {
        let ids = self.group_members(group);
        let edited = self.state.edit_notes(&ids, content)?;
        if edited > 0 {
            self.persist();
        }
        Ok(edited)
    }

    fn group_members(&mut self, group: NoteId) -> Vec<NoteId> {
        self.board()
            .group_of(group)
            .map(|g| g.note_ids.clone())
            .unwrap_or_else(|| vec![group])
    }

    pub fn add_task(&mut self, text: &str, now: Timestamp) -> RetroResult<TaskId> {
        let id = self.state.add_task(text, now)?;
        self.persist();
        Ok(id)
    }

    pub fn toggle_task(&mut self, id: TaskId) -> Option<bool> {
        let completed = self.state.toggle_task(id)?;
        self.persist();
        Some(completed)
    }

    pub fn remove_task(&mut self, id: TaskId) -> Option<Task> {
        let task = self.state.remove_task(id)?;
        self.persist();
        Some(task)
    }

    /// Rename a category. Contributors pick it up on the next heartbeat.
    /// Labels longer than `MAX_LABEL_LEN` characters are refused.
    pub fn update_label(&mut self, category: Category, label: &str) -> bool {
        let changed = self.state.update_label(category, label);
        if changed {
            self.persist();
        }
        changed
    }

    /// Switch language, resetting labels to the language defaults
    pub fn set_language(&mut self, language: Language) {
        self.state.set_language(language);
        if let Some(store) = &self.store {
            store.set_language(language);
        }
        self.persist();
    }

    pub fn toggle_reveal(&mut self) -> bool {
        let revealed = self.state.toggle_reveal();
        self.persist();
        revealed
    }

    /// Clear notes, tasks and reveal
    pub fn reset(&mut self) {
        self.state.reset();
        self.aggregator.clear();
        self.persist();
    }

    /// Stop hosting: cancel every timer and release the identity
    pub fn shutdown(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.timers.clear();
        self.links.clear();
        self.transport.destroy();
        tracing::info!(code = %self.code, "moderator session closed");
    }
}

impl<T: Transport> Drop for ModeratorEndpoint<T> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn restore_state(store: &SnapshotStore, code: &SessionCode) -> SessionState {
    if store.session_code().as_ref() == Some(code) {
        if let Some(snapshot) = store.load::<BoardSnapshot>(keys::BOARD) {
            tracing::info!(code = %code, notes = snapshot.notes.len(), "restored board snapshot");
            return SessionState::from_snapshot(snapshot);
        }
    }
    SessionState::new(store.language())
}
