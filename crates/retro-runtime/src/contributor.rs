//! Contributor session endpoint
//!
//! Holds one outgoing link to the moderator and a mirror of the labels and
//! language. A lost link schedules exactly one re-join after a fixed delay;
//! the loop is unbounded until the endpoint leaves the session.

use std::collections::VecDeque;

use retro_core::{
    Category, CategoryLabelSet, Language, ParticipantId, PeerId, RetroError, RetroResult,
    SessionCode, Timestamp,
};
use retro_store::SnapshotStore;
use retro_transport::{LinkId, Transport, TransportEvent};
use retro_wire::Message;

use crate::{SessionConfig, TimerHandle, TimerQueue};

/// Counters for a contributor endpoint
#[derive(Clone, Debug, Default)]
pub struct ContributorStats {
    pub join_attempts: u64,
    pub reconnects_scheduled: u64,
    pub messages_received: u64,
    pub messages_dropped: u64,
    pub labels_adopted: u64,
    pub notes_sent: u64,
    pub presence_sent: u64,
}

/// Notifications for the rendering collaborator
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ContributorEvent {
    Connected,
    Disconnected,
    LabelsChanged,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ContributorTimer {
    Reconnect,
}

/// The joining side of a session
pub struct ContributorEndpoint<T: Transport> {
    transport: T,
    config: SessionConfig,
    store: Option<SnapshotStore>,
    code: Option<SessionCode>,
    link: Option<LinkId>,
    connected: bool,
    labels: CategoryLabelSet,
    language: Language,
    participant_id: ParticipantId,
    author: String,
    explicit_ready: bool,
    draft: String,
    /// Own presence last sent on the current link
    last_presence: Option<Message>,
    reconnect: Option<TimerHandle>,
    timers: TimerQueue<ContributorTimer>,
    events: VecDeque<ContributorEvent>,
    stats: ContributorStats,
    closed: bool,
}

impl<T: Transport> ContributorEndpoint<T> {
    pub fn new(transport: T, config: SessionConfig, store: Option<SnapshotStore>) -> Self {
        let (author, language) = match &store {
            Some(store) => (store.author().unwrap_or_default(), store.language()),
            None => (String::new(), Language::default()),
        };

        ContributorEndpoint {
            transport,
            config,
            store,
            code: None,
            link: None,
            connected: false,
            labels: CategoryLabelSet::for_language(language),
            language,
            participant_id: ParticipantId::generate(),
            author,
            explicit_ready: false,
            draft: String::new(),
            last_presence: None,
            reconnect: None,
            timers: TimerQueue::new(),
            events: VecDeque::new(),
            stats: ContributorStats::default(),
            closed: false,
        }
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn code(&self) -> Option<&SessionCode> {
        self.code.as_ref()
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn labels(&self) -> &CategoryLabelSet {
        &self.labels
    }

    pub fn language(&self) -> Language {
        self.language
    }

    /// Stable id announced in presence messages, independent of the
    /// network identity which changes on every join
    pub fn participant_id(&self) -> &ParticipantId {
        &self.participant_id
    }

    pub fn identity(&self) -> Option<&PeerId> {
        self.transport.identity()
    }

    pub fn author(&self) -> &str {
        &self.author
    }

    pub fn draft(&self) -> &str {
        &self.draft
    }

    /// Explicit toggle or a non-empty draft
    pub fn is_ready(&self) -> bool {
        self.explicit_ready || !self.draft.is_empty()
    }

    pub fn reconnect_pending(&self) -> bool {
        self.reconnect
            .map_or(false, |handle| self.timers.is_pending(handle))
    }

    pub fn next_deadline(&self) -> Option<Timestamp> {
        self.timers.next_deadline()
    }

    pub fn stats(&self) -> &ContributorStats {
        &self.stats
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn pop_event(&mut self) -> Option<ContributorEvent> {
        self.events.pop_front()
    }

    // ------------------------------------------------------------------
    // Session lifecycle
    // ------------------------------------------------------------------

    /// Join the session hosted under `code`.
    ///
    /// Any previous link and identity are torn down first. On failure a
    /// re-join is scheduled and the error is returned.
    pub fn join(&mut self, code: SessionCode, now: Timestamp) -> RetroResult<()> {
        if self.closed {
            return Err(RetroError::Shutdown);
        }

        self.cancel_reconnect();
        self.teardown_link();
        self.code = Some(code.clone());
        self.stats.join_attempts += 1;
        if let Some(store) = &self.store {
            store.set_session_code(&code);
        }

        let moderator = PeerId::moderator(&self.config.identity_prefix, &code);
        let result = self
            .transport
            .bind(None)
            .and_then(|_| self.transport.connect(&moderator));

        match result {
            Ok(link) => {
                tracing::debug!(code = %code, %link, "joining session");
                self.link = Some(link);
                Ok(())
            }
            Err(e) => {
                tracing::info!(code = %code, error = %e, "join failed");
                self.schedule_reconnect(now);
                Err(e.into())
            }
        }
    }

    /// Leave the session: no reconnects, identity released
    pub fn leave(&mut self) {
        self.cancel_reconnect();
        self.timers.clear();
        let was_connected = self.connected;
        self.teardown_link();
        self.transport.destroy();
        self.code = None;
        if was_connected {
            self.push_event(ContributorEvent::Disconnected);
        }
    }

    /// Leave and refuse further joins
    pub fn shutdown(&mut self) {
        if self.closed {
            return;
        }
        self.leave();
        self.closed = true;
    }

    fn teardown_link(&mut self) {
        if let Some(link) = self.link.take() {
            self.transport.close(link);
        }
        self.connected = false;
        self.last_presence = None;
    }

    fn schedule_reconnect(&mut self, now: Timestamp) {
        if self.closed || self.code.is_none() || self.reconnect_pending() {
            return;
        }
        let at = now + self.config.reconnect_period();
        self.reconnect = Some(self.timers.schedule(at, ContributorTimer::Reconnect));
        self.stats.reconnects_scheduled += 1;
        tracing::debug!(delay = ?self.config.reconnect_period(), "reconnect scheduled");
    }

    fn cancel_reconnect(&mut self) {
        if let Some(handle) = self.reconnect.take() {
            self.timers.cancel(handle);
        }
    }

    // ------------------------------------------------------------------
    // Event loop
    // ------------------------------------------------------------------

    /// Process pending transport events, then due timers
    pub fn poll(&mut self, now: Timestamp) {
        if self.closed {
            return;
        }

        while let Some(event) = self.transport.poll_event() {
            self.handle_transport_event(event, now);
        }

        while let Some((_, timer)) = self.timers.pop_due(now) {
            match timer {
                ContributorTimer::Reconnect => {
                    self.reconnect = None;
                    if let Some(code) = self.code.clone() {
                        tracing::info!(code = %code, "reconnecting");
                        // a failed attempt schedules the next one
                        let _ = self.join(code, now);
                    }
                }
            }
        }
    }

    fn handle_transport_event(&mut self, event: TransportEvent, now: Timestamp) {
        match event {
            TransportEvent::Incoming { link, remote } => {
                tracing::debug!(%link, peer = %remote, "refusing incoming link");
                self.transport.close(link);
            }
            TransportEvent::Open { link } if self.link == Some(link) => {
                self.connected = true;
                tracing::info!(%link, "connected to moderator");
                self.push_event(ContributorEvent::Connected);
                self.refresh_presence();
            }
            TransportEvent::Data { link, payload } if self.link == Some(link) => {
                self.on_data(&payload);
            }
            TransportEvent::Close { link } if self.link == Some(link) => {
                self.on_link_lost(now);
            }
            TransportEvent::Error {
                link: Some(link),
                error,
            } if self.link == Some(link) => {
                tracing::info!(%link, error = %error, "link error");
                self.transport.close(link);
                self.on_link_lost(now);
            }
            TransportEvent::Error { link: None, error } => {
                tracing::warn!(error = %error, "transport error");
                if !self.connected {
                    self.on_link_lost(now);
                }
            }
            other => {
                tracing::trace!(link = ?other.link(), "ignoring event for stale link");
            }
        }
    }

    fn on_link_lost(&mut self, now: Timestamp) {
        let was_connected = self.connected;
        self.link = None;
        self.connected = false;
        self.last_presence = None;
        if was_connected {
            tracing::info!("disconnected from moderator");
            self.push_event(ContributorEvent::Disconnected);
        }
        self.schedule_reconnect(now);
    }

    fn on_data(&mut self, payload: &[u8]) {
        self.stats.messages_received += 1;

        let message = match Message::decode(payload) {
            Ok(message) => message,
            Err(e) => {
                self.stats.messages_dropped += 1;
                tracing::debug!(error = %e, "dropping malformed message");
                return;
            }
        };

        match message {
            Message::SyncLabels { labels, language } => self.adopt(labels, language),
            Message::Heartbeat { labels, language } => {
                self.adopt(labels, language);
                self.echo_presence();
            }
            Message::SubmitNote { .. } | Message::Presence { .. } => {
                self.stats.messages_dropped += 1;
                tracing::debug!("dropping contributor-only message from moderator");
            }
            Message::Unknown => {
                self.stats.messages_dropped += 1;
                tracing::debug!("dropping unknown message");
            }
        }
    }

    /// Last writer wins
    fn adopt(&mut self, labels: CategoryLabelSet, language: Language) {
        if self.labels == labels && self.language == language {
            return;
        }
        self.labels = labels;
        if self.language != language {
            self.language = language;
            if let Some(store) = &self.store {
                store.set_language(language);
            }
        }
        self.stats.labels_adopted += 1;
        self.push_event(ContributorEvent::LabelsChanged);
    }

    // ------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------

    /// Submit a note. Nothing is sent unless the trimmed content is
    /// non-empty, a category is chosen and the link is open.
    pub fn submit_note(
        &mut self,
        content: &str,
        category: Option<Category>,
        author: &str,
    ) -> RetroResult<()> {
        let content = content.trim();
        if content.is_empty() {
            return Err(RetroError::EmptyContent);
        }
        let category = category.ok_or(RetroError::NoCategory)?;
        let link = self.open_link()?;

        self.send(link, &Message::submit_note(content, category, author.trim()))?;
        self.stats.notes_sent += 1;
        Ok(())
    }

    /// Announce readiness explicitly
    pub fn set_ready(&mut self, id: ParticipantId, name: &str, is_ready: bool) -> RetroResult<()> {
        let link = self.open_link()?;
        let own = id == self.participant_id;
        let presence = Message::presence(id, name, is_ready);
        self.send(link, &presence)?;
        self.stats.presence_sent += 1;
        if own {
            self.last_presence = Some(presence);
        }
        Ok(())
    }

    fn own_presence(&self) -> Message {
        Message::presence(
            self.participant_id.clone(),
            self.author.trim(),
            self.is_ready(),
        )
    }

    pub fn set_author(&mut self, author: &str) {
        if self.author == author {
            return;
        }
        self.author = author.to_string();
        if let Some(store) = &self.store {
            store.set_author(author);
        }
        self.refresh_presence();
    }

    pub fn set_explicit_ready(&mut self, ready: bool) {
        self.explicit_ready = ready;
        self.refresh_presence();
    }

    pub fn toggle_ready(&mut self) -> bool {
        self.set_explicit_ready(!self.explicit_ready);
        self.explicit_ready
    }

    /// Update the text being typed; a non-empty draft counts as ready
    pub fn set_draft(&mut self, draft: &str) {
        self.draft = draft.to_string();
        self.refresh_presence();
    }

    /// Submit the current draft under the stored author, clearing it on
    /// success
    pub fn submit_draft(&mut self, category: Option<Category>) -> RetroResult<()> {
        let draft = self.draft.clone();
        let author = self.author.clone();
        self.submit_note(&draft, category, &author)?;
        self.set_draft("");
        Ok(())
    }

    /// Send presence when the effective state differs from what the
    /// moderator last heard on this link
    fn refresh_presence(&mut self) {
        if !self.connected {
            return;
        }
        let presence = self.own_presence();
        if self.last_presence.as_ref() == Some(&presence) {
            return;
        }
        let id = self.participant_id.clone();
        let name = self.author.trim().to_string();
        let ready = self.is_ready();
        if let Err(e) = self.set_ready(id, &name, ready) {
            tracing::debug!(error = %e, "presence not sent");
        }
    }

    /// Re-announce this endpoint's own participant so it stays fresh
    fn echo_presence(&mut self) {
        let Ok(link) = self.open_link() else {
            return;
        };
        let presence = self.own_presence();
        if self.send(link, &presence).is_ok() {
            self.stats.presence_sent += 1;
            self.last_presence = Some(presence);
        }
    }

    fn open_link(&self) -> RetroResult<LinkId> {
        match self.link {
            Some(link) if self.connected => Ok(link),
            _ => Err(RetroError::NotConnected),
        }
    }

    fn send(&mut self, link: LinkId, message: &Message) -> RetroResult<()> {
        let payload = message.encode()?;
        self.transport.send(link, payload).map_err(|e| {
            tracing::warn!(%link, kind = message.kind(), error = %e, "send failed");
            e.into()
        })
    }

    fn push_event(&mut self, event: ContributorEvent) {
        self.events.push_back(event);
    }
}

impl<T: Transport> Drop for ContributorEndpoint<T> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use bytes::Bytes;
    use retro_store::MemoryStore;
    use retro_transport::{MemoryNetwork, MemoryTransport};

    use crate::ModeratorEndpoint;

    fn code() -> SessionCode {
        SessionCode::parse("D1").unwrap()
    }

    fn host(net: &MemoryNetwork) -> ModeratorEndpoint<MemoryTransport> {
        ModeratorEndpoint::open(code(), net.transport(), SessionConfig::default(), None).unwrap()
    }

    fn guest(net: &MemoryNetwork) -> ContributorEndpoint<MemoryTransport> {
        ContributorEndpoint::new(net.transport(), SessionConfig::default(), None)
    }

    #[test]
    fn test_join_connects_and_adopts_labels() {
        let net = MemoryNetwork::new();
        let mut m = host(&net);
        m.update_label(Category::Good, "Great");
        let mut c = guest(&net);

        c.join(code(), Timestamp::ZERO).unwrap();
        c.poll(Timestamp::ZERO);
        m.poll(Timestamp::ZERO);
        c.poll(Timestamp::ZERO);

        assert!(c.is_connected());
        assert_eq!(c.labels().good, "Great");
        assert_eq!(c.pop_event(), Some(ContributorEvent::Connected));
        assert_eq!(c.pop_event(), Some(ContributorEvent::LabelsChanged));
    }

    #[test]
    fn test_submission_preconditions() {
        let net = MemoryNetwork::new();
        let mut c = guest(&net);

        assert_eq!(
            c.submit_note("  ", Some(Category::Good), "Hans"),
            Err(RetroError::EmptyContent)
        );
        assert_eq!(c.submit_note("x", None, "Hans"), Err(RetroError::NoCategory));
        assert_eq!(
            c.submit_note("x", Some(Category::Good), "Hans"),
            Err(RetroError::NotConnected)
        );
        assert_eq!(c.stats().notes_sent, 0);
    }

    #[test]
    fn test_missing_moderator_schedules_single_reconnect() {
        let net = MemoryNetwork::new();
        let mut c = guest(&net);
        c.join(code(), Timestamp::ZERO).unwrap();
        c.poll(Timestamp::ZERO);

        assert!(!c.is_connected());
        assert!(c.reconnect_pending());
        assert_eq!(c.next_deadline(), Some(Timestamp::from_secs(3)));
        assert_eq!(c.stats().reconnects_scheduled, 1);

        c.poll(Timestamp::from_secs(1));
        assert_eq!(c.stats().reconnects_scheduled, 1);

        // the retry fails again and schedules the next one
        c.poll(Timestamp::from_secs(3));
        c.poll(Timestamp::from_secs(3));
        assert_eq!(c.stats().join_attempts, 2);
        assert_eq!(c.next_deadline(), Some(Timestamp::from_secs(6)));
    }

    #[test]
    fn test_reactive_presence() {
        let net = MemoryNetwork::new();
        let mut m = host(&net);
        let mut c = guest(&net);
        c.set_author("Lena");
        c.join(code(), Timestamp::ZERO).unwrap();
        m.poll(Timestamp::ZERO);
        c.poll(Timestamp::ZERO);
        m.poll(Timestamp::ZERO);

        assert_eq!(m.participants().len(), 1);
        assert_eq!(m.participants()[0].name, "Lena");
        assert!(!m.participants()[0].is_ready);

        c.set_draft("Too many meetings");
        m.poll(Timestamp::from_secs(1));
        assert!(m.participants()[0].is_ready);

        // unchanged effective state sends nothing
        let sent = c.stats().presence_sent;
        c.set_explicit_ready(true);
        assert_eq!(c.stats().presence_sent, sent);

        c.set_draft("");
        assert!(c.is_ready());
        c.set_explicit_ready(false);
        m.poll(Timestamp::from_secs(2));
        assert!(!m.participants()[0].is_ready);
        assert_eq!(m.participants()[0].id, *c.participant_id());
    }

    #[test]
    fn test_leave_cancels_reconnect() {
        let net = MemoryNetwork::new();
        let mut c = guest(&net);
        c.join(code(), Timestamp::ZERO).unwrap();
        c.poll(Timestamp::ZERO);
        assert!(c.reconnect_pending());

        c.leave();
        assert!(!c.reconnect_pending());
        c.poll(Timestamp::from_secs(10));
        assert_eq!(c.stats().join_attempts, 1);
        assert!(c.identity().is_none());
    }

    #[test]
    fn test_submit_draft_clears_it() {
        let net = MemoryNetwork::new();
        let mut m = host(&net);
        let mut c = guest(&net);
        c.set_author("Hans");
        c.join(code(), Timestamp::ZERO).unwrap();
        m.poll(Timestamp::ZERO);
        c.poll(Timestamp::ZERO);

        c.set_draft("  Good retro ");
        c.submit_draft(Some(Category::Good)).unwrap();
        assert_eq!(c.draft(), "");

        m.poll(Timestamp::from_secs(1));
        assert_eq!(m.state().notes()[0].content, "Good retro");
        assert_eq!(m.state().notes()[0].author, "Hans");
    }

    #[test]
    fn test_author_and_language_persisted() {
        let net = MemoryNetwork::new();
        let store = SnapshotStore::new(MemoryStore::new());
        let mut m = host(&net);
        m.set_language(Language::En);

        let mut c = ContributorEndpoint::new(
            net.transport(),
            SessionConfig::default().with_reconnect_delay(Duration::from_secs(1)),
            Some(store.clone()),
        );
        c.set_author("Lena");
        c.join(code(), Timestamp::ZERO).unwrap();
        m.poll(Timestamp::ZERO);
        c.poll(Timestamp::ZERO);

        assert_eq!(store.author().as_deref(), Some("Lena"));
        assert_eq!(store.language(), Language::En);
        assert_eq!(store.session_code(), Some(code()));
    }

    #[test]
    fn test_garbage_from_moderator_is_dropped() {
        let net = MemoryNetwork::new();
        let mut fake = net.transport();
        fake.bind(Some(PeerId::moderator("retro-app-", &code()))).unwrap();
        let mut c = guest(&net);
        c.join(code(), Timestamp::ZERO).unwrap();
        c.poll(Timestamp::ZERO);
        assert!(c.is_connected());
        while c.pop_event().is_some() {}

        let link = std::iter::from_fn(|| fake.poll_event())
            .find_map(|e| match e {
                TransportEvent::Incoming { link, .. } => Some(link),
                _ => None,
            })
            .unwrap();
        fake.send(link, Bytes::from_static(b"{oops")).unwrap();
        fake.send(link, Bytes::from_static(br#"{"type":"cursor","x":1}"#))
            .unwrap();
        fake.send(
            link,
            Message::submit_note("sneaky", Category::Good, "Eve").encode().unwrap(),
        )
        .unwrap();
        c.poll(Timestamp::from_secs(1));

        assert!(c.is_connected());
        assert!(!c.reconnect_pending());
        assert_eq!(c.stats().messages_received, 3);
        assert_eq!(c.stats().messages_dropped, 3);
        assert_eq!(c.labels(), &CategoryLabelSet::default());
        assert_eq!(c.language(), Language::De);
        assert_eq!(c.pop_event(), None);
    }

    #[test]
    fn test_heartbeat_echo_refreshes_own_presence() {
        let net = MemoryNetwork::new();
        let mut m = host(&net);
        let mut c = guest(&net);
        c.set_author("Hans");
        c.join(code(), Timestamp::ZERO).unwrap();
        m.poll(Timestamp::ZERO);
        c.poll(Timestamp::ZERO);

        c.set_ready(ParticipantId::new("hans-tablet"), "Hans (tablet)", true)
            .unwrap();
        m.poll(Timestamp::ZERO);
        assert_eq!(m.participants().len(), 2);

        for secs in [5, 10, 15, 20] {
            let now = Timestamp::from_secs(secs);
            m.poll(now);
            c.poll(now);
        }
        m.poll(Timestamp::from_secs(20));

        let ids: Vec<&ParticipantId> = m.participants().iter().map(|p| &p.id).collect();
        assert_eq!(ids, vec![c.participant_id()]);
        assert_eq!(m.participants()[0].name, "Hans");
    }
}
