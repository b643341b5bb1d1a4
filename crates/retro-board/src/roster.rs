//! Participant roster
//!
//! Participants are kept in join order. An id appears at most once.

use std::time::Duration;

use retro_core::{Participant, ParticipantId, Timestamp};

/// Result of applying a presence update
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PresenceChange {
    /// First presence from this id
    Joined,
    /// Existing participant refreshed in place
    Updated,
}

/// Participants known to the moderator
#[derive(Clone, Debug, Default)]
pub struct Roster {
    participants: Vec<Participant>,
}

impl Roster {
    pub fn new() -> Self {
        Roster::default()
    }

    /// Insert or refresh a participant, stamping `last_seen = now`
    pub fn upsert(
        &mut self,
        id: ParticipantId,
        name: impl Into<String>,
        is_ready: bool,
        now: Timestamp,
    ) -> PresenceChange {
        let name = name.into();
        if let Some(existing) = self.participants.iter_mut().find(|p| p.id == id) {
            existing.name = name;
            existing.is_ready = is_ready;
            existing.last_seen = now;
            return PresenceChange::Updated;
        }

        self.participants.push(Participant {
            id,
            name,
            is_ready,
            last_seen: now,
        });
        PresenceChange::Joined
    }

    pub fn remove(&mut self, id: &ParticipantId) -> Option<Participant> {
        let pos = self.participants.iter().position(|p| &p.id == id)?;
        Some(self.participants.remove(pos))
    }

    /// Drop participants not seen for longer than `timeout`
    pub fn evict_stale(&mut self, now: Timestamp, timeout: Duration) -> Vec<Participant> {
        let mut evicted = Vec::new();
        self.participants.retain(|p| {
            if now.since(p.last_seen) > timeout {
                evicted.push(p.clone());
                false
            } else {
                true
            }
        });
        evicted
    }

    pub fn get(&self, id: &ParticipantId) -> Option<&Participant> {
        self.participants.iter().find(|p| &p.id == id)
    }

    pub fn contains(&self, id: &ParticipantId) -> bool {
        self.get(id).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Participant> {
        self.participants.iter()
    }

    pub fn as_slice(&self) -> &[Participant] {
        &self.participants
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    pub fn ready_count(&self) -> usize {
        self.participants.iter().filter(|p| p.is_ready).count()
    }

    pub fn clear(&mut self) {
        self.participants.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pid(s: &str) -> ParticipantId {
        ParticipantId::new(s)
    }

    #[test]
    fn test_upsert_creates_once() {
        let mut roster = Roster::new();
        let t = Timestamp::from_secs(1);

        assert_eq!(roster.upsert(pid("a"), "Hans", false, t), PresenceChange::Joined);
        assert_eq!(
            roster.upsert(pid("a"), "Hans M.", true, t + Duration::from_secs(2)),
            PresenceChange::Updated
        );

        assert_eq!(roster.len(), 1);
        let p = roster.get(&pid("a")).unwrap();
        assert_eq!(p.name, "Hans M.");
        assert!(p.is_ready);
        assert_eq!(p.last_seen, Timestamp::from_secs(3));
    }

    #[test]
    fn test_join_order_preserved() {
        let mut roster = Roster::new();
        let t = Timestamp::ZERO;
        roster.upsert(pid("b"), "Lena", false, t);
        roster.upsert(pid("a"), "Hans", true, t);
        roster.upsert(pid("b"), "Lena", true, t);

        let names: Vec<&str> = roster.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["Lena", "Hans"]);
        assert_eq!(roster.ready_count(), 2);
    }

    #[test]
    fn test_remove_only_target() {
        let mut roster = Roster::new();
        roster.upsert(pid("a"), "Hans", false, Timestamp::ZERO);
        roster.upsert(pid("b"), "Lena", false, Timestamp::ZERO);

        assert!(roster.remove(&pid("a")).is_some());
        assert!(roster.remove(&pid("a")).is_none());
        assert!(roster.contains(&pid("b")));
        assert_eq!(roster.len(), 1);
    }

    #[test]
    fn test_evict_stale() {
        let mut roster = Roster::new();
        roster.upsert(pid("old"), "Old", false, Timestamp::from_secs(0));
        roster.upsert(pid("new"), "New", false, Timestamp::from_secs(10));

        let evicted = roster.evict_stale(Timestamp::from_secs(16), Duration::from_secs(15));
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].id, pid("old"));
        assert!(roster.contains(&pid("new")));

        // exactly at the boundary is still fresh
        assert!(roster
            .evict_stale(Timestamp::from_secs(25), Duration::from_secs(15))
            .is_empty());
    }
}
