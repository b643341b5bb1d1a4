//! Virtual-clock session simulator

use std::time::Duration;

use retro_core::{RetroResult, SessionCode, Timestamp};
use retro_runtime::{ContributorEndpoint, ModeratorEndpoint, SessionConfig};
use retro_store::SnapshotStore;
use retro_transport::{MemoryNetwork, MemoryTransport};

/// Rounds of polling before `settle` gives up on a chatty network
const MAX_SETTLE_ROUNDS: usize = 64;

pub type SimModerator = ModeratorEndpoint<MemoryTransport>;
pub type SimContributor = ContributorEndpoint<MemoryTransport>;

/// Index of a moderator in the simulator
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ModeratorSlot(pub usize);

/// Index of a contributor in the simulator
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ContributorSlot(pub usize);

/// Drives endpoints over a [`MemoryNetwork`] with a simulated clock.
///
/// Time only moves through [`advance`](Self::advance); timers fire in
/// deadline order with the clock set to each deadline.
pub struct SessionSimulator {
    network: MemoryNetwork,
    config: SessionConfig,
    now: Timestamp,
    moderators: Vec<SimModerator>,
    contributors: Vec<SimContributor>,
    style_seed: u64,
}

impl SessionSimulator {
    pub fn new(config: SessionConfig) -> Self {
        SessionSimulator {
            network: MemoryNetwork::new(),
            config,
            now: Timestamp::from_secs(1_700_000_000),
            moderators: Vec::new(),
            contributors: Vec::new(),
            style_seed: 0x5eed,
        }
    }

    pub fn now(&self) -> Timestamp {
        self.now
    }

    pub fn network(&self) -> &MemoryNetwork {
        &self.network
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Host a session. Collisions are returned, not recorded.
    pub fn open_moderator(&mut self, code: &str) -> RetroResult<ModeratorSlot> {
        self.open_moderator_with_store(code, None)
    }

    pub fn open_moderator_with_store(
        &mut self,
        code: &str,
        store: Option<SnapshotStore>,
    ) -> RetroResult<ModeratorSlot> {
        let code = SessionCode::parse(code)?;
        let endpoint = ModeratorEndpoint::open(
            code,
            self.network.transport(),
            self.config.clone(),
            store,
        )?
        .with_style_seed(self.style_seed);
        self.moderators.push(endpoint);
        self.settle();
        Ok(ModeratorSlot(self.moderators.len() - 1))
    }

    /// Add a contributor with a display name, not yet joined
    pub fn add_contributor(&mut self, author: &str) -> ContributorSlot {
        let mut endpoint =
            ContributorEndpoint::new(self.network.transport(), self.config.clone(), None);
        endpoint.set_author(author);
        self.contributors.push(endpoint);
        ContributorSlot(self.contributors.len() - 1)
    }

    /// Join a contributor and let the handshake complete
    pub fn join(&mut self, slot: ContributorSlot, code: &str) -> RetroResult<()> {
        let code = SessionCode::parse(code)?;
        let now = self.now;
        let result = self.contributor_mut(slot).join(code, now);
        self.settle();
        result
    }

    pub fn moderator(&self, slot: ModeratorSlot) -> &SimModerator {
        &self.moderators[slot.0]
    }

    pub fn moderator_mut(&mut self, slot: ModeratorSlot) -> &mut SimModerator {
        &mut self.moderators[slot.0]
    }

    pub fn contributor(&self, slot: ContributorSlot) -> &SimContributor {
        &self.contributors[slot.0]
    }

    pub fn contributor_mut(&mut self, slot: ContributorSlot) -> &mut SimContributor {
        &mut self.contributors[slot.0]
    }

    /// Poll every endpoint at the current time until no events are queued
    pub fn settle(&mut self) {
        for _ in 0..MAX_SETTLE_ROUNDS {
            let now = self.now;
            for m in &mut self.moderators {
                m.poll(now);
            }
            for c in &mut self.contributors {
                c.poll(now);
            }
            if self.quiet() {
                return;
            }
        }
        tracing::warn!("simulator did not settle");
    }

    fn quiet(&self) -> bool {
        self.moderators
            .iter()
            .all(|m| m.transport().pending_events() == 0)
            && self
                .contributors
                .iter()
                .all(|c| c.transport().pending_events() == 0)
    }

    fn next_deadline(&self) -> Option<Timestamp> {
        let moderators = self.moderators.iter().filter_map(|m| m.next_deadline());
        let contributors = self.contributors.iter().filter_map(|c| c.next_deadline());
        moderators.chain(contributors).min()
    }

    /// Move the clock forward, firing every timer that falls due on the way
    pub fn advance(&mut self, by: Duration) {
        let target = self.now + by;
        let mut last = None;
        while let Some(deadline) = self.next_deadline() {
            // a deadline that survived a poll belongs to a stopped endpoint
            if deadline > target || last == Some(deadline) {
                break;
            }
            last = Some(deadline);
            self.now = self.now.max(deadline);
            self.settle();
        }
        self.now = target;
        self.settle();
    }
}

impl Default for SessionSimulator {
    fn default() -> Self {
        SessionSimulator::new(SessionConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_settles_handshake() {
        let mut sim = SessionSimulator::default();
        let m = sim.open_moderator("S1").unwrap();
        let c = sim.add_contributor("Hans");
        sim.join(c, "s1").unwrap();

        assert!(sim.contributor(c).is_connected());
        assert_eq!(sim.moderator(m).participants().len(), 1);
    }

    #[test]
    fn test_advance_fires_heartbeats_in_order() {
        let mut sim = SessionSimulator::default();
        let m = sim.open_moderator("S2").unwrap();
        let c = sim.add_contributor("Lena");
        sim.join(c, "S2").unwrap();

        sim.advance(Duration::from_secs(16));
        assert_eq!(sim.moderator(m).stats().heartbeats_sent, 3);
        // heartbeat echoes keep the participant fresh
        assert_eq!(sim.moderator(m).participants().len(), 1);
    }
}
