//! End-to-end session scenarios
//!
//! Scenarios that exercise the complete flow:
//! - Contributor submissions reaching the moderator's grouped board
//! - Label and language replication
//! - Reconnection after link loss
//! - Roster maintenance

use std::time::Duration;

use retro_board::Board;
use retro_core::{Category, CategoryLabelSet, Note, RetroResult};
use retro_runtime::SessionConfig;

use crate::SessionSimulator;

// ============================================================================
// SCENARIOS
// ============================================================================

/// Outcome of the shared idea scenario
#[derive(Clone, Debug)]
pub struct SharedIdeaOutcome {
    /// Moderator notes after the first submission
    pub notes_after_first: Vec<Note>,
    /// Board after the first submission
    pub board_after_first: Board,
    /// Board after the second contributor submitted the same idea
    pub board: Board,
}

/// The moderator opens `D1`. Hans joins as `d1` and submits an idea, then
/// Lena joins and submits the same idea with different padding and case.
pub fn scenario_shared_idea() -> RetroResult<SharedIdeaOutcome> {
    let mut sim = SessionSimulator::default();
    let m = sim.open_moderator("D1")?;
    let hans = sim.add_contributor("Hans");
    let lena = sim.add_contributor("Lena");

    sim.join(hans, "d1")?;
    sim.contributor_mut(hans)
        .submit_note("Good retro", Some(Category::Good), "Hans")?;
    sim.settle();
    let notes_after_first = sim.moderator(m).state().notes().to_vec();
    let board_after_first = sim.moderator_mut(m).board().clone();

    sim.join(lena, "D1")?;
    sim.contributor_mut(lena)
        .submit_note(" good retro ", Some(Category::Good), "Lena")?;
    sim.settle();

    Ok(SharedIdeaOutcome {
        notes_after_first,
        board_after_first,
        board: sim.moderator_mut(m).board().clone(),
    })
}

/// Outcome of the label propagation scenario
#[derive(Clone, Debug)]
pub struct LabelPropagation {
    /// Labels of the connected contributor right after the change
    pub before_heartbeat: CategoryLabelSet,
    /// Labels of the connected contributor one heartbeat later
    pub after_heartbeat: CategoryLabelSet,
    /// Labels of a contributor that joined after the change
    pub late_joiner: CategoryLabelSet,
}

/// Rename the `good` column while one contributor is connected, then let a
/// second contributor join.
pub fn scenario_label_propagation(label: &str) -> RetroResult<LabelPropagation> {
    let mut sim = SessionSimulator::default();
    let m = sim.open_moderator("L1")?;
    let early = sim.add_contributor("Early");
    sim.join(early, "L1")?;

    sim.moderator_mut(m).update_label(Category::Good, label);
    sim.settle();
    let before_heartbeat = sim.contributor(early).labels().clone();

    let interval = sim.config().heartbeat_interval;
    sim.advance(interval);
    let after_heartbeat = sim.contributor(early).labels().clone();

    let late = sim.add_contributor("Late");
    sim.join(late, "L1")?;
    let late_joiner = sim.contributor(late).labels().clone();

    Ok(LabelPropagation {
        before_heartbeat,
        after_heartbeat,
        late_joiner,
    })
}

/// Outcome of the reconnect scenario
#[derive(Clone, Debug)]
pub struct ReconnectOutcome {
    pub connected_after_loss: bool,
    pub reconnect_scheduled: bool,
    pub connected_after_delay: bool,
    pub labels_after_reconnect: CategoryLabelSet,
    pub reconnects_scheduled: u64,
}

/// Sever a contributor's link, rename a column while it is away, and let
/// the fixed-delay reconnect bring it back.
pub fn scenario_reconnect(label: &str) -> RetroResult<ReconnectOutcome> {
    let mut sim = SessionSimulator::default();
    let m = sim.open_moderator("R1")?;
    let c = sim.add_contributor("Hans");
    sim.join(c, "R1")?;

    let Some(peer) = sim.contributor(c).identity().cloned() else {
        return Err(retro_core::RetroError::NotConnected);
    };
    sim.network().sever_peer(&peer);
    sim.settle();

    let connected_after_loss = sim.contributor(c).is_connected();
    let reconnect_scheduled = sim.contributor(c).reconnect_pending();

    sim.moderator_mut(m).update_label(Category::Good, label);
    let delay = sim.config().reconnect_delay;
    sim.advance(delay);

    Ok(ReconnectOutcome {
        connected_after_loss,
        reconnect_scheduled,
        connected_after_delay: sim.contributor(c).is_connected(),
        labels_after_reconnect: sim.contributor(c).labels().clone(),
        reconnects_scheduled: sim.contributor(c).stats().reconnects_scheduled,
    })
}

/// Run a session with the given config and simulate an abrupt, silent loss
/// of one contributor. Returns the roster sizes before and after `wait`.
pub fn scenario_silent_loss(config: SessionConfig, wait: Duration) -> RetroResult<(usize, usize)> {
    let mut sim = SessionSimulator::new(config);
    let m = sim.open_moderator("Q1")?;
    let alive = sim.add_contributor("Alive");
    let gone = sim.add_contributor("Gone");
    sim.join(alive, "Q1")?;
    sim.join(gone, "Q1")?;

    let before = sim.moderator(m).participants().len();
    if let Some(peer) = sim.contributor(gone).identity().cloned() {
        sim.network().set_silent(&peer, true);
    }
    sim.advance(wait);

    Ok((before, sim.moderator(m).participants().len()))
}

// ============================================================================
// TESTS
// ============================================================================
