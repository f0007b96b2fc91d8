//! Selection logic of the two periodic unchoke policies.
//!
//! Both functions are pure over a snapshot of the peer's connections so the
//! policies can be tested without sockets; applying the outcome (flipping
//! `choked` flags and queueing the frames) happens under the peer lock.

use rand::{seq::SliceRandom, Rng};

use crate::PeerId;

/// The per-connection facts the policies rank neighbors by.
#[derive(Clone, Debug)]
pub(crate) struct NeighborSnapshot {
    pub peer_id: PeerId,
    /// The remote said it wants pieces from us.
    pub interested: bool,
    /// We are currently choking the remote.
    pub choked: bool,
    /// Pieces we received from the remote since the last ranked evaluation.
    pub pieces_received: u64,
}

/// The outcome of a ranked evaluation. The two sets are disjoint.
#[derive(Debug, Default, PartialEq)]
pub(crate) struct Reshuffle {
    pub to_choke: Vec<PeerId>,
    pub to_unchoke: Vec<PeerId>,
}

/// Picks up to `slots` neighbors to serve for the next interval.
///
/// A seed with free slots hands them to interested neighbors at random,
/// since nobody can contribute pieces to it. Otherwise the neighbors that
/// contributed the most pieces during the window win the slots. When there
/// are not enough contributors to rank, nothing changes.
pub(crate) fn pick_preferred(
    neighbors: &[NeighborSnapshot],
    slots: usize,
    is_seed: bool,
    rng: &mut impl Rng,
) -> Reshuffle {
    let unchoked: Vec<PeerId> = neighbors
        .iter()
        .filter(|n| !n.choked)
        .map(|n| n.peer_id)
        .collect();
    let mut interested: Vec<PeerId> = neighbors
        .iter()
        .filter(|n| n.interested)
        .map(|n| n.peer_id)
        .collect();
    let mut contributors: Vec<&NeighborSnapshot> = neighbors
        .iter()
        .filter(|n| n.pieces_received > 0)
        .collect();

    if is_seed && unchoked.len() < slots && interested.len() >= slots {
        interested.shuffle(rng);
        interested.truncate(slots);
        Reshuffle {
            to_choke: Vec::new(),
            to_unchoke: interested,
        }
    } else if contributors.len() >= slots {
        contributors.sort_by(|a, b| b.pieces_received.cmp(&a.pieces_received));
        let top: Vec<PeerId> = contributors[..slots].iter().map(|n| n.peer_id).collect();
        Reshuffle {
            to_choke: unchoked
                .iter()
                .copied()
                .filter(|id| !top.contains(id))
                .collect(),
            to_unchoke: top
                .iter()
                .copied()
                .filter(|id| !unchoked.contains(id))
                .collect(),
        }
    } else {
        Reshuffle::default()
    }
}

/// Picks the next optimistically unchoked neighbor: one uniformly random id
/// among the neighbors that are interested but currently choked. Returns
/// `None` when no neighbor qualifies.
pub(crate) fn pick_optimistic(
    neighbors: &[NeighborSnapshot],
    rng: &mut impl Rng,
) -> Option<PeerId> {
    let candidates: Vec<PeerId> = neighbors
        .iter()
        .filter(|n| n.interested && n.choked)
        .map(|n| n.peer_id)
        .collect();
    candidates.choose(rng).copied()
}
