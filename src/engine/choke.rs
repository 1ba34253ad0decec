//! The choke scheduler.
//!
//! Every 10 seconds the top three interested senders by upload rate are
//! unchoked; every third tick one interested choked sender is promoted to
//! the optimistic slot, displacing the previous occupant.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng as _;
use tracing::debug;

use super::{Engine, SenderCmd};
use crate::peer::PeerId;

/// Upper bound on simultaneously unchoked peers.
pub const RECIPROCATION_SLOTS: usize = 4;

/// Reciprocation slots filled by upload rate; the remaining slot is the
/// optimistic one.
pub const REGULAR_SLOTS: usize = 3;

const TICK: Duration = Duration::from_secs(10);
const OPTIMISTIC_EVERY: u32 = 3;

/// The unchoked set and the optimistic slot. The optimistic peer is always
/// a member of `unchoked`.
#[derive(Debug, Default)]
pub struct ChokeBook {
    pub unchoked: HashSet<PeerId>,
    pub optimistic: Option<PeerId>,
}

pub(crate) async fn run_scheduler(engine: Arc<Engine>) {
    let mut ticker = tokio::time::interval(TICK);
    ticker.tick().await; // first tick resolves immediately

    let mut ticks = 0u32;
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = engine.closing_notified() => return,
        }
        if engine.is_shutdown() {
            return;
        }

        ticks += 1;
        engine.regular_unchoke();
        if ticks % OPTIMISTIC_EVERY == 0 {
            engine.optimistic_unchoke();
        }
    }
}

impl Engine {
    /// Regular unchoke pass. With four or fewer senders there is nothing
    /// to ration and the proactive unchoke on INTERESTED already covers
    /// everyone.
    pub(crate) fn regular_unchoke(&self) {
        let senders = self.senders.read();
        if senders.len() <= RECIPROCATION_SLOTS {
            return;
        }

        let mut rated: Vec<(PeerId, f64)> = senders
            .iter()
            .filter_map(|(id, handle)| {
                let peer = handle.peer.lock();
                peer.peer_interested.then_some((*id, peer.rate))
            })
            .collect();
        rated.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        let top: HashSet<PeerId> = rated
            .iter()
            .take(REGULAR_SLOTS)
            .map(|(id, _)| *id)
            .collect();

        let mut book = self.choke.lock();

        for id in book.unchoked.clone() {
            if top.contains(&id) || book.optimistic == Some(id) {
                continue;
            }
            book.unchoked.remove(&id);
            if let Some(handle) = senders.get(&id) {
                handle.peer.lock().am_choking = true;
                let _ = handle.cmd.send(SenderCmd::Choke);
            }
        }

        for id in &top {
            if book.optimistic == Some(*id) {
                // Promoted on merit; the optimistic slot frees up.
                book.optimistic = None;
            }
            if book.unchoked.insert(*id) {
                if let Some(handle) = senders.get(id) {
                    handle.peer.lock().am_choking = false;
                    let _ = handle.cmd.send(SenderCmd::Unchoke);
                }
            }
        }

        debug!(unchoked = book.unchoked.len(), "regular unchoke pass");
    }

    /// Optimistic unchoke pass: one interested choked sender, chosen
    /// uniformly, displaces the previous optimistic peer.
    pub(crate) fn optimistic_unchoke(&self) {
        let senders = self.senders.read();
        if senders.len() <= RECIPROCATION_SLOTS {
            return;
        }

        let mut book = self.choke.lock();

        if let Some(prev) = book.optimistic.take() {
            book.unchoked.remove(&prev);
            if let Some(handle) = senders.get(&prev) {
                handle.peer.lock().am_choking = true;
                let _ = handle.cmd.send(SenderCmd::Choke);
            }
        }

        let candidates: Vec<PeerId> = senders
            .iter()
            .filter_map(|(id, handle)| {
                let peer = handle.peer.lock();
                (peer.peer_interested && !book.unchoked.contains(id)).then_some(*id)
            })
            .collect();

        if candidates.is_empty() {
            return;
        }

        let pick = candidates[rand::rng().random_range(0..candidates.len())];
        book.unchoked.insert(pick);
        book.optimistic = Some(pick);
        if let Some(handle) = senders.get(&pick) {
            handle.peer.lock().am_choking = false;
            let _ = handle.cmd.send(SenderCmd::Unchoke);
        }

        debug!(peer = %pick, "optimistic unchoke");
    }

    /// Proactive unchoke when an interested peer arrives while slots are
    /// free; the scheduler will promote or demote them on its next tick.
    pub(crate) fn proactive_unchoke(&self, id: PeerId) -> bool {
        let mut book = self.choke.lock();
        book.unchoked.len() < RECIPROCATION_SLOTS && book.unchoked.insert(id)
    }

    pub(crate) async fn closing_notified(&self) {
        self.closing.notified().await;
    }
}
