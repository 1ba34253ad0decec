//! The peer wire protocol engine.
//!
//! Owns the global swarm state: local bitfield, per-piece rarity counters,
//! download progress, the requested-piece set, the unchoke book, and the
//! receiver/sender registries. Runs the rarest-first selector, the choke
//! scheduler, the peer updater, and the accept loop.
//!
//! Lock order, for any path that nests acquisitions:
//! **bitfield → rarity → receivers → senders → (any mutex)**, with the
//! choke book taken before individual peer records among the mutexes. No
//! lock is ever held across an `.await`.

mod choke;
mod receiver;
mod sender;
mod server;

pub use choke::{ChokeBook, RECIPROCATION_SLOTS, REGULAR_SLOTS};
pub use server::Listener;

#[cfg(test)]
mod tests;

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rand::Rng as _;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::metainfo::Metainfo;
use crate::peer::{Bitfield, PeerId, SharedPeer};
use crate::storage::{Store, StorageError};
use crate::tracker::Agent;

/// Rarity sentinel for pieces the local peer already holds.
const OWNED: u32 = u32::MAX;

/// Whether this client started with the complete file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Seeder,
    Leecher,
}

/// Command delivered to a receiver worker's task.
pub(crate) enum ReceiverCmd {
    /// The selector picked this piece for the worker; the target slot and
    /// `am_interested` are already recorded. Transmit INTERESTED.
    Download(u32),
}

/// Command delivered to a sender worker's task.
pub(crate) enum SenderCmd {
    Unchoke,
    Choke,
    Have(u32),
}

/// Registry entry for a live receiver (download half).
pub(crate) struct ReceiverHandle {
    pub peer: SharedPeer,
    /// Piece this receiver is pursuing, if any.
    pub target: Arc<Mutex<Option<u32>>>,
    pub cmd: UnboundedSender<ReceiverCmd>,
}

/// Registry entry for a live sender (upload half).
pub(crate) struct SenderHandle {
    pub peer: SharedPeer,
    pub cmd: UnboundedSender<SenderCmd>,
}

/// One row of the shell's `show` table.
#[derive(Debug, Clone)]
pub struct PeerRow {
    pub addr: SocketAddr,
    pub peer_id: PeerId,
    pub am_choking: bool,
    pub am_interested: bool,
    pub peer_choking: bool,
    pub peer_interested: bool,
    pub bitfield: String,
    pub down_rate: f64,
    pub up_rate: f64,
}

pub struct Engine {
    pub meta: Arc<Metainfo>,
    pub peer_id: PeerId,
    pub role: Role,
    pub(crate) store: Store,
    pub(crate) agent: Arc<Agent>,

    bitfield: RwLock<Bitfield>,
    rarity: RwLock<Vec<u32>>,
    progress: Mutex<Vec<u32>>,
    requested: Mutex<HashSet<u32>>,
    pub(crate) choke: Mutex<ChokeBook>,
    receivers: RwLock<HashMap<PeerId, ReceiverHandle>>,
    pub(crate) senders: RwLock<HashMap<PeerId, SenderHandle>>,
    known_addrs: Mutex<HashSet<SocketAddr>>,

    finished: AtomicBool,
    shutdown: AtomicBool,
    closing: Notify,
}

impl Engine {
    /// Builds the engine and maps the backing file. A client whose target
    /// file already exists seeds it; anyone else allocates the temporary
    /// sidecar and starts leeching.
    pub fn new(
        meta: Arc<Metainfo>,
        peer_id: PeerId,
        agent: Arc<Agent>,
    ) -> Result<Arc<Self>, StorageError> {
        let piece_count = meta.piece_count();

        let (role, store, bitfield, rarity, finished) = if meta.target_path().exists() {
            (
                Role::Seeder,
                Store::seed(meta.clone())?,
                Bitfield::full(piece_count),
                vec![OWNED; piece_count as usize],
                true,
            )
        } else {
            (
                Role::Leecher,
                Store::allocate(meta.clone())?,
                Bitfield::new(piece_count),
                vec![0; piece_count as usize],
                false,
            )
        };

        info!(?role, pieces = piece_count, "engine ready");

        Ok(Arc::new(Self {
            meta,
            peer_id,
            role,
            store,
            agent,
            bitfield: RwLock::new(bitfield),
            rarity: RwLock::new(rarity),
            progress: Mutex::new(vec![0; piece_count as usize]),
            requested: Mutex::new(HashSet::new()),
            choke: Mutex::new(ChokeBook::default()),
            receivers: RwLock::new(HashMap::new()),
            senders: RwLock::new(HashMap::new()),
            known_addrs: Mutex::new(HashSet::new()),
            finished: AtomicBool::new(finished),
            shutdown: AtomicBool::new(false),
            closing: Notify::new(),
        }))
    }

    /// Launches the background tasks: the accept loop, the choke
    /// scheduler, the tracker announce loop, and (for leechers) the peer
    /// updater.
    pub fn start(self: &Arc<Self>, listener: Listener) {
        let engine = self.clone();
        tokio::spawn(async move { engine.accept_loop(listener).await });

        let engine = self.clone();
        tokio::spawn(async move { choke::run_scheduler(engine).await });

        tokio::spawn(self.agent.clone().run());

        if self.role == Role::Leecher {
            let engine = self.clone();
            tokio::spawn(async move { engine.peer_updater().await });
        }
    }

    /// Cooperative teardown: flips the shutdown flag, wakes every waiting
    /// loop, drops worker command channels, discards an unfinished
    /// download, and tells the tracker we stopped.
    pub async fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        self.closing.notify_waiters();

        // Dropping the handles closes each worker's command channel; the
        // workers drain through their Closed state on their own.
        self.receivers.write().clear();
        self.senders.write().clear();

        self.store.discard();
        self.agent.stop().await;
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    // ---- background loops -------------------------------------------------

    async fn accept_loop(self: Arc<Self>, listener: Listener) {
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        debug!(%addr, "inbound connection");
                        let engine = self.clone();
                        tokio::spawn(async move { sender::run(engine, stream, addr).await });
                    }
                    Err(err) => {
                        warn!("accept failed: {err}");
                    }
                },
                _ = self.closing.notified() => return,
            }
        }
    }

    /// Reacts to tracker peer-list updates by spawning a receiver for
    /// every address we have not contacted yet.
    async fn peer_updater(self: Arc<Self>) {
        loop {
            self.connect_new_peers();

            tokio::select! {
                _ = self.agent.peers_changed() => {}
                _ = self.closing.notified() => return,
            }
            if self.is_shutdown() {
                return;
            }
        }
    }

    pub(crate) fn connect_new_peers(self: &Arc<Self>) {
        if self.role == Role::Seeder {
            return;
        }

        let local = self.agent.local_addr();
        for addr in self.agent.peers() {
            if addr == local {
                continue;
            }
            if !self.known_addrs.lock().insert(addr) {
                continue;
            }
            self.spawn_receiver(addr);
        }
    }

    pub(crate) fn spawn_receiver(self: &Arc<Self>, addr: SocketAddr) {
        let engine = self.clone();
        tokio::spawn(async move { receiver::run(engine, addr).await });
    }

    // ---- piece bookkeeping -------------------------------------------------

    /// Copy of the local bitfield.
    pub fn bitfield(&self) -> Bitfield {
        self.bitfield.read().clone()
    }

    pub fn bitfield_string(&self) -> String {
        self.bitfield.read().to_bit_string()
    }

    /// Raises rarity counters for every piece a freshly-received BITFIELD
    /// advertises, skipping pieces we already own.
    pub(crate) fn apply_peer_bitfield(&self, bf: &Bitfield) {
        let mut rarity = self.rarity.write();
        for (index, slot) in rarity.iter_mut().enumerate() {
            if *slot != OWNED && bf.has(index as u32) {
                *slot += 1;
            }
        }
    }

    /// Raises one rarity counter for a HAVE that set a previously-unset
    /// bit. HAVEs for bits already set change nothing.
    pub(crate) fn apply_peer_have(&self, index: u32) {
        let mut rarity = self.rarity.write();
        if let Some(slot) = rarity.get_mut(index as usize) {
            if *slot != OWNED {
                *slot += 1;
            }
        }
    }

    /// Atomically claims `index` for one receiver. Refuses pieces the
    /// local bitfield already has and pieces another receiver holds.
    pub(crate) fn claim_piece(&self, index: u32) -> bool {
        if self.bitfield.read().has(index) {
            return false;
        }
        self.requested.lock().insert(index)
    }

    pub(crate) fn release_piece(&self, index: u32) {
        self.requested.lock().remove(&index);
    }

    pub(crate) fn add_progress(&self, index: u32, len: u32) -> u32 {
        let mut progress = self.progress.lock();
        progress[index as usize] += len;
        progress[index as usize]
    }

    pub(crate) fn reset_progress(&self, index: u32) {
        self.progress.lock()[index as usize] = 0;
    }

    pub(crate) fn progress_of(&self, index: u32) -> u32 {
        self.progress.lock()[index as usize]
    }

    /// Records a verified piece: bitfield bit, rarity sentinel, release of
    /// the requested-piece claim, tracker credit, and a HAVE broadcast to
    /// every sender. Returns whether that was the final piece.
    pub(crate) fn mark_verified(&self, index: u32) -> bool {
        let complete = {
            let mut bitfield = self.bitfield.write();
            bitfield.set(index);
            self.rarity.write()[index as usize] = OWNED;
            bitfield.is_complete()
        };

        self.release_piece(index);
        self.agent.add_verified(self.meta.piece_len(index) as u64);

        for handle in self.senders.read().values() {
            let _ = handle.cmd.send(SenderCmd::Have(index));
        }

        if complete {
            self.finished.store(true, Ordering::SeqCst);
            info!("download complete");
        }
        complete
    }

    // ---- rarest-first selection --------------------------------------------

    /// Points one idle receiver at the rarest piece any peer advertises.
    ///
    /// Runs after a BITFIELD, after a completed piece, and after a
    /// receiver teardown. The rarity snapshot and the registry walk are
    /// deliberately not atomic; the selector is safe to re-run.
    pub(crate) fn rarest_first(&self) {
        if self.is_finished() || self.is_shutdown() {
            return;
        }

        let candidates: Vec<u32> = {
            let rarity = self.rarity.read();
            let min = rarity
                .iter()
                .filter(|&&count| count != 0 && count != OWNED)
                .min()
                .copied();

            match min {
                Some(min) => rarity
                    .iter()
                    .enumerate()
                    .filter(|(_, &count)| count == min)
                    .map(|(index, _)| index as u32)
                    .collect(),
                None => Vec::new(),
            }
        };

        if candidates.is_empty() {
            // Nothing any peer advertises. Completion itself is detected
            // on the verify path.
            return;
        }

        let pick = candidates[rand::rng().random_range(0..candidates.len())];

        let receivers = self.receivers.read();
        for handle in receivers.values() {
            let mut peer = handle.peer.lock();
            if peer.am_interested || !peer.bitfield.has(pick) {
                continue;
            }

            peer.am_interested = true;
            *handle.target.lock() = Some(pick);
            let _ = handle.cmd.send(ReceiverCmd::Download(pick));
            debug!(piece = pick, peer = %peer.peer_id, "rarest-first pick");
            return;
        }
    }

    // ---- registries --------------------------------------------------------

    pub(crate) fn register_receiver(&self, id: PeerId, handle: ReceiverHandle) {
        self.receivers.write().insert(id, handle);
    }

    pub(crate) fn register_sender(&self, id: PeerId, handle: SenderHandle) {
        self.senders.write().insert(id, handle);
    }

    /// Tears down a receiver's bookkeeping: rarity counters for the pieces
    /// it advertised, its registry entry, its claim, and its address, then
    /// re-runs the selector so the download keeps moving.
    pub(crate) fn receiver_gone(&self, id: PeerId, addr: SocketAddr, target: Option<u32>) {
        self.known_addrs.lock().remove(&addr);

        let handle = self.receivers.write().remove(&id);
        if self.is_shutdown() {
            return;
        }

        if let Some(handle) = handle {
            let advertised = handle.peer.lock().bitfield.clone();
            let mut rarity = self.rarity.write();
            for (index, slot) in rarity.iter_mut().enumerate() {
                if *slot != OWNED && *slot != 0 && advertised.has(index as u32) {
                    *slot -= 1;
                }
            }
        }

        if let Some(piece) = target {
            self.release_piece(piece);
        }

        self.rarest_first();
    }

    pub(crate) fn sender_gone(&self, id: PeerId) {
        self.senders.write().remove(&id);
        self.sender_unchoke_revoked(id);
    }

    /// Drops a peer from the unchoke book, e.g. on NOT_INTERESTED.
    pub(crate) fn sender_unchoke_revoked(&self, id: PeerId) {
        let mut book = self.choke.lock();
        book.unchoked.remove(&id);
        if book.optimistic == Some(id) {
            book.optimistic = None;
        }
    }

    /// Forgets an address whose connection attempt never produced a
    /// registered receiver, so a later tracker update can retry it.
    pub(crate) fn forget_addr(&self, addr: SocketAddr) {
        self.known_addrs.lock().remove(&addr);
    }

    // ---- read-only views for the shell -------------------------------------

    /// Per-peer table rows, joining download and upload halves by peer id.
    pub fn peer_rows(&self) -> Vec<PeerRow> {
        let receivers = self.receivers.read();
        let senders = self.senders.read();

        let mut rows = Vec::new();

        for (id, handle) in receivers.iter() {
            let down = handle.peer.lock().clone();
            let up = senders.get(id).map(|h| h.peer.lock().clone());

            rows.push(PeerRow {
                addr: down.addr,
                peer_id: *id,
                am_choking: up.as_ref().map_or(true, |p| p.am_choking),
                am_interested: down.am_interested,
                peer_choking: down.peer_choking,
                peer_interested: up.as_ref().is_some_and(|p| p.peer_interested),
                bitfield: down.bitfield.to_bit_string(),
                down_rate: down.rate,
                up_rate: up.map_or(0.0, |p| p.rate),
            });
        }

        for (id, handle) in senders.iter() {
            if receivers.contains_key(id) {
                continue;
            }
            let up = handle.peer.lock().clone();

            rows.push(PeerRow {
                addr: up.addr,
                peer_id: *id,
                am_choking: up.am_choking,
                am_interested: false,
                peer_choking: true,
                peer_interested: up.peer_interested,
                bitfield: up.bitfield.to_bit_string(),
                down_rate: 0.0,
                up_rate: up.rate,
            });
        }

        rows
    }
}
