use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;

use super::bitfield::Bitfield;
use super::peer_id::PeerId;

/// A remote peer record shared between its owning worker, the engine's
/// registries, and the shell's read-only renderers.
pub type SharedPeer = Arc<Mutex<RemotePeer>>;

/// One live connection side's view of a remote peer.
///
/// Both directions start choked and uninterested, per the protocol.
#[derive(Debug, Clone)]
pub struct RemotePeer {
    pub addr: SocketAddr,
    pub peer_id: PeerId,
    /// The peer's advertised pieces, updated by BITFIELD and HAVE.
    pub bitfield: Bitfield,
    /// We are choking them.
    pub am_choking: bool,
    /// We want a piece they hold.
    pub am_interested: bool,
    /// They are choking us.
    pub peer_choking: bool,
    /// They want a piece we hold.
    pub peer_interested: bool,
    /// Last observed transfer rate in bytes per second.
    pub rate: f64,
}

impl RemotePeer {
    pub fn new(addr: SocketAddr, peer_id: PeerId, piece_count: u32) -> Self {
        Self {
            addr,
            peer_id,
            bitfield: Bitfield::new(piece_count),
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
            rate: 0.0,
        }
    }

    pub fn shared(self) -> SharedPeer {
        Arc::new(Mutex::new(self))
    }
}
