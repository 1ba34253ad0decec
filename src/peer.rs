//! Peer wire protocol types.
//!
//! The handshake preamble, the framed message set (ids 0-7 plus
//! keep-alive), piece bitfields, peer identity, the per-connection
//! [`RemotePeer`] record, and the framed TCP transport.

mod bitfield;
mod error;
mod message;
mod peer_id;
mod record;
mod transport;

pub use bitfield::Bitfield;
pub use error::PeerError;
pub use message::{Handshake, Message, MessageId, HANDSHAKE_LEN, PROTOCOL_TAG};
pub use peer_id::PeerId;
pub use record::{RemotePeer, SharedPeer};
pub use transport::{Wire, WireReader, WireWriter, KEEPALIVE_WINDOW};

#[cfg(test)]
mod tests;
