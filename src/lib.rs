//! urtorrent - a BitTorrent-compatible peer-to-peer file transfer client
//!
//! The crate is organized around the peer wire protocol engine:
//!
//! - [`bencode`] - bencode decoding for metainfo files and tracker replies
//! - [`metainfo`] - `.torrent` parsing and torrent geometry
//! - [`peer`] - handshake, message framing, bitfields, peer records
//! - [`tracker`] - HTTP announce agent and its periodic loop
//! - [`storage`] - the memory-mapped backing file
//! - [`engine`] - swarm state, rarest-first selection, choke scheduling,
//!   and the per-peer download/upload workers
//! - [`timer`] - cancellable one-shot countdown
//! - [`cli`] - the interactive command shell

pub mod bencode;
pub mod cli;
pub mod engine;
pub mod metainfo;
pub mod peer;
pub mod storage;
pub mod timer;
pub mod tracker;

pub use bencode::{decode, BencodeError, Value};
pub use engine::{Engine, Listener, Role};
pub use metainfo::{Metainfo, MetainfoError};
pub use peer::{Bitfield, Handshake, Message, PeerError, PeerId, RemotePeer};
pub use storage::{StorageError, Store};
pub use tracker::{Agent, AnnounceResponse, TrackerError, TrackerEvent};
