use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// Lifecycle event attached to an announce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerEvent {
    None,
    Started,
    Completed,
    Stopped,
}

impl TrackerEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackerEvent::None => "",
            TrackerEvent::Started => "started",
            TrackerEvent::Completed => "completed",
            TrackerEvent::Stopped => "stopped",
        }
    }
}

/// A parsed announce response.
#[derive(Debug, Clone)]
pub struct AnnounceResponse {
    /// Seconds until the next announce.
    pub interval: u32,
    pub min_interval: Option<u32>,
    /// Seeder count.
    pub complete: Option<u32>,
    /// Leecher count.
    pub incomplete: Option<u32>,
    pub warning_message: Option<String>,
    /// Echoed back in subsequent announces when present.
    pub tracker_id: Option<String>,
    pub peers: Vec<SocketAddr>,
}

impl AnnounceResponse {
    pub fn new(interval: u32) -> Self {
        Self {
            interval,
            min_interval: None,
            complete: None,
            incomplete: None,
            warning_message: None,
            tracker_id: None,
            peers: Vec::new(),
        }
    }
}

/// Parses a compact peer list: 6 bytes per peer, 4 IPv4 octets followed by
/// a big-endian port. Trailing partial entries are dropped.
pub fn parse_compact_peers(data: &[u8]) -> Vec<SocketAddr> {
    data.chunks_exact(6)
        .map(|chunk| {
            let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
            SocketAddr::new(IpAddr::V4(ip), port)
        })
        .collect()
}
