use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use reqwest::Client;
use tokio::sync::Notify;
use tracing::{debug, warn};

use super::error::TrackerError;
use super::response::{parse_compact_peers, AnnounceResponse, TrackerEvent};
use crate::bencode::decode;
use crate::metainfo::Metainfo;
use crate::peer::PeerId;
use crate::timer::Countdown;

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Floor applied to tracker intervals; also the retry pace after a failed
/// periodic announce.
const MIN_ANNOUNCE_INTERVAL: Duration = Duration::from_secs(30);

/// Transfer totals reported to the tracker. `downloaded` counts verified
/// piece bytes only, so it never needs to move backwards.
#[derive(Debug, Clone, Copy, Default)]
pub struct Stats {
    pub uploaded: u64,
    pub downloaded: u64,
}

/// The tracker agent: identity, accumulated transfer stats, the last
/// announce response, and the periodic announce loop.
pub struct Agent {
    client: Client,
    meta: Arc<Metainfo>,
    peer_id: PeerId,
    port: u16,
    local_ip: IpAddr,
    stats: Mutex<Stats>,
    last: Mutex<Option<AnnounceResponse>>,
    tracker_id: Mutex<Option<String>>,
    peers_changed: Notify,
    countdown: Countdown,
    stopping: AtomicBool,
    completed_sent: AtomicBool,
}

impl Agent {
    /// Builds the agent and probes the local address. Does not announce.
    pub fn new(meta: Arc<Metainfo>, peer_id: PeerId, port: u16) -> Result<Self, TrackerError> {
        if !meta.announce.starts_with("http://") && !meta.announce.starts_with("https://") {
            return Err(TrackerError::InvalidUrl(meta.announce.clone()));
        }

        let client = Client::builder().timeout(HTTP_TIMEOUT).build()?;
        let local_ip = probe_local_ip().ok_or(TrackerError::LocalAddress)?;

        Ok(Self {
            client,
            meta,
            peer_id,
            port,
            local_ip,
            stats: Mutex::new(Stats::default()),
            last: Mutex::new(None),
            tracker_id: Mutex::new(None),
            peers_changed: Notify::new(),
            countdown: Countdown::new(),
            stopping: AtomicBool::new(false),
            completed_sent: AtomicBool::new(false),
        })
    }

    /// First announce, carrying `event=started`. A failure here is fatal to
    /// the client.
    pub async fn start(&self) -> Result<AnnounceResponse, TrackerError> {
        self.announce(TrackerEvent::Started).await
    }

    /// The periodic announce loop. Re-announces at the pace the tracker
    /// chose until [`stop`](Agent::stop) cancels the pending countdown.
    pub async fn run(self: Arc<Self>) {
        loop {
            let expired = self.countdown.wait(self.interval()).await;
            if !expired || self.stopping.load(Ordering::SeqCst) {
                return;
            }

            if let Err(err) = self.announce(TrackerEvent::None).await {
                warn!("periodic announce failed: {err}");
            }
        }
    }

    /// Fires the one-shot `completed` event. Announce errors at this point
    /// only cost the tracker a statistic, so they are logged and dropped.
    pub async fn completed(&self) {
        if self.completed_sent.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(err) = self.announce(TrackerEvent::Completed).await {
            warn!("completed announce failed: {err}");
        }
    }

    /// Fires the one-shot `stopped` event and wakes the announce loop so it
    /// exits instead of sleeping out its interval.
    pub async fn stop(&self) {
        if self.stopping.swap(true, Ordering::SeqCst) {
            return;
        }
        self.countdown.cancel();
        self.peers_changed.notify_waiters();

        if let Err(err) = self.announce(TrackerEvent::Stopped).await {
            warn!("stopped announce failed: {err}");
        }
    }

    /// Manual announce for the shell's `announce` command.
    pub async fn announce_now(&self) -> Result<AnnounceResponse, TrackerError> {
        self.announce(TrackerEvent::None).await
    }

    async fn announce(&self, event: TrackerEvent) -> Result<AnnounceResponse, TrackerError> {
        let url = self.compose_url(event);
        debug!(%url, "announcing");

        let body = self.client.get(&url).send().await?.bytes().await?;
        let response = parse_announce(&body)?;

        if let Some(warning) = &response.warning_message {
            warn!("tracker warning: {warning}");
        }
        if let Some(id) = &response.tracker_id {
            *self.tracker_id.lock() = Some(id.clone());
        }

        *self.last.lock() = Some(response.clone());
        self.peers_changed.notify_waiters();
        Ok(response)
    }

    pub(super) fn compose_url(&self, event: TrackerEvent) -> String {
        let mut url = format!(
            "{}?info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact=1",
            self.meta.announce,
            url_encode(&self.meta.info_hash),
            url_encode(self.peer_id.as_bytes()),
            self.port,
            self.uploaded(),
            self.downloaded(),
            self.left(),
        );

        if let Some(id) = &*self.tracker_id.lock() {
            url.push_str("&trackerid=");
            url.push_str(&url_encode(id.as_bytes()));
        }

        let event = event.as_str();
        if !event.is_empty() {
            url.push_str("&event=");
            url.push_str(event);
        }
        url
    }

    /// Seconds until the next periodic announce: the smaller of `interval`
    /// and `min interval`, floored at 30 seconds. Used as the retry pace
    /// before any response has arrived.
    pub fn interval(&self) -> Duration {
        let secs = self
            .last
            .lock()
            .as_ref()
            .map(|resp| resp.min_interval.map_or(resp.interval, |m| resp.interval.min(m)))
            .unwrap_or(0);

        MIN_ANNOUNCE_INTERVAL.max(Duration::from_secs(secs as u64))
    }

    /// Peer list from the most recent announce.
    pub fn peers(&self) -> Vec<SocketAddr> {
        self.last
            .lock()
            .as_ref()
            .map(|resp| resp.peers.clone())
            .unwrap_or_default()
    }

    /// The most recent announce response, for the shell's `trackerinfo`.
    pub fn last_response(&self) -> Option<AnnounceResponse> {
        self.last.lock().clone()
    }

    /// Our own address as it appears in the tracker's peer list.
    pub fn local_addr(&self) -> SocketAddr {
        SocketAddr::new(self.local_ip, self.port)
    }

    /// Blocks until the next announce refreshes the peer list.
    pub async fn peers_changed(&self) {
        self.peers_changed.notified().await;
    }

    pub fn add_uploaded(&self, bytes: u64) {
        self.stats.lock().uploaded += bytes;
    }

    /// Credits a verified piece. Unverified block traffic is never counted,
    /// so hash failures need no compensation.
    pub fn add_verified(&self, bytes: u64) {
        self.stats.lock().downloaded += bytes;
    }

    pub fn uploaded(&self) -> u64 {
        self.stats.lock().uploaded
    }

    pub fn downloaded(&self) -> u64 {
        self.stats.lock().downloaded
    }

    /// Bytes still missing: zero once the target file exists on disk.
    pub fn left(&self) -> u64 {
        if self.meta.target_path().exists() {
            return 0;
        }
        self.meta.file_size.saturating_sub(self.downloaded())
    }
}

pub(super) fn parse_announce(body: &[u8]) -> Result<AnnounceResponse, TrackerError> {
    let value = decode(body)?;
    let dict = value
        .as_dict()
        .ok_or(TrackerError::InvalidResponse("expected dict"))?;

    if let Some(reason) = dict
        .get(b"failure reason".as_slice())
        .and_then(|v| v.as_str())
    {
        return Err(TrackerError::Failure(reason.to_string()));
    }

    let interval = dict
        .get(b"interval".as_slice())
        .and_then(|v| v.as_integer())
        .ok_or(TrackerError::InvalidResponse("missing interval"))? as u32;

    let mut response = AnnounceResponse::new(interval);

    response.min_interval = dict
        .get(b"min interval".as_slice())
        .and_then(|v| v.as_integer())
        .map(|v| v as u32);

    response.complete = dict
        .get(b"complete".as_slice())
        .and_then(|v| v.as_integer())
        .map(|v| v as u32);

    response.incomplete = dict
        .get(b"incomplete".as_slice())
        .and_then(|v| v.as_integer())
        .map(|v| v as u32);

    response.warning_message = dict
        .get(b"warning message".as_slice())
        .and_then(|v| v.as_str())
        .map(String::from);

    response.tracker_id = dict
        .get(b"tracker id".as_slice())
        .and_then(|v| v.as_str())
        .map(String::from);

    if let Some(peers) = dict.get(b"peers".as_slice()).and_then(|v| v.as_bytes()) {
        response.peers = parse_compact_peers(peers);
    }

    Ok(response)
}

/// Percent-escapes everything outside the URL-unreserved set.
pub(super) fn url_encode(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|&b| {
            if b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b'~') {
                (b as char).to_string()
            } else {
                format!("%{:02X}", b)
            }
        })
        .collect()
}

/// Finds the local interface address by opening a routed UDP socket; no
/// packets are sent. Hosts with no default route fall back to loopback.
fn probe_local_ip() -> Option<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    ["8.8.8.8:80", "127.0.0.1:80"]
        .iter()
        .find_map(|remote| {
            socket.connect(remote).ok()?;
            socket.local_addr().ok()
        })
        .map(|addr| addr.ip())
}
