use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use sha1::{Digest, Sha1};
use tokio::sync::mpsc::{self, UnboundedReceiver};

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use super::*;
use crate::peer::{Handshake, Message, RemotePeer};
use crate::tracker::Agent;

fn meta_for(dir: &std::path::Path, content: &[u8], piece_length: u32) -> Arc<Metainfo> {
    let piece_hashes: Vec<[u8; 20]> = content
        .chunks(piece_length as usize)
        .map(|chunk| Sha1::digest(chunk).into())
        .collect();

    let file_size = content.len() as u64;
    let last_piece_length = match (file_size % piece_length as u64) as u32 {
        0 => piece_length,
        rem => rem,
    };

    Arc::new(Metainfo {
        announce: "http://127.0.0.1:9/announce".into(),
        info_hash: [0xAAu8; 20],
        name: dir.join("payload.bin").to_str().unwrap().to_string(),
        piece_length,
        last_piece_length,
        piece_hashes,
        file_size,
        source: PathBuf::from("payload.torrent"),
    })
}

fn leecher_engine(dir: &std::path::Path, content: &[u8], piece_length: u32) -> Arc<Engine> {
    let meta = meta_for(dir, content, piece_length);
    let agent = Arc::new(Agent::new(meta.clone(), PeerId::generate(), 6881).unwrap());
    Engine::new(meta, PeerId::generate(), agent).unwrap()
}

fn addr(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

fn fake_receiver(
    engine: &Engine,
    port: u16,
) -> (PeerId, SharedPeer, Arc<Mutex<Option<u32>>>, UnboundedReceiver<ReceiverCmd>) {
    let id = PeerId::generate();
    let peer = RemotePeer::new(addr(port), id, engine.meta.piece_count()).shared();
    let target = Arc::new(Mutex::new(None));
    let (tx, rx) = mpsc::unbounded_channel();

    engine.register_receiver(
        id,
        ReceiverHandle {
            peer: peer.clone(),
            target: target.clone(),
            cmd: tx,
        },
    );
    (id, peer, target, rx)
}

fn fake_sender(
    engine: &Engine,
    port: u16,
    rate: f64,
    interested: bool,
) -> (PeerId, SharedPeer, UnboundedReceiver<SenderCmd>) {
    let id = PeerId::generate();
    let peer = RemotePeer::new(addr(port), id, engine.meta.piece_count()).shared();
    {
        let mut record = peer.lock();
        record.rate = rate;
        record.peer_interested = interested;
    }
    let (tx, rx) = mpsc::unbounded_channel();

    engine.register_sender(
        id,
        SenderHandle {
            peer: peer.clone(),
            cmd: tx,
        },
    );
    (id, peer, rx)
}

#[test]
fn bitfield_raises_rarity_and_teardown_lowers_it() {
    let dir = tempfile::tempdir().unwrap();
    let engine = leecher_engine(dir.path(), &[1u8; 65536], 16384); // 4 pieces

    let (id, peer, target, _rx) = fake_receiver(&engine, 7001);
    {
        let mut record = peer.lock();
        record.bitfield.set(2);
        record.bitfield.set(3);
    }
    let advertised = peer.lock().bitfield.clone();
    engine.apply_peer_bitfield(&advertised);

    engine.apply_peer_have(1);

    // Counters: piece 1 via HAVE, pieces 2 and 3 via the bitfield.
    assert_eq!(*engine.rarity.read(), vec![0, 1, 1, 1]);

    engine.receiver_gone(id, addr(7001), *target.lock());
    // The HAVE was recorded against a different record, so only the
    // advertised pieces drop back.
    assert_eq!(*engine.rarity.read(), vec![0, 1, 0, 0]);
}

#[test]
fn verified_pieces_become_owned_and_broadcast() {
    let dir = tempfile::tempdir().unwrap();
    let engine = leecher_engine(dir.path(), &[1u8; 40000], 16384); // 3 pieces

    let (_id, _peer, mut sender_rx) = fake_sender(&engine, 7002, 0.0, false);

    assert!(engine.claim_piece(1));
    let complete = engine.mark_verified(1);

    assert!(!complete);
    assert!(engine.bitfield().has(1));
    assert_eq!(engine.rarity.read()[1], OWNED);
    assert_eq!(engine.agent.downloaded(), 16384);

    // The claim is released and the piece can never be claimed again.
    assert!(!engine.requested.lock().contains(&1));
    assert!(!engine.claim_piece(1));

    assert!(matches!(sender_rx.try_recv(), Ok(SenderCmd::Have(1))));
}

#[test]
fn requested_set_admits_one_receiver_per_piece() {
    let dir = tempfile::tempdir().unwrap();
    let engine = leecher_engine(dir.path(), &[1u8; 65536], 16384);

    // First receiver claims piece 3; the second must back off.
    assert!(engine.claim_piece(3));
    assert!(!engine.claim_piece(3));

    engine.release_piece(3);
    assert!(engine.claim_piece(3));
}

#[test]
fn rarest_first_targets_an_idle_receiver_holding_the_piece() {
    let dir = tempfile::tempdir().unwrap();
    let engine = leecher_engine(dir.path(), &[1u8; 65536], 16384); // 4 pieces

    // Receiver A holds pieces 0 and 2; two peers hold piece 0, one
    // holds piece 2, so piece 2 is the rarest.
    let (_a, peer_a, target_a, mut rx_a) = fake_receiver(&engine, 7003);
    {
        let mut record = peer_a.lock();
        record.bitfield.set(0);
        record.bitfield.set(2);
    }
    let advertised = peer_a.lock().bitfield.clone();
    engine.apply_peer_bitfield(&advertised);
    engine.apply_peer_have(0);

    engine.rarest_first();

    assert_eq!(*target_a.lock(), Some(2));
    assert!(peer_a.lock().am_interested);
    assert!(matches!(rx_a.try_recv(), Ok(ReceiverCmd::Download(2))));

    // Re-running selects nobody: the only receiver is already interested.
    engine.rarest_first();
    assert!(rx_a.try_recv().is_err());
}

#[test]
fn choke_scheduler_keeps_top_three_plus_optimistic() {
    let dir = tempfile::tempdir().unwrap();
    let engine = leecher_engine(dir.path(), &[1u8; 65536], 16384);

    let rates = [10.0, 9.0, 8.0, 7.0, 6.0];
    let mut rxs = Vec::new();
    let mut ids = Vec::new();
    for (i, rate) in rates.iter().enumerate() {
        let (id, _peer, rx) = fake_sender(&engine, 7100 + i as u16, *rate, true);
        ids.push(id);
        rxs.push(rx);
    }

    engine.regular_unchoke();

    {
        let book = engine.choke.lock();
        assert_eq!(book.unchoked.len(), REGULAR_SLOTS);
        for id in &ids[..3] {
            assert!(book.unchoked.contains(id), "top-rate peer must be unchoked");
        }
    }
    for rx in rxs.iter_mut().take(3) {
        assert!(matches!(rx.try_recv(), Ok(SenderCmd::Unchoke)));
    }

    engine.optimistic_unchoke();

    {
        let book = engine.choke.lock();
        assert_eq!(book.unchoked.len(), RECIPROCATION_SLOTS);
        let optimistic = book.optimistic.expect("an optimistic peer is chosen");
        assert!(
            optimistic == ids[3] || optimistic == ids[4],
            "optimistic slot comes from the choked remainder"
        );
    }

    // The next regular pass reshuffles nothing while rates hold.
    engine.regular_unchoke();
    assert_eq!(engine.choke.lock().unchoked.len(), RECIPROCATION_SLOTS);
}

#[test]
fn few_senders_mean_no_scheduling() {
    let dir = tempfile::tempdir().unwrap();
    let engine = leecher_engine(dir.path(), &[1u8; 65536], 16384);

    for i in 0..4 {
        fake_sender(&engine, 7200 + i, 5.0, true);
    }
    engine.regular_unchoke();
    assert!(engine.choke.lock().unchoked.is_empty());
}

#[test]
fn proactive_unchoke_respects_the_slot_cap() {
    let dir = tempfile::tempdir().unwrap();
    let engine = leecher_engine(dir.path(), &[1u8; 65536], 16384);

    let ids: Vec<PeerId> = (0..5).map(|_| PeerId::generate()).collect();
    for id in &ids[..4] {
        assert!(engine.proactive_unchoke(*id));
    }
    assert!(!engine.proactive_unchoke(ids[4]));
    assert_eq!(engine.choke.lock().unchoked.len(), RECIPROCATION_SLOTS);
}

/// Polls `cond` until it holds or a generous deadline passes.
async fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

/// Plays the remote end of a receiver's handshake on an accepted socket.
async fn handshake_as_remote(socket: &mut TcpStream, peer_id: [u8; 20]) {
    let mut incoming = [0u8; 67];
    socket.read_exact(&mut incoming).await.unwrap();
    let reply = Handshake::new([0xAAu8; 20], peer_id).encode();
    socket.write_all(&reply).await.unwrap();
}

/// Reads one complete framed message off the socket.
async fn read_frame(socket: &mut TcpStream) -> Message {
    let mut prefix = [0u8; 4];
    socket.read_exact(&mut prefix).await.unwrap();

    let mut frame = prefix.to_vec();
    frame.resize(4 + u32::from_be_bytes(prefix) as usize, 0);
    socket.read_exact(&mut frame[4..]).await.unwrap();

    Message::decode(Bytes::from(frame)).unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn choke_clears_the_target_and_releases_the_claim() {
    let dir = tempfile::tempdir().unwrap();
    let engine = leecher_engine(dir.path(), &[7u8; 20000], 16384); // 2 pieces
    let remote_id = *b"-UR1010-remotepeer01";

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    engine.spawn_receiver(listener.local_addr().unwrap());
    let (mut socket, _) = listener.accept().await.unwrap();
    handshake_as_remote(&mut socket, remote_id).await;

    // Advertise both pieces; the selector assigns one and the worker
    // claims it on UNCHOKE.
    let bits = Message::Bitfield(Bytes::from_static(&[0xC0])).encode();
    socket.write_all(&bits).await.unwrap();
    assert!(matches!(read_frame(&mut socket).await, Message::Interested));

    socket.write_all(&Message::Unchoke.encode()).await.unwrap();
    let Message::Request { index, begin, .. } = read_frame(&mut socket).await else {
        panic!("expected a block request after UNCHOKE");
    };
    assert_eq!(begin, 0);
    assert!(engine.requested.lock().contains(&index));

    socket.write_all(&Message::Choke.encode()).await.unwrap();

    // The choke must drop both the claim and the shared target slot.
    let id = PeerId::from_bytes(remote_id);
    let cleared = wait_for(|| {
        engine
            .receivers
            .read()
            .get(&id)
            .is_some_and(|handle| handle.target.lock().is_none())
    })
    .await;
    assert!(cleared, "choke left the receiver's target assigned");
    assert!(engine.requested.lock().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn teardown_after_choke_leaves_other_claims_alone() {
    let dir = tempfile::tempdir().unwrap();
    let engine = leecher_engine(dir.path(), &[9u8; 20000], 16384);
    let remote_id = *b"-UR1010-remotepeer02";

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    engine.spawn_receiver(listener.local_addr().unwrap());
    let (mut socket, _) = listener.accept().await.unwrap();
    handshake_as_remote(&mut socket, remote_id).await;

    let bits = Message::Bitfield(Bytes::from_static(&[0xC0])).encode();
    socket.write_all(&bits).await.unwrap();
    assert!(matches!(read_frame(&mut socket).await, Message::Interested));

    socket.write_all(&Message::Unchoke.encode()).await.unwrap();
    let Message::Request { index, .. } = read_frame(&mut socket).await else {
        panic!("expected a block request after UNCHOKE");
    };

    socket.write_all(&Message::Choke.encode()).await.unwrap();

    let id = PeerId::from_bytes(remote_id);
    let cleared = wait_for(|| {
        engine
            .receivers
            .read()
            .get(&id)
            .is_some_and(|handle| handle.target.lock().is_none())
    })
    .await;
    assert!(cleared);

    // Another receiver legitimately picks up the piece the choke freed.
    assert!(engine.claim_piece(index));

    // The choked connection dies without ever being unchoked again; its
    // teardown must not strip the new owner's claim.
    drop(socket);
    assert!(wait_for(|| engine.receivers.read().is_empty()).await);
    assert!(engine.requested.lock().contains(&index));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn single_piece_transfer_between_seeder_and_leecher() {
    let seeder_dir = tempfile::tempdir().unwrap();
    let leecher_dir = tempfile::tempdir().unwrap();
    let content: Vec<u8> = (0..16384u32).map(|i| (i.wrapping_mul(31) % 251) as u8).collect();

    // Seeder: target file already on disk.
    let seeder_meta = meta_for(seeder_dir.path(), &content, 16384);
    std::fs::write(seeder_meta.target_path(), &content).unwrap();
    let seeder_agent = Arc::new(Agent::new(seeder_meta.clone(), PeerId::generate(), 0).unwrap());
    let seeder = Engine::new(seeder_meta, PeerId::generate(), seeder_agent).unwrap();
    assert_eq!(seeder.role, Role::Seeder);

    let listener = Listener::bind(0).unwrap();
    let port = listener.port().unwrap();
    seeder.start(listener);

    // Leecher: empty start, same torrent identity.
    let leecher_meta = meta_for(leecher_dir.path(), &content, 16384);
    let leecher_agent = Arc::new(Agent::new(leecher_meta.clone(), PeerId::generate(), 0).unwrap());
    let leecher = Engine::new(leecher_meta.clone(), PeerId::generate(), leecher_agent).unwrap();
    assert_eq!(leecher.role, Role::Leecher);

    leecher.spawn_receiver(addr(port));

    // HANDSHAKE -> BITFIELD 0x80 -> INTERESTED -> UNCHOKE ->
    // REQUEST(0,0,16384) -> PIECE -> verify -> HAVE/NOT_INTERESTED ->
    // rename.
    let deadline = Instant::now() + Duration::from_secs(10);
    while !leecher_meta.target_path().exists() && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    assert!(leecher.is_finished(), "download did not finish in time");
    assert_eq!(std::fs::read(leecher_meta.target_path()).unwrap(), content);
    assert!(!leecher_meta.tmp_path().exists());
    assert_eq!(leecher.bitfield_string(), "1");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn two_piece_transfer_with_short_last_piece() {
    let seeder_dir = tempfile::tempdir().unwrap();
    let leecher_dir = tempfile::tempdir().unwrap();
    let content: Vec<u8> = (0..20000u32).map(|i| (i % 249) as u8).collect();

    let seeder_meta = meta_for(seeder_dir.path(), &content, 16384);
    std::fs::write(seeder_meta.target_path(), &content).unwrap();
    let seeder_agent = Arc::new(Agent::new(seeder_meta.clone(), PeerId::generate(), 0).unwrap());
    let seeder = Engine::new(seeder_meta, PeerId::generate(), seeder_agent).unwrap();

    let listener = Listener::bind(0).unwrap();
    let port = listener.port().unwrap();
    seeder.start(listener);

    let leecher_meta = meta_for(leecher_dir.path(), &content, 16384);
    let leecher_agent = Arc::new(Agent::new(leecher_meta.clone(), PeerId::generate(), 0).unwrap());
    let leecher = Engine::new(leecher_meta.clone(), PeerId::generate(), leecher_agent).unwrap();

    leecher.spawn_receiver(addr(port));

    let deadline = Instant::now() + Duration::from_secs(10);
    while !leecher_meta.target_path().exists() && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    // The 3616-byte tail piece completes after a single short block.
    assert_eq!(std::fs::read(leecher_meta.target_path()).unwrap(), content);
    assert_eq!(leecher.bitfield_string(), "11");
    assert_eq!(leecher.agent.downloaded(), 20000);
}
