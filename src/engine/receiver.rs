//! Per-peer download worker.
//!
//! One task per remote peer the tracker told us about. Connects, swaps
//! handshakes, registers into the receiver registry, then drives the
//! download: reacting to the selector's piece assignments, requesting one
//! block at a time, verifying finished pieces, and keeping the link alive.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tracing::{debug, warn};

use super::{Engine, ReceiverCmd, ReceiverHandle};
use crate::peer::{
    Bitfield, Handshake, Message, PeerError, PeerId, RemotePeer, SharedPeer, Wire, WireReader,
    WireWriter,
};

enum State {
    Connecting,
    Handshaking(Wire),
    Active(Session),
    Closed,
}

/// Everything an active connection needs after registration.
struct Session {
    reader: WireReader,
    writer: WireWriter,
    cmd_rx: UnboundedReceiver<ReceiverCmd>,
    peer: SharedPeer,
    target: Arc<Mutex<Option<u32>>>,
}

pub(crate) async fn run(engine: Arc<Engine>, addr: SocketAddr) {
    let mut worker = Worker {
        engine: engine.clone(),
        addr,
        registered: None,
        claimed: None,
        idle: false,
        request_started: None,
    };

    match worker.drive().await {
        Ok(()) => debug!(%addr, "receiver closed"),
        Err(err) if err.is_silent() => {}
        Err(PeerError::Io(err)) if worker.registered.is_none() => {
            warn!("connection fail: cannot connect to peer {addr}: {err}");
        }
        Err(err) => warn!(%addr, "receiver failed: {err}"),
    }

    match worker.registered {
        Some((id, target)) => engine.receiver_gone(id, addr, *target.lock()),
        None => engine.forget_addr(addr),
    }
}

struct Worker {
    engine: Arc<Engine>,
    addr: SocketAddr,
    /// Set once registered: registry key and the shared target slot.
    registered: Option<(PeerId, Arc<Mutex<Option<u32>>>)>,
    /// Piece we hold the requested-set claim for.
    claimed: Option<u32>,
    /// A keep-alive went out and no message has arrived since.
    idle: bool,
    /// When the in-flight block request was sent, for the rate estimate.
    request_started: Option<Instant>,
}

impl Worker {
    async fn drive(&mut self) -> Result<(), PeerError> {
        let mut state = State::Connecting;

        loop {
            state = match state {
                State::Connecting => {
                    let stream = TcpStream::connect(self.addr).await?;
                    State::Handshaking(Wire::new(stream))
                }

                State::Handshaking(mut wire) => {
                    wire.send_handshake(&Handshake::new(
                        self.engine.meta.info_hash,
                        *self.engine.peer_id.as_bytes(),
                    ))
                    .await?;

                    let reply = wire.recv_handshake().await?;
                    if reply.info_hash != self.engine.meta.info_hash {
                        return Err(PeerError::InfoHashMismatch);
                    }

                    let peer_id = PeerId::from_bytes(reply.peer_id);
                    let peer = RemotePeer::new(self.addr, peer_id, self.engine.meta.piece_count())
                        .shared();
                    let target = Arc::new(Mutex::new(None));
                    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();

                    self.engine.register_receiver(
                        peer_id,
                        ReceiverHandle {
                            peer: peer.clone(),
                            target: target.clone(),
                            cmd: cmd_tx,
                        },
                    );
                    self.registered = Some((peer_id, target.clone()));

                    let (reader, writer) = wire.split();
                    State::Active(Session {
                        reader,
                        writer,
                        cmd_rx,
                        peer,
                        target,
                    })
                }

                State::Active(session) => {
                    self.exchange(session).await?;
                    State::Closed
                }

                State::Closed => return Ok(()),
            };
        }
    }

    /// The ACTIVE message loop. Returns cleanly on engine shutdown or when
    /// the final piece has been verified.
    async fn exchange(&mut self, mut session: Session) -> Result<(), PeerError> {
        enum Event {
            Cmd(Option<ReceiverCmd>),
            Msg(Result<Message, PeerError>),
        }

        loop {
            let event = tokio::select! {
                cmd = session.cmd_rx.recv() => Event::Cmd(cmd),
                msg = session.reader.recv() => Event::Msg(msg),
            };

            match event {
                Event::Cmd(Some(ReceiverCmd::Download(piece))) => {
                    debug!(piece, "interested");
                    session.writer.send(&Message::Interested).await?;

                    // The peer may have left us unchoked from an earlier
                    // round; no new UNCHOKE will come then.
                    let already_open = !session.peer.lock().peer_choking;
                    if already_open {
                        self.pursue_target(&mut session).await?;
                    }
                }

                // Engine shut down and dropped our handle.
                Event::Cmd(None) => return Ok(()),

                Event::Msg(Ok(message)) => {
                    self.idle = false;
                    if self.handle(message, &mut session).await? {
                        return Ok(());
                    }
                }

                Event::Msg(Err(PeerError::Timeout)) => {
                    // First silent window: nudge the peer. Second: the
                    // link is dead.
                    if self.idle {
                        return Err(PeerError::Timeout);
                    }
                    session.writer.send(&Message::KeepAlive).await?;
                    self.idle = true;
                }

                Event::Msg(Err(err)) => return Err(err),
            }
        }
    }

    /// Applies one inbound message. Returns `true` when the download is
    /// complete and the connection should wind down.
    async fn handle(&mut self, message: Message, session: &mut Session) -> Result<bool, PeerError> {
        match message {
            Message::KeepAlive => {}

            Message::Choke => {
                session.peer.lock().peer_choking = true;
                // Teardown re-releases whatever is left in the target
                // slot; a released piece must not linger there.
                let released = session.target.lock().take();
                if let Some(piece) = released {
                    self.engine.release_piece(piece);
                    self.claimed = None;
                }
            }

            Message::Unchoke => {
                session.peer.lock().peer_choking = false;
                self.pursue_target(session).await?;
            }

            Message::Have { piece } => {
                let newly_set = {
                    let mut peer = session.peer.lock();
                    let fresh = !peer.bitfield.has(piece);
                    peer.bitfield.set(piece);
                    fresh
                };
                if newly_set {
                    self.engine.apply_peer_have(piece);
                }
            }

            Message::Bitfield(payload) => {
                let bf = Bitfield::from_message(&payload, self.engine.meta.piece_count())?;
                session.peer.lock().bitfield = bf.clone();
                self.engine.apply_peer_bitfield(&bf);
                self.engine.rarest_first();
            }

            Message::Piece { index, begin, data } => {
                return self.handle_block(index, begin, data, session).await;
            }

            // Sender-side traffic; nothing for a download half to do.
            Message::Interested | Message::NotInterested | Message::Request { .. } => {}
        }

        Ok(false)
    }

    /// Claims the assigned piece and requests its next block, or backs off
    /// with NOT_INTERESTED when another receiver already holds the claim.
    async fn pursue_target(&mut self, session: &mut Session) -> Result<(), PeerError> {
        let Some(piece) = *session.target.lock() else {
            return Ok(());
        };

        // Already ours: a request is in flight or about to be driven by
        // the next PIECE arrival.
        if self.claimed == Some(piece) {
            return Ok(());
        }

        if self.engine.claim_piece(piece) {
            self.claimed = Some(piece);
            self.request_next_block(piece, &mut session.writer).await
        } else {
            *session.target.lock() = None;
            session.peer.lock().am_interested = false;
            session.writer.send(&Message::NotInterested).await
        }
    }

    async fn handle_block(
        &mut self,
        index: u32,
        begin: u32,
        data: Bytes,
        session: &mut Session,
    ) -> Result<bool, PeerError> {
        self.engine
            .store
            .write_block(index, begin, &data)
            .map_err(|err| PeerError::InvalidMessage(err.to_string()))?;

        if let Some(started) = self.request_started.take() {
            let elapsed = started.elapsed().as_secs_f64();
            if elapsed > 0.0 {
                session.peer.lock().rate = data.len() as f64 / elapsed;
            }
        }

        let progress = self.engine.add_progress(index, data.len() as u32);
        if progress < self.engine.meta.piece_len(index) {
            self.request_next_block(index, &mut session.writer).await?;
            return Ok(false);
        }

        if !self.engine.store.verify_piece(index) {
            // Corrupt piece: wipe it and start over, still interested.
            warn!(piece = index, "hash mismatch, discarding piece");
            self.engine
                .store
                .zero_piece(index)
                .map_err(|err| PeerError::InvalidMessage(err.to_string()))?;
            self.engine.reset_progress(index);
            self.request_next_block(index, &mut session.writer).await?;
            return Ok(false);
        }

        debug!(piece = index, "piece verified");
        let complete = self.engine.mark_verified(index);
        self.claimed = None;

        *session.target.lock() = None;
        session.peer.lock().am_interested = false;
        session.writer.send(&Message::NotInterested).await?;

        self.engine.rarest_first();

        if complete {
            self.engine
                .store
                .promote()
                .map_err(|err| PeerError::InvalidMessage(err.to_string()))?;
            self.engine.agent.completed().await;
            return Ok(true);
        }

        Ok(false)
    }

    async fn request_next_block(
        &mut self,
        piece: u32,
        writer: &mut WireWriter,
    ) -> Result<(), PeerError> {
        let begin = self.engine.progress_of(piece);
        let length = self.engine.meta.block_len(piece, begin);

        self.request_started = Some(Instant::now());
        writer
            .send(&Message::Request {
                index: piece,
                begin,
                length,
            })
            .await
    }
}
