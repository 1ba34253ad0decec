//! Per-peer upload worker.
//!
//! One task per accepted inbound connection. Validates the peer's
//! handshake, replies with ours, advertises our bitfield, then serves
//! block requests while relaying the choke scheduler's decisions.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tracing::{debug, warn};

use super::{Engine, SenderCmd, SenderHandle};
use crate::peer::{
    Handshake, Message, PeerError, PeerId, RemotePeer, SharedPeer, Wire, WireReader, WireWriter,
};

enum State {
    AwaitHandshake(Wire),
    Active(Session),
    Closed,
}

struct Session {
    reader: WireReader,
    writer: WireWriter,
    cmd_rx: UnboundedReceiver<SenderCmd>,
    peer: SharedPeer,
}

pub(crate) async fn run(engine: Arc<Engine>, stream: TcpStream, addr: SocketAddr) {
    let mut worker = Worker {
        engine: engine.clone(),
        addr,
        registered: None,
        idle: false,
    };

    match worker.drive(stream).await {
        Ok(()) => debug!(%addr, "sender closed"),
        Err(err) if err.is_silent() => {}
        Err(err) => warn!(%addr, "sender failed: {err}"),
    }

    if let Some(id) = worker.registered {
        engine.sender_gone(id);
    }
}

struct Worker {
    engine: Arc<Engine>,
    addr: SocketAddr,
    registered: Option<PeerId>,
    idle: bool,
}

impl Worker {
    async fn drive(&mut self, stream: TcpStream) -> Result<(), PeerError> {
        let mut state = State::AwaitHandshake(Wire::new(stream));

        loop {
            state = match state {
                State::AwaitHandshake(mut wire) => {
                    let request = wire.recv_handshake().await?;
                    if request.info_hash != self.engine.meta.info_hash {
                        return Err(PeerError::InfoHashMismatch);
                    }

                    wire.send_handshake(&Handshake::new(
                        self.engine.meta.info_hash,
                        *self.engine.peer_id.as_bytes(),
                    ))
                    .await?;

                    let peer_id = PeerId::from_bytes(request.peer_id);
                    let peer = RemotePeer::new(self.addr, peer_id, self.engine.meta.piece_count())
                        .shared();
                    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();

                    self.engine.register_sender(
                        peer_id,
                        SenderHandle {
                            peer: peer.clone(),
                            cmd: cmd_tx,
                        },
                    );
                    self.registered = Some(peer_id);

                    // A peer with nothing to advertise stays silent.
                    let bitfield = self.engine.bitfield();
                    let (reader, mut writer) = wire.split();
                    if !bitfield.is_empty() {
                        writer.send(&Message::Bitfield(bitfield.to_bytes())).await?;
                    }

                    State::Active(Session {
                        reader,
                        writer,
                        cmd_rx,
                        peer,
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

    async fn exchange(&mut self, mut session: Session) -> Result<(), PeerError> {
        enum Event {
            Cmd(Option<SenderCmd>),
            Msg(Result<Message, PeerError>),
        }

        loop {
            let event = tokio::select! {
                cmd = session.cmd_rx.recv() => Event::Cmd(cmd),
                msg = session.reader.recv() => Event::Msg(msg),
            };

            match event {
                Event::Cmd(Some(SenderCmd::Unchoke)) => {
                    session.writer.send(&Message::Unchoke).await?;
                }
                Event::Cmd(Some(SenderCmd::Choke)) => {
                    session.writer.send(&Message::Choke).await?;
                }
                Event::Cmd(Some(SenderCmd::Have(piece))) => {
                    session.writer.send(&Message::Have { piece }).await?;
                }

                // Engine shut down and dropped our handle.
                Event::Cmd(None) => return Ok(()),

                Event::Msg(Ok(message)) => {
                    self.idle = false;
                    self.handle(message, &mut session).await?;
                }

                Event::Msg(Err(PeerError::Timeout)) => {
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

    async fn handle(&mut self, message: Message, session: &mut Session) -> Result<(), PeerError> {
        let peer_id = session.peer.lock().peer_id;

        match message {
            Message::KeepAlive => {}

            Message::Interested => {
                session.peer.lock().peer_interested = true;

                // Unchoke straight away while slots are free; otherwise
                // the scheduler promotes them if they earn it.
                if self.engine.proactive_unchoke(peer_id) {
                    session.peer.lock().am_choking = false;
                    session.writer.send(&Message::Unchoke).await?;
                }
            }

            Message::NotInterested => {
                self.engine.sender_unchoke_revoked(peer_id);
                {
                    let mut peer = session.peer.lock();
                    peer.peer_interested = false;
                    peer.am_choking = true;
                }
                session.writer.send(&Message::Choke).await?;
            }

            Message::Request {
                index,
                begin,
                length,
            } => {
                let block = self
                    .engine
                    .store
                    .read_block(index, begin, length)
                    .map_err(|err| PeerError::InvalidMessage(err.to_string()))?;

                let started = Instant::now();
                session
                    .writer
                    .send(&Message::Piece {
                        index,
                        begin,
                        data: block.into(),
                    })
                    .await?;

                let elapsed = started.elapsed().as_secs_f64();
                if elapsed > 0.0 {
                    session.peer.lock().rate = length as f64 / elapsed;
                }
                self.engine.agent.add_uploaded(length as u64);

                // The scheduler may have choked this peer between the
                // request arriving and the block going out.
                let choked_meanwhile = session.peer.lock().am_choking;
                if choked_meanwhile {
                    session.writer.send(&Message::Choke).await?;
                }
            }

            Message::Have { piece } => {
                session.peer.lock().bitfield.set(piece);
            }

            // Download-side traffic; an upload half ignores it.
            Message::Choke
            | Message::Unchoke
            | Message::Bitfield(_)
            | Message::Piece { .. } => {}
        }

        Ok(())
    }
}
