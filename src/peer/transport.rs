use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;

use super::error::PeerError;
use super::message::{Handshake, Message, HANDSHAKE_LEN};

/// Idle window before the protocol requires a keep-alive. A read that
/// exceeds this returns [`PeerError::Timeout`] so the worker can decide
/// between sending a keep-alive and tearing the connection down.
pub const KEEPALIVE_WINDOW: Duration = Duration::from_secs(120);

const WRITE_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Length-prefix framed transport over one TCP connection.
///
/// Used whole for the handshake exchange, then split into a read half and
/// a write half so a worker can wait for inbound messages and engine
/// commands at the same time.
pub struct Wire {
    stream: TcpStream,
    read_buf: BytesMut,
}

pub struct WireReader {
    read: OwnedReadHalf,
    read_buf: BytesMut,
}

pub struct WireWriter {
    write: OwnedWriteHalf,
}

impl Wire {
    pub fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            read_buf: BytesMut::with_capacity(32 * 1024),
        }
    }

    pub fn split(self) -> (WireReader, WireWriter) {
        let (read, write) = self.stream.into_split();
        (
            WireReader {
                read,
                read_buf: self.read_buf,
            },
            WireWriter { write },
        )
    }

    pub async fn send_handshake(&mut self, handshake: &Handshake) -> Result<(), PeerError> {
        let data = handshake.encode();
        timeout(WRITE_TIMEOUT, self.stream.write_all(&data))
            .await
            .map_err(|_| PeerError::Timeout)??;
        Ok(())
    }

    pub async fn recv_handshake(&mut self) -> Result<Handshake, PeerError> {
        while self.read_buf.len() < HANDSHAKE_LEN {
            let n = timeout(KEEPALIVE_WINDOW, self.stream.read_buf(&mut self.read_buf))
                .await
                .map_err(|_| PeerError::Timeout)??;

            if n == 0 {
                return Err(PeerError::ConnectionClosed);
            }
        }

        let data = self.read_buf.split_to(HANDSHAKE_LEN);
        Handshake::decode(&data)
    }
}

impl WireReader {
    /// Reads one complete framed message, waiting at most the keep-alive
    /// window for bytes to arrive.
    pub async fn recv(&mut self) -> Result<Message, PeerError> {
        self.fill(4).await?;

        let length = u32::from_be_bytes([
            self.read_buf[0],
            self.read_buf[1],
            self.read_buf[2],
            self.read_buf[3],
        ]) as usize;

        if length > MAX_MESSAGE_SIZE {
            return Err(PeerError::InvalidMessage(format!(
                "frame too large: {length}"
            )));
        }

        self.fill(4 + length).await?;
        let data = self.read_buf.split_to(4 + length);
        Message::decode(data.freeze())
    }

    async fn fill(&mut self, want: usize) -> Result<(), PeerError> {
        while self.read_buf.len() < want {
            let n = timeout(KEEPALIVE_WINDOW, self.read.read_buf(&mut self.read_buf))
                .await
                .map_err(|_| PeerError::Timeout)??;

            if n == 0 {
                return Err(PeerError::ConnectionClosed);
            }
        }
        Ok(())
    }
}

impl WireWriter {
    pub async fn send(&mut self, message: &Message) -> Result<(), PeerError> {
        let data = message.encode();
        timeout(WRITE_TIMEOUT, self.write.write_all(&data))
            .await
            .map_err(|_| PeerError::Timeout)??;
        Ok(())
    }
}
