use std::io;
use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpSocket, TcpStream};

/// Pending-connection backlog for the listening socket.
const QUEUE_LEN: u32 = 5;

/// The listening TCP endpoint. No protocol logic lives here; accepted
/// connections are handed to sender workers untouched.
pub struct Listener {
    inner: TcpListener,
}

impl Listener {
    /// Binds the configured port on all IPv4 interfaces with
    /// `SO_REUSEADDR` set.
    pub fn bind(port: u16) -> io::Result<Self> {
        let socket = TcpSocket::new_v4()?;
        socket.set_reuseaddr(true)?;
        socket.bind(SocketAddr::from(([0, 0, 0, 0], port)))?;

        Ok(Self {
            inner: socket.listen(QUEUE_LEN)?,
        })
    }

    /// Waits for the next inbound connection.
    pub async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        self.inner.accept().await
    }

    /// The actually-bound port (differs from the request when binding 0).
    pub fn port(&self) -> io::Result<u16> {
        Ok(self.inner.local_addr()?.port())
    }
}
