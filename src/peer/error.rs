use thiserror::Error;

/// Errors on a single peer connection. None of these escalate beyond the
/// connection that raised them.
#[derive(Debug, Error)]
pub enum PeerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The handshake was short or carried the wrong protocol tag.
    #[error("handshake failed")]
    BadHandshake,

    /// The handshake named a torrent we are not serving.
    #[error("invalid info hash")]
    InfoHashMismatch,

    /// A bitfield message with the wrong length or non-zero spare bits.
    #[error("bitfield invalid")]
    BadBitfield,

    /// A framed message that does not match its declared layout.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("unknown message id: {0}")]
    UnknownMessageId(u8),

    /// The remote side closed the connection.
    #[error("connection closed")]
    ConnectionClosed,

    /// No traffic within the keep-alive window.
    #[error("read timeout")]
    Timeout,
}

impl PeerError {
    /// Connection resets and broken pipes are routine churn and are not
    /// worth a log line.
    pub fn is_silent(&self) -> bool {
        match self {
            PeerError::Io(err) => matches!(
                err.kind(),
                std::io::ErrorKind::ConnectionReset | std::io::ErrorKind::BrokenPipe
            ),
            PeerError::ConnectionClosed => true,
            _ => false,
        }
    }
}
