use thiserror::Error;

#[derive(Debug, Error)]
pub enum TrackerError {
    /// HTTP client construction or transport failure.
    #[error("tracker transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("server error: malformatted response: {0}")]
    Bencode(#[from] crate::bencode::BencodeError),

    #[error("invalid announce url: {0}")]
    InvalidUrl(String),

    #[error("server error: malformatted response: {0}")]
    InvalidResponse(&'static str),

    /// The tracker answered with a `failure reason`.
    #[error("tracker failure: {0}")]
    Failure(String),

    /// The local address probe found no usable interface.
    #[error("IP error: unknown error finding local address")]
    LocalAddress,
}
