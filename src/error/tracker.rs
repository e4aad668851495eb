use crate::error::metainfo::BencodeError;
use reqwest::Error as HttpError;

pub type Result<T, E = TrackerError> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    #[error("{0}")]
    Bencode(BencodeError),

    #[error("{0}")]
    Http(HttpError),

    #[error("{0}")]
    /// A UDP socket operation failed.
    Udp(std::io::Error),

    #[error("tracker request timed out")]
    /// Neither the connect nor the announce step got a reply in time.
    Timeout,

    #[error("tracker reply did not match our request")]
    /// The response's action or transaction id did not match what we sent,
    /// meaning it can't be trusted to belong to our request.
    TransactionMismatch,

    #[error("tracker returned a malformed response")]
    /// The response body could not be parsed into the expected shape.
    MalformedResponse,
}

impl From<BencodeError> for TrackerError {
    fn from(value: BencodeError) -> Self {
        Self::Bencode(value)
    }
}

impl From<HttpError> for TrackerError {
    fn from(value: HttpError) -> Self {
        Self::Http(value)
    }
}
