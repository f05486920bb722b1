use shared::codec::ProtocolError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
    #[error("could not resolve server address {0}")]
    Resolve(String),
    #[error("no acceptance from server within {0:?}")]
    Timeout(std::time::Duration),
    #[error("server refused the connection (reason {reason})")]
    Rejected { reason: u8 },
    #[error("not connected")]
    NotConnected,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}
