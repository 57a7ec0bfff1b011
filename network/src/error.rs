use std::net::SocketAddr;
use thiserror::Error;

pub type NetworkResult<T> = Result<T, NetworkError>;

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("Failed to connect to {0} after {1} attempts")]
    FailedToConnect(SocketAddr, usize),

    #[error("Failed to send message to {0}: {1}")]
    FailedToSend(SocketAddr, std::io::Error),

    #[error("Failed to receive reply from {0}: {1}")]
    FailedToReceive(SocketAddr, std::io::Error),

    #[error("Connection with {0} closed by peer")]
    Disconnected(SocketAddr),

    #[error("Malformed frame container: {0}")]
    MalformedFrames(String),

    #[error("Channel to the connection task dropped")]
    ChannelClosed,
}
