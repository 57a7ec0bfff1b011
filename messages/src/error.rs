use crate::BatchKey;
use crypto::{CryptoError, NodeId};
use thiserror::Error;

#[macro_export]
macro_rules! bail {
    ($e:expr) => {
        return Err($e);
    };
}

#[macro_export(local_inner_macros)]
macro_rules! ensure {
    ($cond:expr, $e:expr) => {
        if !($cond) {
            bail!($e);
        }
    };
}

/// Convenient result wrappers.
pub type MessageResult<T> = Result<T, MessageError>;
pub type BroadcastResult<T> = Result<T, BroadcastError>;

/// Errors triggered when parsing and verifying wire messages.
#[derive(Debug, Error)]
pub enum MessageError {
    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    #[error("Invalid key material: {0}")]
    InvalidKey(String),

    #[error("Unknown message type '{0}'")]
    UnknownMessageType(String),

    #[error("Malformed frame sequence: {0}")]
    MalformedFrames(String),

    #[error("Malformed batch topic '{0}'")]
    MalformedTopic(String),

    #[error("Failed to deserialize message ({0})")]
    SerializationError(String),
}

impl From<CryptoError> for MessageError {
    fn from(error: CryptoError) -> Self {
        match error {
            CryptoError::InvalidKey(e) | CryptoError::InvalidFieldElement(e) => {
                MessageError::InvalidKey(e)
            }
            e => MessageError::InvalidSignature(e.to_string()),
        }
    }
}

impl From<serde_json::Error> for MessageError {
    fn from(error: serde_json::Error) -> Self {
        MessageError::SerializationError(error.to_string())
    }
}

/// Errors surfaced by the broadcast engine while driving a batch.
#[derive(Debug, Error)]
pub enum BroadcastError {
    #[error(transparent)]
    MessageError(#[from] MessageError),

    #[error("Echo threshold not met for batch {0} within the gossip timeout")]
    EchoFailure(BatchKey),

    #[error("Ready threshold not met for batch {0} within the gossip timeout")]
    ReadyFailure(BatchKey),

    #[error("Peer {0} is not known")]
    UnknownPeer(NodeId),

    #[error("Sample of {needed} peers requested but only {available} are known")]
    NotEnoughPeers { needed: usize, available: usize },
}
