pub mod batch;
pub mod control;
pub mod error;
pub mod wire;

pub use batch::{BatchedMessage, Gossip, SignedBatch};
pub use control::{
    CongestionUpdate, DirectMessage, Echo, EchoKind, PeerDiscovery, Response, ResponseKind,
    RouterReply,
};

/// The stable 64-bit key of a batch, hashed over its creator-signed portion.
/// Its decimal rendering is the pub/sub topic carrying the batch's responses.
pub type BatchKey = u64;

/// Render a batch key as a pub/sub topic.
pub fn topic(key: BatchKey) -> String {
    key.to_string()
}

/// Parse a pub/sub topic back into a batch key.
pub fn parse_topic(topic: &str) -> Option<BatchKey> {
    topic.parse().ok()
}
