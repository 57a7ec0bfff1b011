//! Frame layouts of the router protocol. A request is a multipart frame
//! sequence `[identity, empty, body, ...]`; the body is canonical JSON whose
//! `message_type` field selects the variant. Signed requests append their
//! signature frames interleaved with empties.

use crate::batch::SignedBatch;
use crate::control::{DirectMessage, Echo, PeerDiscovery};
use crate::error::{MessageError, MessageResult};
use crypto::EcdsaSignature;
use serde::{Deserialize, Serialize};

/// A multipart frame sequence as it travels inside one transport unit.
pub type Frames = Vec<Vec<u8>>;

fn body<T: Serialize>(value: &T) -> Vec<u8> {
    serde_json::to_vec(value).expect("Failed to serialize message body")
}

/// `[identity, empty, body]`
pub fn direct_message(identity: &str, message: &DirectMessage) -> Frames {
    vec![identity.as_bytes().to_vec(), Vec::new(), body(message)]
}

/// `[identity, empty, body]`
pub fn peer_discovery(identity: &str, message: &PeerDiscovery) -> Frames {
    vec![identity.as_bytes().to_vec(), Vec::new(), body(message)]
}

/// `[identity, empty, body, empty, signature]`
pub fn echo(identity: &str, message: &Echo, signature: &EcdsaSignature) -> Frames {
    vec![
        identity.as_bytes().to_vec(),
        Vec::new(),
        body(message),
        Vec::new(),
        body(signature),
    ]
}

/// `[identity, empty, body, empty, creator_signature, empty, sender_signature]`
pub fn batch(identity: &str, batch: &SignedBatch) -> Frames {
    vec![
        identity.as_bytes().to_vec(),
        Vec::new(),
        body(&batch.message),
        Vec::new(),
        body(&batch.creator_signature),
        Vec::new(),
        body(&batch.sender_signature),
    ]
}

/// A parsed router request.
#[derive(Debug)]
pub enum RouterRequest {
    Direct(DirectMessage),
    Discovery(PeerDiscovery),
    Echo(Echo, EcdsaSignature),
    Batch(SignedBatch),
}

#[derive(Deserialize)]
struct Tag {
    message_type: String,
}

fn frame<'a>(frames: &'a [Vec<u8>], index: usize) -> MessageResult<&'a [u8]> {
    frames
        .get(index)
        .map(|frame| frame.as_slice())
        .ok_or_else(|| MessageError::MalformedFrames(format!("missing frame {}", index)))
}

/// Parse a router request from its frame sequence.
pub fn parse(frames: &[Vec<u8>]) -> MessageResult<RouterRequest> {
    let raw_body = frame(frames, 2)?;
    let tag: Tag = serde_json::from_slice(raw_body)?;
    match tag.message_type.as_str() {
        "DirectMessage" => Ok(RouterRequest::Direct(serde_json::from_slice(raw_body)?)),
        "PeerDiscovery" => Ok(RouterRequest::Discovery(serde_json::from_slice(raw_body)?)),
        "EchoSubscribe" | "ReadySubscribe" => {
            let signature = serde_json::from_slice(frame(frames, 4)?)?;
            Ok(RouterRequest::Echo(
                serde_json::from_slice(raw_body)?,
                signature,
            ))
        }
        "BatchedMessage" => Ok(RouterRequest::Batch(SignedBatch {
            message: serde_json::from_slice(raw_body)?,
            creator_signature: serde_json::from_slice(frame(frames, 4)?)?,
            sender_signature: serde_json::from_slice(frame(frames, 6)?)?,
        })),
        other => Err(MessageError::UnknownMessageType(other.to_string())),
    }
}
