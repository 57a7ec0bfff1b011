use crate::error::{MessageError, MessageResult};
use crate::BatchKey;
use crypto::{BlsPublicKey, EcdsaPublicKey, EcdsaSignature, KeyPair};
use serde::{Deserialize, Serialize};

/// A one-off application message pushed straight to a peer's router.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct DirectMessage {
    pub message_type: String,
    pub sender: String,
    pub message: String,
}

impl DirectMessage {
    pub fn new(sender: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            message_type: "DirectMessage".to_string(),
            sender: sender.into(),
            message: message.into(),
        }
    }

    /// Stable hash under which receivers record this message.
    pub fn digest(&self) -> u64 {
        let encoded = serde_json::to_vec(self).expect("Failed to serialize direct message");
        crypto::stable_hash(&encoded)
    }
}

/// The bootstrap exchange: a node introduces its keys and endpoints.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct PeerDiscovery {
    pub message_type: String,
    pub bls_public_key: BlsPublicKey,
    pub ecdsa_public_key: EcdsaPublicKey,
    pub router_address: String,
    pub publisher_address: String,
}

impl PeerDiscovery {
    pub fn new(keypair: &KeyPair, router_address: String, publisher_address: String) -> Self {
        Self {
            message_type: "PeerDiscovery".to_string(),
            bls_public_key: keypair.bls_public(),
            ecdsa_public_key: keypair.public(),
            router_address,
            publisher_address,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum EchoKind {
    EchoSubscribe,
    ReadySubscribe,
}

/// A signed request for a peer's echo or ready feedback on a batch.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Echo {
    pub message_type: EchoKind,
    pub batched_messages_hash: String,
    pub creator: EcdsaPublicKey,
}

impl Echo {
    pub fn new(kind: EchoKind, key: BatchKey, creator: EcdsaPublicKey) -> Self {
        Self {
            message_type: kind,
            batched_messages_hash: crate::topic(key),
            creator,
        }
    }

    /// The canonical bytes covered by the ECDSA signature.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("Failed to serialize echo")
    }

    pub fn sign(&self, keypair: &KeyPair) -> EcdsaSignature {
        keypair.sign(&self.canonical_bytes())
    }

    pub fn verify(&self, signature: &EcdsaSignature) -> MessageResult<()> {
        self.creator
            .verify(&self.canonical_bytes(), signature)
            .map_err(MessageError::from)
    }

    /// The batch this echo refers to.
    pub fn key(&self) -> MessageResult<BatchKey> {
        crate::parse_topic(&self.batched_messages_hash)
            .ok_or_else(|| MessageError::MalformedTopic(self.batched_messages_hash.clone()))
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResponseKind {
    EchoResponse,
    ReadyResponse,
}

/// A signed echo or ready reply, published to the subscribers of the batch
/// topic.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Response {
    pub message_type: ResponseKind,
    pub topic: String,
    pub creator: EcdsaPublicKey,
}

impl Response {
    pub fn new(kind: ResponseKind, key: BatchKey, creator: EcdsaPublicKey) -> Self {
        Self {
            message_type: kind,
            topic: crate::topic(key),
            creator,
        }
    }

    pub fn canonical_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("Failed to serialize response")
    }

    pub fn sign(&self, keypair: &KeyPair) -> EcdsaSignature {
        keypair.sign(&self.canonical_bytes())
    }

    pub fn verify(&self, signature: &EcdsaSignature) -> MessageResult<()> {
        self.creator
            .verify(&self.canonical_bytes(), signature)
            .map_err(MessageError::from)
    }

    pub fn key(&self) -> MessageResult<BatchKey> {
        crate::parse_topic(&self.topic)
            .ok_or_else(|| MessageError::MalformedTopic(self.topic.clone()))
    }
}

/// Congestion feedback piggybacked on the reply to a batch push.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct CongestionUpdate {
    pub status: String,
    pub current_latency: f64,
    pub recently_missed: bool,
}

impl CongestionUpdate {
    pub fn new(current_latency: f64, recently_missed: bool) -> Self {
        Self {
            status: "CongestionUpdate".to_string(),
            current_latency,
            recently_missed,
        }
    }
}

/// The single reply frame a router sends back for a request.
#[derive(Clone, Debug)]
pub enum RouterReply {
    Ok,
    AlreadyReceived,
    Congestion(CongestionUpdate),
}

impl RouterReply {
    pub fn to_frame(&self) -> Vec<u8> {
        match self {
            RouterReply::Ok => b"OK".to_vec(),
            RouterReply::AlreadyReceived => b"ALREADY_RECEIVED".to_vec(),
            RouterReply::Congestion(update) => {
                serde_json::to_vec(update).expect("Failed to serialize congestion update")
            }
        }
    }

    pub fn from_frame(frame: &[u8]) -> MessageResult<Self> {
        if frame == b"OK" {
            return Ok(RouterReply::Ok);
        }
        if frame == b"ALREADY_RECEIVED" {
            return Ok(RouterReply::AlreadyReceived);
        }
        let update: CongestionUpdate = serde_json::from_slice(frame)?;
        Ok(RouterReply::Congestion(update))
    }

    /// Whether the peer advertised that it already holds the batch.
    pub fn is_already_received(&self) -> bool {
        matches!(self, RouterReply::AlreadyReceived)
    }
}
