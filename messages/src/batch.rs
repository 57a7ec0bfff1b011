use crate::error::{MessageError, MessageResult};
use crate::{ensure, BatchKey};
use crypto::{
    merkle_root, stable_hash, BlsPublicKey, BlsSignature, EcdsaPublicKey, EcdsaSignature, KeyPair,
    NodeId,
};
use serde::{Deserialize, Serialize};

/// An opaque application record. The core never interprets it beyond hashing
/// its canonical encoding.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Gossip {
    pub message_type: String,
    pub timestamp: u64,
}

impl Gossip {
    pub fn new(timestamp: u64) -> Self {
        Self {
            message_type: "Gossip".to_string(),
            timestamp,
        }
    }

    /// The canonical JSON encoding signed by the creator's BLS key.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("Failed to serialize gossip")
    }

    /// The decimal-string hash used as this gossip's merkle leaf.
    pub fn decimal_hash(&self) -> String {
        crypto::decimal_hash(&self.canonical_bytes())
    }
}

/// A batch of gossips wrapped in the broadcast envelope. The creator fields
/// identify the originator; the sender fields identify the last relayer and
/// are re-stamped on every hop.
#[derive(Serialize, Deserialize, Clone)]
pub struct BatchedMessage {
    pub message_type: String,
    pub creator_bls: BlsPublicKey,
    pub creator_ecdsa: EcdsaPublicKey,
    pub sender_ecdsa: EcdsaPublicKey,
    pub messages: Vec<Gossip>,
    pub aggregated_bls_signature: BlsSignature,
    pub merkle_root: String,
    pub vector_clock: Vec<(NodeId, u64)>,
}

impl BatchedMessage {
    /// The creator-signed portion: everything except the sender identity.
    pub fn creator_bytes(&self) -> Vec<u8> {
        let mut bytes = String::new();
        bytes.push_str(&self.message_type);
        bytes.push_str(&self.creator_bls.encode_base64());
        bytes.push_str(&self.creator_ecdsa.x_decimal());
        bytes.push_str(&self.creator_ecdsa.y_decimal());
        bytes.push_str(&self.aggregated_bls_signature.encode_base64());
        bytes.push_str(&self.merkle_root);
        bytes.into_bytes()
    }

    /// The sender-signed portion: the creator portion plus the sender
    /// coordinates, inserted right after the creator ECDSA fields.
    pub fn sender_bytes(&self) -> Vec<u8> {
        let mut bytes = String::new();
        bytes.push_str(&self.message_type);
        bytes.push_str(&self.creator_bls.encode_base64());
        bytes.push_str(&self.creator_ecdsa.x_decimal());
        bytes.push_str(&self.creator_ecdsa.y_decimal());
        bytes.push_str(&self.sender_ecdsa.x_decimal());
        bytes.push_str(&self.sender_ecdsa.y_decimal());
        bytes.push_str(&self.aggregated_bls_signature.encode_base64());
        bytes.push_str(&self.merkle_root);
        bytes.into_bytes()
    }

    /// The stable key of this batch, hashed over the creator-signed portion.
    pub fn key(&self) -> BatchKey {
        stable_hash(&self.creator_bytes())
    }

    /// The pub/sub topic carrying this batch's echo and ready responses.
    pub fn topic(&self) -> String {
        crate::topic(self.key())
    }

    /// The identity of the batch creator.
    pub fn creator_id(&self) -> NodeId {
        self.creator_ecdsa.node_id()
    }

    /// The vector-clock values in the order the creator serialized them.
    pub fn clock_values(&self) -> Vec<u64> {
        self.vector_clock.iter().map(|(_, counter)| *counter).collect()
    }
}

impl std::fmt::Debug for BatchedMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> Result<(), std::fmt::Error> {
        write!(
            f,
            "B{}({}, {} gossips)",
            self.key(),
            self.creator_id(),
            self.messages.len()
        )
    }
}

/// A batch together with its detached creator and sender signatures, as they
/// travel on the wire.
#[derive(Clone, Debug)]
pub struct SignedBatch {
    pub message: BatchedMessage,
    pub creator_signature: EcdsaSignature,
    pub sender_signature: EcdsaSignature,
}

impl SignedBatch {
    /// Build and sign a batch created by this node (creator and sender are
    /// both us until the first relay).
    pub fn new(
        messages: Vec<Gossip>,
        vector_clock: Vec<(NodeId, u64)>,
        keypair: &KeyPair,
    ) -> MessageResult<Self> {
        let signatures: Vec<BlsSignature> = messages
            .iter()
            .map(|gossip| keypair.bls_sign(&gossip.canonical_bytes()))
            .collect();
        let aggregated = BlsSignature::aggregate(&signatures)
            .map_err(|e| MessageError::InvalidSignature(e.to_string()))?;

        let leaves: Vec<String> = messages.iter().map(|gossip| gossip.decimal_hash()).collect();
        let message = BatchedMessage {
            message_type: "BatchedMessage".to_string(),
            creator_bls: keypair.bls_public(),
            creator_ecdsa: keypair.public(),
            sender_ecdsa: keypair.public(),
            messages,
            aggregated_bls_signature: aggregated,
            merkle_root: merkle_root(&leaves),
            vector_clock,
        };

        let creator_signature = keypair.sign(&message.creator_bytes());
        let sender_signature = keypair.sign(&message.sender_bytes());
        Ok(Self {
            message,
            creator_signature,
            sender_signature,
        })
    }

    /// Derive the relayed form of this batch: only the sender identity and
    /// its signature change; the creator envelope is preserved untouched.
    pub fn relay(&self, keypair: &KeyPair) -> Self {
        let mut message = self.message.clone();
        message.sender_ecdsa = keypair.public();
        let sender_signature = keypair.sign(&message.sender_bytes());
        Self {
            message,
            creator_signature: self.creator_signature.clone(),
            sender_signature,
        }
    }

    /// Verify the three envelope signatures: creator, sender, and the BLS
    /// aggregate over every gossip.
    pub fn verify(&self) -> MessageResult<()> {
        self.message
            .creator_ecdsa
            .verify(&self.message.creator_bytes(), &self.creator_signature)?;
        self.message
            .sender_ecdsa
            .verify(&self.message.sender_bytes(), &self.sender_signature)?;

        ensure!(
            !self.message.messages.is_empty(),
            MessageError::SerializationError("batch carries no gossips".to_string())
        );
        let encoded: Vec<Vec<u8>> = self
            .message
            .messages
            .iter()
            .map(|gossip| gossip.canonical_bytes())
            .collect();
        let message_refs: Vec<&[u8]> = encoded.iter().map(|bytes| bytes.as_slice()).collect();
        let key_refs: Vec<&BlsPublicKey> = self
            .message
            .messages
            .iter()
            .map(|_| &self.message.creator_bls)
            .collect();
        BlsPublicKey::verify_aggregate(
            &key_refs,
            &message_refs,
            &self.message.aggregated_bls_signature,
        )?;
        Ok(())
    }

    pub fn key(&self) -> BatchKey {
        self.message.key()
    }

    pub fn topic(&self) -> String {
        self.message.topic()
    }
}
