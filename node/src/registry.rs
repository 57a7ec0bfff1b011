use crypto::{BlsPublicKey, EcdsaPublicKey, NodeId};
use network::peer_channel::PeerChannel;
use std::collections::BTreeMap;

/// Everything we know about a peer after its discovery message, plus the
/// request/response channel to its router. Records are never mutated; the
/// peer's endpoints live on in the channel and the shared subscriber
/// connection.
pub struct Peer {
    pub ecdsa: EcdsaPublicKey,
    pub bls: BlsPublicKey,
    pub channel: PeerChannel,
}

/// The set of known peers, in stable iteration order.
#[derive(Default)]
pub struct PeerRegistry {
    peers: BTreeMap<NodeId, Peer>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a peer; returns false if it was already known.
    pub fn insert(&mut self, id: NodeId, peer: Peer) -> bool {
        if self.peers.contains_key(&id) {
            return false;
        }
        self.peers.insert(id, peer);
        true
    }

    pub fn contains(&self, id: &str) -> bool {
        self.peers.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&Peer> {
        self.peers.get(id)
    }

    /// The channel to a peer's router, if known.
    pub fn channel(&self, id: &str) -> Option<PeerChannel> {
        self.peers.get(id).map(|peer| peer.channel.clone())
    }

    /// Peer identities in stable order.
    pub fn ids(&self) -> Vec<NodeId> {
        self.peers.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }
}
