mod batcher;
mod congestion;
mod engine;
mod gossip;
mod registry;
mod sampler;
mod sequencer;
mod smoothing;
mod vector_clock;

use crate::batcher::Batcher;
use crate::congestion::{CongestionEvent, CongestionMonitor};
use crate::engine::{Core, CoreCommand};
use async_trait::async_trait;
use bytes::Bytes;
use config::{AT2Configuration, NodeParameters};
use crypto::{KeyPair, NodeId};
use futures::sink::SinkExt;
use log::{info, warn};
use messages::wire::{self, RouterRequest};
use messages::{DirectMessage, Gossip, PeerDiscovery};
use network::error::NetworkResult;
use network::peer_channel::send_unsigned;
use network::publisher::{Publisher, PublisherHandle};
use network::receiver::{MessageHandler, Receiver as NetworkReceiver, Writer};
use network::subscriber::{Subscriber, SubscriberHandle};
use std::error::Error;
use std::net::SocketAddr;
use tokio::sync::{mpsc, oneshot};

pub use crate::engine::NodeSnapshot;

/// The default size of inter-task channels.
pub(crate) const DEFAULT_CHANNEL_SIZE: usize = 1_000;

/// Handle to a running node: the application-facing surface.
#[derive(Clone)]
pub struct NodeHandle {
    name: NodeId,
    keypair: KeyPair,
    router_address: SocketAddr,
    publisher_address: SocketAddr,
    tx_core: mpsc::Sender<CoreCommand>,
    tx_gossip: mpsc::Sender<Gossip>,
    tx_congestion: mpsc::Sender<CongestionEvent>,
    publisher: PublisherHandle,
    subscriber: SubscriberHandle,
}

impl NodeHandle {
    pub fn name(&self) -> &NodeId {
        &self.name
    }

    pub fn router_address(&self) -> SocketAddr {
        self.router_address
    }

    pub fn publisher_address(&self) -> SocketAddr {
        self.publisher_address
    }

    /// Hand a gossip to the batch builder.
    pub async fn submit(&self, gossip: Gossip) {
        self.tx_gossip
            .send(gossip)
            .await
            .expect("Failed to reach the batch builder");
    }

    /// Send a one-off direct message to a router endpoint.
    pub async fn direct_message(
        &self,
        address: SocketAddr,
        message: &DirectMessage,
    ) -> NetworkResult<()> {
        let frames = wire::direct_message(&self.name, message);
        send_unsigned(address, frames).await.map(|_| ())
    }

    /// Publish an application payload on a topic.
    pub async fn publish(&self, topic: String, body: String) {
        self.publisher.queue(topic, body, String::new()).await;
    }

    pub async fn subscribe(&self, topic: String) {
        self.subscriber.subscribe(topic).await;
    }

    pub async fn unsubscribe(&self, topic: String) {
        self.subscriber.unsubscribe(topic).await;
    }

    /// Introduce ourselves to every bootstrap router except our own.
    pub async fn peer_discovery(&self, routers: &[SocketAddr]) {
        let discovery = PeerDiscovery::new(
            &self.keypair,
            self.router_address.to_string(),
            self.publisher_address.to_string(),
        );
        for address in routers {
            if *address == self.router_address {
                continue;
            }
            let address = *address;
            let frames = wire::peer_discovery(&self.name, &discovery);
            tokio::spawn(async move {
                if let Err(e) = send_unsigned(address, frames).await {
                    warn!("Peer discovery to {} failed: {}", address, e);
                }
            });
        }
    }

    /// Freeze the congestion controller (used by experiments and tests).
    pub async fn pause_congestion(&self) {
        self.tx_congestion
            .send(CongestionEvent::Pause)
            .await
            .expect("Failed to reach the congestion controller");
    }

    /// A point-in-time view of the node state.
    pub async fn snapshot(&self) -> NodeSnapshot {
        let (sender, receiver) = oneshot::channel();
        self.tx_core
            .send(CoreCommand::Snapshot(sender))
            .await
            .expect("Failed to reach the engine");
        receiver.await.expect("Failed to receive snapshot")
    }
}

/// Spawn a node: the engine, batch builder, congestion controller and the
/// three network planes, wired with mpsc channels.
pub fn spawn_node(
    keypair: KeyPair,
    at2: AT2Configuration,
    params: NodeParameters,
    router_address: SocketAddr,
    publisher_address: SocketAddr,
) -> NodeHandle {
    let name = keypair.node_id();

    let (tx_core, rx_core) = mpsc::channel(DEFAULT_CHANNEL_SIZE);
    let (tx_gossip, rx_gossip) = mpsc::channel(DEFAULT_CHANNEL_SIZE);
    let (tx_batch, mut rx_batch) = mpsc::channel::<Vec<Gossip>>(DEFAULT_CHANNEL_SIZE);
    let (tx_congestion, rx_congestion) = mpsc::channel(DEFAULT_CHANNEL_SIZE);
    let (tx_publication, mut rx_publication) = mpsc::channel(DEFAULT_CHANNEL_SIZE);

    // The publish plane: our publisher socket and the shared subscriber.
    let publisher = Publisher::spawn(publisher_address, params.publish_frequency);
    let subscriber = Subscriber::spawn(tx_publication);

    // The congestion controller owns both cadences.
    let cadence = CongestionMonitor::spawn(params.clone(), rx_congestion, publisher.clone());

    // The batch builder seals pending gossips at the controlled cadence.
    Batcher::spawn(rx_gossip, tx_batch, cadence.clone());

    // The engine owns all broadcast state.
    Core::spawn(
        keypair.clone(),
        at2,
        params,
        rx_core,
        tx_core.clone(),
        publisher.clone(),
        subscriber.clone(),
        tx_congestion.clone(),
        cadence,
    );

    // Forward sealed batches and subscriber publications to the engine.
    {
        let tx_core = tx_core.clone();
        tokio::spawn(async move {
            while let Some(gossips) = rx_batch.recv().await {
                if tx_core.send(CoreCommand::Originate(gossips)).await.is_err() {
                    break;
                }
            }
        });
    }
    {
        let tx_core = tx_core.clone();
        tokio::spawn(async move {
            while let Some((topic, body, signature)) = rx_publication.recv().await {
                if tx_core
                    .send(CoreCommand::Publication(topic, body, signature))
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });
    }

    // The router endpoint.
    NodeReceiverHandler::spawn(router_address, tx_core.clone());

    info!("Node {} booted on {}", name, router_address);
    NodeHandle {
        name,
        keypair,
        router_address,
        publisher_address,
        tx_core,
        tx_gossip,
        tx_congestion,
        publisher,
        subscriber,
    }
}

/// Defines how the network receiver handles incoming router requests.
#[derive(Clone)]
struct NodeReceiverHandler {
    tx_core: mpsc::Sender<CoreCommand>,
}

impl NodeReceiverHandler {
    fn spawn(address: SocketAddr, tx_core: mpsc::Sender<CoreCommand>) {
        NetworkReceiver::spawn(address, Self { tx_core });
    }
}

#[async_trait]
impl MessageHandler for NodeReceiverHandler {
    async fn dispatch(
        &self,
        writer: &mut Writer,
        frames: Vec<Vec<u8>>,
    ) -> Result<(), Box<dyn Error>> {
        let (sender, receiver) = oneshot::channel();

        match wire::parse(&frames)? {
            RouterRequest::Direct(message) => self
                .tx_core
                .send(CoreCommand::Direct(message, sender))
                .await
                .expect("Failed to forward direct message to the engine"),
            RouterRequest::Discovery(discovery) => self
                .tx_core
                .send(CoreCommand::Discovery(discovery, sender))
                .await
                .expect("Failed to forward peer discovery to the engine"),
            RouterRequest::Echo(echo, signature) => self
                .tx_core
                .send(CoreCommand::Echo(echo, signature, sender))
                .await
                .expect("Failed to forward echo to the engine"),
            RouterRequest::Batch(batch) => self
                .tx_core
                .send(CoreCommand::Batch(batch, sender))
                .await
                .expect("Failed to forward batch to the engine"),
        }

        // Reply to the peer with the single reply frame.
        let reply = receiver.await.expect("Failed to receive reply from the engine");
        writer.send(Bytes::from(reply.to_frame())).await?;
        Ok(())
    }
}
