use crate::congestion::{Cadence, CongestionEvent};
use crate::gossip::GossipTask;
use crate::registry::{Peer, PeerRegistry};
use crate::sampler;
use crate::sequencer::Sequencer;
use crate::vector_clock::VectorClock;
use config::{AT2Configuration, NodeParameters};
use crypto::{EcdsaSignature, KeyPair, NodeId};
use log::{debug, info, warn};
use messages::wire;
use messages::{
    BatchKey, CongestionUpdate, DirectMessage, Echo, EchoKind, Gossip, PeerDiscovery, Response,
    ResponseKind, RouterReply, SignedBatch,
};
use network::peer_channel::PeerChannel;
use network::publisher::PublisherHandle;
use network::subscriber::SubscriberHandle;
use std::collections::{HashMap, HashSet};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Duration;

/// One-shot channel used to reply to a router request.
pub type Replier = oneshot::Sender<RouterReply>;

/// Commands processed by the engine task, the single owner of all broadcast
/// state.
pub enum CoreCommand {
    /// A sealed batch of gossips from the batch builder.
    Originate(Vec<Gossip>),
    /// A batch pushed to our router by a peer.
    Batch(SignedBatch, Replier),
    /// An echo or ready subscription request from a peer.
    Echo(Echo, EcdsaSignature, Replier),
    /// A peer introducing itself.
    Discovery(PeerDiscovery, Replier),
    /// A one-off application message.
    Direct(DirectMessage, Replier),
    /// A publication received on the subscriber plane.
    Publication(String, Vec<u8>, Vec<u8>),
    /// A gossip task learned that a peer already holds a batch.
    AlreadyHeld(BatchKey, NodeId),
    /// Congestion feedback carried on a router reply.
    PeerFeedback(CongestionUpdate),
    /// A gossip task finished its echo and ready waits.
    Outcome(GossipOutcome),
    /// State inspection for tests and operators.
    Snapshot(oneshot::Sender<NodeSnapshot>),
}

/// The result of one gossip run.
#[derive(Debug)]
pub struct GossipOutcome {
    pub key: BatchKey,
    pub delivered: bool,
    pub echo_failed: bool,
    /// Echo wait plus ready wait, in seconds.
    pub latency: f64,
}

/// Reply counts a gossip task polls: sizes of the sample/replies
/// intersections.
#[derive(Clone, Copy, Debug, Default)]
pub struct ReplyCounts {
    pub echo: usize,
    pub ready: usize,
}

/// Per-batch broadcast bookkeeping, kept for the run to suppress replays.
#[derive(Default)]
struct BroadcastState {
    echo_sample: HashSet<NodeId>,
    ready_sample: HashSet<NodeId>,
    echo_replies: HashSet<NodeId>,
    ready_replies: HashSet<NodeId>,
    already_received: HashSet<NodeId>,
    counts: Option<watch::Sender<ReplyCounts>>,
    delivered: bool,
}

impl BroadcastState {
    fn counts(&self) -> ReplyCounts {
        ReplyCounts {
            echo: self.echo_sample.intersection(&self.echo_replies).count(),
            ready: self.ready_sample.intersection(&self.ready_replies).count(),
        }
    }

    fn publish_counts(&self) {
        if let Some(sender) = &self.counts {
            let _ = sender.send(self.counts());
        }
    }
}

/// A point-in-time view of the node state.
#[derive(Debug, Clone)]
pub struct NodeSnapshot {
    pub name: NodeId,
    pub peers: Vec<NodeId>,
    pub delivered: Vec<(Vec<u64>, BatchKey)>,
    pub delivered_digest: String,
    pub received_batches: usize,
    pub received_directs: Vec<u64>,
    pub publications: Vec<(String, String)>,
    pub current_latency: f64,
}

/// The broadcast engine. Owns every shared map (received batches, reply
/// sets, vector clock, delivery log) and mutates them only from its own
/// task; gossip tasks and the router handler talk to it over the command
/// channel.
pub struct Core {
    keypair: KeyPair,
    name: NodeId,
    at2: AT2Configuration,
    params: NodeParameters,
    rx_command: mpsc::Receiver<CoreCommand>,
    tx_command: mpsc::Sender<CoreCommand>,
    publisher: PublisherHandle,
    subscriber: SubscriberHandle,
    tx_congestion: mpsc::Sender<CongestionEvent>,
    cadence: watch::Receiver<Cadence>,
    registry: PeerRegistry,
    received: HashMap<BatchKey, SignedBatch>,
    states: HashMap<BatchKey, BroadcastState>,
    vector_clock: VectorClock,
    sequencer: Sequencer,
    recently_missed: HashMap<NodeId, bool>,
    received_directs: Vec<u64>,
    publications: Vec<(String, String)>,
}

impl Core {
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        keypair: KeyPair,
        at2: AT2Configuration,
        params: NodeParameters,
        rx_command: mpsc::Receiver<CoreCommand>,
        tx_command: mpsc::Sender<CoreCommand>,
        publisher: PublisherHandle,
        subscriber: SubscriberHandle,
        tx_congestion: mpsc::Sender<CongestionEvent>,
        cadence: watch::Receiver<Cadence>,
    ) {
        let name = keypair.node_id();
        tokio::spawn(async move {
            Self {
                keypair,
                name,
                at2,
                params,
                rx_command,
                tx_command,
                publisher,
                subscriber,
                tx_congestion,
                cadence,
                registry: PeerRegistry::new(),
                received: HashMap::new(),
                states: HashMap::new(),
                vector_clock: VectorClock::new(),
                sequencer: Sequencer::new(),
                recently_missed: HashMap::new(),
                received_directs: Vec::new(),
                publications: Vec::new(),
            }
            .run()
            .await;
        });
    }

    async fn run(&mut self) {
        while let Some(command) = self.rx_command.recv().await {
            match command {
                CoreCommand::Originate(gossips) => self.handle_originate(gossips).await,
                CoreCommand::Batch(batch, replier) => self.handle_batch(batch, replier).await,
                CoreCommand::Echo(echo, signature, replier) => {
                    self.handle_echo(echo, signature, replier).await
                }
                CoreCommand::Discovery(discovery, replier) => {
                    self.handle_discovery(discovery, replier).await
                }
                CoreCommand::Direct(message, replier) => {
                    self.handle_direct(message, replier).await
                }
                CoreCommand::Publication(topic, body, signature) => {
                    self.handle_publication(topic, body, signature).await
                }
                CoreCommand::AlreadyHeld(key, peer) => {
                    self.states.entry(key).or_default().already_received.insert(peer);
                }
                CoreCommand::PeerFeedback(update) => self.handle_feedback(update).await,
                CoreCommand::Outcome(outcome) => self.handle_outcome(outcome).await,
                CoreCommand::Snapshot(replier) => {
                    let _ = replier.send(self.snapshot());
                }
            }
        }
    }

    async fn handle_direct(&mut self, message: DirectMessage, replier: Replier) {
        debug!("Received direct message from {}", message.sender);
        self.received_directs.push(message.digest());
        let _ = replier.send(RouterReply::Ok);
    }

    async fn handle_discovery(&mut self, discovery: PeerDiscovery, replier: Replier) {
        let id = discovery.ecdsa_public_key.node_id();
        if id != self.name && !self.registry.contains(&id) {
            match (
                discovery.router_address.parse(),
                discovery.publisher_address.parse(),
            ) {
                (Ok(router), Ok(publisher)) => {
                    // Open the request channel and share the subscriber
                    // connection with the new peer's publisher.
                    let channel = PeerChannel::spawn(router);
                    self.subscriber.connect(publisher).await;
                    self.registry.insert(
                        id.clone(),
                        Peer {
                            ecdsa: discovery.ecdsa_public_key,
                            bls: discovery.bls_public_key,
                            channel,
                        },
                    );
                    info!(
                        "Discovered peer {} at {} ({} known)",
                        id,
                        discovery.router_address,
                        self.registry.len()
                    );
                }
                _ => warn!("Peer {} advertised unparsable addresses", id),
            }
        }
        let _ = replier.send(RouterReply::Ok);
    }

    async fn handle_echo(&mut self, echo: Echo, signature: EcdsaSignature, replier: Replier) {
        if let Err(e) = echo.verify(&signature) {
            warn!("{}", e);
            let _ = replier.send(RouterReply::Ok);
            return;
        }
        let key = match echo.key() {
            Ok(key) => key,
            Err(e) => {
                warn!("{}", e);
                let _ = replier.send(RouterReply::Ok);
                return;
            }
        };

        let held = self.received.contains_key(&key);
        match echo.message_type {
            EchoKind::EchoSubscribe => {
                // Replay our echo for a batch we already hold; otherwise the
                // response goes out when the batch arrives.
                if held {
                    self.publish_response(ResponseKind::EchoResponse, key).await;
                }
            }
            EchoKind::ReadySubscribe => {
                let fed = self
                    .states
                    .get(&key)
                    .map(|state| state.ready_replies.len() >= self.at2.feedback_threshold())
                    .unwrap_or(false);
                if fed {
                    self.publish_response(ResponseKind::ReadyResponse, key).await;
                }
            }
        }
        let _ = replier.send(if held {
            RouterReply::AlreadyReceived
        } else {
            RouterReply::Ok
        });
    }

    async fn handle_batch(&mut self, batch: SignedBatch, replier: Replier) {
        if let Err(e) = batch.verify() {
            warn!("{}", e);
            let _ = replier.send(RouterReply::Ok);
            return;
        }
        let key = batch.key();
        if self.received.contains_key(&key) {
            // No state change; the reply advertises we hold the batch.
            let _ = replier.send(RouterReply::AlreadyReceived);
            return;
        }

        let sender_id = batch.message.sender_ecdsa.node_id();
        let creator_id = batch.message.creator_id();

        // A known creator must match the keys it registered at discovery.
        if let Some(peer) = self.registry.get(&creator_id) {
            if peer.ecdsa != batch.message.creator_ecdsa || peer.bls != batch.message.creator_bls {
                warn!("Batch {} carries keys that do not match peer {}", key, creator_id);
                let _ = replier.send(RouterReply::Ok);
                return;
            }
        }
        debug!("Received batch {} created by {}", key, creator_id);

        self.received.insert(key, batch.clone());
        self.states.entry(key).or_default();
        self.vector_clock.increment(&creator_id);
        self.publish_response(ResponseKind::EchoResponse, key).await;

        // Reply with congestion feedback, consuming the sender's
        // recently-missed flag.
        let current_latency = self.cadence.borrow().batch_interval;
        let recently_missed = self
            .recently_missed
            .get_mut(&sender_id)
            .map(std::mem::take)
            .unwrap_or(false);
        let _ = replier.send(RouterReply::Congestion(CongestionUpdate::new(
            current_latency,
            recently_missed,
        )));

        // Relay under our own sender stamp.
        let relayed = batch.relay(&self.keypair);
        self.start_gossip(relayed, false).await;
    }

    async fn handle_publication(&mut self, topic: String, body: Vec<u8>, signature: Vec<u8>) {
        // The response path first; anything else is an application publish.
        if let (Ok(response), Ok(parsed_signature)) = (
            serde_json::from_slice::<Response>(&body),
            serde_json::from_slice::<EcdsaSignature>(&signature),
        ) {
            if let Err(e) = response.verify(&parsed_signature) {
                warn!("{}", e);
                return;
            }
            let key = match response.key() {
                Ok(key) => key,
                Err(e) => {
                    warn!("{}", e);
                    return;
                }
            };
            let responder = response.creator.node_id();
            let state = self.states.entry(key).or_default();
            match response.message_type {
                ResponseKind::EchoResponse => state.echo_replies.insert(responder),
                ResponseKind::ReadyResponse => state.ready_replies.insert(responder),
            };
            state.publish_counts();
            return;
        }
        self.publications
            .push((topic, String::from_utf8_lossy(&body).to_string()));
    }

    async fn handle_feedback(&mut self, update: CongestionUpdate) {
        let _ = self
            .tx_congestion
            .send(CongestionEvent::PeerLatency(update.current_latency))
            .await;
        if update.recently_missed {
            let _ = self.tx_congestion.send(CongestionEvent::PeerMissed).await;
        }
    }

    async fn handle_originate(&mut self, gossips: Vec<Gossip>) {
        let batch = match SignedBatch::new(gossips, self.vector_clock.items(), &self.keypair) {
            Ok(batch) => batch,
            Err(e) => {
                warn!("Failed to build batch: {}", e);
                return;
            }
        };
        let key = batch.key();
        if self.received.contains_key(&key) {
            warn!("Batch {} is already in flight", key);
            return;
        }
        debug!(
            "Originating batch {} with {} gossips",
            key,
            batch.message.messages.len()
        );
        self.received.insert(key, batch.clone());
        self.states.entry(key).or_default();
        self.start_gossip(batch, true).await;
    }

    /// Select the samples, install the reply-count watch, subscribe to the
    /// batch topic and spawn the gossip task.
    async fn start_gossip(&mut self, batch: SignedBatch, origin: bool) {
        let key = batch.key();
        let ids = self.registry.ids();
        // The rng must not live across an await point.
        let samples = {
            let mut rng = rand::thread_rng();
            sampler::select(
                self.params.selection,
                &ids,
                self.at2.echo_sample_size(),
                &mut rng,
            )
            .and_then(|echo| {
                sampler::select(
                    self.params.selection,
                    &ids,
                    self.at2.ready_sample_size(),
                    &mut rng,
                )
                .map(|ready| (echo, ready))
            })
        };
        let (echo_sample, ready_sample) = match samples {
            Ok(samples) => samples,
            Err(e) => {
                warn!("Cannot gossip batch {}: {}", key, e);
                return;
            }
        };

        let (counts_tx, counts_rx) = watch::channel(ReplyCounts::default());
        let already_received = {
            let state = self.states.entry(key).or_default();
            state.echo_sample = echo_sample.clone();
            state.ready_sample = ready_sample.clone();
            state.counts = Some(counts_tx);
            state.publish_counts();
            state.already_received.clone()
        };

        if origin {
            let name = self.name.clone();
            self.vector_clock.increment(&name);
        }

        // Install the topic filter before requesting any feedback.
        self.subscriber.subscribe(messages::topic(key)).await;

        let channels = |sample: &HashSet<NodeId>| -> Vec<(NodeId, PeerChannel)> {
            sample
                .iter()
                .filter_map(|id| self.registry.channel(id).map(|c| (id.clone(), c)))
                .collect()
        };

        let echo_subscribe = Echo::new(EchoKind::EchoSubscribe, key, self.keypair.public());
        let ready_subscribe = Echo::new(EchoKind::ReadySubscribe, key, self.keypair.public());
        let ready_response = Response::new(ResponseKind::ReadyResponse, key, self.keypair.public());
        let task = GossipTask {
            key,
            echo_peers: channels(&echo_sample),
            ready_peers: channels(&ready_sample),
            already_received,
            counts: counts_rx,
            ready_threshold: self.at2.ready_threshold(),
            feedback_threshold: self.at2.feedback_threshold(),
            delivery_threshold: self.at2.delivery_threshold(),
            timeout: Duration::from_secs_f64(self.params.max_gossip_timeout),
            echo_subscribe: wire::echo(
                &self.name,
                &echo_subscribe,
                &echo_subscribe.sign(&self.keypair),
            ),
            ready_subscribe: wire::echo(
                &self.name,
                &ready_subscribe,
                &ready_subscribe.sign(&self.keypair),
            ),
            batch_frames: wire::batch(&self.name, &batch),
            ready_response: (
                messages::topic(key),
                String::from_utf8_lossy(&ready_response.canonical_bytes()).to_string(),
                serde_json::to_string(&ready_response.sign(&self.keypair))
                    .expect("Failed to serialize signature"),
            ),
            publisher: self.publisher.clone(),
            subscriber: self.subscriber.clone(),
            tx_core: self.tx_command.clone(),
        };
        tokio::spawn(task.run());
    }

    async fn handle_outcome(&mut self, outcome: GossipOutcome) {
        let _ = self
            .tx_congestion
            .send(CongestionEvent::OurLatency(outcome.latency))
            .await;

        if outcome.delivered {
            if let Some(batch) = self.received.get(&outcome.key) {
                let clock_values = batch.message.clock_values();
                if self.sequencer.insert(clock_values, outcome.key) {
                    if let Some(state) = self.states.get_mut(&outcome.key) {
                        state.delivered = true;
                    }
                    info!(
                        "Delivered batch {} ({} total)",
                        outcome.key,
                        self.sequencer.len()
                    );
                }
            }
        } else {
            // Missed thresholds taint every peer until the flag is consumed
            // by the next congestion reply.
            for id in self.registry.ids() {
                self.recently_missed.insert(id, true);
            }
        }
    }

    /// Sign and queue an echo or ready response on the batch topic.
    async fn publish_response(&mut self, kind: ResponseKind, key: BatchKey) {
        let response = Response::new(kind, key, self.keypair.public());
        let signature = response.sign(&self.keypair);
        self.publisher
            .queue(
                messages::topic(key),
                String::from_utf8_lossy(&response.canonical_bytes()).to_string(),
                serde_json::to_string(&signature).expect("Failed to serialize signature"),
            )
            .await;
    }

    fn snapshot(&self) -> NodeSnapshot {
        NodeSnapshot {
            name: self.name.clone(),
            peers: self.registry.ids(),
            delivered: self.sequencer.entries(),
            delivered_digest: self.sequencer.digest(),
            received_batches: self.received.len(),
            received_directs: self.received_directs.clone(),
            publications: self.publications.clone(),
            current_latency: self.cadence.borrow().batch_interval,
        }
    }
}
