use crate::error::NetworkError;
use crate::multipart;
use futures::stream::StreamExt;
use log::{debug, warn};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep, timeout, Duration};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

/// How many times to attempt a connection before giving up.
const CONNECT_ATTEMPTS: usize = 50;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// The capacity of the command and output queues.
const CHANNEL_CAPACITY: usize = 1_000;

/// One response received from a publisher flush: topic, body, signature.
pub type Publication = (String, Vec<u8>, Vec<u8>);

enum SubscriberCommand {
    Connect(SocketAddr),
    Subscribe(String, oneshot::Sender<()>),
    Unsubscribe(String),
}

/// Handle to the subscriber task.
#[derive(Clone)]
pub struct SubscriberHandle {
    tx: mpsc::Sender<SubscriberCommand>,
}

impl SubscriberHandle {
    /// Connect to a publisher endpoint. The connection is shared by every
    /// topic and stays open for the run.
    pub async fn connect(&self, address: SocketAddr) {
        self.tx
            .send(SubscriberCommand::Connect(address))
            .await
            .expect("Failed to reach the subscriber task");
    }

    /// Add a topic filter; resolves once the filter is installed.
    pub async fn subscribe(&self, topic: String) {
        let (sender, receiver) = oneshot::channel();
        self.tx
            .send(SubscriberCommand::Subscribe(topic, sender))
            .await
            .expect("Failed to reach the subscriber task");
        receiver.await.expect("Failed to install topic filter");
    }

    /// Remove a topic filter. The underlying connections stay open.
    pub async fn unsubscribe(&self, topic: String) {
        self.tx
            .send(SubscriberCommand::Unsubscribe(topic))
            .await
            .expect("Failed to reach the subscriber task");
    }
}

/// The subscriber half of the pub/sub plane: one shared set of connections
/// to every known publisher, filtered by a local topic set.
pub struct Subscriber {
    rx: mpsc::Receiver<SubscriberCommand>,
    tx_output: mpsc::Sender<Publication>,
    topics: Arc<RwLock<HashSet<String>>>,
    connected: HashSet<SocketAddr>,
}

impl Subscriber {
    /// Spawn the subscriber task. Matching publications are forwarded on the
    /// returned channel's counterpart `tx_output`.
    pub fn spawn(tx_output: mpsc::Sender<Publication>) -> SubscriberHandle {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        tokio::spawn(async move {
            Self {
                rx,
                tx_output,
                topics: Arc::new(RwLock::new(HashSet::new())),
                connected: HashSet::new(),
            }
            .run()
            .await;
        });
        SubscriberHandle { tx }
    }

    async fn run(&mut self) {
        while let Some(command) = self.rx.recv().await {
            match command {
                SubscriberCommand::Connect(address) => {
                    if self.connected.insert(address) {
                        let topics = self.topics.clone();
                        let tx_output = self.tx_output.clone();
                        tokio::spawn(async move {
                            Self::listen(address, topics, tx_output).await;
                        });
                    }
                }
                SubscriberCommand::Subscribe(topic, ack) => {
                    self.topics
                        .write()
                        .expect("Topic filter lock poisoned")
                        .insert(topic);
                    let _ = ack.send(());
                }
                SubscriberCommand::Unsubscribe(topic) => {
                    self.topics
                        .write()
                        .expect("Topic filter lock poisoned")
                        .remove(&topic);
                }
            }
        }
    }

    /// Read flushes from one publisher, split the `|`-separated frames, and
    /// forward the parts matching our topic filters.
    async fn listen(
        address: SocketAddr,
        topics: Arc<RwLock<HashSet<String>>>,
        tx_output: mpsc::Sender<Publication>,
    ) {
        let mut attempts = 0;
        let stream = loop {
            match timeout(CONNECT_TIMEOUT, TcpStream::connect(address)).await {
                Ok(Ok(stream)) => break stream,
                _ => {
                    attempts += 1;
                    if attempts >= CONNECT_ATTEMPTS {
                        warn!("{}", NetworkError::FailedToConnect(address, CONNECT_ATTEMPTS));
                        return;
                    }
                    sleep(CONNECT_TIMEOUT).await;
                }
            }
        };
        debug!("Subscribed to publisher {}", address);

        let mut transport = Framed::new(stream, LengthDelimitedCodec::new());
        while let Some(unit) = transport.next().await {
            let frames = match unit {
                Ok(bytes) => match multipart::decode(&bytes) {
                    Ok(frames) => frames,
                    Err(e) => {
                        warn!("{}", e);
                        continue;
                    }
                },
                Err(e) => {
                    warn!("{}", NetworkError::FailedToReceive(address, e));
                    break;
                }
            };
            if frames.len() != 3 {
                warn!("Publisher flush with {} frames instead of 3", frames.len());
                continue;
            }

            let split = |frame: &[u8]| -> Vec<String> {
                String::from_utf8_lossy(frame)
                    .split('|')
                    .filter(|part| !part.is_empty())
                    .map(|part| part.to_string())
                    .collect()
            };
            let topics_frame = split(&frames[0]);
            let bodies_frame = split(&frames[1]);
            let signatures_frame = split(&frames[2]);

            for (index, topic) in topics_frame.iter().enumerate() {
                let wanted = topics
                    .read()
                    .expect("Topic filter lock poisoned")
                    .contains(topic);
                if !wanted {
                    continue;
                }
                let body = match bodies_frame.get(index) {
                    Some(body) => body.clone().into_bytes(),
                    None => continue,
                };
                let signature = signatures_frame
                    .get(index)
                    .map(|s| s.clone().into_bytes())
                    .unwrap_or_default();
                if tx_output.send((topic.clone(), body, signature)).await.is_err() {
                    return;
                }
            }
        }
        debug!("Publisher {} disconnected", address);
    }
}
