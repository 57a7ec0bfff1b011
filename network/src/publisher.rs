use crate::multipart;
use futures::sink::SinkExt;
use log::{debug, info, warn};
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration, Instant};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

/// The capacity of the command queue feeding the publisher task.
const CHANNEL_CAPACITY: usize = 1_000;

/// A single queued response: topic, body and signature.
pub type Part = (String, String, String);

enum PublisherCommand {
    Queue(Part),
    SetInterval(f64),
}

/// Handle to the publisher task.
#[derive(Clone)]
pub struct PublisherHandle {
    tx: mpsc::Sender<PublisherCommand>,
}

impl PublisherHandle {
    /// Queue a response for the next flush.
    pub async fn queue(&self, topic: String, body: String, signature: String) {
        self.tx
            .send(PublisherCommand::Queue((topic, body, signature)))
            .await
            .expect("Failed to reach the publisher task");
    }

    /// Reinstall the flush timer at a new interval (seconds), effective from
    /// its next firing.
    pub async fn set_interval(&self, interval: f64) {
        self.tx
            .send(PublisherCommand::SetInterval(interval))
            .await
            .expect("Failed to reach the publisher task");
    }
}

/// The publisher endpoint. Pending responses are batched and flushed
/// periodically as one multipart unit `[topics, bodies, signatures]`, each
/// frame a `|`-separated concatenation with matching cardinality.
pub struct Publisher {
    address: SocketAddr,
    rx: mpsc::Receiver<PublisherCommand>,
    subscribers: Vec<Framed<TcpStream, LengthDelimitedCodec>>,
    pending: Vec<Part>,
    interval: f64,
}

impl Publisher {
    pub fn spawn(address: SocketAddr, interval: f64) -> PublisherHandle {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        tokio::spawn(async move {
            Self {
                address,
                rx,
                subscribers: Vec::new(),
                pending: Vec::new(),
                interval,
            }
            .run()
            .await;
        });
        PublisherHandle { tx }
    }

    async fn run(&mut self) {
        let listener = TcpListener::bind(&self.address)
            .await
            .unwrap_or_else(|e| panic!("Failed to bind publisher address {}: {}", self.address, e));
        info!("Publishing on {}", self.address);

        let timer = sleep(Duration::from_secs_f64(self.interval));
        tokio::pin!(timer);

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((socket, peer)) => {
                        debug!("Subscriber connection established with {}", peer);
                        self.subscribers.push(Framed::new(socket, LengthDelimitedCodec::new()));
                    }
                    Err(e) => warn!("Failed to accept subscriber connection: {}", e),
                },

                Some(command) = self.rx.recv() => match command {
                    PublisherCommand::Queue(part) => self.pending.push(part),
                    PublisherCommand::SetInterval(interval) => self.interval = interval,
                },

                () = &mut timer => {
                    self.flush().await;
                    timer.as_mut().reset(Instant::now() + Duration::from_secs_f64(self.interval));
                }
            }
        }
    }

    /// Write every pending response to every subscriber in one flush.
    async fn flush(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let parts: Vec<Part> = self.pending.drain(..).collect();
        let topics: Vec<&str> = parts.iter().map(|(t, _, _)| t.as_str()).collect();
        let bodies: Vec<&str> = parts.iter().map(|(_, b, _)| b.as_str()).collect();
        let signatures: Vec<&str> = parts.iter().map(|(_, _, s)| s.as_str()).collect();
        let frames = vec![
            topics.join("|").into_bytes(),
            bodies.join("|").into_bytes(),
            signatures.join("|").into_bytes(),
        ];
        let payload = multipart::encode(&frames);

        let mut alive = Vec::with_capacity(self.subscribers.len());
        for mut subscriber in self.subscribers.drain(..) {
            match subscriber.send(payload.clone()).await {
                Ok(()) => alive.push(subscriber),
                Err(e) => debug!("Dropping subscriber connection: {}", e),
            }
        }
        self.subscribers = alive;
    }
}
