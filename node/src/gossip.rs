use crate::engine::{CoreCommand, GossipOutcome, ReplyCounts};
use crypto::NodeId;
use futures::future::join_all;
use log::{debug, warn};
use messages::error::BroadcastError;
use messages::{BatchKey, RouterReply};
use network::multipart::Frames;
use network::peer_channel::PeerChannel;
use network::publisher::PublisherHandle;
use network::subscriber::SubscriberHandle;
use std::collections::HashSet;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, Duration, Instant};

/// Poll cadence of the echo wait.
const ECHO_POLL: Duration = Duration::from_millis(250);
/// Poll cadence of the ready wait.
const READY_POLL: Duration = Duration::from_millis(100);

/// Drives one batch through the echo and ready phases. The engine owns all
/// reply bookkeeping; this task observes the sample-intersection counts
/// through a watch channel and reports its outcome back on the command
/// channel.
pub struct GossipTask {
    pub key: BatchKey,
    pub echo_peers: Vec<(NodeId, PeerChannel)>,
    pub ready_peers: Vec<(NodeId, PeerChannel)>,
    pub already_received: HashSet<NodeId>,
    pub counts: watch::Receiver<ReplyCounts>,
    pub ready_threshold: usize,
    pub feedback_threshold: usize,
    pub delivery_threshold: usize,
    pub timeout: Duration,
    pub echo_subscribe: Frames,
    pub ready_subscribe: Frames,
    pub batch_frames: Frames,
    /// Pre-signed ReadyResponse, queued on echo success.
    pub ready_response: (String, String, String),
    pub publisher: PublisherHandle,
    pub subscriber: SubscriberHandle,
    pub tx_core: mpsc::Sender<CoreCommand>,
}

/// Send one request on a peer channel and parse the single reply frame.
async fn request(
    id: NodeId,
    channel: PeerChannel,
    frames: Frames,
) -> (NodeId, Option<RouterReply>) {
    match channel.send(frames).await {
        Ok(reply) => match RouterReply::from_frame(&reply) {
            Ok(parsed) => (id, Some(parsed)),
            Err(e) => {
                warn!("{}", e);
                (id, None)
            }
        },
        Err(e) => {
            // The channel already exhausted its bounded retry budget; the
            // broadcast continues under its own timeout.
            warn!("{}", e);
            (id, None)
        }
    }
}

impl GossipTask {
    pub async fn run(mut self) {
        self.subscribe_samples().await;

        // Push the full batch unless the ready phase is already fed.
        if self.counts.borrow().ready < self.feedback_threshold {
            self.push_batch().await;
        }

        // Echo wait: poll until enough of the echo sample replied.
        let echo_start = Instant::now();
        let echo_success = loop {
            if self.counts.borrow().echo >= self.ready_threshold {
                break true;
            }
            if echo_start.elapsed() >= self.timeout {
                break false;
            }
            sleep(ECHO_POLL).await;
        };
        let retry_time_echo = echo_start.elapsed();

        if echo_success {
            let (topic, body, signature) = self.ready_response.clone();
            self.publisher.queue(topic, body, signature).await;
            debug!("Echo phase complete for batch {}", self.key);
        } else {
            warn!("{}", BroadcastError::EchoFailure(self.key));
        }

        // Ready wait: poll until enough of the ready sample replied. An echo
        // failure aborts this phase outright.
        let ready_start = Instant::now();
        let delivered = if echo_success {
            loop {
                if self.counts.borrow().ready >= self.delivery_threshold {
                    break true;
                }
                if ready_start.elapsed() >= self.timeout {
                    warn!("{}", BroadcastError::ReadyFailure(self.key));
                    break false;
                }
                sleep(READY_POLL).await;
            }
        } else {
            false
        };
        let retry_time_ready = if echo_success {
            ready_start.elapsed()
        } else {
            Duration::ZERO
        };

        let outcome = GossipOutcome {
            key: self.key,
            delivered,
            echo_failed: !echo_success,
            latency: (retry_time_echo + retry_time_ready).as_secs_f64(),
        };
        let _ = self.tx_core.send(CoreCommand::Outcome(outcome)).await;

        // Drop the topic filter; the subscription connections stay open.
        self.subscriber.unsubscribe(messages::topic(self.key)).await;
    }

    /// Ask every sampled peer for its echo or ready feedback. Replies may
    /// advertise that the peer already holds the batch.
    async fn subscribe_samples(&mut self) {
        let requests: Vec<_> = self
            .echo_peers
            .iter()
            .map(|(id, channel)| (id.clone(), channel.clone(), self.echo_subscribe.clone()))
            .chain(
                self.ready_peers
                    .iter()
                    .map(|(id, channel)| (id.clone(), channel.clone(), self.ready_subscribe.clone())),
            )
            .collect();
        let replies = join_all(
            requests
                .into_iter()
                .map(|(id, channel, frames)| request(id, channel, frames)),
        )
        .await;
        for (id, reply) in replies {
            if matches!(reply, Some(RouterReply::AlreadyReceived)) {
                self.already_received.insert(id.clone());
                let _ = self
                    .tx_core
                    .send(CoreCommand::AlreadyHeld(self.key, id))
                    .await;
            }
        }
    }

    /// Push the full batch to the echo sample, skipping peers that already
    /// advertised holding it. Router replies carry congestion feedback.
    async fn push_batch(&mut self) {
        let targets: Vec<_> = self
            .echo_peers
            .iter()
            .filter(|(id, _)| !self.already_received.contains(id))
            .map(|(id, channel)| (id.clone(), channel.clone()))
            .collect();
        let frames = self.batch_frames.clone();
        let replies = join_all(
            targets
                .into_iter()
                .map(|(id, channel)| request(id, channel, frames.clone())),
        )
        .await;
        for (id, reply) in replies {
            match reply {
                Some(RouterReply::Congestion(update)) => {
                    let _ = self
                        .tx_core
                        .send(CoreCommand::PeerFeedback(update))
                        .await;
                }
                Some(RouterReply::AlreadyReceived) => {
                    self.already_received.insert(id.clone());
                    let _ = self
                        .tx_core
                        .send(CoreCommand::AlreadyHeld(self.key, id))
                        .await;
                }
                _ => (),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use network::publisher::Publisher;
    use network::subscriber::Subscriber;
    use tokio::time::timeout;

    fn task(
        counts: watch::Receiver<ReplyCounts>,
        budget: Duration,
        port: u16,
        tx_core: mpsc::Sender<CoreCommand>,
    ) -> GossipTask {
        let publisher = Publisher::spawn(
            format!("127.0.0.1:{}", port).parse().unwrap(),
            /* interval */ 0.05,
        );
        let (tx_publication, _rx_publication) = mpsc::channel(10);
        let subscriber = Subscriber::spawn(tx_publication);
        GossipTask {
            key: 99,
            echo_peers: Vec::new(),
            ready_peers: Vec::new(),
            already_received: HashSet::new(),
            counts,
            ready_threshold: 1,
            feedback_threshold: 2,
            delivery_threshold: 3,
            timeout: budget,
            echo_subscribe: Vec::new(),
            ready_subscribe: Vec::new(),
            batch_frames: Vec::new(),
            ready_response: ("99".to_string(), "body".to_string(), "sig".to_string()),
            publisher,
            subscriber,
            tx_core,
        }
    }

    #[tokio::test]
    async fn echo_timeout_reports_failure() {
        let (_counts_tx, counts_rx) = watch::channel(ReplyCounts::default());
        let (tx_core, mut rx_core) = mpsc::channel(10);
        let budget = Duration::from_millis(300);
        tokio::spawn(task(counts_rx, budget, 9200, tx_core).run());

        // No echo replies ever arrive: the task must fail the echo phase at
        // the timeout boundary and skip the ready wait.
        let command = timeout(Duration::from_secs(5), rx_core.recv())
            .await
            .unwrap()
            .unwrap();
        match command {
            CoreCommand::Outcome(outcome) => {
                assert!(!outcome.delivered);
                assert!(outcome.echo_failed);
                assert!(outcome.latency >= budget.as_secs_f64());
            }
            _ => panic!("Unexpected engine command"),
        }
    }

    #[tokio::test]
    async fn satisfied_thresholds_deliver() {
        let (_counts_tx, counts_rx) = watch::channel(ReplyCounts { echo: 1, ready: 3 });
        let (tx_core, mut rx_core) = mpsc::channel(10);
        tokio::spawn(task(counts_rx, Duration::from_secs(5), 9201, tx_core).run());

        let command = timeout(Duration::from_secs(5), rx_core.recv())
            .await
            .unwrap()
            .unwrap();
        match command {
            CoreCommand::Outcome(outcome) => {
                assert!(outcome.delivered);
                assert!(!outcome.echo_failed);
            }
            _ => panic!("Unexpected engine command"),
        }
    }
}

