use crate::congestion::Cadence;
use log::debug;
use messages::Gossip;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration, Instant};

/// Accumulates pending gossips and seals them into a batch on every tick.
/// The tick interval follows the congestion controller's batch cadence and
/// is reinstalled at each firing.
pub struct Batcher {
    /// Receives application gossips.
    rx_gossip: mpsc::Receiver<Gossip>,
    /// Delivers sealed batches to the broadcast engine.
    tx_batch: mpsc::Sender<Vec<Gossip>>,
    /// The cadence published by the congestion controller.
    cadence: watch::Receiver<Cadence>,
    /// Holds the gossips pending for the next batch.
    pending: Vec<Gossip>,
}

impl Batcher {
    pub fn spawn(
        rx_gossip: mpsc::Receiver<Gossip>,
        tx_batch: mpsc::Sender<Vec<Gossip>>,
        cadence: watch::Receiver<Cadence>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            Self {
                rx_gossip,
                tx_batch,
                cadence,
                pending: Vec::new(),
            }
            .run()
            .await;
        })
    }

    fn interval(&self) -> Duration {
        Duration::from_secs_f64(self.cadence.borrow().batch_interval)
    }

    async fn run(&mut self) {
        let timer = sleep(self.interval());
        tokio::pin!(timer);

        loop {
            tokio::select! {
                Some(gossip) = self.rx_gossip.recv() => {
                    self.pending.push(gossip);
                },

                // Seal whatever is pending, then reinstall the timer at the
                // current cadence.
                () = &mut timer => {
                    if !self.pending.is_empty() {
                        debug!("Sealing batch of {} gossips", self.pending.len());
                        let batch: Vec<Gossip> = self.pending.drain(..).collect();
                        self.tx_batch
                            .send(batch)
                            .await
                            .expect("Failed to deliver sealed batch");
                    }
                    timer.as_mut().reset(Instant::now() + self.interval());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::congestion::Cadence;
    use tokio::time::timeout;

    #[tokio::test]
    async fn seals_pending_gossips_on_tick() {
        let (tx_gossip, rx_gossip) = mpsc::channel(10);
        let (tx_batch, mut rx_batch) = mpsc::channel(10);
        let (_cadence_tx, cadence_rx) = watch::channel(Cadence {
            batch_interval: 0.05,
            publish_interval: 0.05,
        });
        Batcher::spawn(rx_gossip, tx_batch, cadence_rx);

        tx_gossip.send(Gossip::new(1)).await.unwrap();
        tx_gossip.send(Gossip::new(2)).await.unwrap();

        let batch = timeout(Duration::from_secs(2), rx_batch.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(batch.len(), 2);
    }

    #[tokio::test]
    async fn empty_ticks_seal_nothing() {
        let (_tx_gossip, rx_gossip) = mpsc::channel::<Gossip>(10);
        let (tx_batch, mut rx_batch) = mpsc::channel(10);
        let (_cadence_tx, cadence_rx) = watch::channel(Cadence {
            batch_interval: 0.02,
            publish_interval: 0.02,
        });
        Batcher::spawn(rx_gossip, tx_batch, cadence_rx);

        assert!(timeout(Duration::from_millis(200), rx_batch.recv())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn cadence_change_slows_the_next_tick() {
        let (tx_gossip, rx_gossip) = mpsc::channel(10);
        let (tx_batch, mut rx_batch) = mpsc::channel(10);
        let (cadence_tx, cadence_rx) = watch::channel(Cadence {
            batch_interval: 0.05,
            publish_interval: 0.05,
        });
        Batcher::spawn(rx_gossip, tx_batch, cadence_rx);

        tx_gossip.send(Gossip::new(1)).await.unwrap();
        assert!(timeout(Duration::from_secs(2), rx_batch.recv()).await.is_ok());

        // Reinstall a long cadence: the next gossip stays pending.
        cadence_tx
            .send(Cadence {
                batch_interval: 30.0,
                publish_interval: 0.05,
            })
            .unwrap();
        // Let the fast timer fire once more so the new interval is read.
        tokio::time::sleep(Duration::from_millis(120)).await;
        tx_gossip.send(Gossip::new(2)).await.unwrap();
        assert!(timeout(Duration::from_millis(300), rx_batch.recv())
            .await
            .is_err());
    }
}
