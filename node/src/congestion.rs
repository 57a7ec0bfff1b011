use crate::smoothing::{rsi, savgol};
use config::NodeParameters;
use log::{debug, info};
use network::publisher::PublisherHandle;
use rand::Rng;
use std::collections::VecDeque;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, Duration, Instant};

/// Capacity of the latency windows.
const WINDOW_CAPACITY: usize = 100;
/// Savitzky-Golay window and RSI period of the increase monitor.
const INCREASE_WINDOW: usize = 14;
/// Savitzky-Golay window and RSI period of the decrease monitor.
const DECREASE_WINDOW: usize = 21;
/// The decrease monitor stays quiet until this many samples arrived.
const DECREASE_MIN_SAMPLES: usize = 45;
/// Base periods of the two monitors (seconds).
const INCREASE_PERIOD: f64 = 5.0;
const DECREASE_PERIOD: f64 = 10.0;

/// Latency observations and control signals fed to the controller.
#[derive(Debug)]
pub enum CongestionEvent {
    /// End-to-end latency of a broadcast we just drove.
    OurLatency(f64),
    /// Latency a peer reported in its router reply.
    PeerLatency(f64),
    /// A peer advertised a recently missed delivery.
    PeerMissed,
    /// Freeze both cadences (used by experiments and tests).
    Pause,
}

/// The two cadences the controller tunes, in seconds.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Cadence {
    /// Interval between batch builder flushes.
    pub batch_interval: f64,
    /// Interval between response-publish flushes.
    pub publish_interval: f64,
}

/// Pure congestion-control state: rolling latency windows plus the two
/// cadences derived from them.
pub struct CongestionController {
    params: NodeParameters,
    our_latency: VecDeque<f64>,
    peers_latency: VecDeque<f64>,
    current_latency: f64,
    publish_frequency: f64,
    paused: bool,
}

impl CongestionController {
    pub fn new(params: NodeParameters) -> Self {
        let current_latency = params.initial_latency;
        let publish_frequency = params.publish_frequency;
        Self {
            params,
            our_latency: VecDeque::with_capacity(WINDOW_CAPACITY),
            peers_latency: VecDeque::with_capacity(WINDOW_CAPACITY),
            current_latency,
            publish_frequency,
            paused: false,
        }
    }

    pub fn record_our_latency(&mut self, latency: f64) {
        if self.our_latency.len() == WINDOW_CAPACITY {
            self.our_latency.pop_front();
        }
        self.our_latency.push_back(latency);
    }

    pub fn record_peer_latency(&mut self, latency: f64) {
        if self.peers_latency.len() == WINDOW_CAPACITY {
            self.peers_latency.pop_front();
        }
        self.peers_latency.push_back(latency);
    }

    pub fn pause(&mut self) {
        self.paused = true;
    }

    pub fn current_latency(&self) -> f64 {
        self.current_latency
    }

    pub fn cadence(&self) -> Cadence {
        Cadence {
            batch_interval: self.current_latency,
            publish_interval: self.publish_frequency,
        }
    }

    /// Whether a candidate cadence leaves both waits of a broadcast inside
    /// the gossip timeout.
    fn headroom(&self, candidate: f64) -> bool {
        2.0 * candidate < 0.85 * self.params.max_gossip_timeout
    }

    /// React to a peer-reported missed delivery: back off by one second
    /// immediately if headroom remains.
    pub fn peer_missed(&mut self) -> bool {
        if self.paused {
            return false;
        }
        let candidate = self.current_latency + 1.0;
        if self.headroom(candidate) {
            self.current_latency = candidate;
            return true;
        }
        false
    }

    fn weighted(&self, window: usize) -> Option<(f64, f64, f64)> {
        if self.our_latency.len() < 2 || self.peers_latency.len() < 2 {
            return None;
        }
        let ours: Vec<f64> = self.our_latency.iter().copied().collect();
        let peers: Vec<f64> = self.peers_latency.iter().copied().collect();
        let our_smooth = savgol(&ours, window);
        let peers_smooth = savgol(&peers, window);
        let weighted = 0.6 * our_smooth[our_smooth.len() - 1]
            + 0.4 * peers_smooth[peers_smooth.len() - 1];
        let our_rsi = rsi(&our_smooth, window);
        let peers_rsi = rsi(&peers_smooth, window);
        Some((weighted, our_rsi, peers_rsi))
    }

    /// One pass of the increase monitor. Returns true when a cadence changed.
    pub fn increase_pass(&mut self) -> bool {
        if self.paused {
            return false;
        }
        let (weighted, our_rsi, peers_rsi) = match self.weighted(INCREASE_WINDOW) {
            Some(values) => values,
            None => return false,
        };

        // Fast-forward: the smoothed network latency sits at or below half
        // the cadence and doubling still fits the gossip timeout.
        if weighted <= self.current_latency / 2.0 && self.headroom(2.0 * self.current_latency) {
            self.current_latency *= 2.0;
            return true;
        }

        // Both trends overbought and latency at or above target: back off by
        // a small random factor, dragging the publish cadence along.
        if our_rsi > 70.0 && peers_rsi > 70.0 && weighted >= self.params.target_latency {
            let factor = rand::thread_rng().gen_range(1.01..=1.10);
            let candidate = self.current_latency * factor;
            if self.headroom(candidate) {
                self.current_latency = candidate;
                self.publish_frequency =
                    (self.publish_frequency * factor).min(self.params.max_publishing_frequency);
                return true;
            }
        }
        false
    }

    /// One pass of the decrease monitor. Returns true when a cadence changed.
    pub fn decrease_pass(&mut self) -> bool {
        if self.paused || self.our_latency.len() < DECREASE_MIN_SAMPLES {
            return false;
        }
        let (_, our_rsi, peers_rsi) = match self.weighted(DECREASE_WINDOW) {
            Some(values) => values,
            None => return false,
        };
        if our_rsi < 30.0 && peers_rsi < 30.0 && peers_rsi > 0.0 {
            let factor = rand::thread_rng().gen_range(0.90..=0.99);
            let candidate = self.current_latency * factor;
            if candidate > self.params.minimum_latency {
                self.current_latency = candidate;
                self.publish_frequency =
                    (self.publish_frequency * factor).max(self.params.minimum_latency);
                return true;
            }
        }
        false
    }
}

/// The controller task: applies latency events, runs the two monitors on
/// jittered timers, and reinstalls the batcher and publisher cadences when
/// they change.
pub struct CongestionMonitor {
    controller: CongestionController,
    rx_event: mpsc::Receiver<CongestionEvent>,
    cadence_tx: watch::Sender<Cadence>,
    publisher: PublisherHandle,
}

impl CongestionMonitor {
    pub fn spawn(
        params: NodeParameters,
        rx_event: mpsc::Receiver<CongestionEvent>,
        publisher: PublisherHandle,
    ) -> watch::Receiver<Cadence> {
        let controller = CongestionController::new(params);
        let (cadence_tx, cadence_rx) = watch::channel(controller.cadence());
        tokio::spawn(async move {
            Self {
                controller,
                rx_event,
                cadence_tx,
                publisher,
            }
            .run()
            .await;
        });
        cadence_rx
    }

    /// Base period plus the 0.1-2.5 s jitter of the monitors.
    fn jittered(period: f64) -> Duration {
        Duration::from_secs_f64(period + rand::thread_rng().gen_range(0.1..=2.5))
    }

    async fn apply(&mut self) {
        let cadence = self.controller.cadence();
        info!(
            "Cadence changed: batch every {:.2}s, publish every {:.2}s",
            cadence.batch_interval, cadence.publish_interval
        );
        let _ = self.cadence_tx.send(cadence);
        self.publisher.set_interval(cadence.publish_interval).await;
    }

    async fn run(&mut self) {
        let increase = sleep(Self::jittered(INCREASE_PERIOD));
        tokio::pin!(increase);
        let decrease = sleep(Self::jittered(DECREASE_PERIOD));
        tokio::pin!(decrease);

        loop {
            tokio::select! {
                Some(event) = self.rx_event.recv() => match event {
                    CongestionEvent::OurLatency(latency) => {
                        self.controller.record_our_latency(latency);
                    }
                    CongestionEvent::PeerLatency(latency) => {
                        self.controller.record_peer_latency(latency);
                    }
                    CongestionEvent::PeerMissed => {
                        if self.controller.peer_missed() {
                            self.apply().await;
                        }
                    }
                    CongestionEvent::Pause => {
                        debug!("Congestion control paused");
                        self.controller.pause();
                    }
                },

                () = &mut increase => {
                    if self.controller.increase_pass() {
                        self.apply().await;
                    }
                    increase.as_mut().reset(Instant::now() + Self::jittered(INCREASE_PERIOD));
                }

                () = &mut decrease => {
                    if self.controller.decrease_pass() {
                        self.apply().await;
                    }
                    decrease.as_mut().reset(Instant::now() + Self::jittered(DECREASE_PERIOD));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> NodeParameters {
        NodeParameters::default()
    }

    #[test]
    fn fast_forward_doubles_the_cadence() {
        let mut controller = CongestionController::new(params());
        for _ in 0..20 {
            controller.record_our_latency(0.1);
            controller.record_peer_latency(0.1);
        }
        assert_eq!(controller.current_latency(), 5.0);

        assert!(controller.increase_pass());
        assert_eq!(controller.current_latency(), 10.0);
        assert_eq!(controller.cadence().batch_interval, 10.0);
    }

    #[test]
    fn fast_forward_respects_the_timeout_headroom() {
        // Doubling 30 s would burst through 0.85 * 60 s.
        let mut custom = params();
        custom.initial_latency = 30.0;
        let mut controller = CongestionController::new(custom);
        for _ in 0..20 {
            controller.record_our_latency(0.1);
            controller.record_peer_latency(0.1);
        }
        assert!(!controller.increase_pass());
        assert_eq!(controller.current_latency(), 30.0);
    }

    #[test]
    fn increase_backs_off_on_overbought_trends() {
        let mut custom = params();
        custom.initial_latency = 4.0;
        custom.target_latency = 2.0;
        let mut controller = CongestionController::new(custom);
        // Steadily climbing latencies well above target keep both RSIs high
        // without triggering the fast-forward branch.
        for i in 0..60 {
            let latency = 3.0 + 0.05 * i as f64;
            controller.record_our_latency(latency);
            controller.record_peer_latency(latency);
        }
        let before = controller.current_latency();
        assert!(controller.increase_pass());
        let after = controller.current_latency();
        assert!(after > before * 1.009 && after < before * 1.101);
    }

    #[test]
    fn decrease_needs_enough_samples() {
        let mut controller = CongestionController::new(params());
        for _ in 0..20 {
            controller.record_our_latency(1.0);
            controller.record_peer_latency(1.0);
        }
        assert!(!controller.decrease_pass());
    }

    #[test]
    fn decrease_shrinks_on_oversold_trends() {
        let mut custom = params();
        custom.initial_latency = 8.0;
        let mut controller = CongestionController::new(custom);
        // A falling series with small periodic upticks keeps both RSIs low
        // but strictly positive.
        for i in 0..60 {
            let uptick = if i % 7 == 0 { 1.0 } else { 0.0 };
            let latency = 8.0 - 0.08 * i as f64 + uptick;
            controller.record_our_latency(latency);
            controller.record_peer_latency(latency);
        }
        let before = controller.current_latency();
        assert!(controller.decrease_pass());
        let after = controller.current_latency();
        assert!(after < before && after > before * 0.89);
    }

    #[test]
    fn peer_missed_bumps_by_one_second() {
        let mut controller = CongestionController::new(params());
        assert!(controller.peer_missed());
        assert_eq!(controller.current_latency(), 6.0);
    }

    #[test]
    fn paused_controller_never_changes_cadence() {
        let mut controller = CongestionController::new(params());
        for _ in 0..50 {
            controller.record_our_latency(0.1);
            controller.record_peer_latency(0.1);
        }
        controller.pause();
        assert!(!controller.increase_pass());
        assert!(!controller.peer_missed());
        assert!(!controller.decrease_pass());
        assert_eq!(controller.current_latency(), 5.0);
    }
}
