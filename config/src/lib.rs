use crypto::{KeyPair, NodeId};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::convert::TryFrom;
use std::fs::{self, OpenOptions};
use std::io::{BufWriter, Write as _};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{file}': {message}")]
    ImportError { file: String, message: String },

    #[error("Failed to write config file '{file}': {message}")]
    ExportError { file: String, message: String },

    #[error("Invalid broadcast configuration: {0}")]
    InvalidThresholds(String),
}

/// Read from file a configuration.
pub trait Import: DeserializeOwned {
    fn import(path: &str) -> Result<Self, ConfigError> {
        let reader = || -> Result<Self, std::io::Error> {
            let data = fs::read(path)?;
            Ok(serde_json::from_slice(data.as_slice())?)
        };
        reader().map_err(|e| ConfigError::ImportError {
            file: path.to_string(),
            message: e.to_string(),
        })
    }
}

/// Write to file a configuration (in JSON format).
pub trait Export: Serialize {
    fn export(&self, path: &str) -> Result<(), ConfigError> {
        let writer = || -> Result<(), std::io::Error> {
            let file = OpenOptions::new().create(true).write(true).open(path)?;
            let mut writer = BufWriter::new(file);
            let data = serde_json::to_string_pretty(self).unwrap();
            writer.write_all(data.as_ref())?;
            writer.write_all(b"\n")?;
            Ok(())
        };
        writer().map_err(|e| ConfigError::ExportError {
            file: path.to_string(),
            message: e.to_string(),
        })
    }
}

/// Sample sizes and reply thresholds of the echo/ready/deliver protocol.
/// The thresholds are validated once, at construction.
#[derive(Clone, Copy, Serialize, Deserialize)]
#[serde(try_from = "RawAt2Configuration")]
pub struct AT2Configuration {
    echo_sample_size: usize,
    ready_sample_size: usize,
    delivery_sample_size: usize,
    ready_threshold: usize,
    feedback_threshold: usize,
    delivery_threshold: usize,
}

#[derive(Deserialize)]
struct RawAt2Configuration {
    echo_sample_size: usize,
    ready_sample_size: usize,
    delivery_sample_size: usize,
    ready_threshold: usize,
    feedback_threshold: usize,
    delivery_threshold: usize,
}

impl TryFrom<RawAt2Configuration> for AT2Configuration {
    type Error = ConfigError;

    fn try_from(raw: RawAt2Configuration) -> Result<Self, Self::Error> {
        Self::new(
            raw.echo_sample_size,
            raw.ready_sample_size,
            raw.delivery_sample_size,
            raw.ready_threshold,
            raw.feedback_threshold,
            raw.delivery_threshold,
        )
    }
}

impl AT2Configuration {
    pub fn new(
        echo_sample_size: usize,
        ready_sample_size: usize,
        delivery_sample_size: usize,
        ready_threshold: usize,
        feedback_threshold: usize,
        delivery_threshold: usize,
    ) -> Result<Self, ConfigError> {
        // Earlier thresholds must be strictly lower than later thresholds.
        if !(ready_threshold < feedback_threshold && feedback_threshold < delivery_threshold) {
            return Err(ConfigError::InvalidThresholds(format!(
                "thresholds must increase strictly: {} < {} < {}",
                ready_threshold, feedback_threshold, delivery_threshold
            )));
        }

        // The ready threshold needs a majority of the echo sample.
        let majority = (echo_sample_size + 1) / 2 + 1;
        if ready_threshold < majority {
            return Err(ConfigError::InvalidThresholds(format!(
                "ready_threshold {} is below the echo sample majority {}",
                ready_threshold, majority
            )));
        }

        // The feedback threshold needs at least 75% of the ready sample.
        let feedback_floor = (ready_sample_size as f64 * 0.75).ceil() as usize;
        if feedback_threshold < feedback_floor {
            return Err(ConfigError::InvalidThresholds(format!(
                "feedback_threshold {} is below 75% of the ready sample ({})",
                feedback_threshold, feedback_floor
            )));
        }

        // The delivery threshold needs at least 85% of the delivery sample.
        let delivery_floor = (delivery_sample_size as f64 * 0.85).ceil() as usize;
        if delivery_threshold < delivery_floor {
            return Err(ConfigError::InvalidThresholds(format!(
                "delivery_threshold {} is below 85% of the delivery sample ({})",
                delivery_threshold, delivery_floor
            )));
        }

        Ok(Self {
            echo_sample_size,
            ready_sample_size,
            delivery_sample_size,
            ready_threshold,
            feedback_threshold,
            delivery_threshold,
        })
    }

    pub fn echo_sample_size(&self) -> usize {
        self.echo_sample_size
    }

    pub fn ready_sample_size(&self) -> usize {
        self.ready_sample_size
    }

    pub fn delivery_sample_size(&self) -> usize {
        self.delivery_sample_size
    }

    pub fn ready_threshold(&self) -> usize {
        self.ready_threshold
    }

    pub fn feedback_threshold(&self) -> usize {
        self.feedback_threshold
    }

    pub fn delivery_threshold(&self) -> usize {
        self.delivery_threshold
    }
}

impl Import for AT2Configuration {}

impl std::fmt::Debug for AT2Configuration {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> Result<(), std::fmt::Error> {
        write!(
            f,
            "AT2({}/{}/{}, {}<{}<{})",
            self.echo_sample_size,
            self.ready_sample_size,
            self.delivery_sample_size,
            self.ready_threshold,
            self.feedback_threshold,
            self.delivery_threshold
        )
    }
}

/// The sample selection algorithm used to draw echo and ready samples.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SelectionStrategy {
    Normal,
    Random,
    Poisson,
}

impl Default for SelectionStrategy {
    fn default() -> Self {
        SelectionStrategy::Normal
    }
}

/// Timing and congestion-control parameters of a node. All durations are in
/// seconds.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeParameters {
    /// Upper bound on each of the echo and ready waits of a broadcast.
    #[serde(default = "default_max_gossip_timeout")]
    pub max_gossip_timeout: f64,
    /// Initial interval between batch builder flushes.
    #[serde(default = "default_initial_latency")]
    pub initial_latency: f64,
    /// Initial interval between response-publish flushes.
    #[serde(default = "default_publish_frequency")]
    pub publish_frequency: f64,
    /// Floor applied when the congestion controller scales cadences down.
    #[serde(default = "default_minimum_latency")]
    pub minimum_latency: f64,
    /// Smoothed latency above which the increase monitor starts backing off.
    #[serde(default = "default_target_latency")]
    pub target_latency: f64,
    /// Cap on the response-publish interval.
    #[serde(default = "default_max_publishing_frequency")]
    pub max_publishing_frequency: f64,
    /// Sample selection algorithm.
    #[serde(default)]
    pub selection: SelectionStrategy,
}

fn default_max_gossip_timeout() -> f64 {
    60.0
}

fn default_initial_latency() -> f64 {
    5.0
}

fn default_publish_frequency() -> f64 {
    0.25
}

fn default_minimum_latency() -> f64 {
    0.1
}

fn default_target_latency() -> f64 {
    2.0
}

fn default_max_publishing_frequency() -> f64 {
    2.0
}

impl Default for NodeParameters {
    fn default() -> Self {
        Self {
            max_gossip_timeout: default_max_gossip_timeout(),
            initial_latency: default_initial_latency(),
            publish_frequency: default_publish_frequency(),
            minimum_latency: default_minimum_latency(),
            target_latency: default_target_latency(),
            max_publishing_frequency: default_max_publishing_frequency(),
            selection: SelectionStrategy::default(),
        }
    }
}

impl Import for NodeParameters {}
impl Export for NodeParameters {}

/// The bootstrap roster: the router endpoints contacted once at start to run
/// peer discovery.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Bootstrap {
    pub routers: Vec<String>,
}

impl Import for Bootstrap {}
impl Export for Bootstrap {}

/// The private configuration of a node.
#[derive(Serialize, Deserialize)]
pub struct PrivateConfig {
    /// The node identity derived from the key material.
    pub name: NodeId,
    /// The long-term keys of this node.
    pub secret: KeyPair,
}

impl Default for PrivateConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl PrivateConfig {
    /// Creates a new private configuration.
    pub fn new() -> Self {
        let secret = KeyPair::generate_production_keypair();
        Self {
            name: secret.node_id(),
            secret,
        }
    }
}

impl Import for PrivateConfig {}
impl Export for PrivateConfig {}
