use config::{AT2Configuration, NodeParameters};
use crypto::KeyPair;
use messages::{Gossip, SignedBatch};
use node::{spawn_node, NodeHandle};
use rand::{rngs::StdRng, SeedableRng};
use std::net::SocketAddr;
use tokio::time::{sleep, Duration, Instant};

// Test cryptographic keys.
pub fn keys(count: usize) -> Vec<KeyPair> {
    let mut rng = StdRng::from_seed([0; 32]);
    (0..count)
        .map(|_| KeyPair::generate_keypair(&mut rng))
        .collect()
}

// Router and publisher addresses for a test cluster. Publishers live one
// thousand ports above the routers.
pub fn addresses(base_port: u16, count: usize) -> Vec<(SocketAddr, SocketAddr)> {
    (0..count as u16)
        .map(|i| {
            (
                format!("127.0.0.1:{}", base_port + i).parse().unwrap(),
                format!("127.0.0.1:{}", base_port + 1000 + i).parse().unwrap(),
            )
        })
        .collect()
}

// The canonical broadcast configuration of the experiments.
pub fn at2_configuration() -> AT2Configuration {
    AT2Configuration::new(6, 6, 6, 4, 5, 6).unwrap()
}

// Node parameters tightened so tests stay quick.
pub fn parameters() -> NodeParameters {
    NodeParameters {
        max_gossip_timeout: 15.0,
        initial_latency: 0.2,
        publish_frequency: 0.05,
        minimum_latency: 0.01,
        target_latency: 2.0,
        max_publishing_frequency: 2.0,
        selection: Default::default(),
    }
}

// Test gossips with distinct timestamps.
pub fn gossips(count: usize) -> Vec<Gossip> {
    (0..count as u64).map(|i| Gossip::new(1_700_000_000 + i)).collect()
}

// A signed test batch created by the first test keypair.
pub fn signed_batch() -> SignedBatch {
    let keypair = keys(1).pop().unwrap();
    let clock = vec![(keypair.node_id(), 1)];
    SignedBatch::new(gossips(3), clock, &keypair).unwrap()
}

// Spawn a cluster of nodes on consecutive ports, run the discovery exchange
// and wait until every node knows every other.
pub async fn spawn_test_cluster(
    base_port: u16,
    count: usize,
    at2: AT2Configuration,
    params: NodeParameters,
) -> Vec<NodeHandle> {
    let endpoints = addresses(base_port, count);
    let handles: Vec<NodeHandle> = keys(count)
        .into_iter()
        .zip(endpoints.iter())
        .map(|(keypair, (router, publisher))| {
            spawn_node(keypair, at2, params.clone(), *router, *publisher)
        })
        .collect();
    tokio::task::yield_now().await;

    let routers: Vec<SocketAddr> = endpoints.iter().map(|(router, _)| *router).collect();
    for handle in &handles {
        handle.peer_discovery(&routers).await;
    }

    // Wait for full mutual discovery.
    let deadline = Instant::now() + Duration::from_secs(60);
    for handle in &handles {
        loop {
            if handle.snapshot().await.peers.len() == count - 1 {
                break;
            }
            assert!(
                Instant::now() < deadline,
                "Cluster discovery did not complete in time"
            );
            sleep(Duration::from_millis(100)).await;
        }
    }
    handles
}
