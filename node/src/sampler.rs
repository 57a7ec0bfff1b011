use config::SelectionStrategy;
use crypto::NodeId;
use messages::error::{BroadcastError, BroadcastResult};
use rand::seq::SliceRandom;
use rand::Rng;
use rand_distr::{Distribution, Normal, Poisson};
use std::collections::HashSet;

/// Draw exactly `size` distinct peers from `peers` (stable iteration order).
/// Distribution draws that land on an already-chosen peer are topped up by
/// looping until the set is full.
pub fn select<R: Rng>(
    strategy: SelectionStrategy,
    peers: &[NodeId],
    size: usize,
    rng: &mut R,
) -> BroadcastResult<HashSet<NodeId>> {
    if peers.len() < size {
        return Err(BroadcastError::NotEnoughPeers {
            needed: size,
            available: peers.len(),
        });
    }

    let num_nodes = peers.len();
    let mut sample = HashSet::with_capacity(size);
    match strategy {
        SelectionStrategy::Random => {
            for peer in peers.choose_multiple(rng, size) {
                sample.insert(peer.clone());
            }
        }
        SelectionStrategy::Normal => {
            let mean = (num_nodes as f64 - 1.0) / 2.0;
            let std_dev = (num_nodes as f64).sqrt();
            let normal = Normal::new(mean, std_dev).expect("Invalid normal parameters");
            while sample.len() < size {
                let draw = normal.sample(rng).floor() as i64;
                let index = draw.rem_euclid(num_nodes as i64) as usize;
                sample.insert(peers[index].clone());
            }
        }
        SelectionStrategy::Poisson => {
            let poisson = Poisson::new(5.0).expect("Invalid poisson parameters");
            while sample.len() < size {
                let draw = poisson.sample(rng) as u64;
                let index = (draw % num_nodes as u64) as usize;
                sample.insert(peers[index].clone());
            }
        }
    }
    Ok(sample)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peers(n: usize) -> Vec<NodeId> {
        (0..n).map(|i| format!("{:010}", i)).collect()
    }

    #[test]
    fn normal_selection_always_returns_exact_size() {
        let peers = peers(10);
        let mut rng = rand::thread_rng();
        for _ in 0..10_000 {
            let sample = select(SelectionStrategy::Normal, &peers, 6, &mut rng).unwrap();
            assert_eq!(sample.len(), 6);
            assert!(sample.iter().all(|id| peers.contains(id)));
        }
    }

    #[test]
    fn random_and_poisson_return_exact_size() {
        let peers = peers(10);
        let mut rng = rand::thread_rng();
        for _ in 0..1_000 {
            let sample = select(SelectionStrategy::Random, &peers, 6, &mut rng).unwrap();
            assert_eq!(sample.len(), 6);
            let sample = select(SelectionStrategy::Poisson, &peers, 6, &mut rng).unwrap();
            assert_eq!(sample.len(), 6);
        }
    }

    #[test]
    fn rejects_samples_larger_than_the_roster() {
        let peers = peers(3);
        let mut rng = rand::thread_rng();
        assert!(matches!(
            select(SelectionStrategy::Normal, &peers, 6, &mut rng),
            Err(BroadcastError::NotEnoughPeers { needed: 6, available: 3 })
        ));
    }

    #[test]
    fn whole_roster_is_a_valid_sample() {
        let peers = peers(6);
        let mut rng = rand::thread_rng();
        let sample = select(SelectionStrategy::Normal, &peers, 6, &mut rng).unwrap();
        assert_eq!(sample.len(), 6);
    }
}
