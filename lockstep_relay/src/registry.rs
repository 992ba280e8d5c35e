// Process-wide table of live networks.
//
// Each `Network` sits behind its own `parking_lot::Mutex`, so traffic on
// one network never contends with another. The registry lock is only held
// to look up, insert or remove entries; it may be held while taking a
// network lock (during `sweep`), never the other way round.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use lockstep_protocol::NetworkId;
use parking_lot::Mutex;

use crate::network::Network;

pub type SharedNetwork = Arc<Mutex<Network>>;

pub struct Registry {
    networks: Mutex<HashMap<NetworkId, SharedNetwork>>,
    grace: Duration,
}

impl Registry {
    /// `grace` is how long an empty network survives before it is swept.
    pub fn new(grace: Duration) -> Self {
        Self {
            networks: Mutex::new(HashMap::new()),
            grace,
        }
    }

    /// Create an empty network with a fresh id.
    pub fn create_network(&self, now: Instant) -> NetworkId {
        let mut networks = self.networks.lock();
        let id = loop {
            let candidate = NetworkId::random();
            if !networks.contains_key(&candidate) {
                break candidate;
            }
        };
        let network = Network::new(id.clone(), self.grace, now);
        networks.insert(id.clone(), Arc::new(Mutex::new(network)));
        tracing::info!(network = %id, "network created");
        id
    }

    pub fn exists(&self, id: &NetworkId) -> bool {
        self.networks.lock().contains_key(id)
    }

    pub fn get(&self, id: &NetworkId) -> Option<SharedNetwork> {
        self.networks.lock().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.networks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.networks.lock().is_empty()
    }

    /// Remove networks whose cleanup deadline has passed. Returns their ids.
    pub fn sweep(&self, now: Instant) -> Vec<NetworkId> {
        let mut networks = self.networks.lock();
        let mut removed = Vec::new();
        networks.retain(|id, network| {
            let mut network = network.lock();
            if network.is_expired(now) {
                network.close_all();
                removed.push(id.clone());
                false
            } else {
                true
            }
        });
        for id in &removed {
            tracing::info!(network = %id, "network swept");
        }
        removed
    }

    /// Close every connection on every network and forget them all.
    pub fn close_all(&self) {
        let drained: Vec<SharedNetwork> = self.networks.lock().drain().map(|(_, n)| n).collect();
        for network in drained {
            network.lock().close_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;

    const GRACE: Duration = Duration::from_secs(30);

    #[test]
    fn unused_network_is_swept_after_grace() {
        let registry = Registry::new(GRACE);
        let start = Instant::now();
        let id = registry.create_network(start);
        assert!(registry.exists(&id));

        assert!(registry.sweep(start + Duration::from_secs(29)).is_empty());
        assert_eq!(registry.sweep(start + GRACE), vec![id.clone()]);
        assert!(!registry.exists(&id));
        assert!(registry.is_empty());
    }

    #[test]
    fn occupied_network_survives_sweep() {
        let registry = Registry::new(GRACE);
        let start = Instant::now();
        let id = registry.create_network(start);
        let network = registry.get(&id).unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let client = network.lock().add_client(tx).unwrap();

        assert!(registry.sweep(start + GRACE * 2).is_empty());

        // Leaving restarts the grace period from the departure time.
        let left = start + GRACE * 2;
        network.lock().remove_client(&client, left);
        assert!(registry.sweep(left + Duration::from_secs(1)).is_empty());
        assert_eq!(registry.sweep(left + GRACE), vec![id]);
    }

    #[test]
    fn close_all_refuses_late_joins() {
        let registry = Registry::new(GRACE);
        let id = registry.create_network(Instant::now());
        let network = registry.get(&id).unwrap();
        registry.close_all();
        assert_eq!(registry.len(), 0);
        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(network.lock().add_client(tx).is_err());
    }
}
