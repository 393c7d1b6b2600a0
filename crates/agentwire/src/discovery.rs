//! Agent discovery.
//!
//! The pool only needs two things from a discovery service: the candidate
//! addresses of an agent right now, and a signal that something changed.
//! An empty answer means "still looking", never an error.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

use agentwire_common::{AgentName, PeerName};

/// Name to address resolution with change notification.
pub trait Discovery: Send + Sync + 'static {
    /// Candidate addresses for `name`, in preference order.
    fn addresses_for(&self, name: &AgentName) -> Vec<PeerName>;

    /// Receiver whose value changes whenever any mapping changes.
    fn subscribe(&self) -> watch::Receiver<u64>;
}

impl<D: Discovery + ?Sized> Discovery for Arc<D> {
    fn addresses_for(&self, name: &AgentName) -> Vec<PeerName> {
        (**self).addresses_for(name)
    }

    fn subscribe(&self) -> watch::Receiver<u64> {
        (**self).subscribe()
    }
}

/// In-process registry of agent addresses.
///
/// Suitable for tests and fixed deployments; anything that can announce
/// agents coming and going can implement [`Discovery`] instead.
pub struct StaticDiscovery {
    entries: DashMap<AgentName, Vec<PeerName>>,
    generation: watch::Sender<u64>,
}

impl StaticDiscovery {
    pub fn new() -> Self {
        let (generation, _) = watch::channel(0);
        Self {
            entries: DashMap::new(),
            generation,
        }
    }

    /// Add an address for `name`, keeping earlier ones.
    pub fn register(&self, name: AgentName, peer: PeerName) {
        debug!(agent = %name, peer = %peer, "Registering agent address");
        {
            let mut entry = self.entries.entry(name).or_default();
            if !entry.contains(&peer) {
                entry.push(peer);
            }
        }
        self.bump();
    }

    /// Replace every address for `name`.
    pub fn set(&self, name: AgentName, peers: Vec<PeerName>) {
        debug!(agent = %name, count = peers.len(), "Replacing agent addresses");
        self.entries.insert(name, peers);
        self.bump();
    }

    /// Forget `name` entirely.
    pub fn remove(&self, name: &AgentName) {
        if self.entries.remove(name).is_some() {
            debug!(agent = %name, "Removed agent");
            self.bump();
        }
    }

    pub fn generation(&self) -> u64 {
        *self.generation.borrow()
    }

    fn bump(&self) {
        self.generation.send_modify(|g| *g += 1);
    }
}

impl Default for StaticDiscovery {
    fn default() -> Self {
        Self::new()
    }
}

impl Discovery for StaticDiscovery {
    fn addresses_for(&self, name: &AgentName) -> Vec<PeerName> {
        self.entries
            .get(name)
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }

    fn subscribe(&self) -> watch::Receiver<u64> {
        self.generation.subscribe()
    }
}
