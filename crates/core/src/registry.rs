//! Bridge Registry: the live set of bridges.
//!
//! Readers take a lock-free snapshot per dispatch; writers swap in a new
//! list. Bridge names are unique.

use std::sync::Arc;

use arc_swap::ArcSwap;
use pocketping_bridge_core::{Bridge, BridgeError};
use tokio::sync::Mutex;
use tracing::{info, warn};

pub type BridgeList = Arc<Vec<Arc<dyn Bridge>>>;

pub struct BridgeRegistry {
    bridges: ArcSwap<Vec<Arc<dyn Bridge>>>,
    /// Serializes add/remove so a slow `init` cannot race a duplicate add.
    writer: Mutex<()>,
}

impl Default for BridgeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl BridgeRegistry {
    pub fn new() -> Self {
        Self {
            bridges: ArcSwap::from_pointee(Vec::new()),
            writer: Mutex::new(()),
        }
    }

    pub fn snapshot(&self) -> BridgeList {
        self.bridges.load_full()
    }

    pub fn names(&self) -> Vec<String> {
        self.bridges
            .load()
            .iter()
            .map(|b| b.name().to_string())
            .collect()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Bridge>> {
        self.bridges.load().iter().find(|b| b.name() == name).cloned()
    }

    /// Initialize and register a bridge. A failed `init` leaves the
    /// registry unchanged.
    pub async fn add(&self, bridge: Arc<dyn Bridge>) -> Result<(), BridgeError> {
        let _guard = self.writer.lock().await;
        let name = bridge.name().to_string();

        if self.get(&name).is_some() {
            return Err(BridgeError::Other(format!("bridge {name} is already registered")));
        }

        bridge.init().await?;

        let mut next: Vec<Arc<dyn Bridge>> = (**self.bridges.load()).clone();
        next.push(bridge);
        self.bridges.store(Arc::new(next));

        info!(
            component = "registry",
            event = "bridge.registered",
            bridge = %name,
            "Bridge registered"
        );
        Ok(())
    }

    /// Unregister and destroy a bridge. Returns false if it was not registered.
    pub async fn remove(&self, name: &str) -> bool {
        let _guard = self.writer.lock().await;
        let current = self.bridges.load_full();
        let Some(bridge) = current.iter().find(|b| b.name() == name).cloned() else {
            return false;
        };

        let next: Vec<_> = current
            .iter()
            .filter(|b| b.name() != name)
            .cloned()
            .collect();
        self.bridges.store(Arc::new(next));

        if let Err(e) = bridge.destroy().await {
            warn!(
                component = "registry",
                event = "bridge.destroy.failed",
                bridge = %name,
                error = %e,
                "Bridge destroy failed"
            );
        }
        info!(
            component = "registry",
            event = "bridge.removed",
            bridge = %name,
            "Bridge removed"
        );
        true
    }

    /// Destroy every bridge and empty the registry (shutdown).
    pub async fn destroy_all(&self) {
        let _guard = self.writer.lock().await;
        let current = self.bridges.swap(Arc::new(Vec::new()));
        for bridge in current.iter() {
            if let Err(e) = bridge.destroy().await {
                warn!(
                    component = "registry",
                    event = "bridge.destroy.failed",
                    bridge = %bridge.name(),
                    error = %e,
                    "Bridge destroy failed"
                );
            }
        }
    }

    pub fn len(&self) -> usize {
        self.bridges.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.bridges.load().is_empty()
    }
}
