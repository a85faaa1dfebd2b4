use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

/// Online/offline signal fed by the host's network-state observer.
#[derive(Clone, Debug)]
pub struct ConnectivityMonitor {
    tx: Arc<watch::Sender<bool>>,
}

impl ConnectivityMonitor {
    pub fn new(online: bool) -> Self {
        let (tx, _rx) = watch::channel(online);
        Self { tx: Arc::new(tx) }
    }

    pub fn offline() -> Self {
        Self::new(false)
    }

    pub fn online() -> Self {
        Self::new(true)
    }

    /// Only actual changes wake subscribers.
    pub fn set_online(&self, online: bool) {
        let changed = self.tx.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if changed {
            info!(online, "connectivity changed");
        }
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::offline()
    }
}
