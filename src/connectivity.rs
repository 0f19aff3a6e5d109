//! Network reachability signal.
//!
//! The host pushes connectivity changes in with [`NetworkSignal::set_online`];
//! the sync engine reads the current value to gate automatic syncs and the
//! auto-sync loop watches for offline→online transitions.

use std::sync::Arc;

use log::info;
use tokio::sync::watch;

#[derive(Clone)]
pub struct NetworkSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl NetworkSignal {
    pub fn new(initially_online: bool) -> Self {
        let (tx, _rx) = watch::channel(initially_online);
        Self { tx: Arc::new(tx) }
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    /// Returns whether the value changed.
    pub fn set_online(&self, online: bool) -> bool {
        let changed = self.tx.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if changed {
            info!("Connectivity changed: {}", if online { "online" } else { "offline" });
        }
        changed
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for NetworkSignal {
    fn default() -> Self {
        Self::new(true)
    }
}
