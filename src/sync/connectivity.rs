//! Link availability as an observable value.

use std::sync::Arc;

use tokio::sync::watch;

/// Shared handle to the current link state.
///
/// Whoever detects the link (an OS reachability probe, a heartbeat, a test)
/// calls [`Connectivity::set_online`]; observers receive every transition.
#[derive(Debug, Clone)]
pub struct Connectivity {
    tx: Arc<watch::Sender<bool>>,
}

impl Connectivity {
    #[must_use]
    pub fn new(online: bool) -> Self {
        let (tx, _) = watch::channel(online);
        Self { tx: Arc::new(tx) }
    }

    #[must_use]
    pub fn online() -> Self {
        Self::new(true)
    }

    #[must_use]
    pub fn offline() -> Self {
        Self::new(false)
    }

    #[must_use]
    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    /// Publishes the link state. Returns whether it changed.
    pub fn set_online(&self, online: bool) -> bool {
        self.tx.send_if_modified(|current| {
            if *current == online {
                return false;
            }
            *current = online;
            true
        })
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for Connectivity {
    fn default() -> Self {
        Self::online()
    }
}
