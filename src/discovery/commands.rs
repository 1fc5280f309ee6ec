//! Messages exchanged between the discovery handle, watcher tasks and the actor.

use tokio::sync::oneshot;

use crate::watcher::BrowseEvent;

/// Requests from [`DiscoveryService`](super::DiscoveryService) to the actor.
pub(super) enum Command {
    /// Start every domain watcher (idempotent).
    Start { resp: oneshot::Sender<()> },
    /// Stop every watcher and clear all derived state.
    Stop { resp: oneshot::Sender<()> },
    /// Persist a new override domain and schedule a debounced restart.
    SetDomainOverride {
        domain: Option<String>,
        resp: oneshot::Sender<()>,
    },
    /// Toggle the debug log.
    SetDebugLogging {
        enabled: bool,
        resp: oneshot::Sender<()>,
    },
}

/// One browse event tagged with the watcher generation that produced it.
#[derive(Debug)]
pub(super) struct WatcherEvent {
    pub domain: String,
    pub generation: u64,
    pub event: BrowseEvent,
}
