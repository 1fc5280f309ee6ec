//! Discovery service: domain watchers feeding one catalog actor.
//!
//! [`DiscoveryService`] is a cheap, cloneable handle. The actor behind it
//! runs until the last handle is dropped.
//!
//! ```no_run
//! use gateway_discovery::discovery::DiscoveryService;
//! use gateway_discovery::watcher::StaticSource;
//!
//! # async fn example() -> gateway_discovery::Result<()> {
//! let discovery = DiscoveryService::builder(StaticSource::new()).spawn();
//! discovery.start().await?;
//! let mut updates = discovery.subscribe();
//! updates.changed().await.ok();
//! println!("{}", updates.borrow().status);
//! # Ok(())
//! # }
//! ```

mod actor;
mod commands;

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};

use self::actor::DiscoveryActor;
use self::commands::Command;
use crate::catalog::{CatalogSnapshot, DebugLogEntry, DiscoveredGateway};
use crate::config::DiscoveryConfig;
use crate::error::{DiscoveryError, Result};
use crate::settings::GatewaySettings;
use crate::watcher::{AdvertisementSource, NameResolver};

/// Builder for a [`DiscoveryService`].
pub struct DiscoveryBuilder {
    source: Arc<dyn AdvertisementSource>,
    resolver: Option<Arc<dyn NameResolver>>,
    settings: Option<GatewaySettings>,
    config: DiscoveryConfig,
}

impl DiscoveryBuilder {
    /// Resolve incomplete advertisements with `resolver`.
    pub fn resolver<R: NameResolver>(mut self, resolver: R) -> Self {
        self.resolver = Some(Arc::new(resolver));
        self
    }

    /// Use a shared resolver.
    pub fn shared_resolver(mut self, resolver: Arc<dyn NameResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Read and persist the domain override and debug toggle in `settings`.
    ///
    /// Defaults to an in-memory store.
    pub fn settings(mut self, settings: GatewaySettings) -> Self {
        self.settings = Some(settings);
        self
    }

    /// Set the discovery configuration.
    pub fn config(mut self, config: DiscoveryConfig) -> Self {
        self.config = config;
        self
    }

    /// Spawn the actor on the current tokio runtime. Watchers stay idle
    /// until [`DiscoveryService::start`].
    pub fn spawn(self) -> DiscoveryService {
        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let (snapshot_tx, snapshot_rx) = watch::channel(CatalogSnapshot::default());
        let (log_tx, log_rx) = watch::channel::<Arc<[DebugLogEntry]>>(Arc::from(Vec::new()));
        let (actor, channels) = DiscoveryActor::new(
            self.source,
            self.resolver,
            self.settings.unwrap_or_else(GatewaySettings::in_memory),
            self.config,
            snapshot_tx,
            log_tx,
        );
        tokio::spawn(actor.run(cmd_rx, channels));
        DiscoveryService {
            cmd_tx,
            snapshot_rx,
            log_rx,
        }
    }
}

/// Handle to a running discovery actor.
#[derive(Clone)]
pub struct DiscoveryService {
    cmd_tx: mpsc::Sender<Command>,
    snapshot_rx: watch::Receiver<CatalogSnapshot>,
    log_rx: watch::Receiver<Arc<[DebugLogEntry]>>,
}

impl std::fmt::Debug for DiscoveryService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscoveryService")
            .field("status", &self.snapshot_rx.borrow().status)
            .finish_non_exhaustive()
    }
}

impl DiscoveryService {
    /// Start building a service over an advertisement source.
    pub fn builder<S: AdvertisementSource>(source: S) -> DiscoveryBuilder {
        Self::builder_shared(Arc::new(source))
    }

    /// Start building a service over a shared advertisement source.
    pub fn builder_shared(source: Arc<dyn AdvertisementSource>) -> DiscoveryBuilder {
        DiscoveryBuilder {
            source,
            resolver: None,
            settings: None,
            config: DiscoveryConfig::default(),
        }
    }

    async fn request(&self, make: impl FnOnce(oneshot::Sender<()>) -> Command) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(make(tx))
            .await
            .map_err(|_| DiscoveryError::Shutdown)?;
        rx.await.map_err(|_| DiscoveryError::Shutdown)?;
        Ok(())
    }

    /// Start watching every configured domain. No-op when already running.
    pub async fn start(&self) -> Result<()> {
        self.request(|resp| Command::Start { resp }).await
    }

    /// Stop every watcher and clear results, overlays and debug state.
    pub async fn stop(&self) -> Result<()> {
        self.request(|resp| Command::Stop { resp }).await
    }

    /// Persist an operator override domain (`None` or blank clears it).
    ///
    /// Running watchers restart after the debounce quiet period; a newer
    /// edit or a stop cancels the pending restart.
    pub async fn set_domain_override(&self, domain: Option<&str>) -> Result<()> {
        let domain = domain.map(str::to_string);
        self.request(|resp| Command::SetDomainOverride { domain, resp })
            .await
    }

    /// Enable or disable the debug log. The toggle is persisted.
    pub async fn set_debug_logging(&self, enabled: bool) -> Result<()> {
        self.request(|resp| Command::SetDebugLogging { enabled, resp })
            .await
    }

    /// Current catalog snapshot.
    pub fn snapshot(&self) -> CatalogSnapshot {
        self.snapshot_rx.borrow().clone()
    }

    /// Current gateway list.
    pub fn gateways(&self) -> Arc<[DiscoveredGateway]> {
        Arc::clone(&self.snapshot_rx.borrow().gateways)
    }

    /// Current status line.
    pub fn status(&self) -> String {
        self.snapshot_rx.borrow().status.clone()
    }

    /// Subscribe to catalog snapshots.
    pub fn subscribe(&self) -> watch::Receiver<CatalogSnapshot> {
        self.snapshot_rx.clone()
    }

    /// Retained debug log entries, oldest first.
    pub fn debug_log(&self) -> Arc<[DebugLogEntry]> {
        Arc::clone(&self.log_rx.borrow())
    }

    /// Subscribe to debug log updates.
    pub fn subscribe_debug_log(&self) -> watch::Receiver<Arc<[DebugLogEntry]>> {
        self.log_rx.clone()
    }
}
