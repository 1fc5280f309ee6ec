//! Discovery actor: owns the watchers, resolutions and the catalog.
//!
//! Every watcher task and every resolution funnels into this single task,
//! so the catalog is only ever touched from one place. Events carry the
//! generation of the watcher set that produced them; anything from an
//! older generation is dropped.

use std::sync::Arc;

use futures_util::StreamExt;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, info, trace};

use super::commands::{Command, WatcherEvent};
use crate::catalog::{Catalog, CatalogSnapshot, DebugLogEntry};
use crate::config::DiscoveryConfig;
use crate::settings::GatewaySettings;
use crate::watcher::resolver::{Resolution, Resolutions};
use crate::watcher::{AdvertisementSource, BrowseEvent, NameResolver};

pub(super) struct DiscoveryActor {
    source: Arc<dyn AdvertisementSource>,
    settings: GatewaySettings,
    config: DiscoveryConfig,
    catalog: Catalog,
    resolutions: Resolutions,
    watchers: Vec<JoinHandle<()>>,
    generation: u64,
    running: bool,
    restart_at: Option<Instant>,
    event_tx: mpsc::Sender<WatcherEvent>,
    resolution_tx: mpsc::Sender<Resolution>,
    snapshot_tx: watch::Sender<CatalogSnapshot>,
    log_tx: watch::Sender<Arc<[DebugLogEntry]>>,
}

pub(super) struct Channels {
    pub event_rx: mpsc::Receiver<WatcherEvent>,
    pub resolution_rx: mpsc::Receiver<Resolution>,
}

impl DiscoveryActor {
    pub(super) fn new(
        source: Arc<dyn AdvertisementSource>,
        resolver: Option<Arc<dyn NameResolver>>,
        settings: GatewaySettings,
        config: DiscoveryConfig,
        snapshot_tx: watch::Sender<CatalogSnapshot>,
        log_tx: watch::Sender<Arc<[DebugLogEntry]>>,
    ) -> (Self, Channels) {
        let (event_tx, event_rx) = mpsc::channel(config.mailbox_capacity);
        let (resolution_tx, resolution_rx) = mpsc::channel(config.mailbox_capacity);
        let mut catalog = Catalog::new(config.debug_log_capacity);
        catalog.set_debug_logging(settings.debug_logging());
        let actor = Self {
            source,
            settings,
            resolutions: Resolutions::new(resolver, config.resolve_timeout),
            config,
            catalog,
            watchers: Vec::new(),
            generation: 0,
            running: false,
            restart_at: None,
            event_tx,
            resolution_tx,
            snapshot_tx,
            log_tx,
        };
        (
            actor,
            Channels {
                event_rx,
                resolution_rx,
            },
        )
    }

    /// Main loop. Exits once every handle has been dropped.
    pub(super) async fn run(mut self, mut cmd_rx: mpsc::Receiver<Command>, channels: Channels) {
        let Channels {
            mut event_rx,
            mut resolution_rx,
        } = channels;
        self.publish();

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd),
                    None => break,
                },
                Some(event) = event_rx.recv() => self.handle_watcher_event(event),
                Some(resolution) = resolution_rx.recv() => self.handle_resolution(resolution),
                _ = restart_timer(self.restart_at) => {
                    self.restart_at = None;
                    self.restart();
                }
            }
        }

        debug!("discovery: all handles dropped, shutting down");
        self.teardown();
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Start { resp } => {
                self.start();
                let _ = resp.send(());
            }
            Command::Stop { resp } => {
                self.stop();
                let _ = resp.send(());
            }
            Command::SetDomainOverride { domain, resp } => {
                self.settings.set_discovery_domain(domain.as_deref());
                if self.running {
                    self.restart_at = Some(Instant::now() + self.config.debounce);
                    trace!(domain = ?domain, "discovery: restart scheduled");
                }
                let _ = resp.send(());
            }
            Command::SetDebugLogging { enabled, resp } => {
                self.settings.set_debug_logging(enabled);
                self.catalog.set_debug_logging(enabled);
                self.publish();
                let _ = resp.send(());
            }
        }
    }

    fn start(&mut self) {
        if self.running {
            trace!("discovery: already running");
            return;
        }
        self.generation += 1;
        let generation = self.generation;
        let domains = self
            .config
            .domains(self.settings.discovery_domain().as_deref());
        info!(
            generation,
            source = self.source.name(),
            domains = ?domains,
            "discovery: starting watchers"
        );
        self.catalog.begin(&domains, generation);

        for domain in domains {
            // Subscribe before spawning so nothing published in between is lost.
            let mut feed = self.source.browse(&self.config.service_type, &domain);
            let tx = self.event_tx.clone();
            self.watchers.push(tokio::spawn(async move {
                while let Some(event) = feed.next().await {
                    let msg = WatcherEvent {
                        domain: domain.clone(),
                        generation,
                        event,
                    };
                    if tx.send(msg).await.is_err() {
                        break;
                    }
                }
                trace!(%domain, generation, "watcher feed ended");
            }));
        }
        self.running = true;
        self.publish();
    }

    /// Abort watchers, resolutions and any pending restart.
    fn teardown(&mut self) {
        for handle in self.watchers.drain(..) {
            handle.abort();
        }
        self.resolutions.cancel_all();
        self.restart_at = None;
        self.running = false;
    }

    fn stop(&mut self) {
        if self.running {
            info!(generation = self.generation, "discovery: stopping watchers");
        }
        self.teardown();
        self.catalog.stop();
        self.publish();
    }

    fn restart(&mut self) {
        if !self.running {
            return;
        }
        debug!("discovery: restarting after domain change");
        self.teardown();
        self.start();
    }

    fn is_current(&self, generation: u64) -> bool {
        self.running && generation == self.generation
    }

    fn handle_watcher_event(&mut self, event: WatcherEvent) {
        let WatcherEvent {
            domain,
            generation,
            event,
        } = event;
        if !self.is_current(generation) {
            trace!(%domain, generation, "discovery: dropping stale watcher event");
            return;
        }
        match event {
            BrowseEvent::State(state) => {
                self.catalog.set_state(&domain, state);
            }
            BrowseEvent::Results(adverts) => {
                for identity in self.catalog.set_results(&domain, adverts) {
                    let debug_id = identity.debug_id();
                    if self
                        .resolutions
                        .start(identity, generation, &self.resolution_tx)
                    {
                        self.catalog.record(format!("resolving {debug_id}"));
                    }
                }
            }
        }
        self.publish();
    }

    fn handle_resolution(&mut self, resolution: Resolution) {
        if !self.is_current(resolution.generation) {
            trace!(stable_id = %resolution.stable_id, "discovery: dropping stale resolution");
            return;
        }
        self.resolutions.finish(&resolution.stable_id);
        match resolution.result {
            Ok(overlay) => {
                debug!(
                    stable_id = %resolution.stable_id,
                    host = ?overlay.host_name,
                    "discovery: resolved"
                );
                self.catalog.apply_overlay(&resolution.stable_id, overlay);
            }
            Err(err) => {
                debug!(
                    service = %resolution.identity.debug_id(),
                    error = %err,
                    "discovery: resolution failed"
                );
                self.catalog.record(format!(
                    "resolve failed {}: {err}",
                    resolution.identity.debug_id()
                ));
            }
        }
        self.publish();
    }

    fn publish(&mut self) {
        let snapshot = self.catalog.snapshot();
        self.snapshot_tx.send_if_modified(|current| {
            if *current == snapshot {
                return false;
            }
            *current = snapshot;
            true
        });
        let entries = self.catalog.debug_entries();
        self.log_tx.send_if_modified(|current| {
            if *current == entries {
                return false;
            }
            *current = entries;
            true
        });
    }
}

async fn restart_timer(at: Option<Instant>) {
    match at {
        Some(at) => time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
