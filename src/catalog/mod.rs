//! Discovery catalog: merges every domain's results and resolver overlays
//! into one sorted, immutable gateway list.

mod debug_log;
mod gateway;
mod status;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use tracing::{debug, trace};

use crate::identity::ServiceIdentity;
use crate::watcher::{Advertisement, ResolvedMetadata, WatcherState};

pub use debug_log::{DebugLog, DebugLogEntry};
pub use gateway::{derive_gateway, needs_resolution, txt, DiscoveredGateway};
pub use status::{status_text, STOPPED};

/// Immutable view of the catalog published to observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogSnapshot {
    /// Gateways sorted by case-insensitive name, then stable ID.
    pub gateways: Arc<[DiscoveredGateway]>,
    /// Status line.
    pub status: String,
    /// Incremented every time the watchers (re)start.
    pub generation: u64,
}

impl Default for CatalogSnapshot {
    fn default() -> Self {
        Self {
            gateways: Arc::from(Vec::new()),
            status: "idle".to_string(),
            generation: 0,
        }
    }
}

impl CatalogSnapshot {
    /// Look up a gateway by stable ID.
    pub fn find(&self, stable_id: &str) -> Option<&DiscoveredGateway> {
        self.gateways.iter().find(|g| g.stable_id == stable_id)
    }
}

#[derive(Debug)]
struct DomainEntry {
    state: WatcherState,
    results: BTreeMap<ServiceIdentity, Advertisement>,
}

/// Aggregated discovery state.
///
/// Owned by the discovery actor; every mutation is followed by
/// [`snapshot()`](Catalog::snapshot) to publish the rebuilt list.
#[derive(Debug)]
pub struct Catalog {
    order: Vec<String>,
    domains: HashMap<String, DomainEntry>,
    overlays: HashMap<String, ResolvedMetadata>,
    last_ids: BTreeSet<String>,
    log: DebugLog,
    stopped: bool,
    generation: u64,
}

impl Catalog {
    /// Create an empty catalog with the given debug log capacity.
    pub fn new(debug_log_capacity: usize) -> Self {
        Self {
            order: Vec::new(),
            domains: HashMap::new(),
            overlays: HashMap::new(),
            last_ids: BTreeSet::new(),
            log: DebugLog::new(debug_log_capacity),
            stopped: false,
            generation: 0,
        }
    }

    /// Register the domains of a new watcher generation. Every domain starts idle.
    pub fn begin(&mut self, domains: &[String], generation: u64) {
        self.order = domains.to_vec();
        self.domains = domains
            .iter()
            .map(|d| {
                (
                    d.clone(),
                    DomainEntry {
                        state: WatcherState::Idle,
                        results: BTreeMap::new(),
                    },
                )
            })
            .collect();
        self.stopped = false;
        self.generation = generation;
        self.log
            .record(format!("start: domains={}", domains.join(",")));
    }

    /// Domains currently registered.
    pub fn domains(&self) -> &[String] {
        &self.order
    }

    /// Whether the catalog has been stopped.
    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Record a watcher state change. Returns `false` for unknown domains.
    pub fn set_state(&mut self, domain: &str, state: WatcherState) -> bool {
        let Some(entry) = self.domains.get_mut(domain) else {
            return false;
        };
        if entry.state != state {
            debug!(domain, state = %state, "watcher state changed");
            self.log.record(format!("{domain}: {state}"));
            entry.state = state;
        }
        true
    }

    /// Replace a domain's result set.
    ///
    /// Returns the identities that need out-of-band resolution: no host in
    /// their own metadata and no overlay yet.
    pub fn set_results(&mut self, domain: &str, adverts: Vec<Advertisement>) -> Vec<ServiceIdentity> {
        let Some(entry) = self.domains.get_mut(domain) else {
            return Vec::new();
        };
        entry.results = adverts
            .into_iter()
            .map(|a| (a.identity.clone(), a))
            .collect();
        trace!(domain, results = entry.results.len(), "results replaced");
        entry
            .results
            .values()
            .filter(|a| needs_resolution(a) && !self.overlays.contains_key(&a.identity.stable_id()))
            .map(|a| a.identity.clone())
            .collect()
    }

    /// Store a resolver overlay for a stable ID.
    pub fn apply_overlay(&mut self, stable_id: &str, overlay: ResolvedMetadata) {
        self.log.record(format!(
            "resolved {stable_id}: host={}",
            overlay.host_name.as_deref().unwrap_or("-")
        ));
        self.overlays.insert(stable_id.to_string(), overlay);
    }

    /// Whether an overlay exists for a stable ID.
    pub fn has_overlay(&self, stable_id: &str) -> bool {
        self.overlays.contains_key(stable_id)
    }

    /// Append a debug line if debug logging is enabled.
    pub fn record(&mut self, message: impl Into<String>) {
        self.log.record(message);
    }

    /// Drop all domains, results, overlays and debug entries.
    pub fn stop(&mut self) {
        self.order.clear();
        self.domains.clear();
        self.overlays.clear();
        self.last_ids.clear();
        self.log.clear();
        self.stopped = true;
    }

    /// Toggle debug logging. Enabling records a snapshot line.
    pub fn set_debug_logging(&mut self, enabled: bool) {
        if !self.log.set_enabled(enabled) || !enabled {
            return;
        }
        let gateways = self.gateways();
        let status = self.status(gateways.len());
        self.log.record(format!(
            "debug logging enabled: status={status} gateways={}",
            gateways.len()
        ));
    }

    /// Whether debug logging is enabled.
    pub fn debug_logging(&self) -> bool {
        self.log.is_enabled()
    }

    /// Retained debug entries, oldest first.
    pub fn debug_entries(&self) -> Arc<[DebugLogEntry]> {
        self.log.snapshot()
    }

    fn gateways(&self) -> Vec<DiscoveredGateway> {
        let mut gateways: Vec<DiscoveredGateway> = self
            .order
            .iter()
            .filter_map(|d| self.domains.get(d))
            .flat_map(|entry| entry.results.values())
            .map(|a| derive_gateway(a, self.overlays.get(&a.identity.stable_id())))
            .collect();
        gateways.sort_by(|a, b| {
            a.name
                .to_lowercase()
                .cmp(&b.name.to_lowercase())
                .then_with(|| a.stable_id.cmp(&b.stable_id))
        });
        gateways
    }

    fn status(&self, gateway_count: usize) -> String {
        if self.stopped {
            return STOPPED.to_string();
        }
        status_text(
            self.order
                .iter()
                .filter_map(|d| self.domains.get(d))
                .map(|e| &e.state),
            gateway_count,
        )
    }

    /// Rebuild the gateway list and status.
    ///
    /// Records a `total/added/removed` summary when the set of stable IDs changed.
    pub fn snapshot(&mut self) -> CatalogSnapshot {
        let gateways = self.gateways();
        let ids: BTreeSet<String> = gateways.iter().map(|g| g.stable_id.clone()).collect();
        if ids != self.last_ids {
            let added = ids.difference(&self.last_ids).count();
            let removed = self.last_ids.difference(&ids).count();
            self.log.record(format!(
                "total={} added={added} removed={removed}",
                ids.len()
            ));
            self.last_ids = ids;
        }
        let status = self.status(gateways.len());
        CatalogSnapshot {
            gateways: gateways.into(),
            status,
            generation: self.generation,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DiscoveryError;

    const TYPE: &str = "_openclaw-gw._tcp";

    fn advert(name: &str, domain: &str) -> Advertisement {
        Advertisement::new(ServiceIdentity::new(name, TYPE, domain))
    }

    fn domains() -> Vec<String> {
        vec!["local.".to_string(), "wide.example.".to_string()]
    }

    #[test]
    fn merges_and_sorts_case_insensitively() {
        let mut catalog = Catalog::new(200);
        catalog.begin(&domains(), 1);
        catalog.set_state("local.", WatcherState::Ready);
        catalog.set_results(
            "local.",
            vec![
                advert("bravo", "local.").with_txt(txt::LAN_HOST, "10.0.0.2"),
                advert("Alpha", "local.").with_txt(txt::LAN_HOST, "10.0.0.1"),
            ],
        );
        catalog.set_results(
            "wide.example.",
            vec![advert("charlie", "wide.example.").with_txt(txt::TAILNET_DNS, "c.ts.net")],
        );
        let snap = catalog.snapshot();
        let names: Vec<&str> = snap.gateways.iter().map(|g| g.name.as_str()).collect();
        assert_eq!(names, ["Alpha", "bravo", "charlie"]);
        assert_eq!(snap.status, "ready: 3 gateways");
        assert_eq!(snap.generation, 1);
    }

    #[test]
    fn same_instance_in_two_domains_is_not_deduplicated() {
        let mut catalog = Catalog::new(200);
        catalog.begin(&domains(), 1);
        catalog.set_results("local.", vec![advert("Molty", "local.")]);
        catalog.set_results("wide.example.", vec![advert("Molty", "wide.example.")]);
        let snap = catalog.snapshot();
        assert_eq!(snap.gateways.len(), 2);
        assert_eq!(snap.gateways[0].stable_id, snap.gateways[1].stable_id);
    }

    #[test]
    fn results_needing_resolution_are_reported_once_overlaid() {
        let mut catalog = Catalog::new(200);
        catalog.begin(&domains(), 1);
        let pending = catalog.set_results("local.", vec![advert("Molty", "local.")]);
        assert_eq!(pending.len(), 1);

        catalog.apply_overlay(&pending[0].stable_id(), ResolvedMetadata::host("gw.local."));
        let pending = catalog.set_results("local.", vec![advert("Molty", "local.")]);
        assert!(pending.is_empty());
        let snap = catalog.snapshot();
        assert_eq!(snap.gateways[0].lan_host.as_deref(), Some("gw.local"));
    }

    #[test]
    fn unknown_domains_are_ignored() {
        let mut catalog = Catalog::new(200);
        catalog.begin(&domains(), 1);
        assert!(!catalog.set_state("gone.", WatcherState::Ready));
        assert!(catalog.set_results("gone.", vec![advert("x", "gone.")]).is_empty());
        assert!(catalog.snapshot().gateways.is_empty());
    }

    #[test]
    fn status_follows_watcher_states_and_stop() {
        let mut catalog = Catalog::new(200);
        assert_eq!(catalog.snapshot().status, "idle");
        catalog.begin(&domains(), 1);
        assert_eq!(catalog.snapshot().status, "setup");
        catalog.set_state("local.", WatcherState::Searching);
        catalog.set_state("wide.example.", WatcherState::Searching);
        assert_eq!(catalog.snapshot().status, "searching");
        catalog.set_state(
            "wide.example.",
            WatcherState::Waiting(DiscoveryError::transport("no route")),
        );
        assert_eq!(catalog.snapshot().status, "waiting: no route");
        catalog.stop();
        let snap = catalog.snapshot();
        assert_eq!(snap.status, "stopped");
        assert!(snap.gateways.is_empty());
    }

    #[test]
    fn summary_line_only_on_id_set_change() {
        let mut catalog = Catalog::new(200);
        catalog.set_debug_logging(true);
        catalog.begin(&domains(), 1);
        catalog.set_results("local.", vec![advert("A", "local.")]);
        catalog.snapshot();
        catalog.set_results("local.", vec![advert("A", "local.").with_txt(txt::CLI_PATH, "/bin/x")]);
        catalog.snapshot();
        catalog.set_results("local.", vec![advert("B", "local.")]);
        catalog.snapshot();

        let summaries: Vec<String> = catalog
            .debug_entries()
            .iter()
            .filter(|e| e.message.starts_with("total="))
            .map(|e| e.message.clone())
            .collect();
        assert_eq!(
            summaries,
            ["total=1 added=1 removed=0", "total=1 added=1 removed=1"]
        );
    }

    #[test]
    fn enabling_debug_logging_records_snapshot_line() {
        let mut catalog = Catalog::new(200);
        catalog.begin(&domains(), 1);
        catalog.set_debug_logging(true);
        let entries = catalog.debug_entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(
            entries[0].message,
            "debug logging enabled: status=setup gateways=0"
        );
        catalog.set_debug_logging(false);
        assert!(catalog.debug_entries().is_empty());
    }
}
