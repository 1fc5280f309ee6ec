//! Connection orchestration: auto-connect precedence, explicit connects,
//! durable last-attempt state and trust hand-off.
//!
//! Auto-connect fires at most once per arming. The guard is set by every
//! attempt, automatic or explicit, and cleared only by [`rearm`], which
//! also happens whenever discovery restarts.
//!
//! [`rearm`]: ConnectionOrchestrator::rearm

mod client;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use http::Uri;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::catalog::{CatalogSnapshot, DiscoveredGateway};
use crate::config::OrchestratorConfig;
use crate::error::{ConfigError, Error, Result, TrustError};
use crate::identity::manual_stable_id;
use crate::settings::{ConnectSource, GatewaySettings, LastAttemptedEndpoint};
use crate::trust::{FingerprintStore, MemoryFingerprintStore, TlsParams};

pub use client::{
    endpoint_url, ConnectOptions, ConnectTarget, CredentialStore, GatewayClient, Handshake,
    NoCredentials, StaticCredentials,
};

/// Phase of the current connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionPhase {
    /// No attempt, or disconnected.
    #[default]
    Idle,
    /// Attempt in flight.
    Connecting,
    /// Connected.
    Connected,
    /// Last attempt failed.
    Failed,
}

/// Observable connection state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionSnapshot {
    /// Current phase.
    pub phase: ConnectionPhase,
    /// Sequence number of the attempt this snapshot describes.
    pub attempt: u64,
    /// Endpoint URL of the attempt.
    pub url: Option<String>,
    /// Stable ID of the attempt.
    pub stable_id: Option<String>,
    /// Gateway name reported by the client once connected.
    pub server_name: Option<String>,
    /// Remote address reported by the client once connected.
    pub remote_address: Option<String>,
    /// Failure message.
    pub error: Option<String>,
    /// Whether the failure was a trust failure.
    pub trust_failure: bool,
}

/// Result of an auto-connect evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AutoConnectOutcome {
    /// Auto-connect is disabled in the configuration.
    Disabled,
    /// An attempt already happened since the last re-arm.
    AlreadyAttempted,
    /// A connection is established or in flight.
    Busy,
    /// Nothing eligible to connect to. Not an error.
    NoCandidate,
    /// An attempt was made and succeeded.
    Connected(ConnectionSnapshot),
}

struct Endpoint {
    url: Uri,
    host: String,
    port: u16,
    stable_id: String,
    tls: TlsParams,
    source: ConnectSource,
}

impl Endpoint {
    fn new(host: String, port: u16, stable_id: String, tls: TlsParams, source: ConnectSource) -> Result<Self> {
        let url = endpoint_url(&host, port, tls.required)?;
        Ok(Self {
            url,
            host,
            port,
            stable_id,
            tls,
            source,
        })
    }
}

#[derive(Default)]
struct State {
    attempted: bool,
    attempt_seq: u64,
    preferred: Option<String>,
    last_discovered: Option<String>,
    last_attempt: Option<LastAttemptedEndpoint>,
    catalog: CatalogSnapshot,
}

struct Inner {
    client: Arc<dyn GatewayClient>,
    settings: GatewaySettings,
    fingerprints: Arc<dyn FingerprintStore>,
    credentials: Arc<dyn CredentialStore>,
    options: ConnectOptions,
    config: OrchestratorConfig,
    state: Mutex<State>,
    snapshot_tx: watch::Sender<ConnectionSnapshot>,
    last_attempt_tx: watch::Sender<Option<LastAttemptedEndpoint>>,
}

/// Builder for a [`ConnectionOrchestrator`].
pub struct OrchestratorBuilder {
    client: Arc<dyn GatewayClient>,
    settings: Option<GatewaySettings>,
    fingerprints: Option<Arc<dyn FingerprintStore>>,
    credentials: Option<Arc<dyn CredentialStore>>,
    options: ConnectOptions,
    config: OrchestratorConfig,
}

impl OrchestratorBuilder {
    /// Durable settings. Defaults to an in-memory store.
    pub fn settings(mut self, settings: GatewaySettings) -> Self {
        self.settings = Some(settings);
        self
    }

    /// Pinned fingerprint store. Defaults to an in-memory store.
    pub fn fingerprints(mut self, store: Arc<dyn FingerprintStore>) -> Self {
        self.fingerprints = Some(store);
        self
    }

    /// Credential store. Defaults to [`NoCredentials`].
    pub fn credentials(mut self, store: Arc<dyn CredentialStore>) -> Self {
        self.credentials = Some(store);
        self
    }

    /// Client identity and capabilities.
    pub fn options(mut self, options: ConnectOptions) -> Self {
        self.options = options;
        self
    }

    /// Orchestrator configuration.
    pub fn config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the orchestrator, loading remembered identities from settings.
    pub fn build(self) -> ConnectionOrchestrator {
        let settings = self.settings.unwrap_or_else(GatewaySettings::in_memory);
        let last_attempt = settings.last_attempt();
        let state = State {
            preferred: settings.preferred_stable_id(),
            last_discovered: settings.last_discovered_stable_id(),
            last_attempt: last_attempt.clone(),
            ..State::default()
        };
        let (snapshot_tx, _) = watch::channel(ConnectionSnapshot::default());
        let (last_attempt_tx, _) = watch::channel(last_attempt);
        ConnectionOrchestrator {
            inner: Arc::new(Inner {
                client: self.client,
                settings,
                fingerprints: self
                    .fingerprints
                    .unwrap_or_else(|| Arc::new(MemoryFingerprintStore::new())),
                credentials: self.credentials.unwrap_or_else(|| Arc::new(NoCredentials)),
                options: self.options,
                config: self.config,
                state: Mutex::new(state),
                snapshot_tx,
                last_attempt_tx,
            }),
        }
    }
}

/// Drives connection attempts through a [`GatewayClient`].
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ConnectionOrchestrator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ConnectionOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionOrchestrator")
            .field("phase", &self.inner.snapshot_tx.borrow().phase)
            .finish_non_exhaustive()
    }
}

fn validate_manual(host: &str, port: i64) -> Result<(String, u16)> {
    let host = host.trim();
    if host.is_empty() {
        return Err(ConfigError::EmptyHost.into());
    }
    let port = u16::try_from(port)
        .ok()
        .filter(|p| *p != 0)
        .ok_or(ConfigError::PortOutOfRange(port))?;
    endpoint_url(host, port, false)?;
    Ok((host.to_string(), port))
}

impl ConnectionOrchestrator {
    /// Start building an orchestrator around a client.
    pub fn builder<C: GatewayClient>(client: C) -> OrchestratorBuilder {
        Self::builder_shared(Arc::new(client))
    }

    /// Start building an orchestrator around a shared client.
    pub fn builder_shared(client: Arc<dyn GatewayClient>) -> OrchestratorBuilder {
        OrchestratorBuilder {
            client,
            settings: None,
            fingerprints: None,
            credentials: None,
            options: ConnectOptions::default(),
            config: OrchestratorConfig::default(),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current connection snapshot.
    pub fn snapshot(&self) -> ConnectionSnapshot {
        self.inner.snapshot_tx.borrow().clone()
    }

    /// Subscribe to connection snapshots.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionSnapshot> {
        self.inner.snapshot_tx.subscribe()
    }

    /// Most recent attempted endpoint, from memory or durable storage.
    pub fn last_attempt(&self) -> Option<LastAttemptedEndpoint> {
        self.inner.last_attempt_tx.borrow().clone()
    }

    /// Subscribe to last-attempt updates.
    pub fn subscribe_last_attempt(&self) -> watch::Receiver<Option<LastAttemptedEndpoint>> {
        self.inner.last_attempt_tx.subscribe()
    }

    /// Whether an attempt happened since the last re-arm.
    pub fn has_attempted(&self) -> bool {
        self.state().attempted
    }

    /// Explicitly chosen gateway.
    pub fn preferred(&self) -> Option<String> {
        self.state().preferred.clone()
    }

    /// Gateway remembered from discovery.
    pub fn last_discovered(&self) -> Option<String> {
        self.state().last_discovered.clone()
    }

    /// Set or clear the explicitly chosen gateway.
    pub fn set_preferred(&self, stable_id: Option<&str>) {
        let id = stable_id.map(str::trim).filter(|s| !s.is_empty());
        self.state().preferred = id.map(str::to_string);
        self.inner.settings.set_preferred_stable_id(id);
    }

    /// Allow auto-connect to fire again.
    pub fn rearm(&self) {
        debug!("orchestrator: auto-connect re-armed");
        self.state().attempted = false;
    }

    /// Take in a new catalog.
    ///
    /// Re-arms on a new discovery generation, and remembers the first
    /// gateway as last-discovered while no gateway is remembered at all.
    pub fn handle_catalog(&self, catalog: CatalogSnapshot) {
        let remember = {
            let mut state = self.state();
            if catalog.generation != state.catalog.generation {
                debug!(generation = catalog.generation, "orchestrator: discovery restarted");
                state.attempted = false;
            }
            let remember = match (&state.preferred, &state.last_discovered) {
                (None, None) => catalog.gateways.first().map(|g| g.stable_id.clone()),
                _ => None,
            };
            if let Some(id) = &remember {
                state.last_discovered = Some(id.clone());
            }
            state.catalog = catalog;
            remember
        };
        if let Some(id) = remember {
            debug!(stable_id = %id, "orchestrator: remembering first discovered gateway");
            self.inner.settings.set_last_discovered_stable_id(Some(&id));
        }
    }

    /// Run auto-connect precedence once.
    ///
    /// Manual mode wins when enabled; otherwise the preferred, then the
    /// last-discovered gateway, if present in the current catalog.
    pub async fn auto_connect(&self) -> Result<AutoConnectOutcome> {
        if !self.inner.config.auto_connect {
            return Ok(AutoConnectOutcome::Disabled);
        }
        let phase = self.inner.snapshot_tx.borrow().phase;
        if matches!(phase, ConnectionPhase::Connecting | ConnectionPhase::Connected) {
            return Ok(AutoConnectOutcome::Busy);
        }
        if self.state().attempted {
            return Ok(AutoConnectOutcome::AlreadyAttempted);
        }

        let manual = self.inner.settings.manual();
        let endpoint = if manual.enabled {
            if manual.host.trim().is_empty() {
                debug!("orchestrator: manual mode without host");
                return Ok(AutoConnectOutcome::NoCandidate);
            }
            let port = manual.port.unwrap_or(i64::from(self.inner.config.default_port));
            let (host, port) = validate_manual(&manual.host, port)?;
            self.manual_endpoint(host, port, manual.use_tls, ConnectSource::AutoConnect)?
        } else {
            let Some(gateway) = self.pick_candidate() else {
                return Ok(AutoConnectOutcome::NoCandidate);
            };
            match self.discovered_endpoint(&gateway, ConnectSource::AutoConnect)? {
                Some(endpoint) => endpoint,
                None => {
                    debug!(stable_id = %gateway.stable_id, "orchestrator: candidate has no host yet");
                    return Ok(AutoConnectOutcome::NoCandidate);
                }
            }
        };

        // Concurrent evaluations may all get this far; only one fires.
        if !self.claim() {
            return Ok(AutoConnectOutcome::AlreadyAttempted);
        }
        info!(
            host = %endpoint.host,
            port = endpoint.port,
            stable_id = %endpoint.stable_id,
            "orchestrator: auto-connecting"
        );
        self.attempt(endpoint).await.map(AutoConnectOutcome::Connected)
    }

    /// Set the attempted guard. False if it was already set.
    fn claim(&self) -> bool {
        let mut state = self.state();
        !std::mem::replace(&mut state.attempted, true)
    }

    fn pick_candidate(&self) -> Option<DiscoveredGateway> {
        let state = self.state();
        let found = [state.preferred.as_deref(), state.last_discovered.as_deref()]
            .into_iter()
            .flatten()
            .find_map(|id| state.catalog.find(id))
            .cloned();
        found
    }

    fn discovered_endpoint(&self, gateway: &DiscoveredGateway, source: ConnectSource) -> Result<Option<Endpoint>> {
        let Some(host) = gateway.host() else {
            return Ok(None);
        };
        let endpoint = Endpoint::new(
            host.to_string(),
            gateway.gateway_port.unwrap_or(self.inner.config.default_port),
            gateway.stable_id.clone(),
            TlsParams::for_gateway(gateway, self.inner.fingerprints.as_ref()),
            source,
        )?;
        Ok(Some(endpoint))
    }

    fn manual_endpoint(&self, host: String, port: u16, use_tls: bool, source: ConnectSource) -> Result<Endpoint> {
        let tls = TlsParams::for_manual(&host, port, use_tls, self.inner.fingerprints.as_ref());
        Endpoint::new(host, port, tls.store_key.clone(), tls, source)
    }

    /// Connect to a gateway from the current catalog and prefer it from now on.
    pub async fn connect_discovered(&self, stable_id: &str) -> Result<ConnectionSnapshot> {
        let gateway = self
            .state()
            .catalog
            .find(stable_id)
            .cloned()
            .ok_or_else(|| Error::connection(format!("gateway {stable_id} is not in the catalog")))?;
        let endpoint = self
            .discovered_endpoint(&gateway, ConnectSource::Discovered)?
            .ok_or_else(|| Error::connection(format!("gateway {stable_id} has no resolved host")))?;
        self.set_preferred(Some(stable_id));
        self.attempt(endpoint).await
    }

    /// Connect to a manually entered endpoint.
    ///
    /// The host and port are validated before anything is computed or persisted.
    pub async fn connect_manual(&self, host: &str, port: i64, use_tls: bool) -> Result<ConnectionSnapshot> {
        let (host, port) = validate_manual(host, port)?;
        let endpoint = self.manual_endpoint(host, port, use_tls, ConnectSource::Manual)?;
        self.attempt(endpoint).await
    }

    /// Repeat the last attempt. `Ok(None)` when nothing was ever attempted.
    ///
    /// Trust stays keyed by the identity the endpoint was attempted under,
    /// even when that gateway is no longer in the catalog.
    pub async fn reconnect_last_attempt(&self) -> Result<Option<ConnectionSnapshot>> {
        let (last, gateway) = {
            let state = self.state();
            let Some(last) = state
                .last_attempt
                .clone()
                .or_else(|| self.inner.settings.last_attempt())
            else {
                return Ok(None);
            };
            let gateway = match last.source {
                ConnectSource::Manual => None,
                _ => state
                    .catalog
                    .gateways
                    .iter()
                    .find(|g| match last.stable_id.as_deref() {
                        Some(id) => g.stable_id == id,
                        None => {
                            g.host() == Some(last.host.as_str())
                                && g.gateway_port.unwrap_or(self.inner.config.default_port) == last.port
                        }
                    })
                    .cloned(),
            };
            (last, gateway)
        };

        let store = self.inner.fingerprints.as_ref();
        let endpoint = match gateway {
            Some(gateway) => Endpoint::new(
                last.host,
                last.port,
                gateway.stable_id.clone(),
                TlsParams::for_gateway(&gateway, store),
                last.source,
            )?,
            None => {
                let stable_id = last
                    .stable_id
                    .clone()
                    .unwrap_or_else(|| manual_stable_id(&last.host, last.port));
                let tls = TlsParams::for_identity(&stable_id, last.use_tls, store);
                Endpoint::new(last.host, last.port, stable_id, tls, last.source)?
            }
        };
        debug!(stable_id = %endpoint.stable_id, source = %endpoint.source, "orchestrator: reconnecting");
        self.attempt(endpoint).await.map(Some)
    }

    /// Disconnect. Does not re-arm auto-connect.
    pub async fn disconnect(&self) {
        self.inner.client.disconnect().await;
        let attempt = self.state().attempt_seq;
        self.inner.snapshot_tx.send_replace(ConnectionSnapshot {
            attempt,
            ..ConnectionSnapshot::default()
        });
        info!("orchestrator: disconnected");
    }

    fn target(&self, endpoint: &Endpoint) -> Result<ConnectTarget> {
        let instance_id = &self.inner.options.instance_id;
        Ok(ConnectTarget {
            url: endpoint.url.clone(),
            stable_id: endpoint.stable_id.clone(),
            tls: endpoint.tls.clone(),
            token: self.inner.credentials.token(instance_id)?,
            password: self.inner.credentials.password(instance_id)?,
            options: self.inner.options.clone(),
        })
    }

    /// Check the presented fingerprint and pin it on first use.
    fn check_trust(&self, tls: &TlsParams, handshake: &Handshake) -> Result<()> {
        if !tls.required {
            return Ok(());
        }
        match handshake.peer_fingerprint.as_deref() {
            Some(presented) => {
                tls.accept(presented, self.inner.fingerprints.as_ref())?;
            }
            None => {
                tls.verify("")?;
            }
        }
        Ok(())
    }

    async fn dial(&self, target: &ConnectTarget) -> Result<()> {
        match self.inner.client.connect(target).await {
            Ok(handshake) => match self.check_trust(&target.tls, &handshake) {
                Ok(()) => Ok(()),
                Err(e) => {
                    self.inner.client.disconnect().await;
                    Err(e)
                }
            },
            Err(e) => Err(match e.downcast::<TrustError>() {
                Ok(trust) => Error::Trust(trust),
                Err(e) => Error::Client(e),
            }),
        }
    }

    async fn attempt(&self, endpoint: Endpoint) -> Result<ConnectionSnapshot> {
        let record = LastAttemptedEndpoint {
            host: endpoint.host.clone(),
            port: endpoint.port,
            use_tls: endpoint.tls.required,
            source: endpoint.source,
            stable_id: Some(endpoint.stable_id.clone()),
        };
        let seq = {
            let mut state = self.state();
            state.attempted = true;
            state.attempt_seq += 1;
            state.last_attempt = Some(record.clone());
            state.attempt_seq
        };
        self.inner.settings.set_last_attempt(&record);
        self.inner.last_attempt_tx.send_replace(Some(record));

        let url = endpoint.url.to_string();
        self.inner.snapshot_tx.send_replace(ConnectionSnapshot {
            phase: ConnectionPhase::Connecting,
            attempt: seq,
            url: Some(url.clone()),
            stable_id: Some(endpoint.stable_id.clone()),
            ..ConnectionSnapshot::default()
        });
        info!(%url, stable_id = %endpoint.stable_id, source = %endpoint.source, "orchestrator: connecting");

        let result = match self.target(&endpoint) {
            Ok(target) => self.dial(&target).await,
            Err(e) => {
                warn!(stable_id = %endpoint.stable_id, error = %e, "orchestrator: cannot load credentials");
                Err(e)
            }
        };

        let snapshot = match &result {
            Ok(()) => ConnectionSnapshot {
                phase: ConnectionPhase::Connected,
                attempt: seq,
                url: Some(url),
                stable_id: Some(endpoint.stable_id.clone()),
                server_name: self.inner.client.server_name(),
                remote_address: self.inner.client.remote_address(),
                error: None,
                trust_failure: false,
            },
            Err(e) => ConnectionSnapshot {
                phase: ConnectionPhase::Failed,
                attempt: seq,
                url: Some(url),
                stable_id: Some(endpoint.stable_id.clone()),
                server_name: None,
                remote_address: None,
                error: Some(e.to_string()),
                trust_failure: e.is_trust_failure(),
            },
        };

        // A newer explicit attempt owns the snapshot now.
        if self.state().attempt_seq == seq {
            self.inner.snapshot_tx.send_replace(snapshot.clone());
        }
        match result {
            Ok(()) => {
                info!(stable_id = %endpoint.stable_id, "orchestrator: connected");
                Ok(snapshot)
            }
            Err(e) => {
                warn!(
                    stable_id = %endpoint.stable_id,
                    error = %e,
                    trust = e.is_trust_failure(),
                    "orchestrator: connection failed"
                );
                Err(e)
            }
        }
    }

    /// Follow a catalog feed: every update is taken in and auto-connect
    /// evaluated. Returns when the feed closes.
    pub async fn run(&self, mut catalog: watch::Receiver<CatalogSnapshot>) {
        loop {
            let snapshot = catalog.borrow_and_update().clone();
            self.handle_catalog(snapshot);
            match self.auto_connect().await {
                Ok(AutoConnectOutcome::Connected(snap)) => {
                    debug!(stable_id = ?snap.stable_id, "orchestrator: auto-connect succeeded");
                }
                Ok(outcome) => debug!(?outcome, "orchestrator: auto-connect skipped"),
                Err(e) => debug!(error = %e, "orchestrator: auto-connect failed"),
            }
            if catalog.changed().await.is_err() {
                break;
            }
        }
        debug!("orchestrator: catalog feed closed");
    }

    /// Spawn [`run`](Self::run) on the current runtime.
    pub fn spawn(&self, catalog: watch::Receiver<CatalogSnapshot>) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move { this.run(catalog).await })
    }
}
