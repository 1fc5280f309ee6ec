use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use gateway_discovery::catalog::{derive_gateway, txt};
use gateway_discovery::error::{ConfigError, Error, TrustError};
use gateway_discovery::identity::{manual_stable_id, ServiceIdentity};
use gateway_discovery::orchestrator::{CredentialStore, Handshake, StaticCredentials};
use gateway_discovery::settings::{ConnectSource, ManualEndpoint};
use gateway_discovery::trust::{FingerprintStore, MemoryFingerprintStore};
use gateway_discovery::watcher::{Advertisement, StaticSource};
use gateway_discovery::{
    AutoConnectOutcome, CatalogSnapshot, ConnectOptions, ConnectTarget, ConnectionOrchestrator,
    ConnectionPhase, DiscoveredGateway, DiscoveryService, GatewayClient, GatewaySettings, TlsParams,
};
use tokio::time::timeout;
use tokio_test::{assert_err, assert_ok};

const TYPE: &str = "_openclaw-gw._tcp";

#[derive(Default)]
struct MockState {
    targets: Vec<ConnectTarget>,
    present: Option<String>,
    reject_with: Option<TrustError>,
    disconnects: usize,
    connected: bool,
    delay: Duration,
}

/// Records every target; optionally presents a fingerprint or fails.
#[derive(Clone, Default)]
struct MockClient {
    state: Arc<Mutex<MockState>>,
}

impl MockClient {
    fn presenting(fingerprint: &str) -> Self {
        let client = Self::default();
        client.state.lock().unwrap().present = Some(fingerprint.to_string());
        client
    }

    fn targets(&self) -> Vec<ConnectTarget> {
        self.state.lock().unwrap().targets.clone()
    }

    fn disconnects(&self) -> usize {
        self.state.lock().unwrap().disconnects
    }
}

#[async_trait]
impl GatewayClient for MockClient {
    async fn connect(&self, target: &ConnectTarget) -> anyhow::Result<Handshake> {
        let delay = self.state.lock().unwrap().delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state.lock().unwrap();
        state.targets.push(target.clone());
        if let Some(err) = state.reject_with.clone() {
            return Err(err.into());
        }
        state.connected = true;
        Ok(Handshake {
            peer_fingerprint: state.present.clone(),
        })
    }

    async fn disconnect(&self) {
        let mut state = self.state.lock().unwrap();
        state.disconnects += 1;
        state.connected = false;
    }

    fn server_name(&self) -> Option<String> {
        self.state
            .lock()
            .unwrap()
            .connected
            .then(|| "Molty".to_string())
    }

    fn remote_address(&self) -> Option<String> {
        None
    }
}

fn gateway(name: &str, host: &str) -> DiscoveredGateway {
    let advert = Advertisement::new(ServiceIdentity::new(name, TYPE, "local."))
        .with_txt(txt::LAN_HOST, host)
        .with_txt(txt::GATEWAY_PORT, "18789");
    derive_gateway(&advert, None)
}

fn catalog(gateways: Vec<DiscoveredGateway>) -> CatalogSnapshot {
    CatalogSnapshot {
        status: "ready".to_string(),
        gateways: gateways.into(),
        generation: 1,
    }
}

fn orchestrator(client: &MockClient, settings: &GatewaySettings) -> ConnectionOrchestrator {
    ConnectionOrchestrator::builder(client.clone())
        .settings(settings.clone())
        .build()
}

#[test_log::test(tokio::test)]
async fn preferred_gateway_waits_until_present_then_fires_once() {
    let a = gateway("A", "10.0.0.1");
    let b = gateway("B", "10.0.0.2");
    let settings = GatewaySettings::in_memory();
    settings.set_preferred_stable_id(Some(&a.stable_id));
    let client = MockClient::default();
    let orch = orchestrator(&client, &settings);

    orch.handle_catalog(catalog(vec![b.clone()]));
    assert_eq!(assert_ok!(orch.auto_connect().await), AutoConnectOutcome::NoCandidate);
    assert!(client.targets().is_empty());
    assert_eq!(orch.last_discovered(), None);

    orch.handle_catalog(catalog(vec![a.clone(), b.clone()]));
    let outcome = assert_ok!(orch.auto_connect().await);
    let AutoConnectOutcome::Connected(snap) = outcome else {
        panic!("expected a connection, got {outcome:?}");
    };
    assert_eq!(snap.stable_id.as_deref(), Some(a.stable_id.as_str()));
    assert_eq!(snap.server_name.as_deref(), Some("Molty"));

    orch.handle_catalog(catalog(vec![a, b]));
    assert_eq!(assert_ok!(orch.auto_connect().await), AutoConnectOutcome::Busy);
    orch.disconnect().await;
    assert_eq!(
        assert_ok!(orch.auto_connect().await),
        AutoConnectOutcome::AlreadyAttempted
    );

    let targets = client.targets();
    assert_eq!(targets.len(), 1);
    assert_eq!(targets[0].url.to_string(), "ws://10.0.0.1:18789/");
    let last = settings.last_attempt().unwrap();
    assert_eq!(last.host, "10.0.0.1");
    assert_eq!(last.source, ConnectSource::AutoConnect);
}

#[test_log::test(tokio::test)]
async fn first_gateway_is_remembered_and_used() {
    let settings = GatewaySettings::in_memory();
    let client = MockClient::default();
    let orch = orchestrator(&client, &settings);
    let b = gateway("B", "10.0.0.2");
    let c = gateway("C", "10.0.0.3");

    orch.handle_catalog(catalog(vec![b.clone(), c.clone()]));
    assert_eq!(orch.last_discovered(), Some(b.stable_id.clone()));
    assert_eq!(settings.last_discovered_stable_id(), Some(b.stable_id.clone()));

    // Only while nothing is remembered.
    orch.handle_catalog(catalog(vec![c, b.clone()]));
    assert_eq!(orch.last_discovered(), Some(b.stable_id.clone()));

    assert!(matches!(
        orch.auto_connect().await,
        Ok(AutoConnectOutcome::Connected(_))
    ));
    assert_eq!(client.targets()[0].stable_id, b.stable_id);
}

#[test_log::test(tokio::test)]
async fn new_discovery_generation_rearms() {
    let settings = GatewaySettings::in_memory();
    let client = MockClient::default();
    let orch = orchestrator(&client, &settings);
    let a = gateway("A", "10.0.0.1");

    orch.handle_catalog(catalog(vec![a.clone()]));
    assert_ok!(orch.auto_connect().await);
    orch.disconnect().await;
    assert!(orch.has_attempted());

    let mut restarted = catalog(vec![a]);
    restarted.generation = 2;
    orch.handle_catalog(restarted);
    assert!(!orch.has_attempted());
    assert_ok!(orch.auto_connect().await);
    assert_eq!(client.targets().len(), 2);
}

#[test_log::test(tokio::test)]
async fn manual_mode_wins_and_uses_synthetic_identity() {
    let settings = GatewaySettings::in_memory();
    settings.set_manual(&ManualEndpoint {
        enabled: true,
        host: "gateway.local".to_string(),
        port: Some(18790),
        use_tls: true,
    });
    let client = MockClient::presenting("AA:BB");
    let orch = orchestrator(&client, &settings);
    orch.handle_catalog(catalog(vec![gateway("A", "10.0.0.1")]));

    assert_ok!(orch.auto_connect().await);
    let target = &client.targets()[0];
    assert_eq!(target.url.to_string(), "wss://gateway.local:18790/");
    assert_eq!(target.stable_id, manual_stable_id("Gateway.Local", 18790));
    assert!(target.tls.allow_tofu);
}

#[test_log::test(tokio::test)]
async fn manual_without_host_is_no_candidate() {
    let settings = GatewaySettings::in_memory();
    settings.set_manual(&ManualEndpoint {
        enabled: true,
        host: String::new(),
        port: Some(18789),
        use_tls: false,
    });
    let client = MockClient::default();
    let orch = orchestrator(&client, &settings);
    assert_eq!(assert_ok!(orch.auto_connect().await), AutoConnectOutcome::NoCandidate);
    assert!(!orch.has_attempted());
}

#[test_log::test(tokio::test)]
async fn invalid_manual_input_is_rejected_before_persistence() {
    let settings = GatewaySettings::in_memory();
    let client = MockClient::default();
    let orch = orchestrator(&client, &settings);

    let err = assert_err!(orch.connect_manual("gw.local", 70000, false).await);
    assert!(matches!(err, Error::Config(ConfigError::PortOutOfRange(70000))));
    let err = assert_err!(orch.connect_manual("  ", 18789, false).await);
    assert!(matches!(err, Error::Config(ConfigError::EmptyHost)));
    let err = assert_err!(orch.connect_manual("bad host/path", 18789, true).await);
    assert!(matches!(err, Error::Config(ConfigError::InvalidHost(_))));

    assert!(client.targets().is_empty());
    assert_eq!(settings.last_attempt(), None);
    assert_eq!(orch.last_attempt(), None);
    assert!(!orch.has_attempted());
}

#[test_log::test(tokio::test)]
async fn explicit_connect_sets_guard_and_preference() {
    let settings = GatewaySettings::in_memory();
    let client = MockClient::default();
    let orch = orchestrator(&client, &settings);
    let b = gateway("B", "10.0.0.2");
    orch.handle_catalog(catalog(vec![gateway("A", "10.0.0.1"), b.clone()]));

    let snap = assert_ok!(orch.connect_discovered(&b.stable_id).await);
    assert_eq!(snap.phase, ConnectionPhase::Connected);
    assert!(orch.has_attempted());
    assert_eq!(settings.preferred_stable_id(), Some(b.stable_id.clone()));
    assert_eq!(
        settings.last_attempt().map(|l| l.source),
        Some(ConnectSource::Discovered)
    );

    assert_err!(orch.connect_discovered("service:missing").await);
}

#[test_log::test(tokio::test)]
async fn fingerprint_mismatch_is_a_trust_failure() {
    let settings = GatewaySettings::in_memory();
    let pins = Arc::new(MemoryFingerprintStore::new());
    let client = MockClient::presenting("cc:dd");
    let orch = ConnectionOrchestrator::builder(client.clone())
        .settings(settings)
        .fingerprints(pins.clone())
        .build();

    let mut gw = gateway("A", "10.0.0.1");
    gw.tls_fingerprint = Some("AA:BB".to_string());
    orch.handle_catalog(catalog(vec![gw.clone()]));

    let err = assert_err!(orch.connect_discovered(&gw.stable_id).await);
    assert!(err.is_trust_failure());
    assert!(matches!(err, Error::Trust(TrustError::FingerprintMismatch { .. })));
    assert_eq!(client.disconnects(), 1);
    assert_eq!(pins.pinned(&gw.stable_id), None);

    let snap = orch.snapshot();
    assert_eq!(snap.phase, ConnectionPhase::Failed);
    assert!(snap.trust_failure);
    assert_eq!(client.targets()[0].url.scheme_str(), Some("wss"));
}

#[test_log::test(tokio::test)]
async fn client_reported_trust_error_keeps_its_kind() {
    let client = MockClient::default();
    client.state.lock().unwrap().reject_with = Some(TrustError::Unpinned {
        stable_id: "manual:x".to_string(),
    });
    let orch = orchestrator(&client, &GatewaySettings::in_memory());
    let err = assert_err!(orch.connect_manual("gw.local", 18789, true).await);
    assert!(matches!(err, Error::Trust(TrustError::Unpinned { .. })));
}

#[test_log::test(tokio::test)]
async fn first_use_pins_and_later_mismatch_fails() {
    let pins = Arc::new(MemoryFingerprintStore::new());
    let mut gw = gateway("A", "10.0.0.1");
    gw.tls_enabled = true;

    let client = MockClient::presenting("sha256:AB:CD");
    let orch = ConnectionOrchestrator::builder(client.clone())
        .fingerprints(pins.clone())
        .build();
    orch.handle_catalog(catalog(vec![gw.clone()]));
    assert_ok!(orch.connect_discovered(&gw.stable_id).await);
    assert_eq!(pins.pinned(&gw.stable_id).as_deref(), Some("abcd"));

    let params = TlsParams::for_gateway(&gw, pins.as_ref());
    assert!(!params.allow_tofu);
    assert_eq!(params.expected_fingerprint.as_deref(), Some("abcd"));

    client.state.lock().unwrap().present = Some("ef01".to_string());
    let err = assert_err!(orch.connect_discovered(&gw.stable_id).await);
    assert!(err.is_trust_failure());
    assert_eq!(pins.pinned(&gw.stable_id).as_deref(), Some("abcd"));
}

#[test_log::test(tokio::test)]
async fn reconnect_uses_memory_then_durable_state() {
    let settings = GatewaySettings::in_memory();
    let client = MockClient::default();
    let orch = orchestrator(&client, &settings);
    assert_eq!(assert_ok!(orch.reconnect_last_attempt().await), None);
    assert!(client.targets().is_empty());

    assert_ok!(orch.connect_manual("gw.local", 18789, false).await);
    assert_ok!(orch.reconnect_last_attempt().await);
    let targets = client.targets();
    assert_eq!(targets.len(), 2);
    assert_eq!(targets[0].url, targets[1].url);

    // A fresh orchestrator over the same settings reconnects from storage.
    let client2 = MockClient::default();
    let orch2 = orchestrator(&client2, &settings);
    assert_eq!(orch2.last_attempt().map(|l| l.port), Some(18789));
    let snap = assert_ok!(orch2.reconnect_last_attempt().await).unwrap();
    assert_eq!(snap.url.as_deref(), Some("ws://gw.local:18789/"));
    assert_eq!(client2.targets()[0].stable_id, manual_stable_id("gw.local", 18789));
}

#[test_log::test(tokio::test)]
async fn credentials_and_options_reach_the_client() {
    let client = MockClient::default();
    let orch = ConnectionOrchestrator::builder(client.clone())
        .credentials(Arc::new(StaticCredentials::new().with_token("ios-1", "t0k")))
        .options(
            ConnectOptions::new("node", "ios-1")
                .capability("canvas")
                .command("camera.snap"),
        )
        .build();
    assert_ok!(orch.connect_manual("gw.local", 18789, false).await);
    let target = &client.targets()[0];
    assert_eq!(target.token.as_deref(), Some("t0k"));
    assert_eq!(target.password, None);
    assert_eq!(target.options.capabilities, ["canvas"]);
    assert_eq!(target.options.role, "node");
}

#[test_log::test(tokio::test)]
async fn follows_discovery_and_auto_connects() {
    let source = StaticSource::new().add(
        Advertisement::new(ServiceIdentity::new("Molty", TYPE, "local."))
            .with_txt(txt::LAN_HOST, "10.0.0.5")
            .with_txt(txt::GATEWAY_PORT, "18789"),
    );
    let discovery = DiscoveryService::builder(source).spawn();
    let client = MockClient::default();
    let orch = orchestrator(&client, &GatewaySettings::in_memory());
    let task = orch.spawn(discovery.subscribe());
    discovery.start().await.unwrap();

    let mut rx = orch.subscribe();
    timeout(
        Duration::from_secs(5),
        rx.wait_for(|s| s.phase == ConnectionPhase::Connected),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(client.targets().len(), 1);
    assert_eq!(client.targets()[0].url.to_string(), "ws://10.0.0.5:18789/");
    task.abort();
}

#[test_log::test(tokio::test)]
async fn reconnect_keeps_the_pin_after_the_gateway_leaves() {
    let settings = GatewaySettings::in_memory();
    let pins = Arc::new(MemoryFingerprintStore::new());
    let mut gw = gateway("A", "10.0.0.1");
    gw.tls_enabled = true;

    let client = MockClient::presenting("aa:bb");
    let orch = ConnectionOrchestrator::builder(client.clone())
        .settings(settings.clone())
        .fingerprints(pins.clone())
        .build();
    orch.handle_catalog(catalog(vec![gw.clone()]));
    assert_ok!(orch.connect_discovered(&gw.stable_id).await);
    assert_eq!(pins.pinned(&gw.stable_id).as_deref(), Some("aabb"));
    assert_eq!(
        settings.last_attempt().and_then(|l| l.stable_id),
        Some(gw.stable_id.clone())
    );

    orch.handle_catalog(catalog(vec![]));
    client.state.lock().unwrap().present = Some("ff:ff".to_string());
    let err = assert_err!(orch.reconnect_last_attempt().await);
    assert!(err.is_trust_failure());
    let target = client.targets().pop().unwrap();
    assert_eq!(target.stable_id, gw.stable_id);
    assert!(!target.tls.allow_tofu);
    assert_eq!(target.tls.expected_fingerprint.as_deref(), Some("aabb"));
    assert_eq!(pins.pinned(&manual_stable_id("10.0.0.1", 18789)), None);

    // Same from durable storage.
    let client2 = MockClient::presenting("ff:ff");
    let orch2 = ConnectionOrchestrator::builder(client2.clone())
        .settings(settings)
        .fingerprints(pins.clone())
        .build();
    let err = assert_err!(orch2.reconnect_last_attempt().await);
    assert!(err.is_trust_failure());
    assert_eq!(client2.targets()[0].stable_id, gw.stable_id);
    assert_eq!(pins.pinned(&gw.stable_id).as_deref(), Some("aabb"));
    assert_eq!(pins.pinned(&manual_stable_id("10.0.0.1", 18789)), None);
}

struct LockedKeychain;

impl CredentialStore for LockedKeychain {
    fn token(&self, _: &str) -> anyhow::Result<Option<String>> {
        anyhow::bail!("keychain locked")
    }

    fn password(&self, _: &str) -> anyhow::Result<Option<String>> {
        Ok(None)
    }
}

#[test_log::test(tokio::test)]
async fn credential_failure_still_counts_as_the_attempt() {
    let settings = GatewaySettings::in_memory();
    let client = MockClient::default();
    let orch = ConnectionOrchestrator::builder(client.clone())
        .settings(settings.clone())
        .credentials(Arc::new(LockedKeychain))
        .build();
    let a = gateway("A", "10.0.0.1");

    orch.handle_catalog(catalog(vec![a.clone()]));
    let err = assert_err!(orch.auto_connect().await);
    assert!(matches!(err, Error::Client(_)));
    assert!(orch.has_attempted());
    assert_eq!(settings.last_attempt().map(|l| l.host), Some("10.0.0.1".to_string()));

    let snap = orch.snapshot();
    assert_eq!(snap.phase, ConnectionPhase::Failed);
    assert!(!snap.trust_failure);

    for _ in 0..2 {
        orch.handle_catalog(catalog(vec![a.clone()]));
        assert_eq!(
            assert_ok!(orch.auto_connect().await),
            AutoConnectOutcome::AlreadyAttempted
        );
    }
    assert!(client.targets().is_empty());
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn concurrent_auto_connect_fires_once() {
    let client = MockClient::default();
    client.state.lock().unwrap().delay = Duration::from_millis(50);
    let orch = orchestrator(&client, &GatewaySettings::in_memory());
    orch.handle_catalog(catalog(vec![gateway("A", "10.0.0.1")]));

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let orch = orch.clone();
            tokio::spawn(async move { orch.auto_connect().await })
        })
        .collect();
    let mut connected = 0;
    for task in tasks {
        if let Ok(AutoConnectOutcome::Connected(_)) = task.await.unwrap() {
            connected += 1;
        }
    }
    assert_eq!(connected, 1);
    assert_eq!(client.targets().len(), 1);
}
