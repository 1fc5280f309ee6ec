//! Pure derivation of a discovered gateway from an advertisement.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::identity::{display_name, normalize_host};
use crate::watcher::{Advertisement, ResolvedMetadata};

/// Metadata keys gateways advertise.
pub mod txt {
    /// LAN host name or address.
    pub const LAN_HOST: &str = "lanHost";
    /// Tailnet (overlay network) DNS name.
    pub const TAILNET_DNS: &str = "tailnetDns";
    /// Gateway websocket port.
    pub const GATEWAY_PORT: &str = "gatewayPort";
    /// Canvas host port.
    pub const CANVAS_PORT: &str = "canvasPort";
    /// Whether the gateway serves TLS.
    pub const GATEWAY_TLS: &str = "gatewayTls";
    /// SHA-256 fingerprint of the gateway certificate.
    pub const TLS_FINGERPRINT: &str = "gatewayTlsSha256";
    /// Path of the gateway CLI on its host.
    pub const CLI_PATH: &str = "cliPath";
    /// Human-readable gateway name.
    pub const DISPLAY_NAME: &str = "displayName";
}

/// A gateway as shown to consumers. Rebuilt from scratch on every change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredGateway {
    /// Display name.
    pub name: String,
    /// Deterministic identity.
    pub stable_id: String,
    /// Diagnostic identity (`name.type.domain`).
    pub debug_id: String,
    /// Domain the gateway was seen in.
    pub domain: String,
    /// LAN host, from metadata or resolution.
    pub lan_host: Option<String>,
    /// Tailnet host, from metadata.
    pub tailnet_host: Option<String>,
    /// Gateway port.
    pub gateway_port: Option<u16>,
    /// Canvas port.
    pub canvas_port: Option<u16>,
    /// Whether the gateway advertises TLS.
    pub tls_enabled: bool,
    /// Advertised certificate fingerprint.
    pub tls_fingerprint: Option<String>,
    /// Advertised CLI path.
    pub cli_path: Option<String>,
}

impl DiscoveredGateway {
    /// Host to connect to: LAN host, else tailnet host.
    pub fn host(&self) -> Option<&str> {
        self.lan_host.as_deref().or(self.tailnet_host.as_deref())
    }
}

fn non_empty(map: &BTreeMap<String, String>, key: &str) -> Option<String> {
    map.get(key)
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn parse_port(value: Option<String>) -> Option<u16> {
    value?.parse::<u16>().ok().filter(|p| *p != 0)
}

fn truthy(value: Option<String>) -> bool {
    matches!(
        value.map(|v| v.to_ascii_lowercase()).as_deref(),
        Some("1" | "true" | "yes")
    )
}

/// Whether an advertisement lacks any connectable host in its own metadata.
pub fn needs_resolution(advert: &Advertisement) -> bool {
    normalize_host(advert.txt.get(txt::LAN_HOST).map(String::as_str)).is_none()
        && normalize_host(advert.txt.get(txt::TAILNET_DNS).map(String::as_str)).is_none()
}

/// Derive a gateway from an advertisement and an optional resolver overlay.
pub fn derive_gateway(advert: &Advertisement, overlay: Option<&ResolvedMetadata>) -> DiscoveredGateway {
    let mut meta = advert.txt.clone();
    if let Some(overlay) = overlay {
        for (k, v) in &overlay.txt {
            meta.insert(k.clone(), v.clone());
        }
    }

    let lan_host = normalize_host(meta.get(txt::LAN_HOST).map(String::as_str)).or_else(|| {
        normalize_host(overlay.and_then(|o| o.host_name.as_deref()))
    });
    let tailnet_host = normalize_host(meta.get(txt::TAILNET_DNS).map(String::as_str));

    let gateway_port = parse_port(non_empty(&meta, txt::GATEWAY_PORT))
        .or_else(|| overlay.and_then(|o| o.port).filter(|p| *p != 0))
        .or(advert.port.filter(|p| *p != 0));

    let identity = &advert.identity;
    DiscoveredGateway {
        name: display_name(
            non_empty(&meta, txt::DISPLAY_NAME).as_deref(),
            &identity.name,
        ),
        stable_id: identity.stable_id(),
        debug_id: identity.debug_id(),
        domain: identity.domain.clone(),
        lan_host,
        tailnet_host,
        gateway_port,
        canvas_port: parse_port(non_empty(&meta, txt::CANVAS_PORT)),
        tls_enabled: truthy(non_empty(&meta, txt::GATEWAY_TLS)),
        tls_fingerprint: non_empty(&meta, txt::TLS_FINGERPRINT),
        cli_path: non_empty(&meta, txt::CLI_PATH),
    }
}
