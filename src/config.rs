//! Tunables for discovery and connection orchestration.

use std::time::Duration;

/// DNS-SD service type advertised by gateways.
pub const DEFAULT_SERVICE_TYPE: &str = "_openclaw-gw._tcp";

/// Domain that is always browsed.
pub const DEFAULT_DOMAIN: &str = "local.";

/// Gateway port used when an advertisement does not carry one.
pub const DEFAULT_GATEWAY_PORT: u16 = 18789;

/// Configuration for the discovery subsystem.
#[derive(Clone, Debug)]
pub struct DiscoveryConfig {
    /// Service type to browse for.
    pub service_type: String,
    /// Domain browsed in addition to any operator override.
    pub default_domain: String,
    /// Timeout for a single out-of-band resolution.
    pub resolve_timeout: Duration,
    /// Quiet period before a domain edit restarts the watchers.
    pub debounce: Duration,
    /// Maximum retained debug log entries.
    pub debug_log_capacity: usize,
    /// Capacity of the aggregator mailbox shared by all watchers.
    pub mailbox_capacity: usize,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            service_type: DEFAULT_SERVICE_TYPE.to_string(),
            default_domain: DEFAULT_DOMAIN.to_string(),
            resolve_timeout: Duration::from_secs(2),
            debounce: Duration::from_millis(350),
            debug_log_capacity: 200,
            mailbox_capacity: 64,
        }
    }
}

impl DiscoveryConfig {
    /// Set the browsed service type. Default: `_openclaw-gw._tcp`.
    pub fn service_type(mut self, service_type: impl Into<String>) -> Self {
        self.service_type = service_type.into();
        self
    }

    /// Set the default domain. Default: `local.`.
    pub fn default_domain(mut self, domain: impl Into<String>) -> Self {
        self.default_domain = domain.into();
        self
    }

    /// Set the resolution timeout. Default: 2s.
    pub fn resolve_timeout(mut self, d: Duration) -> Self {
        self.resolve_timeout = d;
        self
    }

    /// Set the domain-edit debounce. Default: 350ms.
    pub fn debounce(mut self, d: Duration) -> Self {
        self.debounce = d;
        self
    }

    /// Set the debug log capacity. Default: 200.
    pub fn debug_log_capacity(mut self, n: usize) -> Self {
        self.debug_log_capacity = n.max(1);
        self
    }

    /// Set the aggregator mailbox capacity. Default: 64.
    pub fn mailbox_capacity(mut self, n: usize) -> Self {
        self.mailbox_capacity = n.max(1);
        self
    }

    /// Domains to browse given an optional operator override.
    ///
    /// The default domain always comes first; an override that is blank or
    /// equal to the default (ignoring case and the trailing dot) adds nothing.
    pub fn domains(&self, override_domain: Option<&str>) -> Vec<String> {
        let mut domains = vec![self.default_domain.clone()];
        if let Some(extra) = override_domain.map(str::trim).filter(|d| !d.is_empty()) {
            let canonical = |d: &str| d.trim_end_matches('.').to_ascii_lowercase();
            if canonical(extra) != canonical(&self.default_domain) {
                domains.push(extra.to_string());
            }
        }
        domains
    }
}

/// Configuration for the connection orchestrator.
#[derive(Clone, Debug)]
pub struct OrchestratorConfig {
    /// Port used when a gateway or manual endpoint does not name one.
    pub default_port: u16,
    /// Whether catalog updates may trigger an automatic connection.
    pub auto_connect: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            default_port: DEFAULT_GATEWAY_PORT,
            auto_connect: true,
        }
    }
}

impl OrchestratorConfig {
    /// Set the fallback port. Default: 18789.
    pub fn default_port(mut self, port: u16) -> Self {
        self.default_port = port;
        self
    }

    /// Enable or disable auto-connect. Default: enabled.
    pub fn auto_connect(mut self, enabled: bool) -> Self {
        self.auto_connect = enabled;
        self
    }
}
