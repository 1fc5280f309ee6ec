//! Collaborators the orchestrator drives: the gateway client and the
//! credential store, plus the connection target handed between them.

use std::collections::HashMap;
use std::net::Ipv6Addr;

use async_trait::async_trait;
use http::Uri;

use crate::error::ConfigError;
use crate::trust::TlsParams;

/// Client identity and capabilities presented to the gateway.
///
/// Opaque to this crate; passed through to the [`GatewayClient`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectOptions {
    /// Role the client connects as (e.g. `node`, `operator`).
    pub role: String,
    /// Advertised capabilities.
    pub capabilities: Vec<String>,
    /// Supported commands.
    pub commands: Vec<String>,
    /// Client instance identity. Credentials are looked up by it.
    pub instance_id: String,
    /// Human-readable client name.
    pub display_name: Option<String>,
}

impl ConnectOptions {
    /// Options for a client instance.
    pub fn new(role: impl Into<String>, instance_id: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            instance_id: instance_id.into(),
            ..Self::default()
        }
    }

    /// Add a capability.
    pub fn capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.push(capability.into());
        self
    }

    /// Add a supported command.
    pub fn command(mut self, command: impl Into<String>) -> Self {
        self.commands.push(command.into());
        self
    }

    /// Set the display name.
    pub fn display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }
}

/// Everything the client needs for one connection attempt.
#[derive(Debug, Clone)]
pub struct ConnectTarget {
    /// `ws://` or `wss://` endpoint.
    pub url: Uri,
    /// Identity the attempt belongs to; also the trust pin key.
    pub stable_id: String,
    /// Trust parameters. Clients verify the handshake with [`TlsParams::verify`].
    pub tls: TlsParams,
    /// Gateway token, if stored.
    pub token: Option<String>,
    /// Gateway password, if stored.
    pub password: Option<String>,
    /// Client identity and capabilities.
    pub options: ConnectOptions,
}

/// What the client observed during a successful handshake.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Handshake {
    /// Certificate fingerprint the gateway presented, when TLS was used.
    pub peer_fingerprint: Option<String>,
}

/// The external gateway client.
///
/// The orchestrator never holds a lock across these calls.
#[async_trait]
pub trait GatewayClient: Send + Sync + 'static {
    /// Connect to a target, replacing any existing connection.
    ///
    /// Returning a [`TrustError`](crate::error::TrustError) inside the
    /// `anyhow::Error` marks the failure as a trust failure.
    async fn connect(&self, target: &ConnectTarget) -> anyhow::Result<Handshake>;

    /// Close the current connection, if any.
    async fn disconnect(&self);

    /// Name the connected gateway reported.
    fn server_name(&self) -> Option<String>;

    /// Remote address of the current connection.
    fn remote_address(&self) -> Option<String>;
}

/// Token and password storage keyed by client instance identity.
pub trait CredentialStore: Send + Sync + 'static {
    /// Stored token.
    fn token(&self, instance_id: &str) -> anyhow::Result<Option<String>>;
    /// Stored password.
    fn password(&self, instance_id: &str) -> anyhow::Result<Option<String>>;
}

/// Store without any credentials.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCredentials;

impl CredentialStore for NoCredentials {
    fn token(&self, _: &str) -> anyhow::Result<Option<String>> {
        Ok(None)
    }

    fn password(&self, _: &str) -> anyhow::Result<Option<String>> {
        Ok(None)
    }
}

/// Fixed credentials per instance identity.
#[derive(Debug, Default, Clone)]
pub struct StaticCredentials {
    tokens: HashMap<String, String>,
    passwords: HashMap<String, String>,
}

impl StaticCredentials {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a token.
    pub fn with_token(mut self, instance_id: impl Into<String>, token: impl Into<String>) -> Self {
        self.tokens.insert(instance_id.into(), token.into());
        self
    }

    /// Store a password.
    pub fn with_password(mut self, instance_id: impl Into<String>, password: impl Into<String>) -> Self {
        self.passwords.insert(instance_id.into(), password.into());
        self
    }
}

impl CredentialStore for StaticCredentials {
    fn token(&self, instance_id: &str) -> anyhow::Result<Option<String>> {
        Ok(self.tokens.get(instance_id).cloned())
    }

    fn password(&self, instance_id: &str) -> anyhow::Result<Option<String>> {
        Ok(self.passwords.get(instance_id).cloned())
    }
}

/// Build the websocket endpoint for a host and port.
///
/// `wss` when TLS is required, `ws` otherwise. IPv6 literals are bracketed.
pub fn endpoint_url(host: &str, port: u16, tls_required: bool) -> Result<Uri, ConfigError> {
    let host = host.trim();
    if host.is_empty() {
        return Err(ConfigError::EmptyHost);
    }
    let scheme = if tls_required { "wss" } else { "ws" };
    let authority = if host.parse::<Ipv6Addr>().is_ok() {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    };
    format!("{scheme}://{authority}")
        .parse::<Uri>()
        .map_err(|_| ConfigError::InvalidHost(host.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheme_follows_tls() {
        assert_eq!(
            endpoint_url("10.0.0.5", 18789, false).unwrap().to_string(),
            "ws://10.0.0.5:18789/"
        );
        assert_eq!(
            endpoint_url("gw.local", 443, true).unwrap().to_string(),
            "wss://gw.local:443/"
        );
    }

    #[test]
    fn ipv6_is_bracketed() {
        let url = endpoint_url("fe80::1", 18789, false).unwrap();
        assert_eq!(url.host(), Some("[fe80::1]"));
        assert_eq!(url.port_u16(), Some(18789));
    }

    #[test]
    fn rejects_bad_hosts() {
        assert_eq!(endpoint_url("  ", 1, false), Err(ConfigError::EmptyHost));
        assert!(matches!(
            endpoint_url("bad host/path", 1, false),
            Err(ConfigError::InvalidHost(_))
        ));
    }

    #[test]
    fn static_credentials_by_instance() {
        let creds = StaticCredentials::new()
            .with_token("ios-1", "t0k")
            .with_password("mac-1", "hunter2");
        assert_eq!(creds.token("ios-1").unwrap().as_deref(), Some("t0k"));
        assert_eq!(creds.password("ios-1").unwrap(), None);
        assert_eq!(creds.password("mac-1").unwrap().as_deref(), Some("hunter2"));
        assert_eq!(NoCredentials.token("ios-1").unwrap(), None);
    }
}
