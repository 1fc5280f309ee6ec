//! Error types for gateway-discovery.

use std::time::Duration;

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Discovery watcher or actor error.
    #[error("Discovery error: {0}")]
    Discovery(#[from] DiscoveryError),

    /// Out-of-band name resolution error.
    #[error("Resolution error: {0}")]
    Resolution(#[from] ResolutionError),

    /// TLS trust failure. Never retryable.
    #[error("Trust error: {0}")]
    Trust(#[from] TrustError),

    /// Invalid endpoint configuration.
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// Settings store error.
    #[error("Settings error: {0}")]
    Settings(#[from] SettingsError),

    /// Connection error reported by the gateway client.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Opaque collaborator failure.
    #[error(transparent)]
    Client(#[from] anyhow::Error),
}

impl Error {
    /// Create a connection error.
    pub fn connection<S: Into<String>>(msg: S) -> Self {
        Self::Connection(msg.into())
    }

    /// Whether this error is a TLS trust failure.
    ///
    /// Trust failures must abort the attempt and must not be retried as if
    /// they were network failures. Errors wrapped by a client through
    /// `anyhow` are inspected as well.
    pub fn is_trust_failure(&self) -> bool {
        match self {
            Self::Trust(_) => true,
            Self::Client(e) => e.downcast_ref::<TrustError>().is_some(),
            _ => false,
        }
    }
}

/// Watcher-level discovery failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DiscoveryError {
    /// The browser for a domain could not be set up.
    #[error("setup failed for {domain}: {reason}")]
    Setup {
        /// Domain being browsed.
        domain: String,
        /// Underlying transport error.
        reason: String,
    },

    /// Transport error reported by a running browser.
    #[error("{0}")]
    Transport(String),

    /// The discovery actor has shut down.
    #[error("discovery service is shut down")]
    Shutdown,
}

impl DiscoveryError {
    /// Create a transport error.
    pub fn transport(msg: impl std::fmt::Display) -> Self {
        Self::Transport(msg.to_string())
    }
}

/// Name resolution failures. Always recovered locally.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolutionError {
    /// Resolution did not finish in time.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// Resolution was cancelled.
    #[error("cancelled")]
    Cancelled,

    /// Resolver-specific failure.
    #[error("{0}")]
    Failed(String),
}

impl ResolutionError {
    /// Create a resolver-specific failure.
    pub fn failed(msg: impl std::fmt::Display) -> Self {
        Self::Failed(msg.to_string())
    }
}

/// TLS trust failures. Fatal for the attempt.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TrustError {
    /// The presented certificate fingerprint does not match the expected one.
    #[error("fingerprint mismatch for {stable_id}: expected {expected}, got {presented}")]
    FingerprintMismatch {
        /// Identity the expectation belongs to.
        stable_id: String,
        /// Expected (advertised or pinned) fingerprint.
        expected: String,
        /// Fingerprint presented by the peer.
        presented: String,
    },

    /// No expected fingerprint and trust-on-first-use is disabled.
    #[error("no fingerprint to verify {stable_id} against and first use is not allowed")]
    Unpinned {
        /// Identity being verified.
        stable_id: String,
    },
}

/// Invalid endpoint configuration, rejected before any trust work.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// Host was empty after trimming.
    #[error("host is empty")]
    EmptyHost,

    /// Port outside 1-65535.
    #[error("port {0} is outside 1-65535")]
    PortOutOfRange(i64),

    /// Host could not form a valid endpoint URL.
    #[error("invalid host {0:?}")]
    InvalidHost(String),
}

/// Settings store failures.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    /// I/O error while persisting.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Encoding error while persisting.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
