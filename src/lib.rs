//! Gateway discovery and connection orchestration.
//!
//! Domain watchers feed a single catalog of discovered gateways; a
//! connection orchestrator picks what to connect to and resolves the TLS
//! trust decision before handing the attempt to a gateway client.

#![deny(missing_docs)]

pub mod catalog;
pub mod config;
pub mod discovery;
pub mod error;
pub mod identity;
pub mod orchestrator;
pub mod settings;
pub mod trust;
pub mod watcher;

// Re-export key types
pub use catalog::{CatalogSnapshot, DebugLogEntry, DiscoveredGateway};
pub use config::{DiscoveryConfig, OrchestratorConfig};
pub use discovery::{DiscoveryBuilder, DiscoveryService};
pub use error::{Error, Result};
pub use orchestrator::{
    AutoConnectOutcome, ConnectOptions, ConnectTarget, ConnectionOrchestrator, ConnectionPhase,
    ConnectionSnapshot, GatewayClient,
};
pub use settings::{GatewaySettings, JsonFileSettings, MemorySettings, SettingsStore};
pub use trust::{FingerprintStore, TlsParams};
