//! Durable key/value settings.
//!
//! The store is injected as a trait object so every running instance (and
//! every test) owns its own settings. [`GatewaySettings`] layers typed
//! accessors for the keys this crate persists on top of any store.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::SettingsError;

/// Persisted key names.
pub mod keys {
    /// Host of the last connection attempt.
    pub const LAST_HOST: &str = "gateway.last.host";
    /// Port of the last connection attempt.
    pub const LAST_PORT: &str = "gateway.last.port";
    /// Whether the last attempt used TLS.
    pub const LAST_USE_TLS: &str = "gateway.last.tls";
    /// Source of the last attempt.
    pub const LAST_SOURCE: &str = "gateway.last.source";
    /// Stable ID of the last attempt; the trust pin key on reconnect.
    pub const LAST_STABLE_ID: &str = "gateway.last.stable_id";
    /// Stable ID the user explicitly chose.
    pub const PREFERRED_STABLE_ID: &str = "gateway.preferred_stable_id";
    /// First stable ID seen by discovery while nothing was chosen.
    pub const LAST_DISCOVERED_STABLE_ID: &str = "gateway.last_discovered_stable_id";
    /// Manual mode toggle.
    pub const MANUAL_ENABLED: &str = "gateway.manual.enabled";
    /// Manual host.
    pub const MANUAL_HOST: &str = "gateway.manual.host";
    /// Manual port.
    pub const MANUAL_PORT: &str = "gateway.manual.port";
    /// Manual TLS toggle.
    pub const MANUAL_TLS: &str = "gateway.manual.tls";
    /// Operator-supplied discovery domain.
    pub const DISCOVERY_DOMAIN: &str = "gateway.discovery.domain";
    /// Debug log toggle.
    pub const DEBUG_LOGGING: &str = "gateway.discovery.debug_logs";
}

/// A durable string/int/bool key/value store.
pub trait SettingsStore: Send + Sync + 'static {
    /// Read a string value.
    fn string(&self, key: &str) -> Option<String>;
    /// Read an integer value.
    fn int(&self, key: &str) -> Option<i64>;
    /// Read a boolean value.
    fn bool(&self, key: &str) -> Option<bool>;
    /// Write a string value.
    fn set_string(&self, key: &str, value: &str) -> Result<(), SettingsError>;
    /// Write an integer value.
    fn set_int(&self, key: &str, value: i64) -> Result<(), SettingsError>;
    /// Write a boolean value.
    fn set_bool(&self, key: &str, value: bool) -> Result<(), SettingsError>;
    /// Remove a value.
    fn remove(&self, key: &str) -> Result<(), SettingsError>;
}

/// A stored value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SettingValue {
    /// Boolean value.
    Bool(bool),
    /// Integer value.
    Int(i64),
    /// String value.
    String(String),
}

type ValueMap = BTreeMap<String, SettingValue>;

fn read<T>(map: &Mutex<ValueMap>, key: &str, f: impl FnOnce(&SettingValue) -> Option<T>) -> Option<T> {
    let map = map.lock().unwrap_or_else(PoisonError::into_inner);
    map.get(key).and_then(f)
}

/// In-process settings store.
#[derive(Debug, Default, Clone)]
pub struct MemorySettings {
    values: Arc<Mutex<ValueMap>>,
}

impl MemorySettings {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn write(&self, key: &str, value: Option<SettingValue>) {
        let mut map = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        match value {
            Some(v) => map.insert(key.to_string(), v),
            None => map.remove(key),
        };
    }
}

impl SettingsStore for MemorySettings {
    fn string(&self, key: &str) -> Option<String> {
        read(&self.values, key, |v| match v {
            SettingValue::String(s) => Some(s.clone()),
            _ => None,
        })
    }

    fn int(&self, key: &str) -> Option<i64> {
        read(&self.values, key, |v| match v {
            SettingValue::Int(i) => Some(*i),
            _ => None,
        })
    }

    fn bool(&self, key: &str) -> Option<bool> {
        read(&self.values, key, |v| match v {
            SettingValue::Bool(b) => Some(*b),
            _ => None,
        })
    }

    fn set_string(&self, key: &str, value: &str) -> Result<(), SettingsError> {
        self.write(key, Some(SettingValue::String(value.to_string())));
        Ok(())
    }

    fn set_int(&self, key: &str, value: i64) -> Result<(), SettingsError> {
        self.write(key, Some(SettingValue::Int(value)));
        Ok(())
    }

    fn set_bool(&self, key: &str, value: bool) -> Result<(), SettingsError> {
        self.write(key, Some(SettingValue::Bool(value)));
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), SettingsError> {
        self.write(key, None);
        Ok(())
    }
}

/// Settings persisted as a JSON object on disk.
///
/// Every write rewrites the file through a temporary sibling and a rename.
#[derive(Debug)]
pub struct JsonFileSettings {
    path: PathBuf,
    values: Mutex<ValueMap>,
}

impl JsonFileSettings {
    /// Open (or lazily create) the store at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let path = path.as_ref().to_path_buf();
        let values = match std::fs::read_to_string(&path) {
            Ok(raw) if raw.trim().is_empty() => ValueMap::new(),
            Ok(raw) => serde_json::from_str(&raw)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => ValueMap::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path,
            values: Mutex::new(values),
        })
    }

    /// Location of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write(&self, key: &str, value: Option<SettingValue>) -> Result<(), SettingsError> {
        let mut map = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        match value {
            Some(v) => map.insert(key.to_string(), v),
            None => map.remove(key),
        };
        let raw = serde_json::to_string_pretty(&*map)?;
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, raw)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl SettingsStore for JsonFileSettings {
    fn string(&self, key: &str) -> Option<String> {
        read(&self.values, key, |v| match v {
            SettingValue::String(s) => Some(s.clone()),
            _ => None,
        })
    }

    fn int(&self, key: &str) -> Option<i64> {
        read(&self.values, key, |v| match v {
            SettingValue::Int(i) => Some(*i),
            _ => None,
        })
    }

    fn bool(&self, key: &str) -> Option<bool> {
        read(&self.values, key, |v| match v {
            SettingValue::Bool(b) => Some(*b),
            _ => None,
        })
    }

    fn set_string(&self, key: &str, value: &str) -> Result<(), SettingsError> {
        self.write(key, Some(SettingValue::String(value.to_string())))
    }

    fn set_int(&self, key: &str, value: i64) -> Result<(), SettingsError> {
        self.write(key, Some(SettingValue::Int(value)))
    }

    fn set_bool(&self, key: &str, value: bool) -> Result<(), SettingsError> {
        self.write(key, Some(SettingValue::Bool(value)))
    }

    fn remove(&self, key: &str) -> Result<(), SettingsError> {
        self.write(key, None)
    }
}

/// Where a connection attempt came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnectSource {
    /// User picked a discovered gateway.
    Discovered,
    /// User entered a host and port.
    Manual,
    /// Fired by the auto-connect engine.
    AutoConnect,
}

impl ConnectSource {
    /// Persisted name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Discovered => "discovered",
            Self::Manual => "manual",
            Self::AutoConnect => "autoConnect",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "discovered" => Some(Self::Discovered),
            "manual" => Some(Self::Manual),
            "autoConnect" => Some(Self::AutoConnect),
            _ => None,
        }
    }
}

impl std::fmt::Display for ConnectSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The endpoint of the most recent connection attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastAttemptedEndpoint {
    /// Host as attempted.
    pub host: String,
    /// Port as attempted.
    pub port: u16,
    /// Whether TLS was required.
    pub use_tls: bool,
    /// What triggered the attempt.
    pub source: ConnectSource,
    /// Identity the attempt belonged to. Absent in records written
    /// before it was persisted.
    #[serde(default)]
    pub stable_id: Option<String>,
}

/// Manual connection fields.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ManualEndpoint {
    /// Whether manual mode is on.
    pub enabled: bool,
    /// Host as entered, trimmed.
    pub host: String,
    /// Port as entered; unvalidated.
    pub port: Option<i64>,
    /// Whether the user asked for TLS.
    pub use_tls: bool,
}

/// Typed view over a [`SettingsStore`].
///
/// Write failures are logged and swallowed: persistence is best effort and
/// must never block discovery or a connection attempt.
#[derive(Clone)]
pub struct GatewaySettings {
    store: Arc<dyn SettingsStore>,
}

impl std::fmt::Debug for GatewaySettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewaySettings").finish_non_exhaustive()
    }
}

impl GatewaySettings {
    /// Wrap a store.
    pub fn new(store: Arc<dyn SettingsStore>) -> Self {
        Self { store }
    }

    /// Wrap a fresh in-memory store.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemorySettings::new()))
    }

    /// Underlying store.
    pub fn store(&self) -> &Arc<dyn SettingsStore> {
        &self.store
    }

    fn log_write(key: &str, res: Result<(), SettingsError>) {
        if let Err(e) = res {
            warn!(key, error = %e, "failed to persist setting");
        }
    }

    fn non_empty(&self, key: &str) -> Option<String> {
        self.store
            .string(key)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    fn set_optional(&self, key: &str, value: Option<&str>) {
        let res = match value.map(str::trim).filter(|v| !v.is_empty()) {
            Some(v) => self.store.set_string(key, v),
            None => self.store.remove(key),
        };
        Self::log_write(key, res);
    }

    /// Last attempted endpoint, if fully recorded.
    pub fn last_attempt(&self) -> Option<LastAttemptedEndpoint> {
        let host = self.non_empty(keys::LAST_HOST)?;
        let port = u16::try_from(self.store.int(keys::LAST_PORT)?).ok()?;
        if port == 0 {
            return None;
        }
        let use_tls = self.store.bool(keys::LAST_USE_TLS).unwrap_or(false);
        let source = self
            .store
            .string(keys::LAST_SOURCE)
            .and_then(|s| ConnectSource::parse(&s))
            .unwrap_or(ConnectSource::Manual);
        Some(LastAttemptedEndpoint {
            host,
            port,
            use_tls,
            source,
            stable_id: self.non_empty(keys::LAST_STABLE_ID),
        })
    }

    /// Overwrite the last attempted endpoint.
    pub fn set_last_attempt(&self, attempt: &LastAttemptedEndpoint) {
        Self::log_write(keys::LAST_HOST, self.store.set_string(keys::LAST_HOST, &attempt.host));
        Self::log_write(
            keys::LAST_PORT,
            self.store.set_int(keys::LAST_PORT, i64::from(attempt.port)),
        );
        Self::log_write(
            keys::LAST_USE_TLS,
            self.store.set_bool(keys::LAST_USE_TLS, attempt.use_tls),
        );
        Self::log_write(
            keys::LAST_SOURCE,
            self.store.set_string(keys::LAST_SOURCE, attempt.source.as_str()),
        );
        self.set_optional(keys::LAST_STABLE_ID, attempt.stable_id.as_deref());
    }

    /// Explicitly chosen gateway.
    pub fn preferred_stable_id(&self) -> Option<String> {
        self.non_empty(keys::PREFERRED_STABLE_ID)
    }

    /// Set or clear the explicitly chosen gateway.
    pub fn set_preferred_stable_id(&self, id: Option<&str>) {
        self.set_optional(keys::PREFERRED_STABLE_ID, id);
    }

    /// Gateway remembered from discovery.
    pub fn last_discovered_stable_id(&self) -> Option<String> {
        self.non_empty(keys::LAST_DISCOVERED_STABLE_ID)
    }

    /// Set or clear the remembered gateway.
    pub fn set_last_discovered_stable_id(&self, id: Option<&str>) {
        self.set_optional(keys::LAST_DISCOVERED_STABLE_ID, id);
    }

    /// Manual connection fields.
    pub fn manual(&self) -> ManualEndpoint {
        ManualEndpoint {
            enabled: self.store.bool(keys::MANUAL_ENABLED).unwrap_or(false),
            host: self
                .store
                .string(keys::MANUAL_HOST)
                .map(|h| h.trim().to_string())
                .unwrap_or_default(),
            port: self.store.int(keys::MANUAL_PORT),
            use_tls: self.store.bool(keys::MANUAL_TLS).unwrap_or(false),
        }
    }

    /// Store manual connection fields.
    pub fn set_manual(&self, manual: &ManualEndpoint) {
        Self::log_write(
            keys::MANUAL_ENABLED,
            self.store.set_bool(keys::MANUAL_ENABLED, manual.enabled),
        );
        self.set_optional(keys::MANUAL_HOST, Some(&manual.host));
        let res = match manual.port {
            Some(p) => self.store.set_int(keys::MANUAL_PORT, p),
            None => self.store.remove(keys::MANUAL_PORT),
        };
        Self::log_write(keys::MANUAL_PORT, res);
        Self::log_write(
            keys::MANUAL_TLS,
            self.store.set_bool(keys::MANUAL_TLS, manual.use_tls),
        );
    }

    /// Operator-supplied discovery domain.
    pub fn discovery_domain(&self) -> Option<String> {
        self.non_empty(keys::DISCOVERY_DOMAIN)
    }

    /// Set or clear the discovery domain override.
    pub fn set_discovery_domain(&self, domain: Option<&str>) {
        self.set_optional(keys::DISCOVERY_DOMAIN, domain);
    }

    /// Debug log toggle.
    pub fn debug_logging(&self) -> bool {
        self.store.bool(keys::DEBUG_LOGGING).unwrap_or(false)
    }

    /// Persist the debug log toggle.
    pub fn set_debug_logging(&self, enabled: bool) {
        Self::log_write(
            keys::DEBUG_LOGGING,
            self.store.set_bool(keys::DEBUG_LOGGING, enabled),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_values_do_not_cross() {
        let store = MemorySettings::new();
        store.set_int("k", 5).unwrap();
        assert_eq!(store.int("k"), Some(5));
        assert_eq!(store.string("k"), None);
        assert_eq!(store.bool("k"), None);
        store.remove("k").unwrap();
        assert_eq!(store.int("k"), None);
    }

    #[test]
    fn last_attempt_roundtrips_through_settings() {
        let settings = GatewaySettings::in_memory();
        assert_eq!(settings.last_attempt(), None);
        let attempt = LastAttemptedEndpoint {
            host: "gw.local".into(),
            port: 18789,
            use_tls: true,
            source: ConnectSource::AutoConnect,
            stable_id: Some("service:abc".into()),
        };
        settings.set_last_attempt(&attempt);
        assert_eq!(settings.last_attempt(), Some(attempt));

        // A later attempt without an identity must not inherit the old one.
        let manual = LastAttemptedEndpoint {
            host: "10.0.0.9".into(),
            port: 443,
            use_tls: false,
            source: ConnectSource::Manual,
            stable_id: None,
        };
        settings.set_last_attempt(&manual);
        assert_eq!(settings.last_attempt(), Some(manual));
    }

    #[test]
    fn blank_ids_clear_the_key() {
        let settings = GatewaySettings::in_memory();
        settings.set_preferred_stable_id(Some("service:abc"));
        assert_eq!(settings.preferred_stable_id().as_deref(), Some("service:abc"));
        settings.set_preferred_stable_id(Some("  "));
        assert_eq!(settings.preferred_stable_id(), None);
    }

    #[test]
    fn json_file_store_persists_across_opens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");
        {
            let store = JsonFileSettings::open(&path).unwrap();
            store.set_string(keys::MANUAL_HOST, "gw.example").unwrap();
            store.set_int(keys::MANUAL_PORT, 443).unwrap();
            store.set_bool(keys::MANUAL_ENABLED, true).unwrap();
        }
        let reopened = JsonFileSettings::open(&path).unwrap();
        assert_eq!(reopened.string(keys::MANUAL_HOST).as_deref(), Some("gw.example"));
        assert_eq!(reopened.int(keys::MANUAL_PORT), Some(443));
        assert_eq!(reopened.bool(keys::MANUAL_ENABLED), Some(true));
        assert!(!path.with_extension("json.tmp").exists());
    }
}
