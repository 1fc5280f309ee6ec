//! TLS trust decisions: pin-or-verify a certificate fingerprint.
//!
//! TLS is required for a gateway when it advertises TLS, advertises a
//! fingerprint, or already has a pinned fingerprint. Trust-on-first-use is
//! allowed only while nothing is pinned for the identity; after that every
//! mismatch is a fatal [`TrustError`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, info};

use crate::catalog::DiscoveredGateway;
use crate::error::TrustError;
use crate::identity::manual_stable_id;

/// Pinned fingerprint storage keyed by stable ID.
pub trait FingerprintStore: Send + Sync + 'static {
    /// Pinned fingerprint for an identity.
    fn pinned(&self, stable_id: &str) -> Option<String>;
    /// Pin a fingerprint for an identity.
    fn pin(&self, stable_id: &str, fingerprint: &str) -> anyhow::Result<()>;
}

/// In-process fingerprint store.
#[derive(Debug, Default, Clone)]
pub struct MemoryFingerprintStore {
    pins: Arc<Mutex<HashMap<String, String>>>,
}

impl MemoryFingerprintStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl FingerprintStore for MemoryFingerprintStore {
    fn pinned(&self, stable_id: &str) -> Option<String> {
        let pins = self.pins.lock().unwrap_or_else(PoisonError::into_inner);
        pins.get(stable_id).cloned()
    }

    fn pin(&self, stable_id: &str, fingerprint: &str) -> anyhow::Result<()> {
        let normalized = normalize_fingerprint(fingerprint)
            .ok_or_else(|| anyhow::anyhow!("empty fingerprint for {stable_id}"))?;
        let mut pins = self.pins.lock().unwrap_or_else(PoisonError::into_inner);
        pins.insert(stable_id.to_string(), normalized);
        Ok(())
    }
}

/// Canonical fingerprint form: hex digits only, lower-case.
///
/// Accepts an optional `sha256:` prefix and `:` or whitespace separators.
pub fn normalize_fingerprint(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    let body = match trimmed.get(..7) {
        Some(prefix) if prefix.eq_ignore_ascii_case("sha256:") => &trimmed[7..],
        _ => trimmed,
    };
    let out: String = body
        .chars()
        .filter(|c| *c != ':' && !c.is_whitespace())
        .map(|c| c.to_ascii_lowercase())
        .collect();
    if out.is_empty() {
        None
    } else {
        Some(out)
    }
}

/// Trust parameters handed to the gateway client for one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsParams {
    /// Whether the connection must use TLS.
    pub required: bool,
    /// Fingerprint the peer must present, if known.
    pub expected_fingerprint: Option<String>,
    /// Whether an unknown fingerprint may be accepted and pinned.
    pub allow_tofu: bool,
    /// Key the fingerprint is pinned under (the stable ID).
    pub store_key: String,
}

/// Outcome of a successful fingerprint check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FingerprintCheck {
    /// Presented fingerprint matched the expectation.
    Matched,
    /// Nothing was expected and first use is allowed; the caller should pin.
    TrustOnFirstUse,
}

impl TlsParams {
    /// Parameters for a discovered gateway.
    pub fn for_gateway(gateway: &DiscoveredGateway, store: &dyn FingerprintStore) -> Self {
        let advertised = gateway
            .tls_fingerprint
            .as_deref()
            .and_then(normalize_fingerprint);
        Self::resolve(
            &gateway.stable_id,
            gateway.tls_enabled,
            advertised,
            store,
        )
    }

    /// Parameters for a manually entered endpoint.
    pub fn for_manual(host: &str, port: u16, use_tls: bool, store: &dyn FingerprintStore) -> Self {
        Self::resolve(&manual_stable_id(host, port), use_tls, None, store)
    }

    /// Parameters for a known identity when no advertisement is at hand,
    /// such as reconnecting to a gateway that left the catalog.
    pub fn for_identity(stable_id: &str, use_tls: bool, store: &dyn FingerprintStore) -> Self {
        Self::resolve(stable_id, use_tls, None, store)
    }

    fn resolve(
        stable_id: &str,
        tls_enabled: bool,
        advertised: Option<String>,
        store: &dyn FingerprintStore,
    ) -> Self {
        let pinned = store
            .pinned(stable_id)
            .as_deref()
            .and_then(normalize_fingerprint);
        let required = tls_enabled || advertised.is_some() || pinned.is_some();
        let allow_tofu = pinned.is_none();
        let expected_fingerprint = advertised.or(pinned);
        debug!(
            stable_id,
            required,
            allow_tofu,
            expected = expected_fingerprint.is_some(),
            "resolved tls params"
        );
        Self {
            required,
            expected_fingerprint,
            allow_tofu,
            store_key: stable_id.to_string(),
        }
    }

    /// Check a fingerprint presented during the handshake.
    pub fn verify(&self, presented: &str) -> Result<FingerprintCheck, TrustError> {
        let presented_norm = normalize_fingerprint(presented).unwrap_or_default();
        match &self.expected_fingerprint {
            Some(expected) if *expected == presented_norm => Ok(FingerprintCheck::Matched),
            Some(expected) => Err(TrustError::FingerprintMismatch {
                stable_id: self.store_key.clone(),
                expected: expected.clone(),
                presented: presented_norm,
            }),
            None if self.allow_tofu => Ok(FingerprintCheck::TrustOnFirstUse),
            None => Err(TrustError::Unpinned {
                stable_id: self.store_key.clone(),
            }),
        }
    }

    /// Verify a presented fingerprint and pin it on first use.
    ///
    /// The pin is written only when first use is allowed and nothing has
    /// been pinned for the identity in the meantime. A pin that appeared
    /// after these parameters were computed is enforced.
    pub fn accept(
        &self,
        presented: &str,
        store: &dyn FingerprintStore,
    ) -> crate::Result<FingerprintCheck> {
        let check = self.verify(presented)?;
        if !self.allow_tofu {
            return Ok(check);
        }
        match store.pinned(&self.store_key).as_deref().and_then(normalize_fingerprint) {
            Some(pinned) => {
                let presented_norm = normalize_fingerprint(presented).unwrap_or_default();
                if pinned != presented_norm {
                    return Err(TrustError::FingerprintMismatch {
                        stable_id: self.store_key.clone(),
                        expected: pinned,
                        presented: presented_norm,
                    }
                    .into());
                }
                Ok(FingerprintCheck::Matched)
            }
            None => {
                store.pin(&self.store_key, presented)?;
                info!(stable_id = %self.store_key, "pinned gateway fingerprint");
                Ok(check)
            }
        }
    }
}
