//! Out-of-band name resolution for incomplete advertisements.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, trace};

use crate::error::ResolutionError;
use crate::identity::ServiceIdentity;

/// Host, port and metadata resolved for one service.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedMetadata {
    /// Metadata overlay. Wins over the advertisement's own entries.
    pub txt: BTreeMap<String, String>,
    /// Resolved target host name.
    pub host_name: Option<String>,
    /// Resolved port.
    pub port: Option<u16>,
}

impl ResolvedMetadata {
    /// Overlay carrying only a host name.
    pub fn host(host_name: impl Into<String>) -> Self {
        Self {
            host_name: Some(host_name.into()),
            ..Self::default()
        }
    }

    /// Set the resolved port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Add an overlay entry.
    pub fn with_txt(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.txt.insert(key.into(), value.into());
        self
    }
}

/// Resolves host/port/metadata for a single advertised service.
///
/// Calls are wrapped in a timeout and may be aborted at any point; the
/// implementation does not need to handle either itself.
#[async_trait]
pub trait NameResolver: Send + Sync + 'static {
    /// Resolve one service.
    async fn resolve(&self, service: &ServiceIdentity) -> Result<ResolvedMetadata, ResolutionError>;
}

/// Resolver answering from a fixed table keyed by instance name.
#[derive(Debug, Clone, Default)]
pub struct StaticResolver {
    entries: HashMap<String, ResolvedMetadata>,
}

impl StaticResolver {
    /// Create an empty resolver.
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer for the instance named `name` in any domain.
    pub fn add(mut self, name: impl Into<String>, metadata: ResolvedMetadata) -> Self {
        self.entries.insert(name.into(), metadata);
        self
    }
}

#[async_trait]
impl NameResolver for StaticResolver {
    async fn resolve(&self, service: &ServiceIdentity) -> Result<ResolvedMetadata, ResolutionError> {
        self.entries
            .get(&service.name)
            .cloned()
            .ok_or_else(|| ResolutionError::failed(format!("no record for {}", service.name)))
    }
}

/// Result of one finished resolution, delivered to the aggregator.
#[derive(Debug)]
pub(crate) struct Resolution {
    pub stable_id: String,
    pub identity: ServiceIdentity,
    pub generation: u64,
    pub result: Result<ResolvedMetadata, ResolutionError>,
}

/// In-flight resolutions, at most one per stable ID.
pub(crate) struct Resolutions {
    resolver: Option<Arc<dyn NameResolver>>,
    timeout: Duration,
    pending: HashMap<String, JoinHandle<()>>,
}

impl Resolutions {
    pub fn new(resolver: Option<Arc<dyn NameResolver>>, timeout: Duration) -> Self {
        Self {
            resolver,
            timeout,
            pending: HashMap::new(),
        }
    }

    pub fn is_pending(&self, stable_id: &str) -> bool {
        self.pending.contains_key(stable_id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Spawn a resolution unless one is already running for the identity.
    ///
    /// Returns whether a new task was started.
    pub fn start(
        &mut self,
        identity: ServiceIdentity,
        generation: u64,
        tx: &mpsc::Sender<Resolution>,
    ) -> bool {
        let Some(resolver) = self.resolver.as_ref().map(Arc::clone) else {
            return false;
        };
        let stable_id = identity.stable_id();
        if self.is_pending(&stable_id) {
            trace!(%stable_id, "resolution already in flight");
            return false;
        }

        let timeout = self.timeout;
        let tx = tx.clone();
        let key = stable_id.clone();
        debug!(%stable_id, service = %identity.debug_id(), "starting resolution");
        let handle = tokio::spawn(async move {
            let result = match time::timeout(timeout, resolver.resolve(&identity)).await {
                Ok(res) => res,
                Err(_) => Err(ResolutionError::Timeout(timeout)),
            };
            let _ = tx
                .send(Resolution {
                    stable_id,
                    identity,
                    generation,
                    result,
                })
                .await;
        });
        self.pending.insert(key, handle);
        true
    }

    /// Forget a finished resolution.
    pub fn finish(&mut self, stable_id: &str) {
        self.pending.remove(stable_id);
    }

    /// Abort every in-flight resolution.
    pub fn cancel_all(&mut self) {
        for (stable_id, handle) in self.pending.drain() {
            trace!(%stable_id, "cancelling resolution");
            handle.abort();
        }
    }
}

impl Drop for Resolutions {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
