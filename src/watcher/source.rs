//! Pluggable advertisement sources and browse events.

use std::collections::{BTreeMap, HashMap};
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};

use futures_util::{stream, Stream, StreamExt};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, trace};

use crate::error::DiscoveryError;
use crate::identity::ServiceIdentity;

/// State of one domain watcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatcherState {
    /// Registered but not yet browsing.
    Idle,
    /// Browsing, nothing reported yet.
    Searching,
    /// Browsing and reporting results.
    Ready,
    /// Temporarily unable to browse.
    Waiting(DiscoveryError),
    /// Browsing failed.
    Failed(DiscoveryError),
    /// Browsing was cancelled.
    Cancelled,
}

impl std::fmt::Display for WatcherState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => f.write_str("idle"),
            Self::Searching => f.write_str("searching"),
            Self::Ready => f.write_str("ready"),
            Self::Waiting(e) => write!(f, "waiting({e})"),
            Self::Failed(e) => write!(f, "failed({e})"),
            Self::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// One advertised service instance as reported by a browser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    /// Instance identity.
    pub identity: ServiceIdentity,
    /// Native metadata (DNS-SD TXT record).
    pub txt: BTreeMap<String, String>,
    /// SRV port, when the browser knows it.
    pub port: Option<u16>,
}

impl Advertisement {
    /// Create an advertisement without metadata.
    pub fn new(identity: ServiceIdentity) -> Self {
        Self {
            identity,
            txt: BTreeMap::new(),
            port: None,
        }
    }

    /// Add a metadata entry.
    pub fn with_txt(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.txt.insert(key.into(), value.into());
        self
    }

    /// Set the SRV port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }
}

/// Event emitted by a domain browser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrowseEvent {
    /// The browser changed state.
    State(WatcherState),
    /// The complete current result set. Replaces any previous one.
    Results(Vec<Advertisement>),
}

/// Stream of browse events for one domain.
pub type BrowseFeed = Pin<Box<dyn Stream<Item = BrowseEvent> + Send>>;

/// A pluggable advertisement source.
///
/// [`browse()`](AdvertisementSource::browse) is called once per domain each
/// time the watchers start. It must subscribe eagerly: events published
/// after `browse()` returns must reach the feed. Dropping the feed stops
/// browsing.
pub trait AdvertisementSource: Send + Sync + 'static {
    /// Human-readable name for logging (e.g. "mdns", "static").
    fn name(&self) -> &'static str;

    /// Start browsing `service_type` in `domain`.
    fn browse(&self, service_type: &str, domain: &str) -> BrowseFeed;
}

/// Fixed advertisements per domain.
///
/// Reports `searching`, then `ready` with the configured results, and then
/// stays open until dropped.
#[derive(Clone, Default)]
pub struct StaticSource {
    adverts: HashMap<String, Vec<Advertisement>>,
}

impl StaticSource {
    /// Create an empty static source.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an advertisement to the domain it names.
    pub fn add(mut self, advert: Advertisement) -> Self {
        self.adverts
            .entry(advert.identity.domain.clone())
            .or_default()
            .push(advert);
        self
    }
}

impl AdvertisementSource for StaticSource {
    fn name(&self) -> &'static str {
        "static"
    }

    fn browse(&self, _service_type: &str, domain: &str) -> BrowseFeed {
        let results = self.adverts.get(domain).cloned().unwrap_or_default();
        let events = vec![
            BrowseEvent::State(WatcherState::Searching),
            BrowseEvent::State(WatcherState::Ready),
            BrowseEvent::Results(results),
        ];
        stream::iter(events).chain(stream::pending()).boxed()
    }
}

#[derive(Default)]
struct Latest {
    state: Option<WatcherState>,
    results: Option<Vec<Advertisement>>,
}

struct ChannelInner {
    tx: broadcast::Sender<(String, BrowseEvent)>,
    latest: Mutex<HashMap<String, Latest>>,
}

/// Source fed by the embedding application.
///
/// Events are pushed per domain with [`push()`](ChannelSource::push). A new
/// browser first replays the latest state and result set for its domain.
#[derive(Clone)]
pub struct ChannelSource {
    inner: Arc<ChannelInner>,
}

impl ChannelSource {
    /// Create a new channel source.
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(128);
        Self {
            inner: Arc::new(ChannelInner {
                tx,
                latest: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Publish an event for a domain.
    pub fn push(&self, domain: &str, event: BrowseEvent) {
        let mut latest = self.inner.latest.lock().unwrap_or_else(PoisonError::into_inner);
        let slot = latest.entry(domain.to_string()).or_default();
        match &event {
            BrowseEvent::State(s) => slot.state = Some(s.clone()),
            BrowseEvent::Results(r) => slot.results = Some(r.clone()),
        }
        // Sent under the lock so a concurrent browse() sees either the
        // replayed value or the live event, never both or neither.
        let _ = self.inner.tx.send((domain.to_string(), event));
    }

    /// Shorthand for pushing a result set.
    pub fn publish(&self, domain: &str, adverts: Vec<Advertisement>) {
        self.push(domain, BrowseEvent::Results(adverts));
    }
}

impl Default for ChannelSource {
    fn default() -> Self {
        Self::new()
    }
}

impl AdvertisementSource for ChannelSource {
    fn name(&self) -> &'static str {
        "channel"
    }

    fn browse(&self, _service_type: &str, domain: &str) -> BrowseFeed {
        let latest = self.inner.latest.lock().unwrap_or_else(PoisonError::into_inner);
        let rx = self.inner.tx.subscribe();
        let mut replay = Vec::new();
        if let Some(slot) = latest.get(domain) {
            if let Some(state) = &slot.state {
                replay.push(BrowseEvent::State(state.clone()));
            }
            if let Some(results) = &slot.results {
                replay.push(BrowseEvent::Results(results.clone()));
            }
        }
        drop(latest);
        trace!(domain, replayed = replay.len(), "channel source: browse");

        let domain = domain.to_string();
        let live = BroadcastStream::new(rx).filter_map(move |msg| {
            let domain = domain.clone();
            async move {
                match msg {
                    Ok((d, event)) if d == domain => Some(event),
                    Ok(_) => None,
                    Err(e) => {
                        debug!(%domain, error = %e, "channel source lagged");
                        None
                    }
                }
            }
        });
        stream::iter(replay).chain(live).boxed()
    }
}
