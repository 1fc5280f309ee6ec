//! Multicast DNS-SD browsing via `mdns-sd`.
//!
//! Only the `local.` domain can be browsed over multicast; other domains
//! report a setup failure. Resolved host names are cached so the same
//! source can act as the [`NameResolver`] for its own advertisements.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::resolver::{NameResolver, ResolvedMetadata};
use super::source::{Advertisement, AdvertisementSource, BrowseEvent, BrowseFeed, WatcherState};
use crate::error::{DiscoveryError, ResolutionError};
use crate::identity::ServiceIdentity;

const MDNS_DOMAIN: &str = "local.";

/// mDNS advertisement source and resolver.
#[derive(Clone)]
pub struct MdnsSource {
    daemon: ServiceDaemon,
    resolved: Arc<Mutex<HashMap<String, ResolvedMetadata>>>,
}

impl MdnsSource {
    /// Start an mDNS daemon.
    pub fn new() -> Result<Self, DiscoveryError> {
        let daemon = ServiceDaemon::new().map_err(|e| DiscoveryError::Setup {
            domain: MDNS_DOMAIN.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            daemon,
            resolved: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    fn failed(domain: &str, reason: impl std::fmt::Display) -> BrowseFeed {
        let err = DiscoveryError::Setup {
            domain: domain.to_string(),
            reason: reason.to_string(),
        };
        stream::iter([BrowseEvent::State(WatcherState::Failed(err))])
            .chain(stream::pending())
            .boxed()
    }
}

/// Stops the daemon-side browse when the feed is dropped. The daemon then
/// closes the receiver, which ends the bridge thread.
struct BrowseGuard {
    daemon: ServiceDaemon,
    fq_type: String,
}

impl Drop for BrowseGuard {
    fn drop(&mut self) {
        if let Err(e) = self.daemon.stop_browse(&self.fq_type) {
            debug!(fq_type = %self.fq_type, error = %e, "mdns: stop_browse failed");
        }
    }
}

fn advertisement(info: &ServiceInfo, service_type: &str, fq_type: &str) -> Advertisement {
    let fullname = info.get_fullname();
    let instance = fullname
        .strip_suffix(fq_type)
        .map(|s| s.trim_end_matches('.'))
        .unwrap_or(fullname);
    let txt: BTreeMap<String, String> = info
        .get_properties()
        .iter()
        .map(|p| (p.key().to_string(), p.val_str().to_string()))
        .collect();
    Advertisement {
        identity: ServiceIdentity::new(instance, service_type, MDNS_DOMAIN),
        txt,
        port: Some(info.get_port()).filter(|p| *p != 0),
    }
}

impl AdvertisementSource for MdnsSource {
    fn name(&self) -> &'static str {
        "mdns"
    }

    fn browse(&self, service_type: &str, domain: &str) -> BrowseFeed {
        if !domain.trim_end_matches('.').eq_ignore_ascii_case("local") {
            return Self::failed(domain, "multicast browsing only covers local.");
        }
        let service_type = service_type.trim_end_matches('.').to_string();
        let fq_type = format!("{service_type}.{MDNS_DOMAIN}");
        let receiver = match self.daemon.browse(&fq_type) {
            Ok(rx) => rx,
            Err(e) => return Self::failed(domain, e),
        };

        // mdns-sd hands out a blocking receiver; bridge it onto a tokio channel.
        let (tx, mut events) = mpsc::channel(64);
        std::thread::spawn(move || {
            while let Ok(event) = receiver.recv() {
                if tx.blocking_send(event).is_err() {
                    break;
                }
            }
        });

        let cache = Arc::clone(&self.resolved);
        let guard = BrowseGuard {
            daemon: self.daemon.clone(),
            fq_type: fq_type.clone(),
        };
        async_stream::stream! {
            let _guard = guard;
            yield BrowseEvent::State(WatcherState::Searching);
            let mut found: BTreeMap<String, Advertisement> = BTreeMap::new();
            let mut ready = false;
            while let Some(event) = events.recv().await {
                match event {
                    ServiceEvent::SearchStarted(_) if !ready => {
                        ready = true;
                        yield BrowseEvent::State(WatcherState::Ready);
                    }
                    ServiceEvent::ServiceResolved(info) => {
                        let advert = advertisement(&info, &service_type, &fq_type);
                        let overlay = ResolvedMetadata {
                            txt: BTreeMap::new(),
                            host_name: Some(info.get_hostname().to_string()),
                            port: advert.port,
                        };
                        cache
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .insert(advert.identity.stable_id(), overlay);
                        debug!(service = %advert.identity.debug_id(), "mdns: resolved");
                        found.insert(info.get_fullname().to_string(), advert);
                        if !ready {
                            ready = true;
                            yield BrowseEvent::State(WatcherState::Ready);
                        }
                        yield BrowseEvent::Results(found.values().cloned().collect());
                    }
                    ServiceEvent::ServiceRemoved(_, fullname) => {
                        if found.remove(&fullname).is_some() {
                            debug!(%fullname, "mdns: removed");
                            yield BrowseEvent::Results(found.values().cloned().collect());
                        }
                    }
                    ServiceEvent::SearchStopped(_) => {
                        yield BrowseEvent::State(WatcherState::Cancelled);
                        break;
                    }
                    _ => {}
                }
            }
            warn!("mdns: browse channel closed");
        }
        .boxed()
    }
}

#[async_trait]
impl NameResolver for MdnsSource {
    async fn resolve(&self, service: &ServiceIdentity) -> Result<ResolvedMetadata, ResolutionError> {
        let cache = self.resolved.lock().unwrap_or_else(PoisonError::into_inner);
        cache
            .get(&service.stable_id())
            .cloned()
            .ok_or_else(|| ResolutionError::failed(format!("{} not resolved yet", service.debug_id())))
    }
}
