//! Watchers: per-domain advertisement browsing and on-demand resolution.
//!
//! - Pluggable advertisement feeds via the [`AdvertisementSource`] trait
//! - Out-of-band resolution via the [`NameResolver`] trait
//! - One watcher task per domain, funneled into the discovery actor

#[cfg(feature = "mdns")]
pub mod mdns;
pub mod resolver;
pub mod source;

#[cfg(feature = "mdns")]
pub use mdns::MdnsSource;
pub use resolver::{NameResolver, ResolvedMetadata, StaticResolver};
pub use source::{
    Advertisement, AdvertisementSource, BrowseEvent, BrowseFeed, ChannelSource, StaticSource,
    WatcherState,
};
