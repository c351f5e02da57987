//! avaast-watcher — eventually-consistent view of a PDS account's records.
//!
//! Unifies three transport modes (relay, firehose, polling) behind one
//! event channel. Transports share the narrow start/stop contract and a
//! common emission sink but are otherwise independent implementations.

pub mod backoff;
pub mod firehose;
pub mod polling;
pub mod relay;
pub mod watcher;

pub use watcher::{EventSink, Watcher, WatcherConfig};
