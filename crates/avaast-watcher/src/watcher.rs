//! The watcher — one event stream over three transport modes.
//!
//! Mode selection at start: a configured relay URL wins; otherwise the
//! firehose is probed against the authoritative PDS; if that fails the
//! watcher falls through to polling. At most one transport is active.
//! Transport errors are logged and drive reconnects, never propagated.

use std::collections::HashSet;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use avaast_core::{collections, RecordEvent};
use avaast_pds::{PdsClient, PdsResolver};
use avaast_store::{ChangeLog, CursorStore};

use crate::{firehose, polling, relay};

/// Where the watcher points and what it listens for.
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    pub authority_id: String,
    /// Relay WebSocket URL; selects relay mode when present.
    pub relay_url: Option<String>,
    /// PDS base URL; resolved from the authority DID when absent.
    pub pds_base: Option<String>,
    /// Collections watched in addition to the `app.avaast.*` set.
    pub extra_collections: Vec<String>,
    pub poll_interval: Duration,
}

impl WatcherConfig {
    pub fn new(authority_id: impl Into<String>) -> Self {
        Self {
            authority_id: authority_id.into(),
            relay_url: None,
            pds_base: None,
            extra_collections: Vec::new(),
            poll_interval: polling::DEFAULT_INTERVAL,
        }
    }

    /// The full watched collection set.
    pub fn watched_collections(&self) -> HashSet<String> {
        let mut set: HashSet<String> = collections::watched().into_iter().collect();
        set.extend(self.extra_collections.iter().cloned());
        set
    }
}

/// Shared emission path for all transports: filters to the watched
/// authority and collections, appends to the change log when wired, and
/// forwards to the consumer channel.
#[derive(Clone)]
pub struct EventSink {
    authority_id: String,
    watched: HashSet<String>,
    changelog: Option<ChangeLog>,
    tx: mpsc::Sender<RecordEvent>,
}

impl EventSink {
    pub fn new(
        authority_id: String,
        watched: HashSet<String>,
        changelog: Option<ChangeLog>,
        tx: mpsc::Sender<RecordEvent>,
    ) -> Self {
        Self {
            authority_id,
            watched,
            changelog,
            tx,
        }
    }

    /// Emit one event. Returns `false` once the consumer is gone and the
    /// transport should wind down.
    pub async fn emit(&self, event: RecordEvent) -> bool {
        if event.authority_id != self.authority_id || !self.watched.contains(&event.collection) {
            return !self.tx.is_closed();
        }
        if let Some(log) = &self.changelog {
            if let Err(e) = log.append(
                &event.collection,
                &event.record_key,
                &event.authority_id,
                event.op,
                event.body.clone(),
            ) {
                warn!(error = %e, collection = %event.collection, "change log append failed");
            }
        }
        self.tx.send(event).await.is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Handle to a running watcher.
pub struct Watcher {
    task: JoinHandle<()>,
}

impl Watcher {
    /// Start the watcher. Returns the handle and the event receiver; the
    /// caller owns consumption order.
    pub fn start(
        config: WatcherConfig,
        client: PdsClient,
        resolver: PdsResolver,
        cursors: CursorStore,
        changelog: Option<ChangeLog>,
    ) -> (Self, mpsc::Receiver<RecordEvent>) {
        let (tx, rx) = mpsc::channel(256);
        let watched = config.watched_collections();
        let sink = EventSink::new(
            config.authority_id.clone(),
            watched.clone(),
            changelog,
            tx,
        );

        let task = tokio::spawn(async move {
            if let Some(relay_url) = config.relay_url.clone() {
                info!(%relay_url, "watcher starting in relay mode");
                relay::run(relay_url, sink).await;
                return;
            }

            let pds_base = match &config.pds_base {
                Some(base) => Some(base.clone()),
                None => match resolver.resolve(&config.authority_id).await {
                    Ok(base) => Some(base),
                    Err(e) => {
                        warn!(error = %e, "PDS resolution failed, polling via pinned client");
                        None
                    }
                },
            };

            if let Some(base) = pds_base {
                match firehose::probe(&base).await {
                    Ok(()) => {
                        info!(%base, "watcher starting in firehose mode");
                        firehose::run(base, cursors, sink).await;
                        return;
                    }
                    Err(e) => {
                        warn!(%base, error = %e, "firehose unavailable, falling through to polling");
                    }
                }
            }

            info!(
                interval_secs = config.poll_interval.as_secs(),
                "watcher starting in polling mode"
            );
            let mut poll_collections: Vec<String> = watched.into_iter().collect();
            poll_collections.sort();
            polling::run(
                client,
                config.authority_id,
                poll_collections,
                config.poll_interval,
                sink,
            )
            .await;
        });

        (Self { task }, rx)
    }

    /// Terminate the active transport. Immediate for idle transports,
    /// best-effort for an in-flight message.
    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}
