//! Polling transport — periodic `listRecords` diffing.
//!
//! Keeps a `(collection, record_key) → content_hash` map between polls
//! and emits create/update/delete events from the difference. The first
//! poll emits a create for every record found.

use std::collections::HashMap;
use std::time::Duration;

use tracing::{debug, warn};

use avaast_core::{EventOp, RecordEnvelope, RecordEvent};
use avaast_pds::PdsClient;

use crate::watcher::EventSink;

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(30);
const PAGE_LIMIT: usize = 100;

/// Diffing state for one watched authority.
#[derive(Debug, Default)]
pub struct PollState {
    seen: HashMap<(String, String), String>,
}

impl PollState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one collection listing into the state, returning the events
    /// it implies. `listing` must be the complete current view of the
    /// collection.
    pub fn diff(
        &mut self,
        authority_id: &str,
        collection: &str,
        listing: &[RecordEnvelope],
    ) -> Vec<RecordEvent> {
        let mut events = Vec::new();
        let mut current: HashMap<String, &RecordEnvelope> = HashMap::new();
        for envelope in listing {
            current.insert(record_key_of(&envelope.uri), envelope);
        }

        for (rkey, envelope) in &current {
            let map_key = (collection.to_string(), rkey.clone());
            match self.seen.get(&map_key) {
                None => {
                    events.push(event_for(
                        EventOp::Create,
                        collection,
                        rkey,
                        authority_id,
                        envelope,
                    ));
                    self.seen.insert(map_key, envelope.cid.clone());
                }
                Some(prev_cid) if *prev_cid != envelope.cid => {
                    events.push(event_for(
                        EventOp::Update,
                        collection,
                        rkey,
                        authority_id,
                        envelope,
                    ));
                    self.seen.insert(map_key, envelope.cid.clone());
                }
                Some(_) => {}
            }
        }

        let vanished: Vec<(String, String)> = self
            .seen
            .keys()
            .filter(|(c, rkey)| c == collection && !current.contains_key(rkey))
            .cloned()
            .collect();
        for (c, rkey) in vanished {
            self.seen.remove(&(c.clone(), rkey.clone()));
            events.push(RecordEvent {
                op: EventOp::Delete,
                collection: c,
                record_key: rkey,
                authority_id: authority_id.to_string(),
                content_hash: None,
                body: None,
            });
        }

        events
    }
}

fn event_for(
    op: EventOp,
    collection: &str,
    record_key: &str,
    authority_id: &str,
    envelope: &RecordEnvelope,
) -> RecordEvent {
    RecordEvent {
        op,
        collection: collection.to_string(),
        record_key: record_key.to_string(),
        authority_id: authority_id.to_string(),
        content_hash: Some(envelope.cid.clone()),
        body: Some(envelope.value.clone()),
    }
}

/// The record key is the last segment of an AT URI.
fn record_key_of(uri: &str) -> String {
    uri.rsplit('/').next().unwrap_or(uri).to_string()
}

/// Run the polling transport until the sink is closed.
pub async fn run(
    client: PdsClient,
    authority_id: String,
    collections: Vec<String>,
    interval: Duration,
    sink: EventSink,
) {
    let mut state = PollState::new();
    loop {
        if sink.is_closed() {
            return;
        }
        for collection in &collections {
            match client
                .list_records(&authority_id, collection, PAGE_LIMIT)
                .await
            {
                Ok(listing) => {
                    let events = state.diff(&authority_id, collection, &listing);
                    if !events.is_empty() {
                        debug!(collection, count = events.len(), "poll diff");
                    }
                    for event in events {
                        if !sink.emit(event).await {
                            return;
                        }
                    }
                }
                Err(e) => {
                    warn!(collection, error = %e, "poll listing failed");
                }
            }
        }
        tokio::time::sleep(interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(rkey: &str, cid: &str) -> RecordEnvelope {
        RecordEnvelope {
            uri: format!("at://did:plc:alice/app.avaast.computed/{rkey}"),
            cid: cid.to_string(),
            value: serde_json::json!({"rkey": rkey}),
        }
    }

    #[test]
    fn initial_poll_emits_creates() {
        let mut state = PollState::new();
        let listing = vec![envelope("r1", "cid1"), envelope("r2", "cid2")];
        let events = state.diff("did:plc:alice", "app.avaast.computed", &listing);
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.op == EventOp::Create));
    }

    #[test]
    fn identical_listings_emit_nothing() {
        let mut state = PollState::new();
        let listing = vec![envelope("r1", "cid1")];
        state.diff("did:plc:alice", "c", &listing);
        let events = state.diff("did:plc:alice", "c", &listing);
        assert!(events.is_empty());
    }

    #[test]
    fn changed_cid_emits_update() {
        let mut state = PollState::new();
        state.diff("did:plc:alice", "c", &[envelope("r1", "cid1")]);
        let events = state.diff("did:plc:alice", "c", &[envelope("r1", "cid2")]);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].op, EventOp::Update);
        assert_eq!(events[0].content_hash.as_deref(), Some("cid2"));
    }

    #[test]
    fn vanished_record_emits_delete() {
        let mut state = PollState::new();
        state.diff(
            "did:plc:alice",
            "c",
            &[envelope("r1", "cid1"), envelope("r2", "cid2")],
        );
        let events = state.diff("did:plc:alice", "c", &[envelope("r1", "cid1")]);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].op, EventOp::Delete);
        assert_eq!(events[0].record_key, "r2");
        assert!(events[0].body.is_none());
    }

    #[test]
    fn collections_tracked_independently() {
        let mut state = PollState::new();
        state.diff("did:plc:alice", "c1", &[envelope("r1", "cid1")]);
        // Same rkey in a different collection is a new record.
        let events = state.diff("did:plc:alice", "c2", &[envelope("r1", "cid1")]);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].op, EventOp::Create);
        // Emptying c2 must not delete c1's record.
        let events = state.diff("did:plc:alice", "c2", &[]);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].collection, "c2");
    }

    #[test]
    fn record_key_from_uri() {
        assert_eq!(
            record_key_of("at://did:plc:alice/app.avaast.computed/3kabc"),
            "3kabc"
        );
        assert_eq!(record_key_of("bare"), "bare");
    }
}
