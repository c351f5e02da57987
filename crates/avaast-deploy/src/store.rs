//! In-memory arena of known record bodies, keyed by ref key.
//!
//! The controller inserts bodies as watcher events arrive; the manifest
//! builder reads them during resolution. Entries referenced by a retiring
//! manifest are released unless another live manifest still holds them.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use tracing::debug;

use avaast_core::{ResourceKind, ResourceRef};

/// One cached record body.
#[derive(Debug, Clone)]
pub struct StoredRecord {
    pub resource: ResourceRef,
    pub kind: ResourceKind,
    pub record_key: String,
    pub body: serde_json::Value,
}

/// Thread-safe record arena. Clones share the underlying map.
#[derive(Clone, Default)]
pub struct RecordStore {
    records: Arc<RwLock<HashMap<String, StoredRecord>>>,
}

impl RecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, record: StoredRecord) {
        let key = record.resource.key();
        let mut records = self.records.write().expect("record store lock");
        records.insert(key, record);
    }

    pub fn get(&self, resource: &ResourceRef) -> Option<StoredRecord> {
        let records = self.records.read().expect("record store lock");
        records.get(&resource.key()).cloned()
    }

    pub fn contains(&self, resource: &ResourceRef) -> bool {
        let records = self.records.read().expect("record store lock");
        records.contains_key(&resource.key())
    }

    pub fn len(&self) -> usize {
        self.records.read().expect("record store lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Release entries that were referenced only by a retired manifest.
    /// `retiring` is the retiring manifest's ref keys; `still_live` is the
    /// union of ref keys held by all non-retired manifests.
    pub fn release(&self, retiring: &HashSet<String>, still_live: &HashSet<String>) {
        let mut records = self.records.write().expect("record store lock");
        let mut dropped = 0usize;
        for key in retiring {
            if !still_live.contains(key) && records.remove(key).is_some() {
                dropped += 1;
            }
        }
        if dropped > 0 {
            debug!(dropped, "released retired record bodies");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(hash: &str) -> StoredRecord {
        StoredRecord {
            resource: ResourceRef::new("did:plc:alice", hash),
            kind: ResourceKind::Computed,
            record_key: format!("rkey-{hash}"),
            body: serde_json::json!({"hash": hash}),
        }
    }

    #[test]
    fn insert_and_get_by_ref() {
        let store = RecordStore::new();
        store.insert(record("h1"));
        let got = store.get(&ResourceRef::new("did:plc:alice", "h1")).unwrap();
        assert_eq!(got.record_key, "rkey-h1");
    }

    #[test]
    fn insert_replaces_same_ref() {
        let store = RecordStore::new();
        store.insert(record("h1"));
        let mut updated = record("h1");
        updated.body = serde_json::json!({"v": 2});
        store.insert(updated);
        assert_eq!(store.len(), 1);
        let got = store.get(&ResourceRef::new("did:plc:alice", "h1")).unwrap();
        assert_eq!(got.body["v"], 2);
    }

    #[test]
    fn release_drops_only_unreferenced() {
        let store = RecordStore::new();
        store.insert(record("h1"));
        store.insert(record("h2"));
        store.insert(record("h3"));

        let retiring: HashSet<String> = ["did:plc:alice:h1", "did:plc:alice:h2"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let still_live: HashSet<String> =
            ["did:plc:alice:h2"].iter().map(|s| s.to_string()).collect();

        store.release(&retiring, &still_live);

        assert!(!store.contains(&ResourceRef::new("did:plc:alice", "h1")));
        assert!(store.contains(&ResourceRef::new("did:plc:alice", "h2")));
        assert!(store.contains(&ResourceRef::new("did:plc:alice", "h3")));
    }
}
