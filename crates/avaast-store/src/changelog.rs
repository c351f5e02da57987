//! Change log — append-only history of watched record events.
//!
//! Rows are keyed by a monotonically increasing insertion id, with a
//! secondary index realizing `(collection, authority_id, created_at)`
//! lookups. History-suffixed query sources (`:updates`, `:deletes`)
//! read from here instead of live PDS state.

use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use serde::{Deserialize, Serialize};
use tracing::debug;

use avaast_core::EventOp;

use crate::db::map_err;
use crate::error::StoreResult;
use crate::tables::{CHANGELOG, CHANGELOG_IDX};

/// One persisted change event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeRow {
    pub id: u64,
    pub collection: String,
    pub record_key: String,
    pub authority_id: String,
    pub event_type: EventOp,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<serde_json::Value>,
    /// Unix milliseconds at append time.
    pub created_at: i64,
}

/// Filter for change log queries. Results are ordered `created_at DESC`.
#[derive(Debug, Clone, Default)]
pub struct ChangeFilter {
    pub collection: String,
    pub authority_id: Option<String>,
    pub event_type: Option<EventOp>,
    /// Only rows strictly newer than this (unix milliseconds).
    pub after_timestamp: Option<i64>,
    /// Defaults to 100.
    pub limit: Option<usize>,
}

/// Append-only event log backed by redb.
#[derive(Clone)]
pub struct ChangeLog {
    db: Arc<Database>,
}

impl ChangeLog {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Append one event. Returns the assigned insertion id.
    pub fn append(
        &self,
        collection: &str,
        record_key: &str,
        authority_id: &str,
        event_type: EventOp,
        body: Option<serde_json::Value>,
    ) -> StoreResult<u64> {
        let created_at = chrono::Utc::now().timestamp_millis();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let id;
        {
            let mut table = txn.open_table(CHANGELOG).map_err(map_err!(Table))?;
            id = table
                .last()
                .map_err(map_err!(Read))?
                .map(|(k, _)| k.value() + 1)
                .unwrap_or(1);
            let row = ChangeRow {
                id,
                collection: collection.to_string(),
                record_key: record_key.to_string(),
                authority_id: authority_id.to_string(),
                event_type,
                body,
                created_at,
            };
            let bytes = serde_json::to_vec(&row).map_err(map_err!(Serialize))?;
            table.insert(id, bytes.as_slice()).map_err(map_err!(Write))?;

            let mut idx = txn.open_table(CHANGELOG_IDX).map_err(map_err!(Table))?;
            idx.insert(index_key(collection, authority_id, created_at, id).as_str(), id)
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(collection, record_key, id, "change appended");
        Ok(id)
    }

    /// Query rows matching the filter, newest first.
    pub fn query(&self, filter: &ChangeFilter) -> StoreResult<Vec<ChangeRow>> {
        let limit = filter.limit.unwrap_or(100);
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let mut results = Vec::new();

        if let Some(authority) = &filter.authority_id {
            // Indexed path: the index key prefix pins collection + authority
            // and its tail orders by created_at then id.
            let start = format!("{}|{}|", filter.collection, authority);
            let end = format!("{}|{}|~", filter.collection, authority);
            let idx = txn.open_table(CHANGELOG_IDX).map_err(map_err!(Table))?;
            let table = txn.open_table(CHANGELOG).map_err(map_err!(Table))?;
            for entry in idx
                .range(start.as_str()..end.as_str())
                .map_err(map_err!(Read))?
                .rev()
            {
                let (_, id) = entry.map_err(map_err!(Read))?;
                let Some(guard) = table.get(id.value()).map_err(map_err!(Read))? else {
                    continue;
                };
                let row: ChangeRow =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                if Self::matches(&row, filter) {
                    results.push(row);
                    if results.len() >= limit {
                        break;
                    }
                }
            }
        } else {
            // Insertion ids are chronological, so a reverse scan of the
            // main table yields created_at DESC.
            let table = txn.open_table(CHANGELOG).map_err(map_err!(Table))?;
            for entry in table.iter().map_err(map_err!(Read))?.rev() {
                let (_, value) = entry.map_err(map_err!(Read))?;
                let row: ChangeRow =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                if row.collection == filter.collection && Self::matches(&row, filter) {
                    results.push(row);
                    if results.len() >= limit {
                        break;
                    }
                }
            }
        }

        Ok(results)
    }

    fn matches(row: &ChangeRow, filter: &ChangeFilter) -> bool {
        if let Some(et) = filter.event_type {
            if row.event_type != et {
                return false;
            }
        }
        if let Some(after) = filter.after_timestamp {
            if row.created_at <= after {
                return false;
            }
        }
        true
    }
}

/// Index key layout; zero-padding keeps lexicographic order chronological.
fn index_key(collection: &str, authority_id: &str, created_at: i64, id: u64) -> String {
    format!("{collection}|{authority_id}|{created_at:020}|{id:020}")
}
