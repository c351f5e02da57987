//! Cursor store — durable `key → i64` map for resume cursors.
//!
//! Cursors are created lazily on first write and only ever overwritten,
//! never deleted. Single writer, many readers.

use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::db::map_err;
use crate::error::StoreResult;
use crate::tables::CURSORS;

/// A stored cursor value with its last-write timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CursorEntry {
    pub value: i64,
    /// Unix milliseconds of the last write.
    pub updated_at: i64,
}

/// Durable cursor map backed by redb.
#[derive(Clone)]
pub struct CursorStore {
    db: Arc<Database>,
}

impl CursorStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Insert or replace the cursor for `key`.
    pub fn put(&self, key: &str, value: i64) -> StoreResult<()> {
        let entry = CursorEntry {
            value,
            updated_at: chrono::Utc::now().timestamp_millis(),
        };
        let bytes = serde_json::to_vec(&entry).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(CURSORS).map_err(map_err!(Table))?;
            table
                .insert(key, bytes.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, value, "cursor stored");
        Ok(())
    }

    /// Point read. Callers must tolerate `None` for never-written keys.
    pub fn get(&self, key: &str) -> StoreResult<Option<i64>> {
        Ok(self.get_entry(key)?.map(|e| e.value))
    }

    /// Read the full entry including its update timestamp.
    pub fn get_entry(&self, key: &str) -> StoreResult<Option<CursorEntry>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(CURSORS).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let entry: CursorEntry =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(entry))
            }
            None => Ok(None),
        }
    }
}
