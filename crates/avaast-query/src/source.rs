//! Data sources — where the engine's rows come from.
//!
//! Adapters return unprefixed field maps; the engine re-prefixes keys
//! with the source alias. Live collections come from the PDS; sources
//! with a `:updates` or `:deletes` suffix route to the change log.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use avaast_core::query::Source;
use avaast_core::EventOp;
use avaast_pds::PdsClient;
use avaast_store::{ChangeFilter, ChangeLog};

use crate::error::{QueryError, QueryResult};
use crate::value::Row;

/// How many records one fetch pulls from a live collection.
const FETCH_LIMIT: usize = 1000;

/// Provides records for a query source.
#[async_trait]
pub trait DataSource: Send + Sync {
    /// Fetch the rows backing `source`. Keys in the returned rows carry
    /// no alias prefix. `default_authority` applies when the source does
    /// not pin one.
    async fn fetch(&self, source: &Source, default_authority: &str) -> QueryResult<Vec<Row>>;
}

/// Which backing store a collection name routes to.
#[derive(Debug, PartialEq)]
pub enum Route<'a> {
    Live(&'a str),
    Updates(&'a str),
    Deletes(&'a str),
}

/// Interpret history suffixes on a collection name.
pub fn route_collection(collection: &str) -> Route<'_> {
    if let Some(base) = collection.strip_suffix(":updates") {
        Route::Updates(base)
    } else if let Some(base) = collection.strip_suffix(":deletes") {
        Route::Deletes(base)
    } else {
        Route::Live(collection)
    }
}

/// Production data source: live PDS records plus change log history.
pub struct RoutingDataSource {
    client: PdsClient,
    changelog: Option<ChangeLog>,
}

impl RoutingDataSource {
    pub fn new(client: PdsClient, changelog: Option<ChangeLog>) -> Self {
        Self { client, changelog }
    }

    async fn fetch_live(&self, collection: &str, authority: &str) -> QueryResult<Vec<Row>> {
        let records = self
            .client
            .list_records(authority, collection, FETCH_LIMIT)
            .await
            .map_err(|e| QueryError::Source(e.to_string()))?;
        debug!(collection, count = records.len(), "live fetch");
        Ok(records
            .into_iter()
            .map(|envelope| {
                let mut row = Row::new();
                if let Value::Object(fields) = envelope.value {
                    for (k, v) in fields {
                        row.insert(k, v);
                    }
                }
                row.insert("_uri".to_string(), Value::String(envelope.uri));
                row.insert("_cid".to_string(), Value::String(envelope.cid));
                row
            })
            .collect())
    }

    fn fetch_history(
        &self,
        collection: &str,
        authority: &str,
        deletes_only: bool,
    ) -> QueryResult<Vec<Row>> {
        let Some(changelog) = &self.changelog else {
            return Err(QueryError::Source(
                "change log is not wired; history sources unavailable".to_string(),
            ));
        };
        let rows = changelog
            .query(&ChangeFilter {
                collection: collection.to_string(),
                authority_id: Some(authority.to_string()),
                event_type: deletes_only.then_some(EventOp::Delete),
                after_timestamp: None,
                limit: Some(FETCH_LIMIT),
            })
            .map_err(|e| QueryError::Storage(e.to_string()))?;

        Ok(rows
            .into_iter()
            .filter(|r| deletes_only || r.event_type != EventOp::Delete)
            .map(|change| {
                let mut row = Row::new();
                if let Some(Value::Object(fields)) = change.body {
                    for (k, v) in fields {
                        row.insert(k, v);
                    }
                }
                row.insert("_rkey".to_string(), Value::String(change.record_key));
                row.insert(
                    "_authorityId".to_string(),
                    Value::String(change.authority_id),
                );
                row.insert(
                    "_eventType".to_string(),
                    Value::String(change.event_type.as_str().to_string()),
                );
                let created = chrono::DateTime::from_timestamp_millis(change.created_at)
                    .map(|dt| dt.to_rfc3339_opts(chrono::SecondsFormat::Millis, true))
                    .unwrap_or_default();
                row.insert("_createdAt".to_string(), Value::String(created));
                row
            })
            .collect())
    }
}

#[async_trait]
impl DataSource for RoutingDataSource {
    async fn fetch(&self, source: &Source, default_authority: &str) -> QueryResult<Vec<Row>> {
        let authority = source
            .authority_id
            .as_deref()
            .unwrap_or(default_authority);
        match route_collection(&source.collection) {
            Route::Live(collection) => self.fetch_live(collection, authority).await,
            Route::Updates(collection) => self.fetch_history(collection, authority, false),
            Route::Deletes(collection) => self.fetch_history(collection, authority, true),
        }
    }
}

/// Fixed in-memory data source for tests and local execution.
#[derive(Default)]
pub struct StaticDataSource {
    collections: RwLock<HashMap<String, Vec<Row>>>,
}

impl StaticDataSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, collection: &str, rows: Vec<Row>) {
        let mut collections = self.collections.write().expect("collections lock");
        collections.insert(collection.to_string(), rows);
    }
}

#[async_trait]
impl DataSource for StaticDataSource {
    async fn fetch(&self, source: &Source, _default_authority: &str) -> QueryResult<Vec<Row>> {
        let collections = self.collections.read().expect("collections lock");
        Ok(collections
            .get(&source.collection)
            .cloned()
            .unwrap_or_default())
    }
}
