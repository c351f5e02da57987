//! Subscription manager — per-subscriber filter, projection, fan-out.
//!
//! Subscribers hold a transport-neutral connection (a bounded channel).
//! Fan-out never blocks watcher progress: delivery uses `try_send`, and
//! a full or dead channel closes the subscriber.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use chrono::{SecondsFormat, Utc};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info};

use avaast_core::{Expression, SubscriptionRecord};
use avaast_query::{evaluate, EvalContext, Row};

use crate::error::XrpcError;

/// Buffered frames per subscriber before it is considered dead.
const SUBSCRIBER_BUFFER: usize = 64;

/// Alias under which the changed record's fields are visible to filters.
const RECORD_ALIAS: &str = "record";

struct Subscriber {
    id: u64,
    params: HashMap<String, String>,
    tx: mpsc::Sender<Value>,
}

/// Registry of subscription specs plus their attached subscribers.
#[derive(Default)]
pub struct SubscriptionManager {
    specs: RwLock<HashMap<String, SubscriptionRecord>>,
    subscribers: RwLock<HashMap<String, Vec<Subscriber>>>,
    next_id: AtomicU64,
}

impl SubscriptionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a subscription definition.
    pub fn register(&self, name: &str, spec: SubscriptionRecord) {
        let mut specs = self.specs.write().expect("specs lock");
        specs.insert(name.to_string(), spec);
        debug!(name, "subscription registered");
    }

    pub fn unregister(&self, name: &str) {
        self.specs.write().expect("specs lock").remove(name);
        self.subscribers
            .write()
            .expect("subscribers lock")
            .remove(name);
    }

    pub fn subscription_names(&self) -> Vec<String> {
        let specs = self.specs.read().expect("specs lock");
        let mut names: Vec<String> = specs.keys().cloned().collect();
        names.sort();
        names
    }

    /// Attach a subscriber. Returns its id and the notification stream;
    /// dropping the receiver closes the subscriber on the next delivery.
    pub fn subscribe(
        &self,
        name: &str,
        params: HashMap<String, String>,
    ) -> Result<(u64, mpsc::Receiver<Value>), XrpcError> {
        {
            let specs = self.specs.read().expect("specs lock");
            if !specs.contains_key(name) {
                return Err(XrpcError::MethodNotFound(format!(
                    "no subscription named {name}"
                )));
            }
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let mut subscribers = self.subscribers.write().expect("subscribers lock");
        subscribers
            .entry(name.to_string())
            .or_default()
            .push(Subscriber { id, params, tx });
        info!(name, subscriber = id, "subscriber attached");
        Ok((id, rx))
    }

    /// Detach one subscriber (driven by the connection's close signal).
    pub fn unsubscribe(&self, name: &str, id: u64) {
        let mut subscribers = self.subscribers.write().expect("subscribers lock");
        if let Some(list) = subscribers.get_mut(name) {
            list.retain(|s| s.id != id);
        }
    }

    pub fn subscriber_count(&self, name: &str) -> usize {
        let subscribers = self.subscribers.read().expect("subscribers lock");
        subscribers.get(name).map(|l| l.len()).unwrap_or(0)
    }

    /// Fan a record change out to every matching subscriber. Subscribers
    /// whose channel is full or closed are removed.
    pub fn notify(&self, collection: &str, record: &Value) {
        let matching: Vec<(String, SubscriptionRecord)> = {
            let specs = self.specs.read().expect("specs lock");
            specs
                .iter()
                .filter(|(_, spec)| spec.collection == collection)
                .map(|(name, spec)| (name.clone(), spec.clone()))
                .collect()
        };

        for (name, spec) in matching {
            let mut dead: Vec<u64> = Vec::new();
            {
                let subscribers = self.subscribers.read().expect("subscribers lock");
                let Some(list) = subscribers.get(&name) else {
                    continue;
                };
                for subscriber in list {
                    if !matches_filter(&spec.filter, record, &subscriber.params) {
                        continue;
                    }
                    let frame = serde_json::json!({
                        "type": "subscription",
                        "subscription": name,
                        "data": project(record, &spec.projection),
                        "timestamp": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
                    });
                    if subscriber.tx.try_send(frame).is_err() {
                        dead.push(subscriber.id);
                    }
                }
            }
            for id in dead {
                debug!(name, subscriber = id, "closing dead subscriber");
                self.unsubscribe(&name, id);
            }
        }
    }
}

/// Evaluate the filter against the record merged with the subscriber's
/// parameters. A missing filter matches everything; evaluation errors
/// drop the notification rather than the subscriber.
fn matches_filter(
    filter: &Option<Expression>,
    record: &Value,
    params: &HashMap<String, String>,
) -> bool {
    let Some(filter) = filter else {
        return true;
    };
    let mut row = Row::new();
    if let Value::Object(fields) = record {
        for (k, v) in fields {
            row.insert(format!("{RECORD_ALIAS}.{k}"), v.clone());
        }
    }
    let ctx = EvalContext::new(&row, params);
    match evaluate(filter, &ctx) {
        Ok(value) => avaast_query::is_truthy(&value),
        Err(e) => {
            debug!(error = %e, "subscription filter failed, dropping notification");
            false
        }
    }
}

/// Project the configured fields out of the record; an empty projection
/// sends the whole record.
fn project(record: &Value, fields: &[String]) -> Value {
    if fields.is_empty() {
        return record.clone();
    }
    let mut out = serde_json::Map::new();
    for field in fields {
        let value = field
            .split('.')
            .try_fold(record, |v, seg| v.get(seg))
            .cloned()
            .unwrap_or(Value::Null);
        out.insert(field.clone(), value);
    }
    Value::Object(out)
}
