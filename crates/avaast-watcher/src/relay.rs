//! Relay transport — JSON-framed WebSocket of commit events.
//!
//! Each frame is `{kind, authorityId, time_us, commit: {operation,
//! collection, recordKey, body?, contentHash?}}`. Only `kind == "commit"`
//! frames are translated; everything else (identity, account, info) is
//! dropped.

use futures_util::StreamExt;
use serde::Deserialize;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use avaast_core::{EventOp, RecordEvent};

use crate::backoff::Backoff;
use crate::watcher::EventSink;

#[derive(Debug, Deserialize)]
struct RelayFrame {
    #[serde(default)]
    kind: String,
    #[serde(rename = "authorityId", default)]
    authority_id: String,
    #[serde(default)]
    commit: Option<RelayCommit>,
}

#[derive(Debug, Deserialize)]
struct RelayCommit {
    #[serde(default)]
    operation: String,
    #[serde(default)]
    collection: String,
    #[serde(rename = "recordKey", default)]
    record_key: String,
    #[serde(default)]
    body: Option<serde_json::Value>,
    #[serde(rename = "contentHash", default)]
    content_hash: Option<String>,
}

/// Translate one relay frame into a record event. Non-commit frames and
/// unknown operations yield `None`.
pub fn translate_frame(text: &str) -> Option<RecordEvent> {
    let frame: RelayFrame = serde_json::from_str(text).ok()?;
    if frame.kind != "commit" {
        return None;
    }
    let commit = frame.commit?;
    let op = match commit.operation.as_str() {
        "create" => EventOp::Create,
        "update" => EventOp::Update,
        "delete" => EventOp::Delete,
        other => {
            debug!(operation = other, "unknown relay operation, dropping");
            return None;
        }
    };
    Some(RecordEvent {
        op,
        collection: commit.collection,
        record_key: commit.record_key,
        authority_id: frame.authority_id,
        content_hash: commit.content_hash,
        body: commit.body,
    })
}

/// Run the relay transport until the sink is closed. Reconnects on close
/// with capped exponential backoff.
pub async fn run(url: String, sink: EventSink) {
    let mut backoff = Backoff::new();
    loop {
        if sink.is_closed() {
            return;
        }
        match connect_async(url.as_str()).await {
            Ok((mut stream, _)) => {
                info!(%url, "relay connected");
                backoff.reset();
                while let Some(msg) = stream.next().await {
                    match msg {
                        Ok(Message::Text(text)) => {
                            if let Some(event) = translate_frame(&text) {
                                if !sink.emit(event).await {
                                    return;
                                }
                            }
                        }
                        Ok(Message::Close(_)) => {
                            info!(%url, "relay closed the connection");
                            break;
                        }
                        Ok(_) => {}
                        Err(e) => {
                            warn!(%url, error = %e, "relay read error");
                            break;
                        }
                    }
                }
            }
            Err(e) => {
                warn!(%url, error = %e, "relay connect failed");
            }
        }
        let delay = backoff.next_delay();
        debug!(%url, ?delay, "relay reconnecting");
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_frame_translates() {
        let text = serde_json::json!({
            "kind": "commit",
            "authorityId": "did:plc:alice",
            "time_us": 1700000000000000u64,
            "commit": {
                "operation": "create",
                "collection": "app.avaast.deploy",
                "recordKey": "3kabc",
                "body": {"endpoints": []},
                "contentHash": "bafy1"
            }
        })
        .to_string();
        let event = translate_frame(&text).unwrap();
        assert_eq!(event.op, EventOp::Create);
        assert_eq!(event.collection, "app.avaast.deploy");
        assert_eq!(event.record_key, "3kabc");
        assert_eq!(event.authority_id, "did:plc:alice");
        assert_eq!(event.content_hash.as_deref(), Some("bafy1"));
    }

    #[test]
    fn non_commit_frame_dropped() {
        let text = serde_json::json!({
            "kind": "identity",
            "authorityId": "did:plc:alice"
        })
        .to_string();
        assert!(translate_frame(&text).is_none());
    }

    #[test]
    fn delete_frame_has_no_body() {
        let text = serde_json::json!({
            "kind": "commit",
            "authorityId": "did:plc:alice",
            "commit": {
                "operation": "delete",
                "collection": "app.avaast.computed",
                "recordKey": "3kdef"
            }
        })
        .to_string();
        let event = translate_frame(&text).unwrap();
        assert_eq!(event.op, EventOp::Delete);
        assert!(event.body.is_none());
        assert!(event.content_hash.is_none());
    }

    #[test]
    fn malformed_json_dropped() {
        assert!(translate_frame("{not json").is_none());
        assert!(translate_frame("{}").is_none());
    }

    #[test]
    fn unknown_operation_dropped() {
        let text = serde_json::json!({
            "kind": "commit",
            "authorityId": "did:plc:alice",
            "commit": {"operation": "truncate", "collection": "c", "recordKey": "r"}
        })
        .to_string();
        assert!(translate_frame(&text).is_none());
    }
}
