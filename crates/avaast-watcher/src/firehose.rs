//! Firehose transport — repo commit stream from the authoritative PDS.
//!
//! The real firehose carries CBOR/CAR binary frames; this transport
//! consumes textual JSON frames best-effort and ignores anything it
//! cannot decode. Sequence numbers are committed to the cursor store
//! under the `"firehose"` key so reconnects resume without loss
//! (duplicates are tolerated downstream).

use futures_util::StreamExt;
use serde::Deserialize;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use avaast_core::{EventOp, RecordEvent};
use avaast_store::CursorStore;

use crate::backoff::Backoff;
use crate::watcher::EventSink;

pub const CURSOR_KEY: &str = "firehose";

#[derive(Debug, Deserialize)]
struct FirehoseFrame {
    #[serde(default)]
    seq: Option<i64>,
    /// The repo DID the commit applies to.
    #[serde(default)]
    repo: Option<String>,
    #[serde(default)]
    ops: Vec<FirehoseOp>,
    #[serde(default)]
    record: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct FirehoseOp {
    #[serde(default)]
    action: String,
    /// `{collection}/{record_key}`.
    #[serde(default)]
    path: String,
    #[serde(default)]
    cid: Option<String>,
}

/// Decoded content of one textual firehose frame.
#[derive(Debug, PartialEq)]
pub struct DecodedFrame {
    pub seq: Option<i64>,
    pub events: Vec<RecordEvent>,
}

/// Parse a textual firehose frame. Returns `None` when the frame is not
/// JSON or carries no commit shape.
pub fn decode_frame(text: &str) -> Option<DecodedFrame> {
    let frame: FirehoseFrame = serde_json::from_str(text).ok()?;
    let authority = frame.repo.clone().unwrap_or_default();
    let mut events = Vec::new();
    for op in &frame.ops {
        let Some((collection, record_key)) = op.path.split_once('/') else {
            continue;
        };
        let event_op = match op.action.as_str() {
            "create" => EventOp::Create,
            "update" => EventOp::Update,
            "delete" => EventOp::Delete,
            _ => continue,
        };
        events.push(RecordEvent {
            op: event_op,
            collection: collection.to_string(),
            record_key: record_key.to_string(),
            authority_id: authority.clone(),
            content_hash: op.cid.clone(),
            // The firehose does not carry full bodies in this mode; the
            // controller re-fetches from the PDS when it needs one.
            body: frame.record.clone(),
        });
    }
    if frame.seq.is_none() && events.is_empty() {
        return None;
    }
    Some(DecodedFrame {
        seq: frame.seq,
        events,
    })
}

/// The subscription URL for a PDS base, including the resume cursor.
pub fn subscribe_url(pds_base: &str, cursor: Option<i64>) -> String {
    let ws_base = if let Some(rest) = pds_base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = pds_base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        pds_base.to_string()
    };
    let mut url = format!("{ws_base}/xrpc/com.atproto.sync.subscribeRepos");
    if let Some(c) = cursor {
        url.push_str(&format!("?cursor={c}"));
    }
    url
}

/// Try an initial connection; `Err` means the caller should fall through
/// to polling mode.
pub async fn probe(pds_base: &str) -> Result<(), String> {
    let url = subscribe_url(pds_base, None);
    match connect_async(url.as_str()).await {
        Ok((stream, _)) => {
            drop(stream);
            Ok(())
        }
        Err(e) => Err(e.to_string()),
    }
}

/// Run the firehose transport until the sink is closed.
pub async fn run(pds_base: String, cursors: CursorStore, sink: EventSink) {
    let mut backoff = Backoff::new();
    loop {
        if sink.is_closed() {
            return;
        }
        let cursor = cursors.get(CURSOR_KEY).unwrap_or_else(|e| {
            warn!(error = %e, "cursor read failed, subscribing without resume point");
            None
        });
        let url = subscribe_url(&pds_base, cursor);
        match connect_async(url.as_str()).await {
            Ok((mut stream, _)) => {
                info!(%url, ?cursor, "firehose connected");
                backoff.reset();
                while let Some(msg) = stream.next().await {
                    match msg {
                        Ok(Message::Text(text)) => {
                            let Some(decoded) = decode_frame(&text) else {
                                continue;
                            };
                            if let Some(seq) = decoded.seq {
                                if let Err(e) = cursors.put(CURSOR_KEY, seq) {
                                    warn!(error = %e, seq, "cursor write failed");
                                }
                            }
                            for event in decoded.events {
                                if !sink.emit(event).await {
                                    return;
                                }
                            }
                        }
                        // Binary frames are CBOR/CAR; decoding them is out
                        // of contract, so they are skipped.
                        Ok(Message::Binary(_)) => {}
                        Ok(Message::Close(_)) => {
                            info!("firehose closed the connection");
                            break;
                        }
                        Ok(_) => {}
                        Err(e) => {
                            warn!(error = %e, "firehose read error");
                            break;
                        }
                    }
                }
            }
            Err(e) => {
                warn!(%url, error = %e, "firehose connect failed");
            }
        }
        let delay = backoff.next_delay();
        debug!(?delay, "firehose reconnecting");
        tokio::time::sleep(delay).await;
    }
}
