//! PDS record and blob access over AT-Protocol XRPC.
//!
//! Every call retries with exponential backoff (3 attempts, 500 ms
//! doubling, capped at 5 s) before surfacing an upstream error.

use std::future::Future;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, warn};

use avaast_core::RecordEnvelope;

use crate::error::{PdsError, PdsResult};
use crate::resolver::PdsResolver;

const MAX_ATTEMPTS: u32 = 3;
const BASE_DELAY: Duration = Duration::from_millis(500);
const MAX_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
struct ListRecordsResponse {
    records: Vec<RecordEnvelope>,
    #[serde(default)]
    cursor: Option<String>,
}

/// Client for a single account's PDS, resolved lazily from its DID.
#[derive(Clone)]
pub struct PdsClient {
    http: reqwest::Client,
    resolver: PdsResolver,
    /// Fixed base URL; skips DID resolution when set.
    base_url: Option<String>,
}

impl PdsClient {
    pub fn new(http: reqwest::Client, resolver: PdsResolver) -> Self {
        Self {
            http,
            resolver,
            base_url: None,
        }
    }

    /// Pin the PDS base URL instead of resolving the DID.
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into().trim_end_matches('/').to_string());
        self
    }

    async fn base_for(&self, did: &str) -> PdsResult<String> {
        match &self.base_url {
            Some(url) => Ok(url.clone()),
            None => self.resolver.resolve(did).await,
        }
    }

    /// Fetch a single record.
    pub async fn get_record(
        &self,
        did: &str,
        collection: &str,
        record_key: &str,
    ) -> PdsResult<RecordEnvelope> {
        let base = self.base_for(did).await?;
        let url = format!(
            "{base}/xrpc/com.atproto.repo.getRecord?repo={did}&collection={collection}&rkey={record_key}"
        );
        retry("getRecord", || {
            let http = self.http.clone();
            let url = url.clone();
            async move {
                let resp = http.get(&url).send().await?;
                check_status(&resp)?;
                let envelope: RecordEnvelope = resp
                    .json()
                    .await
                    .map_err(|e| PdsError::Decode(e.to_string()))?;
                Ok(envelope)
            }
        })
        .await
    }

    /// List records in a collection, following pagination up to `limit`.
    pub async fn list_records(
        &self,
        did: &str,
        collection: &str,
        limit: usize,
    ) -> PdsResult<Vec<RecordEnvelope>> {
        let base = self.base_for(did).await?;
        let mut records = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let page = limit.saturating_sub(records.len()).min(100).max(1);
            let mut url = format!(
                "{base}/xrpc/com.atproto.repo.listRecords?repo={did}&collection={collection}&limit={page}"
            );
            if let Some(c) = &cursor {
                url.push_str(&format!("&cursor={c}"));
            }
            let resp: ListRecordsResponse = retry("listRecords", || {
                let http = self.http.clone();
                let url = url.clone();
                async move {
                    let resp = http.get(&url).send().await?;
                    check_status(&resp)?;
                    resp.json()
                        .await
                        .map_err(|e| PdsError::Decode(e.to_string()))
                }
            })
            .await?;

            let short_page = resp.records.len() < page;
            records.extend(resp.records);
            cursor = resp.cursor;
            if records.len() >= limit || cursor.is_none() || short_page {
                break;
            }
        }

        records.truncate(limit);
        Ok(records)
    }

    /// Fetch a blob by CID.
    pub async fn get_blob(&self, did: &str, cid: &str) -> PdsResult<Vec<u8>> {
        let base = self.base_for(did).await?;
        let url = format!("{base}/xrpc/com.atproto.sync.getBlob?did={did}&cid={cid}");
        retry("getBlob", || {
            let http = self.http.clone();
            let url = url.clone();
            async move {
                let resp = http.get(&url).send().await?;
                check_status(&resp)?;
                let bytes = resp.bytes().await?;
                Ok(bytes.to_vec())
            }
        })
        .await
    }
}

fn check_status(resp: &reqwest::Response) -> PdsResult<()> {
    let status = resp.status();
    if status == reqwest::StatusCode::NOT_FOUND {
        return Err(PdsError::NotFound);
    }
    if !status.is_success() {
        return Err(PdsError::Upstream {
            status: status.as_u16(),
        });
    }
    Ok(())
}

/// Delay before the next attempt: 500 ms doubling, capped at 5 s.
fn backoff_delay(attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt);
    (BASE_DELAY * factor).min(MAX_DELAY)
}

async fn retry<T, F, Fut>(op: &str, mut call: F) -> PdsResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = PdsResult<T>>,
{
    let mut attempt = 0;
    loop {
        match call().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_retryable() && attempt + 1 < MAX_ATTEMPTS => {
                let delay = backoff_delay(attempt);
                warn!(op, attempt, ?delay, error = %e, "PDS call failed, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                debug!(op, attempt, error = %e, "PDS call failed");
                return Err(e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(backoff_delay(0), Duration::from_millis(500));
        assert_eq!(backoff_delay(1), Duration::from_secs(1));
        assert_eq!(backoff_delay(2), Duration::from_secs(2));
        assert_eq!(backoff_delay(3), Duration::from_secs(4));
        assert_eq!(backoff_delay(4), Duration::from_secs(5));
        assert_eq!(backoff_delay(10), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_gives_up_after_three_attempts() {
        let calls = AtomicU32::new(0);
        let result: PdsResult<()> = retry("test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(PdsError::Upstream { status: 502 }) }
        })
        .await;
        assert!(matches!(result, Err(PdsError::Upstream { status: 502 })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_does_not_repeat_not_found() {
        let calls = AtomicU32::new(0);
        let result: PdsResult<()> = retry("test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(PdsError::NotFound) }
        })
        .await;
        assert!(matches!(result, Err(PdsError::NotFound)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_succeeds_after_transient_failure() {
        let calls = AtomicU32::new(0);
        let result = retry("test", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(PdsError::Upstream { status: 503 })
                } else {
                    Ok(41 + 1)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
