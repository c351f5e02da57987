//! DID → PDS endpoint resolution with a TTL cache.
//!
//! Two identifier families are supported: directory-hosted (`did:plc:`)
//! resolved via the PLC directory, and web-hosted (`did:web:`) resolved
//! via the domain's `/.well-known/did.json`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{PdsError, PdsResult};

const DEFAULT_DIRECTORY: &str = "https://plc.directory";
const DEFAULT_TTL: Duration = Duration::from_secs(300);

/// Subset of a DID document we care about.
#[derive(Debug, Deserialize)]
struct DidDocument {
    #[serde(default)]
    service: Vec<DidService>,
}

#[derive(Debug, Deserialize)]
struct DidService {
    #[serde(default)]
    id: String,
    #[serde(rename = "type", default)]
    service_type: String,
    #[serde(rename = "serviceEndpoint", default)]
    service_endpoint: String,
}

/// Resolves authority identifiers to PDS base URLs, caching results.
#[derive(Clone)]
pub struct PdsResolver {
    http: reqwest::Client,
    directory_url: String,
    ttl: Duration,
    cache: Arc<RwLock<HashMap<String, (String, Instant)>>>,
}

impl PdsResolver {
    pub fn new(http: reqwest::Client) -> Self {
        Self {
            http,
            directory_url: DEFAULT_DIRECTORY.to_string(),
            ttl: DEFAULT_TTL,
            cache: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Override the directory base URL (for tests and private directories).
    pub fn with_directory(mut self, url: impl Into<String>) -> Self {
        self.directory_url = url.into();
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Resolve a DID to its PDS base URL, consulting the cache first.
    pub async fn resolve(&self, did: &str) -> PdsResult<String> {
        {
            let cache = self.cache.read().await;
            if let Some((url, fetched_at)) = cache.get(did) {
                if fetched_at.elapsed() < self.ttl {
                    return Ok(url.clone());
                }
            }
        }

        let doc_url = did_document_url(did, &self.directory_url)
            .ok_or_else(|| PdsError::Resolution(did.to_string()))?;
        let resp = self.http.get(&doc_url).send().await?;
        if !resp.status().is_success() {
            return Err(PdsError::Resolution(format!(
                "{did}: document fetch returned {}",
                resp.status()
            )));
        }
        let doc: DidDocument = resp
            .json()
            .await
            .map_err(|e| PdsError::Decode(e.to_string()))?;

        let endpoint = pds_endpoint(&doc).ok_or_else(|| {
            PdsError::Resolution(format!("{did}: no AT-proto service entry"))
        })?;

        debug!(%did, %endpoint, "resolved PDS endpoint");
        let mut cache = self.cache.write().await;
        cache.insert(did.to_string(), (endpoint.clone(), Instant::now()));
        Ok(endpoint)
    }

    /// Drop a cached entry (used after terminal upstream failures).
    pub async fn invalidate(&self, did: &str) {
        self.cache.write().await.remove(did);
    }
}

/// Where to fetch the DID document for the given identifier.
fn did_document_url(did: &str, directory_url: &str) -> Option<String> {
    if let Some(domain) = did.strip_prefix("did:web:") {
        if domain.is_empty() {
            return None;
        }
        Some(format!("https://{domain}/.well-known/did.json"))
    } else if did.starts_with("did:plc:") {
        Some(format!("{directory_url}/{did}"))
    } else {
        None
    }
}

/// Locate the AT-proto PDS service entry in a DID document.
fn pds_endpoint(doc: &DidDocument) -> Option<String> {
    doc.service
        .iter()
        .find(|s| {
            s.service_type == "AtprotoPersonalDataServer" || s.id.ends_with("#atproto_pds")
        })
        .map(|s| s.service_endpoint.trim_end_matches('/').to_string())
        .filter(|e| !e.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plc_did_uses_directory() {
        let url = did_document_url("did:plc:abc123", "https://plc.directory").unwrap();
        assert_eq!(url, "https://plc.directory/did:plc:abc123");
    }

    #[test]
    fn web_did_uses_well_known() {
        let url = did_document_url("did:web:pds.example.com", "https://plc.directory").unwrap();
        assert_eq!(url, "https://pds.example.com/.well-known/did.json");
    }

    #[test]
    fn unknown_did_method_rejected() {
        assert!(did_document_url("did:key:z6Mk", "https://plc.directory").is_none());
        assert!(did_document_url("did:web:", "https://plc.directory").is_none());
    }

    #[test]
    fn service_entry_by_type() {
        let doc: DidDocument = serde_json::from_value(serde_json::json!({
            "service": [
                {"id": "#other", "type": "SomethingElse", "serviceEndpoint": "https://x"},
                {"id": "#atproto_pds", "type": "AtprotoPersonalDataServer",
                 "serviceEndpoint": "https://pds.example/"}
            ]
        }))
        .unwrap();
        assert_eq!(pds_endpoint(&doc).unwrap(), "https://pds.example");
    }

    #[test]
    fn service_entry_by_id_suffix() {
        let doc: DidDocument = serde_json::from_value(serde_json::json!({
            "service": [
                {"id": "did:plc:x#atproto_pds", "type": "Custom",
                 "serviceEndpoint": "https://pds.example"}
            ]
        }))
        .unwrap();
        assert_eq!(pds_endpoint(&doc).unwrap(), "https://pds.example");
    }

    #[test]
    fn missing_service_entry() {
        let doc: DidDocument = serde_json::from_value(serde_json::json!({"service": []})).unwrap();
        assert!(pds_endpoint(&doc).is_none());
    }
}
