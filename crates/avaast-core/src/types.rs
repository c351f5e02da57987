//! Domain types shared across the Avaast subsystems.
//!
//! Record bodies follow the wire layout of the `app.avaast.*` lexicons
//! (camelCase field names). All types are serde-serializable so they can
//! round-trip through PDS records and the admin API.

use serde::{Deserialize, Serialize};

use crate::query::Query;

/// Collection NSIDs watched by default.
pub mod collections {
    pub const COMPUTED: &str = "app.avaast.computed";
    pub const FUNCTION: &str = "app.avaast.function";
    pub const SEARCH_INDEX: &str = "app.avaast.searchIndex";
    pub const SUBSCRIPTION: &str = "app.avaast.subscription";
    pub const DEPLOY: &str = "app.avaast.deploy";
    pub const APP_VIEW: &str = "app.avaast.appView";

    /// The fixed set of collections every watcher observes.
    pub fn watched() -> Vec<String> {
        [COMPUTED, FUNCTION, SEARCH_INDEX, SUBSCRIPTION, DEPLOY, APP_VIEW]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }
}

// ── Resource references ────────────────────────────────────────────

/// Identifies one immutable resource: the account that owns it plus the
/// content hash of its record body.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRef {
    pub authority_id: String,
    pub content_hash: String,
}

impl ResourceRef {
    pub fn new(authority_id: impl Into<String>, content_hash: impl Into<String>) -> Self {
        Self {
            authority_id: authority_id.into(),
            content_hash: content_hash.into(),
        }
    }

    /// Canonical textual form, used as the key into deploy-scoped maps.
    pub fn key(&self) -> String {
        format!("{}:{}", self.authority_id, self.content_hash)
    }
}

impl std::fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.authority_id, self.content_hash)
    }
}

// ── Endpoints and deploys ──────────────────────────────────────────

/// What a deployed endpoint executes when called.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EndpointKind {
    Computed,
    Function,
    SearchIndex,
    Subscription,
}

impl EndpointKind {
    /// Read endpoints are served over GET, write endpoints over POST.
    pub fn is_read(&self) -> bool {
        !matches!(self, EndpointKind::Function)
    }
}

/// One externally visible XRPC method published by a deploy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployedEndpoint {
    /// The XRPC method name, unique within a deploy.
    pub name: String,
    pub kind: EndpointKind,
    #[serde(rename = "ref")]
    pub resource: ResourceRef,
}

/// Kind discriminator for dependency entries. `Collection` marks a raw
/// PDS collection the resource reads from rather than another record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ResourceKind {
    Computed,
    Function,
    SearchIndex,
    Subscription,
    Collection,
}

impl ResourceKind {
    /// The `app.avaast.*` collection records of this kind live in.
    /// `Collection` dependencies point at raw data collections instead.
    pub fn collection_nsid(&self) -> Option<&'static str> {
        match self {
            ResourceKind::Computed => Some(collections::COMPUTED),
            ResourceKind::Function => Some(collections::FUNCTION),
            ResourceKind::SearchIndex => Some(collections::SEARCH_INDEX),
            ResourceKind::Subscription => Some(collections::SUBSCRIPTION),
            ResourceKind::Collection => None,
        }
    }
}

impl From<EndpointKind> for ResourceKind {
    fn from(kind: EndpointKind) -> Self {
        match kind {
            EndpointKind::Computed => ResourceKind::Computed,
            EndpointKind::Function => ResourceKind::Function,
            EndpointKind::SearchIndex => ResourceKind::SearchIndex,
            EndpointKind::Subscription => ResourceKind::Subscription,
        }
    }
}

/// A dependency declared by a record body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Dependency {
    pub kind: ResourceKind,
    #[serde(rename = "ref", skip_serializing_if = "Option::is_none")]
    pub resource: Option<ResourceRef>,
    /// Collection NSID, present only for `kind == Collection`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub collection: Option<String>,
}

/// Body of an `app.avaast.deploy` record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployRecord {
    pub endpoints: Vec<DeployedEndpoint>,
}

/// One weighted routing rule inside an `app.avaast.appView` record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrafficRule {
    pub deploy: ResourceRef,
    /// Basis points of traffic (0–10000). The rule set must sum to 10000.
    #[serde(rename = "weightBP")]
    pub weight_bp: u32,
}

/// Body of an `app.avaast.appView` record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppViewRecord {
    pub rules: Vec<TrafficRule>,
}

/// Body of an `app.avaast.subscription` record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionRecord {
    /// Collection whose changes feed this subscription.
    pub collection: String,
    /// Optional filter evaluated against the changed record ∪ subscriber params.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<crate::expr::Expression>,
    /// Fields projected into each notification.
    #[serde(default)]
    pub projection: Vec<String>,
}

/// Body of an `app.avaast.computed` record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComputedRecord {
    pub query: Query,
    #[serde(default)]
    pub dependencies: Vec<Dependency>,
}

// ── PDS records and watcher events ─────────────────────────────────

/// A record as returned by `com.atproto.repo.listRecords`/`getRecord`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordEnvelope {
    pub uri: String,
    pub cid: String,
    pub value: serde_json::Value,
}

/// What happened to a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventOp {
    Create,
    Update,
    Delete,
}

impl EventOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventOp::Create => "create",
            EventOp::Update => "update",
            EventOp::Delete => "delete",
        }
    }
}

/// One change observed by the watcher, already filtered to the watched
/// authority and collections.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordEvent {
    pub op: EventOp,
    pub collection: String,
    pub record_key: String,
    pub authority_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<serde_json::Value>,
}
