//! Manifest building — from a deploy record to a resolved snapshot.
//!
//! The builder drives graph discovery, validates, then resolves each
//! node in topological order from the in-memory record store, falling
//! back to the PDS for records it has not seen and for function code
//! blobs. A manifest is constructed exactly once and never mutated;
//! building is idempotent for an unchanged input record graph.

use std::collections::{HashMap, HashSet, VecDeque};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use avaast_core::{DeployRecord, DeployedEndpoint, Dependency, ResourceKind, ResourceRef};
use avaast_pds::PdsClient;

use crate::error::{DeployError, DeployResult};
use crate::graph::{self, DependencyGraph, GraphNode};
use crate::store::{RecordStore, StoredRecord};

/// One fully resolved resource inside a manifest.
#[derive(Debug, Clone)]
pub struct ResolvedResource {
    pub resource: ResourceRef,
    pub kind: ResourceKind,
    pub record_body: serde_json::Value,
    pub dependencies: Vec<Dependency>,
    /// Populated only for function-kind resources.
    pub code_blob: Option<Vec<u8>>,
}

/// Immutable snapshot of a deploy's resolved resources.
#[derive(Debug, Clone)]
pub struct DeployManifest {
    pub deploy_ref: ResourceRef,
    pub endpoints: Vec<DeployedEndpoint>,
    pub resources: HashMap<String, ResolvedResource>,
    pub resolved_at: DateTime<Utc>,
}

impl DeployManifest {
    /// Every ref key this manifest holds.
    pub fn ref_keys(&self) -> HashSet<String> {
        self.resources.keys().cloned().collect()
    }

    pub fn endpoint(&self, name: &str) -> Option<&DeployedEndpoint> {
        self.endpoints.iter().find(|e| e.name == name)
    }

    /// The resolved resource backing an endpoint.
    pub fn resource_for(&self, endpoint: &DeployedEndpoint) -> Option<&ResolvedResource> {
        self.resources.get(&endpoint.resource.key())
    }
}

/// Builds manifests from the record store, delegating to the PDS for
/// anything not yet observed.
#[derive(Clone)]
pub struct ManifestBuilder {
    records: RecordStore,
    client: PdsClient,
}

impl ManifestBuilder {
    pub fn new(records: RecordStore, client: PdsClient) -> Self {
        Self { records, client }
    }

    pub fn record_store(&self) -> &RecordStore {
        &self.records
    }

    /// Fetch every record reachable from the deploy's endpoints into the
    /// record store. Records the PDS does not have stay missing and
    /// surface as validation errors later.
    pub async fn fetch_records(&self, record: &DeployRecord) -> DeployResult<()> {
        let mut queue: VecDeque<(ResourceRef, ResourceKind)> = record
            .endpoints
            .iter()
            .map(|e| (e.resource.clone(), ResourceKind::from(e.kind)))
            .collect();
        let mut visited: HashSet<String> = HashSet::new();

        while let Some((resource, kind)) = queue.pop_front() {
            let key = resource.key();
            if !visited.insert(key.clone()) {
                continue;
            }
            let stored = match self.records.get(&resource) {
                Some(stored) => stored,
                None => match self.fetch_by_hash(&resource, kind).await {
                    Some(stored) => stored,
                    None => {
                        warn!(resource = %resource, "record not found on PDS");
                        continue;
                    }
                },
            };
            for dep in dependencies_of(&stored.body) {
                if dep.kind == ResourceKind::Collection {
                    continue;
                }
                if let Some(dep_ref) = dep.resource {
                    queue.push_back((dep_ref, dep.kind));
                }
            }
        }
        Ok(())
    }

    /// Look for a record with a matching content hash in the collection
    /// its kind implies, and cache it on hit.
    async fn fetch_by_hash(
        &self,
        resource: &ResourceRef,
        kind: ResourceKind,
    ) -> Option<StoredRecord> {
        let collection = kind.collection_nsid()?;
        let listing = match self
            .client
            .list_records(&resource.authority_id, collection, 100)
            .await
        {
            Ok(listing) => listing,
            Err(e) => {
                warn!(collection, error = %e, "listing for manifest resolution failed");
                return None;
            }
        };
        let envelope = listing
            .into_iter()
            .find(|r| r.cid == resource.content_hash)?;
        let record_key = envelope
            .uri
            .rsplit('/')
            .next()
            .unwrap_or_default()
            .to_string();
        let stored = StoredRecord {
            resource: resource.clone(),
            kind,
            record_key,
            body: envelope.value,
        };
        self.records.insert(stored.clone());
        debug!(resource = %resource, collection, "record fetched from PDS");
        Some(stored)
    }

    /// Build and validate the dependency graph from the record store.
    pub fn build_graph(&self, record: &DeployRecord) -> DeployResult<DependencyGraph> {
        let graph = graph::build(&record.endpoints, |resource, _kind| {
            // Prefer the kind observed from the record's collection over
            // the one the referencing edge declares.
            self.records.get(resource).map(|stored| GraphNode {
                resource: resource.clone(),
                kind: stored.kind,
                dependencies: dependencies_of(&stored.body),
            })
        });
        let errors = graph::validate(&graph, &record.endpoints);
        if !errors.is_empty() {
            return Err(DeployError::Validation(errors.join("; ")));
        }
        Ok(graph)
    }

    /// Resolve every node in topological order into a manifest.
    pub async fn resolve(
        &self,
        deploy_ref: &ResourceRef,
        record: &DeployRecord,
        graph: &DependencyGraph,
    ) -> DeployResult<DeployManifest> {
        let mut resources = HashMap::with_capacity(graph.order.len());
        for key in &graph.order {
            let node = graph
                .nodes
                .get(key)
                .ok_or_else(|| DeployError::UnknownDeploy(key.clone()))?;
            let stored = self
                .records
                .get(&node.resource)
                .ok_or_else(|| DeployError::Validation(format!("resource vanished: {key}")))?;

            let code_blob = if node.kind == ResourceKind::Function {
                Some(self.fetch_code_blob(&node.resource, &stored.body).await?)
            } else {
                None
            };

            resources.insert(
                key.clone(),
                ResolvedResource {
                    resource: node.resource.clone(),
                    kind: node.kind,
                    record_body: stored.body,
                    dependencies: node.dependencies.clone(),
                    code_blob,
                },
            );
        }

        Ok(DeployManifest {
            deploy_ref: deploy_ref.clone(),
            endpoints: record.endpoints.clone(),
            resources,
            resolved_at: Utc::now(),
        })
    }

    async fn fetch_code_blob(
        &self,
        resource: &ResourceRef,
        body: &serde_json::Value,
    ) -> DeployResult<Vec<u8>> {
        let cid = body
            .get("codeBlob")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                DeployError::RecordParse(format!("function {resource} has no codeBlob"))
            })?;
        Ok(self.client.get_blob(&resource.authority_id, cid).await?)
    }

    /// The whole pipeline: fetch, graph, resolve.
    pub async fn build(
        &self,
        deploy_ref: &ResourceRef,
        record: &DeployRecord,
    ) -> DeployResult<DeployManifest> {
        self.fetch_records(record).await?;
        let graph = self.build_graph(record)?;
        self.resolve(deploy_ref, record, &graph).await
    }
}

/// Parse the `dependencies` array out of a record body.
pub fn dependencies_of(body: &serde_json::Value) -> Vec<Dependency> {
    body.get("dependencies")
        .cloned()
        .and_then(|v| serde_json::from_value(v).ok())
        .unwrap_or_default()
}
