//! The internal execution service.
//!
//! Marshals a routed request to the query engine, the search path, or
//! the user-code executor, scoped to the deploy the traffic shaper
//! selected. Results are cached per deploy version.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use avaast_core::{EndpointKind, Query, ResourceRef};
use avaast_deploy::{DeployState, Orchestrator};
use avaast_query::{QueryCache, QueryEngine};

use crate::error::XrpcError;

pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(30);

/// Wall-clock and memory limits for one user-code execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecLimits {
    pub timeout_ms: u64,
    pub memory_mb: u64,
}

impl Default for ExecLimits {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            memory_mb: 128,
        }
    }
}

impl ExecLimits {
    /// Clamp into the supported ranges: 100–30000 ms, 64–1024 MB.
    pub fn clamped(self) -> Self {
        Self {
            timeout_ms: self.timeout_ms.clamp(100, 30_000),
            memory_mb: self.memory_mb.clamp(64, 1024),
        }
    }
}

/// The sandboxed user-code executor's narrow contract: code in, value
/// out, within limits. The executor itself lives outside this system.
#[async_trait]
pub trait FunctionExecutor: Send + Sync {
    async fn execute(
        &self,
        endpoint_name: &str,
        code: &[u8],
        params: &Value,
        limits: ExecLimits,
    ) -> Result<Value, XrpcError>;
}

/// Placeholder wired when no executor is configured.
pub struct DisabledExecutor;

#[async_trait]
impl FunctionExecutor for DisabledExecutor {
    async fn execute(
        &self,
        endpoint_name: &str,
        _code: &[u8],
        _params: &Value,
        _limits: ExecLimits,
    ) -> Result<Value, XrpcError> {
        Err(XrpcError::UpstreamFailure(format!(
            "no function executor configured for {endpoint_name}"
        )))
    }
}

/// Outcome of a query-shaped execution.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryOutcome {
    pub results: Value,
    pub cached: bool,
    pub duration_ms: u64,
}

/// Executes routed requests against a selected deploy.
pub struct ExecutionService {
    orchestrator: Arc<Orchestrator>,
    engine: Arc<QueryEngine>,
    cache: Arc<QueryCache>,
    cache_ttl: Duration,
    executor: Arc<dyn FunctionExecutor>,
    limits: ExecLimits,
}

impl ExecutionService {
    pub fn new(orchestrator: Arc<Orchestrator>, engine: Arc<QueryEngine>) -> Self {
        Self {
            orchestrator,
            engine,
            cache: Arc::new(QueryCache::default()),
            cache_ttl: DEFAULT_CACHE_TTL,
            executor: Arc::new(DisabledExecutor),
            limits: ExecLimits::default(),
        }
    }

    pub fn with_executor(mut self, executor: Arc<dyn FunctionExecutor>) -> Self {
        self.executor = executor;
        self
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    pub fn with_limits(mut self, limits: ExecLimits) -> Self {
        self.limits = limits.clamped();
        self
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    /// Resolve the endpoint's backing resource inside the selected
    /// deploy's manifest.
    async fn resource_body(
        &self,
        endpoint_name: &str,
        deploy_ref: &ResourceRef,
        expect_kind: EndpointKind,
    ) -> Result<(Value, Option<Vec<u8>>), XrpcError> {
        let status = self
            .orchestrator
            .get_status(deploy_ref)
            .await
            .ok_or_else(|| {
                XrpcError::ServiceUnavailable(format!("deploy {deploy_ref} not known"))
            })?;
        // Draining deploys still serve their in-flight traffic.
        if !matches!(status.state, DeployState::Active | DeployState::Draining) {
            return Err(XrpcError::ServiceUnavailable(format!(
                "deploy {deploy_ref} is not active"
            )));
        }
        let manifest = status.manifest.ok_or_else(|| {
            XrpcError::Internal(format!("deploy {deploy_ref} has no manifest"))
        })?;
        let endpoint = manifest.endpoint(endpoint_name).ok_or_else(|| {
            XrpcError::MethodNotFound(format!(
                "deploy {deploy_ref} does not publish {endpoint_name}"
            ))
        })?;
        if endpoint.kind != expect_kind {
            return Err(XrpcError::InvalidRequest(format!(
                "{endpoint_name} is not a {expect_kind:?} endpoint"
            )));
        }
        let resource = manifest.resource_for(endpoint).ok_or_else(|| {
            XrpcError::Internal(format!("manifest is missing {}", endpoint.resource))
        })?;
        Ok((resource.record_body.clone(), resource.code_blob.clone()))
    }

    async fn run_query(
        &self,
        endpoint_name: &str,
        deploy_ref: &ResourceRef,
        params: &HashMap<String, String>,
        expect_kind: EndpointKind,
    ) -> Result<QueryOutcome, XrpcError> {
        let started = Instant::now();
        let (body, _) = self
            .resource_body(endpoint_name, deploy_ref, expect_kind)
            .await?;
        let query: Query = serde_json::from_value(
            body.get("query")
                .cloned()
                .ok_or_else(|| XrpcError::Internal(format!("{endpoint_name} has no query")))?,
        )
        .map_err(|e| XrpcError::Internal(format!("{endpoint_name} query malformed: {e}")))?;

        // Cache entries are scoped to the deploy version: activating a
        // different deploy naturally invalidates the scope.
        let version = deploy_ref.key();
        let key = QueryCache::key(&query.canonical_text(), params);
        if let Some(results) = self.cache.get(&key, &version) {
            debug!(endpoint_name, "query served from cache");
            return Ok(QueryOutcome {
                results,
                cached: true,
                duration_ms: started.elapsed().as_millis() as u64,
            });
        }

        let _guard = self.orchestrator.begin_operation(deploy_ref).await;
        let rows = self.engine.execute(&query, params).await?;
        let results = serde_json::to_value(rows)
            .map_err(|e| XrpcError::Internal(e.to_string()))?;
        self.cache.put(&key, results.clone(), &version, self.cache_ttl);

        Ok(QueryOutcome {
            results,
            cached: false,
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }

    /// Execute a computed endpoint.
    pub async fn execute_query(
        &self,
        endpoint_name: &str,
        deploy_ref: &ResourceRef,
        params: &HashMap<String, String>,
    ) -> Result<QueryOutcome, XrpcError> {
        self.run_query(endpoint_name, deploy_ref, params, EndpointKind::Computed)
            .await
    }

    /// Execute a search endpoint. Search records carry a query with the
    /// search term bound through `$params`.
    pub async fn execute_search(
        &self,
        endpoint_name: &str,
        deploy_ref: &ResourceRef,
        params: &HashMap<String, String>,
    ) -> Result<QueryOutcome, XrpcError> {
        self.run_query(endpoint_name, deploy_ref, params, EndpointKind::SearchIndex)
            .await
    }

    /// Read the subscription definition behind an endpoint.
    pub async fn subscription_spec(
        &self,
        endpoint_name: &str,
        deploy_ref: &ResourceRef,
    ) -> Result<avaast_core::SubscriptionRecord, XrpcError> {
        let (body, _) = self
            .resource_body(endpoint_name, deploy_ref, EndpointKind::Subscription)
            .await?;
        serde_json::from_value(body).map_err(|e| {
            XrpcError::Internal(format!("{endpoint_name} subscription record malformed: {e}"))
        })
    }

    /// Execute a function endpoint through the sandboxed executor.
    pub async fn execute_function(
        &self,
        endpoint_name: &str,
        deploy_ref: &ResourceRef,
        body: &Value,
    ) -> Result<Value, XrpcError> {
        let (_, code_blob) = self
            .resource_body(endpoint_name, deploy_ref, EndpointKind::Function)
            .await?;
        let code = code_blob.ok_or_else(|| {
            XrpcError::Internal(format!("{endpoint_name} has no code blob"))
        })?;
        let _guard = self.orchestrator.begin_operation(deploy_ref).await;
        self.executor
            .execute(endpoint_name, &code, body, self.limits)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limits_clamp_into_range() {
        let limits = ExecLimits {
            timeout_ms: 50,
            memory_mb: 4096,
        }
        .clamped();
        assert_eq!(limits.timeout_ms, 100);
        assert_eq!(limits.memory_mb, 1024);

        let defaults = ExecLimits::default().clamped();
        assert_eq!(defaults.timeout_ms, 30_000);
        assert_eq!(defaults.memory_mb, 128);
    }

    #[tokio::test]
    async fn disabled_executor_surfaces_upstream_failure() {
        let executor = DisabledExecutor;
        let err = executor
            .execute("fn", b"code", &Value::Null, ExecLimits::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "UpstreamFailure");
    }
}
