//! Deploy orchestrator — drives the per-deploy state machine.
//!
//! ```text
//! PENDING → FETCHING → RESOLVING → BUILDING → ACTIVATING → ACTIVE → DRAINING → RETIRED
//!           any state ──────────────────────────────────────────────→ FAILED
//! ```
//!
//! Transitions for one deploy ref are strictly serial; a concurrent
//! `process_deploy` for the same ref is rejected. At most `max_active`
//! deploys are ACTIVE at once — activating past the limit forces the
//! oldest-activated deploy into DRAINING. Every transition is published
//! on the transition channel.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{info, warn};

use avaast_core::{AppViewRecord, DeployRecord, ResourceRef};

use crate::error::{DeployError, DeployResult};
use crate::manifest::{DeployManifest, ManifestBuilder};

pub const DEFAULT_MAX_ACTIVE: usize = 2;
const DRAIN_POLL: Duration = Duration::from_millis(10);

/// Lifecycle state of a deploy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DeployState {
    Pending,
    Fetching,
    Resolving,
    Building,
    Activating,
    Active,
    Draining,
    Retired,
    Failed,
}

impl DeployState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, DeployState::Retired | DeployState::Failed)
    }
}

/// Current status of one deploy.
#[derive(Debug, Clone)]
pub struct DeployStatus {
    pub resource: ResourceRef,
    pub state: DeployState,
    pub manifest: Option<Arc<DeployManifest>>,
    pub error: Option<String>,
    pub activated_at: Option<DateTime<Utc>>,
    pub retired_at: Option<DateTime<Utc>>,
}

impl DeployStatus {
    fn new(resource: ResourceRef) -> Self {
        Self {
            resource,
            state: DeployState::Pending,
            manifest: None,
            error: None,
            activated_at: None,
            retired_at: None,
        }
    }
}

/// Published on every state transition.
#[derive(Debug, Clone)]
pub struct TransitionEvent {
    pub deploy: ResourceRef,
    pub state: DeployState,
    pub manifest: Option<Arc<DeployManifest>>,
}

/// Guard counting one in-flight operation against a deploy. Dropping it
/// releases the slot; draining waits for all guards to release.
pub struct OperationGuard {
    counter: Arc<AtomicUsize>,
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

/// The deploy orchestrator.
pub struct Orchestrator {
    builder: ManifestBuilder,
    statuses: Arc<RwLock<HashMap<String, DeployStatus>>>,
    in_flight: Arc<Mutex<HashSet<String>>>,
    op_counters: Arc<RwLock<HashMap<String, Arc<AtomicUsize>>>>,
    max_active: usize,
    drain_timeout: Duration,
    transitions: Option<mpsc::UnboundedSender<TransitionEvent>>,
}

impl Orchestrator {
    pub fn new(builder: ManifestBuilder, max_active: usize) -> Self {
        Self {
            builder,
            statuses: Arc::new(RwLock::new(HashMap::new())),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            op_counters: Arc::new(RwLock::new(HashMap::new())),
            max_active: max_active.max(1),
            drain_timeout: Duration::from_secs(5),
            transitions: None,
        }
    }

    /// Publish transition events to the given channel.
    pub fn with_transitions(mut self, tx: mpsc::UnboundedSender<TransitionEvent>) -> Self {
        self.transitions = Some(tx);
        self
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    async fn set_state(
        &self,
        deploy_ref: &ResourceRef,
        state: DeployState,
        manifest: Option<Arc<DeployManifest>>,
        error: Option<String>,
    ) {
        let key = deploy_ref.key();
        {
            let mut statuses = self.statuses.write().await;
            let status = statuses
                .entry(key)
                .or_insert_with(|| DeployStatus::new(deploy_ref.clone()));
            status.state = state;
            if manifest.is_some() {
                status.manifest = manifest.clone();
            }
            if error.is_some() {
                status.error = error;
            }
            match state {
                DeployState::Active => status.activated_at = Some(Utc::now()),
                DeployState::Retired => status.retired_at = Some(Utc::now()),
                _ => {}
            }
        }
        info!(deploy = %deploy_ref, ?state, "deploy transition");
        if let Some(tx) = &self.transitions {
            let _ = tx.send(TransitionEvent {
                deploy: deploy_ref.clone(),
                state,
                manifest,
            });
        }
    }

    /// Process one deploy record through the state machine. Build and
    /// validation failures land in FAILED (not returned); only ordering
    /// violations (concurrent or terminal refs) error out.
    pub async fn process_deploy(
        &self,
        deploy_ref: &ResourceRef,
        record: &DeployRecord,
    ) -> DeployResult<()> {
        let key = deploy_ref.key();
        {
            let mut in_flight = self.in_flight.lock().await;
            if !in_flight.insert(key.clone()) {
                return Err(DeployError::InProgress(key));
            }
        }
        let result = self.run_state_machine(deploy_ref, record).await;
        self.in_flight.lock().await.remove(&key);
        result
    }

    async fn run_state_machine(
        &self,
        deploy_ref: &ResourceRef,
        record: &DeployRecord,
    ) -> DeployResult<()> {
        let key = deploy_ref.key();
        {
            let statuses = self.statuses.read().await;
            if let Some(existing) = statuses.get(&key) {
                if existing.state.is_terminal() {
                    return Err(DeployError::Terminal(key));
                }
            }
        }

        self.set_state(deploy_ref, DeployState::Pending, None, None).await;

        self.set_state(deploy_ref, DeployState::Fetching, None, None).await;
        if let Err(e) = self.builder.fetch_records(record).await {
            return self.fail(deploy_ref, e).await;
        }

        self.set_state(deploy_ref, DeployState::Resolving, None, None).await;
        let graph = match self.builder.build_graph(record) {
            Ok(graph) => graph,
            Err(e) => return self.fail(deploy_ref, e).await,
        };

        self.set_state(deploy_ref, DeployState::Building, None, None).await;
        let manifest = match self.builder.resolve(deploy_ref, record, &graph).await {
            Ok(manifest) => Arc::new(manifest),
            Err(e) => return self.fail(deploy_ref, e).await,
        };

        self.set_state(
            deploy_ref,
            DeployState::Activating,
            Some(manifest.clone()),
            None,
        )
        .await;

        // Enforce the active-deploy limit before flipping to ACTIVE.
        if let Some(oldest) = self.oldest_active_at_capacity().await {
            warn!(
                displaced = %oldest,
                activating = %deploy_ref,
                "active limit reached, draining oldest deploy"
            );
            self.set_state(&oldest, DeployState::Draining, None, None).await;
        }

        self.op_counters
            .write()
            .await
            .entry(key)
            .or_insert_with(|| Arc::new(AtomicUsize::new(0)));
        self.set_state(deploy_ref, DeployState::Active, Some(manifest), None)
            .await;
        Ok(())
    }

    async fn fail(&self, deploy_ref: &ResourceRef, error: DeployError) -> DeployResult<()> {
        warn!(deploy = %deploy_ref, error = %error, "deploy failed");
        self.set_state(deploy_ref, DeployState::Failed, None, Some(error.to_string()))
            .await;
        Ok(())
    }

    /// The oldest-activated ACTIVE deploy if the limit is already met.
    async fn oldest_active_at_capacity(&self) -> Option<ResourceRef> {
        let statuses = self.statuses.read().await;
        let mut active: Vec<&DeployStatus> = statuses
            .values()
            .filter(|s| s.state == DeployState::Active)
            .collect();
        if active.len() < self.max_active {
            return None;
        }
        active.sort_by_key(|s| s.activated_at);
        active.first().map(|s| s.resource.clone())
    }

    /// Move a deploy ACTIVE → DRAINING → RETIRED, waiting for in-flight
    /// operations to finish between the two steps.
    pub async fn retire_deploy(&self, deploy_ref: &ResourceRef) -> DeployResult<()> {
        let key = deploy_ref.key();
        let state = {
            let statuses = self.statuses.read().await;
            statuses
                .get(&key)
                .map(|s| s.state)
                .ok_or_else(|| DeployError::UnknownDeploy(key.clone()))?
        };
        match state {
            DeployState::Active => {
                self.set_state(deploy_ref, DeployState::Draining, None, None).await;
            }
            DeployState::Draining => {}
            other => {
                return Err(DeployError::Terminal(format!("{key} is {other:?}")));
            }
        }

        self.wait_for_drain(&key).await;
        self.set_state(deploy_ref, DeployState::Retired, None, None).await;
        self.release_records(&key).await;
        Ok(())
    }

    async fn wait_for_drain(&self, key: &str) {
        let counter = {
            let counters = self.op_counters.read().await;
            counters.get(key).cloned()
        };
        let Some(counter) = counter else {
            return;
        };
        let deadline = tokio::time::Instant::now() + self.drain_timeout;
        while counter.load(Ordering::SeqCst) > 0 {
            if tokio::time::Instant::now() >= deadline {
                warn!(deploy = key, "drain timed out with operations in flight");
                break;
            }
            tokio::time::sleep(DRAIN_POLL).await;
        }
    }

    /// Drop record bodies only the retired manifest referenced.
    async fn release_records(&self, retired_key: &str) {
        let statuses = self.statuses.read().await;
        let Some(retired) = statuses.get(retired_key) else {
            return;
        };
        let Some(manifest) = &retired.manifest else {
            return;
        };
        let retiring = manifest.ref_keys();
        let mut still_live: HashSet<String> = HashSet::new();
        for status in statuses.values() {
            if status.state != DeployState::Retired {
                if let Some(m) = &status.manifest {
                    still_live.extend(m.ref_keys());
                }
            }
        }
        self.builder.record_store().release(&retiring, &still_live);
    }

    /// Count one in-flight operation against a deploy. Returns `None`
    /// for deploys that never activated.
    pub async fn begin_operation(&self, deploy_ref: &ResourceRef) -> Option<OperationGuard> {
        let counters = self.op_counters.read().await;
        let counter = counters.get(&deploy_ref.key())?.clone();
        counter.fetch_add(1, Ordering::SeqCst);
        Some(OperationGuard { counter })
    }

    /// Project an appView record to the deploy refs it routes to.
    pub fn process_app_view(&self, record: &AppViewRecord) -> Vec<ResourceRef> {
        record.rules.iter().map(|r| r.deploy.clone()).collect()
    }

    pub async fn get_status(&self, deploy_ref: &ResourceRef) -> Option<DeployStatus> {
        let statuses = self.statuses.read().await;
        statuses.get(&deploy_ref.key()).cloned()
    }

    /// All ACTIVE deploys, oldest activation first.
    pub async fn get_active_deploys(&self) -> Vec<DeployStatus> {
        let statuses = self.statuses.read().await;
        let mut active: Vec<DeployStatus> = statuses
            .values()
            .filter(|s| s.state == DeployState::Active)
            .cloned()
            .collect();
        active.sort_by_key(|s| s.activated_at);
        active
    }

    pub async fn all_statuses(&self) -> Vec<DeployStatus> {
        let statuses = self.statuses.read().await;
        statuses.values().cloned().collect()
    }
}
