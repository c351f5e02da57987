//! Controller — routes watcher events to the subsystems.
//!
//! The single consumer of the watcher channel. Record bodies land in the
//! content-addressed record store, deploy records drive the orchestrator,
//! and appView records push endpoints and traffic rules to the gateway
//! through the admin channel. Fan-out to subscribers happens here too.

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use avaast_core::{
    collections, AppViewRecord, DeployRecord, EventOp, RecordEvent, ResourceKind, ResourceRef,
    SubscriptionRecord, TrafficRule,
};
use avaast_deploy::{DeployState, Orchestrator, RecordStore, StoredRecord, TransitionEvent};
use avaast_gateway::{AdminCommand, SubscriptionManager};

/// Wires watcher events and deploy transitions into the rest of the host.
pub struct Controller {
    records: RecordStore,
    orchestrator: Arc<Orchestrator>,
    subscriptions: Arc<SubscriptionManager>,
    admin_tx: mpsc::Sender<AdminCommand>,
    latest_rules: Mutex<Vec<TrafficRule>>,
    /// Deploy record key → ref, so deletes (which carry no content hash)
    /// can still retire the right deploy.
    deploy_refs: Mutex<std::collections::HashMap<String, ResourceRef>>,
}

impl Controller {
    pub fn new(
        records: RecordStore,
        orchestrator: Arc<Orchestrator>,
        subscriptions: Arc<SubscriptionManager>,
        admin_tx: mpsc::Sender<AdminCommand>,
    ) -> Self {
        Self {
            records,
            orchestrator,
            subscriptions,
            admin_tx,
            latest_rules: Mutex::new(Vec::new()),
            deploy_refs: Mutex::new(std::collections::HashMap::new()),
        }
    }

    /// Consume watcher events and deploy transitions until both channels
    /// close.
    pub async fn run(
        self: Arc<Self>,
        mut events: mpsc::Receiver<RecordEvent>,
        mut transitions: mpsc::UnboundedReceiver<TransitionEvent>,
    ) {
        info!("controller started");
        let mut transitions_open = true;
        loop {
            tokio::select! {
                event = events.recv() => {
                    match event {
                        Some(event) => self.handle_event(event).await,
                        None => break,
                    }
                }
                transition = transitions.recv(), if transitions_open => {
                    match transition {
                        Some(transition) => self.handle_transition(transition).await,
                        None => transitions_open = false,
                    }
                }
            }
        }
        info!("controller stopped");
    }

    /// Route one watcher event by collection.
    pub async fn handle_event(&self, event: RecordEvent) {
        debug!(
            op = event.op.as_str(),
            collection = %event.collection,
            record_key = %event.record_key,
            "watcher event"
        );

        match event.collection.as_str() {
            collections::COMPUTED => {
                self.store_resource(&event, ResourceKind::Computed);
            }
            collections::FUNCTION => {
                self.store_resource(&event, ResourceKind::Function);
            }
            collections::SEARCH_INDEX => {
                self.store_resource(&event, ResourceKind::SearchIndex);
            }
            collections::SUBSCRIPTION => {
                self.store_resource(&event, ResourceKind::Subscription);
                self.register_subscription(&event);
            }
            collections::DEPLOY => self.handle_deploy(&event).await,
            collections::APP_VIEW => self.handle_app_view(&event).await,
            _ => {}
        }

        // Subscribers watch raw collections too; every change with a
        // body fans out.
        if let Some(body) = &event.body {
            self.subscriptions.notify(&event.collection, body);
        }
    }

    fn store_resource(&self, event: &RecordEvent, kind: ResourceKind) {
        if event.op == EventOp::Delete {
            // Bodies are content-addressed; manifest retention decides
            // when they are released.
            return;
        }
        let (Some(hash), Some(body)) = (&event.content_hash, &event.body) else {
            warn!(
                collection = %event.collection,
                record_key = %event.record_key,
                "record event without hash or body, skipping"
            );
            return;
        };
        self.records.insert(StoredRecord {
            resource: ResourceRef::new(event.authority_id.clone(), hash.clone()),
            kind,
            record_key: event.record_key.clone(),
            body: body.clone(),
        });
    }

    fn register_subscription(&self, event: &RecordEvent) {
        if event.op == EventOp::Delete {
            self.subscriptions.unregister(&event.record_key);
            return;
        }
        let Some(body) = &event.body else {
            return;
        };
        match serde_json::from_value::<SubscriptionRecord>(body.clone()) {
            Ok(spec) => self.subscriptions.register(&event.record_key, spec),
            Err(e) => warn!(
                record_key = %event.record_key,
                error = %e,
                "subscription record malformed"
            ),
        }
    }

    async fn handle_deploy(&self, event: &RecordEvent) {
        if event.op == EventOp::Delete {
            let known = self.deploy_refs.lock().await.remove(&event.record_key);
            let Some(deploy_ref) = known else {
                warn!(record_key = %event.record_key, "delete for unknown deploy record");
                return;
            };
            if let Err(e) = self.orchestrator.retire_deploy(&deploy_ref).await {
                warn!(deploy = %deploy_ref, error = %e, "retire on delete failed");
            }
            return;
        }

        let Some(hash) = &event.content_hash else {
            warn!(record_key = %event.record_key, "deploy event without content hash");
            return;
        };
        let deploy_ref = ResourceRef::new(event.authority_id.clone(), hash.clone());
        self.deploy_refs
            .lock()
            .await
            .insert(event.record_key.clone(), deploy_ref.clone());

        let Some(body) = &event.body else {
            warn!(deploy = %deploy_ref, "deploy event without body");
            return;
        };
        let record: DeployRecord = match serde_json::from_value(body.clone()) {
            Ok(record) => record,
            Err(e) => {
                warn!(deploy = %deploy_ref, error = %e, "deploy record malformed");
                return;
            }
        };
        if let Err(e) = self.orchestrator.process_deploy(&deploy_ref, &record).await {
            warn!(deploy = %deploy_ref, error = %e, "deploy processing rejected");
        }
    }

    async fn handle_app_view(&self, event: &RecordEvent) {
        let Some(body) = &event.body else {
            return;
        };
        let record: AppViewRecord = match serde_json::from_value(body.clone()) {
            Ok(record) => record,
            Err(e) => {
                warn!(error = %e, "appView record malformed");
                return;
            }
        };

        let targets = self.orchestrator.process_app_view(&record);
        for target in &targets {
            if self.orchestrator.get_status(target).await.is_none() {
                warn!(deploy = %target, "traffic rule targets an unknown deploy");
            }
        }

        *self.latest_rules.lock().await = record.rules.clone();
        self.push_endpoints().await;
        self.push_rules().await;
    }

    /// On every transition to ACTIVE, re-push the live endpoint set and
    /// then the latest traffic rules.
    async fn handle_transition(&self, transition: TransitionEvent) {
        if transition.state != DeployState::Active {
            return;
        }
        info!(deploy = %transition.deploy, "deploy activated, pushing endpoints");
        self.push_endpoints().await;
        self.push_rules().await;
    }

    /// Replace the gateway's endpoint registry with the union of every
    /// ACTIVE manifest's endpoints.
    async fn push_endpoints(&self) {
        let active = self.orchestrator.get_active_deploys().await;
        let mut endpoints = Vec::new();
        for status in &active {
            if let Some(manifest) = &status.manifest {
                endpoints.extend(manifest.endpoints.iter().cloned());
            }
        }
        if self
            .admin_tx
            .send(AdminCommand::ReplaceEndpoints(endpoints))
            .await
            .is_err()
        {
            warn!("admin channel closed, endpoint push dropped");
        }
    }

    async fn push_rules(&self) {
        let rules = self.latest_rules.lock().await.clone();
        if rules.is_empty() {
            return;
        }
        if self
            .admin_tx
            .send(AdminCommand::ReplaceTraffic(rules))
            .await
            .is_err()
        {
            warn!("admin channel closed, traffic push dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use avaast_deploy::ManifestBuilder;
    use avaast_pds::{PdsClient, PdsResolver};
    use serde_json::json;

    const AUTHORITY: &str = "did:plc:alice";

    fn rref(hash: &str) -> ResourceRef {
        ResourceRef::new(AUTHORITY, hash)
    }

    fn harness() -> (
        Arc<Controller>,
        RecordStore,
        Arc<Orchestrator>,
        Arc<SubscriptionManager>,
        mpsc::Receiver<AdminCommand>,
    ) {
        let http = reqwest::Client::new();
        let client = PdsClient::new(http.clone(), PdsResolver::new(http))
            .with_base_url("http://127.0.0.1:1");
        let records = RecordStore::new();
        let builder = ManifestBuilder::new(records.clone(), client);
        let orchestrator = Arc::new(Orchestrator::new(builder, 2));
        let subscriptions = Arc::new(SubscriptionManager::new());
        let (admin_tx, admin_rx) = mpsc::channel(16);
        let controller = Arc::new(Controller::new(
            records.clone(),
            orchestrator.clone(),
            subscriptions.clone(),
            admin_tx,
        ));
        (controller, records, orchestrator, subscriptions, admin_rx)
    }

    fn event(
        op: EventOp,
        collection: &str,
        record_key: &str,
        hash: Option<&str>,
        body: Option<serde_json::Value>,
    ) -> RecordEvent {
        RecordEvent {
            op,
            collection: collection.to_string(),
            record_key: record_key.to_string(),
            authority_id: AUTHORITY.to_string(),
            content_hash: hash.map(|s| s.to_string()),
            body,
        }
    }

    #[tokio::test]
    async fn computed_record_lands_in_the_store() {
        let (controller, records, _, _, _) = harness();
        controller
            .handle_event(event(
                EventOp::Create,
                collections::COMPUTED,
                "r1",
                Some("h1"),
                Some(json!({"query": {}})),
            ))
            .await;
        let stored = records.get(&rref("h1")).unwrap();
        assert_eq!(stored.kind, ResourceKind::Computed);
        assert_eq!(stored.record_key, "r1");
    }

    #[tokio::test]
    async fn subscription_record_registers_by_record_key() {
        let (controller, _, _, subscriptions, _) = harness();
        controller
            .handle_event(event(
                EventOp::Create,
                collections::SUBSCRIPTION,
                "sub1",
                Some("h1"),
                Some(json!({"collection": "chat.pirate.avast"})),
            ))
            .await;
        assert_eq!(subscriptions.subscription_names(), vec!["sub1"]);

        controller
            .handle_event(event(
                EventOp::Delete,
                collections::SUBSCRIPTION,
                "sub1",
                None,
                None,
            ))
            .await;
        assert!(subscriptions.subscription_names().is_empty());
    }

    #[tokio::test]
    async fn deploy_event_drives_the_orchestrator() {
        let (controller, records, orchestrator, _, _) = harness();
        records.insert(StoredRecord {
            resource: rref("q1"),
            kind: ResourceKind::Computed,
            record_key: "rkey-q1".to_string(),
            body: json!({"query": {}}),
        });

        let deploy_body = json!({
            "endpoints": [{
                "name": "chat.pirate.getAvasts",
                "kind": "computed",
                "ref": {"authorityId": AUTHORITY, "contentHash": "q1"}
            }]
        });
        controller
            .handle_event(event(
                EventOp::Create,
                collections::DEPLOY,
                "d1",
                Some("deploy1"),
                Some(deploy_body),
            ))
            .await;

        let status = orchestrator.get_status(&rref("deploy1")).await.unwrap();
        assert_eq!(status.state, DeployState::Active);
    }

    #[tokio::test]
    async fn activation_pushes_endpoints_to_the_admin_channel() {
        let (controller, records, _, _, mut admin_rx) = harness();
        records.insert(StoredRecord {
            resource: rref("q1"),
            kind: ResourceKind::Computed,
            record_key: "rkey-q1".to_string(),
            body: json!({"query": {}}),
        });
        controller
            .handle_event(event(
                EventOp::Create,
                collections::DEPLOY,
                "d1",
                Some("deploy1"),
                Some(json!({
                    "endpoints": [{
                        "name": "chat.pirate.getAvasts",
                        "kind": "computed",
                        "ref": {"authorityId": AUTHORITY, "contentHash": "q1"}
                    }]
                })),
            ))
            .await;
        controller
            .handle_transition(TransitionEvent {
                deploy: rref("deploy1"),
                state: DeployState::Active,
                manifest: None,
            })
            .await;

        let command = admin_rx.recv().await.unwrap();
        match command {
            AdminCommand::ReplaceEndpoints(endpoints) => {
                assert_eq!(endpoints.len(), 1);
                assert_eq!(endpoints[0].name, "chat.pirate.getAvasts");
            }
            other => panic!("expected endpoint push, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn app_view_pushes_endpoints_then_rules() {
        let (controller, records, _, _, mut admin_rx) = harness();
        records.insert(StoredRecord {
            resource: rref("q1"),
            kind: ResourceKind::Computed,
            record_key: "rkey-q1".to_string(),
            body: json!({"query": {}}),
        });
        controller
            .handle_event(event(
                EventOp::Create,
                collections::DEPLOY,
                "d1",
                Some("deploy1"),
                Some(json!({
                    "endpoints": [{
                        "name": "ep",
                        "kind": "computed",
                        "ref": {"authorityId": AUTHORITY, "contentHash": "q1"}
                    }]
                })),
            ))
            .await;

        controller
            .handle_event(event(
                EventOp::Create,
                collections::APP_VIEW,
                "av1",
                Some("appview1"),
                Some(json!({
                    "rules": [{
                        "deploy": {"authorityId": AUTHORITY, "contentHash": "deploy1"},
                        "weightBP": 10000
                    }]
                })),
            ))
            .await;

        let first = admin_rx.recv().await.unwrap();
        assert!(matches!(first, AdminCommand::ReplaceEndpoints(_)));
        let second = admin_rx.recv().await.unwrap();
        match second {
            AdminCommand::ReplaceTraffic(rules) => {
                assert_eq!(rules.len(), 1);
                assert_eq!(rules[0].weight_bp, 10_000);
            }
            other => panic!("expected traffic push, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn record_changes_fan_out_to_subscribers() {
        let (controller, _, _, subscriptions, _) = harness();
        subscriptions.register(
            "onAvast",
            SubscriptionRecord {
                collection: "chat.pirate.avast".to_string(),
                filter: None,
                projection: Vec::new(),
            },
        );
        let (_, mut rx) = subscriptions
            .subscribe("onAvast", Default::default())
            .unwrap();

        controller
            .handle_event(event(
                EventOp::Create,
                "chat.pirate.avast",
                "r1",
                Some("h1"),
                Some(json!({"text": "yarr"})),
            ))
            .await;

        let frame = rx.recv().await.unwrap();
        assert_eq!(frame["data"]["text"], json!("yarr"));
    }

    #[tokio::test]
    async fn malformed_deploy_body_is_logged_not_fatal() {
        let (controller, _, orchestrator, _, _) = harness();
        controller
            .handle_event(event(
                EventOp::Create,
                collections::DEPLOY,
                "d1",
                Some("deploy1"),
                Some(json!({"endpoints": "not-an-array"})),
            ))
            .await;
        assert!(orchestrator.get_status(&rref("deploy1")).await.is_none());
    }
}
