//! avaast-deploy — dependency graphs, manifests, and the deploy
//! state machine.
//!
//! A deploy record names endpoints; this crate discovers the resource
//! graph behind them, materializes an immutable manifest, and arbitrates
//! which deploy versions are active at any moment.

pub mod error;
pub mod graph;
pub mod manifest;
pub mod orchestrator;
pub mod store;

pub use error::{DeployError, DeployResult};
pub use graph::{DependencyGraph, GraphNode};
pub use manifest::{DeployManifest, ManifestBuilder, ResolvedResource};
pub use orchestrator::{
    DeployState, DeployStatus, OperationGuard, Orchestrator, TransitionEvent, DEFAULT_MAX_ACTIVE,
};
pub use store::{RecordStore, StoredRecord};
