//! avaast-core — shared domain types for the Avaast app-view host.
//!
//! Everything that crosses a crate boundary lives here: resource
//! references, record shapes for the `app.avaast.*` collections, the
//! query and expression ASTs, watcher events, and the `avaast.toml`
//! configuration parser.

pub mod config;
pub mod expr;
pub mod query;
pub mod types;

pub use config::AvaastConfig;
pub use expr::{
    ArithmeticOp, CaseBranch, ComparisonOp, Expression, LogicalOp,
};
pub use query::{Join, JoinKind, NullsOrder, OrderDirection, OrderKey, Query, SelectField, Source};
pub use types::{
    collections, AppViewRecord, ComputedRecord, DeployRecord, DeployedEndpoint, Dependency,
    EndpointKind, EventOp, RecordEnvelope, RecordEvent, ResourceKind, ResourceRef,
    SubscriptionRecord, TrafficRule,
};
