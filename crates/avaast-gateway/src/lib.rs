//! avaast-gateway — the XRPC serving surface.
//!
//! Routes client calls to deployed endpoints: the traffic shaper picks a
//! deploy version (weighted, sticky per caller identity), the dynamic
//! router resolves the endpoint kind, and the execution service runs it
//! against the query engine, the subscription fan-out, or the user-code
//! executor.

pub mod auth;
pub mod error;
pub mod exec;
pub mod http;
pub mod router;
pub mod shaper;
pub mod subscription;

pub use error::XrpcError;
pub use exec::{
    DisabledExecutor, ExecLimits, ExecutionService, FunctionExecutor, QueryOutcome,
    DEFAULT_CACHE_TTL,
};
pub use http::{build_router, spawn_admin_loop, AdminCommand, GatewayState};
pub use router::DynamicRouter;
pub use shaper::{sticky_hash, TrafficShaper, TOTAL_BP};
pub use subscription::SubscriptionManager;
