//! avaast-query — declarative queries over PDS records.
//!
//! Compiles the query AST into a linear pipeline (scans, joins, filter,
//! group, aggregate, order, limit) and executes it over an in-memory row
//! model fed by pluggable data sources. Results flow through a TTL +
//! version-scoped cache.

pub mod cache;
pub mod engine;
pub mod error;
pub mod eval;
pub mod planner;
pub mod source;
pub mod value;

pub use cache::{QueryCache, DEFAULT_CAPACITY};
pub use engine::QueryEngine;
pub use error::{QueryError, QueryResult};
pub use eval::{evaluate, EvalContext};
pub use planner::{plan, PipelineStep, Plan};
pub use source::{DataSource, RoutingDataSource, StaticDataSource};
pub use value::{canonical, canonical_row, is_truthy, Row};
