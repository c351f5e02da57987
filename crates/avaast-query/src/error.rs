//! Query stack error types.

use thiserror::Error;

pub type QueryResult<T> = Result<T, QueryError>;

#[derive(Debug, Error)]
pub enum QueryError {
    /// The expression cannot be evaluated on this engine path, e.g. a
    /// user-code call inside synchronous evaluation.
    #[error("unsupported expression: {0}")]
    UnsupportedExpression(String),

    #[error("evaluation error: {0}")]
    Eval(String),

    /// A data source failed to produce rows.
    #[error("source error: {0}")]
    Source(String),

    /// The embedded database failed underneath a history source.
    #[error("storage error: {0}")]
    Storage(String),
}
