//! Deploy pipeline error types.

use thiserror::Error;

pub type DeployResult<T> = Result<T, DeployError>;

/// Errors surfaced while building or driving deploys.
#[derive(Debug, Error)]
pub enum DeployError {
    /// Manifest validation failed; all reasons joined.
    #[error("deploy validation failed: {0}")]
    Validation(String),

    /// A concurrent `process_deploy` for the same ref is running.
    #[error("deploy already in progress: {0}")]
    InProgress(String),

    /// The deploy is in a terminal state and cannot be reprocessed.
    #[error("deploy is terminal: {0}")]
    Terminal(String),

    #[error("unknown deploy: {0}")]
    UnknownDeploy(String),

    #[error("record body malformed: {0}")]
    RecordParse(String),

    #[error(transparent)]
    Pds(#[from] avaast_pds::PdsError),
}
