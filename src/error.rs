//! The only error type that is allowed to escape a tick: everything else
//! is absorbed at the component boundary and turned into a log line (see
//! the error-handling design in the project's operational runbook).

use thiserror::Error;

#[derive(Error, Debug)]
pub enum FatalError {
    #[error("database service did not come fully up within the startup budget")]
    ServiceNeverUp,

    #[error("could not construct the orchestrator client: {0}")]
    OrchestratorUnreachable(#[from] bollard::errors::Error),
}
