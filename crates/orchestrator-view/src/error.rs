//! Error type for the orchestrator view.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("orchestrator API unavailable: {0}")]
    Unavailable(#[from] bollard::errors::Error),

    #[error("service '{0}' not found")]
    ServiceNotFound(String),
}
