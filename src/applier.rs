//! The `ConfigApplier` capability: two ways to push a replica-set
//! configuration into the database, chosen by which phase the reconciler
//! is in rather than by any property of the config itself.
//!
//! The shell path is load-bearing for first initiate: no credential
//! exists yet to authenticate a driver connection with. Everything after
//! that first initiate goes through the driver.

use std::net::Ipv4Addr;

use async_trait::async_trait;
use bson::Document;
use node_probe::Credentials;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ApplyError {
    #[error("orchestrator call failed: {0}")]
    Orchestrator(#[from] orchestrator_view::OrchestratorError),

    #[error("database call failed: {0}")]
    Database(#[from] mongodb::error::Error),

    #[error("replica-set config error: {0}")]
    Config(#[from] replicaset_config::ConfigError),

    #[error("no local container found matching service name '{0}'")]
    NoContainer(String),

    /// The shell path's `rs.initiate` failed because the set already has
    /// authentication enabled. Not a failure: a signal that this is
    /// really a redeployment and belongs to the reconfigure path instead.
    #[error("replSetInitiate requires authentication (set already exists)")]
    RequiresAuthentication,

    /// An in-container shell command exited non-zero for a reason other
    /// than the auth-required sentinel above.
    #[error("in-container shell command failed: {0}")]
    ShellCommandFailed(String),
}

/// Pushes a replica-set configuration document into the database.
///
/// The document is built by the reconciler beforehand: a fresh one from
/// [`replicaset_config::to_document`] for a first initiate, or a mutated
/// one from [`replicaset_config::mutate_document`] for a reconfigure, so
/// both implementations operate on exactly the same shape.
#[async_trait]
pub trait ConfigApplier {
    async fn apply(
        &self,
        primary_ip: Ipv4Addr,
        config_doc: &Document,
        credentials: &Credentials,
        force: bool,
    ) -> Result<(), ApplyError>;
}
