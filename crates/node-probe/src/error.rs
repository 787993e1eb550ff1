//! Error types for node probing.

use thiserror::Error;

/// Errors that escape probe classification.
///
/// [`crate::NodeStatus`] already absorbs the transient outcomes the
/// reconciler needs to branch on (unreachable, not-yet-initialized,
/// auth-not-ready). What's left here is genuinely unexpected: a config
/// document that doesn't parse, or an argument we can't turn into driver
/// options.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("building client options: {0}")]
    Options(#[from] mongodb::error::Error),

    #[error("parsing replica-set config: {0}")]
    Config(#[from] replicaset_config::ConfigError),
}
