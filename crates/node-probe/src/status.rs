//! The tagged outcome of probing a single replica-set member.

use replicaset_config::ReplicaSetConfig;

/// Root credentials used for authenticated probes and applier calls.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// The outcome of probing one member, replacing the source's exception-driven
/// dispatch (catching `ServerSelectionTimeoutError`, `OperationFailure` with
/// code 94, and bare auth failures) with an exhaustively-matched variant.
#[derive(Debug, Clone)]
pub enum NodeStatus {
    /// Network/timeout reaching the node at all.
    Unreachable,
    /// `hello` succeeded but the node reports no set name yet.
    Uninitialized,
    /// Authenticated config read failed with error code 94.
    NotYetInitialized,
    /// Authenticated call failed on authentication, but unauthenticated
    /// `hello` succeeds: the window between a fresh deployment and root
    /// user creation.
    AuthNotReady,
    /// `hello` reports a set name.
    Member {
        set_name: String,
        is_writable_primary: bool,
        primary_host: Option<String>,
    },
    /// Authenticated config read succeeded. `raw` is the exact document
    /// `replSetGetConfig` returned, kept alongside the parsed model so a
    /// later mutation can preserve fields this crate doesn't model (such
    /// as `term` and `settings`).
    Configured {
        config: ReplicaSetConfig,
        raw: bson::Document,
    },
}
