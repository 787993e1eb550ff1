//! Probes individual replica-set members with unauthenticated `hello` and
//! authenticated `replSetGetConfig` calls, classifying every response into a
//! [`NodeStatus`] instead of branching on driver exceptions.

mod error;
mod status;

pub use error::ProbeError;
pub use status::{Credentials, NodeStatus};

use std::net::Ipv4Addr;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::Duration;

use bson::doc;
use lru::LruCache;
use mongodb::error::ErrorKind;
use mongodb::options::{ClientOptions, Credential, ServerAddress};
use mongodb::Client;
use tracing::debug;

const HELLO_SERVER_SELECTION_TIMEOUT: Duration = Duration::from_secs(9);
const HELLO_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const HELLO_SOCKET_TIMEOUT: Duration = Duration::from_secs(15);

const CONFIG_SERVER_SELECTION_TIMEOUT: Duration = Duration::from_secs(15);
const CONFIG_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const CONFIG_SOCKET_TIMEOUT: Duration = Duration::from_secs(30);

const NOT_YET_INITIALIZED_CODE: i32 = 94;

/// Duplicate-auth-warning suppression is a UX concern, not a correctness
/// one, and a bounded LRU keeps it from growing across a long-running
/// watch loop.
const AUTH_WARNED_CAPACITY: usize = 64;

/// Sends `hello` and `replSetGetConfig` to individual members.
///
/// Node probing is stateless except for one piece of UX bookkeeping: which
/// ips we've already logged an "auth not ready" debug line for, so repeated
/// ticks during a long AuthNotReady window don't spam the log.
pub struct NodeProbe {
    auth_warned: Mutex<LruCache<Ipv4Addr, ()>>,
}

impl Default for NodeProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeProbe {
    pub fn new() -> Self {
        Self {
            auth_warned: Mutex::new(LruCache::new(
                NonZeroUsize::new(AUTH_WARNED_CAPACITY).unwrap(),
            )),
        }
    }

    fn warn_auth_once(&self, ip: Ipv4Addr) -> bool {
        let mut warned = self.auth_warned.lock().expect("auth_warned lock poisoned");
        if warned.contains(&ip) {
            false
        } else {
            warned.put(ip, ());
            true
        }
    }

    /// Unauthenticated `hello`. Must always use a direct connection.
    pub async fn hello(&self, ip: Ipv4Addr, port: u16) -> Result<NodeStatus, ProbeError> {
        let options = direct_options(
            ip,
            port,
            HELLO_SERVER_SELECTION_TIMEOUT,
            HELLO_CONNECT_TIMEOUT,
            HELLO_SOCKET_TIMEOUT,
            None,
        );
        let client = Client::with_options(options)?;
        match client.database("admin").run_command(doc! { "hello": 1 }).await {
            Ok(reply) => Ok(classify_hello(&reply)),
            Err(err) => {
                let status = classify_connection_error(&err);
                if matches!(status, NodeStatus::AuthNotReady) && self.warn_auth_once(ip) {
                    debug!(%ip, "auth not ready (expected during fresh deployment)");
                }
                Ok(status)
            }
        }
    }

    /// Authenticated `replSetGetConfig`.
    pub async fn get_config(
        &self,
        ip: Ipv4Addr,
        port: u16,
        credentials: &Credentials,
    ) -> Result<NodeStatus, ProbeError> {
        let options = direct_options(
            ip,
            port,
            CONFIG_SERVER_SELECTION_TIMEOUT,
            CONFIG_CONNECT_TIMEOUT,
            CONFIG_SOCKET_TIMEOUT,
            Some(credentials),
        );
        let client = Client::with_options(options)?;
        match client
            .database("admin")
            .run_command(doc! { "replSetGetConfig": 1 })
            .await
        {
            Ok(reply) => {
                let config_doc = reply
                    .get_document("config")
                    .map_err(|_| ProbeError::Config(replicaset_config::ConfigError::MissingField("config")))?;
                let config = replicaset_config::parse_config(config_doc)?;
                Ok(NodeStatus::Configured {
                    config,
                    raw: config_doc.clone(),
                })
            }
            Err(err) => {
                if let ErrorKind::Command(cmd) = err.kind.as_ref() {
                    if cmd.code == NOT_YET_INITIALIZED_CODE {
                        return Ok(NodeStatus::NotYetInitialized);
                    }
                }
                if is_auth_error(&err) {
                    debug!(%ip, "auth not ready (expected during fresh deployment)");
                    return Ok(NodeStatus::AuthNotReady);
                }
                Ok(NodeStatus::Unreachable)
            }
        }
    }

    /// Probe each ip in order with unauthenticated `hello`, returning the
    /// first writable primary and the count of ips reporting no set name.
    pub async fn find_primary(&self, ips: &[Ipv4Addr], port: u16) -> PrimaryProbe {
        let mut uninitialized_count = 0;
        for &ip in ips {
            match self.hello(ip, port).await {
                Ok(NodeStatus::Member {
                    is_writable_primary,
                    ..
                }) if is_writable_primary => {
                    return PrimaryProbe {
                        primary: Some(ip),
                        uninitialized_count,
                    };
                }
                Ok(NodeStatus::Uninitialized) => uninitialized_count += 1,
                Ok(_) => {}
                Err(err) => debug!(%ip, %err, "hello probe failed while searching for primary"),
            }
        }
        PrimaryProbe {
            primary: None,
            uninitialized_count,
        }
    }
}

/// Result of [`NodeProbe::find_primary`].
pub struct PrimaryProbe {
    pub primary: Option<Ipv4Addr>,
    pub uninitialized_count: usize,
}

/// Builds `ClientOptions` for a direct connection to a single member,
/// optionally authenticated. Shared with [`crate`]'s sibling call sites in
/// the root crate (the reconfigurer and user-bootstrap paths) so every
/// direct connection in the system is built the same way.
pub fn direct_options(
    ip: Ipv4Addr,
    port: u16,
    server_selection_timeout: Duration,
    connect_timeout: Duration,
    socket_timeout: Duration,
    credentials: Option<&Credentials>,
) -> ClientOptions {
    let mut options = ClientOptions::default();
    options.hosts = vec![ServerAddress::Tcp {
        host: ip.to_string(),
        port: Some(port),
    }];
    // A direct connection is load-bearing: with topology discovery the
    // driver reports every reachable member as a writable primary until
    // the cluster's view converges.
    options.direct_connection = Some(true);
    options.server_selection_timeout = Some(server_selection_timeout);
    options.connect_timeout = Some(connect_timeout);
    options.socket_timeout = Some(socket_timeout);
    if let Some(creds) = credentials {
        options.credential = Some(
            Credential::builder()
                .username(creds.username.clone())
                .password(creds.password.clone())
                .source("admin".to_string())
                .build(),
        );
    }
    options
}

fn classify_hello(reply: &bson::Document) -> NodeStatus {
    match reply.get_str("setName") {
        Ok(set_name) => NodeStatus::Member {
            set_name: set_name.to_string(),
            is_writable_primary: reply
                .get_bool("isWritablePrimary")
                .unwrap_or(false),
            primary_host: reply.get_str("primary").ok().map(str::to_string),
        },
        Err(_) => NodeStatus::Uninitialized,
    }
}

fn classify_connection_error(err: &mongodb::error::Error) -> NodeStatus {
    if is_auth_error(err) {
        return NodeStatus::AuthNotReady;
    }
    NodeStatus::Unreachable
}

fn is_auth_error(err: &mongodb::error::Error) -> bool {
    match err.kind.as_ref() {
        ErrorKind::Authentication { .. } => true,
        ErrorKind::Command(cmd) => {
            cmd.code_name == "Unauthorized" || cmd.message.contains("requires authentication")
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_hello_reports_uninitialized_when_no_set_name() {
        let reply = doc! { "isWritablePrimary": true };
        assert!(matches!(classify_hello(&reply), NodeStatus::Uninitialized));
    }

    #[test]
    fn classify_hello_reports_member_with_primary_flag() {
        let reply = doc! {
            "setName": "rs0",
            "isWritablePrimary": true,
            "primary": "10.0.0.5:27017",
        };
        match classify_hello(&reply) {
            NodeStatus::Member {
                set_name,
                is_writable_primary,
                primary_host,
            } => {
                assert_eq!(set_name, "rs0");
                assert!(is_writable_primary);
                assert_eq!(primary_host.as_deref(), Some("10.0.0.5:27017"));
            }
            other => panic!("expected Member, got {other:?}"),
        }
    }

    #[test]
    fn classify_hello_secondary_is_not_writable() {
        let reply = doc! { "setName": "rs0", "isWritablePrimary": false };
        match classify_hello(&reply) {
            NodeStatus::Member {
                is_writable_primary,
                ..
            } => assert!(!is_writable_primary),
            other => panic!("expected Member, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn warn_auth_once_suppresses_repeat_warnings() {
        let probe = NodeProbe::new();
        let ip: Ipv4Addr = "10.0.0.5".parse().unwrap();
        assert!(probe.warn_auth_once(ip));
        assert!(!probe.warn_auth_once(ip));
    }
}
