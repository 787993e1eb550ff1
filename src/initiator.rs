//! First-time replica-set initiation, run through an in-container shell
//! rather than the driver: the first initiate has to happen before any
//! credential exists to authenticate a driver connection with.

use std::net::Ipv4Addr;

use async_trait::async_trait;
use bson::Document;
use node_probe::{Credentials, NodeProbe, NodeStatus};
use orchestrator_view::OrchestratorView;
use retry::{with_fixed_retry, FixedRetry};
use tracing::{error, info, warn};

use crate::applier::{ApplyError, ConfigApplier};

pub struct Initiator<'a> {
    pub view: &'a OrchestratorView,
    pub probe: &'a NodeProbe,
    pub service_name: String,
}

#[async_trait]
impl ConfigApplier for Initiator<'_> {
    /// `primary_ip` here is just the bootstrap target (§4.4 step 1);
    /// `force` is meaningless on this path and ignored.
    async fn apply(
        &self,
        _primary_ip: Ipv4Addr,
        config_doc: &Document,
        _credentials: &Credentials,
        _force: bool,
    ) -> Result<(), ApplyError> {
        let Some(container) = self.view.first_container_for_service(&self.service_name).await? else {
            return Err(ApplyError::NoContainer(self.service_name.clone()));
        };

        let init_command = format!("rs.initiate({config_doc});");
        let result = self
            .view
            .exec_shell(&container, &["mongosh", "--quiet", "--eval", &init_command])
            .await?;

        if result.succeeded() {
            info!(container = %container.id, "issued rs.initiate");
            return Ok(());
        }

        if result.output.contains("replSetInitiate requires authentication") {
            info!("replSetInitiate requires authentication; treating as an already-initialized set");
            return Err(ApplyError::RequiresAuthentication);
        }

        Err(ApplyError::ShellCommandFailed(format!(
            "rs.initiate exited {:?}: {}",
            result.exit_code,
            result.output.trim()
        )))
    }
}

impl Initiator<'_> {
    /// Wait for a primary to be elected after initiation, then create the
    /// root user inside its container. Exhausting the wait is non-fatal:
    /// the outer watch loop retries on the next tick.
    pub async fn wait_for_primary_and_create_root(
        &self,
        task_ips: &[Ipv4Addr],
        port: u16,
        root_username: &str,
        root_password: &str,
    ) -> Option<Ipv4Addr> {
        let policy = FixedRetry::initiation_primary_election();
        let primary = with_fixed_retry(policy, "wait_for_primary", || async {
            let result = self.probe.find_primary(task_ips, port).await;
            match result.primary {
                Some(ip) => Ok(ip),
                None => Err("no writable primary elected yet".to_string()),
            }
        })
        .await;

        let primary_ip = match primary {
            Ok(ip) => ip,
            Err(_) => {
                warn!("primary election did not complete within the configured wait; will retry next tick");
                return None;
            }
        };

        if let Err(err) = self.create_root_user(primary_ip, root_username, root_password).await {
            error!(%err, "failed to create root user on primary container");
        }
        Some(primary_ip)
    }

    async fn create_root_user(
        &self,
        primary_ip: Ipv4Addr,
        root_username: &str,
        root_password: &str,
    ) -> Result<(), ApplyError> {
        let Some(container) = self.view.first_container_for_service(&self.service_name).await? else {
            return Err(ApplyError::NoContainer(self.service_name.clone()));
        };
        let create_admin = format!(
            "admin = db.getSiblingDB('admin'); admin.createUser({{ user: '{root_username}', pwd: '{root_password}', roles: [ 'root' ] }});"
        );

        let policy = FixedRetry::admin_user_creation();
        let outcome = with_fixed_retry(policy, "create_root_user", || async {
            match self.view.exec_shell(&container, &["mongosh", "--quiet", "--eval", &create_admin]).await {
                Ok(result) if result.succeeded() => Ok(RootUserOutcome::Created),
                Ok(result) if result.output.contains("requires authentication") => {
                    Ok(RootUserOutcome::AlreadyExists)
                }
                Ok(result) => Err(format!(
                    "createUser exited {:?}: {}",
                    result.exit_code,
                    result.output.trim()
                )),
                Err(err) => Err(err.to_string()),
            }
        })
        .await
        .map_err(ApplyError::ShellCommandFailed)?;

        match outcome {
            RootUserOutcome::Created => info!(ip = %primary_ip, "root user created"),
            RootUserOutcome::AlreadyExists => {
                info!(ip = %primary_ip, "root user already exists, treating as success")
            }
        }
        Ok(())
    }
}

/// Result of a single `create_root_user` shell attempt, distinguishing a
/// fresh creation from the "already exists" sentinel so the retry loop
/// above can treat both as terminal success.
enum RootUserOutcome {
    Created,
    AlreadyExists,
}

/// `hello`-based check used by the reconciler's tie-break rule: are all
/// members of `T` reporting no set name at all?
pub async fn all_uninitialized(probe: &NodeProbe, ips: &[Ipv4Addr], port: u16) -> bool {
    if ips.is_empty() {
        return false;
    }
    let mut uninitialized = 0;
    for &ip in ips {
        if let Ok(NodeStatus::Uninitialized) = probe.hello(ip, port).await {
            uninitialized += 1;
        }
    }
    uninitialized == ips.len()
}
