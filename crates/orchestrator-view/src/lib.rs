//! Read-only view over a Docker Swarm service's tasks and the cluster's
//! node availability, plus the one write-shaped capability the reconciler
//! needs before any database credentials exist: running a shell command
//! inside a container.

mod error;

pub use error::OrchestratorError;

use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;

use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::query_parameters::{
    ListContainersOptionsBuilder, ListNodesOptionsBuilder, ListServicesOptionsBuilder,
    ListTasksOptionsBuilder,
};
use bollard::Docker;
use futures::StreamExt;
use retry::{with_exponential_backoff, ExponentialBackoff};
use tracing::debug;

/// The overlay-network address of one running task, recomputed fresh on
/// every tick, since the replica set's identity is ip-based and nothing
/// here is cached across calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskAddress {
    pub task_id: String,
    pub node_id: String,
    pub container_name_stem: String,
    pub ipv4: Ipv4Addr,
}

/// A local container, addressed the only stable way across restarts: its
/// id, resolved once by name-stem matching and then used for `exec` calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerHandle {
    pub id: String,
}

/// The outcome of an in-container shell command: its combined
/// stdout/stderr plus the exec's exit code, so a caller can tell a crashed
/// `mongosh` invocation from one that ran and printed an error string.
/// `exit_code` is `None` only if the daemon never reports one, which the
/// docker API treats as still-running and which this controller treats as
/// failure (`succeeded()` requires `Some(0)`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    pub output: String,
    pub exit_code: Option<i64>,
}

impl ExecOutput {
    pub fn succeeded(&self) -> bool {
        self.exit_code == Some(0)
    }
}

pub struct OrchestratorView {
    docker: Docker,
}

impl OrchestratorView {
    pub fn new(docker: Docker) -> Self {
        Self { docker }
    }

    /// TaskAddresses for tasks whose desired and actual state are both
    /// "running", restricted to the named overlay network. CIDR suffixes
    /// are stripped from the address.
    pub async fn list_task_addresses(
        &self,
        service_name: &str,
        overlay_name: &str,
    ) -> Result<Vec<TaskAddress>, OrchestratorError> {
        let service_name = service_name.to_string();
        let tasks = with_exponential_backoff(
            ExponentialBackoff::orchestrator_api(),
            "list_tasks",
            || async {
                let mut filters: HashMap<String, Vec<String>> = HashMap::new();
                filters.insert("service".to_string(), vec![service_name.clone()]);
                filters.insert("desired-state".to_string(), vec!["running".to_string()]);
                let opts = ListTasksOptionsBuilder::default().filters(&filters).build();
                self.docker.list_tasks(Some(opts)).await
            },
        )
        .await
        .map_err(OrchestratorError::Unavailable)?;

        let mut addresses = Vec::new();
        for task in tasks {
            let actual_running = task
                .status
                .as_ref()
                .and_then(|s| s.state.as_ref())
                .map(|s| matches!(s, bollard::models::TaskState::RUNNING))
                .unwrap_or(false);
            if !actual_running {
                continue;
            }
            let task_id = task.id.clone().unwrap_or_default();
            let node_id = task.node_id.clone().unwrap_or_default();
            // The stem a Swarm-assigned container name carries is always
            // the service name (the segment before the first `.`), not a
            // per-task value — `ContainerSpec.hostname` is an unrelated,
            // optional custom-hostname override. This must match exactly
            // what `first_container_for_service` matches against below.
            let container_name_stem = service_name.clone();

            let Some(attachments) = task.network_attachments.as_ref() else {
                continue;
            };
            for attachment in attachments {
                let net_name = attachment
                    .network
                    .as_ref()
                    .and_then(|n| n.spec.as_ref())
                    .and_then(|s| s.name.clone());
                if net_name.as_deref() != Some(overlay_name) {
                    continue;
                }
                let Some(addrs) = attachment.addresses.as_ref() else {
                    continue;
                };
                for addr in addrs {
                    let ip_only = addr.split('/').next().unwrap_or(addr);
                    if let Ok(ipv4) = ip_only.parse::<Ipv4Addr>() {
                        addresses.push(TaskAddress {
                            task_id: task_id.clone(),
                            node_id: node_id.clone(),
                            container_name_stem: container_name_stem.clone(),
                            ipv4,
                        });
                    }
                }
            }
        }
        Ok(addresses)
    }

    /// True iff the count of running tasks equals the expected replica
    /// count for the service's deployment mode.
    pub async fn is_service_fully_up(&self, service_name: &str) -> Result<bool, OrchestratorError> {
        let mut filters: HashMap<String, Vec<String>> = HashMap::new();
        filters.insert("name".to_string(), vec![service_name.to_string()]);
        let opts = ListServicesOptionsBuilder::default().filters(&filters).build();
        let services = self
            .docker
            .list_services(Some(opts))
            .await
            .map_err(OrchestratorError::Unavailable)?;
        let service = services
            .into_iter()
            .find(|s| s.spec.as_ref().and_then(|sp| sp.name.clone()).as_deref() == Some(service_name))
            .ok_or_else(|| OrchestratorError::ServiceNotFound(service_name.to_string()))?;

        let running_tasks_count = self.running_task_count(service_name).await?;
        let assigned_nodes = self.assigned_nodes(service_name).await?;

        let mode = service
            .spec
            .as_ref()
            .and_then(|s| s.mode.as_ref())
            .ok_or_else(|| OrchestratorError::ServiceNotFound(service_name.to_string()))?;

        let expected_replicas = if let Some(replicated) = mode.replicated.as_ref() {
            replicated.replicas.unwrap_or(0) as usize
        } else if mode.global.is_some() {
            let active_nodes = self.active_node_ids().await?;
            assigned_nodes.intersection(&active_nodes).count()
        } else {
            return Ok(false);
        };

        debug!(
            service_name,
            expected_replicas, running_tasks_count, "service readiness check"
        );
        Ok(running_tasks_count == expected_replicas)
    }

    async fn running_task_count(&self, service_name: &str) -> Result<usize, OrchestratorError> {
        let mut filters: HashMap<String, Vec<String>> = HashMap::new();
        filters.insert("service".to_string(), vec![service_name.to_string()]);
        filters.insert("desired-state".to_string(), vec!["running".to_string()]);
        let opts = ListTasksOptionsBuilder::default().filters(&filters).build();
        let tasks = self
            .docker
            .list_tasks(Some(opts))
            .await
            .map_err(OrchestratorError::Unavailable)?;
        Ok(tasks
            .into_iter()
            .filter(|t| {
                t.status
                    .as_ref()
                    .and_then(|s| s.state.as_ref())
                    .map(|s| matches!(s, bollard::models::TaskState::RUNNING))
                    .unwrap_or(false)
            })
            .count())
    }

    async fn assigned_nodes(&self, service_name: &str) -> Result<HashSet<String>, OrchestratorError> {
        let mut filters: HashMap<String, Vec<String>> = HashMap::new();
        filters.insert("service".to_string(), vec![service_name.to_string()]);
        let opts = ListTasksOptionsBuilder::default().filters(&filters).build();
        let tasks = self
            .docker
            .list_tasks(Some(opts))
            .await
            .map_err(OrchestratorError::Unavailable)?;
        Ok(tasks.into_iter().filter_map(|t| t.node_id).collect())
    }

    async fn active_node_ids(&self) -> Result<HashSet<String>, OrchestratorError> {
        let opts = ListNodesOptionsBuilder::default().build();
        let nodes = self
            .docker
            .list_nodes(Some(opts))
            .await
            .map_err(OrchestratorError::Unavailable)?;
        Ok(nodes
            .into_iter()
            .filter(|n| {
                let available = n
                    .spec
                    .as_ref()
                    .and_then(|s| s.availability.as_ref())
                    .map(|a| matches!(a, bollard::models::NodeSpecAvailabilityEnum::ACTIVE))
                    .unwrap_or(false);
                let not_down = n
                    .status
                    .as_ref()
                    .and_then(|s| s.state.as_ref())
                    .map(|s| !matches!(s, bollard::models::NodeState::DOWN))
                    .unwrap_or(false);
                available && not_down
            })
            .filter_map(|n| n.id)
            .collect())
    }

    /// Any local container whose name-stem (the segment before the first
    /// `.`) equals `service_name`. Container-id matching is rejected
    /// because ids churn across restarts; the name stem does not.
    pub async fn first_container_for_service(
        &self,
        service_name: &str,
    ) -> Result<Option<ContainerHandle>, OrchestratorError> {
        let opts = ListContainersOptionsBuilder::default().all(false).build();
        let containers = self
            .docker
            .list_containers(Some(opts))
            .await
            .map_err(OrchestratorError::Unavailable)?;
        for container in containers {
            let Some(names) = container.names.as_ref() else {
                continue;
            };
            let matches = names.iter().any(|name| {
                let trimmed = name.trim_start_matches('/');
                trimmed.split('.').next() == Some(service_name)
            });
            if matches {
                if let Some(id) = container.id {
                    return Ok(Some(ContainerHandle { id }));
                }
            }
        }
        Ok(None)
    }

    /// Run a shell command inside a named container and return its
    /// combined stdout/stderr together with the exec's exit code. This is
    /// the one load-bearing write path the controller has before any
    /// database credential exists, so callers must check
    /// [`ExecOutput::succeeded`] before trusting the output: a crashed or
    /// misparsed `mongosh` invocation still produces output, just not the
    /// output the caller asked for.
    pub async fn exec_shell(
        &self,
        container: &ContainerHandle,
        command: &[&str],
    ) -> Result<ExecOutput, OrchestratorError> {
        let exec = self
            .docker
            .create_exec(
                &container.id,
                CreateExecOptions {
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    cmd: Some(command.iter().map(|s| s.to_string()).collect()),
                    ..Default::default()
                },
            )
            .await
            .map_err(OrchestratorError::Unavailable)?;

        let start = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(OrchestratorError::Unavailable)?;

        let mut collected = String::new();
        if let StartExecResults::Attached { mut output, .. } = start {
            while let Some(chunk) = output.next().await {
                match chunk {
                    Ok(log) => collected.push_str(&log.to_string()),
                    Err(err) => return Err(OrchestratorError::Unavailable(err)),
                }
            }
        }

        let inspect = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(OrchestratorError::Unavailable)?;

        Ok(ExecOutput {
            output: collected,
            exit_code: inspect.exit_code,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_name_stem_matches_segment_before_first_dot() {
        let name = "/mongo.1.abc123xyz";
        let trimmed = name.trim_start_matches('/');
        assert_eq!(trimmed.split('.').next(), Some("mongo"));
    }

    #[test]
    fn container_name_stem_rejects_partial_match() {
        let name = "/mongo-backup.1.abc123xyz";
        let trimmed = name.trim_start_matches('/');
        assert_ne!(trimmed.split('.').next(), Some("mongo"));
    }

    #[test]
    fn exec_output_succeeds_only_on_exit_zero() {
        let ok = ExecOutput { output: "done".to_string(), exit_code: Some(0) };
        assert!(ok.succeeded());

        let failed = ExecOutput { output: "SyntaxError".to_string(), exit_code: Some(1) };
        assert!(!failed.succeeded());

        let unknown = ExecOutput { output: String::new(), exit_code: None };
        assert!(!unknown.succeeded());
    }
}
