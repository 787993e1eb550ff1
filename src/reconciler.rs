//! The reconciliation controller: classifies cluster topology into one of
//! a small set of situations, drives the database into the intended
//! configuration, then watches forever.

use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::time::Duration;

use node_probe::{Credentials, NodeProbe, NodeStatus};
use orchestrator_view::OrchestratorView;
use retry::{with_fixed_retry, FixedRetry};
use tracing::{debug, info, warn};

use crate::applier::ConfigApplier;
use crate::config::ReconcilerConfig;
use crate::initiator::{all_uninitialized, Initiator};
use crate::reconfigurer::Reconfigurer;
use crate::user_bootstrap::UserBootstrap;

const WATCH_INTERVAL: Duration = Duration::from_secs(10);

/// Transient phases the reconciler moves through on its way to Watching,
/// the only phase that runs forever.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerPhase {
    Waiting,
    Classifying,
    Initiating,
    Reconfiguring,
    Watching,
}

pub struct Reconciler {
    config: ReconcilerConfig,
    view: OrchestratorView,
    probe: NodeProbe,
    known_member_ips: BTreeSet<Ipv4Addr>,
    phase: ControllerPhase,
}

impl Reconciler {
    pub fn new(config: ReconcilerConfig, view: OrchestratorView) -> Self {
        Self {
            config,
            view,
            probe: NodeProbe::new(),
            known_member_ips: BTreeSet::new(),
            phase: ControllerPhase::Waiting,
        }
    }

    fn credentials(&self) -> Credentials {
        Credentials {
            username: self.config.mongo_root_username.clone(),
            password: self.config.mongo_root_password.clone(),
        }
    }

    /// Runs forever. Fatal conditions are not modeled here: by the time
    /// this is called, the service has already been confirmed up and the
    /// orchestrator client already constructed successfully.
    pub async fn run(mut self) {
        loop {
            self.enter_phase(ControllerPhase::Classifying);
            let task_ips = match self.current_task_ips().await {
                Ok(ips) => ips,
                Err(err) => {
                    warn!(%err, "could not list orchestrator task addresses this tick");
                    tokio::time::sleep(WATCH_INTERVAL).await;
                    continue;
                }
            };

            let known = self.probe_known_membership(&task_ips).await;

            match known {
                None => {
                    self.enter_phase(ControllerPhase::Initiating);
                    self.initiate(&task_ips).await;
                    self.known_member_ips = task_ips.iter().copied().collect();
                }
                Some(current) if current != task_ips.iter().copied().collect() => {
                    self.enter_phase(ControllerPhase::Reconfiguring);
                    let to_remove: BTreeSet<Ipv4Addr> = current.difference(&task_ips.iter().copied().collect()).copied().collect();
                    let to_add: BTreeSet<Ipv4Addr> = task_ips
                        .iter()
                        .copied()
                        .collect::<BTreeSet<_>>()
                        .difference(&current)
                        .copied()
                        .collect();
                    self.reconfigure(&to_remove, &to_add, &task_ips).await;
                    self.known_member_ips = task_ips.iter().copied().collect();
                }
                Some(_) => {
                    info!("task ips match known membership; entering watch loop");
                }
            }

            self.enter_phase(ControllerPhase::Watching);
            self.watch().await;
        }
    }

    fn enter_phase(&mut self, phase: ControllerPhase) {
        debug!(?phase, "entering controller phase");
        self.phase = phase;
    }

    async fn current_task_ips(&self) -> Result<Vec<Ipv4Addr>, orchestrator_view::OrchestratorError> {
        let addresses = self
            .view
            .list_task_addresses(&self.config.mongo_service_name, &self.config.overlay_network_name)
            .await?;
        Ok(addresses.into_iter().map(|a| a.ipv4).collect())
    }

    /// Probe every task ip with authenticated get-config; the first
    /// `Configured` response wins and its membership is `K`. If every
    /// probe reports `NotYetInitialized` within the bounded retry window,
    /// `K = None` ("never initialized").
    async fn probe_known_membership(&self, task_ips: &[Ipv4Addr]) -> Option<BTreeSet<Ipv4Addr>> {
        if task_ips.is_empty() {
            return None;
        }
        let credentials = self.credentials();
        let policy = FixedRetry::classification();
        let result = with_fixed_retry(policy, "classify_membership", || async {
            for &ip in task_ips {
                match self.probe.get_config(ip, self.config.mongo_port, &credentials).await {
                    Ok(NodeStatus::Configured { config, .. }) => {
                        if let Ok(ips) = config.member_ips() {
                            return Ok(Some(ips));
                        }
                    }
                    Ok(NodeStatus::NotYetInitialized) => continue,
                    Ok(_) => continue,
                    Err(err) => {
                        tracing::debug!(%ip, %err, "transient error probing for known configuration");
                    }
                }
            }
            Err("no node returned a configured replica set yet".to_string())
        })
        .await;

        result.ok().flatten()
    }

    async fn initiate(&self, task_ips: &[Ipv4Addr]) {
        let Some(&bootstrap_ip) = task_ips.first() else {
            warn!("initiate requested with no task ips available");
            return;
        };
        let fresh = replicaset_config::fresh_config(
            &self.config.replicaset_name,
            task_ips,
            self.config.mongo_port,
        );
        let config_doc = replicaset_config::to_document(&fresh);
        let credentials = self.credentials();

        let initiator = Initiator {
            view: &self.view,
            probe: &self.probe,
            service_name: self.config.mongo_service_name.clone(),
        };

        match initiator.apply(bootstrap_ip, &config_doc, &credentials, false).await {
            Ok(()) => {
                if let Some(primary_ip) = initiator
                    .wait_for_primary_and_create_root(
                        task_ips,
                        self.config.mongo_port,
                        &self.config.mongo_root_username,
                        &self.config.mongo_root_password,
                    )
                    .await
                {
                    UserBootstrap { port: self.config.mongo_port }
                        .bootstrap(
                            primary_ip,
                            &self.config.mongo_root_username,
                            &self.config.mongo_root_password,
                            &self.config.initdb_database,
                            &self.config.initdb_user,
                            &self.config.initdb_password,
                        )
                        .await;
                }
            }
            Err(crate::applier::ApplyError::RequiresAuthentication) => {
                info!("set already initialized; handing off to reconfigure with force");
                let reconfigurer = Reconfigurer { port: self.config.mongo_port };
                if let Err(err) = reconfigurer.apply(bootstrap_ip, &config_doc, &credentials, true).await {
                    warn!(%err, "forced reconfigure after redeployment failed");
                }
            }
            Err(err) => {
                warn!(%err, "replica-set initiation failed; will retry next restart");
            }
        }
    }

    async fn reconfigure(
        &self,
        to_remove: &BTreeSet<Ipv4Addr>,
        to_add: &BTreeSet<Ipv4Addr>,
        task_ips: &[Ipv4Addr],
    ) {
        let credentials = self.credentials();

        let uninitialized = all_uninitialized(&self.probe, task_ips, self.config.mongo_port).await;
        let mut primary = if uninitialized {
            None
        } else {
            // Redeployment (K != T): the primary may already have migrated
            // onto a newly-added task ip, so search T, not the stale K.
            self.find_primary(&task_ips.iter().copied().collect()).await
        };

        let force = to_remove.len() > 1
            || to_add.len() > 1
            || primary.is_none()
            || primary.map(|p| to_remove.contains(&p)).unwrap_or(false);

        if primary.is_none() && !uninitialized {
            primary = self.wait_for_new_primary(task_ips).await;
        }

        let bootstrap_ip = match primary {
            Some(ip) => ip,
            None => {
                let surviving = task_ips.iter().find(|ip| !to_add.contains(ip));
                match surviving.or_else(|| task_ips.first()) {
                    Some(&ip) => ip,
                    None => {
                        warn!("no candidate ip available to target a reconfigure");
                        return;
                    }
                }
            }
        };

        let existing_doc = match self.fetch_existing_config_doc(bootstrap_ip, &credentials).await {
            Some(doc) => doc,
            None => {
                warn!(%bootstrap_ip, "could not read existing config for mutation; skipping this tick");
                return;
            }
        };

        let mutated = match replicaset_config::mutate_document(&existing_doc, to_remove, to_add, self.config.mongo_port) {
            Ok(doc) => doc,
            Err(err) => {
                warn!(%err, "could not build mutated replica-set config document");
                return;
            }
        };

        let reconfigurer = Reconfigurer { port: self.config.mongo_port };
        match reconfigurer.apply(bootstrap_ip, &mutated, &credentials, force).await {
            Ok(()) => {
                // Re-resolve the primary among the new task set regardless of
                // outcome: the reconfigure may itself have triggered an
                // election, and the result is purely informational here.
                match self.find_primary(&task_ips.iter().copied().collect()).await {
                    Some(primary) => info!(%primary, "primary after reconfigure"),
                    None => debug!("no writable primary observed immediately after reconfigure"),
                }
            }
            Err(err) => warn!(%err, "reconfigure failed; membership state left unchanged"),
        }
    }

    /// Fetches the raw `replSetGetConfig` document rather than re-deriving
    /// one from our parsed model, so fields we don't model (`term`,
    /// `settings`, `protocolVersion`) pass through [`replicaset_config::mutate_document`]
    /// untouched.
    async fn fetch_existing_config_doc(&self, ip: Ipv4Addr, credentials: &Credentials) -> Option<bson::Document> {
        match self.probe.get_config(ip, self.config.mongo_port, credentials).await {
            Ok(NodeStatus::Configured { raw, .. }) => Some(raw),
            _ => None,
        }
    }

    async fn find_primary(&self, candidates: &BTreeSet<Ipv4Addr>) -> Option<Ipv4Addr> {
        let ips: Vec<Ipv4Addr> = candidates.iter().copied().collect();
        self.probe.find_primary(&ips, self.config.mongo_port).await.primary
    }

    async fn wait_for_new_primary(&self, task_ips: &[Ipv4Addr]) -> Option<Ipv4Addr> {
        let policy = FixedRetry::primary_election();
        with_fixed_retry(policy, "wait_for_new_primary", || async {
            let result = self.probe.find_primary(task_ips, self.config.mongo_port).await;
            result.primary.ok_or_else(|| "no new primary elected yet".to_string())
        })
        .await
        .ok()
    }

    async fn watch(&mut self) {
        loop {
            tokio::time::sleep(WATCH_INTERVAL).await;
            let new_ips = match self.current_task_ips().await {
                Ok(ips) => ips,
                Err(err) => {
                    warn!(%err, "could not list orchestrator task addresses during watch");
                    continue;
                }
            };
            let new_set: BTreeSet<Ipv4Addr> = new_ips.iter().copied().collect();

            if new_set.symmetric_difference(&self.known_member_ips).next().is_some() {
                info!("detected membership change; reconfiguring");
                let to_remove: BTreeSet<Ipv4Addr> =
                    self.known_member_ips.difference(&new_set).copied().collect();
                let to_add: BTreeSet<Ipv4Addr> = new_set.difference(&self.known_member_ips).copied().collect();
                self.reconfigure(&to_remove, &to_add, &new_ips).await;
                self.known_member_ips = new_set;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    #[test]
    fn force_is_required_when_multiple_members_change() {
        let to_remove: BTreeSet<Ipv4Addr> = [ip("10.0.0.5"), ip("10.0.0.6")].into_iter().collect();
        let to_add: BTreeSet<Ipv4Addr> = BTreeSet::new();
        let primary: Option<Ipv4Addr> = Some(ip("10.0.0.7"));
        let force =
            to_remove.len() > 1 || to_add.len() > 1 || primary.is_none() || primary.map(|p| to_remove.contains(&p)).unwrap_or(false);
        assert!(force);
    }

    #[test]
    fn force_is_required_when_primary_is_being_removed() {
        let to_remove: BTreeSet<Ipv4Addr> = [ip("10.0.0.5")].into_iter().collect();
        let to_add: BTreeSet<Ipv4Addr> = BTreeSet::new();
        let primary: Option<Ipv4Addr> = Some(ip("10.0.0.5"));
        let force =
            to_remove.len() > 1 || to_add.len() > 1 || primary.is_none() || primary.map(|p| to_remove.contains(&p)).unwrap_or(false);
        assert!(force);
    }

    #[test]
    fn force_is_not_required_for_a_single_clean_add() {
        let to_remove: BTreeSet<Ipv4Addr> = BTreeSet::new();
        let to_add: BTreeSet<Ipv4Addr> = [ip("10.0.0.8")].into_iter().collect();
        let primary: Option<Ipv4Addr> = Some(ip("10.0.0.5"));
        let force =
            to_remove.len() > 1 || to_add.len() > 1 || primary.is_none() || primary.map(|p| to_remove.contains(&p)).unwrap_or(false);
        assert!(!force);
    }
}
