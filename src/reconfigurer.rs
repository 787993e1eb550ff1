//! Applies membership changes to a live, authenticated replica set via
//! the driver. This is the only path once the set has credentials; the
//! shell path in [`crate::initiator`] exists purely for the first
//! initiate.

use std::net::Ipv4Addr;
use std::time::Duration;

use async_trait::async_trait;
use bson::{doc, Document};
use mongodb::Client;
use node_probe::Credentials;
use retry::{with_fixed_retry, FixedRetry};
use tracing::info;

use crate::applier::{ApplyError, ConfigApplier};

const SERVER_SELECTION_TIMEOUT: Duration = Duration::from_secs(15);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const SOCKET_TIMEOUT: Duration = Duration::from_secs(30);

pub struct Reconfigurer {
    pub port: u16,
}

#[async_trait]
impl ConfigApplier for Reconfigurer {
    async fn apply(
        &self,
        primary_ip: Ipv4Addr,
        config_doc: &Document,
        credentials: &Credentials,
        force: bool,
    ) -> Result<(), ApplyError> {
        let options = node_probe::direct_options(
            primary_ip,
            self.port,
            SERVER_SELECTION_TIMEOUT,
            CONNECT_TIMEOUT,
            SOCKET_TIMEOUT,
            Some(credentials),
        );
        let client = Client::with_options(options)?;

        let policy = FixedRetry::reconfigure();
        with_fixed_retry(policy, "reconfigure", || async {
            client
                .database("admin")
                .run_command(doc! {
                    "replSetReconfig": config_doc.clone(),
                    "force": force,
                })
                .await
        })
        .await?;

        info!(%primary_ip, force, "applied replica-set reconfiguration");
        Ok(())
    }
}
