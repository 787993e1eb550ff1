//! Process entry point: load configuration, wait for the database service
//! to come fully up, then hand off to the reconciler forever.
//!
//! Everything here is the "external collaborators" layer the core
//! reconciliation logic doesn't own: environment loading, log
//! initialization, and constructing the orchestrator client. See
//! [`reconciler::Reconciler`] for the actual state machine.

mod applier;
mod config;
mod error;
mod initiator;
mod logging;
mod reconciler;
mod reconfigurer;
mod user_bootstrap;

use bollard::Docker;
use orchestrator_view::OrchestratorView;
use retry::{with_fixed_retry, FixedRetry};
use tracing::{error, info};

use config::ReconcilerConfig;
use error::FatalError;
use reconciler::Reconciler;

#[tokio::main]
async fn main() {
    // Configuration loading happens before logging is initialized: a
    // missing variable is reported on stderr the same way `clap` would
    // report a bad flag, since the tracing subscriber itself depends on
    // `DEBUG` having been read already.
    let config = match ReconcilerConfig::load() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("configuration error: {err:#}");
            std::process::exit(1);
        }
    };

    logging::init(config.debug);

    if let Err(err) = run(config).await {
        error!(%err, "fatal error; exiting for the orchestrator to restart this controller");
        std::process::exit(1);
    }
}

async fn run(config: ReconcilerConfig) -> Result<(), FatalError> {
    let docker = Docker::connect_with_local_defaults()?;
    let view = OrchestratorView::new(docker);

    info!(
        service = %config.mongo_service_name,
        "waiting for database service to come fully up"
    );
    wait_for_service_up(&view, &config.mongo_service_name).await?;
    info!("database service is fully up; starting reconciliation");

    let reconciler = Reconciler::new(config, view);
    reconciler.run().await;
    // `run` loops forever; reaching here would mean a clean shutdown, which
    // is not a path this controller currently exercises.
    Ok(())
}

/// Blocks until the service reports as fully up, or the startup budget (40
/// attempts, 10s apart, about 400s total) is exhausted.
async fn wait_for_service_up(view: &OrchestratorView, service_name: &str) -> Result<(), FatalError> {
    let policy = FixedRetry::service_startup();
    with_fixed_retry(policy, "wait_for_service_up", || async {
        match view.is_service_fully_up(service_name).await {
            Ok(true) => Ok(()),
            Ok(false) => Err("service not yet fully up".to_string()),
            Err(err) => Err(err.to_string()),
        }
    })
    .await
    .map_err(|_| FatalError::ServiceNeverUp)
}
