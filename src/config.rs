//! Environment-backed configuration, loaded case-insensitively against the
//! ambient process environment (the deployment stack sets names in
//! whatever case its tooling prefers).

use std::collections::HashMap;
use std::env;

use anyhow::{bail, Context, Result};
use clap::Parser;

const REQUIRED_VARS: &[&str] = &[
    "OVERLAY_NETWORK_NAME",
    "MONGO_SERVICE_NAME",
    "REPLICASET_NAME",
    "MONGO_PORT",
    "MONGO_ROOT_USERNAME",
    "MONGO_ROOT_PASSWORD",
    "INITDB_DATABASE",
    "INITDB_USER",
    "INITDB_PASSWORD",
];

/// Replica-set membership reconciler for a self-hosted document database
/// running as a Docker Swarm global service.
///
/// Configuration is read from the environment (name matching is
/// case-insensitive); `clap`'s `env` support covers the common-case exact
/// names, and [`ReconcilerConfig::from_env`] does the case-insensitive
/// lookup proper beneath it.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    #[arg(long, env = "DEBUG")]
    debug: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub overlay_network_name: String,
    pub mongo_service_name: String,
    pub replicaset_name: String,
    pub mongo_port: u16,
    pub mongo_root_username: String,
    pub mongo_root_password: String,
    pub initdb_database: String,
    pub initdb_user: String,
    pub initdb_password: String,
    pub debug: bool,
}

impl ReconcilerConfig {
    /// Parse process arguments (for `--debug`/`DEBUG` and `--help`) and
    /// load the remaining required variables case-insensitively from the
    /// environment.
    pub fn load() -> Result<Self> {
        let cli = Cli::parse();
        let debug = cli
            .debug
            .or_else(|| lookup_case_insensitive("DEBUG"))
            .map(|v| v == "1")
            .unwrap_or(false);

        let mut values: HashMap<&str, String> = HashMap::new();
        let mut missing = Vec::new();
        for var in REQUIRED_VARS {
            match lookup_case_insensitive(var) {
                Some(value) => {
                    values.insert(var, value);
                }
                None => missing.push(*var),
            }
        }
        if !missing.is_empty() {
            bail!("missing required environment variables: {}", missing.join(", "));
        }

        let mongo_port: u16 = values["MONGO_PORT"]
            .parse()
            .with_context(|| format!("MONGO_PORT value '{}' is not a valid port", values["MONGO_PORT"]))?;

        Ok(Self {
            overlay_network_name: values.remove("OVERLAY_NETWORK_NAME").unwrap(),
            mongo_service_name: values.remove("MONGO_SERVICE_NAME").unwrap(),
            replicaset_name: values.remove("REPLICASET_NAME").unwrap(),
            mongo_port,
            mongo_root_username: values.remove("MONGO_ROOT_USERNAME").unwrap(),
            mongo_root_password: values.remove("MONGO_ROOT_PASSWORD").unwrap(),
            initdb_database: values.remove("INITDB_DATABASE").unwrap(),
            initdb_user: values.remove("INITDB_USER").unwrap(),
            initdb_password: values.remove("INITDB_PASSWORD").unwrap(),
            debug,
        })
    }
}

fn lookup_case_insensitive(name: &str) -> Option<String> {
    env::vars().find_map(|(k, v)| (k.eq_ignore_ascii_case(name)).then_some(v))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_case_insensitive_matches_any_case() {
        // SAFETY: test-only, single-threaded access to the process environment.
        unsafe {
            env::set_var("rEpLiCaSeT_nAmE", "rs0");
        }
        assert_eq!(
            lookup_case_insensitive("REPLICASET_NAME"),
            Some("rs0".to_string())
        );
        unsafe {
            env::remove_var("rEpLiCaSeT_nAmE");
        }
    }

    #[test]
    fn lookup_case_insensitive_returns_none_when_absent() {
        assert_eq!(lookup_case_insensitive("DEFINITELY_NOT_SET_XYZ"), None);
    }
}
