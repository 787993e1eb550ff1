//! Creates the application user and a marker document after a fresh
//! initiate. Runs once; the steady-state watch loop never retries it,
//! since the set is already usable without it.

use std::net::Ipv4Addr;
use std::time::Duration;

use bson::doc;
use mongodb::Client;
use node_probe::Credentials;
use tracing::{info, warn};

/// `createUser` error code for "user already exists".
const USER_EXISTS_CODE: i32 = 51003;

const SERVER_SELECTION_TIMEOUT: Duration = Duration::from_secs(15);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const SOCKET_TIMEOUT: Duration = Duration::from_secs(30);

pub struct UserBootstrap {
    pub port: u16,
}

impl UserBootstrap {
    /// Create the application user (role `dbOwner`) in `initdb_database`
    /// and insert a marker document into its `users` collection. Any
    /// failure other than "already exists" is logged and ignored: the
    /// set is already usable once it has a primary.
    pub async fn bootstrap(
        &self,
        primary_ip: Ipv4Addr,
        root_username: &str,
        root_password: &str,
        initdb_database: &str,
        initdb_user: &str,
        initdb_password: &str,
    ) {
        let credentials = Credentials {
            username: root_username.to_string(),
            password: root_password.to_string(),
        };
        let options = node_probe::direct_options(
            primary_ip,
            self.port,
            SERVER_SELECTION_TIMEOUT,
            CONNECT_TIMEOUT,
            SOCKET_TIMEOUT,
            Some(&credentials),
        );

        let client = match Client::with_options(options) {
            Ok(client) => client,
            Err(err) => {
                warn!(%err, "could not connect to create application user; leaving for operator to bootstrap manually");
                return;
            }
        };

        let db = client.database(initdb_database);
        match db
            .run_command(doc! {
                "createUser": initdb_user,
                "pwd": initdb_password,
                "roles": ["dbOwner"],
            })
            .await
        {
            Ok(_) => info!(database = initdb_database, user = initdb_user, "application user created"),
            Err(err) => {
                if is_user_already_exists(&err) {
                    info!(user = initdb_user, "application user already exists");
                } else {
                    warn!(%err, "failed to create application user; leaving set usable as-is");
                    return;
                }
            }
        }

        if let Err(err) = db
            .collection::<bson::Document>("users")
            .insert_one(doc! { "name": initdb_user })
            .await
        {
            warn!(%err, "failed to insert application user marker document");
        }
    }
}

fn is_user_already_exists(err: &mongodb::error::Error) -> bool {
    matches!(
        err.kind.as_ref(),
        mongodb::error::ErrorKind::Command(cmd) if cmd.code == USER_EXISTS_CODE
    )
}
