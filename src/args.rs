use std::path::PathBuf;

use clap::{Parser, Subcommand};
use sqlchain::{AuthConfig, Config, ServerChain};

/// Enumerate and execute on SQL Server, directly or through linked servers
#[derive(Parser, Debug)]
#[command(name = "sqlchain", version, long_about = None)]
pub struct Cli {
    /// Host to connect to
    #[arg(short = 'H', long = "host")]
    pub host: Option<String>,

    /// Port (default: 1433)
    #[arg(short = 'p', long = "port")]
    pub port: Option<u16>,

    /// Initial database (default: master)
    #[arg(short = 'd', long = "database")]
    pub database: Option<String>,

    /// SQL login; integrated authentication is used when absent
    #[arg(short = 'u', long = "username")]
    pub username: Option<String>,

    /// SQL login password (prompted for when the flag has no value)
    #[arg(short = 'P', long = "password", num_args = 0..=1, default_missing_value = "")]
    pub password: Option<String>,

    /// Linked servers to go through, e.g. `SQL02/webapp,SQL03@hr`
    #[arg(short = 'l', long = "links", value_name = "CHAIN")]
    pub chain: Option<ServerChain>,

    /// Timeout of the first attempt of each statement, in seconds
    #[arg(long = "timeout", value_name = "SECONDS")]
    pub timeout: Option<u64>,

    /// Attempts per statement across all recovery steps
    #[arg(long = "retries")]
    pub retries: Option<u32>,

    /// Configuration file
    #[arg(short = 'c', long = "config")]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,

    #[command(subcommand)]
    pub action: Action,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Action {
    /// Show the login, mapped user and role membership on the target
    Info,
    /// List linked servers defined on the target
    Links,
    /// List logins that can be impersonated
    Impersonable,
    /// Run an OS command through xp_cmdshell
    Exec { command: String },
    /// Force the service account to authenticate to a listener
    Coerce { listener: String },
    /// Run a statement and print the result
    Query { statement: String },
    /// Show what the final hop of the chain resolves to
    Resolve,
}

impl Cli {
    /// Flags win over the configuration file.
    pub fn apply(&self, config: &mut Config) {
        let connection = &mut config.connection;
        if let Some(host) = &self.host {
            connection.host = Some(host.clone());
        }
        if let Some(port) = self.port {
            connection.port = port;
        }
        if let Some(database) = &self.database {
            connection.database = database.clone();
        }

        let password = self.password.clone().filter(|p| !p.is_empty());
        if let Some(username) = &self.username {
            connection.auth = AuthConfig::Sql {
                username: username.clone(),
                password,
            };
        } else if let (Some(password), AuthConfig::Sql { password: current, .. }) =
            (password, &mut connection.auth)
        {
            *current = Some(password);
        }

        if let Some(timeout) = self.timeout {
            config.execution.timeout_secs = timeout;
        }
        if let Some(retries) = self.retries {
            config.execution.max_retries = retries;
        }
    }
}
