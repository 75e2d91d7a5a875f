//! Connection and execution settings.
//!
//! # Configuration Format
//!
//! ```toml
//! [connection]
//! host = "sql01.corp.local"
//! port = 1433                 # default 1433
//! database = "master"         # default master
//! trust_cert = true           # default true
//!
//! [connection.auth]
//! method = "sql"              # "integrated" (default) or "sql"
//! username = "sa"
//! password = "..."            # prompted for when absent
//!
//! [execution]
//! timeout_secs = 120          # first attempt; doubled on every timeout
//! max_retries = 3             # shared by all recovery steps
//! rpc_memory = "per-context"  # or "shared"
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub connection: ConnectionConfig,
    pub execution: ExecutionSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub host: Option<String>,
    pub port: u16,
    pub database: String,
    pub trust_cert: bool,
    pub auth: AuthConfig,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: None,
            port: 1433,
            database: "master".to_string(),
            trust_cert: true,
            auth: AuthConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "kebab-case")]
pub enum AuthConfig {
    /// Kerberos through GSSAPI with the current ticket cache.
    #[default]
    Integrated,
    Sql {
        username: String,
        #[serde(default)]
        password: Option<String>,
    },
}

/// Whether duplicated contexts inherit what was learned about RPC.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RpcMemory {
    /// Every context re-learns RPC unavailability on its own.
    #[default]
    PerContext,
    /// A context and all of its duplicates share one cache.
    Shared,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionSettings {
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub rpc_memory: RpcMemory,
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            timeout_secs: 120,
            max_retries: 3,
            rpc_memory: RpcMemory::default(),
        }
    }
}

impl ExecutionSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.execution.timeout_secs == 0 {
            return Err(Error::Config("timeout_secs must be positive".into()));
        }
        if self.execution.max_retries == 0 {
            return Err(Error::Config("max_retries must be at least 1".into()));
        }
        if let AuthConfig::Sql { username, .. } = &self.connection.auth {
            if username.is_empty() {
                return Err(Error::Config("sql authentication needs a username".into()));
            }
        }
        Ok(())
    }
}
