//! Finds out what the final hop of a chain actually is.
//!
//! The alias a link is known by says little about the server behind it, so
//! after a chain is attached the engine asks the destination for its own
//! name, version and current database. The answers go into a copy of the
//! final hop kept as the engine's target; the chain itself is never touched,
//! so routing keeps using the alias. Failures only cost detail, never the
//! session.

use tracing::{info, warn};

use crate::channel::Cell;
use crate::engine::Engine;
use crate::error::Result;
use crate::server::Server;

const IDENTITY_QUERY: &str = "SELECT @@SERVERNAME AS [Host], @@VERSION AS [Version];";
const DATABASE_QUERY: &str = "SELECT DB_NAME() AS [Database];";

struct Identity {
    host: Option<String>,
    version: Option<String>,
}

fn text(cell: Option<&Cell>) -> Option<String> {
    cell.filter(|c| !c.is_null())
        .map(|c| c.to_string().trim().to_string())
        .filter(|s| !s.is_empty())
}

impl Engine {
    async fn probe_identity(&mut self) -> Result<Identity> {
        let table = self.execute_rows(IDENTITY_QUERY).await?;
        Ok(Identity {
            host: text(table.get(0, "Host")),
            version: text(table.get(0, "Version")),
        })
    }

    async fn probe_database(&mut self) -> Result<Option<String>> {
        let cell = self.execute_scalar(DATABASE_QUERY).await?;
        Ok(text(cell.as_ref()))
    }

    /// Fill in `server` from the current route, keeping whatever is
    /// already known when a probe fails.
    async fn describe(&mut self, server: &mut Server) {
        match self.probe_identity().await {
            Ok(identity) => {
                if let Some(host) = identity.host {
                    server.hostname = host;
                }
                if let Some(version) = identity.version {
                    server.apply_version(&version);
                }
            }
            Err(e) => warn!(server = %server.routing_name(), "could not identify server: {}", e),
        }

        if server.database.is_none() {
            match self.probe_database().await {
                Ok(database) => server.database = database,
                Err(e) => warn!(server = %server.routing_name(), "could not read current database: {}", e),
            }
        }
    }

    /// Record the direct server's own name and version. Runs without the
    /// chain and leaves the chain and routing state as they were.
    pub async fn identify_direct(&mut self) {
        let chain = std::mem::take(&mut self.chain);
        let mut server = self.server.clone();
        self.describe(&mut server).await;
        self.chain = chain;

        info!(
            host = %server.hostname,
            version = server.version.as_deref().unwrap_or("unknown"),
            "connected"
        );
        self.server = server;
    }

    /// Resolve the final hop of the current chain. A no-op without a chain.
    pub async fn resolve_execution_context(&mut self) -> Option<&Server> {
        let mut resolved = self.chain.destination()?.clone();
        self.describe(&mut resolved).await;

        info!(
            alias = %resolved.routing_name(),
            host = %resolved.hostname,
            version = resolved.version.as_deref().unwrap_or("unknown"),
            database = resolved.database.as_deref().unwrap_or("unknown"),
            legacy = resolved.legacy,
            cloud = resolved.cloud,
            "resolved execution context"
        );
        self.target = Some(resolved);
        self.target.as_ref()
    }
}
