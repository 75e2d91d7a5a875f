//! One hop of a linked-server chain.

use std::fmt;

/// First major version that ships trusted-assembly deployment (SQL Server 2017).
const MODERN_MAJOR_VERSION: u32 = 14;

/// A server reachable directly or through a chain of links.
///
/// `alias` is the name the previous hop uses to address this one and is what
/// routing is built from. `hostname` is descriptive: it starts out equal to
/// the alias and is overwritten with the self-reported name once resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Server {
    pub hostname: String,
    pub port: Option<u16>,
    pub alias: Option<String>,
    pub impersonate: Option<String>,
    pub database: Option<String>,
    pub version: Option<String>,
    pub legacy: bool,
    pub cloud: bool,
}

impl Server {
    /// A server addressed by `name`, used both as hostname and routing alias.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            alias: Some(name.clone()),
            ..Self::direct(name)
        }
    }

    /// The directly connected server. It is never routed to, so it has no alias.
    pub fn direct(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            port: None,
            alias: None,
            impersonate: None,
            database: None,
            version: None,
            legacy: false,
            cloud: false,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn impersonating(mut self, principal: impl Into<String>) -> Self {
        self.impersonate = Some(principal.into());
        self
    }

    pub fn using_database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    /// Name used in `[..]` when compiling statements.
    pub fn routing_name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.hostname)
    }

    /// Record the `@@VERSION` banner and derive the legacy/cloud flags.
    /// Azure SQL reports 12.x regardless of features, so it is never legacy.
    pub fn apply_version(&mut self, banner: &str) {
        self.cloud = banner.to_ascii_lowercase().contains("azure");
        self.version = parse_version(banner);
        self.legacy = !self.cloud
            && self
                .major_version()
                .map(|major| major < MODERN_MAJOR_VERSION)
                .unwrap_or(false);
    }

    pub fn major_version(&self) -> Option<u32> {
        self.version
            .as_deref()
            .and_then(|v| v.split('.').next())
            .and_then(|major| major.parse().ok())
    }
}

/// Pull `15.0.2000.5` out of a banner like
/// `Microsoft SQL Server 2019 (RTM) - 15.0.2000.5 (X64) ...`.
pub fn parse_version(banner: &str) -> Option<String> {
    banner
        .split(|c: char| c.is_whitespace() || c == '(' || c == ')')
        .find(|token| {
            let parts: Vec<&str> = token.split('.').collect();
            parts.len() >= 3
                && parts
                    .iter()
                    .all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()))
        })
        .map(str::to_string)
}

/// Renders in the chain grammar: `name[:port][/principal][@database]`.
impl fmt::Display for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_part(f, self.routing_name())?;
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        if let Some(principal) = &self.impersonate {
            write!(f, "/")?;
            write_part(f, principal)?;
        }
        if let Some(database) = &self.database {
            write!(f, "@")?;
            write_part(f, database)?;
        }
        Ok(())
    }
}

fn write_part(f: &mut fmt::Formatter<'_>, part: &str) -> fmt::Result {
    if part.contains(|c| matches!(c, ',' | ':' | '/' | '@' | '[' | ']')) {
        write!(f, "[{}]", part.replace(']', "]]"))
    } else {
        write!(f, "{}", part)
    }
}
