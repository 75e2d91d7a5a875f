//! Ordered linked-server hops from the direct connection to the target.
//!
//! # Textual form
//!
//! ```text
//! SQL02/webapp,SQL03@hr,[LEGACY,01]:1434
//! ```
//!
//! Hops are separated by `,`. A hop is a name followed by optional
//! `:port`, `/principal` and `@database` modifiers, each at most once and in
//! any order. Any part may be wrapped in `[...]` to carry delimiter
//! characters; `]]` inside brackets is a literal `]`.

use std::fmt;
use std::iter::Peekable;
use std::str::{Chars, FromStr};

use crate::error::{Error, Result};
use crate::server::Server;

/// Routing name standing for the direct connection.
pub const ROUTING_SENTINEL: &str = "0";

/// Hops plus the parallel arrays the compiler routes with.
///
/// The arrays are rebuilt by every mutating method, so a chain can never be
/// observed with hops and arrays out of step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerChain {
    hops: Vec<Server>,
    routing: Vec<String>,
    principals: Vec<String>,
    databases: Vec<String>,
}

impl ServerChain {
    pub fn new() -> Self {
        Self::from_hops(Vec::new())
    }

    pub fn from_hops(hops: Vec<Server>) -> Self {
        let mut chain = Self {
            hops,
            routing: Vec::new(),
            principals: Vec::new(),
            databases: Vec::new(),
        };
        chain.rebuild();
        chain
    }

    pub fn parse(text: &str) -> Result<Self> {
        if text.trim().is_empty() {
            return Ok(Self::new());
        }

        let mut chars = text.chars().peekable();
        let mut hops = Vec::new();
        loop {
            hops.push(parse_hop(&mut chars)?);
            match chars.next() {
                None => break,
                Some(',') => continue,
                Some(c) => return Err(invalid(format!("unexpected '{}'", c))),
            }
        }
        Ok(Self::from_hops(hops))
    }

    /// Append a hop at the far end of the chain.
    pub fn push(&mut self, server: Server) {
        self.hops.push(server);
        self.rebuild();
    }

    pub fn clear(&mut self) {
        self.hops.clear();
        self.rebuild();
    }

    pub fn hops(&self) -> &[Server] {
        &self.hops
    }

    pub fn len(&self) -> usize {
        self.hops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hops.is_empty()
    }

    /// The final hop, where statements actually run.
    pub fn destination(&self) -> Option<&Server> {
        self.hops.last()
    }

    /// `N + 1` names: the sentinel followed by each hop's alias.
    pub fn routing_names(&self) -> &[String] {
        &self.routing
    }

    /// One entry per hop, empty when the hop does not impersonate.
    pub fn principals(&self) -> &[String] {
        &self.principals
    }

    /// One entry per hop, empty when the hop keeps its default database.
    pub fn databases(&self) -> &[String] {
        &self.databases
    }

    fn rebuild(&mut self) {
        let mut routing = Vec::with_capacity(self.hops.len() + 1);
        routing.push(ROUTING_SENTINEL.to_string());
        routing.extend(self.hops.iter().map(|h| h.routing_name().to_string()));

        self.principals = self
            .hops
            .iter()
            .map(|h| h.impersonate.clone().unwrap_or_default())
            .collect();
        self.databases = self
            .hops
            .iter()
            .map(|h| h.database.clone().unwrap_or_default())
            .collect();
        self.routing = routing;
    }
}

impl Default for ServerChain {
    fn default() -> Self {
        Self::new()
    }
}

impl FromStr for ServerChain {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for ServerChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, hop) in self.hops.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}", hop)?;
        }
        Ok(())
    }
}

fn invalid(reason: impl Into<String>) -> Error {
    Error::InvalidChain(reason.into())
}

fn is_delimiter(c: char) -> bool {
    matches!(c, ',' | ':' | '/' | '@')
}

fn parse_hop(chars: &mut Peekable<Chars<'_>>) -> Result<Server> {
    let name = read_part(chars)?;
    if name.is_empty() {
        return Err(invalid("empty server name"));
    }
    let mut server = Server::new(name);

    while let Some(&marker) = chars.peek() {
        if marker == ',' {
            break;
        }
        chars.next();
        let value = read_part(chars)?;
        if value.is_empty() {
            return Err(invalid(format!("empty value after '{}'", marker)));
        }
        match marker {
            ':' => {
                if server.port.is_some() {
                    return Err(invalid("port given twice"));
                }
                let port = value
                    .parse::<u16>()
                    .map_err(|_| invalid(format!("invalid port '{}'", value)))?;
                server.port = Some(port);
            }
            '/' => {
                if server.impersonate.replace(value).is_some() {
                    return Err(invalid("impersonation given twice"));
                }
            }
            '@' => {
                if server.database.replace(value).is_some() {
                    return Err(invalid("database given twice"));
                }
            }
            other => return Err(invalid(format!("unexpected '{}'", other))),
        }
    }
    Ok(server)
}

/// Read one name or modifier value, stopping before the next delimiter.
fn read_part(chars: &mut Peekable<Chars<'_>>) -> Result<String> {
    while chars.peek().map_or(false, |c| c.is_whitespace()) {
        chars.next();
    }

    let mut part = String::new();
    if chars.peek() == Some(&'[') {
        chars.next();
        loop {
            match chars.next() {
                None => return Err(invalid("unterminated '['")),
                Some(']') if chars.peek() == Some(&']') => {
                    chars.next();
                    part.push(']');
                }
                Some(']') => break,
                Some(c) => part.push(c),
            }
        }
        while chars.peek().map_or(false, |c| c.is_whitespace()) {
            chars.next();
        }
        return match chars.peek() {
            None => Ok(part),
            Some(&c) if is_delimiter(c) => Ok(part),
            Some(&c) => Err(invalid(format!("unexpected '{}' after ']'", c))),
        };
    }

    while let Some(&c) = chars.peek() {
        if is_delimiter(c) {
            break;
        }
        if c == '[' || c == ']' {
            return Err(invalid(format!("unexpected '{}' in '{}'", c, part)));
        }
        part.push(c);
        chars.next();
    }
    Ok(part.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_modifiers() {
        let chain = ServerChain::parse("SQL02/webapp, SQL03@hr:1434").unwrap();
        assert_eq!(chain.len(), 2);

        let first = &chain.hops()[0];
        assert_eq!(first.alias.as_deref(), Some("SQL02"));
        assert_eq!(first.impersonate.as_deref(), Some("webapp"));
        assert_eq!(first.database, None);

        let second = &chain.hops()[1];
        assert_eq!(second.routing_name(), "SQL03");
        assert_eq!(second.database.as_deref(), Some("hr"));
        assert_eq!(second.port, Some(1434));
    }

    #[test]
    fn test_derived_arrays() {
        let chain = ServerChain::parse("SQL02/webapp,SQL03@hr").unwrap();
        assert_eq!(chain.routing_names(), ["0", "SQL02", "SQL03"]);
        assert_eq!(chain.principals(), ["webapp", ""]);
        assert_eq!(chain.databases(), ["", "hr"]);
    }

    #[test]
    fn test_empty_chain() {
        let chain = ServerChain::parse("  ").unwrap();
        assert!(chain.is_empty());
        assert_eq!(chain.routing_names(), ["0"]);
        assert!(chain.principals().is_empty());
        assert!(chain.destination().is_none());
    }

    #[test]
    fn test_bracket_escape() {
        let chain = ServerChain::parse("[SQL,02]/[CORP/svc],[we]]ird]@db").unwrap();
        assert_eq!(chain.routing_names(), ["0", "SQL,02", "we]ird"]);
        assert_eq!(chain.principals()[0], "CORP/svc");
    }

    #[test]
    fn test_display_round_trip() {
        let text = "[SQL,02]:1434/[CORP/svc],SQL03@hr,[we]]ird]";
        let chain = ServerChain::parse(text).unwrap();
        assert_eq!(chain.to_string(), text);
        assert_eq!(ServerChain::parse(&chain.to_string()).unwrap(), chain);
    }

    #[test]
    fn test_push_rebuilds() {
        let mut chain = ServerChain::new();
        chain.push(Server::new("SQL02").impersonating("sa"));
        chain.push(Server::new("SQL03"));
        assert_eq!(chain.routing_names(), ["0", "SQL02", "SQL03"]);
        assert_eq!(chain.principals(), ["sa", ""]);

        chain.clear();
        assert_eq!(chain.routing_names(), ["0"]);
        assert!(chain.databases().is_empty());
    }

    #[test]
    fn test_clone_is_deep() {
        let original = ServerChain::parse("SQL02,SQL03").unwrap();
        let mut copy = original.clone();
        copy.push(Server::new("SQL04"));
        assert_eq!(original.len(), 2);
        assert_eq!(copy.len(), 3);
    }

    #[test]
    fn test_rejects_malformed() {
        for text in [
            "SQL02,,SQL03",
            ",SQL02",
            "SQL02:abc",
            "SQL02:70000",
            "SQL02/",
            "SQL02/a/b",
            "SQL02@a@b",
            "[SQL02",
            "[SQL02]x",
            "SQL]02",
        ] {
            assert!(
                matches!(ServerChain::parse(text), Err(Error::InvalidChain(_))),
                "accepted {:?}",
                text
            );
        }
    }
}
