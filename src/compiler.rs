//! Turns a statement plus a [`ServerChain`] into one batch for the direct
//! connection.
//!
//! Two forms are produced and the caller picks which:
//!
//! - [`Strategy::Rpc`] nests `EXEC ('...') AT [hop]` from the last hop back
//!   to the first. Every hop re-encodes the accumulated batch into a fresh
//!   literal, so quotes are doubled once per hop and any batch (DDL, DML,
//!   server configuration) can run. Needs RPC out on every link.
//! - [`Strategy::OpenQuery`] nests `SELECT * FROM OPENQUERY([hop], '...')`
//!   from the first hop to the last. Works without RPC out, but every level
//!   must return a rowset and the quote runs double at each depth.
//!
//! Both functions are pure: the same inputs always compile to the same text.

use crate::chain::ServerChain;
use crate::error::{Error, Result};
use crate::statement::{bracket, quote, terminate};

/// How a statement is routed through linked servers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Strategy {
    /// `EXEC (...) AT [hop]`.
    #[default]
    Rpc,
    /// `OPENQUERY` only; RPC out is unavailable somewhere on the chain.
    OpenQuery,
}

pub fn compile(chain: &ServerChain, statement: &str, strategy: Strategy) -> Result<String> {
    match strategy {
        Strategy::Rpc => rpc_chain(chain, statement),
        Strategy::OpenQuery => openquery_chain(chain, statement),
    }
}

/// `EXECUTE AS LOGIN` and `USE` statements that set up a hop. `master` is
/// the default database and is never switched to explicitly.
fn context_switch(principal: &str, database: &str) -> String {
    let mut context = String::new();
    if !principal.is_empty() {
        context.push_str(&format!("EXECUTE AS LOGIN = {}; ", quote(principal)));
    }
    if !database.is_empty() && !database.eq_ignore_ascii_case("master") {
        context.push_str(&format!("USE {}; ", bracket(database)));
    }
    context
}

pub fn rpc_chain(chain: &ServerChain, statement: &str) -> Result<String> {
    if chain.is_empty() {
        return Err(Error::EmptyChain);
    }

    let routing = chain.routing_names();
    let principals = chain.principals();
    let databases = chain.databases();

    let mut query = terminate(statement);
    for hop in (0..chain.len()).rev() {
        let body = format!(
            "{}{}",
            context_switch(&principals[hop], &databases[hop]),
            query
        );
        query = format!(
            "EXEC ({}) AT {}",
            quote(&terminate(&body)),
            bracket(&routing[hop + 1])
        );
    }
    Ok(query)
}

pub fn openquery_chain(chain: &ServerChain, statement: &str) -> Result<String> {
    if chain.is_empty() {
        return Err(Error::EmptyChain);
    }
    Ok(openquery_level(chain, statement, 0))
}

/// A run of `2^depth` single quotes.
fn ticks(depth: usize) -> String {
    "'".repeat(1 << depth)
}

/// Text executed on routing name `level`, which sits inside `level`
/// OPENQUERY literals. Level 0 is the direct connection.
///
/// Only the text a level contributes itself is escaped here; the nested
/// level arrives already escaped for its own depth.
fn openquery_level(chain: &ServerChain, statement: &str, level: usize) -> String {
    let routing = chain.routing_names();
    let run = ticks(level);

    let context = match level {
        0 => String::new(),
        hop => context_switch(&chain.principals()[hop - 1], &chain.databases()[hop - 1]),
    };

    if level + 1 == routing.len() {
        return format!("{}{}", context, terminate(statement)).replace('\'', &run);
    }

    let own = format!(
        "{}SELECT * FROM OPENQUERY({}, ",
        context,
        bracket(&routing[level + 1])
    )
    .replace('\'', &run);

    format!(
        "{}{}{}{})",
        own,
        run,
        openquery_level(chain, statement, level + 1),
        run
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::Server;
    use proptest::{prop_assert, prop_assert_eq, proptest};

    fn chain(text: &str) -> ServerChain {
        ServerChain::parse(text).unwrap()
    }

    #[test]
    fn test_empty_chain_is_an_error() {
        let empty = ServerChain::new();
        assert!(matches!(rpc_chain(&empty, "SELECT 1"), Err(Error::EmptyChain)));
        assert!(matches!(
            openquery_chain(&empty, "SELECT 1"),
            Err(Error::EmptyChain)
        ));
    }

    #[test]
    fn test_openquery_single_hop() {
        let compiled = compile(&chain("SQL02"), "SELECT 1;", Strategy::OpenQuery).unwrap();
        assert_eq!(compiled, "SELECT * FROM OPENQUERY([SQL02], 'SELECT 1;')");
    }

    #[test]
    fn test_openquery_doubles_quotes_once_for_one_hop() {
        let compiled = compile(
            &chain("SQL02"),
            "SELECT name FROM sys.server_principals WHERE name = 'sa'",
            Strategy::OpenQuery,
        )
        .unwrap();
        assert_eq!(
            compiled,
            "SELECT * FROM OPENQUERY([SQL02], 'SELECT name FROM sys.server_principals WHERE name = ''sa'';')"
        );
    }

    #[test]
    fn test_openquery_context_switches() {
        let compiled = compile(
            &chain("SQL02/webapp,SQL03@hr"),
            "SELECT 'x' FROM t",
            Strategy::OpenQuery,
        )
        .unwrap();
        assert_eq!(
            compiled,
            "SELECT * FROM OPENQUERY([SQL02], \
             'EXECUTE AS LOGIN = ''webapp''; SELECT * FROM OPENQUERY([SQL03], \
             ''USE [hr]; SELECT ''''x'''' FROM t;'')')"
        );
    }

    #[test]
    fn test_openquery_three_hops() {
        let compiled = compile(&chain("A,B,C"), "SELECT 'v';", Strategy::OpenQuery).unwrap();
        assert_eq!(
            compiled,
            "SELECT * FROM OPENQUERY([A], 'SELECT * FROM OPENQUERY([B], ''SELECT * FROM OPENQUERY([C], ''''SELECT ''''''''v'''''''';'''')'')')"
        );
    }

    #[test]
    fn test_rpc_single_hop() {
        let compiled = compile(&chain("SQL02"), "SELECT 'a';;", Strategy::Rpc).unwrap();
        assert_eq!(compiled, "EXEC ('SELECT ''a'';') AT [SQL02]");
    }

    #[test]
    fn test_rpc_impersonation_belongs_to_outer_hop() {
        let compiled = compile(&chain("SQL02/webapp,SQL03"), "SELECT 1;", Strategy::Rpc).unwrap();
        assert_eq!(
            compiled,
            "EXEC ('EXECUTE AS LOGIN = ''webapp''; EXEC (''SELECT 1;'') AT [SQL03];') AT [SQL02]"
        );
        assert!(compiled.ends_with("AT [SQL02]"));
    }

    #[test]
    fn test_rpc_skips_master_database() {
        let compiled = compile(&chain("SQL02@master,SQL03@msdb"), "SELECT 1", Strategy::Rpc).unwrap();
        assert_eq!(
            compiled,
            "EXEC ('EXEC (''USE [msdb]; SELECT 1;'') AT [SQL03];') AT [SQL02]"
        );
    }

    #[test]
    fn test_identifiers_are_escaped() {
        let mut hops = ServerChain::new();
        hops.push(Server::new("we]ird").impersonating("o'brien"));
        let compiled = compile(&hops, "SELECT 1", Strategy::Rpc).unwrap();
        assert_eq!(
            compiled,
            "EXEC ('EXECUTE AS LOGIN = ''o''''brien''; SELECT 1;') AT [we]]ird]"
        );
    }

    fn hop_names() -> impl proptest::strategy::Strategy<Value = Vec<String>> {
        proptest::collection::vec("[A-Z][A-Z0-9]{0,6}", 1..5)
    }

    proptest! {
        #[test]
        fn prop_compiling_is_pure(names in hop_names(), column in "[a-z]{1,8}") {
            let chain = ServerChain::from_hops(names.iter().map(Server::new).collect());
            let statement = format!("SELECT {} FROM t WHERE c = 'x'", column);
            for strategy in [Strategy::Rpc, Strategy::OpenQuery] {
                let first = compile(&chain, &statement, strategy).unwrap();
                let second = compile(&chain, &statement, strategy).unwrap();
                prop_assert_eq!(first, second);
            }
        }

        #[test]
        fn prop_rpc_wraps_once_per_hop(names in hop_names()) {
            let chain = ServerChain::from_hops(names.iter().map(Server::new).collect());
            let compiled = rpc_chain(&chain, "SELECT 1").unwrap();
            prop_assert_eq!(compiled.matches("EXEC (").count(), names.len());

            // the innermost AT is the last hop, the outermost the first
            let first_at = compiled.find(") AT [").unwrap();
            let innermost = format!(") AT [{}]", names[names.len() - 1]);
            prop_assert!(compiled[first_at..].starts_with(&innermost));
            let outermost = format!(" AT [{}]", names[0]);
            prop_assert!(compiled.ends_with(&outermost));
        }

        #[test]
        fn prop_openquery_quote_runs_double(names in hop_names(), column in "[a-z]{1,8}") {
            let chain = ServerChain::from_hops(names.iter().map(Server::new).collect());
            let statement = format!("SELECT {} FROM t;", column);
            let compiled = openquery_chain(&chain, &statement).unwrap();
            prop_assert_eq!(compiled.matches("OPENQUERY(").count(), names.len());

            let expected = 1usize << (names.len() - 1);
            let at = compiled.find(&statement).unwrap();
            let before = compiled[..at].chars().rev().take_while(|c| *c == '\'').count();
            let after = compiled[at + statement.len()..].chars().take_while(|c| *c == '\'').count();
            prop_assert_eq!(before, expected);
            prop_assert_eq!(after, expected);
        }
    }
}
