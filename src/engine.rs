//! Execution context: one channel, one chain, one routing strategy.
//!
//! Every statement goes through [`Engine::run`], which compiles it for the
//! current chain, submits it and, when the failure is one it knows how to
//! recover from, adjusts the statement or strategy and tries again. All
//! recovery steps draw from one retry budget.

use std::collections::HashSet;
use std::sync::Arc;

use async_std::sync::Mutex;
use tracing::{debug, info, warn};

use crate::chain::ServerChain;
use crate::channel::{Cell, Channel, ChannelError, Request, Response, Shape, Table};
use crate::classify::{classify, ErrorKind};
use crate::compiler::{self, Strategy};
use crate::config::{ExecutionSettings, RpcMemory};
use crate::error::{Error, Result};
use crate::server::Server;
use crate::statement;

/// Destinations known to have RPC out disabled on their link.
///
/// Cloning shares the underlying set. Keys are case-insensitive.
#[derive(Debug, Clone, Default)]
pub struct RpcCache(Arc<parking_lot::Mutex<HashSet<String>>>);

impl RpcCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if the destination was not already known.
    pub fn mark(&self, destination: &str) -> bool {
        self.0.lock().insert(destination.to_lowercase())
    }

    pub fn contains(&self, destination: &str) -> bool {
        self.0.lock().contains(&destination.to_lowercase())
    }

    pub fn len(&self) -> usize {
        self.0.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.lock().is_empty()
    }
}

struct Outcome {
    response: Response,
    rewrapped: bool,
}

pub struct Engine {
    pub(crate) channel: Arc<Mutex<Box<dyn Channel>>>,
    /// The directly connected server.
    pub(crate) server: Server,
    pub(crate) chain: ServerChain,
    pub(crate) strategy: Strategy,
    pub(crate) rpc_cache: RpcCache,
    pub(crate) settings: ExecutionSettings,
    /// Final hop as it describes itself, filled in by the resolver.
    pub(crate) target: Option<Server>,
}

impl Engine {
    pub fn new(channel: Box<dyn Channel>, server: Server, settings: ExecutionSettings) -> Self {
        Self {
            channel: Arc::new(Mutex::new(channel)),
            server,
            chain: ServerChain::new(),
            strategy: Strategy::default(),
            rpc_cache: RpcCache::new(),
            settings,
            target: None,
        }
    }

    pub fn server(&self) -> &Server {
        &self.server
    }

    pub fn chain(&self) -> &ServerChain {
        &self.chain
    }

    pub fn settings(&self) -> &ExecutionSettings {
        &self.settings
    }

    pub fn rpc_cache(&self) -> &RpcCache {
        &self.rpc_cache
    }

    /// Where statements end up: the resolved final hop, the unresolved final
    /// hop, or the direct connection when there is no chain.
    pub fn target(&self) -> &Server {
        self.target
            .as_ref()
            .or_else(|| self.chain.destination())
            .unwrap_or(&self.server)
    }

    pub fn set_chain(&mut self, chain: ServerChain) {
        info!(chain = %chain, hops = chain.len(), "using linked server chain");
        self.chain = chain;
        self.reset_routing();
    }

    pub fn add_to_chain(&mut self, server: Server) {
        info!(hop = %server, "appending linked server");
        self.chain.push(server);
        self.reset_routing();
    }

    pub fn clear_chain(&mut self) {
        self.chain.clear();
        self.reset_routing();
    }

    fn reset_routing(&mut self) {
        self.strategy = Strategy::default();
        self.target = None;
    }

    /// Set the session's strategy. A destination already in the RPC cache
    /// keeps compiling with [`Strategy::OpenQuery`] whatever is set here;
    /// the engine itself only ever moves from [`Strategy::Rpc`] to
    /// [`Strategy::OpenQuery`].
    pub fn set_strategy(&mut self, strategy: Strategy) {
        self.strategy = strategy;
    }

    /// The strategy the next statement will be compiled with.
    pub fn strategy(&self) -> Strategy {
        if self.strategy == Strategy::OpenQuery
            || self
                .destination_keys()
                .iter()
                .any(|key| self.rpc_cache.contains(key))
        {
            Strategy::OpenQuery
        } else {
            Strategy::Rpc
        }
    }

    /// The exact text that would be sent for `statement` right now.
    pub fn compile(&self, statement: &str) -> Result<String> {
        self.compile_with(statement, self.strategy())
    }

    fn compile_with(&self, statement: &str, strategy: Strategy) -> Result<String> {
        if self.chain.is_empty() {
            return Ok(statement.to_string());
        }
        compiler::compile(&self.chain, statement, strategy)
    }

    fn destination_name(&self) -> String {
        self.chain
            .destination()
            .map(|hop| hop.routing_name().to_string())
            .unwrap_or_else(|| self.server.hostname.clone())
    }

    /// Names the RPC cache knows the destination by: its alias and, once
    /// resolved, its self-reported hostname.
    fn destination_keys(&self) -> Vec<String> {
        let mut keys = Vec::new();
        if let Some(hop) = self.chain.destination() {
            keys.push(hop.routing_name().to_string());
        }
        if let Some(target) = &self.target {
            keys.push(target.hostname.clone());
        }
        keys
    }

    fn downgrade(&mut self) {
        self.strategy = Strategy::OpenQuery;
        let mut fresh = false;
        for key in self.destination_keys() {
            fresh |= self.rpc_cache.mark(&key);
        }
        if fresh {
            warn!(
                destination = %self.destination_name(),
                "RPC out is not enabled on the chain, falling back to OPENQUERY"
            );
        } else {
            debug!(destination = %self.destination_name(), "RPC already known unavailable");
        }
    }

    pub async fn execute_rows(&mut self, statement: &str) -> Result<Table> {
        let outcome = self.run(statement, Shape::Rows).await?;
        Ok(match outcome.response {
            Response::Rows(table) => table,
            Response::Affected(_) => Table::default(),
        })
    }

    /// First column of the first row; `None` when there is no row or the
    /// value is NULL.
    pub async fn execute_scalar(&mut self, statement: &str) -> Result<Option<Cell>> {
        let outcome = self.run(statement, Shape::Scalar).await?;
        Ok(match outcome.response {
            Response::Rows(table) => table.first().filter(|cell| !cell.is_null()).cloned(),
            Response::Affected(_) => None,
        })
    }

    pub async fn execute_non_query(&mut self, statement: &str) -> Result<u64> {
        let outcome = self.run(statement, Shape::Affected).await?;
        Ok(match outcome.response {
            Response::Affected(count) => count,
            Response::Rows(table) if outcome.rewrapped => table
                .get(0, "Result")
                .and_then(Cell::as_i64)
                .map_or(0, |count| count.max(0) as u64),
            Response::Rows(table) => table.rows.len() as u64,
        })
    }

    async fn submit(&self, request: Request<'_>) -> std::result::Result<Response, ChannelError> {
        let mut channel = self.channel.lock().await;
        channel.submit(request).await
    }

    async fn run(&mut self, statement: &str, shape: Shape) -> Result<Outcome> {
        if statement.trim().is_empty() {
            return Err(Error::EmptyStatement);
        }

        let mut statement = statement.to_string();
        let mut shape = shape;
        let mut rewrapped = false;
        let mut timeout = self.settings.timeout();
        let mut retries: u32 = 0;

        loop {
            let strategy = self.strategy();
            let linked = !self.chain.is_empty();

            if linked && strategy == Strategy::OpenQuery && statement::requires_rpc(&statement) {
                return Err(Error::RpcRequired {
                    destination: self.destination_name(),
                });
            }

            let compiled = self.compile_with(&statement, strategy)?;
            debug!(?strategy, timeout_secs = timeout.as_secs(), "submitting: {}", compiled);

            let err = match self
                .submit(Request {
                    statement: &compiled,
                    shape,
                    timeout,
                })
                .await
            {
                Ok(response) => {
                    if rewrapped {
                        check_rewrapped(&response)?;
                    }
                    return Ok(Outcome {
                        response,
                        rewrapped,
                    });
                }
                Err(err) => err,
            };

            match classify(&err) {
                ErrorKind::Timeout => {
                    timeout *= 2;
                    warn!(
                        attempt = retries + 1,
                        next_timeout_secs = timeout.as_secs(),
                        "statement timed out"
                    );
                }
                ErrorKind::RpcUnavailable if linked && strategy == Strategy::Rpc => {
                    self.downgrade();
                }
                ErrorKind::NoRowset if linked && strategy == Strategy::OpenQuery => {
                    if statement::is_rewrapped(&statement) || statement::is_data_select(&statement)
                    {
                        return Err(Error::NoRowset {
                            hop: self.destination_name(),
                            message: err.message,
                        });
                    }
                    warn!("statement returned no rowset, rewrapping to produce one");
                    statement = statement::rewrap_nonquery(&statement);
                    shape = Shape::Rows;
                    rewrapped = true;
                }
                ErrorKind::UnsupportedDatabasePrefix if linked => {
                    let stripped = statement::strip_database_prefix(&statement);
                    if stripped == statement {
                        return Err(err.into());
                    }
                    debug!("remote rejected database prefix, retrying without it");
                    statement = stripped;
                }
                ErrorKind::HopUnreachable if linked => {
                    return Err(Error::HopUnreachable {
                        hop: self.destination_name(),
                        message: err.message,
                    });
                }
                ErrorKind::UnknownLinkedServer if linked => {
                    return Err(Error::UnknownLinkedServer {
                        hop: self.destination_name(),
                        message: err.message,
                    });
                }
                kind => {
                    debug!(?kind, code = ?err.code, "statement failed: {}", err);
                    return Err(err.into());
                }
            }

            retries += 1;
            if retries >= self.settings.max_retries {
                warn!(attempts = retries, "giving up: {}", err);
                return Err(Error::RetriesExhausted {
                    attempts: retries,
                    source: err,
                });
            }
        }
    }

    /// A new context on a fresh connection with the same credentials and a
    /// deep copy of the chain. Routing starts over at [`Strategy::Rpc`];
    /// whether known RPC failures carry over follows
    /// [`ExecutionSettings::rpc_memory`].
    pub async fn duplicate_independent(&self) -> Result<Engine> {
        let channel = {
            let current = self.channel.lock().await;
            current.reopen().await?
        };
        let rpc_cache = match self.settings.rpc_memory {
            RpcMemory::PerContext => RpcCache::new(),
            RpcMemory::Shared => self.rpc_cache.clone(),
        };
        Ok(Engine {
            channel: Arc::new(Mutex::new(channel)),
            server: self.server.clone(),
            chain: self.chain.clone(),
            strategy: Strategy::default(),
            rpc_cache,
            settings: self.settings.clone(),
            target: self.target.clone(),
        })
    }

    /// A new context on the *same* connection with its own copy of the chain.
    ///
    /// Session state is shared: an `EXECUTE AS`, `USE` or open transaction
    /// issued through one handle is in effect for the other. Statements from
    /// both handles are serialized on the one connection.
    pub fn share_channel(&self) -> Engine {
        Engine {
            channel: Arc::clone(&self.channel),
            server: self.server.clone(),
            chain: self.chain.clone(),
            strategy: self.strategy,
            rpc_cache: self.rpc_cache.clone(),
            settings: self.settings.clone(),
            target: self.target.clone(),
        }
    }

    /// Close the connection unless another handle still shares it.
    pub async fn close(self) -> Result<()> {
        match Arc::try_unwrap(self.channel) {
            Ok(channel) => {
                let mut channel = channel.into_inner();
                channel.close().await?;
                Ok(())
            }
            Err(_) => {
                debug!("connection still shared, leaving it open");
                Ok(())
            }
        }
    }
}

/// Surface the error a rewrapped statement caught on the remote side.
fn check_rewrapped(response: &Response) -> Result<()> {
    if let Response::Rows(table) = response {
        if let Some(Cell::Text(message)) = table.get(0, "Error") {
            return Err(Error::Remote(message.clone()));
        }
    }
    Ok(())
}
