//! Linked-server aware query routing for SQL Server.
//!
//! A statement submitted to an [`Engine`] is compiled against the current
//! [`ServerChain`] into either a chain of `EXEC (...) AT [hop]` calls or a
//! nested `OPENQUERY` wrap, executed over a [`Channel`], and retried through
//! a small recovery state machine when a hop rejects it.

pub mod actions;
pub mod chain;
pub mod channel;
pub mod classify;
pub mod compiler;
pub mod config;
pub mod engine;
pub mod error;
pub mod resolver;
pub mod server;
pub mod statement;
pub mod tds;

pub use chain::ServerChain;
pub use channel::{Cell, Channel, ChannelError, Request, Response, Shape, Table};
pub use classify::{classify, ErrorKind};
pub use compiler::Strategy;
pub use config::{AuthConfig, Config, ConnectionConfig, ExecutionSettings, RpcMemory};
pub use engine::{Engine, RpcCache};
pub use error::{Error, Result};
pub use server::Server;
pub use tds::{TdsChannel, TdsConnector};
