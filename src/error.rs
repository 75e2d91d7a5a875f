//! Errors surfaced to callers of the engine.
//!
//! Recovery happens inside [`crate::Engine`]; anything that reaches a caller
//! is already final and classified.

use crate::channel::ChannelError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    // ==================== Validation ====================
    #[error("statement is empty")]
    EmptyStatement,

    #[error("invalid server chain: {0}")]
    InvalidChain(String),

    /// The compiler was asked to route through a chain with no hops.
    #[error("cannot compile a linked statement for an empty chain")]
    EmptyChain,

    #[error("configuration error: {0}")]
    Config(String),

    // ==================== Routing ====================
    /// The statement needs `EXEC ... AT` but the chain is restricted to
    /// `OPENQUERY`.
    #[error("statement requires RPC but RPC is unavailable on the route to {destination}")]
    RpcRequired { destination: String },

    #[error(
        "{hop} returned no rowset: {message} (wrap the statement in a SELECT or enable RPC out on the link)"
    )]
    NoRowset { hop: String, message: String },

    // ==================== Destination ====================
    #[error("cannot reach linked server {hop}: {message}")]
    HopUnreachable { hop: String, message: String },

    #[error("linked server {hop} is not defined on its predecessor: {message}")]
    UnknownLinkedServer { hop: String, message: String },

    #[error("giving up after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: ChannelError,
    },

    /// Error text captured by a rewrapped statement's `Error` column.
    #[error("remote statement failed: {0}")]
    Remote(String),

    // ==================== System ====================
    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::Config(format!("TOML parse error: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::HopUnreachable {
            hop: "SQL03".into(),
            message: "TCP Provider: timeout".into(),
        };
        assert_eq!(
            err.to_string(),
            "cannot reach linked server SQL03: TCP Provider: timeout"
        );

        let err = Error::RpcRequired {
            destination: "SQL02".into(),
        };
        assert!(err.to_string().contains("SQL02"));
    }

    #[test]
    fn test_exhausted_keeps_source() {
        let err = Error::RetriesExhausted {
            attempts: 3,
            source: ChannelError::timed_out(120),
        };
        let source = std::error::Error::source(&err).expect("source");
        assert!(source.to_string().contains("120"));
    }
}
