//! Sorts channel failures into the recovery classes the engine acts on.
//!
//! This is the only place that looks at provider message text. SQL Server
//! and the OLE DB / ODBC providers behind linked servers report most of
//! these conditions as free text, so the error number is used where one is
//! stable and the message otherwise.

use crate::channel::ChannelError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Timeout,
    /// A link does not have RPC out enabled.
    RpcUnavailable,
    /// OPENQUERY ran a statement that produced no columns.
    NoRowset,
    /// The remote provider rejected a `db.schema.object` name.
    UnsupportedDatabasePrefix,
    /// A linked server could not be contacted at all.
    HopUnreachable,
    /// A routing name is not in the predecessor's `sys.servers`.
    UnknownLinkedServer,
    Other,
}

const RPC_NOT_CONFIGURED: u32 = 7411;
const NO_COLUMNS: u32 = 7357;
const INVALID_SCHEMA_OR_CATALOG: u32 = 7312;
const SERVER_NOT_IN_SYS_SERVERS: u32 = 7202;
const CANNOT_INITIALIZE_DATA_SOURCE: u32 = 7303;

const UNREACHABLE_MARKERS: &[&str] = &[
    "tcp provider",
    "named pipes provider",
    "a network-related or instance-specific error",
    "login timeout expired",
    "sql server network interfaces",
    "server is not found or not accessible",
    "could not open a connection to sql server",
    "cannot initialize the data source object",
];

const TIMEOUT_MARKERS: &[&str] = &["timeout expired", "query timeout", "execution timeout"];

pub fn classify(err: &ChannelError) -> ErrorKind {
    let message = err.message.to_lowercase();
    let code = err.code;
    let has = |markers: &[&str]| markers.iter().any(|m| message.contains(m));

    // The client's own connection failing says nothing about any hop.
    if err.local {
        return ErrorKind::Other;
    }
    // Connectivity first: a login timeout on a hop is not worth retrying.
    if code == Some(CANNOT_INITIALIZE_DATA_SOURCE) || has(UNREACHABLE_MARKERS) {
        return ErrorKind::HopUnreachable;
    }
    if err.timed_out || has(TIMEOUT_MARKERS) {
        return ErrorKind::Timeout;
    }
    if code == Some(RPC_NOT_CONFIGURED) || message.contains("is not configured for rpc") {
        return ErrorKind::RpcUnavailable;
    }
    if code == Some(NO_COLUMNS) || message.contains("the object has no columns") {
        return ErrorKind::NoRowset;
    }
    if code == Some(INVALID_SCHEMA_OR_CATALOG)
        || message.contains("invalid use of schema or catalog")
    {
        return ErrorKind::UnsupportedDatabasePrefix;
    }
    if code == Some(SERVER_NOT_IN_SYS_SERVERS) || message.contains("in sys.servers") {
        return ErrorKind::UnknownLinkedServer;
    }
    ErrorKind::Other
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rpc_not_configured() {
        let err = ChannelError::new("Server 'SQL03' is not configured for RPC.");
        assert_eq!(classify(&err), ErrorKind::RpcUnavailable);
        assert_eq!(
            classify(&ChannelError::with_code(7411, "")),
            ErrorKind::RpcUnavailable
        );
    }

    #[test]
    fn test_no_rowset() {
        let err = ChannelError::new(
            "The OLE DB provider \"MSOLEDBSQL\" for linked server \"SQL02\" indicates that \
             either the object has no columns or the current user does not have permissions \
             on that object.",
        );
        assert_eq!(classify(&err), ErrorKind::NoRowset);
    }

    #[test]
    fn test_database_prefix() {
        let err = ChannelError::new(
            "Invalid use of schema or catalog for OLE DB provider \"MSDASQL\" for linked server \"PG\".",
        );
        assert_eq!(classify(&err), ErrorKind::UnsupportedDatabasePrefix);
    }

    #[test]
    fn test_login_timeout_is_connectivity() {
        let err = ChannelError::new(
            "OLE DB provider \"MSOLEDBSQL\" for linked server \"SQL03\" returned message \"Login timeout expired\".",
        );
        assert_eq!(classify(&err), ErrorKind::HopUnreachable);
    }

    #[test]
    fn test_local_transport_failure_is_not_a_hop() {
        let err = ChannelError::local("TCP Provider: Connection refused (os error 111)");
        assert_eq!(classify(&err), ErrorKind::Other);
        assert_eq!(
            classify(&ChannelError::new("TCP Provider: Connection refused (os error 111)")),
            ErrorKind::HopUnreachable
        );
    }

    #[test]
    fn test_timeouts() {
        assert_eq!(classify(&ChannelError::timed_out(120)), ErrorKind::Timeout);
        assert_eq!(
            classify(&ChannelError::new("Query timeout expired")),
            ErrorKind::Timeout
        );
    }

    #[test]
    fn test_unknown_server() {
        let err = ChannelError::with_code(
            7202,
            "Could not find server 'SQL09' in sys.servers. Verify that the correct server name was specified.",
        );
        assert_eq!(classify(&err), ErrorKind::UnknownLinkedServer);
    }

    #[test]
    fn test_everything_else() {
        let err = ChannelError::with_code(208, "Invalid object name 'nope'.");
        assert_eq!(classify(&err), ErrorKind::Other);
    }
}
