//! [`Channel`] over a real TDS connection.

use std::fmt;

use async_std::net::TcpStream;
use async_trait::async_trait;
use tiberius::{AuthMethod, Client, ColumnData, Config as TdsConfig, Row};
use tracing::{debug, info, warn};

use crate::channel::{Cell, Channel, ChannelError, Request, Response, Shape, Table};
use crate::config::{AuthConfig, ConnectionConfig};
use crate::error::{Error, Result};

/// Everything needed to open a connection, so one can be reopened later.
#[derive(Clone)]
pub struct TdsConnector {
    config: TdsConfig,
    host: String,
    port: u16,
}

impl fmt::Debug for TdsConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TdsConnector")
            .field("host", &self.host)
            .field("port", &self.port)
            .finish()
    }
}

impl TdsConnector {
    pub fn new(connection: &ConnectionConfig) -> Result<Self> {
        let host = connection
            .host
            .clone()
            .filter(|h| !h.trim().is_empty())
            .ok_or_else(|| Error::Config("no host to connect to".into()))?;

        let mut config = TdsConfig::new();
        config.host(&host);
        config.port(connection.port);
        config.database(&connection.database);
        if connection.trust_cert {
            config.trust_cert();
        }

        match &connection.auth {
            AuthConfig::Integrated => config.authentication(AuthMethod::Integrated),
            AuthConfig::Sql { username, password } => config.authentication(
                AuthMethod::sql_server(username, password.as_deref().unwrap_or_default()),
            ),
        }

        Ok(Self {
            config,
            host,
            port: connection.port,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub async fn connect(&self) -> std::result::Result<TdsChannel, ChannelError> {
        let client = self.open().await?;
        Ok(TdsChannel {
            connector: self.clone(),
            client: Some(client),
        })
    }

    async fn open(&self) -> std::result::Result<Client<TcpStream>, ChannelError> {
        debug!(host = %self.host, port = self.port, "opening connection");
        let tcp = self.tcp(&self.config).await?;
        match Client::connect(self.config.clone(), tcp).await {
            Ok(client) => Ok(client),
            // Azure gateways hand the login over to another node.
            Err(tiberius::error::Error::Routing { host, port }) => {
                info!(%host, port, "server redirected the connection");
                let mut config = self.config.clone();
                config.host(&host);
                config.port(port);
                let tcp = self.tcp(&config).await?;
                Client::connect(config, tcp).await.map_err(local)
            }
            Err(e) => Err(local(e)),
        }
    }

    async fn tcp(&self, config: &TdsConfig) -> std::result::Result<TcpStream, ChannelError> {
        let addr = config.get_addr();
        let tcp = TcpStream::connect(&addr)
            .await
            .map_err(|e| ChannelError::local(format!("connecting to {}: {}", addr, e)))?;
        tcp.set_nodelay(true)
            .map_err(|e| ChannelError::local(e.to_string()))?;
        Ok(tcp)
    }
}

pub struct TdsChannel {
    connector: TdsConnector,
    /// `None` after a timeout left the connection in an unknown state.
    client: Option<Client<TcpStream>>,
}

impl TdsChannel {
    async fn client(&mut self) -> std::result::Result<&mut Client<TcpStream>, ChannelError> {
        let client = match self.client.take() {
            Some(client) => client,
            None => {
                warn!(host = %self.connector.host, "reconnecting, session state was lost");
                self.connector.open().await?
            }
        };
        Ok(self.client.insert(client))
    }
}

#[async_trait]
impl Channel for TdsChannel {
    async fn submit(
        &mut self,
        request: Request<'_>,
    ) -> std::result::Result<Response, ChannelError> {
        let client = self.client().await?;
        let outcome = async_std::future::timeout(
            request.timeout,
            run(client, request.statement, request.shape),
        )
        .await;

        match outcome {
            Ok(result) => result,
            Err(_) => {
                // The server may still be streaming; the connection is unusable.
                self.client = None;
                Err(ChannelError::timed_out(request.timeout.as_secs()))
            }
        }
    }

    async fn reopen(&self) -> std::result::Result<Box<dyn Channel>, ChannelError> {
        Ok(Box::new(self.connector.connect().await?))
    }

    async fn close(&mut self) -> std::result::Result<(), ChannelError> {
        if let Some(client) = self.client.take() {
            client.close().await.map_err(from_tiberius)?;
        }
        Ok(())
    }
}

async fn run(
    client: &mut Client<TcpStream>,
    statement: &str,
    shape: Shape,
) -> std::result::Result<Response, ChannelError> {
    match shape {
        Shape::Affected => {
            let result = client.execute(statement, &[]).await.map_err(from_tiberius)?;
            Ok(Response::Affected(result.total()))
        }
        Shape::Rows | Shape::Scalar => {
            let mut stream = client.simple_query(statement).await.map_err(from_tiberius)?;
            let columns: Vec<String> = stream
                .columns()
                .await
                .map_err(from_tiberius)?
                .map(|columns| columns.iter().map(|c| c.name().to_string()).collect())
                .unwrap_or_default();
            let rows: Vec<Row> = stream.into_first_result().await.map_err(from_tiberius)?;

            let limit = if shape == Shape::Scalar { 1 } else { rows.len() };
            let rows = rows.into_iter().take(limit).map(convert_row).collect();
            Ok(Response::Rows(Table::new(columns, rows)))
        }
    }
}

fn from_tiberius(err: tiberius::error::Error) -> ChannelError {
    match err {
        tiberius::error::Error::Server(token) => {
            ChannelError::with_code(token.code(), token.message())
        }
        other => ChannelError::new(other.to_string()),
    }
}

/// Failures while connecting belong to the client's own connection.
fn local(err: tiberius::error::Error) -> ChannelError {
    ChannelError {
        local: true,
        ..from_tiberius(err)
    }
}

fn convert_row(row: Row) -> Vec<Cell> {
    row.into_iter().map(convert_cell).collect()
}

fn convert_cell(data: ColumnData<'static>) -> Cell {
    match data {
        ColumnData::U8(v) => v.map_or(Cell::Null, |v| Cell::Int(v.into())),
        ColumnData::I16(v) => v.map_or(Cell::Null, |v| Cell::Int(v.into())),
        ColumnData::I32(v) => v.map_or(Cell::Null, |v| Cell::Int(v.into())),
        ColumnData::I64(v) => v.map_or(Cell::Null, Cell::Int),
        ColumnData::F32(v) => v.map_or(Cell::Null, |v| Cell::Float(v.into())),
        ColumnData::F64(v) => v.map_or(Cell::Null, Cell::Float),
        ColumnData::Bit(v) => v.map_or(Cell::Null, Cell::Bool),
        ColumnData::String(v) => v.map_or(Cell::Null, |s| Cell::Text(s.into_owned())),
        ColumnData::Guid(v) => v.map_or(Cell::Null, |g| Cell::Text(g.to_string())),
        ColumnData::Binary(v) => v.map_or(Cell::Null, |b| Cell::Binary(b.into_owned())),
        ColumnData::Numeric(v) => v.map_or(Cell::Null, |n| Cell::Text(n.to_string())),
        other => Cell::Text(format!("{:?}", other)),
    }
}

#[cfg(test)]
mod tests {
    use std::borrow::Cow;

    use super::*;

    #[test]
    fn test_convert_cells() {
        assert_eq!(convert_cell(ColumnData::I32(Some(7))), Cell::Int(7));
        assert_eq!(convert_cell(ColumnData::I32(None)), Cell::Null);
        assert_eq!(convert_cell(ColumnData::Bit(Some(true))), Cell::Bool(true));
        assert_eq!(
            convert_cell(ColumnData::String(Some(Cow::Borrowed("sa")))),
            Cell::Text("sa".into())
        );
        assert_eq!(convert_cell(ColumnData::String(None)), Cell::Null);
        assert_eq!(
            convert_cell(ColumnData::Binary(Some(Cow::Owned(vec![1, 2])))),
            Cell::Binary(vec![1, 2])
        );
    }

    #[test]
    fn test_connector_needs_host() {
        let connection = ConnectionConfig::default();
        assert!(matches!(TdsConnector::new(&connection), Err(Error::Config(_))));
    }

    #[test]
    fn test_connector_from_config() {
        let connection = ConnectionConfig {
            host: Some("sql01.corp.local".into()),
            port: 14330,
            auth: AuthConfig::Sql {
                username: "sa".into(),
                password: Some("secret".into()),
            },
            ..ConnectionConfig::default()
        };
        let connector = TdsConnector::new(&connection).unwrap();
        assert_eq!(connector.host(), "sql01.corp.local");
        assert_eq!(connector.port(), 14330);
        assert!(!format!("{:?}", connector).contains("secret"));
    }
}
