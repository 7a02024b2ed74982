//! BlazingDB HTTP connector and the destination/source adapters over it.

use std::sync::Arc;

use async_trait::async_trait;
use futures::{stream, StreamExt};
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::Semaphore;
use tracing::{debug, info};

use sluice_core::{
    parse_cell, Cell, ChunkStream, Column, ColumnType, Destination, Error, QueryResult, Row,
    RowStream, Source,
};

/// The transient notice the server returns while it is restarting; queries
/// hitting it are classified separately so a retry stage can treat them as
/// retriable.
pub const SERVER_RESTART_ERROR: &str =
    "The BlazingDB server is restarting please try again in a moment.";

pub const DEFAULT_REQUEST_LIMIT: usize = 5;
pub const DEFAULT_SEPARATOR: &str = "$";

fn transport_err(err: reqwest::Error) -> Error {
    Error::Request(err.to_string())
}

/// Connection options for a BlazingDB instance.
#[derive(Debug, Clone)]
pub struct BlazingConfig {
    pub host: String,
    /// Defaults to 8443 over https and 8080 over http.
    pub port: Option<u16>,
    pub https: bool,
    pub user: String,
    pub password: String,
    pub database: Option<String>,
    /// Concurrent HTTP requests allowed against the instance.
    pub request_limit: usize,
}

impl BlazingConfig {
    pub fn new(
        host: impl Into<String>,
        user: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port: None,
            https: true,
            user: user.into(),
            password: password.into(),
            database: None,
            request_limit: DEFAULT_REQUEST_LIMIT,
        }
    }

    pub fn with_port(mut self, port: Option<u16>) -> Self {
        self.port = port;
        self
    }

    pub fn with_https(mut self, https: bool) -> Self {
        self.https = https;
        self
    }

    pub fn with_database(mut self, database: Option<String>) -> Self {
        self.database = database;
        self
    }

    pub fn with_request_limit(mut self, request_limit: usize) -> Self {
        self.request_limit = request_limit;
        self
    }

    fn base_url(&self) -> String {
        let protocol = if self.https { "https" } else { "http" };
        let port = self.port.unwrap_or(if self.https { 8443 } else { 8080 });

        format!("{}://{}:{}", protocol, self.host, port)
    }
}

/// The raw response shape of a `get-results` call.
#[derive(Debug, Clone, Deserialize)]
pub struct BlazingResponse {
    pub status: String,
    #[serde(default)]
    pub rows: Option<Value>,
    #[serde(default, rename = "columnTypes")]
    pub column_types: Option<Vec<String>>,
}

/// Handles registering with and querying a BlazingDB instance.
///
/// Fetching results invalidates the login token server-side, so every query
/// registers a fresh session for its query-and-fetch pair.
pub struct BlazingConnector {
    client: Client,
    base_url: String,
    user: String,
    password: String,
    database: Option<String>,
    semaphore: Semaphore,
}

impl BlazingConnector {
    pub fn new(config: BlazingConfig) -> Result<Self, Error> {
        let client = Client::builder()
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(transport_err)?;

        let base_url = config.base_url();
        info!("destination base url: {}", base_url);

        Ok(Self {
            client,
            base_url,
            user: config.user,
            password: config.password,
            database: config.database,
            semaphore: Semaphore::new(config.request_limit.max(1)),
        })
    }

    fn build_url(&self, path: &str) -> String {
        format!("{}/blazing-jdbc/{}", self.base_url, path)
    }

    async fn perform_request(
        &self,
        path: &str,
        form: &[(&str, &str)],
    ) -> Result<reqwest::Response, Error> {
        let url = self.build_url(path);
        debug!("performing request to the destination: {}", url);

        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| Error::NotConnected)?;

        let response = self
            .client
            .post(&url)
            .form(form)
            .send()
            .await
            .map_err(transport_err)?;

        if !response.status().is_success() {
            return Err(Error::Request(format!(
                "destination returned {} for {}",
                response.status(),
                path
            )));
        }

        Ok(response)
    }

    async fn perform_register(&self) -> Result<String, Error> {
        self.perform_request(
            "register",
            &[("username", &self.user), ("password", &self.password)],
        )
        .await?
        .text()
        .await
        .map_err(transport_err)
    }

    async fn perform_query(&self, query: &str, token: &str) -> Result<String, Error> {
        let lowered = query.to_lowercase();

        self.perform_request(
            "query",
            &[
                ("username", &self.user),
                ("query", &lowered),
                ("token", token),
            ],
        )
        .await?
        .text()
        .await
        .map_err(transport_err)
    }

    async fn perform_get_results(
        &self,
        result_token: &str,
        login_token: &str,
    ) -> Result<BlazingResponse, Error> {
        self.perform_request(
            "get-results",
            &[("resultSetToken", result_token), ("token", login_token)],
        )
        .await?
        .json::<BlazingResponse>()
        .await
        .map_err(|err| Error::Request(format!("could not parse destination response: {}", err)))
    }

    async fn connect(&self) -> Result<String, Error> {
        let token = self.perform_register().await?;
        if token == "fail" {
            return Err(Error::ConnectionFailed);
        }

        debug!("retrieved login token");

        if let Some(database) = &self.database {
            self.perform_query(&format!("USE DATABASE {}", database), &token)
                .await?;
        }

        Ok(token)
    }

    /// Run one query-and-fetch pair against the instance.
    pub async fn query(&self, query: &str) -> Result<BlazingResponse, Error> {
        let login_token = self.connect().await?;

        let result_token = self.perform_query(query, &login_token).await?;
        if result_token == "fail" {
            return Err(Error::Query {
                query: query.to_string(),
                response: None,
            });
        }

        let response = self
            .perform_get_results(&result_token, &login_token)
            .await?;

        if response.status == "fail" {
            return Err(classify_failure(query, &response));
        }

        Ok(response)
    }
}

/// Distinguish the known transient and warning shapes from plain failures.
fn classify_failure(query: &str, response: &BlazingResponse) -> Error {
    let message = single_cell_message(response);

    if let Some(message) = &message {
        if message == SERVER_RESTART_ERROR {
            return Error::ServerRestart {
                query: query.to_string(),
            };
        }

        if query.starts_with("load data") && message.to_lowercase().contains("warning") {
            return Error::ImportWarning {
                query: query.to_string(),
            };
        }
    }

    Error::Query {
        query: query.to_string(),
        response: message,
    }
}

/// A failure payload is either a bare string or a single-cell row set.
fn single_cell_message(response: &BlazingResponse) -> Option<String> {
    match response.rows.as_ref()? {
        Value::String(message) => Some(message.clone()),
        Value::Array(rows) => {
            if rows.len() != 1 {
                return None;
            }

            match &rows[0] {
                Value::String(message) => Some(message.clone()),
                Value::Array(cells) if cells.len() == 1 => {
                    cells[0].as_str().map(str::to_string)
                }
                _ => None,
            }
        }
        _ => None,
    }
}

/// Map a destination datatype name onto the shared type system.
fn convert_datatype(datatype: &str) -> ColumnType {
    match datatype.to_lowercase().as_str() {
        "bool" => ColumnType::Bool,
        "date" | "datetime" => ColumnType::Date,
        "float" | "double" => ColumnType::Float,
        "char" | "short" | "int" | "long" => ColumnType::Long,
        "string" => ColumnType::String,
        other => {
            debug!("unknown destination type '{}', treating as string", other);
            ColumnType::String
        }
    }
}

fn convert_value(value: &Value, ty: Option<ColumnType>) -> Cell {
    match value {
        Value::Null => Cell::Null,
        Value::Bool(flag) => Cell::Bool(*flag),
        Value::Number(number) => {
            if ty == Some(ColumnType::Float) {
                Cell::Float(number.as_f64().unwrap_or_default())
            } else if let Some(integral) = number.as_i64() {
                Cell::Long(integral)
            } else {
                Cell::Float(number.as_f64().unwrap_or_default())
            }
        }
        Value::String(text) => match ty {
            Some(ty) if ty != ColumnType::String => {
                parse_cell(ty, text).unwrap_or_else(|_| Cell::Text(text.clone()))
            }
            _ => Cell::Text(text.clone()),
        },
        other => Cell::Text(other.to_string()),
    }
}

fn to_query_result(response: BlazingResponse) -> QueryResult {
    let column_types: Option<Vec<ColumnType>> = response.column_types.as_ref().map(|types| {
        types
            .iter()
            .map(|datatype| convert_datatype(datatype))
            .collect()
    });

    let rows = match response.rows {
        Some(Value::Array(rows)) => rows
            .iter()
            .map(|row| match row {
                Value::Array(cells) => cells
                    .iter()
                    .enumerate()
                    .map(|(index, cell)| {
                        let ty = column_types
                            .as_ref()
                            .and_then(|types| types.get(index))
                            .copied();
                        convert_value(cell, ty)
                    })
                    .collect(),
                other => vec![convert_value(other, None)],
            })
            .collect(),
        _ => Vec::new(),
    };

    QueryResult { rows, column_types }
}

fn join_identifier(separator: &str, schema: &str, table: &str) -> String {
    [schema, table].join(separator)
}

/// BlazingDB as the migration destination.
pub struct BlazingDestination {
    connector: Arc<BlazingConnector>,
    schema: String,
    separator: String,
}

impl BlazingDestination {
    pub fn new(connector: Arc<BlazingConnector>, schema: impl Into<String>) -> Self {
        Self {
            connector,
            schema: schema.into(),
            separator: DEFAULT_SEPARATOR.to_string(),
        }
    }

    pub fn with_separator(mut self, separator: impl Into<String>) -> Self {
        self.separator = separator.into();
        self
    }
}

#[async_trait]
impl Destination for BlazingDestination {
    fn get_identifier(&self, table: &str, schema: Option<&str>) -> String {
        join_identifier(&self.separator, schema.unwrap_or(&self.schema), table)
    }

    async fn query(&self, query: &str) -> Result<QueryResult, Error> {
        let response = self.connector.query(query).await?;
        Ok(to_query_result(response))
    }

    async fn get_columns(&self, table: &str) -> Result<Vec<Column>, Error> {
        let identifier = self.get_identifier(table, None);
        let result = self
            .query(&format!("DESCRIBE TABLE {}", identifier))
            .await?;

        let columns = describe_columns(&result.rows);
        if columns.is_empty() {
            return Err(Error::Query {
                query: format!("DESCRIBE TABLE {}", identifier),
                response: Some("table has no columns".to_string()),
            });
        }

        Ok(columns)
    }

    async fn close(&self) {
        debug!("closing destination session");
    }
}

/// BlazingDB acting as the upstream source of a migration.
pub struct BlazingSource {
    connector: Arc<BlazingConnector>,
    schema: String,
    separator: String,
}

impl BlazingSource {
    pub fn new(connector: Arc<BlazingConnector>, schema: impl Into<String>) -> Self {
        Self {
            connector,
            schema: schema.into(),
            separator: DEFAULT_SEPARATOR.to_string(),
        }
    }

    pub fn with_separator(mut self, separator: impl Into<String>) -> Self {
        self.separator = separator.into();
        self
    }
}

#[async_trait]
impl Source for BlazingSource {
    fn get_identifier(&self, table: &str, schema: Option<&str>) -> String {
        join_identifier(&self.separator, schema.unwrap_or(&self.schema), table)
    }

    async fn get_tables(&self) -> Result<Vec<String>, Error> {
        let response = self.connector.query("LIST TABLES").await?;
        let result = to_query_result(response);

        let tables: Vec<String> = result
            .rows
            .iter()
            .filter_map(|row| match row.first() {
                Some(Cell::Text(table)) => Some(table.clone()),
                _ => None,
            })
            .collect();

        debug!("retrieved {} table(s) from the source", tables.len());
        Ok(tables)
    }

    async fn get_columns(&self, table: &str) -> Result<Vec<Column>, Error> {
        let identifier = self.get_identifier(table, None);
        let response = self
            .connector
            .query(&format!("DESCRIBE TABLE {}", identifier))
            .await?;

        let columns = describe_columns(&to_query_result(response).rows);
        if columns.is_empty() {
            return Err(Error::Query {
                query: format!("DESCRIBE TABLE {}", identifier),
                response: Some("table has no columns".to_string()),
            });
        }

        debug!(
            "retrieved {} column(s) for table {} from the source",
            columns.len(),
            table
        );

        Ok(columns)
    }

    async fn query(&self, query: &str) -> Result<ChunkStream, Error> {
        let response = self.connector.query(query).await?;
        let rows = to_query_result(response).rows;

        Ok(Box::pin(stream::iter(vec![Ok(rows)])))
    }

    async fn retrieve(&self, table: &str) -> Result<RowStream, Error> {
        let columns = self.get_columns(table).await?;
        let select_list = columns
            .iter()
            .map(|column| column.name.as_str())
            .collect::<Vec<_>>()
            .join(",");

        let chunks = self
            .query(&format!(
                "SELECT {} FROM {}",
                select_list,
                self.get_identifier(table, None)
            ))
            .await?;

        Ok(Box::pin(chunks.flat_map(|chunk| match chunk {
            Ok(rows) => stream::iter(rows.into_iter().map(Ok)).left_stream(),
            Err(err) => stream::iter(vec![Err(err)]).right_stream(),
        })))
    }

    async fn execute(&self, query: &str) -> Result<(), Error> {
        self.connector.query(query).await.map(|_| ())
    }

    async fn close(&self) -> Result<(), Error> {
        Ok(())
    }
}

/// Interpret `DESCRIBE TABLE` rows as (name, type, size) columns.
fn describe_columns(rows: &[Row]) -> Vec<Column> {
    rows.iter()
        .filter_map(|row| {
            let name = match row.first() {
                Some(Cell::Text(name)) => name.clone(),
                _ => return None,
            };

            let ty = match row.get(1) {
                Some(Cell::Text(datatype)) => convert_datatype(datatype),
                _ => ColumnType::String,
            };

            let size = match row.get(2) {
                Some(Cell::Long(size)) if *size > 0 => Some(*size as usize),
                Some(Cell::Text(size)) => size.parse().ok(),
                _ => None,
            };

            Some(Column::new(name, ty, size))
        })
        .collect()
}
