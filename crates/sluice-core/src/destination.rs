//! The destination contract.

use async_trait::async_trait;

use crate::error::Error;
use crate::types::{Column, ColumnType, Row};

/// The rows and column types returned for a destination query.
#[derive(Debug, Clone, Default)]
pub struct QueryResult {
    pub rows: Vec<Row>,
    pub column_types: Option<Vec<ColumnType>>,
}

/// The columnar system ingest commands are issued against.
///
/// One destination session is shared across workers; implementations bound
/// their own transport concurrency.
#[async_trait]
pub trait Destination: Send + Sync {
    /// The destination-specific textual reference for a table.
    fn get_identifier(&self, table: &str, schema: Option<&str>) -> String;

    /// Run a query and fetch its results.
    async fn query(&self, query: &str) -> Result<QueryResult, Error>;

    /// Run a statement, discarding any results.
    async fn execute(&self, query: &str) -> Result<(), Error> {
        self.query(query).await.map(|_| ())
    }

    /// Describe the columns of an existing destination table.
    async fn get_columns(&self, table: &str) -> Result<Vec<Column>, Error>;

    /// Close the destination session.
    async fn close(&self);
}
