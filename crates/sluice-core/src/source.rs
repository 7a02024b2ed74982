//! The upstream source contract.

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::Error;
use crate::types::{Column, Row};

/// A lazy stream of rows from a source table.
pub type RowStream = BoxStream<'static, Result<Row, Error>>;

/// A lazy stream of row chunks, as produced by a cursored query.
pub type ChunkStream = BoxStream<'static, Result<Vec<Row>, Error>>;

/// A system rows are migrated out of (PostgreSQL, or another destination
/// instance acting as a source).
///
/// Implementations share one connection pool for the lifetime of the
/// process; every query checks a connection out for its own lifetime.
#[async_trait]
pub trait Source: Send + Sync {
    /// The source-specific textual reference for a table.
    fn get_identifier(&self, table: &str, schema: Option<&str>) -> String;

    /// List the tables available in this source.
    async fn get_tables(&self) -> Result<Vec<String>, Error>;

    /// Describe the columns of the given table.
    async fn get_columns(&self, table: &str) -> Result<Vec<Column>, Error>;

    /// Run a query, yielding chunks of rows as the cursor advances.
    async fn query(&self, query: &str) -> Result<ChunkStream, Error>;

    /// Stream the full contents of the given table.
    async fn retrieve(&self, table: &str) -> Result<RowStream, Error>;

    /// Run a statement, discarding any results.
    async fn execute(&self, query: &str) -> Result<(), Error>;

    /// Close the source, releasing its connection pool.
    async fn close(&self) -> Result<(), Error>;
}
