//! PostgreSQL source adapter.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use futures::{stream, StreamExt};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Column as _, Row as _, TypeInfo};
use tokio::sync::mpsc;
use tracing::{debug, info};

use sluice_core::{Cell, ChunkStream, Column, ColumnType, Error, Row, RowStream, Source};

/// Rows fetched per chunk when streaming a query.
pub const DEFAULT_FETCH_COUNT: usize = 20_000;

fn request_err(err: sqlx::Error) -> Error {
    Error::Request(err.to_string())
}

/// Streams tables out of a PostgreSQL schema through one shared connection
/// pool.
pub struct PostgresSource {
    pool: PgPool,
    schema: String,
    fetch_count: usize,
}

impl PostgresSource {
    /// Connect a new pool against the given connection string.
    pub async fn connect(connection_string: &str, schema: &str) -> Result<Self, Error> {
        info!("connecting to PostgreSQL...");

        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(connection_string)
            .await
            .map_err(request_err)?;

        info!("connected to PostgreSQL");
        Ok(Self::new(pool, schema))
    }

    pub fn new(pool: PgPool, schema: &str) -> Self {
        Self {
            pool,
            schema: schema.to_string(),
            fetch_count: DEFAULT_FETCH_COUNT,
        }
    }

    pub fn with_fetch_count(mut self, fetch_count: usize) -> Self {
        self.fetch_count = fetch_count.max(1);
        self
    }

    /// Stream a query's rows in fetch-count-sized chunks. The reader task
    /// checks a connection out of the pool for the cursor's lifetime and
    /// stops when the consumer drops the stream.
    fn stream_query(&self, query: String) -> ChunkStream {
        let pool = self.pool.clone();
        let fetch_count = self.fetch_count;
        let (tx, rx) = mpsc::channel::<Result<Vec<Row>, Error>>(2);

        tokio::spawn(async move {
            let mut rows = sqlx::query(&query).fetch(&pool);
            let mut chunk: Vec<Row> = Vec::with_capacity(fetch_count);

            while let Some(row) = rows.next().await {
                match row {
                    Ok(row) => {
                        chunk.push(decode_row(&row));

                        if chunk.len() >= fetch_count
                            && tx.send(Ok(std::mem::take(&mut chunk))).await.is_err()
                        {
                            return;
                        }
                    }
                    Err(err) => {
                        let _ = tx.send(Err(request_err(err))).await;
                        return;
                    }
                }
            }

            if !chunk.is_empty() {
                let _ = tx.send(Ok(chunk)).await;
            }
        });

        Box::pin(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        }))
    }
}

#[async_trait]
impl Source for PostgresSource {
    fn get_identifier(&self, table: &str, schema: Option<&str>) -> String {
        format!("{}.{}", schema.unwrap_or(&self.schema), table)
    }

    async fn get_tables(&self) -> Result<Vec<String>, Error> {
        let rows = sqlx::query(
            "SELECT DISTINCT table_name FROM information_schema.tables \
             WHERE table_schema = $1 AND table_type = 'BASE TABLE'",
        )
        .bind(&self.schema)
        .fetch_all(&self.pool)
        .await
        .map_err(request_err)?;

        let tables = rows
            .iter()
            .map(|row| row.try_get::<String, _>(0).map_err(request_err))
            .collect::<Result<Vec<String>, Error>>()?;

        debug!("retrieved {} table(s) from Postgres", tables.len());
        Ok(tables)
    }

    async fn get_columns(&self, table: &str) -> Result<Vec<Column>, Error> {
        let rows = sqlx::query(
            "SELECT column_name, data_type, character_maximum_length \
             FROM information_schema.columns \
             WHERE table_schema = $1 AND table_name = $2 \
             ORDER BY ordinal_position",
        )
        .bind(&self.schema)
        .bind(table)
        .fetch_all(&self.pool)
        .await
        .map_err(request_err)?;

        let columns = rows
            .iter()
            .map(|row| {
                let name: String = row.try_get(0).map_err(request_err)?;
                let data_type: String = row.try_get(1).map_err(request_err)?;
                let size: Option<i32> = row.try_get(2).map_err(request_err)?;

                Ok(Column::new(
                    name,
                    convert_datatype(&data_type),
                    size.map(|size| size as usize),
                ))
            })
            .collect::<Result<Vec<Column>, Error>>()?;

        if columns.is_empty() {
            return Err(Error::Query {
                query: format!("describe {}", self.get_identifier(table, None)),
                response: Some("table has no columns".to_string()),
            });
        }

        debug!(
            "retrieved {} column(s) for table {} from Postgres",
            columns.len(),
            table
        );

        Ok(columns)
    }

    async fn query(&self, query: &str) -> Result<ChunkStream, Error> {
        Ok(self.stream_query(query.to_string()))
    }

    async fn retrieve(&self, table: &str) -> Result<RowStream, Error> {
        let columns = self.get_columns(table).await?;
        let select_list = columns
            .iter()
            .map(|column| column.name.as_str())
            .collect::<Vec<_>>()
            .join(",");

        let query = format!(
            "SELECT {} FROM {}",
            select_list,
            self.get_identifier(table, None)
        );

        let chunks = self.stream_query(query);
        Ok(Box::pin(chunks.flat_map(|chunk| match chunk {
            Ok(rows) => stream::iter(rows.into_iter().map(Ok)).left_stream(),
            Err(err) => stream::iter(vec![Err(err)]).right_stream(),
        })))
    }

    async fn execute(&self, query: &str) -> Result<(), Error> {
        sqlx::query(query)
            .execute(&self.pool)
            .await
            .map_err(request_err)?;

        Ok(())
    }

    async fn close(&self) -> Result<(), Error> {
        self.pool.close().await;
        Ok(())
    }
}

/// Map a PostgreSQL data type onto the destination's type system.
fn convert_datatype(data_type: &str) -> ColumnType {
    match data_type.to_lowercase().as_str() {
        "bit" | "boolean" => ColumnType::Bool,
        "smallint" | "integer" | "bigint" => ColumnType::Long,
        "double precision" | "money" | "numeric" | "real" => ColumnType::Float,
        "character" | "character varying" | "text" => ColumnType::String,
        "date"
        | "time with time zone"
        | "time without time zone"
        | "timestamp with time zone"
        | "timestamp without time zone" => ColumnType::Date,
        other => {
            debug!("unknown PostgreSQL type '{}', treating as string", other);
            ColumnType::String
        }
    }
}

fn decode_row(row: &PgRow) -> Row {
    row.columns()
        .iter()
        .enumerate()
        .map(|(index, column)| decode_cell(row, index, column.type_info().name()))
        .collect()
}

// Decoding is lenient: a value the driver cannot produce as the expected
// Rust type becomes a null rather than failing the whole stream.
fn decode_cell(row: &PgRow, index: usize, type_name: &str) -> Cell {
    match type_name.to_uppercase().as_str() {
        "BOOL" | "BOOLEAN" => row
            .try_get::<Option<bool>, _>(index)
            .ok()
            .flatten()
            .map(Cell::Bool)
            .unwrap_or(Cell::Null),
        "INT2" | "SMALLINT" => row
            .try_get::<Option<i16>, _>(index)
            .ok()
            .flatten()
            .map(|value| Cell::Long(value as i64))
            .unwrap_or(Cell::Null),
        "INT4" | "INT" | "INTEGER" => row
            .try_get::<Option<i32>, _>(index)
            .ok()
            .flatten()
            .map(|value| Cell::Long(value as i64))
            .unwrap_or(Cell::Null),
        "INT8" | "BIGINT" => row
            .try_get::<Option<i64>, _>(index)
            .ok()
            .flatten()
            .map(Cell::Long)
            .unwrap_or(Cell::Null),
        "FLOAT4" | "REAL" => row
            .try_get::<Option<f32>, _>(index)
            .ok()
            .flatten()
            .map(|value| Cell::Float(value as f64))
            .unwrap_or(Cell::Null),
        "FLOAT8" | "DOUBLE PRECISION" | "NUMERIC" | "MONEY" => row
            .try_get::<Option<f64>, _>(index)
            .ok()
            .flatten()
            .map(Cell::Float)
            .unwrap_or(Cell::Null),
        "DATE" => row
            .try_get::<Option<NaiveDate>, _>(index)
            .ok()
            .flatten()
            .map(Cell::Date)
            .unwrap_or(Cell::Null),
        "TIMESTAMP" => row
            .try_get::<Option<NaiveDateTime>, _>(index)
            .ok()
            .flatten()
            .map(|value| Cell::Date(value.date()))
            .unwrap_or(Cell::Null),
        "TIMESTAMPTZ" => row
            .try_get::<Option<DateTime<Utc>>, _>(index)
            .ok()
            .flatten()
            .map(|value| Cell::Date(value.date_naive()))
            .unwrap_or(Cell::Null),
        _ => row
            .try_get::<Option<String>, _>(index)
            .ok()
            .flatten()
            .map(Cell::Text)
            .unwrap_or(Cell::Null),
    }
}
