//! Stages which alter the stream of rows read from the source, and the
//! source decorators backing them.

use std::collections::HashMap;
use std::ops::Range;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, NaiveDate, Utc};
use futures::StreamExt;
use rand::Rng;
use tracing::{debug, info};

use sluice_core::{Cell, ChunkStream, Column, ColumnType, Error, Row, RowStream, Source};

use crate::message::Message;
use crate::packets::PacketKind;
use crate::stage::Stage;

/// Limits the number of rows imported from the source.
pub struct LimitImportStage {
    count: usize,
}

impl LimitImportStage {
    pub fn new(count: usize) -> Self {
        Self { count }
    }
}

#[async_trait]
impl Stage for LimitImportStage {
    fn interests(&self) -> &[PacketKind] {
        &[PacketKind::ImportTable]
    }

    async fn before(&self, message: &mut Message) -> Result<(), Error> {
        let import = message.packets.import_table_mut()?;
        import.source = Arc::new(LimitedSource::new(import.source.clone(), self.count));

        Ok(())
    }
}

/// A source decorator which yields only the first N rows of each table.
pub struct LimitedSource {
    inner: Arc<dyn Source>,
    count: usize,
}

impl LimitedSource {
    pub fn new(inner: Arc<dyn Source>, count: usize) -> Self {
        Self { inner, count }
    }
}

#[async_trait]
impl Source for LimitedSource {
    fn get_identifier(&self, table: &str, schema: Option<&str>) -> String {
        self.inner.get_identifier(table, schema)
    }

    async fn get_tables(&self) -> Result<Vec<String>, Error> {
        self.inner.get_tables().await
    }

    async fn get_columns(&self, table: &str) -> Result<Vec<Column>, Error> {
        self.inner.get_columns(table).await
    }

    async fn query(&self, query: &str) -> Result<ChunkStream, Error> {
        self.inner.query(query).await
    }

    async fn retrieve(&self, table: &str) -> Result<RowStream, Error> {
        debug!("limiting table {} to {} row(s)", table, self.count);

        let stream = self.inner.retrieve(table).await?;
        Ok(Box::pin(stream.take(self.count)))
    }

    async fn execute(&self, query: &str) -> Result<(), Error> {
        self.inner.execute(query).await
    }

    async fn close(&self) -> Result<(), Error> {
        self.inner.close().await
    }
}

/// Removes named columns from both the schema and the rows of each table.
pub struct FilterColumnsStage {
    tables: HashMap<String, Vec<String>>,
}

impl FilterColumnsStage {
    /// `tables` maps a source table name to the columns to drop from it.
    pub fn new(tables: HashMap<String, Vec<String>>) -> Self {
        Self { tables }
    }
}

#[async_trait]
impl Stage for FilterColumnsStage {
    fn interests(&self) -> &[PacketKind] {
        &[PacketKind::ImportTable]
    }

    async fn before(&self, message: &mut Message) -> Result<(), Error> {
        let import = message.packets.import_table_mut()?;
        let ignored = self
            .tables
            .get(&import.src_table)
            .cloned()
            .unwrap_or_default();

        info!(
            "filtering {} column(s) from {}{}",
            ignored.len(),
            import.src_table,
            if ignored.is_empty() {
                String::new()
            } else {
                format!(" ({})", ignored.join(", "))
            }
        );

        import.source = Arc::new(FilteredSource::new(import.source.clone(), ignored));

        Ok(())
    }
}

/// A source decorator which filters columns out of schema and rows.
///
/// Surviving columns keep their original order; rows are reassembled from
/// pre-computed index ranges of the kept columns.
pub struct FilteredSource {
    inner: Arc<dyn Source>,
    columns: Vec<String>,
}

impl FilteredSource {
    pub fn new(inner: Arc<dyn Source>, columns: Vec<String>) -> Self {
        Self { inner, columns }
    }

    fn keeps(&self, column: &Column) -> bool {
        !self.columns.contains(&column.name)
    }

    /// Contiguous index ranges of the columns which survive filtering.
    fn keep_ranges(&self, columns: &[Column]) -> Vec<Range<usize>> {
        let mut ranges = Vec::new();
        let mut start = None;

        for (index, column) in columns.iter().enumerate() {
            if self.keeps(column) {
                start.get_or_insert(index);
                continue;
            }

            if let Some(begin) = start.take() {
                ranges.push(begin..index);
            }
        }

        if let Some(begin) = start {
            ranges.push(begin..columns.len());
        }

        ranges
    }
}

fn apply_ranges(row: &Row, ranges: &[Range<usize>]) -> Row {
    let mut filtered = Vec::new();

    for range in ranges {
        let end = range.end.min(row.len());
        if range.start >= end {
            continue;
        }

        filtered.extend_from_slice(&row[range.start..end]);
    }

    filtered
}

#[async_trait]
impl Source for FilteredSource {
    fn get_identifier(&self, table: &str, schema: Option<&str>) -> String {
        self.inner.get_identifier(table, schema)
    }

    async fn get_tables(&self) -> Result<Vec<String>, Error> {
        self.inner.get_tables().await
    }

    async fn get_columns(&self, table: &str) -> Result<Vec<Column>, Error> {
        let columns = self.inner.get_columns(table).await?;

        Ok(columns
            .into_iter()
            .filter(|column| self.keeps(column))
            .collect())
    }

    async fn query(&self, query: &str) -> Result<ChunkStream, Error> {
        self.inner.query(query).await
    }

    async fn retrieve(&self, table: &str) -> Result<RowStream, Error> {
        let columns = self.inner.get_columns(table).await?;
        let ranges = self.keep_ranges(&columns);

        debug!(
            "generated {} row segment(s) for table {}",
            ranges.len(),
            table
        );

        let stream = self.inner.retrieve(table).await?;
        Ok(Box::pin(stream.map(move |row| {
            row.map(|row| apply_ranges(&row, &ranges))
        })))
    }

    async fn execute(&self, query: &str) -> Result<(), Error> {
        self.inner.execute(query).await
    }

    async fn close(&self) -> Result<(), Error> {
        self.inner.close().await
    }
}

/// Window and sizing options for jumbled values.
#[derive(Debug, Clone)]
pub struct JumbleConfig {
    pub date_start: NaiveDate,
    pub date_end: NaiveDate,
    pub numeric_digits: u32,
    pub string_length: usize,
}

impl Default for JumbleConfig {
    fn default() -> Self {
        Self {
            date_start: NaiveDate::from_ymd_opt(2000, 1, 1).unwrap_or_default(),
            date_end: Utc::now().date_naive(),
            numeric_digits: 8,
            string_length: 12,
        }
    }
}

/// Replaces every cell with a type-matched random value, obscuring any
/// sensitive information in the migrated data.
pub struct JumbleDataStage {
    config: JumbleConfig,
}

impl JumbleDataStage {
    pub fn new(config: JumbleConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Stage for JumbleDataStage {
    fn interests(&self) -> &[PacketKind] {
        &[PacketKind::ImportTable]
    }

    async fn before(&self, message: &mut Message) -> Result<(), Error> {
        let import = message.packets.import_table_mut()?;
        import.source = Arc::new(JumbledSource::new(
            import.source.clone(),
            self.config.clone(),
        ));

        Ok(())
    }
}

/// A source decorator which replaces retrieved rows with random data of the
/// same shape.
pub struct JumbledSource {
    inner: Arc<dyn Source>,
    config: JumbleConfig,
}

impl JumbledSource {
    pub fn new(inner: Arc<dyn Source>, config: JumbleConfig) -> Self {
        Self { inner, config }
    }
}

fn random_cell(column: &Column, config: &JumbleConfig) -> Cell {
    let mut rng = rand::thread_rng();
    let numeric_max = 10i64.pow(config.numeric_digits) - 1;

    match column.ty {
        ColumnType::Bool => Cell::Bool(rng.gen()),
        ColumnType::Long => Cell::Long(rng.gen_range(1..=numeric_max)),
        ColumnType::Float => Cell::Float(rng.gen_range(1.0..numeric_max as f64)),
        ColumnType::Date => {
            let window = (config.date_end - config.date_start).num_days().max(0);
            let offset = rng.gen_range(0..=window);
            Cell::Date(config.date_start + ChronoDuration::days(offset))
        }
        ColumnType::String => {
            let length = column.size.unwrap_or(config.string_length).max(1);
            Cell::Text(random_title(&mut rng, length))
        }
    }
}

fn random_title(rng: &mut impl Rng, length: usize) -> String {
    const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz ";

    let raw: String = (0..length)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect();

    let mut titled = String::with_capacity(raw.len());
    let mut at_word_start = true;

    for ch in raw.chars() {
        if at_word_start && ch.is_ascii_alphabetic() {
            titled.push(ch.to_ascii_uppercase());
        } else {
            titled.push(ch);
        }

        at_word_start = ch == ' ';
    }

    titled
}

#[async_trait]
impl Source for JumbledSource {
    fn get_identifier(&self, table: &str, schema: Option<&str>) -> String {
        self.inner.get_identifier(table, schema)
    }

    async fn get_tables(&self) -> Result<Vec<String>, Error> {
        self.inner.get_tables().await
    }

    async fn get_columns(&self, table: &str) -> Result<Vec<Column>, Error> {
        self.inner.get_columns(table).await
    }

    async fn query(&self, query: &str) -> Result<ChunkStream, Error> {
        self.inner.query(query).await
    }

    async fn retrieve(&self, table: &str) -> Result<RowStream, Error> {
        let columns = self.inner.get_columns(table).await?;
        let config = self.config.clone();

        let stream = self.inner.retrieve(table).await?;
        Ok(Box::pin(stream.map(move |row| {
            row.map(|_| {
                columns
                    .iter()
                    .map(|column| random_cell(column, &config))
                    .collect()
            })
        })))
    }

    async fn execute(&self, query: &str) -> Result<(), Error> {
        self.inner.execute(query).await
    }

    async fn close(&self) -> Result<(), Error> {
        self.inner.close().await
    }
}
