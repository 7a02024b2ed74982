//! Stages managing the destination table around an import.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use tracing::{debug, info, warn};

use sluice_core::{build_datatype, Cell, Destination, Error, Row, DATE_FORMAT};

use crate::message::Message;
use crate::packets::PacketKind;
use crate::stage::Stage;
use crate::util;

fn destination_and_table(message: &Message) -> Result<(Arc<dyn Destination>, String), Error> {
    let destination = message.packets.destination()?.destination.clone();
    let table = message.packets.import_table()?.dest_table.clone();

    Ok((destination, table))
}

/// Creates the destination table before data is imported into it.
pub struct CreateTableStage {
    quiet: bool,
}

impl CreateTableStage {
    /// With `quiet`, a failed CREATE is ignored on the assumption the table
    /// already exists.
    pub fn new(quiet: bool) -> Self {
        Self { quiet }
    }
}

#[async_trait]
impl Stage for CreateTableStage {
    fn interests(&self) -> &[PacketKind] {
        &[PacketKind::ImportTable]
    }

    async fn before(&self, message: &mut Message) -> Result<(), Error> {
        let columns = util::get_columns(message, true).await?;
        let (destination, table) = destination_and_table(message)?;

        info!("creating table {} with {} column(s)", table, columns.len());

        let column_defs = columns
            .iter()
            .map(|column| format!("{} {}", column.name, build_datatype(column)))
            .collect::<Vec<_>>()
            .join(", ");

        let identifier = destination.get_identifier(&table, None);
        let query = format!("CREATE TABLE {} ({})", identifier, column_defs);

        match destination.query(&query).await {
            Err(Error::Query { response, .. }) if self.quiet => {
                debug!(
                    "query failed creating table {}, assuming it already exists",
                    table
                );
                if let Some(response) = response {
                    debug!("{}", response);
                }

                Ok(())
            }
            result => result.map(|_| ()),
        }
    }
}

/// Drops the destination table before data is imported.
pub struct DropTableStage {
    quiet: bool,
}

impl DropTableStage {
    pub fn new(quiet: bool) -> Self {
        Self { quiet }
    }
}

#[async_trait]
impl Stage for DropTableStage {
    fn interests(&self) -> &[PacketKind] {
        &[PacketKind::ImportTable]
    }

    async fn before(&self, message: &mut Message) -> Result<(), Error> {
        let (destination, table) = destination_and_table(message)?;

        info!("dropping table {}", table);

        let identifier = destination.get_identifier(&table, None);
        match destination.query(&format!("DROP TABLE {}", identifier)).await {
            Err(Error::Query { response, .. }) if self.quiet => {
                debug!(
                    "query failed dropping table {}, assuming it does not exist",
                    table
                );
                if let Some(response) = response {
                    debug!("{}", response);
                }

                Ok(())
            }
            result => result.map(|_| ()),
        }
    }
}

/// Deletes all rows in the destination table before data is imported.
pub struct TruncateTableStage {
    quiet: bool,
}

impl TruncateTableStage {
    pub fn new(quiet: bool) -> Self {
        Self { quiet }
    }
}

#[async_trait]
impl Stage for TruncateTableStage {
    fn interests(&self) -> &[PacketKind] {
        &[PacketKind::ImportTable]
    }

    async fn before(&self, message: &mut Message) -> Result<(), Error> {
        let (destination, table) = destination_and_table(message)?;

        info!("truncating table {}", table);

        let identifier = destination.get_identifier(&table, None);
        match destination
            .query(&format!("DELETE FROM {}", identifier))
            .await
        {
            Err(Error::Query { response, .. }) if self.quiet => {
                debug!(
                    "query failed truncating table {}, assuming it is already empty",
                    table
                );
                if let Some(response) = response {
                    debug!("{}", response);
                }

                Ok(())
            }
            result => result.map(|_| ()),
        }
    }
}

/// Runs the post-import optimization queries the destination needs after a
/// bulk load.
pub struct PostImportHackStage {
    perform_on_failure: bool,
}

impl PostImportHackStage {
    pub fn new(perform_on_failure: bool) -> Self {
        Self { perform_on_failure }
    }
}

#[async_trait]
impl Stage for PostImportHackStage {
    fn interests(&self) -> &[PacketKind] {
        &[PacketKind::ImportTable]
    }

    async fn after(&self, message: &Message, skipped: bool, success: bool) -> Result<(), Error> {
        let failed = !(success || skipped);
        if failed && !self.perform_on_failure {
            return Ok(());
        }

        let (destination, table) = destination_and_table(message)?;
        let identifier = destination.get_identifier(&table, None);

        info!("performing post-optimize on table {}", table);

        destination
            .query(&format!("POST-OPTIMIZE TABLE {}", identifier))
            .await?;
        destination
            .query(&format!("GENERATE SKIP-DATA FOR {}", identifier))
            .await?;

        Ok(())
    }
}

/// Runs a caller-supplied query against both the source and the destination
/// after an import, logging a warning when the results differ.
///
/// The query may reference `{table}` and `{column}`; the column placeholder
/// is filled with the table's first column.
pub struct SourceComparisonStage {
    query: String,
    perform_on_failure: bool,
}

impl SourceComparisonStage {
    pub fn new(query: impl Into<String>, perform_on_failure: bool) -> Self {
        Self {
            query: query.into(),
            perform_on_failure,
        }
    }

    fn fill(&self, identifier: &str, column: &str) -> String {
        self.query
            .replace("{table}", identifier)
            .replace("{column}", column)
    }
}

#[async_trait]
impl Stage for SourceComparisonStage {
    fn interests(&self) -> &[PacketKind] {
        &[PacketKind::ImportTable]
    }

    async fn after(&self, message: &Message, skipped: bool, success: bool) -> Result<(), Error> {
        let failed = !(success || skipped);
        if failed && !self.perform_on_failure {
            return Ok(());
        }

        let import = message.packets.import_table()?;
        let source = import.source.clone();
        let src_table = import.src_table.clone();
        let (destination, dest_table) = destination_and_table(message)?;

        let columns = source.get_columns(&src_table).await?;
        let Some(column) = columns.first() else {
            return Ok(());
        };

        let dest_query = self.fill(&destination.get_identifier(&dest_table, None), &column.name);
        let src_query = self.fill(&source.get_identifier(&src_table, None), &column.name);

        let dest_rows = destination.query(&dest_query).await?.rows;

        let mut src_rows = Vec::new();
        let mut chunks = source.query(&src_query).await?;
        while let Some(chunk) = chunks.next().await {
            src_rows.extend(chunk?);
        }

        if rows_differ(&dest_rows, &src_rows) {
            warn!(
                "comparison query on table {} differed between the destination and the source",
                src_table
            );
            debug!("destination: {:?}", dest_rows);
            debug!("source: {:?}", src_rows);
        }

        Ok(())
    }
}

fn rows_differ(left: &[Row], right: &[Row]) -> bool {
    if left.len() != right.len() {
        return true;
    }

    left.iter()
        .zip(right)
        .any(|(left_row, right_row)| row_differs(left_row, right_row))
}

fn row_differs(left: &Row, right: &Row) -> bool {
    if left.len() != right.len() {
        return true;
    }

    left.iter()
        .zip(right)
        .any(|(left_cell, right_cell)| cell_key(left_cell) != cell_key(right_cell))
}

// Cells are compared through their textual form so a long from one side can
// match a float or string rendering of the same value from the other.
fn cell_key(cell: &Cell) -> String {
    match cell {
        Cell::Null => String::new(),
        Cell::Bool(value) => value.to_string(),
        Cell::Long(value) => value.to_string(),
        Cell::Float(value) => value.to_string(),
        Cell::Date(value) => value.format(DATE_FORMAT).to_string(),
        Cell::Text(value) => value.clone(),
    }
}
