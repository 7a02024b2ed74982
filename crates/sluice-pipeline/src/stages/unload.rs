//! Stages handling source-side unloads staged through remote storage.
//!
//! The generation stage asks the source to unload a table to a bucket; the
//! retrieval stage walks the unload manifest, decodes each slice, and fans
//! the slices back into the pipeline as tracked child messages.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info};

use sluice_core::{Column, Error, Row, RowEncoder, RowFormat, SliceStore};

use crate::message::{Handle, Message};
use crate::packets::{
    DataFormatPacket, DataLoadPacket, DataUnloadPacket, Packet, PacketKind,
};
use crate::stage::{Stage, StageResult};
use crate::util;

/// Delimiter the source is asked to unload with.
pub const UNLOAD_DELIMITER: char = '|';

const DEFAULT_MAX_PENDING: usize = 4;

/// Decodes one unloaded slice into rows.
pub trait SliceDecoder: Send + Sync {
    fn decode(&self, data: &[u8], columns: &[Column]) -> Result<Vec<Row>, Error>;
}

#[derive(Debug, Deserialize)]
struct Manifest {
    entries: Vec<ManifestEntry>,
}

#[derive(Debug, Deserialize)]
struct ManifestEntry {
    url: String,
}

/// Issues the unload query staging a table's data onto remote storage and
/// records the handoff as a `DataUnload` packet.
pub struct UnloadGenerationStage {
    bucket: String,
    path_prefix: Option<String>,
    access_key: String,
    secret_key: String,
    session_token: Option<String>,
}

impl UnloadGenerationStage {
    pub fn new(
        bucket: impl Into<String>,
        access_key: impl Into<String>,
        secret_key: impl Into<String>,
    ) -> Self {
        Self {
            bucket: bucket.into(),
            path_prefix: None,
            access_key: access_key.into(),
            secret_key: secret_key.into(),
            session_token: None,
        }
    }

    pub fn with_path_prefix(mut self, path_prefix: Option<String>) -> Self {
        self.path_prefix = path_prefix;
        self
    }

    pub fn with_session_token(mut self, session_token: Option<String>) -> Self {
        self.session_token = session_token;
        self
    }

    fn credentials_clause(&self) -> String {
        let mut segments = vec![
            format!("ACCESS_KEY_ID '{}'", self.access_key),
            format!("SECRET_ACCESS_KEY '{}'", self.secret_key),
        ];

        if let Some(token) = &self.session_token {
            segments.push(format!("SESSION_TOKEN '{}'", token));
        }

        segments.join(" ")
    }
}

#[async_trait]
impl Stage for UnloadGenerationStage {
    fn interests(&self) -> &[PacketKind] {
        &[PacketKind::ImportTable]
    }

    async fn process(&self, message: &mut Message) -> StageResult {
        let columns = util::get_columns(message, true).await?;

        let (source, table) = {
            let import = message.packets.import_table()?;
            (import.source.clone(), import.src_table.clone())
        };

        let mut key = format!("{}/slice_", table);
        if let Some(prefix) = &self.path_prefix {
            key = format!("{}/{}", prefix, key);
        }

        message.packets.add(Packet::DataUnload(DataUnloadPacket {
            bucket: self.bucket.clone(),
            key: key.clone(),
        }));

        let query_columns = columns
            .iter()
            .map(|column| column.name.as_str())
            .collect::<Vec<_>>()
            .join(",");
        let query = format!(
            "SELECT {} FROM {}",
            query_columns,
            source.get_identifier(&table, None)
        );

        debug!("unloading data from the source with query: {}", query);

        source
            .execute(&format!(
                "UNLOAD ('{}') TO 's3://{}/{}' MANIFEST ALLOWOVERWRITE ESCAPE DELIMITER AS '{}' {}",
                query.replace('\'', "''"),
                self.bucket,
                key,
                UNLOAD_DELIMITER,
                self.credentials_clause(),
            ))
            .await?;

        message.forward().await
    }
}

/// Turns a `DataUnload` packet into a stream of `DataLoad` child messages,
/// one per manifest slice, waiting for every child to finish ingesting
/// before forwarding `DataComplete`.
///
/// Slices are chained on their predecessors so they enter the next stage
/// in manifest order; `max_pending` only bounds how far retrieval may run
/// ahead of the slowest in-flight slice.
pub struct UnloadRetrievalStage {
    store: Arc<dyn SliceStore>,
    decoder: Arc<dyn SliceDecoder>,
    format: RowFormat,
    max_pending: usize,
}

impl UnloadRetrievalStage {
    pub fn new(store: Arc<dyn SliceStore>, decoder: Arc<dyn SliceDecoder>) -> Self {
        Self {
            store,
            decoder,
            format: RowFormat::default(),
            max_pending: DEFAULT_MAX_PENDING,
        }
    }

    /// Format stamped onto messages which do not already carry one.
    pub fn with_format(mut self, format: RowFormat) -> Self {
        self.format = format;
        self
    }

    /// Cap on slices outstanding ahead of the slowest in-flight ingest.
    pub fn with_max_pending(mut self, max_pending: usize) -> Self {
        self.max_pending = max_pending.max(1);
        self
    }
}

#[async_trait]
impl Stage for UnloadRetrievalStage {
    fn interests(&self) -> &[PacketKind] {
        &[PacketKind::DataUnload]
    }

    async fn process(&self, message: &mut Message) -> StageResult {
        let Some(unload) = message.packets.take_unload() else {
            return message.forward().await;
        };

        if message.packets.format().is_err() {
            message.packets.add(Packet::DataFormat(DataFormatPacket {
                format: self.format.clone(),
            }));
        }

        let columns = util::get_columns(message, true).await?;
        let encoder = RowEncoder::new(message.packets.format()?.format.clone());

        let manifest_key = format!("{}manifest", unload.key);
        let manifest_data = self.store.get(&unload.bucket, &manifest_key).await?;
        let manifest: Manifest = serde_json::from_slice(&manifest_data)
            .map_err(|err| Error::Request(format!("invalid unload manifest: {}", err)))?;

        let mut pending: VecDeque<Handle> = VecDeque::new();

        for (index, entry) in manifest.entries.iter().enumerate() {
            let (bucket, key) = parse_remote_url(&entry.url)?;

            info!("retrieving unloaded slice: {}", key);

            let data = self.store.get(&bucket, &key).await?;
            let rows = self.decoder.decode(&data, &columns)?;

            let mut batch = String::with_capacity(data.len());
            for row in &rows {
                batch.push_str(&encoder.encode_row(row));
            }

            while pending.len() >= self.max_pending {
                if let Some(handle) = pending.pop_front() {
                    handle.wait().await;
                }
            }

            let after = pending.back().cloned();
            let handle = message.fork_sequenced(
                vec![Packet::DataLoad(DataLoadPacket {
                    data: batch,
                    index,
                    rows: rows.len(),
                })],
                after,
            )?;
            pending.push_back(handle);
        }

        for handle in pending.drain(..) {
            handle.wait().await;
        }

        message.packets.add(Packet::DataComplete);
        message.forward().await
    }
}

/// Parse an `s3://bucket/key` URL into its bucket and key.
fn parse_remote_url(url: &str) -> Result<(String, String), Error> {
    let rest = url
        .strip_prefix("s3://")
        .ok_or_else(|| Error::Request(format!("unsupported slice url: {}", url)))?;

    match rest.split_once('/') {
        Some((bucket, key)) if !bucket.is_empty() && !key.is_empty() => {
            Ok((bucket.to_string(), key.to_string()))
        }
        _ => Err(Error::Request(format!("unsupported slice url: {}", url))),
    }
}

/// Reference decoder for the raw delimited form tables are unloaded in:
/// one row per line, fields separated by the unload delimiter, special
/// characters escaped with a backslash.
pub struct PipeDelimitedDecoder;

impl PipeDelimitedDecoder {
    fn split_fields(line: &str) -> Vec<String> {
        let mut fields = Vec::new();
        let mut field = String::new();
        let mut escaped = false;

        for ch in line.chars() {
            if escaped {
                field.push(ch);
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == UNLOAD_DELIMITER {
                fields.push(std::mem::take(&mut field));
            } else {
                field.push(ch);
            }
        }

        fields.push(field);
        fields
    }
}

impl SliceDecoder for PipeDelimitedDecoder {
    fn decode(&self, data: &[u8], columns: &[Column]) -> Result<Vec<Row>, Error> {
        let text = String::from_utf8_lossy(data);
        let mut rows = Vec::new();

        for line in text.split('\n') {
            if line.is_empty() {
                continue;
            }

            let fields = Self::split_fields(line);
            let row = columns
                .iter()
                .zip(fields)
                .map(|(column, field)| sluice_core::parse_cell(column.ty, &field))
                .collect::<Result<Row, Error>>()?;

            rows.push(row);
        }

        Ok(rows)
    }
}
