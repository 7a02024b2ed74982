//! Import stages: stream ingest, file ingest, and chunk-file output.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tracing::{debug, info};

use sluice_core::{Destination, Error, RowFormat};

use crate::message::Message;
use crate::packets::{DataFilePacket, Packet, PacketKind};
use crate::stage::{Stage, StageResult};

pub const DEFAULT_USER_FOLDER: &str = "data";
pub const DEFAULT_FILE_EXTENSION: &str = "dat";

// How much of a chunk file is examined when deciding whether a server
// import warning is spurious.
const WARNING_PROBE_BYTES: usize = 64 * 1024;

/// Issue one ingest command against the destination, bounded by the
/// configured timeout.
async fn perform_load(
    destination: &Arc<dyn Destination>,
    method: &str,
    format: &RowFormat,
    identifier: &str,
    timeout: Option<Duration>,
) -> Result<(), Error> {
    let query = format!(
        "load data {} into table {} fields terminated by '{}' enclosed by '{}' lines terminated by '{}'",
        method, identifier, format.field_terminator, format.field_wrapper, format.line_terminator
    );

    match timeout {
        Some(limit) => match tokio::time::timeout(limit, destination.execute(&query)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Query {
                query,
                response: Some("import timed out".to_string()),
            }),
        },
        None => destination.execute(&query).await,
    }
}

/// Ingests `DataLoad` packets inline via `load data stream` commands.
pub struct StreamImportStage {
    timeout: Option<Duration>,
}

impl StreamImportStage {
    pub fn new() -> Self {
        Self { timeout: None }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

impl Default for StreamImportStage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Stage for StreamImportStage {
    fn interests(&self) -> &[PacketKind] {
        &[PacketKind::DataLoad]
    }

    async fn process(&self, message: &mut Message) -> StageResult {
        let destination = message.packets.destination()?.destination.clone();
        let format = message.packets.format()?.format.clone();
        let table = message.packets.import_table()?.dest_table.clone();
        let identifier = destination.get_identifier(&table, None);

        let loads = message.packets.loads().to_vec();
        for load in loads {
            let method = format!("stream '{}'", load.data);

            info!("streaming {} row(s) into {}", load.rows, table);
            perform_load(&destination, &method, &format, &identifier, self.timeout).await?;
        }

        message.forward().await
    }
}

/// Writes each `DataLoad` packet to a chunk file under the upload folder,
/// replacing it with a `DataFile` packet carrying the absolute path.
pub struct FileOutputStage {
    upload_folder: PathBuf,
    user_folder: Option<String>,
    file_extension: Option<String>,
}

impl FileOutputStage {
    pub fn new(upload_folder: impl AsRef<Path>, user: &str) -> Self {
        Self {
            upload_folder: upload_folder.as_ref().join(user),
            user_folder: Some(DEFAULT_USER_FOLDER.to_string()),
            file_extension: Some(DEFAULT_FILE_EXTENSION.to_string()),
        }
    }

    pub fn with_user_folder(mut self, user_folder: Option<String>) -> Self {
        self.user_folder = user_folder;
        self
    }

    pub fn with_file_extension(mut self, file_extension: Option<String>) -> Self {
        self.file_extension = file_extension;
        self
    }

    fn file_name(&self, table: &str, index: usize) -> String {
        match &self.file_extension {
            Some(extension) => format!("{}_{}.{}", table, index, extension),
            None => format!("{}_{}", table, index),
        }
    }

    fn file_path(&self, table: &str, index: usize) -> PathBuf {
        let name = self.file_name(table, index);

        match &self.user_folder {
            Some(folder) => self.upload_folder.join(folder).join(name),
            None => self.upload_folder.join(name),
        }
    }
}

#[async_trait]
impl Stage for FileOutputStage {
    fn interests(&self) -> &[PacketKind] {
        &[PacketKind::DataLoad]
    }

    async fn process(&self, message: &mut Message) -> StageResult {
        let table = message.packets.import_table()?.dest_table.clone();
        let format = message.packets.format()?.format.clone();
        let warning_suffix = format!("{}{}", format.field_terminator, format.line_terminator);

        for load in message.packets.pop_loads() {
            let path = self.file_path(&table, load.index);
            let expect_warning = load.data.ends_with(&warning_suffix);

            info!("writing chunk file: {}", path.display());

            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&path, load.data.as_bytes()).await?;

            message
                .packets
                .add(Packet::DataFile(DataFilePacket { path, expect_warning }));
        }

        message.forward().await
    }
}

/// Ingests `DataFile` packets via `load data infile` commands referencing
/// paths relative to the upload folder.
pub struct FileImportStage {
    upload_folder: PathBuf,
    ignore_skipdata: bool,
    timeout: Option<Duration>,
}

impl FileImportStage {
    pub fn new(upload_folder: impl AsRef<Path>, user: &str) -> Self {
        Self {
            upload_folder: upload_folder.as_ref().join(user),
            ignore_skipdata: false,
            timeout: None,
        }
    }

    /// Use the `infilenoskip` form, bypassing skip-data generation.
    pub fn with_ignore_skipdata(mut self, ignore_skipdata: bool) -> Self {
        self.ignore_skipdata = ignore_skipdata;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// The path embedded in the ingest command, relative to the upload
    /// folder. Paths which escape the folder are rejected.
    fn import_path(&self, path: &Path) -> Result<PathBuf, Error> {
        path.strip_prefix(&self.upload_folder)
            .map(|relative| relative.to_path_buf())
            .map_err(|_| Error::InvalidImportPath {
                path: path.to_path_buf(),
            })
    }

    /// Whether a server import warning for this file is the known spurious
    /// case: the first line ending with the field terminator.
    async fn should_suppress(&self, path: &Path, format: &RowFormat) -> Result<bool, Error> {
        let mut file = tokio::fs::File::open(path).await?;
        let mut buffer = vec![0u8; WARNING_PROBE_BYTES];
        let read = file.read(&mut buffer).await?;

        let head = String::from_utf8_lossy(&buffer[..read]).into_owned();
        let first_line = head
            .split(&format.line_terminator)
            .next()
            .unwrap_or_default();

        Ok(first_line.ends_with(&format.field_terminator))
    }

    async fn load_chunk(
        &self,
        destination: &Arc<dyn Destination>,
        packet: &DataFilePacket,
        identifier: &str,
        format: &RowFormat,
    ) -> Result<(), Error> {
        let relative = self.import_path(&packet.path)?;

        let style = if self.ignore_skipdata {
            "infilenoskip"
        } else {
            "infile"
        };
        let method = format!("{} {}", style, relative.display());

        info!("loading chunk {} into the destination", relative.display());

        match perform_load(destination, &method, format, identifier, self.timeout).await {
            Err(Error::ImportWarning { query }) => {
                if self.should_suppress(&packet.path, format).await? {
                    debug!(
                        "suppressing expected import warning for {}",
                        packet.path.display()
                    );
                    Ok(())
                } else {
                    Err(Error::ImportWarning { query })
                }
            }
            result => result,
        }
    }
}

#[async_trait]
impl Stage for FileImportStage {
    fn interests(&self) -> &[PacketKind] {
        &[PacketKind::DataFile]
    }

    async fn process(&self, message: &mut Message) -> StageResult {
        let destination = message.packets.destination()?.destination.clone();
        let format = message.packets.format()?.format.clone();
        let table = message.packets.import_table()?.dest_table.clone();
        let identifier = destination.get_identifier(&table, None);

        let files = message.packets.files().to_vec();
        for file in &files {
            self.load_chunk(&destination, file, &identifier, &format)
                .await?;
        }

        message.forward().await
    }
}

/// Drops data packets without importing anything; useful for dry runs.
pub struct SkipImportStage;

#[async_trait]
impl Stage for SkipImportStage {
    fn interests(&self) -> &[PacketKind] {
        &[PacketKind::DataLoad, PacketKind::DataFile]
    }

    async fn process(&self, message: &mut Message) -> StageResult {
        let table = message.packets.import_table()?.dest_table.clone();

        let loads = message.packets.pop_loads();
        let files = message.packets.pop_files();
        info!(
            "skipping import of {} batch(es) and {} file(s) for table {}",
            loads.len(),
            files.len(),
            table
        );

        message.forward().await
    }
}
