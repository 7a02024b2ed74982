//! End-to-end pipeline scenarios against in-memory collaborators.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream;

use sluice_core::{
    Cell, ChunkStream, Column, ColumnType, Destination, Error, QueryResult, Row, RowStream,
    SliceStore, Source,
};
use sluice_pipeline::message::Message;
use sluice_pipeline::packets::{
    DataFilePacket, DataFormatPacket, DataUnloadPacket, DestinationPacket, ImportTablePacket,
    Packet, PacketKind, ALL_PACKETS,
};
use sluice_pipeline::stage::{Stage, StageResult};
use sluice_pipeline::stages::{
    BatchLimit, CreateTableStage, FileBatchStage, FileImportStage, FileOutputStage,
    PipeDelimitedDecoder, PrefixTableStage, RetryStage, SemaphoreStage, SkipTableStage,
    StreamBatchStage, StreamImportStage, UnloadRetrievalStage,
};
use sluice_pipeline::{Migrator, ProcessorConfig, SourceTrigger, System, Trigger};

struct MemorySource {
    columns: Vec<Column>,
    rows: Vec<Row>,
}

impl MemorySource {
    fn new(columns: Vec<Column>, rows: Vec<Row>) -> Arc<Self> {
        Arc::new(Self { columns, rows })
    }
}

#[async_trait]
impl Source for MemorySource {
    fn get_identifier(&self, table: &str, schema: Option<&str>) -> String {
        format!("{}.{}", schema.unwrap_or("public"), table)
    }

    async fn get_tables(&self) -> Result<Vec<String>, Error> {
        Ok(vec!["t".to_string()])
    }

    async fn get_columns(&self, _table: &str) -> Result<Vec<Column>, Error> {
        Ok(self.columns.clone())
    }

    async fn query(&self, _query: &str) -> Result<ChunkStream, Error> {
        let rows = self.rows.clone();
        Ok(Box::pin(stream::iter(vec![Ok(rows)])))
    }

    async fn retrieve(&self, _table: &str) -> Result<RowStream, Error> {
        Ok(Box::pin(stream::iter(
            self.rows.clone().into_iter().map(Ok),
        )))
    }

    async fn execute(&self, _query: &str) -> Result<(), Error> {
        Ok(())
    }

    async fn close(&self) -> Result<(), Error> {
        Ok(())
    }
}

#[derive(Default)]
struct ScriptedDestination {
    queries: Mutex<Vec<String>>,
    failures: Mutex<VecDeque<Error>>,
}

impl ScriptedDestination {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn failing_once_with_restart() -> Arc<Self> {
        let destination = Self::default();
        destination
            .failures
            .lock()
            .unwrap()
            .push_back(Error::ServerRestart {
                query: "load".to_string(),
            });

        Arc::new(destination)
    }

    fn recorded(&self) -> Vec<String> {
        self.queries.lock().unwrap().clone()
    }
}

#[async_trait]
impl Destination for ScriptedDestination {
    fn get_identifier(&self, table: &str, _schema: Option<&str>) -> String {
        format!("main${}", table)
    }

    async fn query(&self, query: &str) -> Result<QueryResult, Error> {
        self.queries.lock().unwrap().push(query.to_string());

        if let Some(failure) = self.failures.lock().unwrap().pop_front() {
            return Err(failure);
        }

        Ok(QueryResult::default())
    }

    async fn get_columns(&self, _table: &str) -> Result<Vec<Column>, Error> {
        Ok(Vec::new())
    }

    async fn close(&self) {}
}

fn import_message(source: Arc<dyn Source>, destination: Arc<dyn Destination>) -> Message {
    Message::new(vec![
        Packet::ImportTable(ImportTablePacket {
            source,
            src_table: "t".to_string(),
            dest_table: "t".to_string(),
        }),
        Packet::Destination(DestinationPacket { destination }),
    ])
}

fn long_text_rows(values: &[(i64, &str)]) -> Vec<Row> {
    values
        .iter()
        .map(|(id, text)| vec![Cell::Long(*id), Cell::Text(text.to_string())])
        .collect()
}

#[tokio::test]
async fn row_batched_stream_ingest() {
    let source = MemorySource::new(
        vec![
            Column::new("id", ColumnType::Long, None),
            Column::new("name", ColumnType::String, Some(1)),
        ],
        long_text_rows(&[(1, "A"), (2, "B"), (3, "C"), (4, "D"), (5, "E")]),
    );
    let destination = ScriptedDestination::new();

    let system = System::new(
        vec![
            Box::new(StreamBatchStage::new(BatchLimit::Rows(2))),
            Box::new(StreamImportStage::new()),
        ],
        &ProcessorConfig::default(),
    );

    system
        .enqueue(import_message(source, destination.clone()))
        .await
        .unwrap();
    system.join().await;
    system.shutdown().await;

    let suffix = "into table main$t fields terminated by '|' enclosed by '\"' lines terminated by '\n'";
    let expected = vec![
        format!("load data stream '1|\"A\"\n2|\"B\"\n' {}", suffix),
        format!("load data stream '3|\"C\"\n4|\"D\"\n' {}", suffix),
        format!("load data stream '5|\"E\"\n' {}", suffix),
    ];

    assert_eq!(destination.recorded(), expected);
}

#[tokio::test]
async fn byte_budgeted_stream_ingest() {
    let source = MemorySource::new(
        vec![Column::new("word", ColumnType::String, Some(4))],
        vec![
            vec![Cell::Text("aaaa".to_string())],
            vec![Cell::Text("bbbb".to_string())],
            vec![Cell::Text("cc".to_string())],
        ],
    );
    let destination = ScriptedDestination::new();

    let system = System::new(
        vec![
            Box::new(StreamBatchStage::new(BatchLimit::Bytes(10))),
            Box::new(StreamImportStage::new()),
        ],
        &ProcessorConfig::default(),
    );

    system
        .enqueue(import_message(source, destination.clone()))
        .await
        .unwrap();
    system.join().await;
    system.shutdown().await;

    let batches: Vec<String> = destination
        .recorded()
        .iter()
        .map(|query| {
            let start = query.find('\'').unwrap() + 1;
            let end = query.rfind("' into table").unwrap();
            query[start..end].to_string()
        })
        .collect();

    assert_eq!(batches, vec!["\"aaaa\"\n", "\"bbbb\"\n", "\"cc\"\n"]);
}

#[tokio::test]
async fn batches_reach_the_import_stage_in_index_order() {
    // More batches than the default read-ahead, each a single row, so any
    // reordering between forked children would be visible in the commands.
    let rows: Vec<Row> = (1..=12).map(|id| vec![Cell::Long(id)]).collect();
    let source = MemorySource::new(vec![Column::new("id", ColumnType::Long, None)], rows);
    let destination = ScriptedDestination::new();

    let system = System::new(
        vec![
            Box::new(StreamBatchStage::new(BatchLimit::Rows(1))),
            Box::new(StreamImportStage::new()),
        ],
        &ProcessorConfig::default(),
    );

    system
        .enqueue(import_message(source, destination.clone()))
        .await
        .unwrap();
    system.join().await;
    system.shutdown().await;

    let batches: Vec<String> = destination
        .recorded()
        .iter()
        .map(|query| {
            let start = query.find('\'').unwrap() + 1;
            let end = query.rfind("' into table").unwrap();
            query[start..end].to_string()
        })
        .collect();

    let expected: Vec<String> = (1..=12).map(|id| format!("{}\n", id)).collect();
    assert_eq!(batches, expected);
}

#[tokio::test]
async fn server_restart_is_retried() {
    let source = MemorySource::new(
        vec![Column::new("id", ColumnType::Long, None)],
        vec![vec![Cell::Long(1)], vec![Cell::Long(2)]],
    );
    let destination = ScriptedDestination::failing_once_with_restart();

    let system = System::new(
        vec![
            Box::new(StreamBatchStage::new(BatchLimit::Rows(10))),
            Box::new(RetryStage::new(Some(3))),
            Box::new(StreamImportStage::new()),
        ],
        &ProcessorConfig::default(),
    );

    system
        .enqueue(import_message(source, destination.clone()))
        .await
        .unwrap();
    system.join().await;
    system.shutdown().await;

    // The first attempt hit the restart notice; the second succeeded.
    let recorded = destination.recorded();
    assert_eq!(recorded.len(), 2);
    assert_eq!(recorded[0], recorded[1]);
}

#[derive(Default)]
struct ProbeState {
    current: AtomicUsize,
    peak: AtomicUsize,
}

struct ConcurrencyProbeStage {
    state: Arc<ProbeState>,
}

#[async_trait]
impl Stage for ConcurrencyProbeStage {
    fn interests(&self) -> &[PacketKind] {
        ALL_PACKETS
    }

    async fn process(&self, message: &mut Message) -> StageResult {
        let current = self.state.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.peak.fetch_max(current, Ordering::SeqCst);

        tokio::time::sleep(Duration::from_millis(20)).await;

        self.state.current.fetch_sub(1, Ordering::SeqCst);
        message.forward().await
    }
}

#[tokio::test]
async fn semaphore_bounds_inflight_messages() {
    let state = Arc::new(ProbeState::default());
    let destination = ScriptedDestination::new();

    let system = System::new(
        vec![
            Box::new(SemaphoreStage::new(2)),
            Box::new(ConcurrencyProbeStage {
                state: state.clone(),
            }),
        ],
        &ProcessorConfig {
            processor_count: 5,
            ..Default::default()
        },
    );

    for _ in 0..6 {
        let message = Message::new(vec![Packet::Destination(DestinationPacket {
            destination: destination.clone(),
        })]);
        system.enqueue(message).await.unwrap();
    }

    system.join().await;
    system.shutdown().await;

    assert!(state.peak.load(Ordering::SeqCst) <= 2);
}

struct RecordTablesStage {
    seen: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl Stage for RecordTablesStage {
    fn interests(&self) -> &[PacketKind] {
        &[PacketKind::ImportTable]
    }

    async fn process(&self, message: &mut Message) -> StageResult {
        let table = message.packets.import_table()?.src_table.clone();
        self.seen.lock().unwrap().push(table);

        message.forward().await
    }
}

#[tokio::test]
async fn skipped_tables_never_reach_later_stages() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let source = MemorySource::new(Vec::new(), Vec::new());
    let destination = ScriptedDestination::new();

    let system = System::new(
        vec![
            Box::new(SkipTableStage::new(None::<Vec<&str>>, Some(vec!["tmp_*"])).unwrap()),
            Box::new(RecordTablesStage { seen: seen.clone() }),
        ],
        &ProcessorConfig::default(),
    );

    for table in ["tmp_scratch", "orders"] {
        let mut message = import_message(source.clone(), destination.clone());
        message.packets.import_table_mut().unwrap().src_table = table.to_string();
        system.enqueue(message).await.unwrap();
    }

    system.join().await;
    system.shutdown().await;

    assert_eq!(*seen.lock().unwrap(), vec!["orders".to_string()]);
}

#[tokio::test]
async fn file_output_and_import_happy_path() {
    let upload = tempfile::tempdir().unwrap();
    let source = MemorySource::new(
        vec![
            Column::new("id", ColumnType::Long, None),
            Column::new("name", ColumnType::String, Some(1)),
        ],
        long_text_rows(&[(1, "A"), (2, "B"), (3, "C")]),
    );
    let destination = ScriptedDestination::new();

    let system = System::new(
        vec![
            Box::new(StreamBatchStage::new(BatchLimit::Rows(2))),
            Box::new(FileOutputStage::new(upload.path(), "alice")),
            Box::new(FileImportStage::new(upload.path(), "alice")),
        ],
        &ProcessorConfig::default(),
    );

    system
        .enqueue(import_message(source, destination.clone()))
        .await
        .unwrap();
    system.join().await;
    system.shutdown().await;

    let chunk_0 = upload.path().join("alice/data/t_0.dat");
    let chunk_1 = upload.path().join("alice/data/t_1.dat");
    assert_eq!(std::fs::read_to_string(&chunk_0).unwrap(), "1|\"A\"\n2|\"B\"\n");
    assert_eq!(std::fs::read_to_string(&chunk_1).unwrap(), "3|\"C\"\n");

    let recorded = destination.recorded();
    assert_eq!(recorded.len(), 2);
    assert!(recorded[0].starts_with("load data infile data/t_0.dat into table main$t"));
    assert!(recorded[1].starts_with("load data infile data/t_1.dat into table main$t"));
}

#[tokio::test]
async fn escaping_chunk_paths_never_reach_the_destination() {
    let destination = ScriptedDestination::new();
    let source = MemorySource::new(Vec::new(), Vec::new());

    let system = System::new(
        vec![Box::new(FileImportStage::new("/u/alice", ""))],
        &ProcessorConfig::default(),
    );

    let mut message = import_message(source, destination.clone());
    message.packets.add(Packet::DataFormat(DataFormatPacket {
        format: Default::default(),
    }));
    message.packets.add(Packet::DataFile(DataFilePacket {
        path: "/tmp/x.dat".into(),
        expect_warning: false,
    }));

    system.enqueue(message).await.unwrap();
    system.join().await;
    system.shutdown().await;

    assert!(destination.recorded().is_empty());
}

#[tokio::test]
async fn file_batches_are_resliced_by_byte_budget() {
    let dir = tempfile::tempdir().unwrap();
    let chunk = dir.path().join("t_raw.dat");
    tokio::fs::write(&chunk, "1|\"A\"\n2|\"B\"\n3|\"C\"\n")
        .await
        .unwrap();

    let source = MemorySource::new(Vec::new(), Vec::new());
    let destination = ScriptedDestination::new();

    let system = System::new(
        vec![
            // Each line is 6 bytes; 14 fits two lines per batch.
            Box::new(FileBatchStage::new(BatchLimit::Bytes(14))),
            Box::new(StreamImportStage::new()),
        ],
        &ProcessorConfig::default(),
    );

    let mut message = import_message(source, destination.clone());
    message.packets.add(Packet::DataFormat(DataFormatPacket {
        format: Default::default(),
    }));
    message.packets.add(Packet::DataFile(DataFilePacket {
        path: chunk,
        expect_warning: false,
    }));
    message.packets.add(Packet::DataComplete);

    system.enqueue(message).await.unwrap();
    system.join().await;
    system.shutdown().await;

    let recorded = destination.recorded();
    assert_eq!(recorded.len(), 2);
    assert!(recorded[0].contains("stream '1|\"A\"\n2|\"B\"\n'"));
    assert!(recorded[1].contains("stream '3|\"C\"\n'"));
}

struct MemorySliceStore {
    objects: HashMap<String, Vec<u8>>,
}

#[async_trait]
impl SliceStore for MemorySliceStore {
    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, Error> {
        self.objects
            .get(&format!("{}/{}", bucket, key))
            .cloned()
            .ok_or_else(|| Error::Request(format!("missing object {}/{}", bucket, key)))
    }
}

#[tokio::test]
async fn unloaded_slices_fan_back_into_the_pipeline() {
    let source = MemorySource::new(
        vec![
            Column::new("id", ColumnType::Long, None),
            Column::new("name", ColumnType::String, Some(8)),
        ],
        Vec::new(),
    );
    let destination = ScriptedDestination::new();

    let mut objects = HashMap::new();
    objects.insert(
        "staging/t/slice_manifest".to_string(),
        br#"{"entries": [{"url": "s3://staging/t/slice_0000"}, {"url": "s3://staging/t/slice_0001"}]}"#
            .to_vec(),
    );
    objects.insert("staging/t/slice_0000".to_string(), b"1|alice\n".to_vec());
    objects.insert("staging/t/slice_0001".to_string(), b"2|bob\n".to_vec());

    let system = System::new(
        vec![
            Box::new(UnloadRetrievalStage::new(
                Arc::new(MemorySliceStore { objects }),
                Arc::new(PipeDelimitedDecoder),
            )),
            Box::new(StreamImportStage::new()),
        ],
        &ProcessorConfig::default(),
    );

    let mut message = import_message(source, destination.clone());
    message.packets.add(Packet::DataUnload(DataUnloadPacket {
        bucket: "staging".to_string(),
        key: "t/slice_".to_string(),
    }));

    system.enqueue(message).await.unwrap();
    system.join().await;
    system.shutdown().await;

    let recorded = destination.recorded();
    assert_eq!(recorded.len(), 2);
    assert!(recorded[0].contains("stream '1|\"alice\"\n'"));
    assert!(recorded[1].contains("stream '2|\"bob\"\n'"));
}

#[tokio::test]
async fn migrator_drains_every_triggered_table() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let source = MemorySource::new(Vec::new(), Vec::new());
    let destination = ScriptedDestination::new();

    let system = System::new(
        vec![Box::new(RecordTablesStage { seen: seen.clone() })],
        &ProcessorConfig::default(),
    );

    let trigger: Box<dyn Trigger> =
        Box::new(SourceTrigger::new(source, destination));
    let migrator = Migrator::new(system, vec![trigger]);

    migrator.migrate().await.unwrap();
    migrator.shutdown().await;

    assert_eq!(*seen.lock().unwrap(), vec!["t".to_string()]);
}

#[tokio::test]
async fn prefix_applies_before_table_creation() {
    let source = MemorySource::new(
        vec![
            Column::new("id", ColumnType::Long, None),
            Column::new("name", ColumnType::String, Some(4)),
        ],
        Vec::new(),
    );
    let destination = ScriptedDestination::new();

    let system = System::new(
        vec![
            Box::new(PrefixTableStage::new("staging")),
            Box::new(CreateTableStage::new(false)),
        ],
        &ProcessorConfig::default(),
    );

    system
        .enqueue(import_message(source, destination.clone()))
        .await
        .unwrap();
    system.join().await;
    system.shutdown().await;

    assert_eq!(
        destination.recorded(),
        vec!["CREATE TABLE main$staging_t (id long, name string(4))".to_string()]
    );
}
