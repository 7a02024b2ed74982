//! Batching of encoded rows by row-count or byte budgets.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::Mutex;
use tracing::{debug, info};

use sluice_core::{format_size, Error, RowEncoder, RowFormat};

use crate::message::{Handle, Message};
use crate::packets::{DataFormatPacket, DataLoadPacket, Packet, PacketKind};
use crate::stage::{Stage, StageResult};
use crate::timer::ProgressTicker;

pub const DEFAULT_LOG_INTERVAL: Duration = Duration::from_secs(10);
const DEFAULT_MAX_PENDING: usize = 4;

/// The budget a batch is sized by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchLimit {
    /// At most this many rows per batch.
    Rows(usize),
    /// At most this many encoded bytes per batch. A single row larger than
    /// the budget still forms a batch of its own; rows are never split.
    Bytes(usize),
}

impl BatchLimit {
    fn would_exceed(&self, rows: usize, bytes: usize, next_line_len: usize) -> bool {
        match self {
            BatchLimit::Rows(count) => rows + 1 > *count,
            BatchLimit::Bytes(size) => bytes + next_line_len > *size,
        }
    }

    fn describe(&self) -> String {
        match self {
            BatchLimit::Rows(count) => format!("{} row(s)", count),
            BatchLimit::Bytes(size) => format_size(*size as u64),
        }
    }
}

/// Accumulates encoded lines into budget-sized batches.
///
/// Batches emitted from one accumulator carry strictly increasing indices
/// starting at zero, and are never empty.
#[derive(Debug)]
pub(crate) struct BatchAccumulator {
    limit: BatchLimit,
    buffer: String,
    rows: usize,
    next_index: usize,
}

impl BatchAccumulator {
    pub(crate) fn new(limit: BatchLimit) -> Self {
        Self {
            limit,
            buffer: String::new(),
            rows: 0,
            next_index: 0,
        }
    }

    /// Add one encoded line, returning a finished batch when the line would
    /// have pushed the current one over its budget.
    pub(crate) fn push(&mut self, line: &str) -> Option<DataLoadPacket> {
        let emitted = if self.rows > 0
            && self
                .limit
                .would_exceed(self.rows, self.buffer.len(), line.len())
        {
            self.take()
        } else {
            None
        };

        self.buffer.push_str(line);
        self.rows += 1;

        emitted
    }

    /// Emit whatever is buffered, if anything.
    pub(crate) fn flush(&mut self) -> Option<DataLoadPacket> {
        if self.rows == 0 {
            return None;
        }

        self.take()
    }

    fn take(&mut self) -> Option<DataLoadPacket> {
        let data = std::mem::take(&mut self.buffer);
        let rows = std::mem::replace(&mut self.rows, 0);

        let index = self.next_index;
        self.next_index += 1;

        Some(DataLoadPacket { data, index, rows })
    }
}

#[derive(Debug, Default)]
struct BatchProgress {
    rows: AtomicUsize,
    bytes: AtomicU64,
}

impl BatchProgress {
    fn record(&self, line_len: usize) {
        self.rows.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(line_len as u64, Ordering::Relaxed);
    }

    fn reset(&self) {
        self.rows.store(0, Ordering::Relaxed);
        self.bytes.store(0, Ordering::Relaxed);
    }

    fn snapshot(&self) -> (usize, u64) {
        (
            self.rows.load(Ordering::Relaxed),
            self.bytes.load(Ordering::Relaxed),
        )
    }
}

/// Streams a table out of its source, encodes the rows, and emits each
/// budget-sized batch as a tracked child message carrying a `DataLoad`
/// packet.
///
/// Children are chained on their predecessors, so batches of one lineage
/// enter the next stage strictly in index order; `max_pending` only bounds
/// how far the reader may run ahead of the slowest in-flight batch. Once
/// the source stream ends the remainder is flushed, all children are
/// awaited, and the message is forwarded carrying `DataComplete`.
pub struct StreamBatchStage {
    limit: BatchLimit,
    format: RowFormat,
    log_interval: Duration,
    max_pending: usize,
}

impl StreamBatchStage {
    pub fn new(limit: BatchLimit) -> Self {
        Self {
            limit,
            format: RowFormat::default(),
            log_interval: DEFAULT_LOG_INTERVAL,
            max_pending: DEFAULT_MAX_PENDING,
        }
    }

    /// Format stamped onto messages which do not already carry one.
    pub fn with_format(mut self, format: RowFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_log_interval(mut self, interval: Duration) -> Self {
        self.log_interval = interval;
        self
    }

    /// Cap on batches outstanding ahead of the slowest in-flight ingest.
    pub fn with_max_pending(mut self, max_pending: usize) -> Self {
        self.max_pending = max_pending.max(1);
        self
    }

    async fn dispatch_batch(
        &self,
        message: &Message,
        batch: DataLoadPacket,
        pending: &mut VecDeque<Handle>,
    ) -> Result<(), Error> {
        while pending.len() >= self.max_pending {
            if let Some(handle) = pending.pop_front() {
                handle.wait().await;
            }
        }

        // Sequenced on the newest outstanding batch, so loads reach the
        // next stage in index order whatever the read-ahead allows.
        let after = pending.back().cloned();
        let handle = message.fork_sequenced(vec![Packet::DataLoad(batch)], after)?;
        pending.push_back(handle);

        Ok(())
    }
}

#[async_trait]
impl Stage for StreamBatchStage {
    fn interests(&self) -> &[PacketKind] {
        &[PacketKind::ImportTable]
    }

    async fn process(&self, message: &mut Message) -> StageResult {
        if message.packets.format().is_err() {
            message.packets.add(Packet::DataFormat(DataFormatPacket {
                format: self.format.clone(),
            }));
        }

        let (source, table) = {
            let import = message.packets.import_table()?;
            (import.source.clone(), import.src_table.clone())
        };
        let format = message.packets.format()?.format.clone();

        let encoder = RowEncoder::new(format);
        let mut stream = source.retrieve(&table).await?;
        let mut accumulator = BatchAccumulator::new(self.limit);

        let progress = Arc::new(BatchProgress::default());
        let _ticker = {
            let progress = progress.clone();
            let target = self.limit.describe();
            let table = table.clone();

            ProgressTicker::spawn(self.log_interval, move || {
                let (rows, bytes) = progress.snapshot();
                info!(
                    "read {} ({} row(s)) of {} from {}",
                    format_size(bytes),
                    rows,
                    target,
                    table
                );
            })
        };

        let mut pending = VecDeque::new();

        while let Some(row) = stream.next().await {
            let line = encoder.encode_row(&row?);
            progress.record(line.len());

            if let Some(batch) = accumulator.push(&line) {
                debug!(
                    "batch {} of {} holds {} row(s)",
                    batch.index, table, batch.rows
                );
                progress.reset();
                self.dispatch_batch(message, batch, &mut pending).await?;
            }
        }

        if let Some(batch) = accumulator.flush() {
            self.dispatch_batch(message, batch, &mut pending).await?;
        }

        for handle in pending.drain(..) {
            handle.wait().await;
        }

        message.packets.add(Packet::DataComplete);
        message.forward().await
    }
}

/// Re-slices batches already materialized as files into precise byte-sized
/// `DataLoad` packets.
///
/// Per-lineage accumulator state is keyed by `initial_id`, created lazily on
/// the first file packet and discarded once `DataComplete` arrives.
pub struct FileBatchStage {
    limit: BatchLimit,
    states: Mutex<HashMap<u64, BatchAccumulator>>,
}

impl FileBatchStage {
    pub fn new(limit: BatchLimit) -> Self {
        Self {
            limit,
            states: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl Stage for FileBatchStage {
    fn interests(&self) -> &[PacketKind] {
        &[PacketKind::DataFile, PacketKind::DataComplete]
    }

    async fn process(&self, message: &mut Message) -> StageResult {
        let format = message.packets.format()?.format.clone();
        let files = message.packets.pop_files();

        let initial_id = message.initial_id();
        let complete = message.packets.is_complete();

        let mut emitted = Vec::new();
        {
            let mut states = self.states.lock().await;
            let accumulator = states
                .entry(initial_id)
                .or_insert_with(|| BatchAccumulator::new(self.limit));

            for file in &files {
                let contents = tokio::fs::read_to_string(&file.path).await?;

                for line in split_lines(&contents, &format.line_terminator) {
                    emitted.extend(accumulator.push(&line));
                }
            }

            if complete {
                emitted.extend(accumulator.flush());
                states.remove(&initial_id);
            }
        }

        for batch in emitted {
            message.packets.add(Packet::DataLoad(batch));
        }

        message.forward().await
    }
}

/// Split text into lines, keeping the terminator on each line.
fn split_lines(contents: &str, terminator: &str) -> Vec<String> {
    let mut lines = Vec::new();
    let mut rest = contents;

    while let Some(position) = rest.find(terminator) {
        let end = position + terminator.len();
        lines.push(rest[..end].to_string());
        rest = &rest[end..];
    }

    if !rest.is_empty() {
        lines.push(rest.to_string());
    }

    lines
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(
        accumulator: &mut BatchAccumulator,
        lines: &[&str],
    ) -> Vec<DataLoadPacket> {
        let mut batches = Vec::new();

        for line in lines {
            batches.extend(accumulator.push(line));
        }
        batches.extend(accumulator.flush());

        batches
    }

    #[test]
    fn row_batches_hold_exactly_the_configured_count() {
        let mut accumulator = BatchAccumulator::new(BatchLimit::Rows(2));
        let batches = drain(
            &mut accumulator,
            &["1|\"A\"\n", "2|\"B\"\n", "3|\"C\"\n", "4|\"D\"\n", "5|\"E\"\n"],
        );

        let data: Vec<&str> = batches.iter().map(|batch| batch.data.as_str()).collect();
        assert_eq!(
            data,
            vec!["1|\"A\"\n2|\"B\"\n", "3|\"C\"\n4|\"D\"\n", "5|\"E\"\n"]
        );

        let rows: Vec<usize> = batches.iter().map(|batch| batch.rows).collect();
        assert_eq!(rows, vec![2, 2, 1]);
    }

    #[test]
    fn byte_batches_never_split_a_row() {
        // "aaaa"\n = 7 bytes, "bbbb"\n = 7 bytes, "cc"\n = 5 bytes.
        let mut accumulator = BatchAccumulator::new(BatchLimit::Bytes(10));
        let batches = drain(&mut accumulator, &["\"aaaa\"\n", "\"bbbb\"\n", "\"cc\"\n"]);

        let data: Vec<&str> = batches.iter().map(|batch| batch.data.as_str()).collect();
        assert_eq!(data, vec!["\"aaaa\"\n", "\"bbbb\"\n", "\"cc\"\n"]);
    }

    #[test]
    fn indices_form_a_contiguous_sequence() {
        let mut accumulator = BatchAccumulator::new(BatchLimit::Rows(3));
        let lines: Vec<String> = (0..10).map(|i| format!("{}\n", i)).collect();
        let refs: Vec<&str> = lines.iter().map(String::as_str).collect();

        let batches = drain(&mut accumulator, &refs);

        let indices: Vec<usize> = batches.iter().map(|batch| batch.index).collect();
        assert_eq!(indices, vec![0, 1, 2, 3]);
    }

    #[test]
    fn batches_are_never_empty() {
        let mut accumulator = BatchAccumulator::new(BatchLimit::Bytes(4));
        let batches = drain(&mut accumulator, &["0123456789\n", "x\n"]);

        assert!(batches.iter().all(|batch| batch.rows > 0));
        // The oversized row forms a batch of its own rather than being split.
        assert_eq!(batches[0].data, "0123456789\n");
    }

    #[test]
    fn flush_on_empty_accumulator_yields_nothing() {
        let mut accumulator = BatchAccumulator::new(BatchLimit::Rows(2));
        assert!(accumulator.flush().is_none());
    }

    #[test]
    fn batch_at_exact_byte_budget_is_kept_whole() {
        let mut accumulator = BatchAccumulator::new(BatchLimit::Bytes(10));
        let batches = drain(&mut accumulator, &["12345\n", "678\n", "wrap\n"]);

        // 6 + 4 = 10 bytes exactly fit; the next row starts a new batch.
        assert_eq!(batches[0].data, "12345\n678\n");
        assert_eq!(batches[1].data, "wrap\n");
    }

    #[test]
    fn split_lines_keeps_terminators() {
        assert_eq!(split_lines("a\nb\n", "\n"), vec!["a\n", "b\n"]);
        assert_eq!(split_lines("a\nb", "\n"), vec!["a\n", "b"]);
        assert_eq!(split_lines("", "\n"), Vec::<String>::new());
    }
}
