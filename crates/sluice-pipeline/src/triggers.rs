//! Triggers producing the initial messages of a migration run.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use tokio::sync::Mutex;
use tracing::info;

use sluice_core::{Destination, Error, Source};

use crate::message::Message;
use crate::packets::{DestinationPacket, ImportTablePacket, Packet};

/// Default pause before re-polling an empty or lapsed queue.
pub const DEFAULT_POLL_DELAY: Duration = Duration::from_secs(300);

/// A lazy stream of messages to enqueue on the system.
pub type MessageStream = BoxStream<'static, Result<Message, Error>>;

/// Produces the `ImportTable` messages feeding a migration run.
#[async_trait]
pub trait Trigger: Send + Sync {
    async fn poll(&self) -> Result<MessageStream, Error>;
}

fn import_message(
    source: &Arc<dyn Source>,
    destination: &Arc<dyn Destination>,
    table: &str,
) -> Message {
    Message::new(vec![
        Packet::ImportTable(ImportTablePacket {
            source: source.clone(),
            src_table: table.to_string(),
            dest_table: table.to_string(),
        }),
        Packet::Destination(DestinationPacket {
            destination: destination.clone(),
        }),
    ])
}

/// Triggers one import message per table found in the source.
pub struct SourceTrigger {
    source: Arc<dyn Source>,
    destination: Arc<dyn Destination>,
}

impl SourceTrigger {
    pub fn new(source: Arc<dyn Source>, destination: Arc<dyn Destination>) -> Self {
        Self {
            source,
            destination,
        }
    }
}

#[async_trait]
impl Trigger for SourceTrigger {
    async fn poll(&self) -> Result<MessageStream, Error> {
        let tables = self.source.get_tables().await?;

        info!("tables to be imported: {}", tables.join(", "));

        let source = self.source.clone();
        let destination = self.destination.clone();

        Ok(Box::pin(stream::iter(tables).map(move |table| {
            Ok(import_message(&source, &destination, &table))
        })))
    }
}

/// Continuously re-triggers the same table; useful for soak testing a
/// pipeline against one table.
pub struct LoopTrigger {
    source: Arc<dyn Source>,
    destination: Arc<dyn Destination>,
    table: String,
}

impl LoopTrigger {
    pub fn new(
        source: Arc<dyn Source>,
        destination: Arc<dyn Destination>,
        table: impl Into<String>,
    ) -> Self {
        Self {
            source,
            destination,
            table: table.into(),
        }
    }
}

#[async_trait]
impl Trigger for LoopTrigger {
    async fn poll(&self) -> Result<MessageStream, Error> {
        let source = self.source.clone();
        let destination = self.destination.clone();
        let table = self.table.clone();

        Ok(Box::pin(stream::repeat_with(move || {
            Ok(import_message(&source, &destination, &table))
        })))
    }
}

/// A queue yielding table names to import.
///
/// `read` resolves with `None` when the queue is currently empty or its
/// subscription has lapsed; the queue trigger waits out its poll delay
/// before asking again.
#[async_trait]
pub trait TableQueue: Send + Sync {
    async fn read(&self) -> Result<Option<String>, Error>;
}

/// Table queue backed by a NATS subject.
pub struct NatsTableQueue {
    client: async_nats::Client,
    subject: String,
    subscriber: Mutex<Option<async_nats::Subscriber>>,
}

impl NatsTableQueue {
    pub fn new(client: async_nats::Client, subject: impl Into<String>) -> Self {
        Self {
            client,
            subject: subject.into(),
            subscriber: Mutex::new(None),
        }
    }
}

#[async_trait]
impl TableQueue for NatsTableQueue {
    async fn read(&self) -> Result<Option<String>, Error> {
        let mut subscriber = self.subscriber.lock().await;

        if subscriber.is_none() {
            let fresh = self
                .client
                .subscribe(self.subject.clone())
                .await
                .map_err(|err| Error::Request(err.to_string()))?;

            info!("waiting for tables on subject {}", self.subject);
            *subscriber = Some(fresh);
        }

        let Some(active) = subscriber.as_mut() else {
            return Ok(None);
        };

        match active.next().await {
            Some(queued) => Ok(Some(
                String::from_utf8_lossy(&queued.payload).trim().to_string(),
            )),
            None => {
                // Subscription lapsed; clear it so the next read, after the
                // trigger's poll delay, establishes a fresh one.
                *subscriber = None;
                Ok(None)
            }
        }
    }
}

/// Triggers imports from table names published on a queue, pausing for the
/// configured delay whenever the queue comes up empty.
pub struct QueueTrigger {
    queue: Arc<dyn TableQueue>,
    delay: Duration,
    source: Arc<dyn Source>,
    destination: Arc<dyn Destination>,
}

impl QueueTrigger {
    pub fn new(
        queue: Arc<dyn TableQueue>,
        source: Arc<dyn Source>,
        destination: Arc<dyn Destination>,
    ) -> Self {
        Self {
            queue,
            delay: DEFAULT_POLL_DELAY,
            source,
            destination,
        }
    }

    /// Pause between polls when the queue is empty or needs a fresh
    /// subscription.
    pub fn with_poll_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait]
impl Trigger for QueueTrigger {
    async fn poll(&self) -> Result<MessageStream, Error> {
        let queue = self.queue.clone();
        let source = self.source.clone();
        let destination = self.destination.clone();
        let delay = self.delay;

        Ok(Box::pin(stream::unfold(
            (queue, source, destination),
            move |(queue, source, destination)| async move {
                loop {
                    match queue.read().await {
                        Ok(Some(table)) => {
                            let message = import_message(&source, &destination, &table);
                            return Some((Ok(message), (queue, source, destination)));
                        }
                        Ok(None) => tokio::time::sleep(delay).await,
                        Err(err) => return Some((Err(err), (queue, source, destination))),
                    }
                }
            },
        )))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;

    use sluice_core::{ChunkStream, Column, QueryResult, RowStream};

    use super::*;

    struct NullSource;

    #[async_trait]
    impl Source for NullSource {
        fn get_identifier(&self, table: &str, _schema: Option<&str>) -> String {
            table.to_string()
        }

        async fn get_tables(&self) -> Result<Vec<String>, Error> {
            Ok(vec!["t".to_string()])
        }

        async fn get_columns(&self, _table: &str) -> Result<Vec<Column>, Error> {
            Ok(Vec::new())
        }

        async fn query(&self, _query: &str) -> Result<ChunkStream, Error> {
            Ok(Box::pin(stream::empty()))
        }

        async fn retrieve(&self, _table: &str) -> Result<RowStream, Error> {
            Ok(Box::pin(stream::empty()))
        }

        async fn execute(&self, _query: &str) -> Result<(), Error> {
            Ok(())
        }

        async fn close(&self) -> Result<(), Error> {
            Ok(())
        }
    }

    struct NullDestination;

    #[async_trait]
    impl Destination for NullDestination {
        fn get_identifier(&self, table: &str, _schema: Option<&str>) -> String {
            table.to_string()
        }

        async fn query(&self, _query: &str) -> Result<QueryResult, Error> {
            Ok(QueryResult::default())
        }

        async fn get_columns(&self, _table: &str) -> Result<Vec<Column>, Error> {
            Ok(Vec::new())
        }

        async fn close(&self) {}
    }

    #[derive(Default)]
    struct ScriptedQueue {
        reads: StdMutex<VecDeque<Option<String>>>,
    }

    impl ScriptedQueue {
        fn new(reads: impl IntoIterator<Item = Option<String>>) -> Arc<Self> {
            Arc::new(Self {
                reads: StdMutex::new(reads.into_iter().collect()),
            })
        }
    }

    #[async_trait]
    impl TableQueue for ScriptedQueue {
        async fn read(&self) -> Result<Option<String>, Error> {
            Ok(self.reads.lock().unwrap().pop_front().flatten())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn empty_queue_polls_wait_out_the_delay() {
        let queue = ScriptedQueue::new([None, Some("orders".to_string())]);
        let trigger = QueueTrigger::new(queue, Arc::new(NullSource), Arc::new(NullDestination))
            .with_poll_delay(Duration::from_secs(5));

        let started = tokio::time::Instant::now();
        let mut messages = trigger.poll().await.unwrap();
        let message = messages.next().await.unwrap().unwrap();

        assert!(started.elapsed() >= Duration::from_secs(5));
        assert_eq!(
            message.packets.import_table().unwrap().src_table,
            "orders"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn queued_tables_trigger_without_delay() {
        let queue = ScriptedQueue::new([Some("a".to_string()), Some("b".to_string())]);
        let trigger = QueueTrigger::new(queue, Arc::new(NullSource), Arc::new(NullDestination));

        let started = tokio::time::Instant::now();
        let mut messages = trigger.poll().await.unwrap();

        let first = messages.next().await.unwrap().unwrap();
        let second = messages.next().await.unwrap().unwrap();

        assert_eq!(started.elapsed(), Duration::ZERO);
        assert_eq!(first.packets.import_table().unwrap().src_table, "a");
        assert_eq!(second.packets.import_table().unwrap().src_table, "b");
    }

    #[test]
    fn poll_delay_defaults_to_the_idle_window() {
        let trigger = QueueTrigger::new(
            ScriptedQueue::new([]),
            Arc::new(NullSource),
            Arc::new(NullDestination),
        );

        assert_eq!(trigger.delay, DEFAULT_POLL_DELAY);
        assert_eq!(DEFAULT_POLL_DELAY, Duration::from_secs(300));
    }
}
