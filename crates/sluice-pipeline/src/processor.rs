//! The bounded worker pool messages are processed on.

use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use sluice_core::Error;

use crate::message::Message;
use crate::stage::{Outcome, StageResult};

/// Callback invoked by a worker for each dequeued message.
pub type Callback = Arc<dyn Fn(Message) -> BoxFuture<'static, StageResult> + Send + Sync>;

/// Options for the worker pool.
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Number of workers pulling from the queue.
    pub processor_count: usize,
    /// Pending-message queue length; defaults to the worker count.
    pub queue_length: Option<usize>,
    /// Whether a worker survives an error raised while processing.
    pub continue_on_error: bool,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            processor_count: 5,
            queue_length: None,
            continue_on_error: false,
        }
    }
}

const RUNNING: u8 = 0;
const STOPPING: u8 = 1;
const STOPPED: u8 = 2;

/// Processes messages on a fixed set of cooperative worker tasks feeding
/// from one bounded FIFO queue.
///
/// `enqueue` blocks while the queue is full, producing backpressure toward
/// whatever is triggering messages.
pub struct Processor {
    tx: std::sync::Mutex<Option<mpsc::Sender<Message>>>,
    rx: Arc<Mutex<mpsc::Receiver<Message>>>,
    state: AtomicU8,
    unfinished: AtomicUsize,
    drained: Notify,
    continue_on_error: bool,
    workers: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Processor {
    /// Create the pool and start its workers.
    pub fn new(config: &ProcessorConfig, callback: Callback) -> Arc<Processor> {
        let queue_length = config.queue_length.unwrap_or(config.processor_count).max(1);
        let (tx, rx) = mpsc::channel(queue_length);

        let processor = Arc::new(Processor {
            tx: std::sync::Mutex::new(Some(tx)),
            rx: Arc::new(Mutex::new(rx)),
            state: AtomicU8::new(RUNNING),
            unfinished: AtomicUsize::new(0),
            drained: Notify::new(),
            continue_on_error: config.continue_on_error,
            workers: std::sync::Mutex::new(Vec::new()),
        });

        let handles: Vec<JoinHandle<()>> = (0..config.processor_count.max(1))
            .map(|worker_id| {
                let processor = processor.clone();
                let callback = callback.clone();
                tokio::spawn(async move { processor.run_worker(worker_id, callback).await })
            })
            .collect();

        if let Ok(mut workers) = processor.workers.lock() {
            *workers = handles;
        }

        processor
    }

    async fn run_worker(&self, worker_id: usize, callback: Callback) {
        loop {
            let message = { self.rx.lock().await.recv().await };
            let Some(message) = message else {
                debug!("worker {} queue closed, exiting", worker_id);
                break;
            };

            // Entries dequeued after shutdown started are dropped unprocessed.
            if self.state.load(Ordering::Acquire) != RUNNING {
                drop(message);
                self.entry_done();
                continue;
            }

            let result = callback(message).await;
            self.entry_done();

            match result {
                Ok(Outcome::Done) => {}
                Ok(Outcome::Skipped) => debug!("worker {} dropped a skipped message", worker_id),
                Err(err) => {
                    error!("caught error attempting to process message: {}", err);

                    if !self.continue_on_error {
                        warn!("worker {} exiting after error", worker_id);
                        self.begin_stop();
                        break;
                    }
                }
            }
        }
    }

    fn entry_done(&self) {
        if self.unfinished.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.drained.notify_waiters();
        }
    }

    pub fn is_running(&self) -> bool {
        self.state.load(Ordering::Acquire) == RUNNING
    }

    /// Queue a message to be processed, waiting for space when the queue is
    /// at capacity.
    pub async fn enqueue(&self, message: Message) -> Result<(), Error> {
        if !self.is_running() {
            return Err(Error::Stopped);
        }

        let sender = {
            let tx = self.tx.lock().map_err(|_| Error::Stopped)?;
            tx.as_ref().cloned().ok_or(Error::Stopped)?
        };

        self.unfinished.fetch_add(1, Ordering::AcqRel);

        if sender.send(message).await.is_err() {
            self.entry_done();
            return Err(Error::Stopped);
        }

        Ok(())
    }

    /// Wait until every queued message has been fully processed or dropped.
    pub async fn join(&self) {
        loop {
            let notified = self.drained.notified();

            if self.unfinished.load(Ordering::Acquire) == 0 {
                return;
            }

            notified.await;
        }
    }

    /// Move to `Stopping`: no further enqueues are accepted and queued
    /// entries are dropped as workers reach them.
    fn begin_stop(&self) {
        self.state
            .compare_exchange(RUNNING, STOPPING, Ordering::AcqRel, Ordering::Acquire)
            .ok();

        if let Ok(mut tx) = self.tx.lock() {
            tx.take();
        }

        // If no worker currently holds the queue, drain it here so join does
        // not wait on entries a collapsed pool would never reach.
        if let Ok(mut rx) = self.rx.try_lock() {
            while let Ok(message) = rx.try_recv() {
                drop(message);
                self.entry_done();
            }
        }
    }

    /// Drop pending entries, wait for in-flight work, then stop the workers.
    pub async fn shutdown(&self) {
        if !self.is_running() {
            self.join().await;
            return;
        }

        debug!("waiting on processor tasks to complete");
        self.begin_stop();

        // With the sender gone workers drain the queue, dropping entries,
        // and exit once it is empty.
        self.join().await;

        if let Ok(mut workers) = self.workers.lock() {
            for handle in workers.drain(..) {
                handle.abort();
            }
        }

        self.state.store(STOPPED, Ordering::Release);
        debug!("processor stopped");
    }
}
