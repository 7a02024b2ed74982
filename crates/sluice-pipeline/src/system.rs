//! Wires an ordered list of stages to the worker pool.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use futures::future::BoxFuture;
use tracing::{debug, error, warn};

use sluice_core::Error;

use crate::message::{Handle, Message, Tracker};
use crate::packets::{PacketKind, ALL_PACKETS};
use crate::processor::{Callback, Processor, ProcessorConfig};
use crate::stage::{Outcome, Stage, StageResult};

/// Terminal stage logging messages which fell through the whole pipeline.
struct WarningStage;

#[async_trait]
impl Stage for WarningStage {
    fn interests(&self) -> &[PacketKind] {
        ALL_PACKETS
    }

    async fn process(&self, message: &mut Message) -> StageResult {
        warn!("message reached the end of the pipeline without being consumed");
        debug!("{:?}", message);

        Ok(Outcome::Done)
    }
}

/// An ordered sequence of stages plus the processor dispatching messages
/// through them.
///
/// The system exclusively owns in-flight messages; stages borrow them for
/// the duration of a `process` call.
pub struct System {
    stages: Vec<Box<dyn Stage>>,
    processor: Arc<Processor>,
    live: Arc<Tracker>,
}

impl System {
    /// Build a system from the given stages, appending the terminal warning
    /// sink, and start its worker pool.
    pub fn new(stages: Vec<Box<dyn Stage>>, config: &ProcessorConfig) -> Arc<System> {
        let mut stages = stages;
        stages.push(Box::new(WarningStage));

        Arc::new_cyclic(|weak: &Weak<System>| {
            let callback_system = weak.clone();
            let callback: Callback = Arc::new(move |message: Message| {
                let system = callback_system.clone();
                Box::pin(async move {
                    let Some(system) = system.upgrade() else {
                        return Err(Error::Stopped);
                    };

                    let mut message = message;
                    system.dispatch(&mut message).await
                })
            });

            System {
                stages,
                processor: Processor::new(config, callback),
                live: Arc::new(Tracker::default()),
            }
        })
    }

    /// Queue a message to be processed, blocking while the queue is full.
    pub async fn enqueue(self: &Arc<Self>, mut message: Message) -> Result<(), Error> {
        message.attach(self.clone(), self.live.clone());
        self.processor.enqueue(message).await
    }

    /// Run the stage at the message's current index.
    pub(crate) fn dispatch<'a>(&'a self, message: &'a mut Message) -> BoxFuture<'a, StageResult> {
        Box::pin(async move {
            match self.stages.get(message.stage_idx) {
                Some(stage) => stage.receive(message).await,
                None => Ok(Outcome::Done),
            }
        })
    }

    /// Run a child message as its own task, starting at its stage index.
    /// With `after`, the child holds off until that handle resolves, keeping
    /// sequenced siblings in their fork order.
    pub(crate) fn spawn_child(self: &Arc<Self>, child: Message, after: Option<Handle>) {
        let system = self.clone();

        tokio::spawn(async move {
            if let Some(predecessor) = after {
                predecessor.wait().await;
            }

            let mut message = child;

            if let Err(err) = system.dispatch(&mut message).await {
                error!("caught error attempting to process child message: {}", err);
            }
        });
    }

    /// Wait until every in-flight message, including forked children, has
    /// retired.
    pub async fn join(&self) {
        self.live.wait().await;
    }

    /// Drain pending messages and stop the worker pool.
    pub async fn shutdown(&self) {
        self.processor.shutdown().await;
    }
}
