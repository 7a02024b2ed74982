//! Sluice Pipeline - the staged migration runtime
//!
//! Messages carrying typed packets move through an ordered list of stages
//! on a bounded worker pool. Stages batch rows out of a source, materialize
//! or stream them, and issue ingest commands against the destination, with
//! control stages handling retries, concurrency gating, and skipping.

pub mod message;
pub mod migrator;
pub mod packets;
pub mod processor;
pub mod stage;
pub mod stages;
pub mod system;
pub mod timer;
pub mod triggers;
pub mod util;

pub use message::{Handle, Message};
pub use migrator::Migrator;
pub use packets::{Packet, PacketKind, PacketSet, ALL_PACKETS};
pub use processor::{Processor, ProcessorConfig};
pub use stage::{Outcome, Stage, StageResult};
pub use system::System;
pub use triggers::{
    LoopTrigger, NatsTableQueue, QueueTrigger, SourceTrigger, TableQueue, Trigger,
    DEFAULT_POLL_DELAY,
};
