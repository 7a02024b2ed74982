//! The message type dispatched between stages, and the completion handles
//! used to await child messages.

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

use sluice_core::Error;

use crate::packets::{Packet, PacketSet};
use crate::stage::StageResult;
use crate::system::System;

static NEXT_MSG_ID: AtomicU64 = AtomicU64::new(1);

fn next_msg_id() -> u64 {
    NEXT_MSG_ID.fetch_add(1, Ordering::Relaxed)
}

/// Counts the live messages beneath a completion handle.
#[derive(Debug, Default)]
pub(crate) struct Tracker {
    live: AtomicUsize,
    drained: Notify,
}

impl Tracker {
    pub(crate) fn register(&self) {
        self.live.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn retire(&self) {
        if self.live.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.drained.notify_waiters();
        }
    }

    pub(crate) async fn wait(&self) {
        loop {
            let notified = self.drained.notified();

            if self.live.load(Ordering::Acquire) == 0 {
                return;
            }

            notified.await;
        }
    }
}

/// Completion handle for a child message.
///
/// Resolves once the child and every descendant it spawned have left the
/// pipeline, whether by reaching the terminal stage, being skipped, or
/// failing.
#[derive(Debug, Clone)]
pub struct Handle {
    tracker: Arc<Tracker>,
}

impl Handle {
    pub async fn wait(&self) {
        self.tracker.wait().await;
    }
}

/// The unit of work flowing through the pipeline.
///
/// Messages sharing an `initial_id` form one lineage: a parent and all the
/// descendants produced by stage-level splits.
pub struct Message {
    msg_id: u64,
    initial_id: u64,
    pub(crate) stage_idx: usize,
    pub packets: PacketSet,
    system: Option<Arc<System>>,
    trackers: Vec<Arc<Tracker>>,
}

impl Message {
    /// Create a fresh message, starting a new lineage.
    pub fn new(packets: impl IntoIterator<Item = Packet>) -> Self {
        let msg_id = next_msg_id();

        let mut set = PacketSet::default();
        for packet in packets {
            set.add(packet);
        }

        Message {
            msg_id,
            initial_id: msg_id,
            stage_idx: 0,
            packets: set,
            system: None,
            trackers: Vec::new(),
        }
    }

    pub fn msg_id(&self) -> u64 {
        self.msg_id
    }

    pub fn initial_id(&self) -> u64 {
        self.initial_id
    }

    /// Bind the message to the system which will dispatch it.
    pub(crate) fn attach(&mut self, system: Arc<System>, tracker: Arc<Tracker>) {
        tracker.register();
        self.trackers.push(tracker);
        self.system = Some(system);
    }

    /// Forward this message to the next stage in the pipeline.
    ///
    /// The remainder of the pipeline runs in place, so errors raised by any
    /// downstream stage propagate back to the caller. The stage index is
    /// restored on failure, allowing a retry stage to forward the same
    /// message again.
    pub async fn forward(&mut self) -> StageResult {
        let Some(system) = self.system.clone() else {
            return Err(Error::Stopped);
        };

        let entered = self.stage_idx;
        self.stage_idx += 1;

        let result = system.dispatch(self).await;
        if result.is_err() {
            self.stage_idx = entered;
        }

        result
    }

    /// Split off a child message carrying the given packets.
    ///
    /// The child shares this message's `initial_id`, inherits its singleton
    /// packets, and re-enters the pipeline at the stage following the one
    /// currently processing this message.
    pub fn fork(&self, packets: impl IntoIterator<Item = Packet>) -> Result<(), Error> {
        self.fork_inner(packets, None, None)
    }

    /// Like [`fork`](Self::fork), returning a handle which resolves once the
    /// child and all of its descendants have retired.
    pub fn fork_tracked(
        &self,
        packets: impl IntoIterator<Item = Packet>,
    ) -> Result<Handle, Error> {
        self.fork_sequenced(packets, None)
    }

    /// Like [`fork_tracked`](Self::fork_tracked), but the child enters the
    /// pipeline only once `after` has resolved.
    ///
    /// Chaining each child on its predecessor's handle is how a splitting
    /// stage keeps same-lineage packets arriving at the next stage in the
    /// order they were forked, while still being free to run ahead itself.
    pub fn fork_sequenced(
        &self,
        packets: impl IntoIterator<Item = Packet>,
        after: Option<Handle>,
    ) -> Result<Handle, Error> {
        let tracker = Arc::new(Tracker::default());
        self.fork_inner(packets, Some(tracker.clone()), after)?;
        Ok(Handle { tracker })
    }

    fn fork_inner(
        &self,
        packets: impl IntoIterator<Item = Packet>,
        tracker: Option<Arc<Tracker>>,
        after: Option<Handle>,
    ) -> Result<(), Error> {
        let Some(system) = self.system.clone() else {
            return Err(Error::Stopped);
        };

        let mut child = Message {
            msg_id: next_msg_id(),
            initial_id: self.initial_id,
            stage_idx: self.stage_idx + 1,
            packets: self.packets.singletons(),
            system: Some(system.clone()),
            trackers: Vec::new(),
        };

        for packet in packets {
            child.packets.add(packet);
        }

        // Descendants count against every ancestor handle as well.
        for ancestor in &self.trackers {
            ancestor.register();
            child.trackers.push(ancestor.clone());
        }

        if let Some(tracker) = tracker {
            tracker.register();
            child.trackers.push(tracker);
        }

        system.spawn_child(child, after);
        Ok(())
    }
}

impl Drop for Message {
    fn drop(&mut self) {
        for tracker in &self.trackers {
            tracker.retire();
        }
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("msg_id", &self.msg_id)
            .field("initial_id", &self.initial_id)
            .field("stage_idx", &self.stage_idx)
            .field("packets", &self.packets.kinds())
            .finish()
    }
}
