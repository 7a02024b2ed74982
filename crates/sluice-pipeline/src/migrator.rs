//! Top-level orchestration of a migration run.

use std::sync::Arc;

use futures::StreamExt;
use tracing::info;

use sluice_core::Error;

use crate::system::System;
use crate::triggers::Trigger;

/// Feeds triggered messages into a system and waits for the pipeline to
/// drain.
pub struct Migrator {
    system: Arc<System>,
    triggers: Vec<Box<dyn Trigger>>,
}

impl Migrator {
    pub fn new(system: Arc<System>, triggers: Vec<Box<dyn Trigger>>) -> Self {
        Self { system, triggers }
    }

    pub fn system(&self) -> &Arc<System> {
        &self.system
    }

    /// Enqueue every triggered message, then wait until every message in
    /// flight (including forked children) has retired.
    pub async fn migrate(&self) -> Result<(), Error> {
        for trigger in &self.triggers {
            let mut messages = trigger.poll().await?;

            while let Some(message) = messages.next().await {
                self.system.enqueue(message?).await?;
            }
        }

        self.system.join().await;
        info!("migration complete");

        Ok(())
    }

    /// Cancel outstanding work and stop the worker pool.
    pub async fn shutdown(&self) {
        self.system.shutdown().await;
    }
}
