//! The contract every pipeline stage implements.

use async_trait::async_trait;
use tracing::warn;

use sluice_core::Error;

use crate::message::Message;
use crate::packets::PacketKind;

/// How a message left the remainder of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The message travelled to the end of the stage chain.
    Done,
    /// A stage chose to drop the message; this is a control signal, not an
    /// error, and downstream work for the message is short-circuited.
    Skipped,
}

pub type StageResult = Result<Outcome, Error>;

/// A unit of the pipeline which receives messages, optionally mutates their
/// packet set, and forwards them.
#[async_trait]
pub trait Stage: Send + Sync {
    /// The packet kinds this stage reacts to. Messages carrying none of
    /// them bypass the stage and are forwarded unchanged.
    fn interests(&self) -> &[PacketKind];

    /// Hook invoked before the rest of the pipeline runs.
    async fn before(&self, _message: &mut Message) -> Result<(), Error> {
        Ok(())
    }

    /// Hook invoked after the rest of the pipeline has run, with flags for
    /// whether the message was skipped and whether it succeeded.
    async fn after(
        &self,
        _message: &Message,
        _skipped: bool,
        _success: bool,
    ) -> Result<(), Error> {
        Ok(())
    }

    /// Process a message this stage is interested in.
    ///
    /// The default implementation brackets the rest of the pipeline between
    /// `before` and `after`. When forwarding fails or is skipped, `after`
    /// still runs; an error it raises at that point is logged and swallowed
    /// so the original outcome propagates.
    async fn process(&self, message: &mut Message) -> StageResult {
        self.before(message).await?;

        match message.forward().await {
            Ok(Outcome::Done) => {
                self.after(message, false, true).await?;
                Ok(Outcome::Done)
            }
            Ok(Outcome::Skipped) => {
                if let Err(err) = self.after(message, true, false).await {
                    warn!("failed calling 'after' for skipped message: {}", err);
                }

                Ok(Outcome::Skipped)
            }
            Err(err) => {
                if let Err(after_err) = self.after(message, false, false).await {
                    warn!("failed calling 'after' during error handling: {}", after_err);
                }

                Err(err)
            }
        }
    }

    /// Entry point invoked by the system for every message.
    async fn receive(&self, message: &mut Message) -> StageResult {
        if message.packets.contains_any(self.interests()) {
            self.process(message).await
        } else {
            message.forward().await
        }
    }
}
