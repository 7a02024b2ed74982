//! Control stages: retry, concurrency gating, skipping, pacing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use glob::Pattern;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use sluice_core::Error;

use crate::message::Message;
use crate::packets::{PacketKind, ALL_PACKETS};
use crate::stage::{Stage, StageResult};

/// Classifier deciding whether a downstream error should be retried.
pub type RetryHandler = Arc<dyn Fn(&Error) -> bool + Send + Sync>;

/// Re-forwards a message when an error bubbles up from downstream stages.
///
/// With no retry budget the stage retries forever. A handler may narrow
/// which errors are retriable; by default every error is.
pub struct RetryStage {
    max_retries: Option<u32>,
    handler: RetryHandler,
}

impl RetryStage {
    pub fn new(max_retries: Option<u32>) -> Self {
        Self {
            max_retries,
            handler: Arc::new(|_| true),
        }
    }

    pub fn with_handler(mut self, handler: RetryHandler) -> Self {
        self.handler = handler;
        self
    }

    /// Retry only the destination's transient restart notice.
    pub fn server_restart_only(self) -> Self {
        self.with_handler(Arc::new(Error::is_server_restart))
    }
}

#[async_trait]
impl Stage for RetryStage {
    fn interests(&self) -> &[PacketKind] {
        ALL_PACKETS
    }

    async fn process(&self, message: &mut Message) -> StageResult {
        let mut attempts = 0u32;

        loop {
            match message.forward().await {
                Ok(outcome) => return Ok(outcome),
                Err(err) => {
                    attempts += 1;

                    if !(self.handler)(&err) {
                        return Err(err);
                    }

                    if err.is_server_restart() {
                        warn!(
                            "destination restarting while processing message {}, attempt {}",
                            message.msg_id(),
                            attempts
                        );
                    } else {
                        warn!(
                            "caught error while processing message {}, attempt {}: {}",
                            message.msg_id(),
                            attempts,
                            err
                        );
                    }

                    if let Some(max_retries) = self.max_retries {
                        if attempts >= max_retries {
                            return Err(Error::RetryExhausted { attempts });
                        }
                    }
                }
            }
        }
    }
}

/// Caps how many messages may be in flight past this stage at once.
pub struct SemaphoreStage {
    semaphore: Semaphore,
}

impl SemaphoreStage {
    pub fn new(limit: usize) -> Self {
        Self {
            semaphore: Semaphore::new(limit),
        }
    }
}

#[async_trait]
impl Stage for SemaphoreStage {
    fn interests(&self) -> &[PacketKind] {
        ALL_PACKETS
    }

    async fn process(&self, message: &mut Message) -> StageResult {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| Error::Stopped)?;

        message.forward().await
    }
}

/// Rewrites the destination table name with a prefix.
pub struct PrefixTableStage {
    prefix: String,
}

impl PrefixTableStage {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

#[async_trait]
impl Stage for PrefixTableStage {
    fn interests(&self) -> &[PacketKind] {
        &[PacketKind::ImportTable]
    }

    async fn before(&self, message: &mut Message) -> Result<(), Error> {
        let import = message.packets.import_table_mut()?;
        import.dest_table = format!("{}_{}", self.prefix, import.dest_table);

        Ok(())
    }
}

/// Skips tables based on glob inclusion and exclusion lists.
///
/// A table forwards iff it matches no excluded pattern and either matches
/// some included pattern or no inclusion list was given.
pub struct SkipTableStage {
    included: Option<Vec<Pattern>>,
    excluded: Option<Vec<Pattern>>,
}

impl SkipTableStage {
    pub fn new<I, S>(included: Option<I>, excluded: Option<I>) -> Result<Self, glob::PatternError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Ok(Self {
            included: included.map(compile_patterns).transpose()?,
            excluded: excluded.map(compile_patterns).transpose()?,
        })
    }

    fn is_filtered(&self, table: &str) -> bool {
        if let Some(excluded) = &self.excluded {
            if excluded.iter().any(|pattern| pattern.matches(table)) {
                return true;
            }
        }

        let Some(included) = &self.included else {
            return false;
        };

        !included.iter().any(|pattern| pattern.matches(table))
    }
}

fn compile_patterns<I, S>(patterns: I) -> Result<Vec<Pattern>, glob::PatternError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    patterns
        .into_iter()
        .map(|pattern| Pattern::new(pattern.as_ref()))
        .collect()
}

#[async_trait]
impl Stage for SkipTableStage {
    fn interests(&self) -> &[PacketKind] {
        &[PacketKind::ImportTable]
    }

    async fn process(&self, message: &mut Message) -> StageResult {
        let table = message.packets.import_table()?.src_table.clone();

        if self.is_filtered(&table) {
            debug!("skipping table {}", table);
            return Ok(crate::stage::Outcome::Skipped);
        }

        message.forward().await
    }
}

/// Drops every table until one matches the pattern, then passes that table
/// and all following ones.
pub struct SkipUntilStage {
    pattern: Pattern,
    include_matched: bool,
    matched: AtomicBool,
}

impl SkipUntilStage {
    pub fn new(pattern: &str, include_matched: bool) -> Result<Self, glob::PatternError> {
        Ok(Self {
            pattern: Pattern::new(pattern)?,
            include_matched,
            matched: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl Stage for SkipUntilStage {
    fn interests(&self) -> &[PacketKind] {
        &[PacketKind::ImportTable]
    }

    async fn process(&self, message: &mut Message) -> StageResult {
        if self.matched.load(Ordering::Acquire) {
            return message.forward().await;
        }

        let table = message.packets.import_table()?.src_table.clone();

        if self.pattern.matches(&table) {
            self.matched.store(true, Ordering::Release);

            if self.include_matched {
                return message.forward().await;
            }
        } else {
            debug!("skipping table {} until the pattern matches", table);
        }

        Ok(crate::stage::Outcome::Skipped)
    }
}

/// When a pacing stage acts relative to the wrapped pipeline section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum When {
    Before,
    After,
}

/// Pauses the pipeline for a fixed delay before or after the import.
pub struct DelayStage {
    delay: Duration,
    when: When,
}

impl DelayStage {
    pub fn new(delay: Duration, when: When) -> Self {
        Self { delay, when }
    }
}

#[async_trait]
impl Stage for DelayStage {
    fn interests(&self) -> &[PacketKind] {
        ALL_PACKETS
    }

    async fn before(&self, _message: &mut Message) -> Result<(), Error> {
        if self.when == When::Before {
            tokio::time::sleep(self.delay).await;
        }

        Ok(())
    }

    async fn after(&self, _message: &Message, _skipped: bool, _success: bool) -> Result<(), Error> {
        if self.when == When::After {
            tokio::time::sleep(self.delay).await;
        }

        Ok(())
    }
}

/// Waits for operator input before or after the import.
pub struct PromptInputStage {
    prompt: String,
    when: When,
}

impl PromptInputStage {
    pub fn new(prompt: impl Into<String>, when: When) -> Self {
        Self {
            prompt: prompt.into(),
            when,
        }
    }

    async fn prompt(&self) -> Result<(), Error> {
        let prompt = self.prompt.clone();

        tokio::task::spawn_blocking(move || {
            use std::io::{BufRead, Write};

            let mut stdout = std::io::stdout();
            write!(stdout, "{} ", prompt)?;
            stdout.flush()?;

            let mut line = String::new();
            std::io::stdin().lock().read_line(&mut line)?;

            Ok::<(), std::io::Error>(())
        })
        .await
        .map_err(|err| Error::Request(err.to_string()))??;

        Ok(())
    }
}

#[async_trait]
impl Stage for PromptInputStage {
    fn interests(&self) -> &[PacketKind] {
        ALL_PACKETS
    }

    async fn before(&self, _message: &mut Message) -> Result<(), Error> {
        if self.when == When::Before {
            self.prompt().await?;
        }

        Ok(())
    }

    async fn after(&self, _message: &Message, _skipped: bool, _success: bool) -> Result<(), Error> {
        if self.when == When::After {
            self.prompt().await?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn skip_stage(
        included: Option<Vec<&str>>,
        excluded: Option<Vec<&str>>,
    ) -> SkipTableStage {
        SkipTableStage::new(included, excluded).unwrap()
    }

    #[test]
    fn forwards_everything_without_patterns() {
        let stage = skip_stage(None, None);
        assert!(!stage.is_filtered("anything"));
    }

    #[test]
    fn excluded_tables_are_filtered() {
        let stage = skip_stage(None, Some(vec!["tmp_*"]));

        assert!(stage.is_filtered("tmp_orders"));
        assert!(!stage.is_filtered("orders"));
    }

    #[test]
    fn inclusion_list_filters_non_matches() {
        let stage = skip_stage(Some(vec!["orders", "users"]), None);

        assert!(!stage.is_filtered("orders"));
        assert!(stage.is_filtered("payments"));
    }

    #[test]
    fn exclusion_wins_over_inclusion() {
        let stage = skip_stage(Some(vec!["*"]), Some(vec!["orders"]));

        assert!(stage.is_filtered("orders"));
        assert!(!stage.is_filtered("users"));
    }
}
