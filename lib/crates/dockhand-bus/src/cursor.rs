//! Per-consumer reader over an ordered log.

use std::sync::Arc;
use std::time::Duration;

use crate::error::TransportError;
use crate::transport::{Cursor, LogEntry, OrderedLog};

const DEFAULT_WAIT: Duration = Duration::from_secs(5);
const DEFAULT_IDLE_BACKOFF: Duration = Duration::from_millis(500);
const DEFAULT_BATCH: usize = 100;

/// Reads a stream from its origin, moving the cursor past every entry it
/// hands out. The cursor only moves forward, so an entry is never returned
/// twice by the same reader.
pub struct CursorReader {
    log: Arc<dyn OrderedLog>,
    stream: String,
    cursor: Cursor,
    wait: Duration,
    idle_backoff: Duration,
    batch: usize,
}

impl CursorReader {
    pub fn new(log: Arc<dyn OrderedLog>, stream: impl Into<String>) -> Self {
        Self {
            log,
            stream: stream.into(),
            cursor: Cursor::Origin,
            wait: DEFAULT_WAIT,
            idle_backoff: DEFAULT_IDLE_BACKOFF,
            batch: DEFAULT_BATCH,
        }
    }

    /// How long a single read blocks on the broker.
    #[must_use]
    pub fn with_wait(mut self, wait: Duration) -> Self {
        self.wait = wait;
        self
    }

    /// Pause after an empty read or a read error.
    #[must_use]
    pub fn with_idle_backoff(mut self, backoff: Duration) -> Self {
        self.idle_backoff = backoff;
        self
    }

    /// Resume from `cursor` instead of the origin.
    #[must_use]
    pub fn with_cursor(mut self, cursor: Cursor) -> Self {
        self.cursor = cursor;
        self
    }

    #[must_use]
    pub fn with_batch(mut self, batch: usize) -> Self {
        self.batch = batch.max(1);
        self
    }

    pub fn cursor(&self) -> &Cursor {
        &self.cursor
    }

    pub fn set_wait(&mut self, wait: Duration) {
        self.wait = wait;
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    /// One read. Returns whatever arrived, possibly nothing.
    ///
    /// # Errors
    ///
    /// Returns the underlying [`TransportError`]; the cursor is unchanged.
    pub async fn poll(&mut self) -> Result<Vec<LogEntry>, TransportError> {
        let entries = self
            .log
            .read_from(&self.stream, &self.cursor, self.batch, self.wait)
            .await?;
        if let Some(last) = entries.last() {
            self.cursor = Cursor::After(last.id.clone());
        }
        Ok(entries)
    }

    /// Read until at least one entry arrives.
    ///
    /// Empty reads and errors sleep for the idle backoff and retry, so this
    /// only returns when there is something to deliver. Cancel it with
    /// `select!` to stop.
    pub async fn next_batch(&mut self) -> Vec<LogEntry> {
        loop {
            match self.poll().await {
                Ok(entries) if !entries.is_empty() => return entries,
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(stream = %self.stream, error = %e, "stream read failed, retrying");
                }
            }
            tokio::time::sleep(self.idle_backoff).await;
        }
    }
}
