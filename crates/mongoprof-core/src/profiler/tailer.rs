//! Tailing state machine over `system.profile`.

use std::sync::Arc;
use std::time::Duration;

use bson::{DateTime, Document, doc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::dispatch::DispatchSender;
use super::sizing::BufferSizer;
use super::watermark::Watermark;
use crate::config::{ProfilerConfig, SYSTEM_PROFILE};
use crate::entry::entry_timestamp;
use crate::error::{ProfilerError, ServerCondition};
use crate::store::{StoreHandle, TailCursor};

/// Where the tailer is between polls.
pub enum TailerState {
    Uninitialized,
    CursorActive(Box<dyn TailCursor>),
    /// Waiting until the deadline before reopening the cursor.
    AwaitingRetry(Instant),
    Stopped,
}

impl TailerState {
    pub fn name(&self) -> &'static str {
        match self {
            TailerState::Uninitialized => "uninitialized",
            TailerState::CursorActive(_) => "cursor_active",
            TailerState::AwaitingRetry(_) => "awaiting_retry",
            TailerState::Stopped => "stopped",
        }
    }
}

impl std::fmt::Debug for TailerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Query selecting entries of `database`, excluding the profiler's own
/// collection, newer than `since`.
pub fn cursor_filter(database: &str, since: DateTime) -> Document {
    doc! {
        "ns": {
            "$regex": format!("^{}\\.", database),
            "$ne": format!("{}.{}", database, SYSTEM_PROFILE),
        },
        "ts": { "$gt": since },
    }
}

/// Requests a running [`Tailer`] to stop.
#[derive(Clone)]
pub struct TailerHandle {
    stop: CancellationToken,
}

impl TailerHandle {
    pub fn stop(&self) {
        self.stop.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }
}

/// Keeps one tailable cursor open on the listened database and forwards
/// every new entry to the dispatcher.
pub struct Tailer<S: ?Sized> {
    store: Arc<S>,
    sizer: Arc<BufferSizer<S>>,
    watermark: Watermark,
    retry_after: Duration,
    stop: CancellationToken,
}

impl<S: StoreHandle + ?Sized> Tailer<S> {
    /// Cancelling `parent` stops the tailer just like [`TailerHandle::stop`].
    pub fn new(
        store: Arc<S>,
        sizer: Arc<BufferSizer<S>>,
        config: &ProfilerConfig,
        parent: &CancellationToken,
    ) -> (Self, TailerHandle) {
        let stop = parent.child_token();
        let tailer = Self {
            store,
            sizer,
            watermark: Watermark::new(config.watermark),
            retry_after: config.retry_after,
            stop: stop.clone(),
        };
        (tailer, TailerHandle { stop })
    }

    /// Runs until stopped. Returns an error only for cursor failures other
    /// than buffer overflow, or when growing the buffer fails.
    pub async fn run(self, sender: DispatchSender) -> Result<(), ProfilerError> {
        info!(database = %self.store.target().database, "tailing system.profile");

        let mut state = TailerState::Uninitialized;
        loop {
            if self.stop.is_cancelled() {
                state = TailerState::Stopped;
            }
            state = match state {
                TailerState::Uninitialized => self.open().await,
                TailerState::CursorActive(cursor) => self.poll(cursor, &sender).await?,
                TailerState::AwaitingRetry(deadline) => self.wait(deadline).await,
                TailerState::Stopped => break,
            };
        }

        info!(database = %self.store.target().database, "tailer stopped");
        Ok(())
    }

    fn retry_state(&self) -> TailerState {
        TailerState::AwaitingRetry(Instant::now() + self.retry_after)
    }

    async fn open(&self) -> TailerState {
        let since = self.watermark.get();
        let filter = cursor_filter(&self.store.target().database, since);

        let opened = tokio::select! {
            biased;
            _ = self.stop.cancelled() => return TailerState::Stopped,
            r = self.store.open_tail_cursor(SYSTEM_PROFILE, filter) => r,
        };

        match opened {
            Ok(cursor) => {
                debug!(since = %since, "cursor opened");
                TailerState::CursorActive(cursor)
            }
            Err(e) => {
                warn!(
                    error = %e,
                    retry_in_secs = self.retry_after.as_secs(),
                    "failed to open cursor"
                );
                self.retry_state()
            }
        }
    }

    async fn poll(
        &self,
        mut cursor: Box<dyn TailCursor>,
        sender: &DispatchSender,
    ) -> Result<TailerState, ProfilerError> {
        let next = tokio::select! {
            biased;
            _ = self.stop.cancelled() => return Ok(TailerState::Stopped),
            r = cursor.try_next() => r,
        };

        match next {
            Ok(Some(raw)) => {
                if let Some(ts) = entry_timestamp(&raw) {
                    self.watermark.observe(ts);
                }
                sender.send(raw);
                Ok(TailerState::CursorActive(cursor))
            }
            Ok(None) if cursor.is_exhausted() => {
                info!(
                    retry_in_secs = self.retry_after.as_secs(),
                    "cursor exhausted, reopening"
                );
                Ok(self.retry_state())
            }
            Ok(None) => Ok(TailerState::CursorActive(cursor)),
            Err(e) if e.is(ServerCondition::BufferOverflow) => {
                warn!(
                    error = %e,
                    size_bytes = self.sizer.current_size(),
                    "profile buffer overflowed, growing"
                );
                drop(cursor);
                self.sizer.grow().await?;
                Ok(self.retry_state())
            }
            Err(source) => {
                error!(error = %source, "cursor failed");
                Err(ProfilerError::Cursor {
                    collection: SYSTEM_PROFILE,
                    source,
                })
            }
        }
    }

    async fn wait(&self, deadline: Instant) -> TailerState {
        tokio::select! {
            biased;
            _ = self.stop.cancelled() => TailerState::Stopped,
            _ = tokio::time::sleep_until(deadline) => TailerState::Uninitialized,
        }
    }
}
