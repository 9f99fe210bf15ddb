//! Sizing of the `system.profile` capped collection and profiling control.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{info, warn};

use crate::config::{ProfilerConfig, ProfilingLevel, SYSTEM_PROFILE};
use crate::error::{ProfilerError, ServerCondition, StoreError};
use crate::store::StoreHandle;

/// Owns the size of the profiler buffer on the listened database.
///
/// The size counter starts at zero and only [`grow`](Self::grow) writes it,
/// so the first call creates a buffer of one increment.
pub struct BufferSizer<S: ?Sized> {
    store: Arc<S>,
    level: ProfilingLevel,
    slow_ms: u64,
    increment: u64,
    size: AtomicU64,
}

impl<S: StoreHandle + ?Sized> BufferSizer<S> {
    pub fn new(store: Arc<S>, config: &ProfilerConfig) -> Self {
        Self {
            store,
            level: config.level,
            slow_ms: config.slow_ms,
            increment: config.size_increment,
            size: AtomicU64::new(0),
        }
    }

    /// Size in bytes of the buffer created by the last successful resize.
    pub fn current_size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    /// Recreates `system.profile` one increment larger than `current_size`
    /// and turns profiling back on. Returns the new size.
    ///
    /// Everything captured in the old buffer is lost.
    pub async fn prepare(&self, current_size: u64) -> Result<u64, ProfilerError> {
        let resize_err = |source: StoreError| ProfilerError::Resize {
            collection: SYSTEM_PROFILE,
            source,
        };

        if let Err(e) = self.store.disable_profiling().await {
            warn!(error = %e, "failed to disable profiling before resize");
        }

        match self.store.drop_collection(SYSTEM_PROFILE).await {
            Ok(()) => {}
            Err(e) if e.is(ServerCondition::NamespaceNotFound) => {}
            Err(e) => return Err(resize_err(e)),
        }

        let new_size = current_size.saturating_add(self.increment);
        match self
            .store
            .create_capped_collection(SYSTEM_PROFILE, new_size)
            .await
        {
            Ok(()) => {}
            Err(e) if e.is(ServerCondition::AlreadyExists) => {}
            Err(e) => return Err(resize_err(e)),
        }

        self.store
            .set_profiling_level(self.level, self.slow_ms)
            .await
            .map_err(resize_err)?;

        Ok(new_size)
    }

    /// Grows the buffer by one increment. Called at startup and on every
    /// buffer overflow.
    pub async fn grow(&self) -> Result<u64, ProfilerError> {
        let current = self.current_size();
        let new_size = self.prepare(current).await?;
        self.size.store(new_size, Ordering::Release);
        info!(
            database = %self.store.target().database,
            previous_bytes = current,
            size_bytes = new_size,
            level = self.level.as_i32(),
            slow_ms = self.slow_ms,
            "profiling enabled"
        );
        Ok(new_size)
    }

    /// Turns profiling off on the listened database.
    pub async fn disable(&self) -> Result<(), ProfilerError> {
        self.store
            .disable_profiling()
            .await
            .map_err(ProfilerError::Teardown)?;
        info!(database = %self.store.target().database, "profiling disabled");
        Ok(())
    }
}
