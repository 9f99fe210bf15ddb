//! Runtime configuration for the profiler, dispatcher and persistence layer.

use std::time::Duration;

use crate::error::ConfigError;

/// Name of the capped collection the server writes profiler entries to.
pub const SYSTEM_PROFILE: &str = "system.profile";
/// Growth step (and initial size) of `system.profile`.
pub const SYSTEM_PROFILE_SIZE_INCREMENT: u64 = 1024 * 1024;
/// Server default for the slow operation threshold.
pub const DEFAULT_SLOW_MS: u64 = 100;
/// Pause between cursor rebuilds.
pub const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(10);
/// Upper bound of a single cursor poll when no entry is available.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Aggregate collection.
pub const SLOWOPS_COLLECTION: &str = "slowops";
/// Example collection, one document per (query shape, namespace).
pub const SLOWOPS_EXAMPLE_COLLECTION: &str = "slowops.examples";
/// Retention of stored records: 3 months.
pub const SLOWOPS_EXPIRE_SECONDS: u64 = 7_884_000;

/// Profiler verbosity as understood by the `profile` command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProfilingLevel {
    Off,
    /// Only operations slower than `slowms`.
    #[default]
    SlowOnly,
    All,
}

impl ProfilingLevel {
    pub fn as_i32(self) -> i32 {
        match self {
            ProfilingLevel::Off => 0,
            ProfilingLevel::SlowOnly => 1,
            ProfilingLevel::All => 2,
        }
    }
}

impl TryFrom<u8> for ProfilingLevel {
    type Error = ConfigError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ProfilingLevel::Off),
            1 => Ok(ProfilingLevel::SlowOnly),
            2 => Ok(ProfilingLevel::All),
            other => Err(ConfigError::InvalidValue {
                field: "profile level",
                reason: format!("{} is not one of 0, 1, 2", other),
            }),
        }
    }
}

/// How the tailer's "last seen" timestamp evolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WatermarkPolicy {
    /// Advance to the `ts` of every observed entry, so a rebuilt cursor
    /// resumes after the last entry seen.
    #[default]
    Advance,
    /// Never advance; every rebuilt cursor replays the whole capped
    /// collection.
    Fixed,
}

/// Configuration of profiling control and the tailing loop.
#[derive(Debug, Clone)]
pub struct ProfilerConfig {
    pub level: ProfilingLevel,
    pub slow_ms: u64,
    /// Bytes added to `system.profile` on every resize.
    pub size_increment: u64,
    pub retry_after: Duration,
    pub poll_interval: Duration,
    pub watermark: WatermarkPolicy,
}

impl Default for ProfilerConfig {
    fn default() -> Self {
        Self {
            level: ProfilingLevel::SlowOnly,
            slow_ms: DEFAULT_SLOW_MS,
            size_increment: SYSTEM_PROFILE_SIZE_INCREMENT,
            retry_after: DEFAULT_RETRY_AFTER,
            poll_interval: DEFAULT_POLL_INTERVAL,
            watermark: WatermarkPolicy::Advance,
        }
    }
}

impl ProfilerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.level == ProfilingLevel::Off {
            return Err(ConfigError::InvalidValue {
                field: "profile level",
                reason: "profiling must be enabled (1 or 2)".to_string(),
            });
        }
        if self.size_increment == 0 {
            return Err(ConfigError::InvalidValue {
                field: "size increment",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.poll_interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "poll interval",
                reason: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }
}

/// Sizing of the entry dispatcher.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Number of worker tasks running the entry handler.
    pub workers: usize,
    /// Maximum queued entries; beyond this the oldest entry is dropped.
    pub capacity: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            workers: 8,
            capacity: 1024,
        }
    }
}

impl DispatchConfig {
    pub fn new(workers: usize, capacity: usize) -> Self {
        Self {
            workers: workers.max(1),
            capacity: capacity.max(1),
        }
    }
}

/// Expiry of persisted records.
#[derive(Debug, Clone)]
pub struct RetentionConfig {
    pub expire_after: Duration,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            expire_after: Duration::from_secs(SLOWOPS_EXPIRE_SECONDS),
        }
    }
}

impl RetentionConfig {
    pub fn new(expire_after: Duration) -> Self {
        Self { expire_after }
    }
}

/// Connection retry with exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Delay before the second attempt; doubled after every failure.
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: DEFAULT_RETRY_AFTER,
        }
    }
}

impl RetryPolicy {
    /// Delay to wait before attempt number `attempt` (0-based).
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        self.base_delay
            .saturating_mul(2u32.saturating_pow(attempt - 1))
    }
}
