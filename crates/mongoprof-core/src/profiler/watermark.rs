use std::sync::atomic::{AtomicI64, Ordering};

use bson::DateTime;

use crate::config::WatermarkPolicy;

/// Timestamp of the newest profile entry seen, in milliseconds since epoch.
///
/// Reopened cursors only see entries strictly newer than this value. Written
/// by the tailer only.
#[derive(Debug)]
pub struct Watermark {
    millis: AtomicI64,
    policy: WatermarkPolicy,
}

impl Watermark {
    pub fn new(policy: WatermarkPolicy) -> Self {
        Self {
            millis: AtomicI64::new(0),
            policy,
        }
    }

    pub fn get(&self) -> DateTime {
        DateTime::from_millis(self.millis.load(Ordering::Acquire))
    }

    /// Records an observed entry timestamp. Never moves backwards; a no-op
    /// under [`WatermarkPolicy::Fixed`].
    pub fn observe(&self, ts: DateTime) {
        if self.policy == WatermarkPolicy::Fixed {
            return;
        }
        self.millis
            .fetch_max(ts.timestamp_millis(), Ordering::AcqRel);
    }
}

impl Default for Watermark {
    fn default() -> Self {
        Self::new(WatermarkPolicy::default())
    }
}
