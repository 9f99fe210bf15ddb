//! Connection establishment with exponential backoff.

use tracing::{info, warn};

use super::StoreHandle;
use crate::config::RetryPolicy;
use crate::error::{ProfilerError, StoreError};

/// Pings `store` until it answers, waiting `policy.delay_before(n)` between
/// attempts. Gives up after `policy.max_attempts`.
pub async fn connect_with_retry<S>(store: &S, policy: &RetryPolicy) -> Result<(), ProfilerError>
where
    S: StoreHandle + ?Sized,
{
    let hosts = store.target().host_label();
    let attempts = policy.max_attempts.max(1);
    let mut last_error = StoreError::Connect("no attempt made".to_string());

    for attempt in 0..attempts {
        if attempt > 0 {
            let delay = policy.delay_before(attempt);
            warn!(
                hosts = %hosts,
                error = %last_error,
                retry_in_ms = delay.as_millis() as u64,
                "connection attempt failed"
            );
            tokio::time::sleep(delay).await;
        }

        info!(hosts = %hosts, attempt = attempt + 1, "connecting");
        match store.ping().await {
            Ok(()) => {
                info!(hosts = %hosts, database = %store.target().database, "connected");
                return Ok(());
            }
            Err(e) => last_error = e,
        }
    }

    Err(ProfilerError::Connect {
        attempts,
        source: last_error,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, StoreCall, StoreOp};
    use std::time::Duration;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_secs(10),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures() {
        let store = MemoryStore::new("app");
        store.fail_next(StoreOp::Ping, StoreError::Connect("refused".to_string()));
        store.fail_next(StoreOp::Ping, StoreError::Connect("refused".to_string()));

        let start = tokio::time::Instant::now();
        connect_with_retry(&store, &policy()).await.unwrap();

        // 10s + 20s of backoff.
        assert!(start.elapsed() >= Duration::from_secs(30));
        assert_eq!(store.calls().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let store = MemoryStore::new("app");
        for _ in 0..3 {
            store.fail_next(StoreOp::Ping, StoreError::Connect("refused".to_string()));
        }

        let err = connect_with_retry(&store, &policy()).await.unwrap_err();
        match err {
            ProfilerError::Connect { attempts, source } => {
                assert_eq!(attempts, 3);
                assert!(matches!(source, StoreError::Connect(_)));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(
            store.calls(),
            vec![StoreCall::Ping, StoreCall::Ping, StoreCall::Ping]
        );
    }
}
