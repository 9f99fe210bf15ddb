//! Fire-and-forget delivery of profile entries to a handler.
//!
//! The tailer pushes entries into a bounded queue that a fixed set of worker
//! tasks drains. Pushing never waits: when the queue is full the oldest
//! queued entry is discarded, so a slow handler costs entries, never cursor
//! progress. Entries may be handled in any order.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use bson::RawDocumentBuf;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::DispatchConfig;

/// Consumer of raw profile entries. Runs concurrently with itself.
#[async_trait]
pub trait EntryHandler: Send + Sync + 'static {
    async fn handle(&self, raw: RawDocumentBuf);
}

struct Shared {
    queue: Mutex<VecDeque<RawDocumentBuf>>,
    capacity: usize,
    ready: Notify,
    closed: CancellationToken,
    dropped: AtomicU64,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, VecDeque<RawDocumentBuf>> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn pop(&self) -> Option<RawDocumentBuf> {
        self.lock().pop_front()
    }
}

/// Cloneable, non-blocking entry point into a [`Dispatcher`].
#[derive(Clone)]
pub struct DispatchSender {
    shared: Arc<Shared>,
}

impl DispatchSender {
    /// Queues `raw` for a worker. Returns `false` when an older entry had
    /// to be discarded to make room, or when the dispatcher is shut down.
    pub fn send(&self, raw: RawDocumentBuf) -> bool {
        if self.shared.closed.is_cancelled() {
            return false;
        }
        let evicted = {
            let mut queue = self.shared.lock();
            let evicted = if queue.len() >= self.shared.capacity {
                queue.pop_front().is_some()
            } else {
                false
            };
            queue.push_back(raw);
            evicted
        };
        self.shared.ready.notify_one();

        if evicted {
            let dropped = self.shared.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            warn!(
                dropped_total = dropped,
                capacity = self.shared.capacity,
                "dispatch queue full, discarded oldest entry"
            );
        }
        !evicted
    }
}

/// Bounded drop-oldest queue drained by worker tasks.
pub struct Dispatcher {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl Dispatcher {
    /// Spawns `config.workers` tasks on the current runtime.
    pub fn start(config: DispatchConfig, handler: Arc<dyn EntryHandler>) -> Self {
        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::with_capacity(config.capacity)),
            capacity: config.capacity.max(1),
            ready: Notify::new(),
            closed: CancellationToken::new(),
            dropped: AtomicU64::new(0),
        });

        let workers = (0..config.workers.max(1))
            .map(|id| tokio::spawn(worker(id, shared.clone(), handler.clone())))
            .collect();

        info!(
            workers = config.workers,
            capacity = config.capacity,
            "dispatcher started"
        );

        Self { shared, workers }
    }

    pub fn sender(&self) -> DispatchSender {
        DispatchSender {
            shared: self.shared.clone(),
        }
    }

    /// Entries waiting for a worker.
    pub fn queued(&self) -> usize {
        self.shared.lock().len()
    }

    /// Entries discarded because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    /// Stops accepting entries, lets the workers drain the queue and waits
    /// for them to exit.
    pub async fn shutdown(self) {
        self.shared.closed.cancel();
        let pending = self.queued();
        for handle in self.workers {
            if let Err(e) = handle.await {
                warn!(error = %e, "dispatch worker panicked");
            }
        }
        info!(
            drained = pending,
            dropped = self.shared.dropped.load(Ordering::Relaxed),
            "dispatcher stopped"
        );
    }
}

async fn worker(id: usize, shared: Arc<Shared>, handler: Arc<dyn EntryHandler>) {
    loop {
        if let Some(raw) = shared.pop() {
            handler.handle(raw).await;
            continue;
        }
        if shared.closed.is_cancelled() {
            break;
        }
        tokio::select! {
            _ = shared.ready.notified() => {}
            _ = shared.closed.cancelled() => {}
        }
    }
    debug!(worker = id, "dispatch worker exited");
}
