//! Retention-bounded, deduplicating persistence of slow operations.
//!
//! ```text
//! ProfileEntry ──┬── to_slow_op_record() ──► slowops            (append, TTL on timestamp)
//!                └── to_example_record() ──► slowops.examples   (unique queryHash+collection)
//! ```
//!
//! Writes are best-effort: failures are logged and never reach the caller.
//! Only [`SlowOpsWriter::init`] can fail, and it is fatal to startup.

mod pipeline;
mod records;

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::{RetentionConfig, SLOWOPS_COLLECTION, SLOWOPS_EXAMPLE_COLLECTION};
use crate::error::{ProfilerError, ServerCondition};
use crate::store::{IndexSpec, StoreHandle};

pub use pipeline::SlowOpsPipeline;
pub use records::{SlowOpExampleRecord, SlowOpRecord};

/// Writer for the `slowops` and `slowops.examples` collections of the internal store.
pub struct SlowOpsWriter<S: ?Sized> {
    store: Arc<S>,
    retention: RetentionConfig,
}

impl<S: StoreHandle + ?Sized> SlowOpsWriter<S> {
    pub fn new(store: Arc<S>, retention: RetentionConfig) -> Self {
        Self { store, retention }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    fn aggregate_indexes(&self) -> Vec<IndexSpec> {
        vec![
            IndexSpec::ascending(&["timestamp"]).expire_after(self.retention.expire_after),
            IndexSpec::ascending(&["planHash"]),
            IndexSpec::ascending(&["queryHash"]),
        ]
    }

    fn example_indexes(&self) -> Vec<IndexSpec> {
        vec![
            IndexSpec::ascending(&["planHash"]).expire_after(self.retention.expire_after),
            IndexSpec::ascending(&["queryHash", "collection"]).unique(),
        ]
    }

    /// Creates both collections and their indexes. Safe to run against an
    /// already initialized store.
    pub async fn init(&self) -> Result<(), ProfilerError> {
        self.ensure_collection(SLOWOPS_COLLECTION, &self.aggregate_indexes())
            .await?;
        self.ensure_collection(SLOWOPS_EXAMPLE_COLLECTION, &self.example_indexes())
            .await?;
        info!(
            database = %self.store.target().database,
            "slowops collections ready"
        );
        Ok(())
    }

    async fn ensure_collection(
        &self,
        collection: &'static str,
        indexes: &[IndexSpec],
    ) -> Result<(), ProfilerError> {
        match self.store.create_collection(collection).await {
            Ok(()) => debug!(collection, "created collection"),
            Err(e) if e.is(ServerCondition::AlreadyExists) => {}
            Err(source) => return Err(ProfilerError::Init { collection, source }),
        }
        // One call per index so a conflicting one does not keep the rest
        // from being created.
        for spec in indexes {
            match self
                .store
                .create_indexes(collection, std::slice::from_ref(spec))
                .await
            {
                Ok(()) => {}
                Err(e) if e.is(ServerCondition::AlreadyExists) => {}
                Err(e) if e.is(ServerCondition::IndexOptionsConflict) => warn!(
                    collection,
                    keys = ?spec.keys,
                    expire_after_secs = ?spec.expire_after.map(|d| d.as_secs()),
                    error = %e,
                    "index exists with other options, keeping the existing one; \
                     drop it to apply the new retention"
                ),
                Err(source) => return Err(ProfilerError::Init { collection, source }),
            }
        }
        Ok(())
    }

    pub async fn insert_aggregate(&self, record: &SlowOpRecord) {
        let result = match record.to_document() {
            Ok(doc) => self.store.insert_one(SLOWOPS_COLLECTION, doc).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!(
                collection = SLOWOPS_COLLECTION,
                ns = %record.collection,
                error = %e,
                "failed to store slow op"
            );
        }
    }

    /// Stores `record` unless an example for its shape and namespace exists.
    pub async fn insert_example(&self, record: &SlowOpExampleRecord) {
        let result = self
            .store
            .insert_raw(SLOWOPS_EXAMPLE_COLLECTION, record.to_raw_document())
            .await;
        match result {
            Ok(()) => debug!(
                query_hash = %record.query_hash,
                ns = %record.collection,
                "stored new example"
            ),
            Err(e) if e.is(ServerCondition::DuplicateKey) => {}
            Err(e) => warn!(
                collection = SLOWOPS_EXAMPLE_COLLECTION,
                query_hash = %record.query_hash,
                ns = %record.collection,
                error = %e,
                "failed to store slow op example"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::ProfileEntry;
    use crate::error::{DUPLICATE_KEY, NAMESPACE_EXISTS, StoreError};
    use crate::store::{MemoryStore, StoreCall, StoreOp};
    use bson::{RawDocumentBuf, doc};
    use std::time::Duration;

    fn writer() -> SlowOpsWriter<MemoryStore> {
        SlowOpsWriter::new(
            Arc::new(MemoryStore::new("profiler")),
            RetentionConfig::default(),
        )
    }

    fn example(query_hash: &str, ns: &str, millis: i32) -> SlowOpExampleRecord {
        let raw = doc! { "op": "query", "ns": ns, "queryHash": query_hash, "millis": millis };
        ProfileEntry::from_raw(RawDocumentBuf::from_document(&raw).unwrap(), "db1")
            .unwrap()
            .to_example_record()
    }

    #[tokio::test]
    async fn init_creates_collections_and_indexes() {
        let w = writer();
        w.init().await.unwrap();

        let store = w.store();
        assert!(store.has_collection(SLOWOPS_COLLECTION));
        assert!(store.has_collection(SLOWOPS_EXAMPLE_COLLECTION));

        let ttl = Duration::from_secs(7_884_000);
        let aggregate = store.indexes(SLOWOPS_COLLECTION);
        assert_eq!(aggregate.len(), 3);
        assert_eq!(aggregate[0].keys, vec!["timestamp"]);
        assert_eq!(aggregate[0].expire_after, Some(ttl));

        let examples = store.indexes(SLOWOPS_EXAMPLE_COLLECTION);
        assert_eq!(examples[0].keys, vec!["planHash"]);
        assert_eq!(examples[0].expire_after, Some(ttl));
        assert_eq!(examples[1].keys, vec!["queryHash", "collection"]);
        assert!(examples[1].unique);
    }

    #[tokio::test]
    async fn init_is_idempotent() {
        let w = writer();
        w.init().await.unwrap();
        w.init().await.unwrap();
        assert_eq!(w.store().indexes(SLOWOPS_COLLECTION).len(), 3);
    }

    #[tokio::test]
    async fn init_tolerates_existing_collection_error() {
        let w = writer();
        w.store().fail_next(
            StoreOp::CreateCollection,
            StoreError::server(NAMESPACE_EXISTS, "exists"),
        );
        w.init().await.unwrap();
    }

    #[tokio::test]
    async fn changed_retention_keeps_existing_ttl_and_other_indexes() {
        let w = writer();
        w.init().await.unwrap();

        let restarted = SlowOpsWriter::new(
            Arc::clone(w.store()),
            RetentionConfig::new(Duration::from_secs(86_400)),
        );
        restarted.init().await.unwrap();

        let store = restarted.store();
        let ttl = Some(Duration::from_secs(7_884_000));
        let aggregate = store.indexes(SLOWOPS_COLLECTION);
        assert_eq!(aggregate.len(), 3);
        assert_eq!(aggregate[0].expire_after, ttl);
        let examples = store.indexes(SLOWOPS_EXAMPLE_COLLECTION);
        assert_eq!(examples.len(), 2);
        assert_eq!(examples[0].expire_after, ttl);

        // Each index is requested on its own.
        let per_index = store
            .calls()
            .iter()
            .filter(|c| matches!(c, StoreCall::CreateIndexes { specs: 1, .. }))
            .count();
        assert_eq!(per_index, 10);
    }

    #[tokio::test]
    async fn indexes_after_a_conflict_are_still_created() {
        let store = Arc::new(MemoryStore::new("profiler"));
        store
            .create_indexes(
                SLOWOPS_COLLECTION,
                &[IndexSpec::ascending(&["timestamp"]).expire_after(Duration::from_secs(60))],
            )
            .await
            .unwrap();

        let w = SlowOpsWriter::new(Arc::clone(&store), RetentionConfig::default());
        w.init().await.unwrap();

        let aggregate = store.indexes(SLOWOPS_COLLECTION);
        assert_eq!(aggregate.len(), 3);
        assert_eq!(aggregate[0].expire_after, Some(Duration::from_secs(60)));
        assert_eq!(aggregate[1].keys, vec!["planHash"]);
        assert_eq!(aggregate[2].keys, vec!["queryHash"]);
    }

    #[tokio::test]
    async fn init_fails_on_other_errors() {
        let w = writer();
        w.store().fail_next(
            StoreOp::CreateIndexes,
            StoreError::server(13, "not authorized"),
        );
        match w.init().await.unwrap_err() {
            ProfilerError::Init { collection, source } => {
                assert_eq!(collection, SLOWOPS_COLLECTION);
                assert_eq!(source.condition(), Some(ServerCondition::Other(13)));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn same_shape_keeps_first_example() {
        let w = writer();
        w.init().await.unwrap();

        w.insert_example(&example("FFF0C0D3", "app.orders", 120)).await;
        w.insert_example(&example("FFF0C0D3", "app.orders", 950)).await;

        let stored = w.store().documents(SLOWOPS_EXAMPLE_COLLECTION);
        assert_eq!(stored.len(), 1);
        let original = stored[0].get_document("document").unwrap();
        assert_eq!(original.get_i32("millis").unwrap(), 120);
        assert_eq!(stored[0].get_str("planHash").unwrap(), "");
    }

    #[tokio::test]
    async fn example_document_is_stored_byte_for_byte() {
        let w = writer();
        w.init().await.unwrap();

        let record = example("FFF0C0D3", "app.orders", 120);
        w.insert_example(&record).await;

        let raw = w.store().raw_documents(SLOWOPS_EXAMPLE_COLLECTION);
        assert_eq!(raw.len(), 1);
        assert_eq!(
            raw[0].get_document("document").unwrap().as_bytes(),
            record.document.as_bytes()
        );
    }

    #[tokio::test]
    async fn same_shape_in_other_namespace_is_kept() {
        let w = writer();
        w.init().await.unwrap();

        w.insert_example(&example("FFF0C0D3", "app.orders", 120)).await;
        w.insert_example(&example("FFF0C0D3", "app.invoices", 120)).await;

        assert_eq!(w.store().documents(SLOWOPS_EXAMPLE_COLLECTION).len(), 2);
    }

    #[tokio::test]
    async fn write_failures_are_swallowed() {
        let w = writer();
        w.init().await.unwrap();
        w.store()
            .fail_next(StoreOp::InsertOne, StoreError::Connect("reset".to_string()));
        w.store().fail_next(
            StoreOp::InsertRaw,
            StoreError::server(DUPLICATE_KEY, "E11000"),
        );

        w.insert_aggregate(&SlowOpRecord::default()).await;
        w.insert_example(&example("FFF0C0D3", "app.orders", 1)).await;

        assert!(w.store().documents(SLOWOPS_COLLECTION).is_empty());
        assert!(w.store().documents(SLOWOPS_EXAMPLE_COLLECTION).is_empty());
    }
}
