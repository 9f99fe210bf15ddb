use async_trait::async_trait;
use bson::RawDocumentBuf;
use tracing::{debug, warn};

use super::SlowOpsWriter;
use crate::entry::ProfileEntry;
use crate::profiler::EntryHandler;
use crate::store::StoreHandle;

/// Entry handler that normalizes each profiler document and writes the
/// aggregate and example records.
pub struct SlowOpsPipeline<S: ?Sized> {
    writer: SlowOpsWriter<S>,
    host: String,
}

impl<S: StoreHandle + ?Sized> SlowOpsPipeline<S> {
    /// `host` is the label of the listened deployment, attached to every record.
    pub fn new(writer: SlowOpsWriter<S>, host: impl Into<String>) -> Self {
        Self {
            writer,
            host: host.into(),
        }
    }

    pub fn writer(&self) -> &SlowOpsWriter<S> {
        &self.writer
    }
}

#[async_trait]
impl<S: StoreHandle + ?Sized + 'static> EntryHandler for SlowOpsPipeline<S> {
    async fn handle(&self, raw: RawDocumentBuf) {
        let entry = match ProfileEntry::from_raw(raw, &self.host) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(error = %e, "dropping undecodable profile entry");
                return;
            }
        };

        debug!(
            ns = %entry.namespace,
            op = %entry.op,
            ts = ?entry.timestamp_utc(),
            millis = entry.duration_ms,
            "received slow op entry"
        );

        self.writer.insert_aggregate(&entry.to_slow_op_record()).await;
        self.writer.insert_example(&entry.to_example_record()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RetentionConfig, SLOWOPS_COLLECTION, SLOWOPS_EXAMPLE_COLLECTION};
    use crate::store::MemoryStore;
    use bson::doc;
    use std::sync::Arc;

    async fn pipeline() -> SlowOpsPipeline<MemoryStore> {
        let writer = SlowOpsWriter::new(
            Arc::new(MemoryStore::new("profiler")),
            RetentionConfig::default(),
        );
        writer.init().await.unwrap();
        SlowOpsPipeline::new(writer, "db1:27017,db2:27017")
    }

    fn find(millis: i32) -> RawDocumentBuf {
        RawDocumentBuf::from_document(&doc! {
            "op": "query",
            "ns": "app.orders",
            "command": { "find": "orders", "filter": { "status": "open" } },
            "queryHash": "FFF0C0D3",
            "millis": millis,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn two_finds_with_same_shape_leave_one_example() {
        let p = pipeline().await;
        p.handle(find(150)).await;
        p.handle(find(300)).await;

        let store = p.writer().store();
        let aggregates = store.documents(SLOWOPS_COLLECTION);
        assert_eq!(aggregates.len(), 2);
        assert_eq!(aggregates[0].get_str("host").unwrap(), "db1:27017,db2:27017");
        assert_eq!(aggregates[1].get_i64("durationMS").unwrap(), 300);

        let examples = store.documents(SLOWOPS_EXAMPLE_COLLECTION);
        assert_eq!(examples.len(), 1);
        assert_eq!(examples[0].get_str("queryHash").unwrap(), "FFF0C0D3");
    }

    #[tokio::test]
    async fn insert_without_upstream_hash_uses_fallback_shape() {
        let p = pipeline().await;
        let raw = RawDocumentBuf::from_document(&doc! { "op": "insert", "ns": "app.orders" })
            .unwrap();
        p.handle(raw).await;

        let aggregates = p.writer().store().documents(SLOWOPS_COLLECTION);
        assert_eq!(aggregates[0].get_str("queryHash").unwrap(), "1B9C8C2D");
    }

    #[tokio::test]
    async fn undecodable_entry_is_dropped() {
        let p = pipeline().await;
        let raw = RawDocumentBuf::from_document(&doc! { "op": 1, "ns": "app.orders" }).unwrap();
        p.handle(raw).await;

        assert!(p.writer().store().documents(SLOWOPS_COLLECTION).is_empty());
    }
}
