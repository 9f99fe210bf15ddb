//! In-memory [`StoreHandle`] for testing the profiler without a server.
//!
//! Mirrors the server behaviours the profiler depends on: "already exists"
//! and "namespace not found" errors, unique indexes rejecting duplicates,
//! and tail cursors that return nothing rather than blocking. Cursor
//! contents are scripted with [`CursorStep`]s and every call is recorded as
//! a [`StoreCall`] so tests can assert on the exact sequence of operations.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use bson::{Document, RawDocumentBuf};

use super::{ConnectionTarget, IndexSpec, StoreHandle, TailCursor};
use crate::config::{DEFAULT_POLL_INTERVAL, ProfilingLevel};
use crate::error::{
    DUPLICATE_KEY, INDEX_OPTIONS_CONFLICT, NAMESPACE_EXISTS, NAMESPACE_NOT_FOUND, StoreError,
};

/// One scripted response of a tail cursor.
#[derive(Debug, Clone)]
pub enum CursorStep {
    Entry(RawDocumentBuf),
    /// Nothing available during this poll.
    Idle,
    /// Server closed the cursor.
    Exhausted,
    Fail(StoreError),
}

/// Operations that can be made to fail with [`MemoryStore::fail_next`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    Ping,
    SetProfilingLevel,
    DisableProfiling,
    DropCollection,
    CreateCappedCollection,
    CreateCollection,
    CreateIndexes,
    OpenTailCursor,
    InsertOne,
    InsertRaw,
    Shutdown,
}

/// Recorded call, in invocation order.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreCall {
    Ping,
    SetProfilingLevel { level: ProfilingLevel, slow_ms: u64 },
    DisableProfiling,
    DropCollection(String),
    CreateCappedCollection { name: String, max_size: u64 },
    CreateCollection(String),
    CreateIndexes { collection: String, specs: usize },
    OpenTailCursor { collection: String, filter: Document },
    InsertOne(String),
    InsertRaw(String),
    Shutdown,
}

#[derive(Default)]
struct State {
    calls: Vec<StoreCall>,
    collections: HashMap<String, Vec<Document>>,
    raw: HashMap<String, Vec<RawDocumentBuf>>,
    capped: HashMap<String, u64>,
    indexes: HashMap<String, Vec<IndexSpec>>,
    profiling: Option<(ProfilingLevel, u64)>,
    cursors: VecDeque<Vec<CursorStep>>,
    failures: HashMap<StoreOp, VecDeque<StoreError>>,
}

impl State {
    fn take_failure(&mut self, op: StoreOp) -> Result<(), StoreError> {
        match self.failures.get_mut(&op).and_then(|q| q.pop_front()) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn violates_unique(&self, collection: &str, doc: &Document) -> bool {
        let Some(specs) = self.indexes.get(collection) else {
            return false;
        };
        let Some(existing) = self.collections.get(collection) else {
            return false;
        };
        specs.iter().filter(|s| s.unique).any(|spec| {
            existing
                .iter()
                .any(|other| spec.keys.iter().all(|k| other.get(k) == doc.get(k)))
        })
    }

    fn insert(&mut self, collection: &str, doc: Document) -> Result<(), StoreError> {
        if self.violates_unique(collection, &doc) {
            return Err(StoreError::server(
                DUPLICATE_KEY,
                format!("E11000 duplicate key error collection: {}", collection),
            ));
        }
        self.collections
            .entry(collection.to_string())
            .or_default()
            .push(doc);
        Ok(())
    }
}

/// Scriptable in-memory store.
pub struct MemoryStore {
    target: ConnectionTarget,
    poll_interval: Duration,
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new(database: &str) -> Self {
        Self {
            target: ConnectionTarget {
                hosts: vec!["memory:27017".to_string()],
                database: database.to_string(),
            },
            poll_interval: DEFAULT_POLL_INTERVAL,
            state: Mutex::new(State::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queues the steps returned by the next cursor opened on this store.
    pub fn push_cursor(&self, steps: Vec<CursorStep>) {
        self.lock().cursors.push_back(steps);
    }

    /// Makes the next call of `op` fail with `err`. Calls queue up.
    pub fn fail_next(&self, op: StoreOp, err: StoreError) {
        self.lock().failures.entry(op).or_default().push_back(err);
    }

    pub fn calls(&self) -> Vec<StoreCall> {
        self.lock().calls.clone()
    }

    pub fn documents(&self, collection: &str) -> Vec<Document> {
        self.lock()
            .collections
            .get(collection)
            .cloned()
            .unwrap_or_default()
    }

    /// Documents stored through [`StoreHandle::insert_raw`], byte for byte.
    pub fn raw_documents(&self, collection: &str) -> Vec<RawDocumentBuf> {
        self.lock().raw.get(collection).cloned().unwrap_or_default()
    }

    pub fn has_collection(&self, name: &str) -> bool {
        self.lock().collections.contains_key(name)
    }

    pub fn capped_size(&self, name: &str) -> Option<u64> {
        self.lock().capped.get(name).copied()
    }

    pub fn indexes(&self, collection: &str) -> Vec<IndexSpec> {
        self.lock()
            .indexes
            .get(collection)
            .cloned()
            .unwrap_or_default()
    }

    /// Current profiling level and threshold, `None` when disabled.
    pub fn profiling(&self) -> Option<(ProfilingLevel, u64)> {
        self.lock().profiling
    }
}

#[async_trait]
impl StoreHandle for MemoryStore {
    fn target(&self) -> &ConnectionTarget {
        &self.target
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut state = self.lock();
        state.calls.push(StoreCall::Ping);
        state.take_failure(StoreOp::Ping)
    }

    async fn set_profiling_level(
        &self,
        level: ProfilingLevel,
        slow_ms: u64,
    ) -> Result<(), StoreError> {
        let mut state = self.lock();
        state
            .calls
            .push(StoreCall::SetProfilingLevel { level, slow_ms });
        state.take_failure(StoreOp::SetProfilingLevel)?;
        state.profiling = (level != ProfilingLevel::Off).then_some((level, slow_ms));
        Ok(())
    }

    async fn disable_profiling(&self) -> Result<(), StoreError> {
        let mut state = self.lock();
        state.calls.push(StoreCall::DisableProfiling);
        state.take_failure(StoreOp::DisableProfiling)?;
        state.profiling = None;
        Ok(())
    }

    async fn drop_collection(&self, name: &str) -> Result<(), StoreError> {
        let mut state = self.lock();
        state.calls.push(StoreCall::DropCollection(name.to_string()));
        state.take_failure(StoreOp::DropCollection)?;
        if state.collections.remove(name).is_none() {
            return Err(StoreError::server(NAMESPACE_NOT_FOUND, "ns not found"));
        }
        state.capped.remove(name);
        state.indexes.remove(name);
        Ok(())
    }

    async fn create_capped_collection(
        &self,
        name: &str,
        max_size: u64,
    ) -> Result<(), StoreError> {
        let mut state = self.lock();
        state.calls.push(StoreCall::CreateCappedCollection {
            name: name.to_string(),
            max_size,
        });
        state.take_failure(StoreOp::CreateCappedCollection)?;
        if state.collections.contains_key(name) {
            return Err(StoreError::server(
                NAMESPACE_EXISTS,
                format!("Collection {} already exists", name),
            ));
        }
        state.collections.insert(name.to_string(), Vec::new());
        state.capped.insert(name.to_string(), max_size);
        Ok(())
    }

    async fn create_collection(&self, name: &str) -> Result<(), StoreError> {
        let mut state = self.lock();
        state.calls.push(StoreCall::CreateCollection(name.to_string()));
        state.take_failure(StoreOp::CreateCollection)?;
        if state.collections.contains_key(name) {
            return Err(StoreError::server(
                NAMESPACE_EXISTS,
                format!("Collection {} already exists", name),
            ));
        }
        state.collections.insert(name.to_string(), Vec::new());
        Ok(())
    }

    async fn create_indexes(
        &self,
        collection: &str,
        specs: &[IndexSpec],
    ) -> Result<(), StoreError> {
        let mut state = self.lock();
        state.calls.push(StoreCall::CreateIndexes {
            collection: collection.to_string(),
            specs: specs.len(),
        });
        state.take_failure(StoreOp::CreateIndexes)?;

        let existing = state.indexes.entry(collection.to_string()).or_default();
        for spec in specs {
            match existing.iter().find(|e| e.keys == spec.keys) {
                Some(e) if e == spec => {}
                Some(_) => {
                    return Err(StoreError::server(
                        INDEX_OPTIONS_CONFLICT,
                        format!("index on {:?} exists with different options", spec.keys),
                    ));
                }
                None => existing.push(spec.clone()),
            }
        }
        state.collections.entry(collection.to_string()).or_default();
        Ok(())
    }

    async fn open_tail_cursor(
        &self,
        collection: &str,
        filter: Document,
    ) -> Result<Box<dyn TailCursor>, StoreError> {
        let mut state = self.lock();
        state.calls.push(StoreCall::OpenTailCursor {
            collection: collection.to_string(),
            filter,
        });
        state.take_failure(StoreOp::OpenTailCursor)?;
        let steps = state.cursors.pop_front().unwrap_or_default();
        Ok(Box::new(MemoryTailCursor {
            steps: steps.into(),
            poll_interval: self.poll_interval,
            exhausted: false,
        }))
    }

    async fn insert_one(&self, collection: &str, doc: Document) -> Result<(), StoreError> {
        let mut state = self.lock();
        state.calls.push(StoreCall::InsertOne(collection.to_string()));
        state.take_failure(StoreOp::InsertOne)?;
        state.insert(collection, doc)
    }

    async fn insert_raw(&self, collection: &str, doc: RawDocumentBuf) -> Result<(), StoreError> {
        let mut state = self.lock();
        state.calls.push(StoreCall::InsertRaw(collection.to_string()));
        state.take_failure(StoreOp::InsertRaw)?;
        let parsed = doc
            .to_document()
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        state.insert(collection, parsed)?;
        state.raw.entry(collection.to_string()).or_default().push(doc);
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), StoreError> {
        let mut state = self.lock();
        state.calls.push(StoreCall::Shutdown);
        state.take_failure(StoreOp::Shutdown)
    }
}

struct MemoryTailCursor {
    steps: VecDeque<CursorStep>,
    poll_interval: Duration,
    exhausted: bool,
}

#[async_trait]
impl TailCursor for MemoryTailCursor {
    async fn try_next(&mut self) -> Result<Option<RawDocumentBuf>, StoreError> {
        if self.exhausted {
            return Ok(None);
        }
        match self.steps.pop_front() {
            Some(CursorStep::Entry(doc)) => Ok(Some(doc)),
            Some(CursorStep::Exhausted) => {
                self.exhausted = true;
                Ok(None)
            }
            Some(CursorStep::Fail(err)) => Err(err),
            Some(CursorStep::Idle) | None => {
                tokio::time::sleep(self.poll_interval).await;
                Ok(None)
            }
        }
    }

    fn is_exhausted(&self) -> bool {
        self.exhausted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[tokio::test]
    async fn unique_index_rejects_duplicates() {
        let store = MemoryStore::new("profiler");
        store
            .create_indexes("examples", &[IndexSpec::ascending(&["k"]).unique()])
            .await
            .unwrap();

        store
            .insert_one("examples", doc! { "k": 1, "v": "a" })
            .await
            .unwrap();
        let err = store
            .insert_one("examples", doc! { "k": 1, "v": "b" })
            .await
            .unwrap_err();
        assert!(err.is(crate::error::ServerCondition::DuplicateKey));
        assert_eq!(store.documents("examples").len(), 1);
    }

    #[tokio::test]
    async fn create_existing_collection_fails() {
        let store = MemoryStore::new("profiler");
        store.create_collection("slowops").await.unwrap();
        let err = store.create_collection("slowops").await.unwrap_err();
        assert!(err.is(crate::error::ServerCondition::AlreadyExists));
    }

    #[tokio::test]
    async fn drop_missing_collection_fails() {
        let store = MemoryStore::new("app");
        let err = store.drop_collection("system.profile").await.unwrap_err();
        assert!(err.is(crate::error::ServerCondition::NamespaceNotFound));
    }

    #[tokio::test]
    async fn identical_index_is_idempotent() {
        let store = MemoryStore::new("profiler");
        let specs = [IndexSpec::ascending(&["planHash"])];
        store.create_indexes("slowops", &specs).await.unwrap();
        store.create_indexes("slowops", &specs).await.unwrap();
        assert_eq!(store.indexes("slowops").len(), 1);

        let err = store
            .create_indexes("slowops", &[IndexSpec::ascending(&["planHash"]).unique()])
            .await
            .unwrap_err();
        assert!(err.is(crate::error::ServerCondition::IndexOptionsConflict));
    }

    #[tokio::test]
    async fn injected_failures_are_consumed_in_order() {
        let store = MemoryStore::new("app");
        store.fail_next(StoreOp::Ping, StoreError::Connect("down".to_string()));
        assert!(store.ping().await.is_err());
        assert!(store.ping().await.is_ok());
        assert_eq!(store.calls(), vec![StoreCall::Ping, StoreCall::Ping]);
    }

    #[tokio::test(start_paused = true)]
    async fn scripted_cursor_replays_steps() {
        let store = MemoryStore::new("app");
        let entry = RawDocumentBuf::from_document(&doc! { "op": "insert" }).unwrap();
        store.push_cursor(vec![
            CursorStep::Entry(entry.clone()),
            CursorStep::Idle,
            CursorStep::Exhausted,
        ]);

        let mut cursor = store
            .open_tail_cursor("system.profile", Document::new())
            .await
            .unwrap();
        assert_eq!(cursor.try_next().await.unwrap(), Some(entry));
        assert_eq!(cursor.try_next().await.unwrap(), None);
        assert!(!cursor.is_exhausted());
        assert_eq!(cursor.try_next().await.unwrap(), None);
        assert!(cursor.is_exhausted());
    }
}
