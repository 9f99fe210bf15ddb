//! Store handle abstraction.
//!
//! Both the listened database and the internal store are reached through
//! [`StoreHandle`]. The profiler only relies on this contract, which keeps
//! the tailer and the writers testable against [`MemoryStore`].
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌───────────────┐
//! │  BufferSizer │   │    Tailer    │   │ SlowOpsWriter │
//! └──────┬───────┘   └──────┬───────┘   └───────┬───────┘
//!        └──────────────────┼───────────────────┘
//!                    ┌──────▼──────┐
//!                    │ StoreHandle │ (trait)
//!                    └──────┬──────┘
//!              ┌────────────┴────────────┐
//!       ┌──────▼──────┐           ┌──────▼──────┐
//!       │ MongoStore  │           │ MemoryStore │
//!       │ (driver)    │           │ (testing)   │
//!       └─────────────┘           └─────────────┘
//! ```

pub mod memory;
pub mod mongo;
mod retry;

use std::time::Duration;

use async_trait::async_trait;
use bson::{Document, RawDocumentBuf};

use crate::config::ProfilingLevel;
use crate::error::{ConfigError, StoreError};

pub use memory::{CursorStep, MemoryStore, StoreCall, StoreOp};
pub use mongo::MongoStore;
pub use retry::connect_with_retry;

/// Forward cursor over a capped collection that stays open for new entries.
#[async_trait]
pub trait TailCursor: Send {
    /// Returns the next entry, or `None` when nothing arrived within the
    /// poll window or the cursor is exhausted. Never hangs indefinitely.
    async fn try_next(&mut self) -> Result<Option<RawDocumentBuf>, StoreError>;

    /// True once the server closed the cursor (cursor id zero).
    fn is_exhausted(&self) -> bool;
}

/// Ascending index over one or more fields.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexSpec {
    pub keys: Vec<&'static str>,
    pub unique: bool,
    pub expire_after: Option<Duration>,
}

impl IndexSpec {
    pub fn ascending(keys: &[&'static str]) -> Self {
        Self {
            keys: keys.to_vec(),
            unique: false,
            expire_after: None,
        }
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn expire_after(mut self, ttl: Duration) -> Self {
        self.expire_after = Some(ttl);
        self
    }
}

/// Hosts and database a handle is bound to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionTarget {
    pub hosts: Vec<String>,
    pub database: String,
}

impl ConnectionTarget {
    /// Host label attached to every profile entry.
    pub fn host_label(&self) -> String {
        self.hosts.join(",")
    }

    /// True when both targets name the same database on an overlapping set of hosts.
    pub fn same_database(&self, other: &ConnectionTarget) -> bool {
        self.database == other.database
            && self
                .hosts
                .iter()
                .any(|h| other.hosts.iter().any(|o| o.eq_ignore_ascii_case(h)))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.hosts.is_empty() {
            return Err(ConfigError::MissingHost);
        }
        if self.database.is_empty() {
            return Err(ConfigError::MissingDatabase(self.host_label()));
        }
        Ok(())
    }
}

/// Operations the profiler needs from a database.
#[async_trait]
pub trait StoreHandle: Send + Sync {
    fn target(&self) -> &ConnectionTarget;

    /// Round-trips to the server; used to establish the connection.
    async fn ping(&self) -> Result<(), StoreError>;

    async fn set_profiling_level(
        &self,
        level: ProfilingLevel,
        slow_ms: u64,
    ) -> Result<(), StoreError>;

    async fn disable_profiling(&self) -> Result<(), StoreError>;

    async fn drop_collection(&self, name: &str) -> Result<(), StoreError>;

    async fn create_capped_collection(&self, name: &str, max_size: u64)
    -> Result<(), StoreError>;

    async fn create_collection(&self, name: &str) -> Result<(), StoreError>;

    async fn create_indexes(&self, collection: &str, specs: &[IndexSpec])
    -> Result<(), StoreError>;

    /// Opens a tailable cursor sorted by natural (insertion) order.
    async fn open_tail_cursor(
        &self,
        collection: &str,
        filter: Document,
    ) -> Result<Box<dyn TailCursor>, StoreError>;

    async fn insert_one(&self, collection: &str, doc: Document) -> Result<(), StoreError>;

    /// Inserts `doc` as is, without converting it to a [`Document`] first.
    async fn insert_raw(&self, collection: &str, doc: RawDocumentBuf) -> Result<(), StoreError>;

    /// Closes the connection pool.
    async fn shutdown(&self) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(hosts: &[&str], database: &str) -> ConnectionTarget {
        ConnectionTarget {
            hosts: hosts.iter().map(|h| h.to_string()).collect(),
            database: database.to_string(),
        }
    }

    #[test]
    fn host_label_joins_hosts() {
        let t = target(&["db1:27017", "db2:27017"], "app");
        assert_eq!(t.host_label(), "db1:27017,db2:27017");
    }

    #[test]
    fn same_database_requires_shared_host() {
        let a = target(&["db1:27017", "db2:27017"], "app");
        assert!(a.same_database(&target(&["DB2:27017"], "app")));
        assert!(!a.same_database(&target(&["db2:27017"], "profiler")));
        assert!(!a.same_database(&target(&["db3:27017"], "app")));
    }

    #[test]
    fn validate_requires_database() {
        assert!(target(&["db1:27017"], "").validate().is_err());
        assert!(target(&[], "app").validate().is_err());
        assert!(target(&["db1:27017"], "app").validate().is_ok());
    }

    #[test]
    fn index_spec_builder() {
        let spec = IndexSpec::ascending(&["queryHash", "collection"]).unique();
        assert_eq!(spec.keys, vec!["queryHash", "collection"]);
        assert!(spec.unique);
        assert_eq!(spec.expire_after, None);
    }
}
