//! [`StoreHandle`] backed by the MongoDB driver.

use std::time::Duration;

use async_trait::async_trait;
use bson::{Document, RawDocumentBuf, doc};
use futures::StreamExt;
use mongodb::error::{Error as MongoError, ErrorKind, WriteFailure};
use mongodb::options::{
    ClientOptions, CreateCollectionOptions, CursorType, FindOptions, IndexOptions,
};
use mongodb::{Client, Cursor, Database, IndexModel};
use tracing::debug;

use super::{ConnectionTarget, IndexSpec, StoreHandle, TailCursor};
use crate::config::{DEFAULT_POLL_INTERVAL, ProfilingLevel};
use crate::error::{ConfigError, ProfilerError, StoreError};

/// Applied when the connection string does not set `connectTimeoutMS`.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
/// Applied when the connection string does not set `serverSelectionTimeoutMS`.
const SERVER_SELECTION_TIMEOUT: Duration = Duration::from_secs(2);

/// Handle on the default database of a MongoDB connection string.
///
/// The driver connects lazily; call [`StoreHandle::ping`] (usually through
/// [`connect_with_retry`](super::connect_with_retry)) to establish the
/// connection.
pub struct MongoStore {
    client: Client,
    db: Database,
    target: ConnectionTarget,
    poll_interval: Duration,
}

impl MongoStore {
    /// Parses `uri` and builds a client bound to the database it names.
    pub async fn from_uri(uri: &str) -> Result<Self, ProfilerError> {
        let mut options =
            ClientOptions::parse(uri)
                .await
                .map_err(|e| ConfigError::InvalidValue {
                    field: "connection string",
                    reason: e.to_string(),
                })?;

        let target = ConnectionTarget {
            hosts: options.hosts.iter().map(|h| h.to_string()).collect(),
            database: options.default_database.clone().unwrap_or_default(),
        };
        target.validate()?;

        if let Some(credential) = &options.credential
            && credential.mechanism.is_none()
        {
            match (&credential.username, &credential.password) {
                (Some(_), None) => return Err(ConfigError::MissingPassword.into()),
                (None, Some(_)) => return Err(ConfigError::MissingUsername.into()),
                _ => {}
            }
        }

        if options.connect_timeout.is_none() {
            options.connect_timeout = Some(CONNECT_TIMEOUT);
        }
        if options.server_selection_timeout.is_none() {
            options.server_selection_timeout = Some(SERVER_SELECTION_TIMEOUT);
        }
        if options.app_name.is_none() {
            options.app_name = Some("mongoprof".to_string());
        }

        let client = Client::with_options(options).map_err(|e| ConfigError::InvalidValue {
            field: "connection string",
            reason: e.to_string(),
        })?;
        let db = client.database(&target.database);

        Ok(Self {
            client,
            db,
            target,
            poll_interval: DEFAULT_POLL_INTERVAL,
        })
    }

    /// Sets how long a tail cursor poll waits for a new entry.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

#[async_trait]
impl StoreHandle for MongoStore {
    fn target(&self) -> &ConnectionTarget {
        &self.target
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.db
            .run_command(doc! { "ping": 1 }, None)
            .await
            .map(|_| ())
            .map_err(map_error)
    }

    async fn set_profiling_level(
        &self,
        level: ProfilingLevel,
        slow_ms: u64,
    ) -> Result<(), StoreError> {
        let slow_ms = i64::try_from(slow_ms).unwrap_or(i64::MAX);
        self.db
            .run_command(doc! { "profile": level.as_i32(), "slowms": slow_ms }, None)
            .await
            .map(|_| ())
            .map_err(map_error)
    }

    async fn disable_profiling(&self) -> Result<(), StoreError> {
        self.db
            .run_command(doc! { "profile": 0 }, None)
            .await
            .map(|_| ())
            .map_err(map_error)
    }

    async fn drop_collection(&self, name: &str) -> Result<(), StoreError> {
        self.db
            .collection::<Document>(name)
            .drop(None)
            .await
            .map_err(map_error)
    }

    async fn create_capped_collection(
        &self,
        name: &str,
        max_size: u64,
    ) -> Result<(), StoreError> {
        let options = CreateCollectionOptions::builder()
            .capped(Some(true))
            .size(Some(max_size))
            .build();
        self.db
            .create_collection(name, options)
            .await
            .map_err(map_error)
    }

    async fn create_collection(&self, name: &str) -> Result<(), StoreError> {
        self.db
            .create_collection(name, None)
            .await
            .map_err(map_error)
    }

    async fn create_indexes(
        &self,
        collection: &str,
        specs: &[IndexSpec],
    ) -> Result<(), StoreError> {
        let models: Vec<IndexModel> = specs.iter().map(index_model).collect();
        self.db
            .collection::<Document>(collection)
            .create_indexes(models, None)
            .await
            .map(|_| ())
            .map_err(map_error)
    }

    async fn open_tail_cursor(
        &self,
        collection: &str,
        filter: Document,
    ) -> Result<Box<dyn TailCursor>, StoreError> {
        let options = FindOptions::builder()
            .cursor_type(Some(CursorType::TailableAwait))
            .sort(Some(doc! { "$natural": 1 }))
            .max_await_time(Some(self.poll_interval))
            .build();

        debug!(collection, filter = %filter, "opening tailable cursor");

        let inner = self
            .db
            .collection::<RawDocumentBuf>(collection)
            .find(filter, options)
            .await
            .map_err(map_error)?;

        Ok(Box::new(MongoTailCursor {
            inner,
            poll_interval: self.poll_interval,
            exhausted: false,
        }))
    }

    async fn insert_one(&self, collection: &str, doc: Document) -> Result<(), StoreError> {
        self.db
            .collection::<Document>(collection)
            .insert_one(doc, None)
            .await
            .map(|_| ())
            .map_err(map_error)
    }

    async fn insert_raw(&self, collection: &str, doc: RawDocumentBuf) -> Result<(), StoreError> {
        self.db
            .collection::<RawDocumentBuf>(collection)
            .insert_one(doc, None)
            .await
            .map(|_| ())
            .map_err(map_error)
    }

    async fn shutdown(&self) -> Result<(), StoreError> {
        self.client.clone().shutdown().await;
        Ok(())
    }
}

/// Driver cursor adapted to the poll-and-return contract of [`TailCursor`].
struct MongoTailCursor {
    inner: Cursor<RawDocumentBuf>,
    poll_interval: Duration,
    exhausted: bool,
}

#[async_trait]
impl TailCursor for MongoTailCursor {
    async fn try_next(&mut self) -> Result<Option<RawDocumentBuf>, StoreError> {
        if self.exhausted {
            return Ok(None);
        }
        // The driver keeps an in-flight getMore inside the cursor, so giving
        // up on `next()` after the poll window does not lose a batch.
        match tokio::time::timeout(self.poll_interval, self.inner.next()).await {
            Err(_elapsed) => Ok(None),
            Ok(Some(Ok(doc))) => Ok(Some(doc)),
            Ok(Some(Err(e))) => Err(map_error(e)),
            Ok(None) => {
                self.exhausted = true;
                Ok(None)
            }
        }
    }

    fn is_exhausted(&self) -> bool {
        self.exhausted
    }
}

fn index_model(spec: &IndexSpec) -> IndexModel {
    let mut keys = Document::new();
    for key in &spec.keys {
        keys.insert(*key, 1i32);
    }
    let options = IndexOptions::builder()
        .unique(spec.unique.then_some(true))
        .expire_after(spec.expire_after)
        .build();
    IndexModel::builder().keys(keys).options(Some(options)).build()
}

/// Extracts the server error code carried by a driver error, if any.
fn server_code(err: &MongoError) -> Option<i32> {
    match err.kind.as_ref() {
        ErrorKind::Command(e) => Some(e.code),
        ErrorKind::Write(WriteFailure::WriteError(e)) => Some(e.code),
        ErrorKind::Write(WriteFailure::WriteConcernError(e)) => Some(e.code),
        ErrorKind::BulkWrite(e) => e
            .write_errors
            .as_ref()
            .and_then(|errors| errors.first())
            .map(|e| e.code),
        _ => None,
    }
}

/// Maps driver errors to [`StoreError`]; server codes become [`ServerCondition`](crate::error::ServerCondition)s.
fn map_error(err: MongoError) -> StoreError {
    if let Some(code) = server_code(&err) {
        return StoreError::server(code, err.to_string());
    }
    match err.kind.as_ref() {
        ErrorKind::ServerSelection { .. }
        | ErrorKind::Io(_)
        | ErrorKind::ConnectionPoolCleared { .. }
        | ErrorKind::Authentication { .. } => StoreError::Connect(err.to_string()),
        ErrorKind::BsonSerialization(_) | ErrorKind::BsonDeserialization(_) => {
            StoreError::Serialization(err.to_string())
        }
        _ => StoreError::Driver(err.to_string()),
    }
}
