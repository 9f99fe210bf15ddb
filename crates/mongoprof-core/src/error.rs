//! Error types for profiling, storage and decoding.
//!
//! Server-side failures are reduced to a small closed set of
//! [`ServerCondition`]s by the store's error-mapping layer, so the tailer and
//! the writers match on variants instead of raw numeric codes.

use thiserror::Error;

/// Server error code: the capped collection advanced past the cursor position.
pub const CAPPED_POSITION_LOST: i32 = 136;
/// Server error code: collection already exists.
pub const NAMESPACE_EXISTS: i32 = 48;
/// Server error code: namespace does not exist.
pub const NAMESPACE_NOT_FOUND: i32 = 26;
/// Server error code: index with the same name already exists.
pub const INDEX_ALREADY_EXISTS: i32 = 68;
/// Server error code: index exists with different options.
pub const INDEX_OPTIONS_CONFLICT: i32 = 85;
/// Server error code: unique index violation.
pub const DUPLICATE_KEY: i32 = 11000;

/// Server conditions the profiler knows how to react to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerCondition {
    /// The capped source collection overwrote entries the cursor had not read yet.
    BufferOverflow,
    /// Collection or index already exists.
    AlreadyExists,
    /// An index on the same keys exists with other options (e.g. another TTL).
    IndexOptionsConflict,
    /// Unique constraint violated.
    DuplicateKey,
    /// Collection does not exist.
    NamespaceNotFound,
    /// Any other server-reported code.
    Other(i32),
}

impl ServerCondition {
    pub fn from_code(code: i32) -> Self {
        match code {
            CAPPED_POSITION_LOST => ServerCondition::BufferOverflow,
            NAMESPACE_EXISTS | INDEX_ALREADY_EXISTS => ServerCondition::AlreadyExists,
            INDEX_OPTIONS_CONFLICT => ServerCondition::IndexOptionsConflict,
            DUPLICATE_KEY => ServerCondition::DuplicateKey,
            NAMESPACE_NOT_FOUND => ServerCondition::NamespaceNotFound,
            other => ServerCondition::Other(other),
        }
    }
}

impl std::fmt::Display for ServerCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerCondition::BufferOverflow => write!(f, "capped position lost"),
            ServerCondition::AlreadyExists => write!(f, "already exists"),
            ServerCondition::IndexOptionsConflict => write!(f, "index options conflict"),
            ServerCondition::DuplicateKey => write!(f, "duplicate key"),
            ServerCondition::NamespaceNotFound => write!(f, "namespace not found"),
            ServerCondition::Other(code) => write!(f, "server error {}", code),
        }
    }
}

/// Errors reported by a [`StoreHandle`](crate::store::StoreHandle).
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// The server rejected the operation.
    #[error("{condition}: {message}")]
    Server {
        condition: ServerCondition,
        message: String,
    },

    /// The server could not be reached.
    #[error("connection error: {0}")]
    Connect(String),

    /// The connection string could not be parsed.
    #[error("invalid connection string: {0}")]
    InvalidUri(String),

    /// A record could not be turned into a document.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Anything else the driver reported.
    #[error("{0}")]
    Driver(String),
}

impl StoreError {
    pub fn server(code: i32, message: impl Into<String>) -> Self {
        StoreError::Server {
            condition: ServerCondition::from_code(code),
            message: message.into(),
        }
    }

    /// Returns the server condition, if this error came from the server.
    pub fn condition(&self) -> Option<ServerCondition> {
        match self {
            StoreError::Server { condition, .. } => Some(*condition),
            _ => None,
        }
    }

    pub fn is(&self, condition: ServerCondition) -> bool {
        self.condition() == Some(condition)
    }
}

/// A raw profiler payload could not be interpreted as a profile entry.
#[derive(Debug, Clone, Error)]
#[error("failed to decode profile entry: {0}")]
pub struct DecodeError(pub String);

impl From<bson::de::Error> for DecodeError {
    fn from(e: bson::de::Error) -> Self {
        DecodeError(e.to_string())
    }
}

impl From<bson::raw::Error> for DecodeError {
    fn from(e: bson::raw::Error) -> Self {
        DecodeError(e.to_string())
    }
}

/// Invalid connection or runtime configuration.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    #[error("no database provided in connection string for {0}")]
    MissingDatabase(String),

    #[error("no host provided in connection string")]
    MissingHost,

    #[error("username provided but password is not specified")]
    MissingPassword,

    #[error("password provided but username is not specified")]
    MissingUsername,

    #[error("listened and internal connection strings point to the same database {0}")]
    SameTarget(String),

    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

/// Top-level errors of the profiling pipeline.
#[derive(Debug, Error)]
pub enum ProfilerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed after {attempts} attempts, last error: {source}")]
    Connect {
        attempts: u32,
        #[source]
        source: StoreError,
    },

    #[error("failed to initialize {collection}: {source}")]
    Init {
        collection: &'static str,
        #[source]
        source: StoreError,
    },

    #[error("failed to resize {collection}: {source}")]
    Resize {
        collection: &'static str,
        #[source]
        source: StoreError,
    },

    #[error("cursor on {collection} failed: {source}")]
    Cursor {
        collection: &'static str,
        #[source]
        source: StoreError,
    },

    #[error("failed to stop profiler: {0}")]
    Teardown(#[source] StoreError),
}

pub type Result<T> = std::result::Result<T, ProfilerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_codes_map_to_conditions() {
        assert_eq!(
            ServerCondition::from_code(136),
            ServerCondition::BufferOverflow
        );
        assert_eq!(ServerCondition::from_code(48), ServerCondition::AlreadyExists);
        assert_eq!(ServerCondition::from_code(68), ServerCondition::AlreadyExists);
        assert_eq!(
            ServerCondition::from_code(85),
            ServerCondition::IndexOptionsConflict
        );
        assert_eq!(ServerCondition::from_code(11000), ServerCondition::DuplicateKey);
        assert_eq!(
            ServerCondition::from_code(26),
            ServerCondition::NamespaceNotFound
        );
        assert_eq!(ServerCondition::from_code(13), ServerCondition::Other(13));
    }

    #[test]
    fn store_error_exposes_condition() {
        let err = StoreError::server(11000, "E11000 duplicate key error");
        assert!(err.is(ServerCondition::DuplicateKey));
        assert!(!err.is(ServerCondition::AlreadyExists));

        let err = StoreError::Connect("refused".to_string());
        assert_eq!(err.condition(), None);
    }

    #[test]
    fn server_error_display_includes_condition() {
        let err = StoreError::server(136, "CappedPositionLost");
        assert_eq!(err.to_string(), "capped position lost: CappedPositionLost");
    }
}
