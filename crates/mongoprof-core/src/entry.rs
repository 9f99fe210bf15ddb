//! Profiler entry normalization.
//!
//! Decodes a raw `system.profile` document into a typed [`ProfileEntry`],
//! resolves its query shape and projects it into the two persisted records.

use bson::{DateTime, RawDocument, RawDocumentBuf};
use chrono::Utc;
use serde::de::{self, Deserializer, Visitor};
use serde::Deserialize;

use crate::error::DecodeError;
use crate::murmur3::fallback_shape_id;
use crate::persistence::{SlowOpExampleRecord, SlowOpRecord};

/// Operations that get a fallback shape when the server reports no `queryHash`.
const MUTATION_OPS: [&str; 3] = ["insert", "delete", "update"];

/// One observed database operation.
///
/// Immutable once decoded. `document` keeps the original payload byte for
/// byte; the example record stores it as-is.
#[derive(Debug, Clone, Deserialize)]
pub struct ProfileEntry {
    #[serde(rename = "ts", default)]
    pub timestamp: Option<DateTime>,
    #[serde(default)]
    pub op: String,
    #[serde(rename = "ns", default)]
    pub namespace: String,
    #[serde(default)]
    pub user: String,
    #[serde(rename = "responseLength", default, deserialize_with = "lenient_i64")]
    pub response_length: i64,
    #[serde(rename = "millis", default, deserialize_with = "lenient_i64")]
    pub duration_ms: i64,
    #[serde(rename = "cursorid", default, deserialize_with = "lenient_i64")]
    pub cursor_id: i64,
    #[serde(rename = "keysExamined", default, deserialize_with = "lenient_i64")]
    pub keys_examined: i64,
    #[serde(rename = "docsExamined", default, deserialize_with = "lenient_i64")]
    pub docs_examined: i64,
    #[serde(rename = "hasSortStage", default)]
    pub has_sort_stage: bool,
    #[serde(rename = "nreturned", default, deserialize_with = "lenient_i64")]
    pub n_returned: i64,
    #[serde(rename = "ndeleted", default, deserialize_with = "lenient_i64")]
    pub n_deleted: i64,
    #[serde(rename = "ninserted", default, deserialize_with = "lenient_i64")]
    pub n_inserted: i64,
    #[serde(
        rename = "nModified",
        alias = "nmodified",
        default,
        deserialize_with = "lenient_i64"
    )]
    pub n_modified: i64,
    /// Shape identifier reported by the server, empty when absent.
    #[serde(rename = "queryHash", default)]
    pub upstream_query_hash: String,
    #[serde(rename = "planCacheKey", default)]
    pub plan_hash: String,
    #[serde(rename = "planSummary", default)]
    pub plan_summary: String,

    /// Label of the listened hosts, attached after decoding.
    #[serde(skip, default)]
    pub host: String,
    #[serde(skip, default = "RawDocumentBuf::new")]
    pub document: RawDocumentBuf,
}

impl ProfileEntry {
    /// Decodes `raw` and attaches the host label.
    pub fn from_raw(raw: RawDocumentBuf, host: &str) -> Result<Self, DecodeError> {
        let mut entry: ProfileEntry = bson::from_slice(raw.as_bytes())?;
        entry.host = host.to_string();
        entry.document = raw;
        Ok(entry)
    }

    /// Decodes an unvalidated BSON payload.
    pub fn from_bytes(bytes: Vec<u8>, host: &str) -> Result<Self, DecodeError> {
        let raw = RawDocumentBuf::from_bytes(bytes)?;
        Self::from_raw(raw, host)
    }

    /// Shape identifier: the server's `queryHash` when present, otherwise a
    /// hash of operation and namespace for mutations, otherwise empty.
    pub fn query_hash(&self) -> String {
        if !self.upstream_query_hash.is_empty() {
            return self.upstream_query_hash.clone();
        }
        if MUTATION_OPS.contains(&self.op.as_str()) {
            return fallback_shape_id(&self.op, &self.namespace);
        }
        // No shape for reads without a server-side hash (e.g. an unfiltered
        // distinct); grouping them would need parsing the query itself.
        String::new()
    }

    pub fn timestamp_utc(&self) -> Option<chrono::DateTime<Utc>> {
        self.timestamp.map(|ts| ts.to_chrono())
    }

    pub fn to_slow_op_record(&self) -> SlowOpRecord {
        SlowOpRecord {
            host: self.host.clone(),
            timestamp: self.timestamp,
            op: self.op.clone(),
            collection: self.namespace.clone(),
            user: self.user.clone(),
            response_length: self.response_length,
            duration_ms: self.duration_ms,
            cursor_id: self.cursor_id,
            keys_examined: self.keys_examined,
            docs_examined: self.docs_examined,
            has_sort_stage: self.has_sort_stage,
            n_returned: self.n_returned,
            n_deleted: self.n_deleted,
            n_inserted: self.n_inserted,
            n_modified: self.n_modified,
            query_hash: self.query_hash(),
            plan_hash: self.plan_hash.clone(),
            plan_summary: self.plan_summary.clone(),
        }
    }

    pub fn to_example_record(&self) -> SlowOpExampleRecord {
        SlowOpExampleRecord {
            query_hash: self.query_hash(),
            collection: self.namespace.clone(),
            plan_hash: self.plan_hash.clone(),
            plan_summary: self.plan_summary.clone(),
            document: self.document.clone(),
        }
    }
}

/// Reads the `ts` field of a raw entry without decoding the rest.
pub fn entry_timestamp(raw: &RawDocument) -> Option<DateTime> {
    raw.get("ts").ok().flatten().and_then(|v| v.as_datetime())
}

/// Accepts any BSON number (the server mixes int32, int64 and double) and null.
fn lenient_i64<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    struct LenientI64;

    impl<'de> Visitor<'de> for LenientI64 {
        type Value = i64;

        fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
            f.write_str("a number")
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<i64, E> {
            Ok(v)
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<i64, E> {
            i64::try_from(v).map_err(E::custom)
        }

        fn visit_f64<E: de::Error>(self, v: f64) -> Result<i64, E> {
            Ok(v as i64)
        }

        fn visit_unit<E: de::Error>(self) -> Result<i64, E> {
            Ok(0)
        }

        fn visit_none<E: de::Error>(self) -> Result<i64, E> {
            Ok(0)
        }
    }

    deserializer.deserialize_any(LenientI64)
}
