//! Persisted record shapes.

use bson::{DateTime, Document, RawBson, RawDocumentBuf};
use serde::Serialize;

use crate::error::StoreError;

fn is_zero(v: &i64) -> bool {
    *v == 0
}

fn is_false(v: &bool) -> bool {
    !*v
}

/// One observed operation, appended to `slowops`.
///
/// Zero and empty fields are left out of the stored document; `host` is
/// always written.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SlowOpRecord {
    pub host: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub op: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub collection: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub user: String,
    #[serde(rename = "responseLength", skip_serializing_if = "is_zero")]
    pub response_length: i64,
    #[serde(rename = "durationMS", skip_serializing_if = "is_zero")]
    pub duration_ms: i64,
    #[serde(rename = "cursorID", skip_serializing_if = "is_zero")]
    pub cursor_id: i64,
    #[serde(rename = "keysExamined", skip_serializing_if = "is_zero")]
    pub keys_examined: i64,
    #[serde(rename = "docsExamined", skip_serializing_if = "is_zero")]
    pub docs_examined: i64,
    #[serde(rename = "hasSortStage", skip_serializing_if = "is_false")]
    pub has_sort_stage: bool,
    #[serde(rename = "nreturned", skip_serializing_if = "is_zero")]
    pub n_returned: i64,
    #[serde(rename = "ndeleted", skip_serializing_if = "is_zero")]
    pub n_deleted: i64,
    #[serde(rename = "ninserted", skip_serializing_if = "is_zero")]
    pub n_inserted: i64,
    #[serde(rename = "nmodified", skip_serializing_if = "is_zero")]
    pub n_modified: i64,
    #[serde(rename = "queryHash", skip_serializing_if = "String::is_empty")]
    pub query_hash: String,
    #[serde(rename = "planHash", skip_serializing_if = "String::is_empty")]
    pub plan_hash: String,
    #[serde(rename = "planSummary", skip_serializing_if = "String::is_empty")]
    pub plan_summary: String,
}

impl SlowOpRecord {
    pub fn to_document(&self) -> Result<Document, StoreError> {
        bson::to_document(self).map_err(|e| StoreError::Serialization(e.to_string()))
    }
}

/// First example seen for a `(queryHash, collection)` pair, kept in
/// `slowops.examples` together with the untouched profiler document.
#[derive(Debug, Clone, PartialEq)]
pub struct SlowOpExampleRecord {
    pub query_hash: String,
    pub collection: String,
    pub plan_hash: String,
    pub plan_summary: String,
    pub document: RawDocumentBuf,
}

impl SlowOpExampleRecord {
    /// Builds the stored example. The profiler document is embedded as the
    /// exact bytes it was read as, and `planHash` / `planSummary` are always
    /// written, empty or not.
    pub fn to_raw_document(&self) -> RawDocumentBuf {
        let mut out = RawDocumentBuf::new();
        out.append("queryHash", RawBson::String(self.query_hash.clone()));
        out.append("collection", RawBson::String(self.collection.clone()));
        out.append("planHash", RawBson::String(self.plan_hash.clone()));
        out.append("planSummary", RawBson::String(self.plan_summary.clone()));
        out.append("document", RawBson::Document(self.document.clone()));
        out
    }
}
