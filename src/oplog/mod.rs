//! Parsed oplog entries and the namespace-splitting helper shared by the
//! reader, writer and command translation.

pub mod diff;
pub mod reader;
pub mod writer;

use bson::Document;
use serde::{
    Deserialize,
    Serialize,
};

use crate::timestamp::Timestamp;

pub const INSERT: &str = "i";
pub const UPDATE: &str = "u";
pub const DELETE: &str = "d";
pub const COMMAND: &str = "c";
pub const NOOP: &str = "n";
pub const DB_OP: &str = "db";

/// One raw entry as it appears in `local.oplog.rs`. Field names mirror the
/// server's oplog schema (`ts`, `v`, `op`, `ns`, `o`, `o2`, `documentKey`);
/// fields the core never reads (`lsid`, `txnNumber`, `fromMigrate`, `ui`,
/// `h`, `t`) are dropped rather than modeled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParsedLog {
    #[serde(rename = "ts")]
    pub timestamp: bson::Timestamp,
    #[serde(rename = "v")]
    pub version: i64,
    #[serde(rename = "op")]
    pub operation: String,
    #[serde(rename = "ns")]
    pub namespace: String,
    #[serde(rename = "o", default)]
    pub object: Document,
    #[serde(rename = "o2", default, skip_serializing_if = "Option::is_none")]
    pub query: Option<Document>,
    #[serde(rename = "documentKey", default, skip_serializing_if = "Option::is_none")]
    pub document_key: Option<Document>,
}

/// A [`ParsedLog`] enriched with the namespace split the reader performs
/// once, so downstream consumers never re-parse `namespace`.
#[derive(Debug, Clone)]
pub struct ChangeLog {
    pub log: ParsedLog,
    pub db: String,
    pub collection: String,
}

impl ChangeLog {
    pub fn timestamp(&self) -> Timestamp {
        self.log.timestamp.into()
    }

    pub fn operation(&self) -> &str {
        &self.log.operation
    }

    /// Preferred upsert/delete filter: the pre-image shard-key + `_id` when
    /// present, falling back to a synthetic `{_id: ...}` filter built from
    /// the operation payload.
    pub fn identity_filter(&self) -> Option<Document> {
        if let Some(key) = &self.log.document_key {
            if !key.is_empty() {
                return Some(key.clone());
            }
        }
        self.log
            .object
            .get("_id")
            .map(|id| bson::doc! { "_id": id.clone() })
    }
}

/// Splits `"database.collection.sub"` into `("database", "collection.sub")`.
/// An empty namespace yields two empty strings; a namespace with no `.`
/// yields the whole string as the database and an empty collection.
pub fn split_namespace(namespace: &str) -> (String, String) {
    if namespace.is_empty() {
        return (String::new(), String::new());
    }
    match namespace.find('.') {
        Some(idx) => (namespace[..idx].to_string(), namespace[idx + 1..].to_string()),
        None => (namespace.to_string(), String::new()),
    }
}

/// Command names the core recognizes inside a `c`-operation, alongside
/// whether they are meaningful at the top level of the oplog (as opposed to
/// only nested inside an `applyOps` bundle).
pub fn is_allowed_top_level_command(name: &str) -> bool {
    matches!(
        name,
        "applyOps" | "startIndexBuild" | "commitIndexBuild" | "abortIndexBuild" | "dropIndexes"
    )
}

/// The (smaller) set of operation kinds allowed inside an `applyOps` child
/// entry, independent of the top-level command allow-list.
pub fn is_allowed_sub_operation(op: &str) -> bool {
    matches!(op, INSERT | UPDATE | DELETE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_simple_namespace() {
        assert_eq!(
            split_namespace("mydb.mycoll"),
            ("mydb".to_string(), "mycoll".to_string())
        );
    }

    #[test]
    fn splits_dotted_collection_name() {
        assert_eq!(
            split_namespace("mydb.system.buckets.mycoll"),
            ("mydb".to_string(), "system.buckets.mycoll".to_string())
        );
    }

    #[test]
    fn empty_namespace_splits_to_empty() {
        assert_eq!(split_namespace(""), (String::new(), String::new()));
    }

    #[test]
    fn namespace_without_dot_has_no_collection() {
        assert_eq!(split_namespace("admin"), ("admin".to_string(), String::new()));
    }

    #[test]
    fn command_allow_list_matches_index_and_apply_ops_commands() {
        assert!(is_allowed_top_level_command("applyOps"));
        assert!(is_allowed_top_level_command("commitIndexBuild"));
        assert!(!is_allowed_top_level_command("collMod"));
        assert!(!is_allowed_top_level_command("create"));
    }

    #[test]
    fn sub_operation_allow_list_is_data_ops_only() {
        assert!(is_allowed_sub_operation("i"));
        assert!(is_allowed_sub_operation("u"));
        assert!(is_allowed_sub_operation("d"));
        assert!(!is_allowed_sub_operation("c"));
        assert!(!is_allowed_sub_operation("n"));
    }
}
