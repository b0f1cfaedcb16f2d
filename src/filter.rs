//! Decides which oplog entries are worth replicating at all, independent of
//! how they get translated and applied.

use std::collections::BTreeSet;

use crate::oplog::{
    is_allowed_sub_operation,
    is_allowed_top_level_command,
    COMMAND,
    DELETE,
    INSERT,
    UPDATE,
};

/// Namespace and operation-kind filtering, built once from config and
/// shared (read-only) by the reader and the command translator.
#[derive(Debug, Clone, Default)]
pub struct NamespaceFilter {
    databases_in: BTreeSet<String>,
    collections_in: BTreeSet<String>,
    collections_out: BTreeSet<String>,
}

impl NamespaceFilter {
    pub fn new(
        databases_in: impl IntoIterator<Item = String>,
        collections_in: impl IntoIterator<Item = String>,
        collections_out: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            databases_in: databases_in.into_iter().collect(),
            collections_in: collections_in.into_iter().collect(),
            collections_out: collections_out.into_iter().collect(),
        }
    }

    /// Only these four operation kinds carry data or schema changes worth
    /// replicating; `n` (no-op) and `db` (database-level) entries never do.
    pub fn keep_operation(&self, op: &str) -> bool {
        matches!(op, INSERT | UPDATE | DELETE | COMMAND)
    }

    /// Whitelist beats blacklist: an explicit `collections_in` entry is
    /// always kept even if the same name also appears in `collections_out`.
    pub fn keep_collection(&self, db: &str, collection: &str) -> bool {
        if db.is_empty() || collection.is_empty() {
            return false;
        }
        if !self.databases_in.contains(db) {
            return false;
        }
        if !self.collections_in.is_empty() {
            return self.collections_in.contains(collection);
        }
        !self.collections_out.contains(collection)
    }

    pub fn keep_command_name(&self, name: &str) -> bool {
        is_allowed_top_level_command(name)
    }

    /// Whether a sub-entry nested in an `applyOps` bundle survives: its own
    /// operation kind must be a plain data op, and its own namespace must
    /// independently pass [`NamespaceFilter::keep_collection`].
    pub fn keep_sub_op(&self, op: &str, db: &str, collection: &str) -> bool {
        is_allowed_sub_operation(op) && self.keep_collection(db, collection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter() -> NamespaceFilter {
        NamespaceFilter::new(["db1".to_string()], ["coll1".to_string()], [])
    }

    #[test]
    fn empty_namespace_is_never_kept() {
        assert!(!filter().keep_collection("", ""));
    }

    #[test]
    fn whitelisted_collection_in_whitelisted_db_is_kept() {
        assert!(filter().keep_collection("db1", "coll1"));
    }

    #[test]
    fn commands_pass_operation_filter_regardless_of_command_name() {
        assert!(filter().keep_operation("c"));
    }

    #[test]
    fn non_whitelisted_collection_is_dropped_when_whitelist_nonempty() {
        assert!(!filter().keep_collection("db1", "coll2"));
    }

    #[test]
    fn db_outside_whitelist_is_dropped() {
        assert!(!filter().keep_collection("db2", "coll1"));
    }

    #[test]
    fn blacklist_only_filter_drops_blacklisted_collections() {
        let f = NamespaceFilter::new(["db1".to_string()], [], ["coll2".to_string()]);
        assert!(f.keep_collection("db1", "coll1"));
        assert!(!f.keep_collection("db1", "coll2"));
    }

    #[test]
    fn whitelist_beats_blacklist() {
        let f = NamespaceFilter::new(
            ["db1".to_string()],
            ["coll1".to_string()],
            ["coll1".to_string()],
        );
        assert!(f.keep_collection("db1", "coll1"));
    }

    #[test]
    fn command_allow_list_excludes_unlisted_names() {
        assert!(filter().keep_command_name("applyOps"));
        assert!(!filter().keep_command_name("collMod"));
    }

    #[test]
    fn sub_op_requires_both_op_kind_and_namespace() {
        assert!(filter().keep_sub_op("i", "db1", "coll1"));
        assert!(!filter().keep_sub_op("c", "db1", "coll1"));
        assert!(!filter().keep_sub_op("i", "db1", "coll2"));
    }
}
