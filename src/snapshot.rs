//! Initial convergence snapshot: a sorted-key delta reconciliation between
//! source and target, one collection at a time. Grounded on
//! `examples/original_source/internal/pkg/snapshot/delta.go` for the
//! two-cursor algorithm and on the teacher's `database/src/index_worker.rs`
//! backfill-worker shape for the bounded-batch loop.

use std::cmp::Ordering;

use bson::{
    doc,
    oid::ObjectId,
    Document,
};
use futures::TryStreamExt as _;
use mongodb::{
    options::{
        FindOptions,
        UpdateOptions,
    },
    Client,
    IndexModel,
};
use tracing::{
    info,
    warn,
};

use crate::{
    error::Result,
    metrics::Metrics,
};

/// The outcome of comparing one batch of source/target documents sorted by
/// `_id`.
#[derive(Debug, Default, PartialEq)]
pub struct Delta {
    pub insert: Vec<Document>,
    pub update: Vec<Document>,
    pub delete: Vec<ObjectId>,
}

/// Walks two `_id`-sorted slices in parallel and classifies every key into
/// insert/update/delete, exactly mirroring a merge-join. Returns the delta
/// plus the furthest `_id` consumed on each side, which becomes the next
/// batch's starting key.
pub fn reconcile(source: &[Document], target: &[Document]) -> (Delta, Option<ObjectId>, Option<ObjectId>) {
    let mut delta = Delta::default();
    let (mut i, mut j) = (0, 0);
    let mut last_source = None;
    let mut last_target = None;

    while i < source.len() && j < target.len() {
        let sid = id_of(&source[i]);
        let tid = id_of(&target[j]);
        match sid.cmp(&tid) {
            Ordering::Equal => {
                delta.update.push(source[i].clone());
                last_source = Some(sid);
                last_target = Some(tid);
                i += 1;
                j += 1;
            },
            Ordering::Less => {
                delta.insert.push(source[i].clone());
                last_source = Some(sid);
                i += 1;
            },
            Ordering::Greater => {
                delta.delete.push(tid);
                last_target = Some(tid);
                j += 1;
            },
        }
    }
    while i < source.len() {
        delta.insert.push(source[i].clone());
        last_source = Some(id_of(&source[i]));
        i += 1;
    }
    while j < target.len() {
        delta.delete.push(id_of(&target[j]));
        last_target = Some(id_of(&target[j]));
        j += 1;
    }

    (delta, last_source, last_target)
}

fn id_of(doc: &Document) -> ObjectId {
    doc.get_object_id("_id").copied().unwrap_or_default()
}

/// Snapshots one (database, collection) pair: reads source/target in
/// `_id`-sorted batches, reconciles, and bulk-applies the delta until both
/// sides are exhausted. When `initial` is set the target read is skipped
/// entirely (everything is an insert), matching a target known to be empty.
#[derive(Clone)]
pub struct SnapshotEngine {
    source: Client,
    target: Client,
    metrics: Metrics,
    batch_size: u32,
    update_on_duplicate: bool,
}

impl SnapshotEngine {
    pub fn new(source: Client, target: Client, metrics: Metrics, batch_size: u32, update_on_duplicate: bool) -> Self {
        Self { source, target, metrics, batch_size, update_on_duplicate }
    }

    pub async fn snapshot_collection(&self, db: &str, collection: &str, initial: bool) -> Result<()> {
        info!(db, collection, initial, "starting collection snapshot");
        let source_coll = self.source.database(db).collection::<Document>(collection);
        let target_coll = self.target.database(db).collection::<Document>(collection);

        let mut cursor_id: Option<ObjectId> = None;
        let mut documents_read: i64 = 0;

        loop {
            let source_batch = fetch_batch(&source_coll, cursor_id, self.batch_size).await?;
            let target_batch = if initial {
                Vec::new()
            } else if source_batch.is_empty() {
                // Source exhausted: any remaining target ids sort after
                // every source id and are pure deletes, so the range is
                // open-ended rather than bounded by a last source id.
                fetch_range(&target_coll, cursor_id, None).await?
            } else {
                let last_source_id = source_batch.last().map(id_of);
                fetch_range(&target_coll, cursor_id, last_source_id).await?
            };

            if source_batch.is_empty() && target_batch.is_empty() {
                break;
            }

            let (delta, last_source, last_target) = reconcile(&source_batch, &target_batch);
            documents_read += source_batch.len() as i64;
            self.apply_delta(&target_coll, delta).await?;

            self.metrics.snapshot_progress.with_label_values(&[db, collection]).set(documents_read);
            self.metrics.snapshot_read_total.inc_by(source_batch.len() as u64);

            cursor_id = match (last_source, last_target) {
                (Some(s), Some(t)) => Some(std::cmp::max(s, t)),
                (Some(s), None) => Some(s),
                (None, Some(t)) => Some(t),
                (None, None) => break,
            };

            if source_batch.is_empty() {
                break;
            }
        }

        self.copy_indexes(db, collection).await?;
        info!(db, collection, documents_read, "collection snapshot complete");
        Ok(())
    }

    async fn apply_delta(&self, target: &mongodb::Collection<Document>, delta: Delta) -> Result<()> {
        for doc in delta.insert {
            let id = doc.get_object_id("_id").copied();
            let Some(id) = id else { continue };
            let opts = UpdateOptions::builder().upsert(true).build();
            let result = target
                .update_one(doc! { "_id": id }, doc! { "$set": &doc })
                .with_options(opts.clone())
                .await;
            if let Err(e) = result {
                if self.update_on_duplicate && is_duplicate_key(&e) {
                    warn!(%id, "duplicate key on snapshot insert, retrying as upsert");
                    self.metrics.snapshot_error_total.with_label_values(&["duplicate_key"]).inc();
                    target.update_one(doc! { "_id": id }, doc! { "$set": &doc }).with_options(opts).await?;
                } else {
                    self.metrics.snapshot_error_total.with_label_values(&["write_failed"]).inc();
                    return Err(e.into());
                }
            }
            self.metrics.snapshot_write_total.with_label_values(&["insert"]).inc();
        }
        for doc in delta.update {
            let id = doc.get_object_id("_id").copied();
            let Some(id) = id else { continue };
            let opts = UpdateOptions::builder().upsert(true).build();
            target.update_one(doc! { "_id": id }, doc! { "$set": &doc }).with_options(opts).await?;
            self.metrics.snapshot_write_total.with_label_values(&["update"]).inc();
        }
        if !delta.delete.is_empty() {
            let ids: Vec<bson::Bson> = delta.delete.iter().map(|id| bson::Bson::ObjectId(*id)).collect();
            target.delete_many(doc! { "_id": { "$in": ids } }).await?;
            self.metrics.snapshot_write_total.with_label_values(&["delete"]).inc_by(delta.delete.len() as u64);
        }
        Ok(())
    }

    async fn copy_indexes(&self, db: &str, collection: &str) -> Result<()> {
        let source_coll = self.source.database(db).collection::<Document>(collection);
        let target_coll = self.target.database(db).collection::<Document>(collection);

        let mut cursor = source_coll.list_indexes().await?;
        let mut models = Vec::new();
        while let Some(index) = cursor.try_next().await? {
            let keys = index.keys.clone();
            if keys == doc! { "_id": 1 } {
                continue;
            }
            let mut options_builder = mongodb::options::IndexOptions::builder();
            if let Some(name) = index.options.as_ref().and_then(|o| o.name.clone()) {
                options_builder = options_builder.name(name);
            }
            if let Some(unique) = index.options.as_ref().and_then(|o| o.unique) {
                options_builder = options_builder.unique(unique);
            }
            models.push(IndexModel::builder().keys(keys).options(options_builder.build()).build());
        }
        if !models.is_empty() {
            target_coll.create_indexes(models).await?;
        }
        Ok(())
    }
}

async fn fetch_batch(coll: &mongodb::Collection<Document>, after: Option<ObjectId>, batch_size: u32) -> Result<Vec<Document>> {
    let filter = match after {
        Some(id) => doc! { "_id": { "$gt": id } },
        None => doc! {},
    };
    let opts = FindOptions::builder().sort(doc! { "_id": 1 }).limit(batch_size as i64).build();
    let docs = coll.find(filter).with_options(opts).await?.try_collect().await?;
    Ok(docs)
}

/// Fetches target documents sorted by `_id` in `(after, up_to]`. `up_to` of
/// `None` means open-ended: everything past `after`, used once the source
/// side is exhausted and any remaining target ids are pure deletes.
async fn fetch_range(coll: &mongodb::Collection<Document>, after: Option<ObjectId>, up_to: Option<ObjectId>) -> Result<Vec<Document>> {
    let filter = match (after, up_to) {
        (Some(after), Some(up_to)) => doc! { "_id": { "$gt": after, "$lte": up_to } },
        (Some(after), None) => doc! { "_id": { "$gt": after } },
        (None, Some(up_to)) => doc! { "_id": { "$lte": up_to } },
        (None, None) => doc! {},
    };
    let opts = FindOptions::builder().sort(doc! { "_id": 1 }).build();
    let docs = coll.find(filter).with_options(opts).await?.try_collect().await?;
    Ok(docs)
}

fn is_duplicate_key(err: &mongodb::error::Error) -> bool {
    use mongodb::error::{
        ErrorKind,
        WriteFailure,
    };
    matches!(
        err.kind.as_ref(),
        ErrorKind::Command(cmd) if cmd.code == 11000
    ) || matches!(
        err.kind.as_ref(),
        ErrorKind::Write(WriteFailure::WriteError(we)) if we.code == 11000
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc_with_id(n: u8) -> Document {
        let mut bytes = [0u8; 12];
        bytes[11] = n;
        doc! { "_id": ObjectId::from_bytes(bytes), "v": n as i32 }
    }

    #[test]
    fn worked_example_from_the_specification() {
        let source_ids = [1, 2, 3, 50, 100, 101, 105];
        let target_ids = [1, 2, 3, 5, 6, 7, 8, 9, 200, 201];
        let source: Vec<_> = source_ids.iter().map(|n| doc_with_id(*n)).collect();
        let target: Vec<_> = target_ids.iter().map(|n| doc_with_id(*n)).collect();

        let (delta, _, _) = reconcile(&source, &target);
        assert_eq!(delta.update.len(), 3);
        assert_eq!(delta.insert.len(), 4);
        assert_eq!(delta.delete.len(), 7);
    }

    #[test]
    fn insert_count_matches_law() {
        let source: Vec<_> = [1u8, 2, 3].iter().map(|n| doc_with_id(*n)).collect();
        let target: Vec<_> = [2u8].iter().map(|n| doc_with_id(*n)).collect();
        let (delta, _, _) = reconcile(&source, &target);
        assert_eq!(delta.insert.len(), 2);
        assert_eq!(delta.update.len(), 1);
        assert_eq!(delta.delete.len(), 0);
    }

    #[test]
    fn delete_count_matches_law() {
        let source: Vec<_> = [2u8].iter().map(|n| doc_with_id(*n)).collect();
        let target: Vec<_> = [1u8, 2, 3].iter().map(|n| doc_with_id(*n)).collect();
        let (delta, _, _) = reconcile(&source, &target);
        assert_eq!(delta.delete.len(), 2);
        assert_eq!(delta.update.len(), 1);
    }

    #[test]
    fn empty_target_is_all_inserts() {
        let source: Vec<_> = [1u8, 2, 3].iter().map(|n| doc_with_id(*n)).collect();
        let (delta, last_source, last_target) = reconcile(&source, &[]);
        assert_eq!(delta.insert.len(), 3);
        assert!(delta.update.is_empty());
        assert!(last_target.is_none());
        assert_eq!(last_source, Some(id_of(&source[2])));
    }

    #[test]
    fn cursor_advances_to_the_further_of_the_two_sides() {
        let source: Vec<_> = [1u8, 2].iter().map(|n| doc_with_id(*n)).collect();
        let target: Vec<_> = [1u8, 2, 3, 4].iter().map(|n| doc_with_id(*n)).collect();
        let (_, last_source, last_target) = reconcile(&source, &target);
        assert_eq!(last_source, Some(id_of(&source[1])));
        assert_eq!(last_target, Some(id_of(&target[3])));
    }
}
