//! Applies change records to the target. Grounded on
//! `examples/original_source/internal/pkg/incr/oplog_writer.go` (per-op
//! dispatch, snapshot-cut-gated error swallowing) and `incr/command.go`
//! (command stripping/translation).

use std::sync::Arc;

use bson::doc;
use mongodb::{
    options::UpdateOptions,
    Client,
};
use tokio::sync::mpsc;
use tracing::{
    error,
    warn,
};

use super::{
    diff::{
        translate_update_object,
        DiffOutcome,
    },
    ChangeLog,
    COMMAND,
    DELETE,
    INSERT,
    UPDATE,
};
use crate::{
    checkpoint::CheckpointManager,
    error::{
        ReplError,
        Result,
    },
    metrics::Metrics,
    timestamp::Timestamp,
};

const UUID_FIELD: &str = "ui";
const DB_FIELD: &str = "$db";

pub struct OplogWriter {
    target: Client,
    checkpoint: Arc<CheckpointManager>,
    metrics: Metrics,
    snapshot_cut: Timestamp,
}

impl OplogWriter {
    pub fn new(target: Client, checkpoint: Arc<CheckpointManager>, metrics: Metrics, snapshot_cut: Timestamp) -> Self {
        Self { target, checkpoint, metrics, snapshot_cut }
    }

    /// Drains `cle_rx` until the channel is closed (the reader, and thus
    /// the whole pipeline, is shutting down).
    pub async fn run(self, mut cle_rx: mpsc::Receiver<ChangeLog>) {
        while let Some(entry) = cle_rx.recv().await {
            let db = entry.db.clone();
            let collection = entry.collection.clone();
            let op = entry.operation().to_string();
            let ts = entry.timestamp();

            let result = match entry.operation() {
                INSERT => self.handle_insert(&entry).await,
                UPDATE => self.handle_update(&entry).await,
                DELETE => self.handle_delete(&entry).await,
                COMMAND => self.handle_command(&entry).await,
                other => {
                    warn!(op = other, "writer received an entry of an unexpected operation kind");
                    Ok(())
                },
            };

            match result {
                Ok(()) => {
                    self.checkpoint.advance_in_memory(ts).await;
                    self.metrics.incr_oplog_write_total.with_label_values(&[&db, &collection, &op]).inc();
                    self.metrics.incr_checkpoint.with_label_values(&["default"]).set(ts.t as i64);
                },
                Err(e) => error!(db, collection, op, error = %e, "failed to apply oplog entry"),
            }
        }
    }

    fn before_cut(&self, ts: Timestamp) -> bool {
        ts <= self.snapshot_cut
    }

    async fn handle_insert(&self, entry: &ChangeLog) -> Result<()> {
        let coll = self.target.database(&entry.db).collection::<bson::Document>(&entry.collection);
        match coll.insert_one(&entry.log.object).await {
            Ok(_) => Ok(()),
            Err(e) if is_duplicate_key(&e) => self.upsert_full_document(entry).await,
            Err(e) => Err(e.into()),
        }
    }

    async fn upsert_full_document(&self, entry: &ChangeLog) -> Result<()> {
        let coll = self.target.database(&entry.db).collection::<bson::Document>(&entry.collection);
        let Some(filter) = entry.identity_filter() else { return Err(ReplError::MissingIdentity) };
        let opts = UpdateOptions::builder().upsert(true).build();
        let update = doc! { "$set": &entry.log.object };
        match coll.update_one(filter, update).with_options(opts).await {
            Ok(_) => Ok(()),
            Err(e) if is_duplicate_key(&e) && self.before_cut(entry.timestamp()) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn handle_update(&self, entry: &ChangeLog) -> Result<()> {
        let coll = self.target.database(&entry.db).collection::<bson::Document>(&entry.collection);

        let filter = entry
            .identity_filter()
            .or_else(|| entry.log.query.clone())
            .ok_or(ReplError::MissingIdentity)?;

        let outcome = translate_update_object(&entry.log.object);
        let opts = UpdateOptions::builder().upsert(true).build();
        let result = match outcome {
            Ok(DiffOutcome::Update(update)) => coll.update_one(filter, update).with_options(opts).await,
            Ok(DiffOutcome::Pipeline(stages)) => coll.update_one(filter, stages).with_options(opts).await,
            Err(e) => return Err(e),
        };

        match result {
            Ok(update_result) => {
                let upserted = update_result.upserted_id.is_some();
                if update_result.matched_count == 0 && !upserted && !self.before_cut(entry.timestamp()) {
                    return Err(ReplError::Other(anyhow::anyhow!(
                        "update matched no documents and upserted none after the snapshot cut: {:?}",
                        entry.log.query
                    )));
                }
                Ok(())
            },
            Err(e) if is_path_not_viable(&e) && self.before_cut(entry.timestamp()) => Ok(()),
            Err(e) if is_duplicate_key(&e) && self.before_cut(entry.timestamp()) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn handle_delete(&self, entry: &ChangeLog) -> Result<()> {
        let coll = self.target.database(&entry.db).collection::<bson::Document>(&entry.collection);
        let Some(filter) = entry.identity_filter().or_else(|| entry.log.query.clone()) else {
            return Err(ReplError::MissingIdentity);
        };
        match coll.delete_one(filter).await {
            Ok(_) => Ok(()),
            Err(e) if is_namespace_not_found(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn handle_command(&self, entry: &ChangeLog) -> Result<()> {
        let Some((name, value)) = entry.log.object.iter().next().map(|(k, v)| (k.clone(), v.clone())) else {
            return Ok(());
        };

        let result = match name.as_str() {
            "commitIndexBuild" => self.run_commit_index_build(&entry.db, &value, &entry.log.object).await,
            "dropIndexes" => self.run_pass_through(&entry.db, &entry.log.object).await,
            "applyOps" => self.run_apply_ops(&entry.db, &entry.log.object).await,
            _ => self.run_pass_through(&entry.db, &entry.log.object).await,
        };

        match result {
            Ok(()) => Ok(()),
            Err(e) if is_namespace_not_found(&e) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn run_commit_index_build(&self, db: &str, collection_name: &bson::Bson, object: &bson::Document) -> Result<()> {
        let Some(collection) = collection_name.as_str() else { return Ok(()) };
        let indexes = object.get_array("indexes").cloned().unwrap_or_default();
        let command = doc! { "createIndexes": collection, "indexes": indexes };
        self.target.database(db).run_command(command).await?;
        Ok(())
    }

    async fn run_pass_through(&self, db: &str, object: &bson::Document) -> Result<()> {
        let stripped = strip_internal_fields(object);
        self.target.database(db).run_command(stripped).await?;
        Ok(())
    }

    async fn run_apply_ops(&self, db: &str, object: &bson::Document) -> Result<()> {
        let mut stripped = strip_internal_fields(object);
        if let Ok(ops) = stripped.get_array_mut("applyOps") {
            for op in ops.iter_mut() {
                if let bson::Bson::Document(child) = op {
                    child.remove(UUID_FIELD);
                }
            }
        }
        self.target.database(db).run_command(stripped).await?;
        Ok(())
    }
}

fn strip_internal_fields(object: &bson::Document) -> bson::Document {
    let mut out = object.clone();
    out.remove(UUID_FIELD);
    out.remove(DB_FIELD);
    out
}

/// Extracts the server error code from a driver error, looking at both the
/// plain-command and write-error shapes `mongodb::error::Error` can take.
fn error_code(err: &mongodb::error::Error) -> Option<i32> {
    use mongodb::error::{
        ErrorKind,
        WriteFailure,
    };
    match err.kind.as_ref() {
        ErrorKind::Command(cmd) => Some(cmd.code),
        ErrorKind::Write(WriteFailure::WriteError(we)) => Some(we.code),
        _ => None,
    }
}

fn is_duplicate_key(err: &mongodb::error::Error) -> bool {
    error_code(err) == Some(11000)
}

fn is_namespace_not_found(err: &mongodb::error::Error) -> bool {
    error_code(err) == Some(26)
}

fn is_path_not_viable(err: &mongodb::error::Error) -> bool {
    matches!(error_code(err), Some(28) | Some(211))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_internal_fields_removes_ui_and_db() {
        let object = doc! { "applyOps": [], "ui": "some-uuid", "$db": "admin" };
        let stripped = strip_internal_fields(&object);
        assert!(!stripped.contains_key("ui"));
        assert!(!stripped.contains_key("$db"));
        assert!(stripped.contains_key("applyOps"));
    }
}
