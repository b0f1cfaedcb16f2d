//! Tails the source oplog beyond the checkpoint and emits filtered,
//! namespace-split change records onto a bounded queue. Grounded on
//! `examples/original_source/internal/pkg/incr/oplog_reader.go` (poll-not-
//! tail cursor lifecycle, 5s reopen / 1s error backoff, 8192 batch) and
//! `incr/command.go` (`applyOps` nested-bundle filtering).

use std::{
    sync::{
        atomic::{
            AtomicBool,
            Ordering as AtomicOrdering,
        },
        Arc,
    },
    time::Duration,
};

use bson::doc;
use futures::TryStreamExt as _;
use mongodb::{
    options::FindOptions,
    Client,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{
    debug,
    error,
    info,
    warn,
};

use super::{
    split_namespace,
    ChangeLog,
    ParsedLog,
    COMMAND,
};
use crate::{
    filter::NamespaceFilter,
    metrics::Metrics,
    oplog_window::{
        OPLOG_COLLECTION,
        OPLOG_DATABASE,
    },
    snapshot::SnapshotEngine,
    timestamp::Timestamp,
};

const CURSOR_WAIT: Duration = Duration::from_secs(5);
const ERROR_RETRY: Duration = Duration::from_secs(1);
const BATCH_SIZE: i32 = 8192;

/// A shared control surface the supervisor and admission surface use to
/// pause/resume tailing and to request ad-hoc resnapshots, without needing
/// a reference to the reader task itself.
#[derive(Clone)]
pub struct ReaderHandle {
    paused: Arc<AtomicBool>,
    snapshot_requests: mpsc::Sender<(String, String)>,
}

impl ReaderHandle {
    pub fn pause(&self) {
        self.paused.store(true, AtomicOrdering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, AtomicOrdering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(AtomicOrdering::SeqCst)
    }

    /// Non-blocking: returns `false` (the caller should answer 429) if the
    /// request queue is momentarily full.
    pub fn request_snapshot(&self, db: String, collection: String) -> bool {
        self.snapshot_requests.try_send((db, collection)).is_ok()
    }
}

pub struct OplogReader {
    source: Client,
    filter: NamespaceFilter,
    metrics: Metrics,
    paused: Arc<AtomicBool>,
    snapshot_requests: mpsc::Receiver<(String, String)>,
    snapshot_engine: SnapshotEngine,
}

impl OplogReader {
    pub fn new(source: Client, filter: NamespaceFilter, metrics: Metrics, snapshot_engine: SnapshotEngine) -> (Self, ReaderHandle) {
        let (tx, rx) = mpsc::channel(16);
        let paused = Arc::new(AtomicBool::new(false));
        let handle = ReaderHandle { paused: paused.clone(), snapshot_requests: tx };
        (
            Self { source, filter, metrics, paused, snapshot_requests: rx, snapshot_engine },
            handle,
        )
    }

    /// Runs the tailing loop until `token` is cancelled. `start` is the
    /// resume position (typically the checkpoint's `latest_ts`); `cle_tx` is
    /// the bounded queue the writer drains.
    pub async fn run(mut self, start: Timestamp, cle_tx: mpsc::Sender<ChangeLog>, token: CancellationToken) {
        let mut latest = start;
        info!(?latest, "starting oplog reader");

        'outer: loop {
            if token.is_cancelled() {
                break;
            }

            if self.paused.load(AtomicOrdering::SeqCst) {
                tokio::select! {
                    _ = tokio::time::sleep(CURSOR_WAIT) => continue 'outer,
                    _ = token.cancelled() => break 'outer,
                }
            }

            if let Ok((db, collection)) = self.snapshot_requests.try_recv() {
                info!(db, collection, "running requested resnapshot");
                if let Err(e) = self.snapshot_engine.snapshot_collection(&db, &collection, false).await {
                    error!(db, collection, error = %e, "resnapshot request failed");
                }
            }

            let oplog = self
                .source
                .database(OPLOG_DATABASE)
                .collection::<ParsedLog>(OPLOG_COLLECTION);
            let filter = doc! { "ts": { "$gt": bson::Timestamp::from(latest) } };
            let opts = FindOptions::builder().batch_size(BATCH_SIZE as u32).build();

            let mut cursor = match oplog.find(filter).with_options(opts).await {
                Ok(cursor) => cursor,
                Err(e) => {
                    error!(error = %e, "failed to open oplog cursor");
                    tokio::select! {
                        _ = tokio::time::sleep(CURSOR_WAIT) => continue 'outer,
                        _ = token.cancelled() => break 'outer,
                    }
                },
            };

            loop {
                let next = tokio::select! {
                    next = cursor.try_next() => next,
                    _ = token.cancelled() => break 'outer,
                };
                let entry = match next {
                    Ok(Some(entry)) => entry,
                    Ok(None) => break,
                    Err(e) => {
                        error!(error = %e, "error reading oplog cursor, reopening after backoff");
                        tokio::time::sleep(ERROR_RETRY).await;
                        break;
                    },
                };

                if let Some(new_latest) = self.handle_entry(entry, &cle_tx).await {
                    latest = new_latest;
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(CURSOR_WAIT) => {},
                _ = token.cancelled() => break 'outer,
            }
        }

        info!("stopped oplog reader");
    }

    /// Returns the new `latest` timestamp if the entry should advance the
    /// resume position (every entry that reaches the filter does, whether
    /// or not it was actually emitted).
    async fn handle_entry(&self, log: ParsedLog, cle_tx: &mpsc::Sender<ChangeLog>) -> Option<Timestamp> {
        let ts: Timestamp = log.timestamp.into();

        if !self.filter.keep_operation(&log.operation) {
            return None;
        }

        if log.operation == COMMAND {
            return self.handle_command(log, cle_tx).await.then_some(ts);
        }

        let (db, collection) = split_namespace(&log.namespace);
        if !self.filter.keep_collection(&db, &collection) {
            return None;
        }

        self.metrics
            .incr_oplog_read_total
            .with_label_values(&[&db, &collection, &log.operation])
            .inc();

        let change = ChangeLog { log, db, collection };
        if cle_tx.send(change).await.is_err() {
            warn!("writer channel closed, dropping entry");
        }
        Some(ts)
    }

    /// Returns `true` if the command (or filtered `applyOps` bundle)
    /// progressed history and should advance `latest`; this is true even
    /// for an unrecognized command name, since history still moved forward.
    async fn handle_command(&self, log: ParsedLog, cle_tx: &mpsc::Sender<ChangeLog>) -> bool {
        let (db, _) = split_namespace(&log.namespace);
        let Some((name, _)) = log.object.iter().next().map(|(k, v)| (k.clone(), v.clone())) else {
            return true;
        };

        if !self.filter.keep_command_name(&name) {
            debug!(db, command = %name, "dropping unrecognized oplog command");
            return true;
        }

        let emitted = if name == "applyOps" {
            self.filter_apply_ops(&db, &log)
        } else {
            Some(log.clone())
        };

        let Some(mut filtered) = emitted else {
            return true;
        };
        filtered.namespace = log.namespace.clone();

        self.metrics
            .incr_oplog_read_total
            .with_label_values(&[&db, "$cmd", &log.operation])
            .inc();

        let change = ChangeLog { log: filtered, db, collection: "$cmd".to_string() };
        if cle_tx.send(change).await.is_err() {
            warn!("writer channel closed, dropping command entry");
        }
        true
    }

    /// Filters the nested `applyOps` array, keeping only children whose own
    /// `{op, ns}` pass [`NamespaceFilter::keep_sub_op`]. Returns `None` if
    /// nothing in the bundle survives.
    fn filter_apply_ops(&self, cmd_db: &str, log: &ParsedLog) -> Option<ParsedLog> {
        let ops = log.object.get_array("applyOps").ok()?;
        let mut kept = Vec::new();
        for op in ops {
            let Some(child) = op.as_document() else { continue };
            let Ok(op_kind) = child.get_str("op") else { continue };
            let ns = child.get_str("ns").unwrap_or_default();
            let (db, coll) = if ns.is_empty() { (cmd_db.to_string(), String::new()) } else { split_namespace(ns) };
            if self.filter.keep_sub_op(op_kind, &db, &coll) {
                kept.push(bson::Bson::Document(child.clone()));
            }
        }
        if kept.is_empty() {
            return None;
        }
        let mut object = log.object.clone();
        object.insert("applyOps", kept);
        Some(ParsedLog { object, ..log.clone() })
    }
}

#[cfg(test)]
mod tests {
    use bson::doc;

    use super::*;
    use crate::oplog::INSERT;

    #[test]
    fn command_without_leading_key_is_not_fatal() {
        let log = ParsedLog {
            timestamp: bson::Timestamp { time: 1, increment: 0 },
            version: 2,
            operation: COMMAND.to_string(),
            namespace: "db1.$cmd".to_string(),
            object: doc! {},
            query: None,
            document_key: None,
        };
        assert!(log.object.iter().next().is_none());
    }

    #[test]
    fn apply_ops_filter_keeps_only_matching_children() {
        let filter = NamespaceFilter::new(["db1".to_string()], ["coll1".to_string()], []);
        let log = ParsedLog {
            timestamp: bson::Timestamp { time: 1, increment: 0 },
            version: 2,
            operation: COMMAND.to_string(),
            namespace: "db1.$cmd".to_string(),
            object: doc! {
                "applyOps": [
                    { "op": INSERT, "ns": "db1.coll1", "o": { "_id": 1i32 } },
                    { "op": INSERT, "ns": "db2.coll1", "o": { "_id": 2i32 } },
                ]
            },
            query: None,
            document_key: None,
        };

        let reader = test_reader(filter);
        let filtered = reader.filter_apply_ops("db1", &log).unwrap();
        let ops = filtered.object.get_array("applyOps").unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].as_document().unwrap().get_str("ns").unwrap(), "db1.coll1");
    }

    #[test]
    fn apply_ops_with_nothing_kept_returns_none() {
        let filter = NamespaceFilter::new(["db1".to_string()], ["coll1".to_string()], []);
        let log = ParsedLog {
            timestamp: bson::Timestamp { time: 1, increment: 0 },
            version: 2,
            operation: COMMAND.to_string(),
            namespace: "db1.$cmd".to_string(),
            object: doc! {
                "applyOps": [
                    { "op": INSERT, "ns": "db2.coll1", "o": { "_id": 2i32 } },
                ]
            },
            query: None,
            document_key: None,
        };
        let reader = test_reader(filter);
        assert!(reader.filter_apply_ops("db1", &log).is_none());
    }

    fn test_reader(filter: NamespaceFilter) -> OplogReader {
        let client = futures::executor::block_on(mongodb::Client::with_uri_str("mongodb://localhost:27017"))
            .expect("client construction does not connect eagerly");
        let metrics = Metrics::new().unwrap();
        let engine = SnapshotEngine::new(client.clone(), client.clone(), metrics.clone(), 500, false);
        let (reader, _handle) = OplogReader::new(client, filter, metrics, engine);
        reader
    }
}
