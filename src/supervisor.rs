//! Wires the checkpoint manager, snapshot engine, reader and writer
//! together, decides snapshot-vs-tail at startup, and multiplexes the
//! control-command channel. Grounded on the teacher's `fivetran_source`
//! `sync()` dispatch (decide-phase-from-checkpoint shape) and
//! `examples/original_source/internal/pkg/incr/writer.go` / `api/command.go`
//! for the control-command channel's 429-on-full semantics.

use std::sync::Arc;

use mongodb::Client;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{
    info,
    warn,
};

use crate::{
    checkpoint::CheckpointManager,
    config::Config,
    error::{
        ReplError,
        Result,
    },
    filter::NamespaceFilter,
    metrics::Metrics,
    oplog::{
        reader::{
            OplogReader,
            ReaderHandle,
        },
        writer::OplogWriter,
    },
    oplog_window,
    snapshot::SnapshotEngine,
    timestamp::Timestamp,
};

pub const COMMAND_CHANNEL_CAPACITY: usize = 10;

#[derive(Debug, Clone)]
pub enum Command {
    PauseIncremental,
    ResumeIncremental,
    Snapshot { database: String, collection: String },
    Terminate,
}

/// The producer side of the control-command channel; cloned into the
/// admission surface so HTTP handlers can enqueue without touching the
/// supervisor directly.
#[derive(Clone)]
pub struct CommandSender(pub mpsc::Sender<Command>);

impl CommandSender {
    /// Non-blocking: `false` means the channel is full and the caller
    /// should answer with 429.
    pub fn try_send(&self, command: Command) -> bool {
        self.0.try_send(command).is_ok()
    }
}

pub struct Supervisor {
    config: Arc<Config>,
    source: Client,
    target: Client,
    metrics: Metrics,
    checkpoint: Arc<CheckpointManager>,
}

impl Supervisor {
    pub fn new(config: Arc<Config>, source: Client, target: Client, metrics: Metrics, checkpoint: Arc<CheckpointManager>) -> Self {
        Self { config, source, target, metrics, checkpoint }
    }

    pub fn filter(&self) -> NamespaceFilter {
        NamespaceFilter::new(
            self.config.repl.databases.clone(),
            self.config.repl.filters.r#in.clone(),
            self.config.repl.filters.out.clone(),
        )
    }

    /// Runs the whole pipeline until `token` is cancelled: performs the
    /// initial snapshot if no checkpoint exists, then starts the tailing
    /// reader/writer/autosaver and services `commands` until shutdown.
    pub async fn run(self, commands: mpsc::Receiver<Command>, token: CancellationToken) -> Result<()> {
        let mut commands = commands;
        let existing = self.checkpoint.get().await?;

        match existing {
            None => self.run_initial_snapshot().await?,
            Some(checkpoint) => {
                let window = oplog_window::probe(&self.source).await?;
                if checkpoint.latest_ts < window.oldest {
                    return Err(ReplError::OplogTruncated {
                        checkpoint: checkpoint.latest_lsn,
                        oldest: window.oldest.pack(),
                    });
                }
            },
        }

        let snapshot_cut = self.checkpoint.current().await.map(|c| c.latest_ts).unwrap_or(Timestamp::ZERO);
        let snapshot_engine = SnapshotEngine::new(
            self.source.clone(),
            self.target.clone(),
            self.metrics.clone(),
            self.config.repl.full.batch,
            self.config.repl.full.update_on_duplicate,
        );

        let (reader, reader_handle) = OplogReader::new(self.source.clone(), self.filter(), self.metrics.clone(), snapshot_engine);
        let writer = OplogWriter::new(self.target.clone(), self.checkpoint.clone(), self.metrics.clone(), snapshot_cut);

        let (cle_tx, cle_rx) = mpsc::channel(1000);

        let reader_task = tokio::spawn(reader.run(snapshot_cut, cle_tx, token.child_token()));
        let writer_task = tokio::spawn(writer.run(cle_rx));
        let autosaver_task = tokio::spawn(self.checkpoint.clone().run_autosaver(token.child_token()));

        self.dispatch_commands(&mut commands, reader_handle, &token).await;

        token.cancel();
        let _ = reader_task.await;
        let _ = writer_task.await;
        let _ = autosaver_task.await;
        Ok(())
    }

    async fn run_initial_snapshot(&self) -> Result<()> {
        info!("no checkpoint found, starting initial snapshot");
        let window_before = oplog_window::probe(&self.source).await?;

        let engine = SnapshotEngine::new(
            self.source.clone(),
            self.target.clone(),
            self.metrics.clone(),
            self.config.repl.full.batch,
            self.config.repl.full.update_on_duplicate,
        );
        for db in &self.config.repl.databases {
            for collection in self.list_collections(db).await? {
                engine.snapshot_collection(db, &collection, true).await?;
            }
        }

        // The snapshot cut must be captured before any snapshot began
        // (see invariant SN-1), which is exactly `window_before.newest`.
        self.checkpoint.set(window_before.newest, true).await;
        info!(cut = ?window_before.newest, "initial snapshot complete");
        Ok(())
    }

    async fn list_collections(&self, db: &str) -> Result<Vec<String>> {
        let filter = self.filter();
        let names = self.source.database(db).list_collection_names().await?;
        Ok(names.into_iter().filter(|name| filter.keep_collection(db, name)).collect())
    }

    async fn dispatch_commands(&self, commands: &mut mpsc::Receiver<Command>, reader: ReaderHandle, token: &CancellationToken) {
        loop {
            tokio::select! {
                command = commands.recv() => {
                    match command {
                        Some(Command::PauseIncremental) => reader.pause(),
                        Some(Command::ResumeIncremental) => reader.resume(),
                        Some(Command::Snapshot { database, collection }) => {
                            if !reader.request_snapshot(database.clone(), collection.clone()) {
                                warn!(database, collection, "snapshot request queue full, dropping");
                            }
                        },
                        Some(Command::Terminate) | None => break,
                    }
                },
                _ = token.cancelled() => break,
            }
        }
    }
}
