mod checkpoint;
mod config;
mod error;
mod filter;
mod http;
mod logging;
mod metrics;
mod oplog;
mod oplog_window;
mod snapshot;
mod supervisor;
mod timestamp;

use std::sync::Arc;

use clap::Parser;
use mongodb::Client;
use tokio::{
    net::TcpListener,
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;
use tracing::{
    error,
    info,
};

use crate::{
    checkpoint::CheckpointManager,
    config::{
        Args,
        Config,
    },
    metrics::Metrics,
    supervisor::{
        CommandSender,
        Supervisor,
        COMMAND_CHANNEL_CAPACITY,
    },
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = Arc::new(Config::load(&args)?);

    logging::init(&config.logging.level)?;
    info!(
        source = %config.redacted_source(),
        target = %config.redacted_target(),
        "starting mongo-replicator"
    );

    let metrics = Metrics::new()?;

    let source = Client::with_uri_str(&config.repl.source).await?;
    let target = Client::with_uri_str(&config.repl.target).await?;

    let checkpoint_collection = target
        .database(&config.repl.incr.state.db)
        .collection(&config.repl.incr.state.collection);
    let checkpoint = Arc::new(CheckpointManager::new(checkpoint_collection, config.repl.id.clone(), metrics.clone()));

    let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
    let token = CancellationToken::new();

    let app_state = http::AppState {
        source: source.clone(),
        target: target.clone(),
        metrics: metrics.clone(),
        commands: CommandSender(command_tx),
    };
    let router = http::router(app_state);
    let listener = TcpListener::bind(("0.0.0.0", 8080)).await?;
    let server_token = token.clone();
    let server = tokio::spawn(async move {
        let shutdown = async move { server_token.cancelled().await };
        if let Err(e) = axum::serve(listener, router).with_graceful_shutdown(shutdown).await {
            error!(error = %e, "admission surface exited with an error");
        }
    });

    let supervisor = Supervisor::new(config, source, target, metrics, checkpoint);

    let shutdown_token = token.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("received shutdown signal");
        shutdown_token.cancel();
    });

    let result = supervisor.run(command_rx, token.clone()).await;

    token.cancel();
    let _ = server.await;
    result?;
    Ok(())
}
