//! Structured logging bootstrap, replacing the predecessor tool's bespoke
//! global `log` package with `tracing` + a JSON-formatted `EnvFilter`
//! subscriber, in the shape the rest of the example pack initializes
//! logging in.

use tracing_subscriber::{
    fmt,
    EnvFilter,
};

pub fn init(level: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::try_new(level).or_else(|_| EnvFilter::try_new("info"))?;
    fmt().json().with_env_filter(filter).with_target(true).try_init().map_err(|e| anyhow::anyhow!(e))?;
    Ok(())
}
