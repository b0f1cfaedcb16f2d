//! Durable replication position. Grounded on
//! `examples/original_source/internal/pkg/checkpoint/ckpt_manager.go`: an
//! in-memory monotonic advance, decoupled from a periodic durable save.

use std::sync::Arc;

use bson::doc;
use chrono::{
    DateTime,
    TimeZone,
    Utc,
};
use mongodb::{
    options::UpdateOptions,
    Collection,
};
use serde::{
    Deserialize,
    Serialize,
};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{
    error,
    info,
    warn,
};

use crate::{
    error::Result,
    metrics::Metrics,
    timestamp::Timestamp,
};

pub const AUTOSAVE_INTERVAL: std::time::Duration = std::time::Duration::from_secs(10);

/// The persisted replication position for one `repl.id`. Field names match
/// the predecessor tool's checkpoint document exactly (`savedAt`,
/// `latestTs`, `latestLSN`) so an operator migrating from it can resume
/// without a data migration step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub name: String,
    #[serde(rename = "savedAt")]
    pub saved_at: DateTime<Utc>,
    pub latest: DateTime<Utc>,
    #[serde(rename = "latestTs", with = "bson_timestamp_as_ts")]
    pub latest_ts: Timestamp,
    #[serde(rename = "latestLSN")]
    pub latest_lsn: i64,
}

impl Checkpoint {
    fn new(name: String, ts: Timestamp) -> Self {
        let latest = Utc
            .timestamp_opt(ts.t as i64, 0)
            .single()
            .unwrap_or_else(Utc::now);
        Self {
            name,
            saved_at: Utc::now(),
            latest,
            latest_ts: ts,
            latest_lsn: ts.pack(),
        }
    }
}

mod bson_timestamp_as_ts {
    use bson::Timestamp as BsonTimestamp;
    use serde::{
        Deserialize,
        Deserializer,
        Serialize,
        Serializer,
    };

    use crate::timestamp::Timestamp;

    pub fn serialize<S: Serializer>(ts: &Timestamp, s: S) -> std::result::Result<S::Ok, S::Error> {
        BsonTimestamp::from(*ts).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Timestamp, D::Error> {
        Ok(BsonTimestamp::deserialize(d)?.into())
    }
}

pub struct CheckpointManager {
    collection: Collection<Checkpoint>,
    name: String,
    current: Mutex<Option<Checkpoint>>,
    metrics: Metrics,
}

impl CheckpointManager {
    pub fn new(collection: Collection<Checkpoint>, name: String, metrics: Metrics) -> Self {
        Self { collection, name, current: Mutex::new(None), metrics }
    }

    /// Loads the most recently saved checkpoint, if any, and caches it as
    /// the in-memory position.
    pub async fn get(&self) -> Result<Option<Checkpoint>> {
        let found = self.collection.find_one(doc! { "name": &self.name }).await?;
        if let Some(ref checkpoint) = found {
            *self.current.lock().await = Some(checkpoint.clone());
        }
        Ok(found)
    }

    /// Returns the cached in-memory checkpoint without hitting the target.
    pub async fn current(&self) -> Option<Checkpoint> {
        self.current.lock().await.clone()
    }

    /// Advances the in-memory position iff `ts` is non-zero and not behind
    /// the current one. A regression is logged and silently dropped rather
    /// than propagated, since it can only originate from a bug upstream and
    /// must never corrupt the durable position.
    pub async fn advance_in_memory(&self, ts: Timestamp) {
        if ts.is_zero() {
            warn!("ignoring attempt to advance checkpoint to the zero timestamp");
            self.metrics.checkpoint_regression_total.inc();
            return;
        }
        let mut guard = self.current.lock().await;
        if let Some(current) = guard.as_ref() {
            if ts < current.latest_ts {
                warn!(?ts, current = ?current.latest_ts, "ignoring checkpoint regression");
                self.metrics.checkpoint_regression_total.inc();
                return;
            }
        }
        *guard = Some(Checkpoint::new(self.name.clone(), ts));
    }

    /// Persists the in-memory checkpoint. A failure is logged, not
    /// propagated: the next autosave tick or explicit save will retry.
    pub async fn save(&self) {
        let snapshot = self.current.lock().await.clone();
        let Some(checkpoint) = snapshot else { return };
        let opts = UpdateOptions::builder().upsert(true).build();
        let update = doc! {
            "$set": {
                "savedAt": bson::DateTime::from_chrono(Utc::now()),
                "latest": bson::DateTime::from_chrono(checkpoint.latest),
                "latestTs": bson::Timestamp::from(checkpoint.latest_ts),
                "latestLSN": checkpoint.latest_lsn,
            }
        };
        if let Err(e) = self
            .collection
            .update_one(doc! { "name": &self.name }, update)
            .with_options(opts)
            .await
        {
            error!(error = %e, "failed to save checkpoint");
        }
    }

    /// Advances the in-memory position and, if `persist`, saves
    /// immediately (used for the forced snapshot-cut save).
    pub async fn set(&self, ts: Timestamp, persist: bool) {
        self.advance_in_memory(ts).await;
        if persist {
            self.save().await;
        }
    }

    /// Runs until `token` is cancelled, saving every [`AUTOSAVE_INTERVAL`]
    /// and once more right before returning.
    pub async fn run_autosaver(self: Arc<Self>, token: CancellationToken) {
        info!("starting checkpoint autosaver");
        let mut ticker = tokio::time::interval(AUTOSAVE_INTERVAL);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.save().await,
                _ = token.cancelled() => {
                    self.save().await;
                    break;
                }
            }
        }
        info!("stopped checkpoint autosaver");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkpoint_lsn_matches_packed_timestamp() {
        let ts = Timestamp::new(100, 3);
        let checkpoint = Checkpoint::new("id".to_string(), ts);
        assert_eq!(checkpoint.latest_lsn, ts.pack());
    }

    #[tokio::test]
    async fn advance_in_memory_rejects_zero_timestamp() {
        let collection = fake_collection().await;
        let manager = CheckpointManager::new(collection, "id".to_string(), Metrics::new().unwrap());
        manager.advance_in_memory(Timestamp::new(5, 0)).await;
        manager.advance_in_memory(Timestamp::ZERO).await;
        assert_eq!(manager.current().await.unwrap().latest_ts, Timestamp::new(5, 0));
        assert_eq!(manager.metrics.checkpoint_regression_total.get(), 1);
    }

    #[tokio::test]
    async fn advance_in_memory_rejects_regression() {
        let collection = fake_collection().await;
        let manager = CheckpointManager::new(collection, "id".to_string(), Metrics::new().unwrap());
        manager.advance_in_memory(Timestamp::new(10, 0)).await;
        manager.advance_in_memory(Timestamp::new(5, 0)).await;
        assert_eq!(manager.current().await.unwrap().latest_ts, Timestamp::new(10, 0));
        assert_eq!(manager.metrics.checkpoint_regression_total.get(), 1);
    }

    async fn fake_collection() -> Collection<Checkpoint> {
        // Constructing a real `mongodb::Collection` requires a `Client`,
        // which in turn requires establishing (or at least parsing) a
        // connection. We only exercise the in-memory logic above, so a
        // collection handle from an unconnected client is sufficient: no
        // test here performs I/O against it.
        let client = mongodb::Client::with_uri_str("mongodb://localhost:27017")
            .await
            .expect("client construction does not connect eagerly");
        client.database("test").collection("checkpoints")
    }
}
