//! Reports the oldest/newest timestamps currently retained in the source's
//! capped oplog. Grounded on
//! `examples/original_source/internal/pkg/checkpoint/ckpt_manager.go`'s
//! `GetReplicasetOplogWindow`.

use bson::doc;
use futures::TryStreamExt as _;
use mongodb::{
    options::FindOptions,
    Client,
};

use crate::{
    error::{
        ReplError,
        Result,
    },
    timestamp::Timestamp,
};

pub const OPLOG_DATABASE: &str = "local";
pub const OPLOG_COLLECTION: &str = "oplog.rs";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OplogWindow {
    pub oldest: Timestamp,
    pub newest: Timestamp,
}

/// Scans the oplog's natural order for its first and last entry. An empty
/// oplog is fatal: there is nothing to resume from and no safe snapshot cut
/// can be computed.
pub async fn probe(client: &Client) -> Result<OplogWindow> {
    let oplog = client
        .database(OPLOG_DATABASE)
        .collection::<bson::Document>(OPLOG_COLLECTION);

    let oldest = oplog
        .find(doc! {})
        .with_options(FindOptions::builder().sort(doc! { "$natural": 1 }).limit(1).build())
        .await?
        .try_next()
        .await?;
    let newest = oplog
        .find(doc! {})
        .with_options(FindOptions::builder().sort(doc! { "$natural": -1 }).limit(1).build())
        .await?
        .try_next()
        .await?;

    let (Some(oldest), Some(newest)) = (oldest, newest) else {
        return Err(ReplError::EmptyOplogWindow);
    };

    let oldest_ts = oldest.get_timestamp("ts").map_err(|_| ReplError::EmptyOplogWindow)?.into();
    let newest_ts = newest.get_timestamp("ts").map_err(|_| ReplError::EmptyOplogWindow)?.into();

    Ok(OplogWindow { oldest: oldest_ts, newest: newest_ts })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_ordering_invariant() {
        let window = OplogWindow { oldest: Timestamp::new(1, 0), newest: Timestamp::new(2, 0) };
        assert!(window.oldest <= window.newest);
    }
}
