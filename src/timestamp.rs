//! The replication position: a wall-clock-seconds/ordinal pair, ordered
//! lexicographically on `(t, i)` exactly like a MongoDB oplog timestamp.

use std::cmp::Ordering;

use bson::Timestamp as BsonTimestamp;
use serde::{
    Deserialize,
    Serialize,
};

/// An opaque, monotonically-comparable position in the source's oplog.
///
/// Packs to and from a single `i64` (`(t << 32) | i`) for storage in the
/// checkpoint document, matching the predecessor tool's `LatestLSN` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timestamp {
    pub t: u32,
    pub i: u32,
}

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp { t: 0, i: 0 };

    pub fn new(t: u32, i: u32) -> Self {
        Self { t, i }
    }

    pub fn is_zero(&self) -> bool {
        self.t == 0
    }

    pub fn pack(&self) -> i64 {
        ((self.t as i64) << 32) | (self.i as i64)
    }

    pub fn unpack(v: i64) -> Self {
        Self {
            t: ((v >> 32) & 0xFFFF_FFFF) as u32,
            i: (v & 0xFFFF_FFFF) as u32,
        }
    }
}

impl PartialOrd for Timestamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timestamp {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.t, self.i).cmp(&(other.t, other.i))
    }
}

impl From<BsonTimestamp> for Timestamp {
    fn from(ts: BsonTimestamp) -> Self {
        Self {
            t: ts.time,
            i: ts.increment,
        }
    }
}

impl From<Timestamp> for BsonTimestamp {
    fn from(ts: Timestamp) -> Self {
        BsonTimestamp {
            time: ts.t,
            increment: ts.i,
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn zero_is_minimum() {
        assert!(Timestamp::ZERO < Timestamp::new(1, 0));
        assert!(Timestamp::ZERO.is_zero());
    }

    #[test]
    fn orders_lexicographically() {
        assert!(Timestamp::new(1, 5) < Timestamp::new(1, 6));
        assert!(Timestamp::new(1, 9) < Timestamp::new(2, 0));
    }

    proptest! {
        #[test]
        fn pack_unpack_roundtrips(t in any::<u32>(), i in any::<u32>()) {
            let ts = Timestamp::new(t, i);
            prop_assert_eq!(Timestamp::unpack(ts.pack()), ts);
        }

        #[test]
        fn pack_preserves_order(t1 in any::<u32>(), i1 in any::<u32>(), t2 in any::<u32>(), i2 in any::<u32>()) {
            let a = Timestamp::new(t1, i1);
            let b = Timestamp::new(t2, i2);
            prop_assert_eq!(a.cmp(&b), a.pack().cmp(&b.pack()));
        }
    }
}
