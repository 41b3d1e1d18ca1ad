//! Versioned record abstraction underlying incremental synchronization.
//!
//! Every entity mirrored by a cache carries a modification timestamp and a
//! validity flag. The timestamp drives the per-cache watermark; the flag
//! tells the fold step whether the record is live or a tombstone that must
//! be evicted from every index that references it.

use chrono::{DateTime, Utc};

/// Lifecycle state of a mirrored record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lifecycle {
    /// The record is live and must be present in the indexes.
    Active,
    /// The record was soft-deleted upstream and must be evicted.
    Tombstoned,
}

impl Lifecycle {
    /// Map a store validity flag onto a lifecycle state.
    pub fn from_valid(valid: bool) -> Self {
        if valid {
            Lifecycle::Active
        } else {
            Lifecycle::Tombstoned
        }
    }

    /// Returns true for [`Lifecycle::Active`].
    pub fn is_active(&self) -> bool {
        matches!(self, Lifecycle::Active)
    }
}

/// A record delivered by the store's delta feed.
pub trait VersionedRecord {
    /// Primary identifier of the record.
    fn id(&self) -> &str;

    /// Last modification time recorded by the store.
    fn modify_time(&self) -> DateTime<Utc>;

    /// Store validity flag; `false` marks a tombstone.
    fn is_valid(&self) -> bool;

    /// Lifecycle state derived from the validity flag.
    fn lifecycle(&self) -> Lifecycle {
        Lifecycle::from_valid(self.is_valid())
    }
}

/// Highest modify time among `records`, if any.
pub fn max_modify_time<'a, R, I>(records: I) -> Option<DateTime<Utc>>
where
    R: VersionedRecord + 'a,
    I: IntoIterator<Item = &'a R>,
{
    records.into_iter().map(|r| r.modify_time()).max()
}

/// The zero watermark: every record is newer than this.
pub fn epoch() -> DateTime<Utc> {
    DateTime::<Utc>::UNIX_EPOCH
}
