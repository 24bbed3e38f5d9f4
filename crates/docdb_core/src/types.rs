//! Core type definitions for docdb.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl $name {
            /// Creates a new identifier.
            #[must_use]
            pub const fn new(id: u64) -> Self {
                Self(id)
            }

            /// Returns the raw value.
            #[must_use]
            pub const fn as_u64(self) -> u64 {
                self.0
            }

            /// Returns true for the zero value, which never names an object.
            #[must_use]
            pub const fn is_none(self) -> bool {
                self.0 == 0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, ":{}"), self.0)
            }
        }
    };
}

id_type!(
    /// Globally monotonic sequence number assigned to every marker.
    Tick,
    "tick"
);

id_type!(
    /// Identifier of a database.
    DatabaseId,
    "db"
);

id_type!(
    /// Identifier of a collection. Views share this id space.
    CollectionId,
    "col"
);

id_type!(
    /// Identifier of a transaction.
    ///
    /// Transaction IDs are monotonically increasing and never reused.
    TransactionId,
    "txn"
);

id_type!(
    /// Identifier of a WAL logfile, also its position in collection order.
    LogfileId,
    "logfile"
);

id_type!(
    /// Identifier of a collection datafile or journal.
    DatafileId,
    "df"
);

id_type!(
    /// Identifier of a secondary index.
    IndexId,
    "idx"
);

id_type!(
    /// Revision of a document; also the collection's revision pointer.
    Revision,
    "rev"
);

/// Shared monotonic counter.
///
/// One generator hands out marker ticks and every object id, so ids and
/// ticks never collide and always grow. Recovery raises the counter past
/// everything found on disk with [`TickGenerator::observe`].
#[derive(Debug, Default)]
pub struct TickGenerator {
    current: AtomicU64,
}

impl TickGenerator {
    /// Creates a generator whose first value is `start + 1`.
    #[must_use]
    pub fn new(start: u64) -> Self {
        Self {
            current: AtomicU64::new(start),
        }
    }

    /// Returns the next value.
    pub fn next(&self) -> u64 {
        self.current.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Returns the last value handed out.
    #[must_use]
    pub fn current(&self) -> u64 {
        self.current.load(Ordering::SeqCst)
    }

    /// Makes sure future values are greater than `value`.
    pub fn observe(&self, value: u64) {
        self.current.fetch_max(value, Ordering::SeqCst);
    }

    /// Returns the next value as a tick.
    pub fn next_tick(&self) -> Tick {
        Tick(self.next())
    }
}
