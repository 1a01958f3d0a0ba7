//! # Write Buffer
//!
//! An ordered in-memory table of recent writes and deletes. Deletes are
//! stored explicitly: the key may still exist on disk, and the flush
//! needs to know it must be removed there.
//!
//! Entries are keyed by `(user key ascending, sequence descending)` with
//! the entry kind packed into the low byte of the sequence tag, so a
//! full iteration visits keys in ascending order and, for a key with
//! several versions, yields the newest first; callers skip the rest.
//! Sequences are 56-bit and drawn from a counter shared by the active
//! and immutable buffer, so requeued entries keep their place in the
//! version order.
//!
//! The skip list tolerates concurrent readers without coordination;
//! mutation requires external mutual exclusion (the database's write
//! mutex), matching how the engine drives it.

use std::ops::Bound;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_skiplist::map::{Entry, Iter as MapIter, Range as MapRange};
use crossbeam_skiplist::SkipMap;
use eyre::{ensure, Result};

use crate::config::{MAX_SEQUENCE, MEMTABLE_ENTRY_OVERHEAD};

/// Distinguishes buffered writes from buffered deletes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Write = 0,
    Delete = 1,
}

#[inline]
fn pack_tag(sequence: u64, kind: EntryKind) -> u64 {
    (sequence << 8) | kind as u64
}

#[inline]
fn tag_sequence(tag: u64) -> u64 {
    tag >> 8
}

#[inline]
fn tag_kind(tag: u64) -> EntryKind {
    if tag & 0xff == 0 {
        EntryKind::Write
    } else {
        EntryKind::Delete
    }
}

/// Internal ordering key: user key ascending, sequence descending.
#[derive(Debug, Clone, PartialEq, Eq)]
struct TableKey {
    user: Vec<u8>,
    tag: u64,
}

impl Ord for TableKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.user
            .cmp(&other.user)
            .then_with(|| other.tag.cmp(&self.tag))
    }
}

impl PartialOrd for TableKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

type TableBounds = (Bound<TableKey>, Bound<TableKey>);
type TableRange<'a> = MapRange<'a, TableKey, TableBounds, TableKey, Vec<u8>>;

pub struct MemTable {
    table: SkipMap<TableKey, Vec<u8>>,
    mem_usage: AtomicUsize,
    sequence: Arc<AtomicU64>,
    has_entries: AtomicBool,
}

impl MemTable {
    /// `sequence` is shared with the sibling buffer so versions stay
    /// comparable across the active/immutable rotation.
    pub fn new(sequence: Arc<AtomicU64>) -> Self {
        Self {
            table: SkipMap::new(),
            mem_usage: AtomicUsize::new(0),
            sequence,
            has_entries: AtomicBool::new(false),
        }
    }

    /// Records a write or delete under the next sequence number. For
    /// deletes the value is ignored by readers and stored empty.
    pub fn add(&self, key: &[u8], value: &[u8], kind: EntryKind) -> Result<u64> {
        let sequence = self.sequence.fetch_add(1, Ordering::AcqRel) + 1;
        ensure!(sequence <= MAX_SEQUENCE, "sequence space exhausted");
        self.insert(key, value, kind, sequence);
        Ok(sequence)
    }

    /// Re-inserts a deferred entry under its original sequence so newer
    /// writes of the same key keep winning.
    pub fn add_with_sequence(&self, key: &[u8], value: &[u8], kind: EntryKind, sequence: u64) {
        self.insert(key, value, kind, sequence);
    }

    fn insert(&self, key: &[u8], value: &[u8], kind: EntryKind, sequence: u64) {
        self.table.insert(
            TableKey {
                user: key.to_vec(),
                tag: pack_tag(sequence, kind),
            },
            value.to_vec(),
        );
        self.mem_usage.fetch_add(
            key.len() + value.len() + MEMTABLE_ENTRY_OVERHEAD,
            Ordering::Relaxed,
        );
        self.has_entries.store(true, Ordering::Release);
    }

    /// Newest entry for `key`: the kind and, for writes, the value.
    pub fn get(&self, key: &[u8]) -> Option<(EntryKind, Vec<u8>)> {
        let newest = TableKey {
            user: key.to_vec(),
            tag: u64::MAX,
        };
        let oldest = TableKey {
            user: key.to_vec(),
            tag: 0,
        };
        self.table
            .range(newest..=oldest)
            .next()
            .map(|entry| (tag_kind(entry.key().tag), entry.value().clone()))
    }

    /// Estimated bytes held by this table, including index overhead.
    pub fn approximate_memory_usage(&self) -> usize {
        self.mem_usage.load(Ordering::Relaxed)
    }

    /// True iff at least one entry was added.
    pub fn has_entries(&self) -> bool {
        self.has_entries.load(Ordering::Acquire)
    }

    /// Iterator over all entries, positioned at the first one.
    pub fn iter(&self) -> MemTableIter<'_> {
        let mut inner = self.table.iter();
        let current = inner.next();
        MemTableIter { inner, current }
    }

    /// Iterator over entries with `lower <= key` and, when `upper` is
    /// given, `key < upper`; positioned at the first one.
    pub fn range(&self, lower: &[u8], upper: Option<&[u8]>) -> MemTableRangeIter<'_> {
        let start = Bound::Included(TableKey {
            user: lower.to_vec(),
            tag: u64::MAX,
        });
        let end = match upper {
            Some(upper) => Bound::Excluded(TableKey {
                user: upper.to_vec(),
                tag: u64::MAX,
            }),
            None => Bound::Unbounded,
        };
        let mut inner = self.table.range((start, end));
        let current = inner.next();
        MemTableRangeIter { inner, current }
    }
}

macro_rules! memtable_iter_accessors {
    () => {
        /// True iff the iterator points at an entry.
        pub fn valid(&self) -> bool {
            self.current.is_some()
        }

        /// Key at the current position. Requires `valid()`.
        pub fn key(&self) -> &[u8] {
            &self.current.as_ref().expect("iterator exhausted").key().user
        }

        /// Value at the current position. Requires `valid()`.
        pub fn value(&self) -> &[u8] {
            self.current.as_ref().expect("iterator exhausted").value()
        }

        /// Entry kind at the current position. Requires `valid()`.
        pub fn kind(&self) -> EntryKind {
            tag_kind(self.current.as_ref().expect("iterator exhausted").key().tag)
        }

        /// Sequence number at the current position. Requires `valid()`.
        pub fn sequence(&self) -> u64 {
            tag_sequence(self.current.as_ref().expect("iterator exhausted").key().tag)
        }

        /// Advances to the next entry.
        pub fn advance(&mut self) {
            self.current = self.inner.next();
        }
    };
}

/// Full-table iterator; ascending keys, newest version first per key.
pub struct MemTableIter<'a> {
    inner: MapIter<'a, TableKey, Vec<u8>>,
    current: Option<Entry<'a, TableKey, Vec<u8>>>,
}

impl MemTableIter<'_> {
    memtable_iter_accessors!();
}

/// Bounded iterator with the same semantics as [`MemTableIter`].
pub struct MemTableRangeIter<'a> {
    inner: TableRange<'a>,
    current: Option<Entry<'a, TableKey, Vec<u8>>>,
}

impl MemTableRangeIter<'_> {
    memtable_iter_accessors!();
}
