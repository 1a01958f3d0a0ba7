//! # Learned Key→Page Model
//!
//! The model maps a key to the physical page id of the overflow chain
//! head that should contain it. It has two parts:
//!
//! - a **linear layout model** fitted to the key hints at creation time,
//!   which predicts how many pages the hinted key set needs and which
//!   boundary key starts each page;
//! - an ordered **correction table** from boundary key to page id, seeded
//!   from the layout model at bootstrap and updated by reorganizations.
//!
//! After bootstrap the correction table is authoritative for every
//! lookup: `lookup(k)` returns the entry with the greatest boundary
//! `<= k`. Accuracy is still only advisory; a reader may act on a
//! mapping that a concurrent reorganization has just replaced, so every
//! consumer revalidates against the fixed page's boundaries and retries.
//!
//! Every mutation that changes the mapping increments a 64-bit version.
//! Writers snapshot the version when they route a batch and treat any
//! change observed under the chain-head lock as a signal to re-route.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

use crate::config::KeyHints;
use crate::encoding::encode_u64;
use crate::storage::PageId;

/// Linear segment fitted to the key hints: keys are assumed to start at
/// `min_key` and advance by `key_step`, with `records_per_page` records
/// filling each page.
#[derive(Debug, Clone, Copy)]
pub struct LinearLayout {
    min_key: u64,
    key_step: u64,
    records_per_page: u64,
    num_pages: u64,
}

impl LinearLayout {
    pub fn fit(hints: &KeyHints, page_size: usize) -> Self {
        Self {
            min_key: hints.min_key,
            key_step: hints.key_step.max(1),
            records_per_page: hints.records_per_page(page_size) as u64,
            num_pages: hints.num_pages(page_size) as u64,
        }
    }

    pub fn num_pages(&self) -> u64 {
        self.num_pages
    }

    /// Boundary key opening page `index`. Page 0 is left-unbounded so
    /// that keys below `min_key` still route somewhere.
    pub fn boundary(&self, index: u64) -> Vec<u8> {
        if index == 0 {
            return Vec::new();
        }
        let key = self
            .min_key
            .saturating_add(index.saturating_mul(self.records_per_page).saturating_mul(self.key_step));
        encode_u64(key).to_vec()
    }

    /// Predicted page index for an integer key; clamped to the layout.
    pub fn predict(&self, key: u64) -> u64 {
        let offset = key.saturating_sub(self.min_key) / self.key_step;
        (offset / self.records_per_page).min(self.num_pages - 1)
    }
}

/// The mutable key→page mapping. Mutations are in-memory and infallible;
/// the mapping is rebuilt from the page headers on reopen.
pub struct Model {
    table: RwLock<BTreeMap<Vec<u8>, PageId>>,
    version: AtomicU64,
}

impl Model {
    pub fn new() -> Self {
        Self {
            table: RwLock::new(BTreeMap::new()),
            version: AtomicU64::new(0),
        }
    }

    /// Page id of the chain head owning the interval containing `key`,
    /// or `None` when the model is empty (a database always has at least
    /// the left-unbounded entry after open).
    pub fn lookup(&self, key: &[u8]) -> Option<PageId> {
        let table = self.table.read();
        table
            .range::<[u8], _>((Bound::Unbounded, Bound::Included(key)))
            .next_back()
            .map(|(_, &page)| page)
    }

    /// Maps `[boundary, next-boundary)` to `page`. Bumps the version when
    /// the mapping actually changes.
    pub fn insert(&self, boundary: Vec<u8>, page: PageId) {
        let mut table = self.table.write();
        let previous = table.insert(boundary, page);
        if previous != Some(page) {
            self.version.fetch_add(1, Ordering::AcqRel);
        }
    }

    /// Monotonically increasing mutation counter. Readers snapshot it
    /// before routing and compare under the chain-head lock.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.table.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.read().is_empty()
    }
}

impl Default for Model {
    fn default() -> Self {
        Self::new()
    }
}
