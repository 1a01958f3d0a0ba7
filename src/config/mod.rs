//! # Engine Configuration
//!
//! This module centralizes the option surface and the engine constants.
//! Constants that depend on each other are co-located and their
//! relationships documented, so that interdependent values cannot drift
//! apart silently.

mod constants;

pub use constants::*;

use eyre::{ensure, Result};

/// Hints about the key distribution, used to lay out the initial pages.
///
/// A fresh database is bootstrapped by fitting a linear model to these
/// hints: `num_keys` keys starting at `min_key` spaced `key_step` apart,
/// each record occupying `record_size` bytes, pages filled to
/// `page_fill_pct` percent. The engine keeps working correctly when the
/// hints turn out to be wrong; they only affect the initial layout and
/// the records-per-page target used by deferral and reorganization.
#[derive(Debug, Clone, Copy)]
pub struct KeyHints {
    /// Expected number of distinct keys.
    pub num_keys: usize,
    /// Expected size of one record (key + value), in bytes.
    pub record_size: usize,
    /// Target page fill, in percent (1..=100).
    pub page_fill_pct: usize,
    /// Smallest expected key, interpreted as a 64-bit integer.
    pub min_key: u64,
    /// Spacing between consecutive expected keys.
    pub key_step: u64,
}

impl Default for KeyHints {
    fn default() -> Self {
        Self {
            num_keys: 10_000,
            record_size: 16,
            page_fill_pct: 50,
            min_key: 0,
            key_step: 1,
        }
    }
}

impl KeyHints {
    /// Number of records that fit a page at the hinted record size and
    /// fill target. Never less than 1.
    pub fn records_per_page(&self, page_size: usize) -> usize {
        let usable = page_size * self.page_fill_pct / 100;
        (usable / self.record_size.max(1)).max(1)
    }

    /// Number of pages the hinted key set needs at the hinted fill.
    pub fn num_pages(&self, page_size: usize) -> usize {
        self.num_keys.div_ceil(self.records_per_page(page_size)).max(1)
    }
}

/// Options controlling an open database instance.
///
/// `page_size` and `pages_per_segment` are fixed when the database is
/// created; reopening reads them back from the manifest and ignores the
/// values passed here.
#[derive(Debug, Clone)]
pub struct Options {
    /// Create the database directory and files if they do not exist.
    pub create_if_missing: bool,
    /// Fail `open` if the database already exists.
    pub error_if_exists: bool,
    /// Key-distribution hints used for the initial page layout.
    pub key_hints: KeyHints,
    /// Total buffer pool size in bytes. Rounded down to whole frames,
    /// minimum one frame.
    pub buffer_pool_size: usize,
    /// Write buffer budget in MiB; exceeding it schedules a flush.
    pub memtable_size_mib: usize,
    /// A flush batch smaller than this may be deferred instead of
    /// written (see `deferred_io_max_deferrals`).
    pub deferred_io_min_entries: usize,
    /// Maximum number of consecutive flushes that may defer the same
    /// chain before it is written regardless.
    pub deferred_io_max_deferrals: usize,
    /// Skip the fsync at the end of a flush cycle. Without an external
    /// write-ahead log, leaving this `false` makes a completed flush the
    /// durability point.
    pub bypass_wal: bool,
    /// Open segment files with O_DIRECT.
    pub use_direct_io: bool,
    /// Accepted for API compatibility; CPU affinity is left to the
    /// embedding application.
    pub pin_threads: bool,
    /// Number of background worker threads (flush, reorganization).
    pub bg_threads: usize,
    /// Page size in bytes. Must be a power of two, at least 4 KiB.
    pub page_size: usize,
    /// Pages per segment file.
    pub pages_per_segment: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            create_if_missing: true,
            error_if_exists: false,
            key_hints: KeyHints::default(),
            buffer_pool_size: DEFAULT_BUFFER_POOL_SIZE,
            memtable_size_mib: DEFAULT_MEMTABLE_SIZE_MIB,
            deferred_io_min_entries: 1,
            deferred_io_max_deferrals: 0,
            bypass_wal: false,
            use_direct_io: false,
            pin_threads: false,
            bg_threads: DEFAULT_BG_THREADS,
            page_size: DEFAULT_PAGE_SIZE,
            pages_per_segment: DEFAULT_PAGES_PER_SEGMENT,
        }
    }
}

impl Options {
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.page_size.is_power_of_two() && self.page_size >= MIN_PAGE_SIZE,
            "page_size {} must be a power of two and at least {}",
            self.page_size,
            MIN_PAGE_SIZE
        );
        ensure!(
            self.pages_per_segment >= 1,
            "pages_per_segment must be at least 1"
        );
        ensure!(
            self.key_hints.page_fill_pct >= 1 && self.key_hints.page_fill_pct <= 100,
            "page_fill_pct {} must be within 1..=100",
            self.key_hints.page_fill_pct
        );
        ensure!(self.key_hints.record_size >= 1, "record_size must be at least 1");
        ensure!(self.bg_threads >= 1, "bg_threads must be at least 1");
        Ok(())
    }

    /// Number of buffer pool frames implied by `buffer_pool_size`.
    pub fn frame_count(&self) -> usize {
        (self.buffer_pool_size / self.page_size).max(1)
    }

    /// Write buffer budget in bytes.
    pub fn memtable_budget(&self) -> usize {
        self.memtable_size_mib * 1024 * 1024
    }
}
