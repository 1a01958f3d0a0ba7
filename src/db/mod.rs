//! # Database Façade
//!
//! [`Database`] owns the lifecycle of every engine component and threads
//! the read, write, range and flush paths through them.
//!
//! ## Write path
//!
//! `put`/`delete` append to the active write buffer under the write
//! mutex and return; crossing the buffer budget schedules an
//! asynchronous flush. The flush coordinator (`flush`) merges the
//! frozen buffer into the page layer, spilling into overflow chains and
//! scheduling background reorganizations (`reorg`) when chains grow.
//!
//! ## Read path
//!
//! `get` consults the active buffer, then the frozen buffer, then the
//! learned model. The chain fix revalidates the mapping under the
//! head's shared lock and the whole lookup retries when a concurrent
//! reorganization moved the interval.
//!
//! ## Open and close
//!
//! A fresh database fits a linear layout to the key hints, preallocates
//! and initializes the predicted pages, and seeds the model with one
//! boundary per page. Reopening reads the geometry from the manifest
//! and rebuilds the model by scanning the self-describing pages: every
//! non-overflow page is a chain head. Dropping the database drains the
//! background workers, force-flushes the write buffer, writes dirty
//! frames back and persists the manifest.

mod chain;
mod flush;
mod merge;
mod reorg;
mod workers;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use eyre::{bail, ensure, Result, WrapErr};
use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::config::{Options, MAX_KEY_SIZE};
use crate::memtable::{EntryKind, MemTable};
use crate::model::{LinearLayout, Model};
use crate::storage::page;
use crate::storage::{
    AlignedPageBuf, BufferPool, FileManager, FileManagerConfig, Manifest, PageId,
};

use workers::WorkerPool;

struct MemTables {
    active: Arc<MemTable>,
    immutable: Option<Arc<MemTable>>,
}

pub(crate) struct DbShared {
    pub(crate) options: Options,
    path: PathBuf,
    pub(crate) files: Arc<FileManager>,
    pub(crate) pool: BufferPool,
    pub(crate) model: Model,
    tables: RwLock<MemTables>,
    /// Serializes all mutation of the write buffer (§ lock order: taken
    /// before any model or frame lock, never while holding one).
    write_mutex: Mutex<()>,
    /// Serializes flush cycles; at most one frozen buffer exists.
    flush_serial: Mutex<()>,
    sequence: Arc<AtomicU64>,
    /// Deferral counters keyed by chain lower boundary, which is stable
    /// across reorganizations.
    pub(crate) deferrals: Mutex<HashMap<Vec<u8>, usize>>,
    flush_scheduled: AtomicBool,
    pub(crate) workers: WorkerPool,
}

impl DbShared {
    pub(crate) fn store_manifest(&self) -> Result<()> {
        Manifest {
            page_size: self.options.page_size,
            pages_per_segment: self.options.pages_per_segment,
            segment_count: self.files.segment_count(),
            next_page_id: self.files.next_page_id(),
        }
        .store(&self.path)
    }
}

/// An embedded, ordered, persistent key-value store that maps keys to
/// disk pages through a learned model of the key distribution.
pub struct Database {
    shared: Arc<DbShared>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").finish_non_exhaustive()
    }
}

impl Database {
    /// Opens the database at `path`, creating it according to
    /// `options.create_if_missing` / `options.error_if_exists`.
    pub fn open(options: Options, path: impl AsRef<Path>) -> Result<Database> {
        options.validate()?;
        let path = path.as_ref();
        let exists = Manifest::exists(path);
        if exists && options.error_if_exists {
            bail!(
                "database already exists at {} and error_if_exists is set",
                path.display()
            );
        }
        if !exists && !options.create_if_missing {
            bail!(
                "no database at {} and create_if_missing is disabled",
                path.display()
            );
        }

        let shared = if exists {
            Self::open_existing(options, path)?
        } else {
            Self::create(options, path)?
        };
        Ok(Database { shared })
    }

    fn create(options: Options, path: &Path) -> Result<Arc<DbShared>> {
        std::fs::create_dir_all(path)
            .wrap_err_with(|| format!("failed to create database directory {}", path.display()))?;

        let layout = LinearLayout::fit(&options.key_hints, options.page_size);
        let files = Arc::new(FileManager::create(
            path,
            FileManagerConfig {
                page_size: options.page_size,
                pages_per_segment: options.pages_per_segment,
                use_direct_io: options.use_direct_io,
            },
            layout.num_pages(),
        )?);
        let pool = BufferPool::new(options.frame_count(), Arc::clone(&files));
        let model = Model::new();

        // Bootstrap: one blank page per predicted boundary interval.
        let num_pages = layout.num_pages();
        for index in 0..num_pages {
            let id = files.allocate_page()?;
            let lower = layout.boundary(index);
            let upper = (index + 1 < num_pages).then(|| layout.boundary(index + 1));
            let mut frame = pool.fix(id, true, true)?;
            page::init(frame.data_mut(), &lower, upper.as_deref(), false)?;
            frame.unfix(true);
            model.insert(lower, id);
        }
        pool.write_dirty()?;
        debug!(pages = num_pages, path = %path.display(), "created database");

        let sequence = Arc::new(AtomicU64::new(0));
        let shared = Arc::new(DbShared {
            workers: WorkerPool::new(options.bg_threads),
            path: path.to_path_buf(),
            files,
            pool,
            model,
            tables: RwLock::new(MemTables {
                active: Arc::new(MemTable::new(Arc::clone(&sequence))),
                immutable: None,
            }),
            write_mutex: Mutex::new(()),
            flush_serial: Mutex::new(()),
            sequence,
            deferrals: Mutex::new(HashMap::new()),
            flush_scheduled: AtomicBool::new(false),
            options,
        });
        shared.store_manifest()?;
        if !shared.options.bypass_wal {
            shared.files.sync()?;
        }
        Ok(shared)
    }

    fn open_existing(mut options: Options, path: &Path) -> Result<Arc<DbShared>> {
        let manifest = Manifest::load(path)?;
        // Geometry is fixed at creation; the manifest wins.
        options.page_size = manifest.page_size;
        options.pages_per_segment = manifest.pages_per_segment;

        let files = Arc::new(FileManager::open(
            path,
            FileManagerConfig {
                page_size: manifest.page_size,
                pages_per_segment: manifest.pages_per_segment,
                use_direct_io: options.use_direct_io,
            },
            manifest.next_page_id,
        )?);
        let pool = BufferPool::new(options.frame_count(), Arc::clone(&files));
        let model = Model::new();

        // Pages are self-describing: every non-overflow page below the
        // allocation watermark is the head of a chain.
        let mut buf = AlignedPageBuf::new_zeroed(manifest.page_size);
        let mut heads = 0usize;
        for raw in 0..manifest.next_page_id {
            let id = PageId(raw);
            files.read_page(id, buf.as_mut_slice())?;
            if buf.as_slice().iter().all(|&b| b == 0) {
                // Allocated but never published; skip.
                continue;
            }
            page::validate(buf.as_slice())
                .wrap_err_with(|| format!("corrupt page {id} while rebuilding the model"))?;
            let page = page::Page::from_bytes(buf.as_slice())?;
            if !page.is_overflow_page() {
                model.insert(page.lower().to_vec(), id);
                heads += 1;
            }
        }
        ensure!(
            !model.is_empty(),
            "database at {} contains no chain heads",
            path.display()
        );
        debug!(heads, path = %path.display(), "reopened database");

        let sequence = Arc::new(AtomicU64::new(0));
        let shared = Arc::new(DbShared {
            workers: WorkerPool::new(options.bg_threads),
            path: path.to_path_buf(),
            files,
            pool,
            model,
            tables: RwLock::new(MemTables {
                active: Arc::new(MemTable::new(Arc::clone(&sequence))),
                immutable: None,
            }),
            write_mutex: Mutex::new(()),
            flush_serial: Mutex::new(()),
            sequence,
            deferrals: Mutex::new(HashMap::new()),
            flush_scheduled: AtomicBool::new(false),
            options,
        });
        Ok(shared)
    }

    /// Records a write of `key` with `value`.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.write_entry(key, value, EntryKind::Write)
    }

    /// Records a delete of `key`. The key may still live on disk; the
    /// flush removes it there.
    pub fn delete(&self, key: &[u8]) -> Result<()> {
        self.write_entry(key, b"", EntryKind::Delete)
    }

    fn write_entry(&self, key: &[u8], value: &[u8], kind: EntryKind) -> Result<()> {
        page::check_record_size(self.shared.options.page_size, key, value)?;
        {
            let _write = self.shared.write_mutex.lock();
            let tables = self.shared.tables.read();
            tables.active.add(key, value, kind)?;
        }
        self.maybe_schedule_flush();
        Ok(())
    }

    fn maybe_schedule_flush(&self) {
        let usage = self
            .shared
            .tables
            .read()
            .active
            .approximate_memory_usage();
        if usage <= self.shared.options.memtable_budget() {
            return;
        }
        if self.shared.flush_scheduled.swap(true, Ordering::AcqRel) {
            return;
        }
        let shared = Arc::clone(&self.shared);
        self.shared.workers.spawn(move || {
            let result = flush::flush_memtable(&shared, false);
            shared.flush_scheduled.store(false, Ordering::Release);
            if let Err(e) = result {
                warn!("background flush failed: {e:#}");
            }
        });
    }

    /// Looks up `key`. Returns `Ok(None)` when the key does not exist
    /// or its newest version is a delete.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        ensure!(
            !key.is_empty() && key.len() <= MAX_KEY_SIZE,
            "invalid key length {}",
            key.len()
        );

        // Snapshot the buffers; they outlive the flush via refcounts.
        let (active, immutable) = {
            let tables = self.shared.tables.read();
            (
                Arc::clone(&tables.active),
                tables.immutable.as_ref().map(Arc::clone),
            )
        };
        if let Some((kind, value)) = active.get(key) {
            return Ok(match kind {
                EntryKind::Write => Some(value),
                EntryKind::Delete => None,
            });
        }
        if let Some(immutable) = &immutable {
            if let Some((kind, value)) = immutable.get(key) {
                return Ok(match kind {
                    EntryKind::Write => Some(value),
                    EntryKind::Delete => None,
                });
            }
        }

        loop {
            let Some(head_id) = self.shared.model.lookup(key) else {
                bail!("model has no mapping for key");
            };
            let Some(chain) =
                chain::fix_overflow_chain(&self.shared.pool, &self.shared.model, head_id, false, None)?
            else {
                continue;
            };
            // Revalidate under the shared fix: the mapping may have moved
            // between the lookup and the fix.
            if self.shared.model.lookup(key) != Some(chain.head_id())
                || !chain.head_contains(key)?
            {
                chain.unfix_all(false);
                continue;
            }
            let value = chain.get(key)?;
            chain.unfix_all(false);
            return Ok(value);
        }
    }

    /// Collects up to `count` records with keys `>= start_key`, merged
    /// across the page layer and both write buffers so that the newest
    /// version of every key wins and deleted keys are absent.
    pub fn get_range(&self, start_key: &[u8], count: usize) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        ensure!(
            !start_key.is_empty() && start_key.len() <= MAX_KEY_SIZE,
            "invalid key length {}",
            start_key.len()
        );
        let mut out = Vec::with_capacity(count);
        if count == 0 {
            return Ok(out);
        }

        let (active, immutable) = {
            let tables = self.shared.tables.read();
            (
                Arc::clone(&tables.active),
                tables.immutable.as_ref().map(Arc::clone),
            )
        };

        let mut cursor = start_key.to_vec();
        'chains: loop {
            let chain = loop {
                let Some(head_id) = self.shared.model.lookup(&cursor) else {
                    bail!("model has no mapping for key");
                };
                let Some(chain) = chain::fix_overflow_chain(
                    &self.shared.pool,
                    &self.shared.model,
                    head_id,
                    false,
                    None,
                )?
                else {
                    continue;
                };
                if self.shared.model.lookup(&cursor) != Some(chain.head_id())
                    || !chain.head_contains(&cursor)?
                {
                    chain.unfix_all(false);
                    continue;
                }
                break chain;
            };

            let upper = chain.upper_owned()?;
            let mut merged: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();
            {
                let pages = chain.pages()?;
                for (key, value) in merge::ChainMergeIter::new(&pages) {
                    if key >= cursor.as_slice() {
                        merged.insert(key.to_vec(), value.to_vec());
                    }
                }
            }
            chain.unfix_all(false);

            // Buffer overlay: the frozen buffer first, the active buffer
            // on top, newest version per key within each.
            if let Some(immutable) = &immutable {
                overlay_range(&mut merged, immutable, &cursor, upper.as_deref());
            }
            overlay_range(&mut merged, &active, &cursor, upper.as_deref());

            for entry in merged {
                out.push(entry);
                if out.len() == count {
                    break 'chains;
                }
            }
            match upper {
                Some(next) => cursor = next,
                None => break,
            }
        }
        Ok(out)
    }

    /// Synchronously flushes the write buffer to the page layer.
    /// `disable_deferred_io` forces even small batches to disk.
    pub fn flush_memtable(&self, disable_deferred_io: bool) -> Result<()> {
        flush::flush_memtable(&self.shared, disable_deferred_io)
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        // Complete queued background work first so a scheduled
        // reorganization is not lost, then persist everything.
        self.shared.workers.shutdown();
        if let Err(e) = flush::flush_memtable(&self.shared, true) {
            warn!("final flush failed: {e:#}");
        }
        if let Err(e) = self.shared.pool.write_dirty() {
            warn!("final write-back failed: {e:#}");
        }
        if let Err(e) = self.shared.store_manifest() {
            warn!("manifest update failed: {e:#}");
        }
        if let Err(e) = self.shared.files.sync() {
            warn!("segment sync failed: {e:#}");
        }
    }
}

fn overlay_range(
    merged: &mut BTreeMap<Vec<u8>, Vec<u8>>,
    table: &MemTable,
    lower: &[u8],
    upper: Option<&[u8]>,
) {
    let mut iter = table.range(lower, upper);
    let mut last: Option<Vec<u8>> = None;
    while iter.valid() {
        if last.as_deref() != Some(iter.key()) {
            last = Some(iter.key().to_vec());
            match iter.kind() {
                EntryKind::Write => {
                    merged.insert(iter.key().to_vec(), iter.value().to_vec());
                }
                EntryKind::Delete => {
                    merged.remove(iter.key());
                }
            }
        }
        iter.advance();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KeyHints;
    use crate::encoding::encode_u64;

    fn small_options() -> Options {
        Options {
            key_hints: KeyHints {
                num_keys: 64,
                record_size: 64,
                page_fill_pct: 50,
                min_key: 0,
                key_step: 1,
            },
            page_size: 4096,
            pages_per_segment: 64,
            buffer_pool_size: 64 * 4096,
            bg_threads: 2,
            ..Options::default()
        }
    }

    fn open(dir: &tempfile::TempDir) -> Database {
        Database::open(small_options(), dir.path()).unwrap()
    }

    #[test]
    fn chain_grows_then_reorganizes() {
        let dir = tempfile::tempdir().unwrap();
        let db = open(&dir);

        // Push far more records into one interval than a page holds.
        let value = vec![0x42u8; 64];
        for key in 0..600u64 {
            db.put(&encode_u64(key), &value).unwrap();
        }
        db.flush_memtable(true).unwrap();

        // Run the scheduled reorganizations to completion.
        db.shared.workers.shutdown();

        // Every record is still readable through the model.
        for key in 0..600u64 {
            assert_eq!(db.get(&encode_u64(key)).unwrap(), Some(value.clone()), "key {key}");
        }
    }

    #[test]
    fn reorganization_preserves_records_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        let db = open(&dir);

        let value = vec![0x17u8; 64];
        for key in 0..400u64 {
            db.put(&encode_u64(key), &value).unwrap();
        }
        db.flush_memtable(true).unwrap();
        db.shared.workers.shutdown();

        let records = db.get_range(&encode_u64(0), 1000).unwrap();
        assert_eq!(records.len(), 400);
        for (index, (key, _)) in records.iter().enumerate() {
            assert_eq!(key, &encode_u64(index as u64).to_vec());
        }
    }

    #[test]
    fn reorganize_chain_directly_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let db = open(&dir);

        let value = vec![0x55u8; 64];
        for key in 0..200u64 {
            db.put(&encode_u64(key), &value).unwrap();
        }
        db.flush_memtable(true).unwrap();

        // Key 100 sits in the grown chain above the first boundary.
        let head = db.shared.model.lookup(&encode_u64(100)).unwrap();
        reorg::reorganize_chain(&db.shared, head).unwrap();
        // A second pass finds a single-page chain and returns early.
        let head = db.shared.model.lookup(&encode_u64(100)).unwrap();
        reorg::reorganize_chain(&db.shared, head).unwrap();

        for key in 0..200u64 {
            assert_eq!(db.get(&encode_u64(key)).unwrap(), Some(value.clone()));
        }
    }

    #[test]
    fn concurrent_readers_during_reorganization() {
        use rand::{Rng, SeedableRng};

        let dir = tempfile::tempdir().unwrap();
        let db = open(&dir);

        let value = vec![0x99u8; 64];
        // Even keys exist, odd keys never do.
        for key in (0..400u64).step_by(2) {
            db.put(&encode_u64(key), &value).unwrap();
        }
        db.flush_memtable(true).unwrap();

        std::thread::scope(|scope| {
            let reader = scope.spawn(|| {
                let mut rng = rand::rngs::StdRng::seed_from_u64(7);
                for _ in 0..2000 {
                    let key: u64 = rng.gen_range(0..400);
                    let got = db.get(&encode_u64(key)).unwrap();
                    if key % 2 == 0 {
                        assert_eq!(got, Some(value.clone()), "key {key}");
                    } else {
                        assert_eq!(got, None, "key {key}");
                    }
                }
            });

            let reorganizer = scope.spawn(|| {
                let head = db.shared.model.lookup(&encode_u64(100)).unwrap();
                reorg::reorganize_chain(&db.shared, head).unwrap();
            });

            reader.join().unwrap();
            reorganizer.join().unwrap();
        });
    }

    #[test]
    fn writes_after_reorganization_route_correctly() {
        let dir = tempfile::tempdir().unwrap();
        let db = open(&dir);

        let value = vec![0x77u8; 64];
        for key in 0..300u64 {
            db.put(&encode_u64(key), &value).unwrap();
        }
        db.flush_memtable(true).unwrap();

        // Split the grown interval by hand, then write the same key
        // range again: the new boundaries must route every key.
        let head = db.shared.model.lookup(&encode_u64(100)).unwrap();
        reorg::reorganize_chain(&db.shared, head).unwrap();

        let updated = vec![0x78u8; 64];
        for key in 0..300u64 {
            db.put(&encode_u64(key), &updated).unwrap();
        }
        db.flush_memtable(true).unwrap();
        db.shared.workers.shutdown();

        for key in 0..300u64 {
            assert_eq!(db.get(&encode_u64(key)).unwrap(), Some(updated.clone()));
        }
    }
}
