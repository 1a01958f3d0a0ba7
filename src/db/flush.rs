//! # Flush Coordinator
//!
//! Turning the write buffer into page updates:
//!
//! 1. Swap in a fresh active buffer under the write mutex; the frozen
//!    buffer keeps serving reads until the flush completes.
//! 2. Stream the frozen buffer in key order, keeping only the newest
//!    version per key, and group runs of keys that the model routes to
//!    the same chain head.
//! 3. Per batch: fix the chain exclusively. If the model moved in the
//!    meantime (a reorganization), the batch can no longer be assumed
//!    to target a single chain, so every entry is re-routed
//!    individually.
//!    Small single-page batches may be deferred: their entries are
//!    requeued into the active buffer under their original sequence
//!    numbers and a per-chain counter limits how often that happens.
//! 4. Apply writes and deletes; a full chain grows an overflow page; a
//!    chain that got long schedules a background reorganization.
//! 5. Write every dirty frame back to its segment and drop the frozen
//!    buffer. With no external write-ahead log, this write-back is the
//!    durability point of the engine.
//!
//! A batch error keeps the frozen buffer in place; the next flush
//! retries it. Replaying already-applied entries is harmless because
//! writes are absolute and deletes remove.

use std::collections::VecDeque;
use std::sync::Arc;

use eyre::Result;
use tracing::{debug, trace, warn};

use crate::memtable::{EntryKind, MemTable};
use crate::storage::PageId;

use super::chain::{self, OverflowChain};
use super::{reorg, DbShared};

pub(crate) struct FlushEntry {
    pub key: Vec<u8>,
    pub kind: EntryKind,
    pub value: Vec<u8>,
    pub sequence: u64,
}

pub(crate) fn flush_memtable(shared: &Arc<DbShared>, disable_deferred_io: bool) -> Result<()> {
    let _serial = shared.flush_serial.lock();

    let Some(frozen) = rotate(shared) else {
        return Ok(());
    };
    debug!(
        bytes = frozen.approximate_memory_usage(),
        disable_deferred_io, "flushing write buffer"
    );

    let mut first_error: Option<eyre::Report> = None;
    let mut record_error = |error: eyre::Report| {
        warn!("flush batch failed: {error:#}");
        if first_error.is_none() {
            first_error = Some(error);
        }
    };

    let mut iter = frozen.iter();
    let mut batch: Vec<FlushEntry> = Vec::new();
    let mut batch_target = PageId::INVALID;
    let mut batch_version = 0u64;
    let mut last_key: Option<Vec<u8>> = None;
    while iter.valid() {
        // Shadowed older versions of the previous key are dropped here;
        // the newest version sorts first.
        if last_key.as_deref() == Some(iter.key()) {
            iter.advance();
            continue;
        }
        last_key = Some(iter.key().to_vec());

        let version = shared.model.version();
        let target = match shared.model.lookup(iter.key()) {
            Some(target) => target,
            None => {
                record_error(eyre::eyre!("model has no mapping for buffered key"));
                iter.advance();
                continue;
            }
        };
        if !batch.is_empty() && target != batch_target {
            let entries = std::mem::take(&mut batch);
            if let Err(e) =
                process_batch(shared, batch_target, batch_version, entries, disable_deferred_io)
            {
                record_error(e);
            }
        }
        if batch.is_empty() {
            batch_target = target;
            batch_version = version;
        }
        batch.push(FlushEntry {
            key: iter.key().to_vec(),
            kind: iter.kind(),
            value: iter.value().to_vec(),
            sequence: iter.sequence(),
        });
        iter.advance();
    }
    if !batch.is_empty() {
        if let Err(e) =
            process_batch(shared, batch_target, batch_version, batch, disable_deferred_io)
        {
            record_error(e);
        }
    }
    drop(iter);

    if let Some(error) = first_error {
        // The frozen buffer stays installed; the next flush retries it.
        return Err(error);
    }

    shared.pool.write_dirty()?;
    if !shared.options.bypass_wal {
        shared.files.sync()?;
    }
    {
        let _write = shared.write_mutex.lock();
        shared.tables.write().immutable = None;
    }
    shared.store_manifest()?;
    Ok(())
}

/// Freezes the active buffer. Returns `None` when there is nothing to
/// flush; returns a previously frozen buffer first when an earlier
/// flush failed before discarding it.
fn rotate(shared: &DbShared) -> Option<Arc<MemTable>> {
    let _write = shared.write_mutex.lock();
    let mut tables = shared.tables.write();
    if let Some(existing) = &tables.immutable {
        return Some(Arc::clone(existing));
    }
    if !tables.active.has_entries() {
        return None;
    }
    let frozen = Arc::clone(&tables.active);
    tables.active = Arc::new(MemTable::new(Arc::clone(&shared.sequence)));
    tables.immutable = Some(Arc::clone(&frozen));
    Some(frozen)
}

fn process_batch(
    shared: &Arc<DbShared>,
    target: PageId,
    version: u64,
    entries: Vec<FlushEntry>,
    disable_deferred_io: bool,
) -> Result<()> {
    let mut work = VecDeque::new();
    work.push_back((target, version, entries));
    while let Some((head_id, version, entries)) = work.pop_front() {
        match chain::fix_overflow_chain(&shared.pool, &shared.model, head_id, true, Some(version))?
        {
            Some(chain) => apply_batch(shared, chain, entries, disable_deferred_io)?,
            None => {
                trace!(page = %head_id, "batch target moved; rerouting entries");
                reroute(shared, entries, &mut work)?;
            }
        }
    }
    Ok(())
}

/// Re-routes entries through the model one by one after a concurrent
/// reorganization: the keys of an invalidated batch may no longer share
/// a chain.
fn reroute(
    shared: &DbShared,
    entries: Vec<FlushEntry>,
    work: &mut VecDeque<(PageId, u64, Vec<FlushEntry>)>,
) -> Result<()> {
    let mut run: Vec<FlushEntry> = Vec::new();
    let mut run_target = PageId::INVALID;
    let mut run_version = 0u64;
    for entry in entries {
        let version = shared.model.version();
        let target = shared
            .model
            .lookup(&entry.key)
            .ok_or_else(|| eyre::eyre!("model has no mapping for rerouted key"))?;
        if !run.is_empty() && target != run_target {
            work.push_back((run_target, run_version, std::mem::take(&mut run)));
        }
        if run.is_empty() {
            run_target = target;
            run_version = version;
        }
        run.push(entry);
    }
    if !run.is_empty() {
        work.push_back((run_target, run_version, run));
    }
    Ok(())
}

fn apply_batch<'a>(
    shared: &'a Arc<DbShared>,
    mut chain: OverflowChain<'a>,
    entries: Vec<FlushEntry>,
    disable_deferred_io: bool,
) -> Result<()> {
    let lower = chain.lower_owned()?;

    if !disable_deferred_io
        && chain.len() == 1
        && entries.len() < shared.options.deferred_io_min_entries
    {
        let mut counters = shared.deferrals.lock();
        let count = counters.entry(lower.clone()).or_insert(0);
        if *count < shared.options.deferred_io_max_deferrals {
            *count += 1;
            let deferrals = *count;
            drop(counters);
            chain.unfix_all(false);
            requeue(shared, &entries);
            debug!(entries = entries.len(), deferrals, "deferred small batch");
            return Ok(());
        }
    }
    shared.deferrals.lock().remove(&lower);

    for entry in &entries {
        debug_assert!(
            chain.head_contains(&entry.key)?,
            "flush routed a key outside its chain interval"
        );
        match entry.kind {
            EntryKind::Write => {
                chain.put(&shared.pool, &shared.files, &entry.key, &entry.value)?
            }
            EntryKind::Delete => chain.delete(&entry.key)?,
        }
    }

    let chain_len = chain.len();
    let records = chain.record_count()?;
    let head_id = chain.head_id();
    chain.unfix_all(false);

    let per_page_target = shared
        .options
        .key_hints
        .records_per_page(shared.options.page_size);
    if chain_len > 1 && records > per_page_target {
        schedule_reorg(shared, head_id);
    }
    Ok(())
}

/// Puts deferred entries back into the active buffer under their
/// original sequence numbers, so any newer write of the same key still
/// wins. Runs strictly after the chain frames are released, keeping the
/// write mutex ahead of frame locks in the global order.
fn requeue(shared: &DbShared, entries: &[FlushEntry]) {
    let _write = shared.write_mutex.lock();
    let tables = shared.tables.read();
    for entry in entries {
        tables
            .active
            .add_with_sequence(&entry.key, &entry.value, entry.kind, entry.sequence);
    }
}

pub(crate) fn schedule_reorg(shared: &Arc<DbShared>, head_id: PageId) {
    let job_shared = Arc::clone(shared);
    shared.workers.spawn(move || {
        if let Err(e) = reorg::reorganize_chain(&job_shared, head_id) {
            warn!(page = %head_id, "reorganization failed: {e:#}");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{KeyHints, Options};
    use crate::db::Database;
    use crate::encoding::encode_u64;

    fn options() -> Options {
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

    /// A batch carrying a stale model version must not be applied to the
    /// chain it originally targeted; every entry is re-routed through
    /// the current model instead.
    #[test]
    fn stale_batch_is_rerouted_through_current_model() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(options(), dir.path()).unwrap();

        let value = vec![0x31u8; 64];
        for key in 32..300u64 {
            db.put(&encode_u64(key), &value).unwrap();
        }
        db.flush_memtable(true).unwrap();

        // Split the grown chain so its old head no longer covers the
        // whole batch interval.
        let head = db.shared.model.lookup(&encode_u64(100)).unwrap();
        crate::db::reorg::reorganize_chain(&db.shared, head).unwrap();

        let updated = vec![0x32u8; 64];
        let entries: Vec<FlushEntry> = (32..300u64)
            .map(|key| FlushEntry {
                key: encode_u64(key).to_vec(),
                kind: EntryKind::Write,
                value: updated.clone(),
                sequence: key,
            })
            .collect();

        // Version 0 predates every model mutation, so the chain fix must
        // report retry and the worklist re-routes per key.
        process_batch(&db.shared, head, 0, entries, true).unwrap();
        db.shared.pool.write_dirty().unwrap();

        for key in 32..300u64 {
            assert_eq!(
                db.get(&encode_u64(key)).unwrap(),
                Some(updated.clone()),
                "key {key}"
            );
        }
    }
}
