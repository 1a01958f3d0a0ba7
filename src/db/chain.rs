//! # Overflow Chains
//!
//! An overflow chain is a singly-linked list of pages sharing one key
//! interval; the head is the only page the model references. Fixing a
//! chain means fixing every page in it, head first, links in walk
//! order, all in the same lock mode.
//!
//! The fix protocol is the engine's arbitration point between flushes,
//! reorganizations and readers: after the head is locked, the model is
//! consulted *again*. If the mapping moved (a reorganization replaced
//! the chain) or the caller's version snapshot is stale (the chain was
//! split), the head is released and the caller retries or re-routes.
//! Holding the head exclusively serializes every writer that targets
//! the same chain.

use eyre::{bail, Result};
use smallvec::SmallVec;

use crate::model::Model;
use crate::storage::page::{self, Page, PutResult};
use crate::storage::{BufferPool, FileManager, FixedFrame, PageId};

/// An overflow chain with every page fixed. Dropping releases the
/// frames clean; mutation marks the touched frames dirty immediately,
/// so an error mid-apply never leaves silent in-memory-only changes.
pub(crate) struct OverflowChain<'a> {
    frames: SmallVec<[FixedFrame<'a>; 4]>,
    exclusive: bool,
}

/// Fixes the chain headed by `head_id`.
///
/// Returns `Ok(None)` ("retry") when, with the head already locked,
/// either the caller's `expected_version` no longer matches the model
/// or the model no longer maps the head's lower boundary to `head_id`.
/// Both mean a reorganization won the race; the caller must re-consult
/// the model.
pub(crate) fn fix_overflow_chain<'a>(
    pool: &'a BufferPool,
    model: &Model,
    head_id: PageId,
    exclusive: bool,
    expected_version: Option<u64>,
) -> Result<Option<OverflowChain<'a>>> {
    let head = pool.fix(head_id, exclusive, false)?;

    if let Some(version) = expected_version {
        if model.version() != version {
            head.unfix(false);
            return Ok(None);
        }
    }

    let (lower, mut next) = {
        let page = head.page()?;
        (page.lower().to_vec(), page.overflow())
    };
    if model.lookup(&lower) != Some(head_id) {
        head.unfix(false);
        return Ok(None);
    }

    let mut frames: SmallVec<[FixedFrame<'a>; 4]> = SmallVec::new();
    frames.push(head);
    while let Some(link) = next {
        let frame = pool.fix(link, exclusive, false)?;
        next = frame.page()?.overflow();
        frames.push(frame);
    }
    Ok(Some(OverflowChain { frames, exclusive }))
}

impl<'a> OverflowChain<'a> {
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn head_id(&self) -> PageId {
        self.frames[0].page_id()
    }

    pub fn lower_owned(&self) -> Result<Vec<u8>> {
        Ok(self.frames[0].page()?.lower().to_vec())
    }

    pub fn upper_owned(&self) -> Result<Option<Vec<u8>>> {
        Ok(self.frames[0].page()?.upper().map(|u| u.to_vec()))
    }

    pub fn head_contains(&self, key: &[u8]) -> Result<bool> {
        Ok(self.frames[0].page()?.contains(key))
    }

    /// Read-only views of every page, in chain order.
    pub fn pages(&self) -> Result<Vec<Page<'_>>> {
        self.frames.iter().map(|frame| frame.page()).collect()
    }

    pub fn record_count(&self) -> Result<usize> {
        let mut total = 0;
        for frame in &self.frames {
            total += frame.page()?.record_count();
        }
        Ok(total)
    }

    /// First-hit search across the chain, in link order.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        for frame in &self.frames {
            if let Some(value) = frame.page()?.get(key)? {
                return Ok(Some(value.to_vec()));
            }
        }
        Ok(None)
    }

    /// Applies a write. An existing record is overwritten in its page
    /// when possible; otherwise the record goes to the first page with
    /// room, and when every page is full a new overflow page is
    /// allocated, initialized with the chain's interval and linked
    /// after the current tail.
    pub fn put(
        &mut self,
        pool: &'a BufferPool,
        files: &FileManager,
        key: &[u8],
        value: &[u8],
    ) -> Result<()> {
        debug_assert!(self.exclusive, "chain writes require an exclusive fix");

        // Overwrite pass: at most one page holds the key.
        for frame in self.frames.iter_mut() {
            let found = matches!(
                frame.page()?.find_key(key)?,
                page::SearchResult::Found(_)
            );
            if found {
                frame.mark_dirty();
                match frame.page_mut()?.put(key, value)? {
                    PutResult::Done => return Ok(()),
                    // The stale record was removed; fall through to the
                    // insert pass for the new value.
                    PutResult::Full => break,
                }
            }
        }

        // Insert pass: first page with room wins.
        for frame in self.frames.iter_mut() {
            if frame.page_mut()?.put(key, value)? == PutResult::Done {
                frame.mark_dirty();
                return Ok(());
            }
        }

        // Every page is full: extend the chain.
        let (lower, upper) = {
            let head = self.frames[0].page()?;
            (head.lower().to_vec(), head.upper().map(|u| u.to_vec()))
        };
        let link = files.allocate_page()?;
        let mut frame = pool.fix(link, true, true)?;
        page::init(frame.data_mut(), &lower, upper.as_deref(), true)?;
        if frame.page_mut()?.put(key, value)? != PutResult::Done {
            bail!("record does not fit an empty overflow page");
        }
        frame.mark_dirty();

        let tail = self
            .frames
            .last_mut()
            .expect("a fixed chain has at least its head");
        tail.mark_dirty();
        tail.page_mut()?.set_overflow(Some(link));
        self.frames.push(frame);
        tracing::trace!(chain = %self.head_id(), link = %link, "extended overflow chain");
        Ok(())
    }

    /// Removes `key` from every page of the chain.
    pub fn delete(&mut self, key: &[u8]) -> Result<()> {
        debug_assert!(self.exclusive, "chain writes require an exclusive fix");
        for frame in self.frames.iter_mut() {
            let found = matches!(
                frame.page()?.find_key(key)?,
                page::SearchResult::Found(_)
            );
            if found {
                frame.mark_dirty();
                frame.page_mut()?.delete(key)?;
            }
        }
        Ok(())
    }

    /// Releases every frame. `dirty` marks all of them modified; chain
    /// mutations already mark precisely, so callers normally pass
    /// `false`.
    pub fn unfix_all(self, dirty: bool) {
        for frame in self.frames {
            frame.unfix(dirty);
        }
    }

    /// Surrenders the fixed frames, head first, for the reorganization
    /// publish step.
    pub fn into_frames(self) -> SmallVec<[FixedFrame<'a>; 4]> {
        self.frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::FileManagerConfig;
    use std::sync::Arc;

    const PAGE: usize = 4096;

    struct Fixture {
        _dir: tempfile::TempDir,
        files: Arc<FileManager>,
        pool: BufferPool,
        model: Model,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let files = Arc::new(
            FileManager::create(
                dir.path(),
                FileManagerConfig {
                    page_size: PAGE,
                    pages_per_segment: 16,
                    use_direct_io: false,
                },
                16,
            )
            .unwrap(),
        );
        let pool = BufferPool::new(8, Arc::clone(&files));
        Fixture {
            _dir: dir,
            files,
            pool,
            model: Model::new(),
        }
    }

    fn bootstrap_head(fx: &Fixture) -> PageId {
        let id = fx.files.allocate_page().unwrap();
        let mut frame = fx.pool.fix(id, true, true).unwrap();
        page::init(frame.data_mut(), b"", None, false).unwrap();
        frame.unfix(true);
        fx.model.insert(Vec::new(), id);
        id
    }

    #[test]
    fn fix_single_page_chain() {
        let fx = fixture();
        let head = bootstrap_head(&fx);
        let chain = fix_overflow_chain(&fx.pool, &fx.model, head, false, None)
            .unwrap()
            .unwrap();
        assert_eq!(chain.len(), 1);
        assert_eq!(chain.head_id(), head);
        chain.unfix_all(false);
    }

    #[test]
    fn stale_mapping_returns_retry() {
        let fx = fixture();
        let head = bootstrap_head(&fx);
        // The model moves the interval to another page.
        let other = fx.files.allocate_page().unwrap();
        let mut frame = fx.pool.fix(other, true, true).unwrap();
        page::init(frame.data_mut(), b"", None, false).unwrap();
        frame.unfix(true);
        fx.model.insert(Vec::new(), other);

        let result = fix_overflow_chain(&fx.pool, &fx.model, head, true, None).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn stale_version_returns_retry() {
        let fx = fixture();
        let head = bootstrap_head(&fx);
        let version = fx.model.version();
        fx.model.insert(b"zzz".to_vec(), PageId(99));
        let result =
            fix_overflow_chain(&fx.pool, &fx.model, head, true, Some(version)).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn put_spills_into_overflow_page() {
        let fx = fixture();
        let head = bootstrap_head(&fx);
        let value = vec![0xaau8; 900];

        let mut chain = fix_overflow_chain(&fx.pool, &fx.model, head, true, None)
            .unwrap()
            .unwrap();
        for index in 0..8u32 {
            let key = format!("key-{index:04}");
            chain
                .put(&fx.pool, &fx.files, key.as_bytes(), &value)
                .unwrap();
        }
        assert!(chain.len() > 1, "chain should have grown");
        assert_eq!(chain.record_count().unwrap(), 8);
        let chain_len = chain.len();
        chain.unfix_all(false);

        // Re-fix and confirm the records are all reachable.
        let chain = fix_overflow_chain(&fx.pool, &fx.model, head, false, None)
            .unwrap()
            .unwrap();
        assert_eq!(chain.len(), chain_len);
        for index in 0..8u32 {
            let key = format!("key-{index:04}");
            assert_eq!(chain.get(key.as_bytes()).unwrap(), Some(value.clone()));
        }
        chain.unfix_all(false);
    }

    #[test]
    fn overwrite_does_not_duplicate_across_chain() {
        let fx = fixture();
        let head = bootstrap_head(&fx);
        let value = vec![0x11u8; 900];

        let mut chain = fix_overflow_chain(&fx.pool, &fx.model, head, true, None)
            .unwrap()
            .unwrap();
        for index in 0..8u32 {
            let key = format!("key-{index:04}");
            chain
                .put(&fx.pool, &fx.files, key.as_bytes(), &value)
                .unwrap();
        }
        // Update a key that lives in the head with a value that no
        // longer fits there.
        let big = vec![0x22u8; 2200];
        chain.put(&fx.pool, &fx.files, b"key-0000", &big).unwrap();
        assert_eq!(chain.get(b"key-0000").unwrap(), Some(big.clone()));
        assert_eq!(chain.record_count().unwrap(), 8);
        chain.unfix_all(false);
    }

    #[test]
    fn delete_removes_from_chain() {
        let fx = fixture();
        let head = bootstrap_head(&fx);
        let value = vec![0x33u8; 900];

        let mut chain = fix_overflow_chain(&fx.pool, &fx.model, head, true, None)
            .unwrap()
            .unwrap();
        for index in 0..8u32 {
            let key = format!("key-{index:04}");
            chain
                .put(&fx.pool, &fx.files, key.as_bytes(), &value)
                .unwrap();
        }
        chain.delete(b"key-0003").unwrap();
        assert_eq!(chain.get(b"key-0003").unwrap(), None);
        assert_eq!(chain.record_count().unwrap(), 7);
        chain.unfix_all(false);
    }
}
