//! # Buffer Pool
//!
//! A fixed set of frames, each holding one page image plus metadata.
//! Every page access goes through `fix`/`unfix`:
//!
//! 1. `fix(page_id, exclusive, newly_allocated)` pins the page into a
//!    frame (loading it from its segment unless `newly_allocated`) and
//!    acquires the frame's pinning lock in the requested mode, blocking
//!    while an incompatible holder is present.
//! 2. The returned [`FixedFrame`] hands out `&[u8]`/`&mut [u8]` views of
//!    the page image, valid for exactly as long as the fix is held.
//! 3. `unfix(dirty)` releases the pinning lock; dirty pages are written
//!    back when their frame is evicted and by [`BufferPool::write_dirty`].
//!
//! ## Eviction
//!
//! Second-chance (clock) over the frame array: a fixed frame is never a
//! victim, a referenced frame loses its reference bit and survives one
//! sweep, and a dirty victim is written back through the file manager
//! before its frame is reused. When every frame is fixed, `fix` fails
//! rather than waiting; callers size the pool to their longest chain.
//!
//! ## Pinning Locks
//!
//! The pinning lock is a `parking_lot::RwLock<()>` held across calls by
//! forgetting the guard and force-unlocking on release. Concurrent fixes
//! of distinct frames proceed in parallel; fixes of the same frame follow
//! reader/writer discipline. Frame metadata is published under the pool
//! mutex, so a page miss performs its disk read before the mapping
//! becomes visible and no fixer can observe a half-loaded frame.

use std::cell::UnsafeCell;
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use eyre::{bail, ensure, Result, WrapErr};
use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};
use tracing::{trace, warn};

use super::page::{self, Page, PageMut};
use super::{AlignedPageBuf, FileManager, PageId};

struct Frame {
    buf: UnsafeCell<AlignedPageBuf>,
    /// Page currently held, `PageId::INVALID` for free frames.
    page_id: AtomicU64,
    /// Pinning lock; guards the page image.
    latch: RwLock<()>,
    fix_count: AtomicU32,
    dirty: AtomicBool,
    /// Second-chance bit for the clock sweep.
    referenced: AtomicBool,
}

// SAFETY: the page image behind `buf` is only reached through `fix`,
// which holds the frame latch in the matching mode, or through pool
// internals that hold the latch (eviction write-back, write_dirty) or
// have exclusive ownership of an unmapped frame (loading).
unsafe impl Sync for Frame {}
unsafe impl Send for Frame {}

struct PoolState {
    map: HashMap<u64, usize>,
    free: Vec<usize>,
    hand: usize,
}

pub struct BufferPool {
    frames: Vec<Frame>,
    state: Mutex<PoolState>,
    files: Arc<FileManager>,
}

impl BufferPool {
    pub fn new(frame_count: usize, files: Arc<FileManager>) -> Self {
        let page_size = files.page_size();
        let frames = (0..frame_count.max(1))
            .map(|_| Frame {
                buf: UnsafeCell::new(AlignedPageBuf::new_zeroed(page_size)),
                page_id: AtomicU64::new(PageId::INVALID.0),
                latch: RwLock::new(()),
                fix_count: AtomicU32::new(0),
                dirty: AtomicBool::new(false),
                referenced: AtomicBool::new(false),
            })
            .collect::<Vec<_>>();
        let free = (0..frames.len()).rev().collect();
        Self {
            frames,
            state: Mutex::new(PoolState {
                map: HashMap::with_capacity(frame_count),
                free,
                hand: 0,
            }),
            files,
        }
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    /// Pins `page_id` into a frame and acquires its pinning lock.
    ///
    /// `newly_allocated` skips the disk read and hands out a zeroed
    /// image; the caller is expected to initialize it. Blocks while the
    /// pinning lock is held in an incompatible mode.
    pub fn fix(
        &self,
        page_id: PageId,
        exclusive: bool,
        newly_allocated: bool,
    ) -> Result<FixedFrame<'_>> {
        ensure!(page_id.is_valid(), "fix of invalid page id");

        let index = {
            let mut state = self.state.lock();
            if let Some(&index) = state.map.get(&page_id.0) {
                let frame = &self.frames[index];
                frame.fix_count.fetch_add(1, Ordering::AcqRel);
                frame.referenced.store(true, Ordering::Release);
                index
            } else {
                let index = self.reserve_frame(&mut state)?;
                let frame = &self.frames[index];
                // SAFETY: the frame is unmapped and unpinned; no other
                // thread can reach it until the map entry below is
                // published under the pool mutex.
                let buf = unsafe { &mut *frame.buf.get() };
                if newly_allocated {
                    buf.as_mut_slice().fill(0);
                } else if let Err(e) = self
                    .files
                    .read_page(page_id, buf.as_mut_slice())
                    .and_then(|()| page::validate(buf.as_slice()))
                {
                    warn!(page = %page_id, "failed to load page: {e:#}");
                    state.free.push(index);
                    return Err(e).wrap_err_with(|| format!("failed to load page {page_id}"));
                }
                frame.page_id.store(page_id.0, Ordering::Release);
                frame.dirty.store(false, Ordering::Release);
                frame.referenced.store(true, Ordering::Release);
                frame.fix_count.store(1, Ordering::Release);
                state.map.insert(page_id.0, index);
                index
            }
        };

        let frame = &self.frames[index];
        if exclusive {
            mem::forget(frame.latch.write());
        } else {
            mem::forget(frame.latch.read());
        }
        Ok(FixedFrame {
            pool: self,
            index,
            page_id,
            exclusive,
        })
    }

    /// Picks a reusable frame: a free one, or a clock victim. Dirty
    /// victims are written back first. Called with the pool mutex held,
    /// which also keeps fix counts from rising during the sweep.
    fn reserve_frame(&self, state: &mut PoolState) -> Result<usize> {
        if let Some(index) = state.free.pop() {
            return Ok(index);
        }

        let len = self.frames.len();
        let mut scanned = 0;
        while scanned < 2 * len {
            let index = state.hand;
            state.hand = (state.hand + 1) % len;
            scanned += 1;

            let frame = &self.frames[index];
            if frame.fix_count.load(Ordering::Acquire) != 0 {
                continue;
            }
            if frame.referenced.swap(false, Ordering::AcqRel) {
                continue;
            }
            let Some(guard) = frame.latch.try_write() else {
                continue;
            };

            let victim = PageId(frame.page_id.load(Ordering::Acquire));
            if frame.dirty.load(Ordering::Acquire) {
                // SAFETY: exclusive latch held via `guard`.
                let buf = unsafe { &*frame.buf.get() };
                match self.files.write_page(victim, buf.as_slice()) {
                    Ok(()) => frame.dirty.store(false, Ordering::Release),
                    Err(e) => {
                        // The frame stays mapped and dirty; the write is
                        // retried on the next eviction attempt.
                        drop(guard);
                        return Err(e)
                            .wrap_err_with(|| format!("failed to write back page {victim}"));
                    }
                }
                trace!(page = %victim, "evicted dirty page");
            }
            state.map.remove(&victim.0);
            frame.page_id.store(PageId::INVALID.0, Ordering::Release);
            drop(guard);
            return Ok(index);
        }
        bail!(
            "buffer pool exhausted: all {} frames are fixed",
            self.frames.len()
        );
    }

    fn release(&self, index: usize, exclusive: bool) {
        let frame = &self.frames[index];
        // SAFETY: a FixedFrame holds the latch in exactly this mode; it
        // was acquired in `fix` and the guard forgotten.
        unsafe {
            if exclusive {
                frame.latch.force_unlock_write();
            } else {
                frame.latch.force_unlock_read();
            }
        }
        let previous = frame.fix_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "unfix of an unfixed frame");
    }

    /// Writes every dirty resident page back to its segment without
    /// evicting it. Returns the number of pages written.
    pub fn write_dirty(&self) -> Result<usize> {
        let mut written = 0;
        for frame in &self.frames {
            if !frame.dirty.load(Ordering::Acquire) {
                continue;
            }
            let _guard = frame.latch.read();
            let page_id = PageId(frame.page_id.load(Ordering::Acquire));
            if !page_id.is_valid() || !frame.dirty.load(Ordering::Acquire) {
                continue;
            }
            // SAFETY: shared latch held; writers are excluded.
            let buf = unsafe { &*frame.buf.get() };
            self.files
                .write_page(page_id, buf.as_slice())
                .wrap_err_with(|| format!("failed to write back page {page_id}"))?;
            frame.dirty.store(false, Ordering::Release);
            written += 1;
        }
        Ok(written)
    }

    /// Number of resident pages, for introspection and tests.
    pub fn resident_pages(&self) -> usize {
        self.state.lock().map.len()
    }
}

/// A pinned page. Dropping releases the pinning lock with the page
/// considered clean; use [`FixedFrame::unfix`] to release dirty.
pub struct FixedFrame<'a> {
    pool: &'a BufferPool,
    index: usize,
    page_id: PageId,
    exclusive: bool,
}

impl std::fmt::Debug for FixedFrame<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FixedFrame")
            .field("index", &self.index)
            .field("page_id", &self.page_id)
            .field("exclusive", &self.exclusive)
            .finish_non_exhaustive()
    }
}

impl<'a> FixedFrame<'a> {
    #[inline]
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    pub fn data(&self) -> &[u8] {
        let frame = &self.pool.frames[self.index];
        // SAFETY: the pinning lock is held (shared or exclusive) for the
        // lifetime of self, so the image cannot change mode or be evicted.
        unsafe { (*frame.buf.get()).as_slice() }
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        debug_assert!(self.exclusive, "mutable access requires an exclusive fix");
        let frame = &self.pool.frames[self.index];
        // SAFETY: the pinning lock is held exclusively and &mut self
        // guarantees this is the only view handed out.
        unsafe { (*frame.buf.get()).as_mut_slice() }
    }

    pub fn page(&self) -> Result<Page<'_>> {
        Page::from_bytes(self.data())
    }

    pub fn page_mut(&mut self) -> Result<PageMut<'_>> {
        PageMut::from_bytes(self.data_mut())
    }

    /// Marks the page dirty without releasing the fix.
    pub fn mark_dirty(&self) {
        debug_assert!(self.exclusive, "dirtying requires an exclusive fix");
        self.pool.frames[self.index].dirty.store(true, Ordering::Release);
    }

    /// Releases the pinning lock, recording whether the page was
    /// modified.
    pub fn unfix(self, dirty: bool) {
        if dirty {
            self.mark_dirty();
        }
    }
}

impl Drop for FixedFrame<'_> {
    fn drop(&mut self) {
        self.pool.release(self.index, self.exclusive);
    }
}
