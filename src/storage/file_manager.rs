//! # Segment File Manager
//!
//! Pages live in a set of equal-sized segment files named `segment-0`,
//! `segment-1`, ... of `pages_per_segment * page_size` bytes each,
//! preallocated at creation. A physical page id resolves to
//! `(id / pages_per_segment, (id % pages_per_segment) * page_size)`.
//!
//! Allocation is a dense counter: `allocate_page` hands out the next
//! id, creating a new segment when the current ones are exhausted.
//! Concurrent allocators serialize on the allocation mutex, which is a
//! leaf in the global lock order.
//!
//! When direct I/O is enabled the segment files are opened with
//! `O_DIRECT`, which requires page-aligned buffers; [`AlignedPageBuf`]
//! provides them and is used for every page transfer regardless of the
//! I/O mode.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;

use eyre::{ensure, Result, WrapErr};
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::config::{PAGE_BUFFER_ALIGN, SEGMENT_FILE_PREFIX};

use super::PageId;

/// A heap buffer of one page, aligned for direct I/O.
pub struct AlignedPageBuf {
    ptr: NonNull<u8>,
    layout: Layout,
}

impl AlignedPageBuf {
    pub fn new_zeroed(len: usize) -> Self {
        let layout = Layout::from_size_align(len, PAGE_BUFFER_ALIGN)
            .expect("page size and alignment are validated at open");
        // SAFETY: layout has non-zero size (page sizes are at least
        // MIN_PAGE_SIZE) and a valid power-of-two alignment.
        let raw = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).unwrap_or_else(|| std::alloc::handle_alloc_error(layout));
        Self { ptr, layout }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.layout.size()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.layout.size() == 0
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr is valid for layout.size() bytes for the lifetime
        // of self; allocation and deallocation use the same layout.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.layout.size()) }
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above, and &mut self guarantees exclusive access.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.layout.size()) }
    }
}

impl Drop for AlignedPageBuf {
    fn drop(&mut self) {
        // SAFETY: ptr was allocated with exactly this layout.
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

// SAFETY: AlignedPageBuf owns its allocation exclusively.
unsafe impl Send for AlignedPageBuf {}
// SAFETY: shared access only exposes &[u8]; callers layer their own
// synchronization for mutation (the buffer pool's pinning locks).
unsafe impl Sync for AlignedPageBuf {}

/// Geometry and I/O mode, fixed when a database is created.
#[derive(Debug, Clone, Copy)]
pub struct FileManagerConfig {
    pub page_size: usize,
    pub pages_per_segment: usize,
    pub use_direct_io: bool,
}

pub struct FileManager {
    dir: PathBuf,
    config: FileManagerConfig,
    segments: RwLock<Vec<File>>,
    /// Next page id to hand out. Leaf lock: never acquired while holding
    /// another engine lock except frame pinning locks.
    next_page: Mutex<u64>,
}

impl FileManager {
    /// Creates segment files for a fresh database. `initial_pages` decides
    /// how many segments are preallocated up front.
    pub fn create(dir: &Path, config: FileManagerConfig, initial_pages: u64) -> Result<Self> {
        let segment_count = (initial_pages.max(1))
            .div_ceil(config.pages_per_segment as u64)
            .max(1);
        let manager = Self {
            dir: dir.to_path_buf(),
            config,
            segments: RwLock::new(Vec::new()),
            next_page: Mutex::new(0),
        };
        {
            let mut segments = manager.segments.write();
            for index in 0..segment_count {
                segments.push(manager.create_segment(index)?);
            }
        }
        debug!(segments = segment_count, "created segment files");
        Ok(manager)
    }

    /// Opens the segment files of an existing database. `next_page_id` is
    /// the allocation watermark recorded in the manifest.
    pub fn open(dir: &Path, config: FileManagerConfig, next_page_id: u64) -> Result<Self> {
        let mut segments = Vec::new();
        loop {
            let path = dir.join(format!("{}{}", SEGMENT_FILE_PREFIX, segments.len()));
            if !path.exists() {
                break;
            }
            segments.push(Self::open_segment(&path, &config)?);
        }
        ensure!(
            !segments.is_empty(),
            "no segment files found in {}",
            dir.display()
        );
        let capacity = segments.len() as u64 * config.pages_per_segment as u64;
        ensure!(
            next_page_id <= capacity,
            "allocation watermark {} exceeds segment capacity {}",
            next_page_id,
            capacity
        );
        Ok(Self {
            dir: dir.to_path_buf(),
            config,
            segments: RwLock::new(segments),
            next_page: Mutex::new(next_page_id),
        })
    }

    fn create_segment(&self, index: u64) -> Result<File> {
        let path = self
            .dir
            .join(format!("{}{}", SEGMENT_FILE_PREFIX, index));
        let file = self.open_options(true).open(&path).wrap_err_with(|| {
            format!("failed to create segment file {}", path.display())
        })?;
        let len = (self.config.pages_per_segment * self.config.page_size) as u64;
        file.set_len(len)
            .wrap_err_with(|| format!("failed to size segment file {}", path.display()))?;
        Ok(file)
    }

    fn open_segment(path: &Path, config: &FileManagerConfig) -> Result<File> {
        let mut options = OpenOptions::new();
        options.read(true).write(true);
        if config.use_direct_io {
            use std::os::unix::fs::OpenOptionsExt;
            options.custom_flags(libc::O_DIRECT);
        }
        options
            .open(path)
            .wrap_err_with(|| format!("failed to open segment file {}", path.display()))
    }

    fn open_options(&self, create: bool) -> OpenOptions {
        let mut options = OpenOptions::new();
        options.read(true).write(true).create(create);
        if self.config.use_direct_io {
            use std::os::unix::fs::OpenOptionsExt;
            options.custom_flags(libc::O_DIRECT);
        }
        options
    }

    #[inline]
    pub fn page_size(&self) -> usize {
        self.config.page_size
    }

    fn address(&self, page_id: PageId) -> (usize, u64) {
        let per_segment = self.config.pages_per_segment as u64;
        let segment = (page_id.0 / per_segment) as usize;
        let offset = (page_id.0 % per_segment) * self.config.page_size as u64;
        (segment, offset)
    }

    /// Hands out the next physical page id, growing the file set when the
    /// preallocated segments are exhausted.
    pub fn allocate_page(&self) -> Result<PageId> {
        let mut next = self.next_page.lock();
        let id = PageId(*next);
        let per_segment = self.config.pages_per_segment as u64;
        let needed_segments = (id.0 / per_segment + 1) as usize;
        {
            let segments = self.segments.read();
            if segments.len() >= needed_segments {
                *next += 1;
                return Ok(id);
            }
        }
        let mut segments = self.segments.write();
        while segments.len() < needed_segments {
            let file = self.create_segment(segments.len() as u64)?;
            segments.push(file);
        }
        debug!(segment = segments.len() - 1, "extended segment files");
        *next += 1;
        Ok(id)
    }

    /// Allocation watermark: page ids below this have been handed out.
    pub fn next_page_id(&self) -> u64 {
        *self.next_page.lock()
    }

    pub fn segment_count(&self) -> usize {
        self.segments.read().len()
    }

    /// Reads the on-disk page `page_id` into `buf`, zeroing it first.
    pub fn read_page(&self, page_id: PageId, buf: &mut [u8]) -> Result<()> {
        ensure!(page_id.is_valid(), "read of invalid page id");
        ensure!(
            buf.len() == self.config.page_size,
            "page buffer size {} != page size {}",
            buf.len(),
            self.config.page_size
        );
        let (segment, offset) = self.address(page_id);
        let segments = self.segments.read();
        ensure!(
            segment < segments.len(),
            "page {} addresses missing segment {}",
            page_id,
            segment
        );
        buf.fill(0);
        segments[segment]
            .read_exact_at(buf, offset)
            .wrap_err_with(|| format!("failed to read page {page_id}"))
    }

    /// Writes `buf` to the on-disk location of `page_id`.
    pub fn write_page(&self, page_id: PageId, buf: &[u8]) -> Result<()> {
        ensure!(page_id.is_valid(), "write of invalid page id");
        ensure!(
            buf.len() == self.config.page_size,
            "page buffer size {} != page size {}",
            buf.len(),
            self.config.page_size
        );
        let (segment, offset) = self.address(page_id);
        let segments = self.segments.read();
        ensure!(
            segment < segments.len(),
            "page {} addresses missing segment {}",
            page_id,
            segment
        );
        segments[segment]
            .write_all_at(buf, offset)
            .wrap_err_with(|| format!("failed to write page {page_id}"))
    }

    /// Flushes segment file data to stable storage.
    pub fn sync(&self) -> Result<()> {
        let segments = self.segments.read();
        for (index, file) in segments.iter().enumerate() {
            file.sync_data()
                .wrap_err_with(|| format!("failed to sync segment {index}"))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> FileManagerConfig {
        FileManagerConfig {
            page_size: 4096,
            pages_per_segment: 4,
            use_direct_io: false,
        }
    }

    #[test]
    fn create_preallocates_segments() {
        let dir = tempfile::tempdir().unwrap();
        let manager = FileManager::create(dir.path(), test_config(), 6).unwrap();
        assert_eq!(manager.segment_count(), 2);
        let len = std::fs::metadata(dir.path().join("segment-0")).unwrap().len();
        assert_eq!(len, 4 * 4096);
    }

    #[test]
    fn page_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let manager = FileManager::create(dir.path(), test_config(), 4).unwrap();
        let id = manager.allocate_page().unwrap();

        let mut out = AlignedPageBuf::new_zeroed(4096);
        out.as_mut_slice()[..5].copy_from_slice(b"hello");
        manager.write_page(id, out.as_slice()).unwrap();

        let mut back = AlignedPageBuf::new_zeroed(4096);
        back.as_mut_slice().fill(0xee);
        manager.read_page(id, back.as_mut_slice()).unwrap();
        assert_eq!(&back.as_slice()[..5], b"hello");
        assert!(back.as_slice()[5..].iter().all(|&b| b == 0));
    }

    #[test]
    fn allocation_crosses_segment_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let manager = FileManager::create(dir.path(), test_config(), 1).unwrap();
        assert_eq!(manager.segment_count(), 1);
        for expected in 0..5u64 {
            assert_eq!(manager.allocate_page().unwrap(), PageId(expected));
        }
        // Allocating page 4 created segment-1.
        assert_eq!(manager.segment_count(), 2);
        assert!(dir.path().join("segment-1").exists());
    }

    #[test]
    fn reopen_resumes_watermark() {
        let dir = tempfile::tempdir().unwrap();
        {
            let manager = FileManager::create(dir.path(), test_config(), 4).unwrap();
            for _ in 0..3 {
                manager.allocate_page().unwrap();
            }
        }
        let manager = FileManager::open(dir.path(), test_config(), 3).unwrap();
        assert_eq!(manager.allocate_page().unwrap(), PageId(3));
    }

    #[test]
    fn read_zeroes_destination_first() {
        let dir = tempfile::tempdir().unwrap();
        let manager = FileManager::create(dir.path(), test_config(), 4).unwrap();
        let id = manager.allocate_page().unwrap();
        let mut buf = AlignedPageBuf::new_zeroed(4096);
        buf.as_mut_slice().fill(0x77);
        manager.read_page(id, buf.as_mut_slice()).unwrap();
        assert!(buf.as_slice().iter().all(|&b| b == 0));
    }
}
