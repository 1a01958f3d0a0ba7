//! # Storage Layer
//!
//! The storage layer owns everything below the learned model: the page
//! codec, the segment files, the manifest, and the buffer pool that
//! mediates every page access.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │      Flush / Read / Reorg paths      │
//! ├─────────────────────────────────────┤
//! │   BufferPool (frames, fix/unfix)     │
//! ├─────────────────────────────────────┤
//! │   Page codec (slotted, sorted)       │
//! ├─────────────────────────────────────┤
//! │   FileManager (segment files)        │
//! └─────────────────────────────────────┘
//! ```
//!
//! ## File Layout
//!
//! ```text
//! database_dir/
//! ├── MANIFEST        # page size, segment geometry, allocation watermark
//! ├── segment-0       # pages_per_segment × page_size bytes
//! ├── segment-1
//! └── ...
//! ```
//!
//! A physical page id is a dense 64-bit index: page `i` lives in segment
//! `i / pages_per_segment` at offset `(i % pages_per_segment) * page_size`.
//! Pages are self-describing (magic, boundaries, overflow link), so the
//! manifest only records geometry and the allocation watermark; the
//! learned model is rebuilt from the page headers on reopen.
//!
//! ## Safety Model
//!
//! Page bytes are only reachable through a fixed buffer pool frame. The
//! frame's pinning lock enforces reader/writer exclusion and fixing
//! prevents eviction, so `&[u8]`/`&mut [u8]` views handed out by a
//! `FixedFrame` are valid for exactly as long as the fix is held.

mod buffer_pool;
mod file_manager;
mod manifest;
pub mod page;

pub use buffer_pool::{BufferPool, FixedFrame};
pub use file_manager::{AlignedPageBuf, FileManager, FileManagerConfig};
pub use manifest::Manifest;

use eyre::{ensure, Result};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Physical page id: a dense index into the segment files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PageId(pub u64);

impl PageId {
    /// Sentinel for "no page" (end of an overflow chain).
    pub const INVALID: PageId = PageId(u64::MAX);

    #[inline]
    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }
}

impl std::fmt::Display for PageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_valid() {
            write!(f, "p{}", self.0)
        } else {
            f.write_str("p-invalid")
        }
    }
}

/// Parses a zerocopy struct from a byte slice with size validation.
#[inline]
pub(crate) fn parse_zerocopy<'a, T: FromBytes + KnownLayout + Immutable>(
    bytes: &'a [u8],
    type_name: &str,
) -> Result<&'a T> {
    let size = std::mem::size_of::<T>();
    ensure!(
        bytes.len() >= size,
        "buffer too small for {}: {} < {}",
        type_name,
        bytes.len(),
        size
    );
    T::ref_from_bytes(&bytes[..size])
        .map_err(|e| eyre::eyre!("failed to parse {}: {:?}", type_name, e))
}

/// Parses a mutable zerocopy struct from a byte slice with size validation.
#[inline]
pub(crate) fn parse_zerocopy_mut<'a, T: FromBytes + KnownLayout + IntoBytes>(
    bytes: &'a mut [u8],
    type_name: &str,
) -> Result<&'a mut T> {
    let size = std::mem::size_of::<T>();
    ensure!(
        bytes.len() >= size,
        "buffer too small for {}: {} < {}",
        type_name,
        bytes.len(),
        size
    );
    T::mut_from_bytes(&mut bytes[..size])
        .map_err(|e| eyre::eyre!("failed to parse {}: {:?}", type_name, e))
}
