//! # Page Codec
//!
//! Every page is a fixed-size block holding a sorted run of records for
//! one key interval `[lower, upper)`. Pages are self-describing: the
//! header carries the boundary keys, the overflow link, and the slot
//! directory geometry, so the whole database can be rebuilt from the
//! segment files alone.
//!
//! ## Page Layout
//!
//! ```text
//! Offset                 Content
//! ------                 -------
//! 0                      Header (32 bytes)
//! 32                     Lower boundary key (lower_len bytes)
//! 32 + lower_len         Upper boundary key (upper_len bytes, absent
//!                        when the interval is right-unbounded)
//! boundary_end           Slot directory (12 bytes per record, sorted
//!                        by key, grows forward)
//! ...                    Free space
//! free_end               Cell area (key and value bytes, grows
//!                        backward from the end of the page)
//! page end
//! ```
//!
//! ## Header Layout (32 bytes)
//!
//! ```text
//! Offset  Size  Field         Description
//! ------  ----  ------------  -------------------------------------
//! 0       4     magic         Page magic
//! 4       2     flags         Bit 0: page was created as an overflow
//! 6       2     record_count  Number of live records
//! 8       4     free_end      Offset where the cell area begins
//! 12      4     frag_bytes    Dead cell bytes (from deletes/updates)
//! 16      8     overflow      Next chain link, u64::MAX when none
//! 24      2     lower_len     Lower boundary length
//! 26      2     upper_len     Upper boundary length, 0xFFFF = +inf
//! 28      4     reserved
//! ```
//!
//! Header and slot fields are little-endian byteorder types, so views
//! parse at any offset; the slot directory starts right after the
//! variable-length boundary keys.
//!
//! ## Slot Directory
//!
//! Each slot stores a 4-byte key prefix for fast comparisons, the cell
//! offset, and the key/value lengths:
//!
//! ```text
//! +--------+--------+--------+--------+------------+--------+--------+
//! |          prefix (4 bytes)         | offset (4) | klen(2)| vlen(2)|
//! +--------+--------+--------+--------+------------+--------+--------+
//! ```
//!
//! Lookups binary-search the slot directory, comparing prefixes as
//! big-endian u32 first and falling back to a full key comparison only
//! on prefix equality. Padding short keys with zeroes can make two
//! prefixes equal but never reorders them, so the fast path is safe.
//!
//! ## Space Reclamation
//!
//! Deletes remove the slot and account the dead cell bytes in
//! `frag_bytes`; same-size-or-smaller updates overwrite the cell in
//! place. When an insert does not fit the contiguous free span but fits
//! free plus fragmented space, the cell area is compacted first.

use eyre::{bail, ensure, Result};
use zerocopy::little_endian::{U16, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::{MAX_KEY_SIZE, PAGE_HEADER_SIZE, SLOT_SIZE};

use super::{parse_zerocopy, parse_zerocopy_mut, PageId};

pub const PAGE_MAGIC: u32 = 0x4d_4c_50_47;

const FLAG_OVERFLOW: u16 = 1 << 0;
const UPPER_UNBOUNDED: u16 = u16::MAX;

#[repr(C)]
#[derive(Debug, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct PageHeader {
    magic: U32,
    flags: U16,
    record_count: U16,
    free_end: U32,
    frag_bytes: U32,
    overflow: U64,
    lower_len: U16,
    upper_len: U16,
    reserved: [u8; 4],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct Slot {
    prefix: [u8; 4],
    offset: U32,
    key_len: U16,
    value_len: U16,
}

impl Slot {
    fn new(key: &[u8], offset: u32, value_len: u16) -> Self {
        Self {
            prefix: extract_prefix(key),
            offset: U32::new(offset),
            key_len: U16::new(key.len() as u16),
            value_len: U16::new(value_len),
        }
    }

    fn cell_len(&self) -> usize {
        self.key_len.get() as usize + self.value_len.get() as usize
    }
}

fn extract_prefix(key: &[u8]) -> [u8; 4] {
    let mut prefix = [0u8; 4];
    let len = key.len().min(4);
    prefix[..len].copy_from_slice(&key[..len]);
    prefix
}

/// Outcome of a sorted insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutResult {
    Done,
    /// Not enough free space even after compaction; the caller spills
    /// into an overflow page.
    Full,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchResult {
    Found(usize),
    NotFound(usize),
}

/// Initializes `data` as a blank page for the interval `[lower, upper)`.
/// `upper = None` means the interval is right-unbounded.
pub fn init(data: &mut [u8], lower: &[u8], upper: Option<&[u8]>, is_overflow: bool) -> Result<()> {
    ensure!(lower.len() <= MAX_KEY_SIZE, "lower boundary too long: {}", lower.len());
    if let Some(upper) = upper {
        ensure!(upper.len() <= MAX_KEY_SIZE, "upper boundary too long: {}", upper.len());
        ensure!(lower < upper, "boundary keys out of order");
    }

    data.fill(0);
    let page_len = data.len() as u32;
    let upper_len = upper.map_or(UPPER_UNBOUNDED, |u| u.len() as u16);

    let header = parse_zerocopy_mut::<PageHeader>(data, "PageHeader")?;
    header.magic = U32::new(PAGE_MAGIC);
    header.flags = U16::new(if is_overflow { FLAG_OVERFLOW } else { 0 });
    header.record_count = U16::new(0);
    header.free_end = U32::new(page_len);
    header.frag_bytes = U32::new(0);
    header.overflow = U64::new(PageId::INVALID.0);
    header.lower_len = U16::new(lower.len() as u16);
    header.upper_len = U16::new(upper_len);
    header.reserved = [0; 4];

    let mut at = PAGE_HEADER_SIZE;
    data[at..at + lower.len()].copy_from_slice(lower);
    at += lower.len();
    if let Some(upper) = upper {
        data[at..at + upper.len()].copy_from_slice(upper);
    }
    Ok(())
}

/// Structural validation of a page image. Detected violations surface as
/// errors; the page is never silently repaired.
pub fn validate(data: &[u8]) -> Result<()> {
    let header = parse_zerocopy::<PageHeader>(data, "PageHeader")?;
    ensure!(
        header.magic.get() == PAGE_MAGIC,
        "bad page magic: {:#x}",
        header.magic.get()
    );
    ensure!(
        header.lower_len.get() as usize <= MAX_KEY_SIZE,
        "lower boundary length {} exceeds limit",
        header.lower_len.get()
    );
    ensure!(
        header.upper_len.get() == UPPER_UNBOUNDED
            || header.upper_len.get() as usize <= MAX_KEY_SIZE,
        "upper boundary length {} exceeds limit",
        header.upper_len.get()
    );

    let upper_bytes = if header.upper_len.get() == UPPER_UNBOUNDED {
        0
    } else {
        header.upper_len.get() as usize
    };
    let slots_start = PAGE_HEADER_SIZE + header.lower_len.get() as usize + upper_bytes;
    let slots_end = slots_start + header.record_count.get() as usize * SLOT_SIZE;
    ensure!(
        header.free_end.get() as usize <= data.len()
            && slots_end <= header.free_end.get() as usize,
        "slot directory overlaps cell area: slots_end={} free_end={} len={}",
        slots_end,
        header.free_end.get(),
        data.len()
    );
    Ok(())
}

/// Read-only view of a page image.
#[derive(Clone, Copy)]
pub struct Page<'a> {
    data: &'a [u8],
}

impl<'a> Page<'a> {
    pub fn from_bytes(data: &'a [u8]) -> Result<Self> {
        let header = parse_zerocopy::<PageHeader>(data, "PageHeader")?;
        ensure!(
            header.magic.get() == PAGE_MAGIC,
            "bad page magic: {:#x}",
            header.magic.get()
        );
        Ok(Self { data })
    }

    fn header(&self) -> &'a PageHeader {
        // Checked in from_bytes.
        parse_zerocopy::<PageHeader>(self.data, "PageHeader").unwrap()
    }

    pub fn record_count(&self) -> usize {
        self.header().record_count.get() as usize
    }

    pub fn frag_bytes(&self) -> usize {
        self.header().frag_bytes.get() as usize
    }

    pub fn is_overflow_page(&self) -> bool {
        self.header().flags.get() & FLAG_OVERFLOW != 0
    }

    pub fn lower(&self) -> &'a [u8] {
        let header = self.header();
        &self.data[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + header.lower_len.get() as usize]
    }

    /// The upper boundary, or `None` when the interval is right-unbounded.
    pub fn upper(&self) -> Option<&'a [u8]> {
        let header = self.header();
        if header.upper_len.get() == UPPER_UNBOUNDED {
            return None;
        }
        let start = PAGE_HEADER_SIZE + header.lower_len.get() as usize;
        Some(&self.data[start..start + header.upper_len.get() as usize])
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        if key < self.lower() {
            return false;
        }
        match self.upper() {
            Some(upper) => key < upper,
            None => true,
        }
    }

    pub fn overflow(&self) -> Option<PageId> {
        let id = PageId(self.header().overflow.get());
        id.is_valid().then_some(id)
    }

    fn boundary_end(&self) -> usize {
        let header = self.header();
        let upper_bytes = if header.upper_len.get() == UPPER_UNBOUNDED {
            0
        } else {
            header.upper_len.get() as usize
        };
        PAGE_HEADER_SIZE + header.lower_len.get() as usize + upper_bytes
    }

    pub fn free_space(&self) -> usize {
        let slots_end = self.boundary_end() + self.record_count() * SLOT_SIZE;
        self.header().free_end.get() as usize - slots_end
    }

    fn slot_at(&self, index: usize) -> Result<&'a Slot> {
        ensure!(
            index < self.record_count(),
            "slot index {} out of bounds (record_count={})",
            index,
            self.record_count()
        );
        let offset = self.boundary_end() + index * SLOT_SIZE;
        parse_zerocopy::<Slot>(&self.data[offset..offset + SLOT_SIZE], "Slot")
    }

    pub fn key_at(&self, index: usize) -> Result<&'a [u8]> {
        let slot = self.slot_at(index)?;
        let start = slot.offset.get() as usize;
        let end = start + slot.key_len.get() as usize;
        ensure!(end <= self.data.len(), "key extends beyond page: offset={}", start);
        Ok(&self.data[start..end])
    }

    pub fn value_at(&self, index: usize) -> Result<&'a [u8]> {
        let slot = self.slot_at(index)?;
        let start = slot.offset.get() as usize + slot.key_len.get() as usize;
        let end = start + slot.value_len.get() as usize;
        ensure!(end <= self.data.len(), "value extends beyond page: offset={}", start);
        Ok(&self.data[start..end])
    }

    /// Binary search over the slot directory. Prefixes are compared as
    /// big-endian u32 first; equal prefixes fall back to the full key.
    pub fn find_key(&self, key: &[u8]) -> Result<SearchResult> {
        let target = u32::from_be_bytes(extract_prefix(key));
        let mut lo = 0usize;
        let mut hi = self.record_count();
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let slot = self.slot_at(mid)?;
            let prefix = u32::from_be_bytes(slot.prefix);
            let ordering = if prefix != target {
                prefix.cmp(&target)
            } else {
                self.key_at(mid)?.cmp(key)
            };
            match ordering {
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Greater => hi = mid,
                std::cmp::Ordering::Equal => return Ok(SearchResult::Found(mid)),
            }
        }
        Ok(SearchResult::NotFound(lo))
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<&'a [u8]>> {
        match self.find_key(key)? {
            SearchResult::Found(index) => Ok(Some(self.value_at(index)?)),
            SearchResult::NotFound(_) => Ok(None),
        }
    }

    /// Ascending iterator over the live records.
    pub fn iter(&self) -> PageIter<'a> {
        PageIter {
            page: *self,
            index: 0,
        }
    }
}

pub struct PageIter<'a> {
    page: Page<'a>,
    index: usize,
}

impl<'a> Iterator for PageIter<'a> {
    type Item = (&'a [u8], &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        if self.index >= self.page.record_count() {
            return None;
        }
        let key = self.page.key_at(self.index).ok()?;
        let value = self.page.value_at(self.index).ok()?;
        self.index += 1;
        Some((key, value))
    }
}

/// Mutable view of a page image.
pub struct PageMut<'a> {
    data: &'a mut [u8],
}

impl<'a> PageMut<'a> {
    pub fn from_bytes(data: &'a mut [u8]) -> Result<Self> {
        let header = parse_zerocopy::<PageHeader>(data, "PageHeader")?;
        ensure!(
            header.magic.get() == PAGE_MAGIC,
            "bad page magic: {:#x}",
            header.magic.get()
        );
        Ok(Self { data })
    }

    pub fn as_page(&self) -> Page<'_> {
        Page { data: &*self.data }
    }

    fn header_mut(&mut self) -> &mut PageHeader {
        // Checked in from_bytes.
        parse_zerocopy_mut::<PageHeader>(self.data, "PageHeader").unwrap()
    }

    pub fn set_overflow(&mut self, next: Option<PageId>) {
        self.header_mut().overflow = U64::new(next.unwrap_or(PageId::INVALID).0);
    }

    fn write_slot(&mut self, index: usize, slot: Slot) {
        let offset = self.as_page().boundary_end() + index * SLOT_SIZE;
        self.data[offset..offset + SLOT_SIZE].copy_from_slice(slot.as_bytes());
    }

    /// Sorted insert of `(key, value)`. An existing key is overwritten in
    /// place when the new value fits its cell; otherwise the old record
    /// is removed and the pair reinserted. Returns `Full` when the page
    /// cannot hold the record.
    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<PutResult> {
        ensure!(!key.is_empty(), "record keys must not be empty");
        ensure!(key.len() <= MAX_KEY_SIZE, "key too long: {} bytes", key.len());
        ensure!(
            value.len() <= u16::MAX as usize,
            "value too long: {} bytes",
            value.len()
        );

        match self.as_page().find_key(key)? {
            SearchResult::Found(index) => {
                let slot = *self.as_page().slot_at(index)?;
                if value.len() <= slot.value_len.get() as usize {
                    let start = slot.offset.get() as usize + slot.key_len.get() as usize;
                    self.data[start..start + value.len()].copy_from_slice(value);
                    let reclaimed = slot.value_len.get() as usize - value.len();
                    let mut new_slot = slot;
                    new_slot.value_len = U16::new(value.len() as u16);
                    self.write_slot(index, new_slot);
                    let header = self.header_mut();
                    header.frag_bytes = U32::new(header.frag_bytes.get() + reclaimed as u32);
                    return Ok(PutResult::Done);
                }
                self.remove_at(index)?;
                self.insert_at(index, key, value)
            }
            SearchResult::NotFound(index) => self.insert_at(index, key, value),
        }
    }

    /// Physically removes `key`. Returns `false` when the key is absent.
    pub fn delete(&mut self, key: &[u8]) -> Result<bool> {
        match self.as_page().find_key(key)? {
            SearchResult::Found(index) => {
                self.remove_at(index)?;
                Ok(true)
            }
            SearchResult::NotFound(_) => Ok(false),
        }
    }

    fn insert_at(&mut self, index: usize, key: &[u8], value: &[u8]) -> Result<PutResult> {
        let need = SLOT_SIZE + key.len() + value.len();
        if self.as_page().free_space() < need {
            if self.as_page().free_space() + self.as_page().frag_bytes() >= need {
                self.compact()?;
            } else {
                return Ok(PutResult::Full);
            }
        }
        ensure!(
            self.as_page().free_space() >= need,
            "page compaction did not reclaim enough space for {} bytes",
            need
        );

        let cell_len = key.len() + value.len();
        let cell_start = self.as_page().header().free_end.get() as usize - cell_len;
        self.data[cell_start..cell_start + key.len()].copy_from_slice(key);
        self.data[cell_start + key.len()..cell_start + cell_len].copy_from_slice(value);

        // Shift the slot directory right to open a gap at `index`.
        let count = self.as_page().record_count();
        let slots_start = self.as_page().boundary_end();
        let gap = slots_start + index * SLOT_SIZE;
        let slots_end = slots_start + count * SLOT_SIZE;
        self.data.copy_within(gap..slots_end, gap + SLOT_SIZE);

        self.write_slot(index, Slot::new(key, cell_start as u32, value.len() as u16));
        let header = self.header_mut();
        header.free_end = U32::new(cell_start as u32);
        header.record_count = U16::new(header.record_count.get() + 1);
        Ok(PutResult::Done)
    }

    fn remove_at(&mut self, index: usize) -> Result<()> {
        let slot = *self.as_page().slot_at(index)?;
        let count = self.as_page().record_count();
        let slots_start = self.as_page().boundary_end();
        let gap = slots_start + index * SLOT_SIZE;
        let slots_end = slots_start + count * SLOT_SIZE;
        self.data.copy_within(gap + SLOT_SIZE..slots_end, gap);

        let header = self.header_mut();
        header.record_count = U16::new(header.record_count.get() - 1);
        if slot.offset.get() == header.free_end.get() {
            // The cell sits at the edge of the cell area; reclaim it
            // directly instead of leaving a fragment.
            header.free_end = U32::new(header.free_end.get() + slot.cell_len() as u32);
        } else {
            header.frag_bytes = U32::new(header.frag_bytes.get() + slot.cell_len() as u32);
        }
        Ok(())
    }

    /// Rewrites the cell area contiguously, folding fragmented bytes back
    /// into the free span.
    fn compact(&mut self) -> Result<()> {
        let count = self.as_page().record_count();
        let page_len = self.data.len();
        let mut scratch = vec![0u8; page_len];
        let mut new_free_end = page_len;

        let mut slots = Vec::with_capacity(count);
        for index in 0..count {
            let slot = *self.as_page().slot_at(index)?;
            let start = slot.offset.get() as usize;
            let cell_len = slot.cell_len();
            new_free_end -= cell_len;
            scratch[new_free_end..new_free_end + cell_len]
                .copy_from_slice(&self.data[start..start + cell_len]);
            let mut moved = slot;
            moved.offset = U32::new(new_free_end as u32);
            slots.push(moved);
        }

        self.data[new_free_end..].copy_from_slice(&scratch[new_free_end..]);
        for (index, slot) in slots.into_iter().enumerate() {
            self.write_slot(index, slot);
        }
        let header = self.header_mut();
        header.free_end = U32::new(new_free_end as u32);
        header.frag_bytes = U32::new(0);
        Ok(())
    }
}

/// Largest record (key + value) a page of `page_size` bytes is
/// guaranteed to hold, accounting for the worst-case boundary area.
pub fn max_record_size(page_size: usize) -> usize {
    page_size - PAGE_HEADER_SIZE - 2 * MAX_KEY_SIZE - SLOT_SIZE
}

/// Verifies that a record fits an empty page; spilling into overflow
/// pages cannot help a record that exceeds this.
pub fn check_record_size(page_size: usize, key: &[u8], value: &[u8]) -> Result<()> {
    ensure!(!key.is_empty(), "record keys must not be empty");
    ensure!(key.len() <= MAX_KEY_SIZE, "key too long: {} bytes", key.len());
    if key.len() + value.len() > max_record_size(page_size) {
        bail!(
            "record of {} bytes exceeds the {}-byte page capacity",
            key.len() + value.len(),
            max_record_size(page_size)
        );
    }
    Ok(())
}
