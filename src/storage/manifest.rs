//! # Manifest
//!
//! The manifest pins down the geometry a database was created with
//! (page size, pages per segment) and the page-allocation watermark.
//! Everything else is reconstructed from the self-describing pages, so
//! the manifest stays a single small fixed-layout file.

use std::fs;
use std::path::Path;

use eyre::{ensure, Result, WrapErr};
use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::MANIFEST_FILE_NAME;

use super::parse_zerocopy;

pub const MANIFEST_MAGIC: &[u8; 16] = b"MerlinDB Meta\x00\x00\x00";
pub const MANIFEST_VERSION: u32 = 1;

#[repr(C)]
#[derive(Debug, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct ManifestHeader {
    magic: [u8; 16],
    version: U32,
    page_size: U32,
    pages_per_segment: U32,
    segment_count: U32,
    next_page_id: U64,
}

/// In-memory manifest state, written back whenever the allocation
/// watermark moves durably (flush end, close).
#[derive(Debug, Clone, Copy)]
pub struct Manifest {
    pub page_size: usize,
    pub pages_per_segment: usize,
    pub segment_count: usize,
    pub next_page_id: u64,
}

impl Manifest {
    pub fn exists(dir: &Path) -> bool {
        dir.join(MANIFEST_FILE_NAME).exists()
    }

    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(MANIFEST_FILE_NAME);
        let bytes = fs::read(&path)
            .wrap_err_with(|| format!("failed to read manifest at {}", path.display()))?;
        let header = parse_zerocopy::<ManifestHeader>(&bytes, "ManifestHeader")?;
        ensure!(&header.magic == MANIFEST_MAGIC, "bad manifest magic");
        ensure!(
            header.version.get() == MANIFEST_VERSION,
            "unsupported manifest version {}",
            header.version.get()
        );
        Ok(Self {
            page_size: header.page_size.get() as usize,
            pages_per_segment: header.pages_per_segment.get() as usize,
            segment_count: header.segment_count.get() as usize,
            next_page_id: header.next_page_id.get(),
        })
    }

    pub fn store(&self, dir: &Path) -> Result<()> {
        let header = ManifestHeader {
            magic: *MANIFEST_MAGIC,
            version: U32::new(MANIFEST_VERSION),
            page_size: U32::new(self.page_size as u32),
            pages_per_segment: U32::new(self.pages_per_segment as u32),
            segment_count: U32::new(self.segment_count as u32),
            next_page_id: U64::new(self.next_page_id),
        };
        let path = dir.join(MANIFEST_FILE_NAME);
        fs::write(&path, header.as_bytes())
            .wrap_err_with(|| format!("failed to write manifest at {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = Manifest {
            page_size: 65536,
            pages_per_segment: 1024,
            segment_count: 2,
            next_page_id: 1234,
        };
        manifest.store(dir.path()).unwrap();
        assert!(Manifest::exists(dir.path()));

        let loaded = Manifest::load(dir.path()).unwrap();
        assert_eq!(loaded.page_size, 65536);
        assert_eq!(loaded.pages_per_segment, 1024);
        assert_eq!(loaded.segment_count, 2);
        assert_eq!(loaded.next_page_id, 1234);
    }

    #[test]
    fn load_rejects_corrupt_magic() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(MANIFEST_FILE_NAME), vec![0u8; 40]).unwrap();
        assert!(Manifest::load(dir.path()).is_err());
    }
}
