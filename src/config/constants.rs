//! # Engine Constants
//!
//! All numeric configuration values live here, grouped with the values
//! they depend on.
//!
//! ```text
//! DEFAULT_PAGE_SIZE (65536 bytes)
//!       │
//!       ├─> PAGE_HEADER_SIZE (32 bytes, fixed)
//!       │
//!       ├─> SLOT_SIZE (12 bytes per record)
//!       │
//!       └─> MAX_KEY_SIZE (1024 bytes)
//!             A page stores two boundary keys in addition to its
//!             records, so MAX_KEY_SIZE * 2 + PAGE_HEADER_SIZE +
//!             SLOT_SIZE must leave room for at least one record on
//!             every page size >= MIN_PAGE_SIZE.
//!
//! DEFAULT_BUFFER_POOL_SIZE (64 MiB)
//!       │
//!       └─> must hold at least one frame; chain operations fix every
//!           page of a chain at once, so pools sized near the minimum
//!           only work while chains stay short.
//!
//! SEQUENCE_BITS (56)
//!       │
//!       └─> the entry kind is packed into the low 8 bits of the
//!           sequence tag, capping sequences at 2^56 - 1.
//! ```

/// Default page size: 64 KiB.
pub const DEFAULT_PAGE_SIZE: usize = 64 * 1024;

/// Smallest supported page size.
pub const MIN_PAGE_SIZE: usize = 4 * 1024;

/// Fixed page header size (see `storage::page`).
pub const PAGE_HEADER_SIZE: usize = 32;

/// Size of one slot directory entry.
pub const SLOT_SIZE: usize = 12;

/// Maximum key length in bytes. Boundary keys are drawn from record
/// keys, so this also bounds the boundary area of a page.
pub const MAX_KEY_SIZE: usize = 1024;

/// Default number of pages per segment file.
pub const DEFAULT_PAGES_PER_SEGMENT: usize = 1024;

/// Default buffer pool size in bytes.
pub const DEFAULT_BUFFER_POOL_SIZE: usize = 64 * 1024 * 1024;

/// Default write buffer budget in MiB.
pub const DEFAULT_MEMTABLE_SIZE_MIB: usize = 64;

/// Default background worker count.
pub const DEFAULT_BG_THREADS: usize = 4;

/// Alignment for page buffers; satisfies O_DIRECT on every filesystem
/// the engine targets.
pub const PAGE_BUFFER_ALIGN: usize = 4096;

/// Number of bits in a record sequence number.
pub const SEQUENCE_BITS: u32 = 56;

/// Largest assignable sequence number.
pub const MAX_SEQUENCE: u64 = (1 << SEQUENCE_BITS) - 1;

/// Segment files are named `segment-<n>`.
pub const SEGMENT_FILE_PREFIX: &str = "segment-";

/// Manifest file name inside the database directory.
pub const MANIFEST_FILE_NAME: &str = "MANIFEST";

/// Per-entry bookkeeping charged against the write buffer budget in
/// addition to key and value bytes.
pub const MEMTABLE_ENTRY_OVERHEAD: usize = 64;

const _: () = assert!(MIN_PAGE_SIZE > PAGE_HEADER_SIZE + 2 * MAX_KEY_SIZE + SLOT_SIZE);
const _: () = assert!(DEFAULT_BUFFER_POOL_SIZE >= DEFAULT_PAGE_SIZE);
