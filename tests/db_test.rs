//! End-to-end tests against the public API: open modes, the
//! write/flush/read cycle, deferred I/O observed through segment file
//! mtimes, and reopening from disk.

use std::path::Path;
use std::time::SystemTime;

use merlindb::encoding::encode_u64;
use merlindb::{Database, KeyHints, Options};

const VALUE: &[u8] = b"Hello world!";

fn base_options() -> Options {
    Options {
        key_hints: KeyHints {
            num_keys: 10,
            ..KeyHints::default()
        },
        ..Options::default()
    }
}

fn segment_mtime(dir: &Path) -> SystemTime {
    std::fs::metadata(dir.join("segment-0"))
        .expect("segment-0 exists")
        .modified()
        .expect("mtime supported")
}

#[test]
fn create() {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(base_options(), dir.path()).unwrap();
    drop(db);
}

#[test]
fn create_if_missing_disabled() {
    let dir = tempfile::tempdir().unwrap();
    let options = Options {
        create_if_missing: false,
        ..base_options()
    };
    let err = Database::open(options, dir.path()).unwrap_err();
    assert!(err.to_string().contains("create_if_missing"));
}

#[test]
fn error_if_exists_enabled() {
    let dir = tempfile::tempdir().unwrap();
    let options = Options {
        error_if_exists: true,
        ..base_options()
    };

    let db = Database::open(options.clone(), dir.path()).unwrap();
    drop(db);

    let err = Database::open(options, dir.path()).unwrap_err();
    assert!(err.to_string().contains("already exists"));
}

#[test]
fn write_flush_read() {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(base_options(), dir.path()).unwrap();

    let key = encode_u64(1);
    db.put(&key, VALUE).unwrap();

    // Served from the write buffer.
    assert_eq!(db.get(&key).unwrap(), Some(VALUE.to_vec()));

    db.flush_memtable(true).unwrap();

    // Served from the page layer.
    assert_eq!(db.get(&key).unwrap(), Some(VALUE.to_vec()));
}

#[test]
fn write_then_delete() {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(base_options(), dir.path()).unwrap();

    // 1. Everything stays in the write buffer.
    let key1 = encode_u64(1);
    db.put(&key1, VALUE).unwrap();
    assert_eq!(db.get(&key1).unwrap(), Some(VALUE.to_vec()));
    db.delete(&key1).unwrap();
    assert_eq!(db.get(&key1).unwrap(), None);

    // 2. Only the write is flushed.
    let key2 = encode_u64(2);
    db.put(&key2, VALUE).unwrap();
    assert_eq!(db.get(&key2).unwrap(), Some(VALUE.to_vec()));
    db.flush_memtable(true).unwrap();
    db.delete(&key2).unwrap();
    assert_eq!(db.get(&key2).unwrap(), None);

    // 3. Write and delete flushed individually.
    let key3 = encode_u64(3);
    db.put(&key3, VALUE).unwrap();
    assert_eq!(db.get(&key3).unwrap(), Some(VALUE.to_vec()));
    db.flush_memtable(true).unwrap();
    db.delete(&key3).unwrap();
    db.flush_memtable(true).unwrap();
    assert_eq!(db.get(&key3).unwrap(), None);

    // 4. Write and delete flushed together.
    let key4 = encode_u64(4);
    db.put(&key4, VALUE).unwrap();
    assert_eq!(db.get(&key4).unwrap(), Some(VALUE.to_vec()));
    db.delete(&key4).unwrap();
    db.flush_memtable(true).unwrap();
    assert_eq!(db.get(&key4).unwrap(), None);
}

fn deferral_options(max_deferrals: usize) -> Options {
    Options {
        key_hints: KeyHints {
            num_keys: 10,
            record_size: 16 * 1024, // 4 records per 64 KiB page
            page_fill_pct: 100,
            ..KeyHints::default()
        },
        deferred_io_min_entries: 2,
        deferred_io_max_deferrals: max_deferrals,
        buffer_pool_size: 64 * 1024, // a single page
        ..Options::default()
    }
}

#[test]
fn defer_by_entries() {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(deferral_options(4), dir.path()).unwrap();

    db.put(&encode_u64(1), VALUE).unwrap();
    let before = segment_mtime(dir.path());

    // One entry is below the threshold; the flush defers.
    db.flush_memtable(false).unwrap();

    // Evict the target page by reading something else.
    assert_eq!(db.get(&encode_u64(9)).unwrap(), None);
    assert_eq!(segment_mtime(dir.path()), before);

    // A second entry in the same interval crosses the threshold.
    db.put(&encode_u64(0), VALUE).unwrap();
    db.flush_memtable(false).unwrap();

    assert_eq!(db.get(&encode_u64(9)).unwrap(), None);
    assert_ne!(segment_mtime(dir.path()), before);

    assert_eq!(db.get(&encode_u64(1)).unwrap(), Some(VALUE.to_vec()));
    assert_eq!(db.get(&encode_u64(0)).unwrap(), Some(VALUE.to_vec()));
}

#[test]
fn defer_by_attempts() {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(deferral_options(1), dir.path()).unwrap();

    db.put(&encode_u64(1), VALUE).unwrap();
    let before = segment_mtime(dir.path());

    // First flush defers.
    db.flush_memtable(false).unwrap();
    assert_eq!(db.get(&encode_u64(9)).unwrap(), None);
    assert_eq!(segment_mtime(dir.path()), before);

    // The deferral allowance is used up; the second flush writes.
    db.flush_memtable(false).unwrap();
    assert_eq!(db.get(&encode_u64(9)).unwrap(), None);
    assert_ne!(segment_mtime(dir.path()), before);

    assert_eq!(db.get(&encode_u64(1)).unwrap(), Some(VALUE.to_vec()));
}

#[test]
fn force_flush_never_defers() {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(deferral_options(4), dir.path()).unwrap();

    db.put(&encode_u64(1), VALUE).unwrap();
    let before = segment_mtime(dir.path());

    db.flush_memtable(true).unwrap();
    assert_ne!(segment_mtime(dir.path()), before);
    assert_eq!(db.get(&encode_u64(1)).unwrap(), Some(VALUE.to_vec()));
}

#[test]
fn write_reopen_read() {
    let dir = tempfile::tempdir().unwrap();
    let options = Options {
        key_hints: KeyHints {
            num_keys: 10,
            record_size: 8 + VALUE.len(),
            ..KeyHints::default()
        },
        ..Options::default()
    };

    let db = Database::open(options.clone(), dir.path()).unwrap();
    for key in 0..10u64 {
        db.put(&encode_u64(key), VALUE).unwrap();
    }
    for key in 0..10u64 {
        assert_eq!(db.get(&encode_u64(key)).unwrap(), Some(VALUE.to_vec()));
    }
    drop(db);

    let reopened = Database::open(
        Options {
            create_if_missing: false,
            ..options
        },
        dir.path(),
    )
    .unwrap();
    for key in 0..10u64 {
        assert_eq!(
            reopened.get(&encode_u64(key)).unwrap(),
            Some(VALUE.to_vec()),
            "key {key}"
        );
    }
}

#[test]
fn overwrite_before_and_after_flush() {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(base_options(), dir.path()).unwrap();

    let key = encode_u64(5);
    db.put(&key, b"first").unwrap();
    db.put(&key, b"second").unwrap();
    assert_eq!(db.get(&key).unwrap(), Some(b"second".to_vec()));

    db.flush_memtable(true).unwrap();
    assert_eq!(db.get(&key).unwrap(), Some(b"second".to_vec()));

    db.put(&key, b"third").unwrap();
    assert_eq!(db.get(&key).unwrap(), Some(b"third".to_vec()));
    db.flush_memtable(true).unwrap();
    assert_eq!(db.get(&key).unwrap(), Some(b"third".to_vec()));
}

#[test]
fn get_range_merges_buffers_and_pages() {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(base_options(), dir.path()).unwrap();

    for key in 0..10u64 {
        db.put(&encode_u64(key), VALUE).unwrap();
    }
    db.flush_memtable(true).unwrap();

    // Unflushed updates: key 3 deleted, key 4 rewritten, key 20 added.
    db.delete(&encode_u64(3)).unwrap();
    db.put(&encode_u64(4), b"updated").unwrap();
    db.put(&encode_u64(20), VALUE).unwrap();

    let records = db.get_range(&encode_u64(0), 100).unwrap();
    let keys: Vec<u64> = records
        .iter()
        .map(|(key, _)| u64::from_be_bytes(key.as_slice().try_into().unwrap()))
        .collect();
    assert_eq!(keys, vec![0, 1, 2, 4, 5, 6, 7, 8, 9, 20]);

    let updated = records
        .iter()
        .find(|(key, _)| key.as_slice() == encode_u64(4))
        .unwrap();
    assert_eq!(updated.1, b"updated".to_vec());
}

#[test]
fn get_range_honors_count() {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(base_options(), dir.path()).unwrap();

    for key in 0..10u64 {
        db.put(&encode_u64(key), VALUE).unwrap();
    }
    let records = db.get_range(&encode_u64(2), 3).unwrap();
    let keys: Vec<u64> = records
        .iter()
        .map(|(key, _)| u64::from_be_bytes(key.as_slice().try_into().unwrap()))
        .collect();
    assert_eq!(keys, vec![2, 3, 4]);
}

#[test]
fn empty_key_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(base_options(), dir.path()).unwrap();
    assert!(db.put(b"", b"v").is_err());
    assert!(db.get(b"").is_err());
}

#[test]
fn oversized_record_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(base_options(), dir.path()).unwrap();
    let huge = vec![0u8; 128 * 1024];
    let err = db.put(&encode_u64(1), &huge).unwrap_err();
    assert!(err.to_string().contains("page capacity"));
}
