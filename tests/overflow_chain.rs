//! Overflow-chain growth and reorganization exercised through the
//! public API only: small pages, dense key ranges, reopen after
//! background rewrites.

use merlindb::encoding::encode_u64;
use merlindb::{Database, KeyHints, Options};

fn small_page_options() -> Options {
    Options {
        key_hints: KeyHints {
            num_keys: 100,
            record_size: 128,
            page_fill_pct: 50,
            min_key: 0,
            key_step: 1,
        },
        page_size: 4096,
        pages_per_segment: 128,
        buffer_pool_size: 128 * 4096,
        ..Options::default()
    }
}

#[test]
fn chains_grow_and_survive_reorganization() {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(small_page_options(), dir.path()).unwrap();

    let value = vec![0xC4u8; 100];
    for key in 0..2000u64 {
        db.put(&encode_u64(key), &value).unwrap();
    }
    // Forcing the flush grows overflow chains well past one page and
    // schedules background reorganizations.
    db.flush_memtable(true).unwrap();

    for key in 0..2000u64 {
        assert_eq!(db.get(&encode_u64(key)).unwrap(), Some(value.clone()), "key {key}");
    }

    let records = db.get_range(&encode_u64(0), 3000).unwrap();
    assert_eq!(records.len(), 2000);
    assert!(records.windows(2).all(|pair| pair[0].0 < pair[1].0));
}

#[test]
fn reorganized_database_reopens_cleanly() {
    let dir = tempfile::tempdir().unwrap();
    let value = vec![0x5Au8; 100];

    {
        let db = Database::open(small_page_options(), dir.path()).unwrap();
        for key in 0..1500u64 {
            db.put(&encode_u64(key), &value).unwrap();
        }
        db.flush_memtable(true).unwrap();
        // Dropping drains the reorganization queue and persists.
    }

    let db = Database::open(
        Options {
            create_if_missing: false,
            ..small_page_options()
        },
        dir.path(),
    )
    .unwrap();
    for key in 0..1500u64 {
        assert_eq!(db.get(&encode_u64(key)).unwrap(), Some(value.clone()), "key {key}");
    }
}

#[test]
fn flush_replay_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(small_page_options(), dir.path()).unwrap();

    let value = vec![0x0Fu8; 100];
    for key in 0..300u64 {
        db.put(&encode_u64(key), &value).unwrap();
    }
    db.flush_memtable(true).unwrap();

    // Writing the same records again and flushing must not duplicate
    // anything: writes are absolute.
    for key in 0..300u64 {
        db.put(&encode_u64(key), &value).unwrap();
    }
    db.flush_memtable(true).unwrap();

    let records = db.get_range(&encode_u64(0), 1000).unwrap();
    assert_eq!(records.len(), 300);
}

#[test]
fn interleaved_writes_and_deletes_resolve_by_recency() {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(small_page_options(), dir.path()).unwrap();

    let key = encode_u64(42);
    db.put(&key, b"one").unwrap();
    db.delete(&key).unwrap();
    db.put(&key, b"two").unwrap();
    db.flush_memtable(true).unwrap();
    assert_eq!(db.get(&key).unwrap(), Some(b"two".to_vec()));

    db.delete(&key).unwrap();
    db.flush_memtable(true).unwrap();
    assert_eq!(db.get(&key).unwrap(), None);

    // The delete is physical: the reopened database agrees.
    drop(db);
    let db = Database::open(
        Options {
            create_if_missing: false,
            ..small_page_options()
        },
        dir.path(),
    )
    .unwrap();
    assert_eq!(db.get(&key).unwrap(), None);
}

#[test]
fn deletes_shrink_chains_across_flushes() {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(small_page_options(), dir.path()).unwrap();

    let value = vec![0x91u8; 100];
    for key in 0..800u64 {
        db.put(&encode_u64(key), &value).unwrap();
    }
    db.flush_memtable(true).unwrap();

    for key in (0..800u64).filter(|key| key % 2 == 1) {
        db.delete(&encode_u64(key)).unwrap();
    }
    db.flush_memtable(true).unwrap();

    let records = db.get_range(&encode_u64(0), 1000).unwrap();
    assert_eq!(records.len(), 400);
    for (key, _) in &records {
        let key = u64::from_be_bytes(key.as_slice().try_into().unwrap());
        assert_eq!(key % 2, 0);
    }
}
