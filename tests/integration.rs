use cinderdb::tmpfs::TempDir;
use cinderdb::{
    BloomFilterPolicy, Compression, Database, Options, ReadOptions, WriteBatch, WriteOptions,
};

use std::sync::Arc;

fn open_db(dir: &TempDir) -> Database {
    Database::open(
        dir.path().join("db"),
        Options::default().create_if_missing(true),
    )
    .expect("failed to open database")
}

fn wopts() -> WriteOptions {
    WriteOptions::default()
}

fn ropts() -> ReadOptions {
    ReadOptions::new()
}

#[test]
fn test_get_after_put() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir);

    db.put(&wopts(), b"a", b"1").unwrap();
    db.put(&wopts(), b"b", b"2").unwrap();

    assert_eq!(db.get(&ropts(), b"a").unwrap(), Some(b"1".to_vec()));
    assert_eq!(db.get(&ropts(), b"b").unwrap(), Some(b"2".to_vec()));
    assert_eq!(db.get(&ropts(), b"c").unwrap(), None);
}

#[test]
fn test_overwrite_returns_latest() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir);

    db.put(&wopts(), b"k", b"v1").unwrap();
    db.put(&wopts(), b"k", b"v2").unwrap();
    assert_eq!(db.get(&ropts(), b"k").unwrap(), Some(b"v2".to_vec()));
}

#[test]
fn test_snapshot_stability() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir);

    db.put(&wopts(), b"k", b"v1").unwrap();
    let snapshot = db.snapshot().unwrap();
    db.put(&wopts(), b"k", b"v2").unwrap();

    assert_eq!(db.get(&ropts(), b"k").unwrap(), Some(b"v2".to_vec()));
    assert_eq!(
        db.get(&ropts().snapshot(snapshot.clone()), b"k").unwrap(),
        Some(b"v1".to_vec())
    );
    db.release_snapshot(snapshot);
}

#[test]
fn test_snapshot_survives_flush() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir);

    db.put(&wopts(), b"k", b"old").unwrap();
    let snapshot = db.snapshot().unwrap();
    db.put(&wopts(), b"k", b"new").unwrap();
    db.flush_memtable().unwrap();

    assert_eq!(
        db.get(&ropts().snapshot(snapshot), b"k").unwrap(),
        Some(b"old".to_vec())
    );
}

#[test]
fn test_delete_hides_value() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir);

    db.put(&wopts(), b"k", b"v1").unwrap();
    db.delete(&wopts(), b"k").unwrap();
    assert_eq!(db.get(&ropts(), b"k").unwrap(), None);

    // An iterator seeking "k" must skip the tombstone.
    let mut iter = db.iter(&ropts()).unwrap();
    iter.seek(b"k");
    assert!(!iter.valid() || iter.key() != b"k");
}

#[test]
fn test_delete_then_reput() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir);

    db.put(&wopts(), b"k", b"v1").unwrap();
    db.delete(&wopts(), b"k").unwrap();
    db.put(&wopts(), b"k", b"v2").unwrap();
    assert_eq!(db.get(&ropts(), b"k").unwrap(), Some(b"v2".to_vec()));
}

#[test]
fn test_ordered_scan_no_duplicates() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir);

    // Insert out of order, with an overwrite and a delete mixed in.
    for key in ["m", "c", "x", "a", "t"] {
        db.put(&wopts(), key.as_bytes(), b"v").unwrap();
    }
    db.put(&wopts(), b"c", b"v2").unwrap();
    db.delete(&wopts(), b"t").unwrap();

    let keys: Vec<Vec<u8>> = db
        .iter(&ropts())
        .unwrap()
        .into_iter()
        .map(|r| r.unwrap().0)
        .collect();
    assert_eq!(
        keys,
        vec![b"a".to_vec(), b"c".to_vec(), b"m".to_vec(), b"x".to_vec()]
    );
}

#[test]
fn test_batch_write_atomic_and_ordered() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir);

    db.put(&wopts(), b"q", b"doomed").unwrap();

    let mut batch = WriteBatch::new();
    batch.put(b"p", b"1");
    batch.delete(b"q");
    batch.put(b"r", b"3");
    db.write(&wopts(), batch).unwrap();

    assert_eq!(db.get(&ropts(), b"p").unwrap(), Some(b"1".to_vec()));
    assert_eq!(db.get(&ropts(), b"q").unwrap(), None);
    assert_eq!(db.get(&ropts(), b"r").unwrap(), Some(b"3".to_vec()));

    // No iterator may observe a partial batch.
    let entries: Vec<_> = db
        .iter(&ropts())
        .unwrap()
        .into_iter()
        .map(|r| r.unwrap())
        .collect();
    assert_eq!(
        entries,
        vec![
            (b"p".to_vec(), b"1".to_vec()),
            (b"r".to_vec(), b"3".to_vec()),
        ]
    );
}

#[test]
fn test_empty_batch_is_noop() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir);
    db.write(&wopts(), WriteBatch::new()).unwrap();
    assert!(db.iter(&ropts()).unwrap().into_iter().next().is_none());
}

#[test]
fn test_reopen_preserves_writes() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("db");
    {
        let db = Database::open(&path, Options::default().create_if_missing(true)).unwrap();
        for i in 0..1000 {
            db.put(
                &wopts(),
                format!("key-{i:05}").as_bytes(),
                format!("value-{i:05}").as_bytes(),
            )
            .unwrap();
        }
    }
    let db = Database::open(&path, Options::default()).unwrap();
    for i in (0..1000).step_by(37) {
        assert_eq!(
            db.get(&ropts(), format!("key-{i:05}").as_bytes()).unwrap(),
            Some(format!("value-{i:05}").into_bytes()),
            "key-{i:05} lost across reopen"
        );
    }
}

#[test]
fn test_sync_write_durable() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("db");
    {
        let db = Database::open(&path, Options::default().create_if_missing(true)).unwrap();
        db.put(&wopts().sync(true), b"durable", b"yes").unwrap();
    }
    let db = Database::open(&path, Options::default()).unwrap();
    assert_eq!(db.get(&ropts(), b"durable").unwrap(), Some(b"yes".to_vec()));
}

#[test]
fn test_large_dataset_scan_in_order_after_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("db");
    let value = vec![0x5au8; 100];
    {
        let db = Database::open(
            &path,
            Options::default()
                .create_if_missing(true)
                // Small buffer so the run spans several level-0 flushes.
                .write_buffer_size(64 * 1024),
        )
        .unwrap();
        for i in 0..10_000 {
            db.put(&wopts(), format!("key-{i:05}").as_bytes(), &value)
                .unwrap();
        }
    }

    let db = Database::open(&path, Options::default()).unwrap();
    let mut count = 0;
    let mut last: Option<Vec<u8>> = None;
    for entry in db.iter(&ropts()).unwrap() {
        let (key, v) = entry.unwrap();
        if let Some(last) = &last {
            assert!(key > *last, "scan out of order");
        }
        assert_eq!(v, value);
        last = Some(key);
        count += 1;
    }
    assert_eq!(count, 10_000);
}

#[test]
fn test_compact_range_preserves_data() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir);

    db.put(&wopts(), b"a", b"x").unwrap();
    db.put(&wopts(), b"z", b"y").unwrap();
    db.compact_range(None, None).unwrap();

    assert_eq!(db.get(&ropts(), b"a").unwrap(), Some(b"x".to_vec()));
    assert_eq!(db.get(&ropts(), b"z").unwrap(), Some(b"y".to_vec()));

    // Everything left level 0.
    let l0 = db.property("num-files-at-level0").unwrap();
    assert_eq!(l0, "0");
}

#[test]
fn test_compact_range_drops_deleted_keys() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir);

    for i in 0..100 {
        db.put(&wopts(), format!("key-{i:03}").as_bytes(), b"v").unwrap();
    }
    for i in 0..100 {
        if i % 2 == 0 {
            db.delete(&wopts(), format!("key-{i:03}").as_bytes()).unwrap();
        }
    }
    db.compact_range(None, None).unwrap();

    for i in 0..100 {
        let got = db.get(&ropts(), format!("key-{i:03}").as_bytes()).unwrap();
        if i % 2 == 0 {
            assert_eq!(got, None);
        } else {
            assert_eq!(got, Some(b"v".to_vec()));
        }
    }
}

#[test]
fn test_reverse_iteration() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir);

    for key in ["a", "b", "c", "d"] {
        db.put(&wopts(), key.as_bytes(), key.as_bytes()).unwrap();
    }
    db.delete(&wopts(), b"c").unwrap();

    let mut iter = db.iter(&ropts()).unwrap();
    iter.seek_to_last();
    let mut keys = Vec::new();
    while iter.valid() {
        keys.push(iter.key().to_vec());
        iter.prev();
    }
    assert_eq!(keys, vec![b"d".to_vec(), b"b".to_vec(), b"a".to_vec()]);
}

#[test]
fn test_iterator_direction_switch() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir);

    for key in ["a", "b", "c"] {
        db.put(&wopts(), key.as_bytes(), key.as_bytes()).unwrap();
    }

    let mut iter = db.iter(&ropts()).unwrap();
    iter.seek_to_first();
    iter.next(); // b
    assert_eq!(iter.key(), b"b");
    iter.prev(); // back to a
    assert_eq!(iter.key(), b"a");
    iter.next();
    assert_eq!(iter.key(), b"b");
}

#[test]
fn test_iterator_view_is_fixed() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir);

    db.put(&wopts(), b"a", b"1").unwrap();
    let iter = db.iter(&ropts()).unwrap();
    db.put(&wopts(), b"b", b"2").unwrap();

    let keys: Vec<Vec<u8>> = iter.into_iter().map(|r| r.unwrap().0).collect();
    assert_eq!(keys, vec![b"a".to_vec()], "iterator must not see later writes");
}

#[test]
fn test_double_open_excluded() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("db");
    let _db = Database::open(&path, Options::default().create_if_missing(true)).unwrap();
    assert!(Database::open(&path, Options::default()).is_err());
}

#[test]
fn test_open_missing_without_create_fails() {
    let dir = TempDir::new().unwrap();
    let result = Database::open(dir.path().join("nope"), Options::default());
    assert!(result.is_err());
}

#[test]
fn test_error_if_exists() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("db");
    {
        let _db = Database::open(&path, Options::default().create_if_missing(true)).unwrap();
    }
    let result = Database::open(
        &path,
        Options::default().create_if_missing(true).error_if_exists(true),
    );
    assert!(result.is_err());
}

#[test]
fn test_flush_pushes_to_disk_and_reads_back() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir);

    for i in 0..500 {
        db.put(&wopts(), format!("key-{i:04}").as_bytes(), b"flushed").unwrap();
    }
    db.flush_memtable().unwrap();

    // Table files exist now and reads hit them.
    let files: usize = (0..7)
        .map(|l| {
            db.property(&format!("num-files-at-level{l}"))
                .unwrap()
                .parse::<usize>()
                .unwrap()
        })
        .sum();
    assert!(files >= 1);
    assert_eq!(db.get(&ropts(), b"key-0123").unwrap(), Some(b"flushed".to_vec()));
}

#[test]
fn test_properties() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir);
    db.put(&wopts(), b"k", b"v").unwrap();

    assert!(db.property("num-files-at-level0").is_some());
    assert!(db.property("cinderdb.num-files-at-level0").is_some());
    assert!(db.property("stats").is_some());
    assert!(db.property("sstables").is_some());
    assert!(db.property("approximate-memory-usage").is_some());
    assert!(db.property("no-such-property").is_none());
}

#[test]
fn test_approximate_sizes_grow_with_data() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir);

    let value = vec![7u8; 1000];
    for i in 0..2000 {
        db.put(&wopts(), format!("key-{i:05}").as_bytes(), &value).unwrap();
    }
    db.flush_memtable().unwrap();

    let sizes = db
        .approximate_sizes(&[
            (b"key-00000".to_vec(), b"key-01000".to_vec()),
            (b"zz-empty-range".to_vec(), b"zz-still-empty".to_vec()),
        ])
        .unwrap();
    assert!(sizes[0] > 0, "populated range reports zero bytes");
    assert_eq!(sizes[1], 0);
}

#[test]
fn test_options_variants_roundtrip() {
    // No compression + bloom filter, small blocks: exercises the less
    // common file layouts end to end.
    let dir = TempDir::new().unwrap();
    let db = Database::open(
        dir.path().join("db"),
        Options::default()
            .create_if_missing(true)
            .compression(Compression::None)
            .block_size(512)
            .filter_policy(Arc::new(BloomFilterPolicy::new(10))),
    )
    .unwrap();

    for i in 0..2000 {
        db.put(
            &wopts(),
            format!("key-{i:05}").as_bytes(),
            format!("value-{i:05}").as_bytes(),
        )
        .unwrap();
    }
    db.flush_memtable().unwrap();

    for i in (0..2000).step_by(113) {
        assert_eq!(
            db.get(&ropts(), format!("key-{i:05}").as_bytes()).unwrap(),
            Some(format!("value-{i:05}").into_bytes())
        );
    }
    assert_eq!(db.get(&ropts(), b"missing-key").unwrap(), None);
}

#[test]
fn test_concurrent_writers_and_readers() {
    use std::thread;

    let dir = TempDir::new().unwrap();
    let db = Arc::new(open_db(&dir));

    let mut handles = Vec::new();
    for t in 0..4u32 {
        let db = Arc::clone(&db);
        handles.push(thread::spawn(move || {
            for i in 0..500u32 {
                let key = format!("writer-{t}-key-{i:04}");
                db.put(&WriteOptions::default(), key.as_bytes(), b"v")
                    .unwrap();
            }
        }));
    }
    for t in 0..2u32 {
        let db = Arc::clone(&db);
        handles.push(thread::spawn(move || {
            for i in 0..500u32 {
                let key = format!("writer-{}-key-{i:04}", t % 4);
                // May or may not exist yet; must never error.
                let _ = db.get(&ReadOptions::new(), key.as_bytes()).unwrap();
            }
        }));
    }
    for handle in handles {
        handle.join().expect("worker panicked");
    }

    for t in 0..4u32 {
        for i in (0..500u32).step_by(97) {
            let key = format!("writer-{t}-key-{i:04}");
            assert_eq!(
                db.get(&ropts(), key.as_bytes()).unwrap(),
                Some(b"v".to_vec()),
                "{key} lost"
            );
        }
    }
}

#[test]
fn test_write_heavy_workload_compacts_and_survives() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("db");
    let value = vec![1u8; 512];
    {
        let db = Database::open(
            &path,
            Options::default()
                .create_if_missing(true)
                .write_buffer_size(32 * 1024)
                .max_file_size(64 * 1024),
        )
        .unwrap();
        for round in 0..4 {
            for i in 0..2000 {
                db.put(
                    &wopts(),
                    format!("key-{i:05}").as_bytes(),
                    &value[..(round * 100 + 50).min(value.len())],
                )
                .unwrap();
            }
        }
        // Steady state must stay under the hard level-0 ceiling.
        let l0: usize = db
            .property("num-files-at-level0")
            .unwrap()
            .parse()
            .unwrap();
        assert!(l0 < 12, "level-0 file count {l0} reached the stop threshold");
    }

    let db = Database::open(&path, Options::default()).unwrap();
    let count = db.iter(&ropts()).unwrap().into_iter().count();
    assert_eq!(count, 2000);
}
