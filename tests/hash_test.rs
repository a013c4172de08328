// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

mod subtests;

use coffer::hash::opts;
use coffer::{Cursor, Db, ErrorCode, HashDb, OpenMode};
use std::path::Path;

fn new_db(path: &Path) -> HashDb {
    let db = HashDb::new();
    db.tune_buckets(1024).unwrap();
    db.open(
        path.to_str().unwrap(),
        OpenMode::Writer | OpenMode::Create,
    )
    .unwrap();
    db
}

#[test]
fn hash_set_get() {
    let dir = tempfile::tempdir().unwrap();
    let db = new_db(&dir.path().join("t.cfh"));
    subtests::set_get(&db);
    db.close().unwrap();
}

#[test]
fn hash_overwrite_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let db = new_db(&dir.path().join("t.cfh"));
    subtests::overwrite_is_idempotent(&db);
    db.close().unwrap();
}

#[test]
fn hash_add_remove() {
    let dir = tempfile::tempdir().unwrap();
    let db = new_db(&dir.path().join("t.cfh"));
    subtests::add_remove(&db);
    db.close().unwrap();
}

#[test]
fn hash_replace() {
    let dir = tempfile::tempdir().unwrap();
    let db = new_db(&dir.path().join("t.cfh"));
    subtests::replace_requires_presence(&db);
    db.close().unwrap();
}

#[test]
fn hash_append() {
    let dir = tempfile::tempdir().unwrap();
    let db = new_db(&dir.path().join("t.cfh"));
    subtests::append(&db);
    db.close().unwrap();
}

#[test]
fn hash_cas() {
    let dir = tempfile::tempdir().unwrap();
    let db = new_db(&dir.path().join("t.cfh"));
    subtests::cas(&db);
    db.close().unwrap();
}

#[test]
fn hash_increment() {
    let dir = tempfile::tempdir().unwrap();
    let db = new_db(&dir.path().join("t.cfh"));
    subtests::increment(&db);
    db.close().unwrap();
}

#[test]
fn hash_increment_double() {
    let dir = tempfile::tempdir().unwrap();
    let db = new_db(&dir.path().join("t.cfh"));
    subtests::increment_double(&db);
    db.close().unwrap();
}

#[test]
fn hash_seize_and_check() {
    let dir = tempfile::tempdir().unwrap();
    let db = new_db(&dir.path().join("t.cfh"));
    subtests::seize_and_check(&db);
    db.close().unwrap();
}

#[test]
fn hash_iterate() {
    let dir = tempfile::tempdir().unwrap();
    let db = new_db(&dir.path().join("t.cfh"));
    subtests::iterate_visits_each_once(&db);
    db.close().unwrap();
}

#[test]
fn hash_iterate_rewrite() {
    let dir = tempfile::tempdir().unwrap();
    let db = new_db(&dir.path().join("t.cfh"));
    subtests::iterate_can_rewrite(&db);
    db.close().unwrap();
}

#[test]
fn hash_value_sizes() {
    let dir = tempfile::tempdir().unwrap();
    let db = new_db(&dir.path().join("t.cfh"));
    subtests::values_roundtrip_bytewise(&db);
    db.close().unwrap();
}

#[test]
fn hash_transaction_abort() {
    let dir = tempfile::tempdir().unwrap();
    let db = new_db(&dir.path().join("t.cfh"));
    subtests::transaction_abort(&db);
    db.close().unwrap();
}

#[test]
fn hash_transaction_commit() {
    let dir = tempfile::tempdir().unwrap();
    let db = new_db(&dir.path().join("t.cfh"));
    subtests::transaction_commit(&db);
    db.close().unwrap();
}

#[test]
fn hash_transaction_abort_restores_removals() {
    let dir = tempfile::tempdir().unwrap();
    let db = new_db(&dir.path().join("t.cfh"));
    subtests::transaction_abort_restores_removals(&db);
    db.close().unwrap();
}

#[test]
fn hash_double_begin() {
    let dir = tempfile::tempdir().unwrap();
    let db = new_db(&dir.path().join("t.cfh"));
    subtests::double_begin_is_refused(&db);
    db.close().unwrap();
}

#[test]
fn hash_clear() {
    let dir = tempfile::tempdir().unwrap();
    let db = new_db(&dir.path().join("t.cfh"));
    subtests::clear_empties(&db);
    db.close().unwrap();
}

#[test]
fn hash_snapshot_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let src = new_db(&dir.path().join("src.cfh"));
    let dest = new_db(&dir.path().join("dest.cfh"));
    subtests::snapshot_roundtrip(&src, &dest);
    src.close().unwrap();
    dest.close().unwrap();
}

#[test]
fn hash_persists_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("t.cfh");
    {
        let db = new_db(&path);
        for i in 0..500u32 {
            db.set(format!("key{i}").as_bytes(), format!("val{i}").as_bytes())
                .unwrap();
        }
        db.close().unwrap();
    }
    let db = HashDb::new();
    db.open(path.to_str().unwrap(), OpenMode::Reader.into())
        .unwrap();
    assert_eq!(db.count().unwrap(), 500);
    assert_eq!(db.get(b"key321").unwrap(), Some(b"val321".to_vec()));
    assert!(!db.recovered());
    assert!(!db.reorganized());
    db.close().unwrap();
}

#[test]
fn hash_freed_space_is_reused() {
    let dir = tempfile::tempdir().unwrap();
    let db = new_db(&dir.path().join("t.cfh"));
    let value = vec![0x5au8; 512];
    for i in 0..64u32 {
        db.set(&i.to_be_bytes(), &value).unwrap();
    }
    db.synchronize(false).unwrap();
    let grown = db.size().unwrap();
    for round in 0..8 {
        for i in 0..64u32 {
            db.remove(&i.to_be_bytes()).unwrap();
        }
        for i in 0..64u32 {
            db.set(&i.to_be_bytes(), &value).unwrap();
        }
        let _ = round;
    }
    // Churn of same-sized records recycles freed regions instead of
    // growing the file without bound.
    assert!(db.size().unwrap() <= grown + 64 * 1024);
    db.close().unwrap();
}

#[test]
fn hash_defrag_compacts() {
    let dir = tempfile::tempdir().unwrap();
    let db = new_db(&dir.path().join("t.cfh"));
    let value = vec![0xa5u8; 256];
    for i in 0..256u32 {
        db.set(&i.to_be_bytes(), &value).unwrap();
    }
    let full = db.size().unwrap();
    for i in 0..256u32 {
        if i % 2 == 0 {
            db.remove(&i.to_be_bytes()).unwrap();
        }
    }
    db.defrag(-1).unwrap();
    assert!(db.size().unwrap() < full);
    assert_eq!(db.count().unwrap(), 128);
    for i in 0..256u32 {
        let expect = if i % 2 == 0 { None } else { Some(value.clone()) };
        assert_eq!(db.get(&i.to_be_bytes()).unwrap(), expect);
    }
    db.close().unwrap();
}

#[test]
fn hash_defrag_stepwise() {
    let dir = tempfile::tempdir().unwrap();
    let db = new_db(&dir.path().join("t.cfh"));
    for i in 0..128u32 {
        db.set(&i.to_be_bytes(), &[0u8; 128]).unwrap();
    }
    for i in 0..128u32 {
        if i % 3 != 0 {
            db.remove(&i.to_be_bytes()).unwrap();
        }
    }
    for _ in 0..64 {
        db.defrag(4).unwrap();
    }
    for i in 0..128u32 {
        let expect = if i % 3 == 0 { Some(vec![0u8; 128]) } else { None };
        assert_eq!(db.get(&i.to_be_bytes()).unwrap(), expect);
    }
    db.close().unwrap();
}

#[test]
fn hash_linear_chains() {
    let dir = tempfile::tempdir().unwrap();
    let db = HashDb::new();
    db.tune_buckets(8).unwrap(); // force long chains
    db.tune_options(opts::TLINEAR).unwrap();
    db.open(
        dir.path().join("t.cfh").to_str().unwrap(),
        OpenMode::Writer | OpenMode::Create,
    )
    .unwrap();
    subtests::set_get(&db);
    subtests::iterate_visits_each_once(&db);
    db.close().unwrap();
}

#[test]
fn hash_small_offsets() {
    let dir = tempfile::tempdir().unwrap();
    let db = HashDb::new();
    db.tune_buckets(1024).unwrap();
    db.tune_options(opts::TSMALL).unwrap();
    let path = dir.path().join("t.cfh");
    db.open(
        path.to_str().unwrap(),
        OpenMode::Writer | OpenMode::Create,
    )
    .unwrap();
    subtests::set_get(&db);
    db.close().unwrap();
    let db = HashDb::new();
    db.open(path.to_str().unwrap(), OpenMode::Reader.into())
        .unwrap();
    assert_eq!(db.get(b"foo").unwrap(), Some(b"hop".to_vec()));
    db.close().unwrap();
}

#[test]
fn hash_compressed_records() {
    let dir = tempfile::tempdir().unwrap();
    let db = HashDb::new();
    db.tune_buckets(1024).unwrap();
    db.tune_options(opts::TCOMPRESS).unwrap();
    let path = dir.path().join("t.cfh");
    db.open(
        path.to_str().unwrap(),
        OpenMode::Writer | OpenMode::Create,
    )
    .unwrap();
    let value = b"la la la la la la la la la".repeat(64);
    db.set(b"song", &value).unwrap();
    assert_eq!(db.get(b"song").unwrap(), Some(value.clone()));
    db.close().unwrap();
    let db = HashDb::new();
    db.open(path.to_str().unwrap(), OpenMode::Reader.into())
        .unwrap();
    assert_eq!(db.get(b"song").unwrap(), Some(value));
    db.close().unwrap();
}

#[test]
fn hash_cursor_walks_every_record() {
    let dir = tempfile::tempdir().unwrap();
    let db = new_db(&dir.path().join("t.cfh"));
    for i in 0..200u32 {
        db.set(format!("k{i}").as_bytes(), &i.to_be_bytes()).unwrap();
    }
    let mut seen = std::collections::HashSet::new();
    let mut cur = db.cursor();
    cur.jump().unwrap();
    loop {
        let (key, _value) = cur.get(false).unwrap();
        assert!(seen.insert(key));
        if cur.step().is_err() {
            break;
        }
    }
    assert_eq!(seen.len(), 200);
    db.close().unwrap();
}

#[test]
fn hash_cursor_jump_missing_key_fails() {
    let dir = tempfile::tempdir().unwrap();
    let db = new_db(&dir.path().join("t.cfh"));
    db.set(b"present", b"x").unwrap();
    let mut cur = db.cursor();
    cur.jump_key(b"present").unwrap();
    assert_eq!(cur.get_key().unwrap(), b"present".to_vec());
    let err = cur.jump_key(b"absent").unwrap_err();
    assert_eq!(err.code(), ErrorCode::NoRec);
    db.close().unwrap();
}

#[test]
fn hash_cursor_remove_steps_to_next() {
    let dir = tempfile::tempdir().unwrap();
    let db = new_db(&dir.path().join("t.cfh"));
    for i in 0..10u32 {
        db.set(format!("k{i}").as_bytes(), b"v").unwrap();
    }
    let mut cur = db.cursor();
    cur.jump().unwrap();
    for _ in 0..10 {
        cur.remove().unwrap();
        if cur.step().is_err() {
            break;
        }
    }
    // Removing through the cursor leaves no records behind.
    let mut left = 0;
    for i in 0..10u32 {
        if db.get(format!("k{i}").as_bytes()).unwrap().is_some() {
            left += 1;
        }
    }
    assert_eq!(db.count().unwrap(), left);
    db.close().unwrap();
}

/// Simulate a crash during a transaction by copying the database and its
/// WAL while the transaction is still open, then opening the copy.
#[test]
fn hash_crash_during_transaction_recovers() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("t.cfh");
    let copy = dir.path().join("copy.cfh");
    let db = new_db(&path);
    db.set(b"a", b"committed").unwrap();
    db.synchronize(false).unwrap();
    db.begin_transaction(false).unwrap();
    db.set(b"a", b"uncommitted").unwrap();
    db.set(b"b", b"new").unwrap();
    std::fs::copy(&path, &copy).unwrap();
    std::fs::copy(
        format!("{}.wal", path.display()),
        format!("{}.wal", copy.display()),
    )
    .unwrap();
    db.end_transaction(false).unwrap();
    db.close().unwrap();

    let crashed = HashDb::new();
    crashed
        .open(
            copy.to_str().unwrap(),
            OpenMode::Writer | OpenMode::Create,
        )
        .unwrap();
    assert!(crashed.recovered());
    assert_eq!(crashed.get(b"a").unwrap(), Some(b"committed".to_vec()));
    assert_eq!(crashed.get(b"b").unwrap(), None);
    assert_eq!(crashed.count().unwrap(), 1);
    crashed.close().unwrap();
}

/// Simulate an unclean shutdown without a WAL by copying the file while
/// it is open; the copy misses the end-of-file marker and carries the
/// open flag, so opening it triggers auto-repair.
#[test]
fn hash_unclean_shutdown_triggers_repair() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("t.cfh");
    let copy = dir.path().join("copy.cfh");
    let db = new_db(&path);
    for i in 0..100u32 {
        db.set(format!("k{i}").as_bytes(), format!("v{i}").as_bytes())
            .unwrap();
    }
    db.synchronize(false).unwrap();
    std::fs::copy(&path, &copy).unwrap();
    db.close().unwrap();

    let crashed = HashDb::new();
    crashed
        .open(
            copy.to_str().unwrap(),
            OpenMode::Writer | OpenMode::Create,
        )
        .unwrap();
    assert!(crashed.reorganized());
    assert_eq!(crashed.count().unwrap(), 100);
    assert_eq!(crashed.get(b"k42").unwrap(), Some(b"v42".to_vec()));
    crashed.close().unwrap();
}

#[test]
fn hash_norepair_refuses_broken_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("t.cfh");
    let copy = dir.path().join("copy.cfh");
    let db = new_db(&path);
    db.set(b"k", b"v").unwrap();
    db.synchronize(false).unwrap();
    std::fs::copy(&path, &copy).unwrap();
    db.close().unwrap();

    let crashed = HashDb::new();
    let err = crashed
        .open(
            copy.to_str().unwrap(),
            OpenMode::Writer | OpenMode::NoRepair,
        )
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::Broken);
}

#[test]
fn hash_opaque_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("t.cfh");
    let mut slot = [0u8; 16];
    slot[..4].copy_from_slice(b"mark");
    {
        let db = new_db(&path);
        db.set_opaque(slot).unwrap();
        db.close().unwrap();
    }
    let db = HashDb::new();
    db.open(path.to_str().unwrap(), OpenMode::Reader.into())
        .unwrap();
    assert_eq!(db.opaque().unwrap(), slot);
    db.close().unwrap();
}

#[test]
fn hash_status_reports_counters() {
    let dir = tempfile::tempdir().unwrap();
    let db = new_db(&dir.path().join("t.cfh"));
    db.set(b"k", b"v").unwrap();
    let status = db.status().unwrap();
    assert_eq!(status["type"], "HashDb");
    assert_eq!(status["count"], "1");
    assert_eq!(status["bnum"], "1024");
    assert_eq!(status["recovered"], "0");
    db.close().unwrap();
}

#[test]
fn hash_two_writers_are_refused() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("t.cfh");
    let a = new_db(&path);
    let b = HashDb::new();
    let err = b
        .open(
            path.to_str().unwrap(),
            OpenMode::Writer | OpenMode::TryLock,
        )
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::System);
    a.close().unwrap();
}

#[test]
fn hash_reader_cannot_write() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("t.cfh");
    {
        let db = new_db(&path);
        db.set(b"k", b"v").unwrap();
        db.close().unwrap();
    }
    let db = HashDb::new();
    db.open(path.to_str().unwrap(), OpenMode::Reader.into())
        .unwrap();
    let err = db.set(b"k", b"w").unwrap_err();
    assert_eq!(err.code(), ErrorCode::NoPerm);
    db.close().unwrap();
}

#[test]
fn hash_parallel_disjoint_writers() {
    let dir = tempfile::tempdir().unwrap();
    let db = std::sync::Arc::new(HashDb::new());
    db.tune_buckets(4096).unwrap();
    db.open(
        dir.path().join("t.cfh").to_str().unwrap(),
        OpenMode::Writer | OpenMode::Create,
    )
    .unwrap();
    let mut handles = Vec::new();
    for t in 0..4u32 {
        let db = std::sync::Arc::clone(&db);
        handles.push(std::thread::spawn(move || {
            for i in 0..250u32 {
                let key = format!("t{t}-{i}");
                db.set(key.as_bytes(), &i.to_be_bytes()).unwrap();
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(db.count().unwrap(), 1000);
    for t in 0..4u32 {
        for i in (0..250u32).step_by(41) {
            let key = format!("t{t}-{i}");
            assert_eq!(
                db.get(key.as_bytes()).unwrap(),
                Some(i.to_be_bytes().to_vec())
            );
        }
    }
    db.close().unwrap();
}

#[test]
fn hash_auto_sync_mode() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("t.cfh");
    let db = HashDb::new();
    db.tune_buckets(256).unwrap();
    db.open(
        path.to_str().unwrap(),
        OpenMode::Writer | OpenMode::Create | OpenMode::AutoSync,
    )
    .unwrap();
    for i in 0..32u32 {
        db.set(&i.to_be_bytes(), b"synced").unwrap();
    }
    assert_eq!(db.count().unwrap(), 32);
    db.close().unwrap();
    let db = HashDb::new();
    db.open(path.to_str().unwrap(), OpenMode::Reader.into())
        .unwrap();
    assert_eq!(db.count().unwrap(), 32);
    db.close().unwrap();
}

#[test]
fn hash_auto_transaction_mode() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("t.cfh");
    let db = HashDb::new();
    db.tune_buckets(256).unwrap();
    db.open(
        path.to_str().unwrap(),
        OpenMode::Writer | OpenMode::Create | OpenMode::AutoTran,
    )
    .unwrap();
    for i in 0..32u32 {
        db.set(&i.to_be_bytes(), b"logged").unwrap();
    }
    assert_eq!(db.count().unwrap(), 32);
    // An explicit transaction still works on top of the implicit ones.
    db.begin_transaction(false).unwrap();
    db.set(b"x", b"1").unwrap();
    db.end_transaction(false).unwrap();
    assert_eq!(db.get(b"x").unwrap(), None);
    db.close().unwrap();
}
