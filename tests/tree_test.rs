// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

mod subtests;

use coffer::{Comparator, Cursor, Db, ErrorCode, OpenMode, TreeDb};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::path::Path;

fn new_db(path: &Path) -> TreeDb {
    let db = TreeDb::new();
    db.tune_buckets(1024).unwrap();
    db.open(
        path.to_str().unwrap(),
        OpenMode::Writer | OpenMode::Create,
    )
    .unwrap();
    db
}

#[test]
fn tree_set_get() {
    let dir = tempfile::tempdir().unwrap();
    let db = new_db(&dir.path().join("t.cft"));
    subtests::set_get(&db);
    db.close().unwrap();
}

#[test]
fn tree_overwrite_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let db = new_db(&dir.path().join("t.cft"));
    subtests::overwrite_is_idempotent(&db);
    db.close().unwrap();
}

#[test]
fn tree_add_remove() {
    let dir = tempfile::tempdir().unwrap();
    let db = new_db(&dir.path().join("t.cft"));
    subtests::add_remove(&db);
    db.close().unwrap();
}

#[test]
fn tree_replace() {
    let dir = tempfile::tempdir().unwrap();
    let db = new_db(&dir.path().join("t.cft"));
    subtests::replace_requires_presence(&db);
    db.close().unwrap();
}

#[test]
fn tree_append() {
    let dir = tempfile::tempdir().unwrap();
    let db = new_db(&dir.path().join("t.cft"));
    subtests::append(&db);
    db.close().unwrap();
}

#[test]
fn tree_cas() {
    let dir = tempfile::tempdir().unwrap();
    let db = new_db(&dir.path().join("t.cft"));
    subtests::cas(&db);
    db.close().unwrap();
}

#[test]
fn tree_increment() {
    let dir = tempfile::tempdir().unwrap();
    let db = new_db(&dir.path().join("t.cft"));
    subtests::increment(&db);
    db.close().unwrap();
}

#[test]
fn tree_increment_double() {
    let dir = tempfile::tempdir().unwrap();
    let db = new_db(&dir.path().join("t.cft"));
    subtests::increment_double(&db);
    db.close().unwrap();
}

#[test]
fn tree_seize_and_check() {
    let dir = tempfile::tempdir().unwrap();
    let db = new_db(&dir.path().join("t.cft"));
    subtests::seize_and_check(&db);
    db.close().unwrap();
}

#[test]
fn tree_iterate() {
    let dir = tempfile::tempdir().unwrap();
    let db = new_db(&dir.path().join("t.cft"));
    subtests::iterate_visits_each_once(&db);
    db.close().unwrap();
}

#[test]
fn tree_iterate_rewrite() {
    let dir = tempfile::tempdir().unwrap();
    let db = new_db(&dir.path().join("t.cft"));
    subtests::iterate_can_rewrite(&db);
    db.close().unwrap();
}

#[test]
fn tree_value_sizes() {
    let dir = tempfile::tempdir().unwrap();
    let db = new_db(&dir.path().join("t.cft"));
    subtests::values_roundtrip_bytewise(&db);
    db.close().unwrap();
}

#[test]
fn tree_transaction_abort() {
    let dir = tempfile::tempdir().unwrap();
    let db = new_db(&dir.path().join("t.cft"));
    subtests::transaction_abort(&db);
    db.close().unwrap();
}

#[test]
fn tree_transaction_commit() {
    let dir = tempfile::tempdir().unwrap();
    let db = new_db(&dir.path().join("t.cft"));
    subtests::transaction_commit(&db);
    db.close().unwrap();
}

#[test]
fn tree_transaction_abort_restores_removals() {
    let dir = tempfile::tempdir().unwrap();
    let db = new_db(&dir.path().join("t.cft"));
    subtests::transaction_abort_restores_removals(&db);
    db.close().unwrap();
}

#[test]
fn tree_double_begin() {
    let dir = tempfile::tempdir().unwrap();
    let db = new_db(&dir.path().join("t.cft"));
    subtests::double_begin_is_refused(&db);
    db.close().unwrap();
}

#[test]
fn tree_clear() {
    let dir = tempfile::tempdir().unwrap();
    let db = new_db(&dir.path().join("t.cft"));
    subtests::clear_empties(&db);
    db.close().unwrap();
}

/// The first end-to-end scenario: lexical cursor order over three records.
#[test]
fn tree_cursor_lexical_order() {
    let dir = tempfile::tempdir().unwrap();
    let db = new_db(&dir.path().join("t.cft"));
    db.set(b"foo", b"hop").unwrap();
    db.set(b"bar", b"step").unwrap();
    db.set(b"baz", b"jump").unwrap();
    assert_eq!(db.get(b"foo").unwrap(), Some(b"hop".to_vec()));
    assert_eq!(db.count().unwrap(), 3);
    let mut cur = db.cursor();
    cur.jump().unwrap();
    assert_eq!(cur.get(true).unwrap().0, b"bar".to_vec());
    assert_eq!(cur.get(true).unwrap().0, b"baz".to_vec());
    assert_eq!(cur.get(true).unwrap().0, b"foo".to_vec());
    assert!(cur.get(false).is_err());
    db.close().unwrap();
}

#[test]
fn tree_traversal_is_sorted_after_random_inserts() {
    let dir = tempfile::tempdir().unwrap();
    let db = TreeDb::new();
    db.tune_buckets(1024).unwrap();
    db.tune_page(512).unwrap();
    db.open(
        dir.path().join("t.cft").to_str().unwrap(),
        OpenMode::Writer | OpenMode::Create,
    )
    .unwrap();
    let mut keys: Vec<u32> = (0..2000).collect();
    let mut rng = rand::rngs::StdRng::seed_from_u64(20091011);
    keys.shuffle(&mut rng);
    for k in &keys {
        db.set(format!("{k:08}").as_bytes(), &k.to_be_bytes()).unwrap();
    }
    assert_eq!(db.count().unwrap(), 2000);
    let mut cur = db.cursor();
    cur.jump().unwrap();
    let mut prev: Option<Vec<u8>> = None;
    let mut visited = 0;
    loop {
        let key = match cur.get(true) {
            Ok((key, _)) => key,
            Err(_) => break,
        };
        if let Some(prev) = &prev {
            assert!(prev < &key);
        }
        prev = Some(key);
        visited += 1;
    }
    assert_eq!(visited, 2000);
    db.close().unwrap();
}

/// The sixth end-to-end scenario: a cursor keeps its place while inserts
/// around it force leaf splits, and stepping still yields every
/// subsequent key exactly once.
#[test]
fn tree_cursor_survives_splits() {
    let dir = tempfile::tempdir().unwrap();
    let db = TreeDb::new();
    db.tune_buckets(1024).unwrap();
    db.tune_page(256).unwrap();
    db.open(
        dir.path().join("t.cft").to_str().unwrap(),
        OpenMode::Writer | OpenMode::Create,
    )
    .unwrap();
    for i in 0..64u32 {
        db.set(format!("k{i:02}").as_bytes(), &[0u8; 8]).unwrap();
    }
    let mut cur = db.cursor();
    cur.jump_key(b"k30").unwrap();
    // Force splits around the cursor position.
    for i in 0..100u32 {
        db.set(format!("k30-extra-{i:03}").as_bytes(), &[1u8; 8])
            .unwrap();
    }
    let mut seen = Vec::new();
    loop {
        match cur.get(true) {
            Ok((key, _)) => seen.push(String::from_utf8(key).unwrap()),
            Err(_) => break,
        }
    }
    assert_eq!(seen.first().map(String::as_str), Some("k30"));
    // Everything at or after "k30" appears exactly once, in order.
    let mut expect = Vec::new();
    expect.push("k30".to_string());
    for i in 0..100u32 {
        expect.push(format!("k30-extra-{i:03}"));
    }
    for i in 31..64u32 {
        expect.push(format!("k{i:02}"));
    }
    assert_eq!(seen, expect);
    db.close().unwrap();
}

#[test]
fn tree_cursor_jump_lands_on_upper_bound() {
    let dir = tempfile::tempdir().unwrap();
    let db = new_db(&dir.path().join("t.cft"));
    db.set(b"b", b"1").unwrap();
    db.set(b"d", b"2").unwrap();
    let mut cur = db.cursor();
    cur.jump_key(b"c").unwrap();
    assert_eq!(cur.get_key().unwrap(), b"d".to_vec());
    let err = cur.jump_key(b"e").unwrap_err();
    assert_eq!(err.code(), ErrorCode::NoRec);
    db.close().unwrap();
}

#[test]
fn tree_deletion_cascades_to_empty() {
    let dir = tempfile::tempdir().unwrap();
    let db = TreeDb::new();
    db.tune_buckets(1024).unwrap();
    db.tune_page(256).unwrap();
    db.open(
        dir.path().join("t.cft").to_str().unwrap(),
        OpenMode::Writer | OpenMode::Create,
    )
    .unwrap();
    for i in 0..1000u32 {
        db.set(format!("{i:06}").as_bytes(), &[7u8; 16]).unwrap();
    }
    for i in 0..1000u32 {
        db.remove(format!("{i:06}").as_bytes()).unwrap();
    }
    assert_eq!(db.count().unwrap(), 0);
    let mut cur = db.cursor();
    assert!(cur.jump().is_err());
    // The collapsed tree keeps working.
    db.set(b"revived", b"yes").unwrap();
    assert_eq!(db.get(b"revived").unwrap(), Some(b"yes".to_vec()));
    assert_eq!(db.count().unwrap(), 1);
    db.close().unwrap();
}

#[test]
fn tree_persists_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("t.cft");
    {
        let db = TreeDb::new();
        db.tune_buckets(1024).unwrap();
        db.tune_page(512).unwrap();
        db.open(
            path.to_str().unwrap(),
            OpenMode::Writer | OpenMode::Create,
        )
        .unwrap();
        for i in 0..3000u32 {
            db.set(format!("key{i:05}").as_bytes(), &i.to_be_bytes())
                .unwrap();
        }
        db.close().unwrap();
    }
    let db = TreeDb::new();
    db.open(path.to_str().unwrap(), OpenMode::Reader.into())
        .unwrap();
    assert_eq!(db.count().unwrap(), 3000);
    assert_eq!(
        db.get(b"key02718").unwrap(),
        Some(2718u32.to_be_bytes().to_vec())
    );
    let mut cur = db.cursor();
    cur.jump().unwrap();
    assert_eq!(cur.get_key().unwrap(), b"key00000".to_vec());
    db.close().unwrap();
}

#[test]
fn tree_decimal_comparator_orders_numerically() {
    let dir = tempfile::tempdir().unwrap();
    let db = TreeDb::new();
    db.tune_buckets(1024).unwrap();
    db.tune_comparator(Comparator::Decimal).unwrap();
    let path = dir.path().join("t.cft");
    db.open(
        path.to_str().unwrap(),
        OpenMode::Writer | OpenMode::Create,
    )
    .unwrap();
    for n in [100u32, 9, 25, 3, 77] {
        db.set(n.to_string().as_bytes(), b"x").unwrap();
    }
    let mut cur = db.cursor();
    cur.jump().unwrap();
    let mut order = Vec::new();
    loop {
        match cur.get(true) {
            Ok((key, _)) => order.push(String::from_utf8(key).unwrap()),
            Err(_) => break,
        }
    }
    assert_eq!(order, vec!["3", "9", "25", "77", "100"]);
    db.close().unwrap();

    // The comparator is persisted; reopening without tuning restores it.
    let db = TreeDb::new();
    db.open(path.to_str().unwrap(), OpenMode::Reader.into())
        .unwrap();
    assert_eq!(db.status().unwrap()["rcomp"], "decimal");
    db.close().unwrap();
}

#[test]
fn tree_custom_comparator_mismatch_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("t.cft");
    {
        let db = new_db(&path); // lexical
        db.set(b"k", b"v").unwrap();
        db.close().unwrap();
    }
    let db = TreeDb::new();
    db.tune_comparator(Comparator::Custom(std::sync::Arc::new(|a, b| b.cmp(a))))
        .unwrap();
    let err = db
        .open(path.to_str().unwrap(), OpenMode::Reader.into())
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::Broken);
}

#[test]
fn tree_small_page_cache_spills_and_reloads() {
    let dir = tempfile::tempdir().unwrap();
    let db = TreeDb::new();
    db.tune_buckets(4096).unwrap();
    db.tune_page(512).unwrap();
    db.tune_page_cache(8 << 10).unwrap();
    db.open(
        dir.path().join("t.cft").to_str().unwrap(),
        OpenMode::Writer | OpenMode::Create,
    )
    .unwrap();
    for i in 0..5000u32 {
        db.set(format!("{i:07}").as_bytes(), &[3u8; 32]).unwrap();
    }
    assert_eq!(db.count().unwrap(), 5000);
    for i in (0..5000u32).step_by(379) {
        assert_eq!(
            db.get(format!("{i:07}").as_bytes()).unwrap(),
            Some(vec![3u8; 32])
        );
    }
    db.close().unwrap();
}

#[test]
fn tree_auto_transaction_mode() {
    let dir = tempfile::tempdir().unwrap();
    let db = TreeDb::new();
    db.tune_buckets(1024).unwrap();
    db.tune_page(256).unwrap();
    db.open(
        dir.path().join("t.cft").to_str().unwrap(),
        OpenMode::Writer | OpenMode::Create | OpenMode::AutoTran,
    )
    .unwrap();
    for i in 0..200u32 {
        db.set(format!("k{i:03}").as_bytes(), &[9u8; 8]).unwrap();
    }
    assert_eq!(db.count().unwrap(), 200);
    db.close().unwrap();
}

#[test]
fn tree_status_reports_structure() {
    let dir = tempfile::tempdir().unwrap();
    let db = TreeDb::new();
    db.tune_buckets(1024).unwrap();
    db.tune_page(256).unwrap();
    db.open(
        dir.path().join("t.cft").to_str().unwrap(),
        OpenMode::Writer | OpenMode::Create,
    )
    .unwrap();
    for i in 0..500u32 {
        db.set(format!("{i:05}").as_bytes(), &[0u8; 16]).unwrap();
    }
    let status = db.status().unwrap();
    assert_eq!(status["type"], "TreeDb");
    assert_eq!(status["count"], "500");
    assert_eq!(status["psiz"], "256");
    assert!(status["lcnt"].parse::<u64>().unwrap() > 1);
    assert!(status["icnt"].parse::<u64>().unwrap() >= 1);
    db.close().unwrap();
}

/// Crash simulation: copy the database and WAL mid-transaction, then
/// reopen the copy and expect the pre-transaction state. The tiny page
/// cache forces dirty pages through the hash layer during the
/// transaction, so the WAL holds real pre-images at the copy point.
#[test]
fn tree_crash_during_transaction_recovers() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("t.cft");
    let copy = dir.path().join("copy.cft");
    let db = TreeDb::new();
    db.tune_buckets(1024).unwrap();
    db.tune_page(256).unwrap();
    db.tune_page_cache(4 << 10).unwrap();
    db.open(
        path.to_str().unwrap(),
        OpenMode::Writer | OpenMode::Create,
    )
    .unwrap();
    for i in 0..200u32 {
        db.set(format!("k{i:03}").as_bytes(), b"stable").unwrap();
    }
    db.synchronize(false).unwrap();
    db.begin_transaction(false).unwrap();
    for i in 0..200u32 {
        db.set(format!("k{i:03}").as_bytes(), b"doomed!!").unwrap();
    }
    std::fs::copy(&path, &copy).unwrap();
    let wal = format!("{}.wal", path.display());
    if std::path::Path::new(&wal).exists() {
        std::fs::copy(&wal, format!("{}.wal", copy.display())).unwrap();
    }
    db.end_transaction(false).unwrap();
    db.close().unwrap();

    let crashed = TreeDb::new();
    crashed
        .open(
            copy.to_str().unwrap(),
            OpenMode::Writer | OpenMode::Create,
        )
        .unwrap();
    assert_eq!(crashed.count().unwrap(), 200);
    for i in (0..200u32).step_by(17) {
        assert_eq!(
            crashed.get(format!("k{i:03}").as_bytes()).unwrap(),
            Some(b"stable".to_vec())
        );
    }
    crashed.close().unwrap();
}
