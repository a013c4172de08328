// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

mod subtests;

use coffer::{Db, ErrorCode, OpenMode, PolyDb};

#[test]
fn poly_star_selects_cache() {
    let db = PolyDb::new();
    db.open("*", OpenMode::Writer | OpenMode::Create).unwrap();
    assert_eq!(db.status().unwrap()["type"], "CacheDb");
    subtests::set_get(&db);
    db.close().unwrap();
}

#[test]
fn poly_cfh_selects_hash() {
    let dir = tempfile::tempdir().unwrap();
    let db = PolyDb::new();
    db.open(
        dir.path().join("t.cfh").to_str().unwrap(),
        OpenMode::Writer | OpenMode::Create,
    )
    .unwrap();
    assert_eq!(db.status().unwrap()["type"], "HashDb");
    subtests::set_get(&db);
    db.close().unwrap();
}

#[test]
fn poly_default_selects_tree() {
    let dir = tempfile::tempdir().unwrap();
    let db = PolyDb::new();
    db.open(
        dir.path().join("t.cft").to_str().unwrap(),
        OpenMode::Writer | OpenMode::Create,
    )
    .unwrap();
    assert_eq!(db.status().unwrap()["type"], "TreeDb");
    subtests::set_get(&db);
    db.close().unwrap();
}

#[test]
fn poly_transactions_delegate() {
    let dir = tempfile::tempdir().unwrap();
    let db = PolyDb::new();
    db.open(
        dir.path().join("t.cft").to_str().unwrap(),
        OpenMode::Writer | OpenMode::Create,
    )
    .unwrap();
    subtests::transaction_abort(&db);
    db.close().unwrap();
}

#[test]
fn poly_unopened_is_invalid() {
    let db = PolyDb::new();
    let err = db.count().unwrap_err();
    assert_eq!(err.code(), ErrorCode::Invalid);
}

#[test]
fn poly_reopen_after_close() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("t.cfh");
    let db = PolyDb::new();
    db.open(
        path.to_str().unwrap(),
        OpenMode::Writer | OpenMode::Create,
    )
    .unwrap();
    db.set(b"k", b"v").unwrap();
    db.close().unwrap();
    db.open(path.to_str().unwrap(), OpenMode::Reader.into())
        .unwrap();
    assert_eq!(db.get(b"k").unwrap(), Some(b"v".to_vec()));
    db.close().unwrap();
}
