// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Engine-generic assertions, instantiated by each engine's test file.

use coffer::{Action, Db, ErrorCode, Visitor};

pub fn set_get<D: Db>(db: &D) {
    db.set(b"foo", b"hop").unwrap();
    db.set(b"bar", b"step").unwrap();
    db.set(b"baz", b"jump").unwrap();
    assert_eq!(db.get(b"foo").unwrap(), Some(b"hop".to_vec()));
    assert_eq!(db.get(b"bar").unwrap(), Some(b"step".to_vec()));
    assert_eq!(db.get(b"baz").unwrap(), Some(b"jump".to_vec()));
    assert_eq!(db.get(b"qux").unwrap(), None);
    assert_eq!(db.count().unwrap(), 3);
}

pub fn overwrite_is_idempotent<D: Db>(db: &D) {
    db.set(b"k", b"v").unwrap();
    db.set(b"k", b"v").unwrap();
    assert_eq!(db.count().unwrap(), 1);
    assert_eq!(db.get(b"k").unwrap(), Some(b"v".to_vec()));
    db.set(b"k", b"w").unwrap();
    assert_eq!(db.get(b"k").unwrap(), Some(b"w".to_vec()));
    assert_eq!(db.count().unwrap(), 1);
}

pub fn add_remove<D: Db>(db: &D) {
    db.add(b"k", b"v1").unwrap();
    let err = db.add(b"k", b"v2").unwrap_err();
    assert_eq!(err.code(), ErrorCode::DupRec);
    assert_eq!(db.get(b"k").unwrap(), Some(b"v1".to_vec()));
    db.remove(b"k").unwrap();
    let err = db.remove(b"k").unwrap_err();
    assert_eq!(err.code(), ErrorCode::NoRec);
    assert_eq!(db.count().unwrap(), 0);
}

pub fn replace_requires_presence<D: Db>(db: &D) {
    let err = db.replace(b"nope", b"v").unwrap_err();
    assert_eq!(err.code(), ErrorCode::NoRec);
    db.set(b"k", b"v").unwrap();
    db.replace(b"k", b"w").unwrap();
    assert_eq!(db.get(b"k").unwrap(), Some(b"w".to_vec()));
}

pub fn append<D: Db>(db: &D) {
    db.append(b"k", b"abc").unwrap();
    db.append(b"k", b"def").unwrap();
    assert_eq!(db.get(b"k").unwrap(), Some(b"abcdef".to_vec()));
}

pub fn cas<D: Db>(db: &D) {
    db.set(b"x", b"1").unwrap();
    db.cas(b"x", Some(b"1"), Some(b"2")).unwrap();
    let err = db.cas(b"x", Some(b"1"), Some(b"3")).unwrap_err();
    assert_eq!(err.code(), ErrorCode::Logic);
    assert_eq!(db.get(b"x").unwrap(), Some(b"2".to_vec()));
    // Expected-absent works for creation, and removal by swap to None.
    db.cas(b"y", None, Some(b"1")).unwrap();
    db.cas(b"y", Some(b"1"), None).unwrap();
    assert_eq!(db.get(b"y").unwrap(), None);
}

pub fn increment<D: Db>(db: &D) {
    assert_eq!(db.increment(b"n", 5).unwrap(), 5);
    assert_eq!(db.increment(b"n", 3).unwrap(), 8);
    assert_eq!(db.increment(b"n", -10).unwrap(), -2);
    // The stored form is an 8-byte big-endian two's complement word.
    let raw = db.get(b"n").unwrap().unwrap();
    assert_eq!(raw, (-2i64).to_be_bytes().to_vec());
    // Adding zero reads without writing.
    assert_eq!(db.increment(b"n", 0).unwrap(), -2);
    db.set(b"text", b"not a number").unwrap();
    let err = db.increment(b"text", 1).unwrap_err();
    assert_eq!(err.code(), ErrorCode::Logic);
}

pub fn increment_double<D: Db>(db: &D) {
    let one = db.increment_double(b"d", 1.5).unwrap();
    assert!((one - 1.5).abs() < 1e-9);
    let two = db.increment_double(b"d", 0.25).unwrap();
    assert!((two - 1.75).abs() < 1e-9);
    let raw = db.get(b"d").unwrap().unwrap();
    assert_eq!(raw.len(), 16);
    // An infinite result commits the saturation sentinel and succeeds;
    // the record then stays pinned at infinity.
    let inf = db.increment_double(b"inf", f64::INFINITY).unwrap();
    assert!(inf.is_infinite() && inf > 0.0);
    let still = db.increment_double(b"inf", 1.0).unwrap();
    assert!(still.is_infinite() && still > 0.0);
    let neg = db.increment_double(b"ninf", f64::NEG_INFINITY).unwrap();
    assert!(neg.is_infinite() && neg < 0.0);
    // NaN is the logic error, and it poisons the record it touches.
    let err = db.increment_double(b"nan", f64::NAN).unwrap_err();
    assert_eq!(err.code(), ErrorCode::Logic);
    let err = db.increment_double(b"nan", 1.0).unwrap_err();
    assert_eq!(err.code(), ErrorCode::Logic);
}

pub fn seize_and_check<D: Db>(db: &D) {
    db.set(b"k", b"v").unwrap();
    assert_eq!(db.check(b"k").unwrap(), Some(1));
    assert_eq!(db.seize(b"k").unwrap(), Some(b"v".to_vec()));
    assert_eq!(db.seize(b"k").unwrap(), None);
    assert_eq!(db.check(b"k").unwrap(), None);
}

struct Counter {
    visits: usize,
}

impl Visitor for Counter {
    fn visit_full(&mut self, _key: &[u8], _value: &[u8]) -> Action {
        self.visits += 1;
        Action::Keep
    }
}

pub fn iterate_visits_each_once<D: Db>(db: &D) {
    for i in 0..100u32 {
        db.set(format!("key{i:03}").as_bytes(), &i.to_be_bytes())
            .unwrap();
    }
    let mut counter = Counter { visits: 0 };
    db.iterate(&mut counter, false).unwrap();
    assert_eq!(counter.visits, 100);
    assert_eq!(db.count().unwrap(), 100);
}

struct Doubler;

impl Visitor for Doubler {
    fn visit_full(&mut self, _key: &[u8], value: &[u8]) -> Action {
        let mut doubled = value.to_vec();
        doubled.extend_from_slice(value);
        Action::Replace(doubled)
    }
}

pub fn iterate_can_rewrite<D: Db>(db: &D) {
    for i in 0..20u32 {
        db.set(format!("k{i}").as_bytes(), b"ab").unwrap();
    }
    db.iterate(&mut Doubler, true).unwrap();
    assert_eq!(db.count().unwrap(), 20);
    assert_eq!(db.get(b"k7").unwrap(), Some(b"abab".to_vec()));
}

pub fn values_roundtrip_bytewise<D: Db>(db: &D) {
    let sizes = [0usize, 1, 7, 256, 4096, 70_000];
    for (i, size) in sizes.iter().enumerate() {
        let value: Vec<u8> = (0..*size).map(|j| (i + j) as u8).collect();
        let key = format!("blob{i}");
        db.set(key.as_bytes(), &value).unwrap();
        assert_eq!(db.get(key.as_bytes()).unwrap(), Some(value));
    }
    assert_eq!(db.count().unwrap(), sizes.len() as u64);
}

/// The fifth end-to-end scenario: an aborted transaction leaves the
/// database exactly at its state from `begin_transaction`.
pub fn transaction_abort<D: Db>(db: &D) {
    db.set(b"a", b"1").unwrap();
    db.begin_transaction(false).unwrap();
    db.set(b"a", b"2").unwrap();
    db.set(b"b", b"3").unwrap();
    db.end_transaction(false).unwrap();
    assert_eq!(db.get(b"a").unwrap(), Some(b"1".to_vec()));
    assert_eq!(db.get(b"b").unwrap(), None);
    assert_eq!(db.count().unwrap(), 1);
}

pub fn transaction_commit<D: Db>(db: &D) {
    db.set(b"a", b"1").unwrap();
    db.begin_transaction(false).unwrap();
    db.set(b"a", b"2").unwrap();
    db.remove(b"a").unwrap();
    db.set(b"b", b"3").unwrap();
    db.end_transaction(true).unwrap();
    assert_eq!(db.get(b"a").unwrap(), None);
    assert_eq!(db.get(b"b").unwrap(), Some(b"3".to_vec()));
    assert_eq!(db.count().unwrap(), 1);
}

pub fn transaction_abort_restores_removals<D: Db>(db: &D) {
    db.set(b"a", b"old").unwrap();
    db.begin_transaction(false).unwrap();
    db.remove(b"a").unwrap();
    db.end_transaction(false).unwrap();
    assert_eq!(db.get(b"a").unwrap(), Some(b"old".to_vec()));
}

pub fn double_begin_is_refused<D: Db>(db: &D) {
    db.begin_transaction(false).unwrap();
    let err = db.begin_transaction_try(false).unwrap_err();
    assert_eq!(err.code(), ErrorCode::Logic);
    db.end_transaction(true).unwrap();
}

pub fn clear_empties<D: Db>(db: &D) {
    for i in 0..32u32 {
        db.set(&i.to_be_bytes(), b"v").unwrap();
    }
    db.clear().unwrap();
    assert_eq!(db.count().unwrap(), 0);
    assert_eq!(db.get(&7u32.to_be_bytes()).unwrap(), None);
    db.set(b"again", b"works").unwrap();
    assert_eq!(db.count().unwrap(), 1);
}

pub fn snapshot_roundtrip<D: Db, E: Db>(src: &D, dest: &E) {
    for i in 0..50u32 {
        src.set(format!("s{i}").as_bytes(), &i.to_le_bytes()).unwrap();
    }
    let mut buf = Vec::new();
    src.dump_snapshot(&mut buf).unwrap();
    dest.load_snapshot(&mut buf.as_slice()).unwrap();
    assert_eq!(dest.count().unwrap(), 50);
    assert_eq!(
        dest.get(b"s31").unwrap(),
        Some(31u32.to_le_bytes().to_vec())
    );
}
