// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! The uniform database contract: the record-visitor protocol, the open
//! mode bitmask and the `Db` trait whose higher-level operations are all
//! derived from [`Db::accept`].

use crate::error::{Error, Result};
use byteorder::{BigEndian, ByteOrder};
use enumflags2::{bitflags, BitFlags};
use std::collections::BTreeMap;
use std::io::{Read, Write};

/// Decision returned by a visitor for one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Leave the record as it is (or absent).
    Keep,
    /// Delete the record; a no-op when the record does not exist.
    Remove,
    /// Write the given value, creating the record if absent.
    Replace(Vec<u8>),
}

/// Callback object invoked by an engine with a key and, when the record
/// exists, its current value.
///
/// For the duration of one visitor call on a key, no other thread observes
/// or mutates that key. A visitor is invoked at most once per `accept`.
pub trait Visitor {
    /// Called when the record exists.
    fn visit_full(&mut self, _key: &[u8], _value: &[u8]) -> Action {
        Action::Keep
    }

    /// Called when no record exists. `Remove` is treated as `Keep`.
    fn visit_empty(&mut self, _key: &[u8]) -> Action {
        Action::Keep
    }
}

/// Connection modes for [`Db::open`].
#[bitflags]
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Open as a reader.
    Reader = 0b0_0000_0001,
    /// Open as a writer.
    Writer = 0b0_0000_0010,
    /// Create the database if it does not exist (writer only).
    Create = 0b0_0000_0100,
    /// Create the database regardless of existing content (writer only).
    Truncate = 0b0_0000_1000,
    /// Perform each mutation in an implicit transaction.
    AutoTran = 0b0_0001_0000,
    /// Follow each mutation with implicit synchronization.
    AutoSync = 0b0_0010_0000,
    /// Open without file locking.
    NoLock = 0b0_0100_0000,
    /// Fail fast instead of blocking when the file is locked.
    TryLock = 0b0_1000_0000,
    /// Do not repair a broken file implicitly.
    NoRepair = 0b1_0000_0000,
}

/// Combination of [`OpenMode`] flags.
pub type Mode = BitFlags<OpenMode>;

/// Scale of the fractional word of [`Db::increment_double`] values.
const DECIMAL_UNIT: i64 = 1_000_000_000_000_000;

const SNAPSHOT_MAGIC: &[u8] = b"COFSNAP\n";
const SNAPSHOT_REC: u8 = 0x01;
const SNAPSHOT_END: u8 = 0x00;

/// Uniform interface of all storage engines.
///
/// `accept` and `iterate` are the primitives; every other record operation
/// is a provided method expressed as a specific visitor.
pub trait Db {
    /// Open the database. Every opened database must be closed.
    ///
    /// A process must not open the same database twice concurrently.
    fn open(&self, path: &str, mode: Mode) -> Result<()>;

    /// Close the database, flushing caches and committing or aborting any
    /// outstanding transaction.
    fn close(&self) -> Result<()>;

    /// Accept a visitor for one record. The visit is atomic per key.
    fn accept(&self, key: &[u8], visitor: &mut dyn Visitor, writable: bool) -> Result<()>;

    /// Accept a visitor for every live record under a whole-database
    /// barrier. Each live record is visited exactly once.
    fn iterate(&self, visitor: &mut dyn Visitor, writable: bool) -> Result<()>;

    /// Flush updated content to the file system and, if `hard`, the device.
    fn synchronize(&self, hard: bool) -> Result<()>;

    /// Begin a transaction, waiting out a concurrent one.
    fn begin_transaction(&self, hard: bool) -> Result<()>;

    /// Begin a transaction or fail with a logic error if one is active.
    fn begin_transaction_try(&self, hard: bool) -> Result<()>;

    /// Commit (`true`) or abort (`false`) the current transaction.
    fn end_transaction(&self, commit: bool) -> Result<()>;

    /// Remove all records.
    fn clear(&self) -> Result<()>;

    /// Number of live records.
    fn count(&self) -> Result<u64>;

    /// Size of the database file, or memory usage for in-memory engines.
    fn size(&self) -> Result<u64>;

    /// Path the database was opened with.
    fn path(&self) -> Result<String>;

    /// Miscellaneous status information.
    fn status(&self) -> Result<BTreeMap<String, String>>;

    /// Store a record, overwriting an existing one.
    fn set(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let mut visitor = Setter { value };
        self.accept(key, &mut visitor, true)
    }

    /// Store a record only if the key is absent.
    fn add(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let mut visitor = Adder {
            value,
            existed: false,
        };
        self.accept(key, &mut visitor, true)?;
        if visitor.existed {
            return Err(Error::DupRec);
        }
        Ok(())
    }

    /// Overwrite the value of an existing record.
    fn replace(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let mut visitor = Replacer {
            value,
            found: false,
        };
        self.accept(key, &mut visitor, true)?;
        if !visitor.found {
            return Err(Error::NoRec);
        }
        Ok(())
    }

    /// Append to the value of a record, creating it if absent.
    fn append(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let mut visitor = Appender { value };
        self.accept(key, &mut visitor, true)
    }

    /// Add `num` to the numeric value of a record and return the result.
    ///
    /// Values are 8-byte big-endian two's complement. Adding zero reads the
    /// current value without writing.
    fn increment(&self, key: &[u8], num: i64) -> Result<i64> {
        let mut visitor = Incrementor {
            num,
            out: num,
            malformed: false,
        };
        self.accept(key, &mut visitor, true)?;
        if visitor.malformed {
            return Err(Error::Logic("incompatible value"));
        }
        Ok(visitor.out)
    }

    /// Add `num` to the decimal value of a record and return the result.
    ///
    /// Values are two big-endian 64-bit words: the integer part and the
    /// fraction in units of 10⁻¹⁵. An infinite result is committed as a
    /// saturation sentinel and sticks across further additions; a NaN
    /// result fails with a logic error.
    fn increment_double(&self, key: &[u8], num: f64) -> Result<f64> {
        let mut visitor = DoubleIncrementor {
            num,
            out: num,
            malformed: false,
        };
        self.accept(key, &mut visitor, true)?;
        if visitor.malformed {
            return Err(Error::Logic("incompatible value"));
        }
        Ok(visitor.out)
    }

    /// Compare-and-swap: `old` of `None` expects absence, `new` of `None`
    /// removes. Fails with a logic error when the assumption is wrong.
    fn cas(&self, key: &[u8], old: Option<&[u8]>, new: Option<&[u8]>) -> Result<()> {
        let mut visitor = CasVisitor {
            old,
            new,
            matched: false,
        };
        self.accept(key, &mut visitor, true)?;
        if !visitor.matched {
            return Err(Error::Logic("status conflict"));
        }
        Ok(())
    }

    /// Remove a record.
    fn remove(&self, key: &[u8]) -> Result<()> {
        let mut visitor = Remover { found: false };
        self.accept(key, &mut visitor, true)?;
        if !visitor.found {
            return Err(Error::NoRec);
        }
        Ok(())
    }

    /// Retrieve the value of a record, or `None` if the key is absent.
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let mut visitor = Getter { value: None };
        self.accept(key, &mut visitor, false)?;
        Ok(visitor.value)
    }

    /// Retrieve and remove the value of a record atomically.
    fn seize(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let mut visitor = Seizer { value: None };
        self.accept(key, &mut visitor, true)?;
        Ok(visitor.value)
    }

    /// Size of the value of a record without copying it.
    fn check(&self, key: &[u8]) -> Result<Option<usize>> {
        let mut visitor = Checker { size: None };
        self.accept(key, &mut visitor, false)?;
        Ok(visitor.size)
    }

    /// Write every record to `dest` as a flat snapshot stream.
    fn dump_snapshot(&self, dest: &mut dyn Write) -> Result<()> {
        dest.write_all(SNAPSHOT_MAGIC)?;
        let mut visitor = SnapshotDumper { dest, error: None };
        self.iterate(&mut visitor, false)?;
        if let Some(err) = visitor.error {
            return Err(err.into());
        }
        dest.write_all(&[SNAPSHOT_END])?;
        Ok(())
    }

    /// Replace the whole content with the records of a snapshot stream.
    fn load_snapshot(&self, src: &mut dyn Read) -> Result<()> {
        let mut magic = [0u8; 8];
        src.read_exact(&mut magic)?;
        if magic != SNAPSHOT_MAGIC {
            return Err(Error::Broken("invalid snapshot magic".into()));
        }
        self.clear()?;
        loop {
            let mut tag = [0u8; 1];
            src.read_exact(&mut tag)?;
            match tag[0] {
                SNAPSHOT_END => return Ok(()),
                SNAPSHOT_REC => {
                    let ksiz = read_stream_varnum(src)?;
                    let vsiz = read_stream_varnum(src)?;
                    let mut key = vec![0u8; ksiz as usize];
                    src.read_exact(&mut key)?;
                    let mut value = vec![0u8; vsiz as usize];
                    src.read_exact(&mut value)?;
                    self.set(&key, &value)?;
                }
                _ => return Err(Error::Broken("invalid snapshot record".into())),
            }
        }
    }
}

fn read_stream_varnum(src: &mut dyn Read) -> Result<u64> {
    let mut num: u64 = 0;
    loop {
        let mut byte = [0u8; 1];
        src.read_exact(&mut byte)?;
        num = (num << 7) + u64::from(byte[0] & 0x7f);
        if byte[0] < 0x80 {
            return Ok(num);
        }
    }
}

/// Iteration handle over the records of a database.
///
/// A cursor may be invalidated or repositioned by writers; stepping past
/// the last record leaves it unplaced and further access fails with
/// `NoRec`.
pub trait Cursor {
    /// Accept a visitor for the current record, optionally advancing.
    fn accept(&mut self, visitor: &mut dyn Visitor, writable: bool, step: bool) -> Result<()>;

    /// Move to the first record.
    fn jump(&mut self) -> Result<()>;

    /// Move onto (or, for ordered engines, at or after) the given key.
    fn jump_key(&mut self, key: &[u8]) -> Result<()>;

    /// Move to the next record.
    fn step(&mut self) -> Result<()>;

    /// Key of the current record.
    fn get_key(&mut self) -> Result<Vec<u8>> {
        Ok(self.get(false)?.0)
    }

    /// Value of the current record.
    fn get_value(&mut self) -> Result<Vec<u8>> {
        Ok(self.get(false)?.1)
    }

    /// Key and value of the current record, optionally advancing.
    fn get(&mut self, step: bool) -> Result<(Vec<u8>, Vec<u8>)> {
        let mut visitor = PairGetter { pair: None };
        self.accept(&mut visitor, false, step)?;
        visitor.pair.ok_or(Error::NoRec)
    }

    /// Remove the current record.
    fn remove(&mut self) -> Result<()> {
        let mut visitor = Remover { found: false };
        self.accept(&mut visitor, true, false)?;
        if !visitor.found {
            return Err(Error::NoRec);
        }
        Ok(())
    }
}

struct Setter<'a> {
    value: &'a [u8],
}

impl Visitor for Setter<'_> {
    fn visit_full(&mut self, _key: &[u8], _value: &[u8]) -> Action {
        Action::Replace(self.value.to_vec())
    }

    fn visit_empty(&mut self, _key: &[u8]) -> Action {
        Action::Replace(self.value.to_vec())
    }
}

struct Adder<'a> {
    value: &'a [u8],
    existed: bool,
}

impl Visitor for Adder<'_> {
    fn visit_full(&mut self, _key: &[u8], _value: &[u8]) -> Action {
        self.existed = true;
        Action::Keep
    }

    fn visit_empty(&mut self, _key: &[u8]) -> Action {
        Action::Replace(self.value.to_vec())
    }
}

struct Replacer<'a> {
    value: &'a [u8],
    found: bool,
}

impl Visitor for Replacer<'_> {
    fn visit_full(&mut self, _key: &[u8], _value: &[u8]) -> Action {
        self.found = true;
        Action::Replace(self.value.to_vec())
    }
}

struct Appender<'a> {
    value: &'a [u8],
}

impl Visitor for Appender<'_> {
    fn visit_full(&mut self, _key: &[u8], value: &[u8]) -> Action {
        let mut merged = Vec::with_capacity(value.len() + self.value.len());
        merged.extend_from_slice(value);
        merged.extend_from_slice(self.value);
        Action::Replace(merged)
    }

    fn visit_empty(&mut self, _key: &[u8]) -> Action {
        Action::Replace(self.value.to_vec())
    }
}

struct Incrementor {
    num: i64,
    out: i64,
    malformed: bool,
}

impl Visitor for Incrementor {
    fn visit_full(&mut self, _key: &[u8], value: &[u8]) -> Action {
        if value.len() != 8 {
            self.malformed = true;
            return Action::Keep;
        }
        let orig = BigEndian::read_i64(value);
        if self.num == 0 {
            self.out = orig;
            return Action::Keep;
        }
        self.out = orig.wrapping_add(self.num);
        let mut buf = vec![0u8; 8];
        BigEndian::write_i64(&mut buf, self.out);
        Action::Replace(buf)
    }

    fn visit_empty(&mut self, _key: &[u8]) -> Action {
        self.out = self.num;
        let mut buf = vec![0u8; 8];
        BigEndian::write_i64(&mut buf, self.num);
        Action::Replace(buf)
    }
}

struct DoubleIncrementor {
    num: f64,
    out: f64,
    malformed: bool,
}

impl DoubleIncrementor {
    fn encode(integ: i64, fract: i64) -> Vec<u8> {
        let mut buf = vec![0u8; 16];
        BigEndian::write_i64(&mut buf[0..8], integ);
        BigEndian::write_i64(&mut buf[8..16], fract);
        buf
    }

    /// Decompose the increment and merge it into the stored words.
    ///
    /// A finite integer part adds with fractional carry; an infinite one
    /// saturates the record to the infinity sentinel; NaN poisons the
    /// record with the NaN sentinel and surfaces as a logic error.
    fn merge(&mut self, integ: i64, fract: i64) -> Action {
        let dinteg = self.num.trunc();
        let dfract = self.num.fract();
        if dinteg.is_finite() {
            let mut integ = integ.wrapping_add(dinteg as i64);
            let mut fract = fract.wrapping_add((dfract * DECIMAL_UNIT as f64) as i64);
            if fract >= DECIMAL_UNIT {
                integ += 1;
                fract -= DECIMAL_UNIT;
            }
            self.out = integ as f64 + fract as f64 / DECIMAL_UNIT as f64;
            Action::Replace(Self::encode(integ, fract))
        } else if dinteg.is_infinite() {
            self.out = dinteg;
            let sentinel = if dinteg > 0.0 { i64::MAX } else { i64::MIN };
            Action::Replace(Self::encode(sentinel, 0))
        } else {
            self.malformed = true;
            self.out = f64::NAN;
            Action::Replace(Self::encode(i64::MIN, i64::MIN))
        }
    }
}

impl Visitor for DoubleIncrementor {
    fn visit_full(&mut self, _key: &[u8], value: &[u8]) -> Action {
        if value.len() != 16 {
            self.malformed = true;
            return Action::Keep;
        }
        let integ = BigEndian::read_i64(&value[0..8]);
        let fract = BigEndian::read_i64(&value[8..16]);
        if integ == i64::MIN && fract == i64::MIN {
            self.malformed = true;
            return Action::Keep;
        }
        if integ == i64::MAX {
            self.out = f64::INFINITY;
            return Action::Keep;
        }
        if integ == i64::MIN {
            self.out = f64::NEG_INFINITY;
            return Action::Keep;
        }
        if self.num == 0.0 {
            self.out = integ as f64 + fract as f64 / DECIMAL_UNIT as f64;
            return Action::Keep;
        }
        self.merge(integ, fract)
    }

    fn visit_empty(&mut self, _key: &[u8]) -> Action {
        let dinteg = self.num.trunc();
        let dfract = self.num.fract();
        if dinteg.is_finite() {
            self.out = self.num;
            Action::Replace(Self::encode(
                dinteg as i64,
                (dfract * DECIMAL_UNIT as f64) as i64,
            ))
        } else if dinteg.is_infinite() {
            self.out = dinteg;
            let sentinel = if dinteg > 0.0 { i64::MAX } else { i64::MIN };
            Action::Replace(Self::encode(sentinel, 0))
        } else {
            self.malformed = true;
            self.out = f64::NAN;
            Action::Replace(Self::encode(i64::MIN, i64::MIN))
        }
    }
}

struct CasVisitor<'a> {
    old: Option<&'a [u8]>,
    new: Option<&'a [u8]>,
    matched: bool,
}

impl Visitor for CasVisitor<'_> {
    fn visit_full(&mut self, _key: &[u8], value: &[u8]) -> Action {
        match self.old {
            Some(old) if old == value => {
                self.matched = true;
                match self.new {
                    Some(new) => Action::Replace(new.to_vec()),
                    None => Action::Remove,
                }
            }
            _ => Action::Keep,
        }
    }

    fn visit_empty(&mut self, _key: &[u8]) -> Action {
        match self.old {
            None => {
                self.matched = true;
                match self.new {
                    Some(new) => Action::Replace(new.to_vec()),
                    None => Action::Keep,
                }
            }
            Some(_) => Action::Keep,
        }
    }
}

pub(crate) struct Remover {
    pub(crate) found: bool,
}

impl Visitor for Remover {
    fn visit_full(&mut self, _key: &[u8], _value: &[u8]) -> Action {
        self.found = true;
        Action::Remove
    }
}

struct Getter {
    value: Option<Vec<u8>>,
}

impl Visitor for Getter {
    fn visit_full(&mut self, _key: &[u8], value: &[u8]) -> Action {
        self.value = Some(value.to_vec());
        Action::Keep
    }
}

struct Seizer {
    value: Option<Vec<u8>>,
}

impl Visitor for Seizer {
    fn visit_full(&mut self, _key: &[u8], value: &[u8]) -> Action {
        self.value = Some(value.to_vec());
        Action::Remove
    }
}

struct Checker {
    size: Option<usize>,
}

impl Visitor for Checker {
    fn visit_full(&mut self, _key: &[u8], value: &[u8]) -> Action {
        self.size = Some(value.len());
        Action::Keep
    }
}

struct PairGetter {
    pair: Option<(Vec<u8>, Vec<u8>)>,
}

impl Visitor for PairGetter {
    fn visit_full(&mut self, key: &[u8], value: &[u8]) -> Action {
        self.pair = Some((key.to_vec(), value.to_vec()));
        Action::Keep
    }
}

struct SnapshotDumper<'a> {
    dest: &'a mut dyn Write,
    error: Option<std::io::Error>,
}

impl Visitor for SnapshotDumper<'_> {
    fn visit_full(&mut self, key: &[u8], value: &[u8]) -> Action {
        if self.error.is_some() {
            return Action::Keep;
        }
        let mut frame = Vec::with_capacity(key.len() + value.len() + 11);
        frame.push(SNAPSHOT_REC);
        crate::util::write_varnum(&mut frame, key.len() as u64);
        crate::util::write_varnum(&mut frame, value.len() as u64);
        frame.extend_from_slice(key);
        frame.extend_from_slice(value);
        if let Err(err) = self.dest.write_all(&frame) {
            self.error = Some(err);
        }
        Action::Keep
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_bits_match_contract() {
        assert_eq!(OpenMode::Reader as u16, 1);
        assert_eq!(OpenMode::Writer as u16, 2);
        assert_eq!(OpenMode::Create as u16, 4);
        assert_eq!(OpenMode::Truncate as u16, 8);
        assert_eq!(OpenMode::AutoTran as u16, 16);
        assert_eq!(OpenMode::AutoSync as u16, 32);
        assert_eq!(OpenMode::NoLock as u16, 64);
        assert_eq!(OpenMode::TryLock as u16, 128);
        assert_eq!(OpenMode::NoRepair as u16, 256);
    }

    #[test]
    fn double_words_decompose() {
        let mut visitor = DoubleIncrementor {
            num: -2.5,
            out: 0.0,
            malformed: false,
        };
        let Action::Replace(buf) = visitor.visit_empty(b"d") else {
            panic!("expected a write");
        };
        assert_eq!(BigEndian::read_i64(&buf[0..8]), -2);
        assert_eq!(BigEndian::read_i64(&buf[8..16]), -500_000_000_000_000);
        assert_eq!(visitor.out, -2.5);
        assert!(!visitor.malformed);
    }

    #[test]
    fn double_infinity_saturates_to_sentinel() {
        let mut visitor = DoubleIncrementor {
            num: f64::INFINITY,
            out: 0.0,
            malformed: false,
        };
        let Action::Replace(buf) = visitor.visit_empty(b"d") else {
            panic!("expected a write");
        };
        assert_eq!(BigEndian::read_i64(&buf[0..8]), i64::MAX);
        assert_eq!(BigEndian::read_i64(&buf[8..16]), 0);
        assert!(visitor.out.is_infinite() && visitor.out > 0.0);
        assert!(!visitor.malformed);
        // The sentinel reads back as infinity and further additions keep
        // the record untouched.
        let mut visitor = DoubleIncrementor {
            num: 1.0,
            out: 0.0,
            malformed: false,
        };
        assert_eq!(visitor.visit_full(b"d", &buf), Action::Keep);
        assert!(visitor.out.is_infinite() && visitor.out > 0.0);
        assert!(!visitor.malformed);
    }

    #[test]
    fn double_nan_poisons_the_record() {
        let mut visitor = DoubleIncrementor {
            num: f64::NAN,
            out: 0.0,
            malformed: false,
        };
        let Action::Replace(buf) = visitor.visit_empty(b"d") else {
            panic!("expected a write");
        };
        assert!(visitor.malformed);
        assert_eq!(BigEndian::read_i64(&buf[0..8]), i64::MIN);
        assert_eq!(BigEndian::read_i64(&buf[8..16]), i64::MIN);
        // Reading the poisoned record fails the same way.
        let mut visitor = DoubleIncrementor {
            num: 1.0,
            out: 0.0,
            malformed: false,
        };
        assert_eq!(visitor.visit_full(b"d", &buf), Action::Keep);
        assert!(visitor.malformed);
    }
}
