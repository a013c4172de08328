// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! In-memory cache engine with LRU eviction.
//!
//! Records live in sixteen independently locked slots. Each slot keeps a
//! slab of records threaded onto a doubly linked LRU chain and indexed by
//! a hash map; every touched record moves to the MRU tail and takes a
//! fresh global sequence number. Growth past the count or byte cap evicts
//! the slot head carrying the smallest sequence, so eviction follows the
//! database-wide recency order even though the chains are striped.
//! Transactions keep per-slot undo logs of pre-images, replayed in
//! reverse on abort. Cursors address records by slot and slab index and
//! are stepped off a record before it is removed, so slab reuse can never
//! strand them.

use crate::codec::{Compressor, DeflateCodec};
use crate::db::{Action, Cursor, Db, Mode, OpenMode, Visitor};
use crate::error::{Error, Result};
use crate::util::hash_record;
use ahash::AHashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU16, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

/// Number of slot tables.
const SLOT_NUM: usize = 16;
/// Default bucket count, kept for status compatibility.
const DEF_BNUM: u64 = 1_048_583;
/// Maximum size of each key.
const KSIZ_MAX: usize = 0xfffff;
/// Accounting weight of a record beyond its key and value bytes.
const REC_OVERHEAD: u64 = 48;
/// Null slab index.
const NIL: usize = usize::MAX;

/// Tuning options bitmap.
pub mod opts {
    /// Compress each stored value.
    pub const TCOMPRESS: u8 = 1 << 2;
}

struct CacheRec {
    key: Box<[u8]>,
    value: Vec<u8>,
    seq: u64,
    prev: usize,
    next: usize,
}

impl CacheRec {
    fn weight(&self) -> u64 {
        REC_OVERHEAD + self.key.len() as u64 + self.value.len() as u64
    }
}

enum TranLog {
    /// The record existed; `value` is its stored (possibly compressed) form.
    Full { key: Vec<u8>, value: Vec<u8> },
    /// The record did not exist.
    Empty { key: Vec<u8> },
}

struct SlotCore {
    map: AHashMap<Box<[u8]>, usize>,
    slab: Vec<Option<CacheRec>>,
    free: Vec<usize>,
    first: usize,
    last: usize,
    trlogs: Vec<TranLog>,
}

impl SlotCore {
    fn new() -> Self {
        SlotCore {
            map: AHashMap::new(),
            slab: Vec::new(),
            free: Vec::new(),
            first: NIL,
            last: NIL,
            trlogs: Vec::new(),
        }
    }

    fn rec(&self, idx: usize) -> &CacheRec {
        self.slab[idx].as_ref().expect("live slab index")
    }

    fn rec_mut(&mut self, idx: usize) -> &mut CacheRec {
        self.slab[idx].as_mut().expect("live slab index")
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = {
            let rec = self.rec(idx);
            (rec.prev, rec.next)
        };
        if prev != NIL {
            self.rec_mut(prev).next = next;
        } else {
            self.first = next;
        }
        if next != NIL {
            self.rec_mut(next).prev = prev;
        } else {
            self.last = prev;
        }
    }

    fn push_tail(&mut self, idx: usize) {
        let last = self.last;
        {
            let rec = self.rec_mut(idx);
            rec.prev = last;
            rec.next = NIL;
        }
        if last != NIL {
            self.rec_mut(last).next = idx;
        } else {
            self.first = idx;
        }
        self.last = idx;
    }

    /// Move a record to the MRU tail with a fresh sequence number.
    fn touch(&mut self, idx: usize, seq: u64) {
        if self.last != idx {
            self.unlink(idx);
            self.push_tail(idx);
        }
        self.rec_mut(idx).seq = seq;
    }

    /// Insert a stored-form record at the MRU tail; returns its weight.
    fn insert(&mut self, key: &[u8], value: Vec<u8>, seq: u64) -> u64 {
        let rec = CacheRec {
            key: key.to_vec().into_boxed_slice(),
            value,
            seq,
            prev: NIL,
            next: NIL,
        };
        let weight = rec.weight();
        let idx = match self.free.pop() {
            Some(idx) => {
                self.slab[idx] = Some(rec);
                idx
            }
            None => {
                self.slab.push(Some(rec));
                self.slab.len() - 1
            }
        };
        self.map.insert(key.to_vec().into_boxed_slice(), idx);
        self.push_tail(idx);
        weight
    }

    /// Remove a record and return its weight. Cursors must have been
    /// escaped off it already.
    fn remove(&mut self, idx: usize) -> u64 {
        self.unlink(idx);
        let rec = self.slab[idx].take().expect("live slab index");
        self.map.remove(&rec.key);
        self.free.push(idx);
        rec.weight()
    }

    fn clear(&mut self) {
        self.map.clear();
        self.slab.clear();
        self.free.clear();
        self.first = NIL;
        self.last = NIL;
        self.trlogs.clear();
    }
}

type CurPos = Option<(usize, usize)>;

/// On-memory hash database with LRU deletion.
pub struct CacheDb {
    mlock: RwLock<()>,
    slots: Vec<Mutex<SlotCore>>,
    omode: AtomicU16,
    writer: AtomicBool,
    opts: AtomicU8,
    bnum: AtomicU64,
    capcnt: AtomicI64,
    capsiz: AtomicI64,
    count: AtomicI64,
    size: AtomicI64,
    seq: AtomicU64,
    embcomp: Mutex<Arc<dyn Compressor>>,
    comp: Mutex<Option<Arc<dyn Compressor>>>,
    opaque: Mutex<[u8; 16]>,
    path: Mutex<String>,
    tran: AtomicBool,
    cursors: Mutex<Vec<Arc<Mutex<CurPos>>>>,
}

impl Default for CacheDb {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheDb {
    pub fn new() -> Self {
        let mut slots = Vec::with_capacity(SLOT_NUM);
        slots.resize_with(SLOT_NUM, || Mutex::new(SlotCore::new()));
        CacheDb {
            mlock: RwLock::new(()),
            slots,
            omode: AtomicU16::new(0),
            writer: AtomicBool::new(false),
            opts: AtomicU8::new(0),
            bnum: AtomicU64::new(DEF_BNUM),
            capcnt: AtomicI64::new(-1),
            capsiz: AtomicI64::new(-1),
            count: AtomicI64::new(0),
            size: AtomicI64::new(0),
            seq: AtomicU64::new(0),
            embcomp: Mutex::new(Arc::new(DeflateCodec)),
            comp: Mutex::new(None),
            opaque: Mutex::new([0u8; 16]),
            path: Mutex::new(String::new()),
            tran: AtomicBool::new(false),
            cursors: Mutex::new(Vec::new()),
        }
    }

    /// Set the optional features bitmap (`cache::opts`).
    pub fn tune_options(&self, opts: u8) -> Result<()> {
        self.check_closed()?;
        self.opts.store(opts, Ordering::Release);
        Ok(())
    }

    /// Set the bucket count hint.
    pub fn tune_buckets(&self, bnum: u64) -> Result<()> {
        self.check_closed()?;
        self.bnum
            .store(if bnum > 0 { bnum } else { DEF_BNUM }, Ordering::Release);
        Ok(())
    }

    /// Set the value compressor used under `TCOMPRESS`.
    pub fn tune_compressor(&self, comp: Arc<dyn Compressor>) -> Result<()> {
        self.check_closed()?;
        *self.embcomp.lock() = comp;
        Ok(())
    }

    /// Cap the number of records; negative disables the cap.
    pub fn cap_count(&self, count: i64) -> Result<()> {
        self.check_closed()?;
        self.capcnt.store(count, Ordering::Release);
        Ok(())
    }

    /// Cap the memory usage in bytes; negative disables the cap.
    pub fn cap_size(&self, size: i64) -> Result<()> {
        self.check_closed()?;
        self.capsiz.store(size, Ordering::Release);
        Ok(())
    }

    /// The 16-byte opaque user slot.
    pub fn opaque(&self) -> Result<[u8; 16]> {
        self.check_open(false)?;
        Ok(*self.opaque.lock())
    }

    /// Overwrite the 16-byte opaque user slot.
    pub fn set_opaque(&self, data: [u8; 16]) -> Result<()> {
        self.check_open(true)?;
        *self.opaque.lock() = data;
        Ok(())
    }

    /// Create a cursor over the records, initially unplaced.
    pub fn cursor(&self) -> CacheCursor<'_> {
        let pos = Arc::new(Mutex::new(None));
        self.cursors.lock().push(Arc::clone(&pos));
        CacheCursor { db: self, pos }
    }

    fn check_closed(&self) -> Result<()> {
        if self.omode.load(Ordering::Acquire) != 0 {
            return Err(Error::Invalid("already opened"));
        }
        Ok(())
    }

    fn check_open(&self, writable: bool) -> Result<()> {
        if self.omode.load(Ordering::Acquire) == 0 {
            return Err(Error::Invalid("not opened"));
        }
        if writable && !self.writer.load(Ordering::Acquire) {
            return Err(Error::NoPerm("permission denied"));
        }
        Ok(())
    }

    fn slot_of(key: &[u8]) -> usize {
        (hash_record(key) % SLOT_NUM as u64) as usize
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::AcqRel)
    }

    fn compress(&self, value: Vec<u8>) -> Result<Vec<u8>> {
        match &*self.comp.lock() {
            Some(comp) => comp.compress(&value),
            None => Ok(value),
        }
    }

    fn decompress(&self, stored: &[u8]) -> Result<Vec<u8>> {
        match &*self.comp.lock() {
            Some(comp) => comp.decompress(stored),
            None => Ok(stored.to_vec()),
        }
    }

    fn over_caps(&self) -> bool {
        let capcnt = self.capcnt.load(Ordering::Acquire);
        if capcnt >= 0 && self.count.load(Ordering::Acquire) > capcnt {
            return true;
        }
        let capsiz = self.capsiz.load(Ordering::Acquire);
        capsiz >= 0 && self.size.load(Ordering::Acquire) > capsiz
    }

    /// First record of the first populated slot at or after `from`.
    fn first_of_slots(&self, from: usize) -> CurPos {
        for sidx in from..SLOT_NUM {
            let core = self.slots[sidx].lock();
            if core.first != NIL {
                return Some((sidx, core.first));
            }
        }
        None
    }

    /// Step every cursor sitting on `(sidx, ridx)` to the record's
    /// successor. A `NIL` successor leaves the cursor parked past the end
    /// of the slot; cursor operations resolve that into the next slot's
    /// head lazily, so no other slot lock is needed here.
    fn escape_cursors(&self, sidx: usize, ridx: usize, core: &SlotCore) {
        let next = core.rec(ridx).next;
        let cursors = self.cursors.lock();
        for cur in cursors.iter() {
            let mut pos = cur.lock();
            if *pos == Some((sidx, ridx)) {
                *pos = Some((sidx, next));
            }
        }
    }

    fn disable_cursors(&self) {
        for cur in self.cursors.lock().iter() {
            *cur.lock() = None;
        }
    }

    /// Evict the globally least-recent record until the caps are met.
    ///
    /// Must be called without any slot lock held; slots are locked one at
    /// a time, so there is no ordering hazard.
    fn enforce_caps(&self) {
        while self.over_caps() {
            let mut victim: Option<(usize, u64)> = None;
            for sidx in 0..SLOT_NUM {
                let core = self.slots[sidx].lock();
                if core.first != NIL {
                    let seq = core.rec(core.first).seq;
                    if victim.map_or(true, |(_, best)| seq < best) {
                        victim = Some((sidx, seq));
                    }
                }
            }
            let Some((sidx, _)) = victim else {
                return;
            };
            let mut core = self.slots[sidx].lock();
            let head = core.first;
            if head == NIL {
                continue;
            }
            self.escape_cursors(sidx, head, &core);
            let weight = core.remove(head);
            self.count.fetch_sub(1, Ordering::AcqRel);
            self.size.fetch_sub(weight as i64, Ordering::AcqRel);
        }
    }

    /// The single mutation path of the engine. `iter` suppresses LRU
    /// promotion so a full walk does not reorder the chain. Returns
    /// whether the database grew, in which case the caller enforces the
    /// caps after releasing the slot lock.
    fn accept_impl(
        &self,
        sidx: usize,
        core: &mut SlotCore,
        key: &[u8],
        visitor: &mut dyn Visitor,
        writable: bool,
        iter: bool,
    ) -> Result<bool> {
        let tran = self.tran.load(Ordering::Acquire);
        match core.map.get(key).copied() {
            Some(idx) => {
                let plain = self.decompress(&core.rec(idx).value)?;
                let action = visitor.visit_full(key, &plain);
                if !writable && !matches!(action, Action::Keep) {
                    return Err(Error::NoPerm("permission denied"));
                }
                match action {
                    Action::Keep => {
                        if !iter && core.last != idx {
                            self.escape_cursors(sidx, idx, core);
                            core.touch(idx, self.next_seq());
                        }
                        Ok(false)
                    }
                    Action::Remove => {
                        if tran {
                            core.trlogs.push(TranLog::Full {
                                key: key.to_vec(),
                                value: core.rec(idx).value.clone(),
                            });
                        }
                        self.escape_cursors(sidx, idx, core);
                        let weight = core.remove(idx);
                        self.count.fetch_sub(1, Ordering::AcqRel);
                        self.size.fetch_sub(weight as i64, Ordering::AcqRel);
                        Ok(false)
                    }
                    Action::Replace(value) => {
                        let stored = self.compress(value)?;
                        if tran {
                            core.trlogs.push(TranLog::Full {
                                key: key.to_vec(),
                                value: core.rec(idx).value.clone(),
                            });
                        }
                        let old_len = core.rec(idx).value.len() as i64;
                        let diff = stored.len() as i64 - old_len;
                        core.rec_mut(idx).value = stored;
                        self.size.fetch_add(diff, Ordering::AcqRel);
                        if !iter && core.last != idx {
                            self.escape_cursors(sidx, idx, core);
                            core.touch(idx, self.next_seq());
                        }
                        Ok(diff > 0 && !tran)
                    }
                }
            }
            None => {
                let action = visitor.visit_empty(key);
                if !writable && matches!(action, Action::Replace(_)) {
                    return Err(Error::NoPerm("permission denied"));
                }
                if let Action::Replace(value) = action {
                    let stored = self.compress(value)?;
                    if tran {
                        core.trlogs.push(TranLog::Empty { key: key.to_vec() });
                    }
                    let weight = core.insert(key, stored, self.next_seq());
                    self.count.fetch_add(1, Ordering::AcqRel);
                    self.size.fetch_add(weight as i64, Ordering::AcqRel);
                    return Ok(!tran);
                }
                Ok(false)
            }
        }
    }

    /// Replay a slot's undo log in reverse, restoring pre-images.
    fn apply_trlogs(&self, core: &mut SlotCore) {
        let logs: Vec<TranLog> = core.trlogs.drain(..).collect();
        for log in logs.into_iter().rev() {
            match log {
                TranLog::Full { key, value } => match core.map.get(key.as_slice()).copied() {
                    Some(idx) => {
                        let old_len = core.rec(idx).value.len() as i64;
                        let diff = value.len() as i64 - old_len;
                        core.rec_mut(idx).value = value;
                        self.size.fetch_add(diff, Ordering::AcqRel);
                    }
                    None => {
                        let weight = core.insert(&key, value, self.seq.fetch_add(1, Ordering::AcqRel));
                        self.count.fetch_add(1, Ordering::AcqRel);
                        self.size.fetch_add(weight as i64, Ordering::AcqRel);
                    }
                },
                TranLog::Empty { key } => {
                    if let Some(idx) = core.map.get(key.as_slice()).copied() {
                        let weight = core.remove(idx);
                        self.count.fetch_sub(1, Ordering::AcqRel);
                        self.size.fetch_sub(weight as i64, Ordering::AcqRel);
                    }
                }
            }
        }
    }
}

impl Db for CacheDb {
    fn open(&self, path: &str, mode: Mode) -> Result<()> {
        let _g = self.mlock.write();
        self.check_closed()?;
        if !mode.contains(OpenMode::Writer) && !mode.contains(OpenMode::Reader) {
            return Err(Error::Invalid("invalid open mode"));
        }
        *self.comp.lock() = if self.opts.load(Ordering::Acquire) & opts::TCOMPRESS != 0 {
            Some(Arc::clone(&*self.embcomp.lock()))
        } else {
            None
        };
        *self.opaque.lock() = [0u8; 16];
        *self.path.lock() = path.to_string();
        self.count.store(0, Ordering::Release);
        self.size.store(0, Ordering::Release);
        self.writer
            .store(mode.contains(OpenMode::Writer), Ordering::Release);
        self.omode.store(mode.bits(), Ordering::Release);
        Ok(())
    }

    fn close(&self) -> Result<()> {
        let _g = self.mlock.write();
        self.check_open(false)?;
        self.disable_cursors();
        self.tran.store(false, Ordering::Release);
        for slot in &self.slots {
            slot.lock().clear();
        }
        self.count.store(0, Ordering::Release);
        self.size.store(0, Ordering::Release);
        *self.path.lock() = String::new();
        self.omode.store(0, Ordering::Release);
        self.writer.store(false, Ordering::Release);
        Ok(())
    }

    fn accept(&self, key: &[u8], visitor: &mut dyn Visitor, writable: bool) -> Result<()> {
        let _g = self.mlock.read();
        self.check_open(writable)?;
        let key = &key[..key.len().min(KSIZ_MAX)];
        let sidx = Self::slot_of(key);
        let grew = {
            let mut core = self.slots[sidx].lock();
            self.accept_impl(sidx, &mut core, key, visitor, writable, false)?
        };
        if grew {
            self.enforce_caps();
        }
        Ok(())
    }

    fn iterate(&self, visitor: &mut dyn Visitor, writable: bool) -> Result<()> {
        let _g = self.mlock.write();
        self.check_open(writable)?;
        let mut grew = false;
        for sidx in 0..SLOT_NUM {
            let mut core = self.slots[sidx].lock();
            let mut idx = core.first;
            while idx != NIL {
                if core.slab[idx].is_none() {
                    break;
                }
                let next = core.rec(idx).next;
                let key = core.rec(idx).key.to_vec();
                grew |= self.accept_impl(sidx, &mut core, &key, visitor, writable, true)?;
                idx = next;
            }
        }
        if grew {
            self.enforce_caps();
        }
        Ok(())
    }

    fn synchronize(&self, _hard: bool) -> Result<()> {
        let _g = self.mlock.read();
        self.check_open(true)?;
        Ok(())
    }

    fn begin_transaction(&self, _hard: bool) -> Result<()> {
        let mut wait = std::time::Duration::from_millis(1);
        loop {
            let guard = self.mlock.write();
            self.check_open(true)?;
            if !self.tran.load(Ordering::Acquire) {
                self.tran.store(true, Ordering::Release);
                return Ok(());
            }
            drop(guard);
            std::thread::sleep(wait);
            wait = (wait * 2).min(std::time::Duration::from_secs(1));
        }
    }

    fn begin_transaction_try(&self, _hard: bool) -> Result<()> {
        let _g = self.mlock.write();
        self.check_open(true)?;
        if self.tran.load(Ordering::Acquire) {
            return Err(Error::Logic("competition avoided"));
        }
        self.tran.store(true, Ordering::Release);
        Ok(())
    }

    fn end_transaction(&self, commit: bool) -> Result<()> {
        let _g = self.mlock.write();
        self.check_open(true)?;
        if !self.tran.load(Ordering::Acquire) {
            return Err(Error::Invalid("not in transaction"));
        }
        if !commit {
            self.disable_cursors();
        }
        for slot in &self.slots {
            let mut core = slot.lock();
            if commit {
                core.trlogs.clear();
            } else {
                self.apply_trlogs(&mut core);
            }
        }
        self.tran.store(false, Ordering::Release);
        self.enforce_caps();
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        let _g = self.mlock.write();
        self.check_open(true)?;
        self.disable_cursors();
        for slot in &self.slots {
            slot.lock().clear();
        }
        self.count.store(0, Ordering::Release);
        self.size.store(0, Ordering::Release);
        *self.opaque.lock() = [0u8; 16];
        Ok(())
    }

    fn count(&self) -> Result<u64> {
        self.check_open(false)?;
        Ok(self.count.load(Ordering::Acquire).max(0) as u64)
    }

    fn size(&self) -> Result<u64> {
        self.check_open(false)?;
        Ok(self.size.load(Ordering::Acquire).max(0) as u64)
    }

    fn path(&self) -> Result<String> {
        self.check_open(false)?;
        Ok(self.path.lock().clone())
    }

    fn status(&self) -> Result<BTreeMap<String, String>> {
        let _g = self.mlock.read();
        self.check_open(false)?;
        let mut map = BTreeMap::new();
        map.insert("type".into(), "CacheDb".into());
        map.insert("path".into(), self.path.lock().clone());
        map.insert("opts".into(), self.opts.load(Ordering::Acquire).to_string());
        map.insert("bnum".into(), self.bnum.load(Ordering::Acquire).to_string());
        map.insert("capcnt".into(), self.capcnt.load(Ordering::Acquire).to_string());
        map.insert("capsiz".into(), self.capsiz.load(Ordering::Acquire).to_string());
        map.insert("recovered".into(), "0".into());
        map.insert("reorganized".into(), "0".into());
        map.insert(
            "count".into(),
            self.count.load(Ordering::Acquire).max(0).to_string(),
        );
        map.insert(
            "size".into(),
            self.size.load(Ordering::Acquire).max(0).to_string(),
        );
        Ok(map)
    }
}

/// Cursor over the records of a [`CacheDb`], in LRU order per slot.
pub struct CacheCursor<'a> {
    db: &'a CacheDb,
    pos: Arc<Mutex<CurPos>>,
}

impl CacheCursor<'_> {
    /// Current position, resolving a parked past-end-of-slot sentinel
    /// left behind by cursor escapes. Runs under the method lock.
    fn resolve(&self) -> Result<(usize, usize)> {
        let cur = *self.pos.lock();
        match cur {
            None => Err(Error::NoRec),
            Some((sidx, ridx)) if ridx != NIL => Ok((sidx, ridx)),
            Some((sidx, _)) => {
                let pos = self.db.first_of_slots(sidx + 1);
                *self.pos.lock() = pos;
                pos.ok_or(Error::NoRec)
            }
        }
    }
}

impl Cursor for CacheCursor<'_> {
    fn accept(&mut self, visitor: &mut dyn Visitor, writable: bool, step: bool) -> Result<()> {
        let _g = self.db.mlock.write();
        self.db.check_open(writable)?;
        let (sidx, ridx) = self.resolve()?;
        let mut core = self.db.slots[sidx].lock();
        if ridx >= core.slab.len() || core.slab[ridx].is_none() {
            *self.pos.lock() = None;
            return Err(Error::NoRec);
        }
        let key = core.rec(ridx).key.to_vec();
        let plain = self.db.decompress(&core.rec(ridx).value)?;
        let action = visitor.visit_full(&key, &plain);
        if !writable && !matches!(action, Action::Keep) {
            return Err(Error::NoPerm("permission denied"));
        }
        let tran = self.db.tran.load(Ordering::Acquire);
        match action {
            Action::Keep => {
                if step {
                    let next = core.rec(ridx).next;
                    *self.pos.lock() = if next != NIL {
                        Some((sidx, next))
                    } else {
                        drop(core);
                        self.db.first_of_slots(sidx + 1)
                    };
                }
            }
            Action::Remove => {
                if tran {
                    let value = core.rec(ridx).value.clone();
                    core.trlogs.push(TranLog::Full {
                        key: key.clone(),
                        value,
                    });
                }
                // Escaping moves this cursor to the successor itself.
                self.db.escape_cursors(sidx, ridx, &core);
                let weight = core.remove(ridx);
                self.db.count.fetch_sub(1, Ordering::AcqRel);
                self.db.size.fetch_sub(weight as i64, Ordering::AcqRel);
            }
            Action::Replace(value) => {
                let stored = self.db.compress(value)?;
                if tran {
                    let value = core.rec(ridx).value.clone();
                    core.trlogs.push(TranLog::Full {
                        key: key.clone(),
                        value,
                    });
                }
                let old_len = core.rec(ridx).value.len() as i64;
                let diff = stored.len() as i64 - old_len;
                core.rec_mut(ridx).value = stored;
                self.db.size.fetch_add(diff, Ordering::AcqRel);
                if step {
                    let next = core.rec(ridx).next;
                    *self.pos.lock() = if next != NIL {
                        Some((sidx, next))
                    } else {
                        drop(core);
                        self.db.first_of_slots(sidx + 1)
                    };
                }
            }
        }
        Ok(())
    }

    fn jump(&mut self) -> Result<()> {
        let _g = self.db.mlock.write();
        self.db.check_open(false)?;
        let pos = self.db.first_of_slots(0);
        *self.pos.lock() = pos;
        if pos.is_none() {
            return Err(Error::NoRec);
        }
        Ok(())
    }

    fn jump_key(&mut self, key: &[u8]) -> Result<()> {
        let _g = self.db.mlock.write();
        self.db.check_open(false)?;
        let key = &key[..key.len().min(KSIZ_MAX)];
        let sidx = CacheDb::slot_of(key);
        let found = self.db.slots[sidx].lock().map.get(key).copied();
        match found {
            Some(idx) => {
                *self.pos.lock() = Some((sidx, idx));
                Ok(())
            }
            None => {
                *self.pos.lock() = None;
                Err(Error::NoRec)
            }
        }
    }

    fn step(&mut self) -> Result<()> {
        let _g = self.db.mlock.write();
        self.db.check_open(false)?;
        let (sidx, ridx) = self.resolve()?;
        let next = {
            let core = self.db.slots[sidx].lock();
            if ridx >= core.slab.len() || core.slab[ridx].is_none() {
                NIL
            } else {
                core.rec(ridx).next
            }
        };
        let pos = if next != NIL {
            Some((sidx, next))
        } else {
            self.db.first_of_slots(sidx + 1)
        };
        *self.pos.lock() = pos;
        if pos.is_none() {
            return Err(Error::NoRec);
        }
        Ok(())
    }
}

impl Drop for CacheCursor<'_> {
    fn drop(&mut self) {
        self.db
            .cursors
            .lock()
            .retain(|c| !Arc::ptr_eq(c, &self.pos));
    }
}
