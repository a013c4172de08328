// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Durable file hash engine.
//!
//! The file starts with a fixed 128-byte header, followed by the bucket
//! array and the record region. Each bucket points at a chain of records,
//! shaped as a binary tree ordered by fold hash then key (or a singly
//! linked list under `TLINEAR`). Freed regions are pooled in memory and
//! reused largest-first; the pool rebuilds from a region scan at every
//! writer open. In-place writes inside a transaction are pre-imaged in the
//! write-ahead log owned by the underlying file.

mod fbp;

pub use fbp::FreeBlockPool;

use crate::codec::{Compressor, DeflateCodec};
use crate::db::{Action, Cursor, Db, Mode, OpenMode, Visitor};
use crate::error::{Error, Result};
use crate::file::MappedFile;
use crate::lock::SlottedRwLock;
use crate::util::{
    align_up, compare_chain_keys, fold_hash, hash_record, read_varnum, size_varnum, write_varnum,
};
use byteorder::{BigEndian, ByteOrder};
use parking_lot::{Mutex, RwLock};
use std::cmp::Ordering as CmpOrdering;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Magic data identifying the file format.
const MAGIC: [u8; 16] = *b"COFFERDB\n\0\0\0\0\0\0\0";
/// Library major version stored in the header.
const LIB_VER: u8 = 2;
/// Library minor version stored in the header.
const LIB_REV: u8 = 0;
/// Format version; bumped whenever the byte layout changes.
const FMT_VER: u8 = 5;
/// Size of the fixed header.
const HEADER_SIZE: u64 = 128;
/// Header offsets of the meta fields.
const MOFF_LIBVER: usize = 16;
const MOFF_LIBREV: usize = 17;
const MOFF_FMTVER: usize = 18;
const MOFF_ENDIAN: usize = 19;
const MOFF_APOW: usize = 20;
const MOFF_FPOW: usize = 21;
const MOFF_OPTS: usize = 22;
const MOFF_FLAGS: usize = 23;
const MOFF_BNUM: usize = 24;
const MOFF_COUNT: usize = 32;
const MOFF_SIZE: usize = 40;
const MOFF_OPAQUE: usize = 48;
/// Magic byte heading a live record.
const REC_MAGIC: u8 = 0xcc;
/// Magic byte heading a free block.
const FB_MAGIC: u8 = 0xbb;
/// Marker closing the record region of a cleanly shut down file.
const EOF_MAGIC: [u8; 4] = [0xee, 0x4f, 0x46, 0x0a];
/// Bytes of a free block header: magic plus 32-bit region size.
const FB_HEADER: u64 = 5;
/// Default bucket count.
const DEF_BNUM: u64 = 1_048_583;
/// Default alignment power.
const DEF_APOW: u8 = 3;
/// Default free-block-pool power.
const DEF_FPOW: u8 = 10;
/// Default size of the mapped prefix.
const DEF_MSIZ: u64 = 64 << 20;
/// Stripes of the per-key reader/writer lock.
const RLOCK_SLOTS: usize = 64;
/// Largest value the record padding field can hold.
const PAD_MAX: u64 = u16::MAX as u64;

/// Tuning options bitmap stored in the header.
pub mod opts {
    /// 32-bit offsets instead of 48-bit.
    pub const TSMALL: u8 = 1 << 0;
    /// Linear collision chaining instead of binary trees.
    pub const TLINEAR: u8 = 1 << 1;
    /// Compress each stored value.
    pub const TCOMPRESS: u8 = 1 << 2;
}

/// Status flags bitmap stored in the header.
pub mod flags {
    /// The database is open (or was not shut down cleanly).
    pub const FOPEN: u8 = 1 << 0;
    /// A fatal error was observed.
    pub const FFATAL: u8 = 1 << 1;
}

struct TranSnapshot {
    count: u64,
    pool: FreeBlockPool,
}

/// Where the pointer to a record lives, so a chain can be relinked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Edge {
    Bucket(u64),
    Left(u64),
    Right(u64),
}

/// Parsed on-file record metadata.
#[derive(Debug, Clone)]
struct Rec {
    off: u64,
    rsiz: u64,
    psiz: u16,
    fold: u32,
    left: u64,
    right: u64,
    ksiz: u64,
    vsiz: u64,
    boff: u64,
}

/// Durable hash database on a single file.
pub struct HashDb {
    mlock: RwLock<()>,
    rlock: SlottedRwLock,
    file: MappedFile,
    fbp: Mutex<FreeBlockPool>,
    tran: Mutex<Option<TranSnapshot>>,
    tran_active: AtomicBool,
    atlock: Mutex<()>,
    omode: AtomicU16,
    writer: AtomicBool,
    autotran: AtomicBool,
    autosync: AtomicBool,
    apow: AtomicU8,
    fpow: AtomicU8,
    opts: AtomicU8,
    flags: AtomicU8,
    bnum: AtomicU64,
    msiz: AtomicU64,
    dfunit: AtomicU64,
    align: AtomicU64,
    width: AtomicU8,
    roff: AtomicU64,
    count: AtomicU64,
    recovered: AtomicBool,
    reorganized: AtomicBool,
    embcomp: Mutex<Arc<dyn Compressor>>,
    comp: Mutex<Option<Arc<dyn Compressor>>>,
    path: Mutex<PathBuf>,
    opaque: Mutex<[u8; 16]>,
}

impl Default for HashDb {
    fn default() -> Self {
        Self::new()
    }
}

impl HashDb {
    pub fn new() -> Self {
        HashDb {
            mlock: RwLock::new(()),
            rlock: SlottedRwLock::new(RLOCK_SLOTS),
            file: MappedFile::new(),
            fbp: Mutex::new(FreeBlockPool::new(1 << DEF_FPOW)),
            tran: Mutex::new(None),
            tran_active: AtomicBool::new(false),
            atlock: Mutex::new(()),
            omode: AtomicU16::new(0),
            writer: AtomicBool::new(false),
            autotran: AtomicBool::new(false),
            autosync: AtomicBool::new(false),
            apow: AtomicU8::new(DEF_APOW),
            fpow: AtomicU8::new(DEF_FPOW),
            opts: AtomicU8::new(0),
            flags: AtomicU8::new(0),
            bnum: AtomicU64::new(DEF_BNUM),
            msiz: AtomicU64::new(DEF_MSIZ),
            dfunit: AtomicU64::new(0),
            align: AtomicU64::new(1 << DEF_APOW),
            width: AtomicU8::new(6),
            roff: AtomicU64::new(0),
            count: AtomicU64::new(0),
            recovered: AtomicBool::new(false),
            reorganized: AtomicBool::new(false),
            embcomp: Mutex::new(Arc::new(DeflateCodec)),
            comp: Mutex::new(None),
            path: Mutex::new(PathBuf::new()),
            opaque: Mutex::new([0u8; 16]),
        }
    }

    /// Set the power of the record size alignment.
    pub fn tune_alignment(&self, apow: u8) -> Result<()> {
        self.check_closed()?;
        if apow > 15 {
            return Err(Error::Invalid("alignment power out of range"));
        }
        self.apow.store(apow, Ordering::Release);
        Ok(())
    }

    /// Set the power of the free-block pool capacity.
    pub fn tune_fbp(&self, fpow: u8) -> Result<()> {
        self.check_closed()?;
        if fpow > 20 {
            return Err(Error::Invalid("free block pool power out of range"));
        }
        self.fpow.store(fpow, Ordering::Release);
        Ok(())
    }

    /// Set the optional features bitmap (`opts::*`).
    pub fn tune_options(&self, opts: u8) -> Result<()> {
        self.check_closed()?;
        self.opts.store(opts, Ordering::Release);
        Ok(())
    }

    /// Set the bucket count of the hash table.
    pub fn tune_buckets(&self, bnum: u64) -> Result<()> {
        self.check_closed()?;
        self.bnum
            .store(if bnum > 0 { bnum } else { DEF_BNUM }, Ordering::Release);
        Ok(())
    }

    /// Set the size of the mapped prefix.
    pub fn tune_map(&self, msiz: u64) -> Result<()> {
        self.check_closed()?;
        self.msiz.store(msiz, Ordering::Release);
        Ok(())
    }

    /// Set the fragmentation unit that triggers automatic defragmentation.
    pub fn tune_defrag(&self, dfunit: u64) -> Result<()> {
        self.check_closed()?;
        self.dfunit.store(dfunit, Ordering::Release);
        Ok(())
    }

    /// Set the value compressor used under `TCOMPRESS`.
    pub fn tune_compressor(&self, comp: Arc<dyn Compressor>) -> Result<()> {
        self.check_closed()?;
        *self.embcomp.lock() = comp;
        Ok(())
    }

    /// The 16-byte opaque user slot.
    pub fn opaque(&self) -> Result<[u8; 16]> {
        self.check_open(false)?;
        Ok(*self.opaque.lock())
    }

    /// Overwrite the 16-byte opaque user slot and persist it.
    pub fn set_opaque(&self, data: [u8; 16]) -> Result<()> {
        let _g = self.mlock.write();
        self.check_open(true)?;
        *self.opaque.lock() = data;
        self.dump_meta()
    }

    /// Whether the last open replayed a write-ahead log.
    pub fn recovered(&self) -> bool {
        self.recovered.load(Ordering::Acquire)
    }

    /// Whether the last open repaired the region and rebuilt the chains.
    pub fn reorganized(&self) -> bool {
        self.reorganized.load(Ordering::Acquire)
    }

    /// The status flags bitmap (`flags::*`).
    pub fn flags(&self) -> u8 {
        self.flags.load(Ordering::Acquire)
    }

    /// Create a cursor over the records, initially unplaced.
    pub fn cursor(&self) -> HashCursor<'_> {
        HashCursor { db: self, pos: None }
    }

    /// Perform at most `step` defragmentation moves, or compact the whole
    /// region when `step` is zero or negative.
    pub fn defrag(&self, step: i64) -> Result<()> {
        let _g = self.mlock.write();
        self.check_open(true)?;
        self.defrag_impl(step)
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

    fn offset_width(&self) -> u64 {
        u64::from(self.width.load(Ordering::Acquire))
    }

    fn alignment(&self) -> u64 {
        self.align.load(Ordering::Acquire)
    }

    fn linear(&self) -> bool {
        self.opts.load(Ordering::Acquire) & opts::TLINEAR != 0
    }

    /// Bytes of a record header before the size varints.
    fn rec_head(&self) -> u64 {
        if self.linear() {
            1 + 2 + self.offset_width()
        } else {
            1 + 2 + 4 + 2 * self.offset_width()
        }
    }

    fn bucket_off(&self, bidx: u64) -> u64 {
        HEADER_SIZE + bidx * self.offset_width()
    }

    fn read_bucket(&self, bidx: u64) -> Result<u64> {
        let width = self.offset_width() as usize;
        let mut buf = [0u8; 8];
        self.file.read_into(self.bucket_off(bidx), &mut buf[..width])?;
        Ok(BigEndian::read_uint(&buf[..width], width) << self.apow.load(Ordering::Acquire))
    }

    fn write_bucket(&self, bidx: u64, off: u64) -> Result<()> {
        let width = self.offset_width() as usize;
        let mut buf = [0u8; 8];
        BigEndian::write_uint(
            &mut buf[..width],
            off >> self.apow.load(Ordering::Acquire),
            width,
        );
        self.file.write(self.bucket_off(bidx), &buf[..width])
    }

    /// Offset of a record's left (or linear-next) and right pointer cells.
    fn child_cell(&self, rec_off: u64, right: bool) -> u64 {
        let base = if self.linear() {
            rec_off + 1 + 2
        } else {
            rec_off + 1 + 2 + 4
        };
        if right {
            base + self.offset_width()
        } else {
            base
        }
    }

    fn write_child(&self, rec_off: u64, right: bool, target: u64) -> Result<()> {
        let width = self.offset_width() as usize;
        let mut buf = [0u8; 8];
        BigEndian::write_uint(
            &mut buf[..width],
            target >> self.apow.load(Ordering::Acquire),
            width,
        );
        self.file.write(self.child_cell(rec_off, right), &buf[..width])
    }

    fn write_edge(&self, edge: Edge, target: u64) -> Result<()> {
        match edge {
            Edge::Bucket(bidx) => self.write_bucket(bidx, target),
            Edge::Left(off) => self.write_child(off, false, target),
            Edge::Right(off) => self.write_child(off, true, target),
        }
    }

    /// Parse the record metadata at `off`.
    fn read_rec(&self, off: u64) -> Result<Rec> {
        let lsiz = self.file.size();
        let head = self.rec_head();
        let max = (head + 20).min(lsiz.saturating_sub(off));
        if max < head + 2 {
            return Err(Error::Broken(format!("record spills the region: off={off}")));
        }
        let buf = self.file.read(off, max as usize)?;
        if buf[0] != REC_MAGIC {
            return Err(Error::Broken(format!(
                "invalid record magic: off={} magic={:#04x}",
                off, buf[0]
            )));
        }
        let psiz = BigEndian::read_u16(&buf[1..3]);
        let width = self.offset_width() as usize;
        let apow = self.apow.load(Ordering::Acquire);
        let (fold, left, right, mut pos) = if self.linear() {
            let next = BigEndian::read_uint(&buf[3..3 + width], width) << apow;
            (0u32, next, 0u64, 3 + width)
        } else {
            let fold = BigEndian::read_u32(&buf[3..7]);
            let left = BigEndian::read_uint(&buf[7..7 + width], width) << apow;
            let right = BigEndian::read_uint(&buf[7 + width..7 + 2 * width], width) << apow;
            (fold, left, right, 7 + 2 * width)
        };
        let (ksiz, kstep) = read_varnum(&buf[pos..])
            .ok_or_else(|| Error::Broken(format!("truncated key size: off={off}")))?;
        pos += kstep;
        let (vsiz, vstep) = read_varnum(&buf[pos..])
            .ok_or_else(|| Error::Broken(format!("truncated value size: off={off}")))?;
        pos += vstep;
        let boff = off + pos as u64;
        let rsiz = pos as u64 + ksiz + vsiz + u64::from(psiz);
        if off + rsiz > lsiz {
            return Err(Error::Broken(format!(
                "record spills the region: off={off} rsiz={rsiz}"
            )));
        }
        Ok(Rec {
            off,
            rsiz,
            psiz,
            fold,
            left,
            right,
            ksiz,
            vsiz,
            boff,
        })
    }

    fn read_key(&self, rec: &Rec) -> Result<Vec<u8>> {
        self.file.read(rec.boff, rec.ksiz as usize)
    }

    fn read_value(&self, rec: &Rec) -> Result<Vec<u8>> {
        let raw = self.file.read(rec.boff + rec.ksiz, rec.vsiz as usize)?;
        match &*self.comp.lock() {
            Some(comp) => comp.decompress(&raw),
            None => Ok(raw),
        }
    }

    /// Serialize a record into a buffer of exactly `rsiz` bytes.
    fn build_rec(
        &self,
        fold: u32,
        left: u64,
        right: u64,
        key: &[u8],
        value: &[u8],
        rsiz: u64,
    ) -> Vec<u8> {
        let width = self.offset_width() as usize;
        let apow = self.apow.load(Ordering::Acquire);
        let mut buf = Vec::with_capacity(rsiz as usize);
        buf.push(REC_MAGIC);
        buf.extend_from_slice(&[0u8; 2]); // padding size, patched below
        let mut cell = [0u8; 8];
        if self.linear() {
            BigEndian::write_uint(&mut cell[..width], left >> apow, width);
            buf.extend_from_slice(&cell[..width]);
        } else {
            let mut fbuf = [0u8; 4];
            BigEndian::write_u32(&mut fbuf, fold);
            buf.extend_from_slice(&fbuf);
            BigEndian::write_uint(&mut cell[..width], left >> apow, width);
            buf.extend_from_slice(&cell[..width]);
            BigEndian::write_uint(&mut cell[..width], right >> apow, width);
            buf.extend_from_slice(&cell[..width]);
        }
        write_varnum(&mut buf, key.len() as u64);
        write_varnum(&mut buf, value.len() as u64);
        buf.extend_from_slice(key);
        buf.extend_from_slice(value);
        let psiz = rsiz - buf.len() as u64;
        debug_assert!(psiz <= PAD_MAX);
        BigEndian::write_u16(&mut buf[1..3], psiz as u16);
        buf.resize(rsiz as usize, 0);
        buf
    }

    fn used_size(&self, ksiz: usize, vsiz: usize) -> u64 {
        self.rec_head() + size_varnum(ksiz as u64) as u64 + size_varnum(vsiz as u64) as u64
            + ksiz as u64
            + vsiz as u64
    }

    /// Mark a region free on disk and pool it.
    fn free_region(&self, off: u64, size: u64) -> Result<()> {
        let mut head = [0u8; FB_HEADER as usize];
        head[0] = FB_MAGIC;
        BigEndian::write_u32(&mut head[1..], size as u32);
        self.file.write(off, &head)?;
        self.fbp.lock().insert(off, size);
        Ok(())
    }

    /// Claim space for an aligned region of `asiz` bytes; `None` means
    /// append at the end of the region.
    fn claim(&self, asiz: u64) -> Result<Option<(u64, u64)>> {
        let align = self.alignment();
        let mut pool = self.fbp.lock();
        let Some((boff, bsiz)) = pool.fetch(asiz) else {
            return Ok(None);
        };
        let rem = bsiz - asiz;
        if rem >= FB_HEADER.max(align) {
            drop(pool);
            // Return the tail to the pool under its own header.
            self.free_region(boff + asiz, rem)?;
            Ok(Some((boff, asiz)))
        } else {
            Ok(Some((boff, bsiz)))
        }
    }

    /// Write a brand-new record and return its offset and region size.
    fn emit_rec(
        &self,
        fold: u32,
        left: u64,
        right: u64,
        key: &[u8],
        value: &[u8],
    ) -> Result<(u64, u64)> {
        let used = self.used_size(key.len(), value.len());
        let asiz = align_up(used, self.alignment());
        match self.claim(asiz)? {
            Some((off, rsiz)) => {
                let buf = self.build_rec(fold, left, right, key, value, rsiz);
                self.file.write(off, &buf)?;
                Ok((off, rsiz))
            }
            None => {
                let buf = self.build_rec(fold, left, right, key, value, asiz);
                let off = self.file.append(&buf)?;
                Ok((off, asiz))
            }
        }
    }

    /// Walk the chain of `bidx` looking for `key`. Returns the record and
    /// the edge pointing at it, or the null edge where it would hang.
    fn search_chain(
        &self,
        bidx: u64,
        fold: u32,
        key: &[u8],
    ) -> Result<(Edge, Option<Rec>)> {
        let mut edge = Edge::Bucket(bidx);
        let mut off = self.read_bucket(bidx)?;
        if self.linear() {
            while off != 0 {
                let rec = self.read_rec(off)?;
                let rkey = self.read_key(&rec)?;
                if rkey == key {
                    return Ok((edge, Some(rec)));
                }
                edge = Edge::Left(off);
                off = rec.left;
            }
            return Ok((edge, None));
        }
        while off != 0 {
            let rec = self.read_rec(off)?;
            match fold.cmp(&rec.fold) {
                CmpOrdering::Less => {
                    edge = Edge::Left(off);
                    off = rec.left;
                }
                CmpOrdering::Greater => {
                    edge = Edge::Right(off);
                    off = rec.right;
                }
                CmpOrdering::Equal => {
                    let rkey = self.read_key(&rec)?;
                    match compare_chain_keys(key, &rkey) {
                        CmpOrdering::Less => {
                            edge = Edge::Left(off);
                            off = rec.left;
                        }
                        CmpOrdering::Greater => {
                            edge = Edge::Right(off);
                            off = rec.right;
                        }
                        CmpOrdering::Equal => return Ok((edge, Some(rec))),
                    }
                }
            }
        }
        Ok((edge, None))
    }

    /// Unlink a record from its chain and free its region.
    fn remove_rec(&self, edge: Edge, rec: &Rec) -> Result<()> {
        let repl = if self.linear() {
            rec.left
        } else {
            match (rec.left, rec.right) {
                (0, 0) => 0,
                (l, 0) => l,
                (0, r) => r,
                (l, r) => {
                    // Hoist the rightmost descendant of the left subtree.
                    let mut parent: Option<u64> = None;
                    let mut pivot = self.read_rec(l)?;
                    while pivot.right != 0 {
                        parent = Some(pivot.off);
                        pivot = self.read_rec(pivot.right)?;
                    }
                    if let Some(poff) = parent {
                        self.write_child(poff, true, pivot.left)?;
                        self.write_child(pivot.off, false, l)?;
                    }
                    self.write_child(pivot.off, true, r)?;
                    pivot.off
                }
            }
        };
        self.write_edge(edge, repl)?;
        self.free_region(rec.off, rec.rsiz)
    }

    /// Replace the value of an existing record, in place when it fits.
    fn update_rec(&self, edge: Edge, rec: &Rec, key: &[u8], value: &[u8]) -> Result<()> {
        let used = self.used_size(key.len(), value.len());
        if used <= rec.rsiz && rec.rsiz - used <= PAD_MAX {
            let align = self.alignment();
            let aligned = align_up(used, align);
            let tail = rec.rsiz - aligned;
            let rsiz = if tail >= FB_HEADER.max(align) {
                self.free_region(rec.off + aligned, tail)?;
                aligned
            } else {
                rec.rsiz
            };
            let buf = self.build_rec(rec.fold, rec.left, rec.right, key, value, rsiz);
            return self.file.write(rec.off, &buf);
        }
        let (noff, _) = self.emit_rec(rec.fold, rec.left, rec.right, key, value)?;
        self.write_edge(edge, noff)?;
        self.free_region(rec.off, rec.rsiz)
    }

    fn accept_impl(
        &self,
        key: &[u8],
        visitor: &mut dyn Visitor,
        bidx: u64,
        fold: u32,
        writable: bool,
    ) -> Result<()> {
        let (edge, found) = self.search_chain(bidx, fold, key)?;
        match found {
            Some(rec) => {
                let value = self.read_value(&rec)?;
                let action = visitor.visit_full(key, &value);
                if !writable && action != Action::Keep {
                    return Err(Error::NoPerm("permission denied"));
                }
                match action {
                    Action::Keep => Ok(()),
                    Action::Remove => {
                        self.remove_rec(edge, &rec)?;
                        self.count.fetch_sub(1, Ordering::AcqRel);
                        Ok(())
                    }
                    Action::Replace(new) => {
                        let stored = match &*self.comp.lock() {
                            Some(comp) => comp.compress(&new)?,
                            None => new,
                        };
                        self.update_rec(edge, &rec, key, &stored)
                    }
                }
            }
            None => {
                let action = visitor.visit_empty(key);
                if !writable && matches!(action, Action::Replace(_)) {
                    return Err(Error::NoPerm("permission denied"));
                }
                match action {
                    Action::Replace(new) => {
                        let stored = match &*self.comp.lock() {
                            Some(comp) => comp.compress(&new)?,
                            None => new,
                        };
                        let (off, _) = self.emit_rec(fold, 0, 0, key, &stored)?;
                        self.write_edge(edge, off)?;
                        self.count.fetch_add(1, Ordering::AcqRel);
                        Ok(())
                    }
                    Action::Keep | Action::Remove => Ok(()),
                }
            }
        }
    }

    /// Persist the header from the in-memory state.
    fn dump_meta(&self) -> Result<()> {
        let mut head = [0u8; HEADER_SIZE as usize];
        head[..16].copy_from_slice(&MAGIC);
        head[MOFF_LIBVER] = LIB_VER;
        head[MOFF_LIBREV] = LIB_REV;
        head[MOFF_FMTVER] = FMT_VER;
        head[MOFF_ENDIAN] = u8::from(cfg!(target_endian = "big"));
        head[MOFF_APOW] = self.apow.load(Ordering::Acquire);
        head[MOFF_FPOW] = self.fpow.load(Ordering::Acquire);
        head[MOFF_OPTS] = self.opts.load(Ordering::Acquire);
        head[MOFF_FLAGS] = self.flags.load(Ordering::Acquire);
        BigEndian::write_u64(&mut head[MOFF_BNUM..], self.bnum.load(Ordering::Acquire));
        BigEndian::write_u64(&mut head[MOFF_COUNT..], self.count.load(Ordering::Acquire));
        BigEndian::write_u64(&mut head[MOFF_SIZE..], self.file.size());
        head[MOFF_OPAQUE..MOFF_OPAQUE + 16].copy_from_slice(&*self.opaque.lock());
        self.file.write(0, &head)
    }

    /// Load and validate the header, populating the in-memory state.
    fn load_meta(&self) -> Result<u64> {
        let head = self.file.read(0, HEADER_SIZE as usize)?;
        if head[..16] != MAGIC {
            return Err(Error::Broken("invalid magic data".into()));
        }
        if head[MOFF_FMTVER] != FMT_VER {
            return Err(Error::Broken(format!(
                "unsupported format version: {}",
                head[MOFF_FMTVER]
            )));
        }
        self.apow.store(head[MOFF_APOW], Ordering::Release);
        self.fpow.store(head[MOFF_FPOW], Ordering::Release);
        self.opts.store(head[MOFF_OPTS], Ordering::Release);
        self.flags.store(head[MOFF_FLAGS], Ordering::Release);
        self.bnum
            .store(BigEndian::read_u64(&head[MOFF_BNUM..]), Ordering::Release);
        self.count
            .store(BigEndian::read_u64(&head[MOFF_COUNT..]), Ordering::Release);
        let lsiz = BigEndian::read_u64(&head[MOFF_SIZE..]);
        let mut opaque = [0u8; 16];
        opaque.copy_from_slice(&head[MOFF_OPAQUE..MOFF_OPAQUE + 16]);
        *self.opaque.lock() = opaque;
        self.calibrate();
        Ok(lsiz)
    }

    /// Recompute the values derived from tuning: alignment, offset width
    /// and the start of the record region.
    fn calibrate(&self) {
        let apow = self.apow.load(Ordering::Acquire);
        self.align.store(1u64 << apow, Ordering::Release);
        let width = if self.opts.load(Ordering::Acquire) & opts::TSMALL != 0 {
            4
        } else {
            6
        };
        self.width.store(width, Ordering::Release);
        let roff = align_up(
            HEADER_SIZE + self.bnum.load(Ordering::Acquire) * u64::from(width),
            1u64 << apow,
        );
        self.roff.store(roff, Ordering::Release);
        let mut pool = self.fbp.lock();
        *pool = FreeBlockPool::new(1usize << self.fpow.load(Ordering::Acquire));
    }

    /// Lay out a fresh database file: header, zeroed buckets, EOF marker.
    fn init_file(&self) -> Result<()> {
        self.calibrate();
        self.count.store(0, Ordering::Release);
        self.file.truncate(0)?;
        self.dump_meta()?;
        let roff = self.roff.load(Ordering::Acquire);
        let mut left = roff - HEADER_SIZE;
        let chunk = vec![0u8; (1 << 20).min(left as usize)];
        let mut off = HEADER_SIZE;
        while left > 0 {
            let n = left.min(chunk.len() as u64);
            self.file.write(off, &chunk[..n as usize])?;
            off += n;
            left -= n;
        }
        Ok(())
    }

    /// Scan the record region, rebuilding the free-block pool and the
    /// record count. With `relink`, the bucket array and chains are
    /// rebuilt too (auto-repair); otherwise structural surprises fail.
    fn scan_region(&self, relink: bool) -> Result<()> {
        let roff = self.roff.load(Ordering::Acquire);
        self.fbp.lock().clear();
        if relink {
            let width = self.offset_width();
            let mut left = self.bnum.load(Ordering::Acquire) * width;
            let chunk = vec![0u8; (1 << 20).min(left.max(1) as usize)];
            let mut boff = HEADER_SIZE;
            while left > 0 {
                let n = left.min(chunk.len() as u64);
                self.file.write(boff, &chunk[..n as usize])?;
                boff += n;
                left -= n;
            }
        }
        let mut count = 0u64;
        let mut off = roff;
        let mut end = self.file.size();
        while off < end {
            let mut magic = [0u8; 1];
            if self.file.read_into(off, &mut magic).is_err() {
                break;
            }
            match magic[0] {
                REC_MAGIC => {
                    let rec = match self.read_rec(off) {
                        Ok(rec) => rec,
                        Err(err) if relink => {
                            warn!(off, %err, "truncating region at broken record");
                            self.file.truncate(off)?;
                            end = off;
                            break;
                        }
                        Err(err) => return Err(err),
                    };
                    if relink {
                        // Detach, then hang the record off its chain again.
                        self.write_child(off, false, 0)?;
                        if !self.linear() {
                            self.write_child(off, true, 0)?;
                        }
                        let key = self.read_key(&rec)?;
                        let hash = hash_record(&key);
                        let bidx = hash % self.bnum.load(Ordering::Acquire);
                        let fold = fold_hash(hash);
                        let (edge, dup) = self.search_chain(bidx, fold, &key)?;
                        if dup.is_some() {
                            self.free_region(off, rec.rsiz)?;
                        } else {
                            self.write_edge(edge, off)?;
                            count += 1;
                        }
                    } else {
                        count += 1;
                    }
                    off += rec.rsiz;
                }
                FB_MAGIC => {
                    let mut head = [0u8; FB_HEADER as usize];
                    self.file.read_into(off, &mut head)?;
                    let size = u64::from(BigEndian::read_u32(&head[1..]));
                    if size < FB_HEADER || off + size > end {
                        if relink {
                            warn!(off, "truncating region at broken free block");
                            self.file.truncate(off)?;
                            end = off;
                            break;
                        }
                        return Err(Error::Broken(format!("invalid free block: off={off}")));
                    }
                    self.fbp.lock().insert(off, size);
                    off += size;
                }
                _ => {
                    if relink {
                        warn!(off, magic = magic[0], "truncating region at garbage");
                        self.file.truncate(off)?;
                        end = off;
                        break;
                    }
                    return Err(Error::Broken(format!(
                        "invalid region magic: off={} magic={:#04x}",
                        off, magic[0]
                    )));
                }
            }
        }
        self.count.store(count, Ordering::Release);
        Ok(())
    }

    /// Move live records down over preceding free space.
    fn defrag_impl(&self, step: i64) -> Result<()> {
        let roff = self.roff.load(Ordering::Acquire);
        let mut pool = self.fbp.lock();
        let start = match pool.first_off() {
            Some(off) => off,
            None => return Ok(()),
        };
        drop(pool);
        let mut dest: Option<u64> = None;
        let mut moved = 0i64;
        let end = self.file.size();
        let mut off = start.max(roff);
        let mut cur = off;
        while off < end {
            let mut magic = [0u8; 1];
            self.file.read_into(off, &mut magic)?;
            match magic[0] {
                FB_MAGIC => {
                    let mut head = [0u8; FB_HEADER as usize];
                    self.file.read_into(off, &mut head)?;
                    let size = u64::from(BigEndian::read_u32(&head[1..]));
                    if size < FB_HEADER || off + size > end {
                        return Err(Error::Broken(format!("invalid free block: off={off}")));
                    }
                    self.fbp.lock().remove_at(off);
                    if dest.is_none() {
                        dest = Some(off);
                    }
                    off += size;
                }
                REC_MAGIC => {
                    let rec = self.read_rec(off)?;
                    if let Some(d) = dest {
                        if step > 0 && moved >= step {
                            break;
                        }
                        let body = self.file.read(rec.off, rec.rsiz as usize)?;
                        self.file.write(d, &body)?;
                        let key = self.read_key(&self.read_rec(d)?)?;
                        self.relink_moved(&key, rec.off, d)?;
                        dest = Some(d + rec.rsiz);
                        moved += 1;
                    }
                    off += rec.rsiz;
                }
                _ => {
                    return Err(Error::Broken(format!(
                        "invalid region magic: off={} magic={:#04x}",
                        off, magic[0]
                    )));
                }
            }
            cur = off;
        }
        if let Some(d) = dest {
            if cur >= end {
                // All trailing space collapsed; give it back to the file.
                self.file.truncate(d)?;
                let mut pool = self.fbp.lock();
                let frag = pool.frag_count();
                pool.clear();
                if frag > 0 {
                    debug!(reclaimed = frag, "defragmentation reclaimed fragments");
                }
            } else if cur > d {
                self.free_region(d, cur - d)?;
            }
        }
        Ok(())
    }

    /// Repoint the single chain edge that referenced `old` to `new`.
    fn relink_moved(&self, key: &[u8], old: u64, new: u64) -> Result<()> {
        let hash = hash_record(key);
        let bidx = hash % self.bnum.load(Ordering::Acquire);
        let fold = fold_hash(hash);
        let mut edge = Edge::Bucket(bidx);
        let mut off = self.read_bucket(bidx)?;
        while off != 0 {
            if off == old {
                return self.write_edge(edge, new);
            }
            if off == new {
                // Already walked through the moved copy; the edge above it
                // was rewritten by an earlier move in this pass.
                return Ok(());
            }
            let rec = self.read_rec(off)?;
            if self.linear() {
                edge = Edge::Left(off);
                off = rec.left;
                continue;
            }
            let next = match fold.cmp(&rec.fold) {
                CmpOrdering::Less => {
                    edge = Edge::Left(off);
                    rec.left
                }
                CmpOrdering::Greater => {
                    edge = Edge::Right(off);
                    rec.right
                }
                CmpOrdering::Equal => {
                    let rkey = self.read_key(&rec)?;
                    match compare_chain_keys(key, &rkey) {
                        CmpOrdering::Less => {
                            edge = Edge::Left(off);
                            rec.left
                        }
                        CmpOrdering::Greater => {
                            edge = Edge::Right(off);
                            rec.right
                        }
                        CmpOrdering::Equal => {
                            return Err(Error::Broken("moved record unreachable".into()))
                        }
                    }
                }
            };
            off = next;
        }
        Err(Error::Broken("moved record unreachable".into()))
    }

    /// Begin a transaction without taking the method lock.
    fn begin_transaction_impl(&self, hard: bool) -> Result<()> {
        self.dump_meta()?;
        self.file.begin_transaction(hard, HEADER_SIZE)?;
        // Routine header writes stay below the guard; one explicit
        // pre-image makes recovery restore the header counters too.
        self.file.write_transaction(0, HEADER_SIZE)?;
        let snapshot = TranSnapshot {
            count: self.count.load(Ordering::Acquire),
            pool: self.fbp.lock().clone(),
        };
        *self.tran.lock() = Some(snapshot);
        self.tran_active.store(true, Ordering::Release);
        Ok(())
    }

    fn end_transaction_impl(&self, commit: bool) -> Result<()> {
        let snapshot = self
            .tran
            .lock()
            .take()
            .ok_or(Error::Invalid("not in transaction"))?;
        if commit {
            self.dump_meta()?;
            self.file.end_transaction(true)?;
        } else {
            self.file.end_transaction(false)?;
            self.count.store(snapshot.count, Ordering::Release);
            *self.fbp.lock() = snapshot.pool;
        }
        self.tran_active.store(false, Ordering::Release);
        Ok(())
    }

    /// Collect the keys of one bucket chain, file order.
    fn chain_keys(&self, bidx: u64) -> Result<Vec<Vec<u8>>> {
        let mut keys = Vec::new();
        let mut stack = vec![self.read_bucket(bidx)?];
        while let Some(off) = stack.pop() {
            if off == 0 {
                continue;
            }
            let rec = self.read_rec(off)?;
            keys.push(self.read_key(&rec)?);
            stack.push(rec.left);
            if !self.linear() {
                stack.push(rec.right);
            }
        }
        Ok(keys)
    }

    /// Smallest record of a bucket in chain order, if any.
    fn chain_first(&self, bidx: u64) -> Result<Option<Vec<u8>>> {
        if self.linear() {
            let off = self.read_bucket(bidx)?;
            if off == 0 {
                return Ok(None);
            }
            let rec = self.read_rec(off)?;
            return Ok(Some(self.read_key(&rec)?));
        }
        let mut off = self.read_bucket(bidx)?;
        let mut last = None;
        while off != 0 {
            let rec = self.read_rec(off)?;
            last = Some(rec.clone());
            off = rec.left;
        }
        match last {
            Some(rec) => Ok(Some(self.read_key(&rec)?)),
            None => Ok(None),
        }
    }

    /// Successor of `(fold, key)` within a bucket in chain order.
    fn chain_successor(&self, bidx: u64, fold: u32, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if self.linear() {
            // Linear chains have no order; walk to the record then step.
            let mut off = self.read_bucket(bidx)?;
            while off != 0 {
                let rec = self.read_rec(off)?;
                let rkey = self.read_key(&rec)?;
                if rkey == key {
                    if rec.left == 0 {
                        return Ok(None);
                    }
                    let next = self.read_rec(rec.left)?;
                    return Ok(Some(self.read_key(&next)?));
                }
                off = rec.left;
            }
            return Ok(None);
        }
        let mut candidate: Option<Rec> = None;
        let mut off = self.read_bucket(bidx)?;
        while off != 0 {
            let rec = self.read_rec(off)?;
            let ord = match fold.cmp(&rec.fold) {
                CmpOrdering::Equal => {
                    let rkey = self.read_key(&rec)?;
                    compare_chain_keys(key, &rkey)
                }
                other => other,
            };
            match ord {
                CmpOrdering::Less => {
                    candidate = Some(rec.clone());
                    off = rec.left;
                }
                CmpOrdering::Greater => off = rec.right,
                CmpOrdering::Equal => {
                    if rec.right != 0 {
                        let mut succ = self.read_rec(rec.right)?;
                        while succ.left != 0 {
                            succ = self.read_rec(succ.left)?;
                        }
                        return Ok(Some(self.read_key(&succ)?));
                    }
                    break;
                }
            }
        }
        match candidate {
            Some(rec) => Ok(Some(self.read_key(&rec)?)),
            None => Ok(None),
        }
    }

    fn first_position(&self, from_bidx: u64) -> Result<Option<(u64, Vec<u8>)>> {
        let bnum = self.bnum.load(Ordering::Acquire);
        for bidx in from_bidx..bnum {
            if let Some(key) = self.chain_first(bidx)? {
                return Ok(Some((bidx, key)));
            }
        }
        Ok(None)
    }

    /// Remember a fatal condition; the flag reaches the header at the
    /// next meta dump and is surfaced through status after reopen.
    fn fatal_guard<T>(&self, res: Result<T>) -> Result<T> {
        if let Err(err) = &res {
            if matches!(err.code(), crate::error::ErrorCode::Broken | crate::error::ErrorCode::System) {
                let flags = self.flags.load(Ordering::Acquire) | flags::FFATAL;
                self.flags.store(flags, Ordering::Release);
            }
        }
        res
    }

    fn auto_defrag(&self) -> Result<()> {
        let dfunit = self.dfunit.load(Ordering::Acquire);
        if dfunit == 0 || self.tran_active.load(Ordering::Acquire) {
            return Ok(());
        }
        if self.fbp.lock().frag_count() < dfunit {
            return Ok(());
        }
        let _g = self.mlock.write();
        if self.omode.load(Ordering::Acquire) == 0 {
            return Ok(());
        }
        self.defrag_impl(dfunit as i64 * 2)
    }
}

impl Db for HashDb {
    fn open(&self, path: &str, mode: Mode) -> Result<()> {
        let _g = self.mlock.write();
        self.check_closed()?;
        if !mode.contains(OpenMode::Writer) && !mode.contains(OpenMode::Reader) {
            return Err(Error::Invalid("invalid open mode"));
        }
        let writer = mode.contains(OpenMode::Writer);
        self.file
            .open(Path::new(path), mode, self.msiz.load(Ordering::Acquire))?;
        self.recovered
            .store(self.file.recovered(), Ordering::Release);
        self.reorganized.store(false, Ordering::Release);
        let res = (|| -> Result<()> {
            if self.file.size() == 0 {
                if !writer {
                    return Err(Error::Broken("missing header".into()));
                }
                self.calibrate();
                self.init_file()?;
            } else {
                let hdr_lsiz = self.load_meta()?;
                let fsiz = self.file.size();
                let mut clean = self.flags.load(Ordering::Acquire) & flags::FOPEN == 0
                    && hdr_lsiz == fsiz
                    && fsiz >= self.roff.load(Ordering::Acquire) + 4;
                if clean {
                    let tail = self.file.read(fsiz - 4, 4)?;
                    clean = tail == EOF_MAGIC;
                }
                if self.recovered.load(Ordering::Acquire) {
                    // Replayed state is consistent but the header counters
                    // may predate the crash; rebuild them from the region.
                    clean = false;
                }
                if clean {
                    if writer {
                        self.file.truncate(fsiz - 4)?;
                        self.scan_region(false)?;
                    }
                } else {
                    if !writer || mode.contains(OpenMode::NoRepair) {
                        return Err(Error::Broken("unclean shutdown detected".into()));
                    }
                    if self.recovered.load(Ordering::Acquire) {
                        // The replayed image is a consistent pre-transaction
                        // state; only the counters and pool need rebuilding.
                        self.scan_region(false)?;
                        let flags = self.flags.load(Ordering::Acquire) | flags::FOPEN;
                        self.flags.store(flags, Ordering::Release);
                        self.dump_meta()?;
                        return Ok(());
                    }
                    debug!(path, "repairing hash database region");
                    // A stale EOF marker may sit mid-region after a crash
                    // that shrank the header size field; drop a trailing
                    // marker if one is present before rescanning.
                    if fsiz >= self.roff.load(Ordering::Acquire) + 4 {
                        let tail = self.file.read(fsiz - 4, 4)?;
                        if tail == EOF_MAGIC {
                            self.file.truncate(fsiz - 4)?;
                        }
                    }
                    self.scan_region(true)?;
                    self.reorganized.store(true, Ordering::Release);
                }
            }
            if writer {
                let flags = self.flags.load(Ordering::Acquire) | flags::FOPEN;
                self.flags.store(flags, Ordering::Release);
                self.dump_meta()?;
            }
            Ok(())
        })();
        if let Err(err) = res {
            let _ = self.file.close();
            return Err(err);
        }
        *self.comp.lock() = if self.opts.load(Ordering::Acquire) & opts::TCOMPRESS != 0 {
            Some(Arc::clone(&*self.embcomp.lock()))
        } else {
            None
        };
        self.writer.store(writer, Ordering::Release);
        self.autotran
            .store(writer && mode.contains(OpenMode::AutoTran), Ordering::Release);
        self.autosync
            .store(writer && mode.contains(OpenMode::AutoSync), Ordering::Release);
        *self.path.lock() = PathBuf::from(path);
        self.omode.store(mode.bits(), Ordering::Release);
        Ok(())
    }

    fn close(&self) -> Result<()> {
        let _g = self.mlock.write();
        self.check_open(false)?;
        let mut first_err = None;
        if self.tran_active.load(Ordering::Acquire) {
            if let Err(err) = self.end_transaction_impl(false) {
                first_err.get_or_insert(err);
            }
        }
        if self.writer.load(Ordering::Acquire) {
            let res = (|| -> Result<()> {
                self.file.append(&EOF_MAGIC)?;
                let flags = self.flags.load(Ordering::Acquire) & !flags::FOPEN;
                self.flags.store(flags, Ordering::Release);
                self.dump_meta()?;
                self.file.synchronize(false)
            })();
            if let Err(err) = res {
                first_err.get_or_insert(err);
            }
        }
        if let Err(err) = self.file.close() {
            first_err.get_or_insert(err);
        }
        self.omode.store(0, Ordering::Release);
        self.writer.store(false, Ordering::Release);
        self.fbp.lock().clear();
        *self.comp.lock() = None;
        *self.path.lock() = PathBuf::new();
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn accept(&self, key: &[u8], visitor: &mut dyn Visitor, writable: bool) -> Result<()> {
        if writable {
            self.auto_defrag()?;
        }
        let _g = self.mlock.read();
        self.check_open(writable)?;
        let hash = hash_record(key);
        let bidx = hash % self.bnum.load(Ordering::Acquire);
        let fold = fold_hash(hash);
        let autotran =
            writable && self.autotran.load(Ordering::Acquire) && !self.tran_active.load(Ordering::Acquire);
        if autotran {
            let _at = self.atlock.lock();
            self.dump_meta()?;
            self.file.begin_transaction(false, HEADER_SIZE)?;
            let res = {
                let _s = self.rlock.write(bidx);
                self.accept_impl(key, visitor, bidx, fold, writable)
            };
            return self.fatal_guard(match res {
                Ok(()) => {
                    self.dump_meta()?;
                    self.file.end_transaction(true)
                }
                Err(err) => {
                    let _ = self.file.end_transaction(false);
                    Err(err)
                }
            });
        }
        let res = if writable {
            let _s = self.rlock.write(bidx);
            self.accept_impl(key, visitor, bidx, fold, writable)
        } else {
            let _s = self.rlock.read(bidx);
            self.accept_impl(key, visitor, bidx, fold, writable)
        };
        if res.is_ok()
            && writable
            && self.autosync.load(Ordering::Acquire)
            && !self.autotran.load(Ordering::Acquire)
        {
            self.dump_meta()?;
            self.file.synchronize(true)?;
        }
        self.fatal_guard(res)
    }

    fn iterate(&self, visitor: &mut dyn Visitor, writable: bool) -> Result<()> {
        let _g = self.mlock.write();
        self.check_open(writable)?;
        let bnum = self.bnum.load(Ordering::Acquire);
        for bidx in 0..bnum {
            let keys = self.chain_keys(bidx)?;
            for key in keys {
                let hash = hash_record(&key);
                let fold = fold_hash(hash);
                self.accept_impl(&key, visitor, bidx, fold, writable)?;
            }
        }
        Ok(())
    }

    fn synchronize(&self, hard: bool) -> Result<()> {
        let _g = self.mlock.write();
        self.check_open(true)?;
        self.dump_meta()?;
        self.file.synchronize(hard)
    }

    fn begin_transaction(&self, hard: bool) -> Result<()> {
        let mut wait = std::time::Duration::from_millis(1);
        loop {
            let _g = self.mlock.write();
            self.check_open(true)?;
            if !self.tran_active.load(Ordering::Acquire) {
                return self.begin_transaction_impl(hard);
            }
            drop(_g);
            std::thread::sleep(wait);
            wait = (wait * 2).min(std::time::Duration::from_secs(1));
        }
    }

    fn begin_transaction_try(&self, hard: bool) -> Result<()> {
        let _g = self.mlock.write();
        self.check_open(true)?;
        if self.tran_active.load(Ordering::Acquire) {
            return Err(Error::Logic("competition avoided"));
        }
        self.begin_transaction_impl(hard)
    }

    fn end_transaction(&self, commit: bool) -> Result<()> {
        let _g = self.mlock.write();
        self.check_open(true)?;
        self.end_transaction_impl(commit)
    }

    fn clear(&self) -> Result<()> {
        let _g = self.mlock.write();
        self.check_open(true)?;
        self.init_file()?;
        *self.opaque.lock() = [0u8; 16];
        Ok(())
    }

    fn count(&self) -> Result<u64> {
        self.check_open(false)?;
        Ok(self.count.load(Ordering::Acquire))
    }

    fn size(&self) -> Result<u64> {
        self.check_open(false)?;
        Ok(self.file.size())
    }

    fn path(&self) -> Result<String> {
        self.check_open(false)?;
        Ok(self.path.lock().display().to_string())
    }

    fn status(&self) -> Result<BTreeMap<String, String>> {
        let _g = self.mlock.read();
        self.check_open(false)?;
        let mut map = BTreeMap::new();
        map.insert("type".into(), "HashDb".into());
        map.insert("path".into(), self.path.lock().display().to_string());
        map.insert("libver".into(), LIB_VER.to_string());
        map.insert("librev".into(), LIB_REV.to_string());
        map.insert("fmtver".into(), FMT_VER.to_string());
        map.insert("apow".into(), self.apow.load(Ordering::Acquire).to_string());
        map.insert("fpow".into(), self.fpow.load(Ordering::Acquire).to_string());
        map.insert("opts".into(), self.opts.load(Ordering::Acquire).to_string());
        map.insert("flags".into(), self.flags.load(Ordering::Acquire).to_string());
        map.insert("bnum".into(), self.bnum.load(Ordering::Acquire).to_string());
        map.insert("msiz".into(), self.msiz.load(Ordering::Acquire).to_string());
        map.insert("dfunit".into(), self.dfunit.load(Ordering::Acquire).to_string());
        map.insert("frgcnt".into(), self.fbp.lock().frag_count().to_string());
        map.insert("fbpnum".into(), self.fbp.lock().len().to_string());
        map.insert(
            "recovered".into(),
            u8::from(self.recovered.load(Ordering::Acquire)).to_string(),
        );
        map.insert(
            "reorganized".into(),
            u8::from(self.reorganized.load(Ordering::Acquire)).to_string(),
        );
        map.insert("count".into(), self.count.load(Ordering::Acquire).to_string());
        map.insert("size".into(), self.file.size().to_string());
        Ok(map)
    }
}

/// Cursor over the records of a [`HashDb`], in bucket-chain order.
pub struct HashCursor<'a> {
    db: &'a HashDb,
    pos: Option<(u64, Vec<u8>)>,
}

impl HashCursor<'_> {
    fn position(&self) -> Result<(u64, &[u8])> {
        match &self.pos {
            Some((bidx, key)) => Ok((*bidx, key)),
            None => Err(Error::NoRec),
        }
    }

    fn step_from(&self, bidx: u64, key: &[u8]) -> Result<Option<(u64, Vec<u8>)>> {
        let fold = fold_hash(hash_record(key));
        if let Some(next) = self.db.chain_successor(bidx, fold, key)? {
            return Ok(Some((bidx, next)));
        }
        Ok(self.db.first_position(bidx + 1)?)
    }
}

impl Cursor for HashCursor<'_> {
    fn accept(&mut self, visitor: &mut dyn Visitor, writable: bool, step: bool) -> Result<()> {
        let _g = self.db.mlock.write();
        self.db.check_open(writable)?;
        let (bidx, key) = {
            let (bidx, key) = self.position()?;
            (bidx, key.to_vec())
        };
        let hash = hash_record(&key);
        let fold = fold_hash(hash);
        let mut wrapper = CursorVisitor {
            inner: visitor,
            found: false,
        };
        {
            let _s = if writable {
                Some(self.db.rlock.write(bidx))
            } else {
                None
            };
            self.db
                .accept_impl(&key, &mut wrapper, bidx, fold, writable)?;
        }
        if !wrapper.found {
            self.pos = None;
            return Err(Error::NoRec);
        }
        if step {
            self.pos = self.step_from(bidx, &key)?;
        }
        Ok(())
    }

    fn jump(&mut self) -> Result<()> {
        let _g = self.db.mlock.write();
        self.db.check_open(false)?;
        self.pos = self.db.first_position(0)?;
        if self.pos.is_none() {
            return Err(Error::NoRec);
        }
        Ok(())
    }

    fn jump_key(&mut self, key: &[u8]) -> Result<()> {
        let _g = self.db.mlock.write();
        self.db.check_open(false)?;
        let hash = hash_record(key);
        let bidx = hash % self.db.bnum.load(Ordering::Acquire);
        let fold = fold_hash(hash);
        let (_, found) = self.db.search_chain(bidx, fold, key)?;
        if found.is_none() {
            self.pos = None;
            return Err(Error::NoRec);
        }
        self.pos = Some((bidx, key.to_vec()));
        Ok(())
    }

    fn step(&mut self) -> Result<()> {
        let _g = self.db.mlock.write();
        self.db.check_open(false)?;
        let (bidx, key) = {
            let (bidx, key) = self.position()?;
            (bidx, key.to_vec())
        };
        self.pos = self.step_from(bidx, &key)?;
        if self.pos.is_none() {
            return Err(Error::NoRec);
        }
        Ok(())
    }
}

struct CursorVisitor<'a> {
    inner: &'a mut dyn Visitor,
    found: bool,
}

impl Visitor for CursorVisitor<'_> {
    fn visit_full(&mut self, key: &[u8], value: &[u8]) -> Action {
        self.found = true;
        self.inner.visit_full(key, value)
    }

    fn visit_empty(&mut self, _key: &[u8]) -> Action {
        Action::Keep
    }
}

impl Drop for HashDb {
    fn drop(&mut self) {
        if self.omode.load(Ordering::Acquire) != 0 {
            if let Err(err) = self.close() {
                warn!(%err, "implicit close failed");
            }
        }
    }
}
