// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! B+ tree engine layered on the hash engine.
//!
//! Leaf and inner nodes are variable-size records in a [`HashDb`], reached
//! through a striped two-tier page cache. A mutation lands in a leaf under
//! a shared method lock; splits and merges re-run under the exclusive lock
//! after a fresh descent, since another writer may have reorganized the
//! tree in between. Durability is delegated to the hash engine's
//! write-ahead log, with the tree meta record written at every
//! transaction boundary.

mod cache;
mod node;

use self::cache::TwoTierCache;
use self::node::{
    deserialize_inner, deserialize_leaf, inner_key, leaf_key, serialize_inner, serialize_leaf,
    InnerCore, InnerNode, LeafCore, LeafNode, Link, TreeRec, INNER_BASE, INNER_ID_BASE, LEAF_BASE,
};
use crate::codec::Compressor;
use crate::db::{Action, Cursor, Db, Mode, OpenMode, Visitor};
use crate::error::{Error, Result};
use crate::hash::HashDb;
use byteorder::{BigEndian, ByteOrder};
use parking_lot::{Mutex, RwLock};
use std::cmp::Ordering as CmpOrdering;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU16, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Stripes of the page cache.
const SLOT_NUM: usize = 16;
/// Default alignment power handed to the hash engine.
const DEF_APOW: u8 = 8;
/// Default free-block-pool power handed to the hash engine.
const DEF_FPOW: u8 = 10;
/// Default bucket count handed to the hash engine.
const DEF_BNUM: u64 = 64 << 10;
/// Default page size.
const DEF_PSIZ: u64 = 8192;
/// Default capacity of the page cache.
const DEF_PCCAP: u64 = 64 << 20;
/// Key of the meta record.
const META_KEY: &[u8] = b"@";
/// Size of the meta record.
const META_SIZE: usize = 64;
/// An inner node below this many links is never split.
const INNER_LINK_MIN: usize = 8;
/// Maximum level of the tree.
const LEVEL_MAX: usize = 16;
/// Nodes kept cached across an automatic transaction.
const ATRAN_CACHED: usize = 256;
/// Comparator tags stored in the meta record.
const COMP_LEXICAL: u8 = 0x10;
const COMP_DECIMAL: u8 = 0x11;
const COMP_CUSTOM: u8 = 0xff;

/// Total order on keys.
#[derive(Clone)]
pub enum Comparator {
    /// Bytewise order.
    Lexical,
    /// Numeric prefix order, ties broken bytewise.
    Decimal,
    /// User-supplied order; must stay identical across reopens.
    Custom(Arc<dyn Fn(&[u8], &[u8]) -> CmpOrdering + Send + Sync>),
}

impl Comparator {
    fn compare(&self, a: &[u8], b: &[u8]) -> CmpOrdering {
        match self {
            Comparator::Lexical => a.cmp(b),
            Comparator::Decimal => decimal_value(a)
                .cmp(&decimal_value(b))
                .then_with(|| a.cmp(b)),
            Comparator::Custom(f) => f(a, b),
        }
    }

    fn tag(&self) -> u8 {
        match self {
            Comparator::Lexical => COMP_LEXICAL,
            Comparator::Decimal => COMP_DECIMAL,
            Comparator::Custom(_) => COMP_CUSTOM,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Comparator::Lexical => "lexical",
            Comparator::Decimal => "decimal",
            Comparator::Custom(_) => "external",
        }
    }
}

impl std::fmt::Debug for Comparator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Signed value of a leading decimal prefix.
fn decimal_value(buf: &[u8]) -> i64 {
    let mut it = buf.iter().copied().skip_while(|b| b.is_ascii_whitespace());
    let mut first = it.next();
    let mut sign = 1i64;
    if first == Some(b'-') {
        sign = -1;
        first = it.next();
    } else if first == Some(b'+') {
        first = it.next();
    }
    let mut num: i64 = 0;
    while let Some(b) = first {
        if !b.is_ascii_digit() {
            break;
        }
        num = num.saturating_mul(10).saturating_add(i64::from(b - b'0'));
        first = it.next();
    }
    sign.saturating_mul(num)
}

struct CurPos {
    key: Option<Vec<u8>>,
    lid: i64,
}

/// What an accept decided to do after releasing the shared lock.
enum Followup {
    None,
    Reorg,
    Flush,
}

/// File tree database.
pub struct TreeDb {
    mlock: RwLock<()>,
    hdb: HashDb,
    omode: AtomicU16,
    writer: AtomicBool,
    autotran: AtomicBool,
    autosync: AtomicBool,
    psiz: AtomicU64,
    pccap: AtomicU64,
    root: AtomicI64,
    first: AtomicI64,
    last: AtomicI64,
    lcnt: AtomicI64,
    icnt: AtomicI64,
    count: AtomicI64,
    cusage: AtomicI64,
    lslots: Vec<Mutex<TwoTierCache<Arc<LeafNode>>>>,
    islots: Vec<Mutex<TwoTierCache<Arc<InnerNode>>>>,
    comp: Mutex<Comparator>,
    tran: AtomicBool,
    trcnt: AtomicU64,
    cursors: Mutex<Vec<Arc<Mutex<CurPos>>>>,
}

impl Default for TreeDb {
    fn default() -> Self {
        Self::new()
    }
}

impl TreeDb {
    pub fn new() -> Self {
        let hdb = HashDb::new();
        let _ = hdb.tune_alignment(DEF_APOW);
        let _ = hdb.tune_fbp(DEF_FPOW);
        let _ = hdb.tune_buckets(DEF_BNUM);
        let mut lslots = Vec::with_capacity(SLOT_NUM);
        lslots.resize_with(SLOT_NUM, || Mutex::new(TwoTierCache::new()));
        let mut islots = Vec::with_capacity(SLOT_NUM);
        islots.resize_with(SLOT_NUM, || Mutex::new(TwoTierCache::new()));
        TreeDb {
            mlock: RwLock::new(()),
            hdb,
            omode: AtomicU16::new(0),
            writer: AtomicBool::new(false),
            autotran: AtomicBool::new(false),
            autosync: AtomicBool::new(false),
            psiz: AtomicU64::new(DEF_PSIZ),
            pccap: AtomicU64::new(DEF_PCCAP),
            root: AtomicI64::new(0),
            first: AtomicI64::new(0),
            last: AtomicI64::new(0),
            lcnt: AtomicI64::new(0),
            icnt: AtomicI64::new(0),
            count: AtomicI64::new(0),
            cusage: AtomicI64::new(0),
            lslots,
            islots,
            comp: Mutex::new(Comparator::Lexical),
            tran: AtomicBool::new(false),
            trcnt: AtomicU64::new(0),
            cursors: Mutex::new(Vec::new()),
        }
    }

    /// Set the power of the record alignment of the underlying file.
    pub fn tune_alignment(&self, apow: u8) -> Result<()> {
        self.check_closed()?;
        self.hdb.tune_alignment(apow)
    }

    /// Set the power of the free-block pool of the underlying file.
    pub fn tune_fbp(&self, fpow: u8) -> Result<()> {
        self.check_closed()?;
        self.hdb.tune_fbp(fpow)
    }

    /// Set the optional features of the underlying file (`hash::opts`).
    pub fn tune_options(&self, opts: u8) -> Result<()> {
        self.check_closed()?;
        self.hdb.tune_options(opts)
    }

    /// Set the bucket count of the underlying file.
    pub fn tune_buckets(&self, bnum: u64) -> Result<()> {
        self.check_closed()?;
        self.hdb.tune_buckets(bnum)
    }

    /// Set the size of the mapped prefix of the underlying file.
    pub fn tune_map(&self, msiz: u64) -> Result<()> {
        self.check_closed()?;
        self.hdb.tune_map(msiz)
    }

    /// Set the auto-defragmentation unit of the underlying file.
    pub fn tune_defrag(&self, dfunit: u64) -> Result<()> {
        self.check_closed()?;
        self.hdb.tune_defrag(dfunit)
    }

    /// Set the value compressor of the underlying file.
    pub fn tune_compressor(&self, comp: Arc<dyn Compressor>) -> Result<()> {
        self.check_closed()?;
        self.hdb.tune_compressor(comp)
    }

    /// Set the size of each page.
    pub fn tune_page(&self, psiz: u64) -> Result<()> {
        self.check_closed()?;
        self.psiz
            .store(if psiz > 0 { psiz } else { DEF_PSIZ }, Ordering::Release);
        Ok(())
    }

    /// Set the capacity of the page cache.
    pub fn tune_page_cache(&self, pccap: u64) -> Result<()> {
        self.check_closed()?;
        self.pccap
            .store(if pccap > 0 { pccap } else { DEF_PCCAP }, Ordering::Release);
        Ok(())
    }

    /// Set the key comparator. The choice is recorded in the meta record
    /// and must match at reopen.
    pub fn tune_comparator(&self, comp: Comparator) -> Result<()> {
        self.check_closed()?;
        *self.comp.lock() = comp;
        Ok(())
    }

    /// The 16-byte opaque user slot of the underlying file.
    pub fn opaque(&self) -> Result<[u8; 16]> {
        self.hdb.opaque()
    }

    /// Overwrite the 16-byte opaque user slot.
    pub fn set_opaque(&self, data: [u8; 16]) -> Result<()> {
        self.hdb.set_opaque(data)
    }

    /// Perform defragmentation of the underlying file.
    pub fn defrag(&self, step: i64) -> Result<()> {
        let _g = self.mlock.read();
        self.check_open(false)?;
        self.hdb.defrag(step)
    }

    /// Status flags of the underlying file.
    pub fn flags(&self) -> u8 {
        self.hdb.flags()
    }

    /// Create a cursor, initially unplaced.
    pub fn cursor(&self) -> TreeCursor<'_> {
        let pos = Arc::new(Mutex::new(CurPos { key: None, lid: 0 }));
        self.cursors.lock().push(Arc::clone(&pos));
        TreeCursor { db: self, pos }
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

    fn comparator(&self) -> Comparator {
        self.comp.lock().clone()
    }

    fn slot_of(id: i64) -> usize {
        (id as u64 % SLOT_NUM as u64) as usize
    }

    fn over_cap(&self) -> bool {
        self.cusage.load(Ordering::Acquire) > self.pccap.load(Ordering::Acquire) as i64
    }

    fn load_leaf(&self, id: i64, promote: bool) -> Result<Arc<LeafNode>> {
        let mut slot = self.lslots[Self::slot_of(id)].lock();
        if let Some(found) = slot.get(id, promote) {
            return Ok(found);
        }
        let value = self
            .hdb
            .get(&leaf_key(id))?
            .ok_or_else(|| Error::Broken(format!("missing leaf node: id={id}")))?;
        let core = deserialize_leaf(&value)
            .ok_or_else(|| Error::Broken(format!("broken leaf node: id={id}")))?;
        let size = core.size;
        let found = Arc::new(LeafNode {
            id,
            core: RwLock::new(core),
        });
        slot.insert_warm(id, Arc::clone(&found));
        self.cusage.fetch_add(size as i64, Ordering::AcqRel);
        Ok(found)
    }

    fn create_leaf(&self, prev: i64, next: i64) -> Arc<LeafNode> {
        let id = self.lcnt.fetch_add(1, Ordering::AcqRel) + 1;
        let core = LeafCore {
            recs: Vec::new(),
            size: LEAF_BASE,
            prev,
            next,
            dirty: true,
            dead: false,
        };
        let node = Arc::new(LeafNode {
            id,
            core: RwLock::new(core),
        });
        self.lslots[Self::slot_of(id)]
            .lock()
            .insert_warm(id, Arc::clone(&node));
        self.cusage.fetch_add(LEAF_BASE as i64, Ordering::AcqRel);
        node
    }

    fn save_leaf(&self, node: &Arc<LeafNode>) -> Result<()> {
        let mut core = node.core.write();
        if !core.dirty {
            return Ok(());
        }
        let key = leaf_key(node.id);
        if core.dead {
            match self.hdb.remove(&key) {
                Ok(()) | Err(Error::NoRec) => {}
                Err(err) => return Err(err),
            }
        } else {
            self.hdb.set(&key, &serialize_leaf(&core))?;
        }
        core.dirty = false;
        Ok(())
    }

    /// Drop a leaf from the cache, saving it first when requested.
    fn flush_leaf(&self, node: &Arc<LeafNode>, save: bool) -> Result<()> {
        if save {
            self.save_leaf(node)?;
        }
        if self.lslots[Self::slot_of(node.id)]
            .lock()
            .remove(node.id)
            .is_some()
        {
            let size = node.core.read().size;
            self.cusage.fetch_sub(size as i64, Ordering::AcqRel);
        }
        Ok(())
    }

    fn load_inner(&self, id: i64) -> Result<Arc<InnerNode>> {
        let mut slot = self.islots[Self::slot_of(id)].lock();
        if let Some(found) = slot.get(id, false) {
            return Ok(found);
        }
        let value = self
            .hdb
            .get(&inner_key(id))?
            .ok_or_else(|| Error::Broken(format!("missing inner node: id={id}")))?;
        let core = deserialize_inner(&value)
            .ok_or_else(|| Error::Broken(format!("broken inner node: id={id}")))?;
        let size = core.size;
        let found = Arc::new(InnerNode {
            id,
            core: RwLock::new(core),
        });
        slot.insert_warm(id, Arc::clone(&found));
        self.cusage.fetch_add(size as i64, Ordering::AcqRel);
        Ok(found)
    }

    fn create_inner(&self, heir: i64) -> Arc<InnerNode> {
        let id = self.icnt.fetch_add(1, Ordering::AcqRel) + 1 + INNER_ID_BASE;
        let core = InnerCore {
            heir,
            links: Vec::new(),
            size: INNER_BASE,
            dirty: true,
            dead: false,
        };
        let node = Arc::new(InnerNode {
            id,
            core: RwLock::new(core),
        });
        self.islots[Self::slot_of(id)]
            .lock()
            .insert_warm(id, Arc::clone(&node));
        self.cusage.fetch_add(INNER_BASE as i64, Ordering::AcqRel);
        node
    }

    fn save_inner(&self, node: &Arc<InnerNode>) -> Result<()> {
        let mut core = node.core.write();
        if !core.dirty {
            return Ok(());
        }
        let key = inner_key(node.id);
        if core.dead {
            match self.hdb.remove(&key) {
                Ok(()) | Err(Error::NoRec) => {}
                Err(err) => return Err(err),
            }
        } else {
            self.hdb.set(&key, &serialize_inner(&core))?;
        }
        core.dirty = false;
        Ok(())
    }

    fn flush_inner(&self, node: &Arc<InnerNode>, save: bool) -> Result<()> {
        if save {
            self.save_inner(node)?;
        }
        if self.islots[Self::slot_of(node.id)]
            .lock()
            .remove(node.id)
            .is_some()
        {
            let size = node.core.read().size;
            self.cusage.fetch_sub(size as i64, Ordering::AcqRel);
        }
        Ok(())
    }

    fn flush_leaf_cache(&self, save: bool) -> Result<()> {
        for slot in &self.lslots {
            let nodes = slot.lock().values();
            for node in nodes {
                self.flush_leaf(&node, save)?;
            }
        }
        Ok(())
    }

    fn flush_inner_cache(&self, save: bool) -> Result<()> {
        for slot in &self.islots {
            let nodes = slot.lock().values();
            for node in nodes {
                self.flush_inner(&node, save)?;
            }
        }
        Ok(())
    }

    /// Save every dirty node without evicting anything.
    fn clean_caches(&self) -> Result<()> {
        for slot in &self.lslots {
            let nodes = slot.lock().values();
            for node in nodes {
                self.save_leaf(&node)?;
            }
        }
        for slot in &self.islots {
            let nodes = slot.lock().values();
            for node in nodes {
                self.save_inner(&node)?;
            }
        }
        Ok(())
    }

    /// Evict one node from a slot, preferring leaves; inner nodes follow
    /// once they outnumber the slot's cached leaves.
    fn flush_slot_part(&self, sidx: usize) -> Result<bool> {
        let victim = self.lslots[sidx].lock().lru();
        if let Some(node) = victim {
            self.flush_leaf(&node, true)?;
            let icnt = self.islots[sidx].lock().len();
            let lcnt = self.lslots[sidx].lock().len();
            if icnt > lcnt + 1 {
                if let Some(inode) = self.islots[sidx].lock().lru() {
                    self.flush_inner(&inode, true)?;
                }
            }
            return Ok(true);
        }
        let victim = self.islots[sidx].lock().lru();
        if let Some(inode) = victim {
            self.flush_inner(&inode, true)?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Evict until the cache fits its capacity again.
    fn flush_pressure(&self) -> Result<()> {
        let mut sidx = 0;
        let mut idle = 0;
        while self.over_cap() && idle < SLOT_NUM {
            if self.flush_slot_part(sidx % SLOT_NUM)? {
                idle = 0;
            } else {
                idle += 1;
            }
            sidx += 1;
        }
        Ok(())
    }

    /// Descend from the root to the leaf owning `key`, recording the inner
    /// IDs visited for later reorganization.
    fn search_tree(
        &self,
        comp: &Comparator,
        key: &[u8],
        promote: bool,
    ) -> Result<(Arc<LeafNode>, Vec<i64>)> {
        let mut id = self.root.load(Ordering::Acquire);
        let mut hist = Vec::new();
        while id >= INNER_ID_BASE {
            if hist.len() >= LEVEL_MAX {
                return Err(Error::Broken("tree deeper than the level limit".into()));
            }
            let node = self.load_inner(id)?;
            hist.push(id);
            let core = node.core.read();
            let ub = core
                .links
                .partition_point(|l| comp.compare(&l.key, key) != CmpOrdering::Greater);
            id = if ub == 0 {
                core.heir
            } else {
                core.links[ub - 1].child
            };
        }
        let leaf = self.load_leaf(id, promote)?;
        Ok((leaf, hist))
    }

    /// Apply a visitor inside a leaf. Returns whether the tree needs
    /// reorganizing (split on overflow, merge on empty).
    fn accept_leaf(
        &self,
        comp: &Comparator,
        core: &mut LeafCore,
        key: &[u8],
        visitor: &mut dyn Visitor,
    ) -> Result<bool> {
        let psiz = self.psiz.load(Ordering::Acquire);
        match core.recs.binary_search_by(|r| comp.compare(&r.key, key)) {
            Ok(i) => {
                let action = visitor.visit_full(key, &core.recs[i].value);
                match action {
                    Action::Keep => Ok(false),
                    Action::Remove => {
                        let weight = core.recs[i].weight();
                        core.recs.remove(i);
                        core.size -= weight;
                        core.dirty = true;
                        self.count.fetch_sub(1, Ordering::AcqRel);
                        self.cusage.fetch_sub(weight as i64, Ordering::AcqRel);
                        Ok(core.recs.is_empty())
                    }
                    Action::Replace(value) => {
                        let diff = value.len() as i64 - core.recs[i].value.len() as i64;
                        core.recs[i].value = value;
                        core.size = (core.size as i64 + diff) as u64;
                        core.dirty = true;
                        self.cusage.fetch_add(diff, Ordering::AcqRel);
                        Ok(core.size > psiz && core.recs.len() > 1)
                    }
                }
            }
            Err(i) => {
                let action = visitor.visit_empty(key);
                match action {
                    Action::Replace(value) => {
                        let rec = TreeRec {
                            key: key.to_vec(),
                            value,
                        };
                        let weight = rec.weight();
                        core.recs.insert(i, rec);
                        core.size += weight;
                        core.dirty = true;
                        self.count.fetch_add(1, Ordering::AcqRel);
                        self.cusage.fetch_add(weight as i64, Ordering::AcqRel);
                        Ok(core.size > psiz && core.recs.len() > 1)
                    }
                    Action::Keep | Action::Remove => Ok(false),
                }
            }
        }
    }

    fn accept_leaf_ro(
        &self,
        comp: &Comparator,
        core: &LeafCore,
        key: &[u8],
        visitor: &mut dyn Visitor,
    ) -> Result<()> {
        let action = match core.recs.binary_search_by(|r| comp.compare(&r.key, key)) {
            Ok(i) => visitor.visit_full(key, &core.recs[i].value),
            Err(_) => visitor.visit_empty(key),
        };
        if !matches!(action, Action::Keep) {
            return Err(Error::NoPerm("permission denied"));
        }
        Ok(())
    }

    /// Move the upper half of a leaf into a fresh sibling.
    fn divide_leaf(&self, comp: &Comparator, node: &Arc<LeafNode>) -> Result<Arc<LeafNode>> {
        let mut core = node.core.write();
        let newnode = self.create_leaf(node.id, core.next);
        {
            let mut ncore = newnode.core.write();
            if ncore.next > 0 {
                let nextnode = self.load_leaf(ncore.next, false)?;
                let mut xcore = nextnode.core.write();
                xcore.prev = newnode.id;
                xcore.dirty = true;
            }
            core.next = newnode.id;
            core.dirty = true;
            let mid = core.recs.len() / 2;
            let moved: Vec<TreeRec> = core.recs.drain(mid..).collect();
            for rec in &moved {
                let weight = rec.weight();
                core.size -= weight;
                ncore.size += weight;
            }
            ncore.recs = moved;
        }
        let pivot = newnode.core.read().recs[0].key.clone();
        drop(core);
        self.escape_cursors_divide(comp, node.id, newnode.id, &pivot);
        Ok(newnode)
    }

    /// Insert a link into an inner node, keeping the links sorted.
    fn add_link(&self, comp: &Comparator, node: &Arc<InnerNode>, child: i64, key: &[u8]) {
        let link = Link {
            child,
            key: key.to_vec(),
        };
        let weight = link.weight();
        let mut core = node.core.write();
        let pos = core
            .links
            .partition_point(|l| comp.compare(&l.key, key) != CmpOrdering::Greater);
        core.links.insert(pos, link);
        core.size += weight;
        core.dirty = true;
        self.cusage.fetch_add(weight as i64, Ordering::AcqRel);
    }

    /// Remove the link to `child` from `node`, cascading upward through
    /// `hist` when the node empties. Returns whether the dead child should
    /// be unchained from the leaf list; `false` means the child became the
    /// new root (or survived) instead.
    fn sub_link_tree(&self, node: &Arc<InnerNode>, child: i64, hist: &[i64]) -> Result<bool> {
        let mut core = node.core.write();
        core.dirty = true;
        if core.heir == child {
            if !core.links.is_empty() {
                let link = core.links.remove(0);
                let weight = link.weight();
                core.heir = link.child;
                core.size -= weight;
                self.cusage.fetch_sub(weight as i64, Ordering::AcqRel);
                return Ok(true);
            }
            if let Some((&parent, rest)) = hist.split_last() {
                core.dead = true;
                drop(core);
                let pnode = self.load_inner(parent)?;
                return self.sub_link_tree(&pnode, node.id, rest);
            }
            // The root lost its last child; collapse through dead inner
            // nodes until a live node takes over as root.
            core.dead = true;
            drop(core);
            let mut cur = child;
            self.root.store(cur, Ordering::Release);
            while cur >= INNER_ID_BASE {
                let inode = self.load_inner(cur)?;
                let icore = inode.core.read();
                if icore.dead {
                    cur = icore.heir;
                    self.root.store(cur, Ordering::Release);
                } else {
                    break;
                }
            }
            return Ok(false);
        }
        if let Some(pos) = core.links.iter().position(|l| l.child == child) {
            let link = core.links.remove(pos);
            let weight = link.weight();
            core.size -= weight;
            self.cusage.fetch_sub(weight as i64, Ordering::AcqRel);
            return Ok(true);
        }
        Err(Error::Broken("invalid tree".into()))
    }

    /// Split an oversized leaf (propagating splits up the visited inner
    /// nodes) or detach an empty one.
    fn reorganize_tree(
        &self,
        comp: &Comparator,
        node: &Arc<LeafNode>,
        hist: &[i64],
    ) -> Result<()> {
        let psiz = self.psiz.load(Ordering::Acquire);
        let (oversized, empty) = {
            let core = node.core.read();
            (
                core.size > psiz && core.recs.len() > 1,
                core.recs.is_empty(),
            )
        };
        if oversized {
            let newnode = self.divide_leaf(comp, node)?;
            if self.last.load(Ordering::Acquire) == node.id {
                self.last.store(newnode.id, Ordering::Release);
            }
            let mut heir = node.id;
            let mut child = newnode.id;
            let mut key = newnode.core.read().recs[0].key.clone();
            let mut hidx = hist.len();
            loop {
                if hidx == 0 {
                    let inode = self.create_inner(heir);
                    self.add_link(comp, &inode, child, &key);
                    self.root.store(inode.id, Ordering::Release);
                    break;
                }
                hidx -= 1;
                let inode = self.load_inner(hist[hidx])?;
                self.add_link(comp, &inode, child, &key);
                let (size, nlinks) = {
                    let core = inode.core.read();
                    (core.size, core.links.len())
                };
                if size <= psiz || nlinks <= INNER_LINK_MIN {
                    break;
                }
                // Split the inner node: the median link's key moves up and
                // its child becomes the heir of the new sibling.
                let mut icore = inode.core.write();
                let mid = icore.links.len() / 2;
                let midlink = icore.links[mid].clone();
                let newinode = self.create_inner(midlink.child);
                let moved: Vec<Link> = icore.links.drain(mid + 1..).collect();
                {
                    let mut ncore = newinode.core.write();
                    for link in moved {
                        let weight = link.weight();
                        icore.size -= weight;
                        ncore.size += weight;
                        ncore.links.push(link);
                    }
                }
                let weight = midlink.weight();
                icore.links.truncate(mid);
                icore.size -= weight;
                icore.dirty = true;
                self.cusage.fetch_sub(weight as i64, Ordering::AcqRel);
                drop(icore);
                heir = inode.id;
                child = newinode.id;
                key = midlink.key;
            }
        } else if empty && !hist.is_empty() {
            let next = node.core.read().next;
            self.escape_cursors_dead(node.id, next)?;
            let inode = self.load_inner(hist[hist.len() - 1])?;
            if self.sub_link_tree(&inode, node.id, &hist[..hist.len() - 1])? {
                let (prev, next) = {
                    let core = node.core.read();
                    (core.prev, core.next)
                };
                if prev > 0 {
                    let pnode = self.load_leaf(prev, false)?;
                    let mut pcore = pnode.core.write();
                    pcore.next = next;
                    pcore.dirty = true;
                    if self.last.load(Ordering::Acquire) == node.id {
                        self.last.store(prev, Ordering::Release);
                    }
                }
                if next > 0 {
                    let nnode = self.load_leaf(next, false)?;
                    let mut ncore = nnode.core.write();
                    ncore.prev = prev;
                    ncore.dirty = true;
                    if self.first.load(Ordering::Acquire) == node.id {
                        self.first.store(next, Ordering::Release);
                    }
                }
                let mut core = node.core.write();
                core.dead = true;
                core.dirty = true;
            }
        }
        Ok(())
    }

    /// First record at or after the leaf chain starting at `id`.
    fn leaf_chain_first(&self, mut id: i64) -> Result<Option<(Vec<u8>, i64)>> {
        while id > 0 {
            let node = self.load_leaf(id, false)?;
            let core = node.core.read();
            if let Some(rec) = core.recs.first() {
                return Ok(Some((rec.key.clone(), id)));
            }
            id = core.next;
        }
        Ok(None)
    }

    fn escape_cursors_divide(&self, comp: &Comparator, src: i64, dest: i64, pivot: &[u8]) {
        for cur in self.cursors.lock().iter() {
            let mut pos = cur.lock();
            if pos.lid == src {
                if let Some(key) = &pos.key {
                    if comp.compare(key, pivot) != CmpOrdering::Less {
                        pos.lid = dest;
                    }
                }
            }
        }
    }

    fn escape_cursors_dead(&self, src: i64, next: i64) -> Result<()> {
        let cursors: Vec<_> = self.cursors.lock().iter().cloned().collect();
        for cur in cursors {
            let mut pos = cur.lock();
            if pos.lid == src {
                match self.leaf_chain_first(next)? {
                    Some((key, lid)) => {
                        pos.key = Some(key);
                        pos.lid = lid;
                    }
                    None => {
                        pos.key = None;
                        pos.lid = 0;
                    }
                }
            }
        }
        Ok(())
    }

    fn disable_cursors(&self) {
        for cur in self.cursors.lock().iter() {
            let mut pos = cur.lock();
            pos.key = None;
            pos.lid = 0;
        }
    }

    fn dump_meta(&self) -> Result<()> {
        let mut buf = [0u8; META_SIZE];
        buf[0] = self.comp.lock().tag();
        BigEndian::write_u64(&mut buf[8..], self.psiz.load(Ordering::Acquire));
        BigEndian::write_u64(&mut buf[16..], self.root.load(Ordering::Acquire) as u64);
        BigEndian::write_u64(&mut buf[24..], self.first.load(Ordering::Acquire) as u64);
        BigEndian::write_u64(&mut buf[32..], self.last.load(Ordering::Acquire) as u64);
        BigEndian::write_u64(&mut buf[40..], self.lcnt.load(Ordering::Acquire) as u64);
        BigEndian::write_u64(&mut buf[48..], self.icnt.load(Ordering::Acquire) as u64);
        BigEndian::write_u64(&mut buf[56..], self.count.load(Ordering::Acquire) as u64);
        self.hdb.set(META_KEY, &buf)
    }

    fn load_meta(&self) -> Result<()> {
        let buf = self
            .hdb
            .get(META_KEY)?
            .ok_or_else(|| Error::Broken("missing meta record".into()))?;
        if buf.len() != META_SIZE {
            return Err(Error::Broken(format!(
                "invalid meta record size: {}",
                buf.len()
            )));
        }
        let mut comp = self.comp.lock();
        match buf[0] {
            COMP_LEXICAL => {
                if matches!(&*comp, Comparator::Custom(_)) {
                    return Err(Error::Broken("comparator is incompatible".into()));
                }
                *comp = Comparator::Lexical;
            }
            COMP_DECIMAL => {
                if matches!(&*comp, Comparator::Custom(_)) {
                    return Err(Error::Broken("comparator is incompatible".into()));
                }
                *comp = Comparator::Decimal;
            }
            COMP_CUSTOM => {
                if !matches!(&*comp, Comparator::Custom(_)) {
                    return Err(Error::Broken("comparator is incompatible".into()));
                }
            }
            _ => return Err(Error::Broken("comparator is invalid".into())),
        }
        drop(comp);
        self.psiz
            .store(BigEndian::read_u64(&buf[8..]), Ordering::Release);
        self.root
            .store(BigEndian::read_u64(&buf[16..]) as i64, Ordering::Release);
        self.first
            .store(BigEndian::read_u64(&buf[24..]) as i64, Ordering::Release);
        self.last
            .store(BigEndian::read_u64(&buf[32..]) as i64, Ordering::Release);
        self.lcnt
            .store(BigEndian::read_u64(&buf[40..]) as i64, Ordering::Release);
        self.icnt
            .store(BigEndian::read_u64(&buf[48..]) as i64, Ordering::Release);
        self.count
            .store(BigEndian::read_u64(&buf[56..]) as i64, Ordering::Release);
        Ok(())
    }

    fn begin_transaction_impl(&self, hard: bool) -> Result<()> {
        self.clean_caches()?;
        let idx = (self.trcnt.fetch_add(1, Ordering::AcqRel) % SLOT_NUM as u64) as usize;
        if self.lslots[idx].lock().len() > 1 {
            self.flush_slot_part(idx)?;
        }
        self.dump_meta()?;
        self.hdb.begin_transaction(hard)?;
        self.tran.store(true, Ordering::Release);
        Ok(())
    }

    fn commit_transaction(&self) -> Result<()> {
        self.clean_caches()?;
        self.dump_meta()?;
        self.hdb.end_transaction(true)
    }

    fn abort_transaction(&self) -> Result<()> {
        self.flush_leaf_cache(false)?;
        self.flush_inner_cache(false)?;
        self.hdb.end_transaction(false)?;
        self.load_meta()?;
        self.disable_cursors();
        self.cusage.store(0, Ordering::Release);
        Ok(())
    }

    /// Wrap a single dirty leaf in an implicit transaction.
    fn fix_auto_transaction_leaf(&self, node: &Arc<LeafNode>) -> Result<()> {
        self.hdb
            .begin_transaction(self.autosync.load(Ordering::Acquire))?;
        let res = (|| -> Result<()> {
            self.save_leaf(node)?;
            self.dump_meta()
        })();
        match res {
            Ok(()) => self.hdb.end_transaction(true),
            Err(err) => {
                let _ = self.hdb.end_transaction(false);
                Err(err)
            }
        }
    }

    /// Wrap a structural change in an implicit transaction, flushing a
    /// bounded part of the cache.
    fn fix_auto_transaction_tree(&self) -> Result<()> {
        self.hdb
            .begin_transaction(self.autosync.load(Ordering::Acquire))?;
        let res = (|| -> Result<()> {
            self.clean_caches()?;
            let cnum = ATRAN_CACHED / SLOT_NUM;
            let idx = (self.trcnt.fetch_add(1, Ordering::AcqRel) % SLOT_NUM as u64) as usize;
            if self.lslots[idx].lock().len() > cnum {
                self.flush_slot_part(idx)?;
            }
            if self.islots[idx].lock().len() > cnum {
                if let Some(inode) = self.islots[idx].lock().lru() {
                    self.flush_inner(&inode, true)?;
                }
            }
            self.dump_meta()
        })();
        match res {
            Ok(()) => self.hdb.end_transaction(true),
            Err(err) => {
                let _ = self.hdb.end_transaction(false);
                Err(err)
            }
        }
    }

    fn fix_auto_synchronization(&self) -> Result<()> {
        self.flush_leaf_cache(true)?;
        self.flush_inner_cache(true)?;
        self.dump_meta()?;
        self.hdb.synchronize(true)
    }

    /// Recount the records by walking the leaf chain; used after the
    /// underlying file was recovered from its write-ahead log.
    fn recalc_count(&self) -> Result<()> {
        self.load_meta()?;
        let before = self.count.load(Ordering::Acquire);
        let mut count: i64 = 0;
        let mut id = self.first.load(Ordering::Acquire);
        while id > 0 {
            let node = self.load_leaf(id, false)?;
            let next = {
                let core = node.core.read();
                count += core.recs.len() as i64;
                core.next
            };
            self.flush_leaf(&node, false)?;
            id = next;
        }
        debug!(before, after = count, "recalculated the record count");
        self.count.store(count, Ordering::Release);
        if self.writer.load(Ordering::Acquire) {
            self.dump_meta()?;
        }
        Ok(())
    }

    /// Rebuild the whole database from the surviving leaf pages after the
    /// underlying file was repaired.
    fn reorganize_file(&self, path: &str) -> Result<()> {
        self.load_meta()?;
        debug!(path, "reorganizing the tree database");
        let npath = format!("{path}.tmp");
        let tmp = TreeDb::new();
        tmp.tune_comparator(self.comparator())?;
        tmp.tune_page(self.psiz.load(Ordering::Acquire))?;
        tmp.open(
            &npath,
            OpenMode::Writer | OpenMode::Create | OpenMode::Truncate,
        )?;
        let mut harvest = LeafHarvester {
            dest: &tmp,
            error: None,
        };
        self.hdb.iterate(&mut harvest, false)?;
        if let Some(err) = harvest.error {
            let _ = tmp.close();
            let _ = std::fs::remove_file(&npath);
            return Err(err);
        }
        tmp.close()?;
        let src = HashDb::new();
        src.open(&npath, OpenMode::Reader.into())?;
        self.hdb.clear()?;
        let mut copy = RawCopier {
            dest: &self.hdb,
            error: None,
        };
        src.iterate(&mut copy, false)?;
        src.close()?;
        let _ = std::fs::remove_file(&npath);
        if let Some(err) = copy.error {
            return Err(err);
        }
        self.hdb.synchronize(false)?;
        self.flush_leaf_cache(false)?;
        self.flush_inner_cache(false)?;
        self.cusage.store(0, Ordering::Release);
        self.load_meta()
    }

    /// Initialize a fresh tree: one empty leaf as the root.
    fn init_tree(&self) -> Result<()> {
        self.lcnt.store(0, Ordering::Release);
        let node = self.create_leaf(0, 0);
        debug_assert_eq!(node.id, 1);
        self.root.store(1, Ordering::Release);
        self.first.store(1, Ordering::Release);
        self.last.store(1, Ordering::Release);
        self.lcnt.store(1, Ordering::Release);
        self.icnt.store(0, Ordering::Release);
        self.count.store(0, Ordering::Release);
        self.dump_meta()?;
        self.flush_leaf_cache(true)?;
        self.cusage.store(0, Ordering::Release);
        Ok(())
    }
}

impl Db for TreeDb {
    fn open(&self, path: &str, mode: Mode) -> Result<()> {
        let _g = self.mlock.write();
        self.check_closed()?;
        let writer = mode.contains(OpenMode::Writer);
        // The tree engine orchestrates transactions and synchronization
        // itself; the hash layer must not wrap page writes on its own.
        let hmode = mode & !(OpenMode::AutoTran | OpenMode::AutoSync);
        match self.hdb.open(path, hmode) {
            Ok(()) => {}
            Err(Error::Broken(_)) if !writer => {
                // A reader cannot repair a crashed file; fix it up through
                // a temporary writer connection, then reopen read-only.
                let mut wmode = hmode;
                wmode.remove(OpenMode::Reader);
                wmode.insert(OpenMode::Writer);
                self.hdb.open(path, wmode)?;
                self.writer.store(true, Ordering::Release);
                let res = if self.hdb.reorganized() {
                    self.reorganize_file(path)
                } else {
                    self.recalc_count()
                };
                self.writer.store(false, Ordering::Release);
                if let Err(err) = res.and_then(|_| self.hdb.close()) {
                    let _ = self.hdb.close();
                    return Err(err);
                }
                self.hdb.open(path, hmode)?;
            }
            Err(err) => return Err(err),
        }
        self.writer.store(writer, Ordering::Release);
        let res = (|| -> Result<()> {
            if writer && (self.hdb.recovered() || self.hdb.reorganized()) {
                if self.hdb.reorganized() {
                    self.reorganize_file(path)?;
                } else {
                    self.recalc_count()?;
                }
            }
            if writer && self.hdb.count()? == 0 {
                self.init_tree()?;
            }
            self.load_meta()?;
            if self.psiz.load(Ordering::Acquire) < 1
                || self.root.load(Ordering::Acquire) < 1
                || self.first.load(Ordering::Acquire) < 1
                || self.last.load(Ordering::Acquire) < 1
                || self.lcnt.load(Ordering::Acquire) < 1
                || self.icnt.load(Ordering::Acquire) < 0
                || self.count.load(Ordering::Acquire) < 0
            {
                return Err(Error::Broken("invalid meta data".into()));
            }
            Ok(())
        })();
        if let Err(err) = res {
            let _ = self.hdb.close();
            self.writer.store(false, Ordering::Release);
            return Err(err);
        }
        self.writer.store(writer, Ordering::Release);
        self.autotran
            .store(writer && mode.contains(OpenMode::AutoTran), Ordering::Release);
        self.autosync
            .store(writer && mode.contains(OpenMode::AutoSync), Ordering::Release);
        self.cusage.store(0, Ordering::Release);
        self.tran.store(false, Ordering::Release);
        self.omode.store(mode.bits(), Ordering::Release);
        Ok(())
    }

    fn close(&self) -> Result<()> {
        let _g = self.mlock.write();
        self.check_open(false)?;
        let mut first_err = None;
        if self.tran.load(Ordering::Acquire) {
            if let Err(err) = self.abort_transaction() {
                first_err.get_or_insert(err);
            }
            self.tran.store(false, Ordering::Release);
        }
        self.disable_cursors();
        let save = self.writer.load(Ordering::Acquire);
        if let Err(err) = self.flush_leaf_cache(save) {
            first_err.get_or_insert(err);
        }
        if let Err(err) = self.flush_inner_cache(save) {
            first_err.get_or_insert(err);
        }
        if self.cusage.load(Ordering::Acquire) != 0 {
            warn!(
                cusage = self.cusage.load(Ordering::Acquire),
                "cache usage out of balance at close"
            );
            self.cusage.store(0, Ordering::Release);
        }
        if save {
            if let Err(err) = self.dump_meta() {
                first_err.get_or_insert(err);
            }
        }
        if let Err(err) = self.hdb.close() {
            first_err.get_or_insert(err);
        }
        self.omode.store(0, Ordering::Release);
        self.writer.store(false, Ordering::Release);
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn accept(&self, key: &[u8], visitor: &mut dyn Visitor, writable: bool) -> Result<()> {
        let comp = self.comparator();
        let mut follow = Followup::None;
        let need_sync;
        {
            let _g = self.mlock.read();
            self.check_open(writable)?;
            let (node, _hist) = self.search_tree(&comp, key, true)?;
            let reorg = if writable {
                let mut core = node.core.write();
                self.accept_leaf(&comp, &mut core, key, visitor)?
            } else {
                let core = node.core.read();
                self.accept_leaf_ro(&comp, &core, key, visitor)?;
                false
            };
            let dirty = node.core.read().dirty;
            let atran = self.autotran.load(Ordering::Acquire)
                && dirty
                && !self.tran.load(Ordering::Acquire);
            need_sync = self.autosync.load(Ordering::Acquire)
                && !self.autotran.load(Ordering::Acquire)
                && dirty;
            if reorg {
                follow = Followup::Reorg;
            } else {
                if atran {
                    self.fix_auto_transaction_leaf(&node)?;
                }
                if self.over_cap() {
                    follow = Followup::Flush;
                }
            }
        }
        match follow {
            Followup::Reorg => {
                let _g = self.mlock.write();
                self.check_open(writable)?;
                let (node, hist) = self.search_tree(&comp, key, false)?;
                self.reorganize_tree(&comp, &node, &hist)?;
                if self.autotran.load(Ordering::Acquire) && !self.tran.load(Ordering::Acquire) {
                    self.fix_auto_transaction_tree()?;
                }
                if self.over_cap() {
                    self.flush_pressure()?;
                }
            }
            Followup::Flush => {
                let _g = self.mlock.write();
                self.check_open(false)?;
                self.flush_pressure()?;
            }
            Followup::None => {}
        }
        if need_sync {
            let _g = self.mlock.write();
            self.check_open(false)?;
            self.fix_auto_synchronization()?;
        }
        Ok(())
    }

    fn iterate(&self, visitor: &mut dyn Visitor, writable: bool) -> Result<()> {
        let _g = self.mlock.write();
        self.check_open(writable)?;
        let comp = self.comparator();
        let mut atran = false;
        if self.autotran.load(Ordering::Acquire) && writable && !self.tran.load(Ordering::Acquire)
        {
            self.begin_transaction_impl(self.autosync.load(Ordering::Acquire))?;
            atran = true;
        }
        let mut id = self.first.load(Ordering::Acquire);
        while id > 0 {
            let node = self.load_leaf(id, false)?;
            let (next, keys) = {
                let core = node.core.read();
                (
                    core.next,
                    core.recs.iter().map(|r| r.key.clone()).collect::<Vec<_>>(),
                )
            };
            let mut reorg = false;
            if writable {
                let mut core = node.core.write();
                for key in &keys {
                    reorg |= self.accept_leaf(&comp, &mut core, key, visitor)?;
                }
            } else {
                let core = node.core.read();
                for key in &keys {
                    self.accept_leaf_ro(&comp, &core, key, visitor)?;
                }
            }
            if reorg {
                if let Some(first_key) = keys.first() {
                    let (n2, hist) = self.search_tree(&comp, first_key, false)?;
                    self.reorganize_tree(&comp, &n2, &hist)?;
                }
            }
            if self.over_cap() {
                self.flush_pressure()?;
            }
            id = next;
        }
        if atran {
            let res = self.commit_transaction();
            self.tran.store(false, Ordering::Release);
            res?;
        }
        if self.autosync.load(Ordering::Acquire)
            && !self.autotran.load(Ordering::Acquire)
            && writable
        {
            self.fix_auto_synchronization()?;
        }
        Ok(())
    }

    fn synchronize(&self, hard: bool) -> Result<()> {
        let _g = self.mlock.write();
        self.check_open(true)?;
        self.clean_caches()?;
        self.dump_meta()?;
        self.hdb.synchronize(hard)
    }

    fn begin_transaction(&self, hard: bool) -> Result<()> {
        let mut wait = std::time::Duration::from_millis(1);
        loop {
            let guard = self.mlock.write();
            self.check_open(true)?;
            if !self.tran.load(Ordering::Acquire) {
                return self.begin_transaction_impl(hard);
            }
            drop(guard);
            std::thread::sleep(wait);
            wait = (wait * 2).min(std::time::Duration::from_secs(1));
        }
    }

    fn begin_transaction_try(&self, hard: bool) -> Result<()> {
        let _g = self.mlock.write();
        self.check_open(true)?;
        if self.tran.load(Ordering::Acquire) {
            return Err(Error::Logic("competition avoided"));
        }
        self.begin_transaction_impl(hard)
    }

    fn end_transaction(&self, commit: bool) -> Result<()> {
        let _g = self.mlock.write();
        self.check_open(true)?;
        if !self.tran.load(Ordering::Acquire) {
            return Err(Error::Invalid("not in transaction"));
        }
        let res = if commit {
            self.commit_transaction()
        } else {
            self.abort_transaction()
        };
        self.tran.store(false, Ordering::Release);
        res
    }

    fn clear(&self) -> Result<()> {
        let _g = self.mlock.write();
        self.check_open(true)?;
        self.disable_cursors();
        self.flush_leaf_cache(false)?;
        self.flush_inner_cache(false)?;
        self.cusage.store(0, Ordering::Release);
        self.hdb.clear()?;
        self.init_tree()
    }

    fn count(&self) -> Result<u64> {
        self.check_open(false)?;
        Ok(self.count.load(Ordering::Acquire).max(0) as u64)
    }

    fn size(&self) -> Result<u64> {
        self.hdb.size()
    }

    fn path(&self) -> Result<String> {
        self.hdb.path()
    }

    fn status(&self) -> Result<BTreeMap<String, String>> {
        let _g = self.mlock.read();
        self.check_open(false)?;
        let mut map = self.hdb.status()?;
        map.insert("type".into(), "TreeDb".into());
        map.insert("psiz".into(), self.psiz.load(Ordering::Acquire).to_string());
        map.insert("pccap".into(), self.pccap.load(Ordering::Acquire).to_string());
        map.insert("rcomp".into(), self.comp.lock().name().into());
        map.insert("root".into(), self.root.load(Ordering::Acquire).to_string());
        map.insert("first".into(), self.first.load(Ordering::Acquire).to_string());
        map.insert("last".into(), self.last.load(Ordering::Acquire).to_string());
        map.insert("lcnt".into(), self.lcnt.load(Ordering::Acquire).to_string());
        map.insert("icnt".into(), self.icnt.load(Ordering::Acquire).to_string());
        map.insert("count".into(), self.count.load(Ordering::Acquire).to_string());
        map.insert("cusage".into(), self.cusage.load(Ordering::Acquire).to_string());
        Ok(map)
    }
}

impl Drop for TreeDb {
    fn drop(&mut self) {
        if self.omode.load(Ordering::Acquire) != 0 {
            if let Err(err) = self.close() {
                warn!(%err, "implicit close failed");
            }
        }
    }
}

struct LeafHarvester<'a> {
    dest: &'a TreeDb,
    error: Option<Error>,
}

impl Visitor for LeafHarvester<'_> {
    fn visit_full(&mut self, key: &[u8], value: &[u8]) -> Action {
        if self.error.is_some() || key.first() != Some(&b'L') {
            return Action::Keep;
        }
        if let Some(core) = deserialize_leaf(value) {
            for rec in core.recs {
                if let Err(err) = self.dest.set(&rec.key, &rec.value) {
                    self.error = Some(err);
                    break;
                }
            }
        }
        Action::Keep
    }
}

struct RawCopier<'a> {
    dest: &'a HashDb,
    error: Option<Error>,
}

impl Visitor for RawCopier<'_> {
    fn visit_full(&mut self, key: &[u8], value: &[u8]) -> Action {
        if self.error.is_none() {
            if let Err(err) = self.dest.set(key, value) {
                self.error = Some(err);
            }
        }
        Action::Keep
    }
}

/// Cursor over the records of a [`TreeDb`], ordered by the comparator.
pub struct TreeCursor<'a> {
    db: &'a TreeDb,
    pos: Arc<Mutex<CurPos>>,
}

impl TreeCursor<'_> {
    fn current(&self) -> Result<(Vec<u8>, i64)> {
        let pos = self.pos.lock();
        match &pos.key {
            Some(key) => Ok((key.clone(), pos.lid)),
            None => Err(Error::NoRec),
        }
    }

    fn set_pos(&self, key: Option<Vec<u8>>, lid: i64) {
        let mut pos = self.pos.lock();
        pos.key = key;
        pos.lid = lid;
    }

    /// Speculative visit against the cached leaf the cursor remembers.
    /// Returns `None` on a miss, else the follow-up work needed.
    fn accept_spec(
        &self,
        comp: &Comparator,
        visitor: &mut dyn Visitor,
        writable: bool,
        step: bool,
        key: &[u8],
        lid: i64,
    ) -> Result<Option<Followup>> {
        let db = self.db;
        let node = match db.load_leaf(lid, false) {
            Ok(node) => node,
            Err(_) => return Ok(None),
        };
        let mut followup = Followup::None;
        let mut advance_next = false;
        {
            let mut core = node.core.write();
            let in_range = match (core.recs.first(), core.recs.last()) {
                (Some(first), Some(last)) => {
                    comp.compare(key, &first.key) != CmpOrdering::Less
                        && comp.compare(key, &last.key) != CmpOrdering::Greater
                }
                _ => false,
            };
            if !in_range {
                return Ok(None);
            }
            let idx = core
                .recs
                .partition_point(|r| comp.compare(&r.key, key) == CmpOrdering::Less);
            if idx >= core.recs.len() {
                return Ok(None);
            }
            let target = core.recs[idx].key.clone();
            if target != key {
                self.set_pos(Some(target.clone()), lid);
            }
            let action = visitor.visit_full(&target, &core.recs[idx].value);
            if !writable && !matches!(action, Action::Keep) {
                return Err(Error::NoPerm("permission denied"));
            }
            let mut advanced = false;
            match action {
                Action::Keep => {}
                Action::Remove => {
                    let weight = core.recs[idx].weight();
                    core.recs.remove(idx);
                    core.size -= weight;
                    core.dirty = true;
                    db.count.fetch_sub(1, Ordering::AcqRel);
                    db.cusage.fetch_sub(weight as i64, Ordering::AcqRel);
                    if idx < core.recs.len() {
                        self.set_pos(Some(core.recs[idx].key.clone()), lid);
                        advanced = true;
                    }
                    if core.recs.is_empty() {
                        followup = Followup::Reorg;
                    }
                }
                Action::Replace(value) => {
                    let diff = value.len() as i64 - core.recs[idx].value.len() as i64;
                    core.recs[idx].value = value;
                    core.size = (core.size as i64 + diff) as u64;
                    core.dirty = true;
                    db.cusage.fetch_add(diff, Ordering::AcqRel);
                    if core.size > db.psiz.load(Ordering::Acquire) && core.recs.len() > 1 {
                        followup = Followup::Reorg;
                    }
                }
            }
            if step && !advanced {
                if idx + 1 < core.recs.len() {
                    self.set_pos(Some(core.recs[idx + 1].key.clone()), lid);
                } else {
                    advance_next = true;
                }
            }
        }
        if advance_next {
            let next = node.core.read().next;
            match db.leaf_chain_first(next)? {
                Some((k, l)) => self.set_pos(Some(k), l),
                None => self.set_pos(None, 0),
            }
        }
        let dirty = node.core.read().dirty;
        if matches!(followup, Followup::None) {
            if db.autotran.load(Ordering::Acquire) && dirty && !db.tran.load(Ordering::Acquire) {
                db.fix_auto_transaction_leaf(&node)?;
            }
            if db.over_cap() {
                followup = Followup::Flush;
            }
        }
        Ok(Some(followup))
    }

    /// Authoritative visit under the exclusive method lock, searching from
    /// the root.
    fn accept_atom(
        &self,
        comp: &Comparator,
        visitor: &mut dyn Visitor,
        writable: bool,
        step: bool,
    ) -> Result<()> {
        let db = self.db;
        for _ in 0..LEVEL_MAX * 4 {
            let (key, _) = self.current()?;
            let (node, hist) = db.search_tree(comp, &key, true)?;
            let empty = node.core.read().recs.is_empty();
            if empty {
                let next = node.core.read().next;
                match db.leaf_chain_first(next)? {
                    Some((k, l)) => {
                        if l == node.id {
                            return Err(Error::Broken("invalid leaf chain".into()));
                        }
                        self.set_pos(Some(k), l);
                        continue;
                    }
                    None => {
                        self.set_pos(None, 0);
                        return Err(Error::NoRec);
                    }
                }
            }
            let mut reorg = false;
            let mut handled = false;
            let mut advance_next = false;
            {
                let mut core = node.core.write();
                let idx = core
                    .recs
                    .partition_point(|r| comp.compare(&r.key, key.as_slice()) == CmpOrdering::Less);
                if idx >= core.recs.len() {
                    let next = core.next;
                    drop(core);
                    match db.leaf_chain_first(next)? {
                        Some((k, l)) => {
                            if l == node.id {
                                return Err(Error::Broken("invalid leaf chain".into()));
                            }
                            self.set_pos(Some(k), l);
                            continue;
                        }
                        None => {
                            self.set_pos(None, 0);
                            return Err(Error::NoRec);
                        }
                    }
                }
                handled = true;
                let target = core.recs[idx].key.clone();
                self.set_pos(Some(target.clone()), node.id);
                let action = visitor.visit_full(&target, &core.recs[idx].value);
                if !writable && !matches!(action, Action::Keep) {
                    return Err(Error::NoPerm("permission denied"));
                }
                let mut advanced = false;
                match action {
                    Action::Keep => {}
                    Action::Remove => {
                        let weight = core.recs[idx].weight();
                        core.recs.remove(idx);
                        core.size -= weight;
                        core.dirty = true;
                        db.count.fetch_sub(1, Ordering::AcqRel);
                        db.cusage.fetch_sub(weight as i64, Ordering::AcqRel);
                        if idx < core.recs.len() {
                            self.set_pos(Some(core.recs[idx].key.clone()), node.id);
                            advanced = true;
                        }
                        if core.recs.is_empty() {
                            reorg = true;
                        }
                    }
                    Action::Replace(value) => {
                        let diff = value.len() as i64 - core.recs[idx].value.len() as i64;
                        core.recs[idx].value = value;
                        core.size = (core.size as i64 + diff) as u64;
                        core.dirty = true;
                        db.cusage.fetch_add(diff, Ordering::AcqRel);
                        if core.size > db.psiz.load(Ordering::Acquire) && core.recs.len() > 1 {
                            reorg = true;
                        }
                    }
                }
                if step && !advanced {
                    if idx + 1 < core.recs.len() {
                        self.set_pos(Some(core.recs[idx + 1].key.clone()), node.id);
                    } else {
                        advance_next = true;
                    }
                }
            }
            if advance_next {
                let next = node.core.read().next;
                match db.leaf_chain_first(next)? {
                    Some((k, l)) => self.set_pos(Some(k), l),
                    None => self.set_pos(None, 0),
                }
            }
            if handled {
                let dirty = node.core.read().dirty;
                let atran = db.autotran.load(Ordering::Acquire)
                    && dirty
                    && !db.tran.load(Ordering::Acquire);
                if reorg {
                    db.reorganize_tree(comp, &node, &hist)?;
                    if atran {
                        db.fix_auto_transaction_tree()?;
                    }
                } else {
                    if atran {
                        db.fix_auto_transaction_leaf(&node)?;
                    }
                    if db.over_cap() {
                        db.flush_pressure()?;
                    }
                }
                if db.autosync.load(Ordering::Acquire)
                    && !db.autotran.load(Ordering::Acquire)
                    && dirty
                {
                    db.fix_auto_synchronization()?;
                }
                return Ok(());
            }
        }
        Err(Error::Broken("cursor retry limit exceeded".into()))
    }
}

impl Cursor for TreeCursor<'_> {
    fn accept(&mut self, visitor: &mut dyn Visitor, writable: bool, step: bool) -> Result<()> {
        let comp = self.db.comparator();
        {
            let _g = self.db.mlock.read();
            self.db.check_open(writable)?;
            let (key, lid) = self.current()?;
            if lid > 0 {
                match self.accept_spec(&comp, visitor, writable, step, &key, lid)? {
                    Some(Followup::None) => return Ok(()),
                    Some(Followup::Reorg) => {
                        drop(_g);
                        let _w = self.db.mlock.write();
                        self.db.check_open(writable)?;
                        let (node, hist) = self.db.search_tree(&comp, &key, false)?;
                        self.db.reorganize_tree(&comp, &node, &hist)?;
                        if self.db.autotran.load(Ordering::Acquire)
                            && !self.db.tran.load(Ordering::Acquire)
                        {
                            self.db.fix_auto_transaction_tree()?;
                        }
                        return Ok(());
                    }
                    Some(Followup::Flush) => {
                        drop(_g);
                        let _w = self.db.mlock.write();
                        self.db.check_open(false)?;
                        self.db.flush_pressure()?;
                        return Ok(());
                    }
                    None => {}
                }
            }
        }
        let _w = self.db.mlock.write();
        self.db.check_open(writable)?;
        self.accept_atom(&comp, visitor, writable, step)
    }

    fn jump(&mut self) -> Result<()> {
        let _g = self.db.mlock.read();
        self.db.check_open(false)?;
        let first = self.db.first.load(Ordering::Acquire);
        match self.db.leaf_chain_first(first)? {
            Some((key, lid)) => {
                self.set_pos(Some(key), lid);
                Ok(())
            }
            None => {
                self.set_pos(None, 0);
                Err(Error::NoRec)
            }
        }
    }

    fn jump_key(&mut self, key: &[u8]) -> Result<()> {
        let _g = self.db.mlock.read();
        self.db.check_open(false)?;
        let comp = self.db.comparator();
        let (node, _) = self.db.search_tree(&comp, key, false)?;
        let next = {
            let core = node.core.read();
            let idx = core
                .recs
                .partition_point(|r| comp.compare(&r.key, key) == CmpOrdering::Less);
            if idx < core.recs.len() {
                self.set_pos(Some(core.recs[idx].key.clone()), node.id);
                return Ok(());
            }
            core.next
        };
        match self.db.leaf_chain_first(next)? {
            Some((k, l)) => {
                self.set_pos(Some(k), l);
                Ok(())
            }
            None => {
                self.set_pos(None, 0);
                Err(Error::NoRec)
            }
        }
    }

    fn step(&mut self) -> Result<()> {
        struct Passer;
        impl Visitor for Passer {}
        self.accept(&mut Passer, false, true)?;
        if self.pos.lock().key.is_none() {
            return Err(Error::NoRec);
        }
        Ok(())
    }
}

impl Drop for TreeCursor<'_> {
    fn drop(&mut self) {
        self.db
            .cursors
            .lock()
            .retain(|c| !Arc::ptr_eq(c, &self.pos));
    }
}
