// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! File abstraction backing the durable engines: a memory-mapped prefix
//! with positioned-I/O fallback, and an embedded write-ahead log that
//! records pre-images of in-place writes so a transaction can be rolled
//! back and a crashed database recovered at the next open.

use crate::db::{Mode, OpenMode};
use crate::error::{Error, Result};
use byteorder::{BigEndian, ByteOrder};
use fs2::FileExt;
use memmap2::{MmapOptions, MmapRaw};
use parking_lot::Mutex;
use std::fs::{self, OpenOptions};
use std::os::unix::fs::FileExt as UnixFileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Page granularity of mapping and physical growth.
const PAGE_SIZE: u64 = 4096;
/// Extension of the write-ahead log file.
const WAL_EXT: &str = "wal";
/// Magic data heading the WAL file.
const WAL_MAGIC: &[u8; 3] = b"KW\n";
/// Magic byte heading each WAL pre-image record.
const WAL_REC_MAGIC: u8 = 0xee;
/// Size the WAL file is trimmed back to after a commit.
const WAL_RESERVED: u64 = 256 << 10;
/// Size of the WAL header: magic plus the original logical size.
const WAL_HEAD: u64 = 3 + 8;

fn wal_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(".");
    os.push(WAL_EXT);
    PathBuf::from(os)
}

struct Wal {
    file: fs::File,
    size: u64,
}

struct Core {
    file: Option<Arc<fs::File>>,
    map: Option<MmapRaw>,
    writer: bool,
    locked: bool,
    msiz: u64,
    lsiz: u64,
    psiz: u64,
    path: PathBuf,
    wal: Option<Wal>,
    tran: bool,
    trhard: bool,
    trbase: u64,
    trmsiz: u64,
    recovered: bool,
}

impl Core {
    fn empty() -> Self {
        Core {
            file: None,
            map: None,
            writer: false,
            locked: false,
            msiz: 0,
            lsiz: 0,
            psiz: 0,
            path: PathBuf::new(),
            wal: None,
            tran: false,
            trhard: false,
            trbase: 0,
            trmsiz: 0,
            recovered: false,
        }
    }
}

/// Memory-mapped file with transaction log.
///
/// Byte copies into the mapped prefix happen outside the attribute lock;
/// callers must guarantee that concurrent operations touch disjoint ranges
/// (the engines do, through their stripe locks) and that `close` and
/// `refresh` only run while no other operation is in flight.
pub struct MappedFile {
    core: Mutex<Core>,
    map_ptr: AtomicPtr<u8>,
    map_len: AtomicU64,
}

// The raw map pointer is only dereferenced for ranges below the logical
// size, which exist for the lifetime of the mapping.
unsafe impl Send for MappedFile {}
unsafe impl Sync for MappedFile {}

impl Default for MappedFile {
    fn default() -> Self {
        Self::new()
    }
}

impl MappedFile {
    pub fn new() -> Self {
        MappedFile {
            core: Mutex::new(Core::empty()),
            map_ptr: AtomicPtr::new(std::ptr::null_mut()),
            map_len: AtomicU64::new(0),
        }
    }

    /// Open the file, recovering from a leftover WAL first if one exists.
    pub fn open(&self, path: &Path, mode: Mode, msiz: u64) -> Result<()> {
        let mut core = self.core.lock();
        if core.file.is_some() {
            return Err(Error::Invalid("already opened"));
        }
        *core = Core::empty();
        let writer = mode.contains(OpenMode::Writer);
        let file = OpenOptions::new()
            .read(true)
            .write(writer)
            .create(writer && mode.contains(OpenMode::Create))
            .truncate(writer && mode.contains(OpenMode::Truncate))
            .open(path)
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => Error::NoFile(path.display().to_string()),
                std::io::ErrorKind::PermissionDenied => Error::NoPerm("open failed"),
                _ => Error::from(e),
            })?;
        if !mode.contains(OpenMode::NoLock) {
            let res = match (writer, mode.contains(OpenMode::TryLock)) {
                (true, true) => FileExt::try_lock_exclusive(&file),
                (true, false) => FileExt::lock_exclusive(&file),
                (false, true) => FileExt::try_lock_shared(&file),
                (false, false) => FileExt::lock_shared(&file),
            };
            res.map_err(|e| Error::System(format!("file lock failed: {e}")))?;
            core.locked = true;
        }
        let mut recovered = false;
        if !(writer && mode.contains(OpenMode::Truncate)) {
            recovered = recover_pending_wal(path, &file, writer)?;
        }
        let lsiz = file.metadata()?.len();
        let mut msiz = msiz;
        if !writer && msiz > lsiz {
            msiz = lsiz;
        }
        msiz = crate::util::align_up(msiz, PAGE_SIZE);
        let map = if msiz > 0 {
            // The mapping may extend past the current end of file; the
            // physical size is always grown before those pages are touched.
            let map = MmapOptions::new()
                .len(msiz as usize)
                .map_raw(&file)
                .map_err(|e| Error::System(format!("mmap failed: {e}")))?;
            self.map_ptr.store(map.as_mut_ptr(), Ordering::Release);
            self.map_len.store(msiz, Ordering::Release);
            Some(map)
        } else {
            None
        };
        core.file = Some(Arc::new(file));
        core.map = map;
        core.writer = writer;
        core.msiz = msiz;
        core.lsiz = lsiz;
        core.psiz = lsiz;
        core.path = path.to_path_buf();
        core.recovered = recovered;
        Ok(())
    }

    /// Close the file, aborting an open transaction and trimming the
    /// physical size back to the logical size.
    pub fn close(&self) -> Result<()> {
        let mut core = self.core.lock();
        if core.file.is_none() {
            return Err(Error::Invalid("not opened"));
        }
        let mut first_err = None;
        if core.tran {
            if let Err(err) = end_transaction_locked(&mut core, false) {
                first_err.get_or_insert(err);
            }
        }
        if core.wal.take().is_some() {
            let wpath = wal_path(&core.path);
            if wpath.is_file() {
                if let Err(err) = fs::remove_file(&wpath) {
                    first_err.get_or_insert(err.into());
                }
            }
        }
        let file = core.file.take().expect("checked above");
        if core.psiz != core.lsiz {
            if let Err(err) = file.set_len(core.lsiz) {
                first_err.get_or_insert(err.into());
            }
        }
        if core.locked {
            let _ = FileExt::unlock(&*file);
        }
        self.map_ptr.store(std::ptr::null_mut(), Ordering::Release);
        self.map_len.store(0, Ordering::Release);
        *core = Core::empty();
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Whether the last `open` replayed a write-ahead log.
    pub fn recovered(&self) -> bool {
        self.core.lock().recovered
    }

    /// Logical size of the file.
    pub fn size(&self) -> u64 {
        self.core.lock().lsiz
    }

    pub fn path(&self) -> PathBuf {
        self.core.lock().path.clone()
    }

    /// Write data at an offset, logging the pre-image when a transaction
    /// is active.
    pub fn write(&self, off: u64, buf: &[u8]) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        let mut core = self.core.lock();
        let file = match &core.file {
            Some(file) => Arc::clone(file),
            None => return Err(Error::Invalid("not opened")),
        };
        if !core.writer {
            return Err(Error::NoPerm("permission denied"));
        }
        if core.tran {
            wal_write(&mut core, &file, off, buf.len() as u64)?;
        }
        let end = off + buf.len() as u64;
        if end <= core.msiz {
            if end > core.psiz {
                let mut psiz = crate::util::align_up(end + core.psiz / 2, PAGE_SIZE);
                if psiz > core.msiz {
                    psiz = core.msiz;
                }
                file.set_len(psiz)?;
                core.psiz = psiz;
            }
            if end > core.lsiz {
                core.lsiz = end;
            }
            let ptr = self.map_ptr.load(Ordering::Acquire);
            drop(core);
            unsafe {
                std::ptr::copy_nonoverlapping(buf.as_ptr(), ptr.add(off as usize), buf.len());
            }
            return Ok(());
        }
        // Straddles or lies past the mapped prefix.
        if end > core.psiz {
            if core.psiz < core.msiz {
                file.set_len(core.msiz)?;
            }
            core.psiz = end;
        }
        if end > core.lsiz {
            core.lsiz = end;
        }
        let msiz = core.msiz;
        let ptr = self.map_ptr.load(Ordering::Acquire);
        drop(core);
        let mut off = off;
        let mut buf = buf;
        if off < msiz {
            let head = (msiz - off) as usize;
            unsafe {
                std::ptr::copy_nonoverlapping(buf.as_ptr(), ptr.add(off as usize), head);
            }
            off += head as u64;
            buf = &buf[head..];
        }
        file.write_all_at(buf, off)?;
        Ok(())
    }

    /// Append data at the end of the file and return the offset it was
    /// written at.
    pub fn append(&self, buf: &[u8]) -> Result<u64> {
        let mut core = self.core.lock();
        let file = match &core.file {
            Some(file) => Arc::clone(file),
            None => return Err(Error::Invalid("not opened")),
        };
        if !core.writer {
            return Err(Error::NoPerm("permission denied"));
        }
        let off = core.lsiz;
        let end = off + buf.len() as u64;
        if end <= core.msiz {
            if end > core.psiz {
                let mut psiz = crate::util::align_up(end + core.psiz / 2, PAGE_SIZE);
                if psiz > core.msiz {
                    psiz = core.msiz;
                }
                file.set_len(psiz)?;
                core.psiz = psiz;
            }
            core.lsiz = end;
            let ptr = self.map_ptr.load(Ordering::Acquire);
            drop(core);
            unsafe {
                std::ptr::copy_nonoverlapping(buf.as_ptr(), ptr.add(off as usize), buf.len());
            }
            return Ok(off);
        }
        if off < core.msiz && core.psiz < core.msiz {
            file.set_len(core.msiz)?;
        }
        core.lsiz = end;
        core.psiz = end;
        let msiz = core.msiz;
        let ptr = self.map_ptr.load(Ordering::Acquire);
        drop(core);
        let mut woff = off;
        let mut rest = buf;
        if woff < msiz {
            let head = (msiz - woff) as usize;
            unsafe {
                std::ptr::copy_nonoverlapping(rest.as_ptr(), ptr.add(woff as usize), head);
            }
            woff += head as u64;
            rest = &rest[head..];
        }
        file.write_all_at(rest, woff)?;
        Ok(off)
    }

    /// Read an exact region into `buf`.
    pub fn read_into(&self, off: u64, buf: &mut [u8]) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        let core = self.core.lock();
        let file = match &core.file {
            Some(file) => Arc::clone(file),
            None => return Err(Error::Invalid("not opened")),
        };
        let end = off + buf.len() as u64;
        if end > core.lsiz {
            return Err(Error::Broken(format!(
                "read out of bounds: off={} size={} lsiz={}",
                off,
                buf.len(),
                core.lsiz
            )));
        }
        let msiz = core.msiz;
        let ptr = self.map_ptr.load(Ordering::Acquire);
        drop(core);
        let mut off = off;
        let mut buf = &mut buf[..];
        if off < msiz {
            let head = buf.len().min((msiz - off) as usize);
            unsafe {
                std::ptr::copy_nonoverlapping(ptr.add(off as usize), buf.as_mut_ptr(), head);
            }
            off += head as u64;
            buf = &mut buf[head..];
        }
        if !buf.is_empty() {
            file.read_exact_at(buf, off)?;
        }
        Ok(())
    }

    /// Read an exact region into a fresh vector.
    pub fn read(&self, off: u64, size: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; size];
        self.read_into(off, &mut buf)?;
        Ok(buf)
    }

    /// Truncate the file to `size`, logging the removed tail when a
    /// transaction is active.
    pub fn truncate(&self, size: u64) -> Result<()> {
        let mut core = self.core.lock();
        let file = match &core.file {
            Some(file) => Arc::clone(file),
            None => return Err(Error::Invalid("not opened")),
        };
        if !core.writer {
            return Err(Error::NoPerm("permission denied"));
        }
        if core.tran && size < core.trmsiz {
            let removed = core.trmsiz - size;
            wal_write(&mut core, &file, size, removed)?;
            core.trmsiz = size;
        }
        file.set_len(size)?;
        core.lsiz = size;
        core.psiz = size;
        Ok(())
    }

    /// Flush the mapped region, trim the physical size to the logical size
    /// and, if `hard`, synchronize with the device.
    pub fn synchronize(&self, hard: bool) -> Result<()> {
        let mut core = self.core.lock();
        let file = match &core.file {
            Some(file) => Arc::clone(file),
            None => return Err(Error::Invalid("not opened")),
        };
        if hard {
            if let Some(map) = &core.map {
                map.flush()
                    .map_err(|e| Error::System(format!("msync failed: {e}")))?;
            }
        }
        file.set_len(core.lsiz)?;
        if core.psiz > core.lsiz {
            core.psiz = core.lsiz;
        }
        if hard {
            file.sync_all()?;
        }
        Ok(())
    }

    /// Re-read the size of a file that may have been updated externally.
    ///
    /// Must only run while no other operation is in flight.
    pub fn refresh(&self) -> Result<()> {
        let mut core = self.core.lock();
        let file = match &core.file {
            Some(file) => Arc::clone(file),
            None => return Err(Error::Invalid("not opened")),
        };
        let len = file.metadata()?.len();
        core.lsiz = len;
        core.psiz = len;
        if core.msiz > 0 {
            let map = MmapOptions::new()
                .len(core.msiz as usize)
                .map_raw(&*file)
                .map_err(|e| Error::System(format!("mmap failed: {e}")))?;
            self.map_ptr.store(map.as_mut_ptr(), Ordering::Release);
            core.map = Some(map);
        }
        Ok(())
    }

    /// Begin a transaction: create or reuse the WAL file, record the
    /// original logical size and the guard offset below which writes are
    /// not logged.
    pub fn begin_transaction(&self, hard: bool, guard_off: u64) -> Result<()> {
        let mut core = self.core.lock();
        if core.file.is_none() {
            return Err(Error::Invalid("not opened"));
        }
        if !core.writer {
            return Err(Error::NoPerm("permission denied"));
        }
        if core.tran {
            return Err(Error::Invalid("already in transaction"));
        }
        if core.wal.is_none() {
            let wpath = wal_path(&core.path);
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(&wpath)?;
            file.set_len(WAL_RESERVED)?;
            if hard {
                file.sync_all()?;
            }
            core.wal = Some(Wal { file, size: 0 });
        }
        let lsiz = core.lsiz;
        let wal = core.wal.as_mut().expect("created above");
        let mut head = [0u8; WAL_HEAD as usize];
        head[..3].copy_from_slice(WAL_MAGIC);
        BigEndian::write_u64(&mut head[3..], lsiz);
        wal.file.write_all_at(&head, 0)?;
        wal.size = WAL_HEAD;
        if hard {
            wal.file.sync_data()?;
        }
        core.tran = true;
        core.trhard = hard;
        core.trbase = guard_off;
        core.trmsiz = lsiz;
        Ok(())
    }

    /// Commit or abort the current transaction. Aborting replays the WAL
    /// in reverse and truncates the file to its original size.
    pub fn end_transaction(&self, commit: bool) -> Result<()> {
        let mut core = self.core.lock();
        if core.file.is_none() {
            return Err(Error::Invalid("not opened"));
        }
        if !core.tran {
            return Err(Error::Invalid("not in transaction"));
        }
        end_transaction_locked(&mut core, commit)
    }

    /// Log the pre-image of a region explicitly, ignoring the guard
    /// offset. Used for header regions a caller wants restored on abort
    /// even though routine header writes are not logged.
    pub fn write_transaction(&self, off: u64, size: u64) -> Result<()> {
        let mut core = self.core.lock();
        let file = match &core.file {
            Some(file) => Arc::clone(file),
            None => return Err(Error::Invalid("not opened")),
        };
        if !core.tran {
            return Err(Error::Invalid("not in transaction"));
        }
        wal_write_base(&mut core, &file, off, size, 0)
    }

    /// Whether a transaction is active.
    pub fn in_transaction(&self) -> bool {
        self.core.lock().tran
    }
}

fn end_transaction_locked(core: &mut Core, commit: bool) -> Result<()> {
    let file = Arc::clone(core.file.as_ref().expect("caller checked"));
    if !commit {
        let wal = core.wal.as_mut().expect("transaction holds a wal");
        let orig = apply_wal(&wal.file, &file)?;
        core.lsiz = orig;
        core.psiz = orig;
    }
    let wal = core.wal.as_mut().expect("transaction holds a wal");
    wal.file.write_all_at(&[0u8; WAL_HEAD as usize], 0)?;
    if wal.size > WAL_RESERVED {
        wal.file.set_len(WAL_RESERVED)?;
    }
    wal.size = 0;
    if core.trhard {
        if let Some(map) = &core.map {
            map.flush()
                .map_err(|e| Error::System(format!("msync failed: {e}")))?;
        }
        file.sync_all()?;
        wal.file.sync_data()?;
    }
    core.tran = false;
    Ok(())
}

/// Append one pre-image record covering `[off, off+size)` clipped to the
/// guarded, pre-existing region of the file.
fn wal_write(core: &mut Core, file: &fs::File, off: u64, size: u64) -> Result<()> {
    let base = core.trbase;
    wal_write_base(core, file, off, size, base)
}

fn wal_write_base(
    core: &mut Core,
    file: &fs::File,
    mut off: u64,
    mut size: u64,
    base: u64,
) -> Result<()> {
    if off < base {
        let diff = base - off;
        if diff >= size {
            return Ok(());
        }
        off = base;
        size -= diff;
    }
    if off >= core.trmsiz {
        return Ok(());
    }
    size = size.min(core.trmsiz - off);
    let mut rec = vec![0u8; (1 + 8 + 8 + size) as usize];
    rec[0] = WAL_REC_MAGIC;
    BigEndian::write_u64(&mut rec[1..9], off);
    BigEndian::write_u64(&mut rec[9..17], size);
    file.read_exact_at(&mut rec[17..], off)?;
    let hard = core.trhard;
    let wal = core.wal.as_mut().expect("transaction holds a wal");
    wal.file.write_all_at(&rec, wal.size)?;
    wal.size += rec.len() as u64;
    if hard {
        wal.file.sync_data()?;
    }
    Ok(())
}

/// Replay a WAL onto the data file, restoring pre-images in reverse order
/// and truncating back to the original logical size, which is returned.
fn apply_wal(wal: &fs::File, data: &fs::File) -> Result<u64> {
    let wal_len = wal.metadata()?.len();
    if wal_len < WAL_HEAD {
        return Err(Error::Broken("too short WAL".into()));
    }
    let mut head = [0u8; WAL_HEAD as usize];
    wal.read_exact_at(&mut head, 0)?;
    if head[0] == 0 {
        // Committed already; nothing to undo.
        return Ok(data.metadata()?.len());
    }
    if &head[..3] != WAL_MAGIC {
        return Err(Error::Broken("invalid magic data of WAL".into()));
    }
    let orig = BigEndian::read_u64(&head[3..]);
    let mut msgs: Vec<(u64, Vec<u8>)> = Vec::new();
    let mut pos = WAL_HEAD;
    while pos < wal_len {
        let mut tag = [0u8; 1];
        wal.read_exact_at(&mut tag, pos)?;
        if tag[0] == 0 {
            break;
        }
        if tag[0] != WAL_REC_MAGIC {
            return Err(Error::Broken("invalid magic data of WAL message".into()));
        }
        if pos + 17 > wal_len {
            return Err(Error::Broken("too short WAL message".into()));
        }
        let mut meta = [0u8; 16];
        wal.read_exact_at(&mut meta, pos + 1)?;
        let off = BigEndian::read_u64(&meta[0..8]);
        let size = BigEndian::read_u64(&meta[8..16]);
        if pos + 17 + size > wal_len {
            return Err(Error::Broken("too short WAL message".into()));
        }
        let mut body = vec![0u8; size as usize];
        wal.read_exact_at(&mut body, pos + 17)?;
        msgs.push((off, body));
        pos += 17 + size;
    }
    let data_len = data.metadata()?.len();
    let max_end = msgs
        .iter()
        .map(|(off, body)| off + body.len() as u64)
        .max()
        .unwrap_or(0);
    if max_end > data_len {
        data.set_len(max_end)?;
    }
    for (off, body) in msgs.iter().rev() {
        data.write_all_at(body, *off)?;
    }
    data.set_len(orig)?;
    Ok(orig)
}

/// Recover from a WAL left behind by a crashed process, if any.
fn recover_pending_wal(path: &Path, file: &fs::File, writer: bool) -> Result<bool> {
    let wpath = wal_path(path);
    match fs::metadata(&wpath) {
        Ok(meta) if meta.is_file() && meta.len() >= WAL_HEAD => {}
        _ => return Ok(false),
    }
    let wal = match OpenOptions::new().read(true).write(true).open(&wpath) {
        Ok(wal) => wal,
        Err(_) => return Ok(false),
    };
    let mut magic = [0u8; 3];
    if wal.read_exact_at(&mut magic, 0).is_err() || &magic != WAL_MAGIC {
        // Empty or committed log; just discard it.
        let _ = fs::remove_file(&wpath);
        return Ok(false);
    }
    let applied = if writer {
        apply_wal(&wal, file)?
    } else {
        let data = OpenOptions::new().read(true).write(true).open(path)?;
        apply_wal(&wal, &data)?
    };
    wal.set_len(0)?;
    drop(wal);
    fs::remove_file(&wpath)?;
    debug!(path = %path.display(), size = applied, "applied write-ahead log");
    Ok(true)
}
