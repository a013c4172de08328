// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Embedded, single-process key-value storage library.
//!
//! Three engines share one contract: [`HashDb`] is a durable on-disk hash
//! table with a free-block pool, write-ahead logging, crash recovery and
//! online defragmentation; [`TreeDb`] is a B+ tree whose pages are records
//! inside a `HashDb`, with a two-tier page cache and cursors that survive
//! reorganization; [`CacheDb`] is an in-memory striped hash table with
//! per-slot LRU eviction under count and byte caps.
//!
//! All record operations go through the visitor protocol: [`Db::accept`]
//! calls a [`Visitor`] with the record's current state and applies the
//! returned [`Action`] atomically per key. The familiar operations
//! (`set`, `get`, `add`, `increment`, `cas`, ...) are provided methods of
//! the [`Db`] trait derived from that primitive.
//!
//! ```no_run
//! use coffer::{Db, OpenMode, TreeDb};
//!
//! let db = TreeDb::new();
//! db.open("casket.cft", OpenMode::Writer | OpenMode::Create).unwrap();
//! db.set(b"hop", b"step").unwrap();
//! assert_eq!(db.get(b"hop").unwrap(), Some(b"step".to_vec()));
//! db.close().unwrap();
//! ```

pub mod cache;
pub mod codec;
pub mod db;
pub mod error;
pub mod file;
pub mod hash;
pub mod lock;
pub mod poly;
pub mod tree;
mod util;

pub use cache::{CacheCursor, CacheDb};
pub use codec::{Compressor, DeflateCodec};
pub use db::{Action, Cursor, Db, Mode, OpenMode, Visitor};
pub use error::{Error, ErrorCode, Result};
pub use hash::{HashCursor, HashDb};
pub use poly::PolyDb;
pub use tree::{Comparator, TreeCursor, TreeDb};
