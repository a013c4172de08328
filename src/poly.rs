// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Thin factory selecting a concrete engine by path.
//!
//! `"-"` and `"*"` open an in-memory [`CacheDb`]; a path ending in `.cfh`
//! opens a [`HashDb`]; everything else opens a [`TreeDb`]. Beyond suffix
//! matching the type only delegates, so engine-specific surfaces (tuning,
//! cursors) are reached by using the engine type directly.

use crate::cache::CacheDb;
use crate::db::{Db, Mode, Visitor};
use crate::error::{Error, Result};
use crate::hash::HashDb;
use crate::tree::TreeDb;
use parking_lot::RwLock;
use std::collections::BTreeMap;

enum Engine {
    None,
    Hash(HashDb),
    Tree(TreeDb),
    Cache(CacheDb),
}

/// Polymorphic database dispatching to a concrete engine at open.
pub struct PolyDb {
    eng: RwLock<Engine>,
}

impl Default for PolyDb {
    fn default() -> Self {
        Self::new()
    }
}

macro_rules! delegate {
    ($self:expr, $db:ident => $body:expr) => {
        match &*$self.eng.read() {
            Engine::None => Err(Error::Invalid("not opened")),
            Engine::Hash($db) => $body,
            Engine::Tree($db) => $body,
            Engine::Cache($db) => $body,
        }
    };
}

impl PolyDb {
    pub fn new() -> Self {
        PolyDb {
            eng: RwLock::new(Engine::None),
        }
    }

    fn select(path: &str) -> Engine {
        if path == "-" || path == "*" {
            return Engine::Cache(CacheDb::new());
        }
        match path.rsplit('.').next() {
            Some("cfh") => Engine::Hash(HashDb::new()),
            _ => Engine::Tree(TreeDb::new()),
        }
    }
}

impl Db for PolyDb {
    fn open(&self, path: &str, mode: Mode) -> Result<()> {
        let mut eng = self.eng.write();
        if !matches!(&*eng, Engine::None) {
            return Err(Error::Invalid("already opened"));
        }
        let selected = Self::select(path);
        match &selected {
            Engine::Hash(db) => db.open(path, mode)?,
            Engine::Tree(db) => db.open(path, mode)?,
            Engine::Cache(db) => db.open(path, mode)?,
            Engine::None => unreachable!("select always yields an engine"),
        }
        *eng = selected;
        Ok(())
    }

    fn close(&self) -> Result<()> {
        let mut eng = self.eng.write();
        let res = match &*eng {
            Engine::None => return Err(Error::Invalid("not opened")),
            Engine::Hash(db) => db.close(),
            Engine::Tree(db) => db.close(),
            Engine::Cache(db) => db.close(),
        };
        *eng = Engine::None;
        res
    }

    fn accept(&self, key: &[u8], visitor: &mut dyn Visitor, writable: bool) -> Result<()> {
        delegate!(self, db => db.accept(key, visitor, writable))
    }

    fn iterate(&self, visitor: &mut dyn Visitor, writable: bool) -> Result<()> {
        delegate!(self, db => db.iterate(visitor, writable))
    }

    fn synchronize(&self, hard: bool) -> Result<()> {
        delegate!(self, db => db.synchronize(hard))
    }

    fn begin_transaction(&self, hard: bool) -> Result<()> {
        delegate!(self, db => db.begin_transaction(hard))
    }

    fn begin_transaction_try(&self, hard: bool) -> Result<()> {
        delegate!(self, db => db.begin_transaction_try(hard))
    }

    fn end_transaction(&self, commit: bool) -> Result<()> {
        delegate!(self, db => db.end_transaction(commit))
    }

    fn clear(&self) -> Result<()> {
        delegate!(self, db => db.clear())
    }

    fn count(&self) -> Result<u64> {
        delegate!(self, db => db.count())
    }

    fn size(&self) -> Result<u64> {
        delegate!(self, db => db.size())
    }

    fn path(&self) -> Result<String> {
        delegate!(self, db => db.path())
    }

    fn status(&self) -> Result<BTreeMap<String, String>> {
        delegate!(self, db => db.status())
    }
}
