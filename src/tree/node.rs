// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! B+ tree node types and their record payloads.
//!
//! A leaf is the serialized sequence `prev, next, (ksiz, vsiz, key,
//! value)*`; an inner node is `heir, (child, ksiz, key)*`, all integers in
//! varint form. Each node is one value in the underlying hash database,
//! keyed `"L" + hex(id)` for leaves and `"I" + hex(id - 2^48)` for inner
//! nodes.

use crate::util::{read_varnum, write_varnum};
use parking_lot::RwLock;

/// IDs at or above this base denote inner nodes.
pub(crate) const INNER_ID_BASE: i64 = 1 << 48;

/// In-memory accounting weight of a leaf record beyond its payload.
pub(crate) const REC_WEIGHT: u64 = 12;
/// In-memory accounting weight of an inner link beyond its key.
pub(crate) const LINK_WEIGHT: u64 = 14;
/// Base accounting weight of an empty leaf.
pub(crate) const LEAF_BASE: u64 = 16;
/// Base accounting weight of an empty inner node.
pub(crate) const INNER_BASE: u64 = 8;

pub(crate) fn leaf_key(id: i64) -> Vec<u8> {
    format!("L{:X}", id).into_bytes()
}

pub(crate) fn inner_key(id: i64) -> Vec<u8> {
    format!("I{:X}", id - INNER_ID_BASE).into_bytes()
}

#[derive(Debug, Clone)]
pub(crate) struct TreeRec {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl TreeRec {
    pub fn weight(&self) -> u64 {
        REC_WEIGHT + self.key.len() as u64 + self.value.len() as u64
    }
}

#[derive(Debug)]
pub(crate) struct LeafCore {
    pub recs: Vec<TreeRec>,
    pub size: u64,
    pub prev: i64,
    pub next: i64,
    pub dirty: bool,
    pub dead: bool,
}

#[derive(Debug)]
pub(crate) struct LeafNode {
    pub id: i64,
    pub core: RwLock<LeafCore>,
}

#[derive(Debug, Clone)]
pub(crate) struct Link {
    pub child: i64,
    pub key: Vec<u8>,
}

impl Link {
    pub fn weight(&self) -> u64 {
        LINK_WEIGHT + self.key.len() as u64
    }
}

#[derive(Debug)]
pub(crate) struct InnerCore {
    pub heir: i64,
    pub links: Vec<Link>,
    pub size: u64,
    pub dirty: bool,
    pub dead: bool,
}

#[derive(Debug)]
pub(crate) struct InnerNode {
    pub id: i64,
    pub core: RwLock<InnerCore>,
}

pub(crate) fn serialize_leaf(core: &LeafCore) -> Vec<u8> {
    let mut buf = Vec::with_capacity(core.size as usize + 16);
    write_varnum(&mut buf, core.prev as u64);
    write_varnum(&mut buf, core.next as u64);
    for rec in &core.recs {
        write_varnum(&mut buf, rec.key.len() as u64);
        write_varnum(&mut buf, rec.value.len() as u64);
        buf.extend_from_slice(&rec.key);
        buf.extend_from_slice(&rec.value);
    }
    buf
}

pub(crate) fn deserialize_leaf(mut buf: &[u8]) -> Option<LeafCore> {
    let (prev, step) = read_varnum(buf)?;
    buf = &buf[step..];
    let (next, step) = read_varnum(buf)?;
    buf = &buf[step..];
    let mut core = LeafCore {
        recs: Vec::new(),
        size: LEAF_BASE,
        prev: prev as i64,
        next: next as i64,
        dirty: false,
        dead: false,
    };
    while !buf.is_empty() {
        let (ksiz, step) = read_varnum(buf)?;
        buf = &buf[step..];
        let (vsiz, step) = read_varnum(buf)?;
        buf = &buf[step..];
        if (buf.len() as u64) < ksiz + vsiz {
            return None;
        }
        let key = buf[..ksiz as usize].to_vec();
        buf = &buf[ksiz as usize..];
        let value = buf[..vsiz as usize].to_vec();
        buf = &buf[vsiz as usize..];
        let rec = TreeRec { key, value };
        core.size += rec.weight();
        core.recs.push(rec);
    }
    Some(core)
}

pub(crate) fn serialize_inner(core: &InnerCore) -> Vec<u8> {
    let mut buf = Vec::with_capacity(core.size as usize + 16);
    write_varnum(&mut buf, core.heir as u64);
    for link in &core.links {
        write_varnum(&mut buf, link.child as u64);
        write_varnum(&mut buf, link.key.len() as u64);
        buf.extend_from_slice(&link.key);
    }
    buf
}

pub(crate) fn deserialize_inner(mut buf: &[u8]) -> Option<InnerCore> {
    let (heir, step) = read_varnum(buf)?;
    buf = &buf[step..];
    let mut core = InnerCore {
        heir: heir as i64,
        links: Vec::new(),
        size: INNER_BASE,
        dirty: false,
        dead: false,
    };
    while !buf.is_empty() {
        let (child, step) = read_varnum(buf)?;
        buf = &buf[step..];
        let (ksiz, step) = read_varnum(buf)?;
        buf = &buf[step..];
        if (buf.len() as u64) < ksiz {
            return None;
        }
        let link = Link {
            child: child as i64,
            key: buf[..ksiz as usize].to_vec(),
        };
        buf = &buf[ksiz as usize..];
        core.size += link.weight();
        core.links.push(link);
    }
    Some(core)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_keys() {
        assert_eq!(leaf_key(1), b"L1".to_vec());
        assert_eq!(leaf_key(0x2a), b"L2A".to_vec());
        assert_eq!(inner_key(INNER_ID_BASE + 1), b"I1".to_vec());
    }

    #[test]
    fn leaf_roundtrip() {
        let core = LeafCore {
            recs: vec![
                TreeRec {
                    key: b"alpha".to_vec(),
                    value: b"1".to_vec(),
                },
                TreeRec {
                    key: b"beta".to_vec(),
                    value: vec![0u8; 300],
                },
            ],
            size: 0,
            prev: 3,
            next: 9,
            dirty: true,
            dead: false,
        };
        let buf = serialize_leaf(&core);
        let back = deserialize_leaf(&buf).unwrap();
        assert_eq!(back.prev, 3);
        assert_eq!(back.next, 9);
        assert_eq!(back.recs.len(), 2);
        assert_eq!(back.recs[0].key, b"alpha");
        assert_eq!(back.recs[1].value.len(), 300);
    }

    #[test]
    fn inner_roundtrip() {
        let core = InnerCore {
            heir: 7,
            links: vec![
                Link {
                    child: 8,
                    key: b"m".to_vec(),
                },
                Link {
                    child: INNER_ID_BASE + 2,
                    key: b"t".to_vec(),
                },
            ],
            size: 0,
            dirty: true,
            dead: false,
        };
        let buf = serialize_inner(&core);
        let back = deserialize_inner(&buf).unwrap();
        assert_eq!(back.heir, 7);
        assert_eq!(back.links.len(), 2);
        assert_eq!(back.links[1].child, INNER_ID_BASE + 2);
    }

    #[test]
    fn truncated_leaf_is_rejected() {
        let core = LeafCore {
            recs: vec![TreeRec {
                key: b"k".to_vec(),
                value: b"v".to_vec(),
            }],
            size: 0,
            prev: 0,
            next: 0,
            dirty: false,
            dead: false,
        };
        let buf = serialize_leaf(&core);
        assert!(deserialize_leaf(&buf[..buf.len() - 1]).is_none());
    }
}
