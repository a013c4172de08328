// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Value compression behind an owned codec handle.
//!
//! Engines that enable `TCOMPRESS` hold an `Arc<dyn Compressor>`; visitors
//! always observe plaintext because the engine wraps record access with
//! compress-on-write / decompress-on-read.

use crate::error::{Error, Result};
use flate2::read::{DeflateDecoder, DeflateEncoder};
use flate2::Compression;
use std::io::Read;

/// Interface of data compression and decompression.
pub trait Compressor: Send + Sync {
    /// Compress a buffer into a fresh vector.
    fn compress(&self, buf: &[u8]) -> Result<Vec<u8>>;
    /// Decompress a buffer into a fresh vector.
    fn decompress(&self, buf: &[u8]) -> Result<Vec<u8>>;
}

/// Raw-deflate codec, the default for compressed databases.
#[derive(Debug, Default)]
pub struct DeflateCodec;

impl Compressor for DeflateCodec {
    fn compress(&self, buf: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(buf.len() / 2 + 16);
        DeflateEncoder::new(buf, Compression::default())
            .read_to_end(&mut out)
            .map_err(|e| Error::System(format!("deflate failed: {e}")))?;
        Ok(out)
    }

    fn decompress(&self, buf: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(buf.len() * 4 + 16);
        DeflateDecoder::new(buf)
            .read_to_end(&mut out)
            .map_err(|e| Error::Broken(format!("inflate failed: {e}")))?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let codec = DeflateCodec;
        let data = b"quick brown fox jumps over the lazy dog".repeat(32);
        let packed = codec.compress(&data).unwrap();
        assert!(packed.len() < data.len());
        assert_eq!(codec.decompress(&packed).unwrap(), data);
    }

    #[test]
    fn empty_input() {
        let codec = DeflateCodec;
        let packed = codec.compress(b"").unwrap();
        assert_eq!(codec.decompress(&packed).unwrap(), b"");
    }

    #[test]
    fn garbage_is_broken() {
        let codec = DeflateCodec;
        let err = codec.decompress(&[0xde, 0xad, 0xbe, 0xef, 0x01]).unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::Broken);
    }
}
