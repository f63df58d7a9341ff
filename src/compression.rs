//! Payload compression
//!
//! Payloads are stored zlib-framed so entries written by other clients of the
//! same servers (which compress with zlib as well) remain readable.

use std::io::{Read, Write};

use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;

use crate::CacheError;

/// Compresses payloads before they reach the store.
pub trait Compressor: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CacheError>;

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CacheError>;
}

/// zlib compression via flate2
#[derive(Debug, Clone, Copy)]
pub struct ZlibCompressor {
    level: Compression,
}

impl ZlibCompressor {
    /// `level` is clamped to 0..=9.
    pub fn new(level: u32) -> Self {
        Self {
            level: Compression::new(level.min(9)),
        }
    }
}

impl Default for ZlibCompressor {
    fn default() -> Self {
        Self {
            level: Compression::default(),
        }
    }
}

impl Compressor for ZlibCompressor {
    fn name(&self) -> &'static str {
        "zlib"
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CacheError> {
        let mut encoder = ZlibEncoder::new(Vec::with_capacity(data.len() / 2 + 16), self.level);
        encoder.write_all(data)?;
        Ok(encoder.finish()?)
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CacheError> {
        let mut decoder = ZlibDecoder::new(data);
        let mut out = Vec::with_capacity(data.len() * 2);
        decoder.read_to_end(&mut out)?;
        Ok(out)
    }
}

/// Stores payloads as-is
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCompression;

impl Compressor for NoCompression {
    fn name(&self) -> &'static str {
        "none"
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CacheError> {
        Ok(data.to_vec())
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CacheError> {
        Ok(data.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zlib_shrinks_repetitive_payloads() {
        let compressor = ZlibCompressor::new(9);
        let payload = "{\"name\":\"a\"}".repeat(200);

        let compressed = compressor.compress(payload.as_bytes()).unwrap();
        assert!(compressed.len() < payload.len() / 4);
        // zlib header
        assert_eq!(compressed[0], 0x78);

        assert_eq!(
            compressor.decompress(&compressed).unwrap(),
            payload.as_bytes()
        );
    }

    #[test]
    fn test_zlib_empty_payload() {
        let compressor = ZlibCompressor::default();
        let compressed = compressor.compress(b"").unwrap();
        assert!(!compressed.is_empty());
        assert!(compressor.decompress(&compressed).unwrap().is_empty());
    }

    #[test]
    fn test_zlib_rejects_garbage() {
        let compressor = ZlibCompressor::default();
        assert!(matches!(
            compressor.decompress(b"definitely not zlib"),
            Err(CacheError::Compression(_))
        ));
    }

    #[test]
    fn test_level_is_clamped() {
        let compressor = ZlibCompressor::new(42);
        assert_eq!(compressor.level.level(), 9);
    }
}
