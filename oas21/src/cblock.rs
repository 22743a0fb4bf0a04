//!
//! # CBLOCK Compression
//!
//! A CBLOCK record wraps a run of ordinary records in a compressed envelope:
//! a comp-type integer (zero, raw DEFLATE, is the only defined value), the
//! uncompressed and compressed byte counts, and the compressed bytes. The
//! wrapper is transparent to record semantics; this module only turns byte
//! runs into DEFLATE payloads and back.
//!

// Std-Lib Imports
use std::io::{Read, Write};

// Crates.io
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;

// Local Imports
use crate::data::{OasError, OasResult};

/// The sole defined comp-type: raw DEFLATE, no zlib or gzip framing
pub const COMP_TYPE_DEFLATE: u64 = 0;

/// Compress `data` with raw DEFLATE at `level` (0 to 9)
pub fn deflate(data: &[u8], level: u8) -> OasResult<Vec<u8>> {
    let level = Compression::new(u32::from(level.min(9)));
    let mut encoder = DeflateEncoder::new(Vec::new(), level);
    encoder.write_all(data)?;
    encoder
        .finish()
        .map_err(|e| OasError::Cblock(format!("deflate failed: {}", e)))
}

/// Decompress a raw-DEFLATE payload, checking the declared uncompressed size
pub fn inflate(data: &[u8], uncomp_count: u64) -> OasResult<Vec<u8>> {
    let expected = usize::try_from(uncomp_count)
        .map_err(|_| OasError::Cblock(format!("uncompressed count {} too large", uncomp_count)))?;
    let mut decoder = DeflateDecoder::new(data);
    // The declared count is untrusted; preallocate only so far
    let mut out = Vec::with_capacity(expected.min(1 << 16));
    decoder
        .read_to_end(&mut out)
        .map_err(|e| OasError::Cblock(format!("inflate failed: {}", e)))?;
    if out.len() != expected {
        return Err(OasError::Cblock(format!(
            "uncompressed count mismatch: declared {}, got {}",
            expected,
            out.len()
        )));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips() {
        let data = b"repeat repeat repeat repeat repeat repeat".to_vec();
        for level in [0u8, 1, 6, 9] {
            let packed = deflate(&data, level).unwrap();
            let unpacked = inflate(&packed, data.len() as u64).unwrap();
            assert_eq!(unpacked, data);
        }
    }
    #[test]
    fn size_mismatch_is_an_error() {
        let packed = deflate(b"some bytes", 6).unwrap();
        assert!(matches!(
            inflate(&packed, 3),
            Err(OasError::Cblock(_))
        ));
    }
    #[test]
    fn garbage_is_an_error() {
        assert!(inflate(&[0xff, 0xff, 0xff, 0xff], 10).is_err());
    }
}
