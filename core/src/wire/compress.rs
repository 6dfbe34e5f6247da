//! DEFLATE compression wrapper for packet payloads
//!
//! Raw DEFLATE stream (no zlib/gzip header). The original size travels
//! separately in the frame, so decompression can be bounded by it.

use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use std::io::{Read, Write};

use super::WireError;

/// Payloads shorter than this are never compressed
pub const COMPRESSION_THRESHOLD: usize = 100;

/// Bytes sampled by the diversity heuristic
const SAMPLE_SIZE: usize = 256;

/// Distinct/sampled ratio at or above which data is treated as incompressible
const MAX_DIVERSITY: f64 = 0.9;

/// Cheap compressibility check: enough bytes, and the first 256 of them are
/// not mostly distinct values (already-compressed or encrypted data is).
pub fn should_compress(data: &[u8]) -> bool {
    if data.len() < COMPRESSION_THRESHOLD {
        return false;
    }

    let sample = &data[..data.len().min(SAMPLE_SIZE)];
    let mut seen = [false; 256];
    let mut distinct = 0usize;
    for &b in sample {
        if !seen[b as usize] {
            seen[b as usize] = true;
            distinct += 1;
        }
    }

    (distinct as f64 / sample.len() as f64) < MAX_DIVERSITY
}

/// Compress `data`. Returns `None` when compression fails or does not
/// shrink the input; the caller then sends the payload as-is.
pub fn compress(data: &[u8]) -> Option<Vec<u8>> {
    if data.len() < COMPRESSION_THRESHOLD {
        return None;
    }

    let mut encoder = DeflateEncoder::new(Vec::with_capacity(data.len() / 2), Compression::fast());
    encoder.write_all(data).ok()?;
    let compressed = encoder.finish().ok()?;

    if compressed.is_empty() || compressed.len() >= data.len() {
        return None;
    }
    Some(compressed)
}

/// Inflate `data`, which must expand to exactly `original_size` bytes.
///
/// Output is capped one byte past the declared size, so a stream that would
/// inflate further is rejected without being fully expanded.
pub fn decompress(data: &[u8], original_size: usize) -> Result<Vec<u8>, WireError> {
    let mut out = Vec::with_capacity(original_size);
    DeflateDecoder::new(data)
        .take(original_size as u64 + 1)
        .read_to_end(&mut out)
        .map_err(|e| WireError::DecompressionFailed(e.to_string()))?;

    if out.len() != original_size {
        return Err(WireError::SizeMismatch {
            expected: original_size,
            actual: out.len(),
        });
    }
    Ok(out)
}
