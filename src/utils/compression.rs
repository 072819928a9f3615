use crate::config::MAX_PAYLOAD_SIZE;
use crate::error::{ProtocolError, Result};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::io::{Read, Write};

/// First byte of a zlib stream (deflate, 32K window)
pub const ZLIB_MARKER: u8 = 0x78;

/// Default maximum output size for decompression (align with MAX_PAYLOAD_SIZE to prevent DoS)
pub const MAX_DECOMPRESSION_SIZE: usize = MAX_PAYLOAD_SIZE;

/// Minimum entropy threshold for compression (0.0-8.0 bits per byte)
/// Data below this threshold is unlikely to compress well
const MIN_ENTROPY_THRESHOLD: f64 = 4.0;

/// Returns true when the payload starts with the zlib header byte.
///
/// An uncompressed marshal stream always starts with `0x7E`, so the two never collide.
pub fn is_compressed(data: &[u8]) -> bool {
    data.first() == Some(&ZLIB_MARKER)
}

/// Calculate Shannon entropy of data (bits per byte)
/// Returns a value between 0.0 (all identical) and 8.0 (perfectly random)
fn calculate_entropy(data: &[u8]) -> f64 {
    if data.is_empty() {
        return 0.0;
    }

    let mut freq = [0u32; 256];
    for &byte in data {
        freq[byte as usize] += 1;
    }

    let len = data.len() as f64;
    let mut entropy = 0.0;

    for &count in &freq {
        if count > 0 {
            let p = count as f64 / len;
            entropy -= p * p.log2();
        }
    }

    entropy
}

/// Size and entropy check for outgoing payloads
fn should_compress(data: &[u8], threshold_bytes: usize) -> bool {
    if data.len() < threshold_bytes {
        return false;
    }

    if data.len() < 1024 {
        return true;
    }

    // sample the head only; marshal streams are homogeneous enough
    let sample_size = data.len().min(512);
    calculate_entropy(&data[..sample_size]) < MIN_ENTROPY_THRESHOLD
}

/// Compresses data into a zlib stream
///
/// # Errors
/// Returns `ProtocolError::CompressionFailure` if the encoder fails
pub fn compress(data: &[u8], level: u32) -> Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(
        Vec::with_capacity(data.len() / 2 + 16),
        Compression::new(level.min(9)),
    );
    encoder
        .write_all(data)
        .map_err(|_| ProtocolError::CompressionFailure)?;
    encoder.finish().map_err(|_| ProtocolError::CompressionFailure)
}

/// Inflates a zlib stream, refusing to produce more than `max_output` bytes.
///
/// # Errors
/// Returns `ProtocolError::DecompressionFailure` if:
/// - the stream is malformed or truncated
/// - output size exceeds `max_output`
pub fn decompress(data: &[u8], max_output: usize) -> Result<Vec<u8>> {
    let mut reader = ZlibDecoder::new(data);
    let mut out = Vec::with_capacity(data.len().saturating_mul(2).min(max_output));

    // Read in chunks to enforce size limit
    let mut buffer = [0u8; 8192];
    loop {
        match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => {
                out.extend_from_slice(&buffer[..n]);
                if out.len() > max_output {
                    return Err(ProtocolError::DecompressionFailure);
                }
            }
            Err(_) => return Err(ProtocolError::DecompressionFailure),
        }
    }
    Ok(out)
}

/// Compress data if it meets the threshold and actually shrinks, otherwise return it unchanged.
/// Returns the output bytes and a flag indicating whether compression was applied.
pub fn maybe_compress(data: &[u8], level: u32, threshold_bytes: usize) -> Result<(Vec<u8>, bool)> {
    if should_compress(data, threshold_bytes) {
        let compressed = compress(data, level)?;
        if compressed.len() < data.len() {
            return Ok((compressed, true));
        }
    }
    Ok((data.to_vec(), false))
}

/// Inflate the payload if it carries the zlib marker; otherwise return as-is.
pub fn maybe_decompress(data: &[u8], max_output: usize) -> Result<Vec<u8>> {
    if is_compressed(data) {
        decompress(data, max_output)
    } else {
        Ok(data.to_vec())
    }
}
