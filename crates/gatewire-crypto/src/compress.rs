//! Bounded DEFLATE payload compression.

use std::io::{Read, Write};

use flate2::{Compression, read::DeflateDecoder, write::DeflateEncoder};
use thiserror::Error;

/// Errors from compressing or decompressing a payload.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CompressError {
    /// The DEFLATE backend failed to produce a stream.
    #[error("compression failed")]
    CompressFailed,

    /// Input is not a valid DEFLATE stream.
    #[error("invalid compressed data")]
    InvalidData,

    /// Decompressed output would exceed the caller's limit.
    #[error("decompressed output exceeds {limit} bytes")]
    OutputTooLarge {
        /// Maximum output size the caller allowed.
        limit: usize,
    },
}

/// Compress `data` with DEFLATE at the default level.
///
/// # Errors
///
/// `CompressError::CompressFailed` when the backend fails to write the
/// stream.
pub fn compress(data: &[u8]) -> Result<Vec<u8>, CompressError> {
    let mut encoder =
        DeflateEncoder::new(Vec::with_capacity(data.len() / 2), Compression::default());
    encoder.write_all(data).map_err(|_| CompressError::CompressFailed)?;
    encoder.finish().map_err(|_| CompressError::CompressFailed)
}

/// Decompress a DEFLATE stream, refusing to produce more than `limit`
/// bytes.
///
/// The limit guards against inflation attacks: a hostile peer cannot turn
/// a small datagram into unbounded memory.
///
/// # Errors
///
/// - `CompressError::OutputTooLarge` when the stream inflates past `limit`
/// - `CompressError::InvalidData` on a malformed stream
pub fn decompress(data: &[u8], limit: usize) -> Result<Vec<u8>, CompressError> {
    let mut decoder = DeflateDecoder::new(data).take(limit as u64 + 1);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out).map_err(|_| CompressError::InvalidData)?;

    if out.len() > limit {
        return Err(CompressError::OutputTooLarge { limit });
    }
    Ok(out)
}
