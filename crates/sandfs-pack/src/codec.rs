//! DEFLATE codec for packed payloads.
//!
//! Compression is attempted only for payloads of at least `COMPRESS_MIN`
//! bytes, and the compressed form is kept only when strictly smaller than
//! the original. An entry whose index record carries an original size is
//! compressed by definition; failing to inflate it is a hard error, never
//! an empty or partial result.

use std::io::{self, Read, Write};

use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;

/// Payloads below this size aren't worth the DEFLATE overhead.
pub(crate) const COMPRESS_MIN: usize = 100;

/// Compress `data` if it is large enough and actually shrinks.
pub(crate) fn maybe_compress(data: &[u8]) -> Option<Vec<u8>> {
    if data.len() < COMPRESS_MIN {
        return None;
    }
    let mut encoder = DeflateEncoder::new(Vec::with_capacity(data.len()), Compression::default());
    encoder.write_all(data).ok()?;
    let compressed = encoder.finish().ok()?;
    (compressed.len() < data.len()).then_some(compressed)
}

/// Inflate an entry stored compressed, checking the recorded original size.
pub(crate) fn decompress(data: &[u8], original_size: usize) -> io::Result<Vec<u8>> {
    let mut decoder = DeflateDecoder::new(data);
    let mut out = Vec::with_capacity(original_size);
    decoder.read_to_end(&mut out)?;
    if out.len() != original_size {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("expected {} bytes, inflated to {}", original_size, out.len()),
        ));
    }
    Ok(out)
}
