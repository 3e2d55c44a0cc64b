//! Single-block decompression shared by every archive reader and the CDN layer.
//!
//! Each archive family tags its blocks differently; the readers translate their tag into a
//! [`Codec`] and hand the block to [`decompress_block`].

mod lzo;

use crate::error::CacheError;
use flate2::read::ZlibDecoder;
use std::io::Read;

/// The largest buffer allocated for a block whose decompressed size is not declared.
pub(crate) const MAX_UNDECLARED_BLOCK_SIZE: usize = 0x2400000;

/// No supported codec expands its input by more than this factor (zlib's limit).
const MAX_EXPANSION_RATIO: usize = 1032;

/// Compression schemes found in package blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    /// Stored bytes.
    Raw,
    /// Raw LZ4 block (no frame header).
    Lz4,
    /// LZO1X stream, used by the oldest package format.
    Lzo1x,
    /// zlib stream.
    Zlib,
    /// Oodle (Kraken/Mermaid). Proprietary, never decodable here.
    Oodle,
}

/// Decompresses a single block.
///
/// `decompressed_size` is the declared output size, or `0` when the format does not record it.
pub fn decompress_block(
    codec: Codec,
    input: &[u8],
    decompressed_size: usize,
) -> Result<Vec<u8>, CacheError> {
    let max_output = input.len().saturating_mul(MAX_EXPANSION_RATIO).saturating_add(64);
    if !matches!(codec, Codec::Raw | Codec::Oodle) && decompressed_size > max_output {
        return Err(CacheError::Decompression(format!(
            "{codec:?} block of {} bytes cannot expand to {decompressed_size} bytes",
            input.len()
        )));
    }
    match codec {
        Codec::Raw => {
            let n = if decompressed_size == 0 {
                input.len()
            } else {
                decompressed_size.min(input.len())
            };
            Ok(input[..n].to_vec())
        }
        Codec::Lz4 => {
            if decompressed_size > 0 {
                return lz4_flex::block::decompress(input, decompressed_size)
                    .map_err(|e| CacheError::Decompression(format!("LZ4: {e}")));
            }
            let capacity = input
                .len()
                .saturating_mul(255)
                .min(MAX_UNDECLARED_BLOCK_SIZE);
            let mut output = vec![0u8; capacity];
            let written = lz4_flex::block::decompress_into(input, &mut output)
                .map_err(|e| CacheError::Decompression(format!("LZ4: {e}")))?;
            output.truncate(written);
            Ok(output)
        }
        Codec::Lzo1x => lzo::decompress(input, decompressed_size),
        Codec::Zlib => {
            let mut decoder = ZlibDecoder::new(input);
            let mut output = Vec::with_capacity(decompressed_size);
            decoder
                .read_to_end(&mut output)
                .map_err(|e| CacheError::Decompression(format!("zlib: {e}")))?;
            if decompressed_size > 0 && output.len() != decompressed_size {
                return Err(CacheError::Decompression(format!(
                    "zlib produced {} bytes, expected {decompressed_size}",
                    output.len()
                )));
            }
            Ok(output)
        }
        // Tag values for Oodle differ per format, report the generic one.
        Codec::Oodle => Err(CacheError::UnsupportedCompression(0x06)),
    }
}
