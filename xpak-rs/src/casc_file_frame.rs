use crate::block_table::block_table_encoder_type::BlockTableEncoderType;
use crate::compression::decompress_block;
use crate::error::CacheError;

/// Represents a frame within a CASC file, describing a segment of file data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CascFileFrame {
    /// The virtual start offset of the frame within the file.
    pub(crate) virtual_start_offset: u64,
    /// The virtual end offset of the frame within the file (exclusive).
    pub(crate) virtual_end_offset: u64,
    /// The offset of the frame within the archive.
    pub(crate) archive_offset: u64,
    /// The encoded (compressed/encrypted) size of the frame.
    pub(crate) encoded_size: u32,
    /// The decoded (original) content size of the frame.
    pub(crate) content_size: u32,
}

impl CascFileFrame {
    pub(crate) fn contains(&self, position: u64) -> bool {
        self.virtual_start_offset <= position && position < self.virtual_end_offset
    }

    /// Decodes the encoded bytes of this frame (tag byte included).
    pub(crate) fn decode(&self, encoded: &[u8]) -> Result<Vec<u8>, CacheError> {
        let (&tag, payload) = encoded
            .split_first()
            .ok_or_else(|| CacheError::InvalidData("Empty CASC frame".into()))?;
        let encoder = BlockTableEncoderType::from(tag);
        let payload = match encoder {
            // version u8, decompressed size u64, block shift u8
            BlockTableEncoderType::Lz4 => payload.get(10..).ok_or_else(|| {
                CacheError::InvalidData("Truncated LZ4 frame header".into())
            })?,
            _ => payload,
        };
        let decoded = decompress_block(encoder.codec()?, payload, self.content_size as usize)?;
        if decoded.len() != self.content_size as usize {
            return Err(CacheError::InvalidData(format!(
                "Frame decoded to {} bytes, expected {}",
                decoded.len(),
                self.content_size
            )));
        }
        Ok(decoded)
    }
}
