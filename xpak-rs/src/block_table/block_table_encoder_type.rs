use crate::compression::Codec;
use crate::error::CacheError;

/// Represents the encoding tag that prefixes every frame of a BLTE stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockTableEncoderType {
    /// Plain raw data (`N`).
    Raw,
    /// Zlib compressed data (`Z`).
    ZLib,
    /// LZ4 compressed data (`4`).
    Lz4,
    /// Encrypted data (`E`).
    Encrypted,
    /// Unknown or unsupported type, stores the raw byte value.
    Unknown(u8),
}

impl From<u8> for BlockTableEncoderType {
    fn from(byte: u8) -> Self {
        match byte {
            0x4E => BlockTableEncoderType::Raw,
            0x5A => BlockTableEncoderType::ZLib,
            0x34 => BlockTableEncoderType::Lz4,
            0x45 => BlockTableEncoderType::Encrypted,
            other => BlockTableEncoderType::Unknown(other),
        }
    }
}

impl BlockTableEncoderType {
    /// The codec used to decode a frame with this tag.
    pub(crate) fn codec(self) -> Result<Codec, CacheError> {
        match self {
            BlockTableEncoderType::Raw => Ok(Codec::Raw),
            BlockTableEncoderType::ZLib => Ok(Codec::Zlib),
            BlockTableEncoderType::Lz4 => Ok(Codec::Lz4),
            BlockTableEncoderType::Encrypted => Err(CacheError::UnsupportedCompression(0x45)),
            BlockTableEncoderType::Unknown(tag) => Err(CacheError::UnsupportedCompression(tag)),
        }
    }
}
