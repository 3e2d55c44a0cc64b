use crate::error::CacheError;
use byteorder::{BigEndian, LittleEndian, ReadBytesExt};
use std::io::Read;

/// `BLTE` read as a little-endian u32.
pub(crate) const BLTE_SIGNATURE: u32 = 0x45544C42;

/// Block Table Header
/// Represents the header of the BLTE stream that follows every span header.
#[derive(Debug, Clone, Copy)]
pub(crate) struct BlockTableHeader {
    /// The signature identifying the block table.
    pub(crate) signature: u32,
    /// The size of the header in bytes (big-endian on disk).
    pub(crate) header_size: u32,
    /// The format version of the table.
    pub(crate) table_format: u8,
    /// The number of frames in the table (u24 big-endian on disk).
    pub(crate) frame_count: u32,
}

impl BlockTableHeader {
    pub(crate) const SIZE: u64 = 12;

    pub(crate) fn read<R: Read>(reader: &mut R) -> Result<Self, CacheError> {
        let signature = reader.read_u32::<LittleEndian>()?;
        if signature != BLTE_SIGNATURE {
            return Err(CacheError::InvalidData(format!(
                "Invalid Block Table Header signature: {signature:#X}"
            )));
        }
        let header_size = reader.read_u32::<BigEndian>()?;
        if header_size == 0 {
            return Err(CacheError::UnsupportedFileType(
                "BLTE stream without a frame table".into(),
            ));
        }
        let table_format = reader.read_u8()?;
        let frame_count = reader.read_u24::<BigEndian>()?;
        Ok(Self {
            signature,
            header_size,
            table_format,
            frame_count,
        })
    }
}
