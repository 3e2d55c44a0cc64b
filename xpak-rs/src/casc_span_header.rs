use byteorder::{LittleEndian, ReadBytesExt};
use std::io::{self, Read};

/// The 30-byte record that precedes each BLTE stream in a `data.NNN` file.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct CascSpanHeader {
    /// The encoding key of the span, stored byte-reversed.
    pub(crate) encoding_key: [u8; 16],
    /// The size of the span in bytes, header included.
    pub(crate) content_size: u32,
    pub(crate) flags: u16,
    pub(crate) jenkins_hash: u32,
    pub(crate) checksum: u32,
}

impl CascSpanHeader {
    pub(crate) const SIZE: u64 = 30;

    pub(crate) fn read<R: Read>(reader: &mut R) -> io::Result<Self> {
        let mut encoding_key = [0u8; 16];
        reader.read_exact(&mut encoding_key)?;
        Ok(Self {
            encoding_key,
            content_size: reader.read_u32::<LittleEndian>()?,
            flags: reader.read_u16::<LittleEndian>()?,
            jenkins_hash: reader.read_u32::<LittleEndian>()?,
            checksum: reader.read_u32::<LittleEndian>()?,
        })
    }
}
