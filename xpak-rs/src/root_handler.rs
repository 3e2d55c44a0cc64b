use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom};

use byteorder::{LittleEndian, ReadBytesExt};

use crate::{entry::Entry, error::CacheError, tvfs_root_handler::TVFSRootHandler};

/// `TVFS` read as a little-endian u32.
pub(crate) const TVFS_MAGIC: u32 = 0x53465654;

/// The root file formats a storage can use to name its files.
#[derive(Debug)]
pub enum RootHandler {
    Tvfs(TVFSRootHandler),
    // MNDX, Diablo3, WoW, Overwatch and Starcraft1 roots are not read.
}

impl RootHandler {
    /// Detects the root format from its magic and parses it.
    pub fn read<R: Read + Seek>(stream: &mut R) -> Result<Self, CacheError> {
        stream.seek(SeekFrom::Start(0))?;
        let header_magic = stream.read_u32::<LittleEndian>()?;
        stream.seek(SeekFrom::Start(0))?;
        match header_magic {
            TVFS_MAGIC => Ok(RootHandler::Tvfs(TVFSRootHandler::new(stream)?)),
            _ => Err(CacheError::UnsupportedFileType(format!(
                "Root file with header {header_magic:#X}"
            ))),
        }
    }

    pub fn file_entries(&self) -> &HashMap<String, Entry> {
        match self {
            RootHandler::Tvfs(handler) => &handler.file_entries,
        }
    }
}
