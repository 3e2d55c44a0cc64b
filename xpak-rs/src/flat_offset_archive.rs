//! Legacy `.ipak` archives: a linear segment list pointing at an entry table and a data blob.

use crate::compression::{decompress_block, Codec};
use crate::content_index::{ArchiveSegmentTable, ContentIndex, ContentLocation};
use crate::error::CacheError;
use crate::ext::io_ext::{align_up, BytesReadExt};
use crate::game_file_system::GameFileSystem;
use crate::hash_table_archive::{segment_for, PACKAGE_MAGIC};
use byteorder::{LittleEndian, ReadBytesExt};
use std::io::{BufReader, Read, Seek, SeekFrom};
use tracing::debug;

pub(crate) const FILE_PATTERN: &str = "*.ipak";

const SEGMENT_TYPE_ENTRIES: u32 = 1;
const SEGMENT_TYPE_DATA: u32 = 2;
const DATA_HEADER_SIZE: u64 = 128;
const COMMANDS_PER_HEADER: usize = 31;

#[derive(Debug, Clone, Copy, Default)]
struct IpakSegment {
    segment_type: u32,
    offset: u32,
    #[allow(dead_code)]
    size: u32,
    entry_count: u32,
}

impl IpakSegment {
    fn read<R: Read>(reader: &mut R) -> std::io::Result<Self> {
        Ok(IpakSegment {
            segment_type: reader.read_u32::<LittleEndian>()?,
            offset: reader.read_u32::<LittleEndian>()?,
            size: reader.read_u32::<LittleEndian>()?,
            entry_count: reader.read_u32::<LittleEndian>()?,
        })
    }
}

/// Parses one `.ipak` into `objects` and registers it as a segment.
///
/// Returns the number of newly indexed ids. An archive without an entry segment is still
/// registered and indexes nothing.
pub(crate) fn load_package(
    file_system: &GameFileSystem,
    name: &str,
    objects: &mut ContentIndex<u64>,
    segments: &mut ArchiveSegmentTable,
) -> Result<usize, CacheError> {
    debug!("Parsing package {name}");
    let handle = file_system.open_file(name)?;
    let segment_index = segments.next_index();
    let (version, indexed) = {
        let mut reader = BufReader::new(handle.cursor());
        read_entries(&mut reader, segment_index, objects)?
    };
    segments.push(handle, version);
    debug!("Added {name} to cache ({indexed} objects)");
    Ok(indexed)
}

fn read_entries<R: Read + Seek>(
    reader: &mut R,
    segment_index: u32,
    objects: &mut ContentIndex<u64>,
) -> Result<(u16, usize), CacheError> {
    let magic = reader.read_u32::<LittleEndian>()?;
    if magic != PACKAGE_MAGIC {
        return Err(CacheError::MalformedHeader(format!(
            "Bad IPAK magic {magic:#010x}"
        )));
    }
    let version = reader.read_u32::<LittleEndian>()?;
    let _size = reader.read_u32::<LittleEndian>()?;
    let segment_count = reader.read_u32::<LittleEndian>()?;

    let mut entries = IpakSegment::default();
    let mut data = IpakSegment::default();
    for _ in 0..segment_count {
        let segment = IpakSegment::read(reader)?;
        match segment.segment_type {
            SEGMENT_TYPE_ENTRIES => entries = segment,
            SEGMENT_TYPE_DATA => data = segment,
            _ => {}
        }
    }

    let mut indexed = 0;
    if entries.segment_type == SEGMENT_TYPE_ENTRIES {
        reader.seek(SeekFrom::Start(u64::from(entries.offset)))?;
        for _ in 0..entries.entry_count {
            let key = reader.read_u64::<LittleEndian>()?;
            let offset = reader.read_u32::<LittleEndian>()?;
            let size = reader.read_u32::<LittleEndian>()?;
            let location = ContentLocation {
                archive_segment_index: segment_index,
                offset: u64::from(data.offset) + u64::from(offset),
                compressed_size: u64::from(size),
                decompressed_size: 0,
            };
            if objects.insert_if_absent(key, location) {
                indexed += 1;
            }
        }
    }
    Ok((version as u16, indexed))
}

/// Reads and decodes one indexed object.
pub(crate) fn extract_object(
    segments: &ArchiveSegmentTable,
    location: &ContentLocation,
) -> Result<Vec<u8>, CacheError> {
    let handle = segment_for(segments, location)?;
    let mut reader = BufReader::new(handle.cursor());
    reader.seek(SeekFrom::Start(location.offset))?;
    decompress_ipak_object(&mut reader, location.compressed_size)
}

/// Decodes an IPAK object starting at the reader's position: 128-byte block headers followed
/// by up to 31 raw or LZO1X blocks each.
pub fn decompress_ipak_object<R: Read + Seek>(
    reader: &mut R,
    compressed_size: u64,
) -> Result<Vec<u8>, CacheError> {
    let mut output = Vec::new();
    let mut data_read = 0u64;

    while data_read < compressed_size {
        let packed = reader.read_u32::<LittleEndian>()?;
        let count = (packed >> 24) as usize;
        let mut commands = [0u32; COMMANDS_PER_HEADER];
        reader.read_u32_into::<LittleEndian>(&mut commands)?;
        if count > COMMANDS_PER_HEADER {
            return Err(CacheError::InvalidData(format!(
                "IPAK block header declares {count} blocks"
            )));
        }

        for (i, command) in commands[..count].iter().enumerate() {
            let block_size = u64::from(command & 0xFF_FFFF);
            let position = reader.stream_position()?;
            let codec = match command >> 24 {
                0x0 => Some(Codec::Raw),
                0x1 => Some(Codec::Lzo1x),
                _ => None,
            };
            if let Some(codec) = codec {
                let block = reader.read_bytes(block_size as usize)?;
                output.extend(decompress_block(codec, &block, 0)?);
            }

            let next = if i + 1 < count {
                position + block_size
            } else {
                align_up(position + block_size, 0x80)
            };
            data_read += next - position;
            reader.seek(SeekFrom::Start(next))?;
        }

        data_read += DATA_HEADER_SIZE;
    }
    Ok(output)
}
