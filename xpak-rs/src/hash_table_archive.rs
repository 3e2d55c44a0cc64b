//! Content-addressed package archives (`.xpak` / `.xsub`) whose objects are located through a
//! hash table of 64-bit content ids.

use crate::archive_file_handle::ArchiveFileHandle;
use crate::compression::{decompress_block, Codec};
use crate::content_index::{ArchiveSegmentTable, ContentIndex, ContentLocation};
use crate::error::CacheError;
use crate::ext::io_ext::{align_up, BytesReadExt, SeekExt};
use crate::game_file_system::GameFileSystem;
use byteorder::{LittleEndian, ReadBytesExt};
use std::io::{BufReader, Cursor, Read, Seek, SeekFrom};
use tracing::debug;

/// `KAPI`, shared by every package header generation.
pub(crate) const PACKAGE_MAGIC: u32 = 0x4950414B;

/// XPAK version whose header carries 288 extra bytes and whose blocks are padded to 4.
const XPAK_EXTENDED_VERSION: u16 = 0xD;
const XPAK_DATA_HEADER_SIZE: u64 = 128;
const XPAK_COMMANDS_PER_HEADER: usize = 30;

const XSUB_RESERVED_SIZE: u64 = 1896;
/// The package holds its own object data.
const XSUB_TYPE_DATA: u64 = 3;
/// The object data lives in a sibling `<name>data` file.
const XSUB_TYPE_SPLIT_DATA: u64 = 1;
const XSUB_BLOCK_COUNT_OFFSET: u64 = 22;
const XSUB_BLOCK_DESCRIPTOR_SIZE: usize = 21;

const BLOCK_GROUP_ALIGNMENT: u64 = 0x80;
/// The largest object decoded when neither the caller nor the package declares its size.
const MAX_UNDECLARED_OBJECT_SIZE: u64 = 0x4000_0000;

/// The header generations of hash-table packages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HashTableGeneration {
    /// `.xpak`: 64-bit offset and size per record, XPAK block headers.
    Xpak,
    /// `.xsub` with 16-byte records. Only type 3 packages carry data.
    Xsub,
    /// `.xsub` and `.xpak` with 20-byte records; type 1 packages keep data in a sibling file.
    XsubV2,
}

impl HashTableGeneration {
    /// File name patterns enumerated when loading a whole title, in load order.
    pub fn file_patterns(self) -> &'static [&'static str] {
        match self {
            HashTableGeneration::Xpak => &["*.xpak"],
            HashTableGeneration::Xsub => &["*.xsub"],
            HashTableGeneration::XsubV2 => &["*.xsub", "*.xpak"],
        }
    }

    pub(crate) fn record_size(self) -> u64 {
        match self {
            HashTableGeneration::Xpak => 24,
            HashTableGeneration::Xsub => 16,
            HashTableGeneration::XsubV2 => 20,
        }
    }

    /// Reads and validates a package header from the start of `reader`.
    pub(crate) fn read_header<R: Read + Seek>(
        self,
        reader: &mut R,
    ) -> Result<PackageHeader, CacheError> {
        let length = reader.stream_length()?;
        reader.seek(SeekFrom::Start(0))?;
        let header = match self {
            HashTableGeneration::Xpak => PackageHeader::read_xpak(reader)?,
            HashTableGeneration::Xsub | HashTableGeneration::XsubV2 => {
                PackageHeader::read_xsub(reader)?
            }
        };
        if header.magic != PACKAGE_MAGIC {
            return Err(CacheError::MalformedHeader(format!(
                "Bad package magic {:#010x}",
                header.magic
            )));
        }
        let table_end = header
            .hash_count
            .checked_mul(self.record_size())
            .and_then(|size| size.checked_add(header.hash_offset));
        if header.hash_offset >= length || table_end.map_or(true, |end| end > length) {
            return Err(CacheError::MalformedHeader(format!(
                "Hash table ({} records at {:#x}) outside package of {length:#x} bytes",
                header.hash_count, header.hash_offset
            )));
        }
        Ok(header)
    }

    /// Reads every hash record of a package whose header has been validated.
    pub(crate) fn read_records<R: Read + Seek>(
        self,
        reader: &mut R,
        header: &PackageHeader,
    ) -> Result<Vec<HashRecord>, CacheError> {
        reader.seek(SeekFrom::Start(header.hash_offset))?;
        let table = reader.read_bytes((header.hash_count * self.record_size()) as usize)?;
        let mut table = Cursor::new(table);

        let mut records = Vec::with_capacity(header.hash_count as usize);
        for _ in 0..header.hash_count {
            let key = table.read_u64::<LittleEndian>()?;
            let record = match self {
                HashTableGeneration::Xpak => {
                    let offset = table.read_u64::<LittleEndian>()?;
                    let size = table.read_u64::<LittleEndian>()?;
                    HashRecord {
                        key,
                        offset: header.data_offset + offset,
                        size: size & 0x00FF_FFFF_FFFF_FFFF,
                        flags: size >> 56,
                    }
                }
                HashTableGeneration::Xsub | HashTableGeneration::XsubV2 => {
                    let packed = table.read_u64::<LittleEndian>()?;
                    if self == HashTableGeneration::XsubV2 {
                        table.skip(4u64)?;
                    }
                    HashRecord::unpack(key, packed)
                }
            };
            records.push(record);
        }
        Ok(records)
    }
}

/// The fields of a package header this crate consumes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct PackageHeader {
    pub(crate) magic: u32,
    pub(crate) version: u16,
    /// Package type (XSUB generations only).
    pub(crate) archive_type: u64,
    pub(crate) data_offset: u64,
    pub(crate) hash_count: u64,
    pub(crate) hash_offset: u64,
    pub(crate) index_count: u64,
    pub(crate) index_offset: u64,
}

impl PackageHeader {
    fn read_xpak<R: Read + Seek>(reader: &mut R) -> Result<Self, CacheError> {
        let magic = reader.read_u32::<LittleEndian>()?;
        reader.skip(2u64)?;
        let version = reader.read_u16::<LittleEndian>()?;
        reader.skip(16u64)?;
        if version == XPAK_EXTENDED_VERSION {
            reader.skip(288u64)?;
        }
        let mut header = Self::read_tables(reader)?;
        header.magic = magic;
        header.version = version;
        Ok(header)
    }

    fn read_xsub<R: Read + Seek>(reader: &mut R) -> Result<Self, CacheError> {
        let magic = reader.read_u32::<LittleEndian>()?;
        reader.skip(2u64)?;
        let version = reader.read_u16::<LittleEndian>()?;
        reader.skip(8u64)?;
        let archive_type = reader.read_u64::<LittleEndian>()?;
        reader.skip(8u64 + XSUB_RESERVED_SIZE)?;
        let mut header = Self::read_tables(reader)?;
        header.magic = magic;
        header.version = version;
        header.archive_type = archive_type;
        Ok(header)
    }

    /// Reads the twelve table fields shared by both header layouts.
    fn read_tables<R: Read>(reader: &mut R) -> Result<Self, CacheError> {
        let mut fields = [0u64; 12];
        reader.read_u64_into::<LittleEndian>(&mut fields)?;
        Ok(PackageHeader {
            data_offset: fields[1],
            hash_count: fields[3],
            hash_offset: fields[4],
            index_count: fields[9],
            index_offset: fields[10],
            ..Default::default()
        })
    }
}

/// One decoded hash-table record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct HashRecord {
    pub(crate) key: u64,
    pub(crate) offset: u64,
    pub(crate) size: u64,
    pub(crate) flags: u64,
}

impl HashRecord {
    /// Decodes an XSUB packed info field: bit 0 flag, bits 1..30 size, high dword offset >> 7.
    pub(crate) fn unpack(key: u64, packed: u64) -> Self {
        HashRecord {
            key,
            offset: (packed >> 32) << 7,
            size: (packed >> 1) & 0x3FFF_FFFF,
            flags: packed & 1,
        }
    }
}

/// What loading one package produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PackageLoad {
    /// The package was registered as a segment and this many new ids were indexed.
    Indexed(usize),
    /// The package holds no object data (metadata or reference packages).
    NoData,
}

/// Parses one package from `file_system` into `objects`, registering its data segment.
pub(crate) fn load_package(
    file_system: &GameFileSystem,
    name: &str,
    generation: HashTableGeneration,
    objects: &mut ContentIndex<u64>,
    segments: &mut ArchiveSegmentTable,
) -> Result<PackageLoad, CacheError> {
    debug!("Parsing package {name}");
    let handle = file_system.open_file(name)?;
    let (header, records) = {
        let mut reader = BufReader::new(handle.cursor());
        let header = generation.read_header(&mut reader)?;
        if generation != HashTableGeneration::Xpak
            && header.archive_type != XSUB_TYPE_DATA
            && !(generation == HashTableGeneration::XsubV2
                && header.archive_type == XSUB_TYPE_SPLIT_DATA)
        {
            debug!("Package {name} is type {}, no data", header.archive_type);
            return Ok(PackageLoad::NoData);
        }
        let records = generation.read_records(&mut reader, &header)?;
        (header, records)
    };

    let data_segment = if header.archive_type == XSUB_TYPE_SPLIT_DATA
        && generation == HashTableGeneration::XsubV2
    {
        file_system.open_file(&format!("{name}data"))?
    } else {
        handle
    };
    let segment_index = segments.next_index();

    let mut indexed = 0;
    for record in &records {
        let location = ContentLocation {
            archive_segment_index: segment_index,
            offset: record.offset,
            compressed_size: record.size,
            decompressed_size: 0,
        };
        if objects.insert_if_absent(record.key, location) {
            indexed += 1;
        }
    }

    if generation == HashTableGeneration::Xpak
        && header.version == XPAK_EXTENDED_VERSION
        && header.index_count > 0
    {
        let mut reader = BufReader::new(data_segment.cursor());
        read_xpak_properties(&mut reader, &header, segment_index, objects)?;
    }

    segments.push(data_segment, header.version);
    debug!("Added {name} to cache ({indexed} objects)");
    Ok(PackageLoad::Indexed(indexed))
}

/// Reads the property table of an extended XPAK and records `size0` as the decompressed size.
fn read_xpak_properties<R: Read + Seek>(
    reader: &mut R,
    header: &PackageHeader,
    segment_index: u32,
    objects: &mut ContentIndex<u64>,
) -> Result<(), CacheError> {
    reader.seek(SeekFrom::Start(header.index_offset))?;
    for _ in 0..header.index_count {
        let key = reader.read_u64::<LittleEndian>()?;
        let properties_length = reader.read_u64::<LittleEndian>()?;
        let location = objects
            .get_mut(&key)
            .filter(|location| location.archive_segment_index == segment_index);
        let Some(location) = location else {
            reader.skip(properties_length)?;
            continue;
        };
        let properties = reader.read_bytes(properties_length as usize)?;
        let properties = String::from_utf8_lossy(&properties);
        for line in properties.split('\n') {
            if let Some(("size0", value)) = line.split_once(':') {
                if let Some(size) = parse_integer(value.trim()) {
                    location.decompressed_size = size;
                }
            }
        }
    }
    Ok(())
}

/// Parses a decimal or `0x`-prefixed hexadecimal integer.
fn parse_integer(text: &str) -> Option<u64> {
    match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => text.parse().ok(),
    }
}

/// Reads and decodes one indexed object.
pub(crate) fn extract_object(
    generation: HashTableGeneration,
    segments: &ArchiveSegmentTable,
    id: u64,
    location: &ContentLocation,
    expected_size: u64,
) -> Result<Vec<u8>, CacheError> {
    let handle = segment_for(segments, location)?;
    let version = segments
        .format_version(location.archive_segment_index)
        .unwrap_or_default();
    let size_hint = if expected_size > 0 {
        expected_size
    } else {
        location.decompressed_size
    };

    let mut reader = BufReader::new(handle.cursor());
    reader.seek(SeekFrom::Start(location.offset))?;
    match generation {
        HashTableGeneration::Xpak => {
            decompress_xpak_object(&mut reader, location.compressed_size, size_hint, version)
        }
        HashTableGeneration::Xsub | HashTableGeneration::XsubV2 => {
            decompress_xsub_object(&mut reader, id, location.compressed_size, size_hint)
        }
    }
}

/// The stored bytes of an indexed object, without decoding.
pub(crate) fn extract_object_raw(
    segments: &ArchiveSegmentTable,
    location: &ContentLocation,
) -> Result<Vec<u8>, CacheError> {
    segment_for(segments, location)?.read_at(location.offset, location.compressed_size as usize)
}

pub(crate) fn segment_for<'a>(
    segments: &'a ArchiveSegmentTable,
    location: &ContentLocation,
) -> Result<&'a ArchiveFileHandle, CacheError> {
    segments.get(location.archive_segment_index).ok_or_else(|| {
        CacheError::InvalidData(format!(
            "No archive segment {}",
            location.archive_segment_index
        ))
    })
}

/// Decodes an XPAK object starting at the reader's position.
///
/// The object is a run of 128-byte block headers, each followed by up to thirty blocks.
/// `compressed_size` counts headers, blocks and padding. `decompressed_size` is only a
/// capacity hint and may be zero.
pub fn decompress_xpak_object<R: Read + Seek>(
    reader: &mut R,
    compressed_size: u64,
    decompressed_size: u64,
    format_version: u16,
) -> Result<Vec<u8>, CacheError> {
    let mut output = Vec::with_capacity(decompressed_size as usize);
    let mut data_read = 0u64;

    while data_read < compressed_size {
        let count = reader.read_u32::<LittleEndian>()? as usize;
        let _offset = reader.read_u32::<LittleEndian>()?;
        let mut commands = [0u32; XPAK_COMMANDS_PER_HEADER];
        reader.read_u32_into::<LittleEndian>(&mut commands)?;
        if count > XPAK_COMMANDS_PER_HEADER {
            return Err(CacheError::InvalidData(format!(
                "XPAK block header declares {count} blocks"
            )));
        }

        for (i, command) in commands[..count].iter().enumerate() {
            let mut block_size = u64::from(command & 0xFF_FFFF);
            let flag = (command >> 24) as u8;
            let position = reader.stream_position()?;

            let codec = match flag {
                0x0 => Some(Codec::Raw),
                0x3 => Some(Codec::Lz4),
                0x6 | 0x8 | 0x9 => Some(Codec::Oodle),
                _ => None,
            };
            if let Some(codec) = codec {
                let block = reader.read_bytes(block_size as usize)?;
                output.extend(decompress_block(codec, &block, 0)?);
            }

            if format_version == XPAK_EXTENDED_VERSION {
                block_size = align_up(block_size, 4);
            }
            let next = if i + 1 < count {
                position + block_size
            } else {
                align_up(position + block_size, BLOCK_GROUP_ALIGNMENT)
            };
            data_read += next - position;
            reader.seek(SeekFrom::Start(next))?;
        }

        data_read += XPAK_DATA_HEADER_SIZE;
    }
    Ok(output)
}

/// One entry of an XSUB block group.
#[derive(Debug, Clone, Copy)]
struct XsubBlock {
    compression: u8,
    compressed_size: u32,
    decompressed_size: u32,
    block_offset: u32,
    decompressed_offset: u32,
}

impl XsubBlock {
    fn read<R: Read>(reader: &mut R) -> std::io::Result<Self> {
        let block = XsubBlock {
            compression: reader.read_u8()?,
            compressed_size: reader.read_u32::<LittleEndian>()?,
            decompressed_size: reader.read_u32::<LittleEndian>()?,
            block_offset: reader.read_u32::<LittleEndian>()?,
            decompressed_offset: reader.read_u32::<LittleEndian>()?,
        };
        let _reserved = reader.read_u32::<LittleEndian>()?;
        Ok(block)
    }

    fn codec(&self) -> Option<Codec> {
        match self.compression {
            0x0 => Some(Codec::Raw),
            0x3 => Some(Codec::Lz4),
            0x6 => Some(Codec::Oodle),
            _ => None,
        }
    }
}

/// Decodes an XSUB object starting at the reader's position.
///
/// Objects that do not repeat their id at offset 2 are stored raw and returned as is.
pub fn decompress_xsub_object<R: Read + Seek>(
    reader: &mut R,
    id: u64,
    compressed_size: u64,
    decompressed_size: u64,
) -> Result<Vec<u8>, CacheError> {
    let start = reader.stream_position()?;
    let length = reader.stream_length()?;
    let end = start
        .checked_add(compressed_size)
        .filter(|&end| end <= length)
        .ok_or_else(|| {
            CacheError::InvalidData(format!(
                "XSUB object {id:#018x} of {compressed_size:#x} bytes at {start:#x} overruns its archive"
            ))
        })?;
    let output_limit = if decompressed_size > 0 {
        decompressed_size
    } else {
        MAX_UNDECLARED_OBJECT_SIZE
    };

    let echoed_id = if compressed_size >= 10 {
        reader.seek(SeekFrom::Start(start + 2))?;
        Some(reader.read_u64::<LittleEndian>()?)
    } else {
        None
    };
    if echoed_id != Some(id) {
        reader.seek(SeekFrom::Start(start))?;
        return Ok(reader.read_bytes(compressed_size as usize)?);
    }

    let mut output = Vec::with_capacity(decompressed_size.min(output_limit) as usize);
    let mut group = start;
    while group < end {
        reader.seek(SeekFrom::Start(group + XSUB_BLOCK_COUNT_OFFSET))?;
        let count = reader.read_u8()? as usize;
        let descriptors = reader.read_bytes(count * XSUB_BLOCK_DESCRIPTOR_SIZE)?;
        let mut descriptors = Cursor::new(descriptors);
        let mut position = reader.stream_position()?;

        for _ in 0..count {
            let block = XsubBlock::read(&mut descriptors)?;
            let block_start = group + u64::from(block.block_offset);
            position = block_start + u64::from(block.compressed_size);
            if position > end {
                return Err(CacheError::InvalidData(format!(
                    "XSUB block of {id:#018x} at {block_start:#x} runs past the object"
                )));
            }
            let Some(codec) = block.codec() else {
                continue;
            };
            reader.seek(SeekFrom::Start(block_start))?;
            let data = reader.read_bytes(block.compressed_size as usize)?;
            let decoded = decompress_block(codec, &data, block.decompressed_size as usize)?;

            let at = block.decompressed_offset as usize;
            let block_end = at + decoded.len();
            if block_end as u64 > output_limit {
                return Err(CacheError::InvalidData(format!(
                    "XSUB block of {id:#018x} ends at {block_end:#x}, past {output_limit:#x}"
                )));
            }
            if output.len() < block_end {
                output.resize(block_end, 0);
            }
            output[at..block_end].copy_from_slice(&decoded);
        }

        let next = align_up(position, BLOCK_GROUP_ALIGNMENT);
        if next <= group {
            return Err(CacheError::InvalidData(format!(
                "XSUB block group of {id:#018x} at {group:#x} is empty"
            )));
        }
        group = next;
    }
    Ok(output)
}
