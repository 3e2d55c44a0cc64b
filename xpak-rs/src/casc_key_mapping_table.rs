//! CASC index files (`Data/data/*.idx`), which map truncated encoding keys to a data file,
//! an offset inside it, and the encoded size of the span stored there.

use crate::casc_encoding_key::EncodingKey;
use crate::content_index::{ContentIndex, ContentLocation};
use crate::error::CacheError;
use crate::ext::io_ext::{align_up, BytesReadExt};
use byteorder::{LittleEndian, ReadBytesExt};
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

/// The header of one CASC index file.
#[derive(Debug, Clone, Copy)]
pub(crate) struct CascKeyMappingTable {
    /// The version of the key mapping table format.
    pub(crate) version: u16,
    /// The bucket index used for hashing.
    pub(crate) bucket_index: u8,
    /// An extra byte used for format-specific purposes.
    pub(crate) extra_bytes: u8,
    /// The length in bytes of the encoded size field.
    pub(crate) encoded_size_length: u8,
    /// The length in bytes of the storage offset field.
    pub(crate) storage_offset_length: u8,
    /// The length in bytes of the encoding key.
    pub(crate) encoding_key_length: u8,
    /// The number of bits used for the file offset.
    pub(crate) file_offset_bits: u8,
    /// The maximum size of one data file.
    pub(crate) segment_size: u64,
    /// The number of entries that were read.
    pub(crate) entry_count: usize,
}

impl CascKeyMappingTable {
    /// Parses one index file and inserts its entries into `index`, replacing earlier ones.
    pub(crate) fn load<P: AsRef<Path>>(
        path: P,
        index: &mut ContentIndex<EncodingKey>,
    ) -> Result<Self, CacheError> {
        let mut reader = BufReader::new(File::open(path)?);
        Self::read(&mut reader, index)
    }

    pub(crate) fn read<R: Read + Seek>(
        reader: &mut R,
        index: &mut ContentIndex<EncodingKey>,
    ) -> Result<Self, CacheError> {
        let header_size = reader.read_u32::<LittleEndian>()?;
        let _header_hash = reader.read_u32::<LittleEndian>()?;
        if header_size < 16 {
            return Err(CacheError::MalformedHeader(format!(
                "Key Mapping Table header too small ({header_size})"
            )));
        }

        let mut table = CascKeyMappingTable {
            version: reader.read_u16::<LittleEndian>()?,
            bucket_index: reader.read_u8()?,
            extra_bytes: reader.read_u8()?,
            encoded_size_length: reader.read_u8()?,
            storage_offset_length: reader.read_u8()?,
            encoding_key_length: reader.read_u8()?,
            file_offset_bits: reader.read_u8()?,
            segment_size: reader.read_u64::<LittleEndian>()?,
            entry_count: 0,
        };

        if !(1..=8).contains(&table.encoded_size_length)
            || !(1..=8).contains(&table.storage_offset_length)
            || table.encoding_key_length == 0
            || table.encoding_key_length as usize > EncodingKey::MAX_LENGTH
            || table.file_offset_bits >= 64
        {
            return Err(CacheError::MalformedHeader(format!(
                "Invalid Data Sizes in Key Mapping Table (key {}, offset {}, size {}, bits {})",
                table.encoding_key_length,
                table.storage_offset_length,
                table.encoded_size_length,
                table.file_offset_bits
            )));
        }

        // Align to next 0x10 boundary after adding 0x17
        let pos = reader.stream_position()?;
        reader.seek(SeekFrom::Start(align_up(pos + 0x08, 0x10)))?;

        let table_size = reader.read_u32::<LittleEndian>()? as usize;
        let _table_hash = reader.read_u32::<LittleEndian>()?;

        let entry_size = table.entry_size();
        let mut entry_buffer = vec![0u8; entry_size];
        for _ in 0..table_size / entry_size {
            reader.read_exact(&mut entry_buffer)?;
            let (key, location) = table.decode_entry(&entry_buffer)?;
            index.insert(key, location);
            table.entry_count += 1;
        }

        Ok(table)
    }

    fn entry_size(&self) -> usize {
        (self.encoding_key_length + self.storage_offset_length + self.encoded_size_length) as usize
    }

    fn decode_entry(&self, buffer: &[u8]) -> Result<(EncodingKey, ContentLocation), CacheError> {
        let key_length = self.encoding_key_length as usize;
        let encoding_key = EncodingKey::new(&buffer[..key_length]);

        let mut fields = &buffer[key_length..];
        let packed_offset_and_index = fields.read_uint_be(self.storage_offset_length as usize)?;
        let size = fields.read_uint::<LittleEndian>(self.encoded_size_length as usize)?;

        let offset_mask = (1u64 << self.file_offset_bits) - 1;
        Ok((
            encoding_key,
            ContentLocation {
                archive_segment_index: (packed_offset_and_index >> self.file_offset_bits) as u32,
                offset: packed_offset_and_index & offset_mask,
                compressed_size: size,
                decompressed_size: 0,
            },
        ))
    }
}

/// Orders index files so that, within a bucket, higher versions are applied last and win.
///
/// Names follow `BBVVVVVVVV.idx` (bucket and version in hex); other names go last, by name.
pub(crate) fn sort_index_files(paths: &mut [PathBuf]) {
    paths.sort_by_cached_key(|path| {
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_string();
        let parsed = (stem.len() == 10 && stem.is_ascii())
            .then(|| {
                let bucket = u8::from_str_radix(&stem[..2], 16).ok()?;
                let version = u64::from_str_radix(&stem[2..], 16).ok()?;
                Some((bucket, version))
            })
            .flatten();
        match parsed {
            Some((bucket, version)) => (0u8, bucket, version, stem),
            None => (1u8, 0, 0, stem),
        }
    });
}
