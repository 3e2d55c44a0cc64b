use crate::casc_encoding_key::EncodingKey;
use crate::entry::Entry;
use crate::error::CacheError;
use crate::ext::io_ext::{BytesReadExt, ReadExt, SeekExt};
use crate::path_table_node_flags::PathTableNodeFlags;
use crate::root_handler::TVFS_MAGIC;
use crate::span_info::SpanInfo;
use byteorder::{BigEndian, LittleEndian, ReadBytesExt};
use std::collections::HashMap;
use std::io::{BufReader, Cursor, Read, Seek, SeekFrom};

const PATH_SEPARATOR: char = '/';

/// Represents the header of a TVFS root structure in a CASC archive.
///
/// This header contains metadata about the TVFS tables and their locations.
#[derive(Debug, Clone)]
pub struct TVFSHeader {
    pub signature: u32,
    pub format_version: u8,
    pub header_size: u8,
    pub encoding_key_size: u8,
    pub patch_key_size: u8,
    pub flags: u32,
    pub path_table_offset: u32,
    pub path_table_size: u32,
    pub vfs_table_offset: u32,
    pub vfs_table_size: u32,
    pub cft_table_offset: u32,
    pub cft_table_size: u32,
    pub max_depth: u16,
}

impl TVFSHeader {
    pub fn read<R: Read>(reader: &mut R) -> Result<Self, CacheError> {
        let header = Self {
            signature: reader.read_u32::<LittleEndian>()?,
            format_version: reader.read_u8()?,
            header_size: reader.read_u8()?,
            encoding_key_size: reader.read_u8()?,
            patch_key_size: reader.read_u8()?,
            flags: reader.read_u32::<BigEndian>()?,
            path_table_offset: reader.read_u32::<BigEndian>()?,
            path_table_size: reader.read_u32::<BigEndian>()?,
            vfs_table_offset: reader.read_u32::<BigEndian>()?,
            vfs_table_size: reader.read_u32::<BigEndian>()?,
            cft_table_offset: reader.read_u32::<BigEndian>()?,
            cft_table_size: reader.read_u32::<BigEndian>()?,
            max_depth: reader.read_u16::<BigEndian>()?,
        };
        if header.signature != TVFS_MAGIC {
            return Err(CacheError::MalformedHeader(format!(
                "Invalid TVFS signature {:#X}",
                header.signature
            )));
        }
        if header.format_version != 1 {
            return Err(CacheError::UnsupportedFileType(format!(
                "TVFS format version {}",
                header.format_version
            )));
        }
        if header.encoding_key_size == 0
            || header.encoding_key_size as usize > EncodingKey::MAX_LENGTH
        {
            return Err(CacheError::MalformedHeader(format!(
                "TVFS encoding key size {}",
                header.encoding_key_size
            )));
        }
        Ok(header)
    }

    /// Fails when a table lies outside a blob of `length` bytes.
    fn check_bounds(&self, length: u64) -> Result<(), CacheError> {
        let tables = [
            ("path", self.path_table_offset, self.path_table_size),
            ("vfs", self.vfs_table_offset, self.vfs_table_size),
            ("cft", self.cft_table_offset, self.cft_table_size),
        ];
        for (name, offset, size) in tables {
            if offset as u64 + size as u64 > length {
                return Err(CacheError::MalformedHeader(format!(
                    "TVFS {name} table ({offset:#x} + {size:#x}) exceeds {length:#x} bytes"
                )));
            }
        }
        Ok(())
    }
}

/// Represents a node in the TVFS path table.
///
/// Each node may represent a directory or file path component.
#[derive(Debug, Default, Clone)]
pub struct PathTableNode {
    pub name: String,
    pub flags: PathTableNodeFlags,
    pub value: Option<u32>,
}

/// Handles the TVFS root structure, including path and VFS tables, for a CASC archive.
///
/// Parsing walks the path table once and leaves every file, keyed by its `/`-separated
/// path, in `file_entries`.
#[derive(Debug)]
pub struct TVFSRootHandler {
    path_table_reader: Cursor<Vec<u8>>,
    vfs_table_reader: Cursor<Vec<u8>>,
    cft_table_reader: Cursor<Vec<u8>>,
    pub header: TVFSHeader,
    pub file_entries: HashMap<String, Entry>,
}

impl TVFSRootHandler {
    pub fn new<R: Read + Seek>(stream: &mut R) -> Result<Self, CacheError> {
        let length = stream.stream_length()?;
        stream.seek(SeekFrom::Start(0))?;
        let mut reader = BufReader::new(stream);
        let header = TVFSHeader::read(&mut reader)?;
        header.check_bounds(length)?;

        // Read tables into memory
        reader.seek(SeekFrom::Start(header.path_table_offset as u64))?;
        let path_table_buf = reader.read_bytes(header.path_table_size as usize)?;

        reader.seek(SeekFrom::Start(header.vfs_table_offset as u64))?;
        let vfs_table_buf = reader.read_bytes(header.vfs_table_size as usize)?;

        reader.seek(SeekFrom::Start(header.cft_table_offset as u64))?;
        let cft_table_buf = reader.read_bytes(header.cft_table_size as usize)?;

        let mut handler = TVFSRootHandler {
            path_table_reader: Cursor::new(path_table_buf),
            vfs_table_reader: Cursor::new(vfs_table_buf),
            cft_table_reader: Cursor::new(cft_table_buf),
            header,
            file_entries: HashMap::new(),
        };

        let end = handler.path_table_reader.get_ref().len() as u64;
        handler.parse(end, String::with_capacity(255))?;

        Ok(handler)
    }

    fn parse_path_node(&mut self) -> Result<PathTableNode, CacheError> {
        let mut entry = PathTableNode::default();

        let mut buf = self.path_table_reader.peek_byte()?;

        if buf == 0 {
            entry.flags |= PathTableNodeFlags::PATH_SEPARATOR_PRE;
            self.path_table_reader.skip(1u8)?;
            buf = self.path_table_reader.peek_byte()?;
        }

        match buf {
            1..=0x7E => {
                self.path_table_reader.skip(1u8)?;
                entry.name = self.path_table_reader.read_string(buf as usize)?;
                buf = self.path_table_reader.peek_byte()?;
            }
            0x7F..=0xFE => {
                return Err(CacheError::InvalidData(format!(
                    "TVFS path node name length {buf:#x} at {:#x}",
                    self.path_table_reader.position()
                )));
            }
            _ => {}
        }

        if buf == 0 {
            entry.flags |= PathTableNodeFlags::PATH_SEPARATOR_POST;
            self.path_table_reader.skip(1u8)?;
            buf = self.path_table_reader.peek_byte()?;
        }

        if buf == 0xFF {
            self.path_table_reader.skip(1u8)?;
            entry.value = Some(self.path_table_reader.read_u32::<BigEndian>()?);
            entry.flags |= PathTableNodeFlags::IS_NODE_VALUE;
        } else {
            entry.flags |= PathTableNodeFlags::PATH_SEPARATOR_POST;
        }

        if entry.name.is_empty() && entry.value.is_none() {
            return Err(CacheError::InvalidData(format!(
                "TVFS path node at {:#x} has neither name nor value",
                self.path_table_reader.position()
            )));
        }
        Ok(entry)
    }

    fn add_entry(&mut self, name: &str, vfs_info_pos: u64) -> Result<(), CacheError> {
        if vfs_info_pos >= self.vfs_table_reader.get_ref().len() as u64 {
            return Err(CacheError::InvalidData(format!(
                "VFS offset {vfs_info_pos:#x} for `{name}` outside the VFS table"
            )));
        }
        self.vfs_table_reader.set_position(vfs_info_pos);

        let span_count = self.vfs_table_reader.read_u8()?;
        let mut spans = Vec::with_capacity(span_count as usize);
        for _ in 0..span_count {
            let ref_file_offset = self.vfs_table_reader.read_u32::<BigEndian>()?;
            let content_size = self.vfs_table_reader.read_u32::<BigEndian>()?;
            let cft_offset = Self::read_variable_size_int(
                &mut self.vfs_table_reader,
                self.header.cft_table_size as usize,
            )?;

            self.cft_table_reader.set_position(cft_offset as u64);
            let key = self
                .cft_table_reader
                .read_bytes(self.header.encoding_key_size as usize)?;
            spans.push(SpanInfo {
                encoding_key: EncodingKey::new(&key),
                ref_file_offset,
                content_size,
                cft_offset,
            });
        }

        let name = name.trim_start_matches(PATH_SEPARATOR).to_string();
        self.file_entries
            .insert(name.clone(), Entry::new_with_spans(name, spans));
        Ok(())
    }

    /// Reads a big-endian integer whose width depends on the size of the table it indexes.
    fn read_variable_size_int<R: Read>(reader: &mut R, data_size: usize) -> Result<u32, CacheError> {
        let width = if data_size > 0xFFFFFF {
            4
        } else if data_size > 0xFFFF {
            3
        } else if data_size > 0xFF {
            2
        } else {
            1
        };
        Ok(reader.read_uint_be(width)? as u32)
    }

    fn parse(&mut self, end: u64, mut builder: String) -> Result<(), CacheError> {
        let current_size = builder.len();

        while self.path_table_reader.position() < end {
            let entry = self.parse_path_node()?;

            // Build name with flags
            if entry.flags.contains(PathTableNodeFlags::PATH_SEPARATOR_PRE) {
                builder.push(PATH_SEPARATOR);
            }
            builder.push_str(&entry.name);
            if entry.flags.contains(PathTableNodeFlags::PATH_SEPARATOR_POST) {
                builder.push(PATH_SEPARATOR);
            }

            if let Some(value) = entry.value {
                if value & 0x8000_0000 != 0 {
                    let folder_size = (value & 0x7FFF_FFFF) as u64;
                    let folder_start = self.path_table_reader.position();
                    let folder_end = (folder_start + folder_size)
                        .checked_sub(4)
                        .filter(|e| *e <= end)
                        .ok_or_else(|| {
                            CacheError::InvalidData(format!(
                                "TVFS folder `{builder}` has invalid size {folder_size:#x}"
                            ))
                        })?;
                    self.parse(folder_end, builder.clone())?;
                } else {
                    self.add_entry(&builder, value as u64)?;
                }
                // Reset builder to original
                builder.truncate(current_size);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use byteorder::WriteBytesExt;
    use std::io::Write;

    /// A path table node with a name, an optional post separator and a value.
    fn node(out: &mut Vec<u8>, name: &str, separator: bool, value: u32) {
        out.write_u8(name.len() as u8).unwrap();
        out.write_all(name.as_bytes()).unwrap();
        if separator {
            out.write_u8(0).unwrap();
        }
        out.write_u8(0xFF).unwrap();
        out.write_u32::<BigEndian>(value).unwrap();
    }

    /// Builds a TVFS blob listing `files` (all one level under folder `dir/`),
    /// each with a single span whose CFT row holds the given 9-byte key.
    pub(crate) fn tvfs_blob(dir: &str, files: &[(&str, [u8; 9], u32)]) -> Vec<u8> {
        let key_size = 9usize;
        let mut cft = Vec::new();
        let mut vfs = Vec::new();
        let mut children = Vec::new();
        for (name, key, size) in files {
            let cft_offset = cft.len() as u8;
            cft.extend_from_slice(key);
            cft.extend_from_slice(&[0u8; 4]);
            let vfs_offset = vfs.len() as u32;
            vfs.write_u8(1).unwrap();
            vfs.write_u32::<BigEndian>(0).unwrap();
            vfs.write_u32::<BigEndian>(*size).unwrap();
            vfs.write_u8(cft_offset).unwrap();
            node(&mut children, name, false, vfs_offset);
        }
        let mut path = Vec::new();
        node(&mut path, dir, true, 0x8000_0000 | (children.len() as u32 + 4));
        path.extend(children);
        assemble(key_size as u8, &path, &vfs, &cft)
    }

    pub(crate) fn assemble(key_size: u8, path: &[u8], vfs: &[u8], cft: &[u8]) -> Vec<u8> {
        let header_size = 38u32;
        let path_offset = header_size;
        let vfs_offset = path_offset + path.len() as u32;
        let cft_offset = vfs_offset + vfs.len() as u32;
        let mut out = Vec::new();
        out.write_all(b"TVFS").unwrap();
        out.write_u8(1).unwrap();
        out.write_u8(header_size as u8).unwrap();
        out.write_u8(key_size).unwrap();
        out.write_u8(key_size).unwrap();
        out.write_u32::<BigEndian>(0).unwrap();
        for (offset, size) in [
            (path_offset, path.len()),
            (vfs_offset, vfs.len()),
            (cft_offset, cft.len()),
        ] {
            out.write_u32::<BigEndian>(offset).unwrap();
            out.write_u32::<BigEndian>(size as u32).unwrap();
        }
        out.write_u16::<BigEndian>(3).unwrap();
        out.write_all(path).unwrap();
        out.write_all(vfs).unwrap();
        out.write_all(cft).unwrap();
        out
    }

    #[test]
    fn nested_paths_resolve_to_cft_rows() {
        // a/ -> { b/ -> { c.bin }, d.bin }
        let mut cft = Vec::new();
        cft.extend_from_slice(&[0x11u8; 9]);
        cft.extend_from_slice(&[0x22u8; 9]);

        let mut vfs = Vec::new();
        for (size, cft_offset) in [(100u32, 0u8), (200, 9)] {
            vfs.write_u8(1).unwrap();
            vfs.write_u32::<BigEndian>(0).unwrap();
            vfs.write_u32::<BigEndian>(size).unwrap();
            vfs.write_u8(cft_offset).unwrap();
        }

        let mut b_children = Vec::new();
        node(&mut b_children, "c.bin", false, 0);
        let mut a_children = Vec::new();
        node(&mut a_children, "b", true, 0x8000_0000 | (b_children.len() as u32 + 4));
        a_children.extend(b_children);
        node(&mut a_children, "d.bin", false, 10);
        let mut path = Vec::new();
        node(&mut path, "a", true, 0x8000_0000 | (a_children.len() as u32 + 4));
        path.extend(a_children);

        let blob = assemble(9, &path, &vfs, &cft);
        let handler = TVFSRootHandler::new(&mut Cursor::new(blob)).unwrap();

        let mut names: Vec<_> = handler.file_entries.keys().cloned().collect();
        names.sort();
        assert_eq!(names, vec!["a/b/c.bin", "a/d.bin"]);

        let c = &handler.file_entries["a/b/c.bin"];
        assert_eq!(c.spans.len(), 1);
        assert_eq!(c.spans[0].cft_offset, 0);
        assert_eq!(c.spans[0].encoding_key, EncodingKey::new(&[0x11; 9]));
        assert_eq!(c.content_size(), 100);

        let d = &handler.file_entries["a/d.bin"];
        assert_eq!(d.spans[0].cft_offset, 9);
        assert_eq!(d.spans[0].encoding_key, EncodingKey::new(&[0x22; 9]));
    }

    #[test]
    fn helper_blob_lists_every_file() {
        let blob = tvfs_blob("pkg", &[("one.xpak", [1; 9], 10), ("two.xpak", [2; 9], 20)]);
        let handler = TVFSRootHandler::new(&mut Cursor::new(blob)).unwrap();
        assert_eq!(handler.file_entries.len(), 2);
        assert_eq!(handler.file_entries["pkg/two.xpak"].content_size(), 20);
    }

    #[test]
    fn tables_outside_the_blob_are_rejected() {
        let mut blob = tvfs_blob("pkg", &[("one.xpak", [1; 9], 10)]);
        blob.truncate(blob.len() - 1);
        assert!(matches!(
            TVFSRootHandler::new(&mut Cursor::new(blob)),
            Err(CacheError::MalformedHeader(_))
        ));
    }

    #[test]
    fn malformed_path_nodes_are_rejected() {
        for path in [
            vec![0x80u8, 0, 0, 0, 0],
            vec![0x00, 0x7F, 0, 0, 0],
            vec![0x00, 0x00, 0x00, 0x00],
        ] {
            let blob = assemble(9, &path, &[], &[]);
            assert!(
                matches!(
                    TVFSRootHandler::new(&mut Cursor::new(blob)),
                    Err(CacheError::InvalidData(_))
                ),
                "{path:02x?}"
            );
        }
    }

    #[test]
    fn wrong_signature_is_rejected() {
        let mut blob = tvfs_blob("pkg", &[]);
        blob[0] = b'X';
        assert!(TVFSRootHandler::new(&mut Cursor::new(blob)).is_err());
    }
}
