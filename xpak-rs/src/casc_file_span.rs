use crate::block_table::block_table_entry::BlockTableEntry;
use crate::block_table::block_table_header::BlockTableHeader;
use crate::casc_file_frame::CascFileFrame;
use crate::casc_span_header::CascSpanHeader;
use crate::error::CacheError;
use crate::ext::io_ext::{BytesReadExt, SeekExt};
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};

/// Represents a span in a CASC file, including offsets and file frames.
///
/// A `CascFileSpan` describes a contiguous region of a file within the CASC storage,
/// including its offsets and the frames it contains.
#[derive(Debug)]
pub(crate) struct CascFileSpan<R = File> {
    /// The reader for the span.
    pub(crate) span_reader: R,
    /// The virtual start offset of the span.
    pub(crate) virtual_start_offset: u64,
    /// The virtual end offset of the span.
    pub(crate) virtual_end_offset: u64,
    /// The archive offset of the first frame.
    pub(crate) archive_offset: u64,
    /// The file frames within this span.
    pub(crate) frames: Vec<CascFileFrame>,
}

impl<R: Read + Seek> CascFileSpan<R> {
    /// Parses the span header and BLTE frame table found at `archive_offset`.
    ///
    /// The span's frames start at `virtual_offset` in the logical file.
    pub(crate) fn open(
        mut span_reader: R,
        archive_offset: u64,
        virtual_offset: u64,
    ) -> Result<Self, CacheError> {
        span_reader.seek(SeekFrom::Start(archive_offset))?;
        let (entries, frames_offset) = {
            let mut reader = BufReader::new(&mut span_reader);
            let _ = CascSpanHeader::read(&mut reader)?;
            let header = BlockTableHeader::read(&mut reader)?;
            let entries = (0..header.frame_count)
                .map(|_| BlockTableEntry::read(&mut reader))
                .collect::<Result<Vec<_>, _>>()?;
            let frames_offset = archive_offset
                + CascSpanHeader::SIZE
                + BlockTableHeader::SIZE
                + BlockTableEntry::SIZE * entries.len() as u64;
            (entries, frames_offset)
        };

        let mut frames = Vec::with_capacity(entries.len());
        let mut frame_archive_offset = frames_offset;
        let mut frame_virtual_offset = virtual_offset;
        for entry in entries {
            let frame = CascFileFrame {
                virtual_start_offset: frame_virtual_offset,
                virtual_end_offset: frame_virtual_offset + entry.content_size as u64,
                archive_offset: frame_archive_offset,
                encoded_size: entry.encoded_size,
                content_size: entry.content_size,
            };
            frame_archive_offset += entry.encoded_size as u64;
            frame_virtual_offset = frame.virtual_end_offset;
            frames.push(frame);
        }

        Ok(Self {
            span_reader,
            virtual_start_offset: virtual_offset,
            virtual_end_offset: frame_virtual_offset,
            archive_offset: frames_offset,
            frames,
        })
    }

    pub(crate) fn contains(&self, position: u64) -> bool {
        self.virtual_start_offset <= position && position < self.virtual_end_offset
    }

    /// The frame covering `position`, found by linear scan.
    pub(crate) fn frame_at(&self, position: u64) -> Option<&CascFileFrame> {
        self.frames.iter().find(|frame| frame.contains(position))
    }

    /// Reads and decodes `frame` from this span's archive.
    pub(crate) fn read_frame(&mut self, frame: &CascFileFrame) -> Result<Vec<u8>, CacheError> {
        let archive_length = self.span_reader.stream_length()?;
        let frame_end = frame.archive_offset + u64::from(frame.encoded_size);
        if frame_end > archive_length {
            return Err(CacheError::InvalidData(format!(
                "CASC frame at {:#x} ({:#x} bytes) runs past the archive ({archive_length:#x})",
                frame.archive_offset, frame.encoded_size
            )));
        }
        self.span_reader.seek(SeekFrom::Start(frame.archive_offset))?;
        let encoded = self.span_reader.read_bytes(frame.encoded_size as usize)?;
        frame.decode(&encoded)
    }
}
