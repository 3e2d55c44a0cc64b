use crate::casc_file_span::CascFileSpan;
use crate::error::CacheError;
use std::{
    fs::File,
    io::{self, Read, Seek, SeekFrom},
};

/// A logical file inside a CASC storage.
///
/// This struct manages reading, seeking, and caching data from multiple file spans,
/// decoding one frame at a time as the read position moves through the file.
/// Typed and string reads come from `byteorder::ReadBytesExt` and the crate's `ReadExt`.
#[derive(Debug)]
pub struct CascFile<R = File> {
    /// The spans that make up the file.
    pub(crate) spans: Vec<CascFileSpan<R>>,
    /// The total size of the file, fixed once.
    internal_size: Option<u64>,
    /// The current read position within the file.
    internal_position: u64,
    /// Decoded bytes of the most recently touched frame (or the whole file after `consume`).
    cache: Vec<u8>,
    /// The virtual position of `cache[0]`.
    cache_start_position: u64,
}

impl<R: Read + Seek> CascFile<R> {
    /// Creates a new `CascFile` from the given spans; its length is the end of the last span.
    pub(crate) fn new(spans: Vec<CascFileSpan<R>>) -> Self {
        let size = spans.last().map_or(0, |span| span.virtual_end_offset);
        let mut file = CascFile {
            spans,
            internal_size: None,
            internal_position: 0,
            cache: Vec::new(),
            cache_start_position: 0,
        };
        file.set_length(size);
        file
    }

    /// Returns the total size of the file.
    pub fn size(&self) -> u64 {
        self.internal_size.unwrap_or(0)
    }

    /// Fixes the length of the file.
    ///
    /// # Panics
    ///
    /// Panics if the length has already been set.
    pub fn set_length(&mut self, length: u64) {
        if self.internal_size.is_some() {
            panic!("CascFile length set twice");
        }
        self.internal_size = Some(length);
    }

    /// Decodes the whole file into the read-ahead cache.
    pub fn consume(&mut self) -> Result<(), CacheError> {
        let mut whole = Vec::new();
        whole
            .try_reserve_exact(self.size() as usize)
            .map_err(|e| CacheError::InvalidData(format!("CASC file of {} bytes: {e}", self.size())))?;
        let mut position = 0;
        while position < self.size() {
            let (start, data) = self.decode_frame_at(position)?;
            whole.extend_from_slice(&data[(position - start) as usize..]);
            position = start + data.len() as u64;
        }
        self.cache = whole;
        self.cache_start_position = 0;
        Ok(())
    }

    fn cache_covers(&self, position: u64) -> bool {
        position >= self.cache_start_position
            && position < self.cache_start_position + self.cache.len() as u64
    }

    /// Finds the span and frame covering `position` and decodes it.
    fn decode_frame_at(&mut self, position: u64) -> Result<(u64, Vec<u8>), CacheError> {
        let span = self
            .spans
            .iter_mut()
            .find(|span| span.contains(position))
            .ok_or_else(|| CacheError::InvalidData(format!("Span not found for {position:#x}")))?;
        let frame = *span
            .frame_at(position)
            .ok_or_else(|| CacheError::InvalidData(format!("Frame not found for {position:#x}")))?;
        let data = span.read_frame(&frame)?;
        if data.is_empty() {
            return Err(CacheError::InvalidData("Empty frame in CASC span".into()));
        }
        Ok((frame.virtual_start_offset, data))
    }
}

impl<R: Read + Seek> Read for CascFile<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let size = self.size();
        let mut consumed = 0;

        while consumed < buf.len() && self.internal_position < size {
            if !self.cache_covers(self.internal_position) {
                let (start, data) = self
                    .decode_frame_at(self.internal_position)
                    .map_err(io::Error::other)?;
                self.cache_start_position = start;
                self.cache = data;
            }
            let p = (self.internal_position - self.cache_start_position) as usize;
            let n = (buf.len() - consumed)
                .min(self.cache.len() - p)
                .min((size - self.internal_position) as usize);
            buf[consumed..consumed + n].copy_from_slice(&self.cache[p..p + n]);
            consumed += n;
            self.internal_position += n as u64;
        }
        Ok(consumed)
    }
}

impl<R> Seek for CascFile<R> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let size = self.internal_size.unwrap_or(0);
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::Current(offset) => self.internal_position.checked_add_signed(offset),
            SeekFrom::End(offset) => size.checked_add_signed(offset),
        };
        self.internal_position = target.ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "Seek before start of file")
        })?;
        Ok(self.internal_position)
    }
}
