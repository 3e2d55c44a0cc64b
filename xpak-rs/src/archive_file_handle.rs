use crate::error::CacheError;
use crate::ext::io_ext::SeekExt;
use parking_lot::RwLock;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;

/// A seekable source that can be moved between threads.
pub trait ReadSeek: Read + Seek + Send + Sync {}

impl<T> ReadSeek for T where T: Read + Seek + Send + Sync {}

enum Backing {
    /// Local file read with positioned reads, so concurrent readers only take a shared guard.
    Positioned(RwLock<File>),
    /// Seek-then-read source; every read holds the guard exclusively.
    Stateful(RwLock<Box<dyn ReadSeek>>),
}

/// An open archive segment shared by every extraction thread.
///
/// A handle never exposes its cursor: each read names its own offset, and the seek+read pair
/// runs under the handle's lock. Use [`ArchiveFileHandle::cursor`] when a parser wants
/// `Read + Seek`.
pub struct ArchiveFileHandle {
    path: String,
    size: u64,
    backing: Backing,
}

impl std::fmt::Debug for ArchiveFileHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.backing {
            Backing::Positioned(_) => "positioned",
            Backing::Stateful(_) => "stateful",
        };
        f.debug_struct("ArchiveFileHandle")
            .field("path", &self.path)
            .field("size", &self.size)
            .field("backing", &kind)
            .finish()
    }
}

impl ArchiveFileHandle {
    /// Opens a local file for positioned reads.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, CacheError> {
        let path = path.as_ref();
        let file = File::open(path)?;
        let size = file.metadata()?.len();
        Ok(Self {
            path: path.display().to_string(),
            size,
            backing: Backing::Positioned(RwLock::new(file)),
        })
    }

    /// Wraps a stateful reader (for example a file inside a CASC storage).
    pub fn from_reader<R>(path: impl Into<String>, mut reader: R) -> Result<Self, CacheError>
    where
        R: ReadSeek + 'static,
    {
        let size = reader.stream_length()?;
        Ok(Self {
            path: path.into(),
            size,
            backing: Backing::Stateful(RwLock::new(Box::new(reader))),
        })
    }

    /// The path this handle was opened from, for diagnostics.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Fills `buf` from `offset`. Fails with `UnexpectedEof` when the range leaves the segment.
    pub fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        self.check_range(offset, buf.len() as u64)?;
        match &self.backing {
            Backing::Positioned(file) => positioned_read(file, offset, buf),
            Backing::Stateful(reader) => {
                let mut reader = reader.write();
                reader.seek(SeekFrom::Start(offset))?;
                reader.read_exact(buf)
            }
        }
    }

    /// Reads `length` bytes at `offset` into a new buffer.
    ///
    /// The range is checked against the segment before anything is allocated.
    pub fn read_at(&self, offset: u64, length: usize) -> Result<Vec<u8>, CacheError> {
        self.check_range(offset, length as u64)?;
        let mut buffer = vec![0u8; length];
        self.read_exact_at(offset, &mut buffer)?;
        Ok(buffer)
    }

    fn check_range(&self, offset: u64, length: u64) -> io::Result<()> {
        let end = offset
            .checked_add(length)
            .ok_or_else(|| io::Error::from(io::ErrorKind::InvalidInput))?;
        if end > self.size {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!(
                    "read of {length} bytes at {offset:#x} past end of {} ({:#x})",
                    self.path, self.size
                ),
            ));
        }
        Ok(())
    }

    /// Returns an independent `Read + Seek` view starting at offset zero.
    pub fn cursor(&self) -> ArchiveCursor<'_> {
        ArchiveCursor {
            handle: self,
            position: 0,
        }
    }
}

#[cfg(unix)]
fn positioned_read(file: &RwLock<File>, offset: u64, buf: &mut [u8]) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read().read_exact_at(buf, offset)
}

#[cfg(windows)]
fn positioned_read(file: &RwLock<File>, offset: u64, buf: &mut [u8]) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    let file = file.read();
    let mut filled = 0;
    while filled < buf.len() {
        match file.seek_read(&mut buf[filled..], offset + filled as u64)? {
            0 => return Err(io::Error::from(io::ErrorKind::UnexpectedEof)),
            n => filled += n,
        }
    }
    Ok(())
}

#[cfg(not(any(unix, windows)))]
fn positioned_read(file: &RwLock<File>, offset: u64, buf: &mut [u8]) -> io::Result<()> {
    let mut file = file.write();
    file.seek(SeekFrom::Start(offset))?;
    file.read_exact(buf)
}

/// A private read position over a shared [`ArchiveFileHandle`].
pub struct ArchiveCursor<'a> {
    handle: &'a ArchiveFileHandle,
    position: u64,
}

impl Read for ArchiveCursor<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = self.handle.size.saturating_sub(self.position);
        let n = (buf.len() as u64).min(remaining) as usize;
        if n == 0 {
            return Ok(0);
        }
        self.handle.read_exact_at(self.position, &mut buf[..n])?;
        self.position += n as u64;
        Ok(n)
    }
}

impl Seek for ArchiveCursor<'_> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::Current(delta) => self.position.checked_add_signed(delta),
            SeekFrom::End(delta) => self.handle.size.checked_add_signed(delta),
        };
        self.position = target.ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "seek before start of segment")
        })?;
        Ok(self.position)
    }
}
