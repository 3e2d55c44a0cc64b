use std::io;
use std::io::Read;
use std::io::Seek;
use std::io::SeekFrom;

/// String reads and peeking over seekable streams.
pub trait ReadExt: Read + Seek {
    fn peek_byte(&mut self) -> io::Result<u8>;

    fn read_string(&mut self, length: usize) -> io::Result<String>;

    fn read_null_terminated_string(&mut self) -> io::Result<String>;
}

impl<T> ReadExt for T
where
    T: Read + Seek,
{
    /// Peeks a single byte from the reader without advancing its position.
    fn peek_byte(&mut self) -> io::Result<u8> {
        let pos = self.stream_position()?;
        let mut buf = [0u8; 1];
        let n = self.read(&mut buf)?;
        self.seek(SeekFrom::Start(pos))?;
        if n == 0 {
            Err(io::Error::new(io::ErrorKind::UnexpectedEof, "EOF"))
        } else {
            Ok(buf[0])
        }
    }

    /// Reads exactly `length` bytes and interprets them as UTF-8, replacing invalid sequences.
    fn read_string(&mut self, length: usize) -> io::Result<String> {
        let bytes = self.read_bytes(length)?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Reads bytes up to (and consuming) a terminating zero, or until EOF.
    fn read_null_terminated_string(&mut self) -> io::Result<String> {
        let mut bytes = Vec::new();
        let mut buf = [0u8; 1];
        loop {
            if self.read(&mut buf)? == 0 || buf[0] == 0 {
                break;
            }
            bytes.push(buf[0]);
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

/// A trait that reads byte buffers and variable width integers from any `Read` type.
pub trait BytesReadExt: Read {
    /// Reads exactly `length` bytes into a new buffer.
    fn read_bytes(&mut self, length: usize) -> io::Result<Vec<u8>>;

    /// Reads an unsigned big-endian integer stored in `width` bytes (1..=8).
    fn read_uint_be(&mut self, width: usize) -> io::Result<u64>;
}

impl<T> BytesReadExt for T
where
    T: Read,
{
    fn read_bytes(&mut self, length: usize) -> io::Result<Vec<u8>> {
        let mut result: Vec<u8> = Vec::new();

        result
            .try_reserve_exact(length)
            .map_err(|e| io::Error::new(io::ErrorKind::OutOfMemory, e))?;
        result.resize(length, 0);

        self.read_exact(&mut result)?;

        Ok(result)
    }

    fn read_uint_be(&mut self, width: usize) -> io::Result<u64> {
        if width == 0 || width > 8 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("Invalid integer width {width}"),
            ));
        }
        let mut buf = [0u8; 8];
        self.read_exact(&mut buf[8 - width..])?;
        Ok(u64::from_be_bytes(buf))
    }
}

/// Utility methods for working with seekable streams.
pub trait SeekExt: Seek {
    /// Skips over the given number of bytes from the current position.
    fn skip<P: Copy + 'static>(&mut self, size: P) -> io::Result<u64>
    where
        u64: TryFrom<P>;

    /// Returns the total length of the stream, restoring the current position.
    fn stream_length(&mut self) -> io::Result<u64>;
}

impl<T> SeekExt for T
where
    T: Seek,
{
    fn skip<P: Copy + 'static>(&mut self, size: P) -> io::Result<u64>
    where
        u64: TryFrom<P>,
    {
        let size = u64::try_from(size).map_err(|_| io::Error::from(io::ErrorKind::InvalidData))?;
        let size = i64::try_from(size).map_err(|_| io::Error::from(io::ErrorKind::InvalidData))?;

        self.seek(SeekFrom::Current(size))
    }

    fn stream_length(&mut self) -> io::Result<u64> {
        let pos = self.stream_position()?;
        let len = self.seek(SeekFrom::End(0))?;
        if pos != len {
            self.seek(SeekFrom::Start(pos))?;
        }
        Ok(len)
    }
}

/// Aligns `value` up to the next multiple of `alignment` (a power of two).
pub(crate) fn align_up(value: u64, alignment: u64) -> u64 {
    (value + alignment - 1) & !(alignment - 1)
}
