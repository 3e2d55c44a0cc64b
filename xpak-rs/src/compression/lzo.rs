//! LZO1X decoder (the `lzo1x_decompress_safe` state machine).

use super::MAX_UNDECLARED_BLOCK_SIZE;
use crate::error::CacheError;

const M2_MAX_OFFSET: usize = 0x0800;
const MAX_255_COUNT: usize = usize::MAX / 255 - 2;

struct Decoder<'a> {
    input: &'a [u8],
    ip: usize,
    output: Vec<u8>,
    limit: usize,
}

fn overrun() -> CacheError {
    CacheError::Decompression("LZO: input overrun".into())
}

impl<'a> Decoder<'a> {
    fn byte(&mut self) -> Result<usize, CacheError> {
        let b = *self.input.get(self.ip).ok_or_else(overrun)?;
        self.ip += 1;
        Ok(b as usize)
    }

    fn le16(&mut self) -> Result<usize, CacheError> {
        let lo = self.byte()?;
        let hi = self.byte()?;
        Ok(lo | (hi << 8))
    }

    /// Reads the zero-run extension of a length field.
    fn extended_length(&mut self, base: usize) -> Result<usize, CacheError> {
        let start = self.ip;
        while *self.input.get(self.ip).ok_or_else(overrun)? == 0 {
            self.ip += 1;
        }
        let zeros = self.ip - start;
        if zeros > MAX_255_COUNT {
            return Err(CacheError::Decompression("LZO: length overflow".into()));
        }
        Ok(zeros * 255 + base + self.byte()?)
    }

    fn literals(&mut self, count: usize) -> Result<(), CacheError> {
        let end = self.ip.checked_add(count).ok_or_else(overrun)?;
        let run = self.input.get(self.ip..end).ok_or_else(overrun)?;
        if self.output.len() + count > self.limit {
            return Err(CacheError::Decompression("LZO: output overrun".into()));
        }
        self.output.extend_from_slice(run);
        self.ip = end;
        Ok(())
    }

    fn copy_match(&mut self, distance: usize, length: usize) -> Result<(), CacheError> {
        if distance == 0 || distance > self.output.len() {
            return Err(CacheError::Decompression("LZO: lookbehind overrun".into()));
        }
        if self.output.len() + length > self.limit {
            return Err(CacheError::Decompression("LZO: output overrun".into()));
        }
        let start = self.output.len() - distance;
        for i in 0..length {
            let b = self.output[start + i];
            self.output.push(b);
        }
        Ok(())
    }
}

/// Decodes an LZO1X stream. `decompressed_size` bounds the output when non-zero.
pub(crate) fn decompress(input: &[u8], decompressed_size: usize) -> Result<Vec<u8>, CacheError> {
    if input.len() < 3 {
        return Err(overrun());
    }
    let limit = if decompressed_size == 0 {
        MAX_UNDECLARED_BLOCK_SIZE
    } else {
        decompressed_size
    };
    let mut d = Decoder {
        input,
        ip: 0,
        output: Vec::with_capacity(decompressed_size),
        limit,
    };

    // `state` is the number of literals copied after the previous instruction (4 = long run).
    let mut state: usize;
    if input[0] > 17 {
        d.ip = 1;
        let t = input[0] as usize - 17;
        d.literals(t)?;
        state = if t < 4 { t } else { 4 };
    } else {
        state = 0;
    }

    loop {
        let t = d.byte()?;
        let next;
        if t < 16 {
            if state == 0 {
                let count = if t == 0 { d.extended_length(15)? } else { t };
                d.literals(count + 3)?;
                state = 4;
                continue;
            } else if state != 4 {
                next = t & 3;
                let distance = 1 + (t >> 2) + (d.byte()? << 2);
                d.copy_match(distance, 2)?;
            } else {
                next = t & 3;
                let distance = 1 + M2_MAX_OFFSET + (t >> 2) + (d.byte()? << 2);
                d.copy_match(distance, 3)?;
            }
        } else if t >= 64 {
            next = t & 3;
            let distance = 1 + ((t >> 2) & 7) + (d.byte()? << 3);
            let length = (t >> 5) + 1;
            d.copy_match(distance, length)?;
        } else if t >= 32 {
            let mut length = (t & 31) + 2;
            if length == 2 {
                length = d.extended_length(31)? + 2;
            }
            let packed = d.le16()?;
            next = packed & 3;
            d.copy_match(1 + (packed >> 2), length)?;
        } else {
            let mut length = (t & 7) + 2;
            if length == 2 {
                length = d.extended_length(7)? + 2;
            }
            let packed = d.le16()?;
            next = packed & 3;
            let distance = ((t & 8) << 11) + (packed >> 2);
            if distance == 0 {
                if length != 3 {
                    return Err(CacheError::Decompression("LZO: bad end marker".into()));
                }
                return Ok(d.output);
            }
            d.copy_match(distance + 0x4000, length)?;
        }
        d.literals(next)?;
        state = next;
    }
}
