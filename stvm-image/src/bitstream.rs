//! Big/little-endian byte stream over an in-memory buffer.
//!
//! Mirrors the shape of `submerge-coldb`'s `ioutil` readers (a `Read + Seek`
//! source opened once, then treated as pure in-memory data): the whole image
//! file is slurped into a buffer at open time, so every subsequent operation
//! here is CPU-only and cannot block or fail on I/O.

use std::fs;
use std::path::Path;

use stvm_base::Result;
use tracing::trace;

use crate::error::{image_err, ImageErrorKind};

/// `chrs2int`: big-endian 4 bytes as a signed 32-bit integer.
pub fn chrs2int(bytes: [u8; 4]) -> i32 {
    i32::from_be_bytes(bytes)
}

/// `chrs2long`: big-endian 8 bytes as a signed 64-bit integer.
pub fn chrs2long(bytes: [u8; 8]) -> i64 {
    i64::from_be_bytes(bytes)
}

/// Byte-swapped counterpart of [`chrs2long`], used when probing endianness.
pub fn swapped_chrs2long(bytes: [u8; 8]) -> i64 {
    i64::from_le_bytes(bytes)
}

fn field_mask(len: usize) -> i64 {
    if len >= 64 {
        -1
    } else {
        (1i64 << len) - 1
    }
}

/// Packs `values` into a single integer, low to high: `values[0]` occupies
/// the lowest `lengths[0]` bits, `values[1]` the next `lengths[1]` bits, and
/// so on. Inverse of [`split_bits`]. This is the packing every per-object
/// header and compiled-method header field layout in this crate follows.
pub fn join_bits(values: &[i64], lengths: &[usize]) -> i64 {
    debug_assert_eq!(values.len(), lengths.len());
    let mut result: i64 = 0;
    let mut shift = 0usize;
    for (&v, &len) in values.iter().zip(lengths.iter()) {
        result |= (v & field_mask(len)) << shift;
        shift += len;
    }
    result
}

/// Splits `v` into fields of the given bit `lengths`, low bits first.
/// Inverse of [`join_bits`]: `split_bits(join_bits(values, lengths),
/// lengths) == values` (mod truncation if a value didn't fit its length).
pub fn split_bits(v: i64, lengths: &[usize]) -> Vec<i64> {
    let mut out = Vec::with_capacity(lengths.len());
    let mut shift = 0usize;
    for &len in lengths {
        out.push((v >> shift) & field_mask(len));
        shift += len;
    }
    out
}

#[derive(Debug)]
pub struct BitStream {
    data: Vec<u8>,
    pos: usize,
    count_origin: usize,
    big_endian: bool,
    word_size: usize,
}

impl BitStream {
    /// Reads the whole file into memory and returns a stream defaulted to
    /// big-endian, 4-byte words; [`crate::version::Version::sniff`] fixes
    /// both before any further reads happen.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let data = fs::read(path)?;
        Ok(Self::from_bytes(data))
    }

    pub fn from_bytes(data: Vec<u8>) -> Self {
        BitStream {
            data,
            pos: 0,
            count_origin: 0,
            big_endian: true,
            word_size: 4,
        }
    }

    pub(crate) fn set_big_endian(&mut self, big_endian: bool) {
        self.big_endian = big_endian;
    }

    pub(crate) fn set_word_size(&mut self, word_size: usize) {
        debug_assert!(word_size == 4 || word_size == 8);
        self.word_size = word_size;
    }

    pub fn word_size(&self) -> usize {
        self.word_size
    }

    pub fn big_endian(&self) -> bool {
        self.big_endian
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn reset_count(&mut self) {
        self.count_origin = self.pos;
    }

    pub fn count(&self) -> usize {
        self.pos - self.count_origin
    }

    pub fn skip(&mut self, n: usize) -> Result<()> {
        if self.pos + n > self.data.len() {
            return Err(image_err(ImageErrorKind::TruncatedImage { pos: self.pos as u64 }));
        }
        self.pos += n;
        Ok(())
    }

    fn take(&mut self, n: usize) -> Result<[u8; 8]> {
        if self.pos + n > self.data.len() {
            return Err(image_err(ImageErrorKind::TruncatedImage { pos: self.pos as u64 }));
        }
        let mut buf = [0u8; 8];
        buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.pos += n;
        Ok(buf)
    }

    fn peek_bytes(&self, n: usize) -> Result<[u8; 8]> {
        if self.pos + n > self.data.len() {
            return Err(image_err(ImageErrorKind::TruncatedImage { pos: self.pos as u64 }));
        }
        let mut buf = [0u8; 8];
        buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        Ok(buf)
    }

    fn word_from_buf(&self, buf: [u8; 8]) -> i64 {
        match self.word_size {
            4 => {
                let mut b = [0u8; 4];
                b.copy_from_slice(&buf[..4]);
                if self.big_endian {
                    chrs2int(b) as i64
                } else {
                    i32::from_le_bytes(b) as i64
                }
            }
            8 => {
                let mut b = [0u8; 8];
                b.copy_from_slice(&buf[..8]);
                if self.big_endian {
                    chrs2long(b)
                } else {
                    i64::from_le_bytes(b)
                }
            }
            other => unreachable!("word size must be 4 or 8, got {other}"),
        }
    }

    /// Reads the next machine word without advancing the stream.
    pub fn peek(&self) -> Result<i64> {
        let buf = self.peek_bytes(self.word_size)?;
        Ok(self.word_from_buf(buf))
    }

    /// Reads and consumes the next machine word, sign-extended.
    pub fn next_word(&mut self) -> Result<i64> {
        let buf = self.take(self.word_size)?;
        Ok(self.word_from_buf(buf))
    }

    /// Reads a 16-bit field; always exactly 2 bytes regardless of word size.
    pub fn next_short(&mut self) -> Result<u16> {
        let buf = self.take(2)?;
        let mut b = [0u8; 2];
        b.copy_from_slice(&buf[..2]);
        Ok(if self.big_endian {
            u16::from_be_bytes(b)
        } else {
            u16::from_le_bytes(b)
        })
    }

    /// Reads an unsigned 64-bit field; always exactly 8 bytes.
    pub fn next_qword(&mut self) -> Result<u64> {
        let buf = self.take(8)?;
        Ok(if self.big_endian {
            u64::from_be_bytes(buf)
        } else {
            u64::from_le_bytes(buf)
        })
    }

    pub fn close(&mut self) {
        trace!(consumed = self.pos, total = self.data.len(), "closing bitstream");
        self.data.clear();
        self.pos = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn chrs2int_roundtrip() {
        assert_eq!(chrs2int(1i32.to_be_bytes()), 1);
        assert_eq!(chrs2int((-1i32).to_be_bytes()), -1);
    }

    #[test]
    fn chrs2long_roundtrip() {
        assert_eq!(chrs2long(1i64.to_be_bytes()), 1);
        assert_eq!(chrs2long((-1i64).to_be_bytes()), -1);
        assert_eq!(chrs2long(68002i64.to_be_bytes()), 68002);
        assert_eq!(swapped_chrs2long(68002i64.to_le_bytes()), 68002);
    }

    #[test]
    fn simple_join_bits() {
        assert_eq!(join_bits(&[1, 1, 1, 1], &[8, 8, 8, 8]), 0x0101_0101);
        assert_eq!(join_bits(&[255, 255, 255, 255], &[8, 8, 8, 8]), 0xFFFF_FFFF);
    }

    #[test]
    fn fancy_join_bits() {
        assert_eq!(join_bits(&[4, 3, 2, 1], &[8, 8, 8, 8]), 0x0102_0304);
        assert_eq!(join_bits(&[1, 3, 7, 15], &[1, 2, 3, 4]), 0x3FF);
    }

    #[test]
    fn split_bits_inverts_join_bits() {
        let cases: &[(&[i64], &[usize])] = &[
            (&[1, 1, 1, 1], &[8, 8, 8, 8]),
            (&[4, 3, 2, 1], &[8, 8, 8, 8]),
            (&[1, 3, 7, 15], &[1, 2, 3, 4]),
            (&[6, 4, 20], &[6, 4, 20]),
            (&[0x3F_FFFF, 0x3F_FFFF, 0x1F, 0xFF], &[22, 22, 5, 8]),
        ];
        for (values, lengths) in cases {
            let packed = join_bits(values, lengths);
            assert_eq!(&split_bits(packed, lengths), values);
        }
    }

    #[test]
    fn peek_does_not_advance() {
        let mut s = BitStream::from_bytes(6502i32.to_be_bytes().to_vec());
        assert_eq!(s.peek().unwrap(), 6502);
        assert_eq!(s.next_word().unwrap(), 6502);
        assert!(s.next_word().is_err());
    }

    #[test]
    fn little_endian_word() {
        let mut s = BitStream::from_bytes(vec![0x66, 0x19, 0x00, 0x00]);
        s.set_big_endian(false);
        assert_eq!(s.next_word().unwrap(), 6502);
    }

    #[test]
    fn skipbytes_then_read() {
        let mut bytes = vec![0xFF, 0xFF, 0xFF];
        bytes.extend_from_slice(&6502i32.to_be_bytes());
        let mut s = BitStream::from_bytes(bytes);
        s.skip(3).unwrap();
        assert_eq!(s.next_word().unwrap(), 6502);
    }

    #[test]
    fn count_tracks_since_reset() {
        let mut s = BitStream::from_bytes(vec![0xFF; 20]);
        s.next_word().unwrap();
        s.next_word().unwrap();
        s.reset_count();
        assert_eq!(s.count(), 0);
        s.next_word().unwrap();
        assert_eq!(s.count(), 4);
        s.next_word().unwrap();
        assert_eq!(s.count(), 8);
    }

    #[test]
    fn next_short_then_word_32bit() {
        let mut s = BitStream::from_bytes(vec![1, 2, 3, 4, 5, 6, 7, 8]);
        s.set_word_size(4);
        assert_eq!(s.next_short().unwrap(), 0x0102);
        assert_eq!(s.next_short().unwrap(), 0x0304);
        assert_eq!(s.next_word().unwrap(), 0x05060708);
    }

    #[test]
    fn next_short_then_word_64bit() {
        let mut s = BitStream::from_bytes(vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12]);
        s.set_word_size(8);
        assert_eq!(s.next_short().unwrap(), 0x0102);
        assert_eq!(s.next_short().unwrap(), 0x0304);
        assert_eq!(s.next_word().unwrap(), 0x05060708090a0b0c);
    }

    #[test]
    fn next_qword_is_unsigned() {
        let mut s = BitStream::from_bytes(vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12]);
        s.set_word_size(4);
        assert_eq!(s.next_qword().unwrap(), 0x0102030405060708);
        assert_eq!(s.next_word().unwrap(), 0x090a0b0c);
    }

    #[test]
    fn next_qword_max_is_positive() {
        let mut s = BitStream::from_bytes(vec![0xFF; 8]);
        let max = s.next_qword().unwrap();
        assert_eq!(max, u64::MAX);
    }

    #[test]
    fn truncated_read_is_error() {
        let mut s = BitStream::from_bytes(vec![1, 2, 3]);
        assert!(s.next_word().is_err());
    }
}
