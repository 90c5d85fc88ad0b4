//! Magic-number sniffing: which dialect, byte order, and word size an image
//! uses, determined from its first word alone.
//!
//! Grounded in `submerge-coldb::layer::LayerMeta::read_and_check_magic_header`:
//! read a fixed header token before anything else is trusted, and fail fast
//! with a specific error if it doesn't match anything known.

use stvm_base::Result;

use crate::bitstream::BitStream;
use crate::error::{image_err, ImageErrorKind};

const MAGIC_V3_32: i64 = 6502;
const MAGIC_V3_64: i64 = 68002;
const MAGIC_SPUR_32: i64 = 6521;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    V3,
    Spur,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Version {
    pub dialect: Dialect,
    pub big_endian: bool,
    pub word_size: usize,
    pub magic: i64,
}

impl Version {
    /// Reads the first word of `stream` both big- and little-endian and
    /// commits the stream to whichever interpretation matches a known magic
    /// number. Leaves the stream positioned just past the magic word.
    pub fn sniff(stream: &mut BitStream) -> Result<Version> {
        let candidates: [(bool, usize); 4] = [(true, 4), (true, 8), (false, 4), (false, 8)];
        for (big_endian, word_size) in candidates {
            stream.set_big_endian(big_endian);
            stream.set_word_size(word_size);
            let Ok(magic) = stream.peek() else {
                continue;
            };
            if let Some(v) = Self::classify(magic, big_endian, word_size) {
                stream.next_word()?;
                return Ok(v);
            }
        }
        Err(image_err(ImageErrorKind::BadMagic))
    }

    fn classify(magic: i64, big_endian: bool, word_size: usize) -> Option<Version> {
        let dialect = match magic {
            MAGIC_V3_32 if word_size == 4 => Dialect::V3,
            MAGIC_V3_64 if word_size == 8 => Dialect::V3,
            MAGIC_SPUR_32 if word_size == 4 => Dialect::Spur,
            _ => return None,
        };
        Some(Version {
            dialect,
            big_endian,
            word_size,
            magic,
        })
    }

    pub fn is_spur(&self) -> bool {
        matches!(self.dialect, Dialect::Spur)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn sniffs_v3_32bit_big_endian() {
        let mut s = BitStream::from_bytes((MAGIC_V3_32 as i32).to_be_bytes().to_vec());
        let v = Version::sniff(&mut s).unwrap();
        assert_eq!(v.dialect, Dialect::V3);
        assert!(v.big_endian);
        assert_eq!(v.word_size, 4);
    }

    #[test]
    fn sniffs_v3_64bit_big_endian() {
        let mut s = BitStream::from_bytes(MAGIC_V3_64.to_be_bytes().to_vec());
        let v = Version::sniff(&mut s).unwrap();
        assert_eq!(v.dialect, Dialect::V3);
        assert_eq!(v.word_size, 8);
    }

    #[test]
    fn sniffs_spur_32bit_big_endian() {
        let mut s = BitStream::from_bytes((MAGIC_SPUR_32 as i32).to_be_bytes().to_vec());
        let v = Version::sniff(&mut s).unwrap();
        assert_eq!(v.dialect, Dialect::Spur);
        assert!(v.is_spur());
    }

    #[test]
    fn sniffs_little_endian_when_big_endian_fails() {
        let mut s = BitStream::from_bytes((MAGIC_V3_32 as i32).to_le_bytes().to_vec());
        let v = Version::sniff(&mut s).unwrap();
        assert_eq!(v.dialect, Dialect::V3);
        assert!(!v.big_endian);
    }

    #[test]
    fn unknown_magic_is_bad_magic() {
        let mut s = BitStream::from_bytes(0xdead_beefu32.to_be_bytes().to_vec());
        assert!(Version::sniff(&mut s).is_err());
    }
}
