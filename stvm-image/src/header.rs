//! Per-dialect decoding of the 16-word image header, per-object headers
//! (v3's 1/2/3-word shapes, Spur's fixed 8-byte shape plus overflow), and
//! Spur segment bridges.

use stvm_base::Result;
use tracing::trace;

use crate::bitstream::{split_bits, BitStream};
use crate::chunk::Chunk;
use crate::error::{image_err, ImageErrorKind};
use crate::model::{Object, ObjectHandle};
use crate::space::{Space, COMPACT_CLASS_TABLE_SIZE};
use crate::version::Version;

/// Spur segment bridges use this sentinel span to mark "no further
/// segment follows".
pub const TERMINAL_BRIDGE_SPAN: i64 = 1_241_513_987;

/// Index of `COMPACT_CLASSES_ARRAY` within the special-objects array.
pub const COMPACT_CLASSES_ARRAY_INDEX: usize = 28;

/// Spur's fixed per-object header field widths, low bits first:
/// `class_id(22), hash(22), format(5), n_slots(8)`.
const SPUR_HEADER_FIELDS: [usize; 4] = [22, 22, 5, 8];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ImageHeader {
    pub header_size: i64,
    pub body_length: i64,
    pub old_base_address: i64,
    pub special_objects_oop: i64,
    pub last_hash: i64,
    pub window_width: u16,
    pub window_height: u16,
    pub full_screen: i64,
    pub extra_memory: i64,
    pub stack_pages: Option<i64>,
    pub cog_code_size: Option<i64>,
    pub eden_bytes: Option<i64>,
    pub max_ext_sem_tab_size: Option<i64>,
    pub first_segment_size: Option<i64>,
    pub free_old_space: Option<i64>,
}

/// Total header size: 16 machine words, magic included.
const HEADER_WORDS: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct V3ObjectHeader {
    pub size: usize,
    pub format: u8,
    pub compact_class_index: u8,
    pub hash: i64,
    pub class_oop: Option<i64>,
    pub header_words: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpurObjectHeader {
    pub n_slots: usize,
    pub format: u8,
    pub hash: i64,
    pub class_id: i64,
    /// Number of 8-byte header words actually consumed (2 when the
    /// overflow-slot-count path was taken, 1 otherwise).
    pub header_qwords: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpurBridge {
    pub span: i64,
    pub next_segment_size: i64,
    pub terminal: bool,
}

pub struct HeaderParser;

impl HeaderParser {
    /// Reads the remaining 15 header words after the magic word `Version::sniff`
    /// already consumed, padding out to exactly 16 words total.
    pub fn read_image_header(stream: &mut BitStream, version: &Version) -> Result<ImageHeader> {
        stream.reset_count();
        let header_size = stream.next_word()?;
        let body_length = stream.next_word()?;
        let old_base_address = stream.next_word()?;
        let special_objects_oop = stream.next_word()?;
        let last_hash = stream.next_word()?;
        let window_width = stream.next_short()?;
        let window_height = stream.next_short()?;
        let full_screen = stream.next_word()?;
        let extra_memory = stream.next_word()?;

        let mut header = ImageHeader {
            header_size,
            body_length,
            old_base_address,
            special_objects_oop,
            last_hash,
            window_width,
            window_height,
            full_screen,
            extra_memory,
            ..Default::default()
        };

        if version.is_spur() {
            header.stack_pages = Some(stream.next_short()? as i64);
            header.cog_code_size = Some(stream.next_short()? as i64);
            header.eden_bytes = Some(stream.next_word()?);
            header.max_ext_sem_tab_size = Some(stream.next_short()? as i64);
            header.first_segment_size = Some(stream.next_word()?);
            header.free_old_space = Some(stream.next_word()?);
        }

        let consumed = stream.count();
        let target = (HEADER_WORDS - 1) * version.word_size;
        if consumed > target {
            return Err(image_err(ImageErrorKind::CorruptImage {
                details: format!("header overran its 16-word budget by {} bytes", consumed - target),
            }));
        }
        stream.skip(target - consumed)?;
        trace!(target: "stvm", ?header, "read image header");
        Ok(header)
    }

    /// v3: classify by the top two bits of the first word into a 1/2/3-word
    /// header shape and extract `(size, format, compact_class_index, hash)`
    /// plus an explicit class oop for the 3-word shape.
    pub fn read_v3_object_header(stream: &mut BitStream, address: i64) -> Result<V3ObjectHeader> {
        let shape_shift = (stream.word_size() * 8 - 2) as i64;
        let w0 = stream.peek()?;
        let top2 = ((w0 >> shape_shift) & 0b11) as u8;
        // Low-order layout below the top-2 type tag, independent of word
        // size: compact_class_index(6) at bit 0, format(4) at bit 6,
        // size(20) at bit 10 -- 30 bits total, leaving the top 2 (or, for
        // 64-bit images, top 34) bits for the type tag.
        const FIELDS: [usize; 3] = [6, 4, 20];
        match top2 {
            0b11 => {
                let w0 = stream.next_word()?;
                let fields = split_bits(w0, &FIELDS);
                Ok(V3ObjectHeader {
                    size: fields[2] as usize,
                    format: fields[1] as u8,
                    compact_class_index: fields[0] as u8,
                    hash: 0,
                    class_oop: None,
                    header_words: 1,
                })
            }
            0b01 => {
                let w0 = stream.next_word()?;
                let w1 = stream.next_word()?;
                let fields = split_bits(w0, &FIELDS);
                Ok(V3ObjectHeader {
                    size: fields[2] as usize,
                    format: fields[1] as u8,
                    compact_class_index: fields[0] as u8,
                    hash: split_bits(w1, &[32])[0],
                    class_oop: None,
                    header_words: 2,
                })
            }
            0b00 => {
                let w0 = stream.next_word()?;
                let class_oop = stream.next_word()?;
                let w2 = stream.next_word()?;
                let fields = split_bits(w0, &FIELDS);
                Ok(V3ObjectHeader {
                    size: fields[2] as usize,
                    format: fields[1] as u8,
                    compact_class_index: 0,
                    hash: split_bits(w2, &[32])[0],
                    class_oop: Some(class_oop),
                    header_words: 3,
                })
            }
            _ => Err(image_err(ImageErrorKind::CorruptImage {
                details: format!("impossible v3 header shape at address {address:#x}"),
            })),
        }
    }

    /// Spur: a fixed 8-byte `(n_slots(8), format(5), hash(22), class_id(22))`
    /// header. `n_slots == 255` means the real count lives in the qword
    /// read just before this one (already consumed), and this header's
    /// `format`/`hash`/`class_id` are the real ones.
    pub fn read_spur_object_header(stream: &mut BitStream) -> Result<SpurObjectHeader> {
        let raw = stream.next_qword()? as i64;
        let fields = split_bits(raw, &SPUR_HEADER_FIELDS);
        let n_slots = fields[3] as usize;

        if n_slots == 255 {
            let overflow = stream.next_qword()?;
            let real = Self::read_spur_object_header_inner(stream)?;
            return Ok(SpurObjectHeader {
                n_slots: overflow as usize,
                header_qwords: 2,
                ..real
            });
        }

        Ok(SpurObjectHeader {
            n_slots,
            format: fields[2] as u8,
            hash: fields[1],
            class_id: fields[0],
            header_qwords: 1,
        })
    }

    fn read_spur_object_header_inner(stream: &mut BitStream) -> Result<SpurObjectHeader> {
        let raw = stream.next_qword()? as i64;
        let fields = split_bits(raw, &SPUR_HEADER_FIELDS);
        Ok(SpurObjectHeader {
            n_slots: fields[3] as usize,
            format: fields[2] as u8,
            hash: fields[1],
            class_id: fields[0],
            header_qwords: 1,
        })
    }

    pub fn read_spur_bridge(stream: &mut BitStream) -> Result<SpurBridge> {
        let raw = stream.next_qword()?;
        if raw as i64 == TERMINAL_BRIDGE_SPAN {
            return Ok(SpurBridge {
                span: TERMINAL_BRIDGE_SPAN,
                next_segment_size: 0,
                terminal: true,
            });
        }
        let fields = split_bits(raw as i64, &[22, 42]);
        Ok(SpurBridge {
            span: fields[0],
            next_segment_size: fields[1],
            terminal: false,
        })
    }

    /// Builds the 31-entry compact-class table from the special-objects
    /// array's `COMPACT_CLASSES_ARRAY` slot. Missing or short arrays are
    /// padded with `None` so callers can always index all 31 slots.
    pub fn build_compact_class_table(
        space: &Space,
        special_objects_array: ObjectHandle,
    ) -> Result<Vec<Option<ObjectHandle>>> {
        let mut table = Vec::with_capacity(COMPACT_CLASS_TABLE_SIZE);
        let slot = space.fetch_slot(special_objects_array, COMPACT_CLASSES_ARRAY_INDEX)?;
        if let Object::Pointer(classes_array) = slot {
            let len = space.size_of(classes_array)?.min(COMPACT_CLASS_TABLE_SIZE);
            for i in 0..len {
                let v = space.fetch_slot(classes_array, i)?;
                table.push(v.as_handle());
            }
        }
        table.resize(COMPACT_CLASS_TABLE_SIZE, None);
        Ok(table)
    }
}

/// Trim amount in bytes implied by a chunk's format low bits, per the
/// per-dialect format-code tables.
pub fn byte_trim_for_format(format: u8, is_spur: bool) -> usize {
    if is_spur {
        match format {
            10..=11 => (format & 1) as usize * 4,
            12..=15 => (format & 3) as usize * 2,
            16..=23 => (format & 7) as usize,
            24..=31 => (format & 7) as usize,
            _ => 0,
        }
    } else {
        match format {
            8..=11 => (format & 3) as usize,
            12..=15 => (format & 3) as usize,
            _ => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::version::{Dialect, Version};
    use test_log::test;

    fn v3_version() -> Version {
        Version {
            dialect: Dialect::V3,
            big_endian: true,
            word_size: 4,
            magic: 6502,
        }
    }

    #[test]
    fn minimal_v3_image_header_consumes_64_bytes() {
        let mut bytes = (6502i32).to_be_bytes().to_vec();
        bytes.extend(std::iter::repeat(0u8).take(60));
        let mut stream = BitStream::from_bytes(bytes);
        let version = Version::sniff(&mut stream).unwrap();
        assert_eq!(version.dialect, Dialect::V3);
        HeaderParser::read_image_header(&mut stream, &version).unwrap();
        assert_eq!(stream.pos(), 64);
    }

    #[test]
    fn v3_one_word_header_decodes_size_and_format() {
        // top2=11, size=5, format=2, compact_class_index=3
        let word: i64 = (0b11 << 30) | (5 << 10) | (2 << 6) | 3;
        let mut stream = BitStream::from_bytes((word as i32).to_be_bytes().to_vec());
        stream.set_big_endian(true);
        stream.set_word_size(4);
        let h = HeaderParser::read_v3_object_header(&mut stream, 0).unwrap();
        assert_eq!(h.size, 5);
        assert_eq!(h.format, 2);
        assert_eq!(h.compact_class_index, 3);
        assert_eq!(h.header_words, 1);
    }

    #[test]
    fn spur_header_round_trip() {
        let n_slots: u64 = 7;
        let format: u64 = 2;
        let hash: u64 = 4040;
        let class_id: u64 = 5;
        let raw = (n_slots << 49) | (format << 44) | (hash << 22) | class_id;
        let mut stream = BitStream::from_bytes(raw.to_be_bytes().to_vec());
        stream.set_big_endian(true);
        stream.set_word_size(8);
        let h = HeaderParser::read_spur_object_header(&mut stream).unwrap();
        assert_eq!(h.n_slots, 7);
        assert_eq!(h.format, 2);
        assert_eq!(h.hash, 4040);
        assert_eq!(h.class_id, 5);
    }

    #[test]
    fn spur_overflow_header_reads_real_count_and_format() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&500u64.to_be_bytes());
        let n_slots: u64 = 255;
        let format: u64 = 3;
        let hash: u64 = 1;
        let class_id: u64 = 9;
        let raw = (n_slots << 49) | (format << 44) | (hash << 22) | class_id;
        bytes.extend_from_slice(&raw.to_be_bytes());
        let mut stream = BitStream::from_bytes(bytes);
        stream.set_big_endian(true);
        stream.set_word_size(8);
        let h = HeaderParser::read_spur_object_header(&mut stream).unwrap();
        assert_eq!(h.n_slots, 500);
        assert_eq!(h.format, 3);
        assert_eq!(h.header_qwords, 2);
    }

    #[test]
    fn terminal_bridge_is_recognized() {
        let mut stream = BitStream::from_bytes((TERMINAL_BRIDGE_SPAN as u64).to_be_bytes().to_vec());
        stream.set_big_endian(true);
        stream.set_word_size(8);
        let bridge = HeaderParser::read_spur_bridge(&mut stream).unwrap();
        assert!(bridge.terminal);
    }

    #[test]
    fn non_terminal_bridge_decodes_span_and_size() {
        let span: u64 = 10;
        let next_size: u64 = 99;
        let raw = (next_size << 22) | span;
        let mut stream = BitStream::from_bytes(raw.to_be_bytes().to_vec());
        stream.set_big_endian(true);
        stream.set_word_size(8);
        let bridge = HeaderParser::read_spur_bridge(&mut stream).unwrap();
        assert!(!bridge.terminal);
        assert_eq!(bridge.span, 10);
        assert_eq!(bridge.next_segment_size, 99);
    }
}
