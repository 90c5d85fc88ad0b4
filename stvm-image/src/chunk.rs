//! A decoded per-object header+data record, the reader's intermediate
//! representation between the raw byte stream and a [`crate::object::GenericObject`].
//!
//! Named and shaped after `submerge-coldb::chunk`, but carrying
//! object-header fields (size/format/class/hash) instead of
//! dictionary-entry payloads.

/// Slot data backing a chunk: every chunk is read word-at-a-time regardless
/// of what its format ultimately means, so the raw words are kept alongside
/// the stream's word size/byte order to let later passes reinterpret them
/// (as oops, as packed bytes, as sub-word integers) without re-reading.
#[derive(Debug, Clone)]
pub struct Chunk {
    /// The chunk's own image address (used as the key other chunks'
    /// references resolve against).
    pub address: i64,
    /// Declared slot count, in the unit the format implies (words, unless
    /// format-specific trimming narrows it to bytes/half-words).
    pub size: usize,
    pub format: u8,
    /// v3: compact-class-table index (0 means "see `class_oop`").
    /// Spur: the class id field from the fixed header.
    pub class_id: i64,
    /// An explicit class oop, present only for v3 3-word headers.
    pub class_oop: Option<i64>,
    pub hash: i64,
    pub data: Vec<i64>,
    pub word_size: usize,
    pub big_endian: bool,
}

impl Chunk {
    pub fn is_weak(&self, is_spur: bool) -> bool {
        if is_spur {
            matches!(self.format, 4 | 5)
        } else {
            self.format == 4
        }
    }

    pub fn is_compiled_method(&self, is_spur: bool) -> bool {
        if is_spur {
            (24..=31).contains(&self.format)
        } else {
            (12..=15).contains(&self.format)
        }
    }

    pub fn is_byte_indexable(&self, is_spur: bool) -> bool {
        if is_spur {
            (16..=23).contains(&self.format)
        } else {
            (8..=11).contains(&self.format)
        }
    }

    pub fn is_word_indexable(&self, is_spur: bool) -> bool {
        if is_spur {
            matches!(self.format, 9 | 10 | 11)
        } else {
            matches!(self.format, 6 | 7)
        }
    }

    pub fn is_pointers(&self, is_spur: bool) -> bool {
        if is_spur {
            matches!(self.format, 0 | 1 | 2 | 3 | 4 | 5)
        } else {
            matches!(self.format, 0 | 1 | 2 | 3 | 4)
        }
    }

    /// Packs `self.data` into raw bytes honoring the stream's original byte
    /// order, then drops `trim` trailing bytes -- the trimming rule v3
    /// formats 8-11 and Spur's byte-indexable formats both use to recover a
    /// byte length that isn't a whole number of words.
    pub fn trimmed_bytes(&self, trim: usize) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.data.len() * self.word_size);
        for &word in &self.data {
            bytes.extend_from_slice(&word_to_bytes(word, self.word_size, self.big_endian));
        }
        let keep = bytes.len().saturating_sub(trim);
        bytes.truncate(keep);
        bytes
    }
}

pub(crate) fn word_to_bytes(word: i64, word_size: usize, big_endian: bool) -> Vec<u8> {
    match word_size {
        4 => {
            let w = word as i32;
            if big_endian {
                w.to_be_bytes().to_vec()
            } else {
                w.to_le_bytes().to_vec()
            }
        }
        8 => {
            if big_endian {
                word.to_be_bytes().to_vec()
            } else {
                word.to_le_bytes().to_vec()
            }
        }
        other => unreachable!("word size must be 4 or 8, got {other}"),
    }
}
