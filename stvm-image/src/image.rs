//! Top-level load facade: wires `BitStream` -> `Version` -> `HeaderParser`
//! -> `GenericObject`/`ObjectFactory` -> `Space` into a single entry point.
//!
//! Grounded in `submerge-coldb::layer`'s "open, sniff, read header, read
//! records" pipeline shape.

use std::collections::HashMap;
use std::path::Path;

use stvm_base::Result;

use crate::bitstream::BitStream;
use crate::chunk::Chunk;
use crate::factory::ObjectFactory;
use crate::header::{HeaderParser, ImageHeader};
use crate::model::{Object, ObjectHandle};
use crate::object::GenericObject;
use crate::space::{LoadOptions, Space};
use crate::version::Version;

/// The result of a successful load: the populated [`Space`] and the handle
/// callers should treat as the entry point into the graph (the
/// special-objects array when one was found, otherwise the most recently
/// read object).
pub struct LoadedImage {
    pub space: Space,
    pub root: ObjectHandle,
}

pub struct Image;

impl Image {
    pub fn load(path: impl AsRef<Path>, options: LoadOptions) -> Result<LoadedImage> {
        let data = std::fs::read(path)?;
        Self::load_bytes(data, options)
    }

    pub fn load_bytes(data: Vec<u8>, mut options: LoadOptions) -> Result<LoadedImage> {
        let mut stream = BitStream::from_bytes(data);
        let version = Version::sniff(&mut stream)?;
        let header = HeaderParser::read_image_header(&mut stream, &version)?;
        let is_spur = version.is_spur();
        options.flags.is_spur = is_spur;
        let space = Space::new(options);

        let chunks = if is_spur {
            read_spur_body(&mut stream, &header)?
        } else {
            read_v3_body(&mut stream, &header)?
        };

        let handles = space.reserve_handles(chunks.len());
        let mut address_to_handle = HashMap::with_capacity(chunks.len());
        for (chunk, &handle) in chunks.iter().zip(&handles) {
            address_to_handle.insert(chunk.address, handle);
        }

        // By convention the first three objects in address order are
        // nil/false/true -- rebinding before any slot gets filled in keeps
        // every `nil`-fallback produced below consistent with the roots
        // installed at the end of the load.
        let nil_h = handles.first().copied().unwrap_or_else(|| space.nil_handle());
        let false_h = handles.get(1).copied().unwrap_or(nil_h);
        let true_h = handles.get(2).copied().unwrap_or(nil_h);
        space.rebind_constants(nil_h, true_h, false_h);

        let mut generics: Vec<GenericObject> = chunks
            .into_iter()
            .zip(handles.iter())
            .map(|(chunk, &handle)| GenericObject::init(chunk, handle))
            .collect();

        let no_compact_classes = vec![None; crate::space::COMPACT_CLASS_TABLE_SIZE];
        for g in generics.iter_mut() {
            g.init_w_object(is_spur, &address_to_handle, &no_compact_classes);
            let obj = ObjectFactory::build(&space, g, is_spur, &address_to_handle)?;
            space.overwrite(g.handle, obj);
        }

        let special_handle = address_to_handle.get(&header.special_objects_oop).copied();
        let mut special_objects = Vec::new();
        let mut compact_classes = no_compact_classes;
        if let Some(sh) = special_handle {
            let len = space.size_of(sh)?;
            for i in 0..len {
                special_objects.push(space.fetch_slot(sh, i)?);
            }
            if !is_spur {
                compact_classes = HeaderParser::build_compact_class_table(&space, sh)?;
            }
        }

        // v3 class resolution needed the compact-class table, which in turn
        // needed every object materialized -- now that both exist, patch
        // each v3 object's class field in a second pass.
        if !is_spur {
            for g in generics.iter_mut() {
                g.init_w_object(false, &address_to_handle, &compact_classes);
                let resolved = g.class_handle(&space);
                space.set_class(g.handle, resolved);
            }
        }

        space.install_roots(nil_h, true_h, false_h, special_objects, compact_classes);

        let root = special_handle.unwrap_or_else(|| handles.last().copied().unwrap_or(nil_h));
        Ok(LoadedImage { space, root })
    }
}

/// v3 bodies are a flat run of chunks with no segmentation; read until the
/// declared body length is consumed.
fn read_v3_body(stream: &mut BitStream, header: &ImageHeader) -> Result<Vec<Chunk>> {
    let mut chunks = Vec::new();
    let body_start = stream.pos();
    let body_len = header.body_length.max(0) as usize;
    while stream.pos() - body_start < body_len {
        if stream.pos() >= stream.len() {
            break;
        }
        chunks.push(read_v3_chunk(stream)?);
    }
    Ok(chunks)
}

fn read_v3_chunk(stream: &mut BitStream) -> Result<Chunk> {
    let address = stream.pos() as i64;
    let h = HeaderParser::read_v3_object_header(stream, address)?;
    let mut data = Vec::with_capacity(h.size);
    for _ in 0..h.size {
        data.push(stream.next_word()?);
    }
    Ok(Chunk {
        address,
        size: h.size,
        format: h.format,
        class_id: h.compact_class_index as i64,
        class_oop: h.class_oop,
        hash: h.hash,
        data,
        word_size: stream.word_size(),
        big_endian: stream.big_endian(),
    })
}

/// Spur bodies are a chain of segments, each a run of chunks terminated by
/// a bridge qword. A segment's byte length (its own header-supplied
/// `first_segment_size`, or a prior bridge's `next_segment_size`) counts
/// the terminating bridge itself; the inner loop stops one chunk-header
/// early to leave exactly 8 bytes for it.
fn read_spur_body(stream: &mut BitStream, header: &ImageHeader) -> Result<Vec<Chunk>> {
    let mut chunks = Vec::new();
    let mut segment_budget = header.first_segment_size.unwrap_or(0).max(0) as usize;
    loop {
        let segment_start = stream.pos();
        loop {
            let consumed = stream.pos() - segment_start;
            if consumed + 8 >= segment_budget || stream.pos() + 8 > stream.len() {
                break;
            }
            chunks.push(read_spur_chunk(stream)?);
        }
        let bridge = HeaderParser::read_spur_bridge(stream)?;
        if bridge.terminal {
            break;
        }
        segment_budget = bridge.next_segment_size.max(0) as usize;
    }
    Ok(chunks)
}

fn read_spur_chunk(stream: &mut BitStream) -> Result<Chunk> {
    let address = stream.pos() as i64;
    let h = HeaderParser::read_spur_object_header(stream)?;
    let mut data = Vec::with_capacity(h.n_slots);
    for _ in 0..h.n_slots {
        data.push(stream.next_qword()? as i64);
    }
    Ok(Chunk {
        address,
        size: h.n_slots,
        format: h.format,
        class_id: h.class_id,
        class_oop: None,
        hash: h.hash,
        data,
        word_size: 8,
        big_endian: stream.big_endian(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::TERMINAL_BRIDGE_SPAN;
    use crate::model::Object;
    use test_log::test;

    fn v3_header_bytes(body_length: i32, special_objects_oop: i32) -> Vec<u8> {
        let mut bytes = 6502i32.to_be_bytes().to_vec();
        bytes.extend(0i32.to_be_bytes()); // header_size
        bytes.extend(body_length.to_be_bytes());
        bytes.extend(0i32.to_be_bytes()); // old_base_address
        bytes.extend(special_objects_oop.to_be_bytes());
        bytes.extend(0i32.to_be_bytes()); // last_hash
        bytes.extend(0u16.to_be_bytes()); // window_width
        bytes.extend(0u16.to_be_bytes()); // window_height
        bytes.extend(0i32.to_be_bytes()); // full_screen
        bytes.extend(0i32.to_be_bytes()); // extra_memory
        bytes.extend(std::iter::repeat(0u8).take(28)); // pad to 60 bytes post-magic
        bytes
    }

    #[test]
    fn empty_v3_body_loads_with_no_objects() {
        let bytes = v3_header_bytes(0, 0);
        let loaded = Image::load_bytes(bytes, LoadOptions::default()).unwrap();
        assert!(!loaded.space.flags().is_spur);
        assert_eq!(loaded.space.heap_len(), 5);
    }

    /// A 1-word v3 object header: top two bits `0b11`, then
    /// `size(20)@10, format(4)@6, compact_class_index(6)@0`.
    fn v3_one_word_header(size: u32, format: u32, compact_class_index: u32) -> i32 {
        ((0b11u32 << 30) | (size << 10) | (format << 6) | compact_class_index) as i32
    }

    #[test]
    fn compact_class_table_has_31_entries_after_load() {
        // addr 64: a zero-field object other slots point to as a stand-in "class".
        let obj_a_addr = 64i32;
        let mut body = Vec::new();
        body.extend(v3_one_word_header(0, 0, 0).to_be_bytes());

        // addr 68: the 31-entry compact-classes array; slot 0 points at obj_a,
        // every other slot is an unresolved (nil) reference.
        let compact_classes_addr = obj_a_addr + 4;
        body.extend(v3_one_word_header(31, 2, 0).to_be_bytes());
        body.extend(obj_a_addr.to_be_bytes());
        for _ in 1..31 {
            body.extend(0i32.to_be_bytes());
        }

        // addr 196: the special-objects array; slot 28 (COMPACT_CLASSES_ARRAY)
        // points at the compact-classes array above.
        let special_objects_addr = compact_classes_addr + 4 + 31 * 4;
        body.extend(v3_one_word_header(29, 2, 0).to_be_bytes());
        for i in 0..29i32 {
            if i == 28 {
                body.extend(compact_classes_addr.to_be_bytes());
            } else {
                body.extend(0i32.to_be_bytes());
            }
        }

        let body_length = body.len() as i32;
        let mut bytes = v3_header_bytes(body_length, special_objects_addr);
        bytes.extend(body);

        let loaded = Image::load_bytes(bytes, LoadOptions::default()).unwrap();
        assert_eq!(loaded.space.compact_class_table_len(), 31);
        assert!(loaded.space.compact_class(0).is_some());
    }

    fn spur_qword(n_slots: u64, format: u64, hash: u64, class_id: u64) -> u64 {
        (n_slots << 49) | (format << 44) | (hash << 22) | class_id
    }

    fn spur_header_bytes(first_segment_size: i32, special_objects_oop: i32) -> Vec<u8> {
        let mut bytes = 6521i32.to_be_bytes().to_vec();
        bytes.extend(0i32.to_be_bytes()); // header_size
        bytes.extend(0i32.to_be_bytes()); // body_length
        bytes.extend(0i32.to_be_bytes()); // old_base_address
        bytes.extend(special_objects_oop.to_be_bytes());
        bytes.extend(0i32.to_be_bytes()); // last_hash
        bytes.extend(0u16.to_be_bytes()); // window_width
        bytes.extend(0u16.to_be_bytes()); // window_height
        bytes.extend(0i32.to_be_bytes()); // full_screen
        bytes.extend(0i32.to_be_bytes()); // extra_memory
        bytes.extend(0u16.to_be_bytes()); // stack_pages
        bytes.extend(0u16.to_be_bytes()); // cog_code_size
        bytes.extend(0i32.to_be_bytes()); // eden_bytes
        bytes.extend(0u16.to_be_bytes()); // max_ext_sem_tab_size
        bytes.extend(first_segment_size.to_be_bytes());
        bytes.extend(0i32.to_be_bytes()); // free_old_space
        bytes.extend(std::iter::repeat(0u8).take(10)); // pad to 60 bytes post-magic
        bytes
    }

    #[test]
    fn minimal_spur_image_loads_seven_objects() {
        let mut body = Vec::new();
        body.extend(spur_qword(0, 0, 1, 2).to_be_bytes()); // nil
        body.extend(spur_qword(0, 0, 1, 3).to_be_bytes()); // false
        body.extend(spur_qword(0, 0, 1, 4).to_be_bytes()); // true
        body.extend(spur_qword(1, 9, 1, 5).to_be_bytes()); // freelist (word-indexable)
        body.extend(0u64.to_be_bytes()); // freelist's one data word
        body.extend(spur_qword(0, 0, 1, 6).to_be_bytes()); // hidden roots
        body.extend(spur_qword(0, 0, 1, 7).to_be_bytes()); // class table page
        let special_objects_address = 64 + body.len() as i32;
        body.extend(spur_qword(0, 0, 1, 8).to_be_bytes()); // special objects array
        body.extend((TERMINAL_BRIDGE_SPAN as u64).to_be_bytes());
        let first_segment_size = body.len() as i32;

        let mut bytes = spur_header_bytes(first_segment_size, special_objects_address);
        bytes.extend(body);

        let loaded = Image::load_bytes(bytes, LoadOptions::default()).unwrap();
        assert!(loaded.space.flags().is_spur);
        assert_eq!(loaded.space.heap_len(), 5 + 7);
        assert!(loaded.space.is_nil(loaded.space.w_nil()));
        assert_eq!(loaded.space.size_of(loaded.root).unwrap(), 0);
    }

    #[test]
    fn bridge_continues_into_a_second_segment() {
        let seg2_total: i64 = 24;
        let span: i64 = 1000;
        let bridge1_raw = ((seg2_total as u64) << 22) | (span as u64);

        let mut body = Vec::new();
        body.extend(spur_qword(0, 0, 1, 2).to_be_bytes()); // segment 1: a lone object
        body.extend(bridge1_raw.to_be_bytes()); // non-terminal bridge
        body.extend(spur_qword(1, 0, 1, 9).to_be_bytes()); // segment 2: one pointer slot
        body.extend((((42i64) << 1) | 1).to_be_bytes());
        body.extend((TERMINAL_BRIDGE_SPAN as u64).to_be_bytes());
        let first_segment_size = 16i32; // segment 1's object (8) + its bridge (8)

        let mut bytes = spur_header_bytes(first_segment_size, 0);
        bytes.extend(body);

        let loaded = Image::load_bytes(bytes, LoadOptions::default()).unwrap();
        assert_eq!(loaded.space.heap_len(), 5 + 2);
        assert_eq!(
            loaded.space.fetch_slot(loaded.root, 0).unwrap(),
            Object::SmallInteger(42)
        );
    }
}
