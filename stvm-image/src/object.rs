//! `GenericObject`: the lazy graph node that sits between a decoded
//! [`Chunk`] and its materialized [`crate::model::HeapObject`].
//!
//! Grounded in `submerge-coldb`'s two-pass chunk-then-resolve reader shape:
//! a first pass turns the byte stream into chunks addressed by their image
//! position, a second pass walks those chunks again now that every address
//! a slot might reference has a handle reserved for it.

use std::collections::HashMap;

use crate::chunk::Chunk;
use crate::model::{Object, ObjectHandle};
use crate::space::Space;

/// Binds one decoded chunk to the handle reserved for it, and carries the
/// class resolution worked out once every chunk in the segment is known.
#[derive(Debug)]
pub struct GenericObject {
    pub chunk: Chunk,
    pub handle: ObjectHandle,
    class_handle: Option<ObjectHandle>,
}

impl GenericObject {
    /// `init`: bind a decoded chunk to its reserved handle. No class
    /// resolution yet -- that needs the address map, which isn't complete
    /// until every chunk in the segment has been read.
    pub fn init(chunk: Chunk, handle: ObjectHandle) -> GenericObject {
        GenericObject {
            chunk,
            handle,
            class_handle: None,
        }
    }

    pub fn address(&self) -> i64 {
        self.chunk.address
    }

    pub fn format(&self) -> u8 {
        self.chunk.format
    }

    pub fn is_weak(&self, is_spur: bool) -> bool {
        self.chunk.is_weak(is_spur)
    }

    /// `init_w_object`: resolve the chunk's class reference now that the
    /// address map is complete.
    ///
    /// v3 classes resolve fully: an explicit 3-word-header class oop takes
    /// precedence, otherwise the compact-class-table index does. Spur's
    /// `class_id` is a class-table-page index; reconstructing that page
    /// would require materializing the hidden-roots object graph, which is
    /// out of depth here, so Spur class resolution is left unresolved
    /// (`None`) and the loader substitutes `nil` -- callers that need a
    /// class id can still read it straight off `chunk.class_id`.
    pub fn init_w_object(
        &mut self,
        is_spur: bool,
        address_to_handle: &HashMap<i64, ObjectHandle>,
        compact_classes: &[Option<ObjectHandle>],
    ) {
        self.class_handle = if is_spur {
            None
        } else if let Some(oop) = self.chunk.class_oop {
            address_to_handle.get(&oop).copied()
        } else {
            compact_classes.get(self.chunk.class_id as usize).copied().flatten()
        };
    }

    pub fn class_handle(&self, space: &Space) -> ObjectHandle {
        self.class_handle.unwrap_or_else(|| space.nil_handle())
    }

    /// `fillin`: translate every raw slot word into a decoded [`Object`],
    /// for non-weak pointer-shaped chunks. An address with no reserved
    /// handle (nothing in this segment claims it) decodes to `nil` rather
    /// than failing the whole load -- images can and do contain slots that
    /// point past what a partial read materialized.
    pub fn fillin(&self, space: &Space, is_spur: bool, address_to_handle: &HashMap<i64, ObjectHandle>) -> Vec<Object> {
        self.chunk
            .data
            .iter()
            .map(|&raw| decode_slot(raw, is_spur, address_to_handle, space))
            .collect()
    }

    /// `fillin_weak`: second pass for format-4/5 (v3/Spur) weak chunks.
    /// Decoding is identical to [`GenericObject::fillin`] -- weakness only
    /// changes which strategy the caller stores the result through.
    pub fn fillin_weak(
        &self,
        space: &Space,
        is_spur: bool,
        address_to_handle: &HashMap<i64, ObjectHandle>,
    ) -> Vec<Object> {
        self.fillin(space, is_spur, address_to_handle)
    }
}

/// A slot's raw word decodes, in order: a tagged `SmallInteger`, a Spur
/// `Character`, or otherwise an oop looked up in the address map (`nil` if
/// the map has nothing for it). Shared with [`crate::factory::ObjectFactory`]
/// for literal-slot decoding, which follows the same rules.
pub(crate) fn decode_slot(raw: i64, is_spur: bool, address_to_handle: &HashMap<i64, ObjectHandle>, space: &Space) -> Object {
    if raw & 1 == 1 {
        return Object::SmallInteger(raw >> 1);
    }
    if is_spur && (raw & 0b11) == 0b10 {
        return Object::Character((raw >> 2) as u32);
    }
    match address_to_handle.get(&raw) {
        Some(&handle) => Object::Pointer(handle),
        None => space.w_nil(),
    }
}
