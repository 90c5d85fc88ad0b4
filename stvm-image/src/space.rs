//! The process-wide registry of well-known objects and the configuration
//! surface for a load.
//!
//! Mutation is internalized behind a `RefCell` so the rest of the crate can
//! thread `&Space` through read *and* write paths uniformly, matching the
//! design's "Space is a context value passed by reference to operations"
//! note -- without that, every strategy/shadow method that might need to
//! allocate (boxing a float) or look up another object's slots (unboxing
//! one) would need a mutable borrow of the whole registry at once.

use std::cell::RefCell;

use stvm_base::Result;
use tracing::debug;

use crate::error::{image_err, ImageErrorKind};
use crate::model::{
    ByteObject, CompiledMethod, CompiledMethodHeader, HeapObject, Object, ObjectHandle,
    ObjectHeader, PointerObject, WordData, WordObject,
};
use crate::shadow::{Shadow, StorageShadow};
use crate::strategy::{Strategy, StrategyKind};

pub const COMPACT_CLASS_TABLE_SIZE: usize = 31;

/// Boolean configuration surface for a loaded image. Supplied once by the
/// caller of [`crate::image::Image::load`] and treated as immutable
/// afterward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpaceFlags {
    pub no_specialized_storage: bool,
    pub is_spur: bool,
    pub omit_printing_raw_bytes: bool,
    pub simulate_numeric_primitives: bool,
    pub headless: bool,
    pub highdpi: bool,
    pub use_plugins: bool,
    pub suppress_process_switch: bool,
    pub run_spy_hacks: bool,
}

impl Default for SpaceFlags {
    fn default() -> Self {
        SpaceFlags {
            no_specialized_storage: false,
            is_spur: false,
            omit_printing_raw_bytes: false,
            simulate_numeric_primitives: false,
            headless: true,
            highdpi: false,
            use_plugins: false,
            suppress_process_switch: false,
            run_spy_hacks: false,
        }
    }
}

/// Caller-supplied configuration for [`crate::image::Image::load`]. A small
/// explicit struct rather than a global.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LoadOptions {
    pub flags: SpaceFlags,
}

struct Registry {
    heap: Vec<HeapObject>,
    nil: ObjectHandle,
    w_true: ObjectHandle,
    w_false: ObjectHandle,
    float_class: ObjectHandle,
    string_class: ObjectHandle,
    special_objects: Vec<Object>,
    compact_classes: Vec<Option<ObjectHandle>>,
}

pub struct Space {
    registry: RefCell<Registry>,
    flags: SpaceFlags,
}

fn bootstrap_pointer(heap: &mut Vec<HeapObject>, hash: i64) -> ObjectHandle {
    let handle = ObjectHandle(heap.len());
    heap.push(HeapObject::Pointer(PointerObject {
        header: ObjectHeader { class: handle, hash },
        shadow: Shadow::Storage(StorageShadow::new(Strategy::AllNil { size: 0 })),
    }));
    handle
}

impl Space {
    pub fn new(options: LoadOptions) -> Space {
        let mut heap = Vec::new();
        let nil = bootstrap_pointer(&mut heap, 1);
        let w_true = bootstrap_pointer(&mut heap, 2);
        let w_false = bootstrap_pointer(&mut heap, 3);
        let float_class = bootstrap_pointer(&mut heap, 9);
        let string_class = bootstrap_pointer(&mut heap, 7);
        let registry = Registry {
            heap,
            nil,
            w_true,
            w_false,
            float_class,
            string_class,
            special_objects: Vec::new(),
            compact_classes: vec![None; COMPACT_CLASS_TABLE_SIZE],
        };
        Space {
            registry: RefCell::new(registry),
            flags: options.flags,
        }
    }

    pub fn flags(&self) -> SpaceFlags {
        self.flags
    }

    // -- well-known objects ------------------------------------------------

    pub fn w_nil(&self) -> Object {
        Object::Pointer(self.registry.borrow().nil)
    }

    pub fn w_true(&self) -> Object {
        Object::Pointer(self.registry.borrow().w_true)
    }

    pub fn w_false(&self) -> Object {
        Object::Pointer(self.registry.borrow().w_false)
    }

    pub fn nil_handle(&self) -> ObjectHandle {
        self.registry.borrow().nil
    }

    pub fn is_nil(&self, v: Object) -> bool {
        v == self.w_nil()
    }

    /// Stored objects are never actually reclaimed by this crate (garbage
    /// collection is the host runtime's job, per the Non-goals); every
    /// handle obtained while a `Space` is alive stays live.
    pub fn is_live(&self, _handle: ObjectHandle) -> bool {
        true
    }

    // -- immediates ---------------------------------------------------------

    pub fn wrap_int(&self, value: i64) -> Object {
        Object::SmallInteger(value)
    }

    pub fn unwrap_int(&self, v: Object) -> Option<i64> {
        v.as_small_integer()
    }

    pub fn wrap_char(&self, codepoint: u32) -> Object {
        Object::Character(codepoint)
    }

    pub fn unwrap_char(&self, v: Object) -> Option<u32> {
        v.as_character()
    }

    // -- boxed floats ---------------------------------------------------------

    /// Floats are boxed heap objects (a single 64-bit word holding the IEEE
    /// bit pattern), never immediates.
    pub fn wrap_float(&self, value: f64) -> Object {
        let mut reg = self.registry.borrow_mut();
        let class = reg.float_class;
        let handle = ObjectHandle(reg.heap.len());
        reg.heap.push(HeapObject::Word(WordObject {
            header: ObjectHeader { class, hash: 0 },
            words: WordData::W64(vec![value.to_bits()]),
        }));
        Object::Pointer(handle)
    }

    pub fn unwrap_float(&self, v: Object) -> Option<f64> {
        let handle = v.as_handle()?;
        let reg = self.registry.borrow();
        match reg.heap.get(handle.index())? {
            HeapObject::Word(WordObject {
                words: WordData::W64(words),
                ..
            }) if words.len() == 1 => Some(f64::from_bits(words[0])),
            _ => None,
        }
    }

    // -- byte strings ---------------------------------------------------------

    pub fn wrap_string(&self, s: &str) -> Object {
        let mut reg = self.registry.borrow_mut();
        let class = reg.string_class;
        let handle = ObjectHandle(reg.heap.len());
        reg.heap.push(HeapObject::Byte(ByteObject {
            header: ObjectHeader { class, hash: 0 },
            bytes: s.as_bytes().to_vec(),
        }));
        Object::Pointer(handle)
    }

    pub fn unwrap_string(&self, v: Object) -> Option<String> {
        let handle = v.as_handle()?;
        let reg = self.registry.borrow();
        match reg.heap.get(handle.index())? {
            HeapObject::Byte(b) => Some(String::from_utf8_lossy(&b.bytes).into_owned()),
            _ => None,
        }
    }

    // -- slot access ----------------------------------------------------------

    pub fn fetch_slot(&self, handle: ObjectHandle, index: usize) -> Result<Object> {
        let reg = self.registry.borrow();
        match reg.heap.get(handle.index()) {
            Some(HeapObject::Pointer(p)) => p.shadow.fetch(self, index),
            Some(_) => Err(image_err(ImageErrorKind::StorageMismatch {
                expected: "pointer object",
                index: handle.index(),
            })),
            None => Err(image_err(ImageErrorKind::DanglingReference {
                oop: handle.index() as i64,
            })),
        }
    }

    /// Detaches the target's shadow before running the store, so a nested
    /// allocation (boxing a float, say) never needs a second mutable borrow
    /// of the same heap while this one is outstanding.
    pub fn store_slot(&self, handle: ObjectHandle, index: usize, v: Object) -> Result<()> {
        let mut taken = {
            let mut reg = self.registry.borrow_mut();
            match reg.heap.get_mut(handle.index()) {
                Some(HeapObject::Pointer(p)) => std::mem::replace(
                    &mut p.shadow,
                    Shadow::Storage(StorageShadow::new(Strategy::AllNil { size: 0 })),
                ),
                Some(_) => {
                    return Err(image_err(ImageErrorKind::StorageMismatch {
                        expected: "pointer object",
                        index: handle.index(),
                    }))
                }
                None => {
                    return Err(image_err(ImageErrorKind::DanglingReference {
                        oop: handle.index() as i64,
                    }))
                }
            }
        };
        let result = taken.store(self, index, v);
        let mut reg = self.registry.borrow_mut();
        if let Some(HeapObject::Pointer(p)) = reg.heap.get_mut(handle.index()) {
            p.shadow = taken;
        }
        result
    }

    pub fn size_of(&self, handle: ObjectHandle) -> Result<usize> {
        let reg = self.registry.borrow();
        reg.heap
            .get(handle.index())
            .map(HeapObject::size)
            .ok_or_else(|| image_err(ImageErrorKind::DanglingReference { oop: handle.index() as i64 }))
    }

    pub fn class_of(&self, handle: ObjectHandle) -> Result<ObjectHandle> {
        let reg = self.registry.borrow();
        reg.heap
            .get(handle.index())
            .map(HeapObject::class)
            .ok_or_else(|| image_err(ImageErrorKind::DanglingReference { oop: handle.index() as i64 }))
    }

    pub fn hash_of(&self, handle: ObjectHandle) -> Result<i64> {
        let reg = self.registry.borrow();
        reg.heap
            .get(handle.index())
            .map(HeapObject::hash)
            .ok_or_else(|| image_err(ImageErrorKind::DanglingReference { oop: handle.index() as i64 }))
    }

    pub fn is_weak(&self, handle: ObjectHandle) -> bool {
        self.registry
            .borrow()
            .heap
            .get(handle.index())
            .map(HeapObject::is_weak)
            .unwrap_or(false)
    }

    // -- allocation (used by the object factory during load) ------------------

    pub fn alloc_pointer_object(
        &self,
        class: ObjectHandle,
        hash: i64,
        slots: Vec<Object>,
        weak: bool,
    ) -> Result<ObjectHandle> {
        let kind = if weak {
            StrategyKind::WeakList
        } else {
            crate::strategy::StrategyFactory::strategy_type_for(self, &slots, weak)
        };
        let mut strategy = Strategy::new_empty_in(self, kind, slots.len());
        for (i, v) in slots.into_iter().enumerate() {
            strategy.raw_store(self, i, v)?;
        }
        let mut reg = self.registry.borrow_mut();
        let handle = ObjectHandle(reg.heap.len());
        reg.heap.push(HeapObject::Pointer(PointerObject {
            header: ObjectHeader { class, hash },
            shadow: Shadow::Storage(StorageShadow::new(strategy)),
        }));
        Ok(handle)
    }

    pub fn alloc_word_object(&self, class: ObjectHandle, hash: i64, words: WordData) -> ObjectHandle {
        let mut reg = self.registry.borrow_mut();
        let handle = ObjectHandle(reg.heap.len());
        reg.heap.push(HeapObject::Word(WordObject {
            header: ObjectHeader { class, hash },
            words,
        }));
        handle
    }

    pub fn alloc_byte_object(&self, class: ObjectHandle, hash: i64, bytes: Vec<u8>) -> ObjectHandle {
        let mut reg = self.registry.borrow_mut();
        let handle = ObjectHandle(reg.heap.len());
        reg.heap.push(HeapObject::Byte(ByteObject {
            header: ObjectHeader { class, hash },
            bytes,
        }));
        handle
    }

    pub fn alloc_compiled_method(
        &self,
        class: ObjectHandle,
        hash: i64,
        method_header: CompiledMethodHeader,
        literals: Vec<Object>,
        bytes: Vec<u8>,
    ) -> ObjectHandle {
        let mut reg = self.registry.borrow_mut();
        let handle = ObjectHandle(reg.heap.len());
        reg.heap.push(HeapObject::CompiledMethod(CompiledMethod {
            header: ObjectHeader { class, hash },
            method_header,
            literals,
            bytes,
        }));
        handle
    }

    /// Reserves `count` fresh handles up front (all pointing at a zero-sized
    /// `AllNil` placeholder), so the two-pass reader can resolve forward
    /// references before every object's real contents are known. The loader
    /// overwrites each placeholder's shadow/class/hash once its chunk fills in.
    pub fn reserve_handles(&self, count: usize) -> Vec<ObjectHandle> {
        let mut reg = self.registry.borrow_mut();
        let nil = reg.nil;
        (0..count)
            .map(|_| {
                let handle = ObjectHandle(reg.heap.len());
                reg.heap.push(HeapObject::Pointer(PointerObject {
                    header: ObjectHeader { class: nil, hash: 0 },
                    shadow: Shadow::Storage(StorageShadow::new(Strategy::AllNil { size: 0 })),
                }));
                handle
            })
            .collect()
    }

    pub fn overwrite(&self, handle: ObjectHandle, obj: HeapObject) {
        let mut reg = self.registry.borrow_mut();
        reg.heap[handle.index()] = obj;
    }

    /// Rebinds `nil`/`true`/`false` to freshly loaded handles before any
    /// slot decoding runs, so every `nil`-fallback produced while filling in
    /// object graph slots already agrees with the handles the rest of the
    /// load will install as roots. Calling this *after* slots have been
    /// decoded would leave already-decoded `nil`s pointing at the stale
    /// bootstrap placeholders from [`Space::new`].
    pub fn rebind_constants(&self, nil: ObjectHandle, w_true: ObjectHandle, w_false: ObjectHandle) {
        let mut reg = self.registry.borrow_mut();
        reg.nil = nil;
        reg.w_true = w_true;
        reg.w_false = w_false;
    }

    pub fn set_class(&self, handle: ObjectHandle, class: ObjectHandle) {
        let mut reg = self.registry.borrow_mut();
        if let Some(obj) = reg.heap.get_mut(handle.index()) {
            let header = match obj {
                HeapObject::Pointer(o) => &mut o.header,
                HeapObject::Word(o) => &mut o.header,
                HeapObject::Byte(o) => &mut o.header,
                HeapObject::CompiledMethod(o) => &mut o.header,
            };
            header.class = class;
        }
    }

    // -- roots, installed once after a successful load -------------------------

    pub fn install_roots(
        &self,
        nil: ObjectHandle,
        w_true: ObjectHandle,
        w_false: ObjectHandle,
        special_objects: Vec<Object>,
        compact_classes: Vec<Option<ObjectHandle>>,
    ) {
        debug!(target: "stvm", count = special_objects.len(), "installing space roots");
        let mut reg = self.registry.borrow_mut();
        reg.nil = nil;
        reg.w_true = w_true;
        reg.w_false = w_false;
        reg.special_objects = special_objects;
        reg.compact_classes = compact_classes;
    }

    pub fn special(&self, index: usize) -> Option<Object> {
        self.registry.borrow().special_objects.get(index).copied()
    }

    pub fn compact_class(&self, index: usize) -> Option<ObjectHandle> {
        self.registry.borrow().compact_classes.get(index).copied().flatten()
    }

    pub fn compact_class_table_len(&self) -> usize {
        self.registry.borrow().compact_classes.len()
    }

    pub fn heap_len(&self) -> usize {
        self.registry.borrow().heap.len()
    }
}
