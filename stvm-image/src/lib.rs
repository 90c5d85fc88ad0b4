//! Smalltalk image reader and storage strategy engine.
//!
//! Reads the binary object-memory image format (both the classic v3
//! dialect and the modern Spur dialect) into an in-memory object graph, and
//! hosts the polymorphic per-object slot storage ("storage strategies")
//! that graph's pointer objects use.

mod bitstream;
mod chunk;
mod error;
mod factory;
mod header;
mod image;
mod model;
mod object;
mod shadow;
mod space;
mod strategy;
mod version;

pub use error::ImageErrorKind;
pub use image::{Image, LoadedImage};
pub use model::{
    ByteObject, CompiledMethod, CompiledMethodHeader, HeapObject, Object, ObjectHandle, ObjectHeader,
    PointerObject, WordData, WordObject,
};
pub use space::{LoadOptions, Space, SpaceFlags};
pub use version::{Dialect, Version};
