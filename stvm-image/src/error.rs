//! Structured error kinds layered on top of `stvm_base::Error`.
//!
//! `stvm_base::Error` only knows how to wrap an arbitrary `std::error::Error`
//! with a backtrace; it has no notion of *which* thing went wrong. Image
//! reading needs that, both so callers can match on failure kind and so
//! messages carry position/oop context. `ImageErrorKind` is that layer: it
//! implements `std::error::Error`/`Display` the same way the base crate's
//! `SimpleErr` does, and flows into `stvm_base::Error` through the same
//! blanket `From` impl.

use std::fmt;

use stvm_base::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageErrorKind {
    BadMagic,
    TruncatedImage { pos: u64 },
    CorruptImage { details: String },
    UnsupportedVersion { magic: i64 },
    UnknownFormat { format: u8 },
    DanglingReference { oop: i64 },
    UnexpectedForwarder { oop: i64 },
    TooManyObservers,
    StorageMismatch { expected: &'static str, index: usize },
    PrimitiveFailed { primitive: i64 },
}

impl fmt::Display for ImageErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageErrorKind::BadMagic => write!(f, "image does not start with a known magic number"),
            ImageErrorKind::TruncatedImage { pos } => {
                write!(f, "image truncated at byte offset {pos}")
            }
            ImageErrorKind::CorruptImage { details } => write!(f, "corrupt image: {details}"),
            ImageErrorKind::UnsupportedVersion { magic } => {
                write!(f, "unsupported image version (magic {magic})")
            }
            ImageErrorKind::UnknownFormat { format } => {
                write!(f, "unknown object format {format}")
            }
            ImageErrorKind::DanglingReference { oop } => {
                write!(f, "dangling reference to oop {oop:#x}")
            }
            ImageErrorKind::UnexpectedForwarder { oop } => {
                write!(f, "unexpected forwarder object at oop {oop:#x}")
            }
            ImageErrorKind::TooManyObservers => {
                write!(f, "attempted to register a second observer on a shadow")
            }
            ImageErrorKind::StorageMismatch { expected, index } => {
                write!(f, "storage strategy expected {expected} at index {index}")
            }
            ImageErrorKind::PrimitiveFailed { primitive } => {
                write!(f, "primitive {primitive} failed")
            }
        }
    }
}

impl std::error::Error for ImageErrorKind {}

pub fn image_err(kind: ImageErrorKind) -> Error {
    Error::from(kind)
}
