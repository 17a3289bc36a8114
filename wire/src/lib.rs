//! The client/server message grammar: length/tag-framed messages over a
//! reliable byte stream, plus the serialized metadata records they carry.

pub mod frame;
pub mod metadata;
pub mod primitive;

pub use frame::{FrameError, Tag};
