//! Byte-oriented facades over chunk streams.
//!
//! [`ByteReader`] turns any reader of byte chunks into an exact-length
//! byte source with peeking, push-back and numeric field helpers;
//! [`ByteWriter`] is the symmetric buffered producer of byte chunks.

pub mod reader;
pub mod writer;

pub use reader::ByteReader;
pub use writer::{ByteWriter, DEFAULT_BUF_SIZE};
