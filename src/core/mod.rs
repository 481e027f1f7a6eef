//! Core traits and types for the pullstream library.
//!
//! This module contains the reader/writer contracts, the error and stop
//! types, and the rendezvous primitive that the combinators build on.

pub mod error;
pub mod handshake;
pub mod traits;

// Re-export core items
pub use error::{Error, Result, StopReason};
pub use handshake::Handshake;
pub use traits::{BoxReader, BoxWriter, Chunk, Headers, Reader, ReaderExt, Writer, WriterExt};
