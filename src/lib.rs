//! # Pull-based streaming pipelines for Rust
//!
//! This crate composes lazy data producers (*readers*) and consumers
//! (*writers*) into chains that transport, transform, fan out, fan in and
//! parallelize streams of typed values — with deterministic resource
//! release on early termination.
//!
//! ## Core Concepts
//!
//! - **Reader**: pulled by its downstream; `read` yields the next value
//!   or end, `stop` releases the upstream early
//! - **Writer**: pushed to by its upstream; `write(None)` closes it
//! - **Combinators**: chain builders that preserve both contracts
//! - **Stop reasons**: `None` detaches a branch, `Silent` ends peers
//!   quietly, `Error(e)` aborts them
//!
//! Backpressure is implicit: nothing is pulled until the sink asks.
//! Buffering only happens where it is asked for (`buffer`, `queue`, the
//! per-branch queues of a fan-out).
//!
//! ## Example
//!
//! ```rust
//! use pullstream::prelude::*;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<()> {
//!     let odd_squares = IterReader::new(0i64..)
//!         .filter(|n| n % 2 == 1)
//!         .map(|n| n * n)
//!         .limit(4)
//!         .to_array()
//!         .await?;
//!     assert_eq!(odd_squares, vec![1, 9, 25, 49]);
//!     Ok(())
//! }
//! ```

pub mod binary;
pub mod combinators;
pub mod core;
pub mod fanin;
pub mod fanout;
pub mod pipe;
pub mod query;
pub mod queue;
pub mod sinks;
pub mod sources;

// Re-export commonly used items
pub mod prelude {
    pub use crate::binary::{ByteReader, ByteWriter};
    pub use crate::core::error::{Error, Result, StopReason};
    pub use crate::core::traits::{
        BoxReader, BoxWriter, Chunk, Headers, Reader, ReaderExt, Writer, WriterExt,
    };
    pub use crate::fanin::{Dequeue, Join, Parallel, ParallelOptions, RoundRobin};
    pub use crate::fanout::{dup, fork, FanBranch, Fork, ForkConsumer, Tee};
    pub use crate::pipe::PipeExt;
    pub use crate::query::Query;
    pub use crate::queue::{queue, QueueReader, QueueWriter};
    pub use crate::sinks::{ArrayWriter, BufferWriter, GenericWriter, NullWriter, StringWriter};
    pub use crate::sources::{
        ArrayReader, BufferReader, ChunkSize, EmptyReader, GenericReader, IterReader, StringReader,
    };
}

// Re-export the main contract surface at the crate root
pub use crate::core::error::{Error, Result, StopReason};
pub use crate::core::traits::{BoxReader, BoxWriter, Reader, ReaderExt, Writer, WriterExt};
pub use crate::pipe::PipeExt;

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
