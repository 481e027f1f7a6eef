//! Core traits for the pull protocol.
//!
//! A [`Reader`] is pulled by its downstream; a [`Writer`] is pushed to by
//! its upstream. All data movement is driven by the sink pulling values
//! through a chain, so backpressure is implicit: nothing is produced until
//! the sink asks.

use std::collections::HashMap;
use std::future::Future;

use async_trait::async_trait;

use crate::combinators::buffer::Buffer;
use crate::combinators::transform::{Transform, TransformReader, TransformWriter};
use crate::combinators::{
    Concat, Filter, Limit, Map, MapResult, Peekable, Skip, TakeUntil, TakeWhile, Then,
};
use crate::core::error::{Result, StopReason};
use crate::fanin::{Parallel, ParallelOptions};
use crate::fanout::{dup, fork, FanBranch, Fork, ForkConsumer, Tee};
use crate::queue::QueueReader;
use crate::sinks::Contramap;

/// Opaque framing metadata attached to a reader by devices that carry it
/// (sub-stream parsers, protocol wrappers). Combinators pass it through
/// unchanged.
pub type Headers = HashMap<String, String>;

/// A type-erased reader.
pub type BoxReader<T> = Box<dyn Reader<Item = T>>;

/// A type-erased writer.
pub type BoxWriter<T> = Box<dyn Writer<Item = T>>;

/// The pull side of the protocol.
///
/// `read` yields the next value, or `None` once the stream has ended. End
/// is sticky: after the first `None` every later read yields `None` again.
/// A read error surfaces exactly once; reads after it yield end.
///
/// `stop` asks the upstream chain to release its resources early. It is
/// idempotent — only the first call propagates — and it returns after the
/// upstream has acknowledged the release. After `stop(None | Silent)`
/// reads yield end; after `stop(Error(e))` the next read fails with `e`.
///
/// Taking `&mut self` is what enforces the at-most-one-live-read rule:
/// callers must serialize their pulls.
///
/// # Examples
///
/// ```rust
/// use async_trait::async_trait;
/// use pullstream::{Reader, Result, StopReason};
///
/// struct Counter {
///     next: u64,
///     max: u64,
/// }
///
/// #[async_trait]
/// impl Reader for Counter {
///     type Item = u64;
///
///     async fn read(&mut self) -> Result<Option<u64>> {
///         if self.next < self.max {
///             self.next += 1;
///             Ok(Some(self.next - 1))
///         } else {
///             Ok(None) // end of stream
///         }
///     }
///
///     async fn stop(&mut self, _reason: StopReason) -> Result<()> {
///         self.next = self.max;
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait Reader: Send {
    /// The type of values this reader yields
    type Item: Send + 'static;

    /// Pull the next value, or `None` at end of stream.
    async fn read(&mut self) -> Result<Option<Self::Item>>;

    /// Ask the upstream chain to terminate and release its resources.
    async fn stop(&mut self, reason: StopReason) -> Result<()>;

    /// Framing metadata attached by the underlying device, if any.
    fn headers(&self) -> Option<&Headers> {
        None
    }
}

#[async_trait]
impl<R: Reader + ?Sized> Reader for Box<R> {
    type Item = R::Item;

    async fn read(&mut self) -> Result<Option<Self::Item>> {
        (**self).read().await
    }

    async fn stop(&mut self, reason: StopReason) -> Result<()> {
        (**self).stop(reason).await
    }

    fn headers(&self) -> Option<&Headers> {
        (**self).headers()
    }
}

/// The push side of the protocol.
///
/// `write(Some(v))` consumes a value; `write(None)` marks end of stream.
/// Writing a value after end is a protocol violation and the writer stays
/// in that failed state.
///
/// A writer driven by [`pipe`](crate::pipe::PipeExt::pipe) can request
/// early termination of its chain by returning
/// [`Error::Stopped`](crate::core::error::Error::Stopped) with a `None` or
/// `Silent` reason; the driver treats that as a graceful stop rather than
/// a failure.
#[async_trait]
pub trait Writer: Send {
    /// The type of values this writer accepts
    type Item: Send + 'static;

    /// Accept the next value, or close the writer with `None`.
    async fn write(&mut self, item: Option<Self::Item>) -> Result<()>;

    /// Accept a single value and close, in one call.
    async fn write_all(&mut self, item: Self::Item) -> Result<()> {
        self.write(Some(item)).await?;
        self.write(None).await
    }

    /// Abort the writer. The default simply closes; devices override this
    /// to release resources without flushing.
    async fn stop(&mut self, reason: StopReason) -> Result<()> {
        let _ = reason;
        self.write(None).await
    }
}

#[async_trait]
impl<W: Writer + ?Sized> Writer for Box<W> {
    type Item = W::Item;

    async fn write(&mut self, item: Option<Self::Item>) -> Result<()> {
        (**self).write(item).await
    }

    async fn stop(&mut self, reason: StopReason) -> Result<()> {
        (**self).stop(reason).await
    }
}

/// A value type that can be concatenated from chunks, used by
/// [`read_all`](crate::pipe::PipeExt::read_all) and the binary helpers.
pub trait Chunk: Send + 'static {
    /// The empty accumulator
    fn empty() -> Self;

    /// Append another chunk to this one
    fn append(&mut self, other: Self);
}

impl Chunk for String {
    fn empty() -> Self {
        String::new()
    }

    fn append(&mut self, other: Self) {
        self.push_str(&other);
    }
}

impl Chunk for Vec<u8> {
    fn empty() -> Self {
        Vec::new()
    }

    fn append(&mut self, mut other: Self) {
        self.extend(other.drain(..));
    }
}

/// Extension trait providing the chain-building combinators.
///
/// Every combinator takes the upstream by value, implements [`Reader`] in
/// terms of the upstream's `read`, propagates `stop`, and passes headers
/// through unchanged.
pub trait ReaderExt: Reader + Sized {
    /// Transform each value through a function
    fn map<F, U>(self, f: F) -> Map<Self, F>
    where
        F: FnMut(Self::Item) -> U + Send,
        U: Send + 'static,
    {
        Map::new(self, f)
    }

    /// Transform each value through a fallible function that also receives
    /// the zero-based input index; a mapper failure surfaces as the next
    /// read error and stops the upstream
    fn map_result<F, U>(self, f: F) -> MapResult<Self, F>
    where
        F: FnMut(Self::Item, usize) -> Result<U> + Send,
        U: Send + 'static,
    {
        MapResult::new(self, f)
    }

    /// Transform each value through an asynchronous function
    fn then<F, Fut, U>(self, f: F) -> Then<Self, F>
    where
        F: FnMut(Self::Item) -> Fut + Send,
        Fut: Future<Output = Result<U>> + Send,
        U: Send + 'static,
    {
        Then::new(self, f)
    }

    /// Drop values that do not match the predicate.
    ///
    /// A [`Query`](crate::query::Query) can be used here through
    /// [`Query::predicate`](crate::query::Query::predicate).
    fn filter<F>(self, predicate: F) -> Filter<Self, F>
    where
        F: FnMut(&Self::Item) -> bool + Send,
    {
        Filter::new(self, predicate)
    }

    /// Deliver values while the predicate holds; the first non-matching
    /// value ends the stream and stops the upstream
    fn take_while<F>(self, predicate: F) -> TakeWhile<Self, F>
    where
        F: FnMut(&Self::Item) -> bool + Send,
    {
        TakeWhile::new(self, predicate, StopReason::None)
    }

    /// Like [`take_while`](ReaderExt::take_while), forwarding the given
    /// reason to the upstream stop
    fn take_while_with<F>(self, predicate: F, reason: StopReason) -> TakeWhile<Self, F>
    where
        F: FnMut(&Self::Item) -> bool + Send,
    {
        TakeWhile::new(self, predicate, reason)
    }

    /// Deliver values until the predicate first matches; the matching
    /// value ends the stream and stops the upstream
    fn take_until<F>(self, predicate: F) -> TakeUntil<Self, F>
    where
        F: FnMut(&Self::Item) -> bool + Send,
    {
        TakeUntil::new(self, predicate, StopReason::None)
    }

    /// Like [`take_until`](ReaderExt::take_until), forwarding the given
    /// reason to the upstream stop
    fn take_until_with<F>(self, predicate: F, reason: StopReason) -> TakeUntil<Self, F>
    where
        F: FnMut(&Self::Item) -> bool + Send,
    {
        TakeUntil::new(self, predicate, reason)
    }

    /// Deliver at most `n` values, then stop the upstream
    fn limit(self, n: usize) -> Limit<Self> {
        Limit::new(self, n, StopReason::None)
    }

    /// Like [`limit`](ReaderExt::limit), forwarding the given reason to
    /// the upstream stop
    fn limit_with(self, n: usize, reason: StopReason) -> Limit<Self> {
        Limit::new(self, n, reason)
    }

    /// Drop the first `n` values, consumed lazily on the first read
    fn skip(self, n: usize) -> Skip<Self> {
        Skip::new(self, n)
    }

    /// Exhaust this reader, then each of `others` in order
    fn concat(self, others: Vec<BoxReader<Self::Item>>) -> Concat<Self::Item>
    where
        Self: 'static,
    {
        Concat::new(Box::new(self), others)
    }

    /// Add `peek` and `unread` on top of this reader
    fn peekable(self) -> Peekable<Self> {
        Peekable::new(self)
    }

    /// Eagerly prefetch up to `max` values ahead of consumer demand.
    ///
    /// Must be called from within a tokio runtime; the prefetch task
    /// starts immediately.
    fn buffer(self, max: usize) -> Buffer<Self::Item>
    where
        Self: 'static,
    {
        Buffer::new(self, max)
    }

    /// Run a cooperative task that reads from this chain and emits
    /// arbitrary values downstream through a one-slot rendezvous.
    ///
    /// The task starts lazily on the first read. When it returns, the
    /// composite reader ends; if it fails, the error is emitted after any
    /// value already handed over.
    fn transform<F, Fut, U>(self, f: F) -> Transform<Self, U>
    where
        Self: 'static,
        F: FnOnce(TransformReader<Self>, TransformWriter<U>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
        U: Send + 'static,
    {
        Transform::new(self, Box::new(move |r, w| Box::pin(f(r, w))))
    }

    /// Copy every value to a secondary writer before handing it
    /// downstream
    fn tee<W>(self, secondary: W) -> Tee<Self, W>
    where
        W: Writer<Item = Self::Item>,
        Self::Item: Clone,
    {
        Tee::new(self, secondary)
    }

    /// Split into exactly two readers sharing this upstream, each with its
    /// own queue. Must be called from within a tokio runtime.
    fn dup(self) -> (FanBranch<Self::Item>, FanBranch<Self::Item>)
    where
        Self: 'static,
        Self::Item: Clone,
    {
        dup(self)
    }

    /// Split into one branch per consumer function; each function maps a
    /// private branch reader to a transformed reader. The aggregate
    /// exposes the branch readers and the fan-in constructors. Must be
    /// called from within a tokio runtime.
    fn fork<U>(self, consumers: Vec<ForkConsumer<Self::Item, U>>) -> Fork<U>
    where
        Self: 'static,
        Self::Item: Clone,
        U: Send + 'static,
    {
        fork(self, consumers)
    }

    /// Dispatch values across `count` worker chains built by `f`,
    /// reassembling outputs in input order
    fn parallel<F, U>(self, count: usize, f: F) -> Parallel<U>
    where
        Self: 'static,
        F: FnMut(QueueReader<Self::Item>) -> BoxReader<U>,
        U: Send + 'static,
    {
        Parallel::new(Box::new(self), ParallelOptions::preserve_order(count), f)
    }

    /// Like [`parallel`](ReaderExt::parallel) with explicit options
    fn parallel_with<F, U>(self, options: ParallelOptions, f: F) -> Parallel<U>
    where
        Self: 'static,
        F: FnMut(QueueReader<Self::Item>) -> BoxReader<U>,
        U: Send + 'static,
    {
        Parallel::new(Box::new(self), options, f)
    }

    /// Erase the concrete chain type
    fn boxed(self) -> BoxReader<Self::Item>
    where
        Self: 'static,
    {
        Box::new(self)
    }
}

impl<R: Reader> ReaderExt for R {}

/// Extension trait for writers
pub trait WriterExt: Writer + Sized {
    /// Create a writer that maps each value through a function before
    /// handing it to this writer
    fn contramap<F, T>(self, f: F) -> Contramap<Self, F, T>
    where
        F: FnMut(T) -> Self::Item + Send,
        T: Send + 'static,
    {
        Contramap::new(self, f)
    }
}

impl<W: Writer> WriterExt for W {}
