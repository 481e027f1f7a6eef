//! Source devices: concrete readers that originate data.
//!
//! All devices latch their terminal state: end is sticky, a read error
//! surfaces once, and a stop with an error reason is raised on the next
//! read before the reader goes quiet.

use std::collections::VecDeque;
use std::future::Future;
use std::marker::PhantomData;

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::core::error::{Error, Result, StopReason};
use crate::core::traits::{Headers, Reader};

/// A reader that yields the elements of a vector, one per read.
///
/// By default a read yields to the scheduler before producing, so chains
/// over in-memory data still interleave with their peers; `sync(true)`
/// turns the tick off.
pub struct ArrayReader<T> {
    items: VecDeque<T>,
    sync: bool,
    headers: Option<Headers>,
    done: bool,
    pending: Option<Error>,
}

impl<T> ArrayReader<T> {
    pub fn new(items: Vec<T>) -> Self {
        Self {
            items: items.into(),
            sync: false,
            headers: None,
            done: false,
            pending: None,
        }
    }

    /// Skip the scheduler tick between reads
    pub fn sync(mut self, sync: bool) -> Self {
        self.sync = sync;
        self
    }

    /// Attach framing metadata to this reader
    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = Some(headers);
        self
    }

    /// Number of values not yet read
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[async_trait]
impl<T: Send + 'static> Reader for ArrayReader<T> {
    type Item = T;

    async fn read(&mut self) -> Result<Option<Self::Item>> {
        if let Some(e) = self.pending.take() {
            self.done = true;
            return Err(e);
        }
        if self.done {
            return Ok(None);
        }
        if !self.sync {
            tokio::task::yield_now().await;
        }
        match self.items.pop_front() {
            Some(item) => Ok(Some(item)),
            None => {
                self.done = true;
                Ok(None)
            }
        }
    }

    async fn stop(&mut self, reason: StopReason) -> Result<()> {
        if self.done || self.pending.is_some() {
            return Ok(());
        }
        self.items.clear();
        match reason.surface() {
            Some(e) => self.pending = Some(e),
            None => self.done = true,
        }
        Ok(())
    }

    fn headers(&self) -> Option<&Headers> {
        self.headers.as_ref()
    }
}

/// A reader that drains any iterator, including unbounded ones.
pub struct IterReader<I> {
    iter: I,
    done: bool,
    pending: Option<Error>,
}

impl<I: Iterator> IterReader<I> {
    pub fn new(iter: I) -> Self {
        Self {
            iter,
            done: false,
            pending: None,
        }
    }
}

#[async_trait]
impl<I> Reader for IterReader<I>
where
    I: Iterator + Send,
    I::Item: Send + 'static,
{
    type Item = I::Item;

    async fn read(&mut self) -> Result<Option<Self::Item>> {
        if let Some(e) = self.pending.take() {
            self.done = true;
            return Err(e);
        }
        if self.done {
            return Ok(None);
        }
        match self.iter.next() {
            Some(item) => Ok(Some(item)),
            None => {
                self.done = true;
                Ok(None)
            }
        }
    }

    async fn stop(&mut self, reason: StopReason) -> Result<()> {
        if self.done || self.pending.is_some() {
            return Ok(());
        }
        match reason.surface() {
            Some(e) => self.pending = Some(e),
            None => self.done = true,
        }
        Ok(())
    }
}

/// Chunk sizing policy for [`StringReader`] and [`BufferReader`].
pub enum ChunkSize {
    /// Every chunk has the same size
    Fixed(usize),
    /// Each chunk asks the closure for its size (randomized chunking in
    /// tests, for example)
    Fn(Box<dyn FnMut() -> usize + Send>),
}

impl ChunkSize {
    fn next_size(&mut self) -> usize {
        let size = match self {
            ChunkSize::Fixed(n) => *n,
            ChunkSize::Fn(f) => f(),
        };
        size.max(1)
    }
}

impl Default for ChunkSize {
    fn default() -> Self {
        ChunkSize::Fixed(1024)
    }
}

impl From<usize> for ChunkSize {
    fn from(n: usize) -> Self {
        ChunkSize::Fixed(n)
    }
}

/// A reader that slices a string into chunks (default 1024 bytes,
/// shortened where needed to keep chunks on character boundaries).
pub struct StringReader {
    data: String,
    pos: usize,
    chunk: ChunkSize,
    headers: Option<Headers>,
    done: bool,
    pending: Option<Error>,
}

impl StringReader {
    pub fn new(data: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            pos: 0,
            chunk: ChunkSize::default(),
            headers: None,
            done: false,
            pending: None,
        }
    }

    pub fn chunk_size(mut self, chunk: impl Into<ChunkSize>) -> Self {
        self.chunk = chunk.into();
        self
    }

    /// Chunk sizes drawn from a closure
    pub fn chunk_size_fn(mut self, f: impl FnMut() -> usize + Send + 'static) -> Self {
        self.chunk = ChunkSize::Fn(Box::new(f));
        self
    }

    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = Some(headers);
        self
    }
}

#[async_trait]
impl Reader for StringReader {
    type Item = String;

    async fn read(&mut self) -> Result<Option<Self::Item>> {
        if let Some(e) = self.pending.take() {
            self.done = true;
            return Err(e);
        }
        if self.done || self.pos >= self.data.len() {
            self.done = true;
            return Ok(None);
        }
        let size = self.chunk.next_size();
        let mut end = (self.pos + size).min(self.data.len());
        while !self.data.is_char_boundary(end) {
            end -= 1;
        }
        if end <= self.pos {
            // chunk size landed inside a single multi-byte character
            end = self.pos + 1;
            while end < self.data.len() && !self.data.is_char_boundary(end) {
                end += 1;
            }
        }
        let chunk = self.data[self.pos..end].to_string();
        self.pos = end;
        Ok(Some(chunk))
    }

    async fn stop(&mut self, reason: StopReason) -> Result<()> {
        if self.done || self.pending.is_some() {
            return Ok(());
        }
        self.pos = self.data.len();
        match reason.surface() {
            Some(e) => self.pending = Some(e),
            None => self.done = true,
        }
        Ok(())
    }

    fn headers(&self) -> Option<&Headers> {
        self.headers.as_ref()
    }
}

/// A reader that slices a byte buffer into chunks (default 1024 bytes).
pub struct BufferReader {
    data: Vec<u8>,
    pos: usize,
    chunk: ChunkSize,
    headers: Option<Headers>,
    done: bool,
    pending: Option<Error>,
}

impl BufferReader {
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: data.into(),
            pos: 0,
            chunk: ChunkSize::default(),
            headers: None,
            done: false,
            pending: None,
        }
    }

    pub fn chunk_size(mut self, chunk: impl Into<ChunkSize>) -> Self {
        self.chunk = chunk.into();
        self
    }

    pub fn chunk_size_fn(mut self, f: impl FnMut() -> usize + Send + 'static) -> Self {
        self.chunk = ChunkSize::Fn(Box::new(f));
        self
    }

    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = Some(headers);
        self
    }
}

#[async_trait]
impl Reader for BufferReader {
    type Item = Vec<u8>;

    async fn read(&mut self) -> Result<Option<Self::Item>> {
        if let Some(e) = self.pending.take() {
            self.done = true;
            return Err(e);
        }
        if self.done || self.pos >= self.data.len() {
            self.done = true;
            return Ok(None);
        }
        let size = self.chunk.next_size();
        let end = (self.pos + size).min(self.data.len());
        let chunk = self.data[self.pos..end].to_vec();
        self.pos = end;
        Ok(Some(chunk))
    }

    async fn stop(&mut self, reason: StopReason) -> Result<()> {
        if self.done || self.pending.is_some() {
            return Ok(());
        }
        self.pos = self.data.len();
        match reason.surface() {
            Some(e) => self.pending = Some(e),
            None => self.done = true,
        }
        Ok(())
    }

    fn headers(&self) -> Option<&Headers> {
        self.headers.as_ref()
    }
}

/// Release hook for [`GenericReader`], invoked at most once.
pub type StopFn = Box<dyn FnMut(StopReason) -> BoxFuture<'static, Result<()>> + Send>;

/// A reader built from an effectful read closure and an optional release
/// closure.
///
/// The wrapper supplies the protocol obligations the closures do not have
/// to care about: end-stickiness, stop-idempotence and the error latch.
/// The release closure runs exactly once — on stop, or implicitly when
/// the closure reports end or fails.
pub struct GenericReader<F> {
    read_fn: F,
    stop_fn: Option<StopFn>,
    headers: Option<Headers>,
    done: bool,
    stopped: bool,
    pending: Option<Error>,
}

impl<F> GenericReader<F> {
    pub fn new(read_fn: F) -> Self {
        Self {
            read_fn,
            stop_fn: None,
            headers: None,
            done: false,
            stopped: false,
            pending: None,
        }
    }

    /// Attach a release closure invoked when the reader terminates
    pub fn with_stop<S, Fut>(mut self, mut stop_fn: S) -> Self
    where
        S: FnMut(StopReason) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.stop_fn = Some(Box::new(move |reason| Box::pin(stop_fn(reason))));
        self
    }

    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = Some(headers);
        self
    }

    async fn release(&mut self, reason: StopReason) -> Result<()> {
        match self.stop_fn.take() {
            Some(mut f) => f(reason).await,
            None => Ok(()),
        }
    }
}

#[async_trait]
impl<F, Fut, T> Reader for GenericReader<F>
where
    F: FnMut() -> Fut + Send,
    Fut: Future<Output = Result<Option<T>>> + Send,
    T: Send + 'static,
{
    type Item = T;

    async fn read(&mut self) -> Result<Option<Self::Item>> {
        if let Some(e) = self.pending.take() {
            self.done = true;
            return Err(e);
        }
        if self.done {
            return Ok(None);
        }
        match (self.read_fn)().await {
            Ok(Some(item)) => Ok(Some(item)),
            Ok(None) => {
                // end through normal reads releases like stop(None)
                self.done = true;
                self.release(StopReason::None).await?;
                Ok(None)
            }
            Err(e) => {
                self.done = true;
                let _ = self.release(StopReason::error(e.clone())).await;
                Err(e)
            }
        }
    }

    async fn stop(&mut self, reason: StopReason) -> Result<()> {
        if self.stopped || self.done {
            return Ok(());
        }
        self.stopped = true;
        match reason.surface() {
            Some(e) => self.pending = Some(e),
            None => self.done = true,
        }
        self.release(reason).await
    }

    fn headers(&self) -> Option<&Headers> {
        self.headers.as_ref()
    }
}

/// A reader that is already at end of stream.
pub struct EmptyReader<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> EmptyReader<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for EmptyReader<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T: Send + 'static> Reader for EmptyReader<T> {
    type Item = T;

    async fn read(&mut self) -> Result<Option<Self::Item>> {
        Ok(None)
    }

    async fn stop(&mut self, _reason: StopReason) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipe::PipeExt;

    #[tokio::test]
    async fn array_reader_drains_and_sticks() {
        let mut reader = ArrayReader::new(vec![1, 2, 3]);
        assert_eq!(reader.read().await.unwrap(), Some(1));
        assert_eq!(reader.read().await.unwrap(), Some(2));
        assert_eq!(reader.read().await.unwrap(), Some(3));
        assert_eq!(reader.read().await.unwrap(), None);
        assert_eq!(reader.read().await.unwrap(), None);
    }

    #[tokio::test]
    async fn array_reader_stop_with_error_raises_once() {
        let mut reader = ArrayReader::new(vec![1, 2, 3]);
        assert_eq!(reader.read().await.unwrap(), Some(1));
        reader
            .stop(StopReason::error(Error::custom("abandoned")))
            .await
            .unwrap();
        assert!(reader.read().await.is_err());
        assert_eq!(reader.read().await.unwrap(), None);
    }

    #[tokio::test]
    async fn string_reader_chunks_on_char_boundaries() {
        let text = "héllo wörld".to_string();
        let chunks = StringReader::new(text.clone())
            .chunk_size(4)
            .to_array()
            .await
            .unwrap();
        assert!(chunks.iter().all(|c| !c.is_empty()));
        assert_eq!(chunks.concat(), text);
    }

    #[tokio::test]
    async fn buffer_reader_chunking() {
        let chunks = BufferReader::new(vec![0u8; 10])
            .chunk_size(4)
            .to_array()
            .await
            .unwrap();
        assert_eq!(
            chunks.iter().map(Vec::len).collect::<Vec<_>>(),
            vec![4, 4, 2]
        );
    }

    #[tokio::test]
    async fn generic_reader_releases_once_on_end() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let released = Arc::new(AtomicUsize::new(0));
        let released_probe = released.clone();
        let mut left = 2;
        let mut reader = GenericReader::new(move || {
            let out = if left > 0 {
                left -= 1;
                Some(left)
            } else {
                None
            };
            async move { Ok(out) }
        })
        .with_stop(move |_reason| {
            let released = released_probe.clone();
            async move {
                released.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        while reader.read().await.unwrap().is_some() {}
        assert_eq!(reader.read().await.unwrap(), None);
        reader.stop(StopReason::None).await.unwrap();
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn empty_reader_is_end() {
        let mut reader = EmptyReader::<u32>::new();
        assert_eq!(reader.read().await.unwrap(), None);
    }
}
