//! Linear combinators: chain stages that own their upstream and expose the
//! reader contract downstream.
//!
//! Each stage implements `read` in terms of its upstream's `read`,
//! forwards `stop`, and passes headers through unchanged. Stages that
//! terminate the stream themselves (`limit`, `take_while`, `take_until`)
//! issue exactly one upstream stop at the moment they end their
//! downstream, and none if the upstream ended naturally first.

pub mod buffer;
pub mod transform;

use std::collections::VecDeque;
use std::future::Future;

use async_trait::async_trait;

use crate::core::error::{Error, Result, StopReason};
use crate::core::traits::{BoxReader, Headers, Reader};

// Terminal-state bookkeeping shared by the stages in this module: a stop
// with an error reason is raised on the next read, anything else just
// closes the stage.
fn latch(done: &mut bool, pending: &mut Option<Error>, reason: &StopReason) {
    match reason.surface() {
        Some(e) => *pending = Some(e),
        None => *done = true,
    }
}

/// One-to-one transform, produced by [`map`](crate::ReaderExt::map).
pub struct Map<R, F> {
    upstream: R,
    f: F,
    done: bool,
    pending: Option<Error>,
}

impl<R, F> Map<R, F> {
    pub(crate) fn new(upstream: R, f: F) -> Self {
        Self {
            upstream,
            f,
            done: false,
            pending: None,
        }
    }
}

#[async_trait]
impl<R, F, U> Reader for Map<R, F>
where
    R: Reader,
    F: FnMut(R::Item) -> U + Send,
    U: Send + 'static,
{
    type Item = U;

    async fn read(&mut self) -> Result<Option<Self::Item>> {
        if let Some(e) = self.pending.take() {
            self.done = true;
            return Err(e);
        }
        if self.done {
            return Ok(None);
        }
        match self.upstream.read().await? {
            Some(item) => Ok(Some((self.f)(item))),
            None => {
                self.done = true;
                Ok(None)
            }
        }
    }

    async fn stop(&mut self, reason: StopReason) -> Result<()> {
        latch(&mut self.done, &mut self.pending, &reason);
        self.upstream.stop(reason).await
    }

    fn headers(&self) -> Option<&Headers> {
        self.upstream.headers()
    }
}

/// Fallible indexed transform, produced by
/// [`map_result`](crate::ReaderExt::map_result). The index is the
/// zero-based position of the value in the upstream.
pub struct MapResult<R, F> {
    upstream: R,
    f: F,
    index: usize,
    done: bool,
    pending: Option<Error>,
}

impl<R, F> MapResult<R, F> {
    pub(crate) fn new(upstream: R, f: F) -> Self {
        Self {
            upstream,
            f,
            index: 0,
            done: false,
            pending: None,
        }
    }
}

#[async_trait]
impl<R, F, U> Reader for MapResult<R, F>
where
    R: Reader,
    F: FnMut(R::Item, usize) -> Result<U> + Send,
    U: Send + 'static,
{
    type Item = U;

    async fn read(&mut self) -> Result<Option<Self::Item>> {
        if let Some(e) = self.pending.take() {
            self.done = true;
            return Err(e);
        }
        if self.done {
            return Ok(None);
        }
        match self.upstream.read().await? {
            Some(item) => {
                let index = self.index;
                self.index += 1;
                match (self.f)(item, index) {
                    Ok(mapped) => Ok(Some(mapped)),
                    Err(e) => {
                        self.done = true;
                        self.upstream.stop(StopReason::error(e.clone())).await?;
                        Err(e)
                    }
                }
            }
            None => {
                self.done = true;
                Ok(None)
            }
        }
    }

    async fn stop(&mut self, reason: StopReason) -> Result<()> {
        latch(&mut self.done, &mut self.pending, &reason);
        self.upstream.stop(reason).await
    }

    fn headers(&self) -> Option<&Headers> {
        self.upstream.headers()
    }
}

/// Asynchronous one-to-one transform, produced by
/// [`then`](crate::ReaderExt::then).
pub struct Then<R, F> {
    upstream: R,
    f: F,
    done: bool,
    pending: Option<Error>,
}

impl<R, F> Then<R, F> {
    pub(crate) fn new(upstream: R, f: F) -> Self {
        Self {
            upstream,
            f,
            done: false,
            pending: None,
        }
    }
}

#[async_trait]
impl<R, F, Fut, U> Reader for Then<R, F>
where
    R: Reader,
    F: FnMut(R::Item) -> Fut + Send,
    Fut: Future<Output = Result<U>> + Send,
    U: Send + 'static,
{
    type Item = U;

    async fn read(&mut self) -> Result<Option<Self::Item>> {
        if let Some(e) = self.pending.take() {
            self.done = true;
            return Err(e);
        }
        if self.done {
            return Ok(None);
        }
        match self.upstream.read().await? {
            Some(item) => match (self.f)(item).await {
                Ok(mapped) => Ok(Some(mapped)),
                Err(e) => {
                    self.done = true;
                    self.upstream.stop(StopReason::error(e.clone())).await?;
                    Err(e)
                }
            },
            None => {
                self.done = true;
                Ok(None)
            }
        }
    }

    async fn stop(&mut self, reason: StopReason) -> Result<()> {
        latch(&mut self.done, &mut self.pending, &reason);
        self.upstream.stop(reason).await
    }

    fn headers(&self) -> Option<&Headers> {
        self.upstream.headers()
    }
}

/// Drops values that fail the predicate, produced by
/// [`filter`](crate::ReaderExt::filter).
pub struct Filter<R, F> {
    upstream: R,
    predicate: F,
    done: bool,
    pending: Option<Error>,
}

impl<R, F> Filter<R, F> {
    pub(crate) fn new(upstream: R, predicate: F) -> Self {
        Self {
            upstream,
            predicate,
            done: false,
            pending: None,
        }
    }
}

#[async_trait]
impl<R, F> Reader for Filter<R, F>
where
    R: Reader,
    F: FnMut(&R::Item) -> bool + Send,
{
    type Item = R::Item;

    async fn read(&mut self) -> Result<Option<Self::Item>> {
        if let Some(e) = self.pending.take() {
            self.done = true;
            return Err(e);
        }
        if self.done {
            return Ok(None);
        }
        loop {
            match self.upstream.read().await? {
                Some(item) => {
                    if (self.predicate)(&item) {
                        return Ok(Some(item));
                    }
                }
                None => {
                    self.done = true;
                    return Ok(None);
                }
            }
        }
    }

    async fn stop(&mut self, reason: StopReason) -> Result<()> {
        latch(&mut self.done, &mut self.pending, &reason);
        self.upstream.stop(reason).await
    }

    fn headers(&self) -> Option<&Headers> {
        self.upstream.headers()
    }
}

/// Ends the stream on the first value failing the predicate, produced by
/// [`take_while`](crate::ReaderExt::take_while).
pub struct TakeWhile<R, F> {
    upstream: R,
    predicate: F,
    reason: StopReason,
    done: bool,
    pending: Option<Error>,
}

impl<R, F> TakeWhile<R, F> {
    pub(crate) fn new(upstream: R, predicate: F, reason: StopReason) -> Self {
        Self {
            upstream,
            predicate,
            reason,
            done: false,
            pending: None,
        }
    }
}

#[async_trait]
impl<R, F> Reader for TakeWhile<R, F>
where
    R: Reader,
    F: FnMut(&R::Item) -> bool + Send,
{
    type Item = R::Item;

    async fn read(&mut self) -> Result<Option<Self::Item>> {
        if let Some(e) = self.pending.take() {
            self.done = true;
            return Err(e);
        }
        if self.done {
            return Ok(None);
        }
        match self.upstream.read().await? {
            Some(item) if (self.predicate)(&item) => Ok(Some(item)),
            Some(_) => {
                self.done = true;
                self.upstream.stop(self.reason.clone()).await?;
                Ok(None)
            }
            None => {
                self.done = true;
                Ok(None)
            }
        }
    }

    async fn stop(&mut self, reason: StopReason) -> Result<()> {
        latch(&mut self.done, &mut self.pending, &reason);
        self.upstream.stop(reason).await
    }

    fn headers(&self) -> Option<&Headers> {
        self.upstream.headers()
    }
}

/// Ends the stream on the first value matching the predicate, produced by
/// [`take_until`](crate::ReaderExt::take_until).
pub struct TakeUntil<R, F> {
    upstream: R,
    predicate: F,
    reason: StopReason,
    done: bool,
    pending: Option<Error>,
}

impl<R, F> TakeUntil<R, F> {
    pub(crate) fn new(upstream: R, predicate: F, reason: StopReason) -> Self {
        Self {
            upstream,
            predicate,
            reason,
            done: false,
            pending: None,
        }
    }
}

#[async_trait]
impl<R, F> Reader for TakeUntil<R, F>
where
    R: Reader,
    F: FnMut(&R::Item) -> bool + Send,
{
    type Item = R::Item;

    async fn read(&mut self) -> Result<Option<Self::Item>> {
        if let Some(e) = self.pending.take() {
            self.done = true;
            return Err(e);
        }
        if self.done {
            return Ok(None);
        }
        match self.upstream.read().await? {
            Some(item) if !(self.predicate)(&item) => Ok(Some(item)),
            Some(_) => {
                self.done = true;
                self.upstream.stop(self.reason.clone()).await?;
                Ok(None)
            }
            None => {
                self.done = true;
                Ok(None)
            }
        }
    }

    async fn stop(&mut self, reason: StopReason) -> Result<()> {
        latch(&mut self.done, &mut self.pending, &reason);
        self.upstream.stop(reason).await
    }

    fn headers(&self) -> Option<&Headers> {
        self.upstream.headers()
    }
}

/// Delivers at most `n` values, produced by
/// [`limit`](crate::ReaderExt::limit).
///
/// The upstream stop is issued on the read after the last delivered
/// value, so the upstream sees exactly one stop and only if it has not
/// already ended on its own.
pub struct Limit<R> {
    upstream: R,
    remaining: usize,
    reason: StopReason,
    done: bool,
    pending: Option<Error>,
}

impl<R> Limit<R> {
    pub(crate) fn new(upstream: R, n: usize, reason: StopReason) -> Self {
        Self {
            upstream,
            remaining: n,
            reason,
            done: false,
            pending: None,
        }
    }
}

#[async_trait]
impl<R: Reader> Reader for Limit<R> {
    type Item = R::Item;

    async fn read(&mut self) -> Result<Option<Self::Item>> {
        if let Some(e) = self.pending.take() {
            self.done = true;
            return Err(e);
        }
        if self.done {
            return Ok(None);
        }
        if self.remaining == 0 {
            self.done = true;
            self.upstream.stop(self.reason.clone()).await?;
            return Ok(None);
        }
        match self.upstream.read().await? {
            Some(item) => {
                self.remaining -= 1;
                Ok(Some(item))
            }
            None => {
                self.done = true;
                Ok(None)
            }
        }
    }

    async fn stop(&mut self, reason: StopReason) -> Result<()> {
        latch(&mut self.done, &mut self.pending, &reason);
        self.upstream.stop(reason).await
    }

    fn headers(&self) -> Option<&Headers> {
        self.upstream.headers()
    }
}

/// Drops the first `n` values, consumed lazily on the first read;
/// produced by [`skip`](crate::ReaderExt::skip).
pub struct Skip<R> {
    upstream: R,
    to_skip: usize,
    skipped: bool,
    done: bool,
    pending: Option<Error>,
}

impl<R> Skip<R> {
    pub(crate) fn new(upstream: R, n: usize) -> Self {
        Self {
            upstream,
            to_skip: n,
            skipped: false,
            done: false,
            pending: None,
        }
    }
}

#[async_trait]
impl<R: Reader> Reader for Skip<R> {
    type Item = R::Item;

    async fn read(&mut self) -> Result<Option<Self::Item>> {
        if let Some(e) = self.pending.take() {
            self.done = true;
            return Err(e);
        }
        if self.done {
            return Ok(None);
        }
        if !self.skipped {
            self.skipped = true;
            for _ in 0..self.to_skip {
                if self.upstream.read().await?.is_none() {
                    self.done = true;
                    return Ok(None);
                }
            }
        }
        match self.upstream.read().await? {
            Some(item) => Ok(Some(item)),
            None => {
                self.done = true;
                Ok(None)
            }
        }
    }

    async fn stop(&mut self, reason: StopReason) -> Result<()> {
        latch(&mut self.done, &mut self.pending, &reason);
        self.upstream.stop(reason).await
    }

    fn headers(&self) -> Option<&Headers> {
        self.upstream.headers()
    }
}

/// Sequential concatenation of readers, produced by
/// [`concat`](crate::ReaderExt::concat).
///
/// Stopping the composite stops the currently-active upstream and every
/// upstream that has not started yet; upstreams that already ran to end
/// are left alone.
pub struct Concat<T: Send + 'static> {
    active: Option<BoxReader<T>>,
    rest: VecDeque<BoxReader<T>>,
    done: bool,
    pending: Option<Error>,
}

impl<T: Send + 'static> Concat<T> {
    pub(crate) fn new(first: BoxReader<T>, rest: Vec<BoxReader<T>>) -> Self {
        Self {
            active: Some(first),
            rest: rest.into(),
            done: false,
            pending: None,
        }
    }
}

#[async_trait]
impl<T: Send + 'static> Reader for Concat<T> {
    type Item = T;

    async fn read(&mut self) -> Result<Option<Self::Item>> {
        if let Some(e) = self.pending.take() {
            self.done = true;
            return Err(e);
        }
        if self.done {
            return Ok(None);
        }
        loop {
            let reader = match self.active.as_mut() {
                Some(reader) => reader,
                None => {
                    self.done = true;
                    return Ok(None);
                }
            };
            match reader.read().await {
                Ok(Some(item)) => return Ok(Some(item)),
                Ok(None) => self.active = self.rest.pop_front(),
                Err(e) => {
                    self.done = true;
                    self.active = None;
                    let reason = StopReason::error(e.clone());
                    for mut reader in self.rest.drain(..) {
                        reader.stop(reason.clone()).await?;
                    }
                    return Err(e);
                }
            }
        }
    }

    async fn stop(&mut self, reason: StopReason) -> Result<()> {
        if self.done || self.pending.is_some() {
            return Ok(());
        }
        latch(&mut self.done, &mut self.pending, &reason);
        if let Some(mut reader) = self.active.take() {
            reader.stop(reason.clone()).await?;
        }
        for mut reader in self.rest.drain(..) {
            reader.stop(reason.clone()).await?;
        }
        Ok(())
    }

    fn headers(&self) -> Option<&Headers> {
        self.active.as_ref().and_then(|r| r.headers())
    }
}

/// A reader with one-deep lookahead and a push-back stack, produced by
/// [`peekable`](crate::ReaderExt::peekable).
pub struct Peekable<R: Reader> {
    upstream: R,
    stash: Vec<R::Item>,
    done: bool,
    pending: Option<Error>,
}

impl<R: Reader> Peekable<R> {
    pub(crate) fn new(upstream: R) -> Self {
        Self {
            upstream,
            stash: Vec::new(),
            done: false,
            pending: None,
        }
    }

    /// Look at the next value without consuming it. The next `read`
    /// returns the same value.
    pub async fn peek(&mut self) -> Result<Option<&R::Item>> {
        if self.stash.is_empty() {
            if let Some(e) = self.pending.take() {
                self.done = true;
                return Err(e);
            }
            if self.done {
                return Ok(None);
            }
            match self.upstream.read().await? {
                Some(item) => self.stash.push(item),
                None => {
                    self.done = true;
                    return Ok(None);
                }
            }
        }
        Ok(self.stash.last())
    }

    /// Push a value back; values come out LIFO before anything is pulled
    /// from the upstream again.
    pub fn unread(&mut self, item: R::Item) {
        self.stash.push(item);
    }
}

#[async_trait]
impl<R: Reader> Reader for Peekable<R> {
    type Item = R::Item;

    async fn read(&mut self) -> Result<Option<Self::Item>> {
        if let Some(item) = self.stash.pop() {
            return Ok(Some(item));
        }
        if let Some(e) = self.pending.take() {
            self.done = true;
            return Err(e);
        }
        if self.done {
            return Ok(None);
        }
        match self.upstream.read().await? {
            Some(item) => Ok(Some(item)),
            None => {
                self.done = true;
                Ok(None)
            }
        }
    }

    async fn stop(&mut self, reason: StopReason) -> Result<()> {
        self.stash.clear();
        latch(&mut self.done, &mut self.pending, &reason);
        self.upstream.stop(reason).await
    }

    fn headers(&self) -> Option<&Headers> {
        self.upstream.headers()
    }
}

#[cfg(test)]
mod tests {
    use crate::core::error::Error;
    use crate::core::traits::{Reader, ReaderExt};
    use crate::pipe::PipeExt;
    use crate::sources::{ArrayReader, IterReader};

    #[tokio::test]
    async fn map_transforms_in_order() {
        let doubled = IterReader::new(1..6).map(|n| n * 2).to_array().await.unwrap();
        assert_eq!(doubled, vec![2, 4, 6, 8, 10]);
    }

    #[tokio::test]
    async fn map_result_sees_input_indexes() {
        let indexed = IterReader::new(10..13)
            .map_result(|n, i| Ok((i, n)))
            .to_array()
            .await
            .unwrap();
        assert_eq!(indexed, vec![(0, 10), (1, 11), (2, 12)]);
    }

    #[tokio::test]
    async fn map_result_failure_surfaces_then_ends() {
        let mut reader = IterReader::new(0..10).map_result(|n, _| {
            if n == 2 {
                Err(Error::custom("bad value"))
            } else {
                Ok(n)
            }
        });
        assert_eq!(reader.read().await.unwrap(), Some(0));
        assert_eq!(reader.read().await.unwrap(), Some(1));
        assert!(reader.read().await.is_err());
        assert_eq!(reader.read().await.unwrap(), None);
    }

    #[tokio::test]
    async fn filter_drops_non_matching() {
        let evens = IterReader::new(1..11)
            .filter(|n: &i32| n % 2 == 0)
            .to_array()
            .await
            .unwrap();
        assert_eq!(evens, vec![2, 4, 6, 8, 10]);
    }

    #[tokio::test]
    async fn take_while_ends_on_first_failure() {
        let head = IterReader::new(0..).take_while(|n: &i32| *n < 3).to_array().await.unwrap();
        assert_eq!(head, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn take_until_drops_the_deciding_value() {
        let head = IterReader::new(0..).take_until(|n: &i32| *n == 4).to_array().await.unwrap();
        assert_eq!(head, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn limit_and_skip_compose() {
        let window = IterReader::new(0..100).skip(2).limit(5).to_array().await.unwrap();
        assert_eq!(window, vec![2, 3, 4, 5, 6]);
    }

    #[tokio::test]
    async fn limit_past_natural_end_is_quiet() {
        let all = IterReader::new(0..3).limit(10).to_array().await.unwrap();
        assert_eq!(all, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn limit_zero_never_pulls() {
        let none = IterReader::new(0..).limit(0).to_array().await.unwrap();
        assert_eq!(none, Vec::<i32>::new());
    }

    #[tokio::test]
    async fn skip_past_the_end_is_empty() {
        let none = IterReader::new(0..3).skip(10).to_array().await.unwrap();
        assert_eq!(none, Vec::<i32>::new());
    }

    #[tokio::test]
    async fn concat_runs_sources_in_order() {
        let first = ArrayReader::new(vec![1, 2]);
        let chained = first
            .concat(vec![
                ArrayReader::new(vec![3]).boxed(),
                ArrayReader::new(vec![4, 5]).boxed(),
            ])
            .to_array()
            .await
            .unwrap();
        assert_eq!(chained, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn peek_then_read_sees_the_same_value() {
        let mut reader = IterReader::new(5..8).peekable();
        assert_eq!(reader.peek().await.unwrap(), Some(&5));
        assert_eq!(reader.read().await.unwrap(), Some(5));
        assert_eq!(reader.read().await.unwrap(), Some(6));
    }

    #[tokio::test]
    async fn unread_is_lifo_and_drains_first() {
        let mut reader = IterReader::new(10..12).peekable();
        assert_eq!(reader.read().await.unwrap(), Some(10));
        reader.unread(100);
        reader.unread(200);
        assert_eq!(reader.read().await.unwrap(), Some(200));
        assert_eq!(reader.read().await.unwrap(), Some(100));
        assert_eq!(reader.read().await.unwrap(), Some(11));
        assert_eq!(reader.read().await.unwrap(), None);
    }

    #[tokio::test]
    async fn then_applies_async_work() {
        let slow_double = IterReader::new(1..4)
            .then(|n| async move {
                tokio::task::yield_now().await;
                Ok(n * 2)
            })
            .to_array()
            .await
            .unwrap();
        assert_eq!(slow_double, vec![2, 4, 6]);
    }

    #[tokio::test]
    async fn headers_pass_through_combinators() {
        let mut headers = crate::core::traits::Headers::new();
        headers.insert("content-type".into(), "text/plain".into());
        let reader = ArrayReader::new(vec![1, 2, 3]).with_headers(headers);
        let chained = reader.map(|n| n + 1).filter(|_| true).limit(2);
        assert_eq!(
            chained.headers().and_then(|h| h.get("content-type")),
            Some(&"text/plain".to_string())
        );
    }
}
