//! Terminal drivers: the sinks' side of a chain.
//!
//! Everything here consumes the reader and pulls it to a decision or to
//! exhaustion. Short-circuiting drivers (`every`, `some`, `find`,
//! `compare`) stop the upstream with `StopReason::None` the moment the
//! outcome is known, so sources release their resources early.

use std::cmp::Ordering;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::core::error::{Error, Result, StopReason};
use crate::core::traits::{Chunk, Reader, Writer};

/// Extension trait with the chain-driving reducers.
#[async_trait]
pub trait PipeExt: Reader + Sized {
    /// Drive the writer with every value, then close it and hand it back.
    ///
    /// A writer returning [`Error::Stopped`] with a `None` or `Silent`
    /// reason detaches gracefully: the upstream is stopped with that
    /// reason and the writer is returned normally. Any other write error
    /// stops the upstream with the error and propagates it.
    async fn pipe<W>(mut self, mut writer: W) -> Result<W>
    where
        W: Writer<Item = Self::Item>,
    {
        loop {
            match self.read().await {
                Ok(Some(value)) => {
                    if let Err(e) = writer.write(Some(value)).await {
                        return match e {
                            Error::Stopped(reason @ (StopReason::None | StopReason::Silent)) => {
                                self.stop(reason).await?;
                                Ok(writer)
                            }
                            Error::Stopped(StopReason::Error(err)) => {
                                let surfaced = (*err).clone();
                                self.stop(StopReason::Error(err)).await?;
                                Err(surfaced)
                            }
                            e => {
                                self.stop(StopReason::error(e.clone())).await?;
                                Err(e)
                            }
                        };
                    }
                }
                Ok(None) => {
                    writer.write(None).await?;
                    return Ok(writer);
                }
                Err(e) => {
                    let _ = writer.stop(StopReason::error(e.clone())).await;
                    return Err(e);
                }
            }
        }
    }

    /// Pull to exhaustion, invoking `f(value, index)`; returns the count.
    /// The index is the zero-based position of the value as seen here.
    async fn each<F>(mut self, mut f: F) -> Result<usize>
    where
        F: FnMut(Self::Item, usize) + Send,
    {
        let mut index = 0;
        while let Some(value) = self.read().await? {
            f(value, index);
            index += 1;
        }
        Ok(index)
    }

    /// Alias for [`each`](PipeExt::each)
    async fn for_each<F>(self, f: F) -> Result<usize>
    where
        F: FnMut(Self::Item, usize) + Send,
    {
        self.each(f).await
    }

    /// Strictly sequential left fold
    async fn reduce<A, F>(mut self, init: A, mut f: F) -> Result<A>
    where
        A: Send,
        F: FnMut(A, Self::Item) -> A + Send,
    {
        let mut acc = init;
        while let Some(value) = self.read().await? {
            acc = f(acc, value);
        }
        Ok(acc)
    }

    /// Whether every value matches; stops the upstream on the first
    /// counterexample
    async fn every<F>(mut self, mut predicate: F) -> Result<bool>
    where
        F: FnMut(&Self::Item) -> bool + Send,
    {
        while let Some(value) = self.read().await? {
            if !predicate(&value) {
                self.stop(StopReason::None).await?;
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Whether any value matches; stops the upstream on the first match
    async fn some<F>(mut self, mut predicate: F) -> Result<bool>
    where
        F: FnMut(&Self::Item) -> bool + Send,
    {
        while let Some(value) = self.read().await? {
            if predicate(&value) {
                self.stop(StopReason::None).await?;
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// The first matching value; stops the upstream when found
    async fn find<F>(mut self, mut predicate: F) -> Result<Option<Self::Item>>
    where
        F: FnMut(&Self::Item) -> bool + Send,
    {
        while let Some(value) = self.read().await? {
            if predicate(&value) {
                self.stop(StopReason::None).await?;
                return Ok(Some(value));
            }
        }
        Ok(None)
    }

    /// Materialize the stream into a vector
    async fn to_array(mut self) -> Result<Vec<Self::Item>> {
        let mut items = Vec::new();
        while let Some(value) = self.read().await? {
            items.push(value);
        }
        Ok(items)
    }

    /// Concatenate chunk values (`String` or `Vec<u8>`) into one
    async fn read_all(mut self) -> Result<Self::Item>
    where
        Self::Item: Chunk,
    {
        let mut acc = Self::Item::empty();
        while let Some(chunk) = self.read().await? {
            acc.append(chunk);
        }
        Ok(acc)
    }

    /// Lock-step comparison with another reader: the ordering of the
    /// first difference, or of the lengths if one stream is a prefix of
    /// the other. An early decision stops both sides.
    async fn compare<R2>(mut self, mut other: R2) -> Result<Ordering>
    where
        R2: Reader<Item = Self::Item>,
        Self::Item: Ord,
    {
        loop {
            let mine = self.read().await?;
            let theirs = other.read().await?;
            match (mine, theirs) {
                (None, None) => return Ok(Ordering::Equal),
                (None, Some(_)) => {
                    other.stop(StopReason::None).await?;
                    return Ok(Ordering::Less);
                }
                (Some(_), None) => {
                    self.stop(StopReason::None).await?;
                    return Ok(Ordering::Greater);
                }
                (Some(a), Some(b)) => match a.cmp(&b) {
                    Ordering::Equal => {}
                    decided => {
                        self.stop(StopReason::None).await?;
                        other.stop(StopReason::None).await?;
                        return Ok(decided);
                    }
                },
            }
        }
    }

    /// Adapt the reader into a standard `Stream`, driving it on the
    /// current executor. The stream ends after the first error.
    fn into_stream(self) -> BoxStream<'static, Result<Self::Item>>
    where
        Self: 'static,
    {
        Box::pin(futures::stream::unfold(
            (self, false),
            |(mut reader, failed)| async move {
                if failed {
                    return None;
                }
                match reader.read().await {
                    Ok(Some(value)) => Some((Ok(value), (reader, false))),
                    Ok(None) => None,
                    Err(e) => Some((Err(e), (reader, true))),
                }
            },
        ))
    }
}

impl<R: Reader> PipeExt for R {}
