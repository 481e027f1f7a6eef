//! Sink devices: concrete writers that terminate chains.
//!
//! Accumulating sinks share their collected data through an
//! `Arc<tokio::sync::Mutex<_>>` handle, so a partially-filled result stays
//! observable after a chain fails mid-way; nothing is rolled back.

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::sync::Mutex as TokioMutex;

use crate::core::error::{Error, Result, StopReason};
use crate::core::traits::Writer;

fn write_after_end() -> Error {
    Error::protocol("write after end")
}

/// A writer that collects values into a vector.
pub struct ArrayWriter<T> {
    items: Arc<TokioMutex<Vec<T>>>,
    ended: bool,
    error: Option<Error>,
}

impl<T: Send + 'static> ArrayWriter<T> {
    pub fn new() -> Self {
        Self {
            items: Arc::new(TokioMutex::new(Vec::new())),
            ended: false,
            error: None,
        }
    }

    /// Snapshot of the values collected so far
    pub async fn result(&self) -> Vec<T>
    where
        T: Clone,
    {
        self.items.lock().await.clone()
    }

    /// Shared handle onto the accumulator, for observing a sink that was
    /// moved into a chain
    pub fn items(&self) -> Arc<TokioMutex<Vec<T>>> {
        self.items.clone()
    }
}

impl<T: Send + 'static> Default for ArrayWriter<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for ArrayWriter<T> {
    fn clone(&self) -> Self {
        Self {
            items: self.items.clone(),
            ended: self.ended,
            error: self.error.clone(),
        }
    }
}

#[async_trait]
impl<T: Send + 'static> Writer for ArrayWriter<T> {
    type Item = T;

    async fn write(&mut self, item: Option<Self::Item>) -> Result<()> {
        if let Some(e) = &self.error {
            return Err(e.clone());
        }
        match item {
            Some(value) => {
                if self.ended {
                    let e = write_after_end();
                    self.error = Some(e.clone());
                    return Err(e);
                }
                self.items.lock().await.push(value);
                Ok(())
            }
            None => {
                self.ended = true;
                Ok(())
            }
        }
    }

    async fn stop(&mut self, _reason: StopReason) -> Result<()> {
        self.ended = true;
        Ok(())
    }
}

/// A writer that concatenates string chunks.
pub struct StringWriter {
    data: Arc<TokioMutex<String>>,
    ended: bool,
    error: Option<Error>,
}

impl StringWriter {
    pub fn new() -> Self {
        Self {
            data: Arc::new(TokioMutex::new(String::new())),
            ended: false,
            error: None,
        }
    }

    /// Snapshot of the text collected so far
    pub async fn result(&self) -> String {
        self.data.lock().await.clone()
    }

    pub fn data(&self) -> Arc<TokioMutex<String>> {
        self.data.clone()
    }
}

impl Default for StringWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for StringWriter {
    fn clone(&self) -> Self {
        Self {
            data: self.data.clone(),
            ended: self.ended,
            error: self.error.clone(),
        }
    }
}

#[async_trait]
impl Writer for StringWriter {
    type Item = String;

    async fn write(&mut self, item: Option<Self::Item>) -> Result<()> {
        if let Some(e) = &self.error {
            return Err(e.clone());
        }
        match item {
            Some(chunk) => {
                if self.ended {
                    let e = write_after_end();
                    self.error = Some(e.clone());
                    return Err(e);
                }
                self.data.lock().await.push_str(&chunk);
                Ok(())
            }
            None => {
                self.ended = true;
                Ok(())
            }
        }
    }

    async fn stop(&mut self, _reason: StopReason) -> Result<()> {
        self.ended = true;
        Ok(())
    }
}

/// A writer that concatenates byte chunks.
pub struct BufferWriter {
    data: Arc<TokioMutex<Vec<u8>>>,
    ended: bool,
    error: Option<Error>,
}

impl BufferWriter {
    pub fn new() -> Self {
        Self {
            data: Arc::new(TokioMutex::new(Vec::new())),
            ended: false,
            error: None,
        }
    }

    /// Snapshot of the bytes collected so far
    pub async fn result(&self) -> Vec<u8> {
        self.data.lock().await.clone()
    }

    pub fn data(&self) -> Arc<TokioMutex<Vec<u8>>> {
        self.data.clone()
    }
}

impl Default for BufferWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for BufferWriter {
    fn clone(&self) -> Self {
        Self {
            data: self.data.clone(),
            ended: self.ended,
            error: self.error.clone(),
        }
    }
}

#[async_trait]
impl Writer for BufferWriter {
    type Item = Vec<u8>;

    async fn write(&mut self, item: Option<Self::Item>) -> Result<()> {
        if let Some(e) = &self.error {
            return Err(e.clone());
        }
        match item {
            Some(chunk) => {
                if self.ended {
                    let e = write_after_end();
                    self.error = Some(e.clone());
                    return Err(e);
                }
                self.data.lock().await.extend_from_slice(&chunk);
                Ok(())
            }
            None => {
                self.ended = true;
                Ok(())
            }
        }
    }

    async fn stop(&mut self, _reason: StopReason) -> Result<()> {
        self.ended = true;
        Ok(())
    }
}

/// Release hook for [`GenericWriter`], invoked at most once.
pub type WriterStopFn = Box<dyn FnMut(StopReason) -> BoxFuture<'static, Result<()>> + Send>;

/// A writer built from an effectful write closure and an optional release
/// closure. The wrapper latches end and error states the same way the
/// concrete sinks do.
pub struct GenericWriter<F, T, Fut> {
    write_fn: F,
    stop_fn: Option<WriterStopFn>,
    ended: bool,
    error: Option<Error>,
    _marker: PhantomData<(T, Fut)>,
}

impl<F, T, Fut> std::fmt::Debug for GenericWriter<F, T, Fut> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenericWriter")
            .field("ended", &self.ended)
            .field("error", &self.error)
            .finish()
    }
}

impl<F, T, Fut> GenericWriter<F, T, Fut> {
    pub fn new(write_fn: F) -> Self {
        Self {
            write_fn,
            stop_fn: None,
            ended: false,
            error: None,
            _marker: PhantomData,
        }
    }

    /// Attach a release closure invoked when the writer is stopped
    pub fn with_stop<S, SFut>(mut self, mut stop_fn: S) -> Self
    where
        S: FnMut(StopReason) -> SFut + Send + 'static,
        SFut: Future<Output = Result<()>> + Send + 'static,
    {
        self.stop_fn = Some(Box::new(move |reason| Box::pin(stop_fn(reason))));
        self
    }
}

#[async_trait]
impl<F, Fut, T> Writer for GenericWriter<F, T, Fut>
where
    F: FnMut(Option<T>) -> Fut + Send,
    Fut: Future<Output = Result<()>> + Send,
    T: Send + 'static,
{
    type Item = T;

    async fn write(&mut self, item: Option<Self::Item>) -> Result<()> {
        if let Some(e) = &self.error {
            return Err(e.clone());
        }
        if self.ended {
            if item.is_none() {
                return Ok(());
            }
            let e = write_after_end();
            self.error = Some(e.clone());
            return Err(e);
        }
        if item.is_none() {
            self.ended = true;
        }
        match (self.write_fn)(item).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.error = Some(e.clone());
                Err(e)
            }
        }
    }

    async fn stop(&mut self, reason: StopReason) -> Result<()> {
        if self.ended {
            return Ok(());
        }
        self.ended = true;
        match self.stop_fn.take() {
            Some(mut f) => f(reason).await,
            None => (self.write_fn)(None).await,
        }
    }
}

/// A writer that accepts and discards everything.
pub struct NullWriter<T> {
    ended: bool,
    error: Option<Error>,
    _marker: PhantomData<fn(T)>,
}

impl<T> NullWriter<T> {
    pub fn new() -> Self {
        Self {
            ended: false,
            error: None,
            _marker: PhantomData,
        }
    }
}

impl<T> Default for NullWriter<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T: Send + 'static> Writer for NullWriter<T> {
    type Item = T;

    async fn write(&mut self, item: Option<Self::Item>) -> Result<()> {
        if let Some(e) = &self.error {
            return Err(e.clone());
        }
        match item {
            Some(_) if self.ended => {
                let e = write_after_end();
                self.error = Some(e.clone());
                Err(e)
            }
            Some(_) => Ok(()),
            None => {
                self.ended = true;
                Ok(())
            }
        }
    }

    async fn stop(&mut self, _reason: StopReason) -> Result<()> {
        self.ended = true;
        Ok(())
    }
}

/// A writer adapter that maps each value before forwarding, produced by
/// [`WriterExt::contramap`](crate::core::traits::WriterExt::contramap).
pub struct Contramap<W, F, T> {
    writer: W,
    f: F,
    _marker: PhantomData<fn(T)>,
}

impl<W, F, T> Contramap<W, F, T> {
    pub(crate) fn new(writer: W, f: F) -> Self {
        Self {
            writer,
            f,
            _marker: PhantomData,
        }
    }

    /// The wrapped writer
    pub fn into_inner(self) -> W {
        self.writer
    }
}

#[async_trait]
impl<W, F, T> Writer for Contramap<W, F, T>
where
    W: Writer,
    F: FnMut(T) -> W::Item + Send,
    T: Send + 'static,
{
    type Item = T;

    async fn write(&mut self, item: Option<Self::Item>) -> Result<()> {
        self.writer.write(item.map(&mut self.f)).await
    }

    async fn stop(&mut self, reason: StopReason) -> Result<()> {
        self.writer.stop(reason).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::traits::WriterExt;

    #[tokio::test]
    async fn array_writer_collects_and_latches() {
        let mut w = ArrayWriter::new();
        w.write(Some(1)).await.unwrap();
        w.write(Some(2)).await.unwrap();
        w.write(None).await.unwrap();
        assert!(w.write(Some(3)).await.is_err());
        // the same error again on every later write
        assert!(w.write(Some(4)).await.is_err());
        assert_eq!(w.result().await, vec![1, 2]);
    }

    #[tokio::test]
    async fn write_all_closes() {
        let mut w = StringWriter::new();
        w.write_all("done".to_string()).await.unwrap();
        assert!(w.write(Some("more".to_string())).await.is_err());
        assert_eq!(w.result().await, "done");
    }

    #[tokio::test]
    async fn contramap_maps_values_only() {
        let sink = ArrayWriter::new();
        let items = sink.items();
        let mut w = sink.contramap(|n: u32| n.to_string());
        w.write(Some(7)).await.unwrap();
        w.write(None).await.unwrap();
        assert_eq!(*items.lock().await, vec!["7".to_string()]);
    }
}
