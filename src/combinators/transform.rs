//! The most general combinator: a cooperative task between the upstream
//! and the downstream puller.
//!
//! The task receives a reader over the upstream and a writer whose values
//! become the composite reader's output. The two sides meet in a one-slot
//! [`Handshake`]: at most one value is buffered, and the writer's `write`
//! resolves only when the slot frees up, so the task can never run ahead
//! of the consumer.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::sync::Mutex as TokioMutex;
use tracing::trace;

use crate::core::error::{Error, Result, StopReason};
use crate::core::handshake::Handshake;
use crate::core::traits::{Headers, Reader, Writer};

/// The boxed cooperative task driven by [`Transform`].
pub type TransformTask<R, U> =
    Box<dyn FnOnce(TransformReader<R>, TransformWriter<U>) -> BoxFuture<'static, Result<()>> + Send>;

type Message<U> = Result<Option<U>>;

struct Running<U: Send> {
    hs: Handshake<Message<U>>,
}

/// Composite reader produced by
/// [`transform`](crate::ReaderExt::transform).
pub struct Transform<R, U: Send + 'static> {
    shared: Arc<TokioMutex<R>>,
    headers: Option<Headers>,
    task: Option<TransformTask<R, U>>,
    running: Option<Running<U>>,
    done: bool,
    pending: Option<Error>,
}

impl<R: Reader + 'static, U: Send + 'static> Transform<R, U> {
    pub(crate) fn new(upstream: R, task: TransformTask<R, U>) -> Self {
        let headers = upstream.headers().cloned();
        Self {
            shared: Arc::new(TokioMutex::new(upstream)),
            headers,
            task: Some(task),
            running: None,
            done: false,
            pending: None,
        }
    }

    fn start(&mut self) {
        let task = match self.task.take() {
            Some(task) => task,
            None => return,
        };
        let hs = Handshake::new();
        let reader = TransformReader {
            shared: self.shared.clone(),
            headers: self.headers.clone(),
        };
        let writer = TransformWriter {
            hs: hs.clone(),
            ended: false,
        };
        let done_hs = hs.clone();
        tokio::spawn(async move {
            let outcome = task(reader, writer).await;
            let message = match outcome {
                Ok(()) => Ok(None),
                Err(e) => Err(e),
            };
            // the consumer may already be gone; nothing left to report to
            let _ = done_hs.put(message).await;
        });
        trace!("transform task started");
        self.running = Some(Running { hs });
    }
}

#[async_trait]
impl<R, U> Reader for Transform<R, U>
where
    R: Reader + 'static,
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
        if self.running.is_none() {
            self.start();
        }
        let Some(running) = self.running.as_ref() else {
            self.done = true;
            return Ok(None);
        };
        match running.hs.take().await {
            Some(Ok(Some(item))) => Ok(Some(item)),
            Some(Ok(None)) => {
                self.done = true;
                running.hs.close();
                Ok(None)
            }
            Some(Err(e)) => {
                self.done = true;
                running.hs.close();
                Err(e)
            }
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
        self.task = None;
        if let Some(running) = self.running.as_ref() {
            // unblock a task waiting on the rendezvous
            running.hs.close();
        }
        self.shared.lock().await.stop(reason).await
    }

    fn headers(&self) -> Option<&Headers> {
        self.headers.as_ref()
    }
}

/// The upstream-facing reader handed to a transform task.
pub struct TransformReader<R> {
    shared: Arc<TokioMutex<R>>,
    headers: Option<Headers>,
}

#[async_trait]
impl<R: Reader> Reader for TransformReader<R> {
    type Item = R::Item;

    async fn read(&mut self) -> Result<Option<Self::Item>> {
        self.shared.lock().await.read().await
    }

    async fn stop(&mut self, reason: StopReason) -> Result<()> {
        self.shared.lock().await.stop(reason).await
    }

    fn headers(&self) -> Option<&Headers> {
        self.headers.as_ref()
    }
}

/// The downstream-facing writer handed to a transform task.
///
/// When the composite reader has been stopped, `write` fails with
/// [`Error::Stopped`] so the task can wind down with `?`.
pub struct TransformWriter<U: Send> {
    hs: Handshake<Message<U>>,
    ended: bool,
}

#[async_trait]
impl<U: Send + 'static> Writer for TransformWriter<U> {
    type Item = U;

    async fn write(&mut self, item: Option<Self::Item>) -> Result<()> {
        match item {
            Some(value) => {
                if self.ended {
                    return Err(Error::protocol("write after end"));
                }
                self.hs
                    .put(Ok(Some(value)))
                    .await
                    .map_err(|_| Error::stopped(StopReason::None))
            }
            None => {
                if !self.ended {
                    self.ended = true;
                    let _ = self.hs.put(Ok(None)).await;
                }
                Ok(())
            }
        }
    }

    async fn stop(&mut self, _reason: StopReason) -> Result<()> {
        self.ended = true;
        self.hs.close();
        Ok(())
    }
}
