//! Bounded eager prefetch, decoupling a producer from its consumer.
//!
//! A prefetch task pulls ahead of consumer demand through a bounded
//! channel, reserving a slot before it touches the upstream: for an
//! infinite upstream, `k` consumer reads cost at most `k + max` upstream
//! pulls. Values keep their order, and an upstream error is delivered in
//! FIFO position after the values buffered ahead of it.

use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::core::error::{Error, Result, StopReason};
use crate::core::traits::{Headers, Reader};

/// Prefetching reader produced by [`buffer`](crate::ReaderExt::buffer).
pub struct Buffer<T: Send + 'static> {
    rx: mpsc::Receiver<Result<T>>,
    handle: Option<JoinHandle<()>>,
    token: CancellationToken,
    reason: Arc<StdMutex<Option<StopReason>>>,
    headers: Option<Headers>,
    done: bool,
    pending: Option<Error>,
}

impl<T: Send + 'static> Buffer<T> {
    pub(crate) fn new<R>(mut upstream: R, max: usize) -> Self
    where
        R: Reader<Item = T> + 'static,
    {
        assert!(max > 0, "buffer capacity must be positive");
        let headers = upstream.headers().cloned();
        let (tx, rx) = mpsc::channel(max);
        let token = CancellationToken::new();
        let reason = Arc::new(StdMutex::new(None));
        let task_token = token.clone();
        let task_reason = reason.clone();
        let handle = tokio::spawn(async move {
            loop {
                // reserve space before pulling so upstream demand stays
                // bounded by consumption plus capacity
                let permit = tokio::select! { biased;
                    _ = task_token.cancelled() => break,
                    permit = tx.reserve() => match permit {
                        Ok(p) => p,
                        Err(_) => break,
                    },
                };
                let item = tokio::select! { biased;
                    _ = task_token.cancelled() => break,
                    item = upstream.read() => item,
                };
                match item {
                    Ok(Some(value)) => permit.send(Ok(value)),
                    Ok(None) => break,
                    Err(e) => {
                        permit.send(Err(e));
                        break;
                    }
                }
            }
            let requested = task_reason.lock().unwrap().take();
            if let Some(r) = requested {
                trace!(reason = %r, "buffer prefetch stopping upstream");
                let _ = upstream.stop(r).await;
            }
        });
        Self {
            rx,
            handle: Some(handle),
            token,
            reason,
            headers,
            done: false,
            pending: None,
        }
    }
}

#[async_trait]
impl<T: Send + 'static> Reader for Buffer<T> {
    type Item = T;

    async fn read(&mut self) -> Result<Option<Self::Item>> {
        if let Some(e) = self.pending.take() {
            self.done = true;
            return Err(e);
        }
        if self.done {
            return Ok(None);
        }
        match self.rx.recv().await {
            Some(Ok(value)) => Ok(Some(value)),
            Some(Err(e)) => {
                self.done = true;
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
        *self.reason.lock().unwrap() = Some(reason);
        self.token.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
        self.rx.close();
        Ok(())
    }

    // the upstream moved into the prefetch task, so the composite keeps
    // a copy of its headers
    fn headers(&self) -> Option<&Headers> {
        self.headers.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::traits::ReaderExt;
    use crate::pipe::PipeExt;
    use crate::sources::{GenericReader, IterReader};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn preserves_values_and_order() {
        let out = IterReader::new(0..50).buffer(8).to_array().await.unwrap();
        assert_eq!(out, (0..50).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn prefetch_is_bounded_for_infinite_upstreams() {
        let pulls = Arc::new(AtomicUsize::new(0));
        let pulls_probe = pulls.clone();
        let mut n = 0u64;
        let source = GenericReader::new(move || {
            pulls_probe.fetch_add(1, Ordering::SeqCst);
            n += 1;
            let item = n - 1;
            async move { Ok(Some(item)) }
        });

        let mut buffered = source.buffer(3);
        for expected in 0..2 {
            assert_eq!(buffered.read().await.unwrap(), Some(expected));
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(pulls.load(Ordering::SeqCst) <= 2 + 3);

        buffered.stop(StopReason::None).await.unwrap();
        let after_stop = pulls.load(Ordering::SeqCst);
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(pulls.load(Ordering::SeqCst), after_stop);
    }

    #[tokio::test]
    async fn upstream_error_arrives_in_fifo_order() {
        let mut n = 0;
        let source = GenericReader::new(move || {
            n += 1;
            let out = match n {
                1..=2 => Ok(Some(n)),
                _ => Err(Error::custom("source died")),
            };
            async move { out }
        });
        let mut buffered = source.buffer(4);
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert_eq!(buffered.read().await.unwrap(), Some(1));
        assert_eq!(buffered.read().await.unwrap(), Some(2));
        assert!(buffered.read().await.is_err());
        assert_eq!(buffered.read().await.unwrap(), None);
    }
}
