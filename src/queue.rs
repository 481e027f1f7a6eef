//! A bounded producer/consumer device.
//!
//! [`queue`] returns the two ends of a FIFO with a fixed capacity. The
//! writer side offers a lossy non-suspending [`put`](QueueWriter::put) and
//! a lossless suspending [`write`](Writer::write); the reader side is an
//! ordinary [`Reader`] that drains the FIFO and ends once the producer has
//! called [`end`](QueueWriter::end).

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::core::error::{Error, Result, StopReason};
use crate::core::traits::{Reader, Writer};

/// Create a bounded queue device with the given positive capacity.
pub fn queue<T: Send + 'static>(max: usize) -> (QueueWriter<T>, QueueReader<T>) {
    assert!(max > 0, "queue capacity must be positive");
    let (tx, rx) = mpsc::channel(max);
    (
        QueueWriter {
            tx: Some(tx),
            error: None,
        },
        QueueReader {
            rx,
            done: false,
            pending: None,
        },
    )
}

/// The producer half of a [`queue`].
pub struct QueueWriter<T> {
    tx: Option<mpsc::Sender<T>>,
    error: Option<Error>,
}

impl<T: Send + 'static> QueueWriter<T> {
    /// Offer a value without suspending. Returns `true` if the queue
    /// accepted it, `false` if it was full (the value is dropped) or the
    /// queue has been closed.
    pub fn put(&mut self, value: T) -> bool {
        match &self.tx {
            Some(tx) => tx.try_send(value).is_ok(),
            None => false,
        }
    }

    /// Close the producer side; the reader ends after draining.
    pub fn end(&mut self) {
        self.tx = None;
    }

    /// Whether the producer side is still open.
    pub fn is_open(&self) -> bool {
        self.tx.is_some()
    }
}

#[async_trait]
impl<T: Send + 'static> Writer for QueueWriter<T> {
    type Item = T;

    async fn write(&mut self, item: Option<Self::Item>) -> Result<()> {
        if let Some(e) = &self.error {
            return Err(e.clone());
        }
        match item {
            Some(value) => match &self.tx {
                // suspends until space is available
                Some(tx) => tx.send(value).await.map_err(|_| {
                    let e = Error::ChannelClosed;
                    self.error = Some(e.clone());
                    e
                }),
                None => {
                    let e = Error::protocol("write after end");
                    self.error = Some(e.clone());
                    Err(e)
                }
            },
            None => {
                self.end();
                Ok(())
            }
        }
    }

    async fn stop(&mut self, _reason: StopReason) -> Result<()> {
        // nothing buffered on the producer side, so stop need not flush
        self.end();
        Ok(())
    }
}

/// The consumer half of a [`queue`].
pub struct QueueReader<T> {
    rx: mpsc::Receiver<T>,
    done: bool,
    pending: Option<Error>,
}

#[async_trait]
impl<T: Send + 'static> Reader for QueueReader<T> {
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
            Some(value) => Ok(Some(value)),
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
        self.rx.close();
        while self.rx.try_recv().is_ok() {}
        match reason.surface() {
            Some(e) => self.pending = Some(e),
            None => self.done = true,
        }
        Ok(())
    }
}
