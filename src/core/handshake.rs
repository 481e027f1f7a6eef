//! Single-slot rendezvous between one producer and one consumer task.
//!
//! The notifier deposits a value; the waiter consumes it and thereby
//! resets the slot for the next round. At most one value is ever buffered,
//! which is exactly the coupling `transform` needs between its inner task
//! and the downstream puller.

use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use crate::core::error::{Error, Result};

enum Slot<T> {
    Empty,
    Full(T),
    Closed,
}

struct Inner<T> {
    slot: Mutex<Slot<T>>,
    value_ready: Notify,
    space_ready: Notify,
}

/// A resettable one-shot rendezvous.
///
/// Intended for exactly one producer and one consumer; both sides hold a
/// clone. Closing from either side unblocks the other in bounded time.
pub struct Handshake<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Handshake<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Send> Handshake<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                slot: Mutex::new(Slot::Empty),
                value_ready: Notify::new(),
                space_ready: Notify::new(),
            }),
        }
    }

    /// Deposit a value, waiting until the slot is free. Fails with
    /// [`Error::ChannelClosed`] once the rendezvous has been closed.
    pub async fn put(&self, value: T) -> Result<()> {
        let mut value = Some(value);
        loop {
            {
                let mut slot = self.inner.slot.lock().unwrap();
                match &*slot {
                    Slot::Empty => {
                        *slot = Slot::Full(value.take().unwrap());
                        self.inner.value_ready.notify_one();
                        return Ok(());
                    }
                    Slot::Full(_) => {}
                    Slot::Closed => return Err(Error::ChannelClosed),
                }
            }
            self.inner.space_ready.notified().await;
        }
    }

    /// Consume the deposited value, waiting until one arrives. Returns
    /// `None` once the rendezvous has been closed.
    pub async fn take(&self) -> Option<T> {
        loop {
            {
                let mut slot = self.inner.slot.lock().unwrap();
                match std::mem::replace(&mut *slot, Slot::Empty) {
                    Slot::Full(value) => {
                        self.inner.space_ready.notify_one();
                        return Some(value);
                    }
                    Slot::Empty => {}
                    Slot::Closed => {
                        *slot = Slot::Closed;
                        return None;
                    }
                }
            }
            self.inner.value_ready.notified().await;
        }
    }

    /// Close the rendezvous, discarding any deposited value and waking
    /// both sides.
    pub fn close(&self) {
        let mut slot = self.inner.slot.lock().unwrap();
        *slot = Slot::Closed;
        self.inner.value_ready.notify_one();
        self.inner.space_ready.notify_one();
    }
}

impl<T: Send> Default for Handshake<T> {
    fn default() -> Self {
        Self::new()
    }
}
