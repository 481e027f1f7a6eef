//! Fan-out: replicating one upstream to many downstream readers.
//!
//! [`Tee`] copies values into a secondary writer inline. [`dup`] and
//! [`fork`] share one upstream between per-branch queues fed by a single
//! pump task. The pump pulls whenever an active branch's queue is empty,
//! which keeps it one value ahead of the fastest branch — so when a stop
//! lands, the next value is typically already queued on the peers and is
//! still delivered to them (unless the stop carries an error, which takes
//! priority over queued values).

use std::collections::VecDeque;
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use tokio::sync::{oneshot, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::core::error::{Error, Result, StopReason};
use crate::core::traits::{BoxReader, Headers, Reader, Writer};
use crate::fanin::{Dequeue, Join, RoundRobin};

/// Copy-through reader produced by [`tee`](crate::ReaderExt::tee).
///
/// Each read hands a copy to the secondary writer before returning the
/// value. A rejected copy aborts the chain: the upstream is stopped with
/// the writer's error and the error surfaces downstream. On natural end
/// the secondary receives the end marker; on stop it is stopped with the
/// same reason.
pub struct Tee<R, W> {
    upstream: R,
    secondary: Option<W>,
    done: bool,
    pending: Option<Error>,
}

impl<R, W> Tee<R, W> {
    pub(crate) fn new(upstream: R, secondary: W) -> Self {
        Self {
            upstream,
            secondary: Some(secondary),
            done: false,
            pending: None,
        }
    }
}

#[async_trait]
impl<R, W> Reader for Tee<R, W>
where
    R: Reader,
    R::Item: Clone,
    W: Writer<Item = R::Item>,
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
            Some(item) => {
                if let Some(writer) = self.secondary.as_mut() {
                    if let Err(e) = writer.write(Some(item.clone())).await {
                        self.done = true;
                        self.upstream.stop(StopReason::error(e.clone())).await?;
                        return Err(e);
                    }
                }
                Ok(Some(item))
            }
            None => {
                self.done = true;
                if let Some(mut writer) = self.secondary.take() {
                    writer.write(None).await?;
                }
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
        if let Some(mut writer) = self.secondary.take() {
            writer.stop(reason.clone()).await?;
        }
        self.upstream.stop(reason).await
    }

    fn headers(&self) -> Option<&Headers> {
        self.upstream.headers()
    }
}

struct BranchState<T> {
    queue: VecDeque<T>,
    /// No further values will be queued; the branch ends once the queue
    /// drains (and `pending`, if set, has surfaced).
    ended: bool,
    /// Surface `pending` before the queue instead of after it.
    preempt: bool,
    pending: Option<Error>,
    wake: Arc<Notify>,
}

impl<T> BranchState<T> {
    fn active(&self) -> bool {
        !self.ended
    }

    fn terminal(&self) -> bool {
        self.ended && self.queue.is_empty() && self.pending.is_none()
    }
}

struct FanoutState<T> {
    branches: Vec<BranchState<T>>,
    /// Set on the first branch read; the pump does not pull before that.
    primed: bool,
    /// Reason the pump should hand to the upstream's stop.
    stop: Option<StopReason>,
    stop_waiters: Vec<oneshot::Sender<()>>,
    pump_done: bool,
}

struct FanoutShared<T> {
    state: StdMutex<FanoutState<T>>,
    demand: Notify,
    token: CancellationToken,
    headers: Option<Headers>,
}

/// One downstream reader of a [`dup`] or [`fork`] fan-out.
pub struct FanBranch<T: Send + 'static> {
    shared: Arc<FanoutShared<T>>,
    index: usize,
    wake: Arc<Notify>,
}

#[async_trait]
impl<T: Send + 'static> Reader for FanBranch<T> {
    type Item = T;

    async fn read(&mut self) -> Result<Option<Self::Item>> {
        loop {
            {
                let mut st = self.shared.state.lock().unwrap();
                st.primed = true;
                let branch = &mut st.branches[self.index];
                if branch.preempt {
                    match branch.pending.take() {
                        Some(e) => return Err(e),
                        None => return Ok(None),
                    }
                }
                if let Some(value) = branch.queue.pop_front() {
                    drop(st);
                    self.shared.demand.notify_one();
                    return Ok(Some(value));
                }
                if let Some(e) = branch.pending.take() {
                    return Err(e);
                }
                if branch.ended {
                    return Ok(None);
                }
            }
            self.shared.demand.notify_one();
            self.wake.notified().await;
        }
    }

    async fn stop(&mut self, reason: StopReason) -> Result<()> {
        let waiter = {
            let mut st = self.shared.state.lock().unwrap();
            if st.branches[self.index].terminal() {
                return Ok(());
            }
            {
                let branch = &mut st.branches[self.index];
                branch.ended = true;
                branch.preempt = false;
                branch.pending = None;
                branch.queue.clear();
            }
            match &reason {
                StopReason::None => {}
                StopReason::Silent => {
                    // peers drain what is already queued, then end
                    let index = self.index;
                    for (i, peer) in st.branches.iter_mut().enumerate() {
                        if i != index && !peer.terminal() {
                            peer.ended = true;
                            peer.wake.notify_one();
                        }
                    }
                }
                StopReason::Error(e) => {
                    // the abort outranks anything still queued on peers
                    let index = self.index;
                    for (i, peer) in st.branches.iter_mut().enumerate() {
                        if i != index && !peer.terminal() {
                            peer.ended = true;
                            peer.preempt = true;
                            peer.pending = Some((**e).clone());
                            peer.queue.clear();
                            peer.wake.notify_one();
                        }
                    }
                }
            }
            let collective =
                !matches!(reason, StopReason::None) || st.branches.iter().all(|b| !b.active());
            if collective && !st.pump_done {
                if st.stop.is_none() {
                    st.stop = Some(reason.clone());
                }
                let (tx, rx) = oneshot::channel();
                st.stop_waiters.push(tx);
                self.shared.token.cancel();
                Some(rx)
            } else {
                None
            }
        };
        self.shared.demand.notify_one();
        if let Some(rx) = waiter {
            debug!(reason = %reason, "fan-out branch waiting for upstream release");
            let _ = rx.await;
        }
        Ok(())
    }

    fn headers(&self) -> Option<&Headers> {
        self.shared.headers.as_ref()
    }
}

impl<T: Send + 'static> Drop for FanBranch<T> {
    fn drop(&mut self) {
        if let Ok(mut st) = self.shared.state.lock() {
            let branch = &mut st.branches[self.index];
            if !branch.ended {
                branch.ended = true;
                branch.queue.clear();
            }
        }
        self.shared.demand.notify_one();
    }
}

async fn pump<R>(mut upstream: R, shared: Arc<FanoutShared<R::Item>>)
where
    R: Reader,
    R::Item: Clone,
{
    trace!("fan-out pump started");
    let mut release: Option<StopReason> = None;
    'outer: loop {
        // wait until some active branch runs dry
        loop {
            {
                let mut st = shared.state.lock().unwrap();
                if st.stop.is_some() {
                    release = st.stop.take();
                    break 'outer;
                }
                if st.branches.iter().all(|b| !b.active()) {
                    // every branch detached on its own
                    release = Some(StopReason::None);
                    break 'outer;
                }
                if st.primed && st.branches.iter().any(|b| b.active() && b.queue.is_empty()) {
                    break;
                }
            }
            shared.demand.notified().await;
        }
        let item = tokio::select! { biased;
            _ = shared.token.cancelled() => {
                release = shared.state.lock().unwrap().stop.take();
                break 'outer;
            }
            item = upstream.read() => item,
        };
        let mut st = shared.state.lock().unwrap();
        match item {
            Ok(Some(value)) => {
                for branch in st.branches.iter_mut().filter(|b| b.active()) {
                    branch.queue.push_back(value.clone());
                    branch.wake.notify_one();
                }
            }
            Ok(None) => {
                for branch in st.branches.iter_mut() {
                    branch.ended = true;
                    branch.wake.notify_one();
                }
                break 'outer;
            }
            Err(e) => {
                // delivered to each branch after its queued values
                for branch in st.branches.iter_mut().filter(|b| b.active()) {
                    branch.ended = true;
                    branch.pending = Some(e.clone());
                    branch.wake.notify_one();
                }
                break 'outer;
            }
        }
    }
    if let Some(reason) = release {
        trace!(reason = %reason, "fan-out pump stopping upstream");
        let _ = upstream.stop(reason).await;
    }
    let mut st = shared.state.lock().unwrap();
    st.pump_done = true;
    for waiter in st.stop_waiters.drain(..) {
        let _ = waiter.send(());
    }
    for branch in st.branches.iter() {
        branch.wake.notify_one();
    }
}

fn spread<R>(upstream: R, count: usize) -> Vec<FanBranch<R::Item>>
where
    R: Reader + 'static,
    R::Item: Clone,
{
    let headers = upstream.headers().cloned();
    let wakes: Vec<Arc<Notify>> = (0..count).map(|_| Arc::new(Notify::new())).collect();
    let branches = wakes
        .iter()
        .map(|wake| BranchState {
            queue: VecDeque::new(),
            ended: false,
            preempt: false,
            pending: None,
            wake: wake.clone(),
        })
        .collect();
    let shared = Arc::new(FanoutShared {
        state: StdMutex::new(FanoutState {
            branches,
            primed: false,
            stop: None,
            stop_waiters: Vec::new(),
            pump_done: false,
        }),
        demand: Notify::new(),
        token: CancellationToken::new(),
        headers,
    });
    tokio::spawn(pump(upstream, shared.clone()));
    wakes
        .into_iter()
        .enumerate()
        .map(|(index, wake)| FanBranch {
            shared: shared.clone(),
            index,
            wake,
        })
        .collect()
}

/// Split a reader into exactly two branches sharing its values.
///
/// Branch stop semantics: `None` detaches the branch alone (the upstream
/// is stopped once every branch has detached); `Silent` lets the peer
/// drain its queue and end; `Error(e)` makes the peer fail on its next
/// read. `Silent` and `Error` both stop the upstream with the same
/// reason.
pub fn dup<R>(upstream: R) -> (FanBranch<R::Item>, FanBranch<R::Item>)
where
    R: Reader + 'static,
    R::Item: Clone,
{
    let mut branches = spread(upstream, 2).into_iter();
    let first = branches.next().expect("dup yields two branches");
    let second = branches.next().expect("dup yields two branches");
    (first, second)
}

/// A branch-builder function handed to [`fork`]: it receives the private
/// branch reader and returns the transformed reader for that branch.
pub type ForkConsumer<T, U> = Box<dyn FnOnce(FanBranch<T>) -> BoxReader<U> + Send>;

/// Split a reader into one branch per consumer, each transformed by its
/// consumer function. Same stop semantics as [`dup`].
pub fn fork<R, U>(upstream: R, consumers: Vec<ForkConsumer<R::Item, U>>) -> Fork<U>
where
    R: Reader + 'static,
    R::Item: Clone,
    U: Send + 'static,
{
    let branches = spread(upstream, consumers.len());
    let readers = consumers
        .into_iter()
        .zip(branches)
        .map(|(consumer, branch)| consumer(branch))
        .collect();
    Fork { readers }
}

/// The aggregate returned by [`fork`](crate::ReaderExt::fork): the
/// transformed branch readers plus the fan-in constructors.
pub struct Fork<U: Send + 'static> {
    /// The transformed reader of each branch, in consumer order.
    pub readers: Vec<BoxReader<U>>,
}

impl<U: Send + 'static> Fork<U> {
    /// Take the branch readers to drive them individually
    pub fn into_readers(self) -> Vec<BoxReader<U>> {
        self.readers
    }

    /// Merge branches in value-arrival order
    pub fn dequeue(self) -> Dequeue<U> {
        Dequeue::new(self.readers)
    }

    /// Merge branches in strict round-robin order
    pub fn rr(self) -> RoundRobin<U> {
        RoundRobin::new(self.readers)
    }

    /// Merge branches cycle-by-cycle through a joiner function
    pub fn join<F, V>(self, joiner: F) -> Join<U, F>
    where
        F: FnMut(&mut [Option<U>]) -> Result<V> + Send,
        V: Send + 'static,
    {
        Join::new(self.readers, joiner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::traits::ReaderExt;
    use crate::pipe::PipeExt;
    use crate::sinks::ArrayWriter;
    use crate::sources::{ArrayReader, IterReader};

    #[tokio::test]
    async fn tee_copies_every_value() {
        let secondary = ArrayWriter::new();
        let copies = secondary.items();
        let main = IterReader::new(0..4).tee(secondary).to_array().await.unwrap();
        assert_eq!(main, vec![0, 1, 2, 3]);
        assert_eq!(*copies.lock().await, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn tee_write_failure_aborts_the_chain() {
        // an ended writer rejects further values
        let mut secondary = ArrayWriter::new();
        secondary.write(None).await.unwrap();
        let mut teed = IterReader::new(0..4).tee(secondary);
        assert!(teed.read().await.is_err());
        assert_eq!(teed.read().await.unwrap(), None);
    }

    #[tokio::test]
    async fn dup_delivers_everything_to_both() {
        let (a, b) = ArrayReader::new(vec![1, 2, 3]).dup();
        let (left, right) = tokio::join!(a.to_array(), b.to_array());
        assert_eq!(left.unwrap(), vec![1, 2, 3]);
        assert_eq!(right.unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn dup_detached_branch_leaves_peer_running() {
        let (mut a, b) = ArrayReader::new(vec![1, 2, 3]).dup();
        assert_eq!(a.read().await.unwrap(), Some(1));
        a.stop(StopReason::None).await.unwrap();
        assert_eq!(a.read().await.unwrap(), None);
        assert_eq!(b.to_array().await.unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn fork_round_robin_merges_in_branch_order() {
        let fork = ArrayReader::new(vec![1, 2]).fork(vec![
            Box::new(|branch: FanBranch<i32>| branch.map(|n| n * 10).boxed()) as ForkConsumer<_, _>,
            Box::new(|branch: FanBranch<i32>| branch.map(|n| n * 100).boxed()),
        ]);
        let merged = fork.rr().to_array().await.unwrap();
        assert_eq!(merged, vec![10, 100, 20, 200]);
    }
}
