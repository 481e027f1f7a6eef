//! Fan-in: merging many upstream readers into one downstream reader.
//!
//! [`RoundRobin`] and [`Join`] pull their branches directly and stay
//! sequential per cycle; [`Dequeue`] and [`Parallel`] keep one
//! outstanding pull per branch in worker tasks so the first value to
//! arrive wins. A failing branch aborts the merge: peers are stopped with
//! the error and the error surfaces downstream once.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use futures::future::{join_all, BoxFuture};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::core::error::{Error, Result, StopReason};
use crate::core::traits::{BoxReader, Reader, Writer};
use crate::queue::{queue, QueueReader, QueueWriter};

/// Strict round-robin merge over non-ended branches, produced by
/// [`Fork::rr`](crate::fanout::Fork::rr).
pub struct RoundRobin<T: Send + 'static> {
    branches: Vec<RrBranch<T>>,
    next: usize,
    done: bool,
    pending: Option<Error>,
}

struct RrBranch<T> {
    reader: BoxReader<T>,
    ended: bool,
}

impl<T: Send + 'static> RoundRobin<T> {
    pub fn new(readers: Vec<BoxReader<T>>) -> Self {
        Self {
            branches: readers
                .into_iter()
                .map(|reader| RrBranch {
                    reader,
                    ended: false,
                })
                .collect(),
            next: 0,
            done: false,
            pending: None,
        }
    }

    async fn abort_peers(&mut self, skip: usize, error: &Error) {
        let reason = StopReason::error(error.clone());
        for (i, branch) in self.branches.iter_mut().enumerate() {
            if i != skip && !branch.ended {
                branch.ended = true;
                let _ = branch.reader.stop(reason.clone()).await;
            }
        }
    }
}

#[async_trait]
impl<T: Send + 'static> Reader for RoundRobin<T> {
    type Item = T;

    async fn read(&mut self) -> Result<Option<Self::Item>> {
        if let Some(e) = self.pending.take() {
            self.done = true;
            return Err(e);
        }
        if self.done || self.branches.is_empty() {
            self.done = true;
            return Ok(None);
        }
        loop {
            if self.branches.iter().all(|b| b.ended) {
                self.done = true;
                return Ok(None);
            }
            let i = self.next;
            self.next = (self.next + 1) % self.branches.len();
            if self.branches[i].ended {
                continue;
            }
            match self.branches[i].reader.read().await {
                Ok(Some(item)) => return Ok(Some(item)),
                Ok(None) => self.branches[i].ended = true,
                Err(e) => {
                    self.done = true;
                    self.branches[i].ended = true;
                    self.abort_peers(i, &e).await;
                    return Err(e);
                }
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
        for branch in self.branches.iter_mut() {
            if !branch.ended {
                branch.ended = true;
                branch.reader.stop(reason.clone()).await?;
            }
        }
        Ok(())
    }
}

/// Cycle-based merge through a joiner function, produced by
/// [`Fork::join`](crate::fanout::Fork::join).
///
/// Each cycle pulls one value for every vacant slot of a still-active
/// branch (concurrently), then hands the slot array to the joiner. The
/// joiner takes the entries it consumed out of the array; cleared entries
/// are re-pulled on the next cycle. The merge ends when every branch has
/// ended and every slot is vacant.
pub struct Join<T: Send + 'static, F> {
    branches: Vec<JoinBranch<T>>,
    slots: Vec<Option<T>>,
    joiner: F,
    done: bool,
    pending: Option<Error>,
}

struct JoinBranch<T> {
    reader: BoxReader<T>,
    ended: bool,
}

impl<T: Send + 'static, F> Join<T, F> {
    pub fn new(readers: Vec<BoxReader<T>>, joiner: F) -> Self {
        let slots = readers.iter().map(|_| None).collect();
        Self {
            branches: readers
                .into_iter()
                .map(|reader| JoinBranch {
                    reader,
                    ended: false,
                })
                .collect(),
            slots,
            joiner,
            done: false,
            pending: None,
        }
    }

    async fn abort_all(&mut self, error: &Error) {
        let reason = StopReason::error(error.clone());
        for branch in self.branches.iter_mut() {
            if !branch.ended {
                branch.ended = true;
                let _ = branch.reader.stop(reason.clone()).await;
            }
        }
    }
}

#[async_trait]
impl<T, F, V> Reader for Join<T, F>
where
    T: Send + 'static,
    F: FnMut(&mut [Option<T>]) -> Result<V> + Send,
    V: Send + 'static,
{
    type Item = V;

    async fn read(&mut self) -> Result<Option<Self::Item>> {
        if let Some(e) = self.pending.take() {
            self.done = true;
            return Err(e);
        }
        if self.done {
            return Ok(None);
        }
        // refill every vacant slot of a still-active branch, concurrently
        let slots = &mut self.slots;
        let branches = &mut self.branches;
        let pulls = branches
            .iter_mut()
            .enumerate()
            .filter(|(i, b)| !b.ended && slots[*i].is_none())
            .map(|(i, b)| async move { (i, b.reader.read().await) });
        let results = join_all(pulls).await;
        let mut failure = None;
        for (i, result) in results {
            match result {
                Ok(Some(value)) => self.slots[i] = Some(value),
                Ok(None) => self.branches[i].ended = true,
                Err(e) => {
                    self.branches[i].ended = true;
                    failure.get_or_insert(e);
                }
            }
        }
        if let Some(e) = failure {
            self.done = true;
            self.abort_all(&e).await;
            return Err(e);
        }
        if self.branches.iter().all(|b| b.ended) && self.slots.iter().all(Option::is_none) {
            self.done = true;
            return Ok(None);
        }
        match (self.joiner)(&mut self.slots) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                self.done = true;
                self.abort_all(&e).await;
                Err(e)
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
        self.slots.iter_mut().for_each(|slot| *slot = None);
        for branch in self.branches.iter_mut() {
            if !branch.ended {
                branch.ended = true;
                branch.reader.stop(reason.clone()).await?;
            }
        }
        Ok(())
    }
}

/// Arrival-order merge, produced by
/// [`Fork::dequeue`](crate::fanout::Fork::dequeue).
///
/// Every still-active branch keeps one outstanding pull in a worker task;
/// whichever branch produces first is delivered first.
pub struct Dequeue<T: Send + 'static> {
    idle: Option<Vec<BoxReader<T>>>,
    rx: Option<mpsc::Receiver<(usize, Result<Option<T>>)>>,
    handles: Vec<JoinHandle<()>>,
    token: CancellationToken,
    reason: Arc<StdMutex<Option<StopReason>>>,
    active: usize,
    done: bool,
    pending: Option<Error>,
}

impl<T: Send + 'static> Dequeue<T> {
    pub fn new(readers: Vec<BoxReader<T>>) -> Self {
        Self {
            active: readers.len(),
            idle: Some(readers),
            rx: None,
            handles: Vec::new(),
            token: CancellationToken::new(),
            reason: Arc::new(StdMutex::new(None)),
            done: false,
            pending: None,
        }
    }

    fn start(&mut self) {
        let Some(readers) = self.idle.take() else {
            return;
        };
        let (tx, rx) = mpsc::channel(readers.len().max(1));
        for (index, mut reader) in readers.into_iter().enumerate() {
            let tx = tx.clone();
            let token = self.token.clone();
            let reason = self.reason.clone();
            self.handles.push(tokio::spawn(async move {
                loop {
                    let permit = tokio::select! { biased;
                        _ = token.cancelled() => break,
                        permit = tx.reserve() => match permit {
                            Ok(p) => p,
                            Err(_) => break,
                        },
                    };
                    let item = tokio::select! { biased;
                        _ = token.cancelled() => break,
                        item = reader.read() => item,
                    };
                    let terminal = matches!(item, Ok(None) | Err(_));
                    permit.send((index, item));
                    if terminal {
                        break;
                    }
                }
                let requested = reason.lock().unwrap().clone();
                if let Some(r) = requested {
                    let _ = reader.stop(r).await;
                }
            }));
        }
        self.rx = Some(rx);
    }
}

#[async_trait]
impl<T: Send + 'static> Reader for Dequeue<T> {
    type Item = T;

    async fn read(&mut self) -> Result<Option<Self::Item>> {
        if let Some(e) = self.pending.take() {
            self.done = true;
            return Err(e);
        }
        if self.done {
            return Ok(None);
        }
        if self.rx.is_none() {
            self.start();
        }
        let Some(rx) = self.rx.as_mut() else {
            self.done = true;
            return Ok(None);
        };
        loop {
            if self.active == 0 {
                self.done = true;
                return Ok(None);
            }
            match rx.recv().await {
                Some((_, Ok(Some(value)))) => return Ok(Some(value)),
                Some((_, Ok(None))) => self.active -= 1,
                Some((index, Err(e))) => {
                    debug!(branch = index, "dequeue branch failed, aborting peers");
                    self.done = true;
                    *self.reason.lock().unwrap() = Some(StopReason::error(e.clone()));
                    self.token.cancel();
                    return Err(e);
                }
                None => {
                    self.done = true;
                    return Ok(None);
                }
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
        if let Some(mut readers) = self.idle.take() {
            for reader in readers.iter_mut() {
                reader.stop(reason.clone()).await?;
            }
            return Ok(());
        }
        *self.reason.lock().unwrap() = Some(reason);
        self.token.cancel();
        for handle in self.handles.drain(..) {
            let _ = handle.await;
        }
        if let Some(rx) = self.rx.as_mut() {
            rx.close();
        }
        Ok(())
    }
}

/// How [`parallel`](crate::ReaderExt::parallel) distributes and merges.
#[derive(Debug, Clone)]
pub struct ParallelOptions {
    /// Number of worker chains
    pub count: usize,
    /// Emit outputs in completion order instead of input order
    pub shuffle: bool,
}

impl ParallelOptions {
    pub fn preserve_order(count: usize) -> Self {
        Self {
            count,
            shuffle: false,
        }
    }

    pub fn shuffle(count: usize) -> Self {
        Self {
            count,
            shuffle: true,
        }
    }
}

impl Default for ParallelOptions {
    fn default() -> Self {
        Self::preserve_order(4)
    }
}

enum WorkerMsg<U> {
    Value {
        seq: Option<u64>,
        value: U,
    },
    End,
    Failed(Error),
    UpstreamError(Error),
}

// Type-erased pre-start machinery: the element type of the upstream only
// exists inside this box.
trait ParallelParts<U: Send + 'static>: Send {
    fn start(self: Box<Self>) -> ParallelRunning<U>;
    fn stop(self: Box<Self>, reason: StopReason) -> BoxFuture<'static, Result<()>>;
}

struct TypedParts<T: Send + 'static, U: Send + 'static> {
    upstream: BoxReader<T>,
    inputs: Vec<QueueWriter<T>>,
    chains: Vec<BoxReader<U>>,
    seq_fifos: Vec<Arc<StdMutex<VecDeque<u64>>>>,
    shuffle: bool,
}

impl<T: Send + 'static, U: Send + 'static> ParallelParts<U> for TypedParts<T, U> {
    fn start(self: Box<Self>) -> ParallelRunning<U> {
        let TypedParts {
            mut upstream,
            mut inputs,
            chains,
            seq_fifos,
            shuffle,
        } = *self;
        let count = chains.len();
        let token = CancellationToken::new();
        let reason: Arc<StdMutex<Option<StopReason>>> = Arc::new(StdMutex::new(None));
        let (tx, rx) = mpsc::channel(count.max(1) * 2);
        let mut handles = Vec::with_capacity(count + 1);

        // dispatcher: round-robin with lossless writes, so a busy worker
        // exerts backpressure on the upstream pull
        let dispatch_token = token.clone();
        let dispatch_reason = reason.clone();
        let dispatch_tx = tx.clone();
        let dispatch_fifos = seq_fifos.clone();
        handles.push(tokio::spawn(async move {
            let mut n: u64 = 0;
            // true once the upstream is terminal on its own and needs no
            // release from us
            let mut upstream_done = false;
            loop {
                let item = tokio::select! { biased;
                    _ = dispatch_token.cancelled() => break,
                    item = upstream.read() => item,
                };
                match item {
                    Ok(Some(value)) => {
                        let w = (n % count as u64) as usize;
                        dispatch_fifos[w].lock().unwrap().push_back(n);
                        n += 1;
                        let written = tokio::select! { biased;
                            _ = dispatch_token.cancelled() => break,
                            written = inputs[w].write(Some(value)) => written,
                        };
                        if written.is_err() {
                            // the worker's input queue closed under us
                            break;
                        }
                    }
                    Ok(None) => {
                        for input in inputs.iter_mut() {
                            let _ = input.write(None).await;
                        }
                        upstream_done = true;
                        break;
                    }
                    Err(e) => {
                        let _ = dispatch_tx.send(WorkerMsg::UpstreamError(e)).await;
                        for input in inputs.iter_mut() {
                            let _ = input.write(None).await;
                        }
                        upstream_done = true;
                        break;
                    }
                }
            }
            let requested = dispatch_reason.lock().unwrap().clone();
            match requested {
                Some(r) => {
                    trace!(reason = %r, "parallel dispatcher stopping upstream");
                    let _ = upstream.stop(r).await;
                }
                None if !upstream_done => {
                    let _ = upstream.stop(StopReason::None).await;
                }
                None => {}
            }
        }));

        for (index, mut chain) in chains.into_iter().enumerate() {
            let tx = tx.clone();
            let token = token.clone();
            let reason = reason.clone();
            let fifo = seq_fifos[index].clone();
            handles.push(tokio::spawn(async move {
                loop {
                    let item = tokio::select! { biased;
                        _ = token.cancelled() => break,
                        item = chain.read() => item,
                    };
                    match item {
                        Ok(Some(value)) => {
                            let seq = fifo.lock().unwrap().pop_front();
                            if tx.send(WorkerMsg::Value { seq, value }).await.is_err() {
                                break;
                            }
                        }
                        Ok(None) => {
                            let _ = tx.send(WorkerMsg::End).await;
                            break;
                        }
                        Err(e) => {
                            let _ = tx.send(WorkerMsg::Failed(e)).await;
                            break;
                        }
                    }
                }
                let requested = reason.lock().unwrap().clone();
                if let Some(r) = requested {
                    let _ = chain.stop(r).await;
                }
            }));
        }

        ParallelRunning {
            rx,
            token,
            reason,
            handles,
            active: count,
            reorder: BTreeMap::new(),
            next_seq: 0,
            upstream_error: None,
            shuffle,
        }
    }

    fn stop(self: Box<Self>, reason: StopReason) -> BoxFuture<'static, Result<()>> {
        let TypedParts {
            mut upstream,
            mut chains,
            ..
        } = *self;
        Box::pin(async move {
            upstream.stop(reason.clone()).await?;
            for chain in chains.iter_mut() {
                chain.stop(reason.clone()).await?;
            }
            Ok(())
        })
    }
}

struct ParallelRunning<U> {
    rx: mpsc::Receiver<WorkerMsg<U>>,
    token: CancellationToken,
    reason: Arc<StdMutex<Option<StopReason>>>,
    handles: Vec<JoinHandle<()>>,
    active: usize,
    reorder: BTreeMap<u64, U>,
    next_seq: u64,
    upstream_error: Option<Error>,
    shuffle: bool,
}

impl<U> ParallelRunning<U> {
    fn take_in_order(&mut self) -> Option<U> {
        let first = *self.reorder.keys().next()?;
        if first == self.next_seq {
            self.next_seq += 1;
            return self.reorder.remove(&first);
        }
        None
    }

    // once every worker is done, gaps cannot fill anymore
    fn flush(&mut self) -> Option<U> {
        let first = *self.reorder.keys().next()?;
        self.next_seq = first + 1;
        self.reorder.remove(&first)
    }
}

/// Merged reader produced by [`parallel`](crate::ReaderExt::parallel).
///
/// Order preservation assumes each worker chain emits one output per
/// input; with shuffling enabled there is no such constraint.
pub struct Parallel<U: Send + 'static> {
    parts: Option<Box<dyn ParallelParts<U>>>,
    running: Option<ParallelRunning<U>>,
    done: bool,
    pending: Option<Error>,
}

impl<U: Send + 'static> Parallel<U> {
    pub(crate) fn new<T, F>(upstream: BoxReader<T>, options: ParallelOptions, mut f: F) -> Self
    where
        T: Send + 'static,
        F: FnMut(QueueReader<T>) -> BoxReader<U>,
    {
        assert!(options.count > 0, "parallel needs at least one worker");
        let mut inputs = Vec::with_capacity(options.count);
        let mut chains = Vec::with_capacity(options.count);
        let mut seq_fifos = Vec::with_capacity(options.count);
        for _ in 0..options.count {
            let (writer, reader) = queue(1);
            inputs.push(writer);
            chains.push(f(reader));
            seq_fifos.push(Arc::new(StdMutex::new(VecDeque::new())));
        }
        Self {
            parts: Some(Box::new(TypedParts {
                upstream,
                inputs,
                chains,
                seq_fifos,
                shuffle: options.shuffle,
            })),
            running: None,
            done: false,
            pending: None,
        }
    }
}

#[async_trait]
impl<U: Send + 'static> Reader for Parallel<U> {
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
            match self.parts.take() {
                Some(parts) => self.running = Some(parts.start()),
                None => {
                    self.done = true;
                    return Ok(None);
                }
            }
        }
        let Some(running) = self.running.as_mut() else {
            self.done = true;
            return Ok(None);
        };
        loop {
            if !running.shuffle {
                if let Some(value) = running.take_in_order() {
                    return Ok(Some(value));
                }
            }
            if running.active == 0 {
                if let Some(value) = running.flush() {
                    return Ok(Some(value));
                }
                self.done = true;
                return match running.upstream_error.take() {
                    Some(e) => Err(e),
                    None => Ok(None),
                };
            }
            match running.rx.recv().await {
                Some(WorkerMsg::Value { seq, value }) => {
                    if running.shuffle {
                        return Ok(Some(value));
                    }
                    match seq {
                        Some(s) => {
                            running.reorder.insert(s, value);
                        }
                        // a chain that emits more than one output per
                        // input has no slot to wait for
                        None => return Ok(Some(value)),
                    }
                }
                Some(WorkerMsg::End) => running.active -= 1,
                Some(WorkerMsg::Failed(e)) => {
                    self.done = true;
                    *running.reason.lock().unwrap() = Some(StopReason::error(e.clone()));
                    running.token.cancel();
                    return Err(e);
                }
                Some(WorkerMsg::UpstreamError(e)) => {
                    // surfaces after the outputs already in flight
                    running.upstream_error = Some(e);
                }
                None => running.active = 0,
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
        if let Some(parts) = self.parts.take() {
            return parts.stop(reason).await;
        }
        if let Some(running) = self.running.as_mut() {
            *running.reason.lock().unwrap() = Some(reason);
            running.token.cancel();
            for handle in running.handles.drain(..) {
                let _ = handle.await;
            }
            running.rx.close();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::traits::ReaderExt;
    use crate::pipe::PipeExt;
    use crate::sources::IterReader;

    #[tokio::test]
    async fn parallel_preserves_input_order() {
        let squared = IterReader::new(0..10i64)
            .parallel(4, |source| {
                source
                    .then(|n| async move {
                        tokio::time::sleep(std::time::Duration::from_millis(n as u64 % 3)).await;
                        Ok(n)
                    })
                    .map(|n| n * n)
                    .boxed()
            })
            .to_array()
            .await
            .unwrap();
        assert_eq!(squared, vec![0, 1, 4, 9, 16, 25, 36, 49, 64, 81]);
    }

    #[tokio::test]
    async fn parallel_shuffle_emits_everything() {
        let mut out = IterReader::new(0..20i64)
            .parallel_with(ParallelOptions::shuffle(3), |source| {
                source.map(|n| n * 2).boxed()
            })
            .to_array()
            .await
            .unwrap();
        out.sort_unstable();
        assert_eq!(out, (0..20i64).map(|n| n * 2).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn parallel_worker_error_cancels_the_merge() {
        let result = IterReader::new(0..100i64)
            .parallel(2, |source| {
                source
                    .map_result(|n, _| {
                        if n == 5 {
                            Err(Error::custom("worker exploded"))
                        } else {
                            Ok(n)
                        }
                    })
                    .boxed()
            })
            .to_array()
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn dequeue_merges_by_arrival() {
        let slow = IterReader::new(0..3i64)
            .then(|n| async move {
                tokio::time::sleep(std::time::Duration::from_millis(30)).await;
                Ok(n)
            })
            .boxed();
        let fast = IterReader::new(10..13i64).boxed();
        let merged = Dequeue::new(vec![slow, fast]).to_array().await.unwrap();
        assert_eq!(merged.len(), 6);
        // the fast branch lands first
        assert_eq!(merged[0], 10);
    }

    #[tokio::test]
    async fn join_merges_cycle_by_cycle() {
        let left = IterReader::new(0..3i64).boxed();
        let right = IterReader::new(100..103i64).boxed();
        let sums = Join::new(vec![left, right], |slots: &mut [Option<i64>]| {
            let a = slots[0].take().unwrap_or(0);
            let b = slots[1].take().unwrap_or(0);
            Ok(a + b)
        })
        .to_array()
        .await
        .unwrap();
        assert_eq!(sums, vec![100, 102, 104]);
    }

    #[tokio::test]
    async fn join_repulls_only_cleared_slots() {
        let left = IterReader::new(vec![1i64, 2].into_iter()).boxed();
        let right = IterReader::new(vec![10i64, 20].into_iter()).boxed();
        // prefer the left slot; the right value stays parked until the
        // left branch runs dry
        let out = Join::new(vec![left, right], |slots: &mut [Option<i64>]| {
            Ok(match slots[0].take() {
                Some(v) => v,
                None => slots[1].take().unwrap_or(-1),
            })
        })
        .to_array()
        .await
        .unwrap();
        assert_eq!(out, vec![1, 2, 10, 20]);
    }
}
