//! End-to-end tests for chain composition, fan-out arbitration and stop
//! propagation.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use pullstream::prelude::*;

/// Records how many values a source delivered and the position/reason of
/// the stop it observed, if any.
#[derive(Default)]
struct ProbeLog {
    delivered: usize,
    stopped: Option<(usize, String)>,
}

struct Probe<R> {
    upstream: R,
    log: Arc<StdMutex<ProbeLog>>,
}

impl<R> Probe<R> {
    fn new(upstream: R) -> (Self, Arc<StdMutex<ProbeLog>>) {
        let log = Arc::new(StdMutex::new(ProbeLog::default()));
        (
            Self {
                upstream,
                log: log.clone(),
            },
            log,
        )
    }
}

#[async_trait]
impl<R: Reader> Reader for Probe<R> {
    type Item = R::Item;

    async fn read(&mut self) -> Result<Option<Self::Item>> {
        let item = self.upstream.read().await;
        if let Ok(Some(_)) = &item {
            self.log.lock().unwrap().delivered += 1;
        }
        item
    }

    async fn stop(&mut self, reason: StopReason) -> Result<()> {
        {
            let mut log = self.log.lock().unwrap();
            if log.stopped.is_none() {
                log.stopped = Some((log.delivered, reason.to_string()));
            }
        }
        self.upstream.stop(reason).await
    }
}

fn numbers(n: i64) -> ArrayReader<i64> {
    ArrayReader::new((0..n).collect()).sync(true)
}

#[tokio::test]
async fn limit_stops_upstream_at_the_right_position() {
    let (source, log) = Probe::new(numbers(100));
    let window = source.skip(2).limit(5).to_array().await.unwrap();
    assert_eq!(window, vec![2, 3, 4, 5, 6]);
    let log = log.lock().unwrap();
    assert_eq!(log.stopped, Some((7, "none".to_string())));
}

#[tokio::test]
async fn concat_stops_only_the_active_and_unstarted_upstreams() {
    let (s1, log1) = Probe::new(numbers(5));
    let (s2, log2) = Probe::new(numbers(5));
    let (s3, log3) = Probe::new(numbers(5));

    let out = s1
        .concat(vec![s2.boxed(), s3.boxed()])
        .limit(7)
        .to_array()
        .await
        .unwrap();
    assert_eq!(out, vec![0, 1, 2, 3, 4, 0, 1]);

    // s1 ran to its natural end
    assert_eq!(log1.lock().unwrap().stopped, None);
    assert_eq!(
        log2.lock().unwrap().stopped,
        Some((2, "none".to_string()))
    );
    assert_eq!(
        log3.lock().unwrap().stopped,
        Some((0, "none".to_string()))
    );
}

#[tokio::test]
async fn dup_silent_stop_still_delivers_queued_values_to_the_peer() {
    let (source, log) = Probe::new(numbers(5));
    let (a, b) = source.dup();
    let mut a = a.limit_with(2, StopReason::Silent);

    assert_eq!(a.read().await.unwrap(), Some(0));
    assert_eq!(a.read().await.unwrap(), Some(1));
    // let the shared pump run one value ahead for the peer
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(a.read().await.unwrap(), None);

    // value 2 was already queued on b when the silent stop propagated
    assert_eq!(b.to_array().await.unwrap(), vec![0, 1, 2]);
    assert!(log.lock().unwrap().stopped.is_some());
}

#[tokio::test]
async fn dup_error_stop_aborts_the_peer() {
    let (source, log) = Probe::new(numbers(5));
    let (a, b) = source.dup();
    let mut a = a.limit_with(2, StopReason::error(Error::custom("testing")));

    assert_eq!(a.read().await.unwrap(), Some(0));
    assert_eq!(a.read().await.unwrap(), Some(1));
    assert_eq!(a.read().await.unwrap(), None);

    let failure = b.to_array().await.unwrap_err();
    assert_eq!(failure.to_string(), "testing");
    let log = log.lock().unwrap();
    let (_, reason) = log.stopped.as_ref().expect("source stopped");
    assert!(reason.contains("testing"));
}

#[tokio::test]
async fn dup_is_commutative_over_branch_order() {
    let (a, b) = numbers(6).dup();
    let (left, right) = tokio::join!(a.to_array(), b.to_array());
    assert_eq!(left.unwrap(), right.unwrap());

    let (a, b) = numbers(6).dup();
    // drain in the opposite order
    let right = b.to_array().await.unwrap();
    let left = a.to_array().await.unwrap();
    assert_eq!(left, right);
}

#[tokio::test]
async fn transform_many_to_one_batches() {
    let out = numbers(12)
        .transform(|mut input, mut output| async move {
            let mut acc = String::new();
            while let Some(n) = input.read().await? {
                acc.push_str(&format!("-{}", n));
                if n % 5 == 4 {
                    output.write(Some(std::mem::take(&mut acc))).await?;
                }
            }
            if !acc.is_empty() {
                output.write(Some(acc)).await?;
            }
            Ok(())
        })
        .to_array()
        .await
        .unwrap();
    assert_eq!(out, vec!["-0-1-2-3-4", "-5-6-7-8-9", "-10-11"]);
}

#[tokio::test]
async fn parallel_preserves_order_across_random_delays() {
    use rand::Rng;

    let squares = IterReader::new(0i64..)
        .limit(10)
        .parallel(4, |source| {
            source
                .then(|n| async move {
                    let ms = rand::thread_rng().gen_range(0..10);
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                    Ok(n)
                })
                .map(|n| n * n)
                .boxed()
        })
        .to_array()
        .await
        .unwrap();
    assert_eq!(squares, vec![0, 1, 4, 9, 16, 25, 36, 49, 64, 81]);
}

#[tokio::test]
async fn queue_put_is_lossy_and_write_is_lossless() {
    // lossy puts against a full queue
    let (mut w, r) = queue(4);
    let accepted: Vec<bool> = (0..6).map(|n| w.put(n)).collect();
    assert_eq!(accepted, vec![true, true, true, true, false, false]);
    w.end();
    assert_eq!(r.to_array().await.unwrap(), vec![0, 1, 2, 3]);

    // lossless writes interleaved with a live reader
    let (mut w, r) = queue(4);
    let producer = tokio::spawn(async move {
        for n in 0..6 {
            w.write(Some(n)).await.unwrap();
        }
        w.write(None).await.unwrap();
    });
    assert_eq!(r.to_array().await.unwrap(), vec![0, 1, 2, 3, 4, 5]);
    producer.await.unwrap();
}

#[tokio::test]
async fn read_all_distributes_over_concat() {
    let whole = StringReader::new("alpha ")
        .chunk_size(2)
        .concat(vec![StringReader::new("beta").chunk_size(3).boxed()])
        .read_all()
        .await
        .unwrap();
    let first = StringReader::new("alpha ").read_all().await.unwrap();
    let second = StringReader::new("beta").read_all().await.unwrap();
    assert_eq!(whole, format!("{}{}", first, second));
}

#[tokio::test]
async fn map_commutes_with_to_array() {
    let mapped_then_collected = numbers(20).map(|n| n * 3).to_array().await.unwrap();
    let collected_then_mapped: Vec<i64> = numbers(20)
        .to_array()
        .await
        .unwrap()
        .into_iter()
        .map(|n| n * 3)
        .collect();
    assert_eq!(mapped_then_collected, collected_then_mapped);
}

#[tokio::test]
async fn stopped_reader_does_not_resurrect() {
    let mut reader = numbers(10).map(|n| n + 1);
    assert_eq!(reader.read().await.unwrap(), Some(1));
    reader.stop(StopReason::None).await.unwrap();
    assert_eq!(reader.read().await.unwrap(), None);
    assert_eq!(reader.read().await.unwrap(), None);

    let mut reader = numbers(10).map(|n| n + 1);
    reader
        .stop(StopReason::error(Error::custom("aborted")))
        .await
        .unwrap();
    assert!(reader.read().await.is_err());
    assert_eq!(reader.read().await.unwrap(), None);
}

#[tokio::test]
async fn fork_dequeue_and_join_merge_the_same_branches() {
    let fork = numbers(4).fork(vec![
        Box::new(|branch: FanBranch<i64>| branch.map(|n| (0, n)).boxed()) as ForkConsumer<_, _>,
        Box::new(|branch: FanBranch<i64>| branch.map(|n| (1, n)).boxed()),
    ]);
    let mut merged = fork.dequeue().to_array().await.unwrap();
    merged.sort();
    assert_eq!(
        merged,
        vec![
            (0, 0),
            (0, 1),
            (0, 2),
            (0, 3),
            (1, 0),
            (1, 1),
            (1, 2),
            (1, 3)
        ]
    );

    let fork = numbers(3).fork(vec![
        Box::new(|branch: FanBranch<i64>| branch.boxed()) as ForkConsumer<_, _>,
        Box::new(|branch: FanBranch<i64>| branch.map(|n| n * 10).boxed()),
    ]);
    let sums = fork
        .join(|slots: &mut [Option<i64>]| {
            let a = slots[0].take().unwrap_or(0);
            let b = slots[1].take().unwrap_or(0);
            Ok(a + b)
        })
        .to_array()
        .await
        .unwrap();
    assert_eq!(sums, vec![0, 11, 22]);
}

#[tokio::test]
async fn fork_branch_detach_leaves_the_rest_running() {
    let fork = numbers(4).fork(vec![
        Box::new(|branch: FanBranch<i64>| branch.limit(1).boxed()) as ForkConsumer<_, _>,
        Box::new(|branch: FanBranch<i64>| branch.boxed()),
    ]);
    let mut readers = fork.into_readers();
    let tail = readers.pop().unwrap();
    let mut head = readers.pop().unwrap();

    assert_eq!(head.read().await.unwrap(), Some(0));
    assert_eq!(head.read().await.unwrap(), None);
    assert_eq!(tail.to_array().await.unwrap(), vec![0, 1, 2, 3]);
}

#[tokio::test]
async fn tee_secondary_is_stopped_with_the_chain_reason() {
    let observed: Arc<StdMutex<Vec<String>>> = Arc::new(StdMutex::new(Vec::new()));
    let observed_probe = observed.clone();
    let secondary = GenericWriter::new(|_item: Option<i64>| async move { Ok(()) }).with_stop(
        move |reason| {
            let observed = observed_probe.clone();
            let label = reason.to_string();
            async move {
                observed.lock().unwrap().push(label);
                Ok(())
            }
        },
    );

    // the chain ends early, so the secondary must be stopped, not ended
    let out = numbers(10).tee(secondary).limit(3).to_array().await.unwrap();
    assert_eq!(out, vec![0, 1, 2]);

    // a fully drained chain instead closes the secondary with the end marker
    let drained = GenericWriter::new(|_item: Option<i64>| async move { Ok(()) });
    let out = numbers(3).tee(drained).to_array().await.unwrap();
    assert_eq!(out, vec![0, 1, 2]);

    assert_eq!(*observed.lock().unwrap(), vec!["none".to_string()]);
}

#[tokio::test]
async fn fork_silent_stop_closes_the_other_branches() {
    let (source, log) = Probe::new(numbers(6));
    let fork = source.fork(vec![
        Box::new(|branch: FanBranch<i64>| branch.limit_with(1, StopReason::Silent).boxed())
            as ForkConsumer<_, _>,
        Box::new(|branch: FanBranch<i64>| branch.boxed()),
        Box::new(|branch: FanBranch<i64>| branch.boxed()),
    ]);
    let mut readers = fork.into_readers();
    let third = readers.pop().unwrap();
    let second = readers.pop().unwrap();
    let mut first = readers.pop().unwrap();

    assert_eq!(first.read().await.unwrap(), Some(0));
    assert_eq!(first.read().await.unwrap(), None);

    // peers end quietly after draining whatever was already queued
    let second = second.to_array().await.unwrap();
    let third = third.to_array().await.unwrap();
    assert!(second.len() < 6);
    assert_eq!(second, third);

    let log = log.lock().unwrap();
    let (_, reason) = log.stopped.as_ref().expect("source stopped");
    assert_eq!(reason, "silent");
}

#[tokio::test]
async fn accumulating_sink_keeps_partial_output_after_failure() {
    let sink = ArrayWriter::new();
    let partial = sink.items();
    let source = numbers(10).map_result(|n, _| {
        if n == 3 {
            Err(Error::custom("mid-stream failure"))
        } else {
            Ok(n)
        }
    });
    let result = source.pipe(sink).await;
    assert!(result.is_err());
    assert_eq!(*partial.lock().await, vec![0, 1, 2]);
}
