//! Result channel with a configurable backpressure policy

use crate::config::BackpressurePolicy;
use crate::performance::PerformanceMetrics;
use crate::task::FrameResult;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Dropped task ids kept for consumers that re-sequence results
const DROPPED_ID_HISTORY: usize = 1024;

/// What happened to a delivered result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// Delivered after evicting the oldest undelivered result
    EvictedOldest,
    /// Channel stayed full; this result was discarded
    Dropped,
}

/// Bounded single-consumer result channel.
///
/// Producers never block unless the policy is `BlockWithTimeout`; every
/// discarded result is counted and logged.
pub(crate) struct ResultChannel {
    tx: mpsc::Sender<FrameResult>,
    rx: Arc<Mutex<mpsc::Receiver<FrameResult>>>,
    policy: BackpressurePolicy,
    metrics: Arc<PerformanceMetrics>,
    /// Set once no further results will be produced
    closed: CancellationToken,
    /// Most recent dropped task ids, oldest first
    dropped_ids: parking_lot::Mutex<VecDeque<u64>>,
}

impl ResultChannel {
    pub fn new(capacity: usize, policy: BackpressurePolicy, metrics: Arc<PerformanceMetrics>) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            tx,
            rx: Arc::new(Mutex::new(rx)),
            policy,
            metrics,
            closed: CancellationToken::new(),
            dropped_ids: parking_lot::Mutex::new(VecDeque::new()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.tx.max_capacity()
    }

    /// Results waiting for the consumer
    pub fn len(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub async fn deliver(&self, result: FrameResult) -> Delivery {
        let result = match self.tx.try_send(result) {
            Ok(()) => return Delivery::Delivered,
            Err(TrySendError::Full(result)) => result,
            Err(TrySendError::Closed(result)) => return self.drop_result(result, "channel closed"),
        };

        match self.policy {
            BackpressurePolicy::DropNewest => self.drop_result(result, "result channel full"),
            BackpressurePolicy::DropOldest => self.deliver_evicting(result),
            BackpressurePolicy::BlockWithTimeout(timeout) => {
                let (id, frame_number) = (result.id, result.frame_number());
                match tokio::time::timeout(timeout, self.tx.send(result)).await {
                    Ok(Ok(())) => Delivery::Delivered,
                    Ok(Err(err)) => self.drop_result(err.0, "channel closed"),
                    Err(_) => {
                        self.record_drop(id);
                        warn!(
                            "Result channel full for {:?}, dropped result for frame {} (task {})",
                            timeout, frame_number, id
                        );
                        Delivery::Dropped
                    }
                }
            }
        }
    }

    fn deliver_evicting(&self, result: FrameResult) -> Delivery {
        // A consumer holding the lock is waiting on an empty channel, so
        // there is nothing to evict.
        let evicted = match self.rx.try_lock() {
            Ok(mut rx) => match rx.try_recv() {
                Ok(old) => Some(old),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
            },
            Err(_) => None,
        };

        if let Some(old) = &evicted {
            self.record_drop(old.id);
            warn!(
                "Result channel full, evicted result for frame {} (task {})",
                old.frame_number(),
                old.id
            );
        }

        match self.tx.try_send(result) {
            Ok(()) if evicted.is_some() => Delivery::EvictedOldest,
            Ok(()) => Delivery::Delivered,
            Err(TrySendError::Full(result)) | Err(TrySendError::Closed(result)) => {
                self.drop_result(result, "result channel full")
            }
        }
    }

    fn drop_result(&self, result: FrameResult, why: &str) -> Delivery {
        self.record_drop(result.id);
        warn!("{}, dropped result for frame {} (task {})", why, result.frame_number(), result.id);
        Delivery::Dropped
    }

    fn record_drop(&self, id: u64) {
        self.metrics.record_dropped_result();
        let mut ids = self.dropped_ids.lock();
        if ids.len() == DROPPED_ID_HISTORY {
            ids.pop_front();
        }
        ids.push_back(id);
    }

    /// Ids of results dropped since the last call
    pub fn take_dropped_ids(&self) -> Vec<u64> {
        self.dropped_ids.lock().drain(..).collect()
    }

    /// Wait for the next result. Returns `None` once the channel has been
    /// closed and drained.
    pub async fn recv(&self) -> Option<FrameResult> {
        let mut rx = self.rx.lock().await;
        tokio::select! {
            biased;
            result = rx.recv() => result,
            _ = self.closed.cancelled() => rx.try_recv().ok(),
        }
    }

    /// Next result if one is ready and no other consumer is waiting.
    pub fn try_recv(&self) -> Option<FrameResult> {
        let mut rx = self.rx.try_lock().ok()?;
        rx.try_recv().ok()
    }

    pub fn close(&self) {
        self.closed.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_core::Frame;
    use std::time::Duration;

    fn result(id: u64) -> FrameResult {
        FrameResult {
            id,
            frame: Frame::solid(1, 1, [0, 0, 0], id, Duration::ZERO).unwrap(),
            outcome: Ok(Vec::new()),
            latency: Duration::ZERO,
            inline: false,
        }
    }

    fn channel(capacity: usize, policy: BackpressurePolicy) -> (ResultChannel, Arc<PerformanceMetrics>) {
        let metrics = Arc::new(PerformanceMetrics::new());
        (ResultChannel::new(capacity, policy, metrics.clone()), metrics)
    }

    #[tokio::test]
    async fn test_drop_newest() {
        let (ch, metrics) = channel(2, BackpressurePolicy::DropNewest);
        assert_eq!(ch.deliver(result(1)).await, Delivery::Delivered);
        assert_eq!(ch.deliver(result(2)).await, Delivery::Delivered);
        assert_eq!(ch.deliver(result(3)).await, Delivery::Dropped);
        assert_eq!(ch.len(), 2);
        assert_eq!(metrics.snapshot().dropped_results, 1);
        assert_eq!(ch.take_dropped_ids(), vec![3]);
        assert!(ch.take_dropped_ids().is_empty());

        assert_eq!(ch.try_recv().map(|r| r.id), Some(1));
        assert_eq!(ch.try_recv().map(|r| r.id), Some(2));
        assert!(ch.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_drop_oldest() {
        let (ch, metrics) = channel(2, BackpressurePolicy::DropOldest);
        ch.deliver(result(1)).await;
        ch.deliver(result(2)).await;
        assert_eq!(ch.deliver(result(3)).await, Delivery::EvictedOldest);
        assert_eq!(metrics.snapshot().dropped_results, 1);
        assert_eq!(ch.take_dropped_ids(), vec![1]);

        assert_eq!(ch.recv().await.map(|r| r.id), Some(2));
        assert_eq!(ch.recv().await.map(|r| r.id), Some(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_block_with_timeout() {
        let (ch, metrics) = channel(1, BackpressurePolicy::BlockWithTimeout(Duration::from_millis(50)));
        let ch = Arc::new(ch);
        ch.deliver(result(1)).await;
        assert_eq!(ch.deliver(result(2)).await, Delivery::Dropped);
        assert_eq!(metrics.snapshot().dropped_results, 1);
        assert_eq!(ch.take_dropped_ids(), vec![2]);

        let producer = {
            let ch = ch.clone();
            tokio::spawn(async move { ch.deliver(result(3)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(ch.recv().await.map(|r| r.id), Some(1));
        assert_eq!(producer.await.unwrap(), Delivery::Delivered);
        assert_eq!(ch.recv().await.map(|r| r.id), Some(3));
    }

    #[tokio::test]
    async fn test_dropped_id_history_is_bounded() {
        let (ch, metrics) = channel(1, BackpressurePolicy::DropNewest);
        ch.deliver(result(0)).await;
        for id in 1..=(DROPPED_ID_HISTORY as u64 + 5) {
            ch.deliver(result(id)).await;
        }
        let ids = ch.take_dropped_ids();
        assert_eq!(ids.len(), DROPPED_ID_HISTORY);
        assert_eq!(ids.first(), Some(&6));
        assert_eq!(metrics.snapshot().dropped_results, DROPPED_ID_HISTORY as u64 + 5);
    }

    #[tokio::test]
    async fn test_recv_returns_none_after_close() {
        let (ch, _) = channel(2, BackpressurePolicy::DropNewest);
        ch.deliver(result(1)).await;
        ch.close();
        assert_eq!(ch.recv().await.map(|r| r.id), Some(1));
        assert!(ch.recv().await.is_none());
    }
}
