// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! In-memory queue broker: accepts events from producer handles over the
//! bounded ingress channel, buffers them FIFO, serves batches to the event
//! consumer, and settles acknowledgement bookkeeping when batches come back.
//!
//! The broker is a single task. Ingress is only polled while the buffer has
//! room, so a full queue suspends blocking publishes and sheds non-blocking
//! ones at the producer side.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::config::PipelineConfig;
use crate::errors::QueueError;
use crate::event::Event;
use crate::producer::{
    AckState, CancelRequest, CancelResponse, Producer, ProducerParams, PushRequest,
};
use crate::states::{self, ClientState, ClientStates};

/// A group of events pulled from the queue for one forwarding attempt.
/// Committing or discarding the batch releases its slots in the broker's
/// client table; a batch dropped without either leaves that to the retry
/// collaborator.
pub struct QueueBatch {
    events: Vec<Event>,
    ack_tx: mpsc::UnboundedSender<BatchDisposition>,
}

impl QueueBatch {
    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Reports the whole batch as durably handled. ACK callbacks fire on the
    /// broker task.
    pub fn ack(self) {
        let count = self.events.len();
        let _ = self.ack_tx.send(BatchDisposition::Committed(count));
    }

    /// Abandons the batch. Drop callbacks fire for every acking event.
    pub fn discard(self) {
        let _ = self.ack_tx.send(BatchDisposition::Discarded(self.events));
    }

    /// Releases the events without settling them, for requeue by the retry
    /// collaborator.
    pub fn into_events(self) -> Vec<Event> {
        self.events
    }
}

enum BatchDisposition {
    Committed(usize),
    Discarded(Vec<Event>),
}

struct GetRequest {
    max: usize,
    closed: CancellationToken,
    response_tx: oneshot::Sender<QueueBatch>,
}

/// Point-in-time broker occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    /// Events buffered and not yet pulled by the consumer.
    pub buffered: usize,
    /// Events pulled by the consumer and not yet committed or discarded.
    pub outstanding: usize,
}

/// Handle used by the event consumer to pull batches from the broker. Clones
/// share the same close signal.
#[derive(Clone)]
pub struct ConsumerHandle {
    get_tx: mpsc::Sender<GetRequest>,
    closed: CancellationToken,
}

impl ConsumerHandle {
    /// Pulls up to `max` events, suspending until some are available.
    /// Returns `Err(Closed)` once the handle has been invalidated.
    pub async fn get(&self, max: usize) -> Result<QueueBatch, QueueError> {
        if self.closed.is_cancelled() {
            return Err(QueueError::Closed);
        }

        let (response_tx, response_rx) = oneshot::channel();
        let req = GetRequest {
            max,
            closed: self.closed.clone(),
            response_tx,
        };
        if self.get_tx.send(req).await.is_err() {
            return Err(QueueError::Closed);
        }

        // the broker drops the request when the close signal fires, which
        // fails this await promptly
        response_rx.await.map_err(|_| QueueError::Closed)
    }

    /// Invalidates the handle. In-flight and future `get` calls return
    /// `Err(Closed)`. Idempotent.
    pub fn close(&self) {
        self.closed.cancel();
    }
}

/// Caller-facing connection to a running broker.
#[derive(Clone)]
pub struct Queue {
    push_tx: mpsc::Sender<PushRequest>,
    cancel_tx: mpsc::Sender<CancelRequest>,
    get_tx: mpsc::Sender<GetRequest>,
    stats_tx: mpsc::Sender<oneshot::Sender<QueueStats>>,
    shutdown: CancellationToken,
}

impl Queue {
    /// Opens a new producer handle.
    pub fn producer(&self, params: ProducerParams) -> Producer {
        Producer::new(self.push_tx.clone(), self.cancel_tx.clone(), params)
    }

    /// Opens a new consumer handle.
    pub fn consumer(&self) -> ConsumerHandle {
        ConsumerHandle {
            get_tx: self.get_tx.clone(),
            closed: CancellationToken::new(),
        }
    }

    /// Reports current broker occupancy.
    pub async fn stats(&self) -> Result<QueueStats, QueueError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.stats_tx
            .send(response_tx)
            .await
            .map_err(|_| QueueError::Closed)?;
        response_rx.await.map_err(|_| QueueError::Closed)
    }

    /// Stops the broker task. Buffered events are released.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

pub struct QueueBroker {
    push_rx: mpsc::Receiver<PushRequest>,
    cancel_rx: mpsc::Receiver<CancelRequest>,
    get_rx: mpsc::Receiver<GetRequest>,
    ack_rx: mpsc::UnboundedReceiver<BatchDisposition>,
    stats_rx: mpsc::Receiver<oneshot::Sender<QueueStats>>,
    shutdown: CancellationToken,
    core: BrokerCore,
}

impl QueueBroker {
    pub fn new(config: &PipelineConfig) -> (Self, Queue) {
        let (push_tx, push_rx) = mpsc::channel(config.ingress_buffer);
        let (cancel_tx, cancel_rx) = mpsc::channel(1);
        let (get_tx, get_rx) = mpsc::channel(1);
        let (stats_tx, stats_rx) = mpsc::channel(1);
        let (ack_tx, ack_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        let broker = Self {
            push_rx,
            cancel_rx,
            get_rx,
            ack_rx,
            stats_rx,
            shutdown: shutdown.clone(),
            core: BrokerCore {
                buffer: VecDeque::with_capacity(config.queue_capacity),
                states: ClientStates::default(),
                pending_get: None,
                outstanding: 0,
                capacity: config.queue_capacity,
                ack_tx,
            },
        };

        let queue = Queue {
            push_tx,
            cancel_tx,
            get_tx,
            stats_tx,
            shutdown,
        };

        (broker, queue)
    }

    pub async fn run(self) {
        let QueueBroker {
            mut push_rx,
            mut cancel_rx,
            mut get_rx,
            mut ack_rx,
            mut stats_rx,
            shutdown,
            mut core,
        } = self;

        debug!("queue broker started");

        loop {
            let room = core.buffer.len() < core.capacity;
            let pending_closed = core.pending_get.as_ref().map(|req| req.closed.clone());

            tokio::select! {
                _ = shutdown.cancelled() => break,

                Some(req) = push_rx.recv(), if room => core.on_push(req),

                Some(req) = cancel_rx.recv() => core.on_cancel(req),

                Some(req) = get_rx.recv() => core.on_get(req),

                Some(disposition) = ack_rx.recv() => core.on_disposition(disposition),

                Some(response_tx) = stats_rx.recv() => {
                    let _ = response_tx.send(QueueStats {
                        buffered: core.buffer.len(),
                        outstanding: core.outstanding,
                    });
                }

                _ = async {
                    match &pending_closed {
                        Some(token) => token.cancelled().await,
                        None => std::future::pending().await,
                    }
                } => {
                    // dropping the parked request fails the consumer's await
                    core.pending_get = None;
                }

                else => break,
            }
        }

        debug!("queue broker stopped");
    }
}

struct BrokerCore {
    buffer: VecDeque<Event>,
    states: ClientStates,
    pending_get: Option<GetRequest>,
    outstanding: usize,
    capacity: usize,
    ack_tx: mpsc::UnboundedSender<BatchDisposition>,
}

impl BrokerCore {
    fn on_push(&mut self, req: PushRequest) {
        let PushRequest { event, seq, state } = req;

        // a push that was already in the ingress channel when its producer
        // cancelled is dropped here, observed by the drop callback
        if let Some(state) = &state {
            if state.is_cancelled() {
                debug!(seq, "dropping event from cancelled producer");
                state.signal_drop(event);
                return;
            }
        }

        let depth = self.states.add(ClientState { seq, state });
        if self.buffer.len() >= self.capacity {
            // the ingress gate keeps this from happening in steady state; a
            // request pulled before re-buffered events filled the queue still
            // lands here
            let entry = self.states.remove_last();
            debug!(seq, "queue full, dropping event");
            if let Some(ClientState {
                state: Some(state), ..
            }) = entry
            {
                state.signal_drop(event);
            }
            return;
        }
        trace!(depth, seq, "buffered event");

        self.buffer.push_back(event);
        self.serve_pending_get();
    }

    fn on_get(&mut self, req: GetRequest) {
        // single consumer contract: a newly arrived request supersedes a
        // parked one from an invalidated handle
        self.pending_get = Some(req);
        self.serve_pending_get();
    }

    fn serve_pending_get(&mut self) {
        let Some(req) = self.pending_get.take() else {
            return;
        };
        if req.closed.is_cancelled() {
            return;
        }
        if self.buffer.is_empty() {
            self.pending_get = Some(req);
            return;
        }

        let count = req.max.clamp(1, self.buffer.len());
        let events: Vec<Event> = self.buffer.drain(..count).collect();
        let batch = QueueBatch {
            events,
            ack_tx: self.ack_tx.clone(),
        };

        match req.response_tx.send(batch) {
            Ok(()) => self.outstanding += count,
            Err(batch) => {
                // the handle vanished between park and serve; put the events
                // back in order
                for event in batch.events.into_iter().rev() {
                    self.buffer.push_front(event);
                }
            }
        }
    }

    fn on_disposition(&mut self, disposition: BatchDisposition) {
        match disposition {
            BatchDisposition::Committed(count) => {
                let count = count.min(self.outstanding);
                self.outstanding -= count;
                states::ack_popped(self.states.pop(count));
            }
            BatchDisposition::Discarded(events) => {
                let count = events.len().min(self.outstanding);
                self.outstanding -= count;
                states::drop_popped(self.states.pop(count), events);
            }
        }
    }

    fn on_cancel(&mut self, req: CancelRequest) {
        req.state.mark_cancelled();
        let removed = self.remove_cancelled(&req.state);
        if req.response_tx.send(CancelResponse { removed }).is_err() {
            debug!("producer cancel response receiver dropped");
        }
    }

    /// Removes the cancelled producer's buffered events and counts its
    /// in-flight ones. Drop callbacks fire in queue order for every removed
    /// event.
    fn remove_cancelled(&mut self, state: &Arc<AckState>) -> usize {
        let accounting = self.states.remove_cancelled(state, self.outstanding);

        let mut dropped = Vec::with_capacity(accounting.buffered.len());
        for position in accounting.buffered.iter().rev() {
            if let Some(event) = self.buffer.remove(*position) {
                dropped.push(event);
            }
        }

        let removed = accounting.in_flight + dropped.len();
        for event in dropped.into_iter().rev() {
            state.signal_drop(event);
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::time::timeout;

    fn small_config() -> PipelineConfig {
        PipelineConfig {
            queue_capacity: 8,
            ingress_buffer: 8,
            ..Default::default()
        }
    }

    fn event(n: u64) -> Event {
        Event::new(n as i64, json!({"n": n}))
    }

    async fn wait_for(check: impl Fn() -> bool) -> bool {
        for _ in 0..200 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        check()
    }

    async fn wait_for_buffered(queue: &Queue, expected: usize) -> bool {
        for _ in 0..200 {
            if queue.stats().await.expect("stats failed").buffered == expected {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_publish_get_ack_round_trip() {
        let (broker, queue) = QueueBroker::new(&small_config());
        tokio::spawn(broker.run());

        let acked = Arc::new(AtomicUsize::new(0));
        let acked_cb = Arc::clone(&acked);
        let mut producer = queue.producer(ProducerParams::acked(
            move |count| {
                acked_cb.fetch_add(count, Ordering::SeqCst);
            },
            false,
        ));

        for n in 0..5 {
            assert!(producer.publish(event(n)).await);
        }
        assert!(wait_for_buffered(&queue, 5).await);

        let consumer = queue.consumer();
        let batch = timeout(Duration::from_secs(1), consumer.get(10))
            .await
            .expect("get timed out")
            .expect("get failed");
        assert_eq!(batch.len(), 5);
        batch.ack();

        assert!(wait_for(|| acked.load(Ordering::SeqCst) == 5).await);
        queue.shutdown();
    }

    #[tokio::test]
    async fn test_get_parks_until_events_arrive() {
        let (broker, queue) = QueueBroker::new(&small_config());
        tokio::spawn(broker.run());

        let consumer = queue.consumer();
        let get_task = tokio::spawn(async move { consumer.get(4).await });

        tokio::time::sleep(Duration::from_millis(20)).await;

        let mut producer = queue.producer(ProducerParams::fire_and_forget());
        assert!(producer.publish(event(1)).await);

        let batch = timeout(Duration::from_secs(1), get_task)
            .await
            .expect("get task timed out")
            .unwrap()
            .expect("get failed");
        assert_eq!(batch.len(), 1);
        queue.shutdown();
    }

    #[tokio::test]
    async fn test_closed_handle_fails_parked_get() {
        let (broker, queue) = QueueBroker::new(&small_config());
        tokio::spawn(broker.run());

        let consumer = queue.consumer();
        let parked = consumer.clone();
        let get_task = tokio::spawn(async move { parked.get(4).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        consumer.close();

        let result = timeout(Duration::from_secs(1), get_task)
            .await
            .expect("get task timed out")
            .unwrap();
        assert!(matches!(result, Err(QueueError::Closed)));
        assert!(matches!(consumer.get(4).await, Err(QueueError::Closed)));

        // nothing was lost: a fresh handle still sees later events
        let mut producer = queue.producer(ProducerParams::fire_and_forget());
        assert!(producer.publish(event(7)).await);

        let fresh = queue.consumer();
        let batch = timeout(Duration::from_secs(1), fresh.get(4))
            .await
            .expect("get timed out")
            .expect("get failed");
        assert_eq!(batch.len(), 1);
        assert_eq!(batch.events()[0].timestamp, 7);
        queue.shutdown();
    }

    #[tokio::test]
    async fn test_backpressure_sheds_try_publish() {
        // capacity 2 + ingress 2: a handful of events in flight at most
        // before shedding starts
        let config = PipelineConfig {
            queue_capacity: 2,
            ingress_buffer: 2,
            ..Default::default()
        };
        let (broker, queue) = QueueBroker::new(&config);
        tokio::spawn(broker.run());

        let mut producer = queue.producer(ProducerParams::fire_and_forget());

        let mut accepted = 0;
        for n in 0..50 {
            if producer.try_publish(event(n)) {
                accepted += 1;
            }
        }
        assert!(accepted < 50);
        assert!(accepted >= 2);
        queue.shutdown();
    }

    #[tokio::test]
    async fn test_cancel_counts_unacknowledged_events() {
        let (broker, queue) = QueueBroker::new(&small_config());
        tokio::spawn(broker.run());

        let dropped = Arc::new(AtomicUsize::new(0));
        let dropped_cb = Arc::clone(&dropped);
        let params = ProducerParams::acked(|_count| {}, true).with_drop_cb(move |_event| {
            dropped_cb.fetch_add(1, Ordering::SeqCst);
        });
        let mut producer = queue.producer(params);

        for n in 0..5 {
            assert!(producer.publish(event(n)).await);
        }
        assert!(wait_for_buffered(&queue, 5).await);

        // enqueue 5, none acknowledged yet, cancel -> 5
        assert_eq!(producer.cancel().await, 5);
        assert_eq!(dropped.load(Ordering::SeqCst), 5);
        queue.shutdown();
    }

    #[tokio::test]
    async fn test_cancel_after_partial_ack_counts_remainder() {
        let (broker, queue) = QueueBroker::new(&small_config());
        tokio::spawn(broker.run());

        let acked = Arc::new(AtomicUsize::new(0));
        let acked_cb = Arc::clone(&acked);
        let mut producer = queue.producer(ProducerParams::acked(
            move |count| {
                acked_cb.fetch_add(count, Ordering::SeqCst);
            },
            true,
        ));

        for n in 0..5 {
            assert!(producer.publish(event(n)).await);
        }
        assert!(wait_for_buffered(&queue, 5).await);

        let consumer = queue.consumer();
        let batch = timeout(Duration::from_secs(1), consumer.get(3))
            .await
            .expect("get timed out")
            .expect("get failed");
        assert_eq!(batch.len(), 3);
        batch.ack();
        assert!(wait_for(|| acked.load(Ordering::SeqCst) == 3).await);

        // enqueue 5, commit and ACK 3, cancel -> 2
        assert_eq!(producer.cancel().await, 2);
        queue.shutdown();
    }

    #[tokio::test]
    async fn test_discard_fires_drop_callbacks() {
        let (broker, queue) = QueueBroker::new(&small_config());
        tokio::spawn(broker.run());

        let acked = Arc::new(AtomicUsize::new(0));
        let dropped = Arc::new(AtomicUsize::new(0));
        let acked_cb = Arc::clone(&acked);
        let dropped_cb = Arc::clone(&dropped);
        let params = ProducerParams::acked(
            move |count| {
                acked_cb.fetch_add(count, Ordering::SeqCst);
            },
            false,
        )
        .with_drop_cb(move |_event| {
            dropped_cb.fetch_add(1, Ordering::SeqCst);
        });
        let mut producer = queue.producer(params);

        for n in 0..3 {
            assert!(producer.publish(event(n)).await);
        }
        assert!(wait_for_buffered(&queue, 3).await);

        let consumer = queue.consumer();
        let batch = timeout(Duration::from_secs(1), consumer.get(3))
            .await
            .expect("get timed out")
            .expect("get failed");
        batch.discard();

        assert!(wait_for(|| dropped.load(Ordering::SeqCst) == 3).await);
        assert_eq!(acked.load(Ordering::SeqCst), 0);
        queue.shutdown();
    }

    #[tokio::test]
    async fn test_mixed_producers_ack_independently() {
        let (broker, queue) = QueueBroker::new(&small_config());
        tokio::spawn(broker.run());

        let acked = Arc::new(AtomicUsize::new(0));
        let acked_cb = Arc::clone(&acked);
        let mut acking = queue.producer(ProducerParams::acked(
            move |count| {
                acked_cb.fetch_add(count, Ordering::SeqCst);
            },
            false,
        ));
        let mut forgetful = queue.producer(ProducerParams::fire_and_forget());

        assert!(acking.publish(event(1)).await);
        assert!(forgetful.publish(event(2)).await);
        assert!(acking.publish(event(3)).await);
        assert!(wait_for_buffered(&queue, 3).await);

        let consumer = queue.consumer();
        let batch = timeout(Duration::from_secs(1), consumer.get(8))
            .await
            .expect("get timed out")
            .expect("get failed");
        assert_eq!(batch.len(), 3);
        batch.ack();

        assert!(wait_for(|| acked.load(Ordering::SeqCst) == 2).await);
        queue.shutdown();
    }

    #[tokio::test]
    async fn test_events_preserve_order() {
        let (broker, queue) = QueueBroker::new(&small_config());
        tokio::spawn(broker.run());

        let mut producer = queue.producer(ProducerParams::fire_and_forget());
        for n in 0..6 {
            assert!(producer.publish(event(n)).await);
        }
        assert!(wait_for_buffered(&queue, 6).await);

        let consumer = queue.consumer();
        let first = consumer.get(3).await.expect("get failed");
        let second = consumer.get(3).await.expect("get failed");

        let order: Vec<i64> = first
            .events()
            .iter()
            .chain(second.events())
            .map(|e| e.timestamp)
            .collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4, 5]);
        queue.shutdown();
    }
}
