// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Producer handles used by input readers to push events into the queue
//! broker.
//!
//! Handles come in two variants: fire-and-forget handles provide no ACK
//! handling and no callbacks, while acking handles track a per-producer
//! sequence number and report back how many events were durably handled.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::event::Event;

/// Callback invoked with the count of newly acknowledged events.
pub type AckHandler = Box<dyn Fn(usize) + Send + Sync>;
/// Callback invoked with each event abandoned before acknowledgement.
pub type DropHandler = Box<dyn Fn(Event) + Send + Sync>;

/// The wire unit sent over the ingress channel. Sequence number and state
/// are only populated by acking producers.
pub(crate) struct PushRequest {
    pub event: Event,
    pub seq: u32,
    pub state: Option<Arc<AckState>>,
}

/// Cancellation round-trip through the broker: the broker answers with the
/// number of in-flight events it removed.
pub(crate) struct CancelRequest {
    pub state: Arc<AckState>,
    pub response_tx: oneshot::Sender<CancelResponse>,
}

pub(crate) struct CancelResponse {
    pub removed: usize,
}

/// Callback and event ACK bookkeeping shared between an acking producer and
/// the broker-side client table. The broker uses it to compute the number of
/// per-producer ACKed events and to execute the locally configured callbacks.
pub(crate) struct AckState {
    ack_cb: AckHandler,
    drop_cb: Option<DropHandler>,
    cancelled: AtomicBool,
    // Highest contiguous sequence number acknowledged so far. Written only by
    // the broker task; monotonically non-decreasing.
    last_ack: AtomicU32,
}

impl AckState {
    fn new(ack_cb: AckHandler, drop_cb: Option<DropHandler>) -> Self {
        Self {
            ack_cb,
            drop_cb,
            cancelled: AtomicBool::new(false),
            last_ack: AtomicU32::new(0),
        }
    }

    pub(crate) fn mark_cancelled(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Advances `last_ack` to `seq` and returns the number of newly covered
    /// events. Returns 0 if `seq` was already acknowledged.
    pub(crate) fn advance(&self, seq: u32) -> usize {
        let last = self.last_ack.load(Ordering::Acquire);
        if seq <= last {
            return 0;
        }
        self.last_ack.store(seq, Ordering::Release);
        (seq - last) as usize
    }

    pub(crate) fn signal_ack(&self, count: usize) {
        (self.ack_cb)(count);
    }

    pub(crate) fn signal_drop(&self, event: Event) {
        if let Some(cb) = &self.drop_cb {
            cb(event);
        }
    }
}

/// Parameters for a new producer handle. A handle without an ACK callback is
/// fire-and-forget.
pub struct ProducerParams {
    pub ack_cb: Option<AckHandler>,
    pub drop_cb: Option<DropHandler>,
    pub drop_on_cancel: bool,
}

impl ProducerParams {
    pub fn fire_and_forget() -> Self {
        Self {
            ack_cb: None,
            drop_cb: None,
            drop_on_cancel: false,
        }
    }

    pub fn acked(ack_cb: impl Fn(usize) + Send + Sync + 'static, drop_on_cancel: bool) -> Self {
        Self {
            ack_cb: Some(Box::new(ack_cb)),
            drop_cb: None,
            drop_on_cancel,
        }
    }

    pub fn with_drop_cb(mut self, drop_cb: impl Fn(Event) + Send + Sync + 'static) -> Self {
        self.drop_cb = Some(Box::new(drop_cb));
        self
    }
}

/// Tracks the producer -> broker connection state.
struct OpenState {
    done: CancellationToken,
    events: mpsc::Sender<PushRequest>,
}

impl OpenState {
    fn close(&self) {
        self.done.cancel();
    }

    async fn publish(&self, req: PushRequest) -> bool {
        tokio::select! {
            biased;
            _ = self.done.cancelled() => false,
            res = self.events.send(req) => res.is_ok(),
        }
    }

    fn try_publish(&self, req: PushRequest) -> bool {
        if self.done.is_cancelled() {
            return false;
        }
        match self.events.try_send(req) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(req)) => {
                debug!(seq = req.seq, "dropping event, queue is blocked");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

/// Caller-facing handle used by an input reader to push events into the
/// queue.
pub enum Producer {
    /// Forwards events without ACK handling or callbacks.
    Forgetful(ForgetfulProducer),
    /// Tracks per-event acknowledgement and reports it back to the caller.
    Acked(AckedProducer),
}

impl Producer {
    pub(crate) fn new(
        events: mpsc::Sender<PushRequest>,
        cancel_tx: mpsc::Sender<CancelRequest>,
        params: ProducerParams,
    ) -> Self {
        let open_state = OpenState {
            done: CancellationToken::new(),
            events,
        };

        match params.ack_cb {
            None => Producer::Forgetful(ForgetfulProducer { open_state }),
            Some(ack_cb) => Producer::Acked(AckedProducer {
                seq: 1,
                cancelled: false,
                drop_on_cancel: params.drop_on_cancel,
                state: Arc::new(AckState::new(ack_cb, params.drop_cb)),
                open_state,
                cancel_tx,
            }),
        }
    }

    /// Blocking enqueue. Returns `true` once the broker accepted the event
    /// and `false` only if the handle was closed concurrently.
    pub async fn publish(&mut self, event: Event) -> bool {
        match self {
            Producer::Forgetful(p) => p.publish(event).await,
            Producer::Acked(p) => p.publish(event).await,
        }
    }

    /// Non-blocking enqueue. Sheds the event and returns `false` when the
    /// ingress channel has no free capacity or the handle is closed.
    pub fn try_publish(&mut self, event: Event) -> bool {
        match self {
            Producer::Forgetful(p) => p.try_publish(event),
            Producer::Acked(p) => p.try_publish(event),
        }
    }

    /// Closes the handle. With drop-on-cancel set, waits for the broker to
    /// remove this producer's unacknowledged events and returns their count;
    /// otherwise returns 0 immediately. Idempotent.
    pub async fn cancel(&mut self) -> usize {
        match self {
            Producer::Forgetful(p) => p.cancel(),
            Producer::Acked(p) => p.cancel().await,
        }
    }
}

/// Fire-and-forget producer variant.
pub struct ForgetfulProducer {
    open_state: OpenState,
}

impl ForgetfulProducer {
    async fn publish(&self, event: Event) -> bool {
        self.open_state.publish(Self::make_request(event)).await
    }

    fn try_publish(&self, event: Event) -> bool {
        self.open_state.try_publish(Self::make_request(event))
    }

    fn cancel(&self) -> usize {
        self.open_state.close();
        0
    }

    fn make_request(event: Event) -> PushRequest {
        PushRequest {
            event,
            seq: 0,
            state: None,
        }
    }
}

/// Acknowledging producer variant.
pub struct AckedProducer {
    drop_on_cancel: bool,
    cancelled: bool,
    seq: u32,
    state: Arc<AckState>,
    open_state: OpenState,
    cancel_tx: mpsc::Sender<CancelRequest>,
}

impl AckedProducer {
    async fn publish(&mut self, event: Event) -> bool {
        let req = self.make_request(event);
        let ok = self.open_state.publish(req).await;
        self.upd_seq(ok)
    }

    fn try_publish(&mut self, event: Event) -> bool {
        let req = self.make_request(event);
        let ok = self.open_state.try_publish(req);
        self.upd_seq(ok)
    }

    async fn cancel(&mut self) -> usize {
        self.open_state.close();

        if self.cancelled {
            return 0;
        }
        self.cancelled = true;

        if !self.drop_on_cancel {
            return 0;
        }

        let (response_tx, response_rx) = oneshot::channel();
        let req = CancelRequest {
            state: Arc::clone(&self.state),
            response_tx,
        };
        if self.cancel_tx.send(req).await.is_err() {
            return 0;
        }

        // wait for the cancel to be processed
        match response_rx.await {
            Ok(resp) => resp.removed,
            Err(_) => 0,
        }
    }

    fn upd_seq(&mut self, ok: bool) -> bool {
        if ok {
            self.seq = self.seq.wrapping_add(1);
        }
        ok
    }

    fn make_request(&self, event: Event) -> PushRequest {
        PushRequest {
            event,
            seq: self.seq,
            state: Some(Arc::clone(&self.state)),
        }
    }

    #[cfg(test)]
    pub(crate) fn seq(&self) -> u32 {
        self.seq
    }

    #[cfg(test)]
    pub(crate) fn ack_state(&self) -> Arc<AckState> {
        Arc::clone(&self.state)
    }
}
