// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use crate::broker::QueueBatch;
use crate::event::Event;

/// Live binding to an output worker pool: the batch size to pull, the
/// time-to-live stamped on in-flight batches, and the channel ready batches
/// are submitted to.
///
/// A group is replaced as a unit on reconfiguration, never mutated while the
/// consumer can observe it.
#[derive(Clone)]
pub struct OutputGroup {
    pub batch_size: usize,
    pub time_to_live: Duration,
    pub work_tx: mpsc::Sender<Batch>,
}

impl OutputGroup {
    pub fn new(batch_size: usize, time_to_live: Duration, work_tx: mpsc::Sender<Batch>) -> Self {
        Self {
            batch_size,
            time_to_live,
            work_tx,
        }
    }
}

/// A queue batch bound for the current output, with an advisory deadline
/// derived from the output group's time-to-live.
pub struct Batch {
    inner: QueueBatch,
    deadline: Option<Instant>,
}

impl Batch {
    pub(crate) fn new(inner: QueueBatch, time_to_live: Duration) -> Self {
        let deadline = (!time_to_live.is_zero()).then(|| Instant::now() + time_to_live);
        Self { inner, deadline }
    }

    pub fn events(&self) -> &[Event] {
        self.inner.events()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Advisory expiry for the output/retry collaborator. `None` when the
    /// output group carries no time-to-live.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Reports the batch as delivered; ACK callbacks walk back to the
    /// producers.
    pub fn ack(self) {
        self.inner.ack();
    }

    /// Abandons the batch, observed by the producers' drop callbacks.
    pub fn discard(self) {
        self.inner.discard();
    }

    /// Releases the events without settling them, for requeue by the retry
    /// collaborator.
    pub fn into_events(self) -> Vec<Event> {
        self.inner.into_events()
    }
}
