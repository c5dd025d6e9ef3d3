// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use datadog_event_pipeline::{Batch, Event};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

/// Shared counters observing a producer's ACK and drop callbacks.
#[derive(Clone, Default)]
pub struct DeliveryCounters {
    acked: Arc<AtomicUsize>,
    dropped: Arc<AtomicUsize>,
}

impl DeliveryCounters {
    pub fn acked(&self) -> usize {
        self.acked.load(Ordering::SeqCst)
    }

    pub fn dropped(&self) -> usize {
        self.dropped.load(Ordering::SeqCst)
    }

    pub fn ack_cb(&self) -> impl Fn(usize) + Send + Sync + 'static {
        let acked = Arc::clone(&self.acked);
        move |count| {
            acked.fetch_add(count, Ordering::SeqCst);
        }
    }

    pub fn drop_cb(&self) -> impl Fn(Event) + Send + Sync + 'static {
        let dropped = Arc::clone(&self.dropped);
        move |_event| {
            dropped.fetch_add(1, Ordering::SeqCst);
        }
    }
}

pub fn make_event(n: i64) -> Event {
    Event::new(n, json!({"message": format!("event-{n}"), "n": n}))
}

pub async fn recv_batch(work_rx: &mut mpsc::Receiver<Batch>) -> Batch {
    timeout(Duration::from_secs(1), work_rx.recv())
        .await
        .expect("no batch arrived in time")
        .expect("work channel closed")
}

pub async fn eventually(check: impl Fn() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}
