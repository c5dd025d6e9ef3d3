// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Ordered table mapping broker-internal client slots to producer ACK state.
//!
//! The table lets the broker attribute a committed multi-producer run of
//! events back to the individual producer callbacks. Slots are appended in
//! queue order and removed oldest-first when batches are committed, so each
//! producer's acknowledged sequence only ever moves forward.

use std::sync::{Arc, Mutex};

use crate::event::Event;
use crate::producer::AckState;

/// One client slot: the event sequence number and the producer state used to
/// compute and signal the ACK count. Fire-and-forget events occupy a slot
/// with no state so table order stays aligned with queue order.
pub(crate) struct ClientState {
    pub seq: u32,
    pub state: Option<Arc<AckState>>,
}

/// Accounting returned by a producer cancellation: in-flight slots stay in
/// place (only counted), buffered slots are removed and reported by buffer
/// position.
pub(crate) struct CancelAccounting {
    pub in_flight: usize,
    pub buffered: Vec<usize>,
}

#[derive(Default)]
pub(crate) struct ClientStates {
    clients: Mutex<Vec<ClientState>>,
}

#[allow(clippy::expect_used)]
impl ClientStates {
    /// Appends a client slot and returns the resulting table depth.
    pub fn add(&self, st: ClientState) -> usize {
        let mut clients = self.clients.lock().expect("lock poisoned");
        clients.push(st);
        clients.len()
    }

    /// Undoes the most recent `add`.
    pub fn remove_last(&self) -> Option<ClientState> {
        let mut clients = self.clients.lock().expect("lock poisoned");
        clients.pop()
    }

    /// Removes and returns the oldest `n` slots.
    pub fn pop(&self, n: usize) -> Vec<ClientState> {
        let mut clients = self.clients.lock().expect("lock poisoned");
        let n = n.min(clients.len());
        clients.drain(..n).collect()
    }

    pub fn len(&self) -> usize {
        self.clients.lock().expect("lock poisoned").len()
    }

    /// Removes the slots belonging to a cancelled producer. Slots below
    /// `in_flight` are with the output and must keep their position for
    /// commit alignment; they are counted but left in place.
    pub fn remove_cancelled(&self, target: &Arc<AckState>, in_flight: usize) -> CancelAccounting {
        let mut clients = self.clients.lock().expect("lock poisoned");

        let mut accounting = CancelAccounting {
            in_flight: 0,
            buffered: Vec::new(),
        };
        let mut kept = Vec::with_capacity(clients.len());
        for (idx, st) in clients.drain(..).enumerate() {
            let matches = st
                .state
                .as_ref()
                .map_or(false, |state| Arc::ptr_eq(state, target));
            if !matches {
                kept.push(st);
                continue;
            }
            if idx < in_flight {
                accounting.in_flight += 1;
                kept.push(st);
            } else {
                accounting.buffered.push(idx - in_flight);
            }
        }
        *clients = kept;
        accounting
    }
}

/// Walks a popped run of client slots in order and fires each producer's ACK
/// callback once with the count of its own newly committed events. Counts are
/// coalesced per producer in first-seen order; callbacks run outside the
/// table lock.
pub(crate) fn ack_popped(popped: Vec<ClientState>) {
    let mut pending: Vec<(Arc<AckState>, usize)> = Vec::new();

    for st in popped {
        let Some(state) = st.state else { continue };
        if state.is_cancelled() {
            continue;
        }
        let count = state.advance(st.seq);
        if count == 0 {
            continue;
        }
        match pending
            .iter_mut()
            .find(|(seen, _)| Arc::ptr_eq(seen, &state))
        {
            Some((_, total)) => *total += count,
            None => pending.push((state, count)),
        }
    }

    for (state, count) in pending {
        state.signal_ack(count);
    }
}

/// Walks a popped run whose batch was abandoned: the drop callback fires for
/// every acking event so nothing disappears unobserved. The acknowledged
/// sequence still advances so a later commit never re-counts the range.
pub(crate) fn drop_popped(popped: Vec<ClientState>, events: Vec<Event>) {
    for (st, event) in popped.into_iter().zip(events) {
        let Some(state) = st.state else { continue };
        state.advance(st.seq);
        if !state.is_cancelled() {
            state.signal_drop(event);
        }
    }
}
