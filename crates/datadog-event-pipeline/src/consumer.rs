// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The event consumer collects events from the queue broker and forwards
//! batches to the active output work channel.
//!
//! The consumer is managed by the pipeline controller and additionally
//! receives pause signals from the retry collaborator when too many events
//! fail to send or when cancelled batches come back during output reloading.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::broker::{ConsumerHandle, Queue};
use crate::errors::QueueError;
use crate::output::{Batch, OutputGroup};

/// The only mutation channel into the consumer loop's private state.
enum ConsumerSignal {
    /// Wake-up hint forcing a re-evaluation of the pause and destination
    /// state. Coalesced; the atomic flags are the source of truth.
    Check,
    /// Replace the forwarding target for subsequent pulls.
    UpdateOutput(OutputGroup),
    /// Rebind the queue connection after a reconnect.
    UpdateInput(ConsumerHandle),
    /// Exit the loop, discarding any held batch.
    Stop,
}

/// Control surface of the single long-lived consumer task.
pub struct EventConsumer {
    sig_tx: mpsc::Sender<ConsumerSignal>,
    pause: Arc<AtomicBool>,
    wait: Arc<AtomicBool>,
    queue: Queue,
    current: ConsumerHandle,
    task: Option<JoinHandle<()>>,
}

impl EventConsumer {
    /// Spawns the consumer loop. The consumer starts paused with no output
    /// bound; delivery begins after `upd_output` and `sig_continue`.
    pub fn new(queue: Queue) -> Self {
        let (sig_tx, sig_rx) = mpsc::channel(3);
        let pause = Arc::new(AtomicBool::new(true));
        let wait = Arc::new(AtomicBool::new(false));

        let consumer = queue.consumer();
        let worker = ConsumerLoop {
            pause: Arc::clone(&pause),
            wait: Arc::clone(&wait),
        };
        let task = tokio::spawn(worker.run(sig_rx, consumer.clone()));

        Self {
            sig_tx,
            pause,
            wait,
            queue,
            current: consumer,
            task: Some(task),
        }
    }

    /// Pauses new batch pulls until `sig_continue`. A batch already pulled
    /// is still forwarded.
    pub fn sig_pause(&self) {
        self.pause.store(true, Ordering::Release);
        self.sig_hint();
    }

    pub fn sig_continue(&self) {
        self.pause.store(false, Ordering::Release);
        self.sig_hint();
    }

    /// Holds new batch pulls while the retry collaborator backs off.
    /// Combined with the pause flag under OR semantics.
    pub fn sig_wait(&self) {
        self.wait.store(true, Ordering::Release);
        self.sig_hint();
    }

    pub fn sig_unwait(&self) {
        self.wait.store(false, Ordering::Release);
        self.sig_hint();
    }

    fn sig_hint(&self) {
        // wake a blocked loop; with the flags set atomically, pending hints
        // coalesce and a full signal channel can be skipped
        let _ = self.sig_tx.try_send(ConsumerSignal::Check);
    }

    /// Rebinds the consumer to a new output group.
    ///
    /// The current queue connection is closed first to break the loop out of
    /// a blocking pull, then the output is swapped, then a fresh connection
    /// is delivered. The loop never forwards against a stale destination and
    /// never retains an invalidated queue connection.
    pub async fn upd_output(&mut self, group: OutputGroup) {
        self.current.close();

        let _ = self.sig_tx.send(ConsumerSignal::UpdateOutput(group)).await;

        self.current = self.queue.consumer();
        let _ = self
            .sig_tx
            .send(ConsumerSignal::UpdateInput(self.current.clone()))
            .await;
    }

    /// Stops the consumer loop and waits for it to exit.
    pub async fn close(&mut self) {
        self.current.close();
        let _ = self.sig_tx.send(ConsumerSignal::Stop).await;
        if let Some(task) = self.task.take() {
            if task.await.is_err() {
                error!("event consumer task failed");
            }
        }
    }
}

struct ConsumerLoop {
    pause: Arc<AtomicBool>,
    wait: Arc<AtomicBool>,
}

impl ConsumerLoop {
    fn paused(&self) -> bool {
        self.pause.load(Ordering::Acquire) || self.wait.load(Ordering::Acquire)
    }

    async fn run(self, mut sig_rx: mpsc::Receiver<ConsumerSignal>, consumer: ConsumerHandle) {
        debug!("start pipeline event consumer");

        let mut consumer = Some(consumer);
        let mut out: Option<OutputGroup> = None;
        let mut batch: Option<Batch> = None;
        let mut forward = false;
        let mut paused = true;

        loop {
            if !paused && batch.is_none() {
                if let (Some(group), Some(handle)) = (out.clone(), consumer.clone()) {
                    match handle.get(group.batch_size).await {
                        Err(_) => {
                            // stale queue connection; hold off until a fresh
                            // handle arrives via update-input
                            forward = false;
                            consumer = None;
                            continue;
                        }
                        Ok(queue_batch) if !queue_batch.is_empty() => {
                            batch = Some(Batch::new(queue_batch, group.time_to_live));
                            paused = self.paused();
                            forward = !paused;
                        }
                        Ok(_) => {
                            forward = false;
                        }
                    }
                }
            }

            // signal draining takes priority over forwarding so control
            // requests are observed promptly under sustained load
            match sig_rx.try_recv() {
                Ok(sig) => {
                    match self.handle_signal(
                        sig,
                        &mut consumer,
                        &mut out,
                        &mut paused,
                        &mut forward,
                        batch.is_some(),
                    ) {
                        Ok(()) => continue,
                        Err(_) => break,
                    }
                }
                Err(mpsc::error::TryRecvError::Empty) => {}
                Err(mpsc::error::TryRecvError::Disconnected) => break,
            }

            let dest = if forward && batch.is_some() {
                out.as_ref().map(|group| group.work_tx.clone())
            } else {
                None
            };

            tokio::select! {
                sig = sig_rx.recv() => {
                    let Some(sig) = sig else { break };
                    if self
                        .handle_signal(
                            sig,
                            &mut consumer,
                            &mut out,
                            &mut paused,
                            &mut forward,
                            batch.is_some(),
                        )
                        .is_err()
                    {
                        break;
                    }
                }

                permit = async {
                    match &dest {
                        Some(work_tx) => work_tx.reserve().await,
                        None => std::future::pending().await,
                    }
                } => {
                    match permit {
                        Ok(permit) => {
                            if let Some(held) = batch.take() {
                                permit.send(held);
                            }
                            if paused {
                                forward = false;
                            }
                        }
                        Err(_) => {
                            // output work channel went away; wait for the
                            // next reconfiguration
                            forward = false;
                        }
                    }
                }
            }
        }

        debug!("stop pipeline event consumer");
    }

    fn handle_signal(
        &self,
        sig: ConsumerSignal,
        consumer: &mut Option<ConsumerHandle>,
        out: &mut Option<OutputGroup>,
        paused: &mut bool,
        forward: &mut bool,
        have_batch: bool,
    ) -> Result<(), QueueError> {
        match sig {
            ConsumerSignal::Stop => return Err(QueueError::Stopped),
            ConsumerSignal::Check => {}
            ConsumerSignal::UpdateOutput(group) => *out = Some(group),
            ConsumerSignal::UpdateInput(handle) => *consumer = Some(handle),
        }

        *paused = self.paused();
        *forward = out.is_some() && have_batch;
        Ok(())
    }
}
