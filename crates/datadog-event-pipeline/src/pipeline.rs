// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::broker::{Queue, QueueBroker};
use crate::config::PipelineConfig;
use crate::consumer::EventConsumer;
use crate::errors::PipelineError;
use crate::output::{Batch, OutputGroup};
use crate::producer::{Producer, ProducerParams};

/// Wires the queue broker and the event consumer together and exposes the
/// pipeline's control surface to the rest of the agent.
pub struct Pipeline {
    config: PipelineConfig,
    queue: Queue,
    consumer: EventConsumer,
    broker_task: Option<JoinHandle<()>>,
}

impl Pipeline {
    /// Validates the configuration, spawns the broker task, and starts the
    /// consumer loop (paused, with no output bound).
    pub fn new(config: PipelineConfig) -> Result<Self, PipelineError> {
        config.validate()?;

        let (broker, queue) = QueueBroker::new(&config);
        let broker_task = tokio::spawn(broker.run());
        let consumer = EventConsumer::new(queue.clone());

        debug!(
            queue_capacity = config.queue_capacity,
            batch_size = config.batch_size,
            "event pipeline started"
        );

        Ok(Self {
            config,
            queue,
            consumer,
            broker_task: Some(broker_task),
        })
    }

    /// Opens a new producer handle for an input reader.
    pub fn producer(&self, params: ProducerParams) -> Producer {
        self.queue.producer(params)
    }

    /// The underlying queue connection, for collaborators that mint their
    /// own handles.
    pub fn queue(&self) -> &Queue {
        &self.queue
    }

    /// Rebinds the consumer to a new output group.
    pub async fn upd_output(&mut self, group: OutputGroup) {
        self.consumer.upd_output(group).await;
    }

    /// Binds a new output with the configured batch size and time-to-live,
    /// returning the work channel its workers drain.
    pub async fn connect_output(&mut self, work_capacity: usize) -> mpsc::Receiver<Batch> {
        let (work_tx, work_rx) = mpsc::channel(work_capacity);
        let group = OutputGroup::new(self.config.batch_size, self.config.batch_ttl, work_tx);
        self.consumer.upd_output(group).await;
        work_rx
    }

    pub fn sig_pause(&self) {
        self.consumer.sig_pause();
    }

    pub fn sig_continue(&self) {
        self.consumer.sig_continue();
    }

    pub fn sig_wait(&self) {
        self.consumer.sig_wait();
    }

    pub fn sig_unwait(&self) {
        self.consumer.sig_unwait();
    }

    /// Stops the consumer loop, then the broker. Idempotent.
    pub async fn close(&mut self) {
        self.consumer.close().await;
        self.queue.shutdown();
        if let Some(task) = self.broker_task.take() {
            if task.await.is_err() {
                error!("queue broker task failed");
            }
        }
        debug!("event pipeline stopped");
    }
}
