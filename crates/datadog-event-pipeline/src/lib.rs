// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Internal event-delivery pipeline for the shipping agents.
//!
//! Input readers push captured events through producer handles into a
//! bounded queue broker; a single consumer task pulls batches and forwards
//! them to the active output work channel. Delivery is fire-and-forget or
//! at-least-once with per-producer acknowledgement callbacks, the output
//! binding can be swapped live, and the retry collaborator throttles the
//! consumer through pause/wait signals.

pub mod broker;
pub mod config;
pub mod consumer;
pub mod errors;
pub mod event;
pub mod output;
pub mod pipeline;
pub mod producer;
mod states;

pub use broker::{ConsumerHandle, Queue, QueueBatch, QueueBroker, QueueStats};
pub use config::PipelineConfig;
pub use consumer::EventConsumer;
pub use errors::{PipelineError, QueueError};
pub use event::Event;
pub use output::{Batch, OutputGroup};
pub use pipeline::Pipeline;
pub use producer::{AckHandler, DropHandler, Producer, ProducerParams};
