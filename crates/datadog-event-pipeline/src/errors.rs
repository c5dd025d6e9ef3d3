// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

/// Errors surfaced by the queue broker plumbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    /// The consumer handle was invalidated or the broker is gone.
    #[error("queue connection closed")]
    Closed,

    /// Internal sentinel used to unwind the consumer loop. Never returned to
    /// callers.
    #[error("stopped")]
    Stopped,
}

/// Errors that can occur when assembling a pipeline.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}
