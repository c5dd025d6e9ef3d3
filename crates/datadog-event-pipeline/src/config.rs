// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::errors::PipelineError;
use std::env;
use std::time::Duration;

const DEFAULT_QUEUE_CAPACITY: usize = 4096;
const DEFAULT_INGRESS_BUFFER: usize = 64;
const DEFAULT_BATCH_SIZE: usize = 256;

/// Configuration for the event-delivery pipeline.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Maximum number of events buffered by the queue broker.
    pub queue_capacity: usize,
    /// Capacity of the bounded ingress channel between producers and the
    /// broker.
    pub ingress_buffer: usize,
    /// Default number of events pulled from the queue per forwarding attempt.
    pub batch_size: usize,
    /// Default time-to-live for in-flight batches. Zero means no expiry.
    pub batch_ttl: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            ingress_buffer: DEFAULT_INGRESS_BUFFER,
            batch_size: DEFAULT_BATCH_SIZE,
            batch_ttl: Duration::ZERO,
        }
    }
}

impl PipelineConfig {
    /// Create configuration from environment variables
    pub fn from_env() -> Result<Self, PipelineError> {
        let queue_capacity = env::var("DD_PIPELINE_QUEUE_CAPACITY")
            .ok()
            .and_then(|val| val.parse::<usize>().ok())
            .unwrap_or(DEFAULT_QUEUE_CAPACITY);
        let ingress_buffer = env::var("DD_PIPELINE_INGRESS_BUFFER")
            .ok()
            .and_then(|val| val.parse::<usize>().ok())
            .unwrap_or(DEFAULT_INGRESS_BUFFER);
        let batch_size = env::var("DD_PIPELINE_BATCH_SIZE")
            .ok()
            .and_then(|val| val.parse::<usize>().ok())
            .unwrap_or(DEFAULT_BATCH_SIZE);
        let batch_ttl = env::var("DD_PIPELINE_BATCH_TTL_SECS")
            .ok()
            .and_then(|val| val.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::ZERO);

        let config = Self {
            queue_capacity,
            ingress_buffer,
            batch_size,
            batch_ttl,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.queue_capacity == 0 {
            return Err(PipelineError::InvalidConfig(
                "queue capacity must be greater than 0".to_string(),
            ));
        }

        if self.ingress_buffer == 0 {
            return Err(PipelineError::InvalidConfig(
                "ingress buffer must be greater than 0".to_string(),
            ));
        }

        if self.batch_size == 0 {
            return Err(PipelineError::InvalidConfig(
                "batch size must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}
