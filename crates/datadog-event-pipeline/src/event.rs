// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};

/// A single captured unit of data moving through the pipeline.
///
/// Events carry an opaque payload and have no identity beyond their position
/// in the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Capture time, nanoseconds since the Unix epoch.
    pub timestamp: i64,
    /// Opaque payload produced by an input reader.
    pub payload: serde_json::Value,
}

impl Event {
    pub fn new(timestamp: i64, payload: serde_json::Value) -> Self {
        Self { timestamp, payload }
    }
}
