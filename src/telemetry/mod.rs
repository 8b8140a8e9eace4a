//! 遥测模块：向外部指标系统上报调用结果与观测到的 token 数（网关本身不做聚合）。
//!
//! Telemetry sinks.
//!
//! The gateway reports one [`CallRecord`] per upstream call to a
//! [`MetricsSink`]. Aggregation and export belong to whatever implements the
//! sink.
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`MetricsSink`] | Trait for metrics destinations |
//! | [`NoopMetricsSink`] | Default sink, drops everything |
//! | [`TracingMetricsSink`] | Emits each record as a `tracing` event |
//! | [`InMemoryMetricsSink`] | Bounded in-memory sink for tests |

use crate::types::{EndpointKind, Provider, Usage};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Final outcome of a gateway call as seen by metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    Success,
    /// Streaming call ended after some chunks were delivered.
    Aborted,
    /// Rejected before any upstream call (validation, authorization, capability).
    Rejected,
    CircuitOpen,
    Timeout,
    Failed,
}

impl CallOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallOutcome::Success => "success",
            CallOutcome::Aborted => "aborted",
            CallOutcome::Rejected => "rejected",
            CallOutcome::CircuitOpen => "circuit_open",
            CallOutcome::Timeout => "timeout",
            CallOutcome::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CallRecord {
    pub request_id: String,
    pub model: String,
    pub provider: Option<Provider>,
    pub endpoint: EndpointKind,
    pub stream: bool,
    pub outcome: CallOutcome,
    pub http_status: u16,
    pub duration: Duration,
    pub chunks: u64,
    pub usage: Option<Usage>,
}

/// Destination for call records. Implementations must not block.
pub trait MetricsSink: Send + Sync {
    fn record(&self, record: CallRecord);
}

/// Default sink (no collection).
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetricsSink;

impl MetricsSink for NoopMetricsSink {
    fn record(&self, _record: CallRecord) {}
}

pub fn noop_sink() -> Arc<dyn MetricsSink> {
    Arc::new(NoopMetricsSink)
}

/// Logs each record at info level under the `ai_gateway::metrics` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMetricsSink;

impl MetricsSink for TracingMetricsSink {
    fn record(&self, r: CallRecord) {
        let usage = r.usage.unwrap_or_default();
        tracing::info!(
            target: "ai_gateway::metrics",
            request_id = %r.request_id,
            model = %r.model,
            provider = r.provider.map(|p| p.as_str()).unwrap_or("-"),
            endpoint = %r.endpoint,
            stream = r.stream,
            outcome = r.outcome.as_str(),
            http_status = r.http_status,
            duration_ms = r.duration.as_millis() as u64,
            chunks = r.chunks,
            prompt_tokens = usage.prompt_tokens,
            completion_tokens = usage.completion_tokens,
            "call completed"
        );
    }
}

/// In-memory sink for testing.
#[derive(Debug)]
pub struct InMemoryMetricsSink {
    records: Mutex<VecDeque<CallRecord>>,
    max_records: usize,
}

impl InMemoryMetricsSink {
    pub fn new(max: usize) -> Self {
        Self {
            records: Mutex::new(VecDeque::new()),
            max_records: max.max(1),
        }
    }

    pub fn records(&self) -> Vec<CallRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl MetricsSink for InMemoryMetricsSink {
    fn record(&self, record: CallRecord) {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        records.push_back(record);
        if records.len() > self.max_records {
            records.pop_front();
        }
    }
}
