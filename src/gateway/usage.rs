//! Usage tracking via the UsageSink trait.
//!
//! The gateway logs all calls through a UsageSink. Shard workers use
//! [`TallyUsageSink`] so the cost of a shard can be reported when it
//! finishes.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// Status of a provider call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallStatus {
    Success,
    Error,
}

impl CallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallStatus::Success => "success",
            CallStatus::Error => "error",
        }
    }
}

/// Record of a provider API call for logging.
#[derive(Debug, Clone)]
pub struct ProviderCallRecord {
    /// Provider name, e.g. "openrouter".
    pub provider: &'static str,
    /// Model used.
    pub model: String,
    /// Input tokens consumed.
    pub input_tokens: u32,
    /// Output tokens generated.
    pub output_tokens: u32,
    /// Cost in nanodollars (1e-9 USD).
    pub cost_nanodollars: i64,
    /// Labeling run (if known).
    pub run_id: Option<Uuid>,
    /// Shard whose worker made the call.
    pub shard_id: Option<u32>,
    /// Latency in milliseconds.
    pub latency_ms: u64,
    /// Call status.
    pub status: CallStatus,
    /// Error code if status is Error.
    pub error_code: Option<String>,
    /// Which code path made this call.
    pub caller: &'static str,
    /// When the call was made.
    pub timestamp: DateTime<Utc>,
}

impl ProviderCallRecord {
    /// Create a new record with required fields, defaulting others.
    pub fn new(provider: &'static str, model: impl Into<String>, caller: &'static str) -> Self {
        Self {
            provider,
            model: model.into(),
            input_tokens: 0,
            output_tokens: 0,
            cost_nanodollars: 0,
            run_id: None,
            shard_id: None,
            latency_ms: 0,
            status: CallStatus::Success,
            error_code: None,
            caller,
            timestamp: Utc::now(),
        }
    }

    pub fn tokens(mut self, input: u32, output: u32) -> Self {
        self.input_tokens = input;
        self.output_tokens = output;
        self
    }

    pub fn cost(mut self, nanodollars: i64) -> Self {
        self.cost_nanodollars = nanodollars;
        self
    }

    pub fn run(mut self, run_id: Option<Uuid>) -> Self {
        self.run_id = run_id;
        self
    }

    pub fn shard(mut self, shard_id: Option<u32>) -> Self {
        self.shard_id = shard_id;
        self
    }

    pub fn latency(mut self, ms: u64) -> Self {
        self.latency_ms = ms;
        self
    }

    pub fn error(mut self, code: impl Into<String>) -> Self {
        self.status = CallStatus::Error;
        self.error_code = Some(code.into());
        self
    }
}

/// Trait for recording provider call usage.
#[async_trait]
pub trait UsageSink: Send + Sync {
    /// Record a provider call. This should be fire-and-forget:
    /// failures should be logged but not propagated.
    async fn record(&self, record: ProviderCallRecord);
}

/// Aggregated usage for one model.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ModelUsage {
    pub calls: u64,
    pub failed_calls: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_nanodollars: i64,
}

/// Usage sink that keeps per-model running totals in memory.
#[derive(Debug, Default)]
pub struct TallyUsageSink {
    totals: Mutex<BTreeMap<String, ModelUsage>>,
}

impl TallyUsageSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the totals so far, keyed by model id.
    pub fn snapshot(&self) -> BTreeMap<String, ModelUsage> {
        match self.totals.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Total spend across all models, in nanodollars.
    pub fn total_cost_nanodollars(&self) -> i64 {
        self.snapshot().values().map(|u| u.cost_nanodollars).sum()
    }
}

#[async_trait]
impl UsageSink for TallyUsageSink {
    async fn record(&self, record: ProviderCallRecord) {
        tracing::debug!(
            model = %record.model,
            caller = record.caller,
            shard_id = ?record.shard_id,
            status = record.status.as_str(),
            input_tokens = record.input_tokens,
            output_tokens = record.output_tokens,
            latency_ms = record.latency_ms,
            "provider call"
        );
        let mut guard = match self.totals.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let entry = guard.entry(record.model).or_default();
        entry.calls += 1;
        if record.status == CallStatus::Error {
            entry.failed_calls += 1;
        }
        entry.input_tokens += u64::from(record.input_tokens);
        entry.output_tokens += u64::from(record.output_tokens);
        entry.cost_nanodollars += record.cost_nanodollars;
    }
}
