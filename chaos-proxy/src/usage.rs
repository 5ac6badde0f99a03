//! Per-key and per-target usage accounting.

use crate::metrics_defs::USAGE_RECORD_FAILED;
use crate::store::ConfigStore;
use crate::types::{RoutingConfig, Target};
use http::StatusCode;
use serde::Serialize;
use shared::counter;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Wall clock collaborator.
pub trait Clock: Send + Sync {
    fn now(&self) -> SystemTime;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// How a request that passed key resolution ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestOutcome {
    /// The upstream answered with this status.
    Forwarded(StatusCode),
    /// Chaos answered with this injected status.
    ShortCircuited(StatusCode),
    /// Refused before chaos ran, e.g. no matching target or a disallowed method.
    Rejected(StatusCode),
    /// The upstream could not be reached or timed out.
    Failed(StatusCode),
}

impl RequestOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            RequestOutcome::Forwarded(_) => "forwarded",
            RequestOutcome::ShortCircuited(_) => "short_circuited",
            RequestOutcome::Rejected(_) => "rejected",
            RequestOutcome::Failed(_) => "failed",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            RequestOutcome::Forwarded(s)
            | RequestOutcome::ShortCircuited(s)
            | RequestOutcome::Rejected(s)
            | RequestOutcome::Failed(s) => *s,
        }
    }
}

/// Monotonic request counter with a last-used timestamp.
///
/// Both fields are updated with single atomic read-modify-write operations, so concurrent
/// increments are never lost. The two fields are not updated together.
#[derive(Debug, Default)]
pub struct UsageStats {
    requests: AtomicU64,
    last_used_ms: AtomicU64,
}

impl UsageStats {
    pub fn record(&self, at: SystemTime) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.last_used_ms
            .fetch_max(epoch_millis(at), Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> UsageSnapshot {
        let last_used_ms = self.last_used_ms.load(Ordering::Relaxed);
        UsageSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            last_used_at_ms: (last_used_ms > 0).then_some(last_used_ms),
        }
    }
}

fn epoch_millis(at: SystemTime) -> u64 {
    at.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct UsageSnapshot {
    pub requests: u64,
    /// Milliseconds since the Unix epoch.
    pub last_used_at_ms: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct UsageReport {
    pub key_id: String,
    #[serde(flatten)]
    pub usage: UsageSnapshot,
    pub targets: BTreeMap<String, UsageSnapshot>,
}

/// Records usage through the store without ever failing or delaying the response.
#[derive(Clone)]
pub struct UsageRecorder {
    store: Arc<dyn ConfigStore>,
    clock: Arc<dyn Clock>,
}

impl UsageRecorder {
    pub fn new(store: Arc<dyn ConfigStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Fire-and-forget. The increment runs on its own task.
    pub fn record(&self, config: &RoutingConfig, target: Option<&Target>, outcome: RequestOutcome) {
        let recorder = self.clone();
        let key_id = config.id.clone();
        let target_id = target.map(|t| t.id.clone());

        tokio::spawn(async move {
            recorder
                .record_now(&key_id, target_id.as_deref(), outcome)
                .await;
        });
    }

    /// Records synchronously. Store faults are logged and swallowed.
    pub async fn record_now(&self, key_id: &str, target_id: Option<&str>, outcome: RequestOutcome) {
        let at = self.clock.now();

        match self.store.increment_usage(key_id, target_id, at).await {
            Ok(()) => tracing::trace!(
                key_id,
                target_id,
                outcome = outcome.label(),
                status = outcome.status().as_u16(),
                "usage recorded"
            ),
            Err(e) => {
                counter!(USAGE_RECORD_FAILED).increment(1);
                tracing::warn!(key_id, target_id, error = %e, "failed to record usage");
            }
        }
    }
}
