//! Latency and failure injection.
//!
//! The injector only decides; it never sleeps. Callers await the returned delay on the
//! tokio timer so no thread is held for the duration of the simulated latency.

use crate::config::ValidationError;
use http::StatusCode;
use parking_lot::Mutex;
use rand::rngs::{StdRng, ThreadRng};
use rand::{Rng, SeedableRng};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

/// Status used for injected failures when no error codes are configured.
pub const DEFAULT_INJECTED_STATUS: StatusCode = StatusCode::INTERNAL_SERVER_ERROR;

/// Effective chaos parameters for a single request. Latencies are in milliseconds.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ChaosConfig {
    pub min_latency: u64,
    pub max_latency: u64,
    /// Share of requests to short-circuit, 0 to 100.
    pub failure_percentage: u8,
    /// Statuses to pick from when short-circuiting. Empty means 500.
    pub error_codes: Vec<u16>,
}

impl ChaosConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_latency(self.min_latency, self.max_latency)?;
        validate_failure_percentage(self.failure_percentage)?;
        validate_error_codes(&self.error_codes)
    }

    /// Merges a target override onto these defaults.
    ///
    /// Only fields present in the override replace the defaults, an explicit zero included.
    /// When a single latency bound is overridden and conflicts with the inherited one,
    /// the inherited bound moves to meet it.
    pub fn with_override(&self, chaos: &ChaosOverride) -> ChaosConfig {
        let (min_latency, max_latency) = match (chaos.min_latency, chaos.max_latency) {
            (Some(min), Some(max)) => (min, max.max(min)),
            (Some(min), None) => (min, self.max_latency.max(min)),
            (None, Some(max)) => (self.min_latency.min(max), max),
            (None, None) => (self.min_latency, self.max_latency),
        };

        ChaosConfig {
            min_latency,
            max_latency,
            failure_percentage: chaos
                .failure_percentage
                .unwrap_or(self.failure_percentage)
                .min(100),
            error_codes: chaos
                .error_codes
                .clone()
                .unwrap_or_else(|| self.error_codes.clone()),
        }
    }
}

/// Per-target chaos settings. `None` means "inherit from the routing config".
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
pub struct ChaosOverride {
    #[serde(default)]
    pub min_latency: Option<u64>,
    #[serde(default)]
    pub max_latency: Option<u64>,
    #[serde(default)]
    pub failure_percentage: Option<u8>,
    #[serde(default)]
    pub error_codes: Option<Vec<u16>>,
}

impl ChaosOverride {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if let (Some(min), Some(max)) = (self.min_latency, self.max_latency) {
            validate_latency(min, max)?;
        }
        if let Some(percentage) = self.failure_percentage {
            validate_failure_percentage(percentage)?;
        }
        if let Some(codes) = &self.error_codes {
            validate_error_codes(codes)?;
        }
        Ok(())
    }
}

fn validate_latency(min: u64, max: u64) -> Result<(), ValidationError> {
    if min > max {
        return Err(ValidationError::InvalidLatencyRange { min, max });
    }
    Ok(())
}

fn validate_failure_percentage(percentage: u8) -> Result<(), ValidationError> {
    if percentage > 100 {
        return Err(ValidationError::InvalidFailurePercentage(percentage));
    }
    Ok(())
}

fn validate_error_codes(codes: &[u16]) -> Result<(), ValidationError> {
    match codes.iter().find(|code| !(100..=599).contains(*code)) {
        Some(code) => Err(ValidationError::InvalidErrorCode(*code)),
        None => Ok(()),
    }
}

/// The decision taken for one request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Wait `delay`, then forward to the upstream.
    Proceed { delay: Duration },
    /// Wait `delay`, then answer with `status` without contacting the upstream.
    ShortCircuit { delay: Duration, status: StatusCode },
}

impl Outcome {
    pub fn delay(&self) -> Duration {
        match self {
            Outcome::Proceed { delay } | Outcome::ShortCircuit { delay, .. } => *delay,
        }
    }
}

/// Source of randomness for chaos decisions.
pub trait RandomSource {
    /// Uniform float in `[0, 1)`.
    fn next_f64(&mut self) -> f64;

    /// Uniform integer in `[low, high]`. Requires `low <= high`.
    fn next_in_range(&mut self, low: u64, high: u64) -> u64;
}

impl RandomSource for StdRng {
    fn next_f64(&mut self) -> f64 {
        self.random::<f64>()
    }

    fn next_in_range(&mut self, low: u64, high: u64) -> u64 {
        self.random_range(low..=high)
    }
}

impl RandomSource for ThreadRng {
    fn next_f64(&mut self) -> f64 {
        self.random::<f64>()
    }

    fn next_in_range(&mut self, low: u64, high: u64) -> u64 {
        self.random_range(low..=high)
    }
}

/// Computes the delay and the pass/fail decision for one request.
///
/// The delay is drawn first and applies to both outcomes.
pub fn inject(cfg: &ChaosConfig, rng: &mut dyn RandomSource) -> Outcome {
    let delay = draw_latency(cfg, rng);

    let threshold = f64::from(cfg.failure_percentage.min(100)) / 100.0;
    if rng.next_f64() >= threshold {
        return Outcome::Proceed { delay };
    }

    let status = match cfg.error_codes.len() {
        0 => DEFAULT_INJECTED_STATUS,
        1 => status_or_default(cfg.error_codes[0]),
        n => {
            let index = rng.next_in_range(0, n as u64 - 1) as usize;
            status_or_default(cfg.error_codes[index])
        }
    };

    Outcome::ShortCircuit { delay, status }
}

fn draw_latency(cfg: &ChaosConfig, rng: &mut dyn RandomSource) -> Duration {
    let (low, high) = if cfg.min_latency <= cfg.max_latency {
        (cfg.min_latency, cfg.max_latency)
    } else {
        (cfg.max_latency, cfg.min_latency)
    };

    if low == high {
        return Duration::from_millis(low);
    }
    Duration::from_millis(rng.next_in_range(low, high))
}

fn status_or_default(code: u16) -> StatusCode {
    StatusCode::from_u16(code).unwrap_or(DEFAULT_INJECTED_STATUS)
}

/// Chaos injector shared by all request tasks.
///
/// Without a seed every call draws from the calling thread's generator, so concurrent
/// requests never contend. With a seed all calls draw from one generator, which makes
/// a run reproducible at the cost of a short critical section per request.
#[derive(Clone)]
pub enum ChaosInjector {
    Thread,
    Seeded(Arc<Mutex<StdRng>>),
}

impl ChaosInjector {
    pub fn new(seed: Option<u64>) -> Self {
        match seed {
            Some(seed) => ChaosInjector::Seeded(Arc::new(Mutex::new(StdRng::seed_from_u64(seed)))),
            None => ChaosInjector::Thread,
        }
    }

    pub fn inject(&self, cfg: &ChaosConfig) -> Outcome {
        match self {
            ChaosInjector::Thread => inject(cfg, &mut rand::rng()),
            ChaosInjector::Seeded(rng) => inject(cfg, &mut *rng.lock()),
        }
    }
}
