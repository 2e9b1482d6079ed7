use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info};

use crate::clock::Clock;

use super::{HealthProbe, ProbeResult, SignalKind, Verdict};

/// How many samples a signal gets before a Down verdict is trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SamplingPolicy {
    pub max_samples: u32,
    pub interval: Duration,
}

impl SamplingPolicy {
    pub fn new(max_samples: u32, interval: Duration) -> Self {
        Self {
            max_samples: max_samples.max(1),
            interval,
        }
    }

    /// A single sample: the first Down is final.
    pub fn hairtrigger() -> Self {
        Self::new(1, Duration::ZERO)
    }

    /// Worst-case time spent sleeping between samples.
    pub fn latency_budget(&self) -> Duration {
        self.interval * self.max_samples.saturating_sub(1)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HysteresisState {
    pub signal: SignalKind,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub samples: u32,
    pub settled: Verdict,
    pub last_reason: Option<String>,
}

impl HysteresisState {
    pub fn new(signal: SignalKind) -> Self {
        Self {
            signal,
            consecutive_failures: 0,
            consecutive_successes: 0,
            samples: 0,
            settled: Verdict::Up,
            last_reason: None,
        }
    }

    fn record(&mut self, result: &ProbeResult) {
        self.samples += 1;
        match result.verdict {
            Verdict::Up => {
                self.consecutive_successes += 1;
                self.consecutive_failures = 0;
            }
            Verdict::Down => {
                self.consecutive_failures += 1;
                self.consecutive_successes = 0;
                self.last_reason = result.reason.clone();
            }
        }
        self.settled = result.verdict;
    }

    pub fn is_up(&self) -> bool {
        self.settled == Verdict::Up
    }
}

/// Samples a probe repeatedly and settles on Down only when every sample in
/// the policy came back Down. The first Up ends sampling.
#[derive(Clone)]
pub struct HysteresisEvaluator {
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for HysteresisEvaluator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HysteresisEvaluator").finish_non_exhaustive()
    }
}

impl HysteresisEvaluator {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    pub async fn evaluate(
        &self,
        probe: &dyn HealthProbe,
        policy: SamplingPolicy,
    ) -> HysteresisState {
        let signal = probe.kind();
        let mut state = HysteresisState::new(signal);
        let max_samples = policy.max_samples.max(1);
        debug!(?signal, max_samples, budget = ?policy.latency_budget(), "sampling signal");
        for sample in 1..=max_samples {
            let result = probe.probe().await;
            state.record(&result);
            if result.is_up() {
                if sample > 1 {
                    debug!(?signal, sample, "signal recovered during sampling");
                }
                break;
            }
            debug!(
                ?signal,
                sample,
                max_samples,
                reason = result.reason.as_deref().unwrap_or(""),
                "probe sample down"
            );
            if sample < max_samples && !policy.interval.is_zero() {
                self.clock.sleep(policy.interval).await;
            }
        }
        if !state.is_up() {
            info!(
                ?signal,
                samples = state.samples,
                reason = state.last_reason.as_deref().unwrap_or(""),
                "signal settled down"
            );
        }
        state
    }
}
