//! ConvergencePoller - waits for several independently replicated views to agree.
//!
//! Runtime shape:
//! 1) Probe every source concurrently (each under a bounded retry)
//! 2) Evaluate the joint predicate over this tick's values
//! 3) Stop on Converged / TimedOut / Exhausted, otherwise sleep per schedule
//! 4) Emit a progress observation on the optional side channel
//!
//! A source that fails its probe, or is still running when the duration
//! budget runs out, counts as unknown for that tick only.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::error::RelayError;
use crate::retry::{RetryError, RetryPolicy};

pub const DEFAULT_MAX_POLL_ATTEMPTS: u32 = 20;
pub const DEFAULT_MAX_POLL_DURATION: Duration = Duration::from_secs(60);
pub const DEFAULT_PROBE_ATTEMPTS: u32 = 2;

pub type ProbeFuture<T> = BoxFuture<'static, Result<T, RelayError>>;

/// One independently updated view.
pub struct Probe<T> {
    name: String,
    run: Arc<dyn Fn() -> ProbeFuture<T> + Send + Sync>,
}

impl<T> Probe<T> {
    pub fn new<F, Fut>(name: impl Into<String>, probe: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, RelayError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            run: Arc::new(move || Box::pin(probe())),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl<T> std::fmt::Debug for Probe<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Probe").field("name", &self.name).finish()
    }
}

/// Stepped wait between ticks: `(last_attempt, interval)` pairs, then `tail`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollSchedule {
    steps: Vec<(u32, Duration)>,
    tail: Duration,
}

impl Default for PollSchedule {
    /// 1s for attempts 1-3, 2s for 4-6, 3s for 7-10, 5s after that.
    fn default() -> Self {
        Self {
            steps: vec![
                (3, Duration::from_secs(1)),
                (6, Duration::from_secs(2)),
                (10, Duration::from_secs(3)),
            ],
            tail: Duration::from_secs(5),
        }
    }
}

impl PollSchedule {
    pub fn new(steps: Vec<(u32, Duration)>, tail: Duration) -> Self {
        Self { steps, tail }
    }

    pub fn fixed(interval: Duration) -> Self {
        Self::new(Vec::new(), interval)
    }

    /// Wait after the `attempt`-th tick (1-based).
    pub fn interval_for(&self, attempt: u32) -> Duration {
        self.steps
            .iter()
            .find(|(last, _)| attempt <= *last)
            .map(|(_, interval)| *interval)
            .unwrap_or(self.tail)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PollPhase {
    Waiting,
    Converged,
    TimedOut,
    Exhausted,
}

impl PollPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Converged => "converged",
            Self::TimedOut => "timed_out",
            Self::Exhausted => "exhausted",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PollProgress {
    pub label: String,
    pub attempt: u32,
    pub max_attempts: u32,
    pub percent: u8,
    pub phase: PollPhase,
    pub message: String,
    pub known_sources: usize,
    pub total_sources: usize,
    pub elapsed_ms: u64,
}

/// Successful terminal state.
#[derive(Debug, Clone, PartialEq)]
pub struct Convergence<T> {
    pub attempts: u32,
    pub elapsed: Duration,
    pub values: Vec<Option<T>>,
}

type Predicate<T> = Box<dyn Fn(&[Option<T>]) -> bool + Send + Sync>;

pub struct ConvergencePoller<T> {
    label: String,
    sources: Vec<Probe<T>>,
    predicate: Predicate<T>,
    max_attempts: u32,
    max_total_duration: Duration,
    schedule: PollSchedule,
    probe_retry: RetryPolicy,
    progress_tx: Option<mpsc::UnboundedSender<PollProgress>>,
}

impl<T: Serialize + Send + 'static> ConvergencePoller<T> {
    /// `predicate` sees one entry per source, `None` where the probe failed.
    pub fn new<P>(label: impl Into<String>, predicate: P) -> Self
    where
        P: Fn(&[Option<T>]) -> bool + Send + Sync + 'static,
    {
        Self {
            label: label.into(),
            sources: Vec::new(),
            predicate: Box::new(predicate),
            max_attempts: DEFAULT_MAX_POLL_ATTEMPTS,
            max_total_duration: DEFAULT_MAX_POLL_DURATION,
            schedule: PollSchedule::default(),
            probe_retry: RetryPolicy::new(DEFAULT_PROBE_ATTEMPTS),
            progress_tx: None,
        }
    }

    pub fn source(mut self, probe: Probe<T>) -> Self {
        self.sources.push(probe);
        self
    }

    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn max_total_duration(mut self, duration: Duration) -> Self {
        self.max_total_duration = duration;
        self
    }

    pub fn schedule(mut self, schedule: PollSchedule) -> Self {
        self.schedule = schedule;
        self
    }

    pub fn probe_retry(mut self, policy: RetryPolicy) -> Self {
        self.probe_retry = policy;
        self
    }

    /// Probe retries back off on the configured curve, keeping the attempt count.
    pub fn retry_from_config(mut self, config: &ClientConfig) -> Self {
        self.probe_retry = config.retry_policy(self.probe_retry.max_attempts());
        self
    }

    pub fn progress(mut self, progress_tx: mpsc::UnboundedSender<PollProgress>) -> Self {
        self.progress_tx = Some(progress_tx);
        self
    }

    pub async fn run(&self, cancel: &CancellationToken) -> Result<Convergence<T>, RelayError> {
        let started = Instant::now();
        let deadline = started + self.max_total_duration;
        let mut attempt = 0;

        loop {
            attempt += 1;
            let values = self.probe_all(cancel, deadline).await;
            if cancel.is_cancelled() {
                return Err(RelayError::Cancelled { context: None });
            }

            let known = values.iter().filter(|v| v.is_some()).count();
            let elapsed = started.elapsed();

            if (self.predicate)(&values) {
                self.emit(PollPhase::Converged, attempt, known, elapsed);
                info!(
                    label = %self.label,
                    attempts = attempt,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "sources converged"
                );
                return Ok(Convergence {
                    attempts: attempt,
                    elapsed,
                    values,
                });
            }

            if elapsed >= self.max_total_duration {
                self.emit(PollPhase::TimedOut, attempt, known, elapsed);
                warn!(label = %self.label, attempts = attempt, "convergence timed out");
                return Err(RelayError::ConvergenceTimedOut {
                    attempts: attempt,
                    elapsed,
                    last_values: snapshot(&values),
                });
            }

            if attempt >= self.max_attempts {
                self.emit(PollPhase::Exhausted, attempt, known, elapsed);
                warn!(label = %self.label, attempts = attempt, "convergence attempts exhausted");
                return Err(RelayError::ConvergenceExhausted {
                    attempts: attempt,
                    elapsed,
                    last_values: snapshot(&values),
                });
            }

            self.emit(PollPhase::Waiting, attempt, known, elapsed);
            let delay = self
                .schedule
                .interval_for(attempt)
                .min(self.max_total_duration - elapsed);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(RelayError::Cancelled { context: None }),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// A probe still running at `deadline` is dropped and reads as unknown.
    async fn probe_all(&self, cancel: &CancellationToken, deadline: Instant) -> Vec<Option<T>> {
        futures::future::join_all(self.sources.iter().map(|source| async move {
            let attempt = self
                .probe_retry
                .execute(&source.name, cancel, |_| (source.run)());
            let Ok(outcome) = tokio::time::timeout_at(deadline, attempt).await else {
                debug!(
                    label = %self.label,
                    source = %source.name,
                    "probe still running at deadline; treating source as unknown"
                );
                return None;
            };
            match outcome {
                Ok(value) => Some(value),
                Err(RetryError::Exhausted { attempts, last }) => {
                    debug!(
                        label = %self.label,
                        source = %source.name,
                        attempts,
                        error = %last,
                        "probe failed; treating source as unknown"
                    );
                    None
                }
                Err(RetryError::Cancelled { .. }) => None,
            }
        }))
        .await
    }

    fn emit(&self, phase: PollPhase, attempt: u32, known: usize, elapsed: Duration) {
        let Some(tx) = &self.progress_tx else {
            return;
        };
        let total = self.sources.len();
        let message = match phase {
            PollPhase::Waiting => format!(
                "waiting for {} ({known}/{total} sources answered, attempt {attempt}/{})",
                self.label, self.max_attempts
            ),
            PollPhase::Converged => format!("{} confirmed by all {total} sources", self.label),
            PollPhase::TimedOut => format!(
                "{} not confirmed within {}s",
                self.label,
                self.max_total_duration.as_secs()
            ),
            PollPhase::Exhausted => format!(
                "{} not confirmed after {attempt} attempts",
                self.label
            ),
        };
        let _ = tx.send(PollProgress {
            label: self.label.clone(),
            attempt,
            max_attempts: self.max_attempts,
            percent: self.percent(phase, attempt, elapsed),
            phase,
            message,
            known_sources: known,
            total_sources: total,
            elapsed_ms: elapsed.as_millis() as u64,
        });
    }

    /// Share of the attempt or time budget used, whichever is larger.
    fn percent(&self, phase: PollPhase, attempt: u32, elapsed: Duration) -> u8 {
        if phase != PollPhase::Waiting {
            return 100;
        }
        let by_attempts = f64::from(attempt) / f64::from(self.max_attempts);
        let by_time = if self.max_total_duration.is_zero() {
            1.0
        } else {
            elapsed.as_secs_f64() / self.max_total_duration.as_secs_f64()
        };
        (by_attempts.max(by_time) * 100.0).clamp(0.0, 99.0) as u8
    }
}

fn snapshot<T: Serialize>(values: &[Option<T>]) -> Vec<Option<serde_json::Value>> {
    values
        .iter()
        .map(|value| value.as_ref().and_then(|v| serde_json::to_value(v).ok()))
        .collect()
}

impl<T> std::fmt::Debug for ConvergencePoller<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConvergencePoller")
            .field("label", &self.label)
            .field("sources", &self.sources)
            .field("max_attempts", &self.max_attempts)
            .field("max_total_duration", &self.max_total_duration)
            .finish()
    }
}
