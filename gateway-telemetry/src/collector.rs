//! Passive, lock-guarded metrics accumulator fed at request exit points.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::num::NonZeroUsize;
use std::sync::{PoisonError, RwLock};
use std::time::{Duration, Instant};

use metrics::{counter, gauge, histogram};
use serde::Serialize;
use tracing::warn;

/// Default rolling window length.
pub const DEFAULT_WINDOW: usize = 1000;
/// Default consecutive failures before health goes down.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;
/// Default trailing window for the error rate.
pub const DEFAULT_ERROR_WINDOW: Duration = Duration::from_secs(60);

/// How a request finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Served.
    Success,
    /// Routing or evaluation failed.
    Failure,
    /// A policy blocked it.
    Blocked,
}

impl Outcome {
    /// Label value used for exported metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Blocked => "blocked",
        }
    }
}

/// One finished request as seen by the collector.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricsSample {
    request_type: String,
    provider: Option<String>,
    latency: Duration,
    outcome: Outcome,
    tokens: u64,
    cost: f64,
}

impl MetricsSample {
    /// Creates a sample without provider data.
    #[must_use]
    pub fn new(request_type: impl Into<String>, latency: Duration, outcome: Outcome) -> Self {
        Self {
            request_type: request_type.into(),
            provider: None,
            latency,
            outcome,
            tokens: 0,
            cost: 0.0,
        }
    }

    /// Attributes the sample to a provider.
    #[must_use]
    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    /// Records token usage and cost.
    #[must_use]
    pub fn with_usage(mut self, tokens: u64, cost: f64) -> Self {
        self.tokens = tokens;
        self.cost = cost;
        self
    }

    /// Returns the outcome.
    #[must_use]
    pub fn outcome(&self) -> Outcome {
        self.outcome
    }
}

/// Nearest-rank percentile: sorts a copy and indexes at `len * pct / 100`,
/// clamped to the last element. Empty input yields zero.
#[must_use]
pub fn percentile(values: &[Duration], pct: u32) -> Duration {
    if values.is_empty() {
        return Duration::ZERO;
    }
    let mut sorted = values.to_vec();
    sorted.sort_unstable();
    let index = usize::try_from(pct)
        .ok()
        .and_then(|pct| sorted.len().checked_mul(pct))
        .map_or(sorted.len() - 1, |scaled| (scaled / 100).min(sorted.len() - 1));
    sorted[index]
}

#[derive(Debug)]
struct LatencyWindow {
    capacity: NonZeroUsize,
    samples: VecDeque<Duration>,
}

impl LatencyWindow {
    fn new(capacity: NonZeroUsize) -> Self {
        Self {
            capacity,
            samples: VecDeque::new(),
        }
    }

    fn push(&mut self, latency: Duration) {
        if self.samples.len() == self.capacity.get() {
            self.samples.pop_front();
        }
        self.samples.push_back(latency);
    }

    fn summary(&self) -> LatencySummary {
        let values: Vec<Duration> = self.samples.iter().copied().collect();
        let avg = if values.is_empty() {
            Duration::ZERO
        } else {
            values.iter().sum::<Duration>() / u32::try_from(values.len()).unwrap_or(u32::MAX)
        };
        LatencySummary {
            samples: values.len(),
            avg_ms: millis(avg),
            p50_ms: millis(percentile(&values, 50)),
            p95_ms: millis(percentile(&values, 95)),
            p99_ms: millis(percentile(&values, 99)),
        }
    }
}

fn millis(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}

/// Latency distribution over the current window.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LatencySummary {
    /// Samples in the window.
    pub samples: usize,
    /// Mean latency.
    pub avg_ms: f64,
    /// Median latency.
    pub p50_ms: f64,
    /// 95th percentile latency.
    pub p95_ms: f64,
    /// 99th percentile latency.
    pub p99_ms: f64,
}

/// Running totals for a request type or provider.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Totals {
    /// All samples.
    pub count: u64,
    /// Served samples.
    pub success: u64,
    /// Failed samples.
    pub failure: u64,
    /// Blocked samples.
    pub blocked: u64,
    /// Tokens consumed.
    pub tokens: u64,
    /// Accumulated cost.
    pub cost: f64,
}

impl Totals {
    fn add(&mut self, sample: &MetricsSample) {
        self.count += 1;
        match sample.outcome {
            Outcome::Success => self.success += 1,
            Outcome::Failure => self.failure += 1,
            Outcome::Blocked => self.blocked += 1,
        }
        self.tokens += sample.tokens;
        self.cost += sample.cost;
    }
}

#[derive(Debug)]
struct Series {
    window: LatencyWindow,
    totals: Totals,
}

impl Series {
    fn new(capacity: NonZeroUsize) -> Self {
        Self {
            window: LatencyWindow::new(capacity),
            totals: Totals::default(),
        }
    }

    fn record(&mut self, sample: &MetricsSample) {
        self.window.push(sample.latency);
        self.totals.add(sample);
    }
}

/// Aggregates for one series.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SeriesSnapshot {
    /// Running totals.
    #[serde(flatten)]
    pub totals: Totals,
    /// Latency distribution.
    pub latency: LatencySummary,
    /// Share of successful samples, in percent.
    pub availability: f64,
}

impl SeriesSnapshot {
    #[allow(clippy::cast_precision_loss)]
    fn of(series: &Series) -> Self {
        let availability = if series.totals.count == 0 {
            0.0
        } else {
            series.totals.success as f64 / series.totals.count as f64 * 100.0
        };
        Self {
            totals: series.totals.clone(),
            latency: series.window.summary(),
            availability,
        }
    }
}

/// Risk bucket label for a score.
#[must_use]
pub fn risk_bucket(score: f64) -> &'static str {
    match score {
        s if s < 0.2 => "very_low",
        s if s < 0.4 => "low",
        s if s < 0.6 => "medium",
        s if s < 0.8 => "high",
        _ => "very_high",
    }
}

/// Policy evaluation counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PolicySnapshot {
    /// Evaluations recorded.
    pub evaluations: u64,
    /// Requests blocked by a policy.
    pub blocked_by_policy: u64,
    /// Fields redacted from responses.
    pub redactions: u64,
    /// Match count per policy name.
    pub policy_hits: BTreeMap<String, u64>,
    /// Evaluations per risk bucket.
    pub risk_distribution: BTreeMap<String, u64>,
    /// Mean evaluation time.
    pub avg_evaluation_ms: f64,
}

#[derive(Debug, Default)]
struct PolicyState {
    snapshot: PolicySnapshot,
    evaluation_total: Duration,
}

/// Read-side view of the collector.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    /// Aggregates per request type.
    pub request_types: BTreeMap<String, SeriesSnapshot>,
    /// Aggregates per provider.
    pub providers: BTreeMap<String, SeriesSnapshot>,
    /// Latency per pipeline stage.
    pub stages: BTreeMap<String, LatencySummary>,
    /// Policy counters.
    pub policy: PolicySnapshot,
    /// Health flag derived from consecutive failures.
    pub healthy: bool,
    /// Current run of non-blocked failures.
    pub consecutive_failures: u32,
    /// Failures per second over the trailing window.
    pub error_rate: f64,
    /// All samples recorded.
    pub total_requests: u64,
    /// Seconds since the collector was created.
    pub uptime_secs: u64,
}

/// Collector settings.
#[derive(Debug, Clone, Copy)]
pub struct CollectorConfig {
    /// Rolling window length.
    pub window: NonZeroUsize,
    /// Consecutive failures before health goes down.
    pub failure_threshold: u32,
    /// Trailing window for the error rate.
    pub error_window: Duration,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            window: NonZeroUsize::new(DEFAULT_WINDOW).unwrap_or(NonZeroUsize::MIN),
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            error_window: DEFAULT_ERROR_WINDOW,
        }
    }
}

#[derive(Debug)]
struct CollectorState {
    request_types: HashMap<String, Series>,
    providers: HashMap<String, Series>,
    stages: HashMap<String, LatencyWindow>,
    policy: PolicyState,
    failures: VecDeque<Instant>,
    consecutive_failures: u32,
    healthy: bool,
    total_requests: u64,
}

/// Rolling request metrics guarded by a single read/write lock.
#[derive(Debug)]
pub struct MetricsCollector {
    config: CollectorConfig,
    started: Instant,
    state: RwLock<CollectorState>,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new(CollectorConfig::default())
    }
}

impl MetricsCollector {
    /// Creates a collector.
    #[must_use]
    pub fn new(config: CollectorConfig) -> Self {
        Self {
            config,
            started: Instant::now(),
            state: RwLock::new(CollectorState {
                request_types: HashMap::new(),
                providers: HashMap::new(),
                stages: HashMap::new(),
                policy: PolicyState::default(),
                failures: VecDeque::new(),
                consecutive_failures: 0,
                healthy: true,
                total_requests: 0,
            }),
        }
    }

    /// Records a finished request.
    pub fn record(&self, sample: MetricsSample) {
        self.record_at(sample, Instant::now());
    }

    /// Records a finished request observed at `at`.
    pub fn record_at(&self, sample: MetricsSample, at: Instant) {
        let labels = [
            ("request_type", sample.request_type.clone()),
            ("outcome", sample.outcome.as_str().to_owned()),
        ];
        counter!("gateway_requests_total", &labels).increment(1);
        histogram!("gateway_request_duration_seconds", &labels).record(sample.latency.as_secs_f64());

        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.total_requests += 1;
        let window = self.config.window;
        state
            .request_types
            .entry(sample.request_type.clone())
            .or_insert_with(|| Series::new(window))
            .record(&sample);

        if sample.outcome != Outcome::Blocked {
            if let Some(provider) = &sample.provider {
                state
                    .providers
                    .entry(provider.clone())
                    .or_insert_with(|| Series::new(window))
                    .record(&sample);
            }
        }

        match sample.outcome {
            Outcome::Success => {
                state.consecutive_failures = 0;
                state.healthy = true;
            }
            Outcome::Failure => {
                state.consecutive_failures = state.consecutive_failures.saturating_add(1);
                state.failures.push_back(at);
                if state.healthy && state.consecutive_failures >= self.config.failure_threshold {
                    state.healthy = false;
                    warn!(
                        consecutive_failures = state.consecutive_failures,
                        "request failures crossed the health threshold"
                    );
                }
            }
            Outcome::Blocked => {}
        }
        Self::prune_failures(&mut state.failures, at, self.config.error_window);
        gauge!("gateway_healthy").set(if state.healthy { 1.0 } else { 0.0 });
    }

    /// Records one policy evaluation.
    pub fn record_policy_evaluation(&self, elapsed: Duration, risk_score: f64, applied: &[String], blocked: bool) {
        counter!("gateway_policy_evaluations_total").increment(1);
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let policy = &mut state.policy;
        policy.snapshot.evaluations += 1;
        policy.evaluation_total += elapsed;
        if blocked {
            policy.snapshot.blocked_by_policy += 1;
        }
        for name in applied {
            *policy.snapshot.policy_hits.entry(name.clone()).or_default() += 1;
        }
        *policy
            .snapshot
            .risk_distribution
            .entry(risk_bucket(risk_score).to_owned())
            .or_default() += 1;
    }

    /// Records fields redacted from a response.
    pub fn record_redaction(&self, fields: usize) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.policy.snapshot.redactions += u64::try_from(fields).unwrap_or(u64::MAX);
    }

    /// Records how long a pipeline stage took.
    pub fn record_stage(&self, stage: &str, elapsed: Duration) {
        histogram!("gateway_stage_duration_seconds", "stage" => stage.to_owned()).record(elapsed.as_secs_f64());
        let window = self.config.window;
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state
            .stages
            .entry(stage.to_owned())
            .or_insert_with(|| LatencyWindow::new(window))
            .push(elapsed);
    }

    /// Returns `true` until the failure threshold is crossed.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.state.read().unwrap_or_else(PoisonError::into_inner).healthy
    }

    /// Returns the current aggregates.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        self.snapshot_at(Instant::now())
    }

    /// Returns the aggregates as seen at `now`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn snapshot_at(&self, now: Instant) -> MetricsSnapshot {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        let recent_failures = state
            .failures
            .iter()
            .filter(|at| now.saturating_duration_since(**at) <= self.config.error_window)
            .count();
        let window_secs = self.config.error_window.as_secs_f64();
        let error_rate = if window_secs > 0.0 {
            recent_failures as f64 / window_secs
        } else {
            0.0
        };

        let mut policy = state.policy.snapshot.clone();
        if policy.evaluations > 0 {
            policy.avg_evaluation_ms = millis(state.policy.evaluation_total) / policy.evaluations as f64;
        }

        MetricsSnapshot {
            request_types: state
                .request_types
                .iter()
                .map(|(name, series)| (name.clone(), SeriesSnapshot::of(series)))
                .collect(),
            providers: state
                .providers
                .iter()
                .map(|(name, series)| (name.clone(), SeriesSnapshot::of(series)))
                .collect(),
            stages: state
                .stages
                .iter()
                .map(|(name, window)| (name.clone(), window.summary()))
                .collect(),
            policy,
            healthy: state.healthy,
            consecutive_failures: state.consecutive_failures,
            error_rate,
            total_requests: state.total_requests,
            uptime_secs: now.saturating_duration_since(self.started).as_secs(),
        }
    }

    fn prune_failures(failures: &mut VecDeque<Instant>, now: Instant, window: Duration) {
        while failures
            .front()
            .is_some_and(|at| now.saturating_duration_since(*at) > window)
        {
            failures.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(values: &[u64]) -> Vec<Duration> {
        values.iter().copied().map(Duration::from_millis).collect()
    }

    #[test]
    fn nearest_rank_percentiles() {
        let timings = ms(&[50, 10, 40, 20, 30]);
        assert_eq!(percentile(&timings, 50), Duration::from_millis(30));
        assert_eq!(percentile(&timings, 95), Duration::from_millis(50));
        assert_eq!(percentile(&timings, 99), Duration::from_millis(50));
        assert_eq!(percentile(&[], 50), Duration::ZERO);
    }

    #[test]
    fn snapshot_reports_window_percentiles() {
        let collector = MetricsCollector::default();
        for latency in [10, 20, 30, 40, 50] {
            collector.record(MetricsSample::new("chat", Duration::from_millis(latency), Outcome::Success));
        }
        let chat = &collector.snapshot().request_types["chat"];
        assert_eq!(chat.totals.count, 5);
        assert!((chat.latency.p50_ms - 30.0).abs() < 1e-9);
        assert!((chat.latency.p95_ms - 50.0).abs() < 1e-9);
        assert!((chat.latency.avg_ms - 30.0).abs() < 1e-9);
    }

    #[test]
    fn windows_evict_the_oldest_samples() {
        let collector = MetricsCollector::new(CollectorConfig {
            window: NonZeroUsize::new(3).unwrap(),
            ..CollectorConfig::default()
        });
        for latency in [100, 1, 2, 3] {
            collector.record(MetricsSample::new("sql", Duration::from_millis(latency), Outcome::Success));
        }
        let sql = &collector.snapshot().request_types["sql"];
        assert_eq!(sql.latency.samples, 3);
        assert_eq!(sql.totals.count, 4);
        assert!((sql.latency.p99_ms - 3.0).abs() < 1e-9);
    }

    #[test]
    fn five_failures_take_health_down_until_a_success() {
        let collector = MetricsCollector::default();
        let failure = || MetricsSample::new("chat", Duration::from_millis(5), Outcome::Failure);
        for _ in 0..4 {
            collector.record(failure());
        }
        collector.record(MetricsSample::new("chat", Duration::from_millis(5), Outcome::Blocked));
        assert!(collector.is_healthy());

        collector.record(failure());
        assert!(!collector.is_healthy());
        assert_eq!(collector.snapshot().consecutive_failures, 5);

        collector.record(MetricsSample::new("chat", Duration::from_millis(5), Outcome::Success));
        let snapshot = collector.snapshot();
        assert!(snapshot.healthy);
        assert_eq!(snapshot.consecutive_failures, 0);
    }

    #[test]
    fn failure_streak_saturates() {
        let collector = MetricsCollector::default();
        collector
            .state
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .consecutive_failures = u32::MAX;
        collector.record(MetricsSample::new("chat", Duration::from_millis(5), Outcome::Failure));
        assert_eq!(collector.snapshot().consecutive_failures, u32::MAX);
        assert!(!collector.is_healthy());
    }

    #[test]
    fn error_rate_counts_the_trailing_minute() {
        let collector = MetricsCollector::default();
        let start = Instant::now();
        for offset in [0, 10, 70, 80, 90] {
            collector.record_at(
                MetricsSample::new("chat", Duration::from_millis(1), Outcome::Failure),
                start + Duration::from_secs(offset),
            );
        }
        let snapshot = collector.snapshot_at(start + Duration::from_secs(100));
        assert!((snapshot.error_rate - 3.0 / 60.0).abs() < 1e-9);
    }

    #[test]
    fn providers_skip_blocked_and_anonymous_samples() {
        let collector = MetricsCollector::default();
        collector.record(
            MetricsSample::new("chat", Duration::from_millis(20), Outcome::Success)
                .with_provider("openai")
                .with_usage(120, 0.25),
        );
        collector.record(
            MetricsSample::new("chat", Duration::from_millis(20), Outcome::Failure).with_provider("openai"),
        );
        collector.record(
            MetricsSample::new("chat", Duration::from_millis(2), Outcome::Blocked).with_provider("openai"),
        );
        collector.record(MetricsSample::new("chat", Duration::from_millis(2), Outcome::Success));

        let snapshot = collector.snapshot();
        let openai = &snapshot.providers["openai"];
        assert_eq!(openai.totals.count, 2);
        assert_eq!(openai.totals.tokens, 120);
        assert!((openai.availability - 50.0).abs() < 1e-9);
        assert_eq!(snapshot.providers.len(), 1);
        assert_eq!(snapshot.request_types["chat"].totals.blocked, 1);
    }

    #[test]
    fn policy_and_stage_metrics_accumulate() {
        let collector = MetricsCollector::default();
        collector.record_policy_evaluation(Duration::from_millis(2), 0.9, &["pii".to_owned()], true);
        collector.record_policy_evaluation(Duration::from_millis(4), 0.1, &[], false);
        collector.record_redaction(2);
        collector.record_stage("policy_evaluation", Duration::from_millis(3));

        let snapshot = collector.snapshot();
        assert_eq!(snapshot.policy.evaluations, 2);
        assert_eq!(snapshot.policy.blocked_by_policy, 1);
        assert_eq!(snapshot.policy.redactions, 2);
        assert_eq!(snapshot.policy.policy_hits["pii"], 1);
        assert_eq!(snapshot.policy.risk_distribution["very_high"], 1);
        assert_eq!(snapshot.policy.risk_distribution["very_low"], 1);
        assert!((snapshot.policy.avg_evaluation_ms - 3.0).abs() < 1e-9);
        assert_eq!(snapshot.stages["policy_evaluation"].samples, 1);
    }
}
