//! Finished transactions under evaluation for retention.

use std::time::{Duration, SystemTime};

use super::span::ExecutionSpan;

/// How a transaction was dispatched. Determines which category sampler a
/// candidate is routed to when auto app naming is off.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DispatcherCategory {
    /// The transaction served an inbound request.
    Web,
    /// The transaction ran background work.
    Background,
}

impl DispatcherCategory {
    /// The name of the category sampler this dispatcher routes to.
    pub fn sampler_name(&self) -> &'static str {
        match self {
            DispatcherCategory::Web => "request",
            DispatcherCategory::Background => "background",
        }
    }
}

/// The transaction-tracer threshold configuration a candidate was finished
/// under. The threshold is apdex-derived and resolved by the (external)
/// configuration layer before the candidate reaches this crate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TraceThresholds {
    /// Whether trace capture is enabled at all for this transaction.
    /// Disabled candidates are never offered to the sampler chain.
    pub enabled: bool,
    /// Response time a transaction must exceed to be considered slow.
    pub transaction_threshold: Duration,
}

impl Default for TraceThresholds {
    fn default() -> Self {
        TraceThresholds {
            enabled: true,
            // four times the default 500ms apdex target
            transaction_threshold: Duration::from_secs(2),
        }
    }
}

/// One finished transaction being evaluated for retention.
///
/// Created by the instrumentation layer when a transaction finishes,
/// consumed read-only by samplers, and discarded after harvest or
/// rejection. Samplers that accept a candidate hold it behind an `Arc`
/// until the next harvest.
#[derive(Clone, Debug)]
pub struct TraceCandidate {
    /// The reporting application.
    pub app_name: String,
    /// The aggregation key ("blame metric") the transaction reports under.
    pub blame_metric: String,
    /// Legacy wall-clock duration of the whole transaction.
    pub legacy_duration: Duration,
    /// Response time as seen by the caller.
    pub response_time: Duration,
    /// Dispatcher category.
    pub category: DispatcherCategory,
    /// The threshold configuration this transaction finished under.
    pub thresholds: TraceThresholds,
    /// The transaction's full span collection (a parent-chased forest).
    pub spans: Vec<ExecutionSpan>,
    /// Correlation id carried through to the built trace.
    pub correlation_id: String,
    /// The request identifier, when the transaction served a request.
    pub request_uri: Option<String>,
    /// When the transaction started.
    pub start_time: SystemTime,
    /// CPU time burned by the transaction, when measured.
    pub cpu_time: Option<Duration>,
    /// Time to first byte, when measured.
    pub time_to_first_byte: Option<Duration>,
    /// Whether the transaction was driven by a synthetic monitor.
    pub synthetic: bool,
}

impl TraceCandidate {
    /// Starts building a candidate for the given application and blame
    /// metric.
    pub fn builder(
        app_name: impl Into<String>,
        blame_metric: impl Into<String>,
    ) -> TraceCandidateBuilder {
        TraceCandidateBuilder::new(app_name, blame_metric)
    }
}

/// Builder for [`TraceCandidate`].
#[derive(Clone, Debug)]
pub struct TraceCandidateBuilder {
    candidate: TraceCandidate,
}

impl TraceCandidateBuilder {
    /// Creates a builder with web dispatch, default thresholds and zero
    /// durations.
    pub fn new(app_name: impl Into<String>, blame_metric: impl Into<String>) -> Self {
        TraceCandidateBuilder {
            candidate: TraceCandidate {
                app_name: app_name.into(),
                blame_metric: blame_metric.into(),
                legacy_duration: Duration::ZERO,
                response_time: Duration::ZERO,
                category: DispatcherCategory::Web,
                thresholds: TraceThresholds::default(),
                spans: Vec::new(),
                correlation_id: String::new(),
                request_uri: None,
                start_time: SystemTime::UNIX_EPOCH,
                cpu_time: None,
                time_to_first_byte: None,
                synthetic: false,
            },
        }
    }

    /// Sets both duration variants to the same value.
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.candidate.legacy_duration = duration;
        self.candidate.response_time = duration;
        self
    }

    /// Sets the legacy wall-clock duration.
    pub fn with_legacy_duration(mut self, duration: Duration) -> Self {
        self.candidate.legacy_duration = duration;
        self
    }

    /// Sets the response time.
    pub fn with_response_time(mut self, response_time: Duration) -> Self {
        self.candidate.response_time = response_time;
        self
    }

    /// Sets the dispatcher category.
    pub fn with_category(mut self, category: DispatcherCategory) -> Self {
        self.candidate.category = category;
        self
    }

    /// Sets the threshold configuration.
    pub fn with_thresholds(mut self, thresholds: TraceThresholds) -> Self {
        self.candidate.thresholds = thresholds;
        self
    }

    /// Sets the span collection.
    pub fn with_spans(mut self, spans: Vec<ExecutionSpan>) -> Self {
        self.candidate.spans = spans;
        self
    }

    /// Sets the correlation id.
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.candidate.correlation_id = correlation_id.into();
        self
    }

    /// Sets the request identifier.
    pub fn with_request_uri(mut self, request_uri: impl Into<String>) -> Self {
        self.candidate.request_uri = Some(request_uri.into());
        self
    }

    /// Sets the transaction start time.
    pub fn with_start_time(mut self, start_time: SystemTime) -> Self {
        self.candidate.start_time = start_time;
        self
    }

    /// Records measured CPU time.
    pub fn with_cpu_time(mut self, cpu_time: Duration) -> Self {
        self.candidate.cpu_time = Some(cpu_time);
        self
    }

    /// Records the measured time to first byte.
    pub fn with_time_to_first_byte(mut self, ttfb: Duration) -> Self {
        self.candidate.time_to_first_byte = Some(ttfb);
        self
    }

    /// Flags the transaction as synthetic-monitor driven.
    pub fn synthetic(mut self) -> Self {
        self.candidate.synthetic = true;
        self
    }

    /// Finishes the candidate.
    pub fn build(self) -> TraceCandidate {
        self.candidate
    }
}
