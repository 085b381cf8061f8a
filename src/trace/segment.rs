//! Retained trace trees.

use std::collections::HashMap;
use std::time::{Duration, SystemTime};

use super::span::Value;

/// Attribute key for a full stack trace on a segment.
pub(crate) const BACKTRACE_ATTRIBUTE: &str = "backtrace";
/// Attribute key used when a segment's stack trace was shortened because
/// the parent segment holds the rest of the frames.
pub(crate) const PARTIAL_TRACE_ATTRIBUTE: &str = "partialtrace";

/// A node in a retained trace tree.
///
/// Built once per retained candidate by the [`TraceBuilder`]; immutable
/// afterwards except for call-count merges during construction.
///
/// [`TraceBuilder`]: crate::trace::TraceBuilder
#[cfg_attr(feature = "serialize", derive(serde::Serialize))]
#[derive(Clone, Debug)]
pub struct TransactionSegment {
    /// The metric this segment's time is blamed on.
    pub metric_name: String,
    /// Entry offset in milliseconds relative to the trace start.
    pub entry_offset_ms: u64,
    /// Exit offset in milliseconds relative to the trace start. Extended
    /// when sibling segments are merged into this one.
    pub exit_offset_ms: u64,
    /// How many consecutive sibling spans were folded into this segment.
    /// At least 1.
    pub call_count: u32,
    /// Attributes copied from the originating span.
    pub attributes: HashMap<String, Value>,
    /// Child segments, ordered.
    pub children: Vec<TransactionSegment>,
}

impl TransactionSegment {
    pub(crate) fn new(
        metric_name: String,
        entry_offset_ms: u64,
        exit_offset_ms: u64,
        attributes: HashMap<String, Value>,
    ) -> Self {
        TransactionSegment {
            metric_name,
            entry_offset_ms,
            exit_offset_ms,
            call_count: 1,
            attributes,
            children: Vec::new(),
        }
    }

    /// Folds one more same-named consecutive sibling into this segment:
    /// the call count goes up and the exit offset is extended by the
    /// merged span's duration.
    pub(crate) fn merge(&mut self, merged_duration_ms: u64) {
        self.call_count += 1;
        self.exit_offset_ms += merged_duration_ms;
    }

    /// Total number of segments in this subtree, including `self`.
    pub fn segment_count(&self) -> usize {
        1 + self
            .children
            .iter()
            .map(TransactionSegment::segment_count)
            .sum::<usize>()
    }
}

/// The immutable snapshot of one retained transaction, ready for the
/// transport layer.
///
/// Created at harvest time, handed to the configured trace exporter, then
/// discarded.
#[cfg_attr(feature = "serialize", derive(serde::Serialize))]
#[derive(Clone, Debug)]
pub struct TransactionTrace {
    /// The synthetic root segment spanning the whole transaction.
    pub root: TransactionSegment,
    /// Total transaction duration.
    pub duration: Duration,
    /// Correlation id copied from the candidate.
    pub correlation_id: String,
    /// The reporting application.
    pub app_name: String,
    /// The transaction's aggregation key.
    pub transaction_name: String,
    /// The request identifier, when present.
    pub request_uri: Option<String>,
    /// When the transaction started.
    pub start_time: SystemTime,
    /// Intrinsic attributes: total time, CPU time, time to first byte.
    pub attributes: HashMap<String, Value>,
}

impl TransactionTrace {
    /// Total number of segments in the trace, including the root.
    pub fn segment_count(&self) -> usize {
        self.root.segment_count()
    }
}
