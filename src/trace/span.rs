//! Execution spans produced by the (external) instrumentation layer.

use std::collections::HashMap;
use std::time::{Duration, SystemTime};

/// A free-form attribute value attached to spans and trace segments.
#[cfg_attr(feature = "serialize", derive(serde::Serialize))]
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub enum Value {
    /// A boolean value.
    Bool(bool),
    /// A signed integer value.
    I64(i64),
    /// A floating point value.
    F64(f64),
    /// A string value.
    String(String),
    /// A list of strings, used for stack traces.
    StringList(Vec<String>),
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::I64(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::F64(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_owned())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

/// One measured unit of work inside a transaction.
///
/// Spans arrive from the instrumentation layer grouped per finished
/// transaction and form a parent-chased forest: `parent_id` references
/// another span of the same transaction, or is `None` for a root. Spans
/// are transient; they only live until their transaction is noticed and,
/// if retained, converted into a [`TransactionSegment`] tree.
///
/// [`TransactionSegment`]: crate::trace::TransactionSegment
#[derive(Clone, Debug)]
pub struct ExecutionSpan {
    /// Identifier unique within the owning transaction.
    pub id: u64,
    /// The parent span, if any.
    pub parent_id: Option<u64>,
    /// OS id of the thread that executed this span.
    pub thread_id: u64,
    /// The metric this span's time is blamed on.
    pub metric_name: String,
    /// When the measured work started.
    pub start_time: SystemTime,
    /// When the measured work ended.
    pub end_time: SystemTime,
    /// Whether this span becomes a node in the retained trace tree. Spans
    /// without the flag are skipped by the trace builder and their children
    /// are reparented to the nearest flagged ancestor.
    pub segment_boundary: bool,
    /// Free-form attributes copied onto the segment.
    pub attributes: HashMap<String, Value>,
    /// Captured stack frames, innermost first, if the instrumentation
    /// recorded any.
    pub stack_trace: Option<Vec<String>>,
}

impl ExecutionSpan {
    /// Creates a segment-boundary span with no parent and no attributes.
    pub fn new(
        id: u64,
        metric_name: impl Into<String>,
        start_time: SystemTime,
        end_time: SystemTime,
    ) -> Self {
        ExecutionSpan {
            id,
            parent_id: None,
            thread_id: 0,
            metric_name: metric_name.into(),
            start_time,
            end_time,
            segment_boundary: true,
            attributes: HashMap::new(),
            stack_trace: None,
        }
    }

    /// The wall-clock duration of this span. Zero if the clock went
    /// backwards between start and end.
    pub fn duration(&self) -> Duration {
        self.end_time
            .duration_since(self.start_time)
            .unwrap_or_default()
    }
}
