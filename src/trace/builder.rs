//! Conversion of span forests into retained trace trees.

use std::collections::HashMap;
use std::time::SystemTime;

use super::candidate::TraceCandidate;
use super::segment::{
    TransactionSegment, TransactionTrace, BACKTRACE_ATTRIBUTE, PARTIAL_TRACE_ATTRIBUTE,
};
use super::span::{ExecutionSpan, Value};

const ROOT_METRIC_NAME: &str = "ROOT";

const TOTAL_TIME_ATTRIBUTE: &str = "total_time";
const CPU_TIME_ATTRIBUTE: &str = "cpu_time";
const TIME_TO_FIRST_BYTE_ATTRIBUTE: &str = "time_to_first_byte";

/// Builds immutable [`TransactionTrace`] trees out of retained candidates.
///
/// Stateless apart from configuration; a sampler holds one and calls
/// [`build`](TraceBuilder::build) once per retained candidate at harvest
/// time.
#[derive(Clone, Debug)]
pub struct TraceBuilder {
    max_stack_trace_frames: usize,
}

impl Default for TraceBuilder {
    fn default() -> Self {
        TraceBuilder::new(super::config::DEFAULT_MAX_STACK_TRACE_FRAMES)
    }
}

impl TraceBuilder {
    /// Creates a builder that keeps at most `max_stack_trace_frames` frames
    /// per segment stack trace.
    pub fn new(max_stack_trace_frames: usize) -> Self {
        TraceBuilder {
            max_stack_trace_frames,
        }
    }

    /// Converts a retained candidate's span forest into a trace tree.
    ///
    /// Only segment-boundary spans become nodes; other spans are skipped
    /// and their children reparented to the nearest flagged ancestor. A
    /// span whose metric name equals the metric name of the previous
    /// sibling segment is folded into it: the segment's call count goes up
    /// and its exit offset is extended by the folded span's duration, and
    /// the folded span's children land under the surviving segment.
    pub fn build(&self, candidate: &TraceCandidate) -> TransactionTrace {
        let mut children_of: HashMap<Option<u64>, Vec<&ExecutionSpan>> = HashMap::new();
        for span in &candidate.spans {
            children_of.entry(span.parent_id).or_default().push(span);
        }

        let duration_ms = candidate.legacy_duration.as_millis() as u64;
        let mut root = TransactionSegment::new(
            ROOT_METRIC_NAME.to_owned(),
            0,
            duration_ms,
            HashMap::new(),
        );

        if let Some(top_level) = children_of.get(&None) {
            let top_level = top_level.clone();
            for span in top_level {
                self.append_span(span, &mut root, &[], candidate.start_time, &children_of);
            }
        }
        // The root always spans the whole transaction, whatever the spans
        // underneath it added up to.
        root.exit_offset_ms = duration_ms;

        let mut attributes = HashMap::new();
        attributes.insert(
            TOTAL_TIME_ATTRIBUTE.to_owned(),
            Value::F64(candidate.legacy_duration.as_secs_f64() * 1e3),
        );
        if let Some(cpu_time) = candidate.cpu_time {
            attributes.insert(
                CPU_TIME_ATTRIBUTE.to_owned(),
                Value::F64(cpu_time.as_secs_f64() * 1e3),
            );
        }
        if let Some(ttfb) = candidate.time_to_first_byte {
            attributes.insert(
                TIME_TO_FIRST_BYTE_ATTRIBUTE.to_owned(),
                Value::F64(ttfb.as_secs_f64() * 1e3),
            );
        }

        TransactionTrace {
            root,
            duration: candidate.legacy_duration,
            correlation_id: candidate.correlation_id.clone(),
            app_name: candidate.app_name.clone(),
            transaction_name: candidate.blame_metric.clone(),
            request_uri: candidate.request_uri.clone(),
            start_time: candidate.start_time,
            attributes,
        }
    }

    fn append_span(
        &self,
        span: &ExecutionSpan,
        parent: &mut TransactionSegment,
        parent_stack: &[String],
        trace_start: SystemTime,
        children_of: &HashMap<Option<u64>, Vec<&ExecutionSpan>>,
    ) {
        if !span.segment_boundary {
            // Skipped spans contribute nothing; their children hang off the
            // same parent and dedup against the same parent stack.
            if let Some(children) = children_of.get(&Some(span.id)) {
                for child in children.clone() {
                    self.append_span(child, parent, parent_stack, trace_start, children_of);
                }
            }
            return;
        }

        let span_duration_ms = span.duration().as_millis() as u64;
        let merged = match parent.children.last_mut() {
            Some(last) if last.metric_name == span.metric_name => {
                last.merge(span_duration_ms);
                true
            }
            _ => false,
        };

        if !merged {
            let entry_ms = span
                .start_time
                .duration_since(trace_start)
                .unwrap_or_default()
                .as_millis() as u64;
            let mut attributes = span.attributes.clone();
            let mut own_stack = Vec::new();
            if let Some(stack) = &span.stack_trace {
                let mut frames = stack.clone();
                frames.truncate(self.max_stack_trace_frames);
                let kept = strip_common_tail(&frames, parent_stack);
                let key = if kept < frames.len() {
                    PARTIAL_TRACE_ATTRIBUTE
                } else {
                    BACKTRACE_ATTRIBUTE
                };
                own_stack = frames.clone();
                frames.truncate(kept);
                attributes.insert(key.to_owned(), Value::StringList(frames));
            }
            parent.children.push(TransactionSegment::new(
                span.metric_name.clone(),
                entry_ms,
                entry_ms + span_duration_ms,
                attributes,
            ));
            if let (Some(children), Some(segment)) =
                (children_of.get(&Some(span.id)), parent.children.last_mut())
            {
                for child in children.clone() {
                    self.append_span(child, segment, &own_stack, trace_start, children_of);
                }
            }
        } else if let (Some(children), Some(segment)) =
            (children_of.get(&Some(span.id)), parent.children.last_mut())
        {
            // The folded span's children land under the surviving segment.
            for child in children.clone() {
                self.append_span(child, segment, parent_stack, trace_start, children_of);
            }
        }
    }
}

/// Returns how many leading frames of `frames` to keep after removing the
/// longest common tail shared with `parent_stack`. Stack frames are stored
/// innermost first, so the shared tail is the part of the call stack the
/// parent segment already recorded.
fn strip_common_tail(frames: &[String], parent_stack: &[String]) -> usize {
    let mut shared = 0;
    while shared < frames.len()
        && shared < parent_stack.len()
        && frames[frames.len() - 1 - shared] == parent_stack[parent_stack.len() - 1 - shared]
    {
        shared += 1;
    }
    frames.len() - shared
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, SystemTime};

    use super::super::candidate::TraceCandidate;
    use super::super::span::{ExecutionSpan, Value};
    use super::{strip_common_tail, TraceBuilder, BACKTRACE_ATTRIBUTE, PARTIAL_TRACE_ATTRIBUTE};

    fn span_at(
        id: u64,
        parent: Option<u64>,
        metric: &str,
        start: SystemTime,
        offset_ms: u64,
        duration_ms: u64,
    ) -> ExecutionSpan {
        let start_time = start + Duration::from_millis(offset_ms);
        let mut span = ExecutionSpan::new(
            id,
            metric,
            start_time,
            start_time + Duration::from_millis(duration_ms),
        );
        span.parent_id = parent;
        span
    }

    #[test]
    fn root_spans_whole_transaction() {
        let start = SystemTime::UNIX_EPOCH;
        let candidate = TraceCandidate::builder("app", "WebTransaction/foo")
            .with_duration(Duration::from_millis(500))
            .with_start_time(start)
            .with_spans(vec![span_at(1, None, "Servlet/foo", start, 0, 120)])
            .build();

        let trace = TraceBuilder::default().build(&candidate);
        assert_eq!(trace.root.metric_name, "ROOT");
        assert_eq!(trace.root.entry_offset_ms, 0);
        assert_eq!(trace.root.exit_offset_ms, 500);
        assert_eq!(trace.root.children.len(), 1);
        assert_eq!(trace.root.children[0].metric_name, "Servlet/foo");
        assert_eq!(trace.root.children[0].exit_offset_ms, 120);
        assert_eq!(trace.segment_count(), 2);
    }

    #[test]
    fn consecutive_same_named_siblings_merge() {
        let start = SystemTime::UNIX_EPOCH;
        let candidate = TraceCandidate::builder("app", "WebTransaction/foo")
            .with_duration(Duration::from_millis(100))
            .with_start_time(start)
            .with_spans(vec![
                span_at(1, None, "Datastore/select", start, 0, 10),
                span_at(2, None, "Datastore/select", start, 15, 20),
            ])
            .build();

        let trace = TraceBuilder::default().build(&candidate);
        assert_eq!(trace.root.children.len(), 1);
        let merged = &trace.root.children[0];
        assert_eq!(merged.call_count, 2);
        // 10ms exit extended by the folded span's 20ms duration.
        assert_eq!(merged.entry_offset_ms, 0);
        assert_eq!(merged.exit_offset_ms, 30);
    }

    #[test]
    fn interleaved_siblings_do_not_merge() {
        let start = SystemTime::UNIX_EPOCH;
        let candidate = TraceCandidate::builder("app", "WebTransaction/foo")
            .with_duration(Duration::from_millis(100))
            .with_start_time(start)
            .with_spans(vec![
                span_at(1, None, "Datastore/select", start, 0, 10),
                span_at(2, None, "External/host", start, 10, 10),
                span_at(3, None, "Datastore/select", start, 20, 10),
            ])
            .build();

        let trace = TraceBuilder::default().build(&candidate);
        assert_eq!(trace.root.children.len(), 3);
        assert!(trace.root.children.iter().all(|s| s.call_count == 1));
    }

    #[test]
    fn non_boundary_spans_are_skipped_and_children_reparented() {
        let start = SystemTime::UNIX_EPOCH;
        let mut hidden = span_at(2, Some(1), "Java/hidden", start, 5, 50);
        hidden.segment_boundary = false;
        let candidate = TraceCandidate::builder("app", "WebTransaction/foo")
            .with_duration(Duration::from_millis(100))
            .with_start_time(start)
            .with_spans(vec![
                span_at(1, None, "Servlet/foo", start, 0, 90),
                hidden,
                span_at(3, Some(2), "Datastore/select", start, 10, 20),
            ])
            .build();

        let trace = TraceBuilder::default().build(&candidate);
        assert_eq!(trace.root.children.len(), 1);
        let servlet = &trace.root.children[0];
        assert_eq!(servlet.children.len(), 1);
        assert_eq!(servlet.children[0].metric_name, "Datastore/select");
    }

    #[test]
    fn merged_span_children_land_under_surviving_segment() {
        let start = SystemTime::UNIX_EPOCH;
        let candidate = TraceCandidate::builder("app", "WebTransaction/foo")
            .with_duration(Duration::from_millis(100))
            .with_start_time(start)
            .with_spans(vec![
                span_at(1, None, "Datastore/select", start, 0, 10),
                span_at(2, None, "Datastore/select", start, 15, 20),
                span_at(3, Some(2), "Java/inner", start, 16, 5),
            ])
            .build();

        let trace = TraceBuilder::default().build(&candidate);
        assert_eq!(trace.root.children.len(), 1);
        let merged = &trace.root.children[0];
        assert_eq!(merged.call_count, 2);
        assert_eq!(merged.children.len(), 1);
        assert_eq!(merged.children[0].metric_name, "Java/inner");
    }

    #[test]
    fn child_stack_is_deduplicated_against_parent() {
        let start = SystemTime::UNIX_EPOCH;
        let mut parent = span_at(1, None, "Servlet/foo", start, 0, 90);
        parent.stack_trace = Some(vec![
            "Servlet.service".to_owned(),
            "Http.dispatch".to_owned(),
            "Thread.run".to_owned(),
        ]);
        let mut child = span_at(2, Some(1), "Datastore/select", start, 10, 20);
        child.stack_trace = Some(vec![
            "Statement.execute".to_owned(),
            "Dao.load".to_owned(),
            "Http.dispatch".to_owned(),
            "Thread.run".to_owned(),
        ]);
        let candidate = TraceCandidate::builder("app", "WebTransaction/foo")
            .with_duration(Duration::from_millis(100))
            .with_start_time(start)
            .with_spans(vec![parent, child])
            .build();

        let trace = TraceBuilder::default().build(&candidate);
        let servlet = &trace.root.children[0];
        assert!(servlet.attributes.contains_key(BACKTRACE_ATTRIBUTE));
        let db = &servlet.children[0];
        match db.attributes.get(PARTIAL_TRACE_ATTRIBUTE) {
            Some(Value::StringList(frames)) => {
                assert_eq!(frames, &["Statement.execute", "Dao.load"]);
            }
            other => panic!("expected partial trace, got {other:?}"),
        }
    }

    #[test]
    fn stack_traces_are_truncated_to_the_frame_limit() {
        let start = SystemTime::UNIX_EPOCH;
        let mut span = span_at(1, None, "Servlet/foo", start, 0, 90);
        span.stack_trace = Some((0..40).map(|i| format!("frame{i}")).collect());
        let candidate = TraceCandidate::builder("app", "WebTransaction/foo")
            .with_duration(Duration::from_millis(100))
            .with_start_time(start)
            .with_spans(vec![span])
            .build();

        let trace = TraceBuilder::new(30).build(&candidate);
        match trace.root.children[0].attributes.get(BACKTRACE_ATTRIBUTE) {
            Some(Value::StringList(frames)) => {
                assert_eq!(frames.len(), 30);
                assert_eq!(frames[0], "frame0");
            }
            other => panic!("expected backtrace, got {other:?}"),
        }
    }

    #[test]
    fn common_tail_lengths() {
        let frames: Vec<String> = ["a", "b", "c"].iter().map(|s| s.to_string()).collect();
        let parent: Vec<String> = ["x", "b", "c"].iter().map(|s| s.to_string()).collect();
        assert_eq!(strip_common_tail(&frames, &parent), 1);
        assert_eq!(strip_common_tail(&frames, &[]), 3);
        assert_eq!(strip_common_tail(&frames, &frames), 0);
    }
}
