//! Folding of stack captures into per-thread-group call trees.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use super::method::{MethodInterner, ProfiledMethod, StackFrame};
use super::tree::ProfileTree;

/// Call sites a report may carry before subtrees are shed.
pub(crate) const DEFAULT_MAX_CALL_SITES: usize = 60_000;

/// Stacks shorter than this carry no call relationship worth keeping.
const MIN_STACK_DEPTH: usize = 2;

/// One stack snapshot of one thread, as delivered by the snapshot source.
#[derive(Clone, Debug)]
pub struct StackCapture {
    /// OS id of the sampled thread.
    pub thread_id: u64,
    /// Thread group this capture aggregates under.
    pub thread_name: String,
    /// Captured frames, outermost first.
    pub frames: Vec<StackFrame>,
    /// Whether the thread was runnable when sampled.
    pub runnable: bool,
    /// When the snapshot was taken.
    pub captured_at: SystemTime,
    /// Whether the thread belongs to the agent itself.
    pub agent_thread: bool,
    /// Whether the thread was serving a request when sampled.
    pub request_thread: bool,
}

impl StackCapture {
    /// Creates a runnable, non-agent, non-request capture.
    pub fn new(thread_id: u64, thread_name: impl Into<String>, frames: Vec<StackFrame>) -> Self {
        StackCapture {
            thread_id,
            thread_name: thread_name.into(),
            frames,
            runnable: true,
            captured_at: SystemTime::now(),
            agent_thread: false,
            request_thread: false,
        }
    }
}

/// Folds the stack captures of one session into call trees, one per thread
/// group, with all call-site identities interned in a session-scoped
/// table.
#[derive(Debug, Default)]
pub struct CallTreeAggregator {
    interner: MethodInterner,
    trees: HashMap<String, ProfileTree>,
    sample_count: u64,
    total_thread_count: u64,
    runnable_thread_count: u64,
}

impl CallTreeAggregator {
    /// Creates an empty aggregator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the start of one sampling tick.
    pub fn begin_sample(&mut self) {
        self.sample_count += 1;
    }

    /// Folds one capture into the tree of its thread group. Captures with
    /// fewer than two frames carry no call relationship and are dropped.
    pub fn fold(&mut self, capture: &StackCapture) {
        self.total_thread_count += 1;
        if capture.runnable {
            self.runnable_thread_count += 1;
        }
        if capture.frames.len() < MIN_STACK_DEPTH {
            return;
        }
        let path: Vec<Arc<ProfiledMethod>> = capture
            .frames
            .iter()
            .map(|frame| self.interner.intern(frame))
            .collect();
        self.trees
            .entry(capture.thread_name.clone())
            .or_default()
            .fold(&path, capture.runnable);
    }

    /// Attributes CPU time to a thread group.
    pub fn record_cpu_time(&mut self, thread_name: &str, cpu_time: Duration) {
        self.trees
            .entry(thread_name.to_owned())
            .or_default()
            .record_cpu_time(cpu_time);
    }

    /// Total call sites across all trees.
    pub fn call_site_count(&self) -> usize {
        self.trees.values().map(ProfileTree::call_site_count).sum()
    }

    /// Number of sampling ticks seen so far.
    pub fn sample_count(&self) -> u64 {
        self.sample_count
    }

    /// Sheds whole subtrees until at most `max_call_sites` remain. The
    /// least-observed call sites go first, deepest first among equals, so
    /// the hot paths near the roots survive.
    pub fn trim_to(&mut self, max_call_sites: usize) {
        let mut excess = self.call_site_count().saturating_sub(max_call_sites);
        if excess == 0 {
            return;
        }
        let mut ranked: Vec<(String, Vec<Arc<ProfiledMethod>>, u64, usize)> = self
            .trees
            .iter()
            .flat_map(|(name, tree)| {
                tree.call_sites()
                    .into_iter()
                    .map(|(path, runnable, depth)| (name.clone(), path, runnable, depth))
            })
            .collect();
        ranked.sort_by(|a, b| a.2.cmp(&b.2).then(b.3.cmp(&a.3)));

        for (name, path, _, _) in ranked {
            if excess == 0 {
                break;
            }
            if let Some(tree) = self.trees.get_mut(&name) {
                let removed = tree.remove_subtree(&path);
                excess = excess.saturating_sub(removed);
            }
        }
        self.trees.retain(|_, tree| !tree.is_empty());
    }

    /// Consumes the aggregator into the session's report.
    pub fn into_report(
        self,
        profile_id: i64,
        start_time_ms: u64,
        end_time_ms: u64,
    ) -> ProfileReport {
        ProfileReport {
            profile_id,
            start_time_ms,
            end_time_ms,
            sample_count: self.sample_count,
            total_thread_count: self.total_thread_count,
            runnable_thread_count: self.runnable_thread_count,
            trees: self.trees,
        }
    }
}

/// The finished output of one profiling session, ready for the transport
/// layer.
#[cfg_attr(feature = "serialize", derive(serde::Serialize))]
#[derive(Clone, Debug)]
pub struct ProfileReport {
    /// Backend-assigned id of the session.
    pub profile_id: i64,
    /// Session start, milliseconds since the epoch.
    pub start_time_ms: u64,
    /// Session end, milliseconds since the epoch.
    pub end_time_ms: u64,
    /// Sampling ticks taken.
    pub sample_count: u64,
    /// Thread observations across all ticks.
    pub total_thread_count: u64,
    /// Runnable thread observations across all ticks.
    pub runnable_thread_count: u64,
    /// Aggregated call trees, one per thread group.
    pub trees: HashMap<String, ProfileTree>,
}

impl ProfileReport {
    /// Total call sites across all trees.
    pub fn call_site_count(&self) -> usize {
        self.trees.values().map(ProfileTree::call_site_count).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::super::method::StackFrame;
    use super::{CallTreeAggregator, StackCapture};

    fn capture(thread: &str, frames: &[(&str, &str, u32)], runnable: bool) -> StackCapture {
        let frames = frames
            .iter()
            .map(|(class, method, line)| StackFrame::new(*class, *method, *line))
            .collect();
        let mut capture = StackCapture::new(1, thread, frames);
        capture.runnable = runnable;
        capture
    }

    #[test]
    fn identical_stacks_collapse_into_one_path_with_counts() {
        let mut agg = CallTreeAggregator::new();
        for _ in 0..4 {
            agg.begin_sample();
            agg.fold(&capture(
                "request-pool",
                &[("Main", "run", 1), ("Dao", "load", 2)],
                true,
            ));
        }
        assert_eq!(agg.sample_count(), 4);
        assert_eq!(agg.call_site_count(), 2);
        let report = agg.into_report(7, 0, 1_000);
        assert_eq!(report.total_thread_count, 4);
        assert_eq!(report.runnable_thread_count, 4);
        let tree = &report.trees["request-pool"];
        let leaf = tree
            .roots
            .values()
            .next()
            .and_then(|root| root.children.values().next())
            .unwrap();
        assert_eq!(leaf.runnable_count, 4);
    }

    #[test]
    fn single_frame_captures_are_counted_but_not_folded() {
        let mut agg = CallTreeAggregator::new();
        agg.begin_sample();
        agg.fold(&capture("pool", &[("Thread", "park", 1)], false));
        assert_eq!(agg.call_site_count(), 0);
        let report = agg.into_report(1, 0, 0);
        assert_eq!(report.total_thread_count, 1);
        assert_eq!(report.runnable_thread_count, 0);
    }

    #[test]
    fn trees_are_grouped_by_thread_name() {
        let mut agg = CallTreeAggregator::new();
        agg.begin_sample();
        agg.fold(&capture("pool-a", &[("A", "a", 1), ("B", "b", 2)], true));
        agg.fold(&capture("pool-b", &[("C", "c", 1), ("D", "d", 2)], true));
        agg.record_cpu_time("pool-a", std::time::Duration::from_millis(30));
        agg.record_cpu_time("pool-a", std::time::Duration::from_millis(20));
        let report = agg.into_report(1, 0, 0);
        assert_eq!(report.trees.len(), 2);
        assert_eq!(
            report.trees["pool-a"].cpu_time,
            std::time::Duration::from_millis(50)
        );
    }

    #[test]
    fn trim_sheds_least_observed_deepest_subtrees_first() {
        let mut agg = CallTreeAggregator::new();
        // A hot two-site path and a cold three-site path.
        for _ in 0..10 {
            agg.begin_sample();
            agg.fold(&capture("pool", &[("A", "a", 1), ("B", "b", 2)], true));
        }
        agg.begin_sample();
        agg.fold(&capture(
            "pool",
            &[("A", "a", 1), ("C", "c", 2), ("D", "d", 3)],
            true,
        ));
        assert_eq!(agg.call_site_count(), 4);

        agg.trim_to(2);
        assert!(agg.call_site_count() <= 2);
        let report = agg.into_report(1, 0, 0);
        let tree = &report.trees["pool"];
        // The hot leaf survives.
        let root = tree.roots.values().next().unwrap();
        assert!(root
            .children
            .values()
            .any(|child| child.runnable_count == 10));
    }

    #[test]
    fn trim_within_budget_is_a_no_op() {
        let mut agg = CallTreeAggregator::new();
        agg.begin_sample();
        agg.fold(&capture("pool", &[("A", "a", 1), ("B", "b", 2)], true));
        agg.trim_to(60_000);
        assert_eq!(agg.call_site_count(), 2);
    }
}
