//! First-come sampling with a bounded lifetime.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use super::builder::TraceBuilder;
use super::candidate::TraceCandidate;
use super::sampler::AtomicSlot;
use super::segment::TransactionTrace;
use super::TransactionSampler;

/// Captures the first candidate offered in each harvest window, up to a
/// fixed number of captures, then reports itself exhausted so the service
/// drops it from the chain.
///
/// Used at agent start to guarantee some early traces before the scored
/// samplers have anything over their thresholds.
#[derive(Debug)]
pub struct SingleShotSampler {
    slot: AtomicSlot<Arc<TraceCandidate>>,
    harvested: AtomicUsize,
    max_harvests: usize,
    exhausted: AtomicBool,
    builder: TraceBuilder,
}

impl SingleShotSampler {
    /// Creates a sampler that captures at most `max_harvests` traces, one
    /// per harvest window.
    pub fn new(max_harvests: usize, builder: TraceBuilder) -> Self {
        SingleShotSampler {
            slot: AtomicSlot::empty(),
            harvested: AtomicUsize::new(0),
            max_harvests,
            exhausted: AtomicBool::new(max_harvests == 0),
            builder,
        }
    }
}

impl TransactionSampler for SingleShotSampler {
    fn notice(&self, candidate: &Arc<TraceCandidate>) -> bool {
        if self.exhausted.load(Ordering::Acquire) {
            return false;
        }
        // First offer in the window wins; a held slot rejects the rest.
        self.slot.offer(0, Arc::clone(candidate))
    }

    fn harvest(&self, app_name: &str) -> Vec<TransactionTrace> {
        match self.slot.take() {
            Some(candidate) => {
                let harvested = self.harvested.fetch_add(1, Ordering::AcqRel) + 1;
                if harvested >= self.max_harvests {
                    self.exhausted.store(true, Ordering::Release);
                    apm_debug!(
                        name: "SingleShotSampler.Exhausted",
                        app_name = app_name.to_owned(),
                        harvested = harvested as u64
                    );
                }
                vec![self.builder.build(&candidate)]
            }
            None => Vec::new(),
        }
    }

    fn stop(&self) {
        self.exhausted.store(true, Ordering::Release);
        self.slot.take();
    }

    fn is_exhausted(&self) -> bool {
        self.exhausted.load(Ordering::Acquire)
    }
}
