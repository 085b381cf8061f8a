//! Unconditional capture of synthetic-monitor transactions.

use std::sync::{Arc, Mutex};

use super::builder::TraceBuilder;
use super::candidate::TraceCandidate;
use super::segment::TransactionTrace;
use super::TransactionSampler;
use crate::bounded_queue::BoundedQueue;

/// Retains every synthetic-monitor transaction, no thresholds, up to a
/// pending cap per harvest window. Runs ahead of every other sampler so a
/// synthetic transaction never competes on score.
#[derive(Debug)]
pub struct SyntheticsSampler {
    pending: Mutex<BoundedQueue<Arc<TraceCandidate>>>,
    builder: TraceBuilder,
}

impl SyntheticsSampler {
    /// Creates a sampler holding at most `pending_limit` synthetic
    /// transactions between harvests.
    pub fn new(pending_limit: usize, builder: TraceBuilder) -> Self {
        SyntheticsSampler {
            pending: Mutex::new(BoundedQueue::new(pending_limit)),
            builder,
        }
    }
}

impl TransactionSampler for SyntheticsSampler {
    fn notice(&self, candidate: &Arc<TraceCandidate>) -> bool {
        if !candidate.synthetic {
            return false;
        }
        let mut pending = match self.pending.lock() {
            Ok(pending) => pending,
            Err(poisoned) => poisoned.into_inner(),
        };
        let accepted = pending.push_back(Arc::clone(candidate));
        if !accepted {
            apm_debug!(
                name: "SyntheticsSampler.PendingLimitReached",
                transaction = candidate.blame_metric.clone(),
                dropped = pending.dropped_count() as u64
            );
        }
        accepted
    }

    fn harvest(&self, _app_name: &str) -> Vec<TransactionTrace> {
        let mut pending = match self.pending.lock() {
            Ok(pending) => pending,
            Err(poisoned) => poisoned.into_inner(),
        };
        pending
            .drain()
            .map(|candidate| self.builder.build(&candidate))
            .collect()
    }

    fn stop(&self) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.drain().for_each(drop);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::{SyntheticsSampler, TransactionSampler};
    use crate::trace::{TraceBuilder, TraceCandidate};

    fn synthetic(name: &str) -> Arc<TraceCandidate> {
        Arc::new(
            TraceCandidate::builder("app", name)
                .with_duration(Duration::from_millis(1))
                .synthetic()
                .build(),
        )
    }

    #[test]
    fn ignores_non_synthetic_transactions() {
        let sampler = SyntheticsSampler::new(20, TraceBuilder::default());
        let plain = Arc::new(TraceCandidate::builder("app", "WebTransaction/a").build());
        assert!(!sampler.notice(&plain));
        assert!(sampler.harvest("app").is_empty());
    }

    #[test]
    fn captures_every_synthetic_up_to_the_pending_limit() {
        let sampler = SyntheticsSampler::new(2, TraceBuilder::default());
        assert!(sampler.notice(&synthetic("WebTransaction/a")));
        assert!(sampler.notice(&synthetic("WebTransaction/b")));
        // At the cap the candidate falls through to the rest of the chain.
        assert!(!sampler.notice(&synthetic("WebTransaction/c")));

        let traces = sampler.harvest("app");
        assert_eq!(traces.len(), 2);
        // The window reset frees capacity again.
        assert!(sampler.notice(&synthetic("WebTransaction/d")));
    }
}
