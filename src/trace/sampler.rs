//! Sampler traits, scoring policies and the scored-eviction sampler.

use std::collections::HashMap;
use std::fmt::Debug;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use super::builder::TraceBuilder;
use super::candidate::TraceCandidate;
use super::segment::TransactionTrace;

/// One link in the sampler chain.
///
/// A finished transaction is offered to each sampler in turn until one
/// accepts it; acceptance stops the chain. Samplers give up everything
/// they retained at each harvest.
pub trait TransactionSampler: Send + Sync + Debug {
    /// Offers a finished transaction. Returns `true` if this sampler
    /// retained the candidate, stopping the chain.
    fn notice(&self, candidate: &Arc<TraceCandidate>) -> bool;

    /// Gives up every trace retained since the previous harvest for the
    /// named application.
    fn harvest(&self, app_name: &str) -> Vec<TransactionTrace>;

    /// Discards retained state. The sampler stops accepting candidates if
    /// it is single-shot.
    fn stop(&self);

    /// Whether this sampler is spent and should be dropped from the chain
    /// at the next harvest.
    fn is_exhausted(&self) -> bool {
        false
    }
}

/// Scoring seam of the [`ScoredEvictionSampler`].
///
/// A policy decides both whether a candidate is eligible and how it
/// competes against the current slot holder.
pub trait ScorePolicy: Send + Sync + Debug {
    /// The candidate's competitive score, or `None` if this candidate is
    /// not eligible under the policy.
    fn score(&self, candidate: &TraceCandidate) -> Option<Duration>;

    /// The minimum score a candidate must exceed, or `None` if no
    /// threshold can be resolved for this candidate.
    fn threshold(&self, candidate: &TraceCandidate) -> Option<Duration>;
}

/// Scores candidates by response time against the per-transaction
/// threshold resolved by the configuration layer.
#[derive(Clone, Copy, Debug, Default)]
pub struct TransactionThresholdPolicy;

impl ScorePolicy for TransactionThresholdPolicy {
    fn score(&self, candidate: &TraceCandidate) -> Option<Duration> {
        Some(candidate.response_time)
    }

    fn threshold(&self, candidate: &TraceCandidate) -> Option<Duration> {
        Some(candidate.thresholds.transaction_threshold)
    }
}

/// Scores candidates by wall-clock duration against one fixed threshold.
#[derive(Clone, Copy, Debug)]
pub struct FixedDurationPolicy {
    threshold: Duration,
}

impl FixedDurationPolicy {
    /// Creates a policy with the given fixed threshold.
    pub fn new(threshold: Duration) -> Self {
        FixedDurationPolicy { threshold }
    }
}

impl ScorePolicy for FixedDurationPolicy {
    fn score(&self, candidate: &TraceCandidate) -> Option<Duration> {
        Some(candidate.legacy_duration)
    }

    fn threshold(&self, candidate: &TraceCandidate) -> Option<Duration> {
        let _ = candidate;
        Some(self.threshold)
    }
}

/// Restricts sampling to a configured set of key transactions, each with
/// its own threshold. Transactions outside the set are ineligible; a key
/// transaction configured without a threshold is rejected with a warning.
#[derive(Clone, Debug)]
pub struct KeyTransactionPolicy {
    targets: HashMap<String, Option<Duration>>,
}

impl KeyTransactionPolicy {
    /// Creates a policy for the given key transactions and thresholds.
    pub fn new(targets: HashMap<String, Option<Duration>>) -> Self {
        KeyTransactionPolicy { targets }
    }
}

impl ScorePolicy for KeyTransactionPolicy {
    fn score(&self, candidate: &TraceCandidate) -> Option<Duration> {
        if self.targets.contains_key(&candidate.blame_metric) {
            Some(candidate.response_time)
        } else {
            None
        }
    }

    fn threshold(&self, candidate: &TraceCandidate) -> Option<Duration> {
        match self.targets.get(&candidate.blame_metric) {
            Some(Some(threshold)) => Some(*threshold),
            Some(None) => {
                apm_warn!(
                    name: "KeyTransactionPolicy.MissingThreshold",
                    transaction = candidate.blame_metric.clone()
                );
                None
            }
            None => None,
        }
    }
}

/// A lock-free single-value slot ordered by score. Writers race with a
/// compare-exchange loop; the harvest thread takes the held value with a
/// swap.
///
/// The replace decision reads a separate score atomic, never the held
/// allocation: a concurrent `take` may free the pointer a writer just
/// loaded, so the held value must not be dereferenced on the offer path.
/// Ownership of an allocation transfers only through a successful
/// compare-exchange or swap.
pub(crate) struct AtomicSlot<T> {
    slot: AtomicPtr<T>,
    best_score: AtomicU64,
}

impl<T> AtomicSlot<T> {
    pub(crate) fn empty() -> Self {
        AtomicSlot {
            slot: AtomicPtr::new(ptr::null_mut()),
            best_score: AtomicU64::new(0),
        }
    }

    /// Installs `value` if the slot is empty or `score` beats the best
    /// score installed since the last `take`. Retries on contention; the
    /// losing value is dropped. Returns `true` if the value was installed.
    pub(crate) fn offer(&self, score: u64, value: T) -> bool {
        let new = Box::into_raw(Box::new(value));
        loop {
            let current = self.slot.load(Ordering::Acquire);
            if !current.is_null() && self.best_score.load(Ordering::Acquire) >= score {
                // Safety: `new` was never shared.
                drop(unsafe { Box::from_raw(new) });
                return false;
            }
            if self
                .slot
                .compare_exchange(current, new, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.best_score.fetch_max(score, Ordering::AcqRel);
                if !current.is_null() {
                    // Safety: the successful exchange transferred sole
                    // ownership of the previous allocation to this thread.
                    drop(unsafe { Box::from_raw(current) });
                }
                return true;
            }
        }
    }

    /// Takes the held value, leaving the slot empty and the score reset.
    pub(crate) fn take(&self) -> Option<T> {
        let previous = self.slot.swap(ptr::null_mut(), Ordering::AcqRel);
        self.best_score.store(0, Ordering::Release);
        if previous.is_null() {
            None
        } else {
            // Safety: the swap transferred sole ownership.
            Some(*unsafe { Box::from_raw(previous) })
        }
    }
}

impl<T> Drop for AtomicSlot<T> {
    fn drop(&mut self) {
        let previous = self.slot.swap(ptr::null_mut(), Ordering::AcqRel);
        if !previous.is_null() {
            drop(unsafe { Box::from_raw(previous) });
        }
    }
}

impl<T: Debug> Debug for AtomicSlot<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AtomicSlot").finish_non_exhaustive()
    }
}

// The slot owns its T behind a raw pointer; access is mediated by the
// atomic operations above.
unsafe impl<T: Send> Send for AtomicSlot<T> {}
unsafe impl<T: Send + Sync> Sync for AtomicSlot<T> {}

/// Collapses a score into the slot's ordering domain. Saturates far
/// beyond any plausible transaction duration.
fn score_nanos(score: Duration) -> u64 {
    u64::try_from(score.as_nanos()).unwrap_or(u64::MAX)
}

#[derive(Debug)]
struct ScoredCandidate {
    score: Duration,
    candidate: Arc<TraceCandidate>,
}

#[derive(Debug)]
struct ScoreMemory {
    last_scores: HashMap<String, Duration>,
    empty_harvests: u32,
}

/// The workhorse sampler: keeps at most one candidate between harvests,
/// the one with the highest score, and suppresses repeat captures of
/// transactions that are not getting slower.
///
/// The notice path is lock-free apart from a read lock on the score
/// memory; only the harvest thread writes the memory.
#[derive(Debug)]
pub struct ScoredEvictionSampler<P> {
    policy: P,
    slot: AtomicSlot<ScoredCandidate>,
    memory: RwLock<ScoreMemory>,
    top_n_capacity: usize,
    clear_after_empty_harvests: u32,
    builder: TraceBuilder,
}

impl<P: ScorePolicy> ScoredEvictionSampler<P> {
    /// Creates a sampler with the given policy and score-memory sizing.
    pub fn new(
        policy: P,
        top_n_capacity: usize,
        clear_after_empty_harvests: u32,
        builder: TraceBuilder,
    ) -> Self {
        ScoredEvictionSampler {
            policy,
            slot: AtomicSlot::empty(),
            memory: RwLock::new(ScoreMemory {
                last_scores: HashMap::new(),
                empty_harvests: 0,
            }),
            top_n_capacity,
            clear_after_empty_harvests,
            builder,
        }
    }

    /// The remembered score for a transaction name, for diagnostics.
    pub fn remembered_score(&self, transaction_name: &str) -> Option<Duration> {
        self.memory
            .read()
            .ok()?
            .last_scores
            .get(transaction_name)
            .copied()
    }
}

impl<P: ScorePolicy> TransactionSampler for ScoredEvictionSampler<P> {
    fn notice(&self, candidate: &Arc<TraceCandidate>) -> bool {
        let score = match self.policy.score(candidate) {
            Some(score) => score,
            None => return false,
        };
        let threshold = match self.policy.threshold(candidate) {
            Some(threshold) => threshold,
            None => {
                apm_debug!(
                    name: "ScoredEvictionSampler.NoThreshold",
                    transaction = candidate.blame_metric.clone()
                );
                return false;
            }
        };
        if score <= threshold {
            return false;
        }
        if let Ok(memory) = self.memory.read() {
            if let Some(last) = memory.last_scores.get(&candidate.blame_metric) {
                if score <= *last {
                    return false;
                }
            }
        }
        self.slot.offer(
            score_nanos(score),
            ScoredCandidate {
                score,
                candidate: Arc::clone(candidate),
            },
        )
    }

    fn harvest(&self, app_name: &str) -> Vec<TransactionTrace> {
        let retained = self.slot.take();
        let mut memory = match self.memory.write() {
            Ok(memory) => memory,
            Err(poisoned) => poisoned.into_inner(),
        };
        match retained {
            Some(retained) => {
                memory.empty_harvests = 0;
                if memory.last_scores.len() >= self.top_n_capacity
                    && !memory
                        .last_scores
                        .contains_key(&retained.candidate.blame_metric)
                {
                    // Full memory: the cheapest remembered transaction
                    // makes room for the new one.
                    let evict = memory
                        .last_scores
                        .iter()
                        .min_by_key(|(_, score)| **score)
                        .map(|(name, _)| name.clone());
                    if let Some(name) = evict {
                        memory.last_scores.remove(&name);
                    }
                }
                memory
                    .last_scores
                    .insert(retained.candidate.blame_metric.clone(), retained.score);
                drop(memory);
                apm_debug!(
                    name: "ScoredEvictionSampler.Harvest",
                    app_name = app_name.to_owned(),
                    transaction = retained.candidate.blame_metric.clone()
                );
                vec![self.builder.build(&retained.candidate)]
            }
            None => {
                memory.empty_harvests += 1;
                if memory.empty_harvests >= self.clear_after_empty_harvests {
                    memory.last_scores.clear();
                    memory.empty_harvests = 0;
                }
                Vec::new()
            }
        }
    }

    fn stop(&self) {
        self.slot.take();
        if let Ok(mut memory) = self.memory.write() {
            memory.last_scores.clear();
            memory.empty_harvests = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::super::candidate::{TraceCandidate, TraceThresholds};
    use super::{
        AtomicSlot, FixedDurationPolicy, KeyTransactionPolicy, ScoredEvictionSampler,
        TransactionSampler, TransactionThresholdPolicy,
    };
    use crate::trace::TraceBuilder;

    fn candidate(name: &str, millis: u64) -> Arc<TraceCandidate> {
        Arc::new(
            TraceCandidate::builder("app", name)
                .with_duration(Duration::from_millis(millis))
                .with_thresholds(TraceThresholds {
                    enabled: true,
                    transaction_threshold: Duration::from_millis(100),
                })
                .build(),
        )
    }

    fn sampler() -> ScoredEvictionSampler<TransactionThresholdPolicy> {
        ScoredEvictionSampler::new(
            TransactionThresholdPolicy,
            100,
            5,
            TraceBuilder::default(),
        )
    }

    #[test]
    fn slot_keeps_the_highest_score() {
        let slot = AtomicSlot::empty();
        assert!(slot.offer(5, 5u32));
        assert!(!slot.offer(3, 3u32));
        assert!(!slot.offer(5, 5u32));
        assert!(slot.offer(9, 9u32));
        assert_eq!(slot.take(), Some(9));
        assert_eq!(slot.take(), None);
        // The score resets with the slot.
        assert!(slot.offer(1, 1u32));
    }

    #[test]
    fn slot_offers_race_safely_with_takes() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let slot: Arc<AtomicSlot<Vec<u64>>> = Arc::new(AtomicSlot::empty());
        let running = Arc::new(AtomicBool::new(true));
        let writers: Vec<_> = (1u64..=3)
            .map(|tag| {
                let slot = Arc::clone(&slot);
                let running = Arc::clone(&running);
                std::thread::spawn(move || {
                    let mut score = tag;
                    while running.load(Ordering::Relaxed) {
                        slot.offer(score, vec![score; 64]);
                        score += 3;
                    }
                })
            })
            .collect();

        // Every taken payload must be the one its writer installed,
        // uniformly tagged, never a torn or reused allocation.
        for _ in 0..1_000 {
            if let Some(payload) = slot.take() {
                let first = payload[0];
                assert_eq!(payload.len(), 64);
                assert!(payload.iter().all(|value| *value == first));
            }
        }
        running.store(false, Ordering::Relaxed);
        for writer in writers {
            writer.join().unwrap();
        }
        if let Some(payload) = slot.take() {
            let first = payload[0];
            assert!(payload.iter().all(|value| *value == first));
        }
    }

    #[test]
    fn below_threshold_candidates_are_rejected() {
        let sampler = sampler();
        assert!(!sampler.notice(&candidate("WebTransaction/fast", 100)));
        assert!(sampler.harvest("app").is_empty());
    }

    #[test]
    fn slower_candidate_evicts_the_held_one() {
        let sampler = sampler();
        assert!(sampler.notice(&candidate("WebTransaction/a", 300)));
        assert!(!sampler.notice(&candidate("WebTransaction/b", 200)));
        assert!(sampler.notice(&candidate("WebTransaction/c", 400)));
        let traces = sampler.harvest("app");
        assert_eq!(traces.len(), 1);
        assert_eq!(traces[0].transaction_name, "WebTransaction/c");
        // Nothing retained until the next acceptance.
        assert!(sampler.harvest("app").is_empty());
    }

    #[test]
    fn repeat_captures_need_a_higher_score() {
        let sampler = sampler();
        assert!(sampler.notice(&candidate("WebTransaction/a", 300)));
        assert_eq!(sampler.harvest("app").len(), 1);
        // Not slower than the remembered 300ms capture.
        assert!(!sampler.notice(&candidate("WebTransaction/a", 300)));
        assert!(!sampler.notice(&candidate("WebTransaction/a", 250)));
        assert!(sampler.notice(&candidate("WebTransaction/a", 350)));
    }

    #[test]
    fn score_memory_clears_after_consecutive_empty_harvests() {
        let sampler = ScoredEvictionSampler::new(
            TransactionThresholdPolicy,
            100,
            2,
            TraceBuilder::default(),
        );
        assert!(sampler.notice(&candidate("WebTransaction/a", 300)));
        sampler.harvest("app");
        assert!(sampler.remembered_score("WebTransaction/a").is_some());
        sampler.harvest("app");
        sampler.harvest("app");
        assert!(sampler.remembered_score("WebTransaction/a").is_none());
        // Forgotten, so the same score is captured again.
        assert!(sampler.notice(&candidate("WebTransaction/a", 300)));
    }

    #[test]
    fn score_memory_evicts_cheapest_entry_at_capacity() {
        let sampler = ScoredEvictionSampler::new(
            TransactionThresholdPolicy,
            2,
            5,
            TraceBuilder::default(),
        );
        for (name, millis) in [
            ("WebTransaction/a", 200),
            ("WebTransaction/b", 300),
            ("WebTransaction/c", 400),
        ] {
            assert!(sampler.notice(&candidate(name, millis)));
            sampler.harvest("app");
        }
        assert!(sampler.remembered_score("WebTransaction/a").is_none());
        assert!(sampler.remembered_score("WebTransaction/b").is_some());
        assert!(sampler.remembered_score("WebTransaction/c").is_some());
    }

    #[test]
    fn stop_discards_retained_state() {
        let sampler = sampler();
        assert!(sampler.notice(&candidate("WebTransaction/a", 300)));
        sampler.stop();
        assert!(sampler.harvest("app").is_empty());
    }

    #[test]
    fn fixed_duration_policy_uses_legacy_duration() {
        let sampler = ScoredEvictionSampler::new(
            FixedDurationPolicy::new(Duration::from_millis(500)),
            100,
            5,
            TraceBuilder::default(),
        );
        assert!(!sampler.notice(&candidate("WebTransaction/a", 400)));
        assert!(sampler.notice(&candidate("WebTransaction/a", 600)));
    }

    #[test]
    fn key_transaction_policy_ignores_unlisted_transactions() {
        let mut targets = std::collections::HashMap::new();
        targets.insert(
            "WebTransaction/key".to_owned(),
            Some(Duration::from_millis(100)),
        );
        targets.insert("WebTransaction/broken".to_owned(), None);
        let sampler = ScoredEvictionSampler::new(
            KeyTransactionPolicy::new(targets),
            100,
            5,
            TraceBuilder::default(),
        );
        assert!(!sampler.notice(&candidate("WebTransaction/other", 5_000)));
        assert!(!sampler.notice(&candidate("WebTransaction/broken", 5_000)));
        assert!(sampler.notice(&candidate("WebTransaction/key", 200)));
    }
}
