//! Closed-loop tuning of the sample period.

use std::time::Duration;

/// Fastest the profiler is ever allowed to sample.
pub(crate) const MIN_SAMPLE_PERIOD: Duration = Duration::from_millis(100);
/// Slowest the profiler degrades to under load.
pub(crate) const MAX_SAMPLE_PERIOD: Duration = Duration::from_millis(6400);
/// A tick may spend at most 1/50th of the period it runs in, about 2% of
/// one core.
const TARGET_UTILIZATION_DIVISOR: u32 = 50;

/// Keeps profiling overhead bounded by stretching or shrinking the sample
/// period based on what recent ticks actually cost.
///
/// The period only ever doubles or halves, and backs off eagerly while
/// recovering conservatively: one expensive tick doubles the period, but
/// it takes a tick cheaper than a quarter of the current period to halve
/// it again.
#[derive(Debug, Default)]
pub struct AdaptiveRateController {
    period: Option<Duration>,
}

impl AdaptiveRateController {
    /// Creates a controller with no period established yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Establishes the starting period, clamped to the allowed range.
    pub fn initialize(&mut self, requested: Duration) -> Duration {
        let period = requested.clamp(MIN_SAMPLE_PERIOD, MAX_SAMPLE_PERIOD);
        self.period = Some(period);
        period
    }

    /// Adjusts the period after a tick whose cost demands `required` of
    /// spacing, and returns the period to use for the next tick.
    pub fn observe(&mut self, required: Duration) -> Duration {
        let current = match self.period {
            Some(period) => period,
            None => return self.initialize(required),
        };
        let adjusted = if required > current {
            current * 2
        } else if required <= current / 4 {
            current / 2
        } else {
            current
        };
        let adjusted = adjusted.clamp(MIN_SAMPLE_PERIOD, MAX_SAMPLE_PERIOD);
        self.period = Some(adjusted);
        adjusted
    }

    /// The period currently in effect, if one was established.
    pub fn current_period(&self) -> Option<Duration> {
        self.period
    }

    /// The period a tick of the given wall-clock cost demands, spreading
    /// the target utilization over the available cores.
    pub fn required_period(tick_cost: Duration) -> Duration {
        tick_cost * TARGET_UTILIZATION_DIVISOR / (num_cpus::get().max(1) as u32)
    }
}
