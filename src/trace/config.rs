//! Trace-engine configuration.

use std::env;
use std::str::FromStr;

/// Number of transaction names the score memory remembers per sampler.
pub(crate) const DEFAULT_TOP_N_CAPACITY: usize = 100;
/// Consecutive empty harvests before the score memory is cleared.
pub(crate) const DEFAULT_MEMORY_CLEAR_HARVESTS: u32 = 5;
/// Traces captured unconditionally at agent start.
pub(crate) const DEFAULT_RANDOM_CAPTURE_LIMIT: usize = 5;
/// Synthetic transactions held between harvests.
pub(crate) const DEFAULT_SYNTHETICS_PENDING_LIMIT: usize = 20;
/// Stack frames kept per trace segment.
pub(crate) const DEFAULT_MAX_STACK_TRACE_FRAMES: usize = 30;

/// Maximum number of transaction names remembered by each scored sampler.
pub(crate) const APM_TT_TOP_N_CAPACITY: &str = "APM_TT_TOP_N_CAPACITY";
/// Consecutive empty harvests before score memory is cleared.
pub(crate) const APM_TT_MEMORY_CLEAR_HARVESTS: &str = "APM_TT_MEMORY_CLEAR_HARVESTS";
/// Unconditional captures granted to the startup sampler.
pub(crate) const APM_TT_RANDOM_CAPTURE_LIMIT: &str = "APM_TT_RANDOM_CAPTURE_LIMIT";
/// Pending cap of the synthetics sampler.
pub(crate) const APM_TT_SYNTHETICS_PENDING_LIMIT: &str = "APM_TT_SYNTHETICS_PENDING_LIMIT";
/// Stack frames kept per trace segment.
pub(crate) const APM_TT_MAX_STACK_FRAMES: &str = "APM_TT_MAX_STACK_FRAMES";

/// Configuration of the [`TransactionTraceService`] and the samplers it
/// builds.
///
/// [`TransactionTraceService`]: crate::trace::TransactionTraceService
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub struct TraceConfig {
    /// Route candidates to per-application samplers instead of the fixed
    /// request/background pair.
    pub auto_app_naming: bool,
    /// Transaction names each scored sampler remembers.
    pub top_n_capacity: usize,
    /// Empty harvests before the score memory is cleared.
    pub clear_after_empty_harvests: u32,
    /// Unconditional captures at agent start.
    pub random_capture_limit: usize,
    /// Synthetic transactions held between harvests.
    pub synthetics_pending_limit: usize,
    /// Stack frames kept per trace segment.
    pub max_stack_trace_frames: usize,
}

impl Default for TraceConfig {
    fn default() -> Self {
        TraceConfigBuilder::default().build()
    }
}

impl TraceConfig {
    /// Returns a builder seeded with the defaults.
    pub fn builder() -> TraceConfigBuilder {
        TraceConfigBuilder::default()
    }
}

/// Builder for [`TraceConfig`], with environment-variable overrides.
#[derive(Clone, Copy, Debug)]
pub struct TraceConfigBuilder {
    auto_app_naming: bool,
    top_n_capacity: usize,
    clear_after_empty_harvests: u32,
    random_capture_limit: usize,
    synthetics_pending_limit: usize,
    max_stack_trace_frames: usize,
}

impl Default for TraceConfigBuilder {
    /// Create a builder with the default values, then apply any
    /// environment-variable overrides. Unparsable values are ignored.
    fn default() -> Self {
        TraceConfigBuilder {
            auto_app_naming: false,
            top_n_capacity: DEFAULT_TOP_N_CAPACITY,
            clear_after_empty_harvests: DEFAULT_MEMORY_CLEAR_HARVESTS,
            random_capture_limit: DEFAULT_RANDOM_CAPTURE_LIMIT,
            synthetics_pending_limit: DEFAULT_SYNTHETICS_PENDING_LIMIT,
            max_stack_trace_frames: DEFAULT_MAX_STACK_TRACE_FRAMES,
        }
        .init_from_env_vars()
    }
}

impl TraceConfigBuilder {
    fn init_from_env_vars(mut self) -> Self {
        if let Some(value) = parse_env::<usize>(APM_TT_TOP_N_CAPACITY) {
            self.top_n_capacity = value;
        }
        if let Some(value) = parse_env::<u32>(APM_TT_MEMORY_CLEAR_HARVESTS) {
            self.clear_after_empty_harvests = value;
        }
        if let Some(value) = parse_env::<usize>(APM_TT_RANDOM_CAPTURE_LIMIT) {
            self.random_capture_limit = value;
        }
        if let Some(value) = parse_env::<usize>(APM_TT_SYNTHETICS_PENDING_LIMIT) {
            self.synthetics_pending_limit = value;
        }
        if let Some(value) = parse_env::<usize>(APM_TT_MAX_STACK_FRAMES) {
            self.max_stack_trace_frames = value;
        }
        self
    }

    /// Route candidates to per-application samplers.
    pub fn with_auto_app_naming(mut self, enabled: bool) -> Self {
        self.auto_app_naming = enabled;
        self
    }

    /// Sets how many transaction names each scored sampler remembers.
    pub fn with_top_n_capacity(mut self, capacity: usize) -> Self {
        self.top_n_capacity = capacity;
        self
    }

    /// Sets how many empty harvests clear the score memory.
    pub fn with_clear_after_empty_harvests(mut self, harvests: u32) -> Self {
        self.clear_after_empty_harvests = harvests;
        self
    }

    /// Sets the startup sampler's capture budget.
    pub fn with_random_capture_limit(mut self, limit: usize) -> Self {
        self.random_capture_limit = limit;
        self
    }

    /// Sets the synthetics pending cap.
    pub fn with_synthetics_pending_limit(mut self, limit: usize) -> Self {
        self.synthetics_pending_limit = limit;
        self
    }

    /// Sets how many stack frames each trace segment keeps.
    pub fn with_max_stack_trace_frames(mut self, frames: usize) -> Self {
        self.max_stack_trace_frames = frames;
        self
    }

    /// Builds the configuration.
    pub fn build(self) -> TraceConfig {
        TraceConfig {
            auto_app_naming: self.auto_app_naming,
            top_n_capacity: self.top_n_capacity,
            clear_after_empty_harvests: self.clear_after_empty_harvests,
            random_capture_limit: self.random_capture_limit,
            synthetics_pending_limit: self.synthetics_pending_limit,
            max_stack_trace_frames: self.max_stack_trace_frames,
        }
    }
}

fn parse_env<T: FromStr>(name: &str) -> Option<T> {
    let raw = env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            apm_warn!(
                name: "TraceConfig.InvalidEnvValue",
                variable = name.to_owned(),
                value = raw.clone()
            );
            None
        }
    }
}
