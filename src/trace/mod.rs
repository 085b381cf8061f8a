//! # Trace Sampling Engine
//!
//! Selects, among all completed transactions, which ones deserve a full
//! execution-trace capture. Finished transactions are offered as
//! [`TraceCandidate`]s to a chain of samplers held by the
//! [`TransactionTraceService`]; the first sampler that accepts a candidate
//! stops the chain. At each harvest the retained candidates are converted
//! into immutable [`TransactionTrace`] trees by the [`TraceBuilder`] and
//! handed to the configured [`TraceExporter`].
//!
//! [`TraceExporter`]: crate::export::TraceExporter

mod builder;
mod candidate;
mod config;
mod sampler;
mod segment;
mod service;
mod single_shot;
mod span;
mod synthetics;

pub use builder::TraceBuilder;
pub use candidate::{
    DispatcherCategory, TraceCandidate, TraceCandidateBuilder, TraceThresholds,
};
pub use config::{TraceConfig, TraceConfigBuilder};
pub use sampler::{
    FixedDurationPolicy, KeyTransactionPolicy, ScorePolicy, ScoredEvictionSampler,
    TransactionSampler, TransactionThresholdPolicy,
};
pub use segment::{TransactionSegment, TransactionTrace};
pub use service::{TransactionTraceService, TransactionTraceServiceBuilder};
pub use single_shot::SingleShotSampler;
pub use span::{ExecutionSpan, Value};
pub use synthetics::SyntheticsSampler;
