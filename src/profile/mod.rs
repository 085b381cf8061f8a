//! # Profiler Engine
//!
//! Runs bounded stack-profiling sessions on a dedicated scheduler thread.
//! A session periodically captures stack snapshots from a
//! [`StackSnapshotSource`], folds them into per-thread-group call trees
//! through the [`CallTreeAggregator`], and tunes its own sample period with
//! the [`AdaptiveRateController`] so profiling overhead stays bounded. When
//! the session ends, the aggregated [`ProfileReport`] is handed to the
//! configured [`ProfileExporter`].
//!
//! [`ProfileExporter`]: crate::export::ProfileExporter

mod aggregator;
mod correlator;
mod method;
mod parameters;
mod rate;
mod session;
mod tree;

pub use aggregator::{CallTreeAggregator, ProfileReport, StackCapture};
pub use correlator::ThreadTransactionCorrelator;
pub use method::{MethodInterner, ProfiledMethod, StackFrame};
pub use parameters::{CommandError, ProfilerParameters, StartCommand, StopCommand};
pub use rate::AdaptiveRateController;
pub use session::{
    CaptureError, ProfileSession, ProfilerError, ProfilerService, SessionState,
    StackSnapshotSource,
};
pub use tree::{ProfileSegment, ProfileTree};
