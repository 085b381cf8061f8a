//! # APM Sampling Engine
//!
//! This crate implements the retention core of an application performance
//! monitoring agent: it decides, under a strict overhead budget, which
//! completed transactions deserve a full execution-trace capture and which
//! stack-sample snapshots are worth keeping, and assembles the retained
//! data into immutable tree snapshots for an external transport layer.
//!
//! Two engines cooperate:
//!
//! * The [`trace`] module selects slow, key, synthetic or randomly captured
//!   transactions through a chain of samplers and builds
//!   [`trace::TransactionTrace`] trees out of the winners at each harvest.
//! * The [`profile`] module schedules periodic stack captures over a bounded
//!   session, tunes the sample period with a closed-loop rate controller and
//!   aggregates the captures into deduplicated call trees.
//!
//! Producers (application worker threads) only ever hit lock-free or
//! read-locked paths; harvesting and session scheduling run on dedicated
//! threads. Retained data is handed to [`export`] collaborators at harvest
//! boundaries; this crate never serializes or transmits anything itself.
#![warn(
    future_incompatible,
    missing_debug_implementations,
    missing_docs,
    nonstandard_style,
    rust_2018_idioms,
    unreachable_pub,
    unused
)]
#![cfg_attr(docsrs, feature(doc_cfg), deny(rustdoc::broken_intra_doc_links))]
#![cfg_attr(test, deny(warnings))]

pub(crate) mod bounded_queue;
pub mod error;
pub mod export;
#[macro_use]
mod internal_logging;
pub mod profile;
pub mod trace;

#[cfg(feature = "internal-logs")]
#[doc(hidden)]
pub mod _private {
    pub use tracing::{debug, error, info, warn};
}

pub use error::{EngineError, EngineResult};
