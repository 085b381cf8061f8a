//! Transport seams.
//!
//! The engine hands retained data to an external transport collaborator at
//! harvest boundaries through the [`TraceExporter`] and [`ProfileExporter`]
//! traits. It never serializes or transmits anything itself, and export
//! failures never abort a harvest cycle: [`ExportError::IgnoreSilently`]
//! is swallowed without a trace, anything else is logged and dropped.
//!
//! The in-memory implementations exist for testing and debugging; they are
//! the observation points used throughout this crate's test suite.

use std::fmt;
use std::sync::{Arc, Mutex};

use futures_util::future::BoxFuture;
use thiserror::Error;

use crate::error::{EngineError, EngineResult};
use crate::profile::ProfileReport;
use crate::trace::TransactionTrace;

/// Errors an exporter may report back to the harvest loop.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ExportError {
    /// The backend rejected the payload in a way that must not be logged
    /// (for example a deliberate server-side discard). The harvest loop
    /// drops the batch without a diagnostic.
    #[error("export discarded by the backend")]
    IgnoreSilently,

    /// Transport-level failure. The harvest loop logs and drops the batch;
    /// there is no retry for retention data.
    #[error("transport failure: {0}")]
    Transport(String),
}

/// Result of one export call.
pub type ExportResult = Result<(), ExportError>;

/// Receives batches of retained [`TransactionTrace`]s at harvest boundaries.
pub trait TraceExporter: Send + Sync + fmt::Debug {
    /// Exports a non-empty batch of traces. Called from the harvest thread,
    /// which drives the returned future to completion before the next
    /// harvest begins.
    fn export(&mut self, batch: Vec<TransactionTrace>) -> BoxFuture<'static, ExportResult>;

    /// Shuts down the exporter, releasing any held resources.
    fn shutdown(&mut self) {}
}

/// Receives finished [`ProfileReport`]s when a profiling session completes.
pub trait ProfileExporter: Send + Sync + fmt::Debug {
    /// Exports the reports produced by one completed session.
    fn export(&mut self, batch: Vec<ProfileReport>) -> BoxFuture<'static, ExportResult>;

    /// Shuts down the exporter, releasing any held resources.
    fn shutdown(&mut self) {}
}

/// A [`TraceExporter`] that stores exported traces in memory.
#[derive(Clone, Debug, Default)]
pub struct InMemoryTraceExporter {
    traces: Arc<Mutex<Vec<TransactionTrace>>>,
}

impl InMemoryTraceExporter {
    /// Creates a new empty exporter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of every trace exported so far.
    pub fn exported_traces(&self) -> EngineResult<Vec<TransactionTrace>> {
        self.traces
            .lock()
            .map(|guard| guard.clone())
            .map_err(EngineError::from)
    }

    /// Clears the internal storage.
    pub fn reset(&self) {
        let _ = self.traces.lock().map(|mut guard| guard.clear());
    }
}

impl TraceExporter for InMemoryTraceExporter {
    fn export(&mut self, mut batch: Vec<TransactionTrace>) -> BoxFuture<'static, ExportResult> {
        let result = self
            .traces
            .lock()
            .map(|mut guard| guard.append(&mut batch))
            .map_err(|err| ExportError::Transport(format!("failed to lock traces: {err}")));
        Box::pin(std::future::ready(result))
    }

    fn shutdown(&mut self) {
        self.reset();
    }
}

/// A [`ProfileExporter`] that stores exported reports in memory.
#[derive(Clone, Debug, Default)]
pub struct InMemoryProfileExporter {
    reports: Arc<Mutex<Vec<ProfileReport>>>,
}

impl InMemoryProfileExporter {
    /// Creates a new empty exporter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of every report exported so far.
    pub fn exported_reports(&self) -> EngineResult<Vec<ProfileReport>> {
        self.reports
            .lock()
            .map(|guard| guard.clone())
            .map_err(EngineError::from)
    }

    /// Clears the internal storage.
    pub fn reset(&self) {
        let _ = self.reports.lock().map(|mut guard| guard.clear());
    }
}

impl ProfileExporter for InMemoryProfileExporter {
    fn export(&mut self, mut batch: Vec<ProfileReport>) -> BoxFuture<'static, ExportResult> {
        let result = self
            .reports
            .lock()
            .map(|mut guard| guard.append(&mut batch))
            .map_err(|err| ExportError::Transport(format!("failed to lock reports: {err}")));
        Box::pin(std::future::ready(result))
    }

    fn shutdown(&mut self) {
        self.reset();
    }
}

/// A [`TraceExporter`] that discards everything it receives.
#[derive(Clone, Debug, Default)]
pub struct NoopTraceExporter;

impl TraceExporter for NoopTraceExporter {
    fn export(&mut self, _batch: Vec<TransactionTrace>) -> BoxFuture<'static, ExportResult> {
        Box::pin(std::future::ready(Ok(())))
    }
}

/// A [`ProfileExporter`] that discards everything it receives.
#[derive(Clone, Debug, Default)]
pub struct NoopProfileExporter;

impl ProfileExporter for NoopProfileExporter {
    fn export(&mut self, _batch: Vec<ProfileReport>) -> BoxFuture<'static, ExportResult> {
        Box::pin(std::future::ready(Ok(())))
    }
}
