//! Profiling sessions and the service that schedules them.

use std::collections::HashSet;
use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use futures_executor::block_on;
use thiserror::Error;

use super::aggregator::{CallTreeAggregator, StackCapture, DEFAULT_MAX_CALL_SITES};
use super::correlator::ThreadTransactionCorrelator;
use super::parameters::{CommandError, ProfilerParameters, StartCommand, StopCommand};
use super::rate::AdaptiveRateController;
use crate::export::{ExportError, NoopProfileExporter, ProfileExporter};

/// Stack snapshots could not be taken this tick. The tick is skipped and
/// the session carries on.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("stack capture failed: {0}")]
pub struct CaptureError(pub String);

/// Provides stack snapshots of the process's threads.
///
/// Implemented outside this crate by whatever can walk the runtime's
/// stacks. Called from the session's scheduler thread, once per tick.
pub trait StackSnapshotSource: Send + Sync + Debug {
    /// Captures one snapshot of every thread of interest.
    fn capture(&self) -> Result<Vec<StackCapture>, CaptureError>;

    /// OS ids of threads currently running a transaction. Used to evict
    /// idle per-thread state between ticks.
    fn active_transaction_threads(&self) -> HashSet<u64> {
        HashSet::new()
    }
}

/// Lifecycle of a [`ProfileSession`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    /// Built, scheduler thread not yet running.
    Created = 0,
    /// Taking samples.
    Running = 1,
    /// Stop requested, final report pending.
    Stopping = 2,
    /// Finished; the report was delivered or discarded.
    Done = 3,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SessionState::Created,
            1 => SessionState::Running,
            2 => SessionState::Stopping,
            _ => SessionState::Done,
        }
    }
}

enum SessionMessage {
    Stop { report: bool },
}

/// One bounded profiling session.
///
/// Owns the aggregator its ticks fold into and the control channel of its
/// scheduler thread. Sessions are single-use: once done they never run
/// again.
#[derive(Debug)]
pub struct ProfileSession {
    parameters: ProfilerParameters,
    state: AtomicU8,
    stop_sent: AtomicBool,
    aggregator: Mutex<CallTreeAggregator>,
    correlator: Option<Arc<ThreadTransactionCorrelator>>,
    control: Mutex<Option<SyncSender<SessionMessage>>>,
    started_at: SystemTime,
}

impl ProfileSession {
    fn new(parameters: ProfilerParameters) -> Self {
        let correlator = parameters
            .key_transaction
            .as_ref()
            .map(|target| Arc::new(ThreadTransactionCorrelator::new(target.clone())));
        ProfileSession {
            parameters,
            state: AtomicU8::new(SessionState::Created as u8),
            stop_sent: AtomicBool::new(false),
            aggregator: Mutex::new(CallTreeAggregator::new()),
            correlator,
            control: Mutex::new(None),
            started_at: SystemTime::now(),
        }
    }

    /// The session's validated parameters.
    pub fn parameters(&self) -> &ProfilerParameters {
        &self.parameters
    }

    /// The backend-assigned id of this session.
    pub fn profile_id(&self) -> i64 {
        self.parameters.profile_id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: SessionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Asks the scheduler thread to end the session. Idempotent; the
    /// thread is signalled, never joined, so a stuck tick cannot block the
    /// caller. With `report` false the aggregated data is discarded.
    pub fn stop(&self, report: bool) {
        if self
            .stop_sent
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        // Only a running session moves to Stopping. A session that already
        // completed on its own stays Done.
        if self
            .state
            .compare_exchange(
                SessionState::Running as u8,
                SessionState::Stopping as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return;
        }
        if let Ok(control) = self.control.lock() {
            if let Some(sender) = control.as_ref() {
                let _ = sender.try_send(SessionMessage::Stop { report });
            }
        }
    }

    fn run_tick(&self, source: &dyn StackSnapshotSource) {
        if let Some(correlator) = &self.correlator {
            correlator.evict_idle(&source.active_transaction_threads());
        }
        let captures = match source.capture() {
            Ok(captures) => captures,
            Err(error) => {
                apm_warn!(
                    name: "ProfileSession.CaptureFailed",
                    profile_id = self.profile_id(),
                    error = error.to_string()
                );
                return;
            }
        };
        let mut aggregator = match self.aggregator.lock() {
            Ok(aggregator) => aggregator,
            Err(poisoned) => poisoned.into_inner(),
        };
        aggregator.begin_sample();
        for capture in captures {
            if !self.parameters.accepts(
                capture.runnable,
                capture.request_thread,
                capture.agent_thread,
            ) {
                continue;
            }
            match &self.correlator {
                Some(correlator) => correlator.offer(capture),
                None => aggregator.fold(&capture),
            }
        }
    }

    /// Folds captures released by transaction attribution into the
    /// session's trees.
    fn fold_released(&self, released: Vec<StackCapture>) {
        if released.is_empty() {
            return;
        }
        let mut aggregator = match self.aggregator.lock() {
            Ok(aggregator) => aggregator,
            Err(poisoned) => poisoned.into_inner(),
        };
        for capture in released {
            aggregator.fold(&capture);
        }
    }

    fn take_report(&self) -> super::ProfileReport {
        let mut aggregator = match self.aggregator.lock() {
            Ok(aggregator) => aggregator,
            Err(poisoned) => poisoned.into_inner(),
        };
        let aggregator = std::mem::take(&mut *aggregator);
        build_report(aggregator, &self.parameters, self.started_at)
    }
}

fn build_report(
    mut aggregator: CallTreeAggregator,
    parameters: &ProfilerParameters,
    started_at: SystemTime,
) -> super::ProfileReport {
    aggregator.trim_to(DEFAULT_MAX_CALL_SITES);
    let start_ms = millis_since_epoch(started_at);
    let end_ms = millis_since_epoch(SystemTime::now());
    aggregator.into_report(parameters.profile_id, start_ms, end_ms)
}

fn millis_since_epoch(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Errors of the profiler control surface.
#[derive(Error, Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum ProfilerError {
    /// A session is already running; only one runs at a time.
    #[error("profile session {0} is already running")]
    SessionActive(i64),

    /// A stop arrived with no session running.
    #[error("no profile session is running")]
    NoActiveSession,

    /// A stop named a session other than the running one.
    #[error("profile session {requested} is not running (active: {active})")]
    UnknownProfileId {
        /// The id the stop command named.
        requested: i64,
        /// The id of the session actually running.
        active: i64,
    },

    /// The backend command could not be validated.
    #[error(transparent)]
    Command(#[from] CommandError),

    /// An unexpected internal failure, including poisoned locks.
    #[error("internal failure: {0}")]
    Internal(String),
}

#[derive(Debug)]
struct ServiceInner {
    source: Arc<dyn StackSnapshotSource>,
    exporter: Mutex<Box<dyn ProfileExporter>>,
    active: Mutex<Option<Arc<ProfileSession>>>,
}

impl ServiceInner {
    fn finish_session(&self, session: &Arc<ProfileSession>, report: bool) {
        if report {
            let report = session.take_report();
            let profile_id = report.profile_id;
            if let Ok(mut exporter) = self.exporter.lock() {
                match block_on(exporter.export(vec![report])) {
                    Ok(()) | Err(ExportError::IgnoreSilently) => {}
                    Err(error) => {
                        apm_warn!(
                            name: "ProfilerService.ExportFailed",
                            profile_id = profile_id,
                            error = error.to_string()
                        );
                    }
                }
            }
        }
        session.set_state(SessionState::Done);
        if let Ok(mut active) = self.active.lock() {
            if let Some(current) = active.as_ref() {
                if Arc::ptr_eq(current, session) {
                    *active = None;
                }
            }
        }
    }
}

/// Runs at most one [`ProfileSession`] at a time on a dedicated scheduler
/// thread, driven by backend start and stop commands.
#[derive(Clone, Debug)]
pub struct ProfilerService {
    inner: Arc<ServiceInner>,
}

impl ProfilerService {
    /// Creates a service sampling from `source` and discarding reports.
    pub fn new(source: Arc<dyn StackSnapshotSource>) -> Self {
        Self::with_exporter(source, NoopProfileExporter)
    }

    /// Creates a service delivering finished reports to `exporter`.
    pub fn with_exporter<E: ProfileExporter + 'static>(
        source: Arc<dyn StackSnapshotSource>,
        exporter: E,
    ) -> Self {
        ProfilerService {
            inner: Arc::new(ServiceInner {
                source,
                exporter: Mutex::new(Box::new(exporter)),
                active: Mutex::new(None),
            }),
        }
    }

    /// Starts a session with the given parameters. Fails while another
    /// session is running.
    pub fn start_profiler(
        &self,
        parameters: ProfilerParameters,
    ) -> Result<Arc<ProfileSession>, ProfilerError> {
        let mut active = self
            .inner
            .active
            .lock()
            .map_err(|err| ProfilerError::Internal(err.to_string()))?;
        if let Some(current) = active.as_ref() {
            apm_warn!(
                name: "ProfilerService.SessionAlreadyActive",
                active = current.profile_id(),
                rejected = parameters.profile_id
            );
            return Err(ProfilerError::SessionActive(current.profile_id()));
        }

        let session = Arc::new(ProfileSession::new(parameters));
        let (sender, receiver) = mpsc::sync_channel(4);
        if let Ok(mut control) = session.control.lock() {
            *control = Some(sender);
        }
        session.set_state(SessionState::Running);
        *active = Some(Arc::clone(&session));
        drop(active);

        let inner = Arc::clone(&self.inner);
        let thread_session = Arc::clone(&session);
        let result = thread::Builder::new()
            .name(format!("APM.Profiler.{}", session.profile_id()))
            .spawn(move || {
                run_session(&thread_session, &inner, receiver);
            });
        if let Err(err) = result {
            self.inner.finish_session(&session, false);
            return Err(ProfilerError::Internal(format!(
                "failed to spawn scheduler thread: {err}"
            )));
        }
        apm_debug!(
            name: "ProfilerService.SessionStarted",
            profile_id = session.profile_id()
        );
        Ok(session)
    }

    /// Stops the running session by id. With `report` false the
    /// aggregated data is discarded.
    pub fn stop_profiler(&self, profile_id: i64, report: bool) -> Result<(), ProfilerError> {
        let active = self
            .inner
            .active
            .lock()
            .map_err(|err| ProfilerError::Internal(err.to_string()))?;
        let session = active.as_ref().ok_or(ProfilerError::NoActiveSession)?;
        if session.profile_id() != profile_id {
            return Err(ProfilerError::UnknownProfileId {
                requested: profile_id,
                active: session.profile_id(),
            });
        }
        let session = Arc::clone(session);
        drop(active);
        session.stop(report);
        Ok(())
    }

    /// Validates and executes a backend start command.
    pub fn handle_start_command(
        &self,
        command: &StartCommand,
    ) -> Result<Arc<ProfileSession>, ProfilerError> {
        let parameters = ProfilerParameters::from_start_command(command)?;
        self.start_profiler(parameters)
    }

    /// Validates and executes a backend stop command.
    pub fn handle_stop_command(&self, command: &StopCommand) -> Result<(), ProfilerError> {
        let profile_id = command
            .profile_id
            .ok_or(CommandError::MissingProfileId)?;
        self.stop_profiler(profile_id, command.report_data)
    }

    /// Resolves transaction attribution for sessions restricted to a key
    /// transaction. Captures attributed to the target transaction are
    /// folded into the running session's trees.
    pub fn transaction_finished(
        &self,
        thread_id: u64,
        transaction_name: &str,
        started_at: SystemTime,
        ended_at: SystemTime,
    ) {
        let session = match self.inner.active.lock() {
            Ok(active) => active.as_ref().map(Arc::clone),
            Err(_) => None,
        };
        let session = match session {
            Some(session) => session,
            None => return,
        };
        if let Some(correlator) = &session.correlator {
            let released =
                correlator.transaction_finished(thread_id, transaction_name, started_at, ended_at);
            session.fold_released(released);
        }
    }

    /// Whether a session is currently running.
    pub fn is_session_active(&self) -> bool {
        self.inner
            .active
            .lock()
            .map(|active| active.is_some())
            .unwrap_or(false)
    }

    /// The id of the running session, if any.
    pub fn active_profile_id(&self) -> Option<i64> {
        self.inner
            .active
            .lock()
            .ok()
            .and_then(|active| active.as_ref().map(|session| session.profile_id()))
    }
}

fn run_session(
    session: &Arc<ProfileSession>,
    inner: &Arc<ServiceInner>,
    receiver: mpsc::Receiver<SessionMessage>,
) {
    let parameters = session.parameters().clone();
    let mut rate = AdaptiveRateController::new();
    let mut period = rate.initialize(parameters.sample_period);

    // Degenerate sessions take exactly one sample.
    if parameters.sample_period >= parameters.duration {
        session.run_tick(inner.source.as_ref());
        inner.finish_session(session, true);
        return;
    }

    let deadline = Instant::now() + parameters.duration;
    let mut next_tick = Instant::now() + period;
    loop {
        let now = Instant::now();
        if now >= deadline {
            inner.finish_session(session, true);
            return;
        }
        let wait = next_tick.min(deadline).saturating_duration_since(now);
        match receiver.recv_timeout(wait) {
            Ok(SessionMessage::Stop { report }) => {
                inner.finish_session(session, report);
                return;
            }
            Err(RecvTimeoutError::Disconnected) => {
                inner.finish_session(session, true);
                return;
            }
            Err(RecvTimeoutError::Timeout) => {
                if Instant::now() >= deadline {
                    inner.finish_session(session, true);
                    return;
                }
                let tick_started = Instant::now();
                session.run_tick(inner.source.as_ref());
                let tick_cost = tick_started.elapsed();
                period = rate.observe(AdaptiveRateController::required_period(tick_cost));
                next_tick = tick_started + period;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::{Duration, SystemTime};

    use super::super::aggregator::StackCapture;
    use super::super::method::StackFrame;
    use super::super::parameters::{ProfilerParameters, StartCommand, StopCommand};
    use super::{
        CaptureError, ProfilerError, ProfilerService, SessionState, StackSnapshotSource,
    };
    use crate::export::InMemoryProfileExporter;

    #[derive(Debug, Default)]
    struct FixedSource {
        captures: AtomicUsize,
    }

    impl StackSnapshotSource for FixedSource {
        fn capture(&self) -> Result<Vec<StackCapture>, CaptureError> {
            self.captures.fetch_add(1, Ordering::Relaxed);
            let frames = vec![
                StackFrame::new("Main", "run", 1),
                StackFrame::new("Worker", "poll", 2),
            ];
            Ok(vec![StackCapture::new(7, "worker-pool", frames)])
        }

        fn active_transaction_threads(&self) -> HashSet<u64> {
            let mut threads = HashSet::new();
            threads.insert(7);
            threads
        }
    }

    fn parameters(id: i64) -> ProfilerParameters {
        // Short but multi-tick session; ticks land every 100ms minimum.
        ProfilerParameters::new(id, Duration::from_millis(100), Duration::from_secs(120))
    }

    #[test]
    fn only_one_session_runs_at_a_time() {
        let service = ProfilerService::new(Arc::new(FixedSource::default()));
        let session = service.start_profiler(parameters(1)).unwrap();
        assert_eq!(session.state(), SessionState::Running);
        assert!(service.is_session_active());

        assert!(matches!(
            service.start_profiler(parameters(2)),
            Err(ProfilerError::SessionActive(1))
        ));
        service.stop_profiler(1, false).unwrap();
    }

    #[test]
    fn stop_requires_the_right_profile_id() {
        let service = ProfilerService::new(Arc::new(FixedSource::default()));
        service.start_profiler(parameters(5)).unwrap();
        assert_eq!(
            service.stop_profiler(9, true),
            Err(ProfilerError::UnknownProfileId {
                requested: 9,
                active: 5
            })
        );
        service.stop_profiler(5, false).unwrap();
    }

    #[test]
    fn stop_without_an_active_session_fails() {
        let service = ProfilerService::new(Arc::new(FixedSource::default()));
        assert_eq!(
            service.stop_profiler(1, true),
            Err(ProfilerError::NoActiveSession)
        );
    }

    #[test]
    fn stopped_session_reports_and_frees_the_slot() {
        let exporter = InMemoryProfileExporter::default();
        let service =
            ProfilerService::with_exporter(Arc::new(FixedSource::default()), exporter.clone());
        let session = service.start_profiler(parameters(3)).unwrap();

        // Let at least one tick land before stopping.
        std::thread::sleep(Duration::from_millis(250));
        service.stop_profiler(3, true).unwrap();
        for _ in 0..50 {
            if !service.is_session_active() {
                break;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        assert!(!service.is_session_active());
        assert_eq!(session.state(), SessionState::Done);

        let reports = exporter.exported_reports().unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].profile_id, 3);
        assert!(reports[0].sample_count >= 1);
        assert!(reports[0].trees.contains_key("worker-pool"));
    }

    #[test]
    fn stop_without_report_discards_the_data() {
        let exporter = InMemoryProfileExporter::default();
        let service =
            ProfilerService::with_exporter(Arc::new(FixedSource::default()), exporter.clone());
        service.start_profiler(parameters(4)).unwrap();
        std::thread::sleep(Duration::from_millis(150));
        service.stop_profiler(4, false).unwrap();
        for _ in 0..50 {
            if !service.is_session_active() {
                break;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        assert!(exporter.exported_reports().unwrap().is_empty());
    }

    #[test]
    fn degenerate_sessions_take_one_sample_and_finish() {
        let exporter = InMemoryProfileExporter::default();
        let service =
            ProfilerService::with_exporter(Arc::new(FixedSource::default()), exporter.clone());
        let parameters =
            ProfilerParameters::new(6, Duration::from_secs(120), Duration::from_secs(120));
        service.start_profiler(parameters).unwrap();
        for _ in 0..50 {
            if !service.is_session_active() {
                break;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        let reports = exporter.exported_reports().unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].sample_count, 1);
    }

    #[test]
    fn stop_after_natural_completion_keeps_the_session_done() {
        let service = ProfilerService::new(Arc::new(FixedSource::default()));
        let parameters =
            ProfilerParameters::new(12, Duration::from_secs(120), Duration::from_secs(120));
        let session = service.start_profiler(parameters).unwrap();
        for _ in 0..50 {
            if session.state() == SessionState::Done {
                break;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        assert_eq!(session.state(), SessionState::Done);

        session.stop(false);
        assert_eq!(session.state(), SessionState::Done);
    }

    #[test]
    fn key_transaction_sessions_release_captures_through_attribution() {
        let exporter = InMemoryProfileExporter::default();
        let service =
            ProfilerService::with_exporter(Arc::new(FixedSource::default()), exporter.clone());
        let parameters = parameters(8).with_key_transaction("WebTransaction/key");
        service.start_profiler(parameters).unwrap();

        // Let a few ticks park captures with the correlator.
        std::thread::sleep(Duration::from_millis(350));
        let now = SystemTime::now();
        service.transaction_finished(
            7,
            "WebTransaction/key",
            now - Duration::from_secs(10),
            now,
        );
        service.stop_profiler(8, true).unwrap();
        for _ in 0..50 {
            if !service.is_session_active() {
                break;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        let reports = exporter.exported_reports().unwrap();
        assert_eq!(reports.len(), 1);
        assert!(reports[0].trees.contains_key("worker-pool"));
    }

    #[test]
    fn start_command_round_trip() {
        let service = ProfilerService::new(Arc::new(FixedSource::default()));
        let command = StartCommand {
            profile_id: Some(11),
            sample_period_seconds: Some(0.1),
            duration_seconds: Some(120.0),
            ..StartCommand::default()
        };
        let session = service.handle_start_command(&command).unwrap();
        assert_eq!(session.profile_id(), 11);

        let stop = StopCommand {
            profile_id: Some(11),
            report_data: false,
        };
        service.handle_stop_command(&stop).unwrap();
    }

    #[test]
    fn stop_command_without_id_is_rejected() {
        let service = ProfilerService::new(Arc::new(FixedSource::default()));
        let stop = StopCommand {
            profile_id: None,
            report_data: true,
        };
        assert!(matches!(
            service.handle_stop_command(&stop),
            Err(ProfilerError::Command(_))
        ));
    }
}
