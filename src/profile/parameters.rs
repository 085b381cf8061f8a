//! Session parameters and backend command decoding.

use std::time::Duration;

use thiserror::Error;

/// A start-profiler command as decoded from the backend, all fields
/// optional the way the wire format delivers them. Durations arrive as
/// fractional seconds.
#[derive(Clone, Debug, Default)]
pub struct StartCommand {
    /// Backend-assigned id for the session.
    pub profile_id: Option<i64>,
    /// Requested sample period in fractional seconds.
    pub sample_period_seconds: Option<f64>,
    /// Session length in fractional seconds.
    pub duration_seconds: Option<f64>,
    /// Keep only captures of runnable threads.
    pub only_runnable_threads: Option<bool>,
    /// Keep only captures of request-serving threads.
    pub only_request_threads: Option<bool>,
    /// Also keep captures of the agent's own threads.
    pub profile_agent_threads: Option<bool>,
    /// Restrict the session to one key transaction.
    pub key_transaction: Option<String>,
    /// Application the session reports under.
    pub app_name: Option<String>,
}

/// A stop-profiler command as decoded from the backend.
#[derive(Clone, Debug, Default)]
pub struct StopCommand {
    /// Id of the session to stop.
    pub profile_id: Option<i64>,
    /// Whether the aggregated report should still be delivered.
    pub report_data: bool,
}

/// Command payloads the backend sent that cannot start a session.
#[derive(Error, Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum CommandError {
    /// The command carried no profile id.
    #[error("start command is missing a profile id")]
    MissingProfileId,

    /// The command carried no sample period.
    #[error("start command is missing a sample period")]
    MissingSamplePeriod,

    /// The sample period is not a positive finite number of seconds.
    #[error("invalid sample period: {0} seconds")]
    InvalidSamplePeriod(f64),

    /// The command carried no session duration.
    #[error("start command is missing a duration")]
    MissingDuration,

    /// The duration is not a positive finite number of seconds.
    #[error("invalid duration: {0} seconds")]
    InvalidDuration(f64),

    /// The sample period is longer than the whole session.
    #[error("sample period exceeds the session duration")]
    PeriodExceedsDuration,
}

/// Validated parameters of one profiling session.
#[derive(Clone, Debug)]
pub struct ProfilerParameters {
    /// Backend-assigned id of the session.
    pub profile_id: i64,
    /// Requested spacing between sampling ticks.
    pub sample_period: Duration,
    /// Total session length.
    pub duration: Duration,
    /// Keep only captures of runnable threads.
    pub only_runnable_threads: bool,
    /// Keep only captures of request-serving threads.
    pub only_request_threads: bool,
    /// Also keep captures of the agent's own threads.
    pub profile_agent_threads: bool,
    /// Restrict the session to one key transaction.
    pub key_transaction: Option<String>,
    /// Application the session reports under.
    pub app_name: Option<String>,
}

impl ProfilerParameters {
    /// Creates parameters with all filters off.
    pub fn new(profile_id: i64, sample_period: Duration, duration: Duration) -> Self {
        ProfilerParameters {
            profile_id,
            sample_period,
            duration,
            only_runnable_threads: false,
            only_request_threads: false,
            profile_agent_threads: false,
            key_transaction: None,
            app_name: None,
        }
    }

    /// Keep only captures of runnable threads.
    pub fn with_only_runnable_threads(mut self) -> Self {
        self.only_runnable_threads = true;
        self
    }

    /// Keep only captures of request-serving threads.
    pub fn with_only_request_threads(mut self) -> Self {
        self.only_request_threads = true;
        self
    }

    /// Also keep captures of the agent's own threads.
    pub fn with_profile_agent_threads(mut self) -> Self {
        self.profile_agent_threads = true;
        self
    }

    /// Restrict the session to one key transaction.
    pub fn with_key_transaction(mut self, transaction: impl Into<String>) -> Self {
        self.key_transaction = Some(transaction.into());
        self
    }

    /// Validates a decoded start command into session parameters.
    pub fn from_start_command(command: &StartCommand) -> Result<Self, CommandError> {
        let profile_id = command.profile_id.ok_or(CommandError::MissingProfileId)?;
        let period_seconds = command
            .sample_period_seconds
            .ok_or(CommandError::MissingSamplePeriod)?;
        if !period_seconds.is_finite() || period_seconds <= 0.0 {
            return Err(CommandError::InvalidSamplePeriod(period_seconds));
        }
        let duration_seconds = command
            .duration_seconds
            .ok_or(CommandError::MissingDuration)?;
        if !duration_seconds.is_finite() || duration_seconds <= 0.0 {
            return Err(CommandError::InvalidDuration(duration_seconds));
        }
        let sample_period = Duration::from_secs_f64(period_seconds);
        let duration = Duration::from_secs_f64(duration_seconds);
        if sample_period > duration {
            return Err(CommandError::PeriodExceedsDuration);
        }
        Ok(ProfilerParameters {
            profile_id,
            sample_period,
            duration,
            only_runnable_threads: command.only_runnable_threads.unwrap_or(false),
            only_request_threads: command.only_request_threads.unwrap_or(false),
            profile_agent_threads: command.profile_agent_threads.unwrap_or(false),
            key_transaction: command.key_transaction.clone(),
            app_name: command.app_name.clone(),
        })
    }

    /// Whether a capture passes this session's thread filters.
    pub(crate) fn accepts(&self, runnable: bool, request_thread: bool, agent_thread: bool) -> bool {
        if agent_thread && !self.profile_agent_threads {
            return false;
        }
        if self.only_runnable_threads && !runnable {
            return false;
        }
        if self.only_request_threads && !request_thread {
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rstest::rstest;

    use super::{CommandError, ProfilerParameters, StartCommand};

    fn valid_command() -> StartCommand {
        StartCommand {
            profile_id: Some(42),
            sample_period_seconds: Some(0.1),
            duration_seconds: Some(120.0),
            ..StartCommand::default()
        }
    }

    #[test]
    fn valid_command_parses_fractional_seconds() {
        let parameters = ProfilerParameters::from_start_command(&valid_command()).unwrap();
        assert_eq!(parameters.profile_id, 42);
        assert_eq!(parameters.sample_period, Duration::from_millis(100));
        assert_eq!(parameters.duration, Duration::from_secs(120));
        assert!(!parameters.only_runnable_threads);
    }

    #[rstest]
    #[case(StartCommand { profile_id: None, ..valid_command() }, CommandError::MissingProfileId)]
    #[case(
        StartCommand { sample_period_seconds: None, ..valid_command() },
        CommandError::MissingSamplePeriod
    )]
    #[case(
        StartCommand { sample_period_seconds: Some(-0.1), ..valid_command() },
        CommandError::InvalidSamplePeriod(-0.1)
    )]
    #[case(
        StartCommand { sample_period_seconds: Some(f64::NAN), ..valid_command() },
        CommandError::InvalidSamplePeriod(f64::NAN)
    )]
    #[case(
        StartCommand { duration_seconds: None, ..valid_command() },
        CommandError::MissingDuration
    )]
    #[case(
        StartCommand { duration_seconds: Some(0.0), ..valid_command() },
        CommandError::InvalidDuration(0.0)
    )]
    #[case(
        StartCommand {
            sample_period_seconds: Some(10.0),
            duration_seconds: Some(5.0),
            ..valid_command()
        },
        CommandError::PeriodExceedsDuration
    )]
    fn invalid_commands_are_rejected(#[case] command: StartCommand, #[case] expected: CommandError) {
        let error = ProfilerParameters::from_start_command(&command).unwrap_err();
        match (&error, &expected) {
            (CommandError::InvalidSamplePeriod(a), CommandError::InvalidSamplePeriod(b))
                if a.is_nan() && b.is_nan() => {}
            _ => assert_eq!(error, expected),
        }
    }

    #[rstest]
    // agent threads are dropped unless the session asks for them
    #[case(ProfilerParameters::new(1, Duration::from_millis(100), Duration::from_secs(1)), true, false, true, false)]
    #[case(
        ProfilerParameters::new(1, Duration::from_millis(100), Duration::from_secs(1))
            .with_profile_agent_threads(),
        true, false, true, true
    )]
    #[case(
        ProfilerParameters::new(1, Duration::from_millis(100), Duration::from_secs(1))
            .with_only_runnable_threads(),
        false, false, false, false
    )]
    #[case(
        ProfilerParameters::new(1, Duration::from_millis(100), Duration::from_secs(1))
            .with_only_request_threads(),
        true, true, false, true
    )]
    fn thread_filters(
        #[case] parameters: ProfilerParameters,
        #[case] runnable: bool,
        #[case] request: bool,
        #[case] agent: bool,
        #[case] expected: bool,
    ) {
        assert_eq!(parameters.accepts(runnable, request, agent), expected);
    }
}
