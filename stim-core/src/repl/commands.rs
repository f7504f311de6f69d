//! High-level REPL command dispatcher.
//!
//! This module glues the parsed grammar to the sequencer. Commands that
//! change sequencer state are executed here; commands that need the host
//! (file access, printing) come back as a [`ConsoleRequest`].

use alloc::string::String;
use core::fmt;
use core::time::Duration;

use crate::device::{RecordingController, StimulationDevice};
use crate::executor::{PolarityConvention, RechargeMode};
use crate::orchestrator::{
    AbortReason, ControlError, MonotonicClock, Sequencer, StartFlags, StopReason, TickOutcome,
};
use crate::recording::SideEffectKind;
use crate::sequences::ManualStimulation;
use crate::telemetry::SequenceObserver;

use super::grammar::{self, Command, RecordCommand, StimulateCommand};

/// Longest retry window accepted from the REPL.
pub const MAX_RETRY_WINDOW: Duration = Duration::from_secs(60);

/// Command execution successes.
#[derive(Clone, Debug, PartialEq)]
pub enum CommandOutcome<'a, Instant> {
    Started(StartAck<Instant>),
    Stopped { requested_at: Instant },
    Stimulating { requested_at: Instant, first_tick: TickOutcome },
    /// `sent` is `false` when the text was blank.
    Labelled { text: &'a str, sent: bool },
    /// The kind was written into the recording; clinical notes are the host's job.
    SideEffect(SideEffectKind),
    RecordingStarted { save_name: String },
    /// `false` when no recording was active.
    RecordingStopped { was_saving: bool },
    Polarity(PolarityConvention),
    Recharge(RechargeMode),
    Request(ConsoleRequest<'a>),
}

/// Summary returned after arming a sequence.
#[derive(Clone, Debug, PartialEq)]
pub struct StartAck<Instant> {
    pub requested_at: Instant,
    pub retry_window: Option<Duration>,
    pub first_tick: TickOutcome,
}

/// Work the front-end performs on the REPL's behalf.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConsoleRequest<'a> {
    Load { name: &'a str },
    Show,
    Status,
    Help { topic: Option<&'a str> },
}

/// Errors surfaced while executing a command.
#[derive(Debug, PartialEq)]
pub enum CommandError<'a> {
    Parse(grammar::ParseError<'a>),
    Unsupported(&'static str),
    Control(ControlError),
}

impl<'a> From<grammar::ParseError<'a>> for CommandError<'a> {
    fn from(error: grammar::ParseError<'a>) -> Self {
        Self::Parse(error)
    }
}

impl<'a> From<ControlError> for CommandError<'a> {
    fn from(error: ControlError) -> Self {
        Self::Control(error)
    }
}

impl<'a> fmt::Display for CommandError<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandError::Parse(err) => write!(f, "parse error: {err}"),
            CommandError::Unsupported(reason) => f.write_str(reason),
            CommandError::Control(err) => err.fmt(f),
        }
    }
}

type CommandResult<'a, S> = Result<CommandOutcome<'a, <S as SequenceControl>::Instant>, CommandError<'a>>;

/// Sequencer operations reachable from the REPL.
pub trait SequenceControl {
    type Instant: Copy;

    fn start_sequence(
        &mut self,
        now: Self::Instant,
        flags: StartFlags,
    ) -> Result<TickOutcome, ControlError>;

    fn stop_sequence(&mut self, now: Self::Instant) -> Result<(), ControlError>;

    fn stimulate(
        &mut self,
        now: Self::Instant,
        request: &ManualStimulation,
    ) -> Result<TickOutcome, ControlError>;

    fn send_label(&mut self, now: Self::Instant, text: &str) -> Result<bool, ControlError>;

    fn start_recording(
        &mut self,
        now: Self::Instant,
        label: Option<&str>,
    ) -> Result<String, ControlError>;

    fn stop_recording(&mut self) -> Result<bool, ControlError>;

    fn polarity(&self) -> PolarityConvention;

    fn set_polarity(&mut self, polarity: PolarityConvention) -> Result<(), ControlError>;

    fn recharge(&self) -> RechargeMode;

    fn set_recharge(&mut self, recharge: RechargeMode) -> Result<(), ControlError>;
}

impl<D, C, O> SequenceControl for Sequencer<D, C, O>
where
    D: StimulationDevice + RecordingController,
    C: MonotonicClock,
    O: SequenceObserver<C::Instant>,
{
    type Instant = C::Instant;

    fn start_sequence(
        &mut self,
        now: Self::Instant,
        flags: StartFlags,
    ) -> Result<TickOutcome, ControlError> {
        self.start(now, flags)
    }

    fn stop_sequence(&mut self, now: Self::Instant) -> Result<(), ControlError> {
        self.stop(now, StopReason::Aborted(AbortReason::Operator))
    }

    fn stimulate(
        &mut self,
        now: Self::Instant,
        request: &ManualStimulation,
    ) -> Result<TickOutcome, ControlError> {
        Sequencer::stimulate(self, now, request)
    }

    fn send_label(&mut self, now: Self::Instant, text: &str) -> Result<bool, ControlError> {
        Sequencer::send_label(self, now, text)
    }

    fn start_recording(
        &mut self,
        now: Self::Instant,
        label: Option<&str>,
    ) -> Result<String, ControlError> {
        Sequencer::start_recording(self, now, label)
    }

    fn stop_recording(&mut self) -> Result<bool, ControlError> {
        Sequencer::stop_recording(self)
    }

    fn polarity(&self) -> PolarityConvention {
        self.options().polarity
    }

    fn set_polarity(&mut self, polarity: PolarityConvention) -> Result<(), ControlError> {
        Sequencer::set_polarity(self, polarity)
    }

    fn recharge(&self) -> RechargeMode {
        self.options().recharge
    }

    fn set_recharge(&mut self, recharge: RechargeMode) -> Result<(), ControlError> {
        Sequencer::set_recharge(self, recharge)
    }
}

/// Dispatches REPL commands into the sequencer.
pub struct CommandExecutor<S> {
    sequencer: S,
}

impl<S> CommandExecutor<S> {
    /// Creates a new executor around the provided sequencer.
    pub const fn new(sequencer: S) -> Self {
        Self { sequencer }
    }

    pub fn sequencer(&self) -> &S {
        &self.sequencer
    }

    pub fn sequencer_mut(&mut self) -> &mut S {
        &mut self.sequencer
    }

    pub fn into_inner(self) -> S {
        self.sequencer
    }
}

impl<S> CommandExecutor<S>
where
    S: SequenceControl,
{
    /// Parses and executes a REPL command.
    pub fn execute<'a>(&mut self, line: &'a str, now: S::Instant) -> CommandResult<'a, S> {
        let command = grammar::parse(line)?;
        self.dispatch(command, now)
    }

    fn dispatch<'a>(&mut self, command: Command<'a>, now: S::Instant) -> CommandResult<'a, S> {
        match command {
            Command::Load(load) => Ok(CommandOutcome::Request(ConsoleRequest::Load {
                name: load.name,
            })),
            Command::Show => Ok(CommandOutcome::Request(ConsoleRequest::Show)),
            Command::Status => Ok(CommandOutcome::Request(ConsoleRequest::Status)),
            Command::Help(help) => Ok(CommandOutcome::Request(ConsoleRequest::Help {
                topic: help.topic,
            })),
            Command::Start(start) => {
                if start
                    .retry_window
                    .is_some_and(|window| window > MAX_RETRY_WINDOW)
                {
                    return Err(CommandError::Unsupported("retry window must be at most 60s"));
                }

                let flags = StartFlags {
                    retry_window: start.retry_window,
                    ..StartFlags::default()
                };
                let first_tick = self.sequencer.start_sequence(now, flags)?;
                Ok(CommandOutcome::Started(StartAck {
                    requested_at: now,
                    retry_window: start.retry_window,
                    first_tick,
                }))
            }
            Command::Stop => {
                self.sequencer.stop_sequence(now)?;
                Ok(CommandOutcome::Stopped { requested_at: now })
            }
            Command::Stimulate(stimulate) => {
                let first_tick = self
                    .sequencer
                    .stimulate(now, &manual_request(&stimulate))?;
                Ok(CommandOutcome::Stimulating {
                    requested_at: now,
                    first_tick,
                })
            }
            Command::Label(text) => {
                let sent = self.sequencer.send_label(now, text)?;
                Ok(CommandOutcome::Labelled { text, sent })
            }
            Command::SideEffect(kind) => {
                self.sequencer.send_label(now, kind.label())?;
                Ok(CommandOutcome::SideEffect(kind))
            }
            Command::Record(RecordCommand::Start { label }) => {
                let save_name = self.sequencer.start_recording(now, label)?;
                Ok(CommandOutcome::RecordingStarted { save_name })
            }
            Command::Record(RecordCommand::Stop) => {
                let was_saving = self.sequencer.stop_recording()?;
                Ok(CommandOutcome::RecordingStopped { was_saving })
            }
            Command::Polarity(Some(polarity)) => {
                self.sequencer.set_polarity(polarity)?;
                Ok(CommandOutcome::Polarity(polarity))
            }
            Command::Polarity(None) => Ok(CommandOutcome::Polarity(self.sequencer.polarity())),
            Command::Recharge(Some(recharge)) => {
                self.sequencer.set_recharge(recharge)?;
                Ok(CommandOutcome::Recharge(recharge))
            }
            Command::Recharge(None) => Ok(CommandOutcome::Recharge(self.sequencer.recharge())),
        }
    }
}

fn manual_request(command: &StimulateCommand) -> ManualStimulation {
    ManualStimulation {
        lead: command.lead,
        contacts: command.contacts.iter().copied().collect(),
        return_contact: command.return_contact,
        amplitude_ma: command.amplitude_ma,
        pulse_width_us: command.pulse_width_us,
        frequency_hz: command.frequency_hz,
        duration: command.duration,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::format;
    use alloc::vec::Vec;

    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    struct MockInstant(u64);

    #[derive(Clone, Debug, PartialEq)]
    enum Call {
        Start(StartFlags),
        Stop,
        Stimulate(ManualStimulation),
        Label(String),
        RecordStart(Option<String>),
        RecordStop,
    }

    #[derive(Default)]
    struct MockControl {
        calls: Vec<Call>,
        armed: bool,
        saving: bool,
        polarity: PolarityConvention,
        recharge: RechargeMode,
    }

    impl SequenceControl for MockControl {
        type Instant = MockInstant;

        fn start_sequence(
            &mut self,
            _now: MockInstant,
            flags: StartFlags,
        ) -> Result<TickOutcome, ControlError> {
            self.calls.push(Call::Start(flags));
            self.armed = true;
            Ok(TickOutcome {
                started: 1,
                ..TickOutcome::default()
            })
        }

        fn stop_sequence(&mut self, _now: MockInstant) -> Result<(), ControlError> {
            self.calls.push(Call::Stop);
            self.armed = false;
            Ok(())
        }

        fn stimulate(
            &mut self,
            _now: MockInstant,
            request: &ManualStimulation,
        ) -> Result<TickOutcome, ControlError> {
            if self.armed {
                return Err(ControlError::Busy);
            }
            self.calls.push(Call::Stimulate(request.clone()));
            self.armed = true;
            Ok(TickOutcome {
                started: 1,
                ..TickOutcome::default()
            })
        }

        fn send_label(&mut self, _now: MockInstant, text: &str) -> Result<bool, ControlError> {
            if text.trim().is_empty() {
                return Ok(false);
            }
            self.calls.push(Call::Label(String::from(text)));
            Ok(true)
        }

        fn start_recording(
            &mut self,
            _now: MockInstant,
            label: Option<&str>,
        ) -> Result<String, ControlError> {
            self.calls.push(Call::RecordStart(label.map(String::from)));
            self.saving = true;
            Ok(format!("P001_{}", label.unwrap_or("Recording")))
        }

        fn stop_recording(&mut self) -> Result<bool, ControlError> {
            self.calls.push(Call::RecordStop);
            Ok(core::mem::replace(&mut self.saving, false))
        }

        fn polarity(&self) -> PolarityConvention {
            self.polarity
        }

        fn set_polarity(&mut self, polarity: PolarityConvention) -> Result<(), ControlError> {
            if self.armed {
                return Err(ControlError::Busy);
            }
            self.polarity = polarity;
            Ok(())
        }

        fn recharge(&self) -> RechargeMode {
            self.recharge
        }

        fn set_recharge(&mut self, recharge: RechargeMode) -> Result<(), ControlError> {
            if self.armed {
                return Err(ControlError::Busy);
            }
            self.recharge = recharge;
            Ok(())
        }
    }

    fn executor() -> CommandExecutor<MockControl> {
        CommandExecutor::new(MockControl::default())
    }

    #[test]
    fn start_uses_annotation_driven_defaults() {
        let mut executor = executor();
        let now = MockInstant(1_000);

        let outcome = executor.execute("start", now).expect("dispatch should succeed");

        match outcome {
            CommandOutcome::Started(ack) => {
                assert_eq!(ack.requested_at, now);
                assert_eq!(ack.retry_window, None);
                assert_eq!(ack.first_tick.started, 1);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(
            executor.sequencer().calls,
            [Call::Start(StartFlags::default())]
        );
    }

    #[test]
    fn start_forwards_retry_window() {
        let mut executor = executor();
        executor
            .execute("start retry-window=2s", MockInstant(0))
            .expect("dispatch should succeed");

        match executor.sequencer().calls.as_slice() {
            [Call::Start(flags)] => {
                assert!(flags.annotation_driven);
                assert_eq!(flags.retry_window, Some(Duration::from_secs(2)));
            }
            other => panic!("unexpected calls: {other:?}"),
        }
    }

    #[test]
    fn oversized_retry_window_is_rejected() {
        let mut executor = executor();
        let error = executor
            .execute("start retry-window=600s", MockInstant(0))
            .expect_err("window above limit");
        assert_eq!(
            error,
            CommandError::Unsupported("retry window must be at most 60s")
        );
        assert!(executor.sequencer().calls.is_empty());
    }

    #[test]
    fn host_commands_become_requests() {
        let mut executor = executor();
        let now = MockInstant(0);

        assert_eq!(
            executor.execute("load scenario_a", now),
            Ok(CommandOutcome::Request(ConsoleRequest::Load {
                name: "scenario_a"
            }))
        );
        assert_eq!(
            executor.execute("show", now),
            Ok(CommandOutcome::Request(ConsoleRequest::Show))
        );
        assert_eq!(
            executor.execute("help start", now),
            Ok(CommandOutcome::Request(ConsoleRequest::Help {
                topic: Some("start")
            }))
        );
    }

    #[test]
    fn record_round_trip_reports_save_name() {
        let mut executor = executor();
        let now = MockInstant(0);

        assert_eq!(
            executor.execute("record start OR", now),
            Ok(CommandOutcome::RecordingStarted {
                save_name: String::from("P001_OR")
            })
        );
        assert_eq!(
            executor.execute("record stop", now),
            Ok(CommandOutcome::RecordingStopped { was_saving: true })
        );
        assert_eq!(
            executor.execute("record stop", now),
            Ok(CommandOutcome::RecordingStopped { was_saving: false })
        );
    }

    #[test]
    fn options_are_locked_while_running() {
        let mut executor = executor();
        let now = MockInstant(0);

        assert_eq!(
            executor.execute("polarity inverted", now),
            Ok(CommandOutcome::Polarity(PolarityConvention::Inverted))
        );
        executor.execute("start", now).expect("start succeeds");

        let error = executor
            .execute("recharge passive", now)
            .expect_err("armed sequencer rejects option changes");
        assert_eq!(error, CommandError::Control(ControlError::Busy));
        assert_eq!(
            executor.execute("recharge", now),
            Ok(CommandOutcome::Recharge(RechargeMode::Active))
        );
    }

    #[test]
    fn stimulate_builds_a_manual_request() {
        let mut executor = executor();
        let now = MockInstant(5);

        let outcome = executor
            .execute(
                "stimulate lead=0 contacts=1,2 return=can amp=2.5 pw=60 freq=130 dur=1500ms",
                now,
            )
            .expect("dispatch should succeed");

        match outcome {
            CommandOutcome::Stimulating {
                requested_at,
                first_tick,
            } => {
                assert_eq!(requested_at, now);
                assert_eq!(first_tick.started, 1);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(
            executor.sequencer().calls,
            [Call::Stimulate(ManualStimulation {
                lead: 0,
                contacts: alloc::vec![1, 2],
                return_contact: None,
                amplitude_ma: 2.5,
                pulse_width_us: 60.0,
                frequency_hz: 130.0,
                duration: Duration::from_millis(1_500),
            })]
        );

        let error = executor
            .execute(
                "stimulate lead=0 contacts=3 return=1 amp=1 pw=60 freq=130 dur=1s",
                now,
            )
            .expect_err("already stimulating");
        assert_eq!(error, CommandError::Control(ControlError::Busy));
    }

    #[test]
    fn labels_and_side_effects_reach_the_recorder() {
        let mut executor = executor();
        let now = MockInstant(0);

        assert_eq!(
            executor.execute("label tremor onset", now),
            Ok(CommandOutcome::Labelled {
                text: "tremor onset",
                sent: true
            })
        );
        assert_eq!(
            executor.execute("side-effect transient", now),
            Ok(CommandOutcome::SideEffect(SideEffectKind::Transient))
        );
        assert_eq!(
            executor.sequencer().calls,
            [
                Call::Label(String::from("tremor onset")),
                Call::Label(String::from("Transient")),
            ]
        );
    }

    #[test]
    fn parse_error_is_returned() {
        let mut executor = executor();
        let error = executor
            .execute("start later please", MockInstant(0))
            .expect_err("parse should fail");
        assert!(matches!(error, CommandError::Parse(_)));
    }
}
