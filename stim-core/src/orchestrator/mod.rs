//! Tick-driven sequencer: timing driver, phase transitions, and the stop path.
//!
//! Planning and execution are split. [`plan_tick`] is a pure function that,
//! given the loaded document, the current [`SequencerState`] and the elapsed
//! time, produces every transition due this tick together with the device
//! calls each one needs. [`Sequencer::tick`] then issues those calls in order,
//! records telemetry, and notifies the observer. Any failure ends the run
//! through [`Sequencer::stop`], the single choke point for ending a sequence.

use alloc::string::{String, ToString};
use alloc::vec::Vec;
use core::{fmt, time::Duration};

use crate::device::{
    DeviceCommand, DeviceFailure, RecordingController, StimulationDevice, StimulationTarget,
    WaveformBank,
};
use crate::electrodes::ElectrodeConfiguration;
use crate::executor::{PolarityConvention, RechargeMode, StimulationOptions, plan_phase};
use crate::recording::{RecordingRotation, RecordingState};
use crate::sequences::{
    ChargeBalance, ConfigurationError, ManualStimulation, SequenceDocument, StimulationPhase,
    validate_phase,
};
use crate::telemetry::{
    SequenceEvent, SequenceEventKind, SequenceNotice, SequenceObserver, TelemetryInstant,
    TelemetryPayload, TelemetryRecord, TelemetryRecorder,
};

pub use crate::telemetry::{AbortReason, EventId};

/// Cadence at which front-ends are expected to call [`Sequencer::tick`].
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(100);

/// Default window during which a failed analog start is retried.
pub const DEFAULT_ANALOG_RETRY_WINDOW: Duration = Duration::from_secs(5);

/// Wait between two attempts of a busy analog start.
pub const ANALOG_RETRY_PAUSE: Duration = Duration::from_millis(10);

/// Monotonic time source used to bound retries.
pub trait MonotonicClock {
    type Instant: TelemetryInstant;

    fn now(&self) -> Self::Instant;

    /// Blocks for roughly `duration` between retry attempts.
    ///
    /// Clocks that cannot block keep the default, which returns at once.
    fn pause(&self, _duration: Duration) {}
}

/// Retry policy applied to every `StartAnalogStimulation` call and to no other call.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct AnalogRetryPolicy {
    window: Duration,
}

impl AnalogRetryPolicy {
    pub const fn new(window: Duration) -> Self {
        Self { window }
    }

    /// Fails analog starts on the first error.
    pub const fn disabled() -> Self {
        Self::new(Duration::ZERO)
    }

    pub const fn window(self) -> Duration {
        self.window
    }

    pub const fn is_enabled(self) -> bool {
        !self.window.is_zero()
    }
}

impl Default for AnalogRetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_ANALOG_RETRY_WINDOW)
    }
}

/// Options supplied when a run is started.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct StartFlags {
    /// The run was launched from an annotation, so its recording ends with it.
    pub annotation_driven: bool,
    /// Overrides the analog retry window for this run only.
    pub retry_window: Option<Duration>,
}

impl Default for StartFlags {
    fn default() -> Self {
        Self {
            annotation_driven: true,
            retry_window: None,
        }
    }
}

/// Phase-execution state threaded through every tick.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SequencerState<TInstant> {
    pub current_stage: usize,
    pub phase_active: bool,
    pub started_at: Option<TInstant>,
    pub armed: bool,
    pub annotation_driven: bool,
}

impl<TInstant: Copy> SequencerState<TInstant> {
    /// Disarmed state with nothing running.
    pub const fn idle() -> Self {
        Self {
            current_stage: 0,
            phase_active: false,
            started_at: None,
            armed: false,
            annotation_driven: false,
        }
    }

    /// Freshly armed state positioned at stage 0.
    pub const fn running(started_at: TInstant, annotation_driven: bool) -> Self {
        Self {
            current_stage: 0,
            phase_active: false,
            started_at: Some(started_at),
            armed: true,
            annotation_driven,
        }
    }
}

impl<TInstant: Copy> Default for SequencerState<TInstant> {
    fn default() -> Self {
        Self::idle()
    }
}

/// Read-only inputs consulted while planning a tick.
#[derive(Copy, Clone, Debug)]
pub struct PlanContext<'a> {
    pub electrodes: &'a ElectrodeConfiguration,
    pub loaded_waveforms: usize,
    pub options: StimulationOptions,
}

/// What a planned transition does.
#[derive(Clone, Debug, PartialEq)]
pub enum TransitionKind {
    /// Enter a phase: optionally switch the save file, then stimulate.
    Start {
        phase: StimulationPhase,
        rotation: Option<RecordingRotation>,
        charge_balance: Option<ChargeBalance>,
    },
    /// The active phase has elapsed.
    Stop,
    /// The phase at this stage failed validation; the run must end.
    Abort { error: ConfigurationError },
}

/// A single state change due this tick.
#[derive(Clone, Debug, PartialEq)]
pub struct PlannedTransition<TInstant> {
    pub stage: usize,
    pub kind: TransitionKind,
    /// Stimulation calls in issue order. Recording calls live in the rotation.
    pub commands: Vec<DeviceCommand>,
    /// State after the transition completes.
    pub state: SequencerState<TInstant>,
}

impl<TInstant> PlannedTransition<TInstant> {
    /// Every device call of this transition, recording switch first.
    pub fn all_commands(&self) -> impl Iterator<Item = &DeviceCommand> {
        let rotation = match &self.kind {
            TransitionKind::Start {
                rotation: Some(rotation),
                ..
            } => rotation.commands.as_slice(),
            _ => &[],
        };
        rotation.iter().chain(self.commands.iter())
    }
}

/// Everything due on one tick.
#[derive(Clone, Debug, PartialEq)]
pub struct TickPlan<TInstant> {
    pub transitions: Vec<PlannedTransition<TInstant>>,
    /// The last phase has elapsed and nothing is active.
    pub completes: bool,
}

impl<TInstant> TickPlan<TInstant> {
    /// Returns `true` when the plan ends in a validation abort.
    pub fn aborts(&self) -> bool {
        self.transitions
            .last()
            .is_some_and(|transition| matches!(transition.kind, TransitionKind::Abort { .. }))
    }
}

/// Plans every transition due at `elapsed` without touching any device.
///
/// Transitions cascade within one tick: the stop of phase *i* may be followed
/// by the start of phase *i + 1* when its offset has also passed.
pub fn plan_tick<TInstant: Copy>(
    document: &SequenceDocument,
    state: &SequencerState<TInstant>,
    recording: &RecordingState,
    elapsed: Duration,
    context: &PlanContext<'_>,
) -> TickPlan<TInstant> {
    let mut transitions = Vec::new();
    let mut state = *state;
    let mut recording = recording.clone();
    let elapsed_s = elapsed.as_secs_f64();

    if !state.armed {
        return TickPlan {
            transitions,
            completes: false,
        };
    }

    while state.current_stage < document.len() {
        let stage = state.current_stage;
        let offset = document.phase_offset(stage);

        if !state.phase_active {
            if elapsed_s < offset {
                break;
            }

            let Some(raw) = document.phase(stage) else {
                break;
            };
            let phase = match validate_phase(raw, context.electrodes, context.loaded_waveforms) {
                Ok(phase) => phase,
                Err(error) => {
                    transitions.push(PlannedTransition {
                        stage,
                        kind: TransitionKind::Abort { error },
                        commands: Vec::new(),
                        state,
                    });
                    return TickPlan {
                        transitions,
                        completes: false,
                    };
                }
            };

            let rotation = recording.plan_rotation(phase.recording_filename.as_deref());
            if let Some(rotation) = &rotation {
                recording.apply_rotation(rotation);
            }
            let plan = plan_phase(&phase, context.options);
            state.phase_active = true;

            transitions.push(PlannedTransition {
                stage,
                kind: TransitionKind::Start {
                    phase,
                    rotation,
                    charge_balance: plan.charge_balance,
                },
                commands: plan.commands,
                state,
            });
        } else {
            if elapsed_s < offset + document.phase_duration(stage) {
                break;
            }

            state.phase_active = false;
            state.current_stage += 1;
            transitions.push(PlannedTransition {
                stage,
                kind: TransitionKind::Stop,
                commands: alloc::vec![DeviceCommand::StopStimulation(StimulationTarget::All)],
                state,
            });
        }
    }

    let completes = state.current_stage >= document.len() && !state.phase_active;
    TickPlan {
        transitions,
        completes,
    }
}

/// How a run ended.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum StopReason {
    Completed,
    Aborted(AbortReason),
}

/// Summary of the work done by one tick.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct TickOutcome {
    pub started: usize,
    pub stopped: usize,
    pub completed: bool,
}

/// Errors surfaced by the sequencer's control operations.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ControlError {
    /// No sequence document has been loaded.
    NoDocument,
    /// A Novel sequence does not list its waveform files.
    WaveformsNotListed,
    /// A Novel sequence was started before its waveforms were loaded.
    WaveformsNotLoaded,
    /// Options cannot change while a run is armed.
    Busy,
    Configuration {
        stage: usize,
        error: ConfigurationError,
    },
    DeviceCall {
        stage: usize,
        failure: DeviceFailure,
    },
    RecordingSwitch {
        stage: usize,
        failure: DeviceFailure,
    },
    /// A manual recording request failed.
    Recording(DeviceFailure),
    /// The recorder refused an annotation.
    Label(DeviceFailure),
    /// The stop-all call failed; the run was still disarmed.
    Stop(DeviceFailure),
}

impl ControlError {
    /// Abort reason recorded when this error ends a run.
    pub const fn abort_reason(&self) -> Option<AbortReason> {
        match self {
            ControlError::Configuration { .. } => Some(AbortReason::Validation),
            ControlError::DeviceCall { .. } => Some(AbortReason::DeviceCall),
            ControlError::RecordingSwitch { .. } => Some(AbortReason::RecordingSwitch),
            _ => None,
        }
    }
}

impl fmt::Display for ControlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlError::NoDocument => f.write_str("Stimulation Configuration not imported"),
            ControlError::WaveformsNotListed => {
                f.write_str("Novel Waveform not in configurations")
            }
            ControlError::WaveformsNotLoaded => f.write_str("Novel Waveform not yet loaded"),
            ControlError::Busy => f.write_str("Sequence running"),
            ControlError::Configuration { stage, error } => {
                write!(f, "Phase {}: {error}", stage + 1)
            }
            ControlError::DeviceCall { failure, .. }
            | ControlError::RecordingSwitch { failure, .. }
            | ControlError::Recording(failure)
            | ControlError::Label(failure)
            | ControlError::Stop(failure) => fmt::Display::fmt(failure, f),
        }
    }
}

impl core::error::Error for ControlError {}

/// Owns a sequence run and the collaborators it drives.
pub struct Sequencer<D, C, O>
where
    C: MonotonicClock,
{
    device: D,
    clock: C,
    observer: O,
    document: Option<SequenceDocument>,
    /// One-phase run typed at the prompt; shadows `document` until it ends.
    manual: Option<SequenceDocument>,
    waveforms: WaveformBank,
    electrodes: ElectrodeConfiguration,
    options: StimulationOptions,
    retry_policy: AnalogRetryPolicy,
    run_retry_window: Duration,
    state: SequencerState<C::Instant>,
    recording: RecordingState,
    telemetry: TelemetryRecorder<C::Instant>,
    phases_started: usize,
}

impl<D, C, O> Sequencer<D, C, O>
where
    D: StimulationDevice + RecordingController,
    C: MonotonicClock,
    O: SequenceObserver<C::Instant>,
{
    pub fn new(
        device: D,
        clock: C,
        observer: O,
        electrodes: ElectrodeConfiguration,
        options: StimulationOptions,
    ) -> Self {
        let retry_policy = AnalogRetryPolicy::default();
        Self {
            device,
            clock,
            observer,
            document: None,
            manual: None,
            waveforms: WaveformBank::new(),
            electrodes,
            options,
            retry_policy,
            run_retry_window: retry_policy.window(),
            state: SequencerState::idle(),
            recording: RecordingState::default(),
            telemetry: TelemetryRecorder::new(),
            phases_started: 0,
        }
    }

    #[must_use]
    pub fn with_retry_policy(mut self, policy: AnalogRetryPolicy) -> Self {
        self.retry_policy = policy;
        self.run_retry_window = policy.window();
        self
    }

    /// Sets the session prefix used for every recording file name.
    #[must_use]
    pub fn with_recording_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.recording.set_prefix(prefix);
        self
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    pub fn observer(&self) -> &O {
        &self.observer
    }

    pub fn observer_mut(&mut self) -> &mut O {
        &mut self.observer
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    pub fn document(&self) -> Option<&SequenceDocument> {
        self.document.as_ref()
    }

    /// Document driving the current run: a manual stimulation while one is
    /// armed, the loaded sequence otherwise.
    pub fn active_document(&self) -> Option<&SequenceDocument> {
        self.manual.as_ref().or(self.document.as_ref())
    }

    pub fn waveforms(&self) -> &WaveformBank {
        &self.waveforms
    }

    pub fn electrodes(&self) -> &ElectrodeConfiguration {
        &self.electrodes
    }

    pub fn options(&self) -> StimulationOptions {
        self.options
    }

    pub fn retry_policy(&self) -> AnalogRetryPolicy {
        self.retry_policy
    }

    pub fn state(&self) -> &SequencerState<C::Instant> {
        &self.state
    }

    pub fn recording(&self) -> &RecordingState {
        &self.recording
    }

    pub fn telemetry(&self) -> &TelemetryRecorder<C::Instant> {
        &self.telemetry
    }

    /// Time since the running sequence was (re)started.
    pub fn elapsed(&self, now: C::Instant) -> Option<Duration> {
        self.state
            .started_at
            .map(|started_at| now.saturating_duration_since(started_at))
    }

    pub fn set_polarity(&mut self, polarity: PolarityConvention) -> Result<(), ControlError> {
        self.ensure_idle()?;
        self.options.polarity = polarity;
        Ok(())
    }

    pub fn set_recharge(&mut self, recharge: RechargeMode) -> Result<(), ControlError> {
        self.ensure_idle()?;
        self.options.recharge = recharge;
        Ok(())
    }

    /// Replaces the document and its waveforms wholesale, stopping any run first.
    pub fn load_document(
        &mut self,
        now: C::Instant,
        document: SequenceDocument,
        waveforms: WaveformBank,
    ) -> Result<(), ControlError> {
        let stopped = if self.state.armed {
            self.stop(now, StopReason::Aborted(AbortReason::Replaced))
        } else {
            Ok(())
        };

        log::info!(
            "sequencer: loaded '{}' ({} phases, {} waveforms)",
            document.name(),
            document.len(),
            waveforms.len()
        );
        self.document = Some(document);
        self.waveforms = waveforms;
        stopped
    }

    /// Arms the loaded sequence at stage 0 and runs the first tick.
    pub fn start(&mut self, now: C::Instant, flags: StartFlags) -> Result<TickOutcome, ControlError> {
        if self.state.armed {
            self.stop(now, StopReason::Aborted(AbortReason::Operator))?;
        }

        let document = self.document.as_ref().ok_or(ControlError::NoDocument)?;
        if document.requires_waveforms() {
            if document.analog_waveforms().is_none() {
                return Err(ControlError::WaveformsNotListed);
            }
            if self.waveforms.is_empty() {
                return Err(ControlError::WaveformsNotLoaded);
            }
        }

        self.state = SequencerState::running(now, flags.annotation_driven);
        self.run_retry_window = flags.retry_window.unwrap_or(self.retry_policy.window());
        self.phases_started = 0;

        log::info!(
            "sequencer: armed '{}' ({} phases, {:.1}s)",
            document.name(),
            document.len(),
            document.total_duration()
        );
        let record = self.telemetry.record(
            SequenceEventKind::SequenceArmed,
            TelemetryPayload::None,
            now,
        );
        self.observer.on_sequence_event(&SequenceEvent {
            record,
            notice: SequenceNotice::Sequence(document.name()),
        });

        self.tick(now)
    }

    /// Advances the run to `now`. Does nothing while disarmed.
    pub fn tick(&mut self, now: C::Instant) -> Result<TickOutcome, ControlError> {
        let mut outcome = TickOutcome::default();
        let (Some(document), Some(elapsed)) = (self.active_document(), self.elapsed(now)) else {
            return Ok(outcome);
        };
        if !self.state.armed {
            return Ok(outcome);
        }

        let context = PlanContext {
            electrodes: &self.electrodes,
            loaded_waveforms: self.waveforms.len(),
            options: self.options,
        };
        let plan = plan_tick(document, &self.state, &self.recording, elapsed, &context);

        for transition in plan.transitions {
            match self.apply_transition(now, elapsed, transition) {
                Ok(TransitionEffect::Started) => outcome.started += 1,
                Ok(TransitionEffect::Stopped) => outcome.stopped += 1,
                Err(error) => {
                    let message = error.to_string();
                    let reason = error.abort_reason().unwrap_or(AbortReason::DeviceCall);
                    log::warn!("sequencer: aborting: {message}");
                    if let Err(stop_error) =
                        self.finish(now, StopReason::Aborted(reason), Some(&message))
                    {
                        log::warn!("sequencer: cleanup after abort failed: {stop_error}");
                    }
                    return Err(error);
                }
            }
        }

        if plan.completes {
            log::info!(
                "sequencer: sequence complete t={}ms",
                elapsed.as_millis()
            );
            self.stop(now, StopReason::Completed)?;
            outcome.completed = true;
        }

        Ok(outcome)
    }

    /// Ends the run: stops all stimulation, releases an annotation-driven
    /// recording, logs `StimulationOff`, and disarms.
    ///
    /// Safe to call repeatedly; a second call leaves the same state behind.
    pub fn stop(&mut self, now: C::Instant, reason: StopReason) -> Result<(), ControlError> {
        self.finish(now, reason, None)
    }

    /// Applies one Standard pulse train for `request.duration`, then stops.
    ///
    /// Refused while a run is armed. The loaded document is left untouched
    /// and becomes the active one again once the manual run ends.
    pub fn stimulate(
        &mut self,
        now: C::Instant,
        request: &ManualStimulation,
    ) -> Result<TickOutcome, ControlError> {
        self.ensure_idle()?;

        let document = request.to_document();
        log::info!(
            "sequencer: manual stimulation lead {} contacts {:?} {} mA {} us {} Hz for {:.1}s",
            request.lead + 1,
            request.contacts,
            request.amplitude_ma,
            request.pulse_width_us,
            request.frequency_hz,
            document.total_duration()
        );
        let record = self.telemetry.record(
            SequenceEventKind::SequenceArmed,
            TelemetryPayload::None,
            now,
        );
        self.observer.on_sequence_event(&SequenceEvent {
            record,
            notice: SequenceNotice::Sequence(document.name()),
        });

        self.manual = Some(document);
        self.state = SequencerState::running(now, false);
        self.run_retry_window = self.retry_policy.window();
        self.phases_started = 0;

        self.tick(now)
    }

    /// Writes a free-text annotation into the recording.
    ///
    /// Blank text is ignored and reported as `false`.
    pub fn send_label(&mut self, now: C::Instant, text: &str) -> Result<bool, ControlError> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(false);
        }

        DeviceCommand::SendText(text.to_string())
            .dispatch(&mut self.device, &self.waveforms)
            .map_err(ControlError::Label)?;
        log::info!("sequencer: label \"{text}\"");
        let record = self
            .telemetry
            .record(SequenceEventKind::LabelSent, TelemetryPayload::None, now);
        self.observer.on_sequence_event(&SequenceEvent {
            record,
            notice: SequenceNotice::Message(text),
        });
        Ok(true)
    }

    /// Starts a recording outside of any sequence.
    pub fn start_recording(
        &mut self,
        now: C::Instant,
        label: Option<&str>,
    ) -> Result<String, ControlError> {
        let commands = self.recording.plan_manual_start(label);
        let mut save_name = String::new();
        for command in &commands {
            if let DeviceCommand::SetSaveFileName(name) = command {
                save_name.clone_from(name);
            }
            command
                .dispatch(&mut self.device, &self.waveforms)
                .map_err(ControlError::Recording)?;
            self.recording.record_issued(command);
        }
        self.recording.apply_manual_start(self.state.armed);

        log::info!("sequencer: recording to {save_name}");
        let record = self.telemetry.record(
            SequenceEventKind::RecordingRotated,
            TelemetryPayload::None,
            now,
        );
        self.observer.on_sequence_event(&SequenceEvent {
            record,
            notice: SequenceNotice::Rotation {
                filename: label.unwrap_or(crate::recording::DEFAULT_MANUAL_LABEL),
                save_name: &save_name,
            },
        });
        Ok(save_name)
    }

    /// Stops the active recording. Returns `false` when nothing was saving.
    pub fn stop_recording(&mut self) -> Result<bool, ControlError> {
        let Some(command) = self.recording.plan_manual_stop() else {
            return Ok(false);
        };
        command
            .dispatch(&mut self.device, &self.waveforms)
            .map_err(ControlError::Recording)?;
        self.recording.apply_manual_stop();
        log::info!("sequencer: recording stopped");
        Ok(true)
    }

    fn ensure_idle(&self) -> Result<(), ControlError> {
        if self.state.armed {
            Err(ControlError::Busy)
        } else {
            Ok(())
        }
    }

    fn apply_transition(
        &mut self,
        now: C::Instant,
        elapsed: Duration,
        transition: PlannedTransition<C::Instant>,
    ) -> Result<TransitionEffect, ControlError> {
        let stage = transition.stage;
        match transition.kind {
            TransitionKind::Abort { error } => {
                let message = error.to_string();
                log::warn!("sequencer: phase {} rejected: {message}", stage + 1);
                let record = self.telemetry.record_phase_event(
                    SequenceEventKind::ValidationFailed,
                    stage,
                    elapsed,
                    now,
                );
                self.observer.on_sequence_event(&SequenceEvent {
                    record,
                    notice: SequenceNotice::Message(&message),
                });
                Err(ControlError::Configuration { stage, error })
            }
            TransitionKind::Start {
                phase, rotation, ..
            } => {
                if let Some(rotation) = rotation {
                    for command in &rotation.commands {
                        self.issue(command)
                            .map_err(|failure| ControlError::RecordingSwitch { stage, failure })?;
                        self.recording.record_issued(command);
                    }
                    self.recording.apply_rotation(&rotation);
                    log::info!("sequencer: recording to {}", rotation.save_name);
                    let record = self.telemetry.record_phase_event(
                        SequenceEventKind::RecordingRotated,
                        stage,
                        elapsed,
                        now,
                    );
                    self.observer.on_sequence_event(&SequenceEvent {
                        record,
                        notice: SequenceNotice::Rotation {
                            filename: &rotation.filename,
                            save_name: &rotation.save_name,
                        },
                    });
                }

                for command in &transition.commands {
                    self.issue(command)
                        .map_err(|failure| ControlError::DeviceCall { stage, failure })?;
                }

                self.state = transition.state;
                self.phases_started += 1;
                log::info!(
                    "sequencer: phase {} started ({}) t={}ms",
                    stage + 1,
                    phase.kind(),
                    elapsed.as_millis()
                );
                let record = self.telemetry.record_phase_event(
                    SequenceEventKind::PhaseStarted(phase.kind()),
                    stage,
                    elapsed,
                    now,
                );
                self.observer.on_sequence_event(&SequenceEvent {
                    record,
                    notice: SequenceNotice::Phase(&phase),
                });
                Ok(TransitionEffect::Started)
            }
            TransitionKind::Stop => {
                for command in &transition.commands {
                    self.issue(command)
                        .map_err(|failure| ControlError::DeviceCall { stage, failure })?;
                }

                self.state = transition.state;
                log::info!(
                    "sequencer: phase {} stopped t={}ms",
                    stage + 1,
                    elapsed.as_millis()
                );
                let record = self.telemetry.record_phase_event(
                    SequenceEventKind::PhaseStopped,
                    stage,
                    elapsed,
                    now,
                );
                self.observer.on_sequence_event(&SequenceEvent {
                    record,
                    notice: SequenceNotice::None,
                });
                Ok(TransitionEffect::Stopped)
            }
        }
    }

    /// Issues one call, retrying analog starts within the run's retry window.
    fn issue(&mut self, command: &DeviceCommand) -> Result<(), DeviceFailure> {
        let mut result = command.dispatch(&mut self.device, &self.waveforms);
        if result.is_ok() || !command.is_analog_start() || self.run_retry_window.is_zero() {
            return result;
        }

        let first_attempt = self.clock.now();
        let mut attempts: u32 = 1;
        while result.is_err()
            && self.clock.now().saturating_duration_since(first_attempt) < self.run_retry_window
        {
            self.clock.pause(ANALOG_RETRY_PAUSE);
            result = command.dispatch(&mut self.device, &self.waveforms);
            attempts = attempts.saturating_add(1);
        }

        match &result {
            Ok(()) => log::debug!("sequencer: {} succeeded after {attempts} attempts", command.label()),
            Err(failure) => log::warn!(
                "sequencer: {} gave up after {attempts} attempts: {failure}",
                command.label()
            ),
        }
        result
    }

    fn finish(
        &mut self,
        now: C::Instant,
        reason: StopReason,
        message: Option<&str>,
    ) -> Result<(), ControlError> {
        let was_armed = self.state.armed;
        let stop_result = DeviceCommand::StopStimulation(StimulationTarget::All)
            .dispatch(&mut self.device, &self.waveforms);
        if let Err(failure) = &stop_result {
            log::warn!("sequencer: stop-all failed: {failure}");
        }

        let mut recording_result = Ok(());
        if let Some(command) = self.recording.plan_sequence_stop(self.state.annotation_driven) {
            match command.dispatch(&mut self.device, &self.waveforms) {
                Ok(()) => self.recording.mark_stopped(),
                Err(failure) => {
                    log::warn!("sequencer: stop-save failed: {failure}");
                    recording_result = Err(ControlError::Recording(failure));
                }
            }
        }

        if was_armed {
            let event = match reason {
                StopReason::Completed => SequenceEventKind::SequenceCompleted,
                StopReason::Aborted(reason) => SequenceEventKind::SequenceAborted(reason),
            };
            let record =
                self.telemetry
                    .record_run_end(event, self.phases_started, self.state.started_at, now);
            self.observer.on_sequence_event(&SequenceEvent {
                record,
                notice: message.map_or(SequenceNotice::None, SequenceNotice::Message),
            });
        }

        self.state = SequencerState::idle();
        self.manual = None;
        self.run_retry_window = self.retry_policy.window();

        let record = self.record_stimulation_off(now);
        self.observer.on_sequence_event(&SequenceEvent {
            record,
            notice: SequenceNotice::None,
        });
        log::info!("sequencer: stimulation off");

        stop_result.map_err(ControlError::Stop)?;
        recording_result
    }

    fn record_stimulation_off(&mut self, now: C::Instant) -> TelemetryRecord<C::Instant> {
        self.telemetry
            .record(SequenceEventKind::StimulationOff, TelemetryPayload::None, now)
    }
}

enum TransitionEffect {
    Started,
    Stopped,
}
