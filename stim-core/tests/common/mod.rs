#![allow(dead_code)]

use core::cell::Cell;
use core::ops::Add;
use core::time::Duration;
use std::rc::Rc;

use stim_core::device::{
    AnalogStimulation, AnalogWaveform, DeviceCommand, RecordingController, StimulationDevice,
    StimulationParameters, StimulationTarget, WaveformBank, WaveformSlot,
};
use stim_core::electrodes::{ElectrodeConfiguration, HardwareChannelId, LeadConfiguration};
use stim_core::executor::StimulationOptions;
use stim_core::orchestrator::{MonotonicClock, Sequencer, StartFlags, TickOutcome};
use stim_core::sequences::SequenceDocument;
use stim_core::telemetry::{
    SequenceEvent, SequenceEventKind, SequenceNotice, SequenceObserver, TelemetryInstant,
    TelemetryPayload,
};

pub const TICK: Duration = Duration::from_millis(100);

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct MockInstant(pub u64);

impl MockInstant {
    pub fn millis(value: u64) -> Self {
        Self(value * 1_000)
    }
}

impl Add<Duration> for MockInstant {
    type Output = Self;

    fn add(self, rhs: Duration) -> Self::Output {
        Self(self.0 + rhs.as_micros() as u64)
    }
}

impl TelemetryInstant for MockInstant {
    fn saturating_duration_since(&self, earlier: Self) -> Duration {
        Duration::from_micros(self.0.saturating_sub(earlier.0))
    }
}

/// Clock read by the retry loop; every read advances it by `step`.
#[derive(Clone)]
pub struct ManualClock {
    now_us: Rc<Cell<u64>>,
    step_us: u64,
    pauses: Rc<Cell<usize>>,
}

impl ManualClock {
    pub fn stepping(step: Duration) -> Self {
        Self {
            now_us: Rc::new(Cell::new(0)),
            step_us: step.as_micros() as u64,
            pauses: Rc::new(Cell::new(0)),
        }
    }

    /// Number of waits requested between retry attempts.
    pub fn pauses(&self) -> usize {
        self.pauses.get()
    }
}

impl MonotonicClock for ManualClock {
    type Instant = MockInstant;

    fn now(&self) -> MockInstant {
        let current = self.now_us.get();
        self.now_us.set(current + self.step_us);
        MockInstant(current)
    }

    fn pause(&self, _duration: Duration) {
        self.pauses.set(self.pauses.get() + 1);
    }
}

/// Lets `skip` invocations of `call` through, then fails the next `times`
/// with `message`.
#[derive(Clone, Debug)]
pub struct ScriptedFailure {
    pub call: &'static str,
    pub skip: usize,
    pub times: usize,
    pub message: &'static str,
}

/// Device double that logs every call and replays scripted failures.
#[derive(Default)]
pub struct MockDevice {
    pub calls: Vec<DeviceCommand>,
    pub script: Vec<ScriptedFailure>,
}

impl MockDevice {
    pub fn failing(call: &'static str, times: usize, message: &'static str) -> Self {
        Self::failing_after(call, 0, times, message)
    }

    pub fn failing_after(
        call: &'static str,
        skip: usize,
        times: usize,
        message: &'static str,
    ) -> Self {
        Self {
            calls: Vec::new(),
            script: vec![ScriptedFailure {
                call,
                skip,
                times,
                message,
            }],
        }
    }

    pub fn texts(&self) -> Vec<&str> {
        self.calls
            .iter()
            .filter_map(|call| match call {
                DeviceCommand::SendText(text) => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn labels(&self) -> Vec<&'static str> {
        self.calls.iter().map(DeviceCommand::label).collect()
    }

    pub fn count(&self, label: &str) -> usize {
        self.calls
            .iter()
            .filter(|call| call.label() == label)
            .count()
    }

    pub fn parameters(&self) -> Vec<StimulationParameters> {
        self.calls
            .iter()
            .filter_map(|call| match call {
                DeviceCommand::SetStimulationParameters(parameters) => Some(*parameters),
                _ => None,
            })
            .collect()
    }

    fn log(&mut self, command: DeviceCommand) -> Result<(), String> {
        let label = command.label();
        self.calls.push(command);
        match self
            .script
            .iter_mut()
            .find(|failure| failure.call == label && (failure.skip > 0 || failure.times > 0))
        {
            Some(failure) if failure.skip > 0 => {
                failure.skip -= 1;
                Ok(())
            }
            Some(failure) => {
                failure.times -= 1;
                Err(String::from(failure.message))
            }
            None => Ok(()),
        }
    }
}

impl StimulationDevice for MockDevice {
    type Error = String;

    fn set_stimulation_parameters(
        &mut self,
        parameters: &StimulationParameters,
    ) -> Result<(), Self::Error> {
        self.log(DeviceCommand::SetStimulationParameters(*parameters))
    }

    fn start_stimulation(&mut self, channel: HardwareChannelId) -> Result<(), Self::Error> {
        self.log(DeviceCommand::StartStimulation(channel))
    }

    fn load_waveform(
        &mut self,
        slot: WaveformSlot,
        _waveform: &AnalogWaveform,
    ) -> Result<(), Self::Error> {
        self.log(DeviceCommand::LoadWaveform { index: 0, slot })
    }

    fn start_analog_stimulation(&mut self, request: &AnalogStimulation) -> Result<(), Self::Error> {
        self.log(DeviceCommand::StartAnalogStimulation(*request))
    }

    fn stop_stimulation(&mut self, target: StimulationTarget) -> Result<(), Self::Error> {
        self.log(DeviceCommand::StopStimulation(target))
    }
}

impl RecordingController for MockDevice {
    type Error = String;

    fn set_save_file_name(&mut self, name: &str) -> Result<(), Self::Error> {
        self.log(DeviceCommand::SetSaveFileName(String::from(name)))
    }

    fn start_save(&mut self) -> Result<(), Self::Error> {
        self.log(DeviceCommand::StartSave)
    }

    fn stop_save(&mut self) -> Result<(), Self::Error> {
        self.log(DeviceCommand::StopSave)
    }

    fn send_text(&mut self, text: &str) -> Result<(), Self::Error> {
        self.log(DeviceCommand::SendText(String::from(text)))
    }
}

/// Observed event with the parts of its notice the tests inspect.
#[derive(Clone, Debug, PartialEq)]
pub struct Observed {
    pub event: SequenceEventKind,
    pub stage: Option<u16>,
    pub timestamp: MockInstant,
    pub message: Option<String>,
}

#[derive(Default)]
pub struct CollectingObserver {
    pub events: Vec<Observed>,
}

impl CollectingObserver {
    pub fn kinds(&self) -> Vec<SequenceEventKind> {
        self.events.iter().map(|observed| observed.event).collect()
    }
}

impl SequenceObserver<MockInstant> for CollectingObserver {
    fn on_sequence_event(&mut self, event: &SequenceEvent<'_, MockInstant>) {
        let stage = match event.record.details {
            TelemetryPayload::Phase(phase) => Some(phase.stage),
            _ => None,
        };
        let message = match event.notice {
            SequenceNotice::Message(message) => Some(String::from(message)),
            SequenceNotice::Rotation { save_name, .. } => Some(String::from(save_name)),
            SequenceNotice::Sequence(name) => Some(String::from(name)),
            _ => None,
        };
        self.events.push(Observed {
            event: event.record.event,
            stage,
            timestamp: event.record.timestamp,
            message,
        });
    }
}

pub type TestSequencer = Sequencer<MockDevice, ManualClock, CollectingObserver>;

/// Lead 0 is an 8-contact lead on channels 10272..=10279; the rest are empty.
pub fn electrodes() -> ElectrodeConfiguration {
    let channels = (0..8)
        .map(|offset| HardwareChannelId::new(10_272 + offset))
        .collect();
    let lead = LeadConfiguration::new("BSci Vercise", "Left", "STN", channels);
    ElectrodeConfiguration::from_leads(vec![lead]).expect("single lead fits")
}

pub fn sequencer_with(device: MockDevice) -> TestSequencer {
    Sequencer::new(
        device,
        ManualClock::stepping(Duration::from_millis(500)),
        CollectingObserver::default(),
        electrodes(),
        StimulationOptions::default(),
    )
}

pub fn sequencer() -> TestSequencer {
    sequencer_with(MockDevice::default())
}

pub fn load(sequencer: &mut TestSequencer, json: &str, waveforms: WaveformBank) {
    let document = SequenceDocument::from_json(json).expect("document should parse");
    sequencer
        .load_document(MockInstant(0), document, waveforms)
        .expect("load should succeed");
}

pub fn one_waveform() -> WaveformBank {
    WaveformBank::from_waveforms(vec![AnalogWaveform::new("Burst135", vec![0, 512, 0, -512])])
}

/// Starts at t=0 and ticks every 100 ms until the run ends or `limit` passes.
///
/// Returns the tick time at which the run ended along with the failing
/// outcome, if any.
pub fn run_to_end(
    sequencer: &mut TestSequencer,
    limit: Duration,
) -> (MockInstant, Result<TickOutcome, stim_core::orchestrator::ControlError>) {
    let started = sequencer.start(MockInstant(0), StartFlags::default());
    if !sequencer.state().armed {
        return (MockInstant(0), started);
    }

    let mut now = MockInstant(0);
    while now.saturating_duration_since(MockInstant(0)) < limit {
        now = now + TICK;
        let outcome = sequencer.tick(now);
        if !sequencer.state().armed {
            return (now, outcome);
        }
    }
    (now, Ok(TickOutcome::default()))
}
