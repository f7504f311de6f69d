//! Device-call surface consumed by the sequencer.
//!
//! The stimulation hardware and the recording subsystem are external
//! collaborators. The sequencer never talks to them directly; it plans
//! [`DeviceCommand`] values and hands each one to [`DeviceCommand::dispatch`],
//! which turns the collaborator's error into a [`DeviceFailure`] carrying the
//! device's own error text.

use alloc::string::{String, ToString};
use alloc::vec::Vec;
use core::fmt;

use crate::electrodes::{HardwareChannelId, ReturnContact};

/// Repeat count that asks the device to loop a waveform for the whole duration.
pub const CONTINUOUS_REPEAT: i32 = -1;

/// Which contacts a stop request applies to.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum StimulationTarget {
    /// Every active contact on the device.
    All,
    Channel(HardwareChannelId),
}

impl StimulationTarget {
    /// Raw value expected by the device, where `-1` stops everything.
    pub fn as_device_value(self) -> i64 {
        match self {
            StimulationTarget::All => -1,
            StimulationTarget::Channel(channel) => i64::from(channel.raw()),
        }
    }
}

/// Biphasic pulse parameters for one contact.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct StimulationParameters {
    pub channel: HardwareChannelId,
    pub first_amplitude_ma: f64,
    pub first_width_ms: f64,
    pub second_amplitude_ma: f64,
    pub second_width_ms: f64,
    pub frequency_hz: f64,
    pub duration_s: f64,
    pub return_contact: ReturnContact,
}

/// Device memory slot holding a pre-recorded waveform.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct WaveformSlot(u8);

impl WaveformSlot {
    /// The single embedded slot used for sequence playback.
    pub const EMBEDDED: Self = Self(0);

    pub const fn new(raw: u8) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u8 {
        self.0
    }
}

/// Analog waveform playback request for one contact.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct AnalogStimulation {
    pub channel: HardwareChannelId,
    pub slot: WaveformSlot,
    pub repeat: i32,
    pub duration_s: f64,
    pub return_contact: ReturnContact,
}

/// Pre-recorded stimulation pattern.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AnalogWaveform {
    pub name: String,
    pub samples: Vec<i16>,
}

impl AnalogWaveform {
    pub fn new(name: impl Into<String>, samples: Vec<i16>) -> Self {
        Self {
            name: name.into(),
            samples,
        }
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }
}

/// Waveforms referenced by `StimulationIndex`, in load order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WaveformBank {
    waveforms: Vec<AnalogWaveform>,
}

impl WaveformBank {
    pub const fn new() -> Self {
        Self {
            waveforms: Vec::new(),
        }
    }

    pub fn from_waveforms(waveforms: Vec<AnalogWaveform>) -> Self {
        Self { waveforms }
    }

    pub fn push(&mut self, waveform: AnalogWaveform) {
        self.waveforms.push(waveform);
    }

    pub fn clear(&mut self) {
        self.waveforms.clear();
    }

    pub fn get(&self, index: usize) -> Option<&AnalogWaveform> {
        self.waveforms.get(index)
    }

    pub fn len(&self) -> usize {
        self.waveforms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waveforms.is_empty()
    }

    /// Waveform names in index order.
    pub fn names(&self) -> Vec<String> {
        self.waveforms.iter().map(|waveform| waveform.name.clone()).collect()
    }
}

/// Stimulation hardware as seen by the sequencer.
pub trait StimulationDevice {
    /// Error reported by the hardware; its text is shown to the operator verbatim.
    type Error: fmt::Display;

    fn set_stimulation_parameters(
        &mut self,
        parameters: &StimulationParameters,
    ) -> Result<(), Self::Error>;

    fn start_stimulation(&mut self, channel: HardwareChannelId) -> Result<(), Self::Error>;

    /// Copies `waveform` into device memory at `slot`.
    fn load_waveform(
        &mut self,
        slot: WaveformSlot,
        waveform: &AnalogWaveform,
    ) -> Result<(), Self::Error>;

    fn start_analog_stimulation(&mut self, request: &AnalogStimulation) -> Result<(), Self::Error>;

    fn stop_stimulation(&mut self, target: StimulationTarget) -> Result<(), Self::Error>;
}

/// Recording subsystem that owns the active save file.
pub trait RecordingController {
    type Error: fmt::Display;

    fn set_save_file_name(&mut self, name: &str) -> Result<(), Self::Error>;

    fn start_save(&mut self) -> Result<(), Self::Error>;

    fn stop_save(&mut self) -> Result<(), Self::Error>;

    /// Writes a free-text annotation into the active recording.
    fn send_text(&mut self, text: &str) -> Result<(), Self::Error>;
}

/// Value-level description of a single collaborator call.
#[derive(Clone, Debug, PartialEq)]
pub enum DeviceCommand {
    SetStimulationParameters(StimulationParameters),
    StartStimulation(HardwareChannelId),
    /// Loads waveform `index` from the bank into `slot`.
    LoadWaveform { index: usize, slot: WaveformSlot },
    StartAnalogStimulation(AnalogStimulation),
    StopStimulation(StimulationTarget),
    StopSave,
    SetSaveFileName(String),
    StartSave,
    SendText(String),
}

impl DeviceCommand {
    /// Returns `true` for calls handled by the [`RecordingController`].
    pub const fn is_recording(&self) -> bool {
        matches!(
            self,
            DeviceCommand::StopSave
                | DeviceCommand::SetSaveFileName(_)
                | DeviceCommand::StartSave
                | DeviceCommand::SendText(_)
        )
    }

    /// Returns `true` for analog playback starts, the only retried call.
    pub const fn is_analog_start(&self) -> bool {
        matches!(self, DeviceCommand::StartAnalogStimulation(_))
    }

    /// Name of the underlying call, used in logs and failure reports.
    pub const fn label(&self) -> &'static str {
        match self {
            DeviceCommand::SetStimulationParameters(_) => "SetStimulationParameters",
            DeviceCommand::StartStimulation(_) => "StartStimulation",
            DeviceCommand::LoadWaveform { .. } => "LoadWaveform",
            DeviceCommand::StartAnalogStimulation(_) => "StartAnalogStimulation",
            DeviceCommand::StopStimulation(_) => "StopStimulation",
            DeviceCommand::StopSave => "StopSave",
            DeviceCommand::SetSaveFileName(_) => "SetSaveFileName",
            DeviceCommand::StartSave => "StartSave",
            DeviceCommand::SendText(_) => "SendText",
        }
    }

    /// Issues the call against `device`.
    pub fn dispatch<D>(&self, device: &mut D, waveforms: &WaveformBank) -> Result<(), DeviceFailure>
    where
        D: StimulationDevice + RecordingController,
    {
        let result = match self {
            DeviceCommand::SetStimulationParameters(parameters) => device
                .set_stimulation_parameters(parameters)
                .map_err(|err| err.to_string()),
            DeviceCommand::StartStimulation(channel) => device
                .start_stimulation(*channel)
                .map_err(|err| err.to_string()),
            DeviceCommand::LoadWaveform { index, slot } => match waveforms.get(*index) {
                Some(waveform) => device
                    .load_waveform(*slot, waveform)
                    .map_err(|err| err.to_string()),
                None => Err(alloc::format!("Waveform {index} not loaded.")),
            },
            DeviceCommand::StartAnalogStimulation(request) => device
                .start_analog_stimulation(request)
                .map_err(|err| err.to_string()),
            DeviceCommand::StopStimulation(target) => device
                .stop_stimulation(*target)
                .map_err(|err| err.to_string()),
            DeviceCommand::StopSave => device.stop_save().map_err(|err| err.to_string()),
            DeviceCommand::SetSaveFileName(name) => device
                .set_save_file_name(name)
                .map_err(|err| err.to_string()),
            DeviceCommand::StartSave => device.start_save().map_err(|err| err.to_string()),
            DeviceCommand::SendText(text) => device.send_text(text).map_err(|err| err.to_string()),
        };

        result.map_err(|message| DeviceFailure {
            call: self.label(),
            recording: self.is_recording(),
            message,
        })
    }
}

/// A collaborator call that did not return OK.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceFailure {
    pub call: &'static str,
    /// `true` when the failing call went to the [`RecordingController`].
    pub recording: bool,
    pub message: String,
}

impl fmt::Display for DeviceFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl core::error::Error for DeviceFailure {}
