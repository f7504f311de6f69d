use std::collections::BTreeSet;
use std::fmt;

use stim_core::device::{
    AnalogStimulation, AnalogWaveform, RecordingController, StimulationDevice,
    StimulationParameters, StimulationTarget, WaveformSlot,
};
use stim_core::electrodes::HardwareChannelId;

use crate::config::InjectedFailure;

/// Error text returned by the simulated hardware.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceError(pub String);

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for DeviceError {}

/// In-process stand-in for the stimulator and its recorder.
///
/// Every call is appended to [`SimulatedDevice::calls`] in a readable form.
#[derive(Debug, Default)]
pub struct SimulatedDevice {
    calls: Vec<String>,
    failures: Vec<InjectedFailure>,
    programmed: BTreeSet<HardwareChannelId>,
    active: BTreeSet<HardwareChannelId>,
    loaded: Option<(WaveformSlot, String)>,
    save_file: Option<String>,
    saving: bool,
    labels: Vec<String>,
}

impl SimulatedDevice {
    pub fn new(failures: Vec<InjectedFailure>) -> Self {
        Self {
            failures,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> &[String] {
        &self.calls
    }

    pub fn active_channels(&self) -> impl Iterator<Item = HardwareChannelId> + '_ {
        self.active.iter().copied()
    }

    pub fn is_saving(&self) -> bool {
        self.saving
    }

    pub fn save_file(&self) -> Option<&str> {
        self.save_file.as_deref()
    }

    /// Annotations written into the recording, oldest first.
    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    fn call(&mut self, name: &'static str, detail: String) -> Result<(), DeviceError> {
        self.calls.push(format!("{name}({detail})"));
        match self
            .failures
            .iter_mut()
            .find(|failure| failure.call == name && failure.times > 0)
        {
            Some(failure) => {
                failure.times -= 1;
                log::debug!("device: injected failure for {name}: {}", failure.message);
                Err(DeviceError(failure.message.clone()))
            }
            None => Ok(()),
        }
    }
}

impl StimulationDevice for SimulatedDevice {
    type Error = DeviceError;

    fn set_stimulation_parameters(
        &mut self,
        parameters: &StimulationParameters,
    ) -> Result<(), Self::Error> {
        self.call(
            "SetStimulationParameters",
            format!(
                "{:.3}mA/{:.3}ms, {:.3}mA/{:.3}ms, {}Hz, {}s, return={}, channel={}",
                parameters.first_amplitude_ma,
                parameters.first_width_ms,
                parameters.second_amplitude_ma,
                parameters.second_width_ms,
                parameters.frequency_hz,
                parameters.duration_s,
                parameters.return_contact.as_device_value(),
                parameters.channel
            ),
        )?;
        self.programmed.insert(parameters.channel);
        Ok(())
    }

    fn start_stimulation(&mut self, channel: HardwareChannelId) -> Result<(), Self::Error> {
        self.call("StartStimulation", channel.to_string())?;
        if !self.programmed.contains(&channel) {
            return Err(DeviceError(format!("Channel {channel} not configured")));
        }
        self.active.insert(channel);
        Ok(())
    }

    fn load_waveform(
        &mut self,
        slot: WaveformSlot,
        waveform: &AnalogWaveform,
    ) -> Result<(), Self::Error> {
        self.call(
            "LoadWaveform",
            format!(
                "slot={}, {} ({} samples)",
                slot.raw(),
                waveform.name,
                waveform.sample_count()
            ),
        )?;
        self.loaded = Some((slot, waveform.name.clone()));
        Ok(())
    }

    fn start_analog_stimulation(&mut self, request: &AnalogStimulation) -> Result<(), Self::Error> {
        self.call(
            "StartAnalogStimulation",
            format!(
                "channel={}, slot={}, repeat={}, {}s, return={}",
                request.channel,
                request.slot.raw(),
                request.repeat,
                request.duration_s,
                request.return_contact.as_device_value()
            ),
        )?;
        if self.loaded.as_ref().is_none_or(|(slot, _)| *slot != request.slot) {
            return Err(DeviceError(format!(
                "Waveform slot {} empty",
                request.slot.raw()
            )));
        }
        self.active.insert(request.channel);
        Ok(())
    }

    fn stop_stimulation(&mut self, target: StimulationTarget) -> Result<(), Self::Error> {
        self.call("StopStimulation", target.as_device_value().to_string())?;
        match target {
            StimulationTarget::All => self.active.clear(),
            StimulationTarget::Channel(channel) => {
                self.active.remove(&channel);
            }
        }
        Ok(())
    }
}

impl RecordingController for SimulatedDevice {
    type Error = DeviceError;

    fn set_save_file_name(&mut self, name: &str) -> Result<(), Self::Error> {
        self.call("SetSaveFileName", name.to_string())?;
        self.save_file = Some(name.to_string());
        Ok(())
    }

    fn start_save(&mut self) -> Result<(), Self::Error> {
        self.call("StartSave", String::new())?;
        self.saving = true;
        Ok(())
    }

    fn stop_save(&mut self) -> Result<(), Self::Error> {
        self.call("StopSave", String::new())?;
        self.saving = false;
        Ok(())
    }

    fn send_text(&mut self, text: &str) -> Result<(), Self::Error> {
        self.call("SendText", text.to_string())?;
        self.labels.push(text.to_string());
        Ok(())
    }
}
