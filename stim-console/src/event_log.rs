use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use chrono::Local;
use serde_json::{Map, Value, json};
use stim_core::device::WaveformBank;
use stim_core::electrodes::{ElectrodeConfiguration, ReturnContact};
use stim_core::executor::StimulationOptions;
use stim_core::sequences::{StimulationPhase, Stimulus};

/// Wall-clock format of the `Time` field.
pub const TIME_FORMAT: &str = "%Y/%m/%d %H:%M:%S";

/// Surgical event log persisted as a pretty-printed JSON array.
#[derive(Debug)]
pub struct EventLog {
    path: PathBuf,
    entries: Vec<Value>,
}

impl EventLog {
    /// Opens `path`, keeping any entries already stored there.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let entries = if path.is_file() {
            let text = fs::read_to_string(&path)
                .with_context(|| format!("failed to read event log {}", path.display()))?;
            match serde_json::from_str(&text)
                .with_context(|| format!("event log {} is not JSON", path.display()))?
            {
                Value::Array(entries) => entries,
                _ => bail!("event log {} is not a JSON array", path.display()),
            }
        } else {
            Vec::new()
        };

        Ok(Self { path, entries })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn entries(&self) -> &[Value] {
        &self.entries
    }

    pub fn add_object(&mut self, object: Map<String, Value>) {
        self.entries.push(Value::Object(object));
    }

    /// Appends `{ key: value, "Time": now }`.
    pub fn add_object_timestamp(&mut self, key: &str, value: &str) {
        let mut object = Map::new();
        object.insert(String::from(key), Value::from(value));
        object.insert(String::from("Time"), Value::from(timestamp()));
        self.add_object(object);
    }

    /// Logs a phase start as `StimulationOn` or `Novel Stimulation`.
    pub fn add_phase_start(
        &mut self,
        phase: &StimulationPhase,
        electrodes: &ElectrodeConfiguration,
        waveforms: &WaveformBank,
        options: StimulationOptions,
    ) {
        let mut object = Map::new();
        match &phase.stimulus {
            Stimulus::Baseline => return,
            Stimulus::Standard(train) => {
                object.insert(String::from("ObjectType"), json!("StimulationOn"));
                object.insert(String::from("Frequency"), json!(train.frequency_hz));
                object.insert(
                    String::from("Amplitude"),
                    json!(options.polarity.leading_sign() * train.amplitude_ma),
                );
                object.insert(String::from("PulseWidth"), json!(train.pulse_width_ms()));
            }
            Stimulus::Novel { waveform_index } => {
                object.insert(String::from("ObjectType"), json!("Novel Stimulation"));
                let name = waveforms
                    .get(*waveform_index)
                    .map_or("", |waveform| waveform.name.as_str());
                object.insert(String::from("WaveName"), json!(name));
            }
        }

        let lead = electrodes.lead(phase.lead);
        let contact_names: Vec<Value> = phase
            .contacts
            .iter()
            .map(|contact| {
                lead.map_or_else(
                    || Value::from(contact.to_string()),
                    |lead| Value::from(lead.channel_name(phase.lead, *contact)),
                )
            })
            .collect();
        let channels: Vec<u32> = phase.channels.iter().map(|channel| channel.raw()).collect();
        object.insert(String::from("StimulationContacts"), Value::from(contact_names));
        object.insert(String::from("StimulationChannels"), json!(channels));
        object.insert(
            String::from("StimulationReturn"),
            match phase.return_contact {
                ReturnContact::GlobalCan => json!("CAN"),
                ReturnContact::Channel(channel) => json!(channel.raw()),
            },
        );
        object.insert(String::from("Duration"), json!(phase.duration_s));
        object.insert(String::from("Time"), Value::from(timestamp()));
        self.add_object(object);
    }

    pub fn add_stimulation_off(&mut self) {
        self.add_object_timestamp("ObjectType", "StimulationOff");
    }

    /// Logs an annotation that reached the recorder.
    pub fn add_label(&mut self, text: &str) {
        let mut object = Map::new();
        object.insert(String::from("ObjectType"), json!("Label"));
        object.insert(String::from("LabelText"), Value::from(text));
        object.insert(String::from("Time"), Value::from(timestamp()));
        self.add_object(object);
    }

    /// Rewrites the whole file.
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let text = serde_json::to_string_pretty(&self.entries)?;
        fs::write(&self.path, text)
            .with_context(|| format!("failed to write event log {}", self.path.display()))
    }
}

fn timestamp() -> String {
    Local::now().format(TIME_FORMAT).to_string()
}
