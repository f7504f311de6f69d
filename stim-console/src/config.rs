use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde::Deserialize;
use stim_core::electrodes::{ElectrodeConfiguration, LeadConfiguration};
use stim_core::executor::{PolarityConvention, RechargeMode, StimulationOptions};
use stim_core::orchestrator::{AnalogRetryPolicy, DEFAULT_ANALOG_RETRY_WINDOW, DEFAULT_TICK_INTERVAL};

pub const DEFAULT_CONFIG_PATH: &str = "stim-console.toml";

/// Operator console settings loaded from `stim-console.toml`.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConsoleConfig {
    pub session: SessionConfig,
    pub stimulation: StimulationConfig,
    pub paths: PathsConfig,
    /// Up to four leads; missing slots are left disconnected.
    pub leads: Vec<LeadConfiguration>,
    pub device: DeviceConfig,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionConfig {
    pub patient_id: String,
    pub diagnosis: String,
    /// Lead shown for phases that use `StimulationLead = -1`.
    pub selected_lead: usize,
}

impl SessionConfig {
    /// `yyyyMMdd_<diagnosis>_<patientID>`, or empty when the session is anonymous.
    pub fn recording_prefix(&self, date: NaiveDate) -> String {
        if self.patient_id.is_empty() && self.diagnosis.is_empty() {
            return String::new();
        }
        format!(
            "{}_{}_{}",
            date.format("%Y%m%d"),
            self.diagnosis,
            self.patient_id
        )
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StimulationConfig {
    pub polarity: PolarityConvention,
    pub recharge: RechargeMode,
    pub retry_window_ms: u64,
    pub tick_interval_ms: u64,
}

impl Default for StimulationConfig {
    fn default() -> Self {
        Self {
            polarity: PolarityConvention::default(),
            recharge: RechargeMode::default(),
            retry_window_ms: millis(DEFAULT_ANALOG_RETRY_WINDOW),
            tick_interval_ms: millis(DEFAULT_TICK_INTERVAL),
        }
    }
}

impl StimulationConfig {
    pub fn options(&self) -> StimulationOptions {
        StimulationOptions::new(self.polarity, self.recharge)
    }

    pub fn retry_policy(&self) -> AnalogRetryPolicy {
        AnalogRetryPolicy::new(Duration::from_millis(self.retry_window_ms))
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PathsConfig {
    /// Directory searched by `load <name>`; waveform files resolve against it.
    pub sequence_dir: PathBuf,
    pub event_log: PathBuf,
    /// Plain-text side-effect notes, appended across sessions.
    pub notes: PathBuf,
    pub transcript: Option<PathBuf>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            sequence_dir: PathBuf::from("sequences"),
            event_log: PathBuf::from("stim-events.json"),
            notes: PathBuf::from("side-effect-notes.txt"),
            transcript: None,
        }
    }
}

/// Failure injection for the simulated device.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DeviceConfig {
    pub failures: Vec<InjectedFailure>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InjectedFailure {
    /// Device call name, e.g. `StartAnalogStimulation`.
    pub call: String,
    #[serde(default = "InjectedFailure::default_times")]
    pub times: usize,
    #[serde(default = "InjectedFailure::default_message")]
    pub message: String,
}

impl InjectedFailure {
    fn default_times() -> usize {
        1
    }

    fn default_message() -> String {
        String::from("Device busy")
    }
}

impl ConsoleConfig {
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).context("invalid console configuration")
    }

    /// Reads `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        match fs::read_to_string(path) {
            Ok(text) => Self::from_toml(&text)
                .with_context(|| format!("failed to parse {}", path.display())),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                log::warn!("config: {} not found, using defaults", path.display());
                Ok(Self::default())
            }
            Err(err) => Err(err).with_context(|| format!("failed to read {}", path.display())),
        }
    }

    /// Builds and verifies the electrode map.
    pub fn electrodes(&self) -> Result<ElectrodeConfiguration> {
        let electrodes = ElectrodeConfiguration::from_leads(self.leads.clone())
            .map_err(|err| anyhow::anyhow!("{err}"))?;
        electrodes
            .verify()
            .map_err(|err| anyhow::anyhow!("{err}"))
            .context("electrode configuration rejected")?;
        Ok(electrodes)
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[session]
patient_id = "P001"
diagnosis = "PD"
selected_lead = 1

[stimulation]
polarity = "inverted"
recharge = "passive"
retry_window_ms = 2000

[paths]
sequence_dir = "protocols"

[[leads]]
electrode_type = "BSci Vercise"
hemisphere = "Left"
target = "STN"
num_contacts = 8
channel_ids = [10272, 10273, 10274, 10275, 10276, 10277, 10278, 10279]

[[device.failures]]
call = "StartAnalogStimulation"
times = 3
"#;

    #[test]
    fn parses_every_section() {
        let config = ConsoleConfig::from_toml(SAMPLE).expect("sample parses");

        assert_eq!(config.session.selected_lead, 1);
        assert_eq!(
            config.stimulation.options(),
            StimulationOptions::new(PolarityConvention::Inverted, RechargeMode::Passive)
        );
        assert_eq!(config.stimulation.retry_policy().window(), Duration::from_secs(2));
        assert_eq!(config.stimulation.tick_interval(), DEFAULT_TICK_INTERVAL);
        assert_eq!(config.paths.sequence_dir, PathBuf::from("protocols"));
        assert_eq!(config.paths.event_log, PathBuf::from("stim-events.json"));
        assert_eq!(config.paths.notes, PathBuf::from("side-effect-notes.txt"));
        assert_eq!(config.device.failures[0].times, 3);
        assert_eq!(config.device.failures[0].message, "Device busy");

        let electrodes = config.electrodes().expect("map verifies");
        assert!(electrodes.lead(0).is_some_and(LeadConfiguration::is_connected));
        assert!(!electrodes.lead(3).is_some_and(LeadConfiguration::is_connected));
    }

    #[test]
    fn empty_file_is_all_defaults() {
        let config = ConsoleConfig::from_toml("").expect("empty parses");
        assert_eq!(config.stimulation.retry_policy(), AnalogRetryPolicy::default());
        assert!(config.electrodes().expect("four empty leads").iter().all(|lead| !lead.is_connected()));
    }

    #[test]
    fn duplicate_channels_are_rejected() {
        let text = r#"
[[leads]]
electrode_type = "Medtronic 3389"
num_contacts = 2
channel_ids = [10272, 10273]

[[leads]]
electrode_type = "Medtronic 3389"
num_contacts = 2
channel_ids = [10273, 10274]
"#;
        let config = ConsoleConfig::from_toml(text).expect("parses");
        let err = config.electrodes().expect_err("channel reused");
        assert!(format!("{err:#}").contains("Electrode #2 Channels found previously defined channel (10273)."));
    }

    #[test]
    fn unknown_keys_are_errors() {
        assert!(ConsoleConfig::from_toml("[session]\npatient = \"P001\"\n").is_err());
    }

    #[test]
    fn prefix_follows_session_information() {
        let date = NaiveDate::from_ymd_opt(2024, 1, 5).expect("valid date");
        let session = SessionConfig {
            patient_id: String::from("P001"),
            diagnosis: String::from("PD"),
            selected_lead: 0,
        };
        assert_eq!(session.recording_prefix(date), "20240105_PD_P001");
        assert_eq!(SessionConfig::default().recording_prefix(date), "");
    }

    #[test]
    fn missing_file_uses_defaults() {
        let path = std::env::temp_dir().join("stim-console-missing-config.toml");
        let _ = fs::remove_file(&path);
        let config = ConsoleConfig::load(&path).expect("defaults");
        assert!(config.leads.is_empty());
    }
}
