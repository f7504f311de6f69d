//! Stimulation sequence documents and typed phase definitions.
//!
//! A [`SequenceDocument`] keeps every phase as raw JSON until the sequencer
//! reaches it; [`validator::validate_phase`] then turns the raw value into a
//! [`StimulationPhase`] that the executor can plan device calls from. Phases
//! are never partially updated: loading a new document replaces the old one.

use alloc::string::{String, ToString};
use alloc::vec::Vec;
use core::fmt;
use core::time::Duration;

use serde_json::Value;

use crate::electrodes::{HardwareChannelId, ReturnContact};

pub mod manual;
pub mod summary;
pub mod validator;

pub use manual::{MANUAL_SEQUENCE_NAME, ManualStimulation};
pub use summary::{SummaryRow, summarize};
pub use validator::{ConfigurationError, validate_phase};

/// JSON keys understood by the sequence loader and validator.
pub mod keys {
    pub const NAME: &str = "StimulationName";
    pub const SEQUENCE: &str = "StimulationSequence";
    pub const ANALOG_WAVEFORMS: &str = "AnalogWaveforms";

    pub const TYPE: &str = "StimulationType";
    pub const LEAD: &str = "StimulationLead";
    pub const CHANNEL: &str = "StimulationChannel";
    pub const RETURN: &str = "StimulationReturn";
    pub const DURATION: &str = "Duration";
    pub const AMPLITUDE: &str = "Amplitude";
    pub const PULSE_WIDTH: &str = "Pulsewidth";
    pub const FREQUENCY: &str = "Frequency";
    pub const WAVEFORM_INDEX: &str = "StimulationIndex";
    pub const RECORDING_FILENAME: &str = "RecordingFilename";
}

/// Errors raised while importing a sequence document.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DocumentError {
    /// The text was not valid JSON.
    Json(String),
    /// The top-level value was not an object.
    NotAnObject,
    /// The document has no `StimulationName`.
    MissingName,
    /// The document has a name but no `StimulationSequence` array.
    MissingSequence,
}

impl fmt::Display for DocumentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DocumentError::Json(detail) => {
                write!(f, "Stimulation Configuration not imported ({detail})")
            }
            DocumentError::NotAnObject | DocumentError::MissingName => {
                f.write_str("Stimulation Configuration not imported")
            }
            DocumentError::MissingSequence => f.write_str("Bad Stimulation Configuration"),
        }
    }
}

impl core::error::Error for DocumentError {}

/// Immutable sequence description loaded from JSON.
#[derive(Clone, Debug, PartialEq)]
pub struct SequenceDocument {
    name: String,
    phases: Vec<Value>,
    analog_waveforms: Option<Vec<String>>,
}

impl SequenceDocument {
    /// Parses a JSON document.
    pub fn from_json(text: &str) -> Result<Self, DocumentError> {
        let value: Value =
            serde_json::from_str(text).map_err(|err| DocumentError::Json(err.to_string()))?;
        Self::from_value(value)
    }

    /// Accepts an already parsed JSON value.
    pub fn from_value(value: Value) -> Result<Self, DocumentError> {
        let Value::Object(mut object) = value else {
            return Err(DocumentError::NotAnObject);
        };

        let name = match object.remove(keys::NAME) {
            Some(Value::String(name)) => name,
            Some(other) => other.to_string(),
            None => return Err(DocumentError::MissingName),
        };

        let phases = match object.remove(keys::SEQUENCE) {
            Some(Value::Array(phases)) => phases,
            _ => return Err(DocumentError::MissingSequence),
        };

        let analog_waveforms = match object.remove(keys::ANALOG_WAVEFORMS) {
            Some(Value::Array(entries)) => Some(
                entries
                    .into_iter()
                    .filter_map(|entry| match entry {
                        Value::String(path) => Some(path),
                        _ => None,
                    })
                    .collect(),
            ),
            _ => None,
        };

        Ok(Self {
            name,
            phases,
            analog_waveforms,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Raw phase values in execution order.
    pub fn phases(&self) -> &[Value] {
        &self.phases
    }

    pub fn phase(&self, stage: usize) -> Option<&Value> {
        self.phases.get(stage)
    }

    pub fn len(&self) -> usize {
        self.phases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.phases.is_empty()
    }

    /// Waveform files listed by the document, if the list is present.
    pub fn analog_waveforms(&self) -> Option<&[String]> {
        self.analog_waveforms.as_deref()
    }

    /// Returns `true` when any phase plays back a pre-recorded waveform.
    pub fn requires_waveforms(&self) -> bool {
        self.phases.iter().any(|phase| {
            phase
                .get(keys::TYPE)
                .and_then(Value::as_str)
                .is_some_and(|kind| kind.contains(PhaseKind::Novel.label()))
        })
    }

    /// Declared duration of `stage` in seconds. Missing or unusable values count as zero.
    pub fn phase_duration(&self, stage: usize) -> f64 {
        self.phases
            .get(stage)
            .and_then(|phase| phase.get(keys::DURATION))
            .and_then(Value::as_f64)
            .filter(|seconds| *seconds > 0.0)
            .unwrap_or(0.0)
    }

    /// Start offset of `stage`: the summed durations of every earlier phase.
    pub fn phase_offset(&self, stage: usize) -> f64 {
        (0..stage.min(self.phases.len()))
            .map(|index| self.phase_duration(index))
            .sum()
    }

    /// Total length of the sequence in seconds.
    pub fn total_duration(&self) -> f64 {
        self.phase_offset(self.phases.len())
    }
}

/// Broad category of a phase.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PhaseKind {
    Standard,
    Novel,
    Baseline,
}

impl PhaseKind {
    pub const fn label(self) -> &'static str {
        match self {
            PhaseKind::Standard => "Standard",
            PhaseKind::Novel => "Novel",
            PhaseKind::Baseline => "Baseline",
        }
    }

    /// Resolves a `StimulationType` string. Novel wins over Standard when both appear.
    pub fn resolve(raw: &str) -> Option<Self> {
        if raw.contains(PhaseKind::Novel.label()) {
            Some(PhaseKind::Novel)
        } else if raw.contains(PhaseKind::Standard.label()) {
            Some(PhaseKind::Standard)
        } else if raw == PhaseKind::Baseline.label() {
            Some(PhaseKind::Baseline)
        } else {
            None
        }
    }

    pub const fn as_raw(self) -> u8 {
        match self {
            PhaseKind::Standard => 0,
            PhaseKind::Novel => 1,
            PhaseKind::Baseline => 2,
        }
    }

    pub const fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(PhaseKind::Standard),
            1 => Some(PhaseKind::Novel),
            2 => Some(PhaseKind::Baseline),
            _ => None,
        }
    }
}

impl fmt::Display for PhaseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Recharge sub-phase derived from a pulse train.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct ChargeBalance {
    pub recharge_pulse_ms: f64,
    pub recharge_amplitude_ma: f64,
}

/// Parametric pulse train for a Standard phase.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct PulseTrain {
    pub amplitude_ma: f64,
    pub pulse_width_us: f64,
    pub frequency_hz: f64,
}

impl PulseTrain {
    pub const fn new(amplitude_ma: f64, pulse_width_us: f64, frequency_hz: f64) -> Self {
        Self {
            amplitude_ma,
            pulse_width_us,
            frequency_hz,
        }
    }

    /// Pulse width in the device's millisecond unit.
    pub fn pulse_width_ms(&self) -> f64 {
        self.pulse_width_us / 1000.0
    }

    /// Recharge window that removes the charge injected by one pulse.
    ///
    /// The window spans 90% of the period minus the pulse itself. Returns
    /// `None` when nothing is left for recharge.
    pub fn charge_balance(&self) -> Option<ChargeBalance> {
        if self.frequency_hz <= 0.0 {
            return None;
        }

        let pulse_ms = self.pulse_width_ms();
        let recharge_pulse_ms = 900.0 / self.frequency_hz - pulse_ms;
        if recharge_pulse_ms <= 0.0 {
            return None;
        }

        Some(ChargeBalance {
            recharge_pulse_ms,
            recharge_amplitude_ma: self.amplitude_ma * pulse_ms / recharge_pulse_ms,
        })
    }
}

/// What a phase asks the device to do.
#[derive(Clone, Debug, PartialEq)]
pub enum Stimulus {
    Baseline,
    Standard(PulseTrain),
    Novel { waveform_index: usize },
}

impl Stimulus {
    pub const fn kind(&self) -> PhaseKind {
        match self {
            Stimulus::Baseline => PhaseKind::Baseline,
            Stimulus::Standard(_) => PhaseKind::Standard,
            Stimulus::Novel { .. } => PhaseKind::Novel,
        }
    }
}

/// Validated phase ready for execution.
#[derive(Clone, Debug, PartialEq)]
pub struct StimulationPhase {
    pub stimulus: Stimulus,
    pub lead: usize,
    pub contacts: Vec<usize>,
    pub channels: Vec<HardwareChannelId>,
    pub return_contact: ReturnContact,
    pub duration_s: f64,
    pub recording_filename: Option<String>,
}

impl StimulationPhase {
    pub const fn kind(&self) -> PhaseKind {
        self.stimulus.kind()
    }

    pub fn duration(&self) -> Duration {
        Duration::try_from_secs_f64(self.duration_s).unwrap_or(Duration::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCENARIO_A: &str = r#"{
        "StimulationName": "Scenario A",
        "StimulationSequence": [
            {"StimulationType": "Baseline", "StimulationLead": 0, "StimulationChannel": [0],
             "StimulationReturn": -1, "Duration": 5},
            {"StimulationType": "Standard", "StimulationLead": 0, "StimulationChannel": [0, 1],
             "StimulationReturn": -1, "Duration": 10, "Amplitude": 3, "Pulsewidth": 60,
             "Frequency": 130, "RecordingFilename": "A"}
        ]
    }"#;

    #[test]
    fn parses_name_and_phases() {
        let document = SequenceDocument::from_json(SCENARIO_A).expect("valid document");
        assert_eq!(document.name(), "Scenario A");
        assert_eq!(document.len(), 2);
        assert!(document.analog_waveforms().is_none());
        assert!(!document.requires_waveforms());
    }

    #[test]
    fn offsets_are_prefix_sums() {
        let document = SequenceDocument::from_json(SCENARIO_A).expect("valid document");
        assert_eq!(document.phase_offset(0), 0.0);
        assert_eq!(document.phase_offset(1), 5.0);
        assert_eq!(document.total_duration(), 15.0);
        assert_eq!(document.phase_offset(10), 15.0);
    }

    #[test]
    fn missing_name_is_not_imported() {
        let err = SequenceDocument::from_json(r#"{"StimulationSequence": []}"#)
            .expect_err("name is required");
        assert_eq!(err, DocumentError::MissingName);
        assert_eq!(err.to_string(), "Stimulation Configuration not imported");
    }

    #[test]
    fn missing_sequence_is_rejected_after_name() {
        let err = SequenceDocument::from_json(r#"{"StimulationName": "x"}"#)
            .expect_err("sequence is required");
        assert_eq!(err, DocumentError::MissingSequence);
        assert_eq!(err.to_string(), "Bad Stimulation Configuration");
    }

    #[test]
    fn scalar_documents_are_rejected() {
        assert_eq!(
            SequenceDocument::from_json("[1, 2]"),
            Err(DocumentError::NotAnObject)
        );
        assert!(matches!(
            SequenceDocument::from_json("{"),
            Err(DocumentError::Json(_))
        ));
    }

    #[test]
    fn novel_phases_require_waveforms() {
        let document = SequenceDocument::from_json(
            r#"{"StimulationName": "n", "AnalogWaveforms": ["Burst135.bin"],
                "StimulationSequence": [{"StimulationType": "Novel Burst"}]}"#,
        )
        .expect("valid document");
        assert!(document.requires_waveforms());
        assert_eq!(document.analog_waveforms(), Some(&[String::from("Burst135.bin")][..]));
    }

    #[test]
    fn type_resolution_prefers_novel() {
        assert_eq!(PhaseKind::resolve("Novel Standard"), Some(PhaseKind::Novel));
        assert_eq!(PhaseKind::resolve("Standard DBS"), Some(PhaseKind::Standard));
        assert_eq!(PhaseKind::resolve("Baseline"), Some(PhaseKind::Baseline));
        assert_eq!(PhaseKind::resolve("Baseline rest"), None);
    }

    #[test]
    fn charge_balance_matches_injected_charge() {
        let train = PulseTrain::new(3.0, 60.0, 130.0);
        let balance = train.charge_balance().expect("recharge window exists");
        let injected = train.amplitude_ma * train.pulse_width_ms();
        let removed = balance.recharge_amplitude_ma * balance.recharge_pulse_ms;
        let drift = (injected - removed) / injected;
        assert!(drift < 1e-6 && drift > -1e-6);
    }

    #[test]
    fn wide_pulses_leave_no_recharge_window() {
        assert!(PulseTrain::new(1.0, 8000.0, 130.0).charge_balance().is_none());
        assert!(PulseTrain::new(1.0, 60.0, 0.0).charge_balance().is_none());
    }
}
