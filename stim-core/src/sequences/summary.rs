//! Operator-facing table of a loaded sequence.

use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;
use core::fmt::Write;

use serde_json::Value;

use super::{PhaseKind, SequenceDocument, keys};
use crate::electrodes::ElectrodeConfiguration;

/// Lead value that means "whatever lead the console has selected".
pub const SELECTED_LEAD: i64 = -1;

/// One rendered row of the sequence table.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SummaryRow {
    pub kind: String,
    pub recording_filename: String,
    pub duration: String,
    pub lead: String,
    pub contacts: String,
    pub amplitude: String,
    pub pulse_width: String,
    pub frequency: String,
}

impl SummaryRow {
    /// Formats the row as a single space-separated line, skipping empty cells.
    pub fn to_line(&self) -> String {
        let cells = [
            &self.kind,
            &self.recording_filename,
            &self.duration,
            &self.lead,
            &self.contacts,
            &self.amplitude,
            &self.pulse_width,
            &self.frequency,
        ];

        let mut line = String::new();
        for cell in cells.into_iter().filter(|cell| !cell.is_empty()) {
            if !line.is_empty() {
                line.push_str(" | ");
            }
            line.push_str(cell);
        }
        line
    }
}

/// Renders every phase of `document`.
///
/// Rows are produced even for phases that would fail validation so the
/// operator can see what the file says before starting a run.
pub fn summarize(
    document: &SequenceDocument,
    electrodes: &ElectrodeConfiguration,
    waveform_names: &[String],
    selected_lead: usize,
) -> Vec<SummaryRow> {
    document
        .phases()
        .iter()
        .map(|phase| summarize_phase(phase, electrodes, waveform_names, selected_lead))
        .collect()
}

fn summarize_phase(
    phase: &Value,
    electrodes: &ElectrodeConfiguration,
    waveform_names: &[String],
    selected_lead: usize,
) -> SummaryRow {
    let raw_kind = phase.get(keys::TYPE).and_then(Value::as_str).unwrap_or("?");
    let kind = PhaseKind::resolve(raw_kind);

    let mut row = SummaryRow {
        kind: String::from(raw_kind),
        recording_filename: phase
            .get(keys::RECORDING_FILENAME)
            .and_then(Value::as_str)
            .map(String::from)
            .unwrap_or_default(),
        duration: format!("{} sec", number_text(phase.get(keys::DURATION))),
        ..SummaryRow::default()
    };

    if kind == Some(PhaseKind::Novel)
        && let Some(name) = phase
            .get(keys::WAVEFORM_INDEX)
            .and_then(Value::as_u64)
            .and_then(|index| usize::try_from(index).ok())
            .and_then(|index| waveform_names.get(index))
    {
        row.kind = name.clone();
    }

    if kind == Some(PhaseKind::Baseline) {
        return row;
    }

    let lead_index = phase.get(keys::LEAD).and_then(Value::as_i64);
    row.lead = match lead_index {
        Some(SELECTED_LEAD) => lead_label(electrodes, selected_lead),
        Some(index) => usize::try_from(index)
            .map(|index| lead_label(electrodes, index))
            .unwrap_or_else(|_| String::from("?")),
        None => String::from("?"),
    };

    let mut contacts = String::new();
    if let Some(entries) = phase.get(keys::CHANNEL).and_then(Value::as_array) {
        for entry in entries {
            let _ = write!(contacts, "-E{} ", number_text(Some(entry)));
        }
    }
    match phase.get(keys::RETURN).and_then(Value::as_i64) {
        Some(index) if index >= 0 => {
            let _ = write!(contacts, "+E{index}");
        }
        _ => contacts.push_str("+CAN"),
    }
    row.contacts = contacts;

    if kind == Some(PhaseKind::Standard) {
        row.amplitude = format!("{} mA", number_text(phase.get(keys::AMPLITUDE)));
        row.pulse_width = format!("{} uS", number_text(phase.get(keys::PULSE_WIDTH)));
        row.frequency = format!("{} Hz", number_text(phase.get(keys::FREQUENCY)));
    }

    row
}

fn lead_label(electrodes: &ElectrodeConfiguration, index: usize) -> String {
    match electrodes.lead(index) {
        Some(lead) if lead.is_connected() => {
            format!("L{} {} {}", index + 1, lead.hemisphere, lead.target)
        }
        Some(_) => format!("L{} (not connected)", index + 1),
        None => format!("L{} (missing)", index + 1),
    }
}

fn number_text(value: Option<&Value>) -> String {
    match value {
        Some(Value::Number(number)) => format!("{number}"),
        Some(Value::String(text)) => text.clone(),
        _ => String::from("?"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::electrodes::{HardwareChannelId, LeadConfiguration};
    use alloc::vec;

    fn electrodes() -> ElectrodeConfiguration {
        let left = LeadConfiguration::new(
            "Medtronic 3389",
            "Left",
            "STN",
            (1..=4).map(HardwareChannelId::new).collect(),
        );
        let right = LeadConfiguration::new(
            "Medtronic 3389",
            "Right",
            "STN",
            (5..=8).map(HardwareChannelId::new).collect(),
        );
        ElectrodeConfiguration::from_leads(vec![left, right]).expect("two leads fit")
    }

    fn document() -> SequenceDocument {
        SequenceDocument::from_json(
            r#"{
                "StimulationName": "Summary",
                "AnalogWaveforms": ["BurstStim/Burst135.bin"],
                "StimulationSequence": [
                    {"StimulationType": "Baseline", "RecordingFilename": "Baseline",
                     "StimulationLead": 0, "StimulationChannel": [0],
                     "StimulationReturn": -1, "Duration": 30},
                    {"StimulationType": "Standard", "RecordingFilename": "EP",
                     "StimulationLead": -1, "StimulationChannel": [0, 1],
                     "StimulationReturn": 3, "Duration": 10, "Amplitude": 2.5,
                     "Pulsewidth": 90, "Frequency": 10},
                    {"StimulationType": "Novel", "RecordingFilename": "ERNA",
                     "StimulationLead": 0, "StimulationChannel": [2],
                     "StimulationReturn": -1, "Duration": 10, "StimulationIndex": 0}
                ]
            }"#,
        )
        .expect("valid document")
    }

    #[test]
    fn baseline_rows_skip_stimulation_columns() {
        let rows = summarize(&document(), &electrodes(), &[], 0);
        assert_eq!(rows[0].to_line(), "Baseline | Baseline | 30 sec");
    }

    #[test]
    fn selected_lead_is_substituted() {
        let rows = summarize(&document(), &electrodes(), &[], 1);
        let row = &rows[1];
        assert_eq!(row.lead, "L2 Right STN");
        assert_eq!(row.contacts, "-E0 -E1 +E3");
        assert_eq!(row.amplitude, "2.5 mA");
        assert_eq!(row.pulse_width, "90 uS");
        assert_eq!(row.frequency, "10 Hz");
    }

    #[test]
    fn novel_rows_show_waveform_name() {
        let names = vec![String::from("Burst135")];
        let rows = summarize(&document(), &electrodes(), &names, 0);
        assert_eq!(rows[2].kind, "Burst135");
        assert_eq!(rows[2].contacts, "-E2 +CAN");
        assert!(rows[2].amplitude.is_empty());
    }
}
