//! Structural and referential checks applied when a phase is entered.
//!
//! Checks short-circuit on the first failure. The order matters to the
//! operator: a phase missing its lead index is reported as missing fields,
//! never as an out-of-range lead.

use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;

use serde_json::{Map, Value};

use super::{PhaseKind, PulseTrain, StimulationPhase, Stimulus, keys};
use crate::electrodes::{ElectrodeConfiguration, LeadConfiguration};

const REQUIRED_FIELDS: [&str; 5] = [
    keys::TYPE,
    keys::LEAD,
    keys::CHANNEL,
    keys::RETURN,
    keys::DURATION,
];

const STANDARD_FIELDS: [&str; 3] = [keys::AMPLITUDE, keys::PULSE_WIDTH, keys::FREQUENCY];

/// Reasons a phase is rejected before any device call is issued.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConfigurationError {
    NotAnObject,
    MissingRequiredFields,
    MalformedField(&'static str),
    UnknownStimulationType,
    /// Lead index outside the configured slots; stored 1-based for display.
    LeadOutOfRange { lead_number: i64 },
    LeadNotConnected { lead_number: usize },
    BadReturn { index: i64 },
    BadContact { index: i64 },
    NoContacts,
    MissingStandardFields,
    NoRechargeWindow,
    MissingNovelFields,
    WaveformNotLoaded { index: i64 },
}

impl fmt::Display for ConfigurationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigurationError::NotAnObject => f.write_str("Sequence is not a structured object."),
            ConfigurationError::MissingRequiredFields => f.write_str("Missing required fields."),
            ConfigurationError::MalformedField(name) => write!(f, "Malformed field {name}."),
            ConfigurationError::UnknownStimulationType => f.write_str("Unknown stimulation type."),
            ConfigurationError::LeadOutOfRange { lead_number } => {
                write!(f, "Lead # {lead_number} Not Exist")
            }
            ConfigurationError::LeadNotConnected { .. } => f.write_str("Lead not connected."),
            ConfigurationError::BadReturn { .. }
            | ConfigurationError::BadContact { .. }
            | ConfigurationError::NoContacts => f.write_str("Bad contacts."),
            ConfigurationError::MissingStandardFields => {
                f.write_str("Missing standard-stim fields.")
            }
            ConfigurationError::NoRechargeWindow => {
                f.write_str("Pulse width leaves no recharge window.")
            }
            ConfigurationError::MissingNovelFields => f.write_str("Missing novel-stim fields."),
            ConfigurationError::WaveformNotLoaded { index } => {
                write!(f, "Waveform {index} not loaded.")
            }
        }
    }
}

impl core::error::Error for ConfigurationError {}

/// Validates one raw phase against the electrode map and loaded waveforms.
pub fn validate_phase(
    value: &Value,
    electrodes: &ElectrodeConfiguration,
    loaded_waveforms: usize,
) -> Result<StimulationPhase, ConfigurationError> {
    let Some(object) = value.as_object() else {
        return Err(ConfigurationError::NotAnObject);
    };

    if REQUIRED_FIELDS.iter().any(|key| !object.contains_key(*key)) {
        return Err(ConfigurationError::MissingRequiredFields);
    }

    let kind_text = string_field(object, keys::TYPE)?;
    let lead_index = integer_field(object, keys::LEAD)?;
    let contact_indices = integer_list_field(object, keys::CHANNEL)?;
    let return_index = integer_field(object, keys::RETURN)?;
    let duration_s = non_negative_field(object, keys::DURATION)?;
    let recording_filename = match object.get(keys::RECORDING_FILENAME) {
        None | Some(Value::Null) => None,
        Some(Value::String(name)) => Some(name.clone()),
        Some(_) => return Err(ConfigurationError::MalformedField(keys::RECORDING_FILENAME)),
    };
    let kind = PhaseKind::resolve(kind_text).ok_or(ConfigurationError::UnknownStimulationType)?;

    let (lead, lead_slot) = resolve_lead(electrodes, lead_index)?;

    let return_contact = lead
        .resolve_return(return_index)
        .ok_or(ConfigurationError::BadReturn {
            index: return_index,
        })?;

    let mut contacts = Vec::with_capacity(contact_indices.len());
    let mut channels = Vec::with_capacity(contact_indices.len());
    for index in contact_indices {
        let channel = usize::try_from(index)
            .ok()
            .and_then(|contact| lead.channel(contact).map(|channel| (contact, channel)))
            .ok_or(ConfigurationError::BadContact { index })?;
        contacts.push(channel.0);
        channels.push(channel.1);
    }

    let stimulus = match kind {
        PhaseKind::Baseline => Stimulus::Baseline,
        PhaseKind::Standard => {
            if STANDARD_FIELDS.iter().any(|key| !object.contains_key(*key)) {
                return Err(ConfigurationError::MissingStandardFields);
            }
            let train = PulseTrain::new(
                non_negative_field(object, keys::AMPLITUDE)?,
                positive_field(object, keys::PULSE_WIDTH)?,
                positive_field(object, keys::FREQUENCY)?,
            );
            if train.charge_balance().is_none() {
                return Err(ConfigurationError::NoRechargeWindow);
            }
            Stimulus::Standard(train)
        }
        PhaseKind::Novel => {
            if !object.contains_key(keys::WAVEFORM_INDEX) {
                return Err(ConfigurationError::MissingNovelFields);
            }
            let index = integer_field(object, keys::WAVEFORM_INDEX)?;
            let waveform_index = usize::try_from(index)
                .ok()
                .filter(|slot| *slot < loaded_waveforms)
                .ok_or(ConfigurationError::WaveformNotLoaded { index })?;
            Stimulus::Novel { waveform_index }
        }
    };

    if kind != PhaseKind::Baseline && contacts.is_empty() {
        return Err(ConfigurationError::NoContacts);
    }

    Ok(StimulationPhase {
        stimulus,
        lead: lead_slot,
        contacts,
        channels,
        return_contact,
        duration_s,
        recording_filename,
    })
}

fn resolve_lead(
    electrodes: &ElectrodeConfiguration,
    index: i64,
) -> Result<(&LeadConfiguration, usize), ConfigurationError> {
    let out_of_range = ConfigurationError::LeadOutOfRange {
        lead_number: index.saturating_add(1),
    };
    let slot = usize::try_from(index).map_err(|_| out_of_range.clone())?;
    let lead = electrodes.lead(slot).ok_or(out_of_range)?;

    if !lead.is_connected() {
        return Err(ConfigurationError::LeadNotConnected {
            lead_number: slot + 1,
        });
    }
    Ok((lead, slot))
}

fn string_field<'a>(
    object: &'a Map<String, Value>,
    key: &'static str,
) -> Result<&'a str, ConfigurationError> {
    object
        .get(key)
        .and_then(Value::as_str)
        .ok_or(ConfigurationError::MalformedField(key))
}

fn integer_field(object: &Map<String, Value>, key: &'static str) -> Result<i64, ConfigurationError> {
    object
        .get(key)
        .and_then(Value::as_i64)
        .ok_or(ConfigurationError::MalformedField(key))
}

fn integer_list_field(
    object: &Map<String, Value>,
    key: &'static str,
) -> Result<Vec<i64>, ConfigurationError> {
    let entries = object
        .get(key)
        .and_then(Value::as_array)
        .ok_or(ConfigurationError::MalformedField(key))?;

    entries
        .iter()
        .map(|entry| entry.as_i64().ok_or(ConfigurationError::MalformedField(key)))
        .collect()
}

fn non_negative_field(
    object: &Map<String, Value>,
    key: &'static str,
) -> Result<f64, ConfigurationError> {
    object
        .get(key)
        .and_then(Value::as_f64)
        .filter(|value| *value >= 0.0)
        .ok_or(ConfigurationError::MalformedField(key))
}

fn positive_field(object: &Map<String, Value>, key: &'static str) -> Result<f64, ConfigurationError> {
    object
        .get(key)
        .and_then(Value::as_f64)
        .filter(|value| *value > 0.0)
        .ok_or(ConfigurationError::MalformedField(key))
}
