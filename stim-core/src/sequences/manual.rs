//! Operator-typed stimulation expressed as a one-phase sequence.

use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;
use core::time::Duration;

use serde_json::{Map, Value};

use super::{PhaseKind, SequenceDocument, keys};

/// Name reported for a run started with [`ManualStimulation`].
pub const MANUAL_SEQUENCE_NAME: &str = "Manual Stimulation";

/// Standard pulse train applied by hand, outside any loaded sequence.
#[derive(Clone, Debug, PartialEq)]
pub struct ManualStimulation {
    /// Lead slot index, as in `StimulationLead`.
    pub lead: usize,
    pub contacts: Vec<usize>,
    /// `None` returns through the global can.
    pub return_contact: Option<usize>,
    pub amplitude_ma: f64,
    pub pulse_width_us: f64,
    pub frequency_hz: f64,
    pub duration: Duration,
}

impl ManualStimulation {
    /// Builds the single Standard phase the sequencer runs for this request.
    ///
    /// The phase goes through the same validation as a loaded one, so an
    /// empty contact list or a pulse width without recharge time is refused
    /// before any device call.
    pub fn to_document(&self) -> SequenceDocument {
        let return_index = self
            .return_contact
            .map_or(Value::from(-1), Value::from);

        let mut phase = Map::new();
        phase.insert(String::from(keys::TYPE), Value::from(PhaseKind::Standard.label()));
        phase.insert(String::from(keys::LEAD), Value::from(self.lead));
        phase.insert(String::from(keys::CHANNEL), Value::from(self.contacts.clone()));
        phase.insert(String::from(keys::RETURN), return_index);
        phase.insert(
            String::from(keys::DURATION),
            Value::from(self.duration.as_secs_f64()),
        );
        phase.insert(String::from(keys::AMPLITUDE), Value::from(self.amplitude_ma));
        phase.insert(String::from(keys::PULSE_WIDTH), Value::from(self.pulse_width_us));
        phase.insert(String::from(keys::FREQUENCY), Value::from(self.frequency_hz));

        SequenceDocument {
            name: String::from(MANUAL_SEQUENCE_NAME),
            phases: vec![Value::Object(phase)],
            analog_waveforms: None,
        }
    }
}
