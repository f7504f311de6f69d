mod common;

use common::{MockInstant, load, one_waveform, sequencer};
use stim_core::device::{DeviceCommand, StimulationTarget, WaveformBank};
use stim_core::electrodes::ReturnContact;
use stim_core::orchestrator::{AbortReason, ControlError, StartFlags};
use stim_core::sequences::ConfigurationError;
use stim_core::telemetry::SequenceEventKind;

fn single_phase(phase: &str) -> String {
    format!(r#"{{"StimulationName": "single", "StimulationSequence": [{phase}]}}"#)
}

fn start_single(phase: &str) -> (common::TestSequencer, Result<(), ControlError>) {
    let mut sequencer = sequencer();
    load(&mut sequencer, &single_phase(phase), WaveformBank::new());
    let result = sequencer
        .start(MockInstant(0), StartFlags::default())
        .map(|_| ());
    (sequencer, result)
}

fn stimulation_calls(sequencer: &common::TestSequencer) -> usize {
    sequencer
        .device()
        .calls
        .iter()
        .filter(|call| !matches!(call, DeviceCommand::StopStimulation(_)))
        .count()
}

#[test]
fn out_of_range_lead_aborts_before_any_device_call() {
    let (sequencer, result) = start_single(
        r#"{"StimulationType": "Standard", "StimulationLead": 4, "StimulationChannel": [0],
            "StimulationReturn": -1, "Duration": 5, "Amplitude": 1, "Pulsewidth": 60,
            "Frequency": 130}"#,
    );

    let err = result.expect_err("lead 4 does not exist");
    assert_eq!(
        err,
        ControlError::Configuration {
            stage: 0,
            error: ConfigurationError::LeadOutOfRange { lead_number: 5 },
        }
    );
    assert_eq!(err.to_string(), "Phase 1: Lead # 5 Not Exist");
    assert!(!sequencer.state().armed);
    assert_eq!(
        sequencer.device().calls,
        [DeviceCommand::StopStimulation(StimulationTarget::All)],
        "only the abort's stop-all reaches the device"
    );

    let events = &sequencer.observer().events;
    let failed = events
        .iter()
        .find(|observed| observed.event == SequenceEventKind::ValidationFailed)
        .expect("validation failure is reported");
    assert_eq!(failed.message.as_deref(), Some("Lead # 5 Not Exist"));
    assert_eq!(failed.stage, Some(0));
    assert!(
        events
            .iter()
            .any(|observed| observed.event
                == SequenceEventKind::SequenceAborted(AbortReason::Validation))
    );
}

#[test]
fn invalid_phase_aborts_at_its_own_entry() {
    let mut sequencer = sequencer();
    load(
        &mut sequencer,
        r#"{"StimulationName": "late failure", "StimulationSequence": [
            {"StimulationType": "Baseline", "StimulationLead": 0, "StimulationChannel": [],
             "StimulationReturn": -1, "Duration": 2},
            {"StimulationType": "Standard", "StimulationLead": 4, "StimulationChannel": [0],
             "StimulationReturn": -1, "Duration": 5, "Amplitude": 1, "Pulsewidth": 60,
             "Frequency": 130}]}"#,
        WaveformBank::new(),
    );

    sequencer
        .start(MockInstant(0), StartFlags::default())
        .expect("baseline is valid");
    for millis in (100..2_000).step_by(100) {
        sequencer
            .tick(MockInstant::millis(millis))
            .expect("bad phase is not inspected early");
    }
    assert!(sequencer.state().armed);

    let err = sequencer
        .tick(MockInstant::millis(2_000))
        .expect_err("phase 2 is rejected on entry");
    assert!(matches!(err, ControlError::Configuration { stage: 1, .. }));
    assert_eq!(stimulation_calls(&sequencer), 0);
    assert!(!sequencer.state().armed);
}

#[test]
fn disconnected_lead_is_rejected() {
    let (sequencer, result) = start_single(
        r#"{"StimulationType": "Standard", "StimulationLead": 1, "StimulationChannel": [0],
            "StimulationReturn": -1, "Duration": 5, "Amplitude": 1, "Pulsewidth": 60,
            "Frequency": 130}"#,
    );
    let err = result.expect_err("lead 2 is not connected");
    assert_eq!(err.to_string(), "Phase 1: Lead not connected.");
    assert_eq!(stimulation_calls(&sequencer), 0);
}

#[test]
fn return_contact_accepts_num_contacts_and_rejects_beyond() {
    let (sequencer, result) = start_single(
        r#"{"StimulationType": "Standard", "StimulationLead": 0, "StimulationChannel": [0],
            "StimulationReturn": 8, "Duration": 5, "Amplitude": 1, "Pulsewidth": 60,
            "Frequency": 130}"#,
    );
    result.expect("return 8 is within [-1, 8]");
    let parameters = sequencer.device().parameters();
    assert_eq!(parameters.len(), 1);
    assert_eq!(parameters[0].return_contact, ReturnContact::GlobalCan);

    let (sequencer, result) = start_single(
        r#"{"StimulationType": "Standard", "StimulationLead": 0, "StimulationChannel": [0],
            "StimulationReturn": 9, "Duration": 5, "Amplitude": 1, "Pulsewidth": 60,
            "Frequency": 130}"#,
    );
    let err = result.expect_err("return 9 is out of range");
    assert_eq!(err.to_string(), "Phase 1: Bad contacts.");
    assert_eq!(stimulation_calls(&sequencer), 0);
}

#[test]
fn contact_index_must_be_below_num_contacts() {
    let (_, result) = start_single(
        r#"{"StimulationType": "Standard", "StimulationLead": 0, "StimulationChannel": [7, 8],
            "StimulationReturn": -1, "Duration": 5, "Amplitude": 1, "Pulsewidth": 60,
            "Frequency": 130}"#,
    );
    assert!(matches!(
        result,
        Err(ControlError::Configuration {
            error: ConfigurationError::BadContact { index: 8 },
            ..
        })
    ));
}

#[test]
fn standard_phase_needs_pulse_fields() {
    let (sequencer, result) = start_single(
        r#"{"StimulationType": "Standard", "StimulationLead": 0, "StimulationChannel": [0],
            "StimulationReturn": -1, "Duration": 5, "Amplitude": 1}"#,
    );
    let err = result.expect_err("pulse width and frequency missing");
    assert_eq!(err.to_string(), "Phase 1: Missing standard-stim fields.");
    assert_eq!(stimulation_calls(&sequencer), 0);
}

#[test]
fn structural_failures_come_first() {
    let (_, result) = start_single("42");
    assert_eq!(
        result.map_err(|err| err.to_string()),
        Err(String::from("Phase 1: Sequence is not a structured object."))
    );

    let (_, result) = start_single(r#"{"StimulationType": "Standard", "StimulationLead": 9}"#);
    assert_eq!(
        result.map_err(|err| err.to_string()),
        Err(String::from("Phase 1: Missing required fields."))
    );
}

#[test]
fn novel_phase_references_loaded_waveform() {
    let mut sequencer = sequencer();
    load(
        &mut sequencer,
        r#"{"StimulationName": "novel", "AnalogWaveforms": ["Burst135.bin"],
            "StimulationSequence": [
            {"StimulationType": "Novel Stimulation", "StimulationLead": 0,
             "StimulationChannel": [0], "StimulationReturn": -1, "Duration": 3,
             "StimulationIndex": 1}]}"#,
        one_waveform(),
    );

    let err = sequencer
        .start(MockInstant(0), StartFlags::default())
        .expect_err("only waveform 0 is loaded");
    assert_eq!(err.to_string(), "Phase 1: Waveform 1 not loaded.");
    assert_eq!(stimulation_calls(&sequencer), 0);
}
