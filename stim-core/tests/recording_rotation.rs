mod common;

use core::time::Duration;

use common::{MockDevice, MockInstant, TICK, load, run_to_end, sequencer, sequencer_with};
use stim_core::device::{DeviceCommand, WaveformBank};
use stim_core::orchestrator::{AbortReason, ControlError, StartFlags, StopReason};
use stim_core::telemetry::SequenceEventKind;

const ROTATING: &str = r#"{
    "StimulationName": "rotating",
    "StimulationSequence": [
        {"StimulationType": "Baseline", "StimulationLead": 0, "StimulationChannel": [],
         "StimulationReturn": -1, "Duration": 1, "RecordingFilename": "A"},
        {"StimulationType": "Standard", "StimulationLead": 0, "StimulationChannel": [0],
         "StimulationReturn": -1, "Duration": 1, "Amplitude": 1, "Pulsewidth": 60,
         "Frequency": 130, "RecordingFilename": "A"},
        {"StimulationType": "Baseline", "StimulationLead": 0, "StimulationChannel": [],
         "StimulationReturn": -1, "Duration": 1, "RecordingFilename": "B"}
    ]
}"#;

fn recording_calls(calls: &[DeviceCommand]) -> Vec<DeviceCommand> {
    calls
        .iter()
        .filter(|call| call.is_recording())
        .cloned()
        .collect()
}

fn set_name(name: &str) -> DeviceCommand {
    DeviceCommand::SetSaveFileName(String::from(name))
}

#[test]
fn rotation_only_switches_on_a_new_filename() {
    let mut sequencer = sequencer().with_recording_prefix("20240105_PD_P001");
    load(&mut sequencer, ROTATING, WaveformBank::new());

    let (_, outcome) = run_to_end(&mut sequencer, Duration::from_secs(10));
    assert!(outcome.expect("run completes").completed);

    assert_eq!(
        recording_calls(&sequencer.device().calls),
        [
            set_name("20240105_PD_P001_Research_A"),
            DeviceCommand::StartSave,
            DeviceCommand::StopSave,
            set_name("20240105_PD_P001_Research_B"),
            DeviceCommand::StartSave,
            DeviceCommand::StopSave,
        ]
    );

    let rotations: Vec<_> = sequencer
        .observer()
        .events
        .iter()
        .filter(|observed| observed.event == SequenceEventKind::RecordingRotated)
        .map(|observed| (observed.stage, observed.message.clone()))
        .collect();
    assert_eq!(
        rotations,
        [
            (Some(0), Some(String::from("20240105_PD_P001_Research_A"))),
            (Some(2), Some(String::from("20240105_PD_P001_Research_B"))),
        ]
    );
    assert!(!sequencer.recording().is_saving());
}

#[test]
fn rotation_precedes_the_phase_stimulation() {
    let mut sequencer = sequencer();
    load(&mut sequencer, ROTATING, WaveformBank::new());
    sequencer
        .start(MockInstant(0), StartFlags::default())
        .expect("start");
    sequencer
        .tick(MockInstant::millis(1_000))
        .expect("boundary into phase 2");

    let labels = sequencer.device().labels();
    let set_parameters = labels
        .iter()
        .position(|label| *label == "SetStimulationParameters")
        .expect("phase 2 programs the stimulator");
    let start_save = labels
        .iter()
        .position(|label| *label == "StartSave")
        .expect("phase 1 starts saving");
    assert!(start_save < set_parameters);
    assert_eq!(sequencer.recording().programmed(), Some("A"));
}

#[test]
fn unprefixed_names_carry_only_the_annotation() {
    let mut sequencer = sequencer();
    load(&mut sequencer, ROTATING, WaveformBank::new());
    sequencer
        .start(MockInstant(0), StartFlags::default())
        .expect("start");

    assert_eq!(
        recording_calls(&sequencer.device().calls),
        [set_name("Research_A"), DeviceCommand::StartSave]
    );
}

#[test]
fn manual_recording_outlives_the_sequence() {
    let mut sequencer = sequencer().with_recording_prefix("20240105_PD_P001");
    let save_name = sequencer
        .start_recording(MockInstant(0), None)
        .expect("manual start");
    assert_eq!(save_name, "20240105_PD_P001_Recording");
    assert!(sequencer.recording().is_infinite());

    load(&mut sequencer, ROTATING, WaveformBank::new());
    let (_, outcome) = run_to_end(&mut sequencer, Duration::from_secs(10));
    assert!(outcome.expect("run completes").completed);

    let calls = recording_calls(&sequencer.device().calls);
    assert_eq!(
        calls.last(),
        Some(&DeviceCommand::StartSave),
        "the final save keeps running after the sequence"
    );
    assert!(sequencer.recording().is_saving());

    assert!(sequencer.stop_recording().expect("manual stop"));
    assert!(!sequencer.recording().is_saving());
    assert!(!sequencer.recording().is_infinite());
    assert!(!sequencer.stop_recording().expect("nothing left to stop"));
}

#[test]
fn manual_recording_during_a_run_is_not_infinite() {
    let mut sequencer = sequencer();
    load(&mut sequencer, ROTATING, WaveformBank::new());
    sequencer
        .start(MockInstant(0), StartFlags::default())
        .expect("start");

    sequencer
        .start_recording(MockInstant::millis(500), Some("extra"))
        .expect("manual start mid-run");
    assert!(!sequencer.recording().is_infinite());
    assert_eq!(
        recording_calls(&sequencer.device().calls)[2..],
        [
            DeviceCommand::StopSave,
            set_name("extra"),
            DeviceCommand::StartSave,
        ]
    );
}

#[test]
fn operator_driven_run_leaves_saving_alone() {
    let mut sequencer = sequencer();
    load(&mut sequencer, ROTATING, WaveformBank::new());
    sequencer
        .start(
            MockInstant(0),
            StartFlags {
                annotation_driven: false,
                ..StartFlags::default()
            },
        )
        .expect("start");

    let mut now = MockInstant(0);
    while sequencer.state().armed {
        now = now + TICK;
        sequencer.tick(now).expect("tick");
    }

    assert_eq!(sequencer.device().count("StopSave"), 1, "only the A to B switch");
    assert!(sequencer.recording().is_saving());
}

#[test]
fn failed_switch_aborts_the_phase() {
    let mut sequencer = sequencer_with(MockDevice::failing("StartSave", 1, "Recorder offline"));
    load(&mut sequencer, ROTATING, WaveformBank::new());

    let err = sequencer
        .start(MockInstant(0), StartFlags::default())
        .expect_err("the switch fails");
    assert!(matches!(err, ControlError::RecordingSwitch { stage: 0, .. }));
    assert_eq!(err.to_string(), "Recorder offline");
    assert_eq!(
        err.abort_reason(),
        Some(AbortReason::RecordingSwitch)
    );
    assert!(!sequencer.state().armed);
    assert!(
        sequencer
            .observer()
            .kinds()
            .contains(&SequenceEventKind::SequenceAborted(AbortReason::RecordingSwitch))
    );
}

#[test]
fn rerun_starts_a_fresh_save() {
    let mut sequencer = sequencer();
    load(&mut sequencer, ROTATING, WaveformBank::new());
    sequencer
        .start(MockInstant(0), StartFlags::default())
        .expect("first run");
    sequencer
        .stop(MockInstant::millis(500), StopReason::Aborted(AbortReason::Operator))
        .expect("stop");
    assert_eq!(sequencer.recording().programmed(), None);

    sequencer
        .start(MockInstant::millis(600), StartFlags::default())
        .expect("second run");
    assert_eq!(
        recording_calls(&sequencer.device().calls),
        [
            set_name("Research_A"),
            DeviceCommand::StartSave,
            DeviceCommand::StopSave,
            set_name("Research_A"),
            DeviceCommand::StartSave,
        ]
    );
}

const SWITCHING: &str = r#"{
    "StimulationName": "switching",
    "StimulationSequence": [
        {"StimulationType": "Baseline", "StimulationLead": 0, "StimulationChannel": [],
         "StimulationReturn": -1, "Duration": 1, "RecordingFilename": "A"},
        {"StimulationType": "Baseline", "StimulationLead": 0, "StimulationChannel": [],
         "StimulationReturn": -1, "Duration": 1, "RecordingFilename": "B"}
    ]
}"#;

#[test]
fn half_finished_switch_leaves_the_recorder_idle() {
    let mut sequencer =
        sequencer_with(MockDevice::failing_after("SetSaveFileName", 1, 1, "Name rejected"));
    load(&mut sequencer, SWITCHING, WaveformBank::new());
    let operator_driven = StartFlags {
        annotation_driven: false,
        ..StartFlags::default()
    };

    sequencer
        .start(MockInstant(0), operator_driven)
        .expect("phase 1 saves to A");
    let err = sequencer
        .tick(MockInstant::millis(1_000))
        .expect_err("naming B fails after the stop");
    assert!(matches!(err, ControlError::RecordingSwitch { stage: 1, .. }));
    assert!(!sequencer.recording().is_saving());
    assert_eq!(sequencer.recording().programmed(), None);

    sequencer
        .start(MockInstant::millis(2_000), operator_driven)
        .expect("rerun");
    assert_eq!(
        recording_calls(&sequencer.device().calls),
        [
            set_name("Research_A"),
            DeviceCommand::StartSave,
            DeviceCommand::StopSave,
            set_name("Research_B"),
            set_name("Research_A"),
            DeviceCommand::StartSave,
        ],
        "the rerun starts a save instead of assuming A is still active"
    );
    assert!(sequencer.recording().is_saving());
}

#[test]
fn failed_manual_restart_is_not_reported_as_saving() {
    let mut sequencer =
        sequencer_with(MockDevice::failing_after("SetSaveFileName", 1, 1, "Name rejected"));
    sequencer
        .start_recording(MockInstant(0), Some("first"))
        .expect("first recording");

    let err = sequencer
        .start_recording(MockInstant::millis(500), Some("second"))
        .expect_err("naming fails after the stop");
    assert!(matches!(err, ControlError::Recording(_)));
    assert!(!sequencer.recording().is_saving());
    assert!(!sequencer.stop_recording().expect("nothing to stop"));
    assert_eq!(sequencer.device().count("StopSave"), 1);
}
