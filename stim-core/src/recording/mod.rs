//! Keeps the recorder's active save file aligned with the running phase.

use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;

use crate::device::DeviceCommand;

/// Annotation prepended to every sequence-driven recording name.
pub const RESEARCH_ANNOTATION: &str = "Research_";

/// Label used when a manual recording is started without one.
pub const DEFAULT_MANUAL_LABEL: &str = "Recording";

/// Side effect reported by the clinician while stimulation is on.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SideEffectKind {
    Persistent,
    Transient,
}

impl SideEffectKind {
    /// Text written into the recording as the annotation.
    pub const fn label(self) -> &'static str {
        match self {
            SideEffectKind::Persistent => "Persistent",
            SideEffectKind::Transient => "Transient",
        }
    }
}

impl fmt::Display for SideEffectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Save-file switch planned for a phase boundary.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordingRotation {
    /// Logical name declared by the phase.
    pub filename: String,
    /// Full name handed to the recorder.
    pub save_name: String,
    pub commands: Vec<DeviceCommand>,
}

/// What the recorder is currently doing on the sequencer's behalf.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RecordingState {
    prefix: String,
    programmed: Option<String>,
    saving: bool,
    infinite_recording: bool,
}

impl RecordingState {
    /// Creates an idle state. `prefix` is the session part of every file
    /// name, typically `yyyyMMdd_<diagnosis>_<patientID>`.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            ..Self::default()
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn set_prefix(&mut self, prefix: impl Into<String>) {
        self.prefix = prefix.into();
    }

    /// Logical filename most recently programmed by a phase.
    pub fn programmed(&self) -> Option<&str> {
        self.programmed.as_deref()
    }

    pub const fn is_saving(&self) -> bool {
        self.saving
    }

    /// `true` when the operator started the recording by hand, so ending a
    /// sequence leaves it running.
    pub const fn is_infinite(&self) -> bool {
        self.infinite_recording
    }

    /// Full save-file name for a phase's logical filename.
    pub fn save_name(&self, filename: &str) -> String {
        self.join(&format!("{RESEARCH_ANNOTATION}{filename}"))
    }

    /// Plans the switch needed before a phase that declares `requested`.
    ///
    /// Phases without a filename keep whatever file is active.
    pub fn plan_rotation(&self, requested: Option<&str>) -> Option<RecordingRotation> {
        let filename = requested?;
        if self.saving && self.programmed.as_deref() == Some(filename) {
            return None;
        }

        let save_name = self.save_name(filename);
        let mut commands = Vec::with_capacity(3);
        if self.saving {
            commands.push(DeviceCommand::StopSave);
        }
        commands.push(DeviceCommand::SetSaveFileName(save_name.clone()));
        commands.push(DeviceCommand::StartSave);

        Some(RecordingRotation {
            filename: String::from(filename),
            save_name,
            commands,
        })
    }

    /// Records that a planned rotation completed.
    pub fn apply_rotation(&mut self, rotation: &RecordingRotation) {
        self.programmed = Some(rotation.filename.clone());
        self.saving = true;
    }

    /// Tracks a single recorder call that the device accepted.
    ///
    /// A switch can fail half way; once `StopSave` has gone through the
    /// recorder is idle whatever happens to the calls after it.
    pub fn record_issued(&mut self, command: &DeviceCommand) {
        if matches!(command, DeviceCommand::StopSave) {
            self.mark_stopped();
        }
    }

    /// Plans the stop issued when a sequence ends, if any.
    pub fn plan_sequence_stop(&self, annotation_driven: bool) -> Option<DeviceCommand> {
        (annotation_driven && self.saving && !self.infinite_recording)
            .then_some(DeviceCommand::StopSave)
    }

    /// Records that saving has stopped. The programmed filename is forgotten
    /// so the next run starts a fresh save.
    pub fn mark_stopped(&mut self) {
        self.saving = false;
        self.programmed = None;
    }

    /// Plans a recording started by the operator.
    ///
    /// A recording started while no sequence is running is kept alive when
    /// a later sequence ends.
    pub fn plan_manual_start(&self, label: Option<&str>) -> Vec<DeviceCommand> {
        let name = self.join(label.unwrap_or(DEFAULT_MANUAL_LABEL));
        let mut commands = Vec::with_capacity(3);
        if self.saving {
            commands.push(DeviceCommand::StopSave);
        }
        commands.push(DeviceCommand::SetSaveFileName(name));
        commands.push(DeviceCommand::StartSave);
        commands
    }

    pub fn apply_manual_start(&mut self, sequence_running: bool) {
        self.saving = true;
        self.programmed = None;
        if !sequence_running {
            self.infinite_recording = true;
        }
    }

    /// Plans an operator stop. Nothing is issued when no save is active.
    pub fn plan_manual_stop(&self) -> Option<DeviceCommand> {
        self.saving.then_some(DeviceCommand::StopSave)
    }

    pub fn apply_manual_stop(&mut self) {
        self.mark_stopped();
        self.infinite_recording = false;
    }

    fn join(&self, annotation: &str) -> String {
        if self.prefix.is_empty() {
            String::from(annotation)
        } else {
            format!("{}_{}", self.prefix, annotation)
        }
    }
}
