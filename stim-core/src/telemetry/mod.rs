//! Sequence event catalog, telemetry ring, and the `onSequenceEvent` stream.
//!
//! Every transition the sequencer makes is stored as a compact, `Copy`
//! [`TelemetryRecord`] in a fixed-size ring and forwarded to a
//! [`SequenceObserver`] together with a borrowed [`SequenceNotice`] that
//! carries the richer context (the phase, a filename, or an error message)
//! the console needs to render and persist the event.

use core::{fmt, time::Duration};

use heapless::{HistoryBuf, OldestOrdered};

use crate::sequences::{PhaseKind, StimulationPhase};

/// Identifier assigned to each recorded event.
pub type EventId = u32;

/// Total number of telemetry entries retained in memory.
pub const TELEMETRY_RING_CAPACITY: usize = 128;

/// Why a sequence ended before its last phase elapsed.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AbortReason {
    /// Operator requested a stop.
    Operator,
    /// A phase failed validation at entry.
    Validation,
    /// A stimulation call returned an error.
    DeviceCall,
    /// A save-file switch failed.
    RecordingSwitch,
    /// A new sequence document replaced the running one.
    Replaced,
    /// Implementation-specific extension.
    Custom(u8),
}

impl AbortReason {
    const OPERATOR_CODE: u8 = 0x00;
    const VALIDATION_CODE: u8 = 0x01;
    const DEVICE_CALL_CODE: u8 = 0x02;
    const RECORDING_SWITCH_CODE: u8 = 0x03;
    const REPLACED_CODE: u8 = 0x04;

    #[must_use]
    pub const fn to_raw(self) -> u8 {
        match self {
            AbortReason::Operator => Self::OPERATOR_CODE,
            AbortReason::Validation => Self::VALIDATION_CODE,
            AbortReason::DeviceCall => Self::DEVICE_CALL_CODE,
            AbortReason::RecordingSwitch => Self::RECORDING_SWITCH_CODE,
            AbortReason::Replaced => Self::REPLACED_CODE,
            AbortReason::Custom(code) => code,
        }
    }

    #[must_use]
    pub const fn from_raw(code: u8) -> Self {
        match code {
            Self::OPERATOR_CODE => AbortReason::Operator,
            Self::VALIDATION_CODE => AbortReason::Validation,
            Self::DEVICE_CALL_CODE => AbortReason::DeviceCall,
            Self::RECORDING_SWITCH_CODE => AbortReason::RecordingSwitch,
            Self::REPLACED_CODE => AbortReason::Replaced,
            other => AbortReason::Custom(other),
        }
    }

    /// Returns `true` when the sequence ended because something failed.
    #[must_use]
    pub const fn is_failure(self) -> bool {
        matches!(
            self,
            AbortReason::Validation | AbortReason::DeviceCall | AbortReason::RecordingSwitch
        )
    }
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortReason::Operator => f.write_str("operator"),
            AbortReason::Validation => f.write_str("validation"),
            AbortReason::DeviceCall => f.write_str("device-call"),
            AbortReason::RecordingSwitch => f.write_str("recording-switch"),
            AbortReason::Replaced => f.write_str("replaced"),
            AbortReason::Custom(code) => write!(f, "custom({code})"),
        }
    }
}

/// Discriminated sequence events.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SequenceEventKind {
    SequenceArmed,
    PhaseStarted(PhaseKind),
    PhaseStopped,
    RecordingRotated,
    SequenceCompleted,
    SequenceAborted(AbortReason),
    ValidationFailed,
    StimulationOff,
    /// Free-text annotation written into the recording.
    LabelSent,
    Custom(u16),
}

impl fmt::Display for SequenceEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SequenceEventKind::SequenceArmed => f.write_str("sequence-armed"),
            SequenceEventKind::PhaseStarted(kind) => write!(f, "phase-started {kind}"),
            SequenceEventKind::PhaseStopped => f.write_str("phase-stopped"),
            SequenceEventKind::RecordingRotated => f.write_str("recording-rotated"),
            SequenceEventKind::SequenceCompleted => f.write_str("sequence-completed"),
            SequenceEventKind::SequenceAborted(reason) => write!(f, "sequence-aborted {reason}"),
            SequenceEventKind::ValidationFailed => f.write_str("validation-failed"),
            SequenceEventKind::StimulationOff => f.write_str("stimulation-off"),
            SequenceEventKind::LabelSent => f.write_str("label-sent"),
            SequenceEventKind::Custom(code) => write!(f, "custom({code})"),
        }
    }
}

impl SequenceEventKind {
    const SEQUENCE_ARMED_CODE: u16 = 0x0001;
    const PHASE_STOPPED_CODE: u16 = 0x0002;
    const RECORDING_ROTATED_CODE: u16 = 0x0003;
    const SEQUENCE_COMPLETED_CODE: u16 = 0x0004;
    const VALIDATION_FAILED_CODE: u16 = 0x0005;
    const STIMULATION_OFF_CODE: u16 = 0x0006;
    const LABEL_SENT_CODE: u16 = 0x0007;
    const PHASE_STARTED_BASE: u16 = 0x0010;
    const PHASE_STARTED_END: u16 = 0x0013;
    const SEQUENCE_ABORTED_BASE: u16 = 0x0100;
    const SEQUENCE_ABORTED_END: u16 = 0x0200;

    /// Encodes the event into a compact discriminant.
    #[must_use]
    pub const fn to_raw(self) -> u16 {
        match self {
            SequenceEventKind::SequenceArmed => Self::SEQUENCE_ARMED_CODE,
            SequenceEventKind::PhaseStarted(kind) => Self::PHASE_STARTED_BASE + kind.as_raw() as u16,
            SequenceEventKind::PhaseStopped => Self::PHASE_STOPPED_CODE,
            SequenceEventKind::RecordingRotated => Self::RECORDING_ROTATED_CODE,
            SequenceEventKind::SequenceCompleted => Self::SEQUENCE_COMPLETED_CODE,
            SequenceEventKind::SequenceAborted(reason) => {
                Self::SEQUENCE_ABORTED_BASE + reason.to_raw() as u16
            }
            SequenceEventKind::ValidationFailed => Self::VALIDATION_FAILED_CODE,
            SequenceEventKind::StimulationOff => Self::STIMULATION_OFF_CODE,
            SequenceEventKind::LabelSent => Self::LABEL_SENT_CODE,
            SequenceEventKind::Custom(code) => code,
        }
    }

    /// Decodes a raw discriminant, falling back to [`SequenceEventKind::Custom`].
    #[must_use]
    pub fn from_raw(code: u16) -> Self {
        match code {
            Self::SEQUENCE_ARMED_CODE => SequenceEventKind::SequenceArmed,
            Self::PHASE_STOPPED_CODE => SequenceEventKind::PhaseStopped,
            Self::RECORDING_ROTATED_CODE => SequenceEventKind::RecordingRotated,
            Self::SEQUENCE_COMPLETED_CODE => SequenceEventKind::SequenceCompleted,
            Self::VALIDATION_FAILED_CODE => SequenceEventKind::ValidationFailed,
            Self::STIMULATION_OFF_CODE => SequenceEventKind::StimulationOff,
            Self::LABEL_SENT_CODE => SequenceEventKind::LabelSent,
            value if (Self::PHASE_STARTED_BASE..Self::PHASE_STARTED_END).contains(&value) => {
                u8::try_from(value - Self::PHASE_STARTED_BASE)
                    .ok()
                    .and_then(PhaseKind::from_raw)
                    .map_or(SequenceEventKind::Custom(value), SequenceEventKind::PhaseStarted)
            }
            value if (Self::SEQUENCE_ABORTED_BASE..Self::SEQUENCE_ABORTED_END).contains(&value) => {
                u8::try_from(value - Self::SEQUENCE_ABORTED_BASE).map_or(
                    SequenceEventKind::Custom(value),
                    |offset| SequenceEventKind::SequenceAborted(AbortReason::from_raw(offset)),
                )
            }
            other => SequenceEventKind::Custom(other),
        }
    }
}

/// Position of the sequencer when an event was recorded.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PhaseTelemetry {
    pub stage: u16,
    /// Time since the sequence was (re)started.
    pub elapsed: Duration,
}

impl PhaseTelemetry {
    #[must_use]
    pub const fn new(stage: u16, elapsed: Duration) -> Self {
        Self { stage, elapsed }
    }
}

/// Summary attached to completion and abort events.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RunTelemetry {
    pub phases_started: u16,
    pub duration: Option<Duration>,
}

/// Payloads carried alongside sequence events.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TelemetryPayload {
    None,
    Phase(PhaseTelemetry),
    Run(RunTelemetry),
}

/// Trait implemented by monotonic instant wrappers used for telemetry tracking.
pub trait TelemetryInstant: Copy {
    /// Returns the saturating duration from `earlier` to `self`.
    fn saturating_duration_since(&self, earlier: Self) -> Duration;
}

/// Telemetry record stored in the ring buffer.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TelemetryRecord<TInstant>
where
    TInstant: Copy,
{
    pub id: EventId,
    pub timestamp: TInstant,
    pub event: SequenceEventKind,
    pub details: TelemetryPayload,
}

/// Telemetry ring buffer type alias.
pub type TelemetryRing<TInstant, const CAPACITY: usize = TELEMETRY_RING_CAPACITY> =
    HistoryBuf<TelemetryRecord<TInstant>, CAPACITY>;

/// Records sequence events into a fixed-size ring buffer.
pub struct TelemetryRecorder<TInstant, const CAPACITY: usize = TELEMETRY_RING_CAPACITY>
where
    TInstant: Copy,
{
    ring: TelemetryRing<TInstant, CAPACITY>,
    next_event_id: EventId,
}

impl<TInstant, const CAPACITY: usize> TelemetryRecorder<TInstant, CAPACITY>
where
    TInstant: Copy + TelemetryInstant,
{
    /// Creates a new telemetry recorder with an empty history.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            ring: HistoryBuf::new(),
            next_event_id: 0,
        }
    }

    /// Returns an iterator over the recorded telemetry in chronological order.
    pub fn oldest_first(&self) -> OldestOrdered<'_, TelemetryRecord<TInstant>> {
        self.ring.oldest_ordered()
    }

    /// Returns the most recent telemetry record, if available.
    pub fn latest(&self) -> Option<&TelemetryRecord<TInstant>> {
        self.ring.recent()
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    /// Records an event tied to a phase position.
    pub fn record_phase_event(
        &mut self,
        event: SequenceEventKind,
        stage: usize,
        elapsed: Duration,
        timestamp: TInstant,
    ) -> TelemetryRecord<TInstant> {
        let payload = TelemetryPayload::Phase(PhaseTelemetry::new(truncate_stage(stage), elapsed));
        self.record(event, payload, timestamp)
    }

    /// Records the end of a run, measuring its length from `started_at`.
    pub fn record_run_end(
        &mut self,
        event: SequenceEventKind,
        phases_started: usize,
        started_at: Option<TInstant>,
        timestamp: TInstant,
    ) -> TelemetryRecord<TInstant> {
        let payload = TelemetryPayload::Run(RunTelemetry {
            phases_started: truncate_stage(phases_started),
            duration: started_at.map(|start| timestamp.saturating_duration_since(start)),
        });
        self.record(event, payload, timestamp)
    }

    /// Records an arbitrary event with the supplied payload.
    pub fn record(
        &mut self,
        event: SequenceEventKind,
        payload: TelemetryPayload,
        timestamp: TInstant,
    ) -> TelemetryRecord<TInstant> {
        let id = self.next_event_id;
        self.next_event_id = self.next_event_id.wrapping_add(1);

        let record = TelemetryRecord {
            id,
            timestamp,
            event,
            details: payload,
        };
        self.ring.write(record);
        record
    }
}

impl<TInstant, const CAPACITY: usize> Default for TelemetryRecorder<TInstant, CAPACITY>
where
    TInstant: Copy + TelemetryInstant,
{
    fn default() -> Self {
        Self::new()
    }
}

fn truncate_stage(stage: usize) -> u16 {
    u16::try_from(stage).unwrap_or(u16::MAX)
}

/// Context borrowed from the sequencer for the duration of one notification.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum SequenceNotice<'a> {
    None,
    /// Name of the sequence being armed.
    Sequence(&'a str),
    Phase(&'a StimulationPhase),
    Rotation {
        filename: &'a str,
        save_name: &'a str,
    },
    /// Operator-facing error text.
    Message(&'a str),
}

/// One entry of the `onSequenceEvent` stream.
#[derive(Copy, Clone, Debug)]
pub struct SequenceEvent<'a, TInstant>
where
    TInstant: Copy,
{
    pub record: TelemetryRecord<TInstant>,
    pub notice: SequenceNotice<'a>,
}

/// Receives every event the sequencer records.
pub trait SequenceObserver<TInstant>
where
    TInstant: Copy,
{
    fn on_sequence_event(&mut self, event: &SequenceEvent<'_, TInstant>);
}

/// Observer that drops every notification.
#[derive(Copy, Clone, Debug, Default)]
pub struct NoopObserver;

impl<TInstant: Copy> SequenceObserver<TInstant> for NoopObserver {
    fn on_sequence_event(&mut self, _: &SequenceEvent<'_, TInstant>) {}
}
