//! Shared status surface for the REPL.
//!
//! [`StatusProvider`] lets the REPL surface live sequencer state through the
//! `status` command, and [`StatusFormatter`] keeps the textual rendering
//! consistent across front-ends.

use alloc::string::String;
use core::fmt;
use core::time::Duration;

use crate::device::{RecordingController, StimulationDevice};
use crate::executor::StimulationOptions;
use crate::orchestrator::{MonotonicClock, Sequencer};
use crate::telemetry::SequenceObserver;

/// Progress of the loaded sequence.
#[derive(Clone, Debug, PartialEq)]
pub struct SequenceSnapshot {
    pub name: String,
    pub phase_count: usize,
    pub total_duration_s: f64,
    pub armed: bool,
    pub current_stage: usize,
    pub phase_active: bool,
    pub elapsed: Option<Duration>,
}

/// Recorder state as seen by the sequencer.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RecordingSnapshot {
    pub saving: bool,
    pub programmed: Option<String>,
    pub infinite: bool,
}

/// Snapshot of reusable status information surfaced by the REPL.
#[derive(Clone, Debug, PartialEq)]
pub struct StatusSnapshot {
    pub sequence: Option<SequenceSnapshot>,
    pub recording: RecordingSnapshot,
    pub options: StimulationOptions,
    pub waveforms_loaded: usize,
    pub retry_window: Duration,
}

/// Source of live status information.
pub trait StatusProvider<Instant> {
    fn snapshot(&self, now: Instant) -> StatusSnapshot;
}

impl<D, C, O> StatusProvider<C::Instant> for Sequencer<D, C, O>
where
    D: StimulationDevice + RecordingController,
    C: MonotonicClock,
    O: SequenceObserver<C::Instant>,
{
    fn snapshot(&self, now: C::Instant) -> StatusSnapshot {
        let state = self.state();
        let sequence = self.active_document().map(|document| SequenceSnapshot {
            name: String::from(document.name()),
            phase_count: document.len(),
            total_duration_s: document.total_duration(),
            armed: state.armed,
            current_stage: state.current_stage,
            phase_active: state.phase_active,
            elapsed: self.elapsed(now),
        });
        let recording = self.recording();

        StatusSnapshot {
            sequence,
            recording: RecordingSnapshot {
                saving: recording.is_saving(),
                programmed: recording.programmed().map(String::from),
                infinite: recording.is_infinite(),
            },
            options: self.options(),
            waveforms_loaded: self.waveforms().len(),
            retry_window: self.retry_policy().window(),
        }
    }
}

/// Helper that renders a [`StatusSnapshot`] into human-readable lines.
#[derive(Clone, Copy, Debug)]
pub struct StatusFormatter<'a> {
    snapshot: &'a StatusSnapshot,
}

impl<'a> StatusFormatter<'a> {
    #[must_use]
    pub const fn new(snapshot: &'a StatusSnapshot) -> Self {
        Self { snapshot }
    }

    /// Writes the sequence line (e.g. `sequence "EP" armed stage=2/3 phase=on elapsed=+12.3s total=60.0s`).
    pub fn write_sequence_line<W: fmt::Write>(&self, writer: &mut W) -> fmt::Result {
        let Some(sequence) = &self.snapshot.sequence else {
            return writer.write_str("sequence none");
        };

        write!(
            writer,
            "sequence \"{}\" {}",
            sequence.name,
            if sequence.armed { "armed" } else { "idle" }
        )?;
        if sequence.armed {
            let stage = (sequence.current_stage + 1).min(sequence.phase_count);
            write!(
                writer,
                " stage={}/{} phase={}",
                stage,
                sequence.phase_count,
                if sequence.phase_active { "on" } else { "off" }
            )?;
            writer.write_str(" elapsed=")?;
            write_duration(writer, sequence.elapsed)?;
        } else {
            write!(writer, " phases={}", sequence.phase_count)?;
        }
        write!(writer, " total={:.1}s", sequence.total_duration_s)
    }

    /// Writes the recording line (e.g. `recording saving=true file=EP infinite=false`).
    pub fn write_recording_line<W: fmt::Write>(&self, writer: &mut W) -> fmt::Result {
        let recording = &self.snapshot.recording;
        write!(writer, "recording saving={} file=", recording.saving)?;
        writer.write_str(recording.programmed.as_deref().unwrap_or("n/a"))?;
        write!(writer, " infinite={}", recording.infinite)
    }

    /// Writes the options line (e.g. `options polarity=normal recharge=active waveforms=2 retry=+5.0s`).
    pub fn write_options_line<W: fmt::Write>(&self, writer: &mut W) -> fmt::Result {
        write!(
            writer,
            "options polarity={} recharge={} waveforms={} retry=",
            self.snapshot.options.polarity,
            self.snapshot.options.recharge,
            self.snapshot.waveforms_loaded
        )?;
        if self.snapshot.retry_window.is_zero() {
            writer.write_str("off")
        } else {
            write_duration(writer, Some(self.snapshot.retry_window))
        }
    }
}

fn write_duration<W: fmt::Write>(writer: &mut W, duration: Option<Duration>) -> fmt::Result {
    match duration {
        None => writer.write_str("n/a"),
        Some(value) if value >= Duration::from_secs(1) => {
            let millis = u64::try_from(value.as_millis()).unwrap_or(u64::MAX);
            let seconds = millis / 1_000;
            let tenths = (millis % 1_000) / 100;
            write!(writer, "+{seconds}.{tenths}s")
        }
        Some(value) => write!(writer, "+{}ms", value.as_millis()),
    }
}
