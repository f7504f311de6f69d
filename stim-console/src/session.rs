use std::fs::{self, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant as HostInstant};

use anyhow::{Context, Result};
use stim_core::device::WaveformBank;
use stim_core::orchestrator::{ControlError, MonotonicClock, Sequencer};
use stim_core::recording::SideEffectKind;
use stim_core::repl::catalog;
use stim_core::repl::commands::{CommandError, CommandExecutor, CommandOutcome, ConsoleRequest};
use stim_core::repl::completion::{CompletionEngine, Replacement};
use stim_core::repl::status::{StatusFormatter, StatusProvider};
use stim_core::sequences::{SequenceDocument, StimulationPhase, Stimulus, summarize};
use stim_core::telemetry::{
    SequenceEvent, SequenceEventKind, SequenceNotice, SequenceObserver, TelemetryInstant,
    TelemetryPayload,
};

use crate::config::ConsoleConfig;
use crate::device::SimulatedDevice;
use crate::event_log::EventLog;
use crate::notes::SideEffectNotes;
use crate::waveforms;

/// `std::time::Instant` as seen by the sequencer.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub struct ConsoleInstant(pub HostInstant);

impl TelemetryInstant for ConsoleInstant {
    fn saturating_duration_since(&self, earlier: Self) -> Duration {
        self.0.saturating_duration_since(earlier.0)
    }
}

#[derive(Copy, Clone, Debug, Default)]
pub struct HostClock;

impl MonotonicClock for HostClock {
    type Instant = ConsoleInstant;

    fn now(&self) -> ConsoleInstant {
        ConsoleInstant(HostInstant::now())
    }

    fn pause(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Owned copy of one sequence event, drained after every call into the core.
#[derive(Clone, Debug)]
pub struct ObservedEvent {
    pub event: SequenceEventKind,
    pub stage: Option<u16>,
    pub elapsed: Option<Duration>,
    pub phase: Option<StimulationPhase>,
    pub text: Option<String>,
}

impl ObservedEvent {
    fn narrate(&self) -> String {
        let stage = self.stage.map_or(0, |stage| usize::from(stage) + 1);
        let at = self
            .elapsed
            .map(|elapsed| format!(" t=+{}ms", elapsed.as_millis()))
            .unwrap_or_default();
        let text = self.text.as_deref().unwrap_or("");
        match self.event {
            SequenceEventKind::SequenceArmed => format!("EVT sequence armed \"{text}\""),
            SequenceEventKind::PhaseStarted(kind) => format!("EVT phase {stage} {kind} on{at}"),
            SequenceEventKind::PhaseStopped => format!("EVT phase {stage} off{at}"),
            SequenceEventKind::RecordingRotated => format!("EVT recording {text}{at}"),
            SequenceEventKind::ValidationFailed => format!("EVT phase {stage} rejected: {text}"),
            SequenceEventKind::SequenceCompleted => String::from("EVT sequence completed"),
            SequenceEventKind::SequenceAborted(reason) if text.is_empty() => {
                format!("EVT sequence aborted ({reason})")
            }
            SequenceEventKind::SequenceAborted(reason) => {
                format!("EVT sequence aborted ({reason}): {text}")
            }
            SequenceEventKind::StimulationOff => String::from("EVT stimulation off"),
            SequenceEventKind::LabelSent => format!("EVT label \"{text}\""),
            SequenceEventKind::Custom(code) => format!("EVT custom({code})"),
        }
    }
}

/// Buffers the `onSequenceEvent` stream until the session drains it.
#[derive(Debug, Default)]
pub struct ConsoleObserver {
    pending: Vec<ObservedEvent>,
}

impl ConsoleObserver {
    pub fn drain(&mut self) -> Vec<ObservedEvent> {
        std::mem::take(&mut self.pending)
    }
}

impl SequenceObserver<ConsoleInstant> for ConsoleObserver {
    fn on_sequence_event(&mut self, event: &SequenceEvent<'_, ConsoleInstant>) {
        let (stage, elapsed) = match event.record.details {
            TelemetryPayload::Phase(phase) => (Some(phase.stage), Some(phase.elapsed)),
            TelemetryPayload::Run(run) => (None, run.duration),
            TelemetryPayload::None => (None, None),
        };
        let (phase, text) = match event.notice {
            SequenceNotice::None => (None, None),
            SequenceNotice::Sequence(name) => (None, Some(name.to_string())),
            SequenceNotice::Phase(phase) => (Some(phase.clone()), None),
            SequenceNotice::Rotation { save_name, .. } => (None, Some(save_name.to_string())),
            SequenceNotice::Message(message) => (None, Some(message.to_string())),
        };
        self.pending.push(ObservedEvent {
            event: event.record.event,
            stage,
            elapsed,
            phase,
            text,
        });
    }
}

pub type ConsoleSequencer = Sequencer<SimulatedDevice, HostClock, ConsoleObserver>;

#[derive(Debug)]
pub enum CompletionResponse {
    NoMatches,
    Applied { replacement: Replacement },
    Suggestions { options: Vec<&'static str> },
}

/// One operator session: the sequencer plus everything the host owns.
pub struct Session {
    executor: CommandExecutor<ConsoleSequencer>,
    config: ConsoleConfig,
    event_log: EventLog,
    notes: SideEffectNotes,
    /// Most recent Standard phase, described by side-effect notes.
    last_stimulation: Option<StimulationPhase>,
    transcript: Option<TranscriptLogger>,
    completion: CompletionEngine,
    started_at: HostInstant,
}

impl Session {
    pub fn new(
        config: ConsoleConfig,
        transcript: Option<&Path>,
        event_log: &Path,
    ) -> Result<Self> {
        let electrodes = config.electrodes()?;
        let prefix = config
            .session
            .recording_prefix(chrono::Local::now().date_naive());
        let sequencer = Sequencer::new(
            SimulatedDevice::new(config.device.failures.clone()),
            HostClock,
            ConsoleObserver::default(),
            electrodes,
            config.stimulation.options(),
        )
        .with_retry_policy(config.stimulation.retry_policy())
        .with_recording_prefix(prefix);

        let transcript = transcript.map(TranscriptLogger::create).transpose()?;
        let mut event_log = EventLog::open(event_log)?;
        log::info!(
            "console: event log {} ({} entries)",
            event_log.path().display(),
            event_log.entries().len()
        );
        event_log.add_object_timestamp("Session", &config.session.patient_id);
        event_log.save()?;

        let notes = SideEffectNotes::new(config.paths.notes.clone());
        Ok(Self {
            executor: CommandExecutor::new(sequencer),
            config,
            event_log,
            notes,
            last_stimulation: None,
            transcript,
            completion: CompletionEngine::new(),
            started_at: HostInstant::now(),
        })
    }

    pub fn sequencer(&self) -> &ConsoleSequencer {
        self.executor.sequencer()
    }

    pub fn tick_interval(&self) -> Duration {
        self.config.stimulation.tick_interval()
    }

    /// Runs one REPL line and returns the lines to print.
    pub fn handle_command(&mut self, line: &str) -> Result<Vec<String>> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Ok(Vec::new());
        }

        let elapsed = self.started_at.elapsed();
        self.transcribe(elapsed, TranscriptRole::Host, trimmed)?;

        let now = ConsoleInstant(HostInstant::now());
        let mut lines = match self.executor.execute(trimmed, now) {
            Ok(CommandOutcome::Started(ack)) => {
                let mut head = format!(
                    "OK start at=+{}ms phases-started={}",
                    ack.requested_at.0.duration_since(self.started_at).as_millis(),
                    ack.first_tick.started
                );
                if let Some(window) = ack.retry_window {
                    head.push_str(&format!(" retry-window={}ms", window.as_millis()));
                }
                vec![head]
            }
            Ok(CommandOutcome::Stopped { .. }) => vec![String::from("OK stop")],
            Ok(CommandOutcome::Stimulating {
                requested_at,
                first_tick,
            }) => vec![format!(
                "OK stimulate at=+{}ms phases-started={}",
                requested_at.0.duration_since(self.started_at).as_millis(),
                first_tick.started
            )],
            Ok(CommandOutcome::Labelled { text, sent: true }) => {
                vec![format!("OK label \"{text}\"")]
            }
            Ok(CommandOutcome::Labelled { sent: false, .. }) => {
                vec![String::from("OK label empty, nothing sent")]
            }
            Ok(CommandOutcome::SideEffect(kind)) => self.note_side_effect(kind),
            Ok(CommandOutcome::RecordingStarted { save_name }) => {
                vec![format!("OK recording {save_name}")]
            }
            Ok(CommandOutcome::RecordingStopped { was_saving: true }) => {
                vec![String::from("OK recording stopped")]
            }
            Ok(CommandOutcome::RecordingStopped { was_saving: false }) => {
                vec![String::from("OK no recording active")]
            }
            Ok(CommandOutcome::Polarity(polarity)) => vec![format!("OK polarity {polarity}")],
            Ok(CommandOutcome::Recharge(recharge)) => vec![format!("OK recharge {recharge}")],
            Ok(CommandOutcome::Request(request)) => self.serve(request, now),
            Err(CommandError::Parse(err)) => vec![format!("ERR syntax {err}")],
            Err(CommandError::Unsupported(reason)) => vec![format!("ERR {reason}")],
            Err(CommandError::Control(err)) => vec![describe_control_error(&err)],
        };

        lines.extend(self.drain_events()?);
        self.record_output(elapsed, &lines)?;
        Ok(lines)
    }

    /// Advances the sequencer; called once per tick interval.
    pub fn tick(&mut self) -> Result<Vec<String>> {
        let now = ConsoleInstant(HostInstant::now());
        let mut lines = Vec::new();
        if let Err(err) = self.executor.sequencer_mut().tick(now) {
            lines.push(describe_control_error(&err));
        }
        lines.extend(self.drain_events()?);
        if !lines.is_empty() {
            self.record_output(self.started_at.elapsed(), &lines)?;
        }
        Ok(lines)
    }

    pub fn handle_completion(&mut self, buffer: &str, cursor: usize) -> Result<CompletionResponse> {
        let cursor = cursor.min(buffer.len());
        let (prefix, suffix) = buffer.split_at(cursor);
        let elapsed = self.started_at.elapsed();
        self.transcribe(
            elapsed,
            TranscriptRole::Host,
            &format!("[TAB] prefix={prefix:?} suffix={suffix:?} cursor={cursor}"),
        )?;

        let result = self.completion.complete(buffer, cursor);
        if result.options.is_empty() {
            self.transcribe(elapsed, TranscriptRole::Console, "completion: no matches")?;
            return Ok(CompletionResponse::NoMatches);
        }

        let options: Vec<&'static str> = result.options.iter().copied().collect();
        if let ([candidate], Some(replacement)) = (options.as_slice(), result.replacement) {
            self.transcribe(
                elapsed,
                TranscriptRole::Console,
                &format!(
                    "completion applied: {candidate} (range={}..{})",
                    replacement.start, replacement.end
                ),
            )?;
            return Ok(CompletionResponse::Applied { replacement });
        }

        self.transcribe(
            elapsed,
            TranscriptRole::Console,
            &format!("completion options ({})", options.len()),
        )?;
        for option in &options {
            self.transcribe(elapsed, TranscriptRole::Console, &format!("  {option}"))?;
        }
        Ok(CompletionResponse::Suggestions { options })
    }

    /// Stops any run before the process exits.
    pub fn shutdown(&mut self) -> Result<Vec<String>> {
        let mut lines = Vec::new();
        if self.sequencer().state().armed {
            let now = ConsoleInstant(HostInstant::now());
            if let Err(err) = self.executor.sequencer_mut().stop(
                now,
                stim_core::orchestrator::StopReason::Aborted(
                    stim_core::telemetry::AbortReason::Operator,
                ),
            ) {
                lines.push(describe_control_error(&err));
            }
        }
        lines.extend(self.drain_events()?);
        self.record_output(self.started_at.elapsed(), &lines)?;
        Ok(lines)
    }

    fn serve(&mut self, request: ConsoleRequest<'_>, now: ConsoleInstant) -> Vec<String> {
        match request {
            ConsoleRequest::Load { name } => match self.load(name, now) {
                Ok(mut lines) => {
                    lines.extend(self.show());
                    lines
                }
                Err(err) => vec![format!("ERR load {err:#}")],
            },
            ConsoleRequest::Show => self.show(),
            ConsoleRequest::Status => self.status(now),
            ConsoleRequest::Help { topic } => help(topic),
        }
    }

    fn note_side_effect(&self, kind: SideEffectKind) -> Vec<String> {
        let Some(phase) = &self.last_stimulation else {
            log::warn!("console: {kind} side effect with no stimulation to describe");
            return vec![format!("OK side-effect {kind} (no stimulation to note)")];
        };

        let lead = self.sequencer().electrodes().lead(phase.lead);
        match self.notes.append(kind, phase, lead) {
            Ok(_) => vec![format!(
                "OK side-effect {kind} noted in {}",
                self.notes.path().display()
            )],
            Err(err) => {
                log::warn!("console: side-effect notes failed: {err:#}");
                vec![format!("ERR notes {err:#}")]
            }
        }
    }

    fn load(&mut self, name: &str, now: ConsoleInstant) -> Result<Vec<String>> {
        let path = sequence_path(&self.config.paths.sequence_dir, name);
        let text = fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let document = SequenceDocument::from_json(&text).map_err(|err| anyhow::anyhow!("{err}"))?;

        let mut lines = Vec::new();
        let bank = match document.analog_waveforms() {
            Some(files) if !files.is_empty() => {
                match waveforms::load_bank(&self.config.paths.sequence_dir, files) {
                    Ok(bank) => bank,
                    Err(err) => {
                        log::warn!("console: waveform load failed: {err:#}");
                        lines.push(format!("WARN waveforms not loaded: {err:#}"));
                        WaveformBank::new()
                    }
                }
            }
            _ => WaveformBank::new(),
        };

        lines.insert(
            0,
            format!(
                "OK loaded \"{}\" phases={} total={:.1}s waveforms={}",
                document.name(),
                document.len(),
                document.total_duration(),
                bank.len()
            ),
        );
        if let Err(err) = self.executor.sequencer_mut().load_document(now, document, bank) {
            lines.push(describe_control_error(&err));
        }
        Ok(lines)
    }

    fn show(&self) -> Vec<String> {
        let sequencer = self.sequencer();
        let Some(document) = sequencer.document() else {
            return vec![describe_control_error(&ControlError::NoDocument)];
        };
        summarize(
            document,
            sequencer.electrodes(),
            &sequencer.waveforms().names(),
            self.config.session.selected_lead,
        )
        .iter()
        .enumerate()
        .map(|(index, row)| format!("  {}. {}", index + 1, row.to_line()))
        .collect()
    }

    fn status(&self, now: ConsoleInstant) -> Vec<String> {
        let snapshot = self.sequencer().snapshot(now);
        let formatter = StatusFormatter::new(&snapshot);
        let mut lines = vec![String::new(), String::new(), String::new()];
        let written = formatter
            .write_sequence_line(&mut lines[0])
            .and_then(|()| formatter.write_recording_line(&mut lines[1]))
            .and_then(|()| formatter.write_options_line(&mut lines[2]));
        if written.is_err() {
            return vec![String::from("ERR status unavailable")];
        }

        let device = self.sequencer().device();
        let active: Vec<String> = device.active_channels().map(|channel| channel.to_string()).collect();
        lines.push(format!(
            "device active=[{}] saving={} file={} calls={}",
            active.join(","),
            device.is_saving(),
            device.save_file().unwrap_or("n/a"),
            device.calls().len()
        ));
        lines
    }

    fn drain_events(&mut self) -> Result<Vec<String>> {
        let events = self.executor.sequencer_mut().observer_mut().drain();
        if events.is_empty() {
            return Ok(Vec::new());
        }

        let sequencer = self.executor.sequencer();
        let mut logged = false;
        for event in &events {
            match (event.event, &event.phase, &event.text) {
                (SequenceEventKind::PhaseStarted(_), Some(phase), _) => {
                    self.event_log.add_phase_start(
                        phase,
                        sequencer.electrodes(),
                        sequencer.waveforms(),
                        sequencer.options(),
                    );
                    if matches!(phase.stimulus, Stimulus::Standard(_)) {
                        self.last_stimulation = Some(phase.clone());
                    }
                    logged = true;
                }
                (SequenceEventKind::StimulationOff, _, _) => {
                    self.event_log.add_stimulation_off();
                    logged = true;
                }
                (SequenceEventKind::LabelSent, _, Some(text)) => {
                    self.event_log.add_label(text);
                    logged = true;
                }
                _ => {}
            }
        }
        if logged {
            self.event_log.save()?;
        }

        Ok(events.iter().map(ObservedEvent::narrate).collect())
    }

    fn transcribe(&mut self, elapsed: Duration, role: TranscriptRole, line: &str) -> Result<()> {
        match self.transcript.as_mut() {
            Some(transcript) => transcript.append_line(elapsed, role, line),
            None => Ok(()),
        }
    }

    fn record_output(&mut self, elapsed: Duration, lines: &[String]) -> Result<()> {
        for line in lines {
            self.transcribe(elapsed, TranscriptRole::Console, line)?;
        }
        Ok(())
    }
}

/// `<dir>/<name>`, adding `.json` when the name has no extension.
pub fn sequence_path(dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(name);
    if path.extension().is_some() {
        path
    } else {
        path.with_extension("json")
    }
}

fn describe_control_error(error: &ControlError) -> String {
    match error {
        ControlError::Label(_) => format!("ERR label not sent: {error}"),
        ControlError::Configuration { .. }
        | ControlError::DeviceCall { .. }
        | ControlError::RecordingSwitch { .. } => format!("ERR sequence aborted: {error}"),
        _ => format!("ERR {error}"),
    }
}

fn help(topic: Option<&str>) -> Vec<String> {
    match topic {
        Some(name) => match catalog::find(name) {
            Some(spec) => vec![String::from(spec.usage)],
            None => {
                let names: Vec<&str> = catalog::commands().iter().map(|spec| spec.name).collect();
                vec![
                    format!("No help available for `{name}`."),
                    format!("Available topics: {}", names.join(", ")),
                ]
            }
        },
        None => {
            let mut lines = vec![String::from("Available commands:")];
            lines.extend(catalog::commands().iter().map(|spec| format!("  {}", spec.usage)));
            lines.push(String::from("Type `help <topic>` for a specific command."));
            lines
        }
    }
}

struct TranscriptLogger {
    writer: BufWriter<fs::File>,
}

impl TranscriptLogger {
    fn create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)
            .with_context(|| format!("failed to open transcript {}", path.display()))?;

        let mut logger = Self {
            writer: BufWriter::new(file),
        };
        writeln!(logger.writer, "# Stimulation console transcript")?;
        writeln!(logger.writer, "# Timestamps are milliseconds since session start")?;
        writeln!(logger.writer)?;
        logger.writer.flush()?;
        Ok(logger)
    }

    fn append_line(&mut self, elapsed: Duration, role: TranscriptRole, line: &str) -> Result<()> {
        writeln!(
            self.writer,
            "[+{:>6} ms] {} {}",
            elapsed.as_millis(),
            role.prefix(),
            line
        )?;
        self.writer.flush()?;
        Ok(())
    }
}

#[derive(Clone, Copy)]
enum TranscriptRole {
    Host,
    Console,
}

impl TranscriptRole {
    fn prefix(self) -> &'static str {
        match self {
            TranscriptRole::Host => "HOST>",
            TranscriptRole::Console => "EMU <",
        }
    }
}
