use std::fmt::Write as _;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use stim_core::electrodes::{LeadConfiguration, ReturnContact};
use stim_core::recording::SideEffectKind;
use stim_core::sequences::{StimulationPhase, Stimulus};

/// Clinician-facing side-effect notes, appended as plain text.
#[derive(Debug)]
pub struct SideEffectNotes {
    path: PathBuf,
}

impl SideEffectNotes {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one entry for the stimulation in `phase`.
    ///
    /// Returns `false` without touching the file when the phase is not a
    /// Standard pulse train.
    pub fn append(
        &self,
        kind: SideEffectKind,
        phase: &StimulationPhase,
        lead: Option<&LeadConfiguration>,
    ) -> Result<bool> {
        let Some(entry) = render(kind, phase, lead) else {
            return Ok(false);
        };

        if let Some(parent) = self.path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed to open notes {}", self.path.display()))?;
        file.write_all(entry.as_bytes())
            .with_context(|| format!("failed to write notes {}", self.path.display()))?;
        Ok(true)
    }
}

/// Formats one entry:
///
/// ```text
/// Medtronic 3389
/// 1- 2- CAN+
/// Persistent side effects
///     3 mA
///     60 uS
///     130 Hz
/// ```
pub fn render(
    kind: SideEffectKind,
    phase: &StimulationPhase,
    lead: Option<&LeadConfiguration>,
) -> Option<String> {
    let Stimulus::Standard(train) = &phase.stimulus else {
        return None;
    };

    let mut entry = String::new();
    match lead {
        Some(lead) => entry.push_str(&lead.electrode_type),
        None => {
            let _ = write!(entry, "Lead {}", phase.lead + 1);
        }
    }
    entry.push('\n');

    for contact in &phase.contacts {
        let _ = write!(entry, "{contact}- ");
    }
    match phase.return_contact {
        ReturnContact::GlobalCan => entry.push_str("CAN+ "),
        ReturnContact::Channel(channel) => {
            let contact = lead.and_then(|lead| {
                lead.channel_ids
                    .iter()
                    .position(|candidate| *candidate == channel)
            });
            let _ = match contact {
                Some(contact) => write!(entry, "{contact}+ "),
                None => write!(entry, "{channel}+ "),
            };
        }
    }

    let _ = write!(
        entry,
        "\n{kind} side effects\n\t{} mA\n\t{} uS\n\t{} Hz\n\n",
        train.amplitude_ma, train.pulse_width_us, train.frequency_hz
    );
    Some(entry)
}
