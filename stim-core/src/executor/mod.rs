//! Phase executor: turns a validated phase into an ordered device-call plan.
//!
//! Standard phases split the nominal amplitude evenly across their contacts
//! and always configure every contact before starting any of them, so onset
//! across contacts is only skewed by start-call latency. Novel phases load
//! their waveform into the embedded slot and then start playback per contact.

use alloc::vec::Vec;
use core::fmt;

use serde::Deserialize;

use crate::device::{
    AnalogStimulation, CONTINUOUS_REPEAT, DeviceCommand, StimulationParameters, WaveformSlot,
};
use crate::sequences::{ChargeBalance, PulseTrain, StimulationPhase, Stimulus};

/// Sign convention applied to the two pulse phases.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolarityConvention {
    /// Leading phase positive, recharge negative.
    #[default]
    Normal,
    /// Leading phase negative, recharge positive.
    Inverted,
}

impl PolarityConvention {
    pub const fn label(self) -> &'static str {
        match self {
            PolarityConvention::Normal => "normal",
            PolarityConvention::Inverted => "inverted",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        match label {
            "normal" => Some(PolarityConvention::Normal),
            "inverted" => Some(PolarityConvention::Inverted),
            _ => None,
        }
    }

    /// Sign of the first-phase amplitude.
    pub const fn leading_sign(self) -> f64 {
        match self {
            PolarityConvention::Normal => 1.0,
            PolarityConvention::Inverted => -1.0,
        }
    }
}

impl fmt::Display for PolarityConvention {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// How the second pulse phase discharges the tissue.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RechargeMode {
    #[default]
    Active,
    /// Second phase is driven at zero amplitude.
    Passive,
}

impl RechargeMode {
    pub const fn label(self) -> &'static str {
        match self {
            RechargeMode::Active => "active",
            RechargeMode::Passive => "passive",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        match label {
            "active" => Some(RechargeMode::Active),
            "passive" => Some(RechargeMode::Passive),
            _ => None,
        }
    }
}

impl fmt::Display for RechargeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Operator choices that shape every Standard phase of a run.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct StimulationOptions {
    pub polarity: PolarityConvention,
    pub recharge: RechargeMode,
}

impl StimulationOptions {
    pub const fn new(polarity: PolarityConvention, recharge: RechargeMode) -> Self {
        Self { polarity, recharge }
    }
}

/// Device calls for one phase, in issue order.
#[derive(Clone, Debug, PartialEq)]
pub struct PhasePlan {
    pub commands: Vec<DeviceCommand>,
    pub charge_balance: Option<ChargeBalance>,
}

impl PhasePlan {
    const fn empty() -> Self {
        Self {
            commands: Vec::new(),
            charge_balance: None,
        }
    }
}

/// Builds the device-call plan for `phase`.
pub fn plan_phase(phase: &StimulationPhase, options: StimulationOptions) -> PhasePlan {
    match &phase.stimulus {
        Stimulus::Baseline => PhasePlan::empty(),
        Stimulus::Standard(train) => plan_standard(phase, *train, options),
        Stimulus::Novel { waveform_index } => plan_novel(phase, *waveform_index),
    }
}

fn contact_parameters(
    phase: &StimulationPhase,
    train: PulseTrain,
    options: StimulationOptions,
) -> Vec<StimulationParameters> {
    let contacts = u32::try_from(phase.channels.len()).unwrap_or(u32::MAX);
    let share = train.amplitude_ma / f64::from(contacts);
    let width_ms = train.pulse_width_ms();
    let leading = options.polarity.leading_sign() * share;
    let trailing = match options.recharge {
        RechargeMode::Active => -leading,
        RechargeMode::Passive => 0.0,
    };

    phase
        .channels
        .iter()
        .map(|channel| StimulationParameters {
            channel: *channel,
            first_amplitude_ma: leading,
            first_width_ms: width_ms,
            second_amplitude_ma: trailing,
            second_width_ms: width_ms,
            frequency_hz: train.frequency_hz,
            duration_s: phase.duration_s,
            return_contact: phase.return_contact,
        })
        .collect()
}

fn plan_standard(
    phase: &StimulationPhase,
    train: PulseTrain,
    options: StimulationOptions,
) -> PhasePlan {
    let charge_balance = train.charge_balance();
    if let Some(balance) = charge_balance {
        log::debug!(
            "executor: {} mA x {} ms recharged by {} mA x {} ms",
            train.amplitude_ma,
            train.pulse_width_ms(),
            balance.recharge_amplitude_ma,
            balance.recharge_pulse_ms
        );
    }

    let parameters = contact_parameters(phase, train, options);
    let mut commands = Vec::with_capacity(parameters.len() * 2);
    commands.extend(
        parameters
            .iter()
            .copied()
            .map(DeviceCommand::SetStimulationParameters),
    );
    commands.extend(
        parameters
            .iter()
            .map(|parameters| DeviceCommand::StartStimulation(parameters.channel)),
    );

    PhasePlan {
        commands,
        charge_balance,
    }
}

fn plan_novel(phase: &StimulationPhase, waveform_index: usize) -> PhasePlan {
    let mut commands = Vec::with_capacity(phase.channels.len() + 1);
    commands.push(DeviceCommand::LoadWaveform {
        index: waveform_index,
        slot: WaveformSlot::EMBEDDED,
    });
    commands.extend(phase.channels.iter().map(|channel| {
        DeviceCommand::StartAnalogStimulation(AnalogStimulation {
            channel: *channel,
            slot: WaveformSlot::EMBEDDED,
            repeat: CONTINUOUS_REPEAT,
            duration_s: phase.duration_s,
            return_contact: phase.return_contact,
        })
    }));

    PhasePlan {
        commands,
        charge_balance: None,
    }
}
