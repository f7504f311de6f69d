//! Electrode map shared by the sequencer and the operator console.
//!
//! A session configures up to [`MAX_LEADS`] implanted leads. Each lead maps
//! its local contact indices onto opaque [`HardwareChannelId`] values supplied
//! by the operator; the sequencer only ever looks them up and never derives
//! them from amplifier box or channel arithmetic.

use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;

use serde::Deserialize;

/// Number of lead slots available in a session.
pub const MAX_LEADS: usize = 4;

/// Electrode type recorded for an unused lead slot.
pub const NOT_CONNECTED: &str = "None";

/// Hardware channel identifier as understood by the stimulation device.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize)]
#[serde(transparent)]
pub struct HardwareChannelId(u32);

impl HardwareChannelId {
    /// Wraps a raw device channel identifier.
    #[must_use]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Returns the raw identifier passed to the device.
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Channel `0` marks a contact that has not been assigned yet.
    #[must_use]
    pub const fn is_assigned(self) -> bool {
        self.0 > 0
    }
}

impl fmt::Display for HardwareChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Return path used while stimulating.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ReturnContact {
    /// Global return through the case/CAN electrode.
    GlobalCan,
    /// Dedicated return contact on the lead.
    Channel(HardwareChannelId),
}

impl ReturnContact {
    /// Raw value expected by the device, where `-1` selects the global return.
    #[must_use]
    pub fn as_device_value(self) -> i64 {
        match self {
            ReturnContact::GlobalCan => -1,
            ReturnContact::Channel(channel) => i64::from(channel.raw()),
        }
    }
}

/// Configuration for a single lead slot.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct LeadConfiguration {
    pub electrode_type: String,
    #[serde(default)]
    pub hemisphere: String,
    #[serde(default)]
    pub target: String,
    #[serde(default)]
    pub num_contacts: usize,
    #[serde(default)]
    pub channel_ids: Vec<HardwareChannelId>,
}

impl LeadConfiguration {
    /// Creates a connected lead.
    pub fn new(
        electrode_type: impl Into<String>,
        hemisphere: impl Into<String>,
        target: impl Into<String>,
        channel_ids: Vec<HardwareChannelId>,
    ) -> Self {
        let num_contacts = channel_ids.len();
        Self {
            electrode_type: electrode_type.into(),
            hemisphere: hemisphere.into(),
            target: target.into(),
            num_contacts,
            channel_ids,
        }
    }

    /// Creates an empty slot with no electrode attached.
    #[must_use]
    pub fn disconnected() -> Self {
        Self {
            electrode_type: String::from(NOT_CONNECTED),
            hemisphere: String::new(),
            target: String::new(),
            num_contacts: 0,
            channel_ids: Vec::new(),
        }
    }

    /// Overrides the contact count (e.g. when a reference channel is appended).
    #[must_use]
    pub fn with_num_contacts(mut self, num_contacts: usize) -> Self {
        self.num_contacts = num_contacts;
        self
    }

    /// Returns `true` unless the slot is marked as [`NOT_CONNECTED`].
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.electrode_type != NOT_CONNECTED
    }

    /// Looks up the hardware channel wired to `contact`.
    #[must_use]
    pub fn channel(&self, contact: usize) -> Option<HardwareChannelId> {
        if contact < self.num_contacts {
            self.channel_ids.get(contact).copied()
        } else {
            None
        }
    }

    /// Resolves a phase's return index into a return path.
    ///
    /// `-1` selects the global return and `0..num_contacts` selects a lead
    /// contact. An index equal to `num_contacts` addresses the lead's
    /// reference channel when one is configured past the last contact, and
    /// falls back to the global return otherwise. Anything else is rejected.
    #[must_use]
    pub fn resolve_return(&self, index: i64) -> Option<ReturnContact> {
        if index == -1 {
            return Some(ReturnContact::GlobalCan);
        }

        let index = usize::try_from(index).ok()?;
        if index < self.num_contacts {
            self.channel(index).map(ReturnContact::Channel)
        } else if index == self.num_contacts {
            Some(
                self.channel_ids
                    .get(index)
                    .copied()
                    .map_or(ReturnContact::GlobalCan, ReturnContact::Channel),
            )
        } else {
            None
        }
    }

    /// Recording channel name, e.g. `Lead_1_Left_STN_0`.
    #[must_use]
    pub fn channel_name(&self, lead_index: usize, contact: usize) -> String {
        format!(
            "Lead_{}_{}_{}_{}",
            lead_index + 1,
            self.hemisphere,
            self.target,
            contact
        )
    }
}

impl Default for LeadConfiguration {
    fn default() -> Self {
        Self::disconnected()
    }
}

/// Errors reported while assembling or verifying the electrode map.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ElectrodeError {
    /// More leads were supplied than slots exist.
    TooManyLeads { count: usize },
    /// A connected lead lacks channel IDs for some of its contacts.
    ChannelsNotConfigured { lead_number: usize },
    /// A hardware channel is mapped to more than one contact.
    DuplicateChannel {
        lead_number: usize,
        channel: HardwareChannelId,
    },
}

impl fmt::Display for ElectrodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ElectrodeError::TooManyLeads { count } => {
                write!(f, "{count} leads configured, at most {MAX_LEADS} supported.")
            }
            ElectrodeError::ChannelsNotConfigured { lead_number } => {
                write!(f, "Electrode #{lead_number} Channels not configured.")
            }
            ElectrodeError::DuplicateChannel {
                lead_number,
                channel,
            } => write!(
                f,
                "Electrode #{lead_number} Channels found previously defined channel ({channel})."
            ),
        }
    }
}

impl core::error::Error for ElectrodeError {}

/// Read-only electrode map handed to the sequencer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ElectrodeConfiguration {
    leads: [LeadConfiguration; MAX_LEADS],
}

impl ElectrodeConfiguration {
    /// Creates a map with every slot disconnected.
    #[must_use]
    pub fn disconnected() -> Self {
        Self {
            leads: core::array::from_fn(|_| LeadConfiguration::disconnected()),
        }
    }

    /// Builds a map from up to [`MAX_LEADS`] leads; missing slots stay disconnected.
    pub fn from_leads(leads: Vec<LeadConfiguration>) -> Result<Self, ElectrodeError> {
        if leads.len() > MAX_LEADS {
            return Err(ElectrodeError::TooManyLeads { count: leads.len() });
        }

        let mut configuration = Self::disconnected();
        for (slot, lead) in configuration.leads.iter_mut().zip(leads) {
            *slot = lead;
        }
        Ok(configuration)
    }

    /// Replaces the lead stored at `index`.
    pub fn set_lead(&mut self, index: usize, lead: LeadConfiguration) -> Result<(), ElectrodeError> {
        match self.leads.get_mut(index) {
            Some(slot) => {
                *slot = lead;
                Ok(())
            }
            None => Err(ElectrodeError::TooManyLeads { count: index + 1 }),
        }
    }

    /// Returns the lead at `index`, if the slot exists.
    #[must_use]
    pub fn lead(&self, index: usize) -> Option<&LeadConfiguration> {
        self.leads.get(index)
    }

    /// Iterates over every slot in order.
    pub fn iter(&self) -> core::slice::Iter<'_, LeadConfiguration> {
        self.leads.iter()
    }

    /// Checks that every connected lead is fully mapped and that no hardware
    /// channel is shared between contacts.
    pub fn verify(&self) -> Result<(), ElectrodeError> {
        let mut seen: Vec<HardwareChannelId> = Vec::new();

        for (index, lead) in self.leads.iter().enumerate() {
            if !lead.is_connected() {
                continue;
            }

            let lead_number = index + 1;
            if lead.channel_ids.len() < lead.num_contacts {
                return Err(ElectrodeError::ChannelsNotConfigured { lead_number });
            }

            for channel in lead.channel_ids.iter().take(lead.num_contacts) {
                if channel.is_assigned() && seen.contains(channel) {
                    return Err(ElectrodeError::DuplicateChannel {
                        lead_number,
                        channel: *channel,
                    });
                }
                seen.push(*channel);
            }
        }

        Ok(())
    }
}

impl Default for ElectrodeConfiguration {
    fn default() -> Self {
        Self::disconnected()
    }
}
