//! Scheduler-wide types
//!
//! Collections, burst descriptors and resource requests shared by the map,
//! the DSA/APC helpers and the strategies.

use crate::compound::CompoundPtr;
use crate::phy_mode::PhyMode;
use common::types::{CandI, ChannelQualityOnOneSubChannel, ConnectionId, Power, UserId};
use common::utils::SimTime;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Length of a PDU in bits
pub type Bits = u32;

/// Ordered set of users
pub type UserSet = BTreeSet<UserId>;

/// Ordered set of connections
pub type ConnectionSet = BTreeSet<ConnectionId>;

/// Position of a scheduler instance in the system
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SchedulerSpot {
    /// Base station scheduling its own downlink transmissions
    DlMaster,
    /// Base station assigning uplink resources to its terminals
    UlMaster,
    /// Terminal filling the uplink resources the master assigned to it
    UlSlave,
}

impl SchedulerSpot {
    /// True for the two master spots
    pub fn is_master(&self) -> bool {
        !matches!(self, SchedulerSpot::UlSlave)
    }

    /// Power control variant matching this spot
    pub fn power_control_type(&self) -> PowerControlType {
        match self {
            SchedulerSpot::DlMaster => PowerControlType::DlMaster,
            SchedulerSpot::UlMaster => PowerControlType::UlMaster,
            SchedulerSpot::UlSlave => PowerControlType::UlSlave,
        }
    }
}

impl fmt::Display for SchedulerSpot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SchedulerSpot::DlMaster => "DLMaster",
            SchedulerSpot::UlMaster => "ULMaster",
            SchedulerSpot::UlSlave => "ULSlave",
        };
        f.write_str(name)
    }
}

/// Who decides the transmit power
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PowerControlType {
    /// Base station decides its own downlink power
    DlMaster,
    /// Base station decides the terminals' uplink power
    UlMaster,
    /// Terminal uses the power the master decided
    UlSlave,
}

/// Opaque antenna pattern produced by the beamforming provider
#[derive(Debug, Clone, PartialEq)]
pub struct Pattern {
    /// User the main lobe points at
    pub steered_at: UserId,
    /// Users placed into nulls
    pub nulls: Vec<UserId>,
    /// Antenna gain towards the steered user
    pub gain: f64,
}

/// All information about the next PDU to place
#[derive(Debug, Clone, PartialEq)]
pub struct RequestForResource {
    /// Connection of the PDU
    pub cid: ConnectionId,
    /// Destination (DL) or source (UL) user
    pub user: UserId,
    /// Size of the PDU
    pub bits: Bits,
    /// Fixed PHY mode; `None` means still freely selectable
    pub phy_mode: Option<PhyMode>,
    /// Subchannel proposed by the DSA strategy
    pub sub_channel: Option<usize>,
    /// Time slot proposed by the DSA strategy
    pub time_slot: usize,
    /// Spatial layer proposed by the DSA strategy
    pub spatial_layer: usize,
    /// Channel state on the proposed subchannel, set after DSA
    pub cqi_on_sub_channel: Option<ChannelQualityOnOneSubChannel>,
    /// True if the request carries a HARQ retransmission
    pub is_harq: bool,
}

impl RequestForResource {
    /// Create a request with no placement decided yet
    pub fn new(cid: ConnectionId, user: UserId, bits: Bits) -> Self {
        Self {
            cid,
            user,
            bits,
            phy_mode: None,
            sub_channel: None,
            time_slot: 0,
            spatial_layer: 0,
            cqi_on_sub_channel: None,
            is_harq: false,
        }
    }

    /// Transmission time once the PHY mode is known
    pub fn duration(&self) -> SimTime {
        match self.phy_mode {
            Some(mode) => mode.duration_for(self.bits),
            None => panic!("duration() needs a PhyMode in {}", self),
        }
    }
}

impl fmt::Display for RequestForResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Request({}, {}, {} bits", self.cid, self.user, self.bits)?;
        if let Some(sc) = self.sub_channel {
            write!(f, ", sc={}.{}.{}", sc, self.time_slot, self.spatial_layer)?;
        }
        write!(f, ")")
    }
}

/// One burst: consecutive compounds of one user on one resource block
#[derive(Debug, Clone, PartialEq)]
pub struct MapInfoEntry {
    /// Start relative to the slot start
    pub start: SimTime,
    /// End relative to the slot start
    pub end: SimTime,
    /// User the burst belongs to
    pub user: UserId,
    /// Frame number
    pub frame_nr: u32,
    /// Subchannel
    pub sub_band: usize,
    /// Time slot
    pub time_slot: usize,
    /// Spatial layer (beam)
    pub spatial_layer: usize,
    /// Transmit power
    pub tx_power: Power,
    /// Modulation and coding
    pub phy_mode: PhyMode,
    /// Beamforming pattern, if any
    pub pattern: Option<Pattern>,
    /// Channel estimate used for the decision
    pub estimated_cand_i: CandI,
    /// Compounds in transmission order
    pub compounds: Vec<CompoundPtr>,
}

impl MapInfoEntry {
    /// Empty burst for `user` starting at `start`
    pub fn new(user: UserId, start: SimTime) -> Self {
        Self {
            start,
            end: start,
            user,
            frame_nr: 0,
            sub_band: 0,
            time_slot: 0,
            spatial_layer: 0,
            tx_power: Power::zero(),
            phy_mode: PhyMode::invalid(),
            pattern: None,
            estimated_cand_i: CandI::default(),
            compounds: Vec::new(),
        }
    }

    /// Duration of the burst
    pub fn duration(&self) -> SimTime {
        self.end - self.start
    }

    /// Total bits of all compounds
    pub fn bits(&self) -> Bits {
        self.compounds.iter().map(|c| c.bits).sum()
    }
}

/// Ordered list of bursts
pub type MapInfoCollection = Vec<MapInfoEntry>;

/// Uplink resources granted to one user
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PowerAllocation {
    /// Transmit power per subchannel
    pub tx_power_per_subband: Power,
    /// User
    pub user: UserId,
    /// Requested share of all resources, in [0,1]
    pub resource_share: f64,
    /// Upper limit of subchannels
    pub max_num_subbands: usize,
}

/// Uplink allocations per user
pub type PowerMap = BTreeMap<UserId, PowerAllocation>;

/// Queue occupancy of one connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueStatus {
    /// Bits waiting
    pub number_of_bits: Bits,
    /// PDUs waiting
    pub number_of_compounds: u32,
}

/// Bits and compounds removed by a queue reset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProbeOutput {
    /// Bits removed
    pub bits: Bits,
    /// PDUs removed
    pub compounds: u32,
}

impl std::ops::AddAssign for ProbeOutput {
    fn add_assign(&mut self, rhs: ProbeOutput) {
        self.bits += rhs.bits;
        self.compounds += rhs.compounds;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scheduler_spot_power_control() {
        assert_eq!(SchedulerSpot::UlSlave.power_control_type(), PowerControlType::UlSlave);
        assert!(SchedulerSpot::UlMaster.is_master());
        assert!(!SchedulerSpot::UlSlave.is_master());
    }

    #[test]
    #[should_panic(expected = "needs a PhyMode")]
    fn test_request_duration_without_phy_mode() {
        let request = RequestForResource::new(ConnectionId(1), UserId(1), 100);
        request.duration();
    }
}
