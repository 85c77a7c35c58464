//! Scheduler state
//!
//! [`SchedulerState`] holds what a strategy instance knows about its spot in
//! the system and keeps across frames. [`RevolvingState`] is replaced at the
//! start of every frame and carries the frame's input, grouping and channel
//! state to the DSA and APC helpers.

use crate::grouper::Grouping;
use crate::map::SchedulingMap;
use crate::phy_mode::PhyMode;
use crate::types::{ConnectionSet, MapInfoCollection, PowerControlType, SchedulerSpot};
use common::types::{ChannelQualitiesOnAllSubChannels, ChannelQualityOnOneSubChannel, Power, PowerCapabilities, UserId};
use common::utils::SimTime;
use std::collections::BTreeMap;

/// Input of one scheduling pass
#[derive(Debug, Clone)]
pub struct StrategyInput {
    /// Number of subchannels
    pub f_channels: usize,
    /// Time slots per subchannel
    pub number_of_time_slots: usize,
    /// Spatial layers per time slot
    pub max_spatial_layers: usize,
    /// Length of one time slot
    pub slot_length: SimTime,
    /// Frame being scheduled
    pub frame_nr: u32,
    /// True if SDMA beamforming is used
    pub beamforming: bool,
    /// Pre-filled map: the master's grants for an uplink slave or a masked map
    pub input_scheduling_map: Option<SchedulingMap>,
}

impl StrategyInput {
    /// Input for an empty map of the given dimensions
    pub fn new(
        f_channels: usize,
        slot_length: SimTime,
        number_of_time_slots: usize,
        max_spatial_layers: usize,
        frame_nr: u32,
    ) -> Self {
        Self {
            f_channels,
            number_of_time_slots,
            max_spatial_layers,
            slot_length,
            frame_nr,
            beamforming: false,
            input_scheduling_map: None,
        }
    }

    /// Start from `map` instead of an empty map
    pub fn with_input_map(mut self, map: SchedulingMap) -> Self {
        self.input_scheduling_map = Some(map);
        self
    }

    /// Enable or disable SDMA beamforming
    pub fn with_beamforming(mut self, beamforming: bool) -> Self {
        self.beamforming = beamforming;
        self
    }

    /// Map to fill in this pass
    pub(crate) fn take_scheduling_map(&mut self) -> SchedulingMap {
        match self.input_scheduling_map.take() {
            Some(map) => map,
            None => SchedulingMap::new(
                self.slot_length,
                self.f_channels,
                self.number_of_time_slots,
                self.max_spatial_layers,
                self.frame_nr,
            ),
        }
    }
}

/// State valid for one frame only
#[derive(Debug, Clone)]
pub struct RevolvingState {
    /// Input of this pass, without the input map
    pub strategy_input: StrategyInput,
    /// Bursts produced so far
    pub bursts: MapInfoCollection,
    /// Connections with data when the pass started
    pub active_connections: ConnectionSet,
    /// Grouping used in this frame
    pub grouping: Option<Grouping>,
    /// Priority class currently served
    pub current_priority: usize,
    /// Per-subchannel channel state of every active user
    pub channel_qualities_of_all_users: BTreeMap<UserId, ChannelQualitiesOnAllSubChannels>,
}

impl RevolvingState {
    /// Fresh state for one frame
    pub fn new(strategy_input: StrategyInput) -> Self {
        Self {
            strategy_input,
            bursts: MapInfoCollection::new(),
            active_connections: ConnectionSet::new(),
            grouping: None,
            current_priority: 0,
            channel_qualities_of_all_users: BTreeMap::new(),
        }
    }

    /// The grouping if several spatial layers are shared by its groups
    pub fn sdma_grouping(&self) -> Option<&Grouping> {
        if self.strategy_input.max_spatial_layers > 1 {
            self.grouping.as_ref().filter(|g| !g.is_empty())
        } else {
            None
        }
    }

    /// Channel state of `user` on `sub_channel`, if known
    pub fn cqi_for(&self, user: UserId, sub_channel: usize) -> Option<ChannelQualityOnOneSubChannel> {
        self.channel_qualities_of_all_users.get(&user)?.get(sub_channel).copied()
    }
}

/// State of one strategy instance
#[derive(Debug, Clone)]
pub struct SchedulerState {
    /// True if this scheduler decides its own transmissions
    pub is_tx: bool,
    /// True for downlink
    pub is_dl: bool,
    /// True if per-subchannel channel state is used
    pub use_cqi: bool,
    /// Who decides the transmit power
    pub power_control_type: PowerControlType,
    /// Position in the system
    pub scheduler_spot: SchedulerSpot,
    /// Skip users whose SINR is below the most robust PHY mode
    pub exclude_too_low_sinr: bool,
    /// PHY mode forced for every placement
    pub default_phy_mode: Option<PhyMode>,
    /// Transmit power forced for every placement
    pub default_tx_power: Option<Power>,
    /// Own power limits
    pub power_capabilities: PowerCapabilities,
    /// OFDM symbol length; burst durations are rounded up to it
    pub symbol_duration: SimTime,
    /// Own station
    pub my_user_id: UserId,
    /// Per-frame state
    pub current: RevolvingState,
}

impl SchedulerState {
    /// Slot length of the current frame
    pub fn slot_length(&self) -> SimTime {
        self.current.strategy_input.slot_length
    }

    /// Frame currently scheduled
    pub fn frame_nr(&self) -> u32 {
        self.current.strategy_input.frame_nr
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Downlink master state for a map of the given dimensions
    pub fn dl_state(f_channels: usize, slot_length: SimTime, layers: usize) -> SchedulerState {
        state_for(SchedulerSpot::DlMaster, f_channels, slot_length, layers)
    }

    pub fn state_for(spot: SchedulerSpot, f_channels: usize, slot_length: SimTime, layers: usize) -> SchedulerState {
        let power = PowerCapabilities::new(Power::from_dbm(30.0), Power::from_dbm(27.0), Power::from_dbm(40.0));
        SchedulerState {
            is_tx: spot != SchedulerSpot::UlMaster,
            is_dl: spot == SchedulerSpot::DlMaster,
            use_cqi: false,
            power_control_type: spot.power_control_type(),
            scheduler_spot: spot,
            exclude_too_low_sinr: true,
            default_phy_mode: None,
            default_tx_power: None,
            power_capabilities: power,
            symbol_duration: 0.0,
            my_user_id: UserId(0),
            current: RevolvingState::new(StrategyInput::new(f_channels, slot_length, 1, layers, 0)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::types::{CandI, Ratio};

    #[test]
    fn test_input_map_is_taken_once() {
        let map = SchedulingMap::new(1e-3, 2, 1, 1, 7);
        let mut input = StrategyInput::new(4, 1e-3, 1, 1, 7).with_input_map(map);
        assert_eq!(input.take_scheduling_map().number_of_sub_channels(), 2);
        assert_eq!(input.take_scheduling_map().number_of_sub_channels(), 4);
    }

    #[test]
    fn test_sdma_grouping_needs_several_layers() {
        let mut grouping = Grouping::default();
        grouping.push_group([(UserId(1), CandI::default())].into_iter().collect());
        let mut state = RevolvingState::new(StrategyInput::new(4, 1e-3, 1, 1, 0));
        state.grouping = Some(grouping.clone());
        assert!(state.sdma_grouping().is_none());
        let mut state = RevolvingState::new(StrategyInput::new(4, 1e-3, 1, 2, 0));
        state.grouping = Some(grouping);
        assert!(state.sdma_grouping().is_some());
    }

    #[test]
    fn test_cqi_lookup() {
        let mut state = RevolvingState::new(StrategyInput::new(2, 1e-3, 1, 1, 0));
        let cqi = ChannelQualityOnOneSubChannel::new(Ratio::from_db(90.0), Power::from_dbm(-95.0), 1);
        state.channel_qualities_of_all_users.insert(UserId(3), vec![cqi, cqi]);
        assert_eq!(state.cqi_for(UserId(3), 1), Some(cqi));
        assert_eq!(state.cqi_for(UserId(3), 2), None);
        assert_eq!(state.cqi_for(UserId(4), 0), None);
    }
}
