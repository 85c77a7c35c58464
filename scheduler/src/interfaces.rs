//! Collaborator interfaces
//!
//! The scheduler consumes station registry, PHY mode and beamforming services
//! through these traits. The simulator and the tests plug in
//! [`crate::registry::StaticRegistry`].

use crate::compound::Compound;
use crate::phy_mode::PhyMode;
use crate::types::{Bits, ConnectionSet, Pattern, PowerMap, UserSet};
use common::types::{
    CandI, ChannelQualitiesOnAllSubChannels, ConnectionId, PowerCapabilities, Ratio, UserId,
};
use std::collections::BTreeMap;

/// Maps SINR values to PHY modes
pub trait PhyModeMapper {
    /// Highest-rate mode decodable at `sinr`; invalid below the floor
    fn best_phy_mode(&self, sinr: Ratio) -> PhyMode;

    /// True if at least the most robust mode works at `sinr`
    fn sinr_is_above_limit(&self, sinr: Ratio) -> bool;

    /// SINR threshold of `phy_mode`
    fn min_sinr_ratio(&self, phy_mode: &PhyMode) -> Ratio;

    /// Highest-rate mode
    fn highest_phy_mode(&self) -> PhyMode;

    /// Most robust mode
    fn lowest_phy_mode(&self) -> PhyMode;

    /// Number of modes
    fn phy_mode_count(&self) -> usize;

    /// Mode at `index`, 0 being the most robust
    fn phy_mode_for_index(&self, index: usize) -> PhyMode;
}

/// Station registry: connections, users and link estimates
pub trait Registry {
    /// Own station
    fn my_user_id(&self) -> UserId;

    /// User a connection belongs to
    fn user_for_cid(&self, cid: ConnectionId) -> UserId;

    /// Connections of a user in ascending order
    fn connections_for_user(&self, user: UserId) -> Vec<ConnectionId>;

    /// Connection a PDU belongs to
    fn cid_for_pdu(&self, compound: &Compound) -> ConnectionId;

    /// Admission limit of every per-connection queue
    fn queue_size_limit_per_connection(&self) -> Bits;

    /// Users reachable in frame `frame_nr`
    fn filter_reachable(&self, users: &UserSet, frame_nr: u32) -> UserSet;

    /// Connections reachable in frame `frame_nr`
    fn filter_reachable_connections(&self, connections: &ConnectionSet, frame_nr: u32) -> ConnectionSet;

    /// Per-subchannel channel state of `user` as seen on the uplink
    fn channel_qualities_on_uplink(&self, user: UserId, frame_nr: u32) -> Option<ChannelQualitiesOnAllSubChannels>;

    /// Per-subchannel channel state of `user` as seen on the downlink
    fn channel_qualities_on_downlink(&self, user: UserId, frame_nr: u32) -> Option<ChannelQualitiesOnAllSubChannels>;

    /// Uplink resource share, subband limit and power per active user
    fn calc_ul_resources(&self, users: &UserSet, phy_resources: usize) -> PowerMap;

    /// Users with pending uplink data
    fn active_ul_users(&self) -> UserSet;

    /// Number of users served through `user` (1 for terminals)
    fn total_number_of_users(&self, user: UserId) -> usize;

    /// Number of priority classes
    fn number_of_priorities(&self) -> usize;

    /// Priority class of a connection
    fn priority_for_connection(&self, cid: ConnectionId) -> usize;

    /// Connections of one priority class
    fn connections_for_priority(&self, priority: usize) -> ConnectionSet;

    /// True for a downlink scheduler
    fn is_dl(&self) -> bool;

    /// True if per-subchannel channel state is available at all
    fn cqi_available(&self) -> bool;

    /// Power limits; `None` asks for the own station
    fn power_capabilities(&self, user: Option<UserId>) -> PowerCapabilities;

    /// PHY mode table
    fn phy_mode_mapper(&self) -> &dyn PhyModeMapper;

    /// Estimated C/I at `user` when we transmit to it
    fn estimate_tx_sinr_at(&self, user: UserId, frame_nr: u32) -> CandI;

    /// Estimated C/I of `user`'s signal at our receiver
    fn estimate_rx_sinr_of(&self, user: UserId, frame_nr: u32) -> CandI;
}

/// Beamforming service
pub trait BeamformingProvider {
    /// C/I of each user when all users of `group` are served at once (transmit)
    fn calculate_cand_is_tx(&self, group: &UserSet) -> BTreeMap<UserId, CandI>;

    /// C/I of each user when all users of `group` are received at once
    fn calculate_cand_is_rx(&self, group: &UserSet) -> BTreeMap<UserId, CandI>;

    /// Pattern towards `user` with nulls towards `undesired`
    fn calculate_and_set_beam(&self, user: UserId, undesired: &UserSet) -> Pattern;
}
