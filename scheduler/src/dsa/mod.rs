//! Dynamic subchannel assignment
//!
//! A [`DsaStrategy`] proposes the (subchannel, time slot, spatial layer) a
//! request is placed on. All variants share [`DsaPolicy`], the one admission
//! predicate every placement has to pass.

pub mod best_channel;
pub mod fixed;
pub mod linear_ffirst;
pub mod random;

pub use best_channel::BestChannel;
pub use fixed::Fixed;
pub use linear_ffirst::LinearFFirst;
pub use random::RandomDsa;

use crate::interfaces::PhyModeMapper;
use crate::map::SchedulingMap;
use crate::phy_mode::PhyMode;
use crate::strategy::SchedulerState;
use crate::types::{RequestForResource, SchedulerSpot};
use crate::SLOT_LENGTH_ROUNDING_TOLERANCE;
use common::utils::SimTime;
use std::fmt;
use tracing::trace;

/// Resource proposed for a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DsaResult {
    /// Subchannel
    pub sub_channel: usize,
    /// Time slot
    pub time_slot: usize,
    /// Spatial layer
    pub spatial_layer: usize,
}

impl fmt::Display for DsaResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}.{}.{}", self.sub_channel, self.time_slot, self.spatial_layer)
    }
}

/// Subchannel assignment used by the strategies
pub trait DsaStrategy {
    /// Name for logging
    fn name(&self) -> &'static str;

    /// Reset per-frame bookkeeping; called once per frame before any request
    fn initialize(&mut self, state: &SchedulerState, map: &SchedulingMap);

    /// Resource for `request` or `None` if nothing usable is left
    fn sub_channel_with_dsa(
        &mut self,
        request: &RequestForResource,
        state: &SchedulerState,
        map: &SchedulingMap,
    ) -> Option<DsaResult>;

    /// Shared admission policy
    fn policy(&self) -> &DsaPolicy;

    /// True if per-subchannel channel state must be collected for this variant
    fn requires_cqi(&self) -> bool {
        false
    }

    /// See [`DsaPolicy::channel_is_usable`]
    fn channel_is_usable(
        &self,
        position: DsaResult,
        request: &RequestForResource,
        state: &SchedulerState,
        map: &SchedulingMap,
    ) -> bool {
        self.policy().channel_is_usable(position, request, state, map)
    }
}

/// Admission rules shared by every DSA variant
#[derive(Debug, Clone)]
pub struct DsaPolicy {
    one_user_on_one_sub_channel: bool,
    highest_phy_mode: PhyMode,
}

impl DsaPolicy {
    /// Create the policy; the highest mode estimates durations of requests without a mode
    pub fn new(one_user_on_one_sub_channel: bool, mapper: &dyn PhyModeMapper) -> Self {
        Self { one_user_on_one_sub_channel, highest_phy_mode: mapper.highest_phy_mode() }
    }

    /// True if a block holds compounds of one user only
    pub fn one_user_on_one_sub_channel(&self) -> bool {
        self.one_user_on_one_sub_channel
    }

    /// Air time of `request`, assuming the highest mode if it has none yet
    pub fn compound_duration(&self, request: &RequestForResource) -> SimTime {
        match request.phy_mode {
            Some(mode) if mode.is_valid() => mode.duration_for(request.bits),
            _ => self.highest_phy_mode.duration_for(request.bits),
        }
    }

    /// Admission predicate for placing `request` at `position`
    ///
    /// Checked in order: the subchannel lock; the spot rule (an uplink slave
    /// may only use blocks the master granted to itself, a master may use any
    /// block); the SDMA pairing rule on layers above 0. A master then accepts
    /// any empty block outright, the caller sizes the burst to fit. Otherwise
    /// the one-user rule and finally the free time at the block's fixed PHY
    /// mode apply.
    pub fn channel_is_usable(
        &self,
        position: DsaResult,
        request: &RequestForResource,
        state: &SchedulerState,
        map: &SchedulingMap,
    ) -> bool {
        let DsaResult { sub_channel, time_slot, spatial_layer } = position;
        if !map.sub_channels[sub_channel].sub_channel_is_usable {
            trace!("channel_is_usable({}): subChannel locked", position);
            return false;
        }
        let prb = map.prb(sub_channel, time_slot, spatial_layer);

        match state.scheduler_spot {
            SchedulerSpot::UlSlave => {
                if prb.assigned_user() != Some(state.my_user_id) {
                    trace!("channel_is_usable({}): not granted to {}", position, state.my_user_id);
                    return false;
                }
            }
            SchedulerSpot::DlMaster | SchedulerSpot::UlMaster => {}
        }

        if spatial_layer != 0 {
            if let Some(grouping) = state.current.sdma_grouping() {
                let Some(occupant) = map.prb(sub_channel, time_slot, 0).first_user() else {
                    trace!("channel_is_usable({}): layer 0 still empty", position);
                    return false;
                };
                if occupant == request.user || !grouping.same_group(occupant, request.user) {
                    trace!("channel_is_usable({}): {} cannot pair with {}", position, request.user, occupant);
                    return false;
                }
            }
        }

        if state.scheduler_spot.is_master() && prb.is_empty() {
            trace!("channel_is_usable({}): empty block", position);
            return true;
        }

        if self.one_user_on_one_sub_channel {
            if let Some(first) = prb.first_user() {
                if first != request.user {
                    trace!("channel_is_usable({}): occupied by {}", position, first);
                    return false;
                }
            }
        }

        let duration = match prb.phy_mode().or(request.phy_mode) {
            Some(mode) if mode.is_valid() => mode.duration_for(request.bits),
            _ => self.highest_phy_mode.duration_for(request.bits),
        };
        prb.free_time() - duration >= -SLOT_LENGTH_ROUNDING_TOLERANCE
    }

    /// First usable layer of a block, lowest index first
    pub fn spatial_layer_for_sub_channel(
        &self,
        sub_channel: usize,
        time_slot: usize,
        request: &RequestForResource,
        state: &SchedulerState,
        map: &SchedulingMap,
    ) -> Option<usize> {
        (0..map.number_of_spatial_layers()).find(|&spatial_layer| {
            self.channel_is_usable(DsaResult { sub_channel, time_slot, spatial_layer }, request, state, map)
        })
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::phy_mode::TablePhyModeMapper;
    use common::types::{ConnectionId, Power, UserId};

    pub fn policy(one_user: bool) -> DsaPolicy {
        DsaPolicy::new(one_user, &TablePhyModeMapper::default())
    }

    pub fn request(user: u32, bits: u32) -> RequestForResource {
        RequestForResource::new(ConnectionId(user), UserId(user), bits)
    }

    /// Fill a block with one compound of `user` at the highest mode
    pub fn occupy(map: &mut SchedulingMap, position: DsaResult, user: u32, duration: SimTime) {
        let mode = TablePhyModeMapper::default().highest_phy_mode();
        map.add_compound(
            position.sub_channel,
            position.time_slot,
            position.spatial_layer,
            duration,
            ConnectionId(user),
            UserId(user),
            None,
            mode,
            Power::from_dbm(10.0),
            None,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::grouper::Grouping;
    use crate::strategy::state::test_support::{dl_state, state_for};
    use common::types::{CandI, UserId};

    fn at(sub_channel: usize, spatial_layer: usize) -> DsaResult {
        DsaResult { sub_channel, time_slot: 0, spatial_layer }
    }

    #[test]
    fn test_locked_sub_channel_is_unusable() {
        let state = dl_state(2, 1e-3, 1);
        let mut map = SchedulingMap::new(1e-3, 2, 1, 1, 0);
        map.mask_out_sub_channels(&[false, true]);
        let policy = policy(false);
        assert!(!policy.channel_is_usable(at(0, 0), &request(1, 100), &state, &map));
        assert!(policy.channel_is_usable(at(1, 0), &request(1, 100), &state, &map));
    }

    #[test]
    fn test_one_user_rule() {
        let state = dl_state(1, 1e-3, 1);
        let mut map = SchedulingMap::new(1e-3, 1, 1, 1, 0);
        occupy(&mut map, at(0, 0), 1, 1e-4);
        assert!(!policy(true).channel_is_usable(at(0, 0), &request(2, 100), &state, &map));
        assert!(policy(true).channel_is_usable(at(0, 0), &request(1, 100), &state, &map));
        assert!(policy(false).channel_is_usable(at(0, 0), &request(2, 100), &state, &map));
    }

    #[test]
    fn test_slave_needs_own_grant() {
        let mut state = state_for(SchedulerSpot::UlSlave, 2, 1e-3, 1);
        state.my_user_id = UserId(5);
        let mut map = SchedulingMap::new(1e-3, 2, 1, 1, 0);
        let mode = crate::phy_mode::TablePhyModeMapper::default().lowest_phy_mode();
        map.prb_mut(1, 0, 0).grant(UserId(5), mode, common::types::Power::from_dbm(20.0));
        let policy = policy(true);
        // empty and not granted
        assert!(!policy.channel_is_usable(at(0, 0), &request(9, 10), &state, &map));
        assert!(policy.channel_is_usable(at(1, 0), &request(9, 10), &state, &map));
        // the granted mode decides the duration: 125 bits fill 1 ms at the lowest mode
        assert!(policy.channel_is_usable(at(1, 0), &request(9, 125), &state, &map));
        assert!(!policy.channel_is_usable(at(1, 0), &request(9, 126), &state, &map));

        let master = state_for(SchedulerSpot::UlMaster, 2, 1e-3, 1);
        assert!(policy.channel_is_usable(at(0, 0), &request(9, 10), &master, &map));
    }

    #[test]
    fn test_sdma_pairing_rule() {
        let mut state = dl_state(1, 1e-3, 2);
        let mut grouping = Grouping::default();
        grouping.push_group([(UserId(1), CandI::default()), (UserId(2), CandI::default())].into_iter().collect());
        grouping.push_group([(UserId(3), CandI::default())].into_iter().collect());
        state.current.grouping = Some(grouping);
        let mut map = SchedulingMap::new(1e-3, 1, 1, 2, 0);
        let policy = policy(true);
        assert!(!policy.channel_is_usable(at(0, 1), &request(2, 10), &state, &map));

        occupy(&mut map, at(0, 0), 1, 1e-4);
        assert!(policy.channel_is_usable(at(0, 1), &request(2, 10), &state, &map));
        assert!(!policy.channel_is_usable(at(0, 1), &request(1, 10), &state, &map));
        assert!(!policy.channel_is_usable(at(0, 1), &request(3, 10), &state, &map));
        assert_eq!(policy.spatial_layer_for_sub_channel(0, 0, &request(2, 10), &state, &map), Some(1));
        assert_eq!(policy.spatial_layer_for_sub_channel(0, 0, &request(1, 10), &state, &map), Some(0));
        assert_eq!(policy.spatial_layer_for_sub_channel(0, 0, &request(3, 10), &state, &map), None);
    }

    #[test]
    fn test_free_time_with_tolerance() {
        let state = dl_state(1, 1e-3, 1);
        let mut map = SchedulingMap::new(1e-3, 1, 1, 1, 0);
        occupy(&mut map, at(0, 0), 1, 0.5e-3);
        let policy = policy(false);
        let highest = crate::phy_mode::TablePhyModeMapper::default().highest_phy_mode();
        let fits = (highest.data_rate * 0.5e-3).floor() as u32;
        assert!(policy.channel_is_usable(at(0, 0), &request(1, fits), &state, &map));
        assert!(!policy.channel_is_usable(at(0, 0), &request(1, fits + 1), &state, &map));
        assert!((policy.compound_duration(&request(1, fits)) - fits as f64 / highest.data_rate).abs() < 1e-12);
    }

    #[test]
    fn test_empty_block_usable_for_master() {
        let state = dl_state(1, 1e-3, 1);
        let mut map = SchedulingMap::new(1e-3, 1, 1, 1, 0);
        let policy = policy(false);
        // far more than one slot can carry
        assert!(policy.channel_is_usable(at(0, 0), &request(1, 10_000_000), &state, &map));

        occupy(&mut map, at(0, 0), 1, 1e-4);
        assert!(!policy.channel_is_usable(at(0, 0), &request(1, 10_000_000), &state, &map));
        assert!(policy.channel_is_usable(at(0, 0), &request(1, 10), &state, &map));
    }
}
