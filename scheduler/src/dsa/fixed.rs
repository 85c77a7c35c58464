//! Fixed partition of the resource space
//!
//! At frame start the (subchannel, time slot) pairs are sorted frequency-first
//! or time-first and cut into one contiguous range per user. With SDMA the
//! ranges go to groups instead and the members of a group share their range
//! on consecutive spatial layers.

use super::{DsaPolicy, DsaResult, DsaStrategy};
use crate::interfaces::Registry;
use crate::map::SchedulingMap;
use crate::strategy::SchedulerState;
use crate::types::{ConnectionSet, RequestForResource, UserSet};
use common::types::UserId;
use std::collections::BTreeMap;
use std::rc::Rc;
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Allocation {
    start: usize,
    amount: usize,
    spatial_layer: usize,
}

/// DSA assigning every user a static share of the frame
pub struct Fixed {
    policy: DsaPolicy,
    registry: Rc<dyn Registry>,
    time_first: bool,
    sorted_resources: Vec<(usize, usize)>,
    allocations: BTreeMap<UserId, Allocation>,
}

impl Fixed {
    /// Create the strategy; `time_first` fills a subchannel's time slots before the next subchannel
    pub fn new(policy: DsaPolicy, registry: Rc<dyn Registry>, time_first: bool) -> Self {
        Self { policy, registry, time_first, sorted_resources: Vec::new(), allocations: BTreeMap::new() }
    }

    /// Users of all configured connections
    fn all_users(&self) -> UserSet {
        let connections: ConnectionSet = (0..self.registry.number_of_priorities())
            .flat_map(|priority| self.registry.connections_for_priority(priority))
            .collect();
        connections.iter().map(|&cid| self.registry.user_for_cid(cid)).collect()
    }
}

impl DsaStrategy for Fixed {
    fn name(&self) -> &'static str {
        "Fixed"
    }

    fn initialize(&mut self, state: &SchedulerState, map: &SchedulingMap) {
        self.sorted_resources.clear();
        self.allocations.clear();

        // each entry is the member list of one share, in layer order
        let shares: Vec<Vec<UserId>> = match state.current.sdma_grouping() {
            Some(grouping) if state.current.strategy_input.beamforming => {
                grouping.groups.iter().map(|g| g.keys().copied().collect()).collect()
            }
            _ => self.all_users().into_iter().map(|user| vec![user]).collect(),
        };
        if shares.is_empty() {
            return;
        }

        let sub_channels = map.number_of_sub_channels();
        let time_slots = map.number_of_time_slots();
        self.sorted_resources = if self.time_first {
            (0..sub_channels).flat_map(|sc| (0..time_slots).map(move |ts| (sc, ts))).collect()
        } else {
            (0..time_slots).flat_map(|ts| (0..sub_channels).map(move |sc| (sc, ts))).collect()
        };

        let resources = self.sorted_resources.len();
        let resources_less = resources / shares.len();
        let users_more = resources % shares.len();
        let users_less = shares.len() - users_more;
        assert!(
            resources_less > 0,
            "not enough resources for all users: {} shares on {} resources",
            shares.len(),
            resources
        );
        debug!(
            "Fixed: {} shares get {} resources, {} get {}",
            users_less,
            resources_less,
            users_more,
            resources_less + 1
        );

        let mut start = 0;
        for (n, members) in shares.iter().enumerate() {
            let amount = if n < users_less { resources_less } else { resources_less + 1 };
            for (spatial_layer, &user) in members.iter().enumerate() {
                self.allocations.insert(user, Allocation { start, amount, spatial_layer });
            }
            start += amount;
        }
        debug_assert_eq!(start, resources);
    }

    fn sub_channel_with_dsa(
        &mut self,
        request: &RequestForResource,
        state: &SchedulerState,
        map: &SchedulingMap,
    ) -> Option<DsaResult> {
        let allocation = match self.allocations.get(&request.user) {
            Some(allocation) => *allocation,
            None => panic!("Fixed: no resources for {}", request.user),
        };
        if allocation.spatial_layer >= map.number_of_spatial_layers() {
            return None;
        }
        let result = self.sorted_resources[allocation.start..allocation.start + allocation.amount]
            .iter()
            .map(|&(sub_channel, time_slot)| DsaResult {
                sub_channel,
                time_slot,
                spatial_layer: allocation.spatial_layer,
            })
            .find(|&position| self.policy.channel_is_usable(position, request, state, map));
        trace!("Fixed: {} -> {:?}", request, result);
        result
    }

    fn policy(&self) -> &DsaPolicy {
        &self.policy
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::registry::{RegistryConfig, StaticRegistry, StationConfig};
    use crate::strategy::state::test_support::dl_state;

    fn registry(users: u32) -> Rc<StaticRegistry> {
        let mut config = RegistryConfig::default();
        config.stations = (1..=users).map(|u| StationConfig::new(u, &[u])).collect();
        Rc::new(StaticRegistry::new(config).unwrap())
    }

    #[test]
    fn test_partition_frequency_first() {
        let state = dl_state(5, 1e-3, 1);
        let map = SchedulingMap::new(1e-3, 5, 1, 1, 0);
        let mut dsa = Fixed::new(policy(true), registry(2), false);
        dsa.initialize(&state, &map);
        // 5 resources on 2 users: the first gets 2, the second 3
        assert_eq!(dsa.allocations[&UserId(1)], Allocation { start: 0, amount: 2, spatial_layer: 0 });
        assert_eq!(dsa.allocations[&UserId(2)], Allocation { start: 2, amount: 3, spatial_layer: 0 });
        assert_eq!(dsa.sub_channel_with_dsa(&request(2, 10), &state, &map).unwrap().sub_channel, 2);
    }

    #[test]
    fn test_stays_within_own_range() {
        let state = dl_state(2, 1e-3, 1);
        let mut map = SchedulingMap::new(1e-3, 2, 2, 1, 0);
        let mut dsa = Fixed::new(policy(true), registry(2), true);
        dsa.initialize(&state, &map);
        // time-first: user 1 owns both time slots of subchannel 0
        let first = dsa.sub_channel_with_dsa(&request(1, 1125), &state, &map).unwrap();
        assert_eq!(first, DsaResult { sub_channel: 0, time_slot: 0, spatial_layer: 0 });
        occupy(&mut map, first, 1, 1e-3);
        let second = dsa.sub_channel_with_dsa(&request(1, 1125), &state, &map).unwrap();
        assert_eq!(second, DsaResult { sub_channel: 0, time_slot: 1, spatial_layer: 0 });
        occupy(&mut map, second, 1, 1e-3);
        assert!(dsa.sub_channel_with_dsa(&request(1, 1125), &state, &map).is_none());
    }

    #[test]
    #[should_panic(expected = "not enough resources")]
    fn test_more_users_than_resources() {
        let state = dl_state(2, 1e-3, 1);
        let map = SchedulingMap::new(1e-3, 2, 1, 1, 0);
        Fixed::new(policy(true), registry(3), false).initialize(&state, &map);
    }
}
