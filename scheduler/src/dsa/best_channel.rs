//! Best-channel assignment
//!
//! Each user gets the unused subchannel with the best channel state. A
//! subchannel found unusable is not offered to that user again in the same
//! frame. On the uplink the variant can keep a user's resources adjacent
//! (SC-FDMA) by searching outwards from its last subchannel.

use super::{DsaPolicy, DsaResult, DsaStrategy};
use crate::map::SchedulingMap;
use crate::strategy::SchedulerState;
use crate::types::RequestForResource;
use common::types::UserId;
use std::collections::BTreeMap;
use tracing::{trace, warn};

#[derive(Debug, Clone)]
struct UserInfo {
    used_sub_channels: Vec<bool>,
    last_used_sub_channel: Option<usize>,
    toggle_offset: isize,
}

impl UserInfo {
    fn new(sub_channels: usize) -> Self {
        Self { used_sub_channels: vec![false; sub_channels], last_used_sub_channel: None, toggle_offset: 1 }
    }
}

/// DSA choosing the subchannel with the best channel state
pub struct BestChannel {
    policy: DsaPolicy,
    adjacent_sub_channels_on_uplink: bool,
    user_info: BTreeMap<UserId, UserInfo>,
}

impl BestChannel {
    /// Create the strategy
    pub fn new(policy: DsaPolicy, adjacent_sub_channels_on_uplink: bool) -> Self {
        Self { policy, adjacent_sub_channels_on_uplink, user_info: BTreeMap::new() }
    }

    /// First usable time slot and layer of `sub_channel`
    fn usable_on(
        &self,
        sub_channel: usize,
        request: &RequestForResource,
        state: &SchedulerState,
        map: &SchedulingMap,
    ) -> Option<DsaResult> {
        (0..map.number_of_time_slots()).find_map(|time_slot| {
            self.policy
                .spatial_layer_for_sub_channel(sub_channel, time_slot, request, state, map)
                .map(|spatial_layer| DsaResult { sub_channel, time_slot, spatial_layer })
        })
    }

    /// Channel quality per subchannel; equal quality everywhere if unknown
    fn qualities(&self, user: UserId, state: &SchedulerState, sub_channels: usize) -> Vec<f64> {
        match state.current.channel_qualities_of_all_users.get(&user) {
            Some(cqi) if cqi.len() >= sub_channels => {
                cqi.iter().take(sub_channels).map(|q| q.gain_over_interference()).collect()
            }
            _ => {
                warn!("BestChannel: no channel state for {}, using subchannel order", user);
                vec![0.0; sub_channels]
            }
        }
    }

    fn free_search(
        &self,
        info: &mut UserInfo,
        request: &RequestForResource,
        state: &SchedulerState,
        map: &SchedulingMap,
    ) -> Option<DsaResult> {
        let qualities = self.qualities(request.user, state, map.number_of_sub_channels());
        loop {
            let mut best: Option<usize> = None;
            for (sub_channel, quality) in qualities.iter().enumerate() {
                if info.used_sub_channels[sub_channel] {
                    continue;
                }
                if best.map_or(true, |b| *quality > qualities[b]) {
                    best = Some(sub_channel);
                }
            }
            let sub_channel = best?;
            if let Some(result) = self.usable_on(sub_channel, request, state, map) {
                return Some(result);
            }
            info.used_sub_channels[sub_channel] = true;
        }
    }

    fn adjacent_search(
        &self,
        info: &mut UserInfo,
        last: usize,
        request: &RequestForResource,
        state: &SchedulerState,
        map: &SchedulingMap,
    ) -> Option<DsaResult> {
        let sub_channels = map.number_of_sub_channels() as isize;
        let mut found = None;
        for distance in 0..sub_channels {
            for sign in [info.toggle_offset, -info.toggle_offset] {
                let candidate = last as isize + sign * distance;
                if candidate < 0 || candidate >= sub_channels {
                    continue;
                }
                let sub_channel = candidate as usize;
                if info.used_sub_channels[sub_channel] {
                    continue;
                }
                match self.usable_on(sub_channel, request, state, map) {
                    Some(result) => {
                        found = Some(result);
                        break;
                    }
                    None => info.used_sub_channels[sub_channel] = true,
                }
            }
            if found.is_some() {
                break;
            }
        }
        info.toggle_offset = -info.toggle_offset;
        found
    }
}

impl DsaStrategy for BestChannel {
    fn name(&self) -> &'static str {
        "BestChannel"
    }

    fn initialize(&mut self, _state: &SchedulerState, _map: &SchedulingMap) {
        self.user_info.clear();
    }

    fn sub_channel_with_dsa(
        &mut self,
        request: &RequestForResource,
        state: &SchedulerState,
        map: &SchedulingMap,
    ) -> Option<DsaResult> {
        let sub_channels = map.number_of_sub_channels();
        let mut info = self
            .user_info
            .remove(&request.user)
            .unwrap_or_else(|| UserInfo::new(sub_channels));

        let result = match info.last_used_sub_channel {
            Some(last) if !state.is_tx && self.adjacent_sub_channels_on_uplink => {
                self.adjacent_search(&mut info, last, request, state, map)
            }
            _ => self.free_search(&mut info, request, state, map),
        };
        if let Some(result) = result {
            info.last_used_sub_channel = Some(result.sub_channel);
            trace!("BestChannel: {} -> {}", request, result);
        }
        self.user_info.insert(request.user, info);
        result
    }

    fn policy(&self) -> &DsaPolicy {
        &self.policy
    }

    fn requires_cqi(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::strategy::state::test_support::{dl_state, state_for};
    use crate::types::SchedulerSpot;
    use common::types::{ChannelQualityOnOneSubChannel, Power, Ratio};

    fn cqi(pathloss_db: &[f64]) -> Vec<ChannelQualityOnOneSubChannel> {
        pathloss_db
            .iter()
            .enumerate()
            .map(|(sc, &pl)| ChannelQualityOnOneSubChannel::new(Ratio::from_db(pl), Power::from_dbm(-100.0), sc))
            .collect()
    }

    #[test]
    fn test_picks_best_then_next_best() {
        let mut state = dl_state(4, 1e-3, 1);
        state.current.channel_qualities_of_all_users.insert(UserId(1), cqi(&[100.0, 90.0, 95.0, 120.0]));
        state.current.channel_qualities_of_all_users.insert(UserId(2), cqi(&[100.0, 90.0, 95.0, 120.0]));
        let mut map = SchedulingMap::new(1e-3, 4, 1, 1, 0);
        let mut dsa = BestChannel::new(policy(true), false);
        dsa.initialize(&state, &map);
        let first = dsa.sub_channel_with_dsa(&request(1, 100), &state, &map).unwrap();
        assert_eq!(first.sub_channel, 1);
        occupy(&mut map, first, 1, 1e-4);
        let second = dsa.sub_channel_with_dsa(&request(2, 100), &state, &map).unwrap();
        assert_eq!(second.sub_channel, 2);
        // user 1 still prefers its block
        assert_eq!(dsa.sub_channel_with_dsa(&request(1, 100), &state, &map).unwrap().sub_channel, 1);
    }

    #[test]
    fn test_gives_up_when_everything_tried() {
        let mut state = dl_state(2, 1e-3, 1);
        state.current.channel_qualities_of_all_users.insert(UserId(2), cqi(&[80.0, 90.0]));
        let mut map = SchedulingMap::new(1e-3, 2, 1, 1, 0);
        occupy(&mut map, DsaResult { sub_channel: 0, time_slot: 0, spatial_layer: 0 }, 1, 1e-4);
        occupy(&mut map, DsaResult { sub_channel: 1, time_slot: 0, spatial_layer: 0 }, 1, 1e-4);
        let mut dsa = BestChannel::new(policy(true), false);
        dsa.initialize(&state, &map);
        assert!(dsa.sub_channel_with_dsa(&request(2, 100), &state, &map).is_none());
    }

    #[test]
    fn test_uplink_stays_adjacent() {
        let mut state = state_for(SchedulerSpot::UlMaster, 5, 1e-3, 1);
        state.current.channel_qualities_of_all_users.insert(UserId(1), cqi(&[99.0, 98.0, 97.0, 96.0, 90.0]));
        let mut map = SchedulingMap::new(1e-3, 5, 1, 1, 0);
        let mut dsa = BestChannel::new(policy(true), true);
        dsa.initialize(&state, &map);
        let first = dsa.sub_channel_with_dsa(&request(1, 1125), &state, &map).unwrap();
        assert_eq!(first.sub_channel, 4);
        occupy(&mut map, first, 1, 1e-3);
        // block 4 is full, the next one is its neighbour and not the best remaining
        let second = dsa.sub_channel_with_dsa(&request(1, 1125), &state, &map).unwrap();
        assert_eq!(second.sub_channel, 3);
    }
}
