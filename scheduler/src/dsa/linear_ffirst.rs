//! Linear frequency-first assignment
//!
//! Scans layers, then time slots, then subchannels, starting at the last
//! block used and wrapping around once. Consecutive requests therefore keep
//! filling the same block before moving on. Uplink slaves use the same scan
//! over the blocks their master granted.

use super::{DsaPolicy, DsaResult, DsaStrategy};
use crate::map::SchedulingMap;
use crate::strategy::SchedulerState;
use crate::types::RequestForResource;
use rand::rngs::StdRng;
use rand::Rng;
use tracing::trace;

/// First-fit DSA continuing where the previous request ended
pub struct LinearFFirst {
    policy: DsaPolicy,
    random_start: Option<StdRng>,
    last_used: usize,
}

impl LinearFFirst {
    /// Create the strategy starting every frame at subchannel 0
    pub fn new(policy: DsaPolicy) -> Self {
        Self { policy, random_start: None, last_used: 0 }
    }

    /// Start every frame at a random subchannel
    pub fn with_random_start(mut self, rng: StdRng) -> Self {
        self.random_start = Some(rng);
        self
    }

    fn position(map: &SchedulingMap, index: usize) -> DsaResult {
        let layers = map.number_of_spatial_layers();
        let time_slots = map.number_of_time_slots();
        DsaResult {
            sub_channel: index / (layers * time_slots),
            time_slot: (index / layers) % time_slots,
            spatial_layer: index % layers,
        }
    }
}

impl DsaStrategy for LinearFFirst {
    fn name(&self) -> &'static str {
        "LinearFFirst"
    }

    fn initialize(&mut self, _state: &SchedulerState, map: &SchedulingMap) {
        let per_sub_channel = map.number_of_time_slots() * map.number_of_spatial_layers();
        self.last_used = match self.random_start.as_mut() {
            Some(rng) if map.number_of_sub_channels() > 0 => {
                rng.gen_range(0..map.number_of_sub_channels()) * per_sub_channel
            }
            _ => 0,
        };
    }

    fn sub_channel_with_dsa(
        &mut self,
        request: &RequestForResource,
        state: &SchedulerState,
        map: &SchedulingMap,
    ) -> Option<DsaResult> {
        let total = map.number_of_sub_channels() * map.number_of_time_slots() * map.number_of_spatial_layers();
        for step in 0..total {
            let index = (self.last_used + step) % total;
            let position = Self::position(map, index);
            if self.policy.channel_is_usable(position, request, state, map) {
                self.last_used = index;
                trace!("LinearFFirst: {} -> {}", request, position);
                return Some(position);
            }
        }
        trace!("LinearFFirst: no resource left for {}", request);
        None
    }

    fn policy(&self) -> &DsaPolicy {
        &self.policy
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::strategy::state::test_support::dl_state;
    use rand::SeedableRng;

    #[test]
    fn test_continues_on_last_block() {
        let state = dl_state(3, 1e-3, 1);
        let mut map = SchedulingMap::new(1e-3, 3, 1, 1, 0);
        let mut dsa = LinearFFirst::new(policy(true));
        dsa.initialize(&state, &map);
        let first = dsa.sub_channel_with_dsa(&request(1, 100), &state, &map).unwrap();
        assert_eq!(first.sub_channel, 0);
        occupy(&mut map, first, 1, 1e-4);
        // same user keeps the block, another user moves on
        assert_eq!(dsa.sub_channel_with_dsa(&request(1, 100), &state, &map).unwrap().sub_channel, 0);
        let second = dsa.sub_channel_with_dsa(&request(2, 100), &state, &map).unwrap();
        assert_eq!(second.sub_channel, 1);
        occupy(&mut map, second, 2, 1e-4);
        // wraps around from the last used block
        map.mask_out_sub_channels(&[true, true, false]);
        assert!(dsa.sub_channel_with_dsa(&request(3, 100), &state, &map).is_none());
        assert_eq!(dsa.sub_channel_with_dsa(&request(1, 100), &state, &map).unwrap().sub_channel, 0);
    }

    #[test]
    fn test_scans_time_slots_before_sub_channels() {
        let state = dl_state(2, 1e-3, 1);
        let mut map = SchedulingMap::new(1e-3, 2, 2, 1, 0);
        let mut dsa = LinearFFirst::new(policy(true));
        dsa.initialize(&state, &map);
        occupy(&mut map, DsaResult { sub_channel: 0, time_slot: 0, spatial_layer: 0 }, 1, 1e-4);
        let position = dsa.sub_channel_with_dsa(&request(2, 100), &state, &map).unwrap();
        assert_eq!(position, DsaResult { sub_channel: 0, time_slot: 1, spatial_layer: 0 });
    }

    #[test]
    fn test_random_start_is_reproducible() {
        let state = dl_state(8, 1e-3, 1);
        let map = SchedulingMap::new(1e-3, 8, 1, 1, 0);
        let mut a = LinearFFirst::new(policy(true)).with_random_start(StdRng::seed_from_u64(7));
        let mut b = LinearFFirst::new(policy(true)).with_random_start(StdRng::seed_from_u64(7));
        a.initialize(&state, &map);
        b.initialize(&state, &map);
        assert_eq!(
            a.sub_channel_with_dsa(&request(1, 10), &state, &map),
            b.sub_channel_with_dsa(&request(1, 10), &state, &map)
        );
    }
}
