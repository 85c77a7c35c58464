//! Random assignment: uniform over all usable blocks

use super::{DsaPolicy, DsaResult, DsaStrategy};
use crate::map::SchedulingMap;
use crate::strategy::SchedulerState;
use crate::types::RequestForResource;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use tracing::trace;

/// DSA drawing one of the usable blocks at random
pub struct RandomDsa {
    policy: DsaPolicy,
    rng: StdRng,
}

impl RandomDsa {
    /// Create the strategy with a seeded generator
    pub fn new(policy: DsaPolicy, rng: StdRng) -> Self {
        Self { policy, rng }
    }
}

impl DsaStrategy for RandomDsa {
    fn name(&self) -> &'static str {
        "Random"
    }

    fn initialize(&mut self, _state: &SchedulerState, _map: &SchedulingMap) {}

    fn sub_channel_with_dsa(
        &mut self,
        request: &RequestForResource,
        state: &SchedulerState,
        map: &SchedulingMap,
    ) -> Option<DsaResult> {
        let mut usable = Vec::new();
        for sub_channel in 0..map.number_of_sub_channels() {
            for time_slot in 0..map.number_of_time_slots() {
                for spatial_layer in 0..map.number_of_spatial_layers() {
                    let position = DsaResult { sub_channel, time_slot, spatial_layer };
                    if self.policy.channel_is_usable(position, request, state, map) {
                        usable.push(position);
                    }
                }
            }
        }
        let choice = usable.choose(&mut self.rng).copied();
        trace!("Random: {} of {} usable blocks -> {:?}", request, usable.len(), choice);
        choice
    }

    fn policy(&self) -> &DsaPolicy {
        &self.policy
    }
}
