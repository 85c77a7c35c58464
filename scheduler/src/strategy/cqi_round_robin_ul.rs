//! Channel-aware round robin for the uplink master
//!
//! The free blocks are split evenly over the groups. Groups take turns, the
//! first group rotating from frame to frame, and each picks its share of
//! blocks on the subchannels where its weakest member sees the best channel.

use super::{SchedulingAlgorithm, StrategyCore};
use crate::dsa::DsaResult;
use crate::grouper::Group;
use crate::map::SchedulingMap;
use crate::queue::Queue;
use tracing::{debug, trace};

/// Round robin over groups with best-channel block selection
#[derive(Debug, Default)]
pub struct CqiEnabledRoundRobinUL {
    first_group: usize,
}

impl CqiEnabledRoundRobinUL {
    /// Create the strategy
    pub fn new() -> Self {
        Self::default()
    }
}

/// Subchannels ordered best first for all members of `group`
fn ranked_sub_channels(core: &StrategyCore, group: &Group, sub_channels: &[usize]) -> Vec<usize> {
    let mut ranked: Vec<(usize, f64)> = sub_channels
        .iter()
        .map(|&sc| {
            let quality = group
                .keys()
                .map(|u| core.channel_state(*u, sc).gain_over_interference())
                .fold(f64::INFINITY, f64::min);
            (sc, quality)
        })
        .collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
    ranked.into_iter().map(|(sc, _)| sc).collect()
}

impl SchedulingAlgorithm for CqiEnabledRoundRobinUL {
    fn name(&self) -> &'static str {
        "CQIEnabledRoundRobinUL"
    }

    fn requires_cqi(&self) -> bool {
        true
    }

    fn do_start_scheduling(&mut self, core: &mut StrategyCore, map: &mut SchedulingMap, queue: &mut dyn Queue) {
        let grouping = core.regroup(queue);
        let n_groups = grouping.groups.len();
        if n_groups == 0 {
            return;
        }
        let usable: Vec<usize> =
            (0..map.number_of_sub_channels()).filter(|&sc| map.sub_channels[sc].sub_channel_is_usable).collect();
        let n_ts = map.number_of_time_slots();
        // used[sc][ts]
        let mut used: Vec<Vec<bool>> = (0..map.number_of_sub_channels())
            .map(|sc| (0..n_ts).map(|ts| !map.prb(sc, ts, 0).is_empty()).collect())
            .collect();
        let free = usable.iter().map(|&sc| used[sc].iter().filter(|u| !**u).count()).sum::<usize>();
        let per_group = (free / n_groups).max(1);
        debug!("CQIEnabledRoundRobinUL: {} free blocks, {} per group", free, per_group);

        let start = self.first_group % n_groups;
        self.first_group = (start + 1) % n_groups;
        for offset in 0..n_groups {
            let group = &grouping.groups[(start + offset) % n_groups];
            let mut blocks = Vec::with_capacity(per_group);
            'pick: for sc in ranked_sub_channels(core, group, &usable) {
                for ts in 0..n_ts {
                    if blocks.len() == per_group {
                        break 'pick;
                    }
                    if !used[sc][ts] {
                        used[sc][ts] = true;
                        blocks.push((sc, ts));
                    }
                }
            }
            if blocks.is_empty() {
                trace!("no block left for group {}", (start + offset) % n_groups);
                break;
            }

            for (layer, (&user, cand_i)) in group.iter().enumerate().take(map.number_of_spatial_layers()) {
                let tx_power = core.nominal_tx_power(user) * grouping.share_of_power_per_stream(user);
                let pattern = core.pattern_for(user);
                for &(sub_channel, time_slot) in &blocks {
                    let sinr = if group.len() == 1 {
                        core.channel_state(user, sub_channel).sinr_for(tx_power)
                    } else {
                        cand_i.sinr()
                    };
                    let phy_mode = core.get_best_phy_mode(sinr);
                    if !phy_mode.is_valid() {
                        trace!("{} cannot use #{}: SINR {}", user, sub_channel, sinr);
                        continue;
                    }
                    let position = DsaResult { sub_channel, time_slot, spatial_layer: layer };
                    for cid in core.connections_with_data(queue, user) {
                        core.fill_block(map, queue, cid, user, position, phy_mode, tx_power, pattern.clone());
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{RegistryConfig, StaticRegistry, StationConfig};
    use crate::strategy::test_support::filled_queue;
    use crate::strategy::{Strategy, StrategyInput};
    use crate::types::SchedulerSpot;
    use common::types::UserId;
    use std::rc::Rc;

    fn registry() -> Rc<StaticRegistry> {
        let mut config = RegistryConfig::default();
        let mut first = StationConfig::new(1, &[1]).with_pathloss_db(90.0);
        first.sub_channel_offsets_db = vec![10.0, 10.0, 0.0, 0.0];
        let mut second = StationConfig::new(2, &[2]).with_pathloss_db(90.0);
        second.sub_channel_offsets_db = vec![0.0, 0.0, 10.0, 10.0];
        config.stations = vec![first, second];
        Rc::new(StaticRegistry::new(config).unwrap())
    }

    fn strategy(registry: Rc<StaticRegistry>) -> Strategy {
        let core = StrategyCore::new(registry, SchedulerSpot::UlMaster).with_cqi(true);
        Strategy::new(core, Box::new(CqiEnabledRoundRobinUL::new())).unwrap()
    }

    #[test]
    fn test_groups_get_their_best_channels() {
        let registry = registry();
        let mut queue = filled_queue(registry.clone(), &[1, 2], 30, 100);
        let result = strategy(registry).start_scheduling(StrategyInput::new(4, 1e-3, 1, 1, 0), &mut queue);
        let placed: Vec<(UserId, usize)> = result.bursts.iter().map(|b| (b.user, b.sub_band)).collect();
        assert_eq!(placed, vec![(UserId(2), 0), (UserId(2), 1), (UserId(1), 2), (UserId(1), 3)]);
    }

    #[test]
    fn test_first_group_rotates() {
        let registry = registry();
        let mut queue = filled_queue(registry.clone(), &[1, 2], 5, 100);
        let mut strategy = strategy(registry);
        // one block per frame: the first group alternates
        let first = strategy.start_scheduling(StrategyInput::new(1, 1e-3, 1, 1, 0), &mut queue);
        let second = strategy.start_scheduling(StrategyInput::new(1, 1e-3, 1, 1, 1), &mut queue);
        assert_eq!(first.bursts.len(), 1);
        assert_eq!(second.bursts.len(), 1);
        assert_ne!(first.bursts[0].user, second.bursts[0].user);
    }
}
