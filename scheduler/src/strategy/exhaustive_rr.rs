//! Exhaustive round robin over groups
//!
//! Every round serves each group once: its members get the least used block
//! that is compatible with all of them, one spatial layer each, and fill it
//! with as many head-of-line PDUs as fit. Rounds repeat until nothing more
//! can be placed.

use super::{least_used_slot, SchedulingAlgorithm, StrategyCore};
use crate::dsa::DsaResult;
use crate::grouper::{Group, Grouping};
use crate::map::{PhysicalResourceBlock, SchedulingMap};
use crate::phy_mode::PhyMode;
use crate::queue::Queue;
use crate::types::{Bits, UserSet};
use common::types::{Power, UserId};
use std::collections::BTreeMap;
use tracing::{debug, trace};

/// Fraction of the slot a user must get in a round to count as served
pub const SERVED_THRESHOLD: f64 = 0.02;

/// Outcome of serving one group once
#[derive(Debug, Default)]
pub(crate) struct GroupPlacement {
    /// Bits placed per member
    pub bits: BTreeMap<UserId, Bits>,
    /// Members that count as served for fairness bookkeeping
    pub served: UserSet,
}

impl GroupPlacement {
    pub fn total_bits(&self) -> Bits {
        self.bits.values().sum()
    }
}

fn compatible(prb: &PhysicalResourceBlock, user: UserId, phy_mode: &PhyMode, tx_power: Power) -> bool {
    if prb.free_time() <= 0.0 {
        return false;
    }
    prb.is_empty()
        || (prb.first_user() == Some(user) && prb.phy_mode() == Some(*phy_mode) && prb.tx_power() == Some(tx_power))
}

/// Place head-of-line PDUs of every member of `group` into one block
///
/// Members with data get spatial layers in group order. A member without a
/// usable PHY mode is marked served without transmitting.
pub(crate) fn place_group(
    core: &mut StrategyCore,
    map: &mut SchedulingMap,
    queue: &mut dyn Queue,
    grouping: &Grouping,
    group: &Group,
) -> GroupPlacement {
    let mut placement = GroupPlacement::default();
    let mut members: Vec<(UserId, PhyMode, Power)> = Vec::new();
    for (&user, cand_i) in group {
        if core.connections_with_data(queue, user).is_empty() {
            continue;
        }
        if members.len() == map.number_of_spatial_layers() {
            trace!("no spatial layer left for {}", user);
            break;
        }
        let phy_mode = core.get_best_phy_mode(cand_i.sinr());
        if !phy_mode.is_valid() {
            debug!("{}: SINR {} too low, counted as served", user, cand_i.sinr());
            placement.served.insert(user);
            continue;
        }
        let tx_power = core.nominal_tx_power(user) * grouping.share_of_power_per_stream(user);
        if tx_power.is_zero() {
            placement.served.insert(user);
            continue;
        }
        members.push((user, phy_mode, tx_power));
    }
    if members.is_empty() {
        return placement;
    }

    let slot = least_used_slot(map, |sc, ts| {
        members
            .iter()
            .enumerate()
            .all(|(layer, (user, mode, power))| compatible(map.prb(sc, ts, layer), *user, mode, *power))
    });
    let Some((sub_channel, time_slot)) = slot else {
        trace!("no compatible block left for {:?}", members.iter().map(|m| m.0).collect::<Vec<_>>());
        return placement;
    };

    let slot_length = map.slot_length();
    for (layer, (user, phy_mode, tx_power)) in members.into_iter().enumerate() {
        let position = DsaResult { sub_channel, time_slot, spatial_layer: layer };
        let pattern = core.pattern_for(user);
        let mut placed = 0;
        for cid in core.connections_with_data(queue, user) {
            placed += core.fill_block(map, queue, cid, user, position, phy_mode, tx_power, pattern.clone());
        }
        let share = if slot_length > 0.0 { phy_mode.duration_for(placed) / slot_length } else { 0.0 };
        if share > SERVED_THRESHOLD || core.connections_with_data(queue, user).is_empty() {
            placement.served.insert(user);
        }
        if placed > 0 {
            trace!("{}: {} bits on {} at {}", user, placed, position, phy_mode);
            placement.bits.insert(user, placed);
        }
    }
    placement
}

/// Round robin over groups until the map or the queues are exhausted
#[derive(Debug, Default)]
pub struct ExhaustiveRR;

impl ExhaustiveRR {
    /// Create the strategy
    pub fn new() -> Self {
        Self
    }
}

impl SchedulingAlgorithm for ExhaustiveRR {
    fn name(&self) -> &'static str {
        "ExhaustiveRR"
    }

    fn do_start_scheduling(&mut self, core: &mut StrategyCore, map: &mut SchedulingMap, queue: &mut dyn Queue) {
        let mut served_last_round = UserSet::new();
        let mut round = 0;
        loop {
            let grouping = core.grouping_for_round(queue, round == 0);
            round += 1;
            let candidates: Vec<&Group> = grouping
                .groups
                .iter()
                .filter(|group| group.keys().any(|u| !core.connections_with_data(queue, *u).is_empty()))
                .collect();
            if candidates.is_empty() {
                break;
            }
            let fully_served = |group: &Group, served: &UserSet| group.keys().all(|u| served.contains(u));
            if candidates.iter().all(|g| fully_served(g, &served_last_round)) {
                served_last_round.clear();
            }

            let mut served = UserSet::new();
            let mut placed_bits = 0;
            let mut deferred = 0;
            for group in candidates {
                if fully_served(group, &served_last_round) {
                    deferred += 1;
                    continue;
                }
                let placement = place_group(core, map, queue, &grouping, group);
                placed_bits += placement.total_bits();
                served.extend(placement.served);
            }
            trace!("round {}: {} bits, {} groups deferred", round, placed_bits, deferred);
            if placed_bits == 0 {
                if deferred == 0 {
                    break;
                }
                served_last_round.clear();
            } else {
                served_last_round = served;
            }
        }
        debug!("ExhaustiveRR: {} rounds in priority {}", round, core.state.current.current_priority);
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::strategy::{Strategy, StrategyInput};
    use crate::types::SchedulerSpot;
    use common::types::ConnectionId;

    fn exhaustive_rr(registry: std::rc::Rc<crate::registry::StaticRegistry>) -> Strategy {
        Strategy::new(StrategyCore::new(registry, SchedulerSpot::DlMaster), Box::new(ExhaustiveRR::new())).unwrap()
    }

    #[test]
    fn test_each_user_gets_own_sub_channel() {
        let registry = registry(&[(1, 90.0), (2, 90.0)]);
        let mut queue = filled_queue(registry.clone(), &[1, 2], 3, 100);
        let result = exhaustive_rr(registry).start_scheduling(StrategyInput::new(2, 1e-3, 1, 1, 0), &mut queue);
        assert!(queue.is_empty());
        assert_eq!(result.bursts.len(), 2);
        assert_eq!((result.bursts[0].user, result.bursts[0].sub_band), (UserId(1), 0));
        assert_eq!((result.bursts[1].user, result.bursts[1].sub_band), (UserId(2), 1));
        // 27 dBm nominal, 90 dB pathloss, -100 dBm: 37 dB picks the highest mode
        assert_eq!(result.bursts[0].phy_mode.index, 6);
        assert_eq!(result.bursts[0].compounds.len(), 3);
    }

    #[test]
    fn test_blocks_are_filled_exhaustively() {
        let registry = registry(&[(1, 90.0), (2, 90.0)]);
        let mut queue = filled_queue(registry.clone(), &[1, 2], 20, 100);
        let result = exhaustive_rr(registry).start_scheduling(StrategyInput::new(2, 1e-3, 1, 1, 0), &mut queue);
        // 1125 bits per block at the highest mode
        assert_eq!(result.scheduled_bits(), 2200);
        assert_eq!(queue.num_compounds_for_cid(ConnectionId(1)), 9);
        assert_eq!(queue.num_compounds_for_cid(ConnectionId(2)), 9);
    }

    #[test]
    fn test_more_users_than_blocks() {
        let registry = registry(&[(1, 90.0), (2, 90.0), (3, 90.0)]);
        let mut queue = filled_queue(registry.clone(), &[1, 2, 3], 1, 100);
        let result = exhaustive_rr(registry).start_scheduling(StrategyInput::new(2, 1e-3, 1, 1, 0), &mut queue);
        assert_eq!(result.users(), UserSet::from([UserId(1), UserId(2)]));
        assert!(queue.queue_has_pdus(ConnectionId(3)));
        result.scheduling_map.assert_consistent();
    }

    #[test]
    fn test_unservable_user_is_skipped() {
        // 27 - 140 + 100 = -13 dB, below the most robust mode
        let registry = registry(&[(1, 90.0), (2, 140.0)]);
        let mut queue = filled_queue(registry.clone(), &[1, 2], 1, 100);
        let mut strategy = Strategy::new(
            StrategyCore::new(registry, SchedulerSpot::DlMaster).with_exclude_too_low_sinr(false),
            Box::new(ExhaustiveRR::new()),
        )
        .unwrap();
        let result = strategy.start_scheduling(StrategyInput::new(2, 1e-3, 1, 1, 0), &mut queue);
        assert_eq!(result.users(), UserSet::from([UserId(1)]));
        assert!(queue.queue_has_pdus(ConnectionId(2)));
    }
}
