//! Channel-aware exhaustive round robin for the downlink
//!
//! Like [`super::ExhaustiveRR`], but every user picks the free subchannel with
//! its best channel and transmits with just the power its PHY mode needs.
//! The power available on a subchannel is what remains of the overall budget
//! after the transmissions on other subchannels overlapping in time.

use super::{request_size, SchedulingAlgorithm, StrategyCore};
use crate::dsa::DsaResult;
use crate::map::{PhysicalResourceBlock, SchedulingMap};
use crate::queue::Queue;
use crate::types::UserSet;
use common::types::{Power, UserId};
use common::utils::SimTime;
use tracing::{debug, trace};

/// Power left for a transmission on `sub_channel` during `[start, end)`
///
/// Every other subchannel counts with the highest power among its layer-0
/// compounds overlapping the interval.
pub fn remaining_tx_power(
    map: &SchedulingMap,
    sub_channel: usize,
    time_slot: usize,
    start: SimTime,
    end: SimTime,
    max_overall: Power,
) -> Power {
    let mut remaining = max_overall;
    for other in (0..map.number_of_sub_channels()).filter(|&sc| sc != sub_channel) {
        let used = map
            .prb(other, time_slot, 0)
            .compounds()
            .iter()
            .filter(|c| c.start_time < end && c.end_time > start)
            .map(|c| c.tx_power)
            .fold(Power::zero(), Power::max);
        remaining -= used;
    }
    remaining
}

/// Exhaustive round robin with best-channel selection and minimum power
#[derive(Debug, Default)]
pub struct CqiEnabledExhaustiveRR;

impl CqiEnabledExhaustiveRR {
    /// Create the strategy
    pub fn new() -> Self {
        Self
    }

    /// Best subchannel of `user` with room for its next PDU, and the time slot to use
    fn best_block(core: &StrategyCore, map: &SchedulingMap, queue: &dyn Queue, user: UserId) -> Option<(usize, usize)> {
        let cids = core.connections_with_data(queue, user);
        let has_room = |prb: &PhysicalResourceBlock| match (prb.is_empty(), prb.phy_mode()) {
            (true, _) => true,
            (false, Some(mode)) if prb.first_user() == Some(user) => {
                let free_bits = core.bits_fitting(prb.free_time(), &mode);
                cids.iter().any(|cid| request_size(queue, *cid, free_bits).is_some())
            }
            _ => false,
        };
        let mut best: Option<((usize, usize), f64)> = None;
        for sc in 0..map.number_of_sub_channels() {
            if !map.sub_channels[sc].sub_channel_is_usable {
                continue;
            }
            let Some(ts) = (0..map.number_of_time_slots()).find(|&ts| has_room(map.prb(sc, ts, 0))) else {
                continue;
            };
            let quality = core.channel_state(user, sc).gain_over_interference();
            if best.map_or(true, |(_, q)| quality > q) {
                best = Some(((sc, ts), quality));
            }
        }
        best.map(|(block, _)| block)
    }

    /// Serve `user` once; returns the bits placed or `None` if it cannot be served
    fn serve(core: &StrategyCore, map: &mut SchedulingMap, queue: &mut dyn Queue, user: UserId) -> Option<u32> {
        let (sub_channel, time_slot) = Self::best_block(core, map, queue, user)?;
        let prb = map.prb(sub_channel, time_slot, 0);
        let (phy_mode, tx_power) = match (prb.is_empty(), prb.phy_mode(), prb.tx_power()) {
            (false, Some(mode), Some(power)) => (mode, power),
            _ => {
                let channel = core.channel_state(user, sub_channel);
                let start = prb.next_position();
                let remaining = remaining_tx_power(
                    map,
                    sub_channel,
                    time_slot,
                    start,
                    map.slot_length(),
                    core.state.power_capabilities.max_overall,
                );
                if remaining.is_zero() {
                    trace!("no power left on #{} for {}", sub_channel, user);
                    return None;
                }
                let max_tx_power = core.state.power_capabilities.max_per_subband.min(remaining);
                let phy_mode = core.get_best_phy_mode(channel.sinr_for(max_tx_power));
                if !phy_mode.is_valid() {
                    return None;
                }
                let min_sinr = core.mapper().min_sinr_ratio(&phy_mode);
                let needed = channel.interference * channel.pathloss * min_sinr;
                (phy_mode, needed.min(max_tx_power))
            }
        };
        if tx_power.is_zero() {
            return None;
        }
        let position = DsaResult { sub_channel, time_slot, spatial_layer: 0 };
        let mut placed = 0;
        for cid in core.connections_with_data(queue, user) {
            placed += core.fill_block(map, queue, cid, user, position, phy_mode, tx_power, core.pattern_for(user));
        }
        trace!("{}: {} bits on {} at {} {}", user, placed, position, phy_mode, tx_power);
        Some(placed)
    }
}

impl SchedulingAlgorithm for CqiEnabledExhaustiveRR {
    fn name(&self) -> &'static str {
        "CQIEnabledExhaustiveRR"
    }

    fn requires_cqi(&self) -> bool {
        true
    }

    fn do_start_scheduling(&mut self, core: &mut StrategyCore, map: &mut SchedulingMap, queue: &mut dyn Queue) {
        let mut served_last_round = UserSet::new();
        let mut round = 0;
        loop {
            let grouping = core.grouping_for_round(queue, round == 0);
            round += 1;
            let users: Vec<UserId> = grouping
                .users()
                .into_iter()
                .filter(|u| !core.connections_with_data(queue, *u).is_empty())
                .collect();
            if users.is_empty() {
                break;
            }
            if users.iter().all(|u| served_last_round.contains(u)) {
                served_last_round.clear();
            }
            let mut served = UserSet::new();
            let mut placed_bits = 0;
            let mut deferred = 0;
            for user in users {
                if served_last_round.contains(&user) {
                    deferred += 1;
                    continue;
                }
                match Self::serve(core, map, queue, user) {
                    Some(bits) => {
                        placed_bits += bits;
                        if bits > 0 || core.connections_with_data(queue, user).is_empty() {
                            served.insert(user);
                        }
                    }
                    // unservable users count as served
                    None => {
                        served.insert(user);
                    }
                }
            }
            if placed_bits == 0 {
                if deferred == 0 {
                    break;
                }
                served_last_round.clear();
            } else {
                served_last_round = served;
            }
        }
        debug!("CQIEnabledExhaustiveRR: {} rounds", round);
    }
}
