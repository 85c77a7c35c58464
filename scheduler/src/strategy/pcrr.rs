//! Power-controlled round robin for the uplink master
//!
//! The resource blocks of the frame are divided among the groups according to
//! the uplink shares the registry computes. Each group gets a contiguous run
//! of blocks, subchannel-major, and its members send with the power of their
//! allocation. Blocks are whole PRBs so that each one becomes a grant to
//! exactly one terminal.

use super::{SchedulingAlgorithm, StrategyCore};
use crate::dsa::DsaResult;
use crate::map::SchedulingMap;
use crate::queue::Queue;
use crate::types::{PowerMap, UserSet};
use tracing::{debug, trace, warn};

/// Power-controlled round robin
#[derive(Debug, Default)]
pub struct Pcrr;

impl Pcrr {
    /// Create the strategy
    pub fn new() -> Self {
        Self
    }
}

/// Split `total` blocks over groups with the given shares
///
/// Every group with a positive share gets at least one block, at most
/// `limits[i]`; the largest allocations shrink until the sum fits. Trailing
/// groups get nothing when there are fewer blocks than groups.
pub fn blocks_per_group(shares: &[f64], limits: &[usize], total: usize) -> Vec<usize> {
    assert_eq!(shares.len(), limits.len(), "one limit per share");
    let sum: f64 = shares.iter().sum();
    let mut blocks: Vec<usize> = shares
        .iter()
        .zip(limits)
        .map(|(&share, &limit)| {
            if sum <= 0.0 || share <= 0.0 {
                return 0;
            }
            ((share / sum * total as f64).round() as usize).max(1).min(limit)
        })
        .collect();
    while blocks.iter().sum::<usize>() > total {
        let Some((index, &largest)) = blocks.iter().enumerate().max_by(|a, b| a.1.cmp(b.1).then(b.0.cmp(&a.0)))
        else {
            break;
        };
        if largest > 1 {
            blocks[index] -= 1;
        } else {
            // all at one block: drop the last group still holding one
            if let Some(last) = blocks.iter().rposition(|&b| b > 0) {
                blocks[last] = 0;
            }
        }
    }
    blocks
}

impl SchedulingAlgorithm for Pcrr {
    fn name(&self) -> &'static str {
        "PCRR"
    }

    fn do_start_scheduling(&mut self, core: &mut StrategyCore, map: &mut SchedulingMap, queue: &mut dyn Queue) {
        let grouping = core.regroup(queue);
        if grouping.is_empty() {
            return;
        }
        let free_blocks: Vec<(usize, usize)> = (0..map.number_of_sub_channels())
            .filter(|&sc| map.sub_channels[sc].sub_channel_is_usable)
            .flat_map(|sc| (0..map.number_of_time_slots()).map(move |ts| (sc, ts)))
            .filter(|&(sc, ts)| map.prb(sc, ts, 0).is_empty())
            .collect();
        let allocations: PowerMap = core.registry().calc_ul_resources(&grouping.users(), map.number_of_sub_channels());

        let n_ts = map.number_of_time_slots();
        let mut shares = Vec::with_capacity(grouping.groups.len());
        let mut limits = Vec::with_capacity(grouping.groups.len());
        for group in &grouping.groups {
            let members = group.keys().filter_map(|u| allocations.get(u));
            let (share, limit) = members.fold((0.0_f64, 0_usize), |(s, l), a| {
                (s.max(a.resource_share), l.max(a.max_num_subbands * n_ts))
            });
            shares.push(share);
            limits.push(limit);
        }
        let blocks = blocks_per_group(&shares, &limits, free_blocks.len());
        debug!("PCRR: {} free blocks split as {:?}", free_blocks.len(), blocks);

        let mut next_block = 0;
        for (group, &count) in grouping.groups.iter().zip(&blocks) {
            let assigned = &free_blocks[next_block..next_block + count];
            next_block += count;
            let members: UserSet = group.keys().copied().collect();
            for (layer, &user) in members.iter().enumerate().take(map.number_of_spatial_layers()) {
                let Some(allocation) = allocations.get(&user) else {
                    warn!("PCRR: no uplink allocation for {}", user);
                    continue;
                };
                let Some(cand_i) = group.get(&user) else {
                    continue;
                };
                let phy_mode = core.get_best_phy_mode(cand_i.sinr());
                if !phy_mode.is_valid() {
                    debug!("PCRR: {} below the most robust mode", user);
                    continue;
                }
                let tx_power = core.state.default_tx_power.unwrap_or(allocation.tx_power_per_subband)
                    * grouping.share_of_power_per_stream(user);
                let pattern = core.pattern_for(user);
                for &(sub_channel, time_slot) in assigned {
                    let position = DsaResult { sub_channel, time_slot, spatial_layer: layer };
                    for cid in core.connections_with_data(queue, user) {
                        core.fill_block(map, queue, cid, user, position, phy_mode, tx_power, pattern.clone());
                    }
                }
                trace!("PCRR: {} on {} blocks at {} {}", user, assigned.len(), phy_mode, tx_power);
            }
        }
    }
}
