//! Round robin over connections, placed purely through DSA and APC
//!
//! Pending HARQ retransmissions go first, with their original PHY mode and
//! power. Then every connection with data gets one PDU per round, starting
//! after the connection served last, until a round places nothing. This is
//! the only strategy that also runs as uplink slave, filling the blocks the
//! master granted.

use super::{dequeue_for, SchedulingAlgorithm, StrategyCore};
use crate::harq::HarqTransmission;
use crate::map::SchedulingMap;
use crate::queue::Queue;
use crate::types::RequestForResource;
use crate::SLOT_LENGTH_ROUNDING_TOLERANCE;
use common::types::{ConnectionId, UserId};
use tracing::{debug, trace};

/// Round robin through the DSA → APC path
#[derive(Debug, Default)]
pub struct DsaDrivenRR {
    last_served: Option<ConnectionId>,
}

impl DsaDrivenRR {
    /// Create the strategy
    pub fn new() -> Self {
        Self::default()
    }

    /// Place pending retransmissions; returns the number placed
    fn place_retransmissions(core: &mut StrategyCore, map: &mut SchedulingMap) -> usize {
        let Some(harq) = core.harq.as_ref() else {
            return 0;
        };
        let pending: Vec<(UserId, usize)> = harq
            .users_with_retransmissions()
            .into_iter()
            .flat_map(|user| harq.processes_with_retransmissions(user).into_iter().map(move |p| (user, p)))
            .collect();

        let mut placed = 0;
        for (user, process_id) in pending {
            while let Some(transmission) =
                core.harq.as_ref().and_then(|h| h.peek_next_retransmission(user, process_id)).cloned()
            {
                if !Self::place_retransmission(core, map, &transmission) {
                    trace!("HARQ {}: no room for process {} this frame", user, process_id);
                    break;
                }
                if let Some(harq) = core.harq.as_mut() {
                    harq.next_retransmission(user, process_id);
                }
                placed += 1;
            }
        }
        placed
    }

    fn place_retransmission(core: &mut StrategyCore, map: &mut SchedulingMap, transmission: &HarqTransmission) -> bool {
        let mut request = RequestForResource::new(transmission.cid, transmission.user, transmission.bits());
        request.phy_mode = Some(transmission.phy_mode);
        request.is_harq = true;
        let position = match core.dsa.as_mut() {
            Some(dsa) => dsa.sub_channel_with_dsa(&request, &core.state, map),
            None => None,
        };
        let Some(position) = position else {
            return false;
        };
        let prb = map.prb(position.sub_channel, position.time_slot, position.spatial_layer);
        // used or granted blocks fix mode and power
        if let (Some(mode), Some(power)) = (prb.phy_mode(), prb.tx_power()) {
            if mode != transmission.phy_mode || power != transmission.tx_power {
                return false;
            }
        }
        let durations: Vec<f64> = transmission
            .compounds
            .iter()
            .map(|c| core.rounded_duration(c.length_in_bits(), &transmission.phy_mode))
            .collect();
        if prb.free_time() - durations.iter().sum::<f64>() < -SLOT_LENGTH_ROUNDING_TOLERANCE {
            return false;
        }
        let pattern = core.pattern_for(transmission.user);
        for (compound, duration) in transmission.compounds.iter().zip(durations) {
            map.add_compound(
                position.sub_channel,
                position.time_slot,
                position.spatial_layer,
                duration,
                transmission.cid,
                transmission.user,
                Some(compound.clone()),
                transmission.phy_mode,
                transmission.tx_power,
                pattern.clone(),
            );
        }
        debug!("HARQ {}: retransmission of process {} on {}", transmission.user, transmission.process_id, position);
        true
    }

    /// Place one PDU (or segment) of `cid`; false if no resource is left for it
    fn place_one(core: &mut StrategyCore, map: &mut SchedulingMap, queue: &mut dyn Queue, cid: ConnectionId) -> bool {
        let user = core.registry().user_for_cid(cid);
        let wanted = queue.head_of_line_pdu_bits(cid);
        let segmenting = queue.supports_dynamic_segmentation();
        let minimum = if segmenting { queue.minimum_segment_size().max(1) } else { wanted };

        let mut request = RequestForResource::new(cid, user, minimum);
        let Some(mut burst) = core.do_adaptive_resource_scheduling(&mut request, map) else {
            return false;
        };
        if segmenting {
            let free_time = map.prb(burst.sub_band, burst.time_slot, burst.spatial_layer).free_time();
            request.bits = wanted.min(core.bits_fitting(free_time, &burst.phy_mode)).max(minimum);
        }
        let pdu = dequeue_for(queue, &mut request);
        burst.end = burst.start + core.rounded_duration(request.bits, &burst.phy_mode);

        if let Some(harq) = core.harq.as_mut() {
            let transmission = HarqTransmission::new(user, cid, vec![pdu.clone()], burst.phy_mode, burst.tx_power);
            if harq.new_transmission(transmission).is_none() {
                trace!("HARQ {}: all processes busy, {} sent without HARQ", user, pdu);
            }
        }
        core.commit(map, &request, &burst, Some(pdu));
        true
    }
}

impl SchedulingAlgorithm for DsaDrivenRR {
    fn name(&self) -> &'static str {
        "DSADrivenRR"
    }

    fn uses_dsa(&self) -> bool {
        true
    }

    fn schedule_retransmissions(&mut self, core: &mut StrategyCore, map: &mut SchedulingMap) {
        let placed = Self::place_retransmissions(core, map);
        if placed > 0 {
            debug!("DSADrivenRR: {} retransmissions placed", placed);
        }
    }

    fn do_start_scheduling(&mut self, core: &mut StrategyCore, map: &mut SchedulingMap, queue: &mut dyn Queue) {
        let mut cids: Vec<ConnectionId> = core.active_connections().iter().copied().collect();
        if let Some(last) = self.last_served {
            let start = cids.iter().position(|cid| *cid > last).unwrap_or(0);
            cids.rotate_left(start);
        }
        loop {
            let mut placed = false;
            for &cid in &cids {
                if !queue.queue_has_pdus(cid) {
                    continue;
                }
                if Self::place_one(core, map, queue, cid) {
                    placed = true;
                    self.last_served = Some(cid);
                }
            }
            if !placed {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::apc::UseMaxTxPower;
    use crate::compound::CompoundFactory;
    use crate::dsa::{DsaPolicy, LinearFFirst};
    use crate::harq::{Harq, HarqConfig, HarqManager};
    use crate::interfaces::{PhyModeMapper, Registry};
    use crate::queue::{SegmentingQueue, SegmentingQueueConfig};
    use crate::registry::{RegistryConfig, StaticRegistry, StationConfig};
    use crate::strategy::{Strategy, StrategyInput};
    use crate::types::{SchedulerSpot, UserSet};
    use common::types::Power;
    use std::rc::Rc;

    fn core(registry: Rc<StaticRegistry>, spot: SchedulerSpot) -> StrategyCore {
        let policy = DsaPolicy::new(true, registry.phy_mode_mapper());
        StrategyCore::new(registry.clone(), spot)
            .with_dsa(Box::new(LinearFFirst::new(policy)))
            .with_apc(Box::new(UseMaxTxPower::new(registry)))
    }

    #[test]
    fn test_connections_alternate() {
        let registry = registry(&[(1, 90.0), (2, 90.0)]);
        let mut queue = filled_queue(registry.clone(), &[1, 2], 4, 100);
        let mut strategy = Strategy::new(core(registry, SchedulerSpot::DlMaster), Box::new(DsaDrivenRR::new())).unwrap();
        let result = strategy.start_scheduling(StrategyInput::new(2, 1e-3, 1, 1, 0), &mut queue);
        assert!(queue.is_empty());
        let placed: Vec<(UserId, usize, usize)> =
            result.bursts.iter().map(|b| (b.user, b.sub_band, b.compounds.len())).collect();
        assert_eq!(placed, vec![(UserId(1), 0, 4), (UserId(2), 1, 4)]);
    }

    #[test]
    fn test_retransmission_goes_first() {
        let registry = registry(&[(1, 90.0), (2, 90.0)]);
        let factory = CompoundFactory::new();
        let mut harq = HarqManager::new(HarqConfig::default()).unwrap();
        let mode = registry.phy_mode_mapper().highest_phy_mode();
        let original = HarqTransmission::new(UserId(1), ConnectionId(1), vec![factory.create(ConnectionId(1), 300)], mode, Power::from_dbm(30.0));
        let process = harq.new_transmission(original).unwrap();
        assert!(harq.nack(UserId(1), process));

        let mut queue = filled_queue(registry.clone(), &[2], 2, 100);
        let core = core(registry, SchedulerSpot::DlMaster).with_harq(Box::new(harq));
        let mut strategy = Strategy::new(core, Box::new(DsaDrivenRR::new())).unwrap();
        let result = strategy.start_scheduling(StrategyInput::new(1, 1e-3, 1, 1, 0), &mut queue);
        // one subchannel, one user per subchannel: the retransmission wins
        assert_eq!(result.users(), UserSet::from([UserId(1)]));
        assert_eq!(result.scheduled_bits(), 300);
        assert!(queue.queue_has_pdus(ConnectionId(2)));
        let harq = strategy.core_mut().harq_mut().unwrap();
        assert!(harq.users_with_retransmissions().is_empty());
    }

    #[test]
    fn test_new_transmissions_enter_harq() {
        let registry = registry(&[(1, 90.0)]);
        let mut queue = filled_queue(registry.clone(), &[1], 2, 100);
        let harq = HarqManager::new(HarqConfig { number_of_sender_processes: 1, number_of_retransmissions: 1 }).unwrap();
        let core = core(registry, SchedulerSpot::DlMaster).with_harq(Box::new(harq));
        let mut strategy = Strategy::new(core, Box::new(DsaDrivenRR::new())).unwrap();
        strategy.start_scheduling(StrategyInput::new(1, 1e-3, 1, 1, 0), &mut queue);
        let harq = strategy.core_mut().harq_mut().unwrap();
        assert!(!harq.has_capacity(UserId(1)));
    }

    #[test]
    fn test_segments_fill_the_block() {
        let registry = registry(&[(1, 90.0)]);
        let factory = Rc::new(CompoundFactory::new());
        let mut queue = SegmentingQueue::new(SegmentingQueueConfig::default(), registry.clone(), factory.clone());
        queue.put(factory.create(ConnectionId(1), 2000));
        let mut strategy = Strategy::new(core(registry, SchedulerSpot::DlMaster), Box::new(DsaDrivenRR::new())).unwrap();
        let result = strategy.start_scheduling(StrategyInput::new(1, 1e-3, 1, 1, 0), &mut queue);
        // the whole block at the highest mode: 1125 bits including the header
        assert_eq!(result.scheduled_bits(), 1125);
        assert_eq!(queue.num_bits_for_cid(ConnectionId(1)), 2000 - (1125 - 16) + 16);
    }

    #[test]
    fn test_uplink_slave_uses_grant() {
        let mut config = RegistryConfig::default();
        config.my_user_id = 5;
        config.stations = vec![StationConfig::new(1, &[1]).with_pathloss_db(90.0)];
        let registry = Rc::new(StaticRegistry::new(config).unwrap());
        let mode = registry.phy_mode_mapper().phy_mode_for_index(2);
        let mut master_map = SchedulingMap::new(1e-3, 2, 1, 1, 0);
        master_map.add_compound(1, 0, 0, 5e-4, ConnectionId(1), UserId(5), None, mode, Power::from_dbm(15.0), None);

        let mut queue = filled_queue(registry.clone(), &[1], 3, 100);
        let mut strategy = Strategy::new(core(registry, SchedulerSpot::UlSlave), Box::new(DsaDrivenRR::new())).unwrap();
        let input = StrategyInput::new(2, 1e-3, 1, 1, 0).with_input_map(master_map);
        let result = strategy.start_scheduling(input, &mut queue);
        assert_eq!(result.bursts.len(), 1);
        assert_eq!(result.bursts[0].sub_band, 1);
        assert_eq!(result.bursts[0].phy_mode, mode);
        assert!((result.bursts[0].tx_power.dbm() - 15.0).abs() < 1e-9);
        assert!(queue.is_empty());
    }
}
