//! Scheduling strategies
//!
//! A [`Strategy`] runs one scheduling pass per frame. The shared part lives in
//! [`StrategyCore`]: input validation, the per-frame [`RevolvingState`],
//! grouping, channel state collection, the DSA → APC → commit path and the
//! final power post-processing. The per-frame algorithm itself is a
//! [`SchedulingAlgorithm`], called once per priority class that has data.

pub mod cqi_exhaustive_rr;
pub mod cqi_round_robin_ul;
pub mod dsa_driven_rr;
pub mod exhaustive_rr;
pub mod pcrr;
pub mod persistent_voip;
pub mod proportional_fair;
pub mod state;

pub use cqi_exhaustive_rr::CqiEnabledExhaustiveRR;
pub use cqi_round_robin_ul::CqiEnabledRoundRobinUL;
pub use dsa_driven_rr::DsaDrivenRR;
pub use exhaustive_rr::ExhaustiveRR;
pub use pcrr::Pcrr;
pub use persistent_voip::PersistentVoip;
pub use proportional_fair::ProportionalFairDL;
pub use state::{RevolvingState, SchedulerState, StrategyInput};

use crate::apc::ApcStrategy;
use crate::compound::CompoundPtr;
use crate::dsa::{DsaResult, DsaStrategy};
use crate::grouper::{Grouper, Grouping, GroupingMode, TrivialGrouper};
use crate::harq::Harq;
use crate::interfaces::{PhyModeMapper, Registry};
use crate::map::SchedulingMap;
use crate::phy_mode::PhyMode;
use crate::probe::{put_if_observed, ProbeSink};
use crate::queue::Queue;
use crate::types::{
    Bits, ConnectionSet, MapInfoCollection, MapInfoEntry, Pattern, PowerControlType, RequestForResource,
    SchedulerSpot, UserSet,
};
use crate::{SchedulerError, SLOT_LENGTH_ROUNDING_TOLERANCE};
use common::types::{CandI, ChannelQualityOnOneSubChannel, ConnectionId, Power, Ratio, UserId};
use common::utils::{round_up_to_granularity, SimTime};
use std::rc::Rc;
use tracing::{debug, info, trace, warn};

/// Outcome of one scheduling pass, handed off to the caller
#[derive(Debug, Clone)]
pub struct StrategyResult {
    /// Frame scheduled
    pub frame_nr: u32,
    /// The filled map
    pub scheduling_map: SchedulingMap,
    /// Bursts derived from the map
    pub bursts: MapInfoCollection,
    /// Share of the map in use
    pub resource_usage: f64,
}

impl StrategyResult {
    /// Bits of all placed PDUs
    pub fn scheduled_bits(&self) -> Bits {
        self.bursts.iter().map(|b| b.bits()).sum()
    }

    /// Number of placed compounds
    pub fn scheduled_compounds(&self) -> usize {
        self.scheduling_map.number_of_compounds()
    }

    /// Users with at least one burst
    pub fn users(&self) -> UserSet {
        self.bursts.iter().map(|b| b.user).collect()
    }
}

/// Per-frame algorithm plugged into a [`Strategy`]
pub trait SchedulingAlgorithm {
    /// Name for logging
    fn name(&self) -> &'static str;

    /// True if the algorithm places through DSA and APC
    fn uses_dsa(&self) -> bool {
        false
    }

    /// True if per-subchannel channel state must be collected
    fn requires_cqi(&self) -> bool {
        false
    }

    /// Place pending HARQ retransmissions before any new data
    fn schedule_retransmissions(&mut self, _core: &mut StrategyCore, _map: &mut SchedulingMap) {}

    /// Place data of the current priority class into `map`
    fn do_start_scheduling(&mut self, core: &mut StrategyCore, map: &mut SchedulingMap, queue: &mut dyn Queue);
}

/// Shared state and helpers of every strategy
pub struct StrategyCore {
    registry: Rc<dyn Registry>,
    /// Scheduler and per-frame state
    pub state: SchedulerState,
    grouper: Box<dyn Grouper>,
    dsa: Option<Box<dyn DsaStrategy>>,
    apc: Option<Box<dyn ApcStrategy>>,
    harq: Option<Box<dyn Harq>>,
    resource_usage_probe: Option<Rc<dyn ProbeSink>>,
    allow_regrouping: bool,
}

impl StrategyCore {
    /// Core for a scheduler at `spot`; groups users one by one until a grouper is set
    pub fn new(registry: Rc<dyn Registry>, spot: SchedulerSpot) -> Self {
        let state = SchedulerState {
            is_tx: spot != SchedulerSpot::UlMaster,
            is_dl: spot == SchedulerSpot::DlMaster,
            use_cqi: false,
            power_control_type: spot.power_control_type(),
            scheduler_spot: spot,
            exclude_too_low_sinr: true,
            default_phy_mode: None,
            default_tx_power: None,
            power_capabilities: registry.power_capabilities(None),
            symbol_duration: 0.0,
            my_user_id: registry.my_user_id(),
            current: RevolvingState::new(StrategyInput::new(0, 0.0, 1, 1, 0)),
        };
        let grouper = Box::new(TrivialGrouper::new(registry.clone(), None));
        Self {
            registry,
            state,
            grouper,
            dsa: None,
            apc: None,
            harq: None,
            resource_usage_probe: None,
            allow_regrouping: true,
        }
    }

    /// Use `grouper` for spatial grouping
    pub fn with_grouper(mut self, grouper: Box<dyn Grouper>) -> Self {
        self.grouper = grouper;
        self
    }

    /// Use `dsa` for subchannel assignment
    pub fn with_dsa(mut self, dsa: Box<dyn DsaStrategy>) -> Self {
        self.dsa = Some(dsa);
        self
    }

    /// Use `apc` for power control
    pub fn with_apc(mut self, apc: Box<dyn ApcStrategy>) -> Self {
        self.apc = Some(apc);
        self
    }

    /// Serve HARQ retransmissions from `harq`
    pub fn with_harq(mut self, harq: Box<dyn Harq>) -> Self {
        self.harq = Some(harq);
        self
    }

    /// Report the resource usage of every frame
    pub fn with_resource_usage_probe(mut self, probe: Rc<dyn ProbeSink>) -> Self {
        self.resource_usage_probe = Some(probe);
        self
    }

    /// Use per-subchannel channel state if the registry has it
    pub fn with_cqi(mut self, use_cqi: bool) -> Self {
        self.state.use_cqi = use_cqi;
        self
    }

    /// Round burst durations up to multiples of `symbol_duration`
    pub fn with_symbol_duration(mut self, symbol_duration: SimTime) -> Self {
        self.state.symbol_duration = symbol_duration;
        self
    }

    /// Force every placement onto `phy_mode`
    pub fn with_default_phy_mode(mut self, phy_mode: Option<PhyMode>) -> Self {
        self.state.default_phy_mode = phy_mode;
        self
    }

    /// Force every placement onto `tx_power`
    pub fn with_default_tx_power(mut self, tx_power: Option<Power>) -> Self {
        self.state.default_tx_power = tx_power;
        self
    }

    /// Skip users that cannot reach the most robust PHY mode
    pub fn with_exclude_too_low_sinr(mut self, exclude: bool) -> Self {
        self.state.exclude_too_low_sinr = exclude;
        self
    }

    /// Recompute the grouping every round instead of once per frame
    pub fn with_regrouping(mut self, allow_regrouping: bool) -> Self {
        self.allow_regrouping = allow_regrouping;
        self
    }

    /// Station registry
    pub fn registry(&self) -> &dyn Registry {
        self.registry.as_ref()
    }

    /// PHY mode table
    pub fn mapper(&self) -> &dyn PhyModeMapper {
        self.registry.phy_mode_mapper()
    }

    /// HARQ collaborator, if configured
    pub fn harq_mut(&mut self) -> Option<&mut (dyn Harq + 'static)> {
        self.harq.as_deref_mut()
    }

    /// DSA strategy, if configured
    pub fn dsa(&self) -> Option<&dyn DsaStrategy> {
        self.dsa.as_deref()
    }

    /// Own PHY mode choice: the configured default or the best mode for `sinr`
    pub fn get_best_phy_mode(&self, sinr: Ratio) -> PhyMode {
        match self.state.default_phy_mode {
            Some(mode) => mode,
            None => self.mapper().best_phy_mode(sinr),
        }
    }

    /// Nominal power per subchannel on the link to `user`
    pub fn nominal_tx_power(&self, user: UserId) -> Power {
        if let Some(power) = self.state.default_tx_power {
            return power;
        }
        match self.state.power_control_type {
            PowerControlType::DlMaster | PowerControlType::UlSlave => self.state.power_capabilities.nominal_per_subband,
            PowerControlType::UlMaster => self.registry.power_capabilities(Some(user)).nominal_per_subband,
        }
    }

    /// Estimated C/I of `user` on its own
    pub fn estimate_cand_i(&self, user: UserId) -> CandI {
        let frame_nr = self.state.frame_nr();
        if self.state.is_tx {
            self.registry.estimate_tx_sinr_at(user, frame_nr)
        } else {
            self.registry.estimate_rx_sinr_of(user, frame_nr)
        }
    }

    /// Channel state of `user` on `sub_channel`, from CQI or from the registry estimate
    pub fn channel_state(&self, user: UserId, sub_channel: usize) -> ChannelQualityOnOneSubChannel {
        match self.state.current.cqi_for(user, sub_channel) {
            Some(cqi) => cqi,
            None => {
                let estimate = self.estimate_cand_i(user);
                ChannelQualityOnOneSubChannel::new(estimate.pathloss, estimate.i, sub_channel)
            }
        }
    }

    /// Antenna pattern of `user` in the current grouping
    pub fn pattern_for(&self, user: UserId) -> Option<Pattern> {
        self.state.current.grouping.as_ref().and_then(|g| g.pattern(user)).cloned()
    }

    /// Air time of `bits` at `phy_mode`, rounded up to whole symbols
    pub fn rounded_duration(&self, bits: Bits, phy_mode: &PhyMode) -> SimTime {
        round_up_to_granularity(
            phy_mode.duration_for(bits),
            self.state.symbol_duration,
            SLOT_LENGTH_ROUNDING_TOLERANCE,
        )
    }

    /// Bits that fit into `free_time` at `phy_mode` after symbol rounding
    pub fn bits_fitting(&self, free_time: SimTime, phy_mode: &PhyMode) -> Bits {
        let symbol = self.state.symbol_duration;
        let usable = if symbol > 0.0 {
            ((free_time + SLOT_LENGTH_ROUNDING_TOLERANCE) / symbol).floor() * symbol
        } else {
            free_time
        };
        ((usable + SLOT_LENGTH_ROUNDING_TOLERANCE) * phy_mode.data_rate).max(0.0).floor() as Bits
    }

    /// Connections of the current priority class
    pub fn active_connections(&self) -> &ConnectionSet {
        &self.state.current.active_connections
    }

    /// Connections of `user` in the current class with PDUs queued
    pub fn connections_with_data(&self, queue: &dyn Queue, user: UserId) -> Vec<ConnectionId> {
        self.registry
            .connections_for_user(user)
            .into_iter()
            .filter(|cid| self.state.current.active_connections.contains(cid) && queue.queue_has_pdus(*cid))
            .collect()
    }

    /// Users of the current class with PDUs queued
    pub fn users_with_data(&self, queue: &dyn Queue) -> UserSet {
        self.state
            .current
            .active_connections
            .iter()
            .filter(|cid| queue.queue_has_pdus(**cid))
            .map(|cid| self.registry.user_for_cid(*cid))
            .collect()
    }

    /// Group the users with data and remember the grouping for this frame
    pub fn regroup(&mut self, queue: &dyn Queue) -> Grouping {
        let users = self.registry.filter_reachable(&self.users_with_data(queue), self.state.frame_nr());
        let input = &self.state.current.strategy_input;
        let max_beams = if input.beamforming { input.max_spatial_layers } else { 1 };
        let mode = if self.state.is_tx { GroupingMode::Tx } else { GroupingMode::Rx };
        let mut grouping = self.grouper.grouping(mode, &users, max_beams, self.state.frame_nr());
        if self.state.exclude_too_low_sinr {
            let mapper = self.registry.phy_mode_mapper();
            let too_low: Vec<UserId> = grouping
                .groups
                .iter()
                .flat_map(|g| g.iter())
                .filter(|(_, cand_i)| !mapper.sinr_is_above_limit(cand_i.sinr()))
                .map(|(user, _)| *user)
                .collect();
            if !too_low.is_empty() {
                debug!("excluding {:?}: SINR below the most robust PhyMode", too_low);
                grouping = without_users(grouping, &too_low);
            }
        }
        trace!("regroup(frame={}): {}", self.state.frame_nr(), grouping);
        self.state.current.grouping = Some(grouping.clone());
        grouping
    }

    /// Grouping for one round: recomputed if allowed, else the frame's grouping
    pub fn grouping_for_round(&mut self, queue: &dyn Queue, first_round: bool) -> Grouping {
        match (&self.state.current.grouping, first_round || self.allow_regrouping) {
            (Some(grouping), false) => grouping.clone(),
            _ => self.regroup(queue),
        }
    }

    /// DSA, then APC: decide where and how `request` is transmitted
    ///
    /// Fills subchannel, time slot, layer, channel state and PHY mode into
    /// `request` and returns the burst it would become, or `None` if no
    /// usable resource or no PHY mode is left. Nothing is placed yet; see
    /// [`StrategyCore::commit`].
    pub fn do_adaptive_resource_scheduling(
        &mut self,
        request: &mut RequestForResource,
        map: &SchedulingMap,
    ) -> Option<MapInfoEntry> {
        let Some(dsa) = self.dsa.as_mut() else {
            panic!("do_adaptive_resource_scheduling() needs a DSA strategy");
        };
        let DsaResult { sub_channel, time_slot, spatial_layer } =
            dsa.sub_channel_with_dsa(request, &self.state, map)?;
        request.sub_channel = Some(sub_channel);
        request.time_slot = time_slot;
        request.spatial_layer = spatial_layer;
        let channel = self.channel_state(request.user, sub_channel);
        request.cqi_on_sub_channel = Some(channel);

        let prb = map.prb(sub_channel, time_slot, spatial_layer);
        let (phy_mode, tx_power, estimated_cand_i) = match (prb.phy_mode(), prb.tx_power()) {
            // a block already in use, or granted by the master, fixes mode and power
            (Some(mode), Some(power)) => (
                mode,
                power,
                CandI { c: power / channel.pathloss, i: channel.interference, pathloss: channel.pathloss },
            ),
            _ => {
                let Some(apc) = self.apc.as_mut() else {
                    panic!("do_adaptive_resource_scheduling() needs an APC strategy");
                };
                let result = apc.do_adaptive_power_control(request, &self.state, map);
                if !result.is_servable() {
                    trace!("no PhyMode/power for {}", request);
                    return None;
                }
                (result.phy_mode, result.tx_power, result.estimated_cand_i)
            }
        };
        request.phy_mode = Some(phy_mode);

        let duration = self.rounded_duration(request.bits, &phy_mode);
        if prb.free_time() - duration < -SLOT_LENGTH_ROUNDING_TOLERANCE {
            trace!("{} does not fit at {}", request, phy_mode);
            return None;
        }

        let start = prb.next_position();
        let mut burst = MapInfoEntry::new(request.user, start);
        burst.end = start + duration;
        burst.frame_nr = map.frame_nr();
        burst.sub_band = sub_channel;
        burst.time_slot = time_slot;
        burst.spatial_layer = spatial_layer;
        burst.tx_power = tx_power;
        burst.phy_mode = phy_mode;
        burst.pattern = self.pattern_for(request.user);
        burst.estimated_cand_i = estimated_cand_i;
        Some(burst)
    }

    /// Place `request` as decided in `burst`
    pub fn commit(
        &self,
        map: &mut SchedulingMap,
        request: &RequestForResource,
        burst: &MapInfoEntry,
        compound: Option<CompoundPtr>,
    ) {
        let duration = self.rounded_duration(request.bits, &burst.phy_mode);
        map.add_compound(
            burst.sub_band,
            burst.time_slot,
            burst.spatial_layer,
            duration,
            request.cid,
            request.user,
            compound,
            burst.phy_mode,
            burst.tx_power,
            burst.pattern.clone(),
        );
    }

    /// Place head-of-line PDUs of `cid` into one block while they fit
    ///
    /// Returns the bits placed.
    #[allow(clippy::too_many_arguments)]
    pub fn fill_block(
        &self,
        map: &mut SchedulingMap,
        queue: &mut dyn Queue,
        cid: ConnectionId,
        user: UserId,
        position: DsaResult,
        phy_mode: PhyMode,
        tx_power: Power,
        pattern: Option<Pattern>,
    ) -> Bits {
        let mut placed = 0;
        while queue.queue_has_pdus(cid) {
            let free_time = map.prb(position.sub_channel, position.time_slot, position.spatial_layer).free_time();
            let free_bits = self.bits_fitting(free_time, &phy_mode);
            let Some(bits) = request_size(queue, cid, free_bits) else {
                break;
            };
            let mut request = RequestForResource::new(cid, user, bits);
            let pdu = dequeue_for(queue, &mut request);
            let duration = self.rounded_duration(request.bits, &phy_mode);
            map.add_compound(
                position.sub_channel,
                position.time_slot,
                position.spatial_layer,
                duration,
                cid,
                user,
                Some(pdu),
                phy_mode,
                tx_power,
                pattern.clone(),
            );
            placed += request.bits;
        }
        placed
    }

    fn collect_channel_qualities(&mut self, users: &UserSet) {
        let frame_nr = self.state.frame_nr();
        for &user in users {
            let qualities = if self.state.is_dl {
                self.registry.channel_qualities_on_downlink(user, frame_nr)
            } else {
                self.registry.channel_qualities_on_uplink(user, frame_nr)
            };
            match qualities {
                Some(qualities) => {
                    self.state.current.channel_qualities_of_all_users.insert(user, qualities);
                }
                None => warn!("no channel state for {} in frame {}", user, frame_nr),
            }
        }
    }
}

/// Grouping without `removed`; empty groups disappear
fn without_users(grouping: Grouping, removed: &[UserId]) -> Grouping {
    let mut result = Grouping::default();
    for mut group in grouping.groups {
        group.retain(|user, _| !removed.contains(user));
        if !group.is_empty() {
            result.push_group(group);
        }
    }
    result.patterns = grouping.patterns.into_iter().filter(|(user, _)| !removed.contains(user)).collect();
    result
}

/// Bits to request from `cid` when at most `free_bits` fit
///
/// The whole head-of-line PDU if it fits; with dynamic segmentation a
/// segment of at most `free_bits` that reaches the minimum segment size.
pub fn request_size(queue: &dyn Queue, cid: ConnectionId, free_bits: Bits) -> Option<Bits> {
    let wanted = queue.head_of_line_pdu_bits(cid);
    if !queue.supports_dynamic_segmentation() {
        return (wanted <= free_bits).then_some(wanted);
    }
    let bits = wanted.min(free_bits).max(queue.minimum_segment_size().max(1));
    (bits <= free_bits).then_some(bits)
}

/// Take the data for `request` out of the queue
///
/// The request's size is updated to the PDU actually taken.
pub fn dequeue_for(queue: &mut dyn Queue, request: &mut RequestForResource) -> CompoundPtr {
    let pdu = if queue.supports_dynamic_segmentation() {
        queue.head_of_line_pdu_segment(request.cid, request.bits)
    } else {
        queue.head_of_line_pdu(request.cid)
    };
    request.bits = pdu.length_in_bits();
    pdu
}

/// Block with the least used time among those `accept` allows
pub fn least_used_slot(map: &SchedulingMap, accept: impl Fn(usize, usize) -> bool) -> Option<(usize, usize)> {
    let mut best: Option<((usize, usize), SimTime)> = None;
    for sub_channel in 0..map.number_of_sub_channels() {
        if !map.sub_channels[sub_channel].sub_channel_is_usable {
            continue;
        }
        for time_slot in 0..map.number_of_time_slots() {
            if !accept(sub_channel, time_slot) {
                continue;
            }
            let used = map.next_position(sub_channel, time_slot, 0);
            if best.map_or(true, |(_, b)| used < b) {
                best = Some(((sub_channel, time_slot), used));
            }
        }
    }
    best.map(|(slot, _)| slot)
}

/// A configured scheduler: core plus algorithm
pub struct Strategy {
    core: StrategyCore,
    algorithm: Box<dyn SchedulingAlgorithm>,
}

impl Strategy {
    /// Combine `core` and `algorithm`; DSA-based algorithms need DSA and APC
    pub fn new(core: StrategyCore, algorithm: Box<dyn SchedulingAlgorithm>) -> Result<Self, SchedulerError> {
        if algorithm.uses_dsa() && (core.dsa.is_none() || core.apc.is_none()) {
            return Err(SchedulerError::InvalidConfiguration(format!(
                "{} needs a DSA and an APC strategy",
                algorithm.name()
            )));
        }
        if core.state.scheduler_spot == SchedulerSpot::UlSlave && !algorithm.uses_dsa() {
            return Err(SchedulerError::InvalidConfiguration(format!(
                "{} cannot run as uplink slave",
                algorithm.name()
            )));
        }
        Ok(Self { core, algorithm })
    }

    /// Name of the algorithm
    pub fn name(&self) -> &'static str {
        self.algorithm.name()
    }

    /// Shared state
    pub fn core(&self) -> &StrategyCore {
        &self.core
    }

    /// Mutable shared state, e.g. to feed HARQ feedback
    pub fn core_mut(&mut self) -> &mut StrategyCore {
        &mut self.core
    }

    fn validate(&self, input: &StrategyInput) {
        assert!(input.f_channels >= 1, "need at least one subChannel");
        assert!(input.slot_length >= 0.0, "invalid slotLength {}", input.slot_length);
        assert!(
            input.slot_length + SLOT_LENGTH_ROUNDING_TOLERANCE >= self.core.state.symbol_duration,
            "slotLength {} shorter than one symbol {}",
            input.slot_length,
            self.core.state.symbol_duration
        );
        assert!(input.number_of_time_slots >= 1, "need at least one time slot");
        assert!(input.max_spatial_layers >= 1, "need at least one spatial layer");
        if self.core.state.scheduler_spot == SchedulerSpot::UlSlave {
            assert!(input.input_scheduling_map.is_some(), "an uplink slave needs the master's map");
        }
    }

    /// Run one scheduling pass over `queue`
    pub fn start_scheduling(&mut self, mut input: StrategyInput, queue: &mut dyn Queue) -> StrategyResult {
        self.validate(&input);
        let mut map = input.take_scheduling_map();
        assert_eq!(
            map.number_of_sub_channels(),
            input.f_channels,
            "input map does not match fChannels"
        );
        let frame_nr = input.frame_nr;
        let core = &mut self.core;
        core.state.current = RevolvingState::new(input);

        if core.state.scheduler_spot == SchedulerSpot::UlSlave {
            map.process_master_map();
        }

        let reachable = core.registry.filter_reachable_connections(&queue.active_connections(), frame_nr);
        if core.state.use_cqi
            && core.registry.cqi_available()
            && (self.algorithm.requires_cqi() || core.dsa.as_ref().map_or(false, |d| d.requires_cqi()))
        {
            let users: UserSet = reachable.iter().map(|cid| core.registry.user_for_cid(*cid)).collect();
            core.collect_channel_qualities(&users);
        }
        if let Some(dsa) = core.dsa.as_mut() {
            dsa.initialize(&core.state, &map);
        }
        if let Some(apc) = core.apc.as_mut() {
            apc.initialize(&core.state, &map);
        }
        if core.harq.is_some() {
            self.algorithm.schedule_retransmissions(core, &mut map);
        }

        for priority in 0..core.registry.number_of_priorities() {
            let active: ConnectionSet = queue
                .active_connections_for_priority(priority)
                .intersection(&reachable)
                .copied()
                .collect();
            if active.is_empty() {
                continue;
            }
            core.state.current.current_priority = priority;
            core.state.current.active_connections = active;
            core.state.current.grouping = None;
            self.algorithm.do_start_scheduling(core, &mut map, queue);
        }

        if let Some(apc) = core.apc.as_mut() {
            apc.post_process(&core.state, &mut map);
        }
        map.assert_consistent();

        let mut bursts = map.to_map_info_collection();
        for burst in &mut bursts {
            let channel = core.channel_state(burst.user, burst.sub_band);
            burst.estimated_cand_i = CandI {
                c: burst.tx_power / channel.pathloss,
                i: channel.interference,
                pathloss: channel.pathloss,
            };
        }
        core.state.current.bursts = bursts.clone();
        let resource_usage = map.resource_usage();
        put_if_observed(core.resource_usage_probe.as_deref(), resource_usage, &[]);
        info!(
            "{} frame {}: {} bursts, {} compounds, usage {:.3}",
            self.algorithm.name(),
            frame_nr,
            bursts.len(),
            map.number_of_compounds(),
            resource_usage
        );
        StrategyResult { frame_nr, scheduling_map: map, bursts, resource_usage }
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::apc::UseMaxTxPower;
    use crate::dsa::{DsaPolicy, LinearFFirst};
    use crate::registry::StaticRegistry;

    struct PlaceEverything;

    impl SchedulingAlgorithm for PlaceEverything {
        fn name(&self) -> &'static str {
            "PlaceEverything"
        }

        fn uses_dsa(&self) -> bool {
            true
        }

        fn do_start_scheduling(&mut self, core: &mut StrategyCore, map: &mut SchedulingMap, queue: &mut dyn Queue) {
            let cids: Vec<ConnectionId> = core.active_connections().iter().copied().collect();
            for cid in cids {
                let user = core.registry().user_for_cid(cid);
                while queue.queue_has_pdus(cid) {
                    let mut request = RequestForResource::new(cid, user, queue.head_of_line_pdu_bits(cid));
                    let Some(burst) = core.do_adaptive_resource_scheduling(&mut request, map) else {
                        break;
                    };
                    let pdu = dequeue_for(queue, &mut request);
                    core.commit(map, &request, &burst, Some(pdu));
                }
            }
        }
    }

    fn strategy(registry: Rc<StaticRegistry>) -> Strategy {
        let policy = DsaPolicy::new(true, registry.phy_mode_mapper());
        let core = StrategyCore::new(registry.clone(), SchedulerSpot::DlMaster)
            .with_dsa(Box::new(LinearFFirst::new(policy)))
            .with_apc(Box::new(UseMaxTxPower::new(registry)));
        Strategy::new(core, Box::new(PlaceEverything)).unwrap()
    }

    #[test]
    fn test_dsa_algorithm_needs_dsa_and_apc() {
        let registry = registry(&[(1, 90.0)]);
        let core = StrategyCore::new(registry, SchedulerSpot::DlMaster);
        assert!(matches!(
            Strategy::new(core, Box::new(PlaceEverything)),
            Err(SchedulerError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_adaptive_resource_scheduling_places_into_map() {
        let registry = registry(&[(1, 90.0), (2, 95.0)]);
        let mut queue = filled_queue(registry.clone(), &[1, 2], 3, 100);
        let mut strategy = strategy(registry);
        let result = strategy.start_scheduling(StrategyInput::new(4, 1e-3, 1, 1, 3), &mut queue);
        assert!(queue.is_empty());
        assert_eq!(result.frame_nr, 3);
        assert_eq!(result.scheduled_compounds(), 6);
        assert_eq!(result.scheduled_bits(), 600);
        assert_eq!(result.users(), UserSet::from([UserId(1), UserId(2)]));
        // one user per subchannel
        assert_eq!(result.bursts.len(), 2);
        assert_ne!(result.bursts[0].sub_band, result.bursts[1].sub_band);
        assert!(result.resource_usage > 0.0 && result.resource_usage <= 1.0);
    }

    #[test]
    fn test_empty_queue_gives_empty_map() {
        let registry = registry(&[(1, 90.0)]);
        let mut queue = filled_queue(registry.clone(), &[], 0, 0);
        let result = strategy(registry).start_scheduling(StrategyInput::new(2, 1e-3, 1, 1, 0), &mut queue);
        assert!(result.scheduling_map.is_empty());
        assert_eq!(result.resource_usage, 0.0);
    }

    #[test]
    #[should_panic(expected = "need at least one subChannel")]
    fn test_zero_sub_channels_rejected() {
        let registry = registry(&[(1, 90.0)]);
        let mut queue = filled_queue(registry.clone(), &[], 0, 0);
        strategy(registry).start_scheduling(StrategyInput::new(0, 1e-3, 1, 1, 0), &mut queue);
    }

    #[test]
    fn test_bits_fitting_respects_symbols() {
        let registry = registry(&[(1, 90.0)]);
        let core = StrategyCore::new(registry, SchedulerSpot::DlMaster).with_symbol_duration(1e-4);
        let mode = core.mapper().phy_mode_for_index(0);
        // 125 kbit/s: 0.25 ms free holds two whole symbols = 25 bits
        assert_eq!(core.bits_fitting(2.5e-4, &mode), 25);
        assert!((core.rounded_duration(13, &mode) - 2e-4).abs() < 1e-12);
    }

    #[test]
    fn test_least_used_slot_skips_locked_and_rejected() {
        let mut map = SchedulingMap::new(1e-3, 3, 1, 1, 0);
        map.mask_out_sub_channels(&[false, true, true]);
        assert_eq!(least_used_slot(&map, |_, _| true), Some((1, 0)));
        assert_eq!(least_used_slot(&map, |sc, _| sc == 2), Some((2, 0)));
        assert_eq!(least_used_slot(&map, |_, _| false), None);
    }
}
