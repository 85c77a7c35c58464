//! Persistent scheduling of VoIP connections
//!
//! Frame `frame_nr % number_of_frames` of a [`ResourceGrid`] is served in
//! each pass. Talking connections keep their reservation every period, new
//! and reactivated ones get one, and connections that no longer fit their
//! frame move to another frame of the period. Connections that are not
//! persistent (yet) get a reservation for this frame only, halving the
//! request until something fits.

use super::{SchedulingAlgorithm, StrategyCore};
use crate::dsa::DsaResult;
use crate::map::SchedulingMap;
use crate::persistent::{
    ClassifiedConnections, LinkAdaptor, PersistentVoipConfig, ResourceGrid, StateTracker, TbChoser,
};
use crate::queue::Queue;
use crate::types::{Bits, ConnectionSet};
use crate::SchedulerError;
use common::types::ConnectionId;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, trace, warn};

/// Running counters of the persistent scheduler
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PersistentVoipStats {
    pub frames: u64,
    pub setups: u64,
    pub failed_setups: u64,
    pub reactivations: u64,
    pub failed_reactivations: u64,
    /// Moved within their frame
    pub freq_relocations: u64,
    pub failed_freq_relocations: u64,
    /// Moved to another frame
    pub time_relocations: u64,
    pub failed_time_relocations: u64,
    pub silenced: u64,
    pub unpersistent_served: u64,
    pub unpersistent_failed: u64,
    pub dynamic_served: u64,
    pub dynamic_failed: u64,
}

/// Served and failed connections of one step
#[derive(Debug, Default)]
struct Outcome {
    served: ConnectionSet,
    failed: ConnectionSet,
}

pub struct PersistentVoip {
    config: PersistentVoipConfig,
    grid: Option<ResourceGrid>,
    tracker: StateTracker,
    /// Frames each time-relocated connection was tried in before it moved
    relocation_frames: BTreeMap<ConnectionId, BTreeSet<usize>>,
    /// Connections relocated into a frame, announced when that frame comes up
    pending_setups: Vec<ConnectionSet>,
    stats: PersistentVoipStats,
    never_used: bool,
}

impl PersistentVoip {
    pub fn new(config: PersistentVoipConfig) -> Result<Self, SchedulerError> {
        config.validate()?;
        let frames = config.number_of_frames;
        Ok(Self {
            tracker: StateTracker::new(frames),
            pending_setups: vec![ConnectionSet::new(); frames],
            grid: None,
            relocation_frames: BTreeMap::new(),
            stats: PersistentVoipStats::default(),
            never_used: true,
            config,
        })
    }

    pub fn stats(&self) -> &PersistentVoipStats {
        &self.stats
    }

    /// The grid, once the first data arrived
    pub fn grid(&self) -> Option<&ResourceGrid> {
        self.grid.as_ref()
    }

    pub fn state_tracker(&self) -> &StateTracker {
        &self.tracker
    }

    fn create_grid(&self, core: &StrategyCore, map: &SchedulingMap) -> Result<ResourceGrid, SchedulerError> {
        let adaptor = LinkAdaptor::new(
            core.registry.clone(),
            map.slot_length(),
            core.state.scheduler_spot,
            self.config.link_adaptation,
        );
        let choser = TbChoser::new(
            self.config.tb_choser,
            self.config.return_random,
            StdRng::seed_from_u64(self.config.seed),
        );
        ResourceGrid::new(self.config.number_of_frames, map.number_of_sub_channels(), Box::new(adaptor), choser)
    }

    /// Size a persistent reservation is made for
    fn persistent_pdu_size(&self, queue: &dyn Queue, cid: ConnectionId) -> Bits {
        queue.head_of_line_pdu_bits(cid).min(self.config.voice_pdu_size)
    }

    /// Split off the persistent connections that outgrew their reservation
    fn check_tb_sizes(grid: &ResourceGrid, persistent: &mut ConnectionSet, frame: usize, pdu_size: impl Fn(ConnectionId) -> Bits) -> ConnectionSet {
        let need_more: ConnectionSet = persistent
            .iter()
            .copied()
            .filter(|&cid| {
                assert!(grid.has_persistent_reservation(frame, cid), "no persistent reservation for {}", cid);
                !grid.fits_persistent_reservation(frame, cid, pdu_size(cid))
            })
            .collect();
        for cid in &need_more {
            debug!("{} does not fit its reservation in frame {} anymore", cid, frame);
            persistent.remove(cid);
        }
        need_more
    }

    /// Reserve persistently in `frame`; failed connections are silenced there
    fn schedule_persistently(&mut self, queue: &dyn Queue, cids: &ConnectionSet, frame: usize) -> Outcome {
        let mut outcome = Outcome::default();
        for &cid in cids {
            let pdu_size = self.persistent_pdu_size(queue, cid);
            let Some(grid) = self.grid.as_mut() else {
                return outcome;
            };
            if grid.has_persistent_reservation(frame, cid) {
                if grid.fits_persistent_reservation(frame, cid, pdu_size) {
                    outcome.served.insert(cid);
                    continue;
                }
                grid.unschedule_cid(frame, cid);
            }
            if grid.schedule_cid(frame, cid, pdu_size, true) {
                outcome.served.insert(cid);
            } else {
                debug!("no persistent resources for {} in frame {}", cid, frame);
                self.tracker.silence_cid(cid, frame);
                outcome.failed.insert(cid);
            }
        }
        outcome
    }

    /// Move connections that found no room in `frame` to another frame of the period
    fn relocate(&mut self, queue: &dyn Queue, cids: &ConnectionSet, frame: usize) -> Outcome {
        let mut outcome = Outcome::default();
        let frames = self.config.number_of_frames;
        for &cid in cids {
            let pdu_size = self.persistent_pdu_size(queue, cid);
            let Some(grid) = self.grid.as_mut() else {
                return outcome;
            };
            let most_empty = grid.most_empty_frame();
            let order = std::iter::once(most_empty)
                .chain((1..frames).map(|offset| (frame + offset) % frames))
                .filter(|&f| f != frame);
            let mut tried = BTreeSet::from([frame]);
            let mut target = None;
            for candidate in order {
                let holds_block = grid.reservation(candidate, cid, true).is_some()
                    || grid.reservation(candidate, cid, false).is_some();
                if !tried.insert(candidate) || holds_block {
                    continue;
                }
                if grid.schedule_cid(candidate, cid, pdu_size, true) {
                    tried.remove(&candidate);
                    target = Some(candidate);
                    break;
                }
            }
            match target {
                Some(new_frame) => {
                    self.tracker.relocate_cid(cid, frame, new_frame);
                    self.pending_setups[new_frame].insert(cid);
                    self.relocation_frames.insert(cid, tried);
                    debug!("{} relocated from frame {} to {}", cid, frame, new_frame);
                    outcome.served.insert(cid);
                }
                None => {
                    debug!("no frame left for {}", cid);
                    outcome.failed.insert(cid);
                }
            }
        }
        outcome
    }

    /// Reserve for this frame only, halving the request until it fits
    fn reserve_unpersistently(&mut self, queue: &dyn Queue, cid: ConnectionId, frame: usize) -> bool {
        let Some(grid) = self.grid.as_mut() else {
            return false;
        };
        let pdu_size = queue.head_of_line_pdu_bits(cid);
        let mut divisor = 1;
        while divisor <= pdu_size {
            if grid.schedule_cid(frame, cid, pdu_size / divisor, false) {
                trace!("{}: unpersistent reservation for {} of {} bits", cid, pdu_size / divisor, pdu_size);
                return true;
            }
            divisor *= 2;
        }
        false
    }

    /// Put the reservation of `cid` into the map; returns the bits placed
    fn schedule_data(
        &self,
        core: &StrategyCore,
        map: &mut SchedulingMap,
        queue: &mut dyn Queue,
        cid: ConnectionId,
        persistent: bool,
        frame: usize,
    ) -> Bits {
        let Some(block) = self.grid.as_ref().and_then(|g| g.reservation(frame, cid, persistent)).cloned() else {
            panic!("no reservation for {} in frame {}", cid, frame);
        };
        assert!(queue.queue_has_pdus(cid), "cannot schedule {} without queued PDUs", cid);
        let user = core.registry.user_for_cid(cid);
        let mut placed = 0;
        for sub_channel in block.sub_channels() {
            if !queue.queue_has_pdus(cid) {
                break;
            }
            if !map.sub_channels[sub_channel].sub_channel_is_usable || !map.prb(sub_channel, 0, 0).is_empty() {
                trace!("RB {} of {} is taken in the map", sub_channel, cid);
                continue;
            }
            let position = DsaResult { sub_channel, time_slot: 0, spatial_layer: 0 };
            placed += core.fill_block(
                map,
                queue,
                cid,
                user,
                position,
                block.phy_mode,
                block.tx_power,
                core.pattern_for(user),
            );
        }
        trace!("{}: {} bits in RBs {:?}, persistent: {}", cid, placed, block.sub_channels(), persistent);
        placed
    }

    fn count(served: &mut u64, failed: &mut u64, outcome: &Outcome) {
        *served += outcome.served.len() as u64;
        *failed += outcome.failed.len() as u64;
    }

    fn schedule_frame(
        &mut self,
        core: &mut StrategyCore,
        map: &mut SchedulingMap,
        queue: &mut dyn Queue,
        frame: usize,
        classified: ClassifiedConnections,
        active: &ConnectionSet,
    ) {
        let Some(grid) = self.grid.as_mut() else {
            return;
        };
        grid.on_new_frame(frame, Some(&*map));

        let mut persistent = classified.persistent.clone();
        let need_more = {
            let pdu_size = |cid| queue.head_of_line_pdu_bits(cid).min(self.config.voice_pdu_size);
            Self::check_tb_sizes(grid, &mut persistent, frame, pdu_size)
        };
        grid.unschedule_cids(frame, &need_more);
        let announced = std::mem::take(&mut self.pending_setups[frame]);
        trace!("frame {}: {} relocated connections arrive", frame, announced.len());

        let reactivated = self.schedule_persistently(queue, &classified.reactivated, frame);
        let setup = self.schedule_persistently(queue, &classified.new_persistent, frame);
        let moved = self.schedule_persistently(queue, &need_more, frame);
        let homeless: ConnectionSet =
            reactivated.failed.iter().chain(&setup.failed).chain(&moved.failed).copied().collect();
        let relocated = self.relocate(queue, &homeless, frame);

        let stats = &mut self.stats;
        Self::count(&mut stats.reactivations, &mut stats.failed_reactivations, &reactivated);
        Self::count(&mut stats.setups, &mut stats.failed_setups, &setup);
        Self::count(&mut stats.freq_relocations, &mut stats.failed_freq_relocations, &moved);
        Self::count(&mut stats.time_relocations, &mut stats.failed_time_relocations, &relocated);

        persistent.extend(reactivated.served.iter().chain(&setup.served).chain(&moved.served).copied());
        for &cid in &persistent {
            self.schedule_data(core, map, queue, cid, true, frame);
        }

        let mut failed = ConnectionSet::new();
        for &cid in &classified.unpersistent {
            if self.reserve_unpersistently(queue, cid, frame) {
                self.schedule_data(core, map, queue, cid, false, frame);
                self.stats.unpersistent_served += 1;
            } else {
                self.tracker.unserved_cid(cid);
                self.stats.unpersistent_failed += 1;
                failed.insert(cid);
            }
        }

        // leftovers and connections whose own frame could not serve them
        let leftovers: Vec<ConnectionId> = active
            .iter()
            .copied()
            .filter(|cid| queue.queue_has_pdus(*cid) && !failed.contains(cid))
            .filter(|cid| !self.relocation_frames.get(cid).map_or(false, |tried| tried.contains(&frame)))
            .filter(|cid| {
                self.grid
                    .as_ref()
                    .map_or(false, |g| g.reservation(frame, *cid, true).is_none() && g.reservation(frame, *cid, false).is_none())
            })
            .collect();
        for cid in leftovers {
            if self.reserve_unpersistently(queue, cid, frame) {
                self.schedule_data(core, map, queue, cid, false, frame);
                if self.tracker.served_in_other_frame_cid(cid) {
                    trace!("{} served outside its frame", cid);
                }
                self.stats.dynamic_served += 1;
            } else {
                self.stats.dynamic_failed += 1;
            }
        }
        let reserved = self.grid.as_ref().map_or(0, |g| g.frame(frame).num_reserved());
        debug!("frame {}: {} persistent, {} RBs reserved", frame, persistent.len(), reserved);
    }
}

impl SchedulingAlgorithm for PersistentVoip {
    fn name(&self) -> &'static str {
        "PersistentVoIP"
    }

    fn do_start_scheduling(&mut self, core: &mut StrategyCore, map: &mut SchedulingMap, queue: &mut dyn Queue) {
        let frame = core.state.frame_nr() as usize % self.config.number_of_frames;
        let active = queue.filter_queued_cids(core.active_connections());
        if self.never_used && active.is_empty() {
            return;
        }
        self.never_used = false;
        if self.grid.is_none() {
            match self.create_grid(core, map) {
                Ok(grid) => self.grid = Some(grid),
                Err(err) => {
                    warn!("cannot create resource grid: {}", err);
                    return;
                }
            }
        }

        let classified = self.tracker.update_state(&active, frame);
        if let Some(grid) = self.grid.as_mut() {
            grid.unschedule_cids(frame, &classified.silenced);
        }
        for cid in &classified.silenced {
            self.relocation_frames.remove(cid);
        }
        self.stats.silenced += classified.silenced.len() as u64;
        self.stats.frames += 1;
        if frame == 0 {
            info!("new period: {:?}", self.stats);
        }
        if active.is_empty() {
            return;
        }
        debug!(
            "frame {}: {} active, {} of them by the application, {} queued",
            frame, classified.total_active, classified.total_app_active, classified.total_queued
        );
        self.schedule_frame(core, map, queue, frame, classified, &active);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compound::CompoundFactory;
    use crate::queue::SimpleQueue;
    use crate::strategy::test_support::registry;
    use crate::strategy::{RevolvingState, StrategyInput};
    use crate::types::SchedulerSpot;
    use crate::{MapInfoCollection, PhyMode};

    struct Setup {
        core: StrategyCore,
        voip: PersistentVoip,
        queue: SimpleQueue,
        factory: CompoundFactory,
        sub_channels: usize,
    }

    impl Setup {
        fn new(frames: usize, sub_channels: usize) -> Self {
            let registry = registry(&[(1, 90.0), (2, 90.0)]);
            let config = PersistentVoipConfig { number_of_frames: frames, voice_pdu_size: 2000, ..Default::default() };
            Self {
                core: StrategyCore::new(registry.clone(), SchedulerSpot::DlMaster),
                voip: PersistentVoip::new(config).unwrap(),
                queue: SimpleQueue::new(registry),
                factory: CompoundFactory::new(),
                sub_channels,
            }
        }

        fn talk(&mut self, cid: u32, bits: Bits) {
            self.queue.put(self.factory.create(ConnectionId(cid), bits));
        }

        fn run(&mut self, frame_nr: u32) -> MapInfoCollection {
            let mut input = StrategyInput::new(self.sub_channels, 1e-3, 1, 1, frame_nr);
            let mut map = input.take_scheduling_map();
            self.core.state.current = RevolvingState::new(input);
            self.core.state.current.active_connections = self.queue.active_connections();
            self.voip.do_start_scheduling(&mut self.core, &mut map, &mut self.queue);
            map.assert_consistent();
            map.to_map_info_collection()
        }

        fn reservation(&self, frame: usize, cid: u32) -> Option<(usize, usize, usize)> {
            self.voip
                .grid()?
                .reservation(frame, ConnectionId(cid), true)
                .map(|b| (b.start, b.length, b.phy_mode.index))
        }
    }

    #[test]
    fn test_talk_spurt_gets_persistent_reservation() {
        let mut s = Setup::new(1, 3);
        s.talk(1, 500);
        let bursts = s.run(0);
        assert_eq!(bursts.len(), 1);
        assert_eq!(s.reservation(0, 1), None);

        s.talk(1, 500);
        s.run(1);
        // 500 bits fill one RB at 500 kbit/s
        assert_eq!(s.reservation(0, 1), Some((0, 1, 3)));
        assert_eq!(s.voip.stats().setups, 1);

        s.talk(1, 500);
        let bursts = s.run(2);
        assert_eq!(bursts.len(), 1);
        assert_eq!(bursts[0].sub_band, 0);
        assert_eq!(bursts[0].phy_mode.index, 3);
        assert!(s.queue.is_empty());
    }

    #[test]
    fn test_silence_releases_reservation() {
        let mut s = Setup::new(1, 3);
        for nr in 0..3 {
            s.talk(1, 500);
            s.run(nr);
        }
        assert!(s.reservation(0, 1).is_some());
        let bursts = s.run(3);
        assert!(bursts.is_empty());
        assert_eq!(s.reservation(0, 1), None);
        assert_eq!(s.voip.stats().silenced, 1);
        assert!(s.voip.state_tracker().is_silent(ConnectionId(1)));
    }

    #[test]
    fn test_growing_pdu_moves_within_frame() {
        let mut s = Setup::new(1, 3);
        for nr in 0..2 {
            s.talk(1, 500);
            s.run(nr);
        }
        assert_eq!(s.reservation(0, 1), Some((0, 1, 3)));
        s.talk(1, 1500);
        s.run(2);
        // two RBs, down to 750 kbit/s
        assert_eq!(s.reservation(0, 1), Some((0, 2, 4)));
        assert_eq!(s.voip.stats().freq_relocations, 1);
    }

    #[test]
    fn test_full_frame_relocates_to_empty_frame() {
        let mut s = Setup::new(3, 1);
        s.talk(1, 500);
        s.run(0);
        s.run(1);
        s.run(2);

        s.talk(1, 500);
        s.talk(2, 500);
        let bursts = s.run(3);
        assert_eq!(bursts.len(), 1);
        assert_eq!(bursts[0].user, common::types::UserId(1));

        // the leftover of connection 2 is served in frame 1
        let bursts = s.run(4);
        assert_eq!(bursts.len(), 1);
        assert!(s.queue.is_empty());
        s.run(5);

        s.talk(1, 500);
        s.talk(2, 500);
        s.run(6);
        assert_eq!(s.voip.stats().failed_setups, 1);
        assert_eq!(s.voip.stats().time_relocations, 1);
        assert_eq!(s.voip.state_tracker().frame_for_cid(ConnectionId(2)), Some(2));
        assert!(s.reservation(2, 2).is_some());
        assert!(s.reservation(0, 1).is_some());
    }

    #[test]
    fn test_unpersistent_request_is_halved() {
        let mut s = Setup::new(1, 1);
        // 2000 bits need two RBs; half of it fits one
        s.talk(1, 2000);
        s.run(0);
        let block = s.voip.grid().unwrap().reservation(0, ConnectionId(1), false).cloned().unwrap();
        assert_eq!(block.length, 1);
        assert_ne!(block.phy_mode, PhyMode::invalid());
        assert_eq!(s.voip.stats().unpersistent_served, 1);
    }

    #[test]
    fn test_idle_scheduler_creates_no_grid() {
        let mut s = Setup::new(2, 3);
        assert!(s.run(0).is_empty());
        assert!(s.voip.grid().is_none());
    }

    #[test]
    fn test_zero_frames_rejected() {
        let config = PersistentVoipConfig { number_of_frames: 0, ..Default::default() };
        assert!(PersistentVoip::new(config).is_err());
    }
}
