//! Persistent reservation grid
//!
//! The grid covers one period of `number_of_frames` frames with one resource
//! block per subchannel each. A connection gets a [`TransmissionBlock`], a
//! contiguous run of blocks, either persistently (kept for every period) or
//! for this frame only. Every change of a frame's reservation count is
//! checked against the occupancy of its blocks.

use super::link_adaptation::LinkAdaptation;
use super::tb_choser::TbChoser;
use crate::map::SchedulingMap;
use crate::phy_mode::PhyMode;
use crate::types::{Bits, ConnectionSet};
use crate::SchedulerError;
use common::types::{ConnectionId, Power, Ratio};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use tracing::{debug, trace};

/// A free run of blocks, possibly with a transmission block placed inside
#[derive(Debug, Clone, PartialEq)]
pub struct SearchResult {
    /// First block of the free run
    pub start: usize,
    /// Length of the free run
    pub length: usize,
    /// First block of the transmission block
    pub tb_start: usize,
    /// Blocks the transmission needs
    pub tb_length: usize,
    /// Frame of the run
    pub frame: usize,
    /// Modulation and coding, once link adaptation ran
    pub phy_mode: Option<PhyMode>,
    /// Effective SINR over the transmission block
    pub estimated_sinr: Ratio,
    /// Power per block
    pub tx_power: Power,
}

impl SearchResult {
    /// Free run of `length` blocks at `start` in `frame`
    pub fn new(frame: usize, start: usize, length: usize) -> Self {
        Self {
            start,
            length,
            tb_start: start,
            tb_length: 0,
            frame,
            phy_mode: None,
            estimated_sinr: Ratio::default(),
            tx_power: Power::zero(),
        }
    }
}

/// Blocks reserved for one connection
///
/// A plain record of a reservation. The owning [`Frame`] marks its
/// subchannels occupied when it stores the block and frees them when it
/// removes it; a copy handed out by [`ResourceGrid::reservation`] holds no
/// occupancy, and dropping it changes nothing.
#[derive(Debug, Clone, PartialEq)]
pub struct TransmissionBlock {
    pub cid: ConnectionId,
    pub frame: usize,
    pub start: usize,
    pub length: usize,
    pub phy_mode: PhyMode,
    pub tx_power: Power,
    pub estimated_sinr: Ratio,
}

impl TransmissionBlock {
    /// Subchannels covered
    pub fn sub_channels(&self) -> std::ops::Range<usize> {
        self.start..self.start + self.length
    }
}

/// One frame of the grid
#[derive(Debug)]
pub struct Frame {
    index: usize,
    occupied: Vec<bool>,
    persistent: BTreeMap<ConnectionId, TransmissionBlock>,
    unpersistent: BTreeMap<ConnectionId, TransmissionBlock>,
    blocked: BTreeSet<usize>,
    num_reserved: usize,
}

impl Frame {
    fn new(index: usize, sub_channels: usize) -> Self {
        assert!(sub_channels > 0, "need more than zero subchannels");
        Self {
            index,
            occupied: vec![false; sub_channels],
            persistent: BTreeMap::new(),
            unpersistent: BTreeMap::new(),
            blocked: BTreeSet::new(),
            num_reserved: 0,
        }
    }

    /// Position of the frame in the period
    pub fn index(&self) -> usize {
        self.index
    }

    /// Blocks in use by reservations or blocking
    pub fn num_reserved(&self) -> usize {
        self.num_reserved
    }

    /// True if block `rb` is neither reserved nor blocked
    pub fn is_free(&self, rb: usize) -> bool {
        !self.occupied[rb]
    }

    /// Maximal free run starting at or after `start`
    pub fn find_transmission_block(&self, start: usize) -> Option<SearchResult> {
        let n = self.occupied.len();
        let first = (start..n).find(|&rb| self.is_free(rb))?;
        let length = (first..n).take_while(|&rb| self.is_free(rb)).count();
        Some(SearchResult::new(self.index, first, length))
    }

    /// All maximal free runs, left to right
    pub fn find_transmission_blocks(&self) -> Vec<SearchResult> {
        let mut runs = Vec::new();
        let mut start = 0;
        while start < self.occupied.len() {
            let Some(run) = self.find_transmission_block(start) else {
                break;
            };
            start = run.start + run.length;
            runs.push(run);
        }
        trace!("frame {} [{}]: {} free runs", self.index, self, runs.len());
        runs
    }

    fn live_occupancy(&self) -> usize {
        self.occupied.iter().filter(|o| **o).count()
    }

    fn occupy(&mut self, rbs: std::ops::Range<usize>) {
        for rb in rbs {
            assert!(self.is_free(rb), "RB {} of frame {} is already occupied", rb, self.index);
            self.occupied[rb] = true;
        }
    }

    fn release(&mut self, rbs: std::ops::Range<usize>) {
        for rb in rbs {
            assert!(!self.is_free(rb), "RB {} of frame {} is already free", rb, self.index);
            self.occupied[rb] = false;
        }
    }

    fn set_num_reserved(&mut self, count: usize) {
        assert_eq!(
            count,
            self.live_occupancy(),
            "frame {}: reservation count does not match the occupied RBs",
            self.index
        );
        self.num_reserved = count;
    }

    fn reserve(&mut self, cid: ConnectionId, result: &SearchResult, persistent: bool) {
        assert!(result.tb_length > 0, "empty transmission block for {}", cid);
        assert!(
            result.tb_start + result.tb_length <= self.occupied.len(),
            "request exceeds number of subchannels"
        );
        assert!(!self.persistent.contains_key(&cid), "{} already scheduled persistently", cid);
        assert!(!self.unpersistent.contains_key(&cid), "{} already scheduled unpersistently", cid);
        let Some(phy_mode) = result.phy_mode else {
            panic!("reserve() for {} without PhyMode", cid);
        };
        let block = TransmissionBlock {
            cid,
            frame: self.index,
            start: result.tb_start,
            length: result.tb_length,
            phy_mode,
            tx_power: result.tx_power,
            estimated_sinr: result.estimated_sinr,
        };
        self.occupy(block.sub_channels());
        debug!(
            "frame {}: reserved {} RBs at {} for {}, persistent: {}",
            self.index, block.length, block.start, cid, persistent
        );
        if persistent {
            self.persistent.insert(cid, block);
        } else {
            self.unpersistent.insert(cid, block);
        }
        self.set_num_reserved(self.num_reserved + result.tb_length);
    }

    fn block(&mut self, rb: usize) {
        self.occupy(rb..rb + 1);
        self.blocked.insert(rb);
        self.set_num_reserved(self.num_reserved + 1);
    }

    fn remove_reservation(&mut self, cid: ConnectionId) -> bool {
        let removed: Vec<TransmissionBlock> =
            [self.persistent.remove(&cid), self.unpersistent.remove(&cid)].into_iter().flatten().collect();
        let freed: usize = removed.iter().map(|b| b.length).sum();
        for block in &removed {
            self.release(block.sub_channels());
        }
        self.set_num_reserved(self.num_reserved - freed);
        !removed.is_empty()
    }

    fn clear_unpersistent_schedule(&mut self) {
        let blocks = std::mem::take(&mut self.unpersistent);
        let freed: usize = blocks.values().map(|b| b.length).sum();
        for block in blocks.values() {
            self.release(block.sub_channels());
        }
        self.set_num_reserved(self.num_reserved - freed);
    }

    fn clear_blocked(&mut self) {
        let blocked = std::mem::take(&mut self.blocked);
        for &rb in &blocked {
            self.release(rb..rb + 1);
        }
        self.set_num_reserved(self.num_reserved - blocked.len());
    }

    /// True if `cid` holds a reservation of the given kind
    pub fn has_reservation(&self, cid: ConnectionId, persistent: bool) -> bool {
        self.reservation(cid, persistent).is_some()
    }

    /// Reservation of `cid` of the given kind
    pub fn reservation(&self, cid: ConnectionId, persistent: bool) -> Option<&TransmissionBlock> {
        if persistent {
            self.persistent.get(&cid)
        } else {
            self.unpersistent.get(&cid)
        }
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for occupied in &self.occupied {
            f.write_str(if *occupied { "1" } else { "0" })?;
        }
        Ok(())
    }
}

/// Reservations over one period of frames
pub struct ResourceGrid {
    frames: Vec<Frame>,
    sub_channels_per_frame: usize,
    /// (reserved blocks, frame), kept in step with every frame change
    occupations: BTreeSet<(usize, usize)>,
    link_adaptation: Box<dyn LinkAdaptation>,
    tb_choser: TbChoser,
}

impl ResourceGrid {
    /// Empty grid of `number_of_frames` frames with `sub_channels` blocks each
    pub fn new(
        number_of_frames: usize,
        sub_channels: usize,
        link_adaptation: Box<dyn LinkAdaptation>,
        tb_choser: TbChoser,
    ) -> Result<Self, SchedulerError> {
        if number_of_frames == 0 {
            return Err(SchedulerError::InvalidConfiguration("need more than zero frames".into()));
        }
        if sub_channels == 0 {
            return Err(SchedulerError::InvalidConfiguration("need more than zero subchannels".into()));
        }
        debug!("creating resource grid with {} RBs per frame in {} frames", sub_channels, number_of_frames);
        Ok(Self {
            frames: (0..number_of_frames).map(|i| Frame::new(i, sub_channels)).collect(),
            sub_channels_per_frame: sub_channels,
            occupations: (0..number_of_frames).map(|i| (0, i)).collect(),
            link_adaptation,
            tb_choser,
        })
    }

    pub fn number_of_frames(&self) -> usize {
        self.frames.len()
    }

    pub fn sub_channels_per_frame(&self) -> usize {
        self.sub_channels_per_frame
    }

    /// Frame `index`
    pub fn frame(&self, index: usize) -> &Frame {
        assert!(index < self.frames.len(), "frame index {} out of range", index);
        &self.frames[index]
    }

    /// Run `change` on frame `index` and track its new reservation count
    fn update_frame(&mut self, index: usize, change: impl FnOnce(&mut Frame)) {
        assert!(index < self.frames.len(), "invalid frame index {}", index);
        let old = self.frames[index].num_reserved();
        change(&mut self.frames[index]);
        self.update_reservation_count(index, self.frames[index].num_reserved(), old);
    }

    /// Move frame `frame` from `old_count` to `count` reserved blocks
    pub fn update_reservation_count(&mut self, frame: usize, count: usize, old_count: usize) {
        assert!(self.occupations.remove(&(old_count, frame)), "frame {} was not at {} reserved RBs", frame, old_count);
        assert_eq!(count, self.frames[frame].live_occupancy(), "frame {}: count out of step with RBs", frame);
        self.occupations.insert((count, frame));
    }

    /// Reserve blocks for `pdu_size` bits of `cid` in `frame`
    ///
    /// Returns false and changes nothing if no free run can carry the PDU.
    pub fn schedule_cid(&mut self, frame: usize, cid: ConnectionId, pdu_size: Bits, persistent: bool) -> bool {
        assert!(frame < self.frames.len(), "invalid frame index {}", frame);
        let runs = self.frames[frame].find_transmission_blocks();
        let candidates = self.link_adaptation.set_tb_sizes(&runs, cid, pdu_size);
        if candidates.is_empty() {
            debug!("frame {}: no resources for {} bits of {}", frame, pdu_size, cid);
            return false;
        }
        let chosen = self.tb_choser.chose_tb(&candidates);
        self.update_frame(frame, |f| f.reserve(cid, &chosen, persistent));
        true
    }

    /// Drop all reservations of `cid` in `frame`
    pub fn unschedule_cid(&mut self, frame: usize, cid: ConnectionId) {
        self.update_frame(frame, |f| {
            f.remove_reservation(cid);
        });
    }

    /// Drop all reservations of `cids` in `frame`
    pub fn unschedule_cids(&mut self, frame: usize, cids: &ConnectionSet) {
        for &cid in cids {
            self.unschedule_cid(frame, cid);
        }
    }

    /// True if `cid` holds a persistent reservation in `frame`
    pub fn has_persistent_reservation(&self, frame: usize, cid: ConnectionId) -> bool {
        self.frame(frame).has_reservation(cid, true)
    }

    /// True if the persistent reservation of `cid` still carries `pdu_size` bits
    pub fn fits_persistent_reservation(&self, frame: usize, cid: ConnectionId, pdu_size: Bits) -> bool {
        let Some(block) = self.frame(frame).reservation(cid, true) else {
            panic!("no persistent reservation for {} in frame {}", cid, frame);
        };
        self.link_adaptation.can_fit(block.start, block.length, frame, cid, pdu_size).fits
    }

    /// Reservation of `cid` in `frame`
    pub fn reservation(&self, frame: usize, cid: ConnectionId, persistent: bool) -> Option<&TransmissionBlock> {
        self.frame(frame).reservation(cid, persistent)
    }

    /// Start frame `index` of a new period
    ///
    /// Drops last period's unpersistent reservations and blocking. With a
    /// map, blocks already used there or locked become blocked.
    pub fn on_new_frame(&mut self, index: usize, map: Option<&SchedulingMap>) {
        self.update_frame(index, |f| {
            f.clear_unpersistent_schedule();
            f.clear_blocked();
        });
        let Some(map) = map else {
            return;
        };
        assert_eq!(
            map.number_of_sub_channels(),
            self.sub_channels_per_frame,
            "map does not match the resource grid"
        );
        let taken: Vec<usize> = (0..self.sub_channels_per_frame)
            .filter(|&sc| !map.sub_channels[sc].sub_channel_is_usable || !map.prb(sc, 0, 0).is_empty())
            .filter(|&sc| self.frames[index].is_free(sc))
            .collect();
        if !taken.is_empty() {
            trace!("frame {}: blocking {:?}", index, taken);
        }
        self.update_frame(index, |f| {
            for rb in taken {
                f.block(rb);
            }
        });
    }

    /// Frame with the fewest reserved blocks, lowest index on ties
    pub fn most_empty_frame(&self) -> usize {
        self.occupations.iter().next().map(|&(_, frame)| frame).unwrap_or(0)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::super::link_adaptation::{LinkAdaptationMode, LinkAdaptor};
    use super::super::tb_choser::{TbChoser, TbChoserKind};
    use super::*;
    use crate::registry::{RegistryConfig, StaticRegistry, StationConfig};
    use crate::types::SchedulerSpot;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::rc::Rc;

    /// Two users at 90 dB: 37 dB in the downlink, highest mode, 1125 bits per RB
    pub fn registry() -> Rc<StaticRegistry> {
        let mut config = RegistryConfig::default();
        config.stations = vec![
            StationConfig::new(1, &[1]).with_pathloss_db(90.0),
            StationConfig::new(2, &[2]).with_pathloss_db(90.0),
        ];
        Rc::new(StaticRegistry::new(config).unwrap())
    }

    pub fn grid(frames: usize, sub_channels: usize) -> ResourceGrid {
        let adaptor = LinkAdaptor::new(registry(), 1e-3, SchedulerSpot::DlMaster, LinkAdaptationMode::AtStart);
        let choser = TbChoser::new(TbChoserKind::First, false, StdRng::seed_from_u64(1));
        ResourceGrid::new(frames, sub_channels, Box::new(adaptor), choser).unwrap()
    }
}
