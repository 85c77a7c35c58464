//! Scheduling Map
//!
//! The allocatable resources of one frame: subchannels, each split into time
//! slots, each holding one [`PhysicalResourceBlock`] per spatial layer.
//! Strategies build one map per frame and hand it off with the result.

pub mod resource_block;
pub mod sub_channel;

pub use resource_block::{PhysicalResourceBlock, SchedulingCompound};
pub use sub_channel::{SchedulingSubChannel, SchedulingTimeSlot};

use crate::compound::CompoundPtr;
use crate::phy_mode::PhyMode;
use crate::types::{Bits, MapInfoCollection, MapInfoEntry, Pattern, RequestForResource};
use crate::SLOT_LENGTH_ROUNDING_TOLERANCE;
use common::types::{ConnectionId, Power, UserId};
use common::utils::{time::as_micros, SimTime};
use std::fmt;
use tracing::debug;

/// Resources of one frame and everything placed into them
#[derive(Debug, Clone)]
pub struct SchedulingMap {
    /// Length of one time slot
    slot_length: SimTime,
    /// Number of subchannels
    number_of_sub_channels: usize,
    /// Number of time slots per subchannel
    number_of_time_slots: usize,
    /// Number of spatial layers (beams) per time slot
    number_of_spatial_layers: usize,
    /// Frame this map belongs to
    frame_nr: u32,
    /// Number of compounds placed via `add_compound`
    number_of_compounds: usize,
    /// Subchannels in frequency order
    pub sub_channels: Vec<SchedulingSubChannel>,
}

impl SchedulingMap {
    /// Create an empty map
    pub fn new(
        slot_length: SimTime,
        number_of_sub_channels: usize,
        number_of_time_slots: usize,
        number_of_spatial_layers: usize,
        frame_nr: u32,
    ) -> Self {
        assert!(slot_length >= 0.0, "invalid slotLength {}", slot_length);
        assert!(number_of_time_slots >= 1, "need at least one time slot");
        assert!(number_of_spatial_layers >= 1, "need at least one spatial layer");
        let sub_channels = (0..number_of_sub_channels)
            .map(|sc| SchedulingSubChannel::new(sc, number_of_time_slots, number_of_spatial_layers, slot_length))
            .collect();
        Self {
            slot_length,
            number_of_sub_channels,
            number_of_time_slots,
            number_of_spatial_layers,
            frame_nr,
            number_of_compounds: 0,
            sub_channels,
        }
    }

    /// Length of one time slot
    pub fn slot_length(&self) -> SimTime {
        self.slot_length
    }

    /// Number of subchannels
    pub fn number_of_sub_channels(&self) -> usize {
        self.number_of_sub_channels
    }

    /// Number of time slots per subchannel
    pub fn number_of_time_slots(&self) -> usize {
        self.number_of_time_slots
    }

    /// Number of spatial layers
    pub fn number_of_spatial_layers(&self) -> usize {
        self.number_of_spatial_layers
    }

    /// Frame number
    pub fn frame_nr(&self) -> u32 {
        self.frame_nr
    }

    /// Number of compounds placed so far
    pub fn number_of_compounds(&self) -> usize {
        self.number_of_compounds
    }

    /// Block at the given coordinates
    pub fn prb(&self, sub_channel: usize, time_slot: usize, spatial_layer: usize) -> &PhysicalResourceBlock {
        self.sub_channels[sub_channel].prb(time_slot, spatial_layer)
    }

    /// Mutable block at the given coordinates
    pub fn prb_mut(&mut self, sub_channel: usize, time_slot: usize, spatial_layer: usize) -> &mut PhysicalResourceBlock {
        self.sub_channels[sub_channel].prb_mut(time_slot, spatial_layer)
    }

    /// Check whether the request fits into its proposed block at the burst's PHY mode
    pub fn pdu_fits_into_sub_channel(&self, request: &RequestForResource, burst: &MapInfoEntry) -> bool {
        let sub_channel = request.sub_channel.unwrap_or(burst.sub_band);
        self.sub_channels[sub_channel].pdu_fits_into_sub_channel(request, &burst.phy_mode)
    }

    /// Free bits on the block the burst refers to
    pub fn free_bits_on_sub_channel(&self, burst: &MapInfoEntry) -> Bits {
        self.sub_channels[burst.sub_band].free_bits_on_sub_channel(burst)
    }

    /// Append a compound to a block
    ///
    /// Panics if the subchannel is locked or the block has not enough free time.
    #[allow(clippy::too_many_arguments)]
    pub fn add_compound(
        &mut self,
        sub_channel: usize,
        time_slot: usize,
        spatial_layer: usize,
        duration: SimTime,
        cid: ConnectionId,
        user: UserId,
        compound: Option<CompoundPtr>,
        phy_mode: PhyMode,
        tx_power: Power,
        pattern: Option<Pattern>,
    ) {
        assert!(
            sub_channel < self.number_of_sub_channels,
            "invalid subChannel={}",
            sub_channel
        );
        assert!(
            self.sub_channels[sub_channel].sub_channel_is_usable,
            "subChannel {} is not usable",
            sub_channel
        );
        self.sub_channels[sub_channel]
            .prb_mut(time_slot, spatial_layer)
            .add_compound(duration, cid, user, compound, phy_mode, tx_power, pattern);
        self.number_of_compounds += 1;
    }

    /// Append the compound of a placed request
    ///
    /// The request must carry its subchannel and PHY mode.
    pub fn add_request(
        &mut self,
        request: &RequestForResource,
        compound: Option<CompoundPtr>,
        tx_power: Power,
        pattern: Option<Pattern>,
    ) {
        let sub_channel = match request.sub_channel {
            Some(sc) => sc,
            None => panic!("add_request() without subChannel: {}", request),
        };
        let phy_mode = match request.phy_mode {
            Some(mode) => mode,
            None => panic!("add_request() without PhyMode: {}", request),
        };
        self.add_compound(
            sub_channel,
            request.time_slot,
            request.spatial_layer,
            request.duration(),
            request.cid,
            request.user,
            compound,
            phy_mode,
            tx_power,
            pattern,
        );
    }

    /// Used time of a block
    pub fn next_position(&self, sub_channel: usize, time_slot: usize, spatial_layer: usize) -> SimTime {
        self.prb(sub_channel, time_slot, spatial_layer).next_position()
    }

    /// Used time summed over all blocks
    pub fn used_time(&self) -> SimTime {
        self.sub_channels.iter().map(|sc| sc.used_time()).sum()
    }

    /// Free time summed over all blocks
    pub fn free_time(&self) -> SimTime {
        self.sub_channels.iter().map(|sc| sc.free_time()).sum()
    }

    /// Share of the resources used, always in [0,1]
    ///
    /// Recomputed on every call.
    pub fn resource_usage(&self) -> f64 {
        let total = self.slot_length
            * (self.number_of_sub_channels * self.number_of_time_slots * self.number_of_spatial_layers) as f64;
        if total <= 0.0 {
            return 0.0;
        }
        let usage = self.used_time() / total;
        assert!(usage >= -0.01, "negative resource usage {}", usage);
        usage.clamp(0.0, 1.0)
    }

    /// Power left from `total_power` after subtracting what each subchannel uses
    ///
    /// A subchannel counts with the highest layer-0 power over its time slots.
    /// Returns zero once the budget is exceeded.
    pub fn remaining_power(&self, total_power: Power) -> Power {
        let mut remaining = total_power;
        for sub_channel in &self.sub_channels {
            let used = sub_channel
                .time_slots
                .iter()
                .filter_map(|ts| {
                    let prb = &ts.physical_resources[0];
                    if prb.is_empty() { None } else { prb.tx_power() }
                })
                .fold(Power::zero(), Power::max);
            if used.is_zero() {
                continue;
            }
            if remaining.mw() < used.mw() {
                return Power::zero();
            }
            remaining -= used;
        }
        remaining
    }

    /// Layer-0 power summed over all subchannels of one time slot
    pub fn used_power(&self, time_slot: usize) -> Power {
        self.sub_channels
            .iter()
            .map(|sc| sc.prb(time_slot, 0))
            .filter(|prb| !prb.is_empty())
            .filter_map(|prb| prb.tx_power())
            .fold(Power::zero(), |sum, p| sum + p)
    }

    /// Scale the power of every block in one time slot by `factor`
    pub fn scale_tx_power(&mut self, time_slot: usize, factor: f64) {
        for sub_channel in &mut self.sub_channels {
            for prb in &mut sub_channel.time_slots[time_slot].physical_resources {
                prb.scale_tx_power(factor);
            }
        }
    }

    /// Exclude subchannels from assignment
    pub fn mask_out_sub_channels(&mut self, usable: &[bool]) {
        assert_eq!(
            usable.len(),
            self.number_of_sub_channels,
            "usable vector must cover every subChannel"
        );
        for (sub_channel, &is_usable) in self.sub_channels.iter_mut().zip(usable) {
            sub_channel.sub_channel_is_usable = is_usable;
        }
    }

    /// Flatten into bursts, subchannel-major then time order
    ///
    /// A new burst starts whenever the user changes within a block.
    pub fn to_map_info_collection(&self) -> MapInfoCollection {
        let mut collection = MapInfoCollection::new();
        for prb in self.sub_channels.iter().flat_map(|sc| sc.prbs()) {
            let mut last_user: Option<UserId> = None;
            for compound in prb.compounds() {
                if last_user != Some(compound.user) {
                    let mut burst = MapInfoEntry::new(compound.user, compound.start_time);
                    burst.frame_nr = self.frame_nr;
                    burst.sub_band = compound.sub_channel;
                    burst.time_slot = compound.time_slot;
                    burst.spatial_layer = compound.spatial_layer;
                    burst.tx_power = compound.tx_power;
                    burst.phy_mode = compound.phy_mode;
                    burst.pattern = compound.pattern.clone();
                    collection.push(burst);
                    last_user = Some(compound.user);
                }
                if let Some(burst) = collection.last_mut() {
                    burst.end += compound.duration();
                    if let Some(pdu) = &compound.compound {
                        burst.compounds.push(pdu.clone());
                    }
                }
            }
        }
        collection
    }

    /// Prepare a master's map for the uplink slave
    ///
    /// Every used block becomes a grant to its first user with PHY mode and
    /// power kept; all time is freed.
    pub fn process_master_map(&mut self) {
        let mut removed = 0;
        for sub_channel in &mut self.sub_channels {
            for ts in &mut sub_channel.time_slots {
                for prb in &mut ts.physical_resources {
                    removed += prb.convert_to_grant();
                }
            }
        }
        self.number_of_compounds = 0;
        debug!("processMasterMap(frame={}): {} master compounds turned into grants", self.frame_nr, removed);
    }

    /// Remove all placed compounds
    pub fn delete_compounds(&mut self) {
        for sub_channel in &mut self.sub_channels {
            for ts in &mut sub_channel.time_slots {
                for prb in &mut ts.physical_resources {
                    prb.delete_compounds();
                }
            }
        }
        self.number_of_compounds = 0;
    }

    /// True if nothing is placed
    pub fn is_empty(&self) -> bool {
        self.sub_channels.iter().all(|sc| sc.is_empty())
    }

    /// Check the structural invariants of every block
    ///
    /// Panics on a violation.
    pub fn assert_consistent(&self) {
        let mut counted = 0;
        for prb in self.sub_channels.iter().flat_map(|sc| sc.prbs()) {
            let sum: SimTime = prb.compounds().iter().map(|c| c.duration()).sum();
            assert!(
                (sum - prb.next_position()).abs() < SLOT_LENGTH_ROUNDING_TOLERANCE * 10.0,
                "PRB #{}.{}.{}: compound durations {} != nextPosition {}",
                prb.sub_channel,
                prb.time_slot,
                prb.spatial_layer,
                sum,
                prb.next_position()
            );
            assert!(
                prb.next_position() <= prb.slot_length() + SLOT_LENGTH_ROUNDING_TOLERANCE,
                "PRB #{}.{}.{} overfull",
                prb.sub_channel,
                prb.time_slot,
                prb.spatial_layer
            );
            counted += prb.compounds().len();
        }
        assert_eq!(counted, self.number_of_compounds, "numberOfCompounds mismatch");
    }
}

impl fmt::Display for SchedulingMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SchedulingMap(frame={}: {}x{}x{}x{:.1}us): ",
            self.frame_nr,
            self.number_of_sub_channels,
            self.number_of_time_slots,
            self.number_of_spatial_layers,
            as_micros(self.slot_length)
        )?;
        let usage = self.resource_usage();
        if usage < SLOT_LENGTH_ROUNDING_TOLERANCE {
            return writeln!(f, "empty.");
        }
        writeln!(f, "{:.1}% full.", usage * 100.0)?;
        for sub_channel in self.sub_channels.iter().filter(|sc| !sc.is_empty()) {
            write!(f, "{}", sub_channel)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compound::CompoundFactory;
    use crate::interfaces::PhyModeMapper;
    use crate::phy_mode::TablePhyModeMapper;

    fn mode(index: usize) -> PhyMode {
        TablePhyModeMapper::default().phy_mode_for_index(index)
    }

    #[test]
    fn test_resource_usage_is_recomputed() {
        let mut map = SchedulingMap::new(1e-3, 4, 1, 1, 7);
        assert_eq!(map.resource_usage(), 0.0);
        map.add_compound(0, 0, 0, 1e-3, ConnectionId(1), UserId(1), None, mode(0), Power::zero(), None);
        assert!((map.resource_usage() - 0.25).abs() < 1e-12);
        map.add_compound(1, 0, 0, 0.5e-3, ConnectionId(2), UserId(2), None, mode(0), Power::zero(), None);
        assert!((map.resource_usage() - 0.375).abs() < 1e-12);
        assert_eq!(map.number_of_compounds(), 2);
        map.assert_consistent();
    }

    #[test]
    #[should_panic(expected = "is not usable")]
    fn test_locked_sub_channel_rejects_compounds() {
        let mut map = SchedulingMap::new(1e-3, 2, 1, 1, 0);
        map.mask_out_sub_channels(&[true, false]);
        map.add_compound(1, 0, 0, 1e-4, ConnectionId(1), UserId(1), None, mode(0), Power::zero(), None);
    }

    #[test]
    fn test_map_info_collection_groups_users() {
        let factory = CompoundFactory::new();
        let mut map = SchedulingMap::new(1e-3, 2, 1, 1, 3);
        let m = mode(1);
        let p = Power::from_dbm(10.0);
        for (sc, user, cid) in [(0, 1, 10), (0, 1, 11), (0, 2, 20), (1, 2, 20)] {
            let pdu = factory.create(ConnectionId(cid), 50);
            map.add_compound(sc, 0, 0, m.duration_for(50), ConnectionId(cid), UserId(user), Some(pdu), m, p, None);
        }
        let bursts = map.to_map_info_collection();
        assert_eq!(bursts.len(), 3);
        assert_eq!(bursts[0].user, UserId(1));
        assert_eq!(bursts[0].compounds.len(), 2);
        assert!((bursts[0].end - 0.4e-3).abs() < 1e-12);
        assert_eq!(bursts[1].user, UserId(2));
        assert!((bursts[1].start - 0.4e-3).abs() < 1e-12);
        assert_eq!(bursts[2].sub_band, 1);
        assert_eq!(bursts[2].frame_nr, 3);
        // projection leaves the map untouched
        assert_eq!(map.number_of_compounds(), 4);
        assert!(!map.is_empty());
    }

    #[test]
    fn test_remaining_power() {
        let mut map = SchedulingMap::new(1e-3, 3, 1, 1, 0);
        let total = Power::from_mw(100.0);
        map.add_compound(0, 0, 0, 1e-4, ConnectionId(1), UserId(1), None, mode(0), Power::from_mw(30.0), None);
        map.add_compound(1, 0, 0, 1e-4, ConnectionId(2), UserId(2), None, mode(0), Power::from_mw(50.0), None);
        assert!((map.remaining_power(total).mw() - 20.0).abs() < 1e-9);
        map.add_compound(2, 0, 0, 1e-4, ConnectionId(3), UserId(3), None, mode(0), Power::from_mw(40.0), None);
        assert!(map.remaining_power(total).is_zero());
    }

    #[test]
    fn test_process_master_map() {
        let mut map = SchedulingMap::new(1e-3, 2, 1, 1, 0);
        map.add_compound(1, 0, 0, 1e-3, ConnectionId(5), UserId(9), None, mode(3), Power::from_dbm(3.0), None);
        map.process_master_map();
        assert!(map.is_empty());
        assert_eq!(map.number_of_compounds(), 0);
        assert_eq!(map.prb(1, 0, 0).assigned_user(), Some(UserId(9)));
        assert_eq!(map.prb(0, 0, 0).assigned_user(), None);
        assert!((map.free_time() - 2e-3).abs() < 1e-15);
    }

    #[test]
    fn test_free_bits_and_fit_queries() {
        let mut map = SchedulingMap::new(1e-3, 1, 1, 1, 0);
        let m = mode(1);
        map.add_compound(0, 0, 0, 0.6e-3, ConnectionId(1), UserId(1), None, m, Power::zero(), None);
        let mut burst = MapInfoEntry::new(UserId(1), 0.0);
        burst.phy_mode = m;
        assert_eq!(map.free_bits_on_sub_channel(&burst), 100);
        let mut request = RequestForResource::new(ConnectionId(1), UserId(1), 100);
        request.sub_channel = Some(0);
        assert!(map.pdu_fits_into_sub_channel(&request, &burst));
        request.bits = 101;
        assert!(!map.pdu_fits_into_sub_channel(&request, &burst));

        let mut locked = SchedulingMap::new(1e-3, 2, 1, 1, 0);
        locked.mask_out_sub_channels(&[false, true]);
        request.bits = 10;
        request.sub_channel = Some(0);
        burst.sub_band = 0;
        assert!(!locked.pdu_fits_into_sub_channel(&request, &burst));
        assert_eq!(locked.free_bits_on_sub_channel(&burst), 0);
        request.sub_channel = Some(1);
        burst.sub_band = 1;
        assert!(locked.pdu_fits_into_sub_channel(&request, &burst));
        assert!(locked.free_bits_on_sub_channel(&burst) > 0);
    }
}
