//! Subchannels and time slots of a scheduling map

use super::resource_block::PhysicalResourceBlock;
use crate::phy_mode::PhyMode;
use crate::types::{Bits, MapInfoEntry, RequestForResource};
use common::utils::SimTime;
use std::fmt;

/// One time slot of a subchannel, holding one block per spatial layer
#[derive(Debug, Clone)]
pub struct SchedulingTimeSlot {
    /// Subchannel index
    pub sub_channel: usize,
    /// Time slot index
    pub time_slot: usize,
    /// One block per spatial layer
    pub physical_resources: Vec<PhysicalResourceBlock>,
}

impl SchedulingTimeSlot {
    /// Create an empty time slot
    pub fn new(sub_channel: usize, time_slot: usize, spatial_layers: usize, slot_length: SimTime) -> Self {
        let physical_resources = (0..spatial_layers)
            .map(|layer| PhysicalResourceBlock::new(sub_channel, time_slot, layer, slot_length))
            .collect();
        Self { sub_channel, time_slot, physical_resources }
    }

    /// Used time summed over all layers
    pub fn used_time(&self) -> SimTime {
        self.physical_resources.iter().map(|prb| prb.used_time()).sum()
    }

    /// Free time summed over all layers
    pub fn free_time(&self) -> SimTime {
        self.physical_resources.iter().map(|prb| prb.free_time()).sum()
    }

    /// True if no layer carries anything
    pub fn is_empty(&self) -> bool {
        self.physical_resources.iter().all(|prb| prb.is_empty())
    }

    /// Number of placed compounds over all layers
    pub fn number_of_compounds(&self) -> usize {
        self.physical_resources.iter().map(|prb| prb.compounds().len()).sum()
    }
}

/// One frequency resource over the whole frame
#[derive(Debug, Clone)]
pub struct SchedulingSubChannel {
    /// Subchannel index
    pub sub_channel: usize,
    /// Time slots in time order
    pub time_slots: Vec<SchedulingTimeSlot>,
    /// False if the subchannel is excluded from assignment
    pub sub_channel_is_usable: bool,
}

impl SchedulingSubChannel {
    /// Create an empty, usable subchannel
    pub fn new(sub_channel: usize, time_slots: usize, spatial_layers: usize, slot_length: SimTime) -> Self {
        let time_slots = (0..time_slots)
            .map(|ts| SchedulingTimeSlot::new(sub_channel, ts, spatial_layers, slot_length))
            .collect();
        Self { sub_channel, time_slots, sub_channel_is_usable: true }
    }

    /// Block at (`time_slot`, `spatial_layer`)
    pub fn prb(&self, time_slot: usize, spatial_layer: usize) -> &PhysicalResourceBlock {
        &self.time_slots[time_slot].physical_resources[spatial_layer]
    }

    /// Mutable block at (`time_slot`, `spatial_layer`)
    pub fn prb_mut(&mut self, time_slot: usize, spatial_layer: usize) -> &mut PhysicalResourceBlock {
        &mut self.time_slots[time_slot].physical_resources[spatial_layer]
    }

    /// All blocks of all time slots
    pub fn prbs(&self) -> impl Iterator<Item = &PhysicalResourceBlock> {
        self.time_slots.iter().flat_map(|ts| ts.physical_resources.iter())
    }

    /// Used time over all time slots and layers
    pub fn used_time(&self) -> SimTime {
        self.time_slots.iter().map(|ts| ts.used_time()).sum()
    }

    /// Free time over all time slots and layers
    pub fn free_time(&self) -> SimTime {
        self.time_slots.iter().map(|ts| ts.free_time()).sum()
    }

    /// True if nothing is placed on this subchannel
    pub fn is_empty(&self) -> bool {
        self.time_slots.iter().all(|ts| ts.is_empty())
    }

    /// Check whether the request fits into its proposed block at `phy_mode`
    pub fn pdu_fits_into_sub_channel(&self, request: &RequestForResource, phy_mode: &PhyMode) -> bool {
        if !self.sub_channel_is_usable {
            return false;
        }
        self.prb(request.time_slot, request.spatial_layer)
            .pdu_fits(request.bits, phy_mode)
    }

    /// Free bits on the block the burst refers to
    pub fn free_bits_on_sub_channel(&self, burst: &MapInfoEntry) -> Bits {
        if !self.sub_channel_is_usable {
            return 0;
        }
        self.prb(burst.time_slot, burst.spatial_layer)
            .free_bits(&burst.phy_mode)
    }
}

impl fmt::Display for SchedulingSubChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SubChannel #{}", self.sub_channel)?;
        if !self.sub_channel_is_usable {
            write!(f, " (locked)")?;
        }
        writeln!(f, ":")?;
        for prb in self.prbs().filter(|prb| !prb.is_empty()) {
            write!(f, "  {}", prb)?;
        }
        Ok(())
    }
}
