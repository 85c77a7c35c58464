//! Physical resource blocks
//!
//! One [`PhysicalResourceBlock`] is a (subchannel, time slot, spatial layer)
//! slot. Compounds are appended back to back; the block tracks how much of
//! the slot is used and which PHY mode and power its compounds share.

use crate::compound::CompoundPtr;
use crate::phy_mode::PhyMode;
use crate::types::{Bits, Pattern};
use crate::SLOT_LENGTH_ROUNDING_TOLERANCE;
use common::types::{ConnectionId, Power, UserId};
use common::utils::{time::as_micros, SimTime};
use std::fmt;
use tracing::trace;

/// One transmission unit placed into a resource block
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulingCompound {
    /// Subchannel index
    pub sub_channel: usize,
    /// Time slot index
    pub time_slot: usize,
    /// Spatial layer (beam)
    pub spatial_layer: usize,
    /// Start relative to the slot start
    pub start_time: SimTime,
    /// End relative to the slot start
    pub end_time: SimTime,
    /// Connection
    pub cid: ConnectionId,
    /// User
    pub user: UserId,
    /// Placed PDU; `None` for resources reserved without data
    pub compound: Option<CompoundPtr>,
    /// Modulation and coding
    pub phy_mode: PhyMode,
    /// Transmit power
    pub tx_power: Power,
    /// Beamforming pattern
    pub pattern: Option<Pattern>,
}

impl SchedulingCompound {
    /// Air time of this compound
    pub fn duration(&self) -> SimTime {
        self.end_time - self.start_time
    }
}

impl fmt::Display for SchedulingCompound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SchedulingCompound({}, {}", self.cid, self.user)?;
        if let Some(compound) = &self.compound {
            write!(f, ", bits={}", compound.bits)?;
        }
        write!(
            f,
            ", T=[{:.1}-{:.1}]us, d={:.1}us)",
            as_micros(self.start_time),
            as_micros(self.end_time),
            as_micros(self.duration())
        )
    }
}

/// One (subchannel, time slot, spatial layer) resource
#[derive(Debug, Clone)]
pub struct PhysicalResourceBlock {
    /// Subchannel index
    pub sub_channel: usize,
    /// Time slot index
    pub time_slot: usize,
    /// Spatial layer index
    pub spatial_layer: usize,
    /// Length of the slot
    slot_length: SimTime,
    /// Time used so far
    next_position: SimTime,
    /// PHY mode shared by all compounds
    phy_mode: Option<PhyMode>,
    /// Power shared by all compounds
    tx_power: Option<Power>,
    /// Antenna pattern of the last placement
    pattern: Option<Pattern>,
    /// User the master granted this block to (uplink slave maps only)
    assigned_user: Option<UserId>,
    /// Compounds in time order
    scheduled_compounds: Vec<SchedulingCompound>,
}

impl PhysicalResourceBlock {
    /// Create an empty block
    pub fn new(sub_channel: usize, time_slot: usize, spatial_layer: usize, slot_length: SimTime) -> Self {
        Self {
            sub_channel,
            time_slot,
            spatial_layer,
            slot_length,
            next_position: 0.0,
            phy_mode: None,
            tx_power: None,
            pattern: None,
            assigned_user: None,
            scheduled_compounds: Vec::new(),
        }
    }

    /// Length of the slot
    pub fn slot_length(&self) -> SimTime {
        self.slot_length
    }

    /// Time used so far
    pub fn used_time(&self) -> SimTime {
        self.next_position
    }

    /// Start time of the next appended compound
    pub fn next_position(&self) -> SimTime {
        self.next_position
    }

    /// Time still free
    pub fn free_time(&self) -> SimTime {
        self.slot_length - self.next_position
    }

    /// True if nothing is placed
    pub fn is_empty(&self) -> bool {
        self.scheduled_compounds.is_empty()
    }

    /// PHY mode fixed by earlier placements or the master
    pub fn phy_mode(&self) -> Option<PhyMode> {
        self.phy_mode
    }

    /// Power fixed by earlier placements or the master
    pub fn tx_power(&self) -> Option<Power> {
        self.tx_power
    }

    /// Antenna pattern of the placements
    pub fn pattern(&self) -> Option<&Pattern> {
        self.pattern.as_ref()
    }

    /// User of the first compound
    pub fn first_user(&self) -> Option<UserId> {
        self.scheduled_compounds.first().map(|c| c.user)
    }

    /// User the master granted this block to
    pub fn assigned_user(&self) -> Option<UserId> {
        self.assigned_user
    }

    /// Placed compounds in time order
    pub fn compounds(&self) -> &[SchedulingCompound] {
        &self.scheduled_compounds
    }

    /// Check whether `bits` at `phy_mode` fit into the free time
    pub fn pdu_fits(&self, bits: Bits, phy_mode: &PhyMode) -> bool {
        self.assert_phy_mode_matches(phy_mode);
        let end_time = self.next_position + bits as f64 / phy_mode.data_rate;
        end_time <= self.slot_length + SLOT_LENGTH_ROUNDING_TOLERANCE
    }

    /// Number of bits that still fit at `phy_mode`
    pub fn free_bits(&self, phy_mode: &PhyMode) -> Bits {
        self.assert_phy_mode_matches(phy_mode);
        let bits = (self.free_time() + SLOT_LENGTH_ROUNDING_TOLERANCE) * phy_mode.data_rate;
        bits.max(0.0).floor() as Bits
    }

    fn assert_phy_mode_matches(&self, phy_mode: &PhyMode) {
        assert!(phy_mode.is_valid(), "need a valid PhyMode");
        if let (false, Some(fixed)) = (self.is_empty(), self.phy_mode) {
            assert!(
                fixed == *phy_mode,
                "all PhyModes must match on a used PhysicalResourceBlock: {} != {}",
                fixed,
                phy_mode
            );
        }
    }

    /// Append a compound of `duration` at the current end
    ///
    /// Panics if the compound does not fit or its PHY mode or power differs
    /// from the compounds already placed.
    #[allow(clippy::too_many_arguments)]
    pub fn add_compound(
        &mut self,
        duration: SimTime,
        cid: ConnectionId,
        user: UserId,
        compound: Option<CompoundPtr>,
        phy_mode: PhyMode,
        tx_power: Power,
        pattern: Option<Pattern>,
    ) -> &SchedulingCompound {
        assert!(duration > 0.0, "compound duration must be positive, got {}", duration);
        let start_time = self.next_position;
        let end_time = start_time + duration;
        assert!(
            end_time <= self.slot_length + SLOT_LENGTH_ROUNDING_TOLERANCE,
            "end time of the compound={} exceeds slotLength={} on PRB #{}.{}.{}",
            end_time,
            self.slot_length,
            self.sub_channel,
            self.time_slot,
            self.spatial_layer
        );
        if !self.is_empty() {
            assert!(
                self.tx_power == Some(tx_power),
                "txPower mismatch on PRB #{}.{}.{}: {:?} != {}",
                self.sub_channel,
                self.time_slot,
                self.spatial_layer,
                self.tx_power,
                tx_power
            );
            assert!(
                self.phy_mode == Some(phy_mode),
                "PhyMode mismatch on PRB #{}.{}.{}",
                self.sub_channel,
                self.time_slot,
                self.spatial_layer
            );
        }
        self.tx_power = Some(tx_power);
        self.phy_mode = Some(phy_mode);
        self.pattern = pattern.clone();
        self.next_position = end_time;
        trace!(
            "PRB #{}.{}.{}: {} placed [{:.1}-{:.1}]us",
            self.sub_channel,
            self.time_slot,
            self.spatial_layer,
            cid,
            as_micros(start_time),
            as_micros(end_time)
        );
        self.scheduled_compounds.push(SchedulingCompound {
            sub_channel: self.sub_channel,
            time_slot: self.time_slot,
            spatial_layer: self.spatial_layer,
            start_time,
            end_time,
            cid,
            user,
            compound,
            phy_mode,
            tx_power,
            pattern,
        });
        &self.scheduled_compounds[self.scheduled_compounds.len() - 1]
    }

    /// Remove all compounds, keeping any master assignment
    pub fn delete_compounds(&mut self) {
        self.scheduled_compounds.clear();
        self.next_position = 0.0;
        if self.assigned_user.is_none() {
            self.phy_mode = None;
            self.tx_power = None;
            self.pattern = None;
        }
    }

    /// Turn the placements of a master map into a grant for the slave
    ///
    /// Keeps user, PHY mode and power of the first compound and frees the time.
    /// Returns the number of compounds removed.
    pub fn convert_to_grant(&mut self) -> usize {
        let removed = self.scheduled_compounds.len();
        self.assigned_user = self.first_user();
        self.scheduled_compounds.clear();
        self.next_position = 0.0;
        if self.assigned_user.is_none() {
            self.phy_mode = None;
            self.tx_power = None;
        }
        removed
    }

    /// Scale the power of the block and every compound by `factor`
    pub fn scale_tx_power(&mut self, factor: f64) {
        self.tx_power = self.tx_power.map(|p| p * factor);
        for compound in &mut self.scheduled_compounds {
            compound.tx_power = compound.tx_power * factor;
        }
    }

    /// Grant this block to `user` with fixed PHY mode and power
    pub fn grant(&mut self, user: UserId, phy_mode: PhyMode, tx_power: Power) {
        assert!(self.is_empty(), "grant() on a used PRB #{}.{}.{}", self.sub_channel, self.time_slot, self.spatial_layer);
        self.assigned_user = Some(user);
        self.phy_mode = Some(phy_mode);
        self.tx_power = Some(tx_power);
    }
}

impl fmt::Display for PhysicalResourceBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PRB(#{}.{}.{}", self.sub_channel, self.time_slot, self.spatial_layer)?;
        if self.is_empty() {
            return writeln!(f, ", unused)");
        }
        writeln!(
            f,
            ", nextPos={:.1}us, used={:.1}%, compounds={}):",
            as_micros(self.next_position),
            100.0 * self.next_position / self.slot_length,
            self.scheduled_compounds.len()
        )?;
        for compound in &self.scheduled_compounds {
            writeln!(f, "  {}", compound)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phy_mode::TablePhyModeMapper;
    use crate::interfaces::PhyModeMapper;

    fn mode(index: usize) -> PhyMode {
        TablePhyModeMapper::default().phy_mode_for_index(index)
    }

    #[test]
    fn test_add_compound_advances_position() {
        let mut prb = PhysicalResourceBlock::new(0, 0, 0, 1e-3);
        let m = mode(1); // 250 kbit/s
        prb.add_compound(0.4e-3, ConnectionId(1), UserId(1), None, m, Power::from_dbm(10.0), None);
        prb.add_compound(0.4e-3, ConnectionId(1), UserId(1), None, m, Power::from_dbm(10.0), None);
        assert!((prb.used_time() - 0.8e-3).abs() < 1e-15);
        assert_eq!(prb.compounds().len(), 2);
        assert!((prb.compounds()[1].start_time - 0.4e-3).abs() < 1e-15);
        assert_eq!(prb.first_user(), Some(UserId(1)));
        assert_eq!(prb.free_bits(&m), 50);
        assert!(prb.pdu_fits(50, &m));
        assert!(!prb.pdu_fits(51, &m));
    }

    #[test]
    fn test_exact_fit_within_tolerance() {
        let mut prb = PhysicalResourceBlock::new(0, 0, 0, 1e-3);
        let m = mode(0);
        // three thirds do not add up exactly to the slot length
        for _ in 0..3 {
            prb.add_compound(1e-3 / 3.0, ConnectionId(1), UserId(1), None, m, Power::zero(), None);
        }
        assert!(prb.free_time().abs() < 1e-12);
    }

    #[test]
    #[should_panic(expected = "exceeds slotLength")]
    fn test_overfull_block_panics() {
        let mut prb = PhysicalResourceBlock::new(0, 0, 0, 1e-3);
        prb.add_compound(0.8e-3, ConnectionId(1), UserId(1), None, mode(0), Power::zero(), None);
        prb.add_compound(0.3e-3, ConnectionId(1), UserId(1), None, mode(0), Power::zero(), None);
    }

    #[test]
    #[should_panic(expected = "txPower mismatch")]
    fn test_power_must_be_uniform() {
        let mut prb = PhysicalResourceBlock::new(0, 0, 0, 1e-3);
        prb.add_compound(0.1e-3, ConnectionId(1), UserId(1), None, mode(0), Power::from_dbm(1.0), None);
        prb.add_compound(0.1e-3, ConnectionId(1), UserId(1), None, mode(0), Power::from_dbm(2.0), None);
    }

    #[test]
    fn test_convert_to_grant_keeps_user_and_mode() {
        let mut prb = PhysicalResourceBlock::new(2, 0, 0, 1e-3);
        prb.add_compound(0.5e-3, ConnectionId(7), UserId(3), None, mode(2), Power::from_dbm(5.0), None);
        assert_eq!(prb.convert_to_grant(), 1);
        assert!(prb.is_empty());
        assert_eq!(prb.assigned_user(), Some(UserId(3)));
        assert_eq!(prb.phy_mode(), Some(mode(2)));
        assert_eq!(prb.used_time(), 0.0);
    }
}
