//! PHY modes (modulation and coding schemes)
//!
//! A [`PhyMode`] carries the data rate achieved on one subchannel and the SINR
//! needed to use it. [`TablePhyModeMapper`] is a threshold table implementing
//! [`PhyModeMapper`].

use crate::interfaces::PhyModeMapper;
use crate::{Bits, SchedulerError};
use common::types::Ratio;
use common::utils::SimTime;
use serde::{Deserialize, Serialize};
use std::fmt;

/// One modulation and coding scheme
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PhyMode {
    /// Position in the mapper table, 0 = most robust
    pub index: usize,
    /// Bits per second on one subchannel
    pub data_rate: f64,
    /// Minimum SINR needed to decode
    pub min_sinr: Ratio,
}

impl PhyMode {
    /// Mode returned when no mode is usable
    pub fn invalid() -> Self {
        Self { index: usize::MAX, data_rate: 0.0, min_sinr: Ratio::from_factor(f64::INFINITY) }
    }

    /// True if this mode can carry data
    pub fn is_valid(&self) -> bool {
        self.data_rate > 0.0 && self.index != usize::MAX
    }

    /// Bits that fit into `duration` (fractional)
    pub fn bit_capacity_fractional(&self, duration: SimTime) -> f64 {
        self.data_rate * duration
    }

    /// Transmission time of `bits`
    pub fn duration_for(&self, bits: Bits) -> SimTime {
        assert!(self.is_valid(), "duration_for() needs a valid PhyMode");
        bits as f64 / self.data_rate
    }
}

impl fmt::Display for PhyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "PhyMode#{}({:.0} bit/s, >= {})", self.index, self.data_rate, self.min_sinr)
        } else {
            write!(f, "PhyMode(invalid)")
        }
    }
}

/// One row of the PHY mode table as configured
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PhyModeEntry {
    /// Bits per second on one subchannel
    pub data_rate: f64,
    /// Switching threshold in dB
    pub min_sinr_db: f64,
}

/// Default table: BPSK 1/2 up to 64-QAM 3/4 on a 250 ksymbol/s subchannel
pub fn default_phy_mode_table() -> Vec<PhyModeEntry> {
    [
        (125e3, 1.0),
        (250e3, 4.0),
        (375e3, 7.0),
        (500e3, 10.5),
        (750e3, 14.0),
        (1000e3, 18.0),
        (1125e3, 21.0),
    ]
    .iter()
    .map(|&(data_rate, min_sinr_db)| PhyModeEntry { data_rate, min_sinr_db })
    .collect()
}

/// Threshold-table PHY mode mapper
#[derive(Debug, Clone)]
pub struct TablePhyModeMapper {
    modes: Vec<PhyMode>,
}

impl TablePhyModeMapper {
    /// Build from table rows
    ///
    /// Rows must have strictly increasing thresholds and rates.
    pub fn new(entries: &[PhyModeEntry]) -> Result<Self, SchedulerError> {
        if entries.is_empty() {
            return Err(SchedulerError::InvalidConfiguration("empty PHY mode table".to_string()));
        }
        for pair in entries.windows(2) {
            if pair[1].min_sinr_db <= pair[0].min_sinr_db || pair[1].data_rate <= pair[0].data_rate {
                return Err(SchedulerError::InvalidConfiguration(format!(
                    "PHY mode table not monotonic at {} dB",
                    pair[1].min_sinr_db
                )));
            }
        }
        if entries[0].data_rate <= 0.0 {
            return Err(SchedulerError::InvalidConfiguration("PHY mode data rate must be positive".to_string()));
        }
        let modes = entries
            .iter()
            .enumerate()
            .map(|(index, e)| PhyMode { index, data_rate: e.data_rate, min_sinr: Ratio::from_db(e.min_sinr_db) })
            .collect();
        Ok(Self { modes })
    }
}

impl Default for TablePhyModeMapper {
    fn default() -> Self {
        let modes = default_phy_mode_table()
            .iter()
            .enumerate()
            .map(|(index, e)| PhyMode { index, data_rate: e.data_rate, min_sinr: Ratio::from_db(e.min_sinr_db) })
            .collect();
        Self { modes }
    }
}

impl PhyModeMapper for TablePhyModeMapper {
    fn best_phy_mode(&self, sinr: Ratio) -> PhyMode {
        self.modes
            .iter()
            .rev()
            .find(|m| m.min_sinr.factor() <= sinr.factor())
            .copied()
            .unwrap_or_else(PhyMode::invalid)
    }

    fn sinr_is_above_limit(&self, sinr: Ratio) -> bool {
        sinr.factor() >= self.modes[0].min_sinr.factor()
    }

    fn min_sinr_ratio(&self, phy_mode: &PhyMode) -> Ratio {
        assert!(phy_mode.is_valid(), "min_sinr_ratio() of an invalid PhyMode");
        self.modes[phy_mode.index].min_sinr
    }

    fn highest_phy_mode(&self) -> PhyMode {
        self.modes[self.modes.len() - 1]
    }

    fn lowest_phy_mode(&self) -> PhyMode {
        self.modes[0]
    }

    fn phy_mode_count(&self) -> usize {
        self.modes.len()
    }

    fn phy_mode_for_index(&self, index: usize) -> PhyMode {
        assert!(index < self.modes.len(), "PhyMode index {} out of range", index);
        self.modes[index]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_best_phy_mode_thresholds() {
        let mapper = TablePhyModeMapper::default();
        assert!(!mapper.best_phy_mode(Ratio::from_db(0.0)).is_valid());
        assert_eq!(mapper.best_phy_mode(Ratio::from_db(1.0)).index, 0);
        assert_eq!(mapper.best_phy_mode(Ratio::from_db(11.0)).index, 3);
        assert_eq!(mapper.best_phy_mode(Ratio::from_db(40.0)), mapper.highest_phy_mode());
    }

    #[test]
    fn test_sinr_limit() {
        let mapper = TablePhyModeMapper::default();
        assert!(mapper.sinr_is_above_limit(Ratio::from_db(1.5)));
        assert!(!mapper.sinr_is_above_limit(Ratio::from_db(0.5)));
    }

    #[test]
    fn test_table_must_be_monotonic() {
        let rows = [
            PhyModeEntry { data_rate: 1e5, min_sinr_db: 3.0 },
            PhyModeEntry { data_rate: 2e5, min_sinr_db: 2.0 },
        ];
        assert!(matches!(TablePhyModeMapper::new(&rows), Err(SchedulerError::InvalidConfiguration(_))));
    }

    #[test]
    fn test_duration_for_bits() {
        let mode = TablePhyModeMapper::default().phy_mode_for_index(1);
        assert!((mode.duration_for(250) - 1e-3).abs() < 1e-15);
        assert!((mode.bit_capacity_fractional(2e-3) - 500.0).abs() < 1e-9);
    }
}
