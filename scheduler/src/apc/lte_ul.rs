//! Open-loop uplink power control
//!
//! The transmit power compensates a fraction `alpha` of the pathloss on top of
//! the nominal power `p0`. The PHY mode is chosen with a safety margin below
//! the expected SINR and never below a configured minimum.

use super::{channel_of, ApcResult, ApcStrategy};
use crate::interfaces::Registry;
use crate::map::SchedulingMap;
use crate::strategy::SchedulerState;
use crate::types::RequestForResource;
use crate::SchedulerError;
use common::types::{Power, Ratio};
use std::rc::Rc;
use tracing::{debug, trace};

/// Fractional pathloss compensation `P = P0 + alpha * PL`
pub struct LteUl {
    registry: Rc<dyn Registry>,
    p0: Power,
    alpha: f64,
    sinr_margin: Ratio,
    minimum_phy_mode: usize,
}

impl LteUl {
    /// Create the strategy
    ///
    /// `minimum_phy_mode` must be an index of the mapper's table.
    pub fn new(
        registry: Rc<dyn Registry>,
        p0: Power,
        alpha: f64,
        sinr_margin: Ratio,
        minimum_phy_mode: usize,
    ) -> Result<Self, SchedulerError> {
        let count = registry.phy_mode_mapper().phy_mode_count();
        if minimum_phy_mode >= count {
            return Err(SchedulerError::InvalidConfiguration(format!(
                "minimum PhyMode {} too high, maximum is {}",
                minimum_phy_mode,
                count - 1
            )));
        }
        if !(0.0..=1.0).contains(&alpha) {
            return Err(SchedulerError::InvalidConfiguration(format!("alpha {} outside [0,1]", alpha)));
        }
        Ok(Self { registry, p0, alpha, sinr_margin, minimum_phy_mode })
    }
}

impl ApcStrategy for LteUl {
    fn name(&self) -> &'static str {
        "LTE_UL"
    }

    fn do_adaptive_power_control(
        &mut self,
        request: &RequestForResource,
        state: &SchedulerState,
        _map: &SchedulingMap,
    ) -> ApcResult {
        let channel = channel_of(request);
        let tx_power = state
            .default_tx_power
            .unwrap_or_else(|| self.p0 * Ratio::from_db(channel.pathloss.db() * self.alpha));
        let mut result = ApcResult::with_power(tx_power, &channel);

        let mapper = self.registry.phy_mode_mapper();
        result.phy_mode = match state.default_phy_mode {
            Some(mode) => mode,
            None => {
                let mode = mapper.best_phy_mode(result.sinr - self.sinr_margin);
                if !mode.is_valid() || mode.index < self.minimum_phy_mode {
                    debug!("LTE_UL: {} below minimum PhyMode, raising to #{}", request, self.minimum_phy_mode);
                    mapper.phy_mode_for_index(self.minimum_phy_mode)
                } else {
                    mode
                }
            }
        };
        trace!("LTE_UL: {} PL={} P={} SINR={} {}", request, channel.pathloss, tx_power, result.sinr, result.phy_mode);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::strategy::state::test_support::state_for;
    use crate::types::SchedulerSpot;

    fn lte_ul(minimum: usize) -> LteUl {
        LteUl::new(registry(), Power::from_dbm(-80.0), 0.8, Ratio::from_db(3.0), minimum).unwrap()
    }

    #[test]
    fn test_fractional_compensation() {
        let state = state_for(SchedulerSpot::UlMaster, 1, 1e-3, 1);
        let map = SchedulingMap::new(1e-3, 1, 1, 1, 0);
        // -80 dBm + 0.8 * 100 dB = 0 dBm; SINR = 0 - 100 + 100 = 0 dB
        let result = lte_ul(0).do_adaptive_power_control(&placed_request(100.0), &state, &map);
        assert!(result.tx_power.dbm().abs() < 1e-9);
        assert!(result.sinr.db().abs() < 1e-9);
        // far below every threshold, raised to the minimum mode
        assert_eq!(result.phy_mode.index, 0);

        // 60 dB: -32 dBm, SINR 8 dB, minus 3 dB margin -> 5 dB -> mode 1
        let result = lte_ul(0).do_adaptive_power_control(&placed_request(60.0), &state, &map);
        assert_eq!(result.phy_mode.index, 1);
        let result = lte_ul(2).do_adaptive_power_control(&placed_request(60.0), &state, &map);
        assert_eq!(result.phy_mode.index, 2);
    }

    #[test]
    fn test_minimum_mode_validated() {
        assert!(matches!(
            LteUl::new(registry(), Power::from_dbm(-80.0), 0.8, Ratio::from_db(3.0), 7),
            Err(SchedulerError::InvalidConfiguration(_))
        ));
    }
}
