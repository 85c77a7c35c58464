//! Power control towards a common target SINR

use super::{channel_of, power_capabilities_for, ApcResult, ApcStrategy};
use crate::interfaces::Registry;
use crate::map::SchedulingMap;
use crate::strategy::SchedulerState;
use crate::types::RequestForResource;
use common::types::Ratio;
use std::rc::Rc;
use tracing::trace;

/// Give every user the power needed for the same SINR
///
/// Separate targets apply when transmitting (downlink) and when receiving
/// (uplink). The power is capped by the subchannel maximum and by what is
/// left of the overall budget.
pub struct FairSinr {
    registry: Rc<dyn Registry>,
    target_dl: Ratio,
    target_ul: Ratio,
}

impl FairSinr {
    /// Create the strategy with both targets in dB
    pub fn new(registry: Rc<dyn Registry>, fair_sinr_dl_db: f64, fair_sinr_ul_db: f64) -> Self {
        Self { registry, target_dl: Ratio::from_db(fair_sinr_dl_db), target_ul: Ratio::from_db(fair_sinr_ul_db) }
    }
}

impl ApcStrategy for FairSinr {
    fn name(&self) -> &'static str {
        "FairSINR"
    }

    fn do_adaptive_power_control(
        &mut self,
        request: &RequestForResource,
        state: &SchedulerState,
        map: &SchedulingMap,
    ) -> ApcResult {
        let channel = channel_of(request);
        let mapper = self.registry.phy_mode_mapper();
        if let Some(tx_power) = state.default_tx_power {
            let mut result = ApcResult::with_power(tx_power, &channel);
            result.phy_mode = state.default_phy_mode.unwrap_or_else(|| mapper.best_phy_mode(result.sinr));
            return result;
        }

        let target = if state.is_tx { self.target_dl } else { self.target_ul };
        let fair_tx_power = channel.interference * channel.pathloss * target;
        let capabilities = power_capabilities_for(self.registry.as_ref(), state, request.user);
        let remaining = map.remaining_power(capabilities.max_overall);
        if remaining.is_zero() {
            return ApcResult::unservable(&channel);
        }

        let tx_power = fair_tx_power.min(capabilities.max_per_subband).min(remaining);
        let mut result = ApcResult::with_power(tx_power, &channel);
        if tx_power == fair_tx_power {
            result.sinr = target;
        }
        result.phy_mode = mapper.best_phy_mode(result.sinr);
        trace!("FairSINR: {} target={} P={} {}", request, target, tx_power, result.phy_mode);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::strategy::state::test_support::{dl_state, state_for};
    use crate::types::SchedulerSpot;

    #[test]
    fn test_reaches_target() {
        let state = dl_state(1, 1e-3, 1);
        let map = SchedulingMap::new(1e-3, 1, 1, 1, 0);
        let mut apc = FairSinr::new(registry(), 12.0, 6.0);
        let result = apc.do_adaptive_power_control(&placed_request(100.0), &state, &map);
        assert!((result.tx_power.dbm() - 12.0).abs() < 1e-9);
        assert!((result.sinr.db() - 12.0).abs() < 1e-12);
        assert_eq!(result.phy_mode.index, 3);
    }

    #[test]
    fn test_uplink_target_and_cap() {
        let state = state_for(SchedulerSpot::UlMaster, 1, 1e-3, 1);
        let map = SchedulingMap::new(1e-3, 1, 1, 1, 0);
        let mut apc = FairSinr::new(registry(), 12.0, 6.0);
        let result = apc.do_adaptive_power_control(&placed_request(100.0), &state, &map);
        assert!((result.sinr.db() - 6.0).abs() < 1e-9);

        // 30 dB target needs 30 dBm, the terminal only has 20 dBm per subchannel
        let mut apc = FairSinr::new(registry(), 30.0, 30.0);
        let result = apc.do_adaptive_power_control(&placed_request(100.0), &state, &map);
        assert!((result.tx_power.dbm() - 20.0).abs() < 1e-9);
        assert!((result.sinr.db() - 20.0).abs() < 1e-9);
    }
}
