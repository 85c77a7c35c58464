//! No power control: always the maximum power per subchannel

use super::{channel_of, power_capabilities_for, scale_down_to_budget, ApcResult, ApcStrategy};
use crate::interfaces::Registry;
use crate::map::SchedulingMap;
use crate::strategy::SchedulerState;
use crate::types::RequestForResource;
use std::rc::Rc;
use tracing::trace;

/// Transmit with the maximum power and pick the best mode for it
pub struct UseMaxTxPower {
    registry: Rc<dyn Registry>,
}

impl UseMaxTxPower {
    /// Create the strategy
    pub fn new(registry: Rc<dyn Registry>) -> Self {
        Self { registry }
    }
}

impl ApcStrategy for UseMaxTxPower {
    fn name(&self) -> &'static str {
        "UseMaxTxPower"
    }

    fn do_adaptive_power_control(
        &mut self,
        request: &RequestForResource,
        state: &SchedulerState,
        _map: &SchedulingMap,
    ) -> ApcResult {
        let channel = channel_of(request);
        let capabilities = power_capabilities_for(self.registry.as_ref(), state, request.user);
        let mut result = ApcResult::with_power(capabilities.max_per_subband, &channel);
        result.phy_mode = match state.default_phy_mode {
            Some(mode) => mode,
            None => self.registry.phy_mode_mapper().best_phy_mode(result.sinr),
        };
        trace!("UseMaxTxPower: {} P={} SINR={} {}", request, result.tx_power, result.sinr, result.phy_mode);
        result
    }

    /// Reduce the power of time slots exceeding the overall limit
    fn post_process(&mut self, state: &SchedulerState, map: &mut SchedulingMap) {
        scale_down_to_budget(map, state.power_capabilities.max_overall);
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::strategy::state::test_support::dl_state;

    #[test]
    fn test_max_power_and_best_mode() {
        let state = dl_state(1, 1e-3, 1);
        let map = SchedulingMap::new(1e-3, 1, 1, 1, 0);
        let mut apc = UseMaxTxPower::new(registry());
        // 30 dBm - 100 dB + 100 dBm = 30 dB SINR
        let result = apc.do_adaptive_power_control(&placed_request(100.0), &state, &map);
        assert!((result.tx_power.dbm() - 30.0).abs() < 1e-9);
        assert!((result.sinr.db() - 30.0).abs() < 1e-9);
        assert_eq!(result.phy_mode.index, 6);
        assert!((result.estimated_cand_i.c.dbm() + 70.0).abs() < 1e-9);
    }

    #[test]
    fn test_default_phy_mode_wins() {
        let mut state = dl_state(1, 1e-3, 1);
        let mapper = crate::phy_mode::TablePhyModeMapper::default();
        state.default_phy_mode = Some(crate::interfaces::PhyModeMapper::lowest_phy_mode(&mapper));
        let map = SchedulingMap::new(1e-3, 1, 1, 1, 0);
        let result = UseMaxTxPower::new(registry()).do_adaptive_power_control(&placed_request(100.0), &state, &map);
        assert_eq!(result.phy_mode.index, 0);
    }
}
