//! First come, first served: the best mode the remaining power allows, at minimum power

use super::{channel_of, power_capabilities_for, ApcResult, ApcStrategy};
use crate::interfaces::Registry;
use crate::map::SchedulingMap;
use crate::strategy::SchedulerState;
use crate::types::RequestForResource;
use std::rc::Rc;
use tracing::trace;

/// Highest PHY mode reachable with the power still unused in this frame
///
/// The power is then lowered to the minimum the chosen mode needs, leaving
/// the rest to later requests.
pub struct FcfsMaxPhyMode {
    registry: Rc<dyn Registry>,
}

impl FcfsMaxPhyMode {
    /// Create the strategy
    pub fn new(registry: Rc<dyn Registry>) -> Self {
        Self { registry }
    }
}

impl ApcStrategy for FcfsMaxPhyMode {
    fn name(&self) -> &'static str {
        "FCFSMaxPhyMode"
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

        let capabilities = power_capabilities_for(self.registry.as_ref(), state, request.user);
        let remaining = map.remaining_power(capabilities.max_overall);
        if remaining.is_zero() {
            trace!("FCFSMaxPhyMode: no power left for {}", request);
            return ApcResult::unservable(&channel);
        }
        let max_tx_power = capabilities.max_per_subband.min(remaining);
        let phy_mode = mapper.best_phy_mode(channel.sinr_for(max_tx_power));
        if !phy_mode.is_valid() {
            trace!("FCFSMaxPhyMode: {} below the most robust mode", request);
            return ApcResult::unservable(&channel);
        }
        let min_sinr = mapper.min_sinr_ratio(&phy_mode);
        let tx_power = channel.interference * channel.pathloss * min_sinr;
        let mut result = ApcResult::with_power(tx_power, &channel);
        result.phy_mode = phy_mode;
        result.sinr = min_sinr;
        trace!("FCFSMaxPhyMode: {} P={} {}", request, tx_power, phy_mode);
        result
    }
}
