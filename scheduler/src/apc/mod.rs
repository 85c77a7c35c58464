//! Adaptive power control
//!
//! After DSA has chosen a resource, an [`ApcStrategy`] decides transmit power
//! and PHY mode for the request from the channel state on that resource.
//! `post_process` runs once per frame after all placements.

pub mod fair_sinr;
pub mod fcfs_max_phy_mode;
pub mod lte_ul;
pub mod use_max_tx_power;

pub use fair_sinr::FairSinr;
pub use fcfs_max_phy_mode::FcfsMaxPhyMode;
pub use lte_ul::LteUl;
pub use use_max_tx_power::UseMaxTxPower;

use crate::interfaces::Registry;
use crate::map::SchedulingMap;
use crate::phy_mode::PhyMode;
use crate::strategy::SchedulerState;
use crate::types::{PowerControlType, RequestForResource};
use common::types::{CandI, ChannelQualityOnOneSubChannel, Power, PowerCapabilities, Ratio, UserId};
use tracing::debug;

/// Power and PHY mode decided for one request
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ApcResult {
    /// Transmit power; zero means the request cannot be served
    pub tx_power: Power,
    /// PHY mode; invalid means the request cannot be served
    pub phy_mode: PhyMode,
    /// Expected SINR
    pub sinr: Ratio,
    /// Expected carrier and interference at the receiver
    pub estimated_cand_i: CandI,
}

impl ApcResult {
    /// Result for a request that cannot be served
    pub fn unservable(channel: &ChannelQualityOnOneSubChannel) -> Self {
        Self {
            tx_power: Power::zero(),
            phy_mode: PhyMode::invalid(),
            sinr: Ratio::from_factor(0.0),
            estimated_cand_i: CandI { c: Power::zero(), i: channel.interference, pathloss: channel.pathloss },
        }
    }

    /// Result for transmitting with `tx_power` over `channel`
    pub fn with_power(tx_power: Power, channel: &ChannelQualityOnOneSubChannel) -> Self {
        Self {
            tx_power,
            phy_mode: PhyMode::invalid(),
            sinr: channel.sinr_for(tx_power),
            estimated_cand_i: CandI {
                c: tx_power / channel.pathloss,
                i: channel.interference,
                pathloss: channel.pathloss,
            },
        }
    }

    /// True if power and mode allow a transmission
    pub fn is_servable(&self) -> bool {
        !self.tx_power.is_zero() && self.phy_mode.is_valid()
    }
}

/// Power control used by the strategies
pub trait ApcStrategy {
    /// Name for logging
    fn name(&self) -> &'static str;

    /// Called once per frame before any request
    fn initialize(&mut self, _state: &SchedulerState, _map: &SchedulingMap) {}

    /// Power and PHY mode for `request` on the resource DSA chose
    ///
    /// The request must carry the channel state of its subchannel.
    fn do_adaptive_power_control(
        &mut self,
        request: &RequestForResource,
        state: &SchedulerState,
        map: &SchedulingMap,
    ) -> ApcResult;

    /// Called once per frame after all placements
    fn post_process(&mut self, _state: &SchedulerState, _map: &mut SchedulingMap) {}
}

/// Channel state carried by a placed request
pub(crate) fn channel_of(request: &RequestForResource) -> ChannelQualityOnOneSubChannel {
    match request.cqi_on_sub_channel {
        Some(cqi) => cqi,
        None => panic!("power control needs the channel state of {}", request),
    }
}

/// Power limits of the transmitter of `user`'s link
pub(crate) fn power_capabilities_for(registry: &dyn Registry, state: &SchedulerState, user: UserId) -> PowerCapabilities {
    match state.power_control_type {
        PowerControlType::DlMaster | PowerControlType::UlSlave => state.power_capabilities,
        PowerControlType::UlMaster => registry.power_capabilities(Some(user)),
    }
}

/// Scale every time slot whose summed power exceeds `limit` down to the limit
pub(crate) fn scale_down_to_budget(map: &mut SchedulingMap, limit: Power) {
    for time_slot in 0..map.number_of_time_slots() {
        let used = map.used_power(time_slot);
        if used.is_zero() || used.mw() <= limit.mw() {
            continue;
        }
        let factor = limit.mw() / used.mw();
        debug!("time slot {}: reducing power {} to {} (factor {:.3})", time_slot, used, limit, factor);
        map.scale_tx_power(time_slot, factor);
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::registry::{RegistryConfig, StaticRegistry, StationConfig};
    use common::types::ConnectionId;
    use std::rc::Rc;

    pub fn registry() -> Rc<StaticRegistry> {
        let mut config = RegistryConfig::default();
        config.stations = vec![StationConfig::new(1, &[1]).with_pathloss_db(100.0)];
        Rc::new(StaticRegistry::new(config).unwrap())
    }

    /// Request on subchannel 0 with the given pathloss and -100 dBm interference
    pub fn placed_request(pathloss_db: f64) -> RequestForResource {
        let mut request = RequestForResource::new(ConnectionId(1), UserId(1), 100);
        request.sub_channel = Some(0);
        request.cqi_on_sub_channel = Some(ChannelQualityOnOneSubChannel::new(
            Ratio::from_db(pathloss_db),
            Power::from_dbm(-100.0),
            0,
        ));
        request
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phy_mode::TablePhyModeMapper;
    use crate::interfaces::PhyModeMapper;
    use common::types::ConnectionId;

    #[test]
    fn test_scale_down_to_budget() {
        let mode = TablePhyModeMapper::default().lowest_phy_mode();
        let mut map = SchedulingMap::new(1e-3, 2, 1, 1, 0);
        for sc in 0..2 {
            map.add_compound(sc, 0, 0, 1e-4, ConnectionId(1), UserId(1), None, mode, Power::from_mw(300.0), None);
        }
        scale_down_to_budget(&mut map, Power::from_mw(400.0));
        assert!((map.used_power(0).mw() - 400.0).abs() < 1e-9);
        assert!((map.prb(1, 0, 0).compounds()[0].tx_power.mw() - 200.0).abs() < 1e-9);
        scale_down_to_budget(&mut map, Power::from_mw(1000.0));
        assert!((map.used_power(0).mw() - 400.0).abs() < 1e-9);
    }

    #[test]
    #[should_panic(expected = "needs the channel state")]
    fn test_request_without_channel_state() {
        channel_of(&RequestForResource::new(ConnectionId(1), UserId(1), 10));
    }
}
