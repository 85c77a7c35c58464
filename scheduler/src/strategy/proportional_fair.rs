//! Proportional fair downlink scheduling
//!
//! Groups are served in order of a preference that blends the achievable
//! rate relative to the best PHY mode (maximum throughput) with the
//! achievable rate relative to the user's past average rate (proportional
//! fairness). A group stays in the priority queue until one of its bursts
//! adds no data.

use super::exhaustive_rr::place_group;
use super::{SchedulingAlgorithm, StrategyCore};
use crate::map::SchedulingMap;
use crate::queue::Queue;
use crate::types::{Bits, UserSet};
use crate::SchedulerError;
use common::types::UserId;
use rand::rngs::StdRng;
use rand::Rng;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BinaryHeap};
use tracing::{debug, trace};

/// Floor of the past rate in the fairness term, bit/s
const MIN_PAST_DATA_RATE: f64 = 0.01;

#[derive(Debug, Clone, Copy)]
struct Preference {
    value: f64,
    group: usize,
}

impl PartialEq for Preference {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Preference {}

impl PartialOrd for Preference {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Preference {
    /// Higher preference first, lower group index on ties
    fn cmp(&self, other: &Self) -> Ordering {
        self.value.total_cmp(&other.value).then_with(|| other.group.cmp(&self.group))
    }
}

/// Proportional fair scheduler with a throughput/fairness trade-off
pub struct ProportionalFairDL {
    history_weight: f64,
    scaling_between_max_tp_and_pf: f64,
    max_bursts: usize,
    past_data_rates: BTreeMap<UserId, f64>,
    rng: StdRng,
}

impl ProportionalFairDL {
    /// Create the strategy
    ///
    /// `history_weight` in [0,1) weighs the past rate against the current
    /// frame; `scaling` in [0,1] moves from maximum throughput (0) to
    /// proportional fairness (1). At most `max_bursts` bursts are placed per
    /// frame.
    pub fn new(history_weight: f64, scaling: f64, max_bursts: usize, rng: StdRng) -> Result<Self, SchedulerError> {
        if !(0.0..1.0).contains(&history_weight) {
            return Err(SchedulerError::InvalidConfiguration(format!(
                "historyWeight {} outside [0,1)",
                history_weight
            )));
        }
        if !(0.0..=1.0).contains(&scaling) {
            return Err(SchedulerError::InvalidConfiguration(format!(
                "scalingBetweenMaxTPandPFair {} outside [0,1]",
                scaling
            )));
        }
        if max_bursts == 0 {
            return Err(SchedulerError::InvalidConfiguration("maxBursts must be >= 1".to_string()));
        }
        Ok(Self {
            history_weight,
            scaling_between_max_tp_and_pf: scaling,
            max_bursts,
            past_data_rates: BTreeMap::new(),
            rng,
        })
    }

    /// Average rate of `user` over the past frames, bit/s
    pub fn past_data_rate(&self, user: UserId) -> f64 {
        self.past_data_rates.get(&user).copied().unwrap_or(0.0)
    }

    fn preference(&mut self, rate: f64, max_rate: f64, past_rate: f64, weight: f64) -> f64 {
        let s = self.scaling_between_max_tp_and_pf;
        let mut throughput = rate / max_rate;
        if s <= 0.5 {
            // break ties between equal channels at random
            throughput *= 1.0 + 0.01 * self.rng.gen_range(-1.0..=1.0);
        }
        let fairness = rate / (past_rate / weight).max(MIN_PAST_DATA_RATE);
        (1.0 - s) * throughput + s * fairness
    }

    fn update_past_data_rates(&mut self, users: &UserSet, scheduled: &BTreeMap<UserId, Bits>, slot_length: f64) {
        let h = self.history_weight;
        let known: UserSet = self.past_data_rates.keys().copied().chain(users.iter().copied()).collect();
        for user in known {
            let bits = scheduled.get(&user).copied().unwrap_or(0);
            let current = if slot_length > 0.0 { bits as f64 / slot_length } else { 0.0 };
            let past = self.past_data_rate(user);
            self.past_data_rates.insert(user, (1.0 - h) * current + h * past);
        }
    }
}

impl SchedulingAlgorithm for ProportionalFairDL {
    fn name(&self) -> &'static str {
        "ProportionalFairDL"
    }

    fn do_start_scheduling(&mut self, core: &mut StrategyCore, map: &mut SchedulingMap, queue: &mut dyn Queue) {
        let grouping = core.regroup(queue);
        let max_rate = core.mapper().highest_phy_mode().data_rate;

        let mut heap = BinaryHeap::new();
        for (index, group) in grouping.groups.iter().enumerate() {
            let mut sum = 0.0;
            for (&user, cand_i) in group {
                let phy_mode = core.get_best_phy_mode(cand_i.sinr());
                let rate = if phy_mode.is_valid() { phy_mode.data_rate } else { 0.0 };
                let weight = core.registry().total_number_of_users(user) as f64;
                let past = self.past_data_rate(user);
                sum += self.preference(rate, max_rate, past, weight);
            }
            let value = sum / group.len().max(1) as f64;
            trace!("group {} preference {:.3}", index, value);
            heap.push(Preference { value, group: index });
        }

        let mut scheduled: BTreeMap<UserId, Bits> = BTreeMap::new();
        let mut bursts = 0;
        while let Some(preference) = heap.pop() {
            if bursts >= self.max_bursts {
                debug!("ProportionalFairDL: maxBursts {} reached", self.max_bursts);
                break;
            }
            let group = &grouping.groups[preference.group];
            let placement = place_group(core, map, queue, &grouping, group);
            if placement.total_bits() == 0 {
                continue;
            }
            bursts += placement.bits.len();
            for (user, bits) in placement.bits {
                *scheduled.entry(user).or_insert(0) += bits;
            }
            let exhausted = group.keys().any(|u| core.connections_with_data(queue, *u).is_empty());
            if !exhausted {
                heap.push(preference);
            }
        }
        self.update_past_data_rates(&grouping.users(), &scheduled, map.slot_length());
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::strategy::{Strategy, StrategyInput};
    use crate::types::SchedulerSpot;
    use rand::SeedableRng;

    fn pf(scaling: f64) -> ProportionalFairDL {
        ProportionalFairDL::new(0.5, scaling, 100, StdRng::seed_from_u64(7)).unwrap()
    }

    #[test]
    fn test_parameters_validated() {
        assert!(ProportionalFairDL::new(1.0, 0.5, 1, StdRng::seed_from_u64(0)).is_err());
        assert!(ProportionalFairDL::new(0.5, 1.5, 1, StdRng::seed_from_u64(0)).is_err());
        assert!(ProportionalFairDL::new(0.5, 0.5, 0, StdRng::seed_from_u64(0)).is_err());
    }

    #[test]
    fn test_preference_order() {
        let a = Preference { value: 2.0, group: 1 };
        let b = Preference { value: 2.0, group: 0 };
        let c = Preference { value: 3.0, group: 5 };
        let mut heap = BinaryHeap::from(vec![a, b, c]);
        assert_eq!(heap.pop().map(|p| p.group), Some(5));
        assert_eq!(heap.pop().map(|p| p.group), Some(0));
        assert_eq!(heap.pop().map(|p| p.group), Some(1));
    }

    #[test]
    fn test_max_throughput_prefers_good_channel() {
        // user 1: 47 dB, user 2: 17 dB
        let registry = registry(&[(1, 80.0), (2, 110.0)]);
        let mut queue = filled_queue(registry.clone(), &[1, 2], 20, 100);
        let mut strategy = Strategy::new(StrategyCore::new(registry, SchedulerSpot::DlMaster), Box::new(pf(0.0))).unwrap();
        let result = strategy.start_scheduling(StrategyInput::new(1, 1e-3, 1, 1, 0), &mut queue);
        assert_eq!(result.users(), UserSet::from([UserId(1)]));
        assert_eq!(result.scheduled_bits(), 1100);
    }

    #[test]
    fn test_fairness_alternates_users() {
        let registry = registry(&[(1, 80.0), (2, 110.0)]);
        let mut queue = filled_queue(registry.clone(), &[1, 2], 40, 100);
        let mut strategy = Strategy::new(StrategyCore::new(registry, SchedulerSpot::DlMaster), Box::new(pf(1.0))).unwrap();
        let first = strategy.start_scheduling(StrategyInput::new(1, 1e-3, 1, 1, 0), &mut queue);
        assert_eq!(first.users(), UserSet::from([UserId(1)]));
        // user 2 has no past rate yet and wins the next frame
        let second = strategy.start_scheduling(StrategyInput::new(1, 1e-3, 1, 1, 1), &mut queue);
        assert_eq!(second.users(), UserSet::from([UserId(2)]));
        // mode 4 at 750 kbit/s holds 7 PDUs
        assert_eq!(second.scheduled_bits(), 700);
    }

    #[test]
    fn test_past_rate_update() {
        let mut pf = pf(1.0);
        let scheduled = BTreeMap::from([(UserId(1), 1000)]);
        pf.update_past_data_rates(&UserSet::from([UserId(1), UserId(2)]), &scheduled, 1e-3);
        assert!((pf.past_data_rate(UserId(1)) - 0.5e6).abs() < 1e-6);
        assert_eq!(pf.past_data_rate(UserId(2)), 0.0);
        pf.update_past_data_rates(&UserSet::new(), &BTreeMap::new(), 1e-3);
        assert!((pf.past_data_rate(UserId(1)) - 0.25e6).abs() < 1e-6);
    }
}
