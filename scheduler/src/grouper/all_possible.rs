//! Exhaustive grouper
//!
//! Evaluates every non-empty subset of the servable users with at most
//! `max_beams` members and picks the partition with the highest throughput
//! per group. The search is exponential in the number of users and therefore
//! bounded by [`MAX_STATIONS`].

use super::{cand_is_for, Group, Grouper, Grouping, GroupingMode};
use crate::interfaces::{BeamformingProvider, Registry};
use crate::probe::{put_if_observed, ProbeSink};
use crate::types::UserSet;
use common::types::UserId;
use std::rc::Rc;
use tracing::{debug, trace};

/// Largest number of users the exhaustive search accepts
pub const MAX_STATIONS: usize = 12;

/// One candidate group as a member bitmask
#[derive(Debug, Clone, Copy)]
struct Beams {
    served_stations: u32,
    throughput: f64,
}

/// Grouper searching all partitions of the servable users
pub struct AllPossibleGroupsGrouper {
    registry: Rc<dyn Registry>,
    beamformer: Option<Rc<dyn BeamformingProvider>>,
    gain_probe: Option<Rc<dyn ProbeSink>>,
}

impl AllPossibleGroupsGrouper {
    /// Create a grouper; without a beamformer every group has one member
    pub fn new(registry: Rc<dyn Registry>, beamformer: Option<Rc<dyn BeamformingProvider>>) -> Self {
        Self { registry, beamformer, gain_probe: None }
    }

    /// Report the gain over one-user groups to `probe`
    pub fn with_gain_probe(mut self, probe: Rc<dyn ProbeSink>) -> Self {
        self.gain_probe = Some(probe);
        self
    }

    fn cand_is(&self, users: &UserSet, mode: GroupingMode, frame_nr: u32) -> Group {
        cand_is_for(self.registry.as_ref(), self.beamformer.as_deref(), users, mode, frame_nr)
    }

    fn members(users: &[UserId], mask: u32) -> UserSet {
        users
            .iter()
            .enumerate()
            .filter(|(k, _)| mask & (1 << k) != 0)
            .map(|(_, &user)| user)
            .collect()
    }

    /// Users that can be served at least when alone
    fn servable_users(&self, users: &UserSet, mode: GroupingMode, frame_nr: u32) -> Vec<UserId> {
        let mapper = self.registry.phy_mode_mapper();
        users
            .iter()
            .copied()
            .filter(|&user| {
                let alone = self.cand_is(&UserSet::from([user]), mode, frame_nr);
                let servable = alone.get(&user).map(|c| mapper.sinr_is_above_limit(c.sinr())).unwrap_or(false);
                if !servable {
                    debug!("removing {}: SINR not sufficient even when served alone", user);
                }
                servable
            })
            .collect()
    }

    /// Every subset with at most `max_beams` members in which everybody gets a PHY mode
    fn all_possible_groups(&self, users: &[UserId], max_beams: usize, mode: GroupingMode, frame_nr: u32) -> Vec<Beams> {
        assert!(
            users.len() <= MAX_STATIONS,
            "{} users exceed the exhaustive grouper limit of {}",
            users.len(),
            MAX_STATIONS
        );
        let mapper = self.registry.phy_mode_mapper();
        let mut beams = Vec::new();
        for mask in 1u32..(1u32 << users.len()) {
            if mask.count_ones() as usize > max_beams {
                continue;
            }
            let cand_is = self.cand_is(&Self::members(users, mask), mode, frame_nr);
            let mut throughput = 0.0;
            let mut all_served = true;
            for cand_i in cand_is.values() {
                let sinr = cand_i.sinr();
                if mapper.sinr_is_above_limit(sinr) {
                    throughput += mapper.best_phy_mode(sinr).data_rate;
                } else {
                    all_served = false;
                    break;
                }
            }
            if all_served {
                beams.push(Beams { served_stations: mask, throughput });
            }
        }
        beams
    }

    /// Partition of all users maximizing throughput per group
    ///
    /// Returns the chosen member masks, ordered by their lowest member.
    fn make_grouping(candidates: &[Beams], number_of_users: usize) -> Vec<u32> {
        let full = (1u32 << number_of_users) - 1;
        let states = 1usize << number_of_users;
        let mut throughput_of = vec![f64::NEG_INFINITY; states];
        for beam in candidates {
            throughput_of[beam.served_stations as usize] = beam.throughput;
        }

        // best[k][mask]: highest total throughput covering `mask` with k groups
        let mut best = vec![vec![f64::NEG_INFINITY; states]; number_of_users + 1];
        let mut choice = vec![vec![0u32; states]; number_of_users + 1];
        best[0][0] = 0.0;
        for k in 1..=number_of_users {
            for mask in 1..states as u32 {
                let lowest = mask & mask.wrapping_neg();
                let mut sub = mask;
                while sub != 0 {
                    if sub & lowest != 0 && throughput_of[sub as usize].is_finite() {
                        let rest = best[k - 1][(mask ^ sub) as usize];
                        if rest.is_finite() {
                            let total = rest + throughput_of[sub as usize];
                            if total > best[k][mask as usize] {
                                best[k][mask as usize] = total;
                                choice[k][mask as usize] = sub;
                            }
                        }
                    }
                    sub = (sub - 1) & mask;
                }
            }
        }

        let mut best_k = 0;
        let mut best_metric = f64::NEG_INFINITY;
        for (k, row) in best.iter().enumerate().skip(1) {
            if row[full as usize].is_finite() {
                let metric = row[full as usize] / k as f64;
                if metric > best_metric {
                    best_metric = metric;
                    best_k = k;
                }
            }
        }

        let mut groups = Vec::with_capacity(best_k);
        let (mut mask, mut k) = (full, best_k);
        while k > 0 && mask != 0 {
            let sub = choice[k][mask as usize];
            groups.push(sub);
            mask ^= sub;
            k -= 1;
        }
        groups.sort_by_key(|g| g.trailing_zeros());
        groups
    }

    fn trivial_throughput_per_group(candidates: &[Beams], number_of_users: usize) -> f64 {
        if number_of_users == 0 {
            return 0.0;
        }
        let total: f64 = candidates
            .iter()
            .filter(|b| b.served_stations.count_ones() == 1)
            .map(|b| b.throughput)
            .sum();
        total / number_of_users as f64
    }

    fn grouping_for(&self, users: &UserSet, max_beams: usize, mode: GroupingMode, frame_nr: u32) -> Grouping {
        let max_beams = if self.beamformer.is_some() { max_beams.max(1) } else { 1 };
        let user_vector = self.servable_users(users, mode, frame_nr);
        if user_vector.is_empty() {
            return Grouping::default();
        }
        let candidates = self.all_possible_groups(&user_vector, max_beams, mode, frame_nr);
        trace!("AllPossibleGroupsGrouper: {} candidate groups", candidates.len());
        let partition = Self::make_grouping(&candidates, user_vector.len());

        let mut grouping = Grouping::default();
        let mut total = 0.0;
        for mask in &partition {
            let members = Self::members(&user_vector, *mask);
            if let Some(beamformer) = &self.beamformer {
                for &user in &members {
                    let mut undesired = members.clone();
                    undesired.remove(&user);
                    grouping.patterns.insert(user, beamformer.calculate_and_set_beam(user, &undesired));
                }
            }
            if let Some(beam) = candidates.iter().find(|b| b.served_stations == *mask) {
                total += beam.throughput;
            }
            grouping.push_group(self.cand_is(&members, mode, frame_nr));
        }

        let trivial = Self::trivial_throughput_per_group(&candidates, user_vector.len());
        if trivial > 0.0 && !partition.is_empty() {
            let gain = total / partition.len() as f64 / trivial;
            put_if_observed(self.gain_probe.as_deref(), gain, &[]);
        }
        debug!("{:?} grouping for {} users: {}", mode, user_vector.len(), grouping);
        grouping
    }
}

impl Grouper for AllPossibleGroupsGrouper {
    fn tx_grouping(&self, users: &UserSet, max_beams: usize, frame_nr: u32) -> Grouping {
        self.grouping_for(users, max_beams, GroupingMode::Tx, frame_nr)
    }

    fn rx_grouping(&self, users: &UserSet, max_beams: usize, frame_nr: u32) -> Grouping {
        self.grouping_for(users, max_beams, GroupingMode::Rx, frame_nr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{RegistryConfig, StaticBeamformer, StaticRegistry, StationConfig};

    fn setup(stations: Vec<StationConfig>) -> (Rc<StaticRegistry>, Rc<StaticBeamformer>) {
        let mut config = RegistryConfig::default();
        config.stations = stations;
        let registry = Rc::new(StaticRegistry::new(config).unwrap());
        let beamformer = Rc::new(StaticBeamformer::new(&registry, 20.0, 40.0));
        (registry, beamformer)
    }

    #[test]
    fn test_separated_users_are_grouped() {
        let (registry, beamformer) = setup(vec![
            StationConfig::new(1, &[1]).with_pathloss_db(90.0),
            StationConfig::new(2, &[2]).with_pathloss_db(90.0).with_angle(120.0),
        ]);
        let grouper = AllPossibleGroupsGrouper::new(registry, Some(beamformer));
        let users = UserSet::from([UserId(1), UserId(2)]);
        let grouping = grouper.tx_grouping(&users, 2, 0);
        assert_eq!(grouping.groups.len(), 1);
        assert!(grouping.same_group(UserId(1), UserId(2)));
        assert_eq!(grouping.pattern(UserId(1)).unwrap().nulls, vec![UserId(2)]);

        let single = grouper.tx_grouping(&users, 1, 0);
        assert_eq!(single.groups.len(), 2);
        assert_eq!(single.max_group_size(), 1);
    }

    #[test]
    fn test_unservable_user_is_dropped() {
        let (registry, beamformer) = setup(vec![
            StationConfig::new(1, &[1]).with_pathloss_db(90.0),
            StationConfig::new(2, &[2]).with_pathloss_db(200.0),
        ]);
        let grouper = AllPossibleGroupsGrouper::new(registry, Some(beamformer));
        let grouping = grouper.rx_grouping(&UserSet::from([UserId(1), UserId(2)]), 2, 0);
        assert_eq!(grouping.users(), UserSet::from([UserId(1)]));
    }

    #[test]
    fn test_without_beamforming_groups_are_single_users() {
        let (registry, _) = setup(vec![
            StationConfig::new(1, &[1]).with_pathloss_db(90.0),
            StationConfig::new(2, &[2]).with_pathloss_db(95.0),
            StationConfig::new(3, &[3]).with_pathloss_db(100.0),
        ]);
        let grouper = AllPossibleGroupsGrouper::new(registry, None);
        let grouping = grouper.tx_grouping(&UserSet::from([UserId(1), UserId(2), UserId(3)]), 4, 0);
        assert_eq!(grouping.groups.len(), 3);
        assert!(grouping.patterns.is_empty());
        assert_eq!(grouping.user_group_number[&UserId(3)], 2);
    }

    #[test]
    fn test_partition_maximizes_throughput_per_group() {
        // {0,1} together is worth 3, alone 1 each; user 2 only alone
        let candidates = [
            Beams { served_stations: 0b001, throughput: 1.0 },
            Beams { served_stations: 0b010, throughput: 1.0 },
            Beams { served_stations: 0b100, throughput: 2.0 },
            Beams { served_stations: 0b011, throughput: 3.0 },
        ];
        let partition = AllPossibleGroupsGrouper::make_grouping(&candidates, 3);
        assert_eq!(partition, vec![0b011, 0b100]);
    }

    #[test]
    #[should_panic(expected = "exceed the exhaustive grouper limit")]
    fn test_too_many_users_panics() {
        let stations = (1..=13).map(|u| StationConfig::new(u, &[u]).with_pathloss_db(80.0)).collect();
        let (registry, beamformer) = setup(stations);
        let users = registry.users();
        AllPossibleGroupsGrouper::new(registry, Some(beamformer)).tx_grouping(&users, 2, 0);
    }
}
