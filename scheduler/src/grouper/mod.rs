//! Spatial grouping
//!
//! A [`Grouping`] partitions the users to serve into groups that share a
//! resource on different spatial layers. Strategies serve the groups one
//! after another; within a group the transmit power is split over the streams.

pub mod all_possible;
pub mod trivial;

pub use all_possible::{AllPossibleGroupsGrouper, MAX_STATIONS};
pub use trivial::TrivialGrouper;

use crate::interfaces::{BeamformingProvider, Registry};
use crate::types::{Pattern, UserSet};
use common::types::{CandI, UserId};
use std::collections::BTreeMap;
use std::fmt;

/// Users of one group with their C/I when served together
pub type Group = BTreeMap<UserId, CandI>;

/// Partition of users into groups
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Grouping {
    /// Groups in serving order
    pub groups: Vec<Group>,
    /// Index into `groups` per user
    pub user_group_number: BTreeMap<UserId, usize>,
    /// Antenna pattern per user, empty without beamforming
    pub patterns: BTreeMap<UserId, Pattern>,
}

impl Grouping {
    /// True if no user is grouped
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Group containing `user`
    pub fn group_of(&self, user: UserId) -> Option<&Group> {
        self.user_group_number.get(&user).map(|&n| &self.groups[n])
    }

    /// True if both users are in the same group
    pub fn same_group(&self, a: UserId, b: UserId) -> bool {
        match (self.user_group_number.get(&a), self.user_group_number.get(&b)) {
            (Some(x), Some(y)) => x == y,
            _ => false,
        }
    }

    /// Fraction of the transmit power one stream of `user`'s group gets
    pub fn share_of_power_per_stream(&self, user: UserId) -> f64 {
        match self.group_of(user) {
            Some(group) => 1.0 / group.len() as f64,
            None => panic!("share_of_power_per_stream(): {} is not grouped", user),
        }
    }

    /// Size of the largest group
    pub fn max_group_size(&self) -> usize {
        self.groups.iter().map(|g| g.len()).max().unwrap_or(0)
    }

    /// All grouped users
    pub fn users(&self) -> UserSet {
        self.user_group_number.keys().copied().collect()
    }

    /// Pattern of `user`, if beamforming is active
    pub fn pattern(&self, user: UserId) -> Option<&Pattern> {
        self.patterns.get(&user)
    }

    pub(crate) fn push_group(&mut self, group: Group) {
        let n = self.groups.len();
        for user in group.keys() {
            self.user_group_number.insert(*user, n);
        }
        self.groups.push(group);
    }
}

impl fmt::Display for Grouping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Grouping[")?;
        for (n, group) in self.groups.iter().enumerate() {
            if n > 0 {
                write!(f, " ")?;
            }
            let users: Vec<String> = group
                .iter()
                .map(|(user, cand_i)| format!("{}:{:.1}dB", user, cand_i.sinr().db()))
                .collect();
            write!(f, "{{{}}}", users.join(","))?;
        }
        write!(f, "]")
    }
}

/// Direction a grouping is computed for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupingMode {
    /// We transmit to the group
    Tx,
    /// We receive from the group
    Rx,
}

/// Builds groupings for a set of users
pub trait Grouper {
    /// Grouping for transmitting to `users` with at most `max_beams` per group
    fn tx_grouping(&self, users: &UserSet, max_beams: usize, frame_nr: u32) -> Grouping;

    /// Grouping for receiving from `users` with at most `max_beams` per group
    fn rx_grouping(&self, users: &UserSet, max_beams: usize, frame_nr: u32) -> Grouping;

    /// Dispatch on `mode`
    fn grouping(&self, mode: GroupingMode, users: &UserSet, max_beams: usize, frame_nr: u32) -> Grouping {
        match mode {
            GroupingMode::Tx => self.tx_grouping(users, max_beams, frame_nr),
            GroupingMode::Rx => self.rx_grouping(users, max_beams, frame_nr),
        }
    }
}

/// C/I of every member of `users` when served together
///
/// Without beamforming only single users can be evaluated.
pub(crate) fn cand_is_for(
    registry: &dyn Registry,
    beamformer: Option<&dyn BeamformingProvider>,
    users: &UserSet,
    mode: GroupingMode,
    frame_nr: u32,
) -> Group {
    match beamformer {
        Some(beamformer) => match mode {
            GroupingMode::Tx => beamformer.calculate_cand_is_tx(users),
            GroupingMode::Rx => beamformer.calculate_cand_is_rx(users),
        },
        None => {
            assert!(users.len() <= 1, "without beamforming only one-user groups are supported");
            users
                .iter()
                .map(|&user| {
                    let cand_i = match mode {
                        GroupingMode::Tx => registry.estimate_tx_sinr_at(user, frame_nr),
                        GroupingMode::Rx => registry.estimate_rx_sinr_of(user, frame_nr),
                    };
                    (user, cand_i)
                })
                .collect()
        }
    }
}
