//! One group per user

use super::{cand_is_for, Grouper, Grouping, GroupingMode};
use crate::interfaces::{BeamformingProvider, Registry};
use crate::types::UserSet;
use std::rc::Rc;

/// Grouper serving every user on its own
pub struct TrivialGrouper {
    registry: Rc<dyn Registry>,
    beamformer: Option<Rc<dyn BeamformingProvider>>,
}

impl TrivialGrouper {
    /// Create a grouper; with a beamformer every user also gets a pattern
    pub fn new(registry: Rc<dyn Registry>, beamformer: Option<Rc<dyn BeamformingProvider>>) -> Self {
        Self { registry, beamformer }
    }

    fn grouping_for(&self, users: &UserSet, mode: GroupingMode, frame_nr: u32) -> Grouping {
        let mut grouping = Grouping::default();
        for &user in users {
            let alone = UserSet::from([user]);
            if let Some(beamformer) = &self.beamformer {
                grouping.patterns.insert(user, beamformer.calculate_and_set_beam(user, &UserSet::new()));
            }
            grouping.push_group(cand_is_for(self.registry.as_ref(), self.beamformer.as_deref(), &alone, mode, frame_nr));
        }
        grouping
    }
}

impl Grouper for TrivialGrouper {
    fn tx_grouping(&self, users: &UserSet, _max_beams: usize, frame_nr: u32) -> Grouping {
        self.grouping_for(users, GroupingMode::Tx, frame_nr)
    }

    fn rx_grouping(&self, users: &UserSet, _max_beams: usize, frame_nr: u32) -> Grouping {
        self.grouping_for(users, GroupingMode::Rx, frame_nr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{RegistryConfig, StaticRegistry, StationConfig};
    use common::types::UserId;

    #[test]
    fn test_every_user_alone() {
        let mut config = RegistryConfig::default();
        config.stations = vec![
            StationConfig::new(4, &[1]).with_pathloss_db(90.0),
            StationConfig::new(7, &[2]).with_pathloss_db(200.0),
        ];
        let registry = Rc::new(StaticRegistry::new(config).unwrap());
        let expected = registry.estimate_tx_sinr_at(UserId(4), 0);
        let grouper = TrivialGrouper::new(registry, None);
        let grouping = grouper.tx_grouping(&UserSet::from([UserId(4), UserId(7)]), 3, 0);
        assert_eq!(grouping.groups.len(), 2);
        assert_eq!(grouping.group_of(UserId(4)).unwrap()[&UserId(4)], expected);
        assert_eq!(grouping.user_group_number[&UserId(7)], 1);
        assert_eq!(grouping.share_of_power_per_stream(UserId(7)), 1.0);
    }
}
