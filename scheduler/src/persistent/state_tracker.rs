//! Talk-spurt tracking for persistent scheduling
//!
//! Each period a connection either shows up with data in its frame or not.
//! Connections seen two periods in a row become persistent, persistent ones
//! that stop talking are silenced, and silenced ones that talk for two
//! periods again are reactivated. A single active period of a silent
//! connection counts as comfort noise and is served unpersistently.

use crate::types::ConnectionSet;
use common::types::ConnectionId;
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, trace};

/// Active connections of one frame, sorted by persistence state
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClassifiedConnections {
    /// Seen last period and now, first time
    pub new_persistent: ConnectionSet,
    /// Silent connections talking again
    pub reactivated: ConnectionSet,
    /// Expected and present
    pub persistent: ConnectionSet,
    /// Present but not (yet) persistent
    pub unpersistent: ConnectionSet,
    /// Expected but absent
    pub silenced: ConnectionSet,
    /// Belonging to another frame that could not serve them
    pub other_frame: ConnectionSet,
    /// Active connections of this frame that did not move here
    pub total_app_active: usize,
    /// Active connections of this frame
    pub total_active: usize,
    /// All connections with data
    pub total_queued: usize,
}

fn fmt_set(f: &mut fmt::Formatter<'_>, name: &str, set: &ConnectionSet) -> fmt::Result {
    write!(f, "{}:", name)?;
    for cid in set {
        write!(f, " {}", cid)?;
    }
    writeln!(f)
}

impl fmt::Display for ClassifiedConnections {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt_set(f, "NewPersistent", &self.new_persistent)?;
        fmt_set(f, "Reactivated", &self.reactivated)?;
        fmt_set(f, "Persistent", &self.persistent)?;
        fmt_set(f, "Unpersistent", &self.unpersistent)?;
        fmt_set(f, "Silenced", &self.silenced)?;
        fmt_set(f, "OtherFrame", &self.other_frame)
    }
}

pub struct StateTracker {
    number_of_frames: usize,
    all: ConnectionSet,
    silent: ConnectionSet,
    unserved: ConnectionSet,
    expected: Vec<ConnectionSet>,
    past_period: Vec<ConnectionSet>,
    time_relocated: Vec<ConnectionSet>,
    cid_to_frame: BTreeMap<ConnectionId, usize>,
}

impl StateTracker {
    pub fn new(number_of_frames: usize) -> Self {
        Self {
            number_of_frames,
            all: ConnectionSet::new(),
            silent: ConnectionSet::new(),
            unserved: ConnectionSet::new(),
            expected: vec![ConnectionSet::new(); number_of_frames],
            past_period: vec![ConnectionSet::new(); number_of_frames],
            time_relocated: vec![ConnectionSet::new(); number_of_frames],
            cid_to_frame: BTreeMap::new(),
        }
    }

    /// Classify the connections with data in `frame`
    pub fn update_state(&mut self, active: &ConnectionSet, frame: usize) -> ClassifiedConnections {
        assert!(frame < self.number_of_frames, "frame {} exceeds number of frames", frame);
        if active.is_empty() && self.expected[frame].is_empty() {
            self.past_period[frame].clear();
            return ClassifiedConnections::default();
        }

        let (this_frame, elsewhere): (ConnectionSet, ConnectionSet) = active
            .iter()
            .partition(|cid: &&ConnectionId| self.cid_to_frame.get(*cid).map_or(true, |f| *f == frame));
        let other_frame: ConnectionSet = elsewhere.intersection(&self.unserved).copied().collect();
        let expected = &self.expected[frame];
        let past = &self.past_period[frame];

        let old: ConnectionSet = expected.intersection(&this_frame).copied().collect();
        let silenced: ConnectionSet = expected.difference(&this_frame).copied().collect();
        let unknown: ConnectionSet = this_frame.difference(&self.all).copied().collect();
        let new: ConnectionSet = unknown.intersection(past).copied().collect();
        let first_time: ConnectionSet = unknown.difference(&new).copied().collect();
        let unexpected: ConnectionSet = this_frame
            .difference(&unknown)
            .filter(|cid| !expected.contains(*cid))
            .copied()
            .collect();
        let reactivated: ConnectionSet = unexpected.intersection(past).copied().collect();
        // silent but not seen last period: comfort noise or talking again
        let comfort_noise: ConnectionSet = unexpected
            .difference(past)
            .filter(|cid| self.silent.contains(*cid))
            .copied()
            .collect();

        for cid in &reactivated {
            assert!(self.silent.remove(cid), "reactivated {} was not silent", cid);
        }
        self.all.extend(new.iter().copied());
        self.past_period[frame] = first_time.union(&comfort_noise).copied().collect();
        self.expected[frame] = old.union(&new).chain(reactivated.iter()).copied().collect();
        self.silent.extend(silenced.iter().copied());

        for cid in &new {
            let previous = self.cid_to_frame.insert(*cid, frame);
            assert!(previous.is_none(), "frame for {} already set", cid);
        }

        let relocated = self.time_relocated[frame].len();
        assert!(this_frame.len() >= relocated, "more relocated than active connections in frame {}", frame);
        let classified = ClassifiedConnections {
            new_persistent: new,
            reactivated,
            persistent: old,
            unpersistent: self.past_period[frame].clone(),
            silenced,
            other_frame,
            total_app_active: this_frame.len() - relocated,
            total_active: this_frame.len(),
            total_queued: active.len(),
        };
        debug!("frame {}: {} active, {} elsewhere", frame, this_frame.len(), elsewhere.len());
        trace!("frame {} classified:\n{}", frame, classified);
        classified
    }

    /// Stop expecting `cid` in `frame` before its next period
    pub fn silence_cid(&mut self, cid: ConnectionId, frame: usize) {
        assert!(!self.silent.contains(&cid), "{} already silent", cid);
        assert!(self.expected[frame].remove(&cid), "{} not expected in frame {}", cid, frame);
        self.time_relocated[frame].remove(&cid);
        self.silent.insert(cid);
        trace!("{} no longer expected in frame {}", cid, frame);
    }

    /// Move a silenced `cid` from `frame` to `new_frame`, where it turns persistent next period
    pub fn relocate_cid(&mut self, cid: ConnectionId, frame: usize, new_frame: usize) {
        let assigned = self.cid_to_frame.get_mut(&cid);
        let Some(assigned) = assigned else {
            panic!("unknown frame for {}", cid);
        };
        assert_eq!(*assigned, frame, "{} is not from frame {}", cid, frame);
        assert!(self.silent.contains(&cid), "{} must be silenced before relocation", cid);
        *assigned = new_frame;
        self.past_period[new_frame].insert(cid);
        self.time_relocated[new_frame].insert(cid);
        debug!("{} relocated from frame {} to {}", cid, frame, new_frame);
    }

    /// Mark `cid` as not served in its own frame
    pub fn unserved_cid(&mut self, cid: ConnectionId) {
        self.unserved.insert(cid);
    }

    /// Clear the unserved mark after `cid` got served elsewhere; false if it was not marked
    pub fn served_in_other_frame_cid(&mut self, cid: ConnectionId) -> bool {
        self.unserved.remove(&cid)
    }

    pub fn frame_for_cid(&self, cid: ConnectionId) -> Option<usize> {
        self.cid_to_frame.get(&cid).copied()
    }

    pub fn is_silent(&self, cid: ConnectionId) -> bool {
        self.silent.contains(&cid)
    }

    pub fn number_of_frames(&self) -> usize {
        self.number_of_frames
    }
}
