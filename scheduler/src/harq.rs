//! HARQ retransmission bookkeeping
//!
//! Each peer has a fixed number of stop-and-wait sender processes. A process
//! holds one transmission until it is acknowledged; a NACK queues it for
//! retransmission until the redundancy versions are used up. Strategies ask
//! [`Harq`] for pending retransmissions before they schedule new data.

use crate::compound::CompoundPtr;
use crate::phy_mode::PhyMode;
use crate::types::{Bits, UserSet};
use crate::SchedulerError;
use common::types::{ConnectionId, Power, UserId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use tracing::{debug, trace};

/// One transmission held by a sender process
#[derive(Debug, Clone, PartialEq)]
pub struct HarqTransmission {
    /// Receiving peer
    pub user: UserId,
    /// Connection the data belongs to
    pub cid: ConnectionId,
    /// Sender process, set when the transmission is stored
    pub process_id: usize,
    /// Compounds of the original transmission
    pub compounds: Vec<CompoundPtr>,
    /// Modulation and coding of the original transmission
    pub phy_mode: PhyMode,
    /// Transmit power of the original transmission
    pub tx_power: Power,
    /// Retransmissions so far
    pub retransmissions: usize,
}

impl HarqTransmission {
    /// New transmission of `compounds` to `user`
    pub fn new(user: UserId, cid: ConnectionId, compounds: Vec<CompoundPtr>, phy_mode: PhyMode, tx_power: Power) -> Self {
        Self { user, cid, process_id: 0, compounds, phy_mode, tx_power, retransmissions: 0 }
    }

    /// Total bits
    pub fn bits(&self) -> Bits {
        self.compounds.iter().map(|c| c.length_in_bits()).sum()
    }
}

/// Retransmission source consumed by the strategies
pub trait Harq {
    /// Peers with retransmissions pending
    fn users_with_retransmissions(&self) -> UserSet;

    /// Processes of `user` with retransmissions pending, ascending
    fn processes_with_retransmissions(&self, user: UserId) -> Vec<usize>;

    /// Pending retransmissions of one process
    fn number_of_retransmissions(&self, user: UserId, process_id: usize) -> usize;

    /// Next retransmission of one process without taking it
    fn peek_next_retransmission(&self, user: UserId, process_id: usize) -> Option<&HarqTransmission>;

    /// Take the next retransmission of one process
    ///
    /// The process keeps the transmission until it is acknowledged again.
    fn next_retransmission(&mut self, user: UserId, process_id: usize) -> Option<HarqTransmission>;

    /// True if `user` has a free sender process
    fn has_capacity(&self, user: UserId) -> bool;

    /// Store a new transmission; returns its process or `None` if all are busy
    fn new_transmission(&mut self, transmission: HarqTransmission) -> Option<usize>;

    /// Positive acknowledgement frees the process
    fn ack(&mut self, user: UserId, process_id: usize);

    /// Negative acknowledgement; false if the transmission was dropped
    fn nack(&mut self, user: UserId, process_id: usize) -> bool;
}

/// Process and redundancy version limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HarqConfig {
    /// Sender processes per peer
    #[serde(default = "default_processes")]
    pub number_of_sender_processes: usize,
    /// Retransmissions before a transmission is dropped
    #[serde(default = "default_retransmissions")]
    pub number_of_retransmissions: usize,
}

fn default_processes() -> usize {
    8
}

fn default_retransmissions() -> usize {
    3
}

impl Default for HarqConfig {
    fn default() -> Self {
        Self {
            number_of_sender_processes: default_processes(),
            number_of_retransmissions: default_retransmissions(),
        }
    }
}

#[derive(Debug)]
struct HarqEntity {
    processes: Vec<Option<HarqTransmission>>,
    pending: BTreeMap<usize, VecDeque<HarqTransmission>>,
}

impl HarqEntity {
    fn new(processes: usize) -> Self {
        Self { processes: vec![None; processes], pending: BTreeMap::new() }
    }

    fn in_flight(&self, process_id: usize) -> &HarqTransmission {
        match self.processes.get(process_id).and_then(|p| p.as_ref()) {
            Some(transmission) => transmission,
            None => panic!("HARQ process {} holds no transmission", process_id),
        }
    }
}

/// In-memory HARQ with one entity per peer
#[derive(Debug)]
pub struct HarqManager {
    config: HarqConfig,
    entities: BTreeMap<UserId, HarqEntity>,
}

impl HarqManager {
    /// Create from configuration
    pub fn new(config: HarqConfig) -> Result<Self, SchedulerError> {
        if config.number_of_sender_processes == 0 {
            return Err(SchedulerError::InvalidConfiguration(
                "HARQ needs at least one sender process".to_string(),
            ));
        }
        Ok(Self { config, entities: BTreeMap::new() })
    }

    /// Transmissions currently held for `user`
    pub fn in_flight(&self, user: UserId) -> usize {
        self.entities
            .get(&user)
            .map(|e| e.processes.iter().filter(|p| p.is_some()).count())
            .unwrap_or(0)
    }

    fn entity_mut(&mut self, user: UserId) -> &mut HarqEntity {
        let processes = self.config.number_of_sender_processes;
        self.entities.entry(user).or_insert_with(|| HarqEntity::new(processes))
    }
}

impl Harq for HarqManager {
    fn users_with_retransmissions(&self) -> UserSet {
        self.entities
            .iter()
            .filter(|(_, e)| e.pending.values().any(|q| !q.is_empty()))
            .map(|(&user, _)| user)
            .collect()
    }

    fn processes_with_retransmissions(&self, user: UserId) -> Vec<usize> {
        self.entities
            .get(&user)
            .map(|e| e.pending.iter().filter(|(_, q)| !q.is_empty()).map(|(&p, _)| p).collect())
            .unwrap_or_default()
    }

    fn number_of_retransmissions(&self, user: UserId, process_id: usize) -> usize {
        self.entities
            .get(&user)
            .and_then(|e| e.pending.get(&process_id))
            .map(|q| q.len())
            .unwrap_or(0)
    }

    fn peek_next_retransmission(&self, user: UserId, process_id: usize) -> Option<&HarqTransmission> {
        self.entities.get(&user)?.pending.get(&process_id)?.front()
    }

    fn next_retransmission(&mut self, user: UserId, process_id: usize) -> Option<HarqTransmission> {
        let entity = self.entities.get_mut(&user)?;
        let queue = entity.pending.get_mut(&process_id)?;
        let transmission = queue.pop_front();
        if queue.is_empty() {
            entity.pending.remove(&process_id);
        }
        trace!("next_retransmission({}, process {}): {}", user, process_id, transmission.is_some());
        transmission
    }

    fn has_capacity(&self, user: UserId) -> bool {
        self.entities
            .get(&user)
            .map(|e| e.processes.iter().any(|p| p.is_none()))
            .unwrap_or(true)
    }

    fn new_transmission(&mut self, mut transmission: HarqTransmission) -> Option<usize> {
        let user = transmission.user;
        let entity = self.entity_mut(user);
        let process_id = entity.processes.iter().position(|p| p.is_none())?;
        transmission.process_id = process_id;
        transmission.retransmissions = 0;
        debug!("HARQ {}: new transmission of {} bits in process {}", user, transmission.bits(), process_id);
        entity.processes[process_id] = Some(transmission);
        Some(process_id)
    }

    fn ack(&mut self, user: UserId, process_id: usize) {
        let entity = self.entity_mut(user);
        entity.in_flight(process_id);
        entity.processes[process_id] = None;
        entity.pending.remove(&process_id);
        trace!("HARQ {}: ACK for process {}", user, process_id);
    }

    fn nack(&mut self, user: UserId, process_id: usize) -> bool {
        let limit = self.config.number_of_retransmissions;
        let entity = self.entity_mut(user);
        let retransmissions = entity.in_flight(process_id).retransmissions;
        if retransmissions >= limit {
            debug!("HARQ {}: process {} dropped after {} retransmissions", user, process_id, retransmissions);
            entity.processes[process_id] = None;
            entity.pending.remove(&process_id);
            return false;
        }
        let Some(transmission) = entity.processes[process_id].as_mut() else {
            return false;
        };
        transmission.retransmissions += 1;
        let retransmission = transmission.clone();
        entity.pending.entry(process_id).or_default().push_back(retransmission);
        debug!("HARQ {}: NACK for process {}, retransmission {}", user, process_id, retransmissions + 1);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compound::CompoundFactory;

    fn transmission(factory: &CompoundFactory, user: u32) -> HarqTransmission {
        let pdu = factory.create(ConnectionId(user), 100);
        let mode = PhyMode { index: 0, data_rate: 1e5, min_sinr: Default::default() };
        HarqTransmission::new(UserId(user), ConnectionId(user), vec![pdu], mode, Power::from_dbm(10.0))
    }

    #[test]
    fn test_processes_fill_up() {
        let factory = CompoundFactory::new();
        let mut harq = HarqManager::new(HarqConfig { number_of_sender_processes: 2, number_of_retransmissions: 1 }).unwrap();
        assert_eq!(harq.new_transmission(transmission(&factory, 1)), Some(0));
        assert_eq!(harq.new_transmission(transmission(&factory, 1)), Some(1));
        assert!(!harq.has_capacity(UserId(1)));
        assert_eq!(harq.new_transmission(transmission(&factory, 1)), None);
        assert!(harq.has_capacity(UserId(2)));
        harq.ack(UserId(1), 0);
        assert!(harq.has_capacity(UserId(1)));
        assert_eq!(harq.in_flight(UserId(1)), 1);
    }

    #[test]
    fn test_nack_queues_until_limit() {
        let factory = CompoundFactory::new();
        let mut harq = HarqManager::new(HarqConfig { number_of_sender_processes: 2, number_of_retransmissions: 2 }).unwrap();
        let process = harq.new_transmission(transmission(&factory, 3)).unwrap();
        assert!(harq.nack(UserId(3), process));
        assert_eq!(harq.users_with_retransmissions(), UserSet::from([UserId(3)]));
        assert_eq!(harq.processes_with_retransmissions(UserId(3)), vec![process]);
        assert_eq!(harq.number_of_retransmissions(UserId(3), process), 1);
        assert_eq!(harq.peek_next_retransmission(UserId(3), process).unwrap().retransmissions, 1);

        let retransmission = harq.next_retransmission(UserId(3), process).unwrap();
        assert_eq!(retransmission.bits(), 100);
        assert!(harq.users_with_retransmissions().is_empty());
        assert_eq!(harq.in_flight(UserId(3)), 1);

        assert!(harq.nack(UserId(3), process));
        harq.next_retransmission(UserId(3), process);
        assert!(!harq.nack(UserId(3), process));
        assert_eq!(harq.in_flight(UserId(3)), 0);
        assert!(harq.next_retransmission(UserId(3), process).is_none());
    }

    #[test]
    #[should_panic(expected = "holds no transmission")]
    fn test_ack_of_idle_process_panics() {
        let mut harq = HarqManager::new(HarqConfig::default()).unwrap();
        harq.ack(UserId(1), 0);
    }

    #[test]
    fn test_zero_processes_rejected() {
        let config = HarqConfig { number_of_sender_processes: 0, number_of_retransmissions: 1 };
        assert!(matches!(HarqManager::new(config), Err(SchedulerError::InvalidConfiguration(_))));
    }
}
