//! FIFO queue per connection without segmentation

use super::{probe_size, Queue, QueueStatusContainer};
use crate::compound::{Compound, CompoundPtr};
use crate::interfaces::Registry;
use crate::probe::ProbeSink;
use crate::types::{Bits, ConnectionSet, ProbeOutput, QueueStatus, UserSet};
use common::types::{ConnectionId, UserId};
use std::collections::{BTreeMap, VecDeque};
use std::rc::Rc;
use tracing::{debug, trace};

#[derive(Debug)]
struct ConnectionQueue {
    pdus: VecDeque<CompoundPtr>,
    bits: Bits,
    user: UserId,
    priority: usize,
}

/// One unbounded-count, bit-limited FIFO per connection
pub struct SimpleQueue {
    queues: BTreeMap<ConnectionId, ConnectionQueue>,
    max_size: Bits,
    registry: Rc<dyn Registry>,
    size_probe: Option<Rc<dyn ProbeSink>>,
}

impl SimpleQueue {
    /// Create an empty queue set limited by the registry's per-connection size
    pub fn new(registry: Rc<dyn Registry>) -> Self {
        let max_size = registry.queue_size_limit_per_connection();
        Self { queues: BTreeMap::new(), max_size, registry, size_probe: None }
    }

    /// Report the fill level to `probe` on every change
    pub fn with_size_probe(mut self, probe: Rc<dyn ProbeSink>) -> Self {
        self.size_probe = Some(probe);
        self
    }

    fn front_of(&self, cid: ConnectionId) -> &CompoundPtr {
        match self.queues.get(&cid).and_then(|q| q.pdus.front()) {
            Some(pdu) => pdu,
            None => panic!("head of line requested for {} without PDUs or non-existent queue", cid),
        }
    }

    fn drop_queue(&mut self, cid: ConnectionId) -> ProbeOutput {
        match self.queues.remove(&cid) {
            Some(queue) => {
                probe_size(self.size_probe.as_deref(), cid, queue.priority, 0, self.max_size);
                ProbeOutput { bits: queue.bits, compounds: queue.pdus.len() as u32 }
            }
            None => ProbeOutput::default(),
        }
    }
}

impl Queue for SimpleQueue {
    fn is_accepting(&self, compound: &Compound) -> bool {
        let cid = self.registry.cid_for_pdu(compound);
        let size = compound.length_in_bits();
        match self.queues.get(&cid) {
            None => {
                trace!("accepting {} bits into new queue for {}", size, cid);
                true
            }
            Some(queue) if queue.bits + size > self.max_size => {
                debug!("not accepting {} bits: {} already holds {} bits", size, cid, queue.bits);
                false
            }
            Some(queue) => {
                trace!("accepting {} bits: {} holds {} bits", size, cid, queue.bits);
                true
            }
        }
    }

    fn put(&mut self, compound: CompoundPtr) {
        assert!(self.is_accepting(&compound), "put() has been called without is_accepting()");
        let cid = self.registry.cid_for_pdu(&compound);
        let priority = self.registry.priority_for_connection(cid);
        let user = self.registry.user_for_cid(cid);
        let queue = self.queues.entry(cid).or_insert_with(|| ConnectionQueue {
            pdus: VecDeque::new(),
            bits: 0,
            user,
            priority,
        });
        queue.bits += compound.length_in_bits();
        queue.pdus.push_back(compound);
        let bits = queue.bits;
        probe_size(self.size_probe.as_deref(), cid, priority, bits, self.max_size);
    }

    fn queued_users(&self) -> UserSet {
        self.queues.values().filter(|q| !q.pdus.is_empty()).map(|q| q.user).collect()
    }

    fn active_connections(&self) -> ConnectionSet {
        self.queues
            .iter()
            .filter(|(_, q)| !q.pdus.is_empty())
            .map(|(&cid, _)| cid)
            .collect()
    }

    fn active_connections_for_priority(&self, priority: usize) -> ConnectionSet {
        self.queues
            .iter()
            .filter(|(_, q)| !q.pdus.is_empty() && q.priority == priority)
            .map(|(&cid, _)| cid)
            .collect()
    }

    fn num_compounds_for_user(&self, user: UserId) -> u32 {
        self.queues.values().filter(|q| q.user == user).map(|q| q.pdus.len() as u32).sum()
    }

    fn num_bits_for_user(&self, user: UserId) -> Bits {
        self.queues.values().filter(|q| q.user == user).map(|q| q.bits).sum()
    }

    fn num_compounds_for_cid(&self, cid: ConnectionId) -> u32 {
        self.queues.get(&cid).map(|q| q.pdus.len() as u32).unwrap_or(0)
    }

    fn num_bits_for_cid(&self, cid: ConnectionId) -> Bits {
        self.queues.get(&cid).map(|q| q.bits).unwrap_or(0)
    }

    fn queue_status(&self) -> QueueStatusContainer {
        self.queues
            .iter()
            .map(|(&cid, q)| {
                (cid, QueueStatus { number_of_bits: q.bits, number_of_compounds: q.pdus.len() as u32 })
            })
            .collect()
    }

    fn head_of_line_pdu(&mut self, cid: ConnectionId) -> CompoundPtr {
        let max_size = self.max_size;
        let Some((queue, pdu)) = self
            .queues
            .get_mut(&cid)
            .and_then(|queue| queue.pdus.pop_front().map(|pdu| (queue, pdu)))
        else {
            panic!("head_of_line_pdu({}) called for connection without PDUs", cid);
        };
        queue.bits -= pdu.length_in_bits();
        let (bits, priority) = (queue.bits, queue.priority);
        probe_size(self.size_probe.as_deref(), cid, priority, bits, max_size);
        trace!("head_of_line_pdu({}): {} bits, {} bits left", cid, pdu.length_in_bits(), bits);
        pdu
    }

    fn head_of_line_pdu_bits(&self, cid: ConnectionId) -> Bits {
        self.front_of(cid).length_in_bits()
    }

    fn is_empty(&self) -> bool {
        self.queues.values().all(|q| q.pdus.is_empty())
    }

    fn has_queue(&self, cid: ConnectionId) -> bool {
        self.queues.contains_key(&cid)
    }

    fn queue_has_pdus(&self, cid: ConnectionId) -> bool {
        self.queues.get(&cid).map(|q| !q.pdus.is_empty()).unwrap_or(false)
    }

    fn reset_all_queues(&mut self) -> ProbeOutput {
        let cids: Vec<ConnectionId> = self.queues.keys().copied().collect();
        let mut output = ProbeOutput::default();
        for cid in cids {
            output += self.drop_queue(cid);
        }
        output
    }

    fn reset_queues(&mut self, user: UserId) -> ProbeOutput {
        let cids: Vec<ConnectionId> = self
            .queues
            .iter()
            .filter(|(_, q)| q.user == user)
            .map(|(&cid, _)| cid)
            .collect();
        let mut output = ProbeOutput::default();
        for cid in cids {
            output += self.drop_queue(cid);
        }
        output
    }

    fn reset_queue(&mut self, cid: ConnectionId) -> ProbeOutput {
        self.drop_queue(cid)
    }

    fn max_size(&self) -> Bits {
        self.max_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compound::CompoundFactory;
    use crate::probe::{ProbeRecorder, StatisticsType};
    use crate::queue::test_support::registry;

    #[test]
    fn test_admission_limit_is_per_connection() {
        let factory = CompoundFactory::new();
        let mut queue = SimpleQueue::new(registry(128));
        queue.put(factory.create(ConnectionId(1), 64));
        queue.put(factory.create(ConnectionId(1), 32));
        assert!(!queue.is_accepting(&factory.create(ConnectionId(1), 128)));
        assert!(queue.is_accepting(&factory.create(ConnectionId(1), 32)));
        assert!(queue.is_accepting(&factory.create(ConnectionId(2), 128)));
    }

    #[test]
    fn test_new_connection_is_always_accepted() {
        let factory = CompoundFactory::new();
        let queue = SimpleQueue::new(registry(16));
        assert!(queue.is_accepting(&factory.create(ConnectionId(3), 1000)));
    }

    #[test]
    #[should_panic(expected = "without is_accepting")]
    fn test_put_beyond_limit_panics() {
        let factory = CompoundFactory::new();
        let mut queue = SimpleQueue::new(registry(100));
        queue.put(factory.create(ConnectionId(1), 80));
        queue.put(factory.create(ConnectionId(1), 40));
    }

    #[test]
    fn test_bits_are_conserved() {
        let factory = CompoundFactory::new();
        let mut queue = SimpleQueue::new(registry(10_000));
        let sizes = [100, 40, 250, 8];
        for bits in sizes {
            queue.put(factory.create(ConnectionId(2), bits));
        }
        let mut dequeued = 0;
        let first = queue.head_of_line_pdu(ConnectionId(2));
        dequeued += first.bits;
        assert_eq!(first.bits, 100);
        assert_eq!(queue.head_of_line_pdu_bits(ConnectionId(2)), 40);
        dequeued += queue.head_of_line_pdu(ConnectionId(2)).bits;
        assert_eq!(dequeued + queue.num_bits_for_cid(ConnectionId(2)), sizes.iter().sum::<u32>());
        assert_eq!(queue.num_compounds_for_cid(ConnectionId(2)), 2);
    }

    #[test]
    #[should_panic(expected = "without PDUs")]
    fn test_head_of_line_on_unknown_connection_panics() {
        let mut queue = SimpleQueue::new(registry(100));
        queue.head_of_line_pdu(ConnectionId(4));
    }

    #[test]
    fn test_active_sets_and_user_accounting() {
        let factory = CompoundFactory::new();
        let mut queue = SimpleQueue::new(registry(10_000));
        queue.put(factory.create(ConnectionId(1), 10));
        queue.put(factory.create(ConnectionId(3), 20));
        queue.put(factory.create(ConnectionId(6), 30));
        assert_eq!(queue.queued_users(), UserSet::from([UserId(1), UserId(2)]));
        assert_eq!(queue.active_connections_for_priority(1), ConnectionSet::from([ConnectionId(6)]));
        assert_eq!(queue.num_bits_for_user(UserId(1)), 30);
        assert_eq!(queue.num_compounds_for_user(UserId(2)), 1);
        let filter = ConnectionSet::from([ConnectionId(1), ConnectionId(2), ConnectionId(6)]);
        assert_eq!(queue.filter_queued_cids(&filter), ConnectionSet::from([ConnectionId(1), ConnectionId(6)]));

        queue.head_of_line_pdu(ConnectionId(6));
        assert!(queue.has_queue(ConnectionId(6)));
        assert!(!queue.queue_has_pdus(ConnectionId(6)));
        assert_eq!(queue.queued_users(), UserSet::from([UserId(1)]));
    }

    #[test]
    fn test_resets() {
        let factory = CompoundFactory::new();
        let mut queue = SimpleQueue::new(registry(10_000));
        queue.put(factory.create(ConnectionId(1), 10));
        queue.put(factory.create(ConnectionId(2), 20));
        queue.put(factory.create(ConnectionId(2), 5));
        queue.put(factory.create(ConnectionId(5), 30));

        assert_eq!(queue.reset_queue(ConnectionId(4)), ProbeOutput::default());
        assert_eq!(queue.reset_queues(UserId(1)), ProbeOutput { bits: 35, compounds: 3 });
        assert_eq!(queue.reset_queues(UserId(1)), ProbeOutput::default());
        assert!(!queue.has_queue(ConnectionId(1)));
        assert_eq!(queue.reset_all_queues(), ProbeOutput { bits: 30, compounds: 1 });
        assert!(queue.is_empty());
    }

    #[test]
    fn test_size_probe_reports_fill_level() {
        let factory = CompoundFactory::new();
        let probe = Rc::new(ProbeRecorder::new("scheduler.queue.size", StatisticsType::Samples));
        let mut queue = SimpleQueue::new(registry(200)).with_size_probe(probe.clone());
        queue.put(factory.create(ConnectionId(6), 50));
        queue.put(factory.create(ConnectionId(6), 50));
        let samples = probe.samples();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[1], ("cid=6,MAC.QoSClass=1".to_string(), 0.5));
    }
}
