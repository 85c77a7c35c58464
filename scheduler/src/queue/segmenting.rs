//! FIFO queue per connection that cuts segments of a requested size
//!
//! A segment carries a fixed header, one extension header for every further
//! SDU it starts, the SDU data and optional padding. Queued bit counts include
//! the header overhead the remaining data will cost.

use super::{probe_size, Queue, QueueStatusContainer};
use crate::compound::{Compound, CompoundFactory, CompoundPtr, SduPiece, SegmentFlags, SegmentHeader};
use crate::interfaces::Registry;
use crate::probe::{put_if_observed, ProbeSink};
use crate::types::{Bits, ConnectionSet, ProbeOutput, QueueStatus, UserSet};
use common::types::{ConnectionId, UserId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::rc::Rc;
use tracing::{debug, trace};

/// Header sizes and segmentation limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentingQueueConfig {
    /// Header bits present in every segment
    #[serde(default = "default_fixed_header_size")]
    pub fixed_header_size: Bits,
    /// Header bits for every additional SDU in a segment
    #[serde(default = "default_extension_header_size")]
    pub extension_header_size: Bits,
    /// Fill segments up to the requested size
    #[serde(default)]
    pub use_padding: bool,
    /// Smallest segment that may be requested
    #[serde(default = "default_minimum_segment_size")]
    pub minimum_segment_size: Bits,
}

fn default_fixed_header_size() -> Bits {
    16
}

fn default_extension_header_size() -> Bits {
    8
}

fn default_minimum_segment_size() -> Bits {
    32
}

impl Default for SegmentingQueueConfig {
    fn default() -> Self {
        Self {
            fixed_header_size: default_fixed_header_size(),
            extension_header_size: default_extension_header_size(),
            use_padding: false,
            minimum_segment_size: default_minimum_segment_size(),
        }
    }
}

#[derive(Debug)]
struct ConnectionQueue {
    pdus: VecDeque<CompoundPtr>,
    /// SDU bits still to send
    bits_netto: Bits,
    /// `bits_netto` plus the header overhead
    bits_brutto: Bits,
    /// Bits of the front SDU already sent in earlier segments
    front_segment_sent_bits: Bits,
    current_segment_number: u64,
    user: UserId,
    priority: usize,
}

/// Queue producing exactly sized segments on request
pub struct SegmentingQueue {
    config: SegmentingQueueConfig,
    queues: BTreeMap<ConnectionId, ConnectionQueue>,
    max_size: Bits,
    registry: Rc<dyn Registry>,
    factory: Rc<CompoundFactory>,
    size_probe: Option<Rc<dyn ProbeSink>>,
    overhead_probe: Option<Rc<dyn ProbeSink>>,
}

impl SegmentingQueue {
    /// Create an empty queue set; segments are created by `factory`
    pub fn new(config: SegmentingQueueConfig, registry: Rc<dyn Registry>, factory: Rc<CompoundFactory>) -> Self {
        let max_size = registry.queue_size_limit_per_connection();
        Self {
            config,
            queues: BTreeMap::new(),
            max_size,
            registry,
            factory,
            size_probe: None,
            overhead_probe: None,
        }
    }

    /// Report the fill level to `probe` on every change
    pub fn with_size_probe(mut self, probe: Rc<dyn ProbeSink>) -> Self {
        self.size_probe = Some(probe);
        self
    }

    /// Report the header share of every produced segment to `probe`
    pub fn with_overhead_probe(mut self, probe: Rc<dyn ProbeSink>) -> Self {
        self.overhead_probe = Some(probe);
        self
    }

    /// Configuration in use
    pub fn config(&self) -> &SegmentingQueueConfig {
        &self.config
    }

    fn brutto(&self, netto: Bits, pdus: usize) -> Bits {
        if pdus == 0 {
            0
        } else {
            netto + self.config.fixed_header_size + (pdus as Bits - 1) * self.config.extension_header_size
        }
    }

    fn drop_queue(&mut self, cid: ConnectionId) -> ProbeOutput {
        match self.queues.remove(&cid) {
            Some(queue) => {
                probe_size(self.size_probe.as_deref(), cid, queue.priority, 0, self.max_size);
                ProbeOutput { bits: queue.bits_brutto, compounds: queue.pdus.len() as u32 }
            }
            None => ProbeOutput::default(),
        }
    }
}

impl Queue for SegmentingQueue {
    fn is_accepting(&self, compound: &Compound) -> bool {
        let cid = self.registry.cid_for_pdu(compound);
        match self.queues.get(&cid) {
            None => true,
            Some(queue) => {
                // headers do not count against the limit
                let accepting = queue.bits_netto + compound.length_in_bits() <= self.max_size;
                if !accepting {
                    debug!(
                        "not accepting {} bits: {} already holds {} data bits",
                        compound.length_in_bits(),
                        cid,
                        queue.bits_netto
                    );
                }
                accepting
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
            bits_netto: 0,
            bits_brutto: 0,
            front_segment_sent_bits: 0,
            current_segment_number: 0,
            user,
            priority,
        });
        queue.bits_netto += compound.length_in_bits();
        queue.pdus.push_back(compound);
        let (netto, pdus) = (queue.bits_netto, queue.pdus.len());
        let brutto = self.brutto(netto, pdus);
        if let Some(queue) = self.queues.get_mut(&cid) {
            queue.bits_brutto = brutto;
        }
        probe_size(self.size_probe.as_deref(), cid, priority, brutto, self.max_size);
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
        self.queues.values().filter(|q| q.user == user).map(|q| q.bits_brutto).sum()
    }

    fn num_compounds_for_cid(&self, cid: ConnectionId) -> u32 {
        self.queues.get(&cid).map(|q| q.pdus.len() as u32).unwrap_or(0)
    }

    fn num_bits_for_cid(&self, cid: ConnectionId) -> Bits {
        self.queues.get(&cid).map(|q| q.bits_brutto).unwrap_or(0)
    }

    fn queue_status(&self) -> QueueStatusContainer {
        self.queues
            .iter()
            .map(|(&cid, q)| {
                (cid, QueueStatus { number_of_bits: q.bits_brutto, number_of_compounds: q.pdus.len() as u32 })
            })
            .collect()
    }

    fn head_of_line_pdu(&mut self, cid: ConnectionId) -> CompoundPtr {
        panic!("head_of_line_pdu({}) is not supported by the segmenting queue; request a segment", cid)
    }

    /// Everything queued for `cid` fits into a segment of this size
    fn head_of_line_pdu_bits(&self, cid: ConnectionId) -> Bits {
        assert!(self.queue_has_pdus(cid), "head_of_line_pdu_bits({}) called for connection without PDUs", cid);
        self.num_bits_for_cid(cid)
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

    fn supports_dynamic_segmentation(&self) -> bool {
        true
    }

    /// Cut a segment of `requested_bits`
    ///
    /// If `requested_bits` does not exceed the fixed header, the header is
    /// charged `requested_bits - 1` so that one data bit is carried.
    fn head_of_line_pdu_segment(&mut self, cid: ConnectionId, requested_bits: Bits) -> CompoundPtr {
        assert!(
            self.queue_has_pdus(cid),
            "head_of_line_pdu_segment({}, {}) called for connection without PDUs",
            cid,
            requested_bits
        );
        assert!(
            requested_bits >= self.config.minimum_segment_size.max(1),
            "requested segment of {} bits is below the minimum segment size {}",
            requested_bits,
            self.config.minimum_segment_size
        );
        let extension = self.config.extension_header_size;
        let mut header_bits = self.config.fixed_header_size.min(requested_bits - 1);
        let mut data_bits: Bits = 0;
        let mut pieces = Vec::new();

        let Some(queue) = self.queues.get_mut(&cid) else {
            panic!("no queue for {}", cid);
        };
        let sequence_number = queue.current_segment_number;
        queue.current_segment_number += 1;
        let mut flags = SegmentFlags::empty();
        if queue.front_segment_sent_bits == 0 {
            flags |= SegmentFlags::BEGIN;
        }

        while header_bits + data_bits < requested_bits {
            let Some(front) = queue.pdus.front() else {
                break;
            };
            let remaining = front.length_in_bits() - queue.front_segment_sent_bits;
            let capacity = requested_bits - header_bits - data_bits;
            if capacity >= remaining {
                pieces.push(SduPiece { sdu: front.id, offset: queue.front_segment_sent_bits, bits: remaining });
                data_bits += remaining;
                queue.pdus.pop_front();
                queue.front_segment_sent_bits = 0;
                queue.bits_netto -= remaining;
                if header_bits + data_bits + extension < requested_bits && !queue.pdus.is_empty() {
                    header_bits += extension;
                } else {
                    break;
                }
            } else {
                pieces.push(SduPiece { sdu: front.id, offset: queue.front_segment_sent_bits, bits: capacity });
                data_bits += capacity;
                queue.front_segment_sent_bits += capacity;
                queue.bits_netto -= capacity;
                assert!(
                    queue.front_segment_sent_bits < front.length_in_bits(),
                    "front segment sent bits exceed the front PDU"
                );
            }
        }

        if queue.front_segment_sent_bits == 0 {
            flags |= SegmentFlags::END;
        }
        let (netto, pdus, priority) = (queue.bits_netto, queue.pdus.len(), queue.priority);
        let brutto = self.brutto(netto, pdus);
        if let Some(queue) = self.queues.get_mut(&cid) {
            queue.bits_brutto = brutto;
        }
        probe_size(self.size_probe.as_deref(), cid, priority, brutto, self.max_size);

        let padding_bits = if self.config.use_padding { requested_bits - header_bits - data_bits } else { 0 };
        assert!(header_bits + data_bits + padding_bits <= requested_bits, "segment exceeds the requested size");
        put_if_observed(
            self.overhead_probe.as_deref(),
            header_bits as f64 / requested_bits as f64,
            &[("cid", cid.value() as i64)],
        );
        trace!(
            "head_of_line_pdu_segment({}, {}): header={} data={} padding={} sn={}",
            cid,
            requested_bits,
            header_bits,
            data_bits,
            padding_bits,
            sequence_number
        );
        let header = SegmentHeader { sequence_number, flags, header_bits, data_bits, padding_bits, pieces };
        self.factory.create_segment(cid, header)
    }

    fn minimum_segment_size(&self) -> Bits {
        self.config.minimum_segment_size
    }
}
