//! Per-connection PDU queues
//!
//! Strategies pull head-of-line PDUs (or, with [`SegmentingQueue`], segments of
//! an exact size) from one FIFO per connection. Admission is limited per
//! connection by the registry's queue size limit.

pub mod segmenting;
pub mod simple;

pub use segmenting::{SegmentingQueue, SegmentingQueueConfig};
pub use simple::SimpleQueue;

use crate::compound::{Compound, CompoundPtr};
use crate::probe::{put_if_observed, ProbeSink};
use crate::types::{Bits, ConnectionSet, ProbeOutput, QueueStatus, UserSet};
use common::types::{ConnectionId, UserId};
use std::collections::BTreeMap;

/// Queue status of every known connection
pub type QueueStatusContainer = BTreeMap<ConnectionId, QueueStatus>;

/// Queue of PDUs per connection
pub trait Queue {
    /// True if `compound` fits below the per-connection limit
    ///
    /// Always true for a connection without a queue yet.
    fn is_accepting(&self, compound: &Compound) -> bool;

    /// Enqueue; panics unless `is_accepting` holds
    fn put(&mut self, compound: CompoundPtr);

    /// Users with at least one PDU queued
    fn queued_users(&self) -> UserSet;

    /// Connections with at least one PDU queued
    fn active_connections(&self) -> ConnectionSet;

    /// Connections of `priority` with at least one PDU queued
    fn active_connections_for_priority(&self, priority: usize) -> ConnectionSet;

    /// PDUs queued for `user`
    fn num_compounds_for_user(&self, user: UserId) -> u32;

    /// Bits queued for `user`
    fn num_bits_for_user(&self, user: UserId) -> Bits;

    /// PDUs queued for `cid`
    fn num_compounds_for_cid(&self, cid: ConnectionId) -> u32;

    /// Bits queued for `cid`, including segmentation overhead where applicable
    fn num_bits_for_cid(&self, cid: ConnectionId) -> Bits;

    /// Status of every known connection
    fn queue_status(&self) -> QueueStatusContainer;

    /// Remove and return the head-of-line PDU; panics if there is none
    fn head_of_line_pdu(&mut self, cid: ConnectionId) -> CompoundPtr;

    /// Size of the head-of-line PDU; panics if there is none
    fn head_of_line_pdu_bits(&self, cid: ConnectionId) -> Bits;

    /// True if no connection has PDUs
    fn is_empty(&self) -> bool;

    /// True if a queue for `cid` exists, empty or not
    fn has_queue(&self, cid: ConnectionId) -> bool;

    /// True if `cid` has PDUs queued
    fn queue_has_pdus(&self, cid: ConnectionId) -> bool;

    /// Subset of `connections` with PDUs queued
    fn filter_queued_cids(&self, connections: &ConnectionSet) -> ConnectionSet {
        connections.iter().copied().filter(|cid| self.queue_has_pdus(*cid)).collect()
    }

    /// Drop every queue
    fn reset_all_queues(&mut self) -> ProbeOutput;

    /// Drop the queues of all connections of `user`
    fn reset_queues(&mut self, user: UserId) -> ProbeOutput;

    /// Drop the queue of `cid`; zero output if there is none
    fn reset_queue(&mut self, cid: ConnectionId) -> ProbeOutput;

    /// Admission limit per connection
    fn max_size(&self) -> Bits;

    /// True if `head_of_line_pdu_segment` is available
    fn supports_dynamic_segmentation(&self) -> bool {
        false
    }

    /// Segment of exactly `requested_bits` (header, data and padding)
    fn head_of_line_pdu_segment(&mut self, cid: ConnectionId, requested_bits: Bits) -> CompoundPtr {
        panic!(
            "head_of_line_pdu_segment({}, {}) called on a queue without dynamic segmentation",
            cid, requested_bits
        )
    }

    /// Smallest segment a strategy may request
    fn minimum_segment_size(&self) -> Bits {
        0
    }
}

/// Report the fill level of a connection's queue
pub(crate) fn probe_size(
    sink: Option<&dyn ProbeSink>,
    cid: ConnectionId,
    priority: usize,
    bits: Bits,
    max_size: Bits,
) {
    let level = if max_size == 0 { 0.0 } else { bits as f64 / max_size as f64 };
    put_if_observed(sink, level, &[("cid", cid.value() as i64), ("MAC.QoSClass", priority as i64)]);
}
