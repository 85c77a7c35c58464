//! Protocol data units handled by the scheduler
//!
//! A [`Compound`] is one PDU waiting in a queue or placed into a resource map.
//! Compounds are shared between the queue, the map and the bursts handed to the
//! MAC, so they travel as reference-counted [`CompoundPtr`]s.

use crate::Bits;
use bitflags::bitflags;
use common::types::ConnectionId;
use std::cell::Cell;
use std::fmt;
use std::rc::Rc;

/// Unique identifier of a compound within one simulation run
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CompoundId(pub u64);

bitflags! {
    /// Segmentation flags carried in a segment header
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SegmentFlags: u8 {
        /// Segment starts with the first bit of an SDU
        const BEGIN = 0b01;
        /// Segment ends with the last bit of an SDU
        const END = 0b10;
    }
}

/// Part of one SDU carried inside a segment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SduPiece {
    /// SDU the bits were taken from
    pub sdu: CompoundId,
    /// Offset of the first carried bit within the SDU
    pub offset: Bits,
    /// Number of carried bits
    pub bits: Bits,
}

/// Header of a segment produced by the segmenting queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentHeader {
    /// Per-connection sequence number
    pub sequence_number: u64,
    /// Begin/End flags
    pub flags: SegmentFlags,
    /// Fixed header plus extension headers
    pub header_bits: Bits,
    /// Payload bits
    pub data_bits: Bits,
    /// Padding bits appended to reach the requested size
    pub padding_bits: Bits,
    /// SDU pieces in transmission order
    pub pieces: Vec<SduPiece>,
}

impl SegmentHeader {
    /// True if the segment starts an SDU
    pub fn begin_flag(&self) -> bool {
        self.flags.contains(SegmentFlags::BEGIN)
    }

    /// True if the segment ends an SDU
    pub fn end_flag(&self) -> bool {
        self.flags.contains(SegmentFlags::END)
    }
}

/// One protocol data unit
#[derive(Debug, Clone, PartialEq)]
pub struct Compound {
    /// Unique identifier
    pub id: CompoundId,
    /// Connection the PDU belongs to
    pub cid: ConnectionId,
    /// Payload length in bits (segments: header + data + padding)
    pub bits: Bits,
    /// Segment header, if the compound was produced by segmentation
    pub segment: Option<SegmentHeader>,
}

impl Compound {
    /// Length on the air in bits
    pub fn length_in_bits(&self) -> Bits {
        self.bits
    }
}

impl fmt::Display for Compound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Compound(#{}, {}, {} bits)", self.id.0, self.cid, self.bits)
    }
}

/// Shared handle to a compound
pub type CompoundPtr = Rc<Compound>;

/// Creates compounds with run-unique identifiers
///
/// Owned by the simulation context and shared by handle with the queues that
/// create segments; there is no process-wide counter.
#[derive(Debug, Default)]
pub struct CompoundFactory {
    next_id: Cell<u64>,
}

impl CompoundFactory {
    /// Create a new factory starting at id 0
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&self) -> CompoundId {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        CompoundId(id)
    }

    /// Create a plain PDU of `bits` length on connection `cid`
    pub fn create(&self, cid: ConnectionId, bits: Bits) -> CompoundPtr {
        Rc::new(Compound { id: self.next_id(), cid, bits, segment: None })
    }

    /// Create a segment compound from a finished header
    pub fn create_segment(&self, cid: ConnectionId, header: SegmentHeader) -> CompoundPtr {
        let bits = header.header_bits + header.data_bits + header.padding_bits;
        Rc::new(Compound { id: self.next_id(), cid, bits, segment: Some(header) })
    }

    /// Number of compounds created so far
    pub fn created(&self) -> u64 {
        self.next_id.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_factory_assigns_unique_ids() {
        let factory = CompoundFactory::new();
        let a = factory.create(ConnectionId(1), 100);
        let b = factory.create(ConnectionId(1), 50);
        assert_ne!(a.id, b.id);
        assert_eq!(factory.created(), 2);
        assert_eq!(a.length_in_bits(), 100);
    }

    #[test]
    fn test_segment_length_includes_overhead() {
        let factory = CompoundFactory::new();
        let header = SegmentHeader {
            sequence_number: 3,
            flags: SegmentFlags::BEGIN | SegmentFlags::END,
            header_bits: 16,
            data_bits: 40,
            padding_bits: 8,
            pieces: vec![],
        };
        let segment = factory.create_segment(ConnectionId(2), header);
        assert_eq!(segment.bits, 64);
        let header = segment.segment.as_ref().unwrap();
        assert!(header.begin_flag());
        assert!(header.end_flag());
    }
}
