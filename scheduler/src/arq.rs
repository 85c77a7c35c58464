//! Go-Back-N ARQ window
//!
//! The sender keeps at most `window_size` unacknowledged PDUs in flight.
//! PDUs handed over while the window is full wait in order until an ACK
//! moves the lower window edge. A NAK or a timeout sends everything from
//! the first unacknowledged PDU again. Sequence numbers run modulo
//! `sequence_number_size`, which must be at least twice the window.

use crate::compound::CompoundPtr;
use crate::SchedulerError;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::{debug, trace};

pub type SequenceNumber = u32;

fn default_window_size() -> u32 {
    8
}

fn default_sequence_number_size() -> u32 {
    16
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GoBackNConfig {
    #[serde(default = "default_window_size")]
    pub window_size: u32,
    #[serde(default = "default_sequence_number_size")]
    pub sequence_number_size: u32,
}

impl Default for GoBackNConfig {
    fn default() -> Self {
        Self { window_size: default_window_size(), sequence_number_size: default_sequence_number_size() }
    }
}

/// A PDU handed to the lower layer
#[derive(Debug, Clone, PartialEq)]
pub struct ArqFrame {
    pub sn: SequenceNumber,
    pub pdu: CompoundPtr,
    /// Transmissions so far, including this one
    pub transmissions: u32,
}

/// Receiver answer to an I frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Feedback {
    /// Frame delivered in order
    Ack(SequenceNumber),
    /// Out of sequence; resend from this number
    Nak(SequenceNumber),
}

#[derive(Debug)]
pub struct GoBackN {
    window_size: u32,
    range: u32,
    /// Next sequence number to assign, not wrapped
    ns: u64,
    /// Lowest unacknowledged sequence number, not wrapped
    la: u64,
    pending: VecDeque<CompoundPtr>,
    sent: VecDeque<ArqFrame>,
    outgoing: VecDeque<ArqFrame>,
}

impl GoBackN {
    pub fn new(config: &GoBackNConfig) -> Result<Self, SchedulerError> {
        if config.window_size < 2 {
            return Err(SchedulerError::InvalidConfiguration(format!(
                "window size {} below 2",
                config.window_size
            )));
        }
        if config.sequence_number_size < 2 * config.window_size {
            return Err(SchedulerError::InvalidConfiguration(format!(
                "sequence number size {} too small for window {}",
                config.sequence_number_size, config.window_size
            )));
        }
        Ok(Self {
            window_size: config.window_size,
            range: config.sequence_number_size,
            ns: 0,
            la: 0,
            pending: VecDeque::new(),
            sent: VecDeque::new(),
            outgoing: VecDeque::new(),
        })
    }

    fn wrap(&self, sn: u64) -> SequenceNumber {
        (sn % u64::from(self.range)) as SequenceNumber
    }

    fn in_flight(&self) -> u64 {
        self.ns - self.la
    }

    /// True if a new PDU would be transmitted right away
    pub fn has_capacity(&self) -> bool {
        self.in_flight() < u64::from(self.window_size) && !self.retransmitting()
    }

    fn retransmitting(&self) -> bool {
        self.outgoing.iter().any(|f| f.transmissions > 1)
    }

    fn transmit(&mut self, pdu: CompoundPtr) -> SequenceNumber {
        let sn = self.wrap(self.ns);
        self.ns += 1;
        let frame = ArqFrame { sn, pdu, transmissions: 1 };
        trace!("sending I frame {}", sn);
        self.sent.push_back(frame.clone());
        self.outgoing.push_back(frame);
        sn
    }

    /// Hand over a PDU; returns its sequence number if it went out at once
    pub fn send(&mut self, pdu: CompoundPtr) -> Option<SequenceNumber> {
        if self.has_capacity() && self.pending.is_empty() {
            Some(self.transmit(pdu))
        } else {
            trace!("window full, {} PDUs waiting", self.pending.len() + 1);
            self.pending.push_back(pdu);
            None
        }
    }

    fn fill_window(&mut self) {
        while self.has_capacity() {
            let Some(pdu) = self.pending.pop_front() else {
                break;
            };
            self.transmit(pdu);
        }
    }

    /// Offset of `sn` above the window edge if it is in flight
    fn unacked_offset(&self, sn: SequenceNumber) -> Option<u64> {
        let edge = u64::from(self.wrap(self.la));
        let range = u64::from(self.range);
        let offset = (u64::from(sn) + range - edge) % range;
        (offset < self.in_flight()).then_some(offset)
    }

    fn acknowledge_up_to(&mut self, offset: u64) -> usize {
        let count = (offset + 1) as usize;
        self.la += offset + 1;
        let acked = self.sent.drain(..count.min(self.sent.len())).count();
        let first_unacked = self.wrap(self.la);
        let range = u64::from(self.range);
        let edge = u64::from(first_unacked);
        let window = self.in_flight();
        self.outgoing.retain(|f| (u64::from(f.sn) + range - edge) % range < window);
        acked
    }

    /// Cumulative ACK of `sn` and all frames before it; returns the frames acknowledged
    pub fn on_ack(&mut self, sn: SequenceNumber) -> usize {
        let Some(offset) = self.unacked_offset(sn) else {
            debug!("duplicate or unknown ACK {}", sn);
            return 0;
        };
        let acked = self.acknowledge_up_to(offset);
        self.fill_window();
        acked
    }

    /// NAK for `sn`: frames before it are acknowledged, it and all later ones are sent again
    pub fn on_nak(&mut self, sn: SequenceNumber) {
        if let Some(offset) = self.unacked_offset(sn) {
            if offset > 0 {
                self.acknowledge_up_to(offset - 1);
            }
        } else if self.wrap(self.la) != sn {
            debug!("NAK {} outside the window", sn);
            return;
        }
        self.go_back();
    }

    /// Resend timer expired: send all unacknowledged frames again
    pub fn on_timeout(&mut self) {
        assert!(!self.sent.is_empty(), "timeout without frames in flight");
        self.go_back();
    }

    fn go_back(&mut self) {
        self.outgoing.clear();
        for frame in &mut self.sent {
            frame.transmissions += 1;
            self.outgoing.push_back(frame.clone());
        }
        debug!("going back to {}: {} frames to resend", self.wrap(self.la), self.outgoing.len());
        self.fill_window();
    }

    /// Next frame for the lower layer, retransmissions first
    pub fn next_outgoing(&mut self) -> Option<ArqFrame> {
        self.outgoing.pop_front()
    }

    /// Frames sent and not acknowledged, oldest first
    pub fn sent_pdus(&self) -> impl Iterator<Item = &ArqFrame> {
        self.sent.iter()
    }

    /// PDUs waiting for room in the window
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

/// In-order receiver side of Go-Back-N
#[derive(Debug)]
pub struct GoBackNReceiver {
    range: u32,
    nr: u32,
    delivered: Vec<CompoundPtr>,
}

impl GoBackNReceiver {
    pub fn new(config: &GoBackNConfig) -> Self {
        Self { range: config.sequence_number_size, nr: 0, delivered: Vec::new() }
    }

    /// Accept the next expected frame, reject anything else
    pub fn on_frame(&mut self, frame: &ArqFrame) -> Feedback {
        if frame.sn != self.nr {
            trace!("discarding out-of-sequence frame {}, expecting {}", frame.sn, self.nr);
            return Feedback::Nak(self.nr);
        }
        self.delivered.push(frame.pdu.clone());
        self.nr = (self.nr + 1) % self.range;
        Feedback::Ack(frame.sn)
    }

    pub fn delivered(&self) -> &[CompoundPtr] {
        &self.delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compound::CompoundFactory;
    use common::types::ConnectionId;

    fn arq(window: u32) -> GoBackN {
        GoBackN::new(&GoBackNConfig { window_size: window, sequence_number_size: 2 * window }).unwrap()
    }

    fn pdus(n: usize) -> Vec<CompoundPtr> {
        let factory = CompoundFactory::new();
        (0..n).map(|_| factory.create(ConnectionId(1), 100)).collect()
    }

    #[test]
    fn test_window_blocks_extra_pdu() {
        let mut sender = arq(4);
        let results: Vec<Option<SequenceNumber>> = pdus(5).into_iter().map(|p| sender.send(p)).collect();
        assert_eq!(results, vec![Some(0), Some(1), Some(2), Some(3), None]);
        assert_eq!(sender.sent_pdus().count(), 4);
        assert_eq!(sender.pending(), 1);
        assert!(!sender.has_capacity());

        assert_eq!(sender.on_ack(0), 1);
        assert_eq!(sender.pending(), 0);
        let sns: Vec<SequenceNumber> = sender.sent_pdus().map(|f| f.sn).collect();
        assert_eq!(sns, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_cumulative_ack_and_duplicates() {
        let mut sender = arq(3);
        for pdu in pdus(3) {
            sender.send(pdu);
        }
        assert_eq!(sender.on_ack(1), 2);
        assert_eq!(sender.on_ack(0), 0);
        assert_eq!(sender.on_ack(2), 1);
        assert!(sender.sent_pdus().next().is_none());
        assert!(sender.has_capacity());
    }

    #[test]
    fn test_sequence_numbers_wrap() {
        let mut sender = arq(2);
        let mut receiver = GoBackNReceiver::new(&GoBackNConfig { window_size: 2, sequence_number_size: 4 });
        let mut seen = Vec::new();
        for pdu in pdus(6) {
            sender.send(pdu);
            while let Some(frame) = sender.next_outgoing() {
                seen.push(frame.sn);
                if let Feedback::Ack(sn) = receiver.on_frame(&frame) {
                    sender.on_ack(sn);
                }
            }
        }
        assert_eq!(seen, vec![0, 1, 2, 3, 0, 1]);
        assert_eq!(receiver.delivered().len(), 6);
    }

    #[test]
    fn test_nak_goes_back() {
        let mut sender = arq(4);
        let mut receiver = GoBackNReceiver::new(&GoBackNConfig { window_size: 4, sequence_number_size: 8 });
        for pdu in pdus(3) {
            sender.send(pdu);
        }
        let first = sender.next_outgoing().unwrap();
        assert_eq!(receiver.on_frame(&first), Feedback::Ack(0));
        sender.on_ack(0);
        // frame 1 is lost
        sender.next_outgoing();
        let third = sender.next_outgoing().unwrap();
        assert_eq!(receiver.on_frame(&third), Feedback::Nak(1));

        sender.on_nak(1);
        assert!(!sender.has_capacity());
        let resent: Vec<(SequenceNumber, u32)> =
            std::iter::from_fn(|| sender.next_outgoing()).map(|f| (f.sn, f.transmissions)).collect();
        assert_eq!(resent, vec![(1, 2), (2, 2)]);
        assert!(sender.has_capacity());
    }

    #[test]
    fn test_timeout_resends_all() {
        let mut sender = arq(4);
        for pdu in pdus(2) {
            sender.send(pdu);
        }
        while sender.next_outgoing().is_some() {}
        sender.on_timeout();
        let resent: Vec<SequenceNumber> = std::iter::from_fn(|| sender.next_outgoing()).map(|f| f.sn).collect();
        assert_eq!(resent, vec![0, 1]);
    }

    #[test]
    fn test_invalid_window() {
        let config = GoBackNConfig { window_size: 4, sequence_number_size: 6 };
        assert!(matches!(GoBackN::new(&config), Err(SchedulerError::InvalidConfiguration(_))));
        let config = GoBackNConfig { window_size: 1, sequence_number_size: 6 };
        assert!(GoBackN::new(&config).is_err());
    }
}
