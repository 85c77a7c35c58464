//! Link adaptation for persistent reservations
//!
//! Decides how many resource blocks a PDU needs in a free run and with which
//! PHY mode. The effective SINR over a set of blocks is the mean of the
//! per-block linear SINRs at the nominal transmit power.

use super::grid::SearchResult;
use crate::interfaces::{PhyModeMapper, Registry};
use crate::phy_mode::PhyMode;
use crate::types::{Bits, SchedulerSpot};
use common::types::{ConnectionId, Power, Ratio, UserId};
use common::utils::SimTime;
use serde::{Deserialize, Serialize};
use std::rc::Rc;
use tracing::trace;

/// Outcome of fitting a PDU into a run of blocks
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CanFitResult {
    pub fits: bool,
    /// Blocks needed at `phy_mode`
    pub length: usize,
    pub phy_mode: PhyMode,
    pub sinr: Ratio,
    pub tx_power: Power,
}

/// Where transmission blocks may start inside a free run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkAdaptationMode {
    /// Only at the start of each run
    AtStart,
    /// At every block of each run
    All,
}

/// Sizes transmission blocks for the resource grid
pub trait LinkAdaptation {
    /// Candidate transmission blocks for `pdu_size` bits of `cid` in `runs`
    fn set_tb_sizes(&self, runs: &[SearchResult], cid: ConnectionId, pdu_size: Bits) -> Vec<SearchResult>;

    /// Check whether `pdu_size` bits fit into `length` blocks at `start`
    fn can_fit(&self, start: usize, length: usize, frame: usize, cid: ConnectionId, pdu_size: Bits) -> CanFitResult;
}

/// Registry-backed link adaptation
pub struct LinkAdaptor {
    registry: Rc<dyn Registry>,
    slot_duration: SimTime,
    spot: SchedulerSpot,
    mode: LinkAdaptationMode,
}

impl LinkAdaptor {
    pub fn new(registry: Rc<dyn Registry>, slot_duration: SimTime, spot: SchedulerSpot, mode: LinkAdaptationMode) -> Self {
        assert!(slot_duration > 0.0, "need positive slot duration");
        Self { registry, slot_duration, spot, mode }
    }

    /// Blocks needed for `pdu_size` bits at `phy_mode`
    pub fn tb_size(&self, pdu_size: Bits, phy_mode: &PhyMode) -> usize {
        if !phy_mode.is_valid() {
            return usize::MAX;
        }
        let per_block = phy_mode.bit_capacity_fractional(self.slot_duration);
        (pdu_size as f64 / per_block - 1e-9).ceil().max(0.0) as usize
    }

    /// Most robust mode that needs no more blocks than `current`
    pub fn more_robust_mcs(&self, pdu_size: Bits, current: PhyMode) -> PhyMode {
        let mapper = self.registry.phy_mode_mapper();
        let needed = self.tb_size(pdu_size, &current);
        (0..current.index)
            .rev()
            .map(|index| mapper.phy_mode_for_index(index))
            .take_while(|mode| self.tb_size(pdu_size, mode) <= needed)
            .last()
            .unwrap_or(current)
    }

    fn tx_power(&self, user: UserId) -> Power {
        match self.spot {
            SchedulerSpot::DlMaster => self.registry.power_capabilities(None).nominal_per_subband,
            SchedulerSpot::UlMaster | SchedulerSpot::UlSlave => {
                self.registry.power_capabilities(Some(user)).nominal_per_subband
            }
        }
    }

    fn effective_sinr(&self, user: UserId, blocks: std::ops::Range<usize>, frame: usize, tx_power: Power) -> Ratio {
        let frame_nr = frame as u32;
        let qualities = if self.spot == SchedulerSpot::DlMaster {
            self.registry.channel_qualities_on_downlink(user, frame_nr)
        } else {
            self.registry.channel_qualities_on_uplink(user, frame_nr)
        };
        let count = blocks.len().max(1) as f64;
        match qualities {
            Some(qualities) if !qualities.is_empty() => {
                let sum: f64 = blocks
                    .map(|sc| qualities[sc.min(qualities.len() - 1)].sinr_for(tx_power).factor())
                    .sum();
                Ratio::from_factor(sum / count)
            }
            _ => {
                let estimate = if self.spot == SchedulerSpot::DlMaster {
                    self.registry.estimate_tx_sinr_at(user, frame_nr)
                } else {
                    self.registry.estimate_rx_sinr_of(user, frame_nr)
                };
                (tx_power / estimate.pathloss) / estimate.i
            }
        }
    }

    fn candidate(&self, run: &SearchResult, offset: usize, cid: ConnectionId, pdu_size: Bits) -> Option<SearchResult> {
        let tb_start = run.start + offset;
        let available = run.length - offset;
        let fitting = (1..=available)
            .map(|length| self.can_fit(tb_start, length, run.frame, cid, pdu_size))
            .find(|result| result.fits)?;
        let mut candidate = run.clone();
        candidate.tb_start = tb_start;
        candidate.tb_length = fitting.length;
        candidate.phy_mode = Some(self.more_robust_mcs(pdu_size, fitting.phy_mode));
        candidate.estimated_sinr = fitting.sinr;
        candidate.tx_power = fitting.tx_power;
        Some(candidate)
    }
}

impl LinkAdaptation for LinkAdaptor {
    fn set_tb_sizes(&self, runs: &[SearchResult], cid: ConnectionId, pdu_size: Bits) -> Vec<SearchResult> {
        let candidates: Vec<SearchResult> = runs
            .iter()
            .flat_map(|run| {
                let offsets = match self.mode {
                    LinkAdaptationMode::AtStart => 0..1.min(run.length),
                    LinkAdaptationMode::All => 0..run.length,
                };
                offsets.filter_map(move |offset| self.candidate(run, offset, cid, pdu_size))
            })
            .collect();
        trace!("{:?}: {} of {} runs carry {} bits of {}", self.mode, candidates.len(), runs.len(), pdu_size, cid);
        candidates
    }

    fn can_fit(&self, start: usize, length: usize, frame: usize, cid: ConnectionId, pdu_size: Bits) -> CanFitResult {
        let user = self.registry.user_for_cid(cid);
        let tx_power = self.tx_power(user);
        let sinr = self.effective_sinr(user, start..start + length, frame, tx_power);
        let phy_mode = self.registry.phy_mode_mapper().best_phy_mode(sinr);
        let needed = self.tb_size(pdu_size, &phy_mode);
        CanFitResult { fits: needed <= length, length: needed, phy_mode, sinr, tx_power }
    }
}
