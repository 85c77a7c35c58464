//! Transmission block selection among link-adapted candidates

use super::grid::SearchResult;
use rand::rngs::StdRng;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Selection rule for candidate transmission blocks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TbChoserKind {
    /// Lowest start block
    First,
    /// Shortest free run
    BestFit,
    /// Longest free run
    WorstFit,
    /// Fewest blocks for the transmission itself
    Smallest,
    /// Any candidate
    Random,
}

pub struct TbChoser {
    kind: TbChoserKind,
    return_random: bool,
    rng: StdRng,
}

impl TbChoser {
    /// `return_random` breaks ties randomly instead of taking the first candidate
    pub fn new(kind: TbChoserKind, return_random: bool, rng: StdRng) -> Self {
        Self { kind, return_random, rng }
    }

    pub fn kind(&self) -> TbChoserKind {
        self.kind
    }

    pub fn chose_tb(&mut self, candidates: &[SearchResult]) -> SearchResult {
        assert!(!candidates.is_empty(), "chose_tb() needs at least one candidate");
        let kind = self.kind;
        let key = |c: &SearchResult| match kind {
            TbChoserKind::First => Some(c.tb_start),
            TbChoserKind::BestFit => Some(c.length),
            TbChoserKind::WorstFit => Some(usize::MAX - c.length),
            TbChoserKind::Smallest => Some(c.tb_length),
            TbChoserKind::Random => None,
        };
        let best = candidates.iter().filter_map(key).min();
        let ties: Vec<&SearchResult> = candidates.iter().filter(|c| key(c) == best).collect();
        let pick = if kind == TbChoserKind::Random || self.return_random {
            self.rng.gen_range(0..ties.len())
        } else {
            0
        };
        ties[pick].clone()
    }
}
