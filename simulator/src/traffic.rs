//! Traffic sources feeding the scheduler queues

use crate::config::{SourceConfig, TrafficConfig};
use common::types::ConnectionId;
use rand::rngs::StdRng;
use rand::Rng;
use scheduler::types::Bits;
use tracing::trace;

/// Exponentially distributed duration with the given mean
fn exponential(rng: &mut StdRng, mean: f64) -> f64 {
    -mean * (1.0 - rng.gen::<f64>()).ln()
}

#[derive(Debug)]
pub struct TrafficSource {
    cid: ConnectionId,
    model: SourceConfig,
    talking: bool,
    /// Frames left in the current talk spurt or silence
    remaining: f64,
}

impl TrafficSource {
    pub fn new(config: &TrafficConfig) -> Self {
        Self { cid: ConnectionId(config.cid), model: config.source.clone(), talking: false, remaining: 0.0 }
    }

    pub fn cid(&self) -> ConnectionId {
        self.cid
    }

    /// Sizes of the PDUs arriving in `frame_nr`, given `queued` PDUs already waiting
    pub fn arrivals(&mut self, frame_nr: u32, queued: u32, rng: &mut StdRng) -> Vec<Bits> {
        match self.model {
            SourceConfig::Cbr { pdu_size, every_frames } => {
                if frame_nr % every_frames == 0 {
                    vec![pdu_size]
                } else {
                    Vec::new()
                }
            }
            SourceConfig::FullBuffer { pdu_size, backlog } => vec![pdu_size; backlog.saturating_sub(queued) as usize],
            SourceConfig::Voip { pdu_size, period_frames, mean_on_frames, mean_off_frames } => {
                if self.remaining <= 0.0 {
                    self.talking = !self.talking;
                    let mean = if self.talking { mean_on_frames } else { mean_off_frames };
                    self.remaining = exponential(rng, mean).max(1.0);
                    trace!("{} {} for {:.0} frames", self.cid, if self.talking { "talks" } else { "is silent" }, self.remaining);
                }
                self.remaining -= 1.0;
                let phase = self.cid.value() % period_frames;
                if self.talking && frame_nr % period_frames == phase {
                    vec![pdu_size]
                } else {
                    Vec::new()
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn source(cid: u32, source: SourceConfig) -> TrafficSource {
        TrafficSource::new(&TrafficConfig { cid, source })
    }

    #[test]
    fn test_cbr_interval() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut cbr = source(1, SourceConfig::Cbr { pdu_size: 100, every_frames: 3 });
        let frames: Vec<usize> = (0..7).map(|f| cbr.arrivals(f, 0, &mut rng).len()).collect();
        assert_eq!(frames, vec![1, 0, 0, 1, 0, 0, 1]);
    }

    #[test]
    fn test_full_buffer_tops_up() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut full = source(1, SourceConfig::FullBuffer { pdu_size: 500, backlog: 4 });
        assert_eq!(full.arrivals(0, 0, &mut rng), vec![500; 4]);
        assert_eq!(full.arrivals(1, 3, &mut rng).len(), 1);
        assert!(full.arrivals(2, 6, &mut rng).is_empty());
    }

    #[test]
    fn test_voip_talks_once_per_period() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut voip = source(
            2,
            SourceConfig::Voip { pdu_size: 352, period_frames: 4, mean_on_frames: 1e9, mean_off_frames: 1.0 },
        );
        let arrivals: Vec<u32> = (0..12).filter(|&f| !voip.arrivals(f, 0, &mut rng).is_empty()).collect();
        assert_eq!(arrivals, vec![2, 6, 10]);
    }

    #[test]
    fn test_voip_silence() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut voip = source(
            1,
            SourceConfig::Voip { pdu_size: 352, period_frames: 2, mean_on_frames: 1.0, mean_off_frames: 1e9 },
        );
        let total: usize = (0..200).map(|f| voip.arrivals(f, 0, &mut rng).len()).sum();
        // a single short talk spurt, then silence
        assert!(total < 10);
    }
}
