//! Frame loop: traffic arrivals, one scheduling pass, report

use crate::config::{FrameConfig, SimulatorConfig};
use crate::traffic::TrafficSource;
use anyhow::{Context, Result};
use rand::rngs::StdRng;
use rand::SeedableRng;
use scheduler::config::SchedulerBuilder;
use scheduler::probe::{ProbeRecorder, StatisticsType};
use scheduler::queue::Queue;
use scheduler::registry::{StaticBeamformer, StaticRegistry};
use scheduler::strategy::{Strategy, StrategyInput};
use scheduler::types::Bits;
use scheduler::CompoundFactory;
use serde::Serialize;
use std::rc::Rc;
use tracing::{debug, trace, warn};

/// Outcome of one frame
#[derive(Debug, Clone, Serialize)]
pub struct FrameReport {
    pub frame: u32,
    pub arrived_bits: Bits,
    pub dropped_pdus: u32,
    pub scheduled_bits: Bits,
    pub scheduled_compounds: usize,
    pub bursts: usize,
    pub users: usize,
    pub resource_usage: f64,
    pub queued_bits: Bits,
}

/// Totals over the run so far
#[derive(Debug, Clone, Default, Serialize)]
pub struct Summary {
    pub frames: u32,
    pub arrived_bits: u64,
    pub scheduled_bits: u64,
    pub dropped_pdus: u64,
    pub mean_resource_usage: f64,
}

pub struct Simulation {
    frame: FrameConfig,
    registry: Rc<StaticRegistry>,
    strategy: Strategy,
    queue: Box<dyn Queue>,
    factory: Rc<CompoundFactory>,
    sources: Vec<TrafficSource>,
    rng: StdRng,
    usage: Rc<ProbeRecorder>,
    summary: Summary,
}

impl Simulation {
    pub fn new(config: &SimulatorConfig) -> Result<Self> {
        let registry = Rc::new(StaticRegistry::new(config.registry.clone()).context("building station registry")?);
        let usage = Rc::new(ProbeRecorder::new("scheduler.resourceUsage", StatisticsType::Moments));

        let mut builder = SchedulerBuilder::new(registry.clone()).with_resource_usage_probe(usage.clone());
        if config.scheduler.grouper.beamforming {
            let grouper = &config.scheduler.grouper;
            builder = builder.with_beamformer(Rc::new(StaticBeamformer::new(
                &registry,
                grouper.beam_width_deg,
                grouper.max_isolation_db,
            )));
        }
        let strategy = builder.build_strategy(&config.scheduler).context("building scheduler")?;
        let factory = Rc::new(CompoundFactory::new());
        let queue = builder.build_queue(&config.scheduler.queue, factory.clone()).context("building queue")?;

        Ok(Self {
            frame: config.frame.clone(),
            registry,
            strategy,
            queue,
            factory,
            sources: config.traffic.iter().map(TrafficSource::new).collect(),
            rng: StdRng::seed_from_u64(config.seed),
            usage,
            summary: Summary::default(),
        })
    }

    /// Name of the configured strategy
    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }

    fn inject_traffic(&mut self, frame_nr: u32) -> (Bits, u32) {
        let mut arrived = 0;
        let mut dropped = 0;
        for source in &mut self.sources {
            let cid = source.cid();
            let queued = self.queue.num_compounds_for_cid(cid);
            for bits in source.arrivals(frame_nr, queued, &mut self.rng) {
                let pdu = self.factory.create(cid, bits);
                if self.queue.is_accepting(&pdu) {
                    self.queue.put(pdu);
                    arrived += bits;
                } else {
                    trace!("queue of {} full, dropping {} bits", cid, bits);
                    dropped += 1;
                }
            }
        }
        (arrived, dropped)
    }

    fn queued_bits(&self) -> Bits {
        self.registry.connections().into_iter().map(|cid| self.queue.num_bits_for_cid(cid)).sum()
    }

    /// Inject arrivals and schedule `frame_nr`
    pub fn run_frame(&mut self, frame_nr: u32) -> FrameReport {
        let (arrived_bits, dropped_pdus) = self.inject_traffic(frame_nr);
        if dropped_pdus > 0 {
            warn!("frame {}: {} PDUs dropped at full queues", frame_nr, dropped_pdus);
        }

        let f = &self.frame;
        let input = StrategyInput::new(f.sub_channels, f.slot_length, f.time_slots, f.spatial_layers, frame_nr)
            .with_beamforming(f.beamforming);
        let result = self.strategy.start_scheduling(input, self.queue.as_mut());

        let report = FrameReport {
            frame: frame_nr,
            arrived_bits,
            dropped_pdus,
            scheduled_bits: result.scheduled_bits(),
            scheduled_compounds: result.scheduled_compounds(),
            bursts: result.bursts.len(),
            users: result.users().len(),
            resource_usage: result.resource_usage,
            queued_bits: self.queued_bits(),
        };
        debug!(
            "frame {}: {} bits in {} bursts, usage {:.2}",
            frame_nr, report.scheduled_bits, report.bursts, report.resource_usage
        );

        self.summary.frames += 1;
        self.summary.arrived_bits += u64::from(arrived_bits);
        self.summary.scheduled_bits += u64::from(report.scheduled_bits);
        self.summary.dropped_pdus += u64::from(dropped_pdus);
        self.summary.mean_resource_usage = self.usage.total().mean();
        report
    }

    pub fn summary(&self) -> &Summary {
        &self.summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SourceConfig, TrafficConfig};
    use scheduler::registry::StationConfig;

    fn scenario(strategy: &str, traffic: Vec<TrafficConfig>) -> SimulatorConfig {
        let mut config: SimulatorConfig = serde_yaml::from_str("frames: 10").unwrap();
        config.frame.sub_channels = 2;
        config.registry.queue_size_limit = 10_000;
        config.registry.stations = vec![
            StationConfig::new(1, &[1]).with_pathloss_db(90.0),
            StationConfig::new(2, &[2]).with_pathloss_db(90.0),
        ];
        config.scheduler.strategy.name = strategy.to_string();
        config.traffic = traffic;
        config
    }

    #[test]
    fn test_cbr_is_served() {
        let traffic = vec![
            TrafficConfig { cid: 1, source: SourceConfig::Cbr { pdu_size: 400, every_frames: 1 } },
            TrafficConfig { cid: 2, source: SourceConfig::Cbr { pdu_size: 400, every_frames: 2 } },
        ];
        let mut sim = Simulation::new(&scenario("ExhaustiveRR", traffic)).unwrap();
        let reports: Vec<FrameReport> = (0..4).map(|f| sim.run_frame(f)).collect();
        assert_eq!(reports[0].scheduled_bits, 800);
        assert_eq!(reports[1].scheduled_bits, 400);
        assert!(reports.iter().all(|r| r.queued_bits == 0));
        assert_eq!(sim.summary().scheduled_bits, 2400);
        assert_eq!(sim.summary().frames, 4);
    }

    #[test]
    fn test_full_queue_drops() {
        let traffic = vec![TrafficConfig { cid: 1, source: SourceConfig::FullBuffer { pdu_size: 800, backlog: 20 } }];
        let mut sim = Simulation::new(&scenario("ExhaustiveRR", traffic)).unwrap();
        let report = sim.run_frame(0);
        // twelve PDUs fit under the 10000 bit limit
        assert_eq!(report.dropped_pdus, 8);
        assert_eq!(report.arrived_bits, 9600);
    }

    #[test]
    fn test_unknown_strategy() {
        assert!(Simulation::new(&scenario("Greedy", Vec::new())).is_err());
    }

    #[test]
    fn test_resource_usage_recorded() {
        let traffic = vec![TrafficConfig { cid: 1, source: SourceConfig::Cbr { pdu_size: 100, every_frames: 1 } }];
        let mut sim = Simulation::new(&scenario("ExhaustiveRR", traffic)).unwrap();
        for f in 0..3 {
            sim.run_frame(f);
        }
        assert!(sim.summary().mean_resource_usage > 0.0);
        assert_eq!(sim.strategy_name(), "ExhaustiveRR");
    }
}
