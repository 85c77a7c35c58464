//! Name-selected scheduler configuration
//!
//! Strategies, groupers, DSA and APC variants are chosen by name, the way a
//! scenario file names them. Each config struct carries the parameters of
//! every variant of its family with defaults; [`SchedulerBuilder`] turns a
//! [`SchedulerConfig`] into a ready [`Strategy`] and its [`Queue`].

use crate::apc::{ApcStrategy, FairSinr, FcfsMaxPhyMode, LteUl, UseMaxTxPower};
use crate::compound::CompoundFactory;
use crate::dsa::{BestChannel, DsaPolicy, DsaStrategy, Fixed, LinearFFirst, RandomDsa};
use crate::grouper::{AllPossibleGroupsGrouper, Grouper, TrivialGrouper};
use crate::harq::{HarqConfig, HarqManager};
use crate::interfaces::{BeamformingProvider, Registry};
use crate::persistent::PersistentVoipConfig;
use crate::probe::ProbeSink;
use crate::queue::{Queue, SegmentingQueue, SegmentingQueueConfig, SimpleQueue};
use crate::strategy::{
    CqiEnabledExhaustiveRR, CqiEnabledRoundRobinUL, DsaDrivenRR, ExhaustiveRR, Pcrr, PersistentVoip,
    ProportionalFairDL, SchedulingAlgorithm, Strategy, StrategyCore,
};
use crate::types::SchedulerSpot;
use crate::SchedulerError;
use common::types::{Power, Ratio};
use common::utils::SimTime;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::rc::Rc;
use std::str::FromStr;
use tracing::{debug, info};

/// Scheduling algorithm families
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyKind {
    ExhaustiveRR,
    ProportionalFairDL,
    Pcrr,
    CqiEnabledExhaustiveRR,
    CqiEnabledRoundRobinUL,
    DsaDrivenRR,
    PersistentVoip,
}

impl FromStr for StrategyKind {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ExhaustiveRR" => Ok(StrategyKind::ExhaustiveRR),
            "ProportionalFairDL" => Ok(StrategyKind::ProportionalFairDL),
            "PCRR" => Ok(StrategyKind::Pcrr),
            "CQIEnabledExhaustiveRR" => Ok(StrategyKind::CqiEnabledExhaustiveRR),
            "CQIEnabledRoundRobinUL" => Ok(StrategyKind::CqiEnabledRoundRobinUL),
            "DsaDrivenRR" => Ok(StrategyKind::DsaDrivenRR),
            "PersistentVoIP" => Ok(StrategyKind::PersistentVoip),
            _ => Err(SchedulerError::UnknownConfigurationValue(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DsaKind {
    LinearFFirst,
    BestChannel,
    Fixed,
    Random,
}

impl FromStr for DsaKind {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "LinearFFirst" => Ok(DsaKind::LinearFFirst),
            "BestChannel" => Ok(DsaKind::BestChannel),
            "Fixed" => Ok(DsaKind::Fixed),
            "Random" => Ok(DsaKind::Random),
            _ => Err(SchedulerError::UnknownConfigurationValue(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApcKind {
    UseMaxTxPower,
    FcfsMaxPhyMode,
    FairSinr,
    LteUl,
}

impl FromStr for ApcKind {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "UseMaxTxPower" => Ok(ApcKind::UseMaxTxPower),
            "FCFSMaxPhyMode" => Ok(ApcKind::FcfsMaxPhyMode),
            "FairSINR" => Ok(ApcKind::FairSinr),
            "LTE_UL" => Ok(ApcKind::LteUl),
            _ => Err(SchedulerError::UnknownConfigurationValue(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrouperKind {
    Trivial,
    AllPossibleGroups,
}

impl FromStr for GrouperKind {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Trivial" | "TrivialGrouper" => Ok(GrouperKind::Trivial),
            "AllPossibleGroups" | "AllPossibleGroupsGrouper" => Ok(GrouperKind::AllPossibleGroups),
            _ => Err(SchedulerError::UnknownConfigurationValue(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    Simple,
    Segmenting,
}

impl FromStr for QueueKind {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SimpleQueue" | "Simple" => Ok(QueueKind::Simple),
            "SegmentingQueue" | "Segmenting" => Ok(QueueKind::Segmenting),
            _ => Err(SchedulerError::UnknownConfigurationValue(s.to_string())),
        }
    }
}

fn default_strategy_name() -> String {
    "ExhaustiveRR".to_string()
}

fn default_dsa_name() -> String {
    "LinearFFirst".to_string()
}

fn default_apc_name() -> String {
    "UseMaxTxPower".to_string()
}

fn default_grouper_name() -> String {
    "Trivial".to_string()
}

fn default_queue_name() -> String {
    "SimpleQueue".to_string()
}

fn default_true() -> bool {
    true
}

fn default_history_weight() -> f64 {
    0.99
}

fn default_scaling() -> f64 {
    0.5
}

fn default_max_bursts() -> usize {
    100
}

fn default_fair_sinr_dl() -> f64 {
    10.0
}

fn default_fair_sinr_ul() -> f64 {
    5.0
}

fn default_p0() -> Power {
    Power::from_dbm(-100.0)
}

fn default_alpha() -> f64 {
    1.0
}

fn default_sinr_margin() -> Ratio {
    Ratio::from_db(0.0)
}

fn default_beam_width() -> f64 {
    30.0
}

fn default_max_isolation() -> f64 {
    20.0
}

/// Proportional fair parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProportionalFairConfig {
    #[serde(default = "default_history_weight")]
    pub history_weight: f64,
    /// 0 is maximum throughput, 1 is proportional fairness
    #[serde(default = "default_scaling")]
    pub scaling_between_max_tp_and_pf: f64,
    #[serde(default = "default_max_bursts")]
    pub max_bursts: usize,
}

impl Default for ProportionalFairConfig {
    fn default() -> Self {
        Self {
            history_weight: default_history_weight(),
            scaling_between_max_tp_and_pf: default_scaling(),
            max_bursts: default_max_bursts(),
        }
    }
}

/// Scheduling algorithm selection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyConfig {
    #[serde(default = "default_strategy_name")]
    pub name: String,
    #[serde(default)]
    pub proportional_fair: ProportionalFairConfig,
    #[serde(default)]
    pub persistent_voip: PersistentVoipConfig,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            name: default_strategy_name(),
            proportional_fair: ProportionalFairConfig::default(),
            persistent_voip: PersistentVoipConfig::default(),
        }
    }
}

/// Subchannel assignment selection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DsaConfig {
    #[serde(default = "default_dsa_name")]
    pub name: String,
    #[serde(default)]
    pub one_user_on_one_sub_channel: bool,
    /// LinearFFirst: start at a random subchannel every frame
    #[serde(default)]
    pub random_start: bool,
    /// BestChannel: keep uplink subchannels of a user adjacent
    #[serde(default)]
    pub adjacent_sub_channels_on_uplink: bool,
    /// Fixed: walk time slots before subchannels
    #[serde(default)]
    pub time_first: bool,
}

impl Default for DsaConfig {
    fn default() -> Self {
        Self {
            name: default_dsa_name(),
            one_user_on_one_sub_channel: false,
            random_start: false,
            adjacent_sub_channels_on_uplink: false,
            time_first: false,
        }
    }
}

/// Power control selection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApcConfig {
    #[serde(default = "default_apc_name")]
    pub name: String,
    /// FairSINR targets in dB
    #[serde(default = "default_fair_sinr_dl")]
    pub fair_sinr_dl_db: f64,
    #[serde(default = "default_fair_sinr_ul")]
    pub fair_sinr_ul_db: f64,
    /// LTE_UL open loop parameters
    #[serde(default = "default_p0")]
    pub p0: Power,
    #[serde(default = "default_alpha")]
    pub alpha: f64,
    #[serde(default = "default_sinr_margin")]
    pub sinr_margin: Ratio,
    #[serde(default)]
    pub minimum_phy_mode: usize,
}

impl Default for ApcConfig {
    fn default() -> Self {
        Self {
            name: default_apc_name(),
            fair_sinr_dl_db: default_fair_sinr_dl(),
            fair_sinr_ul_db: default_fair_sinr_ul(),
            p0: default_p0(),
            alpha: default_alpha(),
            sinr_margin: default_sinr_margin(),
            minimum_phy_mode: 0,
        }
    }
}

/// Spatial grouping selection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GrouperConfig {
    #[serde(default = "default_grouper_name")]
    pub name: String,
    /// Ask the beamformer for C/I estimates
    #[serde(default)]
    pub beamforming: bool,
    #[serde(default = "default_beam_width")]
    pub beam_width_deg: f64,
    #[serde(default = "default_max_isolation")]
    pub max_isolation_db: f64,
}

impl Default for GrouperConfig {
    fn default() -> Self {
        Self {
            name: default_grouper_name(),
            beamforming: false,
            beam_width_deg: default_beam_width(),
            max_isolation_db: default_max_isolation(),
        }
    }
}

/// Queue selection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_queue_name")]
    pub name: String,
    #[serde(default)]
    pub segmenting: SegmentingQueueConfig,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self { name: default_queue_name(), segmenting: SegmentingQueueConfig::default() }
    }
}

/// Everything needed to set up one scheduler instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_spot")]
    pub spot: SchedulerSpot,
    #[serde(default)]
    pub strategy: StrategyConfig,
    #[serde(default)]
    pub grouper: GrouperConfig,
    #[serde(default)]
    pub dsa: Option<DsaConfig>,
    #[serde(default)]
    pub apc: Option<ApcConfig>,
    #[serde(default)]
    pub harq: Option<HarqConfig>,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default = "default_true")]
    pub use_cqi: bool,
    /// OFDM symbol duration bursts are rounded to, 0 disables rounding
    #[serde(default)]
    pub symbol_duration: SimTime,
    /// Index of a PHY mode forced onto every placement
    #[serde(default)]
    pub default_phy_mode: Option<usize>,
    #[serde(default)]
    pub default_tx_power: Option<Power>,
    #[serde(default = "default_true")]
    pub exclude_too_low_sinr: bool,
    #[serde(default = "default_true")]
    pub allow_regrouping: bool,
    /// Seed of every randomized component
    #[serde(default)]
    pub seed: u64,
}

fn default_spot() -> SchedulerSpot {
    SchedulerSpot::DlMaster
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            spot: default_spot(),
            strategy: StrategyConfig::default(),
            grouper: GrouperConfig::default(),
            dsa: None,
            apc: None,
            harq: None,
            queue: QueueConfig::default(),
            use_cqi: true,
            symbol_duration: 0.0,
            default_phy_mode: None,
            default_tx_power: None,
            exclude_too_low_sinr: true,
            allow_regrouping: true,
            seed: 0,
        }
    }
}

/// Builds strategies and queues against one registry
pub struct SchedulerBuilder {
    registry: Rc<dyn Registry>,
    beamformer: Option<Rc<dyn BeamformingProvider>>,
    resource_usage_probe: Option<Rc<dyn ProbeSink>>,
    queue_size_probe: Option<Rc<dyn ProbeSink>>,
}

impl SchedulerBuilder {
    pub fn new(registry: Rc<dyn Registry>) -> Self {
        Self { registry, beamformer: None, resource_usage_probe: None, queue_size_probe: None }
    }

    /// Beamformer used by groupers configured with `beamforming`
    pub fn with_beamformer(mut self, beamformer: Rc<dyn BeamformingProvider>) -> Self {
        self.beamformer = Some(beamformer);
        self
    }

    pub fn with_resource_usage_probe(mut self, probe: Rc<dyn ProbeSink>) -> Self {
        self.resource_usage_probe = Some(probe);
        self
    }

    pub fn with_queue_size_probe(mut self, probe: Rc<dyn ProbeSink>) -> Self {
        self.queue_size_probe = Some(probe);
        self
    }

    pub fn build_dsa(&self, config: &DsaConfig, seed: u64) -> Result<Box<dyn DsaStrategy>, SchedulerError> {
        let policy = DsaPolicy::new(config.one_user_on_one_sub_channel, self.registry.phy_mode_mapper());
        let dsa: Box<dyn DsaStrategy> = match config.name.parse::<DsaKind>()? {
            DsaKind::LinearFFirst => {
                let dsa = LinearFFirst::new(policy);
                if config.random_start {
                    Box::new(dsa.with_random_start(StdRng::seed_from_u64(seed)))
                } else {
                    Box::new(dsa)
                }
            }
            DsaKind::BestChannel => Box::new(BestChannel::new(policy, config.adjacent_sub_channels_on_uplink)),
            DsaKind::Fixed => Box::new(Fixed::new(policy, self.registry.clone(), config.time_first)),
            DsaKind::Random => Box::new(RandomDsa::new(policy, StdRng::seed_from_u64(seed))),
        };
        Ok(dsa)
    }

    pub fn build_apc(&self, config: &ApcConfig) -> Result<Box<dyn ApcStrategy>, SchedulerError> {
        let registry = self.registry.clone();
        let apc: Box<dyn ApcStrategy> = match config.name.parse::<ApcKind>()? {
            ApcKind::UseMaxTxPower => Box::new(UseMaxTxPower::new(registry)),
            ApcKind::FcfsMaxPhyMode => Box::new(FcfsMaxPhyMode::new(registry)),
            ApcKind::FairSinr => Box::new(FairSinr::new(registry, config.fair_sinr_dl_db, config.fair_sinr_ul_db)),
            ApcKind::LteUl => Box::new(LteUl::new(
                registry,
                config.p0,
                config.alpha,
                config.sinr_margin,
                config.minimum_phy_mode,
            )?),
        };
        Ok(apc)
    }

    pub fn build_grouper(&self, config: &GrouperConfig) -> Result<Box<dyn Grouper>, SchedulerError> {
        let beamformer = if config.beamforming {
            match &self.beamformer {
                Some(beamformer) => Some(beamformer.clone()),
                None => {
                    return Err(SchedulerError::InvalidConfiguration(format!(
                        "grouper {} needs a beamformer",
                        config.name
                    )))
                }
            }
        } else {
            None
        };
        let grouper: Box<dyn Grouper> = match config.name.parse::<GrouperKind>()? {
            GrouperKind::Trivial => Box::new(TrivialGrouper::new(self.registry.clone(), beamformer)),
            GrouperKind::AllPossibleGroups => Box::new(AllPossibleGroupsGrouper::new(self.registry.clone(), beamformer)),
        };
        Ok(grouper)
    }

    pub fn build_algorithm(
        &self,
        config: &StrategyConfig,
        seed: u64,
    ) -> Result<Box<dyn SchedulingAlgorithm>, SchedulerError> {
        let algorithm: Box<dyn SchedulingAlgorithm> = match config.name.parse::<StrategyKind>()? {
            StrategyKind::ExhaustiveRR => Box::new(ExhaustiveRR::new()),
            StrategyKind::ProportionalFairDL => {
                let pf = &config.proportional_fair;
                Box::new(ProportionalFairDL::new(
                    pf.history_weight,
                    pf.scaling_between_max_tp_and_pf,
                    pf.max_bursts,
                    StdRng::seed_from_u64(seed),
                )?)
            }
            StrategyKind::Pcrr => Box::new(Pcrr::new()),
            StrategyKind::CqiEnabledExhaustiveRR => Box::new(CqiEnabledExhaustiveRR::new()),
            StrategyKind::CqiEnabledRoundRobinUL => Box::new(CqiEnabledRoundRobinUL::new()),
            StrategyKind::DsaDrivenRR => Box::new(DsaDrivenRR::new()),
            StrategyKind::PersistentVoip => Box::new(PersistentVoip::new(config.persistent_voip.clone())?),
        };
        Ok(algorithm)
    }

    /// Assemble core, collaborators and algorithm
    pub fn build_strategy(&self, config: &SchedulerConfig) -> Result<Strategy, SchedulerError> {
        let default_phy_mode = match config.default_phy_mode {
            Some(index) => {
                let mapper = self.registry.phy_mode_mapper();
                if index >= mapper.phy_mode_count() {
                    return Err(SchedulerError::InvalidConfiguration(format!(
                        "default PhyMode {} not in the table of {} modes",
                        index,
                        mapper.phy_mode_count()
                    )));
                }
                Some(mapper.phy_mode_for_index(index))
            }
            None => None,
        };

        let mut core = StrategyCore::new(self.registry.clone(), config.spot)
            .with_grouper(self.build_grouper(&config.grouper)?)
            .with_cqi(config.use_cqi)
            .with_symbol_duration(config.symbol_duration)
            .with_default_phy_mode(default_phy_mode)
            .with_default_tx_power(config.default_tx_power)
            .with_exclude_too_low_sinr(config.exclude_too_low_sinr)
            .with_regrouping(config.allow_regrouping);
        if let Some(dsa) = &config.dsa {
            core = core.with_dsa(self.build_dsa(dsa, config.seed)?);
        }
        if let Some(apc) = &config.apc {
            core = core.with_apc(self.build_apc(apc)?);
        }
        if let Some(harq) = &config.harq {
            core = core.with_harq(Box::new(HarqManager::new(harq.clone())?));
        }
        if let Some(probe) = &self.resource_usage_probe {
            core = core.with_resource_usage_probe(probe.clone());
        }

        let algorithm = self.build_algorithm(&config.strategy, config.seed)?;
        debug!(
            "building {} with grouper {}, dsa {:?}, apc {:?}",
            algorithm.name(),
            config.grouper.name,
            config.dsa.as_ref().map(|d| d.name.as_str()),
            config.apc.as_ref().map(|a| a.name.as_str())
        );
        let strategy = Strategy::new(core, algorithm)?;
        info!("{} scheduler ready at {:?}", strategy.name(), config.spot);
        Ok(strategy)
    }

    pub fn build_queue(
        &self,
        config: &QueueConfig,
        factory: Rc<CompoundFactory>,
    ) -> Result<Box<dyn Queue>, SchedulerError> {
        let queue: Box<dyn Queue> = match config.name.parse::<QueueKind>()? {
            QueueKind::Simple => {
                let queue = SimpleQueue::new(self.registry.clone());
                match &self.queue_size_probe {
                    Some(probe) => Box::new(queue.with_size_probe(probe.clone())),
                    None => Box::new(queue),
                }
            }
            QueueKind::Segmenting => {
                let queue = SegmentingQueue::new(config.segmenting.clone(), self.registry.clone(), factory);
                match &self.queue_size_probe {
                    Some(probe) => Box::new(queue.with_size_probe(probe.clone())),
                    None => Box::new(queue),
                }
            }
        };
        Ok(queue)
    }
}
