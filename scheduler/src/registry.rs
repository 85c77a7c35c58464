//! Table-driven station registry
//!
//! [`StaticRegistry`] answers every [`Registry`] query from a fixed station
//! table: users, their connections and priorities, link budget and uplink
//! share. [`StaticBeamformer`] derives beamforming C/I values from the same
//! table. Both back the simulator and the unit tests.

use crate::compound::Compound;
use crate::interfaces::{BeamformingProvider, PhyModeMapper, Registry};
use crate::phy_mode::{default_phy_mode_table, PhyModeEntry, TablePhyModeMapper};
use crate::types::{Bits, ConnectionSet, Pattern, PowerAllocation, PowerMap, UserSet};
use crate::SchedulerError;
use common::types::{
    CandI, ChannelQualitiesOnAllSubChannels, ChannelQualityOnOneSubChannel, ConnectionId, Power,
    PowerCapabilities, Ratio, UserId,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// One connection of a station
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Connection id, unique over all stations
    pub cid: u32,
    /// Priority class, 0 being the highest
    #[serde(default)]
    pub priority: usize,
}

/// One peer station as seen by the scheduling station
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StationConfig {
    /// User id
    pub user: u32,
    /// Connections of this user
    #[serde(default)]
    pub connections: Vec<ConnectionConfig>,
    /// Pathloss between the scheduling station and this user
    #[serde(default = "default_pathloss")]
    pub pathloss: Ratio,
    /// Per-subchannel pathloss offsets in dB, repeated over the subchannels
    #[serde(default)]
    pub sub_channel_offsets_db: Vec<f64>,
    /// Interference plus noise at this user
    #[serde(default = "default_interference")]
    pub interference: Power,
    /// Direction of arrival in degrees
    #[serde(default)]
    pub angle_deg: f64,
    /// Reachable in every frame
    #[serde(default = "default_true")]
    pub reachable: bool,
    /// Has uplink data pending
    #[serde(default = "default_true")]
    pub ul_active: bool,
    /// Relative weight of the uplink share
    #[serde(default = "default_weight")]
    pub ul_weight: f64,
    /// Terminals served through this station (relays count more than one)
    #[serde(default = "default_users_behind")]
    pub users_behind: usize,
    /// Own power limits, defaulting to the registry's terminal limits
    #[serde(default)]
    pub power: Option<PowerCapabilities>,
}

/// Station table and link parameters of a [`StaticRegistry`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Own station
    #[serde(default)]
    pub my_user_id: u32,
    /// Downlink scheduler
    #[serde(default = "default_true")]
    pub is_dl: bool,
    /// Per-subchannel channel state available
    #[serde(default = "default_true")]
    pub cqi_available: bool,
    /// Number of subchannels the channel state covers
    #[serde(default = "default_sub_channels")]
    pub number_of_sub_channels: usize,
    /// Admission limit per connection queue
    #[serde(default = "default_queue_size")]
    pub queue_size_limit: Bits,
    /// Number of priority classes
    #[serde(default = "default_priorities")]
    pub number_of_priorities: usize,
    /// Own interference plus noise on the uplink
    #[serde(default = "default_interference")]
    pub own_interference: Power,
    /// Own power limits
    #[serde(default = "default_bs_power")]
    pub power: PowerCapabilities,
    /// Power limits of terminals without their own
    #[serde(default = "default_ut_power")]
    pub terminal_power: PowerCapabilities,
    /// PHY mode table
    #[serde(default = "default_phy_mode_table")]
    pub phy_modes: Vec<PhyModeEntry>,
    /// Peer stations
    #[serde(default)]
    pub stations: Vec<StationConfig>,
}

fn default_true() -> bool {
    true
}

fn default_weight() -> f64 {
    1.0
}

fn default_users_behind() -> usize {
    1
}

fn default_pathloss() -> Ratio {
    Ratio::from_db(100.0)
}

fn default_interference() -> Power {
    Power::from_dbm(-100.0)
}

fn default_sub_channels() -> usize {
    8
}

fn default_queue_size() -> Bits {
    250_000
}

fn default_priorities() -> usize {
    1
}

fn default_bs_power() -> PowerCapabilities {
    PowerCapabilities::new(Power::from_dbm(30.0), Power::from_dbm(27.0), Power::from_dbm(40.0))
}

fn default_ut_power() -> PowerCapabilities {
    PowerCapabilities::new(Power::from_dbm(20.0), Power::from_dbm(17.0), Power::from_dbm(23.0))
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            my_user_id: 0,
            is_dl: true,
            cqi_available: true,
            number_of_sub_channels: default_sub_channels(),
            queue_size_limit: default_queue_size(),
            number_of_priorities: default_priorities(),
            own_interference: default_interference(),
            power: default_bs_power(),
            terminal_power: default_ut_power(),
            phy_modes: default_phy_mode_table(),
            stations: Vec::new(),
        }
    }
}

impl StationConfig {
    /// Station with defaults and one connection per given cid
    pub fn new(user: u32, cids: &[u32]) -> Self {
        Self {
            user,
            connections: cids.iter().map(|&cid| ConnectionConfig { cid, priority: 0 }).collect(),
            pathloss: default_pathloss(),
            sub_channel_offsets_db: Vec::new(),
            interference: default_interference(),
            angle_deg: 0.0,
            reachable: true,
            ul_active: true,
            ul_weight: 1.0,
            users_behind: 1,
            power: None,
        }
    }

    /// Same station with a different pathloss
    pub fn with_pathloss_db(mut self, db: f64) -> Self {
        self.pathloss = Ratio::from_db(db);
        self
    }

    /// Same station at a different direction of arrival
    pub fn with_angle(mut self, angle_deg: f64) -> Self {
        self.angle_deg = angle_deg;
        self
    }
}

/// Registry answering from a fixed station table
#[derive(Debug)]
pub struct StaticRegistry {
    config: RegistryConfig,
    mapper: TablePhyModeMapper,
    stations: BTreeMap<UserId, StationConfig>,
    cid_to_user: BTreeMap<ConnectionId, UserId>,
    cid_to_priority: BTreeMap<ConnectionId, usize>,
}

impl StaticRegistry {
    /// Build from configuration
    pub fn new(config: RegistryConfig) -> Result<Self, SchedulerError> {
        let mapper = TablePhyModeMapper::new(&config.phy_modes)?;
        if config.number_of_priorities == 0 {
            return Err(SchedulerError::InvalidConfiguration("numberOfPriorities must be >= 1".to_string()));
        }
        let mut stations = BTreeMap::new();
        let mut cid_to_user = BTreeMap::new();
        let mut cid_to_priority = BTreeMap::new();
        for station in &config.stations {
            let user = UserId(station.user);
            if user == UserId(config.my_user_id) {
                return Err(SchedulerError::InvalidConfiguration(format!("station {} is the own station", user)));
            }
            for connection in &station.connections {
                let cid = ConnectionId(connection.cid);
                if connection.priority >= config.number_of_priorities {
                    return Err(SchedulerError::InvalidConfiguration(format!(
                        "{} has priority {} but only {} priorities exist",
                        cid, connection.priority, config.number_of_priorities
                    )));
                }
                if cid_to_user.insert(cid, user).is_some() {
                    return Err(SchedulerError::InvalidConfiguration(format!("{} configured twice", cid)));
                }
                cid_to_priority.insert(cid, connection.priority);
            }
            if stations.insert(user, station.clone()).is_some() {
                return Err(SchedulerError::InvalidConfiguration(format!("{} configured twice", user)));
            }
        }
        debug!(
            "StaticRegistry: {} stations, {} connections, {} PHY modes",
            stations.len(),
            cid_to_user.len(),
            mapper.phy_mode_count()
        );
        Ok(Self { config, mapper, stations, cid_to_user, cid_to_priority })
    }

    /// Configuration the registry was built from
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// All configured users
    pub fn users(&self) -> UserSet {
        self.stations.keys().copied().collect()
    }

    /// All configured connections
    pub fn connections(&self) -> ConnectionSet {
        self.cid_to_user.keys().copied().collect()
    }

    fn station(&self, user: UserId) -> Option<&StationConfig> {
        self.stations.get(&user)
    }

    fn pathloss_on(&self, station: &StationConfig, sub_channel: usize) -> Ratio {
        if station.sub_channel_offsets_db.is_empty() {
            return station.pathloss;
        }
        let offset = station.sub_channel_offsets_db[sub_channel % station.sub_channel_offsets_db.len()];
        Ratio::from_db(station.pathloss.db() + offset)
    }

    fn qualities(&self, user: UserId, interference_of: impl Fn(&StationConfig) -> Power) -> Option<ChannelQualitiesOnAllSubChannels> {
        if !self.config.cqi_available {
            return None;
        }
        let station = self.station(user)?;
        let interference = interference_of(station);
        Some(
            (0..self.config.number_of_sub_channels)
                .map(|sc| ChannelQualityOnOneSubChannel::new(self.pathloss_on(station, sc), interference, sc))
                .collect(),
        )
    }
}

impl Registry for StaticRegistry {
    fn my_user_id(&self) -> UserId {
        UserId(self.config.my_user_id)
    }

    fn user_for_cid(&self, cid: ConnectionId) -> UserId {
        match self.cid_to_user.get(&cid) {
            Some(&user) => user,
            None => panic!("user_for_cid(): unknown {}", cid),
        }
    }

    fn connections_for_user(&self, user: UserId) -> Vec<ConnectionId> {
        match self.station(user) {
            Some(station) => {
                let mut cids: Vec<ConnectionId> = station.connections.iter().map(|c| ConnectionId(c.cid)).collect();
                cids.sort();
                cids
            }
            None => {
                warn!("connections_for_user(): unknown {}", user);
                Vec::new()
            }
        }
    }

    fn cid_for_pdu(&self, compound: &Compound) -> ConnectionId {
        compound.cid
    }

    fn queue_size_limit_per_connection(&self) -> Bits {
        self.config.queue_size_limit
    }

    fn filter_reachable(&self, users: &UserSet, _frame_nr: u32) -> UserSet {
        users
            .iter()
            .copied()
            .filter(|user| self.station(*user).map(|s| s.reachable).unwrap_or(false))
            .collect()
    }

    fn filter_reachable_connections(&self, connections: &ConnectionSet, frame_nr: u32) -> ConnectionSet {
        let users: UserSet = connections.iter().filter_map(|cid| self.cid_to_user.get(cid).copied()).collect();
        let reachable = self.filter_reachable(&users, frame_nr);
        connections
            .iter()
            .copied()
            .filter(|cid| self.cid_to_user.get(cid).map(|u| reachable.contains(u)).unwrap_or(false))
            .collect()
    }

    fn channel_qualities_on_uplink(&self, user: UserId, _frame_nr: u32) -> Option<ChannelQualitiesOnAllSubChannels> {
        let own = self.config.own_interference;
        self.qualities(user, |_| own)
    }

    fn channel_qualities_on_downlink(&self, user: UserId, _frame_nr: u32) -> Option<ChannelQualitiesOnAllSubChannels> {
        self.qualities(user, |station| station.interference)
    }

    fn calc_ul_resources(&self, users: &UserSet, phy_resources: usize) -> PowerMap {
        let weights: Vec<(UserId, f64)> = users
            .iter()
            .filter_map(|user| self.station(*user).map(|s| (*user, s.ul_weight.max(0.0))))
            .collect();
        let total: f64 = weights.iter().map(|(_, w)| w).sum();
        weights
            .into_iter()
            .map(|(user, weight)| {
                let share = if total > 0.0 { weight / total } else { 0.0 };
                let allocation = PowerAllocation {
                    tx_power_per_subband: self.power_capabilities(Some(user)).nominal_per_subband,
                    user,
                    resource_share: share,
                    max_num_subbands: phy_resources,
                };
                (user, allocation)
            })
            .collect()
    }

    fn active_ul_users(&self) -> UserSet {
        self.stations.values().filter(|s| s.ul_active).map(|s| UserId(s.user)).collect()
    }

    fn total_number_of_users(&self, user: UserId) -> usize {
        self.station(user).map(|s| s.users_behind.max(1)).unwrap_or(1)
    }

    fn number_of_priorities(&self) -> usize {
        self.config.number_of_priorities
    }

    fn priority_for_connection(&self, cid: ConnectionId) -> usize {
        self.cid_to_priority.get(&cid).copied().unwrap_or(0)
    }

    fn connections_for_priority(&self, priority: usize) -> ConnectionSet {
        self.cid_to_priority
            .iter()
            .filter(|(_, &p)| p == priority)
            .map(|(&cid, _)| cid)
            .collect()
    }

    fn is_dl(&self) -> bool {
        self.config.is_dl
    }

    fn cqi_available(&self) -> bool {
        self.config.cqi_available
    }

    fn power_capabilities(&self, user: Option<UserId>) -> PowerCapabilities {
        match user {
            None => self.config.power,
            Some(user) if user == self.my_user_id() => self.config.power,
            Some(user) => self
                .station(user)
                .and_then(|s| s.power)
                .unwrap_or(self.config.terminal_power),
        }
    }

    fn phy_mode_mapper(&self) -> &dyn PhyModeMapper {
        &self.mapper
    }

    fn estimate_tx_sinr_at(&self, user: UserId, _frame_nr: u32) -> CandI {
        match self.station(user) {
            Some(station) => CandI {
                c: self.config.power.nominal_per_subband / station.pathloss,
                i: station.interference,
                pathloss: station.pathloss,
            },
            None => {
                warn!("estimate_tx_sinr_at(): unknown {}", user);
                CandI::new(Power::zero(), default_interference())
            }
        }
    }

    fn estimate_rx_sinr_of(&self, user: UserId, _frame_nr: u32) -> CandI {
        match self.station(user) {
            Some(station) => CandI {
                c: self.power_capabilities(Some(user)).nominal_per_subband / station.pathloss,
                i: self.config.own_interference,
                pathloss: station.pathloss,
            },
            None => {
                warn!("estimate_rx_sinr_of(): unknown {}", user);
                CandI::new(Power::zero(), self.config.own_interference)
            }
        }
    }
}

/// Beamforming estimates from station angles
///
/// Streams towards users share the transmit power equally. A co-scheduled
/// user leaks into another in proportion to their angular proximity, down to
/// `max_isolation_db` once they are `beam_width_deg` apart.
#[derive(Debug, Clone)]
pub struct StaticBeamformer {
    stations: BTreeMap<UserId, StationConfig>,
    tx_power: Power,
    own_interference: Power,
    terminal_power: PowerCapabilities,
    beam_width_deg: f64,
    max_isolation_db: f64,
}

impl StaticBeamformer {
    /// Beamformer over the registry's stations
    pub fn new(registry: &StaticRegistry, beam_width_deg: f64, max_isolation_db: f64) -> Self {
        Self {
            stations: registry.stations.clone(),
            tx_power: registry.config.power.nominal_per_subband,
            own_interference: registry.config.own_interference,
            terminal_power: registry.config.terminal_power,
            beam_width_deg: beam_width_deg.max(f64::MIN_POSITIVE),
            max_isolation_db,
        }
    }

    fn leakage(&self, a: &StationConfig, b: &StationConfig) -> f64 {
        let separation = (a.angle_deg - b.angle_deg).abs() % 360.0;
        let separation = separation.min(360.0 - separation);
        let isolation_db = (separation / self.beam_width_deg).min(1.0) * self.max_isolation_db;
        Ratio::from_db(-isolation_db).factor()
    }

    fn cand_is(&self, group: &UserSet, power_of: impl Fn(&StationConfig) -> Power, noise_of: impl Fn(&StationConfig) -> Power) -> BTreeMap<UserId, CandI> {
        let members: Vec<&StationConfig> = group.iter().filter_map(|u| self.stations.get(u)).collect();
        let streams = members.len().max(1) as f64;
        members
            .iter()
            .map(|station| {
                let c = power_of(station) * (1.0 / streams) / station.pathloss;
                let mut i = noise_of(station);
                for other in members.iter().filter(|o| o.user != station.user) {
                    i += power_of(other) * (1.0 / streams) / station.pathloss * self.leakage(station, other);
                }
                (UserId(station.user), CandI { c, i, pathloss: station.pathloss })
            })
            .collect()
    }
}

impl BeamformingProvider for StaticBeamformer {
    fn calculate_cand_is_tx(&self, group: &UserSet) -> BTreeMap<UserId, CandI> {
        let tx_power = self.tx_power;
        self.cand_is(group, |_| tx_power, |station| station.interference)
    }

    fn calculate_cand_is_rx(&self, group: &UserSet) -> BTreeMap<UserId, CandI> {
        let terminal_power = self.terminal_power;
        let noise = self.own_interference;
        self.cand_is(
            group,
            |station| station.power.unwrap_or(terminal_power).nominal_per_subband,
            |_| noise,
        )
    }

    fn calculate_and_set_beam(&self, user: UserId, undesired: &UserSet) -> Pattern {
        Pattern {
            steered_at: user,
            nulls: undesired.iter().copied().filter(|u| *u != user).collect(),
            gain: 1.0,
        }
    }
}
