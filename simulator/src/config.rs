//! Scenario configuration
//!
//! A scenario names the frame layout, the station table, the scheduler and
//! the traffic sources feeding its queues. Files ending in `.yml`/`.yaml`
//! are read as YAML, anything else as TOML.

use anyhow::{bail, Context, Result};
use scheduler::config::SchedulerConfig;
use scheduler::registry::RegistryConfig;
use scheduler::types::{Bits, SchedulerSpot};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;

/// Complete scenario
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SimulatorConfig {
    /// Frames to simulate
    #[serde(default = "default_frames")]
    pub frames: u32,
    /// Seed of the traffic sources
    #[serde(default)]
    pub seed: u64,
    /// Pause between frames in milliseconds, 0 runs as fast as possible
    #[serde(default)]
    pub frame_interval_ms: u64,
    #[serde(default)]
    pub frame: FrameConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub traffic: Vec<TrafficConfig>,
}

fn default_frames() -> u32 {
    100
}

/// Dimensions of the scheduled map
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FrameConfig {
    #[serde(default = "default_sub_channels")]
    pub sub_channels: usize,
    /// Slot length in seconds
    #[serde(default = "default_slot_length")]
    pub slot_length: f64,
    #[serde(default = "default_one")]
    pub time_slots: usize,
    #[serde(default = "default_one")]
    pub spatial_layers: usize,
    #[serde(default)]
    pub beamforming: bool,
}

fn default_sub_channels() -> usize {
    8
}

fn default_slot_length() -> f64 {
    1e-3
}

fn default_one() -> usize {
    1
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            sub_channels: default_sub_channels(),
            slot_length: default_slot_length(),
            time_slots: default_one(),
            spatial_layers: default_one(),
            beamforming: false,
        }
    }
}

/// One traffic source bound to a connection
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TrafficConfig {
    pub cid: u32,
    #[serde(flatten)]
    pub source: SourceConfig,
}

/// Traffic models
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type")]
pub enum SourceConfig {
    /// One PDU every `every_frames` frames
    Cbr {
        pdu_size: Bits,
        #[serde(default = "default_every")]
        every_frames: u32,
    },
    /// Talk spurts with one voice frame per period, exponential on/off durations
    Voip {
        #[serde(default = "default_voice_pdu")]
        pdu_size: Bits,
        #[serde(default = "default_voice_period")]
        period_frames: u32,
        /// Mean talk spurt length in frames
        #[serde(default = "default_mean_on")]
        mean_on_frames: f64,
        /// Mean silence length in frames
        #[serde(default = "default_mean_off")]
        mean_off_frames: f64,
    },
    /// Keeps `backlog` PDUs queued at all times
    FullBuffer {
        pdu_size: Bits,
        #[serde(default = "default_backlog")]
        backlog: u32,
    },
}

fn default_every() -> u32 {
    1
}

fn default_voice_pdu() -> Bits {
    352
}

fn default_voice_period() -> u32 {
    20
}

fn default_mean_on() -> f64 {
    1000.0
}

fn default_mean_off() -> f64 {
    1350.0
}

fn default_backlog() -> u32 {
    10
}

impl SimulatorConfig {
    /// Load a YAML or TOML scenario
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents =
            std::fs::read_to_string(path).with_context(|| format!("reading scenario {}", path.display()))?;
        let yaml = matches!(path.extension().and_then(|e| e.to_str()), Some("yml" | "yaml"));
        let config: SimulatorConfig = if yaml {
            serde_yaml::from_str(&contents).with_context(|| format!("parsing YAML scenario {}", path.display()))?
        } else {
            toml::from_str(&contents).with_context(|| format!("parsing TOML scenario {}", path.display()))?
        };
        config.validate()?;
        Ok(config)
    }

    /// Consistency checks the individual sections cannot do
    pub fn validate(&self) -> Result<()> {
        if self.scheduler.spot == SchedulerSpot::UlSlave {
            bail!("the simulator drives master schedulers only");
        }
        let f = &self.frame;
        if f.sub_channels == 0 || f.time_slots == 0 || f.spatial_layers == 0 {
            bail!("frame needs at least one subchannel, time slot and layer");
        }
        if f.slot_length <= 0.0 {
            bail!("slot length {} must be positive", f.slot_length);
        }
        let known: BTreeSet<u32> =
            self.registry.stations.iter().flat_map(|s| s.connections.iter().map(|c| c.cid)).collect();
        for source in &self.traffic {
            if !known.contains(&source.cid) {
                bail!("traffic source for unknown connection {}", source.cid);
            }
            match source.source {
                SourceConfig::Cbr { pdu_size, every_frames } if pdu_size == 0 || every_frames == 0 => {
                    bail!("CBR source of cid {} needs a PDU size and interval", source.cid)
                }
                SourceConfig::Voip { period_frames: 0, .. } => {
                    bail!("VoIP source of cid {} needs a period", source.cid)
                }
                SourceConfig::FullBuffer { pdu_size: 0, .. } => {
                    bail!("full buffer source of cid {} needs a PDU size", source.cid)
                }
                _ => {}
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const YAML: &str = r#"
frames: 10
registry:
  stations:
    - user: 1
      connections:
        - cid: 1
    - user: 2
      connections:
        - cid: 2
scheduler:
  strategy:
    name: PersistentVoIP
    persistent_voip:
      number_of_frames: 4
traffic:
  - cid: 1
    type: Voip
    period_frames: 4
  - cid: 2
    type: Cbr
    pdu_size: 800
"#;

    #[test]
    fn test_yaml_scenario() {
        let config: SimulatorConfig = serde_yaml::from_str(YAML).unwrap();
        config.validate().unwrap();
        assert_eq!(config.frames, 10);
        assert_eq!(config.frame.sub_channels, 8);
        assert_eq!(config.scheduler.strategy.persistent_voip.number_of_frames, 4);
        assert!(matches!(config.traffic[0].source, SourceConfig::Voip { pdu_size: 352, period_frames: 4, .. }));
        assert!(matches!(config.traffic[1].source, SourceConfig::Cbr { pdu_size: 800, every_frames: 1 }));
    }

    #[test]
    fn test_toml_scenario() {
        let toml_text = r#"
frames = 5

[frame]
sub_channels = 4

[[registry.stations]]
user = 3
connections = [{ cid = 7 }]

[[traffic]]
cid = 7
type = "FullBuffer"
pdu_size = 1000
"#;
        let config: SimulatorConfig = toml::from_str(toml_text).unwrap();
        config.validate().unwrap();
        assert_eq!(config.frame.sub_channels, 4);
        assert!(matches!(config.traffic[0].source, SourceConfig::FullBuffer { backlog: 10, .. }));
    }

    #[test]
    fn test_unknown_connection_rejected() {
        let mut config: SimulatorConfig = serde_yaml::from_str(YAML).unwrap();
        config.traffic[0].cid = 9;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_uplink_slave_rejected() {
        let mut config: SimulatorConfig = serde_yaml::from_str(YAML).unwrap();
        config.scheduler.spot = SchedulerSpot::UlSlave;
        assert!(config.validate().is_err());
    }
}
