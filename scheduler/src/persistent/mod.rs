//! Persistent reservations for VoIP traffic
//!
//! A [`ResourceGrid`] spans one period of frames. Connections that talk in
//! consecutive periods get a reservation repeated every period, sized by
//! [`LinkAdaptation`] and placed by a [`TbChoser`]. The [`StateTracker`]
//! decides which connections are persistent, silent or new.

pub mod grid;
pub mod link_adaptation;
pub mod state_tracker;
pub mod tb_choser;

pub use grid::{Frame, ResourceGrid, SearchResult, TransmissionBlock};
pub use link_adaptation::{CanFitResult, LinkAdaptation, LinkAdaptationMode, LinkAdaptor};
pub use state_tracker::{ClassifiedConnections, StateTracker};
pub use tb_choser::{TbChoser, TbChoserKind};

use crate::types::Bits;
use crate::SchedulerError;
use serde::{Deserialize, Serialize};

fn default_number_of_frames() -> usize {
    20
}

fn default_voice_pdu_size() -> Bits {
    // AMR 12.2 frame plus headers
    352
}

fn default_link_adaptation() -> LinkAdaptationMode {
    LinkAdaptationMode::AtStart
}

fn default_tb_choser() -> TbChoserKind {
    TbChoserKind::First
}

/// Persistent VoIP scheduler settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistentVoipConfig {
    /// Frames per period
    #[serde(default = "default_number_of_frames")]
    pub number_of_frames: usize,
    /// Upper bound for the PDU size a persistent reservation is sized for
    #[serde(default = "default_voice_pdu_size")]
    pub voice_pdu_size: Bits,
    #[serde(default = "default_link_adaptation")]
    pub link_adaptation: LinkAdaptationMode,
    #[serde(default = "default_tb_choser")]
    pub tb_choser: TbChoserKind,
    /// Break TB choser ties randomly
    #[serde(default)]
    pub return_random: bool,
    #[serde(default)]
    pub seed: u64,
}

impl Default for PersistentVoipConfig {
    fn default() -> Self {
        Self {
            number_of_frames: default_number_of_frames(),
            voice_pdu_size: default_voice_pdu_size(),
            link_adaptation: default_link_adaptation(),
            tb_choser: default_tb_choser(),
            return_random: false,
            seed: 0,
        }
    }
}

impl PersistentVoipConfig {
    pub fn validate(&self) -> Result<(), SchedulerError> {
        if self.number_of_frames == 0 {
            return Err(SchedulerError::InvalidConfiguration("need more than zero frames".into()));
        }
        if self.voice_pdu_size == 0 {
            return Err(SchedulerError::InvalidConfiguration("voice PDU size must be positive".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config: PersistentVoipConfig = serde_yaml::from_str("number_of_frames: 4").unwrap();
        assert_eq!(config.number_of_frames, 4);
        assert_eq!(config.voice_pdu_size, 352);
        assert_eq!(config.tb_choser, TbChoserKind::First);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_frames_invalid() {
        let config = PersistentVoipConfig { number_of_frames: 0, ..Default::default() };
        assert!(matches!(config.validate(), Err(SchedulerError::InvalidConfiguration(_))));
    }

    #[test]
    fn test_unknown_choser_rejected() {
        let parsed: Result<PersistentVoipConfig, _> = serde_yaml::from_str("tb_choser: Largest");
        assert!(parsed.is_err());
    }
}
