//! Radio Resource Scheduler Library
//!
//! This crate implements per-frame radio resource scheduling for a discrete-event
//! network simulator: the resource map, per-connection queues, spatial grouping,
//! dynamic subchannel assignment, power control, the scheduling strategies and the
//! persistent VoIP reservation grid.

pub mod apc;
pub mod arq;
pub mod compound;
pub mod config;
pub mod dsa;
pub mod grouper;
pub mod harq;
pub mod interfaces;
pub mod map;
pub mod persistent;
pub mod phy_mode;
pub mod probe;
pub mod queue;
pub mod registry;
pub mod strategy;
pub mod types;

use thiserror::Error;

pub use compound::{Compound, CompoundFactory, CompoundPtr};
pub use map::SchedulingMap;
pub use phy_mode::PhyMode;
pub use types::*;

/// Tolerance used for every slot-fit comparison
///
/// Placements ending within this margin after the slot end still count as fitting.
pub const SLOT_LENGTH_ROUNDING_TOLERANCE: f64 = 1e-12;

/// Configuration errors raised while building scheduler components
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SchedulerError {
    #[error("Unknown configuration value: {0}")]
    UnknownConfigurationValue(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
}
