//! Common Utilities
//!
//! dB conversions and simulation-time helpers shared by the scheduler crates

use tracing::trace;

/// Simulation time in seconds
pub type SimTime = f64;

/// Convert a dB value into a linear factor
pub fn db_to_linear(db: f64) -> f64 {
    10f64.powf(db / 10.0)
}

/// Convert a linear factor into dB
pub fn linear_to_db(linear: f64) -> f64 {
    10.0 * linear.log10()
}

/// Round `duration` up to the next multiple of `granularity`
///
/// Values within `tolerance` of a multiple are snapped to that multiple.
pub fn round_up_to_granularity(duration: SimTime, granularity: SimTime, tolerance: SimTime) -> SimTime {
    if granularity <= 0.0 {
        return duration;
    }
    let units = duration / granularity;
    let nearest = units.round();
    let rounded = if (units - nearest).abs() * granularity <= tolerance {
        nearest * granularity
    } else {
        units.ceil() * granularity
    };
    trace!("Rounded {} to {} (granularity {})", duration, rounded, granularity);
    rounded
}

/// Time helpers for log output
pub mod time {
    use super::SimTime;

    /// Convert seconds to microseconds for log output
    pub fn as_micros(t: SimTime) -> f64 {
        t * 1e6
    }
}
