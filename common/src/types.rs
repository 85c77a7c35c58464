//! Common Types for the Radio Resource Scheduler
//!
//! Defines identifiers and the dB value types used throughout the scheduler

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, AddAssign, Div, Mul, Sub, SubAssign};
use std::str::FromStr;
use thiserror::Error;

/// Identifier of a station (user terminal, relay or base station)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UserId(pub u32);

impl UserId {
    /// Create a new user identifier
    pub fn new(value: u32) -> Self {
        Self(value)
    }

    /// Get the raw value
    pub fn value(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UT{}", self.0)
    }
}

/// Identifier of one logical connection (CID)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ConnectionId(pub u32);

impl ConnectionId {
    /// Create a new connection identifier
    pub fn new(value: u32) -> Self {
        Self(value)
    }

    /// Get the raw value
    pub fn value(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cid{}", self.0)
    }
}

/// Errors when parsing a value with a unit suffix
#[derive(Error, Debug, Clone, PartialEq)]
pub enum UnitParseError {
    #[error("Missing unit in '{0}', expected one of {1}")]
    MissingUnit(String, &'static str),

    #[error("Invalid number in '{0}'")]
    InvalidNumber(String),
}

/// Split "12.5 dBm" into (12.5, "dBm")
fn split_unit(input: &str) -> Result<(f64, &str), UnitParseError> {
    let trimmed = input.trim();
    let number = trimmed.trim_end_matches(|c: char| c.is_ascii_alphabetic());
    let unit = &trimmed[number.len()..];
    let value = number
        .trim()
        .parse::<f64>()
        .map_err(|_| UnitParseError::InvalidNumber(input.to_string()))?;
    Ok((value, unit.trim()))
}

/// Transmit or received power
///
/// Stored linearly in milliwatt; dB arithmetic goes through the accessors.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Power {
    mw: f64,
}

impl Power {
    /// Create from milliwatt
    pub fn from_mw(mw: f64) -> Self {
        Self { mw: mw.max(0.0) }
    }

    /// Create from dBm
    pub fn from_dbm(dbm: f64) -> Self {
        Self { mw: crate::utils::db_to_linear(dbm) }
    }

    /// Create from watt
    pub fn from_watt(watt: f64) -> Self {
        Self::from_mw(watt * 1000.0)
    }

    /// Zero power
    pub fn zero() -> Self {
        Self { mw: 0.0 }
    }

    /// Value in milliwatt
    pub fn mw(&self) -> f64 {
        self.mw
    }

    /// Value in dBm
    pub fn dbm(&self) -> f64 {
        crate::utils::linear_to_db(self.mw)
    }

    /// Value in watt
    pub fn watt(&self) -> f64 {
        self.mw / 1000.0
    }

    /// True if no power is left
    pub fn is_zero(&self) -> bool {
        self.mw <= 0.0
    }

    /// Larger of two powers
    pub fn max(self, other: Self) -> Self {
        if other.mw > self.mw { other } else { self }
    }

    /// Smaller of two powers
    pub fn min(self, other: Self) -> Self {
        if other.mw < self.mw { other } else { self }
    }
}

impl Add for Power {
    type Output = Power;

    fn add(self, rhs: Power) -> Power {
        Power::from_mw(self.mw + rhs.mw)
    }
}

impl AddAssign for Power {
    fn add_assign(&mut self, rhs: Power) {
        self.mw += rhs.mw;
    }
}

/// Subtraction saturates at zero
impl Sub for Power {
    type Output = Power;

    fn sub(self, rhs: Power) -> Power {
        Power::from_mw(self.mw - rhs.mw)
    }
}

impl SubAssign for Power {
    fn sub_assign(&mut self, rhs: Power) {
        self.mw = (self.mw - rhs.mw).max(0.0);
    }
}

/// Power divided by power is a ratio (C/I)
impl Div for Power {
    type Output = Ratio;

    fn div(self, rhs: Power) -> Ratio {
        Ratio::from_factor(self.mw / rhs.mw)
    }
}

/// Power scaled by a ratio (e.g. gain or pathloss compensation)
impl Mul<Ratio> for Power {
    type Output = Power;

    fn mul(self, rhs: Ratio) -> Power {
        Power::from_mw(self.mw * rhs.factor())
    }
}

/// Power attenuated by a ratio
impl Div<Ratio> for Power {
    type Output = Power;

    fn div(self, rhs: Ratio) -> Power {
        Power::from_mw(self.mw / rhs.factor())
    }
}

impl Mul<f64> for Power {
    type Output = Power;

    fn mul(self, rhs: f64) -> Power {
        Power::from_mw(self.mw * rhs)
    }
}

impl fmt::Display for Power {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2} dBm", self.dbm())
    }
}

impl FromStr for Power {
    type Err = UnitParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (value, unit) = split_unit(s)?;
        match unit {
            "dBm" => Ok(Power::from_dbm(value)),
            "mW" => Ok(Power::from_mw(value)),
            "W" => Ok(Power::from_watt(value)),
            _ => Err(UnitParseError::MissingUnit(s.to_string(), "dBm, mW, W")),
        }
    }
}

impl TryFrom<String> for Power {
    type Error = UnitParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Power> for String {
    fn from(value: Power) -> String {
        format!("{} dBm", value.dbm())
    }
}

/// Dimensionless ratio such as SINR, pathloss or gain
///
/// Stored as a linear factor.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Ratio {
    factor: f64,
}

impl Default for Ratio {
    fn default() -> Self {
        Self::from_factor(1.0)
    }
}

impl Ratio {
    /// Create from dB
    pub fn from_db(db: f64) -> Self {
        Self { factor: crate::utils::db_to_linear(db) }
    }

    /// Create from a linear factor
    pub fn from_factor(factor: f64) -> Self {
        Self { factor }
    }

    /// Value in dB
    pub fn db(&self) -> f64 {
        crate::utils::linear_to_db(self.factor)
    }

    /// Linear factor
    pub fn factor(&self) -> f64 {
        self.factor
    }
}

/// Adding ratios adds their dB values
impl Add for Ratio {
    type Output = Ratio;

    fn add(self, rhs: Ratio) -> Ratio {
        Ratio::from_factor(self.factor * rhs.factor)
    }
}

/// Subtracting ratios subtracts their dB values
impl Sub for Ratio {
    type Output = Ratio;

    fn sub(self, rhs: Ratio) -> Ratio {
        Ratio::from_factor(self.factor / rhs.factor)
    }
}

impl fmt::Display for Ratio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2} dB", self.db())
    }
}

impl FromStr for Ratio {
    type Err = UnitParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (value, unit) = split_unit(s)?;
        match unit {
            "dB" => Ok(Ratio::from_db(value)),
            "" => Ok(Ratio::from_factor(value)),
            _ => Err(UnitParseError::MissingUnit(s.to_string(), "dB or none")),
        }
    }
}

impl TryFrom<String> for Ratio {
    type Error = UnitParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Ratio> for String {
    fn from(value: Ratio) -> String {
        format!("{} dB", value.db())
    }
}

/// Carrier and interference estimate for one link
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct CandI {
    /// Carrier (received signal) power
    pub c: Power,
    /// Interference plus noise power
    pub i: Power,
    /// Pathloss, if known
    #[serde(default)]
    pub pathloss: Ratio,
}

impl CandI {
    /// Create a new estimate
    pub fn new(c: Power, i: Power) -> Self {
        Self { c, i, pathloss: Ratio::default() }
    }

    /// Signal to interference plus noise ratio
    pub fn sinr(&self) -> Ratio {
        self.c / self.i
    }
}

/// Power limits of one station
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PowerCapabilities {
    /// Maximum transmit power on one subchannel
    pub max_per_subband: Power,
    /// Nominal transmit power on one subchannel
    pub nominal_per_subband: Power,
    /// Maximum total transmit power over all subchannels
    pub max_overall: Power,
}

impl PowerCapabilities {
    /// Create new power capabilities
    pub fn new(max_per_subband: Power, nominal_per_subband: Power, max_overall: Power) -> Self {
        Self { max_per_subband, nominal_per_subband, max_overall }
    }
}

/// Channel quality of one user on one subchannel
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChannelQualityOnOneSubChannel {
    /// Pathloss towards the peer
    pub pathloss: Ratio,
    /// Interference plus noise
    pub interference: Power,
    /// Index of the subchannel in the scheduling map
    pub sub_channel: usize,
}

impl ChannelQualityOnOneSubChannel {
    /// Create a new channel quality record
    pub fn new(pathloss: Ratio, interference: Power, sub_channel: usize) -> Self {
        Self { pathloss, interference, sub_channel }
    }

    /// SINR achieved when transmitting with `tx_power`
    pub fn sinr_for(&self, tx_power: Power) -> Ratio {
        (tx_power / self.pathloss) / self.interference
    }

    /// Channel quality as carrier-to-interference, pathloss included
    pub fn gain_over_interference(&self) -> f64 {
        1.0 / (self.pathloss.factor() * self.interference.mw())
    }
}

/// Channel qualities of one user on all subchannels, indexed by subchannel
pub type ChannelQualitiesOnAllSubChannels = Vec<ChannelQualityOnOneSubChannel>;

/// Transmission direction handled by a scheduler instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Base station to user terminals
    Downlink,
    /// User terminals to base station
    Uplink,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_power_conversions() {
        let p = Power::from_dbm(30.0);
        assert!((p.mw() - 1000.0).abs() < 1e-9);
        assert!((p.watt() - 1.0).abs() < 1e-12);
        assert!((Power::from_mw(1.0).dbm()).abs() < 1e-12);
    }

    #[test]
    fn test_power_subtraction_saturates() {
        let p = Power::from_mw(1.0) - Power::from_mw(2.0);
        assert!(p.is_zero());
    }

    #[test]
    fn test_power_over_power_is_ratio() {
        let c = Power::from_dbm(-70.0);
        let i = Power::from_dbm(-90.0);
        assert!(((c / i).db() - 20.0).abs() < 1e-9);
    }

    #[test]
    fn test_ratio_db_addition() {
        let r = Ratio::from_db(3.0) + Ratio::from_db(7.0);
        assert!((r.db() - 10.0).abs() < 1e-9);
        let r = Ratio::from_db(10.0) - Ratio::from_db(4.0);
        assert!((r.db() - 6.0).abs() < 1e-9);
    }

    #[test]
    fn test_parse_units() {
        let p: Power = "20 dBm".parse().unwrap();
        assert!((p.mw() - 100.0).abs() < 1e-9);
        let p: Power = "0.5W".parse().unwrap();
        assert!((p.mw() - 500.0).abs() < 1e-9);
        let p: Power = "1e-3 mW".parse().unwrap();
        assert!((p.mw() - 1e-3).abs() < 1e-15);
        let r: Ratio = "-3 dB".parse().unwrap();
        assert!((r.db() + 3.0).abs() < 1e-12);
        assert!(matches!("12 parsecs".parse::<Power>(), Err(UnitParseError::MissingUnit(_, _))));
        assert!(matches!("x dBm".parse::<Power>(), Err(UnitParseError::InvalidNumber(_))));
    }

    #[test]
    fn test_channel_quality_sinr() {
        let cq = ChannelQualityOnOneSubChannel::new(
            Ratio::from_db(100.0),
            Power::from_dbm(-100.0),
            0,
        );
        let sinr = cq.sinr_for(Power::from_dbm(10.0));
        assert!((sinr.db() - 10.0).abs() < 1e-9);
    }
}
