//! Typed parameter bags for each detector
//!
//! Rules carry their parameters as free-form JSON. They are parsed and
//! checked here at evaluation time; a rule whose parameters do not validate
//! is skipped for that pass.

use regex::Regex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use thiserror::Error;

use crate::models::{Rule, RuleType};

/// Longest trailing window a device velocity rule may look back over
pub const MAX_WINDOW_HOURS: f64 = 24.0 * 366.0;

#[derive(Error, Debug)]
pub enum RuleError {
    #[error("Invalid parameters for {rule_type} rule '{name}': {message}")]
    InvalidParams {
        rule_type: RuleType,
        name: String,
        message: String,
    },
}

impl RuleError {
    fn invalid(rule: &Rule, message: impl Into<String>) -> Self {
        RuleError::InvalidParams {
            rule_type: rule.rule_type,
            name: rule.name.clone(),
            message: message.into(),
        }
    }
}

fn parse<T: DeserializeOwned + Default>(rule: &Rule) -> Result<T, RuleError> {
    if rule.params.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(rule.params.clone()).map_err(|e| RuleError::invalid(rule, e.to_string()))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ImpossibleTravelParams {
    pub max_speed_kmh: f64,
    pub ignore_private_ips: bool,
}

impl Default for ImpossibleTravelParams {
    fn default() -> Self {
        ImpossibleTravelParams {
            max_speed_kmh: 500.0,
            ignore_private_ips: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SimultaneousLocationsParams {
    pub min_distance_km: f64,
    pub ignore_private_ips: bool,
}

impl Default for SimultaneousLocationsParams {
    fn default() -> Self {
        SimultaneousLocationsParams {
            min_distance_km: 100.0,
            ignore_private_ips: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeviceVelocityParams {
    pub max_ips: usize,
    pub window_hours: f64,
    /// Count distinct device identifiers instead of addresses
    pub group_by_device: bool,
    pub ignore_private_ips: bool,
}

impl Default for DeviceVelocityParams {
    fn default() -> Self {
        DeviceVelocityParams {
            max_ips: 5,
            window_hours: 24.0,
            group_by_device: false,
            ignore_private_ips: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConcurrentStreamsParams {
    pub max_streams: usize,
    pub ignore_private_ips: bool,
}

impl Default for ConcurrentStreamsParams {
    fn default() -> Self {
        ConcurrentStreamsParams {
            max_streams: 3,
            ignore_private_ips: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GeoMode {
    #[default]
    Blocklist,
    Allowlist,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GeoRestrictionParams {
    pub mode: GeoMode,
    /// ISO 3166-1 alpha-2 codes, matched case-sensitively
    pub countries: Vec<String>,
    pub ignore_private_ips: bool,
}

/// Parameters for one rule, typed by its kind
#[derive(Debug, Clone, PartialEq)]
pub enum RuleParams {
    ImpossibleTravel(ImpossibleTravelParams),
    SimultaneousLocations(SimultaneousLocationsParams),
    DeviceVelocity(DeviceVelocityParams),
    ConcurrentStreams(ConcurrentStreamsParams),
    GeoRestriction(GeoRestrictionParams),
}

fn country_code_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Z]{2}$").expect("valid country code pattern"))
}

impl RuleParams {
    /// Parse and validate the parameter bag of a rule
    pub fn from_rule(rule: &Rule) -> Result<Self, RuleError> {
        let params = match rule.rule_type {
            RuleType::ImpossibleTravel => {
                let p: ImpossibleTravelParams = parse(rule)?;
                if !(p.max_speed_kmh.is_finite() && p.max_speed_kmh > 0.0) {
                    return Err(RuleError::invalid(rule, "maxSpeedKmh must be a positive number"));
                }
                RuleParams::ImpossibleTravel(p)
            }
            RuleType::SimultaneousLocations => {
                let p: SimultaneousLocationsParams = parse(rule)?;
                if !(p.min_distance_km.is_finite() && p.min_distance_km >= 0.0) {
                    return Err(RuleError::invalid(rule, "minDistanceKm must not be negative"));
                }
                RuleParams::SimultaneousLocations(p)
            }
            RuleType::DeviceVelocity => {
                let p: DeviceVelocityParams = parse(rule)?;
                if !(p.window_hours.is_finite() && p.window_hours > 0.0) {
                    return Err(RuleError::invalid(rule, "windowHours must be a positive number"));
                }
                if p.window_hours > MAX_WINDOW_HOURS {
                    return Err(RuleError::invalid(
                        rule,
                        format!("windowHours must not exceed {}", MAX_WINDOW_HOURS),
                    ));
                }
                RuleParams::DeviceVelocity(p)
            }
            RuleType::ConcurrentStreams => {
                let p: ConcurrentStreamsParams = parse(rule)?;
                if p.max_streams == 0 {
                    return Err(RuleError::invalid(rule, "maxStreams must be at least 1"));
                }
                RuleParams::ConcurrentStreams(p)
            }
            RuleType::GeoRestriction => {
                let p: GeoRestrictionParams = parse(rule)?;
                if let Some(bad) = p.countries.iter().find(|c| !country_code_pattern().is_match(c)) {
                    return Err(RuleError::invalid(
                        rule,
                        format!("'{}' is not an ISO 3166-1 alpha-2 country code", bad),
                    ));
                }
                RuleParams::GeoRestriction(p)
            }
        };
        Ok(params)
    }
}
