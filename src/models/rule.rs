use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// The closed set of detector kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleType {
    ImpossibleTravel,
    SimultaneousLocations,
    DeviceVelocity,
    ConcurrentStreams,
    GeoRestriction,
}

impl RuleType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleType::ImpossibleTravel => "impossible_travel",
            RuleType::SimultaneousLocations => "simultaneous_locations",
            RuleType::DeviceVelocity => "device_velocity",
            RuleType::ConcurrentStreams => "concurrent_streams",
            RuleType::GeoRestriction => "geo_restriction",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "impossible_travel" => Some(RuleType::ImpossibleTravel),
            "simultaneous_locations" => Some(RuleType::SimultaneousLocations),
            "device_velocity" => Some(RuleType::DeviceVelocity),
            "concurrent_streams" => Some(RuleType::ConcurrentStreams),
            "geo_restriction" => Some(RuleType::GeoRestriction),
            _ => None,
        }
    }
}

impl fmt::Display for RuleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A configured detector instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    pub id: Uuid,
    pub name: String,
    #[serde(rename = "type")]
    pub rule_type: RuleType,
    /// Detector parameters, typed per kind at evaluation time
    #[serde(default)]
    pub params: serde_json::Value,
    /// `None` applies to every account
    #[serde(default)]
    pub server_user_id: Option<String>,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

fn default_active() -> bool {
    true
}

impl Rule {
    pub fn new(name: impl Into<String>, rule_type: RuleType, params: serde_json::Value) -> Self {
        Rule {
            id: Uuid::new_v4(),
            name: name.into(),
            rule_type,
            params,
            server_user_id: None,
            is_active: true,
        }
    }

    pub fn scoped_to(mut self, server_user_id: impl Into<String>) -> Self {
        self.server_user_id = Some(server_user_id.into());
        self
    }

    /// Whether this rule should run against sessions of the given account
    pub fn applies_to(&self, server_user_id: &str) -> bool {
        self.is_active
            && self
                .server_user_id
                .as_deref()
                .map_or(true, |scope| scope == server_user_id)
    }
}
