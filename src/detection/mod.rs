//! Rule engine
//!
//! Stateless evaluation of configured rules against one session and a pool
//! of recent sessions. No I/O happens here; the caller supplies the rule set
//! and the pool, and decides what to do with the results.

pub mod params;
pub mod rule_concurrent_streams;
pub mod rule_device_velocity;
pub mod rule_geo_restriction;
pub mod rule_impossible_travel;
pub mod rule_simultaneous_locations;

pub use params::{RuleError, RuleParams};

use serde_json::json;

use crate::models::{Rule, RuleType, Session, Severity, ViolationResult};

/// Evaluator for the five detector kinds
#[derive(Debug, Default, Clone, Copy)]
pub struct RuleEngine;

impl RuleEngine {
    pub fn new() -> Self {
        RuleEngine
    }

    /// Evaluate every applicable rule against `session`
    ///
    /// Rules are independent: each one that fires contributes its own result,
    /// and a rule with invalid parameters is skipped without affecting the rest.
    pub fn evaluate(
        &self,
        session: &Session,
        rules: &[Rule],
        recent_sessions: &[Session],
    ) -> Vec<ViolationResult> {
        rules
            .iter()
            .filter(|rule| rule.applies_to(&session.server_user_id))
            .filter_map(|rule| match self.evaluate_rule(session, rule, recent_sessions) {
                Ok(result) => result,
                Err(e) => {
                    log::warn!("Skipping rule {}: {}", rule.id, e);
                    None
                }
            })
            .collect()
    }

    /// Evaluate a single rule, regardless of its scope
    pub fn evaluate_rule(
        &self,
        session: &Session,
        rule: &Rule,
        recent_sessions: &[Session],
    ) -> Result<Option<ViolationResult>, RuleError> {
        let params = RuleParams::from_rule(rule)?;

        let data = match &params {
            RuleParams::ImpossibleTravel(p) => {
                let pool = account_pool(session, recent_sessions, p.ignore_private_ips);
                rule_impossible_travel::check(session, &pool, p)
            }
            RuleParams::SimultaneousLocations(p) => {
                let pool = account_pool(session, recent_sessions, p.ignore_private_ips);
                rule_simultaneous_locations::check(session, &pool, p)
            }
            RuleParams::DeviceVelocity(p) => {
                let pool = account_pool(session, recent_sessions, p.ignore_private_ips);
                if p.ignore_private_ips && session.has_private_ip() {
                    None
                } else {
                    rule_device_velocity::check(session, &pool, p)
                }
            }
            RuleParams::ConcurrentStreams(p) => {
                let pool = account_pool(session, recent_sessions, p.ignore_private_ips);
                rule_concurrent_streams::check(session, &pool, p)
            }
            RuleParams::GeoRestriction(p) => {
                if p.ignore_private_ips && session.has_private_ip() {
                    None
                } else {
                    rule_geo_restriction::check(session, p)
                }
            }
        };

        Ok(data.map(|data| ViolationResult {
            rule_id: rule.id,
            rule_type: rule.rule_type,
            severity: severity_for(rule.rule_type),
            data,
        }))
    }
}

pub fn severity_for(rule_type: RuleType) -> Severity {
    match rule_type {
        RuleType::ImpossibleTravel | RuleType::GeoRestriction => Severity::High,
        RuleType::SimultaneousLocations | RuleType::DeviceVelocity => Severity::Warning,
        RuleType::ConcurrentStreams => Severity::Low,
    }
}

/// Other sessions of the same account, optionally without private-network ones
fn account_pool<'a>(
    session: &Session,
    recent_sessions: &'a [Session],
    ignore_private_ips: bool,
) -> Vec<&'a Session> {
    recent_sessions
        .iter()
        .filter(|s| s.id != session.id && s.server_user_id == session.server_user_id)
        .filter(|s| !(ignore_private_ips && s.has_private_ip()))
        .collect()
}

pub(crate) fn location_evidence(session: &Session) -> serde_json::Value {
    json!({
        "ipAddress": session.ip_address,
        "city": session.geo.city,
        "country": session.geo.country,
        "lat": session.geo.latitude,
        "lon": session.geo.longitude,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::session::fixtures::{located, session, t0};
    use chrono::Duration;
    use serde_json::json;

    #[test]
    fn test_rules_evaluated_independently() {
        let engine = RuleEngine::new();
        let nyc = located("alice", "k1", 40.7128, -74.0060, t0());
        let london = located("alice", "k2", 51.5074, -0.1278, t0() + Duration::hours(2));

        let rules = vec![
            Rule::new("travel", RuleType::ImpossibleTravel, json!({"maxSpeedKmh": 500})),
            Rule::new("travel strict", RuleType::ImpossibleTravel, json!({"maxSpeedKmh": 100})),
            Rule::new("streams", RuleType::ConcurrentStreams, json!({"maxStreams": 1})),
            Rule::new("geo", RuleType::GeoRestriction, json!({"countries": ["CN"]})),
        ];

        let results = engine.evaluate(&london, &rules, &[nyc.clone(), london.clone()]);
        let types: Vec<RuleType> = results.iter().map(|r| r.rule_type).collect();
        assert_eq!(
            types,
            vec![RuleType::ImpossibleTravel, RuleType::ImpossibleTravel, RuleType::ConcurrentStreams]
        );
        assert_eq!(results[0].severity, Severity::High);
        assert_eq!(results[2].severity, Severity::Low);
        assert_eq!(results[2].data["activeStreamCount"], 2);
    }

    #[test]
    fn test_invalid_rule_is_skipped() {
        let engine = RuleEngine::new();
        let current = session("alice", "k1", "1.1.1.1", t0());
        let other = session("alice", "k2", "2.2.2.2", t0());

        let rules = vec![
            Rule::new("broken", RuleType::ConcurrentStreams, json!({"maxStreams": "lots"})),
            Rule::new("ok", RuleType::ConcurrentStreams, json!({"maxStreams": 1})),
        ];

        let results = engine.evaluate(&current, &rules, &[other]);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].rule_id, rules[1].id);
    }

    #[test]
    fn test_oversized_window_skips_only_that_rule() {
        let engine = RuleEngine::new();
        let current = session("alice", "k1", "1.1.1.1", t0());
        let other = session("alice", "k2", "2.2.2.2", t0());

        let rules = vec![
            Rule::new("velocity", RuleType::DeviceVelocity, json!({"windowHours": 1e10})),
            Rule::new("streams", RuleType::ConcurrentStreams, json!({"maxStreams": 1})),
        ];

        let results = engine.evaluate(&current, &rules, &[other]);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].rule_type, RuleType::ConcurrentStreams);
    }

    #[test]
    fn test_scope_and_active_filter() {
        let engine = RuleEngine::new();
        let current = session("alice", "k1", "1.1.1.1", t0());
        let other = session("alice", "k2", "2.2.2.2", t0());

        let mut inactive = Rule::new("off", RuleType::ConcurrentStreams, json!({"maxStreams": 1}));
        inactive.is_active = false;
        let rules = vec![
            inactive,
            Rule::new("bob only", RuleType::ConcurrentStreams, json!({"maxStreams": 1})).scoped_to("bob"),
            Rule::new("alice only", RuleType::ConcurrentStreams, json!({"maxStreams": 1})).scoped_to("alice"),
        ];

        let results = engine.evaluate(&current, &rules, &[other]);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].rule_id, rules[2].id);
    }

    #[test]
    fn test_pool_excludes_self_and_other_accounts() {
        let engine = RuleEngine::new();
        let current = session("alice", "k1", "1.1.1.1", t0());
        let bob = session("bob", "k2", "2.2.2.2", t0());
        let rule = Rule::new("streams", RuleType::ConcurrentStreams, json!({"maxStreams": 1}));

        // The current session appearing in the pool does not count twice
        let results = engine.evaluate(&current, &[rule], &[current.clone(), bob]);
        assert!(results.is_empty());
    }

    #[test]
    fn test_null_coordinates_never_trigger_distance_rules() {
        let engine = RuleEngine::new();
        let a = session("alice", "k1", "8.8.8.8", t0());
        let b = session("alice", "k2", "9.9.9.9", t0());
        let rules = vec![
            Rule::new("travel", RuleType::ImpossibleTravel, json!({"maxSpeedKmh": 1})),
            Rule::new("simul", RuleType::SimultaneousLocations, json!({"minDistanceKm": 0})),
        ];

        assert!(engine.evaluate(&b, &rules, &[a]).is_empty());
    }

    #[test]
    fn test_ignore_private_ips() {
        let engine = RuleEngine::new();
        let current = session("alice", "k1", "8.8.8.8", t0());
        let lan = session("alice", "k2", "192.168.1.10", t0());

        let counted = Rule::new("streams", RuleType::ConcurrentStreams, json!({"maxStreams": 1}));
        let ignoring = Rule::new(
            "streams lan ok",
            RuleType::ConcurrentStreams,
            json!({"maxStreams": 1, "ignorePrivateIps": true}),
        );

        assert_eq!(engine.evaluate(&current, &[counted], &[lan.clone()]).len(), 1);
        assert!(engine.evaluate(&current, &[ignoring], &[lan]).is_empty());
    }
}
