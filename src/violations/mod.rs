//! Violation dedup and trust score updates

use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::config::TrustConfig;
use crate::events::EventBus;
use crate::models::{CoreEvent, Session, Violation, ViolationResult};
use crate::persistence::{PersistenceError, SessionStore};

/// Persists detector results, at most one open violation per
/// (account, session, rule type)
pub struct ViolationRecorder {
    store: Arc<dyn SessionStore>,
    events: EventBus,
    trust: TrustConfig,
}

impl ViolationRecorder {
    pub fn new(store: Arc<dyn SessionStore>, events: EventBus, trust: TrustConfig) -> Self {
        ViolationRecorder {
            store,
            events,
            trust,
        }
    }

    /// Record a detector result for `session`
    ///
    /// Returns `None` when an open violation of the same kind already exists
    /// for this session, including when a concurrent writer got there first.
    pub fn record(
        &self,
        session: &Session,
        result: ViolationResult,
        now: DateTime<Utc>,
    ) -> Result<Option<Violation>, PersistenceError> {
        if self.store.has_unacknowledged_violation(
            &session.server_user_id,
            session.id,
            result.rule_type,
        )? {
            log::debug!(
                "Suppressed duplicate {} violation for {} on session {}",
                result.rule_type,
                session.server_user_id,
                session.id
            );
            return Ok(None);
        }

        let violation = Violation::from_result(result, &session.server_user_id, session.id, now);
        if !self.store.insert_violation(&violation)? {
            log::debug!(
                "Lost insert race for {} violation on session {}",
                violation.rule_type,
                session.id
            );
            return Ok(None);
        }

        let penalty = self.trust.penalty(violation.severity);
        let score = self
            .store
            .adjust_trust_score(&violation.server_user_id, -penalty)?;

        if let Some((identity, linked)) = self.store.identity_for_account(&violation.server_user_id)? {
            let share = identity_share(penalty, linked);
            let identity_score = self.store.adjust_identity_score(&identity, -share)?;
            log::debug!("Identity {} score now {}", identity, identity_score);
        }

        log::warn!(
            "Violation {} ({}) for {}: trust score now {}",
            violation.rule_type,
            violation.severity,
            violation.server_user_id,
            score
        );
        self.events.publish(CoreEvent::ViolationCreated(violation.clone()));
        Ok(Some(violation))
    }

    /// Record every result, isolating failures per result
    pub fn record_all(
        &self,
        session: &Session,
        results: Vec<ViolationResult>,
        now: DateTime<Utc>,
    ) -> Vec<Violation> {
        results
            .into_iter()
            .filter_map(|result| {
                let rule_type = result.rule_type;
                match self.record(session, result, now) {
                    Ok(violation) => violation,
                    Err(e) => {
                        log::error!(
                            "Failed to record {} violation for session {}: {}",
                            rule_type,
                            session.id,
                            e
                        );
                        None
                    }
                }
            })
            .collect()
    }
}

/// Part of a penalty charged to an identity shared by `linked` accounts
pub fn identity_share(penalty: i64, linked: usize) -> i64 {
    (penalty as f64 / linked.max(1) as f64).round() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::session::fixtures::{session, t0};
    use crate::models::{RuleType, Severity};
    use crate::persistence::SqliteStore;
    use serde_json::json;
    use uuid::Uuid;

    fn recorder() -> (Arc<SqliteStore>, EventBus, ViolationRecorder) {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let events = EventBus::new(16);
        let recorder = ViolationRecorder::new(store.clone(), events.clone(), TrustConfig::default());
        (store, events, recorder)
    }

    fn result(rule_type: RuleType, severity: Severity) -> ViolationResult {
        ViolationResult {
            rule_id: Uuid::new_v4(),
            rule_type,
            severity,
            data: json!({"activeStreamCount": 4}),
        }
    }

    #[test]
    fn test_records_and_penalizes() {
        let (store, events, recorder) = recorder();
        let mut rx = events.subscribe();
        let s = session("alice", "k1", "1.1.1.1", t0());

        let violation = recorder
            .record(&s, result(RuleType::ImpossibleTravel, Severity::High), t0())
            .unwrap()
            .expect("first violation is stored");

        assert_eq!(violation.session_id, s.id);
        assert_eq!(violation.server_user_id, "alice");
        assert_eq!(store.get_trust_score("alice").unwrap(), 80);
        assert_eq!(rx.try_recv().unwrap().name(), "violation_created");
    }

    #[test]
    fn test_duplicate_is_suppressed() {
        let (store, _events, recorder) = recorder();
        let s = session("alice", "k1", "1.1.1.1", t0());

        let first = recorder
            .record(&s, result(RuleType::ConcurrentStreams, Severity::Low), t0())
            .unwrap();
        let second = recorder
            .record(&s, result(RuleType::ConcurrentStreams, Severity::Low), t0())
            .unwrap();

        assert!(first.is_some());
        assert!(second.is_none());
        assert_eq!(store.get_recent_violations(10).unwrap().len(), 1);
        assert_eq!(store.get_trust_score("alice").unwrap(), 95);
    }

    #[test]
    fn test_acknowledged_violation_allows_new_one() {
        let (store, _events, recorder) = recorder();
        let s = session("alice", "k1", "1.1.1.1", t0());

        let first = recorder
            .record(&s, result(RuleType::ConcurrentStreams, Severity::Low), t0())
            .unwrap()
            .unwrap();
        assert!(store.acknowledge_violation(first.id, t0()).unwrap());

        let again = recorder
            .record(&s, result(RuleType::ConcurrentStreams, Severity::Low), t0())
            .unwrap();
        assert!(again.is_some());
        assert_eq!(store.get_trust_score("alice").unwrap(), 90);
    }

    #[test]
    fn test_different_rule_types_are_independent() {
        let (_store, _events, recorder) = recorder();
        let s = session("alice", "k1", "1.1.1.1", t0());

        let stored = recorder.record_all(
            &s,
            vec![
                result(RuleType::ConcurrentStreams, Severity::Low),
                result(RuleType::DeviceVelocity, Severity::Warning),
                result(RuleType::ConcurrentStreams, Severity::Low),
            ],
            t0(),
        );
        assert_eq!(stored.len(), 2);
    }

    #[test]
    fn test_identity_share_of_penalty() {
        let (store, _events, recorder) = recorder();
        store.link_account_identity("plex:alice", "person-1").unwrap();
        store.link_account_identity("jf:alice", "person-1").unwrap();
        store.link_account_identity("emby:alice", "person-1").unwrap();
        let s = session("plex:alice", "k1", "1.1.1.1", t0());

        recorder
            .record(&s, result(RuleType::ImpossibleTravel, Severity::High), t0())
            .unwrap();

        assert_eq!(store.get_trust_score("plex:alice").unwrap(), 80);
        assert_eq!(store.get_trust_score("jf:alice").unwrap(), 100);
        // round(20 / 3) = 7
        assert_eq!(store.get_identity_score("person-1").unwrap(), 93);
    }

    #[test]
    fn test_score_floors_at_zero() {
        let (store, _events, recorder) = recorder();
        for i in 0..8 {
            let s = session("alice", &format!("k{}", i), "1.1.1.1", t0());
            recorder
                .record(&s, result(RuleType::GeoRestriction, Severity::High), t0())
                .unwrap();
        }
        assert_eq!(store.get_trust_score("alice").unwrap(), 0);
    }

    #[test]
    fn test_identity_share() {
        assert_eq!(identity_share(20, 1), 20);
        assert_eq!(identity_share(20, 3), 7);
        assert_eq!(identity_share(5, 2), 3);
        assert_eq!(identity_share(10, 0), 10);
    }
}
